//! # gpusync
//!
//! The resource synchronization core between a host-side GPU binding and an execution
//! engine: buffer mapping, command submission, completion tracking and error scopes.
//!
//! The crate owns the state that decides *when* the host may touch GPU memory. Actual
//! execution is delegated to an [`ExecutionEngine`](engine::ExecutionEngine);
//! [`SoftwareEngine`](engine::SoftwareEngine) runs everything in host memory.
//!
//! ## Quick Start
//!
//! ```
//! use gpusync::prelude::*;
//!
//! let device = Device::builder(SoftwareEngine::new()).build();
//! let buffer = device
//!     .create_buffer(&BufferDescriptor {
//!         label: Some("readback"),
//!         size: 256,
//!         usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
//!         mapped_at_creation: false,
//!     })
//!     .unwrap();
//! device.queue().write_buffer(&buffer, 0, &[1; 256]).unwrap();
//! assert_eq!(buffer.map_read_blocking().unwrap(), vec![1; 256]);
//! ```
//!
//! ## Overview
//!
//! ### Buffers and mapping
//!
//! A [`Buffer`](buffer::Buffer) moves between `Unmapped`, `Pending` and `Mapped`.
//! [`map_async`](buffer::Buffer::map_async) returns a
//! [`CompletionFuture`](sync::CompletionFuture) that resolves once GPU work using the
//! buffer has retired; [`get_mapped_range`](buffer::Buffer::get_mapped_range) then hands
//! out non-overlapping [`BufferView`](buffer::BufferView)s, all of which are invalidated
//! by [`unmap`](buffer::Buffer::unmap).
//!
//! ### Command recording and submission
//!
//! Commands are recorded into a [`CommandRecorder`](command::CommandRecorder), sealed into
//! a [`CommandList`](command::CommandList) and submitted through the [`Queue`]. Each
//! submission gets a [`SubmissionIndex`](queue::SubmissionIndex); submissions retire in
//! FIFO order.
//!
//! ### Completion
//!
//! Nothing resolves on its own: [`Device::poll`] retires finished submissions and
//! resolves map requests and [`on_submitted_work_done`](Queue::on_submitted_work_done)
//! futures. Futures can be awaited on any executor or inspected with
//! [`try_take`](sync::CompletionFuture::try_take).
//!
//! ### Errors
//!
//! Validation and out-of-memory errors are returned to the caller *and* offered to the
//! device's [error scopes](error_scope). An error no scope captures goes to the
//! uncaptured-error handler and then loses the device, unless the device was built
//! with [`lose_device_on_uncaptured_error(false)`](DeviceBuilder::lose_device_on_uncaptured_error).
//! Device loss is permanent and fails every later operation.

pub mod buffer;
pub mod command;
pub mod device;
pub mod engine;
pub mod error;
pub mod error_scope;
pub mod queue;
pub mod sync;
pub mod tracking;
pub mod utils;

pub use device::{Device, DeviceBuilder, HasDevice, Limits};
pub use error::{Error, ErrorKind, Result};
pub use queue::Queue;

pub mod prelude {
    pub use crate::{
        Device, Error, ErrorKind, HasDevice, Limits,
        buffer::{Buffer, BufferDescriptor, BufferUsages, BufferView, MapMode, MapStateKind},
        command::{BufferBinding, CommandList, CommandRecorder, RenderBindings},
        engine::{ExecutionEngine, SoftwareEngine},
        error_scope::ErrorFilter,
        queue::{Maintain, PollStatus, Queue, SubmissionIndex, SubmissionState},
        sync::CompletionFuture,
    };
}
