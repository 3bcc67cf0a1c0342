//! The execution engine interface.
//!
//! The synchronization core never touches GPU memory itself. Everything that executes,
//! allocates or copies bytes goes through an [`ExecutionEngine`]:
//!
//! - buffer allocation and release ([`create_buffer`](ExecutionEngine::create_buffer),
//!   [`destroy_buffer`](ExecutionEngine::destroy_buffer)),
//! - moving bytes between the engine and the host for mappings
//!   ([`map_for_host`](ExecutionEngine::map_for_host),
//!   [`unmap_from_host`](ExecutionEngine::unmap_from_host)),
//! - executing submitted [`CommandList`]s and reporting their retirement
//!   ([`submit`](ExecutionEngine::submit), [`is_retired`](ExecutionEngine::is_retired),
//!   [`wait`](ExecutionEngine::wait)).
//!
//! Errors discovered asynchronously, after the call that caused them returned, flow back
//! through the [`ErrorReporter`] handed to [`attach`](ExecutionEngine::attach).
//!
//! [`SoftwareEngine`] is a complete host-memory implementation.

mod soft;

pub use soft::{SoftwareEngine, SoftwareEngineBuilder};

use std::{ops::Range, sync::Weak};

use crate::{
    Device,
    buffer::{BufferId, MapMode},
    command::CommandList,
    device::DeviceInner,
    error::{Error, ValidationError},
    error_scope::ErrorFilter,
};

/// Engine-side handle for one submission. Ordered by submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineSubmission(pub u64);

/// Bytes written by the host through one mapped view, to be made visible to the engine.
#[derive(Clone, Copy, Debug)]
pub struct HostWrite<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("{0}")]
    Validation(String),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OutOfMemory(message) => Error::OutOfMemory(message),
            EngineError::DeviceLost(reason) => Error::DeviceLost(reason),
            EngineError::Validation(message) => Error::Validation(ValidationError::Engine(message)),
        }
    }
}

/// Executes GPU work on behalf of a [`Device`].
///
/// Implementations must retire submissions in the order they were submitted, and must not
/// call back into the device through the [`ErrorReporter`] from inside one of these
/// methods; report from the engine's own threads instead.
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Receives the channel for asynchronous errors. Called once, before any other method.
    fn attach(&self, reporter: ErrorReporter) {
        let _ = reporter;
    }

    /// Allocates `size` zero-initialized bytes for `id`.
    fn create_buffer(&self, id: BufferId, size: u64) -> Result<(), EngineError>;

    /// Releases the allocation once every submitted command using it has retired.
    fn destroy_buffer(&self, id: BufferId);

    /// Returns a snapshot of `range` for host access. Only called once every submission
    /// touching the buffer has retired.
    fn map_for_host(
        &self,
        id: BufferId,
        mode: MapMode,
        range: Range<u64>,
    ) -> Result<Vec<u8>, EngineError>;

    /// Makes host writes visible to later submissions.
    fn unmap_from_host(&self, id: BufferId, writes: &[HostWrite<'_>]) -> Result<(), EngineError>;

    fn submit(&self, lists: &[CommandList]) -> Result<EngineSubmission, EngineError>;

    /// Non-blocking retirement check.
    fn is_retired(&self, submission: EngineSubmission) -> bool;

    /// Blocks until `submission`, and with it every earlier submission, has retired.
    fn wait(&self, submission: EngineSubmission) -> Result<(), EngineError>;
}

/// The engine's way of reporting errors and device loss to the device that owns it.
///
/// Holds a weak reference: reports made after the device is gone are dropped.
#[derive(Clone)]
pub struct ErrorReporter {
    pub(crate) device: Weak<DeviceInner>,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ErrorReporter {
    fn device(&self) -> Option<Device> {
        self.device.upgrade().map(Device::from_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.device.strong_count() > 0
    }

    /// Reports an error to the device's error scopes, or its uncaptured-error handler.
    pub fn report(&self, filter: ErrorFilter, message: impl Into<String>) {
        let message = message.into();
        let error = match filter {
            ErrorFilter::Validation => Error::Validation(ValidationError::Engine(message)),
            ErrorFilter::OutOfMemory => Error::OutOfMemory(message),
        };
        if let Some(device) = self.device() {
            device.report(error);
        }
    }

    /// Marks the device lost. Every outstanding completion resolves with
    /// [`Error::DeviceLost`].
    pub fn device_lost(&self, reason: impl Into<String>) {
        if let Some(device) = self.device() {
            device.lose(reason.into());
        }
    }
}
