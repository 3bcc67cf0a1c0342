//! # Command Recording
//!
//! GPU work is recorded on the host into a [`CommandRecorder`] and sealed into an
//! immutable [`CommandList`], which is then handed to
//! [`Queue::submit`](crate::queue::Queue::submit).
//!
//! During recording, the recorder is responsible for:
//! - Validation. Every command is checked against buffer usage flags, copy alignment and
//!   bounds when it is recorded, so a list that finished successfully only fails at
//!   submit time because of the *state* of a buffer (mapped, pending or destroyed).
//! - Resource lifetimes. Each [`Command`] holds [`Buffer`] handles, so the buffers stay
//!   alive until the list has retired on the GPU timeline.
//! - Access tracking. [`Command::buffer_accesses`] reports which buffers a command reads
//!   and writes; the queue uses this to order map requests after GPU work.
//!
//! ## Lifecycle
//!
//! ```text
//!  Recording ──finish()──▶ Finished
//! ```
//!
//! Recording after `finish` and finishing twice are validation errors. A finished
//! [`CommandList`] is consumed by submission, so it can be submitted at most once.
//!
//! ## Example Usage
//!
//! ```
//! # use gpusync::prelude::*;
//! let device = Device::builder(SoftwareEngine::new()).build();
//! let usage = BufferUsages::COPY_SRC | BufferUsages::COPY_DST;
//! let desc = BufferDescriptor { label: None, size: 64, usage, mapped_at_creation: false };
//! let a = device.create_buffer(&desc).unwrap();
//! let b = device.create_buffer(&desc).unwrap();
//!
//! let mut recorder = device.create_command_recorder(Some("upload"));
//! recorder.push_debug_group("copy").unwrap();
//! recorder.copy_buffer_to_buffer(&a, 0, &b, 0, 64).unwrap();
//! recorder.pop_debug_group().unwrap();
//! let list = recorder.finish().unwrap();
//! device.queue().submit([list]).unwrap();
//! ```

mod compute;
mod render;
mod transfer;

pub use compute::{DISPATCH_INDIRECT_SIZE, DispatchSize};
pub use render::{DRAW_INDEXED_INDIRECT_SIZE, DRAW_INDIRECT_SIZE, DrawCall, RenderBindings};

use std::{fmt::Debug, sync::Arc};

use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    buffer::{Buffer, BufferUsages},
    error::{Result, ValidationError},
    utils::{check_bounds, check_copy_range, check_usage, resolve_size},
};

/// How a command touches a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// How a shader binding views its buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingType {
    Uniform,
    Storage { read_only: bool },
}

impl BindingType {
    fn required_usage(self) -> BufferUsages {
        match self {
            BindingType::Uniform => BufferUsages::UNIFORM,
            BindingType::Storage { .. } => BufferUsages::STORAGE,
        }
    }

    fn access(self) -> Access {
        match self {
            BindingType::Uniform | BindingType::Storage { read_only: true } => Access::Read,
            BindingType::Storage { read_only: false } => Access::Write,
        }
    }
}

/// A buffer range bound to a compute or render shader.
#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub buffer: Buffer,
    pub offset: u64,
    /// Defaults to the rest of the buffer.
    pub size: Option<u64>,
    pub ty: BindingType,
}

impl BufferBinding {
    pub fn uniform(buffer: &Buffer) -> Self {
        Self::new(buffer, BindingType::Uniform)
    }

    pub fn storage(buffer: &Buffer) -> Self {
        Self::new(buffer, BindingType::Storage { read_only: false })
    }

    pub fn read_only_storage(buffer: &Buffer) -> Self {
        Self::new(buffer, BindingType::Storage { read_only: true })
    }

    fn new(buffer: &Buffer, ty: BindingType) -> Self {
        Self {
            buffer: buffer.clone(),
            offset: 0,
            size: None,
            ty,
        }
    }

    pub fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = Some(size);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let buffer = &self.buffer;
        check_usage(buffer.id(), buffer.usage(), self.ty.required_usage())?;
        let size = resolve_size(self.offset, self.size, buffer.size());
        check_bounds(self.offset, size, buffer.size())?;
        Ok(())
    }
}

/// One recorded operation. Commands are opaque to the synchronization core apart from
/// the buffers they access.
#[derive(Clone, Debug)]
pub enum Command {
    CopyBufferToBuffer {
        source: Buffer,
        source_offset: u64,
        destination: Buffer,
        destination_offset: u64,
        size: u64,
    },
    /// Fills `offset..offset + size` with zeros.
    ClearBuffer { buffer: Buffer, offset: u64, size: u64 },
    /// Uploads host bytes. Produced by [`Queue::write_buffer`](crate::queue::Queue::write_buffer).
    WriteBuffer {
        buffer: Buffer,
        offset: u64,
        data: Arc<[u8]>,
    },
    Dispatch {
        size: DispatchSize,
        bindings: SmallVec<[BufferBinding; 4]>,
    },
    Draw {
        call: DrawCall,
        resources: RenderBindings,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
}

impl Command {
    /// Every buffer the command touches, with how it touches it.
    pub fn buffer_accesses(&self) -> SmallVec<[(&Buffer, Access); 4]> {
        let mut accesses = SmallVec::new();
        match self {
            Command::CopyBufferToBuffer {
                source,
                destination,
                ..
            } => {
                accesses.push((source, Access::Read));
                accesses.push((destination, Access::Write));
            }
            Command::ClearBuffer { buffer, .. } | Command::WriteBuffer { buffer, .. } => {
                accesses.push((buffer, Access::Write));
            }
            Command::Dispatch { size, bindings } => {
                if let DispatchSize::Indirect { buffer, .. } = size {
                    accesses.push((buffer, Access::Read));
                }
                accesses.extend(bindings.iter().map(|b| (&b.buffer, b.ty.access())));
            }
            Command::Draw { call, resources } => {
                if let DrawCall::Indirect { buffer, .. } = call {
                    accesses.push((buffer, Access::Read));
                }
                resources.push_accesses(&mut accesses);
            }
            Command::PushDebugGroup(_) | Command::PopDebugGroup | Command::InsertDebugMarker(_) => {
            }
        }
        accesses
    }

    /// Checks usage flags, alignment and bounds of the command's operands.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Command::CopyBufferToBuffer {
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => transfer::validate_copy(
                source,
                *source_offset,
                destination,
                *destination_offset,
                *size,
            ),
            Command::ClearBuffer {
                buffer,
                offset,
                size,
            } => transfer::validate_clear(buffer, *offset, *size),
            Command::WriteBuffer {
                buffer,
                offset,
                data,
            } => {
                check_usage(buffer.id(), buffer.usage(), BufferUsages::COPY_DST)?;
                check_copy_range(*offset, data.len() as u64, buffer.size())?;
                Ok(())
            }
            Command::Dispatch { size, bindings } => compute::validate_dispatch(size, bindings),
            Command::Draw { call, resources } => render::validate_draw(call, resources),
            Command::PushDebugGroup(_) | Command::PopDebugGroup | Command::InsertDebugMarker(_) => {
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Recording,
    Finished,
}

/// Records [`Command`]s for later submission.
///
/// Typed helpers such as [`copy_buffer_to_buffer`](Self::copy_buffer_to_buffer) build a
/// command and pass it to [`record`](Self::record). Failed validation is reported to the
/// device's error scopes and returned; the rejected command is not recorded and the
/// recorder stays usable.
pub struct CommandRecorder {
    device: Device,
    label: Option<String>,
    commands: Vec<Command>,
    debug_groups: usize,
    state: RecorderState,
}

impl HasDevice for CommandRecorder {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("label", &self.label)
            .field("commands", &self.commands.len())
            .field("debug_groups", &self.debug_groups)
            .field("state", &self.state)
            .finish()
    }
}

impl CommandRecorder {
    pub(crate) fn new(device: Device, label: Option<&str>) -> Self {
        Self {
            device,
            label: label.map(str::to_owned),
            commands: Vec::new(),
            debug_groups: 0,
            state: RecorderState::Recording,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Number of debug groups currently open.
    pub fn debug_group_depth(&self) -> usize {
        self.debug_groups
    }

    /// Validates `command` and appends it.
    pub fn record(&mut self, command: Command) -> Result<()> {
        self.device.check_lost()?;
        let checked = self.check(&command);
        self.device.validate(checked)?;
        match command {
            Command::PushDebugGroup(_) => self.debug_groups += 1,
            Command::PopDebugGroup => self.debug_groups -= 1,
            _ => {}
        }
        self.commands.push(command);
        Ok(())
    }

    fn check(&self, command: &Command) -> Result<(), ValidationError> {
        if self.state == RecorderState::Finished {
            return Err(ValidationError::RecorderFinished);
        }
        for (buffer, _) in command.buffer_accesses() {
            if buffer.device() != &self.device {
                return Err(ValidationError::ForeignDevice {
                    buffer: buffer.id(),
                });
            }
        }
        if matches!(command, Command::PopDebugGroup) && self.debug_groups == 0 {
            return Err(ValidationError::DebugGroupUnderflow);
        }
        command.validate()
    }

    pub fn push_debug_group(&mut self, label: &str) -> Result<()> {
        self.record(Command::PushDebugGroup(label.to_owned()))
    }

    pub fn pop_debug_group(&mut self) -> Result<()> {
        self.record(Command::PopDebugGroup)
    }

    pub fn insert_debug_marker(&mut self, label: &str) -> Result<()> {
        self.record(Command::InsertDebugMarker(label.to_owned()))
    }

    /// Seals the recorded commands into a [`CommandList`].
    ///
    /// The recorder is finished afterwards even if this fails, like a WebGPU encoder
    /// that became invalid.
    pub fn finish(&mut self) -> Result<CommandList> {
        self.device.check_lost()?;
        let checked = match self.state {
            RecorderState::Finished => Err(ValidationError::RecorderFinished),
            RecorderState::Recording => {
                self.state = RecorderState::Finished;
                match self.debug_groups {
                    0 => Ok(()),
                    open => Err(ValidationError::UnclosedDebugGroups { open }),
                }
            }
        };
        self.device.validate(checked)?;
        tracing::trace!(label = ?self.label, commands = self.commands.len(), "command list finished");
        Ok(CommandList {
            device: self.device.clone(),
            label: self.label.take(),
            commands: std::mem::take(&mut self.commands),
        })
    }
}

/// An immutable, finished sequence of commands.
///
/// Consumed by [`Queue::submit`](crate::queue::Queue::submit).
pub struct CommandList {
    device: Device,
    label: Option<String>,
    commands: Vec<Command>,
}

impl HasDevice for CommandList {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("label", &self.label)
            .field("commands", &self.commands)
            .finish()
    }
}

impl CommandList {
    /// A list holding a single command that bypasses the recorder.
    pub(crate) fn single(device: Device, command: Command) -> Self {
        Self {
            device,
            label: None,
            commands: vec![command],
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Every buffer access of every command, in recording order.
    pub fn buffer_accesses(&self) -> impl Iterator<Item = (&Buffer, Access)> {
        self.commands
            .iter()
            .flat_map(|command| command.buffer_accesses())
    }
}
