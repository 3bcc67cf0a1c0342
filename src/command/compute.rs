//! Compute dispatch commands.
//!
//! This module extends [`CommandRecorder`] with methods for dispatching compute work.
//! The dispatched shader itself is opaque; only its buffer bindings are tracked.

use smallvec::SmallVec;

use crate::{
    buffer::{Buffer, BufferUsages},
    error::{Result, ValidationError},
    utils::{COPY_BUFFER_ALIGNMENT, check_bounds, check_offset_alignment, check_usage},
};

use super::{BufferBinding, Command, CommandRecorder};

/// Size of the `[x, y, z]` workgroup count an indirect dispatch reads.
pub const DISPATCH_INDIRECT_SIZE: u64 = 12;

/// Where a dispatch takes its workgroup counts from.
#[derive(Clone, Debug)]
pub enum DispatchSize {
    Direct([u32; 3]),
    /// Three `u32`s read from `buffer` at `offset` when the dispatch executes.
    Indirect { buffer: Buffer, offset: u64 },
}

impl CommandRecorder {
    /// Dispatches `x * y * z` workgroups with `bindings` bound.
    ///
    /// Each binding needs [`BufferUsages::UNIFORM`] or [`BufferUsages::STORAGE`] to
    /// match its [`BindingType`](super::BindingType). Writable storage bindings count
    /// as GPU writes of the bound buffer.
    pub fn dispatch_workgroups(
        &mut self,
        x: u32,
        y: u32,
        z: u32,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        self.record(Command::Dispatch {
            size: DispatchSize::Direct([x, y, z]),
            bindings: SmallVec::from(bindings),
        })
    }

    /// Dispatches with the workgroup counts stored in `indirect` at `offset`.
    ///
    /// `indirect` needs [`BufferUsages::INDIRECT`], `offset` must be a multiple of 4 and
    /// leave room for 12 bytes.
    pub fn dispatch_workgroups_indirect(
        &mut self,
        indirect: &Buffer,
        offset: u64,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        self.record(Command::Dispatch {
            size: DispatchSize::Indirect {
                buffer: indirect.clone(),
                offset,
            },
            bindings: SmallVec::from(bindings),
        })
    }
}

/// Validates an indirect argument buffer holding `size` bytes at `offset`.
pub(super) fn validate_indirect(buffer: &Buffer, offset: u64, size: u64) -> Result<(), ValidationError> {
    check_usage(buffer.id(), buffer.usage(), BufferUsages::INDIRECT)?;
    check_offset_alignment(offset, COPY_BUFFER_ALIGNMENT)?;
    check_bounds(offset, size, buffer.size())?;
    Ok(())
}

pub(super) fn validate_dispatch(
    size: &DispatchSize,
    bindings: &[BufferBinding],
) -> Result<(), ValidationError> {
    if let DispatchSize::Indirect { buffer, offset } = size {
        validate_indirect(buffer, *offset, DISPATCH_INDIRECT_SIZE)?;
    }
    bindings.iter().try_for_each(BufferBinding::validate)
}
