//! Buffer transfer commands.
//!
//! This module extends [`CommandRecorder`] with methods for copying data between
//! buffers and clearing buffer contents.
use crate::{
    buffer::{Buffer, BufferUsages},
    error::{Result, ValidationError},
    utils::{check_copy_range, check_usage, resolve_size},
};

use super::{Command, CommandRecorder};

impl CommandRecorder {
    /// Copies `size` bytes from `source` at `source_offset` to `destination` at
    /// `destination_offset`.
    ///
    /// Requires [`BufferUsages::COPY_SRC`] on the source and
    /// [`BufferUsages::COPY_DST`] on the destination. Offsets and size must be multiples
    /// of 4, and the two buffers must differ.
    pub fn copy_buffer_to_buffer(
        &mut self,
        source: &Buffer,
        source_offset: u64,
        destination: &Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.record(Command::CopyBufferToBuffer {
            source: source.clone(),
            source_offset,
            destination: destination.clone(),
            destination_offset,
            size,
        })
    }

    /// Zeroes `offset..offset + size`. `size` defaults to the rest of the buffer.
    pub fn clear_buffer(&mut self, buffer: &Buffer, offset: u64, size: Option<u64>) -> Result<()> {
        self.record(Command::ClearBuffer {
            buffer: buffer.clone(),
            offset,
            size: resolve_size(offset, size, buffer.size()),
        })
    }
}

pub(super) fn validate_copy(
    source: &Buffer,
    source_offset: u64,
    destination: &Buffer,
    destination_offset: u64,
    size: u64,
) -> Result<(), ValidationError> {
    if source == destination {
        return Err(ValidationError::CopyWithinSameBuffer {
            buffer: source.id(),
        });
    }
    check_usage(source.id(), source.usage(), BufferUsages::COPY_SRC)?;
    check_usage(destination.id(), destination.usage(), BufferUsages::COPY_DST)?;
    check_copy_range(source_offset, size, source.size())?;
    check_copy_range(destination_offset, size, destination.size())?;
    Ok(())
}

pub(super) fn validate_clear(buffer: &Buffer, offset: u64, size: u64) -> Result<(), ValidationError> {
    check_usage(buffer.id(), buffer.usage(), BufferUsages::COPY_DST)?;
    check_copy_range(offset, size, buffer.size())?;
    Ok(())
}
