//! Alignment, bounds and usage checks shared by the buffer, recorder and queue.

use std::ops::Range;

use crate::{
    buffer::{BufferId, BufferUsages},
    error::ValidationError,
};

/// Required alignment of a mapping offset, and of `get_mapped_range` offsets.
pub const MAP_ALIGNMENT: u64 = 8;
/// Required alignment of mapping sizes, copy offsets and copy sizes.
pub const COPY_BUFFER_ALIGNMENT: u64 = 4;
/// Required alignment of the size of buffers usable as uniform buffers.
pub const UNIFORM_SIZE_ALIGNMENT: u64 = 16;

pub fn check_offset_alignment(offset: u64, alignment: u64) -> Result<(), ValidationError> {
    if offset % alignment != 0 {
        return Err(ValidationError::UnalignedOffset { offset, alignment });
    }
    Ok(())
}

pub fn check_size_alignment(size: u64, alignment: u64) -> Result<(), ValidationError> {
    if size % alignment != 0 {
        return Err(ValidationError::UnalignedSize { size, alignment });
    }
    Ok(())
}

/// Checks that `offset..offset + size` fits in a buffer of `buffer_size` bytes and
/// returns it.
pub fn check_bounds(offset: u64, size: u64, buffer_size: u64) -> Result<Range<u64>, ValidationError> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer_size => Ok(offset..end),
        end => Err(ValidationError::OutOfBounds {
            range: offset..end.unwrap_or(u64::MAX),
            size: buffer_size,
        }),
    }
}

/// Resolves an optional size to "everything from `offset` up to `end`".
pub fn resolve_size(offset: u64, size: Option<u64>, end: u64) -> u64 {
    size.unwrap_or_else(|| end.saturating_sub(offset))
}

/// Validates a host mapping range: offset aligned to [`MAP_ALIGNMENT`], size aligned to
/// [`COPY_BUFFER_ALIGNMENT`], and in bounds.
pub fn check_map_range(offset: u64, size: u64, buffer_size: u64) -> Result<Range<u64>, ValidationError> {
    check_offset_alignment(offset, MAP_ALIGNMENT)?;
    check_size_alignment(size, COPY_BUFFER_ALIGNMENT)?;
    check_bounds(offset, size, buffer_size)
}

/// Validates a GPU copy range: offset and size aligned to [`COPY_BUFFER_ALIGNMENT`],
/// and in bounds.
pub fn check_copy_range(offset: u64, size: u64, buffer_size: u64) -> Result<Range<u64>, ValidationError> {
    check_offset_alignment(offset, COPY_BUFFER_ALIGNMENT)?;
    check_size_alignment(size, COPY_BUFFER_ALIGNMENT)?;
    check_bounds(offset, size, buffer_size)
}

pub fn check_usage(
    buffer: BufferId,
    actual: BufferUsages,
    required: BufferUsages,
) -> Result<(), ValidationError> {
    if !actual.contains(required) {
        return Err(ValidationError::MissingUsage {
            buffer,
            required,
            actual,
        });
    }
    Ok(())
}

/// Validates the size of a new buffer against its usage and the device limit.
pub fn check_buffer_size(size: u64, usage: BufferUsages, max: u64) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError::ZeroSize);
    }
    let alignment = if usage.contains(BufferUsages::UNIFORM) {
        UNIFORM_SIZE_ALIGNMENT
    } else {
        COPY_BUFFER_ALIGNMENT
    };
    if size % alignment != 0 {
        return Err(ValidationError::UnalignedBufferSize { size, alignment });
    }
    if size > max {
        return Err(ValidationError::BufferTooLarge { size, max });
    }
    Ok(())
}
