//! Error types.
//!
//! Every fallible operation returns [`Error`]. Its [`kind`](Error::kind) is what
//! [error scopes](crate::error_scope) filter on:
//!
//! - [`ErrorKind::Validation`]: a precondition was violated. The [`ValidationError`]
//!   names the rule.
//! - [`ErrorKind::OutOfMemory`]: the execution engine failed to allocate.
//! - [`ErrorKind::DeviceLost`]: the device is gone. Never captured by a scope; every
//!   later operation on the device fails with it.
//! - [`ErrorKind::Aborted`]: a pending map request was cancelled by
//!   [`Buffer::unmap`](crate::buffer::Buffer::unmap) or
//!   [`Buffer::destroy`](crate::buffer::Buffer::destroy).

use std::ops::Range;

use crate::buffer::{BufferId, BufferUsages, MapStateKind};

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    OutOfMemory,
    DeviceLost,
    Aborted,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("map request was aborted before it resolved")]
    Aborted,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::DeviceLost(_) => ErrorKind::DeviceLost,
            Error::Aborted => ErrorKind::Aborted,
        }
    }

    /// Returns the validation rule that failed, if this is a validation error.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A violated precondition. Each variant corresponds to one rule.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("buffer {buffer:?} is not mapped (state: {state:?})")]
    NotMapped {
        buffer: BufferId,
        state: MapStateKind,
    },
    #[error("buffer {buffer:?} must be unmapped to request a mapping (state: {state:?})")]
    NotUnmapped {
        buffer: BufferId,
        state: MapStateKind,
    },
    #[error("buffer {buffer:?} is already unmapped")]
    AlreadyUnmapped { buffer: BufferId },
    #[error("buffer {buffer:?} has been destroyed")]
    Destroyed { buffer: BufferId },
    #[error("buffer {buffer:?} usage {actual:?} is missing {required:?}")]
    MissingUsage {
        buffer: BufferId,
        required: BufferUsages,
        actual: BufferUsages,
    },
    #[error("buffer usage must not be empty")]
    EmptyUsage,
    #[error("buffer size must not be zero")]
    ZeroSize,
    #[error("buffer size {size} is not a multiple of {alignment}")]
    UnalignedBufferSize { size: u64, alignment: u64 },
    #[error("buffer size {size} exceeds the device limit of {max}")]
    BufferTooLarge { size: u64, max: u64 },
    #[error("offset {offset} is not a multiple of {alignment}")]
    UnalignedOffset { offset: u64, alignment: u64 },
    #[error("size {size} is not a multiple of {alignment}")]
    UnalignedSize { size: u64, alignment: u64 },
    #[error("range {}..{} is out of bounds for a buffer of {size} bytes", .range.start, .range.end)]
    OutOfBounds { range: Range<u64>, size: u64 },
    #[error(
        "range {}..{} lies outside the mapped extent {}..{}",
        .range.start, .range.end, .mapped.start, .mapped.end
    )]
    OutsideMappedExtent { range: Range<u64>, mapped: Range<u64> },
    #[error(
        "range {}..{} overlaps the already mapped range {}..{}",
        .range.start, .range.end, .existing.start, .existing.end
    )]
    Overlap {
        range: Range<u64>,
        existing: Range<u64>,
    },
    #[error("mapped range view was invalidated by unmap")]
    DetachedView,
    #[error("buffer {buffer:?} cannot be unmapped while the view at offset {offset} is locked")]
    ViewInUse { buffer: BufferId, offset: u64 },
    #[error("command recorder has already been finished")]
    RecorderFinished,
    #[error("pop_debug_group called with no open debug group")]
    DebugGroupUnderflow,
    #[error("command recorder finished with {open} unclosed debug group(s)")]
    UnclosedDebugGroups { open: usize },
    #[error("indexed draw without an index buffer")]
    MissingIndexBuffer,
    #[error("copy source and destination are the same buffer {buffer:?}")]
    CopyWithinSameBuffer { buffer: BufferId },
    #[error("buffer {buffer:?} belongs to a different device")]
    ForeignDevice { buffer: BufferId },
    #[error("buffer {buffer:?} is used in a submission while {state:?}")]
    BufferMappedDuringSubmit {
        buffer: BufferId,
        state: MapStateKind,
    },
    #[error("engine rejected the request: {0}")]
    Engine(String),
}

/// Misuse of the error scope stack itself, as opposed to a captured GPU error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScopeError {
    #[error("pop_error_scope called on an empty error scope stack")]
    Empty,
}
