//! Per-device error scopes.
//!
//! An error scope captures the first validation or out-of-memory error raised while it
//! is open. Scopes nest; a reported error goes to the innermost open scope whose filter
//! matches and which has not captured anything yet. When no scope takes it the error is
//! *uncaptured* and handed back to the caller of [`ErrorScopeStack::report`], which for a
//! [`Device`](crate::Device) means the uncaptured-error handler.
//!
//! ```
//! # use gpusync::{Device, engine::SoftwareEngine, error_scope::ErrorFilter};
//! # use gpusync::buffer::{BufferDescriptor, BufferUsages};
//! let device = Device::builder(SoftwareEngine::new()).build();
//! device.push_error_scope(ErrorFilter::Validation);
//! let _ = device.create_buffer(&BufferDescriptor {
//!     label: None,
//!     size: 0,
//!     usage: BufferUsages::STORAGE,
//!     mapped_at_creation: false,
//! });
//! assert!(device.pop_error_scope().unwrap().is_some());
//! ```
//!
//! The stack is owned by the device instance rather than living in global state, so two
//! devices never see each other's errors.

use crate::error::{Error, ErrorKind, ErrorScopeError};

/// Which class of errors an error scope captures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorFilter {
    Validation,
    OutOfMemory,
}

impl ErrorFilter {
    /// The filter an error would be matched against. `None` for errors that are never
    /// scoped.
    pub fn of(error: &Error) -> Option<Self> {
        match error.kind() {
            ErrorKind::Validation => Some(ErrorFilter::Validation),
            ErrorKind::OutOfMemory => Some(ErrorFilter::OutOfMemory),
            ErrorKind::DeviceLost | ErrorKind::Aborted => None,
        }
    }
}

#[derive(Debug)]
struct ErrorScope {
    filter: ErrorFilter,
    captured: Option<Error>,
}

#[derive(Debug, Default)]
pub struct ErrorScopeStack {
    scopes: Vec<ErrorScope>,
}

impl ErrorScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: ErrorFilter) {
        self.scopes.push(ErrorScope {
            filter,
            captured: None,
        });
    }

    /// Pops the innermost scope and returns the error it captured.
    pub fn pop(&mut self) -> Result<Option<Error>, ErrorScopeError> {
        self.scopes
            .pop()
            .map(|scope| scope.captured)
            .ok_or(ErrorScopeError::Empty)
    }

    /// Offers `error` to the open scopes, innermost first.
    ///
    /// Returns `None` if a scope captured it, or gives the error back if it is
    /// uncaptured.
    pub fn report(&mut self, error: Error) -> Option<Error> {
        let Some(filter) = ErrorFilter::of(&error) else {
            return Some(error);
        };
        match self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.filter == filter && scope.captured.is_none())
        {
            Some(scope) => {
                scope.captured = Some(error);
                None
            }
            None => Some(error),
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
