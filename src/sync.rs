//! Single-fire completion notifications.
//!
//! Map requests and [`Queue::on_submitted_work_done`](crate::queue::Queue::on_submitted_work_done)
//! hand the caller a [`CompletionFuture`]. The other half, a [`Resolver`], stays inside
//! the crate and is consumed when the operation resolves, so a result is delivered
//! exactly once. A resolver dropped without being used resolves the future with
//! [`Error::Aborted`] so no caller waits forever.
//!
//! Resolution never happens on its own: futures become ready only as a consequence of
//! [`Device::poll`](crate::Device::poll) being driven, from this thread or another one.

use std::{
    fmt::Debug,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use event_listener::{Event, EventListener};

use crate::error::{Error, Result};

enum Slot<T> {
    Empty,
    Ready(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    event: Event,
}

impl<T> Shared<T> {
    /// Stores `value` unless a value was already stored. Returns whether it was stored.
    fn fill(&self, value: Result<T>) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(value);
        drop(slot);
        self.event.notify(usize::MAX);
        true
    }

    fn take(&self) -> Option<Result<T>> {
        let mut slot = self.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            previous => {
                *slot = previous;
                None
            }
        }
    }
}

/// Creates a connected resolver / future pair.
pub(crate) fn completion<T>() -> (Resolver<T>, CompletionFuture<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Empty),
        event: Event::new(),
    });
    (
        Resolver {
            shared: Some(shared.clone()),
        },
        CompletionFuture {
            shared,
            listener: None,
        },
    )
}

/// The producing half of a completion. Consumed on resolution.
pub(crate) struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Resolver<T> {
    /// Resolves the completion. Returns `false` if it had already been resolved.
    pub fn resolve(mut self, value: Result<T>) -> bool {
        match self.shared.take() {
            Some(shared) => shared.fill(value),
            None => false,
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fill(Err(Error::Aborted));
        }
    }
}

impl<T> Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// A future for the result of an asynchronous operation, resolved exactly once.
///
/// Besides being awaited, it can be inspected without an executor through
/// [`is_resolved`](Self::is_resolved) and [`try_take`](Self::try_take).
#[must_use = "the result of the operation is only observable through this future"]
pub struct CompletionFuture<T = ()> {
    shared: Arc<Shared<T>>,
    listener: Option<EventListener>,
}

impl<T> CompletionFuture<T> {
    /// Returns `true` once a result is available (or has been taken).
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.shared.slot.lock().unwrap(), Slot::Empty)
    }

    /// Takes the result if the operation has resolved.
    ///
    /// Returns `None` while the operation is still pending, and also after the result
    /// was already taken.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        self.shared.take()
    }
}

impl<T> Debug for CompletionFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionFuture")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> Future for CompletionFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            if let Some(value) = this.shared.take() {
                this.listener = None;
                return Poll::Ready(value);
            }
            match this.listener.as_mut() {
                // Register first, then re-check the slot, so a notification that lands
                // in between is not missed.
                None => this.listener = Some(this.shared.event.listen()),
                Some(listener) => match Pin::new(listener).poll(cx) {
                    Poll::Ready(()) => this.listener = None,
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_once() {
        let (resolver, mut future) = completion::<u32>();
        assert!(!future.is_resolved());
        assert!(future.try_take().is_none());
        assert!(resolver.resolve(Ok(7)));
        assert!(future.is_resolved());
        assert_eq!(future.try_take(), Some(Ok(7)));
        assert_eq!(future.try_take(), None);
    }

    #[test]
    fn test_dropped_resolver_aborts() {
        let (resolver, future) = completion::<()>();
        drop(resolver);
        assert_eq!(pollster::block_on(future), Err(Error::Aborted));
    }

    #[test]
    fn test_resolve_from_other_thread() {
        let (resolver, future) = completion::<u64>();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            resolver.resolve(Ok(42))
        });
        assert_eq!(pollster::block_on(future), Ok(42));
        assert!(handle.join().unwrap());
    }
}
