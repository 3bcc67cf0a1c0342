//! Submission and completion tracking.
//!
//! This module provides the [`Queue`] type for submitting [`CommandList`]s, and the
//! polling logic behind [`Device::poll`].
//!
//! # Overview
//!
//! Every submission is assigned a [`SubmissionIndex`] from a counter that starts at 1
//! and increases by one per submission. Submissions retire in FIFO order: once the
//! device observes index `n` as completed, every index below `n` is completed as well.
//!
//! Nothing completes on its own. [`Device::poll`] is what
//! - retires finished submissions,
//! - resolves map requests whose buffer is no longer used by in-flight work, in the
//!   order of the submissions they waited for,
//! - resolves [`Queue::on_submitted_work_done`] futures.
//!
//! [`Maintain::Wait`] blocks in the engine's native wait until everything submitted so
//! far has retired; [`Maintain::Poll`] only collects what is already done.
//!
//! # Host / GPU exclusion
//!
//! A submission is rejected if any buffer it references is mapped, has a pending map
//! request, or was destroyed. Conversely a map request only resolves after the latest
//! submission that referenced its buffer has retired. The host and the GPU therefore
//! never access a buffer at the same time.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use crate::{
    Device, HasDevice,
    buffer::{Buffer, BufferInner, MapState, Mapping},
    command::{Command, CommandList},
    engine::EngineSubmission,
    error::{Error, Result, ValidationError},
    sync::{CompletionFuture, Resolver, completion},
};

/// Position of a submission in the device's submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionIndex(pub(crate) u64);

impl SubmissionIndex {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    InFlight,
    Completed,
}

/// How much work [`Device::poll`] does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Maintain {
    /// Block until every submission made so far has retired, then collect.
    Wait,
    /// Collect whatever has already retired and return.
    #[default]
    Poll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollStatus {
    /// No submission is in flight anymore.
    pub queue_empty: bool,
}

struct InFlight {
    index: u64,
    handle: EngineSubmission,
}

/// A map request waiting for the submission `gate` to retire.
pub(crate) struct PendingMap {
    pub(crate) buffer: Weak<BufferInner>,
    /// Identifies the request so an aborted one is not resolved by a stale entry.
    pub(crate) request: u64,
    pub(crate) gate: u64,
}

#[derive(Default)]
pub(crate) struct QueueState {
    last_submitted: u64,
    completed: u64,
    in_flight: VecDeque<InFlight>,
    pub(crate) pending_maps: VecDeque<PendingMap>,
    work_done: Vec<(u64, Resolver<()>)>,
}

/// A handle to the device's submission queue.
#[derive(Clone, Debug)]
pub struct Queue {
    device: Device,
}

impl HasDevice for Queue {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Queue {
    pub(crate) fn new(device: Device) -> Self {
        Self { device }
    }

    /// Submits command lists for execution, as one submission.
    ///
    /// Fails validation, submitting nothing, if a list belongs to another device or
    /// references a buffer that is mapped, has a pending map request, or was destroyed.
    /// The lists are consumed either way. They are dropped once the engine has taken the
    /// submission; buffers released afterwards stay allocated in the engine until the
    /// work using them retires.
    pub fn submit(&self, lists: impl IntoIterator<Item = CommandList>) -> Result<SubmissionIndex> {
        let lists: Vec<CommandList> = lists.into_iter().collect();
        self.submit_lists(lists)
    }

    fn submit_lists(&self, lists: Vec<CommandList>) -> Result<SubmissionIndex> {
        let device = &self.device;
        device.check_lost()?;

        let mut queue = device.queue_state();
        if let Err(err) = check_submittable(device, &lists) {
            drop(queue);
            return device.validate(Err(err));
        }
        let handle = match device.engine().submit(&lists) {
            Ok(handle) => handle,
            Err(err) => {
                drop(queue);
                return Err(device.handle_engine_error(err));
            }
        };
        queue.last_submitted += 1;
        let index = queue.last_submitted;
        for (buffer, _) in lists.iter().flat_map(CommandList::buffer_accesses) {
            buffer.mark_submitted(index);
        }
        tracing::debug!(
            index,
            lists = lists.len(),
            commands = lists.iter().map(CommandList::len).sum::<usize>(),
            "submitted"
        );
        queue.in_flight.push_back(InFlight { index, handle });
        drop(queue);
        drop(lists);
        Ok(SubmissionIndex(index))
    }

    /// Writes `data` into `buffer` at `offset`, ordered after all earlier submissions.
    ///
    /// Requires [`COPY_DST`](crate::buffer::BufferUsages::COPY_DST); `offset` and the
    /// length of `data` must be multiples of 4, and the buffer must be unmapped. The
    /// write is a submission of its own.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<SubmissionIndex> {
        self.device.check_lost()?;
        let command = Command::WriteBuffer {
            buffer: buffer.clone(),
            offset,
            data: Arc::from(data),
        };
        if buffer.device() != &self.device {
            return self.device.validate(Err(ValidationError::ForeignDevice {
                buffer: buffer.id(),
            }));
        }
        self.device.validate(command.validate())?;
        self.submit_lists(vec![CommandList::single(self.device.clone(), command)])
    }

    /// Resolves once every submission made before this call has retired.
    pub fn on_submitted_work_done(&self) -> CompletionFuture<()> {
        let (resolver, future) = completion();
        if let Some(reason) = self.device.lost_reason() {
            resolver.resolve(Err(Error::DeviceLost(reason)));
            return future;
        }
        let mut queue = self.device.queue_state();
        let target = queue.last_submitted;
        queue.work_done.push((target, resolver));
        future
    }

    pub fn submission_state(&self, index: SubmissionIndex) -> SubmissionState {
        if index.0 <= self.device.queue_state().completed {
            SubmissionState::Completed
        } else {
            SubmissionState::InFlight
        }
    }

    /// The highest index the device has observed as retired.
    pub fn last_completed(&self) -> Option<SubmissionIndex> {
        match self.device.queue_state().completed {
            0 => None,
            index => Some(SubmissionIndex(index)),
        }
    }
}

fn check_submittable(device: &Device, lists: &[CommandList]) -> Result<(), ValidationError> {
    for list in lists {
        for (buffer, _) in list.buffer_accesses() {
            if buffer.device() != device {
                return Err(ValidationError::ForeignDevice {
                    buffer: buffer.id(),
                });
            }
            match &*buffer.0.state.lock().unwrap() {
                MapState::Unmapped => {}
                MapState::Destroyed => {
                    return Err(ValidationError::Destroyed {
                        buffer: buffer.id(),
                    });
                }
                other => {
                    return Err(ValidationError::BufferMappedDuringSubmit {
                        buffer: buffer.id(),
                        state: other.kind(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Outcomes collected under the queue lock and delivered after it is released.
#[derive(Default)]
struct Resolutions {
    resolved: Vec<(Resolver<()>, Result<()>)>,
    errors: Vec<Error>,
}

impl Device {
    /// Drives completion: retires finished submissions and resolves map requests and
    /// work-done futures whose conditions hold.
    ///
    /// With [`Maintain::Wait`] it first blocks until every submission made so far has
    /// retired. Callbacks fire in submission order, after internal locks are released.
    ///
    /// On a lost device everything outstanding resolves with [`Error::DeviceLost`] and
    /// the loss is returned.
    pub fn poll(&self, maintain: Maintain) -> Result<PollStatus> {
        if maintain == Maintain::Wait && !self.is_lost() {
            let last = self.queue_state().in_flight.back().map(|s| s.handle);
            if let Some(handle) = last
                && let Err(err) = self.engine().wait(handle)
            {
                self.handle_engine_error(err);
            }
        }
        self.maintain()
    }

    pub(crate) fn maintain(&self) -> Result<PollStatus> {
        let mut out = Resolutions::default();
        let mut queue = self.queue_state();
        loop {
            let lost = self.is_lost();
            self.collect(&mut queue, &mut out);
            // Mapping may have lost the device midway; drain what is left.
            if self.is_lost() == lost {
                break;
            }
        }
        let queue_empty = queue.in_flight.is_empty();
        drop(queue);

        for error in out.errors {
            self.report(error);
        }
        for (resolver, outcome) in out.resolved {
            resolver.resolve(outcome);
        }
        self.check_lost()?;
        Ok(PollStatus { queue_empty })
    }

    fn collect(&self, queue: &mut QueueState, out: &mut Resolutions) {
        if self.is_lost() {
            // Nothing retires on a lost device.
            queue.in_flight.clear();
        }
        while let Some(front) = queue.in_flight.front() {
            if !self.engine().is_retired(front.handle) {
                break;
            }
            queue.completed = front.index;
            tracing::debug!(index = front.index, "submission retired");
            queue.in_flight.pop_front();
        }
        let completed = queue.completed;
        let lost = self.is_lost();

        let (mut ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.pending_maps)
            .into_iter()
            .partition(|pending| lost || pending.gate <= completed);
        queue.pending_maps = waiting.into();
        ready.sort_by_key(|pending| pending.gate);
        for pending in ready {
            self.resolve_map(pending, out);
        }

        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.work_done)
            .into_iter()
            .partition(|(target, _)| self.is_lost() || *target <= completed);
        queue.work_done = waiting;
        for (_, resolver) in done {
            let outcome = match self.lost_reason() {
                Some(reason) => Err(Error::DeviceLost(reason)),
                None => Ok(()),
            };
            out.resolved.push((resolver, outcome));
        }
    }

    fn resolve_map(&self, pending: PendingMap, out: &mut Resolutions) {
        // A dropped buffer took its request with it.
        let Some(inner) = pending.buffer.upgrade() else {
            return;
        };
        let buffer = Buffer(inner);
        let mut state = buffer.0.state.lock().unwrap();
        let request = match std::mem::replace(&mut *state, MapState::Unmapped) {
            MapState::Pending(request) if request.id == pending.request => request,
            // Aborted, or superseded by a newer request.
            other => {
                *state = other;
                return;
            }
        };
        if let Some(reason) = self.lost_reason() {
            out.resolved.push((request.resolver, Err(Error::DeviceLost(reason))));
            return;
        }
        match self
            .engine()
            .map_for_host(buffer.id(), request.mode, request.range.clone())
        {
            Ok(contents) => {
                tracing::debug!(buffer = ?buffer.id(), range = ?request.range, "map resolved");
                *state = MapState::Mapped(Mapping::new(request.mode, request.range, contents));
                out.resolved.push((request.resolver, Ok(())));
            }
            Err(err) => {
                let error = Error::from(err);
                if let Error::DeviceLost(reason) = &error {
                    self.mark_lost(reason.clone());
                } else {
                    out.errors.push(error.clone());
                }
                out.resolved.push((request.resolver, Err(error)));
            }
        }
    }
}
