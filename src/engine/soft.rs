//! A host-memory execution engine.
//!
//! [`SoftwareEngine`] keeps every buffer in a `Vec<u8>` and executes submissions on a
//! dedicated worker thread, strictly in submission order. Transfers (copies, clears and
//! queue writes) are carried out byte for byte; dispatches and draws have no observable
//! effect on memory and are retired without doing anything.
//!
//! # Worker
//!
//! Jobs reach the worker over a `crossbeam-channel`. After each submission the worker
//! bumps the retired watermark and notifies an [`Event`], which is what
//! [`ExecutionEngine::wait`] blocks on.
//!
//! Releasing a buffer is queued behind earlier work the same way, so a buffer destroyed
//! while a copy into it is still queued outlives that copy.
//!
//! # Test hooks
//!
//! [`pause`](SoftwareEngine::pause) stops the worker before its next job, which keeps
//! submissions in flight for as long as a test needs to observe them.
//! [`lose_device`](SoftwareEngine::lose_device) simulates a device reset.
//!
//! The worker thread runs until every clone of the engine is dropped.

use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use event_listener::{Event, Listener};

use super::{EngineError, EngineSubmission, ErrorReporter, ExecutionEngine, HostWrite};
use crate::{
    buffer::{BufferId, MapMode},
    command::{Command, CommandList},
    error_scope::ErrorFilter,
};

enum Op {
    Copy {
        source: BufferId,
        source_offset: u64,
        destination: BufferId,
        destination_offset: u64,
        size: u64,
    },
    Fill {
        buffer: BufferId,
        range: Range<u64>,
    },
    Write {
        buffer: BufferId,
        offset: u64,
        data: Arc<[u8]>,
    },
}

enum Job {
    Execute {
        submission: EngineSubmission,
        ops: Vec<Op>,
    },
    Release(BufferId),
}

#[derive(Default)]
struct Memory {
    buffers: HashMap<BufferId, Vec<u8>>,
    allocated: u64,
}

impl Memory {
    fn release(&mut self, id: BufferId) {
        if let Some(bytes) = self.buffers.remove(&id) {
            self.allocated -= bytes.len() as u64;
        }
    }

    fn slice_mut(&mut self, id: BufferId, range: Range<u64>) -> Result<&mut [u8], String> {
        let bytes = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| format!("unknown buffer {id:?}"))?;
        bytes
            .get_mut(range.start as usize..range.end as usize)
            .ok_or_else(|| format!("range {range:?} out of bounds for buffer {id:?}"))
    }

    fn execute(&mut self, op: &Op) -> Result<(), String> {
        match op {
            Op::Copy {
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                let staged = self
                    .slice_mut(*source, *source_offset..source_offset + size)?
                    .to_vec();
                self.slice_mut(*destination, *destination_offset..destination_offset + size)?
                    .copy_from_slice(&staged);
            }
            Op::Fill { buffer, range } => self.slice_mut(*buffer, range.clone())?.fill(0),
            Op::Write {
                buffer,
                offset,
                data,
            } => self
                .slice_mut(*buffer, *offset..offset + data.len() as u64)?
                .copy_from_slice(data),
        }
        Ok(())
    }
}

struct Shared {
    memory: Mutex<Memory>,
    memory_budget: u64,
    submitted: AtomicU64,
    retired: AtomicU64,
    retired_event: Event,
    paused: Mutex<bool>,
    resumed_event: Event,
    lost: Mutex<Option<String>>,
    reporter: Mutex<Option<ErrorReporter>>,
}

impl Shared {
    fn lost_reason(&self) -> Option<String> {
        self.lost.lock().unwrap().clone()
    }

    fn is_held(&self) -> bool {
        *self.paused.lock().unwrap() && self.lost.lock().unwrap().is_none()
    }

    fn wait_while_paused(&self) {
        loop {
            if !self.is_held() {
                return;
            }
            let listener = self.resumed_event.listen();
            if !self.is_held() {
                return;
            }
            listener.wait();
        }
    }

    fn reporter(&self) -> Option<ErrorReporter> {
        self.reporter.lock().unwrap().clone()
    }
}

/// Builder for [`SoftwareEngine`].
#[derive(Debug, Clone)]
pub struct SoftwareEngineBuilder {
    memory_budget: u64,
    thread_name: String,
}

impl Default for SoftwareEngineBuilder {
    fn default() -> Self {
        Self {
            memory_budget: u64::MAX,
            thread_name: "gpusync software engine".to_string(),
        }
    }
}

impl SoftwareEngineBuilder {
    /// Total bytes the engine may allocate. Allocations beyond it fail with
    /// [`EngineError::OutOfMemory`].
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Starts the worker thread.
    pub fn build(self) -> std::io::Result<SoftwareEngine> {
        let shared = Arc::new(Shared {
            memory: Mutex::new(Memory::default()),
            memory_budget: self.memory_budget,
            submitted: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            retired_event: Event::new(),
            paused: Mutex::new(false),
            resumed_event: Event::new(),
            lost: Mutex::new(None),
            reporter: Mutex::new(None),
        });
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = shared.clone();
        std::thread::Builder::new()
            .name(self.thread_name)
            .spawn(move || run_worker(&worker, receiver))?;
        Ok(SoftwareEngine { shared, sender })
    }
}

fn run_worker(shared: &Shared, receiver: crossbeam_channel::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        shared.wait_while_paused();
        match job {
            Job::Release(id) => shared.memory.lock().unwrap().release(id),
            Job::Execute { submission, ops } => {
                if shared.lost_reason().is_some() {
                    // Nothing retires on a lost device.
                    continue;
                }
                let failures: Vec<String> = {
                    let mut memory = shared.memory.lock().unwrap();
                    ops.iter().filter_map(|op| memory.execute(op).err()).collect()
                };
                if !failures.is_empty()
                    && let Some(reporter) = shared.reporter()
                {
                    for message in failures {
                        reporter.report(ErrorFilter::Validation, message);
                    }
                }
                shared.retired.fetch_max(submission.0, Ordering::AcqRel);
                shared.retired_event.notify(usize::MAX);
                tracing::trace!(submission = submission.0, "software engine retired submission");
            }
        }
    }
    tracing::debug!("software engine worker exiting");
}

/// Reference [`ExecutionEngine`] backed by host memory and a worker thread.
///
/// Cloning the engine yields another handle to the same worker and memory. Tests keep a
/// clone to drive [`pause`](Self::pause), [`resume`](Self::resume) and
/// [`lose_device`](Self::lose_device) while the device owns the original.
#[derive(Clone)]
pub struct SoftwareEngine {
    shared: Arc<Shared>,
    sender: crossbeam_channel::Sender<Job>,
}

impl std::fmt::Debug for SoftwareEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareEngine")
            .field("submitted", &self.shared.submitted.load(Ordering::Relaxed))
            .field("retired", &self.shared.retired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareEngine {
    /// An engine with default settings.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned, like [`std::thread::spawn`]. Use
    /// [`SoftwareEngine::builder`] to handle that error instead.
    pub fn new() -> Self {
        match Self::builder().build() {
            Ok(engine) => engine,
            Err(err) => panic!("failed to spawn the software engine worker thread: {err}"),
        }
    }

    pub fn builder() -> SoftwareEngineBuilder {
        SoftwareEngineBuilder::default()
    }

    /// Holds the worker before its next job until [`resume`](Self::resume).
    pub fn pause(&self) {
        *self.shared.paused.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.shared.paused.lock().unwrap() = false;
        self.shared.resumed_event.notify(usize::MAX);
    }

    /// Simulates losing the device. Queued work is abandoned and the attached device is
    /// notified.
    pub fn lose_device(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut lost = self.shared.lost.lock().unwrap();
            if lost.is_some() {
                return;
            }
            *lost = Some(reason.clone());
        }
        tracing::warn!(%reason, "software engine lost its device");
        self.shared.retired_event.notify(usize::MAX);
        self.shared.resumed_event.notify(usize::MAX);
        if let Some(reporter) = self.shared.reporter() {
            reporter.device_lost(reason);
        }
    }

    /// Total bytes currently allocated.
    pub fn allocated(&self) -> u64 {
        self.shared.memory.lock().unwrap().allocated
    }

    fn check_lost(&self) -> Result<(), EngineError> {
        match self.shared.lost_reason() {
            Some(reason) => Err(EngineError::DeviceLost(reason)),
            None => Ok(()),
        }
    }

    fn translate(list: &CommandList, ops: &mut Vec<Op>) {
        for command in list.commands() {
            match command {
                Command::CopyBufferToBuffer {
                    source,
                    source_offset,
                    destination,
                    destination_offset,
                    size,
                } => ops.push(Op::Copy {
                    source: source.id(),
                    source_offset: *source_offset,
                    destination: destination.id(),
                    destination_offset: *destination_offset,
                    size: *size,
                }),
                Command::ClearBuffer {
                    buffer,
                    offset,
                    size,
                } => ops.push(Op::Fill {
                    buffer: buffer.id(),
                    range: *offset..offset + size,
                }),
                Command::WriteBuffer {
                    buffer,
                    offset,
                    data,
                } => ops.push(Op::Write {
                    buffer: buffer.id(),
                    offset: *offset,
                    data: data.clone(),
                }),
                Command::Dispatch { .. }
                | Command::Draw { .. }
                | Command::PushDebugGroup(_)
                | Command::PopDebugGroup
                | Command::InsertDebugMarker(_) => {}
            }
        }
    }
}

impl ExecutionEngine for SoftwareEngine {
    fn attach(&self, reporter: ErrorReporter) {
        *self.shared.reporter.lock().unwrap() = Some(reporter);
    }

    fn create_buffer(&self, id: BufferId, size: u64) -> Result<(), EngineError> {
        self.check_lost()?;
        let mut memory = self.shared.memory.lock().unwrap();
        let total = memory.allocated.saturating_add(size);
        if total > self.shared.memory_budget {
            return Err(EngineError::OutOfMemory(format!(
                "allocating {size} bytes would exceed the budget of {} bytes ({} in use)",
                self.shared.memory_budget, memory.allocated
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| EngineError::OutOfMemory(format!("{size} bytes is not addressable")))?;
        memory.buffers.insert(id, vec![0; len]);
        memory.allocated = total;
        Ok(())
    }

    fn destroy_buffer(&self, id: BufferId) {
        if let Err(crossbeam_channel::SendError(Job::Release(id))) =
            self.sender.send(Job::Release(id))
        {
            self.shared.memory.lock().unwrap().release(id);
        }
    }

    fn map_for_host(
        &self,
        id: BufferId,
        _mode: MapMode,
        range: Range<u64>,
    ) -> Result<Vec<u8>, EngineError> {
        self.check_lost()?;
        let mut memory = self.shared.memory.lock().unwrap();
        memory
            .slice_mut(id, range)
            .map(|bytes| bytes.to_vec())
            .map_err(EngineError::Validation)
    }

    fn unmap_from_host(&self, id: BufferId, writes: &[HostWrite<'_>]) -> Result<(), EngineError> {
        self.check_lost()?;
        let mut memory = self.shared.memory.lock().unwrap();
        for write in writes {
            memory
                .slice_mut(id, write.offset..write.offset + write.data.len() as u64)
                .map_err(EngineError::Validation)?
                .copy_from_slice(write.data);
        }
        Ok(())
    }

    fn submit(&self, lists: &[CommandList]) -> Result<EngineSubmission, EngineError> {
        self.check_lost()?;
        let mut ops = Vec::new();
        for list in lists {
            Self::translate(list, &mut ops);
        }
        let submission = EngineSubmission(self.shared.submitted.fetch_add(1, Ordering::AcqRel) + 1);
        self.sender
            .send(Job::Execute { submission, ops })
            .map_err(|_| EngineError::DeviceLost("software engine worker exited".into()))?;
        Ok(submission)
    }

    fn is_retired(&self, submission: EngineSubmission) -> bool {
        self.shared.retired.load(Ordering::Acquire) >= submission.0
    }

    fn wait(&self, submission: EngineSubmission) -> Result<(), EngineError> {
        loop {
            if self.is_retired(submission) {
                return Ok(());
            }
            self.check_lost()?;
            let listener = self.shared.retired_event.listen();
            if self.is_retired(submission) {
                return Ok(());
            }
            self.check_lost()?;
            listener.wait();
        }
    }
}
