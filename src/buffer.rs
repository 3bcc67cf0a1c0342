//! GPU buffers and their host-mapping state machine.
//!
//! A [`Buffer`] is a handle to one allocation owned by the execution engine. The
//! host can only touch its bytes while the buffer is *mapped*:
//!
//! ```text
//!             map_async                 poll (prior work retired)
//!  Unmapped ─────────────▶ Pending ──────────────────────────────▶ Mapped
//!     ▲                       │                                      │
//!     └────── unmap (abort) ──┘◀──────────────── unmap ──────────────┘
//! ```
//!
//! - [`Buffer::map_async`] validates the request and moves the buffer to `Pending`.
//!   The request resolves during [`Device::poll`](crate::Device::poll), once every
//!   submission that referenced the buffer before the request has retired.
//! - [`Buffer::get_mapped_range`] exposes a sub-range of a mapped buffer as a
//!   [`BufferView`]. Exposed ranges never overlap; see [`RangeTracker`].
//! - [`Buffer::unmap`] flushes written views back to the engine, invalidates every
//!   view and returns the buffer to `Unmapped`. On a pending buffer it aborts the
//!   request instead.
//!
//! Buffers referenced by a submission cannot be mapped or pending at submit time, so
//! host access and GPU access to the same bytes never overlap.
//!
//! # Example
//!
//! ```
//! use gpusync::prelude::*;
//!
//! let device = Device::builder(SoftwareEngine::new()).build();
//! let buffer = device
//!     .create_buffer(&BufferDescriptor {
//!         label: Some("readback"),
//!         size: 16,
//!         usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
//!         mapped_at_creation: false,
//!     })
//!     .unwrap();
//! device.queue().write_buffer(&buffer, 0, &[7; 16]).unwrap();
//!
//! let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
//! assert_eq!(buffer.map_state(), MapStateKind::Pending);
//! device.poll(Maintain::Wait).unwrap();
//! request.try_take().unwrap().unwrap();
//!
//! let view = buffer.get_mapped_range(0, None).unwrap();
//! assert_eq!(&*view.lock().unwrap(), &[7; 16]);
//! buffer.unmap().unwrap();
//! assert!(!view.is_valid());
//! ```

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut, Range},
    sync::{
        Arc, Mutex, MutexGuard, TryLockError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    engine::HostWrite,
    error::{Error, Result, ValidationError},
    queue::PendingMap,
    sync::{CompletionFuture, Resolver, completion},
    tracking::RangeTracker,
    utils::{
        COPY_BUFFER_ALIGNMENT, MAP_ALIGNMENT, check_bounds, check_map_range,
        check_offset_alignment, check_size_alignment, check_usage, resolve_size,
    },
};

bitflags! {
    /// Capabilities a buffer is created with. Bit values match the WebGPU constants.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 0x0001;
        const MAP_WRITE = 0x0002;
        const COPY_SRC = 0x0004;
        const COPY_DST = 0x0008;
        const INDEX = 0x0010;
        const VERTEX = 0x0020;
        const UNIFORM = 0x0040;
        const STORAGE = 0x0080;
        const INDIRECT = 0x0100;
        const QUERY_RESOLVE = 0x0200;
    }
}

/// Direction of a host mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
}

impl MapMode {
    /// The usage flag a buffer needs to be mapped in this mode.
    pub fn required_usage(self) -> BufferUsages {
        match self {
            MapMode::Read => BufferUsages::MAP_READ,
            MapMode::Write => BufferUsages::MAP_WRITE,
        }
    }
}

/// Observable mapping state of a buffer.
///
/// A destroyed buffer reports [`Unmapped`](MapStateKind::Unmapped).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapStateKind {
    Unmapped,
    Pending,
    Mapped,
}

/// Identifies a buffer towards the execution engine. Unique per device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct BufferDescriptor<'a> {
    pub label: Option<&'a str>,
    pub size: u64,
    pub usage: BufferUsages,
    /// Start out mapped over the whole buffer for writing. Does not require
    /// [`BufferUsages::MAP_WRITE`].
    pub mapped_at_creation: bool,
}

/// One in-flight mapping attempt. Owned by the buffer's state; the caller only holds
/// the [`CompletionFuture`].
#[derive(Debug)]
pub(crate) struct MapRequest {
    pub(crate) id: u64,
    pub(crate) mode: MapMode,
    pub(crate) range: Range<u64>,
    pub(crate) resolver: Resolver<()>,
}

/// Host access granted by a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostAccess {
    Read,
    /// Written views are flushed back on unmap.
    Write,
}

/// A live mapping: the mapped extent, a snapshot of its bytes, and the views that
/// have been handed out.
#[derive(Debug)]
pub(crate) struct Mapping {
    access: HostAccess,
    extent: Range<u64>,
    contents: Box<[u8]>,
    ranges: RangeTracker,
    views: SmallVec<[Arc<ViewCell>; 4]>,
}

impl Mapping {
    pub(crate) fn new(mode: MapMode, extent: Range<u64>, contents: Vec<u8>) -> Self {
        Self {
            access: match mode {
                MapMode::Read => HostAccess::Read,
                MapMode::Write => HostAccess::Write,
            },
            extent,
            contents: contents.into_boxed_slice(),
            ranges: RangeTracker::new(),
            views: SmallVec::new(),
        }
    }

    fn at_creation(size: u64) -> Self {
        Self::new(MapMode::Write, 0..size, vec![0; size as usize])
    }

    /// Invalidates every view and takes their bytes. Returns the bytes to flush if the
    /// mapping was writable.
    ///
    /// Never waits on a view: if one is locked by its owner nothing is invalidated and
    /// [`ValidationError::ViewInUse`] is returned.
    fn try_detach(&self, buffer: BufferId) -> Result<Vec<(u64, Box<[u8]>)>, ValidationError> {
        let mut guards = Vec::with_capacity(self.views.len());
        for view in &self.views {
            let guard = match view.bytes.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return Err(ValidationError::ViewInUse {
                        buffer,
                        offset: view.offset,
                    });
                }
            };
            guards.push((view, guard));
        }
        let mut writes = Vec::new();
        for (view, mut guard) in guards {
            view.detached.store(true, Ordering::Release);
            if let (HostAccess::Write, Some(bytes)) = (self.access, guard.take()) {
                writes.push((view.offset, bytes));
            }
        }
        Ok(writes)
    }

    /// Invalidates every view without touching their bytes, which go away with the last
    /// view handle.
    fn abandon(&self) {
        for view in &self.views {
            view.detached.store(true, Ordering::Release);
        }
    }
}

/// The state machine proper. `Mapped` always carries its range set, so a mapped
/// buffer without range bookkeeping cannot exist.
#[derive(Debug)]
pub(crate) enum MapState {
    Unmapped,
    Pending(MapRequest),
    Mapped(Mapping),
    Destroyed,
}

impl MapState {
    pub(crate) fn kind(&self) -> MapStateKind {
        match self {
            MapState::Unmapped | MapState::Destroyed => MapStateKind::Unmapped,
            MapState::Pending(_) => MapStateKind::Pending,
            MapState::Mapped(_) => MapStateKind::Mapped,
        }
    }
}

pub(crate) struct BufferInner {
    device: Device,
    id: BufferId,
    size: u64,
    usage: BufferUsages,
    label: Option<String>,
    pub(crate) state: Mutex<MapState>,
    /// Index of the latest submission that referenced this buffer. Map requests wait
    /// for it to retire.
    last_submission: AtomicU64,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if !matches!(state, MapState::Destroyed) {
            self.device.engine().destroy_buffer(self.id);
        }
    }
}

/// A handle to a GPU buffer. Cloning the handle does not copy the buffer.
#[derive(Clone)]
pub struct Buffer(pub(crate) Arc<BufferInner>);

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.0.id)
            .field("label", &self.0.label)
            .field("size", &self.0.size)
            .field("usage", &self.0.usage)
            .finish_non_exhaustive()
    }
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Buffer {
    /// Wraps a buffer the engine has already allocated.
    pub(crate) fn from_raw(
        device: Device,
        id: BufferId,
        desc: &BufferDescriptor<'_>,
    ) -> Self {
        let state = if desc.mapped_at_creation {
            MapState::Mapped(Mapping::at_creation(desc.size))
        } else {
            MapState::Unmapped
        };
        Buffer(Arc::new(BufferInner {
            device,
            id,
            size: desc.size,
            usage: desc.usage,
            label: desc.label.map(str::to_owned),
            state: Mutex::new(state),
            last_submission: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn usage(&self) -> BufferUsages {
        self.0.usage
    }

    pub fn label(&self) -> Option<&str> {
        self.0.label.as_deref()
    }

    /// Current mapping state. Safe to call from any thread.
    pub fn map_state(&self) -> MapStateKind {
        self.0.state.lock().unwrap().kind()
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(*self.0.state.lock().unwrap(), MapState::Destroyed)
    }

    pub(crate) fn last_submission(&self) -> u64 {
        self.0.last_submission.load(Ordering::Acquire)
    }

    pub(crate) fn mark_submitted(&self, index: u64) {
        self.0.last_submission.fetch_max(index, Ordering::AcqRel);
    }

    /// Requests a host mapping of `offset..offset + size` (`size` defaults to the rest
    /// of the buffer).
    ///
    /// Validation happens immediately: the buffer must be unmapped and carry the usage
    /// flag for `mode`, the offset must be 8-byte aligned and the size 4-byte aligned.
    /// A failed request leaves the state untouched.
    ///
    /// On success the buffer becomes `Pending`. The returned future resolves during a
    /// later [`Device::poll`](crate::Device::poll) once every submission that referenced
    /// the buffer before this call has retired, with [`Error::Aborted`] if the request is
    /// cancelled by [`unmap`](Self::unmap), or with [`Error::DeviceLost`].
    pub fn map_async(
        &self,
        mode: MapMode,
        offset: u64,
        size: Option<u64>,
    ) -> Result<CompletionFuture<()>> {
        let device = self.device();
        device.check_lost()?;

        let mut queue = device.queue_state();
        let result = (|| -> Result<_, ValidationError> {
            let mut state = self.0.state.lock().unwrap();
            match &*state {
                MapState::Unmapped => {}
                MapState::Destroyed => {
                    return Err(ValidationError::Destroyed { buffer: self.id() });
                }
                other => {
                    return Err(ValidationError::NotUnmapped {
                        buffer: self.id(),
                        state: other.kind(),
                    });
                }
            }
            check_usage(self.id(), self.usage(), mode.required_usage())?;
            let size = resolve_size(offset, size, self.size());
            let range = check_map_range(offset, size, self.size())?;

            let (resolver, future) = completion();
            let request = device.next_request_id();
            let gate = self.last_submission();
            tracing::debug!(buffer = ?self.id(), ?mode, ?range, gate, "map requested");
            *state = MapState::Pending(MapRequest {
                id: request,
                mode,
                range,
                resolver,
            });
            queue.pending_maps.push_back(PendingMap {
                buffer: Arc::downgrade(&self.0),
                request,
                gate,
            });
            Ok(future)
        })();
        drop(queue);
        device.validate(result)
    }

    /// Exposes `offset..offset + size` of the mapped extent to the host. `size`
    /// defaults to the rest of the mapped extent, which for a whole-buffer mapping is
    /// the rest of the buffer.
    ///
    /// Fails if the buffer is not mapped, if `offset` is not 8-byte aligned, if `size`
    /// is not 4-byte aligned, if the range leaves the buffer or the mapped extent, or if
    /// it overlaps a range handed out earlier in this mapping.
    pub fn get_mapped_range(&self, offset: u64, size: Option<u64>) -> Result<BufferView> {
        let result = (|| -> Result<_, ValidationError> {
            let mut state = self.0.state.lock().unwrap();
            let mapping = match &mut *state {
                MapState::Mapped(mapping) => mapping,
                MapState::Destroyed => {
                    return Err(ValidationError::Destroyed { buffer: self.id() });
                }
                other => {
                    return Err(ValidationError::NotMapped {
                        buffer: self.id(),
                        state: other.kind(),
                    });
                }
            };
            check_offset_alignment(offset, MAP_ALIGNMENT)?;
            let size = resolve_size(offset, size, mapping.extent.end);
            check_size_alignment(size, COPY_BUFFER_ALIGNMENT)?;
            let range = check_bounds(offset, size, self.size())?;
            if range.start < mapping.extent.start || range.end > mapping.extent.end {
                return Err(ValidationError::OutsideMappedExtent {
                    range,
                    mapped: mapping.extent.clone(),
                });
            }
            mapping.ranges.try_insert(range.clone())?;

            let local = (range.start - mapping.extent.start) as usize
                ..(range.end - mapping.extent.start) as usize;
            let cell = Arc::new(ViewCell {
                offset: range.start,
                detached: AtomicBool::new(false),
                bytes: Mutex::new(Some(mapping.contents[local].into())),
            });
            mapping.views.push(cell.clone());
            Ok(BufferView {
                buffer: self.clone(),
                cell,
                len: size,
            })
        })();
        self.device().validate(result)
    }

    /// Ends host access.
    ///
    /// From `Mapped`, bytes written through views of a write mapping are flushed to the
    /// engine, every view is invalidated and the buffer becomes `Unmapped`. From
    /// `Pending`, the request is cancelled: its future resolves with
    /// [`Error::Aborted`]. Unmapping an unmapped buffer is a validation error and
    /// changes nothing.
    ///
    /// On a lost device the local state is still reset, but nothing is flushed and
    /// [`Error::DeviceLost`] is returned.
    pub fn unmap(&self) -> Result<()> {
        let device = self.device();
        let queue = device.queue_state();
        let mut state = self.0.state.lock().unwrap();
        let lost = device.lost_reason();
        let mut aborted = None;
        let mut flushed = Ok(());
        let checked = match &mut *state {
            MapState::Unmapped => Err(ValidationError::AlreadyUnmapped { buffer: self.id() }),
            MapState::Destroyed => Err(ValidationError::Destroyed { buffer: self.id() }),
            MapState::Pending(_) => {
                if let MapState::Pending(request) =
                    std::mem::replace(&mut *state, MapState::Unmapped)
                {
                    aborted = Some(request);
                }
                Ok(())
            }
            MapState::Mapped(mapping) if lost.is_some() => {
                mapping.abandon();
                *state = MapState::Unmapped;
                Ok(())
            }
            MapState::Mapped(mapping) => match mapping.try_detach(self.id()) {
                Ok(writes) => {
                    let writes: Vec<HostWrite<'_>> = writes
                        .iter()
                        .map(|(offset, data)| HostWrite {
                            offset: *offset,
                            data,
                        })
                        .collect();
                    // Flush under the state lock so no submission can observe the
                    // buffer unmapped before its contents reach the engine.
                    flushed = device.engine().unmap_from_host(self.id(), &writes);
                    *state = MapState::Unmapped;
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        drop(state);
        drop(queue);

        if let Some(request) = aborted {
            tracing::debug!(buffer = ?self.id(), "pending map aborted by unmap");
            let outcome = match &lost {
                Some(reason) => Err(Error::DeviceLost(reason.clone())),
                None => Err(Error::Aborted),
            };
            request.resolver.resolve(outcome);
        }
        if let Some(reason) = lost {
            return Err(Error::DeviceLost(reason));
        }
        if let Err(err) = flushed {
            return Err(device.handle_engine_error(err));
        }
        device.validate(checked)
    }

    /// Destroys the buffer. Idempotent.
    ///
    /// A pending map request is aborted first; a live mapping is discarded without
    /// flushing. Afterwards every operation on the buffer fails validation and
    /// submissions referencing it are rejected. Work already submitted still completes:
    /// the engine releases the allocation once that work has retired.
    pub fn destroy(&self) {
        let device = self.device();
        let queue = device.queue_state();
        let mut state = self.0.state.lock().unwrap();
        let previous = std::mem::replace(&mut *state, MapState::Destroyed);
        let aborted = match previous {
            MapState::Destroyed => return,
            MapState::Unmapped => None,
            MapState::Pending(request) => Some(request),
            MapState::Mapped(mapping) => {
                if !mapping.ranges.is_empty() {
                    tracing::warn!(
                        buffer = ?self.id(),
                        ranges = mapping.ranges.len(),
                        "destroying a buffer with mapped ranges, unflushed writes are discarded"
                    );
                }
                mapping.abandon();
                None
            }
        };
        device.engine().destroy_buffer(self.id());
        drop(state);
        drop(queue);
        tracing::info!(buffer = ?self.id(), label = ?self.label(), "buffer destroyed");
        if let Some(request) = aborted {
            let outcome = match device.lost_reason() {
                Some(reason) => Err(Error::DeviceLost(reason)),
                None => Err(Error::Aborted),
            };
            request.resolver.resolve(outcome);
        }
    }

    /// Maps the whole buffer for reading, drives the device to completion, copies the
    /// contents out and unmaps again.
    pub fn map_read_blocking(&self) -> Result<Vec<u8>> {
        let mut request = self.map_async(MapMode::Read, 0, None)?;
        self.device().poll(crate::queue::Maintain::Wait)?;
        // A blocking poll retires every submission the request waits for, so the
        // request is resolved unless someone else aborted it in the meantime.
        request.try_take().unwrap_or(Err(Error::Aborted))?;
        let contents = self.get_mapped_range(0, None)?.to_vec()?;
        self.unmap()?;
        Ok(contents)
    }
}

/// Backing store of one [`BufferView`].
#[derive(Debug)]
struct ViewCell {
    offset: u64,
    /// Set once the mapping is gone. Read without taking `bytes`.
    detached: AtomicBool,
    bytes: Mutex<Option<Box<[u8]>>>,
}

impl ViewCell {
    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Host access to one range handed out by [`Buffer::get_mapped_range`].
///
/// A view stays usable until the buffer is unmapped or destroyed. After that every
/// access fails with [`ValidationError::DetachedView`].
pub struct BufferView {
    buffer: Buffer,
    cell: Arc<ViewCell>,
    len: u64,
}

impl Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("buffer", &self.buffer.id())
            .field("range", &self.range())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl BufferView {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.cell.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte range of the buffer covered by this view.
    pub fn range(&self) -> Range<u64> {
        self.cell.offset..self.cell.offset + self.len
    }

    /// Returns `false` once the mapping this view came from has ended.
    pub fn is_valid(&self) -> bool {
        !self.cell.is_detached()
    }

    /// Locks the view's bytes for reading or writing.
    ///
    /// Writes through a view of a read mapping are discarded on unmap. While the
    /// returned guard is alive the buffer cannot be unmapped.
    pub fn lock(&self) -> Result<MappedBytes<'_>> {
        let guard = self.cell.bytes.lock().unwrap();
        if self.cell.is_detached() || guard.is_none() {
            drop(guard);
            return self.buffer.device().validate(Err(ValidationError::DetachedView));
        }
        Ok(MappedBytes { guard })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.to_vec())
    }

    /// Overwrites the start of the view with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut bytes = self.lock()?;
        if data.len() > bytes.len() {
            drop(bytes);
            return self.buffer.device().validate(Err(ValidationError::OutOfBounds {
                range: 0..data.len() as u64,
                size: self.len,
            }));
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Locked access to the bytes of a [`BufferView`].
pub struct MappedBytes<'a> {
    guard: MutexGuard<'a, Option<Box<[u8]>>>,
}

impl Deref for MappedBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_deref().unwrap_or_default()
    }
}

impl DerefMut for MappedBytes<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_deref_mut().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::SoftwareEngine,
        error::ErrorKind,
        error_scope::ErrorFilter,
        queue::Maintain,
    };

    fn device() -> Device {
        crate::device::lenient_device(SoftwareEngine::new())
    }

    fn buffer(device: &Device, size: u64, usage: BufferUsages) -> Buffer {
        device
            .create_buffer(&BufferDescriptor {
                label: None,
                size,
                usage,
                mapped_at_creation: false,
            })
            .unwrap()
    }

    fn mapped(device: &Device, size: u64) -> Buffer {
        let buffer = buffer(device, size, BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC);
        let mut request = buffer.map_async(MapMode::Write, 0, None).unwrap();
        device.poll(Maintain::Wait).unwrap();
        request.try_take().unwrap().unwrap();
        buffer
    }

    fn validation(err: Error) -> ValidationError {
        err.as_validation().cloned().expect("expected a validation error")
    }

    #[test]
    fn test_map_without_usage_fails_and_keeps_state() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::STORAGE);
        let err = buffer.map_async(MapMode::Read, 0, None).unwrap_err();
        assert_eq!(
            validation(err),
            ValidationError::MissingUsage {
                buffer: buffer.id(),
                required: BufferUsages::MAP_READ,
                actual: BufferUsages::STORAGE,
            }
        );
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
    }

    #[test]
    fn test_map_lifecycle() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::MAP_READ | BufferUsages::COPY_DST);
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);

        let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
        assert_eq!(buffer.map_state(), MapStateKind::Pending);
        assert!(!request.is_resolved());

        // A second request while pending is rejected.
        let err = buffer.map_async(MapMode::Read, 0, None).unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::NotUnmapped {
                state: MapStateKind::Pending,
                ..
            }
        ));

        device.poll(Maintain::Poll).unwrap();
        assert_eq!(request.try_take(), Some(Ok(())));
        assert_eq!(buffer.map_state(), MapStateKind::Mapped);

        let view = buffer.get_mapped_range(0, None).unwrap();
        assert_eq!(view.range(), 0..64);
        buffer.unmap().unwrap();
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
        assert!(!view.is_valid());
        assert_eq!(
            validation(view.lock().map(|_| ()).unwrap_err()),
            ValidationError::DetachedView
        );
    }

    #[test]
    fn test_overlapping_ranges() {
        let device = device();
        let buffer = mapped(&device, 64);
        buffer.get_mapped_range(0, Some(32)).unwrap();
        let err = buffer.get_mapped_range(16, Some(32)).unwrap_err();
        assert_eq!(
            validation(err),
            ValidationError::Overlap {
                range: 16..48,
                existing: 0..32
            }
        );
        buffer.get_mapped_range(32, Some(32)).unwrap();
    }

    #[test]
    fn test_range_alignment_and_bounds() {
        let device = device();
        let buffer = mapped(&device, 64);
        assert!(matches!(
            validation(buffer.get_mapped_range(4, Some(8)).unwrap_err()),
            ValidationError::UnalignedOffset {
                offset: 4,
                alignment: 8
            }
        ));
        assert!(matches!(
            validation(buffer.get_mapped_range(8, Some(6)).unwrap_err()),
            ValidationError::UnalignedSize {
                size: 6,
                alignment: 4
            }
        ));
        assert!(matches!(
            validation(buffer.get_mapped_range(56, Some(16)).unwrap_err()),
            ValidationError::OutOfBounds { .. }
        ));
        // Default size runs to the end of the buffer.
        assert_eq!(buffer.get_mapped_range(48, None).unwrap().range(), 48..64);
    }

    #[test]
    fn test_partial_mapping_extent() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::MAP_WRITE);
        let mut request = buffer.map_async(MapMode::Write, 16, Some(16)).unwrap();
        device.poll(Maintain::Poll).unwrap();
        request.try_take().unwrap().unwrap();

        assert!(matches!(
            validation(buffer.get_mapped_range(0, Some(8)).unwrap_err()),
            ValidationError::OutsideMappedExtent { .. }
        ));
        assert_eq!(buffer.get_mapped_range(16, None).unwrap().range(), 16..32);
    }

    #[test]
    fn test_get_range_requires_mapping() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::MAP_READ);
        assert!(matches!(
            validation(buffer.get_mapped_range(0, None).unwrap_err()),
            ValidationError::NotMapped {
                state: MapStateKind::Unmapped,
                ..
            }
        ));
    }

    #[test]
    fn test_unmap_unmapped_is_validation_error() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::MAP_READ);
        device.push_error_scope(ErrorFilter::Validation);
        let err = buffer.unmap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(device.pop_error_scope().unwrap(), Some(err));
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
    }

    #[test]
    fn test_unmap_pending_aborts_once() {
        let device = device();
        let buffer = buffer(&device, 64, BufferUsages::MAP_READ);
        let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
        buffer.unmap().unwrap();
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
        assert_eq!(request.try_take(), Some(Err(Error::Aborted)));

        // The stale queue entry must not resurrect the aborted request.
        device.poll(Maintain::Wait).unwrap();
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
        assert_eq!(request.try_take(), None);
    }

    #[test]
    fn test_mapped_at_creation_flushes_on_unmap() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("init"),
                size: 16,
                usage: BufferUsages::COPY_SRC | BufferUsages::MAP_READ,
                mapped_at_creation: true,
            })
            .unwrap();
        assert_eq!(buffer.map_state(), MapStateKind::Mapped);
        let view = buffer.get_mapped_range(0, None).unwrap();
        view.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
            .unwrap();
        buffer.unmap().unwrap();

        let contents = buffer.map_read_blocking().unwrap();
        assert_eq!(contents, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_read_mapping_discards_writes() {
        let device = device();
        let buffer = buffer(&device, 8, BufferUsages::MAP_READ);
        let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
        device.poll(Maintain::Poll).unwrap();
        request.try_take().unwrap().unwrap();
        buffer.get_mapped_range(0, None).unwrap().write(&[9; 8]).unwrap();
        buffer.unmap().unwrap();
        assert_eq!(buffer.map_read_blocking().unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_destroy() {
        let device = device();
        let pending = buffer(&device, 64, BufferUsages::MAP_READ);
        let mut request = pending.map_async(MapMode::Read, 0, None).unwrap();
        pending.destroy();
        assert_eq!(request.try_take(), Some(Err(Error::Aborted)));
        assert!(pending.is_destroyed());
        assert_eq!(pending.map_state(), MapStateKind::Unmapped);
        assert!(matches!(
            validation(pending.map_async(MapMode::Read, 0, None).unwrap_err()),
            ValidationError::Destroyed { .. }
        ));
        // Destroying twice is fine.
        pending.destroy();

        let mapped = mapped(&device, 64);
        let view = mapped.get_mapped_range(0, None).unwrap();
        mapped.destroy();
        assert!(!view.is_valid());
        assert!(matches!(
            validation(mapped.unmap().unwrap_err()),
            ValidationError::Destroyed { .. }
        ));
    }

    #[test]
    fn test_views_of_different_ranges_are_independent() {
        let device = device();
        let buffer = mapped(&device, 32);
        let low = buffer.get_mapped_range(0, Some(16)).unwrap();
        let high = buffer.get_mapped_range(16, Some(16)).unwrap();
        let mut a = low.lock().unwrap();
        let mut b = high.lock().unwrap();
        a.fill(1);
        b.fill(2);
        drop((a, b));
        buffer.unmap().unwrap();

        let readback = device
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 32,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        let mut recorder = device.create_command_recorder(None);
        recorder
            .copy_buffer_to_buffer(&buffer, 0, &readback, 0, 32)
            .unwrap();
        device.queue().submit([recorder.finish().unwrap()]).unwrap();
        let contents = readback.map_read_blocking().unwrap();
        assert_eq!(&contents[..16], &[1; 16]);
        assert_eq!(&contents[16..], &[2; 16]);
    }

    #[test]
    fn test_unmap_refuses_locked_view() {
        let device = device();
        let buffer = mapped(&device, 32);
        let view = buffer.get_mapped_range(0, Some(16)).unwrap();
        let other = buffer.get_mapped_range(16, Some(16)).unwrap();
        let mut bytes = view.lock().unwrap();
        bytes.fill(9);

        assert_eq!(
            validation(buffer.unmap().unwrap_err()),
            ValidationError::ViewInUse {
                buffer: buffer.id(),
                offset: 0
            }
        );
        assert_eq!(buffer.map_state(), MapStateKind::Mapped);
        assert!(view.is_valid() && other.is_valid());

        drop(bytes);
        buffer.unmap().unwrap();
        assert!(!view.is_valid());
        assert!(!other.is_valid());
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);
    }

    #[test]
    fn test_locked_view_does_not_block_other_threads() {
        let device = device();
        let buffer = mapped(&device, 16);
        let view = buffer.get_mapped_range(0, None).unwrap();
        let bytes = view.lock().unwrap();

        let unmapper = {
            let buffer = buffer.clone();
            std::thread::spawn(move || buffer.unmap())
        };
        // Reading the state while holding a view must not wait on the unmap.
        assert_eq!(buffer.map_state(), MapStateKind::Mapped);
        let err = unmapper.join().unwrap().unwrap_err();
        assert!(matches!(validation(err), ValidationError::ViewInUse { .. }));
        assert_eq!(buffer.map_state(), MapStateKind::Mapped);

        drop(bytes);
        buffer.unmap().unwrap();
    }

    #[test]
    fn test_destroy_with_locked_view() {
        let device = device();
        let buffer = mapped(&device, 16);
        let view = buffer.get_mapped_range(0, None).unwrap();
        let mut bytes = view.lock().unwrap();
        buffer.destroy();
        assert!(buffer.is_destroyed());
        // The guard keeps working until dropped; the view is dead afterwards.
        bytes.fill(1);
        drop(bytes);
        assert!(!view.is_valid());
        assert_eq!(
            validation(view.lock().map(|_| ()).unwrap_err()),
            ValidationError::DetachedView
        );
    }

    #[test]
    fn test_zero_length_ranges() {
        let device = device();
        let buffer = mapped(&device, 64);
        let _view = buffer.get_mapped_range(0, Some(32)).unwrap();
        let empty = buffer.get_mapped_range(8, Some(0)).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.range(), 8..8);
        let _tail = buffer.get_mapped_range(32, None).unwrap();
        buffer.get_mapped_range(32, Some(0)).unwrap();
        buffer.unmap().unwrap();
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        /// Views handed out by one mapping never share a byte, and only aligned
        /// requests are ever accepted.
        #[test]
        fn mapped_ranges_stay_disjoint(
            requests in proptest::collection::vec((0u64..40, 0u64..24), 1..24)
        ) {
            let device = device();
            let buffer = mapped(&device, 256);
            let mut views: Vec<BufferView> = Vec::new();
            for (offset, size) in requests {
                let range = offset * 4..offset * 4 + size * 2;
                let aligned = range.start % 8 == 0 && (range.end - range.start) % 4 == 0;
                match buffer.get_mapped_range(range.start, Some(range.end - range.start)) {
                    Ok(view) => {
                        proptest::prop_assert!(aligned);
                        views.push(view);
                    }
                    Err(err) => proptest::prop_assert_eq!(err.kind(), ErrorKind::Validation),
                }
            }
            for (i, a) in views.iter().enumerate() {
                for b in &views[i + 1..] {
                    proptest::prop_assert!(!crate::tracking::ranges_overlap(&a.range(), &b.range()));
                }
            }
            buffer.unmap().unwrap();
            proptest::prop_assert!(views.iter().all(|view| !view.is_valid()));
        }
    }
}
