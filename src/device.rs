//! Device creation and management.
//!
//! This module provides the core [`Device`] type and [`DeviceBuilder`] for creating and
//! configuring devices.
//!
//! # Overview
//!
//! A [`Device`] is the root of all synchronization state. It owns:
//!
//! - the [`ExecutionEngine`] that runs GPU work,
//! - the submission queue and the list of pending map requests (see [`crate::queue`]),
//! - the [error scope stack](crate::error_scope) and the uncaptured-error handler,
//! - the device-lost flag.
//!
//! `Device` is reference-counted for cheap sharing and can be used from any thread.
//! Internally the queue state and each buffer's map state sit behind their own mutex.
//! The queue state is always locked before a buffer's state, and errors are delivered
//! only after both are released, so error handlers may call back into the device.
//!
//! # Quick Start
//!
//! ```
//! # use gpusync::prelude::*;
//! let mut builder = Device::builder(SoftwareEngine::new());
//! builder
//!     .label("main")
//!     .limits(Limits { max_buffer_size: 1 << 20 })
//!     .on_uncaptured_error(|error| eprintln!("{error}"));
//! let device = builder.build();
//! assert_eq!(device.label(), Some("main"));
//! ```
//!
//! # Device loss
//!
//! A device is lost when the engine reports it, when [`Device::destroy`] is called, or on
//! the first error no error scope captures. The uncaptured-error handler sees that error
//! before the device goes down; [`DeviceBuilder::lose_device_on_uncaptured_error`] turns
//! the loss off, leaving only the handler. Loss is permanent. Every pending completion
//! resolves with [`Error::DeviceLost`] and every later operation fails with it.

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    buffer::{Buffer, BufferDescriptor, BufferId},
    command::CommandRecorder,
    engine::{EngineError, ErrorReporter, ExecutionEngine},
    error::{Error, ErrorScopeError, Result, ValidationError},
    error_scope::{ErrorFilter, ErrorScopeStack},
    queue::{Queue, QueueState},
    utils::check_buffer_size,
};

/// A trait for types created from a [`Device`].
pub trait HasDevice {
    fn device(&self) -> &Device;
}

/// Resource limits enforced by validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_buffer_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_buffer_size: 256 << 20,
        }
    }
}

/// Receives errors that no error scope captured.
pub type UncapturedErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

fn log_uncaptured(error: Error) {
    tracing::error!(%error, "uncaptured device error");
}

/// A device handle. Cloning is cheap and yields a handle to the same device.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.0.label)
            .field("lost", &self.0.lost.get())
            .finish_non_exhaustive()
    }
}

pub(crate) struct DeviceInner {
    label: Option<String>,
    limits: Limits,
    engine: Box<dyn ExecutionEngine>,
    queue: Mutex<QueueState>,
    error_scopes: Mutex<ErrorScopeStack>,
    uncaptured: Mutex<UncapturedErrorHandler>,
    lose_on_uncaptured: bool,
    lost: OnceLock<String>,
    next_buffer_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let scopes = self.error_scopes.get_mut().unwrap_or_else(|e| e.into_inner());
        if !scopes.is_empty() {
            tracing::warn!(
                label = ?self.label,
                open = scopes.depth(),
                "device dropped with open error scopes"
            );
        }
        tracing::info!(label = ?self.label, "device dropped");
    }
}

impl Device {
    pub fn builder(engine: impl ExecutionEngine) -> DeviceBuilder {
        DeviceBuilder {
            engine: Box::new(engine),
            label: None,
            limits: Limits::default(),
            uncaptured: None,
            lose_on_uncaptured: true,
        }
    }

    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Device(inner)
    }

    pub fn label(&self) -> Option<&str> {
        self.0.label.as_deref()
    }

    pub fn limits(&self) -> &Limits {
        &self.0.limits
    }

    /// The device's queue. All queue handles of a device share one submission order.
    pub fn queue(&self) -> Queue {
        Queue::new(self.clone())
    }

    pub(crate) fn engine(&self) -> &dyn ExecutionEngine {
        &*self.0.engine
    }

    pub(crate) fn queue_state(&self) -> MutexGuard<'_, QueueState> {
        self.0.queue.lock().unwrap()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.0.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a buffer.
    ///
    /// The size must be non-zero, a multiple of 4 (of 16 with
    /// [`UNIFORM`](crate::buffer::BufferUsages::UNIFORM)) and within
    /// [`Limits::max_buffer_size`]; the usage must not be empty. With
    /// `mapped_at_creation` the buffer starts out mapped for writing over its whole size.
    pub fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<Buffer> {
        self.check_lost()?;
        let checked = if desc.usage.is_empty() {
            Err(ValidationError::EmptyUsage)
        } else {
            check_buffer_size(desc.size, desc.usage, self.0.limits.max_buffer_size)
        };
        self.validate(checked)?;

        let id = BufferId(self.0.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        if let Err(err) = self.engine().create_buffer(id, desc.size) {
            return Err(self.handle_engine_error(err));
        }
        tracing::debug!(
            buffer = ?id,
            label = ?desc.label,
            size = desc.size,
            usage = ?desc.usage,
            mapped_at_creation = desc.mapped_at_creation,
            "buffer created"
        );
        Ok(Buffer::from_raw(self.clone(), id, desc))
    }

    pub fn create_command_recorder(&self, label: Option<&str>) -> CommandRecorder {
        CommandRecorder::new(self.clone(), label)
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        self.0.error_scopes.lock().unwrap().push(filter);
    }

    /// Pops the innermost error scope and returns the first error it captured.
    pub fn pop_error_scope(&self) -> Result<Option<Error>, ErrorScopeError> {
        self.0.error_scopes.lock().unwrap().pop()
    }

    /// Replaces the handler for errors no scope captures.
    pub fn on_uncaptured_error(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        *self.0.uncaptured.lock().unwrap() = Arc::new(handler);
    }

    pub fn is_lost(&self) -> bool {
        self.0.lost.get().is_some()
    }

    pub fn lost_reason(&self) -> Option<String> {
        self.0.lost.get().cloned()
    }

    /// Loses the device on purpose. Pending map requests and work-done futures resolve
    /// with [`Error::DeviceLost`].
    pub fn destroy(&self) {
        self.lose("device destroyed".to_string());
    }

    pub(crate) fn check_lost(&self) -> Result<()> {
        match self.0.lost.get() {
            Some(reason) => Err(Error::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Sets the lost flag without draining anything. Returns `false` if the device was
    /// already lost.
    pub(crate) fn mark_lost(&self, reason: String) -> bool {
        let first = self.0.lost.set(reason).is_ok();
        if first {
            tracing::info!(label = ?self.0.label, reason = ?self.0.lost.get(), "device lost");
        }
        first
    }

    /// Marks the device lost and resolves everything outstanding. Must not be called
    /// with the queue or a buffer state locked.
    pub(crate) fn lose(&self, reason: String) {
        if self.mark_lost(reason) {
            // Drains in-flight work; the `DeviceLost` it returns is expected.
            let _ = self.maintain();
        }
    }

    /// Delivers `error` to the innermost matching error scope, or to the uncaptured
    /// handler. Must not be called with the queue or a buffer state locked.
    pub(crate) fn report(&self, error: Error) {
        if ErrorFilter::of(&error).is_none() {
            return;
        }
        let Some(error) = self.0.error_scopes.lock().unwrap().report(error) else {
            return;
        };
        let handler = self.0.uncaptured.lock().unwrap().clone();
        handler(error.clone());
        if self.0.lose_on_uncaptured {
            self.lose(format!("uncaptured error: {error}"));
        }
    }

    /// Reports a failed validation and converts it into the returned error.
    pub(crate) fn validate<T>(&self, checked: Result<T, ValidationError>) -> Result<T> {
        checked.map_err(|err| {
            let err = Error::Validation(err);
            self.report(err.clone());
            err
        })
    }

    /// Routes an error raised synchronously by the engine.
    pub(crate) fn handle_engine_error(&self, err: EngineError) -> Error {
        let error = Error::from(err);
        match &error {
            Error::DeviceLost(reason) => self.lose(reason.clone()),
            _ => self.report(error.clone()),
        }
        error
    }
}

/// Builder for configuring a [`Device`] before creation.
pub struct DeviceBuilder {
    engine: Box<dyn ExecutionEngine>,
    label: Option<String>,
    limits: Limits,
    uncaptured: Option<UncapturedErrorHandler>,
    lose_on_uncaptured: bool,
}

impl DeviceBuilder {
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    pub fn limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = limits;
        self
    }

    /// Handler for errors no error scope captures. Defaults to logging them with
    /// `tracing::error!`.
    pub fn on_uncaptured_error(
        &mut self,
        handler: impl Fn(Error) + Send + Sync + 'static,
    ) -> &mut Self {
        self.uncaptured = Some(Arc::new(handler));
        self
    }

    /// Whether an uncaptured error loses the device after the handler has seen it. On by
    /// default; turned off, uncaptured errors only reach the handler.
    pub fn lose_device_on_uncaptured_error(&mut self, enabled: bool) -> &mut Self {
        self.lose_on_uncaptured = enabled;
        self
    }

    /// Builds the device and attaches it to the engine.
    pub fn build(self) -> Device {
        let inner = Arc::new(DeviceInner {
            label: self.label,
            limits: self.limits,
            engine: self.engine,
            queue: Mutex::new(QueueState::default()),
            error_scopes: Mutex::new(ErrorScopeStack::new()),
            uncaptured: Mutex::new(
                self.uncaptured
                    .unwrap_or_else(|| Arc::new(log_uncaptured) as UncapturedErrorHandler),
            ),
            lose_on_uncaptured: self.lose_on_uncaptured,
            lost: OnceLock::new(),
            next_buffer_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        });
        inner.engine.attach(ErrorReporter {
            device: Arc::downgrade(&inner),
        });
        tracing::info!(label = ?inner.label, limits = ?inner.limits, "device created");
        Device(inner)
    }
}

/// A device that hands uncaptured errors to the handler without being lost by them.
#[cfg(test)]
pub(crate) fn lenient_device(engine: crate::engine::SoftwareEngine) -> Device {
    let mut builder = Device::builder(engine);
    builder.lose_device_on_uncaptured_error(false);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{BufferUsages, MapMode, MapStateKind},
        engine::SoftwareEngine,
        error::ErrorKind,
        queue::Maintain,
    };

    fn descriptor(size: u64, usage: BufferUsages) -> BufferDescriptor<'static> {
        BufferDescriptor {
            label: None,
            size,
            usage,
            mapped_at_creation: false,
        }
    }

    fn collecting_device(engine: SoftwareEngine) -> (Device, Arc<Mutex<Vec<Error>>>) {
        let uncaptured = Arc::new(Mutex::new(Vec::new()));
        let sink = uncaptured.clone();
        let mut builder = Device::builder(engine);
        builder.on_uncaptured_error(move |error| sink.lock().unwrap().push(error));
        (builder.build(), uncaptured)
    }

    #[test]
    fn test_create_buffer_validation() {
        let mut builder = Device::builder(SoftwareEngine::new());
        builder
            .limits(Limits {
                max_buffer_size: 1024,
            })
            .lose_device_on_uncaptured_error(false);
        let device = builder.build();
        assert_eq!(
            device
                .create_buffer(&descriptor(64, BufferUsages::empty()))
                .unwrap_err()
                .as_validation(),
            Some(&ValidationError::EmptyUsage)
        );
        assert_eq!(
            device
                .create_buffer(&descriptor(0, BufferUsages::COPY_DST))
                .unwrap_err()
                .as_validation(),
            Some(&ValidationError::ZeroSize)
        );
        assert!(matches!(
            device
                .create_buffer(&descriptor(2048, BufferUsages::COPY_DST))
                .unwrap_err()
                .as_validation(),
            Some(ValidationError::BufferTooLarge { .. })
        ));
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("ok"),
                ..descriptor(1024, BufferUsages::COPY_DST)
            })
            .unwrap();
        assert_eq!(buffer.label(), Some("ok"));
        assert_eq!(buffer.size(), 1024);
    }

    #[test]
    fn test_uncaptured_errors_reach_handler() {
        let (device, uncaptured) = collecting_device(SoftwareEngine::new());
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::STORAGE))
            .unwrap();

        device.push_error_scope(ErrorFilter::OutOfMemory);
        let err = buffer.map_async(MapMode::Read, 0, None).unwrap_err();
        // The only open scope filters out-of-memory errors.
        assert_eq!(device.pop_error_scope(), Ok(None));
        assert_eq!(*uncaptured.lock().unwrap(), vec![err.clone()]);
        assert!(device.is_lost());
        assert_eq!(
            device.lost_reason(),
            Some(format!("uncaptured error: {err}"))
        );
    }

    #[test]
    fn test_uncaptured_errors_can_stay_non_fatal() {
        let uncaptured = Arc::new(Mutex::new(Vec::new()));
        let sink = uncaptured.clone();
        let mut builder = Device::builder(SoftwareEngine::new());
        builder
            .on_uncaptured_error(move |error| sink.lock().unwrap().push(error))
            .lose_device_on_uncaptured_error(false);
        let device = builder.build();
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::STORAGE))
            .unwrap();

        let first = buffer.map_async(MapMode::Read, 0, None).unwrap_err();
        let second = buffer.unmap().unwrap_err();
        assert_eq!(*uncaptured.lock().unwrap(), vec![first, second]);
        assert!(!device.is_lost());
        assert!(device.create_buffer(&descriptor(64, BufferUsages::STORAGE)).is_ok());
    }

    #[test]
    fn test_nested_scopes() {
        let (device, uncaptured) = collecting_device(SoftwareEngine::new());
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::STORAGE))
            .unwrap();

        device.push_error_scope(ErrorFilter::Validation);
        device.push_error_scope(ErrorFilter::OutOfMemory);
        let first = buffer.unmap().unwrap_err();
        assert!(!device.is_lost());
        let second = buffer.unmap().unwrap_err();
        assert_eq!(device.pop_error_scope(), Ok(None));
        // The outer scope keeps the first error; the second has nowhere to go.
        assert_eq!(device.pop_error_scope(), Ok(Some(first)));
        assert_eq!(*uncaptured.lock().unwrap(), vec![second]);
        assert!(device.is_lost());
        assert_eq!(device.pop_error_scope(), Err(ErrorScopeError::Empty));
    }

    #[test]
    fn test_out_of_memory_is_scoped() {
        let engine = SoftwareEngine::builder().memory_budget(128).build().unwrap();
        let device = Device::builder(engine).build();
        device.push_error_scope(ErrorFilter::OutOfMemory);
        let err = device
            .create_buffer(&descriptor(256, BufferUsages::COPY_DST))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(device.pop_error_scope(), Ok(Some(err)));
    }

    #[test]
    fn test_destroy_loses_device() {
        let (device, uncaptured) = collecting_device(SoftwareEngine::new());
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::MAP_READ))
            .unwrap();
        let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
        device.push_error_scope(ErrorFilter::Validation);

        device.destroy();
        assert!(device.is_lost());
        assert_eq!(device.lost_reason().as_deref(), Some("device destroyed"));
        assert_eq!(
            request.try_take(),
            Some(Err(Error::DeviceLost("device destroyed".into())))
        );
        assert_eq!(buffer.map_state(), MapStateKind::Unmapped);

        assert_eq!(
            device
                .create_buffer(&descriptor(64, BufferUsages::MAP_READ))
                .unwrap_err()
                .kind(),
            ErrorKind::DeviceLost
        );
        assert!(matches!(
            device.poll(Maintain::Poll),
            Err(Error::DeviceLost(_))
        ));
        // Loss is never captured by a scope nor handed to the uncaptured handler.
        assert_eq!(device.pop_error_scope(), Ok(None));
        assert!(uncaptured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_engine_reported_loss() {
        let engine = SoftwareEngine::new();
        let device = Device::builder(engine.clone()).build();
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::MAP_READ | BufferUsages::COPY_DST))
            .unwrap();
        engine.pause();
        device.queue().write_buffer(&buffer, 0, &[1; 64]).unwrap();
        let mut request = buffer.map_async(MapMode::Read, 0, None).unwrap();
        let mut done = device.queue().on_submitted_work_done();

        engine.lose_device("driver reset");
        assert!(device.is_lost());
        assert_eq!(
            request.try_take(),
            Some(Err(Error::DeviceLost("driver reset".into())))
        );
        assert_eq!(
            done.try_take(),
            Some(Err(Error::DeviceLost("driver reset".into())))
        );
        assert!(matches!(buffer.unmap(), Err(Error::DeviceLost(_))));
    }

    #[test]
    fn test_uncaptured_errors_are_fatal_by_default() {
        let device = Device::builder(SoftwareEngine::new()).build();
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::STORAGE))
            .unwrap();
        assert_eq!(
            buffer.map_async(MapMode::Read, 0, None).unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(device.is_lost());
        assert!(matches!(
            buffer.map_async(MapMode::Read, 0, None),
            Err(Error::DeviceLost(_))
        ));
    }

    #[test]
    fn test_unpolled_submissions_do_not_keep_device_alive() {
        let engine = SoftwareEngine::new();
        let device = Device::builder(engine.clone()).build();
        let buffer = device
            .create_buffer(&descriptor(64, BufferUsages::MAP_READ | BufferUsages::COPY_DST))
            .unwrap();
        engine.pause();
        device.queue().write_buffer(&buffer, 0, &[3; 64]).unwrap();
        {
            let mut recorder = device.create_command_recorder(None);
            recorder.clear_buffer(&buffer, 0, None).unwrap();
            device.queue().submit([recorder.finish().unwrap()]).unwrap();
        }

        let inner = Arc::downgrade(&device.0);
        drop(buffer);
        drop(device);
        assert!(inner.upgrade().is_none());
        engine.resume();
    }

    #[test]
    fn test_devices_have_separate_scopes() {
        let a = Device::builder(SoftwareEngine::new()).build();
        let b = Device::builder(SoftwareEngine::new()).build();
        a.push_error_scope(ErrorFilter::Validation);
        b.push_error_scope(ErrorFilter::Validation);
        let _ = b.create_buffer(&descriptor(0, BufferUsages::COPY_DST));
        assert_eq!(a.pop_error_scope(), Ok(None));
        assert!(b.pop_error_scope().unwrap().is_some());
        assert_ne!(a, b);
    }
}
