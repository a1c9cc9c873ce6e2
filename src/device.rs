//! Device handle: lifecycle, gated access and the pluggable wait hook.
//!
//! A [`DeviceHandle`] owns the driver for one physical instrument together
//! with the admission queue that serializes access to it. Every
//! device-touching call goes through [`DeviceHandle::gate`] (directly or via
//! a [`Channel`]), which runs the body with exclusive `&mut` access to the
//! driver once the call's ticket is admitted.
//!
//! # Lifecycle
//!
//! `open` → *Open* → `close` → *Closed*. Closing is terminal: it rejects new
//! submissions, waits for already admitted work to finish, then calls the
//! driver's `close` exactly once. A closed instrument needs a new handle.
//!
//! # Example
//!
//! ```
//! use daq_arbiter::device::DeviceHandle;
//! use daq_arbiter::mock::MockInstrument;
//! use daq_arbiter::ticket::Priority;
//!
//! let handle = DeviceHandle::open_default(MockInstrument::new("stage", 2))?;
//! let axis = handle.channel_at(1, Priority::new(2));
//!
//! axis.gate(|dev| dev.set(axis.index(), "position", 3.5))?;
//! let position = axis.gate(|dev| dev.get(axis.index(), "position"))?;
//! assert_eq!(position.done(), Some(3.5));
//!
//! handle.close()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::{ArbiterConfig, PollingConfig};
use crate::error::{AccessError, AccessResult};
use crate::gate::{guarded_call, Gated};
use crate::queue::{AdmissionQueue, QueueStats, SubmitMode};
use crate::ticket::Priority;

/// Transport-level collaborator driven by a [`DeviceHandle`].
///
/// Implementations translate typed requests into the instrument's protocol.
/// `open` and `close` are each invoked exactly once by the handle.
pub trait Driver: Send {
    /// Driver error type. Admission failures are reported through it.
    type Error: From<AccessError> + fmt::Display;

    /// Establish the connection.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Tear the connection down.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Name used in log output.
    fn name(&self) -> &str {
        "device"
    }
}

/// Blocking wait primitive used between polling iterations.
pub type WaitFn = Arc<dyn Fn(Duration) + Send + Sync>;

fn default_wait_fn() -> WaitFn {
    Arc::new(thread::sleep)
}

/// Exclusive-access handle to one instrument.
pub struct DeviceHandle<D: Driver> {
    name: String,
    queue: AdmissionQueue,
    driver: Mutex<D>,
    open: AtomicBool,
    closing: Mutex<()>,
    wait_fn: RwLock<WaitFn>,
    submit_mode: SubmitMode,
    polling: PollingConfig,
}

impl<D: Driver> DeviceHandle<D> {
    /// Open `driver` and wrap it in a handle configured by `config`.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if opening fails; no handle is created.
    pub fn open(mut driver: D, config: &ArbiterConfig) -> Result<Self, D::Error> {
        let name = driver.name().to_string();
        debug!(device = %name, capacity = config.queue.capacity, "Opening device");
        driver.open()?;
        info!(device = %name, "Device opened");

        Ok(Self {
            name,
            queue: AdmissionQueue::with_capacity(config.queue.capacity),
            driver: Mutex::new(driver),
            open: AtomicBool::new(true),
            closing: Mutex::new(()),
            wait_fn: RwLock::new(default_wait_fn()),
            submit_mode: config.queue.submit_mode(),
            polling: config.polling.clone(),
        })
    }

    /// Open with the default configuration.
    pub fn open_default(driver: D) -> Result<Self, D::Error> {
        Self::open(driver, &ArbiterConfig::default())
    }

    /// Device name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether the handle has been closed (or is being closed).
    pub fn is_closed(&self) -> bool {
        !self.is_open() || self.queue.is_closed()
    }

    /// Admission queue, for drivers needing the raw primitives.
    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Submit mode used for guaranteed calls.
    pub fn submit_mode(&self) -> SubmitMode {
        self.submit_mode
    }

    /// Run `body` with exclusive access to the driver.
    ///
    /// See [`guarded_call`] for the admission protocol. The body must not
    /// call back into this handle's gate.
    pub fn gate<T, E, F>(&self, priority: Priority, body: F) -> Result<Gated<T>, E>
    where
        F: FnOnce(&mut D) -> Result<T, E>,
        E: From<AccessError>,
    {
        guarded_call(&self.queue, priority, self.submit_mode, || {
            let mut driver = self.driver.lock();
            body(&mut *driver)
        })
    }

    /// Repeat a gated `probe` until it yields a value.
    ///
    /// Between attempts the registered wait function is called with
    /// `interval`. A skipped best-effort probe counts as an attempt. Returns
    /// `Ok(None)` once `max_attempts` probes produced nothing.
    pub fn poll_until<T, E, F>(
        &self,
        priority: Priority,
        interval: Duration,
        max_attempts: usize,
        mut probe: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut(&mut D) -> Result<Option<T>, E>,
        E: From<AccessError>,
    {
        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.wait(interval);
            }
            if let Gated::Done(Some(value)) = self.gate(priority, &mut probe)? {
                debug!(device = %self.name, attempt, "Poll condition reached");
                return Ok(Some(value));
            }
        }
        debug!(device = %self.name, max_attempts, "Poll gave up");
        Ok(None)
    }

    /// [`poll_until`](Self::poll_until) with the configured polling defaults.
    pub fn poll<T, E, F>(&self, priority: Priority, probe: F) -> Result<Option<T>, E>
    where
        F: FnMut(&mut D) -> Result<Option<T>, E>,
        E: From<AccessError>,
    {
        self.poll_until(
            priority,
            self.polling.interval(),
            self.polling.max_attempts,
            probe,
        )
    }

    /// Wait for `duration` using the registered wait function.
    ///
    /// Drivers call this while waiting for hardware state changes, so an
    /// integration can substitute a wait that keeps its event loop running.
    pub fn wait(&self, duration: Duration) {
        let wait_fn = self.wait_fn.read().clone();
        wait_fn(duration);
    }

    /// Replace the wait function.
    pub fn register_wait_fn<F>(&self, wait_fn: F)
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        *self.wait_fn.write() = Arc::new(wait_fn);
    }

    /// Restore the default wait function (`std::thread::sleep`).
    pub fn reset_wait_fn(&self) {
        *self.wait_fn.write() = default_wait_fn();
    }

    /// Accessor with the given priority.
    pub fn channel(&self, priority: Priority) -> Channel<'_, D> {
        Channel::new(self, 0, priority)
    }

    /// Accessor for channel/axis `index` with the given priority.
    pub fn channel_at(&self, index: usize, priority: Priority) -> Channel<'_, D> {
        Channel::new(self, index, priority)
    }

    /// Accessor from a signed priority level.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidPriority`] for negative levels.
    pub fn try_channel_at(&self, index: usize, level: i64) -> AccessResult<Channel<'_, D>> {
        Ok(Channel::new(self, index, Priority::try_from(level)?))
    }

    /// Close the device. Idempotent.
    ///
    /// Rejects new submissions, blocks until every admitted call has
    /// finished, then closes the driver. Concurrent callers wait for the
    /// first one; later calls return `Ok(())` without side effects.
    ///
    /// # Errors
    ///
    /// Returns the driver's close error. The handle is closed regardless.
    pub fn close(&self) -> Result<(), D::Error> {
        let _closing = self.closing.lock();
        if !self.is_open() {
            return Ok(());
        }

        debug!(device = %self.name, pending = self.queue.unfinished(), "Closing device");
        self.queue.close();
        self.queue.drain();

        let result = self.driver.lock().close();
        self.open.store(false, Ordering::Release);

        match &result {
            Ok(()) => info!(device = %self.name, "Device closed"),
            Err(e) => warn!(device = %self.name, error = %e, "Device closed with error"),
        }
        result
    }
}

impl<D: Driver> Drop for DeviceHandle<D> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(device = %self.name, error = %e, "Failed to close device on drop");
            }
        }
    }
}

impl<D: Driver> fmt::Debug for DeviceHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("queue", &self.queue.stats())
            .finish()
    }
}
