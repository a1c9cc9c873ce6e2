//! Mock instrument for testing without physical hardware.
//!
//! [`MockInstrument`] simulates a multi-axis positioner with per-axis
//! attributes, moves that settle after a number of status polls, optional
//! per-call latency and injectable faults. Lifecycle and operation counts
//! are exposed through shared [`MockCounters`] so tests can observe the
//! driver after it has been moved into a [`DeviceHandle`](crate::device::DeviceHandle).

use anyhow::{anyhow, bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::device::Driver;

/// Shared call counters of a [`MockInstrument`].
#[derive(Debug, Default)]
pub struct MockCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    operations: AtomicUsize,
}

impl MockCounters {
    /// Times the driver was opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Times the driver was closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Attribute and motion operations performed.
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct MockAxis {
    attributes: HashMap<String, f64>,
    target: f64,
    settle_polls: u32,
}

impl MockAxis {
    fn new() -> Self {
        let attributes = [("position", 0.0), ("voltage", 0.0), ("frequency", 1000.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            attributes,
            target: 0.0,
            settle_polls: 0,
        }
    }
}

/// Simulated multi-axis instrument.
///
/// # Example
///
/// ```
/// use daq_arbiter::device::Driver;
/// use daq_arbiter::mock::MockInstrument;
///
/// let mut stage = MockInstrument::new("stage", 1);
/// stage.open()?;
/// stage.start_move(0, 2.0, 1)?;
/// assert!(stage.is_moving(0)?);
/// assert!(!stage.is_moving(0)?);
/// assert_eq!(stage.get(0, "position")?, 2.0);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct MockInstrument {
    name: String,
    axes: Vec<MockAxis>,
    counters: Arc<MockCounters>,
    latency: Duration,
    faults: HashSet<String>,
    fail_open: bool,
    fail_close: bool,
    connected: bool,
}

impl MockInstrument {
    /// Create an instrument with `axes` axes.
    pub fn new(name: impl Into<String>, axes: usize) -> Self {
        Self {
            name: name.into(),
            axes: vec![MockAxis::new(); axes],
            counters: Arc::new(MockCounters::default()),
            latency: Duration::ZERO,
            faults: HashSet::new(),
            fail_open: false,
            fail_close: false,
            connected: false,
        }
    }

    /// Sleep this long inside every operation to simulate slow I/O.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every access to `attribute` fail with a communication error.
    pub fn with_fault(mut self, attribute: impl Into<String>) -> Self {
        self.faults.insert(attribute.into());
        self
    }

    /// Make `open` fail.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Make `close` fail.
    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Shared counters, valid after the instrument is moved into a handle.
    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Number of axes.
    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    fn access(&mut self, axis: usize, attribute: &str) -> Result<&mut MockAxis> {
        if !self.connected {
            bail!("[{}] device not connected", self.name);
        }
        if self.faults.contains(attribute) {
            bail!("[{}] communication with device failed ({})", self.name, attribute);
        }
        self.counters.operations.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let name = &self.name;
        self.axes
            .get_mut(axis)
            .ok_or_else(|| anyhow!("[{}] axis {} out of range", name, axis))
    }

    /// Read an attribute of `axis`.
    pub fn get(&mut self, axis: usize, attribute: &str) -> Result<f64> {
        let name = self.name.clone();
        let state = self.access(axis, attribute)?;
        state
            .attributes
            .get(attribute)
            .copied()
            .ok_or_else(|| anyhow!("[{}] unknown attribute '{}'", name, attribute))
    }

    /// Write an attribute of `axis`.
    pub fn set(&mut self, axis: usize, attribute: &str, value: f64) -> Result<()> {
        let state = self.access(axis, attribute)?;
        state.attributes.insert(attribute.to_string(), value);
        debug!(axis, attribute, value, "Mock attribute set");
        Ok(())
    }

    /// Start a move that reports motion for the next `settle_polls` status polls.
    pub fn start_move(&mut self, axis: usize, target: f64, settle_polls: u32) -> Result<()> {
        let state = self.access(axis, "position")?;
        state.target = target;
        state.settle_polls = settle_polls;
        if settle_polls == 0 {
            state.attributes.insert("position".to_string(), target);
        }
        Ok(())
    }

    /// Poll motion status; the move completes when its polls run out.
    pub fn is_moving(&mut self, axis: usize) -> Result<bool> {
        let state = self.access(axis, "position")?;
        if state.settle_polls == 0 {
            return Ok(false);
        }
        state.settle_polls -= 1;
        if state.settle_polls == 0 {
            let target = state.target;
            state.attributes.insert("position".to_string(), target);
        }
        Ok(true)
    }

    /// Abort a move, leaving the axis where it is.
    pub fn stop(&mut self, axis: usize) -> Result<()> {
        let state = self.access(axis, "position")?;
        state.settle_polls = 0;
        Ok(())
    }
}

impl Driver for MockInstrument {
    type Error = anyhow::Error;

    fn open(&mut self) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            bail!("[{}] failed to open connection", self.name);
        }
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        if self.fail_close {
            bail!("[{}] failed to close connection", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
