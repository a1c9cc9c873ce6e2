//! Per-session accessors onto a device handle.
//!
//! A [`Channel`] is what driver front-ends hand out to callers: one per axis,
//! sensor channel or call site, each carrying its own priority. It borrows
//! the handle and holds nothing else, so creating one per call is fine.

use std::fmt;
use std::time::Duration;

use crate::device::{DeviceHandle, Driver};
use crate::error::AccessError;
use crate::gate::Gated;
use crate::ticket::Priority;

/// Prioritized accessor borrowing a [`DeviceHandle`].
pub struct Channel<'a, D: Driver> {
    handle: &'a DeviceHandle<D>,
    index: usize,
    priority: Priority,
}

impl<'a, D: Driver> Channel<'a, D> {
    /// Create an accessor for channel `index`.
    pub fn new(handle: &'a DeviceHandle<D>, index: usize, priority: Priority) -> Self {
        Self {
            handle,
            index,
            priority,
        }
    }

    /// Same channel with a different priority.
    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Priority used for every call made through this accessor.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Channel/axis index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The borrowed handle.
    pub fn handle(&self) -> &'a DeviceHandle<D> {
        self.handle
    }

    /// Gated call at this accessor's priority.
    pub fn gate<T, E, F>(&self, body: F) -> Result<Gated<T>, E>
    where
        F: FnOnce(&mut D) -> Result<T, E>,
        E: From<AccessError>,
    {
        self.handle.gate(self.priority, body)
    }

    /// Polling loop at this accessor's priority with the handle's defaults.
    pub fn poll<T, E, F>(&self, probe: F) -> Result<Option<T>, E>
    where
        F: FnMut(&mut D) -> Result<Option<T>, E>,
        E: From<AccessError>,
    {
        self.handle.poll(self.priority, probe)
    }

    /// Wait using the handle's registered wait function.
    pub fn wait(&self, duration: Duration) {
        self.handle.wait(duration);
    }
}

impl<D: Driver> Clone for Channel<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Driver> Copy for Channel<'_, D> {}

impl<D: Driver> fmt::Debug for Channel<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("device", &self.handle.name())
            .field("index", &self.index)
            .field("priority", &self.priority)
            .finish()
    }
}
