//! Gated calls from async code.
//!
//! The arbitration core blocks OS threads while waiting for a turn and while
//! the driver talks to hardware. Calling it straight from a tokio task would
//! stall a runtime worker, so on the multi-threaded runtime these helpers hand
//! the current worker over to blocking duty with
//! [`tokio::task::block_in_place`] for the duration of the call. The handle
//! stays borrowed; no shared ownership is needed.
//!
//! A current-thread runtime has no other worker to take over, so there (and
//! outside any runtime) the call runs inline on the calling thread and blocks
//! it until the device is released.

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;
use tracing::trace;

use crate::channel::Channel;
use crate::device::{DeviceHandle, Driver};
use crate::error::AccessError;
use crate::gate::Gated;
use crate::ticket::Priority;

/// Run [`DeviceHandle::gate`] from an async context.
pub async fn gate_blocking<D, T, E, F>(
    handle: &DeviceHandle<D>,
    priority: Priority,
    body: F,
) -> Result<Gated<T>, E>
where
    D: Driver,
    F: FnOnce(&mut D) -> Result<T, E>,
    E: From<AccessError>,
{
    run_blocking(|| handle.gate(priority, body))
}

/// Run [`Channel::gate`] from an async context.
pub async fn channel_gate_blocking<D, T, E, F>(channel: Channel<'_, D>, body: F) -> Result<Gated<T>, E>
where
    D: Driver,
    F: FnOnce(&mut D) -> Result<T, E>,
    E: From<AccessError>,
{
    run_blocking(|| channel.gate(body))
}

fn run_blocking<R>(call: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|rt| rt.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => task::block_in_place(call),
        flavor => {
            trace!(?flavor, "Running gated call inline");
            call()
        }
    }
}
