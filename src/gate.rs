//! Guarded-call protocol wrapping every device operation.
//!
//! [`guarded_call`] admits one call through an [`AdmissionQueue`]:
//!
//! 1. a closed queue fails the call with [`AccessError::Closed`];
//! 2. a best-effort call (priority 0) is skipped when anything is pending,
//!    checked and submitted under a single lock acquisition;
//! 3. a ticket is submitted; rejection skips best-effort calls and fails
//!    guaranteed ones;
//! 4. the caller waits until its ticket is the head and nothing is in flight;
//! 5. the ticket is checked out;
//! 6. the body runs with the queue unlocked;
//! 7. the operation is completed whatever the body did, including panicking.
//!
//! Errors returned by the body are handed back unchanged.

use std::time::Instant;
use tracing::{error, trace};

use crate::error::{AccessError, AccessResult};
use crate::queue::{AdmissionQueue, Rejected, SubmitMode};
use crate::ticket::{Priority, Ticket};

/// Outcome of a gated call.
///
/// `Skipped` is a normal, frequent outcome for best-effort callers under
/// load and is never confused with a value returned by the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum Gated<T> {
    /// The body ran and returned this value.
    Done(T),
    /// Best-effort call skipped because the device was busy.
    Skipped,
}

impl<T> Gated<T> {
    /// Whether the call was skipped.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Gated::Skipped)
    }

    /// Whether the body ran.
    pub fn is_done(&self) -> bool {
        matches!(self, Gated::Done(_))
    }

    /// The body's value, if it ran.
    pub fn done(self) -> Option<T> {
        match self {
            Gated::Done(value) => Some(value),
            Gated::Skipped => None,
        }
    }

    /// Map the body's value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Gated<U> {
        match self {
            Gated::Done(value) => Gated::Done(f(value)),
            Gated::Skipped => Gated::Skipped,
        }
    }
}

impl<T> From<Gated<T>> for Option<T> {
    fn from(gated: Gated<T>) -> Self {
        gated.done()
    }
}

/// Completes the in-flight operation on every exit path, unwinding included.
struct Completion<'a> {
    queue: &'a AdmissionQueue,
    ticket: Ticket,
    armed: bool,
}

impl<'a> Completion<'a> {
    fn new(queue: &'a AdmissionQueue, ticket: Ticket) -> Self {
        Self {
            queue,
            ticket,
            armed: true,
        }
    }

    fn finish(mut self) -> AccessResult<()> {
        self.armed = false;
        self.queue.complete()
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.queue.complete() {
                error!(ticket = %self.ticket, error = %e, "Failed to complete operation after panic");
            }
        }
    }
}

/// Run `body` with exclusive access arbitrated by `queue`.
///
/// `submit_mode` applies to guaranteed calls only; best-effort calls never
/// wait for a capacity slot. Returns [`Gated::Skipped`] for best-effort calls
/// that could not be admitted. The body must not call back into a gate on
/// the same queue.
///
/// # Errors
///
/// - [`AccessError::Closed`] if the queue is closed.
/// - [`AccessError::Busy`] if a guaranteed call could not be enqueued.
/// - [`AccessError::Internal`] on a broken queue invariant.
/// - Whatever the body returns, unchanged.
pub fn guarded_call<T, E, F>(
    queue: &AdmissionQueue,
    priority: Priority,
    submit_mode: SubmitMode,
    body: F,
) -> Result<Gated<T>, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<AccessError>,
{
    let Some(ticket) = admit(queue, priority, submit_mode)? else {
        return Ok(Gated::Skipped);
    };

    let completion = Completion::new(queue, ticket);
    let started = Instant::now();
    let result = body();
    let completed = completion.finish();
    trace!(%ticket, elapsed = ?started.elapsed(), ok = result.is_ok(), "Gated call finished");

    match result {
        Ok(value) => {
            completed?;
            Ok(Gated::Done(value))
        }
        Err(e) => {
            if let Err(internal) = completed {
                error!(%ticket, error = %internal, "Queue invariant broken while propagating driver error");
            }
            Err(e)
        }
    }
}

/// Steps 1 to 5: returns the checked-out ticket, or `None` to skip.
fn admit(
    queue: &AdmissionQueue,
    priority: Priority,
    submit_mode: SubmitMode,
) -> AccessResult<Option<Ticket>> {
    let mut guard = queue.lock();
    if guard.is_closed() {
        return Err(AccessError::Closed);
    }

    let sort_key = priority.sort_key();
    let submitted = if priority.is_best_effort() {
        guard.submit_if_idle(sort_key)
    } else {
        guard.submit(sort_key, submit_mode).map(Some)
    };

    let ticket = match submitted {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            trace!(pending = guard.len(), "Best-effort call skipped, device busy");
            return Ok(None);
        }
        Err(rejected) if priority.is_best_effort() => {
            trace!(reason = %rejected, "Best-effort call skipped, submit rejected");
            return Ok(None);
        }
        Err(Rejected::Closed) => return Err(AccessError::Closed),
        Err(rejected) => return Err(AccessError::Busy(rejected.to_string())),
    };

    loop {
        if !guard.contains(&ticket) {
            error!(%ticket, "Submitted ticket vanished from the device queue");
            return Err(AccessError::internal("an item has been lost"));
        }
        if guard.peek_head() == Some(ticket) && !guard.in_flight() {
            break;
        }
        guard.wait();
    }

    let admitted = guard.checkout()?;
    debug_assert_eq!(admitted, ticket);
    Ok(Some(ticket))
}
