//! Priority-ordered admission queue for exclusive device access.
//!
//! The queue pairs an ordered ticket set with a single mutex/condvar. All
//! bookkeeping (submit, checkout, complete, drain checks) happens under that
//! mutex; device I/O never does. Callers either use the self-locking methods
//! on [`AdmissionQueue`], or take the lock explicitly with
//! [`AdmissionQueue::lock`] to combine several steps atomically, which is how
//! the access gate performs its check-then-submit and turn waiting.
//!
//! # Invariants
//!
//! - At most one ticket is checked out (in flight) at any instant.
//! - `closed` only ever goes from `false` to `true`.
//! - The arrival index only increases and is never reused.
//!
//! # Example
//!
//! ```
//! use daq_arbiter::queue::{AdmissionQueue, SubmitMode};
//! use daq_arbiter::ticket::Priority;
//!
//! let queue = AdmissionQueue::new();
//! let low = queue.submit(Priority::new(1).sort_key(), SubmitMode::NonBlocking).unwrap();
//! let high = queue.submit(Priority::new(5).sort_key(), SubmitMode::NonBlocking).unwrap();
//! assert_eq!(queue.peek_head(), Some(high));
//!
//! assert_eq!(queue.checkout().unwrap(), high);
//! queue.complete().unwrap();
//! assert_eq!(queue.peek_head(), Some(low));
//! ```

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, trace};

use crate::error::{AccessError, AccessResult};
use crate::ticket::Ticket;

/// How `submit` behaves when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Reject immediately.
    NonBlocking,
    /// Wait for a free slot without limit.
    #[default]
    Blocking,
    /// Wait for a free slot for at most the given duration.
    Timeout(Duration),
}

/// Why a submission was refused. No ticket is enqueued in any case.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The queue has been closed.
    #[error("queue closed")]
    Closed,
    /// The queue is at capacity and the submission was non-blocking.
    #[error("queue full")]
    Full,
    /// The queue stayed at capacity until the submit timeout expired.
    #[error("timed out waiting for a free queue slot")]
    TimedOut,
}

/// Bookkeeping guarded by the queue mutex.
#[derive(Debug, Default)]
pub struct QueueState {
    pending: BTreeSet<Ticket>,
    closed: bool,
    in_flight: bool,
    next_index: u64,
    /// Upper bound on pending tickets; 0 means unbounded.
    capacity: usize,
    completed: u64,
}

impl QueueState {
    /// Lowest-ordered pending ticket.
    pub fn peek_head(&self) -> Option<Ticket> {
        self.pending.first().copied()
    }

    /// Whether `ticket` is still pending.
    pub fn contains(&self, ticket: &Ticket) -> bool {
        self.pending.contains(ticket)
    }

    /// Number of pending tickets.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when no ticket is pending. An in-flight operation does not count.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True when a bounded queue has no free slot.
    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.pending.len() >= self.capacity
    }

    /// Whether the queue rejects new submissions.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether an operation is currently checked out.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Arrival index the next accepted ticket will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Capacity limit (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pending tickets plus the in-flight one, if any.
    pub fn unfinished(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight)
    }

    /// True once everything submitted so far has completed.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && !self.in_flight
    }

    /// Snapshot for diagnostics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            in_flight: self.in_flight,
            closed: self.closed,
            next_index: self.next_index,
            capacity: self.capacity,
            completed: self.completed,
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tickets waiting for their turn
    pub pending: usize,
    /// Whether an operation body is executing
    pub in_flight: bool,
    /// Whether submissions are rejected
    pub closed: bool,
    /// Next arrival index
    pub next_index: u64,
    /// Capacity limit (0 = unbounded)
    pub capacity: usize,
    /// Operations completed since creation
    pub completed: u64,
}

/// Thread-safe priority queue gating access to one device.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl AdmissionQueue {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue holding at most `capacity` pending tickets (0 = unbounded).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                capacity,
                ..QueueState::default()
            }),
            changed: Condvar::new(),
        }
    }

    /// Take the queue lock.
    ///
    /// The guard dereferences to [`QueueState`] for inspection and exposes the
    /// mutating primitives. It must not be held across device I/O.
    pub fn lock(&self) -> AdmissionGuard<'_> {
        AdmissionGuard {
            state: self.state.lock(),
            changed: &self.changed,
        }
    }

    /// See [`AdmissionGuard::submit`].
    pub fn submit(&self, sort_key: i64, mode: SubmitMode) -> Result<Ticket, Rejected> {
        self.lock().submit(sort_key, mode)
    }

    /// See [`AdmissionGuard::submit_if_idle`].
    pub fn submit_if_idle(&self, sort_key: i64) -> Result<Option<Ticket>, Rejected> {
        self.lock().submit_if_idle(sort_key)
    }

    /// Lowest-ordered pending ticket, without removing it.
    pub fn peek_head(&self) -> Option<Ticket> {
        self.lock().peek_head()
    }

    /// See [`AdmissionGuard::checkout`].
    pub fn checkout(&self) -> AccessResult<Ticket> {
        self.lock().checkout()
    }

    /// See [`AdmissionGuard::complete`].
    pub fn complete(&self) -> AccessResult<()> {
        self.lock().complete()
    }

    /// Reject all further submissions. Idempotent.
    pub fn close(&self) {
        self.lock().close();
    }

    /// See [`AdmissionGuard::wait_until`].
    pub fn wait_until<P>(&self, predicate: P, timeout: Option<Duration>) -> bool
    where
        P: FnMut(&QueueState) -> bool,
    {
        self.lock().wait_until(predicate, timeout)
    }

    /// Block until nothing is pending and nothing is in flight.
    pub fn drain(&self) {
        self.lock().drain();
    }

    /// Change the capacity limit (0 = unbounded).
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().set_capacity(capacity);
    }

    /// Number of pending tickets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no ticket is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True when a bounded queue has no free slot.
    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    /// Whether an operation is checked out.
    pub fn in_flight(&self) -> bool {
        self.lock().in_flight()
    }

    /// Capacity limit (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Pending plus in-flight operations.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished()
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }
}

/// Held lock on an [`AdmissionQueue`].
pub struct AdmissionGuard<'a> {
    state: MutexGuard<'a, QueueState>,
    changed: &'a Condvar,
}

impl Deref for AdmissionGuard<'_> {
    type Target = QueueState;

    fn deref(&self) -> &QueueState {
        &self.state
    }
}

impl AdmissionGuard<'_> {
    /// Insert a ticket with the next arrival index.
    ///
    /// Refused when the queue is closed, or when it is at capacity and
    /// `mode` does not allow waiting (long enough) for a slot. Waiting
    /// releases the lock. A refused submission leaves the queue and the
    /// arrival counter untouched.
    pub fn submit(&mut self, sort_key: i64, mode: SubmitMode) -> Result<Ticket, Rejected> {
        if self.state.closed {
            return Err(Rejected::Closed);
        }

        if self.state.is_full() {
            let deadline = match mode {
                SubmitMode::NonBlocking => return Err(Rejected::Full),
                SubmitMode::Blocking => None,
                SubmitMode::Timeout(timeout) => Instant::now().checked_add(timeout),
            };

            // An unrepresentable deadline degrades to an unbounded wait.
            while self.state.is_full() && !self.state.closed {
                match deadline {
                    Some(deadline) => {
                        if self.changed.wait_until(&mut self.state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.changed.wait(&mut self.state),
                }
            }

            if self.state.closed {
                return Err(Rejected::Closed);
            }
            if self.state.is_full() {
                trace!(sort_key, capacity = self.state.capacity, "Submit timed out");
                return Err(Rejected::TimedOut);
            }
        }

        Ok(self.insert(sort_key))
    }

    /// Submit only if nothing is pending, as one atomic step.
    ///
    /// Returns `Ok(None)` when the queue is non-empty; nothing is enqueued in
    /// that case. Never waits for capacity.
    pub fn submit_if_idle(&mut self, sort_key: i64) -> Result<Option<Ticket>, Rejected> {
        if self.state.closed {
            return Err(Rejected::Closed);
        }
        if !self.state.is_empty() {
            return Ok(None);
        }
        self.submit(sort_key, SubmitMode::NonBlocking).map(Some)
    }

    fn insert(&mut self, sort_key: i64) -> Ticket {
        let ticket = Ticket::new(sort_key, self.state.next_index);
        self.state.next_index += 1;
        self.state.pending.insert(ticket);
        trace!(%ticket, pending = self.state.pending.len(), "Ticket submitted");
        self.changed.notify_all();
        ticket
    }

    /// Remove the head ticket and mark it in flight.
    ///
    /// Fails with [`AccessError::Internal`] if an operation is already in
    /// flight or nothing is pending.
    pub fn checkout(&mut self) -> AccessResult<Ticket> {
        if self.state.in_flight {
            error!("Checkout attempted while a task is still pending");
            return Err(AccessError::internal(
                "cannot check out a ticket while another operation is in flight",
            ));
        }
        let Some(ticket) = self.state.pending.pop_first() else {
            error!("Checkout attempted on an empty queue");
            return Err(AccessError::internal("cannot check out from an empty queue"));
        };
        self.state.in_flight = true;
        trace!(%ticket, "Ticket checked out");
        // A slot was freed for capacity-blocked submitters.
        self.changed.notify_all();
        Ok(ticket)
    }

    /// Mark the in-flight operation finished and wake every waiter.
    ///
    /// Fails with [`AccessError::Internal`] if nothing is in flight.
    pub fn complete(&mut self) -> AccessResult<()> {
        if !self.state.in_flight {
            error!("Complete called with no task in flight");
            return Err(AccessError::internal(
                "cannot mark an operation done with none in flight",
            ));
        }
        self.state.in_flight = false;
        self.state.completed += 1;
        trace!(completed = self.state.completed, "Operation completed");
        self.changed.notify_all();
        Ok(())
    }

    /// Reject all further submissions. Idempotent.
    ///
    /// Waiters are notified so that capacity-blocked submitters observe the
    /// flag; already pending tickets keep their place.
    pub fn close(&mut self) {
        if !self.state.closed {
            self.state.closed = true;
            self.changed.notify_all();
        }
    }

    /// Change the capacity limit (0 = unbounded).
    pub fn set_capacity(&mut self, capacity: usize) {
        self.state.capacity = capacity;
        self.changed.notify_all();
    }

    /// Wait for the next notification, releasing the lock meanwhile.
    pub fn wait(&mut self) {
        self.changed.wait(&mut self.state);
    }

    /// Block until `predicate` holds or `timeout` elapses.
    ///
    /// The predicate is evaluated under the lock; the lock is released while
    /// waiting. Returns whether the predicate was satisfied.
    pub fn wait_until<P>(&mut self, mut predicate: P, timeout: Option<Duration>) -> bool
    where
        P: FnMut(&QueueState) -> bool,
    {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while !predicate(&self.state) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut self.state, deadline).timed_out() {
                        return predicate(&self.state);
                    }
                }
                None => self.changed.wait(&mut self.state),
            }
        }
        true
    }

    /// Block until nothing is pending and nothing is in flight.
    pub fn drain(&mut self) {
        self.wait_until(QueueState::is_drained, None);
    }
}
