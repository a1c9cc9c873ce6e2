//! Error types for device access arbitration.
//!
//! `AccessError` covers every failure the arbitration core itself can
//! produce. Instrument drivers keep their own error types; the only
//! requirement is `From<AccessError>` so gated calls can report admission
//! failures through the driver's error channel while driver I/O errors pass
//! through untouched.
//!
//! ## Error Hierarchy
//!
//! - **`Closed`**: a gated call was attempted after the device handle was
//!   closed.
//! - **`Busy`**: a guaranteed-priority call could not be enqueued (queue at
//!   capacity, or the submit timeout expired).
//! - **`Internal`**: a broken protocol invariant such as a double checkout or
//!   a lost ticket. These indicate a bug, never a runtime condition, and are
//!   not recovered from.
//! - **`InvalidPriority`**: a negative priority level was supplied.
//! - **`PriorityOutOfRange`**: a priority level above `u32::MAX` was supplied.

use thiserror::Error;

/// Convenience alias for results using the arbitration error type.
pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Failures raised by the arbitration core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The device connection has been closed.
    #[error("Device connection closed")]
    Closed,

    /// A guaranteed call could not be submitted to the device queue.
    #[error("Couldn't submit to device queue: {0}")]
    Busy(String),

    /// Protocol invariant violated inside the admission queue.
    #[error("Internal device queue error: {0}")]
    Internal(String),

    /// Priority levels must be non-negative.
    #[error("Negative priority level {0} given. Priority levels must be non-negative")]
    InvalidPriority(i64),

    /// Priority level does not fit the supported range.
    #[error("Priority level {0} exceeds the maximum of {max}", max = u32::MAX)]
    PriorityOutOfRange(i64),
}

impl AccessError {
    /// Build an [`AccessError::Internal`] from anything printable.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for invariant violations that must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}
