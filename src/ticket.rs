//! Admission tickets and priority levels.
//!
//! A [`Ticket`] is what the admission queue actually sorts. Its sort key is
//! the negated priority so that the smallest ticket is always the most
//! urgent; ties are broken by the arrival index handed out by the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AccessError;

/// Priority level of a gated call.
///
/// Higher numbers are served first. Level zero is the best-effort level:
/// such calls are skipped instead of queued when the device is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    /// Best-effort level (the null key).
    pub const BEST_EFFORT: Priority = Priority(0);

    /// Create a priority level.
    pub const fn new(level: u32) -> Self {
        Self(level)
    }

    /// Raw priority level.
    pub const fn level(self) -> u32 {
        self.0
    }

    /// Whether this is the best-effort level.
    pub const fn is_best_effort(self) -> bool {
        self.0 == 0
    }

    /// Sort key used by the admission queue: the negated level.
    pub const fn sort_key(self) -> i64 {
        -(self.0 as i64)
    }
}

impl From<u32> for Priority {
    fn from(level: u32) -> Self {
        Self(level)
    }
}

impl TryFrom<i64> for Priority {
    type Error = AccessError;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        if level < 0 {
            return Err(AccessError::InvalidPriority(level));
        }
        u32::try_from(level)
            .map(Priority)
            .map_err(|_| AccessError::PriorityOutOfRange(level))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}

/// Sort key reserved for best-effort requests.
pub const NULL_KEY: i64 = Priority::BEST_EFFORT.sort_key();

/// An admission request.
///
/// Ordering is lexicographic on `(sort_key, index)`, which the field order
/// of the derive below encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket {
    sort_key: i64,
    index: u64,
}

impl Ticket {
    /// Build a ticket from a raw sort key and arrival index.
    ///
    /// Only the admission queue hands out arrival indices; constructing
    /// tickets by hand is useful for tests and inspection.
    pub const fn new(sort_key: i64, index: u64) -> Self {
        Self { sort_key, index }
    }

    /// Build a ticket for a priority level.
    pub const fn for_priority(priority: Priority, index: u64) -> Self {
        Self::new(priority.sort_key(), index)
    }

    /// Sort key of this ticket.
    pub const fn sort_key(&self) -> i64 {
        self.sort_key
    }

    /// Arrival index of this ticket.
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Whether this ticket carries the null key.
    pub const fn is_best_effort(&self) -> bool {
        self.sort_key == NULL_KEY
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, #{})", self.sort_key, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_is_negated_priority() {
        assert_eq!(Priority::new(5).sort_key(), -5);
        assert_eq!(Priority::BEST_EFFORT.sort_key(), NULL_KEY);
        assert_eq!(Priority::new(u32::MAX).sort_key(), -(u32::MAX as i64));
    }

    #[test]
    fn test_same_priority_orders_by_arrival() {
        let first = Ticket::for_priority(Priority::new(9), 0);
        let second = Ticket::for_priority(Priority::new(9), 1);
        assert!(first < second);
    }

    #[test]
    fn test_higher_priority_sorts_first_regardless_of_arrival() {
        let late_high = Ticket::for_priority(Priority::new(9), 10);
        let early_low = Ticket::for_priority(Priority::new(1), 0);
        assert!(late_high < early_low);

        let mut tickets = vec![early_low, late_high];
        tickets.sort();
        assert_eq!(tickets, vec![late_high, early_low]);
    }

    #[test]
    fn test_negative_priority_rejected() {
        assert_eq!(Priority::try_from(-1i64), Err(AccessError::InvalidPriority(-1)));
        assert_eq!(Priority::try_from(3i64), Ok(Priority::new(3)));
    }

    #[test]
    fn test_oversized_priority_reports_range() {
        let too_big = i64::from(u32::MAX) + 1;
        let err = Priority::try_from(too_big).unwrap_err();
        assert_eq!(err, AccessError::PriorityOutOfRange(too_big));
        assert!(!err.to_string().contains("Negative"));
        assert_eq!(
            Priority::try_from(i64::from(u32::MAX)),
            Ok(Priority::new(u32::MAX))
        );
    }

    #[test]
    fn test_best_effort_ticket() {
        assert!(Ticket::for_priority(Priority::BEST_EFFORT, 4).is_best_effort());
        assert!(!Ticket::for_priority(Priority::new(1), 4).is_best_effort());
    }
}
