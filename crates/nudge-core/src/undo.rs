use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datetime::stamp_serde;
use crate::task::Task;

/// Default length of the undo window after a confirmed delete.
pub const DEFAULT_UNDO_WINDOW_SECS: i64 = 8;

/// A single-slot delayed action.
///
/// Holds at most one value together with the instant it expires. Nothing
/// fires on its own: the owner polls with the current time, which keeps the
/// state machine testable against a manual clock.
#[derive(Debug, Clone)]
pub struct DelayedSlot<T> {
    entry: Option<(T, DateTime<Utc>)>,
}

impl<T> Default for DelayedSlot<T> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<T> DelayedSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new countdown. A value already waiting in the slot is
    /// displaced and returned to the caller, who must treat it as expired.
    pub fn arm(&mut self, value: T, deadline: DateTime<Utc>) -> Option<T> {
        self.entry
            .replace((value, deadline))
            .map(|(previous, _)| previous)
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.entry.take().map(|(value, _)| value)
    }

    /// Takes the value once its deadline is reached.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<T> {
        let expired = matches!(&self.entry, Some((_, deadline)) if *deadline <= now);
        if expired {
            self.cancel()
        } else {
            None
        }
    }

    pub fn peek(&self) -> Option<(&T, DateTime<Utc>)> {
        self.entry.as_ref().map(|(value, deadline)| (value, *deadline))
    }

    pub fn is_armed(&self) -> bool {
        self.entry.is_some()
    }
}

/// A removed task waiting out its undo window, as persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tombstone {
    pub task: Task,
    #[serde(with = "stamp_serde")]
    pub deadline: DateTime<Utc>,
}

impl Tombstone {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn poll_waits_for_deadline() {
        let mut slot = DelayedSlot::new();
        slot.arm("a", t0() + Duration::seconds(8));

        assert_eq!(slot.poll(t0() + Duration::seconds(7)), None);
        assert!(slot.is_armed());
        assert_eq!(slot.poll(t0() + Duration::seconds(8)), Some("a"));
        assert!(!slot.is_armed());
        assert_eq!(slot.poll(t0() + Duration::seconds(9)), None);
    }

    #[test]
    fn arming_displaces_previous_value() {
        let mut slot = DelayedSlot::new();
        assert_eq!(slot.arm(1, t0()), None);
        assert_eq!(slot.arm(2, t0() + Duration::seconds(8)), Some(1));
        assert_eq!(slot.peek().map(|(v, _)| *v), Some(2));
    }

    #[test]
    fn cancel_empties_slot() {
        let mut slot = DelayedSlot::new();
        slot.arm("x", t0());
        assert_eq!(slot.cancel(), Some("x"));
        assert_eq!(slot.cancel(), None);
    }
}
