//! Logical clock used to order mutations across devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Per-device Lamport-style clock.
///
/// `counter` never decreases and `device_id` never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalClock {
    timestamp: DateTime<Utc>,
    counter: u64,
    device_id: String,
}

impl LogicalClock {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            counter: 0,
            device_id: device_id.into(),
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Advance the clock for a local event and return the new stamp.
    pub fn tick(&mut self) -> ClockStamp {
        self.counter = self.counter.saturating_add(1);
        self.timestamp = Utc::now();
        self.stamp()
    }

    /// Merge a counter seen on a remote record.
    pub fn observe(&mut self, remote_counter: u64) {
        if remote_counter > self.counter {
            self.counter = remote_counter;
            self.timestamp = Utc::now();
        }
    }

    pub fn stamp(&self) -> ClockStamp {
        ClockStamp {
            counter: self.counter,
            device_id: self.device_id.clone(),
        }
    }
}

/// The `(counter, device_id)` pair attached to a version of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockStamp {
    pub counter: u64,
    pub device_id: String,
}

impl ClockStamp {
    pub fn new(counter: u64, device_id: impl Into<String>) -> Self {
        Self {
            counter,
            device_id: device_id.into(),
        }
    }

    /// Higher counter wins; on equal counters the lexically smaller device id wins.
    pub fn wins_over(&self, other: &ClockStamp) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// Total order where `Greater` means `self` takes precedence.
    pub fn precedence(&self, other: &ClockStamp) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| other.device_id.cmp(&self.device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_increments_counter() {
        let mut clock = LogicalClock::new("device-a");
        assert_eq!(clock.tick().counter, 1);
        assert_eq!(clock.tick().counter, 2);
        assert_eq!(clock.device_id(), "device-a");
    }

    #[test]
    fn test_observe_never_decreases() {
        let mut clock = LogicalClock::new("device-a");
        clock.observe(9);
        assert_eq!(clock.counter(), 9);
        clock.observe(3);
        assert_eq!(clock.counter(), 9);
        assert_eq!(clock.tick().counter, 10);
    }

    #[test]
    fn test_higher_counter_wins() {
        let incoming = ClockStamp::new(7, "device-z");
        let local = ClockStamp::new(5, "device-a");
        assert!(incoming.wins_over(&local));
        assert!(!local.wins_over(&incoming));
    }

    #[test]
    fn test_equal_counter_smaller_device_wins() {
        let a = ClockStamp::new(4, "device-a");
        let b = ClockStamp::new(4, "device-b");
        assert!(a.wins_over(&b));
        assert!(!b.wins_over(&a));
        assert!(!a.wins_over(&a.clone()));
    }
}
