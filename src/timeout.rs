// Named one-shot deadlines used by the session state machine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Names for the deadlines the state machine arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum TimeoutKey {
    Sync,
    Stop,
    Drop,
}

/// Table of armed deadlines. Each key holds at most one deadline;
/// re-arming overwrites.
#[derive(Debug, Default)]
pub struct DeadlineTable {
    deadlines: HashMap<TimeoutKey, Instant>,
}

impl DeadlineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to expire `window` from now.
    pub fn arm(&mut self, key: TimeoutKey, window: Duration) {
        self.deadlines.insert(key, Instant::now() + window);
    }

    /// Whether `key` is armed and its deadline has passed. An unarmed key
    /// never reports expiry.
    pub fn expired(&self, key: TimeoutKey) -> bool {
        self.deadlines
            .get(&key)
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    pub fn disarm(&mut self, key: TimeoutKey) {
        self.deadlines.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_key_never_expires() {
        let table = DeadlineTable::new();
        assert!(!table.expired(TimeoutKey::Sync));
    }

    #[test]
    fn zero_window_expires_immediately() {
        let mut table = DeadlineTable::new();
        table.arm(TimeoutKey::Stop, Duration::ZERO);
        assert!(table.expired(TimeoutKey::Stop));
    }

    #[test]
    fn long_window_is_still_pending() {
        let mut table = DeadlineTable::new();
        table.arm(TimeoutKey::Drop, Duration::from_secs(3600));
        assert!(!table.expired(TimeoutKey::Drop));
    }

    #[test]
    fn disarm_clears_expiry() {
        let mut table = DeadlineTable::new();
        table.arm(TimeoutKey::Sync, Duration::ZERO);
        table.disarm(TimeoutKey::Sync);
        assert!(!table.expired(TimeoutKey::Sync));
    }

    #[test]
    fn rearming_replaces_deadline() {
        let mut table = DeadlineTable::new();
        table.arm(TimeoutKey::Sync, Duration::ZERO);
        table.arm(TimeoutKey::Sync, Duration::from_secs(3600));
        assert!(!table.expired(TimeoutKey::Sync));
    }
}
