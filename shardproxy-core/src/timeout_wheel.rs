//! The timeout wheel (§4.H): earliest-deadline lookup for per-request
//! server timeouts. A `BTreeMap` keyed by `(deadline, msg_id)` gives O(log n)
//! insert/remove and an O(log n) minimum-key query via `first_key_value` —
//! the idiomatic Rust realization of "ordered tree" here; no pack example
//! rolls a custom red-black tree, and std's ordered map is exactly the
//! right tool; see DESIGN.md.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::conn::ConnId;
use crate::message::MsgId;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutEntry {
    pub msg_id: MsgId,
    pub conn_id: ConnId,
}

#[derive(Debug, Default)]
pub struct TimeoutWheel {
    by_deadline: BTreeMap<(Instant, MsgId), TimeoutEntry>,
}

impl TimeoutWheel {
    pub fn new() -> Self {
        TimeoutWheel {
            by_deadline: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, deadline: Instant, msg_id: MsgId, conn_id: ConnId) {
        self.by_deadline
            .insert((deadline, msg_id), TimeoutEntry { msg_id, conn_id });
    }

    pub fn remove(&mut self, deadline: Instant, msg_id: MsgId) {
        self.by_deadline.remove(&(deadline, msg_id));
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry whose deadline has passed `now`, in
    /// deadline order.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimeoutEntry> {
        let expired_keys: Vec<(Instant, MsgId)> = self
            .by_deadline
            .range(..=(now, MsgId(u64::MAX)))
            .map(|(k, _)| *k)
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| self.by_deadline.remove(&k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Token;
    use std::time::Duration;

    #[test]
    fn drains_only_expired_entries_in_deadline_order() {
        let mut wheel = TimeoutWheel::new();
        let base = Instant::now();
        let conn = ConnId(Token(1));
        wheel.insert(base + Duration::from_millis(10), MsgId(1), conn);
        wheel.insert(base + Duration::from_millis(5), MsgId(2), conn);
        wheel.insert(base + Duration::from_millis(50), MsgId(3), conn);

        let expired = wheel.drain_expired(base + Duration::from_millis(20));
        let ids: Vec<u64> = expired.iter().map(|e| e.msg_id.0).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(wheel.earliest_deadline(), Some(base + Duration::from_millis(50)));
    }

    #[test]
    fn remove_before_expiry_prevents_timeout() {
        let mut wheel = TimeoutWheel::new();
        let base = Instant::now();
        let conn = ConnId(Token(1));
        let deadline = base + Duration::from_millis(10);
        wheel.insert(deadline, MsgId(1), conn);
        wheel.remove(deadline, MsgId(1));
        assert!(wheel.is_empty());
        assert!(wheel.drain_expired(base + Duration::from_millis(20)).is_empty());
    }
}
