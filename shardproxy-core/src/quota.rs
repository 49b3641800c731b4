//! The per-pool token bucket quota gate (§4.J). Gates request admission:
//! each admitted request consumes one token and is marked `ticket`; a
//! periodic timer refills `token` back up to `quota` and resets warning
//! counters. Counters that are only ever read back by the stats thread use
//! `AtomicU64` rather than a lock, matching the single-threaded hot path /
//! cross-thread stats handoff split described in §5 and §9.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct QuotaGate {
    pub enabled: bool,
    quota: u64,
    token: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

impl QuotaGate {
    pub fn new(quota: u64, enabled: bool) -> Self {
        QuotaGate {
            enabled,
            quota,
            token: AtomicU64::new(quota),
            rejected: AtomicU64::new(0),
        }
    }

    /// Attempts to admit one request. Returns `Admitted` (caller should mark
    /// the message's `ticket` flag) or `Rejected` (caller synthesizes a
    /// quota-exceeded error and schedules the client for close, §4.J).
    pub fn admit(&self) -> Admission {
        if !self.enabled {
            return Admission::Admitted;
        }
        loop {
            let current = self.token.load(Ordering::Relaxed);
            if current == 0 {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Admission::Rejected;
            }
            if self
                .token
                .compare_exchange(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Admission::Admitted;
            }
        }
    }

    /// Returns a previously consumed token to the bucket, e.g. when a
    /// ticketed request is released without ever being admitted downstream
    /// (`req_put` in §4.J) — never above `quota`.
    pub fn release(&self) {
        if !self.enabled {
            return;
        }
        let _ = self
            .token
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                if t < self.quota {
                    Some(t + 1)
                } else {
                    None
                }
            });
    }

    /// Refills the bucket back to `quota`, run by the event loop's
    /// `warn_msg_reset_interval` timer (default 2 minutes).
    pub fn refill(&self) {
        self.token.store(self.quota, Ordering::Relaxed);
    }

    pub fn tokens_remaining(&self) -> u64 {
        self.token.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_rejects_then_refills() {
        let gate = QuotaGate::new(2, true);
        assert_eq!(gate.admit(), Admission::Admitted);
        assert_eq!(gate.admit(), Admission::Admitted);
        assert_eq!(gate.admit(), Admission::Rejected);
        assert_eq!(gate.rejected_count(), 1);
        gate.refill();
        assert_eq!(gate.admit(), Admission::Admitted);
        assert_eq!(gate.admit(), Admission::Admitted);
    }

    #[test]
    fn disabled_gate_always_admits() {
        let gate = QuotaGate::new(0, false);
        for _ in 0..100 {
            assert_eq!(gate.admit(), Admission::Admitted);
        }
    }

    #[test]
    fn release_never_exceeds_quota() {
        let gate = QuotaGate::new(1, true);
        gate.release();
        gate.release();
        assert_eq!(gate.tokens_remaining(), 1);
    }
}
