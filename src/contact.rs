//! Peer records and their liveness state machine.
//!
//! A [`Contact`] is created the first time we hear from (or about) a peer and
//! mutated on every exchange. State moves `Unknown -> Live` on a confirmed
//! reply and `-> Down` after enough consecutive failures; a `Down` contact is
//! excluded from closest-node selection and becomes eligible for replacement.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::kuid::Kuid;

/// Liveness of a routing-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactState {
    /// Heard about, never confirmed.
    Unknown,
    /// Replied to us recently.
    Live,
    /// Exceeded the consecutive-failure budget.
    Down,
}

/// A remote peer (or the local node) as seen by the routing layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Kuid,
    pub addr: SocketAddr,
    /// Bumped by the owner whenever it intentionally resets local state, so
    /// peers can tell a genuine restart from routing-table staleness.
    pub instance_id: u32,
    pub state: ContactState,
    pub failures: u32,
    /// Milliseconds since the Unix epoch of the last confirmed exchange;
    /// zero for contacts we have never heard from directly.
    pub last_seen_ms: u64,
}

impl Contact {
    pub fn new(id: Kuid, addr: SocketAddr, instance_id: u32) -> Self {
        Self {
            id,
            addr,
            instance_id,
            state: ContactState::Unknown,
            failures: 0,
            last_seen_ms: 0,
        }
    }

    /// Confirmed exchange: reset failures, mark live, stamp the clock.
    pub fn mark_alive(&mut self, now_ms: u64) {
        self.state = ContactState::Live;
        self.failures = 0;
        self.last_seen_ms = now_ms;
    }

    pub fn mark_unknown(&mut self) {
        self.state = ContactState::Unknown;
    }

    /// Record one failed exchange. Returns true if this failure pushed the
    /// contact over `max_failures` into the `Down` state.
    pub fn record_failure(&mut self, max_failures: u32) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= max_failures && self.state != ContactState::Down {
            self.state = ContactState::Down;
            return true;
        }
        false
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Down
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state == ContactState::Live
    }

    /// True if the contact has not been heard from within `window_ms`.
    pub fn has_been_quiet_for(&self, window_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) >= window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact::new(Kuid::random(), "127.0.0.1:4000".parse().unwrap(), 0)
    }

    #[test]
    fn failures_accumulate_until_down() {
        let mut c = contact();
        assert!(!c.record_failure(3));
        assert!(!c.record_failure(3));
        assert!(c.record_failure(3));
        assert!(c.is_dead());
        // already down, no second transition
        assert!(!c.record_failure(3));
    }

    #[test]
    fn mark_alive_resets_failures() {
        let mut c = contact();
        c.record_failure(5);
        c.record_failure(5);
        c.mark_alive(1_000);
        assert_eq!(c.failures, 0);
        assert!(c.is_live());
        assert_eq!(c.last_seen_ms, 1_000);
    }

    #[test]
    fn quiet_window() {
        let mut c = contact();
        c.mark_alive(10_000);
        assert!(!c.has_been_quiet_for(5_000, 12_000));
        assert!(c.has_been_quiet_for(5_000, 15_000));
    }
}
