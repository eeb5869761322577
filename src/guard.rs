use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

/// Per-channel mutual exclusion plus the in-flight message exclusion set.
///
/// A channel has at most one active decision-and-act cycle. All context
/// reads happen strictly after a successful claim, and they filter out
/// messages reserved by other triggers; building the snapshot before
/// claiming is exactly the ordering that once produced duplicate responses.
pub struct ConcurrencyGuard {
    inner: Mutex<GuardState>,
}

#[derive(Default)]
struct GuardState {
    /// Channels with an active cycle.
    claimed: HashSet<String>,
    /// Message id → owning channel, for triggers reserved or in progress.
    in_flight: HashMap<u64, String>,
}

/// Proof of an exclusive claim on a channel. Released explicitly; holding
/// it across the whole cycle keeps the channel serialized.
#[derive(Debug)]
pub struct ClaimToken {
    channel_id: String,
    /// Message ids this cycle owns (cleared from the in-flight set on release).
    message_ids: Vec<u64>,
}

impl ClaimToken {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn message_ids(&self) -> &[u64] {
        &self.message_ids
    }
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuardState::default()),
        }
    }

    /// Reserve a message for a future cycle on its channel. Reserved ids are
    /// excluded from every other cycle's context read until the owning cycle
    /// releases them, even if that cycle has not claimed the channel yet.
    pub fn reserve_message(&self, channel_id: &str, message_id: u64) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.insert(message_id, channel_id.to_string());
    }

    /// Claim a channel for one decision cycle, adopting every message
    /// currently reserved for it. Returns `None` while another cycle holds
    /// the channel; the caller queues the trigger for the next tick.
    pub fn claim(&self, channel_id: &str) -> Option<ClaimToken> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !state.claimed.insert(channel_id.to_string()) {
            debug!(channel = %channel_id, "Claim refused: channel busy");
            return None;
        }
        let message_ids: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, owner)| owner.as_str() == channel_id)
            .map(|(id, _)| *id)
            .collect();
        Some(ClaimToken {
            channel_id: channel_id.to_string(),
            message_ids,
        })
    }

    /// The read filter for a claimed cycle: every in-flight message id
    /// except the ones the token itself owns.
    pub fn exclusions(&self, token: &ClaimToken) -> HashSet<u64> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state
            .in_flight
            .keys()
            .copied()
            .filter(|id| !token.message_ids.contains(id))
            .collect()
    }

    pub fn release(&self, token: ClaimToken) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.claimed.remove(&token.channel_id);
        for id in &token.message_ids {
            state.in_flight.remove(id);
        }
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_channel_is_refused() {
        let guard = ConcurrencyGuard::new();
        let token = guard.claim("chan-a").expect("first claim succeeds");
        assert!(guard.claim("chan-a").is_none());
        guard.release(token);
        assert!(guard.claim("chan-a").is_some());
    }

    #[test]
    fn independent_channels_claim_concurrently() {
        let guard = ConcurrencyGuard::new();
        let a = guard.claim("chan-a").unwrap();
        let b = guard.claim("chan-b").unwrap();
        guard.release(a);
        guard.release(b);
    }

    #[test]
    fn claim_adopts_reserved_messages() {
        let guard = ConcurrencyGuard::new();
        guard.reserve_message("chan-a", 7);
        guard.reserve_message("chan-a", 8);
        guard.reserve_message("chan-b", 9);

        let token = guard.claim("chan-a").unwrap();
        let mut owned = token.message_ids().to_vec();
        owned.sort();
        assert_eq!(owned, vec![7, 8]);

        // chan-b's reservation is excluded, our own messages are not.
        let exclusions = guard.exclusions(&token);
        assert!(exclusions.contains(&9));
        assert!(!exclusions.contains(&7));
        assert!(!exclusions.contains(&8));
    }

    #[test]
    fn release_clears_owned_reservations_only() {
        let guard = ConcurrencyGuard::new();
        guard.reserve_message("chan-a", 1);
        guard.reserve_message("chan-b", 2);

        let token = guard.claim("chan-a").unwrap();
        guard.release(token);

        // chan-b's reservation survives; chan-a's is gone.
        let fresh = guard.claim("chan-a").unwrap();
        assert!(fresh.message_ids().is_empty());
        assert!(guard.exclusions(&fresh).contains(&2));
        guard.release(fresh);
    }

    #[test]
    fn reservation_made_while_busy_is_adopted_by_next_claim() {
        let guard = ConcurrencyGuard::new();
        let first = guard.claim("chan-a").unwrap();
        // A second urgent trigger arrives mid-cycle and reserves its message.
        guard.reserve_message("chan-a", 42);
        // The active cycle must exclude it.
        assert!(guard.exclusions(&first).contains(&42));
        guard.release(first);

        let second = guard.claim("chan-a").unwrap();
        assert_eq!(second.message_ids(), &[42]);
        guard.release(second);
    }
}
