use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The per-session slot handed out by [`TurnRegistry::begin`].
///
/// `turn` is a process-wide monotonically increasing counter; `end` uses it
/// to make sure a finished turn cannot evict a successor that reclaimed the
/// session slot in the meantime.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub turn: u64,
    pub cancel: CancellationToken,
}

/// In-memory index of active turns.
///
/// This is the sole enforcer of "at most one active turn per session":
/// `begin` is a per-session compare-and-swap, fully decoupled from any
/// database lock so readers stay unblocked while a turn runs.
pub struct TurnRegistry {
    active: DashMap<String, TurnHandle>,
    next_turn: AtomicU64,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            next_turn: AtomicU64::new(1),
        }
    }

    /// Claim the turn slot for a session. Returns `None` when a turn is
    /// already active — the caller surfaces "busy", nothing queues.
    pub fn begin(&self, session_id: &str) -> Option<TurnHandle> {
        match self.active.entry(session_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = TurnHandle {
                    turn: self.next_turn.fetch_add(1, Ordering::Relaxed),
                    cancel: CancellationToken::new(),
                };
                slot.insert(handle.clone());
                debug!(session_id, turn = handle.turn, "turn slot claimed");
                Some(handle)
            }
        }
    }

    /// Fire the cancellation trigger for a session's active turn.
    /// Safe to call when no turn is active.
    pub fn cancel(&self, session_id: &str) {
        if let Some(entry) = self.active.get(session_id) {
            entry.cancel.cancel();
        }
    }

    /// Release the slot, but only if it still belongs to `handle`.
    pub fn end(&self, session_id: &str, handle: &TurnHandle) {
        self.active
            .remove_if(session_id, |_, active| active.turn == handle.turn);
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }
}

impl Default for TurnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_until_end() {
        let reg = TurnRegistry::new();
        let handle = reg.begin("s1").expect("first begin");
        assert!(reg.begin("s1").is_none(), "slot must be exclusive");

        reg.end("s1", &handle);
        assert!(reg.begin("s1").is_some(), "slot free after end");
    }

    #[test]
    fn sessions_do_not_serialize_each_other() {
        let reg = TurnRegistry::new();
        let _a = reg.begin("s1").unwrap();
        assert!(reg.begin("s2").is_some());
    }

    #[test]
    fn cancel_fires_the_token_and_is_idempotent() {
        let reg = TurnRegistry::new();
        let handle = reg.begin("s1").unwrap();
        assert!(!handle.cancel.is_cancelled());

        reg.cancel("s1");
        assert!(handle.cancel.is_cancelled());

        // Absent sessions and repeated cancels are no-ops.
        reg.cancel("s1");
        reg.cancel("ghost");
    }

    #[test]
    fn stale_end_does_not_evict_successor() {
        let reg = TurnRegistry::new();
        let first = reg.begin("s1").unwrap();
        reg.end("s1", &first);

        let second = reg.begin("s1").unwrap();
        // A late end from the first turn must not free the second's slot.
        reg.end("s1", &first);
        assert!(reg.is_active("s1"));

        reg.end("s1", &second);
        assert!(!reg.is_active("s1"));
    }
}
