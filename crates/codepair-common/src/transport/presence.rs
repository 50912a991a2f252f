//! Presence tracking for collaborative sessions.
//!
//! The relay keys entries by connection so that a dropped socket clears
//! everything it announced; clients key by participant and replace the whole
//! set from each snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use web_time::Instant;

use super::PresenceState;
use crate::session::ParticipantId;

#[derive(Debug, Clone)]
struct Tracked {
    state: PresenceState,
    updated_at: Instant,
}

/// Tracks who is present in one room.
#[derive(Debug, Clone)]
pub struct PresenceTracker<K = ParticipantId> {
    entries: HashMap<K, Tracked>,
}

impl<K> Default for PresenceTracker<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> PresenceTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry. Returns true if the visible state changed.
    pub fn upsert(&mut self, key: K, state: PresenceState) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.updated_at = now;
                if existing.state == state {
                    return false;
                }
                existing.state = state;
                true
            }
            None => {
                self.entries.insert(
                    key,
                    Tracked {
                        state,
                        updated_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove one entry.
    pub fn remove(&mut self, key: &K) -> Option<PresenceState> {
        self.entries.remove(key).map(|t| t.state)
    }

    /// Keep only entries whose key passes `keep`. Returns the number removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &PresenceState) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, t| keep(k, &t.state));
        before - self.entries.len()
    }

    pub fn get(&self, key: &K) -> Option<&PresenceState> {
        self.entries.get(key).map(|t| &t.state)
    }

    /// One state per participant, ordered by participant id.
    ///
    /// A participant present on several keys is reported once, typing if any
    /// of their entries is typing.
    pub fn snapshot(&self) -> Vec<PresenceState> {
        let mut merged: BTreeMap<&str, PresenceState> = BTreeMap::new();
        for tracked in self.entries.values() {
            let state = &tracked.state;
            merged
                .entry(state.participant_id.as_str())
                .and_modify(|existing| existing.is_typing |= state.is_typing)
                .or_insert_with(|| state.clone());
        }
        merged.into_values().collect()
    }

    /// Ids of everyone currently present.
    pub fn online_ids(&self) -> BTreeSet<ParticipantId> {
        self.entries
            .values()
            .map(|t| t.state.participant_id.clone())
            .collect()
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.entries
            .values()
            .any(|t| t.state.participant_id == participant_id)
    }

    /// Participants currently typing, in id order.
    pub fn typing(&self) -> Vec<PresenceState> {
        self.snapshot().into_iter().filter(|s| s.is_typing).collect()
    }

    /// Number of tracked entries (not distinct participants).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that haven't been refreshed within `max_age`.
    pub fn prune_stale(&mut self, max_age: std::time::Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, t| now.duration_since(t.updated_at) <= max_age);
        before - self.entries.len()
    }
}

impl PresenceTracker<ParticipantId> {
    /// Replace everything with a snapshot from the relay.
    /// Returns true if the set of states changed.
    pub fn apply_snapshot(&mut self, peers: Vec<PresenceState>) -> bool {
        let previous = self.snapshot();
        self.entries.clear();
        for state in peers {
            self.upsert(state.participant_id.clone(), state);
        }
        previous != self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str, typing: bool) -> PresenceState {
        PresenceState {
            participant_id: id.into(),
            display_name: format!("user-{id}").into(),
            color: "hsl(0, 70%, 50%)".into(),
            is_typing: typing,
        }
    }

    #[test]
    fn test_upsert_remove() {
        let mut tracker: PresenceTracker<u64> = PresenceTracker::new();

        assert!(tracker.upsert(1, state("a", false)));
        assert!(!tracker.upsert(1, state("a", false)));
        assert!(tracker.upsert(1, state("a", true)));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_online("a"));

        let removed = tracker.remove(&1).unwrap();
        assert!(removed.is_typing);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_snapshot_merges_participant_across_keys() {
        let mut tracker: PresenceTracker<(u64, ParticipantId)> = PresenceTracker::new();
        tracker.upsert((1, "a".into()), state("a", false));
        tracker.upsert((2, "a".into()), state("a", true));
        tracker.upsert((2, "b".into()), state("b", false));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].participant_id, "a");
        assert!(snapshot[0].is_typing);
        assert_eq!(tracker.typing().len(), 1);

        let removed = tracker.retain(|(conn, _), _| *conn != 2);
        assert_eq!(removed, 2);
        assert_eq!(tracker.online_ids().len(), 1);
    }

    #[test]
    fn test_apply_snapshot_reports_changes() {
        let mut tracker: PresenceTracker = PresenceTracker::new();
        assert!(tracker.apply_snapshot(vec![state("a", false), state("b", false)]));
        assert!(!tracker.apply_snapshot(vec![state("b", false), state("a", false)]));
        assert!(tracker.apply_snapshot(vec![state("a", false)]));
        assert!(!tracker.is_online("b"));
    }
}
