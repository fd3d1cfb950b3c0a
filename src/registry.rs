//! Participant identity and registration bookkeeping.

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Household,
    Producer,
    Storage,
}

/// How many agents of each role the orchestrator should wait for before
/// starting the first round (see `RoundOrchestrator::await_registration`).
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpectedAgents {
    pub households: usize,
    pub producers: usize,
    pub storage: usize,
}

/// Tracks which participants exist and, within the current round, which of
/// them have reported a status. Analogous to the original's
/// `known_households`/`known_producers`/`known_storage` sets plus
/// `status_seen_round[R]`.
#[derive(Default)]
pub struct ParticipantRegistry {
    households: RwLock<HashSet<ParticipantId>>,
    producers: RwLock<HashSet<ParticipantId>>,
    storage: RwLock<HashSet<ParticipantId>>,
    /// Storage units registered with `emergency_only = true`. Set once at
    /// registration (spec.md §6's `register_storage` payload) and consulted
    /// by `auction::AuctionEngine::classify`, which applies different
    /// seller/buyer thresholds to emergency-only units.
    emergency_only_storage: RwLock<HashSet<ParticipantId>>,
    status_seen: RwLock<HashSet<ParticipantId>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ParticipantId, role: Role) {
        match role {
            Role::Household => self.households.write().insert(id),
            Role::Producer => self.producers.write().insert(id),
            Role::Storage => self.storage.write().insert(id),
        };
    }

    pub fn role_of(&self, id: &ParticipantId) -> Option<Role> {
        if self.households.read().contains(id) {
            Some(Role::Household)
        } else if self.producers.read().contains(id) {
            Some(Role::Producer)
        } else if self.storage.read().contains(id) {
            Some(Role::Storage)
        } else {
            None
        }
    }

    pub fn households(&self) -> Vec<ParticipantId> {
        let mut v: Vec<_> = self.households.read().iter().cloned().collect();
        v.sort();
        v
    }

    pub fn producers(&self) -> Vec<ParticipantId> {
        let mut v: Vec<_> = self.producers.read().iter().cloned().collect();
        v.sort();
        v
    }

    pub fn storage(&self) -> Vec<ParticipantId> {
        let mut v: Vec<_> = self.storage.read().iter().cloned().collect();
        v.sort();
        v
    }

    pub fn mark_emergency_only_storage(&self, id: ParticipantId) {
        self.emergency_only_storage.write().insert(id);
    }

    pub fn is_emergency_only_storage(&self, id: &ParticipantId) -> bool {
        self.emergency_only_storage.read().contains(id)
    }

    pub fn emergency_only_storage_ids(&self) -> HashSet<ParticipantId> {
        self.emergency_only_storage.read().clone()
    }

    pub fn counts_meet(&self, expected: ExpectedAgents) -> bool {
        self.households.read().len() >= expected.households
            && self.producers.read().len() >= expected.producers
            && self.storage.read().len() >= expected.storage
    }

    /// Marks a participant as having reported status this round. Cleared by
    /// [`Self::reset_status_seen`] at the start of the next round.
    pub fn mark_status_seen(&self, id: ParticipantId) {
        self.status_seen.write().insert(id);
    }

    pub fn has_reported_status(&self, id: &ParticipantId) -> bool {
        self.status_seen.read().contains(id)
    }

    pub fn status_seen_count(&self) -> usize {
        self.status_seen.read().len()
    }

    pub fn total_known(&self) -> usize {
        self.households.read().len() + self.producers.read().len() + self.storage.read().len()
    }

    pub fn reset_status_seen(&self) {
        self.status_seen.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_role_membership() {
        let reg = ParticipantRegistry::new();
        reg.register(ParticipantId::new("household-1"), Role::Household);
        reg.register(ParticipantId::new("producer-1"), Role::Producer);
        assert_eq!(
            reg.role_of(&ParticipantId::new("household-1")),
            Some(Role::Household)
        );
        assert_eq!(reg.role_of(&ParticipantId::new("unknown")), None);
    }

    #[test]
    fn counts_meet_requires_every_role_satisfied() {
        let reg = ParticipantRegistry::new();
        reg.register(ParticipantId::new("household-1"), Role::Household);
        let expected = ExpectedAgents {
            households: 1,
            producers: 1,
            storage: 0,
        };
        assert!(!reg.counts_meet(expected));
        reg.register(ParticipantId::new("producer-1"), Role::Producer);
        assert!(reg.counts_meet(expected));
    }

    #[test]
    fn status_seen_resets_between_rounds() {
        let reg = ParticipantRegistry::new();
        let id = ParticipantId::new("household-1");
        reg.mark_status_seen(id.clone());
        assert!(reg.has_reported_status(&id));
        reg.reset_status_seen();
        assert!(!reg.has_reported_status(&id));
    }
}
