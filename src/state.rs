//! Latest-known physical state for every participant, keyed by
//! [`ParticipantId`]. Updated by `status_report`/`production_report`/
//! `statusBattery` messages as they arrive (see `messaging`).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::registry::ParticipantId;

/// Invariant: `battery_kwh <= battery_capacity_kwh` (the scenario-wide
/// capacity in `config::HouseholdsConfig`), enforced by whichever external
/// agent reports the state — the coordinator only ever reads this value.
#[derive(Clone, Debug)]
pub struct HouseholdState {
    pub demand_kwh: f64,
    pub prod_kwh: f64,
    pub battery_kwh: f64,
}

impl HouseholdState {
    pub fn is_prosumer(&self) -> bool {
        self.prod_kwh > 0.0
    }

    pub fn net_demand_kwh(&self) -> f64 {
        (self.demand_kwh - self.prod_kwh).max(0.0)
    }

    pub fn net_surplus_kwh(&self) -> f64 {
        (self.prod_kwh - self.demand_kwh).max(0.0)
    }
}

#[derive(Clone, Debug)]
pub struct ProducerState {
    pub prod_kwh: f64,
    pub is_operational: bool,
    pub failure_rounds_remaining: u32,
    /// The duration drawn when this failure began, kept alongside the
    /// countdown so `PerformanceTracker`/event logs can report how long an
    /// outage was meant to last, not just how much of it remains.
    pub failure_rounds_total: u32,
}

impl ProducerState {
    pub fn new() -> Self {
        Self {
            prod_kwh: 0.0,
            is_operational: true,
            failure_rounds_remaining: 0,
            failure_rounds_total: 0,
        }
    }

    /// Enforces the invariant that an offline producer reports zero
    /// production, regardless of what the agent itself claims.
    pub fn set_production(&mut self, prod_kwh: f64) {
        self.prod_kwh = if self.is_operational { prod_kwh.max(0.0) } else { 0.0 };
    }

    /// The production-report merge rule (spec.md §4.2): recovery is a side
    /// effect of receiving a `production_report` while offline, not
    /// something the failure controller advances on its own clock. Counts
    /// down `failure_rounds_remaining`; on reaching zero, accepts the
    /// reported production and flips back operational, otherwise forces
    /// zero production and keeps the producer offline.
    pub fn merge_production_report(&mut self, prod_kwh: f64) {
        if self.is_operational {
            self.set_production(prod_kwh);
            return;
        }

        if self.failure_rounds_remaining > 0 {
            self.failure_rounds_remaining -= 1;
        }
        if self.failure_rounds_remaining == 0 {
            self.is_operational = true;
            self.prod_kwh = prod_kwh.max(0.0);
        } else {
            self.prod_kwh = 0.0;
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct StorageState {
    pub soc_kwh: f64,
    pub cap_kwh: f64,
}

impl StorageState {
    pub fn soc_pct(&self) -> f64 {
        if self.cap_kwh <= 0.0 {
            0.0
        } else {
            (self.soc_kwh / self.cap_kwh) * 100.0
        }
    }

    pub fn set_soc(&mut self, soc_kwh: f64) {
        self.soc_kwh = soc_kwh.clamp(0.0, self.cap_kwh);
    }

    /// Available kWh to sell when not reserving an emergency floor, mirroring
    /// the original's `soc - 0.2 * cap` margin.
    pub fn available_for_sale(&self) -> f64 {
        (self.soc_kwh - 0.2 * self.cap_kwh).max(0.0)
    }
}

#[derive(Default)]
pub struct StateStore {
    households: RwLock<HashMap<ParticipantId, HouseholdState>>,
    producers: RwLock<HashMap<ParticipantId, ProducerState>>,
    storage: RwLock<HashMap<ParticipantId, StorageState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_household(&self, id: ParticipantId, state: HouseholdState) {
        self.households.write().insert(id, state);
    }

    pub fn household(&self, id: &ParticipantId) -> Option<HouseholdState> {
        self.households.read().get(id).cloned()
    }

    pub fn households_snapshot(&self) -> HashMap<ParticipantId, HouseholdState> {
        self.households.read().clone()
    }

    pub fn producer_entry_or_default(&self, id: &ParticipantId) -> ProducerState {
        self.producers.read().get(id).cloned().unwrap_or_default()
    }

    pub fn set_producer(&self, id: ParticipantId, state: ProducerState) {
        self.producers.write().insert(id, state);
    }

    pub fn producers_snapshot(&self) -> HashMap<ParticipantId, ProducerState> {
        self.producers.read().clone()
    }

    pub fn any_producer_failed(&self) -> bool {
        self.producers.read().values().any(|p| !p.is_operational)
    }

    pub fn update_storage(&self, id: ParticipantId, state: StorageState) {
        self.storage.write().insert(id, state);
    }

    pub fn storage_snapshot(&self) -> HashMap<ParticipantId, StorageState> {
        self.storage.read().clone()
    }

    pub fn any_storage_full(&self, full_threshold_pct: f64) -> bool {
        self.storage
            .read()
            .values()
            .any(|s| s.soc_pct() >= full_threshold_pct)
    }
}
