//! Per-agent and global transmission capacity enforcement.
//!
//! The original scenario config carries an `AGENT_LIMITS_KW` table keyed by
//! role, but no code path in `orchestrator.py` actually consults it — offers
//! and requests are capped only by what the agent itself reports. This
//! module is a genuine addition: it generalizes the teacher's Gate-A/B
//! constraint style (`scheduler::constraints_ok`, `planner::sizing`'s
//! budget-then-allocate shape) into a role-aware cap that the auction engine
//! applies before matching.

use crate::config::RoleLimits;
use crate::registry::Role;
use crate::state::{HouseholdState, ProducerState, StorageState};

pub struct CapacityEnforcer {
    limits: RoleLimits,
    transmission_limit_kw: f64,
    battery_capacity_kwh: f64,
    battery_charge_rate_kw: f64,
}

impl CapacityEnforcer {
    pub fn new(limits: RoleLimits, transmission_limit_kw: f64) -> Self {
        Self::with_battery_params(limits, transmission_limit_kw, 0.0, 0.0)
    }

    /// `battery_capacity_kwh`/`battery_charge_rate_kw` come from
    /// `config::HouseholdsConfig` and feed the `planned_battery_charge` term
    /// in [`Self::effective_household_sell_kwh`] (spec.md §4.6).
    pub fn with_battery_params(
        limits: RoleLimits,
        transmission_limit_kw: f64,
        battery_capacity_kwh: f64,
        battery_charge_rate_kw: f64,
    ) -> Self {
        Self {
            limits,
            transmission_limit_kw,
            battery_capacity_kwh,
            battery_charge_rate_kw,
        }
    }

    pub fn transmission_limit_kw(&self) -> f64 {
        self.transmission_limit_kw
    }

    fn role_limit_kw(&self, role: Role, is_prosumer: bool) -> f64 {
        match role {
            Role::Household if is_prosumer => self.limits.prosumer_kw,
            Role::Household => self.limits.consumer_kw,
            Role::Producer => self.limits.producer_kw,
            Role::Storage => self.limits.storage_kw,
        }
    }

    /// Effective sell-side limit for a household acting as a prosumer:
    /// `prod_kwh` minus what it needs for its own demand and minus
    /// `planned_battery_charge` (spec.md §4.6: `min(surplus, charge_rate,
    /// remaining_capacity)`, the battery topping itself up before surplus
    /// goes on the market), capped at its role limit.
    pub fn effective_household_sell_kwh(&self, household: &HouseholdState) -> f64 {
        let demand_use = household.demand_kwh.min(household.prod_kwh);
        let surplus = (household.prod_kwh - household.demand_kwh).max(0.0);
        let remaining_capacity = (self.battery_capacity_kwh - household.battery_kwh).max(0.0);
        let planned_battery_charge = surplus.min(self.battery_charge_rate_kw).min(remaining_capacity);
        let internal_use = demand_use + planned_battery_charge;
        let available = (household.prod_kwh - internal_use).max(0.0);
        available.min(self.role_limit_kw(Role::Household, true))
    }

    pub fn effective_household_buy_kwh(&self, household: &HouseholdState) -> f64 {
        household
            .net_demand_kwh()
            .min(self.role_limit_kw(Role::Household, false))
    }

    pub fn effective_producer_sell_kwh(&self, producer: &ProducerState) -> f64 {
        if !producer.is_operational {
            return 0.0;
        }
        producer.prod_kwh.min(self.role_limit_kw(Role::Producer, false))
    }

    /// The 20% reserve floor applies to every storage seller, emergency-only
    /// units included (spec.md §8 invariant 10): only the *eligibility*
    /// threshold differs between unit kinds, never the deliverable amount.
    pub fn effective_storage_sell_kwh(&self, storage: &StorageState) -> f64 {
        storage
            .available_for_sale()
            .min(self.role_limit_kw(Role::Storage, false))
    }

    pub fn effective_storage_buy_kwh(&self, storage: &StorageState) -> f64 {
        (storage.cap_kwh - storage.soc_kwh)
            .max(0.0)
            .min(self.role_limit_kw(Role::Storage, false))
    }
}
