//! Scenario configuration, constructed once at startup and threaded through
//! constructors by value/reference — never read from a global, per the
//! "global mutable state" redesign flag in spec.md §9.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleLimits {
    pub consumer_kw: f64,
    pub prosumer_kw: f64,
    pub producer_kw: f64,
    pub storage_kw: f64,
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            consumer_kw: 3.0,
            prosumer_kw: 5.0,
            producer_kw: 35.0,
            storage_kw: 35.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub round_sleep_seconds: f64,
    pub offers_timeout_seconds: f64,
    pub transmission_limit_kw: f64,
    pub agent_limits_kw: RoleLimits,
    pub status_grace_seconds: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            round_sleep_seconds: 10.0,
            offers_timeout_seconds: 10.0,
            // spec.md §6: TRANSMISSION_LIMIT_KW default 3.0 kWh, a per-buyer
            // per-round cap (see `ledger::RoundLedger::transmission_used_by_buyer`).
            transmission_limit_kw: 3.0,
            agent_limits_kw: RoleLimits::default(),
            status_grace_seconds: 2.0,
        }
    }
}

/// External-grid price configuration.
///
/// The legacy scenario layout names the microgrid's import price `SELL_PRICE`
/// and its export price `BUY_PRICE`, which reads backwards from the grid's
/// own point of view. Per the Open Question in spec.md §9 we expose the
/// unambiguous names here and derive the legacy ones only at the adapter
/// edge (see `external_grid::ExternalGridAdapter::draw`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalGridConfig {
    pub enabled: bool,
    /// What the microgrid pays per kWh imported (legacy `SELL_PRICE`/`sell_price_min`).
    pub microgrid_import_price_min: f64,
    pub microgrid_import_price_max: f64,
    /// What the microgrid receives per kWh exported (legacy `BUY_PRICE`/`buy_price_min`).
    pub microgrid_export_price_min: f64,
    pub microgrid_export_price_max: f64,
    pub acceptance_prob: f64,
}

impl Default for ExternalGridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            microgrid_import_price_min: 0.25,
            microgrid_import_price_max: 0.30,
            microgrid_export_price_min: 0.10,
            microgrid_export_price_max: 0.15,
            acceptance_prob: 0.7,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducersConfig {
    pub failure_prob: f64,
    pub failure_rounds_min: u32,
    pub failure_rounds_max: u32,
}

impl Default for ProducersConfig {
    fn default() -> Self {
        Self {
            failure_prob: 0.20,
            failure_rounds_min: 1,
            failure_rounds_max: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub report_interval_rounds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_rounds: 5,
        }
    }
}

/// Demand-curve and battery-physics parameters for household agents
/// (spec.md §6's `HOUSEHOLDS` key). The coordinator never consumes these —
/// individual-agent physics is explicitly out of scope (spec.md §1) — but
/// the field carries through a scenario file so one config document governs
/// both the coordinator and whatever external agent processes it drives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HouseholdsConfig {
    pub panel_area_range_m2: (f64, f64),
    pub battery_capacity_kwh: f64,
    pub battery_charge_rate_kw: f64,
    pub battery_discharge_rate_kw: f64,
    pub battery_efficiency: f64,
}

impl Default for HouseholdsConfig {
    fn default() -> Self {
        Self {
            panel_area_range_m2: (10.0, 30.0),
            battery_capacity_kwh: 13.5,
            battery_charge_rate_kw: 5.0,
            battery_discharge_rate_kw: 5.0,
            battery_efficiency: 0.9,
        }
    }
}

/// Storage-unit sizing defaults (spec.md §6's `STORAGE` key), again carried
/// for external agent processes rather than consumed by the coordinator
/// itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub capacity_kwh: f64,
    pub emergency_only: bool,
    pub ask_price: f64,
    pub max_price: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 50.0,
            emergency_only: false,
            ask_price: 0.18,
            max_price: 0.35,
        }
    }
}

/// Ambient environment ranges (spec.md §6's `ENVIRONMENT` key, implicit in
/// the `status_report`/`production_report` weather fields). Not consumed by
/// the coordinator, which only ever forwards `sim_day`/`sim_hour`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub solar_irradiance_range: (f64, f64),
    pub wind_speed_range_m_s: (f64, f64),
    pub temperature_range_c: (f64, f64),
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            solar_irradiance_range: (0.0, 1000.0),
            wind_speed_range_m_s: (0.0, 15.0),
            temperature_range_c: (-5.0, 35.0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ScenarioConfig {
    pub simulation: SimulationConfig,
    pub external_grid: ExternalGridConfig,
    pub producers: ProducersConfig,
    pub households: HouseholdsConfig,
    pub storage: StorageConfig,
    pub environment: EnvironmentConfig,
    pub metrics: MetricsConfig,
}

impl ScenarioConfig {
    /// Loads a scenario from a TOML file if `GRIDCOORD_SCENARIO` points at
    /// one, otherwise falls back to the built-in defaults above (which
    /// mirror the original `SE_SCENARIO_CONFIG` base configuration).
    pub fn from_env_or_default() -> Self {
        match std::env::var("GRIDCOORD_SCENARIO") {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, path, "failed to parse scenario file; using defaults");
                    ScenarioConfig::default()
                }),
                Err(e) => {
                    tracing::warn!(error = %e, path, "failed to read scenario file; using defaults");
                    ScenarioConfig::default()
                }
            },
            Err(_) => ScenarioConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scenario_matches_base_configuration_values() {
        let cfg = ScenarioConfig::default();
        assert_eq!(cfg.simulation.transmission_limit_kw, 3.0);
        assert_eq!(cfg.simulation.agent_limits_kw.prosumer_kw, 5.0);
        assert_eq!(cfg.producers.failure_rounds_max, 4);
        assert_eq!(cfg.metrics.report_interval_rounds, 5);
    }
}
