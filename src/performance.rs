//! Cumulative and periodic performance reporting.
//!
//! Grounded on `original_source/agents/performance_metrics.py`'s
//! `PerformanceTracker`: per-round accounting feeds both running totals and
//! a ring of recent rounds, and every `report_interval_rounds` the tracker
//! emits a formatted summary. The original prints to stdout; here
//! `format_summary` builds the same content as a string and the caller logs
//! it through `tracing`, matching the rest of the core's logging story.

use std::collections::HashMap;

use crate::registry::ParticipantId;

#[derive(Clone, Debug, Default)]
pub struct RoundRecord {
    pub round_num: u64,
    pub total_demand_kwh: f64,
    pub total_supplied_kwh: f64,
    pub market_value: f64,
    pub wasted_energy_kwh: f64,
    pub ext_grid_sold_kwh: f64,
    pub ext_grid_bought_kwh: f64,
    pub ext_grid_sold_value: f64,
    pub ext_grid_bought_value: f64,
    pub buyer_fulfillment: HashMap<ParticipantId, f64>,
    pub any_producer_failed: bool,
    pub emergency_used: bool,
}

impl RoundRecord {
    pub fn avg_fulfillment(&self) -> f64 {
        if self.buyer_fulfillment.is_empty() {
            0.0
        } else {
            self.buyer_fulfillment.values().sum::<f64>() / self.buyer_fulfillment.len() as f64
        }
    }

    pub fn is_blackout(&self) -> bool {
        self.avg_fulfillment() < crate::auction::FULL_MATCH_THRESHOLD_PCT
    }
}

#[derive(Default)]
pub struct PerformanceTracker {
    report_interval_rounds: u64,
    rounds_data: Vec<RoundRecord>,
    total_demand_kwh: f64,
    total_supplied_kwh: f64,
    total_market_value: f64,
    ext_grid_supplied_kwh: f64,
    ext_grid_bought_kwh: f64,
    ext_grid_sold_value: f64,
    ext_grid_bought_value: f64,
    household_fulfillment: HashMap<ParticipantId, Vec<f64>>,
    rounds_blackout: u64,
    rounds_normal: u64,
    producer_failures: u64,
    emergency_activations: u64,
}

impl PerformanceTracker {
    pub fn new(report_interval_rounds: u64) -> Self {
        Self {
            report_interval_rounds,
            ..Default::default()
        }
    }

    pub fn rounds_blackout(&self) -> u64 {
        self.rounds_blackout
    }

    pub fn rounds_normal(&self) -> u64 {
        self.rounds_normal
    }

    /// Records one round's totals, updates cumulative counters, and returns
    /// a formatted summary if this round lands on the reporting interval.
    pub fn record_round(&mut self, record: RoundRecord) -> Option<String> {
        for (household, pct) in &record.buyer_fulfillment {
            self.household_fulfillment
                .entry(household.clone())
                .or_default()
                .push(*pct);
        }

        self.total_demand_kwh += record.total_demand_kwh;
        self.total_supplied_kwh += record.total_supplied_kwh;
        self.total_market_value += record.market_value;
        self.ext_grid_supplied_kwh += record.ext_grid_sold_kwh;
        self.ext_grid_bought_kwh += record.ext_grid_bought_kwh;
        self.ext_grid_sold_value += record.ext_grid_sold_value;
        self.ext_grid_bought_value += record.ext_grid_bought_value;

        if record.is_blackout() {
            self.rounds_blackout += 1;
        } else {
            self.rounds_normal += 1;
        }
        if record.any_producer_failed {
            self.producer_failures += 1;
        }
        if record.emergency_used {
            self.emergency_activations += 1;
        }

        let round_num = record.round_num;
        self.rounds_data.push(record);

        if self.report_interval_rounds > 0
            && round_num > 0
            && round_num % self.report_interval_rounds == 0
        {
            Some(self.format_summary(round_num))
        } else {
            None
        }
    }

    /// Builds a human-readable summary of the last `report_interval_rounds`
    /// rounds plus all-time totals, in the shape of the original's periodic
    /// console report.
    pub fn format_summary(&self, round_num: u64) -> String {
        let start_idx = round_num.saturating_sub(self.report_interval_rounds) as usize;
        let end_idx = (round_num as usize).min(self.rounds_data.len());
        let recent = &self.rounds_data[start_idx.min(end_idx)..end_idx];

        if recent.is_empty() {
            return format!("PERFORMANCE SUMMARY (rounds {}-{}): no data", start_idx + 1, round_num);
        }

        let recent_demand: f64 = recent.iter().map(|r| r.total_demand_kwh).sum();
        let recent_supplied: f64 = recent.iter().map(|r| r.total_supplied_kwh).sum();
        let recent_value: f64 = recent.iter().map(|r| r.market_value).sum();
        let recent_ext_sold: f64 = recent.iter().map(|r| r.ext_grid_sold_kwh).sum();
        let recent_ext_bought: f64 = recent.iter().map(|r| r.ext_grid_bought_kwh).sum();
        let recent_ext_sold_value: f64 = recent.iter().map(|r| r.ext_grid_sold_value).sum();
        let recent_ext_bought_value: f64 = recent.iter().map(|r| r.ext_grid_bought_value).sum();
        let recent_blackouts = recent.iter().filter(|r| r.is_blackout()).count();

        let fulfillment_pct = if recent_demand > 0.0 {
            recent_supplied / recent_demand * 100.0
        } else {
            0.0
        };
        let from_microgrid = recent_supplied - recent_ext_sold;
        let microgrid_pct = if recent_supplied > 0.0 {
            from_microgrid / recent_supplied * 100.0
        } else {
            0.0
        };
        let ext_grid_pct = if recent_supplied > 0.0 {
            recent_ext_sold / recent_supplied * 100.0
        } else {
            0.0
        };

        let net_period = recent_ext_sold_value - recent_ext_bought_value;
        let net_total = self.ext_grid_sold_value - self.ext_grid_bought_value;

        format!(
            "PERFORMANCE SUMMARY (rounds {}-{}): demand={:.1}kWh supplied={:.1}kWh ({:.1}%) \
             microgrid={:.1}kWh ({:.1}%) ext_grid={:.1}kWh ({:.1}%) | \
             market_value=€{:.2} ext_sold={:.1}kWh(€{:.2}) ext_bought={:.1}kWh(€{:.2}) | \
             blackouts_period={} blackouts_total={} | \
             net_balance_period={} net_balance_total={}",
            start_idx + 1,
            round_num,
            recent_demand,
            recent_supplied,
            fulfillment_pct,
            from_microgrid,
            microgrid_pct,
            recent_ext_sold,
            ext_grid_pct,
            recent_value,
            recent_ext_sold,
            recent_ext_sold_value,
            recent_ext_bought,
            recent_ext_bought_value,
            recent_blackouts,
            self.rounds_blackout,
            describe_balance(net_period),
            describe_balance(net_total),
        )
    }
}

fn describe_balance(balance: f64) -> String {
    if balance > 0.0 {
        format!("+€{:.2} (export surplus)", balance)
    } else if balance < 0.0 {
        format!("-€{:.2} (import dependency)", balance.abs())
    } else {
        "€0.00 (self-sufficient)".to_string()
    }
}
