//! Producer failure injection and recovery.
//!
//! Grounded on `original_source/agents/grid_node_agent.py`'s
//! `_check_and_trigger_failure`: at most one producer may be offline at a
//! time, and injection is gated behind at least one storage unit nearing
//! full. Recovery is not this module's concern — spec.md §4.5 is explicit
//! that it's a side effect of the production-report merge rule applied in
//! `orchestrator::handle_envelope` (see `state::ProducerState::merge_production_report`).

use rand::Rng;

use crate::config::ProducersConfig;
use crate::events::{Event, EventKind, EventSink};
use crate::registry::ParticipantId;
use crate::state::StateStore;
use crate::time::RoundId;

const STORAGE_FULL_THRESHOLD_PCT: f64 = 99.0;

pub struct FailureController {
    config: ProducersConfig,
}

impl FailureController {
    pub fn new(config: ProducersConfig) -> Self {
        Self { config }
    }

    /// Runs one round's failure check: if a producer is already offline, do
    /// nothing — at most one producer may be in failure at a time, and its
    /// recovery is driven by its own `production_report` arrivals, not by
    /// this check. Otherwise, gated on at least one storage unit being
    /// nearly full, roll for a new failure among operational producers in
    /// id order (deterministic draw order, not which producer is picked).
    pub fn check_and_trigger(
        &self,
        round_id: RoundId,
        producers: &[ParticipantId],
        state: &StateStore,
        sink: &dyn EventSink,
        rng: &mut impl Rng,
    ) {
        if state.any_producer_failed() {
            return;
        }

        if !state.any_storage_full(STORAGE_FULL_THRESHOLD_PCT) {
            return;
        }

        for id in producers {
            let mut p = state.producer_entry_or_default(id);
            if !p.is_operational {
                continue;
            }
            if rng.gen_bool(self.config.failure_prob.clamp(0.0, 1.0)) {
                let duration = rng.gen_range(
                    self.config.failure_rounds_min..=self.config.failure_rounds_max.max(self.config.failure_rounds_min),
                );
                p.is_operational = false;
                p.failure_rounds_remaining = duration;
                p.failure_rounds_total = duration;
                p.prod_kwh = 0.0;
                state.set_producer(id.clone(), p);

                sink.log_event(
                    Event::new(
                        EventKind::ProducerFailed,
                        format!("{id} offline for {duration} rounds"),
                    )
                    .with_round(round_id)
                    .with_agent(id.to_string()),
                );
                // At most one producer goes offline per round.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventSink;
    use crate::state::ProducerState;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn producers(ids: &[&str]) -> Vec<ParticipantId> {
        ids.iter().map(|s| ParticipantId::new(*s)).collect()
    }

    #[test]
    fn no_failure_considered_without_storage_near_full() {
        let controller = FailureController::new(ProducersConfig {
            failure_prob: 1.0,
            ..ProducersConfig::default()
        });
        let state = StateStore::new();
        let sink = InMemoryEventSink::new();
        let mut rng = StdRng::seed_from_u64(1);

        controller.check_and_trigger(1, &producers(&["producer-1"]), &state, &sink, &mut rng);
        assert!(!state.any_producer_failed());
    }

    #[test]
    fn at_most_one_producer_offline_at_a_time() {
        let controller = FailureController::new(ProducersConfig {
            failure_prob: 1.0,
            failure_rounds_min: 2,
            failure_rounds_max: 2,
        });
        let state = StateStore::new();
        state.update_storage(
            ParticipantId::new("storage-1"),
            crate::state::StorageState {
                soc_kwh: 99.0,
                cap_kwh: 100.0,
            },
        );
        let sink = InMemoryEventSink::new();
        let mut rng = StdRng::seed_from_u64(1);

        let ids = producers(&["producer-1", "producer-2"]);
        controller.check_and_trigger(1, &ids, &state, &sink, &mut rng);
        assert!(state.any_producer_failed());

        let offline_count = ids
            .iter()
            .filter(|id| !state.producer_entry_or_default(id).is_operational)
            .count();
        assert_eq!(offline_count, 1);

        // A second call must not take down the second producer too.
        controller.check_and_trigger(2, &ids, &state, &sink, &mut rng);
        let offline_count = ids
            .iter()
            .filter(|id| !state.producer_entry_or_default(id).is_operational)
            .count();
        assert_eq!(offline_count, 1);
    }

    #[test]
    fn already_failed_producer_is_left_untouched() {
        let controller = FailureController::new(ProducersConfig {
            failure_prob: 1.0,
            ..ProducersConfig::default()
        });
        let state = StateStore::new();
        state.update_storage(
            ParticipantId::new("storage-1"),
            crate::state::StorageState {
                soc_kwh: 99.0,
                cap_kwh: 100.0,
            },
        );
        let sink = InMemoryEventSink::new();
        let mut rng = StdRng::seed_from_u64(1);

        let mut p = ProducerState::new();
        p.is_operational = false;
        p.failure_rounds_remaining = 3;
        state.set_producer(ParticipantId::new("producer-1"), p);

        controller.check_and_trigger(1, &producers(&["producer-1"]), &state, &sink, &mut rng);
        let p = state.producer_entry_or_default(&ParticipantId::new("producer-1"));
        assert!(!p.is_operational);
        assert_eq!(p.failure_rounds_remaining, 3);
    }
}
