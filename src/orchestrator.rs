//! The round state machine: `Idle -> CollectStatus -> Classify -> AuctionOpen
//! -> AuctionClosed -> ExternalGrid -> Record -> Sleep -> Idle`.
//!
//! Grounded on `original_source/agents/grid_node/orchestrator.py`'s round
//! body and on the teacher's `scheduler::Scheduler::on_tick` for the overall
//! shape of a periodic, instrumented, async driving loop. Inbound message
//! handling mirrors `original_source/agents/grid_node/receivers.py`; the
//! startup barrier mirrors `original_source/agents/grid_node/startup.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn, Instrument};

use crate::auction::{AuctionEngine, FULL_MATCH_THRESHOLD_PCT};
use crate::capacity::CapacityEnforcer;
use crate::config::ScenarioConfig;
use crate::events::{Event, EventKind, EventSink};
use crate::external_grid::ExternalGridAdapter;
use crate::failure::FailureController;
use crate::ledger::RoundLedger;
use crate::logger::round_span;
use crate::messaging::{
    CallForOffers, ControlCommand, EnvironmentUpdate, Message, MessageBus, OfferAccept,
};
use crate::performance::{PerformanceTracker, RoundRecord};
use crate::registry::{ExpectedAgents, ParticipantId, ParticipantRegistry, Role};
use crate::state::{HouseholdState, ProducerState, StateStore, StorageState};
use crate::time::{RoundClock, SimulatedTime};

pub const COORDINATOR_ID: &str = "coordinator";

/// Everything the round loop needs, grouped so `main.rs` only has to build
/// one value.
pub struct RoundOrchestrator {
    config: ScenarioConfig,
    registry: Arc<ParticipantRegistry>,
    state: Arc<StateStore>,
    bus: Arc<MessageBus>,
    sink: Arc<dyn EventSink>,
    clock: RoundClock,
    capacity: CapacityEnforcer,
    failure: FailureController,
    performance: Mutex<PerformanceTracker>,
    external_grid: Mutex<ExternalGridAdapter>,
    sim_time: Mutex<SimulatedTime>,
    rng: Mutex<StdRng>,
    coordinator_id: ParticipantId,
}

impl RoundOrchestrator {
    pub fn new(
        config: ScenarioConfig,
        registry: Arc<ParticipantRegistry>,
        state: Arc<StateStore>,
        bus: Arc<MessageBus>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let capacity = CapacityEnforcer::with_battery_params(
            config.simulation.agent_limits_kw.clone(),
            config.simulation.transmission_limit_kw,
            config.households.battery_capacity_kwh,
            config.households.battery_charge_rate_kw,
        );
        let failure = FailureController::new(config.producers.clone());
        let performance = Mutex::new(PerformanceTracker::new(config.metrics.report_interval_rounds));
        let external_grid = Mutex::new(ExternalGridAdapter::new(config.external_grid.clone()));

        Self {
            config,
            registry,
            state,
            bus,
            sink,
            clock: RoundClock::new(),
            capacity,
            failure,
            performance,
            external_grid,
            sim_time: Mutex::new(SimulatedTime::initial()),
            rng: Mutex::new(StdRng::from_entropy()),
            coordinator_id: ParticipantId::new(COORDINATOR_ID),
        }
    }

    /// Blocks until at least `expected` agents of each role have registered,
    /// polling every 200ms like `StartupCoordinator.run` in the original.
    /// Broadcasts an initial environment update once the barrier opens.
    pub async fn await_registration(&self, expected: ExpectedAgents) {
        loop {
            if self.registry.counts_meet(expected) {
                break;
            }
            sleep(Duration::from_millis(200)).await;
        }

        let sim_time = *self.sim_time.lock();
        info!(
            households = self.registry.households().len(),
            producers = self.registry.producers().len(),
            storage = self.registry.storage().len(),
            "registration barrier satisfied"
        );
        self.broadcast_environment_update(sim_time);
    }

    /// Runs rounds forever. Intended to be spawned as its own task and
    /// cancelled by dropping it or via `tokio::select!` with a shutdown
    /// signal in `main.rs`.
    pub async fn run_forever(self: Arc<Self>, mut inbox: tokio::sync::mpsc::Receiver<crate::messaging::Envelope>) {
        let mut round_num: u64 = 0;
        loop {
            round_num += 1;
            self.run_round(round_num, &mut inbox).await;
        }
    }

    async fn run_round(&self, round_num: u64, inbox: &mut tokio::sync::mpsc::Receiver<crate::messaging::Envelope>) {
        let round_id = self.clock.next_round_id();
        let span = round_span(round_id);
        span.record("phase", "collect_status");
        let sim_time = *self.sim_time.lock();
        span.record("sim_day", sim_time.day);
        span.record("sim_hour", sim_time.hour);

        async {
            self.registry.reset_status_seen();

            let offers_timeout = Duration::from_secs_f64(self.config.simulation.offers_timeout_seconds);
            let status_grace = Duration::from_secs_f64(self.config.simulation.status_grace_seconds);
            let round_sleep = Duration::from_secs_f64(self.config.simulation.round_sleep_seconds);
            let deadline_ms = crate::time::now_ms() + offers_timeout.as_millis() as u64;

            info!(
                period = sim_time.demand_period().label(),
                "round started"
            );

            let mut ledger = RoundLedger::new(round_id, deadline_ms);

            // Phase: status synchronization (spec.md §4.1 step 2) — wait
            // until either every registered participant has reported for
            // this round, or the grace window has elapsed with at least one
            // report in hand (never run an empty round on startup, §7).
            self.collect_status_reports(inbox, status_grace, &mut ledger).await;

            self.failure.check_and_trigger(
                round_id,
                &self.registry.producers(),
                &self.state,
                self.sink.as_ref(),
                &mut *self.rng.lock(),
            );
            let emergency = self.state.any_producer_failed();
            if emergency {
                self.sink.log_event(
                    Event::new(EventKind::EmergencyActivated, "microgrid operating in emergency mode")
                        .with_round(round_id),
                );
            }

            let households: Vec<(ParticipantId, HouseholdState)> =
                self.state.households_snapshot().into_iter().collect();
            let producers: Vec<(ParticipantId, ProducerState)> =
                self.state.producers_snapshot().into_iter().collect();
            let storage: Vec<(ParticipantId, StorageState)> =
                self.state.storage_snapshot().into_iter().collect();

            let emergency_only_storage = self.registry.emergency_only_storage_ids();
            let engine = AuctionEngine::new(&self.capacity);
            let classification =
                engine.classify(&households, &producers, &storage, emergency, &emergency_only_storage);

            for seller in &classification.sellers {
                ledger.invited_sellers.insert(seller.id.clone());
            }
            for buyer in &classification.buyers {
                ledger.invited_buyers.insert(buyer.id.clone());
            }

            let eligible: Vec<ParticipantId> = ledger
                .invited_sellers
                .union(&ledger.invited_buyers)
                .cloned()
                .collect();

            let cfp = Message::CallForOffers(CallForOffers {
                round_id,
                deadline_ms,
                is_buyer_invite: true,
                is_seller_invite: true,
            });
            self.bus.broadcast(eligible, self.coordinator_id.clone(), cfp);
            self.sink.log_event(
                Event::new(EventKind::CallForOffers, format!("invited {} participants", ledger.invited_sellers.len() + ledger.invited_buyers.len()))
                    .with_round(round_id),
            );

            // Seed requests for buyers directly from their classified need;
            // the originals send their own `energy_request`, but since the
            // classification already knows their need we avoid round-tripping.
            for buyer in &classification.buyers {
                ledger.accept_request(crate::ledger::Request {
                    buyer: buyer.id.clone(),
                    need_kwh: buyer.need_kwh,
                    price_max: self.config.external_grid.microgrid_import_price_max,
                });
            }

            self.drain_inbox(inbox, offers_timeout, &mut ledger).await;

            crate::logger::warn_if_slow("matching", Duration::from_millis(50), async {
                engine.run_match(round_id, &mut ledger, self.sink.as_ref());
            })
            .await;

            for allocation in &ledger.matches {
                self.bus.send(
                    &allocation.seller,
                    self.coordinator_id.clone(),
                    Message::ControlCommand(ControlCommand {
                        round_id,
                        counterparty: allocation.buyer.clone(),
                        kwh: allocation.kwh,
                        price: allocation.price,
                    }),
                );
                self.bus.send(
                    &allocation.buyer,
                    self.coordinator_id.clone(),
                    Message::OfferAccept(OfferAccept {
                        round_id,
                        counterparty: allocation.seller.clone(),
                        kwh: allocation.kwh,
                        price: allocation.price,
                    }),
                );
            }

            let unmet: Vec<(ParticipantId, f64, f64)> = ledger
                .requests
                .iter()
                .map(|r| {
                    (
                        r.buyer.clone(),
                        (r.need_kwh - ledger.received_by_buyer(&r.buyer)).max(0.0),
                        r.price_max,
                    )
                })
                .filter(|(_, shortfall, _)| *shortfall > 0.0)
                .collect();

            // Emergency-only storage never offloads surplus to the external
            // grid: it holds what it has in reserve for the next emergency
            // sell window, regardless of how much it's currently holding.
            let surplus: Vec<(ParticipantId, f64)> = ledger
                .seller_remaining
                .iter()
                .filter(|(id, remaining)| {
                    **remaining > 0.5 && !self.registry.is_emergency_only_storage(id)
                })
                .map(|(id, remaining)| (id.clone(), *remaining))
                .collect();

            let settlement = crate::logger::warn_if_slow(
                "external_grid_draw",
                Duration::from_millis(50),
                async {
                    self.external_grid.lock().settle_round(
                        round_id,
                        &mut ledger,
                        self.capacity.transmission_limit_kw(),
                        &unmet,
                        &surplus,
                        &mut self.rng.lock(),
                        self.sink.as_ref(),
                    )
                },
            )
            .await;

            self.record_round(round_num, round_id, &ledger, &settlement, emergency);

            let post_env_sleep = round_sleep.mul_f64(0.2);
            let pre_env_sleep = round_sleep.saturating_sub(post_env_sleep);
            sleep(pre_env_sleep).await;

            let next_sim_time = {
                let mut t = self.sim_time.lock();
                t.advance();
                *t
            };
            self.broadcast_environment_update(next_sim_time);
            sleep(post_env_sleep).await;
        }
        .instrument(span)
        .await;
    }

    /// Polls every 100ms (per spec.md §5's suspension-point list) until
    /// either every known participant has reported status for this round, or
    /// `grace` has elapsed with at least one report received. A grace
    /// window elapsing with zero reports does not release the barrier —
    /// §7 requires waiting past it rather than running an empty round.
    async fn collect_status_reports(
        &self,
        inbox: &mut tokio::sync::mpsc::Receiver<crate::messaging::Envelope>,
        grace: Duration,
        ledger: &mut RoundLedger,
    ) {
        if self.registry.total_known() == 0 {
            return;
        }

        let grace_deadline = Instant::now() + grace;
        const POLL_INTERVAL: Duration = Duration::from_millis(100);

        loop {
            if self.registry.status_seen_count() >= self.registry.total_known() {
                break;
            }
            let now = Instant::now();
            if now >= grace_deadline && self.registry.status_seen_count() > 0 {
                break;
            }
            let wait = if now < grace_deadline {
                POLL_INTERVAL.min(grace_deadline.saturating_duration_since(now))
            } else {
                POLL_INTERVAL
            };
            match timeout(wait, inbox.recv()).await {
                Ok(Some(envelope)) => self.handle_envelope(envelope, ledger),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    /// Drains whatever inbound messages arrive on the coordinator's inbox
    /// before `budget` elapses, updating registry/state/ledger as it goes.
    /// Mirrors `receivers.py`'s handlers, collapsed into one dispatch loop.
    async fn drain_inbox(
        &self,
        inbox: &mut tokio::sync::mpsc::Receiver<crate::messaging::Envelope>,
        budget: Duration,
        ledger: &mut RoundLedger,
    ) {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, inbox.recv()).await {
                Ok(Some(envelope)) => self.handle_envelope(envelope, ledger),
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    fn handle_envelope(&self, envelope: crate::messaging::Envelope, ledger: &mut RoundLedger) {
        let from = envelope.from;
        match envelope.message {
            Message::RegisterHousehold => self.registry.register(from, Role::Household),
            Message::RegisterProducer => self.registry.register(from, Role::Producer),
            Message::RegisterStorage(registration) => {
                self.registry.register(from.clone(), Role::Storage);
                if registration.emergency_only {
                    self.registry.mark_emergency_only_storage(from);
                }
            }
            Message::StatusReport(report) => {
                self.state.update_household(
                    from.clone(),
                    HouseholdState {
                        demand_kwh: report.demand_kwh,
                        prod_kwh: report.prod_kwh,
                        battery_kwh: report.battery_kwh,
                    },
                );
                self.registry.mark_status_seen(from);
            }
            Message::ProductionReport(report) => {
                let mut producer = self.state.producer_entry_or_default(&from);
                let was_operational = producer.is_operational;
                producer.merge_production_report(report.prod_kwh);
                if !was_operational && producer.is_operational {
                    self.sink.log_event(
                        Event::new(EventKind::ProducerRecovered, format!("{from} back online"))
                            .with_agent(from.to_string()),
                    );
                }
                self.state.set_producer(from.clone(), producer);
                self.registry.mark_status_seen(from);
            }
            Message::StatusBattery(status) => {
                self.state.update_storage(
                    from.clone(),
                    StorageState {
                        soc_kwh: status.soc_kwh,
                        cap_kwh: status.cap_kwh,
                    },
                );
                self.registry.mark_status_seen(from);
            }
            Message::EnergyOffer(offer) => {
                if offer.round_id != ledger.round_id {
                    return;
                }
                if self.registry.role_of(&from) == Some(Role::Producer)
                    && !self.state.producer_entry_or_default(&from).is_operational
                {
                    self.sink.log_event(
                        Event::new(EventKind::OfferLate, format!("{from} offer rejected: producer offline"))
                            .with_round(ledger.round_id)
                            .with_agent(from.to_string()),
                    );
                    return;
                }
                let accepted = ledger.accept_offer(crate::ledger::Offer {
                    seller: from.clone(),
                    offer_kwh: offer.offer_kwh,
                    price: offer.price,
                    timestamp_ms: crate::time::now_ms(),
                });
                if accepted {
                    self.sink.log_event(
                        Event::new(EventKind::OfferReceived, format!("{from} offered {:.3} kWh @ {:.3}", offer.offer_kwh, offer.price))
                            .with_round(ledger.round_id)
                            .with_agent(from.to_string()),
                    );
                } else {
                    self.sink.log_event(
                        Event::new(EventKind::OfferLate, format!("{from} offer arrived after the round deadline"))
                            .with_round(ledger.round_id)
                            .with_agent(from.to_string()),
                    );
                }
            }
            Message::EnergyRequest(request) => {
                if request.round_id != ledger.round_id {
                    return;
                }
                ledger.accept_request(crate::ledger::Request {
                    buyer: from.clone(),
                    need_kwh: request.need_kwh,
                    price_max: request.price_max,
                });
            }
            Message::DeclinedOffer(declined) => {
                if declined.round_id == ledger.round_id {
                    ledger.declined.insert(from);
                }
            }
            Message::EnvironmentUpdate(_)
            | Message::RequestEnvironmentUpdate
            | Message::CallForOffers(_)
            | Message::ControlCommand(_)
            | Message::OfferAccept(_) => {
                warn!(from = %from, "coordinator received an outbound-only message type");
            }
        }
    }

    fn broadcast_environment_update(&self, sim_time: SimulatedTime) {
        let targets: Vec<ParticipantId> = self
            .registry
            .households()
            .into_iter()
            .chain(self.registry.producers())
            .chain(self.registry.storage())
            .collect();
        self.bus.broadcast(
            targets,
            self.coordinator_id.clone(),
            Message::EnvironmentUpdate(EnvironmentUpdate {
                sim_day: sim_time.day,
                sim_hour: sim_time.hour,
            }),
        );
    }

    fn record_round(
        &self,
        round_num: u64,
        round_id: crate::time::RoundId,
        ledger: &RoundLedger,
        settlement: &crate::external_grid::RoundSettlement,
        emergency: bool,
    ) {
        let total_demand: f64 = ledger.requests.iter().map(|r| r.need_kwh).sum();
        let matched_kwh = ledger.total_matched_kwh();
        let market_value: f64 = ledger.matches.iter().map(|a| a.kwh * a.price).sum();

        let total_supplied = matched_kwh + settlement.sold_kwh;

        let mut buyer_fulfillment: HashMap<ParticipantId, f64> = HashMap::new();
        for request in ledger.requests.iter() {
            let total_received =
                ledger.received_by_buyer(&request.buyer) + ledger.external_received_by_buyer(&request.buyer);
            buyer_fulfillment.insert(
                request.buyer.clone(),
                AuctionEngine::fulfillment_pct(total_received, request.need_kwh),
            );
        }

        let unsold_remaining: f64 = ledger.seller_remaining.values().filter(|kwh| **kwh > 0.0).sum();
        let wasted_energy_kwh = (unsold_remaining - settlement.bought_kwh).max(0.0);

        let record = RoundRecord {
            round_num,
            total_demand_kwh: total_demand,
            total_supplied_kwh: total_supplied,
            market_value,
            wasted_energy_kwh,
            ext_grid_sold_kwh: settlement.sold_kwh,
            ext_grid_bought_kwh: settlement.bought_kwh,
            // Per original_source/agents/grid_node/orchestrator.py's
            // round_data construction: "sold_value" (the microgrid's side of
            // selling surplus TO the external grid) is paired with the
            // dollar total from the *bought_kwh* settlement leg, and
            // vice versa. Numerically this is the correct MG-perspective
            // value for each kWh leg; see DESIGN.md's note on the legacy
            // price-naming ambiguity.
            ext_grid_sold_value: settlement.costs,
            ext_grid_bought_value: settlement.revenue,
            buyer_fulfillment,
            any_producer_failed: self.state.any_producer_failed(),
            emergency_used: emergency,
        };

        let avg_fulfillment = record.avg_fulfillment();
        if let Some(summary) = self.performance.lock().record_round(record) {
            info!(summary = %summary, "periodic performance summary");
        }

        self.sink.log_auction(
            round_id,
            &format!(
                "{matched_kwh:.3} kWh matched internally, avg fulfillment {avg_fulfillment:.1}% ({})",
                if avg_fulfillment >= FULL_MATCH_THRESHOLD_PCT { "full" } else { "partial" }
            ),
        );
    }
}
