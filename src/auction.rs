//! Seller/buyer classification and the greedy matching pass.
//!
//! Classification thresholds and the matching algorithm are grounded on
//! `original_source/agents/grid_node/orchestrator.py`'s round body: a
//! producer sells when it is operational and producing more than a noise
//! floor; a household sells its surplus when it is a prosumer; storage sells
//! when nearly full (or, during an emergency, whenever any producer is
//! down and it still holds charge above the emergency floor). Matching
//! itself sorts a buyer's eligible sellers by `(price, id)` and greedily
//! fills demand, capping at the transmission limit and recording a
//! `TransmissionLimitHit` event whenever a cap — not a price mismatch —
//! is the reason a buyer went unfilled.

use std::collections::HashSet;

use crate::capacity::CapacityEnforcer;
use crate::events::{Event, EventKind, EventSink};
use crate::ledger::{Allocation, RoundLedger};
use crate::registry::ParticipantId;
use crate::state::{HouseholdState, ProducerState, StorageState};
use crate::time::RoundId;

/// Minimum production/surplus considered non-noise, mirroring the `0.01`
/// epsilon used throughout the original's classification checks.
const NOISE_FLOOR_KWH: f64 = 0.01;

/// Storage is treated as "nearly full" (and therefore a non-emergency
/// seller) at or above this state of charge.
const STORAGE_SELL_THRESHOLD_PCT: f64 = 95.0;

/// During an emergency, storage keeps selling down to this floor rather than
/// the full 95% threshold, trading a larger emergency reserve for keeping
/// the lights on.
const STORAGE_EMERGENCY_FLOOR_PCT: f64 = 20.0;

/// During an emergency, storage keeps buying until it reaches this state of
/// charge rather than the normal 95% cutoff.
const STORAGE_EMERGENCY_BUY_CEILING_PCT: f64 = 99.0;

/// A fulfillment percentage at or above this value counts as a full match
/// for blackout/reliability accounting (resolved to 99.0, not the 99.9
/// threshold seen in the original's print-only branch — see DESIGN.md).
pub const FULL_MATCH_THRESHOLD_PCT: f64 = 99.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantRole {
    Producer,
    Prosumer,
    StorageUnit,
}

#[derive(Clone, Debug)]
pub struct SellCandidate {
    pub id: ParticipantId,
    pub role: ParticipantRole,
    pub available_kwh: f64,
}

#[derive(Clone, Debug)]
pub struct BuyCandidate {
    pub id: ParticipantId,
    pub need_kwh: f64,
}

#[derive(Default)]
pub struct Classification {
    pub sellers: Vec<SellCandidate>,
    pub buyers: Vec<BuyCandidate>,
}

pub struct AuctionEngine<'a> {
    capacity: &'a CapacityEnforcer,
}

impl<'a> AuctionEngine<'a> {
    pub fn new(capacity: &'a CapacityEnforcer) -> Self {
        Self { capacity }
    }

    pub fn classify(
        &self,
        households: &[(ParticipantId, HouseholdState)],
        producers: &[(ParticipantId, ProducerState)],
        storage: &[(ParticipantId, StorageState)],
        any_producer_failed: bool,
        emergency_only_storage: &HashSet<ParticipantId>,
    ) -> Classification {
        let mut out = Classification::default();

        for (id, p) in producers {
            if p.is_operational && p.prod_kwh > NOISE_FLOOR_KWH {
                let available = self.capacity.effective_producer_sell_kwh(p);
                if available > NOISE_FLOOR_KWH {
                    out.sellers.push(SellCandidate {
                        id: id.clone(),
                        role: ParticipantRole::Producer,
                        available_kwh: available,
                    });
                }
            }
        }

        for (id, h) in households {
            if h.is_prosumer() && h.net_surplus_kwh() > NOISE_FLOOR_KWH {
                let available = self.capacity.effective_household_sell_kwh(h);
                if available > NOISE_FLOOR_KWH {
                    out.sellers.push(SellCandidate {
                        id: id.clone(),
                        role: ParticipantRole::Prosumer,
                        available_kwh: available,
                    });
                }
            }
            if h.net_demand_kwh() > NOISE_FLOOR_KWH {
                out.buyers.push(BuyCandidate {
                    id: id.clone(),
                    need_kwh: self.capacity.effective_household_buy_kwh(h),
                });
            }
        }

        for (id, s) in storage {
            let soc_pct = s.soc_pct();
            let is_emergency_only = emergency_only_storage.contains(id);

            let is_seller = if is_emergency_only {
                any_producer_failed && soc_pct > STORAGE_EMERGENCY_FLOOR_PCT
            } else {
                soc_pct >= STORAGE_SELL_THRESHOLD_PCT
            };
            if is_seller {
                let available = self.capacity.effective_storage_sell_kwh(s);
                if available > NOISE_FLOOR_KWH {
                    out.sellers.push(SellCandidate {
                        id: id.clone(),
                        role: ParticipantRole::StorageUnit,
                        available_kwh: available,
                    });
                }
            }

            let is_buyer = if is_emergency_only {
                soc_pct < STORAGE_EMERGENCY_BUY_CEILING_PCT && !any_producer_failed
            } else {
                soc_pct < STORAGE_SELL_THRESHOLD_PCT
            };
            if is_buyer {
                let need = self.capacity.effective_storage_buy_kwh(s);
                if need > NOISE_FLOOR_KWH {
                    out.buyers.push(BuyCandidate {
                        id: id.clone(),
                        need_kwh: need,
                    });
                }
            }
        }

        out
    }

    /// Runs the greedy matching pass over a ledger whose offers and requests
    /// have already been collected. Buyers are processed in arrival order —
    /// the order their `energy_request` reached the coordinator, per
    /// spec.md §4.3/§5 — not sorted by id; each buyer's eligible sellers are
    /// sorted by `(price asc, seller id asc)` and filled until its need, the
    /// seller's remaining offer, or the transmission budget is exhausted.
    pub fn run_match(
        &self,
        round_id: RoundId,
        ledger: &mut RoundLedger,
        sink: &dyn EventSink,
    ) {
        let transmission_limit = self.capacity.transmission_limit_kw();

        let buyer_ids: Vec<ParticipantId> = ledger.requests.iter().map(|r| r.buyer.clone()).collect();

        for buyer in buyer_ids {
            let request = ledger.request_for(&buyer).cloned().expect("buyer present");

            let mut sellers: Vec<(f64, ParticipantId, f64)> = ledger
                .offers
                .values()
                .filter(|o| {
                    ledger.remaining_for_seller(&o.seller) > NOISE_FLOOR_KWH
                        && o.price <= request.price_max
                })
                .map(|o| (o.price, o.seller.clone(), o.price))
                .collect();
            // Tie-break on (price, id): Vec<(f64, ParticipantId, f64)> sorts
            // lexicographically by the derived Ord-compatible tuple below.
            sellers.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });

            for (price, seller, _) in sellers {
                let remaining_need = request.need_kwh - ledger.received_by_buyer(&buyer);
                let remaining_transmission =
                    (transmission_limit - ledger.transmission_used_by_buyer(&buyer)).max(0.0);
                if remaining_need <= NOISE_FLOOR_KWH || remaining_transmission <= 0.0 {
                    break;
                }

                let seller_available = ledger.remaining_for_seller(&seller);
                let intended = remaining_need.min(seller_available);
                let amount = intended.min(remaining_transmission);

                if amount <= 0.0 {
                    continue;
                }

                if amount < intended {
                    sink.log_event(
                        Event::new(
                            EventKind::TransmissionLimitHit,
                            format!("{buyer} capped by transmission limit buying from {seller}"),
                        )
                        .with_round(round_id)
                        .with_agent(buyer.to_string()),
                    );
                }

                ledger.record_allocation(Allocation {
                    seller: seller.clone(),
                    buyer: buyer.clone(),
                    kwh: amount,
                    price,
                });

                sink.log_event(
                    Event::new(
                        EventKind::Matched,
                        format!("{buyer} bought {amount:.3} kWh from {seller} @ {price:.3}"),
                    )
                    .with_round(round_id)
                    .with_agent(buyer.to_string())
                    .with_price(price),
                );
            }
        }
    }

    /// Fulfillment percentage for a buyer given how much it received versus
    /// what it asked for. Callers treat `>= FULL_MATCH_THRESHOLD_PCT` as a
    /// full match.
    pub fn fulfillment_pct(received_kwh: f64, need_kwh: f64) -> f64 {
        if need_kwh <= 0.0 {
            100.0
        } else {
            ((received_kwh / need_kwh) * 100.0).min(100.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoleLimits;
    use crate::events::InMemoryEventSink;
    use crate::ledger::{Offer, Request};

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn capacity() -> CapacityEnforcer {
        CapacityEnforcer::new(RoleLimits::default(), 35.0)
    }

    #[test]
    fn classify_marks_operational_producer_with_surplus_as_seller() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let producers = vec![(
            pid("producer-1"),
            ProducerState {
                prod_kwh: 10.0,
                is_operational: true,
                failure_rounds_remaining: 0,
                failure_rounds_total: 0,
            },
        )];
        let class = engine.classify(&[], &producers, &[], false, &HashSet::new());
        assert_eq!(class.sellers.len(), 1);
        assert_eq!(class.sellers[0].role, ParticipantRole::Producer);
    }

    #[test]
    fn classify_skips_offline_producer() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let producers = vec![(
            pid("producer-1"),
            ProducerState {
                prod_kwh: 10.0,
                is_operational: false,
                failure_rounds_remaining: 2,
                failure_rounds_total: 2,
            },
        )];
        let class = engine.classify(&[], &producers, &[], false, &HashSet::new());
        assert!(class.sellers.is_empty());
    }

    #[test]
    fn emergency_only_storage_sells_only_during_a_producer_failure() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let storage_id = pid("storage-1");
        let storage = vec![(
            storage_id.clone(),
            StorageState {
                soc_kwh: 50.0,
                cap_kwh: 100.0,
            },
        )];
        let mut emergency_only = HashSet::new();
        emergency_only.insert(storage_id);

        let normal = engine.classify(&[], &[], &storage, false, &emergency_only);
        assert!(normal.sellers.is_empty());

        let emergency = engine.classify(&[], &[], &storage, true, &emergency_only);
        assert_eq!(emergency.sellers.len(), 1);
    }

    #[test]
    fn non_emergency_storage_ignores_producer_failure_state() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let storage = vec![(
            pid("storage-1"),
            StorageState {
                soc_kwh: 50.0,
                cap_kwh: 100.0,
            },
        )];
        // Below the 95% sell threshold: not a seller whether or not a
        // producer has failed, because this unit isn't emergency-only.
        let class = engine.classify(&[], &[], &storage, true, &HashSet::new());
        assert!(class.sellers.is_empty());
    }

    #[test]
    fn storage_emergency_floor_still_applies_under_emergency_rules() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let storage_id = pid("storage-1");
        let storage = vec![(
            storage_id.clone(),
            StorageState {
                soc_kwh: 15.0,
                cap_kwh: 100.0,
            },
        )];
        let mut emergency_only = HashSet::new();
        emergency_only.insert(storage_id);

        // 15% soc is above the 20% eligibility check's complement but below
        // the 20% floor itself (15 - 0.2*100 < 0), so no deliverable energy.
        let class = engine.classify(&[], &[], &storage, true, &emergency_only);
        assert!(class.sellers.is_empty());
    }

    #[test]
    fn matching_prefers_cheaper_seller_then_lower_id() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let sink = InMemoryEventSink::new();
        let mut ledger = RoundLedger::new(1, 10_000);

        ledger.accept_offer(Offer {
            seller: pid("producer-b"),
            offer_kwh: 5.0,
            price: 0.20,
            timestamp_ms: 0,
        });
        ledger.accept_offer(Offer {
            seller: pid("producer-a"),
            offer_kwh: 5.0,
            price: 0.20,
            timestamp_ms: 0,
        });
        ledger.accept_request(Request {
            buyer: pid("household-1"),
            need_kwh: 3.0,
            price_max: 0.30,
        });

        engine.run_match(1, &mut ledger, &sink);

        assert_eq!(ledger.matches.len(), 1);
        assert_eq!(ledger.matches[0].seller, pid("producer-a"));
        assert_eq!(ledger.matches[0].kwh, 3.0);
    }

    #[test]
    fn matching_splits_across_two_sellers_when_one_is_insufficient() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let sink = InMemoryEventSink::new();
        let mut ledger = RoundLedger::new(1, 10_000);

        ledger.accept_offer(Offer {
            seller: pid("producer-a"),
            offer_kwh: 2.0,
            price: 0.15,
            timestamp_ms: 0,
        });
        ledger.accept_offer(Offer {
            seller: pid("producer-b"),
            offer_kwh: 5.0,
            price: 0.20,
            timestamp_ms: 0,
        });
        ledger.accept_request(Request {
            buyer: pid("household-1"),
            need_kwh: 4.0,
            price_max: 0.30,
        });

        engine.run_match(1, &mut ledger, &sink);

        assert_eq!(ledger.matches.len(), 2);
        assert_eq!(ledger.total_matched_kwh(), 4.0);
    }

    #[test]
    fn matching_respects_transmission_limit_and_logs_the_cap() {
        let cap = CapacityEnforcer::new(RoleLimits::default(), 2.0);
        let engine = AuctionEngine::new(&cap);
        let sink = InMemoryEventSink::new();
        let mut ledger = RoundLedger::new(1, 10_000);

        ledger.accept_offer(Offer {
            seller: pid("producer-a"),
            offer_kwh: 10.0,
            price: 0.15,
            timestamp_ms: 0,
        });
        ledger.accept_request(Request {
            buyer: pid("household-1"),
            need_kwh: 5.0,
            price_max: 0.30,
        });

        engine.run_match(1, &mut ledger, &sink);

        assert_eq!(ledger.total_matched_kwh(), 2.0);
        assert!(!sink.is_empty());
    }

    #[test]
    fn matching_excludes_sellers_priced_above_buyer_ceiling() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let sink = InMemoryEventSink::new();
        let mut ledger = RoundLedger::new(1, 10_000);

        ledger.accept_offer(Offer {
            seller: pid("producer-a"),
            offer_kwh: 5.0,
            price: 0.50,
            timestamp_ms: 0,
        });
        ledger.accept_request(Request {
            buyer: pid("household-1"),
            need_kwh: 5.0,
            price_max: 0.30,
        });

        engine.run_match(1, &mut ledger, &sink);
        assert!(ledger.matches.is_empty());
    }

    #[test]
    fn buyers_are_matched_in_arrival_order_not_id_order() {
        let cap = capacity();
        let engine = AuctionEngine::new(&cap);
        let sink = InMemoryEventSink::new();
        let mut ledger = RoundLedger::new(1, 10_000);

        ledger.accept_offer(Offer {
            seller: pid("producer-a"),
            offer_kwh: 3.0,
            price: 0.10,
            timestamp_ms: 0,
        });

        // "household-z" requests first even though its id sorts after
        // "household-a"; arrival order, not id order, decides who gets the
        // only seller's entire offer.
        ledger.accept_request(Request {
            buyer: pid("household-z"),
            need_kwh: 3.0,
            price_max: 0.30,
        });
        ledger.accept_request(Request {
            buyer: pid("household-a"),
            need_kwh: 3.0,
            price_max: 0.30,
        });

        engine.run_match(1, &mut ledger, &sink);

        assert_eq!(ledger.matches.len(), 1);
        assert_eq!(ledger.matches[0].buyer, pid("household-z"));
        assert_eq!(ledger.received_by_buyer(&pid("household-a")), 0.0);
    }

    #[test]
    fn fulfillment_pct_caps_at_one_hundred() {
        assert_eq!(AuctionEngine::fulfillment_pct(6.0, 5.0), 100.0);
        assert_eq!(AuctionEngine::fulfillment_pct(0.0, 0.0), 100.0);
        assert!((AuctionEngine::fulfillment_pct(2.5, 5.0) - 50.0).abs() < 1e-9);
    }
}
