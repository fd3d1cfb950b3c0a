//! Round-keyed ledger of offers, requests and allocations.
//!
//! The original source scattered this across several `*_round[R]`
//! dictionaries (`offers_round`, `requests_round`, `invited_round`,
//! `declined_round`) rebuilt fresh each round. Per the redesign flag in
//! spec.md §9 this core collapses them into one [`RoundLedger`] per round,
//! constructed fresh by the orchestrator and discarded at round end.

use std::collections::{HashMap, HashSet};

use crate::registry::ParticipantId;
use crate::time::RoundId;

#[derive(Clone, Debug)]
pub struct Offer {
    pub seller: ParticipantId,
    pub offer_kwh: f64,
    pub price: f64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub buyer: ParticipantId,
    pub need_kwh: f64,
    pub price_max: f64,
}

#[derive(Clone, Debug)]
pub struct Allocation {
    pub seller: ParticipantId,
    pub buyer: ParticipantId,
    pub kwh: f64,
    pub price: f64,
}

/// All state scoped to a single round: who was invited, who answered, who
/// declined, and what was matched. Built by [`crate::orchestrator::RoundOrchestrator`]
/// at the start of each round and handed to [`crate::auction::AuctionEngine`].
#[derive(Debug)]
pub struct RoundLedger {
    pub round_id: RoundId,
    pub deadline_ms: u64,
    pub invited_sellers: HashSet<ParticipantId>,
    pub invited_buyers: HashSet<ParticipantId>,
    pub offers: HashMap<ParticipantId, Offer>,
    /// Requests in the order their `energy_request` arrived (spec.md §4.3:
    /// "iterate buyers in insertion order of their requests"). A `HashMap`
    /// would lose that order, and buyers compete for the same
    /// `seller_remaining`, so the order a limited cheap seller gets split
    /// between them is observable.
    pub requests: Vec<Request>,
    pub declined: HashSet<ParticipantId>,
    pub matches: Vec<Allocation>,
    /// Remaining offered kWh per seller after allocations are subtracted.
    pub seller_remaining: HashMap<ParticipantId, f64>,
    /// kWh received so far per buyer, used to cap at `need_kwh`.
    pub buyer_received: HashMap<ParticipantId, f64>,
    /// kWh delivered to each buyer by the external grid this round, counted
    /// against the same per-buyer transmission budget as internal matches.
    pub buyer_external_received: HashMap<ParticipantId, f64>,
}

impl RoundLedger {
    pub fn new(round_id: RoundId, deadline_ms: u64) -> Self {
        Self {
            round_id,
            deadline_ms,
            invited_sellers: HashSet::new(),
            invited_buyers: HashSet::new(),
            offers: HashMap::new(),
            requests: Vec::new(),
            declined: HashSet::new(),
            matches: Vec::new(),
            seller_remaining: HashMap::new(),
            buyer_received: HashMap::new(),
            buyer_external_received: HashMap::new(),
        }
    }

    /// Accepts an offer only if it arrived before the round deadline. Late
    /// offers are rejected by the caller (see `messaging`/`orchestrator`),
    /// which logs an `OfferLate` event instead of inserting here.
    pub fn accept_offer(&mut self, offer: Offer) -> bool {
        if offer.timestamp_ms > self.deadline_ms {
            return false;
        }
        self.seller_remaining.insert(offer.seller.clone(), offer.offer_kwh);
        self.offers.insert(offer.seller.clone(), offer);
        true
    }

    /// Re-requesting within the same round updates the existing entry
    /// in place rather than moving it to the back, matching the original's
    /// dict-keyed-by-jid semantics (re-assigning an existing key does not
    /// change its iteration position).
    pub fn accept_request(&mut self, request: Request) {
        self.buyer_received.insert(request.buyer.clone(), 0.0);
        match self.requests.iter_mut().find(|r| r.buyer == request.buyer) {
            Some(existing) => *existing = request,
            None => self.requests.push(request),
        }
    }

    pub fn request_for(&self, buyer: &ParticipantId) -> Option<&Request> {
        self.requests.iter().find(|r| r.buyer == *buyer)
    }

    pub fn remaining_for_seller(&self, seller: &ParticipantId) -> f64 {
        *self.seller_remaining.get(seller).unwrap_or(&0.0)
    }

    pub fn received_by_buyer(&self, buyer: &ParticipantId) -> f64 {
        *self.buyer_received.get(buyer).unwrap_or(&0.0)
    }

    pub fn external_received_by_buyer(&self, buyer: &ParticipantId) -> f64 {
        *self.buyer_external_received.get(buyer).unwrap_or(&0.0)
    }

    /// Everything `buyer` has been delivered this round, internal matches
    /// plus external-grid imports, against which the per-buyer
    /// `TRANSMISSION_LIMIT_KW` budget is enforced (spec.md §4.3).
    pub fn transmission_used_by_buyer(&self, buyer: &ParticipantId) -> f64 {
        self.received_by_buyer(buyer) + self.external_received_by_buyer(buyer)
    }

    pub fn record_external_delivery(&mut self, buyer: ParticipantId, kwh: f64) {
        *self.buyer_external_received.entry(buyer).or_insert(0.0) += kwh;
    }

    pub fn record_allocation(&mut self, allocation: Allocation) {
        *self
            .seller_remaining
            .entry(allocation.seller.clone())
            .or_insert(0.0) -= allocation.kwh;
        *self
            .buyer_received
            .entry(allocation.buyer.clone())
            .or_insert(0.0) += allocation.kwh;
        self.matches.push(allocation);
    }

    pub fn total_matched_kwh(&self) -> f64 {
        self.matches.iter().map(|a| a.kwh).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn accept_offer_rejects_timestamps_past_deadline() {
        let mut ledger = RoundLedger::new(1, 1_000);
        let accepted = ledger.accept_offer(Offer {
            seller: pid("producer-1"),
            offer_kwh: 5.0,
            price: 0.2,
            timestamp_ms: 1_001,
        });
        assert!(!accepted);
        assert!(ledger.offers.is_empty());
    }

    #[test]
    fn accept_offer_within_deadline_seeds_seller_remaining() {
        let mut ledger = RoundLedger::new(1, 1_000);
        let accepted = ledger.accept_offer(Offer {
            seller: pid("producer-1"),
            offer_kwh: 5.0,
            price: 0.2,
            timestamp_ms: 999,
        });
        assert!(accepted);
        assert_eq!(ledger.remaining_for_seller(&pid("producer-1")), 5.0);
    }

    #[test]
    fn record_allocation_updates_remaining_and_received() {
        let mut ledger = RoundLedger::new(1, 1_000);
        ledger.accept_offer(Offer {
            seller: pid("producer-1"),
            offer_kwh: 5.0,
            price: 0.2,
            timestamp_ms: 0,
        });
        ledger.accept_request(Request {
            buyer: pid("household-1"),
            need_kwh: 3.0,
            price_max: 0.3,
        });
        ledger.record_allocation(Allocation {
            seller: pid("producer-1"),
            buyer: pid("household-1"),
            kwh: 3.0,
            price: 0.2,
        });
        assert_eq!(ledger.remaining_for_seller(&pid("producer-1")), 2.0);
        assert_eq!(ledger.received_by_buyer(&pid("household-1")), 3.0);
        assert_eq!(ledger.total_matched_kwh(), 3.0);
    }

    #[test]
    fn requests_preserve_arrival_order_and_update_in_place_on_re_request() {
        let mut ledger = RoundLedger::new(1, 1_000);
        ledger.accept_request(Request {
            buyer: pid("household-z"),
            need_kwh: 1.0,
            price_max: 0.3,
        });
        ledger.accept_request(Request {
            buyer: pid("household-a"),
            need_kwh: 2.0,
            price_max: 0.3,
        });
        // Re-requesting an existing buyer updates its entry without moving
        // it to the back of arrival order.
        ledger.accept_request(Request {
            buyer: pid("household-z"),
            need_kwh: 4.0,
            price_max: 0.3,
        });

        let order: Vec<_> = ledger.requests.iter().map(|r| r.buyer.clone()).collect();
        assert_eq!(order, vec![pid("household-z"), pid("household-a")]);
        assert_eq!(ledger.request_for(&pid("household-z")).unwrap().need_kwh, 4.0);
    }
}
