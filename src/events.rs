//! Audit-log event types and the injectable sink that receives them.
//!
//! The original coordinator appended events to a global `db_logger` backed
//! by SQLite. Persisting that log is out of scope here (an external
//! collaborator's concern); instead the core depends only on the
//! [`EventSink`] trait, which anything — an in-memory buffer, a channel, a
//! real database writer living outside this crate — can implement.

use serde::Serialize;

use crate::time::RoundId;

#[derive(Clone, Debug, Serialize)]
pub enum EventKind {
    Registered,
    StatusReport,
    ProductionReport,
    CallForOffers,
    OfferReceived,
    OfferDeclined,
    OfferLate,
    RequestReceived,
    Matched,
    TransmissionLimitHit,
    ExternalGridBuy,
    ExternalGridSell,
    ExternalGridUnavailable,
    ProducerFailed,
    ProducerRecovered,
    EmergencyActivated,
    RoundCompleted,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub timestamp_ms: u64,
    pub round_id: Option<RoundId>,
    pub kind: EventKind,
    pub agent: Option<String>,
    pub price: Option<f64>,
    pub detail: String,
}

impl Event {
    pub fn new(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp_ms: crate::time::now_ms(),
            round_id: None,
            kind,
            agent: None,
            price: None,
            detail: detail.into(),
        }
    }

    pub fn with_round(mut self, round_id: RoundId) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }
}

/// Receives audit events and completed auction summaries.
///
/// Kept deliberately narrow (two operations) per the dependency-injection
/// redesign: the core never knows or cares whether events end up in memory,
/// on stdout, or in a database on the other side of a message queue.
pub trait EventSink: Send + Sync {
    fn log_event(&self, event: Event);

    fn log_auction(&self, round_id: RoundId, summary: &str) {
        self.log_event(
            Event::new(EventKind::RoundCompleted, summary.to_string()).with_round(round_id),
        );
    }
}

/// Default in-memory sink, useful for tests and for scenarios where no
/// external log collector is attached.
#[derive(Default)]
pub struct InMemoryEventSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemoryEventSink {
    fn log_event(&self, event: Event) {
        tracing::debug!(kind = ?event.kind, detail = %event.detail, "event logged");
        self.events.lock().push(event);
    }
}
