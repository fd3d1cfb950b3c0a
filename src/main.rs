use std::sync::Arc;

use gridcoord::config::ScenarioConfig;
use gridcoord::events::{EventSink, InMemoryEventSink};
use gridcoord::logger::init_tracing;
use gridcoord::messaging::MessageBus;
use gridcoord::orchestrator::{RoundOrchestrator, COORDINATOR_ID};
use gridcoord::registry::{ExpectedAgents, ParticipantId, ParticipantRegistry};
use gridcoord::state::StateStore;

/// Participant processes (households, producers, storage controllers) are
/// out of scope for this crate; they connect to the coordinator over
/// whatever transport wraps [`MessageBus`] in a full deployment. This binary
/// wires up the coordinator side only and drives rounds until shutdown.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("GRIDCOORD_ENV").as_deref() == Ok("production");
    init_tracing(is_production);

    let config = ScenarioConfig::from_env_or_default();
    let registry = Arc::new(ParticipantRegistry::new());
    let state = Arc::new(StateStore::new());
    let bus = Arc::new(MessageBus::new());
    let sink: Arc<dyn EventSink> = Arc::new(InMemoryEventSink::new());

    let coordinator_inbox = bus.register(ParticipantId::new(COORDINATOR_ID));

    let orchestrator = Arc::new(RoundOrchestrator::new(
        config,
        registry,
        state,
        bus,
        sink,
    ));

    let expected = ExpectedAgents {
        households: std::env::var("GRIDCOORD_EXPECTED_HOUSEHOLDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        producers: std::env::var("GRIDCOORD_EXPECTED_PRODUCERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        storage: std::env::var("GRIDCOORD_EXPECTED_STORAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    };
    orchestrator.await_registration(expected).await;

    let round_loop = tokio::spawn(orchestrator.run_forever(coordinator_inbox));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = round_loop => {
            if let Err(e) = result {
                tracing::error!(error = %e, "round loop task panicked");
            }
        }
    }

    Ok(())
}
