//! Tracing setup, grounded on the teacher crate's `logger.rs`.

use std::time::Duration;
use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global tracing subscriber. `json` selects structured output
/// (used in production) versus pretty-printed output (used locally).
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .init();
    }
}

/// Opens the span that covers one full round, with fields filled in as the
/// round progresses via [`Span::record`].
pub fn round_span(round_id: u64) -> Span {
    tracing::info_span!(
        "round",
        round_id = round_id,
        phase = field::Empty,
        sim_day = field::Empty,
        sim_hour = field::Empty,
    )
}

/// Runs `fut`, logging a `performance`-targeted warning if it takes longer
/// than `max`. Used around the matching pass and the external-grid draw.
pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
