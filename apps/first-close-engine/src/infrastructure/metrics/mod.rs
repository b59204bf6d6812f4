//! Prometheus Metrics Module
//!
//! Exposes engine metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: received from the feed, written to the tick log
//! - **Fills**: slots filled, by source (tick or REST)
//! - **Workers**: fallback and backfill outcomes, pending gauges
//! - **Connections**: feed state, reconnects, REST sessions
//!
//! # Integration
//!
//! Metrics are served at `/metrics` by the exporter's own HTTP listener on
//! `FIRST_CLOSE_METRICS_PORT`. Without an installed recorder every function
//! here is a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::application::ports::FetchError;
use crate::domain::{FirstCloses, Slot};

// =============================================================================
// Recorder Installation
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Port 0 leaves metrics disabled. Returns the listen address when this
/// call installed the recorder, `None` when disabled or already installed.
/// Must run inside the tokio runtime.
pub fn init_metrics(port: u16) -> Result<Option<SocketAddr>, BuildError> {
    if port == 0 || INSTALLED.get().is_some() {
        return Ok(None);
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    let _ = INSTALLED.set(addr);
    register_metrics();
    Ok(Some(addr))
}

/// Listen address of the installed exporter.
#[must_use]
pub fn metrics_addr() -> Option<SocketAddr> {
    INSTALLED.get().copied()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ticks
    describe_counter!(
        "first_close_ticks_received_total",
        "Ticks received from the market data feed"
    );
    describe_counter!(
        "first_close_ticks_flushed_total",
        "Ticks written to the tick log"
    );

    // Fills
    describe_counter!(
        "first_close_slot_fills_total",
        "First-close slots filled, by slot and source"
    );

    // REST
    describe_counter!(
        "first_close_fetches_total",
        "Window fetches by outcome"
    );
    describe_gauge!(
        "first_close_rest_sessions",
        "Attached REST sessions"
    );

    // Workers
    describe_counter!(
        "first_close_fallback_outcomes_total",
        "Today's fallback results by outcome"
    );
    describe_gauge!(
        "first_close_fallback_pending",
        "Symbols waiting for today's fallback"
    );
    describe_counter!(
        "first_close_backfill_outcomes_total",
        "Historical day fetches by outcome"
    );
    describe_gauge!(
        "first_close_backfill_pending",
        "Symbols whose history walk is unfinished"
    );

    // Output
    describe_counter!(
        "first_close_snapshot_writes_total",
        "Snapshot files written"
    );
    describe_gauge!(
        "first_close_complete_symbols",
        "Symbols with all three of today's closes"
    );

    // Feed
    describe_gauge!(
        "first_close_feed_connected",
        "1 while the market data feed is connected"
    );
    describe_gauge!(
        "first_close_feed_subscriptions",
        "Symbol keys subscribed on the feed"
    );
    describe_counter!(
        "first_close_feed_reconnects_total",
        "Feed reconnection attempts"
    );
    describe_counter!(
        "first_close_feed_errors_total",
        "Feed errors by type"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Where a filled close came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSource {
    /// Live feed tick.
    Tick,
    /// REST window fetch.
    Rest,
}

impl FillSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Rest => "rest",
        }
    }
}

/// Result of one fallback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// All three closes known.
    Done,
    /// Still pending.
    Retry,
    /// Retries exhausted for today.
    GaveUp,
}

impl FallbackOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retry => "retry",
            Self::GaveUp => "gave_up",
        }
    }
}

/// Result of one historical day fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// At least one close found.
    Found,
    /// No close found.
    Empty,
    /// Fetch failed.
    Failed,
}

impl BackfillOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Empty => "empty",
            Self::Failed => "failed",
        }
    }
}

const fn fetch_label(result: &Result<FirstCloses, FetchError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(FetchError::Timeout) => "timeout",
        Err(FetchError::Transport(_)) => "transport",
        Err(FetchError::Status(_)) => "status",
        Err(FetchError::RateLimited { .. }) => "rate_limited",
        Err(FetchError::Rejected(_)) => "rejected",
        Err(FetchError::SessionExpired) => "session_expired",
    }
}

fn as_gauge(value: usize) -> f64 {
    value as f64
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one tick received from the feed.
pub fn record_tick_received() {
    counter!("first_close_ticks_received_total").increment(1);
}

/// Record ticks written to the tick log.
pub fn record_ticks_flushed(count: usize) {
    counter!("first_close_ticks_flushed_total").increment(count as u64);
}

/// Record a slot fill.
pub fn record_slot_fill(slot: Slot, source: FillSource) {
    counter!(
        "first_close_slot_fills_total",
        "slot" => slot.as_str(),
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record the final result of one window fetch.
pub fn record_fetch(result: &Result<FirstCloses, FetchError>) {
    counter!("first_close_fetches_total", "outcome" => fetch_label(result)).increment(1);
}

/// Update the number of attached REST sessions.
pub fn set_rest_sessions(count: usize) {
    gauge!("first_close_rest_sessions").set(as_gauge(count));
}

/// Record a fallback outcome.
pub fn record_fallback_outcome(outcome: FallbackOutcome) {
    counter!(
        "first_close_fallback_outcomes_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Update the fallback pending gauge.
pub fn set_fallback_pending(count: usize) {
    gauge!("first_close_fallback_pending").set(as_gauge(count));
}

/// Record a backfill outcome.
pub fn record_backfill_outcome(outcome: BackfillOutcome) {
    counter!(
        "first_close_backfill_outcomes_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Update the backfill pending gauge.
pub fn set_backfill_pending(count: usize) {
    gauge!("first_close_backfill_pending").set(as_gauge(count));
}

/// Record a snapshot write.
pub fn record_snapshot_write() {
    counter!("first_close_snapshot_writes_total").increment(1);
}

/// Update the number of symbols complete for today.
pub fn set_complete_symbols(count: usize) {
    gauge!("first_close_complete_symbols").set(as_gauge(count));
}

/// Update the feed connection state.
pub fn set_feed_connected(connected: bool) {
    gauge!("first_close_feed_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the number of subscribed keys.
pub fn set_feed_subscriptions(count: usize) {
    gauge!("first_close_feed_subscriptions").set(as_gauge(count));
}

/// Record a feed reconnection attempt.
pub fn record_feed_reconnect() {
    counter!("first_close_feed_reconnects_total").increment(1);
}

/// Record a feed error.
pub fn record_feed_error(error_type: &'static str) {
    counter!("first_close_feed_errors_total", "error_type" => error_type).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
