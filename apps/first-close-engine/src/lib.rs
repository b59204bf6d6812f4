#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! First-Close Engine
//!
//! Maintains the closing prices of the first 1-, 5- and 15-minute bars after
//! the market open for every symbol in a catalog.
//!
//! Today's closes come from live ticks, with a REST fallback for symbols the
//! feed did not complete. Past days are filled by a resumable backward walk
//! over one-minute history.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market clock, symbols, records and backfill cursors
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed, historical quote, session and symbol source interfaces
//!   - `services`: Tick ingestion, fallback, backfill and orchestration
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `noren`: Broker REST and WebSocket clients
//!   - `store`: SQLite tables and the snapshot file
//!   - `catalog`: Symbol files with a fingerprinted cache
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! feed ticks ──► LiveTickIngestor ──┐
//!                                   ├──► EngineState ──► store + snapshot
//! REST bars ──► TodayFallbackCompleter
//! REST bars ──► HistoryBackfillEngine ─────────────────► store
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::{
    BackfillState, Bar, FirstCloseRecord, FirstCloses, MarketClock, Slot, Snapshot, Symbol,
    SymbolKey, SymbolMap,
};

// Ports
pub use application::ports::{
    FeedConnector, FeedEvent, FeedHandle, FeedTick, FetchError, HistoricalQuoteSource,
    MarketDataFeed, SessionError, SessionFactory, SessionToken, SymbolSourceAcquirer,
};

// Engine
pub use application::services::{
    Adapters, EnginePaths, Orchestrator, OrchestratorSettings, StartupError,
};

// Infrastructure config
pub use infrastructure::config::{BrokerCredentials, ConfigError, EngineConfig};

// Store (for integration tests)
pub use infrastructure::store::Store;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
