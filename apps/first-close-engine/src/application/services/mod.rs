//! Application Services
//!
//! The engine's workers and the state they share.
//!
//! - `EngineState`: today's records, fallback queue and tick buffer
//! - `LiveTickIngestor`: applies feed ticks to today's records
//! - `TodayFallbackCompleter`: completes today's records over REST
//! - `HistoryBackfillEngine`: resumable backward walk over past days
//! - `Orchestrator`: startup, periodic work and shutdown

pub mod backfill;
pub mod fallback;
pub mod fetcher;
pub mod ingest;
pub mod orchestrator;
pub mod retry;
pub mod session_pool;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use backfill::{BackfillCycle, BackfillSettings, HistoryBackfillEngine};
pub use fallback::{FallbackCycle, FallbackSettings, TodayFallbackCompleter};
pub use fetcher::{FetchSettings, WindowFetcher, WindowRequest, WindowResult};
pub use ingest::{LiveTickIngestor, TickOutcome};
pub use orchestrator::{Adapters, EnginePaths, Orchestrator, OrchestratorSettings, StartupError};
pub use retry::{BackoffConfig, ExponentialBackoff, RetryPolicy};
pub use session_pool::{RestSessionPool, SessionPoolError};
pub use state::{EngineCounters, EngineState, StateInner, TickBuffer, TickBufferConfig};
