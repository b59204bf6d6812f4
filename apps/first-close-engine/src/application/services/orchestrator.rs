//! Orchestrator
//!
//! Startup sequencing, the 1 Hz supervisory loop and the shutdown flush.
//!
//! # Startup
//!
//! ```text
//! catalog ─► store ─► today's records ─► backfill seed ─► pending set
//!    ─► login + session pool ─► feed connected ─► subscribe (batched)
//!    ─► tick consumer + fallback completer + history backfill
//! ```
//!
//! Any failure before the workers start is fatal.
//!
//! # Shutdown
//!
//! Workers observe cancellation between batches. After they stop (or the
//! shutdown timeout passes) buffered ticks and dirty records are flushed, a
//! final snapshot is written and the store is checkpointed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    FeedConnector, FeedEvent, FeedHandle, MarketDataFeed, SessionFactory, SymbolSourceAcquirer,
};
use crate::application::services::backfill::{self, BackfillSettings, HistoryBackfillEngine};
use crate::application::services::fallback::{FallbackSettings, TodayFallbackCompleter};
use crate::application::services::fetcher::{FetchSettings, WindowFetcher};
use crate::application::services::ingest::LiveTickIngestor;
use crate::application::services::session_pool::{RestSessionPool, SessionPoolError};
use crate::application::services::state::{EngineCounters, EngineState, TickBufferConfig};
use crate::domain::{MarketClock, SymbolKey};
use crate::infrastructure::catalog::{CatalogError, SymbolCatalog};
use crate::infrastructure::metrics;
use crate::infrastructure::store::{SnapshotWriter, Store, StoreError};

/// File locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Snapshot JSON file.
    pub snapshot_path: PathBuf,
    /// Directory holding the symbol source files.
    pub symbol_dir: PathBuf,
    /// Parsed symbol cache file.
    pub symbol_cache_path: PathBuf,
}

/// Everything the orchestrator needs besides the adapters.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// File locations.
    pub paths: EnginePaths,
    /// Market clock.
    pub clock: MarketClock,
    /// Upper bound on REST sessions.
    pub max_sessions: usize,
    /// REST fetch limits.
    pub fetch: FetchSettings,
    /// Today's fallback worker.
    pub fallback: FallbackSettings,
    /// History backfill worker.
    pub backfill: BackfillSettings,
    /// Tick buffer thresholds.
    pub ticks: TickBufferConfig,
    /// Wait for the feed's first `Connected`.
    pub connect_timeout: Duration,
    /// Keys per subscribe call.
    pub subscribe_batch_size: usize,
    /// Pause between subscribe calls.
    pub subscribe_pause: Duration,
    /// Supervisory loop period.
    pub supervisor_interval: Duration,
    /// Minimum time between snapshot writes.
    pub snapshot_min_interval: Duration,
    /// Period of the aggregate counter log line.
    pub stats_log_interval: Duration,
    /// Wait for workers at shutdown.
    pub shutdown_timeout: Duration,
    /// Capacity of the feed event channel.
    pub event_buffer: usize,
}

/// Boundary adapters.
#[derive(Clone)]
pub struct Adapters {
    /// Symbol file downloader.
    pub acquirer: Arc<dyn SymbolSourceAcquirer>,
    /// REST login and session attachment.
    pub sessions: Arc<dyn SessionFactory>,
    /// Streaming feed.
    pub feed: Arc<dyn FeedConnector>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}

/// Fatal startup error.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The symbol universe could not be loaded.
    #[error("symbol catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// The store could not be opened or read.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Login failed or no session could be attached.
    #[error("REST sessions: {0}")]
    Sessions(#[from] SessionPoolError),

    /// The feed did not connect in time.
    #[error("feed did not connect within {0:?}")]
    FeedTimeout(Duration),

    /// The feed stopped before connecting.
    #[error("feed stopped before connecting")]
    FeedClosed,
}

/// A started engine.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    state: Arc<EngineState>,
    store: Arc<Store>,
    ingestor: LiveTickIngestor,
    snapshot: SnapshotWriter,
    feed: FeedHandle,
    workers: JoinSet<&'static str>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("trading_day", &self.state.trading_day())
            .field("symbols", &self.state.symbols().len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Run the startup sequence and spawn the workers.
    ///
    /// `cancel` stops everything; [`Orchestrator::run`] performs the
    /// shutdown flush once it fires.
    pub async fn start(
        settings: OrchestratorSettings,
        adapters: &Adapters,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let trading_day = settings.clock.trading_day(Utc::now());
        tracing::info!(%trading_day, "Starting first-close engine");

        let mut catalog = SymbolCatalog::new(
            settings.paths.symbol_dir.clone(),
            settings.paths.symbol_cache_path.clone(),
        );
        let load = catalog.load_or_acquire(adapters.acquirer.as_ref()).await?;
        let symbols = load.symbols;
        tracing::info!(symbols = symbols.len(), reparsed = load.reparsed, "Symbol catalog loaded");

        let store = Arc::new(Store::open(&settings.paths.db_path)?);
        let stored = store.load_records_for_day(trading_day)?;
        tracing::info!(records = stored.len(), "Loaded today's records");

        backfill::seed_states(&store, &symbols, trading_day, Utc::now())?;

        let state = Arc::new(EngineState::new(
            Arc::clone(&symbols),
            settings.clock.clone(),
            trading_day,
            stored,
            settings.ticks,
            Instant::now(),
        ));
        tracing::info!(pending = state.pending_count(), "Fallback pending set computed");
        metrics::set_fallback_pending(state.pending_count());

        let token = adapters
            .sessions
            .login()
            .await
            .map_err(SessionPoolError::Login)?;
        let pool = Arc::new(
            RestSessionPool::attach(
                adapters.sessions.as_ref(),
                &token,
                settings.max_sessions,
                settings.fetch.concurrency,
            )
            .await?,
        );

        let (event_tx, mut events) = mpsc::channel(settings.event_buffer.max(1));
        let feed_cancel = cancel.child_token();
        let feed = adapters.feed.start(&token, event_tx, feed_cancel.clone());
        if let Err(e) = wait_for_connected(&mut events, settings.connect_timeout).await {
            feed_cancel.cancel();
            return Err(e);
        }
        metrics::set_feed_connected(true);

        let keys: Vec<SymbolKey> = symbols.keys().cloned().collect();
        subscribe_all(
            feed.feed.as_ref(),
            &keys,
            settings.subscribe_batch_size,
            settings.subscribe_pause,
        )
        .await;

        let ingestor = LiveTickIngestor::new(Arc::clone(&state), Arc::clone(&store));
        let fetcher = WindowFetcher::new(pool, settings.fetch);
        let mut workers = JoinSet::new();

        let consumer = ingestor.clone();
        let consumer_cancel = cancel.child_token();
        workers.spawn(async move {
            consume_events(&consumer, &mut events, consumer_cancel).await;
            "tick consumer"
        });

        let fallback = TodayFallbackCompleter::new(
            Arc::clone(&state),
            Arc::clone(&store),
            fetcher.clone(),
            settings.fallback,
        );
        let fallback_cancel = cancel.child_token();
        workers.spawn(async move {
            fallback.run(fallback_cancel).await;
            "fallback completer"
        });

        let history = HistoryBackfillEngine::new(
            symbols,
            settings.clock.clone(),
            trading_day,
            Arc::clone(&store),
            fetcher,
            settings.backfill,
        );
        let backfill_cancel = cancel.child_token();
        workers.spawn(async move {
            history.run(backfill_cancel).await;
            "history backfill"
        });

        let snapshot = SnapshotWriter::new(
            settings.paths.snapshot_path.clone(),
            settings.snapshot_min_interval,
        );

        Ok(Self {
            settings,
            cancel,
            state,
            store,
            ingestor,
            snapshot,
            feed,
            workers,
        })
    }

    /// Shared engine state.
    #[must_use]
    pub const fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Supervise until cancelled, then shut down.
    pub async fn run(mut self) -> EngineCounters {
        let mut ticker = tokio::time::interval(self.settings.supervisor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.supervise(now).await;
                    if now.saturating_duration_since(last_stats) >= self.settings.stats_log_interval {
                        self.log_stats();
                        last_stats = now;
                    }
                }
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    match joined {
                        Ok(name) => tracing::info!(worker = name, "Worker finished"),
                        Err(e) => tracing::error!(error = %e, "Worker panicked"),
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One supervisory tick.
    async fn supervise(&mut self, now: Instant) {
        self.ingestor.flush_due(now).await;

        if let Err(e) = self.state.persist_dirty_blocking(&self.store).await {
            tracing::error!(error = %e, "Failed to persist today's records");
        }

        if self.snapshot.is_due(now)
            && let Some(snapshot) = self.state.take_snapshot(Utc::now())
        {
            metrics::set_complete_symbols(snapshot.complete);
            if let Err(e) = self.snapshot.write(&snapshot, now) {
                tracing::error!(error = %e, path = %self.snapshot.path().display(), "Snapshot write failed");
                self.state.mark_snapshot_dirty();
            }
        }

        metrics::set_fallback_pending(self.state.pending_count());
    }

    fn log_stats(&self) {
        let counters = self.state.counters();
        let backfill_pending = self.store.count_pending_backfill().unwrap_or_default();
        tracing::info!(
            ticks_received = counters.ticks_received,
            ticks_flushed = counters.ticks_flushed,
            ticks_dropped = counters.ticks_dropped,
            tick_fills = counters.tick_fills,
            fallback_fills = counters.fallback_fills,
            fallback_done = counters.fallback_done,
            fallback_gave_up = counters.fallback_gave_up,
            fallback_pending = self.state.pending_count(),
            backfill_pending,
            buffered_ticks = self.state.buffered_ticks(),
            snapshots = self.snapshot.writes(),
            "Engine stats"
        );
    }

    async fn shutdown(mut self) -> EngineCounters {
        tracing::info!("Shutting down first-close engine");
        self.cancel.cancel();

        let workers = &mut self.workers;
        let feed_task = &mut self.feed.task;
        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(name) => tracing::debug!(worker = name, "Worker stopped"),
                    Err(e) => tracing::error!(error = %e, "Worker panicked"),
                }
            }
            if let Err(e) = feed_task.await {
                tracing::error!(error = %e, "Feed task panicked");
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                timeout = ?self.settings.shutdown_timeout,
                "Workers did not stop in time, aborting"
            );
            self.workers.abort_all();
            self.feed.task.abort();
        }
        metrics::set_feed_connected(false);

        let flushed = self.ingestor.flush_all(Instant::now()).await;
        let persisted = self.state.persist_dirty_blocking(&self.store).await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to persist today's records at shutdown");
            0
        });

        let snapshot = self.state.snapshot(Utc::now());
        metrics::set_complete_symbols(snapshot.complete);
        if let Err(e) = self.snapshot.write(&snapshot, Instant::now()) {
            tracing::error!(error = %e, "Final snapshot write failed");
        }

        if let Err(e) = self.store.checkpoint() {
            tracing::warn!(error = %e, "WAL checkpoint failed");
        }

        let counters = self.state.counters();
        tracing::info!(
            flushed,
            persisted,
            complete = snapshot.complete,
            total = snapshot.total,
            ticks_received = counters.ticks_received,
            "First-close engine stopped"
        );
        counters
    }
}

/// Wait for the feed's first `Connected`, ignoring anything else.
async fn wait_for_connected(
    events: &mut mpsc::Receiver<FeedEvent>,
    timeout: Duration,
) -> Result<(), StartupError> {
    let connected = async {
        while let Some(event) = events.recv().await {
            match event {
                FeedEvent::Connected => return Ok(()),
                FeedEvent::Reconnecting { attempt } => {
                    tracing::info!(attempt, "Feed reconnecting before first connect");
                }
                FeedEvent::Error(message) => tracing::warn!(%message, "Feed error while connecting"),
                FeedEvent::Disconnected | FeedEvent::Tick(_) => {}
            }
        }
        Err(StartupError::FeedClosed)
    };
    tokio::time::timeout(timeout, connected)
        .await
        .unwrap_or(Err(StartupError::FeedTimeout(timeout)))?;
    tracing::info!("Feed connected");
    Ok(())
}

/// Subscribe `keys` in batches with a pause in between.
///
/// Failures are logged; the feed keeps every requested key and resubscribes
/// it after the next reconnect.
async fn subscribe_all(
    feed: &dyn MarketDataFeed,
    keys: &[SymbolKey],
    batch_size: usize,
    pause: Duration,
) -> usize {
    let mut batches = 0;
    for (i, batch) in keys.chunks(batch_size.max(1)).enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        if let Err(e) = feed.subscribe(batch).await {
            tracing::warn!(error = %e, keys = batch.len(), "Subscribe batch failed");
        }
        batches += 1;
    }
    metrics::set_feed_subscriptions(keys.len());
    tracing::info!(keys = keys.len(), batches, "Feed subscriptions sent");
    batches
}

/// Apply feed events until cancelled or the feed goes away.
async fn consume_events(
    ingestor: &LiveTickIngestor,
    events: &mut mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(FeedEvent::Tick(tick)) => {
                ingestor.on_tick(&tick, Utc::now(), Instant::now()).await;
            }
            Some(FeedEvent::Connected) => {
                tracing::info!("Feed reconnected");
                metrics::set_feed_connected(true);
            }
            Some(FeedEvent::Disconnected) => {
                tracing::warn!("Feed disconnected");
                metrics::set_feed_connected(false);
            }
            Some(FeedEvent::Reconnecting { attempt }) => {
                tracing::info!(attempt, "Feed reconnecting");
                metrics::record_feed_reconnect();
            }
            Some(FeedEvent::Error(message)) => tracing::warn!(%message, "Feed error"),
            None => {
                tracing::error!("Feed event channel closed, continuing without live ticks");
                metrics::set_feed_connected(false);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::FeedError;

    #[derive(Default)]
    struct RecordingFeed {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl MarketDataFeed for RecordingFeed {
        async fn subscribe(&self, keys: &[SymbolKey]) -> Result<(), FeedError> {
            self.batches.lock().push(keys.len());
            Err(FeedError::NotConnected)
        }
    }

    fn keys(n: usize) -> Vec<SymbolKey> {
        (0..n).map(|i| SymbolKey::new("NSE", &i.to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_in_batches_despite_failures() {
        let feed = RecordingFeed::default();
        let started = tokio::time::Instant::now();
        let batches = subscribe_all(&feed, &keys(5), 2, Duration::from_millis(100)).await;
        assert_eq!(batches, 3);
        assert_eq!(*feed.batches.lock(), vec![2, 2, 1]);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_wait_skips_other_events() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(FeedEvent::Reconnecting { attempt: 1 }).await.unwrap();
        tx.send(FeedEvent::Connected).await.unwrap();
        wait_for_connected(&mut rx, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_wait_times_out() {
        let (_tx, mut rx) = mpsc::channel::<FeedEvent>(8);
        let err = wait_for_connected(&mut rx, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StartupError::FeedTimeout(_)));
    }

    #[tokio::test]
    async fn connect_wait_fails_when_feed_stops() {
        let (tx, mut rx) = mpsc::channel::<FeedEvent>(8);
        drop(tx);
        let err = wait_for_connected(&mut rx, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StartupError::FeedClosed));
    }
}
