//! History Backfill Engine
//!
//! Walks every symbol backwards one day at a time, starting the day before
//! the current trading day. Progress lives entirely in `history_state`, so a
//! restart resumes where the previous run stopped.
//!
//! # Cycle
//!
//! 1. Load up to `batch_size` unfinished cursors, least recently updated first.
//! 2. Retire cursors of symbols that left the catalog; pull cursors that
//!    reached the trading day back before it.
//! 3. Fetch `(symbol, next_day)` for the rest, concurrently.
//! 4. Apply each result to its cursor and commit the found closes together
//!    with the cursors in one transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::services::fetcher::{WindowFetcher, WindowRequest};
use crate::domain::{
    BackfillLimits, BackfillState, FirstCloseRecord, MarketClock, SymbolKey, SymbolMap,
};
use crate::infrastructure::metrics::{self, BackfillOutcome};
use crate::infrastructure::store::{Store, StoreError};

/// Backfill worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSettings {
    /// Pause between cycles.
    pub interval: Duration,
    /// Cursors processed per cycle.
    pub batch_size: usize,
    /// Stop thresholds.
    pub limits: BackfillLimits,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            limits: BackfillLimits {
                max_retries: 3,
                max_lookback_days: 365,
                stop_empty_streak: 10,
            },
        }
    }
}

/// Counts of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillCycle {
    /// Cursors fetched.
    pub dispatched: usize,
    /// Days with at least one close.
    pub found: usize,
    /// Days without any close.
    pub empty: usize,
    /// Failed fetches.
    pub failed: usize,
    /// Cursors that finished this cycle.
    pub finished: usize,
    /// Unfinished cursors left after the cycle.
    pub remaining: usize,
}

/// Create a cursor for every symbol of `symbols` that has none.
///
/// New cursors start the day before `trading_day`; existing ones are kept.
pub fn seed_states(
    store: &Store,
    symbols: &SymbolMap,
    trading_day: NaiveDate,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let states: Vec<BackfillState> = symbols
        .keys()
        .map(|key| BackfillState::seed(key.clone(), trading_day, now))
        .collect();
    let inserted = store.seed_backfill_states(&states)?;
    tracing::info!(inserted, symbols = states.len(), "Backfill state seeded");
    Ok(inserted)
}

/// Resumable backward walk over past trading days.
#[derive(Debug, Clone)]
pub struct HistoryBackfillEngine {
    symbols: Arc<SymbolMap>,
    clock: MarketClock,
    trading_day: NaiveDate,
    store: Arc<Store>,
    fetcher: WindowFetcher,
    settings: BackfillSettings,
}

impl HistoryBackfillEngine {
    /// Create an engine for the run anchored at `trading_day`.
    #[must_use]
    pub const fn new(
        symbols: Arc<SymbolMap>,
        clock: MarketClock,
        trading_day: NaiveDate,
        store: Arc<Store>,
        fetcher: WindowFetcher,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            symbols,
            clock,
            trading_day,
            store,
            fetcher,
            settings,
        }
    }

    /// Create a cursor for every catalog symbol that has none.
    pub fn seed(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        seed_states(&self.store, &self.symbols, self.trading_day, now)
    }

    /// Run cycles until every cursor is finished or `cancel` fires.
    ///
    /// Cancellation is observed between cycles only.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("History backfill started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.run_cycle(Utc::now()).await {
                Ok(cycle) => {
                    metrics::set_backfill_pending(cycle.remaining);
                    if cycle.dispatched > 0 || cycle.finished > 0 {
                        tracing::info!(
                            dispatched = cycle.dispatched,
                            found = cycle.found,
                            empty = cycle.empty,
                            failed = cycle.failed,
                            finished = cycle.finished,
                            remaining = cycle.remaining,
                            "Backfill cycle finished"
                        );
                    }
                    if cycle.remaining == 0 {
                        tracing::info!("History backfill complete");
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Backfill cycle failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        tracing::info!("History backfill stopped");
    }

    /// Process one batch of cursors.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<BackfillCycle, StoreError> {
        let batch = self.store.load_backfill_batch(self.settings.batch_size)?;
        let mut cycle = BackfillCycle::default();
        if batch.is_empty() {
            cycle.remaining = self.store.count_pending_backfill()?;
            return Ok(cycle);
        }

        let mut settled = Vec::new();
        let mut in_flight: HashMap<SymbolKey, BackfillState> = HashMap::new();
        let mut requests = Vec::with_capacity(batch.len());

        for mut state in batch {
            let Some(symbol) = self.symbols.get(&state.symbol) else {
                tracing::debug!(symbol = %state.symbol, "Symbol left the catalog, retiring cursor");
                state.retire(now);
                cycle.finished += 1;
                settled.push(state);
                continue;
            };
            state.clamp_before(self.trading_day, now);
            requests.push(WindowRequest {
                symbol: symbol.clone(),
                day: state.next_day,
                open: self.clock.open_time(&symbol.exchange),
            });
            in_flight.insert(state.symbol.clone(), state);
        }
        cycle.dispatched = requests.len();

        let limits = self.settings.limits;
        let mut records = Vec::new();
        self.fetcher
            .fetch_each(requests, |request, result| {
                let key = request.symbol.key();
                let Some(mut state) = in_flight.remove(&key) else {
                    return;
                };
                match result {
                    Ok(closes) => {
                        if closes.is_empty() {
                            cycle.empty += 1;
                            metrics::record_backfill_outcome(BackfillOutcome::Empty);
                        } else {
                            cycle.found += 1;
                            metrics::record_backfill_outcome(BackfillOutcome::Found);
                            records.push(FirstCloseRecord {
                                symbol: key,
                                day: request.day,
                                closes,
                                fetch_done: closes.is_complete(),
                                updated_at: now,
                            });
                        }
                        state.apply_success(&closes, limits, now);
                    }
                    Err(_) => {
                        cycle.failed += 1;
                        metrics::record_backfill_outcome(BackfillOutcome::Failed);
                        state.apply_failure(limits, now);
                    }
                }
                if state.done {
                    cycle.finished += 1;
                }
                settled.push(state);
            })
            .await;

        // Cursors whose fetch task never reported back keep their position.
        settled.extend(in_flight.into_values());

        self.store
            .write_backfill_cycle(&records, &self.symbols, &settled)?;
        cycle.remaining = self.store.count_pending_backfill()?;
        Ok(cycle)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::application::ports::FetchError;
    use crate::application::services::test_support::{
        ScriptedSource, bars, day, fetcher, full_bars, ist_clock, symbols,
    };
    use crate::domain::Slot;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 6, 0, 0).unwrap()
    }

    fn engine(
        tokens: &[&str],
        source: &Arc<ScriptedSource>,
        limits: BackfillLimits,
    ) -> (HistoryBackfillEngine, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = HistoryBackfillEngine::new(
            symbols(tokens),
            ist_clock(),
            day(2024, 3, 5),
            Arc::clone(&store),
            fetcher(Arc::clone(source)),
            BackfillSettings {
                interval: Duration::from_millis(10),
                batch_size: 10,
                limits,
            },
        );
        (engine, store)
    }

    const LIMITS: BackfillLimits = BackfillLimits {
        max_retries: 3,
        max_lookback_days: 365,
        stop_empty_streak: 10,
    };

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let source = Arc::new(ScriptedSource::default());
        let (engine, store) = engine(&["22", "23"], &source, LIMITS);
        assert_eq!(engine.seed(now()).unwrap(), 2);
        assert_eq!(engine.seed(now()).unwrap(), 0);

        let state = store
            .load_backfill_state(&SymbolKey::new("NSE", "22"))
            .unwrap()
            .unwrap();
        assert_eq!(state.next_day, day(2024, 3, 4));
    }

    #[tokio::test]
    async fn found_day_is_stored_and_cursor_moves_back() {
        let source = Arc::new(ScriptedSource::default());
        source.push("22", day(2024, 3, 4), Ok(full_bars(day(2024, 3, 4))));
        let (engine, store) = engine(&["22"], &source, LIMITS);
        engine.seed(now()).unwrap();

        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.dispatched, 1);
        assert_eq!(cycle.found, 1);

        let key = SymbolKey::new("NSE", "22");
        let record = store.load_record(&key, day(2024, 3, 4)).unwrap().unwrap();
        assert_eq!(record.closes.close_15m, Some(15.0));
        assert!(record.fetch_done);

        let state = store.load_backfill_state(&key).unwrap().unwrap();
        assert_eq!(state.next_day, day(2024, 3, 3));
        assert_eq!(state.lookback_days, 1);
        assert_eq!(state.empty_streak, 0);
    }

    #[tokio::test]
    async fn partial_day_is_stored_without_fetch_done() {
        let source = Arc::new(ScriptedSource::default());
        source.push(
            "22",
            day(2024, 3, 4),
            Ok(bars(day(2024, 3, 4), &[(Slot::OneMinute, 7.0)])),
        );
        let (engine, store) = engine(&["22"], &source, LIMITS);
        engine.seed(now()).unwrap();
        engine.run_cycle(now()).await.unwrap();

        let record = store
            .load_record(&SymbolKey::new("NSE", "22"), day(2024, 3, 4))
            .unwrap()
            .unwrap();
        assert_eq!(record.closes.close_1m, Some(7.0));
        assert_eq!(record.closes.close_5m, None);
        assert!(!record.fetch_done);
    }

    #[tokio::test]
    async fn empty_day_writes_no_record() {
        let source = Arc::new(ScriptedSource::default());
        let (engine, store) = engine(&["22"], &source, LIMITS);
        engine.seed(now()).unwrap();

        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.empty, 1);
        let key = SymbolKey::new("NSE", "22");
        assert!(store.load_record(&key, day(2024, 3, 4)).unwrap().is_none());
        assert_eq!(store.load_backfill_state(&key).unwrap().unwrap().empty_streak, 1);
    }

    #[tokio::test]
    async fn failures_retry_the_same_day_then_skip_it() {
        let source = Arc::new(ScriptedSource::default());
        for _ in 0..3 {
            source.push("22", day(2024, 3, 4), Err(FetchError::Status(500)));
        }
        let (engine, store) = engine(&["22"], &source, LIMITS);
        engine.seed(now()).unwrap();
        let key = SymbolKey::new("NSE", "22");

        for expected_retries in 1..=2 {
            let cycle = engine.run_cycle(now()).await.unwrap();
            assert_eq!(cycle.failed, 1);
            let state = store.load_backfill_state(&key).unwrap().unwrap();
            assert_eq!(state.next_day, day(2024, 3, 4));
            assert_eq!(state.retries, expected_retries);
        }

        engine.run_cycle(now()).await.unwrap();
        let state = store.load_backfill_state(&key).unwrap().unwrap();
        assert_eq!(state.next_day, day(2024, 3, 3));
        assert_eq!(state.retries, 0);
        assert_eq!(state.empty_streak, 1);
        assert_eq!(state.lookback_days, 1);
    }

    #[tokio::test]
    async fn empty_streak_finishes_the_walk() {
        let source = Arc::new(ScriptedSource::default());
        let limits = BackfillLimits {
            stop_empty_streak: 2,
            ..LIMITS
        };
        let (engine, store) = engine(&["22"], &source, limits);
        engine.seed(now()).unwrap();

        engine.run_cycle(now()).await.unwrap();
        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.finished, 1);
        assert_eq!(cycle.remaining, 0);

        // A finished cursor is never loaded again.
        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.dispatched, 0);
        assert_eq!(source.calls().len(), 2);
        assert!(store.load_backfill_state(&SymbolKey::new("NSE", "22")).unwrap().unwrap().done);
    }

    #[tokio::test]
    async fn empty_batch_still_reports_pending_cursors() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = HistoryBackfillEngine::new(
            symbols(&["22"]),
            ist_clock(),
            day(2024, 3, 5),
            Arc::clone(&store),
            fetcher(Arc::clone(&source)),
            BackfillSettings {
                interval: Duration::from_millis(10),
                batch_size: 0,
                limits: LIMITS,
            },
        );
        engine.seed(now()).unwrap();

        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.dispatched, 0);
        assert_eq!(cycle.remaining, 1);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn symbols_missing_from_catalog_are_retired() {
        let source = Arc::new(ScriptedSource::default());
        let (engine, store) = engine(&["22"], &source, LIMITS);
        let stale = BackfillState::seed(SymbolKey::new("NSE", "99"), day(2024, 3, 5), now());
        store.seed_backfill_states(&[stale]).unwrap();
        engine.seed(now()).unwrap();

        let cycle = engine.run_cycle(now()).await.unwrap();
        assert_eq!(cycle.dispatched, 1);
        assert!(
            store
                .load_backfill_state(&SymbolKey::new("NSE", "99"))
                .unwrap()
                .unwrap()
                .done
        );
        assert!(source.calls().iter().all(|(token, _)| token == "22"));
    }

    #[tokio::test]
    async fn cursor_at_or_after_trading_day_is_clamped() {
        let source = Arc::new(ScriptedSource::default());
        let (engine, store) = engine(&["22"], &source, LIMITS);
        // Seeded by an earlier run whose clock was ahead.
        let ahead = BackfillState::seed(SymbolKey::new("NSE", "22"), day(2024, 3, 9), now());
        store.seed_backfill_states(&[ahead]).unwrap();

        engine.run_cycle(now()).await.unwrap();
        assert_eq!(source.calls(), vec![("22".to_string(), day(2024, 3, 4))]);
    }

    #[tokio::test]
    async fn run_stops_once_every_cursor_is_done() {
        let source = Arc::new(ScriptedSource::default());
        let limits = BackfillLimits {
            max_lookback_days: 3,
            ..LIMITS
        };
        let (engine, store) = engine(&["22", "23"], &source, limits);
        engine.seed(now()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), engine.run(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(store.count_pending_backfill().unwrap(), 0);
        assert_eq!(source.calls().len(), 6);
    }
}
