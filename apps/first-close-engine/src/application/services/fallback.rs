//! Today Fallback Completer
//!
//! Completes today's records that ticks did not fully cover by fetching the
//! opening window over REST. Per symbol:
//!
//! ```text
//! PENDING ──fetch complete──────────────► DONE     (fetch_done = true)
//!    │  └──partial / empty / failed──► PENDING     (retries + 1)
//!    └────retries == max_retries──────► GAVE_UP   (fetch_done = false)
//! ```
//!
//! A fetched close only fills a slot that is still empty; ticks always win.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::services::fetcher::{WindowFetcher, WindowRequest, WindowResult};
use crate::application::services::state::EngineState;
use crate::domain::{Slot, SymbolKey};
use crate::infrastructure::metrics::{self, FallbackOutcome, FillSource};
use crate::infrastructure::store::Store;

/// Fallback worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSettings {
    /// Pause between cycles.
    pub interval: Duration,
    /// Symbols dispatched per cycle.
    pub batch_size: usize,
    /// Wait after the market open before a symbol is due.
    pub grace: Duration,
    /// Attempts before giving up on a symbol for the day.
    pub max_retries: u32,
    /// Persist dirty records after this many processed results.
    pub flush_every: usize,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 200,
            grace: Duration::from_secs(20 * 60),
            max_retries: 3,
            flush_every: 50,
        }
    }
}

/// Counts of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackCycle {
    /// Symbols fetched.
    pub dispatched: usize,
    /// Symbols that reached DONE.
    pub completed: usize,
    /// Symbols left PENDING for another attempt.
    pub retried: usize,
    /// Symbols that reached GAVE_UP.
    pub gave_up: usize,
    /// Results for symbols no longer pending.
    pub discarded: usize,
}

/// REST completion of today's records.
#[derive(Debug, Clone)]
pub struct TodayFallbackCompleter {
    state: Arc<EngineState>,
    store: Arc<Store>,
    fetcher: WindowFetcher,
    settings: FallbackSettings,
}

impl TodayFallbackCompleter {
    /// Create a completer.
    #[must_use]
    pub const fn new(
        state: Arc<EngineState>,
        store: Arc<Store>,
        fetcher: WindowFetcher,
        settings: FallbackSettings,
    ) -> Self {
        Self {
            state,
            store,
            fetcher,
            settings,
        }
    }

    /// Run cycles until nothing is pending or `cancel` fires.
    ///
    /// Cancellation is observed between cycles only.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(pending = self.state.pending_count(), "Fallback completer started");
        loop {
            if self.state.pending_count() == 0 {
                tracing::info!("No symbols pending, fallback completer finished");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let cycle = self.run_cycle(Utc::now()).await;
            if cycle.dispatched > 0 {
                tracing::info!(
                    dispatched = cycle.dispatched,
                    completed = cycle.completed,
                    retried = cycle.retried,
                    gave_up = cycle.gave_up,
                    discarded = cycle.discarded,
                    pending = self.state.pending_count(),
                    "Fallback cycle finished"
                );
            }
            metrics::set_fallback_pending(self.state.pending_count());

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        tracing::info!("Fallback completer stopped");
    }

    /// Due pending symbols in key order, at most one batch.
    #[must_use]
    pub fn due_requests(&self, now: DateTime<Utc>) -> Vec<WindowRequest> {
        let clock = self.state.clock();
        let day = self.state.trading_day();
        let inner = self.state.lock();
        inner
            .pending
            .iter()
            .filter_map(|key| self.state.symbol(key))
            .filter(|symbol| {
                clock.fallback_deadline(&symbol.exchange, day, self.settings.grace) <= now
            })
            .take(self.settings.batch_size)
            .map(|symbol| WindowRequest {
                symbol: symbol.clone(),
                day,
                open: clock.open_time(&symbol.exchange),
            })
            .collect()
    }

    /// Fetch one batch of due symbols and apply the results.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> FallbackCycle {
        let requests = self.due_requests(now);
        let mut cycle = FallbackCycle {
            dispatched: requests.len(),
            ..FallbackCycle::default()
        };
        if requests.is_empty() {
            return cycle;
        }

        let mut processed = 0_usize;
        let mut writes = Vec::new();
        self.fetcher
            .fetch_each(requests, |request, result| {
                self.apply(&request.symbol.key(), result, now, &mut cycle);
                processed += 1;
                if processed % self.settings.flush_every.max(1) == 0 {
                    let state = Arc::clone(&self.state);
                    let store = Arc::clone(&self.store);
                    writes.push(tokio::task::spawn_blocking(move || state.persist_dirty(&store)));
                }
            })
            .await;
        for write in writes {
            match write.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Failed to persist today's records"),
                Err(e) => tracing::error!(error = %e, "Record persist task failed"),
            }
        }
        self.persist().await;
        cycle
    }

    fn apply(
        &self,
        key: &SymbolKey,
        result: WindowResult,
        now: DateTime<Utc>,
        cycle: &mut FallbackCycle,
    ) {
        let day = self.state.trading_day();
        let mut inner = self.state.lock();
        if !inner.pending.contains(key) {
            cycle.discarded += 1;
            return;
        }

        let record = inner.record_mut(key, day, now);
        let fetched = result.as_ref().ok();
        let filled = fetched.map_or(0, |closes| {
            Slot::ALL
                .into_iter()
                .filter(|&slot| {
                    closes.get(slot).is_some_and(|price| {
                        let changed = record.fill_slot(slot, price, now);
                        if changed {
                            metrics::record_slot_fill(slot, FillSource::Rest);
                        }
                        changed
                    })
                })
                .count()
        });
        let complete = record.closes.is_complete();
        if complete {
            record.fetch_done = true;
        }

        if filled > 0 {
            inner.dirty.insert(key.clone());
            inner.snapshot_dirty = true;
            inner.counters.fallback_fills += filled as u64;
        }

        if complete {
            inner.complete(key);
            inner.counters.fallback_done += 1;
            cycle.completed += 1;
            metrics::record_fallback_outcome(FallbackOutcome::Done);
            return;
        }

        let retries = {
            let entry = inner.retries.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if retries >= self.settings.max_retries {
            if let Some(record) = inner.records.get_mut(key) {
                record.fetch_done = false;
                record.updated_at = now;
            }
            inner.pending.remove(key);
            inner.retries.remove(key);
            inner.gave_up.insert(key.clone());
            inner.dirty.insert(key.clone());
            inner.snapshot_dirty = true;
            inner.counters.fallback_gave_up += 1;
            cycle.gave_up += 1;
            metrics::record_fallback_outcome(FallbackOutcome::GaveUp);
            tracing::warn!(symbol = %key, retries, "Giving up on today's first closes");
        } else {
            cycle.retried += 1;
            metrics::record_fallback_outcome(FallbackOutcome::Retry);
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.state.persist_dirty_blocking(&self.store).await {
            tracing::error!(error = %e, "Failed to persist today's records");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::TimeZone;

    use super::*;
    use crate::application::ports::FetchError;
    use crate::application::services::state::TickBufferConfig;
    use crate::application::services::test_support::{
        ScriptedSource, bars, day, fetcher, full_bars, ist_clock, symbols,
    };
    use crate::domain::{FirstCloseRecord, FirstCloses};

    fn after_deadline() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 6, 0, 0).unwrap()
    }

    fn setup(
        tokens: &[&str],
        stored: Vec<FirstCloseRecord>,
        source: &Arc<ScriptedSource>,
    ) -> (TodayFallbackCompleter, Arc<EngineState>, Arc<Store>) {
        let state = Arc::new(EngineState::new(
            symbols(tokens),
            ist_clock(),
            day(2024, 3, 5),
            stored,
            TickBufferConfig::default(),
            Instant::now(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let completer = TodayFallbackCompleter::new(
            Arc::clone(&state),
            Arc::clone(&store),
            fetcher(Arc::clone(source)),
            FallbackSettings {
                interval: Duration::from_millis(10),
                batch_size: 2,
                flush_every: 1,
                ..FallbackSettings::default()
            },
        );
        (completer, state, store)
    }

    #[tokio::test]
    async fn nothing_is_due_before_the_grace_period() {
        let source = Arc::new(ScriptedSource::default());
        let (completer, _, _) = setup(&["22"], Vec::new(), &source);
        // 09:30 IST, before the 09:35 deadline.
        let early = Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap();
        assert!(completer.due_requests(early).is_empty());
        assert_eq!(completer.due_requests(after_deadline()).len(), 1);
    }

    #[tokio::test]
    async fn due_requests_respect_batch_size_and_key_order() {
        let source = Arc::new(ScriptedSource::default());
        let (completer, _, _) = setup(&["24", "22", "23"], Vec::new(), &source);
        let tokens: Vec<String> = completer
            .due_requests(after_deadline())
            .into_iter()
            .map(|request| request.symbol.token)
            .collect();
        assert_eq!(tokens, ["22", "23"]);
    }

    #[tokio::test]
    async fn complete_fetch_marks_symbol_done() {
        let source = Arc::new(ScriptedSource::default());
        source.push("22", day(2024, 3, 5), Ok(full_bars(day(2024, 3, 5))));
        let (completer, state, store) = setup(&["22"], Vec::new(), &source);
        let key = SymbolKey::new("NSE", "22");

        let cycle = completer.run_cycle(after_deadline()).await;
        assert_eq!(cycle.completed, 1);
        assert!(!state.is_pending(&key));

        let stored = store.load_record(&key, day(2024, 3, 5)).unwrap().unwrap();
        assert!(stored.fetch_done);
        assert_eq!(stored.closes.close_5m, Some(5.0));
    }

    #[tokio::test]
    async fn fetched_closes_never_replace_tick_closes() {
        let source = Arc::new(ScriptedSource::default());
        source.push("22", day(2024, 3, 5), Ok(full_bars(day(2024, 3, 5))));
        let key = SymbolKey::new("NSE", "22");
        let mut from_ticks = FirstCloseRecord::new(key.clone(), day(2024, 3, 5), after_deadline());
        from_ticks.fill_slot(Slot::OneMinute, 100.0, after_deadline());
        let (completer, state, _) = setup(&["22"], vec![from_ticks], &source);

        completer.run_cycle(after_deadline()).await;
        let record = state.record(&key).unwrap();
        assert_eq!(record.closes.close_1m, Some(100.0));
        assert_eq!(record.closes.close_15m, Some(15.0));
        assert!(record.fetch_done);
    }

    #[tokio::test]
    async fn partial_results_retry_then_give_up() {
        let source = Arc::new(ScriptedSource::default());
        source.push(
            "22",
            day(2024, 3, 5),
            Ok(bars(day(2024, 3, 5), &[(Slot::OneMinute, 1.0)])),
        );
        source.push("22", day(2024, 3, 5), Err(FetchError::Timeout));
        let (completer, state, store) = setup(&["22"], Vec::new(), &source);
        let key = SymbolKey::new("NSE", "22");

        assert_eq!(completer.run_cycle(after_deadline()).await.retried, 1);
        assert_eq!(completer.run_cycle(after_deadline()).await.retried, 1);
        assert!(state.is_pending(&key));

        let cycle = completer.run_cycle(after_deadline()).await;
        assert_eq!(cycle.gave_up, 1);
        assert!(!state.is_pending(&key));
        assert!(state.gave_up(&key));

        let stored = store.load_record(&key, day(2024, 3, 5)).unwrap().unwrap();
        assert_eq!(stored.closes.close_1m, Some(1.0));
        assert!(!stored.fetch_done);

        // Given up symbols are not fetched again.
        assert!(completer.due_requests(after_deadline()).is_empty());
    }

    #[tokio::test]
    async fn results_for_completed_symbols_are_discarded() {
        let source = Arc::new(ScriptedSource::default());
        let (completer, state, _) = setup(&["22"], Vec::new(), &source);
        let key = SymbolKey::new("NSE", "22");
        state.lock().complete(&key);

        let mut cycle = FallbackCycle::default();
        completer.apply(&key, Ok(FirstCloses::default()), after_deadline(), &mut cycle);
        assert_eq!(cycle.discarded, 1);
        assert!(state.record(&key).is_none());
    }

    #[tokio::test]
    async fn run_exits_when_nothing_is_pending() {
        let source = Arc::new(ScriptedSource::default());
        let (completer, _, _) = setup(&[], Vec::new(), &source);
        tokio::time::timeout(Duration::from_secs(1), completer.run(CancellationToken::new()))
            .await
            .unwrap();
    }
}
