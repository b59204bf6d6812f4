//! Engine State
//!
//! The one context object shared by the tick consumer, the two REST workers
//! and the supervisory loop. All mutable state for the current trading day
//! lives behind a single mutex; no caller holds it across an await.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::domain::{
    FirstCloseRecord, MarketClock, Snapshot, SnapshotRow, Symbol, SymbolKey, SymbolMap, TickRecord,
};
use crate::infrastructure::store::{Store, StoreError};

/// Size and age thresholds of the tick buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBufferConfig {
    /// Flush once this many ticks are buffered.
    pub flush_size: usize,
    /// Flush once this long has passed since the previous flush.
    pub flush_interval: Duration,
}

impl Default for TickBufferConfig {
    fn default() -> Self {
        Self {
            flush_size: 500,
            flush_interval: Duration::from_secs(2),
        }
    }
}

/// In-memory buffer in front of the tick log.
#[derive(Debug)]
pub struct TickBuffer {
    config: TickBufferConfig,
    ticks: Vec<TickRecord>,
    last_flush: Instant,
}

impl TickBuffer {
    /// Empty buffer whose age is measured from `now`.
    #[must_use]
    pub fn new(config: TickBufferConfig, now: Instant) -> Self {
        Self {
            config,
            ticks: Vec::with_capacity(config.flush_size),
            last_flush: now,
        }
    }

    /// Buffer one tick.
    pub fn push(&mut self, tick: TickRecord) {
        self.ticks.push(tick);
    }

    /// Buffered ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Either threshold has been reached.
    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        !self.ticks.is_empty()
            && (self.ticks.len() >= self.config.flush_size
                || now.saturating_duration_since(self.last_flush) >= self.config.flush_interval)
    }

    /// Drain the buffer and restart the age clock.
    pub fn take(&mut self, now: Instant) -> Vec<TickRecord> {
        self.last_flush = now;
        std::mem::take(&mut self.ticks)
    }
}

/// Aggregate counters, logged periodically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Ticks received from the feed.
    pub ticks_received: u64,
    /// Ticks written to the tick log.
    pub ticks_flushed: u64,
    /// Ticks whose flush failed.
    pub ticks_dropped: u64,
    /// Slots filled from ticks.
    pub tick_fills: u64,
    /// Slots filled from REST.
    pub fallback_fills: u64,
    /// Symbols completed by REST.
    pub fallback_done: u64,
    /// Symbols given up for the day.
    pub fallback_gave_up: u64,
}

/// Mutable part of the engine state.
#[derive(Debug)]
pub struct StateInner {
    /// Today's records by symbol.
    pub records: BTreeMap<SymbolKey, FirstCloseRecord>,
    /// Symbols still waiting for the REST fallback.
    pub pending: BTreeSet<SymbolKey>,
    /// Fallback attempts per pending symbol.
    pub retries: HashMap<SymbolKey, u32>,
    /// Symbols given up for today.
    pub gave_up: BTreeSet<SymbolKey>,
    /// Records changed since the last persist.
    pub dirty: BTreeSet<SymbolKey>,
    /// Last traded price per symbol, arrival order.
    pub last_price: HashMap<SymbolKey, f64>,
    /// Last cumulative volume per symbol, arrival order.
    pub last_volume: HashMap<SymbolKey, u64>,
    /// Ticks waiting for the tick log.
    pub ticks: TickBuffer,
    /// Something visible in the snapshot changed.
    pub snapshot_dirty: bool,
    /// Aggregate counters.
    pub counters: EngineCounters,
}

impl StateInner {
    /// Today's record for `key`, created on first use.
    pub fn record_mut(
        &mut self,
        key: &SymbolKey,
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> &mut FirstCloseRecord {
        if !self.records.contains_key(key) {
            self.dirty.insert(key.clone());
        }
        self.records
            .entry(key.clone())
            .or_insert_with(|| FirstCloseRecord::new(key.clone(), day, now))
    }

    /// Mark `key` complete: it leaves the fallback queue.
    pub fn complete(&mut self, key: &SymbolKey) {
        self.pending.remove(key);
        self.retries.remove(key);
    }
}

/// Shared engine context for one trading day.
#[derive(Debug)]
pub struct EngineState {
    symbols: Arc<SymbolMap>,
    clock: MarketClock,
    trading_day: NaiveDate,
    inner: Mutex<StateInner>,
}

impl EngineState {
    /// Build the state from the catalog and today's stored records.
    ///
    /// Every symbol without a complete record starts out pending.
    #[must_use]
    pub fn new(
        symbols: Arc<SymbolMap>,
        clock: MarketClock,
        trading_day: NaiveDate,
        stored: Vec<FirstCloseRecord>,
        ticks: TickBufferConfig,
        now: Instant,
    ) -> Self {
        let records: BTreeMap<SymbolKey, FirstCloseRecord> = stored
            .into_iter()
            .filter(|record| record.day == trading_day)
            .map(|record| (record.symbol.clone(), record))
            .collect();

        let pending = symbols
            .keys()
            .filter(|key| {
                records
                    .get(*key)
                    .is_none_or(|record| !record.closes.is_complete())
            })
            .cloned()
            .collect();

        Self {
            symbols,
            clock,
            trading_day,
            inner: Mutex::new(StateInner {
                records,
                pending,
                retries: HashMap::new(),
                gave_up: BTreeSet::new(),
                dirty: BTreeSet::new(),
                last_price: HashMap::new(),
                last_volume: HashMap::new(),
                ticks: TickBuffer::new(ticks, now),
                snapshot_dirty: true,
                counters: EngineCounters::default(),
            }),
        }
    }

    /// The symbol universe.
    #[must_use]
    pub const fn symbols(&self) -> &Arc<SymbolMap> {
        &self.symbols
    }

    /// A catalog symbol.
    #[must_use]
    pub fn symbol(&self, key: &SymbolKey) -> Option<&Symbol> {
        self.symbols.get(key)
    }

    /// Market clock.
    #[must_use]
    pub const fn clock(&self) -> &MarketClock {
        &self.clock
    }

    /// The trading day this state covers.
    #[must_use]
    pub const fn trading_day(&self) -> NaiveDate {
        self.trading_day
    }

    /// Lock the mutable state. Never hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    /// Copy of today's record for `key`.
    #[must_use]
    pub fn record(&self, key: &SymbolKey) -> Option<FirstCloseRecord> {
        self.inner.lock().records.get(key).cloned()
    }

    /// `key` is waiting for the REST fallback.
    #[must_use]
    pub fn is_pending(&self, key: &SymbolKey) -> bool {
        self.inner.lock().pending.contains(key)
    }

    /// Symbols waiting for the REST fallback.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// `key` was given up for today.
    #[must_use]
    pub fn gave_up(&self, key: &SymbolKey) -> bool {
        self.inner.lock().gave_up.contains(key)
    }

    /// Last traded price seen for `key`.
    #[must_use]
    pub fn last_price(&self, key: &SymbolKey) -> Option<f64> {
        self.inner.lock().last_price.get(key).copied()
    }

    /// Ticks waiting for the tick log.
    #[must_use]
    pub fn buffered_ticks(&self) -> usize {
        self.inner.lock().ticks.len()
    }

    /// Copy of the counters.
    #[must_use]
    pub fn counters(&self) -> EngineCounters {
        self.inner.lock().counters
    }

    /// Write changed records to the store.
    ///
    /// On failure the records stay dirty for the next attempt.
    pub fn persist_dirty(&self, store: &Store) -> Result<usize, StoreError> {
        let batch: Vec<FirstCloseRecord> = {
            let mut inner = self.inner.lock();
            let keys = std::mem::take(&mut inner.dirty);
            keys.iter()
                .filter_map(|key| inner.records.get(key).cloned())
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match store.upsert_records(&batch, &self.symbols) {
            Ok(written) => Ok(written),
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.dirty.extend(batch.into_iter().map(|record| record.symbol));
                Err(e)
            }
        }
    }

    /// [`Self::persist_dirty`] on the blocking pool, off the async workers.
    pub async fn persist_dirty_blocking(self: &Arc<Self>, store: &Arc<Store>) -> Result<usize, StoreError> {
        let state = Arc::clone(self);
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || state.persist_dirty(&store)).await?
    }

    /// Write buffered ticks to the tick log if a threshold is reached, or
    /// unconditionally with `force`.
    pub fn flush_ticks(&self, store: &Store, now: Instant, force: bool) -> usize {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.ticks.is_empty() || !(force || inner.ticks.should_flush(now)) {
                return 0;
            }
            inner.ticks.take(now)
        };
        self.write_ticks(store, &batch)
    }

    /// [`Self::flush_ticks`] on the blocking pool.
    pub async fn flush_ticks_blocking(self: &Arc<Self>, store: &Arc<Store>, now: Instant, force: bool) -> usize {
        let state = Arc::clone(self);
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || state.flush_ticks(&store, now, force))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Tick flush task failed");
                0
            })
    }

    /// [`Self::write_ticks`] on the blocking pool.
    pub(crate) async fn write_ticks_blocking(
        self: &Arc<Self>,
        store: &Arc<Store>,
        batch: Vec<TickRecord>,
    ) -> usize {
        let state = Arc::clone(self);
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || state.write_ticks(&store, &batch))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Tick write task failed");
                0
            })
    }

    /// Append an already drained batch to the tick log.
    pub(crate) fn write_ticks(&self, store: &Store, batch: &[TickRecord]) -> usize {
        let count = batch.len() as u64;
        match store.append_ticks(batch) {
            Ok(written) => {
                self.inner.lock().counters.ticks_flushed += count;
                crate::infrastructure::metrics::record_ticks_flushed(written);
                written
            }
            Err(e) => {
                self.inner.lock().counters.ticks_dropped += count;
                tracing::error!(error = %e, ticks = batch.len(), "Failed to append ticks");
                0
            }
        }
    }

    /// Build the snapshot if anything changed since the last one.
    pub fn take_snapshot(&self, now: DateTime<Utc>) -> Option<Snapshot> {
        let mut inner = self.inner.lock();
        if !inner.snapshot_dirty {
            return None;
        }
        inner.snapshot_dirty = false;
        Some(self.build_snapshot(&inner, now))
    }

    /// Build the snapshot unconditionally.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let mut inner = self.inner.lock();
        inner.snapshot_dirty = false;
        self.build_snapshot(&inner, now)
    }

    /// Flag the snapshot for rewriting, e.g. after a failed write.
    pub fn mark_snapshot_dirty(&self) {
        self.inner.lock().snapshot_dirty = true;
    }

    fn build_snapshot(&self, inner: &StateInner, now: DateTime<Utc>) -> Snapshot {
        let rows: Vec<SnapshotRow> = self
            .symbols
            .iter()
            .map(|(key, symbol)| {
                let record = inner.records.get(key);
                let closes = record.map(|r| r.closes).unwrap_or_default();
                SnapshotRow {
                    symbol: key.as_str().to_string(),
                    exchange: symbol.exchange.clone(),
                    token: symbol.token.clone(),
                    display_symbol: symbol.display_symbol.clone(),
                    live_price: inner.last_price.get(key).copied(),
                    volume: inner.last_volume.get(key).copied(),
                    close_1m: closes.close_1m,
                    close_5m: closes.close_5m,
                    close_15m: closes.close_15m,
                    fetch_done: record.is_some_and(|r| r.fetch_done),
                    updated_at: record.map(|r| r.updated_at),
                }
            })
            .collect();

        Snapshot {
            generated_at: now,
            trading_day: self.trading_day,
            total: rows.len(),
            complete: rows.iter().filter(|row| row.fetch_done).count(),
            rows,
        }
    }
}
