//! Live Tick Ingestor
//!
//! Applies feed ticks to today's records and buffers them for the tick log.
//! A tick fills a slot only when it falls on the slot's target minute and
//! the slot is still empty, so the first qualifying tick wins.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::application::ports::FeedTick;
use crate::application::services::state::EngineState;
use crate::domain::{Slot, TickRecord, minute_of_day};
use crate::infrastructure::metrics;
use crate::infrastructure::store::Store;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// The tick belongs to a catalog symbol.
    pub known: bool,
    /// Slot filled by this tick.
    pub filled: Option<Slot>,
    /// This tick completed the symbol's record.
    pub completed: bool,
    /// Ticks written to the log as a side effect.
    pub flushed: usize,
}

/// Consumer of feed ticks.
#[derive(Debug, Clone)]
pub struct LiveTickIngestor {
    state: Arc<EngineState>,
    store: Arc<Store>,
}

impl LiveTickIngestor {
    /// Create an ingestor writing into `state` and `store`.
    #[must_use]
    pub const fn new(state: Arc<EngineState>, store: Arc<Store>) -> Self {
        Self { state, store }
    }

    /// Apply one tick received at `received` (`now` drives the flush clock).
    ///
    /// A full tick buffer is written to the log on the blocking pool.
    pub async fn on_tick(&self, tick: &FeedTick, received: DateTime<Utc>, now: Instant) -> TickOutcome {
        let key = tick.key();
        let clock = self.state.clock();
        let tick_time = tick
            .feed_time
            .and_then(|secs| clock.local_from_epoch(secs))
            .unwrap_or_else(|| clock.local(received));

        let mut outcome = TickOutcome {
            known: self.state.symbol(&key).is_some(),
            ..TickOutcome::default()
        };

        let batch = {
            let mut inner = self.state.lock();
            inner.counters.ticks_received += 1;

            if let Some(price) = tick.last_price {
                inner.last_price.insert(key.clone(), price);
                inner.snapshot_dirty = true;
            }
            if let Some(volume) = tick.volume {
                inner.last_volume.insert(key.clone(), volume);
            }

            let day = self.state.trading_day();
            let slot = clock.slot_for_minute(&tick.exchange, minute_of_day(tick_time.time()));
            if outcome.known
                && tick_time.date() == day
                && let Some(slot) = slot
                && let Some(price) = tick.last_price
            {
                let record = inner.record_mut(&key, day, received);
                if record.fill_slot(slot, price, received) {
                    outcome.filled = Some(slot);
                    outcome.completed = record.fetch_done;
                    inner.dirty.insert(key.clone());
                    inner.counters.tick_fills += 1;
                    metrics::record_slot_fill(slot, metrics::FillSource::Tick);
                    if outcome.completed {
                        inner.complete(&key);
                        tracing::debug!(symbol = %key, "Record completed from ticks");
                    }
                }
            }

            inner.ticks.push(TickRecord {
                received_ts: received,
                exchange: tick.exchange.clone(),
                token: tick.token.clone(),
                last_price: tick.last_price,
                feed_time: tick.feed_time,
                tick_time,
            });
            inner.ticks.should_flush(now).then(|| inner.ticks.take(now))
        };

        metrics::record_tick_received();
        if let Some(batch) = batch {
            outcome.flushed = self.state.write_ticks_blocking(&self.store, batch).await;
        }
        outcome
    }

    /// Flush the tick buffer if a threshold has been reached.
    pub async fn flush_due(&self, now: Instant) -> usize {
        self.state.flush_ticks_blocking(&self.store, now, false).await
    }

    /// Flush whatever is buffered.
    pub async fn flush_all(&self, now: Instant) -> usize {
        self.state.flush_ticks_blocking(&self.store, now, true).await
    }
}
