//! First-Close Records
//!
//! Value types for the three tracked closes of a `(symbol, day)`, the
//! per-symbol history walk cursor, and raw ticks destined for the tick log.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::{Slot, minute_of_day, previous_day};
use super::symbol::SymbolKey;

/// One timestamped OHLC bar as returned by a historical quote source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// Market-local start of the bar.
    pub time: NaiveDateTime,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
}

/// The three nullable first closes of one trading day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstCloses {
    /// Close of the bar at the open.
    pub close_1m: Option<f64>,
    /// Close of the bar at open + 4 minutes.
    pub close_5m: Option<f64>,
    /// Close of the bar at open + 14 minutes.
    pub close_15m: Option<f64>,
}

impl FirstCloses {
    /// Value of one slot.
    #[must_use]
    pub const fn get(&self, slot: Slot) -> Option<f64> {
        match slot {
            Slot::OneMinute => self.close_1m,
            Slot::FiveMinute => self.close_5m,
            Slot::FifteenMinute => self.close_15m,
        }
    }

    const fn slot_mut(&mut self, slot: Slot) -> &mut Option<f64> {
        match slot {
            Slot::OneMinute => &mut self.close_1m,
            Slot::FiveMinute => &mut self.close_5m,
            Slot::FifteenMinute => &mut self.close_15m,
        }
    }

    /// Fill a slot if it is still empty. Returns whether the slot changed.
    pub fn fill(&mut self, slot: Slot, price: f64) -> bool {
        let current = self.slot_mut(slot);
        if current.is_some() {
            return false;
        }
        *current = Some(price);
        true
    }

    /// Copy every slot of `other` into the slots still empty here.
    ///
    /// Returns the number of slots filled.
    pub fn fill_missing(&mut self, other: &Self) -> usize {
        Slot::ALL
            .into_iter()
            .filter(|&slot| other.get(slot).is_some_and(|price| self.fill(slot, price)))
            .count()
    }

    /// All three closes are known.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.close_1m.is_some() && self.close_5m.is_some() && self.close_15m.is_some()
    }

    /// None of the closes is known.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.close_1m.is_none() && self.close_5m.is_none() && self.close_15m.is_none()
    }

    /// Pick the target bars out of a window of one-minute bars.
    ///
    /// A bar counts for a slot when its start minute equals `open` plus the
    /// slot offset. Bars that do not line up are ignored.
    #[must_use]
    pub fn from_bars(bars: &[Bar], open: NaiveTime) -> Self {
        let open_minute = minute_of_day(open);
        let mut closes = Self::default();
        for bar in bars {
            if !bar.close.is_finite() {
                continue;
            }
            let minute = minute_of_day(bar.time.time());
            if let Some(slot) = Slot::ALL
                .into_iter()
                .find(|slot| open_minute + slot.offset_minutes() == minute)
            {
                closes.fill(slot, bar.close);
            }
        }
        closes
    }
}

/// Stored first closes of one `(symbol, day)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstCloseRecord {
    /// Symbol key.
    pub symbol: SymbolKey,
    /// Trading day.
    pub day: NaiveDate,
    /// The closes found so far.
    pub closes: FirstCloses,
    /// All closes are known. Left `false` after giving up on the day.
    pub fetch_done: bool,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl FirstCloseRecord {
    /// Empty record for a `(symbol, day)`.
    #[must_use]
    pub fn new(symbol: SymbolKey, day: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            symbol,
            day,
            closes: FirstCloses::default(),
            fetch_done: false,
            updated_at: now,
        }
    }

    /// Fill one slot from a tick. Returns whether the slot changed.
    pub fn fill_slot(&mut self, slot: Slot, price: f64, now: DateTime<Utc>) -> bool {
        let changed = self.closes.fill(slot, price);
        if changed {
            self.updated_at = now;
            self.fetch_done |= self.closes.is_complete();
        }
        changed
    }

    /// Merge closes from a REST fetch without overwriting known slots.
    ///
    /// Returns the number of slots filled.
    pub fn merge(&mut self, closes: &FirstCloses, now: DateTime<Utc>) -> usize {
        let filled = self.closes.fill_missing(closes);
        if filled > 0 {
            self.updated_at = now;
            self.fetch_done |= self.closes.is_complete();
        }
        filled
    }
}

/// Stop thresholds of the history walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillLimits {
    /// Failed attempts on one day before it is skipped.
    pub max_retries: u32,
    /// Days walked before a symbol is finished.
    pub max_lookback_days: u32,
    /// Consecutive empty days before a symbol is finished.
    pub stop_empty_streak: u32,
}

/// Per-symbol cursor of the backward history walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillState {
    /// Symbol key.
    pub symbol: SymbolKey,
    /// Next day to fetch. Only moves backwards.
    pub next_day: NaiveDate,
    /// Consecutive processed days without any close.
    pub empty_streak: u32,
    /// Days processed so far.
    pub lookback_days: u32,
    /// Failed attempts on `next_day`.
    pub retries: u32,
    /// Nothing left to walk.
    pub done: bool,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl BackfillState {
    /// Initial cursor: the day before `trading_day`, counters zero.
    #[must_use]
    pub fn seed(symbol: SymbolKey, trading_day: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            symbol,
            next_day: previous_day(trading_day),
            empty_streak: 0,
            lookback_days: 0,
            retries: 0,
            done: false,
            updated_at: now,
        }
    }

    /// A fetch of `next_day` returned (possibly empty) closes.
    pub fn apply_success(&mut self, closes: &FirstCloses, limits: BackfillLimits, now: DateTime<Utc>) {
        if closes.is_empty() {
            self.empty_streak += 1;
        } else {
            self.empty_streak = 0;
        }
        self.advance();
        self.finish_update(limits, now);
    }

    /// A fetch of `next_day` failed.
    ///
    /// Below `max_retries` the same day is retried next cycle; at the
    /// ceiling the day counts as processed and empty.
    pub fn apply_failure(&mut self, limits: BackfillLimits, now: DateTime<Utc>) {
        self.retries += 1;
        if self.retries >= limits.max_retries {
            self.empty_streak += 1;
            self.advance();
        }
        self.finish_update(limits, now);
    }

    /// Keep the cursor strictly before `trading_day`.
    ///
    /// Returns whether the cursor moved.
    pub fn clamp_before(&mut self, trading_day: NaiveDate, now: DateTime<Utc>) -> bool {
        if self.next_day < trading_day {
            return false;
        }
        self.next_day = previous_day(trading_day);
        self.retries = 0;
        self.updated_at = now;
        true
    }

    /// Finish the walk without further fetches.
    pub fn retire(&mut self, now: DateTime<Utc>) {
        self.done = true;
        self.updated_at = now;
    }

    fn advance(&mut self) {
        self.lookback_days += 1;
        self.retries = 0;
        self.next_day = previous_day(self.next_day);
    }

    fn finish_update(&mut self, limits: BackfillLimits, now: DateTime<Utc>) {
        self.done = self.lookback_days >= limits.max_lookback_days
            || self.empty_streak >= limits.stop_empty_streak;
        self.updated_at = now;
    }
}

/// One raw tick as appended to the tick log.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    /// Receipt time.
    pub received_ts: DateTime<Utc>,
    /// Exchange segment.
    pub exchange: String,
    /// Exchange token.
    pub token: String,
    /// Last traded price, if the frame carried one.
    pub last_price: Option<f64>,
    /// Feed timestamp in unix seconds, if the frame carried one.
    pub feed_time: Option<i64>,
    /// Market-local time the tick is attributed to.
    pub tick_time: NaiveDateTime,
}
