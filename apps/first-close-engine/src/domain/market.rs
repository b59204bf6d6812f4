//! Market Clock
//!
//! Converts between UTC instants and the market's local wall clock, and
//! derives the per-exchange target minutes whose bars we track.
//!
//! # Target minutes
//!
//! | Slot | Minute of day |
//! |------|---------------|
//! | 1m   | open          |
//! | 5m   | open + 4      |
//! | 15m  | open + 14     |

use std::collections::HashMap;
use std::time::Duration;

use chrono::{
    DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

/// One of the three tracked bars after market open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    /// Bar covering the first minute.
    OneMinute,
    /// Bar covering the fifth minute.
    FiveMinute,
    /// Bar covering the fifteenth minute.
    FifteenMinute,
}

impl Slot {
    /// All slots, in minute order.
    pub const ALL: [Self; 3] = [Self::OneMinute, Self::FiveMinute, Self::FifteenMinute];

    /// Minutes after the open at which this slot's bar starts.
    #[must_use]
    pub const fn offset_minutes(self) -> u32 {
        match self {
            Self::OneMinute => 0,
            Self::FiveMinute => 4,
            Self::FifteenMinute => 14,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinute => "5m",
            Self::FifteenMinute => "15m",
        }
    }
}

/// Minute of day (0..1440) of a wall-clock time.
#[must_use]
pub fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Market wall clock with per-exchange opening times.
#[derive(Debug, Clone)]
pub struct MarketClock {
    offset: FixedOffset,
    default_open: NaiveTime,
    opens: HashMap<String, NaiveTime>,
}

impl MarketClock {
    /// Create a clock for a market at `offset` whose exchanges open at `default_open`.
    #[must_use]
    pub fn new(offset: FixedOffset, default_open: NaiveTime) -> Self {
        Self {
            offset,
            default_open,
            opens: HashMap::new(),
        }
    }

    /// Override the opening time of one exchange.
    #[must_use]
    pub fn with_open(mut self, exchange: &str, open: NaiveTime) -> Self {
        self.opens.insert(exchange.to_ascii_uppercase(), open);
        self
    }

    /// The market's UTC offset.
    #[must_use]
    pub const fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Opening time of an exchange.
    #[must_use]
    pub fn open_time(&self, exchange: &str) -> NaiveTime {
        self.opens
            .get(&exchange.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.default_open)
    }

    /// Market-local wall clock of a UTC instant.
    #[must_use]
    pub fn local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    /// Market-local wall clock of a unix timestamp in seconds.
    #[must_use]
    pub fn local_from_epoch(&self, epoch_secs: i64) -> Option<NaiveDateTime> {
        DateTime::from_timestamp(epoch_secs, 0).map(|utc| self.local(utc))
    }

    /// UTC instant of a market-local wall clock.
    #[must_use]
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.offset
            .from_local_datetime(&local)
            .single()
            .map_or_else(|| local.and_utc(), |dt| dt.with_timezone(&Utc))
    }

    /// The trading day containing `now`.
    #[must_use]
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date()
    }

    /// The target slot an exchange-local minute of day falls into, if any.
    #[must_use]
    pub fn slot_for_minute(&self, exchange: &str, minute: u32) -> Option<Slot> {
        let open = minute_of_day(self.open_time(exchange));
        Slot::ALL
            .into_iter()
            .find(|slot| open + slot.offset_minutes() == minute)
    }

    /// Instant after which the REST fallback may fetch `day`'s window for an exchange.
    #[must_use]
    pub fn fallback_deadline(&self, exchange: &str, day: NaiveDate, grace: Duration) -> DateTime<Utc> {
        let open = day.and_time(self.open_time(exchange));
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        self.to_utc(open) + grace
    }
}

/// The calendar day before `day`, saturating at the earliest representable date.
#[must_use]
pub fn previous_day(day: NaiveDate) -> NaiveDate {
    day.checked_sub_days(Days::new(1)).unwrap_or(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ist_clock() -> MarketClock {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        MarketClock::new(offset, NaiveTime::from_hms_opt(9, 15, 0).unwrap())
            .with_open("MCX", NaiveTime::from_hms_opt(9, 0, 0).unwrap())
    }

    #[test]
    fn slot_offsets() {
        assert_eq!(Slot::OneMinute.offset_minutes(), 0);
        assert_eq!(Slot::FiveMinute.offset_minutes(), 4);
        assert_eq!(Slot::FifteenMinute.offset_minutes(), 14);
    }

    #[test]
    fn target_minutes_follow_exchange_open() {
        let clock = ist_clock();
        let nse_open = 9 * 60 + 15;
        assert_eq!(clock.slot_for_minute("NSE", nse_open), Some(Slot::OneMinute));
        assert_eq!(clock.slot_for_minute("NSE", nse_open + 4), Some(Slot::FiveMinute));
        assert_eq!(clock.slot_for_minute("NSE", nse_open + 14), Some(Slot::FifteenMinute));
        assert_eq!(clock.slot_for_minute("NSE", nse_open + 1), None);

        assert_eq!(clock.slot_for_minute("mcx", 9 * 60), Some(Slot::OneMinute));
        assert_eq!(clock.slot_for_minute("MCX", nse_open), None);
    }

    #[test]
    fn trading_day_uses_market_offset() {
        let clock = ist_clock();
        // 20:00 UTC is already the next calendar day in IST.
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 20, 0, 0).unwrap();
        assert_eq!(clock.trading_day(now), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn fallback_deadline_adds_grace_to_local_open() {
        let clock = ist_clock();
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let deadline = clock.fallback_deadline("NSE", day, Duration::from_secs(20 * 60));
        // 09:35 IST == 04:05 UTC
        assert_eq!(deadline, Utc.with_ymd_and_hms(2024, 3, 5, 4, 5, 0).unwrap());
    }

    #[test]
    fn epoch_converts_to_local() {
        let clock = ist_clock();
        let utc = Utc.with_ymd_and_hms(2024, 3, 5, 3, 45, 30).unwrap();
        let local = clock.local_from_epoch(utc.timestamp()).unwrap();
        assert_eq!(local.time(), NaiveTime::from_hms_opt(9, 15, 30).unwrap());
    }

    #[test]
    fn previous_day_steps_back() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(previous_day(day), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }
}
