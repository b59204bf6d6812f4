//! Scripted quote source and fixtures shared by service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use parking_lot::Mutex;

use crate::application::ports::{FetchError, HistoricalQuoteSource};
use crate::application::services::fetcher::{FetchSettings, WindowFetcher};
use crate::application::services::retry::{BackoffConfig, RetryPolicy};
use crate::application::services::session_pool::RestSessionPool;
use crate::domain::{Bar, MarketClock, Slot, Symbol, SymbolMap};

type Script = VecDeque<Result<Vec<Bar>, FetchError>>;

/// Quote source answering from per-`(token, day)` queues; unscripted
/// windows return no bars.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<(String, NaiveDate), Script>>,
    calls: Mutex<Vec<(String, NaiveDate)>>,
}

impl ScriptedSource {
    pub fn push(&self, token: &str, day: NaiveDate, answer: Result<Vec<Bar>, FetchError>) {
        self.scripts
            .lock()
            .entry((token.to_string(), day))
            .or_default()
            .push_back(answer);
    }

    pub fn calls(&self) -> Vec<(String, NaiveDate)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HistoricalQuoteSource for ScriptedSource {
    async fn fetch_window(
        &self,
        symbol: &Symbol,
        day: NaiveDate,
        _open: NaiveTime,
    ) -> Result<Vec<Bar>, FetchError> {
        let key = (symbol.token.clone(), day);
        self.calls.lock().push(key.clone());
        self.scripts
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

pub fn ist_clock() -> MarketClock {
    MarketClock::new(
        FixedOffset::east_opt(19_800).unwrap(),
        NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
    )
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn symbols(tokens: &[&str]) -> Arc<SymbolMap> {
    Arc::new(
        tokens
            .iter()
            .map(|token| {
                let symbol = Symbol::new("NSE", *token, "");
                (symbol.key(), symbol)
            })
            .collect(),
    )
}

/// Bars at the 09:15 open carrying the given slot closes.
pub fn bars(day: NaiveDate, closes: &[(Slot, f64)]) -> Vec<Bar> {
    let open = day.and_time(NaiveTime::from_hms_opt(9, 15, 0).unwrap());
    closes
        .iter()
        .map(|&(slot, close)| Bar {
            time: open + chrono::Duration::minutes(i64::from(slot.offset_minutes())),
            open: close,
            high: close,
            low: close,
            close,
        })
        .collect()
}

pub fn full_bars(day: NaiveDate) -> Vec<Bar> {
    bars(
        day,
        &[
            (Slot::OneMinute, 1.0),
            (Slot::FiveMinute, 5.0),
            (Slot::FifteenMinute, 15.0),
        ],
    )
}

/// Single-attempt fetcher over one scripted source.
pub fn fetcher(source: Arc<ScriptedSource>) -> WindowFetcher {
    let pool = RestSessionPool::from_sources(vec![source as Arc<dyn HistoricalQuoteSource>])
        .unwrap();
    WindowFetcher::new(
        Arc::new(pool),
        FetchSettings {
            concurrency: 4,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff: BackoffConfig::default(),
            },
        },
    )
}
