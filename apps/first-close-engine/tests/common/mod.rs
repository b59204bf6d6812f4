//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use first_close_engine::application::ports::{AcquireError, FeedError};
use first_close_engine::application::services::{
    BackfillSettings, BackoffConfig, FallbackSettings, FetchSettings, RetryPolicy,
    TickBufferConfig,
};
use first_close_engine::domain::BackfillLimits;
use first_close_engine::{
    Adapters, Bar, EnginePaths, FeedConnector, FeedEvent, FeedHandle, FeedTick, FetchError,
    HistoricalQuoteSource, MarketClock, MarketDataFeed, OrchestratorSettings, SessionError,
    SessionFactory, SessionToken, Symbol, SymbolKey, SymbolSourceAcquirer,
};

/// Acquirer that never finds anything.
pub struct NoAcquire;

#[async_trait]
impl SymbolSourceAcquirer for NoAcquire {
    async fn acquire(&self, _dir: &Path) -> Result<usize, AcquireError> {
        Ok(0)
    }
}

/// Quote source serving fixed bars per `(token, day)`; everything else is empty.
#[derive(Default)]
pub struct DayQuotes {
    bars: Mutex<HashMap<(String, NaiveDate), Vec<Bar>>>,
    calls: Mutex<Vec<(String, NaiveDate)>>,
}

impl DayQuotes {
    pub fn insert(&self, token: &str, day: NaiveDate, bars: Vec<Bar>) {
        self.bars.lock().insert((token.to_string(), day), bars);
    }

    pub fn calls(&self) -> Vec<(String, NaiveDate)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HistoricalQuoteSource for DayQuotes {
    async fn fetch_window(
        &self,
        symbol: &Symbol,
        day: NaiveDate,
        _open: NaiveTime,
    ) -> Result<Vec<Bar>, FetchError> {
        let key = (symbol.token.clone(), day);
        self.calls.lock().push(key.clone());
        Ok(self.bars.lock().get(&key).cloned().unwrap_or_default())
    }
}

/// Session factory handing out one shared quote source.
pub struct FakeSessions {
    pub source: Arc<DayQuotes>,
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn login(&self) -> Result<SessionToken, SessionError> {
        Ok(SessionToken::new("test-token"))
    }

    async fn attach(
        &self,
        _index: usize,
        _token: &SessionToken,
    ) -> Result<Arc<dyn HistoricalQuoteSource>, SessionError> {
        Ok(Arc::clone(&self.source) as Arc<dyn HistoricalQuoteSource>)
    }
}

/// Feed that records subscriptions.
#[derive(Default)]
pub struct RecordingFeed {
    pub subscribed: Mutex<Vec<SymbolKey>>,
}

#[async_trait]
impl MarketDataFeed for RecordingFeed {
    async fn subscribe(&self, keys: &[SymbolKey]) -> Result<(), FeedError> {
        self.subscribed.lock().extend_from_slice(keys);
        Ok(())
    }
}

/// Connector that connects at once, replays fixed ticks and idles until cancelled.
pub struct ScriptedConnector {
    pub ticks: Vec<FeedTick>,
    pub feed: Arc<RecordingFeed>,
}

impl ScriptedConnector {
    pub fn new(ticks: Vec<FeedTick>) -> Self {
        Self {
            ticks,
            feed: Arc::new(RecordingFeed::default()),
        }
    }
}

impl FeedConnector for ScriptedConnector {
    fn start(
        &self,
        _token: &SessionToken,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> FeedHandle {
        let ticks = self.ticks.clone();
        let task = tokio::spawn(async move {
            let _ = events.send(FeedEvent::Connected).await;
            for tick in ticks {
                let _ = events.send(FeedEvent::Tick(tick)).await;
            }
            cancel.cancelled().await;
        });
        FeedHandle {
            feed: Arc::clone(&self.feed) as Arc<dyn MarketDataFeed>,
            task,
        }
    }
}

/// Market on UTC opening at midnight, so today's targets are always past.
pub fn midnight_clock() -> MarketClock {
    MarketClock::new(FixedOffset::east_opt(0).unwrap(), NaiveTime::MIN)
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Bars at `minute` past midnight of `day`.
pub fn bars(day: NaiveDate, closes: &[(u32, f64)]) -> Vec<Bar> {
    closes
        .iter()
        .map(|&(minute, close)| Bar {
            time: day.and_time(NaiveTime::MIN) + chrono::Duration::minutes(i64::from(minute)),
            open: close,
            high: close,
            low: close,
            close,
        })
        .collect()
}

/// NSE tick stamped `minute` past midnight of `day`.
pub fn tick(token: &str, day: NaiveDate, minute: u32, price: f64) -> FeedTick {
    let at = day.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::minutes(i64::from(minute));
    FeedTick {
        exchange: "NSE".to_string(),
        token: token.to_string(),
        last_price: Some(price),
        volume: Some(100),
        feed_time: Some(at.timestamp() + 30),
    }
}

/// Write a symbol file with one NSE line per token.
pub fn write_symbols(dir: &Path, tokens: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut text = String::from("Exchange,Token,LotSize,Symbol\n");
    for token in tokens {
        text.push_str(&format!("NSE,{token},1,SYM{token}\n"));
    }
    std::fs::write(dir.join("NSE_symbols.txt"), text).unwrap();
}

pub fn paths(root: &Path) -> EnginePaths {
    EnginePaths {
        db_path: root.join("engine.db"),
        snapshot_path: root.join("snapshot.json"),
        symbol_dir: root.join("symbols"),
        symbol_cache_path: root.join("symbols.cache.json"),
    }
}

/// Fast settings: no grace, short intervals, single-attempt fetches.
pub fn settings(root: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        paths: paths(root),
        clock: midnight_clock(),
        max_sessions: 2,
        fetch: FetchSettings {
            concurrency: 2,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff: BackoffConfig::default(),
            },
        },
        fallback: FallbackSettings {
            interval: Duration::from_millis(10),
            batch_size: 10,
            grace: Duration::ZERO,
            max_retries: 50,
            flush_every: 1,
        },
        backfill: BackfillSettings {
            interval: Duration::from_millis(10),
            batch_size: 10,
            limits: BackfillLimits {
                max_retries: 3,
                max_lookback_days: 30,
                stop_empty_streak: 2,
            },
        },
        ticks: TickBufferConfig {
            flush_size: 100,
            flush_interval: Duration::from_millis(50),
        },
        connect_timeout: Duration::from_secs(5),
        subscribe_batch_size: 1,
        subscribe_pause: Duration::ZERO,
        supervisor_interval: Duration::from_millis(20),
        snapshot_min_interval: Duration::ZERO,
        stats_log_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(5),
        event_buffer: 64,
    }
}

pub fn adapters(source: Arc<DayQuotes>, connector: Arc<ScriptedConnector>) -> Adapters {
    Adapters {
        acquirer: Arc::new(NoAcquire),
        sessions: Arc::new(FakeSessions { source }),
        feed: connector,
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
