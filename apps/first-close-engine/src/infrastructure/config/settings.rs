//! Engine Configuration Settings
//!
//! Configuration types for the engine, loaded from environment variables.
//! Only the broker credentials are required; everything else has a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};

use crate::application::services::{
    BackfillSettings, BackoffConfig, EnginePaths, FallbackSettings, FetchSettings,
    OrchestratorSettings, RetryPolicy, TickBufferConfig,
};
use crate::domain::{BackfillLimits, MarketClock};
use crate::infrastructure::noren::{NorenFeedConfig, NorenRestConfig};

const DEFAULT_REST_URL: &str = "https://api.shoonya.com/NorenWClientTP";
const DEFAULT_WS_URL: &str = "wss://api.shoonya.com/NorenWSTP/";
const DEFAULT_IMEI: &str = "first-close-engine";

/// Broker login credentials.
#[derive(Clone)]
pub struct BrokerCredentials {
    user_id: String,
    password: String,
    factor2: String,
    vendor_code: String,
    api_secret: String,
    imei: String,
}

impl BrokerCredentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        password: impl Into<String>,
        factor2: impl Into<String>,
        vendor_code: impl Into<String>,
        api_secret: impl Into<String>,
        imei: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            factor2: factor2.into(),
            vendor_code: vendor_code.into(),
            api_secret: api_secret.into(),
            imei: imei.into(),
        }
    }

    /// Broker user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Plain password; hashed before it leaves the process.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Second factor (PIN, TOTP or date of birth).
    #[must_use]
    pub fn factor2(&self) -> &str {
        &self.factor2
    }

    /// Vendor code.
    #[must_use]
    pub fn vendor_code(&self) -> &str {
        &self.vendor_code
    }

    /// API secret; only its hash with the user id is sent.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// Device identifier.
    #[must_use]
    pub fn imei(&self) -> &str {
        &self.imei
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .field("factor2", &"[REDACTED]")
            .field("vendor_code", &self.vendor_code)
            .field("api_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Market hours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSettings {
    /// UTC offset of the market's wall clock.
    pub utc_offset: FixedOffset,
    /// Opening time of exchanges without an override.
    pub default_open: NaiveTime,
    /// Per-exchange opening times.
    pub exchange_opens: Vec<(String, NaiveTime)>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            utc_offset: FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap_or_else(|| Utc.fix()),
            default_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or(NaiveTime::MIN),
            exchange_opens: Vec::new(),
        }
    }
}

/// Feed connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// Wait for the first connect acknowledgement at startup.
    pub startup_timeout: Duration,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,
    /// Heartbeat frame interval.
    pub heartbeat_interval: Duration,
    /// Reconnect backoff curve.
    pub reconnect: BackoffConfig,
    /// Reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Keys per subscribe call.
    pub subscribe_batch_size: usize,
    /// Pause between subscribe calls.
    pub subscribe_pause: Duration,
    /// Capacity of the feed event channel.
    pub event_buffer: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: 0.2,
            },
            max_reconnect_attempts: 0, // Unlimited
            subscribe_batch_size: 100,
            subscribe_pause: Duration::from_millis(200),
            event_buffer: 10_000,
        }
    }
}

/// Supervisory loop and output settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Loop period.
    pub interval: Duration,
    /// Minimum time between snapshot writes.
    pub snapshot_min_interval: Duration,
    /// Period of the aggregate counter log line.
    pub stats_log_interval: Duration,
    /// Wait for workers at shutdown.
    pub shutdown_timeout: Duration,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            snapshot_min_interval: Duration::from_secs(5),
            stats_log_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            metrics_port: 9090,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broker credentials.
    pub credentials: BrokerCredentials,
    /// REST base URL.
    pub rest_url: String,
    /// WebSocket URL.
    pub ws_url: String,
    /// File locations.
    pub paths: EnginePaths,
    /// URLs fetched when the symbol directory is empty.
    pub symbol_urls: Vec<String>,
    /// Market hours.
    pub market: MarketSettings,
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
    /// Feed connection.
    pub feed: FeedSettings,
    /// Supervisory loop and output.
    pub supervisor: SupervisorSettings,
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or empty, or if a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let credentials = BrokerCredentials::new(
            env.required("BROKER_USER_ID")?,
            env.required("BROKER_PASSWORD")?,
            env.required("BROKER_FACTOR2")?,
            env.required("BROKER_VENDOR_CODE")?,
            env.required("BROKER_API_SECRET")?,
            env.string("BROKER_IMEI", DEFAULT_IMEI),
        );

        let data_dir = PathBuf::from(env.string("FIRST_CLOSE_DATA_DIR", "data"));
        let paths = EnginePaths {
            db_path: env.path("FIRST_CLOSE_DB_PATH", data_dir.join("first_closes.db")),
            snapshot_path: env.path("FIRST_CLOSE_SNAPSHOT_PATH", data_dir.join("first_closes.json")),
            symbol_dir: env.path("FIRST_CLOSE_SYMBOL_DIR", data_dir.join("symbols")),
            symbol_cache_path: env.path(
                "FIRST_CLOSE_SYMBOL_CACHE_PATH",
                data_dir.join("symbols.cache.json"),
            ),
        };

        let market_defaults = MarketSettings::default();
        let market = MarketSettings {
            utc_offset: env.with("FIRST_CLOSE_UTC_OFFSET", market_defaults.utc_offset, parse_offset)?,
            default_open: env.with("FIRST_CLOSE_MARKET_OPEN", market_defaults.default_open, parse_time)?,
            exchange_opens: env.with(
                "FIRST_CLOSE_MARKET_OPENS",
                vec![
                    ("MCX".to_string(), NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)),
                    ("CDS".to_string(), NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)),
                ],
                parse_opens,
            )?,
        };

        let fetch_defaults = FetchSettings::default();
        let fetch = FetchSettings {
            concurrency: env.positive("FIRST_CLOSE_WORKER_CONCURRENCY", fetch_defaults.concurrency)?,
            request_timeout: env.positive_millis("FIRST_CLOSE_REQUEST_TIMEOUT_MS", fetch_defaults.request_timeout)?,
            retry: RetryPolicy {
                max_attempts: env.positive("FIRST_CLOSE_RETRY_ATTEMPTS", fetch_defaults.retry.max_attempts)?,
                backoff: fetch_defaults.retry.backoff,
            },
        };

        let fallback_defaults = FallbackSettings::default();
        let fallback = FallbackSettings {
            interval: env.positive_secs("FIRST_CLOSE_FALLBACK_INTERVAL_SECS", fallback_defaults.interval)?,
            batch_size: env.positive("FIRST_CLOSE_FALLBACK_BATCH", fallback_defaults.batch_size)?,
            grace: env.secs("FIRST_CLOSE_FALLBACK_GRACE_SECS", fallback_defaults.grace)?,
            max_retries: env.parse("FIRST_CLOSE_FALLBACK_MAX_RETRIES", fallback_defaults.max_retries)?,
            flush_every: env.positive("FIRST_CLOSE_FALLBACK_FLUSH_EVERY", fallback_defaults.flush_every)?,
        };

        let backfill_defaults = BackfillSettings::default();
        let backfill = BackfillSettings {
            interval: env.positive_secs("FIRST_CLOSE_BACKFILL_INTERVAL_SECS", backfill_defaults.interval)?,
            batch_size: env.positive("FIRST_CLOSE_BACKFILL_BATCH", backfill_defaults.batch_size)?,
            limits: BackfillLimits {
                max_retries: env.parse(
                    "FIRST_CLOSE_BACKFILL_MAX_RETRIES",
                    backfill_defaults.limits.max_retries,
                )?,
                max_lookback_days: env.parse(
                    "FIRST_CLOSE_BACKFILL_MAX_LOOKBACK_DAYS",
                    backfill_defaults.limits.max_lookback_days,
                )?,
                stop_empty_streak: env.positive(
                    "FIRST_CLOSE_BACKFILL_EMPTY_STREAK",
                    backfill_defaults.limits.stop_empty_streak,
                )?,
            },
        };

        let tick_defaults = TickBufferConfig::default();
        let ticks = TickBufferConfig {
            flush_size: env.positive("FIRST_CLOSE_TICK_FLUSH_SIZE", tick_defaults.flush_size)?,
            flush_interval: env.positive_millis("FIRST_CLOSE_TICK_FLUSH_INTERVAL_MS", tick_defaults.flush_interval)?,
        };

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            startup_timeout: env.positive_secs("FIRST_CLOSE_FEED_STARTUP_TIMEOUT_SECS", feed_defaults.startup_timeout)?,
            connect_timeout: env.positive_secs("FIRST_CLOSE_FEED_CONNECT_TIMEOUT_SECS", feed_defaults.connect_timeout)?,
            heartbeat_interval: env.positive_secs(
                "FIRST_CLOSE_HEARTBEAT_INTERVAL_SECS",
                feed_defaults.heartbeat_interval,
            )?,
            reconnect: BackoffConfig {
                initial_delay: env.millis(
                    "FIRST_CLOSE_RECONNECT_DELAY_INITIAL_MS",
                    feed_defaults.reconnect.initial_delay,
                )?,
                max_delay: env.secs(
                    "FIRST_CLOSE_RECONNECT_DELAY_MAX_SECS",
                    feed_defaults.reconnect.max_delay,
                )?,
                ..feed_defaults.reconnect
            },
            max_reconnect_attempts: env.parse(
                "FIRST_CLOSE_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            )?,
            subscribe_batch_size: env.positive(
                "FIRST_CLOSE_SUBSCRIBE_BATCH",
                feed_defaults.subscribe_batch_size,
            )?,
            subscribe_pause: env.millis("FIRST_CLOSE_SUBSCRIBE_PAUSE_MS", feed_defaults.subscribe_pause)?,
            event_buffer: env.positive("FIRST_CLOSE_EVENT_BUFFER", feed_defaults.event_buffer)?,
        };

        let supervisor_defaults = SupervisorSettings::default();
        let supervisor = SupervisorSettings {
            interval: supervisor_defaults.interval,
            snapshot_min_interval: env.secs(
                "FIRST_CLOSE_SNAPSHOT_MIN_INTERVAL_SECS",
                supervisor_defaults.snapshot_min_interval,
            )?,
            stats_log_interval: env.positive_secs(
                "FIRST_CLOSE_STATS_LOG_INTERVAL_SECS",
                supervisor_defaults.stats_log_interval,
            )?,
            shutdown_timeout: env.secs(
                "FIRST_CLOSE_SHUTDOWN_TIMEOUT_SECS",
                supervisor_defaults.shutdown_timeout,
            )?,
            metrics_port: env.parse("FIRST_CLOSE_METRICS_PORT", supervisor_defaults.metrics_port)?,
        };

        Ok(Self {
            credentials,
            rest_url: env.string("BROKER_REST_URL", DEFAULT_REST_URL),
            ws_url: env.string("BROKER_WS_URL", DEFAULT_WS_URL),
            paths,
            symbol_urls: env
                .optional("FIRST_CLOSE_SYMBOL_URLS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            market,
            max_sessions: env.parse("FIRST_CLOSE_REST_SESSIONS", 4)?,
            fetch,
            fallback,
            backfill,
            ticks,
            feed,
            supervisor,
        })
    }

    /// Market clock with every configured opening time.
    #[must_use]
    pub fn clock(&self) -> MarketClock {
        self.market
            .exchange_opens
            .iter()
            .fold(
                MarketClock::new(self.market.utc_offset, self.market.default_open),
                |clock, (exchange, open)| clock.with_open(exchange, *open),
            )
    }

    /// Orchestrator settings.
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            paths: self.paths.clone(),
            clock: self.clock(),
            max_sessions: self.max_sessions,
            fetch: self.fetch,
            fallback: self.fallback,
            backfill: self.backfill,
            ticks: self.ticks,
            connect_timeout: self.feed.startup_timeout,
            subscribe_batch_size: self.feed.subscribe_batch_size,
            subscribe_pause: self.feed.subscribe_pause,
            supervisor_interval: self.supervisor.interval,
            snapshot_min_interval: self.supervisor.snapshot_min_interval,
            stats_log_interval: self.supervisor.stats_log_interval,
            shutdown_timeout: self.supervisor.shutdown_timeout,
            event_buffer: self.feed.event_buffer,
        }
    }

    /// REST adapter settings.
    #[must_use]
    pub fn rest_config(&self) -> NorenRestConfig {
        NorenRestConfig {
            base_url: self.rest_url.clone(),
            request_timeout: self.fetch.request_timeout,
            market_offset: self.market.utc_offset,
        }
    }

    /// Feed adapter settings.
    #[must_use]
    pub fn feed_config(&self) -> NorenFeedConfig {
        NorenFeedConfig {
            url: self.ws_url.clone(),
            user_id: self.credentials.user_id().to_string(),
            connect_timeout: self.feed.connect_timeout,
            heartbeat_interval: self.feed.heartbeat_interval,
            reconnect: self.feed.reconnect,
            max_reconnect_attempts: self.feed.max_reconnect_attempts,
            subscribe_chunk: self.feed.subscribe_batch_size,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: PathBuf) -> PathBuf {
        self.optional(key).map_or(default, PathBuf::from)
    }

    fn with<T>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => parse(&value).ok_or(ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.with(key, default, |v| v.parse().ok())
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.with(key, default, |v| v.parse().ok().map(Duration::from_secs))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.with(key, default, |v| v.parse().ok().map(Duration::from_millis))
    }

    /// Like `parse`, but zero is invalid.
    fn positive<T: FromStr + PartialEq + Default>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.with(key, default, |v| v.parse().ok().filter(|n: &T| *n != T::default()))
    }

    fn positive_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.with(key, default, |v| {
            v.parse::<u64>().ok().filter(|n| *n > 0).map(Duration::from_secs)
        })
    }

    fn positive_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.with(key, default, |v| {
            v.parse::<u64>().ok().filter(|n| *n > 0).map(Duration::from_millis)
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

/// `+05:30`, `-04:00` or `+0530`.
fn parse_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => (1, value),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 && rest.is_ascii() => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// `MCX=09:00,CDS=09:00`.
fn parse_opens(value: &str) -> Option<Vec<(String, NaiveTime)>> {
    split_list(value)
        .iter()
        .map(|entry| {
            let (exchange, time) = entry.split_once('=')?;
            let exchange = exchange.trim();
            if exchange.is_empty() {
                return None;
            }
            Some((exchange.to_ascii_uppercase(), parse_time(time.trim())?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = [
            ("BROKER_USER_ID", "U1"),
            ("BROKER_PASSWORD", "pw"),
            ("BROKER_FACTOR2", "123456"),
            ("BROKER_VENDOR_CODE", "VC"),
            ("BROKER_API_SECRET", "secret"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
        for (k, v) in pairs {
            map.insert((*k).to_string(), (*v).to_string());
        }
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.rest_url, DEFAULT_REST_URL);
        assert_eq!(config.paths.db_path, PathBuf::from("data/first_closes.db"));
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.fallback, FallbackSettings::default());
        assert_eq!(config.backfill, BackfillSettings::default());
        assert_eq!(config.supervisor.metrics_port, 9090);
        assert!(config.symbol_urls.is_empty());

        let clock = config.clock();
        assert_eq!(clock.offset().local_minus_utc(), 19_800);
        assert_eq!(clock.open_time("NSE"), NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(clock.open_time("MCX"), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn missing_credential_is_an_error() {
        let err = EngineConfig::from_lookup(|key| {
            (key != "BROKER_API_SECRET").then(|| "x".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "BROKER_API_SECRET"));
    }

    #[test]
    fn empty_credential_is_an_error() {
        let err = EngineConfig::from_lookup(lookup(&[("BROKER_PASSWORD", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "BROKER_PASSWORD"));
    }

    #[test]
    fn overrides_flow_into_adapter_settings() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("FIRST_CLOSE_DATA_DIR", "/var/lib/fce"),
            ("FIRST_CLOSE_UTC_OFFSET", "-04:00"),
            ("FIRST_CLOSE_MARKET_OPEN", "09:30"),
            ("FIRST_CLOSE_MARKET_OPENS", "nfo=09:15"),
            ("FIRST_CLOSE_REQUEST_TIMEOUT_MS", "2500"),
            ("FIRST_CLOSE_SUBSCRIBE_BATCH", "50"),
            ("FIRST_CLOSE_SYMBOL_URLS", "https://a/x.txt, https://b/y.txt"),
            ("FIRST_CLOSE_METRICS_PORT", "0"),
        ]))
        .unwrap();

        assert_eq!(config.paths.symbol_dir, PathBuf::from("/var/lib/fce/symbols"));
        assert_eq!(config.symbol_urls, vec!["https://a/x.txt", "https://b/y.txt"]);
        assert_eq!(config.supervisor.metrics_port, 0);

        let rest = config.rest_config();
        assert_eq!(rest.request_timeout, Duration::from_millis(2500));
        assert_eq!(rest.market_offset.local_minus_utc(), -4 * 3600);

        let feed = config.feed_config();
        assert_eq!(feed.user_id, "U1");
        assert_eq!(feed.subscribe_chunk, 50);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.subscribe_batch_size, 50);
        assert_eq!(settings.clock.open_time("NFO"), NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(settings.clock.open_time("NSE"), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test_case("FIRST_CLOSE_REST_SESSIONS", "many" ; "non numeric")]
    #[test_case("FIRST_CLOSE_UTC_OFFSET", "+05:75" ; "bad offset minutes")]
    #[test_case("FIRST_CLOSE_MARKET_OPEN", "25:00" ; "bad time")]
    #[test_case("FIRST_CLOSE_MARKET_OPENS", "MCX" ; "open without time")]
    #[test_case("FIRST_CLOSE_UTC_OFFSET", "+1é1" ; "non ascii compact offset")]
    #[test_case("FIRST_CLOSE_BACKFILL_BATCH", "0" ; "zero backfill batch")]
    #[test_case("FIRST_CLOSE_FALLBACK_BATCH", "0" ; "zero fallback batch")]
    #[test_case("FIRST_CLOSE_BACKFILL_EMPTY_STREAK", "0" ; "zero empty streak")]
    #[test_case("FIRST_CLOSE_HEARTBEAT_INTERVAL_SECS", "0" ; "zero heartbeat")]
    #[test_case("FIRST_CLOSE_TICK_FLUSH_SIZE", "0" ; "zero tick flush size")]
    #[test_case("FIRST_CLOSE_TICK_FLUSH_INTERVAL_MS", "0" ; "zero tick flush interval")]
    #[test_case("FIRST_CLOSE_FALLBACK_INTERVAL_SECS", "0" ; "zero fallback interval")]
    #[test_case("FIRST_CLOSE_SUBSCRIBE_BATCH", "0" ; "zero subscribe batch")]
    #[test_case("FIRST_CLOSE_EVENT_BUFFER", "0" ; "zero event buffer")]
    fn invalid_values_are_rejected(key: &str, value: &str) {
        let err = EngineConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: k, .. } if k == key));
    }

    #[test_case("+05:30", 19_800 ; "colon")]
    #[test_case("+0530", 19_800 ; "compact")]
    #[test_case("-04:00", -14_400 ; "negative")]
    #[test_case("0", 0 ; "bare hours")]
    fn offsets(value: &str, seconds: i32) {
        assert_eq!(parse_offset(value).unwrap().local_minus_utc(), seconds);
    }

    #[test]
    fn non_ascii_compact_offset_is_none() {
        assert_eq!(parse_offset("+1é1"), None);
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = BrokerCredentials::new("U1", "pw123", "f2", "VC", "sec456", "imei");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("pw123"));
        assert!(!debug.contains("sec456"));
        assert!(debug.contains("[REDACTED]"));
    }
}
