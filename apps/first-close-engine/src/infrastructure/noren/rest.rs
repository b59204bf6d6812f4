//! Noren REST Adapter
//!
//! Login (`QuickAuth`), session attachment (`UserDetails`) and one-minute
//! bars (`TPSeries`) over HTTPS.
//!
//! Every handle owns its own HTTP client, so pooled handles do not share
//! connections. The window fetched for a day spans one minute before the
//! open to sixteen minutes after it, which covers all three target bars.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};

use super::messages::{
    LoginRequest, StatusReply, TimePriceRequest, UserDetailsRequest, decode_time_price,
    encode_body, sha256_hex,
};
use crate::application::ports::{
    FetchError, HistoricalQuoteSource, SessionError, SessionFactory, SessionToken,
};
use crate::domain::{Bar, Symbol};
use crate::infrastructure::config::BrokerCredentials;

/// Minutes fetched before the open.
const WINDOW_LEAD_MINUTES: i64 = 1;

/// Minutes fetched after the open.
const WINDOW_TAIL_MINUTES: i64 = 16;

const APP_VERSION: &str = "1.0.0";

/// REST adapter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NorenRestConfig {
    /// Base URL, e.g. `https://api.example.com/NorenWClientTP`.
    pub base_url: String,
    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
    /// Market UTC offset; bar windows are computed in market time.
    pub market_offset: FixedOffset,
}

impl NorenRestConfig {
    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url.trim_end_matches('/'))
    }
}

fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
}

fn transport_error(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.to_string())
    }
}

/// `Retry-After` given in seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// POST a form body and return the reply text of a 2xx response.
async fn post(client: &Client, url: &str, body: String) -> Result<String, FetchError> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|e| transport_error(&e))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited {
            retry_after: parse_retry_after(response.headers()),
        });
    }
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    response.text().await.map_err(|e| transport_error(&e))
}

/// Unix seconds bounding the bar window of `day`.
fn window_bounds(offset: FixedOffset, day: NaiveDate, open: NaiveTime) -> (i64, i64) {
    let open = day.and_time(open);
    let to_epoch = |local: NaiveDateTime| {
        offset
            .from_local_datetime(&local)
            .single()
            .map_or_else(|| local.and_utc().timestamp(), |dt| dt.timestamp())
    };
    (
        to_epoch(open - chrono::Duration::minutes(WINDOW_LEAD_MINUTES)),
        to_epoch(open + chrono::Duration::minutes(WINDOW_TAIL_MINUTES)),
    )
}

// =============================================================================
// Session Factory
// =============================================================================

/// Logs in once and attaches quote sources to the shared token.
pub struct NorenSessionFactory {
    config: NorenRestConfig,
    credentials: BrokerCredentials,
    client: Client,
}

impl std::fmt::Debug for NorenSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorenSessionFactory")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl NorenSessionFactory {
    /// Create a factory.
    pub fn new(config: NorenRestConfig, credentials: BrokerCredentials) -> reqwest::Result<Self> {
        let client = build_client(config.request_timeout)?;
        Ok(Self {
            config,
            credentials,
            client,
        })
    }
}

#[async_trait]
impl SessionFactory for NorenSessionFactory {
    async fn login(&self) -> Result<SessionToken, SessionError> {
        let creds = &self.credentials;
        let request = LoginRequest {
            uid: creds.user_id(),
            pwd: sha256_hex(creds.password()),
            factor2: creds.factor2(),
            vc: creds.vendor_code(),
            appkey: sha256_hex(&format!("{}|{}", creds.user_id(), creds.api_secret())),
            imei: creds.imei(),
            source: "API",
            apkversion: APP_VERSION,
        };
        let body = encode_body(&request, None).map_err(|e| SessionError::Login(e.to_string()))?;

        let text = post(&self.client, &self.config.endpoint("QuickAuth"), body)
            .await
            .map_err(|e| SessionError::Login(e.to_string()))?;
        let reply: StatusReply = serde_json::from_str(&text)
            .map_err(|e| SessionError::Login(format!("unreadable login reply: {e}")))?;

        match reply.susertoken.as_deref() {
            Some(token) if reply.is_ok() && !token.is_empty() => {
                tracing::info!(user = creds.user_id(), "Broker login succeeded");
                Ok(SessionToken::new(token))
            }
            _ => Err(SessionError::Login(reply.reason())),
        }
    }

    async fn attach(
        &self,
        index: usize,
        token: &SessionToken,
    ) -> Result<Arc<dyn HistoricalQuoteSource>, SessionError> {
        let attach_error = |reason: String| SessionError::Attach { index, reason };
        let client = build_client(self.config.request_timeout).map_err(|e| attach_error(e.to_string()))?;
        let source = NorenQuoteSource {
            client,
            config: self.config.clone(),
            user_id: self.credentials.user_id().to_string(),
            token: token.clone(),
        };
        source.check_session().await.map_err(|e| attach_error(e.to_string()))?;
        tracing::debug!(index, "REST session attached");
        Ok(Arc::new(source))
    }
}

// =============================================================================
// Quote Source
// =============================================================================

/// One authenticated REST handle.
pub struct NorenQuoteSource {
    client: Client,
    config: NorenRestConfig,
    user_id: String,
    token: SessionToken,
}

impl std::fmt::Debug for NorenQuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorenQuoteSource")
            .field("base_url", &self.config.base_url)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl NorenQuoteSource {
    /// Verify the token with a `UserDetails` call.
    async fn check_session(&self) -> Result<(), FetchError> {
        let body = encode_body(&UserDetailsRequest { uid: &self.user_id }, Some(self.token.as_str()))
            .map_err(|e| FetchError::Rejected(e.to_string()))?;
        let text = post(&self.client, &self.config.endpoint("UserDetails"), body).await?;
        let reply: StatusReply =
            serde_json::from_str(&text).map_err(|e| FetchError::Rejected(e.to_string()))?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(FetchError::Rejected(reply.reason()))
        }
    }
}

#[async_trait]
impl HistoricalQuoteSource for NorenQuoteSource {
    async fn fetch_window(
        &self,
        symbol: &Symbol,
        day: NaiveDate,
        open: NaiveTime,
    ) -> Result<Vec<Bar>, FetchError> {
        let (start, end) = window_bounds(self.config.market_offset, day, open);
        let request = TimePriceRequest {
            uid: &self.user_id,
            exch: &symbol.exchange,
            token: &symbol.token,
            st: start.to_string(),
            et: end.to_string(),
            intrv: "1",
        };
        let body = encode_body(&request, Some(self.token.as_str()))
            .map_err(|e| FetchError::Rejected(e.to_string()))?;
        let text = post(&self.client, &self.config.endpoint("TPSeries"), body).await?;
        decode_time_price(&text)
    }
}
