//! Noren Wire Messages
//!
//! REST requests are form bodies of the shape `jData=<json>&jKey=<token>`;
//! replies are JSON. The feed speaks JSON text frames tagged by `"t"`.
//!
//! # Feed Frames
//!
//! | `t`  | Direction | Meaning |
//! |------|-----------|---------|
//! | `c`  | out       | connect with the session token |
//! | `ck` | in        | connect acknowledgement (`s = "OK"`) |
//! | `t`  | out       | touchline subscribe, keys joined by `#` |
//! | `tk` | in        | subscription acknowledgement carrying a full tick |
//! | `tf` | in        | incremental tick, unchanged fields omitted |
//! | `h`  | out       | heartbeat |

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::application::ports::{FeedTick, FetchError};
use crate::domain::{Bar, SymbolKey};

/// Bar timestamps in `TPSeries` replies.
pub const BAR_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Lowercase hex SHA-256 of `input`.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Form body of a REST call.
pub fn encode_body<T: Serialize>(data: &T, key: Option<&str>) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(data)?;
    Ok(match key {
        Some(key) => format!("jData={json}&jKey={key}"),
        None => format!("jData={json}"),
    })
}

// =============================================================================
// REST
// =============================================================================

/// `QuickAuth` request.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    /// User id.
    pub uid: &'a str,
    /// SHA-256 of the password.
    pub pwd: String,
    /// Second factor (OTP or TOTP).
    pub factor2: &'a str,
    /// Vendor code.
    pub vc: &'a str,
    /// SHA-256 of `uid|api_secret`.
    pub appkey: String,
    /// Device identifier.
    pub imei: &'a str,
    /// Client kind.
    pub source: &'static str,
    /// Client version.
    pub apkversion: &'static str,
}

/// `UserDetails` request.
#[derive(Debug, Clone, Serialize)]
pub struct UserDetailsRequest<'a> {
    /// User id.
    pub uid: &'a str,
}

/// `TPSeries` request; times are unix seconds as strings.
#[derive(Debug, Clone, Serialize)]
pub struct TimePriceRequest<'a> {
    /// User id.
    pub uid: &'a str,
    /// Exchange segment.
    pub exch: &'a str,
    /// Exchange token.
    pub token: &'a str,
    /// Window start.
    pub st: String,
    /// Window end.
    pub et: String,
    /// Bar interval in minutes.
    pub intrv: &'static str,
}

/// Generic object reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusReply {
    /// `Ok` or `Not_Ok`.
    #[serde(default)]
    pub stat: String,
    /// Error message on `Not_Ok`.
    #[serde(default)]
    pub emsg: Option<String>,
    /// Session token, on login replies.
    #[serde(default)]
    pub susertoken: Option<String>,
}

impl StatusReply {
    /// `stat` is `Ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.stat.eq_ignore_ascii_case("ok")
    }

    /// Error message, or the raw status.
    #[must_use]
    pub fn reason(&self) -> String {
        self.emsg.clone().unwrap_or_else(|| format!("stat={}", self.stat))
    }
}

/// One bar of a `TPSeries` reply; every field is a string.
#[derive(Debug, Clone, Deserialize)]
struct TimePriceBar {
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    into: Option<String>,
    #[serde(default)]
    inth: Option<String>,
    #[serde(default)]
    intl: Option<String>,
    #[serde(default)]
    intc: Option<String>,
}

impl TimePriceBar {
    fn to_bar(&self) -> Option<Bar> {
        let time = NaiveDateTime::parse_from_str(self.time.as_deref()?.trim(), BAR_TIME_FORMAT).ok()?;
        let close = parse_price(self.intc.as_deref())?;
        Some(Bar {
            time,
            open: parse_price(self.into.as_deref()).unwrap_or(close),
            high: parse_price(self.inth.as_deref()).unwrap_or(close),
            low: parse_price(self.intl.as_deref()).unwrap_or(close),
            close,
        })
    }
}

fn parse_price(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Decode a `TPSeries` reply body.
///
/// An array yields its parseable bars. A `Not_Ok` object is "no data"
/// (empty), an expired session, or a rejection. Anything else is empty.
pub fn decode_time_price(body: &str) -> Result<Vec<Bar>, FetchError> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable TPSeries reply treated as empty");
            return Ok(Vec::new());
        }
    };

    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<TimePriceBar>(item).ok())
            .filter_map(|bar| bar.to_bar())
            .collect()),
        serde_json::Value::Object(_) => {
            let reply: StatusReply = serde_json::from_value(value).unwrap_or_default();
            if reply.is_ok() {
                return Ok(Vec::new());
            }
            let reason = reply.reason();
            let lower = reason.to_lowercase();
            if lower.contains("no data") {
                Ok(Vec::new())
            } else if lower.contains("session expired") || lower.contains("invalid session") {
                Err(FetchError::SessionExpired)
            } else {
                Err(FetchError::Rejected(reason))
            }
        }
        _ => Ok(Vec::new()),
    }
}

// =============================================================================
// Feed
// =============================================================================

/// Connect frame.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectFrame<'a> {
    t: &'static str,
    uid: &'a str,
    actid: &'a str,
    susertoken: &'a str,
    source: &'static str,
}

impl<'a> ConnectFrame<'a> {
    /// Connect as `uid` with the shared session token.
    #[must_use]
    pub const fn new(uid: &'a str, susertoken: &'a str) -> Self {
        Self {
            t: "c",
            uid,
            actid: uid,
            susertoken,
            source: "API",
        }
    }
}

/// Touchline subscribe frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame {
    t: &'static str,
    k: String,
}

impl SubscribeFrame {
    /// Subscribe `keys`.
    #[must_use]
    pub fn new(keys: &[SymbolKey]) -> Self {
        Self {
            t: "t",
            k: keys
                .iter()
                .map(SymbolKey::as_str)
                .collect::<Vec<_>>()
                .join("#"),
        }
    }

    /// The joined key list.
    #[must_use]
    pub fn keys(&self) -> &str {
        &self.k
    }
}

/// Heartbeat frame text.
pub const HEARTBEAT_FRAME: &str = r#"{"t":"h"}"#;

#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    #[serde(default)]
    t: String,
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    tk: Option<String>,
    #[serde(default)]
    lp: Option<String>,
    #[serde(default)]
    v: Option<String>,
    #[serde(default)]
    ft: Option<String>,
    #[serde(default)]
    emsg: Option<String>,
}

/// Decoded inbound feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Connect acknowledgement.
    Ack {
        /// The session was accepted.
        ok: bool,
        /// Server message, if any.
        message: Option<String>,
    },
    /// A tick.
    Tick(FeedTick),
    /// Anything else.
    Other(String),
}

/// Decode one text frame.
///
/// Returns `None` for text that is not a JSON object.
#[must_use]
pub fn decode_frame(text: &str) -> Option<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text).ok()?;
    Some(match raw.t.as_str() {
        "ck" => InboundFrame::Ack {
            ok: raw.s.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("ok")),
            message: raw.emsg,
        },
        "tk" | "tf" => match (raw.e, raw.tk) {
            (Some(exchange), Some(token)) => InboundFrame::Tick(FeedTick {
                exchange,
                token,
                last_price: parse_price(raw.lp.as_deref()),
                volume: raw.v.as_deref().and_then(|v| v.trim().parse().ok()),
                feed_time: raw.ft.as_deref().and_then(|v| v.trim().parse().ok()),
            }),
            _ => InboundFrame::Other(raw.t),
        },
        _ => InboundFrame::Other(raw.t),
    })
}
