//! Snapshot Document
//!
//! The JSON document published for external consumers. It is rebuilt from
//! scratch on every write and never patched in place.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One symbol's row for the current trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    /// Symbol key.
    pub symbol: String,
    /// Exchange segment.
    pub exchange: String,
    /// Exchange token.
    pub token: String,
    /// Human readable trading symbol.
    pub display_symbol: String,
    /// Most recent traded price seen on the feed.
    pub live_price: Option<f64>,
    /// Most recent cumulative volume seen on the feed.
    pub volume: Option<u64>,
    /// First 1-minute close.
    #[serde(rename = "close1m")]
    pub close_1m: Option<f64>,
    /// First 5-minute close.
    #[serde(rename = "close5m")]
    pub close_5m: Option<f64>,
    /// First 15-minute close.
    #[serde(rename = "close15m")]
    pub close_15m: Option<f64>,
    /// All three closes are known.
    pub fetch_done: bool,
    /// Last change of the closes.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Full snapshot of the current trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Build time.
    pub generated_at: DateTime<Utc>,
    /// Day the rows belong to.
    pub trading_day: NaiveDate,
    /// Number of rows.
    pub total: usize,
    /// Rows with all three closes.
    pub complete: usize,
    /// Rows ordered by symbol key.
    pub rows: Vec<SnapshotRow>,
}
