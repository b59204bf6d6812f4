//! Market Data Feed Port (Driven Port)
//!
//! Interface for the streaming tick feed. A [`FeedConnector`] starts the
//! feed with the shared session token; the running feed pushes
//! [`FeedEvent`]s into the mpsc channel handed to it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::quote_source_port::SessionToken;
use crate::domain::SymbolKey;

/// One tick as delivered by the feed.
///
/// Incremental frames may omit fields that did not change.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedTick {
    /// Exchange segment.
    pub exchange: String,
    /// Exchange token.
    pub token: String,
    /// Last traded price.
    pub last_price: Option<f64>,
    /// Cumulative traded volume.
    pub volume: Option<u64>,
    /// Feed timestamp, unix seconds.
    pub feed_time: Option<i64>,
}

impl FeedTick {
    /// Key of the symbol this tick belongs to.
    #[must_use]
    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(&self.exchange, &self.token)
    }
}

/// Events emitted by a market data feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Session acknowledged, subscriptions may be sent.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Reconnecting after a failure.
    Reconnecting {
        /// Reconnection attempt number.
        attempt: u32,
    },
    /// A tick arrived.
    Tick(FeedTick),
    /// Error reported by the feed.
    Error(String),
}

/// Subscription error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    /// The feed has no live connection.
    #[error("feed not connected")]
    NotConnected,

    /// The subscription frame could not be sent.
    #[error("subscription failed: {0}")]
    SubscribeFailed(String),
}

/// Port for subscribing to streaming ticks.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Subscribe to ticks of `keys`. Subscriptions survive reconnects.
    async fn subscribe(&self, keys: &[SymbolKey]) -> Result<(), FeedError>;
}

/// A started feed: its subscription handle and its connection task.
pub struct FeedHandle {
    /// Subscription handle.
    pub feed: Arc<dyn MarketDataFeed>,
    /// Connection loop; ends after cancellation or a fatal error.
    pub task: JoinHandle<()>,
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Port for starting a feed on top of an authenticated session.
pub trait FeedConnector: Send + Sync {
    /// Spawn the feed's connection loop. Must be called inside the runtime.
    fn start(
        &self,
        token: &SessionToken,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> FeedHandle;
}
