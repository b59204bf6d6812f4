//! Noren WebSocket Feed
//!
//! Streams touchline ticks for subscribed symbol keys.
//!
//! # Protocol
//!
//! 1. Send `{"t":"c",...}` with the shared session token.
//! 2. Wait for `{"t":"ck","s":"OK"}`.
//! 3. Send `{"t":"t","k":"NSE|22#BSE|500400"}` subscription frames.
//! 4. Receive `tk` (full) and `tf` (incremental) tick frames.
//!
//! A `{"t":"h"}` heartbeat is sent on a fixed interval. Subscriptions are
//! remembered and replayed after every reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::messages::{ConnectFrame, HEARTBEAT_FRAME, InboundFrame, SubscribeFrame, decode_frame};
use crate::application::ports::{
    FeedConnector, FeedError, FeedEvent, FeedHandle, MarketDataFeed, SessionToken,
};
use crate::application::services::{BackoffConfig, ExponentialBackoff};
use crate::domain::SymbolKey;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one feed connection.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// No connection within the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server refused the session.
    #[error("session rejected: {0}")]
    Rejected(String),

    /// Frame encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FeedClientError {
    const fn label(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Rejected(_) => "rejected",
            Self::Encode(_) => "encode",
            Self::MaxReconnectAttemptsExceeded => "max_reconnects",
            Self::ConnectionClosed => "closed",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Feed settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NorenFeedConfig {
    /// WebSocket URL.
    pub url: String,
    /// Broker user id sent in the connect frame.
    pub user_id: String,
    /// Timeout for the TCP/TLS/WebSocket handshake.
    pub connect_timeout: Duration,
    /// Interval between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Reconnect backoff curve.
    pub reconnect: BackoffConfig,
    /// Reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Keys per subscription frame when replaying subscriptions.
    pub subscribe_chunk: usize,
}

impl NorenFeedConfig {
    /// Defaults for `url` and `user_id`.
    #[must_use]
    pub fn new(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: 0.2,
            },
            max_reconnect_attempts: 0,
            subscribe_chunk: 100,
        }
    }
}

// =============================================================================
// Feed Client
// =============================================================================

/// WebSocket tick feed with automatic reconnection.
pub struct NorenFeed {
    config: NorenFeedConfig,
    token: SessionToken,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    subscriptions: parking_lot::RwLock<BTreeSet<SymbolKey>>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
}

impl std::fmt::Debug for NorenFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorenFeed")
            .field("url", &self.config.url)
            .field("subscriptions", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl NorenFeed {
    /// Create a feed client.
    #[must_use]
    pub fn new(
        config: NorenFeedConfig,
        token: SessionToken,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            token,
            event_tx,
            cancel,
            subscriptions: parking_lot::RwLock::new(BTreeSet::new()),
            outbound: parking_lot::Mutex::new(None),
        }
    }

    /// Keys replayed on every reconnect.
    #[must_use]
    pub fn subscribed(&self) -> Vec<SymbolKey> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Run the connection loop until cancelled or out of reconnect attempts.
    pub async fn run(self: Arc<Self>) -> Result<(), FeedClientError> {
        let mut backoff =
            ExponentialBackoff::new(self.config.reconnect, self.config.max_reconnect_attempts);

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Feed cancelled");
                return Ok(());
            }

            let result = self.connect_and_run(&mut backoff).await;
            *self.outbound.lock() = None;
            metrics::set_feed_connected(false);

            match result {
                Ok(()) => {
                    tracing::info!("Feed closed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    metrics::record_feed_error(e.label());
                    let _ = self.event_tx.send(FeedEvent::Disconnected).await;

                    let Some(delay) = backoff.next_delay() else {
                        let _ = self
                            .event_tx
                            .send(FeedEvent::Error(FeedClientError::MaxReconnectAttemptsExceeded.to_string()))
                            .await;
                        return Err(FeedClientError::MaxReconnectAttemptsExceeded);
                    };
                    let attempt = backoff.attempt_count();
                    tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting feed");
                    let _ = self.event_tx.send(FeedEvent::Reconnecting { attempt }).await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Feed cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect and pump frames until error or cancellation.
    async fn connect_and_run(&self, backoff: &mut ExponentialBackoff) -> Result<(), FeedClientError> {
        tracing::info!(url = %self.config.url, "Connecting feed");

        let (ws_stream, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(&self.config.url),
        )
        .await
        .map_err(|_| FeedClientError::ConnectTimeout(self.config.connect_timeout))??;
        let (mut write, mut read) = ws_stream.split();

        let connect = serde_json::to_string(&ConnectFrame::new(
            &self.config.user_id,
            self.token.as_str(),
        ))?;
        write.send(Message::Text(connect.into())).await?;

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(text) = out_rx.recv() => {
                    write.send(Message::Text(text.into())).await?;
                }
                _ = heartbeat.tick() => {
                    write.send(Message::Text(HEARTBEAT_FRAME.into())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                            Some(InboundFrame::Ack { ok: true, .. }) => {
                                tracing::info!("Feed session acknowledged");
                                backoff.reset();
                                *self.outbound.lock() = Some(out_tx.clone());
                                metrics::set_feed_connected(true);
                                let _ = self.event_tx.send(FeedEvent::Connected).await;
                                for frame in self.replay_frames()? {
                                    write.send(Message::Text(frame.into())).await?;
                                }
                            }
                            Some(InboundFrame::Ack { ok: false, message }) => {
                                return Err(FeedClientError::Rejected(
                                    message.unwrap_or_else(|| "connect refused".to_string()),
                                ));
                            }
                            Some(InboundFrame::Tick(tick)) => {
                                if self.event_tx.send(FeedEvent::Tick(tick)).await.is_err() {
                                    tracing::debug!("Event receiver dropped, stopping feed");
                                    return Ok(());
                                }
                            }
                            Some(InboundFrame::Other(kind)) => {
                                tracing::trace!(kind, "Ignoring feed frame");
                            }
                            None => {
                                tracing::debug!(len = text.len(), "Unparseable feed frame");
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Feed stream ended");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Subscription frames restoring every remembered key.
    fn replay_frames(&self) -> Result<Vec<String>, serde_json::Error> {
        let keys = self.subscribed();
        if !keys.is_empty() {
            tracing::info!(keys = keys.len(), "Restoring feed subscriptions");
        }
        keys.chunks(self.config.subscribe_chunk.max(1))
            .map(|chunk| serde_json::to_string(&SubscribeFrame::new(chunk)))
            .collect()
    }
}

#[async_trait]
impl MarketDataFeed for NorenFeed {
    async fn subscribe(&self, keys: &[SymbolKey]) -> Result<(), FeedError> {
        self.subscriptions.write().extend(keys.iter().cloned());

        let Some(outbound) = self.outbound.lock().clone() else {
            return Err(FeedError::NotConnected);
        };
        let frame = serde_json::to_string(&SubscribeFrame::new(keys))
            .map_err(|e| FeedError::SubscribeFailed(e.to_string()))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| FeedError::SubscribeFailed("connection closed".to_string()))
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Starts [`NorenFeed`]s.
#[derive(Debug, Clone)]
pub struct NorenFeedConnector {
    config: NorenFeedConfig,
}

impl NorenFeedConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new(config: NorenFeedConfig) -> Self {
        Self { config }
    }
}

impl FeedConnector for NorenFeedConnector {
    fn start(
        &self,
        token: &SessionToken,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> FeedHandle {
        let feed = Arc::new(NorenFeed::new(
            self.config.clone(),
            token.clone(),
            events,
            cancel,
        ));
        let runner = Arc::clone(&feed);
        let task = tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!(error = %e, "Feed stopped");
            }
        });
        FeedHandle { feed, task }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    fn config(url: String) -> NorenFeedConfig {
        NorenFeedConfig {
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 1,
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                multiplier: 1.0,
                jitter_factor: 0.0,
            },
            ..NorenFeedConfig::new(url, "U1")
        }
    }

    async fn next_text<S>(read: &mut S) -> String
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = read.next().await.unwrap().unwrap() {
                return text.as_str().to_owned();
            }
        }
    }

    #[tokio::test]
    async fn subscribe_before_connect_is_remembered() {
        let (tx, _rx) = mpsc::channel(8);
        let feed = NorenFeed::new(
            config("ws://127.0.0.1:1".into()),
            SessionToken::new("tok"),
            tx,
            CancellationToken::new(),
        );
        let keys = [SymbolKey::new("NSE", "22")];

        let err = feed.subscribe(&keys).await.unwrap_err();
        assert!(matches!(err, FeedError::NotConnected));
        assert_eq!(feed.subscribed(), keys.to_vec());
    }

    #[test]
    fn replay_frames_are_chunked() {
        let (tx, _rx) = mpsc::channel(8);
        let feed = NorenFeed::new(
            NorenFeedConfig {
                subscribe_chunk: 2,
                ..config("ws://127.0.0.1:1".into())
            },
            SessionToken::new("tok"),
            tx,
            CancellationToken::new(),
        );
        feed.subscriptions.write().extend([
            SymbolKey::new("NSE", "1"),
            SymbolKey::new("NSE", "2"),
            SymbolKey::new("NSE", "3"),
        ]);

        let frames = feed.replay_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], r#"{"t":"t","k":"NSE|1#NSE|2"}"#);
        assert_eq!(frames[1], r#"{"t":"t","k":"NSE|3"}"#);
    }

    #[tokio::test]
    async fn connects_replays_and_forwards_ticks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = accept_async(socket).await.unwrap();
            let (mut write, mut read) = ws.split();

            let connect = next_text(&mut read).await;
            write
                .send(Message::Text(r#"{"t":"ck","s":"OK"}"#.into()))
                .await
                .unwrap();
            let replay = next_text(&mut read).await;
            write
                .send(Message::Text(
                    r#"{"t":"tk","e":"NSE","tk":"22","lp":"101.5","ft":"1709610300"}"#.into(),
                ))
                .await
                .unwrap();
            let live = next_text(&mut read).await;
            (connect, replay, live, write, read)
        });

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let connector = NorenFeedConnector::new(config(url));
        let handle = connector.start(&SessionToken::new("tok"), tx, cancel.clone());
        let _ = handle.feed.subscribe(&[SymbolKey::new("NSE", "22")]).await;

        assert!(matches!(rx.recv().await, Some(FeedEvent::Connected)));
        match rx.recv().await {
            Some(FeedEvent::Tick(tick)) => {
                assert_eq!(tick.key(), SymbolKey::new("NSE", "22"));
                assert_eq!(tick.last_price, Some(101.5));
                assert_eq!(tick.feed_time, Some(1_709_610_300));
            }
            other => panic!("expected tick, got {other:?}"),
        }

        handle
            .feed
            .subscribe(&[SymbolKey::new("BSE", "500400")])
            .await
            .unwrap();

        let (connect, replay, live, _write, _read) = server.await.unwrap();
        assert!(connect.contains(r#""t":"c""#));
        assert!(connect.contains(r#""susertoken":"tok""#));
        assert_eq!(replay, r#"{"t":"t","k":"NSE|22"}"#);
        assert_eq!(live, r#"{"t":"t","k":"BSE|500400"}"#);

        cancel.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_session_gives_up_after_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(socket).await.unwrap();
                let _ = ws.next().await;
                let _ = ws
                    .send(Message::Text(
                        r#"{"t":"ck","s":"NOT_OK","emsg":"Invalid session"}"#.into(),
                    ))
                    .await;
            }
        });

        let (tx, mut rx) = mpsc::channel(16);
        let feed = Arc::new(NorenFeed::new(
            config(url),
            SessionToken::new("tok"),
            tx,
            CancellationToken::new(),
        ));
        let err = feed.run().await.unwrap_err();
        assert!(matches!(err, FeedClientError::MaxReconnectAttemptsExceeded));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], FeedEvent::Disconnected));
        assert!(matches!(events[1], FeedEvent::Reconnecting { attempt: 1 }));
        assert!(matches!(events[2], FeedEvent::Disconnected));
        assert!(matches!(events.last(), Some(FeedEvent::Error(_))));
    }
}
