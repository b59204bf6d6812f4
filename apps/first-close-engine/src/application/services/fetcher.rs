//! Window Fetcher
//!
//! Fans a batch of window requests out over the session pool, bounded by a
//! semaphore, and hands each result back as soon as it completes. Every
//! call carries a timeout and runs under the retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::application::ports::FetchError;
use crate::application::services::retry::RetryPolicy;
use crate::application::services::session_pool::RestSessionPool;
use crate::domain::{FirstCloses, Symbol};
use crate::infrastructure::metrics;

/// Fetch limits shared by both REST workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchSettings {
    /// Concurrent fetches per batch.
    pub concurrency: usize,
    /// Timeout of a single call.
    pub request_timeout: Duration,
    /// Retry policy wrapped around every call.
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// One `(symbol, day)` window to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Symbol to fetch.
    pub symbol: Symbol,
    /// Day to fetch.
    pub day: NaiveDate,
    /// The symbol's market open on that day.
    pub open: NaiveTime,
}

/// Result of one window fetch.
pub type WindowResult = Result<FirstCloses, FetchError>;

/// Bounded fan-out over the session pool.
#[derive(Debug, Clone)]
pub struct WindowFetcher {
    pool: Arc<RestSessionPool>,
    settings: FetchSettings,
}

impl WindowFetcher {
    /// Create a fetcher over `pool`.
    #[must_use]
    pub const fn new(pool: Arc<RestSessionPool>, settings: FetchSettings) -> Self {
        Self { pool, settings }
    }

    /// Fetch every request, calling `on_result` in completion order.
    pub async fn fetch_each<F>(&self, requests: Vec<WindowRequest>, mut on_result: F)
    where
        F: FnMut(WindowRequest, WindowResult),
    {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let source = self.pool.session_for(index);
            let semaphore = Arc::clone(&semaphore);
            let settings = self.settings;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (request, Err(FetchError::Transport("fetch pool closed".into())));
                };
                let result = settings
                    .retry
                    .run(|| {
                        let source = Arc::clone(&source);
                        let symbol = request.symbol.clone();
                        let (day, open) = (request.day, request.open);
                        async move {
                            tokio::time::timeout(
                                settings.request_timeout,
                                source.fetch_window(&symbol, day, open),
                            )
                            .await
                            .unwrap_or(Err(FetchError::Timeout))
                        }
                    })
                    .await;
                let result = result.map(|bars| FirstCloses::from_bars(&bars, request.open));
                (request, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((request, result)) => {
                    metrics::record_fetch(&result);
                    if let Err(e) = &result {
                        tracing::debug!(
                            symbol = %request.symbol.key(),
                            day = %request.day,
                            error = %e,
                            "Window fetch failed"
                        );
                    }
                    on_result(request, result);
                }
                Err(e) => tracing::error!(error = %e, "Window fetch task failed"),
            }
        }
    }
}
