//! REST Session Pool
//!
//! A fixed set of authenticated quote sources sharing one login. Jobs pick
//! a handle by round-robin over their batch index.

use std::sync::Arc;

use crate::application::ports::{
    HistoricalQuoteSource, SessionError, SessionFactory, SessionToken,
};

/// Pool construction error.
#[derive(Debug, thiserror::Error)]
pub enum SessionPoolError {
    /// The shared login failed.
    #[error(transparent)]
    Login(SessionError),

    /// No handle could be attached.
    #[error("no REST session could be attached ({attempted} attempted)")]
    Empty {
        /// Handles attempted.
        attempted: usize,
    },
}

/// Static pool of quote sources.
pub struct RestSessionPool {
    sessions: Vec<Arc<dyn HistoricalQuoteSource>>,
}

impl std::fmt::Debug for RestSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSessionPool")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl RestSessionPool {
    /// Log in once, then attach `min(max_sessions, worker_concurrency)` handles.
    pub async fn build(
        factory: &dyn SessionFactory,
        max_sessions: usize,
        worker_concurrency: usize,
    ) -> Result<Self, SessionPoolError> {
        let token = factory.login().await.map_err(SessionPoolError::Login)?;
        Self::attach(factory, &token, max_sessions, worker_concurrency).await
    }

    /// Attach `min(max_sessions, worker_concurrency)` handles to an existing login.
    ///
    /// Handles that fail to attach are dropped; handle 0 is the primary.
    pub async fn attach(
        factory: &dyn SessionFactory,
        token: &SessionToken,
        max_sessions: usize,
        worker_concurrency: usize,
    ) -> Result<Self, SessionPoolError> {
        let target = max_sessions.min(worker_concurrency).max(1);
        let mut sessions = Vec::with_capacity(target);
        for index in 0..target {
            match factory.attach(index, token).await {
                Ok(source) => sessions.push(source),
                Err(e) => tracing::warn!(index, error = %e, "Dropping REST session"),
            }
        }

        if sessions.is_empty() {
            return Err(SessionPoolError::Empty { attempted: target });
        }

        tracing::info!(sessions = sessions.len(), target, "REST session pool ready");
        crate::infrastructure::metrics::set_rest_sessions(sessions.len());
        Ok(Self { sessions })
    }

    /// Wrap already built sources.
    ///
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn from_sources(sessions: Vec<Arc<dyn HistoricalQuoteSource>>) -> Option<Self> {
        (!sessions.is_empty()).then_some(Self { sessions })
    }

    /// Handle for the `index`-th job of a batch.
    #[must_use]
    pub fn session_for(&self, index: usize) -> Arc<dyn HistoricalQuoteSource> {
        Arc::clone(&self.sessions[index % self.sessions.len()])
    }

    /// Number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Always `false`; an empty pool cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
