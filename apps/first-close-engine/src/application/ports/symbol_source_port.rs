//! Symbol Source Port (Driven Port)
//!
//! Interface for fetching the symbol description files when none exist.

use std::path::Path;

use async_trait::async_trait;

/// Acquisition error.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Download failed.
    #[error("download of {url} failed: {reason}")]
    Download {
        /// Source URL.
        url: String,
        /// Failure details.
        reason: String,
    },

    /// Writing the file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Port for acquiring symbol description files.
#[async_trait]
pub trait SymbolSourceAcquirer: Send + Sync {
    /// Place symbol description files into `dir`. Returns the number written.
    async fn acquire(&self, dir: &Path) -> Result<usize, AcquireError>;
}
