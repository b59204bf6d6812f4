//! Symbol File Downloader
//!
//! Fetches the symbol description files over HTTP into the catalog's source
//! directory. Used once at startup when the directory holds no files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::application::ports::{AcquireError, SymbolSourceAcquirer};
use crate::infrastructure::store::write_atomic;

/// Downloads each configured URL into one file.
#[derive(Debug, Clone)]
pub struct HttpSymbolDownloader {
    urls: Vec<String>,
    client: Client,
}

impl HttpSymbolDownloader {
    /// Create a downloader for `urls`.
    pub fn new(urls: Vec<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { urls, client })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, AcquireError> {
        let download_error = |reason: String| AcquireError::Download {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Local file name for `url`: its last path segment, with `.txt` appended
/// unless it already names a `.txt` or `.csv` file.
fn target_name(url: &str, index: usize) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme.split_once('/').map_or("", |(_, path)| path);
    let segment = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or_default();
    let name = if segment.is_empty() {
        format!("symbols_{index}")
    } else {
        segment.to_string()
    };
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".txt") || lower.ends_with(".csv") {
        name
    } else {
        format!("{name}.txt")
    }
}

#[async_trait]
impl SymbolSourceAcquirer for HttpSymbolDownloader {
    async fn acquire(&self, dir: &Path) -> Result<usize, AcquireError> {
        tokio::fs::create_dir_all(dir).await?;

        let mut written = 0;
        for (index, url) in self.urls.iter().enumerate() {
            let bytes = self.download(url).await?;
            let target: PathBuf = dir.join(target_name(url, index));
            tracing::info!(url, path = %target.display(), bytes = bytes.len(), "Downloaded symbol file");
            write_atomic(&target, &bytes)?;
            written += 1;
        }
        Ok(written)
    }
}
