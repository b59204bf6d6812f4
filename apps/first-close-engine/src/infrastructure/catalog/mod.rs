//! Symbol Catalog
//!
//! Loads the symbol universe from the `*.txt` / `*.csv` description files
//! in one directory. Parsing is skipped while the directory's fingerprint
//! (name, size and modification time of every file) matches the cached one,
//! kept in memory and in a JSON cache file next to the sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::application::ports::{AcquireError, SymbolSourceAcquirer};
use crate::domain::{Symbol, SymbolMap, parse_symbol_line};
use crate::infrastructure::store::write_atomic;

const SOURCE_EXTENSIONS: [&str; 2] = ["txt", "csv"];

/// Signature of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, nanoseconds since the unix epoch.
    pub modified_nanos: u64,
}

/// Signature of the whole source directory, sorted by file name.
pub type Fingerprint = Vec<FileStamp>;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    fingerprint: Fingerprint,
    symbols: Vec<Symbol>,
}

#[derive(Debug)]
struct Cached {
    fingerprint: Fingerprint,
    symbols: Arc<SymbolMap>,
}

/// Result of a catalog load.
#[derive(Debug, Clone)]
pub struct CatalogLoad {
    /// The symbol universe.
    pub symbols: Arc<SymbolMap>,
    /// The source files were parsed during this load.
    pub reparsed: bool,
}

/// Catalog error.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Filesystem failure.
    #[error("symbol source {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// No symbol could be loaded.
    #[error("no symbols found in {0}")]
    Empty(PathBuf),

    /// Acquisition failed.
    #[error(transparent)]
    Acquire(#[from] AcquireError),
}

/// Fingerprinted symbol loader.
#[derive(Debug)]
pub struct SymbolCatalog {
    source_dir: PathBuf,
    cache_path: PathBuf,
    cached: Option<Cached>,
}

impl SymbolCatalog {
    /// Catalog over `source_dir`, caching into `cache_path`.
    #[must_use]
    pub const fn new(source_dir: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            source_dir,
            cache_path,
            cached: None,
        }
    }

    /// Source directory.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Load the universe, reparsing only when the sources changed.
    ///
    /// An empty source directory yields an empty map.
    pub fn load(&mut self) -> Result<CatalogLoad, CatalogError> {
        let fingerprint = self.fingerprint()?;

        if let Some(cached) = &self.cached
            && cached.fingerprint == fingerprint
        {
            return Ok(CatalogLoad {
                symbols: Arc::clone(&cached.symbols),
                reparsed: false,
            });
        }

        if let Some(symbols) = self.read_cache_file(&fingerprint) {
            tracing::debug!(symbols = symbols.len(), "Symbol cache file is current");
            let symbols = Arc::new(symbols);
            self.cached = Some(Cached {
                fingerprint,
                symbols: Arc::clone(&symbols),
            });
            return Ok(CatalogLoad {
                symbols,
                reparsed: false,
            });
        }

        let symbols = self.parse_sources(&fingerprint)?;
        tracing::info!(
            files = fingerprint.len(),
            symbols = symbols.len(),
            "Symbol sources parsed"
        );
        self.write_cache_file(&fingerprint, &symbols);

        let symbols = Arc::new(symbols);
        self.cached = Some(Cached {
            fingerprint,
            symbols: Arc::clone(&symbols),
        });
        Ok(CatalogLoad {
            symbols,
            reparsed: true,
        })
    }

    /// Load the universe, acquiring the source files once if none exist.
    pub async fn load_or_acquire(
        &mut self,
        acquirer: &dyn SymbolSourceAcquirer,
    ) -> Result<CatalogLoad, CatalogError> {
        let load = self.load()?;
        if !load.symbols.is_empty() {
            return Ok(load);
        }

        tracing::warn!(dir = %self.source_dir.display(), "No symbol sources, acquiring");
        fs::create_dir_all(&self.source_dir).map_err(|source| CatalogError::Io {
            path: self.source_dir.clone(),
            source,
        })?;
        let written = acquirer.acquire(&self.source_dir).await?;
        tracing::info!(files = written, "Symbol sources acquired");

        let load = self.load()?;
        if load.symbols.is_empty() {
            return Err(CatalogError::Empty(self.source_dir.clone()));
        }
        Ok(load)
    }

    fn source_files(&self) -> Result<Vec<PathBuf>, CatalogError> {
        let entries = match fs::read_dir(&self.source_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.source_dir.clone(),
                    source,
                });
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_source_file(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn fingerprint(&self) -> Result<Fingerprint, CatalogError> {
        self.source_files()?
            .into_iter()
            .map(|path| {
                let meta = fs::metadata(&path).map_err(|source| CatalogError::Io {
                    path: path.clone(),
                    source,
                })?;
                let modified_nanos = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos() as u64);
                Ok(FileStamp {
                    name: file_name(&path),
                    size: meta.len(),
                    modified_nanos,
                })
            })
            .collect()
    }

    fn parse_sources(&self, fingerprint: &Fingerprint) -> Result<SymbolMap, CatalogError> {
        let mut symbols = SymbolMap::new();
        for stamp in fingerprint {
            let path = self.source_dir.join(&stamp.name);
            let bytes = fs::read(&path).map_err(|source| CatalogError::Io {
                path: path.clone(),
                source,
            })?;
            let text = String::from_utf8_lossy(&bytes);
            for symbol in text.lines().filter_map(parse_symbol_line) {
                symbols.entry(symbol.key()).or_insert(symbol);
            }
        }
        Ok(symbols)
    }

    fn read_cache_file(&self, fingerprint: &Fingerprint) -> Option<SymbolMap> {
        let bytes = fs::read(&self.cache_path).ok()?;
        let cache: CacheFile = serde_json::from_slice(&bytes).ok()?;
        if cache.fingerprint != *fingerprint || cache.symbols.is_empty() {
            return None;
        }
        Some(
            cache
                .symbols
                .into_iter()
                .map(|symbol| (symbol.key(), symbol))
                .collect(),
        )
    }

    fn write_cache_file(&self, fingerprint: &Fingerprint, symbols: &SymbolMap) {
        if symbols.is_empty() {
            return;
        }
        let cache = CacheFile {
            fingerprint: fingerprint.clone(),
            symbols: symbols.values().cloned().collect(),
        };
        let result = serde_json::to_vec(&cache)
            .map_err(std::io::Error::other)
            .and_then(|bytes| write_atomic(&self.cache_path, &bytes));
        if let Err(e) = result {
            tracing::warn!(path = %self.cache_path.display(), error = %e, "Failed to write symbol cache");
        }
    }
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SOURCE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
