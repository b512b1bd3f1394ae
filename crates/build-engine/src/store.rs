//! Content-addressed dependency store
//!
//! Fetched dependency sources, one entry per `(name, version, ABI)`; pure
//! dependencies use the ABI slot `any`. Entries are addressed by the SHA-256
//! of that triple and laid out as `<root>/<ab>/<abcdef...>/` with the
//! sources in `src/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use walkdir::WalkDir;

use apkforge_core::config::DownloadConfig;
use apkforge_core::error::DependencyError;
use apkforge_core::events::{Event, EventBus};
use apkforge_core::{Abi, FingerprintBuilder, KeyedLocks, Stage};
use apkforge_toolchain::downloader::{extract_archive, flatten_single_root, Downloader};

use crate::recipes::ReleaseSource;

const COMPLETE_MARKER: &str = ".complete";
const ENTRY_FILE: &str = "entry.json";

/// Store address of a dependency
pub fn fingerprint(name: &str, version: &str, abi: Option<Abi>) -> String {
    FingerprintBuilder::new("dependency")
        .field("name", name)
        .field("version", version)
        .field("abi", abi.map(|a| a.abi_name()).unwrap_or("any"))
        .finish()
}

/// Recorded next to every entry's sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub name: String,
    pub version: String,
    pub abi: Option<Abi>,
}

/// Shared store of fetched dependency sources
pub struct DependencyStore {
    root: PathBuf,
    locks: KeyedLocks,
    download: DownloadConfig,
    downloader: OnceCell<Downloader>,
    events: Option<Arc<EventBus>>,
}

impl DependencyStore {
    pub fn new(root: impl Into<PathBuf>, download: DownloadConfig) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
            download,
            downloader: OnceCell::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of an entry, whether or not it exists
    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        let prefix = &fingerprint[..2.min(fingerprint.len())];
        self.root.join(prefix).join(fingerprint)
    }

    /// Source directory of a complete entry
    pub fn source_dir(&self, fingerprint: &str) -> PathBuf {
        self.entry_dir(fingerprint).join("src")
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entry_dir(fingerprint).join(COMPLETE_MARKER).is_file()
    }

    /// Make sure an entry exists, fetching it if needed; returns its fingerprint
    pub async fn ensure(
        &self,
        entry: &StoreEntry,
        source: &ReleaseSource,
    ) -> Result<String, DependencyError> {
        let fp = fingerprint(&entry.name, &entry.version, entry.abi);
        if self.contains(&fp) {
            self.emit(Event::CacheHit {
                stage: Stage::Dependencies,
                key: format!("{}=={}", entry.name, entry.version),
            });
            return Ok(fp);
        }

        let _guard = self.locks.lock(&fp).await;
        if self.contains(&fp) {
            return Ok(fp);
        }

        self.emit(Event::DependencyFetch {
            name: entry.name.clone(),
            version: entry.version.clone(),
        });
        let fetch_err = |message: String| DependencyError::Fetch {
            name: entry.name.clone(),
            version: entry.version.clone(),
            message,
        };

        // Per-fetch staging dir; other processes may share the store
        let staging_root = self.root.join(".staging");
        tokio::fs::create_dir_all(&staging_root)
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}.", short(&fp)))
            .tempdir_in(&staging_root)
            .map_err(|e| fetch_err(e.to_string()))?;

        let result = match self.fetch_into(source, staging.path()).await {
            Ok(()) => self.commit(entry, staging.path(), &fp).await,
            Err(e) => Err(e),
        };
        result.map_err(fetch_err)?;

        info!("Stored {} {} ({})", entry.name, entry.version, short(&fp));
        Ok(fp)
    }

    async fn fetch_into(&self, source: &ReleaseSource, staging: &Path) -> Result<(), String> {
        let src = staging.join("src");
        match source {
            ReleaseSource::Path(path) if path.is_dir() => {
                let (from, to) = (path.clone(), src.clone());
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| e.to_string())?
                    .map_err(|e| format!("cannot copy {:?}: {}", path, e))?;
            }
            ReleaseSource::Path(path) if path.is_file() => {
                extract_archive(path, &src).await.map_err(|e| e.to_string())?;
                flatten_single_root(&src).await.map_err(|e| e.to_string())?;
            }
            ReleaseSource::Path(path) => return Err(format!("{:?} does not exist", path)),
            ReleaseSource::Url { url, sha256 } => {
                let downloader = self
                    .downloader
                    .get_or_try_init(|| async {
                        Downloader::new(
                            self.download.retry_count,
                            Duration::from_secs(self.download.timeout_secs),
                        )
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                let file_name = url.rsplit('/').next().unwrap_or("source.tar.gz");
                let archive = staging.join(file_name);
                debug!("Fetching {}", url);
                downloader
                    .download(url, &archive, sha256.as_deref())
                    .await
                    .map_err(|e| format!("{}: {}", url, e))?;
                extract_archive(&archive, &src).await.map_err(|e| e.to_string())?;
                tokio::fs::remove_file(&archive).await.ok();
                flatten_single_root(&src).await.map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    async fn commit(&self, entry: &StoreEntry, staging: &Path, fp: &str) -> Result<(), String> {
        let meta = serde_json::to_vec_pretty(entry).map_err(|e| e.to_string())?;
        let io = |e: std::io::Error| e.to_string();
        tokio::fs::write(staging.join(ENTRY_FILE), meta).await.map_err(io)?;
        tokio::fs::write(staging.join(COMPLETE_MARKER), fp).await.map_err(io)?;

        let dir = self.entry_dir(fp);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        if tokio::fs::rename(staging, &dir).await.is_ok() || self.contains(fp) {
            return Ok(());
        }
        // Leftover of an interrupted fetch
        tokio::fs::remove_dir_all(&dir).await.map_err(io)?;
        tokio::fs::rename(staging, &dir).await.map_err(io)
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

fn short(fp: &str) -> &str {
    &fp[..12.min(fp.len())]
}

/// Recursively copy `from` into `to`, in a stable order
pub(crate) fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
