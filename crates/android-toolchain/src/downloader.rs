//! Toolchain Downloader
//!
//! Downloads and extracts SDK platform and NDK archives. Partial downloads are
//! kept as `<file>.part` and resumed with a `Range` request on the next try.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use apkforge_core::error::ToolchainError;
use apkforge_core::fingerprint::sha256_file;

/// Download error types
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found (HTTP 404)")]
    NotFound,
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl DownloadError {
    fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::InvalidResponse(_) => true,
            _ => false,
        }
    }

    /// Map onto the pipeline error for a fetch of `url` into `path`
    pub fn into_toolchain_error(self, url: &str, path: &Path) -> ToolchainError {
        match self {
            DownloadError::Network(e) => ToolchainError::Network {
                url: url.to_string(),
                message: e.to_string(),
            },
            DownloadError::InvalidResponse(message) => ToolchainError::Network {
                url: url.to_string(),
                message,
            },
            DownloadError::NotFound => ToolchainError::VersionNotFound {
                component: "archive".to_string(),
                version: url.to_string(),
                detail: "HTTP 404".to_string(),
            },
            DownloadError::ChecksumMismatch { expected, actual } => ToolchainError::Checksum {
                path: path.to_path_buf(),
                expected,
                actual,
            },
            DownloadError::Extraction(message) => ToolchainError::Extraction(message),
            DownloadError::Io(e) => ToolchainError::Io(e.to_string()),
        }
    }
}

/// Archive downloader with retries
pub struct Downloader {
    client: Client,
    retry_count: u32,
}

impl Downloader {
    /// Create a new downloader
    pub fn new(retry_count: u32, timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("apkforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            retry_count,
        })
    }

    /// Download `url` to `target`, retrying transient failures with backoff.
    ///
    /// When `expected_sha256` is given the finished file is verified and
    /// removed on mismatch.
    pub async fn download(
        &self,
        url: &str,
        target: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<(), DownloadError> {
        let mut attempt = 0;
        loop {
            match self.download_once(url, target).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.retry_count => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    warn!(
                        "Download of {} failed ({}), retry {}/{} in {:?}",
                        url, e, attempt, self.retry_count, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(expected) = expected_sha256 {
            let path = target.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|e| DownloadError::Io(std::io::Error::other(e.to_string())))??;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!("Checksum mismatch for {:?}", target);
                tokio::fs::remove_file(target).await.ok();
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("Checksum verified for {:?}", target);
        }

        Ok(())
    }

    async fn download_once(&self, url: &str, target: &Path) -> Result<(), DownloadError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = part_path(target);
        let resume_from = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if resume_from > 0 {
            debug!("Resuming {} from byte {}", url, resume_from);
            request = request.header(header::RANGE, format!("bytes={}-", resume_from));
        }
        let response = request.send().await?;

        let mut file = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&partial)
                    .await?
            }
            StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
                // The partial file already holds the whole body.
                tokio::fs::rename(&partial, target).await?;
                return Ok(());
            }
            StatusCode::NOT_FOUND => return Err(DownloadError::NotFound),
            status if status.is_success() => tokio::fs::File::create(&partial).await?,
            status => {
                return Err(DownloadError::InvalidResponse(format!("HTTP {}", status)));
            }
        };

        info!("Downloading {} to {:?}", url, target);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, target).await?;
        info!("Download complete: {:?}", target);
        Ok(())
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Extract a `.zip` or `.tar.gz` archive into `target_dir`
pub async fn extract_archive(archive: &Path, target_dir: &Path) -> Result<(), DownloadError> {
    info!("Extracting {:?} to {:?}", archive, target_dir);
    let archive = archive.to_path_buf();
    let target_dir = target_dir.to_path_buf();

    // zip and tar are synchronous
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&target_dir)?;
        let name = archive.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            extract_tar_gz(&archive, &target_dir)
        } else {
            extract_zip(&archive, &target_dir)
        }
    })
    .await
    .map_err(|e| DownloadError::Extraction(e.to_string()))?
}

fn extract_zip(archive: &Path, target_dir: &Path) -> Result<(), DownloadError> {
    let file = std::fs::File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| DownloadError::Extraction(e.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| DownloadError::Extraction(e.to_string()))?;

        // Skip entries that would escape the target directory
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let outpath = target_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;

        // Set permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode)).ok();
            }
        }
    }

    Ok(())
}

fn extract_tar_gz(archive: &Path, target_dir: &Path) -> Result<(), DownloadError> {
    let file = std::fs::File::open(archive)?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);
    tar.unpack(target_dir)
        .map_err(|e| DownloadError::Extraction(e.to_string()))
}

/// Archives usually wrap everything in one top-level directory
/// (`android-ndk-r25b/`); hoist its contents into `dir`.
pub async fn flatten_single_root(dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    let [only] = children.as_slice() else {
        return Ok(());
    };
    if !tokio::fs::metadata(only).await?.is_dir() {
        return Ok(());
    }

    let mut inner = tokio::fs::read_dir(only).await?;
    while let Some(entry) = inner.next_entry().await? {
        tokio::fs::rename(entry.path(), dir.join(entry.file_name())).await?;
    }
    tokio::fs::remove_dir(only).await
}
