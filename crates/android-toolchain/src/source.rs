//! Where toolchain components come from when they are not cached or installed

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use apkforge_core::config::DownloadConfig;
use apkforge_core::error::ToolchainError;

use crate::detector::ToolchainDetector;
use crate::downloader::{extract_archive, flatten_single_root, Downloader};
use crate::ndk::{host_tag, NdkVersion};

/// Toolchain component kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// An SDK platform (`platforms/android-<v>`)
    Sdk,
    Ndk,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sdk => "sdk",
            Component::Ndk => "ndk",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetches one toolchain component into a fresh directory.
///
/// On success `dest` must be laid out like an installed component: an SDK
/// root containing `platforms/android-<version>/`, or an NDK root containing
/// `source.properties`.
#[async_trait]
pub trait ToolchainSource: Send + Sync {
    async fn fetch(
        &self,
        component: Component,
        version: &str,
        dest: &Path,
    ) -> Result<(), ToolchainError>;
}

/// Downloads official archives from URL templates
pub struct HttpToolchainSource {
    downloader: Downloader,
    config: DownloadConfig,
}

impl HttpToolchainSource {
    pub fn new(config: DownloadConfig) -> Result<Self, ToolchainError> {
        let downloader = Downloader::new(config.retry_count, Duration::from_secs(config.timeout_secs))
            .map_err(|e| ToolchainError::Io(e.to_string()))?;
        Ok(Self { downloader, config })
    }

    /// Archive URL for a component version
    pub fn archive_url(&self, component: Component, version: &str) -> Result<String, ToolchainError> {
        let url = match component {
            Component::Sdk => self.config.platform_url.replace("{version}", version),
            Component::Ndk => {
                let ndk: NdkVersion = version.parse()?;
                // Archive names use the bare OS (`linux`, `darwin`, `windows`)
                let host = host_tag().split('-').next().unwrap_or("linux");
                self.config
                    .ndk_url
                    .replace("{version}", &ndk.release_name())
                    .replace("{host}", host)
            }
        };
        Ok(url)
    }
}

#[async_trait]
impl ToolchainSource for HttpToolchainSource {
    async fn fetch(
        &self,
        component: Component,
        version: &str,
        dest: &Path,
    ) -> Result<(), ToolchainError> {
        let url = self.archive_url(component, version)?;
        let file_name = url.rsplit('/').next().unwrap_or("archive.zip");
        let archive = dest.with_file_name(format!(
            "{}.{}",
            dest.file_name().and_then(|n| n.to_str()).unwrap_or("download"),
            file_name
        ));
        let expected = self.config.checksums.get(&url).map(String::as_str);

        self.downloader
            .download(&url, &archive, expected)
            .await
            .map_err(|e| match e.into_toolchain_error(&url, &archive) {
                ToolchainError::VersionNotFound { detail, .. } => ToolchainError::VersionNotFound {
                    component: component.to_string(),
                    version: version.to_string(),
                    detail: format!("{} ({})", url, detail),
                },
                other => other,
            })?;

        let unpack_into = match component {
            Component::Sdk => ToolchainDetector::platform_dir(dest, version),
            Component::Ndk => dest.to_path_buf(),
        };
        let unpacked = extract_archive(&archive, &unpack_into).await;
        tokio::fs::remove_file(&archive).await.ok();
        unpacked.map_err(|e| e.into_toolchain_error(&url, &archive))?;
        flatten_single_root(&unpack_into).await?;

        info!("Fetched {} {} into {:?}", component, version, dest);
        Ok(())
    }
}
