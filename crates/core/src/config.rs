//! Pipeline Configuration
//!
//! Settings that are not part of an application's manifest:
//! - Cache and working directory locations
//! - Parallelism and reproducibility switches
//! - Per-stage wall-clock budgets
//! - Toolchain download policy
//! - Signing key location

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BuildError, Result, Stage};

/// Environment variable overriding the data root
pub const HOME_ENV: &str = "APKFORGE_HOME";

/// Directory locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data root; `APKFORGE_HOME` takes precedence
    pub home: Option<PathBuf>,
    /// Artifact output directory (default: `<manifest dir>/bin`)
    pub output_dir: Option<PathBuf>,
    /// Recipe directory (default: `<home>/recipes`)
    pub recipes: Option<PathBuf>,
}

/// Build behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Bounded worker pool size for fetches and per-ABI compiles
    pub parallel_jobs: usize,
    /// Fix every embedded timestamp so identical inputs give identical bytes
    pub reproducible: bool,
    /// Resolve version conflicts by keeping the manifest's own constraint
    pub relax_conflicts: bool,
    /// Look for SDK/NDK installs outside the toolchain cache
    pub detect_local_toolchains: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            parallel_jobs: num_cpus::get(),
            reproducible: false,
            relax_conflicts: false,
            detect_local_toolchains: true,
        }
    }
}

/// Wall-clock budget per stage, in seconds; 0 disables the budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageBudgets {
    pub manifest: u64,
    pub toolchain: u64,
    pub dependencies: u64,
    pub compile: u64,
    pub assembly: u64,
    pub packaging: u64,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            manifest: 30,
            toolchain: 3600,
            dependencies: 1800,
            compile: 7200,
            assembly: 600,
            packaging: 600,
        }
    }
}

impl StageBudgets {
    /// Budget for a stage, `None` when unlimited
    pub fn budget(&self, stage: Stage) -> Option<Duration> {
        let secs = match stage {
            Stage::Manifest => self.manifest,
            Stage::Toolchain => self.toolchain,
            Stage::Dependencies => self.dependencies,
            Stage::Compile => self.compile,
            Stage::Assembly => self.assembly,
            Stage::Packaging => self.packaging,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// Toolchain download policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Attempts after the first one for transient network failures
    pub retry_count: u32,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// NDK archive URL; `{version}` and `{host}` are substituted
    pub ndk_url: String,
    /// SDK platform archive URL; `{version}` is substituted
    pub platform_url: String,
    /// Expected SHA-256 per archive URL
    pub checksums: BTreeMap<String, String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            timeout_secs: 600,
            ndk_url: "https://dl.google.com/android/repository/android-ndk-{version}-{host}.zip"
                .to_string(),
            platform_url: "https://dl.google.com/android/repository/platform-{version}_r01.zip"
                .to_string(),
            checksums: BTreeMap::new(),
        }
    }
}

/// Release signing key location; passwords only ever come from the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    pub keystore: Option<PathBuf>,
    pub key_alias: Option<String>,
}

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub build: BuildSettings,
    pub budgets: StageBudgets,
    pub download: DownloadConfig,
    pub signing: SigningSettings,
    #[serde(skip)]
    pinned_home: Option<PathBuf>,
}

impl PipelineConfig {
    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("org", "apkforge", "apkforge")
    }

    /// Default configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// Load configuration from an explicit file, else the default location, else defaults
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(BuildError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => Self::config_file().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                debug!("Loading config from {:?}", path);
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| BuildError::Config(format!("{}: {}", path.display(), e)))?;
                Self::from_toml_str(&contents)
            }
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Data root: `APKFORGE_HOME`, then `paths.home`, then the platform data dir
    pub fn home(&self) -> PathBuf {
        if let Some(home) = &self.pinned_home {
            return home.clone();
        }
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(home);
        }
        if let Some(home) = &self.paths.home {
            return home.clone();
        }
        Self::project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".apkforge"))
    }

    /// Pin the data root, ignoring the environment
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.pinned_home = Some(home.into());
        self
    }

    pub fn toolchains_dir(&self) -> PathBuf {
        self.home().join("toolchains")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.home().join("store")
    }

    pub fn build_cache_dir(&self) -> PathBuf {
        self.home().join("build-cache")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.home().join("work")
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.paths
            .recipes
            .clone()
            .unwrap_or_else(|| self.home().join("recipes"))
    }

    /// Artifact output directory for a manifest located at `manifest_path`
    pub fn output_dir(&self, manifest_path: &Path) -> PathBuf {
        if let Some(dir) = &self.paths.output_dir {
            return dir.clone();
        }
        manifest_path
            .parent()
            .map(|p| p.join("bin"))
            .unwrap_or_else(|| PathBuf::from("bin"))
    }

    /// Worker pool size, never zero
    pub fn parallel_jobs(&self) -> usize {
        self.build.parallel_jobs.max(1)
    }
}
