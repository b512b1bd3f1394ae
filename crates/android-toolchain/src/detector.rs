//! Toolchain Detection
//!
//! Finds SDK platforms and NDK releases already installed on the machine, so
//! they can be used in place of a download.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::ndk::NdkVersion;

/// Toolchain detector
pub struct ToolchainDetector;

impl ToolchainDetector {
    /// Get SDK path candidates
    pub fn sdk_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        // Environment variable
        for var in ["ANDROID_SDK_ROOT", "ANDROID_HOME"] {
            if let Some(path) = env::var_os(var).filter(|v| !v.is_empty()) {
                candidates.push(PathBuf::from(path));
            }
        }

        // <sdk>/platform-tools/adb
        if let Some(root) = which::which("adb")
            .ok()
            .and_then(|p| p.parent().and_then(Path::parent).map(PathBuf::from))
        {
            candidates.push(root);
        }

        if cfg!(windows) {
            if let Some(local) = dirs::data_local_dir() {
                candidates.push(local.join("Android").join("Sdk"));
            }
            candidates.push(PathBuf::from(r"C:\Android\sdk"));
        }

        if cfg!(unix) {
            if let Some(home) = dirs::home_dir() {
                candidates.push(home.join("Android").join("Sdk"));
                candidates.push(home.join("Library").join("Android").join("sdk"));
                candidates.push(home.join("android-sdk"));
            }
            candidates.push(PathBuf::from("/opt/android-sdk"));
            candidates.push(PathBuf::from("/usr/local/android-sdk"));
        }

        candidates
    }

    /// Get NDK path candidates; versioned installs inside SDKs are expanded
    pub fn ndk_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        for var in ["ANDROID_NDK_HOME", "ANDROID_NDK_ROOT", "NDK_ROOT"] {
            if let Some(path) = env::var_os(var).filter(|v| !v.is_empty()) {
                candidates.push(PathBuf::from(path));
            }
        }

        // ndk-build sits in the NDK root
        if let Some(root) = which::which("ndk-build").ok().and_then(|p| p.parent().map(PathBuf::from)) {
            candidates.push(root);
        }

        for sdk in Self::sdk_candidates() {
            candidates.push(sdk.join("ndk-bundle"));
            if let Ok(entries) = std::fs::read_dir(sdk.join("ndk")) {
                let mut versioned: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
                versioned.sort();
                candidates.extend(versioned);
            }
        }

        candidates
    }

    /// SDK root among `candidates` that has `platforms/android-<version>`
    pub fn find_sdk_platform(candidates: &[PathBuf], version: &str) -> Option<PathBuf> {
        let found = candidates
            .iter()
            .find(|root| Self::platform_dir(root, version).join("android.jar").is_file())
            .cloned();
        match &found {
            Some(root) => info!("Found Android SDK platform {} at {:?}", version, root),
            None => debug!("No local SDK platform {}", version),
        }
        found
    }

    /// NDK root among `candidates` whose revision matches `version`
    pub fn find_ndk(candidates: &[PathBuf], version: &NdkVersion) -> Option<PathBuf> {
        let found = candidates
            .iter()
            .find(|path| {
                Self::ndk_revision(path)
                    .map(|rev| version.matches_revision(&rev))
                    .unwrap_or(false)
            })
            .cloned();
        match &found {
            Some(path) => info!("Found Android NDK {} at {:?}", version, path),
            None => debug!("No local NDK {}", version),
        }
        found
    }

    /// `platforms/android-<version>` below an SDK root
    pub fn platform_dir(sdk_root: &Path, version: &str) -> PathBuf {
        sdk_root.join("platforms").join(format!("android-{}", version))
    }

    /// `Pkg.Revision` from an NDK's `source.properties`
    pub fn ndk_revision(ndk_root: &Path) -> Option<String> {
        let content = std::fs::read_to_string(ndk_root.join("source.properties")).ok()?;
        content.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == "Pkg.Revision").then(|| value.trim().to_string())
        })
    }

    /// Newest `build-tools/<version>` directory of an SDK
    pub fn latest_build_tools(sdk_root: &Path) -> Option<PathBuf> {
        let entries = std::fs::read_dir(sdk_root.join("build-tools")).ok()?;
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .max_by_key(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| {
                        n.split('.')
                            .map(|part| part.parse::<u32>().unwrap_or(0))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
    }
}
