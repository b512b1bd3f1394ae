//! Build cache
//!
//! Compiled native libraries per ABI, keyed by everything that influences
//! them. An entry holds `lib/*.so` plus the serialized key; it is only reused
//! when the stored key equals the requested one exactly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use apkforge_core::fingerprint::sha256_hex;
use apkforge_core::{Abi, FingerprintBuilder, KeyedLocks};
use apkforge_manifest::BuildManifest;

use crate::bundler::{DependencyEntry, DependencySet};
use crate::store::copy_tree;

const KEY_FILE: &str = "key.json";

/// Manifest fields that influence compiled output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestKey {
    pub package_id: String,
    pub min_api: u32,
    pub target_api: u32,
    pub ndk_api: u32,
}

impl From<&BuildManifest> for ManifestKey {
    fn from(manifest: &BuildManifest) -> Self {
        let platform = manifest.platform();
        Self {
            package_id: manifest.package_id(),
            min_api: platform.min_api,
            target_api: platform.target_api,
            ndk_api: platform.ndk_api,
        }
    }
}

/// A native dependency as it enters a cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyKey {
    pub name: String,
    pub version: String,
    /// Store fingerprint of the sources
    pub source: String,
    /// SHA-256 of the build script
    pub script: String,
}

impl From<&DependencyEntry> for DependencyKey {
    fn from(entry: &DependencyEntry) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.to_string(),
            source: entry.fingerprint.clone(),
            script: sha256_hex(entry.script.as_deref().unwrap_or_default().as_bytes()),
        }
    }
}

/// Everything a compiled ABI depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCacheKey {
    pub manifest: ManifestKey,
    pub toolchain: String,
    pub abi: Abi,
    pub dependencies: Vec<DependencyKey>,
}

impl BuildCacheKey {
    pub fn new(manifest: &ManifestKey, toolchain: &str, abi: Abi, deps: &DependencySet) -> Self {
        Self {
            manifest: manifest.clone(),
            toolchain: toolchain.to_string(),
            abi,
            dependencies: deps.native_for(abi).map(DependencyKey::from).collect(),
        }
    }

    pub fn fingerprint(&self) -> String {
        let deps = self
            .dependencies
            .iter()
            .map(|d| format!("{}=={}@{}+{}", d.name, d.version, d.source, d.script))
            .collect::<Vec<_>>()
            .join(",");
        FingerprintBuilder::new("build-cache")
            .field("package", &self.manifest.package_id)
            .field("min_api", self.manifest.min_api.to_string())
            .field("target_api", self.manifest.target_api.to_string())
            .field("ndk_api", self.manifest.ndk_api.to_string())
            .field("toolchain", &self.toolchain)
            .field("abi", self.abi.abi_name())
            .field("dependencies", deps)
            .finish()
    }
}

/// Shared on-disk cache of compiled ABIs
pub struct BuildCache {
    root: PathBuf,
    locks: KeyedLocks,
}

impl BuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        let prefix = &fingerprint[..2.min(fingerprint.len())];
        self.root.join(prefix).join(fingerprint)
    }

    /// Library directory of a valid entry for `key`
    pub async fn lookup(&self, key: &BuildCacheKey) -> Option<PathBuf> {
        let dir = self.entry_dir(&key.fingerprint());
        let stored = tokio::fs::read(dir.join(KEY_FILE)).await.ok()?;
        match serde_json::from_slice::<BuildCacheKey>(&stored) {
            Ok(stored) if stored == *key => Some(dir.join("lib")),
            Ok(_) => {
                warn!("Build cache entry {:?} has a different key, ignoring it", dir);
                None
            }
            Err(e) => {
                warn!("Unreadable build cache key in {:?}: {}", dir, e);
                None
            }
        }
    }

    /// Store the libraries in `lib_dir` under `key`; returns the cached lib dir.
    ///
    /// A valid entry is never replaced, so concurrent writers of one key
    /// (also from other processes) all end up with the first entry.
    pub async fn store(&self, key: &BuildCacheKey, lib_dir: &Path) -> std::io::Result<PathBuf> {
        let fp = key.fingerprint();
        let _guard = self.locks.lock(&fp).await;
        if let Some(existing) = self.lookup(key).await {
            return Ok(existing);
        }

        let staging_root = self.root.join(".staging");
        tokio::fs::create_dir_all(&staging_root).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}.", &fp[..16]))
            .tempdir_in(&staging_root)?;
        let target_lib = staging.path().join("lib");
        tokio::fs::create_dir_all(&target_lib).await?;
        if lib_dir.is_dir() {
            let (from, to) = (lib_dir.to_path_buf(), target_lib.clone());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(std::io::Error::other)??;
        }
        let key_json = serde_json::to_vec_pretty(key).map_err(std::io::Error::other)?;
        tokio::fs::write(staging.path().join(KEY_FILE), key_json).await?;

        let dir = self.entry_dir(&fp);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(staging.path(), &dir).await.is_err() {
            if let Some(existing) = self.lookup(key).await {
                debug!("{} build was cached concurrently", key.abi);
                return Ok(existing);
            }
            // Stale entry with another key or no key file
            tokio::fs::remove_dir_all(&dir).await?;
            tokio::fs::rename(staging.path(), &dir).await?;
        }
        debug!("Cached {} build as {}", key.abi, &fp[..12]);
        Ok(dir.join("lib"))
    }
}
