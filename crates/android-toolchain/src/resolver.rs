//! Toolchain resolution and cache
//!
//! Components live under `<toolchains>/sdk/<version>/` and
//! `<toolchains>/ndk/<version>/`. A directory is only used once it holds a
//! `.complete` marker; fetches go to `.staging/` first and are renamed into
//! place, so readers never see a half-written toolchain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use apkforge_core::error::ToolchainError;
use apkforge_core::events::{Event, EventBus};
use apkforge_core::{KeyedLocks, Stage};

use crate::detector::ToolchainDetector;
use crate::handle::{handle_key, ToolchainHandle};
use crate::ndk::{host_tag, NdkVersion};
use crate::source::{Component, ToolchainSource};

/// Marker written once a component directory is complete
pub const COMPLETE_MARKER: &str = ".complete";

/// What a build needs from the toolchain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolchainRequest {
    /// SDK platform version, e.g. `33`
    pub sdk_version: String,
    /// NDK release, e.g. `25b`
    pub ndk_version: String,
    /// Target API level
    pub api_level: u32,
    /// API level native code is compiled against
    pub ndk_api: u32,
}

/// Resolved handles by cache key
#[derive(Default)]
pub struct ToolchainCache {
    handles: Mutex<HashMap<String, Arc<ToolchainHandle>>>,
}

impl ToolchainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<ToolchainHandle>> {
        self.handles.lock().get(key).cloned()
    }

    /// Insert `handle` unless one is already cached; returns the cached one
    pub fn insert(&self, handle: ToolchainHandle) -> Arc<ToolchainHandle> {
        self.handles
            .lock()
            .entry(handle.cache_key())
            .or_insert_with(|| Arc::new(handle))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check a request against the SDK and NDK compatibility rules
pub fn check_compatibility(request: &ToolchainRequest) -> Result<NdkVersion, ToolchainError> {
    let sdk: u32 = request.sdk_version.trim().parse().map_err(|_| {
        ToolchainError::Incompatible(format!(
            "SDK platform version '{}' is not an API level",
            request.sdk_version
        ))
    })?;
    if sdk < request.api_level {
        return Err(ToolchainError::Incompatible(format!(
            "SDK platform {} cannot target API level {}",
            sdk, request.api_level
        )));
    }
    if request.ndk_api > request.api_level {
        return Err(ToolchainError::Incompatible(format!(
            "NDK API level {} is above target API level {}",
            request.ndk_api, request.api_level
        )));
    }

    let ndk: NdkVersion = request.ndk_version.parse()?;
    let range = ndk.supported_api_range().ok_or_else(|| {
        ToolchainError::Incompatible(format!("NDK {} is not a supported release", ndk))
    })?;
    if !range.contains(&request.ndk_api) {
        return Err(ToolchainError::Incompatible(format!(
            "NDK {} supports API levels {}-{}, requested {}",
            ndk,
            range.start(),
            range.end(),
            request.ndk_api
        )));
    }
    Ok(ndk)
}

/// Resolves toolchain requests to shared handles, fetching what is missing
pub struct ToolchainResolver {
    root: PathBuf,
    source: Arc<dyn ToolchainSource>,
    cache: ToolchainCache,
    locks: KeyedLocks,
    detect_local: bool,
    events: Option<Arc<EventBus>>,
}

impl ToolchainResolver {
    pub fn new(root: impl Into<PathBuf>, source: Arc<dyn ToolchainSource>) -> Self {
        Self {
            root: root.into(),
            source,
            cache: ToolchainCache::new(),
            locks: KeyedLocks::new(),
            detect_local: false,
            events: None,
        }
    }

    /// Also look for SDK/NDK installs outside the cache
    pub fn with_local_detection(mut self, enabled: bool) -> Self {
        self.detect_local = enabled;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cache(&self) -> &ToolchainCache {
        &self.cache
    }

    /// Resolve a request. Repeated calls for the same versions return the
    /// same handle without touching the filesystem or network again.
    pub async fn resolve(
        &self,
        request: &ToolchainRequest,
    ) -> Result<Arc<ToolchainHandle>, ToolchainError> {
        let ndk = check_compatibility(request)?;
        let sdk_version = request.sdk_version.trim().to_string();
        let key = handle_key(&sdk_version, &ndk.dir_name(), request.ndk_api, request.api_level);

        if let Some(handle) = self.cache.get(&key) {
            debug!("Toolchain {} already resolved", key);
            self.emit(Event::CacheHit {
                stage: Stage::Toolchain,
                key,
            });
            return Ok(handle);
        }

        let sdk_root = self.ensure_component(Component::Sdk, &sdk_version, None).await?;
        let ndk_root = self
            .ensure_component(Component::Ndk, &ndk.dir_name(), Some(&ndk))
            .await?;

        let handle = ToolchainHandle {
            build_tools: ToolchainDetector::latest_build_tools(&sdk_root),
            sdk_root,
            ndk_root,
            sdk_version,
            ndk_version: ndk.dir_name(),
            api_level: request.api_level,
            ndk_api: request.ndk_api,
            host_tag: host_tag().to_string(),
        };
        info!("Resolved toolchain {}", handle.version_key());
        Ok(self.cache.insert(handle))
    }

    /// Cache directory of a component version
    pub fn component_dir(&self, component: Component, version: &str) -> PathBuf {
        self.root.join(component.as_str()).join(version)
    }

    async fn ensure_component(
        &self,
        component: Component,
        version: &str,
        ndk: Option<&NdkVersion>,
    ) -> Result<PathBuf, ToolchainError> {
        let dir = self.component_dir(component, version);
        if is_complete(&dir) {
            return Ok(dir);
        }

        if self.detect_local {
            let local = match (component, ndk) {
                (Component::Ndk, Some(ndk)) => {
                    ToolchainDetector::find_ndk(&ToolchainDetector::ndk_candidates(), ndk)
                }
                _ => ToolchainDetector::find_sdk_platform(
                    &ToolchainDetector::sdk_candidates(),
                    version,
                ),
            };
            if let Some(path) = local {
                return Ok(path);
            }
        }

        let _guard = self.locks.lock(&format!("{}/{}", component, version)).await;
        // Another task may have finished the fetch while we waited
        if is_complete(&dir) {
            return Ok(dir);
        }

        self.emit(Event::ToolchainFetch {
            component: component.to_string(),
            version: version.to_string(),
        });
        info!("Fetching {} {}", component, version);

        // Per-fetch staging dir; resolvers in other processes may share the root
        let staging_root = self.root.join(".staging");
        tokio::fs::create_dir_all(&staging_root).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-{}.", component, version))
            .tempdir_in(&staging_root)?;

        let fetched = match self.source.fetch(component, version, staging.path()).await {
            Ok(()) => verify_component(component, version, ndk, staging.path()),
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            warn!("Fetching {} {} failed: {}", component, version, e);
            return Err(e);
        }

        tokio::fs::write(staging.path().join(COMPLETE_MARKER), version).await?;
        if is_complete(&dir) {
            debug!("{} {} was installed concurrently", component, version);
            return Ok(dir);
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = staging.into_path();
        if tokio::fs::rename(&staged, &dir).await.is_err() {
            if is_complete(&dir) {
                tokio::fs::remove_dir_all(&staged).await.ok();
                return Ok(dir);
            }
            // A leftover directory without marker is an interrupted older fetch
            tokio::fs::remove_dir_all(&dir).await.ok();
            if let Err(e) = tokio::fs::rename(&staged, &dir).await {
                tokio::fs::remove_dir_all(&staged).await.ok();
                if !is_complete(&dir) {
                    return Err(e.into());
                }
            }
        }

        Ok(dir)
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

fn is_complete(dir: &Path) -> bool {
    dir.join(COMPLETE_MARKER).is_file()
}

fn verify_component(
    component: Component,
    version: &str,
    ndk: Option<&NdkVersion>,
    dir: &Path,
) -> Result<(), ToolchainError> {
    let found = match (component, ndk) {
        (Component::Ndk, Some(ndk)) => ToolchainDetector::ndk_revision(dir)
            .map(|rev| ndk.matches_revision(&rev))
            .unwrap_or(false),
        _ => ToolchainDetector::platform_dir(dir, version).is_dir(),
    };
    if found {
        Ok(())
    } else {
        Err(ToolchainError::VersionNotFound {
            component: component.to_string(),
            version: version.to_string(),
            detail: "fetched archive does not contain the requested release".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Lays out a minimal SDK platform / NDK and counts fetches
    #[derive(Default)]
    struct FakeSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ToolchainSource for FakeSource {
        async fn fetch(
            &self,
            component: Component,
            version: &str,
            dest: &Path,
        ) -> Result<(), ToolchainError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            match component {
                Component::Sdk => {
                    let platform = ToolchainDetector::platform_dir(dest, version);
                    tokio::fs::create_dir_all(&platform).await?;
                    tokio::fs::write(platform.join("android.jar"), b"jar").await?;
                }
                Component::Ndk => {
                    let ndk: NdkVersion = version.parse()?;
                    tokio::fs::write(
                        dest.join("source.properties"),
                        format!("Pkg.Revision = {}.{}.0\n", ndk.major, ndk.minor),
                    )
                    .await?;
                }
            }
            Ok(())
        }
    }

    struct MissingSource;

    #[async_trait]
    impl ToolchainSource for MissingSource {
        async fn fetch(&self, c: Component, v: &str, _: &Path) -> Result<(), ToolchainError> {
            Err(ToolchainError::VersionNotFound {
                component: c.to_string(),
                version: v.to_string(),
                detail: "HTTP 404".into(),
            })
        }
    }

    fn request() -> ToolchainRequest {
        ToolchainRequest {
            sdk_version: "33".into(),
            ndk_version: "25b".into(),
            api_level: 33,
            ndk_api: 26,
        }
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let resolver = ToolchainResolver::new(dir.path(), source.clone());

        let first = resolver.resolve(&request()).await.unwrap();
        let second = resolver.resolve(&request()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(first.version_key(), "sdk-33+ndk-25b+api-26");
        assert!(dir.path().join("ndk/25b").join(COMPLETE_MARKER).is_file());
        assert!(dir.path().join("sdk/33/platforms/android-33").is_dir());
    }

    #[tokio::test]
    async fn test_target_api_is_part_of_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let resolver = ToolchainResolver::new(dir.path(), source.clone());

        let low = ToolchainRequest {
            sdk_version: "34".into(),
            api_level: 20,
            ndk_api: 19,
            ..request()
        };
        let high = ToolchainRequest {
            api_level: 34,
            ..low.clone()
        };
        let first = resolver.resolve(&low).await.unwrap();
        let second = resolver.resolve(&high).await.unwrap();

        assert_eq!(first.api_level, 20);
        assert_eq!(second.api_level, 34);
        assert_eq!(first.version_key(), second.version_key());
        assert_eq!(resolver.cache().len(), 2);
        // The installed components are shared
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolvers_sharing_a_root_agree() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let a = ToolchainResolver::new(dir.path(), source.clone());
        let b = ToolchainResolver::new(dir.path(), source.clone());

        let (req_a, req_b) = (request(), request());
        let (first, second) = tokio::join!(a.resolve(&req_a), b.resolve(&req_b));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.sdk_root, second.sdk_root);
        assert!(first.android_jar().is_file());
        assert!(dir.path().join("ndk/25b").join(COMPLETE_MARKER).is_file());
        assert_eq!(std::fs::read_dir(dir.path().join(".staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let resolver = Arc::new(ToolchainResolver::new(dir.path(), source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(&request()).await }));
        }
        let mut resolved = Vec::new();
        for handle in handles {
            resolved.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(resolved.iter().all(|h| Arc::ptr_eq(h, &resolved[0])));
        assert_eq!(resolver.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_cache_is_reused_across_resolvers() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        ToolchainResolver::new(dir.path(), source.clone())
            .resolve(&request())
            .await
            .unwrap();
        ToolchainResolver::new(dir.path(), source.clone())
            .resolve(&request())
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_incompatible_combinations() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ToolchainResolver::new(dir.path(), Arc::new(FakeSource::default()));

        let old_sdk = ToolchainRequest {
            sdk_version: "30".into(),
            ..request()
        };
        let old_ndk = ToolchainRequest {
            ndk_version: "21e".into(),
            ndk_api: 31,
            api_level: 33,
            ..request()
        };
        let unknown = ToolchainRequest {
            ndk_version: "12b".into(),
            ..request()
        };
        for req in [old_sdk, old_ndk, unknown] {
            assert!(matches!(
                resolver.resolve(&req).await,
                Err(ToolchainError::Incompatible(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ToolchainResolver::new(dir.path(), Arc::new(MissingSource));

        let err = resolver.resolve(&request()).await.unwrap_err();
        assert!(matches!(err, ToolchainError::VersionNotFound { .. }));
        assert!(!dir.path().join("sdk/33").exists());
        let staged = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
        assert_eq!(staged, 0);
        assert!(resolver.cache().is_empty());
    }
}
