//! Cross-compile orchestration
//!
//! Builds every native dependency for every target ABI. ABIs whose exact
//! build is cached are reused; the rest run on a bounded pool. Inside one
//! ABI, dependencies build in order into a shared prefix so later ones can
//! link against earlier ones. A failing ABI never stops the others.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use apkforge_core::error::{CompileError, CompileErrorKind};
use apkforge_core::events::{Event, EventBus};
use apkforge_core::{Abi, BuildError, Stage};
use apkforge_toolchain::ToolchainHandle;

use crate::bundler::{DependencyEntry, DependencySet};
use crate::cache::{BuildCache, BuildCacheKey, ManifestKey};
use crate::compiler::{CompileBackend, CompileJob};
use crate::config::SOURCE_DATE_EPOCH;
use crate::store::copy_tree;

/// Compiled libraries of one ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiArtifacts {
    pub abi: Abi,
    /// Cached `lib/` directory
    pub lib_dir: PathBuf,
    /// `.so` files in `lib_dir`, sorted
    pub libraries: Vec<PathBuf>,
    pub from_cache: bool,
}

/// Per-ABI results of the compile stage
#[derive(Debug, Clone, Default)]
pub struct CompileOutcome {
    pub artifacts: BTreeMap<Abi, AbiArtifacts>,
    pub failures: Vec<CompileError>,
}

impl CompileOutcome {
    pub fn succeeded_abis(&self) -> Vec<Abi> {
        self.artifacts.keys().copied().collect()
    }

    /// ABIs with at least one failure
    pub fn failed_abis(&self) -> Vec<String> {
        let mut abis: Vec<String> = self.failures.iter().map(|f| f.abi.clone()).collect();
        abis.dedup();
        abis
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Schedules per-ABI builds through a [`CompileBackend`]
pub struct CrossCompileOrchestrator {
    cache: Arc<BuildCache>,
    backend: Arc<dyn CompileBackend>,
    work_dir: PathBuf,
    jobs: usize,
    source_date_epoch: Option<i64>,
    events: Option<Arc<EventBus>>,
}

struct AbiBuild {
    abi: Abi,
    key: BuildCacheKey,
    entries: Vec<DependencyEntry>,
    toolchain: Arc<ToolchainHandle>,
    backend: Arc<dyn CompileBackend>,
    cache: Arc<BuildCache>,
    work_dir: PathBuf,
    source_date_epoch: Option<i64>,
    events: Option<Arc<EventBus>>,
}

impl CrossCompileOrchestrator {
    pub fn new(
        cache: Arc<BuildCache>,
        backend: Arc<dyn CompileBackend>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            backend,
            work_dir: work_dir.into(),
            jobs: 1,
            source_date_epoch: None,
            events: None,
        }
    }

    /// Number of ABIs built concurrently
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Export `SOURCE_DATE_EPOCH` to build scripts
    pub fn with_source_date_epoch(mut self, epoch: Option<i64>) -> Self {
        self.source_date_epoch = epoch;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Compile `deps` for `abis`.
    ///
    /// Fails only when no ABI succeeded; otherwise failed ABIs are reported
    /// in [`CompileOutcome::failures`].
    pub async fn compile(
        &self,
        deps: &DependencySet,
        toolchain: &Arc<ToolchainHandle>,
        abis: &[Abi],
        manifest: &ManifestKey,
    ) -> Result<CompileOutcome, BuildError> {
        let mut outcome = CompileOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut tasks = JoinSet::new();

        for &abi in abis {
            let key = BuildCacheKey::new(manifest, &toolchain.version_key(), abi, deps);
            if let Some(lib_dir) = self.cache.lookup(&key).await {
                info!("Reusing cached {} build", abi);
                self.emit(Event::CacheHit {
                    stage: Stage::Compile,
                    key: abi.to_string(),
                });
                let libraries = list_libraries(&lib_dir).await;
                outcome.artifacts.insert(
                    abi,
                    AbiArtifacts {
                        abi,
                        lib_dir,
                        libraries,
                        from_cache: true,
                    },
                );
                continue;
            }

            let build = AbiBuild {
                abi,
                key,
                entries: deps.native_for(abi).cloned().collect(),
                toolchain: toolchain.clone(),
                backend: self.backend.clone(),
                cache: self.cache.clone(),
                work_dir: self.work_dir.clone(),
                source_date_epoch: self.source_date_epoch,
                events: self.events.clone(),
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => build.run().await,
                    Err(e) => Err(vec![build.failure("scheduler", CompileErrorKind::Io, e.to_string())]),
                };
                (abi, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (abi, result) =
                joined.map_err(|e| BuildError::Internal(format!("compile task failed: {}", e)))?;
            results.insert(abi, result);
        }

        // Report in target order, not completion order
        for abi in abis {
            match results.remove(abi) {
                Some(Ok(lib_dir)) => {
                    let libraries = list_libraries(&lib_dir).await;
                    outcome.artifacts.insert(
                        *abi,
                        AbiArtifacts {
                            abi: *abi,
                            lib_dir,
                            libraries,
                            from_cache: false,
                        },
                    );
                }
                Some(Err(failures)) => {
                    warn!("{} failed with {} error(s)", abi, failures.len());
                    self.emit(Event::AbiFailed {
                        abi: *abi,
                        failures: failures.len(),
                    });
                    outcome.failures.extend(failures);
                }
                None => {}
            }
        }

        if outcome.artifacts.is_empty() && !outcome.failures.is_empty() {
            return Err(BuildError::Compile(outcome.failures));
        }
        Ok(outcome)
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl AbiBuild {
    fn failure(&self, dependency: &str, kind: CompileErrorKind, output: String) -> CompileError {
        CompileError {
            dependency: dependency.to_string(),
            abi: self.abi.to_string(),
            kind,
            output,
        }
    }

    /// Build every dependency of this ABI and cache the result
    async fn run(self) -> Result<PathBuf, Vec<CompileError>> {
        let fp = self.key.fingerprint();
        let io = |dependency: &str, e: std::io::Error| {
            vec![self.failure(dependency, CompileErrorKind::Io, e.to_string())]
        };

        // Private to this invocation and removed on every exit path
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| io("workspace", e))?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}.", self.abi, &fp[..16]))
            .tempdir_in(&self.work_dir)
            .map_err(|e| io("workspace", e))?;
        let work = work_dir.path();
        let prefix = work.join("prefix");
        for dir in ["lib", "include"] {
            tokio::fs::create_dir_all(prefix.join(dir))
                .await
                .map_err(|e| io("workspace", e))?;
        }

        for entry in &self.entries {
            let Some(script) = &entry.script else {
                debug!("{} has no build script, skipping", entry.name);
                continue;
            };
            let build_dir = work.join("build").join(&entry.name);
            let (from, to) = (entry.source_dir.clone(), build_dir.clone());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| io(&entry.name, std::io::Error::other(e)))?
                .map_err(|e| io(&entry.name, e))?;

            let job = CompileJob {
                dependency: entry.name.clone(),
                version: entry.version.to_string(),
                abi: self.abi,
                build_dir,
                prefix: prefix.clone(),
                script: script.clone(),
                env: self.job_env(&prefix),
            };
            if let Some(events) = &self.events {
                events.emit(Event::Compiling {
                    dependency: entry.name.clone(),
                    abi: self.abi,
                });
            }
            self.backend.compile(&job).await.map_err(|e| vec![e])?;
        }

        let cached = self
            .cache
            .store(&self.key, &prefix.join("lib"))
            .await
            .map_err(|e| io("build-cache", e))?;
        drop(work_dir);
        info!("Built {} ({} dependencies)", self.abi, self.entries.len());
        Ok(cached)
    }

    fn job_env(&self, prefix: &Path) -> BTreeMap<String, String> {
        let mut env = self.toolchain.compile_env(self.abi);
        let prefix_str = prefix.to_string_lossy().into_owned();
        env.insert("CFLAGS".to_string(), format!("-fPIC -I{}/include", prefix_str));
        env.insert("CXXFLAGS".to_string(), format!("-fPIC -I{}/include", prefix_str));
        env.insert("LDFLAGS".to_string(), format!("-L{}/lib", prefix_str));
        env.insert("PREFIX".to_string(), prefix_str);
        if let Some(epoch) = self.source_date_epoch {
            env.insert(SOURCE_DATE_EPOCH.to_string(), epoch.to_string());
        }
        env
    }
}

/// Shared libraries directly in `dir`, sorted by name
async fn list_libraries(dir: &Path) -> Vec<PathBuf> {
    let mut libs = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "so").unwrap_or(false) {
                libs.push(path);
            }
        }
    }
    libs.sort();
    libs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::RecipeKind;
    use async_trait::async_trait;
    use semver::Version;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `lib<dep>.so` into the prefix; fails for one ABI
    struct FakeBackend {
        fail_on: Option<Abi>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompileBackend for FakeBackend {
        async fn compile(&self, job: &CompileJob) -> Result<(), CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(job.abi) == self.fail_on {
                return Err(job.error(CompileErrorKind::Link, "ld.lld: error: boom"));
            }
            assert_eq!(job.env["ANDROID_ABI"], job.abi.abi_name());
            let lib = job.prefix.join("lib").join(format!("lib{}.so", job.dependency));
            tokio::fs::write(lib, job.abi.abi_name()).await.unwrap();
            Ok(())
        }
    }

    fn toolchain() -> Arc<ToolchainHandle> {
        Arc::new(ToolchainHandle {
            sdk_root: PathBuf::from("/sdk"),
            ndk_root: PathBuf::from("/ndk"),
            sdk_version: "33".into(),
            ndk_version: "25b".into(),
            api_level: 33,
            ndk_api: 21,
            host_tag: "linux-x86_64".into(),
            build_tools: None,
        })
    }

    fn deps(src: &Path, abis: &[Abi]) -> DependencySet {
        std::fs::create_dir_all(src).unwrap();
        DependencySet::new(
            abis.iter()
                .map(|abi| DependencyEntry {
                    name: "libffi".into(),
                    version: Version::new(3, 4, 4),
                    abi: Some(*abi),
                    kind: RecipeKind::Native,
                    fingerprint: format!("fp-{}", abi),
                    source_dir: src.to_path_buf(),
                    script: Some("true".into()),
                })
                .collect(),
        )
    }

    fn manifest_key() -> ManifestKey {
        ManifestKey {
            package_id: "org.example.app".into(),
            min_api: 26,
            target_api: 33,
            ndk_api: 21,
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_abis() {
        let dir = tempfile::tempdir().unwrap();
        let abis = [Abi::ArmeabiV7a, Abi::Arm64V8a];
        let backend = Arc::new(FakeBackend {
            fail_on: Some(Abi::ArmeabiV7a),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = CrossCompileOrchestrator::new(
            Arc::new(BuildCache::new(dir.path().join("cache"))),
            backend,
            dir.path().join("work"),
        )
        .with_jobs(2);

        let outcome = orchestrator
            .compile(&deps(&dir.path().join("src"), &abis), &toolchain(), &abis, &manifest_key())
            .await
            .unwrap();

        assert_eq!(outcome.succeeded_abis(), vec![Abi::Arm64V8a]);
        assert_eq!(outcome.failed_abis(), vec!["armeabi-v7a".to_string()]);
        assert_eq!(outcome.failures[0].output, "ld.lld: error: boom");
        let arm64 = &outcome.artifacts[&Abi::Arm64V8a];
        assert_eq!(arm64.libraries.len(), 1);
        assert!(arm64.libraries[0].ends_with("liblibffi.so"));
    }

    #[tokio::test]
    async fn test_work_dirs_are_removed_after_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let abis = [Abi::ArmeabiV7a, Abi::Arm64V8a];
        let backend = Arc::new(FakeBackend {
            fail_on: Some(Abi::ArmeabiV7a),
            calls: AtomicUsize::new(0),
        });
        let work = dir.path().join("work");
        let orchestrator = CrossCompileOrchestrator::new(
            Arc::new(BuildCache::new(dir.path().join("cache"))),
            backend,
            &work,
        );

        orchestrator
            .compile(&deps(&dir.path().join("src"), &abis), &toolchain(), &abis, &manifest_key())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_compiles_of_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BuildCache::new(dir.path().join("cache")));
        let abis = [Abi::Arm64V8a, Abi::X86_64];
        let src = dir.path().join("src");
        let set = deps(&src, &abis);

        let make = || {
            CrossCompileOrchestrator::new(
                cache.clone(),
                Arc::new(FakeBackend {
                    fail_on: None,
                    calls: AtomicUsize::new(0),
                }),
                dir.path().join("work"),
            )
            .with_jobs(2)
        };
        let (a, b) = (make(), make());
        let (tc_a, tc_b) = (toolchain(), toolchain());
        let (key_a, key_b) = (manifest_key(), manifest_key());
        let (first, second) = tokio::join!(
            a.compile(&set, &tc_a, &abis, &key_a),
            b.compile(&set, &tc_b, &abis, &key_b)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(!first.is_partial() && !second.is_partial());
        for abi in abis {
            assert_eq!(first.artifacts[&abi].lib_dir, second.artifacts[&abi].lib_dir);
            assert_eq!(second.artifacts[&abi].libraries.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_all_failed_is_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend {
            fail_on: Some(Abi::X86),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = CrossCompileOrchestrator::new(
            Arc::new(BuildCache::new(dir.path().join("cache"))),
            backend,
            dir.path().join("work"),
        );

        let err = orchestrator
            .compile(
                &deps(&dir.path().join("src"), &[Abi::X86]),
                &toolchain(),
                &[Abi::X86],
                &manifest_key(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Compile(ref f) if f.len() == 1));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_cached_abis_are_not_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BuildCache::new(dir.path().join("cache")));
        let backend = Arc::new(FakeBackend {
            fail_on: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator =
            CrossCompileOrchestrator::new(cache, backend.clone(), dir.path().join("work"));
        let src = dir.path().join("src");

        orchestrator
            .compile(&deps(&src, &[Abi::Arm64V8a]), &toolchain(), &[Abi::Arm64V8a], &manifest_key())
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Adding an ABI compiles only the new one
        let abis = [Abi::Arm64V8a, Abi::X86_64];
        let outcome = orchestrator
            .compile(&deps(&src, &abis), &toolchain(), &abis, &manifest_key())
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(outcome.artifacts[&Abi::Arm64V8a].from_cache);
        assert!(!outcome.artifacts[&Abi::X86_64].from_cache);
    }
}
