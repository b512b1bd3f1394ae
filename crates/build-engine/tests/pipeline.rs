//! End-to-end pipeline runs against a fake toolchain source and compile
//! backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use apkforge_build_engine::{
    ArtifactInspector, ArtifactSigner, BuildOptions, BuildRunner, BuildVariant, CompileBackend,
    CompileJob, CredentialProvider, NoCredentials, Recipe, RecipeBook, ResourceLinker,
    SigningCredentials,
};
use apkforge_core::error::{CompileError, CompileErrorKind, PackagingError, ToolchainError};
use apkforge_manifest::ArtifactType;
use apkforge_core::{Abi, BuildError, Event, PipelineConfig, Stage};
use apkforge_toolchain::{
    Component, NdkVersion, ToolchainDetector, ToolchainHandle, ToolchainResolver, ToolchainSource,
};

const MANIFEST: &str = r#"
[app]
title = Example App
package.name = app
package.domain = org.example
version = 1.2.0
source.dir = src
source.include_exts = py
requirements = runtimeA
android.permissions = INTERNET
android.api = 33
android.minapi = 26
android.archs = armeabi-v7a, arm64-v8a
android.debug_artifact = apk
"#;

const RECIPE: &str = r#"
name = "runtimeA"
kind = "native"
script = "make install"

[[release]]
version = "1.0.0"
path = "runtime-src"
"#;

#[derive(Default)]
struct FakeSource {
    fetches: AtomicUsize,
}

#[async_trait]
impl ToolchainSource for FakeSource {
    async fn fetch(&self, component: Component, version: &str, dest: &Path) -> Result<(), ToolchainError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
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

/// Installs `lib<dependency>.so` into the prefix, failing for selected ABIs
#[derive(Default)]
struct FakeBackend {
    fail: Vec<Abi>,
    calls: AtomicUsize,
}

#[async_trait]
impl CompileBackend for FakeBackend {
    async fn compile(&self, job: &CompileJob) -> Result<(), CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.contains(&job.abi) {
            return Err(job.error(
                CompileErrorKind::UnsupportedSource,
                "runtime.c:12: error: unknown type name '__int128'",
            ));
        }
        let lib = job.prefix.join("lib").join(format!("lib{}.so", job.dependency));
        let body = format!("{}:{}", job.abi, job.env["ANDROID_API"]);
        tokio::fs::write(lib, body)
            .await
            .map_err(|e| job.error(CompileErrorKind::Io, e.to_string()))
    }
}

/// Keeps the text manifest readable and adds an empty resource table
struct TableLinker;

#[async_trait]
impl ResourceLinker for TableLinker {
    async fn link(
        &self,
        root: &Path,
        artifact: ArtifactType,
        _toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError> {
        let table = match artifact {
            ArtifactType::Apk => "resources.arsc",
            ArtifactType::Aab => "resources.pb",
        };
        tokio::fs::write(root.join(table), b"").await?;
        Ok(())
    }
}

struct CopySigner;

#[async_trait]
impl ArtifactSigner for CopySigner {
    async fn sign(
        &self,
        input: &Path,
        output: &Path,
        _credentials: &SigningCredentials,
        _artifact: ArtifactType,
        _toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

struct DebugKey;

impl CredentialProvider for DebugKey {
    fn credentials(&self, _variant: BuildVariant) -> Result<Option<SigningCredentials>, PackagingError> {
        Ok(Some(SigningCredentials::debug(PathBuf::from("debug.keystore"))))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    manifest: PathBuf,
    home: PathBuf,
    recipes: Arc<RecipeBook>,
}

fn fixture(manifest: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(project.join("src/main.py"), "print('hello')\n").unwrap();
    std::fs::write(project.join("app.spec"), manifest).unwrap();

    let recipes_dir = dir.path().join("recipes");
    std::fs::create_dir_all(recipes_dir.join("runtime-src")).unwrap();
    std::fs::write(recipes_dir.join("runtime-src/Makefile"), "install:\n").unwrap();
    let mut book = RecipeBook::new();
    book.insert(Recipe::parse(RECIPE, &recipes_dir).unwrap());

    Fixture {
        manifest: project.join("app.spec"),
        home: dir.path().join("home"),
        recipes: Arc::new(book),
        _dir: dir,
    }
}

fn runner(fx: &Fixture, backend: Arc<FakeBackend>) -> BuildRunner {
    let mut config = PipelineConfig::default().with_home(&fx.home);
    config.build.detect_local_toolchains = false;
    config.build.parallel_jobs = 2;

    let resolver = ToolchainResolver::new(config.toolchains_dir(), Arc::new(FakeSource::default()))
        .with_local_detection(false);
    BuildRunner::new(config)
        .unwrap()
        .with_toolchain_resolver(Arc::new(resolver))
        .with_recipes(fx.recipes.clone())
        .with_backend(backend)
        .with_credentials(Arc::new(DebugKey))
        .with_signer(Arc::new(CopySigner))
        .with_linker(Arc::new(TableLinker))
}

#[tokio::test]
async fn test_example_app_builds_debug_apk() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend::default());
    let runner = runner(&fx, backend.clone());
    let events = runner.events().subscribe();

    let output = runner
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(output.package_id, "org.example.app");
    assert_eq!(output.abis, vec![Abi::Arm64V8a, Abi::ArmeabiV7a]);
    assert!(!output.is_partial());
    assert!(output
        .artifact
        .path
        .ends_with("bin/org.example.app-1.2.0-debug.apk"));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    let info = ArtifactInspector::inspect(&output.artifact.path).unwrap();
    assert_eq!(info.abis(), vec!["arm64-v8a", "armeabi-v7a"]);
    assert!(info.native_libs.iter().all(|l| l.name == "libruntimea.so"));
    let manifest = info.manifest.unwrap();
    assert_eq!(manifest.package, "org.example.app");
    assert_eq!(manifest.min_sdk, Some(26));
    assert_eq!(manifest.target_sdk, Some(33));
    assert_eq!(info.build_info["Variant"], "debug");
    assert_eq!(info.metadata.unwrap().dependencies[0].name, "runtimea");

    let events = events.drain();
    let started: Vec<Stage> = events
        .iter()
        .filter_map(|e| match e {
            Event::StageStarted { stage } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, Stage::ordered().to_vec());
    assert!(matches!(
        events.last(),
        Some(Event::BuildCompleted { success: true, artifact: Some(_) })
    ));
}

#[tokio::test]
async fn test_failed_abi_is_left_out() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend {
        fail: vec![Abi::ArmeabiV7a],
        ..Default::default()
    });

    let output = runner(&fx, backend)
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap();

    assert!(output.is_partial());
    assert_eq!(output.abis, vec![Abi::Arm64V8a]);
    assert_eq!(output.compile_failures[0].abi, "armeabi-v7a");
    assert_eq!(output.compile_failures[0].kind, CompileErrorKind::UnsupportedSource);
    assert!(output.compile_failures[0].output.contains("__int128"));

    let info = ArtifactInspector::inspect(&output.artifact.path).unwrap();
    assert_eq!(info.abis(), vec!["arm64-v8a"]);
    assert_eq!(info.metadata.unwrap().failed_abis, vec!["armeabi-v7a".to_string()]);
}

#[tokio::test]
async fn test_every_abi_failing_fails_compile_stage() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend {
        fail: vec![Abi::ArmeabiV7a, Abi::Arm64V8a],
        ..Default::default()
    });

    let err = runner(&fx, backend)
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Compile));
    assert_eq!(err.exit_code(), 5);
    let message = err.to_string();
    assert!(message.starts_with("[compile]"));
    assert!(message.contains("armeabi-v7a") && message.contains("arm64-v8a"));
}

#[tokio::test]
async fn test_reproducible_rebuild_hits_cache_and_matches_bytes() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend::default());
    let runner = runner(&fx, backend.clone());
    let options = BuildOptions {
        reproducible: true,
        ..Default::default()
    };

    let first = runner.build(&fx.manifest, &options).await.unwrap();
    let first_bytes = std::fs::read(&first.artifact.path).unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    let events = runner.events().subscribe();
    let second = runner.build(&fx.manifest, &options).await.unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(&second.artifact.path).unwrap(), first_bytes);
    assert_eq!(first.artifact.sha256, second.artifact.sha256);

    let cache_hits = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, Event::CacheHit { stage: Stage::Compile, .. }))
        .count();
    assert_eq!(cache_hits, 2);
}

#[tokio::test]
async fn test_abi_override_compiles_only_missing_abis() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend::default());
    let runner = runner(&fx, backend.clone());

    let only_arm64 = BuildOptions {
        abis: Some(vec![Abi::Arm64V8a]),
        ..Default::default()
    };
    runner.build(&fx.manifest, &only_arm64).await.unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    let output = runner
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(output.abis.len(), 2);
}

#[tokio::test]
async fn test_unknown_permission_passes_through() {
    let fx = fixture(&MANIFEST.replace(
        "android.permissions = INTERNET",
        "android.permissions = INTERNET, com.example.permission.CUSTOM",
    ));

    let output = runner(&fx, Arc::new(FakeBackend::default()))
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap();

    assert!(output.warnings.iter().any(|w| w.contains("com.example.permission.CUSTOM")));
    let manifest = ArtifactInspector::inspect(&output.artifact.path)
        .unwrap()
        .manifest
        .unwrap();
    let names: Vec<&str> = manifest.permissions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["android.permission.INTERNET", "com.example.permission.CUSTOM"]
    );
}

#[tokio::test]
async fn test_min_api_above_target_is_manifest_error() {
    let fx = fixture(&MANIFEST.replace("android.minapi = 26", "android.minapi = 34"));

    let err = runner(&fx, Arc::new(FakeBackend::default()))
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Manifest));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_build_without_key_fails_packaging() {
    let fx = fixture(MANIFEST);
    let release = BuildOptions {
        variant: BuildVariant::Release,
        ..Default::default()
    };

    for options in [BuildOptions::default(), release] {
        let err = runner(&fx, Arc::new(FakeBackend::default()))
            .with_credentials(Arc::new(NoCredentials))
            .build(&fx.manifest, &options)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Packaging));
        assert_eq!(err.exit_code(), 7);
        assert!(err.to_string().contains("signing credential unavailable"));
    }
    let bin = fx.manifest.parent().unwrap().join("bin");
    assert!(!bin.exists() || std::fs::read_dir(&bin).unwrap().next().is_none());
}

#[tokio::test]
async fn test_release_bundle_layout() {
    let fx = fixture(MANIFEST);
    let options = BuildOptions {
        variant: BuildVariant::Release,
        ..Default::default()
    };

    let output = runner(&fx, Arc::new(FakeBackend::default()))
        .build(&fx.manifest, &options)
        .await
        .unwrap();

    assert!(output
        .artifact
        .path
        .ends_with("bin/org.example.app-1.2.0-release.aab"));
    let info = ArtifactInspector::inspect(&output.artifact.path).unwrap();
    assert_eq!(info.artifact, ArtifactType::Aab);
    assert_eq!(info.abis(), vec!["arm64-v8a", "armeabi-v7a"]);
}

#[tokio::test]
async fn test_concurrent_builds_share_one_home() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend::default());
    let (a, b) = (runner(&fx, backend.clone()), runner(&fx, backend.clone()));
    let options = BuildOptions::default();

    for _ in 0..3 {
        let (x, y) = tokio::join!(
            a.build(&fx.manifest, &options),
            b.build(&fx.manifest, &options)
        );
        for output in [x.unwrap(), y.unwrap()] {
            assert!(!output.is_partial());
            let info = ArtifactInspector::inspect(&output.artifact.path).unwrap();
            assert_eq!(info.abis(), vec!["arm64-v8a", "armeabi-v7a"]);
            assert!(info.native_libs.iter().all(|l| l.name == "libruntimea.so"));
        }
    }

    let bin = fx.manifest.parent().unwrap().join("bin");
    let outputs: Vec<_> = std::fs::read_dir(&bin).unwrap().collect();
    assert_eq!(outputs.len(), 1);
    let assembly = fx.home.join("work").join("assembly");
    assert_eq!(std::fs::read_dir(&assembly).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancelled_build_runs_no_stage() {
    let fx = fixture(MANIFEST);
    let backend = Arc::new(FakeBackend::default());
    let runner = runner(&fx, backend.clone());
    let events = runner.events().subscribe();
    runner.cancellation_token().cancel();

    let err = runner
        .build(&fx.manifest, &BuildOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled(Stage::Manifest)));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        events.drain(),
        vec![Event::BuildCompleted {
            success: false,
            artifact: None
        }]
    );
}
