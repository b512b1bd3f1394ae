//! Build Runner
//!
//! Drives one manifest through every pipeline stage. Shared caches are
//! explicit handles so several runners (or tests) can share them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use apkforge_core::error::CompileError;
use apkforge_core::events::{Event, EventBus};
use apkforge_core::{Abi, BuildError, PipelineConfig, Result, Stage, StageRunner};
use apkforge_manifest::{ArtifactType, BuildManifest, LoadedManifest, ManifestParser};
use apkforge_toolchain::{check_compatibility, HttpToolchainSource, ToolchainRequest, ToolchainResolver};

use crate::assembler::{AssemblyInput, PackageAssembler};
use crate::bundler::DependencyBundler;
use crate::cache::{BuildCache, ManifestKey};
use crate::compiler::{CompileBackend, ScriptCompiler};
use crate::linker::{Aapt2Linker, ResourceLinker};
use crate::config::{reproducible_timestamp, BuildOptions, BuildVariant};
use crate::orchestrator::CrossCompileOrchestrator;
use crate::packager::{ArtifactPackager, PackagedArtifact};
use crate::recipes::RecipeBook;
use crate::signing::{ArtifactSigner, CredentialProvider, EnvCredentialProvider, ToolSigner};
use crate::store::DependencyStore;

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact: PackagedArtifact,
    pub package_id: String,
    pub variant: BuildVariant,
    /// ABIs present in the artifact
    pub abis: Vec<Abi>,
    /// Errors of ABIs left out of the artifact
    pub compile_failures: Vec<CompileError>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl BuildOutput {
    /// Some requested ABIs failed to compile
    pub fn is_partial(&self) -> bool {
        !self.compile_failures.is_empty()
    }
}

/// Result of `check`
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub manifest: BuildManifest,
    pub warnings: Vec<String>,
}

/// Runs builds against shared caches
pub struct BuildRunner {
    config: PipelineConfig,
    resolver: Arc<ToolchainResolver>,
    store: Arc<DependencyStore>,
    build_cache: Arc<BuildCache>,
    recipes: Arc<RecipeBook>,
    backend: Arc<dyn CompileBackend>,
    credentials: Arc<dyn CredentialProvider>,
    signer: Arc<dyn ArtifactSigner>,
    linker: Arc<dyn ResourceLinker>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

impl BuildRunner {
    /// Runner with the default components for `config`
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let source = HttpToolchainSource::new(config.download.clone())?;
        let resolver = ToolchainResolver::new(config.toolchains_dir(), Arc::new(source))
            .with_local_detection(config.build.detect_local_toolchains)
            .with_events(events.clone());
        let store = DependencyStore::new(config.store_dir(), config.download.clone())
            .with_events(events.clone());
        let recipes = RecipeBook::load_dir(&config.recipes_dir())
            .map_err(|e| BuildError::Dependencies(vec![e]))?;
        let backend = ScriptCompiler::new().map_err(|e| BuildError::Internal(e.to_string()))?;

        Ok(Self {
            resolver: Arc::new(resolver),
            store: Arc::new(store),
            build_cache: Arc::new(BuildCache::new(config.build_cache_dir())),
            recipes: Arc::new(recipes),
            backend: Arc::new(backend),
            credentials: Arc::new(EnvCredentialProvider::from_env(config.signing.clone())),
            signer: Arc::new(ToolSigner),
            linker: Arc::new(Aapt2Linker),
            events,
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn with_toolchain_resolver(mut self, resolver: Arc<ToolchainResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_store(mut self, store: Arc<DependencyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_build_cache(mut self, cache: Arc<BuildCache>) -> Self {
        self.build_cache = cache;
        self
    }

    pub fn with_recipes(mut self, recipes: Arc<RecipeBook>) -> Self {
        self.recipes = recipes;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn CompileBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn ArtifactSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_linker(mut self, linker: Arc<dyn ResourceLinker>) -> Self {
        self.linker = linker;
        self
    }

    /// Publish progress on `events`; injected components keep their own bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Cancelling stops the build before its next stage
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Validate a manifest without building
    pub async fn check(&self, manifest_path: &Path) -> Result<CheckReport> {
        let LoadedManifest { manifest, warnings } = ManifestParser::load_file(manifest_path).await?;
        PackageAssembler::new(self.config.work_dir()).validate(&manifest)?;
        check_compatibility(&toolchain_request(&manifest))?;
        Ok(CheckReport { manifest, warnings })
    }

    /// Build the artifact described by `manifest_path`
    pub async fn build(&self, manifest_path: &Path, options: &BuildOptions) -> Result<BuildOutput> {
        let result = self.run(manifest_path, options).await;
        self.events.emit(Event::BuildCompleted {
            success: result.is_ok(),
            artifact: result.as_ref().ok().map(|o| o.artifact.path.clone()),
        });
        result
    }

    async fn run(&self, manifest_path: &Path, options: &BuildOptions) -> Result<BuildOutput> {
        let started = Instant::now();
        let stages = StageRunner::new(
            self.config.budgets.clone(),
            self.cancel.clone(),
            self.events.clone(),
        );
        let jobs = options.jobs.unwrap_or_else(|| self.config.parallel_jobs()).max(1);
        let reproducible = options.reproducible || self.config.build.reproducible;
        let manifest_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let LoadedManifest {
            manifest,
            mut warnings,
        } = stages
            .run(Stage::Manifest, async {
                Ok(ManifestParser::load_file(manifest_path).await?)
            })
            .await?;
        for message in &warnings {
            self.events.emit(Event::Warning {
                message: message.clone(),
            });
        }

        let abis = target_abis(&manifest, options)?;
        let artifact_type = artifact_for(&manifest, options.variant);
        info!(
            "Building {} {} ({}, {}) for {:?}",
            manifest.package_id(),
            manifest.version(),
            options.variant,
            artifact_type,
            abis
        );

        let request = toolchain_request(&manifest);
        let toolchain = stages
            .run(Stage::Toolchain, async { Ok(self.resolver.resolve(&request).await?) })
            .await?;

        let bundler = DependencyBundler::new(self.recipes.clone(), self.store.clone())
            .with_jobs(jobs)
            .with_relaxed_conflicts(self.config.build.relax_conflicts)
            .with_events(self.events.clone());
        let dependencies = stages
            .run(
                Stage::Dependencies,
                bundler.bundle(manifest.requirements(), &abis),
            )
            .await?;

        let orchestrator = CrossCompileOrchestrator::new(
            self.build_cache.clone(),
            self.backend.clone(),
            self.config.work_dir().join("compile"),
        )
        .with_jobs(jobs)
        .with_source_date_epoch(reproducible.then(reproducible_timestamp))
        .with_events(self.events.clone());
        let manifest_key = ManifestKey::from(&manifest);
        let compiled = stages
            .run(
                Stage::Compile,
                orchestrator.compile(&dependencies, &toolchain, &abis, &manifest_key),
            )
            .await?;
        for failed in compiled.failed_abis() {
            let message = format!("ABI {} failed to compile and is left out", failed);
            warn!("{}", message);
            warnings.push(message);
        }

        let assembler = PackageAssembler::new(self.config.work_dir().join("assembly"));
        let tree = stages
            .run(Stage::Assembly, async {
                Ok(assembler
                    .assemble(AssemblyInput {
                        manifest: &manifest,
                        manifest_dir: &manifest_dir,
                        variant: options.variant,
                        compiled: &compiled,
                        dependencies: &dependencies,
                        toolchain: &toolchain,
                    })
                    .await?)
            })
            .await?;

        let packager = ArtifactPackager::new(
            self.config.output_dir(manifest_path),
            self.credentials.clone(),
            self.signer.clone(),
        )
        .with_reproducible(reproducible)
        .with_linker(self.linker.clone());
        let artifact = stages
            .run(Stage::Packaging, async {
                Ok(packager
                    .package(tree, artifact_type, options.variant, &toolchain)
                    .await?)
            })
            .await?;

        Ok(BuildOutput {
            package_id: manifest.package_id(),
            variant: options.variant,
            abis: compiled.succeeded_abis(),
            compile_failures: compiled.failures,
            warnings,
            duration: started.elapsed(),
            artifact,
        })
    }
}

fn toolchain_request(manifest: &BuildManifest) -> ToolchainRequest {
    let platform = manifest.platform();
    ToolchainRequest {
        sdk_version: platform.sdk_version.clone(),
        ndk_version: platform.ndk_version.clone(),
        api_level: platform.target_api,
        ndk_api: platform.ndk_api,
    }
}

/// Requested ABIs, deduplicated in request order
fn target_abis(manifest: &BuildManifest, options: &BuildOptions) -> Result<Vec<Abi>> {
    let requested = options.abis.as_deref().unwrap_or(manifest.archs());
    let mut abis = Vec::new();
    for abi in requested {
        if !abis.contains(abi) {
            abis.push(*abi);
        }
    }
    if abis.is_empty() {
        return Err(BuildError::Config("no target ABI selected".to_string()));
    }
    Ok(abis)
}

/// Artifact type a variant builds by default
pub fn artifact_for(manifest: &BuildManifest, variant: BuildVariant) -> ArtifactType {
    match variant {
        BuildVariant::Release => manifest.release_artifact(),
        BuildVariant::Debug => manifest.debug_artifact(),
    }
}
