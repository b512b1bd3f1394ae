//! Android Build Engine
//!
//! Everything after the manifest and toolchain: resolving and fetching
//! dependencies, cross-compiling them per ABI, assembling the package tree
//! and writing the final `.apk`/`.aab`.

pub mod apk;
pub mod assembler;
pub mod bundler;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod linker;
pub mod orchestrator;
pub mod packager;
pub mod recipes;
pub mod runner;
pub mod signing;
pub mod store;

pub use apk::{ArtifactInfo, ArtifactInspector, NativeLib};
pub use assembler::{AssemblyInput, BuildMetadata, PackageAssembler, PackageTree};
pub use bundler::{DependencyBundler, DependencyEntry, DependencySet};
pub use cache::{BuildCache, BuildCacheKey, ManifestKey};
pub use compiler::{CompileBackend, CompileJob, ScriptCompiler};
pub use config::{BuildOptions, BuildVariant};
pub use linker::{Aapt2Linker, ResourceLinker};
pub use orchestrator::{AbiArtifacts, CompileOutcome, CrossCompileOrchestrator};
pub use packager::{ArtifactPackager, PackagedArtifact};
pub use recipes::{Recipe, RecipeBook, RecipeKind};
pub use runner::{BuildOutput, BuildRunner, CheckReport};
pub use signing::{
    ArtifactSigner, CredentialProvider, EnvCredentialProvider, NoCredentials, SigningCredentials,
    ToolSigner,
};
pub use store::{DependencyStore, StoreEntry};
