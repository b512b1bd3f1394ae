//! apkforge - manifest-driven Android packaging
//!
//! Turns an application descriptor into an installable `.apk` or a
//! store-ready `.aab`: resolves the SDK/NDK, fetches and cross-compiles
//! dependencies per ABI, assembles the package tree and signs the result.
//!
//! ## Architecture
//!
//! - `apkforge-core`: errors, ABIs, configuration, events, stage runner
//! - `apkforge-manifest`: descriptor parsing and `AndroidManifest.xml`
//! - `apkforge-toolchain`: SDK/NDK resolution and download
//! - `apkforge-build-engine`: dependencies, compilation, assembly, packaging

#![warn(clippy::all)]

pub mod commands;

pub use apkforge_build_engine as build;
pub use apkforge_core as core;
pub use apkforge_manifest as manifest;
pub use apkforge_toolchain as toolchain;

/// Prelude module for convenient imports
pub mod prelude {
    pub use apkforge_build_engine::{BuildOptions, BuildRunner, BuildVariant};
    pub use apkforge_core::{Abi, BuildError, PipelineConfig};
    pub use apkforge_manifest::{BuildManifest, ManifestParser, ManifestWriter};
    pub use apkforge_toolchain::{ToolchainRequest, ToolchainResolver};
}
