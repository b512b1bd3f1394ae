//! Package Assembly
//!
//! Lays out the unpacked package tree: manifest, native libraries, app
//! sources, pure dependencies, resources and build metadata.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use apkforge_core::error::AssemblyError;
use apkforge_core::{Abi, TOOL_NAME, VERSION};
use apkforge_manifest::{BuildManifest, ManifestWriter, PermissionCatalog, SourceSpec};
use apkforge_toolchain::ToolchainHandle;

use crate::bundler::DependencySet;
use crate::config::BuildVariant;
use crate::orchestrator::CompileOutcome;
use crate::store::copy_tree;

/// Build metadata file at the package root
pub const METADATA_FILE: &str = "apkforge.json";

/// Everything the assembler consumes
pub struct AssemblyInput<'a> {
    pub manifest: &'a BuildManifest,
    /// Directory the manifest was loaded from; relative paths resolve here
    pub manifest_dir: &'a Path,
    pub variant: BuildVariant,
    pub compiled: &'a CompileOutcome,
    pub dependencies: &'a DependencySet,
    pub toolchain: &'a ToolchainHandle,
}

/// An assembled, not yet packaged, tree.
///
/// Consumed by the packager; there is exactly one owner. Each tree lives in
/// its own directory, removed when the tree is dropped.
#[derive(Debug)]
pub struct PackageTree {
    pub(crate) dir: TempDir,
    pub package_id: String,
    pub version_name: String,
    pub version_code: u32,
    pub min_api: u32,
    pub abis: Vec<Abi>,
}

impl PackageTree {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the tree from disk
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// A packaged dependency as recorded in the metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedDependency {
    pub name: String,
    pub version: String,
}

/// Content of [`METADATA_FILE`]; carries no timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub tool: String,
    pub tool_version: String,
    pub package: String,
    pub version: String,
    pub version_code: u32,
    pub variant: BuildVariant,
    pub toolchain: String,
    pub abis: Vec<Abi>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_abis: Vec<String>,
    pub dependencies: Vec<PackagedDependency>,
}

/// Writes package trees under a build root
pub struct PackageAssembler {
    build_root: PathBuf,
    catalog: PermissionCatalog,
    writer: ManifestWriter,
}

impl PackageAssembler {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            catalog: PermissionCatalog::new(),
            writer: ManifestWriter::new(),
        }
    }

    /// Check API-level constraints without touching the filesystem
    pub fn validate(&self, manifest: &BuildManifest) -> Result<(), AssemblyError> {
        let target_api = manifest.platform().target_api;

        if let Some((perm, info)) = self
            .catalog
            .unavailable_at(manifest.permissions(), target_api)
            .into_iter()
            .next()
        {
            return Err(AssemblyError::PermissionUnsupported {
                permission: perm.name.clone(),
                required_api: info.added_in_api,
                target_api,
            });
        }
        for perm in manifest.permissions() {
            if !self.catalog.is_known(&perm.name) {
                warn!("Unknown permission {} is passed through as is", perm.name);
            }
        }

        let orientation = manifest.orientation();
        if orientation.required_api() > target_api {
            return Err(AssemblyError::OrientationUnsupported {
                orientation: orientation.as_str().to_string(),
                required_api: orientation.required_api(),
                target_api,
            });
        }
        Ok(())
    }

    /// Assemble a fresh package tree
    pub async fn assemble(&self, input: AssemblyInput<'_>) -> Result<PackageTree, AssemblyError> {
        let manifest = input.manifest;
        self.validate(manifest)?;
        if input.compiled.artifacts.is_empty() {
            return Err(AssemblyError::NoCompiledAbi);
        }

        let source_dir = manifest.source_dir(input.manifest_dir);
        if !source_dir.is_dir() {
            return Err(AssemblyError::MissingAsset(source_dir));
        }
        let entrypoint = source_dir.join(&manifest.source().entrypoint);
        if !entrypoint.is_file() {
            return Err(AssemblyError::MissingAsset(entrypoint));
        }
        let icon = resolve_asset(input.manifest_dir, manifest.icon())?;
        let presplash = resolve_asset(input.manifest_dir, manifest.presplash())?;

        let package_id = manifest.package_id();
        tokio::fs::create_dir_all(&self.build_root).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}.", package_id, input.variant))
            .tempdir_in(&self.build_root)?;
        let root = dir.path().to_path_buf();
        info!("Assembling {} in {:?}", package_id, root);

        let xml = self
            .writer
            .android_manifest_xml(manifest)
            .map_err(|e| AssemblyError::Xml(e.to_string()))?;
        tokio::fs::write(root.join("AndroidManifest.xml"), xml).await?;

        for (abi, artifacts) in &input.compiled.artifacts {
            let lib_dir = root.join("lib").join(abi.abi_name());
            tokio::fs::create_dir_all(&lib_dir).await?;
            for lib in &artifacts.libraries {
                if let Some(name) = lib.file_name() {
                    tokio::fs::copy(lib, lib_dir.join(name)).await?;
                }
            }
        }

        let app_dir = root.join("assets").join("app");
        let spec = manifest.source().clone();
        let copied = {
            let (from, to) = (source_dir.clone(), app_dir.clone());
            tokio::task::spawn_blocking(move || copy_sources(&from, &to, &spec))
                .await
                .map_err(|e| AssemblyError::Io(e.to_string()))??
        };
        debug!("Copied {} application files", copied);

        for dep in input.dependencies.pure() {
            let dest = root.join("assets").join("site-packages").join(&dep.name);
            let from = dep.source_dir.clone();
            tokio::task::spawn_blocking(move || copy_tree(&from, &dest))
                .await
                .map_err(|e| AssemblyError::Io(e.to_string()))??;
        }

        if let Some(icon) = icon {
            copy_resource(&icon, &root.join("res").join("mipmap"), "icon").await?;
        }
        if let Some(presplash) = presplash {
            copy_resource(&presplash, &root.join("res").join("drawable"), "presplash").await?;
        }

        let abis: Vec<Abi> = input.compiled.artifacts.keys().copied().collect();
        let metadata = BuildMetadata {
            tool: TOOL_NAME.to_string(),
            tool_version: VERSION.to_string(),
            package: package_id.clone(),
            version: manifest.version().to_string(),
            version_code: manifest.version_code(),
            variant: input.variant,
            toolchain: input.toolchain.version_key(),
            abis: abis.clone(),
            failed_abis: input.compiled.failed_abis(),
            dependencies: input
                .dependencies
                .packages()
                .into_iter()
                .map(|(name, version)| PackagedDependency {
                    name: name.to_string(),
                    version: version.to_string(),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| AssemblyError::Io(e.to_string()))?;
        tokio::fs::write(root.join(METADATA_FILE), json).await?;

        Ok(PackageTree {
            dir,
            package_id,
            version_name: manifest.version().to_string(),
            version_code: manifest.version_code(),
            min_api: manifest.platform().min_api,
            abis,
        })
    }
}

fn resolve_asset(base: &Path, asset: Option<&Path>) -> Result<Option<PathBuf>, AssemblyError> {
    let Some(asset) = asset else {
        return Ok(None);
    };
    let path = base.join(asset);
    if !path.is_file() {
        return Err(AssemblyError::MissingAsset(path));
    }
    Ok(Some(path))
}

async fn copy_resource(from: &Path, dir: &Path, stem: &str) -> Result<(), AssemblyError> {
    tokio::fs::create_dir_all(dir).await?;
    let name = match from.extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem.to_string(),
    };
    tokio::fs::copy(from, dir.join(name)).await?;
    Ok(())
}

/// Copy the application sources that pass the manifest's filters
fn copy_sources(from: &Path, to: &Path, spec: &SourceSpec) -> Result<usize, AssemblyError> {
    let patterns: Vec<glob::Pattern> = spec
        .exclude_patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Ignoring invalid exclude pattern {:?}: {}", p, e);
                None
            }
        })
        .collect();

    std::fs::create_dir_all(to)?;
    let walker = WalkDir::new(from)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !spec
                    .exclude_dirs
                    .iter()
                    .any(|d| e.file_name().to_string_lossy() == d.as_str())
        });

    let mut copied = 0;
    for entry in walker {
        let entry = entry.map_err(|e| AssemblyError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let file_name = entry.file_name().to_string_lossy();
        if !spec.includes_extension(&file_name) {
            continue;
        }
        if patterns.iter().any(|p| p.matches_path(relative)) {
            continue;
        }

        let dest = to.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &dest)?;
        copied += 1;
    }
    Ok(copied)
}
