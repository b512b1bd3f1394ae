//! Error types for apkforge
//!
//! One error enum per pipeline stage, aggregated into [`BuildError`]. Every
//! variant that wraps an external tool keeps that tool's output verbatim.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage, used to tag errors and progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Manifest,
    Toolchain,
    Dependencies,
    Compile,
    Assembly,
    Packaging,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Manifest => "manifest",
            Stage::Toolchain => "toolchain",
            Stage::Dependencies => "dependencies",
            Stage::Compile => "compile",
            Stage::Assembly => "assembly",
            Stage::Packaging => "packaging",
        }
    }

    /// All stages in execution order
    pub fn ordered() -> &'static [Stage] {
        &[
            Stage::Manifest,
            Stage::Toolchain,
            Stage::Dependencies,
            Stage::Compile,
            Stage::Assembly,
            Stage::Packaging,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manifest loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest has no [{0}] section")]
    MissingSection(String),

    #[error("missing required field '{key}' in [{section}]")]
    MissingField { section: String, key: String },

    #[error("malformed identifier '{value}': {reason}")]
    MalformedIdentifier { value: String, reason: String },

    #[error("minimum API level {min} is greater than target API level {target}")]
    ApiLevelOrder { min: u32, target: u32 },

    #[error("unknown artifact type '{0}' (expected 'apk' or 'aab')")]
    UnknownArtifactType(String),

    #[error("invalid value for '{key}': '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot parse manifest: {0}")]
    Syntax(String),

    #[error("cannot read manifest {path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// Toolchain resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolchainError {
    #[error("{component} {version} not found locally and not fetchable: {detail}")]
    VersionNotFound {
        component: String,
        version: String,
        detail: String,
    },

    #[error("incompatible toolchain combination: {0}")]
    Incompatible(String),

    #[error("network failure fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cannot unpack toolchain archive: {0}")]
    Extraction(String),

    #[error("toolchain cache I/O failure: {0}")]
    Io(String),
}

impl ToolchainError {
    /// Transient network failures may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolchainError::Network { .. })
    }
}

impl From<std::io::Error> for ToolchainError {
    fn from(e: std::io::Error) -> Self {
        ToolchainError::Io(e.to_string())
    }
}

/// Dependency resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("cannot resolve '{name}' ({requirement}): {reason}")]
    Unresolvable {
        name: String,
        requirement: String,
        reason: String,
    },

    #[error("version conflict for '{name}': no release satisfies all of [{}]", .constraints.join(", "))]
    VersionConflict {
        name: String,
        constraints: Vec<String>,
    },

    #[error("'{name}' does not support ABI {abi}{}", required_by_suffix(.required_by))]
    UnsupportedAbi {
        name: String,
        abi: String,
        required_by: Option<String>,
    },

    #[error("cannot fetch '{name}' {version}: {message}")]
    Fetch {
        name: String,
        version: String,
        message: String,
    },

    #[error("invalid recipe '{name}': {reason}")]
    InvalidRecipe { name: String, reason: String },
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(parent) => format!(" (required by '{}')", parent),
        None => String::new(),
    }
}

/// Classification of a per-ABI compile failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileErrorKind {
    /// The toolchain could not be invoked or exited with an error
    ToolInvocation,
    /// The compiler rejected a construct it does not support for this target
    UnsupportedSource,
    /// The linker failed
    Link,
    /// Filesystem failure while preparing or collecting the build
    Io,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileErrorKind::ToolInvocation => "toolchain invocation failed",
            CompileErrorKind::UnsupportedSource => "unsupported source construct",
            CompileErrorKind::Link => "linker failure",
            CompileErrorKind::Io => "I/O failure",
        };
        f.write_str(s)
    }
}

/// A compile failure for one dependency on one ABI
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{dependency} [{abi}]: {kind}\n{output}")]
pub struct CompileError {
    pub dependency: String,
    pub abi: String,
    pub kind: CompileErrorKind,
    /// Tool output, verbatim
    pub output: String,
}

/// Package assembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("missing required asset: {0}")]
    MissingAsset(PathBuf),

    #[error("permission {permission} requires API {required_api}, target API is {target_api}")]
    PermissionUnsupported {
        permission: String,
        required_api: u32,
        target_api: u32,
    },

    #[error("orientation '{orientation}' requires API {required_api}, target API is {target_api}")]
    OrientationUnsupported {
        orientation: String,
        required_api: u32,
        target_api: u32,
    },

    #[error("no compiled ABI available to assemble")]
    NoCompiledAbi,

    #[error("cannot write AndroidManifest.xml: {0}")]
    Xml(String),

    #[error("assembly I/O failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for AssemblyError {
    fn from(e: std::io::Error) -> Self {
        AssemblyError::Io(e.to_string())
    }
}

/// Artifact packaging errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackagingError {
    #[error("signing credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("compression failure: {0}")]
    Compression(String),

    #[error("artifact type {artifact} unsupported by current toolchain: {reason}")]
    UnsupportedArtifact { artifact: String, reason: String },

    #[error("resource linking failed:\n{0}")]
    Linking(String),

    #[error("signing failed:\n{0}")]
    Signing(String),

    #[error("packaging I/O failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for PackagingError {
    fn from(e: std::io::Error) -> Self {
        PackagingError::Io(e.to_string())
    }
}

/// A stage exceeded its wall-clock budget
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} stage exceeded its budget of {}s", .budget.as_secs())]
pub struct TimeoutError {
    pub stage: Stage,
    pub budget: Duration,
}

/// Top-level build error; its message always starts with the failing stage
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("[manifest] {0}")]
    Manifest(#[from] ManifestError),

    #[error("[toolchain] {0}")]
    Toolchain(#[from] ToolchainError),

    #[error("[dependencies] {} failure(s):\n{}", .0.len(), list_failures(.0))]
    Dependencies(Vec<DependencyError>),

    #[error("[compile] all ABIs failed, {} failure(s):\n{}", .0.len(), list_failures(.0))]
    Compile(Vec<CompileError>),

    #[error("[assembly] {0}")]
    Assembly(#[from] AssemblyError),

    #[error("[packaging] {0}")]
    Packaging(#[from] PackagingError),

    #[error("[{}] {0}", .0.stage)]
    Timeout(#[from] TimeoutError),

    #[error("build cancelled before {0} stage")]
    Cancelled(Stage),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn list_failures<E: fmt::Display>(failures: &[E]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for apkforge operations
pub type Result<T> = std::result::Result<T, BuildError>;

impl BuildError {
    /// The stage this error belongs to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildError::Manifest(_) => Some(Stage::Manifest),
            BuildError::Toolchain(_) => Some(Stage::Toolchain),
            BuildError::Dependencies(_) => Some(Stage::Dependencies),
            BuildError::Compile(_) => Some(Stage::Compile),
            BuildError::Assembly(_) => Some(Stage::Assembly),
            BuildError::Packaging(_) => Some(Stage::Packaging),
            BuildError::Timeout(t) => Some(t.stage),
            BuildError::Cancelled(_) | BuildError::Config(_) | BuildError::Internal(_) => None,
        }
    }

    /// Check if retrying the build may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BuildError::Toolchain(e) => e.is_retryable(),
            BuildError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Process exit code for the CLI, distinct per stage
    pub fn exit_code(&self) -> u8 {
        match self.stage() {
            Some(Stage::Manifest) => 2,
            Some(Stage::Toolchain) => 3,
            Some(Stage::Dependencies) => 4,
            Some(Stage::Compile) => 5,
            Some(Stage::Assembly) => 6,
            Some(Stage::Packaging) => 7,
            None => 1,
        }
    }
}
