//! Compile backends
//!
//! A backend turns one native dependency's sources into installed libraries
//! under the ABI's shared prefix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use regex::RegexSet;
use tokio::process::Command;
use tracing::{debug, info};

use apkforge_core::error::{CompileError, CompileErrorKind};
use apkforge_core::Abi;

/// One dependency build for one ABI
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub dependency: String,
    pub version: String,
    pub abi: Abi,
    /// Private copy of the sources to build in
    pub build_dir: PathBuf,
    /// Shared install prefix of the ABI; earlier dependencies are already here
    pub prefix: PathBuf,
    pub script: String,
    /// Cross-compile environment
    pub env: BTreeMap<String, String>,
}

impl CompileJob {
    pub fn error(&self, kind: CompileErrorKind, output: impl Into<String>) -> CompileError {
        CompileError {
            dependency: self.dependency.clone(),
            abi: self.abi.to_string(),
            kind,
            output: output.into(),
        }
    }
}

/// Runs one toolchain invocation
#[async_trait]
pub trait CompileBackend: Send + Sync {
    async fn compile(&self, job: &CompileJob) -> Result<(), CompileError>;
}

const LINK_PATTERNS: &[&str] = &[
    r"(?m)\bld(\.lld)?: error",
    r"(?m)\bcollect2: error",
    r"undefined (symbol|reference)",
    r"cannot find -l\S+",
    r"linker command failed",
];

const UNSUPPORTED_PATTERNS: &[&str] = &[
    r"error: unknown type name",
    r"error: use of undeclared identifier",
    r"error: .*(is|are) not supported",
    r"error: unsupported",
    r"(?m)^\s*#\s*error\b",
    r"error: unknown target",
];

/// Sorts tool output into failure kinds
pub struct FailureClassifier {
    link: RegexSet,
    unsupported: RegexSet,
}

impl FailureClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            link: RegexSet::new(LINK_PATTERNS)?,
            unsupported: RegexSet::new(UNSUPPORTED_PATTERNS)?,
        })
    }

    pub fn classify(&self, output: &str) -> CompileErrorKind {
        if self.link.is_match(output) {
            CompileErrorKind::Link
        } else if self.unsupported.is_match(output) {
            CompileErrorKind::UnsupportedSource
        } else {
            CompileErrorKind::ToolInvocation
        }
    }
}

/// Runs the recipe's build script with `sh -c`
pub struct ScriptCompiler {
    shell: PathBuf,
    classifier: FailureClassifier,
}

impl ScriptCompiler {
    pub fn new() -> Result<Self, regex::Error> {
        let shell = which::which("sh").unwrap_or_else(|_| PathBuf::from("sh"));
        Ok(Self {
            shell,
            classifier: FailureClassifier::new()?,
        })
    }
}

#[async_trait]
impl CompileBackend for ScriptCompiler {
    async fn compile(&self, job: &CompileJob) -> Result<(), CompileError> {
        info!("Compiling {} {} for {}", job.dependency, job.version, job.abi);
        debug!("sh -c {:?} in {:?}", job.script, job.build_dir);

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.script)
            .current_dir(&job.build_dir)
            .envs(&job.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                job.error(
                    CompileErrorKind::ToolInvocation,
                    format!("cannot run {:?}: {}", self.shell, e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);
        let kind = self.classifier.classify(&combined);
        Err(job.error(kind, combined))
    }
}
