//! Artifact Signing
//!
//! Where signing keys come from, and the tools that apply them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use apkforge_core::config::SigningSettings;
use apkforge_core::error::PackagingError;
use apkforge_manifest::ArtifactType;
use apkforge_toolchain::ToolchainHandle;

use crate::config::BuildVariant;

pub const KEYSTORE_ENV: &str = "P4A_RELEASE_KEYSTORE";
pub const KEYSTORE_PASSWORD_ENV: &str = "P4A_RELEASE_KEYSTORE_PASSWD";
pub const KEY_ALIAS_ENV: &str = "P4A_RELEASE_KEYALIAS";
pub const KEY_PASSWORD_ENV: &str = "P4A_RELEASE_KEYALIAS_PASSWD";

// Passed to child processes so passwords never appear on a command line
const CHILD_STORE_PASS: &str = "APKFORGE_KS_PASS";
const CHILD_KEY_PASS: &str = "APKFORGE_KEY_PASS";

/// A usable signing key
#[derive(Clone, PartialEq, Eq)]
pub struct SigningCredentials {
    pub keystore: PathBuf,
    pub store_password: String,
    pub key_alias: String,
    pub key_password: String,
}

impl SigningCredentials {
    /// The SDK's well-known debug key
    pub fn debug(keystore: PathBuf) -> Self {
        Self {
            keystore,
            store_password: "android".to_string(),
            key_alias: "androiddebugkey".to_string(),
            key_password: "android".to_string(),
        }
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("keystore", &self.keystore)
            .field("key_alias", &self.key_alias)
            .finish_non_exhaustive()
    }
}

/// Supplies signing keys per variant
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` when no key is configured at all; `Err` when a key is
    /// configured but cannot be used. The packager refuses both.
    fn credentials(&self, variant: BuildVariant) -> Result<Option<SigningCredentials>, PackagingError>;
}

/// Has no keys; packaging with it fails
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn credentials(&self, _variant: BuildVariant) -> Result<Option<SigningCredentials>, PackagingError> {
        Ok(None)
    }
}

/// Release keys from `P4A_RELEASE_*` variables and the `[signing]` settings;
/// debug builds use the SDK debug keystore when present
pub struct EnvCredentialProvider {
    settings: SigningSettings,
    vars: BTreeMap<String, String>,
    debug_keystore: Option<PathBuf>,
}

impl EnvCredentialProvider {
    /// Snapshot of the process environment
    pub fn from_env(settings: SigningSettings) -> Self {
        Self::new(settings, std::env::vars())
    }

    pub fn new(settings: SigningSettings, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with("P4A_RELEASE_"))
            .collect();
        Self {
            settings,
            vars,
            debug_keystore: default_debug_keystore(),
        }
    }

    pub fn with_debug_keystore(mut self, keystore: Option<PathBuf>) -> Self {
        self.debug_keystore = keystore;
        self
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn release(&self) -> Result<Option<SigningCredentials>, PackagingError> {
        let keystore = match self.var(KEYSTORE_ENV) {
            Some(path) => PathBuf::from(path),
            None => match &self.settings.keystore {
                Some(path) => path.clone(),
                None => return Ok(None),
            },
        };
        if !keystore.is_file() {
            return Err(PackagingError::CredentialUnavailable(format!(
                "keystore {:?} does not exist",
                keystore
            )));
        }

        let key_alias = self
            .var(KEY_ALIAS_ENV)
            .map(str::to_string)
            .or_else(|| self.settings.key_alias.clone())
            .ok_or_else(|| {
                PackagingError::CredentialUnavailable(format!(
                    "no key alias; set {} or signing.key_alias",
                    KEY_ALIAS_ENV
                ))
            })?;
        let store_password = self.var(KEYSTORE_PASSWORD_ENV).ok_or_else(|| {
            PackagingError::CredentialUnavailable(format!("{} is not set", KEYSTORE_PASSWORD_ENV))
        })?;
        let key_password = self.var(KEY_PASSWORD_ENV).unwrap_or(store_password);

        Ok(Some(SigningCredentials {
            keystore,
            store_password: store_password.to_string(),
            key_alias,
            key_password: key_password.to_string(),
        }))
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self, variant: BuildVariant) -> Result<Option<SigningCredentials>, PackagingError> {
        match variant {
            BuildVariant::Release => self.release(),
            BuildVariant::Debug => Ok(self
                .debug_keystore
                .as_ref()
                .filter(|p| p.is_file())
                .map(|p| SigningCredentials::debug(p.clone()))),
        }
    }
}

/// `~/.android/debug.keystore`
pub fn default_debug_keystore() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".android").join("debug.keystore"))
}

/// Applies a signature to a packaged artifact
#[async_trait]
pub trait ArtifactSigner: Send + Sync {
    async fn sign(
        &self,
        input: &Path,
        output: &Path,
        credentials: &SigningCredentials,
        artifact: ArtifactType,
        toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError>;
}

/// `zipalign` then `apksigner` for APKs, `jarsigner` for bundles
pub struct ToolSigner;

impl ToolSigner {
    fn tool(toolchain: &ToolchainHandle, name: &str) -> Result<PathBuf, PackagingError> {
        toolchain
            .build_tool(name)
            .or_else(|| which::which(name).ok())
            .ok_or_else(|| PackagingError::Signing(format!("{} not found", name)))
    }

    async fn run(mut command: Command, what: &str) -> Result<(), PackagingError> {
        debug!("Running {:?}", command.as_std().get_program());
        let output = command
            .output()
            .await
            .map_err(|e| PackagingError::Signing(format!("cannot run {}: {}", what, e)))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PackagingError::Signing(format!("{}{}", stdout, stderr)));
        }
        Ok(())
    }

    async fn sign_apk(
        &self,
        input: &Path,
        output: &Path,
        creds: &SigningCredentials,
        toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError> {
        let apksigner = Self::tool(toolchain, "apksigner")?;
        let zipalign = Self::tool(toolchain, "zipalign")?;

        // apksigner requires an aligned input; v2+ signatures must be applied
        // after alignment or they are invalidated
        let aligned = output.with_extension("aligned");
        let mut cmd = Command::new(zipalign);
        cmd.args(["-f", "-p", "4"]).arg(input).arg(&aligned);
        Self::run(cmd, "zipalign").await?;

        let mut cmd = Command::new(apksigner);
        cmd.arg("sign")
            .arg("--ks")
            .arg(&creds.keystore)
            .args(["--ks-pass", &format!("env:{}", CHILD_STORE_PASS)])
            .args(["--ks-key-alias", &creds.key_alias])
            .args(["--key-pass", &format!("env:{}", CHILD_KEY_PASS)])
            .arg("--out")
            .arg(output)
            .arg(&aligned)
            .env(CHILD_STORE_PASS, &creds.store_password)
            .env(CHILD_KEY_PASS, &creds.key_password);
        let result = Self::run(cmd, "apksigner").await;
        tokio::fs::remove_file(&aligned).await.ok();
        result
    }

    async fn sign_bundle(
        &self,
        input: &Path,
        output: &Path,
        creds: &SigningCredentials,
    ) -> Result<(), PackagingError> {
        let jarsigner = which::which("jarsigner")
            .map_err(|_| PackagingError::Signing("jarsigner not found".to_string()))?;

        let mut cmd = Command::new(jarsigner);
        cmd.arg("-keystore")
            .arg(&creds.keystore)
            .args(["-storepass:env", CHILD_STORE_PASS])
            .args(["-keypass:env", CHILD_KEY_PASS])
            .args(["-digestalg", "SHA-256", "-sigalg", "SHA256withRSA"])
            .arg("-signedjar")
            .arg(output)
            .arg(input)
            .arg(&creds.key_alias)
            .env(CHILD_STORE_PASS, &creds.store_password)
            .env(CHILD_KEY_PASS, &creds.key_password);
        Self::run(cmd, "jarsigner").await
    }
}

#[async_trait]
impl ArtifactSigner for ToolSigner {
    async fn sign(
        &self,
        input: &Path,
        output: &Path,
        credentials: &SigningCredentials,
        artifact: ArtifactType,
        toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError> {
        info!("Signing {:?} with key {}", output, credentials.key_alias);
        match artifact {
            ArtifactType::Apk => self.sign_apk(input, output, credentials, toolchain).await,
            ArtifactType::Aab => self.sign_bundle(input, output, credentials).await,
        }
    }
}
