//! Build Manifest Data Structures
//!
//! The typed, validated form of an application descriptor. Values are only
//! produced by [`ManifestParser`](crate::parser::ManifestParser) and never
//! change afterwards; downstream stages read them through accessors.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use apkforge_core::error::ManifestError;
use apkforge_core::Abi;
use serde::Serialize;

use crate::permissions::Permission;
use crate::requirements::Requirement;

/// Output artifact selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    /// Directly installable package
    Apk,
    /// Store-submission bundle
    Aab,
}

impl ArtifactType {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactType::Apk => "apk",
            ArtifactType::Aab => "aab",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArtifactType {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apk" => Ok(ArtifactType::Apk),
            "aab" => Ok(ArtifactType::Aab),
            _ => Err(ManifestError::UnknownArtifactType(s.trim().to_string())),
        }
    }
}

/// Screen orientation / display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum Orientation {
    Portrait,
    Landscape,
    PortraitReverse,
    LandscapeReverse,
    SensorPortrait,
    SensorLandscape,
    All,
    User,
}

impl Orientation {
    /// Token used in the descriptor
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::PortraitReverse => "portrait-reverse",
            Orientation::LandscapeReverse => "landscape-reverse",
            Orientation::SensorPortrait => "sensorPortrait",
            Orientation::SensorLandscape => "sensorLandscape",
            Orientation::All => "all",
            Orientation::User => "user",
        }
    }

    /// `android:screenOrientation` value
    pub fn android_value(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::PortraitReverse => "reversePortrait",
            Orientation::LandscapeReverse => "reverseLandscape",
            Orientation::SensorPortrait => "sensorPortrait",
            Orientation::SensorLandscape => "sensorLandscape",
            Orientation::All => "fullSensor",
            Orientation::User => "user",
        }
    }

    /// First platform API level that understands this value
    pub fn required_api(&self) -> u32 {
        match self {
            Orientation::Portrait | Orientation::Landscape | Orientation::User => 1,
            _ => 9,
        }
    }
}

impl FromStr for Orientation {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let orientation = match value {
            "portrait" => Orientation::Portrait,
            "landscape" => Orientation::Landscape,
            "portrait-reverse" | "reversePortrait" => Orientation::PortraitReverse,
            "landscape-reverse" | "reverseLandscape" => Orientation::LandscapeReverse,
            "sensorPortrait" => Orientation::SensorPortrait,
            "sensorLandscape" => Orientation::SensorLandscape,
            "all" | "fullSensor" => Orientation::All,
            "user" => Orientation::User,
            _ => {
                return Err(ManifestError::InvalidValue {
                    key: "orientation".into(),
                    value: value.into(),
                    reason: "unknown orientation".into(),
                })
            }
        };
        Ok(orientation)
    }
}

impl From<Orientation> for String {
    fn from(o: Orientation) -> Self {
        o.as_str().to_string()
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the application sources live and which of them ship
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSpec {
    /// Source directory, relative to the manifest unless absolute
    pub dir: PathBuf,
    /// File extensions to include, without the dot
    pub include_exts: Vec<String>,
    /// Directory names excluded anywhere in the tree
    pub exclude_dirs: Vec<String>,
    /// Glob patterns (relative to `dir`) excluded from the package
    pub exclude_patterns: Vec<String>,
    /// Entry script the runtime starts
    pub entrypoint: String,
}

impl SourceSpec {
    /// Check whether a file name passes the extension filter
    pub fn includes_extension(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((_, ext)) => self
                .include_exts
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// Platform API levels and toolchain versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformTarget {
    pub target_api: u32,
    pub min_api: u32,
    /// API level native code is compiled against
    pub ndk_api: u32,
    /// SDK platform version
    pub sdk_version: String,
    /// NDK release, e.g. `25b`
    pub ndk_version: String,
}

/// Validated build manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildManifest {
    title: String,
    package_name: String,
    package_domain: String,
    version: String,
    numeric_version: Option<u32>,
    source: SourceSpec,
    requirements: Vec<Requirement>,
    orientation: Orientation,
    fullscreen: bool,
    permissions: Vec<Permission>,
    platform: PlatformTarget,
    archs: Vec<Abi>,
    release_artifact: ArtifactType,
    debug_artifact: ArtifactType,
    icon: Option<PathBuf>,
    presplash: Option<PathBuf>,
}

/// Field values collected by the parser, validated on [`ManifestFields::build`]
pub(crate) struct ManifestFields {
    pub title: String,
    pub package_name: String,
    pub package_domain: String,
    pub version: String,
    pub numeric_version: Option<u32>,
    pub source: SourceSpec,
    pub requirements: Vec<Requirement>,
    pub orientation: Orientation,
    pub fullscreen: bool,
    pub permissions: Vec<Permission>,
    pub platform: PlatformTarget,
    pub archs: Vec<Abi>,
    pub release_artifact: ArtifactType,
    pub debug_artifact: ArtifactType,
    pub icon: Option<PathBuf>,
    pub presplash: Option<PathBuf>,
}

impl ManifestFields {
    pub(crate) fn build(self) -> Result<BuildManifest, ManifestError> {
        let platform = &self.platform;
        if platform.min_api > platform.target_api {
            return Err(ManifestError::ApiLevelOrder {
                min: platform.min_api,
                target: platform.target_api,
            });
        }
        if platform.ndk_api > platform.min_api {
            return Err(ManifestError::InvalidValue {
                key: "android.ndk_api".into(),
                value: platform.ndk_api.to_string(),
                reason: format!("must not exceed android.minapi ({})", platform.min_api),
            });
        }
        if self.archs.is_empty() {
            return Err(ManifestError::InvalidValue {
                key: "android.archs".into(),
                value: String::new(),
                reason: "at least one ABI is required".into(),
            });
        }

        let package_id = format!("{}.{}", self.package_domain, self.package_name);
        validate_package_id(&package_id)?;

        Ok(BuildManifest {
            title: self.title,
            package_name: self.package_name,
            package_domain: self.package_domain,
            version: self.version,
            numeric_version: self.numeric_version,
            source: self.source,
            requirements: self.requirements,
            orientation: self.orientation,
            fullscreen: self.fullscreen,
            permissions: self.permissions,
            platform: self.platform,
            archs: self.archs,
            release_artifact: self.release_artifact,
            debug_artifact: self.debug_artifact,
            icon: self.icon,
            presplash: self.presplash,
        })
    }
}

/// Check a dot-separated Java-style package identifier
pub fn validate_package_id(id: &str) -> Result<(), ManifestError> {
    let malformed = |reason: &str| ManifestError::MalformedIdentifier {
        value: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(malformed("identifier is empty"));
    }
    for segment in id.split('.') {
        if segment.is_empty() {
            return Err(malformed("empty segment"));
        }
        let mut chars = segment.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(malformed(&format!(
                "segment '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                segment
            )));
        }
    }
    Ok(())
}

impl BuildManifest {
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn package_domain(&self) -> &str {
        &self.package_domain
    }

    /// Fully qualified package id (`domain.name`)
    pub fn package_id(&self) -> String {
        format!("{}.{}", self.package_domain, self.package_name)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Explicit `android.numeric_version`, if declared
    pub fn numeric_version(&self) -> Option<u32> {
        self.numeric_version
    }

    /// Integer version code: the declared one, else derived from the version string
    pub fn version_code(&self) -> u32 {
        self.numeric_version.unwrap_or_else(|| {
            let mut parts = self
                .version
                .split('.')
                .map(|p| p.trim().parse::<u32>().unwrap_or(0));
            let major = parts.next().unwrap_or(0);
            let minor = parts.next().unwrap_or(0);
            let patch = parts.next().unwrap_or(0);
            major
                .saturating_mul(1_000_000)
                .saturating_add(minor.min(999) * 1_000 + patch.min(999))
                .max(1)
        })
    }

    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    /// Source directory resolved against the manifest's own directory
    pub fn source_dir(&self, manifest_dir: &Path) -> PathBuf {
        if self.source.dir.is_absolute() {
            self.source.dir.clone()
        } else {
            manifest_dir.join(&self.source.dir)
        }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn fullscreen(&self) -> bool {
        self.fullscreen
    }

    /// Permissions in declaration order, without duplicates
    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    pub fn platform(&self) -> &PlatformTarget {
        &self.platform
    }

    pub fn archs(&self) -> &[Abi] {
        &self.archs
    }

    pub fn release_artifact(&self) -> ArtifactType {
        self.release_artifact
    }

    pub fn debug_artifact(&self) -> ArtifactType {
        self.debug_artifact
    }

    pub fn icon(&self) -> Option<&Path> {
        self.icon.as_deref()
    }

    pub fn presplash(&self) -> Option<&Path> {
        self.presplash.as_deref()
    }
}
