//! Build Manifest Parser
//!
//! Turns descriptor text (INI, `[app]` section, buildozer key names) into a
//! validated [`BuildManifest`]. Nothing downstream sees raw key/value pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use apkforge_core::error::ManifestError;
use apkforge_core::Abi;
use configparser::ini::Ini;
use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::manifest::{ArtifactType, BuildManifest, ManifestFields, Orientation, PlatformTarget, SourceSpec};
use crate::permissions::{Permission, PermissionCatalog};
use crate::requirements::Requirement;

/// Section holding every recognized key
pub const APP_SECTION: &str = "app";

pub const DEFAULT_TARGET_API: u32 = 33;
pub const DEFAULT_MIN_API: u32 = 21;
pub const DEFAULT_NDK: &str = "25b";
pub const DEFAULT_ARCHS: &[Abi] = &[Abi::Arm64V8a, Abi::ArmeabiV7a];
pub const DEFAULT_INCLUDE_EXTS: &[&str] = &["py", "png", "jpg", "kv", "atlas"];
pub const DEFAULT_ENTRYPOINT: &str = "main.py";

const KNOWN_KEYS: &[&str] = &[
    "title",
    "package.name",
    "package.domain",
    "version",
    "android.numeric_version",
    "source.dir",
    "source.include_exts",
    "source.exclude_dirs",
    "source.exclude_patterns",
    "source.entrypoint",
    "requirements",
    "orientation",
    "fullscreen",
    "android.permissions",
    "android.api",
    "android.minapi",
    "android.ndk_api",
    "android.sdk",
    "android.ndk",
    "android.archs",
    "android.release_artifact",
    "android.debug_artifact",
    "icon.filename",
    "presplash.filename",
];

/// Manifest plus the non-fatal findings collected while loading it
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: BuildManifest,
    pub warnings: Vec<String>,
}

/// Manifest parser
pub struct ManifestParser;

impl ManifestParser {
    /// Parse a manifest file from path
    pub async fn load_file(path: impl AsRef<Path>) -> Result<LoadedManifest, ManifestError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ManifestError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        debug!("Loaded manifest text from {:?}", path);
        Self::parse_str(&content)
    }

    /// Parse manifest from descriptor text
    pub fn parse_str(text: &str) -> Result<LoadedManifest, ManifestError> {
        let mut ini = Ini::new_cs();
        // Comments only start a line; '#' and ';' inside values are kept
        let mut options = ini.defaults();
        options.comment_symbols = vec!['#', ';'];
        options.enable_inline_comments = false;
        ini.load_defaults(options);
        let mut sections = ini.read(text.to_string()).map_err(ManifestError::Syntax)?;

        let app = sections
            .remove(APP_SECTION)
            .ok_or_else(|| ManifestError::MissingSection(APP_SECTION.to_string()))?;

        for key in app.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                debug!("Ignoring unrecognized manifest key '{}'", key);
            }
        }

        let section = Section { values: &app };
        let mut warnings = Vec::new();

        let target_api = section.u32_or("android.api", DEFAULT_TARGET_API)?;
        let min_api = section.u32_or("android.minapi", DEFAULT_MIN_API)?;
        let ndk_api = section.u32_or("android.ndk_api", min_api)?;
        let platform = PlatformTarget {
            target_api,
            min_api,
            ndk_api,
            sdk_version: section
                .get("android.sdk")
                .map(str::to_string)
                .unwrap_or_else(|| target_api.to_string()),
            ndk_version: section.get("android.ndk").unwrap_or(DEFAULT_NDK).to_string(),
        };

        let source = SourceSpec {
            dir: PathBuf::from(section.get("source.dir").unwrap_or(".")),
            include_exts: section
                .list("source.include_exts")
                .unwrap_or_else(|| DEFAULT_INCLUDE_EXTS.iter().map(|s| s.to_string()).collect()),
            exclude_dirs: section.list("source.exclude_dirs").unwrap_or_default(),
            exclude_patterns: section.list("source.exclude_patterns").unwrap_or_default(),
            entrypoint: section
                .get("source.entrypoint")
                .unwrap_or(DEFAULT_ENTRYPOINT)
                .to_string(),
        };

        let requirements = section
            .list("requirements")
            .unwrap_or_default()
            .iter()
            .map(|r| {
                Requirement::parse(r).map_err(|e| ManifestError::InvalidValue {
                    key: "requirements".into(),
                    value: e.input,
                    reason: e.reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let permissions = Self::parse_permissions(&section, &mut warnings)?;

        let archs = match section.list("android.archs") {
            Some(names) => names
                .iter()
                .map(|n| {
                    Abi::from_str(n).map_err(|e| ManifestError::InvalidValue {
                        key: "android.archs".into(),
                        value: n.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<IndexSet<_>, _>>()?
                .into_iter()
                .collect(),
            None => DEFAULT_ARCHS.to_vec(),
        };

        let fields = ManifestFields {
            title: section.required("title")?.to_string(),
            package_name: section.required("package.name")?.to_string(),
            package_domain: section.required("package.domain")?.to_string(),
            version: section.required("version")?.to_string(),
            numeric_version: section.optional_u32("android.numeric_version")?,
            source,
            requirements,
            orientation: match section.get("orientation") {
                Some(value) => value.parse()?,
                None => Orientation::Portrait,
            },
            fullscreen: section.bool_or("fullscreen", false)?,
            permissions,
            platform,
            archs,
            release_artifact: section.artifact_or("android.release_artifact", ArtifactType::Aab)?,
            debug_artifact: section.artifact_or("android.debug_artifact", ArtifactType::Apk)?,
            icon: section.get("icon.filename").map(PathBuf::from),
            presplash: section.get("presplash.filename").map(PathBuf::from),
        };

        let manifest = fields.build()?;
        debug!(
            "Parsed manifest for {} ({} requirements, {} permissions)",
            manifest.package_id(),
            manifest.requirements().len(),
            manifest.permissions().len()
        );
        Ok(LoadedManifest { manifest, warnings })
    }

    fn parse_permissions(
        section: &Section<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Permission>, ManifestError> {
        let catalog = PermissionCatalog::new();
        let mut seen = IndexSet::new();

        for entry in section.list("android.permissions").unwrap_or_default() {
            let permission = Permission::parse(&entry)?;
            if !catalog.is_known(&permission.name) {
                warn!(
                    "Unknown permission '{}', passing it through unchanged",
                    permission.name
                );
                warnings.push(format!("unknown permission '{}'", permission.name));
            }
            seen.insert(permission);
        }
        Ok(seen.into_iter().collect())
    }
}

/// Typed accessors over the raw `[app]` key/value map
struct Section<'a> {
    values: &'a HashMap<String, Option<String>>,
}

impl<'a> Section<'a> {
    /// Non-empty value for `key`
    fn get(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(key)
            .and_then(|v| v.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<&'a str, ManifestError> {
        self.get(key).ok_or_else(|| ManifestError::MissingField {
            section: APP_SECTION.to_string(),
            key: key.to_string(),
        })
    }

    /// Comma-separated list, `None` when the key is absent
    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    fn optional_u32(&self, key: &str) -> Result<Option<u32>, ManifestError> {
        self.get(key)
            .map(|v| {
                v.parse::<u32>().map_err(|_| ManifestError::InvalidValue {
                    key: key.to_string(),
                    value: v.to_string(),
                    reason: "expected a non-negative integer".into(),
                })
            })
            .transpose()
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32, ManifestError> {
        Ok(self.optional_u32(key)?.unwrap_or(default))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ManifestError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ManifestError::InvalidValue {
                    key: key.to_string(),
                    value: v.to_string(),
                    reason: "expected 0/1 or true/false".into(),
                }),
            },
        }
    }

    fn artifact_or(&self, key: &str, default: ArtifactType) -> Result<ArtifactType, ManifestError> {
        self.get(key).map(str::parse).unwrap_or(Ok(default))
    }
}
