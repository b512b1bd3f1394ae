//! Dependency recipes
//!
//! A recipe describes one runtime dependency: its releases, where each
//! release's sources come from, what it depends on and, for native code, the
//! script that cross-compiles it. Recipes are TOML files in the recipes
//! directory:
//!
//! ```toml
//! name = "libffi"
//! kind = "native"
//! abis = ["arm64-v8a", "armeabi-v7a"]
//! depends = []
//! script = "./configure --host=$TARGET_TRIPLE --prefix=$PREFIX && make install"
//!
//! [[release]]
//! version = "3.4.4"
//! url = "https://example.org/libffi-3.4.4.tar.gz"
//! sha256 = "..."
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Deserialize;
use tracing::{debug, info};

use apkforge_core::error::DependencyError;
use apkforge_core::Abi;
use apkforge_manifest::requirements::{normalize_name, parse_version};
use apkforge_manifest::Requirement;

/// Whether a dependency carries native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeKind {
    /// Cross-compiled once per ABI
    Native,
    /// Shipped verbatim, ABI independent
    Pure,
}

/// Where a release's sources come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSource {
    Url { url: String, sha256: Option<String> },
    /// Local directory or archive
    Path(PathBuf),
}

/// One published release of a dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub source: ReleaseSource,
}

/// A validated recipe
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub kind: RecipeKind,
    /// Releases, newest first
    pub releases: Vec<Release>,
    pub depends: Vec<Requirement>,
    /// Supported ABIs; `None` means all
    pub abis: Option<Vec<Abi>>,
    pub script: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    name: String,
    kind: RecipeKind,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    abis: Option<Vec<String>>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default, rename = "release")]
    releases: Vec<ReleaseFile>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseFile {
    version: String,
    url: Option<String>,
    sha256: Option<String>,
    path: Option<PathBuf>,
}

impl Recipe {
    /// Parse recipe text; relative `path` sources resolve against `base_dir`
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, DependencyError> {
        let file: RecipeFile = toml::from_str(text).map_err(|e| DependencyError::InvalidRecipe {
            name: "<unnamed>".to_string(),
            reason: e.to_string(),
        })?;
        let name = normalize_name(&file.name);
        let invalid = |reason: String| DependencyError::InvalidRecipe {
            name: name.clone(),
            reason,
        };

        let depends = file
            .depends
            .iter()
            .map(|d| Requirement::parse(d).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let abis = match file.abis {
            Some(list) => Some(
                list.iter()
                    .map(|a| a.parse::<Abi>().map_err(|e| invalid(e.to_string())))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let mut releases = Vec::with_capacity(file.releases.len());
        for release in file.releases {
            let version = parse_version(&release.version)
                .ok_or_else(|| invalid(format!("malformed version '{}'", release.version)))?;
            let source = match (release.url, release.path) {
                (Some(url), None) => ReleaseSource::Url {
                    url,
                    sha256: release.sha256,
                },
                (None, Some(path)) if path.is_absolute() => ReleaseSource::Path(path),
                (None, Some(path)) => ReleaseSource::Path(base_dir.join(path)),
                _ => {
                    return Err(invalid(format!(
                        "release {} needs exactly one of 'url' or 'path'",
                        version
                    )))
                }
            };
            releases.push(Release { version, source });
        }
        if releases.is_empty() {
            return Err(invalid("no releases".to_string()));
        }
        releases.sort_by(|a, b| b.version.cmp(&a.version));
        releases.dedup_by(|a, b| a.version == b.version);

        if file.kind == RecipeKind::Native && file.script.is_none() {
            return Err(invalid("native recipes need a build 'script'".to_string()));
        }
        if depends.iter().any(|d| d.name() == name) {
            return Err(invalid("recipe depends on itself".to_string()));
        }

        Ok(Self {
            name,
            kind: file.kind,
            releases,
            depends,
            abis,
            script: file.script,
        })
    }

    pub fn is_native(&self) -> bool {
        self.kind == RecipeKind::Native
    }

    pub fn supports_abi(&self, abi: Abi) -> bool {
        match (&self.kind, &self.abis) {
            (RecipeKind::Pure, _) | (_, None) => true,
            (RecipeKind::Native, Some(abis)) => abis.contains(&abi),
        }
    }

    /// Newest release accepted by every requirement
    pub fn newest_matching<'a>(
        &self,
        requirements: impl IntoIterator<Item = &'a Requirement> + Clone,
    ) -> Option<&Release> {
        self.releases
            .iter()
            .find(|r| requirements.clone().into_iter().all(|req| req.matches(&r.version)))
    }
}

/// All known recipes by normalized name
#[derive(Debug, Clone, Default)]
pub struct RecipeBook {
    recipes: BTreeMap<String, Recipe>,
}

impl RecipeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` in `dir`. A missing directory is an empty book.
    pub fn load_dir(dir: &Path) -> Result<Self, DependencyError> {
        let mut book = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("No recipes directory at {:?}", dir);
                return Ok(book);
            }
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
            .collect();
        files.sort();

        for file in files {
            let text = std::fs::read_to_string(&file).map_err(|e| DependencyError::InvalidRecipe {
                name: file.display().to_string(),
                reason: e.to_string(),
            })?;
            book.insert(Recipe::parse(&text, dir)?);
        }
        info!("Loaded {} recipe(s) from {:?}", book.len(), dir);
        Ok(book)
    }

    /// Add or replace a recipe
    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn get(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}
