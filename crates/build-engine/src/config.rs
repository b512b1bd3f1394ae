//! Build Configuration
//!
//! Per-invocation options layered over the pipeline configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use apkforge_core::Abi;

/// Environment variable fixing embedded timestamps
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// 1980-01-01T00:00:00Z, the earliest timestamp a zip entry can carry
pub const ZIP_EPOCH: i64 = 315_532_800;

/// Build variant (debug/release)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildVariant {
    #[default]
    Debug,
    Release,
}

impl BuildVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildVariant::Debug => "debug",
            BuildVariant::Release => "release",
        }
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(BuildVariant::Debug),
            "release" => Ok(BuildVariant::Release),
            other => Err(format!("unknown build variant '{}'", other)),
        }
    }
}

/// Options of one `build` invocation
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub variant: BuildVariant,
    /// Overrides the manifest's ABI list
    pub abis: Option<Vec<Abi>>,
    /// Forces reproducible output on top of the configuration
    pub reproducible: bool,
    /// Overrides `build.parallel_jobs`
    pub jobs: Option<usize>,
}

/// Timestamp for reproducible output: `SOURCE_DATE_EPOCH`, else 1980-01-01
pub fn reproducible_timestamp() -> i64 {
    std::env::var(SOURCE_DATE_EPOCH)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|t| t.max(ZIP_EPOCH))
        .unwrap_or(ZIP_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        assert_eq!("Release".parse::<BuildVariant>(), Ok(BuildVariant::Release));
        assert_eq!(BuildVariant::default().to_string(), "debug");
        assert!("profile".parse::<BuildVariant>().is_err());
    }

    #[test]
    fn test_reproducible_timestamp_floor() {
        assert!(reproducible_timestamp() >= ZIP_EPOCH);
    }
}
