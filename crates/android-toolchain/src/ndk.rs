//! NDK versions and per-ABI tools
//!
//! Release names (`25b`, `r25b`) and package revisions (`25.1.8937393`) both
//! map onto [`NdkVersion`]. Each release supports a fixed window of platform
//! API levels.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use apkforge_core::error::ToolchainError;
use apkforge_core::Abi;

/// A parsed NDK release
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NdkVersion {
    pub major: u32,
    /// Letter suffix as a number: `r25` is 0, `r25b` is 1
    pub minor: u32,
}

impl NdkVersion {
    /// Release name, e.g. `r25b`
    pub fn release_name(&self) -> String {
        if self.minor == 0 {
            format!("r{}", self.major)
        } else {
            // minor is bounded by 25 when parsed from a letter
            let letter = (b'a' + self.minor.min(25) as u8) as char;
            format!("r{}{}", self.major, letter)
        }
    }

    /// Cache directory name, e.g. `25b`
    pub fn dir_name(&self) -> String {
        self.release_name().trim_start_matches('r').to_string()
    }

    /// Platform API levels this release can target, `None` for unknown releases
    pub fn supported_api_range(&self) -> Option<RangeInclusive<u32>> {
        let range = match self.major {
            21 | 22 => 16..=30,
            23 => 16..=31,
            24 => 19..=32,
            25 => 19..=33,
            26 => 21..=34,
            27 | 28 => 21..=35,
            _ => return None,
        };
        Some(range)
    }

    /// Check a `source.properties` `Pkg.Revision` against this release
    pub fn matches_revision(&self, revision: &str) -> bool {
        revision
            .parse::<NdkVersion>()
            .map(|v| v == *self)
            .unwrap_or(false)
    }
}

impl FromStr for NdkVersion {
    type Err = ToolchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let invalid = || ToolchainError::Incompatible(format!("unrecognized NDK version '{}'", s.trim()));
        let number = |t: &str| -> Result<u32, ToolchainError> {
            if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            t.parse().map_err(|_| invalid())
        };

        // Package revision: 25.1.8937393
        if text.contains('.') {
            let mut parts = text.split('.');
            let major = number(parts.next().unwrap_or_default())?;
            let minor = number(parts.next().unwrap_or_default())?;
            for rest in parts {
                number(rest)?;
            }
            return Ok(Self { major, minor });
        }

        // Release name: r25b, 25b, r26
        let release = text.strip_prefix('r').unwrap_or(&text);
        let (digits, letter) = match release.as_bytes().last() {
            Some(b) if b.is_ascii_lowercase() => (&release[..release.len() - 1], Some(*b)),
            _ => (release, None),
        };
        Ok(Self {
            major: number(digits)?,
            minor: letter.map(|b| u32::from(b - b'a')).unwrap_or(0),
        })
    }
}

impl fmt::Display for NdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.release_name())
    }
}

/// Detect the host platform tag used in NDK prebuilt paths
pub fn host_tag() -> &'static str {
    if cfg!(windows) {
        "windows-x86_64"
    } else if cfg!(target_os = "macos") {
        "darwin-x86_64"
    } else {
        "linux-x86_64"
    }
}

/// NDK tools for one ABI and API level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdkTools {
    pub abi: Abi,
    pub clang: PathBuf,
    pub clangxx: PathBuf,
    pub ar: PathBuf,
    pub ranlib: PathBuf,
    pub strip: PathBuf,
    pub linker: PathBuf,
    pub sysroot: PathBuf,
}

impl NdkTools {
    pub fn new(ndk_root: &Path, host_tag: &str, abi: Abi, api_level: u32) -> Self {
        let llvm = ndk_root
            .join("toolchains")
            .join("llvm")
            .join("prebuilt")
            .join(host_tag);
        let bin_dir = llvm.join("bin");
        let triple = abi.ndk_triple();

        let exe_suffix = if cfg!(windows) { ".exe" } else { "" };
        let cmd_suffix = if cfg!(windows) { ".cmd" } else { "" };

        // Clang wrappers carry the target API in their name
        let clang = bin_dir.join(format!("{}{}-clang{}", triple, api_level, cmd_suffix));
        let clangxx = bin_dir.join(format!("{}{}-clang++{}", triple, api_level, cmd_suffix));

        Self {
            abi,
            linker: clang.clone(),
            clang,
            clangxx,
            ar: bin_dir.join(format!("llvm-ar{}", exe_suffix)),
            ranlib: bin_dir.join(format!("llvm-ranlib{}", exe_suffix)),
            strip: bin_dir.join(format!("llvm-strip{}", exe_suffix)),
            sysroot: llvm.join("sysroot"),
        }
    }
}
