//! Target ABIs
//!
//! Android processor variants a native artifact can be compiled for.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Abi {
    Arm64V8a,
    ArmeabiV7a,
    X86,
    X86_64,
}

impl Abi {
    /// Get the NDK clang triple for this ABI
    pub fn ndk_triple(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64-linux-android",
            Abi::ArmeabiV7a => "armv7a-linux-androideabi",
            Abi::X86 => "i686-linux-android",
            Abi::X86_64 => "x86_64-linux-android",
        }
    }

    /// Get the binutils-style triple (used for `TARGET_TRIPLE`)
    pub fn tool_triple(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "aarch64-linux-android",
            Abi::ArmeabiV7a => "arm-linux-androideabi",
            Abi::X86 => "i686-linux-android",
            Abi::X86_64 => "x86_64-linux-android",
        }
    }

    /// Get the ABI name as used in the package `lib/` directory
    pub fn abi_name(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "arm64-v8a",
            Abi::ArmeabiV7a => "armeabi-v7a",
            Abi::X86 => "x86",
            Abi::X86_64 => "x86_64",
        }
    }

    /// Get all supported ABIs
    pub fn all() -> &'static [Abi] {
        &[Abi::Arm64V8a, Abi::ArmeabiV7a, Abi::X86, Abi::X86_64]
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abi_name())
    }
}

/// Error returned for an unrecognized ABI name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ABI '{0}' (expected one of arm64-v8a, armeabi-v7a, x86, x86_64)")]
pub struct UnknownAbi(pub String);

impl FromStr for Abi {
    type Err = UnknownAbi;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "arm64-v8a" | "aarch64-linux-android" => Ok(Abi::Arm64V8a),
            "armeabi-v7a" | "armv7a-linux-androideabi" | "arm-linux-androideabi" => {
                Ok(Abi::ArmeabiV7a)
            }
            "x86" | "i686-linux-android" => Ok(Abi::X86),
            "x86_64" | "x86_64-linux-android" => Ok(Abi::X86_64),
            other => Err(UnknownAbi(other.to_string())),
        }
    }
}

impl TryFrom<String> for Abi {
    type Error = UnknownAbi;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Abi> for String {
    fn from(abi: Abi) -> Self {
        abi.abi_name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_triples() {
        assert_eq!(Abi::Arm64V8a.ndk_triple(), "aarch64-linux-android");
        assert_eq!(Abi::ArmeabiV7a.ndk_triple(), "armv7a-linux-androideabi");
        assert_eq!(Abi::ArmeabiV7a.abi_name(), "armeabi-v7a");
    }

    #[test]
    fn test_abi_from_str() {
        assert_eq!("arm64-v8a".parse::<Abi>(), Ok(Abi::Arm64V8a));
        assert_eq!(" x86_64 ".parse::<Abi>(), Ok(Abi::X86_64));
        assert!("mips".parse::<Abi>().is_err());
    }

    #[test]
    fn test_abi_serde_uses_names() {
        let json = serde_json::to_string(&vec![Abi::ArmeabiV7a, Abi::Arm64V8a]).unwrap();
        assert_eq!(json, r#"["armeabi-v7a","arm64-v8a"]"#);
        let back: Vec<Abi> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Abi::ArmeabiV7a, Abi::Arm64V8a]);
    }
}
