//! Content fingerprints
//!
//! SHA-256 digests used as cache keys and for archive verification.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Incremental fingerprint over named fields.
///
/// Every field is length-prefixed so `("ab", "c")` and `("a", "bc")` never
/// collide.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.write(domain.as_bytes());
        builder
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    pub fn field(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.write(name.as_bytes());
        self.write(value.as_ref());
        self
    }

    /// Hex-encoded digest
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_boundaries_matter() {
        let a = FingerprintBuilder::new("t").field("x", "ab").field("y", "c").finish();
        let b = FingerprintBuilder::new("t").field("x", "a").field("y", "bc").finish();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_deterministic() {
        let make = || FingerprintBuilder::new("store").field("name", "libffi").finish();
        assert_eq!(make(), make());
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"hello"));
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
