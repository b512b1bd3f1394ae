//! Artifact Inspection
//!
//! Reads a packaged `.apk`/`.aab` back: manifest, native libraries,
//! signature state and the build records written by the packager.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use apkforge_core::error::PackagingError;
use apkforge_manifest::{ArtifactType, PackagedManifest};

use crate::assembler::{BuildMetadata, METADATA_FILE};
use crate::packager::BUILD_INFO;

/// Native library in an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLib {
    pub abi: String,
    pub name: String,
    pub size: u64,
}

/// What an artifact contains
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub artifact: ArtifactType,
    pub size: u64,
    pub entries: usize,
    /// `None` when the manifest is binary XML or missing
    pub manifest: Option<PackagedManifest>,
    pub native_libs: Vec<NativeLib>,
    pub signed: bool,
    /// `META-INF/BUILD-INFO` fields
    pub build_info: BTreeMap<String, String>,
    pub metadata: Option<BuildMetadata>,
}

impl ArtifactInfo {
    /// ABIs with at least one native library, sorted
    pub fn abis(&self) -> Vec<String> {
        let mut abis: Vec<String> = self.native_libs.iter().map(|l| l.abi.clone()).collect();
        abis.sort();
        abis.dedup();
        abis
    }
}

/// Artifact reader
pub struct ArtifactInspector;

impl ArtifactInspector {
    pub fn inspect(path: &Path) -> Result<ArtifactInfo, PackagingError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut archive = ZipArchive::new(file)
            .map_err(|e| PackagingError::Compression(format!("not a package archive: {}", e)))?;

        let artifact = if archive.by_name("base/manifest/AndroidManifest.xml").is_ok() {
            ArtifactType::Aab
        } else {
            ArtifactType::Apk
        };
        let prefix = match artifact {
            ArtifactType::Apk => "",
            ArtifactType::Aab => "base/",
        };

        let mut info = ArtifactInfo {
            path: path.to_path_buf(),
            artifact,
            size,
            entries: archive.len(),
            manifest: None,
            native_libs: Vec::new(),
            signed: false,
            build_info: BTreeMap::new(),
            metadata: None,
        };

        for i in 0..archive.len() {
            let Ok(entry) = archive.by_index(i) else {
                continue;
            };
            let name = entry.name();
            if let Some(lib) = name.strip_prefix(prefix).and_then(|n| n.strip_prefix("lib/")) {
                if let Some((abi, file)) = lib.split_once('/') {
                    if file.ends_with(".so") {
                        info.native_libs.push(NativeLib {
                            abi: abi.to_string(),
                            name: file.to_string(),
                            size: entry.size(),
                        });
                    }
                }
            }
            if name.starts_with("META-INF/")
                && (name.ends_with(".RSA") || name.ends_with(".DSA") || name.ends_with(".EC"))
            {
                info.signed = true;
            }
        }

        let manifest_name = match artifact {
            ArtifactType::Apk => "AndroidManifest.xml",
            ArtifactType::Aab => "base/manifest/AndroidManifest.xml",
        };
        if let Some(xml) = read_text(&mut archive, manifest_name) {
            match PackagedManifest::from_xml(&xml) {
                Ok(manifest) => info.manifest = Some(manifest),
                Err(e) => debug!("Cannot read packaged manifest: {}", e),
            }
        }

        if let Some(text) = read_text(&mut archive, BUILD_INFO) {
            info.build_info = text
                .lines()
                .filter_map(|l| l.split_once(": "))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }

        let metadata_name = match artifact {
            ArtifactType::Apk => METADATA_FILE.to_string(),
            ArtifactType::Aab => format!("base/root/{}", METADATA_FILE),
        };
        if let Some(json) = read_text(&mut archive, &metadata_name) {
            info.metadata = serde_json::from_str(&json).ok();
        }

        if !info.signed && has_signing_block(path) {
            info.signed = true;
        }
        Ok(info)
    }

    /// Human-readable size
    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", bytes)
        }
    }
}

fn read_text<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut text = String::new();
    entry.read_to_string(&mut text).ok()?;
    Some(text)
}

/// Look for the v2+ signing block magic near the central directory
fn has_signing_block(path: &Path) -> bool {
    const MAGIC: &[u8] = b"APK Sig Block 42";
    const WINDOW: u64 = 64 * 1024;

    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return false;
    };
    let start = len.saturating_sub(WINDOW);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return false;
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return false;
    }
    buf.windows(MAGIC.len()).any(|w| w == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_inspect_apk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.apk");
        let manifest = br#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="org.example.app" android:versionCode="3" android:versionName="1.2"/>"#;
        write_zip(
            &path,
            &[
                ("AndroidManifest.xml", manifest),
                ("META-INF/BUILD-INFO", b"Build-Timestamp: 1980-01-01T00:00:00+00:00\nVariant: debug\n"),
                ("lib/arm64-v8a/libmain.so", b"\x7fELF"),
                ("lib/x86_64/libmain.so", b"\x7fELF"),
            ],
        );

        let info = ArtifactInspector::inspect(&path).unwrap();
        assert_eq!(info.artifact, ArtifactType::Apk);
        assert_eq!(info.abis(), vec!["arm64-v8a", "x86_64"]);
        assert!(!info.signed);
        assert_eq!(info.build_info["Variant"], "debug");
        let manifest = info.manifest.unwrap();
        assert_eq!(manifest.package, "org.example.app");
        assert_eq!(manifest.version_code, Some(3));
    }

    #[test]
    fn test_inspect_signed_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.aab");
        write_zip(
            &path,
            &[
                ("META-INF/UPLOAD.RSA", b"sig"),
                ("base/lib/armeabi-v7a/libmain.so", b"\x7fELF"),
                ("base/manifest/AndroidManifest.xml", b"\x03\x00\x08\x00"),
            ],
        );

        let info = ArtifactInspector::inspect(&path).unwrap();
        assert_eq!(info.artifact, ArtifactType::Aab);
        assert!(info.signed);
        assert!(info.manifest.is_none());
        assert_eq!(info.abis(), vec!["armeabi-v7a"]);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(ArtifactInspector::format_size(512), "512 bytes");
        assert_eq!(ArtifactInspector::format_size(1536), "1.50 KB");
    }
}
