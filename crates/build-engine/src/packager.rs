//! Artifact packaging
//!
//! Links the assembled tree's resources, zips it into an `.apk` or `.aab`,
//! records digests and build information under `META-INF/`, then signs it.
//! Every stage writes to a file unique to this call; only the signed result
//! is moved to its final name.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Datelike, Timelike, Utc};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use apkforge_core::error::PackagingError;
use apkforge_core::fingerprint::sha256_file;
use apkforge_core::{TOOL_NAME, VERSION};
use apkforge_manifest::ArtifactType;
use apkforge_toolchain::{ToolchainHandle, MIN_BUNDLE_API};

use crate::assembler::PackageTree;
use crate::config::{reproducible_timestamp, BuildVariant};
use crate::linker::{Aapt2Linker, ResourceLinker};
use crate::signing::{ArtifactSigner, CredentialProvider, KEYSTORE_ENV};

pub const MANIFEST_MF: &str = "META-INF/MANIFEST.MF";
pub const BUILD_INFO: &str = "META-INF/BUILD-INFO";
/// Bundle-level configuration read by bundletool
pub const BUNDLE_CONFIG: &str = "BundleConfig.pb";
/// bundletool release the bundle layout targets
pub const BUNDLETOOL_VERSION: &str = "1.15.6";

/// Native libraries are page aligned so they can be mapped in place
const NATIVE_LIB_ALIGNMENT: u16 = 4096;
const STORED_ALIGNMENT: u16 = 4;

/// Final build output; always signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub artifact: ArtifactType,
    pub size: u64,
    pub sha256: String,
}

enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

struct Entry {
    name: String,
    source: EntrySource,
}

/// Produces signed artifacts
pub struct ArtifactPackager {
    output_dir: PathBuf,
    reproducible: bool,
    credentials: Arc<dyn CredentialProvider>,
    signer: Arc<dyn ArtifactSigner>,
    linker: Arc<dyn ResourceLinker>,
}

impl ArtifactPackager {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        credentials: Arc<dyn CredentialProvider>,
        signer: Arc<dyn ArtifactSigner>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            reproducible: false,
            credentials,
            signer,
            linker: Arc::new(Aapt2Linker),
        }
    }

    pub fn with_reproducible(mut self, reproducible: bool) -> Self {
        self.reproducible = reproducible;
        self
    }

    pub fn with_linker(mut self, linker: Arc<dyn ResourceLinker>) -> Self {
        self.linker = linker;
        self
    }

    /// Package `tree`; the tree directory is removed afterwards
    pub async fn package(
        &self,
        tree: PackageTree,
        artifact: ArtifactType,
        variant: BuildVariant,
        toolchain: &ToolchainHandle,
    ) -> Result<PackagedArtifact, PackagingError> {
        if artifact == ArtifactType::Aab {
            check_bundle_support(toolchain)?;
        }

        let credentials = self
            .credentials
            .credentials(variant)?
            .ok_or_else(|| PackagingError::CredentialUnavailable(missing_key(variant)))?;

        let timestamp = if self.reproducible {
            reproducible_timestamp()
        } else {
            Utc::now().timestamp()
        };

        self.linker.link(tree.root(), artifact, toolchain).await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let stem = format!("{}-{}-{}", tree.package_id, tree.version_name, variant);
        let extension = artifact.extension();

        let build_info = build_info(&tree, variant, timestamp)?;
        let unsigned = scratch_file(&self.output_dir, &stem, &format!("unsigned.{}", extension))?;
        let out = unsigned.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let written = write_archive(tree.root(), &out, artifact, build_info, timestamp);
            if let Err(e) = tree.close() {
                debug!("Cannot remove package tree: {}", e);
            }
            written
        })
        .await
        .map_err(|e| PackagingError::Io(e.to_string()))??;

        let signed = scratch_file(&self.output_dir, &stem, extension)?;
        self.signer
            .sign(&unsigned, &signed, &credentials, artifact, toolchain)
            .await?;
        drop(unsigned);

        let path = self.output_dir.join(format!("{}.{}", stem, extension));
        signed.persist(&path).map_err(|e| PackagingError::from(e.error))?;

        let digest_path = path.clone();
        let sha256 = tokio::task::spawn_blocking(move || sha256_file(&digest_path))
            .await
            .map_err(|e| PackagingError::Io(e.to_string()))??;
        let size = tokio::fs::metadata(&path).await?.len();
        info!("Packaged {:?} ({} bytes)", path, size);

        Ok(PackagedArtifact {
            path,
            artifact,
            size,
            sha256,
        })
    }
}

/// Bundles need an SDK platform with split APK support
fn check_bundle_support(toolchain: &ToolchainHandle) -> Result<(), PackagingError> {
    let digits: String = toolchain
        .sdk_version
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    match digits.parse::<u32>() {
        Ok(platform) if platform >= MIN_BUNDLE_API => Ok(()),
        _ => Err(PackagingError::UnsupportedArtifact {
            artifact: ArtifactType::Aab.to_string(),
            reason: format!(
                "SDK platform {} predates split APK support (API {})",
                toolchain.sdk_version, MIN_BUNDLE_API
            ),
        }),
    }
}

fn missing_key(variant: BuildVariant) -> String {
    match variant {
        BuildVariant::Release => format!("no release key; set {} or signing.keystore", KEYSTORE_ENV),
        BuildVariant::Debug => "no debug keystore; create ~/.android/debug.keystore with keytool \
             (alias androiddebugkey, password android)"
            .to_string(),
    }
}

/// A file next to the final output, removed on drop unless persisted
fn scratch_file(dir: &Path, stem: &str, suffix: &str) -> Result<TempPath, PackagingError> {
    Ok(tempfile::Builder::new()
        .prefix(&format!(".{}.", stem))
        .suffix(&format!(".{}", suffix))
        .tempfile_in(dir)?
        .into_temp_path())
}

/// Hand-encoded `BundleConfig { bundletool: Bundletool { version } }`
fn bundle_config(version: &str) -> Vec<u8> {
    // Bundletool.version is field 2, BundleConfig.bundletool is field 1
    let mut bundletool = vec![0x12, version.len() as u8];
    bundletool.extend_from_slice(version.as_bytes());
    let mut config = vec![0x0a, bundletool.len() as u8];
    config.extend(bundletool);
    config
}

fn build_info(tree: &PackageTree, variant: BuildVariant, timestamp: i64) -> Result<Vec<u8>, PackagingError> {
    let when = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| PackagingError::Compression(format!("invalid timestamp {}", timestamp)))?;
    let abis = tree
        .abis
        .iter()
        .map(|a| a.abi_name())
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!(
        "Build-Timestamp: {}\nCreated-By: {} {}\nPackage: {}\nVersion-Name: {}\nVersion-Code: {}\nVariant: {}\nMin-Api: {}\nAbis: {}\n",
        when.to_rfc3339(),
        TOOL_NAME,
        VERSION,
        tree.package_id,
        tree.version_name,
        tree.version_code,
        variant,
        tree.min_api,
        abis,
    )
    .into_bytes())
}

/// Location of a tree file inside the archive
fn archive_name(relative: &str, artifact: ArtifactType) -> String {
    match artifact {
        ArtifactType::Apk => relative.to_string(),
        ArtifactType::Aab => {
            let top = relative.split('/').next().unwrap_or_default();
            match top {
                "AndroidManifest.xml" => "base/manifest/AndroidManifest.xml".to_string(),
                "resources.pb" | "lib" | "assets" | "res" => format!("base/{}", relative),
                _ => format!("base/root/{}", relative),
            }
        }
    }
}

/// Entries kept uncompressed, with the data alignment the platform expects
fn stored_alignment(name: &str) -> Option<u16> {
    if name.ends_with(".so") {
        Some(NATIVE_LIB_ALIGNMENT)
    } else if name == "resources.arsc" {
        Some(STORED_ALIGNMENT)
    } else {
        None
    }
}

fn zip_time(timestamp: i64) -> Result<zip::DateTime, PackagingError> {
    let when = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| PackagingError::Compression(format!("invalid timestamp {}", timestamp)))?;
    zip::DateTime::from_date_and_time(
        when.year().clamp(1980, 2107) as u16,
        when.month() as u8,
        when.day() as u8,
        when.hour() as u8,
        when.minute() as u8,
        when.second() as u8,
    )
    .map_err(|_| PackagingError::Compression(format!("timestamp {} not representable", timestamp)))
}

fn collect_entries(root: &Path, artifact: ArtifactType) -> Result<Vec<Entry>, PackagingError> {
    let mut entries = Vec::new();
    for item in WalkDir::new(root).sort_by_file_name() {
        let item = item.map_err(|e| PackagingError::Io(e.to_string()))?;
        if !item.file_type().is_file() {
            continue;
        }
        let Ok(relative) = item.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(Entry {
            name: archive_name(&relative, artifact),
            source: EntrySource::File(item.path().to_path_buf()),
        });
    }
    Ok(entries)
}

fn digest(source: &EntrySource) -> Result<String, PackagingError> {
    let mut hasher = Sha256::new();
    match source {
        EntrySource::File(path) => {
            let mut file = File::open(path)?;
            std::io::copy(&mut file, &mut hasher)?;
        }
        EntrySource::Bytes(bytes) => hasher.update(bytes),
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

fn write_archive(
    root: &Path,
    out: &Path,
    artifact: ArtifactType,
    build_info: Vec<u8>,
    timestamp: i64,
) -> Result<(), PackagingError> {
    let mut entries = collect_entries(root, artifact)?;
    entries.push(Entry {
        name: BUILD_INFO.to_string(),
        source: EntrySource::Bytes(build_info),
    });
    if artifact == ArtifactType::Aab {
        entries.push(Entry {
            name: BUNDLE_CONFIG.to_string(),
            source: EntrySource::Bytes(bundle_config(BUNDLETOOL_VERSION)),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut manifest = format!("Manifest-Version: 1.0\r\nCreated-By: {} {}\r\n\r\n", TOOL_NAME, VERSION);
    for entry in &entries {
        manifest.push_str(&format!(
            "Name: {}\r\nSHA-256-Digest: {}\r\n\r\n",
            entry.name,
            digest(&entry.source)?
        ));
    }
    entries.push(Entry {
        name: MANIFEST_MF.to_string(),
        source: EntrySource::Bytes(manifest.into_bytes()),
    });
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let modified = zip_time(timestamp)?;
    let zip_err = |e: zip::result::ZipError| PackagingError::Compression(e.to_string());
    let mut zip = ZipWriter::new(File::create(out)?);

    for entry in &entries {
        let (method, alignment) = match stored_alignment(&entry.name) {
            Some(alignment) => (CompressionMethod::Stored, alignment),
            None => (CompressionMethod::Deflated, 1),
        };
        let options = FileOptions::default()
            .compression_method(method)
            .last_modified_time(modified)
            .unix_permissions(0o644);
        zip.start_file_aligned(entry.name.as_str(), options, alignment)
            .map_err(zip_err)?;

        match &entry.source {
            EntrySource::File(path) => {
                let mut buf = Vec::new();
                File::open(path)?.read_to_end(&mut buf)?;
                zip.write_all(&buf)?;
            }
            EntrySource::Bytes(bytes) => zip.write_all(bytes)?,
        }
    }
    zip.finish().map_err(zip_err)?;
    debug!("Wrote {} entries to {:?}", entries.len(), out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{NoCredentials, SigningCredentials};
    use apkforge_core::Abi;
    use async_trait::async_trait;

    const BINARY_MANIFEST: &[u8] = b"\x03\x00\x08\x00axml";

    struct CopySigner;

    #[async_trait]
    impl ArtifactSigner for CopySigner {
        async fn sign(
            &self,
            input: &Path,
            output: &Path,
            _credentials: &SigningCredentials,
            _artifact: ArtifactType,
            _toolchain: &ToolchainHandle,
        ) -> Result<(), PackagingError> {
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    /// Writes half an output, then fails
    struct BrokenSigner;

    #[async_trait]
    impl ArtifactSigner for BrokenSigner {
        async fn sign(
            &self,
            _input: &Path,
            output: &Path,
            _credentials: &SigningCredentials,
            _artifact: ArtifactType,
            _toolchain: &ToolchainHandle,
        ) -> Result<(), PackagingError> {
            tokio::fs::write(output, b"PK\x03").await?;
            Err(PackagingError::Signing("keystore was tampered with".into()))
        }
    }

    /// Stands in for aapt2: binary manifest plus a resource table
    struct StubLinker;

    #[async_trait]
    impl ResourceLinker for StubLinker {
        async fn link(
            &self,
            root: &Path,
            artifact: ArtifactType,
            _toolchain: &ToolchainHandle,
        ) -> Result<(), PackagingError> {
            tokio::fs::write(root.join("AndroidManifest.xml"), BINARY_MANIFEST).await?;
            let table = match artifact {
                ArtifactType::Apk => "resources.arsc",
                ArtifactType::Aab => "resources.pb",
            };
            tokio::fs::write(root.join(table), b"\x02\x00\x0c\x00").await?;
            Ok(())
        }
    }

    struct FixedKey;

    impl CredentialProvider for FixedKey {
        fn credentials(&self, _variant: BuildVariant) -> Result<Option<SigningCredentials>, PackagingError> {
            Ok(Some(SigningCredentials::debug(PathBuf::from("/debug.keystore"))))
        }
    }

    fn toolchain(sdk_version: &str, api_level: u32) -> ToolchainHandle {
        ToolchainHandle {
            sdk_root: PathBuf::from("/sdk"),
            ndk_root: PathBuf::from("/ndk"),
            sdk_version: sdk_version.into(),
            ndk_version: "25b".into(),
            api_level,
            ndk_api: 21,
            host_tag: "linux-x86_64".into(),
            build_tools: None,
        }
    }

    fn tree(dir: &Path) -> PackageTree {
        std::fs::create_dir_all(dir.join("build")).unwrap();
        let tree_dir = tempfile::Builder::new()
            .prefix("org.example.app-debug.")
            .tempdir_in(dir.join("build"))
            .unwrap();
        let root = tree_dir.path();
        std::fs::create_dir_all(root.join("lib/arm64-v8a")).unwrap();
        std::fs::create_dir_all(root.join("assets/app")).unwrap();
        std::fs::write(root.join("AndroidManifest.xml"), "<manifest/>").unwrap();
        std::fs::write(root.join("lib/arm64-v8a/libmain.so"), b"\x7fELF").unwrap();
        std::fs::write(root.join("assets/app/main.py"), "print('hi')").unwrap();
        PackageTree {
            dir: tree_dir,
            package_id: "org.example.app".into(),
            version_name: "1.0".into(),
            version_code: 1,
            min_api: 26,
            abis: vec![Abi::Arm64V8a],
        }
    }

    fn packager(out: PathBuf) -> ArtifactPackager {
        ArtifactPackager::new(out, Arc::new(FixedKey), Arc::new(CopySigner))
            .with_linker(Arc::new(StubLinker))
    }

    fn names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_apk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");

        let out = packager(bin.clone())
            .package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain("33", 33))
            .await
            .unwrap();

        assert!(out.path.ends_with("org.example.app-1.0-debug.apk"));
        assert_eq!(
            names(&out.path),
            vec![
                "AndroidManifest.xml",
                "META-INF/BUILD-INFO",
                "META-INF/MANIFEST.MF",
                "assets/app/main.py",
                "lib/arm64-v8a/libmain.so",
                "resources.arsc",
            ]
        );
        assert_eq!(listing(&bin), vec!["org.example.app-1.0-debug.apk"]);
        assert!(listing(&dir.path().join("build")).is_empty());

        let mut archive = zip::ZipArchive::new(File::open(&out.path).unwrap()).unwrap();
        let mut manifest = Vec::new();
        archive.by_name("AndroidManifest.xml").unwrap().read_to_end(&mut manifest).unwrap();
        assert_eq!(manifest, BINARY_MANIFEST);

        let lib = archive.by_name("lib/arm64-v8a/libmain.so").unwrap();
        assert_eq!(lib.compression(), CompressionMethod::Stored);
        assert_eq!(lib.data_start() % u64::from(NATIVE_LIB_ALIGNMENT), 0);
        drop(lib);
        let table = archive.by_name("resources.arsc").unwrap();
        assert_eq!(table.compression(), CompressionMethod::Stored);
        assert_eq!(table.data_start() % u64::from(STORED_ALIGNMENT), 0);
        drop(table);

        let mut mf = String::new();
        archive.by_name(MANIFEST_MF).unwrap().read_to_string(&mut mf).unwrap();
        assert!(mf.contains("Name: lib/arm64-v8a/libmain.so\r\nSHA-256-Digest: "));
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let packager = ArtifactPackager::new(bin.clone(), Arc::new(NoCredentials), Arc::new(CopySigner))
            .with_linker(Arc::new(StubLinker));

        for artifact in [ArtifactType::Apk, ArtifactType::Aab] {
            let err = packager
                .package(tree(dir.path()), artifact, BuildVariant::Release, &toolchain("33", 33))
                .await
                .unwrap_err();
            assert!(matches!(err, PackagingError::CredentialUnavailable(ref m) if m.contains(KEYSTORE_ENV)));
        }
        assert!(!bin.exists() || listing(&bin).is_empty());
    }

    #[tokio::test]
    async fn test_bundle_rejected_below_split_support() {
        let dir = tempfile::tempdir().unwrap();

        let err = packager(dir.path().join("bin"))
            .package(tree(dir.path()), ArtifactType::Aab, BuildVariant::Release, &toolchain("19", 33))
            .await
            .unwrap_err();
        assert!(matches!(err, PackagingError::UnsupportedArtifact { ref reason, .. } if reason.contains("19")));
    }

    #[tokio::test]
    async fn test_bundle_support_follows_sdk_platform() {
        let dir = tempfile::tempdir().unwrap();

        // Targeting an old API level with a new SDK platform is fine
        let out = packager(dir.path().join("bin"))
            .package(tree(dir.path()), ArtifactType::Aab, BuildVariant::Release, &toolchain("34", 20))
            .await
            .unwrap();
        assert!(out.path.ends_with("org.example.app-1.0-release.aab"));
    }

    #[tokio::test]
    async fn test_bundle_layout() {
        let dir = tempfile::tempdir().unwrap();

        let out = packager(dir.path().join("bin"))
            .package(tree(dir.path()), ArtifactType::Aab, BuildVariant::Release, &toolchain("33", 33))
            .await
            .unwrap();

        let names = names(&out.path);
        for expected in [
            "BundleConfig.pb",
            "base/manifest/AndroidManifest.xml",
            "base/resources.pb",
            "base/lib/arm64-v8a/libmain.so",
            "base/assets/app/main.py",
        ] {
            assert!(names.contains(&expected.to_string()), "{} missing from {:?}", expected, names);
        }

        let mut archive = zip::ZipArchive::new(File::open(&out.path).unwrap()).unwrap();
        let mut config = Vec::new();
        archive.by_name(BUNDLE_CONFIG).unwrap().read_to_end(&mut config).unwrap();
        let version = BUNDLETOOL_VERSION.as_bytes();
        assert_eq!(config[..4], [0x0a, version.len() as u8 + 2, 0x12, version.len() as u8]);
        assert_eq!(&config[4..], version);
    }

    #[tokio::test]
    async fn test_failed_signing_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let packager = ArtifactPackager::new(bin.clone(), Arc::new(FixedKey), Arc::new(BrokenSigner))
            .with_linker(Arc::new(StubLinker));

        let err = packager
            .package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain("33", 33))
            .await
            .unwrap_err();
        assert!(matches!(err, PackagingError::Signing(_)));
        assert!(listing(&bin).is_empty());
        assert!(listing(&dir.path().join("build")).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_packaging_of_one_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let (a, b) = (packager(bin.clone()), packager(bin.clone()));
        let toolchain = toolchain("33", 33);

        let (x, y) = tokio::join!(
            a.package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain),
            b.package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain),
        );
        let (x, y) = (x.unwrap(), y.unwrap());

        assert_eq!(x.path, y.path);
        assert_eq!(listing(&bin), vec!["org.example.app-1.0-debug.apk"]);
        assert!(names(&x.path).contains(&"resources.arsc".to_string()));
    }

    #[tokio::test]
    async fn test_reproducible_output_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain("33", 33);

        let a = packager(dir.path().join("a"))
            .with_reproducible(true)
            .package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain)
            .await
            .unwrap();
        let b = packager(dir.path().join("b"))
            .with_reproducible(true)
            .package(tree(dir.path()), ArtifactType::Apk, BuildVariant::Debug, &toolchain)
            .await
            .unwrap();

        assert_eq!(a.sha256, b.sha256);
        assert_eq!(std::fs::read(&a.path).unwrap(), std::fs::read(&b.path).unwrap());
    }
}
