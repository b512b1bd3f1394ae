//! Resource Linking
//!
//! The assembler writes a text `AndroidManifest.xml` and raw `res/` files.
//! Devices and bundletool only accept linked resources: binary XML with a
//! `resources.arsc` table for APKs, protobuf XML with `resources.pb` for
//! bundles. The linker rewrites the tree in place before it is zipped.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use zip::ZipArchive;

use apkforge_core::error::PackagingError;
use apkforge_manifest::ArtifactType;
use apkforge_toolchain::ToolchainHandle;

pub const MANIFEST_XML: &str = "AndroidManifest.xml";

/// Turns a package tree's text manifest and raw resources into linked ones
#[async_trait]
pub trait ResourceLinker: Send + Sync {
    /// Rewrite `root` in place for `artifact`
    async fn link(
        &self,
        root: &Path,
        artifact: ArtifactType,
        toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError>;
}

/// `aapt2 compile` + `aapt2 link` from the SDK build-tools
pub struct Aapt2Linker;

impl Aapt2Linker {
    fn tool(toolchain: &ToolchainHandle) -> Result<PathBuf, PackagingError> {
        toolchain
            .build_tool("aapt2")
            .or_else(|| which::which("aapt2").ok())
            .ok_or_else(|| PackagingError::Linking("aapt2 not found in build-tools or PATH".to_string()))
    }

    async fn run(mut command: Command, what: &str) -> Result<(), PackagingError> {
        debug!("Running {:?}", command.as_std());
        let output = command
            .output()
            .await
            .map_err(|e| PackagingError::Linking(format!("cannot run {}: {}", what, e)))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PackagingError::Linking(format!("{}{}", stdout, stderr)));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceLinker for Aapt2Linker {
    async fn link(
        &self,
        root: &Path,
        artifact: ArtifactType,
        toolchain: &ToolchainHandle,
    ) -> Result<(), PackagingError> {
        let aapt2 = Self::tool(toolchain)?;
        let android_jar = toolchain.android_jar();
        if !android_jar.is_file() {
            return Err(PackagingError::Linking(format!(
                "{:?} is missing; install SDK platform {}",
                android_jar, toolchain.sdk_version
            )));
        }

        let scratch = tempfile::Builder::new().prefix("apkforge-link.").tempdir()?;
        let res_dir = root.join("res");
        let compiled = scratch.path().join("res.zip");
        if res_dir.is_dir() {
            let mut cmd = Command::new(&aapt2);
            cmd.arg("compile").arg("--dir").arg(&res_dir).arg("-o").arg(&compiled);
            Self::run(cmd, "aapt2 compile").await?;
        }

        let linked = scratch.path().join("linked.zip");
        let mut cmd = Command::new(&aapt2);
        cmd.arg("link")
            .arg("--manifest")
            .arg(root.join(MANIFEST_XML))
            .arg("-I")
            .arg(&android_jar)
            .arg("-o")
            .arg(&linked);
        if artifact == ArtifactType::Aab {
            cmd.arg("--proto-format");
        }
        if res_dir.is_dir() {
            cmd.arg(&compiled);
        }
        Self::run(cmd, "aapt2 link").await?;

        tokio::fs::remove_file(root.join(MANIFEST_XML)).await?;
        if res_dir.is_dir() {
            tokio::fs::remove_dir_all(&res_dir).await?;
        }
        let root = root.to_path_buf();
        let count = tokio::task::spawn_blocking(move || extract(&linked, &root))
            .await
            .map_err(|e| PackagingError::Io(e.to_string()))??;
        info!("Linked manifest and {} resource file(s) for {}", count, artifact);
        Ok(())
    }
}

/// Unpack the linker's output archive over `root`
pub(crate) fn extract(archive: &Path, root: &Path) -> Result<usize, PackagingError> {
    let mut zip = ZipArchive::new(File::open(archive)?)
        .map_err(|e| PackagingError::Linking(format!("unreadable linker output: {}", e)))?;
    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PackagingError::Linking(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            debug!("Skipping unsafe linker entry {}", entry.name());
            continue;
        };
        let dest = root.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::io::copy(&mut entry, &mut File::create(&dest)?)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    #[test]
    fn test_extract_replaces_tree_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("linked.zip");
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        for (name, data) in [
            ("AndroidManifest.xml", &b"\x03\x00\x08\x00"[..]),
            ("resources.arsc", b"\x02\x00\x0c\x00"),
            ("res/mipmap/icon.png", b"png"),
            ("../escape.txt", b"no"),
        ] {
            zip.start_file(name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();

        let root = dir.path().join("tree");
        std::fs::create_dir_all(&root).unwrap();
        let count = extract(&archive, &root).unwrap();

        assert_eq!(count, 3);
        assert_eq!(std::fs::read(root.join(MANIFEST_XML)).unwrap(), b"\x03\x00\x08\x00");
        assert!(root.join("resources.arsc").is_file());
        assert!(root.join("res/mipmap/icon.png").is_file());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_platform_jar() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("build-tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::write(tools.join("aapt2"), "").unwrap();
        let toolchain = ToolchainHandle {
            sdk_root: dir.path().join("sdk"),
            ndk_root: dir.path().join("ndk"),
            sdk_version: "33".into(),
            ndk_version: "25b".into(),
            api_level: 33,
            ndk_api: 21,
            host_tag: "linux-x86_64".into(),
            build_tools: Some(tools),
        };

        let err = Aapt2Linker
            .link(dir.path(), ArtifactType::Apk, &toolchain)
            .await
            .unwrap_err();
        assert!(matches!(err, PackagingError::Linking(ref m) if m.contains("android.jar")));
    }
}
