//! Resolved toolchain handle

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use apkforge_core::Abi;

use crate::detector::ToolchainDetector;
use crate::ndk::NdkTools;

/// A resolved SDK platform + NDK pair; immutable and shared across stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainHandle {
    pub sdk_root: PathBuf,
    pub ndk_root: PathBuf,
    pub sdk_version: String,
    pub ndk_version: String,
    /// Target platform API level
    pub api_level: u32,
    /// API level native code is compiled against
    pub ndk_api: u32,
    pub host_tag: String,
    /// `build-tools/<v>` of the SDK, when one is installed
    pub build_tools: Option<PathBuf>,
}

impl ToolchainHandle {
    /// Stable identifier of this toolchain, used in cache keys
    pub fn version_key(&self) -> String {
        format!(
            "sdk-{}+ndk-{}+api-{}",
            self.sdk_version, self.ndk_version, self.ndk_api
        )
    }

    /// Key of this handle in the resolver cache; unlike `version_key` it
    /// includes the target API level
    pub fn cache_key(&self) -> String {
        handle_key(&self.sdk_version, &self.ndk_version, self.ndk_api, self.api_level)
    }

    /// `platforms/android-<v>` directory of the SDK
    pub fn platform_dir(&self) -> PathBuf {
        ToolchainDetector::platform_dir(&self.sdk_root, &self.sdk_version)
    }

    /// `android.jar` of the target platform
    pub fn android_jar(&self) -> PathBuf {
        self.platform_dir().join("android.jar")
    }

    /// Compiler tools for one ABI
    pub fn tools(&self, abi: Abi) -> NdkTools {
        NdkTools::new(&self.ndk_root, &self.host_tag, abi, self.ndk_api)
    }

    /// Path to an SDK build tool (`apksigner`, `zipalign`), if installed
    pub fn build_tool(&self, name: &str) -> Option<PathBuf> {
        let dir = self.build_tools.as_deref()?;
        let candidates = if cfg!(windows) {
            vec![dir.join(format!("{}.bat", name)), dir.join(format!("{}.exe", name))]
        } else {
            vec![dir.join(name)]
        };
        candidates.into_iter().find(|p| p.is_file())
    }

    /// Environment for building native code for `abi` with this toolchain
    pub fn compile_env(&self, abi: Abi) -> BTreeMap<String, String> {
        let tools = self.tools(abi);
        let path = |p: &Path| p.to_string_lossy().into_owned();

        let mut env = BTreeMap::new();
        env.insert("CC".to_string(), path(&tools.clang));
        env.insert("CXX".to_string(), path(&tools.clangxx));
        env.insert("LD".to_string(), path(&tools.linker));
        env.insert("AR".to_string(), path(&tools.ar));
        env.insert("RANLIB".to_string(), path(&tools.ranlib));
        env.insert("STRIP".to_string(), path(&tools.strip));
        env.insert("SYSROOT".to_string(), path(&tools.sysroot));
        env.insert("ANDROID_NDK_HOME".to_string(), path(&self.ndk_root));
        env.insert("ANDROID_SDK_ROOT".to_string(), path(&self.sdk_root));
        env.insert("ANDROID_ABI".to_string(), abi.abi_name().to_string());
        env.insert("ANDROID_API".to_string(), self.ndk_api.to_string());
        env.insert("TARGET_TRIPLE".to_string(), abi.tool_triple().to_string());
        env
    }
}

pub(crate) fn handle_key(sdk_version: &str, ndk_version: &str, ndk_api: u32, api_level: u32) -> String {
    format!(
        "sdk-{}+ndk-{}+api-{}+target-{}",
        sdk_version, ndk_version, ndk_api, api_level
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ToolchainHandle {
        ToolchainHandle {
            sdk_root: PathBuf::from("/sdk"),
            ndk_root: PathBuf::from("/ndk"),
            sdk_version: "33".into(),
            ndk_version: "25b".into(),
            api_level: 33,
            ndk_api: 21,
            host_tag: "linux-x86_64".into(),
            build_tools: None,
        }
    }

    #[test]
    fn test_version_key() {
        assert_eq!(handle().version_key(), "sdk-33+ndk-25b+api-21");
        assert_eq!(handle().cache_key(), "sdk-33+ndk-25b+api-21+target-33");
    }

    #[test]
    fn test_compile_env() {
        let env = handle().compile_env(Abi::ArmeabiV7a);
        assert_eq!(env["ANDROID_ABI"], "armeabi-v7a");
        assert_eq!(env["ANDROID_API"], "21");
        assert!(env["CC"].contains("armv7a-linux-androideabi21-clang"));
        assert!(handle().build_tool("apksigner").is_none());
    }
}
