//! Android Toolchain Management
//!
//! Resolves the SDK platform and NDK a build needs:
//! - compatibility rules between NDK releases and API levels
//! - detection of installs already on the machine
//! - resumable, checksum-verified downloads
//! - a shared on-disk cache with a per-process handle cache

pub mod detector;
pub mod downloader;
pub mod handle;
pub mod ndk;
pub mod resolver;
pub mod source;

pub use detector::ToolchainDetector;
pub use downloader::Downloader;
pub use handle::ToolchainHandle;
pub use ndk::{NdkTools, NdkVersion};
pub use resolver::{check_compatibility, ToolchainCache, ToolchainRequest, ToolchainResolver};
pub use source::{Component, HttpToolchainSource, ToolchainSource};

/// Lowest API level that can produce an Android App Bundle
pub const MIN_BUNDLE_API: u32 = 21;
