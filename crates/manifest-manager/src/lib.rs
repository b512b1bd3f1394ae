//! Build Manifest Manager
//!
//! Loads application descriptors into a typed [`BuildManifest`], writes them
//! back (descriptor text and `AndroidManifest.xml`) and knows which platform
//! permissions exist at which API level.

pub mod manifest;
pub mod packaged;
pub mod parser;
pub mod permissions;
pub mod requirements;
pub mod writer;

pub use manifest::{ArtifactType, BuildManifest, Orientation, PlatformTarget, SourceSpec};
pub use packaged::PackagedManifest;
pub use parser::{LoadedManifest, ManifestParser};
pub use permissions::{Permission, PermissionCatalog, PermissionInfo};
pub use requirements::Requirement;
pub use writer::ManifestWriter;
