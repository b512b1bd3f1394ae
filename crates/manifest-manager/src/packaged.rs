//! Reading `AndroidManifest.xml` back out of a built package

use roxmltree::{Document, Node};
use serde::Serialize;

use crate::permissions::Permission;
use crate::writer::ANDROID_NS;

/// Metadata recovered from a packaged `AndroidManifest.xml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagedManifest {
    pub package: String,
    pub version_code: Option<u32>,
    pub version_name: Option<String>,
    pub min_sdk: Option<u32>,
    pub target_sdk: Option<u32>,
    pub permissions: Vec<Permission>,
    pub screen_orientation: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("XML parsing error: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("Invalid manifest structure: {0}")]
    InvalidStructure(String),
}

fn android(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute((ANDROID_NS, name)).map(str::to_string)
}

fn android_u32(node: Node<'_, '_>, name: &str) -> Option<u32> {
    node.attribute((ANDROID_NS, name)).and_then(|v| v.parse().ok())
}

impl PackagedManifest {
    pub fn from_xml(xml: &str) -> Result<Self, ReadError> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "manifest" {
            return Err(ReadError::InvalidStructure(format!(
                "root element is <{}>, expected <manifest>",
                root.tag_name().name()
            )));
        }

        let package = root
            .attribute("package")
            .ok_or_else(|| ReadError::InvalidStructure("missing package attribute".into()))?
            .to_string();

        let mut manifest = Self {
            package,
            version_code: android_u32(root, "versionCode"),
            version_name: android(root, "versionName"),
            min_sdk: None,
            target_sdk: None,
            permissions: Vec::new(),
            screen_orientation: None,
        };

        for node in root.descendants().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "uses-sdk" => {
                    manifest.min_sdk = android_u32(node, "minSdkVersion");
                    manifest.target_sdk = android_u32(node, "targetSdkVersion");
                }
                "uses-permission" => {
                    if let Some(name) = android(node, "name") {
                        manifest.permissions.push(Permission {
                            name,
                            max_sdk_version: android_u32(node, "maxSdkVersion"),
                        });
                    }
                }
                "activity" if manifest.screen_orientation.is_none() => {
                    manifest.screen_orientation = android(node, "screenOrientation");
                }
                _ => {}
            }
        }

        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ManifestParser;
    use crate::writer::ManifestWriter;

    #[test]
    fn test_reads_written_manifest() {
        let manifest = ManifestParser::parse_str(
            "[app]\ntitle=Demo\npackage.name=app\npackage.domain=org.example\nversion=1.0\n\
             android.minapi=26\nandroid.api=33\n\
             android.permissions=INTERNET,com.example.permission.FUTURE\n",
        )
        .unwrap()
        .manifest;
        let xml = ManifestWriter::new().android_manifest_xml(&manifest).unwrap();

        let packaged = PackagedManifest::from_xml(&xml).unwrap();
        assert_eq!(packaged.package, "org.example.app");
        assert_eq!(packaged.min_sdk, Some(26));
        assert_eq!(packaged.target_sdk, Some(33));
        assert_eq!(packaged.version_name.as_deref(), Some("1.0"));
        assert_eq!(packaged.permissions, manifest.permissions().to_vec());
        assert_eq!(packaged.screen_orientation.as_deref(), Some("portrait"));
    }

    #[test]
    fn test_rejects_other_roots() {
        assert!(matches!(
            PackagedManifest::from_xml("<resources/>"),
            Err(ReadError::InvalidStructure(_))
        ));
        assert!(PackagedManifest::from_xml("<manifest").is_err());
    }
}
