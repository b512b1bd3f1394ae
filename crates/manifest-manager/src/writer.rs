//! Manifest Writer
//!
//! Writes a [`BuildManifest`] back out, either as descriptor text or as the
//! `AndroidManifest.xml` that goes into the package.

use std::fmt::Write as _;
use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::info;

use crate::manifest::BuildManifest;
use crate::parser::APP_SECTION;
use crate::permissions::Permission;

/// Android XML namespace
pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

/// Native library loaded by the launcher activity
pub const MAIN_LIBRARY: &str = "main";

/// Writer errors
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("XML write error: {0}")]
    XmlError(#[from] quick_xml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Manifest writer
pub struct ManifestWriter {
    indent: usize,
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl ManifestWriter {
    /// Create a new writer with default settings
    pub fn new() -> Self {
        Self { indent: 4 }
    }

    /// Set indentation
    pub fn with_indent(mut self, spaces: usize) -> Self {
        self.indent = spaces;
        self
    }

    /// Descriptor text that parses back to an equal manifest.
    ///
    /// Every key is written explicitly so defaults never shift the result.
    pub fn to_spec_string(manifest: &BuildManifest) -> String {
        let join = |items: &[String]| items.join(", ");
        let platform = manifest.platform();
        let source = manifest.source();
        let mut out = String::new();

        let _ = writeln!(out, "[{}]", APP_SECTION);
        let _ = writeln!(out, "title = {}", manifest.title());
        let _ = writeln!(out, "package.name = {}", manifest.package_name());
        let _ = writeln!(out, "package.domain = {}", manifest.package_domain());
        let _ = writeln!(out, "version = {}", manifest.version());
        if let Some(code) = manifest.numeric_version() {
            let _ = writeln!(out, "android.numeric_version = {}", code);
        }
        let _ = writeln!(out, "source.dir = {}", source.dir.display());
        let _ = writeln!(out, "source.include_exts = {}", join(&source.include_exts));
        if !source.exclude_dirs.is_empty() {
            let _ = writeln!(out, "source.exclude_dirs = {}", join(&source.exclude_dirs));
        }
        if !source.exclude_patterns.is_empty() {
            let _ = writeln!(out, "source.exclude_patterns = {}", join(&source.exclude_patterns));
        }
        let _ = writeln!(out, "source.entrypoint = {}", source.entrypoint);

        let requirements: Vec<String> = manifest.requirements().iter().map(|r| r.to_string()).collect();
        if !requirements.is_empty() {
            let _ = writeln!(out, "requirements = {}", join(&requirements));
        }
        let _ = writeln!(out, "orientation = {}", manifest.orientation());
        let _ = writeln!(out, "fullscreen = {}", u8::from(manifest.fullscreen()));

        let permissions: Vec<String> = manifest.permissions().iter().map(|p| p.to_string()).collect();
        if !permissions.is_empty() {
            let _ = writeln!(out, "android.permissions = {}", join(&permissions));
        }
        let _ = writeln!(out, "android.api = {}", platform.target_api);
        let _ = writeln!(out, "android.minapi = {}", platform.min_api);
        let _ = writeln!(out, "android.ndk_api = {}", platform.ndk_api);
        let _ = writeln!(out, "android.sdk = {}", platform.sdk_version);
        let _ = writeln!(out, "android.ndk = {}", platform.ndk_version);

        let archs: Vec<String> = manifest.archs().iter().map(|a| a.to_string()).collect();
        let _ = writeln!(out, "android.archs = {}", join(&archs));
        let _ = writeln!(out, "android.release_artifact = {}", manifest.release_artifact());
        let _ = writeln!(out, "android.debug_artifact = {}", manifest.debug_artifact());
        if let Some(icon) = manifest.icon() {
            let _ = writeln!(out, "icon.filename = {}", icon.display());
        }
        if let Some(presplash) = manifest.presplash() {
            let _ = writeln!(out, "presplash.filename = {}", presplash.display());
        }
        out
    }

    /// Write `AndroidManifest.xml` for a manifest
    pub fn android_manifest_xml(&self, manifest: &BuildManifest) -> Result<String, WriteError> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', self.indent);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

        let package_id = manifest.package_id();
        let version_code = manifest.version_code().to_string();
        let mut manifest_elem = BytesStart::new("manifest");
        manifest_elem.push_attribute(("xmlns:android", ANDROID_NS));
        manifest_elem.push_attribute(("package", package_id.as_str()));
        manifest_elem.push_attribute(("android:versionCode", version_code.as_str()));
        manifest_elem.push_attribute(("android:versionName", manifest.version()));
        writer.write_event(Event::Start(manifest_elem))?;

        let platform = manifest.platform();
        let min_sdk = platform.min_api.to_string();
        let target_sdk = platform.target_api.to_string();
        let mut uses_sdk = BytesStart::new("uses-sdk");
        uses_sdk.push_attribute(("android:minSdkVersion", min_sdk.as_str()));
        uses_sdk.push_attribute(("android:targetSdkVersion", target_sdk.as_str()));
        writer.write_event(Event::Empty(uses_sdk))?;

        for perm in manifest.permissions() {
            self.write_permission(&mut writer, perm)?;
        }

        let mut gles = BytesStart::new("uses-feature");
        gles.push_attribute(("android:glEsVersion", "0x00020000"));
        writer.write_event(Event::Empty(gles))?;

        let mut app = BytesStart::new("application");
        app.push_attribute(("android:label", manifest.title()));
        if manifest.icon().is_some() {
            app.push_attribute(("android:icon", "@mipmap/icon"));
        }
        app.push_attribute(("android:hasCode", "false"));
        app.push_attribute(("android:extractNativeLibs", "false"));
        if manifest.fullscreen() {
            app.push_attribute(("android:theme", "@android:style/Theme.NoTitleBar.Fullscreen"));
        }
        writer.write_event(Event::Start(app))?;

        let mut activity = BytesStart::new("activity");
        activity.push_attribute(("android:name", "android.app.NativeActivity"));
        activity.push_attribute(("android:label", manifest.title()));
        activity.push_attribute(("android:exported", bool_attr(true)));
        activity.push_attribute((
            "android:screenOrientation",
            manifest.orientation().android_value(),
        ));
        activity.push_attribute((
            "android:configChanges",
            "keyboardHidden|orientation|screenSize",
        ));
        writer.write_event(Event::Start(activity))?;

        let mut lib_name = BytesStart::new("meta-data");
        lib_name.push_attribute(("android:name", "android.app.lib_name"));
        lib_name.push_attribute(("android:value", MAIN_LIBRARY));
        writer.write_event(Event::Empty(lib_name))?;

        writer.write_event(Event::Start(BytesStart::new("intent-filter")))?;
        let mut action = BytesStart::new("action");
        action.push_attribute(("android:name", "android.intent.action.MAIN"));
        writer.write_event(Event::Empty(action))?;
        let mut category = BytesStart::new("category");
        category.push_attribute(("android:name", "android.intent.category.LAUNCHER"));
        writer.write_event(Event::Empty(category))?;
        writer.write_event(Event::End(BytesEnd::new("intent-filter")))?;

        writer.write_event(Event::End(BytesEnd::new("activity")))?;
        writer.write_event(Event::End(BytesEnd::new("application")))?;
        writer.write_event(Event::End(BytesEnd::new("manifest")))?;

        let result = writer.into_inner().into_inner();
        Ok(String::from_utf8(result)?)
    }

    /// Write `AndroidManifest.xml` to a file
    pub async fn write_android_manifest(
        &self,
        manifest: &BuildManifest,
        path: impl AsRef<Path>,
    ) -> Result<(), WriteError> {
        let content = self.android_manifest_xml(manifest)?;
        tokio::fs::write(path.as_ref(), content).await?;
        info!("Wrote AndroidManifest.xml to {:?}", path.as_ref());
        Ok(())
    }

    fn write_permission<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        perm: &Permission,
    ) -> Result<(), WriteError> {
        let mut elem = BytesStart::new("uses-permission");
        elem.push_attribute(("android:name", perm.name.as_str()));
        if let Some(max) = perm.max_sdk_version {
            elem.push_attribute(("android:maxSdkVersion", max.to_string().as_str()));
        }
        writer.write_event(Event::Empty(elem))?;
        Ok(())
    }
}

impl Default for ManifestWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ManifestParser;

    const FULL: &str = r#"
[app]
title = Round Trip
package.name = roundtrip
package.domain = org.example
version = 2.0.1
android.numeric_version = 42
source.dir = src
source.include_exts = py, kv
source.exclude_dirs = tests, bin
source.exclude_patterns = license, images/*/*.jpg
source.entrypoint = app.py
requirements = python3, kivy==2.2.0, requests~=2.28
orientation = sensorLandscape
fullscreen = 0
android.permissions = CAMERA, (name=READ_EXTERNAL_STORAGE;maxSdkVersion=32), com.vendor.permission.CUSTOM
android.api = 34
android.minapi = 24
android.ndk_api = 23
android.sdk = 34
android.ndk = 26b
android.archs = x86_64, arm64-v8a
android.release_artifact = apk
android.debug_artifact = apk
icon.filename = assets/icon.png
presplash.filename = assets/splash.png
"#;

    #[test]
    fn test_spec_round_trip() {
        for text in [FULL, "[app]\ntitle=A\npackage.name=a\npackage.domain=io.a\nversion=1\n"] {
            let original = ManifestParser::parse_str(text).unwrap().manifest;
            let written = ManifestWriter::to_spec_string(&original);
            let reparsed = ManifestParser::parse_str(&written).unwrap().manifest;
            assert_eq!(reparsed, original, "round trip changed manifest:\n{}", written);
        }
    }

    #[test]
    fn test_round_trip_keeps_hash_in_values() {
        let text = "[app]\n# comment line\n  ; another\ntitle = Build #7 ; beta\npackage.name = a\npackage.domain = io.a\nversion = 1.0#rc1\n";
        let original = ManifestParser::parse_str(text).unwrap().manifest;
        assert_eq!(original.title(), "Build #7 ; beta");
        assert_eq!(original.version(), "1.0#rc1");

        let written = ManifestWriter::to_spec_string(&original);
        let reparsed = ManifestParser::parse_str(&written).unwrap().manifest;
        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_android_manifest_xml() {
        let manifest = ManifestParser::parse_str(FULL).unwrap().manifest;
        let xml = ManifestWriter::new().android_manifest_xml(&manifest).unwrap();

        assert!(xml.contains(r#"package="org.example.roundtrip""#));
        assert!(xml.contains(r#"android:versionCode="42""#));
        assert!(xml.contains(r#"android:minSdkVersion="24""#));
        assert!(xml.contains(r#"android:targetSdkVersion="34""#));
        assert!(xml.contains(r#"android:name="android.permission.CAMERA""#));
        assert!(xml.contains(r#"android:maxSdkVersion="32""#));
        assert!(xml.contains(r#"android:name="com.vendor.permission.CUSTOM""#));
        assert!(xml.contains(r#"android:screenOrientation="sensorLandscape""#));
        assert!(xml.contains(r#"android:icon="@mipmap/icon""#));

        let doc = roxmltree::Document::parse(&xml).unwrap();
        assert_eq!(doc.root_element().tag_name().name(), "manifest");
    }
}
