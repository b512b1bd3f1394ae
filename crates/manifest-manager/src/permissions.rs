//! Permission Management
//!
//! Parsing of declared permissions and a catalog of platform permissions with
//! the API level that introduced them.

use std::fmt;

use apkforge_core::error::ManifestError;
use serde::Serialize;

/// Prefix added to short permission names
pub const ANDROID_PERMISSION_PREFIX: &str = "android.permission.";

/// A declared permission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Permission {
    /// Full permission name (e.g., "android.permission.INTERNET")
    pub name: String,

    /// Maximum SDK version the permission is requested on
    pub max_sdk_version: Option<u32>,
}

impl Permission {
    /// Create a new permission
    pub fn new(name: &str) -> Self {
        Self {
            name: qualify(name),
            max_sdk_version: None,
        }
    }

    /// Parse a descriptor entry: `INTERNET`, `com.vendor.permission.X` or
    /// `(name=WRITE_EXTERNAL_STORAGE;maxSdkVersion=18)`
    pub fn parse(entry: &str) -> Result<Self, ManifestError> {
        let entry = entry.trim();
        let invalid = |reason: &str| ManifestError::InvalidValue {
            key: "android.permissions".into(),
            value: entry.to_string(),
            reason: reason.to_string(),
        };

        let Some(inner) = entry.strip_prefix('(') else {
            if entry.is_empty() || entry.contains(char::is_whitespace) {
                return Err(invalid("permission names may not be empty or contain spaces"));
            }
            return Ok(Self::new(entry));
        };
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| invalid("missing closing parenthesis"))?;

        let mut name = None;
        let mut max_sdk_version = None;
        for part in inner.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid("expected key=value"))?;
            match key.trim() {
                "name" => name = Some(value.trim().to_string()),
                "maxSdkVersion" => {
                    let level = value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| invalid("maxSdkVersion must be an integer"))?;
                    max_sdk_version = Some(level);
                }
                other => return Err(invalid(&format!("unknown attribute '{}'", other))),
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("missing name"))?;
        Ok(Self {
            name: qualify(&name),
            max_sdk_version,
        })
    }

    /// Get the short name without android.permission prefix
    pub fn short_name(&self) -> &str {
        self.name
            .strip_prefix(ANDROID_PERMISSION_PREFIX)
            .unwrap_or(&self.name)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_sdk_version {
            Some(max) => write!(f, "(name={};maxSdkVersion={})", self.name, max),
            None => f.write_str(&self.name),
        }
    }
}

fn qualify(name: &str) -> String {
    let name = name.trim();
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}{}", ANDROID_PERMISSION_PREFIX, name)
    }
}

/// Permission protection level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtectionLevel {
    Normal,
    Dangerous,
    Signature,
}

impl ProtectionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionLevel::Normal => "normal",
            ProtectionLevel::Dangerous => "dangerous",
            ProtectionLevel::Signature => "signature",
        }
    }
}

/// Catalog metadata for a platform permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionInfo {
    pub name: &'static str,
    pub protection_level: ProtectionLevel,
    pub added_in_api: u32,
    pub deprecated_in_api: Option<u32>,
}

macro_rules! perm {
    ($name:literal, $level:ident, $added:literal, $deprecated:expr) => {
        PermissionInfo {
            name: concat!("android.permission.", $name),
            protection_level: ProtectionLevel::$level,
            added_in_api: $added,
            deprecated_in_api: $deprecated,
        }
    };
    ($name:literal, $level:ident, $added:literal) => {
        perm!($name, $level, $added, None)
    };
}

const CATALOG: &[PermissionInfo] = &[
    // Network
    perm!("INTERNET", Normal, 1),
    perm!("ACCESS_NETWORK_STATE", Normal, 1),
    perm!("ACCESS_WIFI_STATE", Normal, 1),
    perm!("CHANGE_WIFI_STATE", Normal, 1),
    perm!("NEARBY_WIFI_DEVICES", Dangerous, 33),
    // Location
    perm!("ACCESS_FINE_LOCATION", Dangerous, 1),
    perm!("ACCESS_COARSE_LOCATION", Dangerous, 1),
    perm!("ACCESS_BACKGROUND_LOCATION", Dangerous, 29),
    perm!("ACCESS_MEDIA_LOCATION", Dangerous, 29),
    // Camera and sensors
    perm!("CAMERA", Dangerous, 1),
    perm!("RECORD_AUDIO", Dangerous, 1),
    perm!("MODIFY_AUDIO_SETTINGS", Normal, 1),
    perm!("BODY_SENSORS", Dangerous, 20),
    perm!("ACTIVITY_RECOGNITION", Dangerous, 29),
    // Storage
    perm!("READ_EXTERNAL_STORAGE", Dangerous, 16, Some(33)),
    perm!("WRITE_EXTERNAL_STORAGE", Dangerous, 4, Some(30)),
    perm!("MANAGE_EXTERNAL_STORAGE", Signature, 30),
    perm!("READ_MEDIA_IMAGES", Dangerous, 33),
    perm!("READ_MEDIA_VIDEO", Dangerous, 33),
    perm!("READ_MEDIA_AUDIO", Dangerous, 33),
    // Contacts, calendar, phone, SMS
    perm!("READ_CONTACTS", Dangerous, 1),
    perm!("WRITE_CONTACTS", Dangerous, 1),
    perm!("READ_CALENDAR", Dangerous, 1),
    perm!("WRITE_CALENDAR", Dangerous, 1),
    perm!("READ_PHONE_STATE", Dangerous, 1),
    perm!("CALL_PHONE", Dangerous, 1),
    perm!("READ_CALL_LOG", Dangerous, 16),
    perm!("SEND_SMS", Dangerous, 1),
    perm!("RECEIVE_SMS", Dangerous, 1),
    perm!("READ_SMS", Dangerous, 1),
    // Bluetooth and NFC
    perm!("BLUETOOTH", Normal, 1, Some(31)),
    perm!("BLUETOOTH_ADMIN", Normal, 1, Some(31)),
    perm!("BLUETOOTH_CONNECT", Dangerous, 31),
    perm!("BLUETOOTH_SCAN", Dangerous, 31),
    perm!("BLUETOOTH_ADVERTISE", Dangerous, 31),
    perm!("NFC", Normal, 9),
    // System
    perm!("VIBRATE", Normal, 1),
    perm!("WAKE_LOCK", Normal, 1),
    perm!("RECEIVE_BOOT_COMPLETED", Normal, 1),
    perm!("SYSTEM_ALERT_WINDOW", Signature, 1),
    perm!("FOREGROUND_SERVICE", Normal, 28),
    perm!("POST_NOTIFICATIONS", Dangerous, 33),
    perm!("SCHEDULE_EXACT_ALARM", Normal, 31),
    perm!("USE_BIOMETRIC", Normal, 28),
    perm!("USE_FINGERPRINT", Normal, 23, Some(28)),
    perm!("REQUEST_INSTALL_PACKAGES", Signature, 23),
];

/// Lookup table of known platform permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionCatalog;

impl PermissionCatalog {
    pub fn new() -> Self {
        Self
    }

    /// Get permission info by full name
    pub fn get(&self, name: &str) -> Option<&'static PermissionInfo> {
        CATALOG.iter().find(|p| p.name == name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Known permissions introduced after `api_level`
    pub fn unavailable_at<'a>(
        &self,
        permissions: &'a [Permission],
        api_level: u32,
    ) -> Vec<(&'a Permission, &'static PermissionInfo)> {
        permissions
            .iter()
            .filter_map(|p| self.get(&p.name).map(|info| (p, info)))
            .filter(|(_, info)| info.added_in_api > api_level)
            .collect()
    }

    /// Check if permission requires a runtime request (API 23+)
    pub fn requires_runtime_request(&self, name: &str) -> bool {
        self.get(name)
            .map(|p| p.protection_level == ProtectionLevel::Dangerous)
            .unwrap_or(false)
    }

    pub fn all(&self) -> &'static [PermissionInfo] {
        CATALOG
    }
}
