//! Runtime requirement strings
//!
//! `name`, `name==1.2`, `name>=1.0`, `name~=1.4`, `name<2` ... mapped onto
//! semver requirements. Versions with fewer than three components are padded
//! with zeros.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::Serialize;

/// Version constraint operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operator {
    Exact,
    GreaterEq,
    Greater,
    LessEq,
    Less,
    Compatible,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Exact => "==",
            Operator::GreaterEq => ">=",
            Operator::Greater => ">",
            Operator::LessEq => "<=",
            Operator::Less => "<",
            Operator::Compatible => "~=",
        }
    }
}

/// Failure to parse a requirement string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid requirement '{input}': {reason}")]
pub struct RequirementParseError {
    pub input: String,
    pub reason: String,
}

/// A single runtime requirement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct Requirement {
    name: String,
    constraint: Option<(Operator, Version)>,
    /// Number of version components written after `~=`, else 0
    precision: usize,
}

/// Normalize a dependency name: lowercase, `_` and `.` become `-`
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

/// Parse a loosely written release version (`3`, `3.11`, `v1.2.3`)
pub fn parse_version(text: &str) -> Option<Version> {
    let text = text.trim().trim_start_matches('v');
    let parts: Vec<&str> = text.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some(Version::new(numbers[0], numbers[1], numbers[2]))
}

impl Requirement {
    /// Parse one requirement entry
    pub fn parse(input: &str) -> Result<Self, RequirementParseError> {
        let text = input.trim();
        let err = |reason: &str| RequirementParseError {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let split_at = text
            .find(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!'))
            .unwrap_or(text.len());
        let (raw_name, rest) = text.split_at(split_at);
        let name = normalize_name(raw_name);

        if name.is_empty() {
            return Err(err("missing dependency name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(err("dependency names may only contain letters, digits, '-', '_' and '.'"));
        }

        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(Self {
                name,
                constraint: None,
                precision: 0,
            });
        }

        let (op, version_text) = [
            ("==", Operator::Exact),
            (">=", Operator::GreaterEq),
            ("<=", Operator::LessEq),
            ("~=", Operator::Compatible),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ]
        .iter()
        .find_map(|(token, op)| rest.strip_prefix(token).map(|v| (*op, v.trim())))
        .ok_or_else(|| err("unsupported operator (use ==, >=, >, <=, < or ~=)"))?;

        let version = parse_version(version_text).ok_or_else(|| err("malformed version"))?;
        let precision = match op {
            Operator::Compatible => version_text.split('.').count(),
            _ => 0,
        };
        if op == Operator::Compatible && precision < 2 {
            return Err(err("~= needs at least two version components"));
        }

        Ok(Self {
            name,
            constraint: Some((op, version)),
            precision,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constraint(&self) -> Option<(Operator, &Version)> {
        self.constraint.as_ref().map(|(op, v)| (*op, v))
    }

    /// Equivalent semver requirement
    pub fn version_req(&self) -> VersionReq {
        let Some((op, v)) = &self.constraint else {
            return VersionReq::STAR;
        };
        let text = match op {
            Operator::Exact => format!("={}", v),
            Operator::GreaterEq => format!(">={}", v),
            Operator::Greater => format!(">{}", v),
            Operator::LessEq => format!("<={}", v),
            Operator::Less => format!("<{}", v),
            // ~=X.Y means >=X.Y, <X+1; ~=X.Y.Z means >=X.Y.Z, <X.Y+1
            Operator::Compatible if self.precision == 2 => {
                format!(">={}, <{}.0.0", v, v.major + 1)
            }
            Operator::Compatible => format!(">={}, <{}.{}.0", v, v.major, v.minor + 1),
        };
        // Built from a valid Version, so this cannot fail.
        VersionReq::parse(&text).unwrap_or(VersionReq::STAR)
    }

    /// Check whether a release satisfies this requirement
    pub fn matches(&self, version: &Version) -> bool {
        self.version_req().matches(version)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some((Operator::Compatible, v)) if self.precision == 2 => {
                write!(f, "{}~={}.{}", self.name, v.major, v.minor)
            }
            Some((op, v)) => write!(f, "{}{}{}", self.name, op.as_str(), v),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for Requirement {
    type Err = RequirementParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Requirement> for String {
    fn from(r: Requirement) -> Self {
        r.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name() {
        let req = Requirement::parse(" Kivy_Garden ").unwrap();
        assert_eq!(req.name(), "kivy-garden");
        assert!(req.constraint().is_none());
        assert!(req.matches(&Version::new(0, 0, 1)));
    }

    #[test]
    fn test_exact_pads_version() {
        let req = Requirement::parse("kivy==2.2").unwrap();
        assert_eq!(req.to_string(), "kivy==2.2.0");
        assert!(req.matches(&Version::new(2, 2, 0)));
        assert!(!req.matches(&Version::new(2, 2, 1)));
    }

    #[test]
    fn test_compatible_release() {
        let minor = Requirement::parse("requests~=2.28").unwrap();
        assert!(minor.matches(&Version::new(2, 31, 0)));
        assert!(!minor.matches(&Version::new(3, 0, 0)));

        let patch = Requirement::parse("requests~=2.28.0").unwrap();
        assert!(patch.matches(&Version::new(2, 28, 9)));
        assert!(!patch.matches(&Version::new(2, 29, 0)));
        assert_eq!(patch.to_string(), "requests~=2.28.0");
        assert_eq!(minor.to_string(), "requests~=2.28");
    }

    #[test]
    fn test_rejected_forms() {
        assert!(Requirement::parse("kivy!=2.0").is_err());
        assert!(Requirement::parse("==2.0").is_err());
        assert!(Requirement::parse("kivy==two").is_err());
        assert!(Requirement::parse("kivy~=2").is_err());
        assert!(Requirement::parse("git+https://x").is_err());
    }

    #[test]
    fn test_display_reparses_identically() {
        for text in ["python3", "openssl>=1.1", "pyjnius<2", "sdl2~=2.26.0"] {
            let req = Requirement::parse(text).unwrap();
            assert_eq!(Requirement::parse(&req.to_string()).unwrap(), req);
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version("1.x"), None);
    }
}
