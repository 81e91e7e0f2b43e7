//! Module and package identities.
//!
//! A module path is a slash-separated sequence of elements. Paths whose first
//! element contains a dot (a registry host) name registry modules; paths
//! whose first element has no dot belong to the standard library and are
//! resolved from the toolchain, never from a registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A resolved revision of a module: either a concrete semantic version or
/// the `none` sentinel, which sorts below every version and marks a module
/// that is known but not selected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Revision {
    #[default]
    None,
    Version(semver::Version),
}

impl Revision {
    /// Shorthand for a concrete version revision.
    pub fn version(v: semver::Version) -> Self {
        Revision::Version(v)
    }

    /// The concrete version, if this revision is not `none`.
    pub fn as_version(&self) -> Option<&semver::Version> {
        match self {
            Revision::None => None,
            Revision::Version(v) => Some(v),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Revision::None)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::None => write!(f, "none"),
            Revision::Version(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for Revision {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(Revision::None);
        }
        Ok(Revision::Version(semver::Version::parse(s)?))
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The (path, revision) identity of a module version.
///
/// Immutable once observed; two `PackageVersion`s are the same module version
/// exactly when they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageVersion {
    pub path: String,
    pub revision: Revision,
}

impl PackageVersion {
    pub fn new(path: impl Into<String>, revision: Revision) -> Self {
        PackageVersion {
            path: path.into(),
            revision,
        }
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.revision)
    }
}

/// Error returned for a malformed module path.
#[derive(Debug, thiserror::Error)]
#[error("invalid module path {path:?}: {detail}")]
pub struct PathError {
    pub path: String,
    pub detail: &'static str,
}

/// Validate the shape of a module or package path.
pub fn check_path(path: &str) -> Result<(), PathError> {
    let err = |detail| {
        Err(PathError {
            path: path.to_string(),
            detail,
        })
    };
    if path.is_empty() {
        return err("empty path");
    }
    if path.starts_with('/') || path.ends_with('/') {
        return err("leading or trailing slash");
    }
    for elem in path.split('/') {
        if elem.is_empty() {
            return err("empty path element");
        }
        if elem.starts_with('.') || elem.ends_with('.') {
            return err("path element begins or ends with a dot");
        }
        for c in elem.chars() {
            if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~')) {
                return err("path element contains a disallowed character");
            }
        }
    }
    Ok(())
}

/// Whether `path` names a registry module (first element contains a dot).
pub fn is_registry_path(path: &str) -> bool {
    match path.split('/').next() {
        Some(first) => first.contains('.'),
        None => false,
    }
}

/// Whether `path` belongs to the standard library.
pub fn is_std_path(path: &str) -> bool {
    !is_registry_path(path)
}

/// Escape a module path for use in a registry URL.
///
/// Mirrors may run on case-insensitive filesystems, so an uppercase letter
/// `X` is encoded as `!x`. `/` is left as-is; the fetch protocol keeps path
/// separators intact.
pub fn escape_path(path: &str) -> String {
    escape_case(path)
}

/// Escape a version string for use in a registry URL, with the same
/// case-encoding rules as [`escape_path`].
pub fn escape_version(version: &str) -> String {
    escape_case(version)
}

fn escape_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Candidate module paths for an import path, longest first.
///
/// Only registry-shaped prefixes are produced; a standard-library import has
/// no candidate modules at all.
pub fn module_prefixes(path: &str) -> impl Iterator<Item = &str> {
    let registry = is_registry_path(path);
    let mut end = if registry { Some(path.len()) } else { None };
    std::iter::from_fn(move || {
        let cur = end?;
        let prefix = &path[..cur];
        end = path[..cur].rfind('/');
        Some(prefix)
    })
}
