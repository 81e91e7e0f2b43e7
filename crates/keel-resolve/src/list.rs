//! Resolution patterns and the flat package records reported to callers.

use std::path::PathBuf;

use serde::Serialize;

use keel_core::PackageVersion;
use keel_registry::Origin;

/// A package pattern requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// The `all` meta-pattern: the maximal dependency closure of the main
    /// modules.
    All,
    /// A `prefix/...` wildcard.
    Prefix(String),
    /// A literal package path.
    Exact(String),
}

impl Pattern {
    pub fn parse(s: &str) -> Pattern {
        if s == "all" {
            Pattern::All
        } else if let Some(prefix) = s.strip_suffix("/...") {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(s.to_string())
        }
    }

    /// Whether a package path matches this pattern. The `all` meta-pattern
    /// is resolved structurally by the loader, not by path shape, so it
    /// never matches here.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::All => false,
            Pattern::Prefix(prefix) => {
                path == prefix || path.starts_with(&format!("{prefix}/"))
            }
            Pattern::Exact(exact) => path == exact,
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::All => write!(f, "all"),
            Pattern::Prefix(prefix) => write!(f, "{prefix}/..."),
            Pattern::Exact(exact) => write!(f, "{exact}"),
        }
    }
}

/// A flat, serializable record describing one resolved package, suitable
/// for downstream cataloging.
#[derive(Debug, Clone, Serialize)]
pub struct PackageDescriptor {
    /// Import path of the package.
    pub path: String,
    /// The module version providing the package; absent for standard
    /// library packages and packages that failed to resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<PackageVersion>,
    /// The pattern that requested this package, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// The replacement module actually used, when the main module redirects
    /// the providing module.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace: Option<PackageVersion>,
    /// Directory containing the package sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Path of the providing module's manifest, when materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    /// Error encountered loading this package, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provenance of the providing module version, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}
