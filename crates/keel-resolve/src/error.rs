//! Resolution error types.

use keel_core::{ManifestError, PackageVersion};
use keel_registry::RegistryError;

/// Errors from package and module resolution.
///
/// Per-package errors are recorded on the package node that caused them and
/// never abort sibling resolution; only graph-level errors (a broken root
/// manifest, an empty mirror list) fail a whole resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No selected module provides the imported package. Triggers the
    /// missing-import query path before being reported.
    #[error("no module provides package {path}")]
    MissingImport { path: String },

    /// More than one selected module could provide the imported package.
    /// Reported, never resolved automatically.
    #[error("ambiguous import: package {path} is provided by modules {}", candidates.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", "))]
    AmbiguousImport {
        path: String,
        candidates: Vec<PackageVersion>,
    },

    /// The module's manifest declares a minimum language version newer than
    /// this resolver supports.
    #[error("module {module} requires language {required}; this resolver supports up to {supported}")]
    TooNew {
        module: PackageVersion,
        required: String,
        supported: String,
    },

    /// A fetched manifest declares a different module path than the one it
    /// was fetched for.
    #[error("manifest for {module} declares module path {declared:?}")]
    MismatchedManifest {
        module: PackageVersion,
        declared: String,
    },

    /// Failure scanning a package directory for imports.
    #[error("scanning {dir}: {source}")]
    Scan {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    /// The resolution was cancelled by the caller.
    #[error("resolution cancelled")]
    Cancelled,

    /// A package-level error promoted to a resolution failure because the
    /// loader was not error-tolerant.
    #[error("loading {path}: {cause}")]
    Load {
        path: String,
        cause: std::sync::Arc<ResolveError>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl ResolveError {
    /// Whether this error means a package's owning module is simply not in
    /// the current requirement set, making it eligible for the
    /// missing-import query path.
    pub fn is_missing_import(&self) -> bool {
        matches!(self, ResolveError::MissingImport { .. })
    }

    /// The required language version, if this is a too-new error.
    pub fn too_new_requirement(&self) -> Option<&str> {
        match self {
            ResolveError::TooNew { required, .. } => Some(required),
            _ => None,
        }
    }
}

/// Result type alias for resolution operations.
pub type Result<T> = std::result::Result<T, ResolveError>;
