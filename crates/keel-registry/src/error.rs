//! Registry error taxonomy.
//!
//! Errors fall into three ranks that drive mirror fallback: not-found errors
//! are soft and always allow trying the next mirror; generic mirror errors
//! allow fallback only where the mirror is configured for it; terminal
//! errors (protocol violations, checksum mismatches, oversized archives,
//! caller bugs) are never retried and outrank everything when reporting.

use std::path::PathBuf;
use std::sync::Arc;

use keel_core::PackageVersion;

/// How actionable an error is, for mirror-fallback reporting. Higher ranks
/// win when choosing which error to surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorRank {
    NotExist,
    Mirror,
    Terminal,
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The mirror does not know the requested path or version.
    #[error("{what}: not found on mirror {mirror}")]
    NotFound { what: String, mirror: String },

    /// No untagged revision exists to derive a latest version from.
    #[error("no revisions known for {path}")]
    NoRevisions { path: String },

    /// The mirror answered a request for one version with data for another.
    #[error(
        "mirror {mirror} returned info for version {actual} instead of requested version {requested} of {path}"
    )]
    ProtocolViolation {
        mirror: String,
        path: String,
        requested: String,
        actual: String,
    },

    /// A cached or downloaded artifact does not match its recorded hash.
    #[error("checksum mismatch for {module} ({file}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        module: PackageVersion,
        file: String,
        expected: String,
        actual: String,
    },

    /// The archive exceeded the caller-supplied size limit.
    #[error("archive for {module} exceeds the size limit of {limit} bytes")]
    SizeExceeded { module: PackageVersion, limit: u64 },

    /// A caller bug, such as passing a non-canonical version to an operation
    /// that requires one.
    #[error("internal error: {detail}")]
    Internal { detail: String },

    /// The mirror list is empty. This is a configuration error, never a
    /// silent success.
    #[error("no registry mirrors configured")]
    NoMirrors,

    /// A mirror URL that cannot be used.
    #[error("invalid mirror URL {url:?}: {detail}")]
    InvalidMirror { url: String, detail: String },

    /// The mirror returned a body that does not parse as the protocol
    /// requires.
    #[error("invalid response from mirror {mirror}: {detail}")]
    InvalidResponse { mirror: String, detail: String },

    /// The mirror answered with an unexpected HTTP status.
    #[error("mirror {mirror}: server returned {status} for {url}")]
    Status {
        mirror: String,
        status: u16,
        url: String,
    },

    /// A transport-level failure talking to the mirror.
    #[error("mirror {mirror}: {source}")]
    Transport {
        mirror: String,
        #[source]
        source: reqwest::Error,
    },

    /// A local cache I/O failure.
    #[error("cache error at {path}: {detail}")]
    Cache { path: PathBuf, detail: String },

    /// The operation was cancelled by the caller.
    #[error("registry request cancelled")]
    Cancelled,

    /// A shared result produced by a single-flight computation.
    #[error(transparent)]
    Cached(Arc<RegistryError>),
}

impl RegistryError {
    /// Follow single-flight sharing to the underlying error.
    pub fn root(&self) -> &RegistryError {
        let mut err = self;
        while let RegistryError::Cached(inner) = err {
            err = inner;
        }
        err
    }

    /// Whether this is a soft not-found error, eligible for mirror fallback
    /// regardless of the mirror's fallback policy.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            RegistryError::NotFound { .. } | RegistryError::NoRevisions { .. }
        )
    }

    /// The fallback-reporting rank of this error.
    pub fn rank(&self) -> ErrorRank {
        match self.root() {
            RegistryError::NotFound { .. } | RegistryError::NoRevisions { .. } => {
                ErrorRank::NotExist
            }
            RegistryError::InvalidResponse { .. }
            | RegistryError::Status { .. }
            | RegistryError::Transport { .. }
            | RegistryError::Cache { .. } => ErrorRank::Mirror,
            _ => ErrorRank::Terminal,
        }
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
