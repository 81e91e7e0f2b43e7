//! Core identity, version, and manifest types for the Keel module system.
//!
//! Everything here is shared between the registry client and the resolver:
//! module identities (`PackageVersion`), semantic-version helpers including
//! pseudo-version handling, language-version gating, and the `keel.toml`
//! manifest model.

pub mod ident;
pub mod lang;
pub mod manifest;
pub mod version;

// Re-exports for convenience.
pub use ident::{
    check_path, escape_path, escape_version, is_registry_path, is_std_path, module_prefixes,
    PackageVersion, PathError, Revision,
};
pub use manifest::{
    ExcludedVersion, ManifestError, ManifestFile, Replacement, Requirement, MANIFEST_FILE_NAME,
};
pub use version::{is_canonical, is_pseudo, parse_canonical, pseudo_time, Version};
