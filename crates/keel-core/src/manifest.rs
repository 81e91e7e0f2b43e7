//! `keel.toml` manifest parsing.
//!
//! Every module version publishes a manifest declaring its module path, the
//! minimum language version it needs, and its direct requirements. The main
//! module's manifest may additionally exclude known-bad versions and replace
//! modules with forks.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ident::{check_path, is_registry_path, PackageVersion, Revision};
use crate::version::Version;

/// File name of a module manifest, at the module root.
pub const MANIFEST_FILE_NAME: &str = "keel.toml";

/// A parsed module manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Module path (required).
    pub module: String,
    /// Minimum language version, e.g. "1.1".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Direct requirements, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<Requirement>,
    /// Versions excluded from version queries. Main module only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<ExcludedVersion>,
    /// Module replacements. Main module only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace: Vec<Replacement>,
}

/// A single requirement: a minimum version of another module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub module: String,
    pub version: Version,
    /// True if no package of the declaring module imports this requirement
    /// directly.
    #[serde(default)]
    pub indirect: bool,
}

impl Requirement {
    /// The required module version as an identity.
    pub fn package_version(&self) -> PackageVersion {
        PackageVersion::new(self.module.clone(), Revision::version(self.version.clone()))
    }
}

/// A version excluded from consideration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedVersion {
    pub module: String,
    pub version: Version,
}

/// A module replacement directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    pub module: String,
    pub with: String,
    pub version: Version,
}

/// Errors from manifest parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("manifest for {module:?}: {detail}")]
    Invalid { module: String, detail: String },

    #[error("I/O error reading manifest: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestFile {
    /// Parse a manifest from TOML text and validate its identities.
    pub fn parse(input: &str) -> Result<Self, ManifestError> {
        let manifest: ManifestFile = toml::from_str(input)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest from a file path.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |detail: String| ManifestError::Invalid {
            module: self.module.clone(),
            detail,
        };
        if self.module.is_empty() {
            return Err(invalid("module path is required".to_string()));
        }
        check_path(&self.module).map_err(|e| invalid(e.to_string()))?;
        for req in &self.require {
            check_path(&req.module).map_err(|e| invalid(e.to_string()))?;
            if !is_registry_path(&req.module) {
                return Err(invalid(format!(
                    "requirement {:?} is not a registry module path",
                    req.module
                )));
            }
        }
        for rep in &self.replace {
            check_path(&rep.module).map_err(|e| invalid(e.to_string()))?;
            check_path(&rep.with).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// The version this manifest requires for `path`, if any.
    pub fn required_version(&self, path: &str) -> Option<&Version> {
        self.require
            .iter()
            .find(|r| r.module == path)
            .map(|r| &r.version)
    }

    /// Whether the given module version is excluded.
    pub fn is_excluded(&self, pv: &PackageVersion) -> bool {
        self.exclude.iter().any(|e| {
            e.module == pv.path && Revision::version(e.version.clone()) == pv.revision
        })
    }

    /// The replacement for `path`, if one is declared.
    pub fn replacement_for(&self, path: &str) -> Option<PackageVersion> {
        self.replace.iter().find(|r| r.module == path).map(|r| {
            PackageVersion::new(r.with.clone(), Revision::version(r.version.clone()))
        })
    }

    /// Replacements as a lookup map from replaced path.
    pub fn replacement_map(&self) -> HashMap<String, PackageVersion> {
        self.replace
            .iter()
            .map(|r| {
                (
                    r.module.clone(),
                    PackageVersion::new(r.with.clone(), Revision::version(r.version.clone())),
                )
            })
            .collect()
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, ManifestError> {
        toml::to_string_pretty(self).map_err(|e| ManifestError::Invalid {
            module: self.module.clone(),
            detail: format!("failed to serialize: {e}"),
        })
    }
}
