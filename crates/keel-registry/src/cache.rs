//! Local content cache keyed by module identity.
//!
//! Stores fetched manifests and archives in a directory tree organized by
//! escaped module path and version, alongside an integrity record of their
//! SHA-256 digests. Reads verify against the record; a mismatch is fatal
//! and never downgraded to a warning.
//!
//! Layout:
//! ```text
//! <cache_root>/
//!   <escaped-module-path>/
//!     <version>/
//!       manifest.toml    — Module manifest bytes as fetched
//!       module.zip       — Module archive
//!       integrity.json   — Hash records
//!       src/             — Extracted sources (populated externally)
//! ```

use std::path::{Path, PathBuf};

use keel_core::{escape_path, PackageVersion, Revision};

use crate::error::{RegistryError, Result};
use crate::integrity::{ContentHash, IntegrityRecord};

const MANIFEST_FILE: &str = "manifest.toml";
const ARCHIVE_FILE: &str = "module.zip";
const INTEGRITY_FILE: &str = "integrity.json";

/// A filesystem cache of fetched module artifacts.
#[derive(Debug, Clone)]
pub struct ModuleCache {
    root: PathBuf,
}

impl ModuleCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: PathBuf) -> Self {
        ModuleCache { root }
    }

    /// Create a cache at the default location (`~/.keel/cache`).
    pub fn default_location() -> Option<Self> {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| ModuleCache::new(home.join(".keel").join("cache")))
    }

    /// Get the root directory of this cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding artifacts for one module version.
    pub fn module_dir(&self, module: &PackageVersion) -> Result<PathBuf> {
        let version = match &module.revision {
            Revision::Version(v) => v.to_string(),
            Revision::None => {
                return Err(RegistryError::Internal {
                    detail: format!("cache lookup for unselected module {}", module.path),
                })
            }
        };
        Ok(self.root.join(escape_path(&module.path)).join(version))
    }

    /// Directory of the extracted sources for a module version, if present.
    pub fn src_dir(&self, module: &PackageVersion) -> Option<PathBuf> {
        let dir = self.module_dir(module).ok()?.join("src");
        dir.is_dir().then_some(dir)
    }

    /// Whether a manifest for this module version is cached.
    pub fn has_manifest(&self, module: &PackageVersion) -> bool {
        self.manifest_path(module).is_some()
    }

    /// Path of the cached manifest for a module version, if present.
    pub fn manifest_path(&self, module: &PackageVersion) -> Option<PathBuf> {
        let path = self.module_dir(module).ok()?.join(MANIFEST_FILE);
        path.is_file().then_some(path)
    }

    /// Store fetched manifest bytes, recording their hash.
    pub fn store_manifest(&self, module: &PackageVersion, data: &[u8]) -> Result<PathBuf> {
        self.store(module, MANIFEST_FILE, data, |record, hash| {
            record.manifest_hash = Some(hash)
        })
    }

    /// Store fetched archive bytes, recording their hash.
    pub fn store_archive(&self, module: &PackageVersion, data: &[u8]) -> Result<PathBuf> {
        self.store(module, ARCHIVE_FILE, data, |record, hash| {
            record.archive_hash = Some(hash)
        })
    }

    /// Read cached manifest bytes, verifying them against the integrity
    /// record. Returns `Ok(None)` when nothing is cached.
    pub fn read_manifest(&self, module: &PackageVersion) -> Result<Option<Vec<u8>>> {
        self.read(module, MANIFEST_FILE, |record| record.manifest_hash.as_ref())
    }

    /// Read cached archive bytes, verifying them against the integrity
    /// record. Returns `Ok(None)` when nothing is cached.
    pub fn read_archive(&self, module: &PackageVersion) -> Result<Option<Vec<u8>>> {
        self.read(module, ARCHIVE_FILE, |record| record.archive_hash.as_ref())
    }

    /// Remove every cached artifact of a module version.
    pub fn remove(&self, module: &PackageVersion) -> Result<bool> {
        let dir = self.module_dir(module)?;
        if !dir.is_dir() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir).map_err(|e| RegistryError::Cache {
            path: dir,
            detail: format!("removing cache entry: {e}"),
        })?;
        Ok(true)
    }

    fn store(
        &self,
        module: &PackageVersion,
        file: &str,
        data: &[u8],
        set_hash: impl FnOnce(&mut IntegrityRecord, ContentHash),
    ) -> Result<PathBuf> {
        let dir = self.module_dir(module)?;
        std::fs::create_dir_all(&dir).map_err(|e| RegistryError::Cache {
            path: dir.clone(),
            detail: format!("creating cache dir: {e}"),
        })?;

        let path = dir.join(file);
        std::fs::write(&path, data).map_err(|e| RegistryError::Cache {
            path: path.clone(),
            detail: format!("writing {file}: {e}"),
        })?;

        let mut record = self.load_record(&dir)?;
        set_hash(&mut record, ContentHash::compute(data));
        self.save_record(&dir, &record)?;

        Ok(path)
    }

    fn read(
        &self,
        module: &PackageVersion,
        file: &str,
        hash_of: impl FnOnce(&IntegrityRecord) -> Option<&ContentHash>,
    ) -> Result<Option<Vec<u8>>> {
        let dir = self.module_dir(module)?;
        let path = dir.join(file);
        if !path.is_file() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| RegistryError::Cache {
            path: path.clone(),
            detail: format!("reading {file}: {e}"),
        })?;

        let record = self.load_record(&dir)?;
        if let Some(expected) = hash_of(&record) {
            let actual = ContentHash::compute(&data);
            if actual != *expected {
                return Err(RegistryError::ChecksumMismatch {
                    module: module.clone(),
                    file: file.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(Some(data))
    }

    fn load_record(&self, dir: &Path) -> Result<IntegrityRecord> {
        let path = dir.join(INTEGRITY_FILE);
        if !path.is_file() {
            return Ok(IntegrityRecord::default());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| RegistryError::Cache {
            path: path.clone(),
            detail: format!("reading integrity record: {e}"),
        })?;
        serde_json::from_str(&data).map_err(|e| RegistryError::Cache {
            path,
            detail: format!("parsing integrity record: {e}"),
        })
    }

    fn save_record(&self, dir: &Path, record: &IntegrityRecord) -> Result<()> {
        let path = dir.join(INTEGRITY_FILE);
        let data = serde_json::to_string_pretty(record).map_err(|e| RegistryError::Cache {
            path: path.clone(),
            detail: format!("encoding integrity record: {e}"),
        })?;
        std::fs::write(&path, data).map_err(|e| RegistryError::Cache {
            path,
            detail: format!("writing integrity record: {e}"),
        })
    }
}
