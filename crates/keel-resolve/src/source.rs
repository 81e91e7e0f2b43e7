//! Collaborator seams between the resolver and the outside world.
//!
//! `ModuleSource` supplies module manifests and latest-revision answers;
//! the production implementation is backed by the mirror client with the
//! content cache in front. `PackageStore` answers whether a module version
//! provides a given package directory, from extracted sources in the cache.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keel_core::{ManifestFile, PackageVersion, Revision};
use keel_registry::{MirrorClient, ModuleCache, RegistryError, RevisionInfo};

use crate::error::{ResolveError, Result};
use crate::scan::has_source_files;

/// Supplies module requirement manifests and latest-revision queries.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// The parsed manifest of a concrete module version.
    async fn manifest(
        &self,
        cancel: &CancellationToken,
        module: &PackageVersion,
    ) -> Result<ManifestFile>;

    /// The latest revision of a module path, for missing-import queries.
    async fn latest(&self, cancel: &CancellationToken, path: &str) -> Result<RevisionInfo>;
}

/// Answers package-directory lookups inside extracted module sources.
pub trait PackageStore: Send + Sync {
    /// Directory of the package at `rel` inside `module`, if that module
    /// version provides it. `rel` is the package path relative to the
    /// module path ("" for the module's root package).
    fn package_dir(&self, module: &PackageVersion, rel: &str) -> Option<PathBuf>;

    /// Path of the module's manifest on disk, when one is materialized.
    fn manifest_path(&self, module: &PackageVersion) -> Option<PathBuf> {
        let _ = module;
        None
    }
}

/// The production `ModuleSource`: content cache first, mirror chain second.
pub struct RegistrySource {
    client: MirrorClient,
    cache: ModuleCache,
}

impl RegistrySource {
    pub fn new(client: MirrorClient, cache: ModuleCache) -> Self {
        RegistrySource { client, cache }
    }
}

#[async_trait]
impl ModuleSource for RegistrySource {
    async fn manifest(
        &self,
        cancel: &CancellationToken,
        module: &PackageVersion,
    ) -> Result<ManifestFile> {
        let Revision::Version(version) = &module.revision else {
            return Err(ResolveError::Registry(RegistryError::Internal {
                detail: format!("manifest requested for unselected module {}", module.path),
            }));
        };

        let data = match self.cache.read_manifest(module)? {
            Some(data) => data,
            None => {
                let data = self
                    .client
                    .fetch_manifest(cancel, &module.path, version)
                    .await?;
                self.cache.store_manifest(module, &data)?;
                data
            }
        };

        let manifest = ManifestFile::parse(&String::from_utf8_lossy(&data))?;
        if manifest.module != module.path {
            return Err(ResolveError::MismatchedManifest {
                module: module.clone(),
                declared: manifest.module,
            });
        }
        Ok(manifest)
    }

    async fn latest(&self, cancel: &CancellationToken, path: &str) -> Result<RevisionInfo> {
        Ok(self.client.latest(cancel, path).await?)
    }
}

/// The production `PackageStore`, over extracted sources in the cache.
pub struct CacheStore {
    cache: ModuleCache,
}

impl CacheStore {
    pub fn new(cache: ModuleCache) -> Self {
        CacheStore { cache }
    }
}

impl PackageStore for CacheStore {
    fn package_dir(&self, module: &PackageVersion, rel: &str) -> Option<PathBuf> {
        let src = self.cache.src_dir(module)?;
        let dir = if rel.is_empty() { src } else { src.join(rel) };
        (dir.is_dir() && has_source_files(&dir)).then_some(dir)
    }

    fn manifest_path(&self, module: &PackageVersion) -> Option<PathBuf> {
        self.cache.manifest_path(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_registry::RegistrySpec;

    fn module(path: &str, version: &str) -> PackageVersion {
        PackageVersion::new(
            path,
            Revision::version(semver::Version::parse(version).unwrap()),
        )
    }

    fn offline_source(cache: ModuleCache) -> RegistrySource {
        // No mirrors configured: anything that misses the cache fails.
        RegistrySource::new(MirrorClient::new(Vec::<RegistrySpec>::new()), cache)
    }

    #[tokio::test]
    async fn manifest_served_from_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(tmp.path().to_path_buf());
        let m = module("registry.example/math", "1.0.0");
        cache
            .store_manifest(&m, b"module = \"registry.example/math\"\nlanguage = \"1.1\"\n")
            .unwrap();

        let source = offline_source(cache);
        let manifest = source.manifest(&CancellationToken::new(), &m).await.unwrap();
        assert_eq!(manifest.module, "registry.example/math");
        assert_eq!(manifest.language.as_deref(), Some("1.1"));
    }

    #[tokio::test]
    async fn mismatched_manifest_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(tmp.path().to_path_buf());
        let m = module("registry.example/math", "1.0.0");
        cache
            .store_manifest(&m, b"module = \"registry.example/other\"\n")
            .unwrap();

        let source = offline_source(cache);
        let err = source
            .manifest(&CancellationToken::new(), &m)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MismatchedManifest { .. }));
    }

    #[tokio::test]
    async fn cache_miss_without_mirrors_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(tmp.path().to_path_buf());
        let source = offline_source(cache);
        let err = source
            .manifest(&CancellationToken::new(), &module("registry.example/math", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Registry(RegistryError::NoMirrors)
        ));
    }

    #[test]
    fn store_finds_extracted_packages() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(tmp.path().to_path_buf());
        let m = module("registry.example/math", "1.0.0");
        let src = tmp
            .path()
            .join("registry.example/math/1.0.0/src/vector");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("vec.kl"), "fn dot() {}\n").unwrap();

        let store = CacheStore::new(cache);
        assert!(store.package_dir(&m, "vector").is_some());
        assert!(store.package_dir(&m, "").is_none());
        assert!(store.package_dir(&m, "missing").is_none());
    }
}
