//! CLI command implementations.

pub mod check;
pub mod fetch;
pub mod graph;
pub mod list;
pub mod versions;
pub mod why;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use keel_registry::{parse_mirror_list, MirrorClient, ModuleCache, RegistrySpec};
use keel_resolve::{
    CacheStore, Loader, LoaderOptions, MainModules, RegistrySource, SourceScanner,
};

/// Shared command environment: mirror configuration, cache location, and
/// the main module root.
pub struct Env {
    mirrors: Vec<RegistrySpec>,
    cache_root: PathBuf,
    module_root: PathBuf,
}

impl Env {
    pub fn new(
        mirrors: Option<String>,
        cache_dir: Option<PathBuf>,
        module_root: Option<PathBuf>,
    ) -> anyhow::Result<Env> {
        let mirror_list = mirrors
            .or_else(|| std::env::var("KEEL_MIRRORS").ok())
            .unwrap_or_default();
        let mirrors = parse_mirror_list(&mirror_list)?;

        let cache_root = match cache_dir {
            Some(dir) => dir,
            None => ModuleCache::default_location()
                .context("cannot determine the default cache directory (is HOME set?)")?
                .root()
                .to_path_buf(),
        };
        let module_root = match module_root {
            Some(dir) => dir,
            None => std::env::current_dir().context("cannot determine the working directory")?,
        };

        Ok(Env {
            mirrors,
            cache_root,
            module_root,
        })
    }

    pub fn client(&self) -> MirrorClient {
        MirrorClient::new(self.mirrors.clone())
    }

    pub fn cache(&self) -> ModuleCache {
        ModuleCache::new(self.cache_root.clone())
    }

    pub fn main_modules(&self) -> anyhow::Result<MainModules> {
        MainModules::single(self.module_root.clone()).with_context(|| {
            format!(
                "loading the main module manifest in {}",
                self.module_root.display()
            )
        })
    }

    pub fn source(&self) -> RegistrySource {
        RegistrySource::new(self.client(), self.cache())
    }

    pub fn loader(&self, opts: LoaderOptions) -> anyhow::Result<Loader> {
        Ok(Loader::new(
            self.main_modules()?,
            Arc::new(self.source()),
            Arc::new(CacheStore::new(self.cache())),
            Arc::new(SourceScanner),
            opts,
        ))
    }
}
