//! Requirement snapshots, main modules, and the module graph.
//!
//! A `Requirements` value is an immutable snapshot of the root requirement
//! set under a pruning policy. Snapshots are replaced, never mutated in
//! place: growing the root set produces a new snapshot, so concurrent
//! readers holding an old reference always see a consistent (if stale)
//! view. The module graph derived from a snapshot is memoized and computed
//! at most once.
//!
//! Version selection is minimal version selection: the build list contains,
//! for each module path reachable from the roots, the maximum version any
//! reachable requirement names. Selection is a fold over a set, so it is
//! independent of traversal order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::{lang, ManifestFile, PackageVersion, Revision, MANIFEST_FILE_NAME};

use crate::error::{ResolveError, Result};
use crate::source::ModuleSource;

/// How much of the transitive requirement graph is traversed and trusted.
///
/// `Pruned` is a restriction of `Unpruned`: it expands only the manifests of
/// root modules, trusting their complete requirement lists. `Workspace`
/// unions multiple main modules and evaluates them pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pruning {
    Pruned,
    Unpruned,
    Workspace,
}

/// One main module: a manifest and a source tree on local disk.
#[derive(Debug, Clone)]
pub struct MainModule {
    pub module: PackageVersion,
    pub root_dir: PathBuf,
    pub manifest: ManifestFile,
}

/// The set of main modules for a resolution: exactly one in the ordinary
/// case, several in workspace mode.
#[derive(Debug, Clone)]
pub struct MainModules {
    members: Vec<MainModule>,
}

impl MainModules {
    /// Load the single main module rooted at `root_dir`.
    pub fn single(root_dir: PathBuf) -> Result<Self> {
        let manifest = ManifestFile::load(&root_dir.join(MANIFEST_FILE_NAME))?;
        Ok(Self::from_members(vec![MainModule {
            module: PackageVersion::new(manifest.module.clone(), Revision::None),
            root_dir,
            manifest,
        }]))
    }

    /// Build a workspace from explicit members.
    pub fn from_members(members: Vec<MainModule>) -> Self {
        MainModules { members }
    }

    pub fn members(&self) -> &[MainModule] {
        &self.members
    }

    /// Whether `path` is the module path of a main module.
    pub fn contains(&self, path: &str) -> bool {
        self.members.iter().any(|m| m.module.path == path)
    }

    /// The main module providing the package at `pkg_path`, with the
    /// package's directory, chosen by longest module-path prefix.
    pub fn package_dir(&self, pkg_path: &str) -> Option<(PackageVersion, PathBuf)> {
        let mut best: Option<&MainModule> = None;
        for member in &self.members {
            let path = &member.module.path;
            if pkg_path == path || pkg_path.starts_with(&format!("{path}/")) {
                if best.map_or(true, |b| path.len() > b.module.path.len()) {
                    best = Some(member);
                }
            }
        }
        let member = best?;
        let rel = pkg_path[member.module.path.len()..].trim_start_matches('/');
        Some((member.module.clone(), member.root_dir.join(rel)))
    }

    /// Replacement directives, unioned across members.
    pub fn replacements(&self) -> HashMap<String, PackageVersion> {
        let mut map = HashMap::new();
        for member in &self.members {
            map.extend(member.manifest.replacement_map());
        }
        map
    }

    /// Whether any member manifest excludes the given module version.
    pub fn excludes(&self, module: &PackageVersion) -> bool {
        self.members.iter().any(|m| m.manifest.is_excluded(module))
    }

    /// The newest language version any member declares.
    pub fn language(&self) -> Option<&str> {
        self.members
            .iter()
            .filter_map(|m| m.manifest.language.as_deref())
            .max_by(|a, b| lang::compare(a, b))
    }

    /// Fail if a main module needs a newer resolver than this one.
    pub fn check_supported(&self) -> Result<()> {
        for member in &self.members {
            if let Some(declared) = member.manifest.language.as_deref() {
                if !lang::is_supported(declared) {
                    return Err(ResolveError::TooNew {
                        module: member.module.clone(),
                        required: declared.to_string(),
                        supported: lang::SUPPORTED.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The pruning policy implied by the main modules.
    pub fn default_pruning(&self) -> Pruning {
        if self.members.len() > 1 {
            return Pruning::Workspace;
        }
        if lang::supports_pruned_graph(self.language()) {
            Pruning::Pruned
        } else {
            Pruning::Unpruned
        }
    }

    /// The initial requirement snapshot: the union of the members' declared
    /// requirements, with non-indirect requirements marked direct.
    pub fn requirements(&self, pruning: Pruning) -> Requirements {
        let mut roots = Vec::new();
        let mut direct = HashSet::new();
        for member in &self.members {
            for req in &member.manifest.require {
                roots.push(req.package_version());
                if !req.indirect {
                    direct.insert(req.module.clone());
                }
            }
        }
        Requirements::new(pruning, roots, direct)
    }
}

/// An immutable requirement snapshot: pruning policy, ordered root modules,
/// and the set of module paths known to be directly imported.
pub struct Requirements {
    pruning: Pruning,
    root_modules: Vec<PackageVersion>,
    max_root_version: HashMap<String, Revision>,
    direct: HashSet<String>,
    graph: OnceCell<Arc<ModuleGraph>>,
}

impl Requirements {
    pub fn new(pruning: Pruning, roots: Vec<PackageVersion>, direct: HashSet<String>) -> Self {
        let mut root_modules = roots;
        root_modules.sort();
        root_modules.dedup();

        let mut max_root_version: HashMap<String, Revision> = HashMap::new();
        for root in &root_modules {
            let entry = max_root_version
                .entry(root.path.clone())
                .or_insert(Revision::None);
            if root.revision > *entry {
                *entry = root.revision.clone();
            }
        }

        Requirements {
            pruning,
            root_modules,
            max_root_version,
            direct,
            graph: OnceCell::new(),
        }
    }

    pub fn pruning(&self) -> Pruning {
        self.pruning
    }

    /// The ordered root set.
    pub fn root_modules(&self) -> &[PackageVersion] {
        &self.root_modules
    }

    /// The version selected for `path` considering only root requirements.
    pub fn root_selected(&self, path: &str) -> Option<Revision> {
        self.max_root_version.get(path).cloned()
    }

    /// Module paths known to provide directly imported packages.
    pub fn direct(&self) -> &HashSet<String> {
        &self.direct
    }

    /// A new snapshot with additional root requirements. Copy-on-write: the
    /// receiver is left untouched and keeps its memoized graph.
    pub fn with_added_roots<I>(&self, add: I) -> Requirements
    where
        I: IntoIterator<Item = PackageVersion>,
    {
        let mut roots = self.root_modules.clone();
        roots.extend(add);
        Requirements::new(self.pruning, roots, self.direct.clone())
    }

    /// A new snapshot with an updated direct set.
    pub fn with_direct(&self, direct: HashSet<String>) -> Requirements {
        Requirements::new(self.pruning, self.root_modules.clone(), direct)
    }

    /// Whether two snapshots have the same root set.
    pub fn same_roots(&self, other: &Requirements) -> bool {
        self.root_modules == other.root_modules
    }

    /// The module graph for this snapshot, computed at most once.
    /// Concurrent callers share the in-flight computation.
    pub async fn graph(
        &self,
        cancel: &CancellationToken,
        source: &dyn ModuleSource,
    ) -> Result<Arc<ModuleGraph>> {
        self.graph
            .get_or_try_init(|| async {
                ModuleGraph::expand(cancel, self, source).await.map(Arc::new)
            })
            .await
            .cloned()
    }
}

/// The derived view of a requirement snapshot: full requirement edges plus
/// the build list selecting exactly one version per path.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    edges: HashMap<PackageVersion, Vec<PackageVersion>>,
    selected: HashMap<String, Revision>,
}

impl ModuleGraph {
    /// Expand the requirement graph of a snapshot.
    ///
    /// Under pruned (and workspace) evaluation only the root manifests are
    /// read; their requirement lists are trusted to be complete. Under
    /// unpruned evaluation every reachable manifest is read. Requirement
    /// cycles terminate through the visited set.
    pub async fn expand(
        cancel: &CancellationToken,
        rs: &Requirements,
        source: &dyn ModuleSource,
    ) -> Result<ModuleGraph> {
        let mut graph = ModuleGraph::default();
        for root in rs.root_modules() {
            graph.bump(root);
        }

        let mut visited: HashSet<PackageVersion> = HashSet::new();
        let mut frontier: Vec<PackageVersion> = rs
            .root_modules()
            .iter()
            .filter(|m| !m.revision.is_none())
            .cloned()
            .collect();

        loop {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            frontier.sort();
            frontier.dedup();
            frontier.retain(|m| !visited.contains(m));
            if frontier.is_empty() {
                break;
            }
            visited.extend(frontier.iter().cloned());
            debug!(count = frontier.len(), "expanding requirement manifests");

            let manifests = futures::future::join_all(frontier.iter().map(|m| async {
                (m.clone(), source.manifest(cancel, m).await)
            }))
            .await;

            let mut next = Vec::new();
            for (module, result) in manifests {
                let manifest = result?;
                if let Some(declared) = manifest.language.as_deref() {
                    if !lang::is_supported(declared) {
                        return Err(ResolveError::TooNew {
                            module,
                            required: declared.to_string(),
                            supported: lang::SUPPORTED.to_string(),
                        });
                    }
                }
                let requires: Vec<PackageVersion> = manifest
                    .require
                    .iter()
                    .map(|r| r.package_version())
                    .collect();
                for req in &requires {
                    graph.bump(req);
                    next.push(req.clone());
                }
                graph.edges.insert(module, requires);
            }

            if rs.pruning() != Pruning::Unpruned {
                // Pruned and workspace graphs stop at the root manifests.
                break;
            }
            frontier = next;
        }

        Ok(graph)
    }

    fn bump(&mut self, module: &PackageVersion) {
        let entry = self
            .selected
            .entry(module.path.clone())
            .or_insert(Revision::None);
        if module.revision > *entry {
            *entry = module.revision.clone();
        }
    }

    /// The selected version for `path`; `Revision::None` when the path is
    /// not in the graph.
    pub fn selected(&self, path: &str) -> Revision {
        self.selected.get(path).cloned().unwrap_or(Revision::None)
    }

    /// The requirement edges recorded for `module`, if its manifest was
    /// read during expansion.
    pub fn required_by(&self, module: &PackageVersion) -> Option<&[PackageVersion]> {
        self.edges.get(module).map(Vec::as_slice)
    }

    /// The build list: exactly one selected version per path, sorted by
    /// path for determinism.
    pub fn build_list(&self) -> Vec<PackageVersion> {
        let mut list: Vec<PackageVersion> = self
            .selected
            .iter()
            .filter(|(_, revision)| !revision.is_none())
            .map(|(path, revision)| PackageVersion::new(path.clone(), revision.clone()))
            .collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_registry::RevisionInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pv(path: &str, version: &str) -> PackageVersion {
        PackageVersion::new(
            path,
            Revision::version(semver::Version::parse(version).unwrap()),
        )
    }

    fn manifest(module: &str, language: &str, requires: &[(&str, &str)]) -> ManifestFile {
        let mut text = format!("module = \"{module}\"\nlanguage = \"{language}\"\n");
        for (path, version) in requires {
            text.push_str(&format!(
                "\n[[require]]\nmodule = \"{path}\"\nversion = \"{version}\"\n"
            ));
        }
        ManifestFile::parse(&text).unwrap()
    }

    /// In-memory module source for graph tests.
    #[derive(Default)]
    struct FakeSource {
        manifests: HashMap<PackageVersion, ManifestFile>,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn add(&mut self, module: &str, version: &str, language: &str, requires: &[(&str, &str)]) {
            self.manifests
                .insert(pv(module, version), manifest(module, language, requires));
        }
    }

    #[async_trait]
    impl ModuleSource for FakeSource {
        async fn manifest(
            &self,
            _cancel: &CancellationToken,
            module: &PackageVersion,
        ) -> Result<ManifestFile> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.manifests
                .get(module)
                .cloned()
                .ok_or_else(|| ResolveError::MissingImport {
                    path: module.path.clone(),
                })
        }

        async fn latest(
            &self,
            _cancel: &CancellationToken,
            path: &str,
        ) -> Result<RevisionInfo> {
            Err(ResolveError::MissingImport {
                path: path.to_string(),
            })
        }
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn selection_takes_the_maximum_required_version() {
        let mut source = FakeSource::default();
        source.add("registry.example/a", "1.0.0", "1.1", &[("registry.example/p", "1.2.0")]);
        source.add("registry.example/b", "1.0.0", "1.1", &[("registry.example/p", "1.5.0")]);
        source.add("registry.example/p", "1.2.0", "1.1", &[]);
        source.add("registry.example/p", "1.5.0", "1.1", &[]);

        let rs = Requirements::new(
            Pruning::Unpruned,
            vec![pv("registry.example/a", "1.0.0"), pv("registry.example/b", "1.0.0")],
            HashSet::new(),
        );
        let graph = rs.graph(&cancel(), &source).await.unwrap();
        assert_eq!(
            graph.selected("registry.example/p"),
            Revision::version(semver::Version::new(1, 5, 0))
        );
    }

    #[tokio::test]
    async fn selection_is_independent_of_root_order() {
        let roots = vec![
            pv("registry.example/a", "1.0.0"),
            pv("registry.example/b", "1.0.0"),
            pv("registry.example/c", "1.0.0"),
        ];
        let make_source = || {
            let mut source = FakeSource::default();
            source.add("registry.example/a", "1.0.0", "1.1", &[("registry.example/p", "1.1.0")]);
            source.add("registry.example/b", "1.0.0", "1.1", &[("registry.example/p", "1.4.0")]);
            source.add("registry.example/c", "1.0.0", "1.1", &[("registry.example/q", "0.3.0")]);
            source.add("registry.example/p", "1.1.0", "1.1", &[]);
            source.add("registry.example/p", "1.4.0", "1.1", &[]);
            source.add("registry.example/q", "0.3.0", "1.1", &[]);
            source
        };

        let mut lists = Vec::new();
        for permutation in [
            vec![0usize, 1, 2],
            vec![2, 1, 0],
            vec![1, 2, 0],
        ] {
            let permuted: Vec<PackageVersion> =
                permutation.into_iter().map(|i| roots[i].clone()).collect();
            let rs = Requirements::new(Pruning::Unpruned, permuted, HashSet::new());
            let graph = rs.graph(&cancel(), &make_source()).await.unwrap();
            lists.push(graph.build_list());
        }
        assert_eq!(lists[0], lists[1]);
        assert_eq!(lists[1], lists[2]);
    }

    #[tokio::test]
    async fn requirement_cycles_terminate() {
        let mut source = FakeSource::default();
        source.add("registry.example/a", "1.0.0", "1.1", &[("registry.example/b", "1.0.0")]);
        source.add("registry.example/b", "1.0.0", "1.1", &[("registry.example/a", "1.0.0")]);

        let rs = Requirements::new(
            Pruning::Unpruned,
            vec![pv("registry.example/a", "1.0.0")],
            HashSet::new(),
        );
        let graph = rs.graph(&cancel(), &source).await.unwrap();
        let list = graph.build_list();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn pruned_graph_reads_only_root_manifests() {
        let mut source = FakeSource::default();
        source.add("registry.example/a", "1.0.0", "1.1", &[("registry.example/b", "1.0.0")]);
        // b's own manifest requires c; a pruned graph must not read it.
        source.add("registry.example/b", "1.0.0", "1.1", &[("registry.example/c", "1.0.0")]);
        source.add("registry.example/c", "1.0.0", "1.1", &[]);

        let roots = vec![pv("registry.example/a", "1.0.0")];

        let pruned = Requirements::new(Pruning::Pruned, roots.clone(), HashSet::new());
        let graph = pruned.graph(&cancel(), &source).await.unwrap();
        assert_eq!(graph.selected("registry.example/c"), Revision::None);

        let unpruned = Requirements::new(Pruning::Unpruned, roots, HashSet::new());
        let graph = unpruned.graph(&cancel(), &source).await.unwrap();
        assert_eq!(
            graph.selected("registry.example/c"),
            Revision::version(semver::Version::new(1, 0, 0))
        );
    }

    #[tokio::test]
    async fn graph_is_memoized() {
        let mut source = FakeSource::default();
        source.add("registry.example/a", "1.0.0", "1.1", &[]);
        let rs = Requirements::new(
            Pruning::Unpruned,
            vec![pv("registry.example/a", "1.0.0")],
            HashSet::new(),
        );
        rs.graph(&cancel(), &source).await.unwrap();
        rs.graph(&cancel(), &source).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn too_new_dependency_fails_expansion() {
        let mut source = FakeSource::default();
        source.add("registry.example/future", "1.0.0", "9.9", &[]);
        let rs = Requirements::new(
            Pruning::Unpruned,
            vec![pv("registry.example/future", "1.0.0")],
            HashSet::new(),
        );
        let err = rs.graph(&cancel(), &source).await.unwrap_err();
        assert!(matches!(err, ResolveError::TooNew { .. }));
    }

    #[test]
    fn added_roots_are_copy_on_write() {
        let rs = Requirements::new(
            Pruning::Pruned,
            vec![pv("registry.example/a", "1.0.0")],
            HashSet::new(),
        );
        let grown = rs.with_added_roots(vec![pv("registry.example/b", "2.0.0")]);
        assert_eq!(rs.root_modules().len(), 1);
        assert_eq!(grown.root_modules().len(), 2);
        assert!(!rs.same_roots(&grown));
        assert_eq!(
            grown.root_selected("registry.example/b"),
            Some(Revision::version(semver::Version::new(2, 0, 0)))
        );
    }

    #[test]
    fn duplicate_roots_keep_the_maximum() {
        let rs = Requirements::new(
            Pruning::Pruned,
            vec![pv("registry.example/a", "1.0.0"), pv("registry.example/a", "1.3.0")],
            HashSet::new(),
        );
        assert_eq!(
            rs.root_selected("registry.example/a"),
            Some(Revision::version(semver::Version::new(1, 3, 0)))
        );
    }

    #[test]
    fn main_module_package_dir_prefers_longest_prefix() {
        let outer = MainModule {
            module: PackageVersion::new("registry.example/app", Revision::None),
            root_dir: PathBuf::from("/work/app"),
            manifest: manifest("registry.example/app", "1.1", &[]),
        };
        let nested = MainModule {
            module: PackageVersion::new("registry.example/app/tools", Revision::None),
            root_dir: PathBuf::from("/work/app/tools"),
            manifest: manifest("registry.example/app/tools", "1.1", &[]),
        };
        let main = MainModules::from_members(vec![outer, nested]);

        let (module, dir) = main.package_dir("registry.example/app/tools/cli").unwrap();
        assert_eq!(module.path, "registry.example/app/tools");
        assert_eq!(dir, PathBuf::from("/work/app/tools/cli"));

        let (module, _) = main.package_dir("registry.example/app/web").unwrap();
        assert_eq!(module.path, "registry.example/app");

        assert!(main.package_dir("registry.example/other").is_none());
        assert_eq!(main.default_pruning(), Pruning::Workspace);
    }

    #[test]
    fn default_pruning_follows_language() {
        let modern = MainModules::from_members(vec![MainModule {
            module: PackageVersion::new("registry.example/app", Revision::None),
            root_dir: PathBuf::from("/work/app"),
            manifest: manifest("registry.example/app", "1.1", &[]),
        }]);
        assert_eq!(modern.default_pruning(), Pruning::Pruned);

        let legacy = MainModules::from_members(vec![MainModule {
            module: PackageVersion::new("registry.example/old", Revision::None),
            root_dir: PathBuf::from("/work/old"),
            manifest: manifest("registry.example/old", "1.0", &[]),
        }]);
        assert_eq!(legacy.default_pruning(), Pruning::Unpruned);
    }

    #[test]
    fn initial_requirements_mark_direct_paths() {
        let text = r#"
module = "registry.example/app"
language = "1.1"

[[require]]
module = "registry.example/math"
version = "1.2.0"

[[require]]
module = "registry.example/log"
version = "0.4.0"
indirect = true
"#;
        let main = MainModules::from_members(vec![MainModule {
            module: PackageVersion::new("registry.example/app", Revision::None),
            root_dir: PathBuf::from("/work/app"),
            manifest: ManifestFile::parse(text).unwrap(),
        }]);
        let rs = main.requirements(Pruning::Pruned);
        assert_eq!(rs.root_modules().len(), 2);
        assert!(rs.direct().contains("registry.example/math"));
        assert!(!rs.direct().contains("registry.example/log"));
    }
}
