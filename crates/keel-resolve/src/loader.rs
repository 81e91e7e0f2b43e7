//! The concurrent package-graph loader.
//!
//! Loading is an iterative fixed point. Each pass starts from the root
//! patterns, resolves every discovered package to an owning module version
//! against the current requirement snapshot, scans its imports, and
//! enqueues the children. After the work queue goes idle, packages whose
//! imports could not be resolved are batch-queried against the registry;
//! any modules found become new root requirements and the pass is re-run.
//! The root set only grows within one resolution, and versions per path
//! only increase, so the iteration must reach a stable fixed point. The
//! number of passes is not part of the contract, only convergence.
//!
//! Per-package state lives in an arena of nodes addressed by index, so the
//! import graph may be cyclic without reference-counting cycles. Membership
//! flags are merged with a compare-and-swap loop that returns the prior
//! value: whichever caller sets the last of a pair of interacting flags
//! observes that fact and performs the propagation, which keeps concurrent
//! sibling loads race-free without a global lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_core::{is_std_path, lang, module_prefixes, PackageVersion, Revision, MANIFEST_FILE_NAME};
use keel_registry::Origin;

use crate::error::{ResolveError, Result};
use crate::list::{PackageDescriptor, Pattern};
use crate::queue::WorkQueue;
use crate::requirements::{MainModules, ModuleGraph, Pruning, Requirements};
use crate::scan::{has_source_files, walk_packages, ImportScanner};
use crate::source::{ModuleSource, PackageStore};

/// The pseudo-import for foreign-function bindings; it never resolves to a
/// package and is elided from scans.
const NATIVE_IMPORT: &str = "native";

/// Package flag bits. Monotonically added, never cleared.
pub mod flags {
    /// The package is in the maximal dependency closure of the main
    /// modules.
    pub const IN_ALL: u8 = 1 << 0;
    /// The package matches a requested root pattern.
    pub const IS_ROOT: u8 = 1 << 1;
    /// The package is reachable from a pattern match.
    pub const FROM_ROOT: u8 = 1 << 2;
    /// The import scan for the package is complete.
    pub const IMPORTS_LOADED: u8 = 1 << 3;
}
use flags::{FROM_ROOT, IMPORTS_LOADED, IN_ALL, IS_ROOT};

fn has(bits: u8, cond: u8) -> bool {
    bits & cond == cond
}

/// A flag set merged atomically. `update` reports the prior value so the
/// caller can tell exactly which bits it newly set and propagate once.
#[derive(Debug, Default)]
pub struct AtomicFlags(AtomicU8);

impl AtomicFlags {
    /// Set `flags` in addition to any already set, returning the previous
    /// state.
    pub fn update(&self, flags: u8) -> u8 {
        loop {
            let old = self.0.load(Ordering::SeqCst);
            let new = old | flags;
            if new == old {
                return old;
            }
            if self
                .0
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return old;
            }
        }
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether all of the bits in `cond` are set.
    pub fn has(&self, cond: u8) -> bool {
        has(self.get(), cond)
    }
}

/// Index of a package node in the loader's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(usize);

const NO_PARENT: usize = usize::MAX;

/// What import resolution decided for one package.
#[derive(Debug, Clone, Default)]
pub struct ResolvedModule {
    /// The providing module version; `None` for standard-library packages.
    pub module: Option<PackageVersion>,
    /// The replacement module actually used, if the main module redirects
    /// the provider.
    pub replace: Option<PackageVersion>,
    /// Directory holding the package sources; `None` for standard-library
    /// packages.
    pub dir: Option<PathBuf>,
}

/// One memoized package node. Created once per path per resolution, updated
/// in place, and never removed until the loader instance is discarded.
pub struct LoadedPackage {
    id: PackageId,
    path: String,
    test_of: Option<PackageId>,
    flags: AtomicFlags,
    resolved: OnceLock<ResolvedModule>,
    error: Mutex<Option<Arc<ResolveError>>>,
    imports: OnceLock<Vec<PackageId>>,
    /// Test-only imports, held for the lazily created test variant.
    test_imports: OnceLock<Vec<String>>,
    test: OnceLock<PackageId>,
    /// The importing parent in the minimal import chain, set by
    /// `build_stacks`.
    parent: AtomicUsize,
}

impl LoadedPackage {
    fn new(id: PackageId, path: String, test_of: Option<PackageId>) -> Self {
        LoadedPackage {
            id,
            path,
            test_of,
            flags: AtomicFlags::default(),
            resolved: OnceLock::new(),
            error: Mutex::new(None),
            imports: OnceLock::new(),
            test_imports: OnceLock::new(),
            test: OnceLock::new(),
            parent: AtomicUsize::new(NO_PARENT),
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this node is the test variant of another package.
    pub fn is_test(&self) -> bool {
        self.test_of.is_some()
    }

    pub fn flag_bits(&self) -> u8 {
        self.flags.get()
    }

    pub fn has_flags(&self, cond: u8) -> bool {
        self.flags.has(cond)
    }

    pub fn resolved(&self) -> Option<&ResolvedModule> {
        self.resolved.get()
    }

    /// The providing module, once resolution has run.
    pub fn module(&self) -> Option<&PackageVersion> {
        self.resolved.get()?.module.as_ref()
    }

    pub fn error(&self) -> Option<Arc<ResolveError>> {
        self.error.lock().expect("package error lock poisoned").clone()
    }

    pub fn import_ids(&self) -> &[PackageId] {
        self.imports.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Options controlling one loader instance.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Query the registry for modules providing unresolved imports and add
    /// them as new root requirements.
    pub resolve_missing_imports: bool,
    /// Load the test dependencies of packages matching root patterns.
    pub load_tests: bool,
    /// Record package errors in the result instead of failing the
    /// resolution on the first one.
    pub allow_errors: bool,
    /// Bound on concurrently running load tasks.
    pub max_active: usize,
    /// Override the pruning policy implied by the main modules.
    pub pruning: Option<Pruning>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            resolve_missing_imports: true,
            load_tests: false,
            allow_errors: false,
            max_active: 16,
            pruning: None,
        }
    }
}

/// The package-graph loader. Construct one per resolution request; there is
/// no shared global state between loaders.
pub struct Loader {
    main: MainModules,
    source: Arc<dyn ModuleSource>,
    store: Arc<dyn PackageStore>,
    scanner: Arc<dyn ImportScanner>,
    opts: LoaderOptions,
}

impl Loader {
    pub fn new(
        main: MainModules,
        source: Arc<dyn ModuleSource>,
        store: Arc<dyn PackageStore>,
        scanner: Arc<dyn ImportScanner>,
        opts: LoaderOptions,
    ) -> Self {
        Loader {
            main,
            source,
            store,
            scanner,
            opts,
        }
    }

    /// Load the packages matching `patterns` and their transitive imports,
    /// growing the requirement set as needed until the graph is stable.
    ///
    /// A cancelled resolution returns the partial result loaded so far,
    /// marked as cancelled, rather than corrupting shared state.
    pub async fn load_packages(
        &self,
        cancel: &CancellationToken,
        patterns: &[Pattern],
    ) -> Result<Resolution> {
        self.main.check_supported()?;
        let pruning = self.opts.pruning.unwrap_or_else(|| self.main.default_pruning());
        let state = Arc::new_cyclic(|me| LoaderState {
            me: me.clone(),
            opts: self.opts.clone(),
            all_pattern_is_root: patterns.iter().any(|p| matches!(p, Pattern::All)),
            all_closes_over_tests: !lang::supports_pruned_graph(self.main.language()),
            main: self.main.clone(),
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            scanner: Arc::clone(&self.scanner),
            cancel: cancel.clone(),
            queue: WorkQueue::new(self.opts.max_active),
            requirements: RwLock::new(Arc::new(self.main.requirements(pruning))),
            index: Mutex::new(PkgIndex::default()),
            roots: Mutex::new(Vec::new()),
            ordered: Mutex::new(Vec::new()),
            origins: Mutex::new(HashMap::new()),
        });
        state.run(patterns).await
    }

    /// Load and report flat descriptors for the requested patterns.
    pub async fn list_packages(
        &self,
        cancel: &CancellationToken,
        patterns: &[Pattern],
    ) -> Result<Vec<PackageDescriptor>> {
        Ok(self.load_packages(cancel, patterns).await?.descriptors)
    }
}

#[derive(Default)]
struct PkgIndex {
    by_path: HashMap<String, PackageId>,
    arena: Vec<Arc<LoadedPackage>>,
}

struct LoaderState {
    /// Self-reference handed to spawned tasks.
    me: Weak<LoaderState>,
    opts: LoaderOptions,
    all_pattern_is_root: bool,
    /// Whether the maximal closure includes dependencies of tests outside
    /// the main modules (legacy closure policy of pre-pruning language
    /// versions).
    all_closes_over_tests: bool,
    main: MainModules,
    source: Arc<dyn ModuleSource>,
    store: Arc<dyn PackageStore>,
    scanner: Arc<dyn ImportScanner>,
    cancel: CancellationToken,
    queue: WorkQueue,
    /// The current requirement snapshot. Swapped between passes, never
    /// mutated in place; readers holding an old snapshot see a consistent
    /// view.
    requirements: RwLock<Arc<Requirements>>,
    index: Mutex<PkgIndex>,
    roots: Mutex<Vec<PackageId>>,
    /// All loaded nodes in minimal-import-chain order; built after the
    /// final pass.
    ordered: Mutex<Vec<PackageId>>,
    origins: Mutex<HashMap<PackageVersion, Origin>>,
}

impl LoaderState {
    fn arc(&self) -> Arc<LoaderState> {
        self.me.upgrade().expect("loader state dropped while in use")
    }

    async fn run(&self, patterns: &[Pattern]) -> Result<Resolution> {
        loop {
            self.reset();
            let root_paths = self.root_paths(patterns)?;
            debug!(roots = root_paths.len(), "starting load pass");
            let root_ids: Vec<PackageId> =
                root_paths.iter().map(|path| self.pkg(path, IS_ROOT)).collect();
            *self.roots.lock().expect("roots lock poisoned") = root_ids;
            self.queue.idle().await;

            if self.cancel.is_cancelled() {
                self.build_stacks();
                return Ok(self.collect(patterns, true));
            }
            if !self.opts.resolve_missing_imports {
                break;
            }
            let added = self.resolve_missing_imports().await;
            if added.is_empty() {
                break;
            }
            let rs = self.current_requirements();
            let grown = rs.with_added_roots(added.keys().cloned());
            if grown.same_roots(&rs) {
                break;
            }
            info!(added = added.len(), "adding root requirements for missing imports");
            *self.requirements.write().expect("requirements lock poisoned") = Arc::new(grown);
        }

        self.build_stacks();
        self.update_direct();

        if !self.opts.allow_errors {
            if let Some((path, err)) = self.first_error() {
                return Err(ResolveError::Load { path, cause: err });
            }
        }
        Ok(self.collect(patterns, false))
    }

    fn reset(&self) {
        debug_assert!(self.queue.is_idle(), "loader reset while tasks are in flight");
        *self.index.lock().expect("index lock poisoned") = PkgIndex::default();
        self.roots.lock().expect("roots lock poisoned").clear();
        self.ordered.lock().expect("ordered lock poisoned").clear();
    }

    fn current_requirements(&self) -> Arc<Requirements> {
        self.requirements
            .read()
            .expect("requirements lock poisoned")
            .clone()
    }

    /// Root package paths for this pass: literal patterns directly, with
    /// wildcard and `all` patterns enumerated from the main modules'
    /// source trees.
    fn root_paths(&self, patterns: &[Pattern]) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for pattern in patterns {
            match pattern {
                Pattern::Exact(path) => paths.push(path.clone()),
                Pattern::All | Pattern::Prefix(_) => {
                    for member in self.main.members() {
                        let rels =
                            walk_packages(&member.root_dir).map_err(|e| ResolveError::Scan {
                                dir: member.root_dir.display().to_string(),
                                source: e,
                            })?;
                        for rel in rels {
                            let full = if rel.is_empty() {
                                member.module.path.clone()
                            } else {
                                format!("{}/{}", member.module.path, rel)
                            };
                            if matches!(pattern, Pattern::All) || pattern.matches(&full) {
                                paths.push(full);
                            }
                        }
                    }
                }
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn node(&self, id: PackageId) -> Arc<LoadedPackage> {
        Arc::clone(&self.index.lock().expect("index lock poisoned").arena[id.0])
    }

    /// Locate the node for `path`, creating and enqueueing a load task on
    /// first reference, and apply `flags` either way.
    fn pkg(&self, path: &str, flags: u8) -> PackageId {
        if has(flags, IMPORTS_LOADED) {
            panic!("internal error: pkg called with the imports-loaded flag set");
        }
        let (id, created) = {
            let mut index = self.index.lock().expect("index lock poisoned");
            match index.by_path.get(path) {
                Some(&id) => (id, false),
                None => {
                    let id = PackageId(index.arena.len());
                    index
                        .arena
                        .push(Arc::new(LoadedPackage::new(id, path.to_string(), None)));
                    index.by_path.insert(path.to_string(), id);
                    (id, true)
                }
            }
        };
        self.apply_flags(id, flags);
        if created {
            let state = self.arc();
            self.queue.add(async move { state.load(id).await });
        }
        id
    }

    fn in_main_module(&self, pkg: &LoadedPackage) -> bool {
        pkg.module()
            .map(|m| self.main.contains(&m.path))
            .unwrap_or(false)
    }

    /// The propagation engine: set `new_flags` on the package and carry the
    /// transitive effects, possibly enqueueing further packages.
    fn apply_flags(&self, id: PackageId, mut new_flags: u8) {
        if new_flags == 0 {
            return;
        }
        let pkg = self.node(id);
        if has(new_flags, IN_ALL) && self.all_pattern_is_root && !pkg.is_test() {
            // Being in the maximal closure while that closure is a
            // requested root makes the package a root too.
            new_flags |= IS_ROOT;
        }
        if has(new_flags, IS_ROOT) {
            new_flags |= FROM_ROOT;
        }

        let old = pkg.flags.update(new_flags);
        let new = old | new_flags;
        if new == old || !has(new, IMPORTS_LOADED) {
            // Either nothing changed, or the import set is not known yet;
            // in both cases there is nothing to propagate.
            return;
        }

        if !pkg.is_test() {
            let in_main = self.in_main_module(&pkg);
            let want_test = (self.all_pattern_is_root && in_main)
                || (self.all_pattern_is_root
                    && self.all_closes_over_tests
                    && has(new, IN_ALL))
                || (self.opts.load_tests && has(new, IS_ROOT));
            if want_test {
                let mut test_flags = 0;
                if in_main || (self.all_closes_over_tests && has(new, IN_ALL)) {
                    // Tests of these packages promote their imports into
                    // the maximal closure.
                    test_flags |= IN_ALL;
                }
                self.pkg_test(id, test_flags);
            }
        }

        if has(new, IN_ALL) && !has(old, IN_ALL | IMPORTS_LOADED) {
            // Whichever caller set the last of the pair propagates.
            for &dep in pkg.import_ids() {
                self.apply_flags(dep, IN_ALL);
            }
        }
        if has(new, FROM_ROOT) && !has(old, FROM_ROOT | IMPORTS_LOADED) {
            for &dep in pkg.import_ids() {
                self.apply_flags(dep, FROM_ROOT);
            }
        }
    }

    /// Load one package: resolve its owning module, scan its imports, and
    /// enqueue the children. Resolution failures are recorded on the node
    /// and never abort sibling loads.
    async fn load(&self, id: PackageId) {
        let pkg = self.node(id);
        let rs = self.current_requirements();
        let mg = if rs.pruning() == Pruning::Unpruned {
            // An expansion failure may leave the graph selecting inaccurate
            // versions, so fall back to root-only resolution and keep
            // pushing past it; the error resurfaces through the packages it
            // actually breaks.
            rs.graph(&self.cancel, &*self.source).await.ok()
        } else {
            None
        };

        let resolved = match self.resolve_import(&pkg.path, &rs, mg.as_deref()) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.set_error(&pkg, err);
                return;
            }
        };

        let dir = resolved.dir.clone();
        let in_main = resolved
            .module
            .as_ref()
            .map(|m| self.main.contains(&m.path))
            .unwrap_or(false);
        let _ = pkg.resolved.set(resolved);
        if in_main {
            // Mark main-module packages before their imports load, so a
            // package only imported from inside the closure is flagged
            // before propagation reaches it.
            self.apply_flags(id, IN_ALL);
        }
        let Some(dir) = dir else {
            // Standard-library packages have no sources here to scan.
            return;
        };

        let scanned = match self.scanner.scan_dir(&dir) {
            Ok(scanned) => scanned,
            Err(e) => {
                self.set_error(
                    &pkg,
                    ResolveError::Scan {
                        dir: dir.display().to_string(),
                        source: e,
                    },
                );
                return;
            }
        };

        let import_flags = if pkg.flags.has(IN_ALL) { IN_ALL } else { 0 };
        let mut import_ids = Vec::with_capacity(scanned.imports.len());
        for path in &scanned.imports {
            if path == NATIVE_IMPORT {
                continue;
            }
            import_ids.push(self.pkg(path, import_flags));
        }
        let _ = pkg.imports.set(import_ids);
        let _ = pkg.test_imports.set(
            scanned
                .test_imports
                .into_iter()
                .filter(|p| p != NATIVE_IMPORT)
                .collect(),
        );
        self.apply_flags(id, IMPORTS_LOADED);
    }

    /// Resolve the owning module of a package path against the current
    /// requirement snapshot (or the full module graph when available).
    fn resolve_import(
        &self,
        path: &str,
        rs: &Requirements,
        mg: Option<&ModuleGraph>,
    ) -> Result<ResolvedModule> {
        if let Some((module, dir)) = self.main.package_dir(path) {
            if has_source_files(&dir) {
                return Ok(ResolvedModule {
                    module: Some(module),
                    replace: None,
                    dir: Some(dir),
                });
            }
        }
        if is_std_path(path) {
            return Ok(ResolvedModule::default());
        }

        let replacements = self.main.replacements();
        let mut candidates = Vec::new();
        for prefix in module_prefixes(path) {
            let selected = match mg {
                Some(g) => g.selected(prefix),
                None => rs.root_selected(prefix).unwrap_or(Revision::None),
            };
            if selected.is_none() {
                continue;
            }
            let module = PackageVersion::new(prefix, selected);
            let (actual, replace) = match replacements.get(prefix) {
                Some(rep) => (rep.clone(), Some(rep.clone())),
                None => (module.clone(), None),
            };
            let rel = path[prefix.len()..].trim_start_matches('/');
            if let Some(dir) = self.store.package_dir(&actual, rel) {
                candidates.push((module, replace, dir));
            }
        }

        match candidates.len() {
            0 => Err(ResolveError::MissingImport {
                path: path.to_string(),
            }),
            1 => {
                let (module, replace, dir) = candidates.remove(0);
                Ok(ResolvedModule {
                    module: Some(module),
                    replace,
                    dir: Some(dir),
                })
            }
            _ => Err(ResolveError::AmbiguousImport {
                path: path.to_string(),
                candidates: candidates.into_iter().map(|(m, _, _)| m).collect(),
            }),
        }
    }

    /// Locate the test variant of a package, creating it exactly once, and
    /// apply `test_flags`. The test inherits the parent's module, directory
    /// and error, but owns the parent's test-only import list.
    fn pkg_test(&self, id: PackageId, test_flags: u8) -> PackageId {
        let pkg = self.node(id);
        if pkg.is_test() {
            panic!("internal error: pkg_test called on a test package");
        }

        let mut created = false;
        let test_id = *pkg.test.get_or_init(|| {
            created = true;
            let test_id = {
                let mut index = self.index.lock().expect("index lock poisoned");
                let test_id = PackageId(index.arena.len());
                let node = LoadedPackage::new(test_id, pkg.path.clone(), Some(id));
                if let Some(resolved) = pkg.resolved.get() {
                    let _ = node.resolved.set(resolved.clone());
                }
                *node.error.lock().expect("package error lock poisoned") = pkg.error();
                index.arena.push(Arc::new(node));
                test_id
            };
            self.apply_flags(test_id, test_flags);
            test_id
        });

        if created {
            let test = self.node(test_id);
            let import_flags = if test.flags.has(IN_ALL) { IN_ALL } else { 0 };
            let paths = pkg.test_imports.get().cloned().unwrap_or_default();
            let import_ids: Vec<PackageId> =
                paths.iter().map(|p| self.pkg(p, import_flags)).collect();
            let _ = test.imports.set(import_ids);
            let _ = test.test_imports.set(Vec::new());
            self.apply_flags(test_id, IMPORTS_LOADED);
        } else {
            self.apply_flags(test_id, test_flags);
        }
        test_id
    }

    fn set_error(&self, pkg: &LoadedPackage, err: ResolveError) {
        *pkg.error.lock().expect("package error lock poisoned") = Some(Arc::new(err));
    }

    /// Query the registry for modules that could provide the still-missing
    /// imports, one batched task per package. Returns each discovered
    /// module version mapped to the first package that needed it.
    async fn resolve_missing_imports(&self) -> HashMap<PackageVersion, String> {
        let nodes: Vec<Arc<LoadedPackage>> = {
            self.index
                .lock()
                .expect("index lock poisoned")
                .arena
                .clone()
        };
        let found: Arc<Mutex<Vec<(PackageVersion, String, Option<Origin>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        for pkg in nodes {
            if pkg.is_test() {
                // A missing test import is also missing for its non-test
                // node; query it once.
                continue;
            }
            let Some(err) = pkg.error() else { continue };
            if !err.is_missing_import() {
                continue;
            }
            let state = self.arc();
            let found = Arc::clone(&found);
            self.queue.add(async move {
                match state.query_import(&pkg.path).await {
                    Ok((module, origin)) => {
                        found
                            .lock()
                            .expect("missing-import lock poisoned")
                            .push((module, pkg.path.clone(), origin));
                    }
                    Err(query_err) => {
                        // The query error explains why the problem was not
                        // fixed, which is more useful than the bare
                        // missing-import error.
                        if !query_err.is_missing_import() {
                            state.set_error(&pkg, query_err);
                        }
                    }
                }
            });
        }
        self.queue.idle().await;

        let mut found = std::mem::take(
            &mut *found.lock().expect("missing-import lock poisoned"),
        );
        found.sort_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)));

        let mut added: HashMap<PackageVersion, String> = HashMap::new();
        for (module, pkg_path, origin) in found {
            if let Some(origin) = origin {
                self.origins
                    .lock()
                    .expect("origins lock poisoned")
                    .insert(module.clone(), origin);
            }
            info!(module = %module, package = %pkg_path, "found module for missing package");
            added.entry(module).or_insert(pkg_path);
        }
        added
    }

    /// Find the module providing an unresolved import: try each candidate
    /// module path, longest first, against the registry's latest-version
    /// answer, skipping versions the main modules exclude.
    async fn query_import(&self, path: &str) -> Result<(PackageVersion, Option<Origin>)> {
        for prefix in module_prefixes(path) {
            match self.source.latest(&self.cancel, prefix).await {
                Ok(info) => {
                    let module =
                        PackageVersion::new(prefix, Revision::version(info.version.clone()));
                    if self.main.excludes(&module) {
                        continue;
                    }
                    return Ok((module, info.origin));
                }
                Err(ResolveError::MissingImport { .. }) => continue,
                Err(ResolveError::Registry(e)) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ResolveError::MissingImport {
            path: path.to_string(),
        })
    }

    /// Compute minimal import chains: each node's parent pointer is set to
    /// the package that first reaches it in a breadth-first walk from the
    /// roots, giving the shortest "why is this here" chain. As a side
    /// effect, records every reachable node in chain order.
    fn build_stacks(&self) {
        let (roots, arena) = {
            let index = self.index.lock().expect("index lock poisoned");
            (
                self.roots.lock().expect("roots lock poisoned").clone(),
                index.arena.clone(),
            )
        };

        // Roots point at themselves while walking so the scan skips them.
        for id in &roots {
            arena[id.0].parent.store(id.0, Ordering::SeqCst);
        }
        let mut ordered: Vec<PackageId> = roots.clone();
        let mut i = 0;
        while i < ordered.len() {
            let current = ordered[i];
            let pkg = Arc::clone(&arena[current.0]);
            for &next in pkg.import_ids() {
                let node = &arena[next.0];
                if node.parent.load(Ordering::SeqCst) == NO_PARENT {
                    node.parent.store(current.0, Ordering::SeqCst);
                    ordered.push(next);
                }
            }
            if let Some(&test) = pkg.test.get() {
                let node = &arena[test.0];
                if node.parent.load(Ordering::SeqCst) == NO_PARENT {
                    node.parent.store(current.0, Ordering::SeqCst);
                    ordered.push(test);
                }
            }
            i += 1;
        }
        for id in &roots {
            arena[id.0].parent.store(NO_PARENT, Ordering::SeqCst);
        }
        *self.ordered.lock().expect("ordered lock poisoned") = ordered;
    }

    /// Mark the modules providing packages directly imported from the main
    /// modules as direct requirements.
    fn update_direct(&self) {
        let arena: Vec<Arc<LoadedPackage>> = {
            self.index
                .lock()
                .expect("index lock poisoned")
                .arena
                .clone()
        };
        let rs = self.current_requirements();
        let mut direct: HashSet<String> = rs.direct().clone();
        for pkg in &arena {
            if !self.in_main_module(pkg) {
                continue;
            }
            for &dep in pkg.import_ids() {
                let dep_pkg = &arena[dep.0];
                if let Some(module) = dep_pkg.module() {
                    if !self.main.contains(&module.path) {
                        direct.insert(module.path.clone());
                    }
                }
            }
        }
        if direct != *rs.direct() {
            *self.requirements.write().expect("requirements lock poisoned") =
                Arc::new(rs.with_direct(direct));
        }
    }

    /// The first recorded package error in chain order, for the
    /// error-intolerant mode.
    fn first_error(&self) -> Option<(String, Arc<ResolveError>)> {
        let arena: Vec<Arc<LoadedPackage>> = {
            self.index
                .lock()
                .expect("index lock poisoned")
                .arena
                .clone()
        };
        let ordered = self.ordered.lock().expect("ordered lock poisoned").clone();
        for id in ordered {
            let pkg = &arena[id.0];
            if let Some(err) = pkg.error() {
                return Some((pkg.path.clone(), err));
            }
        }
        None
    }

    fn collect(&self, patterns: &[Pattern], cancelled: bool) -> Resolution {
        let (arena, by_path) = {
            let index = self.index.lock().expect("index lock poisoned");
            (index.arena.clone(), index.by_path.clone())
        };
        let ordered = self.ordered.lock().expect("ordered lock poisoned").clone();
        let origins = self.origins.lock().expect("origins lock poisoned").clone();
        let requirements = self.current_requirements();

        let mut descriptors = Vec::new();
        for &id in &ordered {
            let pkg = &arena[id.0];
            if pkg.is_test() {
                continue;
            }
            let query = patterns
                .iter()
                .find(|p| match p {
                    Pattern::All => pkg.flags.has(IN_ALL),
                    other => other.matches(&pkg.path),
                })
                .map(|p| p.to_string());
            let resolved = pkg.resolved.get();
            let module = resolved.and_then(|r| r.module.clone());
            let replace = resolved.and_then(|r| r.replace.clone());
            let manifest_path = module.as_ref().and_then(|m| {
                if self.main.contains(&m.path) {
                    self.main
                        .members()
                        .iter()
                        .find(|member| member.module.path == m.path)
                        .map(|member| member.root_dir.join(MANIFEST_FILE_NAME))
                } else {
                    self.store
                        .manifest_path(replace.as_ref().unwrap_or(m))
                }
            });
            descriptors.push(PackageDescriptor {
                path: pkg.path.clone(),
                origin: module.as_ref().and_then(|m| origins.get(m).cloned()),
                module,
                query,
                replace,
                dir: resolved.and_then(|r| r.dir.clone()),
                manifest_path,
                error: pkg.error().map(|e| e.to_string()),
            });
        }

        Resolution {
            descriptors,
            requirements,
            cancelled,
            arena,
            by_path,
            ordered,
        }
    }
}

/// The outcome of one resolution: flat descriptors, the final requirement
/// snapshot, and the loaded nodes for follow-up queries.
pub struct Resolution {
    /// One record per loaded non-test package, in minimal-import-chain
    /// order (roots first).
    pub descriptors: Vec<PackageDescriptor>,
    /// The final requirement snapshot, including direct markings and any
    /// roots added for missing imports.
    pub requirements: Arc<Requirements>,
    /// Whether the resolution was cancelled; descriptors then hold the
    /// partial result.
    pub cancelled: bool,
    arena: Vec<Arc<LoadedPackage>>,
    by_path: HashMap<String, PackageId>,
    ordered: Vec<PackageId>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("descriptors", &self.descriptors)
            .field("cancelled", &self.cancelled)
            .field("ordered", &self.ordered)
            .finish_non_exhaustive()
    }
}

impl Resolution {
    /// All loaded nodes (including test variants) in chain order.
    pub fn packages(&self) -> impl Iterator<Item = &Arc<LoadedPackage>> {
        self.ordered.iter().map(|id| &self.arena[id.0])
    }

    /// Look up a loaded package by import path.
    pub fn lookup(&self, path: &str) -> Option<&Arc<LoadedPackage>> {
        self.by_path.get(path).map(|id| &self.arena[id.0])
    }

    /// Paths and messages of every package error, in chain order.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.packages()
            .filter_map(|pkg| pkg.error().map(|e| (pkg.path().to_string(), e.to_string())))
            .collect()
    }

    /// The highest language version demanded by any too-new package error,
    /// for suggesting a single resolver upgrade.
    pub fn max_language_requirement(&self) -> Option<String> {
        self.packages()
            .filter_map(|pkg| pkg.error())
            .filter_map(|e| e.too_new_requirement().map(str::to_string))
            .max_by(|a, b| lang::compare(a, b))
    }

    /// The minimal import chain explaining why `path` was loaded, one
    /// package per line from a root down to `path`. Test variants render
    /// with a `.test` suffix.
    pub fn why(&self, path: &str) -> Option<String> {
        let id = *self.by_path.get(path)?;
        let mut chain = Vec::new();
        let mut cur = id;
        loop {
            let pkg = &self.arena[cur.0];
            let rendered = if pkg.is_test() {
                format!("{}.test", pkg.path)
            } else {
                pkg.path.clone()
            };
            chain.push(rendered);
            let parent = pkg.parent.load(Ordering::SeqCst);
            if parent == NO_PARENT || parent == cur.0 {
                break;
            }
            cur = PackageId(parent);
        }
        chain.reverse();
        Some(chain.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SourceScanner;
    use async_trait::async_trait;
    use keel_core::ManifestFile;
    use keel_registry::RevisionInfo;

    fn pv(path: &str, version: &str) -> PackageVersion {
        PackageVersion::new(
            path,
            Revision::version(semver::Version::parse(version).unwrap()),
        )
    }

    #[derive(Default)]
    struct FakeSource {
        manifests: Mutex<HashMap<PackageVersion, String>>,
        latest: Mutex<HashMap<String, semver::Version>>,
    }

    #[async_trait]
    impl ModuleSource for FakeSource {
        async fn manifest(
            &self,
            _cancel: &CancellationToken,
            module: &PackageVersion,
        ) -> Result<ManifestFile> {
            let text = self
                .manifests
                .lock()
                .unwrap()
                .get(module)
                .cloned()
                .ok_or_else(|| ResolveError::MissingImport {
                    path: module.path.clone(),
                })?;
            Ok(ManifestFile::parse(&text)?)
        }

        async fn latest(
            &self,
            _cancel: &CancellationToken,
            path: &str,
        ) -> Result<RevisionInfo> {
            match self.latest.lock().unwrap().get(path) {
                Some(version) => Ok(RevisionInfo {
                    version: version.clone(),
                    time: None,
                    short: None,
                    name: None,
                    origin: None,
                }),
                None => Err(ResolveError::MissingImport {
                    path: path.to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct DirStore {
        dirs: Mutex<HashMap<PackageVersion, PathBuf>>,
    }

    impl PackageStore for DirStore {
        fn package_dir(&self, module: &PackageVersion, rel: &str) -> Option<PathBuf> {
            let root = self.dirs.lock().unwrap().get(module)?.clone();
            let dir = if rel.is_empty() { root } else { root.join(rel) };
            (dir.is_dir() && has_source_files(&dir)).then_some(dir)
        }
    }

    /// A main module plus fake registry contents on a temp filesystem.
    struct World {
        tmp: tempfile::TempDir,
        main_dir: PathBuf,
        source: Arc<FakeSource>,
        store: Arc<DirStore>,
    }

    impl World {
        fn new(main_manifest: &str) -> World {
            let tmp = tempfile::tempdir().unwrap();
            let main_dir = tmp.path().join("main");
            std::fs::create_dir_all(&main_dir).unwrap();
            std::fs::write(main_dir.join(MANIFEST_FILE_NAME), main_manifest).unwrap();
            World {
                tmp,
                main_dir,
                source: Arc::new(FakeSource::default()),
                store: Arc::new(DirStore::default()),
            }
        }

        fn write_main(&self, rel: &str, files: &[(&str, &str)]) {
            let dir = if rel.is_empty() {
                self.main_dir.clone()
            } else {
                self.main_dir.join(rel)
            };
            std::fs::create_dir_all(&dir).unwrap();
            for (name, content) in files {
                std::fs::write(dir.join(name), content).unwrap();
            }
        }

        fn add_module(
            &self,
            path: &str,
            version: &str,
            manifest: &str,
            packages: &[(&str, &[(&str, &str)])],
        ) {
            let module = pv(path, version);
            let root = self
                .tmp
                .path()
                .join(format!("{}@{version}", path.replace('/', "_")));
            for (rel, files) in packages {
                let dir = if rel.is_empty() {
                    root.clone()
                } else {
                    root.join(rel)
                };
                std::fs::create_dir_all(&dir).unwrap();
                for (name, content) in *files {
                    std::fs::write(dir.join(name), content).unwrap();
                }
            }
            self.source
                .manifests
                .lock()
                .unwrap()
                .insert(module.clone(), manifest.to_string());
            self.store.dirs.lock().unwrap().insert(module, root);
        }

        fn set_latest(&self, path: &str, version: &str) {
            self.source
                .latest
                .lock()
                .unwrap()
                .insert(path.to_string(), semver::Version::parse(version).unwrap());
        }

        fn loader(&self, opts: LoaderOptions) -> Loader {
            let main = MainModules::single(self.main_dir.clone()).unwrap();
            Loader::new(
                main,
                Arc::clone(&self.source) as Arc<dyn ModuleSource>,
                Arc::clone(&self.store) as Arc<dyn PackageStore>,
                Arc::new(SourceScanner),
                opts,
            )
        }
    }

    fn tolerant() -> LoaderOptions {
        LoaderOptions {
            allow_errors: true,
            ..LoaderOptions::default()
        }
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    const MAIN_MANIFEST: &str = r#"
module = "registry.example/app"
language = "1.1"

[[require]]
module = "registry.example/math"
version = "1.0.0"
"#;

    const MATH_MANIFEST: &str =
        "module = \"registry.example/math\"\nlanguage = \"1.1\"\n";

    #[test]
    fn flag_merge_reports_prior_value() {
        let flags = AtomicFlags::default();
        assert_eq!(flags.update(IN_ALL), 0);
        // Applying the same set again is a no-op and reports it as such.
        assert_eq!(flags.update(IN_ALL), IN_ALL);
        let old = flags.update(IS_ROOT | IN_ALL);
        assert!(!has(old, IS_ROOT));
        assert_eq!(flags.get(), IN_ALL | IS_ROOT);
        assert!(flags.has(IN_ALL | IS_ROOT));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn loads_transitive_imports() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main("", &[("app.kl", "import \"registry.example/math\"\nfn main() {}\n")]);
        world.add_module(
            "registry.example/math",
            "1.0.0",
            MATH_MANIFEST,
            &[
                ("", &[("math.kl", "import \"registry.example/math/vector\"\nfn abs() {}\n")]),
                ("vector", &[("vec.kl", "fn dot() {}\n")]),
            ],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::parse("registry.example/app")])
            .await
            .unwrap();

        assert!(!resolution.cancelled);
        assert!(resolution.errors().is_empty());

        let math = resolution.lookup("registry.example/math").unwrap();
        assert_eq!(math.module(), Some(&pv("registry.example/math", "1.0.0")));
        assert!(math.has_flags(flags::FROM_ROOT | flags::IMPORTS_LOADED));

        let vector = resolution.lookup("registry.example/math/vector").unwrap();
        assert!(vector.has_flags(flags::FROM_ROOT));
        assert_eq!(
            resolution.why("registry.example/math/vector").unwrap(),
            "registry.example/app\nregistry.example/math\nregistry.example/math/vector"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_pattern_marks_the_maximal_closure() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main("", &[("app.kl", "import \"registry.example/math\"\nfn main() {}\n")]);
        world.add_module(
            "registry.example/math",
            "1.0.0",
            MATH_MANIFEST,
            &[("", &[("math.kl", "fn abs() {}\n")])],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();

        let app = resolution.lookup("registry.example/app").unwrap();
        assert!(app.has_flags(flags::IN_ALL | flags::IS_ROOT));
        let math = resolution.lookup("registry.example/math").unwrap();
        assert!(math.has_flags(flags::IN_ALL | flags::FROM_ROOT));
        let descriptor = resolution
            .descriptors
            .iter()
            .find(|d| d.path == "registry.example/math")
            .unwrap();
        assert_eq!(descriptor.query.as_deref(), Some("all"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_import_becomes_a_new_root() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main(
            "",
            &[("app.kl", "import \"registry.example/extra\"\nfn main() {}\n")],
        );
        world.add_module(
            "registry.example/extra",
            "2.0.0",
            "module = \"registry.example/extra\"\nlanguage = \"1.1\"\n",
            &[("", &[("extra.kl", "fn spare() {}\n")])],
        );
        world.set_latest("registry.example/extra", "2.0.0");

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();

        assert!(resolution.errors().is_empty());
        let extra = resolution.lookup("registry.example/extra").unwrap();
        assert_eq!(extra.module(), Some(&pv("registry.example/extra", "2.0.0")));
        assert_eq!(
            resolution
                .requirements
                .root_selected("registry.example/extra"),
            Some(Revision::version(semver::Version::new(2, 0, 0)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unresolved_import_does_not_block_siblings() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main(
            "",
            &[(
                "app.kl",
                "import \"registry.example/gone\"\nimport \"registry.example/math\"\nfn main() {}\n",
            )],
        );
        world.add_module(
            "registry.example/math",
            "1.0.0",
            MATH_MANIFEST,
            &[("", &[("math.kl", "fn abs() {}\n")])],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();

        let errors = resolution.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "registry.example/gone");
        assert!(errors[0].1.contains("no module provides"));

        let math = resolution.lookup("registry.example/math").unwrap();
        assert!(math.error().is_none());
        assert_eq!(math.module(), Some(&pv("registry.example/math", "1.0.0")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn intolerant_mode_promotes_the_first_package_error() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main(
            "",
            &[("app.kl", "import \"registry.example/gone\"\nfn main() {}\n")],
        );

        let loader = world.loader(LoaderOptions::default());
        let err = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Load { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ambiguous_imports_are_reported_not_resolved() {
        let manifest = r#"
module = "registry.example/app"
language = "1.1"

[[require]]
module = "registry.example/a"
version = "1.0.0"

[[require]]
module = "registry.example/a/x"
version = "1.0.0"
"#;
        let world = World::new(manifest);
        world.write_main(
            "",
            &[("app.kl", "import \"registry.example/a/x\"\nfn main() {}\n")],
        );
        world.add_module(
            "registry.example/a",
            "1.0.0",
            "module = \"registry.example/a\"\nlanguage = \"1.1\"\n",
            &[("x", &[("x.kl", "fn from_parent() {}\n")])],
        );
        world.add_module(
            "registry.example/a/x",
            "1.0.0",
            "module = \"registry.example/a/x\"\nlanguage = \"1.1\"\n",
            &[("", &[("x.kl", "fn from_nested() {}\n")])],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();
        let x = resolution.lookup("registry.example/a/x").unwrap();
        let err = x.error().unwrap();
        assert!(matches!(&*err, ResolveError::AmbiguousImport { candidates, .. } if candidates.len() == 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_variant_loads_test_only_imports() {
        let manifest = r#"
module = "registry.example/app"
language = "1.1"

[[require]]
module = "registry.example/check"
version = "0.3.0"
"#;
        let world = World::new(manifest);
        world.write_main(
            "",
            &[
                ("app.kl", "fn main() {}\n"),
                ("app_test.kl", "import \"registry.example/check\"\nfn test_main() {}\n"),
            ],
        );
        world.add_module(
            "registry.example/check",
            "0.3.0",
            "module = \"registry.example/check\"\nlanguage = \"1.1\"\n",
            &[("", &[("check.kl", "fn expect() {}\n")])],
        );

        // The maximal closure includes imports of main-module tests.
        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();
        let check = resolution.lookup("registry.example/check").unwrap();
        assert!(check.has_flags(flags::IN_ALL));

        // A plain literal pattern without test loading skips them.
        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::parse("registry.example/app")])
            .await
            .unwrap();
        assert!(resolution.lookup("registry.example/check").is_none());

        // Requesting tests of the roots loads them again.
        let loader = world.loader(LoaderOptions {
            load_tests: true,
            ..tolerant()
        });
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::parse("registry.example/app")])
            .await
            .unwrap();
        let check = resolution.lookup("registry.example/check").unwrap();
        assert!(check.has_flags(flags::IN_ALL));
        assert!(check.error().is_none());
        let app_test = resolution
            .packages()
            .find(|p| p.is_test() && p.path() == "registry.example/app")
            .unwrap();
        assert!(app_test.has_flags(flags::IMPORTS_LOADED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn std_imports_resolve_without_a_module() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main(
            "",
            &[("app.kl", "import \"io/stream\"\nimport \"native\"\nfn main() {}\n")],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();

        let std_pkg = resolution.lookup("io/stream").unwrap();
        assert!(std_pkg.module().is_none());
        assert!(std_pkg.error().is_none());
        // The native pseudo-import is elided entirely.
        assert!(resolution.lookup("native").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn excluded_versions_never_resolve_missing_imports() {
        let manifest = r#"
module = "registry.example/app"
language = "1.1"

[[exclude]]
module = "registry.example/extra"
version = "2.0.0"
"#;
        let world = World::new(manifest);
        world.write_main(
            "",
            &[("app.kl", "import \"registry.example/extra\"\nfn main() {}\n")],
        );
        world.set_latest("registry.example/extra", "2.0.0");

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();
        let errors = resolution.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "registry.example/extra");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replacements_redirect_the_providing_module() {
        let manifest = r#"
module = "registry.example/app"
language = "1.1"

[[require]]
module = "registry.example/extra"
version = "1.0.0"

[[replace]]
module = "registry.example/extra"
with = "registry.example/extra-fork"
version = "1.1.0"
"#;
        let world = World::new(manifest);
        world.write_main(
            "",
            &[("app.kl", "import \"registry.example/extra\"\nfn main() {}\n")],
        );
        world.add_module(
            "registry.example/extra-fork",
            "1.1.0",
            "module = \"registry.example/extra-fork\"\nlanguage = \"1.1\"\n",
            &[("", &[("extra.kl", "fn forked() {}\n")])],
        );

        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&cancel(), &[Pattern::All])
            .await
            .unwrap();
        let extra = resolution.lookup("registry.example/extra").unwrap();
        assert!(extra.error().is_none());
        // Identity stays with the required module; the fork shows as the
        // replacement actually used.
        assert_eq!(extra.module(), Some(&pv("registry.example/extra", "1.0.0")));
        let descriptor = resolution
            .descriptors
            .iter()
            .find(|d| d.path == "registry.example/extra")
            .unwrap();
        assert_eq!(
            descriptor.replace,
            Some(pv("registry.example/extra-fork", "1.1.0"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_resolution_surfaces_partial_results() {
        let world = World::new(MAIN_MANIFEST);
        world.write_main("", &[("app.kl", "fn main() {}\n")]);

        let token = CancellationToken::new();
        token.cancel();
        let loader = world.loader(tolerant());
        let resolution = loader
            .load_packages(&token, &[Pattern::All])
            .await
            .unwrap();
        assert!(resolution.cancelled);
    }
}
