//! Requirement graphs, package loading, and build-list selection.
//!
//! This crate owns the three coupled pieces of dependency resolution:
//!
//! - the **requirement graph**: an immutable snapshot of root requirements
//!   under a pruning policy, with a memoized module graph and a
//!   deterministic minimal-version build list;
//! - the **package loader**: a concurrent, iterative fixed-point walk that
//!   discovers imports from the root patterns, resolves each package to an
//!   owning module version, and grows the root set until the graph is
//!   stable;
//! - the **disqualification tracker**: a single-threaded propagation
//!   structure that reports which module versions cannot have their
//!   requirements honored under pruned or unpruned evaluation, without
//!   re-walking the whole graph.

pub mod dq;
pub mod error;
pub mod list;
pub mod loader;
pub mod queue;
pub mod reduce;
pub mod requirements;
pub mod scan;
pub mod source;

// Re-exports for convenience.
pub use dq::{DqContext, DqState, DqTracker};
pub use error::ResolveError;
pub use list::{Pattern, PackageDescriptor};
pub use loader::{Loader, LoaderOptions, Resolution};
pub use queue::WorkQueue;
pub use reduce::{find_conflicts, Conflict};
pub use requirements::{MainModule, MainModules, ModuleGraph, Pruning, Requirements};
pub use scan::{ImportScanner, ScannedImports, SourceScanner};
pub use source::{CacheStore, ModuleSource, PackageStore, RegistrySource};
