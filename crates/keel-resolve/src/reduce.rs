//! Requirement-set reduction: conflict discovery via the tracker.
//!
//! Runs in the sequential phase between loader passes. It walks the
//! extended root set once, records every requirement edge with the tracker,
//! and converts manifest failures into disqualifications; the tracker's
//! propagation then answers, without re-walking the graph, which roots
//! cannot have their requirements honored and why.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::{lang, ManifestFile, PackageVersion};

use crate::dq::{context_of, DqContext, DqState, DqTracker};
use crate::error::{ResolveError, Result};
use crate::requirements::{Pruning, Requirements};
use crate::source::ModuleSource;

/// A root whose requirements cannot be honored, with the chain leading to
/// the underlying cause.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The disqualification chain, from the conflicted root down to the
    /// version that introduced the problem.
    pub path: Vec<PackageVersion>,
    /// The error at the end of the chain, when the final version's
    /// requirements could not be read.
    pub cause: Option<Arc<ResolveError>>,
}

type ManifestMap = HashMap<PackageVersion, std::result::Result<ManifestFile, Arc<ResolveError>>>;

/// Find the roots of `rs` that are disqualified in the context their own
/// manifests are evaluated under.
///
/// The tracker is driven single-threaded here; only the manifest prefetch
/// is concurrent.
pub async fn find_conflicts(
    cancel: &CancellationToken,
    rs: &Requirements,
    source: &dyn ModuleSource,
) -> Result<Vec<Conflict>> {
    let manifests = prefetch_manifests(cancel, rs, source).await?;

    // A root's own requirements are evaluated pruned exactly when the whole
    // snapshot is pruned and the root's manifest opts in.
    let mut root_pruning: HashMap<PackageVersion, Pruning> = HashMap::new();
    for root in rs.root_modules() {
        let pruning = if rs.pruning() == Pruning::Unpruned {
            Pruning::Unpruned
        } else {
            match manifests.get(root) {
                Some(Ok(manifest)) if lang::supports_pruned_graph(manifest.language.as_deref()) => {
                    Pruning::Pruned
                }
                _ => Pruning::Unpruned,
            }
        };
        root_pruning.insert(root.clone(), pruning);
    }

    let mut tracker = DqTracker::new(root_pruning.clone());
    let mut visited: HashSet<(PackageVersion, DqContext)> = HashSet::new();
    for root in rs.root_modules() {
        let ctx = context_of(root_pruning[root]);
        visit(root, ctx, &manifests, &mut tracker, &mut visited);
    }

    let mut conflicts = Vec::new();
    for root in rs.root_modules() {
        let ctx = context_of(root_pruning[root]);
        if tracker.check(root, ctx).is_disqualified() {
            let (path, cause) = tracker.path(root, ctx);
            conflicts.push(Conflict { path, cause });
        }
    }
    debug!(roots = rs.root_modules().len(), conflicts = conflicts.len(), "requirement reduction complete");
    Ok(conflicts)
}

/// Record the requirement edges of `m` with the tracker, disqualifying it
/// if its manifest cannot be read. Requirements of dependencies are only
/// ever evaluated in the unpruned context; a pruned root's own problems are
/// confined to the edges recorded here.
fn visit(
    m: &PackageVersion,
    ctx: DqContext,
    manifests: &ManifestMap,
    tracker: &mut DqTracker,
    visited: &mut HashSet<(PackageVersion, DqContext)>,
) {
    if !visited.insert((m.clone(), ctx)) {
        return;
    }
    if tracker.check(m, ctx).is_disqualified() {
        return;
    }
    tracker.mark_computing(m, ctx);

    match manifests.get(m) {
        None => {}
        Some(Err(err)) => {
            tracker.disqualify(m.clone(), ctx, DqState::Failed(Arc::clone(err)));
        }
        Some(Ok(manifest)) => {
            for req in &manifest.require {
                let r = req.package_version();
                if !tracker.require(m, &r) {
                    // m is now fully disqualified; its remaining
                    // requirements no longer matter.
                    return;
                }
                visit(&r, DqContext::Unpruned, manifests, tracker, visited);
            }
        }
    }
}

/// Fetch the manifest of every module reachable through requirement edges
/// from the roots, converting failures (including too-new declarations)
/// into per-module errors.
async fn prefetch_manifests(
    cancel: &CancellationToken,
    rs: &Requirements,
    source: &dyn ModuleSource,
) -> Result<ManifestMap> {
    let mut manifests: ManifestMap = HashMap::new();
    let mut frontier: Vec<PackageVersion> = rs
        .root_modules()
        .iter()
        .filter(|m| !m.revision.is_none())
        .cloned()
        .collect();

    while !frontier.is_empty() {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        frontier.sort();
        frontier.dedup();
        frontier.retain(|m| !manifests.contains_key(m));
        if frontier.is_empty() {
            break;
        }

        let fetched = futures::future::join_all(frontier.iter().map(|m| async {
            (m.clone(), source.manifest(cancel, m).await)
        }))
        .await;

        let mut next = Vec::new();
        for (module, result) in fetched {
            let entry = match result {
                Ok(manifest) => match manifest.language.as_deref() {
                    Some(declared) if !lang::is_supported(declared) => {
                        Err(Arc::new(ResolveError::TooNew {
                            module: module.clone(),
                            required: declared.to_string(),
                            supported: lang::SUPPORTED.to_string(),
                        }))
                    }
                    _ => {
                        next.extend(manifest.require.iter().map(|r| r.package_version()));
                        Ok(manifest)
                    }
                },
                Err(ResolveError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(err) => Err(Arc::new(err)),
            };
            manifests.insert(module, entry);
        }
        frontier = next;
    }

    Ok(manifests)
}
