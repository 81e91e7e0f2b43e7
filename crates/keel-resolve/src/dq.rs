//! The disqualification tracker.
//!
//! Tracks and propagates, per module version, the reason its requirements
//! cannot be incorporated into the module graph — separately for pruned and
//! unpruned evaluation. Because the pruned graph is a subgraph of the
//! unpruned graph, disqualification in the pruned context always implies
//! disqualification in the unpruned context; the reverse does not hold.
//!
//! The tracker is deliberately not safe for concurrent mutation: it is
//! driven single-threaded from the sequential reduction phase between
//! loader passes, and its `&mut` methods enforce that at compile time.

use std::collections::HashMap;
use std::sync::Arc;

use keel_core::PackageVersion;

use crate::error::ResolveError;
use crate::requirements::Pruning;

/// The evaluation context a disqualification applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DqContext {
    Pruned,
    Unpruned,
}

/// The context in which a root's own requirements are evaluated, given the
/// pruning its manifest declares.
pub fn context_of(pruning: Pruning) -> DqContext {
    match pruning {
        Pruning::Unpruned => DqContext::Unpruned,
        Pruning::Pruned | Pruning::Workspace => DqContext::Pruned,
    }
}

/// Whether and why a module version is disqualified in one context.
///
/// `Unknown` covers both "fine" and "not yet examined"; `Computing` marks a
/// version currently being traversed, so requirement cycles short-circuit
/// instead of recursing. Once a disqualified state is set for a context it
/// is never unset within a resolution pass.
#[derive(Debug, Clone, Default)]
pub enum DqState {
    #[default]
    Unknown,
    Computing,
    /// Disqualified because the version is, or requires, this dependency.
    DisqualifiedBy(PackageVersion),
    /// Disqualified because its requirements could not be read.
    Failed(Arc<ResolveError>),
}

impl DqState {
    pub fn is_disqualified(&self) -> bool {
        matches!(self, DqState::DisqualifiedBy(_) | DqState::Failed(_))
    }

    pub fn is_computing(&self) -> bool {
        matches!(self, DqState::Computing)
    }
}

#[derive(Debug, Clone, Default)]
struct PerContext<T> {
    pruned: T,
    unpruned: T,
}

impl<T> PerContext<T> {
    fn get(&self, ctx: DqContext) -> &T {
        match ctx {
            DqContext::Pruned => &self.pruned,
            DqContext::Unpruned => &self.unpruned,
        }
    }
}

/// Tracks and propagates the reason each module version cannot be included
/// in the module graph.
pub struct DqTracker {
    /// The pruning declared by the manifest of each root in the extended
    /// module graph.
    root_pruning: HashMap<PackageVersion, Pruning>,

    /// Whether and why each encountered version is disqualified, per
    /// context.
    reason: HashMap<PackageVersion, PerContext<DqState>>,

    /// For each not-yet-disqualified version, the versions whose
    /// requirements would be pulled in alongside it. When a version becomes
    /// disqualified, the disqualification propagates to this list, after
    /// which the list is dropped.
    requiring: HashMap<PackageVersion, Vec<PackageVersion>>,
}

impl DqTracker {
    pub fn new(root_pruning: HashMap<PackageVersion, Pruning>) -> Self {
        DqTracker {
            root_pruning,
            reason: HashMap::new(),
            requiring: HashMap::new(),
        }
    }

    fn state(&self, m: &PackageVersion, ctx: DqContext) -> DqState {
        self.reason
            .get(m)
            .map(|per| per.get(ctx).clone())
            .unwrap_or_default()
    }

    /// Whether and why `m` is disqualified in the given context.
    pub fn check(&self, m: &PackageVersion, ctx: DqContext) -> DqState {
        self.state(m, ctx)
    }

    /// Mark `m` as currently being traversed in `ctx`, so that a cycle
    /// reaching it again short-circuits. No-op once any other state is set.
    pub fn mark_computing(&mut self, m: &PackageVersion, ctx: DqContext) {
        let per = self.reason.entry(m.clone()).or_default();
        let slot = match ctx {
            DqContext::Pruned => &mut per.pruned,
            DqContext::Unpruned => &mut per.unpruned,
        };
        if matches!(slot, DqState::Unknown) {
            *slot = DqState::Computing;
        }
    }

    /// Record that `m` directly requires `r`, in case `r` later becomes
    /// disqualified. (These edges point in the opposite direction from the
    /// requirement graph's.)
    ///
    /// If `r` is already disqualified in the context that matters for `m`,
    /// the disqualification propagates to `m` immediately and `require`
    /// returns false: the caller must not use `r`'s requirements.
    pub fn require(&mut self, m: &PackageVersion, r: &PackageVersion) -> bool {
        if let Some(&root_pruning) = self.root_pruning.get(r) {
            if self.state(r, context_of(root_pruning)).is_disqualified() {
                // r is a root, so its problematic requirements are always
                // included wherever r is selected: m cannot use r at all.
                self.disqualify(m.clone(), DqContext::Pruned, DqState::DisqualifiedBy(r.clone()));
                return false;
            }
        }

        if self.state(r, DqContext::Unpruned).is_disqualified() {
            self.disqualify(
                m.clone(),
                DqContext::Unpruned,
                DqState::DisqualifiedBy(r.clone()),
            );
            if !self.root_pruning.contains_key(m) {
                // m is not a root, so its requirements are never included
                // in the pruned part of the graph; everything that matters
                // is already disqualified.
                return false;
            }
        }

        self.requiring.entry(r.clone()).or_default().push(m.clone());
        true
    }

    /// Record why the requirements of `m` cannot be included in the module
    /// graph when reached from a part of the graph with the given context,
    /// and propagate to recorded dependents.
    ///
    /// Disqualifying in the pruned context always also disqualifies in the
    /// unpruned context; observing the reverse is an internal error.
    pub fn disqualify(&mut self, m: PackageVersion, from: DqContext, reason: DqState) {
        if !reason.is_disqualified() {
            panic!("internal error: disqualify called with a non-disqualifying state");
        }
        if self.state(&m, from).is_disqualified() {
            // Already disqualified for some other reason; keep the first.
            return;
        }

        let root_pruning = self.root_pruning.get(&m).copied();
        {
            let per = self.reason.entry(m.clone()).or_default();
            match from {
                DqContext::Pruned => {
                    per.pruned = reason.clone();
                    if !per.unpruned.is_disqualified() {
                        // The pruned requirements are a subset of the
                        // unpruned ones, so the same reason applies.
                        per.unpruned = reason;
                    }
                }
                DqContext::Unpruned => {
                    per.unpruned = reason.clone();
                    if per.pruned.is_disqualified() {
                        panic!(
                            "internal error: {m} is marked as disqualified when pruned, but not when unpruned"
                        );
                    }
                    if root_pruning == Some(Pruning::Unpruned) {
                        // m is a root whose manifest always pulls in its
                        // full unpruned requirements; even pruned roots
                        // that select it re-include the problem.
                        per.pruned = reason;
                    }
                }
            }
        }

        let is_root = root_pruning.is_some();
        if is_root && (from == DqContext::Pruned || root_pruning == Some(Pruning::Unpruned)) {
            // Everything that depends on m must be disqualified outright,
            // and these edges are now fully resolved.
            let dependents = self.requiring.remove(&m).unwrap_or_default();
            for p in dependents {
                self.disqualify(p, DqContext::Pruned, DqState::DisqualifiedBy(m.clone()));
            }
            return;
        }

        // The reason is only visible to the unpruned parts of the graph.
        let dependents = self.requiring.get(&m).cloned().unwrap_or_default();
        for p in dependents {
            self.disqualify(p, DqContext::Unpruned, DqState::DisqualifiedBy(m.clone()));
        }
        if !is_root {
            // m's requirements can never be included in a pruned context,
            // so no further propagation can originate here.
            self.requiring.remove(&m);
        }
    }

    /// The chain from `m` to the root cause of its disqualification, for
    /// error reporting. Empty when `m` is not disqualified. The error is
    /// returned when the chain ends at a version whose requirements could
    /// not be read.
    pub fn path(
        &self,
        m: &PackageVersion,
        ctx: DqContext,
    ) -> (Vec<PackageVersion>, Option<Arc<ResolveError>>) {
        let mut path = Vec::new();
        let mut cur = m.clone();
        loop {
            match self.state(&cur, ctx) {
                DqState::DisqualifiedBy(dep) => {
                    path.push(cur.clone());
                    if dep == cur {
                        return (path, None);
                    }
                    cur = dep;
                }
                DqState::Failed(err) => {
                    path.push(cur);
                    return (path, Some(err));
                }
                DqState::Unknown | DqState::Computing => return (path, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Revision;

    fn pv(path: &str, version: &str) -> PackageVersion {
        PackageVersion::new(
            path,
            Revision::version(semver::Version::parse(version).unwrap()),
        )
    }

    fn failed(detail: &str) -> DqState {
        DqState::Failed(Arc::new(ResolveError::MissingImport {
            path: detail.to_string(),
        }))
    }

    #[test]
    fn pruned_disqualification_implies_unpruned() {
        let mut tracker = DqTracker::new(HashMap::new());
        let x = pv("registry.example/x", "1.0.0");
        tracker.disqualify(x.clone(), DqContext::Pruned, failed("x"));

        assert!(tracker.check(&x, DqContext::Pruned).is_disqualified());
        assert!(tracker.check(&x, DqContext::Unpruned).is_disqualified());
    }

    #[test]
    fn unpruned_disqualification_stays_unpruned_for_non_roots() {
        let mut tracker = DqTracker::new(HashMap::new());
        let x = pv("registry.example/x", "1.0.0");
        tracker.disqualify(x.clone(), DqContext::Unpruned, failed("x"));

        assert!(!tracker.check(&x, DqContext::Pruned).is_disqualified());
        assert!(tracker.check(&x, DqContext::Unpruned).is_disqualified());
    }

    #[test]
    fn unpruned_only_edge_leaves_pruned_dependent_usable() {
        // X is disqualified in the pruned context (say, a checksum error in
        // its requirements); Y reaches X only through an edge that is
        // evaluated unpruned. Y stays resolvable under pruned evaluation
        // but is disqualified under unpruned evaluation.
        let y = pv("registry.example/y", "1.0.0");
        let x = pv("registry.example/x", "1.0.0");
        let mut tracker =
            DqTracker::new(HashMap::from([(y.clone(), Pruning::Pruned)]));

        assert!(tracker.require(&y, &x));
        tracker.disqualify(x.clone(), DqContext::Pruned, failed("x"));

        assert!(!tracker.check(&y, DqContext::Pruned).is_disqualified());
        assert!(tracker.check(&y, DqContext::Unpruned).is_disqualified());
    }

    #[test]
    fn unpruned_root_propagates_to_pruned_dependents() {
        // m's manifest predates pruning, so selecting it always pulls in
        // its full requirement set; its problems reach even pruned
        // dependents.
        let m = pv("registry.example/legacy", "1.0.0");
        let p = pv("registry.example/p", "1.0.0");
        let mut tracker =
            DqTracker::new(HashMap::from([(m.clone(), Pruning::Unpruned)]));

        assert!(tracker.require(&p, &m));
        tracker.disqualify(m.clone(), DqContext::Unpruned, failed("legacy"));

        assert!(tracker.check(&m, DqContext::Pruned).is_disqualified());
        assert!(tracker.check(&p, DqContext::Pruned).is_disqualified());
    }

    #[test]
    fn require_refuses_already_disqualified_roots() {
        let r = pv("registry.example/r", "1.0.0");
        let m = pv("registry.example/m", "1.0.0");
        let mut tracker =
            DqTracker::new(HashMap::from([(r.clone(), Pruning::Pruned)]));

        tracker.disqualify(r.clone(), DqContext::Pruned, failed("r"));
        assert!(!tracker.require(&m, &r));
        assert!(tracker.check(&m, DqContext::Pruned).is_disqualified());
    }

    #[test]
    fn propagation_forgets_resolved_edges() {
        let a = pv("registry.example/a", "1.0.0");
        let b = pv("registry.example/b", "1.0.0");
        let mut tracker = DqTracker::new(HashMap::new());

        assert!(tracker.require(&a, &b));
        tracker.disqualify(b.clone(), DqContext::Unpruned, failed("b"));
        assert!(tracker.requiring.is_empty());
    }

    #[test]
    fn path_walks_to_the_root_cause() {
        let a = pv("registry.example/a", "1.0.0");
        let b = pv("registry.example/b", "1.0.0");
        let c = pv("registry.example/c", "1.0.0");
        let mut tracker = DqTracker::new(HashMap::new());

        assert!(tracker.require(&a, &b));
        assert!(tracker.require(&b, &c));
        tracker.disqualify(c.clone(), DqContext::Unpruned, failed("broken"));

        let (path, cause) = tracker.path(&a, DqContext::Unpruned);
        assert_eq!(path, vec![a.clone(), b.clone(), c.clone()]);
        assert!(cause.is_some());

        let (empty, _) = tracker.path(&a, DqContext::Pruned);
        assert!(empty.is_empty());
    }

    #[test]
    fn computing_sentinel_short_circuits_cycles() {
        let a = pv("registry.example/a", "1.0.0");
        let b = pv("registry.example/b", "1.0.0");
        let mut tracker = DqTracker::new(HashMap::new());

        tracker.mark_computing(&a, DqContext::Unpruned);
        assert!(tracker.check(&a, DqContext::Unpruned).is_computing());
        // The cycle edge records without recursing or disqualifying.
        assert!(tracker.require(&b, &a));
        assert!(!tracker.check(&b, DqContext::Unpruned).is_disqualified());
        // Computing does not survive an actual disqualification.
        tracker.disqualify(a.clone(), DqContext::Unpruned, failed("a"));
        assert!(tracker.check(&a, DqContext::Unpruned).is_disqualified());
    }

    #[test]
    #[should_panic(expected = "non-disqualifying")]
    fn disqualify_rejects_non_disqualifying_state() {
        let mut tracker = DqTracker::new(HashMap::new());
        tracker.disqualify(
            pv("registry.example/a", "1.0.0"),
            DqContext::Pruned,
            DqState::Unknown,
        );
    }

    #[test]
    fn first_reason_wins() {
        let x = pv("registry.example/x", "1.0.0");
        let dep = pv("registry.example/dep", "1.0.0");
        let mut tracker = DqTracker::new(HashMap::new());

        tracker.disqualify(x.clone(), DqContext::Pruned, failed("first"));
        tracker.disqualify(
            x.clone(),
            DqContext::Pruned,
            DqState::DisqualifiedBy(dep),
        );
        match tracker.check(&x, DqContext::Pruned) {
            DqState::Failed(_) => {}
            other => panic!("expected the original failure, got {other:?}"),
        }
    }
}
