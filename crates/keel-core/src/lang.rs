//! Language-version gating.
//!
//! A manifest may declare the minimum Keel language version its module
//! needs. Versions are dotted decimal strings ("1.0", "1.1", "1.2") compared
//! field-wise. Modules declaring 1.1 or later publish complete requirement
//! manifests and participate in pruned graph evaluation.

use std::cmp::Ordering;

/// The newest language version this resolver understands.
pub const SUPPORTED: &str = "1.2";

/// The language version that introduced complete requirement manifests.
pub const PRUNING_INTRODUCED: &str = "1.1";

/// Compare two dotted decimal language versions field-wise. Missing fields
/// count as zero, so "1" == "1.0".
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut xa = a.split('.').map(|f| f.parse::<u64>().unwrap_or(0));
    let mut xb = b.split('.').map(|f| f.parse::<u64>().unwrap_or(0));
    loop {
        match (xa.next(), xb.next()) {
            (None, None) => return Ordering::Equal,
            (fa, fb) => match fa.unwrap_or(0).cmp(&fb.unwrap_or(0)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Whether a manifest declaring `lang` can be handled by this resolver.
pub fn is_supported(lang: &str) -> bool {
    compare(lang, SUPPORTED) != Ordering::Greater
}

/// Whether a module declaring `lang` (or nothing) carries a complete
/// requirement manifest and may be evaluated with a pruned graph.
pub fn supports_pruned_graph(lang: Option<&str>) -> bool {
    match lang {
        Some(l) => compare(l, PRUNING_INTRODUCED) != Ordering::Less,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_wise_compare() {
        assert_eq!(compare("1.0", "1.1"), Ordering::Less);
        assert_eq!(compare("1.2", "1.2"), Ordering::Equal);
        assert_eq!(compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare("1", "1.0"), Ordering::Equal);
    }

    #[test]
    fn supported_window() {
        assert!(is_supported("1.0"));
        assert!(is_supported(SUPPORTED));
        assert!(!is_supported("1.3"));
        assert!(!is_supported("2.0"));
    }

    #[test]
    fn pruning_threshold() {
        assert!(!supports_pruned_graph(None));
        assert!(!supports_pruned_graph(Some("1.0")));
        assert!(supports_pruned_graph(Some("1.1")));
        assert!(supports_pruned_graph(Some("1.2")));
    }
}
