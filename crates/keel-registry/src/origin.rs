//! Provenance records for resolved revisions.
//!
//! An `Origin` describes how a version was obtained from its source of
//! truth (VCS kind, commit hash, tag-set checksum). It is opaque to the
//! resolution algorithms and is used only to decide whether previously
//! cached results may be reused without re-querying the registry.

use serde::{Deserialize, Serialize};

/// Provenance of a resolved revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_sum: Option<String>,
    #[serde(default, rename = "Ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
}

impl Origin {
    /// Whether this origin pins enough state (a commit hash or a tag-set
    /// checksum) to justify reusing cached results derived from it.
    pub fn checkable(&self) -> bool {
        self.hash.is_some() || self.tag_sum.is_some()
    }
}

/// Union of data from two origins.
///
/// Returns `None` if the origins conflict, including when either input is
/// missing; a caller holding a `None` merge must re-query rather than reuse.
pub fn merge(a: Option<&Origin>, b: Option<&Origin>) -> Option<Origin> {
    let (a, b) = (a?, b?);
    if a.vcs != b.vcs || a.url != b.url || a.subdir != b.subdir {
        return None;
    }

    let mut merged = a.clone();
    if let Some(hash) = &b.hash {
        if a.hash.as_ref().is_some_and(|h| h != hash) {
            return None;
        }
        merged.hash = Some(hash.clone());
    }
    if let Some(tag_sum) = &b.tag_sum {
        if a.tag_sum.is_some()
            && (a.tag_sum.as_deref() != Some(tag_sum.as_str()) || a.tag_prefix != b.tag_prefix)
        {
            return None;
        }
        merged.tag_sum = Some(tag_sum.clone());
        merged.tag_prefix = b.tag_prefix.clone();
    }
    if let Some(ref_name) = &b.ref_name {
        if a.ref_name.as_ref().is_some_and(|r| r != ref_name) {
            return None;
        }
        merged.ref_name = Some(ref_name.clone());
    }
    Some(merged)
}
