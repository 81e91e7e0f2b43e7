//! Semantic-version helpers for the module system.
//!
//! Wraps the `semver` crate and adds the pseudo-version encoding used for
//! untagged revisions: a pre-release suffix of the form
//! `yyyymmddhhmmss-abcdef123456` (UTC commit time, then a 12-character
//! revision identifier), e.g. `0.0.0-20260101120000-1a2b3c4d5e6f`.

use chrono::{DateTime, NaiveDateTime, Utc};

/// A parsed semantic version.
pub type Version = semver::Version;

/// Error for a version string that is not canonical.
#[derive(Debug, thiserror::Error)]
#[error("invalid canonical version {version:?}")]
pub struct NonCanonicalError {
    pub version: String,
}

/// Whether `s` is a canonical version: valid semver, no build metadata, and
/// identical to its own rendering.
pub fn is_canonical(s: &str) -> bool {
    match Version::parse(s) {
        Ok(v) => v.build.is_empty() && v.to_string() == s,
        Err(_) => false,
    }
}

/// Parse `s` as a canonical version, rejecting anything that does not
/// round-trip exactly.
pub fn parse_canonical(s: &str) -> Result<Version, NonCanonicalError> {
    if !is_canonical(s) {
        return Err(NonCanonicalError {
            version: s.to_string(),
        });
    }
    Ok(Version::parse(s).expect("checked by is_canonical"))
}

/// Whether `v` is a pseudo-version synthesized for an untagged revision.
pub fn is_pseudo(v: &Version) -> bool {
    pseudo_parts(v).is_some()
}

/// The commit time encoded in a pseudo-version, if `v` is one.
pub fn pseudo_time(v: &Version) -> Option<DateTime<Utc>> {
    let (stamp, _) = pseudo_parts(v)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Some(naive.and_utc())
}

/// Split the trailing `timestamp-revision` pair out of a pseudo-version's
/// pre-release, or `None` if the shape does not match.
fn pseudo_parts(v: &Version) -> Option<(&str, &str)> {
    if v.pre.is_empty() {
        return None;
    }
    // Only the final dotted pre-release segment carries the encoding.
    let last = v.pre.as_str().rsplit('.').next()?;
    let (stamp, rev) = last.split_at(last.find('-')?);
    let rev = &rev[1..];
    if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if rev.len() != 12 || !rev.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return None;
    }
    Some((stamp, rev))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn canonical_accepts_plain_versions() {
        assert!(is_canonical("1.2.3"));
        assert!(is_canonical("0.0.1-alpha.2"));
    }

    #[test]
    fn canonical_rejects_build_metadata_and_garbage() {
        assert!(!is_canonical("1.2.3+sha.abc"));
        assert!(!is_canonical("1.2"));
        assert!(!is_canonical("v1.2.3"));
        assert!(!is_canonical("01.2.3"));
        assert!(parse_canonical("1.2").is_err());
    }

    #[test]
    fn pseudo_version_detection() {
        assert!(is_pseudo(&v("0.0.0-20260101120000-1a2b3c4d5e6f")));
        assert!(is_pseudo(&v("1.2.4-0.20260101120000-1a2b3c4d5e6f")));
        assert!(!is_pseudo(&v("1.2.3")));
        assert!(!is_pseudo(&v("1.2.3-alpha.1")));
        // Wrong stamp length.
        assert!(!is_pseudo(&v("0.0.0-2026010112000-1a2b3c4d5e6f")));
        // Uppercase hex is not a valid revision id.
        assert!(!is_pseudo(&v("0.0.0-20260101120000-1A2B3C4D5E6F")));
    }

    #[test]
    fn pseudo_time_parses_the_stamp() {
        let t = pseudo_time(&v("0.0.0-20260101120000-1a2b3c4d5e6f")).unwrap();
        assert_eq!(t.to_rfc3339(), "2026-01-01T12:00:00+00:00");
        assert!(pseudo_time(&v("1.2.3")).is_none());
    }

    #[test]
    fn semver_ordering_sorts_pseudo_before_release() {
        let mut versions = vec![
            v("1.0.0"),
            v("1.0.1-0.20260101120000-1a2b3c4d5e6f"),
            v("1.0.1"),
        ];
        versions.sort();
        assert_eq!(versions.last().unwrap(), &v("1.0.1"));
    }
}
