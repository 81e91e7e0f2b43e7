//! Mirror specifications and the ordered-fallback algorithm.
//!
//! The mirror list is process-wide configuration, read-only after
//! initialization. In the list syntax, entries are separated by `,` or `|`:
//! a mirror followed by `|` falls back to the next entry after *any* error,
//! while a mirror followed by `,` falls back only on not-found.

use std::future::Future;

use tracing::debug;
use url::Url;

use crate::error::{ErrorRank, RegistryError, Result};

/// One mirror registry in the ordered chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySpec {
    /// Base URL of the mirror.
    pub url: Url,
    /// Whether to try the next mirror after an error that is not a simple
    /// not-found.
    pub fallback_on_error: bool,
}

/// Parse a mirror-list configuration string into an ordered spec list.
///
/// The separator *after* each entry determines that entry's fallback policy;
/// the final entry's policy is irrelevant and defaults to false.
pub fn parse_mirror_list(list: &str) -> Result<Vec<RegistrySpec>> {
    let mut specs = Vec::new();
    let mut rest = list.trim();
    while !rest.is_empty() {
        let (entry, fallback_on_error, remainder) = match rest.find(['|', ',']) {
            Some(i) => (&rest[..i], rest.as_bytes()[i] == b'|', &rest[i + 1..]),
            None => (rest, false, ""),
        };
        rest = remainder;
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let url = Url::parse(entry).map_err(|e| RegistryError::InvalidMirror {
            url: entry.to_string(),
            detail: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(RegistryError::InvalidMirror {
                    url: entry.to_string(),
                    detail: format!("unsupported scheme {other:?} (must be http or https)"),
                })
            }
        }
        specs.push(RegistrySpec {
            url,
            fallback_on_error,
        });
    }
    Ok(specs)
}

/// Run `op` against each mirror in order until one succeeds.
///
/// A mirror with `fallback_on_error = false` stops the iteration after any
/// error other than not-found. When every attempted mirror fails, the
/// highest-ranked error observed is returned, so the caller sees the most
/// actionable failure even if several mirrors misbehaved. Cancellation
/// propagates immediately.
pub async fn try_mirrors<T, F, Fut>(mirrors: &[RegistrySpec], op: F) -> Result<T>
where
    F: Fn(RegistrySpec) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if mirrors.is_empty() {
        return Err(RegistryError::NoMirrors);
    }

    let mut best: Option<(ErrorRank, RegistryError)> = None;
    for spec in mirrors {
        let err = match op(spec.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if matches!(err.root(), RegistryError::Cancelled) {
            return Err(err);
        }

        let not_found = err.is_not_found();
        let rank = err.rank();
        debug!(mirror = %spec.url, %err, ?rank, "mirror attempt failed");
        if best.as_ref().map_or(true, |(r, _)| rank >= *r) {
            best = Some((rank, err));
        }

        if !spec.fallback_on_error && !not_found {
            break;
        }
    }

    Err(best.map(|(_, e)| e).unwrap_or(RegistryError::NoMirrors))
}
