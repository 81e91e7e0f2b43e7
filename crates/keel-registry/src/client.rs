//! The mirror protocol client.
//!
//! Endpoints, per mirror base URL and escaped module path:
//! ```text
//! {base}/{path}/@v/list            newline-separated `version [timestamp]`
//! {base}/{path}/@latest            JSON RevisionInfo
//! {base}/{path}/@v/{version}.info  JSON RevisionInfo
//! {base}/{path}/@v/{version}.mod   raw manifest bytes
//! {base}/{path}/@v/{version}.zip   binary archive, size-capped
//! ```
//!
//! The client is stateless per call apart from the single-flight cache of
//! latest-revision computations: the `latest` answer for a module path is
//! computed at most once per mirror, and concurrent callers share the
//! result, including a cached error.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use keel_core::{
    escape_path, escape_version, is_canonical, is_pseudo, pseudo_time, PackageVersion, Revision,
    Version,
};

use crate::error::{RegistryError, Result};
use crate::mirror::{try_mirrors, RegistrySpec};
use crate::origin::Origin;
use crate::singleflight::OnceMap;

/// Metadata for one resolved revision, as served by a mirror.
///
/// Never fabricated: when an exact canonical version is requested, the
/// mirror must return that exact version or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RevisionInfo {
    pub version: Version,
    /// Commit time of the revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Abbreviated revision identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    /// Full revision identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provenance, used only for cache-reuse decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

type LatestResult = std::result::Result<RevisionInfo, Arc<RegistryError>>;

/// Client for one ordered chain of registry mirrors.
pub struct MirrorClient {
    mirrors: Vec<RegistrySpec>,
    http: reqwest::Client,
    latest: OnceMap<(String, String), LatestResult>,
}

impl MirrorClient {
    /// Create a client over the configured mirror chain.
    pub fn new(mirrors: Vec<RegistrySpec>) -> Self {
        MirrorClient {
            mirrors,
            http: reqwest::Client::new(),
            latest: OnceMap::new(),
        }
    }

    /// The configured mirror chain, in fallback order.
    pub fn mirrors(&self) -> &[RegistrySpec] {
        &self.mirrors
    }

    /// List the known versions of `path` that begin with `prefix`, sorted
    /// ascending. Pseudo-versions and malformed lines are filtered out.
    pub async fn list_versions(
        &self,
        cancel: &CancellationToken,
        path: &str,
        prefix: &str,
    ) -> Result<Vec<Version>> {
        try_mirrors(&self.mirrors, |spec| async move {
            let data = self.get_bytes(&spec, path, "@v/list", cancel).await?;
            let text = String::from_utf8_lossy(&data);
            let mut versions = Vec::new();
            for line in text.lines() {
                let Some(first) = line.split_whitespace().next() else {
                    continue;
                };
                if !first.starts_with(prefix) || !is_canonical(first) {
                    continue;
                }
                let v = Version::parse(first).expect("checked by is_canonical");
                if is_pseudo(&v) {
                    continue;
                }
                versions.push(v);
            }
            versions.sort();
            versions.dedup();
            Ok(versions)
        })
        .await
    }

    /// The latest revision of `path`.
    ///
    /// Asks the dedicated `@latest` endpoint first; if that reports
    /// not-found, scans the full version list and selects, among untagged
    /// revisions only, the one with the newest commit timestamp. Computed
    /// once per (mirror, path); concurrent callers share one computation.
    pub async fn latest(&self, cancel: &CancellationToken, path: &str) -> Result<RevisionInfo> {
        try_mirrors(&self.mirrors, |spec| async move {
            let key = (spec.url.to_string(), path.to_string());
            let shared = self
                .latest
                .get_or_init(key, || async {
                    self.fetch_latest(&spec, path, cancel).await.map_err(Arc::new)
                })
                .await;
            shared.map_err(RegistryError::Cached)
        })
        .await
    }

    /// Fetch metadata for one version of `path`.
    ///
    /// Requesting a canonical version and receiving a different one is a
    /// protocol violation and fails hard for that mirror.
    pub async fn stat(
        &self,
        cancel: &CancellationToken,
        path: &str,
        version: &Version,
    ) -> Result<RevisionInfo> {
        try_mirrors(&self.mirrors, |spec| async move {
            self.stat_on(&spec, path, version, cancel).await
        })
        .await
    }

    /// Fetch the raw manifest bytes for a version of `path`. The version
    /// must already be canonical; anything else is a caller bug.
    pub async fn fetch_manifest(
        &self,
        cancel: &CancellationToken,
        path: &str,
        version: &Version,
    ) -> Result<Vec<u8>> {
        let rendered = version.to_string();
        if !is_canonical(&rendered) {
            return Err(RegistryError::Internal {
                detail: format!("version {rendered} passed to fetch_manifest is not canonical"),
            });
        }
        let suffix = format!("@v/{}.mod", escape_version(&rendered));
        try_mirrors(&self.mirrors, |spec| {
            let suffix = suffix.clone();
            async move { self.get_bytes(&spec, path, &suffix, cancel).await }
        })
        .await
    }

    /// Fetch the archive for a version of `path`, reading at most
    /// `size_limit + 1` bytes. Observing the extra byte aborts with a
    /// size-exceeded error; the archive is never silently truncated.
    pub async fn fetch_archive(
        &self,
        cancel: &CancellationToken,
        path: &str,
        version: &Version,
        size_limit: u64,
    ) -> Result<Vec<u8>> {
        let rendered = version.to_string();
        if !is_canonical(&rendered) {
            return Err(RegistryError::Internal {
                detail: format!("version {rendered} passed to fetch_archive is not canonical"),
            });
        }
        let suffix = format!("@v/{}.zip", escape_version(&rendered));
        let module = PackageVersion::new(path, Revision::version(version.clone()));
        try_mirrors(&self.mirrors, |spec| {
            let suffix = suffix.clone();
            let module = module.clone();
            async move {
                let resp = self.get_response(&spec, path, &suffix, cancel).await?;
                let mut stream = resp.bytes_stream();
                let mut data = Vec::new();
                while let Some(chunk) = cancellable(cancel, stream.next()).await? {
                    let chunk = chunk.map_err(|e| RegistryError::Transport {
                        mirror: spec.url.to_string(),
                        source: e,
                    })?;
                    if (data.len() + chunk.len()) as u64 > size_limit {
                        return Err(RegistryError::SizeExceeded {
                            module,
                            limit: size_limit,
                        });
                    }
                    data.extend_from_slice(&chunk);
                }
                Ok(data)
            }
        })
        .await
    }

    async fn fetch_latest(
        &self,
        spec: &RegistrySpec,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<RevisionInfo> {
        match self.get_bytes(spec, path, "@latest", cancel).await {
            Ok(data) => parse_revision_info(spec, &data),
            Err(err) if err.is_not_found() => self.latest_from_list(spec, path, cancel).await,
            Err(err) => Err(err),
        }
    }

    /// Derive the latest revision from the full version list: only untagged
    /// (pseudo) revisions count, ordered by the timestamp the mirror
    /// reports, or failing that by the time encoded in the pseudo-version.
    async fn latest_from_list(
        &self,
        spec: &RegistrySpec,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<RevisionInfo> {
        let data = self.get_bytes(spec, path, "@v/list", cancel).await?;
        let text = String::from_utf8_lossy(&data);

        let mut best: Option<(DateTime<Utc>, Version)> = None;
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let Some(first) = fields.next() else { continue };
            let Ok(v) = Version::parse(first) else { continue };
            if !is_pseudo(&v) {
                continue;
            }
            let time = fields
                .next()
                .and_then(|f| DateTime::parse_from_rfc3339(f).ok())
                .map(|t| t.with_timezone(&Utc))
                .or_else(|| pseudo_time(&v));
            let Some(time) = time else { continue };
            if best.as_ref().map_or(true, |(bt, _)| time > *bt) {
                best = Some((time, v));
            }
        }

        match best {
            // Stat fills in the remaining fields, including origin.
            Some((_, version)) => self.stat_on(spec, path, &version, cancel).await,
            None => Err(RegistryError::NoRevisions {
                path: path.to_string(),
            }),
        }
    }

    async fn stat_on(
        &self,
        spec: &RegistrySpec,
        path: &str,
        version: &Version,
        cancel: &CancellationToken,
    ) -> Result<RevisionInfo> {
        let rendered = version.to_string();
        let suffix = format!("@v/{}.info", escape_version(&rendered));
        let data = self.get_bytes(spec, path, &suffix, cancel).await?;
        let info = parse_revision_info(spec, &data)?;
        if info.version != *version && is_canonical(&rendered) {
            return Err(RegistryError::ProtocolViolation {
                mirror: spec.url.to_string(),
                path: path.to_string(),
                requested: rendered,
                actual: info.version.to_string(),
            });
        }
        Ok(info)
    }

    async fn get_bytes(
        &self,
        spec: &RegistrySpec,
        path: &str,
        suffix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let resp = self.get_response(spec, path, suffix, cancel).await?;
        let bytes = cancellable(cancel, resp.bytes())
            .await?
            .map_err(|e| RegistryError::Transport {
                mirror: spec.url.to_string(),
                source: e,
            })?;
        Ok(bytes.to_vec())
    }

    async fn get_response(
        &self,
        spec: &RegistrySpec,
        path: &str,
        suffix: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let url = endpoint(spec, path, suffix)?;
        debug!(%url, "mirror request");
        let resp = cancellable(cancel, self.http.get(url.clone()).send())
            .await?
            .map_err(|e| RegistryError::Transport {
                mirror: spec.url.to_string(),
                source: e,
            })?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(RegistryError::NotFound {
                what: format!("{path} ({suffix})"),
                mirror: spec.url.to_string(),
            }),
            s => Err(RegistryError::Status {
                mirror: spec.url.to_string(),
                status: s.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

/// Build the endpoint URL for one operation against one mirror.
fn endpoint(spec: &RegistrySpec, path: &str, suffix: &str) -> Result<Url> {
    let raw = format!(
        "{}/{}/{}",
        spec.url.as_str().trim_end_matches('/'),
        escape_path(path),
        suffix
    );
    Url::parse(&raw).map_err(|e| RegistryError::InvalidMirror {
        url: raw,
        detail: e.to_string(),
    })
}

fn parse_revision_info(spec: &RegistrySpec, data: &[u8]) -> Result<RevisionInfo> {
    serde_json::from_slice(data).map_err(|e| RegistryError::InvalidResponse {
        mirror: spec.url.to_string(),
        detail: e.to_string(),
    })
}

/// Race `fut` against cancellation of the request scope.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        out = fut => Ok(out),
    }
}
