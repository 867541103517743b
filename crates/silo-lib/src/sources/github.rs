//! GitHub fetcher.
//!
//! References are resolved to a commit SHA through the ref API (branch,
//! then tag, then a literal commit), and the SHA-pinned archive URL is
//! used both for the download and as the cache key, so repeated
//! installs of the same commit never touch the network twice.

use super::cache::DownloadCache;
use super::{Source, SourceKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_ARCHIVE_BASE: &str = "https://github.com";

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

pub struct GitHubFetcher {
    client: reqwest::Client,
    api_base: String,
    archive_base: String,
    cache: DownloadCache,
}

impl GitHubFetcher {
    pub fn new(cache: DownloadCache) -> Result<Self> {
        Ok(Self {
            client: super::http_client(Duration::from_secs(300))?,
            api_base: DEFAULT_API_BASE.to_string(),
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            cache,
        })
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, archive_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.archive_base = archive_base.into();
        self
    }

    /// Resolve a branch/tag/commit reference to a commit SHA. A missing
    /// reference resolves to the head of the default branch.
    pub async fn resolve_commit(
        &self,
        cancel: &CancellationToken,
        owner: &str,
        repo: &str,
        reference: Option<&str>,
    ) -> Result<String> {
        let Some(reference) = reference else {
            return self.latest_commit(cancel, owner, repo).await;
        };

        for kind in ["heads", "tags"] {
            let url = format!(
                "{}/repos/{owner}/{repo}/git/refs/{kind}/{reference}",
                self.api_base
            );
            let response = tokio::select! {
                _ = cancel.cancelled() => bail!("ref resolution cancelled"),
                response = self.client.get(&url).send() => response.context("querying ref API")?,
            };
            if response.status().is_success() {
                let parsed: RefResponse =
                    response.json().await.context("parsing ref response")?;
                log::debug!("resolved {owner}/{repo}@{reference} to {}", parsed.object.sha);
                return Ok(parsed.object.sha);
            }
        }

        // The reference may already be a commit SHA.
        if reference.len() >= 7 && reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(reference.to_string());
        }

        bail!("branch or tag {reference:?} not found in repository {owner}/{repo}")
    }

    async fn latest_commit(
        &self,
        cancel: &CancellationToken,
        owner: &str,
        repo: &str,
    ) -> Result<String> {
        let url = format!("{}/repos/{owner}/{repo}/commits", self.api_base);
        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("commit query cancelled"),
            response = self.client.get(&url).send() => response.context("querying commits API")?,
        };
        if !response.status().is_success() {
            bail!(
                "GitHub API returned status {} for {owner}/{repo}",
                response.status()
            );
        }
        let commits: Vec<CommitResponse> =
            response.json().await.context("parsing commits response")?;
        let head = commits
            .first()
            .with_context(|| format!("no commits found for repository {owner}/{repo}"))?;
        Ok(head.sha.clone())
    }
}

/// Download the commit-pinned archive of a repository, going through
/// the download cache. Returns the content hash of the bytes written
/// to `sink`.
pub(crate) async fn download_pinned_archive(
    client: &reqwest::Client,
    cache: &DownloadCache,
    archive_base: &str,
    cancel: &CancellationToken,
    owner: &str,
    repo: &str,
    sha: &str,
    sink: &mut (dyn Write + Send),
) -> Result<String> {
    let url = format!("{archive_base}/{owner}/{repo}/archive/{sha}.zip");

    if let Some(data) = cache.lookup(&url)? {
        log::debug!("using cached archive for {owner}/{repo}@{sha}");
        sink.write_all(&data).context("writing cached archive")?;
        return Ok(super::hash_bytes(&data));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => bail!("archive download cancelled"),
        response = client.get(&url).send() => response.context("downloading repository archive")?,
    };
    if !response.status().is_success() {
        bail!(
            "repository archive download failed with status {}: {url}",
            response.status()
        );
    }

    let mut buffer = Vec::new();
    let hash = super::stream_response(cancel, response, &mut buffer).await?;
    if let Err(err) = cache.store(&url, &buffer) {
        log::warn!("failed to cache download for {url}: {err:#}");
    }
    sink.write_all(&buffer).context("writing archive bytes")?;
    Ok(hash)
}

#[async_trait]
impl super::Fetcher for GitHubFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::GitHub {
            owner,
            repo,
            subpath,
            reference,
        } = source
        else {
            bail!("invalid source kind for GitHub fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::GitHub);

        if super::is_multi_mod_repo(owner, repo) && subpath.is_none() {
            bail!("a subpath is required for multi-mod repository {owner}/{repo}");
        }

        let sha = self
            .resolve_commit(cancel, owner, repo, reference.as_deref())
            .await?;
        download_pinned_archive(
            &self.client,
            &self.cache,
            &self.archive_base,
            cancel,
            owner,
            repo,
            &sha,
            sink,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn multi_mod_repo_requires_subpath() {
        let tmp = tempdir().unwrap();
        let fetcher = GitHubFetcher::new(DownloadCache::new(tmp.path())).unwrap();
        let source = Source::parse("gh:Arch666Angel/mods@master").unwrap();
        let cancel = CancellationToken::new();
        let mut sink = Vec::new();

        let err = crate::sources::Fetcher::fetch(&fetcher, &cancel, &source, &mut sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("subpath is required"));
    }

    #[tokio::test]
    async fn cached_archive_skips_network() {
        let tmp = tempdir().unwrap();
        let cache = DownloadCache::new(tmp.path());
        // Pre-seed the cache under the pinned URL; an unroutable
        // archive base proves no request is made on the hit path.
        let url = "http://127.0.0.1:1/o/r/archive/abcdef1234567.zip";
        cache.store(url, b"repo-bytes").unwrap();

        let client = crate::sources::http_client(Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let mut sink = Vec::new();
        let hash = download_pinned_archive(
            &client,
            &cache,
            "http://127.0.0.1:1",
            &cancel,
            "o",
            "r",
            "abcdef1234567",
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(sink, b"repo-bytes");
        assert_eq!(hash, crate::sources::hash_bytes(b"repo-bytes"));
    }
}
