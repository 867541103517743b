//! GitHub pull-request fetcher.
//!
//! The PR metadata supplies the head commit SHA; the download itself
//! is the same SHA-pinned archive the plain GitHub fetcher uses.

use super::cache::DownloadCache;
use super::github::download_pinned_archive;
use super::{Source, SourceKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct PrResponse {
    head: PrHead,
}

#[derive(Debug, Deserialize)]
struct PrHead {
    #[serde(default)]
    sha: String,
}

pub struct GitHubPrFetcher {
    client: reqwest::Client,
    api_base: String,
    archive_base: String,
    cache: DownloadCache,
}

impl GitHubPrFetcher {
    pub fn new(cache: DownloadCache) -> Result<Self> {
        Ok(Self {
            client: super::http_client(Duration::from_secs(300))?,
            api_base: super::github::DEFAULT_API_BASE.to_string(),
            archive_base: super::github::DEFAULT_ARCHIVE_BASE.to_string(),
            cache,
        })
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, archive_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.archive_base = archive_base.into();
        self
    }

    async fn head_sha(
        &self,
        cancel: &CancellationToken,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<String> {
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}", self.api_base);
        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("PR query cancelled"),
            response = self.client.get(&url).send() => response.context("querying pull request")?,
        };
        if !response.status().is_success() {
            bail!(
                "GitHub API returned status {} for PR #{number}",
                response.status()
            );
        }
        let pr: PrResponse = response.json().await.context("parsing PR response")?;
        if pr.head.sha.is_empty() {
            bail!("PR #{number} has no head commit");
        }
        Ok(pr.head.sha)
    }
}

#[async_trait]
impl super::Fetcher for GitHubPrFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::GitHubPr {
            owner,
            repo,
            subpath,
            number,
        } = source
        else {
            bail!("invalid source kind for PR fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::GitHubPr);

        if super::is_multi_mod_repo(owner, repo) && subpath.is_none() {
            bail!("a subpath is required for multi-mod repository {owner}/{repo}");
        }

        let sha = self.head_sha(cancel, owner, repo, *number).await?;
        log::debug!("PR #{number} head is {sha}");
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
