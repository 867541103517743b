//! Generic git-forge fetcher.
//!
//! Works through each host family's archive endpoint rather than the
//! git protocol; hosts without a known endpoint are rejected.

use super::cache::DownloadCache;
use super::{Source, SourceKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct GitFetcher {
    client: reqwest::Client,
    cache: DownloadCache,
}

impl GitFetcher {
    pub fn new(cache: DownloadCache) -> Result<Self> {
        Ok(Self {
            client: super::http_client(Duration::from_secs(300))?,
            cache,
        })
    }
}

/// Convert a `<host>/<path>` repository and ref into an archive URL
/// for the known host families.
pub fn archive_url(repo: &str, reference: &str) -> Option<String> {
    let repo = repo.trim_end_matches(".git");
    let (host, path) = repo.split_once('/')?;

    match host {
        "github.com" => Some(format!("https://github.com/{path}/archive/{reference}.zip")),
        "gitlab.com" => {
            let name = path.rsplit('/').next()?;
            Some(format!(
                "https://gitlab.com/{path}/-/archive/{reference}/{name}-{reference}.zip"
            ))
        }
        "bitbucket.org" => Some(format!("https://bitbucket.org/{path}/get/{reference}.zip")),
        _ => None,
    }
}

#[async_trait]
impl super::Fetcher for GitFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::Git { repo, reference } = source else {
            bail!("invalid source kind for git fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::Git);

        let url = archive_url(repo, reference)
            .with_context(|| format!("unsupported git hosting service: {repo}"))?;

        if let Some(data) = self.cache.lookup(&url)? {
            log::debug!("using cached archive for {repo}@{reference}");
            sink.write_all(&data).context("writing cached archive")?;
            return Ok(super::hash_bytes(&data));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("git archive download cancelled"),
            response = self.client.get(&url).send() => response.context("downloading git archive")?,
        };
        if !response.status().is_success() {
            bail!(
                "repository not found or inaccessible ({}): {repo}",
                response.status()
            );
        }

        let mut buffer = Vec::new();
        let hash = super::stream_response(cancel, response, &mut buffer).await?;
        if let Err(err) = self.cache.store(&url, &buffer) {
            log::warn!("failed to cache download for {url}: {err:#}");
        }
        sink.write_all(&buffer).context("writing archive bytes")?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_known_hosts() {
        assert_eq!(
            archive_url("github.com/user/repo", "main").unwrap(),
            "https://github.com/user/repo/archive/main.zip"
        );
        assert_eq!(
            archive_url("gitlab.com/group/proj", "v1.0").unwrap(),
            "https://gitlab.com/group/proj/-/archive/v1.0/proj-v1.0.zip"
        );
        assert_eq!(
            archive_url("bitbucket.org/user/repo.git", "main").unwrap(),
            "https://bitbucket.org/user/repo/get/main.zip"
        );
    }

    #[test]
    fn rejects_unknown_hosts() {
        assert!(archive_url("codeberg.org/user/repo", "main").is_none());
        assert!(archive_url("norepo", "main").is_none());
    }
}
