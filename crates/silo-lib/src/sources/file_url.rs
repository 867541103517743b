//! Local-file and plain-URL fetchers. Both are pass-throughs that
//! hash while copying.

use super::{Source, SourceKind};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct FileFetcher;

#[async_trait]
impl super::Fetcher for FileFetcher {
    async fn fetch(
        &self,
        _cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::File { path } = source else {
            bail!("invalid source kind for file fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::File);

        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading mod file {:?}", path))?;
        sink.write_all(&data).context("writing mod bytes")?;
        Ok(super::hash_bytes(&data))
    }
}

pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: super::http_client(Duration::from_secs(300))?,
        })
    }
}

#[async_trait]
impl super::Fetcher for UrlFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::Url { url } = source else {
            bail!("invalid source kind for URL fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::Url);

        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("download cancelled"),
            response = self.client.get(url).send() => response.context("fetching URL")?,
        };
        if !response.status().is_success() {
            bail!("URL fetch returned status {}: {url}", response.status());
        }
        super::stream_response(cancel, response, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Fetcher;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_fetch_hashes_content() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mod.zip");
        std::fs::write(&path, b"mod contents").unwrap();

        let cancel = CancellationToken::new();
        let mut sink = Vec::new();
        let source = Source::File { path };
        let hash = FileFetcher.fetch(&cancel, &source, &mut sink).await.unwrap();

        assert_eq!(sink, b"mod contents");
        let mut hasher = Sha256::new();
        hasher.update(b"mod contents");
        assert_eq!(hash, format!("{:x}", hasher.finalize()));
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let cancel = CancellationToken::new();
        let mut sink = Vec::new();
        let source = Source::File {
            path: "/does/not/exist.zip".into(),
        };
        assert!(FileFetcher.fetch(&cancel, &source, &mut sink).await.is_err());
    }
}
