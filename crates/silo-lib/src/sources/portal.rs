//! Mod portal fetcher.
//!
//! Queries `<portal>/api/mods/<id>` for the release list, picks the
//! newest release compatible with the instance's engine version (the
//! newest overall when none matches), and downloads it with the stored
//! account credentials appended as query parameters.

use super::{Source, SourceKind};
use crate::auth::Credentials;
use crate::utils::version;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PORTAL_BASE: &str = "https://mods.factorio.com";

#[derive(Debug, Clone, Deserialize)]
pub struct PortalRelease {
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub info_json: ReleaseInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub factorio_version: String,
}

#[derive(Debug, Deserialize)]
struct PortalModResponse {
    #[serde(default)]
    releases: Vec<PortalRelease>,
}

/// Pick the newest release whose declared engine version is compatible
/// with `engine_version`; fall back to the newest release overall.
pub fn select_release<'a>(
    releases: &'a [PortalRelease],
    engine_version: Option<&str>,
) -> Option<&'a PortalRelease> {
    if let Some(engine) = engine_version {
        for release in releases.iter().rev() {
            if version::is_compatible(engine, &release.info_json.factorio_version) {
                return Some(release);
            }
        }
        if !releases.is_empty() {
            log::warn!("no release matches engine version {engine}, using the newest");
        }
    }
    releases.last()
}

/// Download a mod from the portal into `sink`, returning the content
/// hash. `engine_version` drives release selection; credentials are
/// mandatory because the portal gates downloads behind the account
/// token.
pub async fn download_mod(
    client: &reqwest::Client,
    portal_base: &str,
    cancel: &CancellationToken,
    mod_id: &str,
    engine_version: Option<&str>,
    credentials: Option<&Credentials>,
    sink: &mut (dyn Write + Send),
) -> Result<String> {
    let api_url = format!("{portal_base}/api/mods/{mod_id}");
    log::debug!("querying mod portal: {api_url}");

    let response = tokio::select! {
        _ = cancel.cancelled() => bail!("portal query cancelled"),
        response = client.get(&api_url).send() => response.context("querying mod portal")?,
    };
    if !response.status().is_success() {
        bail!("mod portal returned status {} for {mod_id}", response.status());
    }

    let info: PortalModResponse = response
        .json()
        .await
        .context("parsing mod portal response")?;
    let release = select_release(&info.releases, engine_version)
        .with_context(|| format!("no releases found for mod {mod_id}"))?;

    log::info!("portal release for {mod_id}: {}", release.version);

    let creds = credentials.filter(|c| c.is_complete()).with_context(|| {
        format!(
            "portal credentials required to download {mod_id}\n\
             Hint: run 'siloctl auth' to sign in to your Factorio account"
        )
    })?;

    let mut url = reqwest::Url::parse(&format!("{portal_base}{}", release.download_url))
        .context("building portal download URL")?;
    url.query_pairs_mut()
        .append_pair("username", &creds.factorio_username)
        .append_pair("token", &creds.factorio_token);

    let response = tokio::select! {
        _ = cancel.cancelled() => bail!("portal download cancelled"),
        response = client.get(url).send() => response.context("downloading mod from portal")?,
    };
    if !response.status().is_success() {
        bail!(
            "portal download for {mod_id} failed with status {}\n\
             Hint: run 'siloctl auth' if your token has expired",
            response.status()
        );
    }

    // Buffer so the ZIP magic can be checked before bytes reach the sink;
    // a login redirect would otherwise masquerade as a mod.
    let mut buffer = Vec::new();
    let hash = super::stream_response(cancel, response, &mut buffer).await?;
    if buffer.len() < 4 || !buffer.starts_with(b"PK") {
        bail!("downloaded file for {mod_id} is not a valid ZIP archive");
    }
    sink.write_all(&buffer).context("writing mod bytes")?;
    Ok(hash)
}

/// Fetcher for `portal:` sources. Carries the instance context needed
/// for release selection and authentication.
pub struct PortalFetcher {
    client: reqwest::Client,
    portal_base: String,
    engine_version: Option<String>,
    credentials: Option<Credentials>,
}

impl PortalFetcher {
    pub fn new(engine_version: Option<String>, credentials: Option<Credentials>) -> Result<Self> {
        Ok(Self {
            client: super::http_client(Duration::from_secs(300))?,
            portal_base: DEFAULT_PORTAL_BASE.to_string(),
            engine_version,
            credentials,
        })
    }

    pub fn with_portal_base(mut self, base: impl Into<String>) -> Self {
        self.portal_base = base.into();
        self
    }
}

#[async_trait]
impl super::Fetcher for PortalFetcher {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        sink: &mut (dyn Write + Send),
    ) -> Result<String> {
        let Source::Portal { id, .. } = source else {
            bail!("invalid source kind for portal fetcher: {:?}", source.kind());
        };
        debug_assert_eq!(source.kind(), SourceKind::Portal);
        download_mod(
            &self.client,
            &self.portal_base,
            cancel,
            id,
            self.engine_version.as_deref(),
            self.credentials.as_ref(),
            sink,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(version: &str, factorio_version: &str) -> PortalRelease {
        PortalRelease {
            version: version.to_string(),
            download_url: format!("/download/{version}"),
            sha1: None,
            info_json: ReleaseInfo {
                factorio_version: factorio_version.to_string(),
            },
        }
    }

    #[test]
    fn selects_newest_compatible_release() {
        let releases = vec![
            release("0.9.0", "1.0"),
            release("1.0.0", "1.1"),
            release("1.1.0", "1.1"),
            release("2.0.0", "2.0"),
        ];
        let chosen = select_release(&releases, Some("1.1.87")).unwrap();
        assert_eq!(chosen.version, "1.1.0");
    }

    #[test]
    fn falls_back_to_newest_when_nothing_matches() {
        let releases = vec![release("1.0.0", "1.0"), release("2.0.0", "2.0")];
        let chosen = select_release(&releases, Some("3.0")).unwrap();
        assert_eq!(chosen.version, "2.0.0");
    }

    #[test]
    fn without_engine_context_takes_newest() {
        let releases = vec![release("1.0.0", "1.0"), release("1.2.0", "1.1")];
        let chosen = select_release(&releases, None).unwrap();
        assert_eq!(chosen.version, "1.2.0");
    }

    #[test]
    fn empty_release_list_yields_none() {
        assert!(select_release(&[], Some("1.1")).is_none());
    }
}
