//! Engine runtime acquisition: latest-release lookup, credentialed
//! download and extraction into a runtime slot.

use crate::archive;
use crate::auth;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DOWNLOAD_BASE: &str = "https://www.factorio.com";
pub const DEFAULT_RELEASES_URL: &str = "https://factorio.com/api/latest-releases";

/// Engine build kinds the vendor publishes.
pub const BUILD_KINDS: &[&str] = &["alpha", "headless", "expansion", "demo"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseSet {
    #[serde(default)]
    pub alpha: String,
    #[serde(default)]
    pub demo: String,
    #[serde(default)]
    pub expansion: String,
    #[serde(default)]
    pub headless: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestReleases {
    #[serde(default)]
    pub stable: ReleaseSet,
    #[serde(default)]
    pub experimental: ReleaseSet,
}

impl LatestReleases {
    /// Version for a build kind, preferring the stable channel unless
    /// experimental releases are allowed.
    pub fn version_for(&self, build: &str, allow_experimental: bool) -> Result<String> {
        let set = if allow_experimental {
            &self.experimental
        } else {
            &self.stable
        };
        let version = match build {
            "alpha" => &set.alpha,
            "headless" => &set.headless,
            "expansion" => &set.expansion,
            "demo" => &set.demo,
            other => bail!("unsupported build kind: {other}"),
        };
        if version.is_empty() {
            let channel = if allow_experimental { "experimental" } else { "stable" };
            bail!("no {channel} {build} version found in releases");
        }
        Ok(version.clone())
    }
}

pub struct EngineDownloader {
    base_dir: PathBuf,
    client: reqwest::Client,
    download_base: String,
    releases_url: String,
}

impl EngineDownloader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            base_dir: base_dir.into(),
            // Engine archives run to hundreds of MB.
            client: crate::sources::http_client(Duration::from_secs(30 * 60))?,
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            releases_url: DEFAULT_RELEASES_URL.to_string(),
        })
    }

    pub fn with_endpoints(
        mut self,
        download_base: impl Into<String>,
        releases_url: impl Into<String>,
    ) -> Self {
        self.download_base = download_base.into();
        self.releases_url = releases_url.into();
        self
    }

    /// Query the vendor's latest-release listing.
    pub async fn latest_version(
        &self,
        cancel: &CancellationToken,
        build: &str,
        allow_experimental: bool,
    ) -> Result<String> {
        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("release query cancelled"),
            response = self.client.get(&self.releases_url).send() => {
                response.context("fetching latest releases")?
            }
        };
        if !response.status().is_success() {
            bail!("failed to fetch latest releases: status {}", response.status());
        }
        let releases: LatestReleases =
            response.json().await.context("parsing releases JSON")?;
        let version = releases.version_for(build, allow_experimental)?;
        log::info!("latest {build} version: {version}");
        Ok(version)
    }

    /// Download and extract an engine archive into a runtime slot,
    /// returning the slot directory.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        version: &str,
        build: &str,
        slot: Option<&str>,
    ) -> Result<PathBuf> {
        if !BUILD_KINDS.contains(&build) {
            bail!("invalid build kind: {build}");
        }

        let creds = auth::load_with_fallback(&self.base_dir).with_context(|| {
            "Factorio credentials not found\n\
             Hint: run 'siloctl auth' to sign in to your Factorio account"
        })?;

        let distro = distribution();
        let slot_name = match slot {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => slot_name(version, build),
        };

        let mut url = reqwest::Url::parse(&format!(
            "{}/get-download/{version}/{build}/{distro}",
            self.download_base
        ))
        .context("building download URL")?;
        url.query_pairs_mut()
            .append_pair("username", &creds.factorio_username)
            .append_pair("token", &creds.factorio_token);

        log::info!("downloading Factorio {version} ({build}) for {distro}");

        let response = tokio::select! {
            _ = cancel.cancelled() => bail!("engine download cancelled"),
            response = self.client.get(url).send() => {
                response.context("downloading engine archive")?
            }
        };
        if !response.status().is_success() {
            bail!(
                "engine download failed with status {}\n\
                 Hint: run 'siloctl auth' if your token has expired",
                response.status()
            );
        }

        // Spool to disk first; the tar paths then stream from the file
        // through the decompressor without holding the archive in
        // memory.
        let runtime_dir = self.base_dir.join("runtimes");
        fs::create_dir_all(&runtime_dir).context("creating runtimes directory")?;
        let mut spool = tempfile::NamedTempFile::new_in(&runtime_dir)
            .context("creating download spool file")?;
        {
            use futures::StreamExt;
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => bail!("engine download cancelled"),
                    chunk = stream.next() => match chunk {
                        None => break,
                        Some(chunk) => chunk.context("reading engine archive")?,
                    },
                };
                spool.write_all(&chunk).context("spooling engine archive")?;
            }
            spool.flush().context("flushing spool file")?;
        }

        let slot_dir = runtime_dir.join(&slot_name);
        fs::create_dir_all(&slot_dir).context("creating runtime slot")?;

        extract_engine_archive(spool.path(), &slot_dir, distro)
            .context("extracting engine archive")?;

        let executable = Self::executable_path(&slot_dir);
        if !executable.exists() {
            bail!(
                "downloaded Factorio {version} has no executable at {:?}",
                executable
            );
        }

        log::info!("Factorio {version} installed to {:?}", slot_dir);
        Ok(slot_dir)
    }

    /// Platform path of the engine executable inside a runtime slot.
    pub fn executable_path(runtime_path: &Path) -> PathBuf {
        if cfg!(target_os = "windows") {
            runtime_path.join("bin").join("x64").join("factorio.exe")
        } else if cfg!(target_os = "macos") {
            runtime_path
                .join("Factorio.app")
                .join("Contents")
                .join("MacOS")
                .join("factorio")
        } else {
            runtime_path.join("bin").join("x64").join("factorio")
        }
    }
}

/// Runtime slot name: the bare version for the default build, version
/// plus build kind otherwise.
pub fn slot_name(version: &str, build: &str) -> String {
    if build == "alpha" {
        version.to_string()
    } else {
        format!("{version}-{build}")
    }
}

/// Vendor distribution tag for the host platform.
pub fn distribution() -> &'static str {
    if cfg!(target_os = "windows") {
        "win64-manual"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux64"
    }
}

fn extract_engine_archive(archive_path: &Path, dest: &Path, distro: &str) -> Result<()> {
    if distro.contains("win64") {
        let data = fs::read(archive_path).context("reading engine archive")?;
        archive::extract_zip(&data, dest)
    } else if distro.contains("osx") {
        let data = fs::read(archive_path).context("reading engine archive")?;
        archive::extract_dmg(&data, dest)
    } else {
        let mut file = fs::File::open(archive_path).context("opening engine archive")?;
        archive::extract_linux_archive(&mut file, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn releases() -> LatestReleases {
        LatestReleases {
            stable: ReleaseSet {
                alpha: "1.1.110".to_string(),
                demo: "1.1.110".to_string(),
                expansion: "2.0.15".to_string(),
                headless: "1.1.110".to_string(),
            },
            experimental: ReleaseSet {
                alpha: "2.0.20".to_string(),
                demo: String::new(),
                expansion: "2.0.20".to_string(),
                headless: "2.0.20".to_string(),
            },
        }
    }

    #[test]
    fn stable_channel_is_the_default() {
        let releases = releases();
        assert_eq!(releases.version_for("headless", false).unwrap(), "1.1.110");
        assert_eq!(releases.version_for("alpha", false).unwrap(), "1.1.110");
    }

    #[test]
    fn experimental_channel_is_opt_in() {
        let releases = releases();
        assert_eq!(releases.version_for("headless", true).unwrap(), "2.0.20");
    }

    #[test]
    fn missing_version_and_bad_build_error() {
        let releases = releases();
        assert!(releases.version_for("demo", true).is_err());
        assert!(releases.version_for("beta", false).is_err());
    }

    #[test]
    fn slot_names_encode_build_kind() {
        assert_eq!(slot_name("1.1.87", "alpha"), "1.1.87");
        assert_eq!(slot_name("1.1.87", "headless"), "1.1.87-headless");
    }

    #[test]
    fn executable_path_is_platform_shaped() {
        let path = EngineDownloader::executable_path(Path::new("/rt/1.1"));
        let rendered = path.display().to_string();
        if cfg!(target_os = "macos") {
            assert!(rendered.contains("Factorio.app"));
        } else {
            assert!(rendered.contains("x64"));
        }
    }

    #[tokio::test]
    async fn download_without_credentials_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = EngineDownloader::new(tmp.path()).unwrap();
        let cancel = CancellationToken::new();
        let err = downloader
            .download(&cancel, "1.1.110", "headless", None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("credentials not found"));
    }
}
