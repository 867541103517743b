//! Mod source specifications and fetchers.
//!
//! A source spec is a `<kind>:<body>` string naming where a mod (or a
//! repository of mods) lives. Parsing yields a tagged [`Source`]; the
//! [`Resolver`] dispatches each kind to a fetcher that streams the
//! artifact bytes while computing their SHA-256.

pub mod cache;
pub mod file_url;
pub mod git;
pub mod github;
pub mod github_pr;
pub mod portal;
mod resolver;

pub use resolver::{Fetcher, Resolver};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// User-agent sent on every outbound HTTP request.
pub const USER_AGENT: &str = "siloctl";

/// Repositories known to contain multiple mods as top-level folders.
/// These require an explicit subpath naming the mod to install.
const KNOWN_MULTI_MOD_REPOS: &[&str] = &[
    "modded-factorio/SeaBlock",
    "Arch666Angel/mods",
    "KiwiHawk/SeaBlock",
];

pub(crate) fn is_multi_mod_repo(owner: &str, repo: &str) -> bool {
    let full = format!("{owner}/{repo}");
    KNOWN_MULTI_MOD_REPOS.iter().any(|r| *r == full)
}

/// A parsed mod source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `portal:<id>@<version-spec>`
    Portal { id: String, version: String },
    /// `gh:<owner>/<repo>[/<subpath>]@<ref>` or the lenient
    /// `github:<owner>/<repo>[/<subpath>][@<ref>]` form. A missing ref
    /// means the head of the default branch.
    GitHub {
        owner: String,
        repo: String,
        subpath: Option<String>,
        reference: Option<String>,
    },
    /// `ghpr:<owner>/<repo>[/<subpath>]#<pr-number>`
    GitHubPr {
        owner: String,
        repo: String,
        subpath: Option<String>,
        number: u64,
    },
    /// `git:<host>/<path>@<ref>`
    Git { repo: String, reference: String },
    /// `file:<path>`
    File { path: PathBuf },
    /// `url:<http(s) URL>`
    Url { url: String },
}

/// Discriminant used for fetcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Portal,
    GitHub,
    GitHubPr,
    Git,
    File,
    Url,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Portal { .. } => SourceKind::Portal,
            Source::GitHub { .. } => SourceKind::GitHub,
            Source::GitHubPr { .. } => SourceKind::GitHubPr,
            Source::Git { .. } => SourceKind::Git,
            Source::File { .. } => SourceKind::File,
            Source::Url { .. } => SourceKind::Url,
        }
    }

    /// Parse a source specification string.
    pub fn parse(spec: &str) -> Result<Source> {
        let (kind, body) = spec
            .split_once(':')
            .context("invalid source specification: missing source kind")?;

        match kind {
            "portal" => {
                let (id, version) = body
                    .split_once('@')
                    .context("invalid source specification: missing version in portal spec")?;
                if id.is_empty() {
                    bail!("invalid source specification: empty portal mod id");
                }
                Ok(Source::Portal {
                    id: id.to_string(),
                    version: version.to_string(),
                })
            }
            "gh" => {
                let (repo_part, reference) = body
                    .split_once('@')
                    .context("invalid source specification: missing ref in gh spec")?;
                let (owner, repo, subpath) = split_repo(repo_part)?;
                Ok(Source::GitHub {
                    owner,
                    repo,
                    subpath,
                    reference: Some(reference.to_string()),
                })
            }
            "github" => {
                let (repo_part, reference) = match body.split_once('@') {
                    Some((r, gitref)) => (r, Some(gitref.to_string())),
                    None => (body, None),
                };
                let (owner, repo, subpath) = split_repo(repo_part)?;
                Ok(Source::GitHub {
                    owner,
                    repo,
                    subpath,
                    reference,
                })
            }
            "ghpr" => {
                let (repo_part, pr) = body
                    .split_once('#')
                    .context("invalid source specification: missing PR number in ghpr spec")?;
                let (owner, repo, subpath) = split_repo(repo_part)?;
                let number = pr
                    .parse::<u64>()
                    .context("invalid source specification: invalid PR number")?;
                Ok(Source::GitHubPr {
                    owner,
                    repo,
                    subpath,
                    number,
                })
            }
            "git" => {
                let (repo, reference) = body
                    .split_once('@')
                    .context("invalid source specification: missing ref in git spec")?;
                if !repo.contains('/') {
                    bail!("invalid source specification: git spec must be <host>/<path>");
                }
                Ok(Source::Git {
                    repo: repo.to_string(),
                    reference: reference.to_string(),
                })
            }
            "file" => {
                if body.is_empty() {
                    bail!("invalid source specification: empty file path");
                }
                Ok(Source::File {
                    path: PathBuf::from(body),
                })
            }
            "url" => {
                reqwest::Url::parse(body)
                    .context("invalid source specification: invalid URL")?;
                Ok(Source::Url {
                    url: body.to_string(),
                })
            }
            other => bail!("invalid source specification: unknown source kind {other:?}"),
        }
    }

    /// Render back to a spec string; `parse` round-trips the result.
    pub fn spec_string(&self) -> String {
        match self {
            Source::Portal { id, version } => format!("portal:{id}@{version}"),
            Source::GitHub {
                owner,
                repo,
                subpath,
                reference,
            } => {
                let path = join_repo(owner, repo, subpath.as_deref());
                match reference {
                    Some(r) => format!("gh:{path}@{r}"),
                    None => format!("github:{path}"),
                }
            }
            Source::GitHubPr {
                owner,
                repo,
                subpath,
                number,
            } => format!("ghpr:{}#{}", join_repo(owner, repo, subpath.as_deref()), number),
            Source::Git { repo, reference } => format!("git:{repo}@{reference}"),
            Source::File { path } => format!("file:{}", path.display()),
            Source::Url { url } => format!("url:{url}"),
        }
    }
}

fn split_repo(input: &str) -> Result<(String, String, Option<String>)> {
    let mut parts = input.splitn(3, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() {
        bail!("invalid source specification: invalid repository format {input:?}");
    }
    let subpath = parts
        .next()
        .map(str::to_string)
        .filter(|s| !s.is_empty());
    Ok((owner.to_string(), repo.to_string(), subpath))
}

fn join_repo(owner: &str, repo: &str, subpath: Option<&str>) -> String {
    match subpath {
        Some(sub) => format!("{owner}/{repo}/{sub}"),
        None => format!("{owner}/{repo}"),
    }
}

/// Stream an HTTP response body into `sink` while hashing it. Returns
/// the hex SHA-256 of the streamed bytes.
pub(crate) async fn stream_response(
    cancel: &CancellationToken,
    response: reqwest::Response,
    sink: &mut (dyn Write + Send),
) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => bail!("download cancelled"),
            chunk = stream.next() => match chunk {
                None => break,
                Some(chunk) => chunk.context("reading response body")?,
            },
        };
        hasher.update(&chunk);
        sink.write_all(&chunk).context("writing fetched bytes")?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a byte slice the way fetchers hash streams.
pub(crate) fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}
