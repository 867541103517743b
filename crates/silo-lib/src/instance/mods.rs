//! Mod management: source-registry building, recursive dependency
//! installation, the mod-list file and uninstall.
//!
//! Installation runs breadth-first from the enabled set. The source
//! registry is built once per run so that a repository holding many
//! mods is downloaded a single time however many dependencies resolve
//! into it; the portal is the fallback for anything the configured
//! sources don't provide.

use super::config::is_builtin_mod;
use super::Instance;
use crate::archive;
use crate::auth;
use crate::sources::cache::DownloadCache;
use crate::sources::file_url::{FileFetcher, UrlFetcher};
use crate::sources::git::GitFetcher;
use crate::sources::github::GitHubFetcher;
use crate::sources::github_pr::GitHubPrFetcher;
use crate::sources::portal::{self, PortalFetcher};
use crate::sources::{Resolver, Source, SourceKind};
use crate::utils::version;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

/// Metadata from a mod's `info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factorio_version: Option<String>,
}

/// The engine's enabled-mod list (`config/mod-list.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModList {
    pub mods: Vec<ModListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModListEntry {
    pub name: String,
    pub enabled: bool,
}

/// Outcome of a recursive install run. Per-mod failures accumulate
/// instead of aborting the remaining queue.
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Mods processed in BFS order (installed or already present).
    pub installed: Vec<String>,
    pub errors: Vec<String>,
}

impl InstallReport {
    /// An aggregate error when any mod failed, for callers that want a
    /// non-zero exit after a partial install.
    pub fn summary_error(&self) -> Option<anyhow::Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(anyhow::anyhow!(
                "installation completed with {} errors",
                self.errors.len()
            ))
        }
    }
}

type SourceRegistry = HashMap<String, BTreeMap<String, Vec<u8>>>;

pub struct ModManager {
    base_dir: PathBuf,
    cache: DownloadCache,
    client: reqwest::Client,
    portal_base: String,
    github_api_base: String,
    github_archive_base: String,
    mod_infos: RwLock<HashMap<String, ModInfo>>,
    source_registry: RwLock<SourceRegistry>,
}

impl ModManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        Ok(Self {
            cache: DownloadCache::new(&base_dir),
            client: crate::sources::http_client(Duration::from_secs(300))?,
            portal_base: portal::DEFAULT_PORTAL_BASE.to_string(),
            github_api_base: crate::sources::github::DEFAULT_API_BASE.to_string(),
            github_archive_base: crate::sources::github::DEFAULT_ARCHIVE_BASE.to_string(),
            mod_infos: RwLock::new(HashMap::new()),
            source_registry: RwLock::new(SourceRegistry::new()),
            base_dir,
        })
    }

    /// Override remote endpoints (used by tests).
    pub fn with_endpoints(
        mut self,
        portal_base: impl Into<String>,
        github_api_base: impl Into<String>,
        github_archive_base: impl Into<String>,
    ) -> Self {
        self.portal_base = portal_base.into();
        self.github_api_base = github_api_base.into();
        self.github_archive_base = github_archive_base.into();
        self
    }

    fn resolver_for(&self, inst: &Instance) -> Result<Resolver> {
        let credentials = auth::load_with_fallback(&self.base_dir);

        let mut resolver = Resolver::new();
        resolver.register(
            SourceKind::Portal,
            Box::new(
                PortalFetcher::new(Some(inst.config.version.clone()), credentials)?
                    .with_portal_base(self.portal_base.clone()),
            ),
        );
        resolver.register(
            SourceKind::GitHub,
            Box::new(
                GitHubFetcher::new(self.cache.clone())?
                    .with_endpoints(self.github_api_base.clone(), self.github_archive_base.clone()),
            ),
        );
        resolver.register(
            SourceKind::GitHubPr,
            Box::new(
                GitHubPrFetcher::new(self.cache.clone())?
                    .with_endpoints(self.github_api_base.clone(), self.github_archive_base.clone()),
            ),
        );
        resolver.register(SourceKind::Git, Box::new(GitFetcher::new(self.cache.clone())?));
        resolver.register(SourceKind::File, Box::new(FileFetcher));
        resolver.register(SourceKind::Url, Box::new(UrlFetcher::new()?));
        Ok(resolver)
    }

    /// Install one mod: direct source specs bypass the registry, bare
    /// names resolve through it.
    pub async fn install_mod(
        &self,
        cancel: &CancellationToken,
        inst: &Instance,
        mod_spec: &str,
    ) -> Result<()> {
        fs::create_dir_all(inst.mods_dir()).context("creating mod directory")?;

        if is_direct_spec(mod_spec) {
            self.install_direct(cancel, inst, mod_spec).await
        } else {
            self.install_from_registry(inst, mod_spec).await
        }
    }

    /// Remove a mod's files and disable its mod-list entry.
    pub fn uninstall_mod(&self, inst: &Instance, mod_name: &str) -> Result<()> {
        if mod_name == "base" {
            bail!("cannot uninstall base mod");
        }

        let files = installed_mod_files(inst, mod_name)?;
        if files.is_empty() {
            bail!("mod {mod_name} not found");
        }
        for path in files {
            fs::remove_file(&path).with_context(|| format!("removing mod file {:?}", path))?;
        }

        update_mod_list(inst, mod_name, false).context("updating mod list")
    }

    /// Installed mods with their parsed metadata.
    pub fn list_mods(&self, inst: &Instance) -> Result<Vec<ModInfo>> {
        let mods_dir = inst.mods_dir();
        let mut mods = Vec::new();

        let entries = match fs::read_dir(&mods_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(mods),
            Err(err) => return Err(err).context("reading mods directory"),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
            .collect();
        paths.sort();

        for path in paths {
            let data = fs::read(&path).with_context(|| format!("reading mod file {:?}", path))?;
            let info = extract_mod_info(&data)
                .with_context(|| format!("reading mod info from {:?}", path.file_name()))?;
            mods.push(info);
        }
        Ok(mods)
    }

    /// Download every configured source once and index the mods each
    /// one provides. Per-source failures are warnings.
    pub async fn build_source_registry(
        &self,
        cancel: &CancellationToken,
        inst: &Instance,
    ) -> Result<()> {
        log::info!("building source registry from configured sources");
        self.source_registry.write().await.clear();

        let resolver = self.resolver_for(inst)?;

        for (source_name, source_spec) in &inst.config.mods.sources {
            log::info!("loading source '{source_name}' ({source_spec})");

            let mut buffer = Vec::new();
            let source = match resolver.fetch_spec(cancel, source_spec, &mut buffer).await {
                Ok((source, _hash)) => source,
                Err(err) => {
                    log::warn!("failed to download source '{source_name}': {err:#}");
                    continue;
                }
            };

            let repo_data = match source_subpath(&source) {
                Some(subpath) => match archive::extract_subdir(&buffer, subpath) {
                    Ok(data) => data,
                    Err(err) => {
                        log::warn!("failed to extract subpath from '{source_name}': {err:#}");
                        continue;
                    }
                },
                None => buffer,
            };

            let mods = match enumerate_repository_mods(&repo_data) {
                Ok(mods) => mods,
                Err(err) => {
                    log::warn!("failed to enumerate mods in '{source_name}': {err:#}");
                    continue;
                }
            };

            log::info!("found {} mods in source '{source_name}'", mods.len());
            let mut registry = self.source_registry.write().await;
            for (mod_name, data) in mods {
                registry
                    .entry(mod_name)
                    .or_default()
                    .insert(source_name.clone(), data);
            }
        }

        let total = self.source_registry.read().await.len();
        log::info!("source registry built with {total} unique mods");
        Ok(())
    }

    /// Install the named mods and their transitive dependencies,
    /// breadth-first, collecting per-mod failures.
    pub async fn install_mods_recursively(
        &self,
        cancel: &CancellationToken,
        inst: &Instance,
        mod_names: &[String],
    ) -> Result<InstallReport> {
        self.build_source_registry(cancel, inst)
            .await
            .context("building source registry")?;
        fs::create_dir_all(inst.mods_dir()).context("creating mod directory")?;

        let mut report = InstallReport::default();
        let mut processed: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for name in mod_names {
            if !processed.contains(name) && !queue.contains(name) {
                queue.push_back(name.clone());
            }
        }

        while let Some(mod_name) = queue.pop_front() {
            if processed.contains(&mod_name) {
                continue;
            }

            if is_mod_installed(inst, &mod_name) {
                log::info!("mod '{mod_name}' already installed, skipping");
                processed.insert(mod_name.clone());
                report.installed.push(mod_name);
                continue;
            }

            if is_builtin_mod(&mod_name) {
                log::debug!("mod '{mod_name}' is built-in, skipping");
                processed.insert(mod_name.clone());
                report.installed.push(mod_name);
                continue;
            }

            log::info!("installing mod '{mod_name}'");
            if let Err(registry_err) = self.install_from_registry(inst, &mod_name).await {
                log::warn!("registry install failed for '{mod_name}': {registry_err:#}");
                if let Err(portal_err) = self.install_from_portal(cancel, inst, &mod_name).await {
                    log::warn!("portal fallback failed for '{mod_name}': {portal_err:#}");
                    report.errors.push(format!(
                        "failed to install mod '{mod_name}': {registry_err:#} (portal fallback: {portal_err:#})"
                    ));
                    processed.insert(mod_name);
                    continue;
                }
            }

            processed.insert(mod_name.clone());
            report.installed.push(mod_name.clone());

            let dependencies = match self.mod_dependencies(inst, &mod_name).await {
                Ok(deps) => deps,
                Err(err) => {
                    log::warn!("could not read dependencies of '{mod_name}': {err:#}");
                    continue;
                }
            };
            for dep in dependencies {
                if dep == mod_name {
                    log::debug!("skipping self-dependency of '{mod_name}'");
                    continue;
                }
                if !processed.contains(&dep) && !queue.contains(&dep) {
                    log::info!("queueing dependency '{dep}'");
                    queue.push_back(dep);
                }
            }
        }

        if !report.errors.is_empty() {
            log::warn!("{} mods failed to install", report.errors.len());
        }
        Ok(report)
    }

    /// Hard dependencies of an installed mod, grammar-filtered.
    pub async fn mod_dependencies(&self, inst: &Instance, mod_name: &str) -> Result<Vec<String>> {
        let info = {
            let infos = self.mod_infos.read().await;
            infos.get(mod_name).cloned()
        };
        let info = match info {
            Some(info) => info,
            None => {
                let files = installed_mod_files(inst, mod_name)?;
                let path = files
                    .first()
                    .with_context(|| format!("mod file not found: {mod_name}"))?;
                let data = fs::read(path).context("reading mod file")?;
                extract_mod_info(&data).context("extracting mod info")?
            }
        };

        Ok(info
            .dependencies
            .iter()
            .filter_map(|line| parse_dependency_line(line))
            .collect())
    }

    async fn install_from_registry(&self, inst: &Instance, mod_name: &str) -> Result<()> {
        let candidates: Vec<(String, Vec<u8>)> = {
            let registry = self.source_registry.read().await;
            match registry.get(mod_name) {
                Some(sources) => sources
                    .iter()
                    .map(|(name, data)| (name.clone(), data.clone()))
                    .collect(),
                None => bail!("mod '{mod_name}' not found in registry"),
            }
        };

        for (source_name, data) in candidates {
            log::debug!("trying mod '{mod_name}' from source '{source_name}'");

            let info = match extract_mod_info(&data) {
                Ok(info) => info,
                Err(err) => {
                    log::warn!("bad mod metadata in source '{source_name}': {err:#}");
                    continue;
                }
            };

            if let Some(declared) = declared_engine_version(&info) {
                if !version::is_compatible(&inst.config.version, declared) {
                    log::warn!(
                        "mod '{mod_name}' from '{source_name}' targets engine {declared}, \
                         instance uses {}; trying next source",
                        inst.config.version
                    );
                    continue;
                }
            }

            self.mod_infos
                .write()
                .await
                .insert(info.name.clone(), info.clone());
            write_mod_zip(inst, &info, &data)?;
            update_mod_list(inst, &info.name, true).context("updating mod list")?;
            log::info!(
                "installed '{}' {} from source '{source_name}'",
                info.name,
                info.version
            );
            return Ok(());
        }

        bail!("mod '{mod_name}' not found in any compatible source")
    }

    async fn install_from_portal(
        &self,
        cancel: &CancellationToken,
        inst: &Instance,
        mod_name: &str,
    ) -> Result<()> {
        let credentials = auth::load_with_fallback(&self.base_dir);

        let mut buffer = Vec::new();
        portal::download_mod(
            &self.client,
            &self.portal_base,
            cancel,
            mod_name,
            Some(&inst.config.version),
            credentials.as_ref(),
            &mut buffer,
        )
        .await
        .context("portal download failed")?;

        let info = extract_mod_info(&buffer).context("extracting mod info")?;
        self.check_compatibility(inst, &info)?;

        self.mod_infos
            .write()
            .await
            .insert(info.name.clone(), info.clone());
        write_mod_zip(inst, &info, &buffer)?;
        update_mod_list(inst, &info.name, true).context("updating mod list")?;
        log::info!("installed '{}' {} from portal", info.name, info.version);
        Ok(())
    }

    async fn install_direct(
        &self,
        cancel: &CancellationToken,
        inst: &Instance,
        mod_spec: &str,
    ) -> Result<()> {
        let resolver = self.resolver_for(inst)?;

        let mut buffer = Vec::new();
        let (source, _hash) = resolver
            .fetch_spec(cancel, mod_spec, &mut buffer)
            .await
            .context("downloading mod")?;

        let data = match source_subpath(&source) {
            Some(subpath) => archive::extract_subdir(&buffer, subpath)
                .context("extracting mod folder from repository")?,
            None => buffer,
        };

        let info = extract_mod_info(&data).context("extracting mod info")?;
        self.check_compatibility(inst, &info)?;

        self.mod_infos
            .write()
            .await
            .insert(info.name.clone(), info.clone());
        write_mod_zip(inst, &info, &data)?;
        update_mod_list(inst, &info.name, true).context("updating mod list")?;
        log::info!("installed '{}' {} from {mod_spec}", info.name, info.version);

        // Direct installs pull their dependency closure from the
        // portal.
        let mut queue: VecDeque<String> = info
            .dependencies
            .iter()
            .filter_map(|line| parse_dependency_line(line))
            .collect();
        let mut processed: HashSet<String> = HashSet::new();
        processed.insert(info.name.clone());

        while let Some(dep) = queue.pop_front() {
            if processed.contains(&dep) {
                continue;
            }
            processed.insert(dep.clone());

            if is_builtin_mod(&dep) || is_mod_installed(inst, &dep) {
                continue;
            }

            self.install_from_portal(cancel, inst, &dep)
                .await
                .with_context(|| format!("installing dependency {dep}"))?;

            let transitive = self.mod_dependencies(inst, &dep).await.unwrap_or_default();
            for next in transitive {
                if !processed.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        Ok(())
    }

    fn check_compatibility(&self, inst: &Instance, info: &ModInfo) -> Result<()> {
        if let Some(declared) = declared_engine_version(info) {
            if !version::is_compatible(&inst.config.version, declared) {
                bail!(
                    "mod requires Factorio {declared} but instance uses {}",
                    inst.config.version
                );
            }
        }
        Ok(())
    }
}

/// The engine version a mod declares, treating an empty string like a
/// missing field.
fn declared_engine_version(info: &ModInfo) -> Option<&str> {
    info.factorio_version.as_deref().filter(|v| !v.is_empty())
}

/// Specs that name a concrete source rather than a mod to resolve.
fn is_direct_spec(spec: &str) -> bool {
    const DIRECT_PREFIXES: &[&str] =
        &["portal:", "gh:", "github:", "ghpr:", "git:", "file:", "url:"];
    DIRECT_PREFIXES.iter().any(|p| spec.starts_with(p))
}

fn source_subpath(source: &Source) -> Option<&str> {
    match source {
        Source::GitHub { subpath, .. } | Source::GitHubPr { subpath, .. } => subpath.as_deref(),
        _ => None,
    }
}

/// Parse one dependency line into the mod it requires, or `None` when
/// the line does not demand an install. Rules are ordered:
/// `!` marks an incompatibility, `(?)`/`?` an optional dependency,
/// `~` load-order-only (still installed); a ` <op> <version>` suffix
/// is stripped; `base` is always present.
pub fn parse_dependency_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') {
        return None;
    }
    if line.starts_with("(?)") || line.starts_with('?') {
        return None;
    }

    let rest = line.strip_prefix('~').unwrap_or(line).trim();

    let mut name = rest;
    for op in [" >= ", " <= ", " = ", " > ", " < "] {
        if let Some((prefix, _)) = rest.split_once(op) {
            name = prefix;
            break;
        }
    }

    let name = name.trim();
    if name.is_empty() || name == "base" {
        return None;
    }
    Some(name.to_string())
}

/// Whether a `<name>_<version>.zip` for this mod exists in the
/// instance's mods directory.
pub fn is_mod_installed(inst: &Instance, mod_name: &str) -> bool {
    installed_mod_files(inst, mod_name)
        .map(|files| !files.is_empty())
        .unwrap_or(false)
}

fn installed_mod_files(inst: &Instance, mod_name: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{mod_name}_");
    let mut matches = Vec::new();

    let entries = match fs::read_dir(inst.mods_dir()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(matches),
        Err(err) => return Err(err).context("reading mods directory"),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with(&prefix) && file_name.ends_with(".zip") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Read the first `info.json` found inside a mod zip.
pub fn extract_mod_info(data: &[u8]) -> Result<ModInfo> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("reading mod archive")?;
    for i in 0..archive.len() {
        let file = archive.by_index(i).context("reading mod archive entry")?;
        let name = file.name().to_string();
        let base_name = name.rsplit('/').next().unwrap_or(&name);
        if base_name == "info.json" {
            let info: ModInfo =
                serde_json::from_reader(file).context("parsing info.json")?;
            return Ok(info);
        }
    }
    bail!("info.json not found in mod archive")
}

/// Map every mod contained in a repository archive to its rebuilt
/// single-mod zip.
pub fn enumerate_repository_mods(repo_data: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let mut folders: HashMap<String, String> = HashMap::new();
    {
        let mut archive =
            ZipArchive::new(Cursor::new(repo_data)).context("reading repository archive")?;
        for i in 0..archive.len() {
            let file = archive.by_index(i).context("reading repository entry")?;
            let name = file.name().to_string();
            let base_name = name.rsplit('/').next().unwrap_or(&name);
            if base_name != "info.json" {
                continue;
            }
            let Some((folder, _)) = name.rsplit_once('/') else {
                continue;
            };
            let folder = folder.to_string();
            let Ok(info) = serde_json::from_reader::<_, ModInfo>(file) else {
                continue;
            };
            log::debug!("found mod '{}' in folder '{folder}'", info.name);
            folders.insert(info.name, folder);
        }
    }

    let mut mods = HashMap::new();
    for (mod_name, folder) in folders {
        match archive::extract_subdir(repo_data, &folder) {
            Ok(data) => {
                mods.insert(mod_name, data);
            }
            Err(err) => log::warn!("failed to extract mod '{mod_name}': {err:#}"),
        }
    }
    Ok(mods)
}

fn write_mod_zip(inst: &Instance, info: &ModInfo, data: &[u8]) -> Result<()> {
    let mods_dir = inst.mods_dir();
    fs::create_dir_all(&mods_dir).context("creating mod directory")?;
    let path = mods_dir.join(format!("{}_{}.zip", info.name, info.version));
    fs::write(&path, data).with_context(|| format!("writing mod file {:?}", path))?;
    Ok(())
}

/// Read-modify-write of the enabled-mod list. Enabling an absent mod
/// appends it; entries keep their order.
pub fn update_mod_list(inst: &Instance, mod_name: &str, enabled: bool) -> Result<()> {
    let config_dir = inst.config_dir();
    fs::create_dir_all(&config_dir).context("creating config directory")?;
    let list_path = config_dir.join("mod-list.json");

    let mut list: ModList = match fs::read_to_string(&list_path) {
        Ok(data) => serde_json::from_str(&data).context("parsing mod list")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ModList::default(),
        Err(err) => return Err(err).context("reading mod list"),
    };

    match list.mods.iter_mut().find(|m| m.name == mod_name) {
        Some(entry) => entry.enabled = enabled,
        None if enabled => list.mods.push(ModListEntry {
            name: mod_name.to_string(),
            enabled: true,
        }),
        None => {}
    }

    let data = serde_json::to_string_pretty(&list).context("encoding mod list")?;
    fs::write(&list_path, data).context("writing mod list")?;
    Ok(())
}
