//! Instance lifecycle: overlay composition over a runtime slot,
//! generated configuration files, removal, backup and restore.

use super::config::InstanceConfig;
use super::mods::{ModList, ModListEntry};
use super::Instance;
use crate::utils::fs::copy_dir_recursive;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Entries mirrored from the runtime slot into each instance.
const OVERLAY_DIRS: &[&str] = &["bin", "data", "graphics", "locale", "core", "base"];

/// Directories private to each instance.
const INSTANCE_DIRS: &[&str] = &["saves", "mods", "config", "scripts"];

const CONFIG_PATH_CFG: &str = "config-path=__PATH__executable__/../../config\n\
use-system-read-write-data-directories=false\n";

pub struct InstanceManager {
    base_dir: PathBuf,
    runtime_dir: PathBuf,
    engine_path: Option<PathBuf>,
    use_symlinks: bool,
}

impl InstanceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            runtime_dir: base_dir.join("runtimes"),
            base_dir,
            engine_path: None,
            use_symlinks: false,
        }
    }

    /// Use an existing engine installation as the runtime source,
    /// importing it into a runtime slot on first use.
    pub fn with_engine_path(base_dir: impl Into<PathBuf>, engine_path: impl Into<PathBuf>) -> Self {
        let mut manager = Self::new(base_dir);
        manager.engine_path = Some(engine_path.into());
        manager
    }

    /// Overlay by symlink instead of copying. Cheap and shared, but
    /// writes through an overlay entry mutate the runtime slot.
    pub fn set_use_symlinks(&mut self, use_symlinks: bool) {
        self.use_symlinks = use_symlinks;
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Platform default base directory.
    pub fn default_base_dir() -> Result<PathBuf> {
        let config = dirs::config_dir().context("platform config directory unavailable")?;
        Ok(config.join("siloctl"))
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join("instances").join(name)
    }

    pub fn instance_exists(&self, name: &str) -> bool {
        self.instance_dir(name).exists()
    }

    /// Load an existing instance by name.
    pub fn load_instance(&self, name: &str) -> Result<Instance> {
        let dir = self.instance_dir(name);
        if !dir.exists() {
            bail!(
                "instance '{name}' does not exist\n\
                 Hint: use 'siloctl up {name}' to create it first"
            );
        }
        let config = InstanceConfig::load(&dir.join("config").join("instance.json"))
            .context("loading instance configuration")?;
        Ok(Instance::new(config, dir))
    }

    /// Create (or refresh) an instance directory from a configuration.
    pub fn create(&self, config: &InstanceConfig) -> Result<Instance> {
        config.validate().context("invalid configuration")?;

        let inst_dir = self.instance_dir(&config.name);
        fs::create_dir_all(&inst_dir)
            .with_context(|| format!("creating instance directory {:?}", inst_dir))?;

        let runtime_path = self
            .locate_runtime(config.runtime_name())
            .with_context(|| format!("locating runtime {}", config.runtime_name()))?;

        for dir in INSTANCE_DIRS {
            fs::create_dir_all(inst_dir.join(dir))
                .with_context(|| format!("creating directory {dir}"))?;
        }

        self.create_overlay(&inst_dir, &runtime_path)
            .context("creating overlay")?;

        config
            .save(&inst_dir.join("config").join("instance.json"))
            .context("saving configuration")?;

        self.write_mod_list(&inst_dir, config)?;
        if config.server.is_some() {
            self.write_server_settings(&inst_dir, config)?;
        }

        fs::write(inst_dir.join("config-path.cfg"), CONFIG_PATH_CFG)
            .context("creating config-path.cfg")?;

        let player_data = serde_json::json!({
            "service-username": "",
            "service-token": "",
        });
        write_pretty_json(&inst_dir.join("player-data.json"), &player_data)
            .context("creating player-data.json")?;

        log::info!("instance '{}' materialized at {:?}", config.name, inst_dir);
        Ok(Instance::new(config.clone(), inst_dir))
    }

    /// Write service credentials into the instance's player data so
    /// the engine can reach account-gated services.
    pub fn update_player_data(&self, inst: &Instance, username: &str, token: &str) -> Result<()> {
        let player_data = serde_json::json!({
            "service-username": username,
            "service-token": token,
        });
        write_pretty_json(&inst.dir.join("player-data.json"), &player_data)
    }

    /// Remove an instance, optionally archiving it first.
    pub fn remove(&self, name: &str, backup: bool) -> Result<()> {
        let inst_dir = self.instance_dir(name);
        if !inst_dir.exists() {
            bail!("instance {name} does not exist");
        }

        if backup {
            let path = self.create_backup(name).context("creating backup")?;
            log::info!("instance '{name}' backed up to {:?}", path);
        }

        fs::remove_dir_all(&inst_dir)
            .with_context(|| format!("removing instance directory {:?}", inst_dir))?;
        Ok(())
    }

    fn write_mod_list(&self, inst_dir: &Path, config: &InstanceConfig) -> Result<()> {
        let mut list = ModList {
            mods: vec![ModListEntry {
                name: "base".to_string(),
                enabled: true,
            }],
        };
        for name in &config.mods.enabled {
            if name != "base" {
                list.mods.push(ModListEntry {
                    name: name.clone(),
                    enabled: true,
                });
            }
        }
        write_pretty_json(&inst_dir.join("config").join("mod-list.json"), &list)
            .context("saving mod list")
    }

    fn write_server_settings(&self, inst_dir: &Path, config: &InstanceConfig) -> Result<()> {
        let server = config.server.as_ref().expect("server config present");

        let mut settings = serde_json::json!({
            "name": server.name,
            "description": server.name,
            "max_players": server.max_players,
            "visibility": {
                "public": server.public,
                "lan": true,
            },
            "username": "",
            "password": server.password,
            "require_user_verification": !server.password.is_empty(),
            "admins": server.admins,
            "auto_save": {
                "enabled": server.auto_save,
                "interval": server.auto_save_interval,
                "slots": 5,
            },
        });
        let map = settings.as_object_mut().expect("settings object");
        for (key, value) in &server.settings {
            map.insert(key.clone(), value.clone());
        }

        write_pretty_json(
            &inst_dir.join("config").join("server-settings.json"),
            &settings,
        )
        .context("saving server settings")
    }

    /// Find the runtime slot for `runtime_name`, importing the
    /// operator-supplied engine path into a slot when one is set.
    fn locate_runtime(&self, runtime_name: &str) -> Result<PathBuf> {
        if let Some(engine_path) = &self.engine_path {
            if !engine_path.exists() {
                bail!("specified engine path does not exist: {:?}", engine_path);
            }
            if !is_valid_engine_install(engine_path) {
                bail!(
                    "specified engine path is not a valid installation: {:?}",
                    engine_path
                );
            }
            return self.import_runtime(engine_path, runtime_name);
        }

        let runtime_path = self.runtime_dir.join(runtime_name);
        if runtime_path.exists() {
            if is_valid_engine_install(&runtime_path) {
                return Ok(runtime_path);
            }
            bail!("runtime {runtime_name} exists but is not a valid engine installation");
        }

        bail!(
            "runtime {runtime_name} not found under {:?}\n\
             Hint: run 'siloctl download headless {runtime_name}' or pass --factorio-path \
             to import a system installation",
            self.runtime_dir
        )
    }

    fn import_runtime(&self, system_path: &Path, runtime_name: &str) -> Result<PathBuf> {
        let runtime_path = self.runtime_dir.join(runtime_name);
        if runtime_path.exists() && is_valid_engine_install(&runtime_path) {
            return Ok(runtime_path);
        }

        log::info!("importing engine installation from {:?}", system_path);
        fs::create_dir_all(&self.runtime_dir)
            .with_context(|| format!("creating runtimes directory {:?}", self.runtime_dir))?;
        copy_dir_recursive(system_path, &runtime_path)
            .context("copying engine installation into runtimes")?;
        Ok(runtime_path)
    }

    fn create_overlay(&self, inst_dir: &Path, runtime_path: &Path) -> Result<()> {
        for dir in OVERLAY_DIRS {
            let source = runtime_path.join(dir);
            if !source.exists() {
                continue;
            }

            let target = inst_dir.join(dir);
            if target.exists() || target.is_symlink() {
                remove_any(&target).with_context(|| format!("removing existing {dir}"))?;
            }

            if self.use_symlinks {
                symlink_dir(&source, &target)
                    .with_context(|| format!("creating symlink for {dir}"))?;
            } else {
                copy_dir_recursive(&source, &target)
                    .with_context(|| format!("copying {dir}"))?;
            }
        }
        Ok(())
    }

    // Backups

    fn backup_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    /// Archive an instance directory to
    /// `backups/<name>-<YYYYMMDD-HHMMSS>.tar.gz`.
    pub fn create_backup(&self, name: &str) -> Result<PathBuf> {
        let inst_dir = self.instance_dir(name);
        if !inst_dir.exists() {
            bail!("instance {name} does not exist");
        }

        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("creating backup directory {:?}", backup_dir))?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let backup_path = backup_dir.join(format!("{name}-{timestamp}.tar.gz"));

        let file = fs::File::create(&backup_path)
            .with_context(|| format!("creating backup file {:?}", backup_path))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        append_dir_contents(&mut builder, &inst_dir, Path::new(""))
            .context("archiving instance directory")?;

        builder
            .into_inner()
            .context("finishing backup archive")?
            .finish()
            .context("flushing backup archive")?;

        Ok(backup_path)
    }

    /// Backup file names for `name`, newest first.
    pub fn list_backups(&self, name: &str) -> Result<Vec<String>> {
        let backup_dir = self.backup_dir();
        let prefix = format!("{name}-");

        let mut backups = Vec::new();
        let entries = match fs::read_dir(&backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(err) => return Err(err).context("listing backups"),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(&prefix) && file_name.ends_with(".tar.gz") {
                backups.push(file_name);
            }
        }

        // Timestamped names sort chronologically.
        backups.sort_by(|a, b| b.cmp(a));
        Ok(backups)
    }

    /// Restore an instance from a backup file name. The instance is
    /// rebuilt in a staging directory and swapped into place.
    pub fn restore_backup(&self, backup_name: &str) -> Result<()> {
        let backup_path = self.backup_dir().join(backup_name);
        let name = instance_name_from_backup(backup_name)?;

        let file = fs::File::open(&backup_path)
            .with_context(|| format!("opening backup file {:?}", backup_path))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);

        let staging = tempfile::Builder::new()
            .prefix("silo-restore-")
            .tempdir_in(&self.base_dir)
            .context("creating staging directory")?;

        for entry in archive.entries().context("reading backup archive")? {
            let mut entry = entry.context("reading backup entry")?;
            let path = entry.path().context("reading backup entry path")?.into_owned();
            if path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
            {
                bail!("invalid file path in backup: {:?}", path);
            }
            entry
                .unpack(staging.path().join(&path))
                .with_context(|| format!("extracting {:?}", path))?;
        }

        let inst_dir = self.instance_dir(&name);
        if inst_dir.exists() {
            fs::remove_dir_all(&inst_dir).context("removing existing instance directory")?;
        }
        if let Some(parent) = inst_dir.parent() {
            fs::create_dir_all(parent).context("creating instances directory")?;
        }
        fs::rename(staging.into_path(), &inst_dir)
            .context("moving restored files into place")?;

        log::info!("instance '{name}' restored from {backup_name}");
        Ok(())
    }
}

/// A valid engine installation has `bin/` and `data/` plus a `base`
/// module at the root or under `data/`.
pub fn is_valid_engine_install(path: &Path) -> bool {
    if !path.join("bin").exists() || !path.join("data").exists() {
        return false;
    }
    path.join("base").exists() || path.join("data").join("base").exists()
}

/// Extract the instance name from `<name>-<YYYYMMDD>-<HHMMSS>.tar.gz`.
fn instance_name_from_backup(backup_name: &str) -> Result<String> {
    let base = backup_name
        .strip_suffix(".tar.gz")
        .context("invalid backup name format")?;

    let mut parts = base.rsplitn(3, '-');
    let time = parts.next().unwrap_or_default();
    let date = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();

    let timestamp_ok = time.len() == 6
        && date.len() == 8
        && time.chars().all(|c| c.is_ascii_digit())
        && date.chars().all(|c| c.is_ascii_digit());
    if name.is_empty() || !timestamp_ok {
        bail!("invalid backup name format");
    }
    Ok(name.to_string())
}

fn append_dir_contents<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))? {
        let entry = entry?;
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        // Forward-slash entry names regardless of platform.
        let rel_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder
                .append_dir(&rel_name, &path)
                .with_context(|| format!("archiving directory {:?}", rel))?;
            append_dir_contents(builder, &path, &rel)?;
        } else {
            builder
                .append_path_with_name(&path, &rel_name)
                .with_context(|| format!("archiving file {:?}", rel))?;
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() && !path.is_symlink() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, target)
}

fn write_pretty_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value).context("encoding JSON")?;
    fs::write(path, data).with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::config::{ModsConfig, ServerConfig};
    use tempfile::tempdir;

    fn seed_runtime(base_dir: &Path, name: &str) {
        let runtime = base_dir.join("runtimes").join(name);
        for dir in ["bin/x64", "data/base", "base"] {
            fs::create_dir_all(runtime.join(dir)).unwrap();
        }
        fs::write(runtime.join("bin/x64/factorio"), b"#!/bin/sh\n").unwrap();
        fs::write(runtime.join("data/base/info.json"), b"{}").unwrap();
    }

    fn test_config(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            version: "1.1".to_string(),
            runtime: None,
            port: None,
            headless: true,
            save_file: None,
            mods: ModsConfig::default(),
            server: None,
        }
    }

    #[test]
    fn create_materializes_instance_layout() {
        let tmp = tempdir().unwrap();
        seed_runtime(tmp.path(), "1.1");

        let manager = InstanceManager::new(tmp.path());
        let inst = manager.create(&test_config("srv")).unwrap();

        for dir in ["saves", "mods", "config", "scripts", "bin", "data", "base"] {
            assert!(inst.dir.join(dir).exists(), "missing {dir}");
        }
        assert!(inst.dir.join("config/instance.json").exists());
        assert!(inst.dir.join("config-path.cfg").exists());
        assert!(inst.dir.join("player-data.json").exists());

        let list: ModList =
            serde_json::from_str(&fs::read_to_string(inst.dir.join("config/mod-list.json")).unwrap())
                .unwrap();
        assert_eq!(list.mods.len(), 1);
        assert_eq!(list.mods[0].name, "base");
        assert!(list.mods[0].enabled);
    }

    #[test]
    fn create_without_runtime_errors() {
        let tmp = tempdir().unwrap();
        let manager = InstanceManager::new(tmp.path());
        let err = manager.create(&test_config("srv")).unwrap_err();
        assert!(format!("{err:#}").contains("runtime 1.1 not found"));
    }

    #[test]
    fn mod_list_includes_enabled_mods() {
        let tmp = tempdir().unwrap();
        seed_runtime(tmp.path(), "1.1");

        let mut config = test_config("srv");
        config.mods.enabled = vec!["base".to_string(), "space-age".to_string()];
        let manager = InstanceManager::new(tmp.path());
        let inst = manager.create(&config).unwrap();

        let list: ModList =
            serde_json::from_str(&fs::read_to_string(inst.dir.join("config/mod-list.json")).unwrap())
                .unwrap();
        let names: Vec<&str> = list.mods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["base", "space-age"]);
    }

    #[test]
    fn server_settings_derive_fields() {
        let tmp = tempdir().unwrap();
        seed_runtime(tmp.path(), "1.1");

        let mut config = test_config("srv");
        let mut extra = serde_json::Map::new();
        extra.insert("afk_autokick_interval".to_string(), serde_json::json!(10));
        config.server = Some(ServerConfig {
            name: "My Server".to_string(),
            max_players: 16,
            public: true,
            password: "hunter2".to_string(),
            admins: vec!["admin1".to_string()],
            auto_save: true,
            auto_save_interval: 15,
            settings: extra,
        });

        let manager = InstanceManager::new(tmp.path());
        let inst = manager.create(&config).unwrap();

        let settings: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(inst.dir.join("config/server-settings.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(settings["description"], "My Server");
        assert_eq!(settings["visibility"]["public"], true);
        assert_eq!(settings["visibility"]["lan"], true);
        assert_eq!(settings["require_user_verification"], true);
        assert_eq!(settings["auto_save"]["slots"], 5);
        assert_eq!(settings["afk_autokick_interval"], 10);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_overlay_links_runtime_dirs() {
        let tmp = tempdir().unwrap();
        seed_runtime(tmp.path(), "1.1");

        let mut manager = InstanceManager::new(tmp.path());
        manager.set_use_symlinks(true);
        let inst = manager.create(&test_config("srv")).unwrap();

        let bin = inst.dir.join("bin");
        assert!(bin.is_symlink());
        assert!(bin.join("x64/factorio").exists());
    }

    #[test]
    fn remove_missing_instance_errors() {
        let tmp = tempdir().unwrap();
        let manager = InstanceManager::new(tmp.path());
        assert!(manager.remove("ghost", false).is_err());
    }

    #[test]
    fn backup_restore_round_trip() {
        let tmp = tempdir().unwrap();
        seed_runtime(tmp.path(), "1.1");

        let manager = InstanceManager::new(tmp.path());
        let inst = manager.create(&test_config("srv")).unwrap();
        fs::write(inst.dir.join("saves/world.zip"), b"save-bytes").unwrap();

        manager.remove("srv", true).unwrap();
        assert!(!manager.instance_exists("srv"));

        let backups = manager.list_backups("srv").unwrap();
        assert_eq!(backups.len(), 1);

        manager.restore_backup(&backups[0]).unwrap();
        let restored = manager.instance_dir("srv").join("saves/world.zip");
        assert_eq!(fs::read(restored).unwrap(), b"save-bytes");
    }

    #[test]
    fn backup_names_parse_back_to_instance() {
        assert_eq!(
            instance_name_from_backup("srv-20251019-123456.tar.gz").unwrap(),
            "srv"
        );
        assert_eq!(
            instance_name_from_backup("my-server-20251019-123456.tar.gz").unwrap(),
            "my-server"
        );
        assert!(instance_name_from_backup("noext").is_err());
        assert!(instance_name_from_backup("srv-gibberish.tar.gz").is_err());
    }

    #[test]
    fn engine_install_validation() {
        let tmp = tempdir().unwrap();
        assert!(!is_valid_engine_install(tmp.path()));

        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::create_dir_all(tmp.path().join("data/base")).unwrap();
        assert!(is_valid_engine_install(tmp.path()));
    }

    #[test]
    fn engine_path_is_imported_once() {
        let tmp = tempdir().unwrap();
        let system = tmp.path().join("system-install");
        for dir in ["bin/x64", "data/base"] {
            fs::create_dir_all(system.join(dir)).unwrap();
        }
        fs::write(system.join("bin/x64/factorio"), b"bin").unwrap();

        let base = tmp.path().join("base");
        let manager = InstanceManager::with_engine_path(&base, &system);
        let inst = manager.create(&test_config("srv")).unwrap();

        assert!(base.join("runtimes/1.1/bin/x64/factorio").exists());
        assert!(inst.dir.join("bin/x64/factorio").exists());
    }
}
