//! Instance configuration: the `instance.json` model, validation and
//! comment-tolerant loading.

use crate::utils::jsonc;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Mods shipped inside the engine; never downloaded or uninstalled.
pub const BUILTIN_MODS: &[&str] = &["base", "elevated-rails", "quality", "space-age"];

pub fn is_builtin_mod(name: &str) -> bool {
    BUILTIN_MODS.iter().any(|m| *m == name)
}

const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,

    /// Engine version the instance targets, e.g. "1.1" or "1.1.87".
    pub version: String,

    /// Runtime slot to overlay; defaults to `version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default)]
    pub headless: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_file: Option<String>,

    #[serde(default)]
    pub mods: ModsConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModsConfig {
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Source name -> source spec. Sorted map so registry building is
    /// deterministic over source order.
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub max_players: u32,

    #[serde(default)]
    pub public: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<String>,

    #[serde(default)]
    pub auto_save: bool,

    #[serde(default)]
    pub auto_save_interval: u32,

    /// Extra settings passed through into server-settings.json.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl InstanceConfig {
    /// Runtime slot name, defaulting to the engine version.
    pub fn runtime_name(&self) -> &str {
        self.runtime.as_deref().unwrap_or(&self.version)
    }

    /// Load a configuration file; input may carry `//` and `/* */`
    /// comments.
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read_to_string(path).with_context(|| format!("opening config file {:?}", path))?;
        let config: InstanceConfig = jsonc::from_str(&data)
            .with_context(|| format!("parsing config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist as canonical JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {:?}", parent))?;
        }
        let data = serde_json::to_string_pretty(self).context("encoding config")?;
        fs::write(path, data).with_context(|| format!("writing config file {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("instance name is required");
        }
        if self.name.len() > MAX_NAME_LEN {
            bail!("instance name too long (max {MAX_NAME_LEN} characters)");
        }
        if let Some(bad) = self
            .name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            bail!(
                "instance name contains invalid character {bad:?} \
                 (only letters, numbers, hyphens and underscores allowed)"
            );
        }

        if self.version.is_empty() {
            bail!("factorio version is required");
        }

        let non_builtin: Vec<&str> = self
            .mods
            .enabled
            .iter()
            .map(String::as_str)
            .filter(|m| !is_builtin_mod(m))
            .collect();
        if !non_builtin.is_empty() && self.mods.sources.is_empty() {
            bail!(
                "mod sources are required for non-built-in mods: [{}]",
                non_builtin.join(", ")
            );
        }

        if let Some(server) = &self.server {
            server.validate().context("invalid server config")?;
        }

        Ok(())
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("server name is required");
        }
        if self.max_players < 1 {
            bail!("max_players must be at least 1");
        }
        if self.auto_save && self.auto_save_interval < 1 {
            bail!("auto_save_interval must be at least 1 minute");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_config() -> InstanceConfig {
        InstanceConfig {
            name: "srv".to_string(),
            version: "1.1".to_string(),
            runtime: None,
            port: None,
            headless: false,
            save_file: None,
            mods: ModsConfig::default(),
            server: None,
        }
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut config = base_config();
        config.name = String::new();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "instance name is required");
    }

    #[test]
    fn name_length_boundary() {
        let mut config = base_config();
        config.name = "a".repeat(50);
        assert!(config.validate().is_ok());
        config.name = "a".repeat(51);
        assert!(config.validate().is_err());
    }

    #[test]
    fn name_charset_enforced() {
        let mut config = base_config();
        config.name = "ok_name-2".to_string();
        assert!(config.validate().is_ok());
        config.name = "bad name".to_string();
        assert!(config.validate().is_err());
        config.name = "bad/name".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_builtin_mods_need_sources() {
        let mut config = base_config();
        config.mods.enabled = vec!["x".to_string()];
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "mod sources are required for non-built-in mods: [x]"
        );

        config
            .mods
            .sources
            .insert("repo".to_string(), "github:user/mods".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builtin_mods_need_no_sources() {
        let mut config = base_config();
        config.mods.enabled = vec!["base".to_string(), "space-age".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn server_bounds() {
        let mut config = base_config();
        config.server = Some(ServerConfig {
            name: "My Server".to_string(),
            max_players: 0,
            public: false,
            password: String::new(),
            admins: vec![],
            auto_save: false,
            auto_save_interval: 0,
            settings: serde_json::Map::new(),
        });
        assert!(config.validate().is_err());

        let server = config.server.as_mut().unwrap();
        server.max_players = 8;
        assert!(config.validate().is_ok());

        let server = config.server.as_mut().unwrap();
        server.auto_save = true;
        server.auto_save_interval = 0;
        assert!(config.validate().is_err());
        let server = config.server.as_mut().unwrap();
        server.auto_save_interval = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_accepts_comments() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("instance.json");
        fs::write(
            &path,
            r#"{
  // the instance name
  "name": "srv",
  "version": "1.1", /* engine version */
  "headless": true,
  "mods": { "enabled": ["base"], "sources": {} }
}"#,
        )
        .unwrap();

        let config = InstanceConfig::load(&path).unwrap();
        assert_eq!(config.name, "srv");
        assert!(config.headless);
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("instance.json");

        let mut config = base_config();
        config.port = Some(34197);
        config.mods.enabled = vec!["base".to_string()];
        config.save(&path).unwrap();

        let loaded = InstanceConfig::load(&path).unwrap();
        assert_eq!(loaded.name, config.name);
        assert_eq!(loaded.port, Some(34197));
        assert_eq!(loaded.runtime_name(), "1.1");
    }

    #[test]
    fn runtime_defaults_to_version() {
        let mut config = base_config();
        assert_eq!(config.runtime_name(), "1.1");
        config.runtime = Some("1.1.87-headless".to_string());
        assert_eq!(config.runtime_name(), "1.1.87-headless");
    }
}
