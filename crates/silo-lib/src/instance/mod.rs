//! Instance model and the managers operating on it.

pub mod config;
pub mod logs;
pub mod manager;
pub mod mods;
pub mod process;

use config::InstanceConfig;
use std::path::PathBuf;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unknown,
    Starting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A handle to a materialized instance directory.
#[derive(Debug, Clone)]
pub struct Instance {
    pub config: InstanceConfig,
    pub dir: PathBuf,
    pub state: InstanceState,
}

impl Instance {
    pub fn new(config: InstanceConfig, dir: PathBuf) -> Self {
        Self {
            config,
            dir,
            state: InstanceState::Stopped,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.dir.join("mods")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.join("config")
    }
}
