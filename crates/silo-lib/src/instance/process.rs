//! Engine process supervision: one guarded record per running
//! instance, background exit observation and graceful-then-forced
//! termination.

use super::{Instance, InstanceState};
use crate::runtime::downloader::EngineDownloader;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct ProcessRecord {
    pid: u32,
    headless: bool,
    done: watch::Receiver<bool>,
}

pub struct ProcessSupervisor {
    runtime_dir: PathBuf,
    downloader: EngineDownloader,
    processes: Arc<RwLock<HashMap<String, ProcessRecord>>>,
    states: Arc<RwLock<HashMap<String, InstanceState>>>,
}

impl ProcessSupervisor {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        Ok(Self {
            runtime_dir: base_dir.join("runtimes"),
            downloader: EngineDownloader::new(&base_dir)?,
            processes: Arc::new(RwLock::new(HashMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Launch the engine for an instance. Fails when a process record
    /// already exists for the name.
    pub async fn start(&self, cancel: &CancellationToken, inst: &Instance) -> Result<()> {
        let name = inst.name().to_string();

        if self.processes.read().await.contains_key(&name) {
            bail!("instance {name} is already running");
        }

        let executable = self
            .ensure_runtime(cancel, inst.config.runtime_name())
            .await
            .context("ensuring runtime")?;

        self.states
            .write()
            .await
            .insert(name.clone(), InstanceState::Starting);

        let args = build_args(inst);
        log::info!("starting instance '{name}': {:?} {:?}", executable, args);

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(inst.dir.join("factorio.log"))
            .context("opening log file")?;
        let stderr_file = log_file.try_clone().context("cloning log handle")?;

        let mut guard = self.processes.write().await;
        if guard.contains_key(&name) {
            bail!("instance {name} is already running");
        }

        let mut child = tokio::process::Command::new(&executable)
            .args(&args)
            .current_dir(&inst.dir)
            .env("FACTORIO_HOME", &inst.dir)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .context("starting engine process")?;
        let pid = child.id().context("engine process has no pid")?;

        let (done_tx, done_rx) = watch::channel(false);
        guard.insert(
            name.clone(),
            ProcessRecord {
                pid,
                headless: inst.config.headless,
                done: done_rx,
            },
        );
        drop(guard);

        self.states
            .write()
            .await
            .insert(name.clone(), InstanceState::Running);

        // The waiter owns the child: it observes exit, drops the
        // process record and publishes the final state.
        let processes = Arc::clone(&self.processes);
        let states = Arc::clone(&self.states);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    log::info!("cancellation requested, terminating instance '{name}'");
                    terminate_pid(pid, true);
                    child.wait().await
                }
            };

            processes.write().await.remove(&name);
            let final_state = match &status {
                Ok(status) if status.success() => InstanceState::Stopped,
                Ok(status) => {
                    log::warn!("instance '{name}' exited with {status}");
                    InstanceState::Error
                }
                Err(err) => {
                    log::error!("failed to observe exit of instance '{name}': {err}");
                    InstanceState::Error
                }
            };
            states.write().await.insert(name.clone(), final_state);
            log::info!("instance '{name}' is now {final_state}");
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Stop a running instance: graceful signal first, SIGKILL after
    /// the grace period, then wait for the exit to be observed.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let record = {
            let guard = self.processes.read().await;
            guard
                .get(name)
                .cloned()
                .with_context(|| format!("instance {name} is not running"))?
        };

        log::info!("stopping instance '{name}' (pid {})", record.pid);
        terminate_pid(record.pid, record.headless);

        let mut done = record.done.clone();
        let finished = tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, wait_done(&mut done)).await;
        if finished.is_err() {
            log::warn!("graceful shutdown of '{name}' timed out, killing");
            kill_pid(record.pid);
            let mut done = record.done.clone();
            wait_done(&mut done).await;
        }
        Ok(())
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.processes.read().await.contains_key(name)
    }

    pub async fn list_running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Block until the named instance exits.
    pub async fn wait_for(&self, name: &str) -> Result<()> {
        let record = {
            let guard = self.processes.read().await;
            guard
                .get(name)
                .cloned()
                .with_context(|| format!("instance {name} is not running"))?
        };
        let mut done = record.done.clone();
        wait_done(&mut done).await;
        Ok(())
    }

    /// The supervisor's view of an instance's state.
    pub async fn state(&self, name: &str) -> InstanceState {
        if self.processes.read().await.contains_key(name) {
            return InstanceState::Running;
        }
        self.states
            .read()
            .await
            .get(name)
            .copied()
            .unwrap_or(InstanceState::Unknown)
    }

    /// Resolve the runtime executable, downloading the runtime slot
    /// when it is missing.
    async fn ensure_runtime(&self, cancel: &CancellationToken, runtime_name: &str) -> Result<PathBuf> {
        let runtime_path = self.runtime_dir.join(runtime_name);
        let executable = EngineDownloader::executable_path(&runtime_path);
        if executable.exists() {
            return Ok(executable);
        }

        log::info!("runtime {runtime_name} not present, downloading");
        self.downloader
            .download(cancel, runtime_name, "alpha", Some(runtime_name))
            .await
            .with_context(|| format!("downloading engine {runtime_name}"))?;

        if !executable.exists() {
            bail!("downloaded runtime {runtime_name} has no executable at {:?}", executable);
        }
        Ok(executable)
    }
}

async fn wait_done(done: &mut watch::Receiver<bool>) {
    loop {
        if *done.borrow() {
            return;
        }
        // A dropped sender also means the waiter finished.
        if done.changed().await.is_err() {
            return;
        }
    }
}

/// Command-line arguments for launching an instance.
fn build_args(inst: &Instance) -> Vec<String> {
    let mut args = Vec::new();

    if inst.config.headless {
        args.push("--start-server".to_string());
        let save = inst.config.save_file.as_deref().unwrap_or("default.zip");
        args.push(inst.dir.join("saves").join(save).display().to_string());
    }

    if inst.config.server.is_some() {
        args.push("--server-settings".to_string());
        args.push(
            inst.dir
                .join("config")
                .join("server-settings.json")
                .display()
                .to_string(),
        );
    }

    if let Some(port) = inst.config.port {
        args.push("--port".to_string());
        args.push(port.to_string());
    }

    args.push("--mod-directory".to_string());
    args.push(inst.dir.join("mods").display().to_string());

    args
}

/// Ask a process to shut down. Headless servers honor SIGTERM; GUI
/// builds treat SIGINT like a window close.
#[cfg(unix)]
fn terminate_pid(pid: u32, headless: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if headless {
        Signal::SIGTERM
    } else {
        Signal::SIGINT
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        log::warn!("failed to signal pid {pid}: {err}");
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::warn!("failed to kill pid {pid}: {err}");
    }
}

#[cfg(not(unix))]
fn terminate_pid(pid: u32, _headless: bool) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::config::{InstanceConfig, ModsConfig, ServerConfig};
    use std::path::Path;
    use tempfile::tempdir;

    fn test_instance(dir: &Path, headless: bool, port: Option<u16>, server: bool) -> Instance {
        let config = InstanceConfig {
            name: "srv".to_string(),
            version: "1.1".to_string(),
            runtime: None,
            port,
            headless,
            save_file: None,
            mods: ModsConfig::default(),
            server: server.then(|| ServerConfig {
                name: "Server".to_string(),
                max_players: 8,
                public: false,
                password: String::new(),
                admins: vec![],
                auto_save: false,
                auto_save_interval: 0,
                settings: serde_json::Map::new(),
            }),
        };
        Instance::new(config, dir.to_path_buf())
    }

    #[test]
    fn headless_args_include_server_start() {
        let tmp = tempdir().unwrap();
        let inst = test_instance(tmp.path(), true, Some(34197), true);
        let args = build_args(&inst);

        assert_eq!(args[0], "--start-server");
        assert!(args[1].ends_with("default.zip"));
        assert!(args.contains(&"--server-settings".to_string()));
        assert!(args.contains(&"--port".to_string()));
        assert!(args.contains(&"34197".to_string()));
        assert!(args.contains(&"--mod-directory".to_string()));
    }

    #[test]
    fn gui_args_only_set_mod_directory() {
        let tmp = tempdir().unwrap();
        let inst = test_instance(tmp.path(), false, None, false);
        let args = build_args(&inst);

        assert_eq!(args.len(), 2);
        assert_eq!(args[0], "--mod-directory");
        assert!(args[1].ends_with("mods"));
    }

    #[test]
    fn custom_save_file_is_used() {
        let tmp = tempdir().unwrap();
        let mut inst = test_instance(tmp.path(), true, None, false);
        inst.config.save_file = Some("world.zip".to_string());
        let args = build_args(&inst);
        assert!(args[1].ends_with("world.zip"));
    }

    #[tokio::test]
    async fn queries_on_empty_supervisor() {
        let tmp = tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(tmp.path()).unwrap();

        assert!(!supervisor.is_running("srv").await);
        assert!(supervisor.list_running().await.is_empty());
        assert_eq!(supervisor.state("srv").await, InstanceState::Unknown);
        assert!(supervisor.stop("srv").await.is_err());
        assert!(supervisor.wait_for("srv").await.is_err());
    }

    // The stub runtime mimics the Linux executable layout.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn start_stop_lifecycle_with_stub_engine() {
        let tmp = tempdir().unwrap();

        // A runtime slot whose "engine" sleeps until signalled.
        let runtime = tmp.path().join("runtimes").join("1.1");
        std::fs::create_dir_all(runtime.join("bin/x64")).unwrap();
        let exe = runtime.join("bin/x64/factorio");
        std::fs::write(&exe, "#!/bin/sh\ntrap 'exit 0' TERM INT\nwhile true; do sleep 0.1; done\n")
            .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let inst_dir = tmp.path().join("instances/srv");
        std::fs::create_dir_all(inst_dir.join("saves")).unwrap();
        std::fs::create_dir_all(inst_dir.join("mods")).unwrap();
        let inst = test_instance(&inst_dir, true, None, false);

        let supervisor = ProcessSupervisor::new(tmp.path()).unwrap();
        let cancel = CancellationToken::new();
        supervisor.start(&cancel, &inst).await.unwrap();

        assert!(supervisor.is_running("srv").await);
        assert_eq!(supervisor.list_running().await, vec!["srv".to_string()]);
        assert_eq!(supervisor.state("srv").await, InstanceState::Running);

        // A second start for the same name must be refused.
        let err = supervisor.start(&cancel, &inst).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        supervisor.stop("srv").await.unwrap();
        assert!(!supervisor.is_running("srv").await);
        assert_eq!(supervisor.state("srv").await, InstanceState::Stopped);
        assert!(inst_dir.join("factorio.log").exists());
    }
}
