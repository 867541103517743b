use crate::cli::{
    Cli, DownArgs, DownloadArgs, LogsArgs, NameArgs, RestoreArgs, RunArgs, UpArgs,
};
use anyhow::{bail, Context, Result};
use silo_lib::auth::{self, CredentialStore, Credentials};
use silo_lib::instance::config::ModsConfig;
use silo_lib::runtime::downloader::{self, EngineDownloader};
use silo_lib::{InstanceConfig, InstanceManager, LogManager, ModManager, ProcessSupervisor};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A token cancelled by Ctrl+C, handed to every long operation.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    token
}

fn manager_for(cli: &Cli, base_dir: &Path) -> InstanceManager {
    let mut manager = match &cli.factorio_path {
        Some(path) => InstanceManager::with_engine_path(base_dir, path),
        None => InstanceManager::new(base_dir),
    };
    manager.set_use_symlinks(cli.symlinks);
    manager
}

pub async fn up(cli: &Cli, base_dir: &Path, args: &UpArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file not found: {:?}", path);
            }
            let mut config = InstanceConfig::load(path)
                .context("loading configuration file\nHint: check that the file is valid JSON")?;
            // The command-line name wins so one file can serve many
            // instances.
            config.name = args.name.clone();
            config
        }
        None => InstanceConfig {
            name: args.name.clone(),
            version: "1.1".to_string(),
            runtime: None,
            port: None,
            headless: args.headless,
            save_file: None,
            mods: ModsConfig {
                enabled: vec!["base".to_string()],
                sources: Default::default(),
            },
            server: None,
        },
    };
    if args.headless {
        config.headless = true;
    }

    println!("Creating instance '{}'...", args.name);

    let manager = manager_for(cli, base_dir);
    let inst = manager.create(&config).context(
        "failed to create instance\nHint: check write permissions on the base directory",
    )?;

    if let Some(creds) = auth::load_with_fallback(base_dir) {
        manager
            .update_player_data(&inst, &creds.factorio_username, &creds.factorio_token)
            .context("updating player data")?;
    }

    if !config.mods.enabled.is_empty() {
        println!("Installing mods and dependencies...");
        let mod_manager = ModManager::new(base_dir)?;
        let cancel = interrupt_token();
        let report = mod_manager
            .install_mods_recursively(&cancel, &inst, &config.mods.enabled)
            .await?;

        println!("Installed {} mods", report.installed.len());
        for err in &report.errors {
            eprintln!("Warning: {err}");
        }
        if let Some(err) = report.summary_error() {
            return Err(err);
        }
    }

    println!("Instance '{}' created at {:?}", args.name, inst.dir);
    Ok(())
}

pub fn down(base_dir: &Path, args: &DownArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    if !manager.instance_exists(&args.name) {
        bail!(
            "instance '{}' does not exist\nHint: use 'siloctl up {}' to create it first",
            args.name,
            args.name
        );
    }

    manager.remove(&args.name, args.backup).context(
        "failed to remove instance\nHint: check write permissions on the base directory",
    )?;

    if args.backup {
        println!(
            "Instance '{}' removed; backup stored under {:?}",
            args.name,
            base_dir.join("backups")
        );
    } else {
        println!("Instance '{}' removed", args.name);
    }
    Ok(())
}

pub async fn run(base_dir: &Path, args: &RunArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    let mut inst = manager.load_instance(&args.name)?;
    if args.headless {
        inst.config.headless = true;
    }

    let supervisor = ProcessSupervisor::new(base_dir)?;
    if supervisor.is_running(&args.name).await {
        bail!(
            "instance '{}' is already running\nHint: use 'siloctl logs {}' to watch it",
            args.name,
            args.name
        );
    }

    println!(
        "Launching instance '{}' (headless={})...",
        args.name, inst.config.headless
    );

    let cancel = interrupt_token();
    supervisor
        .start(&cancel, &inst)
        .await
        .context("failed to start instance\nHint: check that the runtime is installed")?;

    println!("Instance '{}' started; press Ctrl+C to stop", args.name);

    tokio::select! {
        _ = cancel.cancelled() => {
            println!("Stopping instance '{}'...", args.name);
            supervisor.stop(&args.name).await?;
        }
        result = supervisor.wait_for(&args.name) => {
            result?;
        }
    }

    let state = supervisor.state(&args.name).await;
    println!("Instance '{}' is now {state}", args.name);
    Ok(())
}

pub async fn logs(base_dir: &Path, args: &LogsArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    if !manager.instance_exists(&args.name) {
        bail!(
            "instance '{}' does not exist\nHint: use 'siloctl up {}' to create it first",
            args.name,
            args.name
        );
    }

    let log_manager = Arc::new(LogManager::new(base_dir));

    if args.no_follow {
        let entries = log_manager
            .log_history(&args.name, args.lines)
            .context("failed to read log history\nHint: the instance may not have run yet")?;
        if entries.is_empty() {
            println!("No logs for instance '{}'", args.name);
            return Ok(());
        }
        for entry in entries {
            println!("[{}] {}", entry.time.format("%H:%M:%S"), entry.message);
        }
        return Ok(());
    }

    println!("Streaming logs for '{}' (Ctrl+C to stop)...", args.name);
    log_manager.subscribe(
        &args.name,
        Arc::new(|entry: &silo_lib::LogEntry| {
            println!("[{}] {}", entry.time.format("%H:%M:%S"), entry.message);
        }),
    );

    let cancel = interrupt_token();
    let handle = log_manager
        .stream_logs(&cancel, &args.name)
        .await
        .context("failed to stream logs\nHint: the instance may not have run yet")?;

    cancel.cancelled().await;
    let _ = handle.await;
    Ok(())
}

pub fn mods(base_dir: &Path, args: &NameArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    let inst = manager.load_instance(&args.name)?;

    let mod_manager = ModManager::new(base_dir)?;
    let mods = mod_manager.list_mods(&inst)?;
    if mods.is_empty() {
        println!("No mods installed for '{}'", args.name);
        return Ok(());
    }
    for info in mods {
        println!("{} {} - {}", info.name, info.version, info.title);
    }
    Ok(())
}

pub async fn auth(base_dir: &Path) -> Result<()> {
    println!("Configuring Factorio portal credentials.");

    let stdin = std::io::stdin();
    print!("Factorio username: ");
    std::io::stdout().flush()?;
    let mut username = String::new();
    stdin.lock().read_line(&mut username).context("reading username")?;
    let username = username.trim().to_string();
    if username.is_empty() {
        bail!("username cannot be empty");
    }

    print!("Factorio password: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    stdin.lock().read_line(&mut password).context("reading password")?;
    let password = password.trim_end_matches(['\n', '\r']).to_string();
    if password.is_empty() {
        bail!("password cannot be empty");
    }

    println!("Authenticating...");
    let token = auth::authenticate(&username, &password).await?;

    let store = CredentialStore::new(base_dir.join("config"));
    store.save(&Credentials {
        factorio_username: username,
        factorio_token: token,
    })?;

    println!(
        "Authentication successful; credentials saved under {:?}",
        base_dir.join("config")
    );
    Ok(())
}

pub async fn download(base_dir: &Path, args: &DownloadArgs) -> Result<()> {
    if !downloader::BUILD_KINDS.contains(&args.build.as_str()) {
        bail!(
            "invalid build kind: {}\nValid build kinds: {}",
            args.build,
            downloader::BUILD_KINDS.join(", ")
        );
    }

    let engine = EngineDownloader::new(base_dir)?;
    let cancel = interrupt_token();

    let version = if args.version == "latest" {
        engine
            .latest_version(&cancel, &args.build, args.allow_experimental)
            .await?
    } else {
        args.version.clone()
    };

    let slot_dir = engine
        .download(&cancel, &version, &args.build, args.name.as_deref())
        .await?;

    println!(
        "Factorio {version} ({}) installed as runtime '{}'",
        args.build,
        slot_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    Ok(())
}

pub fn backups(base_dir: &Path, args: &NameArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    let backups = manager.list_backups(&args.name)?;
    if backups.is_empty() {
        println!("No backups for instance '{}'", args.name);
        return Ok(());
    }
    for backup in backups {
        println!("{backup}");
    }
    Ok(())
}

pub fn restore(base_dir: &Path, args: &RestoreArgs) -> Result<()> {
    let manager = InstanceManager::new(base_dir);
    manager
        .restore_backup(&args.backup)
        .context("failed to restore backup\nHint: pass a file name from 'siloctl backups'")?;
    println!("Restored backup {}", args.backup);
    Ok(())
}
