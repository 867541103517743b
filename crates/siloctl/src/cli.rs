use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "siloctl",
    version,
    about = "Provision, run and observe isolated Factorio instances"
)]
pub struct Cli {
    /// Base directory for instances, runtimes and the cache
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Import an existing Factorio installation as the runtime
    #[arg(long, global = true)]
    pub factorio_path: Option<PathBuf>,

    /// Overlay instances with symlinks instead of copies
    #[arg(long, global = true)]
    pub symlinks: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or update an instance and install its mods
    Up(UpArgs),
    /// Remove an instance
    Down(DownArgs),
    /// Launch an instance and wait for it to exit
    Run(RunArgs),
    /// Stream or print instance logs
    Logs(LogsArgs),
    /// List installed mods of an instance
    Mods(NameArgs),
    /// Store Factorio portal credentials
    Auth,
    /// Download an engine runtime
    Download(DownloadArgs),
    /// List backups of an instance
    Backups(NameArgs),
    /// Restore an instance from a backup file name
    Restore(RestoreArgs),
}

#[derive(clap::Args, Debug)]
pub struct NameArgs {
    /// Instance name
    pub name: String,
}

#[derive(clap::Args, Debug)]
pub struct UpArgs {
    /// Instance name
    pub name: String,

    /// Instance configuration file (JSON, comments allowed)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run in headless (dedicated server) mode
    #[arg(long)]
    pub headless: bool,
}

#[derive(clap::Args, Debug)]
pub struct DownArgs {
    /// Instance name
    pub name: String,

    /// Archive the instance before removing it
    #[arg(long)]
    pub backup: bool,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Instance name
    pub name: String,

    /// Force headless mode regardless of the instance config
    #[arg(long)]
    pub headless: bool,
}

#[derive(clap::Args, Debug)]
pub struct LogsArgs {
    /// Instance name
    pub name: String,

    /// Print recent entries instead of following
    #[arg(long)]
    pub no_follow: bool,

    /// How many recent entries to print with --no-follow
    #[arg(long, default_value_t = 50)]
    pub lines: usize,
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Build kind: alpha, headless, expansion or demo
    pub build: String,

    /// Engine version, or "latest"
    #[arg(default_value = "latest")]
    pub version: String,

    /// Runtime slot name (defaults to version plus build kind)
    pub name: Option<String>,

    /// Allow experimental releases when resolving "latest"
    #[arg(long)]
    pub allow_experimental: bool,
}

#[derive(clap::Args, Debug)]
pub struct RestoreArgs {
    /// Backup file name, e.g. srv-20251019-123456.tar.gz
    pub backup: String,
}
