mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use silo_lib::InstanceManager;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base_dir = match &cli.base_dir {
        Some(dir) => dir.clone(),
        None => InstanceManager::default_base_dir()?,
    };

    match &cli.cmd {
        Commands::Up(args) => commands::up(&cli, &base_dir, args).await,
        Commands::Down(args) => commands::down(&base_dir, args),
        Commands::Run(args) => commands::run(&base_dir, args).await,
        Commands::Logs(args) => commands::logs(&base_dir, args).await,
        Commands::Mods(args) => commands::mods(&base_dir, args),
        Commands::Auth => commands::auth(&base_dir).await,
        Commands::Download(args) => commands::download(&base_dir, args).await,
        Commands::Backups(args) => commands::backups(&base_dir, args),
        Commands::Restore(args) => commands::restore(&base_dir, args),
    }
}
