mod backend;
mod commands;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use backend::Backend;
use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `pull` output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let backend = Backend::from_config(&config).await?;

    match &config.command {
        Command::Pull { out } => commands::pull(&backend, out.as_deref()).await,
        Command::Push { file, no_lock } => commands::push(&backend, file, !no_lock).await,
        Command::Delete => commands::delete(&backend).await,
        Command::LockProbe => commands::lock_probe(&backend).await,
    }
}
