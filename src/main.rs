//! Warden policy synchronization daemon

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden::{GitRepository, PolicyWatcher, RepositoryConfig, Result, WardenError, NAME, VERSION};

/// Warden - Policy Synchronization Daemon
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Keeps the gateway's policy set in sync with its git source of truth")]
struct Cli {
    /// Configuration file path (YAML or TOML)
    #[arg(short, long, default_value = "warden.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,

    /// Clone the repository, pull once, and print the current commit
    Sync,

    /// Run the polling watcher until interrupted
    Watch,
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = RepositoryConfig::from_file(&cli.config)?;
    let timeout = config.poll.timeout;

    match cli.command {
        Commands::Validate => {
            println!("{} is valid", cli.config.display());
        }
        Commands::Sync => {
            let repository = Arc::new(GitRepository::new(config)?);
            repository.clone_repo(timeout).await?;
            let pull = repository.pull(timeout).await?;
            let head = repository.current_commit().await?;

            println!("commit:  {}", head.sha);
            println!("author:  {} <{}>", head.author, head.email);
            println!("date:    {}", head.timestamp);
            println!("message: {}", head.message);
            if pull.had_changes {
                println!("changed: {} file(s)", pull.changed_files.len());
                for file in &pull.changed_files {
                    println!("  {}", file);
                }
            } else {
                println!("changed: up to date");
            }
        }
        Commands::Watch => {
            let repository = Arc::new(GitRepository::new(config)?);
            repository.clone_repo(timeout).await?;

            let watcher = PolicyWatcher::new(repository, syntax_check_reload);
            watcher.start(timeout).await?;
            info!("Watching for policy changes; press ctrl-c to stop");

            tokio::signal::ctrl_c().await?;
            watcher.stop()?;
        }
    }

    Ok(())
}

/// Stand-in reload hook: checks that every policy file in the directory is
/// well-formed. The gateway installs its policy engine here instead.
fn syntax_check_reload(dir: &Path) -> Result<()> {
    let mut checked = 0usize;
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str::<serde_yaml::Value>(&content).map_err(|e| {
                    WardenError::Validation(format!("{}: {}", path.display(), e))
                })?;
                checked += 1;
            }
            Some("json") => {
                serde_json::from_str::<serde_json::Value>(&content).map_err(|e| {
                    WardenError::Validation(format!("{}: {}", path.display(), e))
                })?;
                checked += 1;
            }
            _ => {}
        }
    }

    info!(files = checked, path = %dir.display(), "Policy syntax check passed");
    Ok(())
}
