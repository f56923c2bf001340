//! Treecache - shared CI artifact cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use treecache::cli::{commands, Cli, Operation};
use treecache::config::ConfigManager;
use treecache::error::TreeCacheResult;
use treecache::host::JobIdentity;
use treecache::store::{Cache, StorageTopology};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> TreeCacheResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    if let Some(root) = cli.shared_root {
        config.storage.shared_root = root;
    }
    if let Some(root) = cli.local_root {
        config.storage.local_root = root;
    }

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using configuration {}", config_manager.path().display());

    let operation = Operation::try_from(cli.command)?;
    let topology = StorageTopology::resolve(&config.storage);
    let cache = Cache::new(config, topology, JobIdentity::from_env())
        .with_config_path(config_manager.path());

    commands::dispatch(&cache, operation).await
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("treecache=warn"),
        1 => EnvFilter::new("treecache=info"),
        _ => EnvFilter::new("treecache=debug"),
    });

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
