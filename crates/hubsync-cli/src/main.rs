//! hubsync CLI
//!
//! Runs a hub or a runner, and inspects or edits the local replicated tables.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hubsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "hubsync")]
#[command(about = "hubsync - hub-and-spoke row replication")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub: accept runners, pull and forward their rows
    Hub,
    /// Run a runner connected to the configured hub
    Runner,
    /// Show host id, cursors and row counts
    Status,
    /// Write a row owned by this host
    Put {
        /// Table name
        table: String,
        /// Primary key value
        key: String,
        /// Column values as column=value
        values: Vec<String>,
    },
    /// List the rows of a table
    #[command(alias = "ls")]
    List {
        /// Table name
        table: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the config file location
    Path,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g. runner.hub_url, hub.listen_addr)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Path) => commands::config::path(config_path),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(&key, &value, config_path, &output)
            }
        };
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config);

    match cli.command {
        Commands::Hub => commands::hub::run(&config, &output).await,
        Commands::Runner => commands::runner::run(&config, &output).await,
        Commands::Status => commands::status::show(&config, &output),
        Commands::Put { table, key, values } => {
            commands::record::put(&config, &table, &key, &values, &output)
        }
        Commands::List { table } => commands::record::list(&config, &table, &output),
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize logging
///
/// The level comes from HUBSYNC_LOG (default `info`). Logs go to `log_file`
/// when one is configured, otherwise to stderr.
fn init_logging(config: &Config) {
    let log_level = std::env::var("HUBSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::new(format!(
        "hubsync_core={},hubsync_cli={}",
        log_level, log_level
    ));

    let Some(log_path) = &config.log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();
}
