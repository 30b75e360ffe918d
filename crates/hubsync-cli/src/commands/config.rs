//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use hubsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:        {}", config.data_dir.display());
            println!(
                "  host_id:         {}",
                config.host_id.as_deref().unwrap_or("(generated)")
            );
            println!("  schema_version:  {}", config.schema_version);
            println!("  page_size:       {}", config.page_size);
            println!(
                "  log_file:        {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Hub:");
            println!("  listen_addr:             {}", config.hub.listen_addr);
            println!(
                "  max_concurrent_requests: {}",
                config.hub.max_concurrent_requests
            );
            println!("  poll_interval_ms:        {}", config.hub.poll_interval_ms);
            println!("  request_timeout_ms:      {}", config.hub.request_timeout_ms);
            println!("  max_drain_pages:         {}", config.hub.max_drain_pages);
            println!();
            println!("Runner:");
            println!(
                "  hub_url: {}",
                config.runner.hub_url.as_deref().unwrap_or("(not set)")
            );
            println!("  enabled: {}", config.runner.enabled);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Print the config file location
pub fn path(config_path: Option<&Path>) -> Result<()> {
    println!("{}", effective_path(config_path).display());
    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, key, value)?;

    config
        .save_to_path(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "host_id" => config.host_id = optional(value),
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        "page_size" => config.page_size = parse(key, value)?,
        "schema_version" => config.schema_version = parse(key, value)?,
        "hub.listen_addr" => config.hub.listen_addr = value.to_string(),
        "hub.max_concurrent_requests" => config.hub.max_concurrent_requests = parse(key, value)?,
        "hub.poll_interval_ms" => config.hub.poll_interval_ms = parse(key, value)?,
        "hub.request_timeout_ms" => config.hub.request_timeout_ms = parse(key, value)?,
        "hub.max_drain_pages" => config.hub.max_drain_pages = parse(key, value)?,
        "runner.hub_url" => config.runner.hub_url = optional(value),
        "runner.enabled" => config.runner.enabled = parse(key, value)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, host_id, log_file, page_size, schema_version, \
                 hub.listen_addr, hub.max_concurrent_requests, hub.poll_interval_ms, \
                 hub.request_timeout_ms, hub.max_drain_pages, runner.hub_url, runner.enabled",
                key
            );
        }
    }
    Ok(())
}

fn effective_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path)
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("Invalid value for {}: '{}'", key, value),
    }
}
