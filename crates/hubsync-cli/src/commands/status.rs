//! Status command handler

use anyhow::Result;

use hubsync_core::Config;

use super::open_store;
use crate::output::{Output, OutputFormat};

/// Show identity, cursors and row counts
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let host_id = config.resolve_host_id()?;
    let store = open_store(config)?;
    let cursors = store.cursors()?;

    let mut counts = Vec::new();
    for spec in store.tables().syncable() {
        counts.push((spec.name.clone(), spec.forwardable, store.count(&spec.name)?));
    }

    match output.format {
        OutputFormat::Json => {
            let cursors: Vec<_> = cursors
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "role": c.role,
                        "peer_id": c.peer_id,
                        "since": hubsync_core::record::format_timestamp(&c.since),
                    })
                })
                .collect();
            let tables: Vec<_> = counts
                .iter()
                .map(|(name, forwardable, rows)| {
                    serde_json::json!({
                        "name": name,
                        "forwardable": forwardable,
                        "rows": rows,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "host_id": host_id,
                    "schema_version": config.schema_version,
                    "hub_url": config.runner.hub_url,
                    "sync_enabled": config.runner.enabled,
                    "database": config.sqlite_path(),
                    "cursors": cursors,
                    "tables": tables,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", host_id);
        }
        OutputFormat::Human => {
            println!("hubsync Status");
            println!("==============");
            println!();
            println!("Host:");
            println!("  ID:             {}", host_id);
            println!("  Schema version: {}", config.schema_version);
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.runner.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!(
                "  Hub:    {}",
                config.runner.hub_url.as_deref().unwrap_or("(not set)")
            );
            println!();
            println!("Cursors:");
            if cursors.is_empty() {
                println!("  (none)");
            }
            for cursor in &cursors {
                println!(
                    "  {:<6} {:<30} {}",
                    cursor.role,
                    cursor.peer_id,
                    cursor.since.format("%Y-%m-%d %H:%M:%S%.3f")
                );
            }
            println!();
            println!("Tables:");
            for (name, forwardable, rows) in &counts {
                let scope = if *forwardable { "" } else { " (hub only)" };
                println!("  {:<14} {}{}", name, rows, scope);
            }
            println!();
            println!("Database: {}", config.sqlite_path().display());
        }
    }

    Ok(())
}
