//! Row commands: `put` and `list`

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;

use hubsync_core::record::HOST_ID_COLUMN;
use hubsync_core::{Config, Record, RecordStore, TableSpec};

use super::open_store;
use crate::output::{primary_key, Output};

/// Write a row owned by this host, stamped now
pub fn put(
    config: &Config,
    table: &str,
    key: &str,
    assignments: &[String],
    output: &Output,
) -> Result<()> {
    let host_id = config.resolve_host_id()?;
    let store = open_store(config)?;
    let spec = lookup(store.tables().get(table), table)?;

    let mut record = Record::owned(&host_id, Utc::now());
    record.set(key_column(spec)?, parse_value(key));
    for assignment in assignments {
        let (column, value) = parse_assignment(assignment)?;
        if !spec.columns.iter().any(|c| c == column) {
            bail!(
                "Unknown column '{}' for table '{}'. Columns: {}",
                column,
                spec.name,
                spec.columns.join(", ")
            );
        }
        if column == HOST_ID_COLUMN || column == hubsync_core::record::UPDATED_AT_COLUMN {
            bail!("'{}' is set automatically", column);
        }
        record.set(column, value);
    }

    if let Some(owner) = store.stored_owner(spec, &record)? {
        if owner != host_id {
            bail!(
                "{}/{} is owned by host '{}' and can only be changed there",
                spec.name,
                primary_key(spec, &record),
                owner
            );
        }
    }

    store
        .upsert(spec, std::slice::from_ref(&record))
        .context("Failed to write row")?;
    output.success(&format!("Wrote {}/{}", spec.name, primary_key(spec, &record)));
    Ok(())
}

/// Print every row of a table
pub fn list(config: &Config, table: &str, output: &Output) -> Result<()> {
    let store = open_store(config)?;
    let spec = lookup(store.tables().get(table), table)?;
    let records = store.all(&spec.name)?;
    output.print_records(spec, &records);
    Ok(())
}

fn lookup<'a>(spec: Option<&'a TableSpec>, table: &str) -> Result<&'a TableSpec> {
    match spec {
        Some(spec) => Ok(spec),
        None => bail!(
            "Unknown table '{}'. Tables: {}",
            table,
            hubsync_core::SyncTables::default()
                .syncable()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// The single primary key column the command-line key fills in
fn key_column(spec: &TableSpec) -> Result<&str> {
    let mut keys = spec.primary_key.iter().filter(|c| *c != HOST_ID_COLUMN);
    match (keys.next(), keys.next()) {
        (Some(column), None) => Ok(column.as_str()),
        _ => bail!("Table '{}' has a composite key", spec.name),
    }
}

/// Split `column=value`
fn parse_assignment(raw: &str) -> Result<(&str, Value)> {
    let Some((column, value)) = raw.split_once('=') else {
        bail!("Expected column=value, got '{}'", raw);
    };
    let column = column.trim();
    if column.is_empty() {
        bail!("Empty column name in '{}'", raw);
    }
    Ok((column, parse_value(value)))
}

/// JSON literals stay typed; anything else is a string
fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => value,
        _ => Value::String(raw.to_string()),
    }
}
