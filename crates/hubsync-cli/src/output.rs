//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use hubsync_core::{Record, TableSpec};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print the rows of one table
    pub fn print_records(&self, spec: &TableSpec, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No rows in {}.", spec.name);
                    return;
                }
                for record in records {
                    let fields: Vec<String> = spec
                        .columns
                        .iter()
                        .filter_map(|c| record.get(c).map(|v| format!("{}={}", c, display_value(v))))
                        .collect();
                    println!("{}", truncate(&fields.join("  "), 120));
                }
                println!("\n{} row(s)", records.len());
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", primary_key(spec, record));
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Primary key values joined with `/`
pub fn primary_key(spec: &TableSpec, record: &Record) -> String {
    spec.primary_key
        .iter()
        .map(|c| record.get(c).map(display_value).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("/")
}

/// Strings without quotes, everything else as JSON
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hubsync_core::SyncTables;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_primary_key() {
        let tables = SyncTables::default();
        let log = tables.get("activity_log").unwrap();
        let record = Record::owned("runner-a", Utc::now()).with("seq", 7);

        assert_eq!(primary_key(log, &record), "runner-a/7");
    }
}
