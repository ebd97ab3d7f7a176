//! Configuration loading and validation.
//!
//! The CLI (or any embedder) resolves its arguments into a [`Config`] and
//! hands it to [`crate::CopyEngine`]; nothing in the core reads the process
//! environment or command line.

use crate::error::{PipeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;
use tracing::info;

/// Default column name for the row-identifier passthrough column.
pub const DEFAULT_ROWID_COLUMN: &str = "SRC_ROW_ID";

/// Default number of rows per destination commit.
pub const DEFAULT_COMMIT_AFTER: usize = 50;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database endpoint (must be PostgreSQL).
    pub source: EndpointConfig,

    /// Destination database endpoint (PostgreSQL or MySQL).
    pub destination: EndpointConfig,

    /// Copy behavior configuration.
    pub copy: CopyConfig,
}

/// One side of the copy: connection target plus credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Connection URL, e.g. `postgres://host:5432/db` or `mysql://host:3306/db`.
    pub url: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,
}

/// Row-identifier store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process ordered list; extraction is a slice copy.
    Memory,
    /// Append-only on-disk log in a scratch directory; lower memory,
    /// higher random-extract latency.
    Log,
}

/// Copy behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Source schema name.
    pub source_schema: String,

    /// Source table name.
    pub source_table: String,

    /// Destination schema (defaults to the source schema).
    #[serde(default)]
    pub destination_schema: Option<String>,

    /// Destination table (defaults to the source table).
    #[serde(default)]
    pub destination_table: Option<String>,

    /// Optional filter predicate, appended to the key query only
    /// (without the `WHERE` keyword).
    #[serde(default)]
    pub where_clause: Option<String>,

    /// Number of parallel workers. When absent, the engine uses the
    /// minimum of local cores and both remote capacity hints.
    #[serde(default)]
    pub degree: Option<usize>,

    /// Commit the destination transaction every this many rows.
    #[serde(default = "default_commit_after")]
    pub commit_after: usize,

    /// Materialize each whole sub-batch from the source instead of
    /// streaming it row by row.
    #[serde(default)]
    pub fetch_all_rows: bool,

    /// Where to keep the captured row identifiers.
    #[serde(default = "default_store_backend")]
    pub rowid_store: StoreBackend,

    /// Append the source row identifier to each destination row.
    #[serde(default)]
    pub add_rowid: bool,

    /// Destination column name for the passthrough identifier.
    /// Only meaningful with `add_rowid`; defaults to `SRC_ROW_ID`.
    #[serde(default)]
    pub rowid_column: Option<String>,
}

fn default_commit_after() -> usize {
    DEFAULT_COMMIT_AFTER
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !is_postgres_url(&self.source.url) {
            return Err(PipeError::Config(format!(
                "source URL '{}' is not a PostgreSQL URL; row identifiers are captured from ctid",
                self.source.url
            )));
        }
        if !is_postgres_url(&self.destination.url) && !is_mysql_url(&self.destination.url) {
            return Err(PipeError::Config(format!(
                "unsupported destination URL '{}'; expected postgres:// or mysql://",
                self.destination.url
            )));
        }
        if self.copy.source_schema.trim().is_empty() {
            return Err(PipeError::Config("source_schema must not be empty".into()));
        }
        if self.copy.source_table.trim().is_empty() {
            return Err(PipeError::Config("source_table must not be empty".into()));
        }
        if self.copy.commit_after == 0 {
            return Err(PipeError::Config("commit_after must be at least 1".into()));
        }
        if self.copy.degree == Some(0) {
            return Err(PipeError::Config("degree must be at least 1".into()));
        }
        Ok(())
    }
}

impl CopyConfig {
    /// Destination schema, falling back to the source schema.
    pub fn destination_schema(&self) -> &str {
        self.destination_schema
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.source_schema)
    }

    /// Destination table, falling back to the source table.
    pub fn destination_table(&self) -> &str {
        self.destination_table
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.source_table)
    }

    /// Effective passthrough column name, or `None` when passthrough is off.
    pub fn rowid_column(&self) -> Option<&str> {
        if self.add_rowid {
            Some(
                self.rowid_column
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(DEFAULT_ROWID_COLUMN),
            )
        } else {
            None
        }
    }
}

fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

fn is_mysql_url(url: &str) -> bool {
    url.starts_with("mysql://")
}

/// Number of usable CPU cores on this host.
pub fn local_core_count() -> usize {
    let mut sys = System::new_all();
    sys.refresh_all();
    let cores = sys.cpus().len().max(1);
    info!("Detected {} local CPU cores", cores);
    cores
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
source:
  url: postgres://src-host:5432/prod
  user: scott
  password: tiger
destination:
  url: mysql://dst-host:3306/archive
  user: scott
  password: tiger
copy:
  source_schema: sales
  source_table: orders
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(cfg.copy.commit_after, 50);
        assert_eq!(cfg.copy.rowid_store, StoreBackend::Memory);
        assert!(!cfg.copy.fetch_all_rows);
        assert_eq!(cfg.copy.degree, None);
        assert_eq!(cfg.copy.destination_schema(), "sales");
        assert_eq!(cfg.copy.destination_table(), "orders");
        assert_eq!(cfg.copy.rowid_column(), None);
    }

    #[test]
    fn rowid_column_defaults_when_passthrough_requested() {
        let mut cfg = Config::from_yaml(minimal_yaml()).unwrap();
        cfg.copy.add_rowid = true;
        assert_eq!(cfg.copy.rowid_column(), Some(DEFAULT_ROWID_COLUMN));
        cfg.copy.rowid_column = Some("ORIGIN_CTID".into());
        assert_eq!(cfg.copy.rowid_column(), Some("ORIGIN_CTID"));
    }

    #[test]
    fn rejects_non_postgres_source() {
        let yaml = minimal_yaml().replace("postgres://src-host", "mysql://src-host");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn rejects_zero_commit_after() {
        let yaml = format!("{}  commit_after: 0\n", minimal_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn log_backend_parses() {
        let yaml = format!("{}  rowid_store: log\n", minimal_yaml());
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.copy.rowid_store, StoreBackend::Log);
    }
}
