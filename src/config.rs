//! Gateway configuration
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! file (or no file) yields a working configuration.
//!
//! ```yaml
//! listen: 127.0.0.1:27017
//! database_path: /var/lib/nosqlgate/data.db
//! default_database: test
//! idle_timeout_secs: 600
//! command_timeout_ms: 30000
//! max_open_cursors: 100
//! cursor_timeout_secs: 600
//! table:
//!   id_column: id
//!   doc_column: doc
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the wire-protocol listener binds to
    pub listen: SocketAddr,
    /// SQLite database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Database used until a command names one
    pub default_database: String,
    /// Close connections idle for this long (0 disables)
    pub idle_timeout_secs: u64,
    /// Abort commands running longer than this (0 disables)
    pub command_timeout_ms: u64,
    /// Largest accepted wire message
    pub max_message_size: usize,
    /// Largest accepted single document
    pub max_document_size: usize,
    /// Deepest accepted document nesting
    pub max_nesting_depth: usize,
    /// Documents returned in a first batch when the client gives no batchSize
    pub default_batch_size: usize,
    /// Open cursors one connection may hold; the least recently used goes first
    pub max_open_cursors: usize,
    /// Drop cursors with no `getMore` for this long (0 disables)
    pub cursor_timeout_secs: u64,
    /// Column layout of collection tables
    pub table: TableSchema,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 27017)),
            database_path: None,
            default_database: "test".to_string(),
            idle_timeout_secs: 0,
            command_timeout_ms: 0,
            max_message_size: 48_000_000,
            max_document_size: 16 * 1024 * 1024,
            max_nesting_depth: 100,
            default_batch_size: 101,
            max_open_cursors: 100,
            cursor_timeout_secs: 600,
            table: TableSchema::default(),
        }
    }
}

/// Column names of a collection table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    pub id_column: String,
    pub doc_column: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            id_column: "id".to_string(),
            doc_column: "doc".to_string(),
        }
    }
}

/// Limits enforced by the document codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_document_size: usize,
    pub max_nesting_depth: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        let config = Config::default();
        config.codec_limits()
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        crate::validation::validate_database_name(&self.default_database)?;
        for column in [&self.table.id_column, &self.table.doc_column] {
            if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                anyhow::bail!("invalid table column name '{}'", column);
            }
        }
        if self.table.id_column == self.table.doc_column {
            anyhow::bail!("id_column and doc_column must differ");
        }
        if self.default_batch_size == 0 {
            anyhow::bail!("default_batch_size must be positive");
        }
        if self.max_open_cursors == 0 {
            anyhow::bail!("max_open_cursors must be positive");
        }
        Ok(())
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_document_size: self.max_document_size,
            max_nesting_depth: self.max_nesting_depth,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }

    pub fn cursor_timeout(&self) -> Option<Duration> {
        (self.cursor_timeout_secs > 0).then(|| Duration::from_secs(self.cursor_timeout_secs))
    }
}
