//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fitsync_common::{Error, Result, Table};

/// How the scheduler triggers runs on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only connectivity, foreground and explicit triggers.
    Manual,
    /// Additionally sync at regular intervals.
    Periodic { interval: Duration },
}

/// Per-table sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table these settings apply to.
    pub table: Table,
    /// Local field names identifying the same entity across ids (e.g. `email`).
    /// Empty disables natural-key reconciliation for the table.
    #[serde(default)]
    pub natural_keys: Vec<String>,
    /// Remote field names every outbound record should carry.
    #[serde(default)]
    pub expected_fields: Vec<String>,
}

impl TableConfig {
    /// Built-in settings for a table.
    pub fn defaults(table: Table) -> Self {
        Self {
            table,
            natural_keys: table
                .default_natural_keys()
                .iter()
                .map(|k| k.to_string())
                .collect(),
            expected_fields: table
                .default_expected_fields()
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }

    /// Replace the natural key set.
    pub fn with_natural_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natural_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote store.
    pub server_url: String,
    /// Pull endpoint, relative to the base URL.
    pub pull_path: String,
    /// Push endpoint, relative to the base URL.
    pub push_path: String,
    /// Bearer token attached to every request.
    pub auth_token: Option<String>,
    /// Transport timeout per request, in seconds.
    pub request_timeout_secs: u64,
    /// Minimum delay between two runs started by natural triggers, in seconds.
    pub min_sync_interval_secs: u64,
    /// Scheduler mode.
    pub sync_mode: SyncMode,
    /// Synchronized tables, in sync order.
    pub tables: Vec<TableConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000/api/".to_string(),
            pull_path: "sync/pull".to_string(),
            push_path: "sync/push".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            min_sync_interval_secs: 30,
            sync_mode: SyncMode::Manual,
            tables: Table::ALL.iter().copied().map(TableConfig::defaults).collect(),
        }
    }
}

impl SyncConfig {
    /// Load a JSON configuration file. Missing keys take their defaults.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check for settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::InvalidInput("server_url is empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        for (i, table) in self.tables.iter().enumerate() {
            if self.tables[..i].iter().any(|t| t.table == table.table) {
                return Err(Error::InvalidInput(format!(
                    "Table {} configured twice",
                    table.table
                )));
            }
        }
        Ok(())
    }

    /// Set the server base URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the pull and push endpoints.
    pub fn with_paths(mut self, pull: impl Into<String>, push: impl Into<String>) -> Self {
        self.pull_path = pull.into();
        self.push_path = push.into();
        self
    }

    /// Set the bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the minimum delay between natural runs.
    pub fn with_min_sync_interval(mut self, interval: Duration) -> Self {
        self.min_sync_interval_secs = interval.as_secs();
        self
    }

    /// Set the scheduler mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Add or replace a table's settings.
    pub fn with_table(mut self, table: TableConfig) -> Self {
        match self.tables.iter_mut().find(|t| t.table == table.table) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Minimum delay between natural runs.
    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_sync_interval_secs)
    }

    /// Synchronized tables, in sync order.
    pub fn table_names(&self) -> Vec<Table> {
        self.tables.iter().map(|t| t.table).collect()
    }

    /// Settings of a table; unconfigured tables get the built-in defaults.
    pub fn table(&self, table: Table) -> TableConfig {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .cloned()
            .unwrap_or_else(|| TableConfig::defaults(table))
    }
}
