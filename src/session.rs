// ABOUTME: Session holding the left and right connections of one configuration
// ABOUTME: Resolves corresponding tables and primary keys across both sides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::{Config, Options};
use crate::db::{Connection, ConnectorRegistry};
use crate::error::ReconcileError;
use crate::utils::sanitize_url;

/// One of the two databases being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both connections of a configuration.
pub struct Session {
    config: Config,
    left: Arc<dyn Connection>,
    right: Arc<dyn Connection>,
}

impl Session {
    pub fn new(config: Config, left: Arc<dyn Connection>, right: Arc<dyn Connection>) -> Self {
        Self {
            config,
            left,
            right,
        }
    }

    /// Open both databases through the registry.
    pub fn connect(config: Config, registry: &ConnectorRegistry) -> Result<Self> {
        config.validate()?;
        let left = registry
            .connect(&config.left.url)
            .with_context(|| format!("Failed to open left database {}", sanitize_url(&config.left.url)))?;
        let right = registry.connect(&config.right.url).with_context(|| {
            format!(
                "Failed to open right database {}",
                sanitize_url(&config.right.url)
            )
        })?;
        tracing::info!(
            "Session opened: left={} ({}), right={} ({})",
            sanitize_url(&config.left.url),
            left.adapter_name(),
            sanitize_url(&config.right.url),
            right.adapter_name()
        );
        Ok(Self::new(config, left, right))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &Options {
        &self.config.options
    }

    /// Effective options for a left table.
    pub fn options_for_table(&self, left_table: &str) -> &Options {
        self.config.options_for_table(left_table)
    }

    pub fn left(&self) -> &Arc<dyn Connection> {
        &self.left
    }

    pub fn right(&self) -> &Arc<dyn Connection> {
        &self.right
    }

    pub fn connection(&self, side: Side) -> &Arc<dyn Connection> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Name on the other side of `table`, which lives on `side`.
    ///
    /// Unconfigured tables have the same name on both sides.
    pub fn corresponding_table(&self, side: Side, table: &str) -> String {
        let found = self.config.tables.iter().find(|t| match side {
            Side::Left => t.left == table,
            Side::Right => t.right == table,
        });
        match (found, side) {
            (Some(t), Side::Left) => t.right.clone(),
            (Some(t), Side::Right) => t.left.clone(),
            (None, _) => table.to_string(),
        }
    }

    /// Left table name for a table on `side`.
    pub fn left_table(&self, side: Side, table: &str) -> String {
        match side {
            Side::Left => table.to_string(),
            Side::Right => self.corresponding_table(Side::Right, table),
        }
    }

    /// Primary key of a left table.
    ///
    /// A configured key wins. Otherwise the left database's key is used; a
    /// table without one falls back to all of its columns when it has at
    /// most `auto_key_limit` of them.
    pub fn primary_key_names(&self, left_table: &str) -> Result<Vec<String>> {
        if let Some(key) = self
            .config
            .table(left_table)
            .and_then(|t| t.primary_key_names.clone())
        {
            return Ok(key);
        }
        let key = self.left.primary_key_names(left_table)?;
        if !key.is_empty() {
            return Ok(key);
        }
        let limit = self.options_for_table(left_table).auto_key_limit;
        if limit > 0 {
            let columns = self.left.column_names(left_table)?;
            if !columns.is_empty() && columns.len() <= limit {
                tracing::debug!(
                    "Table {} has no primary key; using all {} columns",
                    left_table,
                    columns.len()
                );
                return Ok(columns);
            }
        }
        Err(ReconcileError::MissingPrimaryKey(left_table.to_string()).into())
    }

    /// Create the change log and event log tables on both databases.
    pub fn install(&self) -> Result<()> {
        let options = self.options();
        let change_log = options.change_log_table();
        let event_log = options.event_log_table();
        for side in [Side::Left, Side::Right] {
            let connection = self.connection(side);
            connection
                .create_change_log(&change_log)
                .with_context(|| format!("Failed to install change log on {} database", side))?;
            connection
                .create_event_log(&event_log)
                .with_context(|| format!("Failed to install event log on {} database", side))?;
            tracing::info!(
                "Installed {} and {} on {} database",
                change_log,
                event_log,
                side
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::db::sqlite::SqliteConnection;

    fn session(config: Config) -> Session {
        let left = SqliteConnection::open_in_memory().unwrap();
        left.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE tags (a TEXT, b TEXT);
             CREATE TABLE wide (a TEXT, b TEXT, c TEXT);",
        )
        .unwrap();
        let right = SqliteConnection::open_in_memory().unwrap();
        Session::new(config, Arc::new(left), Arc::new(right))
    }

    #[test]
    fn test_corresponding_table() {
        let config = Config::new("sqlite::memory:", "sqlite::memory:")
            .add_table(TableConfig::pair("users", "people"));
        let session = session(config);
        assert_eq!(session.corresponding_table(Side::Left, "users"), "people");
        assert_eq!(session.corresponding_table(Side::Right, "people"), "users");
        assert_eq!(session.corresponding_table(Side::Left, "orders"), "orders");
        assert_eq!(session.left_table(Side::Right, "people"), "users");
    }

    #[test]
    fn test_primary_key_resolution() {
        let mut config = Config::new("sqlite::memory:", "sqlite::memory:")
            .add_table(TableConfig::new("wide").with_primary_key(&["c"]));
        config.options.auto_key_limit = 2;
        let session = session(config);

        assert_eq!(session.primary_key_names("users").unwrap(), vec!["id"]);
        assert_eq!(session.primary_key_names("wide").unwrap(), vec!["c"]);
        assert_eq!(session.primary_key_names("tags").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_primary_key() {
        let session = session(Config::new("sqlite::memory:", "sqlite::memory:"));
        let err = session.primary_key_names("tags").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::MissingPrimaryKey(t)) if t == "tags"
        ));
    }

    #[test]
    fn test_install_creates_log_tables() {
        let session = session(Config::new("sqlite::memory:", "sqlite::memory:"));
        session.install().unwrap();
        // idempotent
        session.install().unwrap();
        for side in [Side::Left, Side::Right] {
            let conn = session.connection(side);
            assert!(conn.table_exists("rr_pending_changes").unwrap());
            assert!(conn.table_exists("rr_logged_events").unwrap());
        }
    }
}
