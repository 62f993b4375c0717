// ABOUTME: In-memory cache of the change log table, indexed by table and change key
// ABOUTME: Consuming an entry deletes its change log row; refreshes are rate limited

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::logged_change::ChangeType;
use crate::db::{Connection, QuerySpec, Row, Value};
use crate::error::ReconcileError;
use crate::session::{Session, Side};

/// One row of the change log table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub change_table: String,
    pub change_key: String,
    pub change_new_key: Option<String>,
    pub change_type: ChangeType,
    pub change_time: NaiveDateTime,
}

/// Parse a change_time column as written by the databases' defaults.
pub fn parse_change_time(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(time);
        }
    }
    // timestamptz rendered with an offset
    chrono::DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|t| t.naive_utc())
        .with_context(|| format!("Invalid change_time '{}'", value))
}

impl ChangeLogEntry {
    fn from_row(row: &Row) -> Result<Self> {
        let text = |column: &str| -> Result<String> {
            match row.get(column) {
                Some(Value::Null) | None => Err(anyhow!("Change log row without {}", column)),
                Some(value) => Ok(value.to_key_string()),
            }
        };
        let id = row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("Change log row without numeric id"))?;
        let change_new_key = match row.get("change_new_key") {
            Some(Value::Null) | None => None,
            Some(value) => Some(value.to_key_string()),
        };
        Ok(Self {
            id,
            change_table: text("change_table")?,
            change_key: text("change_key")?,
            change_new_key,
            change_type: ChangeType::from_code(&text("change_type")?)?,
            change_time: parse_change_time(&text("change_time")?)?,
        })
    }
}

/// Caches the change log of one database.
///
/// `change_array` keeps entries in id order; consumed entries become `None`.
/// `change_tree` maps table -> change key -> positions in `change_array`.
pub struct LoggedChangeLoader {
    connection: Arc<dyn Connection>,
    change_log_table: String,
    row_buffer_size: usize,
    refresh_interval: Duration,
    current_id: i64,
    last_updated: Option<Instant>,
    change_array: Vec<Option<ChangeLogEntry>>,
    change_tree: HashMap<String, HashMap<String, VecDeque<usize>>>,
    current_index: usize,
}

impl LoggedChangeLoader {
    pub fn new(
        connection: Arc<dyn Connection>,
        change_log_table: &str,
        refresh_interval: Duration,
        row_buffer_size: usize,
    ) -> Self {
        Self {
            connection,
            change_log_table: change_log_table.to_string(),
            row_buffer_size,
            refresh_interval,
            current_id: 0,
            last_updated: None,
            change_array: Vec::new(),
            change_tree: HashMap::new(),
            current_index: 0,
        }
    }

    /// Highest change log id seen so far.
    pub fn current_id(&self) -> i64 {
        self.current_id
    }

    /// Number of cached, not yet consumed entries.
    pub fn pending_count(&self) -> usize {
        self.change_array.iter().filter(|e| e.is_some()).count()
    }

    /// Read change log entries newer than the last seen id.
    ///
    /// Skipped if the last refresh is younger than the refresh interval,
    /// unless `forced`. Returns whether the table was read.
    pub fn update(&mut self, forced: bool) -> Result<bool> {
        if !forced {
            if let Some(last) = self.last_updated {
                if last.elapsed() < self.refresh_interval {
                    return Ok(false);
                }
            }
        }
        self.last_updated = Some(Instant::now());

        let spec = QuerySpec::table(
            &self.change_log_table,
            &["id".to_string()],
            self.row_buffer_size,
        )
        .starting_after(Row::new().with("id", self.current_id));
        let mut cursor = self
            .connection
            .select_cursor(spec)
            .with_context(|| format!("Failed to read change log {}", self.change_log_table))?;

        let mut loaded = 0;
        while let Some(row) = cursor.next_row()? {
            let entry = ChangeLogEntry::from_row(&row)?;
            self.current_id = self.current_id.max(entry.id);
            let index = self.change_array.len();
            self.change_tree
                .entry(entry.change_table.clone())
                .or_default()
                .entry(entry.change_key.clone())
                .or_default()
                .push_back(index);
            self.change_array.push(Some(entry));
            loaded += 1;
        }
        cursor.close();
        if loaded > 0 {
            tracing::debug!(
                "Loaded {} change log entries from {} (last id {})",
                loaded,
                self.change_log_table,
                self.current_id
            );
        }
        Ok(true)
    }

    /// Consume the oldest cached entry for `table` / `key`.
    ///
    /// The entry's change log row is deleted; failing to delete it is an error.
    pub fn load(&mut self, table: &str, key: &str) -> Result<Option<ChangeLogEntry>> {
        let Some(keys) = self.change_tree.get_mut(table) else {
            return Ok(None);
        };
        let Some(positions) = keys.get_mut(key) else {
            return Ok(None);
        };
        let Some(index) = positions.pop_front() else {
            return Ok(None);
        };
        if positions.is_empty() {
            keys.remove(key);
            if keys.is_empty() {
                self.change_tree.remove(table);
            }
        }
        let entry = self
            .change_array
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("Change log cache out of sync for {} [{}]", table, key))?;

        let deleted = self.connection.execute(&format!(
            "DELETE FROM {} WHERE id = {}",
            crate::utils::quote_ident(&self.change_log_table),
            self.connection.quote_value(&Value::Integer(entry.id))
        ))?;
        if deleted == 0 {
            return Err(ReconcileError::ChangeLogDelete {
                table: self.change_log_table.clone(),
                id: entry.id,
            }
            .into());
        }

        if self.change_tree.is_empty() {
            self.change_array.clear();
            self.current_index = 0;
        }
        Ok(Some(entry))
    }

    /// Oldest cached entry that was not consumed yet.
    pub fn oldest_change(&mut self) -> Option<&ChangeLogEntry> {
        while self.current_index < self.change_array.len()
            && self.change_array[self.current_index].is_none()
        {
            self.current_index += 1;
        }
        self.change_array
            .get(self.current_index)
            .and_then(Option::as_ref)
    }

    pub fn oldest_change_time(&mut self) -> Option<NaiveDateTime> {
        self.oldest_change().map(|e| e.change_time)
    }
}

/// Change loaders of both databases.
pub struct LoggedChangeLoaders {
    left: LoggedChangeLoader,
    right: LoggedChangeLoader,
}

impl LoggedChangeLoaders {
    pub fn new(session: &Session) -> Self {
        let options = session.options();
        let table = options.change_log_table();
        let make = |side: Side| {
            LoggedChangeLoader::new(
                Arc::clone(session.connection(side)),
                &table,
                options.change_cache_refresh,
                options.row_buffer_size,
            )
        };
        Self {
            left: make(Side::Left),
            right: make(Side::Right),
        }
    }

    pub fn from_loaders(left: LoggedChangeLoader, right: LoggedChangeLoader) -> Self {
        Self { left, right }
    }

    pub fn loader(&mut self, side: Side) -> &mut LoggedChangeLoader {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Refresh both caches.
    pub fn update(&mut self, forced: bool) -> Result<()> {
        self.left.update(forced)?;
        self.right.update(forced)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteConnection;

    fn connection() -> Arc<SqliteConnection> {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.create_change_log("rr_pending_changes").unwrap();
        Arc::new(conn)
    }

    fn log(conn: &SqliteConnection, table: &str, key: &str, change_type: &str, time: &str) {
        conn.execute_batch(&format!(
            "INSERT INTO rr_pending_changes (change_table, change_key, change_type, change_time)
             VALUES ('{}', '{}', '{}', '{}');",
            table, key, change_type, time
        ))
        .unwrap();
    }

    fn loader(conn: &Arc<SqliteConnection>) -> LoggedChangeLoader {
        LoggedChangeLoader::new(
            conn.clone(),
            "rr_pending_changes",
            Duration::from_secs(3600),
            2,
        )
    }

    fn remaining_rows(conn: &SqliteConnection) -> usize {
        let mut cursor = conn
            .select_cursor(QuerySpec::table(
                "rr_pending_changes",
                &["id".to_string()],
                10,
            ))
            .unwrap();
        let mut n = 0;
        while cursor.next_row().unwrap().is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_update_is_rate_limited() {
        let conn = connection();
        let mut loader = loader(&conn);
        assert!(loader.update(false).unwrap());
        log(&conn, "users", "id|1", "I", "2026-01-01 10:00:00.000");
        assert!(!loader.update(false).unwrap());
        assert!(loader.oldest_change().is_none());
        assert!(loader.update(true).unwrap());
        assert_eq!(loader.oldest_change().unwrap().change_key, "id|1");
    }

    #[test]
    fn test_load_consumes_in_id_order_and_deletes_rows() {
        let conn = connection();
        log(&conn, "users", "id|1", "I", "2026-01-01 10:00:00.000");
        log(&conn, "users", "id|2", "I", "2026-01-01 10:00:01.000");
        log(&conn, "users", "id|1", "U", "2026-01-01 10:00:02.000");
        let mut loader = loader(&conn);
        loader.update(true).unwrap();
        assert_eq!(loader.current_id(), 3);

        let first = loader.load("users", "id|1").unwrap().unwrap();
        assert_eq!((first.id, first.change_type), (1, ChangeType::Insert));
        assert_eq!(loader.oldest_change().unwrap().id, 2);

        let second = loader.load("users", "id|1").unwrap().unwrap();
        assert_eq!(second.change_type, ChangeType::Update);
        assert!(loader.load("users", "id|1").unwrap().is_none());
        assert!(loader.load("orders", "id|1").unwrap().is_none());
        assert_eq!(remaining_rows(&conn), 1);

        loader.load("users", "id|2").unwrap().unwrap();
        assert_eq!(loader.pending_count(), 0);
        assert!(loader.oldest_change().is_none());
        // ids are never reread after the cache was reset
        assert_eq!(loader.current_id(), 3);
        loader.update(true).unwrap();
        assert!(loader.oldest_change().is_none());
    }

    #[test]
    fn test_oldest_change_across_refreshes() {
        let conn = connection();
        log(&conn, "users", "id|5", "U", "2026-01-01 10:00:00.000");
        let mut loader = loader(&conn);
        loader.update(true).unwrap();
        log(&conn, "users", "id|6", "I", "2026-01-01 10:00:01.000");
        log(&conn, "users", "id|5", "D", "2026-01-01 10:00:02.000");
        loader.update(true).unwrap();

        assert_eq!(loader.oldest_change().unwrap().id, 1);
        loader.load("users", "id|5").unwrap();
        assert_eq!(loader.oldest_change().unwrap().id, 2);
        assert_eq!(
            loader.oldest_change_time(),
            Some(parse_change_time("2026-01-01 10:00:01").unwrap())
        );
    }

    #[test]
    fn test_failed_delete_is_an_error() {
        let conn = connection();
        log(&conn, "users", "id|1", "I", "2026-01-01 10:00:00.000");
        let mut loader = loader(&conn);
        loader.update(true).unwrap();
        conn.execute_batch("DELETE FROM rr_pending_changes;").unwrap();

        let err = loader.load("users", "id|1").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::ChangeLogDelete { id: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_change_type() {
        let conn = connection();
        log(&conn, "users", "id|1", "X", "2026-01-01 10:00:00.000");
        let mut loader = loader(&conn);
        let err = loader.update(true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::InvalidChangeType(t)) if t == "X"
        ));
    }

    #[test]
    fn test_parse_change_time_formats() {
        assert!(parse_change_time("2026-10-19 08:30:00").is_ok());
        assert!(parse_change_time("2026-10-19 08:30:00.123456").is_ok());
        assert!(parse_change_time("2026-10-19T08:30:00.5").is_ok());
        assert!(parse_change_time("2026-10-19 08:30:00+02").is_ok());
        assert!(parse_change_time("yesterday").is_err());
    }
}
