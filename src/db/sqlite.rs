// ABOUTME: SQLite adapter for the Connection trait, built on rusqlite
// ABOUTME: Orders text keys with a registered collation that matches the row comparator

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Statement};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    key_equality, keyset_predicate, BatchSource, Connection, KeyBound, PagedCursor, QuerySpec,
    Row, RowCursor, Value,
};
use crate::scan::comparator::compare_text;
use crate::utils::{quote_ident, quote_ident_list, quote_literal};

/// Name of the collation used for key ordering.
pub const KEY_COLLATION: &str = "rr_key";

type Shared = Arc<Mutex<rusqlite::Connection>>;

/// A SQLite database opened for scanning or replication.
pub struct SqliteConnection {
    inner: Shared,
    label: String,
}

impl SqliteConnection {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::from_connection(conn, path.display().to_string())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    fn from_connection(conn: rusqlite::Connection, label: String) -> Result<Self> {
        conn.create_collation(KEY_COLLATION, compare_text)
            .context("Failed to register key collation")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set SQLite busy timeout")?;
        tracing::debug!("Opened SQLite database {}", label);
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
            label,
        })
    }

    /// Run a batch of statements (schema setup in tests and tools).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = lock(&self.inner)?;
        conn.execute_batch(sql)
            .with_context(|| format!("Failed to execute batch on {}", self.label))
    }

    fn key_columns_or_pk(&self, table: &str, row: &Row) -> Result<Row> {
        let pk = self.primary_key_names(table)?;
        if pk.is_empty() {
            anyhow::bail!("Cannot identify row in {}: no primary key", table);
        }
        Ok(row.key_subset(&pk))
    }
}

/// Open a connection from a `sqlite://path` or `sqlite::memory:` URL.
pub fn connect(url: &str) -> Result<Arc<dyn Connection>> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let conn = if path.is_empty() || path == ":memory:" {
        SqliteConnection::open_in_memory()?
    } else {
        SqliteConnection::open(path)?
    };
    Ok(Arc::new(conn))
}

fn lock(inner: &Shared) -> Result<MutexGuard<'_, rusqlite::Connection>> {
    inner
        .lock()
        .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    }
}

fn collated(column: &str) -> String {
    format!("{} COLLATE {}", quote_ident(column), KEY_COLLATION)
}

fn order_by(key_columns: &[String]) -> String {
    key_columns
        .iter()
        .map(|c| collated(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_rows(stmt: &mut Statement<'_>, params: &[SqlValue]) -> Result<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |r| {
            let mut row = Row::new();
            for (idx, name) in names.iter().enumerate() {
                let value: SqlValue = r.get(idx)?;
                row.insert(name.clone(), from_sql(value));
            }
            Ok(row)
        })?
        .collect::<Result<Vec<Row>, _>>()?;
    Ok(rows)
}

struct SqliteBatchSource {
    inner: Shared,
}

impl BatchSource for SqliteBatchSource {
    fn fetch_range(
        &mut self,
        spec: &QuerySpec,
        lower: Option<(&Row, KeyBound)>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let mut params = Vec::new();
        let mut conditions = Vec::new();
        {
            let mut param = |_: &str, v: &Value| {
                params.push(to_sql(v));
                "?".to_string()
            };
            if let Some((bound, direction)) = lower {
                conditions.push(keyset_predicate(
                    &spec.key_columns,
                    bound,
                    direction,
                    &collated,
                    &mut param,
                ));
            }
            if let Some(to) = &spec.to {
                conditions.push(keyset_predicate(
                    &spec.key_columns,
                    to,
                    KeyBound::AtOrBefore,
                    &collated,
                    &mut param,
                ));
            }
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} LIMIT {}",
            quote_ident(&spec.table),
            where_clause,
            order_by(&spec.key_columns),
            limit
        );

        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare range query on '{}'", spec.table))?;
        read_rows(&mut stmt, &params)
            .with_context(|| format!("Failed to read rows from '{}'", spec.table))
    }

    fn fetch_keys(&mut self, spec: &QuerySpec, keys: &[Row]) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = Vec::new();
        let predicates: Vec<String> = {
            let mut param = |_: &str, v: &Value| {
                params.push(to_sql(v));
                "?".to_string()
            };
            keys.iter()
                .map(|key| {
                    format!(
                        "({})",
                        key_equality(&spec.key_columns, key, &|c| quote_ident(c), &mut param)
                    )
                })
                .collect()
        };
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {}",
            quote_ident(&spec.table),
            predicates.join(" OR "),
            order_by(&spec.key_columns)
        );

        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare key query on '{}'", spec.table))?;
        read_rows(&mut stmt, &params)
            .with_context(|| format!("Failed to read rows by key from '{}'", spec.table))
    }
}

impl Connection for SqliteConnection {
    fn adapter_name(&self) -> &'static str {
        "sqlite"
    }

    fn tables(&self) -> Result<Vec<String>> {
        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type='table' \
                 AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .context("Failed to prepare statement to list tables")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query table list")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to collect table names")?;
        Ok(tables)
    }

    fn primary_key_names(&self, table: &str) -> Result<Vec<String>> {
        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .with_context(|| format!("Failed to inspect table '{}'", table))?;
        let mut keyed: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(pk, _)| *pk > 0)
            .collect();
        keyed.sort_by_key(|(pk, _)| *pk);
        Ok(keyed.into_iter().map(|(_, name)| name).collect())
    }

    fn column_names(&self, table: &str) -> Result<Vec<String>> {
        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .with_context(|| format!("Failed to inspect table '{}'", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            anyhow::bail!("Table '{}' does not exist in {}", table, self.label);
        }
        Ok(columns)
    }

    fn select_cursor(&self, query: QuerySpec) -> Result<Box<dyn RowCursor>> {
        let source = SqliteBatchSource {
            inner: Arc::clone(&self.inner),
        };
        Ok(Box::new(PagedCursor::new(source, query)?))
    }

    fn select_record(&self, table: &str, key: &Row) -> Result<Option<Row>> {
        let columns: Vec<String> = key.columns().cloned().collect();
        let mut params = Vec::new();
        let predicate = key_equality(&columns, key, &|c| quote_ident(c), &mut |_, v| {
            params.push(to_sql(v));
            "?".to_string()
        });
        let sql = format!(
            "SELECT * FROM {} WHERE {} LIMIT 1",
            quote_ident(table),
            predicate
        );
        let conn = lock(&self.inner)?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare record query on '{}'", table))?;
        Ok(read_rows(&mut stmt, &params)?.into_iter().next())
    }

    fn insert(&self, table: &str, row: &Row) -> Result<()> {
        let columns: Vec<String> = row.columns().cloned().collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            quote_ident_list(&columns),
            placeholders
        );
        let params: Vec<SqlValue> = row.values_for(&columns).iter().map(to_sql).collect();
        let conn = lock(&self.inner)?;
        conn.execute(&sql, params_from_iter(params.iter()))
            .with_context(|| format!("Failed to insert into '{}'", table))?;
        Ok(())
    }

    fn update(&self, table: &str, row: &Row, old_key: Option<&Row>) -> Result<u64> {
        let key = match old_key {
            Some(key) => key.clone(),
            None => self.key_columns_or_pk(table, row)?,
        };
        let columns: Vec<String> = row.columns().cloned().collect();
        let mut params: Vec<SqlValue> = row.values_for(&columns).iter().map(to_sql).collect();
        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let key_columns: Vec<String> = key.columns().cloned().collect();
        let predicate = key_equality(&key_columns, &key, &|c| quote_ident(c), &mut |_, v| {
            params.push(to_sql(v));
            "?".to_string()
        });
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments,
            predicate
        );
        let conn = lock(&self.inner)?;
        let changed = conn
            .execute(&sql, params_from_iter(params.iter()))
            .with_context(|| format!("Failed to update '{}'", table))?;
        Ok(changed as u64)
    }

    fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        let key_columns: Vec<String> = key.columns().cloned().collect();
        let mut params = Vec::new();
        let predicate = key_equality(&key_columns, key, &|c| quote_ident(c), &mut |_, v| {
            params.push(to_sql(v));
            "?".to_string()
        });
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate);
        let conn = lock(&self.inner)?;
        let deleted = conn
            .execute(&sql, params_from_iter(params.iter()))
            .with_context(|| format!("Failed to delete from '{}'", table))?;
        Ok(deleted as u64)
    }

    fn execute(&self, sql: &str) -> Result<u64> {
        let conn = lock(&self.inner)?;
        let affected = conn
            .execute(sql, [])
            .with_context(|| format!("Failed to execute on {}: {}", self.label, sql))?;
        Ok(affected as u64)
    }

    fn quote_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format!("{:?}", f),
            Value::Text(s) => quote_literal(s),
            Value::Blob(b) => format!("X'{}'", value_hex(b)),
        }
    }

    fn begin_transaction(&self) -> Result<()> {
        self.execute("BEGIN").map(|_| ())
    }

    fn commit(&self) -> Result<()> {
        self.execute("COMMIT").map(|_| ())
    }

    fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK").map(|_| ())
    }

    fn create_change_log(&self, table: &str) -> Result<()> {
        self.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                change_table   TEXT NOT NULL,
                change_key     TEXT NOT NULL,
                change_new_key TEXT,
                change_type    TEXT NOT NULL,
                change_time    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );",
            quote_ident(table)
        ))
    }

    fn create_event_log(&self, table: &str) -> Result<()> {
        self.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                activity          TEXT,
                change_table      TEXT,
                diff_type         TEXT,
                change_key        TEXT,
                left_change_type  TEXT,
                right_change_type TEXT,
                description       TEXT,
                long_description  TEXT,
                event_time        TEXT,
                diff_dump         TEXT
            );",
            quote_ident(table)
        ))
    }
}

fn value_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
