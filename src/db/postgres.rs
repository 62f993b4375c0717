// ABOUTME: PostgreSQL adapter for the Connection trait, built on tokio-postgres
// ABOUTME: Drives the async client from an owned current-thread runtime behind a blocking API

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use super::{
    key_equality, keyset_predicate, BatchSource, Connection, KeyBound, PagedCursor, QuerySpec,
    Row, RowCursor, Value,
};
use crate::utils::{quote_ident, quote_ident_list, quote_literal, sanitize_url};

/// How column text is turned back into a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Bytes,
    Text,
}

impl ColumnKind {
    fn from_type_name(type_name: &str) -> Self {
        match type_name {
            "smallint" | "integer" | "bigint" => ColumnKind::Integer,
            "real" | "double precision" => ColumnKind::Float,
            "boolean" => ColumnKind::Boolean,
            "bytea" => ColumnKind::Bytes,
            _ => ColumnKind::Text,
        }
    }

    fn parse(self, text: Option<String>) -> Value {
        let Some(text) = text else {
            return Value::Null;
        };
        match self {
            ColumnKind::Integer => text
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or(Value::Text(text)),
            ColumnKind::Float => text
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or(Value::Text(text)),
            ColumnKind::Boolean => match text.as_str() {
                "t" | "true" => Value::Integer(1),
                "f" | "false" => Value::Integer(0),
                _ => Value::Text(text),
            },
            ColumnKind::Bytes => decode_bytea(&text).map(Value::Blob).unwrap_or(Value::Text(text)),
            ColumnKind::Text => Value::Text(text),
        }
    }
}

#[derive(Debug, Clone)]
struct PgColumn {
    name: String,
    type_name: String,
    kind: ColumnKind,
}

struct PgInner {
    runtime: Runtime,
    client: Client,
    columns: Mutex<HashMap<String, Arc<Vec<PgColumn>>>>,
    label: String,
}

impl PgInner {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn columns(&self, table: &str) -> Result<Arc<Vec<PgColumn>>> {
        {
            let cache = self
                .columns
                .lock()
                .map_err(|_| anyhow!("column cache mutex poisoned"))?;
            if let Some(columns) = cache.get(table) {
                return Ok(Arc::clone(columns));
            }
        }

        let rows = self
            .block_on(self.client.query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 WHERE a.attrelid = $1::text::regclass
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&quote_ident(table)],
            ))
            .with_context(|| format!("Failed to inspect columns of '{}'", table))?;
        if rows.is_empty() {
            bail!("Table '{}' does not exist in {}", table, self.label);
        }
        let columns: Vec<PgColumn> = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let type_name: String = row.get(1);
                let base = type_name.split('(').next().unwrap_or("").trim().to_string();
                PgColumn {
                    name,
                    kind: ColumnKind::from_type_name(&base),
                    type_name,
                }
            })
            .collect();
        let columns = Arc::new(columns);
        self.columns
            .lock()
            .map_err(|_| anyhow!("column cache mutex poisoned"))?
            .insert(table.to_string(), Arc::clone(&columns));
        Ok(columns)
    }

    fn query_rows(&self, table: &str, sql: &str, params: &[Option<String>]) -> Result<Vec<Row>> {
        let columns = self.columns(table)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self
            .block_on(self.client.query(sql, &refs))
            .with_context(|| format!("Failed to read rows from '{}'", table))?;
        Ok(rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        let text: Option<String> = row.get(idx);
                        (column.name.clone(), column.kind.parse(text))
                    })
                    .collect()
            })
            .collect())
    }

    fn execute_params(&self, sql: &str, params: &[Option<String>]) -> Result<u64> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let affected = self
            .block_on(self.client.execute(sql, &refs))
            .with_context(|| format!("Failed to execute on {}: {}", self.label, sql))?;
        Ok(affected)
    }
}

/// Collects text parameters and renders `CAST($n::text AS type)` placeholders.
struct Params<'a> {
    columns: &'a [PgColumn],
    values: Vec<Option<String>>,
}

impl<'a> Params<'a> {
    fn new(columns: &'a [PgColumn]) -> Self {
        Self {
            columns,
            values: Vec::new(),
        }
    }

    fn push(&mut self, column: &str, value: &Value) -> String {
        self.values.push(value_text(value));
        let type_name = self
            .columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.type_name.as_str())
            .unwrap_or("text");
        format!("CAST(${}::text AS {})", self.values.len(), type_name)
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Blob(b) => Some(format!("\\x{}", hex(b))),
        other => Some(other.to_key_string()),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_bytea(text: &str) -> Option<Vec<u8>> {
    let digits = text.strip_prefix("\\x")?;
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

fn select_list(columns: &[PgColumn]) -> String {
    columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn plain(column: &str) -> String {
    quote_ident(column)
}

/// A PostgreSQL database opened for scanning or replication.
pub struct PgConnection {
    inner: Arc<PgInner>,
}

impl PgConnection {
    pub fn open(url: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build runtime for PostgreSQL connection")?;
        let label = sanitize_url(url);
        let (client, connection) = runtime
            .block_on(tokio_postgres::connect(url, NoTls))
            .with_context(|| format!("Failed to connect to {}", label))?;
        let conn_label = label.clone();
        runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection {} failed: {}", conn_label, e);
            }
        });
        tracing::debug!("Connected to PostgreSQL {}", label);
        Ok(Self {
            inner: Arc::new(PgInner {
                runtime,
                client,
                columns: Mutex::new(HashMap::new()),
                label,
            }),
        })
    }
}

/// Open a connection from a `postgres://` URL.
pub fn connect(url: &str) -> Result<Arc<dyn Connection>> {
    Ok(Arc::new(PgConnection::open(url)?))
}

struct PgBatchSource {
    inner: Arc<PgInner>,
}

impl BatchSource for PgBatchSource {
    fn fetch_range(
        &mut self,
        spec: &QuerySpec,
        lower: Option<(&Row, KeyBound)>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let columns = self.inner.columns(&spec.table)?;
        let mut params = Params::new(&columns);
        let mut conditions = Vec::new();
        if let Some((bound, direction)) = lower {
            conditions.push(keyset_predicate(
                &spec.key_columns,
                bound,
                direction,
                &plain,
                &mut |c, v| params.push(c, v),
            ));
        }
        if let Some(to) = &spec.to {
            conditions.push(keyset_predicate(
                &spec.key_columns,
                to,
                KeyBound::AtOrBefore,
                &plain,
                &mut |c, v| params.push(c, v),
            ));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
            select_list(&columns),
            quote_ident(&spec.table),
            where_clause,
            quote_ident_list(&spec.key_columns),
            limit
        );
        self.inner.query_rows(&spec.table, &sql, &params.values)
    }

    fn fetch_keys(&mut self, spec: &QuerySpec, keys: &[Row]) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let columns = self.inner.columns(&spec.table)?;
        let mut params = Params::new(&columns);
        let predicates: Vec<String> = keys
            .iter()
            .map(|key| {
                format!(
                    "({})",
                    key_equality(&spec.key_columns, key, &plain, &mut |c, v| params
                        .push(c, v))
                )
            })
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            select_list(&columns),
            quote_ident(&spec.table),
            predicates.join(" OR "),
            quote_ident_list(&spec.key_columns)
        );
        self.inner.query_rows(&spec.table, &sql, &params.values)
    }
}

impl Connection for PgConnection {
    fn adapter_name(&self) -> &'static str {
        "postgres"
    }

    fn tables(&self) -> Result<Vec<String>> {
        let rows = self
            .inner
            .block_on(self.inner.client.query(
                "SELECT tablename::text FROM pg_tables \
                 WHERE schemaname = current_schema() ORDER BY tablename",
                &[],
            ))
            .context("Failed to list tables")?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn primary_key_names(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .inner
            .block_on(self.inner.client.query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 WHERE i.indrelid = $1::text::regclass AND i.indisprimary
                 ORDER BY array_position(i.indkey::int2[], a.attnum)",
                &[&quote_ident(table)],
            ))
            .with_context(|| format!("Failed to get primary key of '{}'", table))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn column_names(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .columns(table)?
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    fn select_cursor(&self, query: QuerySpec) -> Result<Box<dyn RowCursor>> {
        let source = PgBatchSource {
            inner: Arc::clone(&self.inner),
        };
        Ok(Box::new(PagedCursor::new(source, query)?))
    }

    fn select_record(&self, table: &str, key: &Row) -> Result<Option<Row>> {
        let columns = self.inner.columns(table)?;
        let key_columns: Vec<String> = key.columns().cloned().collect();
        let mut params = Params::new(&columns);
        let predicate = key_equality(&key_columns, key, &plain, &mut |c, v| params.push(c, v));
        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            select_list(&columns),
            quote_ident(table),
            predicate
        );
        Ok(self
            .inner
            .query_rows(table, &sql, &params.values)?
            .into_iter()
            .next())
    }

    fn insert(&self, table: &str, row: &Row) -> Result<()> {
        let columns = self.inner.columns(table)?;
        let names: Vec<String> = row.columns().cloned().collect();
        let mut params = Params::new(&columns);
        let placeholders: Vec<String> = row.iter().map(|(c, v)| params.push(c, v)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            quote_ident_list(&names),
            placeholders.join(", ")
        );
        self.inner
            .execute_params(&sql, &params.values)
            .with_context(|| format!("Failed to insert into '{}'", table))?;
        Ok(())
    }

    fn update(&self, table: &str, row: &Row, old_key: Option<&Row>) -> Result<u64> {
        let key = match old_key {
            Some(key) => key.clone(),
            None => {
                let pk = self.primary_key_names(table)?;
                if pk.is_empty() {
                    bail!("Cannot identify row in {}: no primary key", table);
                }
                row.key_subset(&pk)
            }
        };
        let columns = self.inner.columns(table)?;
        let mut params = Params::new(&columns);
        let assignments: Vec<String> = row
            .iter()
            .map(|(c, v)| format!("{} = {}", quote_ident(c), params.push(c, v)))
            .collect();
        let key_columns: Vec<String> = key.columns().cloned().collect();
        let predicate = key_equality(&key_columns, &key, &plain, &mut |c, v| params.push(c, v));
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            predicate
        );
        self.inner
            .execute_params(&sql, &params.values)
            .with_context(|| format!("Failed to update '{}'", table))
    }

    fn delete(&self, table: &str, key: &Row) -> Result<u64> {
        let columns = self.inner.columns(table)?;
        let mut params = Params::new(&columns);
        let key_columns: Vec<String> = key.columns().cloned().collect();
        let predicate = key_equality(&key_columns, key, &plain, &mut |c, v| params.push(c, v));
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate);
        self.inner
            .execute_params(&sql, &params.values)
            .with_context(|| format!("Failed to delete from '{}'", table))
    }

    fn execute(&self, sql: &str) -> Result<u64> {
        self.inner.execute_params(sql, &[])
    }

    fn quote_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format!("{:?}", f),
            Value::Text(s) => quote_literal(s),
            Value::Blob(b) => format!("'\\x{}'::bytea", hex(b)),
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
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id             BIGSERIAL PRIMARY KEY,
                change_table   TEXT NOT NULL,
                change_key     TEXT NOT NULL,
                change_new_key TEXT,
                change_type    CHAR(1) NOT NULL,
                change_time    TIMESTAMP NOT NULL DEFAULT now()
            )",
            quote_ident(table)
        );
        self.inner
            .block_on(self.inner.client.batch_execute(&ddl))
            .with_context(|| format!("Failed to create change log table {}", table))
    }

    fn create_event_log(&self, table: &str) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id                BIGSERIAL PRIMARY KEY,
                activity          VARCHAR(255),
                change_table      VARCHAR(255),
                diff_type         VARCHAR(255),
                change_key        VARCHAR(255),
                left_change_type  VARCHAR(255),
                right_change_type VARCHAR(255),
                description       VARCHAR(255),
                long_description  VARCHAR(1000),
                event_time        TIMESTAMP,
                diff_dump         TEXT
            )",
            quote_ident(table)
        );
        self.inner
            .block_on(self.inner.client.batch_execute(&ddl))
            .with_context(|| format!("Failed to create event log table {}", table))
    }
}
