// ABOUTME: Relational interface the scan and replication engine depends on
// ABOUTME: Connection/cursor traits, query specs, keyset paging and the connector registry

pub mod postgres;
pub mod sqlite;
pub mod value;

use anyhow::{bail, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::utils::quote_ident;

pub use value::{Row, Value};

/// Ordered, forward-only cursor over table rows.
pub trait RowCursor: Send {
    /// Whether another row is available (may fetch the next batch).
    fn has_next(&mut self) -> Result<bool>;

    /// The next row, or `None` once exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Release buffered rows early. Dropping the cursor has the same effect.
    fn close(&mut self) {}
}

/// What a cursor should select. Rows always come back ordered ascending by
/// `key_columns`.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub table: String,
    /// Ordering (and matching) columns, normally the primary key.
    pub key_columns: Vec<String>,
    /// Lower key boundary.
    pub from: Option<Row>,
    /// Whether the `from` row itself is excluded.
    pub exclude_from: bool,
    /// Upper key boundary, inclusive.
    pub to: Option<Row>,
    /// Select exactly these keys (must be sorted by key) instead of a range.
    pub row_keys: Option<Vec<Row>>,
    /// Rows fetched per round trip.
    pub row_buffer_size: usize,
}

impl QuerySpec {
    pub fn table(table: &str, key_columns: &[String], row_buffer_size: usize) -> Self {
        Self {
            table: table.to_string(),
            key_columns: key_columns.to_vec(),
            row_buffer_size: row_buffer_size.max(1),
            ..Default::default()
        }
    }

    pub fn starting_after(mut self, from: Row) -> Self {
        self.from = Some(from);
        self.exclude_from = true;
        self
    }

    pub fn starting_at(mut self, from: Row) -> Self {
        self.from = Some(from);
        self.exclude_from = false;
        self
    }

    pub fn up_to(mut self, to: Row) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_row_keys(mut self, keys: Vec<Row>) -> Self {
        self.row_keys = Some(keys);
        self
    }
}

/// Generic relational connection.
///
/// Methods take `&self`; implementations synchronize internally so a
/// connection can be shared between the cursors, change loaders and writers
/// of one pass.
pub trait Connection: Send + Sync {
    /// Adapter identifier, e.g. "sqlite" or "postgres".
    fn adapter_name(&self) -> &'static str;

    fn tables(&self) -> Result<Vec<String>>;

    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables()?.iter().any(|t| t == table))
    }

    fn primary_key_names(&self, table: &str) -> Result<Vec<String>>;

    fn column_names(&self, table: &str) -> Result<Vec<String>>;

    fn select_cursor(&self, query: QuerySpec) -> Result<Box<dyn RowCursor>>;

    /// Load the row identified by `key` (column -> value).
    fn select_record(&self, table: &str, key: &Row) -> Result<Option<Row>>;

    fn insert(&self, table: &str, row: &Row) -> Result<()>;

    /// Update the row identified by `old_key` (or by the primary key columns
    /// of `row` when `None`). Returns the number of rows changed.
    fn update(&self, table: &str, row: &Row, old_key: Option<&Row>) -> Result<u64>;

    /// Delete the row identified by `key`. Returns the number of rows removed.
    fn delete(&self, table: &str, key: &Row) -> Result<u64>;

    /// Execute a raw statement. Returns affected rows.
    fn execute(&self, sql: &str) -> Result<u64>;

    /// Render a value as a SQL literal for this dialect.
    fn quote_value(&self, value: &Value) -> String;

    fn begin_transaction(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT {}", quote_ident(name)))
            .map(|_| ())
    }

    fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .map(|_| ())
    }

    fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .map(|_| ())
    }

    /// Create the change log table if it does not exist.
    ///
    /// Columns: id (monotonic), change_table, change_key, change_new_key,
    /// change_type (I/U/D), change_time.
    fn create_change_log(&self, table: &str) -> Result<()>;

    /// Create the audit event table if it does not exist.
    fn create_event_log(&self, table: &str) -> Result<()>;
}

/// Direction of a keyset boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyBound {
    After,
    AtOrAfter,
    AtOrBefore,
}

/// Lexicographic keyset predicate over `columns` relative to `bound`.
///
/// Expanded into OR-ed prefix comparisons so that per-column collations
/// apply, e.g. for (a, b) > (1, 2): `(a > 1) OR (a = 1 AND b > 2)`.
/// `col` renders a column reference, `param` renders (and records) a bound
/// value.
pub(crate) fn keyset_predicate(
    columns: &[String],
    bound: &Row,
    direction: KeyBound,
    col: &dyn Fn(&str) -> String,
    param: &mut dyn FnMut(&str, &Value) -> String,
) -> String {
    let op = match direction {
        KeyBound::After | KeyBound::AtOrAfter => ">",
        KeyBound::AtOrBefore => "<",
    };
    let value_of = |c: &str| bound.get(c).cloned().unwrap_or(Value::Null);

    let mut terms = Vec::with_capacity(columns.len() + 1);
    for i in 0..columns.len() {
        let mut parts = Vec::with_capacity(i + 1);
        for prefix in &columns[..i] {
            let p = param(prefix, &value_of(prefix));
            parts.push(format!("{} = {}", col(prefix), p));
        }
        let p = param(&columns[i], &value_of(&columns[i]));
        parts.push(format!("{} {} {}", col(&columns[i]), op, p));
        terms.push(format!("({})", parts.join(" AND ")));
    }
    if direction != KeyBound::After {
        terms.push(format!("({})", key_equality(columns, bound, col, param)));
    }
    format!("({})", terms.join(" OR "))
}

/// `c1 = ? AND c2 = ? ...` for one key.
pub(crate) fn key_equality(
    columns: &[String],
    key: &Row,
    col: &dyn Fn(&str) -> String,
    param: &mut dyn FnMut(&str, &Value) -> String,
) -> String {
    columns
        .iter()
        .map(|c| {
            let value = key.get(c).cloned().unwrap_or(Value::Null);
            let p = param(c, &value);
            format!("{} = {}", col(c), p)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Fetches batches of ordered rows for a [`PagedCursor`].
pub(crate) trait BatchSource: Send {
    /// Up to `limit` rows ordered by key, bounded below by `lower` and above
    /// by `spec.to`.
    fn fetch_range(
        &mut self,
        spec: &QuerySpec,
        lower: Option<(&Row, KeyBound)>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// The rows for exactly these keys, ordered by key.
    fn fetch_keys(&mut self, spec: &QuerySpec, keys: &[Row]) -> Result<Vec<Row>>;
}

/// Buffered cursor paging through a table by key.
///
/// Each batch resumes strictly after the last key seen, so no server-side
/// cursor has to stay open between calls.
pub(crate) struct PagedCursor<S: BatchSource> {
    source: S,
    spec: QuerySpec,
    buffer: VecDeque<Row>,
    last_key: Option<Row>,
    key_pos: usize,
    exhausted: bool,
}

impl<S: BatchSource> PagedCursor<S> {
    pub(crate) fn new(source: S, spec: QuerySpec) -> Result<Self> {
        if spec.key_columns.is_empty() {
            bail!("Cannot open ordered cursor on {}: no key columns", spec.table);
        }
        Ok(Self {
            source,
            spec,
            buffer: VecDeque::new(),
            last_key: None,
            key_pos: 0,
            exhausted: false,
        })
    }

    fn refill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let limit = self.spec.row_buffer_size.max(1);
            let rows = if let Some(keys) = &self.spec.row_keys {
                if self.key_pos >= keys.len() {
                    self.exhausted = true;
                    break;
                }
                let end = (self.key_pos + limit).min(keys.len());
                let rows = self
                    .source
                    .fetch_keys(&self.spec, &keys[self.key_pos..end])?;
                self.key_pos = end;
                rows
            } else {
                let lower = match (&self.last_key, &self.spec.from) {
                    (Some(last), _) => Some((last, KeyBound::After)),
                    (None, Some(from)) if self.spec.exclude_from => {
                        Some((from, KeyBound::After))
                    }
                    (None, Some(from)) => Some((from, KeyBound::AtOrAfter)),
                    (None, None) => None,
                };
                let rows = self.source.fetch_range(&self.spec, lower, limit)?;
                if rows.len() < limit {
                    self.exhausted = true;
                }
                if let Some(last) = rows.last() {
                    self.last_key = Some(last.key_subset(&self.spec.key_columns));
                }
                rows
            };
            self.buffer.extend(rows);
        }
        Ok(())
    }
}

impl<S: BatchSource> RowCursor for PagedCursor<S> {
    fn has_next(&mut self) -> Result<bool> {
        self.refill()?;
        Ok(!self.buffer.is_empty())
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        self.refill()?;
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
    }
}

/// Opens a connection from a URL.
pub type Connector = fn(&str) -> Result<Arc<dyn Connection>>;

/// Maps URL schemes to connection constructors.
///
/// Built once at startup and handed to whoever needs to open sessions, so
/// tests can register their own adapters on a fresh registry.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Connector>,
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in SQLite and PostgreSQL adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sqlite", sqlite::connect);
        registry.register("postgres", postgres::connect);
        registry.register("postgresql", postgres::connect);
        registry
    }

    pub fn register(&mut self, scheme: &str, connector: Connector) {
        self.connectors.insert(scheme.to_lowercase(), connector);
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.connectors.keys().map(|s| s.as_str()).collect();
        schemes.sort_unstable();
        schemes
    }

    pub fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_lowercase())
            .unwrap_or_default();
        match self.connectors.get(&scheme) {
            Some(connector) => {
                tracing::debug!(
                    "Connecting to {} via {} adapter",
                    crate::utils::sanitize_url(url),
                    scheme
                );
                connector(url)
            }
            None => bail!(
                "No database adapter registered for '{}' (known: {})",
                crate::utils::sanitize_url(url),
                self.schemes().join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn render(columns: &[String], bound: &Row, direction: KeyBound) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = keyset_predicate(
            columns,
            bound,
            direction,
            &|c| format!("\"{}\"", c),
            &mut |_, v| {
                params.push(v.clone());
                "?".to_string()
            },
        );
        (sql, params)
    }

    #[test]
    fn test_keyset_single_column() {
        let bound = Row::new().with("id", 5);
        let (sql, params) = render(&cols(&["id"]), &bound, KeyBound::After);
        assert_eq!(sql, "((\"id\" > ?))");
        assert_eq!(params, vec![Value::Integer(5)]);
    }

    #[test]
    fn test_keyset_composite_inclusive() {
        let bound = Row::new().with("a", 1).with("b", "x");
        let (sql, params) = render(&cols(&["a", "b"]), &bound, KeyBound::AtOrBefore);
        assert_eq!(
            sql,
            "((\"a\" < ?) OR (\"a\" = ? AND \"b\" < ?) OR (\"a\" = ? AND \"b\" = ?))"
        );
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn test_registry_rejects_unknown_scheme() {
        let registry = ConnectorRegistry::with_defaults();
        let err = match registry.connect("oracle://scott:tiger@db/orcl") {
            Ok(_) => panic!("oracle should not be registered"),
            Err(e) => e,
        };
        let msg = err.to_string();
        assert!(msg.contains("No database adapter"));
        assert!(!msg.contains("tiger"));
    }

    #[test]
    fn test_registry_lists_defaults() {
        let registry = ConnectorRegistry::with_defaults();
        assert_eq!(registry.schemes(), vec!["postgres", "postgresql", "sqlite"]);
    }
}
