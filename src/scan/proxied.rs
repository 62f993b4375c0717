// ABOUTME: Proxied table scan comparing block checksums before fetching rows
// ABOUTME: Only blocks whose hashes differ are resolved row by row

use anyhow::Result;
use std::cmp::Ordering;
use std::sync::Arc;

use super::block_cursor::{BlockCursor, BlockLimit, RowChecksum};
use super::comparator::rank_rows;
use super::{ScanDiff, TableScan};
use crate::db::{Connection, QuerySpec, Row, RowCursor};
use crate::error::config_error;
use crate::session::{Session, Side};

/// Position in a mismatched block after merging the row checksums.
enum Candidate<'a> {
    Left(&'a RowChecksum),
    Right(&'a RowChecksum),
    Conflict(&'a RowChecksum, &'a RowChecksum),
}

/// Reads rows for an ascending list of keys, skipping rows that vanished.
struct KeyedRowReader {
    cursor: Option<Box<dyn RowCursor>>,
    pending: Option<Row>,
}

impl KeyedRowReader {
    fn open(
        connection: &Arc<dyn Connection>,
        table: &str,
        primary_key_names: &[String],
        row_buffer_size: usize,
        keys: Vec<Row>,
    ) -> Result<Self> {
        let cursor = if keys.is_empty() {
            None
        } else {
            Some(connection.select_cursor(
                QuerySpec::table(table, primary_key_names, row_buffer_size).with_row_keys(keys),
            )?)
        };
        Ok(Self {
            cursor,
            pending: None,
        })
    }

    fn fetch(&mut self, key: &Row, primary_key_names: &[String]) -> Result<Option<Row>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        loop {
            if self.pending.is_none() {
                self.pending = cursor.next_row()?;
            }
            let Some(row) = self.pending.as_ref() else {
                return Ok(None);
            };
            match rank_rows(Some(row), Some(key), primary_key_names)? {
                Ordering::Less => self.pending = None,
                Ordering::Equal => return Ok(self.pending.take()),
                Ordering::Greater => return Ok(None),
            }
        }
    }
}

/// Compares two tables block by block.
///
/// Each side is read through a [`BlockCursor`]. The left cursor consumes
/// `proxy_block_size` rows, the right cursor consumes everything up to the
/// last key of the left block, so both blocks cover the same key range.
/// Blocks with equal checksums are skipped.
pub struct ProxiedTableScan {
    left: Arc<dyn Connection>,
    right: Arc<dyn Connection>,
    left_table: String,
    right_table: String,
    primary_key_names: Vec<String>,
    block_size: usize,
    row_buffer_size: usize,
    row_cache_size: usize,
}

impl ProxiedTableScan {
    pub fn new(session: &Session, left_table: &str) -> Result<Self> {
        let options = session.options_for_table(left_table);
        if options.proxy_block_size == 0 {
            return config_error(format!(
                "proxy_block_size of table {} must be greater than 0",
                left_table
            ));
        }
        let primary_key_names = session.primary_key_names(left_table)?;
        Ok(Self {
            left: Arc::clone(session.left()),
            right: Arc::clone(session.right()),
            left_table: left_table.to_string(),
            right_table: session.corresponding_table(Side::Left, left_table),
            primary_key_names,
            block_size: options.proxy_block_size,
            row_buffer_size: options.row_buffer_size,
            row_cache_size: options.row_cache_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_cursor(&self, side: Side) -> Result<BlockCursor> {
        let (connection, table) = match side {
            Side::Left => (&self.left, &self.left_table),
            Side::Right => (&self.right, &self.right_table),
        };
        let cursor = connection.select_cursor(QuerySpec::table(
            table,
            &self.primary_key_names,
            self.row_buffer_size,
        ))?;
        Ok(BlockCursor::new(
            cursor,
            &self.primary_key_names,
            self.row_cache_size,
        ))
    }

    /// Resolve a mismatched block into row differences.
    fn compare_blocks(
        &self,
        left_cursor: &BlockCursor,
        right_cursor: &BlockCursor,
        sink: &mut dyn FnMut(ScanDiff) -> Result<()>,
    ) -> Result<()> {
        let key = &self.primary_key_names;
        let left_checksums = left_cursor.row_checksums();
        let right_checksums = right_cursor.row_checksums();

        let mut candidates = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < left_checksums.len() || j < right_checksums.len() {
            let l = left_checksums.get(i);
            let r = right_checksums.get(j);
            match rank_rows(l.map(|c| &c.row_keys), r.map(|c| &c.row_keys), key)? {
                Ordering::Less => {
                    candidates.extend(l.map(Candidate::Left));
                    i += 1;
                }
                Ordering::Greater => {
                    candidates.extend(r.map(Candidate::Right));
                    j += 1;
                }
                Ordering::Equal => {
                    if let (Some(l), Some(r)) = (l, r) {
                        if l.checksum != r.checksum {
                            candidates.push(Candidate::Conflict(l, r));
                        }
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        // Rows that did not fit into the row cache are fetched in one keyed read per side.
        let mut uncached_left = Vec::new();
        let mut uncached_right = Vec::new();
        for candidate in &candidates {
            let (l, r) = match candidate {
                Candidate::Left(l) => (Some(*l), None),
                Candidate::Right(r) => (None, Some(*r)),
                Candidate::Conflict(l, r) => (Some(*l), Some(*r)),
            };
            if let Some(l) = l {
                if !left_cursor.is_cached(&l.checksum) {
                    uncached_left.push(l.row_keys.clone());
                }
            }
            if let Some(r) = r {
                if !right_cursor.is_cached(&r.checksum) {
                    uncached_right.push(r.row_keys.clone());
                }
            }
        }
        tracing::debug!(
            "Block mismatch in {}: {} candidate rows, {} left and {} right rows to fetch",
            self.left_table,
            candidates.len(),
            uncached_left.len(),
            uncached_right.len()
        );
        let mut left_reader = KeyedRowReader::open(
            &self.left,
            &self.left_table,
            key,
            self.row_buffer_size,
            uncached_left,
        )?;
        let mut right_reader = KeyedRowReader::open(
            &self.right,
            &self.right_table,
            key,
            self.row_buffer_size,
            uncached_right,
        )?;

        let load = |cursor: &BlockCursor,
                        reader: &mut KeyedRowReader,
                        checksum: &RowChecksum|
         -> Result<Option<Row>> {
            match cursor.cached_row(&checksum.checksum) {
                Some(row) => Ok(Some(row)),
                None => reader.fetch(&checksum.row_keys, key),
            }
        };

        for candidate in candidates {
            match candidate {
                Candidate::Left(l) => {
                    if let Some(row) = load(left_cursor, &mut left_reader, l)? {
                        sink(ScanDiff::Left(row))?;
                    }
                }
                Candidate::Right(r) => {
                    if let Some(row) = load(right_cursor, &mut right_reader, r)? {
                        sink(ScanDiff::Right(row))?;
                    }
                }
                Candidate::Conflict(l, r) => {
                    let left_row = load(left_cursor, &mut left_reader, l)?;
                    let right_row = load(right_cursor, &mut right_reader, r)?;
                    match (left_row, right_row) {
                        (Some(left), Some(right)) => {
                            if left != right {
                                sink(ScanDiff::Conflict { left, right })?;
                            }
                        }
                        (Some(left), None) => sink(ScanDiff::Left(left))?,
                        (None, Some(right)) => sink(ScanDiff::Right(right))?,
                        (None, None) => {}
                    }
                }
            }
        }
        Ok(())
    }
}

impl TableScan for ProxiedTableScan {
    fn left_table(&self) -> &str {
        &self.left_table
    }

    fn right_table(&self) -> &str {
        &self.right_table
    }

    fn run(
        &mut self,
        progress: &mut dyn FnMut(u64),
        sink: &mut dyn FnMut(ScanDiff) -> Result<()>,
    ) -> Result<()> {
        let mut left_cursor = self.block_cursor(Side::Left)?;
        let mut right_cursor = self.block_cursor(Side::Right)?;

        while left_cursor.has_next()? {
            left_cursor.reset_cache();
            right_cursor.reset_cache();

            let left_block = left_cursor.checksum(BlockLimit::Rows(self.block_size))?;
            let Some(max_row) = left_block.max_row.as_ref() else {
                break;
            };
            let right_block = right_cursor.checksum(BlockLimit::UpTo(max_row))?;
            progress((left_block.row_count + right_block.row_count) as u64);

            if left_block.checksum != right_block.checksum {
                self.compare_blocks(&left_cursor, &right_cursor, sink)?;
            }
        }

        while let Some(row) = right_cursor.next_row()? {
            progress(1);
            sink(ScanDiff::Right(row))?;
        }

        left_cursor.close();
        right_cursor.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ScanMode};
    use crate::db::sqlite::SqliteConnection;
    use crate::error::ReconcileError;
    use crate::scan::{collect_diffs, scanner_for};

    fn open_session(left_sql: &str, right_sql: &str, block_size: usize, cache: usize) -> Session {
        let schema = "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT);";
        let left = SqliteConnection::open_in_memory().unwrap();
        left.execute_batch(schema).unwrap();
        left.execute_batch(left_sql).unwrap();
        let right = SqliteConnection::open_in_memory().unwrap();
        right.execute_batch(schema).unwrap();
        right.execute_batch(right_sql).unwrap();
        let mut config = Config::new("sqlite::memory:", "sqlite::memory:");
        config.options.proxy_block_size = block_size;
        config.options.row_cache_size = cache;
        config.options.row_buffer_size = 3;
        config.options.scan_mode = ScanMode::Proxied;
        Session::new(config, Arc::new(left), Arc::new(right))
    }

    const LEFT: &str = "INSERT INTO people VALUES (1, 'Alice'), (2, 'Bob-L'), (4, 'Dan'), (5, 'Eve');";
    const RIGHT: &str =
        "INSERT INTO people VALUES (2, 'Bob-R'), (3, 'Carol'), (4, 'Dan'), (5, 'Eve'), (6, 'Frank'), (7, 'Gina');";

    fn expected() -> Vec<ScanDiff> {
        vec![
            ScanDiff::Left(Row::new().with("id", 1).with("name", "Alice")),
            ScanDiff::Conflict {
                left: Row::new().with("id", 2).with("name", "Bob-L"),
                right: Row::new().with("id", 2).with("name", "Bob-R"),
            },
            ScanDiff::Right(Row::new().with("id", 3).with("name", "Carol")),
            ScanDiff::Right(Row::new().with("id", 6).with("name", "Frank")),
            ScanDiff::Right(Row::new().with("id", 7).with("name", "Gina")),
        ]
    }

    #[test]
    fn test_differences_for_several_block_sizes() {
        for block_size in [1, 2, 3, 100] {
            let session = open_session(LEFT, RIGHT, block_size, 1_000_000);
            let mut scan = ProxiedTableScan::new(&session, "people").unwrap();
            assert_eq!(
                collect_diffs(&mut scan).unwrap(),
                expected(),
                "block size {}",
                block_size
            );
        }
    }

    #[test]
    fn test_rows_are_fetched_when_cache_is_disabled() {
        let session = open_session(LEFT, RIGHT, 2, 0);
        let mut scan = ProxiedTableScan::new(&session, "people").unwrap();
        assert_eq!(collect_diffs(&mut scan).unwrap(), expected());
    }

    #[test]
    fn test_identical_tables_have_no_differences() {
        let session = open_session(LEFT, LEFT, 2, 1_000_000);
        let mut scan = scanner_for(&session, "people").unwrap();
        assert!(collect_diffs(scan.as_mut()).unwrap().is_empty());
    }

    #[test]
    fn test_left_empty() {
        let session = open_session("", RIGHT, 2, 1_000_000);
        let mut scan = ProxiedTableScan::new(&session, "people").unwrap();
        assert_eq!(collect_diffs(&mut scan).unwrap().len(), 6);
    }

    #[test]
    fn test_zero_block_size_is_config_error() {
        let session = open_session("", "", 0, 1_000_000);
        let err = match ProxiedTableScan::new(&session, "people") {
            Ok(_) => panic!("block size 0 must be rejected"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Config(_))
        ));
    }
}
