// ABOUTME: Direct table scan: merge-join of two key-ordered row cursors
// ABOUTME: Emits left-only, right-only and conflicting rows; identical rows are skipped

use anyhow::Result;
use std::cmp::Ordering;
use std::sync::Arc;

use super::comparator::rank_rows;
use super::{ScanDiff, TableScan};
use crate::db::{Connection, QuerySpec, Row};
use crate::session::{Session, Side};

/// Compares two tables by reading both completely, ordered by primary key.
pub struct DirectTableScan {
    left: Arc<dyn Connection>,
    right: Arc<dyn Connection>,
    left_table: String,
    right_table: String,
    primary_key_names: Vec<String>,
    row_buffer_size: usize,
}

impl DirectTableScan {
    /// Fails with `MissingPrimaryKey` if the table has no usable key.
    pub fn new(session: &Session, left_table: &str) -> Result<Self> {
        let primary_key_names = session.primary_key_names(left_table)?;
        Ok(Self {
            left: Arc::clone(session.left()),
            right: Arc::clone(session.right()),
            left_table: left_table.to_string(),
            right_table: session.corresponding_table(Side::Left, left_table),
            primary_key_names,
            row_buffer_size: session.options_for_table(left_table).row_buffer_size,
        })
    }

    pub fn primary_key_names(&self) -> &[String] {
        &self.primary_key_names
    }
}

impl TableScan for DirectTableScan {
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
        let key = &self.primary_key_names;
        let mut left_cursor = self.left.select_cursor(QuerySpec::table(
            &self.left_table,
            key,
            self.row_buffer_size,
        ))?;
        let mut right_cursor = self.right.select_cursor(QuerySpec::table(
            &self.right_table,
            key,
            self.row_buffer_size,
        ))?;

        let mut left_row: Option<Row> = None;
        let mut right_row: Option<Row> = None;
        loop {
            if left_row.is_none() {
                left_row = left_cursor.next_row()?;
            }
            if right_row.is_none() {
                right_row = right_cursor.next_row()?;
            }
            if left_row.is_none() && right_row.is_none() {
                break;
            }

            match rank_rows(left_row.as_ref(), right_row.as_ref(), key)? {
                Ordering::Less => {
                    if let Some(row) = left_row.take() {
                        progress(1);
                        sink(ScanDiff::Left(row))?;
                    }
                }
                Ordering::Greater => {
                    if let Some(row) = right_row.take() {
                        progress(1);
                        sink(ScanDiff::Right(row))?;
                    }
                }
                Ordering::Equal => {
                    progress(2);
                    if let (Some(left), Some(right)) = (left_row.take(), right_row.take()) {
                        if left != right {
                            sink(ScanDiff::Conflict { left, right })?;
                        }
                    }
                }
            }
        }

        left_cursor.close();
        right_cursor.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::sqlite::SqliteConnection;
    use crate::error::ReconcileError;
    use crate::scan::collect_diffs;

    fn open_session(left_sql: &str, right_sql: &str) -> Session {
        let schema = "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT);
                      CREATE TABLE nokey (name TEXT);";
        let left = SqliteConnection::open_in_memory().unwrap();
        left.execute_batch(schema).unwrap();
        left.execute_batch(left_sql).unwrap();
        let right = SqliteConnection::open_in_memory().unwrap();
        right.execute_batch(schema).unwrap();
        right.execute_batch(right_sql).unwrap();
        let mut config = Config::new("sqlite::memory:", "sqlite::memory:");
        config.options.row_buffer_size = 2;
        Session::new(config, Arc::new(left), Arc::new(right))
    }

    #[test]
    fn test_finds_all_difference_kinds() {
        let session = open_session(
            "INSERT INTO people VALUES (1, 'Alice'), (2, 'Bob-L'), (4, 'Dan');",
            "INSERT INTO people VALUES (2, 'Bob-R'), (3, 'Carol'), (4, 'Dan');",
        );
        let mut scan = DirectTableScan::new(&session, "people").unwrap();
        let diffs = collect_diffs(&mut scan).unwrap();
        assert_eq!(
            diffs,
            vec![
                ScanDiff::Left(Row::new().with("id", 1).with("name", "Alice")),
                ScanDiff::Conflict {
                    left: Row::new().with("id", 2).with("name", "Bob-L"),
                    right: Row::new().with("id", 2).with("name", "Bob-R"),
                },
                ScanDiff::Right(Row::new().with("id", 3).with("name", "Carol")),
            ]
        );
    }

    #[test]
    fn test_one_side_empty() {
        let session = open_session("", "INSERT INTO people VALUES (1, 'A'), (2, 'B'), (3, 'C');");
        let mut scan = DirectTableScan::new(&session, "people").unwrap();
        let diffs = collect_diffs(&mut scan).unwrap();
        assert_eq!(diffs.len(), 3);
        assert!(diffs.iter().all(|d| matches!(d, ScanDiff::Right(_))));

        let session = open_session("", "");
        let mut scan = DirectTableScan::new(&session, "people").unwrap();
        assert!(collect_diffs(&mut scan).unwrap().is_empty());
    }

    #[test]
    fn test_progress_counts_every_row() {
        let session = open_session(
            "INSERT INTO people VALUES (1, 'A'), (2, 'B');",
            "INSERT INTO people VALUES (2, 'B'), (3, 'C');",
        );
        let mut scan = DirectTableScan::new(&session, "people").unwrap();
        let mut consumed = 0;
        let mut diffs = 0;
        scan.run(&mut |n| consumed += n, &mut |_| {
            diffs += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(diffs, 2);
    }

    #[test]
    fn test_table_without_key_is_rejected() {
        let session = open_session("", "");
        let err = match DirectTableScan::new(&session, "nokey") {
            Ok(_) => panic!("scan of a table without primary key must fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::MissingPrimaryKey(_))
        ));
    }
}
