//! Property-based tests using proptest.
//!
//! Both scan strategies must report exactly the rows that differ, whatever
//! the block size or row cache budget.

use database_reconciler::config::ScanMode;
use database_reconciler::db::sqlite::SqliteConnection;
use database_reconciler::scan::{collect_diffs, scanner_for, ScanDiff};
use database_reconciler::{Config, Options, Row, Session};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

type Table = BTreeMap<i64, String>;

fn table_sql(table: &Table) -> String {
    let mut sql = String::from("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);");
    for (id, v) in table {
        sql.push_str(&format!("INSERT INTO t VALUES ({}, '{}');", id, v));
    }
    sql
}

fn scan(left: &Table, right: &Table, options: Options) -> Vec<ScanDiff> {
    let left_db = SqliteConnection::open_in_memory().unwrap();
    left_db.execute_batch(&table_sql(left)).unwrap();
    let right_db = SqliteConnection::open_in_memory().unwrap();
    right_db.execute_batch(&table_sql(right)).unwrap();
    let mut config = Config::new("sqlite::memory:", "sqlite::memory:");
    config.options = options;
    let session = Session::new(config, Arc::new(left_db), Arc::new(right_db));
    let mut scanner = scanner_for(&session, "t").unwrap();
    collect_diffs(scanner.as_mut()).unwrap()
}

fn expected_diffs(left: &Table, right: &Table) -> Vec<ScanDiff> {
    let row = |id: i64, v: &str| Row::new().with("id", id).with("v", v);
    let keys: BTreeSet<i64> = left.keys().chain(right.keys()).copied().collect();
    keys.into_iter()
        .filter_map(|id| match (left.get(&id), right.get(&id)) {
            (Some(l), None) => Some(ScanDiff::Left(row(id, l))),
            (None, Some(r)) => Some(ScanDiff::Right(row(id, r))),
            (Some(l), Some(r)) if l != r => Some(ScanDiff::Conflict {
                left: row(id, l),
                right: row(id, r),
            }),
            _ => None,
        })
        .collect()
}

fn table_strategy() -> impl Strategy<Value = Table> {
    prop::collection::btree_map(-20i64..40, "[a-c]{0,2}", 0..30)
}

fn options(mode: ScanMode, proxy_block_size: usize, row_cache_size: usize) -> Options {
    Options {
        scan_mode: mode,
        proxy_block_size,
        row_cache_size,
        row_buffer_size: 7,
        ..Options::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Direct scan reports every differing key once, in key order.
    #[test]
    fn direct_scan_finds_all_differences(left in table_strategy(), right in table_strategy()) {
        let diffs = scan(&left, &right, options(ScanMode::Direct, 1000, 1_000_000));
        prop_assert_eq!(diffs, expected_diffs(&left, &right));
    }

    /// Proxied scan agrees with the direct scan for any block size.
    #[test]
    fn proxied_scan_matches_direct(
        left in table_strategy(),
        right in table_strategy(),
        block in prop_oneof![Just(1usize), Just(2usize), 3usize..10, Just(1000usize)],
    ) {
        let expected = expected_diffs(&left, &right);
        let diffs = scan(&left, &right, options(ScanMode::Proxied, block, 1_000_000));
        prop_assert_eq!(diffs, expected);
    }

    /// A row cache too small to hold anything only costs extra queries.
    #[test]
    fn proxied_scan_without_row_cache(
        left in table_strategy(),
        right in table_strategy(),
        block in 1usize..6,
    ) {
        let expected = expected_diffs(&left, &right);
        let diffs = scan(&left, &right, options(ScanMode::Proxied, block, 0));
        prop_assert_eq!(diffs, expected);
    }
}
