// ABOUTME: Integration tests for table sync between two SQLite databases
// ABOUTME: Covers record handling, conflict resolution, custom handlers and audit rows

use anyhow::Result;
use database_reconciler::config::{LogEvent, RecordHandling, ScanMode, SyncConflictHandling};
use database_reconciler::db::sqlite::SqliteConnection;
use database_reconciler::db::QuerySpec;
use database_reconciler::scan::ScanDiff;
use database_reconciler::sync::{SyncHandler, SyncHelper, TableSync};
use database_reconciler::{Config, Options, Session, Side, TableConfig, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const LEFT: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
    INSERT INTO users VALUES (1, 'alice'), (2, 'bob-left'), (4, 'dave');";

const RIGHT: &str = "
    CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT);
    INSERT INTO people VALUES (2, 'bob-right'), (3, 'carol'), (4, 'dave');";

fn session(options: Options) -> Session {
    let left = SqliteConnection::open_in_memory().unwrap();
    left.execute_batch(LEFT).unwrap();
    let right = SqliteConnection::open_in_memory().unwrap();
    right.execute_batch(RIGHT).unwrap();
    let mut config = Config::new("sqlite::memory:", "sqlite::memory:")
        .add_table(TableConfig::pair("users", "people"));
    config.options = options;
    let session = Session::new(config, Arc::new(left), Arc::new(right));
    session.install().unwrap();
    session
}

fn names(session: &Session, side: Side) -> Vec<(i64, String)> {
    let table = match side {
        Side::Left => "users",
        Side::Right => "people",
    };
    let mut cursor = session
        .connection(side)
        .select_cursor(QuerySpec::table(table, &["id".to_string()], 10))
        .unwrap();
    let mut rows = Vec::new();
    while let Some(row) = cursor.next_row().unwrap() {
        rows.push((
            row.get("id").and_then(Value::as_i64).unwrap(),
            row.get("name").and_then(Value::as_str).unwrap().to_string(),
        ));
    }
    rows
}

fn event_descriptions(session: &Session) -> Vec<String> {
    let mut cursor = session
        .connection(Side::Left)
        .select_cursor(QuerySpec::table("rr_logged_events", &["id".to_string()], 10))
        .unwrap();
    let mut out = Vec::new();
    while let Some(row) = cursor.next_row().unwrap() {
        assert_eq!(row.get("activity"), Some(&Value::from("sync")));
        out.push(format!(
            "{}:{}:{}",
            row.get("diff_type").and_then(Value::as_str).unwrap(),
            row.get("change_key").and_then(Value::as_str).unwrap(),
            row.get("description").and_then(Value::as_str).unwrap()
        ));
    }
    out
}

fn sync(session: &Session) -> database_reconciler::sync::SyncStats {
    TableSync::new(session, "users").run(&mut |_| {}).unwrap()
}

#[test]
fn test_default_options_insert_missing_rows_and_ignore_conflicts() {
    let session = session(Options::default());
    let stats = sync(&session);

    assert_eq!(stats.differences, 3);
    assert_eq!(stats.written, 2);
    assert_eq!(stats.ignored, 1);
    let expected = vec![
        (1, "alice".to_string()),
        (3, "carol".to_string()),
        (4, "dave".to_string()),
    ];
    let mut left_expected = expected.clone();
    left_expected.insert(1, (2, "bob-left".to_string()));
    let mut right_expected = expected;
    right_expected.insert(1, (2, "bob-right".to_string()));
    assert_eq!(names(&session, Side::Left), left_expected);
    assert_eq!(names(&session, Side::Right), right_expected);
    assert_eq!(event_descriptions(&session), vec!["conflict:id|2:ignored"]);
}

#[test]
fn test_delete_handling_and_left_wins() {
    let options = Options {
        left_record_handling: RecordHandling::Delete,
        right_record_handling: RecordHandling::Delete,
        sync_conflict_handling: SyncConflictHandling::LeftWins,
        logged_sync_events: BTreeSet::from([LogEvent::AllChanges, LogEvent::AllConflicts]),
        ..Options::default()
    };
    let session = session(options);
    sync(&session);

    assert_eq!(
        names(&session, Side::Left),
        vec![(2, "bob-left".to_string()), (4, "dave".to_string())]
    );
    assert_eq!(names(&session, Side::Right), names(&session, Side::Left));
    assert_eq!(
        event_descriptions(&session),
        vec![
            "left:id|1:deleted",
            "conflict:id|2:left_won",
            "right:id|3:deleted"
        ]
    );
}

#[test]
fn test_right_wins_with_proxied_scan() {
    let options = Options {
        scan_mode: ScanMode::Proxied,
        proxy_block_size: 2,
        sync_conflict_handling: SyncConflictHandling::RightWins,
        ..Options::default()
    };
    let session = session(options);
    sync(&session);

    assert_eq!(names(&session, Side::Left), names(&session, Side::Right));
    assert_eq!(names(&session, Side::Left)[1], (2, "bob-right".to_string()));
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl SyncHandler for CountingHandler {
    fn handle(&self, helper: &mut SyncHelper<'_>, diff: &ScanDiff) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(row) = diff.row(Side::Right) {
            let mut row = row.clone();
            row.insert("name", "imported");
            helper.insert_record(Side::Left, &row)?;
        }
        Ok(())
    }
}

#[test]
fn test_custom_record_handler_is_used_per_side() {
    let handler = Arc::new(CountingHandler::default());
    let options = Options {
        left_record_handling: RecordHandling::Ignore,
        right_record_handling: RecordHandling::Custom(handler.clone()),
        logged_sync_events: BTreeSet::from([LogEvent::IgnoredChanges]),
        ..Options::default()
    };
    let session = session(options);
    let stats = sync(&session);

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.ignored, 2);
    assert!(names(&session, Side::Left).contains(&(3, "imported".to_string())));
    assert!(!names(&session, Side::Right).iter().any(|(id, _)| *id == 1));
    // the ignored conflict is not a change, so only the left row is logged
    assert_eq!(event_descriptions(&session), vec!["left:id|1:ignored"]);
}

#[test]
fn test_failed_write_rolls_back_table() {
    let session = session(Options::default());
    // inserting the right-only row 3 into users collides with this index
    session
        .connection(Side::Left)
        .execute("CREATE UNIQUE INDEX users_name ON users (name)")
        .unwrap();
    session
        .connection(Side::Left)
        .execute("INSERT INTO users VALUES (10, 'carol')")
        .unwrap();

    let err = TableSync::new(&session, "users")
        .run(&mut |_| {})
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to sync table users"));
    // the insert of row 1 into people was rolled back with the rest
    assert!(!names(&session, Side::Right).iter().any(|(id, _)| *id == 1));
}
