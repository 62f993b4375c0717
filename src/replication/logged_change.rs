// ABOUTME: Net change of one record aggregated from its change log entries
// ABOUTME: Follows primary key renames and collapses insert/update/delete sequences

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::loader::LoggedChangeLoader;
use crate::db::{Row, Value};
use crate::error::ReconcileError;

/// Net change type of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NoChange,
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    /// Parse the single-character change log code (I, U or D).
    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim() {
            "I" => Ok(ChangeType::Insert),
            "U" => Ok(ChangeType::Update),
            "D" => Ok(ChangeType::Delete),
            other => Err(ReconcileError::InvalidChangeType(other.to_string()).into()),
        }
    }

    /// State after applying a raw change of type `raw` to this state.
    ///
    /// | state     | I      | U      | D         |
    /// |-----------|--------|--------|-----------|
    /// | no_change | insert | update | delete    |
    /// | insert    | insert | insert | no_change |
    /// | update    | update | update | delete    |
    /// | delete    | update | update | delete    |
    pub fn apply(self, raw: ChangeType) -> ChangeType {
        use ChangeType::*;
        match (self, raw) {
            (state, NoChange) => state,
            (NoChange, raw) => raw,
            (Insert, Insert) | (Insert, Update) => Insert,
            (Insert, Delete) => NoChange,
            (Update, Insert) | (Update, Update) => Update,
            (Update, Delete) => Delete,
            (Delete, Insert) | (Delete, Update) => Update,
            (Delete, Delete) => Delete,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::NoChange => "no_change",
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode key columns as `col|val|col2|val2` in primary key order.
pub fn encode_change_key(key: &Row, primary_key_names: &[String], key_sep: &str) -> String {
    primary_key_names
        .iter()
        .flat_map(|c| {
            let value = key.get(c).map(Value::to_key_string).unwrap_or_default();
            [c.clone(), value]
        })
        .collect::<Vec<_>>()
        .join(key_sep)
}

/// Decode a change key into a key row with text values.
pub fn decode_change_key(key: &str, key_sep: &str) -> Row {
    let parts: Vec<&str> = key.split(key_sep).collect();
    parts
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| (pair[0].to_string(), Value::Text(pair[1].to_string())))
        .collect()
}

/// Net change of one record on one side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedChange {
    pub table: String,
    /// Change key the record had when this change was first loaded.
    key: String,
    /// Change key under which further log entries are looked up.
    current_key: String,
    #[serde(rename = "type")]
    change_type: ChangeType,
    first_changed_at: Option<NaiveDateTime>,
    last_changed_at: Option<NaiveDateTime>,
    #[serde(skip)]
    key_sep: String,
}

impl LoggedChange {
    pub fn new(key_sep: &str) -> Self {
        Self {
            table: String::new(),
            key: String::new(),
            current_key: String::new(),
            change_type: ChangeType::NoChange,
            first_changed_at: None,
            last_changed_at: None,
            key_sep: key_sep.to_string(),
        }
    }

    fn reset(&mut self, table: &str, key: &str) {
        self.table = table.to_string();
        self.key = key.to_string();
        self.current_key = key.to_string();
        self.change_type = ChangeType::NoChange;
        self.first_changed_at = None;
        self.last_changed_at = None;
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Change key identifying the record in its database right now.
    ///
    /// For inserts that is the latest key; for updates and deletes it is the
    /// key the record had before the changes.
    pub fn key_string(&self) -> &str {
        match self.change_type {
            ChangeType::Insert => &self.current_key,
            _ => &self.key,
        }
    }

    pub fn key(&self) -> Row {
        decode_change_key(self.key_string(), &self.key_sep)
    }

    /// Key after an update (only set for updates).
    pub fn new_key(&self) -> Option<Row> {
        (self.change_type == ChangeType::Update)
            .then(|| decode_change_key(&self.current_key, &self.key_sep))
    }

    pub fn first_changed_at(&self) -> Option<NaiveDateTime> {
        self.first_changed_at
    }

    pub fn last_changed_at(&self) -> Option<NaiveDateTime> {
        self.last_changed_at
    }

    /// Consume all pending entries for the current key.
    pub fn load(&mut self, loader: &mut LoggedChangeLoader) -> Result<()> {
        while let Some(entry) = loader.load(&self.table, &self.current_key)? {
            self.first_changed_at.get_or_insert(entry.change_time);
            self.last_changed_at = Some(entry.change_time);
            self.change_type = self.change_type.apply(entry.change_type);
            if entry.change_type == ChangeType::Update {
                if let Some(new_key) = entry.change_new_key {
                    if new_key != self.current_key {
                        self.current_key = new_key;
                    }
                }
            }
        }
        Ok(())
    }

    /// Load the change of a specific record.
    pub fn load_specified(
        &mut self,
        loader: &mut LoggedChangeLoader,
        table: &str,
        key: &str,
    ) -> Result<()> {
        self.reset(table, key);
        self.load(loader)
    }

    /// Load the oldest pending change that does not net out to no change.
    ///
    /// Leaves `no_change` if the cache runs dry.
    pub fn load_oldest(&mut self, loader: &mut LoggedChangeLoader) -> Result<()> {
        loop {
            let Some(oldest) = loader.oldest_change() else {
                break;
            };
            let (table, key) = (oldest.change_table.clone(), oldest.change_key.clone());
            self.reset(&table, &key);
            self.load(loader)?;
            if self.change_type != ChangeType::NoChange {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteConnection;
    use crate::db::Connection;
    use std::sync::Arc;
    use std::time::Duration;

    const ALL: [ChangeType; 4] = [
        ChangeType::NoChange,
        ChangeType::Insert,
        ChangeType::Update,
        ChangeType::Delete,
    ];

    #[test]
    fn test_transition_table() {
        use ChangeType::*;
        let expected = [
            (NoChange, [Insert, Update, Delete]),
            (Insert, [Insert, Insert, NoChange]),
            (Update, [Update, Update, Delete]),
            (Delete, [Update, Update, Delete]),
        ];
        for (state, row) in expected {
            for (raw, next) in [Insert, Update, Delete].into_iter().zip(row) {
                assert_eq!(state.apply(raw), next, "{} + {}", state, raw);
            }
        }
        for state in ALL {
            assert_eq!(state.apply(NoChange), state);
        }
    }

    #[test]
    fn test_sequences_collapse() {
        use ChangeType::*;
        let fold = |seq: &[ChangeType]| seq.iter().fold(NoChange, |s, raw| s.apply(*raw));
        assert_eq!(fold(&[Insert, Update, Delete]), NoChange);
        assert_eq!(fold(&[Insert, Delete, Insert]), Insert);
        assert_eq!(fold(&[Delete, Insert]), Update);
        assert_eq!(fold(&[Update, Delete, Insert, Update]), Update);
    }

    #[test]
    fn test_change_key_encoding() {
        let pk = vec!["b".to_string(), "a".to_string()];
        let key = Row::new().with("a", 1).with("b", "x");
        let encoded = encode_change_key(&key, &pk, "|");
        assert_eq!(encoded, "b|x|a|1");
        assert_eq!(
            decode_change_key(&encoded, "|"),
            Row::new().with("a", "1").with("b", "x")
        );
        assert_eq!(ChangeType::from_code("U").unwrap(), ChangeType::Update);
        assert!(ChangeType::from_code("Z").is_err());
    }

    struct Log {
        conn: Arc<SqliteConnection>,
        loader: LoggedChangeLoader,
        second: u32,
    }

    impl Log {
        fn new() -> Self {
            let conn = Arc::new(SqliteConnection::open_in_memory().unwrap());
            conn.create_change_log("rr_pending_changes").unwrap();
            let loader = LoggedChangeLoader::new(
                conn.clone(),
                "rr_pending_changes",
                Duration::from_secs(3600),
                100,
            );
            Self {
                conn,
                loader,
                second: 0,
            }
        }

        fn add(&mut self, change_type: &str, key: &str, new_key: Option<&str>) {
            self.second += 1;
            let new_key = new_key
                .map(|k| format!("'{}'", k))
                .unwrap_or_else(|| "NULL".to_string());
            self.conn
                .execute_batch(&format!(
                    "INSERT INTO rr_pending_changes
                       (change_table, change_key, change_new_key, change_type, change_time)
                     VALUES ('users', '{}', {}, '{}', '2026-01-01 10:00:{:02}');",
                    key, new_key, change_type, self.second
                ))
                .unwrap();
        }
    }

    #[test]
    fn test_insert_absorbs_key_renames() {
        let mut log = Log::new();
        log.add("I", "id|1", None);
        log.add("U", "id|1", Some("id|2"));
        log.add("U", "id|2", Some("id|3"));
        log.loader.update(true).unwrap();

        let mut change = LoggedChange::new("|");
        change.load_specified(&mut log.loader, "users", "id|1").unwrap();
        assert_eq!(change.change_type(), ChangeType::Insert);
        assert_eq!(change.key(), Row::new().with("id", "3"));
        assert_eq!(change.new_key(), None);
        assert_eq!(
            change.first_changed_at().unwrap().to_string(),
            "2026-01-01 10:00:01"
        );
        assert_eq!(
            change.last_changed_at().unwrap().to_string(),
            "2026-01-01 10:00:03"
        );
    }

    #[test]
    fn test_update_keeps_old_and_new_key() {
        let mut log = Log::new();
        log.add("U", "id|1", Some("id|2"));
        log.loader.update(true).unwrap();

        let mut change = LoggedChange::new("|");
        change.load_oldest(&mut log.loader).unwrap();
        assert_eq!(change.change_type(), ChangeType::Update);
        assert_eq!(change.key(), Row::new().with("id", "1"));
        assert_eq!(change.new_key(), Some(Row::new().with("id", "2")));
    }

    #[test]
    fn test_reinsert_uses_final_key() {
        let mut log = Log::new();
        log.add("I", "id|7", None);
        log.add("D", "id|7", None);
        log.add("I", "id|7", None);
        log.loader.update(true).unwrap();

        let mut change = LoggedChange::new("|");
        change.load_oldest(&mut log.loader).unwrap();
        assert_eq!(change.change_type(), ChangeType::Insert);
        assert_eq!(change.key(), Row::new().with("id", "7"));
    }

    #[test]
    fn test_load_oldest_skips_records_without_net_change() {
        let mut log = Log::new();
        log.add("I", "id|1", None);
        log.add("D", "id|1", None);
        log.add("D", "id|9", None);
        log.loader.update(true).unwrap();

        let mut change = LoggedChange::new("|");
        change.load_oldest(&mut log.loader).unwrap();
        assert_eq!(change.change_type(), ChangeType::Delete);
        assert_eq!(change.key_string(), "id|9");

        let mut empty = LoggedChange::new("|");
        empty.load_oldest(&mut log.loader).unwrap();
        assert_eq!(empty.change_type(), ChangeType::NoChange);
    }

    #[test]
    fn test_reload_picks_up_new_entries() {
        let mut log = Log::new();
        log.add("I", "id|4", None);
        log.loader.update(true).unwrap();
        let mut change = LoggedChange::new("|");
        change.load_oldest(&mut log.loader).unwrap();
        assert_eq!(change.change_type(), ChangeType::Insert);

        log.add("D", "id|4", None);
        log.loader.update(true).unwrap();
        change.load(&mut log.loader).unwrap();
        assert_eq!(change.change_type(), ChangeType::NoChange);
    }
}
