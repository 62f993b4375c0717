// ABOUTME: Audit rows for replication and sync outcomes in <prefix>_logged_events
// ABOUTME: Long descriptions spill over into the long_description column

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::db::{Connection, Row, Value};
use crate::utils::split_at_chars;

pub const DESCRIPTION_SIZE: usize = 255;
pub const LONG_DESCRIPTION_SIZE: usize = 1000;

/// Activity that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Replication,
    Sync,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Replication => "replication",
            Activity::Sync => "sync",
        }
    }
}

/// One audit row.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub activity: Activity,
    pub change_table: String,
    pub diff_type: String,
    pub change_key: String,
    pub left_change_type: Option<String>,
    pub right_change_type: Option<String>,
    pub description: String,
    pub long_description: Option<String>,
    pub diff_dump: Option<String>,
}

impl EventRecord {
    fn into_row(self, event_time: String) -> Row {
        let (description, long_description) = match self.long_description {
            Some(long) => (
                split_at_chars(&self.description, DESCRIPTION_SIZE).0.to_string(),
                Some(long),
            ),
            None => {
                let (head, rest) = split_at_chars(&self.description, DESCRIPTION_SIZE);
                let long = (!rest.is_empty()).then(|| self.description.clone());
                (head.to_string(), long)
            }
        };
        let long_description =
            long_description.map(|l| split_at_chars(&l, LONG_DESCRIPTION_SIZE).0.to_string());
        let (change_key, _) = split_at_chars(&self.change_key, DESCRIPTION_SIZE);

        Row::new()
            .with("activity", self.activity.as_str())
            .with("change_table", self.change_table)
            .with("diff_type", self.diff_type)
            .with("change_key", change_key.to_string())
            .with("left_change_type", Value::from(self.left_change_type))
            .with("right_change_type", Value::from(self.right_change_type))
            .with("description", description)
            .with("long_description", Value::from(long_description))
            .with("event_time", event_time)
            .with("diff_dump", Value::from(self.diff_dump))
    }
}

/// Writes audit rows to the event table of one database.
#[derive(Clone)]
pub struct EventLogger {
    connection: Arc<dyn Connection>,
    table: String,
}

impl EventLogger {
    pub fn new(connection: Arc<dyn Connection>, table: &str) -> Self {
        Self {
            connection,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn log(&self, record: EventRecord) -> Result<()> {
        tracing::debug!(
            "{} event for {} [{}]: {}",
            record.activity.as_str(),
            record.change_table,
            record.change_key,
            record.description
        );
        let event_time = chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        self.connection
            .insert(&self.table, &record.into_row(event_time))
            .with_context(|| format!("Failed to write event to {}", self.table))
    }
}
