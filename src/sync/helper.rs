// ABOUTME: Write and audit access for syncing one table pair
// ABOUTME: Resolves the table of each side and logs sync outcomes to the event table

use anyhow::Result;

use crate::committer::{committer_for, Committer};
use crate::config::Options;
use crate::db::Row;
use crate::event_log::{Activity, EventLogger, EventRecord};
use crate::replication::logged_change::encode_change_key;
use crate::scan::ScanDiff;
use crate::session::{Session, Side};

/// Everything a syncer or custom sync handler may do for one table pair.
pub struct SyncHelper<'a> {
    session: &'a Session,
    left_table: String,
    right_table: String,
    primary_key_names: Vec<String>,
    committer: Box<dyn Committer>,
    event_log: EventLogger,
}

impl<'a> SyncHelper<'a> {
    /// Helper using the committer configured for `left_table`.
    pub fn new(
        session: &'a Session,
        left_table: &str,
        primary_key_names: Vec<String>,
    ) -> Result<Self> {
        let options = session.options_for_table(left_table);
        let committer = committer_for(session, options.committer, options.commit_frequency)?;
        Ok(Self::with_committer(
            session,
            left_table,
            primary_key_names,
            committer,
        ))
    }

    pub fn with_committer(
        session: &'a Session,
        left_table: &str,
        primary_key_names: Vec<String>,
        committer: Box<dyn Committer>,
    ) -> Self {
        let event_log = EventLogger::new(
            session.left().clone(),
            &session.options().event_log_table(),
        );
        Self {
            session,
            left_table: left_table.to_string(),
            right_table: session.corresponding_table(Side::Left, left_table),
            primary_key_names,
            committer,
            event_log,
        }
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    pub fn options(&self) -> &'a Options {
        self.session.options_for_table(&self.left_table)
    }

    pub fn left_table(&self) -> &str {
        &self.left_table
    }

    pub fn right_table(&self) -> &str {
        &self.right_table
    }

    /// Table name on `side`.
    pub fn table(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.left_table,
            Side::Right => &self.right_table,
        }
    }

    pub fn primary_key_names(&self) -> &[String] {
        &self.primary_key_names
    }

    pub fn insert_record(&mut self, side: Side, values: &Row) -> Result<()> {
        let table = self.table(side).to_string();
        self.committer.insert_record(side, &table, values)
    }

    /// Overwrite the row with the same key as `values`.
    pub fn update_record(&mut self, side: Side, values: &Row) -> Result<u64> {
        let table = self.table(side).to_string();
        let key = values.key_subset(&self.primary_key_names);
        self.committer.update_record(side, &table, values, Some(&key))
    }

    /// Delete the row with the same key as `values`.
    pub fn delete_record(&mut self, side: Side, values: &Row) -> Result<u64> {
        let table = self.table(side).to_string();
        let key = values.key_subset(&self.primary_key_names);
        self.committer.delete_record(side, &table, &key)
    }

    /// Write an audit row for `diff`.
    pub fn log_sync_outcome(
        &self,
        diff: &ScanDiff,
        description: &str,
        long_description: Option<&str>,
    ) -> Result<()> {
        let key = diff.key(&self.primary_key_names);
        let change_key =
            encode_change_key(&key, &self.primary_key_names, &self.options().key_sep);
        self.event_log.log(EventRecord {
            activity: Activity::Sync,
            change_table: self.left_table.clone(),
            diff_type: diff.diff_type().to_string(),
            change_key,
            left_change_type: None,
            right_change_type: None,
            description: description.to_string(),
            long_description: long_description.map(str::to_string),
            diff_dump: serde_json::to_string(diff).ok(),
        })
    }

    /// Commit (`success`) or roll back pending writes.
    pub fn finalize(&mut self, success: bool) -> Result<()> {
        self.committer.finalize(success)
    }
}
