// ABOUTME: Write and audit access handed to the replicator and custom replication handlers
// ABOUTME: Routes writes through the committer and records outcomes in the event log

use anyhow::Result;

use super::difference::ReplicationDifference;
use crate::committer::{committer_for, Committer};
use crate::config::Options;
use crate::db::Row;
use crate::event_log::{Activity, EventLogger, EventRecord};
use crate::session::{Session, Side};

/// A savepoint and the committer transaction it was set in.
pub(crate) struct Savepoint {
    side: Side,
    name: String,
    transaction: Option<u64>,
}

/// Everything a replication pass may do to the databases.
pub struct ReplicationHelper<'a> {
    session: &'a Session,
    committer: Box<dyn Committer>,
    event_log: EventLogger,
}

impl<'a> ReplicationHelper<'a> {
    /// Helper with the committer configured in the session's options.
    pub fn new(session: &'a Session) -> Result<Self> {
        let options = session.options();
        let committer = committer_for(session, options.committer, options.commit_frequency)?;
        Ok(Self::with_committer(session, committer))
    }

    pub fn with_committer(session: &'a Session, committer: Box<dyn Committer>) -> Self {
        let event_log = EventLogger::new(
            session.left().clone(),
            &session.options().event_log_table(),
        );
        Self {
            session,
            committer,
            event_log,
        }
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    pub fn options_for_table(&self, left_table: &str) -> &'a Options {
        self.session.options_for_table(left_table)
    }

    /// Current row of `key` in `table` on `side`.
    pub fn load_record(&self, side: Side, table: &str, key: &Row) -> Result<Option<Row>> {
        self.session.connection(side).select_record(table, key)
    }

    pub fn insert_record(&mut self, side: Side, table: &str, values: &Row) -> Result<()> {
        self.committer.insert_record(side, table, values)
    }

    pub fn update_record(
        &mut self,
        side: Side,
        table: &str,
        values: &Row,
        old_key: Option<&Row>,
    ) -> Result<u64> {
        self.committer.update_record(side, table, values, old_key)
    }

    pub fn delete_record(&mut self, side: Side, table: &str, key: &Row) -> Result<u64> {
        self.committer.delete_record(side, table, key)
    }

    /// Whether the last write opened a fresh transaction.
    pub fn new_transaction(&self) -> bool {
        self.committer.new_transaction()
    }

    /// Savepoints only exist inside an open transaction; without one these
    /// are no-ops.
    pub(crate) fn savepoint(&self, side: Side, name: &str) -> Result<Savepoint> {
        let transaction = if self.committer.is_transactional() {
            self.session.connection(side).savepoint(name)?;
            Some(self.committer.transaction_count())
        } else {
            None
        };
        Ok(Savepoint {
            side,
            name: name.to_string(),
            transaction,
        })
    }

    /// Whether `savepoint` still exists, i.e. no commit happened since it was set.
    fn is_open(&self, savepoint: &Savepoint) -> bool {
        self.committer.is_transactional()
            && savepoint.transaction == Some(self.committer.transaction_count())
    }

    pub(crate) fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        if self.is_open(savepoint) {
            self.session
                .connection(savepoint.side)
                .release_savepoint(&savepoint.name)?;
        }
        Ok(())
    }

    pub(crate) fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        if self.is_open(savepoint) {
            self.session
                .connection(savepoint.side)
                .rollback_to_savepoint(&savepoint.name)?;
        }
        Ok(())
    }

    /// Write an audit row for `diff`.
    pub fn log_replication_outcome(
        &self,
        diff: &ReplicationDifference,
        description: &str,
        long_description: Option<&str>,
    ) -> Result<()> {
        let change_type = |side: Side| {
            let change = diff.change(side);
            (!change.table.is_empty()).then(|| change.change_type().to_string())
        };
        self.event_log.log(EventRecord {
            activity: Activity::Replication,
            change_table: diff.table().to_string(),
            diff_type: diff.diff_type().to_string(),
            change_key: diff.key_string().to_string(),
            left_change_type: change_type(Side::Left),
            right_change_type: change_type(Side::Right),
            description: description.to_string(),
            long_description: long_description.map(str::to_string),
            diff_dump: Some(diff.to_json()),
        })
    }

    /// Commit (`success`) or roll back pending writes.
    pub fn finalize(&mut self, success: bool) -> Result<()> {
        self.committer.finalize(success)
    }
}
