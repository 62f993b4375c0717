// ABOUTME: Commit strategies routing replication and sync writes to both databases
// ABOUTME: Default commits every write, buffered groups writes into larger transactions

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::CommitterKind;
use crate::db::{Connection, Row};
use crate::session::{Session, Side};

/// Writes records and decides when they are committed.
pub trait Committer: Send {
    fn insert_record(&mut self, side: Side, table: &str, values: &Row) -> Result<()>;

    /// Returns the number of updated rows.
    fn update_record(
        &mut self,
        side: Side,
        table: &str,
        values: &Row,
        old_key: Option<&Row>,
    ) -> Result<u64>;

    /// Returns the number of deleted rows.
    fn delete_record(&mut self, side: Side, table: &str, key: &Row) -> Result<u64>;

    /// Whether writes run inside an open transaction that savepoints can nest in.
    fn is_transactional(&self) -> bool {
        false
    }

    /// True right after the last write committed and opened a fresh transaction.
    fn new_transaction(&self) -> bool {
        false
    }

    /// Number of transactions opened so far. A savepoint only survives while
    /// this stays unchanged.
    fn transaction_count(&self) -> u64 {
        0
    }

    /// Commit (`success`) or roll back what is still pending.
    fn finalize(&mut self, success: bool) -> Result<()>;
}

struct Connections {
    left: Arc<dyn Connection>,
    right: Arc<dyn Connection>,
}

impl Connections {
    fn from_session(session: &Session) -> Self {
        Self {
            left: Arc::clone(session.left()),
            right: Arc::clone(session.right()),
        }
    }

    fn get(&self, side: Side) -> &Arc<dyn Connection> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

/// Writes go straight to the database in autocommit mode.
pub struct DefaultCommitter {
    connections: Connections,
}

impl DefaultCommitter {
    pub fn new(session: &Session) -> Self {
        Self {
            connections: Connections::from_session(session),
        }
    }
}

impl Committer for DefaultCommitter {
    fn insert_record(&mut self, side: Side, table: &str, values: &Row) -> Result<()> {
        self.connections.get(side).insert(table, values)
    }

    fn update_record(
        &mut self,
        side: Side,
        table: &str,
        values: &Row,
        old_key: Option<&Row>,
    ) -> Result<u64> {
        self.connections.get(side).update(table, values, old_key)
    }

    fn delete_record(&mut self, side: Side, table: &str, key: &Row) -> Result<u64> {
        self.connections.get(side).delete(table, key)
    }

    fn finalize(&mut self, _success: bool) -> Result<()> {
        Ok(())
    }
}

/// Keeps a transaction open on both databases and commits every
/// `commit_frequency` writes.
pub struct BufferedCommitter {
    connections: Connections,
    commit_frequency: usize,
    change_counter: usize,
    new_transaction: bool,
    transactions: u64,
    open: bool,
}

impl BufferedCommitter {
    pub fn new(session: &Session, commit_frequency: usize) -> Result<Self> {
        let mut committer = Self {
            connections: Connections::from_session(session),
            commit_frequency: commit_frequency.max(1),
            change_counter: 0,
            new_transaction: false,
            transactions: 0,
            open: false,
        };
        committer.begin_db_transactions()?;
        Ok(committer)
    }

    fn begin_db_transactions(&mut self) -> Result<()> {
        for side in [Side::Left, Side::Right] {
            self.connections
                .get(side)
                .begin_transaction()
                .with_context(|| format!("Failed to begin transaction on {} database", side))?;
        }
        self.transactions += 1;
        self.open = true;
        Ok(())
    }

    fn commit_db_transactions(&mut self) -> Result<()> {
        self.open = false;
        for side in [Side::Left, Side::Right] {
            self.connections
                .get(side)
                .commit()
                .with_context(|| format!("Failed to commit {} database", side))?;
        }
        Ok(())
    }

    fn rollback_db_transactions(&mut self) -> Result<()> {
        self.open = false;
        let mut first_error = None;
        for side in [Side::Left, Side::Right] {
            if let Err(e) = self.connections.get(side).rollback() {
                tracing::warn!("Failed to roll back {} database: {}", side, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn commit_if_required(&mut self) -> Result<()> {
        self.change_counter += 1;
        self.new_transaction = false;
        if self.change_counter >= self.commit_frequency {
            tracing::debug!("Committing {} buffered writes", self.change_counter);
            self.change_counter = 0;
            self.commit_db_transactions()?;
            self.begin_db_transactions()?;
            self.new_transaction = true;
        }
        Ok(())
    }
}

impl Committer for BufferedCommitter {
    fn insert_record(&mut self, side: Side, table: &str, values: &Row) -> Result<()> {
        self.connections.get(side).insert(table, values)?;
        self.commit_if_required()
    }

    fn update_record(
        &mut self,
        side: Side,
        table: &str,
        values: &Row,
        old_key: Option<&Row>,
    ) -> Result<u64> {
        let updated = self.connections.get(side).update(table, values, old_key)?;
        self.commit_if_required()?;
        Ok(updated)
    }

    fn delete_record(&mut self, side: Side, table: &str, key: &Row) -> Result<u64> {
        let deleted = self.connections.get(side).delete(table, key)?;
        self.commit_if_required()?;
        Ok(deleted)
    }

    fn is_transactional(&self) -> bool {
        self.open
    }

    fn new_transaction(&self) -> bool {
        self.new_transaction
    }

    fn transaction_count(&self) -> u64 {
        self.transactions
    }

    fn finalize(&mut self, success: bool) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if success {
            self.commit_db_transactions()
        } else {
            self.rollback_db_transactions()
        }
    }
}

/// Committer of the configured kind.
pub fn committer_for(
    session: &Session,
    kind: CommitterKind,
    commit_frequency: usize,
) -> Result<Box<dyn Committer>> {
    match kind {
        CommitterKind::Default => Ok(Box::new(DefaultCommitter::new(session))),
        CommitterKind::Buffered => Ok(Box::new(BufferedCommitter::new(
            session,
            commit_frequency,
        )?)),
    }
}
