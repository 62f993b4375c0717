// ABOUTME: Syncs one table pair by scanning it and resolving every difference
// ABOUTME: Writes are committed when the table completes and rolled back on failure

use anyhow::{Context, Result};

use super::helper::SyncHelper;
use super::syncer::{SyncOutcome, TwoWaySyncer};
use crate::scan::{scanner_for, TableScan};
use crate::session::Session;

/// Counters of one synced table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub left_table: String,
    pub right_table: String,
    pub differences: u64,
    pub ignored: u64,
    pub written: u64,
}

/// Sync of one table pair.
pub struct TableSync<'a> {
    session: &'a Session,
    left_table: String,
}

impl<'a> TableSync<'a> {
    pub fn new(session: &'a Session, left_table: &str) -> Self {
        Self {
            session,
            left_table: left_table.to_string(),
        }
    }

    pub fn run(&self, progress: &mut dyn FnMut(u64)) -> Result<SyncStats> {
        let primary_key_names = self.session.primary_key_names(&self.left_table)?;
        let helper = SyncHelper::new(self.session, &self.left_table, primary_key_names)?;
        let scan = scanner_for(self.session, &self.left_table)?;
        self.run_with(scan, helper, progress)
    }

    /// Sync using an explicit scanner and helper.
    pub fn run_with(
        &self,
        mut scan: Box<dyn TableScan>,
        mut helper: SyncHelper<'_>,
        progress: &mut dyn FnMut(u64),
    ) -> Result<SyncStats> {
        let syncer = TwoWaySyncer::new();
        let mut stats = SyncStats {
            left_table: scan.left_table().to_string(),
            right_table: scan.right_table().to_string(),
            ..Default::default()
        };
        tracing::info!("Syncing {} / {}", stats.left_table, stats.right_table);

        let result = scan.run(progress, &mut |diff| {
            stats.differences += 1;
            match syncer.sync_difference(&mut helper, &diff)? {
                SyncOutcome::Ignored => stats.ignored += 1,
                _ => stats.written += 1,
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                helper.finalize(true)?;
                tracing::info!(
                    "Synced {}: {} differences, {} written, {} ignored",
                    stats.left_table,
                    stats.differences,
                    stats.written,
                    stats.ignored
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(rollback_error) = helper.finalize(false) {
                    tracing::warn!("Rollback of {} failed: {:#}", stats.left_table, rollback_error);
                }
                Err(e).with_context(|| format!("Failed to sync table {}", self.left_table))
            }
        }
    }
}
