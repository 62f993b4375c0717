// ABOUTME: Two-way syncer resolving scan differences per the record and conflict handling options
// ABOUTME: One-sided rows are inserted or deleted, conflicts overwritten by the winning side

use anyhow::Result;

use super::helper::SyncHelper;
use crate::config::{should_log_outcome, RecordHandling, SyncConflictHandling};
use crate::scan::ScanDiff;
use crate::session::Side;

/// What happened to a scan difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Ignored,
    Inserted,
    Deleted,
    LeftWon,
    RightWon,
    Handled,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOutcome::Ignored => "ignored",
            SyncOutcome::Inserted => "inserted",
            SyncOutcome::Deleted => "deleted",
            SyncOutcome::LeftWon => "left_won",
            SyncOutcome::RightWon => "right_won",
            SyncOutcome::Handled => "handled",
        }
    }
}

/// Applies scan differences in both directions.
#[derive(Debug, Default)]
pub struct TwoWaySyncer;

impl TwoWaySyncer {
    pub fn new() -> Self {
        Self
    }

    /// Resolve one difference and log the outcome if configured.
    pub fn sync_difference(
        &self,
        helper: &mut SyncHelper<'_>,
        diff: &ScanDiff,
    ) -> Result<SyncOutcome> {
        let options = helper.options();
        let outcome = match diff {
            ScanDiff::Left(row) | ScanDiff::Right(row) => {
                let side = match diff {
                    ScanDiff::Left(_) => Side::Left,
                    _ => Side::Right,
                };
                let handling = match side {
                    Side::Left => &options.left_record_handling,
                    Side::Right => &options.right_record_handling,
                };
                match handling {
                    RecordHandling::Ignore => SyncOutcome::Ignored,
                    RecordHandling::Insert => {
                        helper.insert_record(side.other(), row)?;
                        SyncOutcome::Inserted
                    }
                    RecordHandling::Delete => {
                        helper.delete_record(side, row)?;
                        SyncOutcome::Deleted
                    }
                    RecordHandling::Custom(handler) => {
                        handler.handle(helper, diff)?;
                        SyncOutcome::Handled
                    }
                }
            }
            ScanDiff::Conflict { left, right } => match &options.sync_conflict_handling {
                SyncConflictHandling::Ignore => SyncOutcome::Ignored,
                SyncConflictHandling::LeftWins => {
                    helper.update_record(Side::Right, left)?;
                    SyncOutcome::LeftWon
                }
                SyncConflictHandling::RightWins => {
                    helper.update_record(Side::Left, right)?;
                    SyncOutcome::RightWon
                }
                SyncConflictHandling::Custom(handler) => {
                    handler.handle(helper, diff)?;
                    SyncOutcome::Handled
                }
            },
        };

        let conflict = matches!(diff, ScanDiff::Conflict { .. });
        if should_log_outcome(
            &options.logged_sync_events,
            conflict,
            outcome == SyncOutcome::Ignored,
        ) {
            helper.log_sync_outcome(diff, outcome.as_str(), None)?;
        }
        Ok(outcome)
    }
}
