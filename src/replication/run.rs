// ABOUTME: One replication pass draining both change logs under a liveness watchdog
// ABOUTME: Differences are loaded oldest first and handed to the two-way replicator

use anyhow::Result;
use std::sync::Arc;

use super::difference::{ReplicationDiffType, ReplicationDifference};
use super::helper::ReplicationHelper;
use super::loader::LoggedChangeLoaders;
use super::replicator::TwoWayReplicator;
use super::sweeper::{SweeperHandle, TaskSweeper};
use crate::error::ReconcileError;
use crate::session::Session;

/// Counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Differences that needed handling (no_diff excluded).
    pub differences: u64,
    /// Differences that ran out of attempts and were logged as failed.
    pub failed: u64,
    /// The watchdog stopped the pass early.
    pub terminated: bool,
}

/// A single replication pass over a session.
pub struct ReplicationRun {
    session: Arc<Session>,
}

impl ReplicationRun {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Run the pass on a worker thread supervised by the watchdog.
    pub fn run(&self) -> Result<RunStats> {
        let timeout = self.session.options().database_connection_timeout;
        let session = Arc::clone(&self.session);
        TaskSweeper::timeout(timeout, move |sweeper| {
            let helper = ReplicationHelper::new(&session)?;
            run_pass(&session, helper, &sweeper)
        })
    }
}

/// Drain the change logs of both sides.
///
/// The committer is finalized with success only when the pass completed
/// without being terminated. A difference that exhausts its attempts is
/// logged and skipped; any other error aborts the pass after its writes are
/// rolled back.
pub fn run_pass(
    session: &Session,
    mut helper: ReplicationHelper<'_>,
    sweeper: &SweeperHandle,
) -> Result<RunStats> {
    let mut stats = RunStats::default();
    let mut loaders = LoggedChangeLoaders::new(session);

    let outcome = drain_changes(session, &mut helper, &mut loaders, sweeper, &mut stats);

    match outcome {
        Ok(()) => {
            helper.finalize(!stats.terminated)?;
            if stats.terminated {
                tracing::warn!("Replication pass terminated; pending writes rolled back");
            }
            Ok(stats)
        }
        Err(PassError { diff, error: e }) => {
            if let Err(rollback_error) = helper.finalize(false) {
                tracing::warn!("Rollback after failed pass failed: {:#}", rollback_error);
            }
            if let Some(diff) = diff {
                // outside the rolled back transaction, so the audit row survives
                if let Err(log_error) = log_failure(&helper, &diff, &e) {
                    tracing::error!("Failed to log replication failure: {:#}", log_error);
                }
            }
            Err(e)
        }
    }
}

/// A failure that aborts the pass, with the difference it happened on.
struct PassError {
    diff: Option<ReplicationDifference>,
    error: anyhow::Error,
}

impl From<anyhow::Error> for PassError {
    fn from(error: anyhow::Error) -> Self {
        Self { diff: None, error }
    }
}

fn drain_changes(
    session: &Session,
    helper: &mut ReplicationHelper<'_>,
    loaders: &mut LoggedChangeLoaders,
    sweeper: &SweeperHandle,
    stats: &mut RunStats,
) -> std::result::Result<(), PassError> {
    let replicator = TwoWayReplicator::new();
    let key_sep = &session.options().key_sep;
    loaders.update(true)?;
    loop {
        sweeper.ping();
        loaders.update(false)?;
        let mut diff = ReplicationDifference::new(key_sep);
        if !diff.load(session, loaders)? {
            break;
        }
        if sweeper.is_terminated() {
            stats.terminated = true;
            break;
        }
        if diff.diff_type() == ReplicationDiffType::NoDiff {
            continue;
        }
        stats.differences += 1;
        let attempts = session.options_for_table(diff.table()).replication_attempts;
        let result = replicator.replicate_difference(helper, &mut diff, loaders, attempts, None);
        if let Err(error) = result {
            let exhausted = matches!(
                error.downcast_ref::<ReconcileError>(),
                Some(ReconcileError::AttemptsExhausted { .. })
            );
            if !exhausted {
                return Err(PassError {
                    diff: Some(diff),
                    error,
                });
            }
            stats.failed += 1;
            tracing::warn!("{:#}", error);
            if let Err(log_error) = log_failure(helper, &diff, &error) {
                tracing::error!("Failed to log replication failure: {:#}", log_error);
                return Err(error.into());
            }
        }
    }
    Ok(())
}

fn log_failure(
    helper: &ReplicationHelper<'_>,
    diff: &ReplicationDifference,
    error: &anyhow::Error,
) -> Result<()> {
    helper.log_replication_outcome(diff, &error.to_string(), Some(&format!("{:?}", error)))
}
