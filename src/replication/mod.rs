// ABOUTME: Trigger-based two-way replication driven by per-side change logs
// ABOUTME: Loads pending changes, pairs them into differences and applies them

pub mod difference;
pub mod helper;
pub mod loader;
pub mod logged_change;
pub mod replicator;
pub mod run;
pub mod runner;
pub mod sweeper;

use anyhow::Result;

pub use difference::{ReplicationDiffType, ReplicationDifference};
pub use helper::ReplicationHelper;
pub use loader::{ChangeLogEntry, LoggedChangeLoader, LoggedChangeLoaders};
pub use logged_change::{ChangeType, LoggedChange};
pub use replicator::{Outcome, TwoWayReplicator};
pub use run::{run_pass, ReplicationRun, RunStats};
pub use runner::ReplicationRunner;
pub use sweeper::{SweeperHandle, TaskSweeper};

/// Caller supplied resolution of a replication difference.
///
/// Installed through `ChangeHandling::Custom` or `ConflictHandling::Custom`.
/// Writes made through the helper take part in the pass's transaction.
pub trait ReplicationHandler: Send + Sync {
    fn handle(&self, helper: &mut ReplicationHelper<'_>, diff: &ReplicationDifference)
        -> Result<()>;
}
