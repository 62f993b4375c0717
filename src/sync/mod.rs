// ABOUTME: One-shot table synchronization built on the table scanners
// ABOUTME: Differences are resolved by record and conflict handling policies

pub mod helper;
pub mod syncer;
pub mod table_sync;

use anyhow::Result;

use crate::scan::ScanDiff;

pub use helper::SyncHelper;
pub use syncer::{SyncOutcome, TwoWaySyncer};
pub use table_sync::{SyncStats, TableSync};

/// Caller supplied resolution of a scan difference.
///
/// Installed through `RecordHandling::Custom` or
/// `SyncConflictHandling::Custom`.
pub trait SyncHandler: Send + Sync {
    fn handle(&self, helper: &mut SyncHelper<'_>, diff: &ScanDiff) -> Result<()>;
}
