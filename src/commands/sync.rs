// ABOUTME: Sync command making configured table pairs identical
// ABOUTME: Each table is scanned and its differences resolved in its own transaction

use anyhow::Result;
use std::path::Path;

use super::{open_session, row_spinner};
use crate::sync::TableSync;

/// Sync `tables` (all configured tables when empty).
pub fn sync(config_path: &Path, tables: &[String]) -> Result<()> {
    let session = open_session(config_path)?;
    let tables = session.config().select_tables(tables)?;
    if tables.is_empty() {
        tracing::warn!("No tables configured; nothing to sync");
        return Ok(());
    }

    for table in &tables {
        let bar = row_spinner(&table.left);
        let result = TableSync::new(&session, &table.left).run(&mut |rows| bar.inc(rows));
        bar.finish_and_clear();
        let stats = result?;
        println!(
            "{}: {} differences, {} written, {} ignored",
            stats.left_table, stats.differences, stats.written, stats.ignored
        );
    }
    Ok(())
}
