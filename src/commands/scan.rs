// ABOUTME: Scan command comparing configured table pairs
// ABOUTME: Prints a per-table summary, optionally every difference as JSON

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::Path;

use super::{open_session, row_spinner};
use crate::scan::{scanner_for, ScanSummaryReporter};

/// Scan `tables` (all configured tables when empty) and report differences.
pub fn scan(config_path: &Path, details: bool, tables: &[String]) -> Result<()> {
    let session = open_session(config_path)?;
    let tables = session.config().select_tables(tables)?;
    if tables.is_empty() {
        tracing::warn!("No tables configured; nothing to scan");
        return Ok(());
    }

    let stdout = io::stdout();
    let mut reporter = ScanSummaryReporter::new(stdout.lock(), details);
    reporter.header()?;
    for table in &tables {
        let mut scanner = scanner_for(&session, &table.left)
            .with_context(|| format!("Failed to prepare scan of {}", table.left))?;
        reporter.scanning(scanner.left_table(), scanner.right_table());
        let bar = row_spinner(&table.left);
        let result = scanner.run(&mut |rows| bar.inc(rows), &mut |diff| {
            reporter.report_difference(&diff)
        });
        bar.finish_and_clear();
        result.with_context(|| format!("Failed to scan table {}", table.left))?;
        reporter.scanning_finished()?;
    }

    let total: u64 = reporter.summaries().iter().map(|s| s.total()).sum();
    reporter.into_inner().flush()?;
    tracing::info!(
        "Scanned {} tables, {} differences",
        tables.len(),
        total
    );
    Ok(())
}
