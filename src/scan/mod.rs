// ABOUTME: Table scanning: finds rows that differ between the left and right table
// ABOUTME: Direct merge-join and block-checksum (proxied) strategies share one interface

pub mod block_cursor;
pub mod comparator;
pub mod direct;
pub mod proxied;
pub mod report;

use anyhow::Result;
use serde::Serialize;
use std::fmt;

use crate::config::ScanMode;
use crate::db::Row;
use crate::session::{Session, Side};

pub use direct::DirectTableScan;
pub use proxied::ProxiedTableScan;
pub use report::ScanSummaryReporter;

/// Classification of a scan difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffType {
    Left,
    Right,
    Conflict,
}

impl DiffType {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffType::Left => "left",
            DiffType::Right => "right",
            DiffType::Conflict => "conflict",
        }
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One difference found by a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScanDiff {
    /// Row only present in the left table.
    Left(Row),
    /// Row only present in the right table.
    Right(Row),
    /// Same key on both sides, different content.
    Conflict { left: Row, right: Row },
}

impl ScanDiff {
    pub fn diff_type(&self) -> DiffType {
        match self {
            ScanDiff::Left(_) => DiffType::Left,
            ScanDiff::Right(_) => DiffType::Right,
            ScanDiff::Conflict { .. } => DiffType::Conflict,
        }
    }

    /// The row found on `side`, if any.
    pub fn row(&self, side: Side) -> Option<&Row> {
        match (self, side) {
            (ScanDiff::Left(row), Side::Left) | (ScanDiff::Right(row), Side::Right) => Some(row),
            (ScanDiff::Conflict { left, .. }, Side::Left) => Some(left),
            (ScanDiff::Conflict { right, .. }, Side::Right) => Some(right),
            _ => None,
        }
    }

    /// Primary key of the difference.
    pub fn key(&self, primary_key_names: &[String]) -> Row {
        match self {
            ScanDiff::Left(row) | ScanDiff::Right(row) => row.key_subset(primary_key_names),
            ScanDiff::Conflict { left, .. } => left.key_subset(primary_key_names),
        }
    }
}

/// A scan over one table pair.
pub trait TableScan {
    fn left_table(&self) -> &str;

    fn right_table(&self) -> &str;

    /// Run the scan, handing every difference to `sink` in key order.
    ///
    /// `progress` receives the number of rows consumed since its last call.
    fn run(
        &mut self,
        progress: &mut dyn FnMut(u64),
        sink: &mut dyn FnMut(ScanDiff) -> Result<()>,
    ) -> Result<()>;
}

/// Scanner for a left table, chosen by the table's `scan_mode`.
pub fn scanner_for(session: &Session, left_table: &str) -> Result<Box<dyn TableScan>> {
    let options = session.options_for_table(left_table);
    match options.scan_mode {
        ScanMode::Direct => Ok(Box::new(DirectTableScan::new(session, left_table)?)),
        ScanMode::Proxied => Ok(Box::new(ProxiedTableScan::new(session, left_table)?)),
    }
}

/// Run a scan and collect its differences.
pub fn collect_diffs(scan: &mut dyn TableScan) -> Result<Vec<ScanDiff>> {
    let mut diffs = Vec::new();
    scan.run(&mut |_| {}, &mut |diff| {
        diffs.push(diff);
        Ok(())
    })?;
    Ok(diffs)
}
