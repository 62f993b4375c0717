// ABOUTME: Scan summary reporter counting differences per table pair
// ABOUTME: Optionally prints every difference as a JSON line

use anyhow::{Context, Result};
use std::io::Write;

use super::{DiffType, ScanDiff};

/// Difference counts of one scanned table pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub left_table: String,
    pub right_table: String,
    pub left: u64,
    pub right: u64,
    pub conflict: u64,
}

impl ScanSummary {
    pub fn total(&self) -> u64 {
        self.left + self.right + self.conflict
    }
}

/// Prints one summary line per table, plus each difference with `details`.
pub struct ScanSummaryReporter<W: Write> {
    out: W,
    details: bool,
    current: Option<ScanSummary>,
    finished: Vec<ScanSummary>,
}

impl<W: Write> ScanSummaryReporter<W> {
    pub fn new(out: W, details: bool) -> Self {
        Self {
            out,
            details,
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn scanning(&mut self, left_table: &str, right_table: &str) {
        self.current = Some(ScanSummary {
            left_table: left_table.to_string(),
            right_table: right_table.to_string(),
            ..Default::default()
        });
    }

    pub fn report_difference(&mut self, diff: &ScanDiff) -> Result<()> {
        if let Some(summary) = self.current.as_mut() {
            match diff.diff_type() {
                DiffType::Left => summary.left += 1,
                DiffType::Right => summary.right += 1,
                DiffType::Conflict => summary.conflict += 1,
            }
        }
        if self.details {
            let json = serde_json::to_string(diff).context("Failed to serialize difference")?;
            writeln!(self.out, "{}", json)?;
        }
        Ok(())
    }

    /// Print the summary line of the current table.
    pub fn scanning_finished(&mut self) -> Result<()> {
        let Some(summary) = self.current.take() else {
            return Ok(());
        };
        let name = if summary.left_table == summary.right_table {
            summary.left_table.clone()
        } else {
            format!("{} / {}", summary.left_table, summary.right_table)
        };
        writeln!(
            self.out,
            "{:<40} {:>8} {:>8} {:>8}",
            name, summary.left, summary.right, summary.conflict
        )?;
        self.finished.push(summary);
        Ok(())
    }

    pub fn header(&mut self) -> Result<()> {
        writeln!(
            self.out,
            "{:<40} {:>8} {:>8} {:>8}",
            "table", "left", "right", "conflict"
        )?;
        Ok(())
    }

    pub fn summaries(&self) -> &[ScanSummary] {
        &self.finished
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
