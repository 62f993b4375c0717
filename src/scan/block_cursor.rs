// ABOUTME: Block checksum cursor used by the proxied scan
// ABOUTME: Hashes runs of rows and caches row payloads for retrieval after a mismatch

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::comparator::rank_rows;
use crate::db::{Row, RowCursor};

/// Key and content hash of one row in a block.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChecksum {
    pub row_keys: Row,
    pub checksum: String,
}

/// Where a block ends.
#[derive(Debug, Clone, Copy)]
pub enum BlockLimit<'a> {
    /// After this many rows.
    Rows(usize),
    /// After the last row whose key is not greater than this row's key.
    UpTo(&'a Row),
}

/// Summary of one consumed block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Last row included in the block.
    pub max_row: Option<Row>,
    pub checksum: String,
    pub row_count: usize,
}

/// Wraps an ordered cursor and hashes consecutive blocks of its rows.
pub struct BlockCursor {
    cursor: Box<dyn RowCursor>,
    primary_key_names: Vec<String>,
    /// Row read past an `UpTo` boundary, returned first by the next read.
    pending_row: Option<Row>,
    digest: Sha256,
    row_checksums: Vec<RowChecksum>,
    row_cache: HashMap<String, Vec<u8>>,
    row_cache_bytes: usize,
    max_row_cache_bytes: usize,
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl BlockCursor {
    pub fn new(
        cursor: Box<dyn RowCursor>,
        primary_key_names: &[String],
        max_row_cache_bytes: usize,
    ) -> Self {
        Self {
            cursor,
            primary_key_names: primary_key_names.to_vec(),
            pending_row: None,
            digest: Sha256::new(),
            row_checksums: Vec::new(),
            row_cache: HashMap::new(),
            row_cache_bytes: 0,
            max_row_cache_bytes,
        }
    }

    pub fn has_next(&mut self) -> Result<bool> {
        if self.pending_row.is_some() {
            return Ok(true);
        }
        self.cursor.has_next()
    }

    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match self.pending_row.take() {
            Some(row) => Ok(Some(row)),
            None => self.cursor.next_row(),
        }
    }

    /// Per-row checksums of the last block, in key order.
    pub fn row_checksums(&self) -> &[RowChecksum] {
        &self.row_checksums
    }

    /// Row with the given checksum if its payload was cached.
    pub fn cached_row(&self, checksum: &str) -> Option<Row> {
        self.row_cache
            .get(checksum)
            .and_then(|payload| Row::from_payload(payload).ok())
    }

    pub fn is_cached(&self, checksum: &str) -> bool {
        self.row_cache.contains_key(checksum)
    }

    pub fn row_cache_bytes(&self) -> usize {
        self.row_cache_bytes
    }

    pub fn reset_cache(&mut self) {
        self.row_cache.clear();
        self.row_cache_bytes = 0;
    }

    fn reset_checksum(&mut self) {
        self.digest = Sha256::new();
        self.row_checksums.clear();
    }

    fn update_checksum(&mut self, row: &Row) {
        let payload = row.to_payload();
        let checksum = hex_digest(&payload);
        self.digest.update(checksum.as_bytes());
        self.row_checksums.push(RowChecksum {
            row_keys: row.key_subset(&self.primary_key_names),
            checksum: checksum.clone(),
        });
        // The cache only grows; once the budget is hit further rows are refetched.
        if self.row_cache_bytes + payload.len() <= self.max_row_cache_bytes {
            self.row_cache_bytes += payload.len();
            self.row_cache.insert(checksum, payload);
        }
    }

    /// Consume the next block and return its checksum.
    pub fn checksum(&mut self, limit: BlockLimit<'_>) -> Result<Block> {
        self.reset_checksum();
        let mut row_count = 0;
        let mut max_row = None;
        loop {
            if let BlockLimit::Rows(block_size) = limit {
                if row_count >= block_size {
                    break;
                }
            }
            let Some(row) = self.next_row()? else {
                break;
            };
            if let BlockLimit::UpTo(boundary) = limit {
                let rank = rank_rows(Some(&row), Some(boundary), &self.primary_key_names)?;
                if rank == Ordering::Greater {
                    self.pending_row = Some(row);
                    break;
                }
            }
            self.update_checksum(&row);
            row_count += 1;
            max_row = Some(row);
        }

        let digest = std::mem::replace(&mut self.digest, Sha256::new());
        Ok(Block {
            max_row,
            checksum: format!("{:x}", digest.finalize()),
            row_count,
        })
    }

    pub fn close(&mut self) {
        self.pending_row = None;
        self.cursor.close();
    }
}
