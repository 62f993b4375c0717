// ABOUTME: Replication difference pairing the oldest pending change with the other side
// ABOUTME: Classifies the pair as left, right, conflict or no_diff

use anyhow::Result;
use serde::Serialize;
use std::fmt;

use super::loader::LoggedChangeLoaders;
use super::logged_change::{ChangeType, LoggedChange};
use crate::session::{Session, Side};

/// Kind of a replication difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDiffType {
    Left,
    Right,
    Conflict,
    NoDiff,
}

impl ReplicationDiffType {
    /// Classification of a pair of net change types.
    pub fn classify(left: ChangeType, right: ChangeType) -> Self {
        match (left, right) {
            (ChangeType::NoChange, ChangeType::NoChange) => ReplicationDiffType::NoDiff,
            (_, ChangeType::NoChange) => ReplicationDiffType::Left,
            (ChangeType::NoChange, _) => ReplicationDiffType::Right,
            (ChangeType::Delete, ChangeType::Delete) => ReplicationDiffType::NoDiff,
            _ => ReplicationDiffType::Conflict,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplicationDiffType::Left => "left",
            ReplicationDiffType::Right => "right",
            ReplicationDiffType::Conflict => "conflict",
            ReplicationDiffType::NoDiff => "no_diff",
        }
    }

    /// The changed side of a one-sided difference.
    pub fn source_side(self) -> Option<Side> {
        match self {
            ReplicationDiffType::Left => Some(Side::Left),
            ReplicationDiffType::Right => Some(Side::Right),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationDiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The changes of one logical record on both sides.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationDifference {
    #[serde(rename = "type")]
    diff_type: ReplicationDiffType,
    left: LoggedChange,
    right: LoggedChange,
    #[serde(skip)]
    loaded: bool,
}

impl ReplicationDifference {
    pub fn new(key_sep: &str) -> Self {
        Self {
            diff_type: ReplicationDiffType::NoDiff,
            left: LoggedChange::new(key_sep),
            right: LoggedChange::new(key_sep),
            loaded: false,
        }
    }

    pub fn diff_type(&self) -> ReplicationDiffType {
        self.diff_type
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn change(&self, side: Side) -> &LoggedChange {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn change_mut(&mut self, side: Side) -> &mut LoggedChange {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn left_change(&self) -> &LoggedChange {
        &self.left
    }

    pub fn right_change(&self) -> &LoggedChange {
        &self.right
    }

    /// Left table of the difference.
    pub fn table(&self) -> &str {
        &self.left.table
    }

    /// Change key of the record, taken from the side that changed first.
    pub fn key_string(&self) -> &str {
        if self.left.change_type() != ChangeType::NoChange {
            self.left.key_string()
        } else {
            self.right.key_string()
        }
    }

    /// Load the next difference.
    ///
    /// The side with the strictly older oldest change (left on ties) is
    /// resolved first; the same record is then resolved on the other side.
    /// Returns `false` when neither cache holds a pending change.
    pub fn load(&mut self, session: &Session, loaders: &mut LoggedChangeLoaders) -> Result<bool> {
        let left_time = loaders.loader(Side::Left).oldest_change_time();
        let right_time = loaders.loader(Side::Right).oldest_change_time();
        let oldest = match (left_time, right_time) {
            (None, None) => return Ok(false),
            (Some(_), None) => Side::Left,
            (None, Some(_)) => Side::Right,
            (Some(l), Some(r)) => {
                if r < l {
                    Side::Right
                } else {
                    Side::Left
                }
            }
        };
        let other = oldest.other();

        self.change_mut(oldest).load_oldest(loaders.loader(oldest))?;
        let first = self.change(oldest);
        if !first.table.is_empty() {
            let table = session.corresponding_table(oldest, &first.table);
            let key = first.key_string().to_string();
            self.change_mut(other)
                .load_specified(loaders.loader(other), &table, &key)?;
        }
        self.diff_type =
            ReplicationDiffType::classify(self.left.change_type(), self.right.change_type());
        self.loaded = true;
        Ok(true)
    }

    /// Pick up changes logged since the difference was loaded.
    pub fn amend(&mut self, loaders: &mut LoggedChangeLoaders) -> Result<()> {
        loaders.update(false)?;
        self.left.load(loaders.loader(Side::Left))?;
        self.right.load(loaders.loader(Side::Right))?;
        self.diff_type =
            ReplicationDiffType::classify(self.left.change_type(), self.right.change_type());
        Ok(())
    }

    /// JSON form stored in the event log.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChangeType::*;

    #[test]
    fn test_classification_table() {
        let cases = [
            (NoChange, NoChange, ReplicationDiffType::NoDiff),
            (Insert, NoChange, ReplicationDiffType::Left),
            (Delete, NoChange, ReplicationDiffType::Left),
            (NoChange, Update, ReplicationDiffType::Right),
            (Delete, Delete, ReplicationDiffType::NoDiff),
            (Insert, Insert, ReplicationDiffType::Conflict),
            (Update, Delete, ReplicationDiffType::Conflict),
            (Delete, Insert, ReplicationDiffType::Conflict),
        ];
        for (left, right, expected) in cases {
            assert_eq!(
                ReplicationDiffType::classify(left, right),
                expected,
                "{} / {}",
                left,
                right
            );
        }
    }

    #[test]
    fn test_source_side() {
        assert_eq!(ReplicationDiffType::Left.source_side(), Some(Side::Left));
        assert_eq!(ReplicationDiffType::Conflict.source_side(), None);
    }
}
