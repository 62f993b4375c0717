// ABOUTME: Row comparator ranking two rows by primary key for ordered merges
// ABOUTME: Text keys follow database collation order, not Rust's byte order

use anyhow::{bail, Result};
use std::cmp::Ordering;

use crate::db::{Row, Value};

/// Compare two text key values the way typical database collations order them.
///
/// Case-insensitive first; on a tie the case-sensitive comparison is
/// reversed, so "a" sorts before "A" (the opposite of byte order). The SQLite
/// adapter registers this function as its key collation so cursor order and
/// merge order agree.
pub fn compare_text(left: &str, right: &str) -> Ordering {
    let lower_left = left.to_lowercase();
    let lower_right = right.to_lowercase();
    match lower_left.cmp(&lower_right) {
        Ordering::Equal => right.cmp(left),
        other => other,
    }
}

/// Compare a single key value pair.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Text(l), Value::Text(r)) => compare_text(l, r),
        (l, r) => l.natural_cmp(r),
    }
}

/// Rank two rows by their primary key columns.
///
/// A missing right row means the left row is only present on the left
/// (`Less`); a missing left row ranks `Greater`. The first key column that
/// differs decides. Passing two missing rows is an error.
pub fn rank_rows(
    left_row: Option<&Row>,
    right_row: Option<&Row>,
    primary_key_names: &[String],
) -> Result<Ordering> {
    let (left, right) = match (left_row, right_row) {
        (None, None) => bail!("At least one of left_row and right_row must not be nil"),
        (Some(_), None) => return Ok(Ordering::Less),
        (None, Some(_)) => return Ok(Ordering::Greater),
        (Some(l), Some(r)) => (l, r),
    };

    for key in primary_key_names {
        let l = left.get(key).unwrap_or(&Value::Null);
        let r = right.get(key).unwrap_or(&Value::Null);
        let rank = compare_values(l, r);
        if rank != Ordering::Equal {
            return Ok(rank);
        }
    }
    Ok(Ordering::Equal)
}

/// Express an ordering as -1 / 0 / 1.
pub fn ordering_sign(ordering: Ordering) -> i32 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Vec<String> {
        vec!["first_id".to_string(), "second_id".to_string()]
    }

    fn row(first: impl Into<Value>, second: impl Into<Value>) -> Row {
        Row::new()
            .with("first_id", first)
            .with("second_id", second)
            .with("name", "whatever")
    }

    #[test]
    fn test_missing_rows() {
        let r = row(1, 1);
        assert_eq!(
            rank_rows(Some(&r), None, &key()).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            rank_rows(None, Some(&r), &key()).unwrap(),
            Ordering::Greater
        );
        assert!(rank_rows(None, None, &key()).is_err());
    }

    #[test]
    fn test_first_differing_column_decides() {
        assert_eq!(
            rank_rows(Some(&row(1, 9)), Some(&row(2, 1)), &key()).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            rank_rows(Some(&row(2, 1)), Some(&row(2, 0)), &key()).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            rank_rows(Some(&row(2, 1)), Some(&row(2, 1)), &key()).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_non_key_columns_are_ignored() {
        let a = row(1, 1).with("name", "a");
        let b = row(1, 1).with("name", "b");
        assert_eq!(rank_rows(Some(&a), Some(&b), &key()).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_text_follows_database_collation() {
        assert_eq!(compare_text("a", "B"), Ordering::Less);
        assert_eq!(compare_text("B", "a"), Ordering::Greater);
        // lowercase before uppercase on a case-insensitive tie
        assert_eq!(compare_text("a", "A"), Ordering::Less);
        assert_eq!(compare_text("A", "a"), Ordering::Greater);
        assert_eq!(compare_text("abc", "abc"), Ordering::Equal);

        let k = vec!["name".to_string()];
        let lower = Row::new().with("name", "x");
        let upper = Row::new().with("name", "X");
        assert_eq!(
            ordering_sign(rank_rows(Some(&lower), Some(&upper), &k).unwrap()),
            -1
        );
    }
}
