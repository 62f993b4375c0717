// ABOUTME: Two-way replicator applying one difference according to the handling options
// ABOUTME: Failed writes roll back to a savepoint, reload the difference and retry

use anyhow::{anyhow, bail, Result};
use std::fmt;

use super::difference::{ReplicationDiffType, ReplicationDifference};
use super::helper::ReplicationHelper;
use super::loader::LoggedChangeLoaders;
use super::logged_change::ChangeType;
use crate::config::{should_log_outcome, ChangeHandling, ConflictHandling};
use crate::db::Row;
use crate::error::ReconcileError;
use crate::session::Side;

/// What happened to a difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Replicated,
    LeftWon,
    RightWon,
    Handled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ignored => "ignored",
            Outcome::Replicated => "replicated",
            Outcome::LeftWon => "left_won",
            Outcome::RightWon => "right_won",
            Outcome::Handled => "handled",
        }
    }

    fn won_by(side: Side) -> Self {
        match side {
            Side::Left => Outcome::LeftWon,
            Side::Right => Outcome::RightWon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// One write derived from a difference: copy (or remove) the record
/// identified by `source_key` on `source` into the target side.
#[derive(Debug)]
struct ChangePlan {
    action: Action,
    source: Side,
    source_table: String,
    source_key: Row,
    target_table: String,
    target_key: Row,
    outcome: Outcome,
}

impl ChangePlan {
    fn target(&self) -> Side {
        self.source.other()
    }
}

/// Applies replication differences in both directions.
#[derive(Debug, Default)]
pub struct TwoWayReplicator;

impl TwoWayReplicator {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `diff` according to the options of its table.
    ///
    /// `remaining_attempts` bounds how often a failed write is retried after
    /// reloading the difference; at zero the difference fails with
    /// `ReconcileError::AttemptsExhausted` carrying `previous_failure`.
    pub fn replicate_difference(
        &self,
        helper: &mut ReplicationHelper<'_>,
        diff: &mut ReplicationDifference,
        loaders: &mut LoggedChangeLoaders,
        remaining_attempts: u32,
        previous_failure: Option<String>,
    ) -> Result<()> {
        let table = diff.table().to_string();
        let options = helper.options_for_table(&table);
        if remaining_attempts == 0 {
            return Err(ReconcileError::AttemptsExhausted {
                table,
                key: diff.key_string().to_string(),
                attempts: options.replication_attempts,
                reason: previous_failure.unwrap_or_else(|| "no attempts left".to_string()),
            }
            .into());
        }

        match diff.diff_type() {
            ReplicationDiffType::NoDiff => Ok(()),
            ReplicationDiffType::Left | ReplicationDiffType::Right => {
                let source = match diff.diff_type() {
                    ReplicationDiffType::Left => Side::Left,
                    _ => Side::Right,
                };
                let handling = match source {
                    Side::Left => &options.left_change_handling,
                    Side::Right => &options.right_change_handling,
                };
                match handling {
                    ChangeHandling::Ignore => self.log_outcome(helper, diff, Outcome::Ignored),
                    ChangeHandling::Replicate => {
                        self.replicate_change(helper, diff, loaders, source, remaining_attempts)
                    }
                    ChangeHandling::Custom(handler) => {
                        handler.handle(helper, diff)?;
                        self.log_outcome(helper, diff, Outcome::Handled)
                    }
                }
            }
            ReplicationDiffType::Conflict => match &options.replication_conflict_handling {
                ConflictHandling::Ignore => self.log_outcome(helper, diff, Outcome::Ignored),
                ConflictHandling::LeftWins => {
                    self.clear_conflict(helper, diff, loaders, Side::Left, remaining_attempts)
                }
                ConflictHandling::RightWins => {
                    self.clear_conflict(helper, diff, loaders, Side::Right, remaining_attempts)
                }
                ConflictHandling::LaterWins => {
                    let winner = if diff.left_change().last_changed_at()
                        >= diff.right_change().last_changed_at()
                    {
                        Side::Left
                    } else {
                        Side::Right
                    };
                    self.clear_conflict(helper, diff, loaders, winner, remaining_attempts)
                }
                ConflictHandling::EarlierWins => {
                    let winner = if diff.left_change().last_changed_at()
                        <= diff.right_change().last_changed_at()
                    {
                        Side::Left
                    } else {
                        Side::Right
                    };
                    self.clear_conflict(helper, diff, loaders, winner, remaining_attempts)
                }
                ConflictHandling::Custom(handler) => {
                    handler.handle(helper, diff)?;
                    self.log_outcome(helper, diff, Outcome::Handled)
                }
            },
        }
    }

    /// Carry a one-sided change over to the other database.
    fn replicate_change(
        &self,
        helper: &mut ReplicationHelper<'_>,
        diff: &mut ReplicationDifference,
        loaders: &mut LoggedChangeLoaders,
        source: Side,
        remaining_attempts: u32,
    ) -> Result<()> {
        let change = diff.change(source);
        let source_table = change.table.clone();
        let target_table = helper
            .session()
            .corresponding_table(source, &source_table);
        let (action, source_key, target_key) = match change.change_type() {
            ChangeType::Insert => (Action::Insert, change.key(), change.key()),
            ChangeType::Update => (
                Action::Update,
                change.new_key().unwrap_or_else(|| change.key()),
                change.key(),
            ),
            ChangeType::Delete => (Action::Delete, change.key(), change.key()),
            ChangeType::NoChange => return Ok(()),
        };
        let plan = ChangePlan {
            action,
            source,
            source_table,
            source_key,
            target_table,
            target_key,
            outcome: Outcome::Replicated,
        };
        self.attempt_change(helper, diff, loaders, remaining_attempts, plan)
    }

    /// Make the loser's record match the winner's.
    ///
    /// A deleting winner deletes the loser's record; a winner that still has
    /// the record inserts it where the loser deleted it and updates it
    /// everywhere else.
    fn clear_conflict(
        &self,
        helper: &mut ReplicationHelper<'_>,
        diff: &mut ReplicationDifference,
        loaders: &mut LoggedChangeLoaders,
        winner: Side,
        remaining_attempts: u32,
    ) -> Result<()> {
        let winning = diff.change(winner);
        let losing = diff.change(winner.other());
        let action = match (winning.change_type(), losing.change_type()) {
            (ChangeType::Delete, _) => Action::Delete,
            (_, ChangeType::Delete) => Action::Insert,
            _ => Action::Update,
        };
        let plan = ChangePlan {
            action,
            source: winner,
            source_table: winning.table.clone(),
            source_key: winning.new_key().unwrap_or_else(|| winning.key()),
            target_table: losing.table.clone(),
            target_key: losing.new_key().unwrap_or_else(|| losing.key()),
            outcome: Outcome::won_by(winner),
        };
        self.attempt_change(helper, diff, loaders, remaining_attempts, plan)
    }

    /// Run one write inside a savepoint.
    ///
    /// On failure the savepoint is rolled back, the difference reloaded and
    /// the whole difference replicated again with one attempt less.
    fn attempt_change(
        &self,
        helper: &mut ReplicationHelper<'_>,
        diff: &mut ReplicationDifference,
        loaders: &mut LoggedChangeLoaders,
        remaining_attempts: u32,
        plan: ChangePlan,
    ) -> Result<()> {
        let target = plan.target();
        let savepoint = helper.savepoint(
            target,
            &format!("rr_{}_{}", plan.action, remaining_attempts),
        )?;
        match self.apply(helper, &plan) {
            Ok(()) => {
                helper.release_savepoint(&savepoint)?;
                self.log_outcome(helper, diff, plan.outcome)
            }
            Err(e) => {
                tracing::debug!(
                    "{} of {} [{}] failed ({} attempts left): {:#}",
                    plan.action,
                    plan.target_table,
                    diff.key_string(),
                    remaining_attempts - 1,
                    e
                );
                helper.rollback_to_savepoint(&savepoint)?;
                diff.amend(loaders)?;
                self.replicate_difference(
                    helper,
                    diff,
                    loaders,
                    remaining_attempts - 1,
                    Some(format!("{} failed with {:#}", plan.action, e)),
                )
            }
        }
    }

    fn apply(&self, helper: &mut ReplicationHelper<'_>, plan: &ChangePlan) -> Result<()> {
        let target = plan.target();
        match plan.action {
            Action::Insert => {
                let values = helper
                    .load_record(plan.source, &plan.source_table, &plan.source_key)?
                    .ok_or_else(|| anyhow!("source record for insert vanished"))?;
                helper.insert_record(target, &plan.target_table, &values)
            }
            Action::Update => {
                let values = helper
                    .load_record(plan.source, &plan.source_table, &plan.source_key)?
                    .ok_or_else(|| anyhow!("source record for update vanished"))?;
                let updated = helper.update_record(
                    target,
                    &plan.target_table,
                    &values,
                    Some(&plan.target_key),
                )?;
                if updated == 0 {
                    bail!("target record for update vanished");
                }
                Ok(())
            }
            Action::Delete => {
                let deleted = helper.delete_record(target, &plan.target_table, &plan.target_key)?;
                if deleted == 0 {
                    bail!("target record for delete vanished");
                }
                Ok(())
            }
        }
    }

    fn log_outcome(
        &self,
        helper: &ReplicationHelper<'_>,
        diff: &ReplicationDifference,
        outcome: Outcome,
    ) -> Result<()> {
        let options = helper.options_for_table(diff.table());
        let conflict = diff.diff_type() == ReplicationDiffType::Conflict;
        if should_log_outcome(
            &options.logged_replication_events,
            conflict,
            outcome == Outcome::Ignored,
        ) {
            helper.log_replication_outcome(diff, outcome.as_str(), None)?;
        }
        Ok(())
    }
}
