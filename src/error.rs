// ABOUTME: Error kinds callers need to tell apart during scans and replication
// ABOUTME: Everything else travels as anyhow::Error with attached context

use thiserror::Error;

/// Failure kinds with a defined handling policy.
///
/// Most functions in this crate return `anyhow::Result`. When a caller has to
/// react to a specific failure (stop retrying, rebuild a session, refuse to
/// start) the error is one of these variants and can be recovered with
/// `err.downcast_ref::<ReconcileError>()`.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Invalid or missing configuration. Raised at load or construction time,
    /// never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A table has no usable primary key, so it cannot be merge-joined.
    #[error("Table {0} doesn't have a primary key. Cannot scan or replicate.")]
    MissingPrimaryKey(String),

    /// A change log row carries an unknown change type.
    #[error("Invalid change type '{0}' in change log")]
    InvalidChangeType(String),

    /// A consumed change log row could not be removed from the log.
    ///
    /// Ignoring this would replay a phantom change, so it aborts the attempt.
    #[error("Failed to delete change log entry {id} from {table}")]
    ChangeLogDelete { table: String, id: i64 },

    /// The replicator used up its attempt budget for one difference.
    #[error("Replication of {table} [{key}] failed after {attempts} attempts: {reason}")]
    AttemptsExhausted {
        table: String,
        key: String,
        attempts: u32,
        reason: String,
    },

    /// The watchdog stopped a pass that stopped pinging.
    #[error("Task terminated after {0:?} without progress")]
    Terminated(std::time::Duration),

    /// The worker thread of a supervised task panicked.
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ReconcileError {
    /// Whether this error stems from configuration (and restarting will not help).
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ReconcileError::Config(_) | ReconcileError::MissingPrimaryKey(_)
        )
    }
}

/// Shorthand for `Err(ReconcileError::Config(..).into())`.
pub(crate) fn config_error<T>(message: impl Into<String>) -> anyhow::Result<T> {
    Err(ReconcileError::Config(message.into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_flagged() {
        assert!(ReconcileError::Config("bad".into()).is_config());
        assert!(ReconcileError::MissingPrimaryKey("users".into()).is_config());
        assert!(!ReconcileError::InvalidChangeType("X".into()).is_config());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Result<()> = config_error("proxy_block_size must be greater than 0");
        let err = err.unwrap_err();
        match err.downcast_ref::<ReconcileError>() {
            Some(ReconcileError::Config(msg)) => assert!(msg.contains("proxy_block_size")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_attempts_exhausted_message() {
        let err = ReconcileError::AttemptsExhausted {
            table: "users".into(),
            key: "id|1".into(),
            attempts: 2,
            reason: "update failed with target record for update vanished".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 2 attempts"));
        assert!(msg.contains("target record for update vanished"));
    }
}
