use std::time::Duration;

use thiserror::Error;

use crate::flag::FlagKey;

/// Rejected write intent. Never retried; surfaced to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("flag name must not be empty")]
    EmptyName,

    #[error("flag name exceeds 100 characters (got {0})")]
    NameTooLong(usize),

    #[error("environment must not be empty")]
    EmptyEnvironment,

    #[error("environment exceeds 50 characters (got {0})")]
    EnvironmentTooLong(usize),

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error("rollout must be between 0 and 100 (got {0})")]
    RolloutOutOfRange(u8),

    #[error("update intent carries no changes")]
    EmptyIntent,

    #[error("delete intent must not carry field changes")]
    DeleteWithChanges,
}

/// Fault at the durable storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage deadline of {0:?} exceeded")]
    Deadline(Duration),

    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Outcome of a write that did not commit.
///
/// `Conflict` is caller-retryable (re-read, rebuild the intent, try again).
/// `Unavailable` means the retry budget against durable storage is spent.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("version conflict on {key}: expected {expected:?}, current {current:?}")]
    Conflict {
        key: FlagKey,
        expected: Option<u64>,
        current: Option<u64>,
    },

    #[error("durable storage unavailable after {attempts} attempts: {source}")]
    Unavailable { attempts: u32, source: StorageError },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApplyError {
    /// True for the optimistic-concurrency outcome the caller is expected
    /// to handle by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyError::Conflict { .. })
    }
}

/// A change-feed subscriber asked for an offset older than the retained
/// window and must reload a full snapshot before resuming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error(
        "change feed no longer retains offset {requested}; oldest retained is {oldest_retained}"
    )]
    ResyncRequired { requested: u64, oldest_retained: u64 },
}
