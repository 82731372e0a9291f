//! Error types shared across the crate.

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job changeset was rejected before touching the database.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An acknowledgement (complete/discard/error/snooze) raced a state
    /// change and found the job no longer `executing`.
    #[error("job {id} is not executing (currently {state})")]
    NotExecuting { id: i64, state: String },

    /// No worker is registered under the name carried by a job.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// A notification payload exceeded the transport's size limit.
    #[error("notification payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is worth retrying at the store layer.
    ///
    /// Covers transient backend failures (connection drops, pool timeouts,
    /// serialization conflicts). Validation and state-machine errors are
    /// never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Io(_)) => true,
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            Error::Database(sqlx::Error::Database(db)) => {
                // 40001 serialization_failure, 40P01 deadlock_detected
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}
