//! Error types for the Chorus core

use thiserror::Error;

use crate::types::{Collection, LocalId};

/// Main error type for Chorus core operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Remote write was rejected (validation or authorization failure).
    /// The local mutation is rolled back and never retried.
    #[error("Write rejected: {reason}")]
    WriteRejected {
        /// Server-supplied rejection reason
        reason: String,
    },

    /// The write path succeeded but no transaction id could be obtained.
    /// Ambiguous: the write may have committed. The pending mutation is kept
    /// until a feed event matches it by content or the long timeout fires.
    #[error("Correlation unavailable: commit log position could not be obtained")]
    CorrelationUnavailable,

    /// A pending mutation was never confirmed by the change feed within the
    /// timeout bound. It has been rolled back and may be re-applied by the user.
    #[error("Reconciliation timeout for local id {local_id}")]
    ReconciliationTimeout {
        /// The local entity whose mutation expired
        local_id: LocalId,
    },

    /// The feed position we tried to resume from has been compacted away.
    /// The local cache for the collection must be discarded and rebuilt
    /// from a full snapshot.
    #[error("Resync required for {collection}: resume position compacted")]
    ResyncRequired {
        /// The affected collection
        collection: Collection,
    },

    /// A presence expiry sweep could not complete. Never fatal; the next
    /// sweep retries.
    #[error("Presence sweep skipped: {reason}")]
    PresenceSweepSkipped {
        /// What went wrong
        reason: String,
    },

    /// Remote write endpoint unreachable
    #[error("Write unavailable: {0}")]
    WriteUnavailable(String),

    /// Remote write call exceeded its timeout bound
    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Mutation handle does not refer to a live pending mutation
    #[error("Unknown mutation: {collection}/{local_id}")]
    UnknownMutation {
        /// Collection the handle claimed
        collection: Collection,
        /// Local id the handle claimed
        local_id: LocalId,
    },

    /// A transaction id was already attached to this mutation
    #[error("Transaction already attached to {0}")]
    TransactionAlreadyAttached(LocalId),

    /// Payload variant does not match the collection it was submitted to
    #[error("Payload mismatch: {payload} payload submitted to {collection}")]
    PayloadMismatch {
        /// Collection the payload belongs to
        payload: Collection,
        /// Collection it was submitted to
        collection: Collection,
    },

    /// Commit log error (external storage engine)
    #[error("Commit log error: {0}")]
    CommitLog(#[from] CommitLogError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the external commit log
#[derive(Error, Debug)]
pub enum CommitLogError {
    /// The log cannot accept appends right now
    #[error("Commit log unavailable: {0}")]
    Unavailable(String),

    /// The log rejected the batch
    #[error("Commit log rejected batch: {0}")]
    Rejected(String),
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;
