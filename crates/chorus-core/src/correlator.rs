//! Transaction correlation for the durable write path.
//!
//! Every committed write must be observable in the change feed under a
//! transaction id the writer learned synchronously, otherwise the client
//! cannot match its optimistic mutation against the confirming feed row.
//! The [`TransactionCorrelator`] runs the caller's write inside one atomic
//! commit-log append, stamps every row of the batch with a freshly generated
//! [`TransactionId`], and hands the id back with the write result.
//!
//! One id per transaction: a multi-row commit produces one transaction id
//! shared by all of its rows, and one feed event per row. Ids are generated
//! under the commit lock, so they are monotonic within one log.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult, CommitLogError};
use crate::types::{Collection, FeedOperation, LogPosition, Payload, RowId, TransactionId};

/// One row change staged inside a commit batch
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRow {
    /// Collection the row belongs to
    pub collection: Collection,
    /// Server row key
    pub row_id: RowId,
    /// What happens to the row
    pub operation: FeedOperation,
    /// New payload (`None` for deletes)
    pub payload: Option<Payload>,
    /// Transaction id, stamped by the correlator before append
    pub transaction_id: Option<TransactionId>,
}

/// Rows staged by a `write_fn` before the atomic append
#[derive(Debug, Default)]
pub struct CommitBatch {
    rows: Vec<CommitRow>,
}

impl CommitBatch {
    /// Stage an insert or update
    pub fn put(&mut self, collection: Collection, row_id: RowId, payload: Payload) {
        let operation = if self
            .rows
            .iter()
            .any(|r| r.collection == collection && r.row_id == row_id)
        {
            FeedOperation::Update
        } else {
            FeedOperation::Insert
        };
        self.rows.push(CommitRow {
            collection,
            row_id,
            operation,
            payload: Some(payload),
            transaction_id: None,
        });
    }

    /// Stage an update of an existing row
    pub fn update(&mut self, collection: Collection, row_id: RowId, payload: Payload) {
        self.rows.push(CommitRow {
            collection,
            row_id,
            operation: FeedOperation::Update,
            payload: Some(payload),
            transaction_id: None,
        });
    }

    /// Stage a delete
    pub fn delete(&mut self, collection: Collection, row_id: RowId) {
        self.rows.push(CommitRow {
            collection,
            row_id,
            operation: FeedOperation::Delete,
            payload: None,
            transaction_id: None,
        });
    }

    /// Number of staged rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// External ordered commit log behind the change feed.
///
/// Implementations must append the whole batch atomically and return the
/// position the commit reached. The appended rows, transaction ids included,
/// must become visible to feed consumers exactly as given.
pub trait CommitLog: Send + Sync {
    /// Atomically append a batch, returning the commit's log position
    fn append(&self, rows: Vec<CommitRow>) -> Result<LogPosition, CommitLogError>;
}

/// Result of a correlated commit
#[derive(Debug)]
pub struct Tagged<T> {
    /// The write function's result
    pub result: T,
    /// Correlation token for the whole transaction
    pub transaction_id: TransactionId,
    /// Log position the commit reached
    pub position: LogPosition,
}

/// Binds logical writes to observable commit-log positions.
///
/// No retry policy lives here; a failed append surfaces immediately and the
/// caller decides. A [`CommitLogError`] after the write function ran means
/// the commit may have partially happened on the remote side — callers must
/// treat [`ChatError::CorrelationUnavailable`] as ambiguous.
pub struct TransactionCorrelator<L: CommitLog> {
    log: L,
    // Serializes commits; the generator keeps ids monotonic in log order
    // even within one millisecond.
    id_gen: Mutex<ulid::Generator>,
}

impl<L: CommitLog> TransactionCorrelator<L> {
    /// Create a correlator over the given commit log
    pub fn new(log: L) -> Self {
        Self {
            log,
            id_gen: Mutex::new(ulid::Generator::new()),
        }
    }

    /// Run `write_fn` inside one atomic commit and return its result
    /// together with the transaction id stamped on every committed row.
    pub fn commit_and_tag<T>(
        &self,
        write_fn: impl FnOnce(&mut CommitBatch) -> ChatResult<T>,
    ) -> ChatResult<Tagged<T>> {
        let mut batch = CommitBatch::default();
        let result = write_fn(&mut batch)?;

        let mut id_gen = self.id_gen.lock();
        let transaction_id = TransactionId(
            id_gen
                .generate()
                .unwrap_or_else(|_| ulid::Ulid::new()),
        );
        for row in &mut batch.rows {
            row.transaction_id = Some(transaction_id);
        }

        let position = match self.log.append(batch.rows) {
            Ok(position) => position,
            Err(CommitLogError::Unavailable(reason)) => {
                warn!(%transaction_id, %reason, "commit log unavailable, correlation lost");
                return Err(ChatError::CorrelationUnavailable);
            }
            Err(err) => return Err(err.into()),
        };

        debug!(%transaction_id, %position, "commit tagged");
        Ok(Tagged {
            result,
            transaction_id,
            position,
        })
    }

    /// Access the underlying log
    pub fn log(&self) -> &L {
        &self.log
    }
}

/// In-process commit log that fans committed rows out as feed events.
///
/// Reference implementation of the [`CommitLog`] contract and the feed
/// source used by the integration tests: appended rows become
/// [`FeedEvent`](crate::types::FeedEvent)s, one per row, with per-collection
/// positions, retrievable (and resumable) through [`MemoryLog::events_after`].
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

#[derive(Default)]
struct MemoryLogInner {
    next_position: std::collections::HashMap<Collection, LogPosition>,
    events: Vec<crate::types::FeedEvent>,
    /// Everything at or before this position (per collection) is compacted
    compacted_through: std::collections::HashMap<Collection, LogPosition>,
    unavailable: bool,
}

impl MemoryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner::default()),
        }
    }

    /// Simulate the log going down (appends fail with `Unavailable`)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Drop retained events at or below `through` for a collection
    pub fn compact(&self, collection: Collection, through: LogPosition) {
        let mut inner = self.inner.lock();
        inner.compacted_through.insert(collection, through);
        inner
            .events
            .retain(|e| e.collection != collection || e.log_position > through);
    }

    /// Events for a collection strictly after `after`, in position order.
    ///
    /// Returns [`ChatError::ResyncRequired`] when `after` predates the
    /// compaction horizon, i.e. the caller must resync from a full snapshot.
    pub fn events_after(
        &self,
        collection: Collection,
        after: Option<LogPosition>,
    ) -> ChatResult<Vec<crate::types::FeedEvent>> {
        let inner = self.inner.lock();
        if let (Some(after), Some(horizon)) = (after, inner.compacted_through.get(&collection)) {
            if after < *horizon {
                return Err(ChatError::ResyncRequired { collection });
            }
        }
        Ok(inner
            .events
            .iter()
            .filter(|e| e.collection == collection && after.map_or(true, |p| e.log_position > p))
            .cloned()
            .collect())
    }

    /// Latest position reached for a collection
    pub fn head(&self, collection: Collection) -> Option<LogPosition> {
        let inner = self.inner.lock();
        inner
            .events
            .iter()
            .filter(|e| e.collection == collection)
            .map(|e| e.log_position)
            .max()
            .or_else(|| inner.compacted_through.get(&collection).copied())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLog for MemoryLog {
    fn append(&self, rows: Vec<CommitRow>) -> Result<LogPosition, CommitLogError> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(CommitLogError::Unavailable("log offline".to_string()));
        }
        let mut last = LogPosition::default();
        for row in rows {
            let position = inner
                .next_position
                .get(&row.collection)
                .copied()
                .unwrap_or(LogPosition(1));
            inner.next_position.insert(row.collection, position.next());
            inner.events.push(crate::types::FeedEvent {
                collection: row.collection,
                row_id: row.row_id,
                transaction_id: row.transaction_id,
                operation: row.operation,
                payload: row.payload,
                log_position: position,
            });
            last = position;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> Payload {
        Payload::Message {
            channel_id: "general".into(),
            body: body.to_string(),
            edited: false,
        }
    }

    #[test]
    fn test_commit_and_tag_stamps_every_row() {
        let correlator = TransactionCorrelator::new(MemoryLog::new());
        let tagged = correlator
            .commit_and_tag(|batch| {
                batch.put(Collection::Messages, "m1".into(), message("hello"));
                batch.put(Collection::Messages, "m2".into(), message("world"));
                Ok(())
            })
            .unwrap();

        let events = correlator
            .log()
            .events_after(Collection::Messages, None)
            .unwrap();
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.transaction_id, Some(tagged.transaction_id));
        }
        // One id per transaction, positions strictly increasing
        assert!(events[0].log_position < events[1].log_position);
    }

    #[test]
    fn test_put_keys_rows_per_collection() {
        let mut batch = CommitBatch::default();
        batch.put(Collection::Messages, "x1".into(), message("hello"));
        batch.put(
            Collection::Channels,
            "x1".into(),
            Payload::Channel {
                name: "general".to_string(),
                topic: None,
            },
        );
        batch.put(Collection::Messages, "x1".into(), message("edited"));

        // Same key on another collection is not a rewrite of the first row
        assert_eq!(batch.rows[0].operation, FeedOperation::Insert);
        assert_eq!(batch.rows[1].operation, FeedOperation::Insert);
        assert_eq!(batch.rows[2].operation, FeedOperation::Update);
    }

    #[test]
    fn test_transaction_ids_monotonic_within_log() {
        let correlator = TransactionCorrelator::new(MemoryLog::new());
        let first = correlator
            .commit_and_tag(|batch| {
                batch.put(Collection::Messages, "m1".into(), message("a"));
                Ok(())
            })
            .unwrap();
        let second = correlator
            .commit_and_tag(|batch| {
                batch.put(Collection::Messages, "m2".into(), message("b"));
                Ok(())
            })
            .unwrap();
        assert!(first.transaction_id < second.transaction_id);
        assert!(first.position < second.position);
    }

    #[test]
    fn test_unavailable_log_surfaces_correlation_unavailable() {
        let log = MemoryLog::new();
        log.set_unavailable(true);
        let correlator = TransactionCorrelator::new(log);
        let err = correlator
            .commit_and_tag(|batch| {
                batch.put(Collection::Messages, "m1".into(), message("lost"));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::CorrelationUnavailable));
    }

    #[test]
    fn test_write_fn_error_skips_append() {
        let correlator = TransactionCorrelator::new(MemoryLog::new());
        let err = correlator
            .commit_and_tag::<()>(|_batch| {
                Err(ChatError::WriteRejected {
                    reason: "empty body".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::WriteRejected { .. }));
        assert!(correlator
            .log()
            .events_after(Collection::Messages, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_compaction_horizon() {
        let correlator = TransactionCorrelator::new(MemoryLog::new());
        for body in ["a", "b", "c"] {
            correlator
                .commit_and_tag(|batch| {
                    batch.put(Collection::Messages, RowId(body.to_string()), message(body));
                    Ok(())
                })
                .unwrap();
        }
        correlator.log().compact(Collection::Messages, LogPosition(2));

        // Resume from before the horizon demands a full resync
        let err = correlator
            .log()
            .events_after(Collection::Messages, Some(LogPosition(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::ResyncRequired {
                collection: Collection::Messages
            }
        ));
        // Resume at the horizon is fine
        let events = correlator
            .log()
            .events_after(Collection::Messages, Some(LogPosition(2)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].log_position, LogPosition(3));
    }
}
