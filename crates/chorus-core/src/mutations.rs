//! Optimistic mutation tracking and reconciliation against feed truth.
//!
//! The [`OptimisticMutationStore`] makes local state reflect user intent
//! before the server confirms anything, then converges to server truth:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  apply()            local cache mutated, PendingMutation created │
//! │    │                (transaction_id = None)                      │
//! │    ├─ write ok ───► attach_transaction(tx)                       │
//! │    ├─ write err ──► roll_back()        entry removed, cache      │
//! │    │                                   restored to baseline      │
//! │    └─ no tx id ───► mark_correlation_lost()  kept, content-match │
//! │                                                                  │
//! │  reconcile(feed event)  matched  ──► entry removed, cache row    │
//! │                                      replaced by feed payload    │
//! │                         unmatched ─► applied as normal update    │
//! │                                                                  │
//! │  expire_pending()   stale entries rolled back, surfaced as       │
//! │                     ReconciliationTimeout                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exclusive ownership: only this store creates, mutates, or removes
//! [`PendingMutation`] entries. Inside `reconcile` a matched entry is
//! retired from the pending table before the confirmed payload is written
//! to the cache, so no reader ever observes a mutation as both pending and
//! confirmed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheRow, CacheStore};
use crate::error::{ChatError, ChatResult};
use crate::types::{Collection, FeedEvent, FeedOperation, LocalId, Payload, RowId, TransactionId};

/// Handle returned by [`OptimisticMutationStore::apply`], used for all later
/// calls about the same mutation.
///
/// The attempt stamp ties the handle to one specific `apply`: once a later
/// `apply` supersedes the entry, operations through the older handle report
/// the mutation as unknown instead of acting on the superseding edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationHandle {
    /// Collection the mutation targets
    pub collection: Collection,
    /// Entity the mutation targets
    pub local_id: LocalId,
    /// Which apply this handle belongs to
    attempt: u32,
}

/// A locally-applied-but-unconfirmed mutation
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Collection the mutation targets
    pub collection: Collection,
    /// Entity the mutation targets
    pub local_id: LocalId,
    /// Correlation token, once the write acknowledgment arrived
    pub transaction_id: Option<TransactionId>,
    /// The optimistically applied payload
    pub payload: Payload,
    /// When the mutation was applied locally
    pub applied_at: Instant,
    /// Write attempt count (superseding edits increment it)
    pub attempt: u32,
    /// Cache state to restore on rollback: the last reconciled row under
    /// this key, or `None` if the key had no reconciled row
    rollback: Option<CacheRow>,
    /// Set when the write acknowledged without a transaction id; the entry
    /// then reconciles by content match and expires on the long bound
    correlation_lost: bool,
    /// Set when the caller asked to cancel before acknowledgment
    cancel_requested: bool,
}

/// Outcome of [`OptimisticMutationStore::reconcile`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The event confirmed a pending mutation, which has been retired
    Confirmed {
        /// The confirmed entity
        local_id: LocalId,
    },
    /// No matching pending mutation; applied as a normal incoming update
    Passthrough,
}

/// Outcome of [`OptimisticMutationStore::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancellation noted; the write had not been acknowledged yet and the
    /// caller may roll the mutation back once the in-flight call is aborted
    Requested,
    /// The write already committed (or was already reconciled); confirmed
    /// state is never dropped, so the cancel resolves as success
    AlreadyCommitted,
}

/// A mutation rolled back by [`OptimisticMutationStore::expire_pending`]
#[derive(Debug)]
pub struct ExpiredMutation {
    /// Collection of the expired mutation
    pub collection: Collection,
    /// Entity whose edit was rolled back
    pub local_id: LocalId,
    /// How long the entry had been pending
    pub age: Duration,
}

/// Timeout bounds for pending mutations
#[derive(Debug, Clone)]
pub struct MutationConfig {
    /// Bound for entries still waiting for a write acknowledgment
    pub attach_timeout: Duration,
    /// Bound for entries with a transaction id (or lost correlation) that
    /// the feed never confirmed
    pub reconcile_timeout: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-collection store of locally-applied-but-unconfirmed mutations
pub struct OptimisticMutationStore {
    cache: Arc<CacheStore>,
    pending: Mutex<HashMap<(Collection, LocalId), PendingMutation>>,
    config: MutationConfig,
}

impl OptimisticMutationStore {
    /// Create a store writing its optimistic overlay into `cache`
    pub fn new(cache: Arc<CacheStore>, config: MutationConfig) -> Self {
        Self {
            cache,
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Apply a mutation locally, before any network activity.
    ///
    /// Synchronous and non-blocking: the cache reflects the edit when this
    /// returns. A second `apply` on the same (collection, local id) while a
    /// pending entry exists supersedes it — the new payload replaces the old
    /// one, but the rollback baseline stays the last *reconciled* state, so
    /// a later rollback can never resurrect a superseded optimistic value.
    pub fn apply(
        &self,
        collection: Collection,
        local_id: LocalId,
        payload: Payload,
    ) -> ChatResult<MutationHandle> {
        if payload.collection() != collection {
            return Err(ChatError::PayloadMismatch {
                payload: payload.collection(),
                collection,
            });
        }

        let key = (collection, local_id.clone());
        let row_id = RowId::local(&local_id);

        let mut pending = self.pending.lock();
        let superseded = pending.remove(&key);
        let previous_row = self
            .cache
            .apply_optimistic(collection, row_id, payload.clone());

        let (rollback, attempt) = match superseded {
            Some(old) => {
                debug!(%collection, %local_id, attempt = old.attempt + 1, "superseding pending mutation");
                (old.rollback, old.attempt + 1)
            }
            // previous_row is the last reconciled state under this key
            None => (previous_row, 1),
        };

        pending.insert(
            key,
            PendingMutation {
                collection,
                local_id: local_id.clone(),
                transaction_id: None,
                payload,
                applied_at: Instant::now(),
                attempt,
                rollback,
                correlation_lost: false,
                cancel_requested: false,
            },
        );

        debug!(%collection, %local_id, "mutation applied optimistically");
        Ok(MutationHandle {
            collection,
            local_id,
            attempt,
        })
    }

    /// Attach the transaction id from the write acknowledgment.
    ///
    /// Errors if the handle no longer refers to a pending mutation (already
    /// reconciled, rolled back, or superseded by a re-keyed apply) or if an
    /// id was attached before.
    pub fn attach_transaction(
        &self,
        handle: &MutationHandle,
        transaction_id: TransactionId,
    ) -> ChatResult<()> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(&(handle.collection, handle.local_id.clone()))
            .filter(|entry| entry.attempt == handle.attempt)
            .ok_or_else(|| ChatError::UnknownMutation {
                collection: handle.collection,
                local_id: handle.local_id.clone(),
            })?;
        if entry.transaction_id.is_some() {
            return Err(ChatError::TransactionAlreadyAttached(
                handle.local_id.clone(),
            ));
        }
        entry.transaction_id = Some(transaction_id);
        debug!(collection = %handle.collection, local_id = %handle.local_id, %transaction_id, "transaction attached");
        Ok(())
    }

    /// The remote write failed (or was aborted): revert the cache to the
    /// rollback baseline and drop the pending entry.
    pub fn roll_back(&self, handle: &MutationHandle) -> ChatResult<()> {
        let key = (handle.collection, handle.local_id.clone());
        let mut pending = self.pending.lock();
        if pending
            .get(&key)
            .map(|entry| entry.attempt == handle.attempt)
            != Some(true)
        {
            return Err(ChatError::UnknownMutation {
                collection: handle.collection,
                local_id: handle.local_id.clone(),
            });
        }
        let entry = pending.remove(&key).ok_or_else(|| ChatError::UnknownMutation {
            collection: handle.collection,
            local_id: handle.local_id.clone(),
        })?;
        let row_id = RowId::local(&entry.local_id);
        self.cache.restore(entry.collection, &row_id, entry.rollback);
        debug!(collection = %handle.collection, local_id = %handle.local_id, "mutation rolled back");
        Ok(())
    }

    /// The write acknowledged but no transaction id could be obtained.
    ///
    /// The entry is kept (the write may have committed) and becomes eligible
    /// for content-match reconciliation; it expires on the long bound.
    pub fn mark_correlation_lost(&self, handle: &MutationHandle) -> ChatResult<()> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(&(handle.collection, handle.local_id.clone()))
            .filter(|entry| entry.attempt == handle.attempt)
            .ok_or_else(|| ChatError::UnknownMutation {
                collection: handle.collection,
                local_id: handle.local_id.clone(),
            })?;
        entry.correlation_lost = true;
        warn!(collection = %handle.collection, local_id = %handle.local_id, "correlation lost, awaiting content match");
        Ok(())
    }

    /// Request cancellation of a not-yet-acknowledged write.
    ///
    /// If the acknowledgment already attached a transaction id — or the
    /// mutation was already reconciled — the write committed and the cancel
    /// resolves as [`CancelOutcome::AlreadyCommitted`]; the confirmed state
    /// is never dropped.
    pub fn cancel(&self, handle: &MutationHandle) -> CancelOutcome {
        let mut pending = self.pending.lock();
        match pending.get_mut(&(handle.collection, handle.local_id.clone())) {
            Some(entry) if entry.attempt == handle.attempt && entry.transaction_id.is_none() => {
                entry.cancel_requested = true;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::AlreadyCommitted,
        }
    }

    /// Whether a cancel was requested for this mutation
    pub fn is_cancel_requested(&self, handle: &MutationHandle) -> bool {
        let pending = self.pending.lock();
        pending
            .get(&(handle.collection, handle.local_id.clone()))
            .filter(|e| e.attempt == handle.attempt)
            .map(|e| e.cancel_requested)
            .unwrap_or(false)
    }

    /// Reconcile one feed event against the pending table and the cache.
    ///
    /// Matching precedence: transaction id first, then content match for
    /// correlation-lost entries. A match retires the pending entry *before*
    /// the authoritative payload lands in the cache — the only successful
    /// removal path. Unmatched events are applied as normal incoming
    /// updates.
    pub fn reconcile(&self, event: &FeedEvent) -> Reconciliation {
        let mut pending = self.pending.lock();

        let matched_key = event
            .transaction_id
            .and_then(|tx| {
                pending
                    .iter()
                    .find(|((c, _), entry)| *c == event.collection && entry.transaction_id == Some(tx))
                    .map(|(key, _)| key.clone())
            })
            .or_else(|| {
                // Content match rescues writes whose acknowledgment lost the id
                event.payload.as_ref().and_then(|payload| {
                    pending
                        .iter()
                        .find(|((c, _), entry)| {
                            *c == event.collection
                                && entry.correlation_lost
                                && entry.payload == *payload
                        })
                        .map(|(key, _)| key.clone())
                })
            });

        match matched_key {
            Some(key) => {
                // Retire first so no reader ever sees both the pending entry
                // and the confirmed row.
                let entry = pending.remove(&key);
                drop(pending);
                if let Some(entry) = entry {
                    let local_row = RowId::local(&entry.local_id);
                    if local_row != event.row_id {
                        // Server re-keyed the row; drop the optimistic one
                        self.cache.remove(event.collection, &local_row);
                    }
                    self.apply_event_to_cache(event);
                    debug!(
                        collection = %event.collection,
                        local_id = %entry.local_id,
                        position = %event.log_position,
                        "pending mutation confirmed"
                    );
                    Reconciliation::Confirmed {
                        local_id: entry.local_id,
                    }
                } else {
                    Reconciliation::Passthrough
                }
            }
            None => {
                drop(pending);
                self.apply_event_to_cache(event);
                Reconciliation::Passthrough
            }
        }
    }

    fn apply_event_to_cache(&self, event: &FeedEvent) {
        match (&event.operation, &event.payload) {
            (FeedOperation::Delete, _) => {
                self.cache.remove(event.collection, &event.row_id);
            }
            (_, Some(payload)) => {
                self.cache.apply_confirmed(
                    event.collection,
                    event.row_id.clone(),
                    payload.clone(),
                    event.log_position,
                );
            }
            (_, None) => {
                warn!(
                    collection = %event.collection,
                    row_id = %event.row_id,
                    "insert/update feed event without payload, skipped"
                );
            }
        }
    }

    /// Roll back pending mutations that outlived their timeout bound.
    ///
    /// Entries without a transaction id expire on the short
    /// `attach_timeout`; entries that were acknowledged (or lost
    /// correlation) get the long `reconcile_timeout`. Never removes an
    /// entry before its bound.
    pub fn expire_pending(&self, now: Instant) -> Vec<ExpiredMutation> {
        let mut expired = Vec::new();
        let mut pending = self.pending.lock();
        let keys: Vec<_> = pending.keys().cloned().collect();
        for key in keys {
            let overdue = pending.get(&key).map(|entry| {
                let bound = if entry.transaction_id.is_none() && !entry.correlation_lost {
                    self.config.attach_timeout
                } else {
                    self.config.reconcile_timeout
                };
                now.saturating_duration_since(entry.applied_at) >= bound
            });
            if overdue != Some(true) {
                continue;
            }
            if let Some(entry) = pending.remove(&key) {
                let age = now.saturating_duration_since(entry.applied_at);
                let row_id = RowId::local(&entry.local_id);
                self.cache.restore(entry.collection, &row_id, entry.rollback);
                warn!(
                    collection = %entry.collection,
                    local_id = %entry.local_id,
                    ?age,
                    "pending mutation expired, rolled back"
                );
                expired.push(ExpiredMutation {
                    collection: entry.collection,
                    local_id: entry.local_id,
                    age,
                });
            }
        }
        expired
    }

    /// Number of live pending mutations
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of one pending mutation, if live
    pub fn get_pending(&self, handle: &MutationHandle) -> Option<PendingMutation> {
        self.pending
            .lock()
            .get(&(handle.collection, handle.local_id.clone()))
            .filter(|e| e.attempt == handle.attempt)
            .cloned()
    }
}
