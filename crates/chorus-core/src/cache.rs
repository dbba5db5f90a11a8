//! Authoritative per-collection row cache with snapshot subscriptions.
//!
//! The cache has exactly two writers with disjoint roles:
//! - [`ChangeFeedConsumer`](crate::feed::ChangeFeedConsumer) applies
//!   confirmed rows from the feed (via the mutation store's reconcile path),
//! - [`OptimisticMutationStore`](crate::mutations::OptimisticMutationStore)
//!   overlays optimistic rows, which are always overwritten by the next
//!   reconciling feed event.
//!
//! Readers never touch the map directly; they receive [`CacheSnapshot`]
//! copies through a per-collection `tokio::sync::watch` channel, republished
//! after every change.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::types::{Collection, LogPosition, Payload, RowId};

/// One cached row
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    /// Row key
    pub row_id: RowId,
    /// Current payload
    pub payload: Payload,
    /// False while the row is an optimistic overlay awaiting confirmation
    pub confirmed: bool,
    /// Feed position that produced this row (`None` for optimistic rows)
    pub position: Option<LogPosition>,
}

/// Immutable snapshot of a collection's cache, as handed to subscribers
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheSnapshot {
    /// Rows in row-key order
    pub rows: Vec<CacheRow>,
}

impl CacheSnapshot {
    /// Find a row by key
    pub fn get(&self, row_id: &RowId) -> Option<&CacheRow> {
        self.rows.iter().find(|r| &r.row_id == row_id)
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the snapshot holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct CollectionState {
    rows: BTreeMap<RowId, CacheRow>,
    snapshot_tx: watch::Sender<CacheSnapshot>,
}

impl CollectionState {
    fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(CacheSnapshot::default());
        Self {
            rows: BTreeMap::new(),
            snapshot_tx,
        }
    }

    fn publish(&self) {
        let snapshot = CacheSnapshot {
            rows: self.rows.values().cloned().collect(),
        };
        // Receivers may all have gone away; that is fine.
        let _ = self.snapshot_tx.send(snapshot);
    }
}

/// Shared cache over all collections
pub struct CacheStore {
    collections: RwLock<HashMap<Collection, CollectionState>>,
}

impl CacheStore {
    /// Create an empty cache with a state entry per known collection
    pub fn new() -> Self {
        let mut map = HashMap::new();
        for collection in Collection::ALL {
            map.insert(collection, CollectionState::new());
        }
        Self {
            collections: RwLock::new(map),
        }
    }

    /// Subscribe to snapshot updates for a collection.
    ///
    /// The receiver immediately holds the current snapshot; every later
    /// change replaces it. Restartable: dropping and resubscribing yields
    /// the then-current snapshot.
    pub fn subscribe(&self, collection: Collection) -> watch::Receiver<CacheSnapshot> {
        let map = self.collections.read();
        map[&collection].snapshot_tx.subscribe()
    }

    /// Current snapshot of a collection
    pub fn snapshot(&self, collection: Collection) -> CacheSnapshot {
        let map = self.collections.read();
        CacheSnapshot {
            rows: map[&collection].rows.values().cloned().collect(),
        }
    }

    /// Look up a single row
    pub fn get(&self, collection: Collection, row_id: &RowId) -> Option<CacheRow> {
        let map = self.collections.read();
        map[&collection].rows.get(row_id).cloned()
    }

    /// Overlay an optimistic (unconfirmed) row. Returns the previous row
    /// under that key, which callers use as the rollback baseline.
    pub fn apply_optimistic(
        &self,
        collection: Collection,
        row_id: RowId,
        payload: Payload,
    ) -> Option<CacheRow> {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        let previous = state.rows.insert(
            row_id.clone(),
            CacheRow {
                row_id,
                payload,
                confirmed: false,
                position: None,
            },
        );
        state.publish();
        previous
    }

    /// Replace a row with confirmed feed truth
    pub fn apply_confirmed(
        &self,
        collection: Collection,
        row_id: RowId,
        payload: Payload,
        position: LogPosition,
    ) {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        state.rows.insert(
            row_id.clone(),
            CacheRow {
                row_id,
                payload,
                confirmed: true,
                position: Some(position),
            },
        );
        state.publish();
    }

    /// Remove a row (confirmed delete, or rollback of an optimistic insert)
    pub fn remove(&self, collection: Collection, row_id: &RowId) -> Option<CacheRow> {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        let removed = state.rows.remove(row_id);
        if removed.is_some() {
            state.publish();
        }
        removed
    }

    /// Restore a previously captured row, or remove the key if the baseline
    /// was "row absent". Used by rollback.
    pub fn restore(&self, collection: Collection, row_id: &RowId, baseline: Option<CacheRow>) {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        match baseline {
            Some(row) => {
                state.rows.insert(row_id.clone(), row);
            }
            None => {
                state.rows.remove(row_id);
            }
        }
        state.publish();
    }

    /// Discard every row in a collection. Used on resync.
    pub fn clear(&self, collection: Collection) {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        state.rows.clear();
        state.publish();
    }

    /// Replace a collection's rows wholesale with a confirmed snapshot
    pub fn load_snapshot(&self, collection: Collection, rows: Vec<CacheRow>) {
        let mut map = self.collections.write();
        let state = map.entry(collection).or_insert_with(CollectionState::new);
        state.rows = rows.into_iter().map(|r| (r.row_id.clone(), r)).collect();
        state.publish();
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
