//! Change-feed consumption and cache convergence.
//!
//! One subscription per collection, each a small state machine:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Disconnected ──subscribe/resume──► Connecting                  │
//! │  Connecting ──begin_snapshot──► Syncing ──snapshot_loaded──►    │
//! │  Live ◄──resumed (position still retained)── Connecting         │
//! │  any ──connection_lost──► Disconnected                          │
//! │  Connecting ──position_compacted──► Connecting (full resync)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport is an external collaborator: the consumer emits
//! [`FeedCommand`]s on an mpsc channel and the transport answers through
//! the methods below. Events always pass through
//! [`OptimisticMutationStore::reconcile`] on their way into the cache, so a
//! confirmed pending write can never flicker back to its pre-confirmation
//! value. Within a collection events are applied in strictly increasing
//! log-position order; positions at or below the last applied one are
//! duplicates from reconnect-resume and are dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::cache::{CacheRow, CacheStore};
use crate::mutations::OptimisticMutationStore;
use crate::types::{Collection, FeedEvent, LogPosition, Payload, RowId};

/// Default capacity for the feed notice broadcast channel
const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Per-collection subscription state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedState {
    /// No transport connection
    #[default]
    Disconnected,
    /// Waiting for the transport to establish the subscription
    Connecting,
    /// Initial snapshot loading; live events buffer meanwhile
    Syncing,
    /// Applying live events as they arrive
    Live,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedState::Disconnected => write!(f, "disconnected"),
            FeedState::Connecting => write!(f, "connecting"),
            FeedState::Syncing => write!(f, "syncing"),
            FeedState::Live => write!(f, "live"),
        }
    }
}

/// Requests the consumer sends to the feed transport
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    /// Establish (or re-establish) the subscription for a collection.
    /// `resume_from: Some(p)` asks for events with positions above `p`;
    /// `None` asks for a full snapshot.
    Connect {
        /// Collection to subscribe
        collection: Collection,
        /// Resume position, if we have confirmed history
        resume_from: Option<LogPosition>,
    },
}

/// Notifications about feed activity, broadcast to all listeners
#[derive(Debug, Clone)]
pub enum FeedNotice {
    /// Subscription state changed
    StateChanged {
        /// Affected collection
        collection: Collection,
        /// New state
        state: FeedState,
    },
    /// A feed event confirmed (and retired) a pending mutation
    MutationConfirmed {
        /// Affected collection
        collection: Collection,
        /// The confirmed entity
        local_id: crate::types::LocalId,
    },
    /// Confirmed events were applied to the cache
    EventsApplied {
        /// Affected collection
        collection: Collection,
        /// How many events this batch applied
        count: usize,
        /// Highest position applied
        position: LogPosition,
    },
    /// The resume position was compacted away; the local cache was
    /// discarded and a full snapshot reload is underway
    ResyncStarted {
        /// Affected collection
        collection: Collection,
    },
    /// Degraded-sync indicator; the subscription keeps running
    FeedError {
        /// Affected collection
        collection: Collection,
        /// What happened
        message: String,
    },
}

#[derive(Debug, Default)]
struct SubscriptionState {
    state: FeedState,
    last_applied: Option<LogPosition>,
    /// Events seen but not yet applied, keyed (and deduplicated) by position
    buffer: BTreeMap<LogPosition, FeedEvent>,
}

/// Consumes the ordered change feed and drives reconciliation
pub struct ChangeFeedConsumer {
    mutations: Arc<OptimisticMutationStore>,
    cache: Arc<CacheStore>,
    subscriptions: Mutex<HashMap<Collection, SubscriptionState>>,
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    notice_tx: broadcast::Sender<FeedNotice>,
}

impl ChangeFeedConsumer {
    /// Create a consumer. The returned receiver is the transport's end of
    /// the command channel.
    pub fn new(
        mutations: Arc<OptimisticMutationStore>,
        cache: Arc<CacheStore>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        (
            Self {
                mutations,
                cache,
                subscriptions: Mutex::new(HashMap::new()),
                command_tx,
                notice_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to feed notices
    pub fn notices(&self) -> broadcast::Receiver<FeedNotice> {
        self.notice_tx.subscribe()
    }

    /// Current state of a collection's subscription
    pub fn state(&self, collection: Collection) -> FeedState {
        self.subscriptions
            .lock()
            .get(&collection)
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    /// Highest applied position for a collection
    pub fn last_applied(&self, collection: Collection) -> Option<LogPosition> {
        self.subscriptions
            .lock()
            .get(&collection)
            .and_then(|s| s.last_applied)
    }

    /// Collections with an active subscription
    pub fn active_collections(&self) -> Vec<Collection> {
        self.subscriptions.lock().keys().copied().collect()
    }

    /// Start a subscription for a collection.
    ///
    /// Returns `false` if one already exists.
    pub fn subscribe(&self, collection: Collection) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(&collection) {
            debug!(%collection, "already subscribed");
            return false;
        }
        subs.insert(
            collection,
            SubscriptionState {
                state: FeedState::Connecting,
                last_applied: None,
                buffer: BTreeMap::new(),
            },
        );
        drop(subs);
        info!(%collection, "feed subscription starting");
        self.set_state(collection, FeedState::Connecting);
        let _ = self.command_tx.send(FeedCommand::Connect {
            collection,
            resume_from: None,
        });
        true
    }

    /// Transport callback: the subscription is established and an initial
    /// snapshot load has begun. Live events buffer until the snapshot lands.
    pub fn begin_snapshot(&self, collection: Collection) {
        self.set_state(collection, FeedState::Syncing);
    }

    /// Transport callback: the initial snapshot is complete.
    ///
    /// Replaces the collection's cache with the snapshot rows, then enters
    /// `Live` and applies everything buffered during the load, in position
    /// order.
    pub fn snapshot_loaded(
        &self,
        collection: Collection,
        rows: Vec<(RowId, Payload)>,
        as_of: LogPosition,
    ) {
        let confirmed = rows
            .into_iter()
            .map(|(row_id, payload)| CacheRow {
                row_id: row_id.clone(),
                payload,
                confirmed: true,
                position: Some(as_of),
            })
            .collect();
        self.cache.load_snapshot(collection, confirmed);

        {
            let mut subs = self.subscriptions.lock();
            if let Some(sub) = subs.get_mut(&collection) {
                sub.last_applied = Some(as_of);
                // Anything buffered during the load that the snapshot
                // already covers is a duplicate
                sub.buffer.retain(|p, _| *p > as_of);
            }
        }
        info!(%collection, %as_of, "snapshot loaded");
        self.set_state(collection, FeedState::Live);
        self.drain(collection);
    }

    /// Transport callback: resume from the requested position succeeded;
    /// retained history is intact, no snapshot needed.
    pub fn resumed(&self, collection: Collection) {
        info!(%collection, "feed resumed");
        self.set_state(collection, FeedState::Live);
        self.drain(collection);
    }

    /// Transport callback: the requested resume position has been compacted
    /// away. The local cache for the collection is discarded and a full
    /// snapshot reload is requested; confirmed history is unaffected, so no
    /// mutation is rolled back.
    pub fn position_compacted(&self, collection: Collection) {
        warn!(%collection, "resume position compacted, resync required");
        self.cache.clear(collection);
        {
            let mut subs = self.subscriptions.lock();
            if let Some(sub) = subs.get_mut(&collection) {
                sub.last_applied = None;
                sub.buffer.clear();
                sub.state = FeedState::Connecting;
            }
        }
        let _ = self.notice_tx.send(FeedNotice::ResyncStarted { collection });
        let _ = self.notice_tx.send(FeedNotice::StateChanged {
            collection,
            state: FeedState::Connecting,
        });
        let _ = self.command_tx.send(FeedCommand::Connect {
            collection,
            resume_from: None,
        });
    }

    /// Transport callback: a feed-path error that does not invalidate the
    /// subscription (malformed frame, transient decode failure). Surfaced
    /// as a degraded-sync indicator; the subscription keeps running.
    pub fn report_error(&self, collection: Collection, message: impl Into<String>) {
        if !self.subscriptions.lock().contains_key(&collection) {
            return;
        }
        let message = message.into();
        warn!(%collection, %message, "feed error reported");
        let _ = self
            .notice_tx
            .send(FeedNotice::FeedError { collection, message });
    }

    /// Transport callback: the connection dropped. Nothing is cancelled;
    /// the subscription waits for [`ChangeFeedConsumer::resume`].
    pub fn connection_lost(&self, collection: Collection) {
        {
            let mut subs = self.subscriptions.lock();
            if let Some(sub) = subs.get_mut(&collection) {
                // Buffered-but-unapplied events will be re-requested on resume
                sub.buffer.clear();
                sub.state = FeedState::Disconnected;
            } else {
                return;
            }
        }
        warn!(%collection, "feed connection lost");
        let _ = self.notice_tx.send(FeedNotice::StateChanged {
            collection,
            state: FeedState::Disconnected,
        });
    }

    /// Re-establish a disconnected subscription, resuming from the last
    /// applied position.
    pub fn resume(&self, collection: Collection) -> bool {
        let resume_from = {
            let mut subs = self.subscriptions.lock();
            match subs.get_mut(&collection) {
                Some(sub) if sub.state == FeedState::Disconnected => {
                    sub.state = FeedState::Connecting;
                    sub.last_applied
                }
                _ => return false,
            }
        };
        info!(%collection, ?resume_from, "resuming feed subscription");
        let _ = self.notice_tx.send(FeedNotice::StateChanged {
            collection,
            state: FeedState::Connecting,
        });
        let _ = self.command_tx.send(FeedCommand::Connect {
            collection,
            resume_from,
        });
        true
    }

    /// Resume every disconnected subscription. Driven by the
    /// offline→online connectivity transition.
    pub fn resume_all(&self) -> usize {
        let disconnected: Vec<_> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .filter(|(_, s)| s.state == FeedState::Disconnected)
                .map(|(c, _)| *c)
                .collect()
        };
        let mut resumed = 0;
        for collection in disconnected {
            if self.resume(collection) {
                resumed += 1;
            }
        }
        resumed
    }

    /// Ingest one transport delivery frame.
    ///
    /// Events are buffered by position (which also orders them within the
    /// frame), duplicates at or below the last applied position are
    /// dropped, and — when the subscription is `Live` — the buffer is
    /// drained in strictly increasing position order.
    ///
    /// Frames for one collection must come from a single transport task;
    /// the in-order application guarantee does not cover concurrent
    /// callers racing their drains.
    pub fn deliver(&self, events: impl IntoIterator<Item = FeedEvent>) {
        let mut touched: Vec<Collection> = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            for event in events {
                let Some(sub) = subs.get_mut(&event.collection) else {
                    debug!(collection = %event.collection, "event for unsubscribed collection dropped");
                    continue;
                };
                if let Some(payload) = &event.payload {
                    // Boundary validation: payload shape must match the feed
                    if payload.collection() != event.collection {
                        warn!(
                            collection = %event.collection,
                            row_id = %event.row_id,
                            "feed event payload collection mismatch, dropped"
                        );
                        continue;
                    }
                }
                if sub.last_applied.is_some_and(|last| event.log_position <= last) {
                    debug!(
                        collection = %event.collection,
                        position = %event.log_position,
                        "duplicate feed event ignored"
                    );
                    continue;
                }
                if !touched.contains(&event.collection) {
                    touched.push(event.collection);
                }
                sub.buffer.insert(event.log_position, event);
            }
        }
        for collection in touched {
            self.drain(collection);
        }
    }

    /// Apply everything buffered for a `Live` collection, in position order
    fn drain(&self, collection: Collection) {
        let mut applied = 0usize;
        let mut highest = None;
        loop {
            let event = {
                let mut subs = self.subscriptions.lock();
                let Some(sub) = subs.get_mut(&collection) else { return };
                if sub.state != FeedState::Live {
                    return;
                }
                let Some((&position, _)) = sub.buffer.first_key_value() else { break };
                // first_key_value is the minimum key, so application order
                // is strictly increasing
                let event = sub.buffer.remove(&position);
                sub.last_applied = Some(position);
                event
            };
            if let Some(event) = event {
                highest = Some(event.log_position);
                // Reconcile retires any matching pending mutation before the
                // confirmed row becomes visible
                if let crate::mutations::Reconciliation::Confirmed { local_id } =
                    self.mutations.reconcile(&event)
                {
                    let _ = self.notice_tx.send(FeedNotice::MutationConfirmed {
                        collection,
                        local_id,
                    });
                }
                applied += 1;
            }
        }
        if applied > 0 {
            if let Some(position) = highest {
                debug!(%collection, applied, %position, "feed events applied");
                let _ = self.notice_tx.send(FeedNotice::EventsApplied {
                    collection,
                    count: applied,
                    position,
                });
            }
        }
    }

    fn set_state(&self, collection: Collection, state: FeedState) {
        {
            let mut subs = self.subscriptions.lock();
            if let Some(sub) = subs.get_mut(&collection) {
                if sub.state == state {
                    return;
                }
                sub.state = state.clone();
            } else {
                return;
            }
        }
        let _ = self.notice_tx.send(FeedNotice::StateChanged { collection, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::MutationConfig;
    use crate::types::{FeedOperation, TransactionId};
    use ulid::Ulid;

    fn message(body: &str) -> Payload {
        Payload::Message {
            channel_id: "general".into(),
            body: body.to_string(),
            edited: false,
        }
    }

    fn event(row: &str, position: u64, body: &str) -> FeedEvent {
        FeedEvent {
            collection: Collection::Messages,
            row_id: row.into(),
            transaction_id: Some(TransactionId(Ulid::new())),
            operation: FeedOperation::Insert,
            payload: Some(message(body)),
            log_position: LogPosition(position),
        }
    }

    fn consumer() -> (
        Arc<CacheStore>,
        ChangeFeedConsumer,
        mpsc::UnboundedReceiver<FeedCommand>,
    ) {
        let cache = Arc::new(CacheStore::new());
        let mutations = Arc::new(OptimisticMutationStore::new(
            cache.clone(),
            MutationConfig::default(),
        ));
        let (consumer, command_rx) = ChangeFeedConsumer::new(mutations, cache.clone());
        (cache, consumer, command_rx)
    }

    /// Shortcut through Connecting/Syncing with an empty snapshot
    fn go_live(consumer: &ChangeFeedConsumer, collection: Collection) {
        consumer.subscribe(collection);
        consumer.begin_snapshot(collection);
        consumer.snapshot_loaded(collection, Vec::new(), LogPosition(0));
    }

    #[test]
    fn test_subscribe_emits_connect_command() {
        let (_, consumer, mut command_rx) = consumer();
        assert!(consumer.subscribe(Collection::Messages));
        assert!(!consumer.subscribe(Collection::Messages));
        assert_eq!(
            command_rx.try_recv().unwrap(),
            FeedCommand::Connect {
                collection: Collection::Messages,
                resume_from: None,
            }
        );
        assert_eq!(consumer.state(Collection::Messages), FeedState::Connecting);
    }

    #[test]
    fn test_events_buffer_during_syncing_and_flush_on_live() {
        let (cache, consumer, _rx) = consumer();
        consumer.subscribe(Collection::Messages);
        consumer.begin_snapshot(Collection::Messages);

        consumer.deliver([event("m2", 2, "second"), event("m3", 3, "third")]);
        assert!(cache.snapshot(Collection::Messages).is_empty());

        consumer.snapshot_loaded(
            Collection::Messages,
            vec![("m1".into(), message("first"))],
            LogPosition(1),
        );
        let snapshot = cache.snapshot(Collection::Messages);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(consumer.last_applied(Collection::Messages), Some(LogPosition(3)));
        assert_eq!(consumer.state(Collection::Messages), FeedState::Live);
    }

    #[test]
    fn test_out_of_order_frame_applied_in_position_order() {
        let (cache, consumer, _rx) = consumer();
        go_live(&consumer, Collection::Messages);

        // Same row twice in one frame, delivered out of order: the later
        // position must win
        consumer.deliver([event("m1", 5, "newer"), event("m1", 4, "older")]);
        let row = cache.get(Collection::Messages, &"m1".into()).unwrap();
        assert_eq!(row.payload, message("newer"));
        assert_eq!(row.position, Some(LogPosition(5)));
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        let (cache, consumer, _rx) = consumer();
        go_live(&consumer, Collection::Messages);

        consumer.deliver([event("m1", 4, "original")]);
        consumer.deliver([event("m1", 4, "replayed"), event("m1", 3, "stale")]);

        let row = cache.get(Collection::Messages, &"m1".into()).unwrap();
        assert_eq!(row.payload, message("original"));
        assert_eq!(consumer.last_applied(Collection::Messages), Some(LogPosition(4)));
    }

    #[test]
    fn test_disconnect_and_resume_from_last_position() {
        let (_, consumer, mut command_rx) = consumer();
        go_live(&consumer, Collection::Messages);
        consumer.deliver([event("m1", 7, "before the flap")]);
        let _ = command_rx.try_recv();

        consumer.connection_lost(Collection::Messages);
        assert_eq!(consumer.state(Collection::Messages), FeedState::Disconnected);

        assert!(consumer.resume(Collection::Messages));
        assert_eq!(
            command_rx.try_recv().unwrap(),
            FeedCommand::Connect {
                collection: Collection::Messages,
                resume_from: Some(LogPosition(7)),
            }
        );
        consumer.resumed(Collection::Messages);
        assert_eq!(consumer.state(Collection::Messages), FeedState::Live);
    }

    #[test]
    fn test_compaction_triggers_full_resync() {
        let (cache, consumer, mut command_rx) = consumer();
        go_live(&consumer, Collection::Messages);
        consumer.deliver([event("m1", 7, "old history")]);
        consumer.connection_lost(Collection::Messages);
        consumer.resume(Collection::Messages);
        while command_rx.try_recv().is_ok() {}

        consumer.position_compacted(Collection::Messages);
        assert!(cache.snapshot(Collection::Messages).is_empty());
        assert_eq!(consumer.last_applied(Collection::Messages), None);
        assert_eq!(
            command_rx.try_recv().unwrap(),
            FeedCommand::Connect {
                collection: Collection::Messages,
                resume_from: None,
            }
        );
    }

    #[test]
    fn test_mismatched_payload_dropped_at_boundary() {
        let (cache, consumer, _rx) = consumer();
        go_live(&consumer, Collection::Messages);
        consumer.deliver([FeedEvent {
            collection: Collection::Messages,
            row_id: "x".into(),
            transaction_id: None,
            operation: FeedOperation::Insert,
            payload: Some(Payload::Channel {
                name: "not a message".to_string(),
                topic: None,
            }),
            log_position: LogPosition(1),
        }]);
        assert!(cache.snapshot(Collection::Messages).is_empty());
    }

    #[test]
    fn test_report_error_notifies_without_disturbing_subscription() {
        let (_, consumer, _rx) = consumer();
        go_live(&consumer, Collection::Messages);
        let mut notices = consumer.notices();

        consumer.report_error(Collection::Messages, "malformed frame");
        // Unsubscribed collections stay silent
        consumer.report_error(Collection::Webhooks, "ignored");

        match notices.try_recv().unwrap() {
            FeedNotice::FeedError {
                collection,
                message,
            } => {
                assert_eq!(collection, Collection::Messages);
                assert_eq!(message, "malformed frame");
            }
            other => panic!("unexpected notice: {other:?}"),
        }
        assert!(notices.try_recv().is_err());
        assert_eq!(consumer.state(Collection::Messages), FeedState::Live);
    }

    #[test]
    fn test_resume_all_only_touches_disconnected() {
        let (_, consumer, mut command_rx) = consumer();
        go_live(&consumer, Collection::Messages);
        consumer.subscribe(Collection::Channels);
        consumer.begin_snapshot(Collection::Channels);
        consumer.snapshot_loaded(Collection::Channels, Vec::new(), LogPosition(0));
        while command_rx.try_recv().is_ok() {}

        consumer.connection_lost(Collection::Messages);
        assert_eq!(consumer.resume_all(), 1);
        assert_eq!(
            command_rx.try_recv().unwrap(),
            FeedCommand::Connect {
                collection: Collection::Messages,
                resume_from: Some(LogPosition(0)),
            }
        );
        assert!(command_rx.try_recv().is_err());
    }
}
