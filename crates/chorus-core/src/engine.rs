//! Main ChorusEngine - the primary entry point for the Chorus core.
//!
//! ChorusEngine wires the reconciliation components together and owns the
//! glue tasks between them:
//! - the write driver: per-mutation short-lived task that waits on the
//!   network gate, calls the durable write API with a bounded timeout, and
//!   settles the pending mutation per outcome;
//! - the connectivity glue: on the offline→online transition, resets retry
//!   counters and resumes every active feed subscription;
//! - the expiry timer: periodically rolls back pending mutations that
//!   outlived their bounds.
//!
//! # Example
//!
//! ```ignore
//! use chorus_core::{ChorusEngine, Collection, CoreConfig, LocalId, Payload};
//!
//! let (engine, feed_commands) = ChorusEngine::new(write_api, CoreConfig::default());
//! engine.subscribe_feed(Collection::Messages);
//!
//! // Immediate local effect; confirmation arrives through the feed
//! let handle = engine.apply_mutation(
//!     Collection::Messages,
//!     LocalId::generate(),
//!     Payload::Message {
//!         channel_id: "general".into(),
//!         body: "hi".to_string(),
//!         edited: false,
//!     },
//! )?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheSnapshot, CacheStore};
use crate::error::{ChatError, ChatResult};
use crate::feed::{ChangeFeedConsumer, FeedCommand, FeedNotice, FeedState};
use crate::mutations::{
    CancelOutcome, MutationConfig, MutationHandle, OptimisticMutationStore,
};
use crate::network::NetworkMonitor;
use crate::presence::{PresenceConfig, PresenceReconciler};
use crate::retry::{OperationKind, RetryConfig, RetryCoordinator};
use crate::types::{
    ChannelId, Collection, ConnectivityState, LocalId, Payload, PresenceRecord, PresenceStatus,
    SessionId, TransactionId, UserId,
};

/// Default capacity for the engine event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One durable write request, as handed to the [`WriteApi`]
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    /// Collection the write targets
    pub collection: Collection,
    /// Client-side entity id, echoed into the committed row
    pub local_id: LocalId,
    /// Payload to persist
    pub payload: Payload,
}

/// Synchronous acknowledgment of a durable write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Correlation token bound to the commit's log position
    pub transaction_id: TransactionId,
}

/// The durable write API, an external collaborator.
///
/// `submit` resolves with the acknowledgment once the write committed.
/// Failure modes map onto [`ChatError`]: `WriteRejected` for validation or
/// authorization failures, `WriteUnavailable` for transport trouble, and
/// `CorrelationUnavailable` when the write went through but no transaction
/// id could be obtained.
pub trait WriteApi: Send + Sync {
    /// Submit one write
    fn submit(&self, request: WriteRequest) -> BoxFuture<'static, ChatResult<WriteAck>>;
}

/// Why a mutation was rolled back
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    /// The server rejected the write; never retried
    Rejected(String),
    /// Retries against an unavailable write path were exhausted
    RetriesExhausted,
    /// The feed never confirmed the write within its bound
    ReconciliationTimeout,
    /// The caller cancelled before acknowledgment
    Cancelled,
}

/// Events emitted by the engine, broadcast to all listeners
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A pending mutation was confirmed by the feed
    MutationConfirmed {
        /// Affected collection
        collection: Collection,
        /// Confirmed entity
        local_id: LocalId,
    },
    /// A pending mutation was rolled back
    MutationRolledBack {
        /// Affected collection
        collection: Collection,
        /// Rolled-back entity
        local_id: LocalId,
        /// Why
        reason: RollbackReason,
    },
    /// Connectivity transitioned
    ConnectivityChanged {
        /// New state
        state: ConnectivityState,
    },
    /// A feed subscription changed state
    FeedStateChanged {
        /// Affected collection
        collection: Collection,
        /// New state
        state: FeedState,
    },
    /// A compacted resume position forced a full snapshot reload
    ResyncPerformed {
        /// Affected collection
        collection: Collection,
    },
    /// Sync is degraded but the subscription keeps running
    DegradedSync {
        /// Affected collection
        collection: Collection,
        /// What happened
        message: String,
    },
    /// A user's resolved presence changed
    PresenceChanged {
        /// The user
        user_id: UserId,
        /// New resolved status
        status: PresenceStatus,
    },
}

/// Engine-wide configuration
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Pending-mutation timeout bounds
    pub mutation: MutationConfig,
    /// Presence timing
    pub presence: PresenceConfig,
    /// Write/feed retry backoff
    pub retry: RetryConfig,
    /// Engine task timing
    pub timing: TimingConfig,
}

/// Timing for the engine's own tasks
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Bound on one durable write call
    pub write_timeout: Duration,
    /// How often pending mutations are checked for expiry
    pub expiry_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            expiry_interval: Duration::from_secs(5),
        }
    }
}

/// Main entry point for the Chorus reconciliation core
pub struct ChorusEngine {
    cache: Arc<CacheStore>,
    mutations: Arc<OptimisticMutationStore>,
    consumer: Arc<ChangeFeedConsumer>,
    presence: Arc<PresenceReconciler>,
    monitor: Arc<NetworkMonitor>,
    retry: Arc<RetryCoordinator>,
    write_api: Arc<dyn WriteApi>,
    config: CoreConfig,
    event_tx: broadcast::Sender<CoreEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChorusEngine {
    /// Create an engine over the given write API.
    ///
    /// The returned receiver is the feed transport's command channel; the
    /// transport answers through [`ChorusEngine::feed`] callbacks.
    pub fn new(
        write_api: Arc<dyn WriteApi>,
        config: CoreConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FeedCommand>) {
        let cache = Arc::new(CacheStore::new());
        let mutations = Arc::new(OptimisticMutationStore::new(
            cache.clone(),
            config.mutation.clone(),
        ));
        let (consumer, feed_command_rx) = ChangeFeedConsumer::new(mutations.clone(), cache.clone());
        let consumer = Arc::new(consumer);
        let presence = Arc::new(PresenceReconciler::new(config.presence.clone()));
        let monitor = Arc::new(NetworkMonitor::default());
        let retry = Arc::new(RetryCoordinator::new(config.retry.clone()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new(Self {
            cache,
            mutations,
            consumer,
            presence,
            monitor,
            retry,
            write_api,
            config,
            event_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(engine.spawn_connectivity_glue());
        tasks.push(engine.spawn_expiry_timer());
        tasks.push(engine.spawn_notice_forwarder());
        tasks.push(engine.spawn_presence_forwarder());
        tasks.push(engine.presence.spawn_sweeper());
        *engine.tasks.lock() = tasks;

        info!("chorus engine started");
        (engine, feed_command_rx)
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Stream of cache snapshots for a collection; lazy and restartable
    pub fn subscribe_cache(&self, collection: Collection) -> watch::Receiver<CacheSnapshot> {
        self.cache.subscribe(collection)
    }

    /// Start the change-feed subscription for a collection
    pub fn subscribe_feed(&self, collection: Collection) -> bool {
        self.consumer.subscribe(collection)
    }

    /// The feed consumer, for transport callbacks and state queries
    pub fn feed(&self) -> &Arc<ChangeFeedConsumer> {
        &self.consumer
    }

    /// The presence reconciler
    pub fn presence(&self) -> &Arc<PresenceReconciler> {
        &self.presence
    }

    /// The mutation store, for direct inspection
    pub fn mutations(&self) -> &Arc<OptimisticMutationStore> {
        &self.mutations
    }

    /// The retry coordinator
    pub fn retry(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    /// Current connectivity state
    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// Watch connectivity transitions
    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.monitor.subscribe()
    }

    /// Feed a native connectivity notification in
    pub fn set_connectivity(&self, state: ConnectivityState) -> bool {
        self.monitor.set_state(state)
    }

    /// Read-only presence snapshot for a user
    pub fn get_presence(&self, user_id: &UserId) -> PresenceRecord {
        self.presence.get_presence(user_id)
    }

    /// Heartbeat one session of a user
    pub fn heartbeat(
        &self,
        user_id: UserId,
        session_id: SessionId,
        status: PresenceStatus,
        active_channel_id: Option<ChannelId>,
    ) -> PresenceRecord {
        self.presence
            .heartbeat(user_id, session_id, status, active_channel_id)
    }

    /// Apply a mutation: immediate local effect, durable write in the
    /// background, convergence through the change feed.
    ///
    /// Never blocks on the network. The returned handle identifies the
    /// mutation for [`ChorusEngine::cancel_mutation`] and in events.
    pub fn apply_mutation(
        self: &Arc<Self>,
        collection: Collection,
        local_id: LocalId,
        payload: Payload,
    ) -> ChatResult<MutationHandle> {
        let handle = self
            .mutations
            .apply(collection, local_id, payload.clone())?;

        let engine = self.clone();
        let driver_handle = handle.clone();
        let request = WriteRequest {
            collection,
            local_id: handle.local_id.clone(),
            payload,
        };
        let task = tokio::spawn(async move {
            engine.drive_write(driver_handle, request).await;
        });
        {
            // Drivers are short-lived; reap settled ones so the task list
            // stays bounded by in-flight work, not by total writes.
            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }

        Ok(handle)
    }

    /// Request cancellation of a not-yet-acknowledged mutation.
    ///
    /// If the write already committed the cancel resolves as
    /// [`CancelOutcome::AlreadyCommitted`] and the confirmed state stands.
    pub fn cancel_mutation(&self, handle: &MutationHandle) -> CancelOutcome {
        self.mutations.cancel(handle)
    }

    /// Abort all background tasks
    pub fn shutdown(&self) {
        info!("shutting down chorus engine");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Drives one mutation's durable write to a settled outcome.
    ///
    /// Suspends only at the network gate and on the write call itself.
    async fn drive_write(self: Arc<Self>, handle: MutationHandle, request: WriteRequest) {
        let mut gate = self.monitor.gate();
        let collection = handle.collection;
        loop {
            gate.wait_online().await;

            // Superseded or rolled back while we waited
            if self.mutations.get_pending(&handle).is_none() {
                return;
            }
            if self.mutations.is_cancel_requested(&handle) {
                if self.mutations.roll_back(&handle).is_ok() {
                    self.emit_rollback(&handle, RollbackReason::Cancelled);
                }
                return;
            }

            let outcome = tokio::time::timeout(
                self.config.timing.write_timeout,
                self.write_api.submit(request.clone()),
            )
            .await;

            match outcome {
                Ok(Ok(ack)) => {
                    self.retry.record_success(collection, OperationKind::Write);
                    match self.mutations.attach_transaction(&handle, ack.transaction_id) {
                        Ok(())
                        | Err(ChatError::UnknownMutation { .. })
                        | Err(ChatError::TransactionAlreadyAttached(_)) => {}
                        Err(err) => warn!(%err, "could not attach transaction"),
                    }
                    return;
                }
                Ok(Err(ChatError::WriteRejected { reason })) => {
                    if self.mutations.roll_back(&handle).is_ok() {
                        self.emit_rollback(&handle, RollbackReason::Rejected(reason));
                    }
                    return;
                }
                Ok(Err(ChatError::CorrelationUnavailable)) => {
                    // Ambiguous: the write may have committed. Keep it
                    // pending for content-match or the long bound.
                    let _ = self.mutations.mark_correlation_lost(&handle);
                    return;
                }
                Ok(Err(ChatError::WriteTimeout(elapsed))) => {
                    // The write API's own timeout report. As ambiguous as
                    // ours below: a blind retry could commit a second row.
                    warn!(%collection, local_id = %handle.local_id, ?elapsed, "write reported timeout");
                    let _ = self.mutations.mark_correlation_lost(&handle);
                    return;
                }
                Err(_elapsed) => {
                    // Timed out without an acknowledgment: equally
                    // ambiguous, so no blind retry either.
                    warn!(%collection, local_id = %handle.local_id, "write call timed out");
                    let _ = self.mutations.mark_correlation_lost(&handle);
                    return;
                }
                Ok(Err(err)) => {
                    self.retry.record_failure(collection, OperationKind::Write);
                    let decision = self.retry.should_retry(collection, OperationKind::Write);
                    if !decision.retry {
                        warn!(%collection, local_id = %handle.local_id, %err, "write retries exhausted");
                        if self.mutations.roll_back(&handle).is_ok() {
                            self.emit_rollback(&handle, RollbackReason::RetriesExhausted);
                        }
                        return;
                    }
                    debug!(%collection, local_id = %handle.local_id, delay = ?decision.delay, %err, "write failed, backing off");
                    tokio::time::sleep(decision.delay).await;
                }
            }
        }
    }

    fn emit_rollback(&self, handle: &MutationHandle, reason: RollbackReason) {
        let _ = self.event_tx.send(CoreEvent::MutationRolledBack {
            collection: handle.collection,
            local_id: handle.local_id.clone(),
            reason,
        });
    }

    /// On offline→online: reset retry counters and resume every
    /// disconnected feed subscription. On online→offline: nothing is
    /// cancelled; new work queues behind the gate.
    fn spawn_connectivity_glue(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut connectivity = self.monitor.subscribe();
        tokio::spawn(async move {
            loop {
                if connectivity.changed().await.is_err() {
                    return;
                }
                let state = *connectivity.borrow_and_update();
                let _ = engine
                    .event_tx
                    .send(CoreEvent::ConnectivityChanged { state });
                if state == ConnectivityState::Online {
                    engine.retry.reset_all();
                    let resumed = engine.consumer.resume_all();
                    info!(resumed, "back online, feed subscriptions resuming");
                }
            }
        })
    }

    /// Periodic expiry of pending mutations
    fn spawn_expiry_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = self.config.timing.expiry_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for expired in engine.mutations.expire_pending(Instant::now()) {
                    let err = ChatError::ReconciliationTimeout {
                        local_id: expired.local_id.clone(),
                    };
                    warn!(collection = %expired.collection, %err, age = ?expired.age, "mutation rolled back");
                    let _ = engine.event_tx.send(CoreEvent::MutationRolledBack {
                        collection: expired.collection,
                        local_id: expired.local_id,
                        reason: RollbackReason::ReconciliationTimeout,
                    });
                }
            }
        })
    }

    /// Forward feed notices as engine events
    fn spawn_notice_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut notices = self.consumer.notices();
        tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(FeedNotice::MutationConfirmed {
                        collection,
                        local_id,
                    }) => {
                        let _ = engine.event_tx.send(CoreEvent::MutationConfirmed {
                            collection,
                            local_id,
                        });
                    }
                    Ok(FeedNotice::StateChanged { collection, state }) => {
                        let _ = engine
                            .event_tx
                            .send(CoreEvent::FeedStateChanged { collection, state });
                    }
                    Ok(FeedNotice::ResyncStarted { collection }) => {
                        let _ = engine
                            .event_tx
                            .send(CoreEvent::ResyncPerformed { collection });
                    }
                    Ok(FeedNotice::FeedError {
                        collection,
                        message,
                    }) => {
                        let _ = engine
                            .event_tx
                            .send(CoreEvent::DegradedSync {
                                collection,
                                message,
                            });
                    }
                    Ok(FeedNotice::EventsApplied { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "feed notice stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Forward resolved presence changes as engine events
    fn spawn_presence_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut changes = self.presence.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let _ = engine.event_tx.send(CoreEvent::PresenceChanged {
                            user_id: change.user_id,
                            status: change.record.status,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex as PlMutex;
    use ulid::Ulid;

    /// Scripted write API: pops the next outcome per submitted request
    struct ScriptedWrites {
        outcomes: PlMutex<Vec<ChatResult<WriteAck>>>,
        requests: PlMutex<Vec<WriteRequest>>,
    }

    impl ScriptedWrites {
        fn new(outcomes: Vec<ChatResult<WriteAck>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: PlMutex::new(outcomes),
                requests: PlMutex::new(Vec::new()),
            })
        }

        fn ack() -> ChatResult<WriteAck> {
            Ok(WriteAck {
                transaction_id: TransactionId(Ulid::new()),
            })
        }
    }

    impl WriteApi for ScriptedWrites {
        fn submit(&self, request: WriteRequest) -> BoxFuture<'static, ChatResult<WriteAck>> {
            self.requests.lock().push(request);
            let mut outcomes = self.outcomes.lock();
            let outcome = if outcomes.is_empty() {
                Self::ack()
            } else {
                outcomes.remove(0)
            };
            async move { outcome }.boxed()
        }
    }

    fn message(body: &str) -> Payload {
        Payload::Message {
            channel_id: "general".into(),
            body: body.to_string(),
            edited: false,
        }
    }

    async fn settle() {
        // Let spawned driver tasks run
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_apply_mutation_attaches_transaction() {
        let api = ScriptedWrites::new(vec![ScriptedWrites::ack()]);
        let (engine, _commands) = ChorusEngine::new(api.clone(), CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);

        let handle = engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        settle().await;

        let pending = engine.mutations().get_pending(&handle).unwrap();
        assert!(pending.transaction_id.is_some());
        assert_eq!(api.requests.lock().len(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_write_rolls_back() {
        let api = ScriptedWrites::new(vec![Err(ChatError::WriteRejected {
            reason: "too long".to_string(),
        })]);
        let (engine, _commands) = ChorusEngine::new(api, CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);
        let mut events = engine.subscribe_events();

        engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        settle().await;

        assert_eq!(engine.mutations().pending_count(), 0);
        loop {
            match events.try_recv() {
                Ok(CoreEvent::MutationRolledBack { reason, .. }) => {
                    assert_eq!(reason, RollbackReason::Rejected("too long".to_string()));
                    break;
                }
                Ok(_) => continue,
                Err(err) => panic!("no rollback event: {err}"),
            }
        }
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_write_queues_behind_offline_gate() {
        let api = ScriptedWrites::new(vec![ScriptedWrites::ack()]);
        let (engine, _commands) = ChorusEngine::new(api.clone(), CoreConfig::default());

        let handle = engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        settle().await;
        // Offline: the write has not been attempted
        assert!(api.requests.lock().is_empty());
        assert!(engine
            .mutations()
            .get_pending(&handle)
            .unwrap()
            .transaction_id
            .is_none());

        engine.set_connectivity(ConnectivityState::Online);
        settle().await;
        assert_eq!(api.requests.lock().len(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_finished_write_drivers_are_reaped() {
        let api = ScriptedWrites::new(vec![]);
        let (engine, _commands) = ChorusEngine::new(api, CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);
        let baseline = engine.tasks.lock().len();

        for i in 0..32 {
            engine
                .apply_mutation(Collection::Messages, LocalId(format!("m{i}")), message("hi"))
                .unwrap();
            settle().await;
        }

        // Settled drivers are dropped on the next apply; only the newest
        // one may still be tracked.
        assert!(engine.tasks.lock().len() <= baseline + 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_write_timeout_error_is_ambiguous_not_retried() {
        let api = ScriptedWrites::new(vec![Err(ChatError::WriteTimeout(Duration::from_secs(5)))]);
        let (engine, _commands) = ChorusEngine::new(api.clone(), CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);

        engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        settle().await;

        // The first attempt may have committed: no re-submit, entry kept
        // for content match or the long expiry bound
        assert_eq!(api.requests.lock().len(), 1);
        assert_eq!(engine.mutations().pending_count(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_feed_error_surfaces_as_degraded_sync() {
        let api = ScriptedWrites::new(vec![]);
        let (engine, _commands) = ChorusEngine::new(api, CoreConfig::default());
        engine.subscribe_feed(Collection::Messages);
        let mut events = engine.subscribe_events();

        engine
            .feed()
            .report_error(Collection::Messages, "malformed frame");
        settle().await;

        loop {
            match events.try_recv() {
                Ok(CoreEvent::DegradedSync {
                    collection,
                    message,
                }) => {
                    assert_eq!(collection, Collection::Messages);
                    assert_eq!(message, "malformed frame");
                    break;
                }
                Ok(_) => continue,
                Err(err) => panic!("no degraded-sync event: {err}"),
            }
        }
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_correlation_unavailable_keeps_pending() {
        let api = ScriptedWrites::new(vec![Err(ChatError::CorrelationUnavailable)]);
        let (engine, _commands) = ChorusEngine::new(api, CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);

        engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        settle().await;

        // Ambiguous outcome: not rolled back, not attached
        assert_eq!(engine.mutations().pending_count(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_unavailable_write_retries_then_succeeds() {
        let api = ScriptedWrites::new(vec![
            Err(ChatError::WriteUnavailable("503".to_string())),
            ScriptedWrites::ack(),
        ]);
        let config = CoreConfig {
            retry: RetryConfig {
                base_delay: Duration::from_millis(1),
                jitter: 0.0,
                ..RetryConfig::default()
            },
            ..CoreConfig::default()
        };
        let (engine, _commands) = ChorusEngine::new(api.clone(), config);
        engine.set_connectivity(ConnectivityState::Online);

        let handle = engine
            .apply_mutation(Collection::Messages, "m1".into(), message("hi"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(api.requests.lock().len(), 2);
        assert!(engine
            .mutations()
            .get_pending(&handle)
            .unwrap()
            .transaction_id
            .is_some());
        assert_eq!(
            engine
                .retry()
                .failure_count(Collection::Messages, OperationKind::Write),
            0
        );
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_online_transition_resets_retries_and_resumes_feed() {
        let api = ScriptedWrites::new(vec![]);
        let (engine, mut commands) = ChorusEngine::new(api, CoreConfig::default());
        engine.set_connectivity(ConnectivityState::Online);

        engine.subscribe_feed(Collection::Messages);
        engine.feed().begin_snapshot(Collection::Messages);
        engine
            .feed()
            .snapshot_loaded(Collection::Messages, Vec::new(), crate::types::LogPosition(4));
        while commands.try_recv().is_ok() {}

        engine
            .retry()
            .record_failure(Collection::Messages, OperationKind::Write);
        engine.feed().connection_lost(Collection::Messages);
        engine.set_connectivity(ConnectivityState::Offline);
        engine.set_connectivity(ConnectivityState::Online);
        settle().await;

        assert_eq!(
            engine
                .retry()
                .failure_count(Collection::Messages, OperationKind::Write),
            0
        );
        assert_eq!(
            commands.try_recv().unwrap(),
            FeedCommand::Connect {
                collection: Collection::Messages,
                resume_from: Some(crate::types::LogPosition(4)),
            }
        );
        engine.shutdown();
    }
}
