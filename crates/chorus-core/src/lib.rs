//! Chorus Core Library
//!
//! The reconciliation core of the Chorus chat application: optimistic local
//! writes converged against an ordered, server-authoritative change feed.
//!
//! ## Overview
//!
//! A mutation (send a message, create a channel) applies to the local cache
//! immediately, before any network round trip. The durable write happens
//! remotely and returns a transaction id bound to the commit's position in
//! the change log; the change feed later delivers the committed row carrying
//! that id, which confirms — or, on failure paths, rolls back — the pending
//! local edit relative to all other activity in the same collection.
//!
//! ## Core pieces
//!
//! - [`TransactionCorrelator`]: server-side, binds each committed write to a
//!   commit-log position and hands the transaction id back synchronously
//! - [`OptimisticMutationStore`]: client-side table of applied-but-
//!   unconfirmed mutations, keyed by transaction id once acknowledged
//! - [`ChangeFeedConsumer`]: applies the ordered feed to the authoritative
//!   cache and drives reconciliation
//! - [`PresenceReconciler`]: merges per-session heartbeats into one presence
//!   record per user, with expiry
//! - [`NetworkMonitor`] and [`RetryCoordinator`]: the connectivity gate and
//!   bounded backoff that keep retries sane across network flaps
//! - [`ChorusEngine`]: wires it all together and exposes the application
//!   surface
//!
//! ## Quick Start
//!
//! ```ignore
//! use chorus_core::{ChorusEngine, Collection, ConnectivityState, CoreConfig, LocalId, Payload};
//!
//! let (engine, feed_commands) = ChorusEngine::new(write_api, CoreConfig::default());
//! engine.set_connectivity(ConnectivityState::Online);
//! engine.subscribe_feed(Collection::Messages);
//!
//! let handle = engine.apply_mutation(
//!     Collection::Messages,
//!     LocalId::generate(),
//!     Payload::Message {
//!         channel_id: "general".into(),
//!         body: "hello".to_string(),
//!         edited: false,
//!     },
//! )?;
//! // The cache already shows the message; the feed confirms it later.
//! ```

pub mod cache;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod feed;
pub mod logging;
pub mod mutations;
pub mod network;
pub mod presence;
pub mod retry;
pub mod types;

// Re-exports
pub use cache::{CacheRow, CacheSnapshot, CacheStore};
pub use correlator::{CommitBatch, CommitLog, CommitRow, MemoryLog, Tagged, TransactionCorrelator};
pub use engine::{
    ChorusEngine, CoreConfig, CoreEvent, RollbackReason, TimingConfig, WriteAck, WriteApi,
    WriteRequest,
};
pub use error::{ChatError, ChatResult, CommitLogError};
pub use feed::{ChangeFeedConsumer, FeedCommand, FeedNotice, FeedState};
pub use mutations::{
    CancelOutcome, ExpiredMutation, MutationConfig, MutationHandle, OptimisticMutationStore,
    PendingMutation, Reconciliation,
};
pub use network::{NetworkMonitor, OnlineGate};
pub use presence::{PresenceChange, PresenceConfig, PresenceReconciler, SweepReport};
pub use retry::{OperationKind, RetryConfig, RetryCoordinator, RetryDecision};
pub use types::*;
