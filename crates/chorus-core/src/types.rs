//! Core types for the Chorus reconciliation core

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A synced collection of the chat application.
///
/// Each collection has its own change feed, its own cache, and its own
/// tagged payload variant. Ordering is guaranteed within a collection,
/// never across collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Chat messages
    Messages,
    /// Channel metadata
    Channels,
    /// Outgoing webhooks
    Webhooks,
}

impl Collection {
    /// All collections, in a fixed order
    pub const ALL: [Collection; 3] = [
        Collection::Messages,
        Collection::Channels,
        Collection::Webhooks,
    ];
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Collection::Messages => write!(f, "messages"),
            Collection::Channels => write!(f, "channels"),
            Collection::Webhooks => write!(f, "webhooks"),
        }
    }
}

/// Tagged mutation/row payload, one variant per collection.
///
/// Validated at the boundary: a payload submitted to, or arriving on,
/// a collection it does not belong to is rejected before it can reach
/// the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// A chat message row
    Message {
        /// Channel the message belongs to
        channel_id: ChannelId,
        /// Message body
        body: String,
        /// Whether this row is an edit of an earlier body
        edited: bool,
    },
    /// A channel row
    Channel {
        /// Display name
        name: String,
        /// Optional topic line
        topic: Option<String>,
    },
    /// An outgoing webhook row
    Webhook {
        /// Display name
        name: String,
        /// Target URL
        url: String,
        /// Whether the webhook fires
        enabled: bool,
    },
}

impl Payload {
    /// The collection this payload belongs to
    pub fn collection(&self) -> Collection {
        match self {
            Payload::Message { .. } => Collection::Messages,
            Payload::Channel { .. } => Collection::Channels,
            Payload::Webhook { .. } => Collection::Webhooks,
        }
    }
}

/// Client-side identifier of the entity a mutation targets.
///
/// For a brand-new entity this is a freshly generated ULID string; for an
/// edit it is the key of the row being edited. At most one pending mutation
/// exists per (collection, local id) at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub String);

impl LocalId {
    /// Generate a fresh time-ordered id for a new entity
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl From<&str> for LocalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned row key within a collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub String);

impl RowId {
    /// Row key an optimistic (not yet confirmed) entity lives under
    pub fn local(id: &LocalId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation token linking a write call to its row(s) in the change feed.
///
/// Opaque to callers; produced exactly once per committed write by the
/// [`TransactionCorrelator`](crate::correlator::TransactionCorrelator) and
/// never used as a business key. ULID generation under the correlator's
/// commit lock keeps ids monotonically orderable within one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Ulid);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx_{}", self.0)
    }
}

/// Position in a collection's commit log. Strictly increasing per collection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LogPosition(pub u64);

impl LogPosition {
    /// The next position after this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Authenticated user identifier, supplied by the external identity source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connected session (device/tab) of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a new random SessionId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Channel identifier (business key, not a correlation token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Row operation carried by a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOperation {
    /// New row
    Insert,
    /// Existing row replaced
    Update,
    /// Row removed
    Delete,
}

/// One committed row change observed on a collection's change feed.
///
/// Strictly ordered by `log_position` within a collection; no ordering
/// across collections. `payload` is `None` only for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Collection the row belongs to
    pub collection: Collection,
    /// Server row key
    pub row_id: RowId,
    /// Correlation token of the originating write, if the writer supplied one
    pub transaction_id: Option<TransactionId>,
    /// What happened to the row
    pub operation: FeedOperation,
    /// Authoritative row payload (`None` for deletes)
    pub payload: Option<Payload>,
    /// Position in the collection's commit log
    pub log_position: LogPosition,
}

/// Process-wide connectivity state. Written only by the
/// [`NetworkMonitor`](crate::network::NetworkMonitor), read by everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Network reachable
    Online,
    /// Network unreachable; new work queues behind the gate
    #[default]
    Offline,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

/// Presence status of a user or session.
///
/// Total precedence order for multi-session resolution, highest first:
/// `Dnd > Busy > Away > Online > Offline`. The derived `Ord` encodes it
/// (later variants take precedence).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// No live session
    #[default]
    Offline,
    /// Connected
    Online,
    /// Idle
    Away,
    /// Occupied
    Busy,
    /// Do not disturb
    Dnd,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Offline => write!(f, "offline"),
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Away => write!(f, "away"),
            PresenceStatus::Busy => write!(f, "busy"),
            PresenceStatus::Dnd => write!(f, "dnd"),
        }
    }
}

/// Read-only snapshot of a user's merged presence.
///
/// Owned by the [`PresenceReconciler`](crate::presence::PresenceReconciler);
/// readers only ever see copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// The user this record describes
    pub user_id: UserId,
    /// Resolved status across all live sessions
    pub status: PresenceStatus,
    /// Custom message attached to a manual status, if any
    pub custom_message: Option<String>,
    /// Channel of the most recently updated live session
    pub active_channel_id: Option<ChannelId>,
    /// Wall-clock time of the newest heartbeat across sessions (unix ms)
    pub last_heartbeat: Option<i64>,
    /// Number of live sessions
    pub session_count: usize,
}

impl PresenceRecord {
    /// Record for a user with no live sessions
    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            custom_message: None,
            active_channel_id: None,
            last_heartbeat: None,
            session_count: 0,
        }
    }
}
