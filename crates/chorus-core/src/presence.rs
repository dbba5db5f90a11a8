//! Presence reconciliation across concurrent sessions.
//!
//! Every connected session (device, tab) of a user heartbeats on a fixed
//! interval. The [`PresenceReconciler`] merges those per-session updates
//! into one [`PresenceRecord`] per user:
//!
//! - updates are applied per-session, never as a whole-record replace, so
//!   concurrent heartbeats from two sessions of one user cannot overwrite
//!   each other;
//! - a live manual status (its setting session still alive) beats every
//!   implicit status; among implicit statuses the precedence order
//!   `dnd > busy > away > online` decides;
//! - a background sweep expires sessions whose heartbeat is older than the
//!   grace window (heartbeat interval × grace multiplier); a user with zero
//!   live sessions is `offline`.
//!
//! Readers only ever receive snapshot copies; the session table is owned
//! exclusively by the reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ChatResult};
use crate::types::{ChannelId, PresenceRecord, PresenceStatus, SessionId, UserId};

/// Default capacity for the presence event broadcast channel
const PRESENCE_CHANNEL_CAPACITY: usize = 256;

/// Presence timing configuration
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Expected heartbeat interval
    pub heartbeat_interval: Duration,
    /// A session expires after `heartbeat_interval * grace_multiplier`
    /// without a heartbeat
    pub grace_multiplier: u32,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
}

impl PresenceConfig {
    /// The window after which a silent session is considered dead
    pub fn grace_window(&self) -> Duration {
        self.heartbeat_interval * self.grace_multiplier
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            grace_multiplier: 3,
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Emitted whenever a user's resolved presence changes
#[derive(Debug, Clone)]
pub struct PresenceChange {
    /// The user whose presence changed
    pub user_id: UserId,
    /// The newly resolved record
    pub record: PresenceRecord,
}

/// Report from one expiry sweep
#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    /// Sessions expired this sweep
    pub sessions_expired: usize,
    /// Users that transitioned to offline
    pub users_offline: usize,
}

#[derive(Debug, Clone)]
struct SessionState {
    status: PresenceStatus,
    active_channel_id: Option<ChannelId>,
    last_heartbeat: Instant,
    last_heartbeat_wall: i64,
}

#[derive(Debug, Clone)]
struct ManualStatus {
    status: PresenceStatus,
    custom_message: Option<String>,
    /// The session that set it; the override dies with this session
    session_id: SessionId,
}

#[derive(Debug, Default)]
struct UserState {
    sessions: HashMap<SessionId, SessionState>,
    manual: Option<ManualStatus>,
}

impl UserState {
    /// Resolve the user-level record from all live sessions. Called with
    /// the table's write lock held, so the read is atomic with respect to
    /// concurrent heartbeats.
    fn resolve(&self, user_id: &UserId) -> PresenceRecord {
        if self.sessions.is_empty() {
            return PresenceRecord::offline(user_id.clone());
        }

        let manual = self
            .manual
            .as_ref()
            .filter(|m| self.sessions.contains_key(&m.session_id));

        let implicit = self
            .sessions
            .values()
            .map(|s| s.status)
            .max()
            .unwrap_or(PresenceStatus::Offline);

        let (status, custom_message) = match manual {
            Some(m) => (m.status, m.custom_message.clone()),
            None => (implicit, None),
        };

        // Most recently updated session wins the active-channel slot
        let newest = self
            .sessions
            .values()
            .max_by_key(|s| s.last_heartbeat);

        PresenceRecord {
            user_id: user_id.clone(),
            status,
            custom_message,
            active_channel_id: newest.and_then(|s| s.active_channel_id.clone()),
            last_heartbeat: newest.map(|s| s.last_heartbeat_wall),
            session_count: self.sessions.len(),
        }
    }
}

/// Merges heartbeat and status events into per-user presence records
pub struct PresenceReconciler {
    users: RwLock<HashMap<UserId, UserState>>,
    config: PresenceConfig,
    event_tx: broadcast::Sender<PresenceChange>,
}

impl PresenceReconciler {
    /// Create a reconciler with the given timing configuration
    pub fn new(config: PresenceConfig) -> Self {
        let (event_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            users: RwLock::new(HashMap::new()),
            config,
            event_tx,
        }
    }

    /// Subscribe to resolved presence changes
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.event_tx.subscribe()
    }

    /// Record a heartbeat from one session of a user.
    ///
    /// Creates the session on first sight. The user-level record is
    /// recomputed under the same lock that applied the update.
    pub fn heartbeat(
        &self,
        user_id: UserId,
        session_id: SessionId,
        status: PresenceStatus,
        active_channel_id: Option<ChannelId>,
    ) -> PresenceRecord {
        let mut users = self.users.write();
        let state = users.entry(user_id.clone()).or_default();
        let is_new = !state.sessions.contains_key(&session_id);
        state.sessions.insert(
            session_id,
            SessionState {
                status,
                active_channel_id,
                last_heartbeat: Instant::now(),
                last_heartbeat_wall: chrono::Utc::now().timestamp_millis(),
            },
        );
        if is_new {
            debug!(%user_id, %session_id, %status, "session joined");
        }
        let record = state.resolve(&user_id);
        drop(users);
        self.publish(user_id, record.clone());
        record
    }

    /// Pin a manual status for a user, overriding implicit statuses until
    /// cleared or until the setting session disconnects.
    pub fn set_manual_status(
        &self,
        user_id: UserId,
        session_id: SessionId,
        status: PresenceStatus,
        custom_message: Option<String>,
    ) -> PresenceRecord {
        let mut users = self.users.write();
        let state = users.entry(user_id.clone()).or_default();
        state.manual = Some(ManualStatus {
            status,
            custom_message,
            session_id,
        });
        info!(%user_id, %session_id, %status, "manual status set");
        let record = state.resolve(&user_id);
        drop(users);
        self.publish(user_id, record.clone());
        record
    }

    /// Clear a user's manual status override
    pub fn clear_manual_status(&self, user_id: &UserId) -> PresenceRecord {
        let mut users = self.users.write();
        let record = match users.get_mut(user_id) {
            Some(state) => {
                state.manual = None;
                state.resolve(user_id)
            }
            None => PresenceRecord::offline(user_id.clone()),
        };
        drop(users);
        self.publish(user_id.clone(), record.clone());
        record
    }

    /// Explicitly disconnect one session (clean logout, socket close)
    pub fn disconnect(&self, user_id: &UserId, session_id: SessionId) -> PresenceRecord {
        let mut users = self.users.write();
        let record = match users.get_mut(user_id) {
            Some(state) => {
                state.sessions.remove(&session_id);
                if state
                    .manual
                    .as_ref()
                    .is_some_and(|m| m.session_id == session_id)
                {
                    state.manual = None;
                }
                debug!(%user_id, %session_id, "session disconnected");
                state.resolve(user_id)
            }
            None => PresenceRecord::offline(user_id.clone()),
        };
        drop(users);
        self.publish(user_id.clone(), record.clone());
        record
    }

    /// Read-only snapshot of a user's merged presence
    pub fn get_presence(&self, user_id: &UserId) -> PresenceRecord {
        let users = self.users.read();
        users
            .get(user_id)
            .map(|state| state.resolve(user_id))
            .unwrap_or_else(|| PresenceRecord::offline(user_id.clone()))
    }

    /// Expire sessions whose heartbeat lapsed past the grace window.
    ///
    /// Best-effort: rather than queue behind a busy table, a contended
    /// sweep returns [`ChatError::PresenceSweepSkipped`] and the next tick
    /// retries.
    pub fn sweep(&self, now: Instant) -> ChatResult<SweepReport> {
        let grace = self.config.grace_window();
        let mut report = SweepReport::default();
        let mut changes = Vec::new();

        {
            let Some(mut users) = self.users.try_write() else {
                return Err(ChatError::PresenceSweepSkipped {
                    reason: "presence table contended".to_string(),
                });
            };
            for (user_id, state) in users.iter_mut() {
                let before = state.sessions.len();
                state
                    .sessions
                    .retain(|_, s| now.saturating_duration_since(s.last_heartbeat) < grace);
                let dropped = before - state.sessions.len();
                if dropped == 0 {
                    continue;
                }
                report.sessions_expired += dropped;
                if state
                    .manual
                    .as_ref()
                    .is_some_and(|m| !state.sessions.contains_key(&m.session_id))
                {
                    state.manual = None;
                }
                if state.sessions.is_empty() {
                    report.users_offline += 1;
                }
                changes.push((user_id.clone(), state.resolve(user_id)));
            }
            users.retain(|_, state| !state.sessions.is_empty() || state.manual.is_some());
        }

        for (user_id, record) in changes {
            self.publish(user_id, record);
        }
        if report.sessions_expired > 0 {
            debug!(
                sessions = report.sessions_expired,
                offline = report.users_offline,
                "presence sweep expired sessions"
            );
        }
        Ok(report)
    }

    /// Spawn the fixed-interval background sweeper.
    ///
    /// A failed sweep is logged and retried on the next tick, never fatal.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = self.clone();
        let interval = reconciler.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = reconciler.sweep(Instant::now()) {
                    warn!(%err, "presence sweep skipped");
                }
            }
        })
    }

    fn publish(&self, user_id: UserId, record: PresenceRecord) {
        let _ = self.event_tx.send(PresenceChange { user_id, record });
    }
}

impl Default for PresenceReconciler {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> PresenceReconciler {
        PresenceReconciler::new(PresenceConfig {
            heartbeat_interval: Duration::from_secs(10),
            grace_multiplier: 3,
            sweep_interval: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_unknown_user_is_offline() {
        let presence = reconciler();
        let record = presence.get_presence(&"alice".into());
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.session_count, 0);
    }

    #[test]
    fn test_implicit_precedence_across_sessions() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let laptop = SessionId::new();
        let phone = SessionId::new();

        presence.heartbeat(user.clone(), laptop, PresenceStatus::Online, None);
        let record = presence.heartbeat(user.clone(), phone, PresenceStatus::Busy, None);
        assert_eq!(record.status, PresenceStatus::Busy);
        assert_eq!(record.session_count, 2);
    }

    #[test]
    fn test_manual_status_beats_implicit() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let laptop = SessionId::new();
        let phone = SessionId::new();

        presence.heartbeat(user.clone(), laptop, PresenceStatus::Online, None);
        presence.heartbeat(user.clone(), phone, PresenceStatus::Online, None);
        let record = presence.set_manual_status(
            user.clone(),
            phone,
            PresenceStatus::Dnd,
            Some("heads down".to_string()),
        );
        assert_eq!(record.status, PresenceStatus::Dnd);
        assert_eq!(record.custom_message.as_deref(), Some("heads down"));
    }

    #[test]
    fn test_manual_status_dies_with_its_session() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let laptop = SessionId::new();
        let phone = SessionId::new();

        presence.heartbeat(user.clone(), laptop, PresenceStatus::Online, None);
        presence.heartbeat(user.clone(), phone, PresenceStatus::Online, None);
        presence.set_manual_status(user.clone(), phone, PresenceStatus::Dnd, None);

        let record = presence.disconnect(&user, phone);
        assert_eq!(record.status, PresenceStatus::Online);
        assert_eq!(record.session_count, 1);
    }

    #[test]
    fn test_active_channel_follows_newest_session() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let laptop = SessionId::new();
        let phone = SessionId::new();

        presence.heartbeat(
            user.clone(),
            laptop,
            PresenceStatus::Online,
            Some("general".into()),
        );
        let record = presence.heartbeat(
            user.clone(),
            phone,
            PresenceStatus::Online,
            Some("random".into()),
        );
        assert_eq!(record.active_channel_id, Some("random".into()));
    }

    #[test]
    fn test_sweep_expires_lapsed_sessions() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let session = SessionId::new();
        presence.heartbeat(user.clone(), session, PresenceStatus::Online, None);

        // Within the 30s grace window nothing expires
        let report = presence
            .sweep(Instant::now() + Duration::from_secs(29))
            .unwrap();
        assert_eq!(report.sessions_expired, 0);
        assert_eq!(presence.get_presence(&user).status, PresenceStatus::Online);

        let report = presence
            .sweep(Instant::now() + Duration::from_secs(31))
            .unwrap();
        assert_eq!(report.sessions_expired, 1);
        assert_eq!(report.users_offline, 1);
        assert_eq!(presence.get_presence(&user).status, PresenceStatus::Offline);
    }

    #[test]
    fn test_sweep_skips_while_table_contended() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        presence.heartbeat(user.clone(), SessionId::new(), PresenceStatus::Online, None);

        let guard = presence.users.read();
        let err = presence
            .sweep(Instant::now() + Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, ChatError::PresenceSweepSkipped { .. }));
        // Skipped, not failed: nothing was expired
        drop(guard);
        assert_eq!(presence.get_presence(&user).session_count, 1);

        let report = presence
            .sweep(Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(report.sessions_expired, 1);
    }

    #[test]
    fn test_sweep_drops_manual_status_of_lapsed_session() {
        let presence = reconciler();
        let user: UserId = "alice".into();
        let laptop = SessionId::new();
        let phone = SessionId::new();

        let phone_beat = Instant::now();
        presence.heartbeat(user.clone(), phone, PresenceStatus::Online, None);
        presence.set_manual_status(user.clone(), phone, PresenceStatus::Dnd, None);

        // The laptop beats 50ms later, so there is a window where only the
        // phone's heartbeat has lapsed past the 30s grace.
        std::thread::sleep(Duration::from_millis(50));
        presence.heartbeat(user.clone(), laptop, PresenceStatus::Online, None);

        let report = presence
            .sweep(phone_beat + Duration::from_secs(30) + Duration::from_millis(25))
            .unwrap();
        assert_eq!(report.sessions_expired, 1);

        // The dnd override lapsed with its session; the live laptop wins
        let record = presence.get_presence(&user);
        assert_eq!(record.status, PresenceStatus::Online);
        assert_eq!(record.session_count, 1);
    }

    #[tokio::test]
    async fn test_presence_change_events() {
        let presence = reconciler();
        let mut rx = presence.subscribe();
        presence.heartbeat("alice".into(), SessionId::new(), PresenceStatus::Online, None);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.user_id, "alice".into());
        assert_eq!(change.record.status, PresenceStatus::Online);
    }
}
