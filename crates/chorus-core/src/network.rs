//! Connectivity monitoring and the online gate.
//!
//! The [`NetworkMonitor`] is the single writer of the process-wide
//! [`ConnectivityState`]. Native connectivity notifications are fed in
//! through [`NetworkMonitor::set_state`]; everyone else either reads the
//! current state, subscribes to transitions, or awaits the gate.
//!
//! The gate replaces polling: a suspended write or feed resume awaits
//! [`OnlineGate::wait_online`] and is woken by the next online transition.

use tokio::sync::watch;
use tracing::info;

use crate::types::ConnectivityState;

/// Single source of truth for connectivity
pub struct NetworkMonitor {
    state_tx: watch::Sender<ConnectivityState>,
}

impl NetworkMonitor {
    /// Create a monitor with the given initial state
    pub fn new(initial: ConnectivityState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self { state_tx }
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Whether we are currently online
    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Feed a native connectivity notification in.
    ///
    /// Returns `true` when this was an actual transition. Repeated
    /// notifications of the current state are ignored.
    pub fn set_state(&self, state: ConnectivityState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(%state, "connectivity transition");
        }
        changed
    }

    /// Subscribe to connectivity transitions.
    ///
    /// The receiver always holds the current state; `changed().await`
    /// wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// The gate other components await on
    pub fn gate(&self) -> OnlineGate {
        OnlineGate {
            state_rx: self.state_tx.subscribe(),
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}

/// Binary latch over connectivity: open while online, closed while offline
#[derive(Clone)]
pub struct OnlineGate {
    state_rx: watch::Receiver<ConnectivityState>,
}

impl OnlineGate {
    /// Resolve immediately if online, otherwise suspend until the next
    /// online transition. Never polls.
    pub async fn wait_online(&mut self) {
        // wait_for is Err only when the monitor is gone; treat that as
        // permanently offline and park on a future that never resolves
        // rather than spinning.
        if self.state_rx
            .wait_for(|s| *s == ConnectivityState::Online)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }

    /// Non-blocking check
    pub fn is_open(&self) -> bool {
        *self.state_rx.borrow() == ConnectivityState::Online
    }
}
