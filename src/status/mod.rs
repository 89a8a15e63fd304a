//! Lifecycle status tracking — one authoritative state per server plus a
//! broadcast feed of transitions for UI layers and the relay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;

/// Run-state of a managed server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Uninstalled,
    Stopped,
    Initializing,
    Running,
    Stopping,
    Updating,
}

impl LifecycleStatus {
    /// Stable states accept new operation requests; transient ones do not.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Stopped | LifecycleStatus::Running | LifecycleStatus::Uninstalled
        )
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleStatus::Uninstalled => "uninstalled",
            LifecycleStatus::Stopped => "stopped",
            LifecycleStatus::Initializing => "initializing",
            LifecycleStatus::Running => "running",
            LifecycleStatus::Stopping => "stopping",
            LifecycleStatus::Updating => "updating",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
    #[error("lock poisoned")]
    LockPoisoned,
}

/// One accepted transition, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub server_id: String,
    pub from: LifecycleStatus,
    pub to: LifecycleStatus,
}

pub struct StatusTracker {
    states: Mutex<HashMap<String, LifecycleStatus>>,
    events: broadcast::Sender<StatusChange>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, LifecycleStatus>>, StatusError> {
        self.states.lock().map_err(|e| {
            tracing::error!("StatusTracker lock poisoned: {}", e);
            StatusError::LockPoisoned
        })
    }

    /// Legal edges of the lifecycle machine. The `Running -> Stopped` edge
    /// covers asynchronous process-exit observation (crash or external kill).
    pub fn can_transition(from: LifecycleStatus, to: LifecycleStatus) -> bool {
        use LifecycleStatus::*;
        matches!(
            (from, to),
            (Uninstalled, Updating)
                | (Uninstalled, Initializing)
                | (Stopped, Initializing)
                | (Stopped, Updating)
                | (Initializing, Running)
                | (Initializing, Stopped)
                | (Initializing, Stopping)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Updating, Stopped)
        )
    }

    /// Seed (or reset) a server's state without legality checks. Used when
    /// profiles are loaded; not part of the operation flow.
    pub fn register(&self, server_id: &str, status: LifecycleStatus) {
        if let Ok(mut states) = self.lock() {
            states.insert(server_id.to_string(), status);
        }
    }

    pub fn remove(&self, server_id: &str) {
        if let Ok(mut states) = self.lock() {
            states.remove(server_id);
        }
    }

    /// Current status; servers never registered report `Uninstalled`.
    pub fn get(&self, server_id: &str) -> LifecycleStatus {
        self.lock()
            .ok()
            .and_then(|states| states.get(server_id).copied())
            .unwrap_or(LifecycleStatus::Uninstalled)
    }

    /// Apply a transition, firing the change feed on success. Setting the
    /// current status again is a silent no-op.
    pub fn set(&self, server_id: &str, to: LifecycleStatus) -> Result<(), StatusError> {
        let from = {
            let mut states = self.lock()?;
            let from = states
                .get(server_id)
                .copied()
                .unwrap_or(LifecycleStatus::Uninstalled);
            if from == to {
                return Ok(());
            }
            if !Self::can_transition(from, to) {
                return Err(StatusError::InvalidTransition { from, to });
            }
            states.insert(server_id.to_string(), to);
            from
        };

        tracing::info!("Server '{}' status: {} -> {}", server_id, from, to);
        let _ = self.events.send(StatusChange {
            server_id: server_id.to_string(),
            from,
            to,
        });
        Ok(())
    }

    /// Claim a transition for an operation about to begin. Unlike `set`, a
    /// same-status call is an error instead of a no-op, so two dispatches
    /// racing toward the same transient state cannot both believe they
    /// performed it. Returns the prior status on success.
    pub fn claim(
        &self,
        server_id: &str,
        to: LifecycleStatus,
    ) -> Result<LifecycleStatus, StatusError> {
        let from = {
            let mut states = self.lock()?;
            let from = states
                .get(server_id)
                .copied()
                .unwrap_or(LifecycleStatus::Uninstalled);
            if from == to || !Self::can_transition(from, to) {
                return Err(StatusError::InvalidTransition { from, to });
            }
            states.insert(server_id.to_string(), to);
            from
        };

        tracing::info!("Server '{}' status: {} -> {}", server_id, from, to);
        let _ = self.events.send(StatusChange {
            server_id: server_id.to_string(),
            from,
            to,
        });
        Ok(from)
    }

    /// Roll back a claimed transition, bypassing legality checks (the
    /// reverse of a claimed edge is not generally a legal edge). Fires the
    /// change feed so subscribers see the revert. Used when the claimed
    /// operation never actually ran.
    pub fn rollback(&self, server_id: &str, to: LifecycleStatus) {
        let from = {
            let mut states = match self.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            let from = states
                .get(server_id)
                .copied()
                .unwrap_or(LifecycleStatus::Uninstalled);
            if from == to {
                return;
            }
            states.insert(server_id.to_string(), to);
            from
        };

        tracing::info!("Server '{}' status rolled back: {} -> {}", server_id, from, to);
        let _ = self.events.send(StatusChange {
            server_id: server_id.to_string(),
            from,
            to,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }
}
