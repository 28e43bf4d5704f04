//! Sync state snapshots and their publication.
//!
//! The orchestrator publishes whole `SyncState` snapshots. A subscriber that
//! attaches mid-sync gets the latest snapshot first, then every later one.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::model::DeviceId;
use crate::reconcile::UserOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Users,
    Logs,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub ok: usize,
    pub failed: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.ok + self.failed
    }
}

/// Outcome of visiting one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSyncResult {
    pub device_id: DeviceId,
    pub device_name: String,
    pub connected: bool,
    pub error: Option<String>,
    pub users: Tally,
    pub logs: Tally,
    pub templates_imported: usize,
    pub user_outcomes: Vec<UserOutcome>,
}

impl DeviceSyncResult {
    pub fn new(device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            connected: false,
            error: None,
            users: Tally::default(),
            logs: Tally::default(),
            templates_imported: 0,
            user_outcomes: Vec::new(),
        }
    }

    pub fn record_user(&mut self, outcome: UserOutcome) {
        if outcome.is_success() {
            self.users.ok += 1;
        } else {
            self.users.failed += 1;
        }
        self.user_outcomes.push(outcome);
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.users.failed == 0 && self.logs.failed == 0
    }
}

/// Snapshot published to progress subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub is_syncing: bool,
    pub progress: u8,
    pub message: String,
    pub current_device_index: usize,
    pub total_devices: usize,
    pub per_device_result: Vec<DeviceSyncResult>,
}

impl SyncState {
    pub fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            is_syncing: false,
            progress: 0,
            message: String::new(),
            current_device_index: 0,
            total_devices: 0,
            per_device_result: Vec::new(),
        }
    }

    /// JSON form for forwarding to an event stream.
    pub fn to_event_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Publishes `SyncState` snapshots to any number of subscribers.
#[derive(Clone)]
pub struct ProgressHub {
    tx: Arc<watch::Sender<SyncState>>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncState::idle());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    /// Mutate the live snapshot. Progress never moves backwards while a
    /// sync is running.
    pub fn update(&self, f: impl FnOnce(&mut SyncState)) {
        self.tx.send_modify(|state| {
            let floor = if state.is_syncing { state.progress } else { 0 };
            f(state);
            if state.is_syncing {
                state.progress = state.progress.max(floor).min(100);
            }
        });
    }

    pub fn replace(&self, state: SyncState) {
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: Some(self.tx.subscribe()),
            primed: false,
        }
    }
}

pub struct ProgressSubscription {
    rx: Option<watch::Receiver<SyncState>>,
    primed: bool,
}

impl ProgressSubscription {
    /// The current snapshot on the first call, then the next change.
    /// `None` once unsubscribed or the hub is gone.
    pub async fn next(&mut self) -> Option<SyncState> {
        let rx = self.rx.as_mut()?;
        if !self.primed {
            self.primed = true;
            return Some(rx.borrow_and_update().clone());
        }
        rx.changed().await.ok()?;
        Some(rx.borrow_and_update().clone())
    }

    /// Detach. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.rx.is_some()
    }
}
