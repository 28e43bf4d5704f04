//! Sync orchestration
//!
//! ```text
//!   SyncCoordinator ──► for each device (sequential, under FingerprintLock)
//!        │                 DeviceSession ──► Reconciler ──► TemplateTransfer
//!        │
//!        └──► ProgressHub ──► SyncState snapshots ──► subscribers
//! ```
//!
//! Only one sync runs per process. Single-template changes go through
//! [`FingerprintService`] and share the same lock.

pub mod coordinator;
pub mod fingerprint;
pub mod lock;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::{Availability, FingerprintTemplate, StoredTemplate};

pub use coordinator::{SyncCoordinator, SyncMode, SyncReport, SyncRequest};
pub use fingerprint::FingerprintService;
pub use lock::{FingerprintGuard, FingerprintLock};
pub use state::{
    DeviceSyncResult, ProgressHub, ProgressSubscription, SyncPhase, SyncState, Tally,
};

/// Cooperative cancellation, checked between users and between log batches.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Templates that should be on a device: everything stored except fingers
/// marked absent there.
pub(crate) fn desired_templates(stored: &[StoredTemplate]) -> Vec<FingerprintTemplate> {
    stored
        .iter()
        .filter(|s| s.availability != Availability::Absent)
        .map(|s| s.template.clone())
        .collect()
}
