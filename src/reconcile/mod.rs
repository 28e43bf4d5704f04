//! Per-device, per-user reconciliation between the durable store and a
//! terminal.
//!
//! - [`push`]: converge a device to the stored user and its templates.
//! - [`pull`]: read a device back into the store.

pub mod pull;
pub mod push;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::model::{BusinessUserId, DeviceUid, DeviceUser};
use crate::store::DurableStore;

pub use pull::PullReport;
pub use push::PushReport;

/// Computes and applies device-side changes for one user at a time.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DurableStore>,
    settle_delay: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DurableStore>, settle_delay: Duration) -> Self {
        Self {
            store,
            settle_delay,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }
}

/// Pick the device uid for a user the device does not know yet.
///
/// The next uid after the highest in use. On a device with no users the
/// business id itself is used when it is numeric, which can later collide
/// with a `max + 1` allocation.
pub fn allocate_uid(users: &[DeviceUser], id: &BusinessUserId) -> Result<DeviceUid> {
    match users.iter().map(|u| u.uid.0).max() {
        Some(max) => max
            .checked_add(1)
            .map(DeviceUid)
            .ok_or(SyncError::UidSpaceExhausted),
        None => Ok(DeviceUid(
            id.as_str()
                .parse::<u16>()
                .ok()
                .filter(|&n| n > 0)
                .unwrap_or(1),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Inserted,
    Updated,
    Unchanged,
    /// Device name was only digits, so the device copy was not trusted.
    SkippedPlaceholder,
    Pushed,
    /// Removed from the terminal outside of sync.
    Unlinked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Result of reconciling one user on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserOutcome {
    pub business_user_id: BusinessUserId,
    pub action: UserAction,
    pub templates_written: usize,
    pub mismatch: Option<Mismatch>,
    pub error: Option<String>,
}

impl UserOutcome {
    pub fn new(business_user_id: BusinessUserId, action: UserAction) -> Self {
        Self {
            business_user_id,
            action,
            templates_written: 0,
            mismatch: None,
            error: None,
        }
    }

    pub fn failed(business_user_id: BusinessUserId, error: &SyncError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(business_user_id, UserAction::Failed)
        }
    }

    pub fn is_success(&self) -> bool {
        self.action != UserAction::Failed
    }
}
