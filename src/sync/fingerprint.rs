//! Single-template changes outside of a bulk sync.
//!
//! Each operation takes the global [`FingerprintLock`], opens a session to
//! the device, converges the user to the new template set and disconnects.
//! Template bytes are never dropped from the store; a delete only marks the
//! finger absent on that device so it can be restored later.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Config, SessionConfig};
use crate::device::{Connector, DeviceSession};
use crate::error::{Result, SyncError};
use crate::model::{BusinessUserId, DeviceId, DeviceRecord, FingerprintTemplate, UserRecord};
use crate::reconcile::{PushReport, Reconciler};
use crate::store::DurableStore;
use crate::sync::desired_templates;
use crate::sync::lock::FingerprintLock;

pub struct FingerprintService {
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    lock: FingerprintLock,
    session: SessionConfig,
    lock_timeout: Option<Duration>,
}

impl FingerprintService {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        store: Arc<dyn DurableStore>,
        lock: FingerprintLock,
    ) -> Self {
        Self {
            connector,
            reconciler: Reconciler::new(store, config.transfer.settle_delay()),
            lock,
            session: config.session.clone(),
            lock_timeout: config.sync.lock_timeout(),
        }
    }

    /// Store `template` and write it to `device`.
    ///
    /// A finger previously deleted from that device is put back as well.
    pub async fn add_template(
        &self,
        device: DeviceId,
        template: FingerprintTemplate,
    ) -> Result<PushReport> {
        template.validate()?;
        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let (record, user) = self.resolve(device, &template.business_user_id).await?;
        let store = self.reconciler.store();
        store.upsert_template(&template).await?;
        info!(
            "Adding finger {} of {} on device {}",
            template.finger_index, template.business_user_id, device
        );

        let stored = store
            .get_templates(&template.business_user_id, Some(device))
            .await?;
        let mut desired = desired_templates(&stored);
        if !desired
            .iter()
            .any(|t| t.finger_index == template.finger_index)
        {
            desired.push(template);
        }
        self.push(&record, &user, &desired).await
    }

    /// Remove one finger from `device`. The stored bytes are kept and the
    /// finger is marked absent there.
    pub async fn delete_template(
        &self,
        device: DeviceId,
        id: &BusinessUserId,
        finger_index: u8,
    ) -> Result<PushReport> {
        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let (record, user) = self.resolve(device, id).await?;
        let stored = self.reconciler.store().get_templates(id, Some(device)).await?;
        if !stored.iter().any(|s| s.template.finger_index == finger_index) {
            return Err(SyncError::TemplateNotFound {
                user: id.to_string(),
                finger_index,
            });
        }
        info!("Deleting finger {} of {} on device {}", finger_index, id, device);

        let desired: Vec<FingerprintTemplate> = desired_templates(&stored)
            .into_iter()
            .filter(|t| t.finger_index != finger_index)
            .collect();
        self.push(&record, &user, &desired).await
    }

    /// Write a stored finger back to `device` after an earlier delete.
    pub async fn restore_template(
        &self,
        device: DeviceId,
        id: &BusinessUserId,
        finger_index: u8,
    ) -> Result<PushReport> {
        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let (record, user) = self.resolve(device, id).await?;
        let stored = self.reconciler.store().get_templates(id, Some(device)).await?;
        let Some(target) = stored
            .iter()
            .find(|s| s.template.finger_index == finger_index)
        else {
            return Err(SyncError::TemplateNotFound {
                user: id.to_string(),
                finger_index,
            });
        };
        info!("Restoring finger {} of {} on device {}", finger_index, id, device);

        let mut desired = desired_templates(&stored);
        if !desired.iter().any(|t| t.finger_index == finger_index) {
            desired.push(target.template.clone());
        }
        self.push(&record, &user, &desired).await
    }

    async fn resolve(
        &self,
        device: DeviceId,
        id: &BusinessUserId,
    ) -> Result<(DeviceRecord, UserRecord)> {
        let store = self.reconciler.store();
        let record = store
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.id == device)
            .ok_or(SyncError::DeviceNotFound(device))?;
        let user = store
            .get_user(id)
            .await?
            .ok_or_else(|| SyncError::UserNotFound(id.to_string()))?;
        Ok((record, user))
    }

    async fn push(
        &self,
        device: &DeviceRecord,
        user: &UserRecord,
        desired: &[FingerprintTemplate],
    ) -> Result<PushReport> {
        let mut session =
            DeviceSession::connect(&device.identity, self.connector.as_ref(), &self.session)
                .await?;
        let result = self
            .reconciler
            .push_user(&mut session, device.id, user, desired, false)
            .await;
        if let Err(e) = session.disconnect().await {
            debug!("Disconnect from {} failed: {}", device.name, e);
        }
        result
    }
}
