//! Read a device's users and templates back into the store.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::device::DeviceSession;
use crate::error::Result;
use crate::model::{BusinessUserId, DeviceId, DeviceUser, UserRecord};
use crate::reconcile::{Reconciler, UserAction, UserOutcome};
use crate::sync::StopFlag;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub outcomes: Vec<UserOutcome>,
    pub templates_imported: usize,
    /// The stop flag was raised before every user was visited.
    pub stopped: bool,
}

impl Reconciler {
    /// Reconcile every user on the device with the store.
    ///
    /// New users are inserted. Users whose device name is only digits are
    /// left alone. Admin flags update the role tag for this device. Users the
    /// store links to this device but the device no longer has are unlinked.
    pub async fn pull_users(
        &self,
        session: &mut DeviceSession,
        device: DeviceId,
        stop: &StopFlag,
    ) -> Result<PullReport> {
        let device_users = session.get_users().await?;
        let mut report = PullReport::default();

        for remote in &device_users {
            if stop.is_raised() {
                report.stopped = true;
                return Ok(report);
            }
            if remote.business_user_id.is_empty() {
                continue;
            }
            let outcome = match self.pull_one(device, remote).await {
                Ok(action) => UserOutcome::new(remote.business_user_id.clone(), action),
                Err(e) => UserOutcome::failed(remote.business_user_id.clone(), &e),
            };
            report.outcomes.push(outcome);
        }

        let present: BTreeSet<&BusinessUserId> =
            device_users.iter().map(|u| &u.business_user_id).collect();
        for mut local in self.store.list_users().await? {
            if !local.known_device_ids.contains(&device)
                || present.contains(&local.business_user_id)
            {
                continue;
            }
            info!(
                "{} was removed from device {} outside of sync",
                local.business_user_id, device
            );
            local.known_device_ids.remove(&device);
            local.role.revoke(device);
            let id = local.business_user_id.clone();
            let outcome = match self.store.upsert_user(&local).await {
                Ok(()) => UserOutcome::new(id, UserAction::Unlinked),
                Err(e) => UserOutcome::failed(id, &e),
            };
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    async fn pull_one(&self, device: DeviceId, remote: &DeviceUser) -> Result<UserAction> {
        let Some(mut local) = self.store.get_user(&remote.business_user_id).await? else {
            let mut user = UserRecord::new(remote.business_user_id.clone(), remote.name.clone());
            user.password = remote.password.clone();
            user.card_number = remote.card_number;
            if remote.is_admin() {
                user.role.grant(device);
            }
            user.known_device_ids.insert(device);
            self.store.upsert_user(&user).await?;
            debug!("Inserted {} from device {}", user.business_user_id, device);
            return Ok(UserAction::Inserted);
        };

        if remote.has_placeholder_name() {
            debug!(
                "Skipping {}: device name {:?} is a placeholder",
                remote.business_user_id, remote.name
            );
            return Ok(UserAction::SkippedPlaceholder);
        }

        let before = local.clone();
        if !remote.name.is_empty() {
            local.name = remote.name.clone();
        }
        if remote.card_number != 0 {
            local.card_number = remote.card_number;
        }
        if remote.is_admin() {
            local.role.grant(device);
        } else {
            local.role.revoke(device);
        }
        local.known_device_ids.insert(device);

        if local == before {
            return Ok(UserAction::Unchanged);
        }
        self.store.upsert_user(&local).await?;
        Ok(UserAction::Updated)
    }

    /// Import device templates the store has never seen and mark them
    /// present. Stored bytes are canonical and never overwritten.
    pub async fn pull_templates(
        &self,
        session: &mut DeviceSession,
        device: DeviceId,
        stop: &StopFlag,
    ) -> Result<usize> {
        let templates = session.get_templates(None).await?;
        let mut imported = 0;

        for t in &templates {
            if stop.is_raised() {
                break;
            }
            let Some(template) = t.to_template() else {
                continue;
            };
            if template.validate().is_err() {
                continue;
            }
            let id = &template.business_user_id;
            if self.store.get_user(id).await?.is_none() {
                continue;
            }
            let stored = self.store.get_templates(id, Some(device)).await?;
            match stored
                .iter()
                .find(|s| s.template.finger_index == template.finger_index)
            {
                None => {
                    self.store.upsert_template(&template).await?;
                    self.store
                        .set_availability(id, device, template.finger_index, true)
                        .await?;
                    imported += 1;
                }
                Some(s) if s.template.data == template.data => {
                    self.store
                        .set_availability(id, device, template.finger_index, true)
                        .await?;
                }
                Some(_) => {
                    debug!(
                        "Device {} holds a different template for {} finger {}",
                        device, id, template.finger_index
                    );
                }
            }
        }

        if imported > 0 {
            info!("Imported {} templates from device {}", imported, device);
        }
        Ok(imported)
    }
}
