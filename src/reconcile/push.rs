//! Push one stored user and its templates to a device.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::device::{DeviceSession, TemplateTransfer};
use crate::error::{Result, SyncError, TransferStep};
use crate::model::{
    Availability, DeviceId, DeviceUid, DeviceUser, FingerprintTemplate, StoredTemplate,
    UserRecord,
};
use crate::reconcile::{allocate_uid, Mismatch, Reconciler};

/// What a push did on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub uid: DeviceUid,
    /// The user did not exist on the device before.
    pub created: bool,
    /// The user was deleted and recreated to drop stale fingers.
    pub rewritten: bool,
    pub written: Vec<u8>,
    /// Fingers already present with identical bytes.
    pub unchanged: Vec<u8>,
    pub marked_absent: Vec<u8>,
    pub mismatch: Option<Mismatch>,
}

impl PushReport {
    fn new(uid: DeviceUid, created: bool) -> Self {
        Self {
            uid,
            created,
            rewritten: false,
            written: Vec::new(),
            unchanged: Vec::new(),
            marked_absent: Vec::new(),
            mismatch: None,
        }
    }
}

impl Reconciler {
    /// Converge `device` to `user` holding exactly the `desired` templates.
    ///
    /// Stored templates of this user left out of `desired` are marked absent
    /// on the device; their bytes stay in the store. With `full_refresh` an
    /// existing device user is always deleted and recreated.
    pub async fn push_user(
        &self,
        session: &mut DeviceSession,
        device: DeviceId,
        user: &UserRecord,
        desired: &[FingerprintTemplate],
        full_refresh: bool,
    ) -> Result<PushReport> {
        for t in desired {
            t.validate()?;
            if t.business_user_id != user.business_user_id {
                return Err(SyncError::InvalidRecord(format!(
                    "template of {} pushed with user {}",
                    t.business_user_id, user.business_user_id
                )));
            }
        }
        let wanted: BTreeSet<u8> = desired.iter().map(|t| t.finger_index).collect();

        // 1. Resolve the device uid
        let device_users = session.get_users().await?;
        let existing = device_users
            .iter()
            .find(|u| u.business_user_id == user.business_user_id);
        let (uid, created) = match existing {
            Some(u) => (u.uid, false),
            None => (allocate_uid(&device_users, &user.business_user_id)?, true),
        };
        let info = user.to_device_user(uid, device);
        debug!(
            "Pushing {} to device {} as uid {} (created={})",
            user.business_user_id, device, uid, created
        );

        let stored = self
            .store
            .get_templates(&user.business_user_id, Some(device))
            .await?;
        let on_device: BTreeMap<u8, Bytes> = if created {
            BTreeMap::new()
        } else {
            session
                .get_templates_for_uid(uid)
                .await?
                .into_iter()
                .map(|b| (b.finger_index, b.data))
                .collect()
        };
        let stale = on_device.keys().any(|f| !wanted.contains(f));

        // 2-3. Write the user and whatever templates are missing
        let mut report = PushReport::new(uid, created);
        let result = {
            let mut transfer = TemplateTransfer::new(session, self.settle_delay);
            if !created && (full_refresh || stale) {
                report.rewritten = true;
                let r = transfer.replace_template_set(&info, desired).await;
                report.written = match &r {
                    Ok(()) => wanted.iter().copied().collect(),
                    Err(e) => rewritten_before_failure(e, desired),
                };
                r
            } else {
                write_missing(&mut transfer, &info, desired, &stored, &on_device, &mut report)
                    .await
            }
        };

        for finger in report.written.iter().chain(&report.unchanged) {
            self.store
                .set_availability(&user.business_user_id, device, *finger, true)
                .await?;
        }
        if let Err(e) = result {
            let device_user_gone =
                matches!(e.failed_step(), Some(step) if step != TransferStep::DeleteUser);
            if report.rewritten && device_user_gone {
                // The device user is gone; only the rewritten fingers exist.
                for s in &stored {
                    let finger = s.template.finger_index;
                    if !report.written.contains(&finger) && s.availability != Availability::Absent
                    {
                        self.store
                            .set_availability(&user.business_user_id, device, finger, false)
                            .await?;
                    }
                }
            }
            return Err(e);
        }

        for s in &stored {
            let finger = s.template.finger_index;
            if !wanted.contains(&finger) && s.availability != Availability::Absent {
                self.store
                    .set_availability(&user.business_user_id, device, finger, false)
                    .await?;
                report.marked_absent.push(finger);
            }
        }

        if !user.known_device_ids.contains(&device) {
            let mut updated = user.clone();
            updated.known_device_ids.insert(device);
            self.store.upsert_user(&updated).await?;
        }

        // 4. Verify
        report.mismatch = verify(session, &info, wanted.len()).await?;

        info!(
            "Pushed {} to device {}: {} written, {} unchanged, {} marked absent",
            user.business_user_id,
            device,
            report.written.len(),
            report.unchanged.len(),
            report.marked_absent.len()
        );
        Ok(report)
    }
}

async fn write_missing(
    transfer: &mut TemplateTransfer<'_>,
    info: &DeviceUser,
    desired: &[FingerprintTemplate],
    stored: &[StoredTemplate],
    on_device: &BTreeMap<u8, Bytes>,
    report: &mut PushReport,
) -> Result<()> {
    transfer.recreate_user(info).await?;

    for template in desired {
        let finger = template.finger_index;
        let known_present = stored.iter().any(|s| {
            s.template.finger_index == finger && s.availability == Availability::Present
        });
        if known_present && on_device.get(&finger) == Some(&template.data) {
            report.unchanged.push(finger);
            continue;
        }
        transfer
            .write_template(info.uid, finger, &template.data)
            .await?;
        report.written.push(finger);
    }
    Ok(())
}

/// Fingers committed by `replace_template_set` before it failed with `err`.
fn rewritten_before_failure(err: &SyncError, desired: &[FingerprintTemplate]) -> Vec<u8> {
    match err.failed_step() {
        Some(TransferStep::RewriteTemplate { finger_index }) => desired
            .iter()
            .map(|t| t.finger_index)
            .take_while(|f| *f != finger_index)
            .collect(),
        _ => Vec::new(),
    }
}

/// Re-read the user and compare template counts. Mismatches are logged and
/// returned, not raised.
async fn verify(
    session: &mut DeviceSession,
    info: &DeviceUser,
    expected: usize,
) -> Result<Option<Mismatch>> {
    let users = session.get_users().await?;
    let actual = if users.iter().any(|u| u.uid == info.uid) {
        session.get_templates_for_uid(info.uid).await?.len()
    } else {
        warn!(
            "User {} (uid {}) missing after push",
            info.business_user_id, info.uid
        );
        0
    };

    if actual != expected {
        let err = SyncError::VerificationMismatch {
            user: info.business_user_id.to_string(),
            expected,
            actual,
        };
        warn!("{}", err);
        return Ok(Some(Mismatch { expected, actual }));
    }
    Ok(None)
}
