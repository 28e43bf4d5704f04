//! Multi-command template transfer.
//!
//! Write: `TemplatePrepare` (length) -> `TemplateData` (bytes) ->
//! `TemplateCommit` (6-byte metadata). Each step must succeed before the next
//! one is sent; a failure names the step and stops the sequence.
//!
//! Removing one finger is done by rewriting the whole user: delete, recreate,
//! refresh, wait for the firmware to settle, then write back the fingers to
//! keep.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::device::session::DeviceSession;
use crate::error::{Result, SyncError, TransferStep};
use crate::model::{DeviceUid, DeviceUser, FingerprintTemplate};
use crate::protocol::{codec::TemplateCommit, Command, MAX_TEMPLATE_BLOCK_SIZE};

/// Largest template payload one block can carry.
pub const MAX_TEMPLATE_BYTES: usize = MAX_TEMPLATE_BLOCK_SIZE - 6;

pub struct TemplateTransfer<'s> {
    session: &'s mut DeviceSession,
    settle_delay: Duration,
}

impl<'s> TemplateTransfer<'s> {
    pub fn new(session: &'s mut DeviceSession, settle_delay: Duration) -> Self {
        Self {
            session,
            settle_delay,
        }
    }

    /// Write one template through prepare/data/commit.
    ///
    /// A commit status other than success is returned as
    /// `DeviceRejectedTemplate` and is not retried.
    pub async fn write_template(
        &mut self,
        uid: DeviceUid,
        finger_index: u8,
        template: &[u8],
    ) -> Result<()> {
        if !self.session.supports_structured_commands() {
            return Err(SyncError::UnsupportedTransport);
        }
        if template.is_empty() || template.len() > MAX_TEMPLATE_BYTES {
            return Err(SyncError::InvalidRecord(format!(
                "template of {} bytes for uid {} finger {} is outside 1..={}",
                template.len(),
                uid,
                finger_index,
                MAX_TEMPLATE_BYTES
            )));
        }

        let length = template.len() as u32;
        self.session
            .command_ok(Command::TemplatePrepare, &length.to_le_bytes())
            .await
            .map_err(|e| e.at_step(TransferStep::Prepare))?;

        self.session
            .command_ok(Command::TemplateData, template)
            .await
            .map_err(|e| e.at_step(TransferStep::Data))?;

        let commit = TemplateCommit::new(uid, finger_index, template.len() as u16);
        let reply = self
            .session
            .command(Command::TemplateCommit, &commit.encode())
            .await
            .map_err(|e| e.at_step(TransferStep::Commit))?;
        if !reply.is_ok() {
            warn!(
                "Template commit for uid {} finger {} rejected with {}",
                uid, finger_index, reply.code
            );
            return Err(SyncError::DeviceRejectedTemplate { code: reply.code }
                .at_step(TransferStep::Commit));
        }

        debug!(
            "Wrote template uid={} finger={} ({} bytes)",
            uid,
            finger_index,
            template.len()
        );
        Ok(())
    }

    /// Delete `user`, recreate it, and write back `keep`.
    ///
    /// Fingers missing from `keep` end up removed from the device.
    pub async fn replace_template_set(
        &mut self,
        user: &DeviceUser,
        keep: &[FingerprintTemplate],
    ) -> Result<()> {
        if !self.session.supports_structured_commands() {
            return Err(SyncError::UnsupportedTransport);
        }

        info!(
            "Rewriting uid {} ({}) with {} templates",
            user.uid,
            user.business_user_id,
            keep.len()
        );

        self.session
            .delete_user(user.uid)
            .await
            .map_err(|e| e.at_step(TransferStep::DeleteUser))?;
        self.recreate_user(user).await?;

        for template in keep {
            self.write_template(user.uid, template.finger_index, &template.data)
                .await
                .map_err(|e| {
                    e.at_step(TransferStep::RewriteTemplate {
                        finger_index: template.finger_index,
                    })
                })?;
        }
        Ok(())
    }

    /// Write the user record, refresh, and wait for the firmware to settle.
    pub async fn recreate_user(&mut self, user: &DeviceUser) -> Result<()> {
        self.session
            .set_user(user)
            .await
            .map_err(|e| e.at_step(TransferStep::CreateUser))?;
        self.refresh_and_settle().await
    }

    pub async fn refresh_and_settle(&mut self) -> Result<()> {
        self.session
            .refresh()
            .await
            .map_err(|e| e.at_step(TransferStep::Refresh))?;
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }
}
