//! Device session - one connected, authenticated handle to a terminal.
//!
//! Every command runs under the configured timeout. A timeout or transport
//! failure leaves the session broken; callers reconnect explicitly.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::model::{
    AttendanceRecord, BusinessUserId, DeviceIdentity, DeviceUid, DeviceUser, FingerprintTemplate,
};
use crate::protocol::{
    codec, make_commkey, ChannelCapabilities, Command, CommandChannel, DataTable, RawCommand,
    Reply, TemplateBlock, REPLY_OK, REPLY_UNAUTH,
};

/// Opens command channels to terminals.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn CommandChannel>>;
}

/// A template read back from a device, resolved to its owner when the uid
/// matches a device user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTemplate {
    pub uid: DeviceUid,
    pub business_user_id: Option<BusinessUserId>,
    pub finger_index: u8,
    pub valid: bool,
    pub data: Bytes,
}

impl DeviceTemplate {
    pub fn to_template(&self) -> Option<FingerprintTemplate> {
        let owner = self.business_user_id.clone()?;
        Some(FingerprintTemplate {
            business_user_id: owner,
            finger_index: self.finger_index,
            data: self.data.clone(),
            valid: self.valid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ready,
    Broken,
}

/// Manages one connection to a terminal
pub struct DeviceSession {
    identity: DeviceIdentity,
    channel: Box<dyn CommandChannel>,
    command_timeout: Duration,
    state: SessionState,
}

impl DeviceSession {
    /// Open a channel and run the connect/auth handshake.
    pub async fn connect(
        identity: &DeviceIdentity,
        connector: &dyn Connector,
        config: &SessionConfig,
    ) -> Result<Self> {
        let channel = bounded(config.connect_timeout(), "connect", connector.open(identity))
            .await?;

        let mut session = Self {
            identity: identity.clone(),
            channel,
            command_timeout: config.command_timeout(),
            state: SessionState::Ready,
        };

        if let Err(e) = session.handshake(config.auth_ticks).await {
            // The channel is useless after a failed handshake.
            let _ = session.channel.close().await;
            return Err(e);
        }

        info!("Connected to {}", session.identity);
        Ok(session)
    }

    async fn handshake(&mut self, ticks: u8) -> Result<()> {
        let reply = self.command(Command::Connect, &[]).await?;
        match reply.code {
            REPLY_OK => Ok(()),
            REPLY_UNAUTH => {
                let Some(password) = self.identity.com_password else {
                    return Err(SyncError::AuthenticationFailed {
                        device: self.identity.to_string(),
                    });
                };
                let key = make_commkey(password, self.channel.session_id(), ticks);
                let reply = self.command(Command::Auth, &key).await?;
                if reply.is_ok() {
                    debug!("Authenticated with {}", self.identity);
                    Ok(())
                } else {
                    warn!("{} rejected the comm password", self.identity);
                    Err(SyncError::AuthenticationFailed {
                        device: self.identity.to_string(),
                    })
                }
            }
            code => Err(SyncError::DeviceRejectedCommand {
                command: Command::Connect,
                code,
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Whether the channel can carry the prepare/data/commit sequence.
    pub fn supports_structured_commands(&self) -> bool {
        self.channel
            .capabilities()
            .contains(ChannelCapabilities::STRUCTURED_COMMANDS)
    }

    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Ready
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    /// Issue one command and return the reply whatever its code.
    pub(crate) async fn command(&mut self, command: Command, payload: &[u8]) -> Result<Reply> {
        self.ensure_usable()?;
        let timeout = self.command_timeout;
        let result = bounded(
            timeout,
            &format!("{:?}", command),
            self.channel.execute(command, payload),
        )
        .await;
        self.track(result)
    }

    /// Issue one command and require the success sentinel.
    pub(crate) async fn command_ok(&mut self, command: Command, payload: &[u8]) -> Result<Reply> {
        let reply = self.command(command, payload).await?;
        if !reply.is_ok() {
            return Err(SyncError::DeviceRejectedCommand {
                command,
                code: reply.code,
            });
        }
        Ok(reply)
    }

    async fn read_table(&mut self, table: DataTable) -> Result<Bytes> {
        self.ensure_usable()?;
        let timeout = self.command_timeout;
        let result = bounded(
            timeout,
            &format!("{:?} read", table),
            self.channel.read_table(table),
        )
        .await;
        self.track(result)
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Broken => Err(SyncError::Transport(format!(
                "session to {} is broken; reconnect required",
                self.identity
            ))),
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(SyncError::Transport(msg)) = &result {
            warn!("Session to {} broken: {}", self.identity, msg);
            self.state = SessionState::Broken;
        }
        result
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn get_users(&mut self) -> Result<Vec<DeviceUser>> {
        let table = self.read_table(DataTable::Users).await?;
        let users = codec::decode_user_table(codec::table_payload(&table));
        debug!("{} reports {} users", self.identity, users.len());
        Ok(users)
    }

    pub async fn set_user(&mut self, user: &DeviceUser) -> Result<()> {
        let record = codec::encode_user_record(user);
        self.command_ok(Command::UserWrite, &record).await?;
        Ok(())
    }

    pub async fn delete_user(&mut self, uid: DeviceUid) -> Result<()> {
        self.command_ok(Command::UserDelete, &uid.0.to_le_bytes())
            .await?;
        Ok(())
    }

    /// Ask the firmware to reload its data after writes.
    pub async fn refresh(&mut self) -> Result<()> {
        self.command_ok(Command::Refresh, &[]).await?;
        Ok(())
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub(crate) async fn template_blocks(&mut self) -> Result<Vec<TemplateBlock>> {
        let table = self.read_table(DataTable::Templates).await?;
        Ok(codec::decode_template_blocks(codec::table_payload(&table)))
    }

    /// Templates stored on the device under `uid`.
    pub async fn get_templates_for_uid(&mut self, uid: DeviceUid) -> Result<Vec<TemplateBlock>> {
        let mut blocks = self.template_blocks().await?;
        blocks.retain(|b| b.uid == uid);
        Ok(blocks)
    }

    /// All templates on the device, or only those of one person.
    pub async fn get_templates(
        &mut self,
        business_user_id: Option<&BusinessUserId>,
    ) -> Result<Vec<DeviceTemplate>> {
        let users = self.get_users().await?;
        let blocks = self.template_blocks().await?;

        let templates = blocks
            .into_iter()
            .map(|b| DeviceTemplate {
                uid: b.uid,
                business_user_id: users
                    .iter()
                    .find(|u| u.uid == b.uid)
                    .map(|u| u.business_user_id.clone()),
                finger_index: b.finger_index,
                valid: b.valid != 0,
                data: b.data,
            })
            .filter(|t| match business_user_id {
                Some(id) => t.business_user_id.as_ref() == Some(id),
                None => true,
            })
            .collect();
        Ok(templates)
    }

    // =========================================================================
    // Time and logs
    // =========================================================================

    pub async fn get_time(&mut self) -> Result<NaiveDateTime> {
        let reply = self.command_ok(Command::GetTime, &[]).await?;
        if reply.data.len() < 4 {
            return Err(SyncError::MalformedResponse(format!(
                "time reply has {} bytes",
                reply.data.len()
            )));
        }
        let packed = u32::from_le_bytes([reply.data[0], reply.data[1], reply.data[2], reply.data[3]]);
        codec::decode_time(packed).ok_or_else(|| {
            SyncError::MalformedResponse(format!("device time {} is not a calendar date", packed))
        })
    }

    pub async fn set_time(&mut self, time: &NaiveDateTime) -> Result<()> {
        let packed = codec::encode_time(time);
        self.command_ok(Command::SetTime, &packed.to_le_bytes())
            .await?;
        Ok(())
    }

    pub async fn get_attendance(&mut self) -> Result<Vec<AttendanceRecord>> {
        let table = self.read_table(DataTable::Attendance).await?;
        Ok(codec::decode_attendance_table(codec::table_payload(&table)))
    }

    pub async fn execute_raw(&mut self, raw: RawCommand, payload: &[u8]) -> Result<Reply> {
        self.command(raw.command(), payload).await
    }

    /// Send `Exit` and close the channel.
    pub async fn disconnect(mut self) -> Result<()> {
        if self.is_usable() {
            if let Err(e) = self.command(Command::Exit, &[]).await {
                debug!("Exit to {} failed: {}", self.identity, e);
            }
        }
        self.channel.close().await?;
        info!("Disconnected from {}", self.identity);
        Ok(())
    }
}

/// Run `fut` under `limit`, mapping expiry to a transport error.
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Transport(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}
