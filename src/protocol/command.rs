//! Command codes, reply codes and the command channel seam.
//!
//! Socket framing and checksums belong to the transport; everything here
//! works on command payloads and reply payloads only.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

// =============================================================================
// Command codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    DbRead = 7,
    UserWrite = 8,
    RawGetData = 11,
    RawOptions = 12,
    AttendanceRead = 13,
    UserDelete = 18,
    TemplateCommit = 87,
    GetTime = 201,
    SetTime = 202,
    RawDeviceInfo = 501,
    Connect = 1000,
    Exit = 1001,
    Refresh = 1013,
    Auth = 1102,
    TemplatePrepare = 1500,
    TemplateData = 1501,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            7 => Some(Self::DbRead),
            8 => Some(Self::UserWrite),
            11 => Some(Self::RawGetData),
            12 => Some(Self::RawOptions),
            13 => Some(Self::AttendanceRead),
            18 => Some(Self::UserDelete),
            87 => Some(Self::TemplateCommit),
            201 => Some(Self::GetTime),
            202 => Some(Self::SetTime),
            501 => Some(Self::RawDeviceInfo),
            1000 => Some(Self::Connect),
            1001 => Some(Self::Exit),
            1013 => Some(Self::Refresh),
            1102 => Some(Self::Auth),
            1500 => Some(Self::TemplatePrepare),
            1501 => Some(Self::TemplateData),
            _ => None,
        }
    }
}

/// Commands callers may issue without a typed wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCommand {
    GetData,
    Options,
    DeviceInfo,
}

impl RawCommand {
    pub fn command(self) -> Command {
        match self {
            RawCommand::GetData => Command::RawGetData,
            RawCommand::Options => Command::RawOptions,
            RawCommand::DeviceInfo => Command::RawDeviceInfo,
        }
    }
}

// =============================================================================
// Reply codes
// =============================================================================

/// Success sentinel.
pub const REPLY_OK: u16 = 2000;
pub const REPLY_ERROR: u16 = 2001;
pub const REPLY_DATA: u16 = 2002;
/// The device wants an `Auth` command before anything else.
pub const REPLY_UNAUTH: u16 = 2005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub data: Bytes,
}

impl Reply {
    pub fn ok() -> Self {
        Self::with_code(REPLY_OK)
    }

    pub fn with_code(code: u16) -> Self {
        Self {
            code,
            data: Bytes::new(),
        }
    }

    pub fn with_data(code: u16, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == REPLY_OK
    }
}

// =============================================================================
// Tables
// =============================================================================

/// Bulk tables read through the transport's buffered read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTable {
    Users,
    Templates,
    Attendance,
}

impl DataTable {
    /// Command and payload that request this table.
    pub fn request(self) -> (Command, [u8; 1]) {
        match self {
            DataTable::Users => (Command::DbRead, [5]),
            DataTable::Templates => (Command::DbRead, [2]),
            DataTable::Attendance => (Command::AttendanceRead, [0]),
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelCapabilities: u8 {
        /// Stream channel able to carry the prepare/data/commit sequence.
        const STRUCTURED_COMMANDS = 1 << 0;
        /// Buffered bulk reads of user/template/attendance tables.
        const TABLE_READ = 1 << 1;
    }
}

impl ChannelCapabilities {
    /// What a TCP session to a terminal offers.
    pub fn stream() -> Self {
        Self::STRUCTURED_COMMANDS | Self::TABLE_READ
    }

    /// What the legacy datagram session offers.
    pub fn datagram() -> Self {
        Self::TABLE_READ
    }
}

/// Raw command/response primitive supplied by the vendor transport.
#[async_trait]
pub trait CommandChannel: Send {
    fn capabilities(&self) -> ChannelCapabilities;

    /// Session id assigned by the device on `Connect`.
    fn session_id(&self) -> u16;

    async fn execute(&mut self, command: Command, payload: &[u8]) -> Result<Reply>;

    /// Read a whole table, including its 4-byte size header.
    async fn read_table(&mut self, table: DataTable) -> Result<Bytes>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::GetTime.code(), 201);
        assert_eq!(Command::SetTime.code(), 202);
        assert_eq!(Command::Refresh.code(), 1013);
        assert_eq!(Command::UserDelete.code(), 18);
        assert_eq!(Command::TemplatePrepare.code(), 1500);
        assert_eq!(Command::TemplateData.code(), 1501);
        assert_eq!(Command::TemplateCommit.code(), 87);
        assert_eq!(Command::RawGetData.code(), 11);
        assert_eq!(Command::RawDeviceInfo.code(), 501);
        assert_eq!(Command::RawOptions.code(), 12);
    }

    #[test]
    fn test_command_from_u16() {
        assert_eq!(Command::from_u16(1102), Some(Command::Auth));
        assert_eq!(Command::from_u16(87), Some(Command::TemplateCommit));
        assert_eq!(Command::from_u16(9999), None);
    }

    #[test]
    fn test_capabilities() {
        assert!(ChannelCapabilities::stream().contains(ChannelCapabilities::STRUCTURED_COMMANDS));
        assert!(!ChannelCapabilities::datagram().contains(ChannelCapabilities::STRUCTURED_COMMANDS));
    }
}
