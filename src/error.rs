use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::DeviceId;
use crate::protocol::Command;

/// A named step inside a multi-command device sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Prepare,
    Data,
    Commit,
    DeleteUser,
    CreateUser,
    Refresh,
    RewriteTemplate { finger_index: u8 },
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStep::Prepare => write!(f, "prepare"),
            TransferStep::Data => write!(f, "data"),
            TransferStep::Commit => write!(f, "commit"),
            TransferStep::DeleteUser => write!(f, "delete user"),
            TransferStep::CreateUser => write!(f, "create user"),
            TransferStep::Refresh => write!(f, "refresh"),
            TransferStep::RewriteTemplate { finger_index } => {
                write!(f, "rewrite template (finger {})", finger_index)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed for device {device}")]
    AuthenticationFailed { device: String },

    #[error("Device rejected {command:?} with status {code}")]
    DeviceRejectedCommand { command: Command, code: u16 },

    #[error("Device rejected template commit with status {code}")]
    DeviceRejectedTemplate { code: u16 },

    #[error("Device session does not support structured commands")]
    UnsupportedTransport,

    #[error("Verification mismatch for user {user}: expected {expected} templates, found {actual}")]
    VerificationMismatch {
        user: String,
        expected: usize,
        actual: usize,
    },

    #[error("A sync is already in progress")]
    AlreadyInProgress,

    #[error("Timed out after {0:?} waiting for the fingerprint lock")]
    LockTimeout(Duration),

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: TransferStep,
        source: Box<SyncError>,
    },

    #[error("Malformed device response: {0}")]
    MalformedResponse(String),

    #[error("No free device uid left on the terminal")]
    UidSpaceExhausted,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("No stored template for user {user} finger {finger_index}")]
    TemplateNotFound { user: String, finger_index: u8 },

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub(crate) fn at_step(self, step: TransferStep) -> Self {
        SyncError::StepFailed {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error below any `StepFailed` wrappers.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The first failed step, if this error came out of a multi-step sequence.
    pub fn failed_step(&self) -> Option<TransferStep> {
        match self {
            SyncError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Errors after which the device session must be reconnected.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            SyncError::Transport(_) | SyncError::AuthenticationFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
