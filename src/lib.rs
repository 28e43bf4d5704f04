//! attsync - device protocol and multi-terminal sync engine for biometric
//! attendance terminals.
//!
//! ```text
//!   sync::SyncCoordinator / sync::FingerprintService
//!              │
//!              ▼
//!   device::DeviceSession ──► reconcile::Reconciler ──► store::DurableStore
//!              │
//!              ▼
//!   device::TemplateTransfer ──► protocol (codec, commands) ──► CommandChannel
//! ```
//!
//! The byte transport is supplied by the embedder through
//! [`protocol::CommandChannel`] and [`device::Connector`].

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod store;
pub mod sync;

pub use config::Config;
pub use device::{Connector, DeviceSession, TemplateTransfer};
pub use error::{Result, SyncError, TransferStep};
pub use model::{
    AttendanceRecord, Availability, BusinessUserId, DeviceId, DeviceIdentity, DeviceRecord,
    DeviceUid, DeviceUser, FingerprintTemplate, Role, StoredTemplate, UserRecord,
};
pub use reconcile::{allocate_uid, PullReport, PushReport, Reconciler, UserAction, UserOutcome};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use sync::{
    FingerprintLock, FingerprintService, ProgressHub, SyncCoordinator, SyncMode, SyncPhase,
    SyncReport, SyncRequest, SyncState,
};
