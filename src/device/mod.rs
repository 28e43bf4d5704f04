//! Live terminal access: sessions and multi-step template transfer.

pub mod session;
pub mod transfer;

pub use session::{Connector, DeviceSession, DeviceTemplate};
pub use transfer::{TemplateTransfer, MAX_TEMPLATE_BYTES};
