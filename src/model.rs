//! Domain types shared by the session, reconciler, store and orchestrator.

use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, SyncError};

/// Store-side identifier of a terminal.
pub type DeviceId = u32;

/// Privilege byte the terminal uses for administrators.
pub const ADMIN_PRIVILEGE: u8 = 14;

/// Privilege byte for ordinary users.
pub const USER_PRIVILEGE: u8 = 0;

/// Highest finger index a template may carry.
pub const MAX_FINGER_INDEX: u8 = 9;

/// Network address and optional comm password of a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub ip: String,
    pub port: u16,
    pub com_password: Option<u32>,
}

impl DeviceIdentity {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            com_password: None,
        }
    }

    pub fn with_password(mut self, password: u32) -> Self {
        self.com_password = Some(password);
        self
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A terminal as registered in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub identity: DeviceIdentity,
}

/// Device-local primary key of a user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceUid(pub u16);

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External, HR-facing identifier of a person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessUserId(String);

impl BusinessUserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BusinessUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusinessUserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BusinessUserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role tag of a stored user.
///
/// Persisted as `"14,<deviceId>,<deviceId>..."` for administrators and `"0"`
/// otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub is_admin: bool,
    pub admin_on_device_ids: BTreeSet<DeviceId>,
}

impl Role {
    /// Parse a persisted role tag. Unknown tokens are ignored.
    pub fn parse(tag: &str) -> Self {
        let mut parts = tag.split(',').map(str::trim).filter(|p| !p.is_empty());
        let is_admin = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .map(|p| p == ADMIN_PRIVILEGE)
            .unwrap_or(false);
        if !is_admin {
            return Self::default();
        }
        let admin_on_device_ids = parts.filter_map(|p| p.parse().ok()).collect();
        Self {
            is_admin,
            admin_on_device_ids,
        }
    }

    pub fn to_tag(&self) -> String {
        if !self.is_admin {
            return USER_PRIVILEGE.to_string();
        }
        let mut tag = ADMIN_PRIVILEGE.to_string();
        for id in &self.admin_on_device_ids {
            tag.push(',');
            tag.push_str(&id.to_string());
        }
        tag
    }

    pub fn is_admin_on(&self, device: DeviceId) -> bool {
        self.is_admin && self.admin_on_device_ids.contains(&device)
    }

    /// Privilege byte to write to `device`.
    pub fn privilege_on(&self, device: DeviceId) -> u8 {
        if self.is_admin_on(device) {
            ADMIN_PRIVILEGE
        } else {
            USER_PRIVILEGE
        }
    }

    pub fn grant(&mut self, device: DeviceId) {
        self.is_admin = true;
        self.admin_on_device_ids.insert(device);
    }

    pub fn revoke(&mut self, device: DeviceId) {
        self.admin_on_device_ids.remove(&device);
        if self.admin_on_device_ids.is_empty() {
            self.is_admin = false;
        }
    }
}

/// A person as held in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub business_user_id: BusinessUserId,
    pub name: String,
    pub password: String,
    pub role: Role,
    pub card_number: u32,
    /// Devices this user has been seen on or pushed to.
    pub known_device_ids: BTreeSet<DeviceId>,
}

impl UserRecord {
    pub fn new(business_user_id: impl Into<BusinessUserId>, name: impl Into<String>) -> Self {
        Self {
            business_user_id: business_user_id.into(),
            name: name.into(),
            password: String::new(),
            role: Role::default(),
            card_number: 0,
            known_device_ids: BTreeSet::new(),
        }
    }

    /// Projection of this user for `device` at `uid`.
    pub fn to_device_user(&self, uid: DeviceUid, device: DeviceId) -> DeviceUser {
        DeviceUser {
            uid,
            business_user_id: self.business_user_id.clone(),
            name: self.name.clone(),
            password: self.password.clone(),
            privilege: self.role.privilege_on(device),
            card_number: self.card_number,
            group_id: String::new(),
        }
    }
}

/// A user record as the terminal stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUser {
    pub uid: DeviceUid,
    pub business_user_id: BusinessUserId,
    pub name: String,
    pub password: String,
    pub privilege: u8,
    pub card_number: u32,
    pub group_id: String,
}

impl DeviceUser {
    pub fn is_admin(&self) -> bool {
        self.privilege == ADMIN_PRIVILEGE
    }

    /// Terminals fill the name with the user id when none was enrolled.
    pub fn has_placeholder_name(&self) -> bool {
        !self.name.is_empty() && self.name.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Canonical fingerprint template of one finger of one person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintTemplate {
    pub business_user_id: BusinessUserId,
    pub finger_index: u8,
    pub data: Bytes,
    /// Validity flag reported by the terminal.
    pub valid: bool,
}

impl FingerprintTemplate {
    pub fn new(
        business_user_id: impl Into<BusinessUserId>,
        finger_index: u8,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            business_user_id: business_user_id.into(),
            finger_index,
            data: data.into(),
            valid: true,
        }
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.finger_index > MAX_FINGER_INDEX {
            return Err(SyncError::InvalidRecord(format!(
                "finger index {} out of range 0..={}",
                self.finger_index, MAX_FINGER_INDEX
            )));
        }
        if self.data.is_empty() {
            return Err(SyncError::InvalidRecord(format!(
                "empty template for user {} finger {}",
                self.business_user_id, self.finger_index
            )));
        }
        Ok(())
    }
}

/// Whether a stored template is on a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Present,
    /// Deleted from the device, kept in the store for later restore.
    Absent,
    /// Never reconciled against the device.
    Unknown,
}

/// Persisted availability bit of one (user, device, finger) triple.
///
/// Text form is `"<fingerIndex>,<0|1>"`; a bare `"<fingerIndex>"` written by
/// older releases reads as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateAvailability {
    pub finger_index: u8,
    pub present: bool,
}

impl TemplateAvailability {
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts = tag.trim().splitn(2, ',');
        let finger_index = parts.next()?.trim().parse().ok()?;
        let present = match parts.next().map(str::trim) {
            None | Some("") => true,
            Some("1") => true,
            Some("0") => false,
            Some(_) => return None,
        };
        Some(Self {
            finger_index,
            present,
        })
    }

    pub fn to_tag(&self) -> String {
        format!("{},{}", self.finger_index, u8::from(self.present))
    }

    pub fn availability(&self) -> Availability {
        if self.present {
            Availability::Present
        } else {
            Availability::Absent
        }
    }
}

/// A template as returned by the store, with its availability on the
/// requested device (`Unknown` when no device was requested).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTemplate {
    pub template: FingerprintTemplate,
    pub availability: Availability,
}

/// One punch read from a terminal's attendance log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub uid: DeviceUid,
    pub business_user_id: BusinessUserId,
    pub timestamp: NaiveDateTime,
    pub status: u8,
    pub punch: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tag_roundtrip() {
        let role = Role::parse("14,3,7");
        assert!(role.is_admin);
        assert!(role.is_admin_on(3));
        assert!(role.is_admin_on(7));
        assert!(!role.is_admin_on(4));
        assert_eq!(role.to_tag(), "14,3,7");
    }

    #[test]
    fn test_role_plain_user() {
        let role = Role::parse("0");
        assert!(!role.is_admin);
        assert_eq!(role.privilege_on(3), USER_PRIVILEGE);
        assert_eq!(role.to_tag(), "0");
        assert_eq!(Role::parse(""), Role::default());
    }

    #[test]
    fn test_role_revoke_last_device_clears_admin() {
        let mut role = Role::parse("14,3");
        role.grant(5);
        assert_eq!(role.to_tag(), "14,3,5");
        role.revoke(3);
        role.revoke(5);
        assert!(!role.is_admin);
        assert_eq!(role.to_tag(), "0");
    }

    #[test]
    fn test_availability_tag() {
        let a = TemplateAvailability::parse("2,1").unwrap();
        assert_eq!(a.finger_index, 2);
        assert!(a.present);
        assert_eq!(a.to_tag(), "2,1");

        let absent = TemplateAvailability::parse("6,0").unwrap();
        assert_eq!(absent.availability(), Availability::Absent);

        // Legacy records carry only the finger index.
        let legacy = TemplateAvailability::parse("4").unwrap();
        assert!(legacy.present);

        assert!(TemplateAvailability::parse("x,1").is_none());
        assert!(TemplateAvailability::parse("3,7").is_none());
    }

    #[test]
    fn test_placeholder_name() {
        let mut user = DeviceUser {
            uid: DeviceUid(1),
            business_user_id: "42".into(),
            name: "42".into(),
            password: String::new(),
            privilege: 0,
            card_number: 0,
            group_id: String::new(),
        };
        assert!(user.has_placeholder_name());
        user.name = "Jane Doe".into();
        assert!(!user.has_placeholder_name());
        user.name.clear();
        assert!(!user.has_placeholder_name());
    }

    #[test]
    fn test_template_validate() {
        assert!(FingerprintTemplate::new("1", 3, vec![1u8, 2]).validate().is_ok());
        assert!(FingerprintTemplate::new("1", 10, vec![1u8]).validate().is_err());
        assert!(FingerprintTemplate::new("1", 0, Vec::<u8>::new())
            .validate()
            .is_err());
    }
}
