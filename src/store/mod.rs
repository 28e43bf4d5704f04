//! Durable store boundary.
//!
//! The engine only needs the operations on [`DurableStore`]. Two
//! implementations ship with the crate: [`MemoryStore`] and the text-file
//! backed [`FileStore`].

pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SyncError};
use crate::model::{
    AttendanceRecord, Availability, BusinessUserId, DeviceId, DeviceRecord, FingerprintTemplate,
    StoredTemplate, UserRecord,
};

pub use file::FileStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_user(&self, id: &BusinessUserId) -> Result<Option<UserRecord>>;

    async fn list_users(&self) -> Result<Vec<UserRecord>>;

    async fn upsert_user(&self, user: &UserRecord) -> Result<()>;

    /// Templates of one person. With a device, each carries its availability
    /// on that device; without one, availability is `Unknown`.
    async fn get_templates(
        &self,
        id: &BusinessUserId,
        device: Option<DeviceId>,
    ) -> Result<Vec<StoredTemplate>>;

    /// Insert or replace the canonical bytes of one finger.
    async fn upsert_template(&self, template: &FingerprintTemplate) -> Result<()>;

    /// Record whether a stored template is on `device`. Never touches the
    /// template bytes.
    async fn set_availability(
        &self,
        id: &BusinessUserId,
        device: DeviceId,
        finger_index: u8,
        present: bool,
    ) -> Result<()>;

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Store punches read from `device`. Returns how many were new.
    async fn record_attendance(&self, device: DeviceId, records: &[AttendanceRecord])
        -> Result<usize>;

    async fn list_attendance(&self, device: DeviceId) -> Result<Vec<AttendanceRecord>>;
}

type TemplateKey = (BusinessUserId, u8);
type AvailabilityKey = (BusinessUserId, DeviceId, u8);

/// In-memory tables shared by the store implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub users: BTreeMap<BusinessUserId, UserRecord>,
    pub templates: BTreeMap<TemplateKey, FingerprintTemplate>,
    pub availability: BTreeMap<AvailabilityKey, bool>,
    pub attendance: BTreeMap<DeviceId, Vec<AttendanceRecord>>,
}

impl Tables {
    pub fn templates_of(
        &self,
        id: &BusinessUserId,
        device: Option<DeviceId>,
    ) -> Vec<StoredTemplate> {
        self.templates
            .range((id.clone(), 0)..=(id.clone(), u8::MAX))
            .map(|((_, finger), template)| {
                let availability = match device {
                    Some(d) => match self.availability.get(&(id.clone(), d, *finger)) {
                        Some(true) => Availability::Present,
                        Some(false) => Availability::Absent,
                        None => Availability::Unknown,
                    },
                    None => Availability::Unknown,
                };
                StoredTemplate {
                    template: template.clone(),
                    availability,
                }
            })
            .collect()
    }

    pub fn upsert_template(&mut self, template: &FingerprintTemplate) -> Result<()> {
        template.validate()?;
        self.templates.insert(
            (template.business_user_id.clone(), template.finger_index),
            template.clone(),
        );
        Ok(())
    }

    pub fn set_availability(
        &mut self,
        id: &BusinessUserId,
        device: DeviceId,
        finger_index: u8,
        present: bool,
    ) -> Result<()> {
        if !self.templates.contains_key(&(id.clone(), finger_index)) {
            return Err(SyncError::TemplateNotFound {
                user: id.to_string(),
                finger_index,
            });
        }
        self.availability
            .insert((id.clone(), device, finger_index), present);
        Ok(())
    }

    pub fn record_attendance(&mut self, device: DeviceId, records: &[AttendanceRecord]) -> usize {
        let log = self.attendance.entry(device).or_default();
        let mut seen: BTreeSet<(BusinessUserId, chrono::NaiveDateTime)> = log
            .iter()
            .map(|r| (r.business_user_id.clone(), r.timestamp))
            .collect();

        let mut inserted = 0;
        for record in records {
            if seen.insert((record.business_user_id.clone(), record.timestamp)) {
                log.push(record.clone());
                inserted += 1;
            }
        }
        inserted
    }
}
