//! Process-local store.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::model::{
    AttendanceRecord, BusinessUserId, DeviceId, DeviceRecord, FingerprintTemplate,
    StoredTemplate, UserRecord,
};
use crate::store::{DurableStore, Tables};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: DeviceRecord) {
        self.tables.lock().devices.insert(device.id, device);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_user(&self, id: &BusinessUserId) -> Result<Option<UserRecord>> {
        Ok(self.tables.lock().users.get(id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.tables.lock().users.values().cloned().collect())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.tables
            .lock()
            .users
            .insert(user.business_user_id.clone(), user.clone());
        Ok(())
    }

    async fn get_templates(
        &self,
        id: &BusinessUserId,
        device: Option<DeviceId>,
    ) -> Result<Vec<StoredTemplate>> {
        Ok(self.tables.lock().templates_of(id, device))
    }

    async fn upsert_template(&self, template: &FingerprintTemplate) -> Result<()> {
        self.tables.lock().upsert_template(template)
    }

    async fn set_availability(
        &self,
        id: &BusinessUserId,
        device: DeviceId,
        finger_index: u8,
        present: bool,
    ) -> Result<()> {
        self.tables
            .lock()
            .set_availability(id, device, finger_index, present)
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.tables.lock().devices.values().cloned().collect())
    }

    async fn record_attendance(
        &self,
        device: DeviceId,
        records: &[AttendanceRecord],
    ) -> Result<usize> {
        Ok(self.tables.lock().record_attendance(device, records))
    }

    async fn list_attendance(&self, device: DeviceId) -> Result<Vec<AttendanceRecord>> {
        Ok(self
            .tables
            .lock()
            .attendance
            .get(&device)
            .cloned()
            .unwrap_or_default())
    }
}
