// Text-file durable store
//
// Keeps all tables in memory and rewrites the whole file after every
// mutation. One record per line, last field free text with line breaks
// and backslashes escaped.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::model::{
    AttendanceRecord, BusinessUserId, DeviceId, DeviceIdentity, DeviceRecord, DeviceUid,
    FingerprintTemplate, Role, StoredTemplate, TemplateAvailability, UserRecord,
};
use crate::store::{DurableStore, Tables};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Durable store persisted as a line-oriented text file
pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    /// Default location (`~/.local/share/attsync/store.lst`).
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::data_dir().ok_or_else(|| {
            SyncError::Store("Cannot determine data directory (HOME not set)".to_string())
        })?;
        Ok(dir.join("attsync").join("store.lst"))
    }

    /// Open the store at `path`, creating an empty one if it doesn't exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Tables::default()
        };
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_device(&self, device: DeviceRecord) -> Result<()> {
        check_token("device ip", &device.identity.ip)?;
        self.mutate(|t| {
            t.devices.insert(device.id, device);
            Ok(())
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let mut next = tables.clone();
        let out = f(&mut next)?;
        self.save_to_file(&next)?;
        *tables = next;
        Ok(out)
    }

    fn load_from_file(path: &Path) -> Result<Tables> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut tables = Tables::default();

        for line in reader.lines() {
            let line = line?;

            // Skip comments and blank lines
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let (kind, rest) = match line.split_once(' ') {
                Some(parts) => parts,
                None => continue,
            };
            // Malformed lines are skipped
            let _ = match kind {
                "device" => parse_device(rest).map(|d| {
                    tables.devices.insert(d.id, d);
                }),
                "user" => parse_user(rest).map(|u| {
                    tables.users.insert(u.business_user_id.clone(), u);
                }),
                "tmpl" => parse_template(rest).map(|t| {
                    tables
                        .templates
                        .insert((t.business_user_id.clone(), t.finger_index), t);
                }),
                "avail" => parse_availability(rest).map(|(id, device, a)| {
                    tables
                        .availability
                        .insert((id, device, a.finger_index), a.present);
                }),
                "punch" => parse_punch(rest).map(|(device, r)| {
                    tables.attendance.entry(device).or_default().push(r);
                }),
                _ => None,
            };
        }

        Ok(tables)
    }

    /// Save all tables (atomic write)
    fn save_to_file(&self, tables: &Tables) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_file = self.path.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;

            writeln!(file, "# attsync store {}", Self::FORMAT_VERSION)?;
            writeln!(file, "# saved: {}", chrono::Utc::now().to_rfc3339())?;

            for d in tables.devices.values() {
                writeln!(
                    file,
                    "device {} {} {} {} {}",
                    d.id,
                    d.identity.port,
                    d.identity
                        .com_password
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    d.identity.ip,
                    escape_text(&d.name)
                )?;
            }

            for u in tables.users.values() {
                let known = if u.known_device_ids.is_empty() {
                    "-".to_string()
                } else {
                    u.known_device_ids
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                };
                let password = if u.password.is_empty() {
                    "-".to_string()
                } else {
                    hex::encode(u.password.as_bytes())
                };
                writeln!(
                    file,
                    "user {} {} {} {} {} {}",
                    u.business_user_id,
                    u.card_number,
                    u.role.to_tag(),
                    known,
                    password,
                    escape_text(&u.name)
                )?;
            }

            for t in tables.templates.values() {
                writeln!(
                    file,
                    "tmpl {} {} {} {}",
                    t.business_user_id,
                    u8::from(t.valid),
                    t.finger_index,
                    hex::encode(&t.data)
                )?;
            }

            for ((id, device, finger_index), present) in &tables.availability {
                let tag = TemplateAvailability {
                    finger_index: *finger_index,
                    present: *present,
                };
                writeln!(file, "avail {} {} {}", id, device, tag.to_tag())?;
            }

            for (device, records) in &tables.attendance {
                for r in records {
                    writeln!(
                        file,
                        "punch {} {} {} {} {} {}",
                        device,
                        r.uid,
                        r.timestamp.format(TIME_FORMAT),
                        r.status,
                        r.punch,
                        r.business_user_id
                    )?;
                }
            }
            file.sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_file, &self.path)?;

        Ok(())
    }
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(SyncError::InvalidRecord(format!(
            "{} {:?} must be non-empty and contain no whitespace",
            what, value
        )));
    }
    Ok(())
}

// Parse: <id> <port> <password|-> <ip> <name>
fn parse_device(rest: &str) -> Option<DeviceRecord> {
    let parts: Vec<&str> = rest.splitn(5, ' ').collect();
    if parts.len() != 5 {
        return None;
    }
    let com_password = match parts[2] {
        "-" => None,
        p => Some(p.parse().ok()?),
    };
    Some(DeviceRecord {
        id: parts[0].parse().ok()?,
        name: unescape_text(parts[4]),
        identity: DeviceIdentity {
            ip: parts[3].to_string(),
            port: parts[1].parse().ok()?,
            com_password,
        },
    })
}

// Parse: <bid> <card> <role> <known|-> <password-hex|-> <name>
fn parse_user(rest: &str) -> Option<UserRecord> {
    let parts: Vec<&str> = rest.splitn(6, ' ').collect();
    if parts.len() != 6 {
        return None;
    }
    let known_device_ids = match parts[3] {
        "-" => Default::default(),
        list => list.split(',').filter_map(|d| d.parse().ok()).collect(),
    };
    let password = match parts[4] {
        "-" => String::new(),
        h => String::from_utf8(hex::decode(h).ok()?).ok()?,
    };
    Some(UserRecord {
        business_user_id: BusinessUserId::new(parts[0]),
        name: unescape_text(parts[5]),
        password,
        role: Role::parse(parts[2]),
        card_number: parts[1].parse().ok()?,
        known_device_ids,
    })
}

// Parse: <bid> <valid> <finger> <hex>
fn parse_template(rest: &str) -> Option<FingerprintTemplate> {
    let parts: Vec<&str> = rest.split(' ').collect();
    if parts.len() != 4 {
        return None;
    }
    Some(FingerprintTemplate {
        business_user_id: BusinessUserId::new(parts[0]),
        valid: parts[1] != "0",
        finger_index: parts[2].parse().ok()?,
        data: hex::decode(parts[3]).ok()?.into(),
    })
}

// Parse: <bid> <device> <finger>[,<0|1>]
fn parse_availability(rest: &str) -> Option<(BusinessUserId, DeviceId, TemplateAvailability)> {
    let parts: Vec<&str> = rest.split(' ').collect();
    if parts.len() != 3 {
        return None;
    }
    Some((
        BusinessUserId::new(parts[0]),
        parts[1].parse().ok()?,
        TemplateAvailability::parse(parts[2])?,
    ))
}

// Parse: <device> <uid> <time> <status> <punch> <bid>
fn parse_punch(rest: &str) -> Option<(DeviceId, AttendanceRecord)> {
    let parts: Vec<&str> = rest.splitn(6, ' ').collect();
    if parts.len() != 6 {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        AttendanceRecord {
            uid: DeviceUid(parts[1].parse().ok()?),
            timestamp: NaiveDateTime::parse_from_str(parts[2], TIME_FORMAT).ok()?,
            status: parts[3].parse().ok()?,
            punch: parts[4].parse().ok()?,
            business_user_id: BusinessUserId::new(parts[5]),
        },
    ))
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get_user(&self, id: &BusinessUserId) -> Result<Option<UserRecord>> {
        Ok(self.tables.lock().users.get(id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.tables.lock().users.values().cloned().collect())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        check_token("business user id", user.business_user_id.as_str())?;
        self.mutate(|t| {
            t.users.insert(user.business_user_id.clone(), user.clone());
            Ok(())
        })
    }

    async fn get_templates(
        &self,
        id: &BusinessUserId,
        device: Option<DeviceId>,
    ) -> Result<Vec<StoredTemplate>> {
        Ok(self.tables.lock().templates_of(id, device))
    }

    async fn upsert_template(&self, template: &FingerprintTemplate) -> Result<()> {
        check_token("business user id", template.business_user_id.as_str())?;
        self.mutate(|t| t.upsert_template(template))
    }

    async fn set_availability(
        &self,
        id: &BusinessUserId,
        device: DeviceId,
        finger_index: u8,
        present: bool,
    ) -> Result<()> {
        self.mutate(|t| t.set_availability(id, device, finger_index, present))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.tables.lock().devices.values().cloned().collect())
    }

    async fn record_attendance(
        &self,
        device: DeviceId,
        records: &[AttendanceRecord],
    ) -> Result<usize> {
        for r in records {
            check_token("business user id", r.business_user_id.as_str())?;
        }
        self.mutate(|t| Ok(t.record_attendance(device, records)))
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
