//! Fixed binary layouts the terminal uses for time, users, templates and
//! attendance records.
//!
//! Wire format: all multi-byte integers are little-endian.
//! Strings are fixed-width, NUL-padded, truncated on overflow.
//! Nothing in here fails: malformed input yields fewer records, not errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::model::{AttendanceRecord, BusinessUserId, DeviceUid, DeviceUser};

/// Size of one user record in the user table and in `UserWrite`.
pub const USER_RECORD_SIZE: usize = 72;

/// Size of one attendance record in the attendance table.
pub const ATTENDANCE_RECORD_SIZE: usize = 40;

/// Header in front of every template block: size, uid, finger, flag.
pub const TEMPLATE_HEADER_SIZE: usize = 6;

/// Largest template block the firmware produces.
pub const MAX_TEMPLATE_BLOCK_SIZE: usize = 2000;

/// Size of the template commit metadata record.
pub const TEMPLATE_COMMIT_SIZE: usize = 6;

const PASSWORD_LEN: usize = 8;
const NAME_LEN: usize = 24;
const GROUP_LEN: usize = 7;
const USER_ID_LEN: usize = 24;

// =============================================================================
// Time
// =============================================================================

/// Pack a timestamp into the device's compressed epoch.
pub fn encode_time(t: &NaiveDateTime) -> u32 {
    let year = t.year().rem_euclid(100) as u32;
    let days = ((year * 12 + t.month() - 1) * 31) + t.day() - 1;
    days * 86400 + t.hour() * 3600 + t.minute() * 60 + t.second()
}

/// Inverse of [`encode_time`]. Returns `None` for packed values that name a
/// day the calendar does not have (e.g. February 31st).
pub fn decode_time(packed: u32) -> Option<NaiveDateTime> {
    let mut t = packed;
    let second = t % 60;
    t /= 60;
    let minute = t % 60;
    t /= 60;
    let hour = t % 24;
    t /= 24;
    let day = t % 31 + 1;
    t /= 31;
    let month = t % 12 + 1;
    t /= 12;
    let year = t as i32 + 2000;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

// =============================================================================
// Strings
// =============================================================================

fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn get_fixed_str(buf: &mut &[u8], width: usize) -> String {
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let s = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    buf.advance(width);
    s
}

// =============================================================================
// Tables
// =============================================================================

/// Strip the 4-byte size header of a table read, clamping to what arrived.
pub fn table_payload(buf: &[u8]) -> &[u8] {
    if buf.len() < 4 {
        return &[];
    }
    let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let body = &buf[4..];
    &body[..declared.min(body.len())]
}

/// Prefix `body` with the 4-byte size header used by table reads.
pub fn encode_table(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

// =============================================================================
// USER RECORD (72 bytes)
// =============================================================================

/// Encode a user for `UserWrite`. Overlong fields are truncated.
pub fn encode_user_record(user: &DeviceUser) -> Bytes {
    let mut buf = BytesMut::with_capacity(USER_RECORD_SIZE);
    buf.put_u16_le(user.uid.0);
    buf.put_u8(user.privilege);
    put_fixed_str(&mut buf, &user.password, PASSWORD_LEN);
    put_fixed_str(&mut buf, &user.name, NAME_LEN);
    buf.put_u32_le(user.card_number);
    buf.put_u8(0);
    put_fixed_str(&mut buf, &user.group_id, GROUP_LEN);
    buf.put_u8(0);
    put_fixed_str(&mut buf, user.business_user_id.as_str(), USER_ID_LEN);
    buf.freeze()
}

/// Decode one 72-byte user record. `None` if fewer bytes are given.
pub fn decode_user_record(record: &[u8]) -> Option<DeviceUser> {
    if record.len() < USER_RECORD_SIZE {
        return None;
    }
    let mut buf = &record[..USER_RECORD_SIZE];
    let uid = DeviceUid(buf.get_u16_le());
    let privilege = buf.get_u8();
    let password = get_fixed_str(&mut buf, PASSWORD_LEN);
    let name = get_fixed_str(&mut buf, NAME_LEN);
    let card_number = buf.get_u32_le();
    buf.advance(1);
    let group_id = get_fixed_str(&mut buf, GROUP_LEN);
    buf.advance(1);
    let business_user_id = BusinessUserId::new(get_fixed_str(&mut buf, USER_ID_LEN));

    Some(DeviceUser {
        uid,
        business_user_id,
        name,
        password,
        privilege,
        card_number,
        group_id,
    })
}

/// Decode a user table body. A trailing partial record is dropped.
pub fn decode_user_table(body: &[u8]) -> Vec<DeviceUser> {
    body.chunks_exact(USER_RECORD_SIZE)
        .filter_map(decode_user_record)
        .collect()
}

// =============================================================================
// TEMPLATE BLOCK
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBlock {
    pub uid: DeviceUid,
    pub finger_index: u8,
    pub valid: u8,
    pub data: Bytes,
}

/// Encode one template block: `size:u16 | uid:u16 | finger:u8 | flag:u8 | data`.
pub fn encode_template_block(uid: DeviceUid, finger_index: u8, template: &[u8]) -> Bytes {
    let size = template.len() + TEMPLATE_HEADER_SIZE;
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16_le(size as u16);
    buf.put_u16_le(uid.0);
    buf.put_u8(finger_index);
    buf.put_u8(1);
    buf.put_slice(template);
    buf.freeze()
}

/// Decode concatenated template blocks.
///
/// A size field outside the plausible range is treated as desynchronisation:
/// the scan moves on by one byte. A block that claims more bytes than remain
/// ends the scan with whatever parsed cleanly before it.
pub fn decode_template_blocks(body: &[u8]) -> Vec<TemplateBlock> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while body.len() - pos >= 2 {
        let size = u16::from_le_bytes([body[pos], body[pos + 1]]) as usize;

        if !(TEMPLATE_HEADER_SIZE..=MAX_TEMPLATE_BLOCK_SIZE).contains(&size) {
            pos += 1;
            continue;
        }
        if size > body.len() - pos {
            break;
        }

        let mut block = &body[pos + 2..pos + size];
        let uid = DeviceUid(block.get_u16_le());
        let finger_index = block.get_u8();
        let valid = block.get_u8();
        blocks.push(TemplateBlock {
            uid,
            finger_index,
            valid,
            data: Bytes::copy_from_slice(block),
        });
        pos += size;
    }

    blocks
}

// =============================================================================
// TEMPLATE COMMIT (6 bytes)
// =============================================================================

/// Metadata sent with `TemplateCommit` once the data has been staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateCommit {
    pub uid: DeviceUid,
    pub finger_index: u8,
    pub flag: u8,
    pub length: u16,
}

impl TemplateCommit {
    pub fn new(uid: DeviceUid, finger_index: u8, length: u16) -> Self {
        Self {
            uid,
            finger_index,
            flag: 1,
            length,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TEMPLATE_COMMIT_SIZE);
        buf.put_u16_le(self.uid.0);
        buf.put_u8(self.finger_index);
        buf.put_u8(self.flag);
        buf.put_u16_le(self.length);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < TEMPLATE_COMMIT_SIZE {
            return None;
        }
        let mut buf = payload;
        Some(Self {
            uid: DeviceUid(buf.get_u16_le()),
            finger_index: buf.get_u8(),
            flag: buf.get_u8(),
            length: buf.get_u16_le(),
        })
    }
}

// =============================================================================
// ATTENDANCE RECORD (40 bytes)
// =============================================================================

/// Encode one punch: `uid:u16 | userId:24s | status:u8 | time:u32 | punch:u8 | reserved:8`.
pub fn encode_attendance_record(record: &AttendanceRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(ATTENDANCE_RECORD_SIZE);
    buf.put_u16_le(record.uid.0);
    put_fixed_str(&mut buf, record.business_user_id.as_str(), USER_ID_LEN);
    buf.put_u8(record.status);
    buf.put_u32_le(encode_time(&record.timestamp));
    buf.put_u8(record.punch);
    buf.put_bytes(0, ATTENDANCE_RECORD_SIZE - buf.len());
    buf.freeze()
}

/// Decode an attendance table body. Records with an impossible timestamp
/// are skipped.
pub fn decode_attendance_table(body: &[u8]) -> Vec<AttendanceRecord> {
    body.chunks_exact(ATTENDANCE_RECORD_SIZE)
        .filter_map(|record| {
            let mut buf = record;
            let uid = DeviceUid(buf.get_u16_le());
            let business_user_id = BusinessUserId::new(get_fixed_str(&mut buf, USER_ID_LEN));
            let status = buf.get_u8();
            let timestamp = decode_time(buf.get_u32_le())?;
            let punch = buf.get_u8();
            Some(AttendanceRecord {
                uid,
                business_user_id,
                timestamp,
                status,
                punch,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
