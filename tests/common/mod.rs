//! In-process attendance terminal for integration tests.
//!
//! `SimTerminal` holds the device state; `SimNetwork` maps IP addresses to
//! terminals and hands out channels the way a socket connector would.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use attsync::config::Config;
use attsync::error::{Result, SyncError};
use attsync::model::{AttendanceRecord, DeviceIdentity, DeviceRecord, DeviceUid, DeviceUser};
use attsync::protocol::{
    codec, make_commkey, ChannelCapabilities, Command, CommandChannel, DataTable, Reply,
    TemplateCommit, DEFAULT_TICKS, REPLY_ERROR, REPLY_OK, REPLY_UNAUTH,
};
use attsync::Connector;

/// Config with short delays for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.connect_timeout_ms = 200;
    config.session.command_timeout_ms = 200;
    config.transfer.settle_delay_ms = 1;
    config.sync.grace_period_ms = 20;
    config
}

pub fn device_user(uid: u16, id: &str, name: &str) -> DeviceUser {
    DeviceUser {
        uid: DeviceUid(uid),
        business_user_id: id.into(),
        name: name.to_string(),
        password: String::new(),
        privilege: 0,
        card_number: 0,
        group_id: String::new(),
    }
}

pub fn template_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

#[derive(Default)]
struct SimState {
    password: Option<u32>,
    session_id: u16,
    datagram: bool,
    unreachable: bool,
    hang_on: Option<Command>,
    fail: HashMap<Command, u16>,
    commit_status: Option<u16>,
    drop_commits: bool,
    users: BTreeMap<u16, DeviceUser>,
    templates: BTreeMap<(u16, u8), Vec<u8>>,
    attendance: Vec<AttendanceRecord>,
    time: u32,
    staged: Option<Vec<u8>>,
    log: Vec<Command>,
    refreshes: usize,
}

/// One simulated terminal. Clones share state.
#[derive(Clone, Default)]
pub struct SimTerminal {
    state: Arc<Mutex<SimState>>,
}

impl SimTerminal {
    pub fn new() -> Self {
        let sim = Self::default();
        sim.state.lock().session_id = 0x1234;
        sim
    }

    pub fn with_password(self, password: u32) -> Self {
        self.state.lock().password = Some(password);
        self
    }

    pub fn set_datagram(&self, datagram: bool) {
        self.state.lock().datagram = datagram;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Never answer `command`.
    pub fn hang_on(&self, command: Command) {
        self.state.lock().hang_on = Some(command);
    }

    /// Answer `command` with `code` instead of executing it.
    pub fn fail(&self, command: Command, code: u16) {
        self.state.lock().fail.insert(command, code);
    }

    pub fn set_commit_status(&self, code: u16) {
        self.state.lock().commit_status = Some(code);
    }

    /// Acknowledge commits without storing the template.
    pub fn drop_commits(&self) {
        self.state.lock().drop_commits = true;
    }

    pub fn add_user(&self, user: DeviceUser) {
        self.state.lock().users.insert(user.uid.0, user);
    }

    pub fn add_template(&self, uid: u16, finger: u8, data: &[u8]) {
        self.state
            .lock()
            .templates
            .insert((uid, finger), data.to_vec());
    }

    pub fn add_punch(&self, record: AttendanceRecord) {
        self.state.lock().attendance.push(record);
    }

    pub fn users(&self) -> Vec<DeviceUser> {
        self.state.lock().users.values().cloned().collect()
    }

    pub fn user(&self, id: &str) -> Option<DeviceUser> {
        self.state
            .lock()
            .users
            .values()
            .find(|u| u.business_user_id.as_str() == id)
            .cloned()
    }

    pub fn fingers(&self, uid: u16) -> Vec<u8> {
        self.state
            .lock()
            .templates
            .keys()
            .filter(|(u, _)| *u == uid)
            .map(|(_, f)| *f)
            .collect()
    }

    pub fn template(&self, uid: u16, finger: u8) -> Option<Vec<u8>> {
        self.state.lock().templates.get(&(uid, finger)).cloned()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().log.clone()
    }

    pub fn count(&self, command: Command) -> usize {
        self.state.lock().log.iter().filter(|c| **c == command).count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().refreshes
    }

    pub fn packed_time(&self) -> u32 {
        self.state.lock().time
    }
}

enum Action {
    Reply(Reply),
    Hang,
}

impl SimState {
    fn handle(&mut self, authed: &mut bool, command: Command, payload: &[u8]) -> Action {
        self.log.push(command);
        if self.hang_on == Some(command) {
            return Action::Hang;
        }
        if let Some(code) = self.fail.get(&command) {
            return Action::Reply(Reply::with_code(*code));
        }

        let needs_auth = self.password.is_some() && !*authed;
        let reply = match command {
            Command::Connect if needs_auth => Reply::with_code(REPLY_UNAUTH),
            Command::Connect => Reply::ok(),
            Command::Auth => match self.password {
                Some(pw) if *payload == make_commkey(pw, self.session_id, DEFAULT_TICKS) => {
                    *authed = true;
                    Reply::ok()
                }
                _ => Reply::with_code(REPLY_ERROR),
            },
            Command::Exit => Reply::ok(),
            _ if needs_auth => Reply::with_code(REPLY_UNAUTH),
            Command::UserWrite => match codec::decode_user_record(payload) {
                Some(user) => {
                    self.users.insert(user.uid.0, user);
                    Reply::ok()
                }
                None => Reply::with_code(REPLY_ERROR),
            },
            Command::UserDelete if payload.len() >= 2 => {
                let uid = u16::from_le_bytes([payload[0], payload[1]]);
                self.users.remove(&uid);
                self.templates.retain(|(u, _), _| *u != uid);
                Reply::ok()
            }
            Command::Refresh => {
                self.refreshes += 1;
                Reply::ok()
            }
            Command::TemplatePrepare => {
                self.staged = None;
                Reply::ok()
            }
            Command::TemplateData => {
                self.staged = Some(payload.to_vec());
                Reply::ok()
            }
            Command::TemplateCommit => self.commit(payload),
            Command::GetTime => Reply::with_data(REPLY_OK, self.time.to_le_bytes().to_vec()),
            Command::SetTime if payload.len() >= 4 => {
                self.time = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Reply::ok()
            }
            Command::RawDeviceInfo | Command::RawOptions | Command::RawGetData => {
                Reply::with_data(REPLY_OK, Bytes::from_static(b"SIM-1"))
            }
            _ => Reply::with_code(REPLY_ERROR),
        };
        Action::Reply(reply)
    }

    fn commit(&mut self, payload: &[u8]) -> Reply {
        if let Some(code) = self.commit_status {
            return Reply::with_code(code);
        }
        let Some(meta) = TemplateCommit::decode(payload) else {
            return Reply::with_code(REPLY_ERROR);
        };
        let Some(data) = self.staged.take() else {
            return Reply::with_code(REPLY_ERROR);
        };
        if !self.users.contains_key(&meta.uid.0) || data.len() != meta.length as usize {
            return Reply::with_code(REPLY_ERROR);
        }
        if !self.drop_commits {
            self.templates
                .insert((meta.uid.0, meta.finger_index), data);
        }
        Reply::ok()
    }

    fn table(&self, table: DataTable) -> Bytes {
        let mut body = BytesMut::new();
        match table {
            DataTable::Users => {
                for user in self.users.values() {
                    body.extend_from_slice(&codec::encode_user_record(user));
                }
            }
            DataTable::Templates => {
                for ((uid, finger), data) in &self.templates {
                    body.extend_from_slice(&codec::encode_template_block(
                        DeviceUid(*uid),
                        *finger,
                        data,
                    ));
                }
            }
            DataTable::Attendance => {
                for record in &self.attendance {
                    body.extend_from_slice(&codec::encode_attendance_record(record));
                }
            }
        }
        codec::encode_table(&body)
    }
}

struct SimChannel {
    terminal: SimTerminal,
    authed: bool,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandChannel for SimChannel {
    fn capabilities(&self) -> ChannelCapabilities {
        if self.terminal.state.lock().datagram {
            ChannelCapabilities::datagram()
        } else {
            ChannelCapabilities::stream()
        }
    }

    fn session_id(&self) -> u16 {
        self.terminal.state.lock().session_id
    }

    async fn execute(&mut self, command: Command, payload: &[u8]) -> Result<Reply> {
        let action = {
            let mut state = self.terminal.state.lock();
            state.handle(&mut self.authed, command, payload)
        };
        match action {
            Action::Reply(reply) => Ok(reply),
            Action::Hang => std::future::pending().await,
        }
    }

    async fn read_table(&mut self, table: DataTable) -> Result<Bytes> {
        let state = self.terminal.state.lock();
        if state.password.is_some() && !self.authed {
            return Err(SyncError::Transport("not authenticated".to_string()));
        }
        Ok(state.table(table))
    }

    async fn close(&mut self) -> Result<()> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Terminals addressed by IP.
#[derive(Clone, Default)]
pub struct SimNetwork {
    terminals: Arc<Mutex<HashMap<String, SimTerminal>>>,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, ip: &str, terminal: SimTerminal) {
        self.terminals.lock().insert(ip.to_string(), terminal);
    }

    /// Most channels that were open at the same time.
    pub fn peak_open(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimNetwork {
    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn CommandChannel>> {
        let terminal = self.terminals.lock().get(&identity.ip).cloned();
        let Some(terminal) = terminal else {
            return Err(SyncError::Transport(format!(
                "no route to {}",
                identity
            )));
        };
        if terminal.state.lock().unreachable {
            return Err(SyncError::Transport(format!(
                "connection refused by {}",
                identity
            )));
        }
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(SimChannel {
            terminal,
            authed: false,
            open: self.open.clone(),
        }))
    }
}

pub fn device_record(id: u32, ip: &str) -> DeviceRecord {
    DeviceRecord {
        id,
        name: format!("Terminal {}", id),
        identity: DeviceIdentity::new(ip, 4370),
    }
}
