//! Single-flight, multi-device sync.
//!
//! A sync walks the selected devices one at a time in two passes:
//!
//! ```text
//!   idle ──► users ──► logs ──► complete ──(grace)──► idle
//!               └────────┴────► error ─────(grace)──► idle
//! ```
//!
//! The users pass pulls or pushes users and templates. The logs pass copies
//! attendance punches into the store in batches. Failures are tallied per
//! device and per user; a failed device does not stop the sync.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::{Connector, DeviceSession};
use crate::error::{Result, SyncError};
use crate::model::{BusinessUserId, DeviceId, DeviceRecord, UserRecord};
use crate::reconcile::{Reconciler, UserAction, UserOutcome};
use crate::store::DurableStore;
use crate::sync::lock::FingerprintLock;
use crate::sync::state::{
    DeviceSyncResult, ProgressHub, ProgressSubscription, SyncPhase, SyncState,
};
use crate::sync::{desired_templates, StopFlag};

/// Direction of the users pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Device is the source: read users and templates into the store.
    Pull,
    /// Store is the source: write users and templates to the device.
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub mode: SyncMode,
    /// `None` syncs every registered device.
    pub device_ids: Option<Vec<DeviceId>>,
    /// Push only: limit to these users. `None` pushes every user linked to
    /// the device.
    pub user_ids: Option<Vec<BusinessUserId>>,
    pub include_logs: bool,
}

impl SyncRequest {
    pub fn pull() -> Self {
        Self {
            mode: SyncMode::Pull,
            device_ids: None,
            user_ids: None,
            include_logs: true,
        }
    }

    pub fn push() -> Self {
        Self {
            mode: SyncMode::Push,
            device_ids: None,
            user_ids: None,
            include_logs: false,
        }
    }

    pub fn devices(mut self, ids: impl IntoIterator<Item = DeviceId>) -> Self {
        self.device_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn users(mut self, ids: impl IntoIterator<Item = BusinessUserId>) -> Self {
        self.user_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_logs(mut self, include: bool) -> Self {
        self.include_logs = include;
        self
    }
}

/// Final result of one sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub phase: SyncPhase,
    pub devices: Vec<DeviceSyncResult>,
    /// Stopped early by `request_stop`.
    pub stopped: bool,
}

impl SyncReport {
    pub fn device(&self, id: DeviceId) -> Option<&DeviceSyncResult> {
        self.devices.iter().find(|d| d.device_id == id)
    }
}

/// Owns the process-wide sync state. Construct once and share via `Arc`.
pub struct SyncCoordinator {
    config: Config,
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    lock: FingerprintLock,
    hub: ProgressHub,
    syncing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    stop: StopFlag,
}

impl SyncCoordinator {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        store: Arc<dyn DurableStore>,
        lock: FingerprintLock,
    ) -> Self {
        let reconciler = Reconciler::new(store, config.transfer.settle_delay());
        Self {
            config,
            connector,
            reconciler,
            lock,
            hub: ProgressHub::new(),
            syncing: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            stop: StopFlag::new(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SyncState {
        self.hub.current()
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.hub.subscribe()
    }

    /// Ask the running sync to stop at the next user or log batch.
    pub fn request_stop(&self) {
        if self.is_syncing() {
            info!("Stop requested");
            self.stop.raise();
        }
    }

    /// Claim the sync slot and run on a background task.
    ///
    /// Fails with `AlreadyInProgress` before spawning when a sync is running.
    pub fn start(
        self: &Arc<Self>,
        request: SyncRequest,
    ) -> Result<JoinHandle<Result<SyncReport>>> {
        self.begin()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(request).await }))
    }

    /// Claim the sync slot and run to completion.
    pub async fn run(&self, request: SyncRequest) -> Result<SyncReport> {
        self.begin()?;
        self.execute(request).await
    }

    fn begin(&self) -> Result<()> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop.clear();
        self.hub.replace(SyncState {
            phase: SyncPhase::Users,
            is_syncing: true,
            message: "Starting sync".to_string(),
            ..SyncState::idle()
        });
        Ok(())
    }

    async fn execute(&self, request: SyncRequest) -> Result<SyncReport> {
        let slot = SyncSlot(&self.syncing);
        info!(
            "Sync started: mode={:?} logs={}",
            request.mode, request.include_logs
        );
        let result = self.sync_devices(&request).await;

        let stopped = matches!(&result, Ok(report) if report.stopped);
        let (phase, message) = match &result {
            Ok(report) if report.phase == SyncPhase::Error => {
                (SyncPhase::Error, "No device could be reached".to_string())
            }
            Ok(report) if report.stopped => (SyncPhase::Complete, "Sync stopped".to_string()),
            Ok(_) => (SyncPhase::Complete, "Sync complete".to_string()),
            Err(e) => {
                error!("Sync failed: {}", e);
                (SyncPhase::Error, e.to_string())
            }
        };
        self.hub.update(|s| {
            s.phase = phase;
            s.message = message;
            if phase == SyncPhase::Complete && !stopped {
                s.progress = 100;
            }
            s.is_syncing = false;
        });
        let generation = self.generation.load(Ordering::SeqCst);
        drop(slot);
        self.schedule_reset(generation);

        info!("Sync finished: {:?}", phase);
        result
    }

    /// Return to idle after the grace period unless another sync started.
    fn schedule_reset(&self, generation: u64) {
        let current = Arc::clone(&self.generation);
        let hub = self.hub.clone();
        let grace = self.config.sync.grace_period();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            hub.update(|s| {
                if !s.is_syncing {
                    *s = SyncState::idle();
                }
            });
        });
    }

    async fn select_devices(&self, request: &SyncRequest) -> Result<Vec<DeviceRecord>> {
        let all = self.reconciler.store().list_devices().await?;
        let Some(ids) = &request.device_ids else {
            return Ok(all);
        };
        ids.iter()
            .map(|id| {
                all.iter()
                    .find(|d| d.id == *id)
                    .cloned()
                    .ok_or(SyncError::DeviceNotFound(*id))
            })
            .collect()
    }

    async fn sync_devices(&self, request: &SyncRequest) -> Result<SyncReport> {
        let devices = self.select_devices(request).await?;
        let total = devices.len();
        let users_span: u32 = if request.include_logs { 60 } else { 100 };

        let mut results: Vec<DeviceSyncResult> = devices
            .iter()
            .map(|d| DeviceSyncResult::new(d.id, d.name.clone()))
            .collect();
        self.hub.update(|s| {
            s.total_devices = total;
            s.per_device_result = results.clone();
        });

        // Users pass
        for (index, device) in devices.iter().enumerate() {
            if self.stop.is_raised() {
                break;
            }
            self.hub.update(|s| {
                s.phase = SyncPhase::Users;
                s.current_device_index = index;
                s.message = format!("Syncing users on {}", device.name);
                s.progress = scaled(0, users_span, index, total);
            });

            self.visit_users(device, request, &mut results[index], index, total, users_span)
                .await;
            self.publish_results(&results);
        }

        // Logs pass
        if request.include_logs && !self.stop.is_raised() {
            for (index, device) in devices.iter().enumerate() {
                if self.stop.is_raised() {
                    break;
                }
                self.hub.update(|s| {
                    s.phase = SyncPhase::Logs;
                    s.current_device_index = index;
                    s.message = format!("Reading attendance from {}", device.name);
                    s.progress = scaled(users_span, 100, index, total);
                });
                self.visit_logs(device, &mut results[index]).await;
                self.publish_results(&results);
            }
        }

        let stopped = self.stop.is_raised();
        let unreachable = !stopped && total > 0 && results.iter().all(|r| !r.connected);
        Ok(SyncReport {
            phase: if unreachable {
                SyncPhase::Error
            } else {
                SyncPhase::Complete
            },
            devices: results,
            stopped,
        })
    }

    fn publish_results(&self, results: &[DeviceSyncResult]) {
        self.hub.update(|s| s.per_device_result = results.to_vec());
    }

    async fn open(
        &self,
        device: &DeviceRecord,
        result: &mut DeviceSyncResult,
    ) -> Option<DeviceSession> {
        let connector = self.connector.as_ref();
        match DeviceSession::connect(&device.identity, connector, &self.config.session).await {
            Ok(session) => {
                result.connected = true;
                Some(session)
            }
            Err(e) => {
                warn!("Skipping device {} ({}): {}", device.id, device.name, e);
                result.error.get_or_insert_with(|| e.to_string());
                None
            }
        }
    }

    async fn visit_users(
        &self,
        device: &DeviceRecord,
        request: &SyncRequest,
        result: &mut DeviceSyncResult,
        index: usize,
        total: usize,
        span: u32,
    ) {
        let _guard = match self.lock.acquire(self.config.sync.lock_timeout()).await {
            Ok(guard) => guard,
            Err(e) => {
                result.error = Some(e.to_string());
                return;
            }
        };
        let Some(mut session) = self.open(device, result).await else {
            return;
        };

        let outcome = match request.mode {
            SyncMode::Pull => self.pull_device(&mut session, device, result).await,
            SyncMode::Push => {
                self.push_device(&mut session, device, request, result, index, total, span)
                    .await
            }
        };
        if let Err(e) = outcome {
            warn!("Device {} users pass failed: {}", device.id, e);
            result.error = Some(e.to_string());
        }

        if let Err(e) = session.disconnect().await {
            debug!("Disconnect from {} failed: {}", device.name, e);
        }
    }

    async fn pull_device(
        &self,
        session: &mut DeviceSession,
        device: &DeviceRecord,
        result: &mut DeviceSyncResult,
    ) -> Result<()> {
        let report = self.reconciler.pull_users(session, device.id, &self.stop).await?;
        for outcome in report.outcomes {
            result.record_user(outcome);
        }
        if report.stopped {
            return Ok(());
        }
        result.templates_imported = self
            .reconciler
            .pull_templates(session, device.id, &self.stop)
            .await?;
        Ok(())
    }

    async fn users_to_push(
        &self,
        device: DeviceId,
        request: &SyncRequest,
    ) -> Result<Vec<std::result::Result<UserRecord, BusinessUserId>>> {
        let store = self.reconciler.store();
        match &request.user_ids {
            Some(ids) => {
                let mut users = Vec::with_capacity(ids.len());
                let mut seen = BTreeSet::new();
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    users.push(store.get_user(id).await?.ok_or_else(|| id.clone()));
                }
                Ok(users)
            }
            None => Ok(store
                .list_users()
                .await?
                .into_iter()
                .filter(|u| u.known_device_ids.contains(&device))
                .map(Ok)
                .collect()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn push_device(
        &self,
        session: &mut DeviceSession,
        device: &DeviceRecord,
        request: &SyncRequest,
        result: &mut DeviceSyncResult,
        index: usize,
        total: usize,
        span: u32,
    ) -> Result<()> {
        let users = self.users_to_push(device.id, request).await?;
        let count = users.len().max(1);

        for (n, user) in users.into_iter().enumerate() {
            if self.stop.is_raised() {
                break;
            }
            let user = match user {
                Ok(user) => user,
                Err(id) => {
                    let e = SyncError::UserNotFound(id.to_string());
                    result.record_user(UserOutcome::failed(id, &e));
                    continue;
                }
            };

            let outcome = self.push_one(session, device.id, &user).await;
            let fatal = outcome.as_ref().err().map(|e| e.is_session_fatal());
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Push of {} to device {} failed: {}", user.business_user_id, device.id, e);
                    UserOutcome::failed(user.business_user_id.clone(), &e)
                }
            };
            result.record_user(outcome);

            if fatal == Some(true) {
                return Err(SyncError::Transport(format!(
                    "session to {} lost during push",
                    device.identity
                )));
            }

            let done = index * count + n + 1;
            self.hub.update(|s| {
                s.progress = scaled(0, span, done, total * count);
                s.message = format!("Pushed {} to {}", user.business_user_id, device.name);
            });
        }
        Ok(())
    }

    async fn push_one(
        &self,
        session: &mut DeviceSession,
        device: DeviceId,
        user: &UserRecord,
    ) -> Result<UserOutcome> {
        let stored = self
            .reconciler
            .store()
            .get_templates(&user.business_user_id, Some(device))
            .await?;
        let desired = desired_templates(&stored);
        let report = self
            .reconciler
            .push_user(session, device, user, &desired, false)
            .await?;

        let mut outcome = UserOutcome::new(user.business_user_id.clone(), UserAction::Pushed);
        outcome.templates_written = report.written.len();
        outcome.mismatch = report.mismatch;
        Ok(outcome)
    }

    async fn visit_logs(&self, device: &DeviceRecord, result: &mut DeviceSyncResult) {
        let _guard = match self.lock.acquire(self.config.sync.lock_timeout()).await {
            Ok(guard) => guard,
            Err(e) => {
                result.error.get_or_insert_with(|| e.to_string());
                return;
            }
        };
        let Some(mut session) = self.open(device, result).await else {
            return;
        };

        match session.get_attendance().await {
            Ok(records) => {
                let batch = self.config.sync.log_batch_size.max(1);
                for chunk in records.chunks(batch) {
                    if self.stop.is_raised() {
                        break;
                    }
                    match self
                        .reconciler
                        .store()
                        .record_attendance(device.id, chunk)
                        .await
                    {
                        Ok(new) => {
                            result.logs.ok += chunk.len();
                            debug!("Device {}: {} of {} punches new", device.id, new, chunk.len());
                        }
                        Err(e) => {
                            warn!("Storing punches from device {} failed: {}", device.id, e);
                            result.logs.failed += chunk.len();
                        }
                    }
                }
                info!(
                    "Device {}: {} punches read, {} stored",
                    device.id,
                    records.len(),
                    result.logs.ok
                );
            }
            Err(e) => {
                warn!("Reading attendance from {} failed: {}", device.name, e);
                result.error.get_or_insert_with(|| e.to_string());
            }
        }

        if let Err(e) = session.disconnect().await {
            debug!("Disconnect from {} failed: {}", device.name, e);
        }
    }
}

/// Position `done` of `total` mapped into `from..=to` percent.
fn scaled(from: u32, to: u32, done: usize, total: usize) -> u8 {
    if total == 0 {
        return from as u8;
    }
    let done = done.min(total) as u64;
    let span = u64::from(to - from);
    (u64::from(from) + span * done / total as u64) as u8
}

/// Releases the sync slot on drop, including when the sync task panics.
struct SyncSlot<'a>(&'a AtomicBool);

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
