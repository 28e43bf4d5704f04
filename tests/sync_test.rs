mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attsync::config::Config;
use attsync::model::{
    AttendanceRecord, Availability, DeviceIdentity, DeviceUid, FingerprintTemplate, UserRecord,
};
use attsync::protocol::{Command, CommandChannel};
use attsync::store::{DurableStore, MemoryStore};
use attsync::sync::{
    FingerprintLock, FingerprintService, SyncCoordinator, SyncPhase, SyncRequest, SyncState,
};
use attsync::{Connector, SyncError};
use common::{at, device_record, device_user, template_bytes, test_config, SimNetwork, SimTerminal};

struct Rig {
    net: SimNetwork,
    store: Arc<MemoryStore>,
    lock: FingerprintLock,
    config: Config,
}

impl Rig {
    fn new() -> Self {
        Self {
            net: SimNetwork::new(),
            store: Arc::new(MemoryStore::new()),
            lock: FingerprintLock::new(),
            config: test_config(),
        }
    }

    fn terminal(&self, id: u32, ip: &str) -> SimTerminal {
        let sim = SimTerminal::new();
        self.net.attach(ip, sim.clone());
        self.store.add_device(device_record(id, ip));
        sim
    }

    fn coordinator(&self) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(
            self.config.clone(),
            Arc::new(self.net.clone()),
            self.store.clone(),
            self.lock.clone(),
        ))
    }

    fn service(&self) -> FingerprintService {
        FingerprintService::new(
            &self.config,
            Arc::new(self.net.clone()),
            self.store.clone(),
            self.lock.clone(),
        )
    }

    async fn linked_user(&self, id: &str, devices: &[u32], fingers: &[u8]) {
        let mut user = UserRecord::new(id, format!("User {}", id));
        user.known_device_ids.extend(devices.iter().copied());
        self.store.upsert_user(&user).await.unwrap();
        for &finger in fingers {
            self.store
                .upsert_template(&FingerprintTemplate::new(
                    id,
                    finger,
                    template_bytes(finger, 256),
                ))
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_push_with_unreachable_device_is_partial_success() {
    let rig = Rig::new();
    let up = rig.terminal(1, "10.1.0.1");
    let down = rig.terminal(2, "10.1.0.2");
    down.set_unreachable(true);
    rig.linked_user("100", &[1, 2], &[0, 1]).await;
    rig.linked_user("101", &[1, 2], &[]).await;

    let report = rig.coordinator().run(SyncRequest::push()).await.unwrap();

    assert_eq!(report.phase, SyncPhase::Complete);
    let first = report.device(1).unwrap();
    assert!(first.connected);
    assert_eq!(first.users.ok, 2);
    assert_eq!(first.users.failed, 0);
    assert!(first.is_success());
    let second = report.device(2).unwrap();
    assert!(!second.connected);
    assert!(second.error.as_deref().unwrap().contains("refused"));

    let uid = up.user("100").unwrap().uid;
    assert_eq!(up.fingers(uid.0), vec![0, 1]);
    // Devices are visited one at a time.
    assert_eq!(rig.net.peak_open(), 1);
}

#[tokio::test]
async fn test_every_device_unreachable_ends_in_error() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1").set_unreachable(true);

    let coordinator = rig.coordinator();
    let report = coordinator.run(SyncRequest::push()).await.unwrap();
    assert_eq!(report.phase, SyncPhase::Error);
    assert_eq!(coordinator.state().phase, SyncPhase::Error);
    assert!(!coordinator.is_syncing());
}

#[tokio::test]
async fn test_unknown_device_fails_sync() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1");

    let coordinator = rig.coordinator();
    let err = coordinator
        .run(SyncRequest::pull().devices([9]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::DeviceNotFound(9)));
    assert_eq!(coordinator.state().phase, SyncPhase::Error);
    assert!(!coordinator.is_syncing());
}

#[tokio::test]
async fn test_second_start_rejected_and_state_untouched() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1");
    let coordinator = rig.coordinator();

    // Hold the fingerprint lock so the sync parks before its first device.
    let guard = rig.lock.acquire_global().await;
    let handle = coordinator.start(SyncRequest::pull()).unwrap();
    assert!(coordinator.is_syncing());

    let before = coordinator.state();
    let err = coordinator.start(SyncRequest::push()).err().unwrap();
    assert!(matches!(err, SyncError::AlreadyInProgress));
    assert_eq!(coordinator.state(), before);

    let err = coordinator.run(SyncRequest::push()).await.err().unwrap();
    assert!(matches!(err, SyncError::AlreadyInProgress));

    drop(guard);
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.phase, SyncPhase::Complete);
    assert!(!coordinator.is_syncing());
}

struct PanickingConnector;

#[async_trait]
impl Connector for PanickingConnector {
    async fn open(&self, _identity: &DeviceIdentity) -> attsync::Result<Box<dyn CommandChannel>> {
        panic!("connector bug")
    }
}

#[tokio::test]
async fn test_panicked_sync_releases_slot() {
    let rig = Rig::new();
    rig.store.add_device(device_record(1, "10.1.0.1"));
    let coordinator = Arc::new(SyncCoordinator::new(
        rig.config.clone(),
        Arc::new(PanickingConnector),
        rig.store.clone(),
        rig.lock.clone(),
    ));

    let handle = coordinator.start(SyncRequest::push()).unwrap();
    assert!(handle.await.unwrap_err().is_panic());
    assert!(!coordinator.is_syncing());

    // The slot can be claimed again.
    let handle = coordinator.start(SyncRequest::push()).unwrap();
    assert!(handle.await.unwrap_err().is_panic());
}

#[tokio::test]
async fn test_late_subscriber_gets_current_snapshot() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1");
    let coordinator = rig.coordinator();

    let guard = rig.lock.acquire_global().await;
    let handle = coordinator.start(SyncRequest::pull()).unwrap();

    let mut sub = coordinator.subscribe();
    let first = sub.next().await.unwrap();
    assert!(first.is_syncing);
    assert_eq!(first.phase, SyncPhase::Users);

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(sub.next().await.is_none());

    drop(guard);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_progress_never_goes_backwards() {
    let mut rig = Rig::new();
    rig.config.sync.grace_period_ms = 60_000;
    rig.config.sync.log_batch_size = 1;
    for (id, ip) in [(1, "10.1.0.1"), (2, "10.1.0.2"), (3, "10.1.0.3")] {
        let sim = rig.terminal(id, ip);
        for n in 0..3u16 {
            sim.add_user(device_user(n + 1, &format!("{}{}", id, n), "Someone"));
            sim.add_punch(AttendanceRecord {
                uid: DeviceUid(n + 1),
                business_user_id: format!("{}{}", id, n).into(),
                timestamp: at("2024-01-02 08:00:00") + chrono::Duration::minutes(n as i64),
                status: 0,
                punch: 0,
            });
        }
    }
    let coordinator = rig.coordinator();
    let mut sub = coordinator.subscribe();
    let handle = coordinator.start(SyncRequest::pull()).unwrap();

    let mut seen: Vec<SyncState> = Vec::new();
    loop {
        let state = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        let done = !state.is_syncing && state.phase == SyncPhase::Complete;
        seen.push(state);
        if done {
            break;
        }
    }
    handle.await.unwrap().unwrap();

    let syncing: Vec<u8> = seen
        .iter()
        .filter(|s| s.is_syncing || s.phase == SyncPhase::Complete)
        .map(|s| s.progress)
        .collect();
    assert!(syncing.windows(2).all(|w| w[0] <= w[1]), "{:?}", syncing);
    let last = seen.last().unwrap();
    assert_eq!(last.progress, 100);
    assert_eq!(last.total_devices, 3);
    assert_eq!(last.per_device_result.len(), 3);
}

#[tokio::test]
async fn test_stop_request_skips_remaining_users() {
    let rig = Rig::new();
    let sim = rig.terminal(1, "10.1.0.1");
    rig.linked_user("100", &[1], &[0]).await;
    rig.linked_user("101", &[1], &[0]).await;
    let coordinator = rig.coordinator();

    let guard = rig.lock.acquire_global().await;
    let handle = coordinator.start(SyncRequest::push()).unwrap();
    coordinator.request_stop();
    drop(guard);

    let report = handle.await.unwrap().unwrap();
    assert!(report.stopped);
    assert_eq!(report.phase, SyncPhase::Complete);
    assert_eq!(sim.count(Command::UserWrite), 0);
    assert_eq!(coordinator.state().message, "Sync stopped");
}

#[tokio::test]
async fn test_logs_pass_batches_and_dedups() {
    let mut rig = Rig::new();
    rig.config.sync.log_batch_size = 2;
    let sim = rig.terminal(1, "10.1.0.1");
    for n in 0..5u16 {
        sim.add_punch(AttendanceRecord {
            uid: DeviceUid(1),
            business_user_id: "100".into(),
            timestamp: at("2024-03-01 07:00:00") + chrono::Duration::hours(n as i64),
            status: 0,
            punch: 1,
        });
    }
    let coordinator = rig.coordinator();

    let report = coordinator.run(SyncRequest::pull()).await.unwrap();
    assert_eq!(report.device(1).unwrap().logs.ok, 5);
    assert_eq!(rig.store.list_attendance(1).await.unwrap().len(), 5);

    // Same punches again: read, but nothing new stored.
    let report = coordinator.run(SyncRequest::pull()).await.unwrap();
    assert_eq!(report.device(1).unwrap().logs.ok, 5);
    assert_eq!(rig.store.list_attendance(1).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_state_returns_to_idle_after_grace() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1");
    let coordinator = rig.coordinator();

    coordinator
        .run(SyncRequest::pull().with_logs(false))
        .await
        .unwrap();
    assert_eq!(coordinator.state().phase, SyncPhase::Complete);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(coordinator.state(), SyncState::idle());
}

#[tokio::test]
async fn test_pull_sync_imports_users_and_templates() {
    let rig = Rig::new();
    let sim = rig.terminal(1, "10.1.0.1");
    sim.add_user(device_user(3, "300", "Rae"));
    sim.add_template(3, 2, &template_bytes(2, 256));
    rig.store
        .upsert_user(&UserRecord::new("300", "Rae"))
        .await
        .unwrap();

    let report = rig
        .coordinator()
        .run(SyncRequest::pull().with_logs(false))
        .await
        .unwrap();
    assert_eq!(report.device(1).unwrap().templates_imported, 1);

    let stored = rig
        .store
        .get_templates(&"300".into(), Some(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].availability, Availability::Present);
}

#[tokio::test]
async fn test_delete_then_restore_single_template() {
    let rig = Rig::new();
    let sim = rig.terminal(1, "10.1.0.1");
    rig.linked_user("400", &[1], &[1, 2, 3]).await;
    let service = rig.service();

    service
        .add_template(1, FingerprintTemplate::new("400", 4, template_bytes(4, 256)))
        .await
        .unwrap();
    let uid = sim.user("400").unwrap().uid.0;
    assert_eq!(sim.fingers(uid), vec![1, 2, 3, 4]);

    let report = service.delete_template(1, &"400".into(), 3).await.unwrap();
    assert_eq!(report.marked_absent, vec![3]);
    assert_eq!(sim.fingers(uid), vec![1, 2, 4]);
    assert!(!rig.lock.is_locked());

    let report = service.restore_template(1, &"400".into(), 3).await.unwrap();
    assert!(report.written.contains(&3));
    assert_eq!(sim.fingers(uid), vec![1, 2, 3, 4]);
    assert_eq!(sim.template(uid, 3), Some(template_bytes(3, 256)));
}

#[tokio::test]
async fn test_single_template_errors() {
    let rig = Rig::new();
    rig.terminal(1, "10.1.0.1");
    rig.linked_user("400", &[1], &[1]).await;
    let service = rig.service();

    let err = service.delete_template(1, &"400".into(), 7).await.err().unwrap();
    assert!(matches!(err, SyncError::TemplateNotFound { finger_index: 7, .. }));

    let err = service.delete_template(5, &"400".into(), 1).await.err().unwrap();
    assert!(matches!(err, SyncError::DeviceNotFound(5)));

    let err = service
        .restore_template(1, &"nobody".into(), 1)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::UserNotFound(_)));
    assert!(!rig.lock.is_locked());
}

#[tokio::test]
async fn test_single_template_waits_for_lock_with_timeout() {
    let mut rig = Rig::new();
    rig.config.sync.lock_timeout_ms = Some(20);
    rig.terminal(1, "10.1.0.1");
    rig.linked_user("400", &[1], &[1]).await;
    let service = rig.service();

    let _held = rig.lock.acquire_global().await;
    let err = service.delete_template(1, &"400".into(), 1).await.err().unwrap();
    assert!(matches!(err, SyncError::LockTimeout(_)));
}
