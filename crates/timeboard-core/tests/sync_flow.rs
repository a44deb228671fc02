use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::tempdir;
use timeboard_core::datastore::DataStore;
use timeboard_core::model::{EntityKind, EntityRecord, ScheduledItem};
use timeboard_core::sync::{
    EntityEndpoint, SyncConfig, SyncCoordinator, SyncOutcome, SyncPhase,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, minute, 0)
        .single()
        .expect("valid time")
}

fn goal(id: Uuid, updated_at: DateTime<Utc>, title: &str) -> EntityRecord {
    EntityRecord {
        id,
        kind: EntityKind::Goals,
        updated_at,
        data: serde_json::json!({ "title": title }),
    }
}

#[derive(Default)]
struct MemoryEndpoint {
    records: Mutex<BTreeMap<(EntityKind, Uuid), EntityRecord>>,
    fail_fetch: Mutex<Option<EntityKind>>,
    fetches: AtomicUsize,
    writes: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryEndpoint {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn insert(&self, record: EntityRecord) {
        self.records.lock().insert((record.kind, record.id), record);
    }

    fn get(&self, kind: EntityKind, id: Uuid) -> Option<EntityRecord> {
        self.records.lock().get(&(kind, id)).cloned()
    }
}

#[async_trait]
impl EntityEndpoint for MemoryEndpoint {
    async fn fetch_all(&self, kind: EntityKind) -> anyhow::Result<Vec<EntityRecord>> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail_fetch.lock() == Some(kind) {
            bail!("backend unavailable for {kind}");
        }
        Ok(self
            .records
            .lock()
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect())
    }

    async fn create(&self, record: &EntityRecord) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(record.clone());
        Ok(())
    }

    async fn update(&self, record: &EntityRecord) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(record.clone());
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> anyhow::Result<()> {
        self.records
            .lock()
            .remove(&(kind, id))
            .map(|_| ())
            .ok_or_else(|| anyhow!("no {kind} record {id}"))
    }
}

fn coordinator(
    local: Arc<dyn EntityEndpoint>,
    remote: Arc<dyn EntityEndpoint>,
) -> SyncCoordinator {
    SyncCoordinator::new(
        local,
        remote,
        SyncConfig {
            debounce: Duration::from_secs(2),
            ..SyncConfig::default()
        },
    )
}

#[tokio::test]
async fn stores_converge_and_second_pass_writes_nothing() {
    let local_dir = tempdir().expect("local dir");
    let remote_dir = tempdir().expect("remote dir");
    let local = Arc::new(DataStore::open(local_dir.path()).expect("open local"));
    let remote = Arc::new(DataStore::open(remote_dir.path()).expect("open remote"));

    let mut task = ScheduledItem::new_task("Plan sprint".to_string(), at(0));
    task.scheduled_start = Some(at(30));
    task.duration_minutes = 45;
    let task = local.add_item(task, at(1)).expect("add local task");
    remote
        .create(&goal(Uuid::new_v4(), at(2), "ship v1"))
        .await
        .expect("seed remote goal");

    let sync = coordinator(local.clone(), remote.clone());
    let SyncOutcome::Completed(first) = sync.sync_now().await else {
        panic!("first pass should complete");
    };
    assert_eq!(first.collections.len(), 4);
    assert_eq!(first.collections[0].kind, EntityKind::Tasks);
    assert_eq!(first.collections[0].uploaded, 1);
    assert_eq!(first.collections[1].created_local, 1);

    assert_eq!(remote.load_items().expect("remote items"), vec![task]);
    assert_eq!(
        local.load_records(EntityKind::Goals).expect("local goals"),
        remote.load_records(EntityKind::Goals).expect("remote goals")
    );

    let SyncOutcome::Completed(second) = sync.sync_now().await else {
        panic!("second pass should complete");
    };
    assert_eq!(second.total_writes(), 0);

    let status = sync.current_status();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert!(status.last_error.is_none());
    assert!(status.last_synced_at.is_some());
}

#[tokio::test]
async fn newer_side_wins_per_record() {
    let local = Arc::new(MemoryEndpoint::default());
    let remote = Arc::new(MemoryEndpoint::default());

    let edited_here = Uuid::new_v4();
    local.insert(goal(edited_here, at(5), "local edit"));
    remote.insert(goal(edited_here, at(0), "stale"));

    let edited_there = Uuid::new_v4();
    local.insert(goal(edited_there, at(0), "stale"));
    remote.insert(goal(edited_there, at(9), "remote edit"));

    let untouched = Uuid::new_v4();
    local.insert(goal(untouched, at(3), "same"));
    remote.insert(goal(untouched, at(3), "same"));

    let sync = coordinator(local.clone(), remote.clone());
    let SyncOutcome::Completed(report) = sync.sync_now().await else {
        panic!("pass should complete");
    };
    let goals = &report.collections[1];
    assert_eq!(goals.uploaded, 1);
    assert_eq!(goals.overwritten_local, 1);
    assert_eq!(goals.created_local, 0);

    let uploaded = remote
        .get(EntityKind::Goals, edited_here)
        .expect("uploaded goal");
    assert_eq!(uploaded.updated_at, at(5));
    assert_eq!(uploaded.data["title"], "local edit");
    assert_eq!(
        local
            .get(EntityKind::Goals, edited_here)
            .expect("local goal")
            .data["title"],
        "local edit"
    );

    let pulled = local
        .get(EntityKind::Goals, edited_there)
        .expect("pulled goal");
    assert_eq!(pulled.updated_at, at(9));
    assert_eq!(pulled.data["title"], "remote edit");

    assert_eq!(local.writes.load(Ordering::SeqCst), 1);
    assert_eq!(remote.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_aborts_pass_and_is_reported_until_next_success() {
    let local = Arc::new(MemoryEndpoint::default());
    let remote = Arc::new(MemoryEndpoint::default());
    let task = EntityRecord {
        id: Uuid::new_v4(),
        kind: EntityKind::Tasks,
        updated_at: at(1),
        data: serde_json::json!({}),
    };
    local.insert(task.clone());
    local.insert(goal(Uuid::new_v4(), at(1), "later"));
    *remote.fail_fetch.lock() = Some(EntityKind::Goals);

    let sync = coordinator(local.clone(), remote.clone());
    let SyncOutcome::Failed(message) = sync.sync_now().await else {
        panic!("pass should fail");
    };
    assert!(message.contains("failed to sync goals"), "{message}");
    assert!(message.contains("backend unavailable"), "{message}");

    // Tasks ran before goals and stay synced.
    assert!(remote.get(EntityKind::Tasks, task.id).is_some());
    let status = sync.current_status();
    assert_eq!(status.last_error.as_deref(), Some(message.as_str()));
    assert_eq!(status.phase, SyncPhase::Idle);

    *remote.fail_fetch.lock() = None;
    let SyncOutcome::Completed(report) = sync.sync_now().await else {
        panic!("retry should complete");
    };
    assert_eq!(report.collections[1].uploaded, 1);
    assert!(sync.current_status().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn bursts_of_changes_coalesce_into_one_pass() {
    let local = Arc::new(MemoryEndpoint::default());
    let remote = Arc::new(MemoryEndpoint::default());
    let sync = coordinator(local.clone(), remote.clone());
    let mut status = sync.status();

    for _ in 0..3 {
        sync.queue_sync();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(local.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(sync.current_status().phase, SyncPhase::Queued);

    loop {
        status.changed().await.expect("coordinator alive");
        let current = status.borrow_and_update().clone();
        if current.phase == SyncPhase::Idle && current.last_synced_at.is_some() {
            break;
        }
    }
    assert_eq!(local.fetches.load(Ordering::SeqCst), EntityKind::SYNC_ORDER.len());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(local.fetches.load(Ordering::SeqCst), EntityKind::SYNC_ORDER.len());
}

#[tokio::test(start_paused = true)]
async fn cancelled_queue_never_syncs() {
    let local = Arc::new(MemoryEndpoint::default());
    let remote = Arc::new(MemoryEndpoint::default());
    let sync = coordinator(local.clone(), remote.clone());

    sync.queue_sync();
    sync.cancel_pending();
    assert_eq!(sync.current_status().phase, SyncPhase::Idle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(local.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn overlapping_request_returns_already_running() {
    let gate = Arc::new(Semaphore::new(0));
    let local = Arc::new(MemoryEndpoint::default());
    let remote = Arc::new(MemoryEndpoint::gated(gate.clone()));
    let sync = coordinator(local, remote);

    let first = tokio::spawn({
        let sync = sync.clone();
        async move { sync.sync_now().await }
    });
    while !sync.is_syncing() {
        tokio::task::yield_now().await;
    }
    assert_eq!(sync.current_status().phase, SyncPhase::Syncing);
    assert_eq!(sync.sync_now().await, SyncOutcome::AlreadyRunning);

    gate.add_permits(EntityKind::SYNC_ORDER.len());
    let outcome = first.await.expect("join first pass");
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    assert!(!sync.is_syncing());
}
