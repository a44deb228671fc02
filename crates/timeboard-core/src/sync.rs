//! Debounced last-write-wins sync between
//! the local store and a remote backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  Ordering
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{
  DateTime,
  Utc
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{
  debug,
  info,
  instrument,
  warn
};
use uuid::Uuid;

use crate::model::{
  EntityKind,
  EntityRecord
};

pub const DEFAULT_DEBOUNCE: Duration =
  Duration::from_secs(2);

/// One side of a sync: the local store or
/// the remote backend.
#[async_trait]
pub trait EntityEndpoint: Send + Sync {
  async fn fetch_all(
    &self,
    kind: EntityKind
  ) -> anyhow::Result<Vec<EntityRecord>>;

  /// Inserts `record` as given, keeping
  /// its `updated_at`.
  async fn create(
    &self,
    record: &EntityRecord
  ) -> anyhow::Result<()>;

  /// Replaces the stored record with the
  /// same id, keeping `updated_at` as
  /// given.
  async fn update(
    &self,
    record: &EntityRecord
  ) -> anyhow::Result<()>;

  async fn delete(
    &self,
    kind: EntityKind,
    id: Uuid
  ) -> anyhow::Result<()>;
}

/// Writes needed to reconcile one
/// collection.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
  pub create_local:    Vec<EntityRecord>,
  pub overwrite_local: Vec<EntityRecord>,
  pub upload_new:      Vec<EntityRecord>,
  pub upload_changed:  Vec<EntityRecord>
}

impl MergePlan {
  pub fn is_empty(&self) -> bool {
    self.create_local.is_empty()
      && self.overwrite_local.is_empty()
      && self.upload_new.is_empty()
      && self.upload_changed.is_empty()
  }
}

/// Pairs records by id; the newer
/// `updated_at` wins and equal
/// timestamps are left alone.
pub fn plan_merge(
  remote: Vec<EntityRecord>,
  local: Vec<EntityRecord>
) -> MergePlan {
  let remote_by_id = remote
    .into_iter()
    .map(|record| (record.id, record))
    .collect::<BTreeMap<_, _>>();
  let mut local_by_id = local
    .into_iter()
    .map(|record| (record.id, record))
    .collect::<BTreeMap<_, _>>();

  let mut plan = MergePlan::default();
  for (id, remote_record) in remote_by_id {
    match local_by_id.remove(&id) {
      | None => {
        plan.create_local.push(remote_record);
      }
      | Some(local_record)
        if remote_record.updated_at
          > local_record.updated_at =>
      {
        plan
          .overwrite_local
          .push(remote_record);
      }
      | Some(local_record)
        if local_record.updated_at
          > remote_record.updated_at =>
      {
        plan
          .upload_changed
          .push(local_record);
      }
      | Some(_) => {}
    }
  }

  plan.upload_new.extend(
    local_by_id.into_values()
  );
  plan
}

#[derive(
  Debug, Clone, PartialEq, Eq, Serialize,
)]
pub struct CollectionReport {
  pub kind:              EntityKind,
  pub created_local:     usize,
  pub overwritten_local: usize,
  pub uploaded:          usize
}

impl CollectionReport {
  pub fn writes(&self) -> usize {
    self.created_local
      + self.overwritten_local
      + self.uploaded
  }
}

#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Eq,
  Serialize,
)]
pub struct SyncReport {
  pub collections: Vec<CollectionReport>
}

impl SyncReport {
  pub fn total_writes(&self) -> usize {
    self
      .collections
      .iter()
      .map(CollectionReport::writes)
      .sum()
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum SyncPhase {
  Idle,
  Queued,
  Syncing
}

/// What observers (a status badge, the
/// CLI) see of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
  pub phase:          SyncPhase,
  pub last_error:     Option<String>,
  pub last_report:    Option<SyncReport>,
  pub last_synced_at: Option<DateTime<Utc>>
}

impl Default for SyncStatus {
  fn default() -> Self {
    Self {
      phase:          SyncPhase::Idle,
      last_error:     None,
      last_report:    None,
      last_synced_at: None
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
  Completed(SyncReport),
  /// Another pass was in flight; this
  /// request did nothing.
  AlreadyRunning,
  Failed(String)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub debounce: Duration,
  pub kinds:    Vec<EntityKind>
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce: DEFAULT_DEBOUNCE,
      kinds:    EntityKind::SYNC_ORDER
        .to_vec()
    }
  }
}

/// Cloneable handle; every clone drives
/// the same coordinator. At most one pass
/// runs at a time.
#[derive(Clone)]
pub struct SyncCoordinator {
  inner: Arc<Inner>
}

struct Inner {
  local:        Arc<dyn EntityEndpoint>,
  remote:       Arc<dyn EntityEndpoint>,
  config:       SyncConfig,
  is_syncing:   AtomicBool,
  timer_armed:  AtomicBool,
  pending:      Mutex<Option<JoinHandle<()>>>,
  status:       watch::Sender<SyncStatus>
}

impl std::fmt::Debug for SyncCoordinator {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>
  ) -> std::fmt::Result {
    f.debug_struct("SyncCoordinator")
      .field("config", &self.inner.config)
      .field(
        "is_syncing",
        &self.inner.is_syncing.load(
          Ordering::Acquire
        )
      )
      .finish_non_exhaustive()
  }
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl SyncCoordinator {
  pub fn new(
    local: Arc<dyn EntityEndpoint>,
    remote: Arc<dyn EntityEndpoint>,
    config: SyncConfig
  ) -> Self {
    let (status, _) =
      watch::channel(SyncStatus::default());
    Self {
      inner: Arc::new(Inner {
        local,
        remote,
        config,
        is_syncing: AtomicBool::new(false),
        timer_armed: AtomicBool::new(false),
        pending: Mutex::new(None),
        status
      })
    }
  }

  pub fn status(
    &self
  ) -> watch::Receiver<SyncStatus> {
    self.inner.status.subscribe()
  }

  pub fn current_status(&self) -> SyncStatus {
    self.inner.status.borrow().clone()
  }

  pub fn is_syncing(&self) -> bool {
    self
      .inner
      .is_syncing
      .load(Ordering::Acquire)
  }

  /// Records a local change. Restarts the
  /// quiet-period timer, so a burst of
  /// changes produces one pass after the
  /// last of them.
  pub fn queue_sync(&self) {
    let mut pending =
      self.inner.pending.lock();
    if let Some(previous) = pending.take() {
      previous.abort();
      debug!("debounce timer restarted");
    }

    self
      .inner
      .timer_armed
      .store(true, Ordering::Release);
    self.inner.status.send_modify(|status| {
      if status.phase != SyncPhase::Syncing {
        status.phase = SyncPhase::Queued;
      }
    });

    let coordinator = self.clone();
    let debounce = self.inner.config.debounce;
    *pending = Some(tokio::spawn(async move {
      tokio::time::sleep(debounce).await;
      coordinator
        .inner
        .timer_armed
        .store(false, Ordering::Release);
      // The pass runs detached so a later
      // queue_sync can only cancel timers,
      // never a pass in flight.
      let runner = coordinator.clone();
      tokio::spawn(async move {
        runner.sync_now().await;
      });
    }));
  }

  /// Drops a queued pass, if any.
  pub fn cancel_pending(&self) {
    if let Some(handle) =
      self.inner.pending.lock().take()
    {
      handle.abort();
    }
    self
      .inner
      .timer_armed
      .store(false, Ordering::Release);
    self.inner.status.send_modify(|status| {
      if status.phase == SyncPhase::Queued {
        status.phase = SyncPhase::Idle;
      }
    });
  }

  /// Runs one full pass now, unless one is
  /// already running.
  #[instrument(skip(self))]
  pub async fn sync_now(&self) -> SyncOutcome {
    if self
      .inner
      .is_syncing
      .compare_exchange(
        false,
        true,
        Ordering::AcqRel,
        Ordering::Acquire
      )
      .is_err()
    {
      debug!("sync already in flight; coalescing request");
      return SyncOutcome::AlreadyRunning;
    }
    let _guard =
      SyncingGuard(&self.inner.is_syncing);

    self.inner.status.send_modify(|status| {
      status.phase = SyncPhase::Syncing;
    });

    let result = self.run_pass().await;
    let next_phase = if self
      .inner
      .timer_armed
      .load(Ordering::Acquire)
    {
      SyncPhase::Queued
    } else {
      SyncPhase::Idle
    };

    match result {
      | Ok(report) => {
        info!(
          writes = report.total_writes(),
          "sync pass completed"
        );
        self.inner.status.send_modify(
          |status| {
            status.phase = next_phase;
            status.last_error = None;
            status.last_report =
              Some(report.clone());
            status.last_synced_at =
              Some(Utc::now());
          }
        );
        SyncOutcome::Completed(report)
      }
      | Err(err) => {
        let message = format!("{err:#}");
        warn!(error = %message, "sync pass failed");
        self.inner.status.send_modify(
          |status| {
            status.phase = next_phase;
            status.last_error =
              Some(message.clone());
          }
        );
        SyncOutcome::Failed(message)
      }
    }
  }

  async fn run_pass(
    &self
  ) -> anyhow::Result<SyncReport> {
    let mut report = SyncReport::default();
    for &kind in &self.inner.config.kinds {
      let collection = self
        .sync_collection(kind)
        .await
        .with_context(|| {
          format!("failed to sync {kind}")
        })?;
      report.collections.push(collection);
    }
    Ok(report)
  }

  #[instrument(skip(self))]
  async fn sync_collection(
    &self,
    kind: EntityKind
  ) -> anyhow::Result<CollectionReport> {
    let remote = self
      .inner
      .remote
      .fetch_all(kind)
      .await
      .context("failed to fetch remote records")?;
    let local = self
      .inner
      .local
      .fetch_all(kind)
      .await
      .context("failed to fetch local records")?;

    let plan = plan_merge(
      only_kind(remote, kind),
      only_kind(local, kind)
    );
    debug!(
      create_local = plan.create_local.len(),
      overwrite_local = plan.overwrite_local.len(),
      upload_new = plan.upload_new.len(),
      upload_changed = plan.upload_changed.len(),
      "planned merge"
    );

    for record in &plan.create_local {
      self
        .inner
        .local
        .create(record)
        .await
        .with_context(|| {
          format!(
            "failed to create local {}",
            record.id
          )
        })?;
    }
    for record in &plan.overwrite_local {
      self
        .inner
        .local
        .update(record)
        .await
        .with_context(|| {
          format!(
            "failed to overwrite local {}",
            record.id
          )
        })?;
    }
    for record in &plan.upload_new {
      self
        .inner
        .remote
        .create(record)
        .await
        .with_context(|| {
          format!(
            "failed to upload new {}",
            record.id
          )
        })?;
    }
    for record in &plan.upload_changed {
      self
        .inner
        .remote
        .update(record)
        .await
        .with_context(|| {
          format!(
            "failed to upload changed {}",
            record.id
          )
        })?;
    }

    Ok(CollectionReport {
      kind,
      created_local: plan.create_local.len(),
      overwritten_local: plan
        .overwrite_local
        .len(),
      uploaded: plan.upload_new.len()
        + plan.upload_changed.len()
    })
  }
}

fn only_kind(
  records: Vec<EntityRecord>,
  kind: EntityKind
) -> Vec<EntityRecord> {
  records
    .into_iter()
    .filter(|record| {
      if record.kind == kind {
        return true;
      }
      warn!(
        id = %record.id,
        expected = %kind,
        found = %record.kind,
        "dropping record from wrong collection"
      );
      false
    })
    .collect()
}
