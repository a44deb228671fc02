use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{EntityKind, EntityRecord, ScheduledItem};
use crate::sync::EntityEndpoint;

/// JSONL files, one per entity collection, under a single directory.
#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Counts from merging calendar events into the task collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        for kind in EntityKind::SYNC_ORDER {
            let path = collection_path(&data_dir, kind);
            if !path.exists() {
                fs::write(&path, "")
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }

        info!(data_dir = %data_dir.display(), "opened datastore");

        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, kind: EntityKind) -> PathBuf {
        collection_path(&self.data_dir, kind)
    }

    #[tracing::instrument(skip(self))]
    pub fn load_items(&self) -> anyhow::Result<Vec<ScheduledItem>> {
        load_jsonl(&self.path_for(EntityKind::Tasks)).context("failed to load tasks.data")
    }

    #[tracing::instrument(skip(self, items))]
    pub fn save_items(&self, items: &[ScheduledItem]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.path_for(EntityKind::Tasks), items)
            .context("failed to save tasks.data")
    }

    /// Tasks are stored as plain items and exposed to sync as records.
    #[tracing::instrument(skip(self))]
    pub fn load_records(&self, kind: EntityKind) -> anyhow::Result<Vec<EntityRecord>> {
        if kind == EntityKind::Tasks {
            return self
                .load_items()?
                .iter()
                .map(EntityRecord::from_item)
                .collect();
        }
        load_jsonl(&self.path_for(kind)).with_context(|| format!("failed to load {kind}.data"))
    }

    #[tracing::instrument(skip(self, records))]
    pub fn save_records(&self, kind: EntityKind, records: &[EntityRecord]) -> anyhow::Result<()> {
        if kind == EntityKind::Tasks {
            let items = records
                .iter()
                .map(EntityRecord::to_item)
                .collect::<anyhow::Result<Vec<_>>>()?;
            return self.save_items(&items);
        }
        save_jsonl_atomic(&self.path_for(kind), records)
            .with_context(|| format!("failed to save {kind}.data"))
    }

    /// Resolves a full id or a unique id prefix.
    pub fn find_item(&self, needle: &str) -> anyhow::Result<ScheduledItem> {
        let needle = needle.trim().to_ascii_lowercase();
        if needle.is_empty() {
            bail!("empty item id");
        }

        let mut matches = self
            .load_items()?
            .into_iter()
            .filter(|item| item.id.to_string().starts_with(&needle))
            .collect::<Vec<_>>();

        match matches.len() {
            0 => Err(anyhow!("no item matches id {needle}")),
            1 => Ok(matches.remove(0)),
            n => Err(anyhow!("id prefix {needle} is ambiguous ({n} items)")),
        }
    }

    #[tracing::instrument(skip(self, item), fields(id = %item.id))]
    pub fn add_item(
        &self,
        mut item: ScheduledItem,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ScheduledItem> {
        let _guard = self.write_lock.lock();
        let mut items = self.load_items()?;
        if items.iter().any(|existing| existing.id == item.id) {
            bail!("item {} already exists", item.id);
        }
        item.updated_at = now;
        items.push(item.clone());
        self.save_items(&items)?;
        Ok(item)
    }

    /// Moves an item to `new_start` and marks it as locally changed.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub fn reschedule(
        &self,
        id: Uuid,
        new_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ScheduledItem> {
        let _guard = self.write_lock.lock();
        let mut items = self.load_items()?;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| anyhow!("item not found: {id}"))?;

        item.scheduled_start = Some(new_start);
        item.updated_at = now;
        let updated = item.clone();

        self.save_items(&items)?;
        info!(start = %new_start, "rescheduled item");
        Ok(updated)
    }

    /// Upserts calendar items by id. Items whose content is unchanged keep
    /// their stored `updated_at` so they do not count as local edits.
    #[tracing::instrument(skip(self, incoming))]
    pub fn import_items(
        &self,
        incoming: Vec<ScheduledItem>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ImportSummary> {
        let _guard = self.write_lock.lock();
        let mut items = self.load_items()?;
        let mut summary = ImportSummary::default();

        for mut candidate in incoming {
            candidate.updated_at = now;
            match items.iter_mut().find(|item| item.id == candidate.id) {
                Some(existing) => {
                    let mut probe = candidate.clone();
                    probe.updated_at = existing.updated_at;
                    if probe == *existing {
                        summary.unchanged += 1;
                    } else {
                        *existing = candidate;
                        summary.updated += 1;
                    }
                }
                None => {
                    items.push(candidate);
                    summary.created += 1;
                }
            }
        }

        if summary.created + summary.updated > 0 {
            self.save_items(&items)?;
        }
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "imported calendar items"
        );
        Ok(summary)
    }

    fn modify_records<F>(&self, kind: EntityKind, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Vec<EntityRecord>) -> anyhow::Result<()>,
    {
        let _guard = self.write_lock.lock();
        let mut records = self.load_records(kind)?;
        apply(&mut records)?;
        self.save_records(kind, &records)
    }
}

#[async_trait]
impl EntityEndpoint for DataStore {
    async fn fetch_all(&self, kind: EntityKind) -> anyhow::Result<Vec<EntityRecord>> {
        self.load_records(kind)
    }

    async fn create(&self, record: &EntityRecord) -> anyhow::Result<()> {
        self.modify_records(record.kind, |records| {
            if records.iter().any(|existing| existing.id == record.id) {
                bail!("record {} already exists in {}", record.id, record.kind);
            }
            records.push(record.clone());
            Ok(())
        })
    }

    async fn update(&self, record: &EntityRecord) -> anyhow::Result<()> {
        self.modify_records(record.kind, |records| {
            let slot = records
                .iter_mut()
                .find(|existing| existing.id == record.id)
                .ok_or_else(|| anyhow!("record {} not found in {}", record.id, record.kind))?;
            *slot = record.clone();
            Ok(())
        })
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> anyhow::Result<()> {
        self.modify_records(kind, |records| {
            let before = records.len();
            records.retain(|record| record.id != id);
            if records.len() == before {
                bail!("record {id} not found in {kind}");
            }
            Ok(())
        })
    }
}

fn collection_path(data_dir: &Path, kind: EntityKind) -> PathBuf {
    data_dir.join(format!("{}.data", kind.as_key()))
}

#[tracing::instrument(skip(path))]
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let row: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(row);
    }

    debug!(count = out.len(), "loaded rows from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, rows))]
fn save_jsonl_atomic<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = rows.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for row in rows {
        let serialized = serde_json::to_string(row)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
