use std::fmt;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::compact_date_serde;

/// Longest duration an item is laid out with; larger stored values are clamped.
pub const MAX_DURATION_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Task,
    Event,
}

/// A task or calendar event as the time grid sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledItem {
    pub id: Uuid,

    pub title: String,

    #[serde(default, with = "compact_date_serde::option")]
    pub scheduled_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_minutes: i64,

    #[serde(default)]
    pub is_all_day: bool,

    #[serde(with = "compact_date_serde")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub kind: ItemKind,

    #[serde(default)]
    pub calendar_color: Option<String>,
}

impl ScheduledItem {
    pub fn new_task(title: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            scheduled_start: None,
            duration_minutes: 0,
            is_all_day: false,
            updated_at: now,
            kind: ItemKind::Task,
            calendar_color: None,
        }
    }

    /// Duration clamped to `0..=MAX_DURATION_MINUTES`.
    pub fn effective_duration_minutes(&self) -> i64 {
        self.duration_minutes.clamp(0, MAX_DURATION_MINUTES)
    }

    /// Start plus the clamped duration, saturating at the latest representable time.
    pub fn scheduled_end(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start.map(|start| {
            start
                .checked_add_signed(Duration::minutes(self.effective_duration_minutes()))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Whether the item can be placed on (and dragged around) the time grid.
    pub fn is_timed(&self) -> bool {
        self.scheduled_start.is_some() && !self.is_all_day
    }
}

/// Entity collections exchanged with the remote backend, in sync order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Tasks,
    Goals,
    Achievements,
    Profile,
}

impl EntityKind {
    pub const SYNC_ORDER: [EntityKind; 4] = [
        EntityKind::Tasks,
        EntityKind::Goals,
        EntityKind::Achievements,
        EntityKind::Profile,
    ];

    pub fn as_key(self) -> &'static str {
        match self {
            EntityKind::Tasks => "tasks",
            EntityKind::Goals => "goals",
            EntityKind::Achievements => "achievements",
            EntityKind::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// A collection member as seen by sync: identity, freshness and an opaque body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub id: Uuid,

    pub kind: EntityKind,

    #[serde(with = "compact_date_serde")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl EntityRecord {
    pub fn from_item(item: &ScheduledItem) -> anyhow::Result<Self> {
        let data = serde_json::to_value(item)
            .with_context(|| format!("failed to serialize item {}", item.id))?;
        Ok(Self {
            id: item.id,
            kind: EntityKind::Tasks,
            updated_at: item.updated_at,
            data,
        })
    }

    pub fn to_item(&self) -> anyhow::Result<ScheduledItem> {
        if self.kind != EntityKind::Tasks {
            return Err(anyhow!(
                "record {} belongs to {}, not tasks",
                self.id,
                self.kind
            ));
        }
        let mut item: ScheduledItem = serde_json::from_value(self.data.clone())
            .with_context(|| format!("record {} is not a scheduled item", self.id))?;
        item.id = self.id;
        item.updated_at = self.updated_at;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{EntityKind, EntityRecord, MAX_DURATION_MINUTES, ScheduledItem};

    #[test]
    fn task_record_roundtrip_keeps_identity_and_freshness() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid now");
        let mut item = ScheduledItem::new_task("Plan sprint".to_string(), now);
        item.scheduled_start = Some(now);
        item.duration_minutes = 45;

        let record = EntityRecord::from_item(&item).expect("to record");
        assert_eq!(record.kind, EntityKind::Tasks);
        assert_eq!(record.updated_at, now);

        let back = record.to_item().expect("to item");
        assert_eq!(back, item);
    }

    #[test]
    fn non_task_record_is_not_an_item() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid now");
        let record = EntityRecord {
            id: uuid::Uuid::new_v4(),
            kind: EntityKind::Goals,
            updated_at: now,
            data: serde_json::json!({ "title": "run 5k" }),
        };
        assert!(record.to_item().is_err());
    }

    #[test]
    fn negative_duration_is_clamped() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid now");
        let mut item = ScheduledItem::new_task("x".to_string(), now);
        item.scheduled_start = Some(now);
        item.duration_minutes = -30;
        assert_eq!(item.effective_duration_minutes(), 0);
        assert_eq!(item.scheduled_end(), Some(now));
    }

    #[test]
    fn oversized_duration_is_clamped() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid now");
        let mut item = ScheduledItem::new_task("x".to_string(), now);
        item.scheduled_start = Some(now);
        item.duration_minutes = i64::MAX;
        assert_eq!(item.effective_duration_minutes(), MAX_DURATION_MINUTES);
        assert_eq!(
            item.scheduled_end(),
            Some(now + Duration::minutes(MAX_DURATION_MINUTES))
        );

        item.scheduled_start = Some(DateTime::<Utc>::MAX_UTC - Duration::minutes(5));
        assert_eq!(item.scheduled_end(), Some(DateTime::<Utc>::MAX_UTC));
    }
}
