use chrono::{
  Duration,
  NaiveDate,
  Weekday
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::geometry::TimeGrid;
use crate::model::ScheduledItem;
use crate::stack::assign_stack_indices;
use crate::visible::{
  DateRange,
  partition_visible,
  week_first_day
};

/// Where one block sits for the current
/// render pass. Never persisted.
#[derive(
  Debug, Clone, PartialEq, Serialize,
)]
pub struct LayoutSlot {
  pub item_id:     Uuid,
  pub offset:      f32,
  pub extent:      f32,
  pub stack_index: usize,
  pub stack_depth: usize
}

impl LayoutSlot {
  /// Splits `lane_extent` across the
  /// overlap cluster and returns this
  /// block's `(start, size)` on the
  /// cross axis.
  pub fn lane(
    &self,
    lane_extent: f32
  ) -> (f32, f32) {
    let depth = self.stack_depth.max(1);
    let size = lane_extent / depth as f32;
    (size * self.stack_index as f32, size)
  }
}

#[derive(Debug, Clone)]
pub struct DayLayout<'a> {
  pub date:    NaiveDate,
  pub slots:   Vec<LayoutSlot>,
  pub all_day: Vec<&'a ScheduledItem>
}

/// Filters, sorts, places and stacks the
/// items of one local day.
#[tracing::instrument(skip(items, grid))]
pub fn layout_day<'a>(
  items: &'a [ScheduledItem],
  date: NaiveDate,
  grid: &TimeGrid
) -> anyhow::Result<DayLayout<'a>> {
  let range =
    DateRange::day(date, &grid.timezone)?;
  let visible =
    partition_visible(items, &range);

  let mut timed = visible.timed;
  // Stable: equal starts keep input order.
  timed.sort_by_key(|item| {
    item.scheduled_start
  });

  let placements =
    assign_stack_indices(&timed);
  let slots = timed
    .iter()
    .zip(placements)
    .filter_map(|(item, placement)| {
      let start = item.scheduled_start?;
      Some(LayoutSlot {
        item_id:     item.id,
        offset:      grid.offset(start),
        extent:      grid.extent(
          item.effective_duration_minutes()
        ),
        stack_index: placement.index,
        stack_depth: placement.depth
      })
    })
    .collect::<Vec<_>>();

  debug!(
    %date,
    slots = slots.len(),
    all_day = visible.all_day.len(),
    "laid out day"
  );

  Ok(DayLayout {
    date,
    slots,
    all_day: visible.all_day
  })
}

/// Seven day columns starting on
/// `week_start`.
pub fn layout_week<'a>(
  items: &'a [ScheduledItem],
  date: NaiveDate,
  grid: &TimeGrid,
  week_start: Weekday
) -> anyhow::Result<Vec<DayLayout<'a>>> {
  let first =
    week_first_day(date, week_start);
  (0..7)
    .map(|offset| {
      layout_day(
        items,
        first + Duration::days(offset),
        grid
      )
    })
    .collect()
}
