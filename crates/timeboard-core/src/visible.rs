use chrono::{
  DateTime,
  Datelike,
  Duration,
  NaiveDate,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use tracing::trace;

use crate::datetime::local_midnight;
use crate::model::ScheduledItem;

/// Half-open UTC interval
/// `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>
}

impl DateRange {
  pub fn new(
    start: DateTime<Utc>,
    end: DateTime<Utc>
  ) -> Self {
    Self {
      start,
      end
    }
  }

  /// One local calendar day. Follows DST,
  /// so the range may be 23 or 25 hours.
  pub fn day(
    date: NaiveDate,
    tz: &Tz
  ) -> anyhow::Result<Self> {
    let next = date
      .succ_opt()
      .unwrap_or(date);
    Ok(Self {
      start: local_midnight(tz, date)?,
      end:   local_midnight(tz, next)?
    })
  }

  /// The local week containing `date`,
  /// beginning on `week_start`.
  pub fn week(
    date: NaiveDate,
    tz: &Tz,
    week_start: Weekday
  ) -> anyhow::Result<Self> {
    let first = week_first_day(
      date, week_start
    );
    let last = first
      + Duration::days(7);
    Ok(Self {
      start: local_midnight(tz, first)?,
      end:   local_midnight(tz, last)?
    })
  }

  pub fn contains(
    &self,
    at: DateTime<Utc>
  ) -> bool {
    at >= self.start && at < self.end
  }
}

pub fn week_first_day(
  date: NaiveDate,
  week_start: Weekday
) -> NaiveDate {
  let back = (7
    + date.weekday().num_days_from_monday()
    - week_start.num_days_from_monday())
    % 7;
  date - Duration::days(i64::from(back))
}

pub fn parse_week_start(
  raw: &str
) -> Option<Weekday> {
  match raw
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | _ => None
  }
}

/// Items selected for one display window.
#[derive(Debug, Clone, Default)]
pub struct VisibleItems<'a> {
  /// Items placed on the time grid, in
  /// input order.
  pub timed:   Vec<&'a ScheduledItem>,
  /// All-day items, kept off the grid.
  pub all_day: Vec<&'a ScheduledItem>
}

impl VisibleItems<'_> {
  pub fn is_empty(&self) -> bool {
    self.timed.is_empty()
      && self.all_day.is_empty()
  }
}

/// Selects the items starting inside
/// `range`, preserving input order.
/// Unscheduled items are never visible.
pub fn partition_visible<'a, I>(
  items: I,
  range: &DateRange
) -> VisibleItems<'a>
where
  I: IntoIterator<
    Item = &'a ScheduledItem
  >
{
  let mut out = VisibleItems::default();
  for item in items {
    let Some(start) =
      item.scheduled_start
    else {
      continue;
    };
    if !range.contains(start) {
      continue;
    }

    if item.is_all_day {
      out.all_day.push(item);
    } else {
      out.timed.push(item);
    }
  }

  trace!(
    timed = out.timed.len(),
    all_day = out.all_day.len(),
    "partitioned visible items"
  );
  out
}
