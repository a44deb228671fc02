//! Timestamp to pixel mapping shared by
//! every grid-style view.
//!
//! All functions here are pure: the same
//! instant, duration and grid always give
//! the same offset and extent.

use anyhow::anyhow;
use chrono::{
  DateTime,
  Duration,
  NaiveDate,
  Timelike,
  Utc
};
use chrono_tz::Tz;
use serde::{
  Deserialize,
  Serialize
};

use crate::datetime::local_to_utc;

pub const DEFAULT_MINIMUM_BLOCK_EXTENT:
  f32 = 20.0;

/// Hour range and pixel density of a
/// grid. Construct with
/// [`TimeWindow::new`] to keep
/// `0 <= start_hour < end_hour <= 24`.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Serialize,
  Deserialize,
)]
pub struct TimeWindow {
  start_hour:      u32,
  end_hour:        u32,
  pixels_per_hour: f32
}

impl TimeWindow {
  pub fn new(
    start_hour: u32,
    end_hour: u32,
    pixels_per_hour: f32
  ) -> anyhow::Result<Self> {
    if start_hour >= end_hour
      || end_hour > 24
    {
      return Err(anyhow!(
        "invalid hour range \
         {start_hour}..{end_hour}; \
         expected 0 <= start < end <= 24"
      ));
    }
    if !pixels_per_hour.is_finite()
      || pixels_per_hour <= 0.0
    {
      return Err(anyhow!(
        "pixels per hour must be a \
         positive number, got \
         {pixels_per_hour}"
      ));
    }

    Ok(Self {
      start_hour,
      end_hour,
      pixels_per_hour
    })
  }

  pub fn start_hour(&self) -> u32 {
    self.start_hour
  }

  pub fn end_hour(&self) -> u32 {
    self.end_hour
  }

  pub fn pixels_per_hour(&self) -> f32 {
    self.pixels_per_hour
  }

  pub fn hours(&self) -> u32 {
    self.end_hour - self.start_hour
  }

  pub fn contains_hour(
    &self,
    hour: u32
  ) -> bool {
    hour >= self.start_hour
      && hour < self.end_hour
  }
}

/// Direction blocks are laid out along.
/// Carousel and timeline strips run
/// horizontally; day and week columns
/// run vertically.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
  #[default]
  Vertical,
  Horizontal
}

impl Axis {
  pub fn from_key(
    raw: &str
  ) -> Option<Self> {
    match raw
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "vertical" | "v" => {
        Some(Self::Vertical)
      }
      | "horizontal" | "h" => {
        Some(Self::Horizontal)
      }
      | _ => None
    }
  }
}

/// Point on the screen produced by
/// placing an offset along an axis.
#[derive(
  Debug, Clone, Copy, PartialEq,
)]
pub struct Point {
  pub x: f32,
  pub y: f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeGrid {
  pub window: TimeWindow,
  pub timezone: Tz,
  pub minimum_block_extent: f32,
  pub axis: Axis
}

impl TimeGrid {
  pub fn new(
    window: TimeWindow,
    timezone: Tz
  ) -> Self {
    Self {
      window,
      timezone,
      minimum_block_extent:
        DEFAULT_MINIMUM_BLOCK_EXTENT,
      axis: Axis::Vertical
    }
  }

  #[must_use]
  pub fn with_minimum_block_extent(
    mut self,
    extent: f32
  ) -> Self {
    self.minimum_block_extent =
      extent.max(0.0);
    self
  }

  #[must_use]
  pub fn with_axis(
    mut self,
    axis: Axis
  ) -> Self {
    self.axis = axis;
    self
  }

  /// Distance from the grid origin to
  /// `start`. Anything before
  /// `start_hour` pins to the top; times
  /// past `end_hour` are left alone.
  pub fn offset(
    &self,
    start: DateTime<Utc>
  ) -> f32 {
    let local =
      start.with_timezone(&self.timezone);
    let hour = local.hour();
    if hour < self.window.start_hour {
      return 0.0;
    }

    let pph = self.window.pixels_per_hour;
    (hour - self.window.start_hour) as f32
      * pph
      + (local.minute() as f32 / 60.0)
        * pph
  }

  pub fn extent(
    &self,
    duration_minutes: i64
  ) -> f32 {
    let minutes =
      duration_minutes.max(0) as f32;
    (minutes / 60.0
      * self.window.pixels_per_hour)
      .max(self.minimum_block_extent)
  }

  /// Shortest duration that renders
  /// taller than the minimum block.
  pub fn minimum_implied_minutes(
    &self
  ) -> f32 {
    self.minimum_block_extent
      / self.window.pixels_per_hour
      * 60.0
  }

  pub fn grid_extent(&self) -> f32 {
    self.window.hours() as f32
      * self.window.pixels_per_hour
  }

  /// Places an offset on the configured
  /// axis, with `cross` as the position
  /// on the other axis.
  pub fn point(
    &self,
    offset: f32,
    cross: f32
  ) -> Point {
    match self.axis {
      | Axis::Vertical => {
        Point {
          x: cross,
          y: offset
        }
      }
      | Axis::Horizontal => {
        Point {
          x: offset,
          y: cross
        }
      }
    }
  }

  /// Inverse of [`TimeGrid::offset`] for
  /// a local day, clamped to the grid
  /// and rounded to the minute.
  pub fn time_at_offset(
    &self,
    day: NaiveDate,
    offset: f32
  ) -> anyhow::Result<DateTime<Utc>> {
    let clamped = if offset.is_finite() {
      offset.clamp(0.0, self.grid_extent())
    } else {
      0.0
    };
    let minutes = (clamped
      / self.window.pixels_per_hour
      * 60.0)
      .round() as i64;

    let origin = day
      .and_hms_opt(0, 0, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct \
           midnight for {day}"
        )
      })?
      + Duration::hours(i64::from(
        self.window.start_hour
      ))
      + Duration::minutes(minutes);

    local_to_utc(&self.timezone, origin)
  }
}
