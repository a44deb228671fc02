use std::sync::Arc;
use std::time::Duration;

use chrono::{
  DateTime,
  Timelike,
  Utc
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{
  debug,
  trace
};

use crate::geometry::TimeGrid;

pub const DEFAULT_TICK: Duration =
  Duration::from_secs(60);

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Position of the "now" line on a grid.
#[derive(Debug, Clone, Copy)]
pub struct NowIndicator {
  grid: TimeGrid
}

impl NowIndicator {
  pub fn new(grid: TimeGrid) -> Self {
    Self {
      grid
    }
  }

  /// `None` while the local hour is
  /// outside the grid, so the line hides
  /// instead of pinning to the top.
  pub fn offset_at(
    &self,
    now: DateTime<Utc>
  ) -> Option<f32> {
    let hour = now
      .with_timezone(&self.grid.timezone)
      .hour();
    if !self.grid.window.contains_hour(hour)
    {
      return None;
    }
    Some(self.grid.offset(now))
  }

  /// Recomputes the offset every `tick`
  /// on the current tokio runtime. Each
  /// tick reads the clock fresh. The task
  /// stops when the handle or every
  /// receiver is dropped.
  pub fn spawn(
    self,
    clock: Arc<dyn Clock>,
    tick: Duration
  ) -> NowIndicatorHandle {
    let (tx, rx) = watch::channel(
      self.offset_at(clock.now())
    );

    let task = tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(tick);
      interval.set_missed_tick_behavior(
        MissedTickBehavior::Skip
      );

      loop {
        interval.tick().await;
        if tx.is_closed() {
          debug!("now indicator has no observers; stopping");
          break;
        }

        let offset =
          self.offset_at(clock.now());
        let changed =
          tx.send_if_modified(|current| {
            if *current == offset {
              return false;
            }
            *current = offset;
            true
          });
        if changed {
          trace!(?offset, "now indicator moved");
        }
      }
    });

    NowIndicatorHandle {
      offsets: rx,
      task
    }
  }
}

#[derive(Debug)]
pub struct NowIndicatorHandle {
  offsets: watch::Receiver<Option<f32>>,
  task:    JoinHandle<()>
}

impl NowIndicatorHandle {
  pub fn current(&self) -> Option<f32> {
    *self.offsets.borrow()
  }

  pub fn subscribe(
    &self
  ) -> watch::Receiver<Option<f32>> {
    self.offsets.clone()
  }
}

impl Drop for NowIndicatorHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}
