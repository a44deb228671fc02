//! Long-press drag gestures turned into
//! snapped reschedule intents.
//!
//! The translator is driven by pointer
//! events and never touches storage; a
//! committed drag hands its intent to a
//! caller-supplied callback exactly once.

use std::time::{
  Duration as StdDuration,
  Instant
};

use anyhow::anyhow;
use chrono::{
  DateTime,
  Duration,
  Utc
};
use tracing::{
  debug,
  trace
};
use uuid::Uuid;

use crate::geometry::TimeWindow;
use crate::model::ScheduledItem;

pub const DEFAULT_LONG_PRESS:
  StdDuration =
  StdDuration::from_millis(300);
pub const DEFAULT_SLOT_MINUTES: i64 = 15;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum DragPhase {
  Idle,
  Pressing,
  Dragging,
  Committed,
  Cancelled
}

impl DragPhase {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      DragPhase::Committed
        | DragPhase::Cancelled
    )
  }
}

/// Feedback the view should play.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum DragCue {
  /// Long press recognised; lift the
  /// block.
  Lift
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragConfig {
  pub pixels_per_slot:       f32,
  pub slot_interval_minutes: i64,
  pub long_press:            StdDuration
}

impl DragConfig {
  /// Slot size in pixels follows the
  /// grid density: 15 minutes at 60px
  /// per hour is 15px.
  pub fn for_window(
    window: &TimeWindow,
    slot_interval_minutes: i64,
    long_press: StdDuration
  ) -> anyhow::Result<Self> {
    if slot_interval_minutes <= 0 {
      return Err(anyhow!(
        "slot interval must be \
         positive, got \
         {slot_interval_minutes}"
      ));
    }
    Ok(Self {
      pixels_per_slot: window
        .pixels_per_hour()
        * slot_interval_minutes as f32
        / 60.0,
      slot_interval_minutes,
      long_press
    })
  }

  pub fn slots_for(
    &self,
    delta: f32
  ) -> i64 {
    if !delta.is_finite()
      || self.pixels_per_slot <= 0.0
    {
      return 0;
    }
    (delta / self.pixels_per_slot).round()
      as i64
  }
}

/// Live state of one gesture.
#[derive(Debug, Clone, PartialEq)]
pub struct DragSession {
  pub item_id:           Uuid,
  pub original_start:    DateTime<Utc>,
  pub accumulated_delta: f32,
  pub is_active:         bool
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleIntent {
  pub item_id:        Uuid,
  pub original_start: DateTime<Utc>,
  pub new_start:      DateTime<Utc>,
  pub slots_moved:    i64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragOutcome {
  Committed(RescheduleIntent),
  Cancelled,
  /// Nothing was being dragged.
  Ignored
}

#[derive(Debug, Clone)]
pub struct DragTranslator {
  config:     DragConfig,
  phase:      DragPhase,
  pressed_at: Option<Instant>,
  session:    Option<DragSession>
}

impl DragTranslator {
  pub fn new(config: DragConfig) -> Self {
    Self {
      config,
      phase: DragPhase::Idle,
      pressed_at: None,
      session: None
    }
  }

  pub fn config(&self) -> &DragConfig {
    &self.config
  }

  pub fn phase(&self) -> DragPhase {
    self.phase
  }

  pub fn session(
    &self
  ) -> Option<&DragSession> {
    self.session.as_ref()
  }

  /// Finger down on a block. Returns
  /// false when the item cannot be
  /// dragged or a gesture is already in
  /// progress.
  pub fn press(
    &mut self,
    item: &ScheduledItem,
    at: Instant
  ) -> bool {
    if self.phase.is_terminal() {
      self.reset();
    }
    if self.phase != DragPhase::Idle
      || self.pressed_at.is_some()
    {
      return false;
    }
    let Some(original_start) =
      item.scheduled_start
    else {
      return false;
    };
    if item.is_all_day {
      return false;
    }

    trace!(item_id = %item.id, "press armed");
    self.pressed_at = Some(at);
    self.session = Some(DragSession {
      item_id: item.id,
      original_start,
      accumulated_delta: 0.0,
      is_active: false
    });
    true
  }

  /// Called while the finger stays down.
  /// Promotes the press once it has
  /// lasted the long-press threshold.
  pub fn hold(
    &mut self,
    now: Instant
  ) -> Option<DragCue> {
    if self.phase != DragPhase::Idle {
      return None;
    }
    let pressed_at = self.pressed_at?;
    if now.saturating_duration_since(
      pressed_at
    ) < self.config.long_press
    {
      return None;
    }

    let session = self.session.as_mut()?;
    session.is_active = true;
    self.phase = DragPhase::Pressing;
    debug!(item_id = %session.item_id, "drag lifted");
    Some(DragCue::Lift)
  }

  /// Adds an incremental pointer step.
  /// Before the long press fires this is
  /// a scroll and the press is dropped.
  /// Returns the snapped candidate time.
  pub fn pointer_moved(
    &mut self,
    step: f32
  ) -> Option<DateTime<Utc>> {
    let current = self
      .session
      .as_ref()
      .map(|session| {
        session.accumulated_delta
      })
      .unwrap_or_default();
    let total = if step.is_finite() {
      current + step
    } else {
      current
    };
    self.pointer_translated(total)
  }

  /// Sets the total displacement since
  /// the press.
  pub fn pointer_translated(
    &mut self,
    total: f32
  ) -> Option<DateTime<Utc>> {
    match self.phase {
      | DragPhase::Idle => {
        if self.pressed_at.is_some() {
          trace!("movement before long press; abandoning");
          self.clear();
        }
        None
      }
      | DragPhase::Pressing
      | DragPhase::Dragging => {
        if let Some(session) =
          self.session.as_mut()
          && total.is_finite()
        {
          session.accumulated_delta = total;
        }
        self.phase = DragPhase::Dragging;
        self.candidate_time()
      }
      | DragPhase::Committed
      | DragPhase::Cancelled => None
    }
  }

  pub fn slots_moved(&self) -> i64 {
    self
      .session
      .as_ref()
      .map(|session| {
        self
          .config
          .slots_for(session.accumulated_delta)
      })
      .unwrap_or(0)
  }

  /// `original + slots * interval`, or
  /// `None` when that time is out of
  /// range.
  pub fn candidate_time(
    &self
  ) -> Option<DateTime<Utc>> {
    let session = self.session.as_ref()?;
    let minutes = self
      .slots_moved()
      .checked_mul(
        self.config.slot_interval_minutes
      )?;
    session.original_start.checked_add_signed(
      Duration::try_minutes(minutes)?
    )
  }

  /// Finger up. A drag that moved at
  /// least one slot commits and calls
  /// `on_commit` once; anything else
  /// cancels without calling it.
  pub fn release<F>(
    &mut self,
    on_commit: F
  ) -> DragOutcome
  where
    F: FnOnce(&RescheduleIntent)
  {
    match self.phase {
      | DragPhase::Dragging => {
        let slots_moved =
          self.slots_moved();
        let intent = self
          .session
          .as_ref()
          .zip(self.candidate_time())
          .filter(|_| slots_moved != 0)
          .map(|(session, new_start)| {
            RescheduleIntent {
              item_id: session.item_id,
              original_start: session
                .original_start,
              new_start,
              slots_moved
            }
          });

        self.clear();
        match intent {
          | Some(intent) => {
            self.phase =
              DragPhase::Committed;
            debug!(
              item_id = %intent.item_id,
              slots_moved,
              new_start = %intent.new_start,
              "drag committed"
            );
            on_commit(&intent);
            DragOutcome::Committed(intent)
          }
          | None => {
            self.phase =
              DragPhase::Cancelled;
            debug!("drag released in place; snapping back");
            DragOutcome::Cancelled
          }
        }
      }
      | DragPhase::Pressing => {
        self.clear();
        self.phase = DragPhase::Cancelled;
        DragOutcome::Cancelled
      }
      | DragPhase::Idle => {
        self.clear();
        DragOutcome::Ignored
      }
      | DragPhase::Committed
      | DragPhase::Cancelled => {
        DragOutcome::Ignored
      }
    }
  }

  /// The platform cancelled the gesture.
  pub fn cancel(&mut self) -> DragOutcome {
    match self.phase {
      | DragPhase::Pressing
      | DragPhase::Dragging => {
        self.clear();
        self.phase = DragPhase::Cancelled;
        debug!("drag cancelled");
        DragOutcome::Cancelled
      }
      | DragPhase::Idle => {
        self.clear();
        DragOutcome::Ignored
      }
      | DragPhase::Committed
      | DragPhase::Cancelled => {
        DragOutcome::Ignored
      }
    }
  }

  pub fn reset(&mut self) {
    self.clear();
    self.phase = DragPhase::Idle;
  }

  fn clear(&mut self) {
    self.pressed_at = None;
    self.session = None;
  }
}

#[cfg(test)]
mod tests {
  use std::time::{
    Duration as StdDuration,
    Instant
  };

  use chrono::{
    Duration,
    TimeZone,
    Utc
  };

  use super::{
    DragConfig,
    DragCue,
    DragOutcome,
    DragPhase,
    DragTranslator
  };
  use crate::geometry::TimeWindow;
  use crate::model::ScheduledItem;

  fn translator() -> DragTranslator {
    let window = TimeWindow::new(6, 22, 60.0)
      .expect("valid window");
    DragTranslator::new(
      DragConfig::for_window(
        &window,
        15,
        StdDuration::from_millis(300)
      )
      .expect("valid config")
    )
  }

  fn item() -> ScheduledItem {
    let start = Utc
      .with_ymd_and_hms(
        2026, 3, 2, 9, 30, 0
      )
      .single()
      .expect("valid start");
    let mut item = ScheduledItem::new_task(
      "standup".to_string(),
      start
    );
    item.scheduled_start = Some(start);
    item.duration_minutes = 45;
    item
  }

  fn lift(
    drag: &mut DragTranslator,
    item: &ScheduledItem
  ) {
    let t0 = Instant::now();
    assert!(drag.press(item, t0));
    assert_eq!(
      drag.hold(
        t0 + StdDuration::from_millis(100)
      ),
      None
    );
    assert_eq!(
      drag.hold(
        t0 + StdDuration::from_millis(300)
      ),
      Some(DragCue::Lift)
    );
    assert_eq!(
      drag.phase(),
      DragPhase::Pressing
    );
  }

  #[test]
  fn thirty_seven_pixels_moves_two_slots()
  {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);

    assert_eq!(
      drag.config().pixels_per_slot,
      15.0
    );
    drag.pointer_moved(20.0);
    let preview = drag.pointer_moved(17.0);
    assert_eq!(drag.slots_moved(), 2);
    assert_eq!(
      preview,
      item
        .scheduled_start
        .map(|s| s + Duration::minutes(30))
    );

    let mut calls = Vec::new();
    let outcome = drag.release(|intent| {
      calls.push(intent.clone());
    });

    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].slots_moved, 2);
    assert_eq!(
      Some(calls[0].new_start),
      item
        .scheduled_start
        .map(|s| s + Duration::minutes(30))
    );
    assert!(matches!(
      outcome,
      DragOutcome::Committed(_)
    ));
    assert_eq!(
      drag.phase(),
      DragPhase::Committed
    );
  }

  #[test]
  fn release_under_half_a_slot_cancels()
  {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);
    drag.pointer_moved(7.0);
    drag.pointer_moved(-14.0);

    let mut called = false;
    let outcome =
      drag.release(|_| called = true);
    assert!(!called);
    assert_eq!(
      outcome,
      DragOutcome::Cancelled
    );
    assert_eq!(
      drag.phase(),
      DragPhase::Cancelled
    );
    assert!(drag.session().is_none());
  }

  #[test]
  fn upward_drag_moves_earlier() {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);
    drag.pointer_translated(-46.0);

    let mut got = None;
    drag.release(|intent| {
      got = Some(intent.new_start);
    });
    assert_eq!(
      got,
      item
        .scheduled_start
        .map(|s| s - Duration::minutes(45))
    );
  }

  #[test]
  fn movement_before_long_press_is_a_scroll()
   {
    let mut drag = translator();
    let item = item();
    let t0 = Instant::now();
    assert!(drag.press(&item, t0));
    assert_eq!(drag.pointer_moved(40.0), None);
    assert_eq!(
      drag.hold(
        t0 + StdDuration::from_secs(1)
      ),
      None
    );

    let mut called = false;
    assert_eq!(
      drag.release(|_| called = true),
      DragOutcome::Ignored
    );
    assert!(!called);
  }

  #[test]
  fn external_cancel_never_calls_back() {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);
    drag.pointer_moved(90.0);
    assert_eq!(
      drag.cancel(),
      DragOutcome::Cancelled
    );

    let mut called = false;
    assert_eq!(
      drag.release(|_| called = true),
      DragOutcome::Ignored
    );
    assert!(!called);
  }

  #[test]
  fn committed_drag_cannot_fire_twice() {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);
    drag.pointer_moved(30.0);

    let mut calls = 0;
    drag.release(|_| calls += 1);
    drag.release(|_| calls += 1);
    assert_eq!(calls, 1);

    // A fresh gesture starts over.
    lift(&mut drag, &item);
    assert_eq!(drag.slots_moved(), 0);
  }

  #[test]
  fn unscheduled_and_all_day_items_are_not_draggable()
   {
    let mut drag = translator();
    let mut floating = item();
    floating.scheduled_start = None;
    assert!(
      !drag.press(&floating, Instant::now())
    );

    let mut holiday = item();
    holiday.is_all_day = true;
    assert!(
      !drag.press(&holiday, Instant::now())
    );
  }

  #[test]
  fn non_finite_deltas_are_ignored() {
    let mut drag = translator();
    let item = item();
    lift(&mut drag, &item);
    drag.pointer_moved(f32::NAN);
    drag.pointer_moved(f32::INFINITY);
    assert_eq!(drag.slots_moved(), 0);
  }

  #[test]
  fn out_of_range_deltas_cancel() {
    for delta in [1e13, -1e13, f32::MAX] {
      let mut drag = translator();
      let item = item();
      lift(&mut drag, &item);
      assert_eq!(
        drag.pointer_translated(delta),
        None
      );
      let mut calls = 0;
      let outcome =
        drag.release(|_| calls += 1);
      assert_eq!(
        outcome,
        DragOutcome::Cancelled
      );
      assert_eq!(calls, 0);
      assert_eq!(
        drag.phase(),
        DragPhase::Cancelled
      );
    }
  }

  #[test]
  fn rejects_non_positive_slot_interval()
  {
    let window = TimeWindow::new(6, 22, 60.0)
      .expect("valid window");
    assert!(
      DragConfig::for_window(
        &window,
        0,
        StdDuration::from_millis(300)
      )
      .is_err()
    );
  }
}
