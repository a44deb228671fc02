use std::fs;
use std::io::{
  BufReader,
  Write
};
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow,
  bail
};
use async_trait::async_trait;
use chrono::{
  DateTime,
  Duration,
  NaiveDate,
  NaiveDateTime,
  Utc
};
use chrono_tz::Tz;
use ical::IcalParser;
use ical::parser::ical::component::IcalEvent;
use ical::property::Property;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{
  debug,
  info,
  warn
};
use uuid::Uuid;

use crate::datetime::{
  COMPACT_FORMAT,
  local_midnight,
  local_to_utc
};
use crate::model::{
  ItemKind,
  ScheduledItem
};
use crate::visible::DateRange;

const EMPTY_CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//timeboard//EN\r\nEND:VCALENDAR\r\n";
const UID_SUFFIX: &str = "@timeboard";

/// Source of calendar events shown next
/// to tasks on the grid.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
  async fn events_between(
    &self,
    range: &DateRange
  ) -> anyhow::Result<Vec<CalendarEvent>>;

  /// Writes `item` to the calendar and
  /// returns the stored event.
  async fn create_event(
    &self,
    item: &ScheduledItem
  ) -> anyhow::Result<CalendarEvent>;
}

#[derive(
  Debug, Clone, PartialEq, Eq, Serialize,
)]
pub struct CalendarEvent {
  pub uid:            String,
  pub title:          String,
  pub start:          DateTime<Utc>,
  pub end:            DateTime<Utc>,
  pub is_all_day:     bool,
  pub calendar_color: Option<String>
}

impl CalendarEvent {
  /// Same UID, same item id, so repeated
  /// imports update in place.
  pub fn item_id(&self) -> Uuid {
    Uuid::new_v5(
      &Uuid::NAMESPACE_OID,
      format!("timeboard:event:{}", self.uid)
        .as_bytes()
    )
  }

  pub fn to_scheduled_item(
    &self,
    now: DateTime<Utc>
  ) -> ScheduledItem {
    ScheduledItem {
      id:               self.item_id(),
      title:            self.title.clone(),
      scheduled_start:  Some(self.start),
      duration_minutes: (self.end
        - self.start)
        .num_minutes()
        .max(0),
      is_all_day:       self.is_all_day,
      updated_at:       now,
      kind:             ItemKind::Event,
      calendar_color:   self
        .calendar_color
        .clone()
    }
  }
}

/// Calendar backed by a single `.ics`
/// file. Floating times are read in
/// `timezone`.
#[derive(Debug)]
pub struct IcsCalendar {
  path:       PathBuf,
  timezone:   Tz,
  color:      Option<String>,
  write_lock: Mutex<()>
}

impl IcsCalendar {
  pub fn new(
    path: impl Into<PathBuf>,
    timezone: Tz
  ) -> Self {
    Self {
      path: path.into(),
      timezone,
      color: None,
      write_lock: Mutex::new(())
    }
  }

  /// Fallback color for events that do
  /// not carry their own.
  pub fn with_color(
    mut self,
    color: impl Into<String>
  ) -> Self {
    self.color = Some(color.into());
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Every event in the file. A missing
  /// file is an empty calendar.
  #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
  pub fn load_events(
    &self
  ) -> anyhow::Result<Vec<CalendarEvent>> {
    if !self.path.exists() {
      debug!("calendar file missing; treating as empty");
      return Ok(Vec::new());
    }
    let text = fs::read_to_string(&self.path)
      .with_context(|| {
        format!(
          "failed reading {}",
          self.path.display()
        )
      })?;
    parse_ics_events(
      &text,
      &self.timezone,
      self.color.as_deref()
    )
  }

  fn append_event(
    &self,
    event: &CalendarEvent
  ) -> anyhow::Result<()> {
    let _guard = self.write_lock.lock();
    let existing = if self.path.exists() {
      fs::read_to_string(&self.path)
        .with_context(|| {
          format!(
            "failed reading {}",
            self.path.display()
          )
        })?
    } else {
      EMPTY_CALENDAR.to_string()
    };

    let Some(end_at) =
      existing.rfind("END:VCALENDAR")
    else {
      bail!(
        "{} is not a VCALENDAR document",
        self.path.display()
      );
    };

    let mut document = String::with_capacity(
      existing.len() + 256
    );
    document.push_str(&existing[..end_at]);
    if !document.ends_with('\n') {
      document.push_str("\r\n");
    }
    document.push_str(&render_vevent(
      event,
      &self.timezone
    ));
    document.push_str(&existing[end_at..]);

    let dir = self
      .path
      .parent()
      .filter(|dir| {
        !dir.as_os_str().is_empty()
      })
      .unwrap_or_else(|| Path::new("."));
    let mut temp =
      NamedTempFile::new_in(dir)?;
    temp.write_all(document.as_bytes())?;
    temp.flush()?;
    temp.persist(&self.path).map_err(
      |err| {
        anyhow!(
          "failed to persist {}: {}",
          self.path.display(),
          err
        )
      }
    )?;
    Ok(())
  }
}

#[async_trait]
impl CalendarProvider for IcsCalendar {
  async fn events_between(
    &self,
    range: &DateRange
  ) -> anyhow::Result<Vec<CalendarEvent>> {
    let events = self
      .load_events()?
      .into_iter()
      .filter(|event| {
        range.contains(event.start)
      })
      .collect::<Vec<_>>();
    debug!(
      count = events.len(),
      "calendar events in range"
    );
    Ok(events)
  }

  #[tracing::instrument(skip(self, item), fields(id = %item.id))]
  async fn create_event(
    &self,
    item: &ScheduledItem
  ) -> anyhow::Result<CalendarEvent> {
    let start =
      item.scheduled_start.ok_or_else(
        || {
          anyhow!(
            "item {} has no start time",
            item.id
          )
        }
      )?;
    let end = if item.is_all_day {
      start
        .checked_add_signed(Duration::days(
          (item.effective_duration_minutes()
            / (24 * 60))
            .max(1)
        ))
        .ok_or_else(|| {
          anyhow!(
            "item {} ends out of range",
            item.id
          )
        })?
    } else {
      item.scheduled_end().unwrap_or(start)
    };

    let event = CalendarEvent {
      uid: format!(
        "{}{UID_SUFFIX}",
        item.id
      ),
      title: item.title.clone(),
      start,
      end,
      is_all_day: item.is_all_day,
      calendar_color: item
        .calendar_color
        .clone()
        .or_else(|| self.color.clone())
    };
    self.append_event(&event)?;
    info!(uid = %event.uid, "added calendar event");
    Ok(event)
  }
}

/// Parses every VEVENT in `ics_text`.
/// Events without a UID or a usable
/// DTSTART, and cancelled events, are
/// skipped.
pub fn parse_ics_events(
  ics_text: &str,
  timezone: &Tz,
  default_color: Option<&str>
) -> anyhow::Result<Vec<CalendarEvent>> {
  let mut events = Vec::new();
  let reader =
    BufReader::new(ics_text.as_bytes());
  let parser = IcalParser::new(reader);

  for calendar in parser {
    let calendar = calendar.context(
      "failed parsing iCalendar payload"
    )?;
    for event in calendar.events {
      if let Some(normalized) =
        normalize_ical_event(
          &event,
          timezone,
          default_color
        )
      {
        events.push(normalized);
      }
    }
  }

  Ok(events)
}

fn normalize_ical_event(
  event: &IcalEvent,
  timezone: &Tz,
  default_color: Option<&str>
) -> Option<CalendarEvent> {
  let Some(uid) =
    property_value(&event.properties, "UID")
      .filter(|uid| !uid.is_empty())
  else {
    warn!("skipping VEVENT without UID");
    return None;
  };

  if property_value(
    &event.properties,
    "STATUS"
  )
  .is_some_and(|status| {
    status.eq_ignore_ascii_case("CANCELLED")
  }) {
    debug!(%uid, "skipping cancelled event");
    return None;
  }

  let title = property_value(
    &event.properties,
    "SUMMARY"
  )
  .map(|summary| unescape_text(&summary))
  .filter(|summary| !summary.is_empty())
  .unwrap_or_else(|| {
    "Calendar Event".to_string()
  });

  let dtstart = find_property(
    &event.properties,
    "DTSTART"
  )?;
  let Some((start, is_all_day)) =
    parse_ics_datetime(dtstart, timezone)
  else {
    warn!(%uid, "skipping event with unreadable DTSTART");
    return None;
  };

  let dtend = find_property(
    &event.properties,
    "DTEND"
  )
  .and_then(|prop| {
    parse_ics_datetime(prop, timezone)
  })
  .map(|(end, _)| end);
  let end = match dtend {
    | Some(end) => end,
    | None => {
      match property_value(
        &event.properties,
        "DURATION"
      ) {
        | Some(raw) => {
          let Some(end) =
            parse_ics_duration(&raw).and_then(
              |duration| {
                start
                  .checked_add_signed(duration)
              }
            )
          else {
            warn!(
              %uid,
              duration = %raw,
              "skipping event with unusable DURATION"
            );
            return None;
          };
          end
        }
        | None if is_all_day => {
          start + Duration::days(1)
        }
        | None => start
      }
    }
  }
  .max(start);

  let calendar_color = property_value(
    &event.properties,
    "COLOR"
  )
  .or_else(|| {
    property_value(
      &event.properties,
      "X-APPLE-CALENDAR-COLOR"
    )
  })
  .or_else(|| {
    default_color.map(str::to_string)
  });

  Some(CalendarEvent {
    uid,
    title,
    start,
    end,
    is_all_day,
    calendar_color
  })
}

/// Returns the UTC instant and whether the
/// value was a bare date.
fn parse_ics_datetime(
  property: &Property,
  fallback: &Tz
) -> Option<(DateTime<Utc>, bool)> {
  let raw =
    property.value.as_ref()?.trim();
  if raw.is_empty() {
    return None;
  }

  if raw.ends_with('Z')
    && let Ok(naive) =
      NaiveDateTime::parse_from_str(
        raw,
        COMPACT_FORMAT
      )
  {
    return Some((
      DateTime::<Utc>::from_naive_utc_and_offset(
        naive, Utc
      ),
      false
    ));
  }

  let timezone =
    timezone_from_property(property)
      .unwrap_or(*fallback);

  if raw.len() == 8
    && let Ok(date) =
      NaiveDate::parse_from_str(
        raw, "%Y%m%d"
      )
  {
    return local_midnight(&timezone, date)
      .ok()
      .map(|start| (start, true));
  }

  if let Ok(naive) =
    NaiveDateTime::parse_from_str(
      raw,
      "%Y%m%dT%H%M%S"
    )
  {
    return local_to_utc(&timezone, naive)
      .ok()
      .map(|start| (start, false));
  }

  if let Ok(parsed) =
    DateTime::parse_from_rfc3339(raw)
  {
    return Some((
      parsed.with_timezone(&Utc),
      false
    ));
  }

  None
}

fn timezone_from_property(
  property: &Property
) -> Option<Tz> {
  let params = property.params.as_ref()?;
  for (key, values) in params {
    if key != "TZID" {
      continue;
    }
    let Some(value) = values.first()
    else {
      continue;
    };
    match value.trim().parse::<Tz>() {
      | Ok(tz) => return Some(tz),
      | Err(error) => {
        warn!(
          tzid = %value,
          error = %error,
          "invalid TZID in ICS; using calendar timezone"
        );
      }
    }
  }
  None
}

/// `P1D`, `PT1H30M`, `P2W` and friends.
/// Signed durations are not accepted, and
/// neither are ones chrono cannot hold.
fn parse_ics_duration(
  raw: &str
) -> Option<Duration> {
  static DURATION_RE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  let re = DURATION_RE
    .get_or_init(|| {
      Regex::new(
        r"^\+?P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$"
      )
      .ok()
    })
    .as_ref()?;

  let caps = re.captures(raw.trim())?;
  let part = |idx: usize| -> Option<i64> {
    caps.get(idx).map_or(Some(0), |m| {
      m.as_str().parse().ok()
    })
  };
  [
    Duration::try_weeks(part(1)?)?,
    Duration::try_days(part(2)?)?,
    Duration::try_hours(part(3)?)?,
    Duration::try_minutes(part(4)?)?,
    Duration::try_seconds(part(5)?)?
  ]
  .into_iter()
  .try_fold(Duration::zero(), |acc, part| {
    acc.checked_add(&part)
  })
}

fn render_vevent(
  event: &CalendarEvent,
  timezone: &Tz
) -> String {
  let stamp = Utc::now()
    .format(COMPACT_FORMAT)
    .to_string();
  let (start, end) = if event.is_all_day {
    (
      format!(
        "DTSTART;VALUE=DATE:{}",
        event
          .start
          .with_timezone(timezone)
          .format("%Y%m%d")
      ),
      format!(
        "DTEND;VALUE=DATE:{}",
        event
          .end
          .with_timezone(timezone)
          .format("%Y%m%d")
      )
    )
  } else {
    (
      format!(
        "DTSTART:{}",
        event.start.format(COMPACT_FORMAT)
      ),
      format!(
        "DTEND:{}",
        event.end.format(COMPACT_FORMAT)
      )
    )
  };

  let mut lines = vec![
    "BEGIN:VEVENT".to_string(),
    format!("UID:{}", event.uid),
    format!("DTSTAMP:{stamp}"),
    start,
    end,
    format!(
      "SUMMARY:{}",
      escape_text(&event.title)
    ),
  ];
  if let Some(color) = &event.calendar_color
  {
    lines.push(format!("COLOR:{color}"));
  }
  lines.push("END:VEVENT".to_string());

  let mut out = lines.join("\r\n");
  out.push_str("\r\n");
  out
}

fn escape_text(raw: &str) -> String {
  raw
    .replace('\\', "\\\\")
    .replace(';', "\\;")
    .replace(',', "\\,")
    .replace('\n', "\\n")
}

fn unescape_text(raw: &str) -> String {
  let mut out =
    String::with_capacity(raw.len());
  let mut chars = raw.chars();
  while let Some(ch) = chars.next() {
    if ch != '\\' {
      out.push(ch);
      continue;
    }
    match chars.next() {
      | Some('n' | 'N') => out.push('\n'),
      | Some(other) => out.push(other),
      | None => out.push('\\')
    }
  }
  out
}

fn find_property<'a>(
  properties: &'a [Property],
  name: &str
) -> Option<&'a Property> {
  properties.iter().find(|property| {
    property.name == name
  })
}

fn property_value(
  properties: &[Property],
  name: &str
) -> Option<String> {
  find_property(properties, name)?
    .value
    .as_ref()
    .map(|value| {
      value.trim().to_string()
    })
}

#[cfg(test)]
mod tests {
  use chrono::{
    Duration,
    NaiveDate,
    TimeZone,
    Utc
  };

  use super::{
    CalendarProvider,
    IcsCalendar,
    parse_ics_duration,
    parse_ics_events
  };
  use crate::model::{
    ItemKind,
    ScheduledItem
  };
  use crate::visible::DateRange;

  const SAMPLE: &str = "BEGIN:VCALENDAR\r
VERSION:2.0\r
BEGIN:VEVENT\r
UID:standup-1\r
SUMMARY:Daily standup\\, team A\r
DTSTART:20260302T153000Z\r
DTEND:20260302T161500Z\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:offsite\r
SUMMARY:Offsite\r
DTSTART;VALUE=DATE:20260303\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:tokyo-call\r
SUMMARY:Tokyo call\r
DTSTART;TZID=Asia/Tokyo:20260303T090000\r
DURATION:PT30M\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:gone\r
SUMMARY:Cancelled thing\r
STATUS:CANCELLED\r
DTSTART:20260302T100000Z\r
END:VEVENT\r
BEGIN:VEVENT\r
SUMMARY:No uid\r
DTSTART:20260302T100000Z\r
END:VEVENT\r
END:VCALENDAR\r
";

  #[test]
  fn parses_timed_all_day_and_zoned_events() {
    let events = parse_ics_events(
      SAMPLE,
      &chrono_tz::UTC,
      Some("#4a90d9")
    )
    .expect("parse");
    assert_eq!(events.len(), 3);

    let standup = &events[0];
    assert_eq!(
      standup.title,
      "Daily standup, team A"
    );
    assert_eq!(
      (standup.end - standup.start)
        .num_minutes(),
      45
    );
    assert_eq!(
      standup.calendar_color.as_deref(),
      Some("#4a90d9")
    );

    let offsite = &events[1];
    assert!(offsite.is_all_day);
    assert_eq!(
      offsite.end - offsite.start,
      Duration::days(1)
    );

    let tokyo = &events[2];
    assert_eq!(
      tokyo.start,
      Utc
        .with_ymd_and_hms(
          2026, 3, 3, 0, 0, 0
        )
        .single()
        .expect("valid start")
    );
    assert_eq!(
      (tokyo.end - tokyo.start)
        .num_minutes(),
      30
    );
  }

  #[test]
  fn event_ids_are_stable_per_uid() {
    let events = parse_ics_events(
      SAMPLE,
      &chrono_tz::UTC,
      None
    )
    .expect("parse");
    let now = Utc::now();
    let first =
      events[0].to_scheduled_item(now);
    let again =
      events[0].to_scheduled_item(now);
    assert_eq!(first.id, again.id);
    assert_ne!(
      first.id,
      events[1].to_scheduled_item(now).id
    );
    assert_eq!(first.kind, ItemKind::Event);
    assert_eq!(first.duration_minutes, 45);
  }

  #[test]
  fn durations_cover_weeks_days_and_times() {
    assert_eq!(
      parse_ics_duration("P1W"),
      Some(Duration::weeks(1))
    );
    assert_eq!(
      parse_ics_duration("PT1H30M"),
      Some(Duration::minutes(90))
    );
    assert_eq!(parse_ics_duration("bogus"), None);
    assert_eq!(
      parse_ics_duration("P999999999999999W"),
      None
    );
    assert_eq!(
      parse_ics_duration(
        "P99999999999999999999D"
      ),
      None
    );
  }

  #[test]
  fn events_with_unusable_durations_are_skipped()
  {
    let text = "BEGIN:VCALENDAR\r
VERSION:2.0\r
BEGIN:VEVENT\r
UID:runaway\r
SUMMARY:Runaway\r
DTSTART:20260302T090000Z\r
DURATION:P999999999999999W\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:past-the-end\r
SUMMARY:Past the end\r
DTSTART:20260302T090000Z\r
DURATION:P99999999D\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:review\r
SUMMARY:Review\r
DTSTART:20260302T100000Z\r
DURATION:PT45M\r
END:VEVENT\r
END:VCALENDAR\r
";
    let events = parse_ics_events(
      text,
      &chrono_tz::UTC,
      None
    )
    .expect("parse");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].uid, "review");
    assert_eq!(
      (events[0].end - events[0].start)
        .num_minutes(),
      45
    );
  }

  #[tokio::test]
  async fn created_events_are_read_back() {
    let dir =
      tempfile::tempdir().expect("tempdir");
    let calendar = IcsCalendar::new(
      dir.path().join("work.ics"),
      chrono_tz::UTC
    );

    let start = Utc
      .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
      .single()
      .expect("valid start");
    let mut item = ScheduledItem::new_task(
      "Plan; review, ship".to_string(),
      start
    );
    item.scheduled_start = Some(start);
    item.duration_minutes = 45;

    let created = calendar
      .create_event(&item)
      .await
      .expect("create");
    calendar
      .create_event(&item)
      .await
      .expect("append second");

    let day = NaiveDate::from_ymd_opt(2026, 3, 2)
      .expect("valid day");
    let range =
      DateRange::day(day, &chrono_tz::UTC)
        .expect("range");
    let events = calendar
      .events_between(&range)
      .await
      .expect("read back");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], created);

    let unscheduled = ScheduledItem::new_task(
      "floating".to_string(),
      start
    );
    assert!(
      calendar
        .create_event(&unscheduled)
        .await
        .is_err()
    );
  }
}
