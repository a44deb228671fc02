use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  TimeZone,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "timeboard-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "TIMEBOARD_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "TIMEBOARD_TIME_CONFIG";
const DEFAULT_PROJECT_TIMEZONE: &str =
  "America/Mexico_City";

pub const COMPACT_FORMAT: &str =
  "%Y%m%dT%H%M%SZ";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Timezone the grid reads wall-clock
/// hours in, resolved once per process.
pub fn project_timezone() -> &'static Tz
{
  static PROJECT_TZ: OnceLock<Tz> =
    OnceLock::new();
  PROJECT_TZ.get_or_init(
    resolve_project_timezone
  )
}

#[must_use]
pub fn to_project_date(
  dt: DateTime<Utc>
) -> NaiveDate {
  dt.with_timezone(project_timezone())
    .date_naive()
}

fn resolve_project_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  parse_timezone(
    DEFAULT_PROJECT_TIMEZONE,
    "DEFAULT_PROJECT_TIMEZONE"
  )
  .unwrap_or_else(|| {
    tracing::error!(
      "failed to parse fallback \
       timezone; using UTC"
    );
    chrono_tz::UTC
  })
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &Path
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let Some(timezone) =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    })
  else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

/// Parses an IANA timezone id, logging
/// the source on failure.
pub fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "resolved timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Maps a local wall-clock time onto
/// UTC, taking the earlier instant when
/// a DST fold makes it ambiguous.
pub fn local_to_utc(
  tz: &Tz,
  local_naive: NaiveDateTime
) -> anyhow::Result<DateTime<Utc>> {
  match tz
    .from_local_datetime(&local_naive)
  {
    | LocalResult::Single(local_dt) => {
      Ok(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      Ok(first.min(second).with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "local datetime {local_naive} \
         does not exist in {tz}"
      ))
    }
  }
}

/// UTC instant of local midnight on
/// `date`. DST gaps at midnight move
/// forward an hour.
pub fn local_midnight(
  tz: &Tz,
  date: NaiveDate
) -> anyhow::Result<DateTime<Utc>> {
  let midnight = date
    .and_hms_opt(0, 0, 0)
    .ok_or_else(|| {
      anyhow!(
        "failed to construct midnight \
         for {date}"
      )
    })?;
  local_to_utc(tz, midnight).or_else(
    |_| {
      local_to_utc(
        tz,
        midnight + Duration::hours(1)
      )
    }
  )
}

#[tracing::instrument(skip(now), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  now: DateTime<Utc>
) -> anyhow::Result<DateTime<Utc>> {
  let tz = project_timezone();
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  let today = || {
    local_midnight(
      tz,
      now.with_timezone(tz).date_naive()
    )
  };

  match lower.as_str() {
    | "now" => return Ok(now),
    | "today" => return today(),
    | "tomorrow" => {
      return Ok(
        today()? + Duration::days(1)
      );
    }
    | "yesterday" => {
      return Ok(
        today()? - Duration::days(1)
      );
    }
    | _ => {}
  }

  if let Some(duration) =
    parse_relative(token)?
  {
    return now
      .checked_add_signed(duration)
      .ok_or_else(|| {
        anyhow!(
          "relative offset out of range: \
           {input}"
        )
      });
  }

  if let Some((hour, minute)) =
    parse_clock_time(token)
  {
    let local_now = now.with_timezone(tz);
    let mut day = local_now.date_naive();
    let candidate = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct clock \
           time candidate"
        )
      })?;
    if candidate
      <= local_now.naive_local()
    {
      day = day
        .succ_opt()
        .ok_or_else(|| {
          anyhow!(
            "failed to advance to \
             next day"
          )
        })?;
    }
    let next = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct next \
           clock time candidate"
        )
      })?;
    return local_to_utc(tz, next);
  }

  if let Ok(ndt) =
    NaiveDateTime::parse_from_str(
      token,
      COMPACT_FORMAT
    )
  {
    return Ok(ndt.and_utc());
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(dt.with_timezone(&Utc));
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return local_midnight(tz, date);
  }

  for fmt in
    ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
  {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return local_to_utc(tz, ndt);
    }
  }

  Err(anyhow!(
    "unrecognized date expression: \
     {input}"
  ))
  .context(
    "supported formats: \
     now/today/tomorrow/yesterday, \
     clock times (e.g. 3:15pm or \
     09:30), +Nd/+Nh/+Nm, RFC3339, \
     YYYY-MM-DD, YYYY-MM-DDTHH:MM, \
     YYYY-MM-DD HH:MM, YYYYMMDDTHHMMSSZ"
  )
}

/// Parses a date expression and keeps
/// only the local calendar day.
pub fn parse_date_arg(
  input: Option<&str>,
  now: DateTime<Utc>
) -> anyhow::Result<NaiveDate> {
  match input {
    | Some(raw) => {
      Ok(to_project_date(
        parse_date_expr(raw, now)?
      ))
    }
    | None => Ok(to_project_date(now))
  }
}

fn parse_relative(
  token: &str
) -> anyhow::Result<Option<Duration>> {
  let rel_re = Regex::new(
    r"^(?P<sign>[+-])(?P<num>\d+)(?P<unit>[dhm])$"
  )
  .map_err(|e| {
    anyhow!(
      "internal regex compile \
       failure: {e}"
    )
  })?;

  let Some(caps) = rel_re.captures(token)
  else {
    return Ok(None);
  };

  let num: i64 = caps["num"]
    .parse()
    .context("invalid relative number")?;
  let duration = match &caps["unit"] {
    | "d" => Duration::try_days(num),
    | "h" => Duration::try_hours(num),
    | _ => Duration::try_minutes(num)
  }
  .ok_or_else(|| {
    anyhow!(
      "relative offset out of range: \
       {token}"
    )
  })?;

  Ok(Some(
    if &caps["sign"] == "-" {
      -duration
    } else {
      duration
    }
  ))
}

fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let clock_re = Regex::new(
    r"(?i)^(?P<hour>\d{1,2}):(?P<minute>\d{2})\s*(?P<ampm>[ap]m)?$",
  )
  .ok()?;
  let captures =
    clock_re.captures(token.trim())?;

  let raw_hour = captures["hour"]
    .parse::<u32>()
    .ok()?;
  let minute = captures["minute"]
    .parse::<u32>()
    .ok()?;
  if minute > 59 {
    return None;
  }

  let hour = match captures
    .name("ampm")
    .map(|m| m.as_str().to_ascii_lowercase())
  {
    | Some(ampm) => {
      if raw_hour == 0 || raw_hour > 12 {
        return None;
      }
      match (ampm.as_str(), raw_hour) {
        | ("am", 12) => 0,
        | ("am", h) => h,
        | ("pm", 12) => 12,
        | (_, h) => h + 12
      }
    }
    | None if raw_hour > 23 => {
      return None;
    }
    | None => raw_hour
  };

  Some((hour, minute))
}

#[cfg(test)]
mod tests {
  use chrono::{
    Duration,
    TimeZone,
    Timelike,
    Utc
  };

  use super::{
    local_midnight,
    parse_date_expr,
    project_timezone
  };

  #[test]
  fn oversized_relative_offsets_are_errors() {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 17, 12, 0, 0
      )
      .single()
      .expect("valid now");
    for raw in [
      "+999999999999999d",
      "-999999999999999h",
      "+9999999999d"
    ] {
      let err = parse_date_expr(raw, now)
        .expect_err("offset should overflow");
      assert!(
        format!("{err:#}")
          .contains("out of range"),
        "{err:#}"
      );
    }
  }

  #[test]
  fn parses_relative_offsets() {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 17, 12, 0, 0
      )
      .single()
      .expect("valid now");
    assert_eq!(
      parse_date_expr("+2h", now)
        .expect("parse +2h"),
      now + Duration::hours(2)
    );
    assert_eq!(
      parse_date_expr("-15m", now)
        .expect("parse -15m"),
      now - Duration::minutes(15)
    );
  }

  #[test]
  fn parses_clock_time_in_project_zone()
  {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 17, 23, 0, 0
      )
      .single()
      .expect("valid now");
    let parsed =
      parse_date_expr("3:15pm", now)
        .expect("parse clock time");
    let local = parsed
      .with_timezone(project_timezone());
    assert_eq!(local.hour(), 15);
    assert_eq!(local.minute(), 15);
    assert!(parsed > now);
  }

  #[test]
  fn parses_compact_utc() {
    let now = Utc::now();
    let parsed = parse_date_expr(
      "20260301T093000Z",
      now
    )
    .expect("parse compact");
    assert_eq!(
      parsed,
      Utc
        .with_ymd_and_hms(
          2026, 3, 1, 9, 30, 0
        )
        .single()
        .expect("valid")
    );
  }

  #[test]
  fn rejects_garbage() {
    assert!(
      parse_date_expr(
        "next fortnight",
        Utc::now()
      )
      .is_err()
    );
  }

  #[test]
  fn midnight_in_utc_zone_is_exact() {
    let date =
      chrono::NaiveDate::from_ymd_opt(
        2026, 3, 8
      )
      .expect("valid date");
    let midnight =
      local_midnight(&chrono_tz::UTC, date)
        .expect("midnight");
    assert_eq!(
      midnight,
      Utc
        .with_ymd_and_hms(
          2026, 3, 8, 0, 0, 0
        )
        .single()
        .expect("valid")
    );
  }
}

pub mod compact_date_serde {
  use chrono::{
    DateTime,
    NaiveDateTime,
    Utc
  };
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  use super::COMPACT_FORMAT;

  pub fn serialize<S>(
    dt: &DateTime<Utc>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.serialize_str(
      &dt.format(COMPACT_FORMAT).to_string()
    )
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<DateTime<Utc>, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    NaiveDateTime::parse_from_str(
      &raw,
      COMPACT_FORMAT
    )
    .map(|ndt| ndt.and_utc())
    .map_err(serde::de::Error::custom)
  }

  pub mod option {
    use chrono::{
      DateTime,
      NaiveDateTime,
      Utc
    };
    use serde::{
      Deserialize,
      Deserializer,
      Serializer
    };

    pub fn serialize<S>(
      dt: &Option<DateTime<Utc>>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match dt {
        | Some(value) => {
          super::serialize(
            value, serializer
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }

    pub fn deserialize<'de, D>(
      deserializer: D
    ) -> Result<
      Option<DateTime<Utc>>,
      D::Error
    >
    where
      D: Deserializer<'de>
    {
      let opt =
        Option::<String>::deserialize(
          deserializer
        )?;
      match opt {
        | Some(raw) => {
          NaiveDateTime::parse_from_str(
            &raw,
            super::super::COMPACT_FORMAT
          )
          .map(|ndt| Some(ndt.and_utc()))
          .map_err(
            serde::de::Error::custom
          )
        }
        | None => Ok(None)
      }
    }
  }
}
