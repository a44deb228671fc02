use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use chrono::Weekday;
use chrono_tz::Tz;
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::drag::DragConfig;
use crate::geometry::{
  Axis,
  TimeGrid,
  TimeWindow
};
use crate::visible::parse_week_start;

const RC_ENV_VAR: &str = "TIMEBOARDRC";
const RC_FILE_NAME: &str = ".timeboardrc";

const DEFAULTS: &[(&str, &str)] = &[
  ("data.location", "~/.timeboard"),
  ("grid.start_hour", "6"),
  ("grid.end_hour", "22"),
  ("grid.pixels_per_hour", "60"),
  ("grid.min_block_extent", "20"),
  ("grid.axis", "vertical"),
  ("drag.slot_minutes", "15"),
  ("drag.long_press_ms", "300"),
  ("sync.debounce_ms", "2000"),
  ("now.tick_secs", "60"),
  ("calendar.week_start", "monday"),
  ("color", "on")
];

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    Self {
      map:          DEFAULTS
        .iter()
        .map(|(k, v)| {
          (k.to_string(), v.to_string())
        })
        .collect(),
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    let rc = resolve_rc_path(rc_override)?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading timeboardrc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no timeboardrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  /// Parses `key`, naming the key and the
  /// bad value on failure.
  pub fn get_parsed<T>(
    &self,
    key: &str
  ) -> anyhow::Result<T>
  where
    T: FromStr,
    T::Err: std::fmt::Display
  {
    let raw = self.map.get(key).ok_or_else(
      || anyhow!("missing config key {key}")
    )?;
    raw.trim().parse::<T>().map_err(|err| {
      anyhow!(
        "invalid value for {key}: \
         {raw:?} ({err})"
      )
    })
  }

  /// Sorted, so listings are stable.
  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    let mut entries =
      self.map.iter().collect::<Vec<_>>();
    entries.sort();
    entries.into_iter()
  }

  pub fn time_window(
    &self
  ) -> anyhow::Result<TimeWindow> {
    TimeWindow::new(
      self.get_parsed("grid.start_hour")?,
      self.get_parsed("grid.end_hour")?,
      self.get_parsed(
        "grid.pixels_per_hour"
      )?
    )
    .context("invalid grid configuration")
  }

  pub fn axis(&self) -> anyhow::Result<Axis> {
    let raw = self
      .get("grid.axis")
      .unwrap_or_default();
    Axis::from_key(&raw).ok_or_else(|| {
      anyhow!(
        "invalid value for grid.axis: \
         {raw:?} (expected vertical or \
         horizontal)"
      )
    })
  }

  pub fn time_grid(
    &self,
    timezone: Tz
  ) -> anyhow::Result<TimeGrid> {
    let min_extent: f32 = self
      .get_parsed("grid.min_block_extent")?;
    if !min_extent.is_finite() {
      return Err(anyhow!(
        "grid.min_block_extent must be \
         finite"
      ));
    }
    Ok(
      TimeGrid::new(
        self.time_window()?,
        timezone
      )
      .with_minimum_block_extent(min_extent)
      .with_axis(self.axis()?)
    )
  }

  pub fn drag_config(
    &self
  ) -> anyhow::Result<DragConfig> {
    DragConfig::for_window(
      &self.time_window()?,
      self.get_parsed("drag.slot_minutes")?,
      Duration::from_millis(
        self.get_parsed(
          "drag.long_press_ms"
        )?
      )
    )
  }

  pub fn debounce(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(
      self.get_parsed("sync.debounce_ms")?
    ))
  }

  pub fn tick(
    &self
  ) -> anyhow::Result<Duration> {
    let secs: u64 =
      self.get_parsed("now.tick_secs")?;
    if secs == 0 {
      return Err(anyhow!(
        "now.tick_secs must be positive"
      ));
    }
    Ok(Duration::from_secs(secs))
  }

  pub fn week_start(
    &self
  ) -> anyhow::Result<Weekday> {
    let raw = self
      .get("calendar.week_start")
      .unwrap_or_default();
    parse_week_start(&raw).ok_or_else(|| {
      anyhow!(
        "invalid value for \
         calendar.week_start: {raw:?}"
      )
    })
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let mut line = raw_line.trim();
      if let Some((before, _)) =
        line.split_once('#')
      {
        line = before.trim();
      }
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV_VAR)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(rc_env)));
  }

  let Some(home) = dirs::home_dir() else {
    warn!(
      "cannot determine home directory; \
       skipping timeboardrc"
    );
    return Ok(None);
  };
  let candidate = home.join(RC_FILE_NAME);
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".timeboard"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

pub fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}
