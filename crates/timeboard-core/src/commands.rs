use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument, warn};

use crate::calendar::{CalendarProvider, IcsCalendar};
use crate::cli::Command;
use crate::config::{Config, expand_tilde};
use crate::datastore::DataStore;
use crate::datetime::{parse_date_arg, parse_date_expr, project_timezone, to_project_date};
use crate::drag::{DragOutcome, DragTranslator};
use crate::layout::{layout_day, layout_week};
use crate::model::{MAX_DURATION_MINUTES, ScheduledItem};
use crate::now::{NowIndicator, SystemClock};
use crate::render::Renderer;
use crate::sync::{SyncConfig, SyncCoordinator, SyncOutcome, SyncPhase, SyncStatus};

#[instrument(skip(store, cfg, renderer, command))]
pub fn dispatch(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Command,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let tz = *project_timezone();
    debug!(?command, %tz, "dispatching command");

    match command {
        Command::Day { date } => cmd_day(store, cfg, renderer, date.as_deref(), now, tz),
        Command::Week { date } => cmd_week(store, cfg, renderer, date.as_deref(), now, tz),
        Command::Add {
            title,
            start,
            duration,
            all_day,
            color,
            to_calendar,
        } => {
            let mut item = ScheduledItem::new_task(title.join(" "), now);
            item.scheduled_start = start
                .as_deref()
                .map(|expr| parse_date_expr(expr, now))
                .transpose()
                .context("invalid --start")?;
            item.duration_minutes = duration;
            item.is_all_day = all_day;
            item.calendar_color = color;
            cmd_add(store, cfg, renderer, item, to_calendar.as_deref(), now, tz)
        }
        Command::Drag { id, delta_px } => cmd_drag(store, cfg, renderer, &id, delta_px, now, tz),
        Command::Now { follow } => cmd_now(cfg, renderer, follow, now, tz),
        Command::Sync { remote } => {
            let remote = remote
                .or_else(|| cfg.get("sync.remote").map(|raw| expand_tilde(Path::new(&raw))))
                .ok_or_else(|| anyhow!("no remote given; pass --remote DIR or set sync.remote"))?;
            cmd_sync(store, cfg, renderer, &remote)
        }
        Command::ImportIcs { file, color } => {
            cmd_import_ics(store, cfg, renderer, &file, color, now, tz)
        }
        Command::Config => renderer.print_config(cfg),
    }
}

#[instrument(skip(store, cfg, renderer, now, tz))]
fn cmd_day(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    date: Option<&str>,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    let date = parse_date_arg(date, now)?;
    let grid = cfg.time_grid(tz)?;
    let items = store.load_items()?;
    let layout = layout_day(&items, date, &grid)?;

    let now_offset = if date == to_project_date(now) {
        NowIndicator::new(grid).offset_at(now)
    } else {
        None
    };

    renderer.print_day(&layout, &items, &grid, now_offset)
}

#[instrument(skip(store, cfg, renderer, now, tz))]
fn cmd_week(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    date: Option<&str>,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    let date = parse_date_arg(date, now)?;
    let grid = cfg.time_grid(tz)?;
    let items = store.load_items()?;
    let week = layout_week(&items, date, &grid, cfg.week_start()?)?;
    renderer.print_week(&week, &items, &grid)
}

#[instrument(skip(store, cfg, renderer, item, now, tz), fields(id = %item.id))]
fn cmd_add(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
    item: ScheduledItem,
    to_calendar: Option<&Path>,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    if item.duration_minutes < 0 {
        bail!("duration cannot be negative: {}", item.duration_minutes);
    }
    if item.duration_minutes > MAX_DURATION_MINUTES {
        bail!(
            "duration of {} minutes exceeds the {MAX_DURATION_MINUTES}-minute limit",
            item.duration_minutes
        );
    }

    let item = store.add_item(item, now)?;
    info!(title = %item.title, "added item");
    renderer.print_item(&item, &tz)?;

    if let Some(path) = to_calendar {
        let calendar = IcsCalendar::new(path, tz);
        let event = runtime()?
            .block_on(calendar.create_event(&item))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(uid = %event.uid, calendar = %path.display(), "synced item to calendar");
    }

    sync_after_change(store, cfg, renderer)
}

#[instrument(skip(store, cfg, renderer, now, tz))]
fn cmd_drag(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
    id: &str,
    delta_px: f32,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    let item = store.find_item(id)?;
    let config = cfg.drag_config()?;
    let mut translator = DragTranslator::new(config);

    // Replays a complete gesture: press, long-press hold, move, release.
    let pressed_at = Instant::now();
    if !translator.press(&item, pressed_at) {
        bail!("item {} has no start time or is all-day; it cannot be dragged", item.id);
    }
    translator.hold(pressed_at + config.long_press);
    let preview = translator.pointer_translated(delta_px);
    debug!(?preview, slots = translator.slots_moved(), "drag preview");

    let mut saved = None;
    let outcome = translator.release(|intent| {
        saved = Some(store.reschedule(intent.item_id, intent.new_start, now));
    });

    match outcome {
        DragOutcome::Committed(intent) => {
            let updated = saved
                .transpose()?
                .ok_or_else(|| anyhow!("drag committed without saving {}", intent.item_id))?;
            info!(slots = intent.slots_moved, "item rescheduled");
            renderer.print_item(&updated, &tz)?;
            sync_after_change(store, cfg, renderer)
        }
        DragOutcome::Cancelled | DragOutcome::Ignored => renderer.print_notice(&format!(
            "no valid target at least one {}-minute slot away; nothing changed",
            config.slot_interval_minutes
        )),
    }
}

#[instrument(skip(cfg, renderer, now, tz))]
fn cmd_now(
    cfg: &Config,
    renderer: &mut Renderer,
    follow: bool,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    let indicator = NowIndicator::new(cfg.time_grid(tz)?);
    renderer.print_now(now, &tz, indicator.offset_at(now))?;
    if !follow {
        return Ok(());
    }

    let tick = cfg.tick()?;
    runtime()?.block_on(async {
        let handle = indicator.spawn(Arc::new(SystemClock), tick);
        let mut offsets = handle.subscribe();
        while offsets.changed().await.is_ok() {
            let offset = *offsets.borrow_and_update();
            renderer.print_now(Utc::now(), &tz, offset)?;
        }
        Ok::<(), anyhow::Error>(())
    })
}

#[instrument(skip(store, cfg, renderer), fields(remote = %remote.display()))]
fn cmd_sync(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
    remote: &Path,
) -> anyhow::Result<()> {
    let coordinator = coordinator_for(store, cfg, remote)?;
    let outcome = runtime()?.block_on(coordinator.sync_now());
    match outcome {
        SyncOutcome::Completed(report) => renderer.print_sync_report(&report),
        SyncOutcome::AlreadyRunning => renderer.print_notice("a sync is already running"),
        SyncOutcome::Failed(message) => Err(anyhow!("sync failed: {message}")),
    }
}

#[instrument(skip(store, cfg, renderer, color, now, tz), fields(file = %file.display()))]
fn cmd_import_ics(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
    file: &Path,
    color: Option<String>,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<()> {
    if !file.exists() {
        bail!("calendar file not found: {}", file.display());
    }
    let mut calendar = IcsCalendar::new(file, tz);
    if let Some(color) = color {
        calendar = calendar.with_color(color);
    }

    let events = calendar.load_events()?;
    let items = events
        .iter()
        .map(|event| event.to_scheduled_item(now))
        .collect::<Vec<_>>();
    let summary = store.import_items(items, now)?;
    renderer.print_import_summary(&summary)?;

    if summary.created + summary.updated > 0 {
        sync_after_change(store, cfg, renderer)?;
    }
    Ok(())
}

/// After a local change, pushes it through the debounced coordinator when
/// `sync.remote` is configured, and waits for that pass to settle.
fn sync_after_change(
    store: &Arc<DataStore>,
    cfg: &Config,
    renderer: &mut Renderer,
) -> anyhow::Result<()> {
    let Some(remote) = cfg.get("sync.remote") else {
        return Ok(());
    };
    let remote = expand_tilde(Path::new(&remote));
    let coordinator = coordinator_for(store, cfg, &remote)?;

    let status = runtime()?.block_on(async {
        let mut status = coordinator.status();
        coordinator.queue_sync();
        wait_until_settled(&mut status).await
    })?;

    match (status.last_error, status.last_report) {
        (Some(message), _) => {
            warn!(error = %message, "background sync failed");
            renderer.print_notice(&format!("sync failed: {message}"))
        }
        (None, Some(report)) => renderer.print_sync_report(&report),
        (None, None) => Ok(()),
    }
}

async fn wait_until_settled(
    status: &mut tokio::sync::watch::Receiver<SyncStatus>,
) -> anyhow::Result<SyncStatus> {
    loop {
        status
            .changed()
            .await
            .context("sync coordinator stopped")?;
        let current = status.borrow_and_update().clone();
        if current.phase == SyncPhase::Idle {
            return Ok(current);
        }
    }
}

fn coordinator_for(
    store: &Arc<DataStore>,
    cfg: &Config,
    remote: &Path,
) -> anyhow::Result<SyncCoordinator> {
    if remote == store.data_dir.as_path() {
        bail!("remote {} is the local data directory", remote.display());
    }
    let remote = DataStore::open(remote)
        .with_context(|| format!("failed to open remote store at {}", remote.display()))?;
    Ok(SyncCoordinator::new(
        store.clone(),
        Arc::new(remote),
        SyncConfig {
            debounce: cfg.debounce()?,
            ..SyncConfig::default()
        },
    ))
}

fn runtime() -> anyhow::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::cmd_add;
    use crate::config::Config;
    use crate::datastore::DataStore;
    use crate::model::{MAX_DURATION_MINUTES, ScheduledItem};
    use crate::render::Renderer;

    #[test]
    fn add_rejects_out_of_range_durations() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(DataStore::open(temp.path()).expect("open datastore"));
        let cfg = Config::default();
        let mut renderer = Renderer::new(&cfg).expect("renderer");
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid now");

        for duration in [-5, MAX_DURATION_MINUTES + 1, 999_999_999_999_999] {
            let mut item = ScheduledItem::new_task("Runaway".to_string(), now);
            item.scheduled_start = Some(now);
            item.duration_minutes = duration;
            let err = cmd_add(&store, &cfg, &mut renderer, item, None, now, chrono_tz::UTC)
                .expect_err("duration should be rejected");
            assert!(format!("{err:#}").contains("duration"), "{err:#}");
        }
        assert!(store.load_items().expect("load").is_empty());
    }
}
