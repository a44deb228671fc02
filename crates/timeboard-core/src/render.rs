use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use unicode_width::UnicodeWidthStr;
use uuid::Uuid;

use crate::config::Config;
use crate::datastore::ImportSummary;
use crate::geometry::TimeGrid;
use crate::layout::DayLayout;
use crate::model::{ItemKind, ScheduledItem};
use crate::sync::SyncReport;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, layout, items, grid), fields(date = %layout.date))]
    pub fn print_day(
        &mut self,
        layout: &DayLayout<'_>,
        items: &[ScheduledItem],
        grid: &TimeGrid,
        now_offset: Option<f32>,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_day(&mut out, layout, items, grid, now_offset)
    }

    #[tracing::instrument(skip(self, week, items, grid))]
    pub fn print_week(
        &mut self,
        week: &[DayLayout<'_>],
        items: &[ScheduledItem],
        grid: &TimeGrid,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        let headers = vec![
            "Day".to_string(),
            "Blocks".to_string(),
            "Overlaps".to_string(),
            "All-day".to_string(),
        ];
        let rows = week
            .iter()
            .map(|day| {
                let overlaps = day.slots.iter().filter(|slot| slot.stack_depth > 1).count();
                vec![
                    self.paint(&day.date.format("%a %Y-%m-%d").to_string(), "1"),
                    day.slots.len().to_string(),
                    overlaps.to_string(),
                    day.all_day.len().to_string(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;

        for day in week.iter().filter(|day| !day.slots.is_empty() || !day.all_day.is_empty()) {
            writeln!(out)?;
            self.write_day(&mut out, day, items, grid, None)?;
        }
        Ok(())
    }

    pub fn print_item(&mut self, item: &ScheduledItem, tz: &Tz) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let start = item
            .scheduled_start
            .map(|start| start.with_timezone(tz).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        writeln!(out, "id        {}", item.id)?;
        writeln!(out, "title     {}", item.title)?;
        writeln!(out, "kind      {}", kind_label(item.kind))?;
        writeln!(out, "start     {start}")?;
        writeln!(out, "duration  {}m", item.effective_duration_minutes())?;
        writeln!(out, "all-day   {}", if item.is_all_day { "yes" } else { "no" })?;
        writeln!(out, "updated   {}", item.updated_at.format("%Y%m%dT%H%M%SZ"))?;
        Ok(())
    }

    pub fn print_now(
        &mut self,
        now: DateTime<Utc>,
        tz: &Tz,
        offset: Option<f32>,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let local = now.with_timezone(tz).format("%Y-%m-%d %H:%M");
        match offset {
            Some(offset) => writeln!(out, "{local}  {} {offset:.1}", self.paint("now", "31"))?,
            None => writeln!(out, "{local}  outside the grid")?,
        }
        Ok(())
    }

    pub fn print_sync_report(&mut self, report: &SyncReport) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = vec![
            "Collection".to_string(),
            "Created".to_string(),
            "Overwritten".to_string(),
            "Uploaded".to_string(),
        ];
        let rows = report
            .collections
            .iter()
            .map(|collection| {
                vec![
                    collection.kind.to_string(),
                    collection.created_local.to_string(),
                    collection.overwritten_local.to_string(),
                    collection.uploaded.to_string(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        if report.total_writes() == 0 {
            writeln!(out, "already in sync")?;
        }
        Ok(())
    }

    pub fn print_import_summary(&mut self, summary: &ImportSummary) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "created {}, updated {}, unchanged {}",
            summary.created, summary.updated, summary.unchanged
        )?;
        Ok(())
    }

    /// One-line status for commands that end without changing anything.
    pub fn print_notice(&mut self, message: &str) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_notice(&mut out, message)
    }

    pub fn print_config(&mut self, cfg: &Config) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = vec!["Key".to_string(), "Value".to_string()];
        let rows = cfg
            .iter()
            .map(|(key, value)| vec![key.clone(), value.clone()])
            .collect();
        write_table(&mut out, headers, rows)?;
        for file in &cfg.loaded_files {
            writeln!(out, "loaded {}", file.display())?;
        }
        Ok(())
    }

    fn write_notice<W: Write>(&self, out: &mut W, message: &str) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(message, "33"))?;
        Ok(())
    }

    fn write_day<W: Write>(
        &self,
        mut out: W,
        layout: &DayLayout<'_>,
        items: &[ScheduledItem],
        grid: &TimeGrid,
        now_offset: Option<f32>,
    ) -> anyhow::Result<()> {
        let by_id: HashMap<Uuid, &ScheduledItem> =
            items.iter().map(|item| (item.id, item)).collect();

        writeln!(out, "{}", self.paint(&layout.date.format("%A %Y-%m-%d").to_string(), "1"))?;
        for item in &layout.all_day {
            writeln!(out, "  all day  {}", self.paint_item_title(item))?;
        }

        let headers = vec![
            "Time".to_string(),
            "Offset".to_string(),
            "Extent".to_string(),
            "Lane".to_string(),
            "Id".to_string(),
            "Title".to_string(),
        ];

        let mut rows = Vec::with_capacity(layout.slots.len() + 1);
        let mut now_pending = now_offset;
        for slot in &layout.slots {
            if let Some(offset) = now_pending
                && offset <= slot.offset
            {
                rows.push(self.now_row(offset));
                now_pending = None;
            }

            let Some(item) = by_id.get(&slot.item_id) else {
                continue;
            };
            let time = match (item.scheduled_start, item.scheduled_end()) {
                (Some(start), Some(end)) => format!(
                    "{}-{}",
                    start.with_timezone(&grid.timezone).format("%H:%M"),
                    end.with_timezone(&grid.timezone).format("%H:%M")
                ),
                _ => "-".to_string(),
            };
            let lane = if slot.stack_depth > 1 {
                self.paint(&format!("{}/{}", slot.stack_index + 1, slot.stack_depth), "33")
            } else {
                "-".to_string()
            };

            rows.push(vec![
                time,
                format!("{:.1}", slot.offset),
                format!("{:.1}", slot.extent),
                lane,
                short_id(&item.id),
                self.paint_item_title(item),
            ]);
        }
        if let Some(offset) = now_pending {
            rows.push(self.now_row(offset));
        }

        if rows.is_empty() {
            writeln!(out, "  nothing scheduled")?;
            return Ok(());
        }
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    fn now_row(&self, offset: f32) -> Vec<String> {
        vec![
            self.paint("now", "31"),
            format!("{offset:.1}"),
            String::new(),
            String::new(),
            String::new(),
            self.paint("────", "31"),
        ]
    }

    fn paint_item_title(&self, item: &ScheduledItem) -> String {
        match item.kind {
            ItemKind::Event => self.paint(&item.title, "36"),
            ItemKind::Task => item.title.clone(),
        }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn kind_label(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Task => "task",
        ItemKind::Event => "event",
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
