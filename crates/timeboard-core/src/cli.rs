use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "timeboard",
    version,
    about = "Timeboard: day and week time grids for tasks and calendar events",
    disable_help_subcommand = true,
    infer_subcommands = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "rc-file", global = true)]
    pub rc_file: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Lay out one day (default: today).
    Day {
        /// Date expression: today, tomorrow, +2d, 2026-03-02, ...
        date: Option<String>,
    },

    /// Lay out the week containing DATE.
    Week { date: Option<String> },

    /// Add a task to the store.
    Add {
        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,

        /// Start as a date expression (9:30, tomorrow, 2026-03-02T09:30).
        #[arg(long)]
        start: Option<String>,

        #[arg(long, default_value_t = 30)]
        duration: i64,

        #[arg(long)]
        all_day: bool,

        #[arg(long)]
        color: Option<String>,

        /// Also write the task into this .ics calendar.
        #[arg(long = "to-calendar")]
        to_calendar: Option<PathBuf>,
    },

    /// Drag an item by DELTA_PX pixels along the grid axis.
    Drag {
        /// Full id or unique id prefix.
        id: String,

        #[arg(allow_negative_numbers = true)]
        delta_px: f32,
    },

    /// Show where the current-time line sits.
    Now {
        /// Keep printing on every tick until interrupted.
        #[arg(long)]
        follow: bool,
    },

    /// Reconcile the store with a remote store directory.
    Sync {
        #[arg(long)]
        remote: Option<PathBuf>,
    },

    /// Import the events of an .ics file as items.
    ImportIcs {
        file: PathBuf,

        #[arg(long)]
        color: Option<String>,
    },

    /// Print the effective configuration.
    Config,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` (or `rc.key:value`) overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = if let Some((k, v)) = rest.split_once('=') {
                Some((format!("rc.{k}"), v.to_string()))
            } else if let Some((k, v)) = rest.split_once(':') {
                Some((format!("rc.{k}"), v.to_string()))
            } else {
                None
            };

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::{Command, GlobalCli, preprocess_args};

    fn args(raw: &[&str]) -> Vec<OsString> {
        raw.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&args(&[
            "timeboard",
            "rc.grid.start_hour=8",
            "day",
            "rc.color:off",
        ]))
        .expect("preprocess");

        assert_eq!(pre.cleaned_args, args(&["timeboard", "day"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.grid.start_hour".to_string(), "8".to_string()),
                ("rc.color".to_string(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn drag_accepts_negative_deltas_and_prefixes() {
        let cli = GlobalCli::parse_from(["timeboard", "-vv", "dr", "1a2b", "-37"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.command,
            Some(Command::Drag {
                id: "1a2b".to_string(),
                delta_px: -37.0,
            })
        );
    }

    #[test]
    fn add_collects_title_words() {
        let cli = GlobalCli::parse_from([
            "timeboard",
            "add",
            "--start",
            "9:30",
            "Write",
            "notes",
        ]);
        let Some(Command::Add { title, start, duration, .. }) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(title.join(" "), "Write notes");
        assert_eq!(start.as_deref(), Some("9:30"));
        assert_eq!(duration, 30);
    }
}
