use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::task::{Category, Priority};
use crate::view::ViewFilter;

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
    name = "nudge",
    version,
    about = "Nudge: personal tasks with reminders and undoable deletes"
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

    #[arg(long = "nudgerc", global = true)]
    pub nudgerc: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a task.
    Add(AddArgs),
    /// Change fields of an existing task.
    Edit(EditArgs),
    /// Show tasks through a filter, in display order.
    List {
        #[arg(short, long)]
        filter: Option<ViewFilter>,
    },
    /// Show every field of one task.
    Info { id: String },
    /// Flip a task between open and completed.
    #[command(visible_alias = "done")]
    Toggle { id: String },
    /// Mark a task completed at the end of a focus session.
    FocusDone { id: String },
    /// Delete a task; it can be restored with `undo` for a short while.
    Delete {
        id: String,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Restore the most recently deleted task.
    Undo,
    /// Completion counts.
    Stats,
    /// List pending reminders.
    Reminders,
    /// Show the profile, or create/rename it.
    Profile {
        #[arg(long)]
        name: Option<String>,
    },
    /// Show or set the dark-mode preference.
    Theme { mode: Option<ThemeMode> },
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    #[arg(required = true, num_args = 1..)]
    pub title: Vec<String>,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long)]
    pub due: Option<String>,

    #[arg(short, long)]
    pub priority: Option<Priority>,

    #[arg(short, long)]
    pub category: Option<Category>,

    /// File to attach, or an inline `data:` URL.
    #[arg(long = "attach")]
    pub attach: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long, conflicts_with = "clear_notes")]
    pub notes: Option<String>,

    #[arg(long)]
    pub clear_notes: bool,

    #[arg(long, conflicts_with = "clear_due")]
    pub due: Option<String>,

    #[arg(long)]
    pub clear_due: bool,

    #[arg(short, long)]
    pub priority: Option<Priority>,

    #[arg(short, long, conflicts_with = "clear_category")]
    pub category: Option<Category>,

    #[arg(long)]
    pub clear_category: bool,

    /// File to attach, or an inline `data:` URL.
    #[arg(long = "attach")]
    pub attach: Vec<PathBuf>,

    /// Index of an attachment to remove; applied before `--attach`.
    #[arg(long = "detach")]
    pub detach: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeMode {
    On,
    Off,
    System,
}

impl std::str::FromStr for ThemeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "dark" | "true" => Ok(ThemeMode::On),
            "off" | "light" | "false" => Ok(ThemeMode::Off),
            "system" | "auto" => Ok(ThemeMode::System),
            other => Err(anyhow!("unknown theme mode: {other}")),
        }
    }
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
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` / `rc.key:value` overrides out of the
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
            } else {
                rest.split_once(':')
                    .map(|(k, v)| (format!("rc.{k}"), v.to_string()))
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
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&os(&["nudge", "rc.undo.window:20", "list", "rc.color=off"]))
            .unwrap();
        assert_eq!(pre.cleaned_args, os(&["nudge", "list"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.undo.window".to_string(), "20".to_string()),
                ("rc.color".to_string(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn parses_add_with_options() {
        let cli = GlobalCli::parse_from(os(&[
            "nudge", "add", "pay", "rent", "--due", "tomorrow", "-p", "high", "-c", "personal",
        ]));
        let Some(Command::Add(args)) = cli.command else {
            panic!("expected add command");
        };
        assert_eq!(args.title.join(" "), "pay rent");
        assert_eq!(args.priority, Some(Priority::High));
        assert_eq!(args.category, Some(Category::Personal));
    }

    #[test]
    fn done_is_an_alias_for_toggle() {
        let cli = GlobalCli::parse_from(os(&["nudge", "done", "ab12"]));
        assert!(matches!(cli.command, Some(Command::Toggle { id }) if id == "ab12"));
    }
}
