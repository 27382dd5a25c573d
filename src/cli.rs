use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "updater",
    about = "Catalog updater - keeps an application catalog in sync with its upstream repository",
    version,
    author
)]
pub struct Cli {
    /// Path to the distribution root (defaults to $DIRECTORY, then the current directory)
    #[arg(short, long, env = "DIRECTORY", default_value = ".", global = true)]
    pub directory: PathBuf,

    /// Reuse the existing mirror and cached results (faster, may be outdated)
    #[arg(long, global = true)]
    pub fast: bool,

    /// Give up fetching the upstream repository after this many seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub fetch_timeout: Option<u64>,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check for updates on boot, apply safe ones and report the rest
    Autostarted,

    /// Exit 0 if updates are available according to the last check, 1 otherwise
    GetStatus,

    /// Check for updates, save the results, then behave like get-status
    SetStatus,

    /// Graphical mode (summary only; applies all updates)
    Gui,

    /// Graphical mode, confirming all updates automatically
    GuiYes,

    /// Interactive command-line updater
    Cli,

    /// Apply all available updates without asking
    CliYes,

    /// Restore the distribution root from a backup snapshot
    Rollback {
        /// Snapshot directory to restore (defaults to the most recent one)
        #[arg(long, value_name = "DIR")]
        backup: Option<PathBuf>,
    },
}
