mod agents;
mod cli;
mod config;
mod error;
mod repository;
mod utils;
mod workflow;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use config::{UpdateMode, UpdateSpeed, UpdaterConfig};
use error::UpdaterError;
use std::io::IsTerminal;
use std::process;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset: this crate's events plus captured build output.
fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!(
        "{}={level},build={level}",
        env!("CARGO_CRATE_NAME")
    ))
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .without_time();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let speed = if cli.fast {
        UpdateSpeed::Fast
    } else {
        UpdateSpeed::Normal
    };
    let fetch_timeout = cli.fetch_timeout.map(Duration::from_secs);

    let result = UpdaterConfig::load(&cli.directory, speed, fetch_timeout).and_then(|config| {
        match cli.command {
            Commands::Autostarted => workflow::execute_mode(&config, UpdateMode::Autostarted),
            Commands::GetStatus => workflow::execute_mode(&config, UpdateMode::GetStatus),
            Commands::SetStatus => workflow::execute_mode(&config, UpdateMode::SetStatus),
            Commands::Gui => workflow::execute_mode(&config, UpdateMode::Gui),
            Commands::GuiYes => workflow::execute_mode(&config, UpdateMode::GuiYes),
            Commands::Cli => workflow::execute_mode(&config, UpdateMode::Cli),
            Commands::CliYes => workflow::execute_mode(&config, UpdateMode::CliYes),
            Commands::Rollback { backup } => workflow::execute_rollback(&config, backup),
        }
    });

    match result {
        Ok(()) => {}
        Err(UpdaterError::NoUpdatesAvailable) => {
            // a negative status answer, not a failure
            println!("{}", UpdaterError::NoUpdatesAvailable);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn default_filter_covers_this_crate() {
        let subscriber = tracing_subscriber::registry().with(default_filter(false));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(
                target: concat!(env!("CARGO_CRATE_NAME"), "::workflow"),
                Level::WARN
            ));
            assert!(tracing::enabled!(
                target: concat!(env!("CARGO_CRATE_NAME"), "::agents::mirror"),
                Level::INFO
            ));
            assert!(!tracing::enabled!(
                target: concat!(env!("CARGO_CRATE_NAME"), "::agents::lock"),
                Level::DEBUG
            ));
            assert!(!tracing::enabled!(target: "hyper::proto", Level::INFO));
        });
    }

    #[test]
    fn verbose_filter_enables_debug_and_build_output() {
        let subscriber = tracing_subscriber::registry().with(default_filter(true));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(
                target: concat!(env!("CARGO_CRATE_NAME"), "::agents::backup"),
                Level::DEBUG
            ));
            assert!(tracing::enabled!(target: "build", Level::DEBUG));
        });
    }
}
