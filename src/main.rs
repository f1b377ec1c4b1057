//! Pushrelay CLI - runs a relay node or a debugging push client.
//!
//! This is the main binary entry point. See the `pushrelay` library for the
//! core functionality.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use pushrelay::commands::{self, listen::ListenOptions};
use pushrelay::constants::VERSION;
use pushrelay::RelayConfig;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "pushrelay")]
#[command(version = VERSION)]
#[command(about = "Sharded push-notification relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node
    Serve {
        /// JSON configuration file (default: ./config.json if present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log verbosity 0-10 (0 = errors only, 10 = trace); RUST_LOG wins
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=10))]
        logging: Option<u8>,
    },
    /// Connect to a relay and print notifications
    Listen {
        /// Push endpoint, e.g. ws://localhost:8080/
        #[arg(long)]
        url: String,
        /// UAID to resume
        #[arg(long)]
        uaid: Option<String>,
        /// Channel to register (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// Print the effective configuration
    Config {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Map the numeric `--logging` level onto a filter.
fn level_filter(logging: Option<u8>) -> &'static str {
    match logging {
        None => "info",
        Some(0) => "error",
        Some(1..=2) => "warn",
        Some(3..=5) => "info",
        Some(6..=8) => "debug",
        Some(_) => "trace",
    }
}

fn init_logging(logging: Option<u8>) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level_filter(logging)))
        .format_timestamp_secs()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Commands::Serve { config, logging } => {
            init_logging(logging);
            let config = RelayConfig::load(config.as_deref())?;
            log::info!("Pushrelay v{} starting", VERSION);
            runtime.block_on(commands::serve::run(config))
        }
        Commands::Listen { url, uaid, channels } => {
            init_logging(None);
            runtime.block_on(commands::listen::run(ListenOptions {
                url,
                uaid,
                channels,
            }))
        }
        Commands::Config { config } => commands::show_config(config.as_deref()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_levels() {
        assert_eq!(level_filter(None), "info");
        assert_eq!(level_filter(Some(0)), "error");
        assert_eq!(level_filter(Some(2)), "warn");
        assert_eq!(level_filter(Some(7)), "debug");
        assert_eq!(level_filter(Some(10)), "trace");
    }

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from(["pushrelay", "serve", "--config", "relay.json", "--logging", "6"]).unwrap();
        match cli.command {
            Commands::Serve { config, logging } => {
                assert_eq!(config, Some(PathBuf::from("relay.json")));
                assert_eq!(logging, Some(6));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_rejects_out_of_range_logging() {
        assert!(Cli::try_parse_from(["pushrelay", "serve", "--logging", "11"]).is_err());
    }
}
