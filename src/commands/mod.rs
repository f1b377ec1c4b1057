//! CLI subcommand implementations.
//!
//! - [`serve`] - run a relay node until a signal or a fatal listener error
//! - [`listen`] - debugging push client that prints notifications
//! - [`show_config`] - print the effective configuration

pub mod listen;
pub mod serve;

use std::path::Path;

use anyhow::Result;

use crate::config::RelayConfig;

/// Print the effective configuration (file + env overrides) as JSON.
pub fn show_config(path: Option<&Path>) -> Result<()> {
    let config = RelayConfig::load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
