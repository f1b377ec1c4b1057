//! `pushrelay serve`: run one relay node.

use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::server::Relay;
use crate::storage::{ChannelStore, MemoryStore};

/// Serve until a shutdown signal or a fatal listener error.
///
/// Bind failures and listener failures are returned as errors; the binary
/// exits non-zero on them.
pub async fn run(config: RelayConfig) -> Result<()> {
    let store: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new());
    let relay = Relay::start(config, store)
        .await
        .context("Failed to start relay")?;

    let stop = CancellationToken::new();
    spawn_signal_thread(stop.clone())?;

    let outcome = tokio::select! {
        () = stop.cancelled() => Ok(()),
        result = relay.wait() => result,
    };

    relay.shutdown().await;
    outcome.context("Relay stopped on a fatal error")
}

/// Watch process signals on a dedicated thread.
///
/// The first signal starts a graceful shutdown; a second one exits at once.
fn spawn_signal_thread(stop: CancellationToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGUSR1])
        .context("Failed to register signal handlers")?;

    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if stop.is_cancelled() {
                    log::warn!("[Relay] Signal {} during shutdown, exiting now", signal);
                    std::process::exit(1);
                }
                log::info!("[Relay] Signal {} received, shutting down", signal);
                stop.cancel();
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}
