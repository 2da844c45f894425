//! Configuration reload loop: file modification time polling plus SIGHUP.

use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tiergate_config::ConfigStore;

/// Reload `store` when its file changes or on SIGHUP, until `shutdown` flips.
///
/// The poll interval is re-read from the active configuration after every
/// pass, so a reload can change it.
pub async fn run(store: ConfigStore, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    info!(path = %store.path().display(), "config reload loop started");

    loop {
        let interval = poll_interval(&store);
        tokio::select! {
            _ = shutdown.changed() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = store.reload() {
                    warn!(error = %e, "configuration reload failed");
                }
            }
            _ = tokio::time::sleep(interval) => {
                match store.reload_if_changed() {
                    Ok(true) => {}
                    Ok(false) => debug!("configuration unchanged"),
                    Err(e) => warn!(error = %e, "configuration reload failed"),
                }
            }
        }
    }

    info!("config reload loop stopped");
    Ok(())
}

fn poll_interval(store: &ConfigStore) -> Duration {
    let interval = store.current().general.reload_poll_interval();
    // Zero would spin.
    interval.max(Duration::from_secs(1))
}
