//! `tiergated serve`: wire the subsystems together and accept connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::MethodSet;
use russh::server::Server as _;
use tokio::sync::watch;
use tracing::{info, warn};

use tiergate_bridge::DockerConnector;
use tiergate_config::ConfigStore;
use tiergate_dispatch::{BUILTIN_COMMANDS, Dispatcher};
use tiergate_orchestrator::{Aggregator, NomadConnector};

use crate::reload;
use crate::ssh::Gateway;

pub async fn run(path: PathBuf) -> anyhow::Result<()> {
    info!("tiergate daemon starting");

    let store = ConfigStore::open(&path, BUILTIN_COMMANDS)
        .with_context(|| format!("loading {}", path.display()))?;
    let config = store.current();
    let general = &config.general;
    info!(
        path = %path.display(),
        tiers = config.tiers.len(),
        users = config.users.len(),
        "configuration loaded"
    );

    // ── Host key ───────────────────────────────────────────────
    let host_key = russh_keys::load_secret_key(&general.host_key, None)
        .with_context(|| format!("reading host key {}", general.host_key.display()))?;

    // ── Orchestrator and container runtime access ──────────────
    // Docker settings and the listen address are read once; changing them needs a restart.
    let aggregator = Arc::new(Aggregator::new(Arc::new(NomadConnector::new(
        general.connect_timeout(),
    ))));
    let runtime = Arc::new(DockerConnector {
        port: general.docker_port,
        api_version: general.docker_api_version()?,
        timeout: general.connect_timeout(),
    });
    let dispatcher = Arc::new(Dispatcher::new(aggregator, runtime));

    // ── Config reload ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload_handle = tokio::spawn(reload::run(store.clone(), shutdown_rx));

    // ── SSH server ─────────────────────────────────────────────
    let ssh_config = Arc::new(russh::server::Config {
        methods: MethodSet::PUBLICKEY,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });
    let bind = general.bind;
    let mut gateway = Gateway::new(store, dispatcher);
    info!(%bind, "ssh server starting");

    tokio::select! {
        result = gateway.run_on_address(ssh_config, bind) => {
            result.with_context(|| format!("ssh server on {bind}"))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing CTRL+C handler")?;
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    match reload_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "config reload loop failed"),
        Err(e) => warn!(error = %e, "config reload task panicked"),
    }

    info!("tiergate daemon stopped");
    Ok(())
}
