//! scaped: IoTScape / RoboScape device daemon.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};

use scape_core::{CipherSuite, ScapeConfig};
use scape_services::{AllowAll, IotScape, JsonFileStore, MemoryStore, RoboScape, ServiceStore};

mod dispatch;
mod liveness;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ScapeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ScapeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ScapeConfig::default()
    });

    let bind_ip: IpAddr = config
        .network
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.network.bind_addr))?;
    tracing::info!(
        iotscape_port = config.network.iotscape_port,
        roboscape_port = config.network.roboscape_port,
        mode = ?config.roboscape.mode,
        "scaped starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── IoTScape ─────────────────────────────────────────────────────────────

    let iotscape = if config.network.iotscape_port != 0 {
        let store: Arc<dyn ServiceStore> = if config.store.persist {
            tracing::info!(path = %config.store.path.display(), "service store");
            Arc::new(JsonFileStore::open(config.store.path.clone()))
        } else {
            Arc::new(MemoryStore::new())
        };

        let socket = Arc::new(
            dispatch::bind(SocketAddr::new(bind_ip, config.network.iotscape_port))
                .context("failed to bind iotscape socket")?,
        );
        let scape = IotScape::new(
            CipherSuite::with_defaults(),
            store,
            config.timing.response_timeout(),
            socket.clone(),
        );
        match scape.catalog().clear_store() {
            Ok(removed) => tracing::info!(removed, "cleared stored device services"),
            Err(e) => tracing::warn!(error = %e, "failed to clear stored device services"),
        }
        tokio::spawn(dispatch::iotscape_loop(socket, scape.clone(), shutdown_tx.subscribe()));
        Some(scape)
    } else {
        tracing::info!("iotscape disabled");
        None
    };

    // ── RoboScape ────────────────────────────────────────────────────────────

    let roboscape = if config.network.roboscape_port != 0 {
        let socket = Arc::new(
            dispatch::bind(SocketAddr::new(bind_ip, config.network.roboscape_port))
                .context("failed to bind roboscape socket")?,
        );
        let scape = RoboScape::new(
            CipherSuite::with_defaults(),
            config.roboscape.mode,
            config.timing.robot_response_timeout(),
            Arc::new(AllowAll),
            socket.clone(),
        );
        tokio::spawn(dispatch::roboscape_loop(socket, scape.clone(), shutdown_tx.subscribe()));
        Some(scape)
    } else {
        tracing::info!("roboscape disabled");
        None
    };

    if iotscape.is_none() && roboscape.is_none() {
        tracing::warn!("no device family enabled; set IOTSCAPE_PORT or ROBOSCAPE_PORT");
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    let tick_task = tokio::spawn(liveness::tick_loop(
        iotscape.clone(),
        roboscape,
        config.timing.tick_interval(),
        config.timing.forget_ticks,
        shutdown_tx.subscribe(),
    ));

    let heartbeat_task = match (iotscape, config.timing.heartbeat_interval()) {
        (Some(scape), Some(every)) => Some(tokio::spawn(liveness::heartbeat_loop(
            scape,
            every,
            shutdown_tx.subscribe(),
        ))),
        _ => None,
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = tick_task          => tracing::error!("tick task exited: {:?}", r),
    }

    if let Some(task) = heartbeat_task {
        task.abort();
    }

    Ok(())
}
