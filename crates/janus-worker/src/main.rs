//! Janus application worker.
//!
//! Spawned by the gateway supervisor with its identity in the environment:
//! `JANUS_WORKER_ID`, `JANUS_IPC_SOCKET`, and (when sessions are enabled)
//! `JANUS_VAULT_SOCKET`. Builds the application, connects the session
//! layer, binds the IPC socket, and serves until the gateway drains it.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use janus_rs::config::settings::load_settings;
use janus_rs::ipc::WorkerListener;
use janus_rs::logs::logger::configure_logger;
use janus_rs::runtime::session::SessionLayer;
use janus_rs::runtime::{App, Dispatcher};
use janus_rs::vault::VaultClient;

mod app_routes;

const EXIT_CONFIG: i32 = 1;
const EXIT_IPC: i32 = 3;

#[tokio::main]
async fn main() {
    configure_logger("worker");

    let worker_id: u32 = std::env::var("JANUS_WORKER_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let socket_path = match std::env::var("JANUS_IPC_SOCKET") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            error!("JANUS_IPC_SOCKET is not set; this binary is spawned by the gateway");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let settings = match load_settings() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Session layer, when the vault sidecar is part of the deployment.
    let session = if settings.xems.enable {
        let vault_socket = std::env::var("JANUS_VAULT_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| settings.ipc.vault_socket());
        match connect_vault(&vault_socket, settings.ipc.max_frame_size).await {
            Some(client) => Some(SessionLayer::new(client, settings.xems.clone())),
            None => {
                error!("Vault sidecar unreachable at {}", vault_socket.display());
                std::process::exit(EXIT_IPC);
            }
        }
    } else {
        None
    };

    // Application assembly: built-in routes plus whatever plugins add.
    let mut app = App::new(&settings.plugin_permissions);
    app_routes::register(&mut app, session.clone());

    let built = match app.build() {
        Ok(built) => Arc::new(built),
        Err(e) => {
            error!("Route table build failed: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    built.plugins.fire_registered().await;
    built.plugins.fire_server_start().await;

    let dispatcher = Dispatcher::new(Arc::clone(&built), session);

    // Periodic performance metrics for the plugin pipeline.
    {
        let dispatcher = dispatcher.clone();
        let built = Arc::clone(&built);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let snapshot = dispatcher.metrics().snapshot();
                built.plugins.notify_performance_metrics(&snapshot).await;
            }
        });
    }

    let listener = match WorkerListener::bind(
        worker_id,
        &socket_path,
        dispatcher,
        settings.ipc.max_frame_size,
        settings.ipc.stream_window,
    ) {
        Ok(listener) => listener,
        Err(e) => {
            error!("IPC bind failed at {}: {}", socket_path.display(), e);
            std::process::exit(EXIT_IPC);
        }
    };

    built.plugins.fire_server_ready().await;
    info!("Worker {} serving on {}", worker_id, socket_path.display());

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            error!("Signal handler setup failed: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    tokio::select! {
        result = listener.serve() => {
            if let Err(e) = result {
                error!("IPC serve error: {}", e);
            }
        }
        _ = sigterm.recv() => {
            info!("Worker {} received SIGTERM", worker_id);
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    built.plugins.fire_server_stop().await;
    info!("Worker {} stopped", worker_id);
}

/// The gateway may still be bringing the sidecar up; retry briefly.
async fn connect_vault(path: &PathBuf, max_frame_size: usize) -> Option<VaultClient> {
    for attempt in 0..50u32 {
        match VaultClient::connect(path, max_frame_size).await {
            Ok(client) => return Some(client),
            Err(e) => {
                if attempt == 0 {
                    warn!("Vault not up yet ({}), retrying", e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    None
}
