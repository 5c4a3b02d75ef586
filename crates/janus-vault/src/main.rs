//! Janus vault sidecar (XEMS).
//!
//! Owns the encrypted session store for the whole deployment. Binds its
//! Unix socket with `0600` permissions, restores a persisted snapshot when
//! configured and the host matches, and serves the single-task event loop
//! until SIGTERM, at which point it snapshots and exits.

use log::{error, info};
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use janus_rs::config::settings::load_settings;
use janus_rs::logs::logger::configure_logger;
use janus_rs::vault::server::{PersistenceConfig, VaultServer};
use janus_rs::vault::store::{SessionVault, VaultConfig};

const EXIT_CONFIG: i32 = 1;
const EXIT_IPC: i32 = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    configure_logger("vault");

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let socket_path = std::env::var("JANUS_VAULT_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| settings.ipc.vault_socket());

    let vault = SessionVault::new(VaultConfig {
        capacity: settings.xems.capacity,
        default_ttl_ms: settings.xems.ttl,
        grace_period_ms: settings.xems.grace_period,
    });

    let persistence = settings
        .xems
        .persistence
        .enabled
        .then(|| PersistenceConfig {
            path: PathBuf::from(&settings.xems.persistence.path),
            secret: settings.xems.persistence.secret.clone(),
        });

    let listener = match bind_0600(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Vault socket bind failed at {}: {}", socket_path.display(), e);
            std::process::exit(EXIT_IPC);
        }
    };
    info!("Vault listening on {}", socket_path.display());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("Vault draining");
            shutdown.cancel();
        });
    }

    let server = VaultServer::new(vault, persistence, settings.ipc.max_frame_size);
    if let Err(e) = server.serve(listener, shutdown).await {
        error!("Vault event loop failed: {}", e);
        std::process::exit(EXIT_IPC);
    }
}

fn bind_0600(path: &PathBuf) -> std::io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(listener)
}
