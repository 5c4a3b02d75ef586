//! Janus gateway server.
//!
//! Startup order: logging, configuration (fatal on error, exit 1), the
//! vault sidecar, the worker supervisor (exit 3 on IPC setup failure), then
//! the HTTP listener (exit 2 if no port can be bound). SIGTERM/SIGINT start
//! a graceful drain; an all-quarantined worker pool exits 4.

mod port;

use actix_web::{middleware::Compress, App, HttpServer};
use chrono::Utc;
use log::{error, info, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use janus_rs::cluster::{Supervisor, WorkerRegistry};
use janus_rs::config::settings::load_settings;
use janus_rs::config::validation::ConfigValidator;
use janus_rs::gateway::admission::{Admission, AdmissionState};
use janus_rs::gateway::quality::{QualityGate, QualityMonitor};
use janus_rs::gateway::rate_limit::RateLimit;
use janus_rs::gateway::routes::{configure_catch_all, configure_health, HealthState};
use janus_rs::gateway::GatewayHandler;
use janus_rs::logs::logger::configure_logger;
use janus_rs::plugins::PluginManager;
use janus_rs::services::health::probe_loop;
use tokio_util::sync::CancellationToken;

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_IPC: i32 = 3;
const EXIT_QUARANTINE: i32 = 4;

#[actix_web::main]
async fn main() {
    configure_logger("gateway");

    let settings = match load_settings() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let validation = ConfigValidator::validate_comprehensive(&settings);
    if !validation.is_valid() {
        error!("Configuration validation failed:");
        for e in &validation.errors {
            error!("  - {}", e);
        }
        std::process::exit(EXIT_CONFIG);
    }
    validation.report();
    if let Err(e) = janus_rs::config::settings::freeze(Arc::clone(&settings)) {
        error!("{}", e);
        std::process::exit(EXIT_CONFIG);
    }
    info!(
        "Starting Janus gateway v{} ({} warning(s))",
        env!("CARGO_PKG_VERSION"),
        validation.warnings.len()
    );

    // Vault sidecar first: workers connect to it during their own startup.
    let mut vault_child = if settings.xems.enable {
        match spawn_vault(&settings) {
            Ok(child) => Some(child),
            Err(e) => {
                error!("Vault sidecar failed to start: {}", e);
                std::process::exit(EXIT_IPC);
            }
        }
    } else {
        None
    };

    // Worker pool.
    let registry = Arc::new(WorkerRegistry::new(settings.cluster.strategy));
    let supervisor = Supervisor::new(Arc::clone(&settings), Arc::clone(&registry));
    if let Err(e) = Arc::clone(&supervisor).start().await {
        error!("Worker startup failed: {}", e);
        std::process::exit(EXIT_IPC);
    }

    // Gateway-side plugin pipeline. Registration happens here, before seal;
    // v1 ships none built in.
    let mut plugins = PluginManager::new(&settings.plugin_permissions);
    plugins.seal();
    let plugins = Arc::new(plugins);

    let admission = AdmissionState::new(
        settings.request_management.concurrency.clone(),
        settings.request_management.payload.clone(),
    );
    let quality = QualityMonitor::new();
    let handler = Arc::new(GatewayHandler::new(
        Arc::clone(&settings),
        Arc::clone(&registry),
        Arc::clone(&plugins),
        Arc::clone(&quality),
    ));

    let shutdown = CancellationToken::new();
    if let Some(pool) = handler.upstream_pool() {
        tokio::spawn(probe_loop(
            pool.clone(),
            settings.network.proxy.health_check.clone(),
            shutdown.clone(),
        ));
    }

    let health_state = actix_web::web::Data::new(HealthState {
        started_at: Utc::now(),
        registry: Arc::clone(&registry),
        admission: Arc::clone(&admission),
        upstreams: handler.upstream_pool().cloned(),
    });

    let Some(bound_port) = port::resolve(&settings.server) else {
        error!(
            "Could not bind {}:{} (auto switch {})",
            settings.server.host,
            settings.server.port,
            if settings.server.auto_port_switch.enabled {
                "exhausted"
            } else {
                "disabled"
            }
        );
        std::process::exit(EXIT_BIND);
    };

    let keep_alive = if settings.network.connection.keep_alive.enabled {
        Duration::from_millis(settings.network.connection.keep_alive.timeout)
    } else {
        Duration::ZERO
    };

    let server = {
        let host = settings.server.host.clone();
        let settings = Arc::clone(&settings);
        let admission = Arc::clone(&admission);
        let quality = Arc::clone(&quality);
        let plugins = Arc::clone(&plugins);
        let handler = Arc::clone(&handler);
        let health_state = health_state.clone();
        HttpServer::new(move || {
            App::new()
                .wrap(Compress::default())
                .wrap(QualityGate::new(
                    Arc::clone(&quality),
                    settings.request_management.network_quality.clone(),
                ))
                .wrap(RateLimit::new(
                    settings.network.rate_limit.clone(),
                    Arc::clone(&plugins),
                ))
                .wrap(Admission::new(Arc::clone(&admission)))
                .configure(|cfg| configure_health(cfg, health_state.clone()))
                .configure(|cfg| {
                    configure_catch_all(
                        cfg,
                        Arc::clone(&handler),
                        settings.request_management.payload.max_body_size,
                    )
                })
        })
        .keep_alive(keep_alive)
        .bind((host.as_str(), bound_port))
    };

    let server = match server {
        Ok(server) => server.run(),
        Err(e) => {
            error!("Bind failed on port {}: {}", bound_port, e);
            std::process::exit(EXIT_BIND);
        }
    };
    let server_handle = server.handle();
    info!(
        "Gateway listening on {}:{}",
        settings.server.host, bound_port
    );

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Signal handler setup failed: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    let mut sighup = signal(SignalKind::hangup()).ok();
    let unrecoverable = supervisor.unrecoverable_token();

    let mut exit_code = 0;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                exit_code = EXIT_CONFIG;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, draining");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, draining");
        }
        _ = async {
            // SIGHUP is reserved for config reload; acknowledge and continue.
            loop {
                match sighup.as_mut() {
                    Some(hup) => {
                        hup.recv().await;
                        warn!("SIGHUP received; config reload is not implemented, ignoring");
                    }
                    None => std::future::pending::<()>().await,
                }
            }
        } => {}
        _ = unrecoverable.cancelled() => {
            error!("Worker pool unrecoverable, shutting down");
            exit_code = EXIT_QUARANTINE;
        }
    }

    // Stop accepting, then drain workers within the configured budget.
    shutdown.cancel();
    server_handle.stop(true).await;
    let drained = supervisor
        .shutdown(Duration::from_millis(settings.cluster.shutdown_timeout))
        .await;
    if !drained && exit_code == 0 {
        exit_code = EXIT_CONFIG;
    }

    // The vault snapshots on TERM; give it a moment before we leave.
    if let Some(child) = vault_child.as_mut() {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    }

    info!("Gateway stopped (exit {})", exit_code);
    std::process::exit(exit_code);
}

fn spawn_vault(
    settings: &janus_rs::models::settings::Settings,
) -> std::io::Result<tokio::process::Child> {
    let socket = settings.ipc.vault_socket();
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut command = tokio::process::Command::new("janus-vault");
    command
        .env("JANUS_VAULT_SOCKET", &socket)
        .stdin(Stdio::null());
    if let Ok(config_path) = std::env::var("JANUS_CONFIG_PATH") {
        command.env("JANUS_CONFIG_PATH", config_path);
    }
    let child = command.spawn()?;
    info!("Vault sidecar spawned (pid {:?})", child.id());
    Ok(child)
}
