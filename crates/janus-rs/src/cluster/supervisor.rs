//! The supervisor: spawn, watch, respawn, quarantine, drain.
//!
//! Each worker gets its own Unix socket path and is launched from the
//! configured command with its identity in the environment. A worker that
//! fails to hand back WORKER_READY inside the startup deadline is killed
//! and rescheduled. Exits are respawned after `restartDelay` with
//! exponential backoff; too many exits inside `restartWindow` quarantine
//! the slot, and when every slot is quarantined the supervisor declares the
//! process unrecoverable.

use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::ipc::WorkerBridge;
use crate::models::settings::Settings;

use super::limits::{self, CpuSampler};
use super::registry::WorkerRegistry;

/// Health state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerState {
    Starting,
    Ready,
    Draining,
    Dead,
    Quarantined,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Worker process could not be started; fatal at boot (exit code 3).
    #[error("Failed to spawn worker {id}: {source}")]
    Spawn {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// The IPC socket never became connectable.
    #[error("Worker {id} IPC setup failed: {message}")]
    IpcSetup { id: u32, message: String },
}

struct WorkerSlot {
    state: WorkerState,
    pid: Option<u32>,
    /// Unix-ms timestamps of recent exits, for storm detection.
    restarts: VecDeque<i64>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: WorkerState::Starting,
            pid: None,
            restarts: VecDeque::new(),
        }
    }
}

/// Owns every worker process for the lifetime of the gateway.
pub struct Supervisor {
    settings: Arc<Settings>,
    registry: Arc<WorkerRegistry>,
    slots: Mutex<HashMap<u32, WorkerSlot>>,
    shutdown: CancellationToken,
    /// Fires when every slot is quarantined; the binary exits 4.
    unrecoverable: CancellationToken,
    /// Exit monitors request respawns here; a single loop serializes them.
    respawn_tx: tokio::sync::mpsc::UnboundedSender<u32>,
    respawn_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<u32>>>,
}

impl Supervisor {
    pub fn new(settings: Arc<Settings>, registry: Arc<WorkerRegistry>) -> Arc<Self> {
        let (respawn_tx, respawn_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Self {
            settings,
            registry,
            slots: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            unrecoverable: CancellationToken::new(),
            respawn_tx,
            respawn_rx: Mutex::new(Some(respawn_rx)),
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Token observers can watch for the all-quarantined condition.
    pub fn unrecoverable_token(&self) -> CancellationToken {
        self.unrecoverable.clone()
    }

    pub fn worker_states(&self) -> Vec<(u32, WorkerState)> {
        let mut states: Vec<(u32, WorkerState)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.state))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    /// Spawns the configured number of workers and returns once all have
    /// completed (or failed) their first startup.
    pub async fn start(self: Arc<Self>) -> Result<(), SupervisorError> {
        let count = self.settings.cluster.workers.resolve();
        info!("Supervisor starting {} worker(s)", count);
        for id in 0..count {
            self.slots.lock().insert(id, WorkerSlot::new());
            Arc::clone(&self).spawn_worker(id).await?;
        }

        // Serialize respawns through one loop so exit monitors never need
        // to re-enter the spawn path themselves.
        let mut rx = match self.respawn_rx.lock().take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let respawner = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                if respawner.shutdown.is_cancelled() {
                    return;
                }
                if let Err(e) = Arc::clone(&respawner).spawn_worker(id).await {
                    error!("Respawn of worker {} failed: {}", id, e);
                }
            }
        });
        Ok(())
    }

    /// Launches one worker process and wires up its bridge, heartbeat,
    /// resource sampling, and exit monitoring.
    async fn spawn_worker(self: Arc<Self>, id: u32) -> Result<(), SupervisorError> {
        let ipc = &self.settings.ipc;
        let socket_path = ipc.worker_socket(id);
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| SupervisorError::IpcSetup {
                id,
                message: e.to_string(),
            })?;
        }

        let resources = self.settings.cluster.resources.clone();
        let mut command = Command::new(&self.settings.cluster.worker_command);
        command
            .env("JANUS_WORKER_ID", id.to_string())
            .env("JANUS_IPC_SOCKET", &socket_path)
            .env("JANUS_VAULT_SOCKET", ipc.vault_socket())
            .stdin(Stdio::null());
        if let Ok(config_path) = std::env::var("JANUS_CONFIG_PATH") {
            command.env("JANUS_CONFIG_PATH", config_path);
        }
        if resources.gc_hint {
            command.env("JANUS_GC_HINT", "1");
        }
        unsafe {
            let resources = resources.clone();
            command.pre_exec(move || limits::apply_pre_exec(&resources));
        }

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn { id, source })?;
        let pid = child.id();
        info!("Worker {} spawned (pid {:?})", id, pid);

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&id) {
                slot.state = WorkerState::Starting;
                slot.pid = pid;
            }
        }

        let startup = Duration::from_millis(self.settings.cluster.startup_timeout);
        let bridge = match WorkerBridge::connect(
            id,
            &socket_path,
            ipc.max_frame_size,
            ipc.stream_window,
            startup,
        )
        .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!("Worker {} never opened its socket: {}", id, e);
                let _ = child.start_kill();
                self.clone().watch_exit(id, child);
                return Err(SupervisorError::IpcSetup {
                    id,
                    message: e.to_string(),
                });
            }
        };

        if !bridge.await_ready(startup).await {
            warn!(
                "Worker {} missed the {} ms startup deadline, killing",
                id,
                startup.as_millis()
            );
            let _ = child.start_kill();
            self.clone().watch_exit(id, child);
            return Ok(());
        }

        info!("Worker {} ready", id);
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&id) {
                slot.state = WorkerState::Ready;
            }
        }
        self.registry.install(bridge.clone());

        // Heartbeat until the channel dies.
        let hb = bridge.clone();
        let hb_interval = Duration::from_millis(ipc.heartbeat_interval);
        tokio::spawn(async move { hb.heartbeat(hb_interval).await });

        // Resource sampling.
        if let Some(pid) = pid {
            self.clone().watch_resources(id, pid);
        }

        self.clone().watch_exit(id, child);
        Ok(())
    }

    /// Reaps the child and drives the respawn policy.
    fn watch_exit(self: Arc<Self>, id: u32, mut child: Child) {
        tokio::spawn(async move {
            let status = child.wait().await;
            self.registry.remove(id);
            {
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&id) {
                    slot.state = WorkerState::Dead;
                    slot.pid = None;
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            warn!("Worker {} exited: {:?}", id, status);

            if !self.settings.cluster.auto_respawn {
                return;
            }

            let now = chrono::Utc::now().timestamp_millis();
            let window = self.settings.cluster.restart_window as i64;
            let recent = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(&id) else { return };
                slot.restarts.push_back(now);
                while let Some(&oldest) = slot.restarts.front() {
                    if now - oldest > window {
                        slot.restarts.pop_front();
                    } else {
                        break;
                    }
                }
                slot.restarts.len() as u32
            };

            if recent >= self.settings.cluster.max_restarts {
                error!(
                    "Worker {} exceeded {} restarts in {} ms, quarantined",
                    id, self.settings.cluster.max_restarts, window
                );
                let all_quarantined = {
                    let mut slots = self.slots.lock();
                    if let Some(slot) = slots.get_mut(&id) {
                        slot.state = WorkerState::Quarantined;
                    }
                    slots
                        .values()
                        .all(|slot| slot.state == WorkerState::Quarantined)
                };
                if all_quarantined {
                    error!("Every worker is quarantined; declaring the process unrecoverable");
                    self.unrecoverable.cancel();
                }
                return;
            }

            // Exponential backoff on repeated exits inside the window.
            let delay = self.settings.cluster.restart_delay
                * 2u64.saturating_pow(recent.saturating_sub(1));
            info!("Respawning worker {} in {} ms", id, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.shutdown.is_cancelled() {
                return;
            }
            let _ = self.respawn_tx.send(id);
        });
    }

    /// Samples memory and CPU on the configured interval; enforces hard
    /// limits with TERM then KILL.
    fn watch_resources(self: Arc<Self>, id: u32, pid: u32) {
        let resources = self.settings.cluster.resources.clone();
        if resources.max_memory_mb == 0 && resources.max_cpu_pct == 0 {
            return;
        }
        let interval = Duration::from_millis(self.settings.cluster.check_interval);

        tokio::spawn(async move {
            let mut cpu = CpuSampler::new();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                // The slot may have moved on to a new process.
                let current = self.slots.lock().get(&id).and_then(|s| s.pid);
                if current != Some(pid) {
                    return;
                }

                let mut over: Option<String> = None;
                if resources.max_memory_mb > 0 {
                    if let Some(rss) = limits::rss_mb(pid) {
                        if rss > resources.max_memory_mb {
                            over = Some(format!(
                                "memory {} MiB over the {} MiB limit",
                                rss, resources.max_memory_mb
                            ));
                        }
                    }
                }
                if over.is_none() && resources.max_cpu_pct > 0 {
                    if let Some(pct) = cpu.sample(pid) {
                        if pct > resources.max_cpu_pct as f64 {
                            over = Some(format!(
                                "cpu {:.0}% over the {}% limit",
                                pct, resources.max_cpu_pct
                            ));
                        }
                    }
                }

                let Some(reason) = over else { continue };
                if !resources.enforcement.hard_limits {
                    warn!("Worker {} (pid {}) {}", id, pid, reason);
                    continue;
                }

                warn!("Worker {} (pid {}) {}, terminating", id, pid, reason);
                signal(pid, libc::SIGTERM);
                tokio::time::sleep(Duration::from_millis(resources.enforcement.kill_grace)).await;
                let still_same = self.slots.lock().get(&id).and_then(|s| s.pid) == Some(pid);
                if still_same {
                    signal(pid, libc::SIGKILL);
                }
                return;
            }
        });
    }

    /// Graceful shutdown: drain, wait for in-flight work, TERM stragglers,
    /// KILL holdouts. Returns `true` on a clean drain.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        info!("Supervisor shutting down, draining workers");
        self.shutdown.cancel();

        for bridge in self.registry.all() {
            bridge.drain().await;
        }

        let drained = tokio::time::timeout(drain_timeout, async {
            loop {
                if self.registry.total_in_flight() == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "Drain incomplete after {} ms, {} request(s) abandoned",
                drain_timeout.as_millis(),
                self.registry.total_in_flight()
            );
        }

        let pids: Vec<u32> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.pid)
            .collect();
        for pid in &pids {
            signal(*pid, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        for pid in pids {
            // Idempotent: already-exited pids just return ESRCH.
            signal(pid, libc::SIGKILL);
        }
        drained
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}
