//! Application configuration for the Janus gateway and its workers.
//!
//! The configuration is a single JSON document (camelCase keys) loaded at
//! startup and frozen before the listener binds. Every recognized key has a
//! serde default so a minimal file like `{"version": 1}` yields a runnable
//! single-worker setup. Validation happens in two passes: `Settings::validate`
//! for hard errors, and [`crate::config::validation::ConfigValidator`] for
//! the comprehensive error/warning report printed at startup.
//!
//! # Configuration File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "server": { "port": 3000, "host": "0.0.0.0" },
//!   "cluster": { "enabled": true, "workers": 2, "strategy": "least-loaded" },
//!   "requestManagement": {
//!     "timeout": { "enabled": true, "defaultTimeout": 30000, "routes": { "/sleep": 100 } },
//!     "concurrency": { "maxConcurrentRequests": 1000, "maxPerIP": 50 }
//!   },
//!   "network": {
//!     "rateLimit": { "enabled": true, "global": { "requests": 100, "window": 60000 } },
//!     "proxy": { "enabled": true, "upstreams": [ { "host": "10.0.0.5", "port": 8080 } ] }
//!   },
//!   "xems": { "enable": true, "autoRotation": true, "gracePeriod": 1000 }
//! }
//! ```

use serde::{Deserialize, Serialize};

fn default_version() -> u8 {
    1
}

/// Complete settings document for one Janus deployment.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Configuration schema version, currently `1`.
    #[serde(default = "default_version")]
    pub version: u8,

    /// Bind address and port behavior.
    pub server: ServerSettings,

    /// Worker process pool.
    pub cluster: ClusterSettings,

    /// Admission control, timeouts, and resilience.
    pub request_management: RequestManagement,

    /// Rate limiting, reverse proxy, compression, transport tuning.
    pub network: NetworkSettings,

    /// Session vault (XEMS) sidecar.
    pub xems: XemsSettings,

    /// IPC transport between gateway, workers, and the vault.
    pub ipc: IpcSettings,

    /// Per-plugin allow/deny hook lists. A plugin absent from this list may
    /// invoke every hook.
    pub plugin_permissions: Vec<PluginPermission>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerSettings::default(),
            cluster: ClusterSettings::default(),
            request_management: RequestManagement::default(),
            network: NetworkSettings::default(),
            xems: XemsSettings::default(),
            ipc: IpcSettings::default(),
            plugin_permissions: Vec::new(),
        }
    }
}

impl Settings {
    /// Validates the document, returning the first hard error found.
    ///
    /// This is the gate before startup: a failure here is a configuration
    /// error and the process exits with code 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("Unsupported configuration version: {}", self.version));
        }
        self.server.validate()?;
        self.cluster.validate()?;
        self.request_management.validate()?;
        self.network.validate()?;
        self.xems.validate()?;
        self.ipc.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// server.*
// ---------------------------------------------------------------------------

/// Strategy for picking an alternative port when the configured one is taken.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PortSwitchStrategy {
    /// Try port, port+1, port+2, ...
    Increment,
    /// Try random ports in the ephemeral range.
    Random,
    /// Try ports drawn from `portRange`.
    PortRange,
}

impl Default for PortSwitchStrategy {
    fn default() -> Self {
        Self::Increment
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoPortSwitch {
    pub enabled: bool,
    pub max_attempts: u32,
    pub strategy: PortSwitchStrategy,
    /// Inclusive `[low, high]` range, used by the `port-range` strategy.
    pub port_range: Option<(u16, u16)>,
}

impl Default for AutoPortSwitch {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            strategy: PortSwitchStrategy::default(),
            port_range: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub auto_port_switch: AutoPortSwitch,
    /// Attempt to kill the process holding the port before retrying the bind.
    pub auto_kill_conflict: bool,
    /// When false, the `X-Powered-By` header is omitted from responses.
    pub powered_by_header: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auto_port_switch: AutoPortSwitch::default(),
            auto_kill_conflict: false,
            powered_by_header: true,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("server.port must be between 1 and 65535".to_string());
        }
        if self.auto_port_switch.enabled {
            if self.auto_port_switch.max_attempts == 0 {
                return Err("server.autoPortSwitch.maxAttempts must be at least 1".to_string());
            }
            if self.auto_port_switch.strategy == PortSwitchStrategy::PortRange {
                match self.auto_port_switch.port_range {
                    Some((low, high)) if low <= high && low > 0 => {}
                    _ => {
                        return Err(
                            "server.autoPortSwitch.portRange must be a valid [low, high] pair"
                                .to_string(),
                        )
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// cluster.*
// ---------------------------------------------------------------------------

/// Worker count: a fixed number or `"auto"` (one per CPU core).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WorkerCount {
    Count(u32),
    Auto(String),
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl WorkerCount {
    /// Resolves to a concrete worker count for this host.
    pub fn resolve(&self) -> u32 {
        match self {
            WorkerCount::Count(n) => (*n).max(1),
            WorkerCount::Auto(_) => {
                std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
            }
        }
    }
}

/// How the supervisor assigns requests to ready workers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStrategy {
    RoundRobin,
    LeastLoaded,
    Sticky,
}

impl Default for ClusterStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceEnforcement {
    /// Kill a worker exceeding its memory limit (TERM, then KILL after
    /// grace); when false the supervisor only logs a warning.
    pub hard_limits: bool,
    /// Grace between TERM and KILL, in milliseconds.
    pub kill_grace: u64,
}

impl Default for ResourceEnforcement {
    fn default() -> Self {
        Self {
            hard_limits: false,
            kill_grace: 5_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterResources {
    /// Resident memory ceiling per worker, in MiB. `0` disables the check.
    #[serde(alias = "maxMemory")]
    pub max_memory_mb: u64,
    /// CPU ceiling per worker as a percentage of one core. `0` disables.
    #[serde(alias = "maxCpu")]
    pub max_cpu_pct: u32,
    /// Niceness applied to the worker process (-20..=19).
    pub priority: i32,
    /// RLIMIT_NOFILE applied to the worker. `0` inherits.
    pub file_descriptor_limit: u64,
    /// Advisory flag forwarded to the worker environment.
    pub gc_hint: bool,
    pub enforcement: ResourceEnforcement,
}

impl Default for ClusterResources {
    fn default() -> Self {
        Self {
            max_memory_mb: 0,
            max_cpu_pct: 0,
            priority: 0,
            file_descriptor_limit: 0,
            gc_hint: false,
            enforcement: ResourceEnforcement::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub enabled: bool,
    pub workers: WorkerCount,
    pub strategy: ClusterStrategy,
    /// Command the supervisor runs for each worker.
    pub worker_command: String,
    pub resources: ClusterResources,
    pub auto_respawn: bool,
    /// Exits within `restartWindow` before a worker is quarantined.
    pub max_restarts: u32,
    /// Window for counting restarts, in milliseconds.
    pub restart_window: u64,
    /// Delay before respawning an exited worker, in milliseconds.
    pub restart_delay: u64,
    /// How long a fresh worker may take to report WORKER_READY, ms.
    pub startup_timeout: u64,
    /// Resource sampling period, in milliseconds.
    pub check_interval: u64,
    /// Drain budget during graceful shutdown, in milliseconds.
    pub shutdown_timeout: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: WorkerCount::default(),
            strategy: ClusterStrategy::default(),
            worker_command: "janus-worker".to_string(),
            resources: ClusterResources::default(),
            auto_respawn: true,
            max_restarts: 5,
            restart_window: 60_000,
            restart_delay: 1_000,
            startup_timeout: 30_000,
            check_interval: 5_000,
            shutdown_timeout: 30_000,
        }
    }
}

impl ClusterSettings {
    pub fn validate(&self) -> Result<(), String> {
        if let WorkerCount::Auto(ref s) = self.workers {
            if s != "auto" {
                return Err(format!(
                    "cluster.workers must be a number or \"auto\", got \"{}\"",
                    s
                ));
            }
        }
        if self.worker_command.is_empty() {
            return Err("cluster.workerCommand cannot be empty".to_string());
        }
        if !(-20..=19).contains(&self.resources.priority) {
            return Err("cluster.resources.priority must be between -20 and 19".to_string());
        }
        if self.max_restarts == 0 {
            return Err("cluster.maxRestarts must be at least 1".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// requestManagement.*
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    pub enabled: bool,
    /// Default per-request deadline, in milliseconds.
    pub default_timeout: u64,
    /// Per-route overrides, keyed by route pattern.
    pub routes: ahash::HashMap<String, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout: 30_000,
            routes: ahash::HashMap::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct PayloadSettings {
    /// Maximum request body size, in bytes.
    pub max_body_size: usize,
    /// Maximum URL length (path + query), in bytes.
    pub max_url_length: usize,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
            max_url_length: 8 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencySettings {
    pub max_concurrent_requests: usize,
    #[serde(rename = "maxPerIP")]
    pub max_per_ip: usize,
    /// Requests allowed to wait for an admission slot. `0` means no queue.
    pub max_queue_size: usize,
    /// How long a queued request may wait, in milliseconds.
    pub queue_timeout: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1_000,
            max_per_ip: 100,
            max_queue_size: 1_000,
            queue_timeout: 5_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u64,
    /// Time the breaker stays open before probing, in milliseconds.
    pub reset_timeout: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout: 30_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceSettings {
    pub retry_enabled: bool,
    pub max_retries: u32,
    /// Base retry delay in milliseconds; doubles per attempt.
    pub retry_delay: u64,
    /// When true, every failed attempt feeds the circuit breaker
    /// (retry-then-trip). When false only the final attempt counts.
    pub count_retries_in_breaker: bool,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_retries: 2,
            retry_delay: 100,
            count_retries_in_breaker: true,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkQualitySettings {
    pub enabled: bool,
    pub reject_on_poor_connection: bool,
    /// Minimum acceptable estimated bandwidth, bytes/sec.
    pub min_bandwidth: u64,
    /// Maximum acceptable average latency, in milliseconds.
    pub max_latency: u64,
}

impl Default for NetworkQualitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            reject_on_poor_connection: true,
            min_bandwidth: 0,
            max_latency: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestManagement {
    pub timeout: TimeoutSettings,
    pub payload: PayloadSettings,
    pub concurrency: ConcurrencySettings,
    pub resilience: ResilienceSettings,
    pub network_quality: NetworkQualitySettings,
}

impl RequestManagement {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout.enabled && self.timeout.default_timeout == 0 {
            return Err("requestManagement.timeout.defaultTimeout must be positive".to_string());
        }
        if self.payload.max_body_size == 0 {
            return Err("requestManagement.payload.maxBodySize must be positive".to_string());
        }
        if self.payload.max_url_length == 0 {
            return Err("requestManagement.payload.maxUrlLength must be positive".to_string());
        }
        if self.concurrency.max_concurrent_requests == 0 {
            return Err(
                "requestManagement.concurrency.maxConcurrentRequests must be positive".to_string(),
            );
        }
        if self.resilience.max_retries > 10 {
            return Err("requestManagement.resilience.maxRetries should not exceed 10".to_string());
        }
        if self.resilience.circuit_breaker.enabled
            && self.resilience.circuit_breaker.failure_threshold == 0
        {
            return Err(
                "requestManagement.resilience.circuitBreaker.failureThreshold must be positive"
                    .to_string(),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// network.*
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitGlobal {
    /// Requests allowed per window.
    pub requests: u64,
    /// Window length, in milliseconds.
    pub window: u64,
}

impl Default for RateLimitGlobal {
    fn default() -> Self {
        Self {
            requests: 100,
            window: 60_000,
        }
    }
}

/// Key the limiter counts by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    /// One counter per client IP.
    PerIp,
    /// One counter per (IP, route) pair.
    PerIpRoute,
}

impl Default for RateLimitStrategy {
    fn default() -> Self {
        Self::PerIp
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub strategy: RateLimitStrategy,
    pub global: RateLimitGlobal,
}

/// One reverse-proxy upstream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> usize {
    64
}

impl UpstreamSettings {
    /// `host:port` key used by breakers, balancers, and health state.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSettings {
    /// Probe path requested on each upstream.
    pub path: String,
    /// Probe period, in milliseconds.
    pub interval: u64,
    /// Per-probe timeout, in milliseconds.
    pub timeout: u64,
    /// Consecutive probe failures before an upstream is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive probe successes before it is restored.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: 10_000,
            timeout: 2_000,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Upstream selection strategy for proxied routes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    IpHash,
}

impl Default for ProxyStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub upstreams: Vec<UpstreamSettings>,
    pub load_balancing: ProxyStrategy,
    /// Route patterns served by the upstream pool instead of workers.
    pub routes: Vec<String>,
    pub health_check: HealthCheckSettings,
    /// Per-proxied-request timeout, in milliseconds.
    pub timeout: u64,
    /// `fail` returns 502 immediately; `retry` applies the resilience policy.
    pub on_error: ProxyErrorMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyErrorMode {
    Fail,
    Retry,
}

impl Default for ProxyErrorMode {
    fn default() -> Self {
        Self::Retry
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            upstreams: Vec::new(),
            load_balancing: ProxyStrategy::default(),
            routes: Vec::new(),
            health_check: HealthCheckSettings::default(),
            timeout: 30_000,
            on_error: ProxyErrorMode::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Preference-ordered list drawn from `br`, `gzip`, `deflate`.
    pub algorithms: Vec<String>,
    /// Encoder effort level (1-9 scale, mapped per algorithm).
    pub level: u32,
    /// Minimum response size worth compressing, in bytes.
    pub threshold: usize,
    /// Content-type prefixes eligible for compression.
    pub content_types: Vec<String>,
    pub mem_level: u32,
    pub window_bits: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithms: vec!["br".to_string(), "gzip".to_string(), "deflate".to_string()],
            level: 6,
            threshold: 1024,
            content_types: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "image/svg+xml".to_string(),
            ],
            mem_level: 8,
            window_bits: 15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepAliveSettings {
    pub enabled: bool,
    /// Idle keep-alive timeout, in milliseconds.
    pub timeout: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 75_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Http2Settings {
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPoolSettings {
    /// Idle proxied connections kept per upstream host.
    pub max_idle_per_host: usize,
    /// Idle timeout for pooled connections, in milliseconds.
    pub idle_timeout: u64,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: 30_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    pub keep_alive: KeepAliveSettings,
    pub http2: Http2Settings,
    pub connection_pool: ConnectionPoolSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub rate_limit: RateLimitSettings,
    pub proxy: ProxySettings,
    pub compression: CompressionSettings,
    pub connection: ConnectionSettings,
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit.enabled {
            if self.rate_limit.global.requests == 0 {
                return Err("network.rateLimit.global.requests must be positive".to_string());
            }
            if self.rate_limit.global.window == 0 {
                return Err("network.rateLimit.global.window must be positive".to_string());
            }
        }
        if self.proxy.enabled {
            if self.proxy.upstreams.is_empty() {
                return Err("network.proxy.enabled requires at least one upstream".to_string());
            }
            for upstream in &self.proxy.upstreams {
                if upstream.host.is_empty() {
                    return Err("network.proxy.upstreams[].host cannot be empty".to_string());
                }
                if upstream.port == 0 {
                    return Err("network.proxy.upstreams[].port must be positive".to_string());
                }
                if upstream.weight == 0 {
                    return Err("network.proxy.upstreams[].weight must be positive".to_string());
                }
            }
        }
        if self.compression.enabled {
            for algo in &self.compression.algorithms {
                match algo.as_str() {
                    "br" | "gzip" | "deflate" => {}
                    other => {
                        return Err(format!(
                            "network.compression.algorithms: unknown algorithm \"{}\"",
                            other
                        ))
                    }
                }
            }
            if !(1..=9).contains(&self.compression.level) {
                return Err("network.compression.level must be between 1 and 9".to_string());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// xems.*
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct XemsPersistence {
    pub enabled: bool,
    /// Snapshot file location.
    pub path: String,
    /// Secret the snapshot key is derived from (together with the host
    /// fingerprint). Never serialized back out.
    #[serde(skip_serializing)]
    pub secret: String,
}

impl Default for XemsPersistence {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "janus-sessions.xems".to_string(),
            secret: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct XemsSettings {
    pub enable: bool,
    /// Isolation namespace sessions are created under.
    pub sandbox: String,
    /// Session lifetime, in milliseconds.
    pub ttl: u64,
    pub cookie_name: String,
    pub header_name: String,
    /// Rotate the token after each handled request.
    pub auto_rotation: bool,
    /// How long a rotated-out token stays readable, in milliseconds.
    pub grace_period: u64,
    /// Maximum live sessions before `create` fails with `VaultFull`.
    pub capacity: usize,
    pub persistence: XemsPersistence,
}

impl Default for XemsSettings {
    fn default() -> Self {
        Self {
            enable: false,
            sandbox: "default".to_string(),
            ttl: 30 * 60 * 1_000,
            cookie_name: "janus_session".to_string(),
            header_name: "x-janus-session".to_string(),
            auto_rotation: false,
            grace_period: 1_000,
            capacity: 100_000,
            persistence: XemsPersistence::default(),
        }
    }
}

impl XemsSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable {
            return Ok(());
        }
        if self.ttl == 0 {
            return Err("xems.ttl must be positive".to_string());
        }
        if self.capacity == 0 {
            return Err("xems.capacity must be positive".to_string());
        }
        if self.persistence.enabled && self.persistence.secret.is_empty() {
            return Err("xems.persistence.secret is required when persistence is enabled".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ipc.*
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct IpcSettings {
    /// Directory worker and vault sockets are created in (mode 0600 each).
    pub socket_dir: String,
    /// Hard cap on a single frame. Larger bodies must stream.
    pub max_frame_size: usize,
    /// PING period, in milliseconds. A peer missing two intervals is dead.
    pub heartbeat_interval: u64,
    /// Bytes-in-flight cap per streamed body.
    pub stream_window: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_dir: "/tmp/janus".to_string(),
            max_frame_size: 16 * 1024 * 1024,
            heartbeat_interval: 5_000,
            stream_window: 64 * 1024,
        }
    }
}

impl IpcSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_dir.is_empty() {
            return Err("ipc.socketDir cannot be empty".to_string());
        }
        if self.max_frame_size < 1024 {
            return Err("ipc.maxFrameSize must be at least 1 KiB".to_string());
        }
        if self.heartbeat_interval == 0 {
            return Err("ipc.heartbeatInterval must be positive".to_string());
        }
        Ok(())
    }

    /// Socket path for a worker id.
    pub fn worker_socket(&self, worker_id: u32) -> std::path::PathBuf {
        std::path::Path::new(&self.socket_dir).join(format!("worker-{}.sock", worker_id))
    }

    /// Socket path for the vault sidecar.
    pub fn vault_socket(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.socket_dir).join("vault.sock")
    }
}

// ---------------------------------------------------------------------------
// pluginPermissions[]
// ---------------------------------------------------------------------------

/// Allow/deny hook lists for one plugin.
///
/// Deny wins over allow; an empty allow list means "all hooks not denied".
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginPermission {
    pub plugin: String,
    pub allowed_hooks: Vec<String>,
    pub denied_hooks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_is_valid() {
        let settings: Settings = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.cluster.workers, WorkerCount::Count(1));
    }

    #[test]
    fn worker_count_accepts_auto() {
        let settings: Settings =
            serde_json::from_str(r#"{"version": 1, "cluster": {"workers": "auto"}}"#).unwrap();
        assert!(settings.validate().is_ok());
        assert!(settings.cluster.workers.resolve() >= 1);
    }

    #[test]
    fn worker_count_rejects_other_strings() {
        let settings: Settings =
            serde_json::from_str(r#"{"version": 1, "cluster": {"workers": "many"}}"#).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn proxy_requires_upstreams() {
        let settings: Settings =
            serde_json::from_str(r#"{"version": 1, "network": {"proxy": {"enabled": true}}}"#)
                .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let doc = r#"{
            "version": 1,
            "requestManagement": {
                "payload": { "maxBodySize": 1024, "maxUrlLength": 256 },
                "concurrency": { "maxConcurrentRequests": 10, "maxPerIP": 2 }
            },
            "xems": { "enable": true, "gracePeriod": 500 }
        }"#;
        let settings: Settings = serde_json::from_str(doc).unwrap();
        assert_eq!(settings.request_management.payload.max_body_size, 1024);
        assert_eq!(settings.request_management.concurrency.max_per_ip, 2);
        assert_eq!(settings.xems.grace_period, 500);
    }

    #[test]
    fn timeout_route_overrides_parse() {
        let doc = r#"{
            "version": 1,
            "requestManagement": {
                "timeout": { "enabled": true, "defaultTimeout": 30000, "routes": { "/sleep": 100 } }
            }
        }"#;
        let settings: Settings = serde_json::from_str(doc).unwrap();
        assert_eq!(settings.request_management.timeout.routes["/sleep"], 100);
    }
}
