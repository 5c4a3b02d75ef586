//! Full configuration-surface parsing: every recognized key group in one
//! document, plus the validator's verdicts on it.

use janus_rs::config::validation::ConfigValidator;
use janus_rs::models::settings::{
    ClusterStrategy, PortSwitchStrategy, ProxyStrategy, RateLimitStrategy, Settings, WorkerCount,
};

const FULL_DOCUMENT: &str = r#"{
    "version": 1,
    "server": {
        "host": "127.0.0.1",
        "port": 3000,
        "autoPortSwitch": {
            "enabled": true,
            "maxAttempts": 5,
            "strategy": "port-range",
            "portRange": [3001, 3010]
        },
        "autoKillConflict": false,
        "poweredByHeader": false
    },
    "cluster": {
        "enabled": true,
        "workers": 2,
        "strategy": "least-loaded",
        "workerCommand": "janus-worker",
        "resources": {
            "maxMemoryMb": 256,
            "maxCpuPct": 80,
            "priority": 5,
            "fileDescriptorLimit": 4096,
            "gcHint": true,
            "enforcement": { "hardLimits": true, "killGrace": 2000 }
        },
        "autoRespawn": true,
        "maxRestarts": 5,
        "restartWindow": 60000,
        "restartDelay": 1000,
        "startupTimeout": 30000,
        "checkInterval": 5000,
        "shutdownTimeout": 30000
    },
    "requestManagement": {
        "timeout": {
            "enabled": true,
            "defaultTimeout": 30000,
            "routes": { "/sleep": 100, "/reports/**": 120000 }
        },
        "payload": { "maxBodySize": 10485760, "maxUrlLength": 2048 },
        "concurrency": {
            "maxConcurrentRequests": 1000,
            "maxPerIP": 50,
            "maxQueueSize": 100,
            "queueTimeout": 5000
        },
        "resilience": {
            "retryEnabled": true,
            "maxRetries": 3,
            "retryDelay": 100,
            "countRetriesInBreaker": false,
            "circuitBreaker": {
                "enabled": true,
                "failureThreshold": 3,
                "resetTimeout": 2000
            }
        },
        "networkQuality": {
            "enabled": true,
            "rejectOnPoorConnection": true,
            "minBandwidth": 10000,
            "maxLatency": 2000
        }
    },
    "network": {
        "rateLimit": {
            "enabled": true,
            "strategy": "per-ip",
            "global": { "requests": 100, "window": 60000 }
        },
        "proxy": {
            "enabled": true,
            "upstreams": [
                { "host": "10.0.0.5", "port": 8080, "weight": 2, "maxConnections": 32 },
                { "host": "10.0.0.6", "port": 8080 }
            ],
            "loadBalancing": "weighted-round-robin",
            "routes": ["/api/**"],
            "healthCheck": {
                "path": "/health",
                "interval": 10000,
                "timeout": 2000,
                "unhealthyThreshold": 3,
                "healthyThreshold": 2
            },
            "timeout": 30000,
            "onError": "retry"
        },
        "compression": {
            "enabled": true,
            "algorithms": ["br", "gzip"],
            "level": 6,
            "threshold": 1024,
            "contentTypes": ["text/", "application/json"],
            "memLevel": 8,
            "windowBits": 15
        },
        "connection": {
            "keepAlive": { "enabled": true, "timeout": 75000 },
            "http2": { "enabled": false },
            "connectionPool": { "maxIdlePerHost": 16, "idleTimeout": 30000 }
        }
    },
    "xems": {
        "enable": true,
        "sandbox": "app",
        "ttl": 1800000,
        "cookieName": "janus_session",
        "headerName": "x-janus-session",
        "autoRotation": true,
        "gracePeriod": 1000,
        "capacity": 50000,
        "persistence": {
            "enabled": true,
            "path": "/var/lib/janus/sessions.xems",
            "secret": "a-long-enough-snapshot-secret"
        }
    },
    "ipc": {
        "socketDir": "/tmp/janus-test",
        "maxFrameSize": 16777216,
        "heartbeatInterval": 5000,
        "streamWindow": 65536
    },
    "pluginPermissions": [
        {
            "plugin": "audit",
            "allowedHooks": ["onRequest", "onResponse"],
            "deniedHooks": []
        },
        {
            "plugin": "metrics",
            "allowedHooks": [],
            "deniedHooks": ["onConsoleIntercept"]
        }
    ]
}"#;

#[test]
fn the_full_document_parses_and_validates() {
    let settings: Settings = serde_json::from_str(FULL_DOCUMENT).unwrap();
    assert!(settings.validate().is_ok());

    let result = ConfigValidator::validate_comprehensive(&settings);
    assert!(result.is_valid(), "errors: {:?}", result.errors);
}

#[test]
fn parsed_values_land_in_the_right_fields() {
    let settings: Settings = serde_json::from_str(FULL_DOCUMENT).unwrap();

    assert_eq!(settings.server.port, 3000);
    assert!(!settings.server.powered_by_header);
    assert_eq!(
        settings.server.auto_port_switch.strategy,
        PortSwitchStrategy::PortRange
    );
    assert_eq!(settings.server.auto_port_switch.port_range, Some((3001, 3010)));

    assert_eq!(settings.cluster.workers, WorkerCount::Count(2));
    assert_eq!(settings.cluster.strategy, ClusterStrategy::LeastLoaded);
    assert_eq!(settings.cluster.resources.max_memory_mb, 256);
    assert!(settings.cluster.resources.enforcement.hard_limits);

    assert_eq!(settings.request_management.timeout.routes["/sleep"], 100);
    assert_eq!(settings.request_management.concurrency.max_per_ip, 50);
    assert!(!settings.request_management.resilience.count_retries_in_breaker);
    assert_eq!(
        settings
            .request_management
            .resilience
            .circuit_breaker
            .failure_threshold,
        3
    );

    assert_eq!(settings.network.rate_limit.strategy, RateLimitStrategy::PerIp);
    assert_eq!(settings.network.proxy.upstreams.len(), 2);
    assert_eq!(settings.network.proxy.upstreams[0].weight, 2);
    assert_eq!(settings.network.proxy.upstreams[1].weight, 1);
    assert_eq!(
        settings.network.proxy.load_balancing,
        ProxyStrategy::WeightedRoundRobin
    );

    assert!(settings.xems.auto_rotation);
    assert_eq!(settings.xems.grace_period, 1000);
    assert!(settings.xems.persistence.enabled);

    assert_eq!(settings.ipc.stream_window, 65536);
    assert_eq!(settings.plugin_permissions.len(), 2);
}

#[test]
fn secrets_never_serialize_back_out() {
    let settings: Settings = serde_json::from_str(FULL_DOCUMENT).unwrap();
    let rendered = serde_json::to_string(&settings).unwrap();
    assert!(!rendered.contains("a-long-enough-snapshot-secret"));
}

#[test]
fn unknown_strategy_values_fail_to_parse() {
    let doc = r#"{ "version": 1, "cluster": { "strategy": "chaotic" } }"#;
    assert!(serde_json::from_str::<Settings>(doc).is_err());
}
