//! Comprehensive configuration validation with detailed reporting.
//!
//! `Settings::validate` catches the hard errors; this pass layers on the
//! cross-cutting checks and the advisory output printed at startup:
//! warnings for configurations that will run but probably should not, and
//! recommendations worth considering. Errors here are fatal (exit code 1).

use log::{info, warn};
use std::collections::HashSet;

use crate::models::settings::Settings;

/// Outcome of a validation pass: errors, warnings, recommendations.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the configuration may be used.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_recommendation(&mut self, recommendation: String) {
        self.recommendations.push(recommendation);
    }

    /// Logs warnings and recommendations; errors are the caller's problem.
    pub fn report(&self) {
        for warning in &self.warnings {
            warn!("config: {}", warning);
        }
        for recommendation in &self.recommendations {
            info!("config hint: {}", recommendation);
        }
    }
}

/// The comprehensive validation pass.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = settings.validate() {
            result.add_error(e);
        }

        Self::check_admission(settings, &mut result);
        Self::check_timeouts(settings, &mut result);
        Self::check_cluster(settings, &mut result);
        Self::check_proxy(settings, &mut result);
        Self::check_xems(settings, &mut result);
        Self::check_plugin_permissions(settings, &mut result);
        result
    }

    fn check_admission(settings: &Settings, result: &mut ValidationResult) {
        let concurrency = &settings.request_management.concurrency;
        if concurrency.max_per_ip > concurrency.max_concurrent_requests {
            result.add_warning(format!(
                "maxPerIP ({}) exceeds maxConcurrentRequests ({}); the per-IP cap can never bind",
                concurrency.max_per_ip, concurrency.max_concurrent_requests
            ));
        }
        if concurrency.max_queue_size > 0 && concurrency.queue_timeout == 0 {
            result.add_warning(
                "queueTimeout of 0 with a non-empty queue makes queued requests fail immediately"
                    .to_string(),
            );
        }
        let payload = &settings.request_management.payload;
        if payload.max_body_size > settings.ipc.max_frame_size * 64 {
            result.add_recommendation(format!(
                "maxBodySize ({} bytes) is far above the frame size; large uploads will stream in many chunks",
                payload.max_body_size
            ));
        }
    }

    fn check_timeouts(settings: &Settings, result: &mut ValidationResult) {
        let timeout = &settings.request_management.timeout;
        if !timeout.enabled {
            result.add_warning(
                "request timeouts are disabled; a stuck handler will hold its slot forever"
                    .to_string(),
            );
        }
        for (route, ms) in &timeout.routes {
            if !route.starts_with('/') {
                result.add_error(format!(
                    "timeout.routes key \"{}\" must be an absolute route pattern",
                    route
                ));
            }
            if *ms == 0 {
                result.add_error(format!("timeout.routes[\"{}\"] must be positive", route));
            }
            if *ms > timeout.default_timeout && timeout.enabled {
                result.add_recommendation(format!(
                    "route {} allows {} ms, above the {} ms default",
                    route, ms, timeout.default_timeout
                ));
            }
        }
    }

    fn check_cluster(settings: &Settings, result: &mut ValidationResult) {
        let cluster = &settings.cluster;
        if !cluster.enabled {
            return;
        }
        let workers = cluster.workers.resolve();
        if workers > 64 {
            result.add_warning(format!(
                "{} workers configured; each is a full OS process",
                workers
            ));
        }
        if cluster.restart_delay >= cluster.restart_window {
            result.add_warning(
                "restartDelay is not below restartWindow; storm detection can never trip"
                    .to_string(),
            );
        }
        if cluster.resources.enforcement.hard_limits && cluster.resources.max_memory_mb == 0 {
            result.add_warning(
                "hardLimits is set but no memory limit is configured".to_string(),
            );
        }
    }

    fn check_proxy(settings: &Settings, result: &mut ValidationResult) {
        let proxy = &settings.network.proxy;
        if !proxy.enabled {
            return;
        }
        if proxy.routes.is_empty() {
            result.add_warning(
                "proxy is enabled but no routes are mapped to the upstream pool".to_string(),
            );
        }
        let mut seen = HashSet::new();
        for upstream in &proxy.upstreams {
            if !seen.insert(upstream.key()) {
                result.add_error(format!("duplicate upstream {}", upstream.key()));
            }
        }
        if proxy.health_check.interval < proxy.health_check.timeout {
            result.add_warning(
                "healthCheck.interval is below healthCheck.timeout; probes will overlap"
                    .to_string(),
            );
        }
        if !settings.request_management.resilience.circuit_breaker.enabled {
            result.add_recommendation(
                "proxying without the circuit breaker sends every request at a failing upstream"
                    .to_string(),
            );
        }
    }

    fn check_xems(settings: &Settings, result: &mut ValidationResult) {
        let xems = &settings.xems;
        if !xems.enable {
            return;
        }
        if xems.grace_period >= xems.ttl {
            result.add_error(format!(
                "xems.gracePeriod ({} ms) must be below xems.ttl ({} ms)",
                xems.grace_period, xems.ttl
            ));
        }
        if xems.auto_rotation && xems.grace_period == 0 {
            result.add_warning(
                "autoRotation with a zero grace period will break concurrent in-flight requests"
                    .to_string(),
            );
        }
        if xems.persistence.enabled && xems.persistence.secret.len() < 16 {
            result.add_warning(
                "xems.persistence.secret is short; prefer at least 16 characters".to_string(),
            );
        }
    }

    fn check_plugin_permissions(settings: &Settings, result: &mut ValidationResult) {
        let known_hooks = [
            "onRegister",
            "onServerStart",
            "onServerReady",
            "onServerStop",
            "onRequest",
            "onResponse",
            "onError",
            "onSecurityThreat",
            "onRateLimit",
            "onRequestTiming",
            "onRouteError",
            "onPerformanceMetrics",
            "onConsoleIntercept",
            "registerRoutes",
        ];
        let mut seen = HashSet::new();
        for permission in &settings.plugin_permissions {
            if permission.plugin.is_empty() {
                result.add_error("pluginPermissions[] entry with an empty plugin name".to_string());
                continue;
            }
            if !seen.insert(permission.plugin.clone()) {
                result.add_error(format!(
                    "pluginPermissions has duplicate entry for {}",
                    permission.plugin
                ));
            }
            for hook in permission
                .allowed_hooks
                .iter()
                .chain(permission.denied_hooks.iter())
            {
                if !known_hooks.contains(&hook.as_str()) {
                    result.add_warning(format!(
                        "pluginPermissions[{}] names unknown hook \"{}\"",
                        permission.plugin, hook
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::{PluginPermission, UpstreamSettings};

    #[test]
    fn default_settings_are_valid() {
        let result = ConfigValidator::validate_comprehensive(&Settings::default());
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn grace_above_ttl_is_an_error() {
        let mut settings = Settings::default();
        settings.xems.enable = true;
        settings.xems.ttl = 500;
        settings.xems.grace_period = 1_000;
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid());
    }

    #[test]
    fn duplicate_upstreams_are_an_error() {
        let mut settings = Settings::default();
        settings.network.proxy.enabled = true;
        let upstream = UpstreamSettings {
            host: "10.0.0.5".to_string(),
            port: 8080,
            weight: 1,
            max_connections: 8,
        };
        settings.network.proxy.upstreams = vec![upstream.clone(), upstream];
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid());
    }

    #[test]
    fn unknown_hook_names_warn_but_pass() {
        let mut settings = Settings::default();
        settings.plugin_permissions = vec![PluginPermission {
            plugin: "metrics".to_string(),
            allowed_hooks: vec!["onTelemetry".to_string()],
            denied_hooks: vec![],
        }];
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn relative_timeout_route_is_an_error() {
        let mut settings = Settings::default();
        settings
            .request_management
            .timeout
            .routes
            .insert("sleep".to_string(), 100);
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid());
    }

    #[test]
    fn per_ip_above_global_warns() {
        let mut settings = Settings::default();
        settings.request_management.concurrency.max_per_ip = 5_000;
        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("maxPerIP")));
    }
}
