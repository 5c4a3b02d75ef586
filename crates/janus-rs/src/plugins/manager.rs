//! Plugin registration, ordering, permission gating, and hook timing.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::models::settings::PluginPermission;
use crate::runtime::message::{HandlerError, HookFlow, Request, Response};

use super::{
    Hook, HookError, PerformanceSnapshot, Plugin, PluginPriority, RateLimitInfo, RequestTiming,
    RouteErrorInfo, ThreatInfo,
};

/// Errors raised at registration time.
#[derive(Error, Debug, PartialEq)]
pub enum PluginError {
    /// The registration window closed when the server started.
    #[error("Cannot register plugin {plugin}: the server has started")]
    Sealed { plugin: String },

    /// Two plugins share a name; permissions are keyed by name.
    #[error("Plugin name {plugin} is already registered")]
    DuplicateName { plugin: String },
}

/// One timed hook invocation.
#[derive(Debug, Clone)]
pub struct HookTiming {
    pub plugin: String,
    pub hook: Hook,
    pub duration_us: u64,
}

/// Fixed-capacity ring of recent hook timings.
#[derive(Debug)]
pub struct TimingRing {
    entries: Mutex<VecDeque<HookTiming>>,
    capacity: usize,
}

impl TimingRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, timing: HookTiming) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(timing);
    }

    pub fn snapshot(&self) -> Vec<HookTiming> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Total microseconds spent in hooks since the last call site cares to
    /// diff; convenience for the timing hook payload.
    pub fn total_us(&self) -> u64 {
        self.entries.lock().iter().map(|t| t.duration_us).sum()
    }
}

/// Compiled allow/deny matrix, keyed by plugin name.
#[derive(Debug, Default)]
struct PermissionMatrix {
    rules: ahash::HashMap<String, (Vec<String>, Vec<String>)>,
}

impl PermissionMatrix {
    fn new(permissions: &[PluginPermission]) -> Self {
        let mut rules = ahash::HashMap::default();
        for p in permissions {
            rules.insert(
                p.plugin.clone(),
                (p.allowed_hooks.clone(), p.denied_hooks.clone()),
            );
        }
        Self { rules }
    }

    /// A hook runs iff it is not denied and either the allow list is empty
    /// or names it. Plugins without an entry may run everything.
    fn allows(&self, plugin: &str, hook: Hook) -> bool {
        match self.rules.get(plugin) {
            None => true,
            Some((allowed, denied)) => {
                let name = hook.name();
                if denied.iter().any(|h| h == name) {
                    return false;
                }
                allowed.is_empty() || allowed.iter().any(|h| h == name)
            }
        }
    }
}

/// The pipeline: an ordered plugin chain plus its permission matrix.
///
/// Registration happens during setup on `&mut self`; after [`seal`] the
/// manager is shared immutably (`Arc`) across request tasks.
///
/// [`seal`]: PluginManager::seal
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    permissions: PermissionMatrix,
    timings: TimingRing,
    sealed: bool,
}

impl PluginManager {
    pub fn new(permissions: &[PluginPermission]) -> Self {
        Self {
            plugins: Vec::new(),
            permissions: PermissionMatrix::new(permissions),
            timings: TimingRing::new(1024),
            sealed: false,
        }
    }

    /// Adds a plugin to the chain. Registration is never permission-gated,
    /// only invocation is.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.sealed {
            return Err(PluginError::Sealed {
                plugin: plugin.name().to_string(),
            });
        }
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(PluginError::DuplicateName {
                plugin: plugin.name().to_string(),
            });
        }
        debug!("Registered plugin {} v{}", plugin.name(), plugin.version());
        self.plugins.push(plugin);
        Ok(())
    }

    /// Closes the registration window and freezes the chain order:
    /// First bucket, then Normal, then Last, stable within each.
    pub fn seal(&mut self) {
        self.plugins
            .sort_by_key(|p| p.priority());
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Whether `plugin` may run `hook` under the configured matrix.
    pub fn allows(&self, plugin: &str, hook: Hook) -> bool {
        self.permissions.allows(plugin, hook)
    }

    pub fn timings(&self) -> &TimingRing {
        &self.timings
    }

    /// The frozen chain, in pipeline order.
    pub fn chain(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    fn permitted(&self, hook: Hook) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .filter(move |p| self.permissions.allows(p.name(), hook))
    }

    fn record(&self, plugin: &str, hook: Hook, started: Instant) {
        self.timings.record(HookTiming {
            plugin: plugin.to_string(),
            hook,
            duration_us: started.elapsed().as_micros() as u64,
        });
    }

    // -- lifecycle drivers --------------------------------------------------

    pub async fn fire_registered(&self) {
        for plugin in self.permitted(Hook::Register) {
            plugin.on_register().await;
        }
    }

    pub async fn fire_server_start(&self) {
        for plugin in self.permitted(Hook::ServerStart) {
            let started = Instant::now();
            plugin.on_server_start().await;
            self.record(plugin.name(), Hook::ServerStart, started);
        }
    }

    pub async fn fire_server_ready(&self) {
        for plugin in self.permitted(Hook::ServerReady) {
            plugin.on_server_ready().await;
        }
    }

    pub async fn fire_server_stop(&self) {
        for plugin in self.permitted(Hook::ServerStop) {
            plugin.on_server_stop().await;
        }
    }

    /// Splices plugin-contributed routes into the router. Runs before seal,
    /// during app construction.
    pub fn collect_routes(&self, router: &mut crate::runtime::app::AppRouter) {
        for plugin in &self.plugins {
            if self.permissions.allows(plugin.name(), Hook::RegisterRoutes) {
                plugin.register_routes(router);
            }
        }
    }

    // -- request-path drivers ----------------------------------------------

    /// Runs `onRequest` hooks in order. A `Respond` short-circuits; a hook
    /// error aborts the walk and is handed to the error chain by the caller.
    pub async fn run_request_hooks(
        &self,
        req: &mut Request,
    ) -> Result<Option<Response>, HookError> {
        for plugin in self.permitted(Hook::Request) {
            let started = Instant::now();
            let outcome = plugin.on_request(req).await;
            self.record(plugin.name(), Hook::Request, started);
            match outcome? {
                HookFlow::Continue => {}
                HookFlow::Respond(response) => return Ok(Some(response)),
            }
        }
        Ok(None)
    }

    /// Runs `onResponse` hooks in order. Hook errors here are logged and
    /// swallowed: the response is already decided.
    pub async fn run_response_hooks(&self, req: &Request, res: &mut Response) {
        for plugin in self.permitted(Hook::Response) {
            let started = Instant::now();
            if let Err(e) = plugin.on_response(req, res).await {
                warn!("onResponse hook failed: {}", e);
            }
            self.record(plugin.name(), Hook::Response, started);
        }
    }

    /// Runs `onError` hooks in reverse pipeline order until one writes a
    /// response. Returns that response, or `None` when nobody handled it.
    pub async fn run_error_hooks(
        &self,
        err: &HandlerError,
        req: &Request,
    ) -> Option<Response> {
        let permitted: Vec<&Arc<dyn Plugin>> = self.permitted(Hook::Error).collect();
        for plugin in permitted.into_iter().rev() {
            let started = Instant::now();
            let outcome = plugin.on_error(err, req).await;
            self.record(plugin.name(), Hook::Error, started);
            match outcome {
                Ok(Some(response)) => return Some(response),
                Ok(None) => {}
                Err(e) => warn!("onError hook itself failed: {}", e),
            }
        }
        None
    }

    // -- notification drivers ----------------------------------------------

    pub async fn notify_rate_limit(&self, info: &RateLimitInfo, peer_ip: &str, path: &str) {
        for plugin in self.permitted(Hook::RateLimit) {
            plugin.on_rate_limit(info, peer_ip, path).await;
        }
    }

    pub async fn notify_security_threat(&self, threat: &ThreatInfo, peer_ip: &str, path: &str) {
        for plugin in self.permitted(Hook::SecurityThreat) {
            plugin.on_security_threat(threat, peer_ip, path).await;
        }
    }

    pub async fn notify_request_timing(
        &self,
        timing: &RequestTiming,
        req: &Request,
        res: &Response,
    ) {
        for plugin in self.permitted(Hook::RequestTiming) {
            plugin.on_request_timing(timing, req, res).await;
        }
    }

    pub async fn notify_route_error(&self, info: &RouteErrorInfo, req: &Request) {
        for plugin in self.permitted(Hook::RouteError) {
            plugin.on_route_error(info, req).await;
        }
    }

    pub async fn notify_performance_metrics(&self, metrics: &PerformanceSnapshot) {
        for plugin in self.permitted(Hook::PerformanceMetrics) {
            plugin.on_performance_metrics(metrics).await;
        }
    }

    pub fn notify_console_intercept(&self, line: &str) {
        for plugin in self.permitted(Hook::ConsoleIntercept) {
            plugin.on_console_intercept(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: String,
        priority: PluginPriority,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> PluginPriority {
            self.priority
        }

        async fn on_request(&self, _req: &mut Request) -> Result<HookFlow, HookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HookFlow::Continue)
        }
    }

    fn recorder(name: &str, priority: PluginPriority) -> (Arc<Recorder>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Recorder {
                name: name.to_string(),
                priority,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    #[test]
    fn registration_window_closes_at_seal() {
        let mut manager = PluginManager::new(&[]);
        let (plugin, _) = recorder("late", PluginPriority::Normal);
        manager.seal();
        assert_eq!(
            manager.register(plugin),
            Err(PluginError::Sealed {
                plugin: "late".to_string()
            })
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut manager = PluginManager::new(&[]);
        let (a, _) = recorder("dup", PluginPriority::Normal);
        let (b, _) = recorder("dup", PluginPriority::Normal);
        manager.register(a).unwrap();
        assert!(matches!(
            manager.register(b),
            Err(PluginError::DuplicateName { .. })
        ));
    }

    #[test]
    fn priority_buckets_partition_the_chain() {
        let mut manager = PluginManager::new(&[]);
        let (n1, _) = recorder("n1", PluginPriority::Normal);
        let (last, _) = recorder("last", PluginPriority::Last);
        let (first, _) = recorder("first", PluginPriority::First);
        let (n2, _) = recorder("n2", PluginPriority::Normal);
        for p in [n1, last, first, n2] {
            manager.register(p).unwrap();
        }
        manager.seal();
        let order: Vec<&str> = manager.chain().iter().map(|p| p.name()).collect();
        assert_eq!(order, vec!["first", "n1", "n2", "last"]);
    }

    #[test]
    fn permission_matrix_denied_wins_over_allowed() {
        let perms = vec![PluginPermission {
            plugin: "p".to_string(),
            allowed_hooks: vec!["onRequest".to_string()],
            denied_hooks: vec!["onRequest".to_string()],
        }];
        let manager = PluginManager::new(&perms);
        assert!(!manager.allows("p", Hook::Request));
    }

    #[test]
    fn empty_allow_list_means_everything_not_denied() {
        let perms = vec![PluginPermission {
            plugin: "p".to_string(),
            allowed_hooks: vec![],
            denied_hooks: vec!["onError".to_string()],
        }];
        let manager = PluginManager::new(&perms);
        assert!(manager.allows("p", Hook::Request));
        assert!(manager.allows("p", Hook::Response));
        assert!(!manager.allows("p", Hook::Error));
    }

    #[test]
    fn nonempty_allow_list_is_exclusive() {
        let perms = vec![PluginPermission {
            plugin: "p".to_string(),
            allowed_hooks: vec!["onResponse".to_string()],
            denied_hooks: vec![],
        }];
        let manager = PluginManager::new(&perms);
        assert!(manager.allows("p", Hook::Response));
        assert!(!manager.allows("p", Hook::Request));
        // Unlisted plugins are unrestricted.
        assert!(manager.allows("other", Hook::Request));
    }

    #[tokio::test]
    async fn denied_request_hook_is_silently_skipped() {
        let perms = vec![PluginPermission {
            plugin: "denied".to_string(),
            allowed_hooks: vec![],
            denied_hooks: vec!["onRequest".to_string()],
        }];
        let mut manager = PluginManager::new(&perms);
        let (denied, denied_calls) = recorder("denied", PluginPriority::Normal);
        let (open, open_calls) = recorder("open", PluginPriority::Normal);
        manager.register(denied).unwrap();
        manager.register(open).unwrap();
        manager.seal();

        let mut req = crate::runtime::message::Request {
            id: uuid::Uuid::new_v4(),
            method: "GET".to_string(),
            path: "/".to_string(),
            query: vec![],
            headers: vec![],
            body: bytes::Bytes::new(),
            peer_ip: "127.0.0.1".to_string(),
            deadline_ms: u64::MAX,
            params: Default::default(),
            session: None,
        };
        let outcome = manager.run_request_hooks(&mut req).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(denied_calls.load(Ordering::SeqCst), 0);
        assert_eq!(open_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timing_ring_caps_at_capacity() {
        let ring = TimingRing::new(4);
        for i in 0..10 {
            ring.record(HookTiming {
                plugin: format!("p{}", i),
                hook: Hook::Request,
                duration_us: i,
            });
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].plugin, "p6");
    }
}
