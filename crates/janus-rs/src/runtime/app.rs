//! Route registration and the built application.
//!
//! [`AppRouter`] is the mutable registration surface: routes, router-scoped
//! middleware, and sub-router mounts. [`App`] pairs a router with the plugin
//! pipeline; building it compiles everything into the radix table and seals
//! the registration window.

use std::sync::Arc;

use crate::models::settings::PluginPermission;
use crate::plugins::PluginManager;
use crate::routing::{RouteTable, RouterError};

use super::message::{Handler, HandlerChain, Middleware};

/// One registered route before compilation.
struct RouteSpec {
    methods: Vec<String>,
    pattern: String,
    /// Middleware inherited from mounted sub-routers; runs before the
    /// owning router's scoped chain.
    inherited: Vec<Arc<dyn Middleware>>,
    /// Route-specific middleware; runs last before the handler.
    own: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
    timeout_ms: Option<u64>,
}

/// Compiled leaf stored in the radix table.
#[derive(Clone)]
pub struct RouteEntry {
    pub chain: HandlerChain,
    /// Per-route deadline override, in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// The mutable route registration surface.
///
/// Scoped middleware added with [`use_middleware`] wraps every route this
/// router owns. Mounting a sub-router splices its routes under a prefix;
/// the sub-router's scoped middleware runs ahead of the parent's for those
/// routes.
///
/// [`use_middleware`]: AppRouter::use_middleware
#[derive(Default)]
pub struct AppRouter {
    middleware: Vec<Arc<dyn Middleware>>,
    routes: Vec<RouteSpec>,
}

impl AppRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds router-scoped middleware.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Registers a handler for `methods` on `pattern`.
    pub fn route(
        &mut self,
        methods: &[&str],
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.route_with(methods, pattern, Vec::new(), handler, None)
    }

    /// Full-form registration with route middleware and a timeout override.
    pub fn route_with(
        &mut self,
        methods: &[&str],
        pattern: &str,
        middleware: Vec<Arc<dyn Middleware>>,
        handler: Arc<dyn Handler>,
        timeout_ms: Option<u64>,
    ) -> &mut Self {
        self.routes.push(RouteSpec {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            pattern: pattern.to_string(),
            inherited: Vec::new(),
            own: middleware,
            handler,
            timeout_ms,
        });
        self
    }

    pub fn get(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.route(&["GET"], pattern, handler)
    }

    pub fn post(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.route(&["POST"], pattern, handler)
    }

    pub fn put(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.route(&["PUT"], pattern, handler)
    }

    pub fn delete(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.route(&["DELETE"], pattern, handler)
    }

    /// Splices `sub` under `prefix`. Sub-router scoped middleware stays
    /// ahead of this router's scoped chain for the spliced routes, so a
    /// mounted API keeps its own interception order.
    pub fn mount(&mut self, prefix: &str, sub: AppRouter) -> &mut Self {
        for mut spec in sub.routes {
            spec.pattern = join_patterns(prefix, &spec.pattern);
            let mut inherited = spec.inherited;
            let mut folded: Vec<Arc<dyn Middleware>> = Vec::new();
            folded.append(&mut inherited);
            folded.extend(sub.middleware.iter().cloned());
            spec.inherited = folded;
            self.routes.push(spec);
        }
        self
    }

    /// Number of registered routes (method multiplicity not counted).
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Compiles the registrations into a radix table.
    pub fn build(self) -> Result<RouteTable<RouteEntry>, RouterError> {
        let mut table = RouteTable::new();
        for spec in &self.routes {
            let mut middleware = spec.inherited.clone();
            middleware.extend(self.middleware.iter().cloned());
            middleware.extend(spec.own.iter().cloned());
            let entry = RouteEntry {
                chain: HandlerChain {
                    middleware,
                    handler: Arc::clone(&spec.handler),
                },
                timeout_ms: spec.timeout_ms,
            };
            for method in &spec.methods {
                table.insert(method, &spec.pattern, entry.clone())?;
            }
        }
        Ok(table)
    }
}

fn join_patterns(prefix: &str, pattern: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let pattern = pattern.trim_start_matches('/');
    if pattern.is_empty() {
        if prefix.is_empty() {
            "/".to_string()
        } else {
            prefix.to_string()
        }
    } else {
        format!("{}/{}", prefix, pattern)
    }
}

/// An application: routes plus the plugin pipeline, pre-start.
pub struct App {
    pub router: AppRouter,
    pub plugins: PluginManager,
}

/// The immutable, serving-time application.
pub struct BuiltApp {
    pub table: RouteTable<RouteEntry>,
    pub plugins: Arc<PluginManager>,
}

impl App {
    pub fn new(permissions: &[PluginPermission]) -> Self {
        Self {
            router: AppRouter::new(),
            plugins: PluginManager::new(permissions),
        }
    }

    /// Collects plugin routes, seals the pipeline, compiles the table.
    /// After this the registration window is closed for good.
    pub fn build(mut self) -> Result<BuiltApp, RouterError> {
        self.plugins.collect_routes(&mut self.router);
        self.plugins.seal();
        let table = self.router.build()?;
        Ok(BuiltApp {
            table,
            plugins: Arc::new(self.plugins),
        })
    }
}
