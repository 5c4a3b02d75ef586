//! Pipeline behavior through the dispatcher: ordering, permission gating,
//! short-circuits, and the reverse-order error chain.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use janus_rs::models::settings::PluginPermission;
use janus_rs::plugins::{Hook, HookError, Plugin, PluginPriority};
use janus_rs::runtime::{handler_fn, App, Dispatcher, HandlerError, HookFlow, Request, Response};

fn request(method: &str, path: &str) -> Request {
    Request {
        id: Uuid::new_v4(),
        method: method.to_string(),
        path: path.to_string(),
        query: vec![],
        headers: vec![],
        body: Bytes::new(),
        peer_ip: "127.0.0.1".to_string(),
        deadline_ms: u64::MAX,
        params: Default::default(),
        session: None,
    }
}

struct Tracer {
    name: String,
    priority: PluginPriority,
    log: Arc<Mutex<Vec<String>>>,
    respond_with: Option<u16>,
    handle_errors: bool,
}

impl Tracer {
    fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            priority: PluginPriority::Normal,
            log: Arc::clone(log),
            respond_with: None,
            handle_errors: false,
        }
    }

    fn trace(&self, event: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
    }
}

#[async_trait]
impl Plugin for Tracer {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> PluginPriority {
        self.priority
    }

    async fn on_request(&self, _req: &mut Request) -> Result<HookFlow, HookError> {
        self.trace("request");
        if let Some(status) = self.respond_with {
            return Ok(HookFlow::Respond(Response::text(status, "short-circuit")));
        }
        Ok(HookFlow::Continue)
    }

    async fn on_response(&self, _req: &Request, res: &mut Response) -> Result<(), HookError> {
        self.trace("response");
        res.headers
            .push((format!("x-{}", self.name), "seen".to_string()));
        Ok(())
    }

    async fn on_error(
        &self,
        _err: &HandlerError,
        _req: &Request,
    ) -> Result<Option<Response>, HookError> {
        self.trace("error");
        if self.handle_errors {
            return Ok(Some(Response::text(503, "handled by plugin")));
        }
        Ok(None)
    }
}

fn app_with(
    plugins: Vec<Tracer>,
    permissions: &[PluginPermission],
    failing_route: bool,
) -> Dispatcher {
    let mut app = App::new(permissions);
    for plugin in plugins {
        app.plugins.register(Arc::new(plugin)).unwrap();
    }
    if failing_route {
        app.router.get(
            "/work",
            handler_fn(|_req| Box::pin(async move { Err(HandlerError::failed("kaboom")) })),
        );
    } else {
        app.router.get(
            "/work",
            handler_fn(|_req| Box::pin(async move { Ok(Response::text(200, "done")) })),
        );
    }
    Dispatcher::new(Arc::new(app.build().unwrap()), None)
}

#[tokio::test]
async fn request_hooks_run_in_priority_then_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut late = Tracer::new("late", &log);
    late.priority = PluginPriority::Last;
    let mut early = Tracer::new("early", &log);
    early.priority = PluginPriority::First;
    let plain_a = Tracer::new("a", &log);
    let plain_b = Tracer::new("b", &log);

    let dispatcher = app_with(vec![late, plain_a, early, plain_b], &[], false);
    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    assert_eq!(resp.status, 200);

    let events = log.lock().unwrap().clone();
    let request_events: Vec<&String> =
        events.iter().filter(|e| e.ends_with(":request")).collect();
    assert_eq!(
        request_events,
        vec!["early:request", "a:request", "b:request", "late:request"]
    );
}

#[tokio::test]
async fn short_circuit_skips_routing_but_not_response_hooks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut gatekeeper = Tracer::new("gate", &log);
    gatekeeper.respond_with = Some(401);
    let after = Tracer::new("after", &log);

    let dispatcher = app_with(vec![gatekeeper, after], &[], false);
    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    assert_eq!(resp.status, 401);
    assert_eq!(resp.header("x-after"), Some("seen"));

    let events = log.lock().unwrap().clone();
    // The second plugin's request hook never ran.
    assert!(!events.contains(&"after:request".to_string()));
}

#[tokio::test]
async fn error_hooks_run_in_reverse_until_one_responds() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut first = Tracer::new("first", &log);
    first.handle_errors = true;
    let second = Tracer::new("second", &log);

    let dispatcher = app_with(vec![first, second], &[], true);
    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    // "second" is later in the chain, so its error hook runs first; it
    // declines and "first" answers.
    assert_eq!(resp.status, 503);
    let events = log.lock().unwrap().clone();
    let error_events: Vec<&String> = events.iter().filter(|e| e.ends_with(":error")).collect();
    assert_eq!(error_events, vec!["second:error", "first:error"]);
}

#[tokio::test]
async fn unhandled_errors_become_opaque_500() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bystander = Tracer::new("bystander", &log);

    let dispatcher = app_with(vec![bystander], &[], true);
    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    assert_eq!(resp.status, 500);
    let body = String::from_utf8(resp.body.to_vec()).unwrap();
    assert!(!body.contains("kaboom"));
}

#[tokio::test]
async fn permission_invariant_gates_invocation_exactly() {
    // Hook H on plugin P runs iff H is not denied and (allow empty or H
    // allowed).
    let log = Arc::new(Mutex::new(Vec::new()));
    let restricted = Tracer::new("restricted", &log);
    let permissions = vec![PluginPermission {
        plugin: "restricted".to_string(),
        allowed_hooks: vec!["onResponse".to_string()],
        denied_hooks: vec![],
    }];

    let dispatcher = app_with(vec![restricted], &permissions, false);
    assert!(dispatcher.app().plugins.allows("restricted", Hook::Response));
    assert!(!dispatcher.app().plugins.allows("restricted", Hook::Request));

    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    assert_eq!(resp.status, 200);

    let events = log.lock().unwrap().clone();
    assert!(events.contains(&"restricted:response".to_string()));
    assert!(!events.contains(&"restricted:request".to_string()));
}

#[tokio::test]
async fn hook_failure_feeds_the_error_chain() {
    struct Exploder;

    #[async_trait]
    impl Plugin for Exploder {
        fn name(&self) -> &str {
            "exploder"
        }

        async fn on_request(&self, _req: &mut Request) -> Result<HookFlow, HookError> {
            Err(HookError {
                plugin: "exploder".to_string(),
                message: "refused".to_string(),
            })
        }
    }

    let mut app = App::new(&[]);
    app.plugins.register(Arc::new(Exploder)).unwrap();
    app.router.get(
        "/work",
        handler_fn(|_req| Box::pin(async move { Ok(Response::text(200, "never")) })),
    );
    let dispatcher = Dispatcher::new(Arc::new(app.build().unwrap()), None);

    let resp = dispatcher
        .dispatch(request("GET", "/work"), CancellationToken::new())
        .await;
    assert_eq!(resp.status, 500);
}
