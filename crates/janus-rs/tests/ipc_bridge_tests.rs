//! Gateway-to-worker bridge over a real Unix socket: handshake,
//! correlation, body streaming, deadlines, and drain.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

use janus_rs::ipc::{WorkerBridge, WorkerListener};
use janus_rs::models::error::GatewayError;
use janus_rs::protocol::RequestRecord;
use janus_rs::runtime::dispatcher::unix_ms;
use janus_rs::runtime::{handler_fn, App, Dispatcher, Response};

const MAX_FRAME: usize = 1024 * 1024;
const WINDOW: usize = 64 * 1024;

fn test_app() -> Dispatcher {
    let mut app = App::new(&[]);
    app.router.get(
        "/ping",
        handler_fn(|_req| Box::pin(async move { Ok(Response::text(200, "pong")) })),
    );
    app.router.post(
        "/echo",
        handler_fn(|req| {
            let body = req.body.clone();
            Box::pin(async move {
                Ok(Response {
                    status: 200,
                    headers: vec![(
                        "content-type".to_string(),
                        "application/octet-stream".to_string(),
                    )],
                    body,
                })
            })
        }),
    );
    app.router.get(
        "/sleep",
        handler_fn(|_req| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Response::text(200, "late"))
            })
        }),
    );
    Dispatcher::new(Arc::new(app.build().unwrap()), None)
}

async fn start_worker(dir: &tempfile::TempDir) -> WorkerBridge {
    let socket = dir.path().join("worker-0.sock");
    let listener =
        WorkerListener::bind(0, &socket, test_app(), MAX_FRAME, WINDOW).unwrap();
    tokio::spawn(listener.serve());

    let bridge = WorkerBridge::connect(0, &socket, MAX_FRAME, WINDOW, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(bridge.await_ready(Duration::from_secs(5)).await);
    bridge
}

fn record(method: &str, path: &str, timeout_ms: u64) -> RequestRecord {
    RequestRecord {
        method: method.to_string(),
        path: path.to_string(),
        query: vec![],
        headers: vec![],
        peer_ip: "127.0.0.1".to_string(),
        deadline_ms: unix_ms() + timeout_ms,
    }
}

fn deadline(timeout_ms: u64) -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_millis(timeout_ms)
}

#[tokio::test]
async fn request_response_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    let (resp, body) = bridge
        .dispatch(&record("GET", "/ping", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(body, Bytes::from_static(b"pong"));
    assert_eq!(bridge.in_flight(), 0);
}

#[tokio::test]
async fn large_bodies_stream_in_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    // Several windows worth of body forces chunked framing both ways.
    let payload: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();
    let (resp, body) = bridge
        .dispatch(
            &record("POST", "/echo", 5_000),
            Bytes::from(payload.clone()),
            deadline(5_000),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(body.to_vec(), payload);
}

#[tokio::test]
async fn deadline_resolves_504_before_the_handler_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    let started = Instant::now();
    let result = bridge
        .dispatch(&record("GET", "/sleep", 100), Bytes::new(), deadline(100))
        .await;
    assert!(matches!(result, Err(GatewayError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(400));

    // The channel survives the cancelled request.
    let (resp, _) = bridge
        .dispatch(&record("GET", "/ping", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn worker_404_and_405_travel_as_responses() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    let (resp, _) = bridge
        .dispatch(&record("GET", "/ghost", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 404);

    let (resp, _) = bridge
        .dispatch(&record("DELETE", "/ping", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 405);
    assert!(resp
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("allow") && v == "GET"));
}

#[tokio::test]
async fn drained_worker_answers_503() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    bridge.drain().await;
    // Drain handling is asynchronous on the worker side.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (resp, _) = bridge
        .dispatch(&record("GET", "/ping", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 503);
}

#[tokio::test]
async fn concurrent_correlations_do_not_cross() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    let mut tasks = Vec::new();
    for i in 0..20usize {
        let bridge = bridge.clone();
        tasks.push(tokio::spawn(async move {
            let payload = vec![i as u8; 10_000];
            let (resp, body) = bridge
                .dispatch(
                    &record("POST", "/echo", 5_000),
                    Bytes::from(payload.clone()),
                    deadline(5_000),
                )
                .await
                .unwrap();
            assert_eq!(resp.status, 200);
            assert_eq!(body.to_vec(), payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn dead_worker_fails_fast_with_peer_dead() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("worker-1.sock");
    let listener = WorkerListener::bind(1, &socket, test_app(), MAX_FRAME, WINDOW).unwrap();
    let serve = tokio::spawn(listener.serve());

    let bridge = WorkerBridge::connect(1, &socket, MAX_FRAME, WINDOW, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(bridge.await_ready(Duration::from_secs(5)).await);

    // Kill the worker task; the socket goes down with it.
    serve.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = bridge
        .dispatch(&record("GET", "/ping", 1_000), Bytes::new(), deadline(1_000))
        .await;
    assert!(matches!(result, Err(GatewayError::IpcPeerDead)));
    assert!(!bridge.is_alive());
}

#[tokio::test]
async fn worker_honors_cancel_frames() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = start_worker(&dir).await;

    // Deadline expiry emits CANCEL; the slow handler is aborted worker-side
    // and the slot frees without waiting out the full sleep.
    let result = bridge
        .dispatch(&record("GET", "/sleep", 50), Bytes::new(), deadline(50))
        .await;
    assert!(matches!(result, Err(GatewayError::Timeout { .. })));

    // Follow-up requests on the same channel still work.
    let (resp, _) = bridge
        .dispatch(&record("GET", "/ping", 5_000), Bytes::new(), deadline(5_000))
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
}
