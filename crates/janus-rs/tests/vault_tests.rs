//! End-to-end vault coverage: the store behind its sidecar event loop,
//! reached through the worker-side client over a real Unix socket.

use std::time::Duration;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use janus_rs::vault::client::VaultClientError;
use janus_rs::vault::server::{PersistenceConfig, VaultServer};
use janus_rs::vault::store::{SessionVault, VaultConfig, VaultError};
use janus_rs::vault::VaultClient;

const MAX_FRAME: usize = 1024 * 1024;

async fn start_sidecar(
    dir: &tempfile::TempDir,
    config: VaultConfig,
    persistence: Option<PersistenceConfig>,
) -> (VaultClient, CancellationToken) {
    let socket = dir.path().join("vault.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let shutdown = CancellationToken::new();
    let server = VaultServer::new(SessionVault::new(config), persistence, MAX_FRAME);
    tokio::spawn(server.serve(listener, shutdown.clone()));

    let client = VaultClient::connect(&socket, MAX_FRAME).await.unwrap();
    (client, shutdown)
}

fn config(grace_ms: u64) -> VaultConfig {
    VaultConfig {
        capacity: 16,
        default_ttl_ms: 60_000,
        grace_period_ms: grace_ms,
    }
}

#[tokio::test]
async fn create_read_destroy_over_ipc() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _shutdown) = start_sidecar(&dir, config(1_000), None).await;

    let token = client.create("app", b"user=1", None).await.unwrap();
    assert_eq!(client.read(&token).await.unwrap(), b"user=1");

    client.destroy(&token).await.unwrap();
    assert!(matches!(
        client.read(&token).await,
        Err(VaultClientError::Vault(VaultError::NotFound))
    ));
}

#[tokio::test]
async fn rotation_grace_window_over_ipc() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _shutdown) = start_sidecar(&dir, config(150), None).await;

    let old = client.create("app", b"payload", None).await.unwrap();
    let new = client.rotate(&old).await.unwrap();
    assert_ne!(old, new);

    // Inside the grace window both tokens resolve.
    assert_eq!(client.read(&old).await.unwrap(), b"payload");
    assert_eq!(client.read(&new).await.unwrap(), b"payload");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(matches!(
        client.read(&old).await,
        Err(VaultClientError::Vault(VaultError::Rotated))
    ));
    assert_eq!(client.read(&new).await.unwrap(), b"payload");

    // Grace applies to reads only.
    assert!(matches!(
        client.rotate(&old).await,
        Err(VaultClientError::Vault(VaultError::Rotated))
    ));
}

#[tokio::test]
async fn capacity_surfaces_vault_full() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _shutdown) = start_sidecar(
        &dir,
        VaultConfig {
            capacity: 2,
            default_ttl_ms: 60_000,
            grace_period_ms: 100,
        },
        None,
    )
    .await;

    client.create("app", b"1", None).await.unwrap();
    client.create("app", b"2", None).await.unwrap();
    // The configured limit survives the wire round trip.
    assert!(matches!(
        client.create("app", b"3", None).await,
        Err(VaultClientError::Vault(VaultError::VaultFull { capacity: 2 }))
    ));
}

#[tokio::test]
async fn concurrent_clients_are_serialized_by_the_event_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _shutdown) = start_sidecar(&dir, config(1_000), None).await;

    let token = client.create("app", b"shared", None).await.unwrap();
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move { client.read(&token).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), b"shared");
    }
}

#[tokio::test]
async fn shutdown_snapshot_restores_in_a_new_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("sessions.xems");
    let persistence = PersistenceConfig {
        path: snapshot_path.clone(),
        secret: "test-secret".to_string(),
    };

    let socket = dir.path().join("vault-a.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let shutdown = CancellationToken::new();
    let server = VaultServer::new(
        SessionVault::new(config(1_000)),
        Some(persistence.clone()),
        MAX_FRAME,
    );
    let serve = tokio::spawn(server.serve(listener, shutdown.clone()));

    let client = VaultClient::connect(&socket, MAX_FRAME).await.unwrap();
    let token = client.create("app", b"persist-me", None).await.unwrap();

    // Stop the first sidecar; its exit path writes the snapshot.
    shutdown.cancel();
    serve.await.unwrap().unwrap();
    assert!(snapshot_path.exists());

    let socket_b = dir.path().join("vault-b.sock");
    let listener_b = UnixListener::bind(&socket_b).unwrap();
    let shutdown_b = CancellationToken::new();
    let server_b = VaultServer::new(
        SessionVault::new(config(1_000)),
        Some(persistence),
        MAX_FRAME,
    );
    tokio::spawn(server_b.serve(listener_b, shutdown_b));

    let client_b = VaultClient::connect(&socket_b, MAX_FRAME).await.unwrap();
    assert_eq!(client_b.read(&token).await.unwrap(), b"persist-me");
}
