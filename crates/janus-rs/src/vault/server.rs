//! The vault sidecar: a single-task event loop over a Unix socket.
//!
//! Connections (one per worker, plus the gateway during shutdown) each get a
//! reader task that decodes frames and forwards requests into one mpsc
//! channel; the store itself is owned by a single consumer task. That makes
//! every operation linearizable without a per-token lock, which is what the
//! rotation grace semantics rely on.
//!
//! Request/response payloads ride the same frame protocol as HTTP traffic:
//! REQ with a JSON [`VaultRequest`], RESP with a JSON [`VaultResponse`],
//! PING answered inline by the connection task.

use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::{codec, Frame, FrameDecoder, FrameKind};

use super::persistence;
use super::store::{SessionVault, VaultError};

/// One operation requested over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRequest {
    /// `create`, `read`, `rotate`, `destroy`, or `persist`.
    pub op: String,
    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub payload_b64: Option<String>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// Reply to a [`VaultRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Configured capacity, carried alongside a `vault-full` error so the
    /// client reconstructs the real limit instead of inventing one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
}

impl VaultResponse {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
            capacity: None,
            token: None,
            payload_b64: None,
        }
    }

    fn failure(kind: &str) -> Self {
        Self {
            ok: false,
            error: Some(kind.to_string()),
            capacity: None,
            token: None,
            payload_b64: None,
        }
    }

    /// Failure reply for a store error, with the error's data attached.
    fn store_failure(err: &VaultError) -> Self {
        let mut response = Self::failure(error_kind(err));
        if let VaultError::VaultFull { capacity } = err {
            response.capacity = Some(*capacity);
        }
        response
    }
}

/// Stable wire identifier for each vault error.
pub fn error_kind(err: &VaultError) -> &'static str {
    match err {
        VaultError::VaultFull { .. } => "vault-full",
        VaultError::NotFound => "not-found",
        VaultError::Expired => "expired",
        VaultError::Rotated => "rotated",
        VaultError::Crypto => "crypto",
    }
}

/// Snapshot location and secret, when persistence is enabled.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub path: PathBuf,
    pub secret: String,
}

/// The sidecar server. Owns the store for its whole lifetime.
pub struct VaultServer {
    vault: SessionVault,
    persistence: Option<PersistenceConfig>,
    max_frame_size: usize,
}

impl VaultServer {
    pub fn new(
        mut vault: SessionVault,
        persistence: Option<PersistenceConfig>,
        max_frame_size: usize,
    ) -> Self {
        if let Some(ref p) = persistence {
            persistence::restore(&mut vault, &p.path, &p.secret);
        }
        Self {
            vault,
            persistence,
            max_frame_size,
        }
    }

    /// Runs the event loop until `shutdown` fires, then snapshots if
    /// persistence is configured.
    pub async fn serve(
        mut self,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let (tx, mut rx) = mpsc::channel::<(VaultRequest, oneshot::Sender<VaultResponse>)>(256);
        info!("Vault event loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(connection_loop(stream, tx.clone(), self.max_frame_size));
                        }
                        Err(e) => {
                            warn!("Vault accept failed: {}", e);
                        }
                    }
                }
                Some((request, reply)) = rx.recv() => {
                    let response = self.apply(request);
                    // A dropped reply just means the connection went away.
                    let _ = reply.send(response);
                }
            }
        }

        if let Some(ref p) = self.persistence {
            if let Err(e) = persistence::snapshot(&self.vault, &p.path, &p.secret) {
                warn!("Final vault snapshot failed: {}", e);
            }
        }
        info!("Vault event loop stopped");
        Ok(())
    }

    fn apply(&mut self, request: VaultRequest) -> VaultResponse {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD;

        match request.op.as_str() {
            "create" => {
                let sandbox = request.sandbox.unwrap_or_else(|| "default".to_string());
                let payload = match request.payload_b64.as_deref().map(|p| b64.decode(p)) {
                    Some(Ok(p)) => p,
                    Some(Err(_)) => return VaultResponse::failure("bad-payload"),
                    None => Vec::new(),
                };
                match self.vault.create(&sandbox, &payload, request.ttl_ms) {
                    Ok(token) => VaultResponse {
                        token: Some(token),
                        ..VaultResponse::success()
                    },
                    Err(e) => VaultResponse::store_failure(&e),
                }
            }
            "read" => match request.token.as_deref() {
                Some(token) => match self.vault.read(token) {
                    Ok(plaintext) => VaultResponse {
                        payload_b64: Some(b64.encode(plaintext)),
                        ..VaultResponse::success()
                    },
                    Err(e) => VaultResponse::store_failure(&e),
                },
                None => VaultResponse::failure("missing-token"),
            },
            "rotate" => match request.token.as_deref() {
                Some(token) => {
                    let new_payload = match request.payload_b64.as_deref().map(|p| b64.decode(p)) {
                        Some(Ok(p)) => Some(p),
                        Some(Err(_)) => return VaultResponse::failure("bad-payload"),
                        None => None,
                    };
                    match self.vault.rotate(token, new_payload.as_deref()) {
                        Ok(new_token) => VaultResponse {
                            token: Some(new_token),
                            ..VaultResponse::success()
                        },
                        Err(e) => VaultResponse::store_failure(&e),
                    }
                }
                None => VaultResponse::failure("missing-token"),
            },
            "destroy" => match request.token.as_deref() {
                Some(token) => {
                    self.vault.destroy(token);
                    VaultResponse::success()
                }
                None => VaultResponse::failure("missing-token"),
            },
            "persist" => match self.persistence {
                Some(ref p) => match persistence::snapshot(&self.vault, &p.path, &p.secret) {
                    Ok(()) => VaultResponse::success(),
                    Err(e) => {
                        warn!("On-demand vault snapshot failed: {}", e);
                        VaultResponse::failure("snapshot-failed")
                    }
                },
                None => VaultResponse::failure("persistence-disabled"),
            },
            other => {
                debug!("Unknown vault op: {}", other);
                VaultResponse::failure("unknown-op")
            }
        }
    }
}

/// Per-connection reader: frames in, replies out, strictly in order.
async fn connection_loop(
    mut stream: UnixStream,
    tx: mpsc::Sender<(VaultRequest, oneshot::Sender<VaultResponse>)>,
    max_frame_size: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_size);

    loop {
        let frame = loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => break frame,
                Ok(None) => match stream.read_buf(decoder.buffer_mut()).await {
                    Ok(0) => return,
                    Ok(_) => continue,
                    Err(_) => return,
                },
                Err(e) => {
                    warn!("Vault connection codec error, closing: {}", e);
                    return;
                }
            }
        };

        match frame.kind {
            FrameKind::Ping => {
                let pong = Frame::control(FrameKind::Pong, frame.correlation);
                if write_frame(&mut stream, &pong, max_frame_size).await.is_err() {
                    return;
                }
            }
            FrameKind::Req => {
                let request: VaultRequest = match serde_json::from_slice(&frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Vault connection sent malformed request, closing: {}", e);
                        return;
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send((request, reply_tx)).await.is_err() {
                    return;
                }
                let Ok(response) = reply_rx.await else { return };
                let payload = match serde_json::to_vec(&response) {
                    Ok(p) => Bytes::from(p),
                    Err(_) => return,
                };
                let resp = Frame::new(FrameKind::Resp, frame.correlation, payload);
                if write_frame(&mut stream, &resp, max_frame_size).await.is_err() {
                    return;
                }
            }
            other => {
                warn!("Vault connection sent unexpected {:?} frame, closing", other);
                return;
            }
        }
    }
}

async fn write_frame(
    stream: &mut UnixStream,
    frame: &Frame,
    max_frame_size: usize,
) -> std::io::Result<()> {
    let wire = codec::encode(frame, max_frame_size)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(&wire).await
}
