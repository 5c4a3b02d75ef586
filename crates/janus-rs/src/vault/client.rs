//! Worker-side handle to the vault sidecar.
//!
//! One connection per worker process, multiplexed by correlation id so
//! concurrent request handlers can touch their sessions without serializing
//! on each other. Ordering guarantees come from the sidecar's single event
//! loop, not from this client.

use bytes::Bytes;
use log::warn;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedWriteHalf, UnixStream};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::protocol::{codec, Frame, FrameDecoder, FrameKind};

use super::server::{VaultRequest, VaultResponse};
use super::store::VaultError;

/// Errors raised on the worker side of a vault call.
#[derive(Error, Debug)]
pub enum VaultClientError {
    #[error("Vault connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vault connection closed")]
    Closed,

    #[error(transparent)]
    Vault(VaultError),

    /// The sidecar answered with an error kind this client does not know.
    #[error("Vault protocol error: {0}")]
    Protocol(String),
}

/// Maps a failure reply back to the store error, using the variant data the
/// sidecar attached to the response.
fn vault_error_from(response: &VaultResponse) -> VaultClientError {
    match response.error.as_deref().unwrap_or("unknown") {
        "vault-full" => VaultClientError::Vault(VaultError::VaultFull {
            capacity: response.capacity.unwrap_or(0),
        }),
        "not-found" => VaultClientError::Vault(VaultError::NotFound),
        "expired" => VaultClientError::Vault(VaultError::Expired),
        "rotated" => VaultClientError::Vault(VaultError::Rotated),
        "crypto" => VaultClientError::Vault(VaultError::Crypto),
        other => VaultClientError::Protocol(other.to_string()),
    }
}

struct ClientInner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<VaultResponse>>>,
    max_frame_size: usize,
}

/// Cloneable vault handle shared by all request handlers in a worker.
#[derive(Clone)]
pub struct VaultClient {
    inner: Arc<ClientInner>,
}

impl VaultClient {
    /// Connects to the sidecar socket and starts the reader task.
    pub async fn connect(path: &Path, max_frame_size: usize) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            max_frame_size,
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_loop(reader_inner, read_half).await;
        });

        Ok(Self { inner })
    }

    pub async fn create(
        &self,
        sandbox: &str,
        payload: &[u8],
        ttl_ms: Option<u64>,
    ) -> Result<String, VaultClientError> {
        use base64::Engine as _;
        let response = self
            .call(VaultRequest {
                op: "create".to_string(),
                sandbox: Some(sandbox.to_string()),
                token: None,
                payload_b64: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
                ttl_ms,
            })
            .await?;
        response
            .token
            .ok_or_else(|| VaultClientError::Protocol("create reply without token".to_string()))
    }

    pub async fn read(&self, token: &str) -> Result<Vec<u8>, VaultClientError> {
        use base64::Engine as _;
        let response = self
            .call(VaultRequest {
                op: "read".to_string(),
                sandbox: None,
                token: Some(token.to_string()),
                payload_b64: None,
                ttl_ms: None,
            })
            .await?;
        let b64 = response
            .payload_b64
            .ok_or_else(|| VaultClientError::Protocol("read reply without payload".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| VaultClientError::Protocol("read reply payload not base64".to_string()))
    }

    pub async fn rotate(&self, token: &str) -> Result<String, VaultClientError> {
        let response = self
            .call(VaultRequest {
                op: "rotate".to_string(),
                sandbox: None,
                token: Some(token.to_string()),
                payload_b64: None,
                ttl_ms: None,
            })
            .await?;
        response
            .token
            .ok_or_else(|| VaultClientError::Protocol("rotate reply without token".to_string()))
    }

    pub async fn destroy(&self, token: &str) -> Result<(), VaultClientError> {
        self.call(VaultRequest {
            op: "destroy".to_string(),
            sandbox: None,
            token: Some(token.to_string()),
            payload_b64: None,
            ttl_ms: None,
        })
        .await
        .map(|_| ())
    }

    /// Asks the sidecar to write a snapshot now.
    pub async fn persist(&self) -> Result<(), VaultClientError> {
        self.call(VaultRequest {
            op: "persist".to_string(),
            sandbox: None,
            token: None,
            payload_b64: None,
            ttl_ms: None,
        })
        .await
        .map(|_| ())
    }

    async fn call(&self, request: VaultRequest) -> Result<VaultResponse, VaultClientError> {
        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(correlation, tx);

        let payload = serde_json::to_vec(&request)
            .map_err(|e| VaultClientError::Protocol(e.to_string()))?;
        let frame = Frame::new(FrameKind::Req, correlation, Bytes::from(payload));
        let wire = codec::encode(&frame, self.inner.max_frame_size)
            .map_err(|e| VaultClientError::Protocol(e.to_string()))?;

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.write_all(&wire).await {
                self.inner.pending.lock().await.remove(&correlation);
                return Err(e.into());
            }
        }

        let response = rx.await.map_err(|_| VaultClientError::Closed)?;
        if response.ok {
            Ok(response)
        } else {
            Err(vault_error_from(&response))
        }
    }
}

async fn reader_loop(inner: Arc<ClientInner>, mut reader: tokio::net::unix::OwnedReadHalf) {
    let mut decoder = FrameDecoder::new(inner.max_frame_size);
    loop {
        match decoder.decode_next() {
            Ok(Some(frame)) => {
                if frame.kind != FrameKind::Resp {
                    continue;
                }
                let response: VaultResponse = match serde_json::from_slice(&frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Vault reply payload malformed, dropping connection: {}", e);
                        break;
                    }
                };
                if let Some(tx) = inner.pending.lock().await.remove(&frame.correlation) {
                    let _ = tx.send(response);
                }
            }
            Ok(None) => match reader.read_buf(decoder.buffer_mut()).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            },
            Err(e) => {
                warn!("Vault reply stream codec error: {}", e);
                break;
            }
        }
    }
    // Fail everything still in flight so callers see Closed, not a hang.
    inner.pending.lock().await.clear();
}
