//! Gateway-side worker channel: correlation, deadlines, heartbeat.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedWriteHalf, UnixStream};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::models::error::GatewayError;
use crate::protocol::{codec, Frame, FrameDecoder, FrameKind, RequestRecord, ResponseRecord};

/// A complete worker response: head record plus assembled body.
pub type WorkerResponse = (ResponseRecord, Bytes);

struct Pending {
    record: Option<ResponseRecord>,
    body: BytesMut,
    tx: Option<oneshot::Sender<Result<WorkerResponse, GatewayError>>>,
}

struct BridgeInner {
    worker_id: u32,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    alive: AtomicBool,
    ready: AtomicBool,
    ready_notify: Notify,
    in_flight: AtomicU64,
    last_pong_ms: AtomicI64,
    max_frame_size: usize,
    stream_window: usize,
}

impl BridgeInner {
    fn fail_all_pending(&self, err: GatewayError) {
        let mut pending = self.pending.lock();
        for (_, mut entry) in pending.drain() {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!("Worker {} channel lost", self.worker_id);
            self.fail_all_pending(GatewayError::IpcPeerDead);
            // Wake anyone still waiting on the readiness handshake.
            self.ready_notify.notify_waiters();
        }
    }
}

/// The gateway's handle to one worker process.
///
/// Cloneable; all clones share the connection, the correlation table, and
/// the liveness state.
#[derive(Clone)]
pub struct WorkerBridge {
    inner: Arc<BridgeInner>,
}

impl WorkerBridge {
    /// Connects to a worker socket, retrying until `connect_timeout` while
    /// the worker boots. The returned bridge is connected but not yet
    /// `ready`; readiness arrives with the worker's WORKER_READY frame.
    pub async fn connect(
        worker_id: u32,
        socket_path: &Path,
        max_frame_size: usize,
        stream_window: usize,
        connect_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let stream = loop {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GatewayError::Upstream {
                            url: socket_path.display().to_string(),
                            message: format!("worker socket never came up: {}", e),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(BridgeInner {
            worker_id,
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            in_flight: AtomicU64::new(0),
            last_pong_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            max_frame_size,
            stream_window,
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_loop(reader_inner, read_half).await;
        });

        Ok(Self { inner })
    }

    pub fn worker_id(&self) -> u32 {
        self.inner.worker_id
    }

    /// Whether the channel is usable.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Whether the worker completed its WORKER_READY handshake.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Requests currently awaiting a response on this channel.
    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for the WORKER_READY handshake, up to `timeout`.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while !self.is_ready() {
                if !self.is_alive() {
                    return false;
                }
                self.inner.ready_notify.notified().await;
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Sends one request and awaits the paired response.
    ///
    /// On deadline expiry a CANCEL is emitted for the worker to honor at its
    /// next suspension point and the caller gets `Timeout` (504). A dead
    /// channel resolves everything as `IpcPeerDead` (502).
    pub async fn dispatch(
        &self,
        record: &RequestRecord,
        body: Bytes,
        deadline: tokio::time::Instant,
    ) -> Result<WorkerResponse, GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::IpcPeerDead);
        }

        let timeout_ms = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .as_millis() as u64;
        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            correlation,
            Pending {
                record: None,
                body: BytesMut::new(),
                tx: Some(tx),
            },
        );
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);

        let send_result = self.send_request(correlation, record, body).await;
        if let Err(e) = send_result {
            self.inner.pending.lock().remove(&correlation);
            self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.inner.mark_dead();
            return Err(e);
        }

        let outcome = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::IpcPeerDead),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation);
                self.cancel(correlation).await;
                Err(GatewayError::Timeout { timeout_ms })
            }
        };
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    async fn send_request(
        &self,
        correlation: Uuid,
        record: &RequestRecord,
        body: Bytes,
    ) -> Result<(), GatewayError> {
        let payload = serde_json::to_vec(record).map_err(|e| GatewayError::IpcCodec {
            message: e.to_string(),
        })?;
        let head = Frame::new(FrameKind::Req, correlation, Bytes::from(payload));

        let mut writer = self.inner.writer.lock().await;
        write_frame(&mut writer, &head, self.inner.max_frame_size).await?;

        // Chunked body under the stream window; the socket's own
        // backpressure is the flow control.
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + self.inner.stream_window).min(body.len());
            let chunk = Frame::new(FrameKind::ReqBody, correlation, body.slice(offset..end));
            write_frame(&mut writer, &chunk, self.inner.max_frame_size).await?;
            offset = end;
        }
        write_frame(
            &mut writer,
            &Frame::control(FrameKind::ReqEnd, correlation),
            self.inner.max_frame_size,
        )
        .await
    }

    /// Emits CANCEL for a correlation; best effort.
    pub async fn cancel(&self, correlation: Uuid) {
        let frame = Frame::control(FrameKind::Cancel, correlation);
        let mut writer = self.inner.writer.lock().await;
        if write_frame(&mut writer, &frame, self.inner.max_frame_size)
            .await
            .is_err()
        {
            self.inner.mark_dead();
        }
    }

    /// Broadcast-side of graceful shutdown: tell the worker to finish what
    /// it has and take nothing new.
    pub async fn drain(&self) {
        let frame = Frame::control(FrameKind::Drain, Uuid::nil());
        let mut writer = self.inner.writer.lock().await;
        let _ = write_frame(&mut writer, &frame, self.inner.max_frame_size).await;
    }

    /// Runs the PING/PONG heartbeat until the channel dies. A peer missing
    /// two intervals is declared dead.
    pub async fn heartbeat(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if !self.is_alive() {
                return;
            }

            let last = self.inner.last_pong_ms.load(Ordering::Relaxed);
            let age = Utc::now().timestamp_millis() - last;
            if age > 2 * interval.as_millis() as i64 {
                warn!(
                    "Worker {} missed heartbeat ({} ms since last PONG)",
                    self.inner.worker_id, age
                );
                self.inner.mark_dead();
                return;
            }

            let ping = Frame::control(FrameKind::Ping, Uuid::new_v4());
            let mut writer = self.inner.writer.lock().await;
            if write_frame(&mut writer, &ping, self.inner.max_frame_size)
                .await
                .is_err()
            {
                self.inner.mark_dead();
                return;
            }
        }
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Frame,
    max_frame_size: usize,
) -> Result<(), GatewayError> {
    let wire = codec::encode(frame, max_frame_size).map_err(|e| GatewayError::IpcCodec {
        message: e.to_string(),
    })?;
    writer
        .write_all(&wire)
        .await
        .map_err(|_| GatewayError::IpcPeerDead)
}

async fn reader_loop(inner: Arc<BridgeInner>, mut reader: tokio::net::unix::OwnedReadHalf) {
    let mut decoder = FrameDecoder::new(inner.max_frame_size);

    loop {
        let frame = loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => break frame,
                Ok(None) => match reader.read_buf(decoder.buffer_mut()).await {
                    Ok(0) => {
                        inner.mark_dead();
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Worker {} read error: {}", inner.worker_id, e);
                        inner.mark_dead();
                        return;
                    }
                },
                Err(e) => {
                    warn!("Worker {} violated the frame protocol: {}", inner.worker_id, e);
                    inner.mark_dead();
                    return;
                }
            }
        };

        match frame.kind {
            FrameKind::WorkerReady => {
                inner.ready.store(true, Ordering::SeqCst);
                inner.ready_notify.notify_waiters();
            }
            FrameKind::Pong => {
                inner
                    .last_pong_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
            FrameKind::Resp => {
                let record: ResponseRecord = match serde_json::from_slice(&frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Worker {} sent malformed RESP: {}", inner.worker_id, e);
                        inner.mark_dead();
                        return;
                    }
                };
                if let Some(entry) = inner.pending.lock().get_mut(&frame.correlation) {
                    entry.record = Some(record);
                }
            }
            FrameKind::RespBody => {
                if let Some(entry) = inner.pending.lock().get_mut(&frame.correlation) {
                    entry.body.extend_from_slice(&frame.payload);
                }
            }
            FrameKind::RespEnd => {
                let resolved = inner.pending.lock().remove(&frame.correlation);
                if let Some(mut entry) = resolved {
                    match (entry.record.take(), entry.tx.take()) {
                        (Some(record), Some(tx)) => {
                            let _ = tx.send(Ok((record, entry.body.freeze())));
                        }
                        (None, Some(tx)) => {
                            let _ = tx.send(Err(GatewayError::IpcCodec {
                                message: "RESP_END without RESP head".to_string(),
                            }));
                        }
                        _ => {}
                    }
                }
                // A correlation we no longer track is a cancelled request
                // whose late response is simply dropped.
            }
            FrameKind::Ping => {
                // Workers do not ping the gateway today; answer anyway.
                let pong = Frame::control(FrameKind::Pong, frame.correlation);
                let mut writer = inner.writer.lock().await;
                let _ = write_frame(&mut writer, &pong, inner.max_frame_size).await;
            }
            other => {
                debug!(
                    "Worker {} sent unexpected {:?} frame, ignoring",
                    inner.worker_id, other
                );
            }
        }
    }
}
