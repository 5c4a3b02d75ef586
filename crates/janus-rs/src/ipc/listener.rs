//! Worker-side IPC: the frame loop that feeds the dispatcher.
//!
//! The worker binds its socket, waits for the gateway to connect, sends
//! WORKER_READY once the application is built, and then serves request
//! frames until the stream closes or a DRAIN arrives. Each completed
//! request streams back as RESP, zero or more RESP_BODY chunks, RESP_END.

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{codec, Frame, FrameDecoder, FrameKind, RequestRecord};
use crate::runtime::message::{Request, Response};
use crate::runtime::Dispatcher;

/// A request whose body is still streaming in.
struct InboundRequest {
    record: RequestRecord,
    body: BytesMut,
}

/// The worker's server half of the bridge.
pub struct WorkerListener {
    worker_id: u32,
    listener: UnixListener,
    dispatcher: Dispatcher,
    max_frame_size: usize,
    stream_window: usize,
}

impl WorkerListener {
    /// Binds the worker socket with `0600` permissions.
    pub fn bind(
        worker_id: u32,
        socket_path: &Path,
        dispatcher: Dispatcher,
        max_frame_size: usize,
        stream_window: usize,
    ) -> std::io::Result<Self> {
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // A stale socket from a previous run blocks the bind.
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        restrict_mode(socket_path)?;
        Ok(Self {
            worker_id,
            listener,
            dispatcher,
            max_frame_size,
            stream_window,
        })
    }

    /// Serves gateway connections until the process exits. The gateway holds
    /// one connection at a time; a reconnect after a gateway restart is just
    /// the next accept.
    pub async fn serve(self) -> std::io::Result<()> {
        info!("Worker {} listening for the gateway", self.worker_id);
        loop {
            let (stream, _) = self.listener.accept().await?;
            info!("Worker {}: gateway connected", self.worker_id);
            connection_loop(
                self.worker_id,
                stream,
                self.dispatcher.clone(),
                self.max_frame_size,
                self.stream_window,
            )
            .await;
            info!("Worker {}: gateway disconnected", self.worker_id);
        }
    }
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

async fn connection_loop(
    worker_id: u32,
    stream: UnixStream,
    dispatcher: Dispatcher,
    max_frame_size: usize,
    stream_window: usize,
) {
    let (mut reader, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut decoder = FrameDecoder::new(max_frame_size);

    // Streaming request bodies keyed by correlation.
    let mut inbound: HashMap<Uuid, InboundRequest> = HashMap::new();
    // Cancellation tokens for requests already handed to the dispatcher.
    let cancels: Arc<Mutex<HashMap<Uuid, CancellationToken>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let draining = Arc::new(AtomicBool::new(false));

    // Handshake: the application is built, tell the gateway we take traffic.
    {
        let ready = Frame::control(FrameKind::WorkerReady, Uuid::nil());
        let mut w = writer.lock().await;
        if write_frame(&mut w, &ready, max_frame_size).await.is_err() {
            return;
        }
    }

    loop {
        let frame = loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => break frame,
                Ok(None) => match reader.read_buf(decoder.buffer_mut()).await {
                    Ok(0) => return,
                    Ok(_) => continue,
                    Err(_) => return,
                },
                Err(e) => {
                    warn!("Worker {}: frame protocol violation, closing: {}", worker_id, e);
                    return;
                }
            }
        };

        match frame.kind {
            FrameKind::Req => {
                let record: RequestRecord = match serde_json::from_slice(&frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        // Decode error on the head record: answer 400 and
                        // keep the channel; the stream itself is intact.
                        debug!("Worker {}: malformed REQ record: {}", worker_id, e);
                        send_response(
                            &writer,
                            frame.correlation,
                            &Response::json(
                                400,
                                &serde_json::json!({
                                    "error": "bad-request",
                                    "message": "Malformed request record",
                                    "requestId": frame.correlation.to_string(),
                                }),
                            ),
                            max_frame_size,
                            stream_window,
                        )
                        .await;
                        continue;
                    }
                };
                inbound.insert(
                    frame.correlation,
                    InboundRequest {
                        record,
                        body: BytesMut::new(),
                    },
                );
            }
            FrameKind::ReqBody => {
                if let Some(entry) = inbound.get_mut(&frame.correlation) {
                    entry.body.extend_from_slice(&frame.payload);
                }
            }
            FrameKind::ReqEnd => {
                let Some(entry) = inbound.remove(&frame.correlation) else {
                    continue;
                };
                if draining.load(Ordering::SeqCst) {
                    send_response(
                        &writer,
                        frame.correlation,
                        &Response::json(
                            503,
                            &serde_json::json!({
                                "error": "shutting-down",
                                "message": "Worker is draining",
                                "requestId": frame.correlation.to_string(),
                            }),
                        ),
                        max_frame_size,
                        stream_window,
                    )
                    .await;
                    continue;
                }

                let cancel = CancellationToken::new();
                cancels.lock().insert(frame.correlation, cancel.clone());

                let request =
                    Request::from_record(frame.correlation, entry.record, entry.body.freeze());
                let dispatcher = dispatcher.clone();
                let writer = Arc::clone(&writer);
                let cancels = Arc::clone(&cancels);
                let correlation = frame.correlation;

                tokio::spawn(async move {
                    let response = dispatcher.dispatch(request, cancel).await;
                    cancels.lock().remove(&correlation);
                    send_response(&writer, correlation, &response, max_frame_size, stream_window)
                        .await;
                });
            }
            FrameKind::Cancel => {
                inbound.remove(&frame.correlation);
                if let Some(token) = cancels.lock().remove(&frame.correlation) {
                    token.cancel();
                }
            }
            FrameKind::Ping => {
                let pong = Frame::control(FrameKind::Pong, frame.correlation);
                let mut w = writer.lock().await;
                if write_frame(&mut w, &pong, max_frame_size).await.is_err() {
                    return;
                }
            }
            FrameKind::Drain => {
                info!("Worker {}: drain requested", worker_id);
                draining.store(true, Ordering::SeqCst);
            }
            other => {
                debug!("Worker {}: unexpected {:?} frame, ignoring", worker_id, other);
            }
        }
    }
}

/// Streams one response back: RESP head, windowed body chunks, RESP_END.
async fn send_response(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    correlation: Uuid,
    response: &Response,
    max_frame_size: usize,
    stream_window: usize,
) {
    let payload = match serde_json::to_vec(&response.to_record()) {
        Ok(p) => p,
        Err(e) => {
            warn!("Response record serialization failed: {}", e);
            return;
        }
    };

    let mut w = writer.lock().await;
    let head = Frame::new(FrameKind::Resp, correlation, Bytes::from(payload));
    if write_frame(&mut w, &head, max_frame_size).await.is_err() {
        return;
    }

    let body = &response.body;
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + stream_window).min(body.len());
        let chunk = Frame::new(FrameKind::RespBody, correlation, body.slice(offset..end));
        if write_frame(&mut w, &chunk, max_frame_size).await.is_err() {
            return;
        }
        offset = end;
    }
    let _ = write_frame(
        &mut w,
        &Frame::control(FrameKind::RespEnd, correlation),
        max_frame_size,
    )
    .await;
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Frame,
    max_frame_size: usize,
) -> std::io::Result<()> {
    let wire = codec::encode(frame, max_frame_size)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&wire).await
}
