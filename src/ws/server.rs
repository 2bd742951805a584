//! WebSocket overlay over the HTTP server.
//!
//! A [`WebSocketServer`] wraps a [`Server`] so the same listening socket
//! serves HTTP and, for requests that pass the RFC 6455 handshake, long-lived
//! frame streams. Upgraded connections leave the HTTP state machine and run
//! the session loop here: reads tick at `read_interval`, an idle session is
//! closed with code 1000 after `timeout`, pings are answered with echoing
//! pongs, and complete messages are reported to the transport delegate on the
//! server's serialized delegate context.

use crate::errors::ServerError;
use crate::options::ServerOptions;
use crate::server::server_impl::{DelegateEvent, Server};
use crate::ws::frame::{
    encode_frame, Frame, FrameDecoder, FrameError, Message, MessageAssembler, Opcode,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks for WebSocket traffic, all delivered on the server's delegate
/// context so they never run concurrently with each other.
pub trait WebSocketTransport: Send + Sync + 'static {
    /// The handshake succeeded and the frame loop is about to start.
    fn transport_will_start(&self, _session: &WebSocketSession) {}

    /// One complete (reassembled) message arrived.
    fn transport_received(&self, _session: &WebSocketSession, _message: Message) {}

    /// The session is tearing down; the socket closes right after.
    fn transport_will_end(&self, _session: &WebSocketSession) {}
}

/// Handle for sending frames into a live session, usable from any thread.
#[derive(Clone)]
pub struct WebSocketSession {
    id: u64,
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl WebSocketSession {
    /// Stable id of this session, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .send(Frame::text(text.into().into_bytes()))
            .is_ok()
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.outgoing.send(Frame::binary(data)).is_ok()
    }

    pub fn send_message(&self, message: Message) -> bool {
        match message {
            Message::Text(text) => self.send_text(text),
            Message::Binary(data) => self.send_binary(data),
        }
    }

    /// Queues a close frame; the session ends once it is written.
    pub fn close(&self, code: u16) -> bool {
        self.outgoing.send(Frame::close(code, b"")).is_ok()
    }
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession").field("id", &self.id).finish()
    }
}

/// Per-run WebSocket configuration installed into the server by
/// [`WebSocketServer::start`].
pub(crate) struct WebSocketOverlay {
    pub(crate) timeout: Duration,
    pub(crate) read_interval: Duration,
    pub(crate) max_message_size: usize,
    pub(crate) transport: Arc<dyn WebSocketTransport>,
}

/// A [`Server`] that additionally accepts WebSocket upgrades.
///
/// HTTP handlers registered through [`WebSocketServer::server_mut`] keep
/// working; only requests that look like an RFC 6455 handshake divert into
/// the frame loop.
pub struct WebSocketServer {
    server: Server,
    transport: Arc<dyn WebSocketTransport>,
    timeout: Duration,
    read_interval: Duration,
    max_message_size: usize,
}

impl WebSocketServer {
    pub fn new(transport: Arc<dyn WebSocketTransport>) -> Self {
        Self {
            server: Server::new(),
            transport,
            timeout: Duration::from_secs(60),
            read_interval: Duration::from_secs(5),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Idle cutoff: a session with no inbound data for this long is closed
    /// with code 1000 (default: 60 s).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Granularity of the idle check on the read loop (default: 5 s).
    pub fn set_read_interval(&mut self, interval: Duration) {
        self.read_interval = interval;
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    /// The wrapped HTTP server, e.g. for registering ordinary handlers.
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    pub async fn start(&mut self, options: ServerOptions) -> Result<(), ServerError> {
        self.server.install_web_socket_overlay(WebSocketOverlay {
            timeout: self.timeout,
            read_interval: self.read_interval,
            max_message_size: self.max_message_size,
            transport: self.transport.clone(),
        });
        self.server.start(options).await
    }

    pub async fn stop(&mut self) {
        self.server.stop().await;
    }
}

/// Runs one upgraded connection until close, timeout, or protocol error.
/// `buffer` carries bytes that arrived pipelined behind the handshake.
pub(crate) async fn run_session(
    stream: TcpStream,
    mut buffer: BytesMut,
    overlay: Arc<WebSocketOverlay>,
    events: mpsc::UnboundedSender<DelegateEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();

    let session = WebSocketSession {
        id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        outgoing: outgoing_tx,
    };

    // All outbound frames funnel through one writer so interleaved sends
    // from the application and the read loop stay whole-frame atomic.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            let is_close = frame.opcode == Opcode::Close;
            if write_half.write_all(&encode_frame(&frame)).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let _ = events.send(DelegateEvent::WebSocketWillStart(session.clone()));

    let decoder = FrameDecoder::server().with_max_payload_len(overlay.max_message_size);
    let mut assembler = MessageAssembler::new(overlay.max_message_size);
    let mut last_read_data_time = Instant::now();

    'session: loop {
        // Drain every complete frame already buffered.
        loop {
            let frame = match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(%error, session = session.id, "websocket protocol error");
                    let _ = session.outgoing.send(Frame::close(error.close_code(), b""));
                    break 'session;
                }
            };

            match frame.opcode {
                Opcode::Ping => {
                    let _ = session.outgoing.send(Frame::pong(frame.payload));
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    if let Err(error) = validate_close_payload(&frame.payload) {
                        let _ = session.outgoing.send(Frame::close(error.close_code(), b""));
                    } else {
                        // Echo the peer's close payload back, per RFC 6455 §5.5.1.
                        let _ = session.outgoing.send(Frame {
                            fin: true,
                            opcode: Opcode::Close,
                            mask: None,
                            payload: frame.payload,
                        });
                    }
                    break 'session;
                }
                _ => match assembler.push(frame) {
                    Ok(Some(message)) => {
                        let _ = events
                            .send(DelegateEvent::WebSocketReceived(session.clone(), message));
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let _ = session.outgoing.send(Frame::close(error.close_code(), b""));
                        break 'session;
                    }
                },
            }
        }

        match timeout(overlay.read_interval, read_half.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => break,
            // The idle clock tracks socket reads, not completed frames: a
            // large frame trickling in must not count as idle time.
            Ok(Ok(_)) => last_read_data_time = Instant::now(),
            Ok(Err(error)) => {
                tracing::debug!(%error, session = session.id, "websocket read failed");
                break;
            }
            Err(_elapsed) => {
                if last_read_data_time.elapsed() > overlay.timeout {
                    tracing::debug!(session = session.id, "websocket idle timeout");
                    let _ = session.outgoing.send(Frame::close(1000, b""));
                    break;
                }
            }
        }
    }

    let _ = events.send(DelegateEvent::WebSocketWillEnd(session.clone()));

    // A close frame always terminates the writer task, even when the
    // application keeps a session handle alive; redundant closes after the
    // first are never written.
    let _ = session.outgoing.send(Frame::close(1000, b""));
    drop(session);
    let _ = writer.await;
}

fn validate_close_payload(payload: &[u8]) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Ok(());
    }
    if payload.len() == 1 {
        return Err(FrameError::InvalidCloseFrame);
    }
    if simdutf8::basic::from_utf8(&payload[2..]).is_err() {
        return Err(FrameError::InvalidUtf8);
    }
    Ok(())
}
