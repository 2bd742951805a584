//! End-to-end WebSocket tests: handshake, echo framing, control frames,
//! idle timeout, and plain HTTP coexisting on the same socket.

use embed_web::{
    encode_frame, Frame, Message, Method, Opcode, Response, ServerOptions, WebSocketServer,
    WebSocketSession, WebSocketTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

#[derive(Default)]
struct EchoTransport {
    started: AtomicUsize,
    ended: AtomicUsize,
    received: AtomicUsize,
}

impl WebSocketTransport for EchoTransport {
    fn transport_will_start(&self, _session: &WebSocketSession) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_received(&self, session: &WebSocketSession, message: Message) {
        self.received.fetch_add(1, Ordering::SeqCst);
        session.send_message(message);
    }

    fn transport_will_end(&self, _session: &WebSocketSession) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

fn options() -> ServerOptions {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("logLevel")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    ServerOptions {
        port: 0,
        ..ServerOptions::default()
    }
}

async fn upgraded_stream(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        raw.push(byte[0]);
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(raw).unwrap();

    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"), "{head}");
    assert!(head.contains("Upgrade: websocket"));
    assert!(head.contains("Connection: Upgrade"));
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")));

    stream
}

fn masked(mut frame: Frame) -> Vec<u8> {
    frame.mask = Some([0x37, 0xFA, 0x21, 0x3D]);
    encode_frame(&frame)
}

#[tokio::test]
async fn echo_with_exact_framing() {
    let transport = Arc::new(EchoTransport::default());
    let mut server = WebSocketServer::new(transport.clone());
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    stream.write_all(&masked(Frame::text("hi"))).await.unwrap();

    // The server echo must be the exact unmasked text frame.
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x81, 0x02, 0x68, 0x69]);

    assert_eq!(transport.started.load(Ordering::SeqCst), 1);
    assert_eq!(transport.received.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn ping_is_answered_with_echoing_pong() {
    let mut server = WebSocketServer::new(Arc::new(EchoTransport::default()));
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    stream.write_all(&masked(Frame::ping(b"p".to_vec()))).await.unwrap();

    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x8A, 0x01, 0x70]);

    server.stop().await;
}

#[tokio::test]
async fn close_is_echoed_and_connection_ends() {
    let transport = Arc::new(EchoTransport::default());
    let mut server = WebSocketServer::new(transport.clone());
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    stream
        .write_all(&masked(Frame::close(1000, b"")))
        .await
        .unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);

    // Nothing further: the server tears the socket down.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.ended.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn fragmented_message_is_reassembled() {
    let transport = Arc::new(EchoTransport::default());
    let mut server = WebSocketServer::new(transport.clone());
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    let mut first = Frame::text("hel");
    first.fin = false;
    let continuation = Frame {
        fin: true,
        opcode: Opcode::Continuation,
        mask: None,
        payload: b"lo".to_vec(),
    };
    stream.write_all(&masked(first)).await.unwrap();
    stream.write_all(&masked(continuation)).await.unwrap();

    // Echo arrives as one complete text frame "hello".
    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);

    server.stop().await;
}

#[tokio::test]
async fn unmasked_client_frame_is_a_protocol_error() {
    let mut server = WebSocketServer::new(Arc::new(EchoTransport::default()));
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    // Servers must refuse unmasked client frames with close code 1002.
    stream.write_all(&encode_frame(&Frame::text("hi"))).await.unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xEA]);

    server.stop().await;
}

#[tokio::test]
async fn idle_session_times_out_with_normal_close() {
    let mut server = WebSocketServer::new(Arc::new(EchoTransport::default()));
    server.set_timeout(Duration::from_millis(150));
    server.set_read_interval(Duration::from_millis(40));
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    // Send nothing; the server closes with 1000 after the idle window.
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);

    server.stop().await;
}

#[tokio::test]
async fn plain_http_still_served() {
    let mut server = WebSocketServer::new(Arc::new(EchoTransport::default()));
    server
        .server_mut()
        .add_handler_for_path(Method::Get, "/hello", embed_web::BodyKind::None, |_req| async {
            Some(Response::text("plain"))
        })
        .unwrap();
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.ends_with("plain"), "{text}");

    server.stop().await;
}

#[tokio::test]
async fn application_can_push_from_session_handle() {
    struct GreetingTransport;

    impl WebSocketTransport for GreetingTransport {
        fn transport_will_start(&self, session: &WebSocketSession) {
            session.send_text("welcome");
        }
    }

    let mut server = WebSocketServer::new(Arc::new(GreetingTransport));
    server.start(options()).await.unwrap();
    let port = server.server().port().unwrap();

    let mut stream = upgraded_stream(port).await;

    let mut reply = [0u8; 9];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], [0x81, 0x07]);
    assert_eq!(&reply[2..], b"welcome");

    server.stop().await;
}
