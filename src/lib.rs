//! embed_web - Embeddable HTTP/1.1 + WebSocket server for application processes
//!
//! A small async server library meant to live *inside* an app (desktop or
//! mobile) that wants to expose files, forms, or a simple API over the local
//! network: bind a port, register handlers, stream bodies, keep connections
//! alive, and optionally speak WebSocket on the same socket.
//!
//! # Features
//!
//! - **HTTP/1.1** with keep-alive, chunked transfer encoding in both
//!   directions, byte ranges, conditional requests
//!   (`If-Modified-Since` / `If-None-Match`), and HEAD folded onto GET.
//! - **Handler chain** - (match, process) pairs with LIFO priority, plus
//!   convenience registrations for exact paths, regexes, and directory trees.
//! - **Request bodies as sinks** - accumulate in memory, spool to temp
//!   files, or parse `application/x-www-form-urlencoded` and
//!   `multipart/form-data` while the upload streams in.
//! - **Response bodies as sources** - in-memory data, file slices for range
//!   requests, or user streaming closures; gzip when the client negotiates.
//! - **HTTP authentication** - Basic and Digest (`qop="auth"`).
//! - **WebSocket** - RFC 6455 handshake and frame codec layered over the
//!   same listening socket, with a transport delegate and idle timeouts.
//! - **Lifecycle** - graceful stop that drains in-flight connections,
//!   pause/resume of the accept loop for mobile background transitions, and
//!   coalesced connect/disconnect notifications.
//!
//! # Quick Start
//!
//! ```no_run
//! use embed_web::{Method, Response, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new();
//!     server
//!         .add_default_handler_for_method(Method::Get, |_request| async {
//!             Some(Response::html("<html><body><p>Hello World</p></body></html>"))
//!         })
//!         .unwrap();
//!
//!     server
//!         .start(ServerOptions {
//!             port: 8080,
//!             ..ServerOptions::default()
//!         })
//!         .await
//!         .unwrap();
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     server.stop().await;
//! }
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events and never installs a subscriber; the
//! embedding app picks the backend. To honor the conventional `logLevel`
//! environment variable in a binary:
//!
//! ```no_run
//! tracing_subscriber::fmt()
//!     .with_env_filter(
//!         tracing_subscriber::EnvFilter::try_from_env("logLevel")
//!             .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
//!     )
//!     .init();
//! ```

pub(crate) mod http {
    pub mod multipart;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod auth;
    pub(crate) mod connection;
    pub(crate) mod handlers;
    pub(crate) mod server_impl;
}
pub(crate) mod ws {
    pub(crate) mod frame;
    pub(crate) mod handshake;
    pub(crate) mod server;
}
pub(crate) mod errors;
pub mod mime;
pub mod options;

pub use crate::{
    errors::ServerError,
    http::{
        multipart::MultiPartFile,
        query,
        request::{BodyKind, Request, RequestHead},
        response::{Response, StreamProducer},
        types::{ByteRange, Headers, Method, StatusCode, Version},
    },
    options::{Authentication, AuthenticationMethod, ServerOptions},
    server::server_impl::{Server, ServerDelegate, ServiceAnnouncer},
    ws::{
        frame::{encode_frame, Frame, FrameDecoder, FrameError, Message, Opcode},
        handshake::{accept_key, is_web_socket_request},
        server::{WebSocketServer, WebSocketSession, WebSocketTransport},
    },
};
