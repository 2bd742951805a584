//! Per-socket HTTP state machine.
//!
//! One connection owns one accepted socket and serves keep-alive requests in
//! strict arrival order:
//!
//! ```text
//! READ_REQUEST_LINE -> READ_HEADERS -> (AUTH_CHECK)
//!    -> MATCH_HANDLER -> READ_BODY -> PROCESS
//!    -> APPLY_CONDITIONAL -> WRITE_HEADERS -> WRITE_BODY
//!    -> (KEEP_ALIVE? READ_REQUEST_LINE : CLOSED)
//! ```
//!
//! Faults before any response byte are turned into status responses; framing
//! faults additionally close the socket since the input stream can no longer
//! be trusted. A request that passes the WebSocket handshake leaves this
//! state machine for the frame loop in [`crate::ws::server`].

use crate::errors::ErrorKind;
use crate::http::query::{parse_query, percent_decode_utf8};
use crate::http::request::{BodyError, Request, RequestHead};
use crate::http::response::Response;
use crate::http::types::{ByteRange, Headers, Method, StatusCode, Version};
use crate::server::auth::AuthOutcome;
use crate::server::handlers::{match_request, ProcessFn, RegistryLookup};
use crate::server::server_impl::ConnectionContext;
use crate::ws::handshake::{handshake_response, is_web_socket_request};
use bytes::BytesMut;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::FutureExt;
use memchr::memmem;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_HEADER_BLOCK: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 8 * 1024;
const BODY_SLICE: usize = 16 * 1024;
/// Unconsumed request bodies up to this size are drained to preserve
/// keep-alive on error responses; anything larger closes instead.
const MAX_DRAIN: u64 = 1024 * 1024;

enum Served {
    KeepAlive,
    Close,
    Upgrade,
}

/// Response-side facts captured from the request before the handler consumes
/// it: the conditional fields, range, negotiation, and framing decisions.
struct Exchange {
    version: Version,
    is_head: bool,
    accepts_gzip: bool,
    byte_range: Option<ByteRange>,
    if_modified_since: Option<SystemTime>,
    if_none_match: Option<String>,
    close: bool,
}

impl Exchange {
    fn bare(version: Version) -> Self {
        Self {
            version,
            is_head: false,
            accepts_gzip: false,
            byte_range: None,
            if_modified_since: None,
            if_none_match: None,
            close: true,
        }
    }

    fn for_request(head: &RequestHead, request: &Request) -> Self {
        Self {
            version: head.version,
            is_head: head.method == Method::Head,
            accepts_gzip: request.accepts_gzip_content_encoding(),
            byte_range: request.byte_range(),
            if_modified_since: request.if_modified_since(),
            if_none_match: request.if_none_match().map(str::to_string),
            close: wants_close(head),
        }
    }
}

fn wants_close(head: &RequestHead) -> bool {
    if head.headers.list_contains("connection", "close") {
        return true;
    }
    // HTTP/1.0 closes unless the client opted into keep-alive.
    head.version == Version::Http10 && !head.headers.list_contains("connection", "keep-alive")
}

pub(crate) struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    ctx: Arc<ConnectionContext>,
    remote: SocketAddr,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, remote: SocketAddr, ctx: Arc<ConnectionContext>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(16 * 1024),
            ctx,
            remote,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(remote = %self.remote, "connection opened");

        loop {
            match self.serve_one().await {
                Ok(Served::KeepAlive) => continue,
                Ok(Served::Close) => break,
                Ok(Served::Upgrade) => {
                    let overlay = self
                        .ctx
                        .web_socket
                        .clone()
                        .expect("upgrade without overlay");
                    crate::ws::server::run_session(
                        self.stream,
                        self.buffer,
                        overlay,
                        self.ctx.events.clone(),
                    )
                    .await;
                    tracing::debug!(remote = %self.remote, "websocket session ended");
                    return;
                }
                Err(error) => {
                    tracing::debug!(remote = %self.remote, %error, "connection i/o failed");
                    break;
                }
            }
        }

        tracing::debug!(
            remote = %self.remote,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            "connection closed"
        );
    }

    async fn serve_one(&mut self) -> std::io::Result<Served> {
        let block = match self.read_head_block().await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(Served::Close),
            Err(kind) => return self.fail(Exchange::bare(Version::Http11), kind).await,
        };

        let (head, raw_target) = match parse_head(&block) {
            Ok(parsed) => parsed,
            Err(kind) => return self.fail(Exchange::bare(Version::Http11), kind).await,
        };
        tracing::debug!(remote = %self.remote, method = %head.method, target = %raw_target, "request");

        // WebSocket upgrade leaves the HTTP state machine entirely.
        if self.ctx.web_socket.is_some() && is_web_socket_request(&head) {
            let key = head
                .headers
                .get("sec-websocket-key")
                .expect("validated upgrade");
            let response = handshake_response(key, &self.ctx.server_name);
            self.write_all(response.as_bytes()).await?;
            return Ok(Served::Upgrade);
        }

        // Authentication gates handler matching.
        if let Some(authenticator) = &self.ctx.authenticator {
            if let AuthOutcome::Challenge(challenge) =
                authenticator.check(&head.method, &raw_target, &head.headers)
            {
                let mut exchange = Exchange::bare(head.version);
                exchange.is_head = head.method == Method::Head;
                exchange.close = wants_close(&head) || !self.drain_body(&head).await;

                let mut response = Response::with_status(StatusCode::Unauthorized);
                response.set_header("WWW-Authenticate", challenge);
                return self.finish(exchange, response).await;
            }
        }

        // Handler lookup, LIFO, with HEAD folded onto GET when enabled.
        let handlers = self.ctx.handlers.clone();
        let lookup = match match_request(&handlers, &head) {
            RegistryLookup::Matched(request, process) => Ok((request, process)),
            miss => {
                if head.method == Method::Head && self.ctx.map_head_to_get {
                    let mut get_head = head.clone();
                    get_head.method = Method::Get;
                    match match_request(&handlers, &get_head) {
                        RegistryLookup::Matched(request, process) => Ok((request, process)),
                        miss => Err(miss),
                    }
                } else {
                    Err(miss)
                }
            }
        };

        let (mut request, process) = match lookup {
            Ok(matched) => matched,
            Err(miss) => {
                let kind = match miss {
                    RegistryLookup::WrongMethod => ErrorKind::MethodNotAllowed,
                    _ if !head.method.is_well_known() => ErrorKind::UnknownMethod,
                    _ => ErrorKind::NotFound,
                };
                let mut exchange = Exchange::bare(head.version);
                exchange.is_head = head.method == Method::Head;
                exchange.close = wants_close(&head) || !self.drain_body(&head).await;
                return self.fail_with(exchange, kind).await;
            }
        };

        let exchange = Exchange::for_request(&head, &request);

        // Body ingestion: open -> write* -> close, failure aborts pre-process.
        if request.has_body() {
            if let Some(kind) = self.ingest_body(&mut request).await? {
                return self.fail(exchange, kind).await;
            }
        }

        // The handler may panic; the socket still closes and the client
        // still hears 500.
        let response = match std::panic::AssertUnwindSafe((process.as_ref())(request))
            .catch_unwind()
            .await
        {
            Ok(Some(response)) => response,
            Ok(None) => return self.fail_with(exchange, ErrorKind::HandlerReturnedNone).await,
            Err(_) => {
                tracing::error!(remote = %self.remote, "handler panicked");
                return self.fail_with(exchange, ErrorKind::HandlerReturnedNone).await;
            }
        };

        let response = self.transform_response(response, &exchange);
        self.finish(exchange, response).await
    }

    /// Applies conditional-request and byte-range rewrites after process.
    fn transform_response(&self, mut response: Response, exchange: &Exchange) -> Response {
        if response.status().as_u16() / 100 == 2 && is_not_modified(&response, exchange) {
            response.make_not_modified();
            return response;
        }

        if let Some(range) = exchange.byte_range {
            if response.supports_byte_ranges() {
                if let Err(total) = response.apply_byte_range(range) {
                    let mut unsatisfiable =
                        Response::with_status(StatusCode::RangeNotSatisfiable);
                    unsatisfiable.set_header("Content-Range", format!("bytes */{total}"));
                    return unsatisfiable;
                }
            }
        }

        response
    }

    // For faults where part of the request may remain unread on the wire:
    // the stream cannot be resynchronized, so the connection always closes.
    async fn fail(&mut self, exchange: Exchange, kind: ErrorKind) -> std::io::Result<Served> {
        let mut exchange = exchange;
        exchange.close = true;
        self.fail_with(exchange, kind).await
    }

    async fn fail_with(&mut self, exchange: Exchange, kind: ErrorKind) -> std::io::Result<Served> {
        tracing::debug!(remote = %self.remote, error = %kind, status = kind.status().as_u16(), "request failed");
        let response = Response::with_status(kind.status());
        let mut exchange = exchange;
        exchange.close = exchange.close || kind.is_fatal();
        self.finish(exchange, response).await
    }

    async fn finish(&mut self, exchange: Exchange, response: Response) -> std::io::Result<Served> {
        let keep_alive = self.send_response(response, &exchange).await?;
        Ok(match keep_alive {
            true => Served::KeepAlive,
            false => Served::Close,
        })
    }
}

// Inbound: buffered reads, head framing, body decoding.
impl Connection {
    async fn fill(&mut self) -> std::io::Result<usize> {
        let read = self.stream.read_buf(&mut self.buffer);
        let n = match self.ctx.read_timeout {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??,
            None => read.await?,
        };
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Reads up to the blank line ending the header block. `Ok(None)` is a
    /// clean end of the connection between requests.
    async fn read_head_block(&mut self) -> Result<Option<Vec<u8>>, ErrorKind> {
        loop {
            if let Some(pos) = memmem::find(&self.buffer, b"\r\n\r\n") {
                let block = self.buffer.split_to(pos + 4);
                return Ok(Some(block[..pos].to_vec()));
            }
            if self.buffer.len() > MAX_HEADER_BLOCK {
                return Err(ErrorKind::HeadersTooLarge);
            }
            match self.fill().await {
                Ok(0) if self.buffer.is_empty() => return Ok(None),
                Ok(0) => return Err(ErrorKind::MalformedRequestLine),
                Ok(_) => {}
                Err(error) => return Err(ErrorKind::Io(error)),
            }
        }
    }

    /// Drives the request body writer through its full cycle. Returns the
    /// fault to report, if any; I/O errors on the socket bubble out.
    async fn ingest_body(&mut self, request: &mut Request) -> std::io::Result<Option<ErrorKind>> {
        let cap = self.ctx.max_body_size;
        if let (Some(max), Some(declared)) = (cap, request.content_length()) {
            if declared > max {
                return Ok(Some(ErrorKind::PayloadTooLarge));
            }
        }

        if let Err(error) = request.open_body() {
            tracing::warn!(remote = %self.remote, %error, "body writer failed to open");
            return Ok(Some(ErrorKind::BodyWriterFailure));
        }

        // The server-wide cap counts decoded bytes, so chunked bodies (which
        // declare no length) hit it too, whatever the sink variant.
        let chunked = request.is_chunked();
        let length = request.content_length().unwrap_or(0);
        let mut received: u64 = 0;
        let mut sink = |chunk: &[u8]| {
            received += chunk.len() as u64;
            if cap.is_some_and(|max| received > max) {
                return Err(BodyError::TooLarge);
            }
            request.write_body(chunk)
        };

        let result = match chunked {
            true => self.read_chunked(&mut sink).await,
            false => self.read_sized(length, &mut sink).await,
        };

        let kind = match result {
            Ok(()) => match request.close_body(true) {
                Ok(()) => None,
                Err(error) => {
                    tracing::warn!(remote = %self.remote, %error, "body writer failed to close");
                    Some(body_fault(error))
                }
            },
            Err(IngestError::Io(error)) => {
                let _ = request.close_body(false);
                return Err(error);
            }
            Err(IngestError::Body(error)) => {
                let _ = request.close_body(false);
                tracing::warn!(remote = %self.remote, %error, "body ingestion failed");
                Some(body_fault(error))
            }
            Err(IngestError::Framing) => {
                let _ = request.close_body(false);
                Some(ErrorKind::MalformedBody)
            }
        };
        Ok(kind)
    }

    /// Discards an unprocessed request body so the next keep-alive request
    /// stays in sync. Returns false when the body is too large to drain.
    async fn drain_body(&mut self, head: &RequestHead) -> bool {
        let probe = Request::new(head.clone());
        if !probe.has_body() {
            return true;
        }
        if probe.content_length().is_some_and(|len| len > MAX_DRAIN) {
            return false;
        }

        let mut allowance = MAX_DRAIN as usize;
        let mut sink = |chunk: &[u8]| {
            allowance = match allowance.checked_sub(chunk.len()) {
                Some(rest) => rest,
                None => return Err(BodyError::TooLarge),
            };
            Ok(())
        };

        let result = match probe.is_chunked() {
            true => self.read_chunked(&mut sink).await,
            false => self.read_sized(probe.content_length().unwrap_or(0), &mut sink).await,
        };
        result.is_ok()
    }

    async fn read_sized(
        &mut self,
        length: u64,
        sink: &mut impl FnMut(&[u8]) -> Result<(), BodyError>,
    ) -> Result<(), IngestError> {
        let mut remaining = length;
        while remaining > 0 {
            if self.buffer.is_empty() && self.fill().await.map_err(IngestError::Io)? == 0 {
                return Err(IngestError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                )));
            }
            let take = (self.buffer.len() as u64).min(remaining).min(BODY_SLICE as u64) as usize;
            if take == 0 {
                continue;
            }
            let chunk = self.buffer.split_to(take);
            sink(&chunk).map_err(IngestError::Body)?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Decodes `Transfer-Encoding: chunked` on the wire, feeding decoded
    /// bytes to the sink (RFC 7230 §4.1).
    async fn read_chunked(
        &mut self,
        sink: &mut impl FnMut(&[u8]) -> Result<(), BodyError>,
    ) -> Result<(), IngestError> {
        loop {
            let line = self.read_crlf_line().await?;
            let size_field = line
                .split(|&b| b == b';')
                .next()
                .unwrap_or(&[]);
            let size_text =
                std::str::from_utf8(size_field).map_err(|_| IngestError::Framing)?;
            let size = u64::from_str_radix(size_text.trim(), 16)
                .map_err(|_| IngestError::Framing)?;

            if size == 0 {
                // Trailer section: lines until the empty one.
                loop {
                    if self.read_crlf_line().await?.is_empty() {
                        return Ok(());
                    }
                }
            }

            self.read_sized(size, &mut *sink).await?;
            let terminator = self.read_exact_buffered(2).await?;
            if &terminator[..] != b"\r\n" {
                return Err(IngestError::Framing);
            }
        }
    }

    async fn read_crlf_line(&mut self) -> Result<Vec<u8>, IngestError> {
        loop {
            if let Some(pos) = memmem::find(&self.buffer, b"\r\n") {
                let line = self.buffer.split_to(pos + 2);
                return Ok(line[..pos].to_vec());
            }
            if self.buffer.len() > MAX_CHUNK_LINE {
                return Err(IngestError::Framing);
            }
            if self.fill().await.map_err(IngestError::Io)? == 0 {
                return Err(IngestError::Framing);
            }
        }
    }

    async fn read_exact_buffered(&mut self, count: usize) -> Result<Vec<u8>, IngestError> {
        while self.buffer.len() < count {
            if self.fill().await.map_err(IngestError::Io)? == 0 {
                return Err(IngestError::Framing);
            }
        }
        let bytes = self.buffer.split_to(count);
        Ok(bytes.to_vec())
    }
}

enum IngestError {
    Io(std::io::Error),
    Body(BodyError),
    Framing,
}

fn body_fault(error: BodyError) -> ErrorKind {
    match error {
        BodyError::TooLarge => ErrorKind::PayloadTooLarge,
        BodyError::Malformed(_) => ErrorKind::MalformedBody,
        BodyError::Io(_) => ErrorKind::BodyWriterFailure,
    }
}

// Outbound: header emission and body streaming.
impl Connection {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let write = self.stream.write_all(data);
        match self.ctx.write_timeout {
            Some(limit) => timeout(limit, write)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??,
            None => write.await?,
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Emits status line, headers (in contract order), and the body. Returns
    /// whether the connection survives for another request.
    async fn send_response(
        &mut self,
        mut response: Response,
        exchange: &Exchange,
    ) -> std::io::Result<bool> {
        let status = response.status();
        let body_forbidden = status.forbids_body();
        let has_body = response.has_body() && !body_forbidden;

        let gzip = has_body
            && response.gzip_content_encoding_enabled()
            && exchange.accepts_gzip
            && response.content_range().is_none()
            && exchange.version == Version::Http11;

        let length_unknown = gzip || response.content_length().is_none();
        let chunked = has_body && length_unknown && exchange.version == Version::Http11;
        // HTTP/1.0 cannot frame an unknown length; serve identity-to-close.
        let close = exchange.close
            || response.closes_connection()
            || (has_body && length_unknown && exchange.version == Version::Http10);

        let mut header = String::with_capacity(256);
        header.push_str(status.status_line(exchange.version));

        if has_body {
            if let Some(content_type) = response.content_type() {
                header.push_str("Content-Type: ");
                header.push_str(content_type);
                header.push_str("\r\n");
            }
            if chunked {
                header.push_str("Transfer-Encoding: chunked\r\n");
            } else if let Some(length) = response.content_length() {
                header.push_str(&format!("Content-Length: {length}\r\n"));
            }
        } else if !body_forbidden {
            header.push_str("Content-Length: 0\r\n");
        }

        header.push_str(match close {
            true => "Connection: Close\r\n",
            false => "Connection: Keep-Alive\r\n",
        });
        header.push_str("Server: ");
        header.push_str(&self.ctx.server_name);
        header.push_str("\r\n");
        header.push_str("Date: ");
        header.push_str(&httpdate::fmt_http_date(SystemTime::now()));
        header.push_str("\r\n");

        match response.cache_control_max_age() {
            0 => header.push_str("Cache-Control: no-cache\r\n"),
            age => header.push_str(&format!("Cache-Control: max-age={age}\r\n")),
        }
        if let Some(last_modified) = response.last_modified() {
            header.push_str("Last-Modified: ");
            header.push_str(&httpdate::fmt_http_date(last_modified));
            header.push_str("\r\n");
        }
        if let Some(etag) = response.etag() {
            header.push_str("ETag: ");
            header.push_str(etag);
            header.push_str("\r\n");
        }
        if gzip {
            header.push_str("Content-Encoding: gzip\r\n");
        }
        if let Some((start, end, total)) = response.content_range() {
            header.push_str(&format!("Content-Range: bytes {start}-{end}/{total}\r\n"));
        }
        for (name, value) in response.additional_headers().iter() {
            header.push_str(name);
            header.push_str(": ");
            header.push_str(value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");

        self.write_all(header.as_bytes()).await?;

        // HEAD keeps every header, including Content-Length, but no body.
        if !has_body || exchange.is_head {
            return Ok(!close);
        }

        match self.stream_body(&mut response, chunked, gzip).await {
            Ok(()) => Ok(!close),
            Err(error) => {
                // Headers are on the wire; this connection is done.
                tracing::warn!(remote = %self.remote, %error, "response body failed mid-stream");
                Ok(false)
            }
        }
    }

    async fn stream_body(
        &mut self,
        response: &mut Response,
        chunked: bool,
        gzip: bool,
    ) -> std::io::Result<()> {
        response.open_body().await?;
        let mut encoder = gzip.then(|| GzEncoder::new(Vec::new(), Compression::default()));

        loop {
            let chunk = response.read_body_chunk().await?;
            if chunk.is_empty() {
                break;
            }

            match &mut encoder {
                Some(encoder) => {
                    encoder.write_all(&chunk)?;
                    let compressed = std::mem::take(encoder.get_mut());
                    if !compressed.is_empty() {
                        self.write_chunk(&compressed, chunked).await?;
                    }
                }
                None => self.write_chunk(&chunk, chunked).await?,
            }
        }

        if let Some(encoder) = encoder {
            let compressed = encoder.finish()?;
            if !compressed.is_empty() {
                self.write_chunk(&compressed, chunked).await?;
            }
        }
        if chunked {
            self.write_all(b"0\r\n\r\n").await?;
        }

        response.close_body();
        Ok(())
    }

    async fn write_chunk(&mut self, data: &[u8], chunked: bool) -> std::io::Result<()> {
        if !chunked {
            return self.write_all(data).await;
        }
        let framed = format!("{:X}\r\n", data.len());
        self.write_all(framed.as_bytes()).await?;
        self.write_all(data).await?;
        self.write_all(b"\r\n").await
    }
}

fn is_not_modified(response: &Response, exchange: &Exchange) -> bool {
    // If-None-Match takes precedence over If-Modified-Since (RFC 7232 §6).
    if let Some(if_none_match) = &exchange.if_none_match {
        return match response.etag() {
            Some(etag) => if_none_match == etag || if_none_match == "*",
            None => false,
        };
    }

    match (exchange.if_modified_since, response.last_modified()) {
        (Some(since), Some(last_modified)) => truncate_to_seconds(last_modified) <= since,
        _ => false,
    }
}

// Header dates carry whole seconds; compare mtimes at that granularity.
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(since) => SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}

/// Parses the head block (request line + header lines, CRLF separated, blank
/// line already stripped) into a [`RequestHead`] plus the raw request target.
fn parse_head(block: &[u8]) -> Result<(RequestHead, String), ErrorKind> {
    let text = simdutf8::basic::from_utf8(block).map_err(|_| ErrorKind::MalformedHeaders)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ErrorKind::MalformedRequestLine)?;
    let mut parts = request_line.split(' ');
    let (Some(method_token), Some(target), Some(version_token), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ErrorKind::MalformedRequestLine);
    };

    let method = Method::from_token(method_token.as_bytes())?;
    if !version_token.starts_with("HTTP/") {
        return Err(ErrorKind::MalformedRequestLine);
    }
    let version = Version::from_bytes(version_token.as_bytes())?;
    if !target.starts_with('/') {
        return Err(ErrorKind::MalformedRequestLine);
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Folded continuation lines are rejected outright (RFC 7230 §3.2.4).
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ErrorKind::MalformedHeaders);
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ErrorKind::MalformedHeaders);
        };
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(ErrorKind::MalformedHeaders);
        }
        headers.set(name, value.trim());
    }

    // A Content-Length that does not parse, or one combined with chunked
    // framing, leaves the message length ambiguous.
    if let Some(value) = headers.get("content-length") {
        if value.trim().parse::<u64>().is_err() {
            return Err(ErrorKind::MalformedHeaders);
        }
        if headers.list_contains("transfer-encoding", "chunked") {
            return Err(ErrorKind::MalformedHeaders);
        }
    }

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let mut path = percent_decode_utf8(raw_path).ok_or(ErrorKind::MalformedRequestLine)?;
    if path.is_empty() {
        path.push('/');
    }
    let query = raw_query.map(parse_query);

    let host = headers.get("host").unwrap_or("localhost").to_string();
    let url = format!("http://{host}{target}");

    Ok((
        RequestHead {
            method,
            version,
            url,
            path,
            query,
            headers,
        },
        target.to_string(),
    ))
}
