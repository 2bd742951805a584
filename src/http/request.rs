use crate::http::multipart::{MultiPartFile, MultiPartParser};
use crate::http::query::parse_urlencoded_form;
use crate::http::types::{ByteRange, Headers, Method, Version};
use crate::mime::DEFAULT_MIME_TYPE;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Failure inside a request body writer. Mapped to an HTTP status by the
/// connection before the handler's process function ever runs.
#[derive(Debug, Error)]
pub(crate) enum BodyError {
    #[error("request body exceeds the configured cap")]
    TooLarge,

    #[error("malformed request body: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The parsed request line and headers, as seen by handler match functions.
///
/// `url` is the absolute URL reconstructed from the `Host` header and the
/// request target; `path` is percent-decoded and never empty (`"/"` for the
/// root); `query` is absent when the target carries no `?`.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub version: Version,
    pub url: String,
    pub path: String,
    pub query: Option<HashMap<String, String>>,
    pub headers: Headers,
}

/// Selects the body sink a matched handler wants the request ingested into.
///
/// The original design expressed these as request subclasses; the set is
/// closed, so a tagged variant plus dispatch inside [`Request`] covers it.
#[derive(Debug, Clone, Default)]
pub enum BodyKind {
    /// Discard nothing, expect nothing: requests without a payload.
    #[default]
    None,
    /// Accumulate the payload in memory, optionally capped.
    Data { max_size: Option<usize> },
    /// Spool the payload to a temporary file (deleted when the request is
    /// dropped). `directory` of `None` uses the process temp root.
    File { directory: Option<PathBuf> },
    /// Parse an `application/x-www-form-urlencoded` payload into arguments.
    UrlEncodedForm,
    /// Parse a `multipart/form-data` payload into arguments and files.
    MultiPartForm,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum WriterState {
    Idle,
    Open,
    Closed,
}

enum RequestBody {
    None,
    Data {
        max_size: Option<usize>,
        buffer: Vec<u8>,
    },
    File {
        directory: Option<PathBuf>,
        file: Option<NamedTempFile>,
    },
    UrlEncodedForm {
        buffer: Vec<u8>,
        arguments: HashMap<String, String>,
    },
    MultiPartForm {
        parser: Option<MultiPartParser>,
        arguments: HashMap<String, String>,
        files: HashMap<String, MultiPartFile>,
    },
}

/// An HTTP request. Metadata is immutable after construction; the body sink
/// fills exactly once while the connection ingests the payload.
///
/// Constructed by handler match functions via [`Request::new`] /
/// [`Request::with_body`] and handed back to the handler's process function
/// once the body is complete.
pub struct Request {
    head: RequestHead,
    content_type: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
    byte_range: Option<ByteRange>,
    if_modified_since: Option<SystemTime>,
    if_none_match: Option<String>,
    accepts_gzip: bool,
    body: RequestBody,
    writer: WriterState,
}

impl Request {
    /// A request with no body sink ([`BodyKind::None`]).
    pub fn new(head: RequestHead) -> Self {
        Self::with_body(head, BodyKind::None)
    }

    /// A request whose payload is ingested into the given sink.
    pub fn with_body(head: RequestHead, kind: BodyKind) -> Self {
        let headers = &head.headers;

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let chunked = headers.list_contains("transfer-encoding", "chunked");
        let has_body = chunked || content_length.is_some_and(|n| n > 0);

        let content_type = match headers.get("content-type") {
            Some(value) => Some(value.to_string()),
            None if has_body => Some(DEFAULT_MIME_TYPE.to_string()),
            None => None,
        };

        let byte_range = headers.get("range").and_then(ByteRange::parse);
        let if_modified_since = headers
            .get("if-modified-since")
            .and_then(|v| httpdate::parse_http_date(v).ok());
        let if_none_match = headers.get("if-none-match").map(|v| v.trim().to_string());
        let accepts_gzip = headers
            .get("accept-encoding")
            .is_some_and(accept_encoding_allows_gzip);

        let body = match kind {
            BodyKind::None => RequestBody::None,
            BodyKind::Data { max_size } => RequestBody::Data {
                max_size,
                buffer: Vec::new(),
            },
            BodyKind::File { directory } => RequestBody::File {
                directory,
                file: None,
            },
            BodyKind::UrlEncodedForm => RequestBody::UrlEncodedForm {
                buffer: Vec::new(),
                arguments: HashMap::new(),
            },
            BodyKind::MultiPartForm => RequestBody::MultiPartForm {
                parser: None,
                arguments: HashMap::new(),
                files: HashMap::new(),
            },
        };

        Self {
            head,
            content_type,
            content_length,
            chunked,
            byte_range,
            if_modified_since,
            if_none_match,
            accepts_gzip,
            body,
            writer: WriterState::Idle,
        }
    }
}

// Metadata accessors
impl Request {
    #[inline]
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The absolute request URL, reconstructed from `Host` and the target.
    #[inline]
    pub fn url(&self) -> &str {
        &self.head.url
    }

    /// The percent-decoded path; `"/"` for the root, never empty.
    #[inline]
    pub fn path(&self) -> &str {
        &self.head.path
    }

    /// Decoded query parameters, absent when the target had no `?`.
    #[inline]
    pub fn query(&self) -> Option<&HashMap<String, String>> {
        self.head.query.as_ref()
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// The payload content type. `application/octet-stream` is assumed when a
    /// body is present without a `Content-Type` header; `None` means no body.
    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Declared payload length. `None` with [`Request::has_body`] true means
    /// the payload arrives chunked.
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline]
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|n| n > 0)
    }

    #[inline]
    pub(crate) fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// The single byte range requested via `Range`, if any.
    #[inline]
    pub fn byte_range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    /// Parsed `If-Modified-Since` date.
    #[inline]
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    /// Raw `If-None-Match` value (an exact ETag or `*`).
    #[inline]
    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    /// True when `Accept-Encoding` lists gzip with a non-zero quality.
    #[inline]
    pub fn accepts_gzip_content_encoding(&self) -> bool {
        self.accepts_gzip
    }
}

// Body writer: one open, any number of writes, one close.
impl Request {
    pub(crate) fn open_body(&mut self) -> Result<(), BodyError> {
        debug_assert!(self.writer == WriterState::Idle, "body opened twice");
        self.writer = WriterState::Open;

        match &mut self.body {
            RequestBody::File { directory, file } => {
                let temp = match directory {
                    Some(dir) => NamedTempFile::new_in(dir)?,
                    None => NamedTempFile::new()?,
                };
                *file = Some(temp);
            }
            RequestBody::MultiPartForm { parser, .. } => {
                let boundary = self
                    .content_type
                    .as_deref()
                    .and_then(boundary_from_content_type)
                    .ok_or(BodyError::Malformed("missing multipart boundary"))?;
                *parser = Some(MultiPartParser::new(&boundary));
            }
            _ => {}
        }

        Ok(())
    }

    pub(crate) fn write_body(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        debug_assert!(self.writer == WriterState::Open, "write outside open/close");

        match &mut self.body {
            RequestBody::None => Ok(()),
            RequestBody::Data { max_size, buffer } => {
                if max_size.is_some_and(|max| buffer.len() + chunk.len() > max) {
                    return Err(BodyError::TooLarge);
                }
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            RequestBody::File { file, .. } => {
                let file = file.as_mut().expect("body not open");
                file.write_all(chunk)?;
                Ok(())
            }
            RequestBody::UrlEncodedForm { buffer, .. } => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            RequestBody::MultiPartForm { parser, .. } => {
                parser.as_mut().expect("body not open").write(chunk)
            }
        }
    }

    pub(crate) fn close_body(&mut self, success: bool) -> Result<(), BodyError> {
        debug_assert!(self.writer == WriterState::Open, "close without open");
        self.writer = WriterState::Closed;

        if !success {
            return Ok(());
        }

        match &mut self.body {
            RequestBody::File { file, .. } => {
                file.as_mut().expect("body not open").flush()?;
                Ok(())
            }
            RequestBody::UrlEncodedForm { buffer, arguments } => {
                *arguments = parse_urlencoded_form(buffer);
                buffer.clear();
                Ok(())
            }
            RequestBody::MultiPartForm {
                parser,
                arguments,
                files,
            } => {
                let (parsed_arguments, parsed_files) =
                    parser.take().expect("body not open").finish()?;
                *arguments = parsed_arguments;
                *files = parsed_files;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// Body accessors, meaningful once the writer has closed successfully.
impl Request {
    /// The in-memory payload of a [`BodyKind::Data`] request.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            RequestBody::Data { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    /// The payload interpreted as UTF-8 text, when it is valid.
    pub fn text(&self) -> Option<&str> {
        self.data().and_then(|data| simdutf8::basic::from_utf8(data).ok())
    }

    /// Path of the spooled payload of a [`BodyKind::File`] request. The file
    /// is deleted when the request is dropped; callers keep it by copying.
    pub fn temp_file_path(&self) -> Option<&Path> {
        match &self.body {
            RequestBody::File { file, .. } => file.as_ref().map(|f| f.path()),
            _ => None,
        }
    }

    /// Decoded form fields of a [`BodyKind::UrlEncodedForm`] or
    /// [`BodyKind::MultiPartForm`] request.
    pub fn arguments(&self) -> Option<&HashMap<String, String>> {
        match &self.body {
            RequestBody::UrlEncodedForm { arguments, .. } => Some(arguments),
            RequestBody::MultiPartForm { arguments, .. } => Some(arguments),
            _ => None,
        }
    }

    /// Uploaded file parts of a [`BodyKind::MultiPartForm`] request, keyed by
    /// field name. Temp files are deleted when the request is dropped.
    pub fn files(&self) -> Option<&HashMap<String, MultiPartFile>> {
        match &self.body {
            RequestBody::MultiPartForm { files, .. } => Some(files),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("url", &self.head.url)
            .field("content_length", &self.content_length)
            .field("chunked", &self.chunked)
            .finish_non_exhaustive()
    }
}

fn accept_encoding_allows_gzip(value: &str) -> bool {
    for item in value.split(',') {
        let mut parts = item.trim().split(';');
        let coding = parts.next().unwrap_or("").trim();
        if !coding.eq_ignore_ascii_case("gzip") {
            continue;
        }

        let q = parts
            .find_map(|p| p.trim().strip_prefix("q=").map(str::trim))
            .and_then(|q| q.parse::<f32>().ok())
            .unwrap_or(1.0);
        return q > 0.0;
    }
    false
}

/// Extracts the `boundary` parameter from a `multipart/form-data` content type.
pub(crate) fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if !parts
        .next()?
        .trim()
        .eq_ignore_ascii_case("multipart/form-data")
    {
        return None;
    }

    for param in parts {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(headers: &[(&str, &str)]) -> RequestHead {
        let mut map = Headers::new();
        for (name, value) in headers {
            map.set(*name, *value);
        }
        RequestHead {
            method: Method::Post,
            version: Version::Http11,
            url: "http://localhost/upload".to_string(),
            path: "/upload".to_string(),
            query: None,
            headers: map,
        }
    }

    #[test]
    fn metadata_from_headers() {
        let request = Request::new(head_with(&[
            ("Content-Length", "42"),
            ("Content-Type", "text/plain"),
            ("Range", "bytes=2-5"),
            ("If-None-Match", "\"v1\""),
            ("Accept-Encoding", "gzip, deflate"),
        ]));

        assert_eq!(request.content_length(), Some(42));
        assert_eq!(request.content_type(), Some("text/plain"));
        assert!(request.has_body());
        assert!(!request.is_chunked());
        assert_eq!(
            request.byte_range(),
            Some(ByteRange::Bounded { offset: 2, length: 4 })
        );
        assert_eq!(request.if_none_match(), Some("\"v1\""));
        assert!(request.accepts_gzip_content_encoding());
    }

    #[test]
    fn default_content_type_with_body() {
        let request = Request::new(head_with(&[("Content-Length", "5")]));
        assert_eq!(request.content_type(), Some(DEFAULT_MIME_TYPE));

        let request = Request::new(head_with(&[]));
        assert_eq!(request.content_type(), None);
        assert!(!request.has_body());
    }

    #[test]
    fn chunked_body_has_unknown_length() {
        let request = Request::new(head_with(&[("Transfer-Encoding", "chunked")]));
        assert!(request.has_body());
        assert!(request.is_chunked());
        assert_eq!(request.content_length(), None);
    }

    #[test]
    fn accept_encoding_q_values() {
        #[rustfmt::skip]
        let cases = [
            ("gzip",                 true),
            ("gzip, deflate",        true),
            ("deflate, gzip;q=0.5",  true),
            ("GZIP",                 true),
            ("gzip;q=0",             false),
            ("gzip;q=0.0",           false),
            ("deflate",              false),
            ("",                     false),
        ];

        for (value, expected) in cases {
            assert_eq!(accept_encoding_allows_gzip(value), expected, "{value:?}");
        }
    }

    #[test]
    fn data_body_lifecycle() {
        let mut request =
            Request::with_body(head_with(&[("Content-Length", "10")]), BodyKind::Data {
                max_size: None,
            });

        request.open_body().unwrap();
        request.write_body(b"hello ").unwrap();
        request.write_body(b"world").unwrap();
        request.close_body(true).unwrap();

        assert_eq!(request.data(), Some(&b"hello world"[..]));
        assert_eq!(request.text(), Some("hello world"));
    }

    #[test]
    fn data_body_respects_cap() {
        let mut request =
            Request::with_body(head_with(&[("Content-Length", "10")]), BodyKind::Data {
                max_size: Some(4),
            });

        request.open_body().unwrap();
        assert!(matches!(
            request.write_body(b"hello"),
            Err(BodyError::TooLarge)
        ));
    }

    #[test]
    fn file_body_spools_to_disk() {
        let mut request = Request::with_body(
            head_with(&[("Content-Length", "12")]),
            BodyKind::File { directory: None },
        );

        request.open_body().unwrap();
        request.write_body(b"spooled ").unwrap();
        request.write_body(b"data").unwrap();
        request.close_body(true).unwrap();

        let path = request.temp_file_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"spooled data");

        drop(request);
        assert!(!path.exists(), "temp file must vanish with the request");
    }

    #[test]
    fn urlencoded_body_parses_on_close() {
        let mut request = Request::with_body(
            head_with(&[(
                "Content-Type",
                "application/x-www-form-urlencoded",
            )]),
            BodyKind::UrlEncodedForm,
        );

        request.open_body().unwrap();
        request.write_body(b"a=1&b=tw").unwrap();
        request.write_body(b"o%20words").unwrap();
        request.close_body(true).unwrap();

        let arguments = request.arguments().unwrap();
        assert_eq!(arguments["a"], "1");
        assert_eq!(arguments["b"], "two words");
    }

    #[test]
    fn multipart_requires_boundary() {
        let mut request = Request::with_body(
            head_with(&[("Content-Type", "multipart/form-data")]),
            BodyKind::MultiPartForm,
        );

        assert!(matches!(
            request.open_body(),
            Err(BodyError::Malformed(_))
        ));
    }

    #[test]
    fn boundary_extraction() {
        #[rustfmt::skip]
        let cases = [
            ("multipart/form-data; boundary=xYz",        Some("xYz")),
            ("multipart/form-data; boundary=\"a b\"",    Some("a b")),
            ("Multipart/Form-Data; boundary=q",          Some("q")),
            ("multipart/form-data",                      None),
            ("multipart/form-data; boundary=",           None),
            ("text/plain; boundary=x",                   None),
        ];

        for (value, expected) in cases {
            assert_eq!(
                boundary_from_content_type(value).as_deref(),
                expected,
                "{value:?}"
            );
        }
    }
}
