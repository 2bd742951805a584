use crate::http::types::{ByteRange, Headers, StatusCode};
use crate::mime::mime_type_for_path;
use futures::future::BoxFuture;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const FILE_READ_CHUNK: usize = 32 * 1024;

/// Producer behind a streamed response: called repeatedly for the next chunk,
/// returning an empty buffer at end of stream.
pub type StreamProducer = Box<dyn FnMut() -> BoxFuture<'static, io::Result<Vec<u8>>> + Send>;

enum ResponseBody {
    None,
    Data {
        data: Vec<u8>,
        consumed: bool,
    },
    File {
        path: PathBuf,
        offset: u64,
        remaining: u64,
        total: u64,
        allow_ranges: bool,
        file: Option<File>,
    },
    Stream {
        producer: StreamProducer,
    },
}

/// An HTTP response. Mutable until the connection starts reading the body,
/// which happens at most once, sequentially from offset zero.
///
/// A `content_type` of `None` means the response has no body. A present body
/// with unknown `content_length` goes out with chunked transfer encoding.
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_length: Option<u64>,
    cache_control_max_age: u32,
    last_modified: Option<SystemTime>,
    etag: Option<String>,
    gzip_content_encoding_enabled: bool,
    chunked_transfer_encoding: bool,
    close_connection: bool,
    additional_headers: Headers,
    content_range: Option<(u64, u64, u64)>,
    body: ResponseBody,
}

impl Response {
    /// An empty `200 OK` response with no body.
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            content_type: None,
            content_length: None,
            cache_control_max_age: 0,
            last_modified: None,
            etag: None,
            gzip_content_encoding_enabled: false,
            chunked_transfer_encoding: false,
            close_connection: false,
            additional_headers: Headers::new(),
            content_range: None,
            body: ResponseBody::None,
        }
    }

    /// An empty response with the given status.
    pub fn with_status(status: StatusCode) -> Self {
        let mut response = Self::new();
        response.status = status;
        response
    }

    /// A redirect to `location`: `301 Moved Permanently` or `302 Found`.
    pub fn redirect(location: impl Into<String>, permanent: bool) -> Self {
        let mut response = Self::with_status(match permanent {
            true => StatusCode::MovedPermanently,
            false => StatusCode::Found,
        });
        response.additional_headers.set("Location", location.into());
        response
    }

    /// A redirect that keeps the request method on the retry: `308 Permanent
    /// Redirect` or `307 Temporary Redirect`. Use for non-GET targets.
    pub fn redirect_preserving_method(location: impl Into<String>, permanent: bool) -> Self {
        let mut response = Self::with_status(match permanent {
            true => StatusCode::PermanentRedirect,
            false => StatusCode::TemporaryRedirect,
        });
        response.additional_headers.set("Location", location.into());
        response
    }

    /// An in-memory body with the given content type.
    pub fn data(data: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        let data = data.into();
        let mut response = Self::new();
        response.content_type = Some(content_type.into());
        response.content_length = Some(data.len() as u64);
        response.body = ResponseBody::Data {
            data,
            consumed: false,
        };
        response
    }

    /// A UTF-8 plain-text body.
    pub fn text(text: impl Into<String>) -> Self {
        Self::data(text.into().into_bytes(), "text/plain; charset=utf-8")
    }

    /// An HTML body.
    pub fn html(html: impl Into<String>) -> Self {
        Self::data(html.into().into_bytes(), "text/html; charset=utf-8")
    }

    /// A pre-serialized JSON body.
    pub fn json(json: impl Into<Vec<u8>>) -> Self {
        Self::data(json, "application/json")
    }

    /// A file-backed body covering the whole file. Content type comes from
    /// the extension, `Last-Modified` from the file's mtime, and a weak
    /// validator ETag from size and mtime.
    pub async fn file(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::file_with_options(path, None, false, true).await
    }

    /// A file-backed body with an explicit byte range, attachment
    /// disposition, and range-request opt-out for the serving connection.
    pub async fn file_with_options(
        path: impl Into<PathBuf>,
        byte_range: Option<ByteRange>,
        is_attachment: bool,
        allow_ranges: bool,
    ) -> io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file"));
        }

        let total = metadata.len();
        let modified = metadata.modified().ok();

        let mut response = Self::new();
        response.content_type = Some(mime_type_for_path(&path));
        response.content_length = Some(total);
        response.last_modified = modified;
        response.etag = modified.map(|m| file_etag(total, m));

        if is_attachment {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            response.additional_headers.set(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", filename.replace('"', "")),
            );
        }

        response.body = ResponseBody::File {
            path,
            offset: 0,
            remaining: total,
            total,
            allow_ranges,
            file: None,
        };

        if let Some(range) = byte_range {
            response
                .apply_byte_range(range)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "unsatisfiable range"))?;
        }

        Ok(response)
    }

    /// A streamed body produced by a user closure. Length is unknown, so the
    /// response always goes out chunked.
    pub fn stream(content_type: impl Into<String>, producer: StreamProducer) -> Self {
        let mut response = Self::new();
        response.content_type = Some(content_type.into());
        response.chunked_transfer_encoding = true;
        response.body = ResponseBody::Stream { producer };
        response
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

// Metadata
impl Response {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline]
    pub fn has_body(&self) -> bool {
        self.content_type.is_some()
    }

    /// Seconds for `Cache-Control: max-age=N`; zero emits `no-cache`.
    pub fn set_cache_control_max_age(&mut self, seconds: u32) {
        self.cache_control_max_age = seconds;
    }

    #[inline]
    pub fn cache_control_max_age(&self) -> u32 {
        self.cache_control_max_age
    }

    pub fn set_last_modified(&mut self, date: SystemTime) {
        self.last_modified = Some(date);
    }

    #[inline]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.etag = Some(etag.into());
    }

    #[inline]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Opt in to gzip content encoding; applied only when the client also
    /// negotiated it with `Accept-Encoding: gzip`.
    pub fn set_gzip_content_encoding_enabled(&mut self, enabled: bool) {
        self.gzip_content_encoding_enabled = enabled;
    }

    #[inline]
    pub fn gzip_content_encoding_enabled(&self) -> bool {
        self.gzip_content_encoding_enabled
    }

    pub fn set_chunked_transfer_encoding(&mut self, enabled: bool) {
        self.chunked_transfer_encoding = enabled;
    }

    /// Chunked is forced whenever the body length is unknown.
    #[inline]
    pub fn uses_chunked_transfer_encoding(&self) -> bool {
        self.chunked_transfer_encoding || (self.has_body() && self.content_length.is_none())
    }

    /// Handler opt-out of keep-alive for this connection.
    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    #[inline]
    pub fn closes_connection(&self) -> bool {
        self.close_connection
    }

    /// Adds or replaces an additional response header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.additional_headers.set(name, value);
    }

    #[inline]
    pub fn additional_headers(&self) -> &Headers {
        &self.additional_headers
    }

    #[inline]
    pub(crate) fn content_range(&self) -> Option<(u64, u64, u64)> {
        self.content_range
    }
}

// Range application and the body reader, driven by the connection.
impl Response {
    /// Whether the serving connection may apply a request `Range` header.
    pub(crate) fn supports_byte_ranges(&self) -> bool {
        matches!(
            self.body,
            ResponseBody::File {
                allow_ranges: true,
                offset: 0,
                ..
            }
        ) && self.status == StatusCode::Ok
    }

    /// Clamps `range` against the file body. On success the response becomes
    /// `206 Partial Content` with an adjusted length and a `Content-Range`
    /// triple; a wholly unsatisfiable range is reported for a 416.
    pub(crate) fn apply_byte_range(&mut self, range: ByteRange) -> Result<(), u64> {
        let ResponseBody::File {
            offset,
            remaining,
            total,
            ..
        } = &mut self.body
        else {
            return Ok(());
        };

        let Some((start, length)) = range.resolve(*total) else {
            return Err(*total);
        };

        *offset = start;
        *remaining = length;
        self.content_length = Some(length);
        self.content_range = Some((start, start + length - 1, *total));
        self.status = StatusCode::PartialContent;
        Ok(())
    }

    /// Rewrites the response into `304 Not Modified`: validators and cache
    /// headers survive, the body and its framing headers do not.
    pub(crate) fn make_not_modified(&mut self) {
        self.status = StatusCode::NotModified;
        self.content_type = None;
        self.content_length = None;
        self.chunked_transfer_encoding = false;
        self.content_range = None;
        self.body = ResponseBody::None;
    }

    pub(crate) async fn open_body(&mut self) -> io::Result<()> {
        if let ResponseBody::File {
            path, offset, file, ..
        } = &mut self.body
        {
            let mut opened = File::open(&path).await?;
            if *offset > 0 {
                opened.seek(SeekFrom::Start(*offset)).await?;
            }
            *file = Some(opened);
        }
        Ok(())
    }

    /// Produces the next body chunk; an empty buffer signals end of stream.
    pub(crate) async fn read_body_chunk(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.body {
            ResponseBody::None => Ok(Vec::new()),
            ResponseBody::Data { data, consumed } => match *consumed {
                true => Ok(Vec::new()),
                false => {
                    *consumed = true;
                    Ok(std::mem::take(data))
                }
            },
            ResponseBody::File {
                remaining, file, ..
            } => {
                if *remaining == 0 {
                    return Ok(Vec::new());
                }
                let file = file.as_mut().expect("body not open");

                let want = FILE_READ_CHUNK.min(*remaining as usize);
                let mut chunk = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut chunk[filled..]).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file shrank while serving",
                        ));
                    }
                    filled += n;
                }
                *remaining -= want as u64;
                Ok(chunk)
            }
            ResponseBody::Stream { producer } => producer().await,
        }
    }

    pub(crate) fn close_body(&mut self) {
        if let ResponseBody::File { file, .. } = &mut self.body {
            *file = None;
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

fn file_etag(len: u64, modified: SystemTime) -> String {
    let seconds = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    format!("\"{len:x}-{seconds:x}\"")
}
