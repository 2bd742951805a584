//! Streaming `multipart/form-data` parser.
//!
//! Driven chunk by chunk from the request body writer, so part payloads never
//! have to fit in one read. File parts (those carrying a `filename`) are
//! spooled straight to temp files; text parts accumulate in memory. The
//! parser keeps a bounded lookback so a boundary split across two writes is
//! still found.

use crate::http::request::BodyError;
use crate::mime::DEFAULT_MIME_TYPE;
use memchr::memmem::Finder;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// An uploaded file part, spooled to a temp file that is deleted when the
/// owning request is dropped.
pub struct MultiPartFile {
    filename: Option<String>,
    content_type: String,
    temp: NamedTempFile,
}

impl MultiPartFile {
    /// Location of the spooled payload. Copy it out to keep it.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// The client-supplied file name, as sent.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The part's content type (`application/octet-stream` when omitted).
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

impl std::fmt::Debug for MultiPartFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPartFile")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("path", &self.temp.path())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum State {
    /// Scanning for the first boundary delimiter; preamble bytes are ignored.
    Start,
    /// Just behind a delimiter, deciding between another part and the close.
    Boundary,
    /// Accumulating part header lines up to the blank line.
    Headers,
    /// Streaming part payload bytes until the next delimiter.
    Body,
    /// Closing delimiter seen; remaining input is epilogue and ignored.
    End,
}

enum PartSink {
    Memory(Vec<u8>),
    File(NamedTempFile),
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    sink: PartSink,
}

pub(crate) struct MultiPartParser {
    // "\r\n--<boundary>"; the buffer is seeded with CRLF so the very first
    // delimiter matches the same pattern as all the others.
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    state: State,
    current: Option<Part>,
    arguments: HashMap<String, String>,
    files: HashMap<String, MultiPartFile>,
}

impl MultiPartParser {
    pub(crate) fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter,
            buffer: b"\r\n".to_vec(),
            state: State::Start,
            current: None,
            arguments: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub(crate) fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        self.buffer.extend_from_slice(chunk);
        self.pump()
    }

    pub(crate) fn finish(
        mut self,
    ) -> Result<(HashMap<String, String>, HashMap<String, MultiPartFile>), BodyError> {
        self.pump()?;
        if self.state != State::End {
            return Err(BodyError::Malformed("truncated multipart body"));
        }
        Ok((self.arguments, self.files))
    }

    // Runs the state machine until no further transition is possible with the
    // bytes buffered so far.
    fn pump(&mut self) -> Result<(), BodyError> {
        loop {
            let advanced = match self.state {
                State::Start => self.step_start(),
                State::Boundary => self.step_boundary()?,
                State::Headers => self.step_headers()?,
                State::Body => self.step_body()?,
                State::End => {
                    self.buffer.clear();
                    false
                }
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    fn step_start(&mut self) -> bool {
        match Finder::new(&self.delimiter).find(&self.buffer) {
            Some(pos) => {
                self.buffer.drain(..pos + self.delimiter.len());
                self.state = State::Boundary;
                true
            }
            None => {
                // Preamble is discarded, keeping enough for a split delimiter.
                let keep = self.delimiter.len().saturating_sub(1);
                if self.buffer.len() > keep {
                    self.buffer.drain(..self.buffer.len() - keep);
                }
                false
            }
        }
    }

    fn step_boundary(&mut self) -> Result<bool, BodyError> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        match &self.buffer[..2] {
            b"--" => {
                self.state = State::End;
                Ok(true)
            }
            b"\r\n" => {
                self.buffer.drain(..2);
                self.state = State::Headers;
                Ok(true)
            }
            _ => Err(BodyError::Malformed("garbage after multipart boundary")),
        }
    }

    fn step_headers(&mut self) -> Result<bool, BodyError> {
        let Some(end) = Finder::new(b"\r\n\r\n").find(&self.buffer) else {
            return Ok(false);
        };

        let header_block = self.buffer[..end].to_vec();
        self.buffer.drain(..end + 4);
        self.current = Some(Self::parse_part_headers(&header_block)?);
        self.state = State::Body;
        Ok(true)
    }

    fn step_body(&mut self) -> Result<bool, BodyError> {
        match Finder::new(&self.delimiter).find(&self.buffer) {
            Some(pos) => {
                let payload = self.buffer[..pos].to_vec();
                self.buffer.drain(..pos + self.delimiter.len());
                self.append_to_current(&payload)?;
                self.complete_current()?;
                self.state = State::Boundary;
                Ok(true)
            }
            None => {
                // Flush everything that cannot still be a delimiter prefix.
                let keep = self.delimiter.len() + 3;
                if self.buffer.len() > keep {
                    let payload = self.buffer[..self.buffer.len() - keep].to_vec();
                    self.buffer.drain(..payload.len());
                    self.append_to_current(&payload)?;
                }
                Ok(false)
            }
        }
    }

    fn parse_part_headers(block: &[u8]) -> Result<Part, BodyError> {
        let text = simdutf8::basic::from_utf8(block)
            .map_err(|_| BodyError::Malformed("part headers are not valid UTF-8"))?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;

        for line in text.split("\r\n") {
            let Some((header, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            if header.eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(value, "name");
                filename = disposition_param(value, "filename");
            } else if header.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        let name = name.ok_or(BodyError::Malformed("part missing field name"))?;
        let sink = match filename {
            Some(_) => PartSink::File(NamedTempFile::new()?),
            None => PartSink::Memory(Vec::new()),
        };

        Ok(Part {
            name,
            filename,
            content_type,
            sink,
        })
    }

    fn append_to_current(&mut self, payload: &[u8]) -> Result<(), BodyError> {
        let part = self.current.as_mut().expect("no part in body state");
        match &mut part.sink {
            PartSink::Memory(buffer) => buffer.extend_from_slice(payload),
            PartSink::File(file) => file.write_all(payload)?,
        }
        Ok(())
    }

    fn complete_current(&mut self) -> Result<(), BodyError> {
        let part = self.current.take().expect("no part to complete");
        match part.sink {
            PartSink::Memory(buffer) => {
                let text = simdutf8::basic::from_utf8(&buffer)
                    .map_err(|_| BodyError::Malformed("text part is not valid UTF-8"))?;
                self.arguments.insert(part.name, text.to_string());
            }
            PartSink::File(mut temp) => {
                temp.flush()?;
                self.files.insert(
                    part.name,
                    MultiPartFile {
                        filename: part.filename,
                        content_type: part
                            .content_type
                            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
                        temp,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Pulls one parameter out of a `Content-Disposition` value such as
/// `form-data; name="field"; filename="photo.png"`.
fn disposition_param(value: &str, key: &str) -> Option<String> {
    for param in value.split(';').skip(1) {
        let Some((k, v)) = param.split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case(key) {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----test9a3f";

    fn body(parts: &[(&str, Option<&str>, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, content_type, payload) in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let mut disposition = format!("Content-Disposition: form-data; name=\"{name}\"");
            if let Some(filename) = filename {
                disposition.push_str(&format!("; filename=\"{filename}\""));
            }
            out.extend_from_slice(disposition.as_bytes());
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = content_type {
                out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    fn parse(data: &[u8], chunk_size: usize) -> (HashMap<String, String>, HashMap<String, MultiPartFile>) {
        let mut parser = MultiPartParser::new(BOUNDARY);
        for chunk in data.chunks(chunk_size) {
            parser.write(chunk).unwrap();
        }
        parser.finish().unwrap()
    }

    #[test]
    fn single_text_field() {
        let data = body(&[("greeting", None, None, b"hello")]);
        let (arguments, files) = parse(&data, data.len());

        assert_eq!(arguments.len(), 1);
        assert_eq!(arguments["greeting"], "hello");
        assert!(files.is_empty());
    }

    #[test]
    fn fields_and_file() {
        let data = body(&[
            ("title", None, None, b"report"),
            ("upload", Some("r.bin"), Some("application/octet-stream"), &[0u8, 1, 2, 255]),
        ]);
        let (arguments, files) = parse(&data, data.len());

        assert_eq!(arguments["title"], "report");
        let file = &files["upload"];
        assert_eq!(file.filename(), Some("r.bin"));
        assert_eq!(file.content_type(), "application/octet-stream");
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0u8, 1, 2, 255]);
    }

    #[test]
    fn boundary_split_across_writes() {
        let data = body(&[
            ("a", None, None, b"first part"),
            ("b", None, None, b"second part"),
        ]);

        // Byte-at-a-time is the worst case for delimiter reassembly.
        for chunk_size in [1, 2, 3, 7] {
            let (arguments, _) = parse(&data, chunk_size);
            assert_eq!(arguments["a"], "first part", "chunk_size={chunk_size}");
            assert_eq!(arguments["b"], "second part", "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn payload_containing_near_boundary() {
        let tricky = format!("\r\n--{}", &BOUNDARY[..BOUNDARY.len() - 1]);
        let data = body(&[("t", None, None, tricky.as_bytes())]);
        let (arguments, _) = parse(&data, 4);

        assert_eq!(arguments["t"], tricky);
    }

    #[test]
    fn preamble_is_ignored() {
        let mut data = b"this is preamble text\r\n".to_vec();
        data.extend_from_slice(&body(&[("k", None, None, b"v")]));
        let (arguments, _) = parse(&data, data.len());

        assert_eq!(arguments["k"], "v");
    }

    #[test]
    fn truncated_body_fails() {
        let mut data = body(&[("k", None, None, b"v")]);
        data.truncate(data.len() - 6); // chop the closing delimiter

        let mut parser = MultiPartParser::new(BOUNDARY);
        parser.write(&data).unwrap();
        assert!(matches!(
            parser.finish(),
            Err(BodyError::Malformed(_))
        ));
    }

    #[test]
    fn part_without_name_fails() {
        let data = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
        );

        let mut parser = MultiPartParser::new(BOUNDARY);
        assert!(parser.write(data.as_bytes()).is_err());
    }

    #[test]
    fn disposition_params() {
        let value = "form-data; name=\"photo\"; filename=\"cat.png\"";
        assert_eq!(disposition_param(value, "name").as_deref(), Some("photo"));
        assert_eq!(disposition_param(value, "filename").as_deref(), Some("cat.png"));
        assert_eq!(disposition_param(value, "missing"), None);
    }
}
