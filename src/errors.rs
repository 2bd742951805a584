use crate::http::types::StatusCode;
use std::io;
use thiserror::Error;

/// Errors surfaced by the public [`Server`](crate::Server) API.
///
/// Connection-level faults never reach this type: they are translated into
/// HTTP status responses on the wire and logged, per the propagation policy
/// of the crate.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while the server is already bound.
    #[error("server is already running")]
    AlreadyRunning,

    /// An operation that requires a bound socket was called on a stopped server.
    #[error("server is not running")]
    NotRunning,

    /// The handler list may only change while no socket is bound.
    #[error("handlers cannot be modified while the server is running")]
    HandlersLocked,

    /// A convenience handler was registered with an unusable configuration
    /// (bad path regex, base path without surrounding slashes).
    #[error("invalid handler configuration: {0}")]
    InvalidHandler(String),

    /// Binding the listen socket failed.
    #[error("failed to bind port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connection-level fault, mapped onto an HTTP status before any response
/// byte has been emitted. Faults after the status line has started are fatal
/// for the connection only.
#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    #[error("malformed request line")]
    MalformedRequestLine,

    #[error("malformed headers")]
    MalformedHeaders,

    #[error("header block exceeds the size cap")]
    HeadersTooLarge,

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("method not implemented")]
    UnknownMethod,

    #[error("no handler matched the URL")]
    NotFound,

    #[error("a handler matched the URL but not the method")]
    MethodNotAllowed,

    #[error("request body exceeds the configured cap")]
    PayloadTooLarge,

    #[error("malformed request body")]
    MalformedBody,

    #[error("request body writer reported failure")]
    BodyWriterFailure,

    #[error("handler produced no response")]
    HandlerReturnedNone,

    #[error("requested range is not satisfiable")]
    RangeNotSatisfiable,

    #[error("i/o failure on the connection")]
    Io(#[from] io::Error),
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::MalformedRequestLine, Self::MalformedRequestLine) => true,
            (Self::MalformedHeaders, Self::MalformedHeaders) => true,
            (Self::HeadersTooLarge, Self::HeadersTooLarge) => true,
            (Self::UnsupportedVersion, Self::UnsupportedVersion) => true,
            (Self::UnknownMethod, Self::UnknownMethod) => true,
            (Self::NotFound, Self::NotFound) => true,
            (Self::MethodNotAllowed, Self::MethodNotAllowed) => true,
            (Self::PayloadTooLarge, Self::PayloadTooLarge) => true,
            (Self::MalformedBody, Self::MalformedBody) => true,
            (Self::BodyWriterFailure, Self::BodyWriterFailure) => true,
            (Self::HandlerReturnedNone, Self::HandlerReturnedNone) => true,
            (Self::RangeNotSatisfiable, Self::RangeNotSatisfiable) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl ErrorKind {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequestLine => StatusCode::BadRequest,
            Self::MalformedHeaders => StatusCode::BadRequest,
            Self::HeadersTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            Self::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            Self::UnknownMethod => StatusCode::NotImplemented,
            Self::NotFound => StatusCode::NotFound,
            Self::MethodNotAllowed => StatusCode::MethodNotAllowed,
            Self::PayloadTooLarge => StatusCode::PayloadTooLarge,
            Self::MalformedBody => StatusCode::BadRequest,
            Self::BodyWriterFailure => StatusCode::InternalServerError,
            Self::HandlerReturnedNone => StatusCode::InternalServerError,
            Self::RangeNotSatisfiable => StatusCode::RangeNotSatisfiable,
            Self::Io(_) => StatusCode::InternalServerError,
        }
    }

    // Framing faults leave the input stream unsynchronized, so the error
    // response is best-effort and the socket closes. Everything else keeps
    // the connection alive for the next request.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedRequestLine
                | Self::MalformedHeaders
                | Self::HeadersTooLarge
                | Self::MalformedBody
                | Self::BodyWriterFailure
                | Self::Io(_)
        )
    }
}
