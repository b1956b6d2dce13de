//! Error types.
//!
//! Two layers:
//!
//! - [`HttpError`] is an application-facing error that *is* a response: a
//!   status plus a message body. Return it (or `?` it) from a handler and the
//!   peer receives it verbatim.
//! - [`Error`] is everything the engine itself can run into. Protocol and
//!   body-parsing errors render into responses; transport anomalies (reset,
//!   broken pipe, idle timeout) end the connection quietly and never reach
//!   application code.

use std::fmt;
use std::io;

use bytes::Bytes;
use tokio_tungstenite::tungstenite;

use crate::response::{IntoResponse, Response};
use crate::status::Status;

/// The error type returned by hearth's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request head, malformed body encoding, or a field too large.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request body's media type has no decoder.
    #[error("don't know how to parse {0}")]
    UnsupportedBody(String),

    /// A numeric status code outside the known set.
    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    /// The peer closed the stream in the middle of a message.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// No request arrived within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// Sending on a WebSocket that is closing or closed.
    #[error("websocket is closed")]
    WebsocketClosed,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("websocket: {0}")]
    Websocket(#[from] tungstenite::Error),
}

impl Error {
    /// Whether this error means the transport is gone (or should be treated
    /// as gone). These end the connection without a response.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::PeerDisconnected | Self::IdleTimeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Self::Http(e) => e.into_response(),
            Self::BadRequest(message) => {
                let mut response = HttpError::new(Status::BadRequest, message).into_response();
                response.headers_mut().insert("Connection", "close");
                response
            }
            Self::UnsupportedBody(_) => {
                HttpError::new(Status::NotImplemented, self.to_string()).into_response()
            }
            _ => HttpError::from(Status::InternalServerError).into_response(),
        }
    }
}

/// An error that renders as an HTTP response.
///
/// ```rust
/// use hearth::{HttpError, Status};
///
/// let err = HttpError::new(Status::BadRequest, "Missing 'id' key");
/// assert_eq!(err.status(), Status::BadRequest);
///
/// // Without a message the reason phrase is the body.
/// assert_eq!(HttpError::from(Status::NotFound).message(), b"Not Found");
/// ```
#[derive(Clone, Debug)]
pub struct HttpError {
    status: Status,
    message: Bytes,
}

impl HttpError {
    pub fn new(status: Status, message: impl Into<Bytes>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub(crate) fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::new(Status::BadRequest, message)
    }
}

impl From<Status> for HttpError {
    fn from(status: Status) -> Self {
        Self::new(status, status.reason())
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, String::from_utf8_lossy(&self.message))
    }
}

impl std::error::Error for HttpError {}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        Response::new(self.status).with_body(self.message)
    }
}
