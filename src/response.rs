//! Outgoing HTTP response type and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] is either buffered (a status, headers and a body held in
//! memory, framed with `Content-Length`) or streamed (the body is pulled from
//! a [`BodyStream`] as it is written and framed with chunked encoding).

use std::io;
use std::path::Path;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::cookie::{Cookie, CookieJar};
use crate::error::Error;
use crate::headers::Headers;
use crate::method::Method;
use crate::status::Status;

/// A body produced piece by piece while the response is being written.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// # Shortcuts
///
/// ```rust
/// use hearth::{Response, Status};
///
/// Response::json(r#"{"id":1}"#);
/// Response::text("hello");
/// Response::new(Status::NoContent);
/// ```
///
/// # Builder
///
/// ```rust
/// use hearth::{ContentType, Response, Status};
///
/// Response::builder()
///     .status(Status::Created)
///     .header("Location", "/users/42")
///     .json(r#"{"id":42}"#);
///
/// Response::builder().bytes(ContentType::Xml, "<ok/>");
/// ```
///
/// # Streaming
///
/// ```rust
/// use hearth::Response;
///
/// let response = Response::streamer(["chunk one, ", "chunk two"], "text/plain");
/// assert!(response.is_streaming());
/// ```
pub struct Response {
    status: Status,
    headers: Headers,
    body: Bytes,
    stream: Option<BodyStream>,
    cookies: Option<CookieJar>,
    bodyless: bool,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            stream: None,
            cookies: None,
            bodyless: status.is_bodyless(),
        }
    }

    /// Like [`Response::new`] from a numeric code. Unknown codes are errors.
    pub fn with_code(code: u16) -> Result<Self, Error> {
        Ok(Self::new(Status::try_from(code)?))
    }

    /// `200 OK` with `application/json`. Pass the bytes your serializer
    /// produced.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK` with `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// `200 OK` with `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        Self::builder().bytes(ContentType::Html, body.into())
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { status: Status::Ok, headers: Headers::new(), cookies: None }
    }

    /// A chunked `200 OK` whose body is pulled from `chunks` while it is
    /// written. Empty chunks are skipped.
    pub fn streamer<I, B>(chunks: I, content_type: &str) -> Self
    where
        I: IntoIterator<Item = B> + 'static,
        I::IntoIter: Send + 'static,
        B: Into<Bytes> + 'static,
    {
        let chunks = chunks.into_iter().map(|chunk: B| -> io::Result<Bytes> { Ok(chunk.into()) });
        Self::stream(futures_util::stream::iter(chunks), content_type)
    }

    /// A chunked `200 OK` whose body is an async stream. An `Err` item ends
    /// the response without the terminating chunk, so the client sees a
    /// truncated body rather than a complete one.
    pub fn stream<S>(stream: S, content_type: &str) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut response = Self::new(Status::Ok);
        response.headers.insert("Content-Type", content_type);
        response.headers.insert("Transfer-Encoding", "chunked");
        response.stream = Some(Box::pin(stream));
        response
    }

    /// Streams a file from disk, 4 KiB per chunk.
    pub async fn file(path: impl AsRef<Path>, content_type: &str) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::stream(ReaderStream::new(file), content_type))
    }

    /// Replaces the buffered body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.bodyless = status.is_bodyless();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The buffered body. Empty for streamed responses.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Cookies to send, created on first use.
    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        self.cookies.get_or_insert_with(CookieJar::default)
    }

    pub fn cookies(&self) -> Option<&CookieJar> {
        self.cookies.as_ref()
    }

    /// Suppresses body octets when answering a method whose responses carry
    /// none, such as `HEAD`.
    pub(crate) fn for_method(&mut self, method: Method) {
        self.bodyless |= method.is_bodyless();
    }

    /// The response itself asks for the connection to end.
    pub(crate) fn closes_connection(&self) -> bool {
        self.headers.has_token("Connection", "close")
    }

    /// Serializes the status line, headers and (for buffered responses) the
    /// body. A streamed body is not included; see [`Response::write_to`].
    ///
    /// ```rust
    /// use hearth::{Response, Status};
    ///
    /// let bytes = Response::new(Status::Accepted).encode();
    /// assert_eq!(&bytes[..], b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n");
    /// ```
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
        for cookie in self.cookies.iter().flat_map(CookieJar::iter) {
            put_field(&mut out, "Set-Cookie", cookie);
        }
        for (name, value) in self.headers.iter() {
            put_field(&mut out, name, value);
        }
        if self.bodyless || self.stream.is_some() {
            out.extend_from_slice(b"\r\n");
            return out;
        }
        if !self.headers.contains("Content-Length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Writes the whole response, pulling and chunk-framing a streamed body.
    pub async fn write_to<W: AsyncWrite + Unpin>(self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;

        if let Some(mut stream) = self.stream.filter(|_| !self.bodyless) {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                // A zero-length chunk would read as the terminator.
                if chunk.is_empty() {
                    continue;
                }
                let mut frame = BytesMut::with_capacity(chunk.len() + 16);
                frame.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                frame.extend_from_slice(&chunk);
                frame.extend_from_slice(b"\r\n");
                writer.write_all(&frame).await?;
            }
            writer.write_all(b"0\r\n\r\n").await?;
        }
        writer.flush().await
    }
}

/// Writes one header line. CR and LF are dropped so a value can never end
/// its line early and start a forged one.
fn put_field(out: &mut BytesMut, name: &str, value: impl std::fmt::Display) {
    let line = format!("{name}: {value}");
    out.extend(line.bytes().filter(|b| !matches!(b, b'\r' | b'\n')));
    out.extend_from_slice(b"\r\n");
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `Status::Ok` (200).
/// Terminated by a typed body method.
pub struct ResponseBuilder {
    status: Status,
    headers: Headers,
    cookies: Option<CookieJar>,
}

impl ResponseBuilder {
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.get_or_insert_with(CookieJar::default).set(cookie);
        self
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish(ContentType::Json.as_str(), body.into())
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish(ContentType::Text.as_str(), body.into().into())
    }

    /// Terminate with a typed body. Use this for XML, HTML, binary, SSE, etc.
    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(content_type.as_str(), body.into())
    }

    /// Terminate with no body (e.g. `Status::NoContent`, `Status::Found`).
    pub fn no_body(self) -> Response {
        let mut response = Response::new(self.status);
        response.headers = self.headers;
        response.cookies = self.cookies;
        response
    }

    fn finish(self, content_type: &str, body: Bytes) -> Response {
        let mut headers = Headers::new();
        headers.insert("Content-Type", content_type);
        for (name, value) in self.headers.iter() {
            headers.append(name, value);
        }
        let mut response = Response::new(self.status).with_body(body);
        response.headers = headers;
        response.cookies = self.cookies;
        response
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into an HTTP [`Response`].
///
/// Implement on your own types to return them directly from handlers.
///
/// ```rust,ignore
/// use hearth::{IntoResponse, Response, Status};
/// use serde::Serialize;
///
/// struct Json<T: Serialize>(T);
///
/// impl<T: Serialize> IntoResponse for Json<T> {
///     fn into_response(self) -> Response {
///         match serde_json::to_vec(&self.0) {
///             Ok(bytes) => Response::json(bytes),
///             Err(_)    => Response::new(Status::InternalServerError),
///         }
///     }
/// }
/// ```
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

/// Return a [`Status`] directly from a handler: `return Status::NotFound`
impl IntoResponse for Status {
    fn into_response(self) -> Response { Response::new(self) }
}

/// `?` works in handlers: both arms render, typically `Result<Response, HttpError>`.
impl<T: IntoResponse, E: IntoResponse> IntoResponse for Result<T, E> {
    fn into_response(self) -> Response {
        match self {
            Ok(ok) => ok.into_response(),
            Err(err) => err.into_response(),
        }
    }
}
