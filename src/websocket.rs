//! WebSocket endpoints (RFC 6455).
//!
//! After a successful handshake the connection's transport is handed to a
//! pump of three tasks:
//!
//! - the **inbound** half reads frames and queues messages for the handler,
//!   answers pings and records a close sent by the peer;
//! - the **outbound** half is the only writer: it drains a queue of messages,
//!   pongs and close requests;
//! - the **handler** task runs application code against a [`WebSocket`]
//!   handle.
//!
//! A supervisor waits for whichever finishes first and winds the others
//! down. There is a single "closing" signal and a single recorded
//! [`Closure`], so exactly one side decides how the connection ended.

use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::{Error, HttpError};
use crate::handler::BoxedWsHandler;
use crate::io::BoxedTransport;
use crate::request::Request;
use crate::response::Response;
use crate::status::Status;

type Socket = WebSocketStream<BoxedTransport>;

/// How long a hard shutdown waits for the `1001` close frame to go out.
const GOING_AWAY_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a handler may keep running after the socket has closed.
const HANDLER_GRACE: Duration = Duration::from_secs(1);

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Validates an upgrade request and builds the `101 Switching Protocols`
/// answer. Anything short of a well-formed version 13 handshake is a `400`.
pub fn handshake(request: &Request) -> Result<Response, HttpError> {
    let headers = request.headers();
    if !headers.has_token("Upgrade", "websocket") {
        return Err(HttpError::bad_request("Missing 'Upgrade: websocket' header"));
    }
    if !headers.has_token("Connection", "upgrade") {
        return Err(HttpError::bad_request("Missing 'Connection: upgrade' header"));
    }
    if headers.get("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return Err(HttpError::bad_request("Unsupported websocket version"));
    }
    let key = headers
        .get("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|key| key.len() == 24)
        .ok_or_else(|| HttpError::bad_request("Invalid 'Sec-WebSocket-Key' header"))?;

    let mut response = Response::new(Status::SwitchingProtocols);
    let fields = response.headers_mut();
    fields.insert("Upgrade", "websocket");
    fields.insert("Connection", "Upgrade");
    fields.insert("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()));
    Ok(response)
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// An application message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self { Self::Text(text) }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self { Self::Text(text.to_owned()) }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self { Self::Binary(data) }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self { Self::Binary(data.into()) }
}

/// How a WebSocket connection ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Closure {
    pub code: u16,
    pub reason: String,
}

impl Closure {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::new(frame.code.into(), frame.reason.as_str()),
            // RFC 6455 §7.1.5: no status code was present.
            None => Self::new(1005, ""),
        }
    }

    fn into_frame(self) -> Option<CloseFrame> {
        (self.code != 1005).then(|| CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.into(),
        })
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

enum Outbound {
    Message(Message),
    Pong(Bytes),
    Close(Closure),
    /// The inbound half is gone; flush and stop.
    Shutdown,
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct Shared {
    incoming: Mutex<mpsc::UnboundedReceiver<Message>>,
    outgoing: mpsc::UnboundedSender<Outbound>,
    closing: CancellationToken,
    closure: std::sync::Mutex<Option<Closure>>,
}

impl Shared {
    /// Keeps the first closure recorded.
    fn record(&self, closure: Closure) {
        let mut slot = self.closure.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(closure);
    }

    fn closure(&self) -> Option<Closure> {
        self.closure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The application's side of an upgraded connection. Cheap to clone; all
/// clones talk to the same connection.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl WebSocket {
    /// Queues a message for sending. Fails with [`Error::WebsocketClosed`]
    /// once the connection is closing.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), Error> {
        if self.shared.closing.is_cancelled() {
            return Err(Error::WebsocketClosed);
        }
        self.shared
            .outgoing
            .send(Outbound::Message(message.into()))
            .map_err(|_| Error::WebsocketClosed)
    }

    /// The next message from the peer. Messages already received are
    /// delivered even after the connection started closing; after that,
    /// `None`.
    pub async fn recv(&self) -> Option<Message> {
        let mut incoming = self.shared.incoming.lock().await;
        tokio::select! {
            biased;
            message = incoming.recv() => message,
            () = self.shared.closing.cancelled() => None,
        }
    }

    /// Closes with `1000` and waits until the close frame is out.
    pub async fn close(&self) {
        self.close_with(1000, "").await;
    }

    /// Closes with the given code and reason. A no-op once closing.
    pub async fn close_with(&self, code: u16, reason: &str) {
        if self.shared.closing.is_cancelled() {
            return;
        }
        if self.shared.outgoing.send(Outbound::Close(Closure::new(code, reason))).is_ok() {
            self.shared.closing.cancelled().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    /// How the connection ended, once it did.
    pub fn closure(&self) -> Option<Closure> {
        self.shared.closure()
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("closed", &self.is_closed())
            .field("closure", &self.closure())
            .finish()
    }
}

// ── Pump ──────────────────────────────────────────────────────────────────────

/// Runs a WebSocket connection to the end and returns how it closed.
///
/// `rest` holds bytes read past the upgrade request; they are the start of
/// the frame stream. Cancelling `abort` closes with `1001`.
pub(crate) async fn serve(
    io: BoxedTransport,
    rest: Bytes,
    request: Request,
    handler: BoxedWsHandler,
    abort: CancellationToken,
) -> Option<Closure> {
    let socket = WebSocketStream::from_partially_read(io, rest.to_vec(), Role::Server, None).await;
    let (sink, stream) = socket.split();

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        incoming: Mutex::new(incoming_rx),
        outgoing: outgoing_tx.clone(),
        closing: abort.child_token(),
        closure: std::sync::Mutex::new(None),
    });
    let ws = WebSocket { shared: Arc::clone(&shared) };

    let mut inbound = tokio::spawn(inbound(stream, incoming_tx, Arc::clone(&shared)));
    let mut outbound = tokio::spawn(outbound(sink, outgoing_rx, Arc::clone(&shared)));
    let mut task = tokio::spawn(handler.call(request, ws));

    tokio::select! {
        biased;
        () = abort.cancelled() => {
            let _ = outgoing_tx.send(Outbound::Close(Closure::new(1001, "Going away.")));
            let _ = tokio::time::timeout(GOING_AWAY_TIMEOUT, &mut outbound).await;
            task.abort();
            inbound.abort();
            outbound.abort();
        }
        outcome = &mut task => {
            let closure = if report(outcome) {
                Closure::new(1000, "Closed.")
            } else {
                Closure::new(1011, "Task died prematurely.")
            };
            let _ = outgoing_tx.send(Outbound::Close(closure));
            finish_outbound(&mut outbound, &abort).await;
            inbound.abort();
        }
        _ = &mut inbound => {
            let _ = outgoing_tx.send(Outbound::Shutdown);
            finish_outbound(&mut outbound, &abort).await;
            // The handler sees `closing` and winds down on its own, including
            // one that closed the socket itself and has code left to run.
            tokio::select! {
                biased;
                () = abort.cancelled() => {}
                () = tokio::time::sleep(HANDLER_GRACE) => {}
                outcome = &mut task => {
                    report(outcome);
                }
            }
            task.abort();
        }
    }

    shared.closure()
}

/// Whether the handler returned normally. Failures and panics are logged.
fn report(outcome: Result<Result<(), String>, JoinError>) -> bool {
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(%error, "websocket handler failed");
            false
        }
        Err(error) => {
            warn!(%error, "websocket handler panicked");
            false
        }
    }
}

/// Waits for the outbound half to flush and stop. A writer stuck on a peer
/// that no longer reads is dropped once `abort` is cancelled.
async fn finish_outbound(outbound: &mut JoinHandle<()>, abort: &CancellationToken) {
    tokio::select! {
        biased;
        _ = &mut *outbound => {}
        () = abort.cancelled() => outbound.abort(),
    }
}

async fn inbound(
    mut stream: SplitStream<Socket>,
    incoming: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = shared.closing.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Frame::Text(text))) => {
                let _ = incoming.send(Message::Text(text.as_str().to_owned()));
            }
            Some(Ok(Frame::Binary(data))) => {
                let _ = incoming.send(Message::Binary(data));
            }
            Some(Ok(Frame::Ping(payload))) => {
                let _ = shared.outgoing.send(Outbound::Pong(payload));
            }
            Some(Ok(Frame::Pong(_) | Frame::Frame(_))) => {}
            Some(Ok(Frame::Close(frame))) => {
                let closure = Closure::from_frame(frame);
                trace!(%closure, "websocket closed by peer");
                shared.record(closure.clone());
                // The codec has already queued the mirrored close frame; the
                // outbound half flushes it.
                let _ = shared.outgoing.send(Outbound::Close(closure));
                shared.closing.cancel();
                break;
            }
            Some(Err(error)) => {
                trace!(%error, "websocket read failed");
                shared.closing.cancel();
                break;
            }
            None => {
                shared.closing.cancel();
                break;
            }
        }
    }
}

async fn outbound(
    mut sink: SplitSink<Socket, Frame>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    while let Some(entry) = queue.recv().await {
        let sent = match entry {
            Outbound::Message(Message::Text(text)) => sink.send(Frame::text(text)).await,
            Outbound::Message(Message::Binary(data)) => sink.send(Frame::binary(data)).await,
            Outbound::Pong(payload) => sink.send(Frame::Pong(payload)).await,
            Outbound::Close(closure) => {
                shared.record(closure.clone());
                // Refused when the peer closed first; closing the sink then
                // flushes the reply the codec queued.
                let _ = sink.send(Frame::Close(closure.into_frame())).await;
                let _ = sink.close().await;
                shared.closing.cancel();
                return;
            }
            Outbound::Shutdown => {
                shared.closing.cancel();
                let _ = sink.close().await;
                return;
            }
        };
        if let Err(error) = sent {
            trace!(%error, "websocket write failed");
            shared.closing.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BodyReader;
    use crate::handler::WebSocketHandler;
    use tokio::io::duplex;

    type Client = WebSocketStream<tokio::io::DuplexStream>;

    fn request() -> Request {
        Request::new(Bytes::from_static(b"/ws"), BodyReader::detached())
    }

    fn upgrade_request(key: &str, version: &str) -> Request {
        let mut req = request();
        req.headers.join("Connection", "keep-alive, Upgrade");
        req.headers.join("Upgrade", "websocket");
        req.headers.join("Sec-WebSocket-Version", version);
        req.headers.join("Sec-WebSocket-Key", key);
        req
    }

    /// Starts the pump on one end of an in-memory pipe and a client on the
    /// other.
    async fn start(
        handler: impl WebSocketHandler,
        rest: &'static [u8],
        abort: CancellationToken,
    ) -> (JoinHandle<Option<Closure>>, Client) {
        start_with_pipe(4096, handler, rest, abort).await
    }

    async fn start_with_pipe(
        capacity: usize,
        handler: impl WebSocketHandler,
        rest: &'static [u8],
        abort: CancellationToken,
    ) -> (JoinHandle<Option<Closure>>, Client) {
        let (client_io, server_io) = duplex(capacity);
        let server = tokio::spawn(serve(
            Box::new(server_io),
            Bytes::from_static(rest),
            request(),
            handler.into_boxed_ws_handler(),
            abort,
        ));
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn close_frame(client: &mut Client) -> Option<(u16, String)> {
        while let Some(frame) = client.next().await {
            if let Ok(Frame::Close(Some(frame))) = frame {
                return Some((frame.code.into(), frame.reason.as_str().to_owned()));
            }
        }
        None
    }

    async fn echo(_: Request, ws: WebSocket) -> Result<(), Error> {
        while let Some(message) = ws.recv().await {
            ws.send(message)?;
        }
        Ok(())
    }

    #[test]
    fn handshake_accepts_rfc_sample_key() {
        let response = handshake(&upgrade_request("dGhlIHNhbXBsZSBub25jZQ==", "13")).unwrap();
        assert_eq!(response.status(), Status::SwitchingProtocols);
        assert_eq!(
            response.headers().get("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(response.headers().get("Upgrade"), Some("websocket"));
        assert!(!String::from_utf8_lossy(&response.encode()).contains("Content-Length"));
    }

    #[test]
    fn handshake_rejects_bad_requests() {
        assert!(handshake(&upgrade_request("dGhlIHNhbXBsZSBub25jZQ==", "8")).is_err());
        assert!(handshake(&upgrade_request("short", "13")).is_err());
        assert_eq!(handshake(&request()).unwrap_err().status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn echoes_messages_and_answers_pings() {
        let (server, mut client) = start(echo, b"", CancellationToken::new()).await;

        client.send(Frame::text("hello")).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::text("hello"));

        client.send(Frame::binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::binary(vec![1, 2, 3]));

        client.send(Frame::Ping(Bytes::from_static(b"are you there"))).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::Pong(Bytes::from_static(b"are you there"))
        );

        client.close(None).await.unwrap();
        assert_eq!(server.await.unwrap(), Some(Closure::new(1005, "")));
    }

    #[tokio::test]
    async fn handler_return_closes_normally() {
        async fn done(_: Request, _: WebSocket) {}

        let (server, mut client) = start(done, b"", CancellationToken::new()).await;
        assert_eq!(close_frame(&mut client).await, Some((1000, "Closed.".to_owned())));
        assert_eq!(server.await.unwrap(), Some(Closure::new(1000, "Closed.")));
    }

    #[tokio::test]
    async fn handler_error_closes_with_1011() {
        async fn fails(_: Request, _: WebSocket) -> Result<(), Error> {
            Err(Error::BadRequest("nope".into()))
        }

        let (server, mut client) = start(fails, b"", CancellationToken::new()).await;
        assert_eq!(close_frame(&mut client).await, Some((1011, "Task died prematurely.".to_owned())));
        assert_eq!(server.await.unwrap().map(|c| c.code), Some(1011));
    }

    #[tokio::test]
    async fn handler_panic_closes_with_1011() {
        async fn panics(_: Request, _: WebSocket) {
            panic!("boom");
        }

        let (server, mut client) = start(panics, b"", CancellationToken::new()).await;
        assert_eq!(close_frame(&mut client).await, Some((1011, "Task died prematurely.".to_owned())));
        assert_eq!(server.await.unwrap().map(|c| c.code), Some(1011));
    }

    #[tokio::test]
    async fn peer_close_is_recorded_and_mirrored() {
        let (server, mut client) = start(echo, b"", CancellationToken::new()).await;

        let frame = CloseFrame { code: CloseCode::from(4000), reason: "bye".into() };
        client.send(Frame::Close(Some(frame))).await.unwrap();
        assert_eq!(close_frame(&mut client).await, Some((4000, "bye".to_owned())));
        assert_eq!(server.await.unwrap(), Some(Closure::new(4000, "bye")));
    }

    #[tokio::test]
    async fn bytes_read_with_the_head_are_not_lost() {
        async fn first_only(_: Request, ws: WebSocket) {
            if let Some(message) = ws.recv().await {
                let _ = ws.send(message);
            }
        }

        // A masked text frame "hi" with an all-zero mask.
        const FRAME: &[u8] = &[0x81, 0x82, 0, 0, 0, 0, b'h', b'i'];
        let (server, mut client) = start(first_only, FRAME, CancellationToken::new()).await;
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::text("hi"));
        assert_eq!(close_frame(&mut client).await, Some((1000, "Closed.".to_owned())));
        assert!(server.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn handler_keeps_running_after_its_own_close() {
        #[derive(Debug, PartialEq)]
        struct AfterClose {
            closed: bool,
            closure: Option<Closure>,
            recv_ended: bool,
            send_refused: bool,
        }

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let closes = move |_: Request, ws: WebSocket| {
            let seen = seen_tx.clone();
            async move {
                ws.close_with(4001, "done").await;
                tokio::task::yield_now().await;
                let _ = seen.send(AfterClose {
                    closed: ws.is_closed(),
                    closure: ws.closure(),
                    recv_ended: ws.recv().await.is_none(),
                    send_refused: matches!(ws.send("too late"), Err(Error::WebsocketClosed)),
                });
                ws.send("too late")
            }
        };

        let (server, mut client) = start(closes, b"", CancellationToken::new()).await;
        assert_eq!(close_frame(&mut client).await, Some((4001, "done".to_owned())));
        // The handler's own close wins over the 1011 its error would cause.
        assert_eq!(server.await.unwrap(), Some(Closure::new(4001, "done")));
        assert_eq!(
            seen_rx.recv().await,
            Some(AfterClose {
                closed: true,
                closure: Some(Closure::new(4001, "done")),
                recv_ended: true,
                send_refused: true,
            })
        );
    }

    #[tokio::test]
    async fn abort_releases_a_writer_stuck_on_a_silent_peer() {
        async fn flood(_: Request, ws: WebSocket) -> Result<(), Error> {
            for _ in 0..64 {
                ws.send(vec![0u8; 4096])?;
            }
            Ok(())
        }

        let abort = CancellationToken::new();
        // The client never reads, so the 1 KiB pipe fills up almost at once.
        let (server, _client) = start_with_pipe(1024, flood, b"", abort.clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!server.is_finished());

        abort.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(3), server).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn abort_goes_away() {
        let abort = CancellationToken::new();
        let (server, mut client) = start(echo, b"", abort.clone()).await;
        abort.cancel();
        assert_eq!(close_frame(&mut client).await, Some((1001, "Going away.".to_owned())));
        assert_eq!(server.await.unwrap(), Some(Closure::new(1001, "Going away.")));
    }
}
