//! One transport, many requests.
//!
//! A [`Channel`] owns a connection's transport and parser and turns the byte
//! stream into a sequence of [`Request`]s. The request body is not read up
//! front: each request carries a handle on the channel that pulls body chunks
//! on demand. Before the next request, [`Channel::drain`] discards whatever
//! the handler left unread, so the parser always resumes at a message
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Error;
use crate::io::{BoxedTransport, Transport};
use crate::method::Method;
use crate::parser::{Event, Parser};
use crate::request::Request;
use crate::response::Response;

/// Transport plus parser state, shared between the channel and the body
/// handle of the request in flight.
pub(crate) struct Wire {
    io: Option<BoxedTransport>,
    parser: Parser,
    read_buf: Box<[u8]>,
    /// Incremented for every request head; body handles remember theirs.
    seq: u64,
    /// The current message's body has been read to the end.
    complete: bool,
}

impl Wire {
    /// Reads once from the transport into the parser. `Ok(0)` is end of
    /// stream.
    async fn fill(&mut self) -> Result<usize, Error> {
        let Some(io) = self.io.as_mut() else {
            return Ok(0);
        };
        let n = io.read(&mut self.read_buf).await?;
        self.parser.feed(&self.read_buf[..n]);
        Ok(n)
    }

    /// Next body chunk of message `seq`. `None` once that message is
    /// complete or the channel has moved past it.
    async fn body_chunk(&mut self, seq: u64) -> Result<Option<Bytes>, Error> {
        if seq != self.seq || self.complete {
            return Ok(None);
        }
        loop {
            match self.parser.next_event()? {
                Some(Event::Body(chunk)) => return Ok(Some(chunk)),
                Some(Event::MessageComplete) => {
                    self.complete = true;
                    return Ok(None);
                }
                Some(_) => return Err(Error::BadRequest("head inside a body".into())),
                None => {
                    if self.fill().await? == 0 {
                        return Err(Error::PeerDisconnected);
                    }
                }
            }
        }
    }
}

/// A request's handle on the rest of its body.
#[derive(Clone)]
pub(crate) struct BodyReader {
    wire: Option<Arc<Mutex<Wire>>>,
    seq: u64,
}

impl BodyReader {
    /// A handle with nothing behind it; reads end-of-body immediately.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { wire: None, seq: 0 }
    }

    pub(crate) async fn chunk(&self) -> Result<Option<Bytes>, Error> {
        match &self.wire {
            Some(wire) => wire.lock().await.body_chunk(self.seq).await,
            None => Ok(None),
        }
    }
}

/// Produces requests from one transport, in arrival order.
pub struct Channel {
    wire: Arc<Mutex<Wire>>,
    idle_timeout: Duration,
    draining: CancellationToken,
}

impl Channel {
    pub fn new(io: impl Transport, config: &Config) -> Self {
        let wire = Wire {
            io: Some(Box::new(io)),
            parser: Parser::new(config.limits.max_field_size),
            read_buf: vec![0; config.limits.read_buffer_size.max(1)].into_boxed_slice(),
            seq: 0,
            complete: true,
        };
        Self {
            wire: Arc::new(Mutex::new(wire)),
            idle_timeout: config.idle_timeout(),
            draining: CancellationToken::new(),
        }
    }

    /// Once `draining` is cancelled, waiting for a new request ends the
    /// sequence instead. A request already under way is still produced.
    pub fn with_draining(mut self, draining: CancellationToken) -> Self {
        self.draining = draining;
        self
    }

    /// Reads until the next request head completes.
    ///
    /// `Ok(None)` when the peer closes the stream before a head completes,
    /// or when the channel is draining and no request has started.
    /// Waiting longer than the idle timeout for the first byte of a request
    /// is [`Error::IdleTimeout`]; once head bytes have arrived there is no
    /// time bound. Body bytes that arrived with the head are already on
    /// the returned request.
    pub async fn next_request(&mut self) -> Result<Option<Request>, Error> {
        let mut wire = self.wire.lock().await;
        wire.seq += 1;
        wire.complete = false;
        let seq = wire.seq;

        let mut request: Option<Request> = None;
        loop {
            match wire.parser.next_event()? {
                Some(Event::Url(url)) => {
                    let reader = BodyReader { wire: Some(Arc::clone(&self.wire)), seq };
                    request = Some(Request::new(url, reader));
                }
                Some(Event::Header { name, value }) => {
                    if let Some(request) = request.as_mut() {
                        request.headers.join(&name, &value);
                    }
                }
                Some(Event::HeadersComplete(head)) => {
                    let Some(mut request) = request.take() else {
                        return Err(Error::BadRequest("head without a request line".into()));
                    };
                    request.method = head.method;
                    request.keep_alive = head.keep_alive;
                    request.upgrade = head.upgrade;

                    loop {
                        match wire.parser.next_event()? {
                            Some(Event::Body(chunk)) => request.body.extend_from_slice(&chunk),
                            Some(Event::MessageComplete) => {
                                wire.complete = true;
                                break;
                            }
                            _ => break,
                        }
                    }
                    return Ok(Some(request));
                }
                Some(Event::Body(_) | Event::MessageComplete) => {
                    return Err(Error::BadRequest("body before head".into()));
                }
                None => {
                    let n = if wire.parser.is_idle() {
                        tokio::select! {
                            biased;
                            () = self.draining.cancelled() => return Ok(None),
                            read = tokio::time::timeout(self.idle_timeout, wire.fill()) => match read {
                                Ok(read) => read?,
                                Err(_) => return Err(Error::IdleTimeout),
                            },
                        }
                    } else {
                        wire.fill().await?
                    };
                    if n == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Discards the unread rest of the current request body.
    pub async fn drain(&mut self) -> Result<(), Error> {
        let mut wire = self.wire.lock().await;
        let seq = wire.seq;
        while wire.body_chunk(seq).await?.is_some() {}
        Ok(())
    }

    /// Writes a response. Passing the request method suppresses the body
    /// for `HEAD` and `CONNECT`.
    pub async fn send(&mut self, mut response: Response, method: Option<Method>) -> Result<(), Error> {
        if let Some(method) = method {
            response.for_method(method);
        }
        let mut wire = self.wire.lock().await;
        let io = wire.io.as_mut().ok_or(Error::PeerDisconnected)?;
        response.write_to(io).await?;
        Ok(())
    }

    /// Shutdown has begun; the channel will not wait for another request.
    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Nothing buffered and no message in progress.
    pub async fn is_idle(&self) -> bool {
        self.wire.lock().await.parser.is_idle()
    }

    /// Releases the transport together with the bytes read past the last
    /// head. The channel produces no further requests.
    pub async fn upgrade(&mut self) -> Result<(BoxedTransport, Bytes), Error> {
        let mut wire = self.wire.lock().await;
        let io = wire.io.take().ok_or(Error::PeerDisconnected)?;
        Ok((io, wire.parser.take_remaining()))
    }
}
