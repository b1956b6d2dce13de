//! The byte stream a connection runs over.
//!
//! The engine only ever asks a transport to "read up to N bytes" and to
//! "write all of these bytes". Plain TCP, a TLS stream terminated by the host
//! application, or an in-memory duplex pipe in tests all qualify.

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream the engine can own for the lifetime of a connection.
///
/// Blanket-implemented; you never implement this yourself.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased transport, so requests and WebSocket pumps need not be
/// generic over the socket type.
pub type BoxedTransport = Box<dyn Transport>;
