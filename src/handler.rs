//! Handler traits and type erasure.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types side by side, so each one
//! is hidden behind a trait object with a common call signature:
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }     ← user writes this
//!        ↓ router.on(Method::Get, "/", hello)
//! hello.into_boxed_handler()                         ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                         ← stored as BoxedHandler
//!        ↓
//! handler.call(req)  at request time                 ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(req).await.into_response() })
//! ```
//!
//! WebSocket handlers take the [`WebSocket`] handle as a second argument and
//! return anything implementing [`TaskOutcome`]; they go through the same
//! erasure as [`BoxedWsHandler`].

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::websocket::WebSocket;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// A type-erased WebSocket handler future. `Err` carries the failure message.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

#[doc(hidden)]
pub trait ErasedWsHandler {
    fn call(&self, req: Request, ws: WebSocket) -> TaskFuture;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

#[doc(hidden)]
pub type BoxedWsHandler = Arc<dyn ErasedWsHandler + Send + Sync + 'static>;

// ── Public traits ─────────────────────────────────────────────────────────────

/// Implemented for every valid HTTP route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

/// Implemented for every valid WebSocket route handler:
///
/// ```text
/// async fn name(req: Request, ws: WebSocket) -> impl TaskOutcome
/// ```
///
/// When the handler returns, the connection is closed with `1000`; when it
/// fails or panics, with `1011`.
pub trait WebSocketHandler: private::SealedWs + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_ws_handler(self) -> BoxedWsHandler;
}

/// What a WebSocket handler may return: `()`, or a `Result` whose error is
/// reported as a failed task.
pub trait TaskOutcome: Send + 'static {
    fn into_outcome(self) -> Result<(), String>;
}

impl TaskOutcome for () {
    fn into_outcome(self) -> Result<(), String> { Ok(()) }
}

impl<E: Display + Send + 'static> TaskOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// Private sealing traits: external crates cannot name them and therefore
/// cannot implement the handler traits on their own types.
mod private {
    pub trait Sealed {}
    pub trait SealedWs {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

impl<F, Fut, O> private::SealedWs for F
where
    F: Fn(Request, WebSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: TaskOutcome,
{
}

impl<F, Fut, O> WebSocketHandler for F
where
    F: Fn(Request, WebSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: TaskOutcome,
{
    fn into_boxed_ws_handler(self) -> BoxedWsHandler {
        Arc::new(FnWsHandler(self))
    }
}

// ── Concrete wrappers ─────────────────────────────────────────────────────────

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

struct FnWsHandler<F>(F);

impl<F, Fut, O> ErasedWsHandler for FnWsHandler<F>
where
    F: Fn(Request, WebSocket) -> Fut + Send + Sync,
    Fut: Future<Output = O> + Send + 'static,
    O: TaskOutcome,
{
    fn call(&self, req: Request, ws: WebSocket) -> TaskFuture {
        let fut = (self.0)(req, ws);
        Box::pin(async move { fut.await.into_outcome() })
    }
}
