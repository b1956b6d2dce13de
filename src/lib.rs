//! # hearth
//!
//! A small async HTTP/1.1 and WebSocket server engine on tokio.
//!
//! hearth turns a raw byte stream into request/response exchanges: an
//! incremental parser, a keep-alive loop, streaming request bodies
//! (multipart and URL-encoded), a response serializer with chunked
//! streaming, and a full-duplex WebSocket pump. Routing is a radix tree
//! via [`matchit`].
//!
//! Out of scope: HTTP/2, TLS (terminate it in front or wrap the stream
//! yourself, any [`Transport`] will do), proxying, authentication.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hearth::{Error, Method, Request, Response, Router, Server, Status, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let app = Router::new()
//!         .on(Method::Get,  "/users/{id}", get_user)
//!         .on(Method::Post, "/signup",     signup)
//!         .websocket("/echo", echo);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn signup(mut req: Request) -> Result<Response, Error> {
//!     req.parse_body().await?;
//!     let Some(form) = req.form() else {
//!         return Ok(Response::new(Status::BadRequest));
//!     };
//!     let name = form.require("name")?;
//!     Ok(Response::builder()
//!         .status(Status::Created)
//!         .header("Location", &format!("/users/{name}"))
//!         .no_body())
//! }
//!
//! async fn echo(_req: Request, ws: WebSocket) -> Result<(), Error> {
//!     while let Some(message) = ws.recv().await {
//!         ws.send(message)?;
//!     }
//!     Ok(())
//! }
//! ```

mod channel;
mod config;
mod connection;
mod cookie;
mod error;
mod handler;
mod headers;
mod io;
mod method;
mod parser;
mod request;
mod response;
mod router;
mod server;
mod status;
mod websocket;

pub mod form;

pub use channel::Channel;
pub use config::{Config, ConfigError, LimitsConfig, LoggingConfig, ServerConfig};
pub use cookie::{Cookie, CookieJar, SameSite};
pub use error::{Error, HttpError};
pub use handler::{Handler, TaskOutcome, WebSocketHandler};
pub use headers::Headers;
pub use io::{BoxedTransport, Transport};
pub use method::Method;
pub use parser::{Event, Head, ParseError, Parser};
pub use request::Request;
pub use response::{BodyStream, ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
pub use status::Status;
pub use websocket::{Closure, Message, WebSocket, handshake};

pub use tokio_tungstenite::tungstenite;
