//! Radix-tree request router.
//!
//! One tree for all paths; each matched path holds its per-method HTTP
//! handlers and, optionally, a WebSocket handler. Registration conflicts
//! panic at startup, lookups never allocate beyond the extracted params.

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::error::HttpError;
use crate::handler::{BoxedHandler, BoxedWsHandler, Handler, WebSocketHandler};
use crate::method::Method;
use crate::status::Status;

/// What a request resolved to.
pub(crate) enum Endpoint {
    Http(BoxedHandler),
    WebSocket(BoxedWsHandler),
}

#[derive(Default)]
struct Route {
    handlers: HashMap<Method, BoxedHandler>,
    websocket: Option<BoxedWsHandler>,
}

/// The application router.
///
/// Build it once at startup and hand it to [`Server::serve`](crate::Server::serve).
/// Each registration returns `self` so calls chain naturally.
pub struct Router {
    tree: MatchitRouter<usize>,
    routes: Vec<Route>,
    paths: HashMap<String, usize>,
}

impl Router {
    pub fn new() -> Self {
        Self { tree: MatchitRouter::new(), routes: Vec::new(), paths: HashMap::new() }
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use hearth::{Method, Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::Get,  "/users/{id}", get_user)
    ///     .on(Method::Post, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// On an invalid or conflicting path pattern.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route_mut(path).handlers.insert(method, handler.into_boxed_handler());
        self
    }

    /// Register a WebSocket endpoint. Requests to `path` that do not ask
    /// for an upgrade get `426 Upgrade Required`, unless an HTTP handler is
    /// registered for their method too.
    ///
    /// ```rust
    /// # use hearth::{Request, Router, WebSocket};
    /// async fn echo(_req: Request, ws: WebSocket) -> Result<(), hearth::Error> {
    ///     while let Some(message) = ws.recv().await {
    ///         ws.send(message)?;
    ///     }
    ///     Ok(())
    /// }
    ///
    /// Router::new().websocket("/echo", echo);
    /// ```
    pub fn websocket(mut self, path: &str, handler: impl WebSocketHandler) -> Self {
        self.route_mut(path).websocket = Some(handler.into_boxed_ws_handler());
        self
    }

    fn route_mut(&mut self, path: &str) -> &mut Route {
        let index = match self.paths.get(path) {
            Some(&index) => index,
            None => {
                let index = self.routes.len();
                self.tree
                    .insert(path, index)
                    .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
                self.routes.push(Route::default());
                self.paths.insert(path.to_owned(), index);
                index
            }
        };
        &mut self.routes[index]
    }

    /// Resolves a request to an endpoint and its path parameters.
    ///
    /// Unknown paths are `404` with the path as the message; a known path
    /// without a handler for `method` is `405`; a WebSocket-only path
    /// requested without an upgrade is `426`. `HEAD` falls back to the `GET`
    /// handler.
    pub(crate) fn lookup(
        &self,
        method: Method,
        path: &str,
        upgrade: bool,
    ) -> Result<(Endpoint, HashMap<String, String>), HttpError> {
        let matched = self
            .tree
            .at(path)
            .map_err(|_| HttpError::new(Status::NotFound, path.to_owned()))?;
        let route = &self.routes[*matched.value];
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        if upgrade {
            if let Some(ws) = &route.websocket {
                return Ok((Endpoint::WebSocket(Arc::clone(ws)), params));
            }
        }
        // RFC 7231 §4.3.2: HEAD is served wherever GET is; the body is
        // dropped when the response is written.
        let handler = route.handlers.get(&method).or_else(|| match method {
            Method::Head => route.handlers.get(&Method::Get),
            _ => None,
        });
        match handler {
            Some(handler) => Ok((Endpoint::Http(Arc::clone(handler)), params)),
            None if route.websocket.is_some() => Err(HttpError::new(
                Status::UpgradeRequired,
                "This is a websocket endpoint, please upgrade.",
            )),
            None => Err(HttpError::from(Status::MethodNotAllowed)),
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
