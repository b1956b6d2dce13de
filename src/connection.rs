//! The per-connection request loop.
//!
//! One task per accepted transport. Each turn reads a request, routes it,
//! runs the handler, writes the response and discards the unread body; an
//! accepted WebSocket upgrade hands the transport over to the pump and ends
//! the loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::config::Config;
use crate::error::Error;
use crate::handler::BoxedWsHandler;
use crate::io::Transport;
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::{Endpoint, Router};
use crate::status::Status;
use crate::websocket;

enum Step {
    Continue,
    Close,
    Upgrade(Request, BoxedWsHandler),
}

/// Serves requests from `io` until the peer leaves, a response closes the
/// connection, `draining` finds it idle, or `abort` is cancelled.
pub(crate) async fn serve(
    io: impl Transport,
    router: Arc<Router>,
    config: Arc<Config>,
    draining: CancellationToken,
    abort: CancellationToken,
) {
    let mut channel = Channel::new(io, &config).with_draining(draining);

    loop {
        let step = tokio::select! {
            biased;
            () = abort.cancelled() => {
                trace!("connection aborted");
                return;
            }
            step = exchange(&mut channel, &router) => step,
        };

        match step {
            Ok(Step::Continue) => {}
            Ok(Step::Close) => return,
            Ok(Step::Upgrade(request, handler)) => {
                match channel.upgrade().await {
                    Ok((io, rest)) => {
                        let closure = websocket::serve(io, rest, request, handler, abort).await;
                        debug!(?closure, "websocket finished");
                    }
                    Err(error) => trace!(%error, "upgrade failed"),
                }
                return;
            }
            Err(error) if error.is_transport() => {
                trace!(%error, "connection ended");
                return;
            }
            Err(error) => {
                debug!(%error, "connection failed");
                return;
            }
        }
    }
}

/// One request/response round trip.
async fn exchange(channel: &mut Channel, router: &Router) -> Result<Step, Error> {
    let mut request = match channel.next_request().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(Step::Close),
        Err(Error::BadRequest(reason)) => {
            debug!(%reason, "unparsable request");
            let mut response = Response::text("Unparsable request.");
            response.set_status(Status::BadRequest);
            response.headers_mut().insert("Connection", "close");
            channel.send(response, None).await?;
            return Ok(Step::Close);
        }
        Err(error) => return Err(error),
    };

    let method = request.method();
    let path = request.path().to_owned();
    let keep_alive = request.keep_alive();
    let upgrade = request.is_upgrade();

    let mut response = match router.lookup(method, &path, upgrade) {
        Ok((Endpoint::WebSocket(handler), params)) => {
            request.params = params;
            match websocket::handshake(&request) {
                Ok(response) => {
                    channel.send(response, None).await?;
                    debug!(%method, %path, status = 101, "upgraded");
                    return Ok(Step::Upgrade(request, handler));
                }
                Err(error) => error.into_response(),
            }
        }
        Ok((Endpoint::Http(handler), params)) => {
            request.params = params;
            handler.call(request).await
        }
        Err(error) => error.into_response(),
    };

    // An upgrade request that was not switched leaves the parser past the
    // end of HTTP; nothing more can be read from this connection. A draining
    // channel will not wait for another request either.
    let close =
        !keep_alive || upgrade || channel.is_draining() || response.closes_connection();
    if close && !response.closes_connection() {
        response.headers_mut().insert("Connection", "close");
    }

    let status = response.status().code();
    channel.send(response, Some(method)).await?;
    debug!(%method, %path, status, "request served");

    if close {
        return Ok(Step::Close);
    }
    channel.drain().await?;
    Ok(Step::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    async fn hello(_: Request) -> Response {
        Response::text("hello")
    }

    async fn echo(mut req: Request) -> Result<Response, Error> {
        let body = req.raw_body().await?.to_vec();
        Ok(Response::text(String::from_utf8_lossy(&body).into_owned()))
    }

    fn router() -> Arc<Router> {
        Arc::new(Router::new().on(Method::Get, "/", hello).on(Method::Post, "/echo", echo))
    }

    /// Runs a connection over an in-memory pipe, writes `input`, closes the
    /// client's write side and returns everything the server wrote back.
    async fn roundtrip(input: &[u8]) -> String {
        roundtrip_with(router(), CancellationToken::new(), input).await
    }

    async fn roundtrip_with(
        router: Arc<Router>,
        draining: CancellationToken,
        input: &[u8],
    ) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve(
            server,
            router,
            Arc::new(Config::default()),
            draining,
            CancellationToken::new(),
        ));
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn keep_alive_serves_requests_in_order() {
        let output = roundtrip(
            b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\npingGET / HTTP/1.1\r\n\r\n",
        )
        .await;
        let first = output.find("ping").unwrap();
        let second = output.find("hello").unwrap();
        assert!(first < second);
        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn unread_body_is_discarded_before_the_next_request() {
        let output = roundtrip(
            b"POST /nope HTTP/1.1\r\nContent-Length: 5\r\n\r\nGET /GET / HTTP/1.1\r\n\r\n",
        )
        .await;
        assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(output.ends_with("hello"));
    }

    #[tokio::test]
    async fn garbage_gets_400_and_the_connection_closes() {
        let output = roundtrip(b"Batushka\r\n\r\nGET / HTTP/1.1\r\n\r\n").await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(output.ends_with("Unparsable request."));
        assert!(!output.contains("hello"));
    }

    #[tokio::test]
    async fn connection_close_is_honored() {
        let output = roundtrip(
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\nGET / HTTP/1.1\r\n\r\n",
        )
        .await;
        assert_eq!(output.matches("hello").count(), 1);
        assert!(output.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn http_10_closes_by_default() {
        let output = roundtrip(b"GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(output.matches("hello").count(), 1);
    }

    #[tokio::test]
    async fn malformed_body_ends_the_connection() {
        let output = roundtrip(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nGET / HTTP/1.1\r\n\r\n",
        )
        .await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(!output.contains("hello"));
    }

    #[tokio::test]
    async fn draining_closes_after_the_request_in_flight() {
        let draining = CancellationToken::new();
        let trigger = draining.clone();
        let router = Arc::new(
            Router::new()
                .on(Method::Get, "/", hello)
                .on(Method::Get, "/last", move |_: Request| {
                    let trigger = trigger.clone();
                    async move {
                        trigger.cancel();
                        Response::text("last")
                    }
                }),
        );
        let input = b"GET /last HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let output = roundtrip_with(router, draining, input).await;
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(output.ends_with("last"));
        assert!(!output.contains("hello"));
    }

    #[tokio::test]
    async fn abort_ends_a_waiting_connection() {
        let (_client, server) = duplex(1024);
        let abort = CancellationToken::new();
        let task = tokio::spawn(serve(
            server,
            router(),
            Arc::new(Config::default()),
            CancellationToken::new(),
            abort.clone(),
        ));
        abort.cancel();
        task.await.unwrap();
    }
}
