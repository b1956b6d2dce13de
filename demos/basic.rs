//! A tour of hearth: plain text, path params, forms with uploads, a chunked
//! stream and a WebSocket echo.
//!
//! Run with:
//!   cargo run --example basic -- --listen 127.0.0.1:3000 --log-level debug
//!
//! Try:
//!   curl http://localhost:3000/hello/ada
//!   curl -X POST http://localhost:3000/echo -d 'anything'
//!   curl -F name=ada -F avatar=@Cargo.toml http://localhost:3000/signup
//!   curl -N http://localhost:3000/count
//!   websocat ws://localhost:3000/ws

use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use hearth::{Config, Error, Method, Request, Response, Router, Server, Status, WebSocket};
use tracing_subscriber::EnvFilter;

/// Command-line arguments. They override the configuration file.
#[derive(Parser, Debug)]
#[command(name = "hearth-basic")]
#[command(about = "hearth demo server", long_about = None)]
struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:3000)
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app = Router::new()
        .on(Method::Get, "/hello/{name}", hello)
        .on(Method::Post, "/echo", echo)
        .on(Method::Post, "/signup", signup)
        .on(Method::Get, "/count", count)
        .websocket("/ws", ws_echo);

    Server::with_config(config).serve(app).await?;
    Ok(())
}

async fn hello(req: Request) -> Response {
    let name = req.param("name").unwrap_or("stranger");
    Response::text(format!("Hello, {name}!"))
}

// The body is pulled from the socket only here.
async fn echo(mut req: Request) -> Result<Response, Error> {
    let body = Bytes::copy_from_slice(req.raw_body().await?);
    Ok(Response::builder().header("X-Echo", "yes").bytes(hearth::ContentType::OctetStream, body))
}

async fn signup(mut req: Request) -> Result<Response, Error> {
    req.parse_body().await?;
    let (Some(form), Some(files)) = (req.form(), req.files()) else {
        return Ok(Response::new(Status::BadRequest));
    };
    let name = form.require("name")?;
    let avatar = files.get("avatar").map_or(0, |file| file.len());
    Ok(Response::json(format!(r#"{{"name":"{name}","avatar_bytes":{avatar}}}"#)))
}

async fn count(_: Request) -> Response {
    Response::streamer((1..=5).map(|n| format!("{n}\n")), "text/plain")
}

async fn ws_echo(_: Request, ws: WebSocket) -> Result<(), Error> {
    while let Some(message) = ws.recv().await {
        ws.send(message)?;
    }
    Ok(())
}
