//! Accept loop and graceful shutdown.
//!
//! # Shutdown in two stages
//!
//! When the shutdown signal fires (SIGTERM, Ctrl-C, or a cancelled token
//! passed to [`Server::serve_with_shutdown`]) the server:
//!
//! 1. Stops calling `listener.accept()`. No new connections are made.
//! 2. Lets in-flight requests finish. Kept-alive connections that sit idle
//!    between requests close right away instead of waiting for the next one.
//! 3. After `shutdown_grace`, aborts whatever is left. WebSocket
//!    connections get a `1001 Going away.` close frame on the way out.
//!
//! Set your orchestrator's termination grace period a little above
//! `shutdown_grace` so stage 3 runs before the process is killed.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug_span, error, info, trace, warn};

use crate::config::Config;
use crate::connection;
use crate::error::Error;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    config: Config,
}

impl Server {
    /// A server with default settings listening on `addr`.
    ///
    /// ```rust,no_run
    /// use hearth::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        let mut config = Config::default();
        config.server.listen = addr.into();
        Self { config }
    }

    /// A server configured by `config`, listening on `config.server.listen`.
    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds, serves `router`, and returns after a full graceful shutdown
    /// triggered by SIGTERM or Ctrl-C.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            trigger.cancel();
        });
        self.serve_with_shutdown(router, shutdown).await
    }

    /// Like [`Server::serve`], but shuts down when `shutdown` is cancelled
    /// instead of on process signals.
    pub async fn serve_with_shutdown(
        self,
        router: Router,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.server.listen.as_str()).await?;
        self.serve_on(listener, router, shutdown).await
    }

    /// Serves connections accepted from an already bound `listener`.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        router: Router,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let config = Arc::new(self.config);
        let router = Arc::new(router);
        let abort = CancellationToken::new();
        let slots = Arc::new(Semaphore::new(config.server.max_connections.max(1)));
        let mut tasks = JoinSet::new();

        info!(addr = %listener.local_addr()?, "hearth listening");

        loop {
            reap(&mut tasks);

            // Past `max_connections`, further accepts wait for a free slot.
            let slot = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                slot = Arc::clone(&slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                trace!(%peer, error = %e, "cannot set TCP_NODELAY");
            }

            let router = Arc::clone(&router);
            let config = Arc::clone(&config);
            let draining = shutdown.clone();
            let abort = abort.clone();
            tasks.spawn(
                async move {
                    connection::serve(stream, router, config, draining, abort).await;
                    drop(slot);
                }
                .instrument(debug_span!("connection", %peer)),
            );
        }

        drop(listener);
        info!(in_flight = tasks.len(), "shutting down, draining connections");

        let drained = tokio::time::timeout(config.shutdown_grace(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "grace period over, aborting connections");
            abort.cancel();
            while tasks.join_next().await.is_some() {}
        }

        info!("hearth stopped");
        Ok(())
    }
}

/// Collects finished connection tasks so the set does not grow without
/// bound on long-running servers.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "connection task panicked");
            }
        }
    }
}

/// Resolves on the first SIGTERM or Ctrl-C. If a handler cannot be
/// installed that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
