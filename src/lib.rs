//! apiproxy: a load-balancing reverse proxy for a sharded financial Web API.
//!
//! Entities (creditors, debtors, or accounts) are spread over a fleet of
//! backend servers. Each request's URL path yields a 32-bit sharding key
//! (an MD5 of the entity ids embedded in the path), and a binary routing
//! tree maps the key to the one upstream responsible for it. On top of the
//! plain forwarding the proxy stitches per-shard enumeration pages into a
//! fleet-wide chain, reserves new entity ids at random positions in its
//! configured interval, and hot-reloads its routing plane when the config
//! file changes.

pub mod config;
pub mod dispatch;
pub mod enumerate;
pub mod errors;
pub mod http;
pub mod metrics_defs;
pub mod mode;
pub mod reserve;
pub mod routes;
pub mod servers;
pub mod sharding;
pub mod tree;
pub mod watcher;

#[cfg(test)]
mod testutils;

use crate::config::Settings;
use crate::dispatch::{ApiProxyService, AppState};
use crate::errors::ApiProxyError;
use crate::watcher::ConfigWatcher;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Runs the proxy until a shutdown signal arrives.
pub async fn run(settings: Settings) -> Result<(), ApiProxyError> {
    let state = Arc::new(AppState::new(&settings));
    if settings.config_file.exists() {
        state.reload_from(&settings.config_file);
    } else {
        tracing::warn!(
            path = %settings.config_file.display(),
            "Config file does not exist yet; rejecting all requests until it appears"
        );
    }
    let watcher = ConfigWatcher::spawn(settings.config_file.clone(), state.clone());

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        mode = ?settings.mode,
        "apiproxy listening"
    );

    let service = ApiProxyService::new(state);
    let graceful = GracefulShutdown::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _peer_addr) = accepted?;
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let svc = service.clone();
                // Hand the connection to hyper; auto-detect h1/h2 on this socket
                let builder = Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(io, svc);
                let conn = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    let _ = conn.await;
                });
            }
        }
    }

    // Stop accepting, stop watching, drain what is in flight.
    drop(listener);
    watcher.stop();
    graceful.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
