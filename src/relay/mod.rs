//! The relay server: one HTTP listener carrying the `/extension` and
//! `/cdp` WebSocket endpoints plus a small HTTP surface for discovery.

pub mod admission;
mod client;
mod extension;
mod http;
mod intercept;
mod pending;
pub mod protocol;
pub mod state;
mod targets;

pub use state::Relay;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::relay::protocol::CloseReason;

/// A bound, not-yet-serving relay. Binding first lets callers learn the
/// actual port (ephemeral binds in tests) before traffic starts.
pub struct RelayServer {
    relay: Arc<Relay>,
    listener: TcpListener,
}

impl RelayServer {
    pub async fn bind(config: Config) -> Result<RelayServer> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(RelayServer {
            relay: Arc::new(Relay::new(config)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Serve until `shutdown` resolves, then drain: the extension slot and
    /// every client close, in-flight requests fire their terminal errors,
    /// and the listener stops.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let relay = Arc::clone(&self.relay);
        let app = router(Arc::clone(&self.relay));
        let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown requested, draining relay");
            relay.shutdown().await;
            let _ = drained_tx.send(());
        });

        info!(addr = %self.listener.local_addr()?, "Relay listening");
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drained_rx.await;
        })
        .await?;
        Ok(())
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }
}

fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/version", get(http::version))
        .route("/extension/status", get(http::extension_status))
        .route("/mcp-log", post(http::mcp_log))
        .route("/extension", get(extension::extension_upgrade))
        .route("/cdp", get(client::cdp_upgrade))
        .route("/cdp/{client_id}", get(client::cdp_upgrade_with_id))
        .with_state(relay)
}

impl Relay {
    /// Administrative shutdown: stop admitting sockets, close the
    /// extension and every client, and fail everything in flight.
    pub async fn shutdown(&self) {
        self.start_draining();
        let slot = self.extension.lock().await.take();
        if let Some(mut slot) = slot {
            if let Some(close) = slot.close_tx.take() {
                let _ = close.send(CloseReason::SHUTTING_DOWN);
            }
        }
        self.fail_all_pending().await;
        self.close_all_clients(CloseReason::EXTENSION_GONE).await;
        self.clear_targets().await;
    }
}
