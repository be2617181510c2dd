//! WebSocket channel relay.
//!
//! Clients connect to any path; the path names a channel, and every message
//! a client sends is fanned out to the other open members of that channel.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod router;
pub mod tls;
pub mod websocket;

pub use config::{RelayConfig, TlsConfig};
pub use connection::{Connection, ConnectionId, ConnectionState, Payload, SendOutcome};
pub use envelope::ControlEnvelope;
pub use error::RelayError;
pub use identity::IdentityAssigner;
pub use metrics::RelayMetrics;
pub use registry::ChannelRegistry;
pub use relay::Relay;
pub use router::{BroadcastReport, broadcast};

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use crate::tls::TlsListener;
use crate::websocket::{RequestIdMakeSpan, websocket_handler};

/// Build a relay with an empty registry.
pub fn build_relay(config: &RelayConfig, metrics: Arc<RelayMetrics>) -> Arc<Relay> {
    Arc::new(Relay::new(
        ChannelRegistry::new(),
        IdentityAssigner::new(config.identity),
        metrics,
    ))
}

/// Every path is a channel, so the relay is mounted as the fallback.
pub fn create_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .fallback(websocket_handler)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(relay)
}

/// Serve the relay on `listener` until `shutdown` resolves, terminating TLS
/// first when an acceptor is given.
pub async fn serve<F>(
    listener: TcpListener,
    relay: Arc<Relay>,
    tls: Option<TlsAcceptor>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(relay);
    match tls {
        Some(acceptor) => {
            let listener = TlsListener::new(listener, acceptor)?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        }
        None => {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        }
    }
}
