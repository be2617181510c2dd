//! Connection lifecycle: join, message, close, error.
//!
//! All registry access goes through one mutex, so registration, pruning and
//! recipient selection never interleave between connections. Sends only
//! enqueue, so the lock is never held across I/O.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::connection::{
    Connection, ConnectionId, OutboundReceiver, Payload, SendOutcome, channel_key,
};
use crate::envelope::ControlEnvelope;
use crate::identity::IdentityAssigner;
use crate::metrics::RelayMetrics;
use crate::registry::ChannelRegistry;
use crate::router::{self, BroadcastReport};

pub struct Relay {
    registry: Mutex<ChannelRegistry>,
    identity: IdentityAssigner,
    metrics: Arc<RelayMetrics>,
}

impl Relay {
    pub fn new(
        registry: ChannelRegistry,
        identity: IdentityAssigner,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry: Mutex::new(registry),
            identity,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Accept a new connection for the request path `path_and_query`.
    ///
    /// The connection is registered and, when identity assignment is on,
    /// its identity envelope is queued before the registry lock is released.
    /// No relayed payload can therefore reach it first.
    pub async fn join(&self, path_and_query: &str) -> (Arc<Connection>, OutboundReceiver) {
        let channel_id = channel_key(path_and_query);
        let (connection, outbound) = Connection::new(channel_id.clone());

        let mut registry = self.registry.lock().await;
        registry.register(&channel_id, connection.clone());
        self.metrics.connection_opened();
        if let Some(token) = self.identity.issue() {
            self.send_identity(&connection, token);
        }
        drop(registry);

        debug!(
            "Total clients: {}, channel: {:?}",
            self.client_count(),
            channel_id
        );

        (connection, outbound)
    }

    fn send_identity(&self, connection: &Connection, token: String) {
        if !connection.assign_identity(token.clone()) {
            warn!("Connection {} already has an identity", connection.id());
            return;
        }
        self.metrics.identity_issued();
        debug!("NEW client {}: ID {}", connection.id(), token);

        match ControlEnvelope::identity(token).to_payload() {
            Ok(payload) => {
                if connection.send(payload) == SendOutcome::Discarded {
                    debug!("Identity for {} discarded, writer is gone", connection.id());
                    self.metrics.send_discarded();
                }
            }
            Err(e) => error!("Failed to serialize identity envelope: {}", e),
        }
    }

    /// Relay an inbound payload from `sender` to the rest of its channel.
    pub async fn on_message(&self, sender: &Arc<Connection>, payload: Payload) -> BroadcastReport {
        self.metrics.message_received();
        match payload.as_text() {
            Some(text) => debug!(
                "MSG from {} ({} bytes): {}",
                sender.id(),
                text.len(),
                preview(text)
            ),
            None => debug!(
                "MSG from {} ({} bytes, binary)",
                sender.id(),
                payload.len()
            ),
        }
        self.broadcast(sender, &payload).await
    }

    /// Handle the transport's close event.
    ///
    /// The connection is marked closed but stays in the registry until the
    /// next broadcast on its channel prunes it. Returns the disconnect
    /// broadcast when identity assignment is on.
    pub async fn on_close(&self, connection: &Arc<Connection>) -> Option<BroadcastReport> {
        if !connection.mark_closed() {
            return None;
        }
        self.metrics.connection_closed();

        if !self.identity.is_enabled() {
            debug!("Client {} disconnected", connection.id());
            return None;
        }

        debug!(
            "Client {} DISCONNECTED",
            connection.identity().unwrap_or("<unassigned>")
        );
        match ControlEnvelope::disconnect().to_payload() {
            Ok(payload) => Some(self.broadcast(connection, &payload).await),
            Err(e) => {
                error!("Failed to serialize disconnect envelope: {}", e);
                None
            }
        }
    }

    /// Transport errors are logged only; the transport is expected to
    /// follow up with a close event.
    pub fn on_error(&self, connection: &Connection, err: impl fmt::Display) {
        self.metrics.transport_error();
        warn!("ERROR on connection {}: {}", connection.id(), err);
    }

    async fn broadcast(&self, sender: &Arc<Connection>, payload: &Payload) -> BroadcastReport {
        let report = {
            let mut registry = self.registry.lock().await;
            router::broadcast(&mut registry, sender, sender.channel_id(), payload)
        };
        self.metrics.record_broadcast(&report);
        report
    }

    /// Connections that are currently open.
    pub fn client_count(&self) -> u64 {
        self.metrics.active_connections.load(Ordering::Relaxed)
    }

    pub async fn channel_count(&self) -> usize {
        self.registry.lock().await.channel_count()
    }

    /// Ids of the members listed for `channel_id`, in join order, or `None`
    /// if the channel is not registered.
    pub async fn members(&self, channel_id: &str) -> Option<Vec<ConnectionId>> {
        let registry = self.registry.lock().await;
        registry
            .lookup(channel_id)
            .map(|members| members.iter().map(|m| m.id()).collect())
    }
}

fn preview(text: &str) -> &str {
    const MAX_PREVIEW: usize = 120;
    if text.len() <= MAX_PREVIEW {
        return text;
    }
    let mut end = MAX_PREVIEW;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn relay(identity: bool) -> Relay {
        Relay::new(
            ChannelRegistry::new(),
            IdentityAssigner::new(identity),
            Arc::new(RelayMetrics::new()),
        )
    }

    fn json_of(payload: Payload) -> Value {
        serde_json::from_str(payload.as_text().expect("text payload")).unwrap()
    }

    #[tokio::test]
    async fn test_message_reaches_peer_not_sender() {
        let relay = relay(false);
        let (x, mut rx_x) = relay.join("/lobby").await;
        let (_y, mut rx_y) = relay.join("/lobby").await;

        relay.on_message(&x, Payload::text("hi")).await;

        assert_eq!(rx_y.try_recv().unwrap(), Payload::text("hi"));
        assert!(rx_x.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_identity_envelope_is_first_message() {
        let relay = relay(true);
        let (x, _rx_x) = relay.join("/room").await;
        let (z, mut rx_z) = relay.join("/room").await;

        relay.on_message(&x, Payload::text("relayed")).await;

        let first = json_of(rx_z.try_recv().unwrap());
        assert_eq!(first["type"], "uuid");
        assert_eq!(first["data"], z.identity().unwrap());
        assert_eq!(rx_z.try_recv().unwrap(), Payload::text("relayed"));
    }

    #[tokio::test]
    async fn test_identity_tokens_are_unique() {
        let relay = relay(true);
        let (a, _ra) = relay.join("/room").await;
        let (b, _rb) = relay.join("/room").await;
        assert!(!a.identity().unwrap().is_empty());
        assert_ne!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_identity_disabled_sends_nothing() {
        let relay = relay(false);
        let (x, mut rx_x) = relay.join("/room").await;
        let (_y, mut rx_y) = relay.join("/room").await;

        assert!(x.identity().is_none());
        assert!(rx_x.try_recv().is_err());

        assert!(relay.on_close(&x).await.is_none());
        assert!(rx_y.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_announces_disconnect() {
        let relay = relay(true);
        let (x, _rx_x) = relay.join("/lobby").await;
        let (_y, mut rx_y) = relay.join("/lobby").await;
        let _ = rx_y.try_recv(); // identity envelope

        let report = relay.on_close(&x).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(
            json_of(rx_y.try_recv().unwrap()),
            json!({ "type": "disconnect", "message": "bye" })
        );
    }

    #[tokio::test]
    async fn test_last_member_close_removes_channel() {
        let relay = relay(true);
        let (x, _rx_x) = relay.join("/solo").await;

        relay.on_close(&x).await;

        assert!(relay.members("solo").await.is_none());
    }

    #[tokio::test]
    async fn test_close_without_identity_leaves_member_until_next_broadcast() {
        let relay = relay(false);
        let (x, _rx_x) = relay.join("/lobby").await;
        let (y, _rx_y) = relay.join("/lobby").await;

        relay.on_close(&x).await;
        assert_eq!(relay.members("lobby").await.unwrap().len(), 2);

        relay.on_message(&y, Payload::text("anyone?")).await;
        assert_eq!(relay.members("lobby").await.unwrap(), vec![y.id()]);
    }

    #[tokio::test]
    async fn test_transport_closed_member_is_pruned() {
        let relay = relay(false);
        let (x, mut rx_x) = relay.join("/lobby").await;
        let (y, _rx_y) = relay.join("/lobby").await;

        // Transport flips state without a close event.
        x.mark_closed();
        let report = relay.on_message(&y, Payload::text("ping")).await;

        assert_eq!(report.pruned, 1);
        assert!(rx_x.try_recv().is_err());
        assert_eq!(relay.members("lobby").await.unwrap(), vec![y.id()]);
    }

    #[tokio::test]
    async fn test_double_close_is_ignored() {
        let relay = relay(true);
        let (x, _rx_x) = relay.join("/lobby").await;
        let (_y, _rx_y) = relay.join("/lobby").await;

        assert!(relay.on_close(&x).await.is_some());
        assert!(relay.on_close(&x).await.is_none());
        assert_eq!(relay.client_count(), 1);
    }

    #[tokio::test]
    async fn test_error_does_not_close() {
        let relay = relay(false);
        let (x, _rx_x) = relay.join("/lobby").await;

        relay.on_error(&x, "malformed frame");

        assert!(x.is_open());
        assert_eq!(relay.metrics().snapshot().transport_errors, 1);
    }

    #[tokio::test]
    async fn test_query_string_is_a_distinct_channel() {
        let relay = relay(false);
        let (a, _ra) = relay.join("/lobby").await;
        let (_b, mut rb) = relay.join("/lobby?x=1").await;

        relay.on_message(&a, Payload::text("hi")).await;

        assert!(rb.try_recv().is_err());
        assert_eq!(relay.channel_count().await, 2);
    }

    #[tokio::test]
    async fn test_metrics_follow_lifecycle() {
        let relay = relay(true);
        let (x, _rx_x) = relay.join("/lobby").await;
        let (_y, _rx_y) = relay.join("/lobby").await;
        relay.on_message(&x, Payload::text("hi")).await;
        relay.on_close(&x).await;

        let snapshot = relay.metrics().snapshot();
        assert_eq!(snapshot.connections.total, 2);
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.connections.identities_issued, 2);
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.delivered, 2);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let long = "é".repeat(100);
        let cut = preview(&long);
        assert!(cut.len() <= 120);
        assert!(long.starts_with(cut));
    }
}
