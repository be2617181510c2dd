use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::MakeSpan;
use tracing::{Instrument, debug, field, info_span};
use uuid::Uuid;

use crate::connection::Payload;
use crate::relay::Relay;

/// Span maker that tags each incoming request with a random request id.
#[derive(Clone)]
pub struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Upgrade any path to a relay connection. The path (with query) names the
/// channel.
pub async fn websocket_handler(
    State(relay): State<Arc<Relay>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.on_upgrade(move |socket| handle_websocket(socket, relay, path, host))
}

pub async fn handle_websocket(socket: WebSocket, relay: Arc<Relay>, path: String, host: String) {
    let span = info_span!("conn", id = field::Empty, path = %path, host = %host);
    async move {
        let (connection, mut outbound) = relay.join(&path).await;
        tracing::Span::current().record("id", connection.id().as_u64());

        let (mut sender, mut receiver) = socket.split();

        // Drain queued payloads into the socket. The queue ends when the
        // connection is marked closed; a rejected write ends it early.
        let writer = tokio::spawn(
            async move {
                while let Some(payload) = outbound.recv().await {
                    if sender.send(into_message(payload)).await.is_err() {
                        debug!("Socket write failed, stopping writer");
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    relay.on_message(&connection, Payload::Text(text)).await;
                }
                Ok(Message::Binary(bytes)) => {
                    relay.on_message(&connection, Payload::Binary(bytes)).await;
                }
                // Keep reading: the close reply goes out on the next poll and
                // the stream ends once the handshake is complete.
                Ok(Message::Close(frame)) => {
                    debug!("Close frame received: {:?}", frame);
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                // The stream ends on its own after a fatal error.
                Err(e) => relay.on_error(&connection, e),
            }
        }

        relay.on_close(&connection).await;
        if let Err(e) = writer.await {
            debug!("Writer task failed: {}", e);
        }
    }
    .instrument(span)
    .await
}

fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text),
        Payload::Binary(bytes) => Message::Binary(bytes),
    }
}
