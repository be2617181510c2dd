//! Connection handles shared between the transport and the channel registry.
//!
//! The transport owns the socket; the registry only holds `Arc<Connection>`
//! handles whose outbound side is an unbounded queue drained by the
//! transport's writer task.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use axum::body::Bytes;
use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Opaque relayed content. Never parsed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<Utf8Bytes>) -> Self {
        Payload::Text(text.into())
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Payload::Binary(bytes.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text payloads as a string slice, for logging previews.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text.as_str()),
            Payload::Binary(_) => None,
        }
    }
}

/// Result of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport's writer queue.
    Queued,
    /// The writer has gone away; the payload was dropped.
    Discarded,
}

pub type OutboundReceiver = mpsc::UnboundedReceiver<Payload>;

/// One live peer as seen by the relay core.
pub struct Connection {
    id: ConnectionId,
    channel_id: String,
    open: AtomicBool,
    identity: OnceLock<String>,
    /// Taken on close so the writer drains what is queued and stops.
    outbound: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
}

impl Connection {
    /// Create an open connection bound to `channel_id`, returning the
    /// receiver the transport drains into the socket.
    pub fn new(channel_id: impl Into<String>) -> (Arc<Self>, OutboundReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            channel_id: channel_id.into(),
            open: AtomicBool::new(true),
            identity: OnceLock::new(),
            outbound: Mutex::new(Some(outbound)),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> ConnectionState {
        if self.open.load(Ordering::Acquire) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Transition to `Closed`. Returns `false` if already closed.
    ///
    /// The outbound queue is closed as well: payloads already queued are
    /// still handed to the writer, later sends are discarded.
    pub fn mark_closed(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.outbound().take();
        was_open
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Payload>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Identity is write-once; a second assignment is refused.
    pub(crate) fn assign_identity(&self, token: String) -> bool {
        self.identity.set(token).is_ok()
    }

    /// Queue `payload` for the transport without waiting for transmission.
    pub fn send(&self, payload: Payload) -> SendOutcome {
        match self.outbound().as_ref().map(|tx| tx.send(payload)) {
            Some(Ok(())) => SendOutcome::Queued,
            Some(Err(_)) | None => SendOutcome::Discarded,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

/// Derive the channel key from a request's path and query.
///
/// Exactly one leading `/` is stripped. The remainder is used verbatim:
/// case-sensitive, not URL-decoded, query string included.
pub fn channel_key(path_and_query: &str) -> String {
    path_and_query
        .strip_prefix('/')
        .unwrap_or(path_and_query)
        .to_string()
}
