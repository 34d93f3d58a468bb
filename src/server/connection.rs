//! WebSocket connection state

use axum::extract::ws::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Callback invoked once per inbound data frame
pub type MessageHandler = Arc<dyn Fn(&Connection, Bytes) + Send + Sync>;

/// Callback invoked once when the connection ends
pub type DisconnectHandler = Arc<dyn Fn(&Connection, &CloseReason) + Send + Sync>;

/// Unique, never reused connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Draw a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Frames are being delivered
    Open,
    /// A close trigger fired; cleanup in progress
    Closing,
    /// Removed from the registry and disconnect callbacks returned
    Closed,
}

/// Why a connection ended. The first trigger wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or ended the stream
    PeerClosed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer
        reason: String,
    },
    /// Closed by the server through the gateway
    ServerClosed,
    /// An inbound frame exceeded the size limit
    MessageTooLarge {
        /// Size of the offending frame
        size: usize,
        /// Configured limit
        limit: usize,
    },
    /// A binary frame arrived while binary messages are disabled
    BinaryNotAllowed,
    /// A handler panicked while processing this connection
    HandlerFailed,
    /// Reading or writing the socket failed
    TransportError(String),
    /// The process is shutting down
    Shutdown,
}

impl CloseReason {
    /// Whether the close was caused by a frame breaking the gateway policy
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            CloseReason::MessageTooLarge { .. } | CloseReason::BinaryNotAllowed
        )
    }

    /// Close code sent to the peer; `None` when the peer is already gone
    pub fn close_code(&self) -> Option<u16> {
        match self {
            CloseReason::PeerClosed { .. } | CloseReason::TransportError(_) => None,
            CloseReason::ServerClosed => Some(1000),
            CloseReason::Shutdown => Some(1001),
            CloseReason::BinaryNotAllowed => Some(1003),
            CloseReason::MessageTooLarge { .. } => Some(1008),
            CloseReason::HandlerFailed => Some(1011),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "peer closed ({}: {})", code, reason)
            }
            CloseReason::PeerClosed { code: Some(code), .. } => write!(f, "peer closed ({})", code),
            CloseReason::PeerClosed { .. } => write!(f, "peer closed"),
            CloseReason::ServerClosed => write!(f, "closed by server"),
            CloseReason::MessageTooLarge { size, limit } => {
                write!(f, "message too large ({} > {} bytes)", size, limit)
            }
            CloseReason::BinaryNotAllowed => write!(f, "binary messages not allowed"),
            CloseReason::HandlerFailed => write!(f, "handler failed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// A connected WebSocket client.
///
/// Owned by the gateway from acceptance until its disconnect callbacks
/// return. Callers may register callbacks, queue outbound frames and request
/// closure; everything else is read-only.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    max_message_size: usize,
    binary_allowed: bool,
    connected_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Message>,
    dropped_messages: AtomicU64,
    message_handlers: Mutex<Vec<MessageHandler>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        max_message_size: usize,
        binary_allowed: bool,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            max_message_size,
            binary_allowed,
            connected_at: Utc::now(),
            state: Mutex::new(ConnectionState::Open),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            outbound,
            dropped_messages: AtomicU64::new(0),
            message_handlers: Mutex::new(Vec::new()),
            disconnect_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Largest inbound frame accepted
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether binary frames are delivered
    pub fn binary_allowed(&self) -> bool {
        self.binary_allowed
    }

    /// When the connection was accepted
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// The reason recorded by the first close trigger
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    /// Register a callback for inbound data frames
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Connection, Bytes) + Send + Sync + 'static,
    {
        self.message_handlers.lock().push(Arc::new(handler));
    }

    /// Register a callback for the end of the connection
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Connection, &CloseReason) + Send + Sync + 'static,
    {
        self.disconnect_handlers.lock().push(Arc::new(handler));
    }

    /// Queue a text frame to the peer.
    ///
    /// Returns `false` if the connection is no longer open or the outbound
    /// queue is full, in which case the frame is dropped.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        self.enqueue(Message::Text(text.into()))
    }

    /// Queue a binary frame to the peer; see [`Connection::send_text`]
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.enqueue(Message::Binary(data.into()))
    }

    fn enqueue(&self, message: Message) -> bool {
        if self.state() == ConnectionState::Open && self.outbound.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Outbound frames dropped so far
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Request closure. Only the first call records its reason and returns
    /// `true`; later calls are no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
            }
        }
        self.cancel.cancel();
        true
    }

    /// Whether a close trigger has fired
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn message_handlers(&self) -> Vec<MessageHandler> {
        self.message_handlers.lock().clone()
    }

    /// Detaches every callback. Taking the lists makes the disconnect
    /// callbacks fire at most once and no message callback fire after them.
    pub(crate) fn take_disconnect_handlers(&self) -> Vec<DisconnectHandler> {
        self.message_handlers.lock().clear();
        std::mem::take(&mut *self.disconnect_handlers.lock())
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("close_reason", &self.close_reason.get())
            .finish()
    }
}
