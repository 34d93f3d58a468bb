//! WebSocket connection gateway: registry, lifecycle and frame dispatch

use super::connection::{CloseReason, Connection, ConnectionId, ConnectionState};
use crate::config::GatewaySettings;
use arc_swap::ArcSwap;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tracing::{debug, warn};

/// Callback invoked once per accepted connection
pub type ConnectHandler = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// How long the gateway waits to deliver a close frame to a peer
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Why reading the next inbound frame failed
#[derive(Debug, Clone, PartialEq)]
pub enum ReadFailure {
    /// The transport refused a frame over its size limit
    TooLarge {
        /// Announced frame size in bytes
        size: usize,
    },
    /// Any other transport failure
    Transport(String),
}

impl From<String> for ReadFailure {
    fn from(err: String) -> Self {
        ReadFailure::Transport(err)
    }
}

impl From<axum::Error> for ReadFailure {
    fn from(err: axum::Error) -> Self {
        let err = err.into_inner();
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&*err);
        while let Some(e) = source {
            if let Some(WsError::Capacity(CapacityError::MessageTooLong { size, .. })) = e.downcast_ref::<WsError>() {
                return ReadFailure::TooLarge { size: *size };
            }
            source = e.source();
        }

        // The transport may be built against another tungstenite release.
        let text = err.to_string();
        match oversized_frame_size(&text) {
            Some(size) => ReadFailure::TooLarge { size },
            None => ReadFailure::Transport(text),
        }
    }
}

/// Frame size from a "Message too long: <size> > <max>" transport message
fn oversized_frame_size(text: &str) -> Option<usize> {
    let rest = text.split("Message too long: ").nth(1)?;
    rest.split(|c: char| !c.is_ascii_digit()).next()?.parse().ok()
}

/// Accepts upgraded WebSocket connections, keeps the live registry and
/// drives one task per connection.
///
/// Per connection: `on_connect` handlers run after registry insertion and
/// before any frame is read; message handlers run one at a time in arrival
/// order; disconnect handlers run exactly once, after registry removal,
/// and nothing runs after them.
pub struct ConnectionGateway {
    settings: GatewaySettings,
    registry: DashMap<ConnectionId, Arc<Connection>>,
    connect_handlers: ArcSwap<Vec<ConnectHandler>>,
    accepting: AtomicBool,
    accepted: AtomicU64,
    idle: Notify,
}

impl ConnectionGateway {
    /// Declare the upgrade endpoint and per-connection limits
    pub fn configure(endpoint: impl Into<String>, max_message_size: usize, binary_allowed: bool) -> Self {
        Self::from_settings(&GatewaySettings {
            endpoint: endpoint.into(),
            max_message_size,
            binary_messages: binary_allowed,
            ..Default::default()
        })
    }

    /// Gateway from configuration
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            settings: settings.clone(),
            registry: DashMap::new(),
            connect_handlers: ArcSwap::from_pointee(Vec::new()),
            accepting: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    /// Upgrade endpoint path
    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// Active settings
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Register a handler for new connections; handlers run in registration order
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        let handler: ConnectHandler = Arc::new(handler);
        self.connect_handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&handler));
            next
        });
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Connections accepted since start
    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Look up a live connection
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Identifiers of every live connection
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.registry.iter().map(|entry| *entry.key()).collect()
    }

    /// Close one connection from the server side
    pub fn close(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        match self.get(id) {
            Some(conn) => conn.close(reason),
            None => false,
        }
    }

    /// Close every live connection; returns how many were newly closed
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let connections: Vec<_> = self.registry.iter().map(|e| Arc::clone(e.value())).collect();
        connections
            .into_iter()
            .filter(|conn| conn.close(reason.clone()))
            .count()
    }

    /// Wait until the registry is empty; `false` on timeout
    pub async fn drain(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.registry.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        timeout(limit, wait).await.is_ok()
    }

    /// Stop admitting connections, force-close the open ones and wait up to
    /// `limit` for their disconnect callbacks to finish.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let closed = self.close_all(CloseReason::Shutdown);
        debug!(closed, "closing connections for shutdown");
        self.drain(limit).await
    }

    /// Drive an upgraded axum socket to completion
    pub async fn serve(&self, socket: WebSocket, remote_addr: SocketAddr) {
        let (writer, reader) = socket.split();
        self.handle(remote_addr, writer, reader).await;
    }

    /// Register a connection over any frame transport and run its lifecycle
    /// until it reaches `Closed`.
    pub async fn handle<W, R, E>(&self, remote_addr: SocketAddr, mut writer: W, mut reader: R)
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: Into<ReadFailure>,
    {
        let (conn, mut outbound) = self.register(remote_addr);

        let handlers = self.connect_handlers.load_full();
        for handler in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(&conn))).is_err() {
                conn.close(CloseReason::HandlerFailed);
            }
        }
        if !self.accepting.load(Ordering::SeqCst) {
            conn.close(CloseReason::Shutdown);
        }

        loop {
            tokio::select! {
                biased;
                _ = conn.closed() => break,
                Some(message) = outbound.recv() => {
                    // A peer that stops reading must not pin the task past close.
                    tokio::select! {
                        biased;
                        _ = conn.closed() => break,
                        sent = writer.send(message) => {
                            if let Err(e) = sent {
                                conn.close(CloseReason::TransportError(e.to_string()));
                            }
                        }
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(message)) => self.handle_frame(&conn, message),
                    Some(Err(e)) => match Into::<ReadFailure>::into(e) {
                        ReadFailure::TooLarge { size } => {
                            conn.close(CloseReason::MessageTooLarge {
                                size,
                                limit: conn.max_message_size(),
                            });
                        }
                        ReadFailure::Transport(e) => {
                            conn.close(CloseReason::TransportError(e));
                        }
                    },
                    None => {
                        conn.close(CloseReason::PeerClosed { code: None, reason: String::new() });
                    }
                },
            }
        }

        let reason = conn.close_reason().unwrap_or(CloseReason::ServerClosed);
        if let Some(code) = reason.close_code() {
            let frame = CloseFrame {
                code,
                reason: reason.to_string().into(),
            };
            match timeout(CLOSE_SEND_TIMEOUT, writer.send(Message::Close(Some(frame)))).await {
                Ok(Err(e)) => debug!(id = %conn.id(), error = %e, "close frame not delivered"),
                Err(_) => debug!(id = %conn.id(), "close frame timed out"),
                Ok(Ok(())) => {}
            }
        }
        let _ = timeout(CLOSE_SEND_TIMEOUT, writer.close()).await;

        self.unregister(&conn, &reason);
    }

    fn register(&self, remote_addr: SocketAddr) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        loop {
            let id = ConnectionId::new();
            if let Entry::Vacant(slot) = self.registry.entry(id) {
                let (tx, rx) = mpsc::channel(self.settings.outbound_buffer.max(1));
                let conn = Arc::new(Connection::new(
                    id,
                    remote_addr,
                    self.settings.max_message_size,
                    self.settings.binary_messages,
                    tx,
                ));
                slot.insert(Arc::clone(&conn));
                self.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, remote = %remote_addr, "connection registered");
                return (conn, rx);
            }
        }
    }

    fn unregister(&self, conn: &Arc<Connection>, reason: &CloseReason) {
        if self.registry.remove(&conn.id()).is_none() {
            warn!(id = %conn.id(), "connection missing from registry at close");
        }

        for handler in conn.take_disconnect_handlers() {
            if catch_unwind(AssertUnwindSafe(|| handler(conn.as_ref(), reason))).is_err() {
                warn!(id = %conn.id(), "disconnect handler panicked");
            }
        }
        conn.mark_closed();
        debug!(id = %conn.id(), reason = %reason, "connection closed");

        if self.registry.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn handle_frame(&self, conn: &Connection, message: Message) {
        let data = match message {
            Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Message::Binary(data) => {
                if !conn.binary_allowed() {
                    conn.close(CloseReason::BinaryNotAllowed);
                    return;
                }
                data
            }
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(frame.code), frame.reason.as_str().to_string()),
                    None => (None, String::new()),
                };
                conn.close(CloseReason::PeerClosed { code, reason });
                return;
            }
            // The transport answers pings itself.
            Message::Ping(_) | Message::Pong(_) => return,
        };

        if data.len() > conn.max_message_size() {
            conn.close(CloseReason::MessageTooLarge {
                size: data.len(),
                limit: conn.max_message_size(),
            });
            return;
        }
        if conn.state() != ConnectionState::Open {
            return;
        }

        for handler in conn.message_handlers() {
            if catch_unwind(AssertUnwindSafe(|| handler(conn, data.clone()))).is_err() {
                conn.close(CloseReason::HandlerFailed);
                return;
            }
        }
    }
}
