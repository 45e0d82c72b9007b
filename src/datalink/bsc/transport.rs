//! Abstract connection API consumed by the BACnet/SC core.
//!
//! The core never touches the network. It registers socket contexts with a
//! [`Transport`], asks it to connect, send and close, and learns about the
//! outside world exclusively through [`TransportEvent`]s drained on each
//! run-loop tick. The production implementation over secure WebSockets
//! lives in [`super::wss`]; tests substitute a recording mock.

use bytes::Bytes;

use super::ScError;

/// Identifies a registered socket context within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtxId(pub u32);

/// Identifies one live or in-progress connection within a transport.
///
/// Ids are never reused for the lifetime of the transport, so a stale
/// event for a socket the core already released is simply unroutable and
/// gets dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

/// The connection role of a socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Opens outbound connections (`connect`).
    Initiator,
    /// Listens on a port and surfaces inbound connections (`Accepted`).
    Acceptor,
}

/// Which WebSocket subprotocol family a context speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// `hub.bsc.bacnet.org` - node-to-hub.
    Hub,
    /// `dc.bsc.bacnet.org` - node-to-node direct.
    Direct,
}

/// TLS credentials shared by every socket of a node.
///
/// All three buffers are PEM-encoded and immutable for the life of the
/// node.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_cert_chain: Vec<u8>,
    pub cert_chain: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsMaterial {
    pub fn is_empty(&self) -> bool {
        self.ca_cert_chain.is_empty() || self.cert_chain.is_empty() || self.key.is_empty()
    }
}

/// Parameters for registering one socket context with a transport.
#[derive(Debug, Clone)]
pub struct TransportCtxParams {
    pub role: ConnectionRole,
    pub kind: ConnectionKind,
    /// Listen port; required for (and only meaningful to) acceptors.
    pub listen_port: Option<u16>,
    pub tls: std::sync::Arc<TlsMaterial>,
    /// Upper bound for a single WebSocket message.
    pub max_frame: usize,
}

/// Asynchronous notifications from the transport, delivered in per-socket
/// order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An outbound connection finished its TLS + WebSocket handshake.
    Connected { ctx: CtxId, socket: SocketId },
    /// An inbound connection was accepted on an acceptor context.
    Accepted { ctx: CtxId, socket: SocketId },
    /// The connection ended; `reason` carries the transport's verdict.
    Disconnected {
        ctx: CtxId,
        socket: SocketId,
        reason: ScError,
    },
    /// A binary WebSocket message arrived.
    Received {
        ctx: CtxId,
        socket: SocketId,
        frame: Bytes,
    },
}

impl TransportEvent {
    pub fn ctx(&self) -> CtxId {
        match self {
            TransportEvent::Connected { ctx, .. }
            | TransportEvent::Accepted { ctx, .. }
            | TransportEvent::Disconnected { ctx, .. }
            | TransportEvent::Received { ctx, .. } => *ctx,
        }
    }
}

/// The connection API the core consumes.
///
/// All methods are non-blocking. `connect` only starts an attempt; the
/// outcome arrives later as `Connected` or `Disconnected`. `close` always
/// results in a terminal `Disconnected` for the socket, even when the
/// connection was still in progress.
pub trait Transport: Send {
    /// Register a socket context. Acceptors start listening here.
    fn register(&mut self, params: TransportCtxParams) -> Result<CtxId, ScError>;

    /// Stop accepting for a context. Established sockets are unaffected
    /// and must be closed individually.
    fn unregister(&mut self, ctx: CtxId);

    /// Begin an outbound connection attempt.
    fn connect(&mut self, ctx: CtxId, url: &str) -> Result<SocketId, ScError>;

    /// Queue one binary message on an established connection.
    fn send(&mut self, socket: SocketId, frame: &[u8]) -> Result<(), ScError>;

    /// Tear the connection down.
    fn close(&mut self, socket: SocketId);

    /// Drain one pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}
