//! BACnet/SC (Secure Connect) Datalink Node
//!
//! Implements the connection-management core of ASHRAE 135-2020 Addendum bj
//! (Annex AB) - BACnet Secure Connect.
//!
//! BACnet/SC provides secure, WebSocket-based communication for BACnet
//! networks with:
//! - TLS encryption with mutual certificate authentication
//! - Hub-and-spoke topology with primary/failover hub uplinks
//! - Virtual MAC (VMAC) addressing
//! - Optional hub function and peer-to-peer direct connections
//!
//! # Architecture
//!
//! A node is a composition of three state machines under one supervisor:
//! - [`hub_connector::HubConnector`] keeps a single logical uplink alive,
//!   alternating between a primary and a failover hub URL with a timed
//!   reconnect cycle.
//! - [`hub_function::HubFunction`] (optional) accepts inbound connections
//!   and relays BVLC-SC frames between the connected peers.
//! - [`node_switch::NodeSwitch`] (optional) opens and accepts direct peer
//!   connections and consumes address-resolution results.
//! - [`node::Node`] owns the three, drives their lifecycle (including the
//!   restart-with-fresh-VMAC path on duplicate-VMAC collisions) and
//!   dispatches decoded BVLC-SC control messages.
//!
//! The core is a set of deterministic, single-threaded state machines. It
//! spawns no tasks and never blocks: all transport I/O happens behind the
//! [`transport::Transport`] trait, and time only advances when the caller
//! ticks [`node::Node::poll`] with an explicit [`std::time::Instant`].
//!
//! # WebSocket Subprotocols
//!
//! - `hub.bsc.bacnet.org` - for node-to-hub connections
//! - `dc.bsc.bacnet.org` - for direct node-to-node connections
//!
//! # References
//!
//! - ASHRAE 135-2020, Addendum bj (Annex AB): BACnet Secure Connect
//! - RFC 6455: The WebSocket Protocol

use thiserror::Error;

pub mod bvlc;
pub mod hub_connector;
pub mod hub_function;
pub mod node;
pub mod node_switch;
pub mod socket;
pub mod timer;
pub mod transport;
pub mod wss;

#[cfg(test)]
pub(crate) mod testkit;

pub use bvlc::{BvlcFunction, HubConnectionStatus, Message};
pub use hub_connector::{HubConnector, HubConnectorEvent, HubConnectorState};
pub use hub_function::{HubFunction, HubFunctionEvent};
pub use node::{AddressResolution, Node, NodeConfig, NodeEvent, NodeState};
pub use node_switch::{NodeSwitch, NodeSwitchEvent, SendOutcome};
pub use socket::{ConnectionRole, CtxConfig, SocketContext, SocketCtxEvent};
pub use transport::{
    ConnectionKind, CtxId, SocketId, TlsMaterial, Transport, TransportEvent,
};
pub use wss::{WssTransport, SUBPROTOCOL_DIRECT, SUBPROTOCOL_HUB};

/// Maximum number of simultaneous direct (peer-to-peer) connections and,
/// equally, the capacity of the address-resolution table.
pub const MAX_DIRECT_CONNECTIONS: usize = 16;

/// Maximum number of inbound connections the hub function accepts.
pub const HUB_FUNCTION_CONNECTIONS: usize = 32;

/// Maximum number of URLs kept per address-resolution entry.
pub const MAX_URIS_PER_RESOLUTION: usize = 4;

/// Longest URI accepted from an Address-Resolution-ACK URI list; longer
/// entries are silently skipped.
pub const MAX_URI_SIZE_IN_ADDRESS_RESOLUTION_ACK: usize = 256;

/// Longest accepted WebSocket URL in the node configuration.
pub const MAX_WSURL_LEN: usize = 256;

/// Upper bound on an encoded BVLC-SC frame handled by the core.
pub const NPDU_BUFFER_SIZE: usize = 1600;

/// Result kinds of the BACnet/SC core.
///
/// Synchronous failures are returned from entry points; asynchronous
/// failures travel through events (most notably as the `reason` of a
/// disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScError {
    /// A caller violated a precondition on an entry point.
    #[error("invalid parameter")]
    BadParam,

    /// A fixed-size pool (sockets, resolution entries) is exhausted.
    #[error("no resources")]
    NoResources,

    /// The operation is not permitted in the current state.
    #[error("operation invalid in current state")]
    InvalidOperation,

    /// A peer asserted that our VMAC is already in use on the network.
    /// Fatal for the affected component; the supervisor restarts the node
    /// with a freshly generated VMAC.
    #[error("duplicated VMAC")]
    DuplicatedVmac,

    /// A timer ran out before the operation completed.
    #[error("timed out")]
    Timeout,

    /// The remote side refused the connection or the handshake.
    #[error("connection refused")]
    Refused,

    /// The connection was closed.
    #[error("connection closed")]
    Closed,

    /// TLS or WebSocket failure in the transport.
    #[error("transport failure")]
    Transport,
}

/// 6-byte virtual MAC address; the identity of a BACnet/SC node on the
/// network.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vmac(pub [u8; 6]);

impl Vmac {
    /// The local-broadcast VMAC.
    pub const BROADCAST: Vmac = Vmac([0xFF; 6]);

    /// Generate a Random-48 VMAC per Annex AB H.7.3: the low nibble of the
    /// first octet is forced to `0x2`, all other bits are random.
    pub fn random() -> Self {
        let mut addr: [u8; 6] = rand::random();
        addr[0] = (addr[0] & 0xF0) | 0x02;
        Vmac(addr)
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl std::fmt::Display for Vmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::fmt::Debug for Vmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Vmac({})", self)
    }
}

/// 16-byte stable device identity, kept across VMAC re-randomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUuid(pub [u8; 16]);

impl DeviceUuid {
    pub fn random() -> Self {
        DeviceUuid(rand::random())
    }
}

/// One tick of the cooperative run loop.
///
/// Every component exposes exactly one periodic entry point; the caller
/// invokes it on each tick with the shared transport and the current time,
/// and receives the events the tick produced.
pub trait ProcessState {
    type Event;

    fn process_state(
        &mut self,
        transport: &mut dyn Transport,
        now: std::time::Instant,
    ) -> Vec<Self::Event>;
}
