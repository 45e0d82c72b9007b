//! Socket pool and socket context state machines.
//!
//! A [`SocketContext`] multiplexes a fixed, preallocated pool of sockets
//! that share one connection role, one set of TLS credentials and one
//! timeout configuration. The context owns the BVLC-SC connect handshake
//! (Connect-Request / Connect-Accept, including duplicate-VMAC rejection)
//! and the heartbeat exchange; its owner only ever sees fully established
//! peers.
//!
//! Socket lifecycle: `Idle -> Connecting -> Connected -> Disconnecting ->
//! Idle`. Context lifecycle: initialized at construction, `Deinitializing`
//! after [`SocketContext::deinit`], and a final
//! [`SocketCtxEvent::Deinitialized`] once the last socket has returned to
//! `Idle` - the only signal that every resource is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};

use super::bvlc::{
    BvlcFunction, ConnectParams, Message, Payload, ERROR_CLASS_COMMUNICATION,
    ERROR_CODE_NODE_DUPLICATE_VMAC,
};
use super::timer::MsTimer;
use super::transport::{
    ConnectionKind, CtxId, SocketId, TlsMaterial, Transport, TransportCtxParams, TransportEvent,
};
use super::{DeviceUuid, ScError, Vmac};

pub use super::transport::ConnectionRole;

/// Configuration shared by every socket of one context.
#[derive(Debug, Clone)]
pub struct CtxConfig {
    pub role: ConnectionRole,
    pub kind: ConnectionKind,
    /// Listen port, required for acceptors.
    pub listen_port: Option<u16>,
    pub tls: Arc<TlsMaterial>,
    pub local_vmac: Vmac,
    pub local_uuid: DeviceUuid,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl CtxConfig {
    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            vmac: self.local_vmac,
            uuid: self.local_uuid,
            max_bvlc_len: self.max_bvlc_len,
            max_npdu_len: self.max_npdu_len,
        }
    }
}

/// Events a context reports to its owning component.
#[derive(Debug, Clone)]
pub enum SocketCtxEvent {
    /// The connect handshake completed; the peer identity is now known.
    Connected { slot: usize },
    /// The socket returned to `Idle`. A `DuplicatedVmac` reason means a
    /// peer asserted our local VMAC is taken.
    Disconnected { slot: usize, reason: ScError },
    /// An application-level frame arrived on an established socket.
    Received {
        slot: usize,
        pdu: Bytes,
        decoded: Message,
    },
    /// All sockets are back to `Idle` after `deinit`.
    Deinitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct Socket {
    state: SocketState,
    id: Option<SocketId>,
    peer_vmac: Option<Vmac>,
    peer_uuid: Option<DeviceUuid>,
    /// Reason to surface when the terminal `Disconnected` lands, when the
    /// context (not the transport) decided the outcome.
    pending_reason: Option<ScError>,
    connect_timer: MsTimer,
    heartbeat: MsTimer,
    disconnect_timer: MsTimer,
}

impl Socket {
    fn new() -> Self {
        Socket {
            state: SocketState::Idle,
            id: None,
            peer_vmac: None,
            peer_uuid: None,
            pending_reason: None,
            connect_timer: MsTimer::new(),
            heartbeat: MsTimer::new(),
            disconnect_timer: MsTimer::new(),
        }
    }

    fn reset(&mut self) {
        *self = Socket::new();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxState {
    Initialized,
    Deinitializing,
    Deinitialized,
}

/// A bounded pool of WSS sockets under one set of credentials.
#[derive(Debug)]
pub struct SocketContext {
    cfg: CtxConfig,
    id: CtxId,
    state: CtxState,
    sockets: Vec<Socket>,
    next_message_id: u16,
}

impl SocketContext {
    /// Register with the transport and preallocate `n` socket slots.
    pub fn init(
        cfg: CtxConfig,
        n: usize,
        transport: &mut dyn Transport,
    ) -> Result<Self, ScError> {
        if n == 0 || cfg.tls.is_empty() {
            return Err(ScError::BadParam);
        }
        if cfg.role == ConnectionRole::Acceptor && cfg.listen_port.is_none() {
            return Err(ScError::BadParam);
        }

        let id = transport.register(TransportCtxParams {
            role: cfg.role,
            kind: cfg.kind,
            listen_port: cfg.listen_port,
            tls: cfg.tls.clone(),
            max_frame: cfg.max_bvlc_len as usize,
        })?;

        Ok(SocketContext {
            cfg,
            id,
            state: CtxState::Initialized,
            sockets: (0..n).map(|_| Socket::new()).collect(),
            next_message_id: 1,
        })
    }

    pub fn id(&self) -> CtxId {
        self.id
    }

    pub fn local_vmac(&self) -> Vmac {
        self.cfg.local_vmac
    }

    /// Begin closing every socket. The final `Deinitialized` event may be
    /// returned here (all slots already idle) or later, from the event
    /// that idles the last socket.
    pub fn deinit(&mut self, transport: &mut dyn Transport, now: Instant) -> Vec<SocketCtxEvent> {
        let mut out = Vec::new();
        if self.state != CtxState::Initialized {
            return out;
        }
        self.state = CtxState::Deinitializing;
        transport.unregister(self.id);
        for slot in 0..self.sockets.len() {
            if self.sockets[slot].state != SocketState::Idle {
                self.begin_close(slot, ScError::Closed, transport, now);
            }
        }
        self.check_deinitialized(&mut out);
        out
    }

    /// Start an outbound connection on a caller-chosen idle slot.
    pub fn connect(
        &mut self,
        slot: usize,
        url: &str,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), ScError> {
        if self.state != CtxState::Initialized || self.cfg.role != ConnectionRole::Initiator {
            return Err(ScError::InvalidOperation);
        }
        let sock = self.sockets.get_mut(slot).ok_or(ScError::BadParam)?;
        if sock.state != SocketState::Idle {
            return Err(ScError::InvalidOperation);
        }

        let id = transport.connect(self.id, url)?;
        sock.state = SocketState::Connecting;
        sock.id = Some(id);
        sock.connect_timer.set(now, self.cfg.connect_timeout);
        debug!("ctx {:?} slot {} connecting to {}", self.id, slot, url);
        Ok(())
    }

    /// Start an outbound connection on the first idle slot.
    pub fn connect_free(
        &mut self,
        url: &str,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<usize, ScError> {
        let slot = self
            .sockets
            .iter()
            .position(|s| s.state == SocketState::Idle)
            .ok_or(ScError::NoResources)?;
        self.connect(slot, url, transport, now)?;
        Ok(slot)
    }

    /// Queue a frame on an established socket.
    pub fn send(
        &mut self,
        slot: usize,
        frame: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), ScError> {
        let sock = self.sockets.get(slot).ok_or(ScError::BadParam)?;
        if sock.state != SocketState::Connected {
            return Err(ScError::InvalidOperation);
        }
        let id = sock.id.ok_or(ScError::InvalidOperation)?;
        transport.send(id, frame)
    }

    /// Begin a graceful disconnect of one socket.
    pub fn disconnect(&mut self, slot: usize, transport: &mut dyn Transport, now: Instant) {
        if slot < self.sockets.len() && self.sockets[slot].state != SocketState::Idle {
            self.begin_close(slot, ScError::Closed, transport, now);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sockets.iter().all(|s| s.state == SocketState::Idle)
    }

    pub fn peer_vmac(&self, slot: usize) -> Option<Vmac> {
        self.sockets.get(slot).and_then(|s| s.peer_vmac)
    }

    /// Established slots, for relay fan-out.
    pub fn connected_slots(&self) -> Vec<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SocketState::Connected)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn connected_slot_for_vmac(&self, vmac: &Vmac) -> Option<usize> {
        self.sockets
            .iter()
            .position(|s| s.state == SocketState::Connected && s.peer_vmac.as_ref() == Some(vmac))
    }

    pub fn connected_slot_for_uuid(&self, uuid: &DeviceUuid) -> Option<usize> {
        self.sockets
            .iter()
            .position(|s| s.state == SocketState::Connected && s.peer_uuid.as_ref() == Some(uuid))
    }

    /// Feed one transport event through the context state machine.
    pub fn on_transport_event(
        &mut self,
        ev: TransportEvent,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<SocketCtxEvent> {
        let mut out = Vec::new();
        match ev {
            TransportEvent::Connected { socket, .. } => {
                if let Some(slot) = self.slot_for(socket) {
                    self.on_link_up(slot, transport, now);
                }
            }
            TransportEvent::Accepted { socket, .. } => {
                self.on_accepted(socket, transport, now);
            }
            TransportEvent::Received { socket, frame, .. } => {
                if let Some(slot) = self.slot_for(socket) {
                    self.on_frame(slot, frame, transport, now, &mut out);
                }
            }
            TransportEvent::Disconnected { socket, reason, .. } => {
                if let Some(slot) = self.slot_for(socket) {
                    self.finish_disconnect(slot, reason, &mut out);
                }
            }
        }
        out
    }

    /// Run the per-socket timers; called on every run-loop tick.
    pub fn process_state(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<SocketCtxEvent> {
        let mut out = Vec::new();
        for slot in 0..self.sockets.len() {
            match self.sockets[slot].state {
                SocketState::Connecting => {
                    if self.sockets[slot].connect_timer.expired(now) {
                        debug!("ctx {:?} slot {} connect timed out", self.id, slot);
                        self.begin_close(slot, ScError::Timeout, transport, now);
                    }
                }
                SocketState::Connected => {
                    if self.sockets[slot].heartbeat.expired(now) {
                        match self.cfg.role {
                            ConnectionRole::Initiator => {
                                let msg = Message::heartbeat_request(self.take_message_id());
                                self.send_control(slot, &msg, transport);
                                self.sockets[slot].heartbeat.restart(now);
                            }
                            ConnectionRole::Acceptor => {
                                debug!(
                                    "ctx {:?} slot {} heartbeat lost, dropping peer",
                                    self.id, slot
                                );
                                self.begin_close(slot, ScError::Timeout, transport, now);
                            }
                        }
                    }
                }
                SocketState::Disconnecting => {
                    if self.sockets[slot].disconnect_timer.expired(now) {
                        // Transport never delivered the terminal event;
                        // release the slot anyway.
                        let reason = self.sockets[slot]
                            .pending_reason
                            .take()
                            .unwrap_or(ScError::Closed);
                        if let Some(id) = self.sockets[slot].id {
                            transport.close(id);
                        }
                        self.finish_disconnect(slot, reason, &mut out);
                    }
                }
                SocketState::Idle => {}
            }
        }
        out
    }

    fn take_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn slot_for(&self, id: SocketId) -> Option<usize> {
        self.sockets.iter().position(|s| s.id == Some(id))
    }

    /// Outbound TLS/WebSocket link established; assert our identity.
    fn on_link_up(&mut self, slot: usize, transport: &mut dyn Transport, _now: Instant) {
        if self.sockets[slot].state != SocketState::Connecting {
            return;
        }
        let msg = Message::connect_request(self.take_message_id(), self.cfg.connect_params());
        self.send_control(slot, &msg, transport);
    }

    /// Inbound connection; park it in a free slot awaiting its
    /// Connect-Request.
    fn on_accepted(&mut self, id: SocketId, transport: &mut dyn Transport, now: Instant) {
        let Some(slot) = self
            .sockets
            .iter()
            .position(|s| s.state == SocketState::Idle)
        else {
            warn!("ctx {:?} socket pool exhausted, rejecting peer", self.id);
            transport.close(id);
            return;
        };
        let sock = &mut self.sockets[slot];
        sock.state = SocketState::Connecting;
        sock.id = Some(id);
        sock.connect_timer.set(now, self.cfg.connect_timeout);
    }

    fn on_frame(
        &mut self,
        slot: usize,
        frame: Bytes,
        transport: &mut dyn Transport,
        now: Instant,
        out: &mut Vec<SocketCtxEvent>,
    ) {
        let decoded = match Message::decode(frame.clone()) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("ctx {:?} slot {} dropped undecodable frame: {}", self.id, slot, err);
                return;
            }
        };

        match self.sockets[slot].state {
            SocketState::Connecting => match self.cfg.role {
                ConnectionRole::Initiator => {
                    self.on_handshake_reply(slot, decoded, transport, now, out)
                }
                ConnectionRole::Acceptor => {
                    self.on_handshake_request(slot, decoded, transport, now, out)
                }
            },
            SocketState::Connected => {
                if self.cfg.role == ConnectionRole::Acceptor {
                    self.sockets[slot].heartbeat.restart(now);
                }
                match decoded.payload {
                    Payload::HeartbeatRequest => {
                        let ack = Message::heartbeat_ack(decoded.header.message_id);
                        self.send_control(slot, &ack, transport);
                    }
                    Payload::HeartbeatAck => {
                        trace!("ctx {:?} slot {} heartbeat ack", self.id, slot);
                    }
                    Payload::DisconnectRequest => {
                        let ack = Message::disconnect_ack(decoded.header.message_id);
                        self.send_control(slot, &ack, transport);
                        self.close_now(slot, ScError::Closed, transport, now);
                    }
                    Payload::ConnectRequest(_) | Payload::ConnectAccept(_) => {
                        trace!("ctx {:?} slot {} stray handshake frame dropped", self.id, slot);
                    }
                    _ => out.push(SocketCtxEvent::Received {
                        slot,
                        pdu: frame,
                        decoded,
                    }),
                }
            }
            SocketState::Disconnecting => {
                if matches!(decoded.payload, Payload::DisconnectAck) {
                    if let Some(id) = self.sockets[slot].id {
                        transport.close(id);
                    }
                }
            }
            SocketState::Idle => {}
        }
    }

    /// Initiator side: the acceptor either accepts or NAKs our identity.
    fn on_handshake_reply(
        &mut self,
        slot: usize,
        decoded: Message,
        transport: &mut dyn Transport,
        now: Instant,
        _out: &mut Vec<SocketCtxEvent>,
    ) {
        match decoded.payload {
            Payload::ConnectAccept(params) => {
                let sock = &mut self.sockets[slot];
                sock.state = SocketState::Connected;
                sock.peer_vmac = Some(params.vmac);
                sock.peer_uuid = Some(params.uuid);
                sock.connect_timer.stop();
                sock.heartbeat.set(now, self.cfg.heartbeat_timeout);
                debug!("ctx {:?} slot {} connected to {}", self.id, slot, params.vmac);
                _out.push(SocketCtxEvent::Connected { slot });
            }
            Payload::Result(r) if r.nak && r.function == BvlcFunction::ConnectRequest => {
                let reason = if r.error_code == ERROR_CODE_NODE_DUPLICATE_VMAC {
                    ScError::DuplicatedVmac
                } else {
                    ScError::Refused
                };
                debug!("ctx {:?} slot {} connect rejected: {:?}", self.id, slot, reason);
                self.close_now(slot, reason, transport, now);
            }
            other => {
                trace!("ctx {:?} slot {} ignoring pre-connect frame {:?}", self.id, slot, other);
            }
        }
    }

    /// Acceptor side: validate the peer identity and answer.
    fn on_handshake_request(
        &mut self,
        slot: usize,
        decoded: Message,
        transport: &mut dyn Transport,
        now: Instant,
        out: &mut Vec<SocketCtxEvent>,
    ) {
        let Payload::ConnectRequest(params) = decoded.payload else {
            trace!("ctx {:?} slot {} ignoring pre-connect frame", self.id, slot);
            return;
        };

        // A reconnecting device (same UUID) supersedes its old socket.
        if let Some(old) = self.connected_slot_for_uuid(&params.uuid) {
            debug!("ctx {:?} peer {} reconnected, dropping slot {}", self.id, params.vmac, old);
            self.close_now(old, ScError::Closed, transport, now);
        }

        if params.vmac == self.cfg.local_vmac {
            // Someone claims our own VMAC; reject them and let the owner
            // escalate.
            self.reject_connect(slot, decoded.header.message_id, transport);
            self.close_now(slot, ScError::DuplicatedVmac, transport, now);
            return;
        }

        if self.connected_slot_for_vmac(&params.vmac).is_some() {
            // VMAC collision between two different peers: the newer one
            // loses.
            self.reject_connect(slot, decoded.header.message_id, transport);
            self.close_now(slot, ScError::Refused, transport, now);
            return;
        }

        let accept = Message::connect_accept(decoded.header.message_id, self.cfg.connect_params());
        self.send_control(slot, &accept, transport);
        let sock = &mut self.sockets[slot];
        sock.state = SocketState::Connected;
        sock.peer_vmac = Some(params.vmac);
        sock.peer_uuid = Some(params.uuid);
        sock.connect_timer.stop();
        sock.heartbeat.set(now, 2 * self.cfg.heartbeat_timeout);
        debug!("ctx {:?} slot {} accepted peer {}", self.id, slot, params.vmac);
        out.push(SocketCtxEvent::Connected { slot });
    }

    fn reject_connect(&mut self, slot: usize, message_id: u16, transport: &mut dyn Transport) {
        let nak = Message::result_nak(
            message_id,
            None,
            BvlcFunction::ConnectRequest,
            None,
            ERROR_CLASS_COMMUNICATION,
            ERROR_CODE_NODE_DUPLICATE_VMAC,
            "VMAC address already in use",
        );
        self.send_control(slot, &nak, transport);
    }

    fn send_control(&mut self, slot: usize, msg: &Message, transport: &mut dyn Transport) {
        if let Some(id) = self.sockets[slot].id {
            if let Err(err) = transport.send(id, &msg.encode()) {
                warn!(
                    "ctx {:?} slot {} failed to send {:?}: {}",
                    self.id, slot, msg.header.function, err
                );
            }
        }
    }

    /// Graceful close: ask the peer to disconnect, fall back to a hard
    /// close on timeout.
    fn begin_close(
        &mut self,
        slot: usize,
        reason: ScError,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        if self.sockets[slot].state == SocketState::Connected {
            let msg = Message::disconnect_request(self.take_message_id());
            self.send_control(slot, &msg, transport);
            let sock = &mut self.sockets[slot];
            sock.state = SocketState::Disconnecting;
            sock.pending_reason = Some(reason);
            sock.disconnect_timer.set(now, self.cfg.disconnect_timeout);
        } else {
            self.close_now(slot, reason, transport, now);
        }
    }

    /// Hard close through the transport; the slot idles when the terminal
    /// `Disconnected` arrives.
    fn close_now(
        &mut self,
        slot: usize,
        reason: ScError,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        let sock = &mut self.sockets[slot];
        sock.pending_reason = Some(reason);
        sock.state = SocketState::Disconnecting;
        sock.disconnect_timer.set(now, self.cfg.disconnect_timeout);
        if let Some(id) = sock.id {
            transport.close(id);
        }
    }

    /// Terminal transition to `Idle`, surfacing the disconnect reason.
    fn finish_disconnect(&mut self, slot: usize, reason: ScError, out: &mut Vec<SocketCtxEvent>) {
        let sock = &mut self.sockets[slot];
        let reason = sock.pending_reason.take().unwrap_or(reason);
        sock.reset();
        out.push(SocketCtxEvent::Disconnected { slot, reason });
        self.check_deinitialized(out);
    }

    fn check_deinitialized(&mut self, out: &mut Vec<SocketCtxEvent>) {
        if self.state == CtxState::Deinitializing && self.is_idle() {
            self.state = CtxState::Deinitialized;
            out.push(SocketCtxEvent::Deinitialized);
        }
    }
}
