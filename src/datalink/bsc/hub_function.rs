//! Hub function: the optional inbound relay.
//!
//! Accepts WSS connections from other nodes and relays BVLC-SC frames
//! between them, keyed by the VMAC each peer advertised in its connect
//! handshake. Frames to the broadcast VMAC fan out to every other peer;
//! frames to an unknown VMAC are dropped. A peer colliding with an
//! already-connected peer's VMAC is rejected by the socket layer; a peer
//! claiming the hub's own VMAC is fatal and escalates to the supervisor.

use std::time::Instant;

use log::{debug, trace, warn};

use super::socket::{CtxConfig, SocketContext, SocketCtxEvent};
use super::transport::{CtxId, Transport, TransportEvent};
use super::{ProcessState, ScError, HUB_FUNCTION_CONNECTIONS};

/// Events the hub function reports to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubFunctionEvent {
    Started,
    Stopped,
    /// A peer asserted the hub's own VMAC; the supervisor must restart
    /// with a fresh one.
    DuplicatedVmac,
}

/// Inbound relay for hub-capable nodes.
#[derive(Debug)]
pub struct HubFunction {
    ctx: SocketContext,
    started: bool,
    stopped: bool,
    pending: Vec<HubFunctionEvent>,
}

impl HubFunction {
    /// Start accepting on the configured hub port.
    pub fn start(cfg: CtxConfig, transport: &mut dyn Transport) -> Result<Self, ScError> {
        let ctx = SocketContext::init(cfg, HUB_FUNCTION_CONNECTIONS, transport)?;
        Ok(HubFunction {
            ctx,
            started: true,
            stopped: false,
            // The accept loop is armed as soon as the listener is
            // registered.
            pending: vec![HubFunctionEvent::Started],
        })
    }

    pub fn ctx_id(&self) -> CtxId {
        self.ctx.id()
    }

    pub fn started(&self) -> bool {
        self.started && !self.stopped
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Begin the stop path; `Stopped` is reported once every peer socket
    /// has closed.
    pub fn stop(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubFunctionEvent> {
        let ctx_events = self.ctx.deinit(transport, now);
        self.handle_ctx_events(ctx_events, transport)
    }

    pub fn on_transport_event(
        &mut self,
        ev: TransportEvent,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubFunctionEvent> {
        let ctx_events = self.ctx.on_transport_event(ev, transport, now);
        self.handle_ctx_events(ctx_events, transport)
    }

    fn handle_ctx_events(
        &mut self,
        ctx_events: Vec<SocketCtxEvent>,
        transport: &mut dyn Transport,
    ) -> Vec<HubFunctionEvent> {
        let mut out = std::mem::take(&mut self.pending);
        for ev in ctx_events {
            match ev {
                SocketCtxEvent::Connected { slot } => {
                    debug!(
                        "hub function: peer {} connected on slot {}",
                        self.ctx.peer_vmac(slot).map(|v| v.to_string()).unwrap_or_default(),
                        slot
                    );
                }
                SocketCtxEvent::Disconnected { slot, reason } => {
                    if reason == ScError::DuplicatedVmac {
                        warn!("hub function: peer claimed our VMAC");
                        out.push(HubFunctionEvent::DuplicatedVmac);
                    } else {
                        trace!("hub function: slot {} closed: {}", slot, reason);
                    }
                }
                SocketCtxEvent::Received { slot, pdu, decoded } => {
                    self.relay(slot, &pdu, &decoded, transport);
                }
                SocketCtxEvent::Deinitialized => {
                    self.stopped = true;
                    out.push(HubFunctionEvent::Stopped);
                }
            }
        }
        out
    }

    /// Forward one frame to the peer(s) its destination VMAC names.
    fn relay(
        &mut self,
        origin_slot: usize,
        pdu: &[u8],
        decoded: &super::bvlc::Message,
        transport: &mut dyn Transport,
    ) {
        let Some(dest) = decoded.header.dest else {
            trace!("hub function: frame without destination dropped");
            return;
        };

        if dest.is_broadcast() {
            for slot in self.ctx.connected_slots() {
                if slot == origin_slot {
                    continue;
                }
                if let Err(err) = self.ctx.send(slot, pdu, transport) {
                    warn!("hub function: broadcast relay to slot {} failed: {}", slot, err);
                }
            }
            return;
        }

        if dest == self.ctx.local_vmac() {
            // The hub's own node hears about itself over its uplink.
            trace!("hub function: frame addressed to the hub dropped");
            return;
        }

        match self.ctx.connected_slot_for_vmac(&dest) {
            Some(slot) => {
                if let Err(err) = self.ctx.send(slot, pdu, transport) {
                    warn!("hub function: relay to {} failed: {}", dest, err);
                }
            }
            None => debug!("hub function: no peer for {}, frame dropped", dest),
        }
    }
}

impl ProcessState for HubFunction {
    type Event = HubFunctionEvent;

    fn process_state(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubFunctionEvent> {
        let ctx_events = self.ctx.process_state(transport, now);
        self.handle_ctx_events(ctx_events, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bsc::bvlc::Message;
    use crate::datalink::bsc::socket::ConnectionRole;
    use crate::datalink::bsc::testkit::{ctx_cfg, request_frame, MockTransport, LOCAL_VMAC};
    use crate::datalink::bsc::transport::{ConnectionKind, SocketId};
    use crate::datalink::bsc::Vmac;
    use bytes::Bytes;

    fn start(t: &mut MockTransport) -> HubFunction {
        HubFunction::start(ctx_cfg(ConnectionRole::Acceptor, ConnectionKind::Hub), t).unwrap()
    }

    fn join_peer(
        hf: &mut HubFunction,
        t: &mut MockTransport,
        vmac: Vmac,
        now: Instant,
    ) -> SocketId {
        let sid = t.accepted_socket(hf.ctx_id());
        hf.on_transport_event(
            TransportEvent::Accepted { ctx: hf.ctx_id(), socket: sid },
            t,
            now,
        );
        hf.on_transport_event(
            TransportEvent::Received {
                ctx: hf.ctx_id(),
                socket: sid,
                frame: request_frame(vmac),
            },
            t,
            now,
        );
        sid
    }

    fn npdu_to(dest: Vmac, origin: Vmac) -> Bytes {
        let mut msg = Message::encapsulated_npdu(1, Some(dest), Bytes::from_static(&[0x01]));
        msg.header.origin = Some(origin);
        msg.encode().freeze()
    }

    #[test]
    fn reports_started_on_first_drain() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        let evs = hf.process_state(&mut t, now);
        assert!(matches!(evs[..], [HubFunctionEvent::Started]));
        assert!(hf.started());
    }

    #[test]
    fn relays_to_destination_peer() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        let a = Vmac([0x0A; 6]);
        let b = Vmac([0x0B; 6]);
        let sid_a = join_peer(&mut hf, &mut t, a, now);
        let sid_b = join_peer(&mut hf, &mut t, b, now);
        t.clear_sends();

        let frame = npdu_to(b, a);
        hf.on_transport_event(
            TransportEvent::Received {
                ctx: hf.ctx_id(),
                socket: sid_a,
                frame: frame.clone(),
            },
            &mut t,
            now,
        );

        let sends = t.raw_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, sid_b);
        assert_eq!(sends[0].1, frame.to_vec());
    }

    #[test]
    fn broadcast_fans_out_to_all_but_origin() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        let a = Vmac([0x0A; 6]);
        let b = Vmac([0x0B; 6]);
        let c = Vmac([0x0C; 6]);
        let sid_a = join_peer(&mut hf, &mut t, a, now);
        let sid_b = join_peer(&mut hf, &mut t, b, now);
        let sid_c = join_peer(&mut hf, &mut t, c, now);
        t.clear_sends();

        hf.on_transport_event(
            TransportEvent::Received {
                ctx: hf.ctx_id(),
                socket: sid_a,
                frame: npdu_to(Vmac::BROADCAST, a),
            },
            &mut t,
            now,
        );

        let targets: Vec<SocketId> = t.raw_sends().iter().map(|(sid, _)| *sid).collect();
        assert_eq!(targets, vec![sid_b, sid_c]);
    }

    #[test]
    fn unknown_destination_is_dropped() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        let a = Vmac([0x0A; 6]);
        let sid_a = join_peer(&mut hf, &mut t, a, now);
        t.clear_sends();

        hf.on_transport_event(
            TransportEvent::Received {
                ctx: hf.ctx_id(),
                socket: sid_a,
                frame: npdu_to(Vmac([0xEE; 6]), a),
            },
            &mut t,
            now,
        );
        assert!(t.raw_sends().is_empty());
    }

    #[test]
    fn peer_claiming_hub_vmac_escalates() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        hf.process_state(&mut t, now);

        let sid = t.accepted_socket(hf.ctx_id());
        hf.on_transport_event(
            TransportEvent::Accepted { ctx: hf.ctx_id(), socket: sid },
            &mut t,
            now,
        );
        hf.on_transport_event(
            TransportEvent::Received {
                ctx: hf.ctx_id(),
                socket: sid,
                frame: request_frame(LOCAL_VMAC),
            },
            &mut t,
            now,
        );
        // The socket layer NAKed and closed; the terminal disconnect
        // carries the fatal reason.
        let ev = t.take_event().unwrap();
        let evs = hf.on_transport_event(ev, &mut t, now);
        assert!(matches!(evs[..], [HubFunctionEvent::DuplicatedVmac]));
    }

    #[test]
    fn stop_reports_stopped_once_peers_close() {
        let now = Instant::now();
        let mut t = MockTransport::new();
        let mut hf = start(&mut t);
        hf.process_state(&mut t, now);
        join_peer(&mut hf, &mut t, Vmac([0x0A; 6]), now);

        let evs = hf.stop(&mut t, now);
        assert!(evs.is_empty());

        let later = now + std::time::Duration::from_secs(11);
        let evs = hf.process_state(&mut t, later);
        assert!(matches!(evs[..], [HubFunctionEvent::Stopped]));
        assert!(hf.stopped());
    }
}
