//! BACnet/SC Node Implementation
//!
//! The node supervisor composes the hub connector, the optional hub
//! function and the optional node switch, owns their lifecycle, and
//! dispatches every decoded BVLC-SC frame: control messages are answered
//! in place, encapsulated NPDUs surface to the application.
//!
//! Lifecycle: `Idle -> Starting -> Started`, `Stopping -> Idle` on
//! [`Node::stop`], and `Restarting` (stop everything, roll a fresh VMAC,
//! start again) whenever any sub-component reports a duplicated VMAC.
//! `Started` gates only on the hub function and node switch; the hub
//! connector counts as started the moment it is armed, so a node still
//! searching for its hub is fully operational for the application.

use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};

use super::bvlc::{
    Advertisement, BvlcFunction, HubConnectionStatus, Message, Payload,
    ERROR_CLASS_COMMUNICATION, ERROR_CODE_HEADER_NOT_UNDERSTOOD,
    ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED,
};
use super::hub_connector::{HubConnector, HubConnectorEvent};
use super::hub_function::{HubFunction, HubFunctionEvent};
use super::node_switch::{NodeSwitch, NodeSwitchEvent, SendOutcome};
use super::socket::{ConnectionRole, CtxConfig};
use super::timer::MsTimer;
use super::transport::{ConnectionKind, TlsMaterial, Transport};
use super::{
    DeviceUuid, ProcessState, ScError, Vmac, MAX_DIRECT_CONNECTIONS, MAX_URIS_PER_RESOLUTION,
    MAX_URI_SIZE_IN_ADDRESS_RESOLUTION_ACK, MAX_WSURL_LEN,
};

const ERROR_STR_OPTION_NOT_UNDERSTOOD: &str = "'must understand' option not understood";
const ERROR_STR_DIRECT_CONNECTIONS_NOT_SUPPORTED: &str = "direct connections are not supported";

/// Node supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Starting,
    Started,
    Restarting,
    Stopping,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Started,
    Restarted,
    Stopped,
    /// Raw NPDU payload of an Encapsulated-NPDU frame.
    Received { npdu: Bytes },
}

/// One learned mapping from a peer VMAC to its accepted direct-connection
/// URLs.
#[derive(Debug, Clone)]
pub struct AddressResolution {
    pub vmac: Vmac,
    pub urls: Vec<String>,
    fresh: MsTimer,
}

impl AddressResolution {
    /// An entry that never goes stale; for explicit connects and tests.
    /// Entries learned from the network carry the configured freshness
    /// TTL instead.
    pub fn with_urls(vmac: Vmac, urls: Vec<String>) -> Self {
        AddressResolution {
            vmac,
            urls,
            fresh: MsTimer::new(),
        }
    }

    fn refresh(&mut self, now: Instant, ttl: Duration) {
        self.fresh.set(now, ttl);
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        !self.fresh.expired(now)
    }
}

/// Immutable node configuration; validated by [`Node::init`].
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub tls: std::sync::Arc<TlsMaterial>,
    pub uuid: DeviceUuid,
    pub vmac: Vmac,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub address_resolution_timeout: Duration,
    pub address_resolution_freshness: Duration,
    pub primary_url: String,
    pub failover_url: String,
    /// Hub-function listen port; required when `hub_function_enabled`.
    pub hub_listen_port: Option<u16>,
    /// Direct-connection listen port; required when accepting directs.
    pub direct_listen_port: Option<u16>,
    pub hub_function_enabled: bool,
    pub node_switch_enabled: bool,
    pub direct_connect_initiate: bool,
    pub direct_connect_accept: bool,
    /// URIs advertised in Address-Resolution-ACK replies.
    pub accept_uris: Vec<String>,
}

impl NodeConfig {
    fn validate(&self) -> Result<(), ScError> {
        if self.tls.is_empty()
            || self.max_bvlc_len == 0
            || self.max_npdu_len == 0
            || self.connect_timeout.is_zero()
            || self.heartbeat_timeout.is_zero()
            || self.disconnect_timeout.is_zero()
            || self.reconnect_timeout.is_zero()
            || self.address_resolution_timeout.is_zero()
            || self.address_resolution_freshness.is_zero()
        {
            return Err(ScError::BadParam);
        }
        for url in [&self.primary_url, &self.failover_url] {
            if url.is_empty() || url.len() > MAX_WSURL_LEN {
                return Err(ScError::BadParam);
            }
            let parsed = url::Url::parse(url).map_err(|_| ScError::BadParam)?;
            if parsed.scheme() != "wss" {
                return Err(ScError::BadParam);
            }
        }
        if self.hub_function_enabled && self.hub_listen_port.is_none() {
            return Err(ScError::BadParam);
        }
        if self.node_switch_enabled {
            if !self.direct_connect_initiate && !self.direct_connect_accept {
                return Err(ScError::BadParam);
            }
            if self.direct_connect_accept && self.direct_listen_port.is_none() {
                return Err(ScError::BadParam);
            }
        }
        if self.accept_uris.iter().any(|u| u.len() > MAX_WSURL_LEN) {
            return Err(ScError::BadParam);
        }
        Ok(())
    }
}

/// The node supervisor.
pub struct Node {
    conf: NodeConfig,
    state: NodeState,
    /// Current VMAC; re-randomized on every restart.
    vmac: Vmac,
    hub_connector: Option<HubConnector>,
    hub_function: Option<HubFunction>,
    node_switch: Option<NodeSwitch>,
    resolution: Vec<AddressResolution>,
    transport: Box<dyn Transport>,
    next_message_id: u16,
    pending: Vec<NodeEvent>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("conf", &self.conf)
            .field("state", &self.state)
            .field("vmac", &self.vmac)
            .field("hub_connector", &self.hub_connector)
            .field("hub_function", &self.hub_function)
            .field("node_switch", &self.node_switch)
            .field("resolution", &self.resolution)
            .field("next_message_id", &self.next_message_id)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Node {
    /// Validate the configuration and bind the node to its transport.
    pub fn init(conf: NodeConfig, transport: Box<dyn Transport>) -> Result<Self, ScError> {
        conf.validate()?;
        Ok(Node {
            vmac: conf.vmac,
            conf,
            state: NodeState::Idle,
            hub_connector: None,
            hub_function: None,
            node_switch: None,
            resolution: Vec::new(),
            transport,
            next_message_id: 1,
            pending: Vec::new(),
        })
    }

    /// Release the node. Valid only from `Idle`; otherwise the node is
    /// handed back unchanged.
    pub fn deinit(self) -> Result<(), Self> {
        if self.state == NodeState::Idle {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn vmac(&self) -> Vmac {
        self.vmac
    }

    /// Arm every enabled sub-component. `Started` is reported through
    /// [`Node::poll`] once the hub function and node switch are up.
    pub fn start(&mut self, now: Instant) -> Result<(), ScError> {
        if self.state != NodeState::Idle {
            return Err(ScError::InvalidOperation);
        }
        self.start_state(false, now)
    }

    /// Begin the stop path; idempotent. Exactly one `Stopped` event
    /// follows once every sub-component has wound down.
    pub fn stop(&mut self, now: Instant) {
        if self.state == NodeState::Idle || self.state == NodeState::Stopping {
            return;
        }
        self.state = NodeState::Stopping;
        self.stop_components(now);
    }

    /// One run-loop tick: drain transport events, advance all timers and
    /// return the application events this produced.
    pub fn poll(&mut self, now: Instant) -> Vec<NodeEvent> {
        loop {
            let Some(ev) = self.transport.poll_event() else { break };
            self.route_transport_event(ev, now);
        }
        self.tick_components(now);
        self.process_start_gate(now);
        std::mem::take(&mut self.pending)
    }

    /// Send an encoded BVLC-SC frame. Routed over a direct connection
    /// when the node switch holds one for the destination, over the hub
    /// uplink otherwise.
    pub fn send(&mut self, pdu: &[u8], now: Instant) -> Result<(), ScError> {
        if self.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        self.route_send(pdu, now)
    }

    /// Look up the fresh resolution entry for `vmac`, if any.
    pub fn get_address_resolution(&self, vmac: &Vmac, now: Instant) -> Option<&AddressResolution> {
        if self.state != NodeState::Started {
            return None;
        }
        self.resolution
            .iter()
            .find(|r| r.vmac == *vmac && r.is_fresh(now))
    }

    /// Ask `dest` for its accepted direct-connection URLs.
    pub fn send_address_resolution(&mut self, dest: Vmac, now: Instant) -> Result<(), ScError> {
        if self.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        let msg = Message::address_resolution(self.take_message_id(), dest);
        self.route_send(&msg.encode(), now)
    }

    /// Open a direct connection to `dest` using an explicit URL list,
    /// bypassing address resolution.
    pub fn connect_direct(
        &mut self,
        dest: Vmac,
        urls: &[String],
        now: Instant,
    ) -> Result<(), ScError> {
        if self.state != NodeState::Started {
            return Err(ScError::InvalidOperation);
        }
        let t = self.transport.as_mut();
        match self.node_switch.as_mut() {
            Some(ns) => ns.connect(dest, urls, t, now),
            None => Err(ScError::InvalidOperation),
        }
    }

    /// Drop the direct connection to `dest`, if one exists.
    pub fn disconnect_direct(&mut self, dest: &Vmac, now: Instant) {
        let t = self.transport.as_mut();
        if let Some(ns) = self.node_switch.as_mut() {
            ns.disconnect(dest, t, now);
        }
    }

    fn take_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn ctx_cfg(
        &self,
        role: ConnectionRole,
        kind: ConnectionKind,
        listen_port: Option<u16>,
    ) -> CtxConfig {
        CtxConfig {
            role,
            kind,
            listen_port,
            tls: self.conf.tls.clone(),
            local_vmac: self.vmac,
            local_uuid: self.conf.uuid,
            max_bvlc_len: self.conf.max_bvlc_len,
            max_npdu_len: self.conf.max_npdu_len,
            connect_timeout: self.conf.connect_timeout,
            heartbeat_timeout: self.conf.heartbeat_timeout,
            disconnect_timeout: self.conf.disconnect_timeout,
        }
    }

    /// The shared start sequence of `start` and the restart path.
    fn start_state(&mut self, restarting: bool, now: Instant) -> Result<(), ScError> {
        self.state = if restarting {
            NodeState::Restarting
        } else {
            NodeState::Starting
        };
        self.hub_connector = None;
        self.hub_function = None;
        self.node_switch = None;

        if restarting {
            // Keep learned resolutions; only the collided identity
            // changes.
            let old = self.vmac;
            loop {
                self.vmac = Vmac::random();
                if self.vmac != old {
                    break;
                }
            }
            debug!("node: restarting with fresh VMAC {}", self.vmac);
        } else {
            self.resolution.clear();
        }

        let hub = HubConnector::start(
            self.ctx_cfg(ConnectionRole::Initiator, ConnectionKind::Hub, None),
            &self.conf.primary_url,
            &self.conf.failover_url,
            self.conf.reconnect_timeout,
            self.transport.as_mut(),
            now,
        );
        match hub {
            Ok(hc) => self.hub_connector = Some(hc),
            Err(err) => {
                self.state = NodeState::Idle;
                return Err(err);
            }
        }

        if self.conf.hub_function_enabled {
            let hf = HubFunction::start(
                self.ctx_cfg(
                    ConnectionRole::Acceptor,
                    ConnectionKind::Hub,
                    self.conf.hub_listen_port,
                ),
                self.transport.as_mut(),
            );
            match hf {
                Ok(hf) => self.hub_function = Some(hf),
                Err(err) => {
                    self.rollback_start(now);
                    return Err(err);
                }
            }
        }

        if self.conf.node_switch_enabled {
            let accept_cfg = self.conf.direct_connect_accept.then(|| {
                self.ctx_cfg(
                    ConnectionRole::Acceptor,
                    ConnectionKind::Direct,
                    self.conf.direct_listen_port,
                )
            });
            let initiate_cfg = self
                .conf
                .direct_connect_initiate
                .then(|| self.ctx_cfg(ConnectionRole::Initiator, ConnectionKind::Direct, None));
            let ns = NodeSwitch::start(
                accept_cfg,
                initiate_cfg,
                self.conf.address_resolution_timeout,
                self.transport.as_mut(),
                now,
            );
            match ns {
                Ok(ns) => self.node_switch = Some(ns),
                Err(err) => {
                    self.rollback_start(now);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Undo a partial start; the discarded stop events are fine because
    /// no component survives the rollback.
    fn rollback_start(&mut self, now: Instant) {
        let t = self.transport.as_mut();
        if let Some(hc) = self.hub_connector.as_mut() {
            hc.stop(t, now);
        }
        if let Some(hf) = self.hub_function.as_mut() {
            hf.stop(t, now);
        }
        if let Some(ns) = self.node_switch.as_mut() {
            ns.stop(t, now);
        }
        self.hub_connector = None;
        self.hub_function = None;
        self.node_switch = None;
        self.state = NodeState::Idle;
    }

    fn stop_components(&mut self, now: Instant) {
        let hc_events = {
            let t = self.transport.as_mut();
            self.hub_connector.as_mut().map(|hc| hc.stop(t, now))
        };
        if let Some(evs) = hc_events {
            self.drive_hub_connector(evs, now);
        }

        let hf_events = {
            let t = self.transport.as_mut();
            self.hub_function.as_mut().map(|hf| hf.stop(t, now))
        };
        if let Some(evs) = hf_events {
            self.drive_hub_function(evs, now);
        }

        let ns_events = {
            let t = self.transport.as_mut();
            self.node_switch.as_mut().map(|ns| ns.stop(t, now))
        };
        if let Some(evs) = ns_events {
            self.drive_node_switch(evs, now);
        }
    }

    fn restart_if_running(&mut self, now: Instant) {
        if self.state == NodeState::Stopping || self.state == NodeState::Restarting {
            return;
        }
        debug!("node: duplicated VMAC, restarting");
        self.state = NodeState::Restarting;
        self.stop_components(now);
    }

    fn route_transport_event(&mut self, ev: super::transport::TransportEvent, now: Instant) {
        let ctx = ev.ctx();

        if self.hub_connector.as_ref().is_some_and(|hc| hc.ctx_id() == ctx) {
            let evs = {
                let t = self.transport.as_mut();
                self.hub_connector
                    .as_mut()
                    .map(|hc| hc.on_transport_event(ev, t, now))
            };
            if let Some(evs) = evs {
                self.drive_hub_connector(evs, now);
            }
            return;
        }

        if self.hub_function.as_ref().is_some_and(|hf| hf.ctx_id() == ctx) {
            let evs = {
                let t = self.transport.as_mut();
                self.hub_function
                    .as_mut()
                    .map(|hf| hf.on_transport_event(ev, t, now))
            };
            if let Some(evs) = evs {
                self.drive_hub_function(evs, now);
            }
            return;
        }

        if self.node_switch.as_ref().is_some_and(|ns| ns.owns_ctx(ctx)) {
            let evs = {
                let t = self.transport.as_mut();
                self.node_switch
                    .as_mut()
                    .map(|ns| ns.on_transport_event(ev, t, now))
            };
            if let Some(evs) = evs {
                self.drive_node_switch(evs, now);
            }
            return;
        }

        trace!("node: event for unknown context {:?} dropped", ctx);
    }

    fn tick_components(&mut self, now: Instant) {
        let evs = {
            let t = self.transport.as_mut();
            self.hub_connector.as_mut().map(|hc| hc.process_state(t, now))
        };
        if let Some(evs) = evs {
            self.drive_hub_connector(evs, now);
        }

        let evs = {
            let t = self.transport.as_mut();
            self.hub_function.as_mut().map(|hf| hf.process_state(t, now))
        };
        if let Some(evs) = evs {
            self.drive_hub_function(evs, now);
        }

        let evs = {
            let t = self.transport.as_mut();
            self.node_switch.as_mut().map(|ns| ns.process_state(t, now))
        };
        if let Some(evs) = evs {
            self.drive_node_switch(evs, now);
        }
    }

    fn drive_hub_connector(&mut self, events: Vec<HubConnectorEvent>, now: Instant) {
        for ev in events {
            match ev {
                HubConnectorEvent::ConnectedPrimary => debug!("node: uplink on primary hub"),
                HubConnectorEvent::ConnectedFailover => debug!("node: uplink on failover hub"),
                HubConnectorEvent::Disconnected(ScError::DuplicatedVmac) => {
                    self.restart_if_running(now);
                }
                HubConnectorEvent::Disconnected(reason) => {
                    debug!("node: uplink lost ({}), reconnecting", reason);
                }
                HubConnectorEvent::Received { pdu, decoded } => {
                    self.dispatch_received(pdu, decoded, now);
                }
                HubConnectorEvent::Stopped(err) => {
                    if let Some(err) = err {
                        debug!("node: hub connector stopped with {}", err);
                    }
                    self.hub_connector = None;
                    self.process_stop_gate(now);
                }
            }
        }
    }

    fn drive_hub_function(&mut self, events: Vec<HubFunctionEvent>, now: Instant) {
        for ev in events {
            match ev {
                HubFunctionEvent::Started => self.process_start_gate(now),
                HubFunctionEvent::Stopped => {
                    self.hub_function = None;
                    self.process_stop_gate(now);
                }
                HubFunctionEvent::DuplicatedVmac => self.restart_if_running(now),
            }
        }
    }

    fn drive_node_switch(&mut self, events: Vec<NodeSwitchEvent>, now: Instant) {
        for ev in events {
            match ev {
                NodeSwitchEvent::Started => self.process_start_gate(now),
                NodeSwitchEvent::Stopped => {
                    self.node_switch = None;
                    self.process_stop_gate(now);
                }
                NodeSwitchEvent::DuplicatedVmac => self.restart_if_running(now),
                NodeSwitchEvent::Received { pdu, decoded } => {
                    self.dispatch_received(pdu, decoded, now);
                }
            }
        }
    }

    /// `Started`/`Restarted` gate: every enabled sub-component except the
    /// hub connector must have come up.
    fn process_start_gate(&mut self, _now: Instant) {
        if self.state != NodeState::Starting && self.state != NodeState::Restarting {
            return;
        }
        let hf_up = !self.conf.hub_function_enabled
            || self.hub_function.as_ref().is_some_and(|hf| hf.started());
        let ns_up = !self.conf.node_switch_enabled
            || self.node_switch.as_ref().is_some_and(|ns| ns.started());
        if !(hf_up && ns_up) {
            return;
        }
        let restarting = self.state == NodeState::Restarting;
        self.state = NodeState::Started;
        self.pending.push(if restarting {
            NodeEvent::Restarted
        } else {
            NodeEvent::Started
        });
    }

    /// `Stopped` gate: every sub-component handle must have been cleared
    /// by its `Stopped` event.
    fn process_stop_gate(&mut self, now: Instant) {
        let all_stopped = self.hub_connector.is_none()
            && self.hub_function.is_none()
            && self.node_switch.is_none();
        if !all_stopped {
            return;
        }
        match self.state {
            NodeState::Stopping => {
                self.state = NodeState::Idle;
                self.pending.push(NodeEvent::Stopped);
            }
            NodeState::Restarting => {
                if let Err(err) = self.start_state(true, now) {
                    warn!("node: restart failed: {}", err);
                    self.state = NodeState::Idle;
                    self.pending.push(NodeEvent::Stopped);
                }
            }
            _ => {}
        }
    }

    /// Route one encoded frame outward, honoring the node switch's
    /// uplink-fallback sentinel.
    fn route_send(&mut self, pdu: &[u8], now: Instant) -> Result<(), ScError> {
        let outcome = if self.node_switch.is_some() {
            let resolved = Message::peek_dest(pdu)
                .and_then(|dest| {
                    self.resolution
                        .iter()
                        .find(|r| r.vmac == dest && r.is_fresh(now))
                })
                .cloned();
            let t = self.transport.as_mut();
            match self.node_switch.as_mut() {
                Some(ns) => ns.send(pdu, resolved.as_ref(), t, now)?,
                None => SendOutcome::Uplink,
            }
        } else {
            SendOutcome::Uplink
        };

        match outcome {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Uplink => {
                let t = self.transport.as_mut();
                match self.hub_connector.as_mut() {
                    Some(hc) => hc.send(pdu, t),
                    None => Err(ScError::InvalidOperation),
                }
            }
        }
    }

    /// Send a synthesized control reply; transmission failures are
    /// logged and otherwise ignored.
    fn reply(&mut self, msg: Message, now: Instant) {
        let function = msg.header.function;
        if let Err(err) = self.route_send(&msg.encode(), now) {
            warn!("node: reply {:?} not sent: {}", function, err);
        }
    }

    /// Inbound BVLC-SC dispatch, shared by the hub connector and node
    /// switch receive paths.
    fn dispatch_received(&mut self, _pdu: Bytes, decoded: Message, now: Instant) {
        // An unknown must-understand destination option poisons the whole
        // frame.
        for i in 0..decoded.header.dest_options.len() {
            let opt = &decoded.header.dest_options[i];
            if opt.must_understand() && !opt.understood() {
                debug!("node: frame with unknown must-understand option dropped");
                if decoded.header.function != BvlcFunction::Result {
                    let nak = Message::result_nak(
                        decoded.header.message_id,
                        decoded.header.origin,
                        decoded.header.function,
                        Some(opt.marker),
                        ERROR_CLASS_COMMUNICATION,
                        ERROR_CODE_HEADER_NOT_UNDERSTOOD,
                        ERROR_STR_OPTION_NOT_UNDERSTOOD,
                    );
                    self.reply(nak, now);
                }
                return;
            }
        }

        match decoded.payload {
            Payload::Result(r) => {
                if r.nak && r.function == BvlcFunction::AddressResolution {
                    let Some(origin) = decoded.header.origin else {
                        trace!("node: resolution NAK without origin dropped");
                        return;
                    };
                    debug!("node: address resolution NAK from {}", origin);
                    let ttl = self.conf.address_resolution_freshness;
                    if let Some(entry) = self.locate_or_alloc_resolution(origin) {
                        entry.urls.clear();
                        entry.refresh(now, ttl);
                    }
                } else {
                    debug!(
                        "node: unexpected result for {:?} (nak: {}) dropped",
                        r.function, r.nak
                    );
                }
            }
            Payload::Advertisement(_) => {
                // Nothing consumes these yet.
            }
            Payload::AdvertisementSolicitation => {
                let adv = Advertisement {
                    hub_status: self
                        .hub_connector
                        .as_ref()
                        .map(|hc| hc.status())
                        .unwrap_or(HubConnectionStatus::NoConnection),
                    accept_direct: self.conf.node_switch_enabled,
                    max_bvlc_len: self.conf.max_bvlc_len,
                    max_npdu_len: self.conf.max_npdu_len,
                };
                let msg = Message::advertisement(self.take_message_id(), decoded.header.origin, adv);
                self.reply(msg, now);
            }
            Payload::AddressResolution => {
                if self.conf.node_switch_enabled {
                    let uris = self.conf.accept_uris.join(" ");
                    let ack = Message::address_resolution_ack(
                        decoded.header.message_id,
                        decoded.header.origin,
                        uris.as_bytes(),
                    );
                    self.reply(ack, now);
                } else {
                    let nak = Message::result_nak(
                        decoded.header.message_id,
                        decoded.header.origin,
                        BvlcFunction::AddressResolution,
                        None,
                        ERROR_CLASS_COMMUNICATION,
                        ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED,
                        ERROR_STR_DIRECT_CONNECTIONS_NOT_SUPPORTED,
                    );
                    self.reply(nak, now);
                }
            }
            Payload::AddressResolutionAck(ref uri_list) => {
                let Some(origin) = decoded.header.origin else {
                    trace!("node: resolution ACK without origin dropped");
                    return;
                };
                let urls = parse_uri_list(uri_list);
                let ttl = self.conf.address_resolution_freshness;
                let entry = match self.locate_or_alloc_resolution(origin) {
                    Some(entry) => {
                        entry.urls = urls;
                        entry.refresh(now, ttl);
                        entry.clone()
                    }
                    None => return,
                };
                let t = self.transport.as_mut();
                if let Some(ns) = self.node_switch.as_mut() {
                    ns.process_address_resolution(&entry, t, now);
                }
            }
            Payload::EncapsulatedNpdu(npdu) => {
                self.pending.push(NodeEvent::Received { npdu });
            }
            other => {
                trace!("node: unhandled frame {:?} dropped", other);
            }
        }
    }

    fn locate_or_alloc_resolution(&mut self, vmac: Vmac) -> Option<&mut AddressResolution> {
        if let Some(at) = self.resolution.iter().position(|r| r.vmac == vmac) {
            return self.resolution.get_mut(at);
        }
        if self.resolution.len() >= MAX_DIRECT_CONNECTIONS {
            warn!("node: resolution table full, entry for {} dropped", vmac);
            return None;
        }
        self.resolution.push(AddressResolution::with_urls(vmac, Vec::new()));
        self.resolution.last_mut()
    }
}

/// Split an Address-Resolution-ACK payload on the space byte (0x20),
/// skipping empty tokens, over-long URIs and anything that is not UTF-8.
fn parse_uri_list(payload: &[u8]) -> Vec<String> {
    let mut urls = Vec::new();
    for token in payload.split(|&b| b == 0x20) {
        if token.is_empty() || token.len() > MAX_URI_SIZE_IN_ADDRESS_RESOLUTION_ACK {
            continue;
        }
        let Ok(url) = std::str::from_utf8(token) else {
            continue;
        };
        urls.push(url.to_string());
        if urls.len() == MAX_URIS_PER_RESOLUTION {
            break;
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bsc::bvlc::HeaderOption;
    use crate::datalink::bsc::testkit::{
        accept_frame, tls_material, MockTransport, LOCAL_UUID, LOCAL_VMAC,
    };
    use crate::datalink::bsc::transport::{CtxId, SocketId};

    const PEER: Vmac = Vmac([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

    fn conf() -> NodeConfig {
        NodeConfig {
            tls: tls_material(),
            uuid: LOCAL_UUID,
            vmac: LOCAL_VMAC,
            max_bvlc_len: 1600,
            max_npdu_len: 1497,
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            disconnect_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(5),
            address_resolution_timeout: Duration::from_secs(10),
            address_resolution_freshness: Duration::from_secs(300),
            primary_url: "wss://h1:9999".to_string(),
            failover_url: "wss://h2:9999".to_string(),
            hub_listen_port: None,
            direct_listen_port: None,
            hub_function_enabled: false,
            node_switch_enabled: false,
            direct_connect_initiate: false,
            direct_connect_accept: false,
            accept_uris: Vec::new(),
        }
    }

    fn switch_conf() -> NodeConfig {
        NodeConfig {
            node_switch_enabled: true,
            direct_connect_accept: true,
            direct_listen_port: Some(47443),
            accept_uris: vec!["wss://me:9999/a".to_string(), "wss://me:9999/b".to_string()],
            ..conf()
        }
    }

    fn initiate_conf() -> NodeConfig {
        NodeConfig {
            node_switch_enabled: true,
            direct_connect_initiate: true,
            ..conf()
        }
    }

    /// Start the node and establish its hub uplink; returns the uplink's
    /// (ctx, socket).
    fn start_with_uplink(
        node: &mut Node,
        t: &MockTransport,
        now: Instant,
    ) -> (CtxId, SocketId) {
        node.start(now).unwrap();
        let (ctx, _, sid) = t.connects()[0].clone();
        t.push_connected(ctx, sid);
        t.push_received(ctx, sid, accept_frame(Vmac([0xBB; 6])));
        let evs = node.poll(now);
        assert!(matches!(evs[..], [NodeEvent::Started]));
        assert_eq!(node.state(), NodeState::Started);
        (ctx, sid)
    }

    fn inject(t: &MockTransport, ctx: CtxId, sid: SocketId, msg: &Message) {
        t.push_received(ctx, sid, msg.encode().freeze());
    }

    #[test]
    fn init_validates_config() {
        let t = MockTransport::new();
        let mut bad = conf();
        bad.primary_url = String::new();
        assert!(matches!(
            Node::init(bad, Box::new(t.clone())),
            Err(ScError::BadParam)
        ));

        // Hub URLs must be wss://.
        let mut bad = conf();
        bad.primary_url = "ws://h1:9999".to_string();
        assert!(matches!(
            Node::init(bad, Box::new(t.clone())),
            Err(ScError::BadParam)
        ));

        let mut bad = conf();
        bad.reconnect_timeout = Duration::ZERO;
        assert!(matches!(
            Node::init(bad, Box::new(t.clone())),
            Err(ScError::BadParam)
        ));

        let mut bad = conf();
        bad.node_switch_enabled = true;
        assert!(matches!(
            Node::init(bad, Box::new(t.clone())),
            Err(ScError::BadParam)
        ));

        let mut bad = conf();
        bad.hub_function_enabled = true;
        assert!(matches!(Node::init(bad, Box::new(t)), Err(ScError::BadParam)));
    }

    #[test]
    fn happy_path_reports_started_once() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        start_with_uplink(&mut node, &t, now);
        assert!(node.poll(now).is_empty());
        // A hub-only node registers exactly its uplink context.
        assert_eq!(t.registered_roles(), vec![ConnectionRole::Initiator]);
    }

    #[test]
    fn start_fails_cleanly_on_transport_error() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();

        t.fail_connects(true);
        assert_eq!(node.start(now).unwrap_err(), ScError::Transport);
        assert_eq!(node.state(), NodeState::Idle);

        // The failure leaves the node restartable.
        t.fail_connects(false);
        node.start(now).unwrap();
    }

    #[test]
    fn double_start_is_invalid() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        node.start(now).unwrap();
        assert_eq!(node.start(now).unwrap_err(), ScError::InvalidOperation);
    }

    #[test]
    fn send_requires_started() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        assert_eq!(
            node.send(b"pdu", now).unwrap_err(),
            ScError::InvalidOperation
        );
        assert!(t.raw_sends().is_empty());
    }

    #[test]
    fn send_routes_over_uplink() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        let (_, sid) = start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        let frame = Message::encapsulated_npdu(9, Some(PEER), Bytes::from_static(&[1, 2]))
            .encode()
            .to_vec();
        node.send(&frame, now).unwrap();
        let sends = t.raw_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, sid);
    }

    #[test]
    fn stop_yields_single_stopped_and_idle() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        start_with_uplink(&mut node, &t, now);

        node.stop(now);
        // Graceful close of the uplink needs the disconnect timeout to
        // run out (the mock peer never ACKs).
        let later = now + Duration::from_secs(11);
        let evs = node.poll(later);
        assert!(matches!(evs[..], [NodeEvent::Stopped]));
        assert_eq!(node.state(), NodeState::Idle);

        // Idempotent: a second stop produces nothing further.
        node.stop(later);
        assert!(node.poll(later).is_empty());

        node.deinit().unwrap();
    }

    #[test]
    fn duplicated_vmac_restarts_with_fresh_vmac() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);
        let old_vmac = node.vmac();

        t.push_disconnected(ctx, sid, ScError::DuplicatedVmac);
        let evs = node.poll(now);
        assert!(matches!(evs[..], [NodeEvent::Restarted]));
        assert_eq!(node.state(), NodeState::Started);
        assert_ne!(node.vmac(), old_vmac);

        // The restarted hub connector is dialing the primary again.
        assert_eq!(t.connects().len(), 2);
        assert_eq!(t.connects()[1].1, "wss://h1:9999");
    }

    #[test]
    fn encapsulated_npdu_surfaces_to_application() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);

        let mut msg =
            Message::encapsulated_npdu(7, Some(LOCAL_VMAC), Bytes::from_static(&[0xDE, 0xAD]));
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);

        let evs = node.poll(now);
        match &evs[..] {
            [NodeEvent::Received { npdu }] => assert_eq!(&npdu[..], &[0xDE, 0xAD]),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn must_understand_option_naks_and_drops() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        let mut msg =
            Message::encapsulated_npdu(7, Some(LOCAL_VMAC), Bytes::from_static(&[0x01]));
        msg.header.origin = Some(PEER);
        // Unknown option type 0x1E with must-understand set.
        msg.header.dest_options.push(HeaderOption {
            marker: 0x40 | 0x1E,
            data: None,
        });
        inject(&t, ctx, sid, &msg);

        let evs = node.poll(now);
        assert!(evs.is_empty());

        let sent = t.sent_messages();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            Payload::Result(r) => {
                assert!(r.nak);
                assert_eq!(r.function, BvlcFunction::EncapsulatedNpdu);
                assert_eq!(r.error_class, ERROR_CLASS_COMMUNICATION);
                assert_eq!(r.error_code, ERROR_CODE_HEADER_NOT_UNDERSTOOD);
                assert_eq!(r.error_header_marker, Some(0x40 | 0x1E));
            }
            other => panic!("expected NAK, got {other:?}"),
        }
        assert_eq!(sent[0].header.dest, Some(PEER));
    }

    #[test]
    fn address_resolution_acked_with_accept_uris() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(switch_conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        let mut msg = Message::address_resolution(3, LOCAL_VMAC);
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);
        node.poll(now);

        let sent = t.sent_messages();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            Payload::AddressResolutionAck(uris) => {
                assert_eq!(&uris[..], b"wss://me:9999/a wss://me:9999/b");
            }
            other => panic!("expected ACK, got {other:?}"),
        }
        assert_eq!(sent[0].header.dest, Some(PEER));
        assert_eq!(sent[0].header.message_id, 3);
    }

    #[test]
    fn address_resolution_nakked_without_node_switch() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        let mut msg = Message::address_resolution(3, LOCAL_VMAC);
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);
        node.poll(now);

        let sent = t.sent_messages();
        match &sent[0].payload {
            Payload::Result(r) => {
                assert!(r.nak);
                assert_eq!(
                    r.error_code,
                    ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED
                );
            }
            other => panic!("expected NAK, got {other:?}"),
        }
    }

    #[test]
    fn advertisement_solicitation_answered() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(switch_conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        let mut msg = Message {
            header: crate::datalink::bsc::bvlc::Header::new(
                BvlcFunction::AdvertisementSolicitation,
                11,
            ),
            payload: Payload::AdvertisementSolicitation,
        };
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);
        node.poll(now);

        let sent = t.sent_messages();
        match &sent[0].payload {
            Payload::Advertisement(adv) => {
                assert_eq!(adv.hub_status, HubConnectionStatus::ConnectedToPrimary);
                assert!(adv.accept_direct);
                assert_eq!(adv.max_bvlc_len, 1600);
                assert_eq!(adv.max_npdu_len, 1497);
            }
            other => panic!("expected advertisement, got {other:?}"),
        }
    }

    #[test]
    fn resolution_ack_parsed_and_stored() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(switch_conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);

        // Double space and an over-long URI must both be skipped.
        let long = format!("wss://{}", "x".repeat(MAX_URI_SIZE_IN_ADDRESS_RESOLUTION_ACK));
        let list = format!("wss://p:4443/a  wss://p:4443/b {long}");
        let mut msg = Message::address_resolution_ack(5, Some(LOCAL_VMAC), list.as_bytes());
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);
        node.poll(now);

        let entry = node.get_address_resolution(&PEER, now).unwrap();
        assert_eq!(entry.urls, vec!["wss://p:4443/a", "wss://p:4443/b"]);

        // The entry goes stale after the freshness TTL.
        let stale = now + Duration::from_secs(301);
        assert!(node.get_address_resolution(&PEER, stale).is_none());
    }

    #[test]
    fn resolution_nak_invalidates_urls() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(switch_conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);

        let mut ack = Message::address_resolution_ack(5, Some(LOCAL_VMAC), b"wss://p:4443/a");
        ack.header.origin = Some(PEER);
        inject(&t, ctx, sid, &ack);
        node.poll(now);
        assert_eq!(node.get_address_resolution(&PEER, now).unwrap().urls.len(), 1);

        let mut nak = Message::result_nak(
            6,
            Some(LOCAL_VMAC),
            BvlcFunction::AddressResolution,
            None,
            ERROR_CLASS_COMMUNICATION,
            ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED,
            "",
        );
        nak.header.origin = Some(PEER);
        inject(&t, ctx, sid, &nak);
        node.poll(now);

        let entry = node.get_address_resolution(&PEER, now).unwrap();
        assert!(entry.urls.is_empty());
    }

    #[test]
    fn resolution_ack_triggers_direct_dial() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(initiate_conf(), Box::new(t.clone())).unwrap();
        let (ctx, sid) = start_with_uplink(&mut node, &t, now);

        let mut msg =
            Message::address_resolution_ack(5, Some(LOCAL_VMAC), b"wss://p:4443/direct");
        msg.header.origin = Some(PEER);
        inject(&t, ctx, sid, &msg);
        node.poll(now);

        let connects = t.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].1, "wss://p:4443/direct");
    }

    #[test]
    fn connect_direct_dials_explicit_urls() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(initiate_conf(), Box::new(t.clone())).unwrap();
        start_with_uplink(&mut node, &t, now);

        node.connect_direct(PEER, &["wss://p:4443/x".to_string()], now)
            .unwrap();
        assert_eq!(t.connects()[1].1, "wss://p:4443/x");

        // Disconnecting an unknown peer is a harmless no-op.
        node.disconnect_direct(&Vmac([0x77; 6]), now);
    }

    #[test]
    fn send_address_resolution_goes_out() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        start_with_uplink(&mut node, &t, now);
        t.clear_sends();

        node.send_address_resolution(PEER, now).unwrap();
        let sent = t.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.function, BvlcFunction::AddressResolution);
        assert_eq!(sent[0].header.dest, Some(PEER));
    }

    #[test]
    fn uri_list_parser_skips_bad_tokens() {
        assert_eq!(
            parse_uri_list(b"wss://a wss://b"),
            vec!["wss://a".to_string(), "wss://b".to_string()]
        );
        assert_eq!(parse_uri_list(b"   "), Vec::<String>::new());
        let long = "x".repeat(MAX_URI_SIZE_IN_ADDRESS_RESOLUTION_ACK + 1);
        assert_eq!(
            parse_uri_list(format!("{long} wss://ok").as_bytes()),
            vec!["wss://ok".to_string()]
        );
    }

    #[test]
    fn deinit_refused_while_running() {
        let now = Instant::now();
        let t = MockTransport::new();
        let mut node = Node::init(conf(), Box::new(t.clone())).unwrap();
        node.start(now).unwrap();
        node = match node.deinit() {
            Err(node) => node,
            Ok(()) => panic!("deinit must fail while started"),
        };
        node.stop(now);
        let later = now + Duration::from_secs(11);
        node.poll(later);
        node.deinit().unwrap();
    }
}
