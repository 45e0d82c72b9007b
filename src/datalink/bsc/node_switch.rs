//! Node switch: direct (peer-to-peer) connections.
//!
//! Keeps a table of live direct connections indexed by peer VMAC, split
//! across an acceptor context (inbound, when accepting is enabled) and an
//! initiator context (outbound, when initiating is enabled). Outbound
//! PDUs for a peer with a live direct connection go straight to that
//! socket; everything else falls back to the hub uplink via the
//! [`SendOutcome::Uplink`] sentinel. Address-resolution results injected
//! by the supervisor start outbound connection attempts, walking the
//! peer's URL list until one succeeds.

use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};

use super::bvlc::Message;
use super::node::AddressResolution;
use super::socket::{CtxConfig, SocketContext, SocketCtxEvent};
use super::timer::MsTimer;
use super::transport::{CtxId, Transport, TransportEvent};
use super::{ProcessState, ScError, Vmac, MAX_DIRECT_CONNECTIONS};

/// Events the node switch reports to its owner.
#[derive(Debug, Clone)]
pub enum NodeSwitchEvent {
    Started,
    Stopped,
    /// A peer asserted our VMAC; the supervisor must restart with a fresh
    /// one.
    DuplicatedVmac,
    /// An inbound frame from a direct peer, handed up for dispatch.
    Received { pdu: Bytes, decoded: Message },
}

/// Outcome of [`NodeSwitch::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The PDU left on a direct connection.
    Sent,
    /// No direct route; the caller must forward via the hub uplink.
    Uplink,
}

/// One outbound connect attempt, walking a resolved URL list.
#[derive(Debug)]
struct ConnectAttempt {
    vmac: Vmac,
    urls: Vec<String>,
    next_url: usize,
    slot: Option<usize>,
    /// Bounds the whole attempt; an unreachable peer stays reachable via
    /// the hub.
    deadline: MsTimer,
}

/// Direct-connection manager.
#[derive(Debug)]
pub struct NodeSwitch {
    acceptor: Option<SocketContext>,
    initiator: Option<SocketContext>,
    initiate_enabled: bool,
    attempt_timeout: Duration,
    attempts: Vec<ConnectAttempt>,
    stopped: bool,
    deinits_pending: usize,
    pending: Vec<NodeSwitchEvent>,
}

impl NodeSwitch {
    /// Start the enabled direct-connection roles. At least one of
    /// `accept_cfg` / `initiate` must be requested.
    pub fn start(
        accept_cfg: Option<CtxConfig>,
        initiate_cfg: Option<CtxConfig>,
        attempt_timeout: Duration,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<Self, ScError> {
        if accept_cfg.is_none() && initiate_cfg.is_none() {
            return Err(ScError::BadParam);
        }

        let acceptor = match accept_cfg {
            Some(cfg) => Some(SocketContext::init(cfg, MAX_DIRECT_CONNECTIONS, transport)?),
            None => None,
        };
        let initiator = match initiate_cfg {
            Some(cfg) => match SocketContext::init(cfg, MAX_DIRECT_CONNECTIONS, transport) {
                Ok(ctx) => Some(ctx),
                Err(err) => {
                    // Roll the acceptor's registration back before
                    // reporting the failure.
                    if let Some(mut ctx) = acceptor {
                        ctx.deinit(transport, now);
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(NodeSwitch {
            initiate_enabled: initiator.is_some(),
            acceptor,
            initiator,
            attempt_timeout,
            attempts: Vec::new(),
            stopped: false,
            deinits_pending: 0,
            pending: vec![NodeSwitchEvent::Started],
        })
    }

    pub fn ctx_ids(&self) -> Vec<CtxId> {
        self.acceptor
            .iter()
            .chain(self.initiator.iter())
            .map(|ctx| ctx.id())
            .collect()
    }

    pub fn owns_ctx(&self, ctx: CtxId) -> bool {
        self.ctx_ids().contains(&ctx)
    }

    pub fn started(&self) -> bool {
        !self.stopped
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Begin the stop path for every enabled context.
    pub fn stop(&mut self, transport: &mut dyn Transport, now: Instant) -> Vec<NodeSwitchEvent> {
        self.attempts.clear();
        self.deinits_pending = 0;
        let mut ctx_events = Vec::new();
        if let Some(ctx) = self.acceptor.as_mut() {
            self.deinits_pending += 1;
            ctx_events.extend(ctx.deinit(transport, now));
        }
        if let Some(ctx) = self.initiator.as_mut() {
            self.deinits_pending += 1;
            ctx_events.extend(ctx.deinit(transport, now));
        }
        self.handle_ctx_events(ctx_events, transport, now)
    }

    /// Route one outbound PDU. `resolution` is the supervisor's fresh
    /// resolution entry for the PDU's destination, when one exists.
    pub fn send(
        &mut self,
        pdu: &[u8],
        resolution: Option<&AddressResolution>,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<SendOutcome, ScError> {
        let Some(dest) = Message::peek_dest(pdu) else {
            return Ok(SendOutcome::Uplink);
        };
        if dest.is_broadcast() {
            return Ok(SendOutcome::Uplink);
        }

        if let Some((route, slot)) = self.direct_route(&dest) {
            if let Some(ctx) = self.route_ctx(route) {
                ctx.send(slot, pdu, transport)?;
                return Ok(SendOutcome::Sent);
            }
        }

        // No live direct connection. Start warming one up when we may
        // initiate and the peer's URLs are known; the PDU itself still
        // travels over the hub.
        if self.initiate_enabled {
            if let Some(r) = resolution {
                self.begin_attempt(dest, r.urls.clone(), transport, now);
            }
        }
        Ok(SendOutcome::Uplink)
    }

    /// Explicitly open a direct connection to `vmac` using the given URL
    /// list.
    pub fn connect(
        &mut self,
        vmac: Vmac,
        urls: &[String],
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), ScError> {
        if !self.initiate_enabled {
            return Err(ScError::InvalidOperation);
        }
        if urls.is_empty() {
            return Err(ScError::BadParam);
        }
        self.begin_attempt(vmac, urls.to_vec(), transport, now);
        Ok(())
    }

    /// Drop the direct connection to `vmac`, if any.
    pub fn disconnect(&mut self, vmac: &Vmac, transport: &mut dyn Transport, now: Instant) {
        self.attempts.retain(|a| a.vmac != *vmac);
        if let Some((route, slot)) = self.direct_route(vmac) {
            if let Some(ctx) = self.route_ctx(route) {
                ctx.disconnect(slot, transport, now);
            }
        }
    }

    fn route_ctx(&mut self, route: Route) -> Option<&mut SocketContext> {
        match route {
            Route::Acceptor => self.acceptor.as_mut(),
            Route::Initiator => self.initiator.as_mut(),
        }
    }

    /// Consume an address-resolution result pushed down by the
    /// supervisor.
    pub fn process_address_resolution(
        &mut self,
        r: &AddressResolution,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        if !self.initiate_enabled || r.urls.is_empty() {
            return;
        }
        if self.direct_route(&r.vmac).is_some() {
            trace!("node switch: {} already directly connected", r.vmac);
            return;
        }
        self.begin_attempt(r.vmac, r.urls.clone(), transport, now);
    }

    pub fn on_transport_event(
        &mut self,
        ev: TransportEvent,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        let ctx = ev.ctx();
        let ctx_events = if self.acceptor.as_ref().is_some_and(|c| c.id() == ctx) {
            self.acceptor
                .as_mut()
                .map(|c| c.on_transport_event(ev, transport, now))
                .unwrap_or_default()
        } else if self.initiator.as_ref().is_some_and(|c| c.id() == ctx) {
            self.initiator
                .as_mut()
                .map(|c| c.on_transport_event(ev, transport, now))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let from_initiator = self.initiator.as_ref().is_some_and(|c| c.id() == ctx);
        self.drive(ctx_events, from_initiator, transport, now)
    }

    fn handle_ctx_events(
        &mut self,
        ctx_events: Vec<SocketCtxEvent>,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        self.drive(ctx_events, false, transport, now)
    }

    fn drive(
        &mut self,
        ctx_events: Vec<SocketCtxEvent>,
        from_initiator: bool,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        let mut out = std::mem::take(&mut self.pending);
        for ev in ctx_events {
            match ev {
                SocketCtxEvent::Connected { slot } => {
                    if from_initiator {
                        self.on_initiator_connected(slot);
                    }
                }
                SocketCtxEvent::Disconnected { slot, reason } => {
                    if reason == ScError::DuplicatedVmac {
                        warn!("node switch: duplicated VMAC from direct peer");
                        out.push(NodeSwitchEvent::DuplicatedVmac);
                    } else if from_initiator {
                        self.on_initiator_disconnected(slot, transport, now);
                    }
                }
                SocketCtxEvent::Received { pdu, decoded, .. } => {
                    out.push(NodeSwitchEvent::Received { pdu, decoded });
                }
                SocketCtxEvent::Deinitialized => {
                    self.deinits_pending = self.deinits_pending.saturating_sub(1);
                    if self.deinits_pending == 0 {
                        self.stopped = true;
                        out.push(NodeSwitchEvent::Stopped);
                    }
                }
            }
        }
        out
    }

    fn direct_route(&self, vmac: &Vmac) -> Option<(Route, usize)> {
        if let Some(slot) = self
            .initiator
            .as_ref()
            .and_then(|c| c.connected_slot_for_vmac(vmac))
        {
            return Some((Route::Initiator, slot));
        }
        if let Some(slot) = self
            .acceptor
            .as_ref()
            .and_then(|c| c.connected_slot_for_vmac(vmac))
        {
            return Some((Route::Acceptor, slot));
        }
        None
    }

    fn begin_attempt(
        &mut self,
        vmac: Vmac,
        urls: Vec<String>,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        if self.attempts.iter().any(|a| a.vmac == vmac) {
            return;
        }
        let mut deadline = MsTimer::new();
        deadline.set(now, self.attempt_timeout);
        let mut attempt = ConnectAttempt {
            vmac,
            urls,
            next_url: 0,
            slot: None,
            deadline,
        };
        if Self::try_next_url(&mut attempt, self.initiator.as_mut(), transport, now) {
            debug!("node switch: connecting to {}", vmac);
            self.attempts.push(attempt);
        }
    }

    /// Try the attempt's next URL; false when the list is exhausted.
    fn try_next_url(
        attempt: &mut ConnectAttempt,
        initiator: Option<&mut SocketContext>,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> bool {
        let Some(ctx) = initiator else { return false };
        while attempt.next_url < attempt.urls.len() {
            let url = attempt.urls[attempt.next_url].clone();
            attempt.next_url += 1;
            match ctx.connect_free(&url, transport, now) {
                Ok(slot) => {
                    attempt.slot = Some(slot);
                    return true;
                }
                Err(err) => {
                    debug!("node switch: connect to {} failed: {}", url, err);
                }
            }
        }
        false
    }

    fn on_initiator_connected(&mut self, slot: usize) {
        let peer = self
            .initiator
            .as_ref()
            .and_then(|c| c.peer_vmac(slot));
        if let Some(at) = self.attempts.iter().position(|a| a.slot == Some(slot)) {
            let attempt = self.attempts.remove(at);
            match peer {
                Some(vmac) if vmac == attempt.vmac => {
                    debug!("node switch: direct connection to {} established", vmac)
                }
                Some(vmac) => warn!(
                    "node switch: expected peer {}, connected to {}",
                    attempt.vmac, vmac
                ),
                None => {}
            }
        }
    }

    fn on_initiator_disconnected(
        &mut self,
        slot: usize,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        let Some(at) = self.attempts.iter().position(|a| a.slot == Some(slot)) else {
            return;
        };
        let mut attempt = self.attempts.remove(at);
        attempt.slot = None;
        if Self::try_next_url(&mut attempt, self.initiator.as_mut(), transport, now) {
            self.attempts.push(attempt);
        } else {
            debug!(
                "node switch: all URLs for {} failed, staying on the hub",
                attempt.vmac
            );
        }
    }
}

enum Route {
    Acceptor,
    Initiator,
}

impl ProcessState for NodeSwitch {
    type Event = NodeSwitchEvent;

    fn process_state(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<NodeSwitchEvent> {
        // Abandon connect attempts that outlived their deadline.
        let mut expired: Vec<usize> = Vec::new();
        for (i, attempt) in self.attempts.iter().enumerate() {
            if attempt.deadline.expired(now) {
                expired.push(i);
            }
        }
        for i in expired.into_iter().rev() {
            let attempt = self.attempts.remove(i);
            debug!("node switch: connect attempt to {} timed out", attempt.vmac);
            if let (Some(slot), Some(ctx)) = (attempt.slot, self.initiator.as_mut()) {
                ctx.disconnect(slot, transport, now);
            }
        }

        let mut ctx_events = Vec::new();
        let mut initiator_events = Vec::new();
        if let Some(ctx) = self.acceptor.as_mut() {
            ctx_events.extend(ctx.process_state(transport, now));
        }
        if let Some(ctx) = self.initiator.as_mut() {
            initiator_events.extend(ctx.process_state(transport, now));
        }
        let mut out = self.drive(ctx_events, false, transport, now);
        out.extend(self.drive(initiator_events, true, transport, now));
        out
    }
}
