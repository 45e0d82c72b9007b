//! Hub connector: the primary/failover uplink state machine.
//!
//! Maintains at most one active WSS uplink over a two-slot socket pool
//! (slot 0 primary, slot 1 failover). Transitions are driven exclusively
//! by socket events and a single reconnect timer; the connector recovers
//! from transient disconnects on its own and only surfaces an error when a
//! peer asserts a duplicated VMAC.

use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};

use super::bvlc::{HubConnectionStatus, Message};
use super::socket::{CtxConfig, SocketContext, SocketCtxEvent};
use super::timer::MsTimer;
use super::transport::{Transport, TransportEvent};
use super::{ProcessState, ScError, MAX_WSURL_LEN};

const PRIMARY: usize = 0;
const FAILOVER: usize = 1;

/// Hub connector states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubConnectorState {
    Idle,
    ConnectingPrimary,
    ConnectingFailover,
    ConnectedPrimary,
    ConnectedFailover,
    WaitForReconnect,
    WaitForCtxDeinit,
    Error,
}

/// Events the hub connector reports to its owner.
#[derive(Debug, Clone)]
pub enum HubConnectorEvent {
    ConnectedPrimary,
    ConnectedFailover,
    /// The uplink dropped. `DuplicatedVmac` is fatal; every other reason
    /// is followed by an internal reconnect.
    Disconnected(ScError),
    Received { pdu: Bytes, decoded: Message },
    /// The stop path finished; carries the fatal error, if any.
    Stopped(Option<ScError>),
}

/// Primary/failover uplink state machine.
#[derive(Debug)]
pub struct HubConnector {
    ctx: SocketContext,
    state: HubConnectorState,
    primary_url: String,
    failover_url: String,
    reconnect_timeout: Duration,
    reconnect: MsTimer,
    error: Option<ScError>,
    started: bool,
}

impl HubConnector {
    /// Validate the URLs, set up the two-slot context and begin
    /// connecting to the primary hub.
    pub fn start(
        cfg: CtxConfig,
        primary_url: &str,
        failover_url: &str,
        reconnect_timeout: Duration,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<Self, ScError> {
        if primary_url.is_empty()
            || failover_url.is_empty()
            || primary_url.len() > MAX_WSURL_LEN
            || failover_url.len() > MAX_WSURL_LEN
            || reconnect_timeout.is_zero()
        {
            return Err(ScError::BadParam);
        }

        let mut ctx = SocketContext::init(cfg, 2, transport)?;
        if let Err(err) = ctx.connect(PRIMARY, primary_url, transport, now) {
            ctx.deinit(transport, now);
            return Err(err);
        }

        Ok(HubConnector {
            ctx,
            state: HubConnectorState::ConnectingPrimary,
            primary_url: primary_url.to_string(),
            failover_url: failover_url.to_string(),
            reconnect_timeout,
            reconnect: MsTimer::new(),
            error: None,
            started: true,
        })
    }

    pub fn state(&self) -> HubConnectorState {
        self.state
    }

    pub fn stopped(&self) -> bool {
        self.state == HubConnectorState::Idle
    }

    /// Connection status as reported in Advertisements.
    pub fn status(&self) -> HubConnectionStatus {
        match self.state {
            HubConnectorState::ConnectedPrimary => HubConnectionStatus::ConnectedToPrimary,
            HubConnectorState::ConnectedFailover => HubConnectionStatus::ConnectedToFailover,
            _ => HubConnectionStatus::NoConnection,
        }
    }

    pub fn ctx_id(&self) -> super::transport::CtxId {
        self.ctx.id()
    }

    /// Begin the stop path. Idempotent; completion is reported by a
    /// `Stopped` event once the context has deinitialized.
    pub fn stop(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        if !self.started
            || self.state == HubConnectorState::WaitForCtxDeinit
            || self.state == HubConnectorState::Idle
        {
            return Vec::new();
        }
        self.state = HubConnectorState::WaitForCtxDeinit;
        self.reconnect.stop();
        let ctx_events = self.ctx.deinit(transport, now);
        self.handle_ctx_events(ctx_events, transport, now)
    }

    /// Forward one PDU on the active uplink. Valid only while connected;
    /// the PDU is dropped otherwise.
    pub fn send(&mut self, pdu: &[u8], transport: &mut dyn Transport) -> Result<(), ScError> {
        let slot = match self.state {
            HubConnectorState::ConnectedPrimary => PRIMARY,
            HubConnectorState::ConnectedFailover => FAILOVER,
            _ => {
                debug!("hub connector: pdu dropped, no uplink");
                return Err(ScError::InvalidOperation);
            }
        };
        self.ctx.send(slot, pdu, transport)
    }

    pub fn on_transport_event(
        &mut self,
        ev: TransportEvent,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        let ctx_events = self.ctx.on_transport_event(ev, transport, now);
        self.handle_ctx_events(ctx_events, transport, now)
    }

    fn handle_ctx_events(
        &mut self,
        ctx_events: Vec<SocketCtxEvent>,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        let mut out = Vec::new();
        for ev in ctx_events {
            match ev {
                SocketCtxEvent::Connected { .. } => match self.state {
                    HubConnectorState::ConnectingPrimary => {
                        self.state = HubConnectorState::ConnectedPrimary;
                        out.push(HubConnectorEvent::ConnectedPrimary);
                    }
                    HubConnectorState::ConnectingFailover => {
                        self.state = HubConnectorState::ConnectedFailover;
                        out.push(HubConnectorEvent::ConnectedFailover);
                    }
                    _ => {}
                },
                SocketCtxEvent::Disconnected { reason, .. } => {
                    self.on_disconnected(reason, transport, now, &mut out);
                }
                SocketCtxEvent::Received { pdu, decoded, .. } => {
                    out.push(HubConnectorEvent::Received { pdu, decoded });
                }
                SocketCtxEvent::Deinitialized => {
                    let was_started = self.started;
                    self.started = false;
                    self.state = HubConnectorState::Idle;
                    if was_started {
                        out.push(HubConnectorEvent::Stopped(self.error));
                    }
                }
            }
        }
        out
    }

    fn on_disconnected(
        &mut self,
        reason: ScError,
        transport: &mut dyn Transport,
        now: Instant,
        out: &mut Vec<HubConnectorEvent>,
    ) {
        if reason == ScError::DuplicatedVmac {
            warn!("hub connector: fatal duplicated VMAC");
            self.state = HubConnectorState::Error;
            self.error = Some(ScError::DuplicatedVmac);
            out.push(HubConnectorEvent::Disconnected(ScError::DuplicatedVmac));
            let stop_events = self.stop(transport, now);
            out.extend(stop_events);
            return;
        }

        match self.state {
            HubConnectorState::ConnectingPrimary => {
                self.connect_or_stop(FAILOVER, transport, now, out);
            }
            HubConnectorState::ConnectingFailover => {
                debug!(
                    "hub connector: both hubs unreachable, retrying in {:?}",
                    self.reconnect_timeout
                );
                self.state = HubConnectorState::WaitForReconnect;
                self.reconnect.set(now, self.reconnect_timeout);
            }
            HubConnectorState::ConnectedPrimary | HubConnectorState::ConnectedFailover => {
                out.push(HubConnectorEvent::Disconnected(reason));
                self.connect_or_stop(PRIMARY, transport, now, out);
            }
            // Disconnects while stopping only drive the context to idle.
            _ => {}
        }
    }

    fn connect_or_stop(
        &mut self,
        slot: usize,
        transport: &mut dyn Transport,
        now: Instant,
        out: &mut Vec<HubConnectorEvent>,
    ) {
        let url = if slot == PRIMARY {
            self.primary_url.clone()
        } else {
            self.failover_url.clone()
        };
        self.state = if slot == PRIMARY {
            HubConnectorState::ConnectingPrimary
        } else {
            HubConnectorState::ConnectingFailover
        };

        if let Err(err) = self.ctx.connect(slot, &url, transport, now) {
            warn!("hub connector: fatal connect error to {}: {}", url, err);
            self.state = HubConnectorState::Error;
            self.error = Some(err);
            let stop_events = self.stop(transport, now);
            out.extend(stop_events);
        }
    }
}

impl ProcessState for HubConnector {
    type Event = HubConnectorEvent;

    fn process_state(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Vec<HubConnectorEvent> {
        let mut out = Vec::new();
        if self.state == HubConnectorState::WaitForReconnect && self.reconnect.expired(now) {
            self.connect_or_stop(PRIMARY, transport, now, &mut out);
        }
        let ctx_events = self.ctx.process_state(transport, now);
        out.extend(self.handle_ctx_events(ctx_events, transport, now));
        out
    }
}
