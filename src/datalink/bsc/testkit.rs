//! Shared test doubles: a recording transport and canned handshake
//! frames.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::bvlc::{ConnectParams, Message};
use super::socket::{ConnectionRole, CtxConfig};
use super::transport::{
    ConnectionKind, CtxId, SocketId, TlsMaterial, Transport, TransportCtxParams, TransportEvent,
};
use super::{DeviceUuid, ScError, Vmac};

pub const LOCAL_VMAC: Vmac = Vmac([0xA2, 0x01, 0x02, 0x03, 0x04, 0x05]);
pub const LOCAL_UUID: DeviceUuid = DeviceUuid([0x5A; 16]);

pub fn tls_material() -> Arc<TlsMaterial> {
    Arc::new(TlsMaterial {
        ca_cert_chain: b"ca".to_vec(),
        cert_chain: b"cert".to_vec(),
        key: b"key".to_vec(),
    })
}

pub fn ctx_cfg(role: ConnectionRole, kind: ConnectionKind) -> CtxConfig {
    CtxConfig {
        role,
        kind,
        listen_port: match role {
            ConnectionRole::Acceptor => Some(47808),
            ConnectionRole::Initiator => None,
        },
        tls: tls_material(),
        local_vmac: LOCAL_VMAC,
        local_uuid: LOCAL_UUID,
        max_bvlc_len: 1600,
        max_npdu_len: 1497,
        connect_timeout: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(60),
        disconnect_timeout: Duration::from_secs(10),
    }
}

/// A peer's Connect-Request, with a UUID derived from the VMAC.
pub fn request_message(vmac: Vmac) -> Message {
    Message::connect_request(
        1,
        ConnectParams {
            vmac,
            uuid: DeviceUuid([vmac.0[5]; 16]),
            max_bvlc_len: 1600,
            max_npdu_len: 1497,
        },
    )
}

pub fn request_frame(vmac: Vmac) -> Bytes {
    request_message(vmac).encode().freeze()
}

/// A peer's Connect-Accept, with a UUID derived from the VMAC.
pub fn accept_frame(vmac: Vmac) -> Bytes {
    Message::connect_accept(
        1,
        ConnectParams {
            vmac,
            uuid: DeviceUuid([vmac.0[5]; 16]),
            max_bvlc_len: 1600,
            max_npdu_len: 1497,
        },
    )
    .encode()
    .freeze()
}

#[derive(Default)]
struct Inner {
    next_ctx: u32,
    next_sock: u64,
    registered: Vec<(CtxId, TransportCtxParams)>,
    unregistered: Vec<CtxId>,
    connects: Vec<(CtxId, String, SocketId)>,
    sends: Vec<(SocketId, Vec<u8>)>,
    closed: Vec<SocketId>,
    sock_ctx: HashMap<SocketId, CtxId>,
    queue: VecDeque<TransportEvent>,
    fail_connect: bool,
}

/// Recording [`Transport`]. Cloning shares state, so a test can keep one
/// handle while the component under test owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Make subsequent `connect` calls fail synchronously.
    pub fn fail_connects(&self, fail: bool) {
        self.inner.lock().unwrap().fail_connect = fail;
    }

    /// The socket id handed out by the most recent `connect`.
    pub fn last_connect(&self) -> Option<SocketId> {
        self.inner.lock().unwrap().connects.last().map(|(_, _, sid)| *sid)
    }

    pub fn connects(&self) -> Vec<(CtxId, String, SocketId)> {
        self.inner.lock().unwrap().connects.clone()
    }

    pub fn closed(&self) -> Vec<SocketId> {
        self.inner.lock().unwrap().closed.clone()
    }

    pub fn registered_roles(&self) -> Vec<ConnectionRole> {
        self.inner
            .lock()
            .unwrap()
            .registered
            .iter()
            .map(|(_, params)| params.role)
            .collect()
    }

    pub fn unregistered(&self) -> Vec<CtxId> {
        self.inner.lock().unwrap().unregistered.clone()
    }

    pub fn raw_sends(&self) -> Vec<(SocketId, Vec<u8>)> {
        self.inner.lock().unwrap().sends.clone()
    }

    /// Every sent frame, decoded. Panics on an undecodable frame: the
    /// core never emits one.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .sends
            .iter()
            .map(|(_, frame)| Message::decode(Bytes::copy_from_slice(frame)).unwrap())
            .collect()
    }

    pub fn clear_sends(&self) {
        self.inner.lock().unwrap().sends.clear();
    }

    /// Allocate a socket id for an inbound connection; the test delivers
    /// the `Accepted` event by hand.
    pub fn accepted_socket(&self, ctx: CtxId) -> SocketId {
        let mut inner = self.inner.lock().unwrap();
        let sid = SocketId(inner.next_sock);
        inner.next_sock += 1;
        inner.sock_ctx.insert(sid, ctx);
        sid
    }

    pub fn push_connected(&self, ctx: CtxId, socket: SocketId) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(TransportEvent::Connected { ctx, socket });
    }

    pub fn push_disconnected(&self, ctx: CtxId, socket: SocketId, reason: ScError) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(TransportEvent::Disconnected { ctx, socket, reason });
    }

    pub fn push_received(&self, ctx: CtxId, socket: SocketId, frame: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(TransportEvent::Received { ctx, socket, frame });
    }

    /// Pop one queued event, as a driver would.
    pub fn take_event(&self) -> Option<TransportEvent> {
        self.inner.lock().unwrap().queue.pop_front()
    }
}

impl Transport for MockTransport {
    fn register(&mut self, params: TransportCtxParams) -> Result<CtxId, ScError> {
        let mut inner = self.inner.lock().unwrap();
        let id = CtxId(inner.next_ctx);
        inner.next_ctx += 1;
        inner.registered.push((id, params));
        Ok(id)
    }

    fn unregister(&mut self, ctx: CtxId) {
        self.inner.lock().unwrap().unregistered.push(ctx);
    }

    fn connect(&mut self, ctx: CtxId, url: &str) -> Result<SocketId, ScError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_connect {
            return Err(ScError::Transport);
        }
        let sid = SocketId(inner.next_sock);
        inner.next_sock += 1;
        inner.sock_ctx.insert(sid, ctx);
        inner.connects.push((ctx, url.to_string(), sid));
        Ok(sid)
    }

    fn send(&mut self, socket: SocketId, frame: &[u8]) -> Result<(), ScError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sock_ctx.contains_key(&socket) {
            return Err(ScError::Transport);
        }
        inner.sends.push((socket, frame.to_vec()));
        Ok(())
    }

    fn close(&mut self, socket: SocketId) {
        let mut inner = self.inner.lock().unwrap();
        // Like the real transport: a close always produces one terminal
        // disconnect, and a second close of the same socket is a no-op.
        if let Some(ctx) = inner.sock_ctx.remove(&socket) {
            inner.closed.push(socket);
            inner.queue.push_back(TransportEvent::Disconnected {
                ctx,
                socket,
                reason: ScError::Closed,
            });
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inner.lock().unwrap().queue.pop_front()
    }
}
