//! Secure-WebSocket transport with TLS mutual authentication.
//!
//! Production implementation of [`Transport`] on tokio + tungstenite.
//! Each socket context registers its role here: initiators get a TLS
//! connector for outbound `wss://` dials, acceptors get a TLS acceptor
//! plus a listener task. Every connection runs one driver task that owns
//! the WebSocket stream; the core never blocks on it and learns about
//! outcomes through the polled event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};

use super::transport::{
    ConnectionKind, ConnectionRole, CtxId, SocketId, Transport, TransportCtxParams,
    TransportEvent,
};
use super::ScError;

/// BACnet/SC WebSocket subprotocol for hub connections
pub const SUBPROTOCOL_HUB: &str = "hub.bsc.bacnet.org";

/// BACnet/SC WebSocket subprotocol for direct connections
pub const SUBPROTOCOL_DIRECT: &str = "dc.bsc.bacnet.org";

fn subprotocol(kind: ConnectionKind) -> &'static str {
    match kind {
        ConnectionKind::Hub => SUBPROTOCOL_HUB,
        ConnectionKind::Direct => SUBPROTOCOL_DIRECT,
    }
}

/// State shared with the listener and driver tasks.
struct Shared {
    events: UnboundedSender<TransportEvent>,
    socks: Mutex<HashMap<SocketId, SockEntry>>,
    next_sock: AtomicU64,
}

impl Shared {
    fn alloc_socket(&self) -> SocketId {
        SocketId(self.next_sock.fetch_add(1, Ordering::Relaxed))
    }
}

struct SockEntry {
    ctx: CtxId,
    writer: UnboundedSender<WsMessage>,
    driver: JoinHandle<()>,
}

struct CtxEntry {
    kind: ConnectionKind,
    role: ConnectionRole,
    ws_config: WebSocketConfig,
    connector: Option<native_tls::TlsConnector>,
    listener: Option<JoinHandle<()>>,
}

/// Secure WebSocket [`Transport`].
pub struct WssTransport {
    handle: tokio::runtime::Handle,
    shared: Arc<Shared>,
    events_rx: UnboundedReceiver<TransportEvent>,
    ctxs: HashMap<CtxId, CtxEntry>,
    next_ctx: u32,
}

impl WssTransport {
    /// Create a transport whose tasks run on the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        let (events, events_rx) = unbounded_channel();
        WssTransport {
            handle,
            shared: Arc::new(Shared {
                events,
                socks: Mutex::new(HashMap::new()),
                next_sock: AtomicU64::new(1),
            }),
            events_rx,
            ctxs: HashMap::new(),
            next_ctx: 1,
        }
    }
}

impl Transport for WssTransport {
    fn register(&mut self, params: TransportCtxParams) -> Result<CtxId, ScError> {
        let identity = native_tls::Identity::from_pkcs8(&params.tls.cert_chain, &params.tls.key)
            .map_err(|err| {
                warn!("wss: bad certificate chain or key: {}", err);
                ScError::BadParam
            })?;
        let ws_config = WebSocketConfig {
            max_message_size: Some(params.max_frame),
            max_frame_size: Some(params.max_frame),
            ..Default::default()
        };

        let id = CtxId(self.next_ctx);
        self.next_ctx += 1;

        let mut entry = CtxEntry {
            kind: params.kind,
            role: params.role,
            ws_config,
            connector: None,
            listener: None,
        };

        match params.role {
            ConnectionRole::Initiator => {
                let ca = native_tls::Certificate::from_pem(&params.tls.ca_cert_chain)
                    .map_err(|err| {
                        warn!("wss: bad CA certificate: {}", err);
                        ScError::BadParam
                    })?;
                let connector = native_tls::TlsConnector::builder()
                    .identity(identity)
                    .add_root_certificate(ca)
                    .build()
                    .map_err(|err| {
                        warn!("wss: TLS connector setup failed: {}", err);
                        ScError::Transport
                    })?;
                entry.connector = Some(connector);
            }
            ConnectionRole::Acceptor => {
                let port = params.listen_port.ok_or(ScError::BadParam)?;
                let acceptor = native_tls::TlsAcceptor::builder(identity)
                    .build()
                    .map_err(|err| {
                        warn!("wss: TLS acceptor setup failed: {}", err);
                        ScError::Transport
                    })?;
                let listener = std::net::TcpListener::bind(("0.0.0.0", port)).map_err(|err| {
                    warn!("wss: bind to port {} failed: {}", port, err);
                    ScError::Transport
                })?;
                listener.set_nonblocking(true).map_err(|_| ScError::Transport)?;

                entry.listener = Some(self.handle.spawn(run_listener(
                    self.shared.clone(),
                    id,
                    listener,
                    tokio_native_tls::TlsAcceptor::from(acceptor),
                    entry.ws_config.clone(),
                    subprotocol(params.kind),
                )));
                debug!("wss: listening on port {} for {:?}", port, params.kind);
            }
        }

        self.ctxs.insert(id, entry);
        Ok(id)
    }

    fn unregister(&mut self, ctx: CtxId) {
        if let Some(entry) = self.ctxs.remove(&ctx) {
            if let Some(listener) = entry.listener {
                listener.abort();
            }
        }
    }

    fn connect(&mut self, ctx: CtxId, url: &str) -> Result<SocketId, ScError> {
        let entry = self.ctxs.get(&ctx).ok_or(ScError::BadParam)?;
        if entry.role != ConnectionRole::Initiator {
            return Err(ScError::InvalidOperation);
        }
        let connector = entry.connector.clone().ok_or(ScError::InvalidOperation)?;

        let mut request = url.into_client_request().map_err(|err| {
            warn!("wss: invalid URL {}: {}", url, err);
            ScError::BadParam
        })?;
        request.headers_mut().append(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(subprotocol(entry.kind)),
        );

        let sid = self.shared.alloc_socket();
        let (writer, writer_rx) = unbounded_channel();
        let driver = self.handle.spawn(run_initiator(
            self.shared.clone(),
            ctx,
            sid,
            request,
            connector,
            entry.ws_config.clone(),
            writer_rx,
        ));
        self.shared
            .socks
            .lock()
            .unwrap()
            .insert(sid, SockEntry { ctx, writer, driver });
        Ok(sid)
    }

    fn send(&mut self, socket: SocketId, frame: &[u8]) -> Result<(), ScError> {
        let socks = self.shared.socks.lock().unwrap();
        let entry = socks.get(&socket).ok_or(ScError::InvalidOperation)?;
        entry
            .writer
            .send(WsMessage::Binary(frame.to_vec()))
            .map_err(|_| ScError::Transport)
    }

    fn close(&mut self, socket: SocketId) {
        let entry = self.shared.socks.lock().unwrap().remove(&socket);
        if let Some(entry) = entry {
            entry.driver.abort();
            let _ = self.shared.events.send(TransportEvent::Disconnected {
                ctx: entry.ctx,
                socket,
                reason: ScError::Closed,
            });
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }
}

impl Drop for WssTransport {
    fn drop(&mut self) {
        for entry in self.ctxs.values() {
            if let Some(listener) = &entry.listener {
                listener.abort();
            }
        }
        for (_, entry) in self.shared.socks.lock().unwrap().drain() {
            entry.driver.abort();
        }
    }
}

/// Dial, then hand the established stream to the read/write loop.
async fn run_initiator(
    shared: Arc<Shared>,
    ctx: CtxId,
    sid: SocketId,
    request: Request,
    connector: native_tls::TlsConnector,
    ws_config: WebSocketConfig,
    writer_rx: UnboundedReceiver<WsMessage>,
) {
    let connected = connect_async_tls_with_config(
        request,
        Some(ws_config),
        false,
        Some(Connector::NativeTls(connector)),
    )
    .await;

    match connected {
        Ok((stream, _response)) => {
            let _ = shared
                .events
                .send(TransportEvent::Connected { ctx, socket: sid });
            run_stream(shared, ctx, sid, stream, writer_rx).await;
        }
        Err(err) => {
            debug!("wss: connect failed: {}", err);
            shared.socks.lock().unwrap().remove(&sid);
            let _ = shared.events.send(TransportEvent::Disconnected {
                ctx,
                socket: sid,
                reason: map_ws_error(&err),
            });
        }
    }
}

/// Accept loop for one acceptor context.
async fn run_listener(
    shared: Arc<Shared>,
    ctx: CtxId,
    listener: std::net::TcpListener,
    acceptor: tokio_native_tls::TlsAcceptor,
    ws_config: WebSocketConfig,
    protocol: &'static str,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("wss: listener setup failed: {}", err);
            return;
        }
    };

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("wss: accept failed: {}", err);
                continue;
            }
        };
        debug!("wss: inbound connection from {}", peer);

        let shared = shared.clone();
        let acceptor = acceptor.clone();
        let ws_config = ws_config.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!("wss: TLS accept from {} failed: {}", peer, err);
                    return;
                }
            };

            let negotiate = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                let offered = req
                    .headers()
                    .get(SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.split(',').any(|p| p.trim() == protocol));
                if offered {
                    resp.headers_mut()
                        .append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
                } else {
                    debug!("wss: peer {} did not offer {}", peer, protocol);
                }
                Ok(resp)
            };

            match tokio_tungstenite::accept_hdr_async_with_config(tls, negotiate, Some(ws_config))
                .await
            {
                Ok(ws) => {
                    let sid = shared.alloc_socket();
                    let (writer, writer_rx) = unbounded_channel();
                    let _ = shared
                        .events
                        .send(TransportEvent::Accepted { ctx, socket: sid });
                    let driver = tokio::spawn(run_stream(
                        shared.clone(),
                        ctx,
                        sid,
                        ws,
                        writer_rx,
                    ));
                    shared
                        .socks
                        .lock()
                        .unwrap()
                        .insert(sid, SockEntry { ctx, writer, driver });
                }
                Err(err) => debug!("wss: WebSocket accept from {} failed: {}", peer, err),
            }
        });
    }
}

/// Pump one established WebSocket until either side ends it.
async fn run_stream<S>(
    shared: Arc<Shared>,
    ctx: CtxId,
    sid: SocketId,
    stream: WebSocketStream<S>,
    mut writer_rx: UnboundedReceiver<WsMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    let reason = loop {
        tokio::select! {
            inbound = source.next() => match inbound {
                Some(Ok(WsMessage::Binary(data))) => {
                    let _ = shared.events.send(TransportEvent::Received {
                        ctx,
                        socket: sid,
                        frame: Bytes::from(data),
                    });
                }
                Some(Ok(WsMessage::Close(_))) | None => break ScError::Closed,
                Some(Ok(_)) => {
                    // Ping/pong is handled inside tungstenite; text frames
                    // have no meaning in BVLC-SC.
                }
                Some(Err(err)) => break map_ws_error(&err),
            },
            outbound = writer_rx.recv() => match outbound {
                Some(msg) => {
                    if let Err(err) = sink.send(msg).await {
                        break map_ws_error(&err);
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break ScError::Closed;
                }
            },
        }
    };

    shared.socks.lock().unwrap().remove(&sid);
    let _ = shared.events.send(TransportEvent::Disconnected {
        ctx,
        socket: sid,
        reason,
    });
}

fn map_ws_error(err: &WsError) -> ScError {
    match err {
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => ScError::Refused,
            std::io::ErrorKind::TimedOut => ScError::Timeout,
            _ => ScError::Transport,
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => ScError::Closed,
        _ => ScError::Transport,
    }
}
