//! # bacnet-sc
//!
//! BACnet Secure Connect (BACnet/SC) datalink node for Rust.
//!
//! Implements the connection-management core of ASHRAE 135-2020 Addendum
//! bj (Annex AB): a hub uplink with primary/failover failover, an optional
//! hub function relaying frames between inbound peers, optional direct
//! peer-to-peer connections with address resolution, and the supervising
//! node state machine that ties them together.
//!
//! The state machines are deterministic and single-threaded; network I/O
//! lives behind the [`datalink::bsc::Transport`] trait, with a production
//! implementation over secure WebSockets in [`datalink::bsc::wss`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! use bacnet_sc::datalink::bsc::{
//!     DeviceUuid, Node, NodeConfig, NodeEvent, TlsMaterial, Vmac, WssTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = WssTransport::new(tokio::runtime::Handle::current());
//!     let config = NodeConfig {
//!         tls: Arc::new(TlsMaterial {
//!             ca_cert_chain: std::fs::read("certs/ca.crt")?,
//!             cert_chain: std::fs::read("certs/node.crt")?,
//!             key: std::fs::read("certs/node.key")?,
//!         }),
//!         uuid: DeviceUuid::random(),
//!         vmac: Vmac::random(),
//!         primary_url: "wss://hub.example.com:443".into(),
//!         failover_url: "wss://hub2.example.com:443".into(),
//!         // ...
//! #       max_bvlc_len: 1600, max_npdu_len: 1497,
//! #       connect_timeout: Duration::from_secs(10),
//! #       heartbeat_timeout: Duration::from_secs(60),
//! #       disconnect_timeout: Duration::from_secs(10),
//! #       reconnect_timeout: Duration::from_secs(5),
//! #       address_resolution_timeout: Duration::from_secs(10),
//! #       address_resolution_freshness: Duration::from_secs(300),
//! #       hub_listen_port: None, direct_listen_port: None,
//! #       hub_function_enabled: false, node_switch_enabled: false,
//! #       direct_connect_initiate: false, direct_connect_accept: false,
//! #       accept_uris: vec![],
//!     };
//!
//!     let mut node = Node::init(config, Box::new(transport))?;
//!     node.start(Instant::now())?;
//!     loop {
//!         for event in node.poll(Instant::now()) {
//!             if let NodeEvent::Received { npdu } = event {
//!                 println!("NPDU: {npdu:?}");
//!             }
//!         }
//!         tokio::time::sleep(Duration::from_millis(1)).await;
//!     }
//! }
//! ```

pub mod datalink;
