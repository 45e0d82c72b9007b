//! BACnet/SC Node Example
//!
//! Brings a node up against a hub, keeps the uplink alive (failover and
//! reconnect included) and prints every NPDU that arrives.
//!
//! # Prerequisites
//!
//! 1. A BACnet/SC hub reachable over WSS
//! 2. Node certificate and private key (PEM format)
//! 3. CA certificate for peer verification (PEM format)
//!
//! # Certificate Generation
//!
//! You can generate test certificates using OpenSSL:
//!
//! ```bash
//! # Generate CA certificate
//! openssl req -x509 -newkey rsa:4096 -keyout ca.key -out ca.crt -days 365 -nodes
//!
//! # Generate node certificate
//! openssl req -newkey rsa:4096 -keyout node.key -out node.csr -nodes
//! openssl x509 -req -in node.csr -CA ca.crt -CAkey ca.key -CAcreateserial -out node.crt -days 365
//! ```
//!
//! # Usage
//!
//! ```bash
//! BSC_PRIMARY_URL="wss://hub.example.com:443" \
//! BSC_FAILOVER_URL="wss://hub2.example.com:443" \
//! BSC_NODE_CERT="certs/node.crt" \
//! BSC_NODE_KEY="certs/node.key" \
//! BSC_CA_CERT="certs/ca.crt" \
//! cargo run --example sc_node
//! ```

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bacnet_sc::datalink::bsc::{
    DeviceUuid, Node, NodeConfig, NodeEvent, TlsMaterial, Vmac, WssTransport,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let primary_url =
        env::var("BSC_PRIMARY_URL").unwrap_or_else(|_| "wss://localhost:443".to_string());
    let failover_url =
        env::var("BSC_FAILOVER_URL").unwrap_or_else(|_| primary_url.clone());
    let cert_path = env::var("BSC_NODE_CERT").unwrap_or_else(|_| "certs/node.crt".to_string());
    let key_path = env::var("BSC_NODE_KEY").unwrap_or_else(|_| "certs/node.key".to_string());
    let ca_path = env::var("BSC_CA_CERT").unwrap_or_else(|_| "certs/ca.crt".to_string());

    let vmac = Vmac::random();
    println!("BACnet/SC Node Example");
    println!("======================");
    println!("  Primary hub:  {}", primary_url);
    println!("  Failover hub: {}", failover_url);
    println!("  VMAC:         {}\n", vmac);

    let config = NodeConfig {
        tls: Arc::new(TlsMaterial {
            ca_cert_chain: std::fs::read(&ca_path)?,
            cert_chain: std::fs::read(&cert_path)?,
            key: std::fs::read(&key_path)?,
        }),
        uuid: DeviceUuid::random(),
        vmac,
        max_bvlc_len: 1600,
        max_npdu_len: 1497,
        connect_timeout: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(60),
        disconnect_timeout: Duration::from_secs(10),
        reconnect_timeout: Duration::from_secs(5),
        address_resolution_timeout: Duration::from_secs(10),
        address_resolution_freshness: Duration::from_secs(300),
        primary_url,
        failover_url,
        hub_listen_port: None,
        direct_listen_port: None,
        hub_function_enabled: false,
        node_switch_enabled: false,
        direct_connect_initiate: false,
        direct_connect_accept: false,
        accept_uris: Vec::new(),
    };

    let transport = WssTransport::new(tokio::runtime::Handle::current());
    let mut node = Node::init(config, Box::new(transport))?;
    node.start(Instant::now())?;
    println!("Node starting; press Ctrl+C to stop\n");

    let mut tick = tokio::time::interval(Duration::from_millis(1));
    let mut npdu_count = 0u64;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for event in node.poll(Instant::now()) {
                    match event {
                        NodeEvent::Started => println!("✓ node started"),
                        NodeEvent::Restarted => {
                            println!("✓ node restarted with VMAC {}", node.vmac())
                        }
                        NodeEvent::Stopped => {
                            println!("node stopped");
                            return Ok(());
                        }
                        NodeEvent::Received { npdu } => {
                            npdu_count += 1;
                            println!("NPDU #{} ({} bytes): {:02X?}", npdu_count, npdu.len(), &npdu[..]);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                node.stop(Instant::now());
            }
        }
    }
}
