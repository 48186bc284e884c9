//! End-to-end tests that never touch a real TUN device: the mutual-TLS
//! handshake is exercised over real loopback TCP with certificates minted by
//! `rcgen`, and the forwarding engine is exercised over an in-memory
//! `tokio::io::duplex` pair with `PacketSource`/`PacketSink` test doubles
//! standing in for the adapter side.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;

use sssonector::adapter::{PacketSink, PacketSource};
use sssonector::config::{ClientTransportConfig, ReconnectPolicy, ServerTransportConfig, TlsConfig, TlsVersionFloor};
use sssonector::counters::{Counters, LoggingObserver};
use sssonector::engine::ForwardingEngine;
use sssonector::error::{CoreError, CoreResult};
use sssonector::transport::{Transport, TlsMaterial};

fn unique_path(name: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("sssonector-test-{}-{}-{n}.pem", std::process::id(), name))
}

fn write_pem(name: &str, contents: &str) -> PathBuf {
    let path = unique_path(name);
    std::fs::write(&path, contents).expect("write temp pem");
    path
}

/// One CA plus a leaf cert/key signed by it, written to temp PEM files. Both
/// client and server present a leaf from the same CA so each trusts the
/// other's chain.
struct Pki {
    trusted_ca: PathBuf,
    leaf_chain: PathBuf,
    leaf_key: PathBuf,
}

fn mint_leaf(ca_params: &CertificateParams, ca_key: &KeyPair, common_name: &str) -> Pki {
    let ca_cert = ca_params
        .clone()
        .self_signed(ca_key)
        .expect("self-sign ca");

    let mut leaf_params = CertificateParams::new(vec!["127.0.0.1".to_string()]).expect("leaf params");
    leaf_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, ca_key)
        .expect("sign leaf");

    Pki {
        trusted_ca: write_pem(&format!("{common_name}-ca"), &ca_cert.pem()),
        leaf_chain: write_pem(&format!("{common_name}-leaf"), &leaf_cert.pem()),
        leaf_key: write_pem(&format!("{common_name}-key"), &leaf_key.serialize_pem()),
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::new(Vec::new()).expect("ca params");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "test ca");
    params
}

fn tls_config(pki: &Pki) -> TlsConfig {
    TlsConfig {
        certificate_chain: pki.leaf_chain.clone(),
        private_key: pki.leaf_key.clone(),
        trusted_cas: vec![pki.trusted_ca.clone()],
        min_version: TlsVersionFloor::Tls12,
        server_name: Some("127.0.0.1".to_string()),
        cipher_suites: Vec::new(),
    }
}

#[tokio::test]
async fn mutual_tls_handshake_succeeds_when_both_sides_share_a_trusted_ca() {
    let ca_key = KeyPair::generate().expect("ca key");
    let ca_params = ca_params();

    let server_pki = mint_leaf(&ca_params, &ca_key, "server");
    let client_pki = mint_leaf(&ca_params, &ca_key, "client");

    let server_tls = tls_config(&server_pki);
    let client_tls = tls_config(&client_pki);

    let server_material = TlsMaterial::load(&server_tls).expect("load server material");
    let client_material = TlsMaterial::load(&client_tls).expect("load client material");

    let server_cfg = ServerTransportConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        max_sessions: 1,
        handshake_timeout_ms: 5_000,
        drain_grace_ms: 1_000,
    };

    let listener = Transport::listen(&server_cfg, &server_tls, &server_material)
        .await
        .expect("bind listener");
    let bound: SocketAddr = listener.local_addr().expect("local addr");

    let accept_task = tokio::spawn(async move { listener.accept().await });

    let client_cfg = ClientTransportConfig {
        peer: bound,
        connect_timeout_ms: 5_000,
        handshake_timeout_ms: 5_000,
        reconnect: ReconnectPolicy::default(),
        drain_grace_ms: 1_000,
    };

    let client_transport = Transport::dial(&client_cfg, &client_tls, &client_material)
        .await
        .expect("client dial and handshake");

    let server_transport = accept_task
        .await
        .expect("accept task join")
        .expect("server-side handshake");

    assert_eq!(client_transport.remote_addr, bound);
    assert_eq!(server_transport.local_addr, bound);
}

#[tokio::test]
async fn mutual_tls_handshake_fails_when_client_cert_is_from_an_untrusted_ca() {
    let trusted_ca_key = KeyPair::generate().expect("trusted ca key");
    let trusted_ca_params = ca_params();
    let server_pki = mint_leaf(&trusted_ca_params, &trusted_ca_key, "server-strict");

    // Client presents a leaf signed by a *different* CA the server never
    // trusts, so mutual authentication must reject it.
    let rogue_ca_key = KeyPair::generate().expect("rogue ca key");
    let rogue_ca_params = ca_params();
    let mut rogue_client_pki = mint_leaf(&rogue_ca_params, &rogue_ca_key, "client-rogue");
    // The client still needs to trust the server's CA to validate its chain.
    rogue_client_pki.trusted_ca = server_pki.trusted_ca.clone();

    let server_tls = tls_config(&server_pki);
    let client_tls = tls_config(&rogue_client_pki);

    let server_material = TlsMaterial::load(&server_tls).expect("load server material");
    let client_material = TlsMaterial::load(&client_tls).expect("load client material");

    let server_cfg = ServerTransportConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        max_sessions: 1,
        handshake_timeout_ms: 5_000,
        drain_grace_ms: 1_000,
    };

    let listener = Transport::listen(&server_cfg, &server_tls, &server_material)
        .await
        .expect("bind listener");
    let bound: SocketAddr = listener.local_addr().expect("local addr");

    let accept_task = tokio::spawn(async move { listener.accept().await });

    let client_cfg = ClientTransportConfig {
        peer: bound,
        connect_timeout_ms: 5_000,
        handshake_timeout_ms: 5_000,
        reconnect: ReconnectPolicy::default(),
        drain_grace_ms: 1_000,
    };

    let client_result = Transport::dial(&client_cfg, &client_tls, &client_material).await;
    let server_result = accept_task.await.expect("accept task join");

    assert!(client_result.is_err() || server_result.is_err());
}

/// Hands back queued packets in order, then blocks forever once drained so
/// the egress loop parks on cancellation instead of busy-looping on EOF.
struct QueueSource {
    packets: VecDeque<Vec<u8>>,
}

#[async_trait]
impl PacketSource for QueueSource {
    async fn read_packet(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        match self.packets.pop_front() {
            Some(packet) => {
                if packet.len() > buf.len() {
                    return Err(CoreError::AdapterIo(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "test packet exceeds buffer",
                    )));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => std::future::pending::<CoreResult<usize>>().await,
        }
    }
}

/// Never produces anything; stands in for the direction under test's
/// counterpart, which this test doesn't exercise.
struct PendingSource;

#[async_trait]
impl PacketSource for PendingSource {
    async fn read_packet(&mut self, _buf: &mut [u8]) -> CoreResult<usize> {
        std::future::pending::<CoreResult<usize>>().await
    }
}

struct NullSink;

#[async_trait]
impl PacketSink for NullSink {
    async fn write_packet(&mut self, _packet: &[u8]) -> CoreResult<()> {
        Ok(())
    }
}

struct CollectSink {
    tx: UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl PacketSink for CollectSink {
    async fn write_packet(&mut self, packet: &[u8]) -> CoreResult<()> {
        let _ = self.tx.send(packet.to_vec());
        Ok(())
    }
}

fn test_engine(mtu: usize, peer_label: &str) -> ForwardingEngine {
    ForwardingEngine {
        mtu,
        egress_limiter: None,
        ingress_limiter: None,
        counters: Arc::new(Counters::default()),
        observer: Arc::new(LoggingObserver),
        peer_label: peer_label.to_string(),
        drain_grace: Duration::from_millis(200),
        keepalive_interval: None,
    }
}

#[tokio::test]
async fn forwarding_engine_carries_many_packets_across_the_wire() {
    let (side_a, side_b) = tokio::io::duplex(64 * 1024);

    let packets: Vec<Vec<u8>> = (0..64u16).map(|i| vec![(i % 256) as u8; 200]).collect();
    let (tx, mut rx) = unbounded_channel();

    let cancel = CancellationToken::new();

    let engine_a = test_engine(1500, "a");
    let source_a = QueueSource {
        packets: packets.clone().into(),
    };

    let engine_b = test_engine(1500, "b");
    let source_b = PendingSource;
    let sink_b = CollectSink { tx };

    let cancel_a = cancel.clone();
    let cancel_b = cancel.clone();
    let task_a = tokio::spawn(async move { engine_a.run(source_a, NullSink, side_a, cancel_a).await });
    let task_b = tokio::spawn(async move { engine_b.run(source_b, sink_b, side_b, cancel_b).await });

    let mut received = Vec::new();
    for _ in 0..packets.len() {
        let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("packet arrived before timeout")
            .expect("sender stayed open");
        received.push(packet);
    }
    assert_eq!(received, packets);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), task_b).await;
}

#[tokio::test]
async fn forwarding_engine_keepalive_heartbeats_never_reach_the_adapter() {
    let (side_a, side_b) = tokio::io::duplex(64 * 1024);

    let packets: Vec<Vec<u8>> = vec![vec![1u8; 40], vec![2u8; 40]];
    let (tx, mut rx) = unbounded_channel();
    let cancel = CancellationToken::new();

    let mut engine_a = test_engine(1500, "a");
    engine_a.keepalive_interval = Some(Duration::from_millis(20));
    let source_a = QueueSource {
        packets: packets.clone().into(),
    };

    let mut engine_b = test_engine(1500, "b");
    engine_b.keepalive_interval = Some(Duration::from_millis(20));
    let source_b = PendingSource;
    let sink_b = CollectSink { tx };

    let cancel_a = cancel.clone();
    let cancel_b = cancel.clone();
    let task_a = tokio::spawn(async move { engine_a.run(source_a, NullSink, side_a, cancel_a).await });
    let task_b = tokio::spawn(async move { engine_b.run(source_b, sink_b, side_b, cancel_b).await });

    // Give several heartbeat intervals to elapse on both sides before the
    // real packets are consumed, so heartbeats are actually interleaved on
    // the wire ahead of and between them.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let mut received = Vec::new();
    for _ in 0..packets.len() {
        let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("packet arrived before timeout")
            .expect("sender stayed open");
        received.push(packet);
    }
    assert_eq!(received, packets);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), task_b).await;
}

#[tokio::test]
async fn forwarding_engine_drops_oversize_packets_without_killing_the_session() {
    let (side_a, side_b) = tokio::io::duplex(64 * 1024);

    let mtu = 512usize;
    let oversize = vec![7u8; mtu + 128];
    let normal = vec![9u8; 64];

    let (tx, mut rx) = unbounded_channel();
    let cancel = CancellationToken::new();

    let engine_a = test_engine(mtu, "a");
    let counters_a = engine_a.counters.clone();
    let source_a = QueueSource {
        packets: VecDeque::from(vec![oversize, normal.clone()]),
    };

    let engine_b = test_engine(mtu, "b");
    let source_b = PendingSource;
    let sink_b = CollectSink { tx };

    let cancel_a = cancel.clone();
    let cancel_b = cancel.clone();
    let task_a = tokio::spawn(async move { engine_a.run(source_a, NullSink, side_a, cancel_a).await });
    let task_b = tokio::spawn(async move { engine_b.run(source_b, sink_b, side_b, cancel_b).await });

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("packet arrived before timeout")
        .expect("sender stayed open");
    assert_eq!(received, normal);
    assert_eq!(counters_a.egress.snapshot().oversize_drops, 1);
    assert_eq!(counters_a.egress.snapshot().frames, 1);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), task_b).await;
}
