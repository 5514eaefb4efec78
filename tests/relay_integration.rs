//! Broker integration tests over real TCP sockets.
//!
//! Brokers bind ephemeral loopback ports; peers are either full
//! [`RelayClient`]s or hand-driven [`RawPeer`] connections when a test needs
//! to put specific frames on the wire.

use async_trait::async_trait;
use meshlink_core::{PeerId, SignalHandler, Transport};
use meshlink_integration_tests::{
    RawPeer, eventually, init_tracing, key, spawn_relay, wait_registered, wait_sessions,
};
use meshlink_relay::{Command, FrameHeader, RelayClient, RelayClientConfig, RelayServer, RelayServerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

#[async_trait]
impl SignalHandler for Recorder {
    async fn on_signal(&self, from: PeerId, payload: &[u8]) {
        self.seen.lock().unwrap().push((from, payload.to_vec()));
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_must_be_first_frame() {
    init_tracing();
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;

    let id = PeerId::from_public_key(&key(1));
    let mut peer = RawPeer::upgraded(&url, id).await;
    peer.send(Command::Forward, PeerId::from_u64(5), b"too early").await;

    assert!(peer.recv_within(WAIT).await.is_none(), "broker must close the stream");
    assert_eq!(server.session_count().await, 0);
}

#[tokio::test]
async fn test_register_key_mismatch_rejected() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;

    let mut peer = RawPeer::upgraded(&url, PeerId::from_u64(77)).await;
    peer.send(Command::Register, PeerId::ZERO, key(2).as_bytes()).await;

    assert!(peer.recv_within(WAIT).await.is_none());
    assert!(!server.is_registered(&PeerId::from_u64(77)).await);
}

#[tokio::test]
async fn test_require_key_rejects_empty_register() {
    let (server, url) = spawn_relay(RelayServerConfig {
        require_key: true,
        ..Default::default()
    })
    .await;

    let id = PeerId::from_public_key(&key(3));
    let mut peer = RawPeer::upgraded(&url, id).await;
    peer.send(Command::Register, PeerId::ZERO, &[]).await;

    assert!(peer.recv_within(WAIT).await.is_none());
    assert!(!server.is_registered(&id).await);
}

#[tokio::test]
async fn test_reregistration_preempts_old_session() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = key(4);
    let a_id = PeerId::from_public_key(&a);

    let mut first = RawPeer::register(&url, &a).await;
    assert!(wait_registered(&server, &a_id, WAIT).await);

    let mut second = RawPeer::register(&url, &a).await;
    assert!(first.recv_within(WAIT).await.is_none(), "old session must be closed");
    assert!(server.is_registered(&a_id).await);
    assert_eq!(server.session_count().await, 1);

    let mut b = RawPeer::register(&url, &key(5)).await;
    b.send(Command::Forward, a_id, b"to the new session").await;
    let (header, payload) = second.recv_within(WAIT).await.expect("forwarded frame");
    assert_eq!(header.from, b.id);
    assert_eq!(payload, b"to the new session");
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_missing_target_is_drained() {
    let (_server, url) = spawn_relay(RelayServerConfig::default()).await;
    let mut a = RawPeer::register(&url, &key(6)).await;

    a.send(Command::Forward, PeerId::from_u64(404), &vec![0xAB; 4096]).await;
    let a_id = a.id;
    a.send(Command::Forward, a_id, b"intact").await;

    let (header, payload) = a.recv_within(WAIT).await.expect("frame after drained one");
    assert_eq!(header.command, Command::Forward);
    assert_eq!(header.from, a_id);
    assert_eq!(header.to, a_id);
    assert_eq!(payload, b"intact");
}

#[tokio::test]
async fn test_spoofed_sender_dropped() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let mut a = RawPeer::register(&url, &key(7)).await;
    let mut b = RawPeer::register(&url, &key(8)).await;
    let b_id = b.id;
    assert!(wait_sessions(&server, 2, WAIT).await);

    a.send_as(PeerId::from_u64(99), Command::Forward, b_id, b"forged").await;
    a.send(Command::Forward, b_id, b"genuine").await;

    let (header, payload) = b.recv_within(WAIT).await.expect("genuine frame");
    assert_eq!(header.from, a.id);
    assert_eq!(payload, b"genuine");
}

#[tokio::test]
async fn test_client_forward_between_peers() {
    init_tracing();
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(9), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(&url, &key(10), RelayClientConfig::default()).await.unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    a.send(b.local_id(), Command::Forward, b"over the broker").await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = tokio::time::timeout(WAIT, b.receive(&mut buf)).await.unwrap().unwrap();
    assert_eq!(from, a.local_id());
    assert_eq!(&buf[..n], b"over the broker");

    a.close().await;
    b.close().await;
}

/// Handler that parks every signal until released
struct Parked {
    seen: AtomicUsize,
    release: Semaphore,
}

impl Parked {
    fn new() -> Self {
        Self {
            seen: AtomicUsize::new(0),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl SignalHandler for Parked {
    async fn on_signal(&self, _from: PeerId, _payload: &[u8]) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        let _ = self.release.acquire().await;
    }
}

#[tokio::test]
async fn test_full_signal_queue_drops_without_stalling_packets() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(27), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(
        &url,
        &key(28),
        RelayClientConfig {
            probe_workers: 1,
            probe_queue: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    let parked = Arc::new(Parked::new());
    b.set_signal_handler(parked.clone());

    for i in 0..20u8 {
        a.send(b.local_id(), Command::Probe, &[i]).await.unwrap();
    }
    a.send(b.local_id(), Command::Forward, b"hot path").await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = tokio::time::timeout(WAIT, b.receive(&mut buf)).await.unwrap().unwrap();
    assert_eq!(from, a.local_id());
    assert_eq!(&buf[..n], b"hot path");

    parked.release.add_permits(64);
    assert!(eventually(WAIT, || parked.seen.load(Ordering::SeqCst) >= 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // One signal in the worker, at most one in the queue, the rest dropped
    assert!(parked.seen.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_probe_frames_reach_signal_handler() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(11), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(&url, &key(12), RelayClientConfig::default()).await.unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    let recorder = Arc::new(Recorder::default());
    b.set_signal_handler(recorder.clone());
    b.start_pump();

    a.send(b.local_id(), Command::Probe, b"signal").await.unwrap();

    assert!(eventually(WAIT, || !recorder.seen.lock().unwrap().is_empty()).await);
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(a.local_id(), b"signal".to_vec())]);
}

/// Header announcing `len` bytes to `to`, followed by only `partial` of them
async fn send_truncated(peer: &mut RawPeer, to: PeerId, len: u32, partial: &[u8]) {
    let header = FrameHeader::new(Command::Forward, len, peer.id, to);
    peer.writer.write_all(&header.encode()).await.unwrap();
    peer.writer.write_all(partial).await.unwrap();
    peer.writer.flush().await.unwrap();
}

async fn wait_unregistered(server: &RelayServer, id: &PeerId) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if !server.is_registered(id).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_sender_lost_mid_payload_closes_target() {
    init_tracing();
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let mut a = RawPeer::register(&url, &key(20)).await;
    let mut b = RawPeer::register(&url, &key(21)).await;
    let mut c = RawPeer::register(&url, &key(22)).await;
    let c_id = c.id;
    assert!(wait_sessions(&server, 3, WAIT).await);

    send_truncated(&mut a, c_id, 100, &[0xEE; 10]).await;
    drop(a);

    // C holds a header it can never complete; the broker must hang up on it
    // rather than splice the next frame into that payload.
    assert!(c.recv_within(WAIT).await.is_none());
    assert!(wait_unregistered(&server, &c_id).await);

    let mut c = RawPeer::register(&url, &key(22)).await;
    assert!(wait_registered(&server, &c_id, WAIT).await);
    b.send(Command::Forward, c_id, b"intact").await;
    let (header, payload) = c.recv_within(WAIT).await.expect("frame from B");
    assert_eq!(header.from, b.id);
    assert_eq!(payload, b"intact");
}

#[tokio::test]
async fn test_sender_stalled_mid_payload_hits_idle_deadline() {
    let (server, url) = spawn_relay(RelayServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    let mut a = RawPeer::register(&url, &key(23)).await;
    let mut b = RawPeer::register(&url, &key(24)).await;
    let c = RawPeer::register(&url, &key(25)).await;
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);
    assert!(wait_sessions(&server, 3, WAIT).await);

    send_truncated(&mut a, c_id, 100, &[0xEE; 10]).await;
    // B queues behind A's copy to C, then addresses itself
    b.send(Command::Forward, c_id, b"behind the stall").await;
    b.send(Command::Forward, b_id, b"still moving").await;

    assert!(wait_unregistered(&server, &a_id).await, "stalled sender must be closed");
    let (header, payload) = b.recv_within(WAIT).await.expect("B's own frame");
    assert_eq!(header.to, b_id);
    assert_eq!(payload, b"still moving");
    drop(c);
}

#[tokio::test]
async fn test_stalled_drain_hits_idle_deadline() {
    let (server, url) = spawn_relay(RelayServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    let mut a = RawPeer::register(&url, &key(26)).await;
    let a_id = a.id;
    assert!(wait_registered(&server, &a_id, WAIT).await);

    // No session for the target, so the broker drains what never arrives
    send_truncated(&mut a, PeerId::from_u64(404), 100, &[0xEE; 10]).await;
    assert!(wait_unregistered(&server, &a_id).await);
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn test_idle_session_closed() {
    let (server, url) = spawn_relay(RelayServerConfig {
        idle_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let mut silent = RawPeer::register(&url, &key(13)).await;
    assert!(silent.recv_within(WAIT).await.is_none(), "idle session must be closed");
    assert!(wait_sessions(&server, 0, WAIT).await);
}

#[tokio::test]
async fn test_keepalive_holds_session_open() {
    let (server, url) = spawn_relay(RelayServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let client = RelayClient::connect(
        &url,
        &key(14),
        RelayClientConfig {
            keepalive_interval: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(server.is_registered(&client.local_id()).await);
    assert!(!client.is_closed());
    client.close().await;
}

// ============================================================================
// Relay Transport
// ============================================================================

#[tokio::test]
async fn test_relay_transports_exchange_packets() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(15), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(&url, &key(16), RelayClientConfig::default()).await.unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    let ta = a.transport(b.local_id());
    let tb = b.transport(a.local_id());

    ta.write(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(WAIT, tb.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    tb.write(b"pong").await.unwrap();
    let n = tokio::time::timeout(WAIT, ta.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_closed_transport_releases_mailbox() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(17), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(&url, &key(18), RelayClientConfig::default()).await.unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    let old = Arc::new(b.transport(a.local_id()));
    let reader = {
        let old = old.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            old.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    old.close().await.unwrap();
    assert!(old.is_closed());
    let pending = tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();
    assert!(pending.is_err(), "pending read must end on close");

    let fresh = b.transport(a.local_id());
    a.transport(b.local_id()).write(b"again").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, fresh.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"again");
}

#[tokio::test]
async fn test_oversized_relay_packet_skipped() {
    let (server, url) = spawn_relay(RelayServerConfig::default()).await;
    let a = RelayClient::connect(&url, &key(29), RelayClientConfig::default()).await.unwrap();
    let b = RelayClient::connect(&url, &key(30), RelayClientConfig::default()).await.unwrap();
    assert!(wait_sessions(&server, 2, WAIT).await);

    let ta = a.transport(b.local_id());
    let tb = b.transport(a.local_id());
    ta.write(&[0x55; 100]).await.unwrap();
    ta.write(b"tiny").await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, tb.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"tiny");
}
