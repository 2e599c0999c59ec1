//! Integration tests for the traversal fallbacks: the punched path when
//! direct dialing is starved, relayed circuits when punching cannot work,
//! and stream independence on an established circuit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use passage::nat::NatClass;
use passage::{Config, Keypair, Node};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(45000);

fn next_addr() -> SocketAddr {
    let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("127.0.0.1:{port}").parse().unwrap()
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A relay that also serves directory lookups, standing in for public
/// infrastructure.
async fn start_relay() -> (Arc<Node>, SocketAddr) {
    let addr = next_addr();
    let node = Node::start(Keypair::generate(), Config {
        listen_addr: addr,
        serve_relay: true,
        serve_directory: true,
        ..Config::default()
    })
    .await
    .expect("relay failed to start");
    (node, addr)
}

fn spawn_echo(node: Arc<Node>) {
    tokio::spawn(async move {
        while let Some(mut stream) = node.accept_stream().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(Some(n)) = stream.recv.read(&mut buf).await {
                    if stream.send.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = stream.send.finish();
            });
        }
    });
}

async fn echo_roundtrip(conn: &passage::Connection, tag: &str, payload: &[u8]) -> Vec<u8> {
    let (mut send, mut recv) = conn.open_stream(tag).await.expect("open_stream failed");
    send.write_all(payload).await.expect("write failed");
    send.finish().expect("finish failed");
    recv.read_to_end(4096).await.expect("echo read failed")
}

#[tokio::test]
async fn circuit_fallback_with_independent_streams() {
    let (relay, relay_addr) = start_relay().await;

    // The listener registers with the relay; both sides claim symmetric
    // NAT so punching is ruled out before a single probe.
    let b = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        relay_addr: Some(relay_addr),
        directory_peers: vec![(relay.identity(), relay_addr)],
        nat_class_override: Some(NatClass::Symmetric),
        ..Config::default()
    })
    .await
    .expect("listener failed to start");
    b.connect_relay().await.expect("relay registration failed");
    b.announce().await.expect("announce failed");
    spawn_echo(Arc::clone(&b));

    // Direct dials get no time budget, so the engine has to fall through
    // to the relay.
    let a = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        relay_addr: Some(relay_addr),
        directory_peers: vec![(relay.identity(), relay_addr)],
        nat_class_override: Some(NatClass::Symmetric),
        dial_timeout: Duration::from_nanos(1),
        ..Config::default()
    })
    .await
    .expect("dialer failed to start");

    let conn = timeout(TEST_TIMEOUT, a.connect(b.identity()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(conn.path(), "relayed");
    assert_eq!(conn.remote_identity(), b.identity());

    // Two streams on the same circuit; finishing the first must leave
    // the second (and the circuit itself) fully usable.
    let first = echo_roundtrip(&conn, "first", b"opening salvo").await;
    assert_eq!(first, b"opening salvo");

    let second = echo_roundtrip(&conn, "second", b"still here").await;
    assert_eq!(second, b"still here");

    conn.ping().await.expect("ping over circuit failed");

    conn.close();
    a.shutdown().await;
    b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn punched_path_when_direct_dials_are_starved() {
    let (relay, relay_addr) = start_relay().await;

    // Cone NAT on both sides keeps punching viable; registering with the
    // relay gives each node an echo-verified external candidate to offer.
    let b = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        relay_addr: Some(relay_addr),
        directory_peers: vec![(relay.identity(), relay_addr)],
        nat_class_override: Some(NatClass::RestrictedCone),
        ..Config::default()
    })
    .await
    .expect("listener failed to start");
    b.connect_relay().await.expect("relay registration failed");
    b.announce().await.expect("announce failed");
    spawn_echo(Arc::clone(&b));

    // Direct dials get no time budget; with both NATs cone-class the
    // engine must reach the peer through the punch exchange instead of
    // falling all the way to a circuit.
    let a = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        relay_addr: Some(relay_addr),
        directory_peers: vec![(relay.identity(), relay_addr)],
        nat_class_override: Some(NatClass::RestrictedCone),
        dial_timeout: Duration::from_nanos(1),
        ..Config::default()
    })
    .await
    .expect("dialer failed to start");
    a.connect_relay().await.expect("relay registration failed");

    let conn = timeout(TEST_TIMEOUT, a.connect(b.identity()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(conn.path(), "punched");
    assert_eq!(conn.remote_identity(), b.identity());

    let echoed = echo_roundtrip(&conn, "after-punch", b"through the mapping").await;
    assert_eq!(echoed, b"through the mapping");

    conn.close();
    a.shutdown().await;
    b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn circuit_to_unregistered_peer_is_rejected() {
    let (relay, relay_addr) = start_relay().await;

    // The target never registers with the relay, so signaling cannot
    // reach it and the relay phase is rejected cleanly.
    let b = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        ..Config::default()
    })
    .await
    .expect("listener failed to start");

    let a = Node::start(Keypair::generate(), Config {
        listen_addr: next_addr(),
        relay_addr: Some(relay_addr),
        nat_class_override: Some(NatClass::Symmetric),
        dial_timeout: Duration::from_millis(200),
        resolve_timeout: Duration::from_secs(2),
        ..Config::default()
    })
    .await
    .expect("dialer failed to start");

    let err = timeout(TEST_TIMEOUT, a.connect(b.identity()))
        .await
        .expect("connect timed out")
        .expect_err("connect should fail");
    let msg = err.to_string();
    assert!(
        msg.contains("not registered") || msg.contains("no direct addresses"),
        "unexpected failure: {msg}"
    );

    a.shutdown().await;
    b.shutdown().await;
    relay.shutdown().await;
}
