//! # Integration tests: Connection over real loopback UDP sockets.
//!
//! Unlike the sender/receiver buffer unit tests, these exercise the full
//! stack — handshake, wire encode/decode, and the background tasks — end to
//! end over the OS network stack rather than in-process Bytes passing.

use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use quantum_transport::{Connection, QuantumConfig};

static TRACING_INIT: Once = Once::new();

/// Installs a `fmt` subscriber driven by `RUST_LOG`, once per test binary.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn connected_pair(config: QuantumConfig) -> (Connection, Connection) {
    init_tracing();
    let probe = quantum_transport::io::DatagramIo::bind(
        "127.0.0.1:0".parse().unwrap(),
        &config.transport,
    )
    .await
    .unwrap();
    let listen_addr = probe.local_addr().unwrap();
    drop(probe);

    let server_cfg = config.clone();
    let server_task = tokio::spawn(async move { Connection::listen(listen_addr, server_cfg).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let client = Connection::dial(listen_addr, config)
        .await
        .expect("dial should complete the handshake");
    let server = server_task
        .await
        .expect("listen task joins")
        .expect("listen should complete the handshake");

    (client, server)
}

// ─── Handshake ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_establishes_both_ends_with_shared_connection_id() {
    let (client, server) = connected_pair(QuantumConfig::default()).await;
    assert_eq!(client.id(), server.id());
    assert_eq!(client.remote_addr(), server.local_addr());
    client.close().await;
    server.close().await;
}

// ─── Data transfer ──────────────────────────────────────────────────────────

#[tokio::test]
async fn single_payload_round_trips() {
    let (client, server) = connected_pair(QuantumConfig::default()).await;

    client.send(Bytes::from_static(b"hello quantum")).await.unwrap();
    let received = server
        .receive_with_timeout(Duration::from_secs(2))
        .await
        .expect("payload should arrive");
    assert_eq!(&received[..], b"hello quantum");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn multiple_payloads_deliver_in_order() {
    let (client, server) = connected_pair(QuantumConfig::default()).await;

    for i in 0u8..20 {
        client.send(Bytes::from(vec![i; 8])).await.unwrap();
    }

    for i in 0u8..20 {
        let payload = server
            .receive_with_timeout(Duration::from_secs(2))
            .await
            .unwrap_or_else(|_| panic!("payload {i} should arrive"));
        assert_eq!(&payload[..], &vec![i; 8][..]);
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn statistics_reflect_sent_and_received_counts() {
    let (client, server) = connected_pair(QuantumConfig::default()).await;

    for _ in 0..5 {
        client.send(Bytes::from_static(b"stat-probe")).await.unwrap();
    }
    for _ in 0..5 {
        server.receive_with_timeout(Duration::from_secs(2)).await.unwrap();
    }

    let client_stats = client.statistics().await;
    assert!(client_stats.packets_sent >= 5);

    let server_stats = server.statistics().await;
    assert!(server_stats.packets_received >= 5);

    client.close().await;
    server.close().await;
}

// ─── Close ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent_and_unblocks_receivers() {
    let (client, server) = connected_pair(QuantumConfig::default()).await;

    client.close().await;
    client.close().await; // must not panic or hang

    // The server side should observe the FIN and its own receive() should
    // resolve to ConnectionClosed purely from that, with no local close().
    assert_eq!(
        server.receive_with_timeout(Duration::from_millis(500)).await,
        Err(quantum_transport::ReceiveError::ConnectionClosed)
    );
    server.close().await;

    assert_eq!(
        client.send(Bytes::from_static(b"after close")).await,
        Err(quantum_transport::SendError::ConnectionClosed)
    );
}
