//! Integration tests for relay hardening features
//!
//! Tests for:
//! - Admission control on the pending registry
//! - Waiting-for-peer expiry
//! - Recovery from handshake floods and malformed input

use rand::{Rng, RngCore};
use std::time::Duration;
use tether_integration_tests::fixtures::RelayFixture;
use tether_relay::{RegistrySnapshot, RelayConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("relay did not close the connection");
    assert!(matches!(result, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_admission_limit_closes_excess_connections() {
    let config = RelayConfig {
        max_pending: Some(3),
        handshake_timeout: Duration::from_millis(300),
        ..RelayFixture::test_config()
    };
    let fixture = RelayFixture::with_config(config, 4).await.unwrap();

    let _first = fixture.connect(0, b"held").await.unwrap();
    let _second = fixture.connect(1, b"held").await.unwrap();
    let mut silent = TcpStream::connect(fixture.addr).await.unwrap();
    fixture.wait_for(|s| s.pending == 3).await;

    let mut excess = TcpStream::connect(fixture.addr).await.unwrap();
    assert_closed(&mut excess).await;
    assert_eq!(fixture.stats().rejected, 1);

    // The silent connection times out and frees its slot
    assert_closed(&mut silent).await;
    fixture.wait_for(|s| s.pending == 2).await;

    let _peer = fixture.connect(0, b"held").await.unwrap();
    fixture.wait_for(|s| s.pending == 1 && s.active == 1).await;
    assert_eq!(fixture.stats().rejected, 1);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_waiting_connection_expires() {
    let config = RelayConfig {
        peer_wait_timeout: Some(Duration::from_millis(150)),
        idle_sweep_interval: Duration::from_millis(50),
        ..RelayFixture::test_config()
    };
    let fixture = RelayFixture::with_config(config, 2).await.unwrap();

    let mut lonely = fixture.connect(30, b"nobody-comes").await.unwrap();
    fixture.wait_for(|s| s.waiting_for_peer == 1).await;

    assert_closed(&mut lonely).await;
    fixture.wait_for(RegistrySnapshot::is_empty).await;
    assert_eq!(fixture.stats().peer_wait_expired, 1);

    // A late peer waits on its own instead of matching the expired one
    let _late = fixture.connect(30, b"nobody-comes").await.unwrap();
    let snapshot = fixture.wait_for(|s| s.waiting_for_peer == 1).await;
    assert_eq!(snapshot.active, 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_disabled_peer_wait_keeps_connection() {
    let config = RelayConfig {
        peer_wait_timeout: None,
        idle_sweep_interval: Duration::from_millis(20),
        ..RelayFixture::test_config()
    };
    let fixture = RelayFixture::with_config(config, 2).await.unwrap();

    let _patient = fixture.connect(31, b"patient").await.unwrap();
    fixture.wait_for(|s| s.waiting_for_peer == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = fixture.snapshot().await;
    assert_eq!(snapshot.waiting_for_peer, 1);
    assert_eq!(fixture.stats().peer_wait_expired, 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_handshake_flood_recovers() {
    let config = RelayConfig {
        handshake_timeout: Duration::from_millis(500),
        ..RelayFixture::test_config()
    };
    let fixture = RelayFixture::with_config(config, 4).await.unwrap();
    const FLOOD: usize = 32;

    let mut silent = Vec::with_capacity(FLOOD);
    for _ in 0..FLOOD {
        silent.push(TcpStream::connect(fixture.addr).await.unwrap());
    }
    fixture.wait_for(|s| s.pending == FLOOD).await;

    fixture.wait_for(RegistrySnapshot::is_empty).await;
    assert_eq!(fixture.stats().handshakes_failed, FLOOD as u64);
    for stream in &mut silent {
        assert_closed(stream).await;
    }

    let (mut a, mut b) = fixture.connect_pair(1, b"after-flood").await.unwrap();
    a.write_all(b"still serving").await.unwrap();
    let mut buf = [0u8; 13];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still serving");

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_random_garbage_never_pairs() {
    let fixture = RelayFixture::new().await.unwrap();
    let mut rng = rand::thread_rng();

    let mut streams = Vec::new();
    for _ in 0..16 {
        let len = rng.gen_range(1..=1024u32);
        let mut bytes = len.to_be_bytes().to_vec();
        let mut body = vec![0u8; len as usize];
        rng.fill_bytes(&mut body);
        // 0xFF is not a valid varint tag
        body[0] = 0xFF;
        bytes.extend_from_slice(&body);
        streams.push(fixture.connect_raw(&bytes).await.unwrap());
    }

    for stream in &mut streams {
        assert_closed(stream).await;
    }
    fixture.wait_for(RegistrySnapshot::is_empty).await;
    assert_eq!(fixture.stats().handshakes_failed, 16);
    assert_eq!(fixture.stats().pairs_formed, 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_dropping_handle_stops_relay() {
    let fixture = RelayFixture::new().await.unwrap();
    let addr = fixture.addr;
    let mut waiting = fixture.connect(40, b"orphan").await.unwrap();
    fixture.wait_for(|s| s.waiting_for_peer == 1).await;

    drop(fixture);

    assert_closed(&mut waiting).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_err() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "listener still open");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
