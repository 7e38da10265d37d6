//! Relay end to end over loopback TCP

use blind_relay_core::{PairingId, Relay, RelayConfig, RelayEvent, RelayServer};
use blind_relay_net::{connect, FramedStream, KeyPair, TcpRelayListener, TransportConfig};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

struct Harness {
    server: RelayServer<FramedStream>,
    addr: SocketAddr,
    relay_key: [u8; 32],
    events: broadcast::Receiver<RelayEvent>,
}

async fn start(pairing_timeout: Duration) -> Harness {
    let listener = TcpRelayListener::bind(
        "127.0.0.1:0",
        KeyPair::generate(),
        TransportConfig::default(),
    )
    .await
    .unwrap();
    let addr = listener.local_addr();
    let relay_key = listener.public_key();

    let relay = Relay::new(RelayConfig::default().with_pairing_timeout(pairing_timeout));
    let events = relay.subscribe();
    let server = RelayServer::start(listener, relay);

    Harness {
        server,
        addr,
        relay_key,
        events,
    }
}

impl Harness {
    async fn connect(&self, key: u8) -> FramedStream {
        connect(self.addr, PairingId([key; 32]), Some(&self.relay_key))
            .await
            .unwrap()
    }

    async fn wait_for<F: Fn(&RelayEvent) -> bool>(&mut self, pred: F) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not observed")
    }

    /// Connect two peers on `key` and wait until they are paired
    async fn pair(&mut self, key: u8) -> (FramedStream, FramedStream) {
        let a = self.connect(key).await;
        self.wait_for(|e| matches!(e, RelayEvent::Waiting { .. }))
            .await;
        let b = self.connect(key).await;
        self.wait_for(|e| matches!(e, RelayEvent::Paired { .. }))
            .await;
        (a, b)
    }
}

#[tokio::test]
async fn test_ping_pong_over_tcp() {
    let mut h = start(Duration::from_secs(5)).await;
    let (mut a, mut b) = h.pair(2).await;
    assert_eq!(h.server.active_sessions(), 1);

    a.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(&b.next().await.unwrap().unwrap()[..], b"ping");
    b.send(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(&a.next().await.unwrap().unwrap()[..], b"pong");

    h.server.close().await;
}

#[tokio::test]
async fn test_large_transfer_is_lossless() {
    let mut h = start(Duration::from_secs(5)).await;
    let (mut a, mut b) = h.pair(3).await;

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<Bytes> = payload
        .chunks(300_000)
        .map(Bytes::copy_from_slice)
        .chain(std::iter::once(Bytes::new()))
        .collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        for chunk in chunks {
            a.send(chunk).await.unwrap();
        }
        a.close().await.unwrap();
    });

    let mut received = Vec::with_capacity(expected.len());
    while let Some(frame) = b.next().await {
        received.extend_from_slice(&frame.unwrap());
    }
    writer.await.unwrap();

    assert_eq!(received, expected);
    h.server.close().await;
}

#[tokio::test]
async fn test_third_connection_rejected_pair_unaffected() {
    let mut h = start(Duration::from_secs(5)).await;
    let (mut a, mut b) = h.pair(4).await;

    let mut c = h.connect(4).await;
    h.wait_for(|e| matches!(e, RelayEvent::Rejected { reason: "duplicate_pairing", .. }))
        .await;
    assert!(c.next().await.is_none());

    b.send(Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(&a.next().await.unwrap().unwrap()[..], b"after");
    assert_eq!(h.server.active_sessions(), 1);

    h.server.close().await;
}

#[tokio::test]
async fn test_unpaired_connection_times_out() {
    let mut h = start(Duration::from_millis(100)).await;

    let mut lone = h.connect(5).await;
    h.wait_for(|e| matches!(e, RelayEvent::Expired { .. })).await;
    assert!(lone.next().await.is_none());
    assert_eq!(h.server.relay().pending_sessions(), 0);

    h.server.close().await;
}

#[tokio::test]
async fn test_waiting_initiator_disconnect_is_noticed() {
    let mut h = start(Duration::from_secs(30)).await;

    let lone = h.connect(8).await;
    h.wait_for(|e| matches!(e, RelayEvent::Waiting { .. })).await;
    assert_eq!(h.server.relay().pending_sessions(), 1);

    drop(lone);
    h.wait_for(|e| matches!(e, RelayEvent::Abandoned { .. })).await;
    assert_eq!(h.server.relay().pending_sessions(), 0);

    // A later pair on the same identifier still works
    let (mut a, mut b) = h.pair(8).await;
    a.send(Bytes::from_static(b"fresh")).await.unwrap();
    assert_eq!(&b.next().await.unwrap().unwrap()[..], b"fresh");

    h.server.close().await;
}

#[tokio::test]
async fn test_disconnect_closes_peer() {
    let mut h = start(Duration::from_secs(5)).await;
    let (a, mut b) = h.pair(6).await;

    drop(a);
    h.wait_for(|e| matches!(e, RelayEvent::Closed { .. })).await;

    let next = tokio::time::timeout(Duration::from_secs(2), b.next())
        .await
        .expect("peer not closed in time");
    assert!(!matches!(next, Some(Ok(_))));
    assert_eq!(h.server.active_sessions(), 0);

    h.server.close().await;
}

#[tokio::test]
async fn test_bad_handshake_does_not_stop_server() {
    let mut h = start(Duration::from_secs(5)).await;

    let mut junk = TcpStream::connect(h.addr).await.unwrap();
    junk.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await.unwrap();
    drop(junk);

    let (mut a, mut b) = h.pair(7).await;
    a.send(Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(&b.next().await.unwrap().unwrap()[..], b"ok");

    h.server.close().await;
}
