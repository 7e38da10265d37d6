//! Server facade
//!
//! Binds the engine to an inbound connection source. Every connection the
//! transport hands over, together with the pairing identifier its peer
//! declared during the transport handshake, is run as its own task.

use crate::connection::FramedConnection;
use crate::error::RelayError;
use crate::id::PairingId;
use crate::relay::Relay;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failures at the transport boundary
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Listener closed")]
    Closed,
}

/// A connection accepted by the transport
pub struct Inbound<C> {
    /// Pairing identifier declared by the remote peer
    pub id: PairingId,
    pub conn: C,
    /// Remote address, if the transport has one
    pub remote: Option<SocketAddr>,
}

/// Source of inbound framed connections
#[async_trait]
pub trait Listener: Send + 'static {
    type Conn: FramedConnection;

    /// Wait for the next connection whose handshake completed
    ///
    /// `TransportError::Closed` ends the accept loop; any other error only
    /// abandons that one connection attempt.
    async fn accept(&mut self) -> Result<Inbound<Self::Conn>, TransportError>;
}

/// Relay server bound to a listener
pub struct RelayServer<C> {
    relay: Relay<C>,
    stop: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<C: FramedConnection> RelayServer<C> {
    /// Start accepting connections from `listener` on a background task
    pub fn start<L>(listener: L, relay: Relay<C>) -> Self
    where
        L: Listener<Conn = C>,
    {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(listener, relay.clone(), stop.clone()));

        Self {
            relay,
            stop,
            accept_loop: Mutex::new(Some(handle)),
        }
    }

    /// The engine behind this server
    pub fn relay(&self) -> &Relay<C> {
        &self.relay
    }

    /// Number of paired sessions
    pub fn active_sessions(&self) -> usize {
        self.relay.active_sessions()
    }

    /// Stop accepting, then close every session
    ///
    /// Resolves once no session remains and every connection was released.
    pub async fn close(&self) {
        self.stop.cancel();
        let handle = self.accept_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        self.relay.close().await;
        info!("Relay server closed");
    }
}

async fn accept_loop<L: Listener>(mut listener: L, relay: Relay<L::Conn>, stop: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok(Inbound { id, conn, remote }) => {
                debug!("Inbound connection for {} from {:?}", id, remote);
                let session = relay.spawn_accept(id, conn);
                tokio::spawn(async move {
                    match session.await {
                        Ok(Ok(report)) => debug!("Session task for {} done: {:?}", id, report.role),
                        Ok(Err(e @ RelayError::CapacityExhausted { .. })) => {
                            error!("Connection for {} dropped: {}", id, e)
                        }
                        Ok(Err(e)) => debug!("Session task for {} ended: {}", id, e),
                        Err(e) => error!("Session task for {} panicked: {}", id, e),
                    }
                });
            }
            Err(TransportError::Closed) => {
                warn!("Listener closed, no longer accepting connections");
                break;
            }
            Err(e) => warn!("Transport error: {}", e),
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::stats::RelayEvent;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    type Conn = Framed<DuplexStream, LengthDelimitedCodec>;

    /// Listener fed from a channel
    struct ChannelListener {
        rx: mpsc::Receiver<Result<Inbound<Conn>, TransportError>>,
    }

    #[async_trait]
    impl Listener for ChannelListener {
        type Conn = Conn;

        async fn accept(&mut self) -> Result<Inbound<Conn>, TransportError> {
            self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
        }
    }

    type Feed = mpsc::Sender<Result<Inbound<Conn>, TransportError>>;

    fn server() -> (RelayServer<Conn>, Feed) {
        let (tx, rx) = mpsc::channel(16);
        let relay = Relay::new(RelayConfig::default());
        (RelayServer::start(ChannelListener { rx }, relay), tx)
    }

    async fn connect(feed: &Feed, key: u8) -> Conn {
        let (relay_end, peer_end) = duplex(64 * 1024);
        feed.send(Ok(Inbound {
            id: PairingId([key; 32]),
            conn: Framed::new(relay_end, LengthDelimitedCodec::new()),
            remote: None,
        }))
        .await
        .unwrap();
        Framed::new(peer_end, LengthDelimitedCodec::new())
    }

    async fn wait_paired(events: &mut tokio::sync::broadcast::Receiver<RelayEvent>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(events.recv().await, Ok(RelayEvent::Paired { .. })) {}
        })
        .await
        .expect("pair not formed");
    }

    #[tokio::test]
    async fn test_server_pairs_inbound_connections() {
        let (server, feed) = server();
        let mut events = server.relay().subscribe();

        let mut a = connect(&feed, 1).await;
        let mut b = connect(&feed, 1).await;
        wait_paired(&mut events).await;
        assert_eq!(server.active_sessions(), 1);

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&b.next().await.unwrap().unwrap()[..], b"ping");
        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(&a.next().await.unwrap().unwrap()[..], b"pong");

        server.close().await;
    }

    #[tokio::test]
    async fn test_transport_errors_do_not_stop_accepting() {
        let (server, feed) = server();
        let mut events = server.relay().subscribe();

        feed.send(Err(TransportError::HandshakeTimeout)).await.unwrap();
        feed.send(Err(TransportError::Handshake("bad hello".into())))
            .await
            .unwrap();

        let _a = connect(&feed, 2).await;
        let _b = connect(&feed, 2).await;
        wait_paired(&mut events).await;
        assert_eq!(server.active_sessions(), 1);

        server.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_sessions() {
        let (server, feed) = server();
        let mut events = server.relay().subscribe();

        let mut waiting = connect(&feed, 3).await;
        let mut a = connect(&feed, 4).await;
        let mut b = connect(&feed, 4).await;
        wait_paired(&mut events).await;

        server.close().await;

        assert_eq!(server.active_sessions(), 0);
        assert!(server.relay().registry().is_empty());
        assert!(waiting.next().await.is_none());
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }
}
