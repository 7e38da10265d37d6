//! TCP transport
//!
//! Accepts TCP connections, runs the hello handshake on each one
//! concurrently and hands finished connections to the relay server through
//! the core `Listener` capability.

use crate::crypto::KeyPair;
use crate::framing::{FrameCodec, FramedStream, HANDSHAKE_MAX_FRAME_SIZE, MAX_FRAME_SIZE};
use crate::handshake::{HandshakeError, Hello, Welcome};
use async_trait::async_trait;
use blind_relay_core::{Inbound, Listener, PairingId, TransportError};
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Default bound on receiving the hello / welcome
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle time before TCP keepalive kicks in
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

impl From<HandshakeError> for TransportError {
    fn from(e: HandshakeError) -> Self {
        TransportError::Handshake(e.to_string())
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time a new connection has to send its hello
    pub handshake_timeout: Duration,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// Handshaken connections buffered before the server picks them up
    pub backlog: usize,
    /// TCP keepalive idle time (`None` leaves keepalive off)
    pub keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            backlog: 128,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }
}

type Accepted = Result<Inbound<FramedStream>, TransportError>;

/// Listening relay endpoint
pub struct TcpRelayListener {
    keypair: KeyPair,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Accepted>,
    accept_task: JoinHandle<()>,
}

impl TcpRelayListener {
    /// Bind and start accepting connections
    pub async fn bind(
        addr: impl ToSocketAddrs,
        keypair: KeyPair,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(config.backlog.max(1));

        let accept_task = tokio::spawn(accept_connections(
            listener,
            keypair.clone(),
            config,
            tx,
        ));
        info!("Relay transport listening on {}", local_addr);

        Ok(Self {
            keypair,
            local_addr,
            rx,
            accept_task,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the relay public key
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }
}

impl Drop for TcpRelayListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Listener for TcpRelayListener {
    type Conn = FramedStream;

    async fn accept(&mut self) -> Result<Inbound<FramedStream>, TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }
}

async fn accept_connections(
    listener: TcpListener,
    keypair: KeyPair,
    config: TransportConfig,
    tx: mpsc::Sender<Accepted>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                if tx.send(Err(TransportError::Io(e))).await.is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }

        debug!("Accepted connection from {}", addr);
        let tx = tx.clone();
        let keypair = keypair.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let result = handshake(stream, addr, &keypair, &config).await;
            if let Err(e) = &result {
                debug!("Handshake with {} failed: {}", addr, e);
            }
            // Dropped if the server stopped accepting
            let _ = tx.send(result).await;
        });
    }
    debug!("Transport accept loop stopped");
}

/// Disable Nagle and turn on keepalive so dead peers are eventually noticed
fn configure_stream(stream: &TcpStream, keepalive: Option<Duration>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(time) = keepalive {
        SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
    }
    Ok(())
}

/// Read the hello and answer with a signed welcome
///
/// Until the hello is in, frames are capped at `HANDSHAKE_MAX_FRAME_SIZE`.
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    keypair: &KeyPair,
    config: &TransportConfig,
) -> Accepted {
    configure_stream(&stream, config.keepalive)?;
    let codec = FrameCodec::with_max_frame_size(HANDSHAKE_MAX_FRAME_SIZE.min(config.max_frame_size));
    let mut framed = Framed::new(stream, codec);

    let frame = match tokio::time::timeout(config.handshake_timeout, framed.next()).await {
        Err(_) => return Err(TransportError::HandshakeTimeout),
        Ok(None) => {
            return Err(TransportError::Handshake(format!(
                "{} closed before hello",
                addr
            )))
        }
        Ok(Some(frame)) => frame?,
    };
    let hello = Hello::from_frame(&frame)?;
    framed.codec_mut().set_max_frame_size(config.max_frame_size);

    let welcome = Welcome::sign(keypair, &hello).to_frame()?;
    tokio::time::timeout(config.handshake_timeout, framed.send(welcome))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

    debug!("Peer {} declared pairing id {}", addr, hello.pairing_id);
    Ok(Inbound {
        id: hello.pairing_id,
        conn: framed,
        remote: Some(addr),
    })
}

/// Dial a relay and ask to be paired under `pairing_id`
///
/// If `relay_key` is given, the relay must prove it holds that key.
pub async fn connect(
    addr: impl ToSocketAddrs,
    pairing_id: PairingId,
    relay_key: Option<&[u8; 32]>,
) -> Result<FramedStream, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    configure_stream(&stream, Some(DEFAULT_KEEPALIVE))?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let hello = Hello::new(pairing_id);
    framed.send(hello.to_frame()?).await?;

    let frame = match tokio::time::timeout(DEFAULT_HANDSHAKE_TIMEOUT, framed.next()).await {
        Err(_) => return Err(TransportError::HandshakeTimeout),
        Ok(None) => {
            return Err(TransportError::Handshake(
                "relay closed during handshake".into(),
            ))
        }
        Ok(Some(frame)) => frame?,
    };
    let welcome = Welcome::from_frame(&frame)?;
    if let Err(e) = welcome.verify(&hello, relay_key) {
        warn!("Relay failed to authenticate: {}", e);
        return Err(e.into());
    }

    Ok(framed)
}
