//! Networking primitives for the blind relay
//!
//! This crate provides:
//! - Relay keypair management
//! - Length-prefixed message framing
//! - The hello handshake that declares a pairing identifier
//! - A TCP transport implementing the core `Listener` capability

pub mod crypto;
pub mod framing;
pub mod handshake;
pub mod transport;

pub use crypto::KeyPair;
pub use framing::{FrameCodec, FramedStream};
pub use handshake::{Hello, PROTOCOL_VERSION};
pub use transport::{connect, TcpRelayListener, TransportConfig};
