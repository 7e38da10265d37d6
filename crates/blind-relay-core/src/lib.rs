//! Blind Relay Core Library
//!
//! This crate pairs inbound framed connections that present the same
//! pairing identifier and forwards frames between them without ever
//! looking at the payload.
//!
//! # Modules
//!
//! - [`registry`]: Concurrent create-or-join session table
//! - [`session`]: Bidirectional forwarding pipe for a paired session
//! - [`relay`]: Pairing and forwarding engine
//! - [`server`]: Facade binding the engine to an inbound connection source
//! - [`stats`]: Aggregate counters and lifecycle events
//! - [`error`]: Error types

pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;

pub use config::RelayConfig;
pub use connection::FramedConnection;
pub use error::{RelayError, Result};
pub use id::PairingId;
pub use registry::{Join, Pairing, Rejected, SessionRegistry, Waiter};
pub use relay::{Relay, SessionReport};
pub use server::{Inbound, Listener, RelayServer, TransportError};
pub use session::{CloseReason, Direction, PipeStats, Role};
pub use stats::{RelayEvent, RelayStats};
