//! Error types for the relay engine

use crate::id::PairingId;
use crate::session::Direction;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// A third connection arrived for an identifier that is already paired
    #[error("duplicate pairing for {0}")]
    DuplicatePairing(PairingId),

    /// No peer arrived within the waiting window
    #[error("pairing timed out for {0}")]
    PairingTimeout(PairingId),

    /// I/O failed on one leg of an active pair
    #[error("forwarding failed for {id} ({direction}): {source}")]
    Forwarding {
        id: PairingId,
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    /// Session table is full
    #[error("session capacity exhausted ({max} sessions)")]
    CapacityExhausted { max: usize },

    /// Relay is shutting down
    #[error("relay closed")]
    Closed,
}

impl RelayError {
    /// Short label used for events and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicatePairing(_) => "duplicate_pairing",
            Self::PairingTimeout(_) => "pairing_timeout",
            Self::Forwarding { .. } => "forwarding_error",
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::Closed => "closed",
        }
    }
}
