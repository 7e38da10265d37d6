//! Pairing identifiers

use serde::{Deserialize, Serialize};

/// Length of a pairing identifier in bytes
pub const PAIRING_ID_LEN: usize = 32;

/// Opaque value two peers present to be matched into the same session
///
/// Usually the target peer's public key. The relay only ever compares
/// identifiers for equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairingId(pub [u8; PAIRING_ID_LEN]);

impl PairingId {
    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; PAIRING_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for PairingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for PairingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PairingId({})", self)
    }
}
