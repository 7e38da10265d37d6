//! Aggregate counters and lifecycle events

use crate::id::PairingId;
use crate::session::{CloseReason, PipeStats};

/// Relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Sessions created by a first connection
    pub sessions_opened: u64,
    /// Sessions that found their peer
    pub sessions_paired: u64,
    /// Paired sessions that have been torn down
    pub sessions_closed: u64,
    /// Third connections refused for an already paired identifier
    pub duplicate_rejections: u64,
    /// Waiting sessions that expired without a peer
    pub pairing_timeouts: u64,
    /// Initiators that disconnected before a peer arrived
    pub abandoned_waits: u64,
    /// Paired sessions torn down by an I/O failure
    pub forwarding_errors: u64,
    /// Connections refused because the session table was full
    pub capacity_rejections: u64,
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
}

/// Session lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// First connection parked for `id`
    Waiting { id: PairingId, session_id: u64 },
    /// Second connection arrived, forwarding starts
    Paired { id: PairingId, session_id: u64 },
    /// Waiting window elapsed without a peer
    Expired { id: PairingId, session_id: u64 },
    /// Initiator went away before a peer arrived
    Abandoned { id: PairingId, session_id: u64 },
    /// Paired session torn down
    Closed {
        id: PairingId,
        session_id: u64,
        reason: CloseReason,
        stats: PipeStats,
    },
    /// A connection was refused (`reason` is the error kind)
    Rejected { id: PairingId, reason: &'static str },
}
