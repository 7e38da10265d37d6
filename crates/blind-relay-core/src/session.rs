//! Forwarding pipe for a paired session
//!
//! Each direction reads one frame and writes it to the other side, and only
//! reads the next frame once that write (including the flush) completed.
//! A slow reader therefore stalls the writer on the far side instead of
//! piling frames up in memory.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::FramedConnection;

/// Which side of a session a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Arrived first and waited
    Initiator,
    /// Arrived second and completed the pair
    Responder,
}

/// Forwarding direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitiatorToResponder => write!(f, "initiator->responder"),
            Self::ResponderToInitiator => write!(f, "responder->initiator"),
        }
    }
}

/// Why a paired session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The source side of this direction reached end of stream
    Ended(Direction),
    /// Reading or writing in this direction failed
    Failed(Direction),
    /// Relay shutdown or administrative release
    Shutdown,
}

/// Traffic counters for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub frames: u64,
    pub bytes: u64,
}

/// Traffic counters for a whole session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub initiator_to_responder: DirectionStats,
    pub responder_to_initiator: DirectionStats,
}

impl PipeStats {
    pub fn total_frames(&self) -> u64 {
        self.initiator_to_responder.frames + self.responder_to_initiator.frames
    }

    pub fn total_bytes(&self) -> u64 {
        self.initiator_to_responder.bytes + self.responder_to_initiator.bytes
    }
}

/// Result of running a pipe to completion
#[derive(Debug)]
pub struct PipeOutcome {
    pub reason: CloseReason,
    /// Set when `reason` is `Failed`
    pub error: Option<io::Error>,
    pub stats: PipeStats,
}

/// Copy frames from `src` to `dst` until `src` ends or either side fails
///
/// `first` is a frame already taken from `src` and is delivered before
/// anything else.
async fn forward<R, W>(
    src: &mut R,
    dst: &mut W,
    first: Option<Bytes>,
    counters: &mut DirectionStats,
) -> io::Result<()>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    if let Some(frame) = first {
        deliver(dst, frame, counters).await?;
    }
    while let Some(frame) = src.next().await {
        deliver(dst, frame?.freeze(), counters).await?;
    }
    Ok(())
}

async fn deliver<W>(dst: &mut W, frame: Bytes, counters: &mut DirectionStats) -> io::Result<()>
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let len = frame.len() as u64;
    dst.send(frame).await?;
    counters.frames += 1;
    counters.bytes += len;
    Ok(())
}

/// Close a sink, giving up after `timeout`
async fn close_sink<W>(mut sink: W, timeout: Duration)
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    match tokio::time::timeout(timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Error closing relay leg: {}", e),
        Err(_) => trace!("Timed out closing relay leg"),
    }
}

/// Forward frames both ways between two connections
///
/// Runs until the first end of stream or I/O failure in either direction,
/// or until `cancel` fires. Both connections are closed before returning.
/// `early` is a frame the initiator sent while it was still waiting.
pub async fn pipe<C: FramedConnection>(
    initiator: C,
    responder: C,
    early: Option<Bytes>,
    cancel: CancellationToken,
    close_timeout: Duration,
) -> PipeOutcome {
    let (mut initiator_tx, mut initiator_rx) = initiator.split();
    let (mut responder_tx, mut responder_rx) = responder.split();
    let mut stats = PipeStats::default();

    let (reason, error) = {
        let upstream = forward(
            &mut initiator_rx,
            &mut responder_tx,
            early,
            &mut stats.initiator_to_responder,
        );
        let downstream = forward(
            &mut responder_rx,
            &mut initiator_tx,
            None,
            &mut stats.responder_to_initiator,
        );

        tokio::select! {
            res = upstream => settle(Direction::InitiatorToResponder, res),
            res = downstream => settle(Direction::ResponderToInitiator, res),
            _ = cancel.cancelled() => (CloseReason::Shutdown, None),
        }
    };

    tokio::join!(
        close_sink(initiator_tx, close_timeout),
        close_sink(responder_tx, close_timeout),
    );

    PipeOutcome {
        reason,
        error,
        stats,
    }
}

fn settle(direction: Direction, res: io::Result<()>) -> (CloseReason, Option<io::Error>) {
    match res {
        Ok(()) => (CloseReason::Ended(direction), None),
        Err(e) => (CloseReason::Failed(direction), Some(e)),
    }
}
