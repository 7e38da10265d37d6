//! Framed connection abstraction
//!
//! The transport hands the engine duplex connections that yield and accept
//! whole frames. The engine never looks inside a frame.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream};
use std::io;
use std::time::Duration;
use tracing::debug;

/// A duplex, message-framed connection supplied by the transport
///
/// Anything that is a `Stream` of inbound frames and a `Sink` of outbound
/// frames qualifies, e.g. `Framed<TcpStream, LengthDelimitedCodec>`.
pub trait FramedConnection:
    Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin + Send + 'static
{
}

impl<T> FramedConnection for T where
    T: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin + Send + 'static
{
}

/// Flush and close a connection, giving up after `timeout`
///
/// The connection is dropped afterwards either way, which releases the
/// underlying socket.
pub async fn close_connection<C: FramedConnection>(mut conn: C, timeout: Duration) {
    match tokio::time::timeout(timeout, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing connection: {}", e),
        Err(_) => debug!("Timed out closing connection"),
    }
}
