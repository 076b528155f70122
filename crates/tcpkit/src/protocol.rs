//! The framing contract supplied by the embedding application.
//!
//! The core never looks inside a packet. It asks a [`Protocol`] for one
//! packet at a time from the socket's read half, and asks each outbound
//! [`Packet`] for its wire bytes.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncBufRead;

use crate::error::ProtocolError;

/// Byte source handed to [`Protocol::read_packet`].
///
/// The read task owns a buffered reader over the socket, so bytes buffered
/// past the end of one frame are still there for the next call.
pub trait PacketReader: AsyncBufRead + Unpin + Send {}
impl<T: AsyncBufRead + Unpin + Send> PacketReader for T {}

/// A unit that can be serialized for transmission.
pub trait Packet: Send + Sync + 'static {
    /// Serialize this packet into the exact bytes to put on the wire.
    fn pack(&self) -> Bytes;
}

/// Reads exactly one packet from a byte stream.
///
/// A single protocol value is shared by every connection of a server, so
/// implementations keep per-stream state in the reader, not in `self`.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// The packet type produced by this protocol and accepted for sending.
    type Packet: Packet;

    /// Wait until one full packet is available and return it.
    ///
    /// Any error is treated as terminal for the connection.
    async fn read_packet<R: PacketReader>(
        &self,
        reader: &mut R,
    ) -> Result<Self::Packet, ProtocolError>;
}

impl Packet for Bytes {
    fn pack(&self) -> Bytes {
        self.clone()
    }
}

impl Packet for String {
    fn pack(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}
