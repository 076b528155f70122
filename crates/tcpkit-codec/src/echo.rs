//! Length-prefixed binary framing
//!
//! Wire format (4 bytes overhead):
//! ```text
//! [u32 BE: body_len][body bytes]
//! ```

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tcpkit::{Packet, PacketReader, Protocol, ProtocolError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

/// Largest body accepted by [`EchoProtocol::default`] (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size
const HEADER_SIZE: usize = 4;

/// Largest body the length prefix can describe
const MAX_WIRE_BODY: usize = u32::MAX as usize;

/// An opaque binary body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    body: Bytes,
}

impl EchoPacket {
    /// Wrap a body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }

    /// The body, without the length prefix.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Wrap a body, refusing one whose length does not fit the 4-byte prefix.
    pub fn try_new(body: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let body = body.into();
        if body.len() > MAX_WIRE_BODY {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_WIRE_BODY,
            });
        }
        Ok(Self { body })
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns `true` for an empty body.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Take the body out.
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Prefix value for a body of `len` bytes, saturating at what 4 bytes hold.
fn wire_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Packet for EchoPacket {
    /// Bodies longer than `u32::MAX` bytes are cut to that length so the
    /// frame stays well formed; use [`EchoPacket::try_new`] to refuse them.
    fn pack(&self) -> Bytes {
        let len = wire_len(self.body.len());
        let body = &self.body[..len as usize];
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
        frame.put_u32(len);
        frame.put_slice(body);
        frame.freeze()
    }
}

/// Reads [`EchoPacket`]s.
#[derive(Debug, Clone)]
pub struct EchoProtocol {
    max_frame_size: usize,
}

impl EchoProtocol {
    /// Protocol with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Protocol that rejects bodies larger than `max_frame_size` bytes
    /// before allocating for them.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The body size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for EchoProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for EchoProtocol {
    type Packet = EchoPacket;

    async fn read_packet<R: PacketReader>(
        &self,
        reader: &mut R,
    ) -> Result<EchoPacket, ProtocolError> {
        // EOF on a frame boundary is a clean close
        if reader.fill_buf().await?.is_empty() {
            return Err(ProtocolError::Closed);
        }

        let len = reader.read_u32().await? as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut body = BytesMut::zeroed(len);
        reader.read_exact(&mut body).await?;
        Ok(EchoPacket::new(body.freeze()))
    }
}
