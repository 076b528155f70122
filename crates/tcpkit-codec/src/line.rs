//! Newline-delimited text framing, as spoken by telnet-style clients

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tcpkit::{Packet, PacketReader, Protocol, ProtocolError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

/// Longest line accepted by [`LineProtocol::default`] (64 KiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// One line of UTF-8 text, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePacket {
    line: String,
}

impl LinePacket {
    /// Wrap a line. It must not contain a newline.
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// The line text.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Take the line out.
    pub fn into_string(self) -> String {
        self.line
    }
}

impl Packet for LinePacket {
    fn pack(&self) -> Bytes {
        let mut wire = String::with_capacity(self.line.len() + 2);
        wire.push_str(&self.line);
        wire.push_str("\r\n");
        Bytes::from(wire)
    }
}

impl From<&str> for LinePacket {
    fn from(line: &str) -> Self {
        Self::new(line)
    }
}

impl From<String> for LinePacket {
    fn from(line: String) -> Self {
        Self::new(line)
    }
}

impl fmt::Display for LinePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Reads [`LinePacket`]s terminated by `\n` or `\r\n`.
#[derive(Debug, Clone)]
pub struct LineProtocol {
    max_line_length: usize,
}

impl LineProtocol {
    /// Protocol with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Protocol that rejects lines longer than `max_line_length` bytes,
    /// terminator excluded.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self { max_line_length }
    }

    /// The line length limit.
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for LineProtocol {
    type Packet = LinePacket;

    async fn read_packet<R: PacketReader>(
        &self,
        reader: &mut R,
    ) -> Result<LinePacket, ProtocolError> {
        let max = self.max_line_length;
        // room for the line plus "\r\n"
        let limit = max.saturating_add(2);

        let mut buf = Vec::new();
        let read = (&mut *reader)
            .take(limit as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Err(ProtocolError::Closed);
        }

        if buf.last() != Some(&b'\n') {
            if buf.len() >= limit {
                return Err(ProtocolError::FrameTooLarge {
                    size: buf.len(),
                    max,
                });
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if buf.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: buf.len(),
                max,
            });
        }

        let line = String::from_utf8(buf)
            .map_err(|e| ProtocolError::Malformed(format!("line is not valid UTF-8: {e}")))?;
        Ok(LinePacket::new(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_appends_crlf() {
        assert_eq!(&LinePacket::from("ping").pack()[..], b"ping\r\n");
        assert_eq!(&LinePacket::from("").pack()[..], b"\r\n");
    }

    #[tokio::test]
    async fn test_strips_terminators() {
        let mut reader: &[u8] = b"ping\r\npong\n\r\nlast";
        let protocol = LineProtocol::default();

        assert_eq!(protocol.read_packet(&mut reader).await.unwrap().as_str(), "ping");
        assert_eq!(protocol.read_packet(&mut reader).await.unwrap().as_str(), "pong");
        assert_eq!(protocol.read_packet(&mut reader).await.unwrap().as_str(), "");

        // unterminated tail is a truncated frame
        let err = protocol.read_packet(&mut reader).await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(matches!(
            protocol.read_packet(&mut reader).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_line_length_limit() {
        let protocol = LineProtocol::with_max_line_length(4);

        let mut exact: &[u8] = b"abcd\r\n";
        assert_eq!(protocol.read_packet(&mut exact).await.unwrap().as_str(), "abcd");

        let mut terminated: &[u8] = b"abcde\n";
        assert!(matches!(
            protocol.read_packet(&mut terminated).await,
            Err(ProtocolError::FrameTooLarge { size: 5, max: 4 })
        ));

        let mut unterminated: &[u8] = b"abcdefghij";
        assert!(matches!(
            protocol.read_packet(&mut unterminated).await,
            Err(ProtocolError::FrameTooLarge { max: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed() {
        let mut reader: &[u8] = b"\xff\xfe\n";
        let err = LineProtocol::default()
            .read_packet(&mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(!err.is_disconnect());
    }
}
