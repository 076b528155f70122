//! Common test utilities for integration tests
//!
//! A newline-delimited test protocol, a server launcher bound to an
//! ephemeral port, and a small line-oriented client.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tcpkit::{Hooks, Packet, PacketReader, Protocol, ProtocolError, Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(10);

/// One text line; `\n` is appended on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(pub String);

impl Line {
    pub fn new(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl Packet for Line {
    fn pack(&self) -> Bytes {
        Bytes::from(format!("{}\n", self.0))
    }
}

/// Newline-delimited framing.
#[derive(Debug, Default)]
pub struct Lines;

#[async_trait]
impl Protocol for Lines {
    type Packet = Line;

    async fn read_packet<R: PacketReader>(&self, reader: &mut R) -> Result<Line, ProtocolError> {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::Closed);
        }
        if !line.ends_with('\n') {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(Line(line.trim_end().to_string()))
    }
}

/// Start a server on an ephemeral port.
pub async fn start_server(config: ServerConfig, hooks: Hooks<Lines>) -> (Server<Lines>, SocketAddr) {
    let server = Server::new(config, hooks, Lines);
    let listener = Server::<Lines>::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.spawn(listener);
    (server, addr)
}

/// Hooks that echo every line back.
pub fn echo_hooks() -> Hooks<Lines> {
    Hooks::<Lines>::new().after_receive(|conn, line| async move {
        let _ = conn.async_write_packet(line, Duration::from_secs(1)).await;
    })
}

/// A line-oriented client.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    pub async fn send_line(&mut self, text: &str) {
        self.send(&format!("{}\n", text)).await;
    }

    /// Next line without its terminator, or `None` once the server hung up.
    pub async fn recv_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(PATIENCE, self.reader.read_line(&mut line))
            .await
            .expect("server did not answer in time");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end().to_string()),
        }
    }

    /// Wait until the server closes the connection.
    pub async fn expect_eof(&mut self) {
        while let Some(line) = self.recv_line().await {
            // late replies are fine, the hang-up is what matters
            let _ = line;
        }
    }
}

/// Poll `condition` until it holds, panicking after [`PATIENCE`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future`, panicking after [`PATIENCE`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(PATIENCE, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}
