//! # tcpkit codecs
//!
//! Ready-made [`Protocol`](tcpkit::Protocol) implementations for tcpkit servers.
//!
//! - [`EchoProtocol`]: binary bodies behind a 4-byte big-endian length prefix
//! - [`LineProtocol`]: UTF-8 text lines, as typed into a telnet session
//!
//! ```rust,ignore
//! use tcpkit::{Hooks, Server, ServerConfig};
//! use tcpkit_codec::LineProtocol;
//!
//! let server = Server::new(ServerConfig::default(), Hooks::new(), LineProtocol::default());
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

mod echo;
mod line;

pub use echo::{DEFAULT_MAX_FRAME_SIZE, EchoPacket, EchoProtocol};
pub use line::{DEFAULT_MAX_LINE_LENGTH, LinePacket, LineProtocol};
