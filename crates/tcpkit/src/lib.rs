//! # tcpkit
//!
//! A TCP server scaffold. The application brings the framing (a [`Protocol`]
//! and its [`Packet`] type) and the business logic ([`Hooks`]); tcpkit runs
//! the accept loop, the connection registry and the per-connection tasks.
//!
//! ## Features
//!
//! - **Per-connection tasks**: read, handle, write and an optional heartbeat
//!   checker, each racing the server's stop signal and the connection's close
//!   signal
//! - **Close-once teardown**: whichever task fails first closes the
//!   connection; the after-close hook runs exactly once
//! - **Backpressure**: [`Conn::async_write_packet`] rejects or waits with a
//!   bounded timeout instead of buffering without limit
//! - **Fault containment**: a panic in a task or hook closes that connection
//!   only
//! - **Graceful shutdown**: [`Server::stop`] returns once every task is gone
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tcpkit::{Hooks, Server, ServerConfig};
//! use tcpkit_codec::EchoProtocol;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hooks = Hooks::new().after_receive(|conn, packet| async move {
//!         let _ = conn.async_write_packet(packet, Duration::from_secs(1)).await;
//!     });
//!
//!     let server = Server::new(ServerConfig::default(), hooks, EchoProtocol::default());
//!     let listener = Server::<EchoProtocol>::bind("127.0.0.1:8980").await?;
//!     server.spawn(listener);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod config;
mod conn;
pub mod error;
mod hooks;
mod logging;
pub mod metrics;
pub mod protocol;
mod server;

pub use config::{ConfigError, ConfigurationBuilder, LivenessMode, LogOutput, LoggingConfig, ServerConfig};
pub use conn::Conn;
pub use error::{ConnError, ProtocolError, ServerError, TcpResult};
pub use hooks::Hooks;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use protocol::{Packet, PacketReader, Protocol};
pub use server::Server;
