//! Echo client that says hello on a fixed interval and reconnects when the
//! server goes away.
//!
//! With the server's heartbeat enabled, the periodic hello is what keeps the
//! connection alive.

use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use clap::Parser;
use tcpkit::{LoggingConfig, Packet, Protocol};
use tcpkit_codec::{EchoPacket, EchoProtocol};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "echo-client", version, about = "Periodic hello client for echo-server")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8980")]
    addr: String,

    /// Seconds between two hellos
    #[arg(long, default_value_t = 2)]
    interval: u64,

    /// Reconnect attempts before giving up
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Seconds to wait before a reconnect attempt
    #[arg(long, default_value_t = 10)]
    retry_delay: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    LoggingConfig::default().init()?;

    let protocol = EchoProtocol::default();
    let interval = Duration::from_secs(args.interval.max(1));
    let mut retry = 0;

    loop {
        if retry > args.retries {
            bail!("server unreachable after {} reconnect attempts", args.retries);
        } else if retry > 0 {
            info!(attempt = retry, "reconnecting");
        }

        let stream = match TcpStream::connect(args.addr.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", args.addr, e);
                retry += 1;
                tokio::time::sleep(Duration::from_secs(args.retry_delay)).await;
                continue;
            }
        };
        retry = 0;

        let (read_half, mut write_half) = stream.into_split();
        let writer = tokio::spawn(async move {
            let hello = EchoPacket::new(Bytes::from_static(b"hello")).pack();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = write_half.write_all(&hello).await {
                    debug!("write exit: {}", e);
                    return;
                }
                info!("Write to server");
            }
        });

        let mut reader = BufReader::new(read_half);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    writer.abort();
                    return Ok(());
                }
                read = protocol.read_packet(&mut reader) => match read {
                    Ok(packet) => println!(
                        "Server reply: [{}] [{}]",
                        packet.len(),
                        String::from_utf8_lossy(packet.body())
                    ),
                    Err(e) => {
                        warn!("Server is lost: {}", e);
                        break;
                    }
                },
            }
        }

        writer.abort();
        retry += 1;
    }
}
