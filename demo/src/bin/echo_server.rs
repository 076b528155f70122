//! Echo server: every length-prefixed packet goes straight back to its sender.
//!
//! ```text
//! cargo run -p tcpkit-demo --bin echo-server -- --addr 0.0.0.0:8980 --heartbeat
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tcpkit::{Hooks, Server, ServerConfig};
use tcpkit_codec::EchoProtocol;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "echo-server", version, about = "Length-prefixed echo server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8980")]
    addr: String,

    /// Close connections that stay silent past the heartbeat threshold
    #[arg(long)]
    heartbeat: bool,

    /// Server settings file (TOML, YAML or JSON)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ServerConfig::builder()
            .send_chan_buf(6)
            .receive_chan_buf(6)
            .build(),
    };
    if args.heartbeat {
        config.enable_heartbeating = true;
    }
    config.logging.init().context("Failed to install logging")?;

    let hooks = Hooks::<EchoProtocol>::new()
        .after_connect(|conn| async move {
            conn.put_extra_data(conn.peer_addr());
            println!("OnConnect: {}", conn.peer_addr());
        })
        .after_receive(|conn, packet| async move {
            println!(
                "OnMessage: [{}] [{}]",
                packet.len(),
                String::from_utf8_lossy(packet.body())
            );
            if let Err(e) = conn.async_write_packet(packet, Duration::from_secs(1)).await {
                warn!(conn_id = %conn.id(), "echo dropped: {}", e);
            }
        })
        .after_close(|conn| async move {
            match conn.extra_data::<SocketAddr>() {
                Some(addr) => println!("OnClose: {}", addr),
                None => println!("OnClose: {}", conn.id()),
            }
        });

    let server = Server::try_new(config, hooks, EchoProtocol::default())?;
    let listener = Server::<EchoProtocol>::bind(args.addr.as_str()).await?;
    println!("listening: {}", listener.local_addr()?);
    let accept = server.spawn(listener);

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    accept.await?;

    info!(metrics = ?server.metrics(), "echo server stopped");
    Ok(())
}
