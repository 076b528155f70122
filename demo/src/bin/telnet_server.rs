//! Line-based server for telnet sessions.
//!
//! `ping` is answered with `pong`, `quit` hangs up, anything else is echoed.

use std::time::Duration;

use clap::Parser;
use tcpkit::{Hooks, LoggingConfig, Server, ServerConfig};
use tcpkit_codec::{LinePacket, LineProtocol};
use tracing::{debug, info};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "telnet-server", version, about = "Line-based telnet server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:2323")]
    addr: String,

    /// Longest accepted line, in bytes
    #[arg(long, default_value_t = tcpkit_codec::DEFAULT_MAX_LINE_LENGTH)]
    max_line: usize,

    /// Log at debug level
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let logging = if args.verbose {
        LoggingConfig::stderr_debug()
    } else {
        LoggingConfig::default()
    };
    let config = ServerConfig::builder()
        .send_chan_buf(6)
        .receive_chan_buf(6)
        .logging(logging)
        .build();
    config.logging.init()?;

    let hooks = Hooks::<LineProtocol>::new()
        .after_connect(|conn| async move {
            println!("OnConnect: {}", conn.peer_addr());
            let _ = conn
                .async_write_packet(LinePacket::from("welcome, type quit to leave"), WRITE_TIMEOUT)
                .await;
        })
        .after_receive(|conn, line| async move {
            let reply = match line.as_str().trim() {
                "quit" => {
                    let _ = conn.async_write_packet(LinePacket::from("bye"), WRITE_TIMEOUT).await;
                    // let the write task flush the goodbye before hanging up
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    conn.close().await;
                    return;
                }
                "ping" => LinePacket::from("pong"),
                _ => line,
            };
            if let Err(e) = conn.async_write_packet(reply, WRITE_TIMEOUT).await {
                debug!(conn_id = %conn.id(), "reply dropped: {}", e);
            }
        })
        .after_close(|conn| async move {
            println!("OnClose: {}", conn.peer_addr());
        });

    let server = Server::try_new(
        config,
        hooks,
        LineProtocol::with_max_line_length(args.max_line),
    )?;
    let listener = Server::<LineProtocol>::bind(args.addr.as_str()).await?;
    println!("listening: {}", listener.local_addr()?);
    let accept = server.spawn(listener);

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    accept.await?;

    info!(metrics = ?server.metrics(), "telnet server stopped");
    Ok(())
}
