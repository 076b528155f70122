//! Fault containment tests
//!
//! A panic in application code closes the connection it happened on and
//! nothing else.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{Client, Line, Lines, echo_hooks, start_server, wait_until};
use tcpkit::{Hooks, PacketReader, Protocol, ProtocolError, Server, ServerConfig};

/// Line framing that blows up on one particular line.
struct Touchy;

#[async_trait]
impl Protocol for Touchy {
    type Packet = Line;

    async fn read_packet<R: PacketReader>(&self, reader: &mut R) -> Result<Line, ProtocolError> {
        let line = Lines.read_packet(reader).await?;
        if line.0 == "explode" {
            panic!("parser exploded");
        }
        Ok(line)
    }
}

#[tokio::test]
async fn test_receive_panic_closes_only_that_connection() {
    let closes = Arc::new(AtomicUsize::new(0));
    let hooks = {
        let closes = Arc::clone(&closes);
        Hooks::<Lines>::new()
            .after_receive(|conn, line: Line| async move {
                if line.0 == "boom" {
                    panic!("handler exploded");
                }
                let _ = conn.async_write_packet(line, Duration::from_secs(1)).await;
            })
            .after_close(move |_conn| {
                let closes = Arc::clone(&closes);
                async move {
                    closes.fetch_add(1, Ordering::SeqCst);
                }
            })
    };
    let (server, addr) = start_server(ServerConfig::default(), hooks).await;

    let mut victim = Client::connect(addr).await;
    let mut bystander = Client::connect(addr).await;
    wait_until("two registered connections", || server.conn_size() == 2).await;

    victim.send_line("boom").await;
    victim.expect_eof().await;
    wait_until("after_close", || closes.load(Ordering::SeqCst) == 1).await;

    bystander.send_line("still here").await;
    assert_eq!(bystander.recv_line().await.as_deref(), Some("still here"));
    assert_eq!(server.conn_size(), 1);
    assert_eq!(server.metrics().task_panics, 1);

    // the listener is unaffected too
    let mut newcomer = Client::connect(addr).await;
    newcomer.send_line("hi").await;
    assert_eq!(newcomer.recv_line().await.as_deref(), Some("hi"));

    server.stop().await;
    assert_eq!(closes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_connect_panic_closes_connection() {
    let closes = Arc::new(AtomicUsize::new(0));
    let connects = Arc::new(AtomicUsize::new(0));
    let hooks = {
        let closes = Arc::clone(&closes);
        let connects = Arc::clone(&connects);
        Hooks::<Lines>::new()
            .after_connect(move |_conn| {
                let first = connects.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        panic!("connect hook exploded");
                    }
                }
            })
            .after_receive(|conn, line: Line| async move {
                let _ = conn.async_write_packet(line, Duration::from_secs(1)).await;
            })
            .after_close(move |_conn| {
                let closes = Arc::clone(&closes);
                async move {
                    closes.fetch_add(1, Ordering::SeqCst);
                }
            })
    };
    let (server, addr) = start_server(ServerConfig::default(), hooks).await;

    let mut first = Client::connect(addr).await;
    first.expect_eof().await;
    wait_until("after_close", || closes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.conn_size(), 0);

    let mut second = Client::connect(addr).await;
    second.send_line("ok").await;
    assert_eq!(second.recv_line().await.as_deref(), Some("ok"));

    assert_eq!(server.metrics().task_panics, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_close_hook_panic_is_contained() {
    let hooks = Hooks::<Lines>::new().after_close(|_conn| async move {
        panic!("close hook exploded");
    });
    let (server, addr) = start_server(ServerConfig::default(), hooks).await;

    let client = Client::connect(addr).await;
    wait_until("connection registered", || server.conn_size() == 1).await;
    drop(client);
    wait_until("connection to go away", || server.conn_size() == 0).await;
    wait_until("panic to be counted", || server.metrics().task_panics == 1).await;

    // stop still completes
    server.stop().await;
    assert!(server.is_stopped());
}

#[tokio::test]
async fn test_send_hook_panic_closes_only_that_connection() {
    let hooks = echo_hooks().after_send(|_conn, line: Line| async move {
        if line.0 == "boom" {
            panic!("send hook exploded");
        }
    });
    let (server, addr) = start_server(ServerConfig::default(), hooks).await;

    let mut victim = Client::connect(addr).await;
    let mut bystander = Client::connect(addr).await;
    wait_until("two registered connections", || server.conn_size() == 2).await;

    victim.send_line("boom").await;
    // the packet went out before the hook ran
    assert_eq!(victim.recv_line().await.as_deref(), Some("boom"));
    victim.expect_eof().await;
    wait_until("victim to go away", || server.conn_size() == 1).await;

    bystander.send_line("fine").await;
    assert_eq!(bystander.recv_line().await.as_deref(), Some("fine"));
    assert_eq!(server.metrics().task_panics, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_protocol_panic_closes_only_that_connection() {
    let hooks = Hooks::<Touchy>::new().after_receive(|conn, line: Line| async move {
        let _ = conn.async_write_packet(line, Duration::from_secs(1)).await;
    });
    let server = Server::new(ServerConfig::default(), hooks, Touchy);
    let listener = Server::<Touchy>::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.spawn(listener);

    let mut victim = Client::connect(addr).await;
    let mut bystander = Client::connect(addr).await;
    wait_until("two registered connections", || server.conn_size() == 2).await;

    victim.send_line("explode").await;
    victim.expect_eof().await;
    wait_until("victim to go away", || server.conn_size() == 1).await;

    bystander.send_line("calm").await;
    assert_eq!(bystander.recv_line().await.as_deref(), Some("calm"));
    assert_eq!(server.metrics().task_panics, 1);

    server.stop().await;
    assert_eq!(server.conn_size(), 0);
}
