//! Per-connection state and the four connection tasks.
//!
//! A [`Conn`] owns one accepted socket. Once started it runs:
//!
//! - a **read** task that frames packets off the socket into the inbound queue,
//! - a **handle** task that drains the inbound queue into the receive hook,
//! - a **write** task that drains the outbound queue onto the socket,
//! - an optional **heartbeat** task that closes the connection once it has
//!   been idle for longer than the configured threshold.
//!
//! Every task races its work against the server's stop signal and the
//! connection's own close signal. Whichever way a task ends (signal, I/O
//! error, parse error or panic) it calls [`Conn::close`], which tears the
//! connection down exactly once.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::LivenessMode;
use crate::error::{ConnError, TcpResult};
use crate::metrics::ServerMetrics;
use crate::protocol::{Packet, Protocol};
use crate::server::ServerInner;

/// Socket halves and queue ends handed to the tasks when the connection starts.
struct ConnIo<P: Protocol> {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    send_rx: mpsc::Receiver<P::Packet>,
}

/// One live client connection.
///
/// Always handled through an `Arc`: the tasks, the server registry and the
/// application's hooks all share it.
pub struct Conn<P: Protocol> {
    id: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    server: Arc<ServerInner<P>>,
    send_tx: mpsc::Sender<P::Packet>,
    io: Mutex<Option<ConnIo<P>>>,
    heartbeat: AtomicI64,
    extra_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    close_signal: CancellationToken,
    closed: AtomicBool,
}

impl<P: Protocol> Conn<P> {
    pub(crate) fn new(
        stream: TcpStream,
        id: String,
        server: Arc<ServerInner<P>>,
    ) -> io::Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if server.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let (read_half, write_half) = stream.into_split();
        let (send_tx, send_rx) = mpsc::channel(server.config.send_capacity());
        let heartbeat = server.now_secs();

        Ok(Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            server,
            send_tx,
            io: Mutex::new(Some(ConnIo {
                reader: BufReader::new(read_half),
                writer: write_half,
                send_rx,
            })),
            heartbeat: AtomicI64::new(heartbeat),
            extra_data: Mutex::new(None),
            close_signal: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Registry key of this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address the connection was accepted on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attach arbitrary data to the connection, replacing what was there.
    pub fn put_extra_data<T: Any + Send + Sync>(&self, data: T) {
        *self.extra_data.lock() = Some(Box::new(data));
    }

    /// Clone the attached data out, if there is some of type `T`.
    pub fn extra_data<T: Any + Clone>(&self) -> Option<T> {
        self.extra_data
            .lock()
            .as_ref()
            .and_then(|data| (**data).downcast_ref::<T>())
            .cloned()
    }

    /// Remove and return the attached data if it is of type `T`.
    ///
    /// Data of another type is left in place.
    pub fn take_extra_data<T: Any>(&self) -> Option<T> {
        let mut slot = self.extra_data.lock();
        match slot.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Last liveness timestamp, in seconds since the Unix epoch.
    pub fn heartbeat(&self) -> i64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Overwrite the liveness timestamp (seconds since the Unix epoch).
    pub fn set_heartbeat(&self, secs: i64) {
        self.heartbeat.store(secs, Ordering::Release);
    }

    /// Mark the connection as alive right now.
    pub fn refresh_heartbeat(&self) {
        self.set_heartbeat(self.server.now_secs());
    }

    /// Returns `true` once teardown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.close_signal.is_cancelled()
    }

    /// Wait until the connection's close signal fires.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await;
    }

    /// Queue a packet for the write task.
    ///
    /// With a zero `timeout` the call never waits and fails with
    /// [`ConnError::WriteBlocking`] when the outbound queue is full. With a
    /// non-zero `timeout` it waits up to that long for room, failing with
    /// [`ConnError::WriteTimeout`], or with [`ConnError::ConnClosing`] if the
    /// connection closes in the meantime.
    pub async fn async_write_packet(&self, packet: P::Packet, timeout: Duration) -> TcpResult<()> {
        let result = if self.is_closed() {
            Err(ConnError::ConnClosing)
        } else if timeout.is_zero() {
            self.send_tx.try_send(packet).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnError::WriteBlocking,
                mpsc::error::TrySendError::Closed(_) => ConnError::ConnClosing,
            })
        } else {
            tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => Err(ConnError::ConnClosing),
                sent = tokio::time::timeout(timeout, self.send_tx.send(packet)) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(ConnError::ConnClosing),
                    Err(_) => Err(ConnError::WriteTimeout),
                },
            }
        };

        if let Err(e) = &result {
            ServerMetrics::incr(&self.server.metrics.write_rejections);
            trace!(conn_id = %self.id, error = %e, "async write rejected");
        }
        result
    }

    /// Run the after-connect hook, then launch the connection tasks.
    ///
    /// Tasks are tracked by the owning server, so [`Server::stop`](crate::Server::stop)
    /// waits for them. Starting a connection twice, or after it closed, does nothing.
    pub async fn start(self: &Arc<Self>) {
        if let Some(hook) = &self.server.hooks.after_connect {
            let conn = Arc::clone(self);
            let hook = Arc::clone(hook);
            if let Err(panic) = contain(async move { hook(conn).await }).await {
                self.task_panicked("connect", &panic);
                self.close().await;
                return;
            }
        }

        if self.is_closed() {
            return;
        }
        let Some(ConnIo {
            reader,
            writer,
            send_rx,
        }) = self.io.lock().take()
        else {
            warn!(conn_id = %self.id, "connection already started");
            return;
        };

        let (recv_tx, recv_rx) = mpsc::channel(self.server.config.receive_capacity());

        self.spawn_task("handle", Arc::clone(self).handle_loop(recv_rx));
        self.spawn_task("read", Arc::clone(self).read_loop(reader, recv_tx));
        self.spawn_task("write", Arc::clone(self).write_loop(writer, send_rx));
        if self.server.config.enable_heartbeating {
            self.spawn_task("heartbeat", Arc::clone(self).heartbeat_loop());
        }
        debug!(conn_id = %self.id, peer = %self.peer_addr, "connection started");
    }

    /// Tear the connection down. Only the first call has any effect.
    ///
    /// Removes the connection from the registry, fires the close signal (which
    /// ends every task and releases the socket halves they own), then runs the
    /// after-close hook. The hook runs on a task tracked by the server, and
    /// this call returns once it has finished.
    ///
    /// The whole teardown counts as tracked work, whoever calls it, so
    /// [`Server::stop`](crate::Server::stop) cannot return in the middle of it.
    pub async fn close(self: &Arc<Self>) {
        // held until the after-close hook is done
        let _tracked = self.server.tracker.token();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.server
            .registry
            .remove_if(&self.id, |_, registered| Arc::ptr_eq(registered, self));
        self.close_signal.cancel();
        // never started: the socket is still parked here
        drop(self.io.lock().take());
        self.server.metrics.connection_closed();
        debug!(conn_id = %self.id, peer = %self.peer_addr, "connection closed");

        if let Some(hook) = &self.server.hooks.after_close {
            let conn = Arc::clone(self);
            let hook = Arc::clone(hook);
            let teardown = self.server.tracker.spawn(async move {
                if let Err(panic) = contain(hook(Arc::clone(&conn))).await {
                    conn.task_panicked("close", &panic);
                }
            });
            let _ = teardown.await;
        }
    }

    fn spawn_task<F>(self: &Arc<Self>, task: &'static str, body: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let conn = Arc::clone(self);
        self.server.tracker.spawn(async move {
            if let Err(panic) = contain(body).await {
                conn.task_panicked(task, &panic);
            }
            conn.close().await;
        });
    }

    fn task_panicked(&self, task: &'static str, panic: &str) {
        ServerMetrics::incr(&self.server.metrics.task_panics);
        error!(conn_id = %self.id, peer = %self.peer_addr, task, panic, "connection task panicked");
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        inbound: mpsc::Sender<P::Packet>,
    ) {
        let server = Arc::clone(&self.server);

        loop {
            if server.config.liveness == LivenessMode::ReadAttempt {
                self.refresh_heartbeat();
            }

            let packet = tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => {
                    debug!(conn_id = %self.id, "server is stopping, read loop exit");
                    return;
                }
                _ = self.close_signal.cancelled() => {
                    debug!(conn_id = %self.id, "connection is closed, read loop exit");
                    return;
                }
                read = server.protocol.read_packet(&mut reader) => match read {
                    Ok(packet) => packet,
                    Err(e) if e.is_disconnect() => {
                        debug!(conn_id = %self.id, error = %e, "peer went away, read loop exit");
                        return;
                    }
                    Err(e) => {
                        warn!(conn_id = %self.id, peer = %self.peer_addr, error = %e, "failed to read packet, read loop exit");
                        return;
                    }
                },
            };

            if server.config.liveness == LivenessMode::FrameReceived {
                self.refresh_heartbeat();
            }

            // The close signal wins over a full queue, so a stalled handle
            // task cannot pin the read task.
            tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => return,
                _ = self.close_signal.cancelled() => return,
                pushed = inbound.send(packet) => {
                    if pushed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<P::Packet>) {
        let server = Arc::clone(&self.server);

        loop {
            let packet = tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => {
                    debug!(conn_id = %self.id, "server is stopping, handle loop exit");
                    return;
                }
                _ = self.close_signal.cancelled() => {
                    debug!(conn_id = %self.id, "connection is closed, handle loop exit");
                    return;
                }
                packet = inbound.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };

            ServerMetrics::incr(&server.metrics.packets_received);
            trace!(conn_id = %self.id, "received packet");
            if let Some(hook) = &server.hooks.after_receive {
                hook(Arc::clone(&self), packet).await;
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<P::Packet>,
    ) {
        let server = Arc::clone(&self.server);

        loop {
            let packet = tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => {
                    debug!(conn_id = %self.id, "server is stopping, write loop exit");
                    break;
                }
                _ = self.close_signal.cancelled() => {
                    debug!(conn_id = %self.id, "connection is closed, write loop exit");
                    break;
                }
                packet = outbound.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let bytes = packet.pack();
            let written = tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => break,
                _ = self.close_signal.cancelled() => break,
                written = writer.write_all(&bytes) => written,
            };
            if let Err(e) = written {
                warn!(conn_id = %self.id, peer = %self.peer_addr, error = %e, "could not send packet, write loop exit");
                break;
            }

            server.metrics.packet_sent(bytes.len());
            if let Some(hook) = &server.hooks.after_send {
                hook(Arc::clone(&self), packet).await;
            }
        }

        // FIN for the peer; the read half goes away with the read task
        let _ = writer.shutdown().await;
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let server = Arc::clone(&self.server);
        let threshold = server.config.heartbeat_threshold_secs as i64;
        let period = server.config.heartbeat_period();

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = server.stop_signal.cancelled() => {
                    debug!(conn_id = %self.id, "server is stopping, heartbeat loop exit");
                    return;
                }
                _ = self.close_signal.cancelled() => {
                    debug!(conn_id = %self.id, "connection is closed, heartbeat loop exit");
                    return;
                }
                _ = ticker.tick() => {
                    let last = self.heartbeat();
                    let idle = server.now_secs() - last;
                    if idle > threshold {
                        ServerMetrics::incr(&server.metrics.heartbeat_timeouts);
                        info!(conn_id = %self.id, peer = %self.peer_addr, idle_secs = idle, "heartbeat timeout, closing connection");
                        return;
                    }
                    trace!(
                        conn_id = %self.id,
                        expires_at = %format_expiry(last + threshold),
                        "connection alive"
                    );
                }
            }
        }
    }
}

/// Run a future, turning a panic inside it into an error message.
async fn contain<F>(body: F) -> Result<(), String>
where
    F: Future<Output = ()>,
{
    AssertUnwindSafe(body).catch_unwind().await.map_err(|panic| {
        if let Some(message) = panic.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = panic.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_string()
        }
    })
}

fn format_expiry(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

impl<P: Protocol> fmt::Debug for Conn<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("heartbeat", &self.heartbeat())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contain_reports_panic_message() {
        assert!(contain(async {}).await.is_ok());

        let message = contain(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(message, "boom");

        let formatted = contain(async { panic!("code {}", 7) }).await.unwrap_err();
        assert_eq!(formatted, "code 7");
    }

    #[test]
    fn test_format_expiry() {
        assert_eq!(format_expiry(0), "1970-01-01 00:00:00");
        assert_eq!(format_expiry(86_400 + 61), "1970-01-02 00:01:01");
    }
}
