//! The listener loop, the connection registry and coordinated shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::error::{ConnError, ServerError};
use crate::hooks::Hooks;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::protocol::Protocol;

/// State shared by the server handle, the accept loop and every connection.
pub(crate) struct ServerInner<P: Protocol> {
    pub(crate) config: ServerConfig,
    pub(crate) hooks: Hooks<P>,
    pub(crate) protocol: P,
    pub(crate) registry: DashMap<String, Arc<Conn<P>>>,
    pub(crate) stop_signal: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) metrics: ServerMetrics,
    epoch_base: i64,
    started: Instant,
}

impl<P: Protocol> ServerInner<P> {
    /// Seconds since the Unix epoch on a monotonic clock anchored at server creation.
    pub(crate) fn now_secs(&self) -> i64 {
        self.epoch_base + self.started.elapsed().as_secs() as i64
    }
}

/// A TCP server that frames every connection through one shared [`Protocol`].
///
/// `Server` is a cheap handle; clones share the same registry and shutdown state.
///
/// ```rust,ignore
/// let server = Server::new(ServerConfig::default(), hooks, EchoProtocol::default());
/// let listener = Server::<EchoProtocol>::bind("127.0.0.1:8980").await?;
/// let accept = server.spawn(listener);
///
/// tokio::signal::ctrl_c().await?;
/// server.stop().await;
/// ```
pub struct Server<P: Protocol> {
    inner: Arc<ServerInner<P>>,
}

impl<P: Protocol> Server<P> {
    /// Create a server. Nothing starts until [`start`](Self::start) or
    /// [`spawn`](Self::spawn) is given a listener.
    ///
    /// An invalid configuration is only logged; unusable values fall back to
    /// the nearest working ones. Use [`try_new`](Self::try_new) to reject it.
    pub fn new(config: ServerConfig, hooks: Hooks<P>, protocol: P) -> Self {
        if let Err(e) = config.validate() {
            warn!("{}, continuing with adjusted values", e);
        }

        let epoch_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs() as i64)
            .unwrap_or_default();

        Self {
            inner: Arc::new(ServerInner {
                config,
                hooks,
                protocol,
                registry: DashMap::new(),
                stop_signal: CancellationToken::new(),
                tracker: TaskTracker::new(),
                metrics: ServerMetrics::new(),
                epoch_base,
                started: Instant::now(),
            }),
        }
    }

    /// Create a server after checking the configuration.
    pub fn try_new(config: ServerConfig, hooks: Hooks<P>, protocol: P) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self::new(config, hooks, protocol))
    }

    /// Bind a listener for this server.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr).await.map_err(ServerError::Bind)
    }

    /// Run the accept loop on the current task until the server is stopped.
    ///
    /// A failed accept is logged and retried after a short pause; it never
    /// ends the loop. The listener is dropped, and so closed, as soon as the
    /// stop signal is observed.
    pub async fn start(&self, listener: TcpListener) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .track_future(accept_loop(inner, listener))
            .await;
    }

    /// Run the accept loop on its own tracked task.
    pub fn spawn(&self, listener: TcpListener) -> JoinHandle<()> {
        let server = self.clone();
        self.inner
            .tracker
            .spawn(async move { server.start(listener).await })
    }

    /// Stop accepting, signal every connection to close and wait until every
    /// tracked task has finished.
    ///
    /// Safe to call more than once; later calls just wait again.
    pub async fn stop(&self) {
        if !self.inner.stop_signal.is_cancelled() {
            info!(
                connections = self.conn_size(),
                "stopping TCP server, waiting for connections to drain"
            );
        }
        self.inner.stop_signal.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("TCP server stopped");
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop_signal.is_cancelled()
    }

    /// A token cancelled when the server stops, for work the application
    /// wants to tie to the server's lifetime.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop_signal.child_token()
    }

    /// Look up a live connection.
    pub fn conn(&self, id: &str) -> Option<Arc<Conn<P>>> {
        self.inner
            .registry
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Register a connection under `id`, replacing any previous entry.
    pub fn store_conn(&self, id: impl Into<String>, conn: Arc<Conn<P>>) {
        self.inner.registry.insert(id.into(), conn);
    }

    /// Drop a registry entry. The connection itself is left running.
    pub fn remove_conn(&self, id: &str) -> Option<Arc<Conn<P>>> {
        self.inner.registry.remove(id).map(|(_, conn)| conn)
    }

    /// Number of registered connections.
    pub fn conn_size(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the registered connection ids, in no particular order.
    pub fn conn_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Queue a packet on every registered connection.
    ///
    /// `make` builds one packet per connection. Each write follows the
    /// [`Conn::async_write_packet`] contract with the given `timeout`; the
    /// connections that rejected their packet are returned with the reason.
    pub async fn broadcast<F>(&self, make: F, timeout: Duration) -> Vec<(String, ConnError)>
    where
        F: Fn() -> P::Packet,
    {
        // no registry guard may be held across an await
        let conns: Vec<Arc<Conn<P>>> = self
            .inner
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut failed = Vec::new();
        for conn in conns {
            if let Err(e) = conn.async_write_packet(make(), timeout).await {
                failed.push((conn.id().to_string(), e));
            }
        }
        failed
    }

    /// Snapshot of the server's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The configuration this server was created with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The shared protocol.
    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }
}

async fn accept_loop<P: Protocol>(inner: Arc<ServerInner<P>>, listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!("TCP server accepting on {}", addr),
        Err(e) => warn!("TCP server accepting on unknown address: {}", e),
    }

    loop {
        let accepted = tokio::select! {
            biased;
            _ = inner.stop_signal.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                ServerMetrics::incr(&inner.metrics.accept_errors);
                warn!("Failed to accept TCP connection: {}", e);
                tokio::select! {
                    biased;
                    _ = inner.stop_signal.cancelled() => break,
                    _ = tokio::time::sleep(inner.config.accept_backoff()) => continue,
                }
            }
        };

        let id = inner.hooks.next_id(&peer);
        let conn = match Conn::new(stream, id, Arc::clone(&inner)) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Dropping TCP connection from {}: {}", peer, e);
                continue;
            }
        };
        ServerMetrics::incr(&inner.metrics.connections_accepted);
        ServerMetrics::incr(&inner.metrics.active_connections);

        if let Some(previous) = inner
            .registry
            .insert(conn.id().to_string(), Arc::clone(&conn))
        {
            warn!(conn_id = %conn.id(), "connection id reused, replacing {:?}", previous);
        }
        debug!(conn_id = %conn.id(), peer = %peer, "accepted TCP connection");

        inner.tracker.spawn(async move { conn.start().await });
    }

    // dropping the listener closes it
    drop(listener);
    info!("TCP accept loop stopped");
}

impl<P: Protocol> Clone for Server<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Protocol> fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks)
            .field("connections", &self.inner.registry.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::ProtocolError;
    use crate::protocol::PacketReader;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Nothing;

    #[async_trait]
    impl Protocol for Nothing {
        type Packet = Bytes;

        async fn read_packet<R: PacketReader>(&self, _reader: &mut R) -> Result<Bytes, ProtocolError> {
            Err(ProtocolError::Closed)
        }
    }

    fn server() -> Server<Nothing> {
        Server::new(ServerConfig::default(), Hooks::new(), Nothing)
    }

    #[tokio::test]
    async fn test_clock_tracks_wall_time() {
        let server = server();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!((server.inner.now_secs() - wall).abs() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_is_monotonic() {
        let server = server();
        let before = server.inner.now_secs();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(server.inner.now_secs() - before, 90);
    }

    #[tokio::test]
    async fn test_stop_without_listener() {
        let server = server();
        assert!(!server.is_stopped());
        assert_eq!(server.conn_size(), 0);
        assert!(server.conn_ids().is_empty());
        assert!(server.conn("missing").is_none());

        server.stop().await;
        assert!(server.is_stopped());
        assert!(server.stop_token().is_cancelled());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_after_stop_returns() {
        let server = server();
        server.stop().await;

        let listener = Server::<Nothing>::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        server.start(listener).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = Server::<Nothing>::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = Server::<Nothing>::bind(addr).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
    }

    #[test]
    fn test_try_new_rejects_invalid_config() {
        let mut config = ServerConfig::builder().heartbeat(5, 1).build();
        config.heartbeat_period_secs = 0;

        let err = Server::try_new(config.clone(), Hooks::new(), Nothing).unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::Invalid(_))));
        assert!(err.to_string().contains("heartbeat_period_secs"));

        // the unchecked constructor keeps going with a one second period
        let server = Server::new(config, Hooks::new(), Nothing);
        assert_eq!(server.config().heartbeat_period(), Duration::from_secs(1));

        let server = Server::try_new(ServerConfig::default(), Hooks::new(), Nothing).unwrap();
        assert!(!server.is_stopped());
    }

    #[test]
    fn test_debug_shows_state() {
        let debug = format!("{:?}", server());
        assert!(debug.contains("connections: 0"));
        assert!(debug.contains("stopped: false"));
    }
}
