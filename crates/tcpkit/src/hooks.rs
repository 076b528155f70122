//! Lifecycle callbacks invoked by the server and its connections.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::conn::Conn;
use crate::protocol::Protocol;

type ConnHook<P> = Arc<dyn Fn(Arc<Conn<P>>) -> BoxFuture<'static, ()> + Send + Sync>;
type PacketHook<P> =
    Arc<dyn Fn(Arc<Conn<P>>, <P as Protocol>::Packet) -> BoxFuture<'static, ()> + Send + Sync>;
type IdGenerator = Arc<dyn Fn(&SocketAddr) -> String + Send + Sync>;

/// The application's callbacks. Every hook is optional; unset hooks are skipped.
///
/// ```rust,ignore
/// let hooks = Hooks::new()
///     .after_connect(|conn| async move {
///         conn.put_extra_data(conn.peer_addr());
///     })
///     .after_receive(|conn, packet| async move {
///         let _ = conn.async_write_packet(packet, Duration::from_secs(1)).await;
///     });
/// ```
pub struct Hooks<P: Protocol> {
    pub(crate) after_connect: Option<ConnHook<P>>,
    pub(crate) after_receive: Option<PacketHook<P>>,
    pub(crate) after_send: Option<PacketHook<P>>,
    pub(crate) after_close: Option<ConnHook<P>>,
    pub(crate) id_generator: Option<IdGenerator>,
}

impl<P: Protocol> Hooks<P> {
    /// No hooks at all.
    pub fn new() -> Self {
        Self {
            after_connect: None,
            after_receive: None,
            after_send: None,
            after_close: None,
            id_generator: None,
        }
    }

    /// Called once per connection, before its tasks are launched.
    pub fn after_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ConnHook<P> =
            Arc::new(move |conn: Arc<Conn<P>>| -> BoxFuture<'static, ()> { Box::pin(hook(conn)) });
        self.after_connect = Some(hook);
        self
    }

    /// Called on the handle task for every inbound packet, in arrival order.
    pub fn after_receive<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn<P>>, P::Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_receive = Some(packet_hook(hook));
        self
    }

    /// Called on the write task after each packet has been written.
    pub fn after_send<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn<P>>, P::Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_send = Some(packet_hook(hook));
        self
    }

    /// Called once per connection during teardown.
    ///
    /// The connection is already out of the registry and its close signal has
    /// fired; calling [`Conn::close`] from here is a no-op.
    pub fn after_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Conn<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ConnHook<P> =
            Arc::new(move |conn: Arc<Conn<P>>| -> BoxFuture<'static, ()> { Box::pin(hook(conn)) });
        self.after_close = Some(hook);
        self
    }

    /// Choose the registry key of each accepted connection.
    ///
    /// Keys must be unique among live connections. Defaults to a random UUID.
    pub fn id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&SocketAddr) -> String + Send + Sync + 'static,
    {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    pub(crate) fn next_id(&self, peer: &SocketAddr) -> String {
        match &self.id_generator {
            Some(generator) => generator(peer),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }
}

fn packet_hook<P, F, Fut>(hook: F) -> PacketHook<P>
where
    P: Protocol,
    F: Fn(Arc<Conn<P>>, P::Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |conn: Arc<Conn<P>>, packet: P::Packet| -> BoxFuture<'static, ()> {
            Box::pin(hook(conn, packet))
        },
    )
}

impl<P: Protocol> Default for Hooks<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> Clone for Hooks<P> {
    fn clone(&self) -> Self {
        Self {
            after_connect: self.after_connect.clone(),
            after_receive: self.after_receive.clone(),
            after_send: self.after_send.clone(),
            after_close: self.after_close.clone(),
            id_generator: self.id_generator.clone(),
        }
    }
}

impl<P: Protocol> fmt::Debug for Hooks<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("after_connect", &self.after_connect.is_some())
            .field("after_receive", &self.after_receive.is_some())
            .field("after_send", &self.after_send.is_some())
            .field("after_close", &self.after_close.is_some())
            .field("id_generator", &self.id_generator.is_some())
            .finish()
    }
}
