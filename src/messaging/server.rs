use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::messaging::address::Address;
use crate::messaging::config::ServerConfig;
use crate::messaging::connection::{Connection, ConnectionOwner};
use crate::messaging::envelope::Envelope;
use crate::messaging::error::MessagingError;
use crate::messaging::handler::{ConnectionInfo, ServerHandler};


/// A server accepts TCP connections and keeps a registry of the open ones, keyed by the peer's
///  address. Incoming envelopes are passed to the [ServerHandler], and the application sends
///  envelopes to a peer by its address.
///
/// A server is started by [Server::run] or [Server::serve], which run the accept loop until the
///  server is closed - typically in a spawned task.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server{{running:{}}}", self.inner.is_running())
    }
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> anyhow::Result<Server> {
        config.validate()?;

        let (cancel_sender, _) = broadcast::channel(1);
        Ok(Server {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                handler,
                registry: Default::default(),
                running: AtomicBool::new(true),
                cancel_sender,
                accept_guard: Mutex::new(()),
                next_connection_id: AtomicU64::new(1),
                span: info_span!("server"),
            }),
        })
    }

    /// Binds to `bind_address` (in `ip:port` form, an empty ip meaning loopback) and serves until
    ///  the server is closed. Failure to bind is logged and returned, there is no retry.
    pub async fn run(&self, bind_address: &str) -> Result<(), MessagingError> {
        let addr = Address::parse(bind_address);
        let listener = match TcpListener::bind(addr.to_string()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {}", addr, e);
                return Err(MessagingError::BindFailure { addr: addr.to_string(), source: e });
            }
        };
        self.serve(listener).await
    }

    /// Runs the accept loop on a listener that is already bound.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MessagingError> {
        let inner = self.inner.clone();
        async move {
            let _accept_guard = inner.accept_guard.lock().await;
            let mut cancel = inner.cancel_sender.subscribe();
            if !inner.is_running() {
                return Err(MessagingError::ServerClosed);
            }

            match listener.local_addr() {
                Ok(local_addr) => info!("listening on {}", local_addr),
                Err(_) => info!("listening"),
            }

            loop {
                let accepted = select! {
                    r = listener.accept() => r,
                    _ = cancel.recv() => break,
                };
                if !inner.is_running() {
                    break;
                }

                match accepted {
                    Ok((stream, peer_addr)) => inner.register(stream, peer_addr).await,
                    Err(e) => warn!("error accepting connection - continuing: {}", e),
                }
            }

            drop(listener);
            info!("stopped accepting connections");
            Ok(())
        }
            .instrument(self.inner.span.clone())
            .await
    }

    /// Sends an envelope to the peer with the given address, waiting for room in the connection's
    ///  outbound queue if necessary.
    pub async fn send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.inner.send(addr, envelope).await
    }

    /// Like [Server::send], but fails with [MessagingError::QueueFull] instead of waiting
    pub async fn try_send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.inner.try_send(addr, envelope).await
    }

    /// Closes the connection to a peer the same way as if the peer had gone away, including the
    ///  disconnect callback.
    pub async fn disconnect(&self, addr: &Address) -> Result<(), MessagingError> {
        let connection_id = self.inner.registry.read().await
            .get(addr)
            .map(|c| c.id())
            .ok_or_else(|| MessagingError::AddressNotRegistered(addr.clone()))?;

        self.inner.close_connection(addr.clone(), connection_id)
            .instrument(self.inner.span.clone())
            .await;
        Ok(())
    }

    pub async fn addresses(&self) -> Vec<Address> {
        self.inner.registry.read().await
            .keys()
            .cloned()
            .collect()
    }

    pub async fn num_connections(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn sender(&self) -> ServerSender {
        ServerSender { inner: Arc::downgrade(&self.inner) }
    }

    /// Stops accepting connections and closes all open connections concurrently, returning when all
    ///  of them and the accept loop are gone. The disconnect callback is not called for connections
    ///  closed this way.
    pub async fn close(&self) {
        let inner = &self.inner;
        async {
            if inner.running.swap(false, Ordering::SeqCst) {
                info!("closing server");
                if inner.cancel_sender.send(()).is_err() {
                    debug!("accept loop is not running");
                }
            }

            let connections = inner.registry.write().await
                .drain()
                .map(|(_, connection)| connection)
                .collect::<Vec<_>>();

            let mut closing = JoinSet::new();
            for connection in connections {
                closing.spawn(async move {
                    connection.close().await
                }.instrument(Span::current()));
            }
            while let Some(result) = closing.join_next().await {
                if let Err(e) = result {
                    error!("error closing connection: {}", e);
                }
            }

            // wait for the accept loop to let go of the listener
            let _accept_guard = inner.accept_guard.lock().await;
            debug!("server closed");
        }
            .instrument(inner.span.clone())
            .await
    }
}


/// A handle for sending through a [Server] that does not keep the server alive. It is passed to
///  handler callbacks so they can reply.
#[derive(Clone)]
pub struct ServerSender {
    inner: Weak<ServerInner>,
}

impl Debug for ServerSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerSender")
    }
}

impl ServerSender {
    #[cfg(test)]
    pub(crate) fn detached() -> ServerSender {
        ServerSender { inner: Weak::new() }
    }

    fn server(&self) -> Result<Arc<ServerInner>, MessagingError> {
        self.inner.upgrade()
            .ok_or(MessagingError::ServerClosed)
    }

    pub async fn send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.server()?
            .send(addr, envelope).await
    }

    pub async fn try_send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.server()?
            .try_send(addr, envelope).await
    }
}


struct ServerInner {
    config: Arc<ServerConfig>,
    handler: Arc<dyn ServerHandler>,
    registry: RwLock<FxHashMap<Address, Arc<Connection>>>,
    running: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
    /// held by the accept loop while it runs
    accept_guard: Mutex<()>,
    next_connection_id: AtomicU64,
    span: Span,
}

impl ServerInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn register(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("accepted socket has no local address - dropping it: {}", e);
                return;
            }
        };

        if let Some(keep_alive) = self.config.keep_alive {
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(keep_alive)) {
                warn!("failed to enable keep-alive for {}: {}", peer_addr, e);
            }
        }

        let addr = Address::from(peer_addr);
        let info = ConnectionInfo { peer_addr, local_addr };
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(%addr, connection_id, "accepted connection");

        let weak_self = Arc::downgrade(self);
        let (connection, duties) = Connection::new(
            connection_id,
            addr.clone(),
            stream,
            self.config.clone(),
            self.handler.clone(),
            ServerSender { inner: weak_self.clone() },
            weak_self.clone(),
        );

        {
            let mut registry = self.registry.write().await;
            if !self.is_running() {
                debug!(%addr, "server is closing - dropping accepted connection");
                return;
            }
            if let Some(previous) = registry.insert(addr.clone(), connection.clone()) {
                debug!(%addr, "new connection replaces a previous one from the same address");
                tokio::spawn(async move {
                    previous.close().await
                }.instrument(Span::current()));
            }
        }

        let handler = self.handler.clone();
        let sender = ServerSender { inner: weak_self };
        tokio::spawn(async move {
            handler.on_connect(sender, info, addr).await
        }.instrument(Span::current()));

        connection.start(duties).await;
    }

    async fn connection_for(&self, addr: &Address) -> Result<Arc<Connection>, MessagingError> {
        if !self.is_running() {
            return Err(MessagingError::ServerClosed);
        }
        self.registry.read().await
            .get(addr)
            .cloned()
            .ok_or_else(|| MessagingError::AddressNotRegistered(addr.clone()))
    }

    async fn send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.connection_for(addr).await?
            .send(envelope).await
    }

    async fn try_send(&self, addr: &Address, envelope: Envelope) -> Result<(), MessagingError> {
        self.connection_for(addr).await?
            .try_send(envelope)
    }
}

#[async_trait]
impl ConnectionOwner for ServerInner {
    async fn close_connection(&self, addr: Address, connection_id: u64) {
        // whoever removes the entry does the closing, so concurrent reports and a concurrent
        //  global close tear the connection down exactly once
        let connection = {
            let mut registry = self.registry.write().await;
            if registry.get(&addr).is_some_and(|c| c.id() == connection_id) {
                registry.remove(&addr)
            }
            else {
                None
            }
        };

        let Some(connection) = connection else {
            debug!(%addr, connection_id, "connection is already closed");
            return;
        };

        info!(%addr, connection_id, "closing connection");
        let handler = self.handler.clone();
        let disconnected = addr.clone();
        tokio::spawn(async move {
            handler.on_disconnect(disconnected).await
        }.instrument(Span::current()));

        connection.close().await;
    }
}
