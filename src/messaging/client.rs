use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::messaging::address::Address;
use crate::messaging::config::ClientConfig;
use crate::messaging::envelope::Envelope;
use crate::messaging::error::MessagingError;
use crate::messaging::framing::{read_frame, with_deadline, write_frame};
use crate::messaging::handler::ClientHandler;


/// A client keeps (at most) one connection to a server, re-establishing it in the background
///  whenever it is lost.
///
/// Unlike a server side connection, the client has no outbound queue: [Client::send] writes the
///  frame on the caller's path. While there is no connection, sending is a silent no-op - envelopes
///  are neither queued nor reported as failed.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client{{remote:{:?}}}", self.inner.remote_addr)
    }
}

impl Client {
    /// Creates a client for the server at `address`, attempting a first connection right away.
    ///  Failure to connect is logged and left to the reconnect supervisor, so this fails only for
    ///  invalid configuration.
    pub async fn new(address: &str, config: ClientConfig, handler: Arc<dyn ClientHandler>) -> anyhow::Result<Client> {
        config.validate()?;

        let remote_addr = Address::parse(address);
        let (cancel_sender, _) = broadcast::channel(1);
        let span = info_span!("client", remote = %remote_addr);

        let inner = Arc::new(ClientInner {
            config,
            remote_addr,
            handler,
            running: AtomicBool::new(true),
            connect_lock: Mutex::new(()),
            session: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            cancel_sender,
            duties: Mutex::new(Vec::new()),
            span,
        });

        if let Err(e) = inner.connect().await {
            warn!(parent: &inner.span, "initial connection attempt failed: {}", e);
        }

        let cancel = inner.cancel_sender.subscribe();
        let supervisor = tokio::spawn(inner.clone()
            .reconnect_loop(cancel)
            .instrument(inner.span.clone()));
        inner.duties.lock().await
            .push(supervisor);

        Ok(Client { inner })
    }

    /// Connects to the server unless there is a connection already. This is what the reconnect
    ///  supervisor does periodically.
    pub async fn connect(&self) -> Result<(), MessagingError> {
        self.inner.connect().await
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        self.inner.send(&envelope)
            .instrument(self.inner.span.clone())
            .await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<Address> {
        self.inner.session.lock().await
            .as_ref()
            .map(|s| s.local_addr.clone())
    }

    pub fn remote_addr(&self) -> &Address {
        &self.inner.remote_addr
    }

    pub fn sender(&self) -> ClientSender {
        ClientSender { inner: Arc::downgrade(&self.inner) }
    }

    /// Closes the connection (if any) and stops reconnecting, returning when all of the client's
    ///  duties are gone.
    pub async fn close(&self) {
        self.inner.close()
            .instrument(self.inner.span.clone())
            .await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // best effort, duties wind down in the background
        self.inner.stop();
    }
}


/// A handle for sending through a [Client] that does not keep the client alive
#[derive(Clone)]
pub struct ClientSender {
    inner: Weak<ClientInner>,
}

impl Debug for ClientSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientSender")
    }
}

impl ClientSender {
    pub async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        let client = self.inner.upgrade()
            .ok_or(MessagingError::ConnectionClosed)?;
        client.send(&envelope)
            .instrument(client.span.clone())
            .await
    }
}


struct Session {
    /// distinguishes this session from earlier and later ones
    generation: u64,
    local_addr: Address,
    writer: OwnedWriteHalf,
    /// dropped together with the session, which terminates the session's receive loop
    _receive_guard: broadcast::Sender<()>,
}

struct ClientInner {
    config: ClientConfig,
    remote_addr: Address,
    handler: Arc<dyn ClientHandler>,
    running: AtomicBool,
    /// serializes connection attempts
    connect_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
    next_generation: AtomicU64,
    cancel_sender: broadcast::Sender<()>,
    duties: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl ClientInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running && self.cancel_sender.send(()).is_err() {
            debug!("no duties to cancel");
        }
        was_running
    }

    async fn connect(self: &Arc<Self>) -> Result<(), MessagingError> {
        self.do_connect()
            .instrument(self.span.clone())
            .await
    }

    async fn do_connect(self: &Arc<Self>) -> Result<(), MessagingError> {
        let _connect_guard = self.connect_lock.lock().await;

        let mut cancel = self.cancel_sender.subscribe();
        if !self.is_running() {
            return Ok(());
        }
        if self.session.lock().await.is_some() {
            trace!("already connected");
            return Ok(());
        }

        debug!("connecting");
        let stream = select! {
            r = TcpStream::connect(self.remote_addr.to_string()) => r
                .map_err(|e| MessagingError::DialFailure { addr: self.remote_addr.clone(), source: e })?,
            _ = cancel.recv() => return Ok(()),
        };

        if let Some(keep_alive) = self.config.keep_alive {
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(keep_alive)) {
                warn!("failed to enable keep-alive: {}", e);
            }
        }
        let local_addr = Address::from(stream.local_addr()?);

        if !self.is_running() {
            debug!("client was closed while connecting");
            return Ok(());
        }

        let (reader, writer) = stream.into_split();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (receive_guard, session_ended) = broadcast::channel(1);
        *self.session.lock().await = Some(Session {
            generation,
            local_addr: local_addr.clone(),
            writer,
            _receive_guard: receive_guard,
        });
        info!(local = %local_addr, "connected");

        let receiver = tokio::spawn(self.clone()
            .receive_loop(reader, generation, cancel, session_ended)
            .instrument(Span::current()));
        {
            let mut duties = self.duties.lock().await;
            duties.retain(|d| !d.is_finished());
            duties.push(receiver);
        }

        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.on_connect(local_addr).await
        }.instrument(Span::current()));

        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), MessagingError> {
        let mut cancel = self.cancel_sender.subscribe();

        let mut session = self.session.lock().await;
        let Some(current) = session.as_mut() else {
            trace!(?envelope, "not connected - dropping envelope");
            return Ok(());
        };

        let written = select! {
            r = with_deadline(self.config.write_timeout, write_frame(&mut current.writer, envelope, self.config.max_frame_len)) => r,
            _ = cancel.recv() => Err(MessagingError::ConnectionClosed),
        };

        match written {
            Ok(()) => {
                trace!(?envelope, "sent envelope");
                Ok(())
            }
            Err(e) if !e.is_connection_lost() => Err(e),
            Err(e) => {
                warn!("error writing to socket - dropping connection: {}", e);
                *session = None;
                drop(session);
                self.notify_disconnect();
                Err(e)
            }
        }
    }

    /// Forgets the session with the given generation, if it is still the current one
    async fn drop_session(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| s.generation == generation) {
            *session = None;
            drop(session);
            self.notify_disconnect();
        }
    }

    fn notify_disconnect(&self) {
        if !self.is_running() {
            return;
        }
        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.on_disconnect().await
        }.instrument(Span::current()));
    }

    /// Runs while the client is running and the session with the given generation is current
    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, generation: u64, mut cancel: broadcast::Receiver<()>, mut session_ended: broadcast::Receiver<()>) {
        debug!(generation, "starting receive loop");

        while self.is_running() {
            let received = select! {
                r = with_deadline(self.config.read_timeout, read_frame(&mut reader, self.config.max_frame_len)) => r,
                _ = cancel.recv() => break,
                _ = session_ended.recv() => {
                    debug!(generation, "session was dropped");
                    break;
                }
            };

            match received {
                Ok(envelope) => {
                    trace!(?envelope, "received envelope");
                    let handler = self.handler.clone();
                    let sender = ClientSender { inner: Arc::downgrade(&self) };
                    tokio::spawn(async move {
                        handler.on_recv(sender, envelope).await
                    }.instrument(Span::current()));
                }
                Err(e) if e.is_connection_lost() => {
                    info!("connection lost: {}", e);
                    self.drop_session(generation).await;
                    break;
                }
                Err(e) => {
                    warn!("error receiving message - skipping: {}", e);
                }
            }
        }

        debug!(generation, "receive loop terminated");
    }

    async fn reconnect_loop(self: Arc<Self>, mut cancel: broadcast::Receiver<()>) {
        debug!("starting reconnect supervisor");

        let mut failures = RepeatedMessageFilter::default();
        while self.is_running() {
            select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = cancel.recv() => break,
            }

            match self.connect().await {
                Ok(()) => {
                    if failures.reset() {
                        info!("connection re-established");
                    }
                }
                Err(e) => {
                    if failures.is_new(e.to_string()) {
                        warn!("reconnect failed: {}", e);
                    }
                }
            }
        }

        debug!("reconnect supervisor terminated");
    }

    async fn close(&self) {
        if self.stop() {
            info!("closing client");
        }

        {
            let _connect_guard = self.connect_lock.lock().await;
            if self.session.lock().await.take().is_some() {
                debug!("closed connection");
            }
        }

        let mut duties = self.duties.lock().await;
        for duty in duties.drain(..) {
            if let Err(e) = duty.await {
                error!("client duty terminated abnormally: {}", e);
            }
        }
    }
}

/// Remembers the last message it let through, so that a failure repeating every few seconds
///  during an outage is logged once
#[derive(Default)]
struct RepeatedMessageFilter {
    last: Option<String>,
}

impl RepeatedMessageFilter {
    fn is_new(&mut self, message: String) -> bool {
        if self.last.as_ref() == Some(&message) {
            return false;
        }
        self.last = Some(message);
        true
    }

    /// returns `true` if there was a message to forget
    fn reset(&mut self) -> bool {
        self.last.take().is_some()
    }
}
