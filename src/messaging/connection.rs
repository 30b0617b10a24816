use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::messaging::address::Address;
use crate::messaging::config::ServerConfig;
use crate::messaging::envelope::Envelope;
use crate::messaging::error::MessagingError;
use crate::messaging::framing::{read_frame, with_deadline, write_frame};
use crate::messaging::handler::ServerHandler;
use crate::messaging::server::ServerSender;


/// A connection reports fatal errors on its socket to its owner, and the owner is responsible for
///  closing the connection and forgetting about it.
///
/// The connection id disambiguates between different connections from the same address over time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionOwner: Send + Sync + 'static {
    async fn close_connection(&self, addr: Address, connection_id: u64);
}

/// The parts of a connection that are moved into its duties when it is started.
///
/// Cancellation receivers are subscribed when the connection is created so that a close can never
///  slip in between subscribing and starting.
pub struct ConnectionDuties {
    stream: TcpStream,
    inbound_sender: mpsc::Sender<Envelope>,
    inbound_receiver: mpsc::Receiver<Envelope>,
    outbound_receiver: mpsc::Receiver<Envelope>,
    cancel_receivers: [broadcast::Receiver<()>; 3],
}

/// The server side of an accepted socket. A connection runs three duties concurrently:
///
/// * *receive* reads frames from the socket and puts them into the bounded inbound queue. If the
///    queue is full, reading from the socket pauses - that is the connection's backpressure.
/// * *dispatch* takes envelopes from the inbound queue in wire order and calls the handler, each
///    call in a task of its own
/// * *send* takes envelopes from the bounded outbound queue and writes them to the socket
///
/// A clean close by the peer or a failed write is reported to the [ConnectionOwner]. Everything else
///  that goes wrong with a single frame is logged, and the connection continues.
pub struct Connection {
    id: u64,
    addr: Address,
    config: Arc<ServerConfig>,
    handler: Arc<dyn ServerHandler>,
    sender: ServerSender,
    owner: Weak<dyn ConnectionOwner>,
    outbound_sender: mpsc::Sender<Envelope>,
    running: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
    duties: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{id:{}, addr:{:?}}}", self.id, self.addr)
    }
}

impl Connection {
    pub fn new(
        id: u64,
        addr: Address,
        stream: TcpStream,
        config: Arc<ServerConfig>,
        handler: Arc<dyn ServerHandler>,
        sender: ServerSender,
        owner: Weak<dyn ConnectionOwner>,
    ) -> (Arc<Connection>, ConnectionDuties) {
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_queue_capacity);
        let (outbound_sender, outbound_receiver) = mpsc::channel(config.outbound_queue_capacity);
        let (cancel_sender, _) = broadcast::channel(1);

        let duties = ConnectionDuties {
            stream,
            inbound_sender,
            inbound_receiver,
            outbound_receiver,
            cancel_receivers: [cancel_sender.subscribe(), cancel_sender.subscribe(), cancel_sender.subscribe()],
        };

        let span = info_span!("connection", %addr, id);
        let connection = Arc::new(Connection {
            id,
            addr,
            config,
            handler,
            sender,
            owner,
            outbound_sender,
            running: AtomicBool::new(true),
            cancel_sender,
            duties: Mutex::new(Vec::new()),
            span,
        });
        (connection, duties)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the connection's duties. If the connection was closed in the meantime, the socket is
    ///  dropped instead.
    pub async fn start(self: &Arc<Self>, duties: ConnectionDuties) {
        let mut handles = self.duties.lock().await;
        if !self.is_running() {
            debug!(addr = ?self.addr, "connection was closed before it was started");
            return;
        }

        let ConnectionDuties {
            stream,
            inbound_sender,
            inbound_receiver,
            outbound_receiver,
            cancel_receivers: [cancel_receive, cancel_dispatch, cancel_send],
        } = duties;
        let (reader, writer) = stream.into_split();

        handles.push(tokio::spawn(self.clone()
            .receive_loop(reader, inbound_sender, cancel_receive)
            .instrument(self.span.clone())));
        handles.push(tokio::spawn(self.clone()
            .dispatch_loop(inbound_receiver, cancel_dispatch)
            .instrument(self.span.clone())));
        handles.push(tokio::spawn(self.clone()
            .send_loop(writer, outbound_receiver, cancel_send)
            .instrument(self.span.clone())));
    }

    /// Puts an envelope into the outbound queue, waiting for room if the queue is full
    pub async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        self.check_sendable(&envelope)?;
        self.outbound_sender.send(envelope).await
            .map_err(|_| MessagingError::ConnectionClosed)
    }

    /// Puts an envelope into the outbound queue, failing if the queue is full
    pub fn try_send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        self.check_sendable(&envelope)?;
        match self.outbound_sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MessagingError::QueueFull(self.addr.clone())),
            Err(TrySendError::Closed(_)) => Err(MessagingError::ConnectionClosed),
        }
    }

    fn check_sendable(&self, envelope: &Envelope) -> Result<(), MessagingError> {
        if !self.is_running() {
            return Err(MessagingError::ConnectionClosed);
        }
        let len = envelope.serialized_len();
        if len > self.config.max_frame_len {
            return Err(MessagingError::FrameTooLarge { len, max: self.config.max_frame_len });
        }
        Ok(())
    }

    /// Stops all duties and waits for them to terminate, which closes the socket. This is
    ///  idempotent, and concurrent calls all return only after the duties are gone.
    pub async fn close(&self) {
        if self.stop() {
            debug!(addr = ?self.addr, "closing connection");
        }

        let mut handles = self.duties.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(addr = ?self.addr, "connection duty terminated abnormally: {}", e);
            }
        }
    }

    /// returns `true` for the call that actually stopped the connection
    fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running && self.cancel_sender.send(()).is_err() {
            debug!("no duties to cancel");
        }
        was_running
    }

    fn report_failure(&self) {
        if !self.is_running() {
            // already closing
            return;
        }

        match self.owner.upgrade() {
            Some(owner) => {
                let addr = self.addr.clone();
                let id = self.id;
                tokio::spawn(async move {
                    owner.close_connection(addr, id).await
                }.instrument(Span::current()));
            }
            None => {
                debug!("owner is gone, stopping connection");
                self.stop();
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, inbound: mpsc::Sender<Envelope>, mut cancel: broadcast::Receiver<()>) {
        debug!("starting receive loop");

        while self.is_running() {
            let received = select! {
                r = with_deadline(self.config.read_timeout, read_frame(&mut reader, self.config.max_frame_len)) => r,
                _ = cancel.recv() => break,
            };

            match received {
                Ok(envelope) => {
                    if envelope.is_control() {
                        trace!("skipping control message");
                        continue;
                    }

                    trace!(?envelope, "received envelope");
                    select! {
                        r = inbound.send(envelope) => if r.is_err() { break; },
                        _ = cancel.recv() => break,
                    }
                }
                Err(e) if e.is_connection_lost() => {
                    info!("connection lost: {}", e);
                    self.report_failure();
                    break;
                }
                Err(e) => {
                    warn!("error receiving message - skipping: {}", e);
                }
            }
        }

        debug!("receive loop terminated");
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>, mut cancel: broadcast::Receiver<()>) {
        debug!("starting dispatch loop");

        while self.is_running() {
            let envelope = select! {
                r = inbound.recv() => match r {
                    Some(envelope) => envelope,
                    None => break,
                },
                _ = cancel.recv() => break,
            };

            let handler = self.handler.clone();
            let sender = self.sender.clone();
            let from = self.addr.clone();
            tokio::spawn(async move {
                handler.on_recv(sender, from, envelope).await
            }.instrument(Span::current()));
        }

        debug!("dispatch loop terminated");
    }

    async fn send_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Envelope>, mut cancel: broadcast::Receiver<()>) {
        debug!("starting send loop");

        while self.is_running() {
            let envelope = select! {
                r = outbound.recv() => match r {
                    Some(envelope) => envelope,
                    None => break,
                },
                _ = cancel.recv() => break,
            };

            let written = select! {
                r = with_deadline(self.config.write_timeout, write_frame(&mut writer, &envelope, self.config.max_frame_len)) => r,
                _ = cancel.recv() => break,
            };

            match written {
                Ok(()) => trace!(?envelope, "sent envelope"),
                Err(e) if e.is_connection_lost() => {
                    warn!("error writing to socket - closing connection: {}", e);
                    self.report_failure();
                    break;
                }
                Err(e) => {
                    warn!("error sending message - skipping: {}", e);
                }
            }
        }

        debug!("send loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::{always, eq};
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;
    use crate::messaging::config::MAX_FRAME_LEN;
    use crate::messaging::framing::encode_frame;
    use crate::test_util::handler::{next_event, RecordingServerHandler, ServerEvent};
    use crate::test_util::net::connected_pair;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        connection: Arc<Connection>,
        duties: Option<ConnectionDuties>,
        peer: TcpStream,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        owner: Arc<dyn ConnectionOwner>,
    }

    async fn fixture(owner: MockConnectionOwner) -> Fixture {
        let (server_side, peer) = connected_pair().await.unwrap();
        let addr = Address::from(server_side.peer_addr().unwrap());

        let (handler, events) = RecordingServerHandler::new();
        let owner: Arc<dyn ConnectionOwner> = Arc::new(owner);

        let (connection, duties) = Connection::new(
            17,
            addr,
            server_side,
            Arc::new(ServerConfig::default()),
            handler,
            ServerSender::detached(),
            Arc::downgrade(&owner),
        );

        Fixture {
            connection,
            duties: Some(duties),
            peer,
            events,
            owner,
        }
    }

    async fn started_fixture(owner: MockConnectionOwner) -> Fixture {
        let mut fixture = fixture(owner).await;
        let duties = fixture.duties.take().unwrap();
        fixture.connection.start(duties).await;
        fixture
    }

    #[tokio::test]
    async fn test_receive_and_dispatch() {
        let mut f = started_fixture(MockConnectionOwner::new()).await;

        f.peer.write_all(&encode_frame(&Envelope::new(1, "ping"), MAX_FRAME_LEN).unwrap()).await.unwrap();
        f.peer.write_all(&encode_frame(&Envelope::new(2, "pong"), MAX_FRAME_LEN).unwrap()).await.unwrap();

        let mut received = vec![next_event(&mut f.events).await, next_event(&mut f.events).await];
        received.sort_by_key(|e| format!("{:?}", e));

        let addr = f.connection.addr().clone();
        assert_eq!(received, vec![
            ServerEvent::Received(addr.clone(), Envelope::new(1, "ping")),
            ServerEvent::Received(addr, Envelope::new(2, "pong")),
        ]);

        f.connection.close().await;
    }

    #[tokio::test]
    async fn test_control_messages_are_not_dispatched() {
        let mut f = started_fixture(MockConnectionOwner::new()).await;

        f.peer.write_all(&encode_frame(&Envelope::new(0, "heartbeat"), MAX_FRAME_LEN).unwrap()).await.unwrap();
        f.peer.write_all(&encode_frame(&Envelope::new(5, "data"), MAX_FRAME_LEN).unwrap()).await.unwrap();

        assert_eq!(next_event(&mut f.events).await, ServerEvent::Received(f.connection.addr().clone(), Envelope::new(5, "data")));

        f.connection.close().await;
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_close_connection() {
        let mut f = started_fixture(MockConnectionOwner::new()).await;

        // valid length, but the payload is not an envelope
        f.peer.write_all(b"\0\0\0\0\0\0\0\x02\x01\x05").await.unwrap();
        f.peer.write_all(&encode_frame(&Envelope::new(3, "after"), MAX_FRAME_LEN).unwrap()).await.unwrap();

        assert_eq!(next_event(&mut f.events).await, ServerEvent::Received(f.connection.addr().clone(), Envelope::new(3, "after")));
        assert!(f.connection.is_running());

        f.connection.close().await;
    }

    #[tokio::test]
    async fn test_send() {
        let mut f = started_fixture(MockConnectionOwner::new()).await;

        f.connection.send(Envelope::new(1, "first")).await.unwrap();
        f.connection.try_send(Envelope::new(1, "second")).unwrap();

        assert_eq!(read_frame(&mut f.peer, MAX_FRAME_LEN).await.unwrap(), Envelope::new(1, "first"));
        assert_eq!(read_frame(&mut f.peer, MAX_FRAME_LEN).await.unwrap(), Envelope::new(1, "second"));

        f.connection.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_is_reported_to_owner() {
        let (reported_sender, mut reported) = mpsc::unbounded_channel();

        let mut owner = MockConnectionOwner::new();
        owner.expect_close_connection()
            .with(always(), eq(17))
            .times(1)
            .returning(move |addr, id| { reported_sender.send((addr, id)).unwrap(); });

        let f = started_fixture(owner).await;
        drop(f.peer);

        let (addr, id) = timeout(TEST_TIMEOUT, reported.recv()).await.unwrap().unwrap();
        assert_eq!(&addr, f.connection.addr());
        assert_eq!(id, 17);

        f.connection.close().await;
        drop(f.owner);
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let mut f = started_fixture(MockConnectionOwner::new()).await;

        let c1 = f.connection.clone();
        let c2 = f.connection.clone();
        let (_, _) = tokio::join!(
            tokio::spawn(async move { c1.close().await }),
            tokio::spawn(async move { c2.close().await }),
        );

        assert!(!f.connection.is_running());
        assert!(f.connection.duties.lock().await.is_empty());

        // all duties are gone, so the socket is closed
        let eof = timeout(TEST_TIMEOUT, read_frame(&mut f.peer, MAX_FRAME_LEN)).await.unwrap();
        assert!(matches!(eof, Err(MessagingError::ConnectionClosed)));

        assert!(matches!(f.connection.send(Envelope::new(1, "late")).await, Err(MessagingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_before_start_drops_socket() {
        let mut f = fixture(MockConnectionOwner::new()).await;
        f.connection.close().await;

        let duties = f.duties.take().unwrap();
        f.connection.start(duties).await;
        assert!(f.connection.duties.lock().await.is_empty());

        let eof = timeout(TEST_TIMEOUT, read_frame(&mut f.peer, MAX_FRAME_LEN)).await.unwrap();
        assert!(matches!(eof, Err(MessagingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_outbound_queue_is_bounded() {
        // not started, so nothing drains the queue
        let f = fixture(MockConnectionOwner::new()).await;

        for i in 0..10 {
            f.connection.try_send(Envelope::new(1, format!("msg {}", i))).unwrap();
        }
        assert!(matches!(f.connection.try_send(Envelope::new(1, "one too many")), Err(MessagingError::QueueFull(_))));

        let blocked = timeout(Duration::from_millis(50), f.connection.send(Envelope::new(1, "blocked"))).await;
        assert!(blocked.is_err());

        f.connection.close().await;
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let f = fixture(MockConnectionOwner::new()).await;

        let result = f.connection.try_send(Envelope::new(1, vec![0u8; 4096]));
        assert!(matches!(result, Err(MessagingError::FrameTooLarge { .. })));

        f.connection.close().await;
    }
}
