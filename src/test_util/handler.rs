use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messaging::address::Address;
use crate::messaging::client::ClientSender;
use crate::messaging::envelope::Envelope;
use crate::messaging::handler::{ClientHandler, ConnectionInfo, ServerHandler};
use crate::messaging::server::ServerSender;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectionInfo, Address),
    Received(Address, Envelope),
    Disconnected(Address),
}

/// A [ServerHandler] that turns every callback into a [ServerEvent]
pub struct RecordingServerHandler {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl RecordingServerHandler {
    pub fn new() -> (Arc<RecordingServerHandler>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingServerHandler { events }), receiver)
    }
}

#[async_trait]
impl ServerHandler for RecordingServerHandler {
    async fn on_connect(&self, _server: ServerSender, info: ConnectionInfo, addr: Address) {
        self.events.send(ServerEvent::Connected(info, addr)).ok();
    }

    async fn on_recv(&self, _server: ServerSender, from: Address, envelope: Envelope) {
        self.events.send(ServerEvent::Received(from, envelope)).ok();
    }

    async fn on_disconnect(&self, addr: Address) {
        self.events.send(ServerEvent::Disconnected(addr)).ok();
    }
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientEvent {
    Connected(Address),
    Received(Envelope),
    Disconnected,
}

/// A [ClientHandler] that turns every callback into a [ClientEvent]
pub struct RecordingClientHandler {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl RecordingClientHandler {
    pub fn new() -> (Arc<RecordingClientHandler>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingClientHandler { events }), receiver)
    }
}

#[async_trait]
impl ClientHandler for RecordingClientHandler {
    async fn on_connect(&self, local_addr: Address) {
        self.events.send(ClientEvent::Connected(local_addr)).ok();
    }

    async fn on_recv(&self, _client: ClientSender, envelope: Envelope) {
        self.events.send(ClientEvent::Received(envelope)).ok();
    }

    async fn on_disconnect(&self) {
        self.events.send(ClientEvent::Disconnected).ok();
    }
}


/// Waits for the next recorded event, panicking if there is none within [EVENT_TIMEOUT]
pub async fn next_event<E: Debug>(events: &mut mpsc::UnboundedReceiver<E>) -> E {
    match tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel was closed"),
        Err(_) => panic!("no event within {:?}", EVENT_TIMEOUT),
    }
}
