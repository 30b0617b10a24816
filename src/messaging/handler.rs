use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::address::Address;
use crate::messaging::client::ClientSender;
use crate::messaging::envelope::Envelope;
use crate::messaging::server::ServerSender;


/// Socket level information about an accepted connection
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Application callbacks of a [crate::messaging::server::Server]. The handler is passed in when the
///  server is created and can not be replaced afterwards.
///
/// Every callback runs in a task of its own, so a slow callback does not hold up the connection.
///  This means that callbacks for messages on the same connection may run concurrently and
///  complete in any order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    async fn on_connect(&self, _server: ServerSender, _info: ConnectionInfo, _addr: Address) {}

    async fn on_recv(&self, server: ServerSender, from: Address, envelope: Envelope);

    /// called when a connection is closed because the peer went away, a write failed or the
    ///  application called [crate::messaging::server::Server::disconnect].
    ///
    /// The callback fires exactly once per connection, from whichever of these removes the
    ///  connection from the registry. Closing the server as a whole removes all connections without
    ///  calling it, and that includes a connection whose peer goes away while the server is
    ///  closing.
    async fn on_disconnect(&self, _addr: Address) {}
}

/// Application callbacks of a [crate::messaging::client::Client]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// called each time a connection to the server is established, initially or by the
    ///  reconnect supervisor
    async fn on_connect(&self, _local_addr: Address) {}

    async fn on_recv(&self, client: ClientSender, envelope: Envelope);

    async fn on_disconnect(&self) {}
}
