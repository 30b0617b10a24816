use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::messaging::error::MessagingError;
use crate::messaging::server::Server;


/// A listener on an ephemeral loopback port
pub async fn local_listener() -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Both ends of a loopback TCP connection: (accepted, connecting)
pub async fn connected_pair() -> io::Result<(TcpStream, TcpStream)> {
    let (listener, addr) = local_listener().await?;
    let (connecting, accepted) = tokio::join!(
        TcpStream::connect(addr),
        listener.accept(),
    );
    Ok((accepted?.0, connecting?))
}

/// Starts serving on an ephemeral loopback port in a spawned task
pub async fn spawn_server(server: &Server) -> io::Result<(SocketAddr, JoinHandle<Result<(), MessagingError>>)> {
    let (listener, addr) = local_listener().await?;
    let server = server.clone();
    let serving = tokio::spawn(async move {
        server.serve(listener).await
    });
    Ok((addr, serving))
}
