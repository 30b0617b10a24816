use std::io;
use std::time::Duration;

use crate::messaging::address::Address;


#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// the peer closed the stream cleanly between frames
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("serialized envelope has {len} bytes, exceeding the maximum frame size of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// a length prefix outside `[0, max]` - the stream is either corrupt or hostile
    #[error("invalid frame length {len}, must be between 0 and {max}")]
    InvalidFrame { len: i64, max: usize },

    #[error("stream ended after {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("failed to decode envelope: {0}")]
    DecodeFailed(String),

    #[error("failed to connect to {addr}: {source}")]
    DialFailure { addr: Address, source: io::Error },

    #[error("failed to bind {addr}: {source}")]
    BindFailure { addr: String, source: io::Error },

    #[error("no connection registered for {0}")]
    AddressNotRegistered(Address),

    #[error("outbound queue for {0} is full")]
    QueueFull(Address),

    #[error("no progress on socket for {0:?}")]
    Timeout(Duration),

    #[error("server is no longer running")]
    ServerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MessagingError {
    /// Errors after which the stream can not be used any more. All other receive errors are
    ///  specific to a single frame, and the connection stays open.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, MessagingError::ConnectionClosed | MessagingError::Timeout(_) | MessagingError::Io(_))
    }
}
