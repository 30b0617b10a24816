use std::time::Duration;
use anyhow::bail;

/// The largest frame payload (i.e. serialized envelope) the wire protocol allows
pub const MAX_FRAME_LEN: usize = 2048;

/// The capacity of a connection's inbound and outbound queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);


#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Received envelopes waiting for dispatch. When this queue is full, the connection stops
    ///  reading from its socket until the dispatcher catches up.
    pub inbound_queue_capacity: usize,

    /// Envelopes waiting to be written to a connection's socket
    pub outbound_queue_capacity: usize,

    /// Both sides of a connection must agree on this. Frame lengths above
    ///  [MAX_FRAME_LEN] are not part of the protocol and are rejected by peers using the
    ///  default.
    pub max_frame_len: usize,

    /// If set, a connection that does not receive a complete frame in this interval is closed.
    ///  `None` means that a silent peer can keep a connection open indefinitely.
    pub read_timeout: Option<Duration>,

    /// If set, a connection whose socket does not accept a frame in this interval is closed
    pub write_timeout: Option<Duration>,

    /// TCP keep-alive for accepted sockets
    pub keep_alive: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            inbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: MAX_FRAME_LEN,
            read_timeout: None,
            write_timeout: None,
            keep_alive: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inbound_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        validate_max_frame_len(self.max_frame_len)?;
        validate_timeouts(self.read_timeout, self.write_timeout)
    }
}


#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pause between two connection attempts of the reconnect supervisor. There is no backoff
    ///  and no limit on the number of attempts.
    pub reconnect_interval: Duration,

    pub keep_alive: Option<Duration>,

    pub max_frame_len: usize,

    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            keep_alive: Some(Duration::from_secs(5)),
            max_frame_len: MAX_FRAME_LEN,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be positive");
        }
        validate_max_frame_len(self.max_frame_len)?;
        validate_timeouts(self.read_timeout, self.write_timeout)
    }
}

fn validate_max_frame_len(max_frame_len: usize) -> anyhow::Result<()> {
    if max_frame_len == 0 {
        bail!("max frame length must be positive");
    }
    if i64::try_from(max_frame_len).is_err() {
        bail!("max frame length {} does not fit the length prefix", max_frame_len);
    }
    Ok(())
}

fn validate_timeouts(read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> anyhow::Result<()> {
    if read_timeout.is_some_and(|t| t.is_zero()) || write_timeout.is_some_and(|t| t.is_zero()) {
        bail!("timeouts must be positive if they are set");
    }
    Ok(())
}
