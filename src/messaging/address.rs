use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;


/// The identity of a peer on the wire, as given by its textual `ip:port` form. This is the key
///  under which a server registers its connections.
///
/// NB: Equality is structural, i.e. two addresses are equal iff their `ip` and `port` strings are
///      equal. `127.0.0.1:80` and `localhost:80` are different addresses even though they refer
///      to the same socket.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address {
    pub ip: String,
    pub port: String,
}

impl Address {
    /// used when the host part of an address is empty, e.g. in `":8080"`
    pub const DEFAULT_IP: &'static str = "127.0.0.1";

    /// Splits the textual form on the first colon. An empty host part defaults to
    ///  [Address::DEFAULT_IP]; input without a colon is all ip with an empty port.
    ///
    /// Parsing never fails - an address that can not be resolved fails later, when it is
    ///  dialed or bound.
    pub fn parse(address: &str) -> Address {
        if let Some(bracketed) = address.strip_prefix('[') {
            if let Some((ip, rest)) = bracketed.split_once(']') {
                if let Some(port) = rest.strip_prefix(':') {
                    return Address::new(ip, port);
                }
            }
        }

        match address.split_once(':') {
            None => Address::new(address, ""),
            Some(("", port)) => Address::new(Self::DEFAULT_IP, port),
            Some((ip, port)) => Address::new(ip, port),
        }
    }

    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Address {
        Address {
            ip: ip.into(),
            port: port.into(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        }
        else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port().to_string())
    }
}
