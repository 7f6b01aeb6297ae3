//! Socket transport to fenced stage workers.
//!
//! A fenced worker is a separate process hosting one stage instance behind a
//! TCP listener. The engine talks to it with the length-prefixed protocol in
//! [`frame`]:
//!
//! ```text
//! +----------------+------+------------------+
//! | length: u32 BE | kind | payload (len-1)  |
//! +----------------+------+------------------+
//! ```
//!
//! A client connects, sends `Hello`, then issues any number of sequential
//! request/response exchanges on the same connection. CAS payloads are
//! encoded by a [`CasCodec`].
//!
//! - [`SocketTransport`] / [`Connection`]: client side, with connect and call deadlines
//! - [`WorkerServer`]: server side, used by the `cpe worker` command and by
//!   [`ThreadProcessController`](crate::deployer::ThreadProcessController)

mod codec;
pub mod frame;
mod server;
mod socket;

pub use codec::{CasCodec, CodecError, JsonCasCodec};
pub use frame::{Frame, FrameError, FrameKind, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use server::WorkerServer;
pub use socket::{
    CallInterrupter, Connection, SocketTransport, TransportError, DEFAULT_CALL_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Address of one live fenced worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    /// Parses `host:port`, optionally prefixed with `tcp://`.
    pub fn parse(url: &str) -> Option<Self> {
        let address = url.trim().strip_prefix("tcp://").unwrap_or(url.trim());
        let (host, port) = address.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(Self(address.to_string()))
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok(self.0.to_socket_addrs()?.collect())
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.0)
    }
}
