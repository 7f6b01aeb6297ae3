//! Client side of the fenced worker protocol.
//!
//! Deadlines are connection-level: a call's timeout covers writing the request
//! and reading the complete response. There is no mid-call cancellation; when
//! the deadline passes the caller gets [`TransportError::Timeout`].
//!
//! If no byte of the reply had arrived by then, the worker is presumably still
//! running the call and the connection is left [awaiting its reply](Connection::is_awaiting_reply).
//! The owner either waits the call out with [`Connection::discard_late_reply`]
//! or cuts it off through a [`CallInterrupter`]. A reply that was partially
//! read leaves the stream unusable and the connection must be dropped.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::codec::{CasCodec, CodecError, JsonCasCodec};
use super::frame::{read_frame, write_frame, Frame, FrameError, FrameKind};
use super::Endpoint;
use crate::cas::{Cas, ProcessingResourceMetaData};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures talking to a fenced worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("No response within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Connection broken: {0}")]
    Broken(#[source] io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Worker reported an error: {0}")]
    Remote(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Proxy is not bound to an endpoint")]
    NotBound,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The worker is unreachable or the stream is corrupt. Timeouts excluded.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Broken(_) | Self::Protocol(_) | Self::NotBound
        )
    }

    /// Whether the connection must be discarded after this error.
    pub fn poisons_connection(&self) -> bool {
        !matches!(self, Self::Remote(_) | Self::Codec(_))
    }

    fn from_frame(error: FrameError, timeout: Duration) -> Self {
        match error {
            FrameError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Self::Timeout { timeout }
            }
            FrameError::Io(e) => Self::Broken(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Connection factory carrying timeouts and the payload codec.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    connect_timeout: Duration,
    call_timeout: Duration,
    codec: Arc<dyn CasCodec>,
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            codec: Arc::new(JsonCasCodec),
        }
    }
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn CasCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn codec(&self) -> Arc<dyn CasCodec> {
        Arc::clone(&self.codec)
    }

    /// Opens a TCP connection. No handshake is performed.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        let connect_error = |source| TransportError::Connect {
            endpoint: endpoint.clone(),
            source,
        };

        let addrs = endpoint.resolve().map_err(connect_error)?;
        let mut last_error = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "endpoint resolved to no addresses",
        );

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(connect_error)?;
                    return Ok(Connection {
                        endpoint: endpoint.clone(),
                        stream,
                        codec: Arc::clone(&self.codec),
                        call_timeout: self.call_timeout,
                        bytes_sent: 0,
                        bytes_received: 0,
                        awaiting_reply: false,
                    });
                }
                Err(e) => last_error = e,
            }
        }
        Err(connect_error(last_error))
    }
}

/// One persistent connection to a fenced worker.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    stream: TcpStream,
    codec: Arc<dyn CasCodec>,
    call_timeout: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    awaiting_reply: bool,
}

impl Connection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Total bytes written and read on this connection.
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_sent, self.bytes_received)
    }

    /// A call timed out before its reply started; the worker may still be
    /// running it.
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Handle that severs this connection from another thread.
    pub fn interrupter(&self) -> io::Result<CallInterrupter> {
        self.stream.try_clone().map(CallInterrupter)
    }

    /// Blocks until the reply of a timed-out call arrives and throws it away.
    ///
    /// No deadline applies: the wait ends when the worker answers, closes the
    /// connection, or a [`CallInterrupter`] fires. On success the connection
    /// is clean and can carry further calls.
    pub fn discard_late_reply(&mut self) -> Result<(), TransportError> {
        if !self.awaiting_reply {
            return Ok(());
        }
        self.stream
            .set_read_timeout(None)
            .map_err(TransportError::Broken)?;
        let mut stream = &self.stream;
        let reply = read_frame(&mut stream).map_err(|e| match e {
            FrameError::Io(e) => TransportError::Broken(e),
            other => TransportError::Protocol(other.to_string()),
        })?;
        self.bytes_received += reply.wire_len() as u64;
        self.awaiting_reply = false;
        Ok(())
    }

    /// Announces the protocol version and waits for the worker's `Ack`.
    pub fn handshake(&mut self) -> Result<(), TransportError> {
        let reply = self.exchange(Frame::hello())?;
        Self::expect_ack(reply)
    }

    /// Sends `cas` to the worker and replaces its contents with the result.
    pub fn invoke(&mut self, cas: &mut Cas) -> Result<(), TransportError> {
        let payload = self.codec.encode(cas)?;
        let reply = self.exchange(Frame::new(FrameKind::Process, payload))?;
        match reply.kind {
            FrameKind::Processed => {
                let processed = self.codec.decode(&reply.payload)?;
                cas.replace_payload(processed);
                Ok(())
            }
            FrameKind::Error => Err(TransportError::Remote(reply.payload_text())),
            other => Err(TransportError::Protocol(format!(
                "expected Processed, got {:?}",
                other
            ))),
        }
    }

    /// Fetches the worker's component metadata.
    pub fn metadata(&mut self) -> Result<ProcessingResourceMetaData, TransportError> {
        let reply = self.exchange(Frame::empty(FrameKind::GetMetaData))?;
        match reply.kind {
            FrameKind::MetaData => serde_json::from_slice(&reply.payload)
                .map_err(|e| TransportError::Protocol(format!("invalid metadata: {}", e))),
            FrameKind::Error => Err(TransportError::Remote(reply.payload_text())),
            other => Err(TransportError::Protocol(format!(
                "expected MetaData, got {:?}",
                other
            ))),
        }
    }

    pub fn batch_complete(&mut self) -> Result<(), TransportError> {
        let reply = self.exchange(Frame::empty(FrameKind::BatchComplete))?;
        Self::expect_ack(reply)
    }

    pub fn collection_complete(&mut self) -> Result<(), TransportError> {
        let reply = self.exchange(Frame::empty(FrameKind::CollectionComplete))?;
        Self::expect_ack(reply)
    }

    fn expect_ack(reply: Frame) -> Result<(), TransportError> {
        match reply.kind {
            FrameKind::Ack => Ok(()),
            FrameKind::Error => Err(TransportError::Remote(reply.payload_text())),
            other => Err(TransportError::Protocol(format!(
                "expected Ack, got {:?}",
                other
            ))),
        }
    }

    fn exchange(&mut self, request: Frame) -> Result<Frame, TransportError> {
        if self.awaiting_reply {
            return Err(TransportError::Protocol(
                "reply to a timed-out call is still outstanding".to_string(),
            ));
        }
        let timeout = self.call_timeout;
        let deadline = Instant::now() + timeout;

        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::Broken)?;
        write_frame(&mut self.stream, &request)
            .map_err(|e| TransportError::from_frame(e, timeout))?;
        self.bytes_sent += request.wire_len() as u64;

        let mut reader = DeadlineReader {
            stream: &self.stream,
            deadline,
            received: 0,
        };
        let reply = match read_frame(&mut reader) {
            Ok(reply) => reply,
            Err(e) => {
                let error = TransportError::from_frame(e, timeout);
                if error.is_timeout() && reader.received == 0 {
                    self.awaiting_reply = true;
                }
                return Err(error);
            }
        };
        self.bytes_received += reply.wire_len() as u64;
        Ok(reply)
    }
}

/// Severs a [`Connection`] from outside the thread that owns it.
///
/// Any blocked read on the connection returns at once.
#[derive(Debug)]
pub struct CallInterrupter(TcpStream);

impl CallInterrupter {
    pub fn interrupt(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Applies one deadline across every read of a response.
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
    received: usize,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "call deadline elapsed",
            ));
        }
        self.stream.set_read_timeout(Some(remaining))?;
        let mut stream = self.stream;
        let n = stream.read(buf)?;
        self.received += n;
        Ok(n)
    }
}
