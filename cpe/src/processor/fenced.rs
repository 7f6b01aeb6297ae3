use tracing::{debug, warn};

use crate::cas::{Cas, ProcessingResourceMetaData};
use crate::transport::{CallInterrupter, Connection, Endpoint, SocketTransport, TransportError};

/// Local stand-in for one fenced worker.
///
/// A proxy is bound to at most one endpoint at a time. The connection is
/// opened on bind and dropped after any error that leaves the stream in an
/// unknown state; the next call reconnects to the same endpoint.
///
/// A call that times out while the worker is still busy leaves the proxy
/// stalled: it keeps the connection so that the late reply can be drained
/// with [`await_late_reply`](Self::await_late_reply) before any further call.
#[derive(Debug)]
pub struct FencedProxy {
    stage: String,
    transport: SocketTransport,
    endpoint: Option<Endpoint>,
    connection: Option<Connection>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl FencedProxy {
    pub fn new(stage: impl Into<String>, transport: SocketTransport) -> Self {
        Self {
            stage: stage.into(),
            transport,
            endpoint: None,
            connection: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The worker may still be running a call that already timed out.
    pub fn is_stalled(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(Connection::is_awaiting_reply)
    }

    /// Handle that cuts off the stalled call, if there is one.
    pub fn interrupter(&self) -> Option<CallInterrupter> {
        let connection = self.connection.as_ref().filter(|c| c.is_awaiting_reply())?;
        match connection.interrupter() {
            Ok(interrupter) => Some(interrupter),
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Cannot clone stalled connection");
                None
            }
        }
    }

    /// Waits for the reply of a stalled call and discards it.
    ///
    /// If the wait fails the connection is dropped; the worker has gone away
    /// or the wait was interrupted.
    pub fn await_late_reply(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        let result = connection.discard_late_reply();
        match &result {
            Ok(()) => debug!(stage = %self.stage, "Discarded late reply"),
            Err(e) => {
                debug!(stage = %self.stage, error = %e, "Stalled call abandoned");
                self.disconnect();
            }
        }
        result
    }

    /// Binds to `endpoint`, replacing any previous binding, and connects.
    ///
    /// The binding is kept even if the connection attempt fails.
    pub fn bind(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.disconnect();
        debug!(stage = %self.stage, endpoint = %endpoint, "Binding proxy");
        self.endpoint = Some(endpoint);
        self.connection().map(|_| ())
    }

    /// Drops the connection and the binding, returning the old endpoint.
    pub fn unbind(&mut self) -> Option<Endpoint> {
        self.disconnect();
        self.endpoint.take()
    }

    pub fn process(&mut self, cas: &mut Cas) -> Result<(), TransportError> {
        self.call(|connection| connection.invoke(cas))
    }

    pub fn metadata(&mut self) -> Result<ProcessingResourceMetaData, TransportError> {
        self.call(Connection::metadata)
    }

    pub fn batch_process_complete(&mut self) -> Result<(), TransportError> {
        self.call(Connection::batch_complete)
    }

    pub fn collection_process_complete(&mut self) -> Result<(), TransportError> {
        self.call(Connection::collection_complete)
    }

    /// Bytes exchanged since the previous call, then resets.
    pub fn take_traffic(&mut self) -> (u64, u64) {
        let traffic = (self.bytes_sent, self.bytes_received);
        self.bytes_sent = 0;
        self.bytes_received = 0;
        traffic
    }

    fn call<R>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let connection = self.connection()?;
        let (sent_before, received_before) = connection.traffic();
        let result = op(connection);
        let (sent_after, received_after) = connection.traffic();
        let stalled = connection.is_awaiting_reply();
        self.bytes_sent += sent_after - sent_before;
        self.bytes_received += received_after - received_before;

        if let Err(e) = &result {
            if stalled {
                warn!(stage = %self.stage, error = %e, "Fenced call stalled");
            } else if e.poisons_connection() {
                warn!(stage = %self.stage, error = %e, "Dropping fenced connection");
                self.disconnect();
            }
        }
        result
    }

    fn connection(&mut self) -> Result<&mut Connection, TransportError> {
        if self.connection.is_none() {
            let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotBound)?;
            let mut connection = self.transport.connect(endpoint)?;
            connection.handshake()?;
            self.connection = Some(connection);
        }
        self.connection.as_mut().ok_or(TransportError::NotBound)
    }

    fn disconnect(&mut self) {
        self.connection = None;
    }
}
