//! Server side of the fenced worker protocol.
//!
//! [`WorkerServer`] accepts connections and serves each one on its own thread
//! with a fresh stage instance from the factory. Requests on a connection are
//! handled strictly in order. A connection is tracked only while its thread
//! serves it, so that shutdown can sever it.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::codec::CasCodec;
use super::frame::{read_frame, write_frame, Frame, FrameError, FrameKind, PROTOCOL_VERSION};
use super::Endpoint;
use crate::processor::{CasProcessor, ProcessorFactory};

/// Open connections keyed by accept order.
#[derive(Default)]
struct OpenStreams {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl OpenStreams {
    fn track(&self, stream: TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, stream);
        id
    }

    fn forget(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.streams.lock().len()
    }

    fn sever_all(&self) {
        for (_, stream) in self.streams.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A TCP listener hosting one stage type.
pub struct WorkerServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    streams: Arc<OpenStreams>,
    accept_thread: Option<JoinHandle<()>>,
}

impl WorkerServer {
    /// Binds `addr` and starts accepting connections in the background.
    pub fn bind(
        addr: impl ToSocketAddrs,
        factory: ProcessorFactory,
        codec: Arc<dyn CasCodec>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let streams = Arc::new(OpenStreams::default());

        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let streams = Arc::clone(&streams);
            thread::Builder::new()
                .name(format!("cpe-worker-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, factory, codec, shutdown, streams))?
        };

        info!(addr = %local_addr, "Worker server listening");
        Ok(Self {
            local_addr,
            shutdown,
            streams,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.local_addr)
    }

    /// Connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.streams.len()
    }

    /// Stops accepting, severs every open connection and joins the acceptor.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wake the blocking accept.
        let _ = TcpStream::connect(self.local_addr);

        self.streams.sever_all();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        debug!(addr = %self.local_addr, "Worker server stopped");
    }

    /// Blocks until the server is shut down from another thread or the
    /// process is terminated.
    pub fn wait(mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    factory: ProcessorFactory,
    codec: Arc<dyn CasCodec>,
    shutdown: Arc<AtomicBool>,
    streams: Arc<OpenStreams>,
) {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let id = match stream.try_clone() {
            Ok(clone) => Some(streams.track(clone)),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to track connection");
                None
            }
        };

        let factory = Arc::clone(&factory);
        let codec = Arc::clone(&codec);
        let tracked = Arc::clone(&streams);
        let spawned = thread::Builder::new()
            .name("cpe-worker-conn".to_string())
            .spawn(move || {
                serve_connection(stream, &peer, factory, codec);
                if let Some(id) = id {
                    tracked.forget(id);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn connection thread");
            if let Some(id) = id {
                streams.forget(id);
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    peer: &str,
    factory: ProcessorFactory,
    codec: Arc<dyn CasCodec>,
) {
    let mut instance = match factory() {
        Ok(instance) => Ok(instance),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to create stage instance");
            Err(e.to_string())
        }
    };
    debug!(peer = %peer, "Serving connection");

    loop {
        let request = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(peer = %peer, error = %e, "Connection read failed");
                }
                break;
            }
            Err(e @ FrameError::UnknownKind(_)) => {
                if write_frame(&mut stream, &Frame::error(e.to_string())).is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection after framing error");
                break;
            }
        };

        let reply = match &mut instance {
            Ok(processor) => handle_request(processor.as_mut(), codec.as_ref(), request),
            Err(reason) => Frame::error(format!("stage instance unavailable: {}", reason)),
        };
        if let Err(e) = write_frame(&mut stream, &reply) {
            debug!(peer = %peer, error = %e, "Connection write failed");
            break;
        }
    }
    debug!(peer = %peer, "Connection closed");
}

fn handle_request(processor: &mut dyn CasProcessor, codec: &dyn CasCodec, request: Frame) -> Frame {
    match request.kind {
        FrameKind::Hello => match <[u8; 2]>::try_from(request.payload.as_slice()) {
            Ok(bytes) if u16::from_be_bytes(bytes) == PROTOCOL_VERSION => {
                Frame::empty(FrameKind::Ack)
            }
            Ok(bytes) => Frame::error(format!(
                "unsupported protocol version {}",
                u16::from_be_bytes(bytes)
            )),
            Err(_) => Frame::error("malformed hello"),
        },
        FrameKind::Process => {
            let mut cas = match codec.decode(&request.payload) {
                Ok(cas) => cas,
                Err(e) => return Frame::error(e.to_string()),
            };
            if let Err(e) = processor.process(&mut cas) {
                return Frame::error(e.to_string());
            }
            match codec.encode(&cas) {
                Ok(payload) => Frame::new(FrameKind::Processed, payload),
                Err(e) => Frame::error(e.to_string()),
            }
        }
        FrameKind::GetMetaData => match serde_json::to_vec(&processor.metadata()) {
            Ok(payload) => Frame::new(FrameKind::MetaData, payload),
            Err(e) => Frame::error(e.to_string()),
        },
        FrameKind::BatchComplete => match processor.batch_process_complete() {
            Ok(()) => Frame::empty(FrameKind::Ack),
            Err(e) => Frame::error(e.to_string()),
        },
        FrameKind::CollectionComplete => match processor.collection_process_complete() {
            Ok(()) => Frame::empty(FrameKind::Ack),
            Err(e) => Frame::error(e.to_string()),
        },
        other => Frame::error(format!("{:?} is not a request", other)),
    }
}
