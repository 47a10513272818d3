//! Daemon: the homedb accept loop.
//!
//! The daemon owns the listener, the shared [`Service`] and one thread per
//! connection. Connection threads and outside callers talk to the main
//! loop through an mpsc channel; the main loop is its single consumer.
//!
//! # Main loop tick
//!
//! 1. Drain channel: reap closed connections, stop on shutdown
//! 2. Accept connections (non-blocking poll bounded by `accept_poll_ms`)

use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::service::{serve_connection, Service};
use crate::subscription::ConnectionId;
use crate::transport::{Duplex, Endpoint, Listener};


#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("cannot bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("daemon channel closed")]
    ChannelClosed,
}


/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A connection thread finished.
    ConnectionClosed { connection: ConnectionId },
    /// Request the daemon to shut down gracefully.
    Shutdown,
}


/// Cloneable sender for [`DaemonEvent`]s.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    /// Request daemon shutdown.
    pub fn shutdown(&self) -> Result<(), DaemonError> {
        self.sender
            .send(DaemonEvent::Shutdown)
            .map_err(|_| DaemonError::ChannelClosed)
    }

    pub(crate) fn connection_closed(&self, connection: ConnectionId) -> Result<(), DaemonError> {
        self.sender
            .send(DaemonEvent::ConnectionClosed { connection })
            .map_err(|_| DaemonError::ChannelClosed)
    }
}


struct Connection {
    stream: Box<dyn Duplex>,
    thread: JoinHandle<()>,
}


/// The homedb daemon.
pub struct Daemon {
    service: Arc<Service>,
    listener: Listener,
    endpoint: Endpoint,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
    accept_poll: Duration,
    connections: HashMap<ConnectionId, Connection>,
}

impl Daemon {
    /// Bind `endpoint` and set up an empty tree.
    pub fn bind(endpoint: &Endpoint, config: &ServerConfig) -> Result<Daemon, DaemonError> {
        let bind_err = |source| DaemonError::Bind {
            endpoint: endpoint.clone(),
            source,
        };
        let listener = Listener::bind(endpoint).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let endpoint = listener.local_endpoint().map_err(bind_err)?;
        let (sender, receiver) = mpsc::channel();
        info!(%endpoint, "daemon listening");
        Ok(Daemon {
            service: Arc::new(Service::new(config.max_frame_bytes)),
            listener,
            endpoint,
            receiver,
            handle: DaemonHandle { sender },
            accept_poll: config.accept_poll(),
            connections: HashMap::new(),
        })
    }

    /// Get a handle for sending events to this daemon.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// The endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn service(&self) -> Arc<Service> {
        Arc::clone(&self.service)
    }

    /// Run the main event loop. Blocks until shutdown is received.
    pub fn run(mut self) -> Result<(), DaemonError> {
        let result = loop {
            match self.tick() {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };
        self.close();
        result
    }

    /// Run one tick. Returns true if shutdown was requested.
    pub fn tick(&mut self) -> Result<bool, DaemonError> {
        if self.drain_channel() {
            return Ok(true);
        }
        self.accept_until(Instant::now() + self.accept_poll)?;
        Ok(false)
    }

    fn drain_channel(&mut self) -> bool {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                DaemonEvent::Shutdown => return true,
                DaemonEvent::ConnectionClosed { connection } => {
                    if let Some(conn) = self.connections.remove(&connection) {
                        let _ = conn.thread.join();
                    }
                }
            }
        }
        false
    }

    fn accept_until(&mut self, deadline: Instant) -> Result<(), DaemonError> {
        let poll_interval = Duration::from_millis(5);
        loop {
            match self.listener.accept() {
                Ok(stream) => self.spawn_connection(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    thread::sleep(poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(DaemonError::Accept(e));
                }
            }
        }
    }

    fn spawn_connection(&mut self, stream: Box<dyn Duplex>) {
        let control = match stream.try_clone_duplex() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot clone accepted stream");
                return;
            }
        };
        let connection = self.service.register_connection();
        let service = Arc::clone(&self.service);
        let handle = self.handle.clone();
        let thread = thread::spawn(move || serve_connection(service, connection, stream, Some(handle)));
        debug!(connection, active = self.connections.len() + 1, "connection accepted");
        self.connections.insert(
            connection,
            Connection {
                stream: control,
                thread,
            },
        );
    }

    /// Close every connection, join their threads and remove the socket.
    fn close(&mut self) {
        for (_, conn) in self.connections.drain() {
            let _ = conn.stream.shutdown_both();
            let _ = conn.thread.join();
        }
        self.listener.cleanup();
        info!(endpoint = %self.endpoint, "daemon stopped");
    }
}


/// Bind on the caller's thread, then run the loop on a new one.
///
/// Once this returns, the endpoint accepts connections.
pub fn start_background(
    endpoint: &Endpoint,
    config: &ServerConfig,
) -> Result<(DaemonHandle, Endpoint, JoinHandle<Result<(), DaemonError>>), DaemonError> {
    let daemon = Daemon::bind(endpoint, config)?;
    let handle = daemon.handle();
    let bound = daemon.endpoint().clone();
    let thread = thread::spawn(move || daemon.run());
    Ok((handle, bound, thread))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
