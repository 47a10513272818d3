//! Request dispatch and per-connection serving.
//!
//! [`Service`] owns the shared state: the tree behind one `RwLock` and the
//! subscription registry behind a `Mutex`. Locks are always taken tree
//! first, registry second. Mutations notify the registry while the tree's
//! write lock is still held, so pushes leave in mutation order.
//!
//! [`serve_connection`] runs one connection: the calling thread reads and
//! handles frames in arrival order, and a writer thread drains an outbox
//! that replies and pushes share. The outbox holds at most
//! [`OUTBOX_CAPACITY`] frames; a connection that lets it fill is closed.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use tracing::{debug, info, warn};

use crate::daemon::DaemonHandle;
use crate::error::TreeError;
use crate::namespace::{Change, Tree, DEFAULT_KIND};
use crate::query::GroupPlan;
use crate::subscription::{ConnectionId, SubscriptionRegistry};
use crate::transport::Duplex;
use crate::types::protocol::{Frame, Message, Token};
use crate::wire::{self, WireError};


/// Frames queued per connection before its peer counts as not reading.
pub const OUTBOX_CAPACITY: usize = 1024;


/// What the connection loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// A `shutdown` request was acknowledged.
    Shutdown,
    /// The reply did not fit in the outbox.
    Overflow,
}


/// Shared server state.
pub struct Service {
    tree: RwLock<Tree>,
    registry: Mutex<SubscriptionRegistry>,
    next_connection: AtomicU64,
    max_frame_bytes: usize,
}

impl Service {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self::with_tree(Tree::new(), max_frame_bytes)
    }

    pub fn with_tree(tree: Tree, max_frame_bytes: usize) -> Self {
        Service {
            tree: RwLock::new(tree),
            registry: Mutex::new(SubscriptionRegistry::new()),
            next_connection: AtomicU64::new(0),
            max_frame_bytes,
        }
    }

    /// Allocate an id for a new connection.
    pub fn register_connection(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Forget everything a closed connection owned.
    pub fn release_connection(&self, connection: ConnectionId) {
        self.registry().remove_connection(connection);
    }

    /// Run `f` against the tree under the read lock.
    pub fn read_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.read())
    }

    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one request frame. Every reply, including errors, goes to
    /// `outbox` tagged with the request's token.
    ///
    /// Replies are queued without blocking, since mutations reply while
    /// holding the tree lock. A full outbox yields [`Outcome::Overflow`].
    pub fn handle(&self, connection: ConnectionId, frame: Frame, outbox: &SyncSender<Frame>) -> Outcome {
        let token = frame.token;
        let operation = frame.message.name();
        let overflow = Cell::new(false);
        let reply = |message: Message| {
            if let Err(TrySendError::Full(_)) = outbox.try_send(Frame::new(token, message)) {
                overflow.set(true);
            }
        };
        let fail = |error: TreeError| {
            debug!(%token, operation, error = %error, "request failed");
            reply(Message::Error {
                operation: operation.to_string(),
                error,
            });
        };

        match frame.message {
            Message::Ping { ping } => reply(Message::Pong { pong: ping }),

            Message::Subscribe { target } => {
                // The ack is queued under the registry lock so no push for
                // this subscription can overtake it.
                let mut registry = self.registry();
                match registry.subscribe(connection, &target, outbox.clone()) {
                    Ok(subscription_id) => reply(Message::Subscribed {
                        subscription_id,
                        target,
                    }),
                    Err(e) => fail(e),
                }
            }

            Message::Unsubscribe { subscription_id } => {
                match self.registry().unsubscribe(connection, subscription_id) {
                    Ok(()) => reply(Message::Ok),
                    Err(e) => fail(e),
                }
            }

            Message::Query { query_group } => {
                let plan = GroupPlan::compile(&query_group);
                if plan.is_mutating() {
                    let mut tree = self.write();
                    let outcome = plan.execute(&mut tree);
                    reply(Message::QueryResult {
                        results: outcome.results,
                    });
                    self.publish(&outcome.changes);
                } else {
                    let results = plan.execute_read(&self.read());
                    reply(Message::QueryResult { results });
                }
            }

            Message::CreateChild {
                parent_path,
                name,
                kind,
            } => {
                let mut tree = self.write();
                let kind = kind.as_deref().unwrap_or(DEFAULT_KIND);
                match tree.create_child_of_kind(&parent_path, &name, kind) {
                    Ok(change) => {
                        reply(Message::Ok);
                        self.publish(&[change]);
                    }
                    Err(e) => fail(e),
                }
            }

            Message::RemoveChild { parent_path, name } => {
                let mut tree = self.write();
                match tree.remove_child(&parent_path, &name) {
                    Ok(change) => {
                        reply(Message::Ok);
                        self.publish(&[change]);
                    }
                    Err(e) => fail(e),
                }
            }

            Message::ListChildren { path } => match self.read().list_children(&path) {
                Ok(children) => reply(Message::Children { children }),
                Err(e) => fail(e),
            },

            Message::GetNode { path } => match self.read().get_node(&path) {
                Ok(node) => reply(Message::Node { node }),
                Err(e) => fail(e),
            },

            Message::Shutdown => {
                info!(connection, "shutdown requested");
                reply(Message::Ok);
                if !overflow.get() {
                    return Outcome::Shutdown;
                }
            }

            Message::Pong { .. }
            | Message::Subscribed { .. }
            | Message::QueryResult { .. }
            | Message::Children { .. }
            | Message::Node { .. }
            | Message::Ok
            | Message::Error { .. }
            | Message::Push(_) => fail(TreeError::Protocol {
                reason: format!("'{}' is not a request", operation),
            }),
        }
        if overflow.get() {
            warn!(connection, %token, "outbox full, peer is not reading");
            return Outcome::Overflow;
        }
        Outcome::Continue
    }

    /// Called with the tree's write lock held.
    fn publish(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        let pushes = self.registry().notify(changes);
        if pushes > 0 {
            debug!(changes = changes.len(), pushes, "notified subscribers");
        }
    }
}


/// Serve one connection until the peer closes it or asks for shutdown.
///
/// The caller's thread is the reader. On a `shutdown` request the reply is
/// flushed before `daemon` is signalled.
pub fn serve_connection(
    service: Arc<Service>,
    connection: ConnectionId,
    stream: Box<dyn Duplex>,
    daemon: Option<DaemonHandle>,
) {
    let mut reader = stream;
    let mut writer = match reader.try_clone_duplex() {
        Ok(w) => w,
        Err(e) => {
            warn!(connection, error = %e, "cannot split stream");
            return;
        }
    };

    let (outbox, queue) = mpsc::sync_channel::<Frame>(OUTBOX_CAPACITY);
    let writer_thread = thread::spawn(move || {
        for frame in queue {
            if let Err(e) = wire::write_frame(&mut writer, &frame) {
                debug!(connection, error = %e, "writer stopped");
                break;
            }
        }
    });

    debug!(connection, "connection opened");
    let mut outcome = Outcome::Continue;
    loop {
        match wire::read_frame(&mut reader, service.max_frame_bytes) {
            Ok(frame) => {
                debug!(connection, token = %frame.token, message = frame.message.name(), "request");
                outcome = service.handle(connection, frame, &outbox);
                if outcome != Outcome::Continue {
                    break;
                }
            }
            Err(WireError::Closed) => break,
            Err(e) if !e.is_fatal() => {
                let token = e.token();
                warn!(connection, ?token, error = %e, "bad frame skipped");
                if let Some(token) = token {
                    if let Err(TrySendError::Full(_)) = outbox.try_send(protocol_error(token, e.to_string())) {
                        warn!(connection, "outbox full, peer is not reading");
                        outcome = Outcome::Overflow;
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(connection, error = %e, "connection failed");
                break;
            }
        }
    }

    service.release_connection(connection);
    drop(outbox);
    if outcome == Outcome::Overflow {
        // The writer may be blocked on a peer that stopped reading.
        let _ = reader.shutdown_both();
    }
    let _ = writer_thread.join();
    let _ = reader.shutdown_both();
    debug!(connection, "connection closed");

    if let Some(daemon) = daemon {
        if outcome == Outcome::Shutdown {
            let _ = daemon.shutdown();
        }
        let _ = daemon.connection_closed(connection);
    }
}

fn protocol_error(token: Token, reason: String) -> Frame {
    Frame::new(
        token,
        Message::Error {
            operation: "decode".to_string(),
            error: TreeError::Protocol { reason },
        },
    )
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
