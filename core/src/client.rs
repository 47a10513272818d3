//! Client: one multiplexed connection to a homedb daemon.
//!
//! After a ping/pong handshake on token 0, every request carries the next
//! token from a per-connection counter. A single receive thread owns the
//! socket's read half and the token→completion table; callers register a
//! completion with it by message passing *before* writing their request,
//! so the reply always finds its waiter. Replies may arrive in any order.
//!
//! Pushes (token 0) are handed to a separate dispatch thread which owns the
//! subscription callbacks, so a slow callback never delays reply
//! resolution.
//!
//! Every reply-awaiting call has a blocking form and an `_async` form that
//! returns a [`ReplyHandle`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, TreeError};
use crate::namespace::Node;
use crate::query::{ClientQuery, QueryGroup, QueryResult, QuerySpec};
use crate::transport::{self, Duplex, Endpoint};
use crate::types::protocol::{Frame, Message, Push, Token, HANDSHAKE_TOKEN};
use crate::wire::{self, WireError};


/// Subscription callback, run on the dispatch thread.
pub type Callback = Box<dyn FnMut(&Push) + Send>;


/// Follow-up the receive loop performs when a reply resolves.
enum ReplyAction {
    /// On `subscribed`, start routing pushes for the new id.
    InstallSubscription(Callback),
    /// On `ok`, stop routing pushes for this id.
    RemoveSubscription(u64),
}

/// Registration sent to the receive loop.
enum Control {
    Await {
        token: Token,
        reply: Sender<Message>,
        action: Option<ReplyAction>,
    },
    /// The request for `token` never reached the socket.
    Forget(Token),
}

/// Work for the dispatch thread.
enum Dispatch {
    Install(u64, Callback),
    Remove(u64),
    Push(Push),
}


type Convert<T> = fn(&'static str, Message) -> Result<T, ClientError>;


/// A pending reply.
///
/// Dropping the handle abandons the request: its token stays used and the
/// late reply is discarded by the receive loop.
pub struct ReplyHandle<T> {
    token: Token,
    operation: &'static str,
    receiver: Receiver<Message>,
    convert: Convert<T>,
    default_timeout: Option<Duration>,
}

impl<T> ReplyHandle<T> {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Wait using the connection's configured request timeout.
    pub fn wait(self) -> Result<T, ClientError> {
        match self.default_timeout {
            Some(d) => self.wait_timeout(d),
            None => self.wait_forever(),
        }
    }

    /// Wait without any bound.
    pub fn wait_forever(self) -> Result<T, ClientError> {
        match self.receiver.recv() {
            Ok(message) => (self.convert)(self.operation, message),
            Err(_) => Err(lost(self.operation)),
        }
    }

    /// Wait at most `timeout`. On expiry the request is abandoned.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, ClientError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => (self.convert)(self.operation, message),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout {
                token: self.token,
                operation: self.operation,
                after: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(lost(self.operation)),
        }
    }
}

fn lost(operation: &str) -> ClientError {
    ClientError::Connection(format!("connection lost while waiting for {}", operation))
}


/// A connection to a homedb daemon.
pub struct TreeClient {
    writer: Mutex<Box<dyn Duplex>>,
    control: Sender<Control>,
    next_token: AtomicU64,
    request_timeout: Option<Duration>,
    reader: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl TreeClient {
    /// Connect to `endpoint` and perform the handshake.
    pub fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self, ClientError> {
        let stream = transport::connect(endpoint)
            .map_err(|e| ClientError::Connection(format!("cannot connect to {}: {}", endpoint, e)))?;
        Self::from_stream(stream, config)
    }

    /// Handshake over an already open stream and start the receive loop.
    pub fn from_stream(stream: Box<dyn Duplex>, config: &ClientConfig) -> Result<Self, ClientError> {
        let mut reader = stream;
        let mut writer = reader
            .try_clone_duplex()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        handshake(&mut reader, &mut writer, config)?;

        let (control, control_rx) = mpsc::channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel();
        let max = config.max_frame_bytes;
        let reader = thread::spawn(move || receive_loop(reader, control_rx, dispatch_tx, max));
        let dispatcher = thread::spawn(move || dispatch_loop(dispatch_rx));

        Ok(TreeClient {
            writer: Mutex::new(writer),
            control,
            next_token: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            reader: Some(reader),
            dispatcher: Some(dispatcher),
        })
    }

    // -------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------

    fn request<T>(
        &self,
        message: Message,
        action: Option<ReplyAction>,
        convert: Convert<T>,
    ) -> Result<ReplyHandle<T>, ClientError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let operation = message.name();
        let (reply, receiver) = mpsc::channel();
        self.control
            .send(Control::Await {
                token,
                reply,
                action,
            })
            .map_err(|_| ClientError::Connection("receive loop has stopped".into()))?;
        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            wire::write_frame(&mut *writer, &Frame::new(token, message))
        };
        if let Err(e) = written {
            let _ = self.control.send(Control::Forget(token));
            return Err(e.into());
        }
        debug!(%token, operation, "request sent");
        Ok(ReplyHandle {
            token,
            operation,
            receiver,
            convert,
            default_timeout: self.request_timeout,
        })
    }

    // -------------------------------------------------------------------
    // Structural operations
    // -------------------------------------------------------------------

    pub fn create_child(&self, parent_path: &str, name: &str) -> Result<(), ClientError> {
        self.create_child_async(parent_path, name)?.wait()
    }

    pub fn create_child_async(&self, parent_path: &str, name: &str) -> Result<ReplyHandle<()>, ClientError> {
        self.create(parent_path, name, None)
    }

    pub fn create_child_of_kind(&self, parent_path: &str, name: &str, kind: &str) -> Result<(), ClientError> {
        self.create_child_of_kind_async(parent_path, name, kind)?.wait()
    }

    pub fn create_child_of_kind_async(
        &self,
        parent_path: &str,
        name: &str,
        kind: &str,
    ) -> Result<ReplyHandle<()>, ClientError> {
        self.create(parent_path, name, Some(kind))
    }

    fn create(&self, parent_path: &str, name: &str, kind: Option<&str>) -> Result<ReplyHandle<()>, ClientError> {
        self.request(
            Message::CreateChild {
                parent_path: parent_path.to_string(),
                name: name.to_string(),
                kind: kind.map(str::to_string),
            },
            None,
            expect_ok,
        )
    }

    pub fn remove_child(&self, parent_path: &str, name: &str) -> Result<(), ClientError> {
        self.remove_child_async(parent_path, name)?.wait()
    }

    pub fn remove_child_async(&self, parent_path: &str, name: &str) -> Result<ReplyHandle<()>, ClientError> {
        self.request(
            Message::RemoveChild {
                parent_path: parent_path.to_string(),
                name: name.to_string(),
            },
            None,
            expect_ok,
        )
    }

    pub fn list_children(&self, path: &str) -> Result<BTreeSet<String>, ClientError> {
        self.list_children_async(path)?.wait()
    }

    pub fn list_children_async(&self, path: &str) -> Result<ReplyHandle<BTreeSet<String>>, ClientError> {
        self.request(
            Message::ListChildren {
                path: path.to_string(),
            },
            None,
            expect_children,
        )
    }

    pub fn get_node(&self, path: &str) -> Result<Node, ClientError> {
        self.get_node_async(path)?.wait()
    }

    pub fn get_node_async(&self, path: &str) -> Result<ReplyHandle<Node>, ClientError> {
        self.request(
            Message::GetNode {
                path: path.to_string(),
            },
            None,
            expect_node,
        )
    }

    // -------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------

    /// Watch a path pattern (`/room/*/color`) or selector. `callback` runs
    /// on the dispatch thread for every push. Returns the subscription id.
    pub fn subscribe<F>(&self, target: &str, callback: F) -> Result<u64, ClientError>
    where
        F: FnMut(&Push) + Send + 'static,
    {
        self.subscribe_async(target, callback)?.wait()
    }

    pub fn subscribe_async<F>(&self, target: &str, callback: F) -> Result<ReplyHandle<u64>, ClientError>
    where
        F: FnMut(&Push) + Send + 'static,
    {
        self.request(
            Message::Subscribe {
                target: target.to_string(),
            },
            Some(ReplyAction::InstallSubscription(Box::new(callback))),
            expect_subscribed,
        )
    }

    pub fn unsubscribe(&self, subscription_id: u64) -> Result<(), ClientError> {
        self.unsubscribe_async(subscription_id)?.wait()
    }

    pub fn unsubscribe_async(&self, subscription_id: u64) -> Result<ReplyHandle<()>, ClientError> {
        self.request(
            Message::Unsubscribe { subscription_id },
            Some(ReplyAction::RemoveSubscription(subscription_id)),
            expect_ok,
        )
    }

    // -------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------

    /// Start a query: `client.query("light").set_attr("on", "1").run()`.
    pub fn query(&self, selector: &str) -> ClientQuery<'_> {
        ClientQuery::new(self, selector)
    }

    /// Start a query group.
    pub fn group(&self) -> QueryGroup<'_> {
        QueryGroup::new(self)
    }

    pub(crate) fn single_query_async(&self, spec: QuerySpec) -> Result<ReplyHandle<QueryResult>, ClientError> {
        self.request(
            Message::Query {
                query_group: vec![spec],
            },
            None,
            expect_single_result,
        )
    }

    pub(crate) fn group_query_async(
        &self,
        specs: Vec<QuerySpec>,
    ) -> Result<ReplyHandle<Vec<Result<QueryResult, TreeError>>>, ClientError> {
        self.request(Message::Query { query_group: specs }, None, expect_results)
    }

    // -------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------

    /// Round-trip a ping after the handshake. Returns the echoed text.
    pub fn ping(&self, text: &str) -> Result<String, ClientError> {
        self.ping_async(text)?.wait()
    }

    pub fn ping_async(&self, text: &str) -> Result<ReplyHandle<String>, ClientError> {
        self.request(
            Message::Ping {
                ping: text.to_string(),
            },
            None,
            expect_pong,
        )
    }

    /// Ask the daemon to stop.
    pub fn shutdown_server(&self) -> Result<(), ClientError> {
        self.request(Message::Shutdown, None, expect_ok)?.wait()
    }
}

impl Drop for TreeClient {
    fn drop(&mut self) {
        {
            let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writer.shutdown_both();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        // A callback may hold the last reference to the client.
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.thread().id() != thread::current().id() {
                let _ = dispatcher.join();
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Handshake and background threads
// ---------------------------------------------------------------------------

fn handshake(
    reader: &mut Box<dyn Duplex>,
    writer: &mut Box<dyn Duplex>,
    config: &ClientConfig,
) -> Result<(), ClientError> {
    let challenge = config.handshake_challenge.clone();
    wire::write_frame(
        writer,
        &Frame::new(
            HANDSHAKE_TOKEN,
            Message::Ping {
                ping: challenge.clone(),
            },
        ),
    )?;
    reader
        .set_read_timeout(config.request_timeout())
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    let frame = wire::read_frame(reader, config.max_frame_bytes)
        .map_err(|e| ClientError::Connection(format!("handshake failed: {}", e)))?;
    reader
        .set_read_timeout(None)
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    match frame {
        Frame {
            token: HANDSHAKE_TOKEN,
            message: Message::Pong { pong },
        } if pong == challenge => {
            debug!("handshake complete");
            Ok(())
        }
        other => Err(ClientError::Connection(format!(
            "handshake failed: unexpected {} on token {}",
            other.message.name(),
            other.token
        ))),
    }
}


struct Pending {
    reply: Sender<Message>,
    action: Option<ReplyAction>,
}

/// Sole owner of the read half and the token table.
fn receive_loop(
    mut reader: Box<dyn Duplex>,
    control: Receiver<Control>,
    dispatch: Sender<Dispatch>,
    max_frame_bytes: usize,
) {
    let mut pending: HashMap<Token, Pending> = HashMap::new();
    loop {
        let frame = match wire::read_frame(&mut reader, max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) if !e.is_fatal() => {
                warn!(token = ?e.token(), error = %e, "malformed frame skipped");
                // A reply that cannot be read still resolves its caller.
                match e.token() {
                    Some(token) if token != HANDSHAKE_TOKEN => Frame::new(
                        token,
                        Message::Error {
                            operation: "decode".to_string(),
                            error: TreeError::Protocol { reason: e.to_string() },
                        },
                    ),
                    _ => continue,
                }
            }
            Err(WireError::Closed) => {
                debug!("connection closed by peer");
                break;
            }
            Err(e) => {
                debug!(error = %e, "receive loop stopping");
                break;
            }
        };

        while let Ok(registration) = control.try_recv() {
            match registration {
                Control::Await {
                    token,
                    reply,
                    action,
                } => {
                    pending.insert(token, Pending { reply, action });
                }
                Control::Forget(token) => {
                    pending.remove(&token);
                }
            }
        }

        if frame.token != HANDSHAKE_TOKEN {
            if let Some(p) = pending.remove(&frame.token) {
                if let Some(action) = p.action {
                    let follow_up = match (action, &frame.message) {
                        (ReplyAction::InstallSubscription(cb), Message::Subscribed { subscription_id, .. }) => {
                            Some(Dispatch::Install(*subscription_id, cb))
                        }
                        (ReplyAction::RemoveSubscription(id), Message::Ok) => Some(Dispatch::Remove(id)),
                        _ => None,
                    };
                    if let Some(d) = follow_up {
                        let _ = dispatch.send(d);
                    }
                }
                if p.reply.send(frame.message).is_err() {
                    debug!(token = %frame.token, "late reply discarded");
                }
                continue;
            }
        }

        match frame.message {
            Message::Push(push) => {
                let _ = dispatch.send(Dispatch::Push(push));
            }
            other => warn!(token = %frame.token, message = other.name(), "unexpected frame dropped"),
        }
    }
    // Dropping `pending` fails every waiter with a connection error.
    if !pending.is_empty() {
        debug!(outstanding = pending.len(), "failing pending requests");
    }
}


/// Owns the callbacks; invokes them in push arrival order.
fn dispatch_loop(work: Receiver<Dispatch>) {
    let mut callbacks: HashMap<u64, Callback> = HashMap::new();
    for item in work {
        match item {
            Dispatch::Install(id, cb) => {
                callbacks.insert(id, cb);
            }
            Dispatch::Remove(id) => {
                callbacks.remove(&id);
            }
            Dispatch::Push(push) => match callbacks.get_mut(&push.subscription_id) {
                Some(cb) => cb(&push),
                None => debug!(
                    subscription = push.subscription_id,
                    target = %push.target,
                    "push for unknown subscription dropped"
                ),
            },
        }
    }
}


// ---------------------------------------------------------------------------
// Reply conversion
// ---------------------------------------------------------------------------

fn unexpected(operation: &'static str, message: Message) -> ClientError {
    match message {
        Message::Error { operation, error } => ClientError::Tree { operation, error },
        other => ClientError::Protocol {
            operation,
            reply: other.name().to_string(),
        },
    }
}

fn expect_ok(operation: &'static str, message: Message) -> Result<(), ClientError> {
    match message {
        Message::Ok => Ok(()),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_children(operation: &'static str, message: Message) -> Result<BTreeSet<String>, ClientError> {
    match message {
        Message::Children { children } => Ok(children),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_node(operation: &'static str, message: Message) -> Result<Node, ClientError> {
    match message {
        Message::Node { node } => Ok(node),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_subscribed(operation: &'static str, message: Message) -> Result<u64, ClientError> {
    match message {
        Message::Subscribed { subscription_id, .. } => Ok(subscription_id),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_pong(operation: &'static str, message: Message) -> Result<String, ClientError> {
    match message {
        Message::Pong { pong } => Ok(pong),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_results(
    operation: &'static str,
    message: Message,
) -> Result<Vec<Result<QueryResult, TreeError>>, ClientError> {
    match message {
        Message::QueryResult { results } => Ok(results),
        other => Err(unexpected(operation, other)),
    }
}

fn expect_single_result(operation: &'static str, message: Message) -> Result<QueryResult, ClientError> {
    let mut results = expect_results(operation, message)?;
    if results.len() != 1 {
        return Err(ClientError::Protocol {
            operation,
            reply: format!("query_result with {} members", results.len()),
        });
    }
    results.remove(0).map_err(|error| ClientError::Tree {
        operation: operation.to_string(),
        error,
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn config() -> ClientConfig {
        ClientConfig {
            request_timeout_ms: 2_000,
            ..ClientConfig::default()
        }
    }

    /// Answer the handshake on `server`, then hand it back.
    fn accept_handshake(server: &mut UnixStream) {
        let ping = wire::read_frame(server, 1 << 20).unwrap();
        assert_eq!(ping.token, HANDSHAKE_TOKEN);
        let pong = match ping.message {
            Message::Ping { ping } => ping,
            other => panic!("expected ping, got {:?}", other),
        };
        wire::write_frame(server, &Frame::new(HANDSHAKE_TOKEN, Message::Pong { pong })).unwrap();
    }

    fn pair() -> (TreeClient, UnixStream) {
        pair_with(&config())
    }

    fn pair_with(config: &ClientConfig) -> (TreeClient, UnixStream) {
        let (client_end, mut server) = UnixStream::pair().unwrap();
        let t = thread::spawn(move || {
            accept_handshake(&mut server);
            server
        });
        let client = TreeClient::from_stream(Box::new(client_end), config).unwrap();
        (client, t.join().unwrap())
    }

    #[test]
    fn handshake_rejects_wrong_echo() {
        let (client_end, mut server) = UnixStream::pair().unwrap();
        let t = thread::spawn(move || {
            let _ = wire::read_frame(&mut server, 1 << 20).unwrap();
            wire::write_frame(&mut server, &Frame::new(HANDSHAKE_TOKEN, Message::Pong { pong: "nope".into() }))
                .unwrap();
            server
        });
        let err = TreeClient::from_stream(Box::new(client_end), &config()).err().unwrap();
        assert!(matches!(err, ClientError::Connection(_)));
        drop(t.join().unwrap());
    }

    #[test]
    fn tokens_start_at_one_and_increase() {
        let (client, mut server) = pair();
        let a = client.create_child_async("/", "a").unwrap();
        let b = client.list_children_async("/").unwrap();
        assert_eq!(a.token(), Token(1));
        assert_eq!(b.token(), Token(2));
        assert_eq!(wire::read_frame(&mut server, 1 << 20).unwrap().token, Token(1));
        assert_eq!(wire::read_frame(&mut server, 1 << 20).unwrap().token, Token(2));
    }

    #[test]
    fn later_token_answered_first_resolves_first() {
        let (client, mut server) = pair();
        let h1 = client.list_children_async("/").unwrap();
        let h2 = client.ping_async("second").unwrap();
        let r1 = wire::read_frame(&mut server, 1 << 20).unwrap();
        let r2 = wire::read_frame(&mut server, 1 << 20).unwrap();
        assert_eq!((r1.token, r2.token), (Token(1), Token(2)));

        wire::write_frame(&mut server, &Frame::new(Token(2), Message::Pong { pong: "second".into() }))
            .unwrap();
        // Token 1 is still unanswered; token 2 must not wait for it.
        assert_eq!(h2.wait_timeout(Duration::from_secs(2)).unwrap(), "second");

        let children: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        wire::write_frame(&mut server, &Frame::new(Token(1), Message::Children { children: children.clone() }))
            .unwrap();
        assert_eq!(h1.wait().unwrap(), children);
    }

    #[test]
    fn oversized_reply_fails_only_its_caller() {
        let (client, mut server) = pair_with(&ClientConfig {
            max_frame_bytes: 256,
            ..config()
        });
        let big = client.list_children_async("/").unwrap();
        let small = client.ping_async("ok").unwrap();
        let r1 = wire::read_frame(&mut server, 1 << 20).unwrap();
        let r2 = wire::read_frame(&mut server, 1 << 20).unwrap();

        let children: BTreeSet<String> = (0..100).map(|i| format!("child{}", i)).collect();
        wire::write_frame(&mut server, &Frame::new(r1.token, Message::Children { children })).unwrap();
        wire::write_frame(&mut server, &Frame::new(r2.token, Message::Pong { pong: "ok".into() })).unwrap();

        let err = big.wait().unwrap_err();
        assert!(matches!(err.tree_error(), Some(TreeError::Protocol { .. })));
        assert_eq!(small.wait().unwrap(), "ok");
    }

    #[test]
    fn request_after_peer_closed_is_connection_error() {
        let (client, server) = pair();
        drop(server);
        assert!(matches!(
            client.list_children("/"),
            Err(ClientError::Connection(_))
        ));
        assert!(matches!(client.ping("x"), Err(ClientError::Connection(_))));
    }

    #[test]
    fn error_reply_becomes_tree_error() {
        let (client, mut server) = pair();
        let h = client.remove_child_async("/", "a").unwrap();
        let req = wire::read_frame(&mut server, 1 << 20).unwrap();
        wire::write_frame(
            &mut server,
            &Frame::new(
                req.token,
                Message::Error {
                    operation: "remove_child".into(),
                    error: TreeError::NoSuchNode { path: "/a".into() },
                },
            ),
        )
        .unwrap();
        let err = h.wait().unwrap_err();
        assert_eq!(
            err.tree_error(),
            Some(&TreeError::NoSuchNode { path: "/a".into() })
        );
    }

    #[test]
    fn wrong_reply_type_is_protocol_error() {
        let (client, mut server) = pair();
        let h = client.get_node_async("/").unwrap();
        let req = wire::read_frame(&mut server, 1 << 20).unwrap();
        wire::write_frame(&mut server, &Frame::new(req.token, Message::Ok)).unwrap();
        assert!(matches!(h.wait(), Err(ClientError::Protocol { .. })));
    }

    #[test]
    fn timeout_then_late_reply_is_discarded() {
        let (client, mut server) = pair();
        let h = client.list_children_async("/").unwrap();
        let err = h.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ClientError::Timeout { token: Token(1), .. }));

        // Answer the abandoned token, then serve a fresh request.
        let first = wire::read_frame(&mut server, 1 << 20).unwrap();
        wire::write_frame(&mut server, &Frame::new(first.token, Message::Ok)).unwrap();
        let h2 = client.ping_async("again").unwrap();
        let second = wire::read_frame(&mut server, 1 << 20).unwrap();
        assert_eq!(second.token, Token(2));
        wire::write_frame(&mut server, &Frame::new(second.token, Message::Pong { pong: "again".into() }))
            .unwrap();
        assert_eq!(h2.wait().unwrap(), "again");
    }

    #[test]
    fn connection_loss_fails_pending() {
        let (client, server) = pair();
        let h = client.list_children_async("/").unwrap();
        drop(server);
        assert!(matches!(h.wait(), Err(ClientError::Connection(_))));
    }

    #[test]
    fn garbage_frame_does_not_kill_receive_loop() {
        let (client, mut server) = pair();
        let h = client.ping_async("x").unwrap();
        let req = wire::read_frame(&mut server, 1 << 20).unwrap();
        let junk = b"{junk";
        std::io::Write::write_all(&mut server, &(junk.len() as u32).to_be_bytes()).unwrap();
        std::io::Write::write_all(&mut server, junk).unwrap();
        wire::write_frame(&mut server, &Frame::new(req.token, Message::Pong { pong: "x".into() })).unwrap();
        assert_eq!(h.wait().unwrap(), "x");
    }

    #[test]
    fn push_reaches_installed_callback() {
        let (client, mut server) = pair();
        let (seen_tx, seen_rx) = mpsc::channel();
        let h = client
            .subscribe_async("/a/*", move |p: &Push| {
                let _ = seen_tx.send(p.changed_paths.clone());
            })
            .unwrap();
        let req = wire::read_frame(&mut server, 1 << 20).unwrap();
        wire::write_frame(
            &mut server,
            &Frame::new(req.token, Message::Subscribed { subscription_id: 5, target: "/a/*".into() }),
        )
        .unwrap();
        wire::write_frame(
            &mut server,
            &Frame::push(Push {
                subscription_id: 5,
                target: "/a/*".into(),
                changed_paths: vec!["/a/b".into()],
                context: vec![],
            }),
        )
        .unwrap();
        assert_eq!(h.wait().unwrap(), 5);
        let paths = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(paths, vec!["/a/b"]);
    }
}
