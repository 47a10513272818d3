//! End-to-end: a real daemon on a temp socket, real clients.

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use homedb_core::config::{ClientConfig, ServerConfig};
use homedb_core::daemon::{start_background, DaemonError, DaemonHandle};
use homedb_core::namespace::NodeDescriptor;
use homedb_core::transport::Endpoint;
use homedb_core::{path_to_query, ClientError, Query, TreeClient, TreeError, Transforms};


struct Harness {
    _dir: tempfile::TempDir,
    endpoint: Endpoint,
    handle: DaemonHandle,
    thread: Option<thread::JoinHandle<Result<(), DaemonError>>>,
}

impl Harness {
    fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            accept_poll_ms: 10,
            ..ServerConfig::default()
        };
        let (handle, endpoint, thread) =
            start_background(&Endpoint::Unix(dir.path().join("homedb.sock")), &config).unwrap();
        Harness {
            _dir: dir,
            endpoint,
            handle,
            thread: Some(thread),
        }
    }

    fn client(&self) -> TreeClient {
        let config = ClientConfig {
            request_timeout_ms: 5_000,
            ..ClientConfig::default()
        };
        TreeClient::connect(&self.endpoint, &config).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}


fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}


fn tree_error(result: Result<(), ClientError>) -> TreeError {
    match result {
        Err(ClientError::Tree { error, .. }) => error,
        other => panic!("expected tree error, got {:?}", other),
    }
}


#[test]
fn structural_operations_and_typed_errors() {
    let h = Harness::start();
    let client = h.client();

    client.create_child_of_kind("/", "room", "area").unwrap();
    client.create_child_of_kind("/room", "kitchen", "room").unwrap();
    assert_eq!(client.list_children("/").unwrap(), set(&["room"]));

    let node = client.get_node("/room/kitchen").unwrap();
    assert_eq!(node.kind, "room");
    assert_eq!(node.name.as_deref(), Some("kitchen"));

    assert!(matches!(
        tree_error(client.create_child("/room", "kitchen")),
        TreeError::NodeAlreadyExists { .. }
    ));
    assert!(matches!(
        tree_error(client.create_child("/room/../x", "y")),
        TreeError::MalformedPath { .. }
    ));
    assert!(matches!(
        tree_error(client.create_child("/room", "a/b")),
        TreeError::InvalidPathComponent { .. }
    ));
    assert!(matches!(
        tree_error(client.create_child("/nowhere", "a")),
        TreeError::NoSuchNode { .. }
    ));
    assert!(matches!(
        tree_error(client.remove_child("/", "room")),
        TreeError::NodeContainsChildren { .. }
    ));

    // The connection survives every failure above.
    client.remove_child("/room", "kitchen").unwrap();
    client.remove_child("/", "room").unwrap();
    assert!(client.list_children("/").unwrap().is_empty());
}


#[test]
fn four_level_fanout() {
    let h = Harness::start();
    let client = h.client();
    let levels = [["a", "b", "c", "d"], ["e", "f", "g", "h"], ["i", "j", "k", "l"], ["m", "n", "o", "p"]];

    let mut parents = vec![String::from("/")];
    for level in &levels {
        let mut next = Vec::new();
        for parent in &parents {
            for name in level {
                client.create_child(parent, name).unwrap();
                next.push(if parent == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", parent, name)
                });
            }
        }
        parents = next;
    }

    assert_eq!(client.list_children("/").unwrap(), set(&["a", "b", "c", "d"]));
    assert_eq!(client.list_children("/b/g").unwrap(), set(&["i", "j", "k", "l"]));
    assert_eq!(parents.len(), 256);
    for leaf in &parents {
        assert!(client.list_children(leaf).unwrap().is_empty());
    }
}


#[test]
fn concurrent_distinct_creates_all_succeed() {
    let h = Harness::start();
    let shared = h.client();
    let names: Vec<String> = (0..32).map(|i| format!("n{}", i)).collect();

    thread::scope(|s| {
        for chunk in names.chunks(8) {
            let own = h.client();
            let shared = &shared;
            s.spawn(move || {
                for (i, name) in chunk.iter().enumerate() {
                    let client = if i % 2 == 0 { shared } else { &own };
                    client.create_child("/", name).unwrap();
                }
            });
        }
    });

    let expected: BTreeSet<String> = names.into_iter().collect();
    assert_eq!(shared.list_children("/").unwrap(), expected);
}


#[test]
fn concurrent_identical_creates_exactly_one_wins() {
    let h = Harness::start();
    let clients: Vec<TreeClient> = (0..8).map(|_| h.client()).collect();

    let results: Vec<Result<(), ClientError>> = thread::scope(|s| {
        let handles: Vec<_> = clients
            .iter()
            .map(|c| s.spawn(move || c.create_child("/", "hub")))
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for r in results.into_iter().filter(|r| r.is_err()) {
        assert!(matches!(tree_error(r), TreeError::NodeAlreadyExists { .. }));
    }
}


#[test]
fn attribute_write_pushes_once_to_path_subscriber() {
    let h = Harness::start();
    let writer = h.client();
    let watcher = h.client();

    writer.create_child("/", "room").unwrap();
    writer.create_child_of_kind("/room", "kitchen", "room").unwrap();
    writer.create_child_of_kind("/room/kitchen", "color", "color").unwrap();

    let (tx, rx) = mpsc::channel();
    watcher
        .subscribe("/room/*/color/value", move |push| {
            let _ = tx.send(push.clone());
        })
        .unwrap();

    let query = path_to_query("/room/kitchen/color").unwrap();
    let result = writer.query(&query).set_attr("value", "red").run().unwrap();
    assert_eq!(
        result["/room/kitchen/color"].attributes.get("value").map(String::as_str),
        Some("red")
    );

    let push = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(push.changed_paths, vec!["/room/kitchen/color"]);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // A different attribute does not match the attribute address.
    writer.query(&query).set_attr("hue", "10").run().unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}


#[test]
fn selector_subscription_and_unsubscribe() {
    let h = Harness::start();
    let client = h.client();
    client.create_child_of_kind("/", "hall", "room").unwrap();

    let (tx, rx) = mpsc::channel();
    let id = client
        .subscribe("room > light", move |push| {
            let _ = tx.send(push.changed_paths.clone());
        })
        .unwrap();

    client.create_child_of_kind("/hall", "lamp", "light").unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        vec!["/hall/lamp"]
    );

    client.unsubscribe(id).unwrap();
    client.remove_child("/hall", "lamp").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(matches!(
        tree_error(client.unsubscribe(id)),
        TreeError::NoSuchSubscription { .. }
    ));
}


#[test]
fn query_group_is_one_request() {
    let h = Harness::start();
    let client = h.client();
    client.create_child_of_kind("/", "hall", "room").unwrap();

    let mut group = client.group();
    group
        .add(Query::new("room").append(NodeDescriptor::new("light", "lamp")))
        .add(Query::new("room > light").set_attr("on", "1"))
        .add(Query::new("room > ["));
    let results = group.run().unwrap();

    assert_eq!(results.len(), 3);
    // append leaves the matched set on the parents.
    assert!(results[0].as_ref().unwrap().contains_key("/hall"));
    let lit = &results[1].as_ref().unwrap()["/hall/lamp"];
    assert_eq!(lit.attributes.get("on").map(String::as_str), Some("1"));
    assert!(matches!(results[2], Err(TreeError::InvalidSelector { .. })));

    let node = client.get_node("/hall/lamp").unwrap();
    assert_eq!(node.attributes.get("on").map(String::as_str), Some("1"));
}


#[test]
fn async_handles_resolve_out_of_call_order() {
    let h = Harness::start();
    let client = h.client();
    let first = client.create_child_async("/", "x").unwrap();
    let second = client.list_children_async("/").unwrap();
    assert!(second.token() > first.token());
    // Waiting on the later handle first is fine.
    assert_eq!(second.wait().unwrap(), set(&["x"]));
    first.wait().unwrap();
    assert_eq!(client.ping("hello").unwrap(), "hello");
}


#[test]
fn client_sees_connection_error_after_daemon_stops() {
    let mut h = Harness::start();
    let client = h.client();
    client.shutdown_server().unwrap();
    if let Some(thread) = h.thread.take() {
        thread.join().unwrap().unwrap();
    }
    assert!(matches!(
        client.list_children("/"),
        Err(ClientError::Connection(_))
    ));
}
