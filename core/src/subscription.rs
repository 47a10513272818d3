//! Subscription registry.
//!
//! A subscription is standing interest in a path pattern or a selector,
//! owned by one connection. After each mutating request the service hands
//! the registry every [`Change`] it produced; each subscription with at
//! least one matching change gets exactly one [`Push`] listing them, sent
//! through its connection's outbox so pushes and replies share one FIFO.
//!
//! Matching is a full re-evaluation of every subscription against every
//! change.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{SyncSender, TrySendError};

use tracing::{debug, warn};

use crate::error::TreeError;
use crate::namespace::{Change, ChangeEvent, PathPattern};
use crate::query::Selector;
use crate::types::protocol::{ChangeRecord, Frame, Push};


/// Server-assigned id of one client connection.
pub type ConnectionId = u64;


/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `/room/*/color` or `/room/*/color/value` (attribute form).
    Path(PathPattern),
    Selector(Selector),
}

impl Target {
    /// A target starting with `/` is a path pattern, anything else a
    /// selector.
    pub fn parse(text: &str) -> Result<Target, TreeError> {
        if text.starts_with('/') {
            Ok(Target::Path(PathPattern::parse(text)?))
        } else {
            Ok(Target::Selector(Selector::parse(text)?))
        }
    }

    pub fn matches(&self, change: &Change) -> bool {
        match self {
            Target::Path(pattern) => {
                if pattern.matches(&change.path) {
                    return true;
                }
                match &change.event {
                    ChangeEvent::Attribute { name, .. } => {
                        pattern.matches_attribute(&change.path, name)
                    }
                    _ => false,
                }
            }
            Target::Selector(selector) => selector.matches_lineage(&change.lineage),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(p) => write!(f, "{}", p),
            Target::Selector(s) => write!(f, "{}", s),
        }
    }
}


struct Subscription {
    connection: ConnectionId,
    /// Target as the subscriber wrote it; echoed in pushes.
    text: String,
    target: Target,
    outbox: SyncSender<Frame>,
}


/// All active subscriptions, across connections.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest. Returns the new subscription id.
    pub fn subscribe(
        &mut self,
        connection: ConnectionId,
        target: &str,
        outbox: SyncSender<Frame>,
    ) -> Result<u64, TreeError> {
        let parsed = Target::parse(target)?;
        self.next_id += 1;
        let id = self.next_id;
        debug!(subscription = id, connection, target, "subscribed");
        self.subscriptions.insert(
            id,
            Subscription {
                connection,
                text: target.to_string(),
                target: parsed,
                outbox,
            },
        );
        Ok(id)
    }

    /// Remove one subscription. Ids belonging to another connection are
    /// treated as unknown.
    pub fn unsubscribe(&mut self, connection: ConnectionId, id: u64) -> Result<(), TreeError> {
        match self.subscriptions.get(&id) {
            Some(sub) if sub.connection == connection => {
                self.subscriptions.remove(&id);
                debug!(subscription = id, connection, "unsubscribed");
                Ok(())
            }
            _ => Err(TreeError::NoSuchSubscription { id }),
        }
    }

    /// Drop every subscription of a closed connection. Returns how many.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.connection != connection);
        let removed = before - self.subscriptions.len();
        if removed > 0 {
            debug!(connection, removed, "subscriptions dropped with connection");
        }
        removed
    }

    /// Send one push to every subscription matching any of `changes`.
    /// Returns the number of pushes sent.
    pub fn notify(&mut self, changes: &[Change]) -> usize {
        if changes.is_empty() || self.subscriptions.is_empty() {
            return 0;
        }
        let mut sent = 0;
        let mut dead = Vec::new();
        for (&id, sub) in &self.subscriptions {
            let matching: Vec<&Change> = changes.iter().filter(|c| sub.target.matches(c)).collect();
            if matching.is_empty() {
                continue;
            }
            let mut changed_paths: Vec<String> = Vec::new();
            for c in &matching {
                let p = c.path.to_string();
                if !changed_paths.contains(&p) {
                    changed_paths.push(p);
                }
            }
            let push = Push {
                subscription_id: id,
                target: sub.text.clone(),
                changed_paths,
                context: matching
                    .iter()
                    .map(|c| ChangeRecord {
                        path: c.path.to_string(),
                        event: c.event.clone(),
                    })
                    .collect(),
            };
            match sub.outbox.try_send(Frame::push(push)) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = id, connection = sub.connection, "outbox full, dropping subscription");
                    dead.push(id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!(subscription = id, "outbox closed, dropping subscription");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.subscriptions.remove(&id);
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{Tree, TreePath};
    use crate::types::protocol::Message;
    use std::sync::mpsc;

    fn push_of(frame: Frame) -> Push {
        match frame.message {
            Message::Push(p) => p,
            other => panic!("expected push, got {:?}", other),
        }
    }

    fn house() -> Tree {
        let mut tree = Tree::new();
        tree.create_child_of_kind("/", "room", "area").unwrap();
        tree.create_child_of_kind("/room", "kitchen", "room").unwrap();
        tree.create_child_of_kind("/room/kitchen", "color", "color").unwrap();
        tree
    }

    fn set(tree: &mut Tree, path: &str, name: &str, value: &str) -> Change {
        let id = tree.lookup(&TreePath::parse(path).unwrap()).unwrap();
        tree.set_attribute(id, name, value).unwrap()
    }

    #[test]
    fn target_kind_is_chosen_by_leading_slash() {
        assert!(matches!(Target::parse("/a/*").unwrap(), Target::Path(_)));
        assert!(matches!(Target::parse("light[on]").unwrap(), Target::Selector(_)));
        assert!(matches!(
            Target::parse("/a/../b"),
            Err(TreeError::MalformedPath { .. })
        ));
        assert!(matches!(
            Target::parse("light >"),
            Err(TreeError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn attribute_address_pattern_gets_exactly_one_push() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::sync_channel(16);
        let id = reg.subscribe(1, "/room/*/color/value", tx).unwrap();

        let changes = vec![
            set(&mut tree, "/room/kitchen/color", "value", "red"),
            set(&mut tree, "/room/kitchen/color", "hue", "10"),
        ];
        assert_eq!(reg.notify(&changes), 1);
        let push = push_of(rx.try_recv().unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(push.subscription_id, id);
        assert_eq!(push.target, "/room/*/color/value");
        assert_eq!(push.changed_paths, vec!["/room/kitchen/color"]);
        assert_eq!(push.context.len(), 1);
    }

    #[test]
    fn node_pattern_sees_creates_and_removes() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::sync_channel(16);
        reg.subscribe(1, "/room/*", tx).unwrap();

        let created = tree.create_child("/room", "hall").unwrap();
        reg.notify(&[created]);
        assert_eq!(push_of(rx.try_recv().unwrap()).changed_paths, vec!["/room/hall"]);

        let removed = tree.remove_child("/room", "hall").unwrap();
        reg.notify(&[removed]);
        let push = push_of(rx.try_recv().unwrap());
        assert_eq!(push.context[0].event, ChangeEvent::Removed);

        let deeper = tree.create_child("/room/kitchen", "lamp").unwrap();
        assert_eq!(reg.notify(&[deeper]), 0);
    }

    #[test]
    fn selector_uses_lineage_at_change_time() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::sync_channel(16);
        reg.subscribe(1, "room > color", tx).unwrap();

        let change = set(&mut tree, "/room/kitchen/color", "value", "blue");
        assert_eq!(reg.notify(&[change]), 1);
        rx.try_recv().unwrap();

        tree.create_child_of_kind("/room", "hall", "room").unwrap();
        tree.create_child_of_kind("/room/hall", "tint", "color").unwrap();
        let removed = tree.remove_child("/room/hall", "tint").unwrap();
        assert_eq!(reg.notify(&[removed]), 1);
        assert_eq!(
            push_of(rx.try_recv().unwrap()).changed_paths,
            vec!["/room/hall/tint"]
        );
    }

    #[test]
    fn many_changes_one_push_per_subscription() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx_a, rx_a) = mpsc::sync_channel(16);
        let (tx_b, rx_b) = mpsc::sync_channel(16);
        reg.subscribe(1, "color", tx_a).unwrap();
        reg.subscribe(2, "/room/kitchen/color", tx_b).unwrap();

        let changes = vec![
            set(&mut tree, "/room/kitchen/color", "value", "1"),
            set(&mut tree, "/room/kitchen/color", "value", "2"),
        ];
        assert_eq!(reg.notify(&changes), 2);
        let a = push_of(rx_a.try_recv().unwrap());
        assert_eq!(a.changed_paths, vec!["/room/kitchen/color"]);
        assert_eq!(a.context.len(), 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn unsubscribe_checks_owner() {
        let mut reg = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::sync_channel(16);
        let id = reg.subscribe(1, "color", tx).unwrap();
        assert_eq!(
            reg.unsubscribe(2, id),
            Err(TreeError::NoSuchSubscription { id })
        );
        assert!(reg.unsubscribe(1, id).is_ok());
        assert_eq!(
            reg.unsubscribe(1, id),
            Err(TreeError::NoSuchSubscription { id })
        );
    }

    #[test]
    fn remove_connection_drops_only_its_subscriptions() {
        let mut reg = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::sync_channel(16);
        reg.subscribe(1, "a", tx.clone()).unwrap();
        reg.subscribe(1, "b", tx.clone()).unwrap();
        reg.subscribe(2, "c", tx).unwrap();
        assert_eq!(reg.remove_connection(1), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn full_outbox_drops_subscription() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::sync_channel(1);
        reg.subscribe(1, "color", tx).unwrap();
        let first = set(&mut tree, "/room/kitchen/color", "value", "1");
        assert_eq!(reg.notify(&[first]), 1);
        let second = set(&mut tree, "/room/kitchen/color", "value", "2");
        assert_eq!(reg.notify(&[second]), 0);
        assert!(reg.is_empty());
        // What was queued before the overflow is still delivered.
        assert_eq!(push_of(rx.try_recv().unwrap()).context.len(), 1);
    }

    #[test]
    fn dead_outbox_drops_subscription() {
        let mut tree = house();
        let mut reg = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::sync_channel(16);
        reg.subscribe(1, "color", tx).unwrap();
        drop(rx);
        let change = set(&mut tree, "/room/kitchen/color", "value", "x");
        assert_eq!(reg.notify(&[change]), 0);
        assert!(reg.is_empty());
    }
}
