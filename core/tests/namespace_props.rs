//! Property tests for the node tree and the selector text form.

use std::collections::BTreeSet;

use proptest::prelude::*;

use homedb_core::{path_to_query, Selector, Tree, TreeError};


fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,8}"
}


proptest! {
    #[test]
    fn distinct_names_are_listed_exactly(
        names in prop::collection::btree_set(name(), 0..40),
        seed in any::<u64>(),
    ) {
        let mut order: Vec<&String> = names.iter().collect();
        // Any creation order yields the same listing.
        let n = order.len().max(1);
        order.rotate_left((seed as usize) % n);
        if seed % 2 == 1 {
            order.reverse();
        }

        let mut tree = Tree::new();
        tree.create_child("/", "hub").unwrap();
        for name in order {
            tree.create_child("/hub", name).unwrap();
        }
        prop_assert_eq!(tree.list_children("/hub").unwrap(), names);
    }

    #[test]
    fn duplicate_create_always_fails(names in prop::collection::vec(name(), 1..20)) {
        let mut tree = Tree::new();
        let mut seen = BTreeSet::new();
        for name in &names {
            let result = tree.create_child("/", name);
            if seen.insert(name.clone()) {
                prop_assert!(result.is_ok());
            } else {
                let is_duplicate = matches!(result, Err(TreeError::NodeAlreadyExists { .. }));
                prop_assert!(is_duplicate);
            }
        }
        prop_assert_eq!(tree.list_children("/").unwrap(), seen);
    }

    #[test]
    fn path_queries_reparse(segments in prop::collection::vec(name(), 1..6)) {
        let path = format!("/{}", segments.join("/"));
        let text = path_to_query(&path).unwrap();
        let selector = Selector::parse(&text).unwrap();
        prop_assert_eq!(selector.to_string(), text);
    }
}
