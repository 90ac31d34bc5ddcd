// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Property tests over randomized operation sequences: whatever order of
//! inserts, upserts, and deletes a caller issues, the tree must stay
//! sorted, keep each key at most once, and never hand back a value for a
//! key that was last deleted.

use pbtree::config::TreeConfig;
use pbtree::store::memory::MemoryStore;
use pbtree::store::Store;
use pbtree::tree::{RangeSignal, SetMode, Tree};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Upsert(i64, i64),
    Delete(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..64, any::<i64>()).prop_map(|(k, v)| Op::Upsert(k, v)),
        (0i64..64).prop_map(Op::Delete),
    ]
}

/// Walks every reachable node and asserts the §8 fill bound
/// `order <= fill <= 2 * order` on every non-root node (the root, at
/// depth 0, is exempt from the lower bound only - it must still obey the
/// upper bound, since that is exactly the threshold that triggers a
/// split). A tree built from up to 200 random ops at small order reliably
/// grows past a single root node, so this exercises real internal nodes,
/// not just leaves.
async fn assert_fill_bounds(store: &Arc<dyn Store>, tree: &Tree, order: usize) {
    let mut reachable = Vec::new();
    tree.for_each_ptr(|ptr, depth| {
        reachable.push((ptr.clone(), depth));
        false
    })
    .await
    .unwrap();

    let mut violations = Vec::new();
    for (ptr, depth) in reachable {
        let fill = store.read(&ptr).await.unwrap().fill();
        if fill > 2 * order || (depth > 0 && fill < order) {
            violations.push((ptr, depth, fill));
        }
    }
    assert!(
        violations.is_empty(),
        "fill bound order <= fill <= 2*order violated at order {order}: {violations:?}"
    );
}

async fn run(ops: &[Op], order: usize) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let tree = Tree::empty(store.clone(), TreeConfig::new(order).unwrap());
    let mut model: BTreeMap<i64, i64> = BTreeMap::new();

    for op in ops {
        match *op {
            Op::Upsert(k, v) => {
                tree.set(json!(k), json!(v), SetMode::Upsert).await.unwrap();
                model.insert(k, v);
            }
            Op::Delete(k) => {
                tree.delete(&json!(k)).await.unwrap();
                model.remove(&k);
            }
        }
    }

    let mut seen = Vec::new();
    tree.range_each(None, None, |k, v| {
        seen.push((k.as_i64().unwrap(), v.as_i64().unwrap()));
        RangeSignal::Continue
    })
    .await
    .unwrap();

    let expected: Vec<(i64, i64)> = model.into_iter().collect();
    assert_eq!(seen, expected, "tree contents must match a plain ordered map after the same ops");

    for w in seen.windows(2) {
        assert!(w[0].0 < w[1].0, "keys must be strictly ascending and unique");
    }

    assert_fill_bounds(&store, &tree, order).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_op_sequences_match_an_ordered_map(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(run(&ops, 2));
    }

    #[test]
    fn random_op_sequences_match_an_ordered_map_at_larger_order(
        ops in prop::collection::vec(op_strategy(), 0..200),
        order in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(run(&ops, order));
    }
}
