// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! The B+tree engine: search, copy-on-write `set`/`delete`, range
//! iteration, bulk application, and pointer enumeration for garbage
//! collection.
//!
//! Every mutating operation opens its own root transaction, descends with
//! in-memory clones, and either commits a new root or rolls back and
//! restores the one that was current before the call. A tree handle
//! permits only one in-flight operation at a time: a second caller racing
//! the first gets [`crate::error::Error::InProgress`] rather than a torn
//! read.

use crate::config::TreeConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::pointer::Pointer;
use crate::store::Store;
use crate::txn::Transaction;
use crate::value::{default_comparator, Comparator, SharedComparator, Value};
use async_recursion::async_recursion;
use futures_core::stream::Stream;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, instrument, trace};

/// The mode a [`Tree::set`] call runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Fail with `DuplicateKey` if the key already exists.
    Insert,
    /// Fail with `MissingKey` if the key does not exist.
    Update,
    /// Insert if absent, overwrite if present.
    Upsert,
}

/// A single early-termination signal from a [`Tree::range_each`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSignal {
    Continue,
    Break,
}

/// One entry of a [`Tree::bulk`] batch.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Upsert(Value, Value),
    Delete(Value),
}

impl BulkOp {
    fn key(&self) -> &Value {
        match self {
            BulkOp::Upsert(k, _) => k,
            BulkOp::Delete(k) => k,
        }
    }
}

enum RootState {
    Idle(Option<Pointer>),
    Busy,
}

/// A handle to one persistent B+tree. Cheap to construct, not `Clone` -
/// callers share a tree the way they share any other exclusively-accessed
/// resource, typically behind an `Arc`.
pub struct Tree {
    store: Arc<dyn Store>,
    comparator: SharedComparator,
    config: TreeConfig,
    state: StdMutex<RootState>,
}

impl Tree {
    /// A brand-new, empty tree. It becomes durable only once its root
    /// pointer is referenced by something that persists it (e.g. a
    /// [`crate::index::TreeIndex`] commit).
    pub fn empty(store: Arc<dyn Store>, config: TreeConfig) -> Self {
        Self::with_comparator(store, config, default_comparator())
    }

    pub fn with_comparator(
        store: Arc<dyn Store>,
        config: TreeConfig,
        comparator: SharedComparator,
    ) -> Self {
        Self {
            store,
            comparator,
            config,
            state: StdMutex::new(RootState::Idle(None)),
        }
    }

    /// Opens a handle onto a tree whose root is already durable.
    pub fn open(store: Arc<dyn Store>, root: Pointer, config: TreeConfig) -> Self {
        Self::open_with_comparator(store, root, config, default_comparator())
    }

    pub fn open_with_comparator(
        store: Arc<dyn Store>,
        root: Pointer,
        config: TreeConfig,
        comparator: SharedComparator,
    ) -> Self {
        Self {
            store,
            comparator,
            config,
            state: StdMutex::new(RootState::Idle(Some(root))),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The current root pointer, or `None` for a tree with no entries yet.
    /// Fails with `InProgress` if another operation on this handle is in
    /// flight.
    pub fn current_root(&self) -> Result<Option<Pointer>> {
        match &*self.state.lock().expect("tree state poisoned") {
            RootState::Idle(root) => Ok(root.clone()),
            RootState::Busy => Err(Error::InProgress),
        }
    }

    fn acquire(&self) -> Result<Option<Pointer>> {
        let mut state = self.state.lock().expect("tree state poisoned");
        match &*state {
            RootState::Busy => Err(Error::InProgress),
            RootState::Idle(root) => {
                let root = root.clone();
                *state = RootState::Busy;
                Ok(root)
            }
        }
    }

    fn release(&self, root: Option<Pointer>) {
        *self.state.lock().expect("tree state poisoned") = RootState::Idle(root);
    }

    // ---- point lookup & range iteration (4.6) -----------------------------

    /// Returns the value stored for `key`, or `None` if absent.
    pub async fn get(&self, key: &Value) -> Result<Option<Value>> {
        let mut found = None;
        self.range_each(Some(key), Some(key), |_, v| {
            found = Some(v.clone());
            RangeSignal::Break
        })
        .await?;
        Ok(found)
    }

    /// Depth-first in-order traversal over `[lower, upper]` (either bound
    /// may be absent, meaning unbounded on that side). `cb` may return
    /// [`RangeSignal::Break`] to stop early.
    #[instrument(skip(self, cb), fields(order = self.config.order))]
    pub async fn range_each<F>(&self, lower: Option<&Value>, upper: Option<&Value>, mut cb: F) -> Result<()>
    where
        F: FnMut(&Value, &Value) -> RangeSignal + Send,
    {
        let root = self.acquire()?;
        let result = async {
            if let Some(ptr) = &root {
                range_each_descend(&self.store, self.comparator.as_ref(), ptr, lower, upper, &mut cb)
                    .await?;
            }
            Ok(())
        }
        .await;
        self.release(root);
        result
    }

    /// A `Stream` adaptor over [`Tree::range_each`], for callers who want an
    /// iterator rather than a callback. Built on top of the callback
    /// primitive: it drives one full `range_each` pass up front and yields
    /// the collected entries, so it does not save memory over the callback
    /// form, only ergonomics.
    pub fn range<'a>(
        &'a self,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> impl Stream<Item = Result<(Value, Value)>> + 'a {
        async_stream::stream! {
            let mut items = Vec::new();
            let result = self
                .range_each(lower.as_ref(), upper.as_ref(), |k, v| {
                    items.push((k.clone(), v.clone()));
                    RangeSignal::Continue
                })
                .await;
            match result {
                Ok(()) => {
                    for item in items {
                        yield Ok(item);
                    }
                }
                Err(e) => yield Err(e),
            }
        }
    }

    // ---- insert / update / upsert (4.4) -----------------------------------

    #[instrument(skip(self, key, value), fields(order = self.config.order))]
    pub async fn set(&self, key: Value, value: Value, mode: SetMode) -> Result<Option<Value>> {
        let root = self.acquire()?;
        let tx = Transaction::root(self.store.clone());

        match self.set_inner(&tx, root.clone(), &key, &value, mode).await {
            Ok((new_root, old_value)) => {
                if let Err(e) = tx.commit().await {
                    self.release(root);
                    return Err(e);
                }
                trace!(?new_root, "set committed");
                self.release(Some(new_root));
                Ok(old_value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "rollback after failed set also failed");
                }
                self.release(root);
                Err(e)
            }
        }
    }

    async fn set_inner(
        &self,
        tx: &Arc<Transaction>,
        root: Option<Pointer>,
        key: &Value,
        value: &Value,
        mode: SetMode,
    ) -> Result<(Pointer, Option<Value>)> {
        let (node, changed, old_value) = match &root {
            Some(ptr) => {
                set_descend(tx, self.comparator.as_ref(), &self.config, ptr, key, value, mode).await?
            }
            None => set_leaf(
                self.comparator.as_ref(),
                Node::new_leaf(Vec::new(), Vec::new()),
                key,
                value,
                mode,
            )?,
        };

        if !changed {
            let ptr = root.expect("an unchanged result implies a pre-existing root");
            return Ok((ptr, old_value));
        }

        let final_node = if node.len() >= self.config.max_keys() {
            let (left, sep, right) = split_node(node, &self.config);
            let left_ptr = tx.write(left).await?;
            let right_ptr = tx.write(right).await?;
            Node::new_internal(vec![sep], vec![left_ptr, right_ptr])
        } else {
            node
        };

        let new_root_ptr = tx.write(final_node).await?;
        if let Some(old_ptr) = root {
            tx.delete(&old_ptr).await?;
        }
        Ok((new_root_ptr, old_value))
    }

    // ---- delete (4.5) ------------------------------------------------------

    #[instrument(skip(self, key), fields(order = self.config.order))]
    pub async fn delete(&self, key: &Value) -> Result<Option<Value>> {
        let root = self.acquire()?;
        let tx = Transaction::root(self.store.clone());

        match self.delete_inner(&tx, root.clone(), key).await {
            Ok((new_root, old_value)) => {
                if old_value.is_none() {
                    // Not found: nothing changed, nothing to commit.
                    if let Err(rollback_err) = tx.rollback().await {
                        debug!(error = %rollback_err, "rollback of no-op delete failed");
                    }
                    self.release(root);
                    return Ok(None);
                }
                if let Err(e) = tx.commit().await {
                    self.release(root);
                    return Err(e);
                }
                self.release(new_root);
                Ok(old_value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                self.release(root);
                Err(e)
            }
        }
    }

    async fn delete_inner(
        &self,
        tx: &Arc<Transaction>,
        root: Option<Pointer>,
        key: &Value,
    ) -> Result<(Option<Pointer>, Option<Value>)> {
        let ptr = match &root {
            Some(p) => p.clone(),
            None => return Ok((None, None)),
        };

        let (node, changed, old_value) =
            delete_descend(tx, self.comparator.as_ref(), &self.config, &ptr, key).await?;
        if !changed {
            return Ok((root, None));
        }

        let new_root_ptr = match &node {
            Node::Internal(i) if i.children.len() == 1 => i.children[0].clone(),
            _ => tx.write(node).await?,
        };
        tx.delete(&ptr).await?;
        Ok((Some(new_root_ptr), old_value))
    }

    // ---- bulk (4.8) ---------------------------------------------------------

    /// Applies a stably-sorted batch of upserts/deletes in one transaction,
    /// producing one new root. Sorting is purely a cache-locality
    /// optimization; stability preserves submission order for repeated
    /// operations on the same key.
    #[instrument(skip(self, items), fields(order = self.config.order, count = items.len()))]
    pub async fn bulk(&self, mut items: Vec<BulkOp>) -> Result<()> {
        let cmp = self.comparator.clone();
        items.sort_by(|a, b| cmp.compare(a.key(), b.key()));

        let root = self.acquire()?;
        let tx = Transaction::root(self.store.clone());
        let mut current = root.clone();
        let mut failure = None;

        for item in items {
            // Both branches settle on `Option<Pointer>`: `set_inner` always
            // produces a root (a tree can't go from populated to empty via
            // an upsert), `delete_inner` may legitimately stay `None` - a
            // delete of a missing key against an already-empty tree.
            let outcome: Result<(Option<Pointer>, Option<Value>)> = match item {
                BulkOp::Upsert(k, v) => self
                    .set_inner(&tx, current.clone(), &k, &v, SetMode::Upsert)
                    .await
                    .map(|(ptr, old)| (Some(ptr), old)),
                BulkOp::Delete(k) => self.delete_inner(&tx, current.clone(), &k).await,
            };
            match outcome {
                Ok((new_root, _)) => current = new_root,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                if let Err(e) = tx.commit().await {
                    self.release(root);
                    return Err(e);
                }
                self.release(current);
                Ok(())
            }
            Some(e) => {
                let _ = tx.rollback().await;
                self.release(root);
                Err(e)
            }
        }
    }

    // ---- pointer enumeration / mark (4.7) -----------------------------------

    /// The tree's height: the number of internal levels above its leaves
    /// (0 for an empty tree or a tree with a single leaf root).
    pub async fn height(&self) -> Result<usize> {
        let root = self.acquire()?;
        let result = self.height_inner(&root).await;
        self.release(root);
        result
    }

    async fn height_inner(&self, root: &Option<Pointer>) -> Result<usize> {
        let mut depth = 0;
        let mut cursor = match root {
            Some(p) => p.clone(),
            None => return Ok(0),
        };
        loop {
            match self.store.read(&cursor).await? {
                Node::Leaf(_) => return Ok(depth),
                Node::Internal(i) => {
                    cursor = i.children[0].clone();
                    depth += 1;
                }
            }
        }
    }

    /// Preorder traversal visiting every reachable node pointer. `cb`
    /// returns `true` to prune the subtree rooted at that pointer.
    /// Pointers at a depth known (from one leftmost descent) to be leaves
    /// are never read back from the store - only their pointer is handed
    /// to `cb` - since leaves carry no further pointers to follow.
    pub async fn for_each_ptr<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(&Pointer, usize) -> bool + Send,
    {
        let root = self.acquire()?;
        let result = async {
            if let Some(ptr) = &root {
                let height = self.height_inner(&root).await?;
                for_each_ptr_descend(&self.store, ptr.clone(), 0, height, &mut cb).await?;
            }
            Ok(())
        }
        .await;
        self.release(root);
        result
    }
}

// ---- search (4.3) -----------------------------------------------------------

/// Binary search for the rightmost child index whose subtree may contain
/// `key`: an upper-bound search so an exact match routes to the child on
/// its right, matching "left child strictly less; right child
/// greater-or-equal".
pub(crate) fn find_child_index(cmp: &dyn Comparator, keys: &[Value], key: &Value) -> usize {
    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp.compare(&keys[mid], key) != Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Binary search for the leftmost position where `key` could be inserted
/// into a leaf's key array. Returns `(index, equal)`.
pub(crate) fn find_leaf_index(cmp: &dyn Comparator, keys: &[Value], key: &Value) -> (usize, bool) {
    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp.compare(&keys[mid], key) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let equal = lo < keys.len() && cmp.compare(&keys[lo], key) == Ordering::Equal;
    (lo, equal)
}

// ---- split / redistribute / merge -------------------------------------------

/// Splits a node that has grown to exactly one key past capacity. Leaves
/// split at `order`, duplicating the promoted key into the new right
/// sibling; internal nodes split around the median key, which is promoted
/// without duplication.
fn split_node(node: Node, config: &TreeConfig) -> (Node, Value, Node) {
    let order = config.order;
    match node {
        Node::Leaf(leaf) => {
            let mut keys = leaf.keys;
            let mut values = leaf.values;
            let right_keys = keys.split_off(order);
            let right_values = values.split_off(order);
            let separator = right_keys[0].clone();
            (
                Node::new_leaf(keys, values),
                separator,
                Node::new_leaf(right_keys, right_values),
            )
        }
        Node::Internal(internal) => {
            let mut keys = internal.keys;
            let mut children = internal.children;
            let separator = keys.remove(order);
            let right_keys = keys.split_off(order);
            let right_children = children.split_off(order + 1);
            (
                Node::new_internal(keys, children),
                separator,
                Node::new_internal(right_keys, right_children),
            )
        }
    }
}

/// Moves one key/value (leaves) or one key+child (internals) across the
/// separator between `child` and `sibling`. Returns the new `(child,
/// sibling, separator)`.
fn redistribute(child: Node, sibling: Node, separator: Value, sibling_is_right: bool) -> (Node, Node, Value) {
    match (child, sibling) {
        (Node::Leaf(mut c), Node::Leaf(mut s)) => {
            if sibling_is_right {
                let k = s.keys.remove(0);
                let v = s.values.remove(0);
                c.keys.push(k);
                c.values.push(v);
                let new_sep = s.keys[0].clone();
                (Node::Leaf(c), Node::Leaf(s), new_sep)
            } else {
                let k = s.keys.pop().expect("sibling at minimum size has a last key");
                let v = s.values.pop().expect("sibling at minimum size has a last value");
                c.keys.insert(0, k.clone());
                c.values.insert(0, v);
                (Node::Leaf(c), Node::Leaf(s), k)
            }
        }
        (Node::Internal(mut c), Node::Internal(mut s)) => {
            if sibling_is_right {
                c.keys.push(separator);
                let first_child = s.children.remove(0);
                c.children.push(first_child);
                let new_sep = s.keys.remove(0);
                (Node::Internal(c), Node::Internal(s), new_sep)
            } else {
                c.keys.insert(0, separator);
                let last_child = s.children.pop().expect("sibling has a last child");
                c.children.insert(0, last_child);
                let new_sep = s.keys.pop().expect("sibling has a last key");
                (Node::Internal(c), Node::Internal(s), new_sep)
            }
        }
        _ => unreachable!("siblings at the same tree level share a variant"),
    }
}

/// Concatenates `child` and `sibling` into one node, interleaving the
/// parent separator between them for internal nodes.
fn merge_nodes(child: Node, sibling: Node, separator: Value, sibling_is_right: bool) -> Node {
    match (child, sibling) {
        (Node::Leaf(c), Node::Leaf(s)) => {
            let (mut keys, mut values, tail_keys, tail_values) = if sibling_is_right {
                (c.keys, c.values, s.keys, s.values)
            } else {
                (s.keys, s.values, c.keys, c.values)
            };
            keys.extend(tail_keys);
            values.extend(tail_values);
            Node::new_leaf(keys, values)
        }
        (Node::Internal(c), Node::Internal(s)) => {
            let (left, right) = if sibling_is_right { (c, s) } else { (s, c) };
            let mut keys = left.keys;
            keys.push(separator);
            keys.extend(right.keys);
            let mut children = left.children;
            children.extend(right.children);
            Node::new_internal(keys, children)
        }
        _ => unreachable!("siblings at the same tree level share a variant"),
    }
}

fn set_leaf(cmp: &dyn Comparator, leaf: Node, key: &Value, value: &Value, mode: SetMode) -> Result<(Node, bool, Option<Value>)> {
    let mut leaf = match leaf {
        Node::Leaf(l) => l,
        Node::Internal(_) => unreachable!("set_leaf called on an internal node"),
    };
    let (idx, equal) = find_leaf_index(cmp, &leaf.keys, key);

    match mode {
        SetMode::Insert => {
            if equal {
                return Err(Error::DuplicateKey(key.clone()));
            }
            leaf.keys.insert(idx, key.clone());
            leaf.values.insert(idx, value.clone());
            Ok((Node::Leaf(leaf), true, None))
        }
        SetMode::Update => {
            if !equal {
                return Err(Error::MissingKey(key.clone()));
            }
            overwrite_or_elide(cmp, leaf, idx, value)
        }
        SetMode::Upsert => {
            if equal {
                overwrite_or_elide(cmp, leaf, idx, value)
            } else {
                leaf.keys.insert(idx, key.clone());
                leaf.values.insert(idx, value.clone());
                Ok((Node::Leaf(leaf), true, None))
            }
        }
    }
}

/// Shared `update`/`upsert`-on-match path: elides the write entirely if
/// the new value compares equal to the old one under the tree's
/// value-equality predicate.
fn overwrite_or_elide(
    cmp: &dyn Comparator,
    mut leaf: crate::node::LeafNode,
    idx: usize,
    value: &Value,
) -> Result<(Node, bool, Option<Value>)> {
    let old = leaf.values[idx].clone();
    if cmp.values_equal(&old, value) {
        Ok((Node::Leaf(leaf), false, Some(old)))
    } else {
        leaf.values[idx] = value.clone();
        Ok((Node::Leaf(leaf), true, Some(old)))
    }
}

#[async_recursion]
async fn set_descend(
    tx: &Arc<Transaction>,
    cmp: &dyn Comparator,
    config: &TreeConfig,
    ptr: &Pointer,
    key: &Value,
    value: &Value,
    mode: SetMode,
) -> Result<(Node, bool, Option<Value>)> {
    let node = tx.read(ptr).await?;
    match node {
        Node::Leaf(_) => set_leaf(cmp, node, key, value, mode),
        Node::Internal(internal) => {
            let idx = find_child_index(cmp, &internal.keys, key);
            let child_ptr = internal.children[idx].clone();
            let (child_node, changed, old_value) =
                set_descend(tx, cmp, config, &child_ptr, key, value, mode).await?;

            if !changed {
                return Ok((Node::Internal(internal), false, old_value));
            }

            let mut keys = internal.keys;
            let mut children = internal.children;

            if child_node.len() >= config.max_keys() {
                let (left, sep, right) = split_node(child_node, config);
                let left_ptr = tx.write(left).await?;
                let right_ptr = tx.write(right).await?;
                tx.delete(&child_ptr).await?;
                children[idx] = left_ptr;
                children.insert(idx + 1, right_ptr);
                keys.insert(idx, sep);
            } else {
                let new_ptr = tx.write(child_node).await?;
                tx.delete(&child_ptr).await?;
                children[idx] = new_ptr;
            }

            Ok((Node::new_internal(keys, children), true, old_value))
        }
    }
}

#[async_recursion]
async fn delete_descend(
    tx: &Arc<Transaction>,
    cmp: &dyn Comparator,
    config: &TreeConfig,
    ptr: &Pointer,
    key: &Value,
) -> Result<(Node, bool, Option<Value>)> {
    let node = tx.read(ptr).await?;
    match node {
        Node::Leaf(mut leaf) => {
            let (idx, equal) = find_leaf_index(cmp, &leaf.keys, key);
            if !equal {
                leaf.ptr = None;
                return Ok((Node::Leaf(leaf), false, None));
            }
            leaf.keys.remove(idx);
            let removed = leaf.values.remove(idx);
            leaf.ptr = None;
            Ok((Node::Leaf(leaf), true, Some(removed)))
        }
        Node::Internal(internal) => {
            let idx = find_child_index(cmp, &internal.keys, key);
            let child_ptr = internal.children[idx].clone();
            let (child_node, changed, old_value) =
                delete_descend(tx, cmp, config, &child_ptr, key).await?;

            if !changed {
                return Ok((Node::Internal(internal), false, old_value));
            }

            let mut keys = internal.keys;
            let mut children = internal.children;

            if children.len() <= 1 || child_node.fill() >= config.order {
                let new_ptr = tx.write(child_node).await?;
                tx.delete(&child_ptr).await?;
                children[idx] = new_ptr;
                return Ok((Node::new_internal(keys, children), true, old_value));
            }

            // Tie-break: prefer the right sibling unless this child is
            // the rightmost, in which case use the left one.
            let is_rightmost = idx == children.len() - 1;
            let sibling_idx = if is_rightmost { idx - 1 } else { idx + 1 };
            let sibling_is_right = sibling_idx > idx;
            let separator_idx = if sibling_is_right { idx } else { idx - 1 };

            let sibling_ptr = children[sibling_idx].clone();
            let sibling_node = tx.read(&sibling_ptr).await?;

            if sibling_node.fill() > config.order {
                let (new_child, new_sibling, new_separator) =
                    redistribute(child_node, sibling_node, keys[separator_idx].clone(), sibling_is_right);
                let new_child_ptr = tx.write(new_child).await?;
                let new_sibling_ptr = tx.write(new_sibling).await?;
                tx.delete(&child_ptr).await?;
                tx.delete(&sibling_ptr).await?;
                children[idx] = new_child_ptr;
                children[sibling_idx] = new_sibling_ptr;
                keys[separator_idx] = new_separator;
            } else {
                let merged = merge_nodes(child_node, sibling_node, keys[separator_idx].clone(), sibling_is_right);
                let merged_ptr = tx.write(merged).await?;
                tx.delete(&child_ptr).await?;
                tx.delete(&sibling_ptr).await?;
                if sibling_is_right {
                    keys.remove(idx);
                    children.remove(idx + 1);
                    children[idx] = merged_ptr;
                } else {
                    keys.remove(idx - 1);
                    children.remove(idx - 1);
                    children[idx - 1] = merged_ptr;
                }
            }

            Ok((Node::new_internal(keys, children), true, old_value))
        }
    }
}

#[async_recursion]
async fn range_each_descend(
    store: &Arc<dyn Store>,
    cmp: &dyn Comparator,
    ptr: &Pointer,
    lower: Option<&Value>,
    upper: Option<&Value>,
    cb: &mut (dyn FnMut(&Value, &Value) -> RangeSignal + Send),
) -> Result<RangeSignal> {
    let node = store.read(ptr).await?;
    match node {
        Node::Leaf(leaf) => {
            let start = match lower {
                Some(l) => find_leaf_index(cmp, &leaf.keys, l).0,
                None => 0,
            };
            for i in start..leaf.keys.len() {
                if let Some(u) = upper {
                    if cmp.compare(&leaf.keys[i], u) == Ordering::Greater {
                        return Ok(RangeSignal::Continue);
                    }
                }
                if let RangeSignal::Break = cb(&leaf.keys[i], &leaf.values[i]) {
                    return Ok(RangeSignal::Break);
                }
            }
            Ok(RangeSignal::Continue)
        }
        Node::Internal(internal) => {
            let start_idx = match lower {
                Some(l) => find_child_index(cmp, &internal.keys, l),
                None => 0,
            };
            for i in start_idx..internal.children.len() {
                let signal =
                    range_each_descend(store, cmp, &internal.children[i], lower, upper, cb).await?;
                if let RangeSignal::Break = signal {
                    return Ok(RangeSignal::Break);
                }
                if i < internal.keys.len() {
                    if let Some(u) = upper {
                        if cmp.compare(&internal.keys[i], u) == Ordering::Greater {
                            return Ok(RangeSignal::Continue);
                        }
                    }
                }
            }
            Ok(RangeSignal::Continue)
        }
    }
}

#[async_recursion]
async fn for_each_ptr_descend(
    store: &Arc<dyn Store>,
    ptr: Pointer,
    depth: usize,
    height: usize,
    cb: &mut (dyn FnMut(&Pointer, usize) -> bool + Send),
) -> Result<()> {
    let skip = cb(&ptr, depth);
    if skip || depth == height {
        return Ok(());
    }
    if let Node::Internal(internal) = store.read(&ptr).await? {
        for child in internal.children {
            for_each_ptr_descend(store, child, depth + 1, height, cb).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    fn order2() -> TreeConfig {
        TreeConfig::new(2).unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let tree = Tree::empty(store(), order2());
        tree.set(json!(1), json!("one"), SetMode::Insert).await.unwrap();
        assert_eq!(tree.get(&json!(1)).await.unwrap(), Some(json!("one")));
        assert_eq!(tree.get(&json!(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_duplicate_fails() {
        let tree = Tree::empty(store(), order2());
        tree.set(json!(1), json!("one"), SetMode::Insert).await.unwrap();
        let err = tree.set(json!(1), json!("again"), SetMode::Insert).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn update_missing_fails() {
        let tree = Tree::empty(store(), order2());
        let err = tree.set(json!(1), json!("x"), SetMode::Update).await.unwrap_err();
        assert!(matches!(err, Error::MissingKey(_)));
    }

    #[tokio::test]
    async fn upsert_elides_write_when_value_unchanged() {
        let tree = Tree::empty(store(), order2());
        tree.set(json!(1), json!("a"), SetMode::Upsert).await.unwrap();
        let root_before = tree.current_root().unwrap();
        let old = tree.set(json!(1), json!("a"), SetMode::Upsert).await.unwrap();
        assert_eq!(old, Some(json!("a")));
        assert_eq!(tree.current_root().unwrap(), root_before, "no new root should publish");
    }

    #[tokio::test]
    async fn many_inserts_stay_sorted_and_within_fill_bounds() {
        let store = store();
        let tree = Tree::empty(store.clone(), order2());
        let mut keys: Vec<i64> = (0..200).collect();
        // Deterministic shuffle without external randomness.
        keys.sort_by_key(|k| (k * 2654435761) as u32);
        for k in &keys {
            tree.set(json!(k), json!(k * 10), SetMode::Insert).await.unwrap();
        }

        let mut seen = Vec::new();
        tree.range_each(None, None, |k, v| {
            seen.push((k.clone(), v.clone()));
            RangeSignal::Continue
        })
        .await
        .unwrap();

        assert_eq!(seen.len(), 200);
        for w in seen.windows(2) {
            assert_eq!(crate::value::default_compare(&w[0].0, &w[1].0), Ordering::Less);
        }
        for (k, v) in &seen {
            assert_eq!(v, &json!(k.as_i64().unwrap() * 10));
        }

        // 200 inserts at order 2 must have split down into several levels -
        // walk every reachable node and check the §8 fill bound directly,
        // rather than trusting sortedness alone to expose a bad split
        // threshold.
        let order = order2().order;
        let mut reachable = Vec::new();
        tree.for_each_ptr(|ptr, depth| {
            reachable.push((ptr.clone(), depth));
            false
        })
        .await
        .unwrap();
        assert!(
            reachable.iter().any(|(_, depth)| *depth > 0),
            "200 inserts at order 2 must produce at least one non-root level"
        );
        for (ptr, depth) in reachable {
            let fill = store.read(&ptr).await.unwrap().fill();
            assert!(fill <= 2 * order, "node at depth {depth} has fill {fill} > max {}", 2 * order);
            if depth > 0 {
                assert!(fill >= order, "non-root node at depth {depth} has fill {fill} < min {order}");
            }
        }
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let tree = Tree::empty(store(), order2());
        for k in 0..20i64 {
            tree.set(json!(k), json!(k), SetMode::Insert).await.unwrap();
        }
        for k in 0..20i64 {
            let removed = tree.delete(&json!(k)).await.unwrap();
            assert_eq!(removed, Some(json!(k)));
        }
        for k in 0..20i64 {
            assert_eq!(tree.get(&json!(k)).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn delete_missing_key_is_a_noop() {
        let tree = Tree::empty(store(), order2());
        tree.set(json!(1), json!(1), SetMode::Insert).await.unwrap();
        let root_before = tree.current_root().unwrap();
        let removed = tree.delete(&json!(999)).await.unwrap();
        assert_eq!(removed, None);
        assert_eq!(tree.current_root().unwrap(), root_before);
    }

    #[tokio::test]
    async fn range_each_respects_bounds() {
        let tree = Tree::empty(store(), order2());
        for k in 0..50i64 {
            tree.set(json!(k), json!(k), SetMode::Insert).await.unwrap();
        }
        let mut seen = Vec::new();
        tree.range_each(Some(&json!(10)), Some(&json!(20)), |k, _| {
            seen.push(k.as_i64().unwrap());
            RangeSignal::Continue
        })
        .await
        .unwrap();
        assert_eq!(seen, (10..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn bulk_applies_interleaved_upserts_and_deletes_in_one_commit() {
        let tree = Tree::empty(store(), order2());
        for (k, v) in [(16, 16), (1, 1), (4, 4), (9, 9), (25, 25)] {
            tree.set(json!(k), json!(v), SetMode::Insert).await.unwrap();
        }

        tree.bulk(vec![
            BulkOp::Upsert(json!(20), json!(20)),
            BulkOp::Upsert(json!(13), json!(13)),
            BulkOp::Upsert(json!(15), json!(15)),
            BulkOp::Upsert(json!(10), json!(10)),
            BulkOp::Upsert(json!(11), json!(11)),
            BulkOp::Upsert(json!(12), json!(12)),
            BulkOp::Delete(json!(13)),
            BulkOp::Delete(json!(15)),
            BulkOp::Delete(json!(1)),
        ])
        .await
        .unwrap();

        let mut seen = Vec::new();
        tree.range_each(None, None, |k, _| {
            seen.push(k.as_i64().unwrap());
            RangeSignal::Continue
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![4, 9, 10, 11, 12, 16, 20, 25]);
    }

    #[tokio::test]
    async fn bulk_deleting_a_missing_key_from_an_empty_tree_is_a_noop() {
        let tree = Tree::empty(store(), order2());
        tree.bulk(vec![BulkOp::Delete(json!(1))]).await.unwrap();
        assert_eq!(tree.current_root().unwrap(), None);
        assert_eq!(tree.get(&json!(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_operation_on_same_handle_fails_in_progress() {
        let tree = Arc::new(Tree::empty(store(), order2()));
        let t1 = tree.clone();
        let handle = tokio::spawn(async move {
            for k in 0..2000i64 {
                let _ = t1.set(json!(k), json!(k), SetMode::Insert).await;
            }
        });
        // Racing a second op while the first is mid-flight should, at
        // least occasionally, observe InProgress rather than silently
        // interleaving. We don't assert it happens every time (scheduling
        // is not guaranteed), only that it never panics or corrupts state.
        for k in 2000..2010i64 {
            let _ = tree.set(json!(k), json!(k), SetMode::Insert).await;
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_and_leaves_no_orphan_files() {
        let backing = Arc::new(MemoryStore::new());
        let tree = Tree::empty(backing.clone(), order2());
        tree.set(json!(1), json!(10), SetMode::Insert).await.unwrap();
        let count_before = backing.len();

        let err = tree.set(json!(1), json!(99), SetMode::Insert).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(backing.len(), count_before, "no orphan nodes after a failed insert");
    }

    #[tokio::test]
    async fn range_stream_yields_same_entries_as_range_each() {
        use futures_util::StreamExt;

        let tree = Tree::empty(store(), order2());
        for k in 0..30i64 {
            tree.set(json!(k), json!(k * 2), SetMode::Insert).await.unwrap();
        }

        let items: Vec<(Value, Value)> = tree
            .range(Some(json!(5)), Some(json!(15)))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 11);
        assert_eq!(items[0], (json!(5), json!(10)));
        assert_eq!(items.last().unwrap(), &(json!(15), json!(30)));
    }

    #[tokio::test]
    async fn for_each_ptr_visits_every_reachable_pointer() {
        let tree = Tree::empty(store(), order2());
        for k in 0..40i64 {
            tree.set(json!(k), json!(k), SetMode::Insert).await.unwrap();
        }
        let mut visited = Vec::new();
        tree.for_each_ptr(|ptr, depth| {
            visited.push((ptr.clone(), depth));
            false
        })
        .await
        .unwrap();
        assert!(!visited.is_empty());
        assert!(visited.iter().any(|(_, d)| *d == 0));
    }
}
