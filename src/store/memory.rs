// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store, used by tests and by callers who want tree semantics
//! without durability.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::pointer::Pointer;
use crate::store::hash::{DefaultHasher, NodeHasher};
use crate::store::Store;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

struct Entry {
    node: Node,
    /// Monotonic counter bumped by `touch`; `sweep` drops anything whose
    /// mark is older than the pass it was invoked with.
    mark: u64,
}

struct Inner {
    nodes: HashMap<Pointer, Entry>,
    meta: HashMap<String, Value>,
    mark_pass: u64,
}

/// A non-durable [`Store`] backed by a `HashMap`. Mirrors the file store's
/// content-addressing and mark/sweep semantics so the same tree tests run
/// against either backend.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    hasher: Box<dyn NodeHasher>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                meta: HashMap::new(),
                mark_pass: 0,
            }),
            hasher: Box::new(DefaultHasher),
        }
    }

    pub fn with_hasher(hasher: impl NodeHasher + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                meta: HashMap::new(),
                mark_pass: 0,
            }),
            hasher: Box::new(hasher),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("memory store lock poisoned").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a new mark pass, returning its id for use with `touch`.
    pub fn begin_mark_pass(&self) -> u64 {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.mark_pass += 1;
        inner.mark_pass
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, ptr: &Pointer) -> Result<Node> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        inner
            .nodes
            .get(ptr)
            .map(|e| e.node.clone())
            .ok_or_else(|| Error::NotFound(ptr.clone()))
    }

    async fn write(&self, mut node: Node) -> Result<Pointer> {
        let bytes = node.encode()?;
        let ptr = Pointer::from_digest_hex(&self.hasher.digest_hex(&bytes));
        node.set_ptr(ptr.clone());

        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let mark_pass = inner.mark_pass;
        inner
            .nodes
            .entry(ptr.clone())
            .or_insert(Entry { node, mark: mark_pass });
        Ok(ptr)
    }

    async fn delete(&self, ptr: &Pointer) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.nodes.remove(ptr);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn read_meta(&self, path: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.meta.get(path).cloned())
    }

    async fn write_meta(&self, path: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.meta.insert(path.to_string(), value);
        Ok(())
    }

    async fn touch(&self, ptr: &Pointer) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let pass = inner.mark_pass;
        if let Some(entry) = inner.nodes.get_mut(ptr) {
            entry.mark = pass;
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<usize> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let pass = inner.mark_pass;
        let before = inner.nodes.len();
        inner.nodes.retain(|_, entry| entry.mark == pass);
        Ok(before - inner.nodes.len())
    }
}
