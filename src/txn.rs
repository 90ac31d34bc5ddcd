// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Nestable transaction overlay.
//!
//! A [`Transaction`] wraps a backing store and optionally a parent
//! transaction. It tracks `undos` (pointers this transaction itself wrote -
//! deleted on rollback) and `applies` (deletes this transaction requested
//! against data it did not write itself - deferred until commit). Writes
//! always go straight through to the backing store; the overlay's only job
//! is bookkeeping so rollback can undo what a failed operation published
//! and so a parent transaction inherits the right cleanup obligations when
//! a child commits into it.
//!
//! Nesting is a stack: every tree operation opens one child transaction for
//! its own atomicity and must commit or roll it back before returning,
//! in LIFO order relative to any transaction it was opened from.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::pointer::Pointer;
use crate::store::Store;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A single level of the transaction stack.
pub struct Transaction {
    store: Arc<dyn Store>,
    parent: Option<Arc<Transaction>>,
    undos: Mutex<HashSet<Pointer>>,
    applies: Mutex<HashSet<Pointer>>,
}

impl Transaction {
    /// Opens a root transaction directly over a store.
    pub fn root(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            parent: None,
            undos: Mutex::new(HashSet::new()),
            applies: Mutex::new(HashSet::new()),
        })
    }

    /// Opens a child transaction nested under `self`.
    pub fn begin_child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            store: self.store.clone(),
            parent: Some(self.clone()),
            undos: Mutex::new(HashSet::new()),
            applies: Mutex::new(HashSet::new()),
        })
    }

    /// Reads delegate straight to the backing store: nodes are immutable
    /// once written, so there is nothing for an overlay to shadow. The one
    /// exception is a pointer this same transaction has already requested
    /// be deleted (it sits in `applies`, awaiting commit) - resolving that
    /// one fails with `Deleted` rather than serving stale content back to
    /// a caller that, within this session, has already discarded it.
    pub async fn read(&self, ptr: &Pointer) -> Result<Node> {
        if self.applies.lock().expect("apply set poisoned").contains(ptr) {
            return Err(Error::Deleted(ptr.clone()));
        }
        self.store.read(ptr).await
    }

    /// Writes through to the backing store and records the resulting
    /// pointer as an undo: if this transaction later rolls back, the
    /// pointer's file is removed.
    pub async fn write(&self, node: Node) -> Result<Pointer> {
        let ptr = self.store.write(node).await?;
        self.undos.lock().expect("undo set poisoned").insert(ptr.clone());
        Ok(ptr)
    }

    /// Requests deletion of `ptr`. If this transaction itself wrote `ptr`
    /// (it is in `undos`), the write is retracted immediately and the
    /// pointer is deleted right away. Otherwise the delete is deferred:
    /// recorded in `applies` and only carried out when this transaction
    /// (or an ancestor it merges into) commits.
    pub async fn delete(&self, ptr: &Pointer) -> Result<()> {
        let was_own_write = self.undos.lock().expect("undo set poisoned").remove(ptr);
        if was_own_write {
            self.store.delete(ptr).await
        } else {
            self.applies.lock().expect("apply set poisoned").insert(ptr.clone());
            Ok(())
        }
    }

    /// Registers `ptr` as an undo without writing anything - used when a
    /// child transaction merges its undos into this one at commit time.
    fn record_undo(&self, ptr: Pointer) {
        self.undos.lock().expect("undo set poisoned").insert(ptr);
    }

    /// Commits this transaction.
    ///
    /// If there is a parent transaction, the merge is purely bookkeeping:
    /// this transaction's undos become the parent's undos (so an eventual
    /// rollback further up still cleans them up), and its applies are
    /// replayed against the parent via [`Transaction::delete`] (so the
    /// parent either defers them again or, if it has no parent of its own,
    /// executes them on its own commit).
    ///
    /// If there is no parent (this is the root transaction over the base
    /// store), applies are executed against the store directly; undos need
    /// no further action since they were already durably written.
    pub async fn commit(&self) -> Result<()> {
        let applies: Vec<Pointer> = self
            .applies
            .lock()
            .expect("apply set poisoned")
            .drain()
            .collect();
        let undos: Vec<Pointer> = self
            .undos
            .lock()
            .expect("undo set poisoned")
            .drain()
            .collect();

        match &self.parent {
            Some(parent) => {
                for ptr in undos {
                    parent.record_undo(ptr);
                }
                for ptr in applies {
                    parent.delete(&ptr).await?;
                }
            }
            None => {
                for ptr in applies {
                    self.store.delete(&ptr).await?;
                }
            }
        }
        Ok(())
    }

    /// Rolls back this transaction: every pointer it wrote is deleted from
    /// the backing store, and every deferred apply is simply discarded
    /// (they were never executed). Returns nothing - the caller is
    /// expected to have captured the pre-transaction root pointer itself
    /// and restore it.
    pub async fn rollback(&self) -> Result<()> {
        let undos: Vec<Pointer> = self
            .undos
            .lock()
            .expect("undo set poisoned")
            .drain()
            .collect();
        self.applies.lock().expect("apply set poisoned").clear();
        for ptr in undos {
            self.store.delete(&ptr).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn leaf(k: i64) -> Node {
        Node::new_leaf(vec![json!(k)], vec![json!(k)])
    }

    #[tokio::test]
    async fn rollback_deletes_everything_this_transaction_wrote() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let root = Transaction::root(store.clone());
        let ptr = root.write(leaf(1)).await.unwrap();
        root.rollback().await.unwrap();
        assert!(store.read(&ptr).await.is_err());
    }

    #[tokio::test]
    async fn reading_a_pointer_this_transaction_deferred_deleting_fails() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let pre_existing = store.write(leaf(1)).await.unwrap();

        let root = Transaction::root(store.clone());
        root.delete(&pre_existing).await.unwrap();
        let err = root.read(&pre_existing).await.unwrap_err();
        assert!(matches!(err, Error::Deleted(_)));
    }

    #[tokio::test]
    async fn commit_with_no_parent_executes_applies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let pre_existing = store.write(leaf(1)).await.unwrap();

        let root = Transaction::root(store.clone());
        root.delete(&pre_existing).await.unwrap();
        assert!(store.read(&pre_existing).await.is_ok(), "delete is deferred to commit");
        root.commit().await.unwrap();
        assert!(store.read(&pre_existing).await.is_err());
    }

    #[tokio::test]
    async fn deleting_own_write_retracts_immediately() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let root = Transaction::root(store.clone());
        let ptr = root.write(leaf(1)).await.unwrap();
        root.delete(&ptr).await.unwrap();
        assert!(store.read(&ptr).await.is_err());
        // Nothing left to commit or roll back for this pointer.
        root.commit().await.unwrap();
    }

    #[tokio::test]
    async fn child_commit_merges_undos_into_parent() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let parent = Transaction::root(store.clone());
        let child = parent.begin_child();
        let ptr = child.write(leaf(1)).await.unwrap();
        child.commit().await.unwrap();

        // Undo now belongs to parent: rolling back parent removes it.
        parent.rollback().await.unwrap();
        assert!(store.read(&ptr).await.is_err());
    }

    #[tokio::test]
    async fn child_rollback_does_not_touch_parent_writes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let parent = Transaction::root(store.clone());
        let parent_ptr = parent.write(leaf(1)).await.unwrap();

        let child = parent.begin_child();
        let child_ptr = child.write(leaf(2)).await.unwrap();
        child.rollback().await.unwrap();

        assert!(store.read(&child_ptr).await.is_err());
        assert!(store.read(&parent_ptr).await.is_ok());
        parent.commit().await.unwrap();
        assert!(store.read(&parent_ptr).await.is_ok());
    }

    #[tokio::test]
    async fn child_apply_propagates_to_parent_for_later_commit() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let pre_existing = store.write(leaf(1)).await.unwrap();

        let parent = Transaction::root(store.clone());
        let child = parent.begin_child();
        child.delete(&pre_existing).await.unwrap();
        child.commit().await.unwrap();
        assert!(store.read(&pre_existing).await.is_ok(), "still owned by parent");

        parent.commit().await.unwrap();
        assert!(store.read(&pre_existing).await.is_err());
    }
}
