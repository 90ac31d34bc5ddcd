// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Named tree index.
//!
//! Per §4.9: "A small B+tree mapping `treeName → {rootPtr, config}`,
//! stored in the backing store's meta record under a distinguished path."
//! The index is an ordinary [`Tree`] over the same store, keyed by tree
//! name and valued by a small JSON record - `open`/`commit` reuse the same
//! copy-on-write engine as any other tree rather than hand-rolling a
//! second persistence path. The only state durable outside that tree is
//! its own root pointer, written atomically to the store's meta record
//! under [`INDEX_META_PATH`] on every commit.

use crate::config::TreeConfig;
use crate::error::Result;
use crate::pointer::Pointer;
use crate::store::Store;
use crate::tree::{BulkOp, Tree};
use crate::value::{default_comparator, SharedComparator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Default order for the index tree itself. Kept small relative to
/// [`crate::config::DEFAULT_ORDER`]: a store typically holds far fewer
/// named trees than any one tree holds entries.
pub const DEFAULT_INDEX_ORDER: usize = 16;

/// The meta-record path the index's own root pointer is published under.
const INDEX_META_PATH: &str = "index_root";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    root: Option<String>,
    order: usize,
}

/// Looks named trees up and persists their current root after a commit.
/// Wraps one B+tree (the index itself) plus the shared store every named
/// tree it hands back is also opened against.
pub struct TreeIndex {
    store: Arc<dyn Store>,
    index: Tree,
}

impl TreeIndex {
    /// Opens the index, loading its root pointer from the store's meta
    /// record if one was ever committed, or starting from an empty index
    /// tree otherwise.
    pub async fn open(store: Arc<dyn Store>) -> Result<Self> {
        Self::open_with_order(store, DEFAULT_INDEX_ORDER).await
    }

    pub async fn open_with_order(store: Arc<dyn Store>, index_order: usize) -> Result<Self> {
        let config = TreeConfig::new(index_order)?;
        let root = store
            .read_meta(INDEX_META_PATH)
            .await?
            .and_then(|v| v.as_str().map(|s| Pointer::from(s.to_string())));
        let index = match root {
            Some(ptr) => Tree::open(store.clone(), ptr, config),
            None => Tree::empty(store.clone(), config),
        };
        Ok(Self { store, index })
    }

    /// Opens a handle onto the tree last committed under `name`, using the
    /// default comparator. Returns `None` if nothing has ever been
    /// committed under that name.
    pub async fn get(&self, name: &str) -> Result<Option<Tree>> {
        self.get_with_comparator(name, default_comparator()).await
    }

    pub async fn get_with_comparator(
        &self,
        name: &str,
        comparator: SharedComparator,
    ) -> Result<Option<Tree>> {
        let Some(value) = self.index.get(&json!(name)).await? else {
            return Ok(None);
        };
        let record: IndexRecord = serde_json::from_value(value)?;
        let config = TreeConfig::new(record.order)?;
        let tree = match record.root {
            Some(root) => Tree::open_with_comparator(
                self.store.clone(),
                Pointer::from(root),
                config,
                comparator,
            ),
            None => Tree::with_comparator(self.store.clone(), config, comparator),
        };
        Ok(Some(tree))
    }

    /// A fresh, uncommitted tree - callers still need to [`Self::commit`]
    /// it under a name before it is discoverable by [`Self::get`].
    pub fn empty(&self, config: TreeConfig) -> Tree {
        Tree::empty(self.store.clone(), config)
    }

    /// Applies a batch of named updates to the index in one commit:
    /// `Some(tree)` upserts that name's current root and config, `None`
    /// deletes the name. One `bulk` call against the index tree, one
    /// atomic meta write of the resulting index root pointer - matching
    /// §4.9's "applies a bulk update (delete when value is absent), then
    /// rewrites the meta record with the new index root pointer".
    pub async fn commit<'a, I>(&self, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, Option<&'a Tree>)>,
    {
        let mut ops = Vec::new();
        for (name, tree) in updates {
            match tree {
                Some(tree) => {
                    let record = IndexRecord {
                        root: tree.current_root()?.map(|p| p.as_str().to_string()),
                        order: tree.config().order,
                    };
                    ops.push(BulkOp::Upsert(json!(name), serde_json::to_value(record)?));
                }
                None => ops.push(BulkOp::Delete(json!(name))),
            }
        }
        self.index.bulk(ops).await?;

        let new_root = self.index.current_root()?;
        self.store
            .write_meta(
                INDEX_META_PATH,
                json!(new_root.map(|p| p.as_str().to_string())),
            )
            .await
    }

    /// Convenience wrapper over [`Self::commit`] for the common single-name
    /// case.
    pub async fn commit_one(&self, name: &str, tree: Option<&Tree>) -> Result<()> {
        self.commit([(name, tree)]).await
    }
}
