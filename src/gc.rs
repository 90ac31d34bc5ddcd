// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Mark-and-sweep garbage collection across one or more trees sharing a
//! store.
//!
//! A node file can outlive the tree operation that orphaned it - the
//! operation only drops its own reference, it does not know whether some
//! other tree (or an older root a caller is still holding onto) still
//! reaches the same pointer. Collection is therefore a full mark phase
//! over every tree the caller considers live, followed by one sweep.

use crate::error::Result;
use crate::pointer::Pointer;
use crate::store::Store;
use crate::tree::Tree;
use std::sync::Arc;

/// Marks every pointer reachable from `trees` as live, then sweeps the
/// store. Returns the number of files removed.
///
/// Callers using [`crate::store::file::FileStore`] or
/// [`crate::store::memory::MemoryStore`] must call that store's own
/// `begin_mark_pass` immediately before this, so the marks this pass sets
/// are newer than anything a prior pass left behind. That call is
/// backend-specific (a wall-clock timestamp for the
/// file store, a monotonic counter for the in-memory one) and therefore
/// lives on the concrete store type rather than on the [`Store`] trait.
pub async fn garbage_collect<'a, I>(store: &Arc<dyn Store>, trees: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a Tree>,
{
    let live = mark(trees).await?;
    for ptr in &live {
        store.touch(ptr).await?;
    }
    store.sweep().await
}

/// Runs the mark phase alone, returning every pointer reachable from
/// `trees` without touching the store. Exposed separately so callers who
/// want to inspect or dedupe the live set themselves (e.g. before a sweep
/// that spans several stores) aren't forced through [`garbage_collect`].
pub async fn mark<'a, I>(trees: I) -> Result<Vec<Pointer>>
where
    I: IntoIterator<Item = &'a Tree>,
{
    let mut live = Vec::new();
    for tree in trees {
        tree.for_each_ptr(|ptr, _depth| {
            live.push(ptr.clone());
            false
        })
        .await?;
    }
    Ok(live)
}
