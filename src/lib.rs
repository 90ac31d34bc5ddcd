// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! pbtree - an asynchronous, immutable, fully-persistent B+tree.
//!
//! Every mutating operation on a [`tree::Tree`] yields a logically new tree:
//! the previous root pointer stays valid and readable for as long as a caller
//! keeps it around. Nodes are copy-on-write and content-addressed by a
//! pluggable [`store::Store`] implementation - an in-memory store for tests,
//! and a durable [`store::file::FileStore`] that shards node files on disk.
//!
//! ## Modules
//!
//! - [`error`]: the crate-wide error type and result alias.
//! - [`value`]: the key/value domain and default comparator.
//! - [`pointer`]: opaque node handles.
//! - [`node`]: internal/leaf node bodies and their wire format.
//! - [`config`]: tree and store configuration records.
//! - [`store`]: the backing store trait plus the memory and file-backed implementations.
//! - [`txn`]: the nestable transaction overlay tracking undos and applies.
//! - [`tree`]: the B+tree engine itself (search, set, delete, range
//!   (callback and [`futures_core::Stream`] forms), bulk, mark).
//! - [`index`]: the named tree index persisted in the store's meta record.
//! - [`gc`]: mark-and-sweep garbage collection over a tree index.

pub mod config;
pub mod error;
pub mod gc;
pub mod index;
pub mod node;
pub mod pointer;
pub mod store;
pub mod tree;
pub mod txn;
pub mod value;

pub use config::{StoreConfig, TreeConfig};
pub use error::{Error, Result};
pub use node::Node;
pub use pointer::Pointer;
pub use store::Store;
pub use tree::{SetMode, Tree};
pub use value::Value;
