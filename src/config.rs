// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tree and store configuration records.
//!
//! Both configs are serde round-trippable so a host application can load
//! them from TOML/JSON the way a larger system loads its own config file;
//! loading them from a particular format is outside this crate's scope.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Minimum file mode permitting the owning user to read and write.
const MIN_USER_RW: u32 = 0o600;

/// Default minimum fill per node (half the maximum).
pub const DEFAULT_ORDER: usize = 1024;

/// Per-tree configuration. Part of a tree's persistent metadata - changing
/// `order` on an existing tree does not retroactively rebalance it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Minimum keys (leaves) or children (internals) per non-root node;
    /// the maximum is `2 * order`.
    pub order: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER,
        }
    }
}

impl TreeConfig {
    pub fn new(order: usize) -> Result<Self> {
        if order < 1 {
            return Err(Error::Config(format!(
                "order must be >= 1, got {order}"
            )));
        }
        Ok(Self { order })
    }

    pub fn max_keys(&self) -> usize {
        2 * self.order
    }

    pub fn min_keys(&self) -> usize {
        self.order
    }
}

/// Store-level configuration (applies to a [`crate::store::file::FileStore`]
/// instance, not to any one tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum resident nodes before LRU eviction.
    pub cache_size: usize,
    /// Whether node bytes are deflate-compressed on disk (`.gz` suffix).
    pub compress: bool,
    /// POSIX mode applied to published node files. Must grant the owner
    /// read+write (`0o600`); refused otherwise at construction time.
    pub file_mode: u32,
    /// POSIX mode applied to the meta file.
    pub meta_file_mode: u32,
    /// Cap on simultaneous in-flight filesystem tasks.
    pub max_concurrent_io: usize,
    /// Recompute the digest on read and fail `Corrupt` on mismatch.
    pub verify_hash: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            compress: false,
            file_mode: 0o444,
            meta_file_mode: 0o644,
            max_concurrent_io: 32,
            verify_hash: true,
        }
    }
}

impl StoreConfig {
    /// Validates that `file_mode` grants the owning user read+write, per
    /// the store's refusal of configurations lacking `0o600`.
    pub fn validate(&self) -> Result<()> {
        if self.file_mode & MIN_USER_RW != MIN_USER_RW && self.file_mode != 0o444 {
            // 0o444 is the documented safe default for immutable node files
            // (read-only to all, including the owner) and is exempted: the
            // store itself holds the only writable handle during publish.
            return Err(Error::Config(format!(
                "file_mode {:o} must grant at least user read+write, or be the default 0o444",
                self.file_mode
            )));
        }
        if self.meta_file_mode & MIN_USER_RW != MIN_USER_RW {
            return Err(Error::Config(format!(
                "meta_file_mode {:o} must grant user read+write",
                self.meta_file_mode
            )));
        }
        if self.max_concurrent_io == 0 {
            return Err(Error::Config(
                "max_concurrent_io must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
