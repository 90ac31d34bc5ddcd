// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Error types for pbtree operations.
//!
//! One enum covers every failure kind a tree or store operation can surface,
//! so callers match on a single type regardless of which layer raised it.

use crate::pointer::Pointer;
use crate::value::Value;

/// Standard `Result` type for all pbtree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pbtree operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `insert` attempted on a key that already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(Value),

    /// `update` attempted on a key that does not exist.
    #[error("missing key: {0}")]
    MissingKey(Value),

    /// A pointer does not resolve to a node in the store.
    #[error("not found: {0}")]
    NotFound(Pointer),

    /// Hash verification failed on read.
    #[error("corrupt node at {0}")]
    Corrupt(Pointer),

    /// Attempt to resolve a pointer already discarded in this session.
    #[error("pointer already deleted: {0}")]
    Deleted(Pointer),

    /// Overlapping operation on a single tree handle.
    #[error("operation already in progress on this tree handle")]
    InProgress,

    /// Invalid configuration (e.g. file mode lacking user read/write).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node (de)serialization failure.
    #[error("serialization error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    /// Meta record (de)serialization failure.
    #[error("meta record error: {0}")]
    Meta(#[from] serde_json::Error),

    /// A spawned blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
