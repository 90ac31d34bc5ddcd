// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Backing store interface, plus the in-memory and content-addressed
//! file-backed implementations.

pub mod file;
pub mod hash;
pub mod memory;

use crate::error::Result;
use crate::node::Node;
use crate::pointer::Pointer;
use crate::value::Value;
use async_trait::async_trait;

/// Read/write/delete-by-pointer backing store, with a small meta-record
/// side channel and mark/sweep hooks for garbage collection.
///
/// Implementations: [`memory::MemoryStore`] (testing) and
/// [`file::FileStore`] (durable, content-addressed).
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the node whose pointer tag equals `ptr`.
    ///
    /// Fails with [`crate::error::Error::NotFound`], `Corrupt` (hash
    /// verification enabled and the digest mismatches), or `Io`.
    async fn read(&self, ptr: &Pointer) -> Result<Node>;

    /// Computes the digest of the serialized node, tags it, and registers
    /// it as a pending write. The returned pointer is stable even though
    /// the physical file write may be deferred. Idempotent: writing the
    /// same content twice yields the same pointer and a single file.
    async fn write(&self, node: Node) -> Result<Pointer>;

    /// Removes a previously written node. If the node is still in the
    /// write buffer, it is simply dropped; if a write for it is in
    /// flight, the delete is chained after that write completes.
    async fn delete(&self, ptr: &Pointer) -> Result<()>;

    /// Ensures every pending write has reached the filesystem and is
    /// fsynced.
    async fn flush(&self) -> Result<()>;

    /// Reads a small JSON document from the meta side channel.
    async fn read_meta(&self, path: &str) -> Result<Option<Value>>;

    /// Atomically persists a small JSON document to the meta side channel
    /// (temp file + fsync + rename).
    async fn write_meta(&self, path: &str, value: Value) -> Result<()>;

    /// Marks a pointer as live for the current mark pass, without
    /// rewriting its content (used by [`crate::gc::garbage_collect`]).
    async fn touch(&self, ptr: &Pointer) -> Result<()>;

    /// Removes every file whose last touch predates the most recent mark
    /// pass. Returns the number of files removed.
    async fn sweep(&self) -> Result<usize>;
}

/// Options controlling [`file::FileStore::copy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Attempt a hard link before falling back to a byte copy.
    pub try_link: bool,
    /// Touch the destination after copying, marking it live.
    pub touch: bool,
}
