// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable node hashing.
//!
//! The default digest is an unkeyed, fast, *not* collision-resistant hash -
//! adequate for content addressing honest data, inadequate against an
//! adversary who can choose node bytes. Deployments concerned with
//! adversarial inputs substitute a keyed MAC by implementing
//! [`NodeHasher`] themselves (e.g. a keyed blake3) and passing it to
//! [`crate::store::file::FileStore::with_hasher`].

/// Computes the digest used to address a node's serialized bytes.
///
/// Implementations must be deterministic: the same bytes always produce
/// the same digest, for the lifetime of any store built on them.
pub trait NodeHasher: Send + Sync {
    /// Returns the raw digest bytes for `data`.
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Formats a digest as a lowercase hex string with no separators; the
    /// store then shards it into the `XX/rest` pointer form.
    fn digest_hex(&self, data: &[u8]) -> String {
        let bytes = self.digest(data);
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// The default hasher: two independently-seeded CRC-32 passes concatenated
/// into a 64-bit digest. Fast, unkeyed, and explicitly not meant to resist
/// an adversary choosing node content.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHasher;

impl NodeHasher for DefaultHasher {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut low = crc32fast::Hasher::new();
        low.update(data);
        let low = low.finalize();

        // Re-hash the first pass's digest alongside the data under a
        // different seed so the two halves aren't trivially correlated.
        let mut high = crc32fast::Hasher::new_with_initial(0x9E37_79B9);
        high.update(&low.to_le_bytes());
        high.update(data);
        let high = high.finalize();

        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&high.to_be_bytes());
        out.extend_from_slice(&low.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_bytes() {
        let h = DefaultHasher;
        assert_eq!(h.digest_hex(b"hello"), h.digest_hex(b"hello"));
    }

    #[test]
    fn differs_for_different_bytes() {
        let h = DefaultHasher;
        assert_ne!(h.digest_hex(b"hello"), h.digest_hex(b"world"));
    }

    #[test]
    fn hex_digest_is_sixteen_chars() {
        let h = DefaultHasher;
        assert_eq!(h.digest_hex(b"anything").len(), 16);
    }
}
