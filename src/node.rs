// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Internal and leaf node bodies, and their on-disk wire format.
//!
//! A node is immutable once it carries a pointer (i.e. once it has been
//! written through a store). The tree engine only ever mutates freshly
//! cloned, unpublished nodes.

use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// The wire representation of a node, as it is serialized to and from the
/// store. Does not carry its own pointer - that is a property of where the
/// bytes live, not of the bytes themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeBody {
    Leaf {
        keys: Vec<Value>,
        values: Vec<Value>,
    },
    Internal {
        keys: Vec<Value>,
        /// Child pointers in their on-disk textual form.
        children: Vec<String>,
    },
}

impl NodeBody {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::Codec)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::Codec)
    }
}

/// A node held in memory: its body plus the pointer it was read from or
/// written to, if any. A node under construction (not yet published) has
/// `ptr = None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    pub keys: Vec<Value>,
    pub values: Vec<Value>,
    pub ptr: Option<Pointer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    pub keys: Vec<Value>,
    pub children: Vec<Pointer>,
    pub ptr: Option<Pointer>,
}

impl Node {
    pub fn new_leaf(keys: Vec<Value>, values: Vec<Value>) -> Self {
        Node::Leaf(LeafNode {
            keys,
            values,
            ptr: None,
        })
    }

    pub fn new_internal(keys: Vec<Value>, children: Vec<Pointer>) -> Self {
        Node::Internal(InternalNode {
            keys,
            children,
            ptr: None,
        })
    }

    pub fn ptr(&self) -> Option<&Pointer> {
        match self {
            Node::Leaf(l) => l.ptr.as_ref(),
            Node::Internal(i) => i.ptr.as_ref(),
        }
    }

    pub fn set_ptr(&mut self, ptr: Pointer) {
        match self {
            Node::Leaf(l) => l.ptr = Some(ptr),
            Node::Internal(i) => i.ptr = Some(ptr),
        }
    }

    /// Clears the pointer, e.g. after cloning a node for copy-on-write
    /// mutation - the clone is not the same node until it is republished.
    pub fn unpublish(&mut self) {
        match self {
            Node::Leaf(l) => l.ptr = None,
            Node::Internal(i) => i.ptr = None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Number of keys (leaf) or keys (internal - one less than children).
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(l) => l.keys.len(),
            Node::Internal(i) => i.keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fill metric the tree invariants are stated in terms of: key
    /// count for a leaf, child count for an internal node. Both read
    /// `order <= fill <= 2 * order` for a balanced non-root node.
    pub fn fill(&self) -> usize {
        match self {
            Node::Leaf(l) => l.keys.len(),
            Node::Internal(i) => i.children.len(),
        }
    }

    pub fn keys(&self) -> &[Value] {
        match self {
            Node::Leaf(l) => &l.keys,
            Node::Internal(i) => &i.keys,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(l) => Some(l),
            Node::Internal(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            Node::Leaf(l) => Some(l),
            Node::Internal(_) => None,
        }
    }

    pub fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Node::Internal(i) => Some(i),
            Node::Leaf(_) => None,
        }
    }

    pub fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            Node::Internal(i) => Some(i),
            Node::Leaf(_) => None,
        }
    }

    pub fn body(&self) -> NodeBody {
        match self {
            Node::Leaf(l) => NodeBody::Leaf {
                keys: l.keys.clone(),
                values: l.values.clone(),
            },
            Node::Internal(i) => NodeBody::Internal {
                keys: i.keys.clone(),
                children: i.children.iter().map(|p| p.as_str().to_string()).collect(),
            },
        }
    }

    pub fn from_body(body: NodeBody) -> Self {
        match body {
            NodeBody::Leaf { keys, values } => Node::Leaf(LeafNode {
                keys,
                values,
                ptr: None,
            }),
            NodeBody::Internal { keys, children } => Node::Internal(InternalNode {
                keys,
                children: children.into_iter().map(Pointer::from).collect(),
                ptr: None,
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.body().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_body(NodeBody::decode(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_leaf_through_bytes() {
        let node = Node::new_leaf(vec![json!(1), json!(2)], vec![json!("a"), json!("b")]);
        let bytes = node.encode().unwrap();
        let decoded = Node::decode(&bytes).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn round_trips_internal_through_bytes() {
        let node = Node::new_internal(
            vec![json!(10)],
            vec![Pointer::from("aa/1"), Pointer::from("bb/2")],
        );
        let bytes = node.encode().unwrap();
        let decoded = Node::decode(&bytes).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn unpublish_clears_pointer_but_not_content() {
        let mut node = Node::new_leaf(vec![json!(1)], vec![json!(1)]);
        node.set_ptr(Pointer::from("ff/abc"));
        assert!(node.ptr().is_some());
        node.unpublish();
        assert!(node.ptr().is_none());
        assert_eq!(node.len(), 1);
    }
}
