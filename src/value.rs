// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! The key/value domain and its default total ordering.
//!
//! Keys and values share one dynamically-typed domain (JSON-shaped, so a
//! tree can be populated straight from a config file or an API payload).
//! Ordering across types follows a fixed rung ladder:
//! `boolean < number < string < array < object < null`.

use once_cell::sync::Lazy;
use serde_json::{Map, Number};
use std::cmp::Ordering;
use std::sync::Arc;

/// A key or a value. Reuses `serde_json::Value`'s representation so callers
/// can build trees directly out of parsed JSON without a conversion step.
pub type Value = serde_json::Value;

/// A pluggable total ordering over [`Value`]s.
///
/// Implementations must be a strict total order consistent across the
/// lifetime of any tree that uses them; changing the comparator on an
/// existing tree silently invalidates its sortedness invariant.
pub trait Comparator: Send + Sync {
    /// Compares two values, returning the same sign convention as `Ord::cmp`.
    fn compare(&self, a: &Value, b: &Value) -> Ordering;

    /// Whether two values should be considered equal for the purposes of the
    /// "skip write if unchanged" optimization in `set`. Defaults to
    /// `compare(a, b) == Ordering::Equal`.
    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// The default comparator: `boolean < number < string < array < object < null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultComparator;

impl Comparator for DefaultComparator {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        default_compare(a, b)
    }
}

/// Free-function form of [`DefaultComparator::compare`], used directly by
/// tests and by callers who only need a one-off comparison.
pub fn default_compare(a: &Value, b: &Value) -> Ordering {
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_arrays(x, y),
        (Value::Object(x), Value::Object(y)) => compare_objects(x, y),
        (Value::Null, Value::Null) => Ordering::Equal,
        // Same rank implies same variant except for the cases above.
        _ => Ordering::Equal,
    })
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    let a = a.as_f64().unwrap_or(f64::NAN);
    let b = b.as_f64().unwrap_or(f64::NAN);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn compare_arrays(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match default_compare(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Objects compare by key-set size first (shorter first), then by the
/// lexicographically-sorted key sets themselves, then key-wise by value.
fn compare_objects(a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => {}
        other => return other,
    }

    let mut a_keys: Vec<&String> = a.keys().collect();
    let mut b_keys: Vec<&String> = b.keys().collect();
    a_keys.sort();
    b_keys.sort();

    match a_keys.cmp(&b_keys) {
        Ordering::Equal => {}
        other => return other,
    }

    for key in a_keys {
        // Keys are known equal at this point; unwrap is safe.
        let av = a.get(key.as_str()).expect("key set intersection");
        let bv = b.get(key.as_str()).expect("key set intersection");
        match default_compare(av, bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Wraps a [`Comparator`] in an `Arc` so it can be shared cheaply across
/// trees and transactions.
pub type SharedComparator = Arc<dyn Comparator>;

/// The shared instance every `Tree::empty`/`Tree::open` without an explicit
/// comparator clones its `Arc` from - `DefaultComparator` carries no state,
/// so there is no reason to allocate a fresh one per tree.
static DEFAULT_COMPARATOR: Lazy<SharedComparator> = Lazy::new(|| Arc::new(DefaultComparator));

pub fn default_comparator() -> SharedComparator {
    DEFAULT_COMPARATOR.clone()
}
