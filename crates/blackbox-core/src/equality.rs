#![forbid(unsafe_code)]

//! Shallow structural equality.
//!
//! [`shallow_equal`] is the only cheapness guard the derivation cache uses:
//! two mappings are equal when they have the same key set and every value
//! is [`Value::same`] as its counterpart. Nested containers are compared by
//! reference and never recursed into.
//!
//! # Failure Modes
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Nested mapping mutated in place | Not detected (same reference) |
//! | Structurally equal nested mapping, new instance | Reported as different |
//! | `NaN` values at the same key in distinct mappings | Reported as different |

use crate::value::{Mapping, Value};

/// Shallow equality over two mappings.
///
/// Returns `true` iff both mappings have identical key sets and every value
/// compares equal under [`Value::same`]. Key order is irrelevant.
#[must_use]
pub fn shallow_equal(a: &Mapping, b: &Mapping) -> bool {
    if a.ptr_eq(b) {
        return true;
    }
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| value.same(other)))
}

/// [`shallow_equal`] lifted to values: two mappings compare shallowly,
/// anything else falls back to [`Value::same`].
#[must_use]
pub fn shallow_equal_values(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Map(a), Value::Map(b)) => shallow_equal(a, b),
        _ => a.same(b),
    }
}

/// A new mapping holding only the listed keys that exist in `source`, in
/// the order the keys are listed.
pub fn pick<'k>(source: &Mapping, keys: impl IntoIterator<Item = &'k str>) -> Mapping {
    keys.into_iter()
        .filter_map(|key| source.get(key).map(|value| (key, value.clone())))
        .collect()
}
