#![forbid(unsafe_code)]

//! Core value model for blackbox.
//!
//! blackbox is a shared incremental derivation cache: many consumers derive
//! their own slice of one externally-mutated state, and the cache tells each
//! of them, per state change, whether their slice is unchanged. This crate
//! holds the pieces every other crate builds on:
//!
//! - [`Value`] / [`Mapping`] / [`Callback`]: shared values with identity
//!   semantics (see [`value`]).
//! - [`shallow_equal`]: the single equality guard (see [`equality`]).
//! - [`pick`]: narrow a mapping to a key set.
//! - [`mapping!`]: terse mapping construction.

pub mod equality;
pub mod value;

pub use equality::{pick, shallow_equal, shallow_equal_values};
pub use value::{Callback, Key, Mapping, Value, ValueKind};
