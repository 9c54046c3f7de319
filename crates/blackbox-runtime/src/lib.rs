#![forbid(unsafe_code)]

//! Shared incremental derivation cache for consumer trees.
//!
//! Many consumers, mounted in a tree, each derive a private slice of one
//! externally-mutated state. The [`Registry`] recomputes every slice once
//! per state change and marks the unchanged ones; [`Boundary`] nodes use
//! those marks to stop propagation into quiet subtrees, and each
//! [`ConsumerNode`] decides locally whether to re-render.
//!
//! # Flow
//!
//! ```text
//! state source ──notify──▶ Provider::refresh ──▶ Registry::recompute_all
//!                                                      │ Rc<Snapshot>
//!                                                      ▼
//!                            Boundary::update ──▶ ConsumerNode::update
//! ```
//!
//! Everything is single-threaded and synchronous: a pass never yields, and
//! propagation is strictly root to leaf.
//!
//! # Modules
//!
//! - [`source`]: the state-source boundary and subscription guards.
//! - [`selector`]: selectors, factories, props selectors, merge functions.
//! - [`registry`]: the derivation registry and its shared handle.
//! - [`snapshot`]: per-pass published output.
//! - [`provider`]: tree root and the capability bundle.
//! - [`connect`]: consumer nodes.
//! - [`boundary`]: pruning boundaries.
//! - [`config`], [`error`], [`diagnostics`], [`id`]: ambient pieces.

pub mod boundary;
pub mod config;
pub mod connect;
pub mod diagnostics;
pub mod error;
pub mod id;
pub mod provider;
pub mod registry;
pub mod selector;
pub mod snapshot;
pub mod source;

#[cfg(test)]
mod test_support;

pub use boundary::{Boundary, BoundaryScope, Propagation};
pub use config::{BoundaryOptions, ConnectOptions, ProviderConfig};
pub use connect::{Connect, ConsumerNode, FilteredConsumer, RenderDecision};
pub use diagnostics::{DerivationKind, Diagnostic, DiagnosticLog};
pub use error::{ConnectError, PassError, SelectorError};
pub use id::{ConsumerId, IdAllocator};
pub use provider::{Capabilities, Provider};
pub use registry::{Registry, RegistryHandle};
pub use selector::{
    DependsOn, Derive, DispatchSelector, MergeFn, PropsSelector, Selector, SelectorResult,
    StateSelector, default_merge,
};
pub use snapshot::{Snapshot, SnapshotEntry};
pub use source::{SharedSource, StateSource, Subscription};

pub use blackbox_core::{Callback, Mapping, Value, ValueKind, mapping, shallow_equal};
