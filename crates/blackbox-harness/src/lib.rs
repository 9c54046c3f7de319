#![forbid(unsafe_code)]

//! Test collaborators for the blackbox runtime.
//!
//! - [`Store`]: a reducer store implementing `StateSource`.
//! - [`SelectorProbe`] and [`CallLog`]: invocation counting and ordering.
//! - [`TestTree`]: a simulated host that mounts nodes and propagates
//!   snapshots, recording a [`RenderLog`].
//!
//! Call [`init_tracing`] at the top of a test to see the runtime's
//! `tracing` output (filtered by `RUST_LOG`).

pub mod probe;
pub mod store;
pub mod tree;

pub use probe::{CallLog, SelectorProbe};
pub use store::{Store, counter_reducer};
pub use tree::{NodeId, RenderEvent, RenderLog, TestTree, TreeError};

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per process. Later calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
