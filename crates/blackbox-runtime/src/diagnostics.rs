#![forbid(unsafe_code)]

//! Non-fatal diagnostics.
//!
//! Shape-contract violations (a derivation that should produce a mapping
//! produced something else) never abort a pass. They are reported here:
//! emitted as a `tracing` warning from this module and appended to a
//! bounded [`DiagnosticLog`] that hosts and tests can inspect.
//!
//! # Invariants
//!
//! 1. The log never holds more than its capacity; the oldest entry is
//!    evicted first.
//! 2. Every reported diagnostic is logged through `tracing`, even when the
//!    log evicts it immediately.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use blackbox_core::ValueKind;

use crate::id::ConsumerId;

/// Which derivation of a consumer a report is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DerivationKind {
    /// The primary state derivation.
    State,
    /// A named secondary derivation added after mount.
    Secondary(String),
    /// The dispatch-capability derivation.
    Dispatch,
    /// The merge function.
    Merge,
}

impl fmt::Display for DerivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => f.write_str("state derivation"),
            Self::Secondary(name) => write!(f, "secondary derivation `{name}`"),
            Self::Dispatch => f.write_str("dispatch derivation"),
            Self::Merge => f.write_str("merge function"),
        }
    }
}

/// A single non-fatal report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A derivation returned something other than a mapping. The value was
    /// still installed.
    ShapeViolation {
        consumer: ConsumerId,
        name: String,
        derivation: DerivationKind,
        found: ValueKind,
    },
    /// A derivation depends on own properties but has no props selector,
    /// so any own-property change recomputes it.
    MissingPropsSelector {
        consumer: ConsumerId,
        name: String,
        derivation: DerivationKind,
    },
}

impl Diagnostic {
    /// The consumer the report is about.
    #[must_use]
    pub fn consumer(&self) -> ConsumerId {
        match self {
            Self::ShapeViolation { consumer, .. } | Self::MissingPropsSelector { consumer, .. } => {
                *consumer
            }
        }
    }

    /// The derivation the report is about.
    #[must_use]
    pub fn derivation(&self) -> &DerivationKind {
        match self {
            Self::ShapeViolation { derivation, .. }
            | Self::MissingPropsSelector { derivation, .. } => derivation,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeViolation {
                consumer,
                name,
                derivation,
                found,
            } => write!(
                f,
                "{derivation} of {name} ({consumer}) must return a mapping, got {found}"
            ),
            Self::MissingPropsSelector {
                consumer,
                name,
                derivation,
            } => write!(
                f,
                "{derivation} of {name} ({consumer}) reads own properties but no props \
                 selector narrows them; every own-property change recomputes it"
            ),
        }
    }
}

/// Bounded, shared diagnostic sink.
///
/// Clones share the same buffer.
#[derive(Clone)]
pub struct DiagnosticLog {
    entries: Rc<RefCell<VecDeque<Diagnostic>>>,
    capacity: usize,
}

impl DiagnosticLog {
    /// Create a log holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Rc::new(RefCell::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity,
        }
    }

    /// Record a diagnostic.
    pub fn report(&self, diagnostic: Diagnostic) {
        tracing::warn!(consumer = diagnostic.consumer().get(), "{diagnostic}");
        let mut entries = self.entries.borrow_mut();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(diagnostic);
    }

    /// Copy of the retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.borrow().iter().cloned().collect()
    }

    /// Remove and return the retained entries, oldest first.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.entries.borrow_mut().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticLog")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
