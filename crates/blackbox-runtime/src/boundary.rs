#![forbid(unsafe_code)]

//! Pruning boundaries.
//!
//! A [`Boundary`] sits between the root and a subtree. It tracks the ids of
//! every consumer mounted beneath it (through a [`BoundaryScope`] handed to
//! its children) and, for each incoming snapshot, decides whether anything
//! below it could have changed. If not, propagation stops at the boundary.
//!
//! Scopes nest: registering an id with a scope registers it with every
//! enclosing scope too, so an outer boundary sees the ids of consumers
//! mounted under inner boundaries.
//!
//! # Invariants
//!
//! 1. A scope's id set is exactly the ids registered beneath it and not yet
//!    unregistered, in registration order.
//! 2. A pure boundary whose tracked ids are all facsimile, and whose own
//!    properties are shallow-equal to last time, does no work below itself.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexSet;

use blackbox_core::{Mapping, shallow_equal};

use crate::config::BoundaryOptions;
use crate::id::ConsumerId;
use crate::provider::Capabilities;
use crate::snapshot::Snapshot;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

struct ScopeInner {
    ids: RefCell<IndexSet<ConsumerId, RandomState>>,
    parent: Option<BoundaryScope>,
}

/// The living id set of one boundary, linked to its enclosing boundary.
#[derive(Clone)]
pub struct BoundaryScope {
    inner: Rc<ScopeInner>,
}

impl BoundaryScope {
    /// A scope with no enclosing boundary.
    #[must_use]
    pub fn root() -> Self {
        Self::with_parent(None)
    }

    /// A scope nested inside `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    fn with_parent(parent: Option<BoundaryScope>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                ids: RefCell::new(IndexSet::default()),
                parent,
            }),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<&BoundaryScope> {
        self.inner.parent.as_ref()
    }

    /// Track `ids` here and in every enclosing scope.
    pub fn register(&self, ids: &[ConsumerId]) {
        {
            let mut tracked = self.inner.ids.borrow_mut();
            for id in ids {
                tracked.insert(*id);
            }
        }
        tracing::debug!(ids = ?ids, tracked = self.len(), "boundary ids registered");
        if let Some(parent) = &self.inner.parent {
            parent.register(ids);
        }
    }

    /// Stop tracking `ids` here and in every enclosing scope.
    pub fn unregister(&self, ids: &[ConsumerId]) {
        {
            let mut tracked = self.inner.ids.borrow_mut();
            for id in ids {
                tracked.shift_remove(id);
            }
        }
        tracing::debug!(ids = ?ids, tracked = self.len(), "boundary ids unregistered");
        if let Some(parent) = &self.inner.parent {
            parent.unregister(ids);
        }
    }

    /// Tracked ids in registration order.
    #[must_use]
    pub fn tracked_ids(&self) -> Vec<ConsumerId> {
        self.inner.ids.borrow().iter().copied().collect()
    }

    #[must_use]
    pub fn contains(&self, id: ConsumerId) -> bool {
        self.inner.ids.borrow().contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.ids.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.ids.borrow().is_empty()
    }

    /// Whether both handles refer to the same scope.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for BoundaryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundaryScope")
            .field("ids", &self.tracked_ids())
            .field("nested", &self.inner.parent.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

/// Outcome of offering a snapshot to a boundary.
#[derive(Debug, Clone)]
pub enum Propagation {
    /// Nothing beneath the boundary changed; stop here.
    Skip,
    /// Push this filtered snapshot to the children.
    Propagate(Rc<Snapshot>),
}

impl Propagation {
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// A pruning node in the consumer tree.
pub struct Boundary {
    scope: BoundaryScope,
    children: Capabilities,
    options: BoundaryOptions,
    own_props: Option<Mapping>,
    filtered: Option<Rc<Snapshot>>,
}

impl Boundary {
    /// Mount a boundary under `caps`. Its scope nests inside the enclosing
    /// boundary's scope when there is one.
    #[must_use]
    pub fn mount(caps: &Capabilities, own_props: &Mapping, options: BoundaryOptions) -> Self {
        let scope = match caps.boundary() {
            Some(parent) => parent.child(),
            None => BoundaryScope::root(),
        };
        let children = caps.within(scope.clone());
        tracing::debug!(pure = options.pure, "boundary mounted");
        Self {
            scope,
            children,
            options,
            own_props: Some(own_props.clone()),
            filtered: None,
        }
    }

    /// Bundle to mount this boundary's children with.
    #[must_use]
    pub fn capabilities_for_children(&self) -> &Capabilities {
        &self.children
    }

    #[must_use]
    pub fn scope(&self) -> &BoundaryScope {
        &self.scope
    }

    #[must_use]
    pub fn tracked_ids(&self) -> Vec<ConsumerId> {
        self.scope.tracked_ids()
    }

    /// Whether `next` (with the boundary's new own properties) requires
    /// propagating below this boundary.
    ///
    /// True when the boundary is impure, when its own properties changed,
    /// or when any tracked id is not a facsimile in `next`. A tracked id
    /// missing from `next` counts as changed.
    #[must_use]
    pub fn should_propagate(&self, next: &Snapshot, own_props: &Mapping) -> bool {
        if !self.options.pure {
            return true;
        }
        let props_changed = self
            .own_props
            .as_ref()
            .is_none_or(|previous| !shallow_equal(previous, own_props));
        if props_changed {
            return true;
        }
        self.scope
            .inner
            .ids
            .borrow()
            .iter()
            .any(|id| next.is_facsimile(*id) != Some(true))
    }

    /// Offer a snapshot. On propagation the tracked entries are filtered out
    /// of `next` and remembered.
    pub fn update(&mut self, next: &Rc<Snapshot>, own_props: &Mapping) -> Propagation {
        if !self.should_propagate(next, own_props) {
            tracing::debug!(pass = next.pass(), "boundary pruned");
            return Propagation::Skip;
        }
        let filtered = Rc::new(next.filter(self.scope.inner.ids.borrow().iter()));
        tracing::debug!(pass = next.pass(), entries = filtered.len(), "boundary propagated");
        self.own_props = Some(own_props.clone());
        self.filtered = Some(Rc::clone(&filtered));
        Propagation::Propagate(filtered)
    }

    /// The last filtered snapshot pushed to the children.
    #[must_use]
    pub fn filtered(&self) -> Option<Rc<Snapshot>> {
        self.filtered.clone()
    }

    /// Hand whatever ids are still tracked back to the enclosing scopes and
    /// drop the cached references. Idempotent.
    pub fn unmount(&mut self) {
        let remaining = self.scope.tracked_ids();
        if !remaining.is_empty() {
            self.scope.unregister(&remaining);
        }
        if self.own_props.take().is_some() {
            tracing::debug!("boundary unmounted");
        }
        self.filtered = None;
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl fmt::Debug for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boundary")
            .field("scope", &self.scope)
            .field("pure", &self.options.pure)
            .field("mounted", &self.own_props.is_some())
            .finish()
    }
}
