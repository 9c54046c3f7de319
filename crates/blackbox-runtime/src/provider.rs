#![forbid(unsafe_code)]

//! Tree root: the provider and the capability bundle it hands down.
//!
//! A [`Provider`] owns the registry, the id allocator, the diagnostic log
//! and the subscription to the state source. Descendants never look these
//! up implicitly; they receive a [`Capabilities`] bundle, and a pruning
//! boundary hands its children a bundle scoped to itself.
//!
//! # Example
//!
//! ```ignore
//! let provider = Provider::new(store.shared());
//! let caps = provider.capabilities();
//! let mut list = Connect::new().map_state(select_todos).mount(&caps, &props)?;
//! provider.mount(move |published| { /* propagate down the tree */ });
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use blackbox_core::Mapping;

use crate::boundary::BoundaryScope;
use crate::config::ProviderConfig;
use crate::diagnostics::DiagnosticLog;
use crate::error::PassError;
use crate::id::IdAllocator;
use crate::registry::{Registry, RegistryHandle};
use crate::snapshot::Snapshot;
use crate::source::{SharedSource, Subscription};

/// Explicit capability bundle passed from the root to every node.
#[derive(Clone)]
pub struct Capabilities {
    source: Option<SharedSource>,
    registry: RegistryHandle,
    ids: IdAllocator,
    diagnostics: DiagnosticLog,
    config: Rc<ProviderConfig>,
    boundary: Option<BoundaryScope>,
}

impl Capabilities {
    /// A bundle without a state source. Consumers mounted with it must be
    /// given a source directly.
    #[must_use]
    pub fn new(config: &ProviderConfig) -> Self {
        let config = config.sanitized();
        let diagnostics = DiagnosticLog::new(config.diagnostic_capacity);
        let registry = RegistryHandle::new(Registry::new(&config, diagnostics.clone()));
        Self {
            source: None,
            registry,
            ids: IdAllocator::new(),
            diagnostics,
            config: Rc::new(config),
            boundary: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: SharedSource) -> Self {
        self.source = Some(source);
        self
    }

    /// The same bundle, with `scope` as the nearest enclosing boundary.
    #[must_use]
    pub fn within(&self, scope: BoundaryScope) -> Self {
        Self {
            boundary: Some(scope),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<&SharedSource> {
        self.source.as_ref()
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Nearest enclosing boundary scope, if any.
    #[must_use]
    pub fn boundary(&self) -> Option<&BoundaryScope> {
        self.boundary.as_ref()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("has_source", &self.source.is_some())
            .field("registry", &self.registry)
            .field("next_id", &self.ids.peek())
            .field("in_boundary", &self.boundary.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

struct ProviderInner {
    caps: Capabilities,
    source: SharedSource,
    last_state: RefCell<Option<Mapping>>,
    subscription: RefCell<Option<Subscription>>,
}

impl ProviderInner {
    fn refresh(&self) -> Result<Option<Rc<Snapshot>>, PassError> {
        let state = self.source.state();
        let unchanged = self
            .last_state
            .borrow()
            .as_ref()
            .is_some_and(|last| last.ptr_eq(&state));
        if self.caps.config.pure && unchanged {
            tracing::trace!("state unchanged, pass skipped");
            return Ok(None);
        }
        let snapshot = self.caps.registry.recompute_all(&state)?;
        *self.last_state.borrow_mut() = Some(state);
        Ok(Some(snapshot))
    }
}

/// Root of a consumer tree.
///
/// Clones share the same root.
#[derive(Clone)]
pub struct Provider {
    inner: Rc<ProviderInner>,
}

impl Provider {
    #[must_use]
    pub fn new(source: SharedSource) -> Self {
        Self::with_config(source, ProviderConfig::default())
    }

    #[must_use]
    pub fn with_config(source: SharedSource, config: ProviderConfig) -> Self {
        let caps = Capabilities::new(&config).with_source(Rc::clone(&source));
        Self {
            inner: Rc::new(ProviderInner {
                caps,
                source,
                last_state: RefCell::new(None),
                subscription: RefCell::new(None),
            }),
        }
    }

    /// Bundle for the root's children.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.inner.caps.registry
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.inner.caps.diagnostics
    }

    /// The last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Rc<Snapshot> {
        self.inner.caps.registry.snapshot()
    }

    /// Re-pull the state and run one pass.
    ///
    /// Returns `Ok(None)` when the provider is pure and the state is the
    /// instance pulled last time. A failed pass does not record the state,
    /// so the next refresh retries it.
    pub fn refresh(&self) -> Result<Option<Rc<Snapshot>>, PassError> {
        self.inner.refresh()
    }

    /// Run one pass regardless of state identity.
    pub fn force_pass(&self) -> Result<Rc<Snapshot>, PassError> {
        let state = self.inner.source.state();
        let snapshot = self.inner.caps.registry.recompute_all(&state)?;
        *self.inner.last_state.borrow_mut() = Some(state);
        Ok(snapshot)
    }

    /// Subscribe to the state source. Every change notification refreshes
    /// and forwards the outcome to `on_snapshot`; skipped passes are not
    /// forwarded. Mounting twice replaces the previous subscription.
    pub fn mount(&self, on_snapshot: impl Fn(Result<Rc<Snapshot>, PassError>) + 'static) {
        let weak: Weak<ProviderInner> = Rc::downgrade(&self.inner);
        let listener: Rc<dyn Fn()> = Rc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match inner.refresh() {
                Ok(Some(snapshot)) => on_snapshot(Ok(snapshot)),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(%err, "pass failed after state change");
                    on_snapshot(Err(err));
                }
            }
        });
        let previous = self.inner.subscription.borrow_mut().take();
        drop(previous);
        let subscription = self.inner.source.subscribe(listener);
        *self.inner.subscription.borrow_mut() = Some(subscription);
        tracing::debug!("provider mounted");
    }

    /// Release the subscription. Idempotent.
    pub fn unmount(&self) {
        let subscription = self.inner.subscription.borrow_mut().take();
        if subscription.is_some() {
            tracing::debug!("provider unmounted");
        }
        drop(subscription);
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.subscription.borrow().is_some()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("caps", &self.inner.caps)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}
