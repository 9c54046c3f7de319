#![forbid(unsafe_code)]

//! Consumer nodes.
//!
//! [`Connect`] describes how a consumer derives its props: a state
//! derivation, a dispatch derivation, optional props selectors narrowing own
//! properties for each, and a merge function. Mounting it under a
//! [`Capabilities`] bundle yields a [`ConsumerNode`] that owns one registry
//! slot for as long as it stays mounted.
//!
//! # Lifecycle
//!
//! `Unmounted -> Mounted -> Unmounted`. Mounting allocates an id, computes
//! the initial props directly (no pass has seen the consumer yet) and
//! registers the state derivation. Every [`ConsumerNode::update`] pulls the
//! consumer's entry out of the offered snapshot and returns a
//! [`RenderDecision`]. Unmounting (explicitly or on drop) removes the slot
//! and drops every cached reference.
//!
//! # Invariants
//!
//! 1. The registry always holds the state selector with the narrowed own
//!    properties the node last derived with.
//! 2. A pure node never reports [`RenderDecision::Render`] for props that
//!    are shallow-equal to the props it rendered last.
//! 3. A derivation that does not track own properties is never re-run
//!    because own properties changed.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use blackbox_core::{Callback, Key, Mapping, Value, shallow_equal, shallow_equal_values};

use crate::boundary::{Boundary, BoundaryScope, Propagation};
use crate::config::{BoundaryOptions, ConnectOptions};
use crate::diagnostics::{DerivationKind, Diagnostic, DiagnosticLog};
use crate::error::{ConnectError, SelectorError};
use crate::id::ConsumerId;
use crate::provider::Capabilities;
use crate::registry::RegistryHandle;
use crate::selector::{
    DependsOn, Derive, DispatchSelector, MergeFn, PropsSelector, Selector, StateSelector,
    default_dispatch_selector, default_state_selector,
};
use crate::snapshot::Snapshot;
use crate::source::SharedSource;

/// What the tree should do with a consumer after an update.
#[derive(Debug, Clone)]
pub enum RenderDecision {
    /// Keep the last rendered output.
    Skip,
    /// Re-render with these props.
    Render(Value),
}

impl RenderDecision {
    #[must_use]
    pub fn is_render(&self) -> bool {
        matches!(self, Self::Render(_))
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Consumer description, shared by every node mounted from it.
#[derive(Clone, Default)]
pub struct Connect {
    map_state: Option<Derive<Mapping>>,
    state_props: Option<PropsSelector>,
    map_dispatch: Option<Derive<Callback>>,
    dispatch_props: Option<PropsSelector>,
    merge: Option<MergeFn>,
    options: ConnectOptions,
}

impl Connect {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State derivation: a selector or a per-mount factory.
    #[must_use]
    pub fn map_state(mut self, derive: impl Into<Derive<Mapping>>) -> Self {
        self.map_state = Some(derive.into());
        self
    }

    /// Narrow own properties before the state derivation sees them.
    #[must_use]
    pub fn map_state_props(mut self, selector: PropsSelector) -> Self {
        self.state_props = Some(selector);
        self
    }

    /// Dispatch derivation: a selector or a per-mount factory.
    #[must_use]
    pub fn map_dispatch(mut self, derive: impl Into<Derive<Callback>>) -> Self {
        self.map_dispatch = Some(derive.into());
        self
    }

    /// Narrow own properties before the dispatch derivation sees them.
    #[must_use]
    pub fn map_dispatch_props(mut self, selector: PropsSelector) -> Self {
        self.dispatch_props = Some(selector);
        self
    }

    /// Dispatch derivation binding each action creator to dispatch.
    #[must_use]
    pub fn action_creators(self, creators: Mapping) -> Self {
        self.map_dispatch(Derive::action_creators(creators))
    }

    #[must_use]
    pub fn merge(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    #[must_use]
    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// `Connect(<name>)`.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.options.display_name()
    }

    /// Mount under `caps`, using the bundle's state source.
    pub fn mount(&self, caps: &Capabilities, own_props: &Mapping) -> Result<ConsumerNode, ConnectError> {
        self.mount_inner(caps, None, own_props)
    }

    /// Mount with an explicit state source, which takes precedence over
    /// the bundle's.
    pub fn mount_with_source(
        &self,
        caps: &Capabilities,
        source: SharedSource,
        own_props: &Mapping,
    ) -> Result<ConsumerNode, ConnectError> {
        self.mount_inner(caps, Some(source), own_props)
    }

    /// Mount wrapped in a dedicated pruning boundary.
    pub fn mount_filtered(
        &self,
        caps: &Capabilities,
        own_props: &Mapping,
    ) -> Result<FilteredConsumer, ConnectError> {
        let boundary = Boundary::mount(
            caps,
            own_props,
            BoundaryOptions {
                pure: self.options.pure,
            },
        );
        let node = self.mount(boundary.capabilities_for_children(), own_props)?;
        Ok(FilteredConsumer { node, boundary })
    }

    fn mount_inner(
        &self,
        caps: &Capabilities,
        explicit: Option<SharedSource>,
        own_props: &Mapping,
    ) -> Result<ConsumerNode, ConnectError> {
        let name = self.display_name();
        let source = explicit
            .or_else(|| caps.source().cloned())
            .ok_or_else(|| ConnectError::MissingStateSource { name: name.clone() })?;
        let id = caps.ids().next_id();
        let checks = Checks {
            id,
            name: name.clone(),
            shapes: caps.config().check_shapes,
            props_selectors: caps.config().warn_missing_props_selector,
            diagnostics: caps.diagnostics().clone(),
        };
        let registry = caps.registry().clone();

        let state = source.state();
        let state_selector = match &self.map_state {
            Some(derive) => derive.instantiate(&state, own_props),
            None => default_state_selector(),
        };
        checks.props_selector(&state_selector, self.state_props.as_ref(), DerivationKind::State);
        let state_inputs = narrow(self.state_props.as_ref(), state_selector.depends_on(), own_props);
        let primary = state_selector
            .call(&state, &state_inputs)
            .map_err(|source| checks.failed(DerivationKind::State, source))?;
        checks.shape(DerivationKind::State, &primary);
        registry.set_derivation(id, state_selector.clone(), state_inputs.clone());
        registry.set_name(id, name.as_str());
        let state_props = registry.seed(id, primary.clone()).unwrap_or(primary);
        let state_pass = registry.pass_count();

        let dispatch = source.dispatcher();
        let dispatch_selector = match &self.map_dispatch {
            Some(derive) => derive.instantiate(&dispatch, own_props),
            None => default_dispatch_selector(),
        };
        checks.props_selector(
            &dispatch_selector,
            self.dispatch_props.as_ref(),
            DerivationKind::Dispatch,
        );
        let dispatch_inputs =
            narrow(self.dispatch_props.as_ref(), dispatch_selector.depends_on(), own_props);
        let dispatch_props = match dispatch_selector.call(&dispatch, &dispatch_inputs) {
            Ok(props) => props,
            Err(source) => {
                registry.unset_derivation(id);
                return Err(checks.failed(DerivationKind::Dispatch, source));
            }
        };
        checks.shape(DerivationKind::Dispatch, &dispatch_props);

        let merge = self.merge.clone().unwrap_or_default();
        let merged = merge.call(&state_props, &dispatch_props, own_props);
        checks.shape(DerivationKind::Merge, &merged);

        let scope = caps.boundary().cloned();
        if let Some(scope) = &scope {
            scope.register(&[id]);
        }
        tracing::debug!(consumer = id.get(), name = %name, "consumer mounted");

        Ok(ConsumerNode {
            name,
            options: self.options.clone(),
            merge,
            state_props_selector: self.state_props.clone(),
            dispatch_props_selector: self.dispatch_props.clone(),
            mounted: Some(Mounted {
                id,
                source,
                registry,
                scope,
                checks,
                state_selector,
                dispatch_selector,
                own_props: own_props.clone(),
                state_inputs,
                dispatch_inputs,
                state_props,
                dispatch_props,
                merged,
                state_pass,
                appended_key: caps.config().appended_key.clone(),
                appended_inputs: IndexMap::default(),
                instance: None,
            }),
        })
    }
}

impl fmt::Debug for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("name", &self.options.name)
            .field("map_state", &self.map_state)
            .field("map_dispatch", &self.map_dispatch)
            .field("merge", &self.merge)
            .finish_non_exhaustive()
    }
}

fn narrow(selector: Option<&PropsSelector>, depends_on: DependsOn, own_props: &Mapping) -> Mapping {
    if !depends_on.tracks_own_props() {
        return Mapping::new();
    }
    match selector {
        Some(selector) => selector.apply(own_props),
        None => own_props.clone(),
    }
}

/// Diagnostics context for one consumer.
struct Checks {
    id: ConsumerId,
    name: String,
    shapes: bool,
    props_selectors: bool,
    diagnostics: DiagnosticLog,
}

impl Checks {
    fn shape(&self, derivation: DerivationKind, value: &Value) {
        if self.shapes && !value.is_map() {
            self.diagnostics.report(Diagnostic::ShapeViolation {
                consumer: self.id,
                name: self.name.clone(),
                derivation,
                found: value.kind(),
            });
        }
    }

    fn props_selector<S>(
        &self,
        selector: &Selector<S>,
        props_selector: Option<&PropsSelector>,
        derivation: DerivationKind,
    ) {
        if self.props_selectors
            && props_selector.is_none()
            && selector.depends_on() == DependsOn::OwnProps
        {
            self.diagnostics.report(Diagnostic::MissingPropsSelector {
                consumer: self.id,
                name: self.name.clone(),
                derivation,
            });
        }
    }

    fn failed(&self, derivation: DerivationKind, source: SelectorError) -> ConnectError {
        ConnectError::Derivation {
            name: self.name.clone(),
            derivation,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerNode
// ---------------------------------------------------------------------------

struct Mounted {
    id: ConsumerId,
    source: SharedSource,
    registry: RegistryHandle,
    scope: Option<BoundaryScope>,
    checks: Checks,
    state_selector: StateSelector,
    dispatch_selector: DispatchSelector,
    own_props: Mapping,
    state_inputs: Mapping,
    dispatch_inputs: Mapping,
    state_props: Value,
    dispatch_props: Value,
    merged: Value,
    /// Pass number `state_props` were last taken from or seeded at.
    state_pass: u64,
    appended_key: String,
    appended_inputs: IndexMap<Key, Option<Mapping>, RandomState>,
    instance: Option<Rc<dyn Any>>,
}

/// A mounted consumer.
pub struct ConsumerNode {
    name: String,
    options: ConnectOptions,
    merge: MergeFn,
    state_props_selector: Option<PropsSelector>,
    dispatch_props_selector: Option<PropsSelector>,
    mounted: Option<Mounted>,
}

impl ConsumerNode {
    fn mounted(&self) -> Result<&Mounted, ConnectError> {
        self.mounted.as_ref().ok_or_else(|| ConnectError::Unmounted {
            name: self.name.clone(),
        })
    }

    fn mounted_mut(&mut self) -> Result<&mut Mounted, ConnectError> {
        self.mounted.as_mut().ok_or_else(|| ConnectError::Unmounted {
            name: self.name.clone(),
        })
    }

    /// Display name, `Connect(<name>)`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry id while mounted.
    #[must_use]
    pub fn id(&self) -> Option<ConsumerId> {
        self.mounted.as_ref().map(|m| m.id)
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Props rendered last (initially, the props computed at mount).
    #[must_use]
    pub fn props(&self) -> Option<&Value> {
        self.mounted.as_ref().map(|m| &m.merged)
    }

    /// Derived state props currently held by the node.
    #[must_use]
    pub fn state_props(&self) -> Option<&Value> {
        self.mounted.as_ref().map(|m| &m.state_props)
    }

    /// Offer a snapshot together with the node's current own properties.
    ///
    /// The node skips when it is pure, its entry is unchanged, its own
    /// properties are shallow-equal to last time and no dispatch input
    /// changed, unless its merge function is order-sensitive. Otherwise it
    /// merges, and renders only if the merged props differ shallowly from
    /// the last render (impure nodes always render).
    pub fn update(
        &mut self,
        snapshot: &Snapshot,
        own_props: &Mapping,
    ) -> Result<RenderDecision, ConnectError> {
        let pure = self.options.pure;
        let merge = self.merge.clone();
        let state_props_selector = self.state_props_selector.clone();
        let dispatch_props_selector = self.dispatch_props_selector.clone();
        let m = self.mounted_mut()?;

        let props_changed = !shallow_equal(&m.own_props, own_props);
        if props_changed {
            m.own_props = own_props.clone();
        }

        let state_changed = m.refresh_state(snapshot, state_props_selector.as_ref(), props_changed)?;
        let dispatch_changed = m.refresh_dispatch(dispatch_props_selector.as_ref(), props_changed)?;

        if pure
            && !state_changed
            && !dispatch_changed
            && !props_changed
            && !merge.is_order_sensitive()
        {
            tracing::debug!(consumer = m.id.get(), "consumer skipped");
            return Ok(RenderDecision::Skip);
        }

        let merged = merge.call(&m.state_props, &m.dispatch_props, &m.own_props);
        m.checks.shape(DerivationKind::Merge, &merged);
        if pure && shallow_equal_values(&merged, &m.merged) {
            tracing::debug!(consumer = m.id.get(), "merged props unchanged");
            return Ok(RenderDecision::Skip);
        }
        m.merged = merged.clone();
        tracing::debug!(consumer = m.id.get(), "consumer rendered");
        Ok(RenderDecision::Render(merged))
    }

    /// Evaluate, or reuse, the secondary derivation `name`.
    ///
    /// With `inputs` shallow-equal to the inputs last used for `name`, the
    /// value last computed for `name` (eagerly or by a pass) is returned and
    /// `selector` is not invoked. Otherwise `selector` runs
    /// now against the current state and the pair is registered, so later
    /// passes re-run it only when its inputs change. `None` inputs make the
    /// derivation order-dependent: it runs on every call and every pass.
    pub fn append_derivation(
        &mut self,
        name: &str,
        inputs: Option<Mapping>,
        selector: StateSelector,
    ) -> Result<Value, ConnectError> {
        let m = self.mounted_mut()?;
        if let (Some(next), Some(Some(last))) = (&inputs, m.appended_inputs.get(name)) {
            if shallow_equal(next, last) {
                // The slot holds the latest eager value; the snapshot may
                // still carry one computed from older inputs.
                let cached = m.registry.secondary_value(m.id, name).or_else(|| {
                    m.registry
                        .snapshot()
                        .appended(m.id, &m.appended_key, name)
                        .cloned()
                });
                if let Some(cached) = cached {
                    return Ok(cached);
                }
            }
        }

        let state = m.source.state();
        let empty = Mapping::new();
        let value = selector
            .call(&state, inputs.as_ref().unwrap_or(&empty))
            .map_err(|source| m.checks.failed(DerivationKind::Secondary(name.to_owned()), source))?;
        m.registry
            .set_secondary(m.id, name, selector, inputs.clone(), value.clone());
        m.appended_inputs.insert(Key::from(name), inputs);
        tracing::debug!(consumer = m.id.get(), name, "secondary derivation evaluated");
        Ok(value)
    }

    /// Attach the rendered instance. Requires `with_ref`.
    pub fn attach_instance(&mut self, instance: Rc<dyn Any>) -> Result<(), ConnectError> {
        if !self.options.with_ref {
            return Err(ConnectError::WrappedInstanceDisabled {
                name: self.name.clone(),
            });
        }
        self.mounted_mut()?.instance = Some(instance);
        Ok(())
    }

    /// The attached instance. Requires `with_ref`.
    pub fn wrapped_instance(&self) -> Result<Option<Rc<dyn Any>>, ConnectError> {
        if !self.options.with_ref {
            return Err(ConnectError::WrappedInstanceDisabled {
                name: self.name.clone(),
            });
        }
        Ok(self.mounted()?.instance.clone())
    }

    /// Remove the registry slot, leave the enclosing boundary and drop all
    /// cached references. Idempotent.
    pub fn unmount(&mut self) {
        let Some(mounted) = self.mounted.take() else {
            return;
        };
        mounted.registry.unset_derivation(mounted.id);
        if let Some(scope) = &mounted.scope {
            scope.unregister(&[mounted.id]);
        }
        tracing::debug!(consumer = mounted.id.get(), name = %self.name, "consumer unmounted");
    }
}

impl Mounted {
    /// Bring `state_props` up to date. Returns whether they changed.
    ///
    /// Narrowed own properties that changed force a direct recompute and a
    /// re-registration; otherwise the snapshot entry is taken, unless the
    /// snapshot is not newer than what the node already holds.
    fn refresh_state(
        &mut self,
        snapshot: &Snapshot,
        props_selector: Option<&PropsSelector>,
        props_changed: bool,
    ) -> Result<bool, ConnectError> {
        let depends_on = self.state_selector.depends_on();
        if props_changed && depends_on.tracks_own_props() {
            let inputs = narrow(props_selector, depends_on, &self.own_props);
            if !shallow_equal(&inputs, &self.state_inputs) {
                let state = self.source.state();
                let primary = self
                    .state_selector
                    .call(&state, &inputs)
                    .map_err(|source| self.checks.failed(DerivationKind::State, source))?;
                self.checks.shape(DerivationKind::State, &primary);
                self.registry
                    .set_derivation(self.id, self.state_selector.clone(), inputs.clone());
                let next = self.registry.seed(self.id, primary.clone()).unwrap_or(primary);
                self.state_inputs = inputs;
                self.state_pass = self.registry.pass_count();
                let changed = !shallow_equal_values(&next, &self.state_props);
                self.state_props = next;
                return Ok(changed);
            }
        }

        if snapshot.pass() <= self.state_pass {
            return Ok(false);
        }
        let Some(entry) = snapshot.get(self.id) else {
            return Ok(false);
        };
        self.state_pass = snapshot.pass();
        if entry.facsimile && entry.merged.same(&self.state_props) {
            return Ok(false);
        }
        let changed = !entry.merged.same(&self.state_props);
        self.state_props = entry.merged.clone();
        Ok(changed)
    }

    /// Bring `dispatch_props` up to date. Returns whether they changed.
    fn refresh_dispatch(
        &mut self,
        props_selector: Option<&PropsSelector>,
        props_changed: bool,
    ) -> Result<bool, ConnectError> {
        let depends_on = self.dispatch_selector.depends_on();
        let rerun = match depends_on {
            DependsOn::Source => false,
            DependsOn::Nothing => {
                if props_changed {
                    self.dispatch_inputs = narrow(props_selector, depends_on, &self.own_props);
                }
                true
            }
            DependsOn::OwnProps => {
                let inputs = narrow(props_selector, depends_on, &self.own_props);
                let changed = props_changed && !shallow_equal(&inputs, &self.dispatch_inputs);
                if changed {
                    self.dispatch_inputs = inputs;
                }
                changed
            }
        };
        if !rerun {
            return Ok(false);
        }
        let next = self
            .dispatch_selector
            .call(&self.source.dispatcher(), &self.dispatch_inputs)
            .map_err(|source| self.checks.failed(DerivationKind::Dispatch, source))?;
        self.checks.shape(DerivationKind::Dispatch, &next);
        if shallow_equal_values(&next, &self.dispatch_props) {
            return Ok(false);
        }
        self.dispatch_props = next;
        Ok(true)
    }
}

impl Drop for ConsumerNode {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl fmt::Debug for ConsumerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerNode")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("pure", &self.options.pure)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FilteredConsumer
// ---------------------------------------------------------------------------

/// A consumer wrapped in its own pruning boundary.
///
/// The consumer is declared first so it leaves the boundary's scope before
/// the boundary is dropped.
pub struct FilteredConsumer {
    node: ConsumerNode,
    boundary: Boundary,
}

impl FilteredConsumer {
    /// Offer a snapshot; the boundary may prune it before the consumer sees
    /// it.
    pub fn update(
        &mut self,
        snapshot: &Rc<Snapshot>,
        own_props: &Mapping,
    ) -> Result<RenderDecision, ConnectError> {
        match self.boundary.update(snapshot, own_props) {
            Propagation::Skip => Ok(RenderDecision::Skip),
            Propagation::Propagate(filtered) => self.node.update(&filtered, own_props),
        }
    }

    #[must_use]
    pub fn node(&self) -> &ConsumerNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut ConsumerNode {
        &mut self.node
    }

    #[must_use]
    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// Unmount the consumer, then the boundary.
    pub fn unmount(&mut self) {
        self.node.unmount();
        self.boundary.unmount();
    }
}

impl fmt::Debug for FilteredConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredConsumer")
            .field("node", &self.node)
            .field("boundary", &self.boundary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::provider::Provider;
    use crate::selector::default_merge;
    use crate::test_support::MemorySource;
    use blackbox_core::mapping;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        (Rc::clone(&calls), calls)
    }

    fn bump(calls: &Cell<u32>) {
        calls.set(calls.get() + 1);
    }

    fn todos_selector(calls: Rc<Cell<u32>>) -> StateSelector {
        StateSelector::from_source(move |state| {
            bump(&calls);
            Value::Map(mapping! { "todos" => state.get("todos").cloned() })
        })
    }

    fn setup(state: Mapping) -> (Rc<MemorySource>, Provider) {
        let source = MemorySource::new(state);
        let provider = Provider::new(source.shared());
        (source, provider)
    }

    fn int(props: Option<&Value>, key: &str) -> Option<i64> {
        props?.as_map()?.get(key)?.as_int()
    }

    #[test]
    fn missing_state_source_is_fatal() {
        let caps = Capabilities::new(&ProviderConfig::default());
        let err = Connect::new()
            .options(ConnectOptions::named("Orphan"))
            .mount(&caps, &Mapping::new())
            .unwrap_err();
        assert_eq!(
            err,
            ConnectError::MissingStateSource {
                name: "Connect(Orphan)".into()
            }
        );
    }

    #[test]
    fn explicit_source_takes_precedence() {
        let (_bundle_source, provider) = setup(mapping! { "n" => 1 });
        let explicit = MemorySource::new(mapping! { "n" => 2 });
        let node = Connect::new()
            .map_state(StateSelector::from_source(|state| {
                Value::Map(mapping! { "n" => state.get("n").cloned() })
            }))
            .mount_with_source(&provider.capabilities(), explicit.shared(), &Mapping::new())
            .unwrap();
        assert_eq!(int(node.props(), "n"), Some(2));
    }

    #[test]
    fn initial_props_merge_own_state_and_dispatch() {
        let (source, provider) = setup(mapping! { "count" => 3, "label" => "state" });
        let node = Connect::new()
            .map_state(StateSelector::from_source(|state| {
                Value::Map(mapping! { "count" => state.get("count").cloned(), "label" => "derived" })
            }))
            .mount(&provider.capabilities(), &mapping! { "label" => "own", "extra" => true })
            .unwrap();

        let props = node.props().and_then(Value::as_map).unwrap();
        assert_eq!(props.get("count"), Some(&Value::Int(3)));
        assert_eq!(props.get("label").and_then(Value::as_str), Some("derived"));
        assert_eq!(props.get("extra"), Some(&Value::Bool(true)));
        let dispatch = props.get("dispatch").and_then(Value::as_func).unwrap();
        dispatch.call(&[Value::from("ping")]);
        assert_eq!(source.dispatched().len(), 1);
        assert_eq!(node.id(), Some(ConsumerId::new(1)));
    }

    #[test]
    fn unchanged_entry_skips_without_merging() {
        let (source, provider) = setup(mapping! { "todos" => 1 });
        let (selector_calls, selector_count) = counter();
        let (merge_calls, merge_count) = counter();
        let mut node = Connect::new()
            .map_state(todos_selector(selector_calls))
            .merge(MergeFn::new(move |state, dispatch, own| {
                bump(&merge_calls);
                default_merge(state, dispatch, own)
            }))
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        assert_eq!(merge_count.get(), 1);

        source.set(mapping! { "todos" => 1, "unrelated" => 2 });
        let snap = provider.refresh().unwrap().unwrap();
        assert_eq!(snap.is_facsimile(node.id().unwrap()), Some(true));
        assert!(!node.update(&snap, &Mapping::new()).unwrap().is_render());
        assert_eq!(merge_count.get(), 1);
        assert_eq!(selector_count.get(), 2);

        source.set(mapping! { "todos" => 2 });
        let snap = provider.refresh().unwrap().unwrap();
        let decision = node.update(&snap, &Mapping::new()).unwrap();
        assert!(decision.is_render());
        assert_eq!(merge_count.get(), 2);
        assert_eq!(int(node.props(), "todos"), Some(2));
    }

    #[test]
    fn narrowed_props_gate_state_recompute() {
        let (_source, provider) = setup(mapping! { "base" => 10 });
        let (calls, count) = counter();
        let selector = StateSelector::new(move |state, props| {
            bump(&calls);
            let base = state.get("base").and_then(Value::as_int).unwrap_or(0);
            let offset = props.get("offset").and_then(Value::as_int).unwrap_or(0);
            Value::Map(mapping! { "total" => base + offset })
        });
        let mut node = Connect::new()
            .map_state(selector)
            .map_state_props(PropsSelector::keys(["offset"]))
            .mount(&provider.capabilities(), &mapping! { "offset" => 1, "color" => "red" })
            .unwrap();
        assert_eq!(count.get(), 1);
        let snap = provider.snapshot();

        let decision = node
            .update(&snap, &mapping! { "offset" => 1, "color" => "blue" })
            .unwrap();
        assert!(decision.is_render());
        assert_eq!(count.get(), 1);

        node.update(&snap, &mapping! { "offset" => 5, "color" => "blue" })
            .unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(int(node.props(), "total"), Some(15));

        let next = provider.force_pass().unwrap();
        assert_eq!(next.is_facsimile(node.id().unwrap()), Some(true));
        assert!(!node.update(&next, &mapping! { "offset" => 5, "color" => "blue" }).unwrap().is_render());
    }

    #[test]
    fn stale_snapshot_does_not_override_direct_recompute() {
        let (_source, provider) = setup(Mapping::new());
        let mut node = Connect::new()
            .map_state(StateSelector::new(|_, props| Value::Map(props.clone())))
            .map_state_props(PropsSelector::keys(["k"]))
            .mount(&provider.capabilities(), &mapping! { "k" => 1 })
            .unwrap();
        let old = provider.force_pass().unwrap();
        node.update(&old, &mapping! { "k" => 2 }).unwrap();
        node.update(&old, &mapping! { "k" => 2, "other" => 0 }).unwrap();
        assert_eq!(int(node.props(), "k"), Some(2));
    }

    #[test]
    fn missing_props_selector_is_reported() {
        let (_source, provider) = setup(Mapping::new());
        let caps = provider.capabilities();
        let _node = Connect::new()
            .map_state(StateSelector::new(|_, props| Value::Map(props.clone())))
            .options(ConnectOptions::named("Row"))
            .mount(&caps, &Mapping::new())
            .unwrap();
        let entries = caps.diagnostics().entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            &entries[0],
            Diagnostic::MissingPropsSelector { name, derivation: DerivationKind::State, .. }
                if name == "Connect(Row)"
        ));
    }

    #[test]
    fn non_mapping_dispatch_is_reported_and_installed() {
        let (_source, provider) = setup(Mapping::new());
        let caps = provider.capabilities();
        let node = Connect::new()
            .map_dispatch(DispatchSelector::from_source(|_| Value::Int(1)))
            .merge(MergeFn::new(|_, dispatch, _| dispatch.clone()))
            .mount(&caps, &Mapping::new())
            .unwrap();
        assert_eq!(node.props(), Some(&Value::Int(1)));
        let kinds: Vec<_> = caps
            .diagnostics()
            .entries()
            .iter()
            .map(|d| d.derivation().clone())
            .collect();
        assert_eq!(kinds, [DerivationKind::Dispatch, DerivationKind::Merge]);
    }

    #[test]
    fn order_dependent_dispatch_runs_every_update() {
        let (_source, provider) = setup(Mapping::new());
        let (calls, count) = counter();
        let stable = Value::Map(mapping! { "go" => 1 });
        let mut node = Connect::new()
            .map_dispatch(DispatchSelector::order_dependent(move |_, _| {
                bump(&calls);
                stable.clone()
            }))
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        let snap = provider.force_pass().unwrap();
        node.update(&snap, &Mapping::new()).unwrap();
        node.update(&snap, &Mapping::new()).unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn order_sensitive_merge_runs_every_update() {
        let (_source, provider) = setup(mapping! { "todos" => 1 });
        let (calls, count) = counter();
        let mut node = Connect::new()
            .map_state(todos_selector(Rc::new(Cell::new(0))))
            .merge(MergeFn::order_sensitive(move |state, dispatch, own| {
                bump(&calls);
                default_merge(state, dispatch, own)
            }))
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        for _ in 0..3 {
            let snap = provider.force_pass().unwrap();
            assert!(!node.update(&snap, &Mapping::new()).unwrap().is_render());
        }
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn impure_node_always_renders() {
        let (_source, provider) = setup(Mapping::new());
        let mut node = Connect::new()
            .options(ConnectOptions::default().pure(false))
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        let snap = provider.force_pass().unwrap();
        assert!(node.update(&snap, &Mapping::new()).unwrap().is_render());
        assert!(node.update(&snap, &Mapping::new()).unwrap().is_render());
    }

    #[test]
    fn append_derivation_reuses_cached_value() {
        let (_source, provider) = setup(Mapping::new());
        let mut node = Connect::new()
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        let (calls, count) = counter();
        let total = StateSelector::new(move |_, inputs| {
            bump(&calls);
            Value::Int(inputs.get("x").and_then(Value::as_int).unwrap_or(0) * 5)
        });

        let first = node
            .append_derivation("total", Some(mapping! { "x" => 1 }), total.clone())
            .unwrap();
        assert_eq!(first, Value::Int(5));
        provider.force_pass().unwrap();
        let again = node
            .append_derivation("total", Some(mapping! { "x" => 1 }), total.clone())
            .unwrap();
        assert_eq!(again, Value::Int(5));
        assert_eq!(count.get(), 1);

        let order_dependent = node.append_derivation("now", None, total.clone()).unwrap();
        assert_eq!(order_dependent, Value::Int(0));
        node.append_derivation("now", None, total).unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn append_derivation_returns_eager_value_before_next_pass() {
        let (_source, provider) = setup(Mapping::new());
        let mut node = Connect::new()
            .mount(&provider.capabilities(), &Mapping::new())
            .unwrap();
        let (calls, count) = counter();
        let total = StateSelector::new(move |_, inputs| {
            bump(&calls);
            Value::Int(inputs.get("x").and_then(Value::as_int).unwrap_or(0) * 5)
        });

        node.append_derivation("total", Some(mapping! { "x" => 1 }), total.clone())
            .unwrap();
        provider.force_pass().unwrap();

        let changed = node
            .append_derivation("total", Some(mapping! { "x" => 2 }), total.clone())
            .unwrap();
        assert_eq!(changed, Value::Int(10));
        let repeated = node
            .append_derivation("total", Some(mapping! { "x" => 2 }), total)
            .unwrap();
        assert_eq!(repeated, Value::Int(10));
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn wrapped_instance_requires_opt_in() {
        let (_source, provider) = setup(Mapping::new());
        let caps = provider.capabilities();
        let mut plain = Connect::new().mount(&caps, &Mapping::new()).unwrap();
        assert!(matches!(
            plain.wrapped_instance(),
            Err(ConnectError::WrappedInstanceDisabled { .. })
        ));
        assert!(plain.attach_instance(Rc::new(1_u8)).is_err());

        let mut with_ref = Connect::new()
            .options(ConnectOptions::named("Panel").with_ref(true))
            .mount(&caps, &Mapping::new())
            .unwrap();
        with_ref.attach_instance(Rc::new(42_u32)).unwrap();
        let instance = with_ref.wrapped_instance().unwrap().unwrap();
        assert_eq!(instance.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn unmount_releases_slot_and_is_idempotent() {
        let (_source, provider) = setup(Mapping::new());
        let caps = provider.capabilities();
        let mut node = Connect::new().mount(&caps, &Mapping::new()).unwrap();
        let id = node.id().unwrap();
        assert!(caps.registry().contains(id));

        node.unmount();
        node.unmount();
        assert!(!caps.registry().contains(id));
        assert!(node.props().is_none());
        let err = node.update(&provider.snapshot(), &Mapping::new()).unwrap_err();
        assert!(matches!(err, ConnectError::Unmounted { .. }));
    }

    #[test]
    fn drop_unmounts() {
        let (_source, provider) = setup(Mapping::new());
        let caps = provider.capabilities();
        {
            let _node = Connect::new().mount(&caps, &Mapping::new()).unwrap();
            assert_eq!(caps.registry().len(), 1);
        }
        assert!(caps.registry().is_empty());
    }

    #[test]
    fn filtered_consumer_prunes_unchanged_passes() {
        let (source, provider) = setup(mapping! { "todos" => 1 });
        let (calls, _count) = counter();
        let mut filtered = Connect::new()
            .map_state(todos_selector(calls))
            .mount_filtered(&provider.capabilities(), &Mapping::new())
            .unwrap();
        let id = filtered.node().id().unwrap();
        assert_eq!(filtered.boundary().tracked_ids(), [id]);

        let snap = provider.force_pass().unwrap();
        assert!(!filtered.update(&snap, &Mapping::new()).unwrap().is_render());
        assert!(filtered.boundary().filtered().is_none());

        source.set(mapping! { "todos" => 2 });
        let snap = provider.refresh().unwrap().unwrap();
        assert!(filtered.update(&snap, &Mapping::new()).unwrap().is_render());

        filtered.unmount();
        assert!(provider.registry().is_empty());
    }
}
