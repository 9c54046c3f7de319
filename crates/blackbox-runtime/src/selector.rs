#![forbid(unsafe_code)]

//! Selectors, factories, props selectors and merge functions.
//!
//! A [`Selector<S>`] derives a [`Value`] from a source `S` and a mapping of
//! inputs. Two sources are used:
//!
//! | Alias | Source | Inputs |
//! |-------|--------|--------|
//! | [`StateSelector`] | current state ([`Mapping`]) | narrowed own properties, or secondary inputs |
//! | [`DispatchSelector`] | dispatch capability ([`Callback`]) | narrowed own properties |
//!
//! Every selector declares what it reads through [`DependsOn`]. The
//! declaration drives memoization: a selector that reads only its source
//! is never re-run because own properties changed, and an
//! [`DependsOn::Nothing`] selector is re-run on every opportunity.
//!
//! # Identity contract
//!
//! Selectors must return a *new* container whenever the derived content
//! changes. Returning a container that was mutated in place is invisible to
//! every check downstream.
//!
//! The converse also holds: a primary result whose content is shallow-equal
//! to the previous result is discarded by the registry, and the previous
//! container is kept. A fresh `Rc` with unchanged content never reaches
//! consumers, and the slot stays a facsimile.

use std::fmt;
use std::rc::Rc;

use blackbox_core::{Callback, Mapping, Value, pick};

use crate::error::SelectorError;

/// What a selector returns.
pub type SelectorResult = Result<Value, SelectorError>;

/// Declared inputs of a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependsOn {
    /// Zero declared inputs. The selector has hidden dependencies and is
    /// re-run every time it could be.
    Nothing,
    /// Reads only its source (state or dispatch).
    #[default]
    Source,
    /// Reads its source and the narrowed own properties.
    OwnProps,
}

impl DependsOn {
    /// Whether a change of own properties must re-run the selector.
    #[inline]
    #[must_use]
    pub const fn tracks_own_props(self) -> bool {
        !matches!(self, Self::Source)
    }
}

type SelectFn<S> = dyn Fn(&S, &Mapping) -> SelectorResult;

/// A derivation function plus its declared inputs.
pub struct Selector<S> {
    f: Rc<SelectFn<S>>,
    depends_on: DependsOn,
}

/// Selector over the shared state.
pub type StateSelector = Selector<Mapping>;

/// Selector over the dispatch capability.
pub type DispatchSelector = Selector<Callback>;

impl<S: 'static> Selector<S> {
    /// Selector reading its source and own properties.
    pub fn new(f: impl Fn(&S, &Mapping) -> Value + 'static) -> Self {
        Self::fallible(DependsOn::OwnProps, move |source, props| Ok(f(source, props)))
    }

    /// Selector reading only its source.
    pub fn from_source(f: impl Fn(&S) -> Value + 'static) -> Self {
        Self::fallible(DependsOn::Source, move |source, _| Ok(f(source)))
    }

    /// Selector with hidden dependencies; re-run every time.
    pub fn order_dependent(f: impl Fn(&S, &Mapping) -> Value + 'static) -> Self {
        Self::fallible(DependsOn::Nothing, move |source, props| Ok(f(source, props)))
    }

    /// Selector that may fail. A failure inside a registry pass aborts it.
    pub fn fallible(
        depends_on: DependsOn,
        f: impl Fn(&S, &Mapping) -> SelectorResult + 'static,
    ) -> Self {
        Self {
            f: Rc::new(f),
            depends_on,
        }
    }
}

impl<S> Selector<S> {
    /// Same function, different declaration.
    #[must_use]
    pub fn with_depends_on(mut self, depends_on: DependsOn) -> Self {
        self.depends_on = depends_on;
        self
    }

    #[inline]
    #[must_use]
    pub fn depends_on(&self) -> DependsOn {
        self.depends_on
    }

    /// Invoke the selector.
    pub fn call(&self, source: &S, inputs: &Mapping) -> SelectorResult {
        (self.f)(source, inputs)
    }

    /// Whether both selectors share the same function.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.f, &other.f)
    }
}

impl<S> Clone for Selector<S> {
    fn clone(&self) -> Self {
        Self {
            f: Rc::clone(&self.f),
            depends_on: self.depends_on,
        }
    }
}

impl<S> fmt::Debug for Selector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Derive
// ---------------------------------------------------------------------------

type FactoryFn<S> = dyn Fn(&S, &Mapping) -> Selector<S>;

/// How a consumer obtains its selector.
pub enum Derive<S> {
    /// One selector shared by every consumer built from the same `Connect`.
    Select(Selector<S>),
    /// Called once per mount with the source and raw own properties;
    /// returns the selector that consumer uses from then on.
    Factory(Rc<FactoryFn<S>>),
}

impl<S: 'static> Derive<S> {
    /// Per-mount selector factory.
    pub fn factory(f: impl Fn(&S, &Mapping) -> Selector<S> + 'static) -> Self {
        Self::Factory(Rc::new(f))
    }
}

impl<S> Derive<S> {
    /// The selector a freshly mounted consumer should use.
    pub fn instantiate(&self, source: &S, own_props: &Mapping) -> Selector<S> {
        match self {
            Self::Select(selector) => selector.clone(),
            Self::Factory(factory) => factory(source, own_props),
        }
    }
}

impl Derive<Callback> {
    /// Dispatch derivation from an action-creator mapping.
    ///
    /// Every function value `creator` becomes a callback that dispatches
    /// `creator(args)`. Non-function values are dropped.
    #[must_use]
    pub fn action_creators(creators: Mapping) -> Self {
        Self::Select(Selector::from_source(move |dispatch: &Callback| {
            Value::Map(bind_action_creators(&creators, dispatch))
        }))
    }
}

impl<S> Clone for Derive<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Select(selector) => Self::Select(selector.clone()),
            Self::Factory(factory) => Self::Factory(Rc::clone(factory)),
        }
    }
}

impl<S> From<Selector<S>> for Derive<S> {
    fn from(selector: Selector<S>) -> Self {
        Self::Select(selector)
    }
}

impl<S> fmt::Debug for Derive<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(selector) => f.debug_tuple("Select").field(selector).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

fn bind_action_creators(creators: &Mapping, dispatch: &Callback) -> Mapping {
    creators
        .iter()
        .filter_map(|(name, value)| {
            let creator = value.as_func()?.clone();
            let dispatch = dispatch.clone();
            let bound = Callback::new(move |args| dispatch.call(&[creator.call(args)]));
            Some((name, Value::Func(bound)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Props selector
// ---------------------------------------------------------------------------

/// Narrows own properties before they reach a props-dependent selector.
#[derive(Clone)]
pub struct PropsSelector(Rc<dyn Fn(&Mapping) -> Mapping>);

impl PropsSelector {
    pub fn new(f: impl Fn(&Mapping) -> Mapping + 'static) -> Self {
        Self(Rc::new(f))
    }

    /// Keep only the listed keys.
    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self::new(move |props| pick(props, keys.iter().map(String::as_str)))
    }

    pub fn apply(&self, own_props: &Mapping) -> Mapping {
        (self.0)(own_props)
    }
}

impl fmt::Debug for PropsSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PropsSelector(..)")
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

type MergeBody = dyn Fn(&Value, &Value, &Mapping) -> Value;

/// Combines derived state, derived dispatch and own properties into the
/// props a consumer renders.
#[derive(Clone)]
pub struct MergeFn {
    f: Rc<MergeBody>,
    order_sensitive: bool,
}

impl MergeFn {
    /// Merge function invoked only when one of its inputs changed.
    pub fn new(f: impl Fn(&Value, &Value, &Mapping) -> Value + 'static) -> Self {
        Self {
            f: Rc::new(f),
            order_sensitive: false,
        }
    }

    /// Merge function with hidden dependencies, invoked on every update.
    pub fn order_sensitive(f: impl Fn(&Value, &Value, &Mapping) -> Value + 'static) -> Self {
        Self {
            f: Rc::new(f),
            order_sensitive: true,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_order_sensitive(&self) -> bool {
        self.order_sensitive
    }

    pub fn call(&self, state_props: &Value, dispatch_props: &Value, own_props: &Mapping) -> Value {
        (self.f)(state_props, dispatch_props, own_props)
    }
}

impl Default for MergeFn {
    fn default() -> Self {
        Self::new(default_merge)
    }
}

impl fmt::Debug for MergeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeFn")
            .field("order_sensitive", &self.order_sensitive)
            .finish_non_exhaustive()
    }
}

/// Right-biased overwrite: own properties, then derived state, then
/// derived dispatch. Non-mapping derivations contribute nothing.
pub fn default_merge(state_props: &Value, dispatch_props: &Value, own_props: &Mapping) -> Value {
    let empty = Mapping::new();
    let state = state_props.as_map().unwrap_or(&empty);
    let dispatch = dispatch_props.as_map().unwrap_or(&empty);
    Value::Map(Mapping::merge_right(&[own_props, state, dispatch]))
}

/// State derivation used when a consumer declares none: always the same
/// empty mapping, so it never marks the consumer changed.
pub(crate) fn default_state_selector() -> StateSelector {
    let stable = Value::Map(Mapping::new());
    Selector::from_source(move |_: &Mapping| stable.clone())
}

/// Dispatch derivation used when a consumer declares none:
/// `{dispatch: <dispatch fn>}`.
pub(crate) fn default_dispatch_selector() -> DispatchSelector {
    Selector::from_source(|dispatch: &Callback| {
        Value::Map(Mapping::from_entries([("dispatch", dispatch.clone())]))
    })
}
