#![forbid(unsafe_code)]

//! The derivation registry ("blackbox").
//!
//! One [`Registry`] lives at the tree root. It holds a slot per registered
//! consumer id and, once per state change, recomputes every slot in a single
//! synchronous pass, publishing an immutable [`Snapshot`] that says, per id,
//! whether the merged result is reference-identical to the previous pass's
//! (a *facsimile*).
//!
//! # Pass algorithm
//!
//! For every slot, in registration order:
//!
//! 1. Invoke the primary selector with the state and the own properties
//!    last supplied through [`Registry::set_derivation`]. A result that is
//!    shallow-equal to the previous primary result is discarded and the
//!    previous one kept, so unchanged slices keep their identity.
//! 2. Re-invoke each secondary selector whose inputs are absent or
//!    shallow-unequal to the inputs it was last evaluated with.
//! 3. Rebuild the merged result only if the primary or a secondary value
//!    changed (or a secondary was added since the last pass); otherwise the
//!    previous merged result is reused.
//! 4. Mark the slot facsimile iff the merged result is the previous one.
//!
//! # Invariants
//!
//! 1. A slot exists iff its id is registered; registering an id again
//!    overwrites the derivation and keeps the slot's position and caches.
//! 2. Recompute order is registration order.
//! 3. A pass either completes and publishes a new snapshot, or fails and
//!    leaves every slot and the published snapshot untouched.
//! 4. A snapshot never changes after it is published.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Selector error | Fallible selector returned `Err` | Pass aborted, [`PassError::Selector`] returned |
//! | Non-mapping primary | Contract violation | Reported as a diagnostic, result installed as-is |
//! | Re-entrant pass | Selector triggered a pass | [`PassError::Reentrant`] |

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use blackbox_core::{Key, Mapping, Value, ValueKind, shallow_equal, shallow_equal_values};

use crate::config::ProviderConfig;
use crate::diagnostics::{DerivationKind, Diagnostic, DiagnosticLog};
use crate::error::PassError;
use crate::id::ConsumerId;
use crate::selector::StateSelector;
use crate::snapshot::{Snapshot, SnapshotEntry};

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

struct SecondarySlot {
    selector: StateSelector,
    /// Inputs the owning consumer declared most recently. `None` marks the
    /// derivation order-dependent.
    inputs: Option<Mapping>,
    /// Inputs the current `value` was computed from during a pass, or at
    /// first registration.
    evaluated_with: Option<Mapping>,
    value: Value,
}

impl SecondarySlot {
    fn is_stale(&self) -> bool {
        match (&self.inputs, &self.evaluated_with) {
            (Some(inputs), Some(evaluated)) => !shallow_equal(inputs, evaluated),
            _ => true,
        }
    }
}

struct Slot {
    name: String,
    selector: StateSelector,
    own_props: Mapping,
    last_primary: Option<Value>,
    merged: Option<Value>,
    secondary: IndexMap<Key, SecondarySlot, RandomState>,
    /// A secondary value arrived outside a pass and is not folded yet.
    pending_fold: bool,
}

impl Slot {
    fn secondary_values(&self) -> Vec<(Key, Value)> {
        self.secondary
            .iter()
            .map(|(name, slot)| (Rc::clone(name), slot.value.clone()))
            .collect()
    }
}

fn fold(primary: &Value, secondary: &[(Key, Value)], appended_key: &Key) -> Value {
    match primary {
        Value::Map(map) if !secondary.is_empty() => {
            let appended = Mapping::from_entries(secondary.iter().cloned());
            Value::Map(map.with(Rc::clone(appended_key), appended))
        }
        _ => primary.clone(),
    }
}

// ---------------------------------------------------------------------------
// Pass plan
// ---------------------------------------------------------------------------

/// Everything a pass reads, captured up front so that no registry borrow is
/// held while user selectors run.
struct Plan {
    pass: u64,
    appended_key: Key,
    check_shapes: bool,
    slots: Vec<PlannedSlot>,
}

struct PlannedSlot {
    id: ConsumerId,
    name: String,
    selector: StateSelector,
    own_props: Mapping,
    last_primary: Option<Value>,
    merged: Option<Value>,
    secondary: Vec<PlannedSecondary>,
    pending_fold: bool,
}

struct PlannedSecondary {
    name: Key,
    selector: StateSelector,
    inputs: Option<Mapping>,
    stale: bool,
    value: Value,
}

struct Evaluated {
    id: ConsumerId,
    name: String,
    primary: Value,
    merged: Value,
    facsimile: bool,
    shape_violation: Option<ValueKind>,
    /// Secondary derivations that were re-invoked: name, kept value, inputs.
    rerun: Vec<(Key, Value, Option<Mapping>)>,
}

impl Plan {
    fn evaluate(self, state: &Mapping) -> Result<Vec<Evaluated>, PassError> {
        let Self {
            appended_key,
            check_shapes,
            slots,
            ..
        } = self;
        slots
            .into_iter()
            .map(|slot| slot.evaluate(state, &appended_key, check_shapes))
            .collect()
    }
}

impl PlannedSlot {
    fn evaluate(
        self,
        state: &Mapping,
        appended_key: &Key,
        check_shapes: bool,
    ) -> Result<Evaluated, PassError> {
        let id = self.id;
        let fresh = self
            .selector
            .call(state, &self.own_props)
            .map_err(|source| PassError::Selector {
                consumer: id,
                derivation: DerivationKind::State,
                source,
            })?;
        let (primary, primary_changed) = match self.last_primary {
            Some(previous) if shallow_equal_values(&previous, &fresh) => (previous, false),
            _ => (fresh, true),
        };

        let mut secondary_changed = false;
        let mut rerun = Vec::new();
        let mut values = Vec::with_capacity(self.secondary.len());
        for secondary in self.secondary {
            let mut value = secondary.value;
            if secondary.stale {
                let inputs = secondary.inputs.clone().unwrap_or_default();
                let next = secondary.selector.call(state, &inputs).map_err(|source| {
                    PassError::Selector {
                        consumer: id,
                        derivation: DerivationKind::Secondary(secondary.name.to_string()),
                        source,
                    }
                })?;
                if !shallow_equal_values(&value, &next) {
                    value = next;
                    secondary_changed = true;
                }
                rerun.push((Rc::clone(&secondary.name), value.clone(), secondary.inputs));
            }
            values.push((secondary.name, value));
        }

        let merged = match &self.merged {
            Some(previous) if !primary_changed && !secondary_changed && !self.pending_fold => {
                previous.clone()
            }
            _ => fold(&primary, &values, appended_key),
        };
        let facsimile = self
            .merged
            .as_ref()
            .is_some_and(|previous| previous.same(&merged));
        let shape_violation =
            (check_shapes && primary_changed && !primary.is_map()).then(|| primary.kind());

        Ok(Evaluated {
            id,
            name: self.name,
            primary,
            merged,
            facsimile,
            shape_violation,
            rerun,
        })
    }
}

/// Evaluate `plan` inside the pass span and hand the results to `commit`.
/// No registry borrow may be held while this runs.
fn run_pass(
    plan: Plan,
    state: &Mapping,
    commit: impl FnOnce(Vec<Evaluated>) -> Rc<Snapshot>,
) -> Result<Rc<Snapshot>, PassError> {
    let span = tracing::debug_span!("registry_pass", pass = plan.pass, slots = plan.slots.len());
    let _enter = span.enter();
    let evaluated = plan.evaluate(state)?;
    Ok(commit(evaluated))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-consumer derivation slots and the last published snapshot.
pub struct Registry {
    slots: IndexMap<ConsumerId, Slot, RandomState>,
    snapshot: Rc<Snapshot>,
    passes: u64,
    appended_key: Key,
    check_shapes: bool,
    diagnostics: DiagnosticLog,
}

impl Registry {
    #[must_use]
    pub fn new(config: &ProviderConfig, diagnostics: DiagnosticLog) -> Self {
        let config = config.sanitized();
        Self {
            slots: IndexMap::default(),
            snapshot: Rc::new(Snapshot::default()),
            passes: 0,
            appended_key: Key::from(config.appended_key.as_str()),
            check_shapes: config.check_shapes,
            diagnostics,
        }
    }

    /// Register or overwrite the primary derivation for `id`.
    ///
    /// The next pass invokes `selector` with exactly `own_props`.
    /// Overwriting keeps the slot's registration order, cached results and
    /// secondary derivations.
    pub fn set_derivation(&mut self, id: ConsumerId, selector: StateSelector, own_props: Mapping) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.selector = selector;
            slot.own_props = own_props;
            return;
        }
        self.slots.insert(
            id,
            Slot {
                name: id.to_string(),
                selector,
                own_props,
                last_primary: None,
                merged: None,
                secondary: IndexMap::default(),
                pending_fold: false,
            },
        );
    }

    /// Name used for `id` in diagnostics.
    pub fn set_name(&mut self, id: ConsumerId, name: impl Into<String>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.name = name.into();
        }
    }

    /// Install a primary result computed outside a pass, so the next pass
    /// compares against it. Returns the merged result, or `None` when `id`
    /// is not registered.
    pub fn seed(&mut self, id: ConsumerId, primary: Value) -> Option<Value> {
        let slot = self.slots.get_mut(&id)?;
        let merged = fold(&primary, &slot.secondary_values(), &self.appended_key);
        slot.last_primary = Some(primary);
        slot.merged = Some(merged.clone());
        slot.pending_fold = false;
        Some(merged)
    }

    /// Register or replace the secondary derivation `name` of `id` with a
    /// value the consumer already computed.
    ///
    /// A new derivation counts as evaluated with `inputs`. A replaced one
    /// keeps the inputs it was last evaluated with, so the next pass
    /// re-invokes it when `inputs` differ. Returns `false` when `id` is not
    /// registered.
    pub fn set_secondary(
        &mut self,
        id: ConsumerId,
        name: &str,
        selector: StateSelector,
        inputs: Option<Mapping>,
        value: Value,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        match slot.secondary.get_mut(name) {
            Some(existing) => {
                existing.selector = selector;
                existing.inputs = inputs;
                existing.value = value;
            }
            None => {
                slot.secondary.insert(
                    Key::from(name),
                    SecondarySlot {
                        selector,
                        evaluated_with: inputs.clone(),
                        inputs,
                        value,
                    },
                );
            }
        }
        slot.pending_fold = true;
        true
    }

    /// Remove the slot for `id`. Returns whether a slot was removed;
    /// calling it for an unknown id is a no-op.
    pub fn unset_derivation(&mut self, id: ConsumerId) -> bool {
        self.slots.shift_remove(&id).is_some()
    }

    /// Run one pass over every slot and publish the resulting snapshot.
    pub fn recompute_all(&mut self, state: &Mapping) -> Result<Rc<Snapshot>, PassError> {
        let plan = self.plan();
        run_pass(plan, state, |evaluated| self.commit(evaluated))
    }

    fn plan(&self) -> Plan {
        let slots = self
            .slots
            .iter()
            .map(|(id, slot)| PlannedSlot {
                id: *id,
                name: slot.name.clone(),
                selector: slot.selector.clone(),
                own_props: slot.own_props.clone(),
                last_primary: slot.last_primary.clone(),
                merged: slot.merged.clone(),
                secondary: slot
                    .secondary
                    .iter()
                    .map(|(name, secondary)| PlannedSecondary {
                        name: Rc::clone(name),
                        selector: secondary.selector.clone(),
                        inputs: secondary.inputs.clone(),
                        stale: secondary.is_stale(),
                        value: secondary.value.clone(),
                    })
                    .collect(),
                pending_fold: slot.pending_fold,
            })
            .collect();
        Plan {
            pass: self.passes + 1,
            appended_key: Rc::clone(&self.appended_key),
            check_shapes: self.check_shapes,
            slots,
        }
    }

    fn commit(&mut self, evaluated: Vec<Evaluated>) -> Rc<Snapshot> {
        self.passes += 1;
        let mut entries =
            IndexMap::with_capacity_and_hasher(evaluated.len(), RandomState::default());
        for item in evaluated {
            if let Some(found) = item.shape_violation {
                self.diagnostics.report(Diagnostic::ShapeViolation {
                    consumer: item.id,
                    name: item.name,
                    derivation: DerivationKind::State,
                    found,
                });
            }
            // Ids retired while the pass ran still get their entry; only
            // their slot is gone.
            if let Some(slot) = self.slots.get_mut(&item.id) {
                slot.last_primary = Some(item.primary);
                slot.merged = Some(item.merged.clone());
                slot.pending_fold = false;
                for (name, value, inputs) in item.rerun {
                    if let Some(secondary) = slot.secondary.get_mut(&name) {
                        secondary.value = value;
                        secondary.evaluated_with = inputs;
                    }
                }
            }
            tracing::trace!(consumer = item.id.get(), facsimile = item.facsimile, "slot recomputed");
            entries.insert(
                item.id,
                SnapshotEntry {
                    facsimile: item.facsimile,
                    merged: item.merged,
                },
            );
        }
        self.snapshot = Rc::new(Snapshot::new(self.passes, entries));
        Rc::clone(&self.snapshot)
    }

    /// The last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Rc<Snapshot> {
        Rc::clone(&self.snapshot)
    }

    /// Merged result of `id` in the last snapshot, if `id` is still
    /// registered.
    #[must_use]
    pub fn get_snapshot_entry(&self, id: ConsumerId) -> Option<Value> {
        if !self.slots.contains_key(&id) {
            return None;
        }
        self.snapshot.merged(id).cloned()
    }

    /// Current value of a secondary derivation.
    #[must_use]
    pub fn secondary_value(&self, id: ConsumerId, name: &str) -> Option<Value> {
        Some(self.slots.get(&id)?.secondary.get(name)?.value.clone())
    }

    #[must_use]
    pub fn contains(&self, id: ConsumerId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = ConsumerId> + '_ {
        self.slots.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of completed passes.
    #[must_use]
    pub fn pass_count(&self) -> u64 {
        self.passes
    }
}

impl Default for Registry {
    fn default() -> Self {
        let config = ProviderConfig::default();
        let diagnostics = DiagnosticLog::new(config.diagnostic_capacity);
        Self::new(&config, diagnostics)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.slots.len())
            .field("passes", &self.passes)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct PassGuard<'a>(&'a Cell<bool>);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Shared handle to the tree's registry.
///
/// Consumers and boundaries hold clones. No borrow of the registry is held
/// while selectors run, so a selector may read snapshots or register
/// derivations; requesting a pass from inside a pass fails with
/// [`PassError::Reentrant`].
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Rc<RefCell<Registry>>,
    in_pass: Rc<Cell<bool>>,
}

impl RegistryHandle {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Rc::new(RefCell::new(registry)),
            in_pass: Rc::new(Cell::new(false)),
        }
    }

    pub fn set_derivation(&self, id: ConsumerId, selector: StateSelector, own_props: Mapping) {
        self.inner.borrow_mut().set_derivation(id, selector, own_props);
    }

    pub fn set_name(&self, id: ConsumerId, name: impl Into<String>) {
        self.inner.borrow_mut().set_name(id, name);
    }

    pub fn seed(&self, id: ConsumerId, primary: Value) -> Option<Value> {
        self.inner.borrow_mut().seed(id, primary)
    }

    pub fn set_secondary(
        &self,
        id: ConsumerId,
        name: &str,
        selector: StateSelector,
        inputs: Option<Mapping>,
        value: Value,
    ) -> bool {
        self.inner
            .borrow_mut()
            .set_secondary(id, name, selector, inputs, value)
    }

    pub fn unset_derivation(&self, id: ConsumerId) -> bool {
        self.inner.borrow_mut().unset_derivation(id)
    }

    /// See [`Registry::recompute_all`].
    pub fn recompute_all(&self, state: &Mapping) -> Result<Rc<Snapshot>, PassError> {
        if self.in_pass.replace(true) {
            return Err(PassError::Reentrant);
        }
        let _guard = PassGuard(&self.in_pass);
        let plan = self.inner.borrow().plan();
        run_pass(plan, state, |evaluated| self.inner.borrow_mut().commit(evaluated))
    }

    #[must_use]
    pub fn snapshot(&self) -> Rc<Snapshot> {
        self.inner.borrow().snapshot()
    }

    #[must_use]
    pub fn get_snapshot_entry(&self, id: ConsumerId) -> Option<Value> {
        self.inner.borrow().get_snapshot_entry(id)
    }

    #[must_use]
    pub fn secondary_value(&self, id: ConsumerId, name: &str) -> Option<Value> {
        self.inner.borrow().secondary_value(id, name)
    }

    #[must_use]
    pub fn contains(&self, id: ConsumerId) -> bool {
        self.inner.borrow().contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    #[must_use]
    pub fn pass_count(&self) -> u64 {
        self.inner.borrow().pass_count()
    }

    /// Registered ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConsumerId> {
        self.inner.borrow().ids().collect()
    }
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegistryHandle")
            .field(&*self.inner.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SelectorError;
    use crate::selector::DependsOn;
    use blackbox_core::mapping;
    use std::cell::RefCell;
    use tracing_test::traced_test;

    fn count_selector() -> StateSelector {
        StateSelector::from_source(|state| {
            let count = state.get("count").cloned().unwrap_or_default();
            Value::Map(mapping! { "count" => count })
        })
    }

    fn registry() -> Registry {
        Registry::new(&ProviderConfig::default(), DiagnosticLog::new(16))
    }

    #[test]
    fn first_pass_is_never_facsimile() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, count_selector(), Mapping::new());
        let snap = reg.recompute_all(&mapping! { "count" => 0 }).unwrap();
        assert_eq!(snap.is_facsimile(id), Some(false));
        assert_eq!(snap.pass(), 1);
    }

    #[test]
    fn shallow_equal_primary_keeps_identity() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, count_selector(), Mapping::new());
        let first = reg.recompute_all(&mapping! { "count" => 0 }).unwrap();
        let second = reg.recompute_all(&mapping! { "count" => 0, "other" => 1 }).unwrap();
        assert_eq!(second.is_facsimile(id), Some(true));
        assert!(first.merged(id).unwrap().same(second.merged(id).unwrap()));
    }

    #[test]
    fn reregistering_overwrites_without_duplicating() {
        let mut reg = registry();
        let a = ConsumerId::new(1);
        let b = ConsumerId::new(2);
        reg.set_derivation(a, count_selector(), Mapping::new());
        reg.set_derivation(b, count_selector(), Mapping::new());
        reg.set_derivation(a, StateSelector::from_source(|_| Value::Int(1)), Mapping::new());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.ids().collect::<Vec<_>>(), [a, b]);
    }

    #[test]
    fn selector_receives_latest_own_props() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let selector = StateSelector::new(move |_, props| {
            sink.borrow_mut().push(props.get("id").cloned().unwrap_or_default());
            Value::Map(props.clone())
        });
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, selector.clone(), mapping! { "id" => 1 });
        reg.recompute_all(&Mapping::new()).unwrap();
        reg.set_derivation(id, selector, mapping! { "id" => 2 });
        reg.recompute_all(&Mapping::new()).unwrap();
        assert_eq!(*seen.borrow(), [Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn failed_pass_leaves_published_snapshot() {
        let fail = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fail);
        let selector = StateSelector::fallible(DependsOn::Source, move |_, _| {
            if flag.get() {
                Err(SelectorError::new("boom"))
            } else {
                Ok(Value::Map(Mapping::new()))
            }
        });
        let mut reg = registry();
        let id = ConsumerId::new(3);
        reg.set_derivation(id, selector, Mapping::new());
        let published = reg.recompute_all(&Mapping::new()).unwrap();

        fail.set(true);
        let err = reg.recompute_all(&Mapping::new()).unwrap_err();
        assert!(matches!(err, PassError::Selector { consumer, .. } if consumer == id));
        assert!(Rc::ptr_eq(&published, &reg.snapshot()));
        assert_eq!(reg.pass_count(), 1);
    }

    #[test]
    fn seeded_primary_makes_next_pass_facsimile() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        let state = mapping! { "count" => 4 };
        reg.set_derivation(id, count_selector(), Mapping::new());
        let seeded = reg.seed(id, Value::Map(mapping! { "count" => 4 })).unwrap();
        let snap = reg.recompute_all(&state).unwrap();
        assert_eq!(snap.is_facsimile(id), Some(true));
        assert!(snap.merged(id).unwrap().same(&seeded));
        assert!(reg.seed(ConsumerId::new(99), Value::Null).is_none());
    }

    #[test]
    fn secondary_values_are_folded_under_appended_key() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, count_selector(), Mapping::new());
        reg.recompute_all(&mapping! { "count" => 1 }).unwrap();

        let total = StateSelector::new(|_, inputs| inputs.get("x").cloned().unwrap_or_default());
        assert!(reg.set_secondary(id, "total", total, Some(mapping! { "x" => 5 }), Value::Int(5)));
        let snap = reg.recompute_all(&mapping! { "count" => 1 }).unwrap();
        assert_eq!(snap.is_facsimile(id), Some(false));
        assert_eq!(snap.appended(id, "appended", "total"), Some(&Value::Int(5)));

        let again = reg.recompute_all(&mapping! { "count" => 1 }).unwrap();
        assert_eq!(again.is_facsimile(id), Some(true));
    }

    #[test]
    fn non_map_primary_with_secondary_is_installed_as_is() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, StateSelector::from_source(|_| Value::Int(3)), Mapping::new());
        reg.set_secondary(id, "n", StateSelector::from_source(|_| Value::Int(1)), None, Value::Int(1));
        let snap = reg.recompute_all(&Mapping::new()).unwrap();
        assert_eq!(snap.merged(id), Some(&Value::Int(3)));
    }

    #[test]
    #[traced_test]
    fn shape_violation_is_reported_once_per_change() {
        let log = DiagnosticLog::new(8);
        let mut reg = Registry::new(&ProviderConfig::default(), log.clone());
        let id = ConsumerId::new(2);
        reg.set_derivation(id, StateSelector::from_source(|_| Value::Int(3)), Mapping::new());
        reg.set_name(id, "Connect(Badge)");
        let snap = reg.recompute_all(&Mapping::new()).unwrap();
        reg.recompute_all(&Mapping::new()).unwrap();
        assert_eq!(snap.merged(id), Some(&Value::Int(3)));
        assert_eq!(log.len(), 1);
        assert!(logs_contain("Connect(Badge) (#2) must return a mapping, got int"));
    }

    #[test]
    fn shape_checks_can_be_disabled() {
        let log = DiagnosticLog::new(8);
        let config = ProviderConfig {
            check_shapes: false,
            ..ProviderConfig::default()
        };
        let mut reg = Registry::new(&config, log.clone());
        reg.set_derivation(ConsumerId::new(1), StateSelector::from_source(|_| Value::Null), Mapping::new());
        reg.recompute_all(&Mapping::new()).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn unset_is_idempotent() {
        let mut reg = registry();
        let id = ConsumerId::new(1);
        reg.set_derivation(id, count_selector(), Mapping::new());
        reg.recompute_all(&Mapping::new()).unwrap();
        assert!(reg.unset_derivation(id));
        assert!(!reg.unset_derivation(id));
        assert!(reg.get_snapshot_entry(id).is_none());
        let snap = reg.recompute_all(&Mapping::new()).unwrap();
        assert!(!snap.contains(id));
    }

    #[test]
    fn handle_rejects_reentrant_pass() {
        let handle = RegistryHandle::new(registry());
        let slot: Rc<RefCell<Option<RegistryHandle>>> = Rc::new(RefCell::new(None));
        let inner = Rc::clone(&slot);
        let outcome = Rc::new(RefCell::new(None));
        let record = Rc::clone(&outcome);
        let selector = StateSelector::from_source(move |state| {
            if let Some(handle) = inner.borrow().as_ref() {
                *record.borrow_mut() = Some(handle.recompute_all(state));
            }
            Value::Map(Mapping::new())
        });
        handle.set_derivation(ConsumerId::new(1), selector, Mapping::new());
        *slot.borrow_mut() = Some(handle.clone());

        assert!(handle.recompute_all(&Mapping::new()).is_ok());
        assert!(matches!(*outcome.borrow(), Some(Err(PassError::Reentrant))));
        // The guard is released after the pass.
        assert!(handle.recompute_all(&Mapping::new()).is_ok());
        slot.borrow_mut().take();
    }

    #[test]
    fn selectors_may_read_the_handle_during_a_pass() {
        let handle = RegistryHandle::new(registry());
        let reader = handle.clone();
        let selector = StateSelector::from_source(move |_| Value::Int(reader.len() as i64));
        handle.set_derivation(ConsumerId::new(1), selector, Mapping::new());
        let snap = handle.recompute_all(&Mapping::new()).unwrap();
        assert_eq!(snap.merged(ConsumerId::new(1)), Some(&Value::Int(1)));
    }
}
