#![forbid(unsafe_code)]

//! Call-counting wrappers for selectors, props selectors and merge
//! functions.
//!
//! A probe counts its own invocations; probes sharing a [`CallLog`] also
//! record their label in invocation order, which is how tests assert the
//! registry's recompute order.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use blackbox_core::{Mapping, Value};
use blackbox_runtime::{MergeFn, PropsSelector, Selector};

/// Shared, ordered record of probe labels.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl CallLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, label: &str) {
        self.entries.borrow_mut().push(label.to_owned());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

/// Counts invocations of whatever it wraps.
#[derive(Debug, Clone)]
pub struct SelectorProbe {
    label: Rc<str>,
    calls: Rc<Cell<usize>>,
    log: Option<CallLog>,
}

impl SelectorProbe {
    pub fn new(label: &str) -> Self {
        Self {
            label: Rc::from(label),
            calls: Rc::new(Cell::new(0)),
            log: None,
        }
    }

    /// Also record every invocation in `log`.
    #[must_use]
    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn reset(&self) {
        self.calls.set(0);
    }

    fn hit(&self) {
        self.calls.set(self.calls.get() + 1);
        if let Some(log) = &self.log {
            log.record(&self.label);
        }
    }

    /// `selector`, counted. The declared inputs are kept.
    pub fn wrap<S: 'static>(&self, selector: Selector<S>) -> Selector<S> {
        let probe = self.clone();
        let depends_on = selector.depends_on();
        Selector::fallible(depends_on, move |source, inputs| {
            probe.hit();
            selector.call(source, inputs)
        })
    }

    /// `selector`, counted.
    pub fn wrap_props(&self, selector: PropsSelector) -> PropsSelector {
        let probe = self.clone();
        PropsSelector::new(move |props| {
            probe.hit();
            selector.apply(props)
        })
    }

    /// `merge`, counted. Order sensitivity is kept.
    pub fn wrap_merge(&self, merge: MergeFn) -> MergeFn {
        let probe = self.clone();
        let sensitive = merge.is_order_sensitive();
        let body = move |state: &Value, dispatch: &Value, own: &Mapping| {
            probe.hit();
            merge.call(state, dispatch, own)
        };
        if sensitive {
            MergeFn::order_sensitive(body)
        } else {
            MergeFn::new(body)
        }
    }
}
