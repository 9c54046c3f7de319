#![forbid(unsafe_code)]

//! In-memory reducer store implementing [`StateSource`].
//!
//! `dispatch(action)` runs the reducer, installs the returned state and
//! then notifies every listener in subscription order, once per dispatch.
//! A reducer that returns its input unchanged still notifies; a pure
//! provider turns that into a skipped pass.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use blackbox_core::{Callback, Mapping, Value};
use blackbox_runtime::{SharedSource, StateSource, Subscription};

type Reducer = dyn Fn(&Mapping, &Value) -> Mapping;
type Listeners = Rc<RefCell<IndexMap<u64, Rc<dyn Fn()>>>>;

/// A reducer-driven state container.
pub struct Store {
    state: RefCell<Mapping>,
    reducer: Box<Reducer>,
    listeners: Listeners,
    next_listener: Cell<u64>,
    dispatches: Cell<usize>,
    dispatcher: Callback,
}

impl Store {
    /// A store starting at `initial`.
    pub fn new(initial: Mapping, reducer: impl Fn(&Mapping, &Value) -> Mapping + 'static) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Store>| {
            let weak = weak.clone();
            Self {
                state: RefCell::new(initial),
                reducer: Box::new(reducer),
                listeners: Rc::default(),
                next_listener: Cell::new(0),
                dispatches: Cell::new(0),
                dispatcher: Callback::new(move |args| {
                    let action = args.first().cloned().unwrap_or_default();
                    match weak.upgrade() {
                        Some(store) => store.dispatch(action),
                        None => Value::Null,
                    }
                }),
            }
        })
    }

    /// A store whose reducer ignores every action.
    pub fn fixed(initial: Mapping) -> Rc<Self> {
        Self::new(initial, |state, _| state.clone())
    }

    /// The store as a shared state source.
    pub fn shared(self: &Rc<Self>) -> SharedSource {
        Rc::clone(self) as SharedSource
    }

    /// Reduce `action`, then notify. Returns the action.
    pub fn dispatch(&self, action: Value) -> Value {
        let next = {
            let current = self.state.borrow();
            (self.reducer)(&current, &action)
        };
        *self.state.borrow_mut() = next;
        self.dispatches.set(self.dispatches.get() + 1);
        tracing::trace!(dispatches = self.dispatches.get(), "action reduced");
        self.notify();
        action
    }

    /// Install `state` without running the reducer, then notify.
    pub fn replace_state(&self, state: Mapping) {
        *self.state.borrow_mut() = state;
        self.notify();
    }

    /// Notify every listener in subscription order.
    pub fn notify(&self) {
        let listeners: Vec<Rc<dyn Fn()>> = self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Number of dispatched actions.
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.get()
    }
}

impl StateSource for Store {
    fn state(&self) -> Mapping {
        self.state.borrow().clone()
    }

    fn subscribe(&self, listener: Rc<dyn Fn()>) -> Subscription {
        let key = self.next_listener.get();
        self.next_listener.set(key + 1);
        self.listeners.borrow_mut().insert(key, listener);
        let listeners = Rc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.borrow_mut().shift_remove(&key);
            }
        })
    }

    fn dispatcher(&self) -> Callback {
        self.dispatcher.clone()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &*self.state.borrow())
            .field("listeners", &self.listener_count())
            .field("dispatches", &self.dispatches.get())
            .finish()
    }
}

/// Reducer over `{count: int}` understanding `{type: "INCREMENT", by?}`
/// and `{type: "DECREMENT", by?}`.
pub fn counter_reducer(state: &Mapping, action: &Value) -> Mapping {
    let Some(action) = action.as_map() else {
        return state.clone();
    };
    let by = action.get("by").and_then(Value::as_int).unwrap_or(1);
    let count = state.get("count").and_then(Value::as_int).unwrap_or(0);
    match action.get("type").and_then(Value::as_str) {
        Some("INCREMENT") => state.with("count", count + by),
        Some("DECREMENT") => state.with("count", count - by),
        _ => state.clone(),
    }
}
