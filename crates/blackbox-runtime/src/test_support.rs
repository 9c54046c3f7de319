#![forbid(unsafe_code)]

//! Minimal in-crate state source for unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use blackbox_core::{Callback, Mapping, Value};

use crate::source::{SharedSource, StateSource, Subscription};

type ListenerSlot = Rc<RefCell<Option<Rc<dyn Fn()>>>>;

/// A settable state with one listener slot and a recording dispatcher.
pub(crate) struct MemorySource {
    state: RefCell<Mapping>,
    listener: ListenerSlot,
    dispatched: Rc<RefCell<Vec<Value>>>,
    dispatcher: Callback,
}

impl MemorySource {
    pub(crate) fn new(state: Mapping) -> Rc<Self> {
        let dispatched = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&dispatched);
        Rc::new(Self {
            state: RefCell::new(state),
            listener: Rc::default(),
            dispatched,
            dispatcher: Callback::new(move |args| {
                sink.borrow_mut()
                    .push(args.first().cloned().unwrap_or_default());
                Value::Null
            }),
        })
    }

    pub(crate) fn shared(self: &Rc<Self>) -> SharedSource {
        Rc::clone(self) as SharedSource
    }

    /// Replace the state and notify the listener.
    pub(crate) fn set(&self, state: Mapping) {
        *self.state.borrow_mut() = state;
        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    pub(crate) fn dispatched(&self) -> Vec<Value> {
        self.dispatched.borrow().clone()
    }
}

impl StateSource for MemorySource {
    fn state(&self) -> Mapping {
        self.state.borrow().clone()
    }

    fn subscribe(&self, listener: Rc<dyn Fn()>) -> Subscription {
        *self.listener.borrow_mut() = Some(listener);
        let slot = Rc::clone(&self.listener);
        Subscription::new(move || {
            slot.borrow_mut().take();
        })
    }

    fn dispatcher(&self) -> Callback {
        self.dispatcher.clone()
    }
}
