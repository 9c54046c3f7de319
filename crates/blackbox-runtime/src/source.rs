#![forbid(unsafe_code)]

//! Boundary with the external state source.
//!
//! The state source owns and mutates the shared state; blackbox only pulls
//! it. A source must:
//!
//! 1. Return the current state synchronously from [`StateSource::state`].
//! 2. Invoke every subscribed listener, with no payload, after each
//!    committed mutation (at most once per mutation).
//! 3. Never re-enter a registry pass from inside a listener while that pass
//!    is running.

use std::fmt;
use std::rc::Rc;

use blackbox_core::{Callback, Mapping};

/// External, externally-mutated state.
pub trait StateSource {
    /// Current state.
    fn state(&self) -> Mapping;

    /// Register a change listener. Dropping the returned guard unsubscribes.
    fn subscribe(&self, listener: Rc<dyn Fn()>) -> Subscription;

    /// The dispatch capability handed to dispatch derivations. Should return
    /// the same callback on every call so dispatch props keep their identity.
    fn dispatcher(&self) -> Callback;
}

/// Shared handle to a state source.
pub type SharedSource = Rc<dyn StateSource>;

/// RAII guard for a listener registration.
///
/// Dropping the guard runs the release closure exactly once.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release now instead of at drop.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn drop_releases_once() {
        let released = Rc::new(Cell::new(0));
        let r = Rc::clone(&released);
        {
            let _sub = Subscription::new(move || r.set(r.get() + 1));
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn explicit_unsubscribe_does_not_release_twice() {
        let released = Rc::new(Cell::new(0));
        let r = Rc::clone(&released);
        let sub = Subscription::new(move || r.set(r.get() + 1));
        sub.unsubscribe();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn noop_debug() {
        let sub = Subscription::noop();
        assert_eq!(format!("{sub:?}"), "Subscription { active: false }");
    }
}
