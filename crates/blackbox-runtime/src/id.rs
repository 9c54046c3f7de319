#![forbid(unsafe_code)]

//! Consumer identifiers and the tree-scoped allocator that hands them out.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Identifier of one consumer's derivation slot.
///
/// Unique for the lifetime of the [`IdAllocator`] that produced it; never
/// reused, even after the consumer unmounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// Wrap a raw id. Intended for tests and for hosts that allocate ids
    /// themselves.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id counter owned by the tree root.
///
/// Clones share the counter, so handing a clone to every descendant keeps
/// ids unique across the whole tree without a process-wide global.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: Rc<Cell<u64>>,
}

impl IdAllocator {
    /// A fresh counter. The first id handed out is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: Rc::new(Cell::new(1)),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> ConsumerId {
        let id = self.next.get();
        self.next.set(id + 1);
        ConsumerId(id)
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    #[must_use]
    pub fn peek(&self) -> ConsumerId {
        ConsumerId(self.next.get())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
