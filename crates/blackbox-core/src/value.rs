#![forbid(unsafe_code)]

//! Shared, reference-counted values.
//!
//! Everything that flows through the derivation cache is a [`Value`]. The
//! type is deliberately small: scalars, strings, and three shared containers
//! ([`Value::List`], [`Value::Map`], [`Value::Func`]).
//!
//! # Identity
//!
//! Change detection in blackbox is identity based. [`Value::same`] is the
//! single comparison primitive:
//!
//! - `Null`, `Bool`, `Int`, `Float` and `Str` compare by value.
//! - `List`, `Map` and `Func` compare by reference (`Rc::ptr_eq`).
//!
//! Cloning a container shares it, so a clone is always `same` as its
//! source. A selector that wants its consumers to observe a change must
//! therefore return a *new* container; mutating the contents of a container
//! that was already handed out is invisible to every check in this crate.
//!
//! # Invariants
//!
//! 1. A [`Mapping`] is immutable once built. All "modifying" methods return
//!    a fresh instance with a fresh identity.
//! 2. Iteration order of a [`Mapping`] is insertion order.
//! 3. `PartialEq` for [`Value`] is [`Value::same`], never deep equality.

use std::fmt;
use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

/// Key type for [`Mapping`] entries.
pub type Key = Rc<str>;

type Entries = IndexMap<Key, Value, RandomState>;

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// A shared function value (dispatch capabilities, action creators).
///
/// Two callbacks are the same only if they are clones of one another.
#[derive(Clone)]
pub struct Callback(Rc<dyn Fn(&[Value]) -> Value>);

impl Callback {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self(Rc::new(f))
    }

    /// Invoke the callback.
    pub fn call(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }

    /// Whether both handles point at the same closure.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Rc::as_ptr(&self.0).cast::<()>())
    }
}

// ---------------------------------------------------------------------------
// ValueKind
// ---------------------------------------------------------------------------

/// Discriminant of a [`Value`], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Func,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "string",
            Self::List => "list",
            Self::Map => "mapping",
            Self::Func => "function",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A value produced or consumed by a derivation.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<[Value]>),
    Map(Mapping),
    Func(Callback),
}

impl Value {
    /// Build a list value. The list gets a fresh identity.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// The discriminant of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
            Self::Func(_) => ValueKind::Func,
        }
    }

    /// Identity comparison: by value for scalars and strings, by reference
    /// for containers and callbacks. Values of different kinds are never
    /// the same.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => a.ptr_eq(b),
            (Self::Func(a), Self::Func(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Structural comparison, recursing into lists and mappings.
    ///
    /// Change detection never uses this; it exists for assertions and
    /// debugging. Callbacks still compare by reference.
    #[must_use]
    pub fn deep_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y))
            }
            (Self::Map(a), Self::Map(b)) => a.deep_eq(b),
            _ => self.same(other),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_func(&self) -> Option<&Callback> {
        match self {
            Self::Func(cb) => Some(cb),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => f.debug_list().entries(items.iter()).finish(),
            Self::Map(m) => fmt::Debug::fmt(m, f),
            Self::Func(cb) => fmt::Debug::fmt(cb, f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(Rc::from(value))
    }
}

impl From<Mapping> for Value {
    fn from(value: Mapping) -> Self {
        Self::Map(value)
    }
}

impl From<Callback> for Value {
    fn from(value: Callback) -> Self {
        Self::Func(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(Rc::from(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// An immutable, shared, insertion-ordered key/value mapping.
///
/// `Mapping::clone` is a reference-count bump: the clone shares identity
/// with its source. Use [`Mapping::with`], [`Mapping::without`] or
/// [`Mapping::merge_right`] to derive new mappings.
#[derive(Clone, Default)]
pub struct Mapping(Rc<Entries>);

impl Mapping {
    /// Create an empty mapping with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping from key/value pairs. Later duplicates overwrite
    /// earlier ones but keep the first position.
    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let mut map = Entries::default();
        for (k, v) in entries {
            map.insert(k.into(), v.into());
        }
        Self(Rc::new(map))
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the mapping has no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| &**k)
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (&**k, v))
    }

    /// Whether both handles share the same allocation.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// A new mapping with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        let mut map = (*self.0).clone();
        map.insert(key.into(), value.into());
        Self(Rc::new(map))
    }

    /// A new mapping without `key`. Order of the remaining keys is kept.
    #[must_use]
    pub fn without(&self, key: &str) -> Self {
        let mut map = (*self.0).clone();
        map.shift_remove(key);
        Self(Rc::new(map))
    }

    /// Right-biased overwrite merge: keys from later layers replace keys
    /// from earlier ones. Always returns a fresh mapping.
    #[must_use]
    pub fn merge_right(layers: &[&Mapping]) -> Self {
        let capacity = layers.iter().map(|m| m.len()).sum();
        let mut map = Entries::with_capacity_and_hasher(capacity, RandomState::default());
        for layer in layers {
            for (k, v) in layer.0.iter() {
                map.insert(Rc::clone(k), v.clone());
            }
        }
        Self(Rc::new(map))
    }

    /// Structural comparison, see [`Value::deep_eq`].
    #[must_use]
    pub fn deep_eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.len() == other.len()
            && self
                .0
                .iter()
                .all(|(k, v)| other.0.get(k).is_some_and(|o| v.deep_eq(o)))
    }
}

impl<K: Into<Key>, V: Into<Value>> FromIterator<(K, V)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

/// Build a [`Mapping`] from `key => value` pairs.
///
/// # Examples
///
/// ```
/// use blackbox_core::{mapping, Value};
///
/// let m = mapping! { "count" => 1, "label" => "one" };
/// assert_eq!(m.get("count"), Some(&Value::Int(1)));
/// assert_eq!(m.len(), 2);
/// ```
#[macro_export]
macro_rules! mapping {
    () => {
        $crate::Mapping::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::Mapping::from_entries([$(($key, $crate::Value::from($value))),+])
    };
}

// ---------------------------------------------------------------------------
// Serde
// ---------------------------------------------------------------------------

#[cfg(feature = "serde")]
mod serde_impl {
    use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

    use super::{Mapping, Value};

    impl Serialize for Value {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Value::Null => serializer.serialize_unit(),
                Value::Bool(b) => serializer.serialize_bool(*b),
                Value::Int(i) => serializer.serialize_i64(*i),
                Value::Float(x) => serializer.serialize_f64(*x),
                Value::Str(s) => serializer.serialize_str(s),
                Value::List(items) => {
                    let mut seq = serializer.serialize_seq(Some(items.len()))?;
                    for item in items.iter() {
                        seq.serialize_element(item)?;
                    }
                    seq.end()
                }
                Value::Map(m) => m.serialize(serializer),
                Value::Func(_) => serializer.serialize_str("<callback>"),
            }
        }
    }

    impl Serialize for Mapping {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(self.len()))?;
            for (k, v) in self.iter() {
                map.serialize_entry(k, v)?;
            }
            map.end()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
