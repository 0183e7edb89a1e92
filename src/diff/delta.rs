//! The single-item change: a pair of optional key-values, plus the
//! concatenation and inversion operations that make deltas composable.
//!
//! Values may be lazy - computed on first access, then memoized - so a
//! million-row diff can be walked without decoding every feature blob up
//! front.

use std::fmt;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;

use crate::errors::StrataError;

/// Delta flag: the change was made in the working copy - it is "dirty".
pub const WORKING_COPY_EDIT: u8 = 0x1;
/// Delta flag: the change is to a binary file.
pub const BINARY_FILE: u8 = 0x2;

type Thunk = Box<dyn FnOnce() -> Value + Send>;

/// A value that is either immediately present or computed on first access.
///
/// Deferred values evaluate under a once-lock, so concurrent readers observe
/// a single materialization and no shared mutability leaks out.
pub struct LazyValue {
    cell: OnceLock<Value>,
    thunk: Mutex<Option<Thunk>>,
}

impl LazyValue {
    pub fn immediate(value: Value) -> Self {
        let cell = OnceLock::new();
        cell.set(value).ok();
        LazyValue {
            cell,
            thunk: Mutex::new(None),
        }
    }

    pub fn deferred(f: impl FnOnce() -> Value + Send + 'static) -> Self {
        LazyValue {
            cell: OnceLock::new(),
            thunk: Mutex::new(Some(Box::new(f))),
        }
    }

    /// Materialize (if needed) and return the value.
    pub fn get(&self) -> &Value {
        self.cell.get_or_init(|| {
            let thunk = self
                .thunk
                .lock()
                .expect("lazy value lock poisoned")
                .take()
                .expect("deferred value with no thunk");
            thunk()
        })
    }

    /// True once the value has been computed or was immediate from the start.
    pub fn is_materialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(v) => write!(f, "LazyValue({v})"),
            None => write!(f, "LazyValue(<deferred>)"),
        }
    }
}

/// A key-value pair. A delta is made of two of these - one old, one new.
///
/// The key identifies which object changed (a meta item name, a stringified
/// primary key, or a tile name); the value is the changed object's entire
/// decoded contents.
#[derive(Debug)]
pub struct KeyValue {
    pub key: String,
    value: LazyValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        KeyValue {
            key: key.into(),
            value: LazyValue::immediate(value),
        }
    }

    pub fn lazy(key: impl Into<String>, value: LazyValue) -> Self {
        KeyValue {
            key: key.into(),
            value,
        }
    }

    /// Materialize (if needed) and return the value.
    pub fn value(&self) -> &Value {
        self.value.get()
    }

    pub fn is_materialized(&self) -> bool {
        self.value.is_materialized()
    }
}

/// The derived type of a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaType {
    Insert,
    Update,
    Delete,
}

impl DeltaType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Insert => "insert",
            DeltaType::Update => "update",
            DeltaType::Delete => "delete",
        }
    }
}

/// An object changing from old to new. Either old or new can be `None`, for
/// insert or delete operations.
///
/// If the old key differs from the new key the object moved in this delta,
/// i.e. a rename operation. Renames are tracked through concatenation: the
/// delta is stored under `old_key` falling back to `new_key`, and inversion
/// swaps the two sides. Deltas can be concatenated together if they refer to
/// the same object - e.g. a delete + insert = update (usually).
#[derive(Debug)]
pub struct Delta {
    pub old: Option<KeyValue>,
    pub new: Option<KeyValue>,
    pub flags: u8,
}

impl Delta {
    /// Build a delta from the two sides. At least one side must be present.
    pub fn new(old: Option<KeyValue>, new: Option<KeyValue>) -> Result<Delta, StrataError> {
        if old.is_none() && new.is_none() {
            return Err(StrataError::InvalidArgument("Empty delta".to_string()));
        }
        Ok(Delta {
            old,
            new,
            flags: 0,
        })
    }

    pub fn insert(new: KeyValue) -> Delta {
        Delta {
            old: None,
            new: Some(new),
            flags: 0,
        }
    }

    pub fn update(old: KeyValue, new: KeyValue) -> Delta {
        Delta {
            old: Some(old),
            new: Some(new),
            flags: 0,
        }
    }

    /// An update, unless the two values compare equal - then no delta at all.
    pub fn maybe_update(old: KeyValue, new: KeyValue) -> Option<Delta> {
        if old.key == new.key && old.value() == new.value() {
            None
        } else {
            Some(Delta::update(old, new))
        }
    }

    pub fn delete(old: KeyValue) -> Delta {
        Delta {
            old: Some(old),
            new: None,
            flags: 0,
        }
    }

    pub fn delta_type(&self) -> DeltaType {
        match (&self.old, &self.new) {
            (None, Some(_)) => DeltaType::Insert,
            (Some(_), None) => DeltaType::Delete,
            (Some(_), Some(_)) => DeltaType::Update,
            (None, None) => unreachable!("empty delta"),
        }
    }

    pub fn old_key(&self) -> Option<&str> {
        self.old.as_ref().map(|kv| kv.key.as_str())
    }

    pub fn new_key(&self) -> Option<&str> {
        self.new.as_ref().map(|kv| kv.key.as_str())
    }

    /// To be stored in a diff, a delta needs a single key. This mostly works,
    /// but isn't perfect when renames are involved.
    pub fn key(&self) -> &str {
        self.old_key()
            .or_else(|| self.new_key())
            .expect("empty delta")
    }

    /// True when both sides are present but the object changed key.
    pub fn is_rename(&self) -> bool {
        matches!(self.delta_type(), DeltaType::Update) && self.old_key() != self.new_key()
    }

    /// Swap old and new.
    pub fn invert(self) -> Delta {
        Delta {
            old: self.new,
            new: self.old,
            flags: self.flags,
        }
    }

    /// Concatenate this delta with the subsequent delta, returning the result
    /// as a single delta (or nothing, when the two cancel out).
    ///
    /// This method assumes the deltas being concatenated are related, i.e.
    /// that `self.new == other.old`. Don't try to concatenate arbitrary
    /// deltas together.
    ///
    /// ```text
    /// ins + ins -> conflict     upd + ins -> conflict     del + ins -> upd?
    /// ins + upd -> ins          upd + upd -> upd?         del + upd -> conflict
    /// ins + del -> noop         upd + del -> del          del + del -> conflict
    /// ```
    pub fn concat(self, other: Delta) -> Result<Option<Delta>, StrataError> {
        let flags = self.flags | other.flags;
        let conflict = |a: DeltaType, b: DeltaType| {
            StrataError::DeltaConflict(format!("{} + {}", a.as_str(), b.as_str()))
        };

        let (self_type, other_type) = (self.delta_type(), other.delta_type());
        let result = match self_type {
            DeltaType::Insert => match other_type {
                DeltaType::Insert => return Err(conflict(self_type, other_type)),
                DeltaType::Update => Some(Delta::insert(other.new.unwrap())),
                DeltaType::Delete => None,
            },
            DeltaType::Update => match other_type {
                DeltaType::Insert => return Err(conflict(self_type, other_type)),
                DeltaType::Update => Delta::maybe_update(self.old.unwrap(), other.new.unwrap()),
                DeltaType::Delete => Some(Delta::delete(self.old.unwrap())),
            },
            DeltaType::Delete => match other_type {
                DeltaType::Insert => Delta::maybe_update(self.old.unwrap(), other.new.unwrap()),
                _ => return Err(conflict(self_type, other_type)),
            },
        };

        Ok(result.map(|mut d| {
            d.flags = flags;
            d
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn kv(key: &str, value: serde_json::Value) -> KeyValue {
        KeyValue::new(key, value)
    }

    #[test]
    fn test_empty_delta_is_an_error() {
        assert!(matches!(
            Delta::new(None, None),
            Err(StrataError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_delta_types() {
        assert_eq!(
            Delta::insert(kv("1", json!("a"))).delta_type(),
            DeltaType::Insert
        );
        assert_eq!(
            Delta::delete(kv("1", json!("a"))).delta_type(),
            DeltaType::Delete
        );
        assert_eq!(
            Delta::update(kv("1", json!("a")), kv("1", json!("b"))).delta_type(),
            DeltaType::Update
        );
    }

    #[test]
    fn test_rename_detection() {
        let d = Delta::update(kv("1", json!("a")), kv("2", json!("a")));
        assert!(d.is_rename());
        assert_eq!(d.key(), "1");
    }

    #[test]
    fn test_double_inversion_is_identity() {
        let d = Delta::update(kv("1", json!("a")), kv("1", json!("b")));
        let dd = d.invert().invert();
        assert_eq!(dd.old.as_ref().unwrap().value(), &json!("a"));
        assert_eq!(dd.new.as_ref().unwrap().value(), &json!("b"));
    }

    #[test]
    fn test_concat_insert_then_update_is_insert() {
        let a = Delta::insert(kv("1", json!("a")));
        let b = Delta::update(kv("1", json!("a")), kv("1", json!("b")));
        let c = a.concat(b).unwrap().unwrap();
        assert_eq!(c.delta_type(), DeltaType::Insert);
        assert_eq!(c.new.as_ref().unwrap().value(), &json!("b"));
    }

    #[test]
    fn test_concat_insert_then_delete_is_noop() {
        let a = Delta::insert(kv("1", json!("a")));
        let b = Delta::delete(kv("1", json!("a")));
        assert!(a.concat(b).unwrap().is_none());
    }

    #[test]
    fn test_concat_update_then_update_cancels_when_equal() {
        let a = Delta::update(kv("1", json!("a")), kv("1", json!("b")));
        let b = Delta::update(kv("1", json!("b")), kv("1", json!("a")));
        assert!(a.concat(b).unwrap().is_none());
    }

    #[test]
    fn test_concat_conflicts() {
        let a = Delta::insert(kv("1", json!("a")));
        let b = Delta::insert(kv("1", json!("b")));
        assert!(matches!(a.concat(b), Err(StrataError::DeltaConflict(_))));

        let a = Delta::delete(kv("1", json!("a")));
        let b = Delta::delete(kv("1", json!("a")));
        assert!(matches!(a.concat(b), Err(StrataError::DeltaConflict(_))));
    }

    #[test]
    fn test_concat_or_combines_flags() {
        let mut a = Delta::insert(kv("1", json!("a")));
        a.flags = WORKING_COPY_EDIT;
        let mut b = Delta::update(kv("1", json!("a")), kv("1", json!("b")));
        b.flags = BINARY_FILE;
        let c = a.concat(b).unwrap().unwrap();
        assert_eq!(c.flags, WORKING_COPY_EDIT | BINARY_FILE);
    }

    #[test]
    fn test_lazy_value_memoizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let v = LazyValue::deferred(move || {
            c.fetch_add(1, Ordering::SeqCst);
            json!(42)
        });
        assert!(!v.is_materialized());
        assert_eq!(v.get(), &json!(42));
        assert_eq!(v.get(), &json!(42));
        assert!(v.is_materialized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
