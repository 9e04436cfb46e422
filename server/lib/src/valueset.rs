//! Sets of attribute values. Every attribute on an entry stores its values
//! through a [`ValueSet`], which enforces set semantics under the value's
//! normalised form and provides the typed access the engine needs.

use std::collections::btree_set::Iter;
use std::collections::BTreeSet;

use crate::dn::Dn;
use crate::value::{PartialValue, Value};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueSet {
    inner: BTreeSet<Value>,
}

impl ValueSet {
    pub fn new(value: Value) -> Self {
        let mut inner = BTreeSet::new();
        inner.insert(value);
        ValueSet { inner }
    }

    pub fn empty() -> Self {
        ValueSet {
            inner: BTreeSet::new(),
        }
    }

    /// Insert a value, returning false when the value was already present.
    pub fn insert_checked(&mut self, value: Value) -> bool {
        self.inner.insert(value)
    }

    /// Remove any value equal to the assertion. Removing an absent value is
    /// a no-op: background repairs rely on this being idempotent.
    pub fn remove(&mut self, pv: &PartialValue) -> bool {
        let before = self.inner.len();
        self.inner.retain(|v| !v.equal_partial(pv));
        before != self.inner.len()
    }

    pub fn contains(&self, pv: &PartialValue) -> bool {
        self.inner.iter().any(|v| v.equal_partial(pv))
    }

    pub fn substring(&self, pv: &PartialValue) -> bool {
        self.inner.iter().any(|v| v.contains_partial(pv))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Value> {
        self.inner.iter()
    }

    pub fn first(&self) -> Option<&Value> {
        self.inner.iter().next()
    }

    /// The single value of a single-valued attribute. None when the set is
    /// empty or holds more than one value.
    pub fn to_single(&self) -> Option<&Value> {
        if self.inner.len() == 1 {
            self.inner.iter().next()
        } else {
            None
        }
    }

    pub fn as_dn_iter(&self) -> impl Iterator<Item = &Dn> {
        self.inner.iter().filter_map(|v| v.as_dn())
    }

    pub fn to_partialvalue_iter(&self) -> impl Iterator<Item = PartialValue> + '_ {
        self.inner.iter().map(|v| v.to_partialvalue())
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        ValueSet {
            inner: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ValueSet {
    type Item = &'a Value;
    type IntoIter = Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
