use std::borrow::Borrow;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::value::{AttrString, IndexType};

/// The identity of one index: which attribute, and which match type it
/// accelerates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdxKey {
    pub attr: AttrString,
    pub itype: IndexType,
}

impl IdxKey {
    pub fn new(attr: &str, itype: IndexType) -> Self {
        IdxKey {
            attr: AttrString::from(attr.to_lowercase()),
            itype,
        }
    }
}

/// A borrowed form of [`IdxKey`] so that map lookups never need to allocate
/// an owned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdxKeyRef<'a> {
    pub attr: &'a str,
    pub itype: &'a IndexType,
}

impl<'a> IdxKeyRef<'a> {
    pub fn new(attr: &'a str, itype: &'a IndexType) -> Self {
        IdxKeyRef { attr, itype }
    }

    pub fn to_key(&self) -> IdxKey {
        IdxKey {
            attr: self.attr.into(),
            itype: *self.itype,
        }
    }
}

pub trait IdxKeyToRef {
    fn keyref(&self) -> IdxKeyRef<'_>;
}

impl<'a> IdxKeyToRef for IdxKeyRef<'a> {
    fn keyref(&self) -> IdxKeyRef<'_> {
        // Copy the self.
        *self
    }
}

impl IdxKeyToRef for IdxKey {
    fn keyref(&self) -> IdxKeyRef<'_> {
        IdxKeyRef {
            attr: self.attr.as_str(),
            itype: &self.itype,
        }
    }
}

impl<'a> Borrow<dyn IdxKeyToRef + 'a> for IdxKey {
    fn borrow(&self) -> &(dyn IdxKeyToRef + 'a) {
        self
    }
}

impl<'a> PartialEq for (dyn IdxKeyToRef + 'a) {
    fn eq(&self, other: &Self) -> bool {
        self.keyref().eq(&other.keyref())
    }
}

impl<'a> Eq for (dyn IdxKeyToRef + 'a) {}

impl<'a> Hash for (dyn IdxKeyToRef + 'a) {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keyref().hash(state)
    }
}
