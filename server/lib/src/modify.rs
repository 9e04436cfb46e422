//! Modification expressions and validation. This is how `ModifyEvent`s store
//! and express the series of changes that should be applied to an entry.
//! These are expressed as "states" on what attribute-values should appear as
//! within the entry.

use std::slice;

use crate::prelude::*;
use crate::value::norm_attr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyValid;
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyInvalid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modify {
    /// This value *should* exist.
    Present(AttrString, Value),
    /// This value *should not* exist. Removing an absent value is a no-op,
    /// which keeps background repairs idempotent.
    Removed(AttrString, PartialValue),
    /// This attr *should not* exist.
    Purged(AttrString),
}

pub fn m_pres(attr: &str, v: &Value) -> Modify {
    Modify::Present(norm_attr(attr), v.clone())
}

pub fn m_remove(attr: &str, pv: &PartialValue) -> Modify {
    Modify::Removed(norm_attr(attr), pv.clone())
}

pub fn m_purge(attr: &str) -> Modify {
    Modify::Purged(norm_attr(attr))
}

impl Modify {
    pub fn attr(&self) -> &AttrString {
        match self {
            Modify::Present(a, _) | Modify::Removed(a, _) | Modify::Purged(a) => a,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyList<VALID> {
    // This is never read, it's just used for state machine enforcement.
    #[allow(dead_code)]
    valid: VALID,
    // The order of this list matters. Each change must be done in order.
    mods: Vec<Modify>,
}

impl<'a> IntoIterator for &'a ModifyList<ModifyValid> {
    type IntoIter = slice::Iter<'a, Modify>;
    type Item = &'a Modify;

    fn into_iter(self) -> Self::IntoIter {
        self.mods.iter()
    }
}

impl ModifyList<ModifyInvalid> {
    pub fn new() -> Self {
        ModifyList {
            valid: ModifyInvalid,
            mods: Vec::with_capacity(0),
        }
    }

    pub fn new_list(mods: Vec<Modify>) -> Self {
        ModifyList {
            valid: ModifyInvalid,
            mods,
        }
    }

    pub fn new_purge_and_set(attr: &str, v: Value) -> Self {
        Self::new_list(vec![m_purge(attr), Modify::Present(norm_attr(attr), v)])
    }

    pub fn new_append(attr: &str, v: Value) -> Self {
        Self::new_list(vec![Modify::Present(norm_attr(attr), v)])
    }

    pub fn new_remove(attr: &str, pv: PartialValue) -> Self {
        Self::new_list(vec![Modify::Removed(norm_attr(attr), pv)])
    }

    pub fn new_purge(attr: &str) -> Self {
        Self::new_list(vec![m_purge(attr)])
    }

    pub fn push_mod(&mut self, modify: Modify) {
        self.mods.push(modify)
    }

    pub fn validate(
        &self,
        schema: &dyn SchemaTransaction,
    ) -> Result<ModifyList<ModifyValid>, SchemaError> {
        let schema_attributes = schema.get_attributes();

        let res: Result<Vec<Modify>, _> = self
            .mods
            .iter()
            .map(|m| match m {
                Modify::Present(attr, value) => match schema_attributes.get(attr) {
                    Some(schema_a) => schema_a
                        .validate_value(value)
                        .map(|_| Modify::Present(attr.clone(), value.clone())),
                    None => Err(SchemaError::InvalidAttribute(attr.to_string())),
                },
                Modify::Removed(attr, value) => match schema_attributes.get(attr) {
                    Some(schema_a) => schema_a
                        .validate_partialvalue(value)
                        .map(|_| Modify::Removed(attr.clone(), value.clone())),
                    None => Err(SchemaError::InvalidAttribute(attr.to_string())),
                },
                Modify::Purged(attr) => match schema_attributes.get(attr) {
                    Some(_) => Ok(Modify::Purged(attr.clone())),
                    None => Err(SchemaError::InvalidAttribute(attr.to_string())),
                },
            })
            .collect();

        res.map(|valid_mods| ModifyList {
            valid: ModifyValid,
            mods: valid_mods,
        })
    }

}

impl ModifyList<ModifyValid> {
    pub fn iter(&self) -> slice::Iter<'_, Modify> {
        self.mods.iter()
    }
}

impl<VALID> ModifyList<VALID> {
    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mods(&self) -> &[Modify] {
        &self.mods
    }
}
