//! Entries are the fundamental unit of storage. An entry is identified by
//! its DN and holds a map of attribute-value sets. Entries move through a
//! pair of typestates as they are processed:
//!
//! ```text
//! EntryInit -> EntryInvalid -> EntryValid -> EntrySealed
//!                  ^                             |
//!                  +--------- invalidate --------+
//! ```
//!
//! The VALID parameter tracks schema validation, the STATE parameter tracks
//! whether the entry has been committed to a backend (and so carries its
//! storage id). Only sealed entries cross the backend boundary, and only
//! invalid entries accept mutation.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::filter::FilterComp;
use crate::prelude::*;
use crate::value::norm_attr;

#[derive(Debug, Clone)]
pub struct EntryInit;
#[derive(Debug, Clone)]
pub struct EntryInvalid;
#[derive(Debug, Clone)]
pub struct EntryValid;
#[derive(Debug, Clone)]
pub struct EntrySealed;

#[derive(Debug, Clone)]
pub struct EntryNew;
#[derive(Debug, Clone)]
pub struct EntryCommitted {
    id: u64,
}

pub type EntryInitNew = Entry<EntryInit, EntryNew>;
pub type EntryInvalidNew = Entry<EntryInvalid, EntryNew>;
pub type EntryInvalidCommitted = Entry<EntryInvalid, EntryCommitted>;
pub type EntryValidNew = Entry<EntryValid, EntryNew>;
pub type EntryValidCommitted = Entry<EntryValid, EntryCommitted>;
pub type EntrySealedNew = Entry<EntrySealed, EntryNew>;
pub type EntrySealedCommitted = Entry<EntrySealed, EntryCommitted>;

#[derive(Debug, Clone)]
pub struct Entry<VALID, STATE> {
    valid: VALID,
    state: STATE,
    dn: Dn,
    attrs: BTreeMap<AttrString, ValueSet>,
}

impl<VALID, STATE> PartialEq for Entry<VALID, STATE> {
    fn eq(&self, other: &Self) -> bool {
        self.dn == other.dn && self.attrs == other.attrs
    }
}

impl<VALID, STATE> Eq for Entry<VALID, STATE> {}

// ===== accessors shared by every state =====

impl<VALID, STATE> Entry<VALID, STATE> {
    pub fn get_dn(&self) -> &Dn {
        &self.dn
    }

    /// A short human readable identifier for logging.
    pub fn get_display_id(&self) -> String {
        self.dn.to_string()
    }

    pub fn get_ava_set(&self, attr: &str) -> Option<&ValueSet> {
        self.attrs.get(&norm_attr(attr))
    }

    pub fn get_ava_single(&self, attr: &str) -> Option<&Value> {
        self.get_ava_set(attr).and_then(|vs| vs.to_single())
    }

    pub fn get_ava_single_dn(&self, attr: &str) -> Option<&Dn> {
        self.get_ava_single(attr).and_then(|v| v.as_dn())
    }

    pub fn get_ava_single_utf8(&self, attr: &str) -> Option<&str> {
        self.get_ava_single(attr).and_then(|v| v.as_str())
    }

    pub fn get_uuid(&self) -> Option<Uuid> {
        self.get_ava_single(ATTR_ENTRYUUID).and_then(|v| v.as_uuid())
    }

    pub fn attribute_pres(&self, attr: &str) -> bool {
        self.attrs.contains_key(&norm_attr(attr))
    }

    pub fn attribute_equality(&self, attr: &str, pv: &PartialValue) -> bool {
        self.get_ava_set(attr)
            .map(|vs| vs.contains(pv))
            .unwrap_or(false)
    }

    pub fn attribute_substring(&self, attr: &str, pv: &PartialValue) -> bool {
        self.get_ava_set(attr)
            .map(|vs| vs.substring(pv))
            .unwrap_or(false)
    }

    /// The object classes of this entry, normalised.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .get(ATTR_OBJECTCLASS)
            .into_iter()
            .flat_map(|vs| vs.iter())
            .filter_map(|v| v.as_str())
    }

    pub fn iter_attrs(&self) -> impl Iterator<Item = (&AttrString, &ValueSet)> {
        self.attrs.iter()
    }

    /// Apply a filter to this entry without index support. This is the
    /// authoritative matching test the backend falls back to whenever the
    /// candidate set is only partially resolved.
    pub fn entry_match_no_index(&self, filter: &Filter<FilterValid>) -> bool {
        self.match_comp(filter.inner())
    }

    pub(crate) fn match_comp(&self, fc: &FilterComp) -> bool {
        match fc {
            FilterComp::Eq(attr, pv) => self.attribute_equality(attr, pv),
            FilterComp::Sub(attr, pv) => self.attribute_substring(attr, pv),
            FilterComp::Pres(attr) => self.attribute_pres(attr),
            FilterComp::And(fs) => fs.iter().all(|f| self.match_comp(f)),
            FilterComp::Or(fs) => fs.iter().any(|f| self.match_comp(f)),
            FilterComp::Not(f) => !self.match_comp(f),
        }
    }
}

// ===== construction =====

impl Entry<EntryInit, EntryNew> {
    pub fn new_init(dn: Dn) -> Self {
        Entry {
            valid: EntryInit,
            state: EntryNew,
            dn,
            attrs: BTreeMap::new(),
        }
    }

    pub fn add_ava(&mut self, attr: &str, value: Value) {
        add_ava_inner(&mut self.attrs, attr, value);
    }

    pub fn set_ava(&mut self, attr: &str, vs: ValueSet) {
        self.attrs.insert(norm_attr(attr), vs);
    }

    pub fn into_invalid(self) -> Entry<EntryInvalid, EntryNew> {
        Entry {
            valid: EntryInvalid,
            state: EntryNew,
            dn: self.dn,
            attrs: self.attrs,
        }
    }
}

fn add_ava_inner(attrs: &mut BTreeMap<AttrString, ValueSet>, attr: &str, value: Value) {
    let attr = norm_attr(attr);
    if let Some(vs) = attrs.get_mut(&attr) {
        vs.insert_checked(value);
    } else {
        attrs.insert(attr, ValueSet::new(value));
    }
}

// ===== mutation, any storage state =====

impl<STATE> Entry<EntryInvalid, STATE> {
    pub fn add_ava(&mut self, attr: &str, value: Value) {
        add_ava_inner(&mut self.attrs, attr, value);
    }

    pub fn set_ava(&mut self, attr: &str, vs: ValueSet) {
        self.attrs.insert(norm_attr(attr), vs);
    }

    /// Remove a single value. Removing an absent value is a no-op.
    pub fn remove_ava(&mut self, attr: &str, pv: &PartialValue) {
        let attr = norm_attr(attr);
        let empty = if let Some(vs) = self.attrs.get_mut(&attr) {
            vs.remove(pv);
            vs.is_empty()
        } else {
            false
        };
        if empty {
            self.attrs.remove(&attr);
        }
    }

    pub fn purge_ava(&mut self, attr: &str) {
        self.attrs.remove(&norm_attr(attr));
    }

    pub fn apply_modlist(&mut self, modlist: &ModifyList<ModifyValid>) {
        for m in modlist {
            match m {
                Modify::Present(attr, value) => add_ava_inner(&mut self.attrs, attr, value.clone()),
                Modify::Removed(attr, pv) => self.remove_ava(attr, pv),
                Modify::Purged(attr) => self.purge_ava(attr),
            }
        }
    }

    /// Move this entry to a new DN, updating the naming attribute values:
    /// the new RDN value is added, and when `delete_old_rdn` is set the old
    /// RDN value is removed.
    pub fn set_dn(&mut self, new_dn: Dn, delete_old_rdn: bool, schema: &dyn SchemaTransaction) {
        let old_rdn = self.dn.rdn().clone();
        let new_rdn = new_dn.rdn().clone();

        let syntax = schema.syntax_of(new_rdn.attr());
        if let Ok(v) = Value::new_for_syntax(new_rdn.value(), syntax) {
            add_ava_inner(&mut self.attrs, new_rdn.attr(), v);
        }

        if delete_old_rdn && old_rdn != new_rdn {
            let syntax = schema.syntax_of(old_rdn.attr());
            if let Ok(pv) = PartialValue::new_for_syntax(old_rdn.value(), syntax) {
                self.remove_ava(old_rdn.attr(), &pv);
            }
        }

        self.dn = new_dn;
    }

    pub fn validate(
        self,
        schema: &dyn SchemaTransaction,
    ) -> Result<Entry<EntryValid, STATE>, SchemaError> {
        // Resolve the classes of the entry first.
        let classes: Vec<&SchemaClass> = {
            let mut resolved = Vec::new();
            let mut unknown = Vec::new();
            let Some(class_vs) = self.attrs.get(ATTR_OBJECTCLASS) else {
                return Err(SchemaError::NoClassFound);
            };
            for c in class_vs.iter().filter_map(|v| v.as_str()) {
                match schema.class(c) {
                    Some(cls) => resolved.push(cls),
                    None => unknown.push(c.to_string()),
                }
            }
            if !unknown.is_empty() {
                return Err(SchemaError::InvalidClass(unknown));
            }
            if resolved.is_empty() {
                return Err(SchemaError::NoClassFound);
            }
            resolved
        };

        let allows_any = classes.iter().any(|c| c.allows_any);

        // Every attribute must be known, carry valid values, and - unless it
        // is operational or the entry is extensible - be allowed by a class.
        for (attr, vs) in self.attrs.iter() {
            let Some(schema_a) = schema.attribute_type(attr) else {
                return Err(SchemaError::InvalidAttribute(attr.to_string()));
            };
            if vs.is_empty() {
                return Err(SchemaError::InvalidAttributeSyntax(attr.to_string()));
            }
            if !schema_a.multivalue && vs.len() > 1 {
                return Err(SchemaError::InvalidAttributeSyntax(attr.to_string()));
            }
            for v in vs {
                schema_a.validate_value(v)?;
            }
            if attr.as_str() == ATTR_OBJECTCLASS || schema_a.operational || allows_any {
                continue;
            }
            let allowed = classes
                .iter()
                .any(|c| c.must.contains(attr) || c.may.contains(attr));
            if !allowed {
                return Err(SchemaError::AttributeNotAllowed(attr.to_string()));
            }
        }

        // Every must of every class has to be present.
        let missing: Vec<String> = classes
            .iter()
            .flat_map(|c| c.must.iter())
            .filter(|a| !self.attrs.contains_key(*a))
            .map(|a| a.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingMustAttribute(missing));
        }

        // The naming attribute value must appear on the entry.
        let rdn = self.dn.rdn();
        let syntax = schema.syntax_of(rdn.attr());
        let named = PartialValue::new_for_syntax(rdn.value(), syntax)
            .map(|pv| self.attribute_equality(rdn.attr(), &pv))
            .unwrap_or(false);
        if !named {
            return Err(SchemaError::RdnValueMissing(rdn.attr().to_string()));
        }

        Ok(Entry {
            valid: EntryValid,
            state: self.state,
            dn: self.dn,
            attrs: self.attrs,
        })
    }
}

impl<STATE> Entry<EntryValid, STATE> {
    pub fn seal(self) -> Entry<EntrySealed, STATE> {
        Entry {
            valid: EntrySealed,
            state: self.state,
            dn: self.dn,
            attrs: self.attrs,
        }
    }
}

impl Entry<EntrySealed, EntryNew> {
    /// Commit this entry into a backend under the given storage id. Only the
    /// backend may do this.
    pub(crate) fn into_committed(self, id: u64) -> EntrySealedCommitted {
        Entry {
            valid: EntrySealed,
            state: EntryCommitted { id },
            dn: self.dn,
            attrs: self.attrs,
        }
    }
}

impl Entry<EntrySealed, EntryCommitted> {
    pub fn get_id(&self) -> u64 {
        self.state.id
    }

    pub fn invalidate(self) -> Entry<EntryInvalid, EntryCommitted> {
        Entry {
            valid: EntryInvalid,
            state: self.state,
            dn: self.dn,
            attrs: self.attrs,
        }
    }

    /// Rewrite the DN of a committed entry during a subtree move. The
    /// attribute content is untouched; only the location changes. Backend
    /// internal.
    pub(crate) fn with_rebased_dn(&self, old_base: &Dn, new_base: &Dn) -> Option<Self> {
        self.dn.rebase(old_base, new_base).map(|dn| Entry {
            valid: EntrySealed,
            state: self.state.clone(),
            dn,
            attrs: self.attrs.clone(),
        })
    }

    /// Reconstruct a committed entry from its durable form. Backend internal.
    pub(crate) fn from_parts(id: u64, dn: Dn, attrs: BTreeMap<AttrString, ValueSet>) -> Self {
        Entry {
            valid: EntrySealed,
            state: EntryCommitted { id },
            dn,
            attrs,
        }
    }
}

#[cfg(test)]
impl Entry<EntryInit, EntryNew> {
    /// Shortcut used by tests that compare against stored entries.
    pub fn into_sealed_committed(self, id: u64) -> EntrySealedCommitted {
        Entry {
            valid: EntrySealed,
            state: EntryCommitted { id },
            dn: self.dn,
            attrs: self.attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use crate::schema::Schema;

    fn person(dn: &str, uid: &str) -> EntryInitNew {
        entry_init!(
            dn,
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON)),
            (ATTR_CN, Value::new_iutf8(uid)),
            (ATTR_SN, Value::new_iutf8("tester")),
            (ATTR_UID, Value::new_iutf8(uid))
        )
    }

    #[test]
    fn test_entry_ava_access() {
        let e = person("uid=u1,ou=people,dc=example,dc=com", "u1");
        assert!(e.attribute_pres("UID"));
        assert!(e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("U1")));
        assert!(!e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("u2")));
        assert_eq!(e.get_ava_single_utf8(ATTR_SN), Some("tester"));
        assert_eq!(e.classes().collect::<Vec<_>>(), vec!["inetorgperson"]);
    }

    #[test]
    fn test_entry_validate_ok() {
        let schema = Schema::core();
        let s = schema.read();
        let e = person("uid=u1,ou=people,dc=example,dc=com", "u1").into_invalid();
        assert!(e.validate(&s).is_ok());
    }

    #[test]
    fn test_entry_validate_rejects() {
        let schema = Schema::core();
        let s = schema.read();

        // No class.
        let e = entry_init!(
            "uid=u1,dc=example,dc=com",
            (ATTR_UID, Value::new_iutf8("u1"))
        )
        .into_invalid();
        assert_eq!(e.validate(&s), Err(SchemaError::NoClassFound));

        // Unknown class.
        let e = entry_init!(
            "uid=u1,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8("martian")),
            (ATTR_UID, Value::new_iutf8("u1"))
        )
        .into_invalid();
        assert_eq!(
            e.validate(&s),
            Err(SchemaError::InvalidClass(vec!["martian".to_string()]))
        );

        // Missing must (person requires sn).
        let e = entry_init!(
            "cn=p,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_PERSON)),
            (ATTR_CN, Value::new_iutf8("p"))
        )
        .into_invalid();
        assert_eq!(
            e.validate(&s),
            Err(SchemaError::MissingMustAttribute(vec![ATTR_SN.to_string()]))
        );

        // Attribute not allowed by any class.
        let e = entry_init!(
            "cn=p,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_PERSON)),
            (ATTR_CN, Value::new_iutf8("p")),
            (ATTR_SN, Value::new_iutf8("q")),
            (ATTR_MAIL, Value::new_iutf8("p@example.com"))
        )
        .into_invalid();
        assert_eq!(
            e.validate(&s),
            Err(SchemaError::AttributeNotAllowed(ATTR_MAIL.to_string()))
        );

        // Naming value must appear on the entry.
        let e = entry_init!(
            "uid=u1,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON)),
            (ATTR_CN, Value::new_iutf8("other")),
            (ATTR_SN, Value::new_iutf8("t")),
            (ATTR_UID, Value::new_iutf8("different"))
        )
        .into_invalid();
        assert_eq!(
            e.validate(&s),
            Err(SchemaError::RdnValueMissing(ATTR_UID.to_string()))
        );
    }

    #[test]
    fn test_entry_validate_extensible() {
        let schema = Schema::core();
        let s = schema.read();
        let e = entry_init!(
            "cn=thing,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_EXTENSIBLEOBJECT)),
            (ATTR_CN, Value::new_iutf8("thing")),
            (ATTR_MAIL, Value::new_iutf8("thing@example.com"))
        )
        .into_invalid();
        assert!(e.validate(&s).is_ok());
    }

    #[test]
    fn test_entry_apply_modlist() {
        let schema = Schema::core();
        let s = schema.read();
        let mut e = person("uid=u1,ou=people,dc=example,dc=com", "u1").into_invalid();

        let ml = ModifyList::new_list(vec![
            m_pres(ATTR_MAIL, &Value::new_iutf8("u1@example.com")),
            m_pres(ATTR_MAIL, &Value::new_iutf8("u1@alt.example.com")),
        ])
        .validate(&s)
        .unwrap();
        e.apply_modlist(&ml);
        assert_eq!(e.get_ava_set(ATTR_MAIL).map(|vs| vs.len()), Some(2));

        let ml = ModifyList::new_remove(ATTR_MAIL, PartialValue::new_iutf8("u1@example.com"))
            .validate(&s)
            .unwrap();
        e.apply_modlist(&ml);
        assert_eq!(e.get_ava_set(ATTR_MAIL).map(|vs| vs.len()), Some(1));

        // Removing an absent value is a no-op.
        e.apply_modlist(&ml);
        assert_eq!(e.get_ava_set(ATTR_MAIL).map(|vs| vs.len()), Some(1));

        let ml = ModifyList::new_purge(ATTR_MAIL).validate(&s).unwrap();
        e.apply_modlist(&ml);
        assert!(!e.attribute_pres(ATTR_MAIL));
    }

    #[test]
    fn test_entry_set_dn_updates_naming_values() {
        let schema = Schema::core();
        let s = schema.read();
        let mut e = person("uid=u1,ou=people,dc=example,dc=com", "u1").into_invalid();

        e.set_dn(dn!("uid=u9,ou=people,dc=example,dc=com"), true, &s);
        assert_eq!(e.get_dn(), &dn!("uid=u9,ou=people,dc=example,dc=com"));
        assert!(e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("u9")));
        assert!(!e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("u1")));

        // Without delete_old_rdn both values remain.
        let mut e = person("uid=u1,ou=people,dc=example,dc=com", "u1").into_invalid();
        e.set_dn(dn!("uid=u9,ou=people,dc=example,dc=com"), false, &s);
        assert!(e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("u9")));
        assert!(e.attribute_equality(ATTR_UID, &PartialValue::new_iutf8("u1")));
    }

    #[test]
    fn test_entry_filter_match() {
        let e = person("uid=u1,ou=people,dc=example,dc=com", "u1");

        let f = filter!(f_and(vec![
            f_eq(ATTR_OBJECTCLASS, PartialValue::new_iutf8("inetorgperson")),
            f_not(f_eq(ATTR_UID, PartialValue::new_iutf8("u2"))),
        ]))
        .into_valid();
        assert!(e.entry_match_no_index(&f));

        let f = filter!(f_or(vec![
            f_eq(ATTR_UID, PartialValue::new_iutf8("u2")),
            f_sub(ATTR_CN, PartialValue::new_iutf8("u")),
        ]))
        .into_valid();
        assert!(e.entry_match_no_index(&f));

        let f = filter!(f_pres(ATTR_MAIL)).into_valid();
        assert!(!e.entry_match_no_index(&f));
    }
}
