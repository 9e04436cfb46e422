//! The durable serialised form of entries. Entries are written as versioned
//! documents so the on-disk format can evolve independently of the in-memory
//! representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbValue {
    Utf8(String),
    Iutf8(String),
    Dn(String),
    Bool(bool),
    Uint32(u32),
    DateTime(String),
    Uuid(Uuid),
}

impl DbValue {
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Utf8(s) => DbValue::Utf8(s.clone()),
            Value::Iutf8(s) => DbValue::Iutf8(s.clone()),
            Value::Dn(dn) => DbValue::Dn(dn.to_string()),
            Value::Bool(b) => DbValue::Bool(*b),
            Value::Uint32(u) => DbValue::Uint32(*u),
            Value::DateTime(odt) => DbValue::DateTime(
                odt.format(&Rfc3339)
                    .unwrap_or_else(|_| odt.unix_timestamp().to_string()),
            ),
            Value::Uuid(u) => DbValue::Uuid(*u),
        }
    }

    pub fn into_value(self) -> Result<Value, OperationError> {
        match self {
            DbValue::Utf8(s) => Ok(Value::Utf8(s)),
            DbValue::Iutf8(s) => Ok(Value::Iutf8(s)),
            DbValue::Dn(s) => Value::new_dn_s(&s),
            DbValue::Bool(b) => Ok(Value::Bool(b)),
            DbValue::Uint32(u) => Ok(Value::Uint32(u)),
            DbValue::DateTime(s) => OffsetDateTime::parse(&s, &Rfc3339)
                .map(Value::DateTime)
                .map_err(|_| OperationError::InvalidValueState),
            DbValue::Uuid(u) => Ok(Value::Uuid(u)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbEntryV1 {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<DbValue>>,
}

/// The versioned entry document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DbEntry {
    V1(DbEntryV1),
}

impl DbEntry {
    pub fn from_entry(entry: &EntrySealedCommitted) -> Self {
        let attrs = entry
            .iter_attrs()
            .map(|(attr, vs)| {
                (
                    attr.to_string(),
                    vs.iter().map(DbValue::from_value).collect(),
                )
            })
            .collect();
        DbEntry::V1(DbEntryV1 {
            dn: entry.get_dn().to_string(),
            attrs,
        })
    }

    /// The DN this document describes, without a full conversion.
    pub fn dn(&self) -> Result<Dn, OperationError> {
        let DbEntry::V1(inner) = self;
        Dn::parse(&inner.dn)
    }

    pub fn into_entry(self, id: u64) -> Result<EntrySealedCommitted, OperationError> {
        let DbEntry::V1(inner) = self;
        let dn = Dn::parse(&inner.dn)?;
        let mut attrs: BTreeMap<AttrString, ValueSet> = BTreeMap::new();
        for (attr, dbvs) in inner.attrs {
            let vs: ValueSet = dbvs
                .into_iter()
                .map(DbValue::into_value)
                .collect::<Result<_, _>>()?;
            if vs.is_empty() {
                return Err(OperationError::InvalidEntryState);
            }
            attrs.insert(AttrString::from(attr.to_lowercase()), vs);
        }
        Ok(Entry::from_parts(id, dn, attrs))
    }
}

/// A complete store snapshot, as written by backup and consumed by restore.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbBackup {
    pub version: String,
    pub entries: Vec<DbEntry>,
}

pub const DB_BACKUP_VERSION: &str = "roost-backup-v1";
