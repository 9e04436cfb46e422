//! Typed attribute values. A [`Value`] is what an entry stores, a
//! [`PartialValue`] is what queries and assertions carry. The two are split
//! so that matching can be implemented between them without requiring a
//! query to construct a fully valid value.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dn::Dn;
use crate::proto::OperationError;

pub type AttrString = smartstring::alias::String;

/// Normalise an attribute name. Names are lowercased once on the way in and
/// compared with plain equality everywhere after.
pub fn norm_attr(attr: &str) -> AttrString {
    AttrString::from(attr.to_lowercase())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Equality,
    Presence,
    SubString,
}

impl TryFrom<&str> for IndexType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "equality" | "eq" => Ok(IndexType::Equality),
            "presence" | "pres" => Ok(IndexType::Presence),
            "substring" | "sub" => Ok(IndexType::SubString),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexType::Equality => "EQUALITY",
            IndexType::Presence => "PRESENCE",
            IndexType::SubString => "SUBSTRING",
        })
    }
}

/// The syntax of an attribute, which selects normalisation and matching
/// behaviour for its values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxType {
    Utf8String,
    Utf8StringInsensitive,
    DistinguishedName,
    Boolean,
    Uint32,
    UtcTimestamp,
    Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Utf8(String),
    Iutf8(String),
    Dn(Dn),
    Bool(bool),
    Uint32(u32),
    DateTime(OffsetDateTime),
    Uuid(Uuid),
}

impl Value {
    pub fn new_utf8(s: &str) -> Self {
        Value::Utf8(s.to_string())
    }

    /// Case-insensitive string. Normalised (lowercased) at construction so
    /// that stored values are always in matching form.
    pub fn new_iutf8(s: &str) -> Self {
        Value::Iutf8(s.to_lowercase())
    }

    pub fn new_dn(dn: Dn) -> Self {
        Value::Dn(dn)
    }

    pub fn new_dn_s(s: &str) -> Result<Self, OperationError> {
        Dn::parse(s).map(Value::Dn)
    }

    pub fn new_bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn new_uint32(u: u32) -> Self {
        Value::Uint32(u)
    }

    pub fn new_datetime(odt: OffsetDateTime) -> Self {
        Value::DateTime(odt)
    }

    pub fn new_uuid(u: Uuid) -> Self {
        Value::Uuid(u)
    }

    /// Construct a value of the given syntax from its string form.
    pub fn new_for_syntax(s: &str, syntax: SyntaxType) -> Result<Self, OperationError> {
        let invalid = || OperationError::InvalidValueState;
        match syntax {
            SyntaxType::Utf8String => Ok(Value::new_utf8(s)),
            SyntaxType::Utf8StringInsensitive => Ok(Value::new_iutf8(s)),
            SyntaxType::DistinguishedName => Value::new_dn_s(s),
            SyntaxType::Boolean => match s.to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            SyntaxType::Uint32 => s.parse::<u32>().map(Value::Uint32).map_err(|_| invalid()),
            SyntaxType::UtcTimestamp => OffsetDateTime::parse(s, &Rfc3339)
                .map(Value::DateTime)
                .map_err(|_| invalid()),
            SyntaxType::Uuid => Uuid::parse_str(s).map(Value::Uuid).map_err(|_| invalid()),
        }
    }

    pub fn syntax(&self) -> SyntaxType {
        match self {
            Value::Utf8(_) => SyntaxType::Utf8String,
            Value::Iutf8(_) => SyntaxType::Utf8StringInsensitive,
            Value::Dn(_) => SyntaxType::DistinguishedName,
            Value::Bool(_) => SyntaxType::Boolean,
            Value::Uint32(_) => SyntaxType::Uint32,
            Value::DateTime(_) => SyntaxType::UtcTimestamp,
            Value::Uuid(_) => SyntaxType::Uuid,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) | Value::Iutf8(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dn(&self) -> Option<&Dn> {
        match self {
            Value::Dn(dn) => Some(dn),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            Value::DateTime(odt) => Some(*odt),
            _ => None,
        }
    }

    pub fn to_partialvalue(&self) -> PartialValue {
        match self {
            Value::Utf8(s) => PartialValue::Utf8(s.clone()),
            Value::Iutf8(s) => PartialValue::Iutf8(s.clone()),
            Value::Dn(dn) => PartialValue::Dn(dn.clone()),
            Value::Bool(b) => PartialValue::Bool(*b),
            Value::Uint32(u) => PartialValue::Uint32(*u),
            Value::DateTime(odt) => PartialValue::DateTime(*odt),
            Value::Uuid(u) => PartialValue::Uuid(*u),
        }
    }

    /// The normalised key this value contributes to an equality index.
    pub fn idx_eq_key(&self) -> String {
        match self {
            Value::Utf8(s) => s.clone(),
            Value::Iutf8(s) => s.clone(),
            Value::Dn(dn) => dn.to_string().to_lowercase(),
            Value::Bool(b) => b.to_string(),
            Value::Uint32(u) => u.to_string(),
            Value::DateTime(odt) => odt
                .format(&Rfc3339)
                .unwrap_or_else(|_| odt.unix_timestamp().to_string()),
            Value::Uuid(u) => u.as_hyphenated().to_string(),
        }
    }

    /// Equality matching between a stored value and an asserted one.
    pub fn equal_partial(&self, pv: &PartialValue) -> bool {
        match (self, pv) {
            (Value::Utf8(a), PartialValue::Utf8(b)) => a == b,
            (Value::Iutf8(a), PartialValue::Iutf8(b)) => a == b,
            (Value::Dn(a), PartialValue::Dn(b)) => a == b,
            (Value::Bool(a), PartialValue::Bool(b)) => a == b,
            (Value::Uint32(a), PartialValue::Uint32(b)) => a == b,
            (Value::DateTime(a), PartialValue::DateTime(b)) => a == b,
            (Value::Uuid(a), PartialValue::Uuid(b)) => a == b,
            _ => false,
        }
    }

    /// Substring matching. Only string syntaxes participate.
    pub fn contains_partial(&self, pv: &PartialValue) -> bool {
        match (self, pv) {
            (Value::Utf8(a), PartialValue::Utf8(b)) => a.contains(b.as_str()),
            (Value::Iutf8(a), PartialValue::Iutf8(b)) => a.contains(b.as_str()),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Utf8(s) | Value::Iutf8(s) => f.write_str(s),
            Value::Dn(dn) => write!(f, "{dn}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Uint32(u) => write!(f, "{u}"),
            Value::DateTime(odt) => match odt.format(&Rfc3339) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{}", odt.unix_timestamp()),
            },
            Value::Uuid(u) => write!(f, "{u}"),
        }
    }
}

/// An asserted value, as used in filters, modifications and index probes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartialValue {
    Utf8(String),
    Iutf8(String),
    Dn(Dn),
    Bool(bool),
    Uint32(u32),
    DateTime(OffsetDateTime),
    Uuid(Uuid),
}

impl PartialValue {
    pub fn new_utf8(s: &str) -> Self {
        PartialValue::Utf8(s.to_string())
    }

    pub fn new_iutf8(s: &str) -> Self {
        PartialValue::Iutf8(s.to_lowercase())
    }

    pub fn new_dn(dn: Dn) -> Self {
        PartialValue::Dn(dn)
    }

    pub fn new_dn_s(s: &str) -> Result<Self, OperationError> {
        Dn::parse(s).map(PartialValue::Dn)
    }

    pub fn new_bool(b: bool) -> Self {
        PartialValue::Bool(b)
    }

    pub fn new_uint32(u: u32) -> Self {
        PartialValue::Uint32(u)
    }

    pub fn new_uuid(u: Uuid) -> Self {
        PartialValue::Uuid(u)
    }

    pub fn new_for_syntax(s: &str, syntax: SyntaxType) -> Result<Self, OperationError> {
        Value::new_for_syntax(s, syntax).map(|v| v.to_partialvalue())
    }

    pub fn as_dn(&self) -> Option<&Dn> {
        match self {
            PartialValue::Dn(dn) => Some(dn),
            _ => None,
        }
    }

    pub fn idx_eq_key(&self) -> String {
        match self {
            PartialValue::Utf8(s) => s.clone(),
            PartialValue::Iutf8(s) => s.clone(),
            PartialValue::Dn(dn) => dn.to_string().to_lowercase(),
            PartialValue::Bool(b) => b.to_string(),
            PartialValue::Uint32(u) => u.to_string(),
            PartialValue::DateTime(odt) => odt
                .format(&Rfc3339)
                .unwrap_or_else(|_| odt.unix_timestamp().to_string()),
            PartialValue::Uuid(u) => u.as_hyphenated().to_string(),
        }
    }

    /// The string a substring assertion searches for, in normalised form.
    pub fn substring_needle(&self) -> Option<&str> {
        match self {
            PartialValue::Utf8(s) | PartialValue::Iutf8(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PartialValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartialValue::Utf8(s) | PartialValue::Iutf8(s) => f.write_str(s),
            PartialValue::Dn(dn) => write!(f, "{dn}"),
            PartialValue::Bool(b) => write!(f, "{b}"),
            PartialValue::Uint32(u) => write!(f, "{u}"),
            PartialValue::DateTime(odt) => match odt.format(&Rfc3339) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{}", odt.unix_timestamp()),
            },
            PartialValue::Uuid(u) => write!(f, "{u}"),
        }
    }
}
