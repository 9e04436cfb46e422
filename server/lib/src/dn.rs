//! Distinguished names. A [`Dn`] is a sequence of relative distinguished
//! names, leaf first, exactly as written in string form. DNs are the primary
//! key of every entry and the routing key of the backend tree, so their
//! comparison semantics matter: the `Ord` implementation compares suffix
//! first, which makes every subtree a contiguous range in an ordered map.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::proto::OperationError;
use crate::value::AttrString;

/// One component of a DN. The attribute name is normalised to lowercase at
/// parse time. The value keeps its original spelling for display, and a
/// case-folded copy for comparison, matching caseIgnoreMatch semantics.
#[derive(Debug, Clone)]
pub struct Rdn {
    attr: AttrString,
    value: String,
    norm: String,
}

impl Rdn {
    pub fn new(attr: &str, value: &str) -> Self {
        Rdn {
            attr: AttrString::from(attr.to_lowercase()),
            value: value.to_string(),
            norm: value.to_lowercase(),
        }
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub(crate) fn norm_value(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.attr == other.attr && self.norm == other.norm
    }
}

impl Eq for Rdn {}

impl PartialOrd for Rdn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rdn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.attr
            .cmp(&other.attr)
            .then_with(|| self.norm.cmp(&other.norm))
    }
}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attr.hash(state);
        self.norm.hash(state);
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, escape_value(&self.value))
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | '=' | '+' | '\\' | '"' | ';' | '<' | '>' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// A distinguished name. `rdns[0]` is the leftmost (leaf) component.
#[derive(Debug, Clone)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// Parse a string form DN. Attribute names are normalised to lowercase.
    /// Backslash escapes (`\,`, `\\`, `\2c` ...) are honoured. Multi-valued
    /// RDNs (`+`) are not supported and are rejected.
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        let invalid = || OperationError::InvalidDistinguishedName(s.to_string());

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut rdns = Vec::new();
        for raw_rdn in split_unescaped(trimmed, ',') {
            let raw_rdn = raw_rdn.trim();
            let mut parts = split_unescaped(raw_rdn, '=');
            let (attr, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(v), None) => (a, v),
                _ => return Err(invalid()),
            };
            let attr = attr.trim();
            let value = unescape_value(value.trim()).ok_or_else(invalid)?;
            if attr.is_empty()
                || value.is_empty()
                || !attr
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return Err(invalid());
            }
            rdns.push(Rdn::new(attr, &value));
        }

        Ok(Dn { rdns })
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Dn { rdns }
    }

    /// The leaf RDN.
    pub fn rdn(&self) -> &Rdn {
        // A Dn can not be constructed empty.
        &self.rdns[0]
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.len() > 1 {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        } else {
            None
        }
    }

    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend_from_slice(&self.rdns);
        Dn { rdns }
    }

    /// Replace the leaf RDN, leaving the superior unchanged.
    pub fn with_rdn(&self, rdn: Rdn) -> Dn {
        let mut rdns = self.rdns.clone();
        rdns[0] = rdn;
        Dn { rdns }
    }

    /// True if self is strictly below other in the tree.
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        self.rdns.len() > other.rdns.len() && self.ends_with(other)
    }

    /// True if self is other, or strictly below it.
    pub fn is_under(&self, other: &Dn) -> bool {
        self == other || self.is_descendant_of(other)
    }

    fn ends_with(&self, other: &Dn) -> bool {
        let skip = self.rdns.len() - other.rdns.len();
        self.rdns[skip..]
            .iter()
            .zip(other.rdns.iter())
            .all(|(a, b)| a == b)
    }

    /// Rewrite self so that the `old_base` suffix becomes `new_base`. Returns
    /// None when self is not at or under `old_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_under(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = Vec::with_capacity(keep + new_base.rdns.len());
        rdns.extend_from_slice(&self.rdns[..keep]);
        rdns.extend_from_slice(&new_base.rdns);
        Some(Dn { rdns })
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    /// Suffix-first ordering. An ancestor sorts immediately before all of its
    /// descendants, so `BTreeMap::range` over this order walks a subtree.
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = self.rdns.iter().rev();
        let mut b = other.rdns.iter().rev();
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) => match x.cmp(y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
            }
        }
    }
}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rdns.hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for rdn in &self.rdns {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{rdn}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

impl Serialize for Dn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Dn::parse(&s).map_err(|_| D::Error::custom("invalid distinguished name"))
    }
}

/// Split on a separator, honouring backslash escapes. The escape characters
/// are preserved for `unescape_value` to process.
fn split_unescaped(s: &str, sep: char) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..idx]);
            start = idx + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts.into_iter()
}

fn unescape_value(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let next = chars.next()?;
        if next.is_ascii_hexdigit() {
            let second = chars.next()?;
            if !second.is_ascii_hexdigit() {
                return None;
            }
            let byte = u8::from_str_radix(&format!("{next}{second}"), 16).ok()?;
            out.push(byte as char);
        } else {
            out.push(next);
        }
    }
    Some(out)
}
