//! Filters are the assertion language of the server. A filter is a logical
//! statement of properties that an entry and its attribute-values must
//! uphold to be considered true. Filters are validated against the schema
//! before use so that their attributes are known and their assertions carry
//! the right syntax, which is what allows the backend to consult indexes
//! safely.

use std::fmt;

use crate::prelude::*;
use crate::value::norm_attr;

pub const FILTER_DEPTH_MAX: usize = 16;

/// The short-form filter builder used by internal callers and tests, which
/// is then transformed into a filter for the server to use.
#[derive(Debug, Clone)]
pub enum FC<'a> {
    Eq(&'a str, PartialValue),
    Sub(&'a str, PartialValue),
    Pres(&'a str),
    Or(Vec<FC<'a>>),
    And(Vec<FC<'a>>),
    Not(Box<FC<'a>>),
}

pub fn f_eq(a: &str, v: PartialValue) -> FC<'_> {
    FC::Eq(a, v)
}

pub fn f_sub(a: &str, v: PartialValue) -> FC<'_> {
    FC::Sub(a, v)
}

pub fn f_pres(a: &str) -> FC<'_> {
    FC::Pres(a)
}

pub fn f_or(vs: Vec<FC>) -> FC<'_> {
    FC::Or(vs)
}

pub fn f_and(vs: Vec<FC>) -> FC<'_> {
    FC::And(vs)
}

pub fn f_not(fc: FC) -> FC<'_> {
    FC::Not(Box::new(fc))
}

/// The filter's internal representation, attribute names normalised.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterComp {
    Eq(AttrString, PartialValue),
    Sub(AttrString, PartialValue),
    Pres(AttrString),
    Or(Vec<FilterComp>),
    And(Vec<FilterComp>),
    Not(Box<FilterComp>),
}

impl From<FC<'_>> for FilterComp {
    fn from(fc: FC<'_>) -> Self {
        match fc {
            FC::Eq(a, v) => FilterComp::Eq(norm_attr(a), v),
            FC::Sub(a, v) => FilterComp::Sub(norm_attr(a), v),
            FC::Pres(a) => FilterComp::Pres(norm_attr(a)),
            FC::Or(vs) => FilterComp::Or(vs.into_iter().map(FilterComp::from).collect()),
            FC::And(vs) => FilterComp::And(vs.into_iter().map(FilterComp::from).collect()),
            FC::Not(f) => FilterComp::Not(Box::new(FilterComp::from(*f))),
        }
    }
}

impl FilterComp {
    fn validate_inner(
        &self,
        schema: &dyn SchemaTransaction,
        depth: usize,
    ) -> Result<(), SchemaError> {
        if depth > FILTER_DEPTH_MAX {
            return Err(SchemaError::Corrupted);
        }
        match self {
            FilterComp::Eq(attr, pv) => match schema.attribute_type(attr) {
                Some(a) => a.validate_partialvalue(pv),
                None => Err(SchemaError::InvalidAttribute(attr.to_string())),
            },
            FilterComp::Sub(attr, pv) => match schema.attribute_type(attr) {
                Some(a) => {
                    // Substring assertions only exist for string syntaxes.
                    match a.syntax {
                        SyntaxType::Utf8String | SyntaxType::Utf8StringInsensitive => {
                            a.validate_partialvalue(pv)
                        }
                        _ => Err(SchemaError::InvalidAttributeSyntax(attr.to_string())),
                    }
                }
                None => Err(SchemaError::InvalidAttribute(attr.to_string())),
            },
            FilterComp::Pres(attr) => {
                if schema.attribute_type(attr).is_some() {
                    Ok(())
                } else {
                    Err(SchemaError::InvalidAttribute(attr.to_string()))
                }
            }
            FilterComp::Or(fs) | FilterComp::And(fs) => {
                if fs.is_empty() {
                    return Err(SchemaError::EmptyFilter);
                }
                fs.iter()
                    .try_for_each(|f| f.validate_inner(schema, depth + 1))
            }
            FilterComp::Not(f) => f.validate_inner(schema, depth + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInvalid {
    inner: FilterComp,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FilterValid {
    inner: FilterComp,
}

/// A filter in one of its validation states. `Filter<FilterInvalid>` is what
/// requests and internal callers construct; the schema check is the only
/// path to `Filter<FilterValid>`, which the backend will accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter<STATE> {
    state: STATE,
}

impl Filter<FilterInvalid> {
    pub fn new(fc: FC) -> Self {
        Filter {
            state: FilterInvalid {
                inner: FilterComp::from(fc),
            },
        }
    }

    pub fn validate(
        &self,
        schema: &dyn SchemaTransaction,
    ) -> Result<Filter<FilterValid>, SchemaError> {
        self.state.inner.validate_inner(schema, 0).map(|_| Filter {
            state: FilterValid {
                inner: self.state.inner.clone(),
            },
        })
    }

    /// Parse an RFC 4515 style string filter. Assertion values are typed by
    /// the schema syntax of their attribute; substring patterns with
    /// multiple components are conjunctions of their parts.
    pub fn parse(schema: &dyn SchemaTransaction, input: &str) -> Result<Self, OperationError> {
        let mut p = Parser {
            chars: input.chars().collect(),
            pos: 0,
            schema,
        };
        let fc = p.parse_filter(0)?;
        p.skip_ws();
        if p.pos != p.chars.len() {
            return Err(OperationError::InvalidFilter(format!(
                "trailing input at {}",
                p.pos
            )));
        }
        Ok(Filter {
            state: FilterInvalid { inner: fc },
        })
    }

    /// ⚠️  - Bypass schema validation. TEST ONLY.
    #[cfg(test)]
    pub(crate) fn into_valid(self) -> Filter<FilterValid> {
        Filter {
            state: FilterValid {
                inner: self.state.inner,
            },
        }
    }
}

impl Filter<FilterValid> {
    pub(crate) fn inner(&self) -> &FilterComp {
        &self.state.inner
    }

    pub fn invalidate(self) -> Filter<FilterInvalid> {
        Filter {
            state: FilterInvalid {
                inner: self.state.inner,
            },
        }
    }
}

impl fmt::Display for FilterComp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterComp::Eq(a, v) => write!(f, "({a}={v})"),
            FilterComp::Sub(a, v) => write!(f, "({a}=*{v}*)"),
            FilterComp::Pres(a) => write!(f, "({a}=*)"),
            FilterComp::Or(fs) => {
                write!(f, "(|")?;
                for inner in fs {
                    write!(f, "{inner}")?;
                }
                write!(f, ")")
            }
            FilterComp::And(fs) => {
                write!(f, "(&")?;
                for inner in fs {
                    write!(f, "{inner}")?;
                }
                write!(f, ")")
            }
            FilterComp::Not(inner) => write!(f, "(!{inner})"),
        }
    }
}

impl<STATE> fmt::Display for Filter<STATE>
where
    STATE: FilterState,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.comp())
    }
}

pub trait FilterState {
    fn comp(&self) -> &FilterComp;
}

impl FilterState for FilterInvalid {
    fn comp(&self) -> &FilterComp {
        &self.inner
    }
}

impl FilterState for FilterValid {
    fn comp(&self) -> &FilterComp {
        &self.inner
    }
}

impl<STATE: FilterState> Filter<STATE> {
    fn comp(&self) -> &FilterComp {
        self.state.comp()
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    schema: &'a dyn SchemaTransaction,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: &str) -> OperationError {
        OperationError::InvalidFilter(format!("{msg} at {}", self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, c: char) -> Result<(), OperationError> {
        if self.bump() == Some(c) {
            Ok(())
        } else {
            Err(self.err(&format!("expected '{c}'")))
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_filter(&mut self, depth: usize) -> Result<FilterComp, OperationError> {
        if depth > FILTER_DEPTH_MAX {
            return Err(self.err("filter too deep"));
        }
        self.skip_ws();
        self.expect('(')?;
        let fc = match self.peek() {
            Some('&') => {
                self.pos += 1;
                FilterComp::And(self.parse_list(depth + 1)?)
            }
            Some('|') => {
                self.pos += 1;
                FilterComp::Or(self.parse_list(depth + 1)?)
            }
            Some('!') => {
                self.pos += 1;
                FilterComp::Not(Box::new(self.parse_filter(depth + 1)?))
            }
            _ => self.parse_item()?,
        };
        self.expect(')')?;
        Ok(fc)
    }

    fn parse_list(&mut self, depth: usize) -> Result<Vec<FilterComp>, OperationError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('(') => out.push(self.parse_filter(depth)?),
                _ => break,
            }
        }
        if out.is_empty() {
            return Err(self.err("empty filter set"));
        }
        Ok(out)
    }

    fn parse_item(&mut self) -> Result<FilterComp, OperationError> {
        let mut attr = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                attr.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if attr.is_empty() {
            return Err(self.err("expected attribute name"));
        }
        self.expect('=')?;

        // Read the raw assertion up to the closing paren, splitting on
        // unescaped stars.
        let mut chunks: Vec<String> = vec![String::new()];
        let mut stars = 0usize;
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated assertion")),
                Some(')') => break,
                Some('*') => {
                    self.pos += 1;
                    stars += 1;
                    chunks.push(String::new());
                }
                Some('\\') => {
                    self.pos += 1;
                    let h1 = self.bump().ok_or_else(|| self.err("bad escape"))?;
                    let h2 = self.bump().ok_or_else(|| self.err("bad escape"))?;
                    let byte = u8::from_str_radix(&format!("{h1}{h2}"), 16)
                        .map_err(|_| self.err("bad hex escape"))?;
                    if let Some(last) = chunks.last_mut() {
                        last.push(byte as char);
                    }
                }
                Some(c) => {
                    self.pos += 1;
                    if let Some(last) = chunks.last_mut() {
                        last.push(c);
                    }
                }
            }
        }

        let syntax = self.schema.syntax_of(&attr);
        if stars == 0 {
            let raw = &chunks[0];
            let pv = PartialValue::new_for_syntax(raw, syntax)
                .map_err(|_| self.err("invalid assertion value"))?;
            return Ok(FilterComp::Eq(norm_attr(&attr), pv));
        }

        let parts: Vec<&String> = chunks.iter().filter(|c| !c.is_empty()).collect();
        if parts.is_empty() {
            // A bare star is a presence assertion.
            return Ok(FilterComp::Pres(norm_attr(&attr)));
        }

        // Substring components. Anchoring of initial/final parts is
        // approximated by the contains semantics of Sub.
        let subs: Vec<FilterComp> = parts
            .into_iter()
            .map(|part| {
                PartialValue::new_for_syntax(part, syntax)
                    .map(|pv| FilterComp::Sub(norm_attr(&attr), pv))
            })
            .collect::<Result<_, _>>()
            .map_err(|_| self.err("invalid substring value"))?;
        if subs.len() == 1 {
            Ok(subs.into_iter().next().ok_or_else(|| self.err("substring"))?)
        } else {
            Ok(FilterComp::And(subs))
        }
    }
}
