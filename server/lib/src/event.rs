//! Operation events. An event is the raw, typed representation of a request
//! made to the server, including the identity performing it and any controls
//! attached to it. Internal operations - engine issued repairs and lookups -
//! are events too, and pass through exactly the same pipeline as client
//! operations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dn::Rdn;
use crate::prelude::*;

lazy_static! {
    static ref INTERNAL_DN: Dn = {
        #[allow(clippy::expect_used)]
        Dn::parse(INTERNAL_IDENTITY_DN).expect("internal identity dn must parse")
    };
}

/// Who is performing an operation. Internal identities bypass writability
/// restrictions on internal-only backends; everything else in the pipeline
/// treats the two alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Internal,
    User { dn: Dn },
}

impl Identity {
    pub fn is_internal(&self) -> bool {
        matches!(self, Identity::Internal)
    }

    /// The DN recorded in operational attributes for this identity.
    pub fn dn(&self) -> &Dn {
        match self {
            Identity::Internal => &INTERNAL_DN,
            Identity::User { dn } => dn,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Internal => write!(f, "internal"),
            Identity::User { dn } => write!(f, "{dn}"),
        }
    }
}

/// An out-of-band control attached to an operation: an opaque OID-tagged
/// value, decoded on demand by whichever hook understands the OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: &str, criticality: bool, value: Option<Vec<u8>>) -> Self {
        Control {
            oid: oid.to_string(),
            criticality,
            value,
        }
    }
}

/// The kind of an operation, used by the plugin capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Add,
    Modify,
    ModifyDn,
    Delete,
    Search,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Add => "add",
            OperationKind::Modify => "modify",
            OperationKind::ModifyDn => "modifydn",
            OperationKind::Delete => "delete",
            OperationKind::Search => "search",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AddEvent {
    pub ident: Identity,
    pub entry: EntryInitNew,
    pub controls: Vec<Control>,
}

impl AddEvent {
    pub fn new_internal(entry: EntryInitNew) -> Self {
        AddEvent {
            ident: Identity::Internal,
            entry,
            controls: Vec::with_capacity(0),
        }
    }

    pub fn new(ident: Identity, entry: EntryInitNew) -> Self {
        AddEvent {
            ident,
            entry,
            controls: Vec::with_capacity(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteEvent {
    pub ident: Identity,
    pub dn: Dn,
    /// Subtree delete is an explicit request, never implied.
    pub subtree: bool,
    pub controls: Vec<Control>,
}

impl DeleteEvent {
    pub fn new_internal(dn: Dn, subtree: bool) -> Self {
        DeleteEvent {
            ident: Identity::Internal,
            dn,
            subtree,
            controls: Vec::with_capacity(0),
        }
    }

    pub fn new(ident: Identity, dn: Dn, subtree: bool) -> Self {
        DeleteEvent {
            ident,
            dn,
            subtree,
            controls: Vec::with_capacity(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModifyEvent {
    pub ident: Identity,
    pub dn: Dn,
    pub modlist: ModifyList<ModifyInvalid>,
    pub controls: Vec<Control>,
}

impl ModifyEvent {
    pub fn new_internal(dn: Dn, modlist: ModifyList<ModifyInvalid>) -> Self {
        ModifyEvent {
            ident: Identity::Internal,
            dn,
            modlist,
            controls: Vec::with_capacity(0),
        }
    }

    pub fn new(ident: Identity, dn: Dn, modlist: ModifyList<ModifyInvalid>) -> Self {
        ModifyEvent {
            ident,
            dn,
            modlist,
            controls: Vec::with_capacity(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModifyDnEvent {
    pub ident: Identity,
    pub dn: Dn,
    pub new_rdn: Rdn,
    pub delete_old_rdn: bool,
    /// When set, the entry moves beneath this DN; otherwise only the RDN
    /// changes.
    pub new_superior: Option<Dn>,
    pub controls: Vec<Control>,
}

impl ModifyDnEvent {
    pub fn new_internal(dn: Dn, new_rdn: Rdn, delete_old_rdn: bool, new_superior: Option<Dn>) -> Self {
        ModifyDnEvent {
            ident: Identity::Internal,
            dn,
            new_rdn,
            delete_old_rdn,
            new_superior,
            controls: Vec::with_capacity(0),
        }
    }

    /// The DN the entry will occupy after the operation.
    pub fn target_dn(&self) -> Result<Dn, OperationError> {
        let superior = match &self.new_superior {
            Some(s) => s.clone(),
            None => self.dn.parent().ok_or(OperationError::InvalidRequestState)?,
        };
        Ok(superior.child(self.new_rdn.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub ident: Identity,
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter<FilterInvalid>,
    pub size_limit: Option<usize>,
    pub time_limit: Option<Duration>,
    pub controls: Vec<Control>,
    cancelled: Arc<AtomicBool>,
}

impl SearchEvent {
    pub fn new_internal(base: Dn, scope: SearchScope, filter: Filter<FilterInvalid>) -> Self {
        SearchEvent {
            ident: Identity::Internal,
            base,
            scope,
            filter,
            size_limit: None,
            time_limit: None,
            controls: Vec::with_capacity(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new(ident: Identity, base: Dn, scope: SearchScope, filter: Filter<FilterInvalid>) -> Self {
        SearchEvent {
            ident,
            base,
            scope,
            filter,
            size_limit: None,
            time_limit: None,
            controls: Vec::with_capacity(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_limits(mut self, size_limit: Option<usize>, time_limit: Option<Duration>) -> Self {
        self.size_limit = size_limit;
        self.time_limit = time_limit;
        self
    }

    /// A handle that allows another thread to cancel this search at its
    /// next entry boundary.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub(crate) fn cancelled_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Find the first control with the given OID.
pub fn find_control<'a>(controls: &'a [Control], oid: &str) -> Option<&'a Control> {
    controls.iter().find(|c| c.oid == oid)
}
