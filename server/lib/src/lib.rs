//! The Roost directory server core library. This implements the entry store,
//! per-DN locking, the constraint maintenance plugins and group evaluation
//! that make up the heart of the server. Network protocol handling lives in
//! other crates and drives this library through its typed operation events.

#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

// This has to be before the other modules so the macro import order works.
#[macro_use]
pub mod macros;

pub mod be;
pub mod config;
pub mod constants;
pub mod dn;
pub mod dnlock;
pub mod entry;
pub mod event;
pub mod filter;
pub mod group;
pub mod modify;
pub mod plugins;
pub mod proto;
pub mod schema;
pub mod server;
#[cfg(test)]
pub mod testkit;
pub mod value;
pub mod valueset;

/// A prelude of imports that should be imported by all other Roost modules to
/// help make imports cleaner.
pub mod prelude {
    pub use std::sync::Arc;
    pub use std::time::Duration;

    pub use uuid::{uuid, Uuid};

    pub use crate::be::{Backend, BackendConfig, BackendRouter, MemBackend, Writability};
    pub use crate::constants::*;
    pub use crate::dn::{Dn, Rdn};
    pub use crate::dnlock::DnLockManager;
    pub use crate::entry::{
        Entry, EntryCommitted, EntryInit, EntryInitNew, EntryInvalid, EntryInvalidCommitted,
        EntryInvalidNew, EntryNew, EntrySealed, EntrySealedCommitted, EntrySealedNew, EntryValid,
        EntryValidCommitted, EntryValidNew,
    };
    pub use crate::event::{
        AddEvent, Control, DeleteEvent, Identity, ModifyDnEvent, ModifyEvent, OperationKind,
        SearchEvent, SearchScope,
    };
    pub use crate::filter::{
        f_and, f_eq, f_not, f_or, f_pres, f_sub, Filter, FilterInvalid, FilterValid, FC,
    };
    pub use crate::modify::{
        m_pres, m_purge, m_remove, Modify, ModifyInvalid, ModifyList, ModifyValid,
    };
    pub use crate::proto::{
        ConfigError, ConsistencyError, OperationError, PluginError, ResultCode, SchemaError,
    };
    pub use crate::schema::{
        Schema, SchemaAttribute, SchemaClass, SchemaReadTransaction, SchemaTransaction,
    };
    pub use crate::server::DirectoryServer;
    pub use crate::value::{AttrString, IndexType, PartialValue, SyntaxType, Value};
    pub use crate::valueset::ValueSet;
}
