//! Plugins allow an operation to be inspected and transformed during the
//! processing paths of the server. Constraint maintenance - referential
//! integrity and attribute uniqueness - is built entirely from these hooks,
//! which keeps the backend itself free of policy.
//!
//! Each plugin instance declares a capability set: which phases it
//! participates in, for which operation kinds. The set is validated once at
//! registration, and dispatch consults it - there is no per-operation
//! switching on plugin type. Phase ordering within one operation is fixed:
//! pre_parse, pre_operation, the backend write, post_operation,
//! post_response.

use bitflags::bitflags;

use crate::prelude::*;
use crate::proto::ConsistencyError;
use crate::server::DirectoryServer;

pub mod attrunique;
pub mod lastmod;
pub mod opcounter;
pub mod refint;
pub mod shortcircuit;

bitflags! {
    /// The operation kinds a capability covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpKindSet: u8 {
        const ADD = 0b0000_0001;
        const MODIFY = 0b0000_0010;
        const MODIFY_DN = 0b0000_0100;
        const DELETE = 0b0000_1000;
        const SEARCH = 0b0001_0000;
    }
}

impl From<OperationKind> for OpKindSet {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Add => OpKindSet::ADD,
            OperationKind::Modify => OpKindSet::MODIFY,
            OperationKind::ModifyDn => OpKindSet::MODIFY_DN,
            OperationKind::Delete => OpKindSet::DELETE,
            OperationKind::Search => OpKindSet::SEARCH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    PreParse,
    PreOperation,
    PostOperation,
    PostResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginCapability {
    pub phase: PluginPhase,
    pub kinds: OpKindSet,
}

impl PluginCapability {
    pub fn new(phase: PluginPhase, kinds: OpKindSet) -> Self {
        PluginCapability { phase, kinds }
    }
}

/// What a pre_parse hook asks the engine to do with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginDisposition {
    Continue,
    /// End the operation now, surfacing this result code to the caller.
    Stop(ResultCode),
}

pub trait Plugin: Send + Sync {
    fn id(&self) -> &'static str;

    /// The phases and operation kinds this instance participates in.
    /// Validated at registration.
    fn capabilities(&self) -> Vec<PluginCapability>;

    /// Called once the server is assembled. Plugins that own background
    /// tasks start them here.
    fn start(&self, _server: &DirectoryServer) {}

    /// Called at server shutdown and before reconfiguration. Background
    /// tasks must be joined deterministically here.
    fn shutdown(&self, _server: &DirectoryServer) {}

    fn pre_parse(
        &self,
        _server: &DirectoryServer,
        _kind: OperationKind,
        _ident: &Identity,
        _controls: &[Control],
    ) -> Result<PluginDisposition, OperationError> {
        Ok(PluginDisposition::Continue)
    }

    fn pre_add(
        &self,
        _server: &DirectoryServer,
        _cand: &mut EntryInvalidNew,
        _ce: &AddEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented pre_add!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn post_add(
        &self,
        _server: &DirectoryServer,
        _cand: &Arc<EntrySealedCommitted>,
        _ce: &AddEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented post_add!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn pre_modify(
        &self,
        _server: &DirectoryServer,
        _pre: &Arc<EntrySealedCommitted>,
        _cand: &mut EntryInvalidCommitted,
        _me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented pre_modify!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn post_modify(
        &self,
        _server: &DirectoryServer,
        _pre: &Arc<EntrySealedCommitted>,
        _post: &Arc<EntrySealedCommitted>,
        _me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented post_modify!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn pre_delete(
        &self,
        _server: &DirectoryServer,
        _cand: &Arc<EntrySealedCommitted>,
        _de: &DeleteEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented pre_delete!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn post_delete(
        &self,
        _server: &DirectoryServer,
        _cand: &[Arc<EntrySealedCommitted>],
        _de: &DeleteEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented post_delete!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn pre_modify_dn(
        &self,
        _server: &DirectoryServer,
        _pre: &Arc<EntrySealedCommitted>,
        _cand: &mut EntryInvalidCommitted,
        _ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented pre_modify_dn!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn post_modify_dn(
        &self,
        _server: &DirectoryServer,
        _moved: &[(Dn, Dn)],
        _ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        error!("plugin {} has an unimplemented post_modify_dn!", self.id());
        debug_assert!(false);
        Err(OperationError::InvalidState)
    }

    fn post_response(&self, _server: &DirectoryServer, _kind: OperationKind, _rc: ResultCode) {}

    /// Consistency sweep over the whole directory, run by test harnesses and
    /// admin tooling.
    fn verify(&self, _server: &DirectoryServer) -> Vec<Result<(), ConsistencyError>> {
        Vec::with_capacity(0)
    }
}

/// Holds every registered plugin instance and dispatches phases in
/// registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), ConfigError> {
        let caps = plugin.capabilities();
        if caps.is_empty() {
            return Err(ConfigError::UnsupportedPluginCapability(format!(
                "{} declares no capabilities",
                plugin.id()
            )));
        }
        for cap in &caps {
            if cap.kinds.is_empty() {
                return Err(ConfigError::UnsupportedPluginCapability(format!(
                    "{} declares an empty kind set",
                    plugin.id()
                )));
            }
            // Searches have no mutation phases.
            if matches!(cap.phase, PluginPhase::PreOperation | PluginPhase::PostOperation)
                && cap.kinds.contains(OpKindSet::SEARCH)
            {
                return Err(ConfigError::UnsupportedPluginCapability(format!(
                    "{} requests a mutation phase for search operations",
                    plugin.id()
                )));
            }
        }
        debug!(id = plugin.id(), "registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    fn with_capability(
        &self,
        phase: PluginPhase,
        kind: OperationKind,
    ) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        let kinds: OpKindSet = kind.into();
        self.plugins.iter().filter(move |p| {
            p.capabilities()
                .iter()
                .any(|c| c.phase == phase && c.kinds.contains(kinds))
        })
    }

    pub fn run_pre_parse(
        &self,
        server: &DirectoryServer,
        kind: OperationKind,
        ident: &Identity,
        controls: &[Control],
    ) -> Result<Option<ResultCode>, OperationError> {
        for p in self.with_capability(PluginPhase::PreParse, kind) {
            match p.pre_parse(server, kind, ident, controls)? {
                PluginDisposition::Continue => {}
                PluginDisposition::Stop(rc) => {
                    debug!(id = p.id(), ?rc, "pre_parse short circuit");
                    return Ok(Some(rc));
                }
            }
        }
        Ok(None)
    }

    pub fn run_pre_add(
        &self,
        server: &DirectoryServer,
        cand: &mut EntryInvalidNew,
        ce: &AddEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PreOperation, OperationKind::Add) {
            p.pre_add(server, cand, ce)?;
        }
        Ok(())
    }

    pub fn run_post_add(
        &self,
        server: &DirectoryServer,
        cand: &Arc<EntrySealedCommitted>,
        ce: &AddEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PostOperation, OperationKind::Add) {
            p.post_add(server, cand, ce)?;
        }
        Ok(())
    }

    pub fn run_pre_modify(
        &self,
        server: &DirectoryServer,
        pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PreOperation, OperationKind::Modify) {
            p.pre_modify(server, pre, cand, me)?;
        }
        Ok(())
    }

    pub fn run_post_modify(
        &self,
        server: &DirectoryServer,
        pre: &Arc<EntrySealedCommitted>,
        post: &Arc<EntrySealedCommitted>,
        me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PostOperation, OperationKind::Modify) {
            p.post_modify(server, pre, post, me)?;
        }
        Ok(())
    }

    pub fn run_pre_delete(
        &self,
        server: &DirectoryServer,
        cand: &Arc<EntrySealedCommitted>,
        de: &DeleteEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PreOperation, OperationKind::Delete) {
            p.pre_delete(server, cand, de)?;
        }
        Ok(())
    }

    pub fn run_post_delete(
        &self,
        server: &DirectoryServer,
        cand: &[Arc<EntrySealedCommitted>],
        de: &DeleteEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PostOperation, OperationKind::Delete) {
            p.post_delete(server, cand, de)?;
        }
        Ok(())
    }

    pub fn run_pre_modify_dn(
        &self,
        server: &DirectoryServer,
        pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PreOperation, OperationKind::ModifyDn) {
            p.pre_modify_dn(server, pre, cand, ev)?;
        }
        Ok(())
    }

    pub fn run_post_modify_dn(
        &self,
        server: &DirectoryServer,
        moved: &[(Dn, Dn)],
        ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        for p in self.with_capability(PluginPhase::PostOperation, OperationKind::ModifyDn) {
            p.post_modify_dn(server, moved, ev)?;
        }
        Ok(())
    }

    pub fn run_post_response(&self, server: &DirectoryServer, kind: OperationKind, rc: ResultCode) {
        for p in self.with_capability(PluginPhase::PostResponse, kind) {
            p.post_response(server, kind, rc);
        }
    }

    pub fn run_verify(
        &self,
        server: &DirectoryServer,
        results: &mut Vec<Result<(), ConsistencyError>>,
    ) {
        for p in &self.plugins {
            let mut r = p.verify(server);
            results.append(&mut r);
        }
    }

    pub fn start_all(&self, server: &DirectoryServer) {
        for p in &self.plugins {
            p.start(server);
        }
    }

    pub fn shutdown_all(&self, server: &DirectoryServer) {
        for p in &self.plugins {
            p.shutdown(server);
        }
    }
}
