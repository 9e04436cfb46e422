//! The directory server core: the high level construction that coordinates
//! routing, locking, schema validation and the plugin pipeline for every
//! operation, client issued or internal.
//!
//! The processing order within one operation is fixed: pre_parse hooks, then
//! routing and lock acquisition, pre_operation hooks, the backend write,
//! post_operation hooks (after the operation's locks are released, so their
//! internal operations take their own locks), and finally post_response
//! hooks. Across operations, only the per-DN locks order anything.

use std::fs;
use std::path::Path;

use uuid::Uuid;

use crate::be::dbentry::{DbBackup, DB_BACKUP_VERSION};
use crate::be::SearchParams;
use crate::dnlock::DnLockManager;
use crate::plugins::{Plugin, PluginRegistry};
use crate::prelude::*;
use crate::proto::result_code_of;

struct DirectoryServerInner {
    schema: Schema,
    router: BackendRouter,
    locks: DnLockManager,
    plugins: PluginRegistry,
}

/// The assembled server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DirectoryServer {
    inner: Arc<DirectoryServerInner>,
}

pub struct ServerBuilder {
    schema: Schema,
    router: BackendRouter,
    plugins: PluginRegistry,
}

impl ServerBuilder {
    pub fn new(schema: Schema) -> Self {
        ServerBuilder {
            schema,
            router: BackendRouter::new(),
            plugins: PluginRegistry::new(),
        }
    }

    pub fn add_backend(mut self, be: Arc<dyn Backend>) -> Result<Self, ConfigError> {
        self.router.register(be)?;
        Ok(self)
    }

    pub fn register_plugin(mut self, plugin: Arc<dyn Plugin>) -> Result<Self, ConfigError> {
        self.plugins.register(plugin)?;
        Ok(self)
    }

    /// Assemble the server and start plugin background tasks.
    pub fn build(self) -> DirectoryServer {
        let server = DirectoryServer {
            inner: Arc::new(DirectoryServerInner {
                schema: self.schema,
                router: self.router,
                locks: DnLockManager::new(),
                plugins: self.plugins,
            }),
        };
        server.inner.plugins.start_all(&server);
        info!(
            backends = server.inner.router.backends().len(),
            "directory server ready"
        );
        server
    }
}

impl DirectoryServer {
    pub fn builder(schema: Schema) -> ServerBuilder {
        ServerBuilder::new(schema)
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn router(&self) -> &BackendRouter {
        &self.inner.router
    }

    /// Base DNs of every backend that serves client traffic. This is the
    /// default scope set for constraint plugins.
    pub fn public_base_dns(&self) -> Vec<Dn> {
        self.inner
            .router
            .backends()
            .iter()
            .filter(|b| b.writability() != Writability::InternalOnly)
            .flat_map(|b| b.base_dns().iter().cloned())
            .collect()
    }

    /// Stop plugin background tasks. The server stays usable for reads.
    pub fn shutdown(&self) {
        self.inner.plugins.shutdown_all(self);
    }

    fn route_write(
        &self,
        dn: &Dn,
        ident: &Identity,
    ) -> Result<Arc<dyn Backend>, OperationError> {
        let be = self
            .inner
            .router
            .route(dn)
            .ok_or(OperationError::NoMatchingBackend)?;
        match be.writability() {
            Writability::Enabled => Ok(be),
            Writability::InternalOnly if ident.is_internal() => Ok(be),
            _ => Err(OperationError::BackendReadOnly),
        }
    }

    fn pre_parse(
        &self,
        kind: OperationKind,
        ident: &Identity,
        controls: &[Control],
    ) -> Result<Option<ResultCode>, OperationError> {
        self.inner.plugins.run_pre_parse(self, kind, ident, controls)
    }

    // ===== add =====

    #[instrument(level = "debug", skip_all, fields(dn = %ce.entry.get_dn()))]
    pub fn add(&self, ce: &AddEvent) -> Result<(), OperationError> {
        let r = self.add_inner(ce);
        self.inner
            .plugins
            .run_post_response(self, OperationKind::Add, result_code_of(&r));
        r
    }

    fn add_inner(&self, ce: &AddEvent) -> Result<(), OperationError> {
        if !ce.ident.is_internal() {
            info!(ident = %ce.ident, dn = %ce.entry.get_dn(), "add initiator");
        }

        if let Some(rc) = self.pre_parse(OperationKind::Add, &ce.ident, &ce.controls)? {
            return short_circuit(rc);
        }

        let mut cand = ce.entry.clone().into_invalid();
        let dn = cand.get_dn().clone();
        let be = self.route_write(&dn, &ce.ident)?;

        let schema = self.inner.schema.read();

        // Server side normalisation: every entry carries an entryUUID, and
        // the naming value must be present on the entry.
        if cand.get_uuid().is_none() {
            cand.add_ava(ATTR_ENTRYUUID, Value::new_uuid(Uuid::new_v4()));
        }
        let rdn = dn.rdn().clone();
        if let Ok(v) = Value::new_for_syntax(rdn.value(), schema.syntax_of(rdn.attr())) {
            cand.add_ava(rdn.attr(), v);
        }

        let _guard = self.inner.locks.acquire_write(&dn)?;

        self.inner.plugins.run_pre_add(self, &mut cand, ce)?;

        let sealed = cand
            .validate(&schema)
            .map_err(|e| {
                error!(?e, "schema violation in add");
                OperationError::SchemaViolation(e)
            })?
            .seal();

        let committed = be.add_entry(sealed)?;
        drop(_guard);

        self.inner.plugins.run_post_add(self, &committed, ce)?;

        trace!(dn = %committed.get_dn(), "add success");
        Ok(())
    }

    pub fn internal_add(&self, entry: EntryInitNew) -> Result<(), OperationError> {
        self.add(&AddEvent::new_internal(entry))
    }

    // ===== modify =====

    #[instrument(level = "debug", skip_all, fields(dn = %me.dn))]
    pub fn modify(&self, me: &ModifyEvent) -> Result<(), OperationError> {
        let r = self.modify_inner(me);
        self.inner
            .plugins
            .run_post_response(self, OperationKind::Modify, result_code_of(&r));
        r
    }

    fn modify_inner(&self, me: &ModifyEvent) -> Result<(), OperationError> {
        if me.modlist.is_empty() {
            return Err(OperationError::EmptyRequest);
        }

        if let Some(rc) = self.pre_parse(OperationKind::Modify, &me.ident, &me.controls)? {
            return short_circuit(rc);
        }

        let be = self.route_write(&me.dn, &me.ident)?;
        let schema = self.inner.schema.read();
        let modlist = me.modlist.validate(&schema).map_err(|e| {
            error!(?e, "schema violation in modify modlist");
            OperationError::SchemaViolation(e)
        })?;

        let _guard = self.inner.locks.acquire_write(&me.dn)?;

        let pre = be.get_entry(&me.dn).ok_or(OperationError::NoSuchEntry)?;
        let mut cand = (*pre).clone().invalidate();
        cand.apply_modlist(&modlist);

        self.inner.plugins.run_pre_modify(self, &pre, &mut cand, me)?;

        let sealed = cand
            .validate(&schema)
            .map_err(|e| {
                error!(?e, "schema violation in modify");
                OperationError::SchemaViolation(e)
            })?
            .seal();

        let post = be.replace_entry(sealed)?;
        drop(_guard);

        self.inner.plugins.run_post_modify(self, &pre, &post, me)?;
        trace!(dn = %me.dn, "modify success");
        Ok(())
    }

    pub fn internal_modify(
        &self,
        dn: &Dn,
        modlist: ModifyList<ModifyInvalid>,
    ) -> Result<(), OperationError> {
        self.modify(&ModifyEvent::new_internal(dn.clone(), modlist))
    }

    /// Apply one modification list to every entry matching the filter under
    /// the base. Entries that vanish mid-pass are skipped, which is what
    /// background repair needs.
    pub fn internal_modify_where(
        &self,
        base: &Dn,
        filter: Filter<FilterInvalid>,
        modlist: ModifyList<ModifyInvalid>,
    ) -> Result<usize, OperationError> {
        let matched = self.internal_search(base.clone(), SearchScope::Subtree, filter)?;
        let mut applied = 0;
        for entry in matched {
            match self.internal_modify(entry.get_dn(), modlist.clone()) {
                Ok(()) => applied += 1,
                Err(OperationError::NoSuchEntry) => {
                    // Someone removed it while we were working. That is fine,
                    // it no longer needs repair.
                    debug!(dn = %entry.get_dn(), "skipping repair of removed entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    // ===== delete =====

    #[instrument(level = "debug", skip_all, fields(dn = %de.dn))]
    pub fn delete(&self, de: &DeleteEvent) -> Result<(), OperationError> {
        let r = self.delete_inner(de);
        self.inner
            .plugins
            .run_post_response(self, OperationKind::Delete, result_code_of(&r));
        r
    }

    fn delete_inner(&self, de: &DeleteEvent) -> Result<(), OperationError> {
        if let Some(rc) = self.pre_parse(OperationKind::Delete, &de.ident, &de.controls)? {
            return short_circuit(rc);
        }

        let be = self.route_write(&de.dn, &de.ident)?;

        let _guard = self.inner.locks.acquire_write(&de.dn)?;

        let target = be.get_entry(&de.dn).ok_or(OperationError::NoSuchEntry)?;
        self.inner.plugins.run_pre_delete(self, &target, de)?;

        let removed = be.delete_entry(&de.dn, de.subtree)?;
        drop(_guard);

        self.inner.plugins.run_post_delete(self, &removed, de)?;
        trace!(dn = %de.dn, count = removed.len(), "delete success");
        Ok(())
    }

    pub fn internal_delete(&self, dn: &Dn, subtree: bool) -> Result<(), OperationError> {
        self.delete(&DeleteEvent::new_internal(dn.clone(), subtree))
    }

    // ===== modify dn =====

    #[instrument(level = "debug", skip_all, fields(dn = %ev.dn))]
    pub fn modify_dn(&self, ev: &ModifyDnEvent) -> Result<(), OperationError> {
        let r = self.modify_dn_inner(ev);
        self.inner
            .plugins
            .run_post_response(self, OperationKind::ModifyDn, result_code_of(&r));
        r
    }

    fn modify_dn_inner(&self, ev: &ModifyDnEvent) -> Result<(), OperationError> {
        if let Some(rc) = self.pre_parse(OperationKind::ModifyDn, &ev.ident, &ev.controls)? {
            return short_circuit(rc);
        }

        let target_dn = ev.target_dn()?;
        let be = self.route_write(&ev.dn, &ev.ident)?;
        let target_be = self
            .inner
            .router
            .route(&target_dn)
            .ok_or(OperationError::NoMatchingBackend)?;
        if be.name() != target_be.name() {
            // Moves across backends are not supported.
            warn!(from = %ev.dn, to = %target_dn, "modify dn crosses backends");
            return Err(OperationError::InvalidRequestState);
        }

        let schema = self.inner.schema.read();

        let (_g1, _g2) = self.inner.locks.acquire_write_pair(&ev.dn, &target_dn)?;

        let pre = be.get_entry(&ev.dn).ok_or(OperationError::NoSuchEntry)?;
        let mut cand = (*pre).clone().invalidate();
        cand.set_dn(target_dn.clone(), ev.delete_old_rdn, &schema);

        self.inner.plugins.run_pre_modify_dn(self, &pre, &mut cand, ev)?;

        let sealed = cand
            .validate(&schema)
            .map_err(|e| {
                error!(?e, "schema violation in modify dn");
                OperationError::SchemaViolation(e)
            })?
            .seal();

        let moved = be.rename_entry(&ev.dn, sealed)?;
        drop(_g2);
        drop(_g1);

        self.inner.plugins.run_post_modify_dn(self, &moved, ev)?;
        trace!(from = %ev.dn, to = %target_dn, count = moved.len(), "modify dn success");
        Ok(())
    }

    // ===== search =====

    /// Stream matching entries to the callback. Returns the number emitted.
    #[instrument(level = "debug", skip_all, fields(base = %se.base))]
    pub fn search_stream(
        &self,
        se: &SearchEvent,
        out: &mut dyn FnMut(Arc<EntrySealedCommitted>) -> Result<(), OperationError>,
    ) -> Result<usize, OperationError> {
        let r = self.search_inner(se, out);
        let rc = match &r {
            Ok(_) => ResultCode::Success,
            Err(e) => e.into(),
        };
        self.inner
            .plugins
            .run_post_response(self, OperationKind::Search, rc);
        r
    }

    /// Collecting form of search.
    pub fn search(&self, se: &SearchEvent) -> Result<Vec<Arc<EntrySealedCommitted>>, OperationError> {
        let mut out = Vec::new();
        self.search_stream(se, &mut |e| {
            out.push(e);
            Ok(())
        })?;
        Ok(out)
    }

    fn search_inner(
        &self,
        se: &SearchEvent,
        out: &mut dyn FnMut(Arc<EntrySealedCommitted>) -> Result<(), OperationError>,
    ) -> Result<usize, OperationError> {
        if let Some(rc) = self.pre_parse(OperationKind::Search, &se.ident, &se.controls)? {
            return match short_circuit(rc) {
                Ok(()) => Ok(0),
                Err(e) => Err(e),
            };
        }

        let primary = self
            .inner
            .router
            .route(&se.base)
            .ok_or(OperationError::NoMatchingBackend)?;
        if primary.get_entry(&se.base).is_none() {
            return Err(OperationError::NoSuchEntry);
        }

        let schema = self.inner.schema.read();
        let filter = se.filter.validate(&schema).map_err(|e| {
            error!(?e, "schema violation in search filter");
            OperationError::SchemaViolation(e)
        })?;

        // A subtree (or one-level) search may span subordinate backends whose
        // bases nest beneath the search base. Each backend applies the scope
        // test itself, so merging is safe.
        let mut backends: Vec<Arc<dyn Backend>> = vec![primary.clone()];
        if se.scope != SearchScope::Base {
            for cand in self.inner.router.backends() {
                if cand.name() != primary.name()
                    && cand.base_dns().iter().any(|b| b.is_descendant_of(&se.base))
                {
                    backends.push(cand.clone());
                }
            }
        }

        let mut total = 0;
        for be in backends {
            let params = SearchParams {
                base: &se.base,
                scope: se.scope,
                filter: &filter,
                // Limits are shared across the fan out.
                size_limit: se.size_limit.map(|l| l.saturating_sub(total)),
                time_limit: se.time_limit,
                cancelled: se.cancelled_flag(),
            };
            total += be.search(&params, out)?;
        }
        Ok(total)
    }

    pub fn internal_search(
        &self,
        base: Dn,
        scope: SearchScope,
        filter: Filter<FilterInvalid>,
    ) -> Result<Vec<Arc<EntrySealedCommitted>>, OperationError> {
        self.search(&SearchEvent::new_internal(base, scope, filter))
    }

    pub fn internal_exists(
        &self,
        base: Dn,
        scope: SearchScope,
        filter: Filter<FilterInvalid>,
    ) -> Result<bool, OperationError> {
        self.internal_search(base, scope, filter).map(|v| !v.is_empty())
    }

    // ===== point reads =====

    /// Read one entry under its read lock.
    pub fn get_entry(&self, dn: &Dn) -> Result<Option<Arc<EntrySealedCommitted>>, OperationError> {
        let Some(be) = self.inner.router.route(dn) else {
            return Ok(None);
        };
        let _guard = self.inner.locks.acquire_read(dn)?;
        Ok(be.get_entry(dn))
    }

    /// Existence check: bounded lock retries, then a point read. Absence is
    /// a plain false, lock exhaustion is a server error.
    pub fn entry_exists(&self, dn: &Dn) -> Result<bool, OperationError> {
        self.get_entry(dn).map(|o| o.is_some())
    }

    // ===== maintenance =====

    /// Flatten backend and plugin consistency checks into a single report.
    pub fn verify(&self) -> Vec<ConsistencyError> {
        let mut out = Vec::new();
        for be in self.inner.router.backends() {
            out.extend(be.verify());
        }
        let mut plugin_results = Vec::new();
        self.inner.plugins.run_verify(self, &mut plugin_results);
        out.extend(plugin_results.into_iter().filter_map(|r| r.err()));
        out
    }

    pub fn backup_to_path(&self, path: &Path) -> Result<(), OperationError> {
        let mut entries = Vec::new();
        for be in self.inner.router.backends() {
            entries.append(&mut be.backup().entries);
        }
        let backup = DbBackup {
            version: DB_BACKUP_VERSION.to_string(),
            entries,
        };
        let file = fs::File::create(path).map_err(|e| {
            error!(?e, "unable to create backup file");
            OperationError::FsError
        })?;
        serde_json::to_writer(file, &backup).map_err(|e| {
            error!(?e, "unable to serialise backup");
            OperationError::SerdeJsonError
        })?;
        info!(count = backup.entries.len(), ?path, "backup complete");
        Ok(())
    }

    pub fn restore_from_path(&self, path: &Path) -> Result<(), OperationError> {
        let file = fs::File::open(path).map_err(|e| {
            error!(?e, "unable to open backup file");
            OperationError::FsError
        })?;
        let backup: DbBackup = serde_json::from_reader(file).map_err(|e| {
            error!(?e, "unable to parse backup");
            OperationError::SerdeJsonError
        })?;
        if backup.version != DB_BACKUP_VERSION {
            return Err(OperationError::InvalidState);
        }

        // Split the entry set by routing, then hand each backend its share.
        let mut per_backend: Vec<(Arc<dyn Backend>, Vec<crate::be::dbentry::DbEntry>)> = self
            .inner
            .router
            .backends()
            .iter()
            .map(|b| (b.clone(), Vec::new()))
            .collect();
        for dbe in backup.entries {
            let dn = dbe.dn()?;
            let Some(be) = self.inner.router.route(&dn) else {
                warn!(%dn, "restore skipping entry outside every backend");
                continue;
            };
            if let Some((_, bucket)) = per_backend.iter_mut().find(|(b, _)| b.name() == be.name()) {
                bucket.push(dbe);
            }
        }
        for (be, entries) in per_backend {
            be.restore(DbBackup {
                version: DB_BACKUP_VERSION.to_string(),
                entries,
            })?;
        }
        Ok(())
    }
}

fn short_circuit(rc: ResultCode) -> Result<(), OperationError> {
    if rc == ResultCode::Success {
        Ok(())
    } else {
        Err(OperationError::ShortCircuited(rc))
    }
}
