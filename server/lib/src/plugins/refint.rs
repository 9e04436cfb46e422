// Referential Integrity
//
// Given an entry, modification or change, ensure that all referential links
// in the database are maintained. IE there are no dangling references that
// are unable to be resolved, as this may cause errors in group resolution
// and access evaluation.
//
// Repairs run either synchronously in post-operation processing, or on a
// dedicated background worker at a configured cadence. In background mode
// there is a visible window where stale references persist, bounded by the
// interval; reconfiguring the interval to zero joins the worker and flushes
// anything still queued.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;

use concread::cowcell::CowCell;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::plugins::{OpKindSet, Plugin, PluginCapability, PluginPhase};
use crate::prelude::*;
use crate::proto::ConsistencyError;
use crate::server::DirectoryServer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefintConfig {
    /// The DN valued attribute types this instance maintains.
    pub attrs: Vec<AttrString>,
    /// Only references held by entries under these bases are rewritten.
    pub scopes: Vec<Dn>,
    /// Zero means synchronous repair.
    pub update_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum RepairTask {
    /// These DNs were deleted; remove any reference to them.
    Removed(Vec<Dn>),
    /// These DNs were relocated; rewrite references to the new location.
    Moved(Vec<(Dn, Dn)>),
}

enum WorkerMsg {
    Task(RepairTask),
    Shutdown,
}

struct RefintWorker {
    tx: Sender<WorkerMsg>,
    handle: thread::JoinHandle<()>,
}

pub struct ReferentialIntegrity {
    config: CowCell<RefintConfig>,
    worker: Mutex<Option<RefintWorker>>,
}

impl ReferentialIntegrity {
    pub fn new(config: RefintConfig) -> Self {
        ReferentialIntegrity {
            config: CowCell::new(config),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> RefintConfig {
        (*self.config.read()).clone()
    }

    /// Swap in a new configuration. The background worker is joined - and
    /// its queue flushed - before the new mode takes effect, so no queued
    /// repair is ever lost.
    pub fn reconfigure(&self, server: &DirectoryServer, config: RefintConfig) {
        self.stop_worker();
        let mut wr = self.config.write();
        *wr = config;
        wr.commit();
        self.maybe_start_worker(server);
    }

    fn maybe_start_worker(&self, server: &DirectoryServer) {
        let config = self.config.read().clone();
        if config.update_interval.is_zero() {
            return;
        }
        let (tx, rx) = channel();
        let worker_server = server.clone();
        let handle = thread::spawn(move || {
            let interval = config.update_interval;
            let mut pending: Vec<RepairTask> = Vec::new();
            let mut deadline = Instant::now() + interval;
            info!(?interval, "referential integrity worker started");
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(WorkerMsg::Task(t)) => pending.push(t),
                    Ok(WorkerMsg::Shutdown) => {
                        Self::drain(&worker_server, &config, &mut pending);
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        Self::drain(&worker_server, &config, &mut pending);
                        deadline = Instant::now() + interval;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        Self::drain(&worker_server, &config, &mut pending);
                        break;
                    }
                }
            }
            info!("referential integrity worker stopped");
        });
        let mut guard = self.worker.lock();
        *guard = Some(RefintWorker { tx, handle });
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(w) = worker {
            // A send failure means the worker already exited; join either way.
            let _ = w.tx.send(WorkerMsg::Shutdown);
            if w.handle.join().is_err() {
                error!("referential integrity worker panicked");
            }
        }
    }

    /// Apply queued tasks one by one. An individual repair failure is logged
    /// and skipped; the worker keeps running across failures.
    fn drain(server: &DirectoryServer, config: &RefintConfig, pending: &mut Vec<RepairTask>) {
        for task in pending.drain(..) {
            if let Err(e) = Self::apply_repair(server, config, &task) {
                warn!(?e, ?task, "background repair failed, skipping item");
            }
        }
    }

    fn submit(&self, server: &DirectoryServer, task: RepairTask) -> Result<(), OperationError> {
        let config = self.config.read().clone();
        if config.update_interval.is_zero() {
            return Self::apply_repair(server, &config, &task);
        }
        let guard = self.worker.lock();
        if let Some(w) = guard.as_ref() {
            if w.tx.send(WorkerMsg::Task(task.clone())).is_ok() {
                return Ok(());
            }
        }
        drop(guard);
        // The worker is gone - fall back to synchronous repair rather than
        // dropping the task.
        warn!("referential integrity worker unavailable, repairing synchronously");
        Self::apply_repair(server, &config, &task)
    }

    fn apply_repair(
        server: &DirectoryServer,
        config: &RefintConfig,
        task: &RepairTask,
    ) -> Result<(), OperationError> {
        match task {
            RepairTask::Removed(dns) => Self::repair_removed(server, config, dns),
            RepairTask::Moved(pairs) => Self::repair_moved(server, config, pairs),
        }
    }

    fn reference_filter(attrs: &[AttrString], dn: &Dn) -> Filter<FilterInvalid> {
        let pv = PartialValue::new_dn(dn.clone());
        filter!(f_or(
            attrs.iter().map(|a| f_eq(a, pv.clone())).collect()
        ))
    }

    fn repair_removed(
        server: &DirectoryServer,
        config: &RefintConfig,
        dns: &[Dn],
    ) -> Result<(), OperationError> {
        for scope in &config.scopes {
            for dn in dns {
                let filt = Self::reference_filter(&config.attrs, dn);
                let pv = PartialValue::new_dn(dn.clone());
                let modlist = ModifyList::new_list(
                    config.attrs.iter().map(|a| m_remove(a, &pv)).collect(),
                );
                match server.internal_modify_where(scope, filt, modlist) {
                    Ok(count) => {
                        if count > 0 {
                            debug!(%dn, %scope, count, "removed dangling references");
                        }
                    }
                    // The scope base may not exist yet; nothing to repair.
                    Err(OperationError::NoSuchEntry) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn repair_moved(
        server: &DirectoryServer,
        config: &RefintConfig,
        pairs: &[(Dn, Dn)],
    ) -> Result<(), OperationError> {
        for scope in &config.scopes {
            for (old_dn, new_dn) in pairs {
                let filt = Self::reference_filter(&config.attrs, old_dn);
                let hits = match server.internal_search(
                    scope.clone(),
                    SearchScope::Subtree,
                    filt,
                ) {
                    Ok(hits) => hits,
                    Err(OperationError::NoSuchEntry) => continue,
                    Err(e) => return Err(e),
                };
                let pv_old = PartialValue::new_dn(old_dn.clone());
                for hit in hits {
                    // Re-check against current state; the entry may have
                    // been repaired or rewritten since the search.
                    let Some(current) = server.get_entry(hit.get_dn())? else {
                        continue;
                    };
                    let mods: Vec<Modify> = config
                        .attrs
                        .iter()
                        .filter(|a| current.attribute_equality(a, &pv_old))
                        .flat_map(|a| {
                            [
                                m_remove(a, &pv_old),
                                m_pres(a, &Value::new_dn(new_dn.clone())),
                            ]
                        })
                        .collect();
                    if mods.is_empty() {
                        continue;
                    }
                    match server.internal_modify(current.get_dn(), ModifyList::new_list(mods)) {
                        Ok(()) => {
                            debug!(referee = %current.get_dn(), %old_dn, %new_dn, "rewrote reference")
                        }
                        Err(OperationError::NoSuchEntry) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}

impl Plugin for ReferentialIntegrity {
    fn id(&self) -> &'static str {
        "referential_integrity"
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::new(
            PluginPhase::PostOperation,
            OpKindSet::DELETE | OpKindSet::MODIFY_DN,
        )]
    }

    fn start(&self, server: &DirectoryServer) {
        self.maybe_start_worker(server);
    }

    fn shutdown(&self, _server: &DirectoryServer) {
        self.stop_worker();
    }

    #[instrument(level = "debug", name = "refint_post_delete", skip_all)]
    fn post_delete(
        &self,
        server: &DirectoryServer,
        cand: &[Arc<EntrySealedCommitted>],
        _de: &DeleteEvent,
    ) -> Result<(), OperationError> {
        // Delete is the bulk of the work we do to clean up references: every
        // removed DN - the whole subtree on a subtree delete - may be the
        // target of references elsewhere.
        let dns: Vec<Dn> = cand.iter().map(|e| e.get_dn().clone()).collect();
        self.submit(server, RepairTask::Removed(dns))
    }

    #[instrument(level = "debug", name = "refint_post_modify_dn", skip_all)]
    fn post_modify_dn(
        &self,
        server: &DirectoryServer,
        moved: &[(Dn, Dn)],
        _ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        // Subtree moves hand us every relocated descendant, so references to
        // any of them are remapped, not just the rename target.
        self.submit(server, RepairTask::Moved(moved.to_vec()))
    }

    #[instrument(level = "debug", name = "refint_verify", skip_all)]
    fn verify(&self, server: &DirectoryServer) -> Vec<Result<(), ConsistencyError>> {
        let config = self.config.read().clone();
        let mut res = Vec::new();

        for scope in &config.scopes {
            let filt = filter!(f_or(
                config.attrs.iter().map(|a| f_pres(a)).collect()
            ));
            let holders = match server.internal_search(scope.clone(), SearchScope::Subtree, filt) {
                Ok(h) => h,
                Err(OperationError::NoSuchEntry) => continue,
                Err(_) => {
                    res.push(Err(ConsistencyError::QueryServerSearchFailure));
                    continue;
                }
            };
            for holder in holders {
                let referenced: Vec<Dn> = config
                    .attrs
                    .iter()
                    .filter_map(|a| holder.get_ava_set(a))
                    .flat_map(|vs| vs.as_dn_iter().cloned())
                    .unique()
                    .collect();
                for dn in referenced {
                    match server.entry_exists(&dn) {
                        Ok(true) => {}
                        Ok(false) => {
                            res.push(Err(ConsistencyError::RefintNotUpheld(format!(
                                "{} -> {dn}",
                                holder.get_dn()
                            ))));
                        }
                        Err(_) => res.push(Err(ConsistencyError::QueryServerSearchFailure)),
                    }
                }
            }
        }
        res
    }
}
