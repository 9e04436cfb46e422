//! The backend. This contains the "low level" storage and query code: entry
//! persistence keyed by DN, index maintenance, and candidate resolution for
//! searches. The backend has no knowledge of plugins or locking discipline;
//! those are enforced above it by the server. Its job is to keep entries and
//! indexes in sync and to execute queries using those indexes in the most
//! effective way possible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use hashbrown::{HashMap as Map, HashSet};
use idlset::v2::IDLBitRange;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::be::dbentry::{DbBackup, DbEntry, DB_BACKUP_VERSION};
use crate::filter::FilterComp;
use crate::prelude::*;

pub mod dbentry;
pub(crate) mod idxkey;

pub use self::idxkey::{IdxKey, IdxKeyRef, IdxKeyToRef};

/// How a backend accepts writes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Writability {
    Enabled,
    Disabled,
    InternalOnly,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub base_dns: Vec<Dn>,
    pub writability: Writability,
    pub idxkeys: Vec<IdxKey>,
}

impl BackendConfig {
    pub fn new(name: &str, base_dns: Vec<Dn>, idxkeys: Vec<IdxKey>) -> Self {
        BackendConfig {
            name: name.to_string(),
            base_dns,
            writability: Writability::Enabled,
            idxkeys,
        }
    }
}

/// The state of a candidate id set during filter resolution. `Indexed` sets
/// are exact. `Partial` sets are a superset of the true result and every
/// candidate must be re-tested against the filter. `AllIds` means the
/// indexes gave us nothing.
#[derive(Debug, Clone)]
pub enum IdList {
    AllIds,
    Partial(IDLBitRange),
    Indexed(IDLBitRange),
}

/// Bounds and cancellation for one search execution.
pub struct SearchParams<'a> {
    pub base: &'a Dn,
    pub scope: SearchScope,
    pub filter: &'a Filter<FilterValid>,
    pub size_limit: Option<usize>,
    pub time_limit: Option<Duration>,
    pub cancelled: &'a AtomicBool,
}

impl<'a> SearchParams<'a> {
    pub fn unlimited(
        base: &'a Dn,
        scope: SearchScope,
        filter: &'a Filter<FilterValid>,
        cancelled: &'a AtomicBool,
    ) -> Self {
        SearchParams {
            base,
            scope,
            filter,
            size_limit: None,
            time_limit: None,
            cancelled,
        }
    }
}

/// The entry storage contract. Backends are an extension point, so this is
/// object safe and consumed as `Arc<dyn Backend>` behind the router.
///
/// Locking is the caller's concern: the server serialises mutations per DN
/// before calling in. Reads of single entries and searches run against the
/// backend's own consistent snapshot.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn base_dns(&self) -> &[Dn];

    fn writability(&self) -> Writability;

    /// True when this DN is one of our configured bases.
    fn has_base(&self, dn: &Dn) -> bool {
        self.base_dns().iter().any(|b| b == dn)
    }

    /// True when this DN falls under one of our bases. Subordinate
    /// precedence is applied by the router, not here.
    fn handles_dn(&self, dn: &Dn) -> bool {
        self.base_dns().iter().any(|b| dn.is_under(b))
    }

    /// Pure predicate over the index catalog, used by the query planner.
    fn is_indexed(&self, attr: &str, itype: IndexType) -> bool;

    /// Recursive filter form of [`Backend::is_indexed`]. An AND is indexed
    /// when any child is, an OR only when it is non-empty and every child
    /// is, and a NOT is never indexed.
    fn is_filter_indexed(&self, filter: &Filter<FilterValid>) -> bool {
        fn walk(fc: &FilterComp, pred: &dyn Fn(&str, IndexType) -> bool) -> bool {
            match fc {
                FilterComp::Eq(attr, _) => pred(attr, IndexType::Equality),
                FilterComp::Sub(attr, _) => pred(attr, IndexType::SubString),
                FilterComp::Pres(attr) => pred(attr, IndexType::Presence),
                FilterComp::And(fs) => fs.iter().any(|f| walk(f, pred)),
                FilterComp::Or(fs) => !fs.is_empty() && fs.iter().all(|f| walk(f, pred)),
                FilterComp::Not(_) => false,
            }
        }
        walk(filter.inner(), &|attr, itype| self.is_indexed(attr, itype))
    }

    fn get_entry(&self, dn: &Dn) -> Option<Arc<EntrySealedCommitted>>;

    fn entry_count(&self) -> usize;

    fn add_entry(&self, entry: EntrySealedNew) -> Result<Arc<EntrySealedCommitted>, OperationError>;

    fn replace_entry(
        &self,
        entry: EntrySealedCommitted,
    ) -> Result<Arc<EntrySealedCommitted>, OperationError>;

    /// Delete an entry, or with `subtree` set, the entry and everything
    /// under it. Returns every removed entry so post-operation hooks can see
    /// the full set.
    fn delete_entry(
        &self,
        dn: &Dn,
        subtree: bool,
    ) -> Result<Vec<Arc<EntrySealedCommitted>>, OperationError>;

    /// Move an entry - and its whole subtree - to the DN carried by the
    /// given (already renamed) entry. Returns every `(old dn, new dn)` pair
    /// that was relocated, target first.
    fn rename_entry(
        &self,
        old_dn: &Dn,
        entry: EntrySealedCommitted,
    ) -> Result<Vec<(Dn, Dn)>, OperationError>;

    /// Stream matching entries to the callback, honouring scope, limits and
    /// cancellation at every entry boundary. Returns the number of entries
    /// emitted.
    fn search(
        &self,
        params: &SearchParams,
        out: &mut dyn FnMut(Arc<EntrySealedCommitted>) -> Result<(), OperationError>,
    ) -> Result<usize, OperationError>;

    fn verify(&self) -> Vec<ConsistencyError>;

    fn backup(&self) -> DbBackup;

    fn restore(&self, backup: DbBackup) -> Result<(), OperationError>;
}

struct MemBackendInner {
    id_next: u64,
    id2entry: BTreeMap<u64, Arc<EntrySealedCommitted>>,
    dn2id: BTreeMap<Dn, u64>,
    idx: Map<IdxKey, BTreeMap<String, IDLBitRange>>,
}

/// The in-memory indexed entry store.
pub struct MemBackend {
    cfg: BackendConfig,
    idx_set: HashSet<IdxKey>,
    inner: RwLock<MemBackendInner>,
}

impl MemBackend {
    pub fn new(cfg: BackendConfig) -> Self {
        let idx_set: HashSet<IdxKey> = cfg.idxkeys.iter().cloned().collect();
        MemBackend {
            cfg,
            idx_set,
            inner: RwLock::new(MemBackendInner {
                id_next: 1,
                id2entry: BTreeMap::new(),
                dn2id: BTreeMap::new(),
                idx: Map::new(),
            }),
        }
    }

    fn idx_insert(
        idx: &mut Map<IdxKey, BTreeMap<String, IDLBitRange>>,
        idx_set: &HashSet<IdxKey>,
        entry: &EntrySealedCommitted,
        id: u64,
    ) {
        for key in idx_set.iter() {
            let Some(vs) = entry.get_ava_set(&key.attr) else {
                continue;
            };
            let table = idx.entry(key.clone()).or_insert_with(BTreeMap::new);
            match key.itype {
                IndexType::Equality => {
                    for v in vs {
                        table.entry(v.idx_eq_key()).or_insert_with(IDLBitRange::new).insert_id(id);
                    }
                }
                IndexType::Presence => {
                    table
                        .entry(IDX_PRESENCE_KEY.to_string())
                        .or_insert_with(IDLBitRange::new)
                        .insert_id(id);
                }
                IndexType::SubString => {
                    for v in vs {
                        for gram in ngrams(&v.idx_eq_key(), IDX_SUBSTRING_NGRAM) {
                            table.entry(gram).or_insert_with(IDLBitRange::new).insert_id(id);
                        }
                    }
                }
            }
        }
    }

    fn idx_remove(
        idx: &mut Map<IdxKey, BTreeMap<String, IDLBitRange>>,
        idx_set: &HashSet<IdxKey>,
        entry: &EntrySealedCommitted,
        id: u64,
    ) {
        for key in idx_set.iter() {
            let Some(vs) = entry.get_ava_set(&key.attr) else {
                continue;
            };
            let Some(table) = idx.get_mut(key) else {
                continue;
            };
            let mut remove_key = |table: &mut BTreeMap<String, IDLBitRange>, k: &str| {
                let empty = if let Some(idl) = table.get_mut(k) {
                    idl.remove_id(id);
                    idl.is_empty()
                } else {
                    false
                };
                if empty {
                    table.remove(k);
                }
            };
            match key.itype {
                IndexType::Equality => {
                    for v in vs {
                        remove_key(table, &v.idx_eq_key());
                    }
                }
                IndexType::Presence => {
                    remove_key(table, IDX_PRESENCE_KEY);
                }
                IndexType::SubString => {
                    for v in vs {
                        for gram in ngrams(&v.idx_eq_key(), IDX_SUBSTRING_NGRAM) {
                            remove_key(table, &gram);
                        }
                    }
                }
            }
        }
    }

    fn get_idl(
        inner: &MemBackendInner,
        attr: &str,
        itype: IndexType,
        key: &str,
    ) -> Option<IDLBitRange> {
        let kref = IdxKeyRef::new(attr, &itype);
        inner
            .idx
            .get((&kref) as &dyn IdxKeyToRef)
            .map(|table| table.get(key).cloned().unwrap_or_else(IDLBitRange::new))
    }

    /// Recursively resolve a filter into a candidate id set using the index
    /// tables. The result is exact (`Indexed`), a superset (`Partial`), or
    /// unresolvable (`AllIds`).
    fn filter2idl(&self, inner: &MemBackendInner, fc: &FilterComp) -> IdList {
        match fc {
            FilterComp::Eq(attr, pv) => {
                if self.is_indexed(attr, IndexType::Equality) {
                    match Self::get_idl(inner, attr, IndexType::Equality, &pv.idx_eq_key()) {
                        Some(idl) => IdList::Indexed(idl),
                        None => IdList::Indexed(IDLBitRange::new()),
                    }
                } else {
                    IdList::AllIds
                }
            }
            FilterComp::Sub(attr, pv) => {
                let needle = match pv.substring_needle() {
                    Some(n) => n,
                    None => return IdList::AllIds,
                };
                if !self.is_indexed(attr, IndexType::SubString)
                    || needle.chars().count() < IDX_SUBSTRING_NGRAM
                {
                    return IdList::AllIds;
                }
                let mut result: Option<IDLBitRange> = None;
                for gram in ngrams(needle, IDX_SUBSTRING_NGRAM) {
                    let idl = Self::get_idl(inner, attr, IndexType::SubString, &gram)
                        .unwrap_or_else(IDLBitRange::new);
                    result = Some(match result {
                        Some(acc) => acc & idl,
                        None => idl,
                    });
                }
                // An n-gram intersection over-approximates the match, so the
                // candidates must be re-tested.
                IdList::Partial(result.unwrap_or_else(IDLBitRange::new))
            }
            FilterComp::Pres(attr) => {
                if self.is_indexed(attr, IndexType::Presence) {
                    match Self::get_idl(inner, attr, IndexType::Presence, IDX_PRESENCE_KEY) {
                        Some(idl) => IdList::Indexed(idl),
                        None => IdList::Indexed(IDLBitRange::new()),
                    }
                } else {
                    IdList::AllIds
                }
            }
            FilterComp::And(fs) => {
                let mut result: Option<IDLBitRange> = None;
                let mut exact = true;
                let mut skipped = false;
                for f in fs {
                    match self.filter2idl(inner, f) {
                        IdList::Indexed(idl) => {
                            result = Some(match result {
                                Some(acc) => acc & idl,
                                None => idl,
                            });
                        }
                        IdList::Partial(idl) => {
                            exact = false;
                            result = Some(match result {
                                Some(acc) => acc & idl,
                                None => idl,
                            });
                        }
                        IdList::AllIds => {
                            // This term contributes nothing; the survivors
                            // must be re-tested against the full filter.
                            exact = false;
                            skipped = true;
                        }
                    }
                    if let Some(acc) = &result {
                        if acc.is_empty() && !skipped {
                            // Nothing can satisfy the conjunction.
                            return IdList::Indexed(IDLBitRange::new());
                        }
                    }
                }
                match result {
                    Some(idl) if exact => IdList::Indexed(idl),
                    Some(idl) => IdList::Partial(idl),
                    None => IdList::AllIds,
                }
            }
            FilterComp::Or(fs) => {
                let mut result = IDLBitRange::new();
                let mut exact = true;
                for f in fs {
                    match self.filter2idl(inner, f) {
                        IdList::Indexed(idl) => result = result | idl,
                        IdList::Partial(idl) => {
                            exact = false;
                            result = result | idl;
                        }
                        // If we find anything unindexed, the whole term is
                        // unindexed.
                        IdList::AllIds => return IdList::AllIds,
                    }
                }
                if exact {
                    IdList::Indexed(result)
                } else {
                    IdList::Partial(result)
                }
            }
            FilterComp::Not(_) => IdList::AllIds,
        }
    }

    fn scope_match(base: &Dn, scope: SearchScope, dn: &Dn) -> bool {
        match scope {
            SearchScope::Base => dn == base,
            SearchScope::OneLevel => dn.parent().as_ref() == Some(base),
            SearchScope::Subtree => dn.is_under(base),
        }
    }
}

impl Backend for MemBackend {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn base_dns(&self) -> &[Dn] {
        &self.cfg.base_dns
    }

    fn writability(&self) -> Writability {
        self.cfg.writability
    }

    fn is_indexed(&self, attr: &str, itype: IndexType) -> bool {
        let kref = IdxKeyRef::new(attr, &itype);
        self.idx_set.contains((&kref) as &dyn IdxKeyToRef)
    }

    fn get_entry(&self, dn: &Dn) -> Option<Arc<EntrySealedCommitted>> {
        let inner = self.inner.read();
        inner
            .dn2id
            .get(dn)
            .and_then(|id| inner.id2entry.get(id))
            .cloned()
    }

    fn entry_count(&self) -> usize {
        self.inner.read().id2entry.len()
    }

    fn add_entry(&self, entry: EntrySealedNew) -> Result<Arc<EntrySealedCommitted>, OperationError> {
        let dn = entry.get_dn().clone();
        if !self.handles_dn(&dn) {
            return Err(OperationError::NoMatchingBackend);
        }

        let mut inner = self.inner.write();
        if inner.dn2id.contains_key(&dn) {
            return Err(OperationError::EntryAlreadyExists);
        }
        if !self.has_base(&dn) {
            let parent_present = dn
                .parent()
                .map(|p| inner.dn2id.contains_key(&p))
                .unwrap_or(false);
            if !parent_present {
                return Err(OperationError::NoSuchParent);
            }
        }

        let id = inner.id_next;
        inner.id_next += 1;
        let committed = Arc::new(entry.into_committed(id));
        Self::idx_insert(&mut inner.idx, &self.idx_set, &committed, id);
        inner.dn2id.insert(dn, id);
        inner.id2entry.insert(id, committed.clone());
        trace!(dn = %committed.get_dn(), id, "backend add");
        Ok(committed)
    }

    fn replace_entry(
        &self,
        entry: EntrySealedCommitted,
    ) -> Result<Arc<EntrySealedCommitted>, OperationError> {
        let mut inner = self.inner.write();
        let id = *inner
            .dn2id
            .get(entry.get_dn())
            .ok_or(OperationError::NoSuchEntry)?;
        if id != entry.get_id() {
            return Err(OperationError::InvalidEntryState);
        }
        let prev = inner
            .id2entry
            .get(&id)
            .cloned()
            .ok_or(OperationError::InvalidState)?;
        Self::idx_remove(&mut inner.idx, &self.idx_set, &prev, id);
        let committed = Arc::new(entry);
        Self::idx_insert(&mut inner.idx, &self.idx_set, &committed, id);
        inner.id2entry.insert(id, committed.clone());
        Ok(committed)
    }

    fn delete_entry(
        &self,
        dn: &Dn,
        subtree: bool,
    ) -> Result<Vec<Arc<EntrySealedCommitted>>, OperationError> {
        let mut inner = self.inner.write();
        if !inner.dn2id.contains_key(dn) {
            return Err(OperationError::NoSuchEntry);
        }

        // Subtree contiguity of the DN order makes this a bounded range walk.
        let doomed: Vec<(Dn, u64)> = inner
            .dn2id
            .range(dn.clone()..)
            .take_while(|(d, _)| d.is_under(dn))
            .map(|(d, id)| (d.clone(), *id))
            .collect();

        if doomed.len() > 1 && !subtree {
            return Err(OperationError::NotAllowedOnNonLeaf);
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for (d, id) in doomed {
            let Some(entry) = inner.id2entry.remove(&id) else {
                return Err(OperationError::InvalidState);
            };
            Self::idx_remove(&mut inner.idx, &self.idx_set, &entry, id);
            inner.dn2id.remove(&d);
            trace!(dn = %d, id, "backend delete");
            removed.push(entry);
        }
        Ok(removed)
    }

    fn rename_entry(
        &self,
        old_dn: &Dn,
        entry: EntrySealedCommitted,
    ) -> Result<Vec<(Dn, Dn)>, OperationError> {
        let new_dn = entry.get_dn().clone();
        let mut inner = self.inner.write();

        let id = *inner.dn2id.get(old_dn).ok_or(OperationError::NoSuchEntry)?;
        if id != entry.get_id() {
            return Err(OperationError::InvalidEntryState);
        }
        if new_dn != *old_dn {
            if inner.dn2id.contains_key(&new_dn) {
                return Err(OperationError::EntryAlreadyExists);
            }
            if new_dn.is_descendant_of(old_dn) {
                // An entry can not be moved beneath itself.
                return Err(OperationError::InvalidRequestState);
            }
        }
        if !self.handles_dn(&new_dn) {
            return Err(OperationError::NoMatchingBackend);
        }
        if !self.has_base(&new_dn) {
            let parent_present = new_dn
                .parent()
                .map(|p| p.is_under(old_dn) || inner.dn2id.contains_key(&p))
                .unwrap_or(false);
            if !parent_present {
                return Err(OperationError::NoSuchParent);
            }
        }

        // Collect the descendants before any mutation.
        let descendants: Vec<(Dn, u64)> = inner
            .dn2id
            .range(old_dn.clone()..)
            .take_while(|(d, _)| d.is_under(old_dn))
            .filter(|(d, _)| *d != old_dn)
            .map(|(d, id)| (d.clone(), *id))
            .collect();

        let mut moved = Vec::with_capacity(descendants.len() + 1);

        // The target itself: attribute content may have changed with the new
        // naming values, so reindex it.
        let prev = inner
            .id2entry
            .get(&id)
            .cloned()
            .ok_or(OperationError::InvalidState)?;
        Self::idx_remove(&mut inner.idx, &self.idx_set, &prev, id);
        let committed = Arc::new(entry);
        Self::idx_insert(&mut inner.idx, &self.idx_set, &committed, id);
        inner.dn2id.remove(old_dn);
        inner.dn2id.insert(new_dn.clone(), id);
        inner.id2entry.insert(id, committed);
        moved.push((old_dn.clone(), new_dn.clone()));

        // Descendants only change location; their attribute content - and so
        // their index entries - are untouched.
        for (d, did) in descendants {
            let Some(dentry) = inner.id2entry.get(&did) else {
                return Err(OperationError::InvalidState);
            };
            let rebased = dentry
                .with_rebased_dn(old_dn, &new_dn)
                .ok_or(OperationError::InvalidState)?;
            let rebased_dn = rebased.get_dn().clone();
            inner.id2entry.insert(did, Arc::new(rebased));
            inner.dn2id.remove(&d);
            inner.dn2id.insert(rebased_dn.clone(), did);
            moved.push((d, rebased_dn));
        }

        trace!(old = %old_dn, new = %new_dn, count = moved.len(), "backend rename");
        Ok(moved)
    }

    fn search(
        &self,
        params: &SearchParams,
        out: &mut dyn FnMut(Arc<EntrySealedCommitted>) -> Result<(), OperationError>,
    ) -> Result<usize, OperationError> {
        let started = Instant::now();
        let check_bounds = |count: usize| -> Result<(), OperationError> {
            if params.cancelled.load(Ordering::Relaxed) {
                return Err(OperationError::Cancelled);
            }
            if let Some(limit) = params.size_limit {
                if count > limit {
                    return Err(OperationError::SizeLimitExceeded);
                }
            }
            if let Some(limit) = params.time_limit {
                if started.elapsed() > limit {
                    return Err(OperationError::TimeLimitExceeded);
                }
            }
            Ok(())
        };

        // Resolve candidates under the read snapshot, then emit outside it.
        let matched: Vec<Arc<EntrySealedCommitted>> = {
            let inner = self.inner.read();
            let idl = self.filter2idl(&inner, params.filter.inner());
            trace!(filter = %params.filter, plan = ?idl, "search candidate plan");

            let exact = matches!(idl, IdList::Indexed(_));
            let candidate_ids: Vec<u64> = match &idl {
                IdList::Indexed(idl) | IdList::Partial(idl) => idl.into_iter().collect(),
                IdList::AllIds => inner.id2entry.keys().copied().collect(),
            };

            let mut matched = Vec::new();
            for id in candidate_ids {
                check_bounds(matched.len())?;
                let Some(entry) = inner.id2entry.get(&id) else {
                    warn!(id, "index referenced a missing entry id");
                    continue;
                };
                if !Self::scope_match(params.base, params.scope, entry.get_dn()) {
                    continue;
                }
                if !exact && !entry.entry_match_no_index(params.filter) {
                    continue;
                }
                if let Some(limit) = params.size_limit {
                    if matched.len() >= limit {
                        return Err(OperationError::SizeLimitExceeded);
                    }
                }
                matched.push(entry.clone());
            }
            matched
        };

        let mut count = 0;
        for entry in matched {
            check_bounds(count)?;
            out(entry)?;
            count += 1;
        }
        Ok(count)
    }

    fn verify(&self) -> Vec<ConsistencyError> {
        let inner = self.inner.read();
        let mut res = Vec::new();

        if inner.dn2id.len() != inner.id2entry.len() {
            res.push(ConsistencyError::DnIndexCorrupt(
                "dn2id and id2entry disagree on entry count".to_string(),
            ));
        }
        for (dn, id) in inner.dn2id.iter() {
            match inner.id2entry.get(id) {
                Some(e) if e.get_dn() == dn => {}
                _ => res.push(ConsistencyError::DnIndexCorrupt(dn.to_string())),
            }
        }
        // Structural invariant: every entry except a base has a present
        // parent.
        for dn in inner.dn2id.keys() {
            if !self.has_base(dn) {
                let ok = dn
                    .parent()
                    .map(|p| inner.dn2id.contains_key(&p))
                    .unwrap_or(false);
                if !ok {
                    res.push(ConsistencyError::DnIndexCorrupt(format!(
                        "orphan entry {dn}"
                    )));
                }
            }
        }

        // Recompute the index tables and compare.
        let mut expected: Map<IdxKey, BTreeMap<String, IDLBitRange>> = Map::new();
        for (id, entry) in inner.id2entry.iter() {
            Self::idx_insert(&mut expected, &self.idx_set, entry, *id);
        }
        let empty = BTreeMap::new();
        for key in self.idx_set.iter() {
            let found = inner.idx.get(key).unwrap_or(&empty);
            let want = expected.get(key).unwrap_or(&empty);
            if found != want {
                res.push(ConsistencyError::BackendIndexSync(format!(
                    "{}:{}",
                    key.attr, key.itype
                )));
            }
        }
        res
    }

    fn backup(&self) -> DbBackup {
        let inner = self.inner.read();
        DbBackup {
            version: DB_BACKUP_VERSION.to_string(),
            entries: inner
                .id2entry
                .values()
                .map(|e| DbEntry::from_entry(e))
                .collect(),
        }
    }

    fn restore(&self, backup: DbBackup) -> Result<(), OperationError> {
        if backup.version != DB_BACKUP_VERSION {
            error!(version = %backup.version, "unknown backup version");
            return Err(OperationError::InvalidState);
        }
        let mut inner = self.inner.write();
        inner.id2entry.clear();
        inner.dn2id.clear();
        inner.idx.clear();
        inner.id_next = 1;

        for dbe in backup.entries {
            let id = inner.id_next;
            inner.id_next += 1;
            let entry = Arc::new(dbe.into_entry(id)?);
            if inner.dn2id.contains_key(entry.get_dn()) {
                return Err(OperationError::EntryAlreadyExists);
            }
            Self::idx_insert(&mut inner.idx, &self.idx_set, &entry, id);
            inner.dn2id.insert(entry.get_dn().clone(), id);
            inner.id2entry.insert(id, entry);
        }
        info!(count = inner.id2entry.len(), "restore complete");
        Ok(())
    }
}

fn ngrams(s: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < n {
        return Vec::new();
    }
    let mut out: Vec<String> = chars.windows(n).map(|w| w.iter().collect()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Routes DNs to backends. A DN belongs to the backend with the most
/// specific matching base, which gives subordinate backends precedence over
/// their superiors.
#[derive(Default, Clone)]
pub struct BackendRouter {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, be: Arc<dyn Backend>) -> Result<(), ConfigError> {
        if self.backends.iter().any(|b| b.name() == be.name()) {
            return Err(ConfigError::DuplicateBackendName(be.name().to_string()));
        }
        for base in be.base_dns() {
            if self
                .backends
                .iter()
                .any(|b| b.base_dns().iter().any(|other| other == base))
            {
                return Err(ConfigError::OverlappingBackendBase(base.to_string()));
            }
        }
        self.backends.push(be);
        Ok(())
    }

    /// Route a DN to the backend that handles it, if any.
    pub fn route(&self, dn: &Dn) -> Option<Arc<dyn Backend>> {
        let mut best: Option<(usize, &Arc<dyn Backend>)> = None;
        for be in &self.backends {
            for base in be.base_dns() {
                if dn.is_under(base) {
                    let depth = base.depth();
                    if best.map(|(d, _)| depth > d).unwrap_or(true) {
                        best = Some((depth, be));
                    }
                }
            }
        }
        best.map(|(_, be)| be.clone())
    }

    /// Does the named backend handle this DN? False when a subordinate
    /// backend claims it instead.
    pub fn handles_entry(&self, name: &str, dn: &Dn) -> bool {
        self.route(dn).map(|be| be.name() == name).unwrap_or(false)
    }

    /// True when `sub` serves a subtree nested beneath one of `sup`'s bases.
    pub fn is_subordinate(&self, sup: &dyn Backend, sub: &dyn Backend) -> bool {
        sub.base_dns()
            .iter()
            .any(|sb| sup.base_dns().iter().any(|pb| sb.is_descendant_of(pb)))
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    /// Every base DN served, in registration order. This is the default
    /// scope set for constraint plugins.
    pub fn all_base_dns(&self) -> Vec<Dn> {
        self.backends
            .iter()
            .flat_map(|b| b.base_dns().iter().cloned())
            .collect()
    }
}

/// The static routing variant: descendant-of-base with explicit exclusions,
/// no backend tree required.
pub fn handles_entry_static(dn: &Dn, base_dns: &[Dn], exclude_dns: &[Dn]) -> bool {
    base_dns.iter().any(|b| dn.is_under(b)) && !exclude_dns.iter().any(|e| dn.is_under(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_cfg() -> BackendConfig {
        BackendConfig::new(
            "example",
            vec![dn!("dc=example,dc=com")],
            vec![
                IdxKey::new(ATTR_OBJECTCLASS, IndexType::Equality),
                IdxKey::new(ATTR_OBJECTCLASS, IndexType::Presence),
                IdxKey::new(ATTR_UID, IndexType::Equality),
                IdxKey::new(ATTR_MAIL, IndexType::Equality),
                IdxKey::new(ATTR_MEMBER, IndexType::Equality),
                IdxKey::new(ATTR_CN, IndexType::SubString),
            ],
        )
    }

    fn seal(e: EntryInitNew) -> EntrySealedNew {
        let schema = Schema::core();
        let s = schema.read();
        e.into_invalid().validate(&s).expect("invalid entry").seal()
    }

    fn base_entry() -> EntrySealedNew {
        seal(entry_init!(
            "dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_DOMAIN)),
            (ATTR_DC, Value::new_iutf8("example"))
        ))
    }

    fn ou_entry(ou: &str) -> EntrySealedNew {
        seal(entry_init!(
            &format!("ou={ou},dc=example,dc=com"),
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_ORGANIZATIONALUNIT)),
            (ATTR_OU, Value::new_iutf8(ou))
        ))
    }

    fn person_entry(uid: &str) -> EntrySealedNew {
        seal(entry_init!(
            &format!("uid={uid},ou=people,dc=example,dc=com"),
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON)),
            (ATTR_CN, Value::new_iutf8(uid)),
            (ATTR_SN, Value::new_iutf8("tester")),
            (ATTR_UID, Value::new_iutf8(uid)),
            (ATTR_MAIL, Value::new_iutf8(&format!("{uid}@example.com")))
        ))
    }

    fn setup() -> MemBackend {
        let be = MemBackend::new(test_cfg());
        be.add_entry(base_entry()).expect("add base");
        be.add_entry(ou_entry("people")).expect("add ou");
        be.add_entry(person_entry("u1")).expect("add u1");
        be.add_entry(person_entry("u2")).expect("add u2");
        be
    }

    fn search_all(be: &MemBackend, scope: SearchScope, f: Filter<FilterInvalid>) -> Vec<String> {
        let schema = Schema::core();
        let s = schema.read();
        let filter = f.validate(&s).expect("invalid filter");
        let cancelled = AtomicBool::new(false);
        let base = dn!("dc=example,dc=com");
        let params = SearchParams::unlimited(&base, scope, &filter, &cancelled);
        let mut out = Vec::new();
        be.search(&params, &mut |e| {
            out.push(e.get_dn().to_string());
            Ok(())
        })
        .expect("search failed");
        out.sort();
        out
    }

    #[test]
    fn test_be_add_get_delete() {
        let be = setup();
        assert_eq!(be.entry_count(), 4);

        let u1 = dn!("uid=u1,ou=people,dc=example,dc=com");
        let e = be.get_entry(&u1).expect("missing u1");
        assert!(e.get_id() > 0);

        // Duplicate add rejected.
        assert_eq!(
            be.add_entry(person_entry("u1")),
            Err(OperationError::EntryAlreadyExists)
        );
        // Orphan add rejected.
        let orphan = seal(entry_init!(
            "uid=x,ou=nowhere,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON)),
            (ATTR_CN, Value::new_iutf8("x")),
            (ATTR_SN, Value::new_iutf8("x")),
            (ATTR_UID, Value::new_iutf8("x"))
        ));
        assert_eq!(be.add_entry(orphan), Err(OperationError::NoSuchParent));
        // Out of base add rejected.
        let foreign = seal(entry_init!(
            "dc=other,dc=net",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_DOMAIN)),
            (ATTR_DC, Value::new_iutf8("other"))
        ));
        assert_eq!(be.add_entry(foreign), Err(OperationError::NoMatchingBackend));

        // Non-leaf delete rejected, subtree delete returns all.
        let people = dn!("ou=people,dc=example,dc=com");
        assert_eq!(
            be.delete_entry(&people, false),
            Err(OperationError::NotAllowedOnNonLeaf)
        );
        let removed = be.delete_entry(&people, true).expect("subtree delete");
        assert_eq!(removed.len(), 3);
        assert_eq!(be.entry_count(), 1);
        assert_eq!(
            be.delete_entry(&people, false),
            Err(OperationError::NoSuchEntry)
        );
        assert!(be.verify().is_empty());
    }

    #[test]
    fn test_be_indexes_maintained() {
        let be = setup();
        assert!(be.verify().is_empty());

        // Mutate u1 and ensure the diff keeps indexes in sync.
        let u1 = dn!("uid=u1,ou=people,dc=example,dc=com");
        let prev = be.get_entry(&u1).expect("missing u1");
        let schema = Schema::core();
        let s = schema.read();
        let mut inv = (*prev).clone().invalidate();
        inv.purge_ava(ATTR_MAIL);
        inv.add_ava(ATTR_MAIL, Value::new_iutf8("changed@example.com"));
        let next = inv.validate(&s).expect("validate").seal();
        be.replace_entry(next).expect("replace");
        assert!(be.verify().is_empty());

        let found = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_MAIL, PartialValue::new_iutf8("changed@example.com"))),
        );
        assert_eq!(found, vec!["uid=u1,ou=people,dc=example,dc=com"]);
        let gone = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_MAIL, PartialValue::new_iutf8("u1@example.com"))),
        );
        assert!(gone.is_empty());
    }

    #[test]
    fn test_be_search_scopes() {
        let be = setup();
        let all = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_pres(ATTR_OBJECTCLASS)),
        );
        assert_eq!(all.len(), 4);

        let schema = Schema::core();
        let s = schema.read();
        let filter = filter!(f_pres(ATTR_OBJECTCLASS)).validate(&s).unwrap();
        let cancelled = AtomicBool::new(false);

        let base = dn!("ou=people,dc=example,dc=com");
        let params = SearchParams::unlimited(&base, SearchScope::Base, &filter, &cancelled);
        let mut out = Vec::new();
        be.search(&params, &mut |e| {
            out.push(e.get_dn().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(out, vec!["ou=people,dc=example,dc=com"]);

        let params = SearchParams::unlimited(&base, SearchScope::OneLevel, &filter, &cancelled);
        let mut out = Vec::new();
        be.search(&params, &mut |e| {
            out.push(e.get_dn().to_string());
            Ok(())
        })
        .unwrap();
        out.sort();
        assert_eq!(
            out,
            vec![
                "uid=u1,ou=people,dc=example,dc=com",
                "uid=u2,ou=people,dc=example,dc=com"
            ]
        );
    }

    #[test]
    fn test_be_search_filters_and_indexes() {
        let be = setup();

        // Indexed equality.
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_UID, PartialValue::new_iutf8("u2"))),
        );
        assert_eq!(r, vec!["uid=u2,ou=people,dc=example,dc=com"]);

        // Unindexed attribute still resolves by full test.
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_SN, PartialValue::new_iutf8("tester"))),
        );
        assert_eq!(r.len(), 2);

        // Substring shorter than the n-gram width falls back to a full test.
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_sub(ATTR_CN, PartialValue::new_iutf8("u1"))),
        );
        assert_eq!(r, vec!["uid=u1,ou=people,dc=example,dc=com"]);

        // Substring long enough to use the trigram index.
        let admin = seal(entry_init!(
            "uid=admin,ou=people,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON)),
            (ATTR_CN, Value::new_iutf8("Directory Administrator")),
            (ATTR_SN, Value::new_iutf8("admin")),
            (ATTR_UID, Value::new_iutf8("admin"))
        ));
        be.add_entry(admin).expect("add admin");
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_sub(ATTR_CN, PartialValue::new_iutf8("ministrat"))),
        );
        assert_eq!(r, vec!["uid=admin,ou=people,dc=example,dc=com"]);
        assert!(be.verify().is_empty());

        // Negation.
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_and(vec![
                f_eq(ATTR_OBJECTCLASS, PartialValue::new_iutf8("inetorgperson")),
                f_not(f_eq(ATTR_UID, PartialValue::new_iutf8("u1"))),
            ])),
        );
        assert_eq!(
            r,
            vec![
                "uid=admin,ou=people,dc=example,dc=com",
                "uid=u2,ou=people,dc=example,dc=com"
            ]
        );
    }

    #[test]
    fn test_be_is_filter_indexed_composition() {
        let be = MemBackend::new(test_cfg());
        let schema = Schema::core();
        let s = schema.read();

        let idx_f = |f: Filter<FilterInvalid>| -> bool {
            be.is_filter_indexed(&f.validate(&s).expect("invalid filter"))
        };

        let f_uid = || f_eq(ATTR_UID, PartialValue::new_iutf8("x"));
        let f_sn = || f_eq(ATTR_SN, PartialValue::new_iutf8("y"));

        assert!(idx_f(filter!(f_uid())));
        assert!(!idx_f(filter!(f_sn())));

        // AND is indexed if any child is indexed.
        assert!(idx_f(filter!(f_and(vec![f_uid(), f_sn()]))));
        assert!(!idx_f(filter!(f_and(vec![f_sn(), f_sn()]))));

        // OR is indexed only if all children are indexed.
        assert!(idx_f(filter!(f_or(vec![
            f_uid(),
            f_eq(ATTR_MAIL, PartialValue::new_iutf8("m"))
        ]))));
        assert!(!idx_f(filter!(f_or(vec![f_uid(), f_sn()]))));

        // NOT is never indexed.
        assert!(!idx_f(filter!(f_not(f_uid()))));
        assert!(!idx_f(filter!(f_and(vec![f_not(f_uid()), f_sn()]))));
        // But an AND with an indexed sibling still is.
        assert!(idx_f(filter!(f_and(vec![f_not(f_sn()), f_uid()]))));
    }

    #[test]
    fn test_be_search_limits_and_cancel() {
        let be = setup();
        let schema = Schema::core();
        let s = schema.read();
        let filter = filter!(f_pres(ATTR_OBJECTCLASS)).validate(&s).unwrap();
        let base = dn!("dc=example,dc=com");

        let cancelled = AtomicBool::new(false);
        let params = SearchParams {
            base: &base,
            scope: SearchScope::Subtree,
            filter: &filter,
            size_limit: Some(2),
            time_limit: None,
            cancelled: &cancelled,
        };
        let r = be.search(&params, &mut |_| Ok(()));
        assert_eq!(r, Err(OperationError::SizeLimitExceeded));

        let cancelled = AtomicBool::new(false);
        let params = SearchParams {
            base: &base,
            scope: SearchScope::Subtree,
            filter: &filter,
            size_limit: None,
            time_limit: Some(Duration::ZERO),
            cancelled: &cancelled,
        };
        let r = be.search(&params, &mut |_| Ok(()));
        assert_eq!(r, Err(OperationError::TimeLimitExceeded));

        let cancelled = AtomicBool::new(true);
        let params = SearchParams::unlimited(&base, SearchScope::Subtree, &filter, &cancelled);
        let r = be.search(&params, &mut |_| Ok(()));
        assert_eq!(r, Err(OperationError::Cancelled));

        // Cancellation raised mid-stream at an entry boundary.
        let cancelled = AtomicBool::new(false);
        let params = SearchParams::unlimited(&base, SearchScope::Subtree, &filter, &cancelled);
        let mut seen = 0;
        let r = be.search(&params, &mut |_| {
            seen += 1;
            cancelled.store(true, Ordering::Relaxed);
            Ok(())
        });
        assert_eq!(r, Err(OperationError::Cancelled));
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_be_rename_subtree() {
        let be = setup();
        let schema = Schema::core();
        let s = schema.read();

        // Move ou=people to ou=moved people.
        let old_dn = dn!("ou=people,dc=example,dc=com");
        let prev = be.get_entry(&old_dn).expect("missing ou");
        let mut inv = (*prev).clone().invalidate();
        inv.set_dn(dn!("ou=moved people,dc=example,dc=com"), true, &s);
        let renamed = inv.validate(&s).expect("validate").seal();

        let moved = be.rename_entry(&old_dn, renamed).expect("rename");
        assert_eq!(moved.len(), 3);
        assert!(moved.contains(&(
            dn!("uid=u1,ou=people,dc=example,dc=com"),
            dn!("uid=u1,ou=moved people,dc=example,dc=com")
        )));

        assert!(be.get_entry(&old_dn).is_none());
        assert!(be
            .get_entry(&dn!("uid=u2,ou=moved people,dc=example,dc=com"))
            .is_some());
        assert!(be.verify().is_empty());

        // Searches find entries at their new location.
        let r = search_all(
            &be,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_UID, PartialValue::new_iutf8("u1"))),
        );
        assert_eq!(r, vec!["uid=u1,ou=moved people,dc=example,dc=com"]);
    }

    #[test]
    fn test_be_rename_conflicts() {
        let be = setup();
        let schema = Schema::core();
        let s = schema.read();

        let u1 = dn!("uid=u1,ou=people,dc=example,dc=com");
        let prev = be.get_entry(&u1).expect("missing u1");

        // Target occupied.
        let mut inv = (*prev).clone().invalidate();
        inv.set_dn(dn!("uid=u2,ou=people,dc=example,dc=com"), true, &s);
        let renamed = inv.validate(&s).expect("validate").seal();
        assert_eq!(
            be.rename_entry(&u1, renamed),
            Err(OperationError::EntryAlreadyExists)
        );

        // New superior missing.
        let mut inv = (*prev).clone().invalidate();
        inv.set_dn(dn!("uid=u1,ou=ghost,dc=example,dc=com"), true, &s);
        let renamed = inv.validate(&s).expect("validate").seal();
        assert_eq!(be.rename_entry(&u1, renamed), Err(OperationError::NoSuchParent));
        assert!(be.verify().is_empty());
    }

    #[test]
    fn test_be_backup_restore_round_trip() {
        let be = setup();
        let backup = be.backup();

        let restored = MemBackend::new(test_cfg());
        restored.restore(backup).expect("restore");
        assert_eq!(restored.entry_count(), 4);
        assert!(restored.verify().is_empty());

        let r = search_all(
            &restored,
            SearchScope::Subtree,
            filter!(f_eq(ATTR_UID, PartialValue::new_iutf8("u1"))),
        );
        assert_eq!(r, vec!["uid=u1,ou=people,dc=example,dc=com"]);
    }

    #[test]
    fn test_router_most_specific_wins() {
        let sup = Arc::new(MemBackend::new(BackendConfig::new(
            "root",
            vec![dn!("dc=example,dc=com")],
            vec![],
        )));
        let sub = Arc::new(MemBackend::new(BackendConfig::new(
            "people",
            vec![dn!("ou=people,dc=example,dc=com")],
            vec![],
        )));

        let mut router = BackendRouter::new();
        router.register(sup.clone()).expect("register sup");
        router.register(sub.clone()).expect("register sub");

        // The subordinate claims its subtree.
        let u = dn!("uid=u1,ou=people,dc=example,dc=com");
        assert_eq!(router.route(&u).map(|b| b.name().to_string()), Some("people".into()));
        assert!(router.handles_entry("people", &u));
        assert!(!router.handles_entry("root", &u));

        // The superior keeps the rest.
        let g = dn!("cn=g,ou=groups,dc=example,dc=com");
        assert!(router.handles_entry("root", &g));

        // Outside everything.
        assert!(router.route(&dn!("dc=other,dc=net")).is_none());

        assert!(router.is_subordinate(sup.as_ref(), sub.as_ref()));
        assert!(!router.is_subordinate(sub.as_ref(), sup.as_ref()));

        // Registration rejects duplicates.
        let dup = Arc::new(MemBackend::new(BackendConfig::new(
            "people",
            vec![dn!("ou=other,dc=example,dc=com")],
            vec![],
        )));
        assert_eq!(
            router.register(dup),
            Err(ConfigError::DuplicateBackendName("people".to_string()))
        );
        let overlap = Arc::new(MemBackend::new(BackendConfig::new(
            "people2",
            vec![dn!("ou=people,dc=example,dc=com")],
            vec![],
        )));
        assert_eq!(
            router.register(overlap),
            Err(ConfigError::OverlappingBackendBase(
                "ou=people,dc=example,dc=com".to_string()
            ))
        );
    }

    #[test]
    fn test_handles_entry_static() {
        let bases = vec![dn!("dc=example,dc=com")];
        let excludes = vec![dn!("ou=private,dc=example,dc=com")];

        assert!(handles_entry_static(
            &dn!("uid=u,ou=people,dc=example,dc=com"),
            &bases,
            &excludes
        ));
        assert!(!handles_entry_static(
            &dn!("uid=u,ou=private,dc=example,dc=com"),
            &bases,
            &excludes
        ));
        assert!(!handles_entry_static(&dn!("dc=other,dc=net"), &bases, &excludes));
    }
}
