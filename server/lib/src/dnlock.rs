//! Per-DN read/write locking. Every mutating operation holds the write lock
//! of the DN it changes - and for renames, of both the source and the
//! destination - for the duration of the backend call. Acquisition is
//! bounded: a fixed number of timed attempts, after which the operation
//! surfaces a server error rather than waiting forever. This is what keeps a
//! misbehaving operation from wedging the whole server.

use hashbrown::HashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::Arc;

use crate::prelude::*;

type LockRef = Arc<RwLock<()>>;
type ReadInner = ArcRwLockReadGuard<RawRwLock, ()>;
type WriteInner = ArcRwLockWriteGuard<RawRwLock, ()>;

#[derive(Default)]
pub struct DnLockManager {
    locks: Mutex<HashMap<Dn, LockRef>>,
}

pub struct DnReadGuard<'a> {
    mgr: &'a DnLockManager,
    dn: Dn,
    guard: Option<ReadInner>,
}

pub struct DnWriteGuard<'a> {
    mgr: &'a DnLockManager,
    dn: Dn,
    guard: Option<WriteInner>,
}

impl<'a> Drop for DnReadGuard<'a> {
    fn drop(&mut self) {
        self.guard.take();
        self.mgr.release(&self.dn);
    }
}

impl<'a> Drop for DnWriteGuard<'a> {
    fn drop(&mut self) {
        self.guard.take();
        self.mgr.release(&self.dn);
    }
}

impl<'a> DnWriteGuard<'a> {
    pub fn dn(&self) -> &Dn {
        &self.dn
    }
}

impl DnLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_ref(&self, dn: &Dn) -> LockRef {
        let mut map = self.locks.lock();
        map.entry(dn.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop the table entry once nothing holds or waits on it.
    fn release(&self, dn: &Dn) {
        let mut map = self.locks.lock();
        if let Some(l) = map.get(dn) {
            if Arc::strong_count(l) == 1 {
                map.remove(dn);
            }
        }
    }

    pub fn acquire_read(&self, dn: &Dn) -> Result<DnReadGuard<'_>, OperationError> {
        for attempt in 0..LOCK_RETRY_COUNT {
            let lock = self.lock_ref(dn);
            if let Some(guard) = lock.try_read_arc_for(LOCK_RETRY_TIMEOUT) {
                return Ok(DnReadGuard {
                    mgr: self,
                    dn: dn.clone(),
                    guard: Some(guard),
                });
            }
            // The clone from lock_ref must not pin the table entry.
            drop(lock);
            self.release(dn);
            warn!(%dn, attempt, "unable to acquire read lock, retrying");
        }
        error!(%dn, "failed to acquire read lock after retries");
        Err(OperationError::LockAcquisitionTimeout)
    }

    pub fn acquire_write(&self, dn: &Dn) -> Result<DnWriteGuard<'_>, OperationError> {
        for attempt in 0..LOCK_RETRY_COUNT {
            let lock = self.lock_ref(dn);
            if let Some(guard) = lock.try_write_arc_for(LOCK_RETRY_TIMEOUT) {
                return Ok(DnWriteGuard {
                    mgr: self,
                    dn: dn.clone(),
                    guard: Some(guard),
                });
            }
            drop(lock);
            self.release(dn);
            warn!(%dn, attempt, "unable to acquire write lock, retrying");
        }
        error!(%dn, "failed to acquire write lock after retries");
        Err(OperationError::LockAcquisitionTimeout)
    }

    /// Acquire write locks over two DNs, in canonical order so that two
    /// renames crossing each other can not deadlock. Returns one guard when
    /// both DNs are the same.
    pub fn acquire_write_pair(
        &self,
        a: &Dn,
        b: &Dn,
    ) -> Result<(DnWriteGuard<'_>, Option<DnWriteGuard<'_>>), OperationError> {
        if a == b {
            return self.acquire_write(a).map(|g| (g, None));
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.acquire_write(first)?;
        let g2 = self.acquire_write(second)?;
        Ok((g1, Some(g2)))
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        self.locks.lock().len()
    }
}
