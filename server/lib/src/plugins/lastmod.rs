// Maintains the modification operational attributes: createTimestamp and
// creatorsName on add, modifyTimestamp and modifiersName on every mutating
// operation. The clock is injected so tests can pin it.

use time::OffsetDateTime;

use crate::plugins::{OpKindSet, Plugin, PluginCapability, PluginPhase};
use crate::prelude::*;
use crate::server::DirectoryServer;

type Clock = Box<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub struct LastMod {
    clock: Clock,
}

impl Default for LastMod {
    fn default() -> Self {
        Self::new()
    }
}

impl LastMod {
    pub fn new() -> Self {
        LastMod {
            clock: Box::new(OffsetDateTime::now_utc),
        }
    }

    pub fn with_clock(clock: Clock) -> Self {
        LastMod { clock }
    }

    fn stamp_modify<STATE>(&self, cand: &mut Entry<EntryInvalid, STATE>, ident: &Identity) {
        let now = (self.clock)();
        cand.purge_ava(ATTR_MODIFYTIMESTAMP);
        cand.add_ava(ATTR_MODIFYTIMESTAMP, Value::new_datetime(now));
        cand.purge_ava(ATTR_MODIFIERSNAME);
        cand.add_ava(ATTR_MODIFIERSNAME, Value::new_dn(ident.dn().clone()));
    }
}

impl Plugin for LastMod {
    fn id(&self) -> &'static str {
        "lastmod"
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::new(
            PluginPhase::PreOperation,
            OpKindSet::ADD | OpKindSet::MODIFY | OpKindSet::MODIFY_DN,
        )]
    }

    fn pre_add(
        &self,
        _server: &DirectoryServer,
        cand: &mut EntryInvalidNew,
        ce: &AddEvent,
    ) -> Result<(), OperationError> {
        let now = (self.clock)();
        cand.purge_ava(ATTR_CREATETIMESTAMP);
        cand.add_ava(ATTR_CREATETIMESTAMP, Value::new_datetime(now));
        cand.purge_ava(ATTR_CREATORSNAME);
        cand.add_ava(ATTR_CREATORSNAME, Value::new_dn(ce.ident.dn().clone()));
        self.stamp_modify(cand, &ce.ident);
        Ok(())
    }

    fn pre_modify(
        &self,
        _server: &DirectoryServer,
        _pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        self.stamp_modify(cand, &me.ident);
        Ok(())
    }

    fn pre_modify_dn(
        &self,
        _server: &DirectoryServer,
        _pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        self.stamp_modify(cand, &ev.ident);
        Ok(())
    }
}
