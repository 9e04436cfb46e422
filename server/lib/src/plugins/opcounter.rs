// Operation counters, exposed through an explicit shared metrics object
// rather than process-wide statics so test harnesses and monitoring can own
// the state they observe.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::plugins::{OpKindSet, Plugin, PluginCapability, PluginPhase};
use crate::prelude::*;
use crate::server::DirectoryServer;

#[derive(Debug, Default)]
pub struct PluginMetrics {
    pub adds: AtomicU64,
    pub modifies: AtomicU64,
    pub renames: AtomicU64,
    pub deletes: AtomicU64,
    pub searches: AtomicU64,
    pub failures: AtomicU64,
}

impl PluginMetrics {
    pub fn total(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
            + self.modifies.load(Ordering::Relaxed)
            + self.renames.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.searches.load(Ordering::Relaxed)
    }
}

pub struct OpCounter {
    metrics: Arc<PluginMetrics>,
}

impl OpCounter {
    pub fn new(metrics: Arc<PluginMetrics>) -> Self {
        OpCounter { metrics }
    }
}

impl Plugin for OpCounter {
    fn id(&self) -> &'static str {
        "op_counter"
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::new(
            PluginPhase::PostResponse,
            OpKindSet::all(),
        )]
    }

    fn post_response(&self, _server: &DirectoryServer, kind: OperationKind, rc: ResultCode) {
        let counter = match kind {
            OperationKind::Add => &self.metrics.adds,
            OperationKind::Modify => &self.metrics.modifies,
            OperationKind::ModifyDn => &self.metrics.renames,
            OperationKind::Delete => &self.metrics.deletes,
            OperationKind::Search => &self.metrics.searches,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if rc != ResultCode::Success {
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
