//! 引擎级统计累加器

use std::collections::HashMap;
use parking_lot::Mutex;
use crate::common::{PathId, Timestamp};
use crate::granule::GranuleMeta;
use crate::portion::{PortionKind, PortionRecord};
use crate::summary::PortionsStats;

/// granule 通过 before/after 协议通知的统计接口
pub trait StatsAccumulator: Send + Sync {
    fn on_add_portion(&self, portion: &PortionRecord);
    fn on_remove_portion(&self, portion: &PortionRecord);
    /// 刷新 granule 级别的快照信息
    fn update_granule_info(&self, granule: &GranuleMeta);
}

/// 某一时刻 granule 的概要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GranuleInfo {
    pub portions:        usize,
    pub pending:         usize,
    pub allow_insertion: bool,
    pub last_modified:   Timestamp,
}

#[derive(Debug, Default)]
struct Inner {
    /// 按来源分类，包含已打删除标记的 portion
    by_kind:  HashMap<PortionKind, PortionsStats>,
    granules: HashMap<PathId, GranuleInfo>,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    inner: Mutex<Inner>,
}

impl EngineStats {
    pub fn new() -> Self { Self::default() }

    pub fn kind_stats(&self, kind: PortionKind) -> PortionsStats {
        self.inner.lock().by_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn total(&self) -> PortionsStats {
        let inner = self.inner.lock();
        let mut t = PortionsStats::default();
        for s in inner.by_kind.values() {
            t.add(s);
        }
        t
    }

    pub fn granule_info(&self, path_id: PathId) -> Option<GranuleInfo> {
        self.inner.lock().granules.get(&path_id).copied()
    }

    pub fn forget_granule(&self, path_id: PathId) {
        self.inner.lock().granules.remove(&path_id);
    }
}

impl StatsAccumulator for EngineStats {
    fn on_add_portion(&self, portion: &PortionRecord) {
        self.inner.lock()
            .by_kind.entry(portion.kind).or_default()
            .add(&PortionsStats::of(portion));
    }

    fn on_remove_portion(&self, portion: &PortionRecord) {
        self.inner.lock()
            .by_kind.entry(portion.kind).or_default()
            .sub(&PortionsStats::of(portion));
    }

    fn update_granule_info(&self, granule: &GranuleMeta) {
        let info = GranuleInfo {
            portions:        granule.portions().len(),
            pending:         granule.pending_portions().len(),
            allow_insertion: granule.is_insertion_allowed(),
            last_modified:   granule.last_modified(),
        };
        self.inner.lock().granules.insert(granule.path_id(), info);
    }
}
