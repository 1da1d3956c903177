//! 有序索引：按主键区间组织 granule 内的存活 portion
//!
//! 条目按 (index_key_start, portion_id) 排序；区间查询沿用 zone map 的
//! min/max 重叠判定，跳过与探测区间不相交的 portion。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use crate::common::PortionId;
use crate::portion::PortionRecord;

#[derive(Debug, Default)]
pub struct PortionsIndex {
    /// (start_key, portion_id) → portion
    by_start: BTreeMap<(Vec<u8>, PortionId), Arc<PortionRecord>>,
    /// portion_id → start_key，删除时定位
    starts:   HashMap<PortionId, Vec<u8>>,
}

impl PortionsIndex {
    pub fn add_portion(&mut self, portion: &Arc<PortionRecord>) {
        let id  = portion.portion_id;
        let key = portion.meta.index_key_start.clone();
        let prev = self.starts.insert(id, key.clone());
        debug_assert!(prev.is_none(), "portion {id} indexed twice");
        self.by_start.insert((key, id), Arc::clone(portion));
    }

    pub fn remove_portion(&mut self, portion: &PortionRecord) {
        let id = portion.portion_id;
        match self.starts.remove(&id) {
            Some(key) => {
                self.by_start.remove(&(key, id));
            }
            None => debug_assert!(false, "portion {id} missing from ordering index"),
        }
    }

    pub fn len(&self) -> usize { self.starts.len() }
    pub fn is_empty(&self) -> bool { self.starts.is_empty() }

    pub fn contains(&self, portion_id: PortionId) -> bool {
        self.starts.contains_key(&portion_id)
    }

    pub fn portion_ids(&self) -> Vec<PortionId> {
        self.by_start.keys().map(|(_, id)| *id).collect()
    }

    /// 按主键起点顺序遍历
    pub fn iter_ordered(&self) -> impl Iterator<Item = &Arc<PortionRecord>> {
        self.by_start.values()
    }

    /// 返回与 [probe_min, probe_max] 有重叠的 portion，按起点排序
    pub fn intersecting(&self, probe_min: &[u8], probe_max: &[u8]) -> Vec<Arc<PortionRecord>> {
        self.by_start.values()
            .take_while(|p| p.meta.index_key_start.as_slice() <= probe_max)
            .filter(|p| p.meta.index_key_end.as_slice() >= probe_min)
            .cloned()
            .collect()
    }
}
