//! Compaction 规划器
//!
//! 规划器是可替换的策略对象：granule 只通过 [`OptimizerPlanner`] 喂给它存活
//! portion 的增删，并向它索取 compaction 任务。替换规划器时先让新的
//! [`PlannerConstructor`] 尝试原地调整现有实例（按具体类型向下转型），失败才
//! 重建并整体回灌。

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use crate::common::{GranuleError, PathId, PortionId, Result, Timestamp};
use crate::portion::{PortionKind, PortionRecord, PortionsMap};
use crate::schema::{PrimaryKeySchema, StoragesManager};

// ── 构建上下文 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub path_id:     PathId,
    pub storages:    Arc<StoragesManager>,
    pub primary_key: Arc<PrimaryKeySchema>,
}

impl BuildContext {
    pub fn new(
        path_id:     PathId,
        storages:    Arc<StoragesManager>,
        primary_key: Arc<PrimaryKeySchema>,
    ) -> Self {
        Self { path_id, storages, primary_key }
    }
}

// ── ModificationGuard ─────────────────────────────────────────────────────────

/// 批量收集对规划器工作集的增删，由 granule 一次性提交
///
/// 同一批次内先加入后删除的 portion 互相抵消，不会出现在提交结果里。
#[derive(Debug, Default)]
#[must_use = "a modification guard must be flushed into the planner"]
pub struct ModificationGuard {
    add:    PortionsMap,
    remove: PortionsMap,
}

impl ModificationGuard {
    pub fn add_portion(&mut self, portion: &Arc<PortionRecord>) {
        self.add.insert(portion.portion_id, Arc::clone(portion));
    }

    pub fn remove_portion(&mut self, portion: &Arc<PortionRecord>) {
        if self.add.remove(&portion.portion_id).is_none() {
            self.remove.insert(portion.portion_id, Arc::clone(portion));
        }
    }

    pub fn is_empty(&self) -> bool { self.add.is_empty() && self.remove.is_empty() }

    pub fn into_parts(self) -> (PortionsMap, PortionsMap) { (self.add, self.remove) }
}

// ── 规划器接口 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub path_id:        PathId,
    pub portion_ids:    Vec<PortionId>,
    pub target_storage: String,
    pub priority:       u64,
}

pub trait OptimizerPlanner: Any + Send {
    fn start_modification_guard(&self) -> ModificationGuard {
        ModificationGuard::default()
    }

    /// 先应用 `remove` 再应用 `add`，同一 id 同时出现即为替换
    fn modify_portions(&mut self, add: &PortionsMap, remove: &PortionsMap);

    /// 0 表示当前无需 compaction
    fn compaction_priority(&self) -> u64;

    fn next_compaction_task(&self) -> Option<CompactionTask>;

    /// 推进规划器内部的时间相关状态
    fn actualize(&mut self, _now: Timestamp) {}

    fn portion_ids(&self) -> Vec<PortionId>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait PlannerConstructor: Send + Sync {
    fn build_planner(&self, context: &BuildContext) -> Result<Box<dyn OptimizerPlanner>>;

    /// 能原地调整 `current` 时返回 true
    fn apply_to_current(&self, current: &mut dyn OptimizerPlanner) -> bool;
}

// ── SizeBucketsPlanner ────────────────────────────────────────────────────────
//
// 按 blob 字节数的 log2 分桶；同一桶内的 portion 数量达到阈值即可合并。
// 写入路径产生的小 portion 若在桶内等待超过 max_wait，也会以最低优先级被提出。

const MAX_BUCKET: u32 = 40;

#[derive(Debug, Clone)]
pub struct SizeBucketsPlannerConstructor {
    pub bucket_base_bytes:     u64,
    pub min_portions_per_task: usize,
    pub max_portions_per_task: usize,
    pub max_wait:              Duration,
}

impl Default for SizeBucketsPlannerConstructor {
    fn default() -> Self {
        Self {
            bucket_base_bytes:     1 << 20,
            min_portions_per_task: 4,
            max_portions_per_task: 16,
            max_wait:              Duration::from_secs(60),
        }
    }
}

impl SizeBucketsPlannerConstructor {
    fn check(&self) -> std::result::Result<(), String> {
        if self.bucket_base_bytes == 0 {
            return Err("bucket_base_bytes must be positive".into());
        }
        if self.min_portions_per_task < 2 || self.max_portions_per_task < self.min_portions_per_task {
            return Err(format!(
                "invalid task bounds [{}, {}]",
                self.min_portions_per_task, self.max_portions_per_task
            ));
        }
        Ok(())
    }
}

impl PlannerConstructor for SizeBucketsPlannerConstructor {
    fn build_planner(&self, context: &BuildContext) -> Result<Box<dyn OptimizerPlanner>> {
        self.check().map_err(|e| GranuleError::PlannerConstruction(context.path_id, e))?;
        if context.primary_key.is_empty() {
            return Err(GranuleError::PlannerConstruction(
                context.path_id, "primary key has no columns".into(),
            ));
        }
        Ok(Box::new(SizeBucketsPlanner {
            path_id:        context.path_id,
            target_storage: context.storages.default_storage().to_string(),
            settings:       self.clone(),
            buckets:        BTreeMap::new(),
            bucket_of:      HashMap::new(),
            first_seen:     HashMap::new(),
            now:            Timestamp::ZERO,
        }))
    }

    fn apply_to_current(&self, current: &mut dyn OptimizerPlanner) -> bool {
        if self.check().is_err() {
            return false;
        }
        match current.as_any_mut().downcast_mut::<SizeBucketsPlanner>() {
            // 分桶边界不变时只需更新阈值
            Some(p) if p.settings.bucket_base_bytes == self.bucket_base_bytes => {
                p.settings = self.clone();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct SizeBucketsPlanner {
    path_id:        PathId,
    target_storage: String,
    settings:       SizeBucketsPlannerConstructor,
    buckets:        BTreeMap<u32, BTreeMap<PortionId, Arc<PortionRecord>>>,
    bucket_of:      HashMap<PortionId, u32>,
    /// 规划器首次看到 portion 时的 actualize 时间
    first_seen:     HashMap<PortionId, Timestamp>,
    now:            Timestamp,
}

impl SizeBucketsPlanner {
    pub fn settings(&self) -> &SizeBucketsPlannerConstructor { &self.settings }

    fn bucket_for(&self, portion: &PortionRecord) -> u32 {
        let units = portion.blob_bytes().max(portion.meta.raw_bytes) / self.settings.bucket_base_bytes;
        (u64::BITS - units.leading_zeros()).min(MAX_BUCKET)
    }

    fn has_starving(&self, bucket: &BTreeMap<PortionId, Arc<PortionRecord>>) -> bool {
        bucket.len() >= 2
            && bucket.values().any(|p| {
                p.kind == PortionKind::Inserted
                    && self.first_seen.get(&p.portion_id)
                        .map(|t| self.now.saturating_duration_since(*t) >= self.settings.max_wait)
                        .unwrap_or(false)
            })
    }

    fn bucket_priority(&self, bucket: &BTreeMap<PortionId, Arc<PortionRecord>>) -> u64 {
        if bucket.len() >= self.settings.min_portions_per_task {
            bucket.len() as u64
        } else if self.has_starving(bucket) {
            1
        } else {
            0
        }
    }
}

impl OptimizerPlanner for SizeBucketsPlanner {
    fn modify_portions(&mut self, add: &PortionsMap, remove: &PortionsMap) {
        for id in remove.keys() {
            if let Some(b) = self.bucket_of.remove(id) {
                if let Some(bucket) = self.buckets.get_mut(&b) {
                    bucket.remove(id);
                    if bucket.is_empty() {
                        self.buckets.remove(&b);
                    }
                }
            }
            self.first_seen.remove(id);
        }
        for (id, portion) in add {
            let b = self.bucket_for(portion);
            if let Some(prev) = self.bucket_of.insert(*id, b) {
                if let Some(bucket) = self.buckets.get_mut(&prev) {
                    bucket.remove(id);
                }
            }
            self.buckets.entry(b).or_default().insert(*id, Arc::clone(portion));
            self.first_seen.entry(*id).or_insert(self.now);
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
    }

    fn compaction_priority(&self) -> u64 {
        self.buckets.values().map(|b| self.bucket_priority(b)).max().unwrap_or(0)
    }

    fn next_compaction_task(&self) -> Option<CompactionTask> {
        let (priority, bucket) = self.buckets.values()
            .map(|b| (self.bucket_priority(b), b))
            .filter(|(prio, _)| *prio > 0)
            .max_by_key(|(prio, _)| *prio)?;
        Some(CompactionTask {
            path_id:        self.path_id,
            portion_ids:    bucket.keys().copied().take(self.settings.max_portions_per_task).collect(),
            target_storage: self.target_storage.clone(),
            priority,
        })
    }

    fn actualize(&mut self, now: Timestamp) {
        if now > self.now {
            self.now = now;
        }
    }

    fn portion_ids(&self) -> Vec<PortionId> {
        let mut ids: Vec<_> = self.bucket_of.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn as_any(&self) -> &dyn Any { self }
    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Snapshot;
    use crate::portion::PortionMeta;
    use crate::schema::{ColumnType, KeyColumn};

    fn context() -> BuildContext {
        BuildContext::new(
            7,
            Arc::new(StoragesManager::new(&["cold"])),
            Arc::new(PrimaryKeySchema::new(1, vec![KeyColumn::new(0, "ts", ColumnType::Timestamp)])),
        )
    }

    fn portion(id: PortionId, raw_bytes: u64) -> Arc<PortionRecord> {
        let meta = PortionMeta { raw_bytes, ..Default::default() };
        Arc::new(PortionRecord::committed(7, id, Snapshot::new(1, 1), meta).with_kind(PortionKind::Inserted))
    }

    fn map(portions: &[Arc<PortionRecord>]) -> PortionsMap {
        portions.iter().map(|p| (p.portion_id, Arc::clone(p))).collect()
    }

    fn constructor(min: usize) -> SizeBucketsPlannerConstructor {
        SizeBucketsPlannerConstructor {
            bucket_base_bytes: 100,
            min_portions_per_task: min,
            max_portions_per_task: 8,
            max_wait: Duration::from_secs(10),
        }
    }

    #[test]
    fn guard_cancels_add_followed_by_remove() {
        let mut g = ModificationGuard::default();
        let p = portion(1, 10);
        g.add_portion(&p);
        g.remove_portion(&p);
        assert!(g.is_empty());

        g.remove_portion(&p);
        g.add_portion(&p);
        let (add, remove) = g.into_parts();
        assert!(add.contains_key(&1) && remove.contains_key(&1));
    }

    #[test]
    fn full_bucket_produces_task() {
        let mut planner = constructor(3).build_planner(&context()).unwrap();
        let small = [portion(1, 10), portion(2, 20), portion(3, 30)];
        planner.modify_portions(&map(&small[..2]), &PortionsMap::new());
        assert_eq!(planner.compaction_priority(), 0);

        planner.modify_portions(&map(&small[2..]), &PortionsMap::new());
        let task = planner.next_compaction_task().unwrap();
        assert_eq!(task.portion_ids, vec![1, 2, 3]);
        assert_eq!(task.target_storage, StoragesManager::DEFAULT_STORAGE);
        assert_eq!(task.priority, 3);

        planner.modify_portions(&PortionsMap::new(), &map(&small[..1]));
        assert_eq!(planner.portion_ids(), vec![2, 3]);
        assert_eq!(planner.compaction_priority(), 0);
    }

    #[test]
    fn starving_inserted_portions_get_low_priority() {
        let mut planner = constructor(4).build_planner(&context()).unwrap();
        planner.actualize(Timestamp::from_secs(100));
        planner.modify_portions(&map(&[portion(1, 10), portion(2, 10)]), &PortionsMap::new());
        assert_eq!(planner.compaction_priority(), 0);
        planner.actualize(Timestamp::from_secs(111));
        assert_eq!(planner.compaction_priority(), 1);
    }

    #[test]
    fn apply_to_current_only_when_buckets_unchanged() {
        let mut planner = constructor(3).build_planner(&context()).unwrap();
        assert!(constructor(5).apply_to_current(planner.as_mut()));
        let p = planner.as_any().downcast_ref::<SizeBucketsPlanner>().unwrap();
        assert_eq!(p.settings().min_portions_per_task, 5);

        let rebucketed = SizeBucketsPlannerConstructor { bucket_base_bytes: 1000, ..constructor(3) };
        assert!(!rebucketed.apply_to_current(planner.as_mut()));
    }

    #[test]
    fn empty_primary_key_fails_construction() {
        let mut ctx = context();
        ctx.primary_key = Arc::new(PrimaryKeySchema::new(1, vec![]));
        let err = constructor(3).build_planner(&ctx).err().unwrap();
        assert!(matches!(err, GranuleError::PlannerConstruction(7, _)));
    }
}
