//! 列存引擎：按 path_id 持有全部 granule
//!
//! 引擎是提交协议的发布端。granule 在 Complete 阶段把 portion 交回给
//! [`ColumnEngine::append_portion`]，由引擎记录发布进度后再写入 granule。

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::actualization::{ActualizationTask, TieringPolicy, TieringProcessContext};
use crate::blobs::BlobsCounters;
use crate::codec::{PersistCodec, PersistOptions, PortionAccessor};
use crate::common::{
    GranuleError, InsertWriteId, PathId, PortionId, Result, Snapshot, TimeProvider,
};
use crate::granule::{GranuleContext, GranuleMeta};
use crate::optimizer::{CompactionTask, PlannerConstructor};
use crate::portion::PortionRecord;
use crate::schema::{PrimaryKeySchema, StoragesManager};
use crate::stats::EngineStats;
use crate::tx::{MemoryTransaction, TransactionContext};

// ── 发布接口 ──────────────────────────────────────────────────────────────────

pub trait ColumnEngine {
    /// 把一个已打上提交快照的 portion 发布到 `granule`
    fn append_portion(&mut self, granule: &mut GranuleMeta, portion: PortionRecord) -> Result<()>;
}

/// 发布进度：读路径据此判断哪些数据已可见
#[derive(Debug, Default)]
pub struct EngineReadPath {
    last_portion_id:      PortionId,
    last_commit_snapshot: Option<Snapshot>,
    published:            u64,
}

impl EngineReadPath {
    pub fn last_portion_id(&self) -> PortionId { self.last_portion_id }
    pub fn last_commit_snapshot(&self) -> Option<Snapshot> { self.last_commit_snapshot }
    pub fn published(&self) -> u64 { self.published }
}

impl ColumnEngine for EngineReadPath {
    fn append_portion(&mut self, granule: &mut GranuleMeta, portion: PortionRecord) -> Result<()> {
        let portion_id = portion.portion_id;
        let snapshot = portion.commit_snapshot;
        granule.upsert_portion(portion)?;
        self.last_portion_id = self.last_portion_id.max(portion_id);
        self.last_commit_snapshot = self.last_commit_snapshot.max(snapshot);
        self.published += 1;
        Ok(())
    }
}

// ── 配置 ──────────────────────────────────────────────────────────────────────

/// 引擎级可调参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// 同一 granule 两次分层任务提取之间的最小间隔
    pub actualization_lag:           Duration,
    /// 同一 granule 两次规划器推进之间的最小间隔
    pub optimizer_actualization_lag: Duration,
    /// 单轮提取的分层任务上限（跨 granule）
    pub max_actualization_tasks:     usize,
    pub persist_compression:         PersistCodec,
    /// 编码体小于该值时不压缩
    pub lz4_threshold_bytes:         usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let persist = PersistOptions::default();
        Self {
            actualization_lag:           Duration::from_secs(1),
            optimizer_actualization_lag: Duration::from_secs(1),
            max_actualization_tasks:     1024,
            persist_compression:         persist.codec,
            lz4_threshold_bytes:         persist.lz4_threshold_bytes,
        }
    }
}

impl EngineOptions {
    pub fn persist_options(&self) -> PersistOptions {
        PersistOptions { codec: self.persist_compression, lz4_threshold_bytes: self.lz4_threshold_bytes }
    }
}

// ── ColumnEngineForLogs ───────────────────────────────────────────────────────

pub struct ColumnEngineForLogs {
    options:         EngineOptions,
    granules:        BTreeMap<PathId, GranuleMeta>,
    read_path:       EngineReadPath,
    stats:           Arc<EngineStats>,
    context:         GranuleContext,
    last_portion_id: PortionId,
}

impl ColumnEngineForLogs {
    pub fn new(
        options:             EngineOptions,
        primary_key:         PrimaryKeySchema,
        storages:            StoragesManager,
        planner_constructor: Arc<dyn PlannerConstructor>,
        tiering:             Option<TieringPolicy>,
        clock:               Arc<dyn TimeProvider>,
    ) -> Self {
        let stats = Arc::new(EngineStats::new());
        let context = GranuleContext {
            stats:       stats.clone(),
            blobs:       BlobsCounters::new(),
            storages:    Arc::new(storages),
            primary_key: Arc::new(primary_key),
            planner_constructor,
            tiering,
            clock,
        };
        Self {
            options,
            granules: BTreeMap::new(),
            read_path: EngineReadPath::default(),
            stats,
            context,
            last_portion_id: 0,
        }
    }

    pub fn options(&self) -> &EngineOptions { &self.options }
    pub fn stats(&self) -> &EngineStats { &self.stats }
    pub fn blobs_counters(&self) -> &BlobsCounters { &self.context.blobs }
    pub fn read_path(&self) -> &EngineReadPath { &self.read_path }
    pub fn granules_count(&self) -> usize { self.granules.len() }

    /// 开启一个沿用引擎持久化配置的事务
    pub fn begin_transaction(&self) -> MemoryTransaction {
        MemoryTransaction::new(self.context.clock.now(), self.options.persist_options())
    }

    /// 分配一个新的 portion id，不与已加载或已发布的 id 冲突
    pub fn next_portion_id(&mut self) -> PortionId {
        self.last_portion_id = self.last_portion_id.max(self.read_path.last_portion_id()) + 1;
        self.last_portion_id
    }

    // ── Granule 管理 ──────────────────────────────────────────────────────────

    /// 取得或创建 `path_id` 的 granule
    pub fn register_granule(&mut self, path_id: PathId) -> Result<&mut GranuleMeta> {
        match self.granules.entry(path_id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let granule = GranuleMeta::new(path_id, &self.context)?;
                debug!(path_id, "granule_registered");
                Ok(e.insert(granule))
            }
        }
    }

    pub fn granule(&self, path_id: PathId) -> Option<&GranuleMeta> {
        self.granules.get(&path_id)
    }

    pub fn granule_mut(&mut self, path_id: PathId) -> Result<&mut GranuleMeta> {
        self.granules.get_mut(&path_id).ok_or(GranuleError::GranuleNotFound(path_id))
    }

    /// 删除不再有已提交 portion 的 granule
    pub fn drop_granule(&mut self, path_id: PathId) -> Result<bool> {
        let granule = self.granule_mut(path_id)?;
        if !granule.is_erasable() {
            return Ok(false);
        }
        self.granules.remove(&path_id);
        self.stats.forget_granule(path_id);
        debug!(path_id, "granule_dropped");
        Ok(true)
    }

    // ── 重建 ──────────────────────────────────────────────────────────────────

    pub fn load_portion(&mut self, portion: PortionRecord) -> Result<()> {
        self.last_portion_id = self.last_portion_id.max(portion.portion_id);
        self.register_granule(portion.path_id)?.load_portion(portion)
    }

    /// 加载结束后为本轮有新记录的 granule 构建派生结构；已上线的 granule 不受影响
    pub fn finish_load(&mut self) {
        let mut finalised = 0usize;
        for granule in self.granules.values_mut() {
            if granule.on_after_portions_load() {
                finalised += 1;
            }
        }
        info!(
            granules = self.granules.len(),
            finalised,
            last_portion_id = self.last_portion_id,
            "engine_loaded"
        );
    }

    /// 从持久化记录整体重建；返回加载的记录数
    pub fn load_persisted<'a, I>(&mut self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut loaded = 0;
        for bytes in records {
            self.load_portion(PortionAccessor::decode(bytes)?)?;
            loaded += 1;
        }
        self.finish_load();
        Ok(loaded)
    }

    // ── 写入与提交 ────────────────────────────────────────────────────────────

    /// 缓冲写入：持久化 pending portion 并放入 granule 的 pending 集合
    pub fn write_pending(&mut self, txc: &mut dyn TransactionContext, portion: PortionRecord) -> Result<()> {
        if !portion.is_uncommitted() {
            return Err(GranuleError::InvalidSnapshot(portion.to_string()));
        }
        PortionAccessor::new(&portion).save_to_database(txc)?;
        self.register_granule(portion.path_id)?.insert_pending_portion(portion)
    }

    pub fn commit_on_execute(
        &mut self,
        txc:      &mut dyn TransactionContext,
        path_id:  PathId,
        write_id: InsertWriteId,
        snapshot: Snapshot,
    ) -> Result<()> {
        self.granule_mut(path_id)?.commit_on_execute(txc, write_id, snapshot)
    }

    pub fn commit_on_complete(&mut self, path_id: PathId, write_id: InsertWriteId) -> Result<()> {
        let Self { granules, read_path, .. } = self;
        let granule = granules.get_mut(&path_id).ok_or(GranuleError::GranuleNotFound(path_id))?;
        granule.commit_on_complete(write_id, read_path)
    }

    /// Execute 阶段不创建 granule；目标 granule 尚不存在时只校验并持久化，
    /// 注册推迟到 Complete
    pub fn commit_immediate_on_execute(
        &self,
        txc:      &mut dyn TransactionContext,
        snapshot: Snapshot,
        portion:  &mut PortionRecord,
    ) -> Result<()> {
        match self.granules.get(&portion.path_id) {
            Some(granule) => granule.commit_immediate_on_execute(txc, snapshot, portion),
            None => {
                if portion.insert_write_id.is_none() {
                    return Err(GranuleError::MissingWriteId(portion.portion_id));
                }
                portion.set_commit_snapshot(snapshot);
                PortionAccessor::new(portion).save_to_database(txc)
            }
        }
    }

    pub fn commit_immediate_on_complete(&mut self, portion: PortionRecord) -> Result<()> {
        self.register_granule(portion.path_id)?;
        let Self { granules, read_path, .. } = self;
        let granule = granules.get_mut(&portion.path_id)
            .ok_or(GranuleError::GranuleNotFound(portion.path_id))?;
        granule.commit_immediate_on_complete(portion, read_path)
    }

    /// 不存在的 granule 或 portion 都返回 false
    pub fn erase_portion(&mut self, path_id: PathId, portion_id: PortionId) -> bool {
        match self.granules.get_mut(&path_id) {
            Some(granule) => granule.erase_portion(portion_id),
            None => {
                warn!(path_id, portion_id, "erase_on_unknown_granule");
                false
            }
        }
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// 按优先级降序收集各 granule 的下一个 compaction 任务
    pub fn compaction_candidates(&self, limit: usize) -> Vec<CompactionTask> {
        let mut tasks: Vec<_> = self.granules.values()
            .filter_map(GranuleMeta::next_compaction_task)
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.path_id.cmp(&b.path_id)));
        tasks.truncate(limit);
        tasks
    }

    /// Compaction 结果的 Execute 阶段：删除输入、写入输出
    pub fn apply_compaction_on_execute(
        &self,
        txc:      &mut dyn TransactionContext,
        path_id:  PathId,
        removed:  &[PortionId],
        appended: &[PortionRecord],
    ) -> Result<()> {
        let granule = self.granules.get(&path_id).ok_or(GranuleError::GranuleNotFound(path_id))?;
        check_compaction_inputs(granule, removed)?;
        for portion in appended {
            check_compacted(granule, portion)?;
        }
        for portion_id in removed {
            txc.erase_portion(path_id, *portion_id);
        }
        for portion in appended {
            PortionAccessor::new(portion).save_to_database(txc)?;
        }
        Ok(())
    }

    /// Compaction 结果的 Complete 阶段：规划器只收到一次合并后的通知
    pub fn apply_compaction_on_complete(
        &mut self,
        path_id:  PathId,
        removed:  &[PortionId],
        appended: Vec<PortionRecord>,
    ) -> Result<()> {
        let granule = self.granules.get_mut(&path_id).ok_or(GranuleError::GranuleNotFound(path_id))?;
        check_compaction_inputs(granule, removed)?;
        for portion in &appended {
            check_compacted(granule, portion)?;
        }
        let mut guard = granule.start_modification_guard();
        for portion_id in removed {
            let erased = granule.erase_portion_with_guard(*portion_id, &mut guard);
            debug_assert!(erased, "compaction input {portion_id} vanished after validation");
        }
        let mut result = Ok(());
        for portion in appended {
            self.last_portion_id = self.last_portion_id.max(portion.portion_id);
            result = granule.upsert_portion_with_guard(portion, &mut guard);
            if result.is_err() {
                break;
            }
        }
        granule.finish_modification_guard(guard);
        result?;
        granule.on_compaction_finished();
        Ok(())
    }

    pub fn reset_optimizers(&mut self, constructor: Arc<dyn PlannerConstructor>) -> Result<()> {
        for granule in self.granules.values_mut() {
            granule.reset_optimizer(
                constructor.as_ref(),
                Arc::clone(&self.context.storages),
                Arc::clone(&self.context.primary_key),
            )?;
        }
        self.context.planner_constructor = constructor;
        Ok(())
    }

    /// 节流地推进全部规划器；返回实际推进的 granule 数
    pub fn actualize_optimizers(&mut self) -> usize {
        let now = self.context.clock.now();
        let lag = self.options.optimizer_actualization_lag;
        self.granules.values_mut()
            .map(|g| g.actualize_optimizer(now, lag))
            .filter(|ran| *ran)
            .count()
    }

    // ── 分层 ──────────────────────────────────────────────────────────────────

    pub fn build_actualization_tasks(&mut self) -> Vec<ActualizationTask> {
        let mut context = TieringProcessContext::new(
            self.context.clock.now(), self.options.max_actualization_tasks,
        );
        for granule in self.granules.values_mut() {
            if context.is_full() {
                break;
            }
            granule.build_actualization_tasks(&mut context, self.options.actualization_lag);
        }
        context.into_tasks()
    }

    pub fn refresh_tiering(&mut self, policy: Option<TieringPolicy>) {
        for granule in self.granules.values_mut() {
            granule.refresh_tiering(policy.clone());
        }
        self.context.tiering = policy;
    }
}

/// 被合并的输入必须仍在已提交集合中
fn check_compaction_inputs(granule: &GranuleMeta, removed: &[PortionId]) -> Result<()> {
    match removed.iter().find(|id| granule.portion_optional(**id).is_none()) {
        Some(id) => Err(GranuleError::PortionNotFound(granule.path_id(), *id)),
        None => Ok(()),
    }
}

fn check_compacted(granule: &GranuleMeta, portion: &PortionRecord) -> Result<()> {
    if portion.path_id != granule.path_id() {
        return Err(GranuleError::IncompatibleGranule {
            granule_path_id: granule.path_id(),
            portion_path_id: portion.path_id,
        });
    }
    if !portion.valid_snapshot_info() {
        return Err(GranuleError::InvalidSnapshot(portion.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ManualClock, Timestamp};
    use crate::optimizer::SizeBucketsPlannerConstructor;
    use crate::portion::{BlobRange, PortionKind, PortionMeta};
    use crate::schema::{ColumnType, KeyColumn};

    fn engine() -> ColumnEngineForLogs {
        let constructor = SizeBucketsPlannerConstructor { min_portions_per_task: 2, ..Default::default() };
        ColumnEngineForLogs::new(
            EngineOptions::default(),
            PrimaryKeySchema::new(1, vec![KeyColumn::new(0, "ts", ColumnType::Timestamp)]),
            StoragesManager::default(),
            Arc::new(constructor),
            None,
            Arc::new(ManualClock::new(Timestamp::from_secs(100))),
        )
    }

    fn committed(path_id: PathId, id: PortionId) -> PortionRecord {
        let meta = PortionMeta { num_rows: 4, raw_bytes: 64, ..Default::default() };
        PortionRecord::committed(path_id, id, Snapshot::new(1, id), meta)
            .with_kind(PortionKind::Inserted)
            .with_blobs(vec![BlobRange::new("b", 0, 64)])
    }

    #[test]
    fn portion_ids_advance_past_loaded_ones() {
        let mut e = engine();
        e.load_portion(committed(1, 41)).unwrap();
        e.finish_load();
        assert_eq!(e.next_portion_id(), 42);
        assert_eq!(e.next_portion_id(), 43);
    }

    #[test]
    fn compaction_finalize_swaps_inputs_for_output() {
        let mut e = engine();
        for _ in 0..3 {
            let id = e.next_portion_id();
            e.register_granule(1).unwrap().upsert_portion(committed(1, id)).unwrap();
        }
        let task = e.compaction_candidates(10).pop().unwrap();
        assert_eq!(task.portion_ids, vec![1, 2, 3]);

        e.granule_mut(1).unwrap().on_compaction_started();
        let out_id = e.next_portion_id();
        let output = committed(1, out_id).with_kind(PortionKind::Compacted);
        let mut tx = e.begin_transaction();
        e.apply_compaction_on_execute(&mut tx, 1, &task.portion_ids, std::slice::from_ref(&output)).unwrap();
        assert_eq!(tx.write_set_len(), 4);
        e.apply_compaction_on_complete(1, &task.portion_ids, vec![output]).unwrap();

        let g = e.granule(1).unwrap();
        assert_eq!(g.portions().keys().copied().collect::<Vec<_>>(), vec![out_id]);
        assert_eq!(g.optimizer_planner().portion_ids(), vec![out_id]);
        assert!(!g.is_insertion_allowed());
        assert!(e.compaction_candidates(10).is_empty());
        assert_eq!(e.blobs_counters().bytes(), 64);
    }

    #[test]
    fn drop_granule_only_when_empty() {
        let mut e = engine();
        e.register_granule(9).unwrap().upsert_portion(committed(9, 1)).unwrap();
        assert!(!e.drop_granule(9).unwrap());
        assert!(e.erase_portion(9, 1));
        assert!(e.drop_granule(9).unwrap());
        assert!(e.stats().granule_info(9).is_none());
        assert!(matches!(e.drop_granule(9), Err(GranuleError::GranuleNotFound(9))));
        assert!(!e.erase_portion(9, 1));
    }

    #[test]
    fn optimizer_rounds_are_throttled_and_resettable() {
        let mut e = engine();
        for _ in 0..2 {
            let id = e.next_portion_id();
            e.register_granule(3).unwrap().upsert_portion(committed(3, id)).unwrap();
        }
        assert_eq!(e.actualize_optimizers(), 1);
        assert_eq!(e.actualize_optimizers(), 0);
        assert_eq!(e.compaction_candidates(10).len(), 1);

        let strict = SizeBucketsPlannerConstructor { min_portions_per_task: 8, bucket_base_bytes: 1, ..Default::default() };
        e.reset_optimizers(Arc::new(strict)).unwrap();
        assert_eq!(e.granule(3).unwrap().optimizer_planner().portion_ids(), vec![1, 2]);
        assert!(e.compaction_candidates(10).is_empty());
    }

    #[test]
    fn second_load_round_leaves_live_granules_alone() {
        let mut e = engine();
        e.load_portion(committed(1, 1)).unwrap();
        e.finish_load();
        e.load_portion(committed(2, 2)).unwrap();
        e.finish_load();
        e.finish_load();

        assert_eq!(e.stats().total().portions, 2);
        assert_eq!(e.stats().total().rows, 8);
        assert_eq!(e.blobs_counters().bytes(), 128);
        for path_id in [1, 2] {
            let g = e.granule(path_id).unwrap();
            assert_eq!(g.portions_index().len(), 1);
            assert_eq!(g.actualization_index().portion_ids().len(), 1);
            assert_eq!(e.stats().granule_info(path_id).unwrap().portions, 1);
        }
    }

    #[test]
    fn compaction_rejects_inputs_the_granule_does_not_hold() {
        let mut e = engine();
        let id = e.next_portion_id();
        e.register_granule(1).unwrap().upsert_portion(committed(1, id)).unwrap();
        e.granule_mut(1).unwrap().on_compaction_started();

        let out_id = e.next_portion_id();
        let output = committed(1, out_id).with_kind(PortionKind::Compacted);
        let removed = [id, 77];
        let mut tx = e.begin_transaction();
        let err = e.apply_compaction_on_execute(&mut tx, 1, &removed, std::slice::from_ref(&output)).unwrap_err();
        assert!(matches!(err, GranuleError::PortionNotFound(1, 77)));
        assert_eq!(tx.write_set_len(), 0);

        let err = e.apply_compaction_on_complete(1, &removed, vec![output]).unwrap_err();
        assert!(matches!(err, GranuleError::PortionNotFound(1, 77)));
        let g = e.granule(1).unwrap();
        assert_eq!(g.portions().keys().copied().collect::<Vec<_>>(), vec![id]);
        assert_eq!(g.portions_index().len(), 1);
        assert_eq!(e.blobs_counters().bytes(), 64);
    }

    #[test]
    fn options_map_to_persist_options() {
        let options = EngineOptions { persist_compression: PersistCodec::None, ..Default::default() };
        assert_eq!(options.persist_options().codec, PersistCodec::None);
    }
}
