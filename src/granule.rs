//! Granule 元数据
//!
//! `GranuleMeta` 是一个 path_id 下全部 portion 的内存权威。所有对已提交集合
//! 的修改都被一对钩子包围：
//!
//! ```text
//!   on_before_change_portion(旧值 | 无)   ← 旧值离开：有序索引 / 规划器 / 实际化索引 / 统计 / 汇总
//!   ── 修改 portions ──
//!   on_after_change_portion(新值 | 无)    ← 新值进入：同上，随后刷新 granule 级统计
//! ```
//!
//! 替换因此总是表现为"先删后加"，各派生结构无需处理差量。打了删除标记的
//! portion 只保留在 `portions` 中，不进入任何派生索引。

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use crate::actualization::{
    ActualizationIndex, AddExternalContext, ExternalTasksContext,
    TieringActualizationIndex, TieringPolicy, TieringProcessContext,
};
use crate::blobs::{BlobsCounters, PortionBlobsGuard};
use crate::codec::PortionAccessor;
use crate::common::{
    GranuleError, InsertWriteId, PathId, PortionId, Result, Snapshot, TimeProvider, Timestamp,
};
use crate::engine::ColumnEngine;
use crate::index::PortionsIndex;
use crate::optimizer::{
    BuildContext, CompactionTask, ModificationGuard, OptimizerPlanner, PlannerConstructor,
};
use crate::portion::{PortionRecord, PortionsMap};
use crate::schema::{PrimaryKeySchema, StoragesManager};
use crate::stats::StatsAccumulator;
use crate::summary::GranuleAdditiveSummary;
use crate::tx::TransactionContext;

// ── 构造上下文 ────────────────────────────────────────────────────────────────

/// 构建 granule 所需的共享协作者
#[derive(Clone)]
pub struct GranuleContext {
    pub stats:               Arc<dyn StatsAccumulator>,
    pub blobs:               Arc<BlobsCounters>,
    pub storages:            Arc<StoragesManager>,
    pub primary_key:         Arc<PrimaryKeySchema>,
    pub planner_constructor: Arc<dyn PlannerConstructor>,
    pub tiering:             Option<TieringPolicy>,
    pub clock:               Arc<dyn TimeProvider>,
}

// ── GranuleMeta ───────────────────────────────────────────────────────────────

pub struct GranuleMeta {
    path_id:          PathId,
    /// 已提交集合
    portions:         PortionsMap,
    /// 仅写入缓冲、尚不可见的 portion
    pending_portions: BTreeMap<InsertWriteId, PortionRecord>,

    portions_index:   PortionsIndex,
    optimizer:        Box<dyn OptimizerPlanner>,
    actualization:    Box<dyn ActualizationIndex>,
    stats:            Arc<dyn StatsAccumulator>,
    blobs_guard:      PortionBlobsGuard,
    clock:            Arc<dyn TimeProvider>,

    /// 要么为空，要么与当前存活集合完全一致
    summary_cache:    Option<GranuleAdditiveSummary>,
    /// 自上次加载收尾以来经 load_portion 进入已提交集合、尚未建立派生结构的 id；
    /// None 表示没有待收尾的加载
    loading:          Option<Vec<PortionId>>,
    allow_insertion:  bool,
    last_modified:    Timestamp,
    next_actualization_due:           Timestamp,
    next_optimizer_actualization_due: Timestamp,
}

impl GranuleMeta {
    pub fn new(path_id: PathId, context: &GranuleContext) -> Result<Self> {
        let build = BuildContext::new(
            path_id, Arc::clone(&context.storages), Arc::clone(&context.primary_key),
        );
        let optimizer = context.planner_constructor.build_planner(&build)?;
        let actualization = Box::new(TieringActualizationIndex::new(path_id, context.tiering.clone()));
        Ok(Self {
            path_id,
            portions:         PortionsMap::new(),
            pending_portions: BTreeMap::new(),
            portions_index:   PortionsIndex::default(),
            optimizer,
            actualization,
            stats:            Arc::clone(&context.stats),
            blobs_guard:      context.blobs.build_portion_blobs_guard(),
            clock:            Arc::clone(&context.clock),
            summary_cache:    None,
            loading:          None,
            allow_insertion:  true,
            last_modified:    context.clock.now(),
            next_actualization_due:           Timestamp::ZERO,
            next_optimizer_actualization_due: Timestamp::ZERO,
        })
    }

    // ── 访问器 ────────────────────────────────────────────────────────────────

    pub fn path_id(&self) -> PathId { self.path_id }
    pub fn portions(&self) -> &PortionsMap { &self.portions }
    pub fn pending_portions(&self) -> &BTreeMap<InsertWriteId, PortionRecord> { &self.pending_portions }
    pub fn portions_index(&self) -> &PortionsIndex { &self.portions_index }
    pub fn optimizer_planner(&self) -> &dyn OptimizerPlanner { self.optimizer.as_ref() }
    pub fn actualization_index(&self) -> &dyn ActualizationIndex { self.actualization.as_ref() }
    pub fn blobs_guard(&self) -> &PortionBlobsGuard { &self.blobs_guard }
    pub fn is_insertion_allowed(&self) -> bool { self.allow_insertion }
    pub fn last_modified(&self) -> Timestamp { self.last_modified }
    pub fn next_actualization_due(&self) -> Timestamp { self.next_actualization_due }

    pub fn portion_optional(&self, portion_id: PortionId) -> Option<&Arc<PortionRecord>> {
        self.portions.get(&portion_id)
    }

    pub fn portion_verified(&self, portion_id: PortionId) -> Result<&Arc<PortionRecord>> {
        self.portions.get(&portion_id)
            .ok_or(GranuleError::PortionNotFound(self.path_id, portion_id))
    }

    pub fn pending_portion_optional(&self, write_id: InsertWriteId) -> Option<&PortionRecord> {
        self.pending_portions.get(&write_id)
    }

    /// 已提交集合为空时 granule 可被整体删除
    pub fn is_erasable(&self) -> bool { self.portions.is_empty() }

    /// 在 `snapshot` 之前提交且仍存活的 portion
    pub fn portions_older_than(&self, snapshot: Snapshot) -> Vec<Arc<PortionRecord>> {
        self.portions.values()
            .filter(|p| !p.is_tombstoned())
            .filter(|p| p.commit_snapshot.map(|c| c < snapshot).unwrap_or(false))
            .cloned()
            .collect()
    }

    // ── Upsert / Erase ────────────────────────────────────────────────────────

    pub fn upsert_portion(&mut self, info: PortionRecord) -> Result<()> {
        self.upsert_portion_impl(info, None)
    }

    /// 同 [`upsert_portion`](Self::upsert_portion)，规划器通知累积到 `guard`
    pub fn upsert_portion_with_guard(&mut self, info: PortionRecord, guard: &mut ModificationGuard) -> Result<()> {
        self.upsert_portion_impl(info, Some(guard))
    }

    fn upsert_portion_impl(&mut self, info: PortionRecord, mut guard: Option<&mut ModificationGuard>) -> Result<()> {
        trace!(path_id = self.path_id, portion = %info, "upsert_portion");
        if info.path_id != self.path_id {
            return Err(GranuleError::IncompatibleGranule {
                granule_path_id: self.path_id,
                portion_path_id: info.path_id,
            });
        }
        if !info.valid_snapshot_info() {
            return Err(GranuleError::InvalidSnapshot(info.to_string()));
        }

        let before = self.portions.get(&info.portion_id).cloned();
        self.on_before_change_portion(before.as_ref(), guard.as_deref_mut());
        let after = Arc::new(info);
        self.portions.insert(after.portion_id, Arc::clone(&after));
        self.on_after_change_portion(Some(&after), guard);
        Ok(())
    }

    /// 不存在时返回 false（幂等）
    pub fn erase_portion(&mut self, portion_id: PortionId) -> bool {
        self.erase_portion_impl(portion_id, None)
    }

    pub fn erase_portion_with_guard(&mut self, portion_id: PortionId, guard: &mut ModificationGuard) -> bool {
        self.erase_portion_impl(portion_id, Some(guard))
    }

    fn erase_portion_impl(&mut self, portion_id: PortionId, mut guard: Option<&mut ModificationGuard>) -> bool {
        let Some(before) = self.portions.get(&portion_id).cloned() else {
            warn!(path_id = self.path_id, portion_id, "portion_erased_already");
            return false;
        };
        trace!(path_id = self.path_id, portion = %before, "portion_erased");
        self.on_before_change_portion(Some(&before), guard.as_deref_mut());
        self.portions.remove(&portion_id);
        self.on_after_change_portion(None, guard);
        true
    }

    pub fn start_modification_guard(&self) -> ModificationGuard {
        self.optimizer.start_modification_guard()
    }

    /// 把批量累积的增删一次性交给规划器
    pub fn finish_modification_guard(&mut self, guard: ModificationGuard) {
        if guard.is_empty() {
            return;
        }
        let (add, remove) = guard.into_parts();
        self.optimizer.modify_portions(&add, &remove);
    }

    // ── before / after 钩子 ───────────────────────────────────────────────────

    fn on_before_change_portion(
        &mut self,
        before: Option<&Arc<PortionRecord>>,
        guard:  Option<&mut ModificationGuard>,
    ) {
        let Some(portion) = before else {
            return;
        };
        self.blobs_guard.on_drop_portion(portion);
        if !portion.is_tombstoned() {
            self.portions_index.remove_portion(portion);
            match guard {
                Some(g) => g.remove_portion(portion),
                None => {
                    let mut g = self.optimizer.start_modification_guard();
                    g.remove_portion(portion);
                    self.finish_modification_guard(g);
                }
            }
            self.actualization.remove_portion(portion);
        }
        self.stats.on_remove_portion(portion);
        if !portion.is_tombstoned() {
            if let Some(cache) = self.summary_cache.as_mut() {
                cache.start_edit().remove_portion(portion);
            }
        }
    }

    fn on_after_change_portion(
        &mut self,
        after: Option<&Arc<PortionRecord>>,
        guard: Option<&mut ModificationGuard>,
    ) {
        if let Some(portion) = after {
            self.blobs_guard.on_new_portion(portion);
            if !portion.is_tombstoned() {
                self.portions_index.add_portion(portion);
                match guard {
                    Some(g) => g.add_portion(portion),
                    None => {
                        let mut g = self.optimizer.start_modification_guard();
                        g.add_portion(portion);
                        self.finish_modification_guard(g);
                    }
                }
                let context = AddExternalContext::new(self.clock.now(), &self.portions);
                self.actualization.add_portion(portion, &context);
            }
            self.stats.on_add_portion(portion);
            if !portion.is_tombstoned() {
                if let Some(cache) = self.summary_cache.as_mut() {
                    cache.start_edit().add_portion(portion);
                }
            }
        }
        self.last_modified = self.last_modified.max(self.clock.now());
        self.stats.update_granule_info(self);
    }

    // ── 可加汇总 ──────────────────────────────────────────────────────────────

    /// 缓存为空时按全部存活 portion 重新累加
    pub fn additive_summary(&mut self) -> &GranuleAdditiveSummary {
        self.summary_cache.get_or_insert_with(|| build_additive_summary(&self.portions))
    }

    pub fn additive_summary_cached(&self) -> Option<&GranuleAdditiveSummary> {
        self.summary_cache.as_ref()
    }

    pub fn invalidate_additive_summary(&mut self) {
        self.summary_cache = None;
    }

    // ── Compaction 生命周期 ───────────────────────────────────────────────────

    pub fn on_compaction_started(&mut self) {
        self.allow_insertion = false;
    }

    // 完成后同样保持 allow_insertion = false，由上层决定何时恢复写入
    pub fn on_compaction_finished(&mut self) {
        self.allow_insertion = false;
        debug!(granule = %self, "on_compaction_finished");
        self.stats.update_granule_info(self);
    }

    pub fn on_compaction_failed(&mut self, reason: &str) {
        self.allow_insertion = false;
        warn!(granule = %self, reason, "on_compaction_failed");
        self.stats.update_granule_info(self);
    }

    pub fn compaction_priority(&self) -> u64 {
        self.optimizer.compaction_priority()
    }

    pub fn next_compaction_task(&self) -> Option<CompactionTask> {
        self.optimizer.next_compaction_task()
    }

    // ── 批量加载 ──────────────────────────────────────────────────────────────

    /// 重建时直接写入 map，不经过 before/after 钩子；
    /// 调用方必须在本轮加载结束后调用 [`on_after_portions_load`](Self::on_after_portions_load)
    pub fn load_portion(&mut self, portion: PortionRecord) -> Result<()> {
        if portion.path_id != self.path_id {
            return Err(GranuleError::IncompatibleGranule {
                granule_path_id: self.path_id,
                portion_path_id: portion.path_id,
            });
        }
        let pending_write = if portion.is_uncommitted() { portion.insert_write_id } else { None };
        if let Some(write_id) = pending_write {
            match self.pending_portions.entry(write_id) {
                Entry::Occupied(_) => return Err(GranuleError::DuplicateOnLoad(portion.to_string())),
                Entry::Vacant(e) => {
                    e.insert(portion);
                }
            }
            self.loading.get_or_insert_with(Vec::new);
        } else {
            let portion_id = portion.portion_id;
            match self.portions.entry(portion_id) {
                Entry::Occupied(_) => return Err(GranuleError::DuplicateOnLoad(portion.to_string())),
                Entry::Vacant(e) => {
                    e.insert(Arc::new(portion));
                }
            }
            self.loading.get_or_insert_with(Vec::new).push(portion_id);
        }
        Ok(())
    }

    /// 加载结束后为本轮加载的 portion 构建派生结构；规划器通知合并为一次提交。
    ///
    /// 只处理上次收尾之后 `load_portion` 放入的记录，已上线的 portion 不会被重复登记。
    /// 没有待收尾的加载时直接返回 false。
    pub fn on_after_portions_load(&mut self) -> bool {
        let Some(loaded_ids) = self.loading.take() else {
            trace!(path_id = self.path_id, "granule_load_already_finalised");
            return false;
        };
        let portions: Vec<_> = loaded_ids.iter()
            .filter_map(|id| self.portions.get(id).cloned())
            .collect();
        let mut guard = self.optimizer.start_modification_guard();
        for portion in &portions {
            self.on_after_change_portion(Some(portion), Some(&mut guard));
        }
        self.finish_modification_guard(guard);
        self.summary_cache = None;
        self.stats.update_granule_info(self);
        debug!(
            path_id = self.path_id,
            loaded = portions.len(),
            portions = self.portions.len(),
            pending = self.pending_portions.len(),
            "granule_loaded"
        );
        true
    }

    // ── 规划器 ────────────────────────────────────────────────────────────────

    pub fn reset_optimizer(
        &mut self,
        constructor: &dyn PlannerConstructor,
        storages:    Arc<StoragesManager>,
        primary_key: Arc<PrimaryKeySchema>,
    ) -> Result<()> {
        if constructor.apply_to_current(self.optimizer.as_mut()) {
            debug!(path_id = self.path_id, "optimizer_adjusted_in_place");
            return Ok(());
        }
        let context = BuildContext::new(self.path_id, storages, primary_key);
        self.optimizer = constructor.build_planner(&context)?;
        let live: PortionsMap = self.portions.iter()
            .filter(|(_, p)| !p.is_tombstoned())
            .map(|(id, p)| (*id, Arc::clone(p)))
            .collect();
        self.optimizer.modify_portions(&live, &PortionsMap::new());
        debug!(path_id = self.path_id, portions = live.len(), "optimizer_rebuilt");
        Ok(())
    }

    /// 节流地推进规划器；实际执行时返回 true
    pub fn actualize_optimizer(&mut self, now: Timestamp, lag: Duration) -> bool {
        if now < self.next_optimizer_actualization_due {
            return false;
        }
        self.optimizer.actualize(now);
        self.next_optimizer_actualization_due = now + lag;
        true
    }

    // ── 实际化 ────────────────────────────────────────────────────────────────

    /// 距上次提取不足 `lag` 时不做任何事；实际执行提取时返回 true
    pub fn build_actualization_tasks(&mut self, context: &mut TieringProcessContext, lag: Duration) -> bool {
        let now = context.actual_instant();
        if now < self.next_actualization_due {
            return false;
        }
        let before = context.tasks().len();
        let external = ExternalTasksContext::new(&self.portions);
        self.actualization.extract_tasks(context, &external);
        self.next_actualization_due = now + lag;
        debug!(
            path_id = self.path_id,
            extracted = context.tasks().len() - before,
            next_due = %self.next_actualization_due,
            "actualization_tasks_built"
        );
        true
    }

    /// 替换分层策略；下一次提取不受节流限制
    pub fn refresh_tiering(&mut self, policy: Option<TieringPolicy>) {
        let context = AddExternalContext::new(self.clock.now(), &self.portions);
        self.actualization.refresh_tiering(policy, &context);
        self.next_actualization_due = Timestamp::ZERO;
    }

    // ── 提交协议 ──────────────────────────────────────────────────────────────

    /// 写入缓冲落地：portion 以 insert_write_id 为键进入 pending 集合
    pub fn insert_pending_portion(&mut self, portion: PortionRecord) -> Result<()> {
        if portion.path_id != self.path_id {
            return Err(GranuleError::IncompatibleGranule {
                granule_path_id: self.path_id,
                portion_path_id: portion.path_id,
            });
        }
        let write_id = portion.insert_write_id.ok_or(GranuleError::MissingWriteId(portion.portion_id))?;
        if !portion.is_uncommitted() {
            return Err(GranuleError::InvalidSnapshot(portion.to_string()));
        }
        match self.pending_portions.entry(write_id) {
            Entry::Occupied(_) => Err(GranuleError::DuplicatePendingWrite(write_id)),
            Entry::Vacant(e) => {
                e.insert(portion);
                Ok(())
            }
        }
    }

    /// 缓冲路径 Execute：为 pending portion 打上提交快照并持久化；可重放
    pub fn commit_on_execute(
        &mut self,
        txc:      &mut dyn TransactionContext,
        write_id: InsertWriteId,
        snapshot: Snapshot,
    ) -> Result<()> {
        let portion = self.pending_portions.get_mut(&write_id)
            .ok_or(GranuleError::MissingPendingWrite(write_id))?;
        portion.set_commit_snapshot(snapshot);
        PortionAccessor::new(portion).save_to_database(txc)
    }

    /// 缓冲路径 Complete：把 pending portion 交给引擎发布，并移出 pending 集合
    pub fn commit_on_complete<E>(&mut self, write_id: InsertWriteId, engine: &mut E) -> Result<()>
    where
        E: ColumnEngine + ?Sized,
    {
        let portion = self.pending_portions.get(&write_id)
            .ok_or(GranuleError::MissingPendingWrite(write_id))?;
        if !portion.valid_snapshot_info() {
            return Err(GranuleError::InvalidSnapshot(portion.to_string()));
        }
        let portion = self.pending_portions.remove(&write_id)
            .ok_or(GranuleError::MissingPendingWrite(write_id))?;
        engine.append_portion(self, portion)
    }

    /// 直写路径 Execute：portion 不得同时处于 pending 集合
    pub fn commit_immediate_on_execute(
        &self,
        txc:      &mut dyn TransactionContext,
        snapshot: Snapshot,
        portion:  &mut PortionRecord,
    ) -> Result<()> {
        if portion.path_id != self.path_id {
            return Err(GranuleError::IncompatibleGranule {
                granule_path_id: self.path_id,
                portion_path_id: portion.path_id,
            });
        }
        let write_id = portion.insert_write_id.ok_or(GranuleError::MissingWriteId(portion.portion_id))?;
        if self.pending_portions.contains_key(&write_id) {
            return Err(GranuleError::ConflictingImmediateCommit(write_id));
        }
        portion.set_commit_snapshot(snapshot);
        PortionAccessor::new(portion).save_to_database(txc)
    }

    pub fn commit_immediate_on_complete<E>(&mut self, portion: PortionRecord, engine: &mut E) -> Result<()>
    where
        E: ColumnEngine + ?Sized,
    {
        engine.append_portion(self, portion)
    }
}

fn build_additive_summary(portions: &PortionsMap) -> GranuleAdditiveSummary {
    let mut result = GranuleAdditiveSummary::default();
    {
        let mut g = result.start_edit();
        for portion in portions.values().filter(|p| !p.is_tombstoned()) {
            g.add_portion(portion);
        }
    }
    result
}

impl fmt::Display for GranuleMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(path_id={};portions={};pending={};allow_insertion={};priority={})",
            self.path_id,
            self.portions.len(),
            self.pending_portions.len(),
            self.allow_insertion,
            self.optimizer.compaction_priority(),
        )
    }
}
