//! 分层 / TTL 实际化索引
//!
//! 跟踪每个存活 portion 的事件时间与当前所在层，按策略提取需要迁移或删除的
//! portion。提取本身开销大，由 granule 负责节流。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use crate::common::{PathId, PortionId, Timestamp};
use crate::portion::{PortionRecord, PortionsMap};

// ── 策略 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name:        String,
    pub evict_after: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieringPolicy {
    /// 按 evict_after 升序
    tiers:            Vec<Tier>,
    ttl_delete_after: Option<Duration>,
}

impl TieringPolicy {
    pub fn new(mut tiers: Vec<Tier>, ttl_delete_after: Option<Duration>) -> Self {
        tiers.sort_by_key(|t| t.evict_after);
        Self { tiers, ttl_delete_after }
    }

    pub fn tier(name: &str, evict_after: Duration) -> Tier {
        Tier { name: name.into(), evict_after }
    }

    /// 给定数据年龄应处的目标；None 表示留在默认层
    fn target_for(&self, age: Duration) -> Option<TieringAction> {
        if self.ttl_delete_after.map(|ttl| age >= ttl).unwrap_or(false) {
            return Some(TieringAction::Delete);
        }
        self.tiers.iter()
            .rev()
            .find(|t| age >= t.evict_after)
            .map(|t| TieringAction::Evict { tier: t.name.clone() })
    }

    fn min_threshold(&self) -> Option<Duration> {
        let first_tier = self.tiers.first().map(|t| t.evict_after);
        match (first_tier, self.ttl_delete_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b)             => a.or(b),
        }
    }
}

// ── 上下文与任务 ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TieringAction {
    Evict { tier: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualizationTask {
    pub path_id:    PathId,
    pub portion_id: PortionId,
    pub action:     TieringAction,
}

/// 新增 portion 时的外部上下文：当前时间与 granule 的全部 portion
pub struct AddExternalContext<'a> {
    pub now:      Timestamp,
    pub portions: &'a PortionsMap,
}

impl<'a> AddExternalContext<'a> {
    pub fn new(now: Timestamp, portions: &'a PortionsMap) -> Self { Self { now, portions } }
}

/// 提取任务时用于把 id 解析回 portion
pub struct ExternalTasksContext<'a> {
    pub portions: &'a PortionsMap,
}

impl<'a> ExternalTasksContext<'a> {
    pub fn new(portions: &'a PortionsMap) -> Self { Self { portions } }
}

/// 一轮分层处理的输出缓冲，跨 granule 共享
#[derive(Debug)]
pub struct TieringProcessContext {
    now:       Timestamp,
    max_tasks: usize,
    tasks:     Vec<ActualizationTask>,
}

impl TieringProcessContext {
    pub fn new(now: Timestamp, max_tasks: usize) -> Self {
        Self { now, max_tasks, tasks: Vec::new() }
    }

    pub fn actual_instant(&self) -> Timestamp { self.now }
    pub fn is_full(&self) -> bool { self.tasks.len() >= self.max_tasks }
    pub fn tasks(&self) -> &[ActualizationTask] { &self.tasks }
    pub fn into_tasks(self) -> Vec<ActualizationTask> { self.tasks }

    /// 缓冲已满时返回 false
    pub fn add_task(&mut self, task: ActualizationTask) -> bool {
        if self.is_full() {
            return false;
        }
        self.tasks.push(task);
        true
    }
}

// ── 接口 ──────────────────────────────────────────────────────────────────────

pub trait ActualizationIndex: Send {
    fn add_portion(&mut self, portion: &Arc<PortionRecord>, context: &AddExternalContext<'_>);
    fn remove_portion(&mut self, portion: &PortionRecord);
    fn extract_tasks(&mut self, context: &mut TieringProcessContext, external: &ExternalTasksContext<'_>);
    /// 替换策略并按 `context` 中的存活 portion 重新登记
    fn refresh_tiering(&mut self, policy: Option<TieringPolicy>, context: &AddExternalContext<'_>);
    fn portion_ids(&self) -> Vec<PortionId>;
}

// ── TieringActualizationIndex ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    event_time: Option<Timestamp>,
    tier:       Option<String>,
}

#[derive(Debug)]
pub struct TieringActualizationIndex {
    path_id: PathId,
    policy:  Option<TieringPolicy>,
    entries: HashMap<PortionId, Entry>,
    by_time: BTreeMap<Timestamp, BTreeSet<PortionId>>,
}

impl TieringActualizationIndex {
    pub fn new(path_id: PathId, policy: Option<TieringPolicy>) -> Self {
        Self { path_id, policy, entries: HashMap::new(), by_time: BTreeMap::new() }
    }

    pub fn policy(&self) -> Option<&TieringPolicy> { self.policy.as_ref() }

    fn register(&mut self, portion: &PortionRecord) {
        let entry = Entry { event_time: portion.meta.max_event_time, tier: portion.meta.tier.clone() };
        if let Some(t) = entry.event_time {
            self.by_time.entry(t).or_default().insert(portion.portion_id);
        }
        self.entries.insert(portion.portion_id, entry);
    }
}

impl ActualizationIndex for TieringActualizationIndex {
    fn add_portion(&mut self, portion: &Arc<PortionRecord>, context: &AddExternalContext<'_>) {
        self.register(portion);
        trace!(
            path_id = self.path_id,
            portion_id = portion.portion_id,
            now = %context.now,
            granule_portions = context.portions.len(),
            "actualization_add_portion"
        );
    }

    fn remove_portion(&mut self, portion: &PortionRecord) {
        let Some(entry) = self.entries.remove(&portion.portion_id) else {
            return;
        };
        if let Some(t) = entry.event_time {
            if let Some(ids) = self.by_time.get_mut(&t) {
                ids.remove(&portion.portion_id);
                if ids.is_empty() {
                    self.by_time.remove(&t);
                }
            }
        }
    }

    fn extract_tasks(&mut self, context: &mut TieringProcessContext, external: &ExternalTasksContext<'_>) {
        let Some(policy) = self.policy.as_ref() else {
            return;
        };
        let Some(min_age) = policy.min_threshold() else {
            return;
        };
        let now = context.actual_instant();
        // by_time 升序即年龄降序，遇到不足最小阈值的即可停止
        for (event_time, ids) in &self.by_time {
            let age = now.saturating_duration_since(*event_time);
            if age < min_age {
                break;
            }
            let Some(target) = policy.target_for(age) else {
                continue;
            };
            for id in ids {
                let live = external.portions.get(id).map(|p| !p.is_tombstoned()).unwrap_or(false);
                if !live {
                    continue;
                }
                let current_tier = self.entries.get(id).and_then(|e| e.tier.as_deref());
                if let TieringAction::Evict { tier } = &target {
                    if current_tier == Some(tier.as_str()) {
                        continue;
                    }
                }
                let task = ActualizationTask { path_id: self.path_id, portion_id: *id, action: target.clone() };
                if !context.add_task(task) {
                    return;
                }
            }
        }
    }

    fn refresh_tiering(&mut self, policy: Option<TieringPolicy>, context: &AddExternalContext<'_>) {
        self.policy = policy;
        self.entries.clear();
        self.by_time.clear();
        for portion in context.portions.values().filter(|p| !p.is_tombstoned()) {
            self.register(portion);
        }
    }

    fn portion_ids(&self) -> Vec<PortionId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
