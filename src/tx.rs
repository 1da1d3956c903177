//! 持久化事务上下文
//!
//! Execute 阶段只向事务写集合追加持久化记录；写集合以 (path_id, portion_id)
//! 为键，事务重放时覆盖而不是重复写入。

use std::collections::BTreeMap;
use crate::codec::PersistOptions;
use crate::common::{PathId, PortionId, Timestamp};

pub trait TransactionContext {
    fn now(&self) -> Timestamp;

    fn persist_options(&self) -> PersistOptions { PersistOptions::default() }

    /// 写入一条已编码的 portion 记录
    fn write_portion(&mut self, path_id: PathId, portion_id: PortionId, bytes: Vec<u8>);

    fn erase_portion(&mut self, path_id: PathId, portion_id: PortionId);
}

/// 内存事务：写集合在 [`MemoryTransaction::commit`] 时并入 [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryTransaction {
    now:       Timestamp,
    options:   PersistOptions,
    /// None 表示删除
    write_set: BTreeMap<(PathId, PortionId), Option<Vec<u8>>>,
}

impl MemoryTransaction {
    pub fn new(now: Timestamp, options: PersistOptions) -> Self {
        Self { now, options, write_set: BTreeMap::new() }
    }

    pub fn write_set_len(&self) -> usize { self.write_set.len() }

    pub fn written(&self, path_id: PathId, portion_id: PortionId) -> Option<&[u8]> {
        self.write_set.get(&(path_id, portion_id)).and_then(|v| v.as_deref())
    }

    pub fn commit(self, db: &mut MemoryDatabase) {
        for (key, value) in self.write_set {
            match value {
                Some(bytes) => { db.portions.insert(key, bytes); }
                None        => { db.portions.remove(&key); }
            }
        }
    }
}

impl TransactionContext for MemoryTransaction {
    fn now(&self) -> Timestamp { self.now }
    fn persist_options(&self) -> PersistOptions { self.options }

    fn write_portion(&mut self, path_id: PathId, portion_id: PortionId, bytes: Vec<u8>) {
        self.write_set.insert((path_id, portion_id), Some(bytes));
    }

    fn erase_portion(&mut self, path_id: PathId, portion_id: PortionId) {
        self.write_set.insert((path_id, portion_id), None);
    }
}

/// 已持久化的 portion 记录，重启时用于整体重建
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    portions: BTreeMap<(PathId, PortionId), Vec<u8>>,
}

impl MemoryDatabase {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.portions.len() }
    pub fn is_empty(&self) -> bool { self.portions.is_empty() }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.portions.values().map(Vec::as_slice)
    }

    pub fn contains(&self, path_id: PathId, portion_id: PortionId) -> bool {
        self.portions.contains_key(&(path_id, portion_id))
    }
}
