//! Portion 元数据：一个 granule 内的一段不可变列存数据

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use crate::common::{InsertWriteId, PathId, PortionId, SchemaVersion, Snapshot, Timestamp};

/// portion_id → 已发布的 portion 句柄
pub type PortionsMap = BTreeMap<PortionId, Arc<PortionRecord>>;

// ── Portion 来源 ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortionKind {
    /// 写入路径直接产生
    Inserted,
    /// compaction 合并产生
    Compacted,
    /// 分层迁移后重写产生
    Evicted,
}

impl PortionKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Inserted  => 0,
            Self::Compacted => 1,
            Self::Evicted   => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Inserted),
            1 => Some(Self::Compacted),
            2 => Some(Self::Evicted),
            _ => None,
        }
    }
}

// ── Blob 引用 ─────────────────────────────────────────────────────────────────

/// 指向底层 blob 存储的一段字节区间（对本层不透明）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRange {
    pub blob_id: String,
    pub offset:  u64,
    pub size:    u64,
}

impl BlobRange {
    pub fn new(blob_id: &str, offset: u64, size: u64) -> Self {
        Self { blob_id: blob_id.into(), offset, size }
    }
}

// ── 统计元数据 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortionMeta {
    pub num_rows:        u64,
    pub raw_bytes:       u64,
    /// 主键区间 [start, end]，按字节序比较
    pub index_key_start: Vec<u8>,
    pub index_key_end:   Vec<u8>,
    /// TTL 列的最大值，决定分层迁移时机
    pub max_event_time:  Option<Timestamp>,
    /// 当前所在存储层；None 表示默认层
    pub tier:            Option<String>,
}

// ── PortionRecord ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortionRecord {
    pub path_id:         PathId,
    pub portion_id:      PortionId,
    pub insert_write_id: Option<InsertWriteId>,
    pub commit_snapshot: Option<Snapshot>,
    pub remove_snapshot: Option<Snapshot>,
    pub kind:            PortionKind,
    pub schema_version:  SchemaVersion,
    pub meta:            PortionMeta,
    pub blobs:           Vec<BlobRange>,
}

impl PortionRecord {
    /// 构建一个已提交的 portion
    pub fn committed(
        path_id:    PathId,
        portion_id: PortionId,
        snapshot:   Snapshot,
        meta:       PortionMeta,
    ) -> Self {
        Self {
            path_id, portion_id,
            insert_write_id: None,
            commit_snapshot: Some(snapshot),
            remove_snapshot: None,
            kind: PortionKind::Compacted,
            schema_version: 1,
            meta,
            blobs: vec![],
        }
    }

    /// 构建一个仅写入缓冲、尚未提交的 portion
    pub fn pending(
        path_id:         PathId,
        portion_id:      PortionId,
        insert_write_id: InsertWriteId,
        meta:            PortionMeta,
    ) -> Self {
        Self {
            path_id, portion_id,
            insert_write_id: Some(insert_write_id),
            commit_snapshot: None,
            remove_snapshot: None,
            kind: PortionKind::Inserted,
            schema_version: 1,
            meta,
            blobs: vec![],
        }
    }

    pub fn with_kind(mut self, kind: PortionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_blobs(mut self, blobs: Vec<BlobRange>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_remove_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.remove_snapshot = Some(snapshot);
        self
    }

    pub fn is_tombstoned(&self) -> bool { self.remove_snapshot.is_some() }

    pub fn is_uncommitted(&self) -> bool {
        self.insert_write_id.is_some() && self.commit_snapshot.is_none()
    }

    /// 进入已提交集合前必须满足：有 commit 快照，且删除快照不早于提交快照
    pub fn valid_snapshot_info(&self) -> bool {
        match (self.commit_snapshot, self.remove_snapshot) {
            (None, _)                 => false,
            (Some(_), None)           => true,
            (Some(commit), Some(rm))  => rm >= commit,
        }
    }

    pub fn set_commit_snapshot(&mut self, snapshot: Snapshot) {
        self.commit_snapshot = Some(snapshot);
    }

    pub fn blob_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }
}

impl fmt::Display for PortionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(path_id={};portion_id={}", self.path_id, self.portion_id)?;
        if let Some(w) = self.insert_write_id {
            write!(f, ";write_id={w}")?;
        }
        if let Some(s) = self.commit_snapshot {
            write!(f, ";commit={s}")?;
        }
        if let Some(s) = self.remove_snapshot {
            write!(f, ";removed={s}")?;
        }
        write!(f, ";kind={:?};rows={};blobs={})", self.kind, self.meta.num_rows, self.blobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PortionMeta {
        PortionMeta { num_rows: 10, raw_bytes: 100, ..Default::default() }
    }

    #[test]
    fn snapshot_validity() {
        let p = PortionRecord::committed(1, 1, Snapshot::new(5, 0), meta());
        assert!(p.valid_snapshot_info());
        assert!(p.clone().with_remove_snapshot(Snapshot::new(5, 0)).valid_snapshot_info());
        assert!(!p.with_remove_snapshot(Snapshot::new(4, 9)).valid_snapshot_info());
        assert!(!PortionRecord::pending(1, 2, 7, meta()).valid_snapshot_info());
    }

    #[test]
    fn pending_becomes_committed() {
        let mut p = PortionRecord::pending(1, 2, 7, meta());
        assert!(p.is_uncommitted());
        p.set_commit_snapshot(Snapshot::new(3, 1));
        assert!(!p.is_uncommitted());
        assert!(p.valid_snapshot_info());
    }
}
