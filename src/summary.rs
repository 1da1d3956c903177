//! Granule 级可加汇总（portion 数、行数、字节数）

use crate::portion::{PortionKind, PortionRecord};

// ── 单类汇总 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortionsStats {
    pub portions:   u64,
    pub rows:       u64,
    pub raw_bytes:  u64,
    pub blob_bytes: u64,
}

impl PortionsStats {
    pub fn of(portion: &PortionRecord) -> Self {
        Self {
            portions:   1,
            rows:       portion.meta.num_rows,
            raw_bytes:  portion.meta.raw_bytes,
            blob_bytes: portion.blob_bytes(),
        }
    }

    pub fn add(&mut self, other: &Self) {
        self.portions   += other.portions;
        self.rows       += other.rows;
        self.raw_bytes  += other.raw_bytes;
        self.blob_bytes += other.blob_bytes;
    }

    pub fn sub(&mut self, other: &Self) {
        debug_assert!(self.portions >= other.portions, "portions stats underflow");
        self.portions   = self.portions.saturating_sub(other.portions);
        self.rows       = self.rows.saturating_sub(other.rows);
        self.raw_bytes  = self.raw_bytes.saturating_sub(other.raw_bytes);
        self.blob_bytes = self.blob_bytes.saturating_sub(other.blob_bytes);
    }
}

// ── GranuleAdditiveSummary ────────────────────────────────────────────────────

/// 写入路径产生的 portion 记入 `inserted`，其余（compaction / 迁移）记入 `compacted`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GranuleAdditiveSummary {
    inserted:  PortionsStats,
    compacted: PortionsStats,
}

impl GranuleAdditiveSummary {
    pub fn inserted(&self) -> &PortionsStats { &self.inserted }
    pub fn compacted(&self) -> &PortionsStats { &self.compacted }

    pub fn total(&self) -> PortionsStats {
        let mut t = self.inserted;
        t.add(&self.compacted);
        t
    }

    /// 开始一次编辑；增量在 guard 析构时一次性生效
    pub fn start_edit(&mut self) -> SummaryEditGuard<'_> {
        SummaryEditGuard {
            owner: self,
            added:   GranuleAdditiveSummary::default(),
            removed: GranuleAdditiveSummary::default(),
        }
    }

    fn bucket_mut(&mut self, kind: PortionKind) -> &mut PortionsStats {
        match kind {
            PortionKind::Inserted => &mut self.inserted,
            PortionKind::Compacted | PortionKind::Evicted => &mut self.compacted,
        }
    }
}

pub struct SummaryEditGuard<'a> {
    owner:   &'a mut GranuleAdditiveSummary,
    added:   GranuleAdditiveSummary,
    removed: GranuleAdditiveSummary,
}

impl SummaryEditGuard<'_> {
    pub fn add_portion(&mut self, portion: &PortionRecord) {
        self.added.bucket_mut(portion.kind).add(&PortionsStats::of(portion));
    }

    pub fn remove_portion(&mut self, portion: &PortionRecord) {
        self.removed.bucket_mut(portion.kind).add(&PortionsStats::of(portion));
    }
}

impl Drop for SummaryEditGuard<'_> {
    fn drop(&mut self) {
        self.owner.inserted.add(&self.added.inserted);
        self.owner.compacted.add(&self.added.compacted);
        self.owner.inserted.sub(&self.removed.inserted);
        self.owner.compacted.sub(&self.removed.compacted);
    }
}
