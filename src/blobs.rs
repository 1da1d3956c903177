//! Blob 驻留量统计
//!
//! 引擎级 [`BlobsCounters`] 被所有 granule 共享；每个 granule 持有一个
//! [`PortionBlobsGuard`]，granule 被丢弃时其仍驻留的 blob 一并从计数中扣除。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use crate::portion::PortionRecord;

#[derive(Debug, Default)]
pub struct BlobsCounters {
    blobs: AtomicU64,
    bytes: AtomicU64,
}

impl BlobsCounters {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn blobs(&self) -> u64 { self.blobs.load(Ordering::Relaxed) }
    pub fn bytes(&self) -> u64 { self.bytes.load(Ordering::Relaxed) }

    /// 为一个 granule 创建计数 guard
    pub fn build_portion_blobs_guard(self: &Arc<Self>) -> PortionBlobsGuard {
        PortionBlobsGuard { counters: Arc::clone(self), blobs: 0, bytes: 0 }
    }

    fn add(&self, blobs: u64, bytes: u64) {
        self.blobs.fetch_add(blobs, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub(&self, blobs: u64, bytes: u64) {
        self.blobs.fetch_sub(blobs, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct PortionBlobsGuard {
    counters: Arc<BlobsCounters>,
    blobs:    u64,
    bytes:    u64,
}

impl PortionBlobsGuard {
    pub fn on_new_portion(&mut self, portion: &PortionRecord) {
        let (blobs, bytes) = (portion.blobs.len() as u64, portion.blob_bytes());
        self.blobs += blobs;
        self.bytes += bytes;
        self.counters.add(blobs, bytes);
    }

    pub fn on_drop_portion(&mut self, portion: &PortionRecord) {
        let (blobs, bytes) = (portion.blobs.len() as u64, portion.blob_bytes());
        debug_assert!(self.blobs >= blobs && self.bytes >= bytes, "blob guard underflow");
        let (blobs, bytes) = (blobs.min(self.blobs), bytes.min(self.bytes));
        self.blobs -= blobs;
        self.bytes -= bytes;
        self.counters.sub(blobs, bytes);
    }

    pub fn blobs(&self) -> u64 { self.blobs }
    pub fn bytes(&self) -> u64 { self.bytes }
}

impl Drop for PortionBlobsGuard {
    fn drop(&mut self) {
        self.counters.sub(self.blobs, self.bytes);
    }
}
