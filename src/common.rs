//! 全局基础类型、时间源与错误定义

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type PathId        = u64;
pub type PortionId     = u64;
pub type InsertWriteId = u64;
pub type SchemaVersion = u64;

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// 事务快照：(plan_step, tx_id) 字典序比较
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Snapshot {
    pub plan_step: u64,
    pub tx_id:     u64,
}

impl Snapshot {
    pub fn new(plan_step: u64, tx_id: u64) -> Self { Self { plan_step, tx_id } }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.plan_step, self.tx_id)
    }
}

// ── Timestamp ─────────────────────────────────────────────────────────────────

/// 微秒精度时间点（自 UNIX epoch 起）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn from_micros(us: u64) -> Self { Self(us) }
    pub fn from_millis(ms: u64) -> Self { Self(ms.saturating_mul(1_000)) }
    pub fn from_secs(s: u64) -> Self { Self(s.saturating_mul(1_000_000)) }

    pub fn as_micros(&self) -> u64 { self.0 }

    /// 距 `earlier` 的时长；`earlier` 更晚时返回 0
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Timestamp {
        let us = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(us))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ── 时间源 ────────────────────────────────────────────────────────────────────

/// 注入式时间源；测试中用 [`ManualClock`] 保证确定性
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeProvider for SystemClock {
    fn now(&self) -> Timestamp {
        let us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Timestamp(u64::try_from(us).unwrap_or(u64::MAX))
    }
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now_us: AtomicU64::new(start.as_micros()) }
    }

    pub fn advance(&self, d: Duration) {
        let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set(&self, ts: Timestamp) {
        self.now_us.store(ts.as_micros(), Ordering::SeqCst);
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_us.load(Ordering::SeqCst))
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GranuleError {
    #[error("incompatible granule: portion path_id={portion_path_id}, granule path_id={granule_path_id}")]
    IncompatibleGranule { granule_path_id: PathId, portion_path_id: PathId },
    #[error("incorrect portion snapshots: {0}")]
    InvalidSnapshot(String),
    #[error("compaction planner construction failed for path_id={0}: {1}")]
    PlannerConstruction(PathId, String),
    #[error("duplicate portion on load: {0}")]
    DuplicateOnLoad(String),
    #[error("pending write not found: insert_write_id={0}")]
    MissingPendingWrite(InsertWriteId),
    #[error("immediate commit conflicts with pending write: insert_write_id={0}")]
    ConflictingImmediateCommit(InsertWriteId),
    #[error("pending write already buffered: insert_write_id={0}")]
    DuplicatePendingWrite(InsertWriteId),
    #[error("portion has no insert_write_id: portion_id={0}")]
    MissingWriteId(PortionId),
    #[error("portion not found: path_id={0} portion_id={1}")]
    PortionNotFound(PathId, PortionId),
    #[error("granule not found: path_id={0}")]
    GranuleNotFound(PathId),
    #[error("portion codec error: {0}")]
    Codec(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

impl GranuleError {
    /// 不变量被破坏、进程不应在此状态下继续运行的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleGranule { .. }
                | Self::InvalidSnapshot(_)
                | Self::PlannerConstruction(..)
                | Self::DuplicateOnLoad(_)
                | Self::MissingPendingWrite(_)
                | Self::ConflictingImmediateCommit(_)
                | Self::DuplicatePendingWrite(_)
                | Self::MissingWriteId(_)
        )
    }
}

impl From<std::io::Error> for GranuleError {
    fn from(e: std::io::Error) -> Self { Self::Codec(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, GranuleError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_orders_by_plan_step_then_tx() {
        assert!(Snapshot::new(1, 9) < Snapshot::new(2, 0));
        assert!(Snapshot::new(2, 1) < Snapshot::new(2, 3));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::from_secs(10));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timestamp::from_millis(11_500));
        assert_eq!(
            clock.now().saturating_duration_since(Timestamp::from_secs(10)),
            Duration::from_millis(1500)
        );
        clock.set(Timestamp::from_secs(5));
        assert_eq!(clock.now(), Timestamp::from_secs(5));
    }

    #[test]
    fn system_clock_reads_wall_time() {
        let clock: Arc<dyn TimeProvider> = Arc::new(SystemClock);
        // 2020-01-01 之后
        assert!(clock.now() > Timestamp::from_secs(1_577_836_800));
    }

    #[test]
    fn fatal_classification() {
        assert!(GranuleError::MissingPendingWrite(1).is_fatal());
        assert!(!GranuleError::PortionNotFound(1, 2).is_fatal());
    }
}
