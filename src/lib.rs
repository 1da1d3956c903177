//! # olap-granule-engine
//!
//! 列存引擎的 granule 元数据管理层：每个表（path_id）对应一个 granule，
//! granule 持有该表全部 portion 的权威集合，并在每次变更时同步维护若干
//! 派生结构。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ColumnEngineForLogs                        │
//! │   EngineReadPath (发布进度)   EngineStats   BlobsCounters      │
//! │          │                                                    │
//! │     GranuleMeta × N   (path_id → granule)                     │
//! │   ┌──────┴─────────────────────────────────────────────┐      │
//! │   │ portions          已提交集合（含删除标记）           │      │
//! │   │ pending_portions  写入缓冲，insert_write_id 为键     │      │
//! │   │                                                    │      │
//! │   │ on_before_change_portion / on_after_change_portion │      │
//! │   │   ├─ PortionsIndex        (主键区间有序索引)        │      │
//! │   │   ├─ OptimizerPlanner     (compaction 规划)         │      │
//! │   │   ├─ ActualizationIndex   (分层 / TTL)              │      │
//! │   │   ├─ StatsAccumulator     (全局统计)                │      │
//! │   │   ├─ PortionBlobsGuard    (blob 占用)               │      │
//! │   │   └─ GranuleAdditiveSummary (可加汇总缓存)          │      │
//! │   └────────────────────────────────────────────────────┘      │
//! │          │                                                    │
//! │   PortionAccessor ──► TransactionContext (Execute 阶段持久化) │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础类型 ─────────────────────────────────────────────────────────────────
pub mod common;
pub mod portion;
pub mod schema;

// ── 派生结构 ─────────────────────────────────────────────────────────────────
pub mod index;
pub mod summary;
pub mod blobs;
pub mod stats;
pub mod optimizer;
pub mod actualization;

// ── 持久化 ───────────────────────────────────────────────────────────────────
pub mod codec;
pub mod tx;

// ── Granule 与引擎 ───────────────────────────────────────────────────────────
pub mod granule;
pub mod engine;

pub use common::{GranuleError, Result};
pub use engine::{ColumnEngine, ColumnEngineForLogs, EngineOptions};
pub use granule::{GranuleContext, GranuleMeta};
pub use portion::{PortionRecord, PortionsMap};
