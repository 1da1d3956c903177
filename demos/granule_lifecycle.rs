//! # olap-granule-engine 使用案例
//!
//! 演示 granule 元数据层的核心流程：
//!
//! 1. 启动 ColumnEngineForLogs
//! 2. 缓冲写入 + 两阶段提交
//! 3. 直写提交
//! 4. Compaction 调度与结果落地
//! 5. 分层 / TTL 任务提取
//! 6. 从持久化记录重建

use std::sync::Arc;
use std::time::Duration;

use olap_granule_engine::{
    actualization::TieringPolicy,
    common::{ManualClock, Snapshot, Timestamp},
    optimizer::SizeBucketsPlannerConstructor,
    portion::{BlobRange, PortionKind, PortionMeta, PortionRecord},
    schema::{ColumnType, KeyColumn, PrimaryKeySchema, StoragesManager},
    tx::MemoryDatabase,
    ColumnEngineForLogs, EngineOptions,
};

const PATH_ID: u64 = 42;

fn meta(day: u32, rows: u64, event_secs: u64) -> PortionMeta {
    PortionMeta {
        num_rows:        rows,
        raw_bytes:       rows * 24,
        index_key_start: format!("2024-03-{day:02} 00:00").into_bytes(),
        index_key_end:   format!("2024-03-{day:02} 23:59").into_bytes(),
        max_event_time:  Some(Timestamp::from_secs(event_secs)),
        tier:            None,
    }
}

fn new_engine(clock: Arc<ManualClock>) -> ColumnEngineForLogs {
    let primary_key = PrimaryKeySchema::new(1, vec![
        KeyColumn::new(0, "event_time", ColumnType::Timestamp),
        KeyColumn::new(1, "host",       ColumnType::Varchar),
    ]);
    let planner = SizeBucketsPlannerConstructor { min_portions_per_task: 3, ..Default::default() };
    let tiering = TieringPolicy::new(
        vec![TieringPolicy::tier("cold", Duration::from_secs(7 * 86_400))],
        Some(Duration::from_secs(30 * 86_400)),
    );
    ColumnEngineForLogs::new(
        EngineOptions::default(),
        primary_key,
        StoragesManager::new(&["cold"]),
        Arc::new(planner),
        Some(tiering),
        clock,
    )
}

fn main() -> olap_granule_engine::Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   olap-granule-engine 演示                                ");
    println!("═══════════════════════════════════════════════════════════\n");

    let now = Timestamp::from_secs(40 * 86_400);
    let clock = Arc::new(ManualClock::new(now));
    let mut db = MemoryDatabase::new();

    // =========================================================================
    // 1. 启动引擎
    // =========================================================================
    println!("【1】启动 ColumnEngineForLogs ...");
    let mut engine = new_engine(clock.clone());
    engine.register_granule(PATH_ID)?;
    println!("    granules = {}\n", engine.granules_count());

    // =========================================================================
    // 2. 缓冲写入：Execute 打快照并持久化，Complete 发布
    // =========================================================================
    println!("【2】缓冲写入 + 两阶段提交 ...");
    let mut tx = engine.begin_transaction();
    for (write_id, day) in [(1u64, 1u32), (2, 2)] {
        let id = engine.next_portion_id();
        let portion = PortionRecord::pending(PATH_ID, id, write_id, meta(day, 1_000, u64::from(day) * 86_400))
            .with_blobs(vec![BlobRange::new(&format!("blob-{id}"), 0, 8_192)]);
        engine.write_pending(&mut tx, portion)?;
    }
    tx.commit(&mut db);

    let mut tx = engine.begin_transaction();
    engine.commit_on_execute(&mut tx, PATH_ID, 1, Snapshot::new(100, 1))?;
    engine.commit_on_execute(&mut tx, PATH_ID, 2, Snapshot::new(100, 2))?;
    tx.commit(&mut db);
    engine.commit_on_complete(PATH_ID, 1)?;
    engine.commit_on_complete(PATH_ID, 2)?;
    if let Some(g) = engine.granule(PATH_ID) {
        println!("    {g}");
    }
    println!("    published = {}\n", engine.read_path().published());

    // =========================================================================
    // 3. 直写提交
    // =========================================================================
    println!("【3】直写提交 ...");
    let id = engine.next_portion_id();
    let mut direct = PortionRecord::pending(PATH_ID, id, 3, meta(35, 500, 35 * 86_400))
        .with_blobs(vec![BlobRange::new(&format!("blob-{id}"), 0, 4_096)]);
    let mut tx = engine.begin_transaction();
    engine.commit_immediate_on_execute(&mut tx, Snapshot::new(101, 1), &mut direct)?;
    tx.commit(&mut db);
    engine.commit_immediate_on_complete(direct)?;
    println!("    persisted records = {}", db.len());
    println!("    blob bytes        = {}\n", engine.blobs_counters().bytes());

    // =========================================================================
    // 4. Compaction
    // =========================================================================
    println!("【4】Compaction 调度 ...");
    for task in engine.compaction_candidates(10) {
        println!("    task: path_id={} portions={:?} priority={}", task.path_id, task.portion_ids, task.priority);
        engine.granule_mut(task.path_id)?.on_compaction_started();

        let id = engine.next_portion_id();
        let merged = PortionRecord::committed(task.path_id, id, Snapshot::new(102, 1), meta(1, 2_500, 35 * 86_400))
            .with_kind(PortionKind::Compacted)
            .with_blobs(vec![BlobRange::new(&format!("blob-{id}"), 0, 12_000)]);
        let mut tx = engine.begin_transaction();
        engine.apply_compaction_on_execute(&mut tx, task.path_id, &task.portion_ids, std::slice::from_ref(&merged))?;
        tx.commit(&mut db);
        engine.apply_compaction_on_complete(task.path_id, &task.portion_ids, vec![merged])?;
    }
    if let Some(g) = engine.granule(PATH_ID) {
        println!("    {g}\n");
    }

    // =========================================================================
    // 5. 分层 / TTL
    // =========================================================================
    println!("【5】分层任务提取 ...");
    for task in engine.build_actualization_tasks() {
        println!("    portion {} → {:?}", task.portion_id, task.action);
    }
    clock.advance(Duration::from_secs(86_400));
    println!("    一天后再次提取: {} 个任务\n", engine.build_actualization_tasks().len());

    // =========================================================================
    // 6. 重建
    // =========================================================================
    println!("【6】从持久化记录重建 ...");
    let mut reloaded = new_engine(clock);
    let loaded = reloaded.load_persisted(db.records())?;
    println!("    loaded records = {loaded}");
    if let Ok(g) = reloaded.granule_mut(PATH_ID) {
        let summary = g.additive_summary().clone();
        println!("    rows (inserted / compacted) = {} / {}", summary.inserted().rows, summary.compacted().rows);
    }
    println!("    next portion id = {}", reloaded.next_portion_id());

    println!("\n演示完成 ✓");
    Ok(())
}
