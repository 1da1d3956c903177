//! 两阶段提交：缓冲路径、直写路径、重启重建

use std::sync::Arc;
use std::time::Duration;
use olap_granule_engine::actualization::{TieringAction, TieringPolicy};
use olap_granule_engine::codec::PersistCodec;
use olap_granule_engine::common::{GranuleError, ManualClock, PathId, Snapshot, Timestamp};
use olap_granule_engine::optimizer::SizeBucketsPlannerConstructor;
use olap_granule_engine::portion::{BlobRange, PortionMeta, PortionRecord};
use olap_granule_engine::schema::{ColumnType, KeyColumn, PrimaryKeySchema, StoragesManager};
use olap_granule_engine::tx::{MemoryDatabase, TransactionContext};
use olap_granule_engine::{ColumnEngineForLogs, EngineOptions};

fn engine_with(options: EngineOptions, tiering: Option<TieringPolicy>, clock: Arc<ManualClock>) -> ColumnEngineForLogs {
    ColumnEngineForLogs::new(
        options,
        PrimaryKeySchema::new(3, vec![
            KeyColumn::new(0, "ts", ColumnType::Timestamp),
            KeyColumn::new(1, "uid", ColumnType::Varchar),
        ]),
        StoragesManager::new(&["cold"]),
        Arc::new(SizeBucketsPlannerConstructor::default()),
        tiering,
        clock,
    )
}

fn engine() -> ColumnEngineForLogs {
    engine_with(EngineOptions::default(), None, Arc::new(ManualClock::new(Timestamp::from_secs(50))))
}

fn meta(rows: u64) -> PortionMeta {
    PortionMeta {
        num_rows:        rows,
        raw_bytes:       rows * 16,
        index_key_start: b"2024-01-01".to_vec(),
        index_key_end:   b"2024-01-31".to_vec(),
        max_event_time:  Some(Timestamp::from_secs(10)),
        ..Default::default()
    }
}

fn pending(e: &mut ColumnEngineForLogs, path_id: PathId, write_id: u64) -> PortionRecord {
    let id = e.next_portion_id();
    PortionRecord::pending(path_id, id, write_id, meta(100))
        .with_blobs(vec![BlobRange::new("b0", 0, 1600)])
}

#[test]
fn buffered_commit_is_visible_exactly_once() {
    let mut e = engine();
    let mut db = MemoryDatabase::new();

    let record = pending(&mut e, 1, 500);
    let portion_id = record.portion_id;
    let mut tx = e.begin_transaction();
    e.write_pending(&mut tx, record).unwrap();
    tx.commit(&mut db);
    assert!(e.granule(1).unwrap().portions().is_empty());
    assert_eq!(e.granule(1).unwrap().pending_portions().len(), 1);

    // Execute 重放只覆盖同一条持久化记录
    let snapshot = Snapshot::new(20, 1);
    let mut tx = e.begin_transaction();
    e.commit_on_execute(&mut tx, 1, 500, snapshot).unwrap();
    e.commit_on_execute(&mut tx, 1, 500, snapshot).unwrap();
    assert_eq!(tx.write_set_len(), 1);
    tx.commit(&mut db);
    assert_eq!(db.len(), 1);

    e.commit_on_complete(1, 500).unwrap();
    let g = e.granule(1).unwrap();
    assert!(g.pending_portions().is_empty());
    assert_eq!(g.portion_verified(portion_id).unwrap().commit_snapshot, Some(snapshot));
    assert!(g.portions_index().contains(portion_id));
    assert_eq!(e.read_path().published(), 1);
    assert_eq!(e.read_path().last_commit_snapshot(), Some(snapshot));

    let err = e.commit_on_complete(1, 500).unwrap_err();
    assert!(matches!(err, GranuleError::MissingPendingWrite(500)));
    assert_eq!(e.granule(1).unwrap().portions().len(), 1);
    assert!(matches!(e.commit_on_complete(2, 500), Err(GranuleError::GranuleNotFound(2))));
}

#[test]
fn immediate_commit_checks_before_stamping() {
    let mut e = engine();

    let mut tx = e.begin_transaction();
    let buffered = pending(&mut e, 1, 700);
    e.write_pending(&mut tx, buffered).unwrap();

    let mut conflicting = pending(&mut e, 1, 700);
    let err = e.commit_immediate_on_execute(&mut tx, Snapshot::new(30, 1), &mut conflicting).unwrap_err();
    assert!(matches!(err, GranuleError::ConflictingImmediateCommit(700)));
    assert!(conflicting.commit_snapshot.is_none());

    let mut anonymous = pending(&mut e, 1, 0);
    anonymous.insert_write_id = None;
    let err = e.commit_immediate_on_execute(&mut tx, Snapshot::new(30, 1), &mut anonymous).unwrap_err();
    assert!(matches!(err, GranuleError::MissingWriteId(_)));

    let mut direct = pending(&mut e, 2, 800);
    let direct_id = direct.portion_id;
    e.commit_immediate_on_execute(&mut tx, Snapshot::new(30, 2), &mut direct).unwrap();
    assert!(tx.written(2, direct_id).is_some());
    assert_eq!(direct.commit_snapshot, Some(Snapshot::new(30, 2)));
    assert!(e.granule(2).is_none());
    assert!(e.stats().granule_info(2).is_none());

    e.commit_immediate_on_complete(direct).unwrap();
    let g = e.granule(2).unwrap();
    assert_eq!(g.portion_verified(direct_id).unwrap().commit_snapshot, Some(Snapshot::new(30, 2)));
    assert_eq!(e.read_path().last_portion_id(), direct_id);
}

#[test]
fn reload_rebuilds_committed_and_pending_sets() {
    let mut e = engine();
    let mut db = MemoryDatabase::new();

    let mut tx = e.begin_transaction();
    let committed = pending(&mut e, 4, 1);
    e.write_pending(&mut tx, committed).unwrap();
    let still_pending = pending(&mut e, 4, 2);
    let still_pending_id = still_pending.portion_id;
    e.write_pending(&mut tx, still_pending).unwrap();
    e.commit_on_execute(&mut tx, 4, 1, Snapshot::new(5, 5)).unwrap();
    tx.commit(&mut db);
    e.commit_on_complete(4, 1).unwrap();
    assert_eq!(db.len(), 2);

    let mut reloaded = engine();
    assert_eq!(reloaded.load_persisted(db.records()).unwrap(), 2);
    let g = reloaded.granule(4).unwrap();
    assert_eq!(g.portions().len(), 1);
    assert_eq!(g.portions_index().len(), 1);
    let mut indexed = g.portions_index().portion_ids();
    indexed.sort_unstable();
    assert_eq!(g.optimizer_planner().portion_ids(), indexed);
    assert_eq!(g.pending_portion_optional(2).map(|p| p.portion_id), Some(still_pending_id));
    assert_eq!(reloaded.blobs_counters().bytes(), 1600);
    assert!(reloaded.next_portion_id() > still_pending_id);

    // 再次收尾不会重复登记
    reloaded.finish_load();
    assert_eq!(reloaded.granule(4).unwrap().portions_index().len(), 1);
    assert_eq!(reloaded.blobs_counters().bytes(), 1600);

    // 重建后的缓冲写仍可继续提交
    let mut tx = reloaded.begin_transaction();
    reloaded.commit_on_execute(&mut tx, 4, 2, Snapshot::new(6, 1)).unwrap();
    reloaded.commit_on_complete(4, 2).unwrap();
    assert_eq!(reloaded.granule(4).unwrap().portions().len(), 2);
}

#[test]
fn erase_is_persisted_through_the_transaction() {
    let mut e = engine();
    let mut db = MemoryDatabase::new();
    let mut record = pending(&mut e, 3, 9);
    let id = record.portion_id;

    let mut tx = e.begin_transaction();
    e.commit_immediate_on_execute(&mut tx, Snapshot::new(1, 1), &mut record).unwrap();
    tx.commit(&mut db);
    e.commit_immediate_on_complete(record).unwrap();

    let mut tx = e.begin_transaction();
    tx.erase_portion(3, id);
    tx.commit(&mut db);
    assert!(e.erase_portion(3, id));
    assert!(db.is_empty());
    assert!(!e.erase_portion(3, id));
}

#[test]
fn corrupted_record_fails_reload() {
    let mut e = engine_with(
        EngineOptions { persist_compression: PersistCodec::None, ..Default::default() },
        None,
        Arc::new(ManualClock::new(Timestamp::ZERO)),
    );
    let mut record = pending(&mut e, 1, 1);
    let mut tx = e.begin_transaction();
    e.commit_immediate_on_execute(&mut tx, Snapshot::new(1, 1), &mut record).unwrap();

    let mut bytes = tx.written(1, record.portion_id).unwrap().to_vec();
    bytes[12] ^= 0xff;
    let mut reloaded = engine();
    let err = reloaded.load_persisted([bytes.as_slice()]).unwrap_err();
    assert!(matches!(err, GranuleError::ChecksumMismatch));
}

#[test]
fn actualization_tasks_are_capped_and_throttled() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(10_000)));
    let options = EngineOptions {
        actualization_lag:       Duration::from_secs(30),
        max_actualization_tasks: 2,
        ..Default::default()
    };
    let policy = TieringPolicy::new(vec![], Some(Duration::from_secs(60)));
    let mut e = engine_with(options, Some(policy), clock.clone());

    for path_id in 1..=3 {
        let mut record = pending(&mut e, path_id, path_id);
        let mut tx = e.begin_transaction();
        e.commit_immediate_on_execute(&mut tx, Snapshot::new(1, path_id), &mut record).unwrap();
        e.commit_immediate_on_complete(record).unwrap();
    }

    let tasks = e.build_actualization_tasks();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.action == TieringAction::Delete));
    assert_eq!(tasks.iter().map(|t| t.path_id).collect::<Vec<_>>(), vec![1, 2]);

    // granule 3 未被轮到，不受节流
    let tasks = e.build_actualization_tasks();
    assert_eq!(tasks.iter().map(|t| t.path_id).collect::<Vec<_>>(), vec![3]);

    clock.advance(Duration::from_secs(30));
    assert_eq!(e.build_actualization_tasks().len(), 2);
}
