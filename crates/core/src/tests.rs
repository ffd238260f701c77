//! End-to-end tests of the tablet engine: service lifecycle, DML through
//! the transaction context, redo pipeline, partial rollback, crash
//! recovery from the SLOG, and migration idempotence.

use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tabletdb_primitives::{LogStreamId, Scn, SchemaVersion, SeqNo, TabletId, TxId, Version};

use crate::config::EngineConfig;
use crate::datum::{Datum, DatumKind, Row, RowKey};
use crate::error::{DmlError, StorageError, TabletError, TxError};
use crate::memtable::redo::testing::MockLogHandler;
use crate::memtable::redo::LogHandler;
use crate::memtable::{
    CallbackScope, EndCode, LockMode, MemtableCtx, RedoSubmitHelper, TableLockOp,
};
use crate::schema::{schema_of, StorageSchema};
use crate::service::{CreateTabletArg, DmlParam, MigrationParam, TableScanParam, TabletService};
use crate::tablet::{SsTable, SsTableKind, TableStore, TabletUpdateParam};

const LS: LogStreamId = LogStreamId(1);
const TABLET: TabletId = TabletId(1001);

/// A SLOG sink surviving "crashes": the buffer outlives the service.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    service: TabletService,
    handler: Arc<MockLogHandler>,
    config: Arc<EngineConfig>,
    slog_buf: SharedBuf,
}

fn ab_schema() -> StorageSchema {
    schema_of(
        1,
        1,
        &[("a", DatumKind::Int, false), ("b", DatumKind::Int, true)],
    )
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Arc::new(EngineConfig::default());
    let handler = Arc::new(MockLogHandler::default());
    let slog_buf = SharedBuf::default();
    let service = TabletService::new(
        LS,
        Arc::clone(&config),
        Box::new(slog_buf.clone()),
        handler.clone() as Arc<dyn LogHandler>,
    );
    Harness {
        service,
        handler,
        config,
        slog_buf,
    }
}

fn create_ab_tablet(h: &Harness) {
    let created = h
        .service
        .batch_create_tablets(
            vec![CreateTabletArg {
                tablet_id: TABLET,
                data_tablet_id: TABLET,
                schema: ab_schema(),
                binding_info: Default::default(),
                snapshot_version: Version(100),
            }],
            Scn(100),
            false,
        )
        .unwrap();
    assert_eq!(created, 1);
}

fn tx(h: &Harness, id: u64) -> MemtableCtx {
    MemtableCtx::new(TxId(id), LS, Arc::clone(&h.config), true)
}

fn dml_param(snapshot: u64) -> DmlParam {
    DmlParam::new(
        Version(snapshot),
        Instant::now() + Duration::from_secs(30),
        SchemaVersion(1),
    )
}

fn scan_param(snapshot: u64) -> TableScanParam {
    TableScanParam::full(
        Version(snapshot),
        Instant::now() + Duration::from_secs(30),
        SchemaVersion(1),
    )
}

fn row(a: i64, b: i64) -> Row {
    Row::new(vec![Datum::Int(a), Datum::Int(b)])
}

fn key(a: i64) -> RowKey {
    RowKey::new(vec![Datum::Int(a)])
}

fn commit(h: &Harness, ctx: &MemtableCtx, version: u64) {
    ctx.submit_log(h.handler.as_ref()).unwrap();
    ctx.trans_end(true, Version(version), h.handler.max_scn())
        .unwrap();
}

fn scan_rows(h: &Harness, snapshot: u64) -> Vec<(i64, i64)> {
    h.service
        .table_scan(TABLET, &scan_param(snapshot))
        .unwrap()
        .map(|(_, row)| {
            let a = match row[0] {
                Datum::Int(v) => v,
                _ => panic!("unexpected datum"),
            };
            let b = match row[1] {
                Datum::Int(v) => v,
                _ => panic!("unexpected datum"),
            };
            (a, b)
        })
        .collect()
}

// ------------------------------------------------------------------ scenarios

#[test]
fn create_then_insert_then_snapshot_reads() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    commit(&h, &ctx, 150);

    let tablet = h.service.get_tablet(TABLET).unwrap();
    assert!(tablet.rowkey_exists(&key(1), Version::MAX, None).unwrap());

    assert_eq!(scan_rows(&h, 200), vec![(1, 10)]);
    assert_eq!(scan_rows(&h, 120), vec![]);
}

#[test]
fn primary_key_duplicate_reports_key_and_index() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    commit(&h, &ctx, 150);

    let ctx2 = tx(&h, 8);
    let err = h
        .service
        .insert_rows(TABLET, &ctx2, &dml_param(155), vec![row(1, 99)])
        .unwrap_err();
    match &err {
        StorageError::Dml(DmlError::PrimaryKeyDuplicate { key, index_name }) => {
            assert_eq!(key, "1");
            assert_eq!(index_name, "PRIMARY");
        }
        other => panic!("expected duplicate key error, got {other:?}"),
    }
    let msg = err.to_string();
    assert!(msg.contains('1') && msg.contains("PRIMARY"), "message: {msg}");
    ctx2.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn partial_rollback_keeps_earlier_writes() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(
            TABLET,
            &ctx,
            &dml_param(140),
            vec![row(1, 10), row(2, 20), row(3, 30)],
        )
        .unwrap();

    ctx.rollback(SeqNo(1), SeqNo(3)).unwrap();
    // A second identical call is a no-op.
    ctx.rollback(SeqNo(1), SeqNo(3)).unwrap();
    assert_eq!(ctx.callback_cnt(), 1);
    assert_eq!(ctx.end_code(), EndCode::Ok);

    commit(&h, &ctx, 150);
    assert_eq!(scan_rows(&h, 200), vec![(1, 10)]);
}

#[test]
fn crash_safe_checkpoint_restores_sstables_only() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10), row(2, 20)])
        .unwrap();
    commit(&h, &ctx, 150);

    // "Flush" the memtable contents into a minor covering scn (100, 500].
    let tablet = h.service.get_tablet(TABLET).unwrap();
    let mut rows = BTreeMap::new();
    for (k, r) in h.service.table_scan(TABLET, &scan_param(200)).unwrap() {
        rows.insert(
            k,
            vec![crate::memtable::RowVersion {
                version: Version(150),
                scn: Scn(1),
                op: crate::memtable::DmlOp::Insert,
                row: Some(r),
            }],
        );
    }
    let minor = SsTable::new(
        SsTableKind::Minor,
        Version(150),
        Scn(100),
        Scn(500),
        rows,
        vec![42],
        h.service.macro_registry(),
    );
    let store = TableStore::new(
        tablet.table_store().majors.clone(),
        vec![minor],
        vec![],
        Scn(100),
    )
    .unwrap();
    h.service
        .update_tablet_table_store(
            TABLET,
            TabletUpdateParam {
                table_store: Some(store),
                clog_checkpoint_scn: Some(Scn(500)),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(h.service.release_memtables(TABLET, Scn(500)).unwrap(), 1);

    // Crash: drop the service, keep the SLOG bytes. Restart and replay.
    let slog_bytes = h.slog_buf.snapshot();
    drop(h);
    let h2 = harness();
    h2.service.replay_slog(slog_bytes.as_slice()).unwrap();

    let tablet = h2.service.get_tablet(TABLET).unwrap();
    assert_eq!(tablet.memtable_mgr().memtable_count(), 0);
    let tables = tablet.get_read_tables(Version::MAX, false).unwrap();
    // Major + minor, nothing in memory.
    assert_eq!(tables.len(), 2);
    assert_eq!(tablet.meta().clog_checkpoint_scn, Scn(500));
    assert_eq!(tablet.table_store().start_scn, Scn(100));
    assert_eq!(scan_rows(&h2, 500), vec![(1, 10), (2, 20)]);
}

#[test]
fn migration_is_idempotent() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();

    let mig = || MigrationParam {
        meta: tablet.meta().clone(),
        schema: ab_schema(),
        table_store: TableStore::new(
            tablet.table_store().majors.clone(),
            vec![],
            vec![],
            tablet.table_store().start_scn,
        )
        .unwrap(),
    };

    let first = h.service.migrate_create_tablet(mig()).unwrap();
    let mut image1 = Vec::new();
    first.serialize(&mut image1);

    let second = h.service.migrate_create_tablet(mig()).unwrap();
    let mut image2 = Vec::new();
    second.serialize(&mut image2);

    assert_eq!(image1, image2);
}

#[test]
fn tablet_image_roundtrip_is_byte_identical() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();

    let mut image1 = Vec::new();
    tablet.serialize(&mut image1);

    let decoded = crate::tablet::Tablet::load_deserialize(&mut image1.as_slice()).unwrap();
    decoded.deserialize_post_work(h.service.macro_registry());
    let mut image2 = Vec::new();
    decoded.serialize(&mut image2);

    assert_eq!(image1, image2);
    assert_eq!(
        crate::tablet::deserialize_id(&image1).unwrap(),
        tablet.key()
    );
}

#[test]
fn replay_create_is_idempotent() {
    let h = harness();
    create_ab_tablet(&h);
    let again = h
        .service
        .batch_create_tablets(
            vec![CreateTabletArg {
                tablet_id: TABLET,
                data_tablet_id: TABLET,
                schema: ab_schema(),
                binding_info: Default::default(),
                snapshot_version: Version(100),
            }],
            Scn(100),
            true,
        )
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(h.service.tablet_count(), 1);

    // Without replay it is a hard conflict.
    let err = h
        .service
        .batch_create_tablets(
            vec![CreateTabletArg {
                tablet_id: TABLET,
                data_tablet_id: TABLET,
                schema: ab_schema(),
                binding_info: Default::default(),
                snapshot_version: Version(100),
            }],
            Scn(100),
            false,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Tablet(TabletError::Exist(k)) if k.tablet_id == TABLET
    ));
}

// ------------------------------------------------------------------ conflicts

#[test]
fn row_lock_conflict_and_set_violation() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx1 = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx1, &dml_param(140), vec![row(1, 10)])
        .unwrap();

    // A second transaction hits the row lock.
    let ctx2 = tx(&h, 8);
    let err = h
        .service
        .lock_rows(TABLET, &ctx2, &dml_param(140), &[row(1, 0)])
        .unwrap_err();
    assert_eq!(
        err,
        DmlError::TryLockRowConflict {
            tablet_id: TABLET,
            holder: TxId(7)
        }
        .into()
    );
    assert_eq!(ctx2.get_conflict_txs(), vec![TxId(7)]);

    commit(&h, &ctx1, 150);

    // A stale snapshot sees the newer committed version: set violation.
    let ctx3 = tx(&h, 9);
    let err = h
        .service
        .delete_rows(TABLET, &ctx3, &dml_param(120), &[row(1, 10)])
        .unwrap_err();
    assert_eq!(
        err,
        DmlError::TransactionSetViolation {
            snapshot: Version(120)
        }
        .into()
    );
    ctx3.trans_end(false, Version::MIN, Scn::MIN).unwrap();
    ctx2.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn delete_then_insert_roundtrip() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    commit(&h, &ctx, 150);

    let ctx2 = tx(&h, 8);
    h.service
        .delete_rows(TABLET, &ctx2, &dml_param(160), &[row(1, 10)])
        .unwrap();
    commit(&h, &ctx2, 170);
    assert_eq!(scan_rows(&h, 200), vec![]);
    assert_eq!(scan_rows(&h, 150), vec![(1, 10)]);

    // The key is free again.
    let ctx3 = tx(&h, 9);
    h.service
        .insert_rows(TABLET, &ctx3, &dml_param(180), vec![row(1, 11)])
        .unwrap();
    commit(&h, &ctx3, 190);
    assert_eq!(scan_rows(&h, 200), vec![(1, 11)]);
}

#[test]
fn defensive_check_catches_stale_old_rows() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    commit(&h, &ctx, 150);

    let ctx2 = tx(&h, 8);
    let err = h
        .service
        .update_rows(
            TABLET,
            &ctx2,
            &dml_param(160),
            &[row(1, 999)],
            vec![row(1, 11)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Dml(DmlError::DefensiveCheck(_))
    ));

    // Batched multi-statement translates the defensive failure.
    let mut param = dml_param(160);
    param.flags |= crate::service::DmlFlags::BATCHED_MULTI_STMT;
    let err = h
        .service
        .update_rows(TABLET, &ctx2, &param, &[row(1, 999)], vec![row(1, 11)])
        .unwrap_err();
    assert_eq!(err, DmlError::BatchedMultiStmtRollback.into());
    ctx2.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

// --------------------------------------------------------------- redo details

#[test]
fn redo_pipeline_cursors_and_checksum() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10), row(2, 20)])
        .unwrap();
    assert_eq!(ctx.unsubmitted_cnt(), 2);
    assert_eq!(ctx.unsynced_cnt(), 0);
    assert!(ctx.pending_log_size() > 0);

    let mut buf = Vec::new();
    let mut helper = RedoSubmitHelper::default();
    ctx.fill_redo_log(&mut buf, &mut helper, false).unwrap();
    assert_eq!(helper.callback_cnt, 2);
    assert_eq!(helper.scope, Some(CallbackScope { first: 0, last: 1 }));

    ctx.log_submitted(&helper).unwrap();
    assert_eq!(ctx.unsubmitted_cnt(), 0);
    assert_eq!(ctx.unsynced_cnt(), 2);
    assert_eq!(ctx.pending_log_size(), 0);

    ctx.sync_log_succ(Scn(9), &helper.scope.unwrap()).unwrap();
    assert_eq!(ctx.unsynced_cnt(), 0);
    assert_eq!(ctx.checksum_scn(), Scn(9));
    assert_ne!(ctx.checksum(), 0);

    // Nothing left to fill.
    let mut buf = Vec::new();
    assert_eq!(
        ctx.fill_redo_log(&mut buf, &mut helper, false).unwrap_err(),
        StorageError::Eagain
    );

    ctx.trans_end(true, Version(150), Scn(9)).unwrap();
    assert_eq!(ctx.end_code(), EndCode::Committed);
}

#[test]
fn lock_nodes_wait_for_their_turn() {
    let h = harness();
    let ctx = tx(&h, 7);
    ctx.add_lock_record(TableLockOp {
        tablet_id: TABLET,
        owner: TxId(7),
        mode: LockMode::RowExclusive,
        seq_no: SeqNo(1),
    });

    let mut buf = Vec::new();
    let mut helper = RedoSubmitHelper::default();
    // A lock node at the head blocks a non-lock fill.
    assert_eq!(
        ctx.fill_redo_log(&mut buf, &mut helper, false).unwrap_err(),
        StorageError::Eagain
    );
    assert_eq!(helper.callback_cnt, 0);

    ctx.fill_redo_log(&mut buf, &mut helper, true).unwrap();
    assert_eq!(helper.callback_cnt, 1);
    ctx.log_submitted(&helper).unwrap();
    ctx.sync_log_succ(Scn(1), &helper.scope.unwrap()).unwrap();
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn sync_log_fail_forces_abort() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();

    let mut buf = Vec::new();
    let mut helper = RedoSubmitHelper::default();
    ctx.fill_redo_log(&mut buf, &mut helper, false).unwrap();
    ctx.log_submitted(&helper).unwrap();
    ctx.sync_log_fail(&helper.scope.unwrap());

    assert_eq!(ctx.end_code(), EndCode::PartialRollbacked);
    assert_eq!(
        ctx.trans_end(true, Version(150), Scn(9)).unwrap_err(),
        TxError::PartialRollbacked.into()
    );
    // commit=false is still allowed.
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();
    assert_eq!(ctx.end_code(), EndCode::Rollbacked);
    assert_eq!(scan_rows(&h, 200), vec![]);
}

#[test]
fn rollback_past_synced_writes_is_sticky() {
    let h = harness();
    create_ab_tablet(&h);

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10), row(2, 20)])
        .unwrap();
    ctx.submit_log(h.handler.as_ref()).unwrap();

    ctx.rollback(SeqNo(1), SeqNo(2)).unwrap();
    assert_eq!(ctx.end_code(), EndCode::PartialRollbacked);
    assert!(ctx.trans_end(true, Version(150), Scn(9)).is_err());
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn write_auth_rejects_finished_and_follower_contexts() {
    let h = harness();
    let ctx = tx(&h, 7);
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();
    assert_eq!(
        ctx.write_auth(false).unwrap_err(),
        TxError::AlreadyEnded(EndCode::Rollbacked).into()
    );

    let follower = MemtableCtx::new(TxId(8), LS, Arc::clone(&h.config), false);
    assert_eq!(
        follower.write_auth(true).unwrap_err(),
        TxError::NotMaster.into()
    );
    follower.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn trans_kill_is_terminal() {
    let h = harness();
    create_ab_tablet(&h);
    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    ctx.trans_kill().unwrap();
    assert_eq!(ctx.end_code(), EndCode::Killed);
    assert!(ctx.write_auth(false).is_err());
    assert_eq!(scan_rows(&h, 200), vec![]);
}

// ------------------------------------------------------------------- replay

#[test]
fn follower_replay_and_checksum_verification() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();
    tablet.create_memtable(SchemaVersion(1), true).unwrap();
    let mt = tablet.memtable_mgr().get_active_memtable().unwrap();

    let follower = MemtableCtx::new(TxId(7), LS, Arc::clone(&h.config), false);
    follower.replay_begin(Scn(120)).unwrap();
    mt.replay_set(
        &follower,
        crate::memtable::DmlOp::Insert,
        key(1),
        Some(row(1, 10)),
        SeqNo(1),
        Scn(120),
    )
    .unwrap();
    follower.replay_end(true, Scn(120)).unwrap();

    let expected = follower.calc_checksum_all();
    follower
        .replay_trans_end(true, Version(150), Scn(120), expected)
        .unwrap();
    assert_eq!(follower.end_code(), EndCode::Committed);
    assert_eq!(scan_rows(&h, 200), vec![(1, 10)]);
}

#[test]
fn replay_checksum_mismatch_is_fatal_unless_downgraded() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();
    tablet.create_memtable(SchemaVersion(1), true).unwrap();
    let mt = tablet.memtable_mgr().get_active_memtable().unwrap();

    let follower = MemtableCtx::new(TxId(7), LS, Arc::clone(&h.config), false);
    follower.replay_begin(Scn(120)).unwrap();
    mt.replay_set(
        &follower,
        crate::memtable::DmlOp::Insert,
        key(1),
        Some(row(1, 10)),
        SeqNo(1),
        Scn(120),
    )
    .unwrap();
    follower.replay_end(true, Scn(120)).unwrap();

    let err = follower
        .replay_trans_end(true, Version(150), Scn(120), 0xdead_beef)
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Tx(TxError::Checksum { .. })
    ));

    // Downgraded to a warning by configuration.
    h.config
        .ignore_replay_checksum_error
        .store(true, std::sync::atomic::Ordering::Relaxed);
    follower
        .replay_trans_end(true, Version(150), Scn(120), 0xdead_beef)
        .unwrap();
    assert_eq!(follower.end_code(), EndCode::Committed);
}

#[test]
fn replay_to_commit_and_back() {
    let h = harness();
    let follower = MemtableCtx::new(TxId(7), LS, Arc::clone(&h.config), false);
    assert!(!follower.is_master());

    follower.replay_to_commit().unwrap();
    assert!(follower.is_master());
    // The context now accepts write auth.
    follower.write_auth(false).unwrap().write_done();

    follower.commit_to_replay();
    assert!(!follower.is_master());
    follower.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn clean_unlog_callbacks_marks_partial() {
    let h = harness();
    create_ab_tablet(&h);
    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    assert_eq!(ctx.clean_unlog_callbacks().unwrap(), 1);
    assert_eq!(ctx.end_code(), EndCode::PartialRollbacked);
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();
    assert_eq!(scan_rows(&h, 200), vec![]);
}

// ------------------------------------------------------- tablet-level extras

#[test]
fn tablet_autoinc_reserves_through_the_log() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();

    let (start, end) = tablet
        .fetch_tablet_autoinc_seq_cache(100, h.handler.as_ref())
        .unwrap();
    assert_eq!((start, end), (1, 100));
    let (start, end) = tablet
        .fetch_tablet_autoinc_seq_cache(50, h.handler.as_ref())
        .unwrap();
    assert_eq!((start, end), (101, 150));
    // The sync record went through the log handler.
    assert_eq!(h.handler.appended.lock().len(), 2);
}

#[test]
fn schema_freshness_gates_scans() {
    let h = harness();
    create_ab_tablet(&h);

    // Plan compiled against an older schema than the tablet carries.
    let mut param = scan_param(200);
    param.schema_version = SchemaVersion(0);
    assert_eq!(
        h.service.table_scan(TABLET, &param).unwrap_err(),
        crate::error::SchemaCheckError::NotUptodate.into()
    );

    // Plan ahead of the tablet, node not yet refreshed.
    let mut param = scan_param(200);
    param.schema_version = SchemaVersion(5);
    param.tenant_schema_version = SchemaVersion(2);
    assert_eq!(
        h.service.table_scan(TABLET, &param).unwrap_err(),
        crate::error::SchemaCheckError::Eagain.into()
    );
}

#[test]
fn schema_elapse_gates_wait_for_open_writes() {
    let h = harness();
    create_ab_tablet(&h);
    let tablet = h.service.get_tablet(TABLET).unwrap();

    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();

    // Open writes below the new schema version hold the DDL back.
    assert_eq!(
        tablet.check_schema_version_elapsed(SchemaVersion(2)).unwrap_err(),
        StorageError::Eagain
    );
    assert_eq!(
        ctx.check_modify_schema_elapsed(TABLET, SchemaVersion(2))
            .unwrap_err(),
        StorageError::Eagain
    );
    assert_eq!(
        ctx.check_modify_time_elapsed(TABLET).unwrap_err(),
        StorageError::Eagain
    );

    commit(&h, &ctx, 150);
    tablet.check_schema_version_elapsed(SchemaVersion(2)).unwrap();
    ctx.check_modify_schema_elapsed(TABLET, SchemaVersion(2))
        .unwrap();
}

#[test]
fn checkpoint_and_start_scn_never_move_backward() {
    let h = harness();
    create_ab_tablet(&h);

    h.service
        .update_tablet_table_store(
            TABLET,
            TabletUpdateParam {
                clog_checkpoint_scn: Some(Scn(500)),
                ..Default::default()
            },
        )
        .unwrap();

    // A stale update cannot rewind the checkpoint.
    let updated = h
        .service
        .update_tablet_table_store(
            TABLET,
            TabletUpdateParam {
                clog_checkpoint_scn: Some(Scn(300)),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.meta().clog_checkpoint_scn, Scn(500));
    assert_eq!(updated.meta().start_scn, Scn(100));
}

#[test]
fn msd_status_hides_tablet_from_dml() {
    let h = harness();
    create_ab_tablet(&h);

    h.service
        .on_redo_remove_tablet(TABLET, TxId(11), Scn(200))
        .unwrap();
    let status = h.service.get_tablet_status(TABLET).unwrap();
    assert_eq!(
        status.tablet_status,
        crate::tablet::TabletStatus::Deleting
    );

    let ctx = tx(&h, 12);
    let err = h
        .service
        .insert_rows(TABLET, &ctx, &dml_param(300), vec![row(9, 9)])
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Tablet(TabletError::NotExist(_))
    ));
    ctx.trans_end(false, Version::MIN, Scn::MIN).unwrap();

    // Abort restores visibility.
    h.service.on_abort_remove_tablet(TABLET, TxId(11)).unwrap();
    h.service.on_tx_end_remove_tablet(TABLET).unwrap();
    let status = h.service.get_tablet_status(TABLET).unwrap();
    assert_eq!(status.tablet_status, crate::tablet::TabletStatus::Normal);
}

#[test]
fn rebuild_chain_trim_and_rollback() {
    let h = harness();
    create_ab_tablet(&h);

    let mig = |h: &Harness| {
        let old = h.service.get_tablet(TABLET).unwrap();
        MigrationParam {
            meta: old.meta().clone(),
            schema: ab_schema(),
            table_store: TableStore::new(
                old.table_store().majors.clone(),
                vec![],
                vec![],
                old.table_store().start_scn,
            )
            .unwrap(),
        }
    };
    h.service.rebuild_create_tablet(mig(&h), true).unwrap();
    let rebuilt = h.service.get_tablet(TABLET).unwrap();
    assert!(rebuilt.next_tablet().is_some());

    h.service.trim_rebuild_tablet(TABLET).unwrap();
    let trimmed = h.service.get_tablet(TABLET).unwrap();
    assert!(trimmed.next_tablet().is_none());
    // Trimming again is a no-op.
    h.service.trim_rebuild_tablet(TABLET).unwrap();

    // A failed rebuild window restores the chained predecessor.
    h.service.rebuild_create_tablet(mig(&h), true).unwrap();
    h.service.rollback_rebuild_tablet(TABLET).unwrap();
    let restored = h.service.get_tablet(TABLET).unwrap();
    assert!(restored.next_tablet().is_none());
}

#[test]
fn remove_tablets_is_idempotent_under_replay() {
    let h = harness();
    create_ab_tablet(&h);
    assert_eq!(h.service.batch_remove_tablets(&[TABLET], false).unwrap(), 1);
    assert_eq!(h.service.batch_remove_tablets(&[TABLET], true).unwrap(), 0);
    assert!(matches!(
        h.service.batch_remove_tablets(&[TABLET], false).unwrap_err(),
        StorageError::Tablet(TabletError::NotExist(_))
    ));
}

#[test]
fn offline_releases_memtables_and_refuses_work() {
    let h = harness();
    create_ab_tablet(&h);
    let ctx = tx(&h, 7);
    h.service
        .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(1, 10)])
        .unwrap();
    commit(&h, &ctx, 150);

    h.service.offline().unwrap();
    let ctx2 = tx(&h, 8);
    assert_eq!(
        h.service
            .insert_rows(TABLET, &ctx2, &dml_param(160), vec![row(2, 2)])
            .unwrap_err(),
        StorageError::NotInit
    );
    ctx2.trans_end(false, Version::MIN, Scn::MIN).unwrap();
}

#[test]
fn randomized_savepoint_rollbacks_match_a_model() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let h = harness();
    create_ab_tablet(&h);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let ctx = tx(&h, 7);
    let mut model: Vec<(i64, i64)> = Vec::new();
    let mut seqs: Vec<(SeqNo, i64)> = Vec::new();
    for i in 0..40i64 {
        h.service
            .insert_rows(TABLET, &ctx, &dml_param(140), vec![row(i, i * 10)])
            .unwrap();
        seqs.push((ctx.current_seq_no(), i));
        model.push((i, i * 10));

        // Occasionally roll back a suffix of what we inserted so far.
        if rng.gen_ratio(1, 5) && seqs.len() > 1 {
            let cut = rng.gen_range(0..seqs.len() - 1);
            let to_seq = seqs[cut].0;
            ctx.rollback(to_seq, ctx.current_seq_no()).unwrap();
            seqs.truncate(cut + 1);
            model.truncate(cut + 1);
        }
    }
    commit(&h, &ctx, 150);
    assert_eq!(scan_rows(&h, 200), model);
}

#[test]
fn scan_ranges_respect_bounds() {
    let h = harness();
    create_ab_tablet(&h);
    let ctx = tx(&h, 7);
    h.service
        .insert_rows(
            TABLET,
            &ctx,
            &dml_param(140),
            vec![row(1, 10), row(2, 20), row(3, 30)],
        )
        .unwrap();
    commit(&h, &ctx, 150);

    let rows: Vec<_> = h
        .service
        .table_rescan(
            TABLET,
            &scan_param(200),
            Some((Bound::Included(key(2)), Bound::Unbounded)),
        )
        .unwrap()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(rows, vec![key(2), key(3)]);
}
