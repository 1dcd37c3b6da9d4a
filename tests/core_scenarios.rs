// End-to-end scenarios across the storage, concurrency, and
// transaction core: page layout round trips, MVCC visibility at the
// snapshot boundary, lock conflicts and deadlocks across threads, WAL
// flush ordering, invalidation delivery, and delegated scans.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use basaltdb::common::{ItemPointer, RelFileId};
use basaltdb::delegate::DelegatedScan;
use basaltdb::lock::{LockManager, LockMode, LockTag, HEAP_LOCK_METHOD};
use basaltdb::mvcc::{satisfies_snapshot, HeapTupleHeader, Snapshot, VisibilityContext};
use basaltdb::page::{item_flags, Page, PageInsertMode};
use basaltdb::registry::{ThreadRegistry, ThreadType};
use basaltdb::sinval::{InvalRead, SInvalBus, SharedInvalidMessage};
use basaltdb::storage::{SmgrRelation, StorageKind};
use basaltdb::system::SystemState;
use basaltdb::transaction::CommitLog;
use basaltdb::wal::{rmgr, WalManager, XLogReader};
use basaltdb::Config;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        buffer_pool_size: 64,
        wal_buffers: 4,
        max_workers: 8,
        page_checksums: true,
        standalone: true,
    }
}

// S1 — page add/delete round trip on a fresh 8 KiB page.
#[test]
fn scenario_page_add_delete_round_trip() {
    let mut page = Page::new();
    page.init(32);

    let first = page
        .add_item(b"hello", 1, PageInsertMode::Shuffle, item_flags::USED)
        .unwrap();
    assert_eq!(first, Some(1));

    let second = page
        .add_item(b"world", 0, PageInsertMode::Shuffle, item_flags::USED)
        .unwrap();
    assert_eq!(second, Some(2));

    page.index_tuple_delete(1).unwrap();
    assert_eq!(page.item(1).unwrap(), b"world");
    assert_eq!(page.max_offset_number(), 1);
}

// S2 — a tuple inserted by T100 is invisible to a snapshot whose xmax
// is 100 and visible to one taken after the commit.
#[test]
fn scenario_mvcc_snapshot_boundary() {
    let clog = CommitLog::new();
    clog.begin(100);
    clog.commit(100, true);

    let ctx = VisibilityContext::new(200, 0, &clog);
    let tuple = HeapTupleHeader::new(100, 0);

    let before = Snapshot::new(50, 100, vec![]);
    assert!(!satisfies_snapshot(&ctx, &tuple, &before));

    let after = Snapshot::new(100, 101, vec![]);
    assert!(satisfies_snapshot(&ctx, &tuple, &after));
}

// S3 — AccessShare blocks behind AccessExclusive and is granted on
// release; final grant vector holds exactly one AccessShare.
#[test]
fn scenario_lock_conflict_grant_on_release() {
    init_tracing();
    let lm = Arc::new(LockManager::new());
    let registry = Arc::new(ThreadRegistry::new(2));
    let t1 = registry.init_thread(ThreadType::Worker, 1).unwrap();
    let t2 = registry.init_thread(ThreadType::Worker, 1).unwrap();
    let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

    lm.acquire(&t1, tag, 100, LockMode::AccessExclusive, false)
        .unwrap();

    let lm2 = lm.clone();
    let waiter = thread::spawn(move || lm2.acquire(&t2, tag, 101, LockMode::AccessShare, false));

    while lm.waiting(&tag) == 0 {
        thread::yield_now();
    }
    lm.release(&t1, tag, 100, LockMode::AccessExclusive).unwrap();
    waiter.join().unwrap().unwrap();

    let granted = lm.granted(&tag).unwrap();
    assert_eq!(granted[LockMode::AccessShare.index()], 1);
    assert_eq!(granted[LockMode::AccessExclusive.index()], 0);
    lm.verify_integrity().unwrap();
}

// S4 — two 200-byte records; flushing the first makes its containing
// page durable, flushing the second covers the remainder.
#[test]
fn scenario_wal_flush_ordering() {
    let dir = tempdir().unwrap();
    let wal = WalManager::bootstrap(dir.path(), 4).unwrap();

    let r1 = wal.insert(rmgr::HEAP, 0, 7, 0, &[0xA5; 200], &[]).unwrap();
    let r2 = wal.insert(rmgr::HEAP, 0, 7, r1, &[0x5A; 200], &[]).unwrap();
    assert!(r1 < r2);

    wal.flush(r1).unwrap();
    assert!(wal.flushed_lsn() >= r1);

    wal.flush(r2).unwrap();
    assert!(wal.flushed_lsn() > r2);

    // Flushing R2 implies R1 is on disk, in order.
    let mut reader = XLogReader::new(dir.path(), 0);
    let rec1 = reader.next_record().unwrap().unwrap();
    let rec2 = reader.next_record().unwrap().unwrap();
    assert_eq!((rec1.lsn, rec2.lsn), (r1, r2));
}

// S5 — producer publishes three tids in two batches; the consumer sees
// them in emission order and then end-of-scan.
#[test]
fn scenario_delegated_scan_streams_in_order() {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut scan = DelegatedScan::start(cancel, |handle| {
        handle.transfer_pointers(&[ItemPointer::new(1, 1), ItemPointer::new(1, 2)])?;
        handle.transfer_pointers(&[ItemPointer::new(2, 1)])?;
        Ok(())
    });

    assert_eq!(scan.next().unwrap(), Some(ItemPointer::new(1, 1)));
    assert_eq!(scan.next().unwrap(), Some(ItemPointer::new(1, 2)));
    assert_eq!(scan.next().unwrap(), Some(ItemPointer::new(2, 1)));
    assert_eq!(scan.next().unwrap(), None);
    scan.end().unwrap();
}

// S6 — cross-lock deadlock: exactly one of the two threads aborts with
// a deadlock error, the other finishes once the victim's locks drop.
#[test]
fn scenario_cross_lock_deadlock_one_victim() {
    init_tracing();
    let lm = Arc::new(LockManager::new());
    let registry = Arc::new(ThreadRegistry::new(2));
    let slot1 = registry.init_thread(ThreadType::Worker, 1).unwrap();
    let slot2 = registry.init_thread(ThreadType::Worker, 1).unwrap();
    let l1 = LockTag::relation(HEAP_LOCK_METHOD, 1, 1);
    let l2 = LockTag::relation(HEAP_LOCK_METHOD, 1, 2);

    lm.acquire(&slot1, l1, 100, LockMode::Exclusive, false).unwrap();
    lm.acquire(&slot2, l2, 200, LockMode::Exclusive, false).unwrap();

    let lm_a = lm.clone();
    let s1 = slot1.clone();
    let t1 = thread::spawn(move || {
        let result = lm_a.acquire(&s1, l2, 100, LockMode::Exclusive, false);
        if result.is_err() {
            // Victim: roll back, releasing what we hold.
            lm_a.release_all(&s1, Some(100));
        }
        result.is_err()
    });
    let lm_b = lm.clone();
    let s2 = slot2.clone();
    let t2 = thread::spawn(move || {
        let result = lm_b.acquire(&s2, l1, 200, LockMode::Exclusive, false);
        if result.is_err() {
            lm_b.release_all(&s2, Some(200));
        }
        result.is_err()
    });

    let aborted1 = t1.join().unwrap();
    let aborted2 = t2.join().unwrap();
    assert!(
        aborted1 ^ aborted2,
        "exactly one thread must be the deadlock victim (got {} and {})",
        aborted1,
        aborted2
    );
    lm.verify_integrity().unwrap();
}

// Invariant 8 — a message published before a catalog-consuming
// statement is observed by that statement's thread before it reads.
#[test]
fn scenario_invalidation_delivered_before_use() {
    let bus = SInvalBus::new(4);
    let reader = bus.register_reader().unwrap();

    let msg = SharedInvalidMessage {
        cache_id: 3,
        hash_index: 17,
        tid: ItemPointer::new(5, 2),
    };
    bus.publish(msg);

    // The consuming statement drains its cursor first.
    let mut seen = Vec::new();
    let reset = bus.consume_all(reader, |m| seen.push(m));
    assert!(reset.is_none());
    assert_eq!(seen, vec![msg]);
    assert_eq!(bus.consume(reader), InvalRead::None);
}

// Full-stack: rows inserted through sessions stream back through a
// delegated scan and resolve through snapshot visibility.
#[test]
fn scenario_delegated_scan_over_heap() {
    init_tracing();
    let dir = tempdir().unwrap();
    let system = SystemState::bootstrap(test_config(dir.path())).unwrap();

    let rel = Arc::new(SmgrRelation::new(
        StorageKind::File,
        RelFileId::new(1, 900),
        "scan_target",
        "db",
    ));
    system.smgr.create(&rel).unwrap();

    let mut session = system.session(1).unwrap();
    session.begin().unwrap();
    let mut expected = Vec::new();
    for i in 0..50u32 {
        let row = format!("row-{:04}", i);
        expected.push((session.heap_insert(&rel, row.as_bytes()).unwrap(), row));
    }
    session.commit().unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let mut scan = system.delegated_relation_scan(&rel, cancel);

    session.begin().unwrap();
    let snapshot = session.snapshot();
    let mut streamed = Vec::new();
    while let Some(tid) = scan.next().unwrap() {
        if let Some(data) = session.heap_fetch(&rel, tid, &snapshot).unwrap() {
            streamed.push((tid, String::from_utf8(data).unwrap()));
        }
    }
    scan.end().unwrap();
    session.commit().unwrap();

    assert_eq!(streamed, expected);
    system.buffers.verify_invariants().unwrap();
    system.shutdown().unwrap();
}

// Concurrent writers through the full stack: every committed row is
// visible afterwards, every aborted row is not, and the pool and lock
// tables come out consistent.
#[test]
fn scenario_concurrent_sessions_commit_and_abort() {
    init_tracing();
    let dir = tempdir().unwrap();
    let system = SystemState::bootstrap(test_config(dir.path())).unwrap();

    let rel = Arc::new(SmgrRelation::new(
        StorageKind::File,
        RelFileId::new(1, 901),
        "contended",
        "db",
    ));
    system.smgr.create(&rel).unwrap();

    let mut workers = Vec::new();
    for worker in 0..4u32 {
        let system = system.clone();
        let rel = rel.clone();
        workers.push(thread::spawn(move || {
            let mut committed = Vec::new();
            let mut session = system.session(1).unwrap();
            for round in 0..10u32 {
                session.begin().unwrap();
                let row = format!("w{}r{}", worker, round);
                let tid = session.heap_insert(&rel, row.as_bytes()).unwrap();
                if round % 3 == 2 {
                    session.abort().unwrap();
                } else {
                    session.commit().unwrap();
                    committed.push((tid, row));
                }
            }
            committed
        }));
    }

    let mut committed = Vec::new();
    for worker in workers {
        committed.extend(worker.join().unwrap());
    }

    let mut session = system.session(1).unwrap();
    session.begin().unwrap();
    let snapshot = session.snapshot();
    for (tid, row) in &committed {
        let data = session.heap_fetch(&rel, *tid, &snapshot).unwrap();
        assert_eq!(data.as_deref(), Some(row.as_bytes()), "row {} lost", row);
    }
    session.commit().unwrap();

    system.locks.verify_integrity().unwrap();
    system.buffers.verify_invariants().unwrap();
    system.shutdown().unwrap();
}
