// Buffer pool and page-layout microbenchmarks.

use std::sync::Arc;

use basaltdb::buffer::{BufferManager, BufferManagerConfig};
use basaltdb::common::RelFileId;
use basaltdb::page::{item_flags, Page, PageInsertMode};
use basaltdb::storage::{SmgrRelation, StorageKind, StorageManager};
use basaltdb::wal::WalManager;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tempfile::tempdir;

fn bench_page_add_item(c: &mut Criterion) {
    c.bench_function("page_add_item_64b", |b| {
        let payload = [0x5Au8; 64];
        b.iter(|| {
            let mut page = Page::new();
            page.init(0);
            while page
                .add_item(&payload, 0, PageInsertMode::Shuffle, item_flags::USED)
                .unwrap()
                .is_some()
            {}
            black_box(page.max_offset_number())
        })
    });
}

fn bench_buffer_pin_hit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let smgr = Arc::new(StorageManager::new(dir.path()));
    let wal = Arc::new(WalManager::bootstrap(dir.path().join("wal"), 4).unwrap());
    let mgr = BufferManager::new(
        BufferManagerConfig { num_buffers: 128 },
        smgr.clone(),
        wal,
    );

    let rel = Arc::new(SmgrRelation::new(
        StorageKind::Memory,
        RelFileId::new(1, 1),
        "bench",
        "db",
    ));
    smgr.create(&rel).unwrap();
    for _ in 0..64 {
        let mut page = Page::new();
        page.init(0);
        page.set_checksum();
        smgr.extend(&rel, &page).unwrap();
    }
    // Warm the pool.
    for block in 0..64 {
        let _ = mgr.read_buffer(&rel, block).unwrap();
    }

    c.bench_function("buffer_pin_unpin_hit", |b| {
        let mut block = 0u32;
        b.iter(|| {
            let handle = mgr.read_buffer(&rel, block % 64).unwrap();
            block = block.wrapping_add(1);
            black_box(handle.tag().block)
        })
    });
}

criterion_group!(benches, bench_page_add_item, bench_buffer_pin_hit);
criterion_main!(benches);
