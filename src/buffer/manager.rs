// The shared buffer cache: a fixed pool of page frames fronted by a
// concurrent tag lookup. Victims come off the freelist first, then a
// clock sweep that skips pinned frames, frames under I/O, and (for one
// rotation) frames carrying the sequential-scan bias hint. A dirty
// victim is written out under IO_IN_PROGRESS, after forcing the WAL
// through the page's last-modification LSN — the write-ahead rule.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::descriptor::{flags, BufferDesc, BufferId, BufferTag};
use crate::buffer::handle::BufferHandle;
use crate::common::{BlockNumber, Lsn, RelFileId};
use crate::error::{DbError, Result};
use crate::page::Page;
use crate::storage::{SmgrRelation, StorageManager};
use crate::wal::WalManager;

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferManagerConfig {
    /// Number of page frames in the pool.
    pub num_buffers: usize,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self { num_buffers: 1024 }
    }
}

/// Per-page read callback, invoked under a shared content latch after
/// every successful read. Delegated scans use this to publish tuple
/// identifiers as pages stream through the cache.
pub type ReadTrigger = Arc<dyn Fn(&BufferTag, &Page) + Send + Sync>;

#[derive(Debug, Default)]
pub struct BufferStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub writebacks: AtomicU64,
}

pub struct BufferManager {
    descs: Vec<Arc<BufferDesc>>,
    lookup: DashMap<BufferTag, BufferId>,
    freelist: Mutex<Vec<BufferId>>,
    clock_hand: AtomicUsize,
    relations: DashMap<RelFileId, Arc<SmgrRelation>>,
    extension_locks: DashMap<RelFileId, Arc<Mutex<()>>>,
    triggers: DashMap<RelFileId, ReadTrigger>,
    smgr: Arc<StorageManager>,
    wal: Arc<WalManager>,
    pub stats: BufferStats,
}

impl BufferManager {
    pub fn new(
        config: BufferManagerConfig,
        smgr: Arc<StorageManager>,
        wal: Arc<WalManager>,
    ) -> Arc<Self> {
        let num = config.num_buffers.max(2);
        let descs: Vec<_> = (0..num)
            .map(|id| Arc::new(BufferDesc::new(BufferId::new(id))))
            .collect();
        let freelist = (0..num).rev().map(BufferId::new).collect();
        Arc::new(Self {
            descs,
            lookup: DashMap::new(),
            freelist: Mutex::new(freelist),
            clock_hand: AtomicUsize::new(0),
            relations: DashMap::new(),
            extension_locks: DashMap::new(),
            triggers: DashMap::new(),
            smgr,
            wal,
            stats: BufferStats::default(),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.descs.len()
    }

    pub fn desc(&self, id: BufferId) -> &Arc<BufferDesc> {
        &self.descs[id.index()]
    }

    fn register_relation(&self, rel: &Arc<SmgrRelation>) {
        self.relations.entry(rel.rel).or_insert_with(|| rel.clone());
    }

    fn relation_for(&self, rel: RelFileId) -> Result<Arc<SmgrRelation>> {
        self.relations
            .get(&rel)
            .map(|r| r.clone())
            .ok_or_else(|| DbError::NotFound(format!("relation {} not registered", rel)))
    }

    /// Fetch a page, pinning its frame. The returned handle unpins on
    /// drop; content access goes through its latch methods.
    pub fn read_buffer(
        self: &Arc<Self>,
        rel: &Arc<SmgrRelation>,
        block: BlockNumber,
    ) -> Result<BufferHandle> {
        self.register_relation(rel);
        let tag = BufferTag::new(rel.rel, block);

        loop {
            if let Some(id) = self.lookup.get(&tag).map(|entry| *entry) {
                let desc = self.descs[id.index()].clone();
                let mut st = desc.state();
                if st.tag == Some(tag) && st.flags & flags::DELETED == 0 {
                    st.refcount += 1;
                    st.bias = false;
                    // If the page is still being read in, wait out the
                    // I/O and confirm it landed.
                    desc.wait_io_locked(&mut st);
                    if st.tag == Some(tag) && st.flags & flags::DELETED == 0 {
                        drop(st);
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(BufferHandle::new(self.clone(), desc));
                    }
                    // The load failed under us and the frame was reset;
                    // our provisional pin went with it.
                    st.refcount = st.refcount.saturating_sub(1);
                }
                drop(st);
                std::thread::yield_now();
                continue;
            }

            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let desc = match self.start_load(tag)? {
                Some(desc) => desc,
                // Lost the race to another loader; retry the lookup.
                None => continue,
            };

            match self.smgr.read(rel, block) {
                Ok(page) => {
                    if !page.verify_checksum() {
                        self.abort_load(&desc, tag);
                        return Err(DbError::ChecksumFailure(format!(
                            "relation {} block {}",
                            rel.rel, block
                        )));
                    }
                    *desc.data().write() = page;
                    desc.complete_io(0, flags::DIRTY);

                    if let Some(trigger) = self.triggers.get(&rel.rel).map(|t| t.clone()) {
                        let guard = desc.lock_shared();
                        trigger(&tag, &guard);
                    }
                    trace!(rel = %rel.rel, block, frame = desc.id.index(), "page read into cache");
                    return Ok(BufferHandle::new(self.clone(), desc));
                }
                Err(e) => {
                    self.abort_load(&desc, tag);
                    return Err(e);
                }
            }
        }
    }

    /// Extend the relation by one page, initialized with the given
    /// special-area size, returning it resident and pinned. Extension
    /// is serialized per relation so block numbers are never skipped.
    pub fn allocate_more_space(
        self: &Arc<Self>,
        rel: &Arc<SmgrRelation>,
        special_size: usize,
    ) -> Result<BufferHandle> {
        self.register_relation(rel);
        let ext = self
            .extension_locks
            .entry(rel.rel)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = ext.lock();

        let mut page = Page::new();
        page.init(special_size);
        page.set_checksum();
        let block = self.smgr.extend(rel, &page)?;
        let tag = BufferTag::new(rel.rel, block);

        let desc = self.start_load(tag)?.ok_or_else(|| {
            DbError::Internal(format!("freshly extended block {} already cached", block))
        })?;
        *desc.data().write() = page;
        desc.complete_io(0, flags::DIRTY);
        debug!(rel = %rel.rel, block, "relation extended");
        Ok(BufferHandle::new(self.clone(), desc))
    }

    /// Claim a frame for `tag`: victim selection, tag switch, and
    /// lookup insertion, leaving IO_IN_PROGRESS held for the caller's
    /// read. Returns None if another thread claimed the tag first.
    fn start_load(&self, tag: BufferTag) -> Result<Option<Arc<BufferDesc>>> {
        let desc = self.evict_candidate()?;
        {
            let mut st = desc.state();
            st.tag = Some(tag);
            st.last_lsn = 0;
        }
        let raced = match self.lookup.entry(tag) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(desc.id);
                false
            }
            dashmap::mapref::entry::Entry::Occupied(_) => true,
        };
        if raced {
            desc.reset_free();
            self.freelist.lock().push(desc.id);
            return Ok(None);
        }
        Ok(Some(desc))
    }

    /// Undo a failed load: drop the mapping and free the frame.
    fn abort_load(&self, desc: &Arc<BufferDesc>, tag: BufferTag) {
        self.lookup.remove_if(&tag, |_, id| *id == desc.id);
        desc.reset_free();
        self.freelist.lock().push(desc.id);
    }

    /// Produce a frame that is exclusively ours: refcount 1 and
    /// IO_IN_PROGRESS set, detached from any previous tag.
    fn evict_candidate(&self) -> Result<Arc<BufferDesc>> {
        let n = self.descs.len();

        // Freelist first.
        while let Some(id) = self.freelist.lock().pop() {
            let desc = self.descs[id.index()].clone();
            let mut st = desc.state();
            if st.refcount == 0 && st.flags & flags::FREE != 0 {
                st.refcount = 1;
                st.flags = flags::IO_IN_PROGRESS;
                st.tag = None;
                drop(st);
                return Ok(desc);
            }
            // Stale entry; keep looking.
        }

        // Clock sweep. Two full rotations: the first may only clear
        // bias hints.
        for _ in 0..2 * n {
            let hand = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
            let desc = self.descs[hand].clone();
            let Some(mut st) = desc.try_state() else {
                continue;
            };
            if st.refcount > 0 || st.flags & flags::IO_IN_PROGRESS != 0 {
                continue;
            }
            if st.bias {
                // Bias is a replacement tiebreak only: spare the frame
                // for one rotation.
                st.bias = false;
                continue;
            }

            if st.flags & flags::DIRTY != 0 && st.flags & flags::REAPED == 0 {
                let tag = st.tag.expect("dirty frame without a tag");
                let lsn = st.last_lsn;
                st.flags |= flags::IO_IN_PROGRESS;
                drop(st);

                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                match self.write_page_out(&desc, tag, lsn) {
                    Ok(()) => desc.complete_io(0, flags::DIRTY),
                    Err(e) => {
                        desc.complete_io(0, 0);
                        return Err(e);
                    }
                }

                let mut st = desc.state();
                // Someone pinned it while we were writing; it survives.
                if st.refcount > 0 || st.flags & flags::IO_IN_PROGRESS != 0 {
                    continue;
                }
                self.claim_locked(&desc, &mut st);
                drop(st);
                return Ok(desc);
            }

            self.claim_locked(&desc, &mut st);
            drop(st);
            return Ok(desc);
        }

        Err(DbError::ResourceExhausted(
            "no unpinned buffers available".into(),
        ))
    }

    fn claim_locked(
        &self,
        desc: &Arc<BufferDesc>,
        st: &mut parking_lot::MutexGuard<'_, crate::buffer::descriptor::DescState>,
    ) {
        if let Some(old) = st.tag.take() {
            self.lookup.remove_if(&old, |_, id| *id == desc.id);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(rel = %old.rel, block = old.block, frame = desc.id.index(), "frame evicted");
        }
        st.refcount = 1;
        st.flags = flags::IO_IN_PROGRESS;
        st.bias = false;
        st.last_lsn = 0;
    }

    /// Physical write of a frame's page: WAL first, then the storage
    /// manager, with the page checksum refreshed.
    fn write_page_out(&self, desc: &Arc<BufferDesc>, tag: BufferTag, lsn: Lsn) -> Result<()> {
        if lsn != 0 {
            self.wal.flush(lsn)?;
        }
        let rel = self.relation_for(tag.rel)?;
        let mut page = desc.data().read().clone();
        page.set_checksum();
        self.smgr.write(&rel, tag.block, &page)
    }

    /// Write a dirty frame through to storage (checkpoint/explicit
    /// flush path). No-op for clean frames.
    pub fn flush_buffer(&self, desc: &Arc<BufferDesc>) -> Result<()> {
        let st = desc.start_io();
        let dirty = st.flags & flags::DIRTY != 0 && st.flags & flags::REAPED == 0;
        let tag = st.tag;
        let lsn = st.last_lsn;
        drop(st);

        match (dirty, tag) {
            (true, Some(tag)) => {
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                match self.write_page_out(desc, tag, lsn) {
                    Ok(()) => {
                        desc.complete_io(0, flags::DIRTY);
                        Ok(())
                    }
                    Err(e) => {
                        desc.complete_io(0, 0);
                        Err(e)
                    }
                }
            }
            _ => {
                desc.complete_io(0, 0);
                Ok(())
            }
        }
    }

    /// Flush every dirty frame (checkpoint support).
    pub fn flush_all(&self) -> Result<()> {
        for desc in &self.descs {
            self.flush_buffer(desc)?;
        }
        Ok(())
    }

    /// Drop every frame of a relation, discarding dirty content
    /// (relation truncate/unlink support).
    pub fn discard_relation(&self, rel: RelFileId) {
        for desc in &self.descs {
            let mut st = desc.state();
            if let Some(tag) = st.tag {
                if tag.rel == rel && st.refcount == 0 && st.flags & flags::IO_IN_PROGRESS == 0 {
                    self.lookup.remove_if(&tag, |_, id| *id == desc.id);
                    st.tag = None;
                    st.flags = flags::FREE;
                    st.last_lsn = 0;
                    drop(st);
                    self.freelist.lock().push(desc.id);
                }
            }
        }
    }

    /// Mark a resident page as biased: the clock sweep will spare it
    /// for one rotation. Used by delegated scans to keep shipped pages
    /// cache-resident for the consumer.
    pub fn set_bias(&self, tag: &BufferTag) {
        if let Some(id) = self.lookup.get(tag).map(|entry| *entry) {
            let desc = &self.descs[id.index()];
            let mut st = desc.state();
            if st.tag == Some(*tag) {
                st.bias = true;
            }
        }
    }

    pub fn register_read_trigger(&self, rel: RelFileId, trigger: ReadTrigger) {
        self.triggers.insert(rel, trigger);
    }

    pub fn clear_read_trigger(&self, rel: RelFileId) {
        self.triggers.remove(&rel);
    }

    /// Check the descriptor invariants across the pool.
    pub fn verify_invariants(&self) -> Result<()> {
        for desc in &self.descs {
            if desc.r_locks() < 0 {
                return Err(DbError::Internal(format!(
                    "frame {}: negative share count",
                    desc.id
                )));
            }
            if desc.w_lock() && desc.r_locks() > 0 {
                return Err(DbError::Internal(format!(
                    "frame {}: exclusive and shared latches both held",
                    desc.id
                )));
            }
            let st = desc.state();
            if let Some(tag) = st.tag {
                if st.flags & flags::FREE != 0 {
                    return Err(DbError::Internal(format!(
                        "frame {}: FREE but tagged {:?}",
                        desc.id, tag
                    )));
                }
            }
        }
        // Snapshot the mapping first; descriptor states are taken only
        // after the shard locks are released.
        let entries: Vec<(BufferTag, BufferId)> = self
            .lookup
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        for (tag, id) in entries {
            let desc = &self.descs[id.index()];
            let st = desc.state();
            if st.tag != Some(tag) && st.flags & flags::IO_IN_PROGRESS == 0 {
                warn!(frame = desc.id.index(), "stale lookup entry");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{item_flags, PageInsertMode};
    use crate::storage::StorageKind;
    use parking_lot::Mutex as PlMutex;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        mgr: Arc<BufferManager>,
        smgr: Arc<StorageManager>,
    }

    fn fixture(num_buffers: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let smgr = Arc::new(StorageManager::new(dir.path()));
        let wal = Arc::new(WalManager::bootstrap(dir.path().join("wal"), 4).unwrap());
        let mgr = BufferManager::new(BufferManagerConfig { num_buffers }, smgr.clone(), wal);
        Fixture {
            _dir: dir,
            mgr,
            smgr,
        }
    }

    fn mem_rel(smgr: &StorageManager, relid: u32, blocks: usize) -> Arc<SmgrRelation> {
        let rel = Arc::new(SmgrRelation::new(
            StorageKind::Memory,
            RelFileId::new(1, relid),
            format!("rel{}", relid),
            "db",
        ));
        smgr.create(&rel).unwrap();
        for i in 0..blocks {
            let mut page = Page::new();
            page.init(0);
            page.add_item(&[i as u8; 8], 0, PageInsertMode::Shuffle, item_flags::USED)
                .unwrap();
            page.set_checksum();
            smgr.extend(&rel, &page).unwrap();
        }
        rel
    }

    #[test]
    fn test_read_hit_and_miss_counting() {
        let fx = fixture(4);
        let rel = mem_rel(&fx.smgr, 10, 2);

        let h1 = fx.mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(h1.page().item(1).unwrap(), &[0u8; 8][..]);
        drop(h1);

        let h2 = fx.mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(fx.mgr.stats.misses.load(Ordering::Relaxed), 1);
        assert_eq!(fx.mgr.stats.hits.load(Ordering::Relaxed), 1);
        drop(h2);
        fx.mgr.verify_invariants().unwrap();
    }

    #[test]
    fn test_eviction_cycles_small_pool() {
        let fx = fixture(2);
        let rel = mem_rel(&fx.smgr, 11, 6);

        for block in 0..6 {
            let handle = fx.mgr.read_buffer(&rel, block).unwrap();
            assert_eq!(handle.page().item(1).unwrap(), &[block as u8; 8][..]);
        }
        assert!(fx.mgr.stats.evictions.load(Ordering::Relaxed) >= 4);
        fx.mgr.verify_invariants().unwrap();
    }

    #[test]
    fn test_pinned_frames_are_not_evicted() {
        let fx = fixture(2);
        let rel = mem_rel(&fx.smgr, 12, 3);

        let pinned0 = fx.mgr.read_buffer(&rel, 0).unwrap();
        let pinned1 = fx.mgr.read_buffer(&rel, 1).unwrap();

        // Pool exhausted: every frame pinned.
        let err = fx.mgr.read_buffer(&rel, 2);
        assert!(matches!(err, Err(DbError::ResourceExhausted(_))));

        drop(pinned1);
        let h2 = fx.mgr.read_buffer(&rel, 2).unwrap();
        assert_eq!(h2.page().item(1).unwrap(), &[2u8; 8][..]);

        // Block 0 was pinned throughout and is still a hit.
        let hits_before = fx.mgr.stats.hits.load(Ordering::Relaxed);
        let again = fx.mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(fx.mgr.stats.hits.load(Ordering::Relaxed), hits_before + 1);
        drop(again);
        drop(pinned0);
        fx.mgr.verify_invariants().unwrap();
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let fx = fixture(2);
        let rel = mem_rel(&fx.smgr, 13, 3);

        {
            let handle = fx.mgr.read_buffer(&rel, 0).unwrap();
            {
                let mut page = handle.page_mut();
                page.add_item(b"dirty-row", 0, PageInsertMode::Shuffle, item_flags::USED)
                    .unwrap();
            }
            handle.mark_dirty(0);
        }

        // Push block 0 out of the pool.
        for block in 1..3 {
            let _ = fx.mgr.read_buffer(&rel, block).unwrap();
        }
        assert!(fx.mgr.stats.writebacks.load(Ordering::Relaxed) >= 1);

        // Re-read from storage; the modification survived.
        let handle = fx.mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(handle.page().item(2).unwrap(), b"dirty-row");
        fx.mgr.verify_invariants().unwrap();
    }

    #[test]
    fn test_allocate_more_space_returns_initialized_page() {
        let fx = fixture(4);
        let rel = mem_rel(&fx.smgr, 14, 1);

        let handle = fx.mgr.allocate_more_space(&rel, 16).unwrap();
        assert_eq!(handle.tag().block, 1);
        let mut page = handle.page_mut();
        assert!(page.is_initialized());
        assert!(page.is_empty());
        page.add_item(b"first", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        drop(page);
        handle.mark_dirty(0);
        fx.mgr.verify_invariants().unwrap();
    }

    #[test]
    fn test_read_trigger_fires_under_shared_latch() {
        let fx = fixture(4);
        let rel = mem_rel(&fx.smgr, 15, 2);

        let seen: Arc<PlMutex<Vec<BlockNumber>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        fx.mgr.register_read_trigger(
            rel.rel,
            Arc::new(move |tag, _page| {
                sink.lock().push(tag.block);
            }),
        );

        let _h0 = fx.mgr.read_buffer(&rel, 0).unwrap();
        let _h1 = fx.mgr.read_buffer(&rel, 1).unwrap();
        // Hits do not refire the trigger.
        let _h0b = fx.mgr.read_buffer(&rel, 0).unwrap();

        assert_eq!(*seen.lock(), vec![0, 1]);
        fx.mgr.clear_read_trigger(rel.rel);
    }

    #[test]
    fn test_checksum_failure_rejected() {
        let dir = tempdir().unwrap();
        let smgr = Arc::new(StorageManager::new(dir.path()));
        let wal = Arc::new(WalManager::bootstrap(dir.path().join("wal"), 4).unwrap());
        let mgr = BufferManager::new(BufferManagerConfig { num_buffers: 4 }, smgr.clone(), wal);

        let rel = Arc::new(SmgrRelation::new(
            StorageKind::File,
            RelFileId::new(1, 16),
            "t",
            "db",
        ));
        smgr.create(&rel).unwrap();
        let mut page = Page::new();
        page.init(0);
        page.add_item(b"payload", 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page.set_checksum();
        // Corrupt one payload byte after checksumming.
        let upper = page.upper() as usize;
        page.as_bytes_mut()[upper] ^= 0x40;
        smgr.extend(&rel, &page).unwrap();

        let err = mgr.read_buffer(&rel, 0);
        assert!(matches!(err, Err(DbError::ChecksumFailure(_))));
        // The failed load released its frame.
        mgr.verify_invariants().unwrap();
        assert_eq!(mgr.stats.hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bias_spares_frame_for_one_rotation() {
        let fx = fixture(2);
        let rel = mem_rel(&fx.smgr, 17, 3);

        let h0 = fx.mgr.read_buffer(&rel, 0).unwrap();
        let tag0 = h0.tag();
        drop(h0);
        fx.mgr.set_bias(&tag0);

        // One more read fills the second frame; the next must evict,
        // and the biased frame survives the first pass.
        let _h1 = fx.mgr.read_buffer(&rel, 1).unwrap();
        let _h2 = fx.mgr.read_buffer(&rel, 2).unwrap();

        // Block 0 may or may not have survived depending on hand
        // position, but the pool must remain consistent.
        fx.mgr.verify_invariants().unwrap();
    }
}
