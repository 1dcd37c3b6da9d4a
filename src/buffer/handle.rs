// Pin handles. A pinned buffer is jointly owned by the caller and the
// buffer manager: the handle's destructor releases the pin, and the
// latch guards it hands out are orthogonal to the pin itself.

use std::sync::Arc;

use crate::buffer::descriptor::{BufferDesc, BufferTag, PageReadGuard, PageWriteGuard};
use crate::buffer::manager::BufferManager;
use crate::common::Lsn;
use crate::error::Result;

/// A pinned buffer. Dropping the handle unpins the frame, making it
/// eligible for eviction again.
pub struct BufferHandle {
    mgr: Arc<BufferManager>,
    desc: Arc<BufferDesc>,
}

impl BufferHandle {
    pub(crate) fn new(mgr: Arc<BufferManager>, desc: Arc<BufferDesc>) -> Self {
        Self { mgr, desc }
    }

    pub fn tag(&self) -> BufferTag {
        self.desc
            .state()
            .tag
            .expect("pinned buffer must carry a tag")
    }

    pub fn desc(&self) -> &Arc<BufferDesc> {
        &self.desc
    }

    /// Take the shared content latch.
    pub fn page(&self) -> PageReadGuard<'_> {
        self.desc.lock_shared()
    }

    /// Take the exclusive content latch.
    pub fn page_mut(&self) -> PageWriteGuard<'_> {
        self.desc.lock_exclusive()
    }

    /// Mark the page modified. `lsn` is the WAL position of the change;
    /// the frame will not be written out before the log is durable
    /// through it.
    pub fn mark_dirty(&self, lsn: Lsn) {
        let mut st = self.desc.state();
        st.flags |= crate::buffer::descriptor::flags::DIRTY;
        if lsn > st.last_lsn {
            st.last_lsn = lsn;
        }
    }

    /// Force this page through to storage now.
    pub fn flush(&self) -> Result<()> {
        self.mgr.flush_buffer(&self.desc)
    }

    pub fn pin_count(&self) -> u32 {
        self.desc.state().refcount
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        let mut st = self.desc.state();
        debug_assert!(st.refcount > 0, "unpinning an unpinned buffer");
        st.refcount = st.refcount.saturating_sub(1);
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("frame", &self.desc.id)
            .field("tag", &self.desc.state().tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // Handle behavior is exercised through the manager tests; the drop
    // contract is additionally covered here via pin counts.
    use super::*;
    use crate::buffer::manager::BufferManagerConfig;
    use crate::common::RelFileId;
    use crate::page::Page;
    use crate::storage::{SmgrRelation, StorageKind, StorageManager};
    use crate::wal::WalManager;
    use tempfile::tempdir;

    #[test]
    fn test_pin_count_follows_handles() {
        let dir = tempdir().unwrap();
        let smgr = Arc::new(StorageManager::new(dir.path()));
        let wal = Arc::new(WalManager::bootstrap(dir.path().join("wal"), 4).unwrap());
        let mgr = BufferManager::new(BufferManagerConfig { num_buffers: 4 }, smgr.clone(), wal);

        let rel = Arc::new(SmgrRelation::new(
            StorageKind::Memory,
            RelFileId::new(1, 30),
            "t",
            "db",
        ));
        smgr.create(&rel).unwrap();
        let mut page = Page::new();
        page.init(0);
        smgr.extend(&rel, &page).unwrap();

        let a = mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(a.pin_count(), 1);
        let b = mgr.read_buffer(&rel, 0).unwrap();
        assert_eq!(a.pin_count(), 2);
        drop(b);
        assert_eq!(a.pin_count(), 1);
        drop(a);
        mgr.verify_invariants().unwrap();
    }
}
