// Buffer descriptors: the per-frame control block. The descriptor owns
// the frame's identity (its tag), the pin count and flag word, the
// I/O-in-progress latch (condvar on the state mutex), and the content
// latch (a reader/writer lock over the page image, mirrored into
// observable counters).
//
// Contracts:
// - a pin (`refcount > 0`) keeps the frame resident but does not
//   protect its contents;
// - the shared/exclusive content latch protects contents;
// - IO_IN_PROGRESS excludes both latch acquisition and eviction, and
//   only its setter may change the tag.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::common::{BlockNumber, Lsn, RelFileId};
use crate::page::Page;

/// Descriptor flag bits.
pub mod flags {
    /// Frame content differs from disk.
    pub const DIRTY: u16 = 0x01;
    /// Frame is on the freelist, not in the lookup table.
    pub const FREE: u16 = 0x02;
    /// A read or write of the frame's page is in flight.
    pub const IO_IN_PROGRESS: u16 = 0x04;
    /// Tag invalidated; frame is being torn down.
    pub const DELETED: u16 = 0x08;
    /// Relation dropped under the frame; discard without write-back.
    pub const REAPED: u16 = 0x10;
}

/// Frame identity: which page of which relation it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub rel: RelFileId,
    pub block: BlockNumber,
}

impl BufferTag {
    pub fn new(rel: RelFileId, block: BlockNumber) -> Self {
        Self { rel, block }
    }
}

/// Typed index of a frame in the buffer pool. Frame references never
/// travel as bare integers, so they cannot be confused with slot ids
/// or other counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

impl BufferId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position in the frame array.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable descriptor fields behind the state mutex.
#[derive(Debug)]
pub struct DescState {
    pub tag: Option<BufferTag>,
    pub flags: u16,
    pub refcount: u32,
    /// Sequential-scan bias: skip this frame for one eviction rotation.
    pub bias: bool,
    /// WAL position that must be durable before this page may be
    /// written out.
    pub last_lsn: Lsn,
}

/// One buffer descriptor.
pub struct BufferDesc {
    pub id: BufferId,
    state: Mutex<DescState>,
    /// Signalled when IO_IN_PROGRESS clears.
    io_cv: Condvar,
    data: RwLock<Page>,
    // Content-latch mirrors, observable for invariant checks.
    r_locks: AtomicI32,
    w_lock: AtomicBool,
    latch_waiters: AtomicU32,
}

impl BufferDesc {
    pub fn new(id: BufferId) -> Self {
        Self {
            id,
            state: Mutex::new(DescState {
                tag: None,
                flags: flags::FREE,
                refcount: 0,
                bias: false,
                last_lsn: 0,
            }),
            io_cv: Condvar::new(),
            data: RwLock::new(Page::new()),
            r_locks: AtomicI32::new(0),
            w_lock: AtomicBool::new(false),
            latch_waiters: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DescState> {
        self.state.lock()
    }

    /// Non-blocking state access for the clock sweep.
    pub fn try_state(&self) -> Option<MutexGuard<'_, DescState>> {
        self.state.try_lock()
    }

    /// Wait for any I/O in flight while already holding the state
    /// guard (re-acquired across the wait).
    pub fn wait_io_locked(&self, st: &mut MutexGuard<'_, DescState>) {
        while st.flags & flags::IO_IN_PROGRESS != 0 {
            self.io_cv.wait(st);
        }
    }

    /// Return the frame to pristine FREE state and wake I/O waiters.
    pub fn reset_free(&self) {
        let mut st = self.state.lock();
        st.tag = None;
        st.refcount = 0;
        st.bias = false;
        st.flags = flags::FREE;
        st.last_lsn = 0;
        drop(st);
        self.io_cv.notify_all();
    }

    /// Number of shared content latches currently held.
    pub fn r_locks(&self) -> i32 {
        self.r_locks.load(Ordering::Acquire)
    }

    /// Whether the exclusive content latch is held.
    pub fn w_lock(&self) -> bool {
        self.w_lock.load(Ordering::Acquire)
    }

    pub fn latch_waiters(&self) -> u32 {
        self.latch_waiters.load(Ordering::Acquire)
    }

    /// Claim the I/O latch: waits out any I/O in flight, then marks
    /// IO_IN_PROGRESS. The caller must pair with [`BufferDesc::complete_io`].
    pub fn start_io(&self) -> MutexGuard<'_, DescState> {
        let mut st = self.state.lock();
        while st.flags & flags::IO_IN_PROGRESS != 0 {
            self.io_cv.wait(&mut st);
        }
        st.flags |= flags::IO_IN_PROGRESS;
        st
    }

    /// Clear IO_IN_PROGRESS, apply flag edits, and wake I/O waiters.
    pub fn complete_io(&self, set: u16, clear: u16) {
        let mut st = self.state.lock();
        st.flags |= set;
        st.flags &= !(clear | flags::IO_IN_PROGRESS);
        drop(st);
        self.io_cv.notify_all();
    }

    /// Block until no I/O is in flight (without claiming the latch).
    pub fn wait_io(&self) {
        let mut st = self.state.lock();
        while st.flags & flags::IO_IN_PROGRESS != 0 {
            self.io_cv.wait(&mut st);
        }
    }

    /// Shared content latch.
    pub fn lock_shared(&self) -> PageReadGuard<'_> {
        self.wait_io();
        self.latch_waiters.fetch_add(1, Ordering::AcqRel);
        let guard = self.data.read();
        self.latch_waiters.fetch_sub(1, Ordering::AcqRel);
        self.r_locks.fetch_add(1, Ordering::AcqRel);
        PageReadGuard { desc: self, guard }
    }

    /// Exclusive content latch.
    pub fn lock_exclusive(&self) -> PageWriteGuard<'_> {
        self.wait_io();
        self.latch_waiters.fetch_add(1, Ordering::AcqRel);
        let guard = self.data.write();
        self.latch_waiters.fetch_sub(1, Ordering::AcqRel);
        self.w_lock.store(true, Ordering::Release);
        PageWriteGuard { desc: self, guard }
    }

    /// Content access for I/O paths that already hold the I/O latch.
    pub fn data(&self) -> &RwLock<Page> {
        &self.data
    }
}

impl std::fmt::Debug for BufferDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BufferDesc")
            .field("id", &self.id)
            .field("tag", &st.tag)
            .field("flags", &st.flags)
            .field("refcount", &st.refcount)
            .finish()
    }
}

/// Shared latch guard; derefs to the page.
pub struct PageReadGuard<'a> {
    desc: &'a BufferDesc,
    guard: parking_lot::RwLockReadGuard<'a, Page>,
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.desc.r_locks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive latch guard; derefs mutably to the page.
pub struct PageWriteGuard<'a> {
    desc: &'a BufferDesc,
    guard: parking_lot::RwLockWriteGuard<'a, Page>,
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.desc.w_lock.store(false, Ordering::Release);
    }
}
