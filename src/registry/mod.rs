// # Thread Registry
//
// The process table: one slot per worker thread, allocated at startup
// and recycled through a freelist. A slot records the worker's identity
// and transaction-visible state (xid, xmin, state) plus what it is
// blocked on. Snapshot acquisition walks these slots; the lock manager
// parks its wait pointers here; the error path uses the per-slot
// spinlock counters to release anything still held.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::{DatabaseId, TransactionId, INVALID_TRANSACTION_ID};
use crate::error::{DbError, Result};

/// Typed index of a slot in the process table. Slot references never
/// travel as bare integers, so they cannot be confused with buffer ids
/// or other counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position in the slot array.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Spinlocks
// ============================================================================

/// Fixed spinlock identifiers. Each protects one tiny critical section
/// in shared state.
pub mod spin {
    pub const SHMEM: usize = 0;
    pub const SHMEM_INDEX: usize = 1;
    pub const SINVAL: usize = 2;
    pub const OID_GEN: usize = 3;
    pub const XID_GEN: usize = 4;
    pub const CONTROL_FILE: usize = 5;
    pub const FREE_BUFFER: usize = 6;
    pub const PROC_STRUCT: usize = 7;

    pub const MAX_SPINS: usize = 8;
}

/// Test-and-set spinlock.
struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// The process-wide spinlock table. Acquisition is counted per thread
/// slot so that error recovery can release whatever a thread still
/// holds without knowing how it got there.
pub struct SpinLockSet {
    locks: [SpinLock; spin::MAX_SPINS],
}

impl Default for SpinLockSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLockSet {
    pub fn new() -> Self {
        Self {
            locks: [
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
                SpinLock::new(),
            ],
        }
    }

    pub fn acquire(&self, slot: &ThreadSlot, id: usize) {
        self.locks[id].acquire();
        slot.spins[id].fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self, slot: &ThreadSlot, id: usize) {
        let prev = slot.spins[id].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "releasing spinlock {} not held", id);
        self.locks[id].release();
    }

    /// Release every spinlock the slot still counts as held. Safe to
    /// call repeatedly; used on the error unwind.
    pub fn release_all_held(&self, slot: &ThreadSlot) {
        for id in 0..spin::MAX_SPINS {
            while slot.spins[id].load(Ordering::Relaxed) > 0 {
                self.release(slot, id);
            }
        }
    }
}

// ============================================================================
// Thread slots
// ============================================================================

/// What kind of worker owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// Ordinary query-executing worker.
    Worker,
    /// Background page writer.
    DbWriter,
    /// Vacuum worker.
    Vacuum,
    /// Delegated-scan helper; skipped by snapshot walks.
    Helper,
}

impl ThreadType {
    /// Internal threads never contribute xids to snapshots.
    pub fn is_internal(&self) -> bool {
        matches!(self, ThreadType::DbWriter | ThreadType::Helper)
    }
}

/// Transaction state advertised to snapshot readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Default,
    Start,
    Commit,
}

/// Where a blocked thread is waiting, for diagnostics and deadlock
/// inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub method: u8,
    pub object: u64,
    pub mode: u8,
}

/// Mutable slot fields, guarded by the slot gate.
#[derive(Debug)]
pub struct SlotState {
    pub ttype: ThreadType,
    pub database_id: DatabaseId,
    pub xid: TransactionId,
    pub xmin: TransactionId,
    pub trans_state: TransState,
    pub wait: Option<WaitInfo>,
}

/// One entry of the process table.
pub struct ThreadSlot {
    pub id: SlotId,
    state: Mutex<SlotState>,
    /// Set by the cancel path; polled by every timed wait.
    cancel: AtomicBool,
    spins: [AtomicU32; spin::MAX_SPINS],
    in_use: AtomicBool,
}

impl ThreadSlot {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                ttype: ThreadType::Worker,
                database_id: 0,
                xid: INVALID_TRANSACTION_ID,
                xmin: INVALID_TRANSACTION_ID,
                trans_state: TransState::Default,
                wait: None,
            }),
            cancel: AtomicBool::new(false),
            spins: Default::default(),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub fn set_wait(&self, wait: Option<WaitInfo>) {
        self.state.lock().wait = wait;
    }
}

impl std::fmt::Debug for ThreadSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadSlot")
            .field("id", &self.id)
            .field("xid", &state.xid)
            .field("state", &state.trans_state)
            .finish()
    }
}

/// Point-in-time copy of one slot, taken under its gate.
#[derive(Debug, Clone, Copy)]
pub struct SlotSnapshot {
    pub slot_id: SlotId,
    pub ttype: ThreadType,
    pub xid: TransactionId,
    pub xmin: TransactionId,
    pub trans_state: TransState,
}

// ============================================================================
// Registry
// ============================================================================

/// The fixed-size process table plus the spinlock set.
pub struct ThreadRegistry {
    slots: Vec<Arc<ThreadSlot>>,
    freelist: Mutex<Vec<SlotId>>,
    pub spins: SpinLockSet,
    alloc_count: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new(max_workers: usize) -> Self {
        let slots: Vec<_> = (0..max_workers)
            .map(|id| Arc::new(ThreadSlot::new(SlotId::new(id))))
            .collect();
        let freelist = (0..max_workers).rev().map(SlotId::new).collect();
        Self {
            slots,
            freelist: Mutex::new(freelist),
            spins: SpinLockSet::new(),
            alloc_count: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Claim a slot for the calling thread.
    pub fn init_thread(&self, ttype: ThreadType, database_id: DatabaseId) -> Result<Arc<ThreadSlot>> {
        let id = {
            let mut free = self.freelist.lock();
            free.pop().ok_or_else(|| {
                DbError::ResourceExhausted(format!(
                    "all {} thread slots in use",
                    self.slots.len()
                ))
            })?
        };
        let slot = self.slots[id.index()].clone();
        {
            let mut state = slot.state();
            state.ttype = ttype;
            state.database_id = database_id;
            state.xid = INVALID_TRANSACTION_ID;
            state.xmin = INVALID_TRANSACTION_ID;
            state.trans_state = TransState::Default;
            state.wait = None;
        }
        slot.clear_cancel();
        for counter in &slot.spins {
            counter.store(0, Ordering::Relaxed);
        }
        slot.in_use.store(true, Ordering::Release);
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        debug!(slot = id.index(), ?ttype, "thread slot claimed");
        Ok(slot)
    }

    /// Return a slot to the freelist.
    pub fn destroy_thread(&self, slot: &Arc<ThreadSlot>) {
        self.spins.release_all_held(slot);
        slot.in_use.store(false, Ordering::Release);
        self.alloc_count.fetch_sub(1, Ordering::Relaxed);
        self.freelist.lock().push(slot.id);
        debug!(slot = slot.id.index(), "thread slot released");
    }

    /// Record the start of a transaction in the slot.
    pub fn transaction_start(&self, slot: &ThreadSlot, xid: TransactionId) {
        let mut state = slot.state();
        state.trans_state = TransState::Start;
        state.xid = xid;
        state.xmin = xid;
    }

    /// Move the slot to COMMIT state; returns the xid being committed.
    pub fn transaction_end(&self, slot: &ThreadSlot) -> TransactionId {
        let mut state = slot.state();
        state.trans_state = TransState::Commit;
        state.xid
    }

    /// Clear the transaction fields after commit or abort completes.
    pub fn transaction_reset(&self, slot: &ThreadSlot) {
        let mut state = slot.state();
        state.trans_state = TransState::Default;
        state.xid = INVALID_TRANSACTION_ID;
        state.xmin = INVALID_TRANSACTION_ID;
        state.wait = None;
    }

    /// Visit every claimed slot with a consistent per-slot snapshot.
    /// The caller is expected to hold whatever outer lock its use case
    /// requires (snapshot acquisition holds the invalidation-bus lock).
    pub fn for_each_active(&self, mut f: impl FnMut(SlotSnapshot)) {
        for slot in &self.slots {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let state = slot.state();
            f(SlotSnapshot {
                slot_id: slot.id,
                ttype: state.ttype,
                xid: state.xid,
                xmin: state.xmin,
                trans_state: state.trans_state,
            });
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<&Arc<ThreadSlot>> {
        self.slots.get(id.index())
    }
}
