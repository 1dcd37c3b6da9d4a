// Lock acquisition, wait queues, and release.
//
// Locking protocol per lock row: all fields live behind the row mutex;
// the row condvar is notified whenever a waiter may have been granted.
// Waiters sleep in ~2 s cycles; each timed wake re-checks the cancel
// flag and runs a cross-lock wait-for-graph pass serialized by the
// detector mutex, so of two threads deadlocked across different rows
// exactly one elects itself victim.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::lock::{
    LockMethodCtl, LockMode, LockTag, HEAP_LOCK_METHOD, INDEX_LOCK_METHOD, MAX_LOCK_MODES,
    NUM_LOCK_METHODS, USER_LOCK_METHOD,
};
use crate::registry::{SlotId, ThreadSlot, WaitInfo};

/// Sleep quantum for blocked waiters; each expiry re-checks
/// cancellation and deadlocks.
const LOCK_WAIT_CYCLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HolderKey {
    slot: SlotId,
    xid: TransactionId,
}

/// Per-(lock, slot, xid) grant counts.
#[derive(Debug, Clone, Copy, Default)]
struct Holder {
    holders: [i32; MAX_LOCK_MODES],
    n_holding: i32,
}

impl Holder {
    fn mask(&self) -> u16 {
        let mut mask = 0u16;
        for (mode, &count) in self.holders.iter().enumerate().skip(1) {
            if count > 0 {
                mask |= 1 << mode;
            }
        }
        mask
    }
}

/// Shared grant flag between a parked waiter and its waker.
#[derive(Debug, Default)]
struct WaitGrant {
    granted: AtomicBool,
}

#[derive(Debug, Clone)]
struct Waiter {
    slot: SlotId,
    xid: TransactionId,
    mode: LockMode,
    /// Modes this (slot, xid) already held on this lock at enqueue.
    hold_mask: u16,
    shared: Arc<WaitGrant>,
}

impl Waiter {
    fn key(&self) -> HolderKey {
        HolderKey {
            slot: self.slot,
            xid: self.xid,
        }
    }
}

struct LockState {
    /// Demand per mode: granted plus waiting.
    holders: [i32; MAX_LOCK_MODES],
    /// Granted per mode.
    active: [i32; MAX_LOCK_MODES],
    n_holding: i32,
    n_active: i32,
    wait_mask: u16,
    queue: VecDeque<Waiter>,
    holder_rows: HashMap<HolderKey, Holder>,
    deleted: bool,
}

impl LockState {
    fn new() -> Self {
        Self {
            holders: [0; MAX_LOCK_MODES],
            active: [0; MAX_LOCK_MODES],
            n_holding: 0,
            n_active: 0,
            wait_mask: 0,
            queue: VecDeque::new(),
            holder_rows: HashMap::new(),
            deleted: false,
        }
    }

    fn recompute_wait_mask(&mut self) {
        let mut mask = 0u16;
        for waiter in &self.queue {
            mask |= waiter.mode.mask();
        }
        self.wait_mask = mask;
    }

    /// Would a request for `mode` by `key` conflict with modes granted
    /// to *other* holders?
    fn blocked_by_others(&self, ctl: &LockMethodCtl, mode: LockMode, key: HolderKey) -> bool {
        let mine = self
            .holder_rows
            .get(&key)
            .copied()
            .unwrap_or_default()
            .holders;
        for held in 1..MAX_LOCK_MODES {
            if self.active[held] - mine[held] > 0
                && ctl.conflict_tab[mode.index()] & (1 << held) != 0
            {
                return true;
            }
        }
        false
    }

    fn grant(&mut self, key: HolderKey, mode: LockMode) {
        self.active[mode.index()] += 1;
        self.n_active += 1;
        let holder = self.holder_rows.entry(key).or_default();
        holder.holders[mode.index()] += 1;
        holder.n_holding += 1;
    }

    fn empty(&self) -> bool {
        self.n_holding == 0 && self.queue.is_empty()
    }
}

struct LockRow {
    tag: LockTag,
    state: Mutex<LockState>,
    cv: Condvar,
}

impl LockRow {
    fn new(tag: LockTag) -> Self {
        Self {
            tag,
            state: Mutex::new(LockState::new()),
            cv: Condvar::new(),
        }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Default)]
pub struct LockManagerStats {
    pub acquires: AtomicU64,
    pub waits: AtomicU64,
    pub deadlocks: AtomicU64,
    pub cancels: AtomicU64,
}

/// The lock manager: one table per lock method.
pub struct LockManager {
    methods: [LockMethodCtl; NUM_LOCK_METHODS],
    tables: [DashMap<LockTag, Arc<LockRow>>; NUM_LOCK_METHODS],
    /// Per-slot list of (tag, xid) holder rows, drained by release_all.
    slot_queues: DashMap<SlotId, Vec<(LockTag, TransactionId)>>,
    /// Serializes wait-for-graph passes so only one victim is chosen.
    detector: Mutex<()>,
    pub stats: LockManagerStats,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            methods: [
                LockMethodCtl::new(HEAP_LOCK_METHOD),
                LockMethodCtl::new(INDEX_LOCK_METHOD),
                LockMethodCtl::new(USER_LOCK_METHOD),
            ],
            tables: [DashMap::new(), DashMap::new(), DashMap::new()],
            slot_queues: DashMap::new(),
            detector: Mutex::new(()),
            stats: LockManagerStats::default(),
        }
    }

    fn ctl(&self, tag: &LockTag) -> &LockMethodCtl {
        &self.methods[(tag.method - 1) as usize]
    }

    fn table(&self, tag: &LockTag) -> &DashMap<LockTag, Arc<LockRow>> {
        &self.tables[(tag.method - 1) as usize]
    }

    /// Look up or create the lock row, skipping rows condemned by a
    /// concurrent remover.
    fn live_row(&self, tag: &LockTag) -> Arc<LockRow> {
        loop {
            let row = self
                .table(tag)
                .entry(*tag)
                .or_insert_with(|| Arc::new(LockRow::new(*tag)))
                .clone();
            if !row.state.lock().deleted {
                return row;
            }
            self.table(tag).remove_if(tag, |_, r| Arc::ptr_eq(r, &row));
        }
    }

    fn note_holder(&self, slot: SlotId, tag: LockTag, xid: TransactionId) {
        let mut queue = self.slot_queues.entry(slot).or_default();
        if !queue.contains(&(tag, xid)) {
            queue.push((tag, xid));
        }
    }

    /// Acquire `mode` on `tag` for `(slot, xid)`, blocking if needed.
    ///
    /// With `dont_wait`, a conflicting request fails immediately
    /// instead of enqueueing.
    pub fn acquire(
        &self,
        slot: &ThreadSlot,
        tag: LockTag,
        xid: TransactionId,
        mode: LockMode,
        dont_wait: bool,
    ) -> Result<()> {
        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        let ctl = self.ctl(&tag);
        let key = HolderKey { slot: slot.id, xid };

        loop {
            let row = self.live_row(&tag);
            let mut st = row.state.lock();
            if st.deleted {
                continue;
            }

            st.holder_rows.entry(key).or_default();

            // Deadlock-class self-conflict: the same thread already
            // holds a conflicting mode under a different xid. Waiting
            // would block on ourselves forever.
            let self_conflict = st.holder_rows.iter().any(|(other, holder)| {
                other.slot == slot.id && other.xid != xid && ctl.conflicts(mode, holder.mask())
            });
            if self_conflict {
                drop(st);
                self.forget_holder_if_empty(&row, key);
                return Err(DbError::Deadlock(xid));
            }

            if !st.blocked_by_others(ctl, mode, key) {
                st.holders[mode.index()] += 1;
                st.n_holding += 1;
                st.grant(key, mode);
                drop(st);
                self.note_holder(slot.id, tag, xid);
                trace!(?tag, %mode, slot = slot.id.index(), "lock granted");
                return Ok(());
            }

            if dont_wait {
                drop(st);
                self.forget_holder_if_empty(&row, key);
                return Err(DbError::Lock(format!(
                    "lock {:?} not available in mode {}",
                    tag, mode
                )));
            }

            // Advertise demand so later arrivals order themselves
            // behind us, then enqueue.
            st.holders[mode.index()] += 1;
            st.n_holding += 1;

            let waiter = Waiter {
                slot: slot.id,
                xid,
                mode,
                hold_mask: st.holder_rows.get(&key).map(|h| h.mask()).unwrap_or(0),
                shared: Arc::new(WaitGrant::default()),
            };
            let shared = waiter.shared.clone();

            if let Err(err) = Self::enqueue(ctl, &mut st, waiter) {
                st.holders[mode.index()] -= 1;
                st.n_holding -= 1;
                drop(st);
                self.forget_holder_if_empty(&row, key);
                self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            st.recompute_wait_mask();

            slot.set_wait(Some(WaitInfo {
                method: tag.method,
                object: tag.object,
                mode: mode as u8,
            }));
            self.note_holder(slot.id, tag, xid);
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
            debug!(?tag, %mode, slot = slot.id.index(), "lock wait begins");

            let outcome = self.sleep_on(&row, st, slot, key, mode, &shared, xid);
            slot.set_wait(None);
            return outcome;
        }
    }

    /// Park on the row condvar until granted, cancelled, or deadlocked.
    fn sleep_on<'a>(
        &self,
        row: &'a Arc<LockRow>,
        mut st: MutexGuard<'a, LockState>,
        slot: &ThreadSlot,
        key: HolderKey,
        mode: LockMode,
        shared: &Arc<WaitGrant>,
        xid: TransactionId,
    ) -> Result<()> {
        loop {
            let timed_out = row.cv.wait_for(&mut st, LOCK_WAIT_CYCLE).timed_out();

            if shared.granted.load(Ordering::Acquire) {
                trace!(slot = slot.id.index(), %mode, "lock wait granted");
                return Ok(());
            }
            if !timed_out {
                continue;
            }

            if slot.is_cancelled() {
                self.withdraw_waiter(&mut st, row, key, mode, shared);
                drop(st);
                self.forget_holder_if_empty(row, key);
                self.stats.cancels.fetch_add(1, Ordering::Relaxed);
                return Err(DbError::LockCancelled(xid));
            }

            // Periodic deadlock pass. The row mutex must be released
            // while the detector inspects other rows.
            drop(st);
            let deadlocked = self.deadlock_victim_pass(slot.id, row, key, mode, shared);
            st = row.state.lock();

            if shared.granted.load(Ordering::Acquire) {
                return Ok(());
            }
            if deadlocked {
                drop(st);
                self.forget_holder_if_empty(row, key);
                self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                debug!(slot = slot.id.index(), %mode, "deadlock victim, aborting wait");
                return Err(DbError::Deadlock(xid));
            }
        }
    }

    /// Run one cycle check and, if this slot is deadlocked, withdraw
    /// its waiter while still holding the detector — so a second
    /// deadlocked thread re-checks against the updated queue and finds
    /// the cycle already broken. Exactly one victim per cycle.
    fn deadlock_victim_pass(
        &self,
        slot_id: SlotId,
        row: &Arc<LockRow>,
        key: HolderKey,
        mode: LockMode,
        shared: &Arc<WaitGrant>,
    ) -> bool {
        let _serial = self.detector.lock();
        if !self.cycle_exists(slot_id) {
            return false;
        }
        let mut st = row.state.lock();
        if shared.granted.load(Ordering::Acquire) {
            // Granted while the graph was being built; not a victim.
            return false;
        }
        self.withdraw_waiter(&mut st, row, key, mode, shared);
        true
    }

    /// Remove our queue entry and undo the advertised demand.
    fn withdraw_waiter(
        &self,
        st: &mut LockState,
        row: &Arc<LockRow>,
        _key: HolderKey,
        mode: LockMode,
        shared: &Arc<WaitGrant>,
    ) {
        if let Some(pos) = st
            .queue
            .iter()
            .position(|w| Arc::ptr_eq(&w.shared, shared))
        {
            st.queue.remove(pos);
            st.holders[mode.index()] -= 1;
            st.n_holding -= 1;
        }
        st.recompute_wait_mask();
        // Our departure may let a previously blocked sequence advance.
        let ctl = self.ctl(&row.tag);
        if Self::wakeup_locked(ctl, st) > 0 {
            row.cv.notify_all();
        }
    }

    /// Queue insertion with the tail-scan ordering heuristic.
    ///
    /// Scanning from the newest waiter toward the oldest, each scanned
    /// peer gets a symmetric-conflict deadlock check (I wait on a mode
    /// he holds on this lock, and he waits on one I hold). The scan
    /// stops — and the new waiter parks behind the stop point — at the
    /// first peer whose wait mode conflicts with ours, the first
    /// same-mode peer (keeping per-mode FIFO and letting compatible
    /// modes coalesce), or a peer waiting on a mode we hold. A waiter
    /// that conflicts with no queued mode parks at the front.
    fn enqueue(ctl: &LockMethodCtl, st: &mut LockState, waiter: Waiter) -> Result<()> {
        if !ctl.conflicts(waiter.mode, st.wait_mask) {
            st.queue.push_front(waiter);
            return Ok(());
        }

        let mut insert_at = 0usize;
        let mut idx = st.queue.len();
        while idx > 0 {
            let peer = &st.queue[idx - 1];
            if ctl.conflicts(waiter.mode, peer.hold_mask) {
                // We would wait on a mode he holds here; if he is also
                // waiting on one we hold, that is a deadlock.
                if ctl.conflicts(peer.mode, waiter.hold_mask) {
                    return Err(DbError::Deadlock(waiter.xid));
                }
                // Otherwise scan past him.
            } else if ctl.conflicts(peer.mode, waiter.hold_mask) {
                insert_at = idx;
                break;
            } else if peer.mode == waiter.mode
                || ctl.conflicts(waiter.mode, peer.mode.mask())
            {
                insert_at = idx;
                break;
            }
            idx -= 1;
        }
        st.queue.insert(insert_at, waiter);
        Ok(())
    }

    /// Walk the queue from the front, granting every waiter whose mode
    /// no longer conflicts with the remaining grants, stopping at the
    /// first still-blocked waiter. Returns the number granted.
    fn wakeup_locked(ctl: &LockMethodCtl, st: &mut LockState) -> usize {
        let mut awoken = 0;
        while let Some(front) = st.queue.front() {
            let key = front.key();
            let mode = front.mode;
            if st.blocked_by_others(ctl, mode, key) {
                break;
            }
            let waiter = st.queue.pop_front().expect("queue front vanished");
            st.grant(key, mode);
            waiter.shared.granted.store(true, Ordering::Release);
            awoken += 1;
        }
        if awoken > 0 {
            st.recompute_wait_mask();
        }
        awoken
    }

    /// Release one grant of `mode`.
    pub fn release(
        &self,
        slot: &ThreadSlot,
        tag: LockTag,
        xid: TransactionId,
        mode: LockMode,
    ) -> Result<()> {
        let ctl = self.ctl(&tag);
        let key = HolderKey { slot: slot.id, xid };

        let row = match self.table(&tag).get(&tag) {
            Some(entry) => entry.clone(),
            None => {
                return Err(DbError::Lock(format!(
                    "release of {:?} not held",
                    tag
                )))
            }
        };
        let mut st = row.state.lock();
        if st.deleted {
            return Err(DbError::Lock(format!("release of {:?} not held", tag)));
        }

        let drop_holder = {
            let holder = st.holder_rows.get_mut(&key).ok_or_else(|| {
                DbError::Lock(format!("slot {} holds nothing on {:?}", slot.id, tag))
            })?;
            if holder.holders[mode.index()] <= 0 {
                return Err(DbError::Lock(format!(
                    "slot {} does not hold {} on {:?}",
                    slot.id, mode, tag
                )));
            }
            holder.holders[mode.index()] -= 1;
            holder.n_holding -= 1;
            holder.n_holding == 0
        };
        if drop_holder {
            st.holder_rows.remove(&key);
        }

        st.holders[mode.index()] -= 1;
        st.n_holding -= 1;
        st.active[mode.index()] -= 1;
        st.n_active -= 1;

        // With no waiters of this mode outstanding, its wait bit goes.
        if st.active[mode.index()] == st.holders[mode.index()] {
            st.wait_mask &= !mode.mask();
        }

        let awoken = Self::wakeup_locked(ctl, &mut st);
        if awoken > 0 {
            row.cv.notify_all();
        }

        if st.empty() {
            st.deleted = true;
            drop(st);
            self.table(&tag).remove_if(&tag, |_, r| Arc::ptr_eq(r, &row));
        }
        Ok(())
    }

    /// Drop every lock `(slot, xid)` still holds. With `xid` None, all
    /// of the slot's holders are dropped regardless of xid (session
    /// cleanup).
    pub fn release_all(&self, slot: &ThreadSlot, xid: Option<TransactionId>) {
        let entries = match self.slot_queues.get_mut(&slot.id) {
            Some(mut queue) => {
                let (drop_now, keep): (Vec<_>, Vec<_>) = queue
                    .drain(..)
                    .partition(|(_, entry_xid)| xid.is_none() || Some(*entry_xid) == xid);
                *queue = keep;
                drop_now
            }
            None => return,
        };

        for (tag, entry_xid) in entries {
            loop {
                let key = HolderKey {
                    slot: slot.id,
                    xid: entry_xid,
                };
                let held = {
                    let row = match self.table(&tag).get(&tag) {
                        Some(entry) => entry.clone(),
                        None => break,
                    };
                    let st = row.state.lock();
                    match st.holder_rows.get(&key) {
                        Some(holder) => holder
                            .holders
                            .iter()
                            .enumerate()
                            .skip(1)
                            .find(|(_, &count)| count > 0)
                            .map(|(mode, _)| LockMode::from_index(mode).unwrap()),
                        None => None,
                    }
                };
                match held {
                    Some(mode) => {
                        // Best effort; the row may vanish between
                        // iterations.
                        let _ = self.release(slot, tag, entry_xid, mode);
                    }
                    None => break,
                }
            }
        }
    }

    /// If the holder row exists but records no grants, drop it.
    fn forget_holder_if_empty(&self, row: &Arc<LockRow>, key: HolderKey) {
        let mut st = row.state.lock();
        if let Some(holder) = st.holder_rows.get(&key) {
            if holder.n_holding == 0 {
                st.holder_rows.remove(&key);
            }
        }
        if st.empty() && !st.deleted {
            st.deleted = true;
            let tag = row.tag;
            drop(st);
            self.table(&tag).remove_if(&tag, |_, r| Arc::ptr_eq(r, row));
        }
    }

    /// Build the wait-for graph and report whether `slot` sits on a
    /// cycle. Caller holds the detector mutex.
    fn cycle_exists(&self, slot: SlotId) -> bool {
        let mut edges: HashMap<SlotId, HashSet<SlotId>> = HashMap::new();
        for (tidx, table) in self.tables.iter().enumerate() {
            let ctl = &self.methods[tidx];
            for entry in table.iter() {
                let st = entry.value().state.lock();
                for waiter in &st.queue {
                    for (key, holder) in st.holder_rows.iter() {
                        if key.slot == waiter.slot {
                            continue;
                        }
                        if ctl.conflicts(waiter.mode, holder.mask()) {
                            edges.entry(waiter.slot).or_default().insert(key.slot);
                        }
                    }
                }
            }
        }

        // DFS from `slot` looking for a path back to it.
        let mut stack: Vec<SlotId> = edges.get(&slot).into_iter().flatten().copied().collect();
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == slot {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = edges.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Introspection (tests, monitoring)
    // ------------------------------------------------------------------

    /// Granted counts per mode for a lock, if the row exists.
    pub fn granted(&self, tag: &LockTag) -> Option<[i32; MAX_LOCK_MODES]> {
        self.table(tag).get(tag).map(|row| row.state.lock().active)
    }

    /// Number of queued waiters on a lock.
    pub fn waiting(&self, tag: &LockTag) -> usize {
        self.table(tag)
            .get(tag)
            .map(|row| row.state.lock().queue.len())
            .unwrap_or(0)
    }

    /// Verify the holder/lock counter invariants on every live row:
    /// per-mode holder sums equal the granted vector, and the granted
    /// total equals `n_active`.
    pub fn verify_integrity(&self) -> Result<()> {
        for table in &self.tables {
            for entry in table.iter() {
                let st = entry.value().state.lock();
                let mut per_mode = [0i32; MAX_LOCK_MODES];
                let mut total = 0;
                for holder in st.holder_rows.values() {
                    for (mode, &count) in holder.holders.iter().enumerate().skip(1) {
                        per_mode[mode] += count;
                        total += count;
                    }
                }
                for mode in 1..MAX_LOCK_MODES {
                    if per_mode[mode] != st.active[mode] {
                        return Err(DbError::Internal(format!(
                            "lock {:?}: holder sum {} != active {} for mode {}",
                            entry.key(),
                            per_mode[mode],
                            st.active[mode],
                            mode
                        )));
                    }
                }
                if total != st.n_active {
                    return Err(DbError::Internal(format!(
                        "lock {:?}: holder total {} != n_active {}",
                        entry.key(),
                        total,
                        st.n_active
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ThreadRegistry, ThreadType};
    use std::thread;

    fn setup(workers: usize) -> (Arc<LockManager>, Arc<ThreadRegistry>, Vec<Arc<ThreadSlot>>) {
        let lm = Arc::new(LockManager::new());
        let registry = Arc::new(ThreadRegistry::new(workers));
        let slots = (0..workers)
            .map(|_| registry.init_thread(ThreadType::Worker, 1).unwrap())
            .collect();
        (lm, registry, slots)
    }

    #[test]
    fn test_shared_modes_coexist() {
        let (lm, _registry, slots) = setup(2);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

        lm.acquire(&slots[0], tag, 100, LockMode::AccessShare, false)
            .unwrap();
        lm.acquire(&slots[1], tag, 101, LockMode::AccessShare, false)
            .unwrap();

        let granted = lm.granted(&tag).unwrap();
        assert_eq!(granted[LockMode::AccessShare.index()], 2);
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_reacquire_same_mode_stacks() {
        let (lm, _registry, slots) = setup(1);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 7);

        lm.acquire(&slots[0], tag, 100, LockMode::RowExclusive, false)
            .unwrap();
        lm.acquire(&slots[0], tag, 100, LockMode::RowExclusive, false)
            .unwrap();
        assert_eq!(lm.granted(&tag).unwrap()[LockMode::RowExclusive.index()], 2);

        lm.release(&slots[0], tag, 100, LockMode::RowExclusive).unwrap();
        lm.release(&slots[0], tag, 100, LockMode::RowExclusive).unwrap();
        // Fully released rows are reclaimed.
        assert!(lm.granted(&tag).is_none());
    }

    #[test]
    fn test_own_locks_do_not_block_self() {
        let (lm, _registry, slots) = setup(1);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 7);

        lm.acquire(&slots[0], tag, 100, LockMode::Share, false).unwrap();
        // Share conflicts with RowExclusive, but only across holders.
        lm.acquire(&slots[0], tag, 100, LockMode::RowExclusive, false)
            .unwrap();
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_dont_wait_fails_fast() {
        let (lm, _registry, slots) = setup(2);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

        lm.acquire(&slots[0], tag, 100, LockMode::AccessExclusive, false)
            .unwrap();
        let err = lm.acquire(&slots[1], tag, 101, LockMode::AccessShare, true);
        assert!(err.is_err());
        // The failed probe left no residue.
        assert_eq!(lm.waiting(&tag), 0);
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_blocked_waiter_granted_on_release() {
        let (lm, _registry, slots) = setup(2);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

        lm.acquire(&slots[0], tag, 100, LockMode::AccessExclusive, false)
            .unwrap();

        let lm2 = lm.clone();
        let slot1 = slots[1].clone();
        let waiter = thread::spawn(move || {
            lm2.acquire(&slot1, tag, 101, LockMode::AccessShare, false)
        });

        // Give the waiter time to park.
        while lm.waiting(&tag) == 0 {
            thread::yield_now();
        }
        lm.release(&slots[0], tag, 100, LockMode::AccessExclusive)
            .unwrap();

        waiter.join().unwrap().unwrap();
        let granted = lm.granted(&tag).unwrap();
        assert_eq!(granted[LockMode::AccessShare.index()], 1);
        assert_eq!(granted[LockMode::AccessExclusive.index()], 0);
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_same_lock_upgrade_deadlock_detected() {
        // Two Share holders both requesting Exclusive on the same lock:
        // the enqueue-time symmetric check fires for the second.
        let (lm, _registry, slots) = setup(2);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

        lm.acquire(&slots[0], tag, 100, LockMode::Share, false).unwrap();
        lm.acquire(&slots[1], tag, 101, LockMode::Share, false).unwrap();

        let lm2 = lm.clone();
        let slot0 = slots[0].clone();
        let first = thread::spawn(move || {
            lm2.acquire(&slot0, tag, 100, LockMode::Exclusive, false)
        });
        while lm.waiting(&tag) == 0 {
            thread::yield_now();
        }

        let second = lm.acquire(&slots[1], tag, 101, LockMode::Exclusive, false);
        assert!(matches!(second, Err(DbError::Deadlock(_))));

        // Releasing the second holder's Share unblocks the first.
        lm.release(&slots[1], tag, 101, LockMode::Share).unwrap();
        first.join().unwrap().unwrap();
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_release_all_drops_everything() {
        let (lm, _registry, slots) = setup(1);
        let t1 = LockTag::relation(HEAP_LOCK_METHOD, 1, 1);
        let t2 = LockTag::relation(INDEX_LOCK_METHOD, 1, 2);

        lm.acquire(&slots[0], t1, 100, LockMode::RowExclusive, false)
            .unwrap();
        lm.acquire(&slots[0], t1, 100, LockMode::AccessShare, false)
            .unwrap();
        lm.acquire(&slots[0], t2, 100, LockMode::AccessShare, false)
            .unwrap();

        lm.release_all(&slots[0], Some(100));
        assert!(lm.granted(&t1).is_none());
        assert!(lm.granted(&t2).is_none());
        lm.verify_integrity().unwrap();
    }

    #[test]
    fn test_fifo_wakeup_stops_at_blocked_waiter() {
        let (lm, _registry, slots) = setup(3);
        let tag = LockTag::relation(HEAP_LOCK_METHOD, 1, 42);

        lm.acquire(&slots[0], tag, 100, LockMode::AccessExclusive, false)
            .unwrap();

        // Queue a Share waiter, then a RowExclusive waiter behind it
        // (RowExclusive conflicts with Share, so it cannot jump ahead).
        let lm_a = lm.clone();
        let slot_a = slots[1].clone();
        let blocked_share =
            thread::spawn(move || lm_a.acquire(&slot_a, tag, 101, LockMode::Share, false));
        while lm.waiting(&tag) < 1 {
            thread::yield_now();
        }
        let lm_b = lm.clone();
        let slot_b = slots[2].clone();
        let blocked_rowex =
            thread::spawn(move || lm_b.acquire(&slot_b, tag, 102, LockMode::RowExclusive, false));
        while lm.waiting(&tag) < 2 {
            thread::yield_now();
        }

        // Releasing the AccessExclusive grants Share at the front; the
        // wakeup walk then stops at RowExclusive, which conflicts with
        // the newly granted Share.
        lm.release(&slots[0], tag, 100, LockMode::AccessExclusive)
            .unwrap();
        blocked_share.join().unwrap().unwrap();
        assert_eq!(lm.waiting(&tag), 1);
        assert_eq!(lm.granted(&tag).unwrap()[LockMode::Share.index()], 1);

        lm.release(&slots[1], tag, 101, LockMode::Share).unwrap();
        blocked_rowex.join().unwrap().unwrap();
        lm.verify_integrity().unwrap();
    }
}
