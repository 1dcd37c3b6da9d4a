// # Transaction Bookkeeping
//
// The xid and oid generators (advanced under their dedicated spinlocks
// so snapshot readers see a consistent next-xid), and the commit log:
// the authoritative record of transaction outcomes that visibility
// checks consult before trusting tuple hint bits.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::common::{Oid, TransactionId, FIRST_NORMAL_TRANSACTION_ID};
use crate::registry::{spin, SpinLockSet, ThreadSlot};

/// Outcome of a transaction as recorded in the commit log.
///
/// `Committed { durable: false }` means the commit record exists but has
/// not been confirmed flushed; hint bits are only set from durable
/// ("hard") commits, because a hint bit must never outlive the WAL
/// record that justifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidStatus {
    InProgress,
    Committed { durable: bool },
    Aborted,
}

/// In-memory commit log ("clog").
///
/// A xid with no entry at all was interrupted by a crash before writing
/// any outcome; visibility treats such xids as aborted.
#[derive(Default)]
pub struct CommitLog {
    states: DashMap<TransactionId, XidStatus>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, xid: TransactionId) {
        self.states.insert(xid, XidStatus::InProgress);
    }

    pub fn commit(&self, xid: TransactionId, durable: bool) {
        self.states.insert(xid, XidStatus::Committed { durable });
        trace!(xid, durable, "transaction committed");
    }

    /// Upgrade a soft commit to durable once its WAL record is flushed.
    pub fn make_durable(&self, xid: TransactionId) {
        if let Some(mut entry) = self.states.get_mut(&xid) {
            if matches!(*entry, XidStatus::Committed { .. }) {
                *entry = XidStatus::Committed { durable: true };
            }
        }
    }

    pub fn abort(&self, xid: TransactionId) {
        self.states.insert(xid, XidStatus::Aborted);
        trace!(xid, "transaction aborted");
    }

    pub fn status(&self, xid: TransactionId) -> Option<XidStatus> {
        self.states.get(&xid).map(|s| *s)
    }

    pub fn did_commit(&self, xid: TransactionId) -> bool {
        matches!(self.status(xid), Some(XidStatus::Committed { .. }))
    }

    pub fn did_hard_commit(&self, xid: TransactionId) -> bool {
        matches!(self.status(xid), Some(XidStatus::Committed { durable: true }))
    }

    pub fn did_abort(&self, xid: TransactionId) -> bool {
        matches!(self.status(xid), Some(XidStatus::Aborted))
    }

    /// True for a xid that vanished without recording an outcome; the
    /// transaction died hard and is treated as aborted.
    pub fn did_crash(&self, xid: TransactionId) -> bool {
        self.status(xid).is_none()
    }

    pub fn is_in_progress(&self, xid: TransactionId) -> bool {
        matches!(self.status(xid), Some(XidStatus::InProgress))
    }
}

/// Transaction-id generator. The counter itself is atomic; assignment
/// happens under the xid-gen spinlock so that a snapshot reading the
/// next xid under the same lock can never miss an id it will later see
/// as in-progress.
pub struct XidGenerator {
    next: AtomicU64,
}

impl XidGenerator {
    pub fn new(start: TransactionId) -> Self {
        Self {
            next: AtomicU64::new(start.max(FIRST_NORMAL_TRANSACTION_ID)),
        }
    }

    pub fn assign(&self, spins: &SpinLockSet, slot: &ThreadSlot) -> TransactionId {
        spins.acquire(slot, spin::XID_GEN);
        let xid = self.next.fetch_add(1, Ordering::SeqCst);
        spins.release(slot, spin::XID_GEN);
        xid
    }

    /// The next xid that would be assigned; the snapshot's `xmax`.
    pub fn read_next(&self) -> TransactionId {
        self.next.load(Ordering::SeqCst)
    }
}

/// Object-id generator, spinlock-guarded like the xid generator.
pub struct OidGenerator {
    next: AtomicU32,
}

impl OidGenerator {
    pub fn new(start: Oid) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    pub fn assign(&self, spins: &SpinLockSet, slot: &ThreadSlot) -> Oid {
        spins.acquire(slot, spin::OID_GEN);
        let oid = self.next.fetch_add(1, Ordering::SeqCst);
        spins.release(slot, spin::OID_GEN);
        oid
    }

    pub fn read_next(&self) -> Oid {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ThreadRegistry, ThreadType};

    #[test]
    fn test_commit_log_outcomes() {
        let clog = CommitLog::new();
        clog.begin(10);
        assert!(clog.is_in_progress(10));
        assert!(!clog.did_commit(10));

        clog.commit(10, false);
        assert!(clog.did_commit(10));
        assert!(!clog.did_hard_commit(10));

        clog.make_durable(10);
        assert!(clog.did_hard_commit(10));

        clog.begin(11);
        clog.abort(11);
        assert!(clog.did_abort(11));

        // Never-begun xid reads as crashed.
        assert!(clog.did_crash(999));
    }

    #[test]
    fn test_xid_generator_monotonic() {
        let registry = ThreadRegistry::new(1);
        let slot = registry.init_thread(ThreadType::Worker, 1).unwrap();
        let gen = XidGenerator::new(1);

        let a = gen.assign(&registry.spins, &slot);
        let b = gen.assign(&registry.spins, &slot);
        assert!(a < b);
        assert_eq!(gen.read_next(), b + 1);
        // No spinlocks left behind.
        registry.spins.release_all_held(&slot);
    }
}
