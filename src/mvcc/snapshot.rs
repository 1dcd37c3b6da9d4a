//! Snapshot construction for snapshot-isolation reads.
//!
//! A snapshot fixes the visible state of the database at a point in
//! time as `(xmin, xmax, xip)`: the lowest still-in-progress xid, the
//! next xid to be assigned, and the unordered set of in-progress xids
//! between them. Acquisition walks the thread registry under the
//! invalidation-bus lock so no concurrently starting transaction can
//! slip between the walk and the `xmax` read.

use crate::common::{transaction_id_is_valid, ItemPointer, TransactionId, INVALID_TRANSACTION_ID};
use crate::registry::{ThreadRegistry, ThreadSlot, TransState};
use crate::sinval::SInvalBus;
use crate::transaction::XidGenerator;

/// A point-in-time visibility snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Lowest xid that was still in progress at snapshot time; every
    /// xid below this is definitely finished.
    pub xmin: TransactionId,
    /// Next xid to be assigned; this and everything above is invisible.
    pub xmax: TransactionId,
    /// In-progress xids observed between xmin and xmax.
    pub xip: Vec<TransactionId>,
}

impl Snapshot {
    pub fn new(xmin: TransactionId, xmax: TransactionId, xip: Vec<TransactionId>) -> Self {
        Self { xmin, xmax, xip }
    }

    /// Was `xid` still active (or not yet started) as of this snapshot?
    pub fn active_during(&self, xid: TransactionId) -> bool {
        if xid >= self.xmax {
            return true;
        }
        if xid >= self.xmin {
            return self.xip.contains(&xid);
        }
        false
    }
}

/// Per-thread side channel filled by the dirty-read predicate: the
/// in-progress inserter/deleter it chose to trust, and the forward tid
/// of a row it found already updated.
#[derive(Debug, Clone)]
pub struct DirtySnapshot {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub tid: ItemPointer,
}

impl Default for DirtySnapshot {
    fn default() -> Self {
        Self {
            xmin: INVALID_TRANSACTION_ID,
            xmax: INVALID_TRANSACTION_ID,
            tid: ItemPointer::invalid(),
        }
    }
}

impl DirtySnapshot {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Build a snapshot for the thread owning `self_slot`.
///
/// The registry walk and the `xmax` read both happen under the
/// invalidation-bus lock; `xmax` is read after the walk, so it is `>=`
/// every xid any concurrent snapshot already saw as in-progress. Self
/// and internal helper threads are skipped.
pub fn snapshot_data(
    registry: &ThreadRegistry,
    bus: &SInvalBus,
    xids: &XidGenerator,
    self_slot: &ThreadSlot,
) -> Snapshot {
    let _bus_guard = bus.guard();

    let mut xip = Vec::new();
    let mut xmin = TransactionId::MAX;

    registry.for_each_active(|snap| {
        if snap.slot_id == self_slot.id || snap.ttype.is_internal() {
            return;
        }
        if !matches!(snap.trans_state, TransState::Start | TransState::Commit) {
            return;
        }
        if transaction_id_is_valid(snap.xid) {
            xip.push(snap.xid);
        }
        if transaction_id_is_valid(snap.xmin) && snap.xmin < xmin {
            xmin = snap.xmin;
        }
    });

    let xmax = xids.read_next();

    let self_xid = self_slot.state().xid;
    if transaction_id_is_valid(self_xid) && self_xid < xmin {
        xmin = self_xid;
    }
    if xmin == TransactionId::MAX {
        xmin = xmax;
    }

    Snapshot { xmin, xmax, xip }
}
