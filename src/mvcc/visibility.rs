// Tuple visibility predicates.
//
// Every predicate inspects the tuple's xmin/xmax/cmin/cmax and flag
// word against the calling transaction, the commit log, and (where
// applicable) a snapshot. Whenever a predicate resolves a previously
// unknown outcome against the commit log it caches the result as a
// hint bit; only durably committed outcomes are hinted, and a xid the
// commit log has no record of is treated as aborted (it crashed).

use crate::common::{transaction_id_is_valid, CommandId, TransactionId};
use crate::mvcc::snapshot::{DirtySnapshot, Snapshot};
use crate::mvcc::tuple::{infomask, HeapTupleHeader};
use crate::transaction::CommitLog;

/// Per-call context: who is asking, and as of which command.
pub struct VisibilityContext<'a> {
    pub xid: TransactionId,
    /// Command id the current scan started at.
    pub scan_cid: CommandId,
    pub clog: &'a CommitLog,
}

impl<'a> VisibilityContext<'a> {
    pub fn new(xid: TransactionId, scan_cid: CommandId, clog: &'a CommitLog) -> Self {
        Self { xid, scan_cid, clog }
    }

    #[inline]
    fn is_current(&self, xid: TransactionId) -> bool {
        transaction_id_is_valid(xid) && xid == self.xid
    }
}

/// Outcome of the UPDATE/DELETE conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleUpdateStatus {
    Invisible,
    MayBeUpdated,
    SelfUpdated,
    BeingUpdated,
    Updated,
}

/// Tuple classification for vacuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumStatus {
    /// Inserter aborted; the row was never visible to anyone.
    Stillborn,
    Live,
    /// Deleter committed but some snapshot may still see the row.
    RecentlyDead,
    /// Deleter committed before every live snapshot; removable.
    Dead,
    InsertInProgress,
    DeleteInProgress,
}

/// Resolve the inserting transaction. Returns `Some(true)` if the
/// inserter is known good (committed, or is the current transaction —
/// the caller handles command-id rules), `Some(false)` if the tuple is
/// dead to this predicate, `None` if the caller must keep going with
/// xmin committed.
///
/// Kept inline in each predicate below where the branch outcomes
/// differ; this helper covers only the shared hint maintenance.
fn note_xmin_outcome(tuple: &HeapTupleHeader, clog: &CommitLog) {
    if clog.did_abort(tuple.t_xmin) || clog.did_crash(tuple.t_xmin) {
        tuple.set_hint(infomask::XMIN_INVALID);
    }
}

fn note_xmax_outcome(tuple: &HeapTupleHeader, clog: &CommitLog) {
    if clog.did_abort(tuple.t_xmax) || clog.did_crash(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
    }
}

/// True iff the tuple is valid "for itself": as of everything that has
/// happened in the current transaction, including the current command.
pub fn satisfies_self(ctx: &VisibilityContext<'_>, tuple: &HeapTupleHeader) -> bool {
    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return false;
        }
        if ctx.is_current(tuple.t_xmin) {
            if tuple.has(infomask::XMAX_INVALID) {
                return true;
            }
            return tuple.has(infomask::MARKED_FOR_UPDATE);
        }
        if !ctx.clog.did_commit(tuple.t_xmin) {
            note_xmin_outcome(tuple, ctx.clog);
            return false;
        }
        if ctx.clog.did_hard_commit(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_COMMITTED);
        }
    }

    // The tuple was inserted validly.
    if tuple.has(infomask::XMAX_INVALID) {
        return true;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return true;
    }
    if tuple.has(infomask::XMAX_COMMITTED) {
        return tuple.has(infomask::MARKED_FOR_UPDATE);
    }
    if ctx.is_current(tuple.t_xmax) {
        return tuple.has(infomask::MARKED_FOR_UPDATE);
    }
    if !ctx.clog.did_commit(tuple.t_xmax) {
        note_xmax_outcome(tuple, ctx.clog);
        return true;
    }
    if ctx.clog.did_hard_commit(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_COMMITTED);
    }
    tuple.has(infomask::MARKED_FOR_UPDATE)
}

/// True iff the tuple is valid "now": everything in the current
/// transaction up to, but not including, the current command.
pub fn satisfies_now(ctx: &VisibilityContext<'_>, tuple: &HeapTupleHeader) -> bool {
    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return false;
        }
        if ctx.is_current(tuple.t_xmin) {
            if tuple.t_cmin >= ctx.scan_cid {
                return false; // inserted after scan started
            }
            if tuple.has(infomask::XMAX_INVALID) {
                return true;
            }
            if tuple.has(infomask::MARKED_FOR_UPDATE) {
                return true;
            }
            // Deleted by self: visible only if deleted after the scan
            // started.
            return tuple.t_cmax >= ctx.scan_cid;
        }
        if !ctx.clog.did_commit(tuple.t_xmin) {
            note_xmin_outcome(tuple, ctx.clog);
            return false;
        }
        if ctx.clog.did_hard_commit(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_COMMITTED);
        }
    }

    if tuple.has(infomask::XMAX_INVALID) {
        return true;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return true;
    }
    if tuple.has(infomask::XMAX_COMMITTED) {
        return tuple.has(infomask::MARKED_FOR_UPDATE);
    }
    if ctx.is_current(tuple.t_xmax) {
        if tuple.has(infomask::MARKED_FOR_UPDATE) {
            return true;
        }
        return tuple.t_cmax >= ctx.scan_cid;
    }
    if !ctx.clog.did_commit(tuple.t_xmax) {
        note_xmax_outcome(tuple, ctx.clog);
        return true;
    }
    if ctx.clog.did_hard_commit(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_COMMITTED);
    }
    tuple.has(infomask::MARKED_FOR_UPDATE)
}

/// Classify a tuple for a caller implementing UPDATE/DELETE conflict
/// handling.
pub fn satisfies_update(ctx: &VisibilityContext<'_>, tuple: &HeapTupleHeader) -> TupleUpdateStatus {
    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return TupleUpdateStatus::Invisible;
        }
        if ctx.is_current(tuple.t_xmin) {
            if tuple.t_cmin >= ctx.scan_cid {
                return TupleUpdateStatus::Invisible; // inserted after scan started
            }
            if tuple.has(infomask::XMAX_INVALID) {
                return TupleUpdateStatus::MayBeUpdated;
            }
            if tuple.has(infomask::MARKED_FOR_UPDATE) {
                return TupleUpdateStatus::MayBeUpdated;
            }
            if tuple.t_cmax >= ctx.scan_cid {
                return TupleUpdateStatus::SelfUpdated; // updated after scan started
            }
            return TupleUpdateStatus::Invisible; // updated before scan started
        }
        if !ctx.clog.did_commit(tuple.t_xmin) {
            note_xmin_outcome(tuple, ctx.clog);
            return TupleUpdateStatus::Invisible;
        }
        if ctx.clog.did_hard_commit(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_COMMITTED);
        }
    }

    if tuple.has(infomask::XMAX_INVALID) {
        return TupleUpdateStatus::MayBeUpdated;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return TupleUpdateStatus::MayBeUpdated;
    }
    if tuple.has(infomask::XMAX_COMMITTED) {
        if tuple.has(infomask::MARKED_FOR_UPDATE) {
            return TupleUpdateStatus::MayBeUpdated;
        }
        return TupleUpdateStatus::Updated; // updated by other
    }
    if ctx.is_current(tuple.t_xmax) {
        if tuple.has(infomask::MARKED_FOR_UPDATE) {
            return TupleUpdateStatus::MayBeUpdated;
        }
        if tuple.t_cmax >= ctx.scan_cid {
            return TupleUpdateStatus::SelfUpdated;
        }
        return TupleUpdateStatus::Invisible;
    }
    if !ctx.clog.did_commit(tuple.t_xmax) {
        if ctx.clog.did_abort(tuple.t_xmax) || ctx.clog.did_crash(tuple.t_xmax) {
            tuple.set_hint(infomask::XMAX_INVALID);
            return TupleUpdateStatus::MayBeUpdated;
        }
        return TupleUpdateStatus::BeingUpdated; // running xact
    }
    if ctx.clog.did_hard_commit(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_COMMITTED);
    }
    if tuple.has(infomask::MARKED_FOR_UPDATE) {
        return TupleUpdateStatus::MayBeUpdated;
    }
    TupleUpdateStatus::Updated
}

/// Dirty-read predicate: like `satisfies_self`, but an in-progress
/// inserter or deleter makes the tuple visible and publishes the xid to
/// the caller's dirty-snapshot side channel. A committed deleter
/// publishes the forward tid instead.
pub fn satisfies_dirty(
    ctx: &VisibilityContext<'_>,
    tuple: &HeapTupleHeader,
    dirty: &mut DirtySnapshot,
) -> bool {
    dirty.reset();

    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return false;
        }
        if ctx.is_current(tuple.t_xmin) {
            if tuple.has(infomask::XMAX_INVALID) {
                return true;
            }
            return tuple.has(infomask::MARKED_FOR_UPDATE);
        }
        if !ctx.clog.did_commit(tuple.t_xmin) {
            if ctx.clog.did_abort(tuple.t_xmin) || ctx.clog.did_crash(tuple.t_xmin) {
                tuple.set_hint(infomask::XMIN_INVALID);
                return false;
            }
            dirty.xmin = tuple.t_xmin;
            return true; // in insertion by other
        }
        if ctx.clog.did_hard_commit(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_COMMITTED);
        }
    }

    if tuple.has(infomask::XMAX_INVALID) {
        return true;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return true;
    }
    if tuple.has(infomask::XMAX_COMMITTED) {
        if tuple.has(infomask::MARKED_FOR_UPDATE) {
            return true;
        }
        dirty.tid = tuple.t_ctid;
        return false; // updated by other
    }
    if ctx.is_current(tuple.t_xmax) {
        return false;
    }
    if !ctx.clog.did_commit(tuple.t_xmax) {
        if ctx.clog.did_abort(tuple.t_xmax) || ctx.clog.did_crash(tuple.t_xmax) {
            tuple.set_hint(infomask::XMAX_INVALID);
            return true;
        }
        dirty.xmax = tuple.t_xmax;
        return true; // in updation by other
    }
    if ctx.clog.did_hard_commit(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_COMMITTED);
    }
    if tuple.has(infomask::MARKED_FOR_UPDATE) {
        return true;
    }
    dirty.tid = tuple.t_ctid;
    false
}

/// True iff the tuple is visible to `snapshot`: the inserter committed
/// before the snapshot and was not active during it, and the deleter
/// is invalid, aborted, or was still active at snapshot time.
pub fn satisfies_snapshot(
    ctx: &VisibilityContext<'_>,
    tuple: &HeapTupleHeader,
    snapshot: &Snapshot,
) -> bool {
    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return false;
        }
        if ctx.is_current(tuple.t_xmin) {
            if tuple.t_cmin >= ctx.scan_cid {
                return false; // inserted after scan started
            }
            if tuple.has(infomask::XMAX_INVALID) {
                return true;
            }
            if tuple.has(infomask::MARKED_FOR_UPDATE) {
                return true;
            }
            return tuple.t_cmax >= ctx.scan_cid;
        }
        if !ctx.clog.did_commit(tuple.t_xmin) {
            note_xmin_outcome(tuple, ctx.clog);
            return false;
        }
        if ctx.clog.did_hard_commit(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_COMMITTED);
        }
    }

    // The inserting transaction committed; check when.
    if tuple.has(infomask::MOVED_IN) {
        if snapshot.active_during(tuple.t_vtran) {
            return false;
        }
    } else if snapshot.active_during(tuple.t_xmin) {
        return false;
    }

    if tuple.has(infomask::XMAX_INVALID) {
        return true;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return true;
    }
    if tuple.has(infomask::MARKED_FOR_UPDATE) {
        return true;
    }

    if !tuple.has(infomask::XMAX_COMMITTED) {
        if ctx.is_current(tuple.t_xmax) {
            return tuple.t_cmax >= ctx.scan_cid;
        }
        if !ctx.clog.did_commit(tuple.t_xmax) {
            note_xmax_outcome(tuple, ctx.clog);
            return true;
        }
        if ctx.clog.did_hard_commit(tuple.t_xmax) {
            tuple.set_hint(infomask::XMAX_COMMITTED);
        }
    }

    if tuple.has(infomask::MOVED_OUT) {
        return false;
    }

    // Deleter committed; the row is still visible if the deleter was
    // active as of the snapshot.
    snapshot.active_during(tuple.t_xmax)
}

/// Classify a tuple for vacuum. `oldest_xmin` is the cutoff below
/// which no live snapshot can still see a deleted row.
pub fn satisfies_vacuum(
    clog: &CommitLog,
    tuple: &HeapTupleHeader,
    oldest_xmin: TransactionId,
) -> VacuumStatus {
    if !tuple.has(infomask::XMIN_COMMITTED) {
        if tuple.has(infomask::XMIN_INVALID) {
            return VacuumStatus::Stillborn;
        }
        if clog.did_commit(tuple.t_xmin) {
            if clog.did_hard_commit(tuple.t_xmin) {
                tuple.set_hint(infomask::XMIN_COMMITTED);
            }
        } else if clog.did_abort(tuple.t_xmin) || clog.did_crash(tuple.t_xmin) {
            tuple.set_hint(infomask::XMIN_INVALID);
            return VacuumStatus::Stillborn;
        } else {
            return VacuumStatus::InsertInProgress;
        }
    }

    // The inserter committed, so the row was good at some point. Now
    // the deleting transaction.
    if tuple.has(infomask::XMAX_INVALID) {
        return VacuumStatus::Live;
    }
    if !transaction_id_is_valid(tuple.t_xmax) {
        tuple.set_hint(infomask::XMAX_INVALID);
        return VacuumStatus::Live;
    }

    if !tuple.has(infomask::XMAX_COMMITTED) {
        if clog.did_commit(tuple.t_xmax) {
            if clog.did_hard_commit(tuple.t_xmax) {
                tuple.set_hint(infomask::XMAX_COMMITTED);
            }
        } else if clog.did_abort(tuple.t_xmax) || clog.did_crash(tuple.t_xmax) {
            tuple.set_hint(infomask::XMAX_INVALID);
            return VacuumStatus::Live;
        } else {
            return VacuumStatus::DeleteInProgress;
        }
    }

    if tuple.has(infomask::MARKED_FOR_UPDATE) {
        // The "deleter" only marked the row for update.
        return VacuumStatus::Live;
    }

    if tuple.t_xmax >= oldest_xmin {
        // Deleting xact is too recent; the row could still be visible.
        return VacuumStatus::RecentlyDead;
    }

    VacuumStatus::Dead
}
