// # Lock Manager
//
// Multi-granularity two-phase locking:
//
// - **Modes**: the eight standard table/row modes with the classic
//   conflict matrix.
// - **Method tables**: independent lock spaces for heap, index, and
//   caller-exposed advisory ("user") locks.
// - **Lock rows** keyed by `(relation, db, object, offset, method)`
//   carrying per-mode demand/grant vectors and a fair wait queue.
// - **Holder rows** keyed by `(lock, slot, xid)` recording per-mode
//   grant counts so release is symmetric with acquisition.
//
// Waiting is condvar-based with a ~2 s wake cycle that re-checks the
// thread's cancel flag and runs a wait-for-graph deadlock pass.

pub mod manager;

pub use manager::{LockManager, LockManagerStats};

use std::fmt;

use crate::common::{DatabaseId, RelationId};

/// Lock method identifier: which independent lock table to use.
pub type LockMethod = u8;

pub const HEAP_LOCK_METHOD: LockMethod = 1;
pub const INDEX_LOCK_METHOD: LockMethod = 2;
pub const USER_LOCK_METHOD: LockMethod = 3;
pub const NUM_LOCK_METHODS: usize = 3;

/// Mode vectors are indexed 1..=8; index 0 is unused.
pub const MAX_LOCK_MODES: usize = 9;

/// Bitmask over lock modes.
pub type LockMask = u16;

/// The eight lock modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockMode {
    AccessShare = 1,
    RowShare = 2,
    RowExclusive = 3,
    ShareUpdateExclusive = 4,
    Share = 5,
    ShareRowExclusive = 6,
    Exclusive = 7,
    AccessExclusive = 8,
}

impl LockMode {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn mask(self) -> LockMask {
        1 << (self as usize)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            1 => LockMode::AccessShare,
            2 => LockMode::RowShare,
            3 => LockMode::RowExclusive,
            4 => LockMode::ShareUpdateExclusive,
            5 => LockMode::Share,
            6 => LockMode::ShareRowExclusive,
            7 => LockMode::Exclusive,
            8 => LockMode::AccessExclusive,
            _ => return None,
        })
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::AccessShare => "AccessShare",
            LockMode::RowShare => "RowShare",
            LockMode::RowExclusive => "RowExclusive",
            LockMode::ShareUpdateExclusive => "ShareUpdateExclusive",
            LockMode::Share => "Share",
            LockMode::ShareRowExclusive => "ShareRowExclusive",
            LockMode::Exclusive => "Exclusive",
            LockMode::AccessExclusive => "AccessExclusive",
        };
        write!(f, "{}", name)
    }
}

const fn mask_of(modes: &[u8]) -> LockMask {
    let mut mask = 0u16;
    let mut i = 0;
    while i < modes.len() {
        mask |= 1 << modes[i];
        i += 1;
    }
    mask
}

/// Per-method control data: the conflict matrix and the waiter-ordering
/// priority tiebreak vector.
#[derive(Debug, Clone)]
pub struct LockMethodCtl {
    pub id: LockMethod,
    /// `conflict_tab[m]` has bit `h` set iff a request for mode `m`
    /// conflicts with a held mode `h`.
    pub conflict_tab: [LockMask; MAX_LOCK_MODES],
    /// Waiter-ordering tiebreak only.
    pub prio: [u8; MAX_LOCK_MODES],
}

/// The standard conflict matrix, shared by every method table.
pub const CONFLICT_TAB: [LockMask; MAX_LOCK_MODES] = [
    0,
    // AccessShare
    mask_of(&[8]),
    // RowShare
    mask_of(&[7, 8]),
    // RowExclusive
    mask_of(&[5, 6, 7, 8]),
    // ShareUpdateExclusive
    mask_of(&[4, 5, 6, 7, 8]),
    // Share
    mask_of(&[3, 4, 6, 7, 8]),
    // ShareRowExclusive
    mask_of(&[3, 4, 5, 6, 7, 8]),
    // Exclusive
    mask_of(&[2, 3, 4, 5, 6, 7, 8]),
    // AccessExclusive
    mask_of(&[1, 2, 3, 4, 5, 6, 7, 8]),
];

pub const LOCK_PRIO: [u8; MAX_LOCK_MODES] = [0, 1, 2, 3, 4, 5, 6, 7, 8];

impl LockMethodCtl {
    pub const fn new(id: LockMethod) -> Self {
        Self {
            id,
            conflict_tab: CONFLICT_TAB,
            prio: LOCK_PRIO,
        }
    }

    /// Does a request for `mode` conflict with any mode in `held`?
    #[inline]
    pub fn conflicts(&self, mode: LockMode, held: LockMask) -> bool {
        self.conflict_tab[mode.index()] & held != 0
    }
}

/// Identity of a lockable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag {
    pub method: LockMethod,
    pub db: DatabaseId,
    pub relation: RelationId,
    /// Block number or transaction id, depending on granularity.
    pub object: u64,
    pub offset: u16,
}

impl LockTag {
    /// Relation-level lock.
    pub fn relation(method: LockMethod, db: DatabaseId, relation: RelationId) -> Self {
        Self {
            method,
            db,
            relation,
            object: 0,
            offset: 0,
        }
    }

    /// Page-level lock.
    pub fn page(method: LockMethod, db: DatabaseId, relation: RelationId, block: u64) -> Self {
        Self {
            method,
            db,
            relation,
            object: block,
            offset: 0,
        }
    }

    /// Tuple-level lock.
    pub fn tuple(
        method: LockMethod,
        db: DatabaseId,
        relation: RelationId,
        block: u64,
        offset: u16,
    ) -> Self {
        Self {
            method,
            db,
            relation,
            object: block,
            offset,
        }
    }

    /// Advisory lock in the user method space.
    pub fn advisory(db: DatabaseId, key: u64) -> Self {
        Self {
            method: USER_LOCK_METHOD,
            db,
            relation: 0,
            object: key,
            offset: 0,
        }
    }

    /// Transaction-id lock (used to wait for a xact to finish).
    pub fn transaction(method: LockMethod, db: DatabaseId, xid: u64) -> Self {
        Self {
            method,
            db,
            relation: 0,
            object: xid,
            offset: 0,
        }
    }
}
