// # Common Types
//
// Shared identifiers, on-disk size constants, and the item pointer type
// used across every subsystem. These are the foundation for inter-module
// communication: page code addresses tuples by `ItemPointer`, the buffer
// cache addresses frames by `(RelFileId, BlockNumber)` tags, and the
// transaction machinery speaks in 64-bit `TransactionId`s.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Size constants (compile-time; recorded in the control file)
// ============================================================================

/// Size of a disk block / page in bytes.
pub const BLCKSZ: usize = 8192;

/// Number of pages per relation segment file (1 GiB segments).
pub const RELSEG_SIZE: u32 = 131_072;

/// Maximum alignment required for any on-page datum.
pub const MAXIMUM_ALIGNOF: usize = 8;

/// Internal catalog layout version, checked against the control file.
pub const CATALOG_VERSION_NO: u32 = 202_600_601;

/// Round `len` up to the next multiple of [`MAXIMUM_ALIGNOF`].
#[inline(always)]
pub const fn max_align(len: usize) -> usize {
    (len + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

// ============================================================================
// Identifier aliases
// ============================================================================

/// 64-bit transaction identifier. Zero is never assigned.
pub type TransactionId = u64;

/// Command counter within a transaction.
pub type CommandId = u32;

/// Byte position in the write-ahead log.
pub type Lsn = u64;

/// Page number within a relation, starting at zero.
pub type BlockNumber = u32;

/// 1-based index into a page's line-pointer array.
pub type OffsetNumber = u16;

/// Relation (table/index) identifier.
pub type RelationId = u32;

/// Database identifier.
pub type DatabaseId = u32;

/// Object identifier drawn from the shared OID generator.
pub type Oid = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;
pub const FIRST_NORMAL_TRANSACTION_ID: TransactionId = 1;
pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;
pub const INVALID_OFFSET_NUMBER: OffsetNumber = 0;
pub const FIRST_OFFSET_NUMBER: OffsetNumber = 1;
pub const INVALID_LSN: Lsn = 0;
pub const FIRST_COMMAND_ID: CommandId = 0;

/// Returns true for an assigned (non-zero) transaction id.
#[inline(always)]
pub fn transaction_id_is_valid(xid: TransactionId) -> bool {
    xid != INVALID_TRANSACTION_ID
}

// ============================================================================
// Relation file identity
// ============================================================================

/// Physical identity of a relation: the namespace every storage-manager
/// and buffer-tag lookup is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelFileId {
    pub db: DatabaseId,
    pub rel: RelationId,
}

impl RelFileId {
    pub fn new(db: DatabaseId, rel: RelationId) -> Self {
        Self { db, rel }
    }
}

impl fmt::Display for RelFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.db, self.rel)
    }
}

// ============================================================================
// Item pointers
// ============================================================================

/// A tuple identifier: block number plus 1-based line-pointer offset.
///
/// The invalid pointer is `(INVALID_BLOCK_NUMBER, 0)`. Ordering is by
/// block first, then offset, which matches on-disk scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    pub fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    pub fn invalid() -> Self {
        Self {
            block: INVALID_BLOCK_NUMBER,
            offset: INVALID_OFFSET_NUMBER,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK_NUMBER && self.offset != INVALID_OFFSET_NUMBER
    }

    pub fn set_invalid(&mut self) {
        *self = Self::invalid();
    }
}

impl Default for ItemPointer {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialOrd for ItemPointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemPointer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_align() {
        assert_eq!(max_align(0), 0);
        assert_eq!(max_align(1), 8);
        assert_eq!(max_align(8), 8);
        assert_eq!(max_align(9), 16);
    }

    #[test]
    fn test_item_pointer_validity() {
        let tid = ItemPointer::new(3, 1);
        assert!(tid.is_valid());
        assert!(!ItemPointer::invalid().is_valid());
        assert!(!ItemPointer::new(3, INVALID_OFFSET_NUMBER).is_valid());
    }

    #[test]
    fn test_item_pointer_ordering() {
        let a = ItemPointer::new(1, 2);
        let b = ItemPointer::new(1, 3);
        let c = ItemPointer::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }
}
