// Heap tuple headers: the MVCC metadata carried by every row version.
//
// Hint bits cache the commit/abort outcome of the inserting and
// deleting transactions. They are monotonic and idempotent, so they are
// set with a plain atomic OR and no latch: the underlying truth is
// always recoverable from the commit log.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::{CommandId, ItemPointer, TransactionId, INVALID_TRANSACTION_ID};

/// Tuple infomask flag bits.
pub mod infomask {
    /// Inserting transaction is known committed.
    pub const XMIN_COMMITTED: u32 = 0x0100;
    /// Inserting transaction is known aborted (or crashed).
    pub const XMIN_INVALID: u32 = 0x0200;
    /// Deleting transaction is known committed.
    pub const XMAX_COMMITTED: u32 = 0x0400;
    /// No deleter, or deleter known aborted.
    pub const XMAX_INVALID: u32 = 0x0800;
    /// The "deleter" only marked the row for update.
    pub const MARKED_FOR_UPDATE: u32 = 0x1000;
    /// Row was moved onto this page by vacuum.
    pub const MOVED_IN: u32 = 0x2000;
    /// Row was moved off this page by vacuum.
    pub const MOVED_OUT: u32 = 0x4000;
}

/// MVCC header of a heap tuple.
#[derive(Debug)]
pub struct HeapTupleHeader {
    pub t_xmin: TransactionId,
    pub t_xmax: TransactionId,
    pub t_cmin: CommandId,
    pub t_cmax: CommandId,
    /// Vacuum transaction that moved this row, when MOVED_IN is set.
    pub t_vtran: TransactionId,
    /// Forward pointer to the latest version of this row.
    pub t_ctid: ItemPointer,
    t_infomask: AtomicU32,
}

impl HeapTupleHeader {
    /// Header for a freshly inserted tuple.
    pub fn new(xmin: TransactionId, cmin: CommandId) -> Self {
        Self {
            t_xmin: xmin,
            t_xmax: INVALID_TRANSACTION_ID,
            t_cmin: cmin,
            t_cmax: 0,
            t_vtran: INVALID_TRANSACTION_ID,
            t_ctid: ItemPointer::invalid(),
            t_infomask: AtomicU32::new(infomask::XMAX_INVALID),
        }
    }

    /// Record a deleter. Clears the cached XMAX hints, which no longer
    /// describe the new xmax.
    pub fn set_xmax(&mut self, xmax: TransactionId, cmax: CommandId) {
        self.t_xmax = xmax;
        self.t_cmax = cmax;
        let mask = self.t_infomask.load(Ordering::Relaxed);
        self.t_infomask.store(
            mask & !(infomask::XMAX_INVALID | infomask::XMAX_COMMITTED | infomask::MARKED_FOR_UPDATE),
            Ordering::Relaxed,
        );
    }

    /// Current infomask value.
    #[inline]
    pub fn infomask(&self) -> u32 {
        self.t_infomask.load(Ordering::Relaxed)
    }

    /// True if any of `bits` is set.
    #[inline]
    pub fn has(&self, bits: u32) -> bool {
        self.infomask() & bits != 0
    }

    /// Latch-free monotonic hint update.
    #[inline]
    pub fn set_hint(&self, bits: u32) {
        self.t_infomask.fetch_or(bits, Ordering::Relaxed);
    }

    /// Non-hint flag set used by writers holding the content latch.
    pub fn set_flag(&mut self, bits: u32) {
        self.t_infomask.fetch_or(bits, Ordering::Relaxed);
    }
}

/// On-page size of an encoded tuple header.
pub const HEAP_TUPLE_HEADER_SIZE: usize = 42;

impl HeapTupleHeader {
    /// Serialize for storage at the front of a heap item.
    pub fn encode(&self) -> [u8; HEAP_TUPLE_HEADER_SIZE] {
        let mut buf = [0u8; HEAP_TUPLE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.t_xmin.to_le_bytes());
        buf[8..16].copy_from_slice(&self.t_xmax.to_le_bytes());
        buf[16..20].copy_from_slice(&self.t_cmin.to_le_bytes());
        buf[20..24].copy_from_slice(&self.t_cmax.to_le_bytes());
        buf[24..32].copy_from_slice(&self.t_vtran.to_le_bytes());
        buf[32..36].copy_from_slice(&self.t_ctid.block.to_le_bytes());
        buf[36..38].copy_from_slice(&self.t_ctid.offset.to_le_bytes());
        buf[38..42].copy_from_slice(&self.infomask().to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEAP_TUPLE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            t_xmin: TransactionId::from_le_bytes(buf[0..8].try_into().unwrap()),
            t_xmax: TransactionId::from_le_bytes(buf[8..16].try_into().unwrap()),
            t_cmin: CommandId::from_le_bytes(buf[16..20].try_into().unwrap()),
            t_cmax: CommandId::from_le_bytes(buf[20..24].try_into().unwrap()),
            t_vtran: TransactionId::from_le_bytes(buf[24..32].try_into().unwrap()),
            t_ctid: ItemPointer::new(
                u32::from_le_bytes(buf[32..36].try_into().unwrap()),
                u16::from_le_bytes(buf[36..38].try_into().unwrap()),
            ),
            t_infomask: AtomicU32::new(u32::from_le_bytes(buf[38..42].try_into().unwrap())),
        })
    }
}

impl Clone for HeapTupleHeader {
    fn clone(&self) -> Self {
        Self {
            t_xmin: self.t_xmin,
            t_xmax: self.t_xmax,
            t_cmin: self.t_cmin,
            t_cmax: self.t_cmax,
            t_vtran: self.t_vtran,
            t_ctid: self.t_ctid,
            t_infomask: AtomicU32::new(self.infomask()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tuple_has_invalid_xmax() {
        let header = HeapTupleHeader::new(10, 0);
        assert!(header.has(infomask::XMAX_INVALID));
        assert!(!header.has(infomask::XMIN_COMMITTED));
        assert_eq!(header.t_xmax, INVALID_TRANSACTION_ID);
    }

    #[test]
    fn test_set_xmax_clears_hints() {
        let mut header = HeapTupleHeader::new(10, 0);
        header.set_hint(infomask::XMAX_INVALID);
        header.set_xmax(20, 1);
        assert!(!header.has(infomask::XMAX_INVALID));
        assert_eq!(header.t_xmax, 20);
        assert_eq!(header.t_cmax, 1);
    }

    #[test]
    fn test_header_encode_round_trip() {
        let mut header = HeapTupleHeader::new(77, 3);
        header.set_xmax(88, 5);
        header.t_ctid = ItemPointer::new(12, 4);
        header.set_hint(infomask::XMIN_COMMITTED);

        let decoded = HeapTupleHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.t_xmin, 77);
        assert_eq!(decoded.t_xmax, 88);
        assert_eq!(decoded.t_cmin, 3);
        assert_eq!(decoded.t_cmax, 5);
        assert_eq!(decoded.t_ctid, ItemPointer::new(12, 4));
        assert_eq!(decoded.infomask(), header.infomask());
    }

    #[test]
    fn test_hint_bits_are_monotonic() {
        let header = HeapTupleHeader::new(10, 0);
        header.set_hint(infomask::XMIN_COMMITTED);
        header.set_hint(infomask::XMIN_COMMITTED);
        assert!(header.has(infomask::XMIN_COMMITTED));
        // Other bits untouched.
        assert!(!header.has(infomask::XMAX_COMMITTED));
    }
}
