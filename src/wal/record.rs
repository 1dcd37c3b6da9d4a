// On-disk WAL record and page formats.
//
// The log is a byte stream cut into BLCKSZ pages; each page begins with
// an `XLogPageHeader`. Records are 8-byte aligned and carry a fixed
// header followed by an opaque payload. A record whose payload does not
// fit on the current page continues on following pages as subrecords:
// the next page's header is flagged FIRST_IS_SUBRECORD and the
// continuation begins with an `XLogSubRecordHeader`.

use crate::common::{Lsn, TransactionId};
use crate::error::{DbError, Result};

pub const XLOG_PAGE_MAGIC: u16 = 0xD05B;

/// Page-header info flag: the first thing on this page is the
/// continuation of a record begun on an earlier page.
pub const XLP_FIRST_IS_SUBRECORD: u16 = 0x0001;

/// Record/subrecord info flag: more pieces follow on the next page.
pub const XLR_TO_BE_CONTINUED: u8 = 0x80;

pub const XLOG_PAGE_HDR_SIZE: usize = 8;
pub const XLOG_REC_HDR_SIZE: usize = 40;
pub const XLOG_SUBREC_HDR_SIZE: usize = 8;

/// Resource-manager ids.
pub mod rmgr {
    pub const XLOG: u8 = 0;
    pub const XACT: u8 = 1;
    pub const HEAP: u8 = 2;
    pub const INDEX: u8 = 3;
}

/// Record info values for the XACT resource manager.
pub mod xact_info {
    pub const COMMIT: u8 = 0x10;
    pub const ABORT: u8 = 0x20;
}

/// Record info values for the XLOG resource manager.
pub mod xlog_info {
    pub const CHECKPOINT: u8 = 0x10;
}

/// Record info values for the HEAP resource manager.
pub mod heap_info {
    pub const INSERT: u8 = 0x10;
    pub const DELETE: u8 = 0x20;
}

/// Header at the start of every WAL page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogPageHeader {
    pub magic: u16,
    pub info: u16,
}

impl XLogPageHeader {
    pub fn new(info: u16) -> Self {
        Self {
            magic: XLOG_PAGE_MAGIC,
            info,
        }
    }

    pub fn encode(&self) -> [u8; XLOG_PAGE_HDR_SIZE] {
        let mut buf = [0u8; XLOG_PAGE_HDR_SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2..4].copy_from_slice(&self.info.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < XLOG_PAGE_HDR_SIZE {
            return Err(DbError::Wal("short WAL page header".into()));
        }
        let header = Self {
            magic: u16::from_le_bytes([buf[0], buf[1]]),
            info: u16::from_le_bytes([buf[2], buf[3]]),
        };
        if header.magic != XLOG_PAGE_MAGIC {
            return Err(DbError::Wal(format!(
                "bad WAL page magic {:#06x}",
                header.magic
            )));
        }
        Ok(header)
    }
}

/// Fixed header of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogRecordHeader {
    /// LSN of the previous record in the log.
    pub prev_lsn: Lsn,
    /// LSN of this transaction's previous record.
    pub xact_prev_lsn: Lsn,
    pub xid: TransactionId,
    /// Total payload length across all pieces.
    pub len: u32,
    /// CRC32 over the full payload.
    pub crc: u32,
    pub info: u8,
    pub rmid: u8,
}

impl XLogRecordHeader {
    pub fn encode(&self) -> [u8; XLOG_REC_HDR_SIZE] {
        let mut buf = [0u8; XLOG_REC_HDR_SIZE];
        buf[0..8].copy_from_slice(&self.prev_lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.xact_prev_lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.xid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.len.to_le_bytes());
        buf[28..32].copy_from_slice(&self.crc.to_le_bytes());
        buf[32] = self.info;
        buf[33] = self.rmid;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < XLOG_REC_HDR_SIZE {
            return Err(DbError::Wal("short WAL record header".into()));
        }
        Ok(Self {
            prev_lsn: Lsn::from_le_bytes(buf[0..8].try_into().unwrap()),
            xact_prev_lsn: Lsn::from_le_bytes(buf[8..16].try_into().unwrap()),
            xid: TransactionId::from_le_bytes(buf[16..24].try_into().unwrap()),
            len: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            info: buf[32],
            rmid: buf[33],
        })
    }

    /// An all-zero header marks the end of the written log.
    pub fn is_terminator(&self) -> bool {
        self.len == 0 && self.xid == 0 && self.rmid == 0
    }
}

/// Header of a continuation piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogSubRecordHeader {
    /// Payload bytes remaining, including this piece.
    pub len: u32,
    pub info: u8,
}

impl XLogSubRecordHeader {
    pub fn encode(&self) -> [u8; XLOG_SUBREC_HDR_SIZE] {
        let mut buf = [0u8; XLOG_SUBREC_HDR_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4] = self.info;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < XLOG_SUBREC_HDR_SIZE {
            return Err(DbError::Wal("short WAL subrecord header".into()));
        }
        Ok(Self {
            len: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            info: buf[4],
        })
    }
}

/// Payload checksum, matching what the inserter stores in the record
/// header.
pub fn payload_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
