// The write-ahead log proper: a ring of in-memory page frames filled by
// serialized inserters and drained to 16 MiB segment files.
//
// Three locks partition the work, mirroring the classic split:
//
// | Lock     | Protects |
// |----------|----------|
// | `insert` | Space reservation and frame filling |
// | `write`  | Segment files and the write-out cursor |
// | `info`   | Shared write/flush request watermarks |
//
// The write-ahead rule callers rely on: `flush(lsn)` returns only after
// every log byte up to (at least) the end of the page containing `lsn`
// is on stable storage.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BufMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{Lsn, TransactionId, BLCKSZ};
use crate::error::{DbError, Result};
use crate::wal::record::{
    payload_crc, rmgr, xact_info, xlog_info, XLogPageHeader, XLogRecordHeader,
    XLogSubRecordHeader, XLOG_PAGE_HDR_SIZE, XLOG_REC_HDR_SIZE, XLOG_SUBREC_HDR_SIZE,
    XLP_FIRST_IS_SUBRECORD, XLR_TO_BE_CONTINUED,
};

/// Bytes per log segment file.
pub const XLOG_SEG_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum number of in-memory page frames.
pub const MIN_XLOG_BUFFERS: usize = 4;

const PAGE: u64 = BLCKSZ as u64;

#[inline]
fn page_start(lsn: Lsn) -> Lsn {
    lsn - lsn % PAGE
}

#[inline]
fn page_end(lsn: Lsn) -> Lsn {
    page_start(lsn) + PAGE
}

#[inline]
fn page_remaining(lsn: Lsn) -> usize {
    (page_end(lsn) - lsn) as usize
}

#[inline]
fn align8(lsn: Lsn) -> Lsn {
    (lsn + 7) & !7
}

/// Segment file name: `<logid hex 8><seg hex 8>`.
pub fn segment_file_name(segno: u64) -> String {
    let log_id = (segno * XLOG_SEG_SIZE >> 32) as u32;
    let seg = ((segno * XLOG_SEG_SIZE & 0xFFFF_FFFF) / XLOG_SEG_SIZE) as u32;
    format!("{:08X}{:08X}", log_id, seg)
}

fn segment_path(dir: &Path, segno: u64) -> PathBuf {
    dir.join(segment_file_name(segno))
}

struct InsertState {
    curr_idx: usize,
    curr_lsn: Lsn,
    prev_record: Lsn,
}

struct WriteState {
    curr_out_idx: usize,
    open: Option<(u64, File)>,
}

#[derive(Default)]
struct Watermarks {
    write_rqst: Lsn,
    flush_rqst: Lsn,
}

/// The shared WAL state.
pub struct WalManager {
    wal_dir: PathBuf,
    frames: Vec<Mutex<Vec<u8>>>,
    /// One-past-end byte LSN of the page each frame holds (0 = unused).
    xlblocks: Vec<AtomicU64>,
    insert: Mutex<InsertState>,
    write: Mutex<WriteState>,
    info: Mutex<Watermarks>,
    /// End of fully inserted log content.
    insert_upto: AtomicU64,
    /// Bytes written out to segment files.
    written: AtomicU64,
    /// Bytes known durable (fsynced).
    flushed: AtomicU64,
}

impl WalManager {
    /// Create a fresh log beginning at LSN 0 (cluster bootstrap).
    pub fn bootstrap(wal_dir: impl Into<PathBuf>, buffers: usize) -> Result<Self> {
        let wal_dir = wal_dir.into();
        std::fs::create_dir_all(&wal_dir)?;
        let wal = Self::start_at(wal_dir, buffers, 0)?;
        // Materialize the first segment so the directory is visibly
        // initialized even before the first flush.
        {
            let mut w = wal.write.lock();
            wal.open_segment(&mut w, 0)?;
        }
        Ok(wal)
    }

    /// Resume an existing log, appending at `end_of_log`. When that
    /// lands mid-page, the partial page is reloaded so the log stream
    /// stays gapless.
    pub fn open_at(wal_dir: impl Into<PathBuf>, buffers: usize, end_of_log: Lsn) -> Result<Self> {
        let wal_dir = wal_dir.into();
        let end = align8(end_of_log);
        let start = page_start(end);
        let wal = Self::start_at(wal_dir.clone(), buffers, start)?;

        let resume = end.max(start + XLOG_PAGE_HDR_SIZE as u64);
        if resume > start + XLOG_PAGE_HDR_SIZE as u64 {
            // Reload the existing partial page image.
            let path = segment_path(&wal_dir, start / XLOG_SEG_SIZE);
            if path.exists() {
                use std::io::Read;
                let mut file = File::open(&path)?;
                file.seek(SeekFrom::Start(start % XLOG_SEG_SIZE))?;
                let mut buf = vec![0u8; BLCKSZ];
                if file.read_exact(&mut buf).is_ok() {
                    *wal.frames[0].lock() = buf;
                }
            }
        }
        {
            let mut ins = wal.insert.lock();
            ins.curr_lsn = resume;
        }
        wal.insert_upto.store(resume, Ordering::Release);
        Ok(wal)
    }

    fn start_at(wal_dir: PathBuf, buffers: usize, start: Lsn) -> Result<Self> {
        debug_assert_eq!(start % PAGE, 0);
        let buffers = buffers.max(MIN_XLOG_BUFFERS);
        let frames: Vec<_> = (0..buffers).map(|_| Mutex::new(vec![0u8; BLCKSZ])).collect();
        let xlblocks: Vec<_> = (0..buffers).map(|_| AtomicU64::new(0)).collect();

        let wal = Self {
            wal_dir,
            frames,
            xlblocks,
            insert: Mutex::new(InsertState {
                curr_idx: 0,
                curr_lsn: start + XLOG_PAGE_HDR_SIZE as u64,
                prev_record: 0,
            }),
            write: Mutex::new(WriteState {
                curr_out_idx: 0,
                open: None,
            }),
            info: Mutex::new(Watermarks::default()),
            insert_upto: AtomicU64::new(start + XLOG_PAGE_HDR_SIZE as u64),
            written: AtomicU64::new(start),
            flushed: AtomicU64::new(start),
        };

        // Lay down the first page header.
        {
            let mut frame = wal.frames[0].lock();
            frame[..XLOG_PAGE_HDR_SIZE].copy_from_slice(&XLogPageHeader::new(0).encode());
        }
        wal.xlblocks[0].store(start + PAGE, Ordering::Release);
        Ok(wal)
    }

    /// End of fully inserted log content.
    pub fn current_lsn(&self) -> Lsn {
        self.insert_upto.load(Ordering::Acquire)
    }

    /// Durable watermark.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::Acquire)
    }

    fn frame_write(&self, idx: usize, offset: usize, bytes: &[u8]) {
        let mut frame = self.frames[idx].lock();
        frame[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Insert one record; returns its LSN.
    ///
    /// `hdr` and `body` are concatenated into the record payload. A
    /// record that does not fit on the current page is split into
    /// continuation subrecords on the following pages.
    pub fn insert(
        &self,
        rmid: u8,
        info: u8,
        xid: TransactionId,
        xact_prev: Lsn,
        hdr: &[u8],
        body: &[u8],
    ) -> Result<Lsn> {
        let mut payload = bytes::BytesMut::with_capacity(hdr.len() + body.len());
        payload.put_slice(hdr);
        payload.put_slice(body);
        let payload = payload.freeze();
        let crc = payload_crc(&[&payload]);

        let mut ins = self.insert.lock();

        // A position exactly on a page boundary still belongs to the
        // previous (full) page; both cases need a fresh page before the
        // record header goes down.
        if ins.curr_lsn % PAGE == 0 || page_remaining(ins.curr_lsn) <= XLOG_REC_HDR_SIZE {
            self.advance_page(&mut ins, false)?;
        }

        let lsn = ins.curr_lsn;
        let first_room = page_remaining(lsn) - XLOG_REC_HDR_SIZE;
        let continued = payload.len() > first_room;

        let header = XLogRecordHeader {
            prev_lsn: ins.prev_record,
            xact_prev_lsn: xact_prev,
            xid,
            len: payload.len() as u32,
            crc,
            info: info | if continued { XLR_TO_BE_CONTINUED } else { 0 },
            rmid,
        };
        self.frame_write(ins.curr_idx, (lsn % PAGE) as usize, &header.encode());
        ins.curr_lsn += XLOG_REC_HDR_SIZE as u64;

        let mut off = 0usize;
        loop {
            let room = page_remaining(ins.curr_lsn);
            let take = room.min(payload.len() - off);
            if take > 0 {
                self.frame_write(
                    ins.curr_idx,
                    (ins.curr_lsn % PAGE) as usize,
                    &payload[off..off + take],
                );
                ins.curr_lsn += take as u64;
                off += take;
            }
            if off == payload.len() {
                break;
            }

            self.advance_page(&mut ins, true)?;
            let rest = payload.len() - off;
            let room_after_sub = page_remaining(ins.curr_lsn) - XLOG_SUBREC_HDR_SIZE;
            let sub = XLogSubRecordHeader {
                len: rest as u32,
                info: if rest > room_after_sub {
                    XLR_TO_BE_CONTINUED
                } else {
                    0
                },
            };
            self.frame_write(ins.curr_idx, (ins.curr_lsn % PAGE) as usize, &sub.encode());
            ins.curr_lsn += XLOG_SUBREC_HDR_SIZE as u64;
        }

        ins.curr_lsn = align8(ins.curr_lsn);
        ins.prev_record = lsn;
        self.insert_upto.store(ins.curr_lsn, Ordering::Release);

        let backlog = ins.curr_lsn - self.written.load(Ordering::Acquire);
        drop(ins);

        // Opportunistic write-out once half the frame cache is behind.
        if backlog > (self.frames.len() as u64 / 2) * PAGE {
            let target = {
                let mut info = self.info.lock();
                info.write_rqst = info.write_rqst.max(page_start(lsn));
                info.write_rqst
            };
            self.write_upto(target, false)?;
        }

        trace!(lsn, rmid, xid, len = payload.len(), "wal record inserted");
        Ok(lsn)
    }

    /// Move the inserter onto the next frame, recycling it once its old
    /// content has been written out.
    fn advance_page(&self, ins: &mut InsertState, continuation: bool) -> Result<()> {
        let next_start = if ins.curr_lsn % PAGE == 0 {
            ins.curr_lsn
        } else {
            page_end(ins.curr_lsn)
        };
        // The old page's zero tail is valid terminator content.
        self.insert_upto.store(next_start, Ordering::Release);

        let next_idx = (ins.curr_idx + 1) % self.frames.len();
        let old_end = self.xlblocks[next_idx].load(Ordering::Acquire);
        if old_end != 0 && self.written.load(Ordering::Acquire) < old_end {
            // No free buffer: publish the demand and do the write
            // ourselves.
            {
                let mut info = self.info.lock();
                info.write_rqst = info.write_rqst.max(old_end);
            }
            self.write_upto(old_end, false)?;
        }

        {
            let mut frame = self.frames[next_idx].lock();
            frame.fill(0);
            let hdr = XLogPageHeader::new(if continuation {
                XLP_FIRST_IS_SUBRECORD
            } else {
                0
            });
            frame[..XLOG_PAGE_HDR_SIZE].copy_from_slice(&hdr.encode());
        }
        self.xlblocks[next_idx].store(next_start + PAGE, Ordering::Release);
        ins.curr_idx = next_idx;
        ins.curr_lsn = next_start + XLOG_PAGE_HDR_SIZE as u64;
        Ok(())
    }

    fn open_segment(&self, w: &mut WriteState, segno: u64) -> Result<()> {
        if let Some((open_segno, file)) = &w.open {
            if *open_segno == segno {
                return Ok(());
            }
            // Leaving a segment: make sure it is durable first.
            file.sync_all()?;
        }
        let path = segment_path(&self.wal_dir, segno);
        let create = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| DbError::WalWrite(format!("open {}: {}", path.display(), e)))?;
        if create {
            file.set_len(XLOG_SEG_SIZE)
                .map_err(|e| DbError::WalWrite(format!("extend {}: {}", path.display(), e)))?;
            debug!(segment = %segment_file_name(segno), "wal segment created");
        }
        w.open = Some((segno, file));
        Ok(())
    }

    /// Write frames out through `target`, fsyncing at segment
    /// boundaries and, when `fsync_at_target`, before returning.
    fn write_upto(&self, target: Lsn, fsync_at_target: bool) -> Result<()> {
        let mut w = self.write.lock();
        let insert_upto = self.insert_upto.load(Ordering::Acquire);
        let target = target.min(insert_upto);

        loop {
            let written = self.written.load(Ordering::Acquire);
            if written >= target {
                break;
            }
            let idx = w.curr_out_idx;
            let end = self.xlblocks[idx].load(Ordering::Acquire);
            if end == 0 {
                break;
            }
            let start = end - PAGE;
            let valid_end = end.min(insert_upto);
            if valid_end <= written {
                break;
            }

            let segno = start / XLOG_SEG_SIZE;
            self.open_segment(&mut w, segno)?;
            let offset = start % XLOG_SEG_SIZE;

            let image = self.frames[idx].lock().clone();
            let file = &mut w.open.as_mut().expect("segment just opened").1;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| DbError::WalWrite(e.to_string()))?;
            file.write_all(&image)
                .map_err(|e| DbError::WalWrite(e.to_string()))?;

            self.written.store(valid_end, Ordering::Release);

            if offset + PAGE == XLOG_SEG_SIZE {
                file.sync_all().map_err(|e| DbError::WalWrite(e.to_string()))?;
                self.flushed
                    .store(self.written.load(Ordering::Acquire), Ordering::Release);
            }

            if valid_end == end {
                w.curr_out_idx = (idx + 1) % self.frames.len();
            } else {
                // Partially filled page: it will be rewritten as it
                // grows.
                break;
            }
        }

        if fsync_at_target {
            let written = self.written.load(Ordering::Acquire);
            if self.flushed.load(Ordering::Acquire) < written {
                if let Some((_, file)) = &w.open {
                    file.sync_all().map_err(|e| DbError::WalWrite(e.to_string()))?;
                }
                self.flushed.store(written, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Make the log durable at least through the page containing `lsn`.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        if self.flushed_lsn() >= page_end(lsn) {
            return Ok(());
        }
        let target = page_end(lsn).min(self.current_lsn());
        {
            let mut info = self.info.lock();
            info.flush_rqst = info.flush_rqst.max(target);
        }
        self.write_upto(target, true)
    }

    /// Flush everything inserted so far.
    pub fn flush_all(&self) -> Result<()> {
        let upto = self.current_lsn();
        if upto == 0 {
            return Ok(());
        }
        self.flush(upto - 1)
    }

    // ------------------------------------------------------------------
    // Record helpers
    // ------------------------------------------------------------------

    /// Commit record: inserted, then flushed durable before returning.
    pub fn log_commit(&self, xid: TransactionId, xact_prev: Lsn) -> Result<Lsn> {
        let stamp = chrono::Utc::now().timestamp().to_le_bytes();
        let lsn = self.insert(rmgr::XACT, xact_info::COMMIT, xid, xact_prev, &stamp, &[])?;
        self.flush(self.current_lsn().saturating_sub(1))?;
        Ok(lsn)
    }

    /// Abort record: inserted but not forced to disk; an abort that
    /// does not survive a crash is indistinguishable from the crash.
    pub fn log_abort(&self, xid: TransactionId, xact_prev: Lsn) -> Result<Lsn> {
        let stamp = chrono::Utc::now().timestamp().to_le_bytes();
        self.insert(rmgr::XACT, xact_info::ABORT, xid, xact_prev, &stamp, &[])
    }

    /// Checkpoint record (control-file bookkeeping only).
    pub fn log_checkpoint(&self, next_xid: TransactionId, next_oid: u32) -> Result<Lsn> {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&next_xid.to_le_bytes());
        body.extend_from_slice(&next_oid.to_le_bytes());
        let lsn = self.insert(rmgr::XLOG, xlog_info::CHECKPOINT, 0, 0, &body, &[])?;
        self.flush(self.current_lsn().saturating_sub(1))?;
        Ok(lsn)
    }
}

// ============================================================================
// Reading
// ============================================================================

/// A decoded record.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub lsn: Lsn,
    pub header: XLogRecordHeader,
    pub payload: Vec<u8>,
}

/// Sequential log reader over the segment files. Any malformed or
/// checksum-failing record terminates the scan: during recovery that
/// point is the end of the usable log.
pub struct XLogReader {
    wal_dir: PathBuf,
    lsn: Lsn,
}

impl XLogReader {
    pub fn new(wal_dir: impl Into<PathBuf>, start: Lsn) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            lsn: align8(start),
        }
    }

    pub fn position(&self) -> Lsn {
        self.lsn
    }

    fn read_page(&self, start: Lsn) -> Result<Option<Vec<u8>>> {
        use std::io::Read;
        let segno = start / XLOG_SEG_SIZE;
        let path = segment_path(&self.wal_dir, segno);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(start % XLOG_SEG_SIZE))?;
        let mut buf = vec![0u8; BLCKSZ];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Decode the next record, or `None` at end of log.
    pub fn next_record(&mut self) -> Result<Option<ReadRecord>> {
        let mut lsn = self.lsn;
        if lsn % PAGE == 0 {
            lsn += XLOG_PAGE_HDR_SIZE as u64;
        } else if lsn % PAGE < XLOG_PAGE_HDR_SIZE as u64 {
            lsn = page_start(lsn) + XLOG_PAGE_HDR_SIZE as u64;
        }
        if page_remaining(lsn) <= XLOG_REC_HDR_SIZE {
            lsn = page_end(lsn) + XLOG_PAGE_HDR_SIZE as u64;
        }

        let page = match self.read_page(page_start(lsn))? {
            Some(page) => page,
            None => return Ok(None),
        };
        if XLogPageHeader::decode(&page).is_err() {
            return Ok(None);
        }

        let mut off = (lsn % PAGE) as usize;
        let header = XLogRecordHeader::decode(&page[off..off + XLOG_REC_HDR_SIZE])?;
        if header.is_terminator() || header.len as usize > XLOG_SEG_SIZE as usize {
            return Ok(None);
        }
        let record_lsn = lsn;
        off += XLOG_REC_HDR_SIZE;
        lsn += XLOG_REC_HDR_SIZE as u64;

        let mut payload = Vec::with_capacity(header.len as usize);
        let mut remaining = header.len as usize;
        let take = remaining.min(BLCKSZ - off);
        payload.extend_from_slice(&page[off..off + take]);
        remaining -= take;
        lsn += take as u64;

        while remaining > 0 {
            let next_start = page_end(lsn - 1);
            let page = match self.read_page(next_start)? {
                Some(page) => page,
                None => return Ok(None),
            };
            let page_hdr = match XLogPageHeader::decode(&page) {
                Ok(hdr) => hdr,
                Err(_) => return Ok(None),
            };
            if page_hdr.info & XLP_FIRST_IS_SUBRECORD == 0 {
                return Ok(None);
            }
            let sub = XLogSubRecordHeader::decode(
                &page[XLOG_PAGE_HDR_SIZE..XLOG_PAGE_HDR_SIZE + XLOG_SUBREC_HDR_SIZE],
            )?;
            if sub.len as usize != remaining {
                return Ok(None);
            }
            let mut off = XLOG_PAGE_HDR_SIZE + XLOG_SUBREC_HDR_SIZE;
            let take = remaining.min(BLCKSZ - off);
            payload.extend_from_slice(&page[off..off + take]);
            off += take;
            remaining -= take;
            lsn = next_start + off as u64;
        }

        if payload_crc(&[&payload]) != header.crc {
            return Ok(None);
        }

        self.lsn = align8(lsn);
        Ok(Some(ReadRecord {
            lsn: record_lsn,
            header,
            payload,
        }))
    }
}
