// File-backed storage engine. Each relation is one or more segment
// files of RELSEG_SIZE pages under `<data_dir>/base/<db>/<rel>`; the
// first segment carries the bare relation id, later segments append
// `.<segno>`. Open file descriptors are cached per (relation, segment).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::common::{BlockNumber, RelFileId, BLCKSZ, RELSEG_SIZE};
use crate::error::{DbError, Result};
use crate::page::Page;
use crate::storage::{Smgr, SmgrRelation};

pub struct FileSmgr {
    data_dir: PathBuf,
    open_files: DashMap<(RelFileId, u32), Arc<Mutex<File>>>,
}

impl FileSmgr {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            open_files: DashMap::new(),
        }
    }

    fn db_dir(&self, rel: &SmgrRelation) -> PathBuf {
        self.data_dir.join("base").join(rel.rel.db.to_string())
    }

    fn segment_path(&self, rel: &SmgrRelation, segno: u32) -> PathBuf {
        let base = self.db_dir(rel).join(rel.rel.rel.to_string());
        if segno == 0 {
            base
        } else {
            base.with_extension(segno.to_string())
        }
    }

    fn open_segment(&self, rel: &SmgrRelation, segno: u32, create: bool) -> Result<Arc<Mutex<File>>> {
        if let Some(handle) = self.open_files.get(&(rel.rel, segno)) {
            return Ok(handle.clone());
        }
        let path = self.segment_path(rel, segno);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|e| {
                DbError::Storage(format!("open segment {}: {}", path.display(), e))
            })?;
        let handle = Arc::new(Mutex::new(file));
        self.open_files.insert((rel.rel, segno), handle.clone());
        Ok(handle)
    }

    fn segment_blocks(path: &Path) -> Result<BlockNumber> {
        let len = fs::metadata(path)?.len();
        Ok((len / BLCKSZ as u64) as BlockNumber)
    }

    fn locate(block: BlockNumber) -> (u32, u64) {
        let segno = block / RELSEG_SIZE;
        let offset = (block % RELSEG_SIZE) as u64 * BLCKSZ as u64;
        (segno, offset)
    }

    fn write_at(&self, rel: &SmgrRelation, block: BlockNumber, page: &Page, sync: bool) -> Result<()> {
        let (segno, offset) = Self::locate(block);
        let handle = self.open_segment(rel, segno, true)?;
        let mut file = handle.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.as_bytes())?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Smgr for FileSmgr {
    fn create(&self, rel: &SmgrRelation) -> Result<()> {
        fs::create_dir_all(self.db_dir(rel))?;
        self.open_segment(rel, 0, true)?;
        debug!(rel = %rel.rel, "relation file created");
        Ok(())
    }

    fn unlink(&self, rel: &SmgrRelation) -> Result<()> {
        let mut segno = 0;
        loop {
            let path = self.segment_path(rel, segno);
            if !path.exists() {
                break;
            }
            self.open_files.remove(&(rel.rel, segno));
            fs::remove_file(&path)?;
            segno += 1;
        }
        Ok(())
    }

    fn extend(&self, rel: &SmgrRelation, page: &Page) -> Result<BlockNumber> {
        let block = self.nblocks(rel)?;
        self.write_at(rel, block, page, false)?;
        Ok(block)
    }

    fn read(&self, rel: &SmgrRelation, block: BlockNumber) -> Result<Page> {
        let nblocks = self.nblocks(rel)?;
        if block == nblocks {
            // Extension racing a reader: hand back a fresh page.
            return Ok(Page::new());
        }
        if block > nblocks {
            return Err(DbError::Storage(format!(
                "read of block {} past end of {} ({} blocks)",
                block, rel.rel, nblocks
            )));
        }
        let (segno, offset) = Self::locate(block);
        let handle = self.open_segment(rel, segno, false)?;
        let mut file = handle.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; BLCKSZ];
        file.read_exact(&mut buf)?;
        Page::from_bytes(&buf)
    }

    fn write(&self, rel: &SmgrRelation, block: BlockNumber, page: &Page) -> Result<()> {
        self.write_at(rel, block, page, false)
    }

    fn flush(&self, rel: &SmgrRelation, block: BlockNumber, page: &Page) -> Result<()> {
        self.write_at(rel, block, page, true)
    }

    fn nblocks(&self, rel: &SmgrRelation) -> Result<BlockNumber> {
        let mut total: BlockNumber = 0;
        let mut segno = 0;
        loop {
            let path = self.segment_path(rel, segno);
            if !path.exists() {
                break;
            }
            total += Self::segment_blocks(&path)?;
            segno += 1;
        }
        Ok(total)
    }

    fn truncate(&self, rel: &SmgrRelation, nblocks: BlockNumber) -> Result<BlockNumber> {
        let keep_segs = if nblocks == 0 { 1 } else { nblocks.div_ceil(RELSEG_SIZE) };
        // Drop whole segments above the cut.
        let mut segno = keep_segs;
        loop {
            let path = self.segment_path(rel, segno);
            if !path.exists() {
                break;
            }
            self.open_files.remove(&(rel.rel, segno));
            fs::remove_file(path)?;
            segno += 1;
        }
        // Shrink the last surviving segment.
        let last = keep_segs - 1;
        let within = nblocks - last * RELSEG_SIZE;
        let handle = self.open_segment(rel, last, true)?;
        handle.lock().set_len(within as u64 * BLCKSZ as u64)?;
        Ok(nblocks)
    }

    fn sync(&self, rel: &SmgrRelation) -> Result<()> {
        let mut segno = 0;
        loop {
            let path = self.segment_path(rel, segno);
            if !path.exists() {
                break;
            }
            let handle = self.open_segment(rel, segno, false)?;
            handle.lock().sync_all()?;
            segno += 1;
        }
        Ok(())
    }

    fn close(&self, rel: &SmgrRelation) -> Result<()> {
        self.open_files.retain(|(id, _), _| *id != rel.rel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RelFileId;
    use crate::page::{item_flags, PageInsertMode};
    use crate::storage::StorageKind;
    use tempfile::tempdir;

    fn rel(relid: u32) -> SmgrRelation {
        SmgrRelation::new(StorageKind::File, RelFileId::new(1, relid), "t", "db")
    }

    fn payload_page(tag: u8) -> Page {
        let mut page = Page::new();
        page.init(0);
        page.add_item(&[tag; 16], 0, PageInsertMode::Shuffle, item_flags::USED)
            .unwrap();
        page
    }

    #[test]
    fn test_extend_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let smgr = FileSmgr::new(dir.path());
        let rel = rel(500);
        smgr.create(&rel).unwrap();

        let b0 = smgr.extend(&rel, &payload_page(1)).unwrap();
        let b1 = smgr.extend(&rel, &payload_page(2)).unwrap();
        rel.invalidate_nblocks();
        assert_eq!((b0, b1), (0, 1));
        assert_eq!(smgr.nblocks(&rel).unwrap(), 2);

        assert_eq!(smgr.read(&rel, 1).unwrap().item(1).unwrap(), &[2u8; 16][..]);

        smgr.write(&rel, 0, &payload_page(9)).unwrap();
        assert_eq!(smgr.read(&rel, 0).unwrap().item(1).unwrap(), &[9u8; 16][..]);
    }

    #[test]
    fn test_truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let smgr = FileSmgr::new(dir.path());
        let rel = rel(501);
        smgr.create(&rel).unwrap();
        for i in 0..4u8 {
            smgr.extend(&rel, &payload_page(i)).unwrap();
            rel.invalidate_nblocks();
        }
        assert_eq!(smgr.truncate(&rel, 2).unwrap(), 2);
        rel.invalidate_nblocks();
        assert_eq!(smgr.nblocks(&rel).unwrap(), 2);
    }

    #[test]
    fn test_unlink_removes_files() {
        let dir = tempdir().unwrap();
        let smgr = FileSmgr::new(dir.path());
        let rel = rel(502);
        smgr.create(&rel).unwrap();
        smgr.extend(&rel, &payload_page(1)).unwrap();
        smgr.unlink(&rel).unwrap();
        assert!(!dir
            .path()
            .join("base")
            .join("1")
            .join("502")
            .exists());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let rel_id = 503;
        {
            let smgr = FileSmgr::new(dir.path());
            let rel = rel(rel_id);
            smgr.create(&rel).unwrap();
            smgr.extend(&rel, &payload_page(7)).unwrap();
            smgr.sync(&rel).unwrap();
        }
        let smgr = FileSmgr::new(dir.path());
        let rel = rel(rel_id);
        assert_eq!(smgr.nblocks(&rel).unwrap(), 1);
        assert_eq!(smgr.read(&rel, 0).unwrap().item(1).unwrap(), &[7u8; 16][..]);
    }
}
