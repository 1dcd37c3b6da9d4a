// The control file: one fsynced page recording where the log is, what
// state the cluster is in, and the compile-time geometry this data
// directory was built with. A geometry or catalog-version mismatch at
// startup is fatal; running against pages of the wrong size corrupts
// everything it touches.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{Lsn, BLCKSZ, CATALOG_VERSION_NO, RELSEG_SIZE};
use crate::error::{DbError, Result};

pub const CONTROL_FILE_NAME: &str = "basalt.control";

/// Cluster lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbState {
    Startup,
    Shutdowned,
    Shutdowning,
    InRecovery,
    InProduction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFileData {
    /// Current log file id (high half of the segment address).
    pub log_id: u32,
    /// Current segment within the log file (1-based on disk).
    pub log_seg: u32,
    /// Last checkpoint record position.
    pub checkpoint: Lsn,
    /// End of the known-valid log at last checkpoint.
    pub end_of_log: Lsn,
    /// Unix timestamp of last modification.
    pub time: i64,
    pub state: DbState,
    /// Next transaction id at last checkpoint.
    pub next_xid: u64,
    /// Next object id at last checkpoint.
    pub next_oid: u32,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub catalog_version_no: u32,
}

impl ControlFileData {
    pub fn bootstrap() -> Self {
        Self {
            log_id: 0,
            log_seg: 1,
            checkpoint: 0,
            end_of_log: 0,
            time: chrono::Utc::now().timestamp(),
            state: DbState::Startup,
            next_xid: 1,
            next_oid: 16384,
            blcksz: BLCKSZ as u32,
            relseg_size: RELSEG_SIZE,
            catalog_version_no: CATALOG_VERSION_NO,
        }
    }
}

/// Handle to the on-disk control file.
pub struct ControlFile {
    path: PathBuf,
    data: Mutex<ControlFileData>,
}

impl ControlFile {
    fn path_for(data_dir: &Path) -> PathBuf {
        data_dir.join("global").join(CONTROL_FILE_NAME)
    }

    /// Create a fresh control file for a new cluster.
    pub fn create(data_dir: &Path) -> Result<Self> {
        let path = Self::path_for(data_dir);
        fs::create_dir_all(path.parent().expect("control file has a parent"))?;
        let control = Self {
            path,
            data: Mutex::new(ControlFileData::bootstrap()),
        };
        control.write_out()?;
        info!(path = %control.path.display(), "control file created");
        Ok(control)
    }

    /// Open and validate an existing control file.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path_for(data_dir);
        let mut file = File::open(&path)
            .map_err(|e| DbError::ControlFile(format!("open {}: {}", path.display(), e)))?;
        let mut buf = vec![0u8; BLCKSZ];
        file.read_exact(&mut buf)
            .map_err(|e| DbError::ControlFile(format!("read {}: {}", path.display(), e)))?;

        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if len == 0 || 8 + len > BLCKSZ {
            return Err(DbError::ControlFile("corrupt length field".into()));
        }
        let body = &buf[8..8 + len];
        if crc32fast::hash(body) != stored_crc {
            return Err(DbError::ControlFile("checksum mismatch".into()));
        }

        let (data, _): (ControlFileData, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;

        if data.blcksz != BLCKSZ as u32 {
            return Err(DbError::ControlFile(format!(
                "database was initialized with block size {}, server compiled with {}",
                data.blcksz, BLCKSZ
            )));
        }
        if data.relseg_size != RELSEG_SIZE {
            return Err(DbError::ControlFile(format!(
                "database was initialized with segment size {}, server compiled with {}",
                data.relseg_size, RELSEG_SIZE
            )));
        }
        if data.catalog_version_no != CATALOG_VERSION_NO {
            return Err(DbError::ControlFile(format!(
                "catalog version mismatch: file {}, server {}",
                data.catalog_version_no, CATALOG_VERSION_NO
            )));
        }

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn get(&self) -> ControlFileData {
        self.data.lock().clone()
    }

    /// Mutate the control data, stamp the modification time, rewrite
    /// the page, and fsync.
    pub fn update(&self, mutate: impl FnOnce(&mut ControlFileData)) -> Result<()> {
        let mut data = self.data.lock();
        mutate(&mut data);
        data.time = chrono::Utc::now().timestamp();
        self.write_locked(&data)
    }

    fn write_out(&self) -> Result<()> {
        let data = self.data.lock();
        self.write_locked(&data)
    }

    fn write_locked(&self, data: &ControlFileData) -> Result<()> {
        let body = bincode::serde::encode_to_vec(data, bincode::config::standard())?;
        if 8 + body.len() > BLCKSZ {
            return Err(DbError::ControlFile("control data exceeds one page".into()));
        }
        let mut buf = vec![0u8; BLCKSZ];
        buf[0..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf[8..8 + body.len()].copy_from_slice(&body);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_load_round_trip() {
        let dir = tempdir().unwrap();
        let control = ControlFile::create(dir.path()).unwrap();
        control
            .update(|d| {
                d.state = DbState::InProduction;
                d.checkpoint = 4096;
                d.end_of_log = 8192;
            })
            .unwrap();

        let reloaded = ControlFile::load(dir.path()).unwrap();
        let data = reloaded.get();
        assert_eq!(data.state, DbState::InProduction);
        assert_eq!(data.checkpoint, 4096);
        assert_eq!(data.end_of_log, 8192);
        assert_eq!(data.blcksz, BLCKSZ as u32);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        ControlFile::create(dir.path()).unwrap();
        let path = dir.path().join("global").join(CONTROL_FILE_NAME);
        let mut bytes = fs::read(&path).unwrap();
        bytes[12] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(ControlFile::load(dir.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(ControlFile::load(dir.path()).is_err());
    }
}
