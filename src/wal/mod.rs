// # Write-Ahead Log
//
// | Module | Responsibility |
// |--------|----------------|
// | [`record`] | On-disk page/record/subrecord formats |
// | [`log`] | Insert/flush pipeline, segment files, log reader |
// | [`control`] | The fsynced control file and cluster state |

pub mod control;
pub mod log;
pub mod record;

pub use control::{ControlFile, ControlFileData, DbState};
pub use log::{segment_file_name, ReadRecord, WalManager, XLogReader, XLOG_SEG_SIZE};
pub use record::{rmgr, xact_info, xlog_info, XLogRecordHeader};
