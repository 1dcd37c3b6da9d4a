// # System Assembly
//
// `SystemState` is the single top-level value owning every shared
// structure: registry, lock manager, buffer cache, storage switch,
// WAL, invalidation bus, commit log, and the id generators. It is
// built once by process startup (bootstrap or start-with-recovery) and
// shared under interior mutability from there on.
//
// `Session` is a worker thread's view of the system: its registry
// slot, its invalidation cursor, its transaction state, and the heap
// access paths that tie the subsystems together. Commit ordering
// follows the write-ahead rule: the commit record is flushed durable
// before the commit becomes visible to snapshots, and locks are only
// released after that.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::buffer::{BufferHandle, BufferManager, BufferManagerConfig};
use crate::common::{
    max_align, transaction_id_is_valid, BlockNumber, CommandId, DatabaseId, ItemPointer, Lsn,
    TransactionId, FIRST_COMMAND_ID, INVALID_TRANSACTION_ID,
};
use crate::delegate::DelegatedScan;
use crate::error::{DbError, Result};
use crate::lock::{LockManager, LockMode, LockTag, HEAP_LOCK_METHOD};
use crate::memory::MemoryContext;
use crate::mvcc::{
    satisfies_snapshot, satisfies_update, snapshot_data, tuple::HEAP_TUPLE_HEADER_SIZE,
    DirtySnapshot, HeapTupleHeader, Snapshot, TupleUpdateStatus, VisibilityContext,
};
use crate::page::{item_flags, set_page_checksums, PageInsertMode};
use crate::registry::{ThreadRegistry, ThreadSlot, ThreadType};
use crate::sinval::{ReaderId, SInvalBus, SharedInvalidMessage};
use crate::storage::{SmgrRelation, StorageManager};
use crate::transaction::{CommitLog, OidGenerator, XidGenerator};
use crate::wal::record::heap_info;
use crate::wal::{rmgr, xact_info, ControlFile, DbState, WalManager, XLogReader};
use crate::Config;

static GLOBAL_SYSTEM: OnceCell<Arc<SystemState>> = OnceCell::new();

/// Name of the pid file under the data directory.
pub const PID_FILE_NAME: &str = "basaltd.pid";

/// The process-wide shared state.
pub struct SystemState {
    pub config: Config,
    pub registry: ThreadRegistry,
    pub locks: LockManager,
    pub buffers: Arc<BufferManager>,
    pub smgr: Arc<StorageManager>,
    pub wal: Arc<WalManager>,
    pub bus: SInvalBus,
    pub clog: CommitLog,
    pub xids: XidGenerator,
    pub oids: OidGenerator,
    pub control: ControlFile,
}

impl SystemState {
    /// Initialize a brand-new cluster in `config.data_dir` and bring it
    /// into production.
    pub fn bootstrap(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let control = ControlFile::create(&config.data_dir)?;
        let wal = Arc::new(WalManager::bootstrap(
            config.data_dir.join("wal"),
            config.wal_buffers,
        )?);
        control.update(|d| {
            d.state = DbState::InProduction;
            d.end_of_log = wal.current_lsn();
        })?;
        info!(data_dir = %config.data_dir.display(), "cluster initialized");
        Self::assemble(config, control, wal, 1, 16384)
    }

    /// Open an existing cluster, running crash recovery if the control
    /// file says the last shutdown was not clean.
    pub fn start(config: Config) -> Result<Arc<Self>> {
        let control = ControlFile::load(&config.data_dir)?;
        let data = control.get();
        let wal_dir = config.data_dir.join("wal");

        let (wal, next_xid, next_oid) = match data.state {
            DbState::Shutdowned => {
                let wal = WalManager::open_at(&wal_dir, config.wal_buffers, data.end_of_log)?;
                (Arc::new(wal), data.next_xid, data.next_oid)
            }
            state => {
                warn!(?state, "unclean shutdown detected, entering recovery");
                control.update(|d| d.state = DbState::InRecovery)?;

                // Outcomes live only in memory, so the commit log must
                // be rebuilt from the log origin; the checkpoint LSN
                // bounds page redo, not outcome reconstruction.
                let clog = CommitLog::new();
                let (end, max_xid) = replay_outcomes(&wal_dir, 0, data.next_xid, &clog)?;

                let wal = Arc::new(WalManager::open_at(&wal_dir, config.wal_buffers, end)?);
                control.update(|d| {
                    d.state = DbState::InProduction;
                    d.end_of_log = end;
                    d.next_xid = max_xid;
                })?;
                info!(end_of_log = end, next_xid = max_xid, "recovery complete");
                return Self::assemble_with_clog(
                    config, control, wal, max_xid, data.next_oid, clog,
                );
            }
        };

        control.update(|d| d.state = DbState::InProduction)?;
        Self::assemble(config, control, wal, next_xid, next_oid)
    }

    fn assemble(
        config: Config,
        control: ControlFile,
        wal: Arc<WalManager>,
        next_xid: TransactionId,
        next_oid: u32,
    ) -> Result<Arc<Self>> {
        Self::assemble_with_clog(config, control, wal, next_xid, next_oid, CommitLog::new())
    }

    fn assemble_with_clog(
        config: Config,
        control: ControlFile,
        wal: Arc<WalManager>,
        next_xid: TransactionId,
        next_oid: u32,
        clog: CommitLog,
    ) -> Result<Arc<Self>> {
        set_page_checksums(config.page_checksums);
        let smgr = Arc::new(StorageManager::new(&config.data_dir));
        let buffers = BufferManager::new(
            BufferManagerConfig {
                num_buffers: config.buffer_pool_size,
            },
            smgr.clone(),
            wal.clone(),
        );
        Ok(Arc::new(Self {
            registry: ThreadRegistry::new(config.max_workers),
            locks: LockManager::new(),
            buffers,
            smgr,
            wal,
            bus: SInvalBus::new(config.max_workers),
            clog,
            xids: XidGenerator::new(next_xid),
            oids: OidGenerator::new(next_oid),
            control,
            config,
        }))
    }

    /// Install this system as the process global (used by the server
    /// binary); returns false if one was already installed.
    pub fn install_global(self: &Arc<Self>) -> bool {
        GLOBAL_SYSTEM.set(self.clone()).is_ok()
    }

    pub fn global() -> Option<Arc<SystemState>> {
        GLOBAL_SYSTEM.get().cloned()
    }

    /// Checkpoint: flush dirty buffers, log the checkpoint record, and
    /// rewrite the control file.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.buffers.flush_all()?;
        let lsn = self
            .wal
            .log_checkpoint(self.xids.read_next(), self.oids.read_next())?;
        let end = self.wal.current_lsn();
        let next_xid = self.xids.read_next();
        let next_oid = self.oids.read_next();
        self.control.update(|d| {
            d.checkpoint = lsn;
            d.end_of_log = end;
            d.next_xid = next_xid;
            d.next_oid = next_oid;
        })?;
        debug!(lsn, end, "checkpoint written");
        Ok(lsn)
    }

    /// Orderly shutdown: checkpoint and mark the cluster clean.
    pub fn shutdown(&self) -> Result<()> {
        self.control.update(|d| d.state = DbState::Shutdowning)?;
        self.checkpoint()?;
        self.wal.flush_all()?;
        let end = self.wal.current_lsn();
        self.control.update(|d| {
            d.state = DbState::Shutdowned;
            d.end_of_log = end;
        })?;
        info!("clean shutdown complete");
        Ok(())
    }

    /// Open a worker session.
    pub fn session(self: &Arc<Self>, database_id: DatabaseId) -> Result<Session> {
        let slot = self.registry.init_thread(ThreadType::Worker, database_id)?;
        let reader = self.bus.register_reader().ok_or_else(|| {
            DbError::ResourceExhausted("invalidation bus reader table full".into())
        })?;
        let top_context = MemoryContext::new_root(format!("session-{}", slot.id));
        Ok(Session {
            system: self.clone(),
            slot,
            reader,
            xid: INVALID_TRANSACTION_ID,
            cid: FIRST_COMMAND_ID,
            xact_prev: 0,
            top_context,
            txn_context: None,
            dirty: DirtySnapshot::default(),
        })
    }

    /// Stream every live tuple id of a relation from a helper thread,
    /// biasing the pages it ships so they stay cache-resident for the
    /// consumer.
    pub fn delegated_relation_scan(
        self: &Arc<Self>,
        rel: &Arc<SmgrRelation>,
        cancel: Arc<AtomicBool>,
    ) -> DelegatedScan {
        let system = self.clone();
        let rel = rel.clone();
        DelegatedScan::start(cancel, move |handle| {
            let slot = system.registry.init_thread(ThreadType::Helper, rel.rel.db)?;
            let result = (|| {
                let nblocks = system.smgr.nblocks(&rel)?;
                for block in 0..nblocks {
                    let buf = system.buffers.read_buffer(&rel, block)?;
                    let tids: Vec<ItemPointer> = {
                        let page = buf.page();
                        (1..=page.max_offset_number())
                            .filter(|&off| {
                                page.item_id(off).map(|id| id.is_used()).unwrap_or(false)
                            })
                            .map(|off| ItemPointer::new(block, off))
                            .collect()
                    };
                    system.buffers.set_bias(&buf.tag());
                    drop(buf);
                    if !handle.transfer_pointers(&tids)? {
                        break;
                    }
                }
                Ok(())
            })();
            system.registry.destroy_thread(&slot);
            result
        })
    }
}

// ============================================================================
// Pid file
// ============================================================================

/// Write the pid file: positive pid for multi-user, negative for a
/// standalone backend.
pub fn write_pid_file(data_dir: &Path, standalone: bool) -> Result<PathBuf> {
    let path = data_dir.join(PID_FILE_NAME);
    let pid = std::process::id() as i64;
    let value = if standalone { -pid } else { pid };
    std::fs::write(&path, format!("{}\n", value))?;
    Ok(path)
}

pub fn remove_pid_file(data_dir: &Path) {
    let _ = std::fs::remove_file(data_dir.join(PID_FILE_NAME));
}

/// Scan the log from `from`, recording transaction outcomes in the
/// commit log. Xids that left records but no commit are rolled back
/// (recorded aborted). Returns the end of the valid log and the next
/// xid to assign.
fn replay_outcomes(
    wal_dir: &Path,
    from: Lsn,
    base_next_xid: TransactionId,
    clog: &CommitLog,
) -> Result<(Lsn, TransactionId)> {
    use std::collections::HashSet;

    let mut reader = XLogReader::new(wal_dir, from);
    let mut seen: HashSet<TransactionId> = HashSet::new();
    let mut committed: HashSet<TransactionId> = HashSet::new();
    let mut max_xid = base_next_xid;

    while let Some(rec) = reader.next_record()? {
        let xid = rec.header.xid;
        if transaction_id_is_valid(xid) {
            seen.insert(xid);
            if xid >= max_xid {
                max_xid = xid + 1;
            }
        }
        if rec.header.rmid == rmgr::XACT {
            match rec.header.info & 0x7F {
                xact_info::COMMIT => {
                    committed.insert(xid);
                }
                _ => {}
            }
        }
    }

    for xid in seen {
        if committed.contains(&xid) {
            clog.begin(xid);
            clog.commit(xid, true);
        } else {
            // Not committed at crash time: the undo pass rolls it back.
            clog.begin(xid);
            clog.abort(xid);
        }
    }

    Ok((reader.position(), max_xid))
}

// ============================================================================
// Sessions
// ============================================================================

/// A worker thread's handle on the system.
pub struct Session {
    system: Arc<SystemState>,
    pub slot: Arc<ThreadSlot>,
    reader: ReaderId,
    xid: TransactionId,
    cid: CommandId,
    xact_prev: Lsn,
    top_context: Arc<MemoryContext>,
    txn_context: Option<Arc<MemoryContext>>,
    /// Side channel filled by dirty-read visibility checks.
    pub dirty: DirtySnapshot,
}

impl Session {
    pub fn system(&self) -> &Arc<SystemState> {
        &self.system
    }

    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    pub fn is_active(&self) -> bool {
        transaction_id_is_valid(self.xid)
    }

    pub fn transaction_context(&self) -> Option<&Arc<MemoryContext>> {
        self.txn_context.as_ref()
    }

    fn require_xid(&self) -> Result<TransactionId> {
        if self.is_active() {
            Ok(self.xid)
        } else {
            Err(DbError::Transaction("no transaction in progress".into()))
        }
    }

    /// Begin a transaction: assign a xid, record it in the commit log,
    /// and advertise it in the registry.
    pub fn begin(&mut self) -> Result<TransactionId> {
        if self.is_active() {
            return Err(DbError::Transaction(
                "transaction already in progress".into(),
            ));
        }
        let xid = self.system.xids.assign(&self.system.registry.spins, &self.slot);
        self.system.clog.begin(xid);
        self.system.registry.transaction_start(&self.slot, xid);
        self.xid = xid;
        self.cid = FIRST_COMMAND_ID;
        self.xact_prev = 0;
        self.txn_context = Some(self.top_context.child("transaction"));
        debug!(xid, slot = self.slot.id.index(), "transaction started");
        Ok(xid)
    }

    /// Commit: flush the commit record, flip the registry state, mark
    /// the outcome durable, then release locks and reset.
    pub fn commit(&mut self) -> Result<()> {
        let xid = self.require_xid()?;

        let lsn = self.system.wal.log_commit(xid, self.xact_prev)?;
        self.system.registry.transaction_end(&self.slot);
        self.system.clog.commit(xid, true);

        self.system.locks.release_all(&self.slot, Some(xid));
        self.system.registry.transaction_reset(&self.slot);
        self.finish_transaction();
        debug!(xid, lsn, "transaction committed");
        Ok(())
    }

    /// Abort the current transaction.
    pub fn abort(&mut self) -> Result<()> {
        let xid = self.require_xid()?;
        let _ = self.system.wal.log_abort(xid, self.xact_prev);
        self.system.clog.abort(xid);
        self.system.locks.release_all(&self.slot, Some(xid));
        self.system.registry.transaction_reset(&self.slot);
        self.finish_transaction();
        debug!(xid, "transaction aborted");
        Ok(())
    }

    /// The ERROR unwind: release spinlocks, abandon lock waits, roll
    /// back the transaction, reset the context subtree, and clear the
    /// cancel flag — in that order.
    pub fn recover_from_error(&mut self) {
        self.system.registry.spins.release_all_held(&self.slot);
        // Buffer I/O latches release through their completion paths;
        // any lock wait we were parked in has already withdrawn itself.
        if self.is_active() {
            let _ = self.abort();
        }
        self.slot.clear_cancel();
    }

    fn finish_transaction(&mut self) {
        self.xid = INVALID_TRANSACTION_ID;
        self.cid = FIRST_COMMAND_ID;
        self.xact_prev = 0;
        if let Some(ctx) = self.txn_context.take() {
            ctx.reset();
            ctx.delete();
        }
    }

    /// Advance to the next command within the transaction.
    pub fn next_command(&mut self) -> CommandId {
        self.cid += 1;
        self.cid
    }

    pub fn command_id(&self) -> CommandId {
        self.cid
    }

    /// Take a fresh snapshot.
    pub fn snapshot(&self) -> Snapshot {
        snapshot_data(
            &self.system.registry,
            &self.system.bus,
            &self.system.xids,
            &self.slot,
        )
    }

    /// Visibility context for predicate evaluation. The scan command
    /// id is the session's current command.
    pub fn visibility(&self) -> VisibilityContext<'_> {
        VisibilityContext::new(self.xid, self.cid, &self.system.clog)
    }

    /// Insert a WAL record chained to this transaction.
    pub fn log(&mut self, rmid: u8, info: u8, hdr: &[u8], body: &[u8]) -> Result<Lsn> {
        let xid = self.require_xid()?;
        let lsn = self
            .system
            .wal
            .insert(rmid, info, xid, self.xact_prev, hdr, body)?;
        self.xact_prev = lsn;
        Ok(lsn)
    }

    // ------------------------------------------------------------------
    // Invalidation bus
    // ------------------------------------------------------------------

    /// Broadcast a catalog invalidation to every worker.
    pub fn publish_invalidation(&self, msg: SharedInvalidMessage) {
        self.system.bus.publish(msg);
    }

    /// Drain pending invalidations before catalog reads.
    pub fn accept_invalidations(
        &self,
        apply: impl FnMut(SharedInvalidMessage),
    ) -> Option<crate::sinval::InvalRead> {
        self.system.bus.consume_all(self.reader, apply)
    }

    // ------------------------------------------------------------------
    // Heap access paths
    // ------------------------------------------------------------------

    /// Insert a row, returning its tuple id. Takes RowExclusive on the
    /// relation, places the tuple on the last page (extending the
    /// relation if needed), and logs the insert.
    pub fn heap_insert(&mut self, rel: &Arc<SmgrRelation>, data: &[u8]) -> Result<ItemPointer> {
        let xid = self.require_xid()?;
        self.system.locks.acquire(
            &self.slot,
            LockTag::relation(HEAP_LOCK_METHOD, rel.rel.db, rel.rel.rel),
            xid,
            LockMode::RowExclusive,
            false,
        )?;

        let header = HeapTupleHeader::new(xid, self.cid);
        let mut item = Vec::with_capacity(HEAP_TUPLE_HEADER_SIZE + data.len());
        item.extend_from_slice(&header.encode());
        item.extend_from_slice(data);

        let (buf, tid) = self.place_tuple(rel, &item)?;

        // The latest version points at itself.
        {
            let mut page = buf.page_mut();
            let bytes = page.item_mut(tid.offset)?;
            let mut placed =
                HeapTupleHeader::decode(bytes).ok_or_else(|| DbError::Corruption(
                    "freshly inserted tuple header unreadable".into(),
                ))?;
            placed.t_ctid = tid;
            bytes[..HEAP_TUPLE_HEADER_SIZE].copy_from_slice(&placed.encode());
        }

        let mut payload = Vec::with_capacity(6 + data.len());
        payload.extend_from_slice(&tid.block.to_le_bytes());
        payload.extend_from_slice(&tid.offset.to_le_bytes());
        payload.extend_from_slice(data);
        let lsn = self.log(rmgr::HEAP, heap_info::INSERT, &payload, &[])?;
        buf.mark_dirty(lsn);
        Ok(tid)
    }

    /// Find room for `item`, extending the relation when the last page
    /// is full. Returns the pinned buffer and the assigned tid.
    fn place_tuple(
        &mut self,
        rel: &Arc<SmgrRelation>,
        item: &[u8],
    ) -> Result<(BufferHandle, ItemPointer)> {
        let nblocks = self.system.smgr.nblocks(rel)?;
        if nblocks > 0 {
            let block = nblocks - 1;
            let buf = self.system.buffers.read_buffer(rel, block)?;
            let placed = {
                let mut page = buf.page_mut();
                if page.free_space() >= max_align(item.len()) {
                    page.add_item(item, 0, PageInsertMode::Shuffle, item_flags::USED)?
                } else {
                    None
                }
            };
            if let Some(offset) = placed {
                return Ok((buf, ItemPointer::new(block, offset)));
            }
        }

        let buf = self.system.buffers.allocate_more_space(rel, 0)?;
        let block: BlockNumber = buf.tag().block;
        let offset = {
            let mut page = buf.page_mut();
            page.add_item(item, 0, PageInsertMode::Shuffle, item_flags::USED)?
                .ok_or_else(|| {
                    DbError::ResourceExhausted(format!("tuple of {} bytes never fits", item.len()))
                })?
        };
        Ok((buf, ItemPointer::new(block, offset)))
    }

    /// Fetch a row version if it is visible to `snapshot`. Hint bits
    /// resolved during the check are written back to the page.
    pub fn heap_fetch(
        &self,
        rel: &Arc<SmgrRelation>,
        tid: ItemPointer,
        snapshot: &Snapshot,
    ) -> Result<Option<Vec<u8>>> {
        let buf = self.system.buffers.read_buffer(rel, tid.block)?;
        let (visible, data, new_mask) = {
            let page = buf.page();
            let bytes = page.item(tid.offset)?;
            let header = HeapTupleHeader::decode(bytes)
                .ok_or_else(|| DbError::Corruption(format!("tuple {} unreadable", tid)))?;
            let before = header.infomask();
            let ctx = self.visibility();
            let visible = satisfies_snapshot(&ctx, &header, snapshot);
            let after = header.infomask();
            (
                visible,
                visible.then(|| bytes[HEAP_TUPLE_HEADER_SIZE..].to_vec()),
                (after != before).then_some(after),
            )
        };

        // Persist any hint bits the check resolved.
        if let Some(mask) = new_mask {
            let mut page = buf.page_mut();
            let bytes = page.item_mut(tid.offset)?;
            bytes[38..42].copy_from_slice(&mask.to_le_bytes());
            drop(page);
            buf.mark_dirty(0);
        }

        Ok(if visible { data } else { None })
    }

    /// Dirty-read fetch: trusts in-progress insertions and deletions,
    /// publishing the responsible xids (and the forward tid of an
    /// already-updated row) to the session's dirty-snapshot side
    /// channel.
    pub fn heap_fetch_dirty(
        &mut self,
        rel: &Arc<SmgrRelation>,
        tid: ItemPointer,
    ) -> Result<Option<Vec<u8>>> {
        let buf = self.system.buffers.read_buffer(rel, tid.block)?;
        let page = buf.page();
        let bytes = page.item(tid.offset)?;
        let header = HeapTupleHeader::decode(bytes)
            .ok_or_else(|| DbError::Corruption(format!("tuple {} unreadable", tid)))?;
        let ctx = VisibilityContext::new(self.xid, self.cid, &self.system.clog);
        let visible = crate::mvcc::satisfies_dirty(&ctx, &header, &mut self.dirty);
        Ok(visible.then(|| bytes[HEAP_TUPLE_HEADER_SIZE..].to_vec()))
    }

    /// Delete a row version. Returns the conflict-check outcome; the
    /// deletion is applied only on `MayBeUpdated`.
    pub fn heap_delete(
        &mut self,
        rel: &Arc<SmgrRelation>,
        tid: ItemPointer,
    ) -> Result<TupleUpdateStatus> {
        let xid = self.require_xid()?;
        self.system.locks.acquire(
            &self.slot,
            LockTag::relation(HEAP_LOCK_METHOD, rel.rel.db, rel.rel.rel),
            xid,
            LockMode::RowExclusive,
            false,
        )?;

        let buf = self.system.buffers.read_buffer(rel, tid.block)?;
        let status = {
            let mut page = buf.page_mut();
            let bytes = page.item_mut(tid.offset)?;
            let mut header = HeapTupleHeader::decode(bytes)
                .ok_or_else(|| DbError::Corruption(format!("tuple {} unreadable", tid)))?;
            let ctx = self.visibility();
            let status = satisfies_update(&ctx, &header);
            if status == TupleUpdateStatus::MayBeUpdated {
                header.set_xmax(xid, self.cid);
                bytes[..HEAP_TUPLE_HEADER_SIZE].copy_from_slice(&header.encode());
            } else {
                // Keep any hints the check resolved.
                bytes[38..42].copy_from_slice(&header.infomask().to_le_bytes());
            }
            status
        };

        if status == TupleUpdateStatus::MayBeUpdated {
            let mut payload = Vec::with_capacity(6);
            payload.extend_from_slice(&tid.block.to_le_bytes());
            payload.extend_from_slice(&tid.offset.to_le_bytes());
            let lsn = self.log(rmgr::HEAP, heap_info::DELETE, &payload, &[])?;
            buf.mark_dirty(lsn);
        }
        Ok(status)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.abort();
        }
        self.system.locks.release_all(&self.slot, None);
        self.system.bus.unregister_reader(self.reader);
        self.system.registry.destroy_thread(&self.slot);
        self.top_context.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageKind;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            buffer_pool_size: 32,
            wal_buffers: 4,
            max_workers: 8,
            page_checksums: true,
            standalone: true,
        }
    }

    fn file_rel(system: &Arc<SystemState>, relid: u32) -> Arc<SmgrRelation> {
        let rel = Arc::new(SmgrRelation::new(
            StorageKind::File,
            crate::common::RelFileId::new(1, relid),
            format!("rel{}", relid),
            "db",
        ));
        system.smgr.create(&rel).unwrap();
        rel
    }

    #[test]
    fn test_insert_commit_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 100);

        let mut session = system.session(1).unwrap();
        session.begin().unwrap();
        let tid = session.heap_insert(&rel, b"hello row").unwrap();
        session.commit().unwrap();

        let mut reader = system.session(1).unwrap();
        reader.begin().unwrap();
        let snap = reader.snapshot();
        let fetched = reader.heap_fetch(&rel, tid, &snap).unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"hello row"[..]));
        reader.commit().unwrap();
    }

    #[test]
    fn test_uncommitted_insert_invisible_to_others() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 101);

        let mut writer = system.session(1).unwrap();
        writer.begin().unwrap();
        let tid = writer.heap_insert(&rel, b"pending").unwrap();

        let mut other = system.session(1).unwrap();
        other.begin().unwrap();
        let snap = other.snapshot();
        assert!(other.heap_fetch(&rel, tid, &snap).unwrap().is_none());
        other.commit().unwrap();

        writer.commit().unwrap();

        // A snapshot taken after the commit sees the row.
        let mut late = system.session(1).unwrap();
        late.begin().unwrap();
        let snap = late.snapshot();
        assert!(late.heap_fetch(&rel, tid, &snap).unwrap().is_some());
        late.commit().unwrap();
    }

    #[test]
    fn test_aborted_insert_stays_invisible() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 102);

        let mut writer = system.session(1).unwrap();
        writer.begin().unwrap();
        let tid = writer.heap_insert(&rel, b"doomed").unwrap();
        writer.abort().unwrap();

        let mut reader = system.session(1).unwrap();
        reader.begin().unwrap();
        let snap = reader.snapshot();
        assert!(reader.heap_fetch(&rel, tid, &snap).unwrap().is_none());
        reader.commit().unwrap();
    }

    #[test]
    fn test_dirty_fetch_sees_in_progress_insert() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 106);

        let mut writer = system.session(1).unwrap();
        writer.begin().unwrap();
        let tid = writer.heap_insert(&rel, b"in-flight").unwrap();

        let mut other = system.session(1).unwrap();
        other.begin().unwrap();
        // A plain snapshot read misses it; the dirty read trusts the
        // running inserter and publishes its xid.
        let snap = other.snapshot();
        assert!(other.heap_fetch(&rel, tid, &snap).unwrap().is_none());
        let data = other.heap_fetch_dirty(&rel, tid).unwrap();
        assert_eq!(data.as_deref(), Some(&b"in-flight"[..]));
        assert_eq!(other.dirty.xmin, writer.xid());
        other.commit().unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn test_delete_hides_row_from_later_snapshots() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 103);

        let mut session = system.session(1).unwrap();
        session.begin().unwrap();
        let tid = session.heap_insert(&rel, b"short-lived").unwrap();
        session.commit().unwrap();

        session.begin().unwrap();
        let status = session.heap_delete(&rel, tid).unwrap();
        assert_eq!(status, TupleUpdateStatus::MayBeUpdated);
        session.commit().unwrap();

        session.begin().unwrap();
        let snap = session.snapshot();
        assert!(session.heap_fetch(&rel, tid, &snap).unwrap().is_none());
        session.commit().unwrap();
    }

    #[test]
    fn test_invalidations_flow_between_sessions() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();

        let publisher = system.session(1).unwrap();
        let consumer = system.session(1).unwrap();

        publisher.publish_invalidation(SharedInvalidMessage {
            cache_id: 2,
            hash_index: 9,
            tid: ItemPointer::new(1, 1),
        });

        let mut seen = Vec::new();
        let reset = consumer.accept_invalidations(|msg| seen.push(msg.cache_id));
        assert!(reset.is_none());
        assert_eq!(seen, vec![2]);

        // Publishers do not consume their own messages twice: the
        // publisher's cursor still drains the message once.
        let mut own = Vec::new();
        publisher.accept_invalidations(|msg| own.push(msg.cache_id));
        assert_eq!(own, vec![2]);
    }

    #[test]
    fn test_crash_recovery_restores_outcomes() {
        let dir = tempdir().unwrap();
        let tid;
        let rel_id = 104;
        {
            let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
            let rel = file_rel(&system, rel_id);
            let mut session = system.session(1).unwrap();
            session.begin().unwrap();
            tid = session.heap_insert(&rel, b"survivor").unwrap();
            session.commit().unwrap();
            drop(session);
            // Push pages to disk, then "crash": no clean shutdown, the
            // control file still says InProduction.
            system.checkpoint().unwrap();
        }

        let system = SystemState::start(test_config(dir.path())).unwrap();
        assert_eq!(system.control.get().state, DbState::InProduction);

        let rel = Arc::new(SmgrRelation::new(
            StorageKind::File,
            crate::common::RelFileId::new(1, rel_id),
            format!("rel{}", rel_id),
            "db",
        ));
        let mut session = system.session(1).unwrap();
        session.begin().unwrap();
        let snap = session.snapshot();
        let fetched = session.heap_fetch(&rel, tid, &snap).unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"survivor"[..]));
        session.commit().unwrap();
    }

    #[test]
    fn test_clean_shutdown_and_restart() {
        let dir = tempdir().unwrap();
        {
            let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
            system.shutdown().unwrap();
            assert_eq!(system.control.get().state, DbState::Shutdowned);
        }
        let system = SystemState::start(test_config(dir.path())).unwrap();
        assert_eq!(system.control.get().state, DbState::InProduction);
    }

    #[test]
    fn test_recover_from_error_releases_everything() {
        let dir = tempdir().unwrap();
        let system = SystemState::bootstrap(test_config(dir.path())).unwrap();
        let rel = file_rel(&system, 105);

        let mut session = system.session(1).unwrap();
        session.begin().unwrap();
        session.heap_insert(&rel, b"x").unwrap();
        session.slot.request_cancel();

        session.recover_from_error();
        assert!(!session.is_active());
        assert!(!session.slot.is_cancelled());
        // The relation lock is gone: another session gets AccessExclusive.
        let mut other = system.session(1).unwrap();
        other.begin().unwrap();
        let tag = LockTag::relation(HEAP_LOCK_METHOD, rel.rel.db, rel.rel.rel);
        system
            .locks
            .acquire(&other.slot, tag, other.xid(), LockMode::AccessExclusive, true)
            .unwrap();
        other.commit().unwrap();
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = write_pid_file(dir.path(), false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let pid: i64 = content.trim().parse().unwrap();
        assert_eq!(pid, std::process::id() as i64);

        let path = write_pid_file(dir.path(), true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let pid: i64 = content.trim().parse().unwrap();
        assert_eq!(pid, -(std::process::id() as i64));

        remove_pid_file(dir.path());
        assert!(!dir.path().join(PID_FILE_NAME).exists());
    }
}
