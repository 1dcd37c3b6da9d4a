use thiserror::Error;

use crate::common::TransactionId;

/// How severe an error is, and what the recovery path owes it.
///
/// `Notice` and `Debug` are reporting levels only. `Error` aborts the
/// current transaction: the unwind releases spinlocks, any buffer I/O
/// latch, all non-session locks, and resets the transaction memory
/// context subtree. `Fatal` exits the worker; `Stop` takes the whole
/// cluster down (shared state can no longer be trusted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Notice,
    Debug,
    Error,
    Fatal,
    Stop,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("buffer error: {0}")]
    Buffer(String),

    #[error("invalid page: {0}")]
    InvalidPage(String),

    #[error("page checksum mismatch: {0}")]
    ChecksumFailure(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    #[error("control file error: {0}")]
    ControlFile(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("lock wait cancelled: transaction {0}")]
    LockCancelled(TransactionId),

    #[error("deadlock detected: transaction {0} would wait on itself")]
    Deadlock(TransactionId),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("memory context error: {0}")]
    Memory(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Severity class of this error, driving the recovery path.
    pub fn severity(&self) -> Severity {
        match self {
            // Shared state is unrecoverable: stop the cluster.
            DbError::Corruption(_) | DbError::ControlFile(_) | DbError::WalWrite(_) => {
                Severity::Stop
            }
            // Everything else aborts the transaction but keeps the
            // worker alive.
            _ => Severity::Error,
        }
    }

    /// True if the error should abort only the current transaction.
    pub fn is_transaction_abort(&self) -> bool {
        self.severity() == Severity::Error
    }

    /// True if retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DbError::Deadlock(_) | DbError::LockCancelled(_) | DbError::Cancelled
        )
    }
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
