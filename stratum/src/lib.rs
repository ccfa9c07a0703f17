//! Stratum Transactional Storage Core
//!
//! A multi-version concurrency control (MVCC) storage engine core implemented
//! in Rust. Stores versioned tuples in packed, cache-friendly blocks, lets
//! concurrent transactions read consistent snapshots, records changes durably
//! through a redo log, and reclaims obsolete versions without blocking
//! readers.

pub mod data;
pub mod engine;
pub mod storage;
pub mod txn;

// Re-export main types
pub use data::{DataType, Value};
pub use engine::{EngineConfig, StorageEngine};
pub use storage::{ColumnSpec, DataTable, ProjectedRow, TupleSlot};
pub use txn::{DurabilityPolicy, TransactionContext, TransactionManager};

use storage::TableId;

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Another writer won the race to install a new version of the tuple.
    /// Recoverable: the transaction must abort and may be retried by the
    /// caller.
    #[error("write-write conflict on slot {slot:?} of table {table}")]
    WriteWriteConflict { table: TableId, slot: TupleSlot },

    /// The buffer pool reached its hard cap. Fatal to the requesting
    /// transaction (it must abort), not to the process.
    #[error("buffer pool exhausted: {outstanding} segments outstanding, cap {cap}")]
    BufferPoolExhausted { outstanding: usize, cap: usize },

    #[error("table not found: {0}")]
    TableNotFound(TableId),

    #[error("log manager has been shut down")]
    LogClosed,

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
