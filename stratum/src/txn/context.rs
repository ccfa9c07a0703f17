//! Transaction context - per-transaction state
//!
//! A `TransactionContext` carries everything a transaction accumulates
//! while running: its start timestamp, the undo buffer feeding tuple
//! version chains, the redo buffer feeding the log, its durability policy,
//! and the bookkeeping needed to release variable-length values at the
//! right time. The context is handed out by `TransactionManager::begin` and
//! consumed by commit or abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::log::LogManager;
use crate::storage::pool::RecordBufferPool;
use crate::storage::redo::{RedoBuffer, RedoRecord};
use crate::storage::varlen::VarlenEntry;
use crate::storage::version::{UndoBuffer, UndoChunkRegistry, UndoPayload, UndoRecordId};
use crate::storage::{TableId, TupleSlot};
use crate::Result;

use super::timestamp::{is_committed, uncommitted, Timestamp};

// ============================================================================
// Policies
// ============================================================================

/// How a transaction's commit relates to log durability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityPolicy {
    /// Commit blocks until the transaction's log records are durable
    Sync,
    /// Log records are enqueued; commit does not wait for persistence
    Async,
    /// The transaction is not logged at all
    Disable,
}

/// Transaction-wide policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionPolicy {
    pub durability: DurabilityPolicy,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            durability: DurabilityPolicy::Sync,
        }
    }
}

// ============================================================================
// Transaction Context
// ============================================================================

/// State kept while a transaction is running. See module docs.
pub struct TransactionContext {
    start: Timestamp,
    policy: TransactionPolicy,
    undo: Mutex<UndoBuffer>,
    redo: Mutex<RedoBuffer>,
    /// Set when a physical conflict means this transaction cannot commit
    must_abort: AtomicBool,
    /// Pool entries staged by this transaction's writes; released on abort
    staged_varlens: Mutex<Vec<VarlenEntry>>,
    /// Pool entries displaced by this transaction's writes; released by the
    /// GC once the transaction's versions are reclaimed
    loose_varlens: Mutex<Vec<VarlenEntry>>,
}

impl TransactionContext {
    /// Construct a context. Outside of tests this is only called by
    /// `TransactionManager::begin_transaction`, which registers the start
    /// timestamp in the active set first.
    pub fn new(
        start: Timestamp,
        policy: TransactionPolicy,
        pool: Arc<RecordBufferPool>,
        registry: Arc<UndoChunkRegistry>,
        log: Option<Arc<LogManager>>,
    ) -> Self {
        Self {
            start,
            policy,
            undo: Mutex::new(UndoBuffer::new(Arc::clone(&pool), registry)),
            redo: Mutex::new(RedoBuffer::new(pool, log)),
            must_abort: AtomicBool::new(false),
            staged_varlens: Mutex::new(Vec::new()),
            loose_varlens: Mutex::new(Vec::new()),
        }
    }

    /// Start timestamp; unique, and the transaction's identity
    pub fn start_time(&self) -> Timestamp {
        self.start
    }

    /// The in-progress marker this transaction writes into undo records
    pub fn txn_marker(&self) -> Timestamp {
        uncommitted(self.start)
    }

    /// The transaction's policies
    pub fn policy(&self) -> &TransactionPolicy {
        &self.policy
    }

    /// Snapshot visibility: a version timestamp is visible if it committed
    /// at or before this transaction's start, or is this transaction's own
    /// in-progress write.
    pub fn can_see(&self, ts: Timestamp) -> bool {
        if is_committed(ts) {
            ts <= self.start
        } else {
            ts == self.txn_marker()
        }
    }

    /// Whether this transaction performed no writes
    pub fn is_read_only(&self) -> bool {
        self.undo.lock().is_empty()
    }

    /// Whether a conflict has doomed this transaction
    pub fn must_abort(&self) -> bool {
        self.must_abort.load(Ordering::Acquire)
    }

    /// Mark this transaction as unable to commit
    pub fn set_must_abort(&self) {
        self.must_abort.store(true, Ordering::Release);
    }

    // ========================================================================
    // Buffer access (called by DataTable)
    // ========================================================================

    /// Reserve an undo record carrying this transaction's marker
    pub fn new_undo_record(
        &self,
        next: UndoRecordId,
        table: TableId,
        slot: TupleSlot,
        payload: UndoPayload,
    ) -> Result<UndoRecordId> {
        self.undo
            .lock()
            .new_record(self.txn_marker(), next, table, slot, payload)
    }

    /// Track a record whose chain-head CAS succeeded
    pub fn mark_installed(&self, id: UndoRecordId) {
        self.undo.lock().mark_installed(id);
    }

    /// Installed record ids in program order
    pub fn installed_records(&self) -> Vec<UndoRecordId> {
        self.undo.lock().records().to_vec()
    }

    /// Stage a redo record under this transaction's durability policy
    pub fn stage_write(&self, record: &RedoRecord) -> Result<()> {
        self.redo.lock().stage(record, &self.policy)
    }

    /// Track varlen pool entries this transaction staged (released on abort)
    pub fn register_staged_varlens(&self, entries: Vec<VarlenEntry>) {
        if !entries.is_empty() {
            self.staged_varlens.lock().extend(entries);
        }
    }

    /// Track varlen pool entries this transaction displaced (released by GC)
    pub fn register_loose_varlens(&self, entries: Vec<VarlenEntry>) {
        if !entries.is_empty() {
            self.loose_varlens.lock().extend(entries);
        }
    }

    /// Tear the context apart at commit/abort time
    pub(crate) fn into_parts(self) -> TransactionParts {
        TransactionParts {
            start: self.start,
            policy: self.policy,
            undo: self.undo.into_inner(),
            redo: self.redo.into_inner(),
            staged_varlens: self.staged_varlens.into_inner(),
            loose_varlens: self.loose_varlens.into_inner(),
        }
    }
}

/// The remains of a finished transaction, consumed by the manager
pub(crate) struct TransactionParts {
    pub start: Timestamp,
    pub policy: TransactionPolicy,
    pub undo: UndoBuffer,
    pub redo: RedoBuffer,
    pub staged_varlens: Vec<VarlenEntry>,
    pub loose_varlens: Vec<VarlenEntry>,
}

// ============================================================================
// Tests
// ============================================================================
