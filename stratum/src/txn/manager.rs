//! Transaction manager - lifecycle and rollback
//!
//! Creates, commits, and aborts transactions:
//!
//! - COMMIT issues a commit timestamp and installs it into every undo
//!   record the transaction linked into version chains *before* removing
//!   the transaction from the active set, then finalizes the redo buffer
//!   (force-flushing under a synchronous durability policy).
//! - ABORT synchronously replays the undo buffer newest-first, restoring
//!   prior tuple values and popping the transaction's records off their
//!   chains, then finalizes with an abort timestamp. Rollback is always
//!   complete; there is no partial abort.
//!
//! Finished transactions queue up for the garbage collector, which later
//! unlinks their committed records and returns their buffers to the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::log::LogManager;
use crate::storage::pool::RecordBufferPool;
use crate::storage::table::TableRegistry;
use crate::storage::varlen::{VarlenEntry, VarlenPool};
use crate::storage::version::{UndoChunk, UndoChunkRegistry, UndoRecordId};
use crate::Result;

use super::context::{DurabilityPolicy, TransactionContext, TransactionPolicy};
use super::timestamp::{Timestamp, TimestampManager};

// ============================================================================
// Finished Transactions
// ============================================================================

/// What remains of a committed or aborted transaction, queued for the GC
pub struct FinishedTransaction {
    pub start_time: Timestamp,
    pub finish_time: Timestamp,
    pub aborted: bool,
    /// Records this transaction linked into version chains. For aborted
    /// transactions these are already unlinked by rollback.
    pub records: Vec<UndoRecordId>,
    /// The transaction's undo chunks, released to the pool at deallocation
    pub chunks: Vec<(u32, Arc<UndoChunk>)>,
    /// Varlen pool entries displaced by this transaction's writes
    pub loose_varlens: Vec<VarlenEntry>,
}

// ============================================================================
// Transaction Manager
// ============================================================================

/// Global transaction lifecycle coordinator. See module docs.
pub struct TransactionManager {
    timestamps: Arc<TimestampManager>,
    pool: Arc<RecordBufferPool>,
    chunk_registry: Arc<UndoChunkRegistry>,
    tables: Arc<TableRegistry>,
    varlen: Arc<VarlenPool>,
    log: Option<Arc<LogManager>>,
    default_policy: TransactionPolicy,
    /// Whether finished transactions are queued for the GC
    gc_enabled: bool,
    completed: Mutex<Vec<FinishedTransaction>>,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl TransactionManager {
    /// Create a transaction manager over the given shared services; `log`
    /// is `None` when logging is disabled engine-wide.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamps: Arc<TimestampManager>,
        pool: Arc<RecordBufferPool>,
        chunk_registry: Arc<UndoChunkRegistry>,
        tables: Arc<TableRegistry>,
        varlen: Arc<VarlenPool>,
        log: Option<Arc<LogManager>>,
        default_policy: TransactionPolicy,
        gc_enabled: bool,
    ) -> Self {
        Self {
            timestamps,
            pool,
            chunk_registry,
            tables,
            varlen,
            log,
            default_policy,
            gc_enabled,
            completed: Mutex::new(Vec::new()),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    /// The timestamp manager shared by this engine
    pub fn timestamps(&self) -> &Arc<TimestampManager> {
        &self.timestamps
    }

    /// Begin a transaction with the engine's default policy
    pub fn begin_transaction(&self) -> TransactionContext {
        self.begin_transaction_with_policy(self.default_policy)
    }

    /// Begin a transaction with an explicit policy
    pub fn begin_transaction_with_policy(&self, policy: TransactionPolicy) -> TransactionContext {
        let start = self.timestamps.begin_transaction();
        TransactionContext::new(
            start,
            policy,
            Arc::clone(&self.pool),
            Arc::clone(&self.chunk_registry),
            self.log.clone(),
        )
    }

    /// Commit a transaction, making its writes visible. Returns the commit
    /// timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the transaction was doomed by a conflict; the caller must
    /// abort it instead.
    pub fn commit(&self, txn: TransactionContext) -> Result<Timestamp> {
        assert!(
            !txn.must_abort(),
            "committing a transaction that hit a write-write conflict"
        );
        let mut parts = txn.into_parts();

        if parts.undo.is_empty() {
            // Read-only: nothing to finalize or reclaim
            let commit_ts = self.timestamps.checkout_timestamp();
            self.timestamps.remove_transaction(parts.start);
            self.total_committed.fetch_add(1, Ordering::Relaxed);
            return Ok(commit_ts);
        }

        let commit_ts = self.timestamps.checkout_timestamp();
        for &id in parts.undo.records() {
            let handle = self
                .chunk_registry
                .resolve(id)
                .expect("committing transaction's record was reclaimed");
            handle.record().finalize(commit_ts);
        }
        // The commit timestamp is installed everywhere before the
        // transaction leaves the active set; the GC watermark can never
        // pass a record still carrying an in-progress marker.
        self.timestamps.remove_transaction(parts.start);

        parts.redo.finalize(true, &parts.policy)?;
        if parts.policy.durability == DurabilityPolicy::Sync {
            if let Some(log) = &self.log {
                log.force_flush()?;
            }
        }

        let (chunks, records) = parts.undo.into_parts();
        if self.gc_enabled {
            self.completed.lock().push(FinishedTransaction {
                start_time: parts.start,
                finish_time: commit_ts,
                aborted: false,
                records,
                chunks,
                loose_varlens: parts.loose_varlens,
            });
        }
        self.total_committed.fetch_add(1, Ordering::Relaxed);
        Ok(commit_ts)
    }

    /// Abort a transaction, rolling back its writes. Returns the abort
    /// timestamp. Rollback is synchronous and complete.
    pub fn abort(&self, txn: TransactionContext) -> Timestamp {
        let mut parts = txn.into_parts();
        let abort_ts = self.timestamps.checkout_timestamp();

        // Replay newest-first: each record is at its chain head when its
        // turn comes, because later writers would have conflicted.
        let records: Vec<UndoRecordId> = parts.undo.records().to_vec();
        for &id in records.iter().rev() {
            let handle = self
                .chunk_registry
                .resolve(id)
                .expect("aborting transaction's record was reclaimed");
            let table = self
                .tables
                .get(handle.record().table())
                .expect("aborting transaction references a dropped table");
            table.rollback_record(id);
            handle.record().finalize(abort_ts);
        }

        // New varlen values staged by the rolled-back writes are dead now;
        // displaced (loose) values went back into place and stay live.
        for entry in parts.staged_varlens {
            self.varlen.release(entry);
        }

        self.timestamps.remove_transaction(parts.start);
        parts
            .redo
            .finalize(false, &parts.policy)
            .expect("abort does not touch the log");

        let (chunks, records) = parts.undo.into_parts();
        if self.gc_enabled {
            self.completed.lock().push(FinishedTransaction {
                start_time: parts.start,
                finish_time: abort_ts,
                aborted: true,
                records,
                chunks,
                loose_varlens: Vec::new(),
            });
        }
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
        abort_ts
    }

    /// Hand the queue of finished transactions to the garbage collector
    pub fn completed_transactions_for_gc(&self) -> Vec<FinishedTransaction> {
        std::mem::take(&mut *self.completed.lock())
    }

    /// Committed transactions so far
    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    /// Aborted transactions so far
    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnId, DataType, Value};
    use crate::storage::layout::ColumnSpec;
    use crate::storage::pool::PoolConfig;
    use crate::storage::table::DataTable;
    use crate::storage::TupleSlot;
    use crate::Error;

    const COL_ID: ColumnId = 0;
    const COL_VAL: ColumnId = 1;

    struct Harness {
        manager: TransactionManager,
        table: Arc<DataTable>,
        varlen: Arc<VarlenPool>,
    }

    fn harness() -> Harness {
        let timestamps = Arc::new(TimestampManager::new());
        let pool = Arc::new(RecordBufferPool::new(PoolConfig::default()));
        let chunk_registry = Arc::new(UndoChunkRegistry::new());
        let tables = Arc::new(TableRegistry::new());
        let varlen = Arc::new(VarlenPool::new());

        let table = Arc::new(DataTable::new(
            tables.allocate_id(),
            &[
                ColumnSpec::new(COL_ID, DataType::BigInt),
                ColumnSpec::new(COL_VAL, DataType::Varchar),
            ],
            Some(64),
            Arc::clone(&chunk_registry),
            Arc::clone(&varlen),
        ));
        tables.register(Arc::clone(&table));

        let manager = TransactionManager::new(
            timestamps,
            pool,
            chunk_registry,
            tables,
            Arc::clone(&varlen),
            None,
            TransactionPolicy::default(),
            true,
        );
        Harness {
            manager,
            table,
            varlen,
        }
    }

    impl Harness {
        fn insert(&self, txn: &TransactionContext, id: i64, val: &str) -> TupleSlot {
            let init = self.table.row_initializer(&[COL_ID, COL_VAL]);
            let mut row = init.initialize();
            let a = row.layout().index_of(COL_ID).unwrap();
            let b = row.layout().index_of(COL_VAL).unwrap();
            row.set(a, &Value::BigInt(id), &self.varlen);
            row.set(b, &Value::Varchar(val.to_string()), &self.varlen);
            self.table.insert(txn, &row).unwrap()
        }

        fn update_val(
            &self,
            txn: &TransactionContext,
            slot: TupleSlot,
            val: &str,
        ) -> crate::Result<bool> {
            let init = self.table.row_initializer(&[COL_VAL]);
            let mut row = init.initialize();
            row.set(0, &Value::Varchar(val.to_string()), &self.varlen);
            self.table.update(txn, slot, &row)
        }

        fn read_val(&self, txn: &TransactionContext, slot: TupleSlot) -> Option<String> {
            let init = self.table.row_initializer(&[COL_VAL]);
            let mut row = init.initialize();
            if !self.table.select(txn, slot, &mut row) {
                return None;
            }
            match row.get(0, &self.varlen) {
                Some(Value::Varchar(s)) => Some(s),
                other => panic!("unexpected value {:?}", other),
            }
        }
    }

    #[test]
    fn test_read_only_commit() {
        let h = harness();
        let txn = h.manager.begin_transaction();
        assert!(txn.is_read_only());
        h.manager.commit(txn).unwrap();
        assert_eq!(h.manager.total_committed(), 1);
        // Nothing queued for GC
        assert!(h.manager.completed_transactions_for_gc().is_empty());
    }

    #[test]
    fn test_snapshot_isolation_across_commits() {
        let h = harness();

        // T1 inserts and commits
        let t1 = h.manager.begin_transaction();
        let slot = h.insert(&t1, 1, "a");
        h.manager.commit(t1).unwrap();

        // T2 updates but does not commit yet
        let t2 = h.manager.begin_transaction();
        assert!(h.update_val(&t2, slot, "b").unwrap());
        // T2 sees its own write
        assert_eq!(h.read_val(&t2, slot), Some("b".to_string()));

        // T3 starts while T2 is in flight: must still see "a"
        let t3 = h.manager.begin_transaction();
        assert_eq!(h.read_val(&t3, slot), Some("a".to_string()));

        // T2 commits; T3's snapshot is unchanged
        h.manager.commit(t2).unwrap();
        assert_eq!(h.read_val(&t3, slot), Some("a".to_string()));
        h.manager.commit(t3).unwrap();

        // T4 starts after T2's commit and sees "b"
        let t4 = h.manager.begin_transaction();
        assert_eq!(h.read_val(&t4, slot), Some("b".to_string()));
        h.manager.commit(t4).unwrap();
    }

    #[test]
    fn test_write_write_conflict_single_winner() {
        let h = harness();

        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "base");
        h.manager.commit(setup).unwrap();

        // Both start before either writes
        let t1 = h.manager.begin_transaction();
        let t2 = h.manager.begin_transaction();

        assert!(h.update_val(&t1, slot, "one").unwrap());
        let err = h.update_val(&t2, slot, "two").unwrap_err();
        assert!(matches!(err, Error::WriteWriteConflict { .. }));
        assert!(t2.must_abort());

        h.manager.abort(t2);
        h.manager.commit(t1).unwrap();

        let check = h.manager.begin_transaction();
        assert_eq!(h.read_val(&check, slot), Some("one".to_string()));
        h.manager.commit(check).unwrap();
    }

    #[test]
    fn test_abort_restores_prior_value() {
        let h = harness();

        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "original");
        h.manager.commit(setup).unwrap();

        let t = h.manager.begin_transaction();
        assert!(h.update_val(&t, slot, "changed").unwrap());
        assert_eq!(h.read_val(&t, slot), Some("changed".to_string()));
        h.manager.abort(t);

        let check = h.manager.begin_transaction();
        assert_eq!(h.read_val(&check, slot), Some("original".to_string()));
        // The chain holds only the original insert again
        assert_eq!(h.table.version_chain(slot).len(), 1);
        h.manager.commit(check).unwrap();
    }

    #[test]
    fn test_abort_of_insert_removes_tuple() {
        let h = harness();

        let t = h.manager.begin_transaction();
        let slot = h.insert(&t, 1, "ghost");
        h.manager.abort(t);

        let check = h.manager.begin_transaction();
        assert_eq!(h.read_val(&check, slot), None);
        assert!(h.table.version_chain(slot).is_empty());
        h.manager.commit(check).unwrap();
    }

    #[test]
    fn test_abort_of_delete_restores_tuple() {
        let h = harness();

        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "keep me around");
        h.manager.commit(setup).unwrap();

        let t = h.manager.begin_transaction();
        assert!(h.table.delete(&t, slot).unwrap());
        assert_eq!(h.read_val(&t, slot), None);
        h.manager.abort(t);

        let check = h.manager.begin_transaction();
        assert_eq!(h.read_val(&check, slot), Some("keep me around".to_string()));
        h.manager.commit(check).unwrap();
    }

    #[test]
    fn test_delete_then_read_by_old_snapshot() {
        let h = harness();

        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "a");
        h.manager.commit(setup).unwrap();

        let old = h.manager.begin_transaction();
        let deleter = h.manager.begin_transaction();
        assert!(h.table.delete(&deleter, slot).unwrap());
        h.manager.commit(deleter).unwrap();

        // The older snapshot still sees the tuple
        assert_eq!(h.read_val(&old, slot), Some("a".to_string()));
        h.manager.commit(old).unwrap();

        let fresh = h.manager.begin_transaction();
        assert_eq!(h.read_val(&fresh, slot), None);
        h.manager.commit(fresh).unwrap();
    }

    #[test]
    fn test_version_chain_sorted_newest_to_oldest() {
        let h = harness();

        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "v0");
        h.manager.commit(setup).unwrap();

        for i in 1..5 {
            let t = h.manager.begin_transaction();
            assert!(h.update_val(&t, slot, &format!("v{}", i)).unwrap());
            h.manager.commit(t).unwrap();
        }

        let chain = h.table.version_chain(slot);
        assert_eq!(chain.len(), 5);
        let registry = h.manager.chunk_registry.clone();
        let timestamps: Vec<_> = chain
            .iter()
            .map(|&id| registry.resolve(id).unwrap().record().timestamp())
            .collect();
        for pair in timestamps.windows(2) {
            assert!(pair[0] > pair[1], "chain out of finalize order: {:?}", timestamps);
        }
    }

    #[test]
    fn test_completed_queue_feeds_gc() {
        let h = harness();
        let t = h.manager.begin_transaction();
        h.insert(&t, 1, "x");
        h.manager.commit(t).unwrap();

        let finished = h.manager.completed_transactions_for_gc();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].aborted);
        assert_eq!(finished[0].records.len(), 1);
        assert_eq!(finished[0].chunks.len(), 1);
        // The queue drains
        assert!(h.manager.completed_transactions_for_gc().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_commit_after_conflict_asserts() {
        let h = harness();
        let setup = h.manager.begin_transaction();
        let slot = h.insert(&setup, 1, "base");
        h.manager.commit(setup).unwrap();

        let t1 = h.manager.begin_transaction();
        let t2 = h.manager.begin_transaction();
        h.update_val(&t1, slot, "one").unwrap();
        let _ = h.update_val(&t2, slot, "two");
        // t2 is doomed; committing it is a programming error
        let _ = h.manager.commit(t2);
    }
}
