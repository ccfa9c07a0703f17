//! Storage engine facade
//!
//! Explicitly constructed bundle of the engine's services: the buffer pool,
//! varlen pool, undo chunk registry, timestamp manager, log manager,
//! transaction manager, and garbage collector, wired together with explicit
//! init and teardown. There are no ambient globals; everything reachable
//! from a `StorageEngine` dies with it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::gc::{GarbageCollector, GcConfig, GcThread};
use crate::storage::layout::ColumnSpec;
use crate::storage::log::{LogConfig, LogManager};
use crate::storage::pool::{PoolConfig, RecordBufferPool};
use crate::storage::table::{DataTable, TableRegistry};
use crate::storage::varlen::VarlenPool;
use crate::storage::version::UndoChunkRegistry;
use crate::storage::TableId;
use crate::txn::context::{TransactionContext, TransactionPolicy};
use crate::txn::manager::TransactionManager;
use crate::txn::timestamp::{Timestamp, TimestampManager};
use crate::Result;

// ============================================================================
// Configuration
// ============================================================================

/// Engine-wide configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub gc: GcConfig,
    /// Log manager configuration; `None` disables logging entirely
    pub log: Option<LogConfig>,
    /// Policy applied to transactions begun without an explicit one
    pub default_policy: TransactionPolicy,
    /// Tuples per block; `None` sizes blocks to the default arena budget
    pub block_capacity: Option<u32>,
}

// ============================================================================
// Storage Engine
// ============================================================================

/// The assembled storage core. See module docs.
pub struct StorageEngine {
    pool: Arc<RecordBufferPool>,
    chunk_registry: Arc<UndoChunkRegistry>,
    varlen: Arc<VarlenPool>,
    tables: Arc<TableRegistry>,
    timestamps: Arc<TimestampManager>,
    log: Option<Arc<LogManager>>,
    manager: Arc<TransactionManager>,
    gc: Arc<GarbageCollector>,
    gc_thread: Mutex<Option<GcThread>>,
    block_capacity: Option<u32>,
}

impl StorageEngine {
    /// Construct and wire the engine's services, starting the log writer
    /// and (if enabled) the GC thread.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let pool = Arc::new(RecordBufferPool::new(config.pool));
        let chunk_registry = Arc::new(UndoChunkRegistry::new());
        let varlen = Arc::new(VarlenPool::new());
        let tables = Arc::new(TableRegistry::new());
        let timestamps = Arc::new(TimestampManager::new());

        let log = match config.log {
            Some(log_config) => Some(LogManager::new(log_config, Arc::clone(&pool))?),
            None => None,
        };

        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&timestamps),
            Arc::clone(&pool),
            Arc::clone(&chunk_registry),
            Arc::clone(&tables),
            Arc::clone(&varlen),
            log.clone(),
            config.default_policy,
            true,
        ));

        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&timestamps),
            Arc::clone(&manager),
            Arc::clone(&tables),
            Arc::clone(&chunk_registry),
            Arc::clone(&pool),
            Arc::clone(&varlen),
        ));
        let gc_thread = if config.gc.enabled {
            Some(GcThread::start(Arc::clone(&gc), config.gc.interval))
        } else {
            None
        };

        Ok(Self {
            pool,
            chunk_registry,
            varlen,
            tables,
            timestamps,
            log,
            manager,
            gc,
            gc_thread: Mutex::new(gc_thread),
            block_capacity: config.block_capacity,
        })
    }

    /// Create and register a table
    pub fn create_table(&self, columns: &[ColumnSpec]) -> Arc<DataTable> {
        let table = Arc::new(DataTable::new(
            self.tables.allocate_id(),
            columns,
            self.block_capacity,
            Arc::clone(&self.chunk_registry),
            Arc::clone(&self.varlen),
        ));
        self.tables.register(Arc::clone(&table));
        table
    }

    /// Look up a table by id
    pub fn table(&self, id: TableId) -> Result<Arc<DataTable>> {
        self.tables.get(id)
    }

    /// Begin a transaction with the default policy
    pub fn begin_transaction(&self) -> TransactionContext {
        self.manager.begin_transaction()
    }

    /// Begin a transaction with an explicit policy
    pub fn begin_transaction_with_policy(&self, policy: TransactionPolicy) -> TransactionContext {
        self.manager.begin_transaction_with_policy(policy)
    }

    /// Commit a transaction; returns its commit timestamp
    pub fn commit(&self, txn: TransactionContext) -> Result<Timestamp> {
        self.manager.commit(txn)
    }

    /// Abort a transaction; returns its abort timestamp
    pub fn abort(&self, txn: TransactionContext) -> Timestamp {
        self.manager.abort(txn)
    }

    /// The transaction manager
    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// The timestamp manager
    pub fn timestamps(&self) -> &Arc<TimestampManager> {
        &self.timestamps
    }

    /// The garbage collector, for manual passes
    pub fn garbage_collector(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// The engine's varlen pool
    pub fn varlen(&self) -> &Arc<VarlenPool> {
        &self.varlen
    }

    /// The buffer pool
    pub fn pool(&self) -> &Arc<RecordBufferPool> {
        &self.pool
    }

    /// Stop the GC thread, run two final reclamation passes, and persist
    /// and stop the log. The engine stays usable for reads afterwards, but
    /// further logged commits fail.
    pub fn shutdown(&self) {
        if let Some(mut thread) = self.gc_thread.lock().take() {
            thread.stop();
        }
        // Two passes: unlink everything reclaimable, then deallocate it
        self.gc.perform_gc();
        self.gc.perform_gc();
        if let Some(log) = &self.log {
            log.persist_and_stop();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnId, DataType, Value};
    use crate::storage::log::LogReader;
    use crate::storage::redo::RedoOp;
    use crate::storage::TupleSlot;
    use crate::txn::context::DurabilityPolicy;
    use crate::Error;

    const COL_ID: ColumnId = 0;
    const COL_VAL: ColumnId = 1;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new(COL_ID, DataType::BigInt),
            ColumnSpec::new(COL_VAL, DataType::Varchar),
        ]
    }

    fn insert(engine: &StorageEngine, table: &DataTable, txn: &TransactionContext, id: i64, val: &str) -> TupleSlot {
        let init = table.row_initializer(&[COL_ID, COL_VAL]);
        let mut row = init.initialize();
        let a = row.layout().index_of(COL_ID).unwrap();
        let b = row.layout().index_of(COL_VAL).unwrap();
        row.set(a, &Value::BigInt(id), engine.varlen());
        row.set(b, &Value::Varchar(val.to_string()), engine.varlen());
        table.insert(txn, &row).unwrap()
    }

    fn update_val(
        engine: &StorageEngine,
        table: &DataTable,
        txn: &TransactionContext,
        slot: TupleSlot,
        val: &str,
    ) -> crate::Result<bool> {
        let init = table.row_initializer(&[COL_VAL]);
        let mut row = init.initialize();
        row.set(0, &Value::Varchar(val.to_string()), engine.varlen());
        table.update(txn, slot, &row)
    }

    fn read_id(engine: &StorageEngine, table: &DataTable, txn: &TransactionContext, slot: TupleSlot) -> Option<i64> {
        let init = table.row_initializer(&[COL_ID]);
        let mut row = init.initialize();
        if !table.select(txn, slot, &mut row) {
            return None;
        }
        match row.get(0, engine.varlen()) {
            Some(Value::BigInt(v)) => Some(v),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_logged_commits_reach_the_log_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let engine = StorageEngine::new(EngineConfig {
            log: Some(LogConfig::new(&path)),
            gc: GcConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let table = engine.create_table(&columns());

        let t1 = engine.begin_transaction();
        let slot = insert(&engine, &table, &t1, 1, "a");
        engine.commit(t1).unwrap();

        let t2 = engine.begin_transaction();
        assert!(update_val(&engine, &table, &t2, slot, "b").unwrap());
        engine.commit(t2).unwrap();

        let t3 = engine.begin_transaction();
        assert!(table.delete(&t3, slot).unwrap());
        engine.commit(t3).unwrap();

        engine.shutdown();

        let records = LogReader::read_all(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0].op, RedoOp::Write { .. }));
        assert!(matches!(records[1].op, RedoOp::Write { .. }));
        assert!(matches!(records[2].op, RedoOp::Delete));
        assert!(records.iter().all(|r| r.table == table.id() && r.slot == slot));
        // Program order within and across these transactions' commits
        assert!(records[0].txn_start < records[1].txn_start);
        assert!(records[1].txn_start < records[2].txn_start);
    }

    #[test]
    fn test_aborted_transaction_leaves_no_log_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let engine = StorageEngine::new(EngineConfig {
            log: Some(LogConfig::new(&path)),
            ..Default::default()
        })
        .unwrap();
        let table = engine.create_table(&columns());

        let txn = engine.begin_transaction();
        insert(&engine, &table, &txn, 7, "discarded");
        engine.abort(txn);
        engine.shutdown();

        assert_eq!(LogReader::read_all(&path).unwrap(), Vec::new());
    }

    #[test]
    fn test_unlogged_transactions_skip_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let engine = StorageEngine::new(EngineConfig {
            log: Some(LogConfig::new(&path)),
            ..Default::default()
        })
        .unwrap();
        let table = engine.create_table(&columns());

        let txn = engine.begin_transaction_with_policy(TransactionPolicy {
            durability: DurabilityPolicy::Disable,
        });
        insert(&engine, &table, &txn, 1, "unlogged");
        engine.commit(txn).unwrap();
        engine.shutdown();

        assert_eq!(LogReader::read_all(&path).unwrap(), Vec::new());
    }

    #[test]
    fn test_columnar_scan_respects_snapshots() {
        let engine = StorageEngine::new(EngineConfig {
            gc: GcConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let table = engine.create_table(&columns());

        let setup = engine.begin_transaction();
        for i in 0..3 {
            insert(&engine, &table, &setup, i, &format!("row{}", i));
        }
        engine.commit(setup).unwrap();

        // A concurrent writer inserts a fourth row but has not committed
        let writer = engine.begin_transaction();
        insert(&engine, &table, &writer, 99, "invisible");

        let reader = engine.begin_transaction();
        let init = table.columns_initializer(&[COL_ID, COL_VAL], 8);
        let mut cols = init.initialize();
        let filled = table.select_into_columns(&reader, &mut cols);
        assert_eq!(filled, 3);
        assert_eq!(cols.num_tuples(), 3);

        let id_idx = cols
            .column_ids()
            .iter()
            .position(|&c| c == COL_ID)
            .unwrap();
        let ids: Vec<_> = (0..filled)
            .map(|r| cols.row_view(r).get(id_idx, engine.varlen()))
            .collect();
        assert_eq!(
            ids,
            vec![
                Some(Value::BigInt(0)),
                Some(Value::BigInt(1)),
                Some(Value::BigInt(2))
            ]
        );

        // The writer's own scan includes its uncommitted row
        let mut own = init.initialize();
        assert_eq!(table.select_into_columns(&writer, &mut own), 4);

        engine.commit(writer).unwrap();
        engine.commit(reader).unwrap();
        engine.shutdown();
    }

    #[test]
    fn test_pool_exhaustion_aborts_transaction() {
        let engine = StorageEngine::new(EngineConfig {
            pool: PoolConfig {
                hard_cap: 1,
                ..Default::default()
            },
            gc: GcConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let table = engine.create_table(&columns());

        // The first insert takes the only segment budget for its undo
        // chunk; staging the redo record then exhausts the pool.
        let txn = engine.begin_transaction();
        let init = table.row_initializer(&[COL_ID, COL_VAL]);
        let mut row = init.initialize();
        let a = row.layout().index_of(COL_ID).unwrap();
        let b = row.layout().index_of(COL_VAL).unwrap();
        row.set(a, &Value::BigInt(1), engine.varlen());
        row.set(b, &Value::Varchar("x".to_string()), engine.varlen());

        let err = table.insert(&txn, &row).unwrap_err();
        assert!(matches!(err, Error::BufferPoolExhausted { .. }));
        engine.abort(txn);
        engine.shutdown();
    }

    #[test]
    fn test_concurrent_increments_are_serializable() {
        use std::thread;

        let engine = Arc::new(
            StorageEngine::new(EngineConfig {
                gc: GcConfig {
                    interval: std::time::Duration::from_millis(1),
                    enabled: true,
                },
                ..Default::default()
            })
            .unwrap(),
        );
        let table = engine.create_table(&columns());

        let setup = engine.begin_transaction();
        let slot = insert(&engine, &table, &setup, 0, "counter");
        engine.commit(setup).unwrap();

        const THREADS: usize = 4;
        const INCREMENTS: usize = 25;
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let engine = Arc::clone(&engine);
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let mut done = 0;
                while done < INCREMENTS {
                    let txn = engine.begin_transaction();
                    let current = read_id(&engine, &table, &txn, slot).unwrap();

                    let init = table.row_initializer(&[COL_ID]);
                    let mut row = init.initialize();
                    row.set(0, &Value::BigInt(current + 1), engine.varlen());
                    match table.update(&txn, slot, &row) {
                        Ok(true) => {
                            engine.commit(txn).unwrap();
                            done += 1;
                        }
                        Ok(false) => panic!("counter tuple vanished"),
                        Err(Error::WriteWriteConflict { .. }) => {
                            engine.abort(txn);
                        }
                        Err(e) => panic!("unexpected error {}", e),
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let check = engine.begin_transaction();
        assert_eq!(
            read_id(&engine, &table, &check, slot),
            Some((THREADS * INCREMENTS) as i64)
        );
        engine.commit(check).unwrap();
        engine.shutdown();

        // After shutdown's final passes everything reclaimable is gone
        let stats = engine.garbage_collector();
        assert!(stats.total_deallocated() > 0);
    }
}
