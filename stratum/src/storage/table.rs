//! Data tables - the MVCC write/read protocol
//!
//! A `DataTable` stores tuples in blocks and resolves all reader/writer
//! contention through the tuple's version chain:
//!
//! - Writers capture a before-image into an undo record, then attempt a
//!   compare-and-swap of the chain head from the previously observed head
//!   to the new record. Losing the race (or finding an ineligible head) is
//!   a write-write conflict: the transaction must abort, and the storage
//!   layer never retries on its own.
//! - Readers copy the in-place version, then walk the chain applying
//!   before-images of records not visible to them until the first visible
//!   record. A record still carrying an in-progress marker is visible only
//!   to its own transaction, which yields snapshot isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::data::Value;
use crate::txn::context::TransactionContext;
use crate::{Error, Result};

use super::block::Block;
use super::columns::{ProjectedColumns, ProjectedColumnsInitializer};
use super::layout::{BlockLayout, ColumnSpec};
use super::projection::{ProjectedRow, ProjectedRowInitializer};
use super::redo::{RedoOp, RedoRecord};
use super::varlen::{VarlenEntry, VarlenPool};
use super::version::{UndoChunkRegistry, UndoPayload, UndoRecordId, INVALID_UNDO_RECORD};
use super::{BlockId, TableId, TupleSlot};

// ============================================================================
// Data Table
// ============================================================================

/// Versioned tuple storage for one table. See module docs.
pub struct DataTable {
    id: TableId,
    layout: Arc<BlockLayout>,
    blocks: RwLock<Vec<Arc<Block>>>,
    registry: Arc<UndoChunkRegistry>,
    varlen: Arc<VarlenPool>,
}

impl DataTable {
    /// Create an empty table
    pub fn new(
        id: TableId,
        columns: &[ColumnSpec],
        block_capacity: Option<u32>,
        registry: Arc<UndoChunkRegistry>,
        varlen: Arc<VarlenPool>,
    ) -> Self {
        let layout = match block_capacity {
            Some(capacity) => BlockLayout::with_capacity(columns, capacity),
            None => BlockLayout::new(columns),
        };
        Self {
            id,
            layout: Arc::new(layout),
            blocks: RwLock::new(Vec::new()),
            registry,
            varlen,
        }
    }

    /// Table id
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The table's block layout
    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    /// The varlen pool backing this table's variable-length values
    pub fn varlen(&self) -> &Arc<VarlenPool> {
        &self.varlen
    }

    /// An initializer for projected rows over the given columns
    pub fn row_initializer(&self, col_ids: &[crate::data::ColumnId]) -> ProjectedRowInitializer {
        ProjectedRowInitializer::from_block_layout(&self.layout, col_ids)
    }

    /// An initializer for columnar projections over the given columns
    pub fn columns_initializer(
        &self,
        col_ids: &[crate::data::ColumnId],
        max_tuples: u32,
    ) -> ProjectedColumnsInitializer {
        ProjectedColumnsInitializer::from_block_layout(&self.layout, col_ids, max_tuples)
    }

    fn block(&self, id: BlockId) -> Arc<Block> {
        Arc::clone(&self.blocks.read()[id as usize])
    }

    fn allocate_slot(&self) -> TupleSlot {
        loop {
            if let Some(block) = self.blocks.read().last() {
                if let Some(offset) = block.try_allocate() {
                    return TupleSlot::new(block.id(), offset);
                }
            }
            let mut blocks = self.blocks.write();
            // Another inserter may have grown the table while we waited
            if let Some(block) = blocks.last() {
                if let Some(offset) = block.try_allocate() {
                    return TupleSlot::new(block.id(), offset);
                }
            }
            let id = blocks.len() as BlockId;
            blocks.push(Arc::new(Block::new(id, Arc::clone(&self.layout))));
        }
    }

    // ========================================================================
    // Write eligibility
    // ========================================================================

    /// First-writer-wins conflict test on the observed chain head: the head
    /// must be absent, reclaimed, committed at or before the writer's start
    /// time, or the writer's own in-progress record.
    fn check_write_eligibility(
        &self,
        txn: &TransactionContext,
        observed: UndoRecordId,
        slot: TupleSlot,
    ) -> Result<()> {
        let Some(handle) = self.registry.resolve(observed) else {
            // No chain, or the head was already reclaimed: committed long
            // before any active transaction started.
            return Ok(());
        };
        let ts = handle.record().timestamp();
        let eligible = if crate::txn::timestamp::is_committed(ts) {
            ts <= txn.start_time()
        } else {
            ts == txn.txn_marker()
        };
        if eligible {
            Ok(())
        } else {
            txn.set_must_abort();
            Err(Error::WriteWriteConflict {
                table: self.id,
                slot,
            })
        }
    }

    fn conflict(&self, txn: &TransactionContext, slot: TupleSlot) -> Error {
        txn.set_must_abort();
        Error::WriteWriteConflict {
            table: self.id,
            slot,
        }
    }

    /// Pooled varlen entries among a row's non-null varlen columns
    fn pooled_entries(&self, row: &ProjectedRow) -> Vec<VarlenEntry> {
        let mut entries = Vec::new();
        for idx in 0..row.num_columns() {
            if !row.data_type(idx).is_varlen() {
                continue;
            }
            if let Some(words) = row.access_with_null_check(idx) {
                let entry = VarlenEntry::from_words([words[0], words[1]]);
                if entry.is_pooled() {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    /// Materialize a row's columns for a redo after-image
    fn materialize_columns(&self, row: &ProjectedRow) -> Vec<(crate::data::ColumnId, Option<Value>)> {
        (0..row.num_columns())
            .map(|idx| (row.column_ids()[idx], row.get(idx, &self.varlen)))
            .collect()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Insert a tuple. `row` must cover every column of the table.
    pub fn insert(&self, txn: &TransactionContext, row: &ProjectedRow) -> Result<TupleSlot> {
        let slot = self.allocate_slot();
        let block = self.block(slot.block);

        // Publish the insert tombstone before the tuple becomes visible so
        // concurrent snapshots know the tuple did not exist before us.
        let id = txn.new_undo_record(INVALID_UNDO_RECORD, self.id, slot, UndoPayload::Insert)?;
        let installed = block.compare_and_swap_head(slot.offset, INVALID_UNDO_RECORD, id);
        assert!(installed, "freshly allocated slot already had a version chain");
        txn.mark_installed(id);

        block.write_row(slot.offset, row);
        txn.register_staged_varlens(self.pooled_entries(row));
        block.set_visible(slot.offset);

        txn.stage_write(&RedoRecord {
            txn_start: txn.start_time(),
            table: self.id,
            slot,
            op: RedoOp::Write {
                columns: self.materialize_columns(row),
            },
        })?;
        Ok(slot)
    }

    /// Update the columns in `row`. Returns `Ok(false)` when the tuple is
    /// not visible to the transaction (nothing written), and a conflict
    /// error when another writer holds or has superseded the version.
    pub fn update(
        &self,
        txn: &TransactionContext,
        slot: TupleSlot,
        row: &ProjectedRow,
    ) -> Result<bool> {
        let block = self.block(slot.block);
        assert!(block.is_allocated(slot.offset), "update of an unallocated slot");

        let observed = block.head(slot.offset);
        self.check_write_eligibility(txn, observed, slot)?;
        if !block.is_visible(slot.offset) {
            return Ok(false);
        }

        // Before-image covers exactly the columns being overwritten
        let mut before = self.row_initializer(row.column_ids()).initialize();
        block.read_row(slot.offset, &mut before);
        let displaced = self.pooled_entries(&before);

        let id = txn.new_undo_record(observed, self.id, slot, UndoPayload::Update(before))?;
        if !block.compare_and_swap_head(slot.offset, observed, id) {
            return Err(self.conflict(txn, slot));
        }
        txn.mark_installed(id);

        block.write_row(slot.offset, row);
        txn.register_staged_varlens(self.pooled_entries(row));
        txn.register_loose_varlens(displaced);

        txn.stage_write(&RedoRecord {
            txn_start: txn.start_time(),
            table: self.id,
            slot,
            op: RedoOp::Write {
                columns: self.materialize_columns(row),
            },
        })?;
        Ok(true)
    }

    /// Delete a tuple. Returns `Ok(false)` when the tuple is not visible to
    /// the transaction, and a conflict error when another writer holds or
    /// has superseded the version.
    pub fn delete(&self, txn: &TransactionContext, slot: TupleSlot) -> Result<bool> {
        let block = self.block(slot.block);
        assert!(block.is_allocated(slot.offset), "delete of an unallocated slot");

        let observed = block.head(slot.offset);
        self.check_write_eligibility(txn, observed, slot)?;
        if !block.is_visible(slot.offset) {
            return Ok(false);
        }

        // Deletes capture the full pre-delete row
        let all_cols: Vec<_> = self.layout.column_ids().to_vec();
        let mut before = self.row_initializer(&all_cols).initialize();
        block.read_row(slot.offset, &mut before);
        let displaced = self.pooled_entries(&before);

        let id = txn.new_undo_record(observed, self.id, slot, UndoPayload::Delete(before))?;
        if !block.compare_and_swap_head(slot.offset, observed, id) {
            return Err(self.conflict(txn, slot));
        }
        txn.mark_installed(id);

        block.clear_visible(slot.offset);
        txn.register_loose_varlens(displaced);

        txn.stage_write(&RedoRecord {
            txn_start: txn.start_time(),
            table: self.id,
            slot,
            op: RedoOp::Delete,
        })?;
        Ok(true)
    }

    /// Materialize the version of a tuple visible to the transaction into
    /// `out`. Returns false when no version is visible (the tuple does not
    /// exist in the transaction's snapshot); `out` is unspecified then.
    pub fn select(&self, txn: &TransactionContext, slot: TupleSlot, out: &mut ProjectedRow) -> bool {
        let block = self.block(slot.block);
        assert!(block.is_allocated(slot.offset), "select of an unallocated slot");

        // Copy the in-place (newest) version, then undo every chain record
        // that is not visible to this transaction. A torn copy racing a
        // concurrent writer is corrected by that writer's before-image.
        let mut exists = block.is_visible(slot.offset);
        block.read_row(slot.offset, out);

        let mut id = block.head(slot.offset);
        while id != INVALID_UNDO_RECORD {
            let Some(handle) = self.registry.resolve(id) else {
                // Reclaimed: everything from here on predates the watermark
                break;
            };
            let record = handle.record();
            if txn.can_see(record.timestamp()) {
                break;
            }
            match record.payload() {
                UndoPayload::Insert => exists = false,
                UndoPayload::Update(before) => {
                    out.copy_intersection_from(before);
                    exists = true;
                }
                UndoPayload::Delete(before) => {
                    out.copy_intersection_from(before);
                    exists = true;
                }
            }
            id = record.next();
        }
        exists
    }

    /// Scan the table into a columnar projection, packing visible tuples
    /// from row offset 0. Returns the number of tuples materialized (stops
    /// at the buffer's max).
    pub fn select_into_columns(&self, txn: &TransactionContext, out: &mut ProjectedColumns) -> u32 {
        let col_ids: Vec<_> = out.column_ids().to_vec();
        let init = self.row_initializer(&col_ids);
        let mut scratch = init.initialize();

        let mut filled = 0u32;
        let num_blocks = self.blocks.read().len();
        'outer: for block_id in 0..num_blocks {
            let block = self.block(block_id as BlockId);
            for offset in 0..block.allocation_high_water() {
                if filled == out.max_tuples() {
                    break 'outer;
                }
                let slot = TupleSlot::new(block_id as BlockId, offset);
                if self.select(txn, slot, &mut scratch) {
                    out.copy_from_row(filled, &scratch);
                    out.set_tuple_slot(filled, slot);
                    filled += 1;
                }
            }
        }
        out.set_num_tuples(filled);
        filled
    }

    // ========================================================================
    // Rollback and reclamation
    // ========================================================================

    /// Undo one installed record of an aborting transaction: restore the
    /// before-image in place and pop the record off the chain head. The
    /// aborting transaction's records are necessarily at the head, newest
    /// first.
    pub fn rollback_record(&self, id: UndoRecordId) {
        let handle = self
            .registry
            .resolve(id)
            .expect("rolling back a reclaimed record");
        let record = handle.record();
        let slot = record.slot();
        let block = self.block(slot.block);

        match record.payload() {
            UndoPayload::Insert => block.clear_visible(slot.offset),
            UndoPayload::Update(before) => block.write_row(slot.offset, before),
            UndoPayload::Delete(before) => {
                block.write_row(slot.offset, before);
                block.set_visible(slot.offset);
            }
        }
        let unlinked = block.compare_and_swap_head(slot.offset, id, record.next());
        assert!(unlinked, "aborting transaction's record was not the chain head");
    }

    /// Unlink a committed record that has fallen below the GC watermark.
    /// Concurrent readers mid-traversal see either the old or the new chain;
    /// physical reclamation waits one further collection pass.
    pub fn unlink_record(&self, id: UndoRecordId) {
        let handle = self
            .registry
            .resolve(id)
            .expect("unlinking a reclaimed record");
        let record = handle.record();
        let slot = record.slot();
        let block = self.block(slot.block);

        loop {
            let head = block.head(slot.offset);
            if head == id {
                if block.compare_and_swap_head(slot.offset, id, record.next()) {
                    return;
                }
                // A writer installed a newer head; find us in the interior
                continue;
            }
            // Interior unlink: only the GC swings interior next pointers,
            // so the predecessor search cannot race another unlinker.
            let mut cursor = head;
            while cursor != INVALID_UNDO_RECORD {
                let Some(prev_handle) = self.registry.resolve(cursor) else {
                    break;
                };
                let prev = prev_handle.record();
                if prev.next() == id {
                    let swung = prev.compare_and_swap_next(id, record.next());
                    assert!(swung, "interior unlink raced another chain mutation");
                    return;
                }
                cursor = prev.next();
            }
            panic!("record missing from its version chain");
        }
    }

    /// Walk a tuple's version chain head-first, yielding record ids. Used
    /// by the garbage collector's bookkeeping and by tests.
    pub fn version_chain(&self, slot: TupleSlot) -> Vec<UndoRecordId> {
        let block = self.block(slot.block);
        let mut ids = Vec::new();
        let mut id = block.head(slot.offset);
        while id != INVALID_UNDO_RECORD {
            let Some(handle) = self.registry.resolve(id) else {
                break;
            };
            ids.push(id);
            id = handle.record().next();
        }
        ids
    }
}

// ============================================================================
// Table Registry
// ============================================================================

/// Engine-wide map from table ids to tables; the garbage collector resolves
/// undo records' table ids through it.
pub struct TableRegistry {
    tables: RwLock<AHashMap<TableId, Arc<DataTable>>>,
    next_id: AtomicU32,
}

impl TableRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(AHashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Reserve the next table id
    pub fn allocate_id(&self) -> TableId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a table under its id
    pub fn register(&self, table: Arc<DataTable>) {
        self.tables.write().insert(table.id(), table);
    }

    /// Look up a table
    pub fn get(&self, id: TableId) -> Result<Arc<DataTable>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::TableNotFound(id))
    }

    /// Number of registered tables
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    /// Whether no tables are registered
    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}
