//! Undo records and version chains
//!
//! Every write captures a before-image in an `UndoRecord` and links it into
//! the tuple's version chain (newest first). Records live in fixed-capacity
//! chunks drawn from the buffer pool and are addressed by a packed
//! `UndoRecordId` through the chunk registry, so chain links are plain
//! atomic words that can be compare-and-swapped.
//!
//! A record cell is published exactly once by the transaction that owns its
//! chunk; after publication the only mutations are the one-time timestamp
//! finalization at commit/abort and chain-link updates during GC unlinking.
//! Physical chunk reuse is deferred by the garbage collector's two-pass
//! protocol, and the registry's `Arc` handles additionally keep a chunk
//! alive for any traversal still holding a reference.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::txn::timestamp::Timestamp;
use crate::Result;

use super::pool::RecordBufferPool;
use super::projection::ProjectedRow;
use super::{TableId, TupleSlot};

/// Packed undo record address: chunk id in the high half, cell index in the
/// low half
pub type UndoRecordId = u64;

/// Sentinel for "no record": the end of a version chain
pub const INVALID_UNDO_RECORD: UndoRecordId = u64::MAX;

fn pack_id(chunk: u32, cell: u32) -> UndoRecordId {
    ((chunk as u64) << 32) | cell as u64
}

fn unpack_id(id: UndoRecordId) -> (u32, u32) {
    ((id >> 32) as u32, id as u32)
}

// ============================================================================
// Undo Record
// ============================================================================

/// The before-image carried by an undo record
#[derive(Debug)]
pub enum UndoPayload {
    /// The tuple did not exist before this write (insert tombstone)
    Insert,
    /// Previous values of only the columns being overwritten
    Update(ProjectedRow),
    /// The full row as it was before deletion
    Delete(ProjectedRow),
}

/// One version-chain entry: the before-image of a single write.
///
/// `timestamp` holds the writing transaction's uncommitted marker until
/// commit/abort finalizes it. `next` points at the previously installed
/// record, forming the newest-first chain.
#[derive(Debug)]
pub struct UndoRecord {
    timestamp: AtomicU64,
    next: AtomicU64,
    table: TableId,
    slot: TupleSlot,
    payload: UndoPayload,
}

impl UndoRecord {
    fn new(
        timestamp: Timestamp,
        next: UndoRecordId,
        table: TableId,
        slot: TupleSlot,
        payload: UndoPayload,
    ) -> Self {
        Self {
            timestamp: AtomicU64::new(timestamp),
            next: AtomicU64::new(next),
            table,
            slot,
            payload,
        }
    }

    /// The record's current timestamp (uncommitted marker or finalized)
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Install the finalized commit/abort timestamp. Called exactly once.
    pub fn finalize(&self, timestamp: Timestamp) {
        self.timestamp.store(timestamp, Ordering::Release);
    }

    /// The next (older) record in the chain
    pub fn next(&self) -> UndoRecordId {
        self.next.load(Ordering::Acquire)
    }

    /// Swing this record's next pointer from `expected` to `new`. Used by
    /// the GC when unlinking an interior record.
    pub fn compare_and_swap_next(&self, expected: UndoRecordId, new: UndoRecordId) -> bool {
        self.next
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The table this record's tuple belongs to
    pub fn table(&self) -> TableId {
        self.table
    }

    /// The tuple this record versions
    pub fn slot(&self) -> TupleSlot {
        self.slot
    }

    /// The before-image
    pub fn payload(&self) -> &UndoPayload {
        &self.payload
    }
}

// ============================================================================
// Undo Chunk
// ============================================================================

/// A fixed-capacity array of undo record cells, drawn from the buffer pool.
/// Cells are published write-once by the owning transaction and read
/// lock-free afterwards.
#[derive(Debug)]
pub struct UndoChunk {
    cells: Box<[OnceCell<UndoRecord>]>,
}

impl UndoChunk {
    /// Create a chunk with `capacity` empty cells
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Number of record cells
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Publish a record into an empty cell. Owner-only.
    fn publish(&self, cell: u32, record: UndoRecord) {
        let ok = self.cells[cell as usize].set(record).is_ok();
        assert!(ok, "undo record cell published twice");
    }

    /// A published record.
    ///
    /// # Panics
    ///
    /// Panics if the cell was never published; chain links only ever point
    /// at published cells, so this indicates a bug.
    pub fn record(&self, cell: u32) -> &UndoRecord {
        self.cells[cell as usize]
            .get()
            .expect("chain link points at an unpublished undo record cell")
    }

    /// Clear every cell for reuse. Requires exclusive ownership (the pool
    /// only resets chunks no reader still references).
    pub fn reset(&mut self) {
        for cell in self.cells.iter_mut() {
            cell.take();
        }
    }
}

// ============================================================================
// Chunk Registry
// ============================================================================

/// Resolves packed record ids to live chunks.
///
/// Registration happens when a transaction draws a chunk; retirement happens
/// in the GC's deallocate phase, one full collection pass after the chunk's
/// records were unlinked. A traversal that resolved a handle before
/// retirement keeps the chunk alive through its `Arc`.
pub struct UndoChunkRegistry {
    chunks: RwLock<AHashMap<u32, Arc<UndoChunk>>>,
    next_id: AtomicU32,
}

/// A resolved record address: keeps the owning chunk alive while in use
pub struct RecordHandle {
    chunk: Arc<UndoChunk>,
    cell: u32,
}

impl RecordHandle {
    /// The record behind this handle
    pub fn record(&self) -> &UndoRecord {
        self.chunk.record(self.cell)
    }
}

impl UndoChunkRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(AHashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Register a chunk, returning its id
    pub fn register(&self, chunk: Arc<UndoChunk>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.chunks.write().insert(id, chunk);
        id
    }

    /// Resolve a record id. Returns `None` when the chunk has been retired,
    /// which a traversal treats as "everything from here on is older than
    /// the watermark".
    pub fn resolve(&self, id: UndoRecordId) -> Option<RecordHandle> {
        if id == INVALID_UNDO_RECORD {
            return None;
        }
        let (chunk_id, cell) = unpack_id(id);
        let chunk = self.chunks.read().get(&chunk_id).cloned()?;
        Some(RecordHandle { chunk, cell })
    }

    /// Remove a chunk from the registry, returning it for release to the
    /// pool. GC deallocate phase only.
    pub fn retire(&self, chunk_id: u32) -> Option<Arc<UndoChunk>> {
        self.chunks.write().remove(&chunk_id)
    }

    /// Number of registered chunks
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether no chunks are registered
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

impl Default for UndoChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Undo Buffer
// ============================================================================

/// Per-transaction, append-only sequence of undo records, packed into pool
/// chunks. Owned exclusively by one transaction for its lifetime; reachable
/// externally only through tuple version chains.
pub struct UndoBuffer {
    pool: Arc<RecordBufferPool>,
    registry: Arc<UndoChunkRegistry>,
    chunks: Vec<(u32, Arc<UndoChunk>)>,
    tail_used: usize,
    records: Vec<UndoRecordId>,
}

impl UndoBuffer {
    /// Create an empty buffer. No chunk is drawn until the first record.
    pub fn new(pool: Arc<RecordBufferPool>, registry: Arc<UndoChunkRegistry>) -> Self {
        Self {
            pool,
            registry,
            chunks: Vec::new(),
            tail_used: 0,
            records: Vec::new(),
        }
    }

    /// Reserve the next record cell and publish a record into it, drawing a
    /// fresh chunk from the pool when the tail chunk is full. A record
    /// always fits entirely within one chunk.
    ///
    /// The record is not yet tracked for rollback: the caller reports it
    /// with `mark_installed` once its chain-head CAS succeeds. A record
    /// whose CAS lost stays unreachable in its chunk and is reclaimed with
    /// the transaction.
    pub fn new_record(
        &mut self,
        timestamp: Timestamp,
        next: UndoRecordId,
        table: TableId,
        slot: TupleSlot,
        payload: UndoPayload,
    ) -> Result<UndoRecordId> {
        let tail_full = match self.chunks.last() {
            Some((_, chunk)) => self.tail_used == chunk.capacity(),
            None => true,
        };
        if tail_full {
            let chunk = self.pool.get_chunk()?;
            let id = self.registry.register(Arc::clone(&chunk));
            self.chunks.push((id, chunk));
            self.tail_used = 0;
        }

        let (chunk_id, chunk) = self.chunks.last().expect("tail chunk exists");
        let cell = self.tail_used as u32;
        self.tail_used += 1;
        chunk.publish(cell, UndoRecord::new(timestamp, next, table, slot, payload));

        Ok(pack_id(*chunk_id, cell))
    }

    /// Track a record whose chain installation succeeded
    pub fn mark_installed(&mut self, id: UndoRecordId) {
        self.records.push(id);
    }

    /// Whether this transaction has allocated any undo state
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Installed record ids in program order
    pub fn records(&self) -> &[UndoRecordId] {
        &self.records
    }

    /// Number of chunks drawn so far
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Consume the buffer, yielding its chunks and record list for handoff
    /// to the garbage collector.
    pub fn into_parts(self) -> (Vec<(u32, Arc<UndoChunk>)>, Vec<UndoRecordId>) {
        (self.chunks, self.records)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::PoolConfig;
    use crate::txn::timestamp::uncommitted;

    fn test_pool() -> Arc<RecordBufferPool> {
        Arc::new(RecordBufferPool::new(PoolConfig {
            chunk_records: 4,
            ..Default::default()
        }))
    }

    fn push_record(buffer: &mut UndoBuffer, n: u64) -> UndoRecordId {
        buffer
            .new_record(
                uncommitted(n),
                INVALID_UNDO_RECORD,
                1,
                TupleSlot::new(0, n as u32),
                UndoPayload::Insert,
            )
            .unwrap()
    }

    #[test]
    fn test_no_chunk_until_first_record() {
        let registry = Arc::new(UndoChunkRegistry::new());
        let buffer = UndoBuffer::new(test_pool(), Arc::clone(&registry));
        assert!(buffer.is_empty());
        assert_eq!(buffer.num_chunks(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_packing_fills_exactly_two_chunks() {
        let registry = Arc::new(UndoChunkRegistry::new());
        let mut buffer = UndoBuffer::new(test_pool(), Arc::clone(&registry));
        // Fill one chunk to its capacity boundary...
        for n in 0..4 {
            push_record(&mut buffer, n);
        }
        assert_eq!(buffer.num_chunks(), 1);
        // ...then one more record starts a second chunk
        push_record(&mut buffer, 4);
        assert_eq!(buffer.num_chunks(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolve_published_record() {
        let registry = Arc::new(UndoChunkRegistry::new());
        let mut buffer = UndoBuffer::new(test_pool(), Arc::clone(&registry));
        let id = push_record(&mut buffer, 9);

        let handle = registry.resolve(id).unwrap();
        let record = handle.record();
        assert_eq!(record.timestamp(), uncommitted(9));
        assert_eq!(record.slot(), TupleSlot::new(0, 9));
        assert_eq!(record.next(), INVALID_UNDO_RECORD);
    }

    #[test]
    fn test_resolve_after_retire_is_none() {
        let registry = Arc::new(UndoChunkRegistry::new());
        let mut buffer = UndoBuffer::new(test_pool(), Arc::clone(&registry));
        let id = push_record(&mut buffer, 1);

        let (chunks, _) = buffer.into_parts();
        for (chunk_id, _) in &chunks {
            registry.retire(*chunk_id).unwrap();
        }
        assert!(registry.resolve(id).is_none());
        assert!(registry.resolve(INVALID_UNDO_RECORD).is_none());
    }

    #[test]
    fn test_finalize_and_next_cas() {
        let registry = Arc::new(UndoChunkRegistry::new());
        let mut buffer = UndoBuffer::new(test_pool(), Arc::clone(&registry));
        let id = push_record(&mut buffer, 2);

        let handle = registry.resolve(id).unwrap();
        handle.record().finalize(17);
        assert_eq!(handle.record().timestamp(), 17);

        assert!(handle
            .record()
            .compare_and_swap_next(INVALID_UNDO_RECORD, 42));
        assert!(!handle.record().compare_and_swap_next(INVALID_UNDO_RECORD, 7));
        assert_eq!(handle.record().next(), 42);
    }
}
