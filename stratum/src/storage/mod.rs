//! Storage subsystem - versioned tuple storage
//!
//! Physical layer of the engine:
//! - Packed block storage with per-column value arrays and null bitmaps
//! - Transient row/columnar projections over a subset of columns
//! - A segment pool feeding per-transaction undo/redo buffers
//! - Version chains of undo records for snapshot visibility and rollback
//! - A redo log manager and an epoch-deferred garbage collector
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  DataTable / Block                               │
//! │  - word-aligned column arrays, CAS bitmaps       │
//! │  - per-slot atomic version-chain heads           │
//! ├──────────────────────────────────────────────────┤
//! │  RecordBufferPool                                │
//! │  - fixed-size segments for undo/redo buffering   │
//! ├──────────────────────────────────────────────────┤
//! │  LogManager                                      │
//! │  - background writer draining redo segments      │
//! ├──────────────────────────────────────────────────┤
//! │  GarbageCollector                                │
//! │  - unlinks and reclaims versions below watermark │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod columns;
pub mod gc;
pub mod layout;
pub mod log;
pub mod pool;
pub mod projection;
pub mod redo;
pub mod table;
pub mod varlen;
pub mod version;

use serde::{Deserialize, Serialize};

pub use block::Block;
pub use columns::{ProjectedColumns, ProjectedColumnsInitializer, RowView, RowViewMut};
pub use gc::{GarbageCollector, GcConfig, GcThread};
pub use layout::{BlockLayout, ColumnSpec};
pub use log::{LogConfig, LogManager, LogReader};
pub use pool::{BufferSegment, PoolConfig, RecordBufferPool};
pub use projection::{ProjectedRow, ProjectedRowInitializer};
pub use redo::{RedoBuffer, RedoOp, RedoRecord};
pub use table::{DataTable, TableRegistry};
pub use varlen::{VarlenEntry, VarlenPool};
pub use version::{UndoBuffer, UndoChunk, UndoChunkRegistry, UndoPayload, UndoRecord, UndoRecordId};

/// Table identifier, unique within the engine
pub type TableId = u32;

/// Block identifier, unique within a table
pub type BlockId = u32;

// ============================================================================
// Tuple Slot
// ============================================================================

/// Stable address of one physical tuple: a block and an offset within it.
///
/// Never reused while any version chain entry still references it; immutable
/// once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleSlot {
    pub block: BlockId,
    pub offset: u32,
}

impl TupleSlot {
    /// Create a new tuple slot
    pub fn new(block: BlockId, offset: u32) -> Self {
        Self { block, offset }
    }

    /// Pack into a single word (block in the high half)
    pub fn to_word(self) -> u64 {
        ((self.block as u64) << 32) | self.offset as u64
    }

    /// Unpack from a single word
    pub fn from_word(word: u64) -> Self {
        Self {
            block: (word >> 32) as u32,
            offset: word as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_slot_pack_round_trip() {
        let slot = TupleSlot::new(7, 4095);
        assert_eq!(TupleSlot::from_word(slot.to_word()), slot);
    }
}
