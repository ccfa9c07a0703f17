//! Block layout - per-table physical layout metadata
//!
//! Computed once at table creation and shared read-only by every block of
//! the table. Columns are ordered by attribute size, largest first (the
//! varlen class leads), so value arrays stay aligned to the natural 8-byte
//! word without per-column padding. All subsequent row and column accesses
//! are offset arithmetic against this layout; no layout computation happens
//! on the data path.

use crate::data::{ColumnId, DataType};

/// Default per-block arena budget, in 8-byte words (1 MiB)
const DEFAULT_BLOCK_WORDS: usize = 1 << 17;

/// Minimum tuple capacity of a block; capacities are rounded down to a
/// multiple of this so bitmap words are never partially owned.
const CAPACITY_GRANULE: u32 = 64;

// ============================================================================
// Column Spec
// ============================================================================

/// Description of one column, as supplied at table creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column ID (unique within the table; caller contract, not validated)
    pub id: ColumnId,
    /// Data type
    pub data_type: DataType,
}

impl ColumnSpec {
    /// Create a new column spec
    pub fn new(id: ColumnId, data_type: DataType) -> Self {
        Self { id, data_type }
    }
}

// ============================================================================
// Block Layout
// ============================================================================

/// Physical layout of one table's blocks.
///
/// Holds the size-ordered column ids, per-column word widths, and the word
/// offsets of every column's value array and null bitmap inside the block
/// arena.
#[derive(Debug)]
pub struct BlockLayout {
    col_ids: Vec<ColumnId>,
    types: Vec<DataType>,
    attr_words: Vec<usize>,
    value_offsets: Vec<usize>,
    bitmap_offsets: Vec<usize>,
    capacity: u32,
    arena_words: usize,
}

impl BlockLayout {
    /// Compute a layout for the given columns with the default block budget
    pub fn new(columns: &[ColumnSpec]) -> Self {
        Self::with_block_words(columns, DEFAULT_BLOCK_WORDS)
    }

    /// Compute a layout sized so the block arena fits `block_words` words
    pub fn with_block_words(columns: &[ColumnSpec], block_words: usize) -> Self {
        assert!(!columns.is_empty(), "a table must have at least one column");

        let mut sorted: Vec<ColumnSpec> = columns.to_vec();
        // Stable sort keeps declaration order among equal-sized columns
        sorted.sort_by(|a, b| b.data_type.attr_size().cmp(&a.data_type.attr_size()));

        let words_per_tuple: usize = sorted.iter().map(|c| c.data_type.attr_words()).sum();
        // Each tuple also owns one null bit per column; bitmaps are packed
        // into whole words per CAPACITY_GRANULE tuples.
        let bits_per_tuple = 64 * words_per_tuple + sorted.len();
        let mut capacity = ((block_words * 64) / bits_per_tuple) as u32;
        capacity -= capacity % CAPACITY_GRANULE;
        let capacity = capacity.max(CAPACITY_GRANULE);

        Self::with_capacity_ordered(sorted, capacity)
    }

    /// Compute a layout with an explicit tuple capacity per block (rounded
    /// up to a bitmap-word granule). Used by tests and by tables configured
    /// with small blocks.
    pub fn with_capacity(columns: &[ColumnSpec], capacity: u32) -> Self {
        let mut sorted: Vec<ColumnSpec> = columns.to_vec();
        sorted.sort_by(|a, b| b.data_type.attr_size().cmp(&a.data_type.attr_size()));
        let capacity = capacity.max(1).div_ceil(CAPACITY_GRANULE) * CAPACITY_GRANULE;
        Self::with_capacity_ordered(sorted, capacity)
    }

    fn with_capacity_ordered(sorted: Vec<ColumnSpec>, capacity: u32) -> Self {
        let bitmap_words_per_col = (capacity as usize).div_ceil(64);

        let mut value_offsets = Vec::with_capacity(sorted.len());
        let mut bitmap_offsets = Vec::with_capacity(sorted.len());
        let mut running = 0usize;
        for col in &sorted {
            value_offsets.push(running);
            running += col.data_type.attr_words() * capacity as usize;
        }
        for _ in &sorted {
            bitmap_offsets.push(running);
            running += bitmap_words_per_col;
        }

        Self {
            col_ids: sorted.iter().map(|c| c.id).collect(),
            types: sorted.iter().map(|c| c.data_type).collect(),
            attr_words: sorted.iter().map(|c| c.data_type.attr_words()).collect(),
            value_offsets,
            bitmap_offsets,
            capacity,
            arena_words: running,
        }
    }

    /// Number of columns
    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    /// Tuples per block
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Total block arena size, in words
    pub fn arena_words(&self) -> usize {
        self.arena_words
    }

    /// Column ids in physical (size-descending) order
    pub fn column_ids(&self) -> &[ColumnId] {
        &self.col_ids
    }

    /// Physical index of a column id
    pub fn col_index(&self, id: ColumnId) -> Option<usize> {
        self.col_ids.iter().position(|&c| c == id)
    }

    /// Data type of the column at a physical index
    pub fn data_type(&self, index: usize) -> DataType {
        self.types[index]
    }

    /// Words per attribute of the column at a physical index
    pub fn attr_words(&self, index: usize) -> usize {
        self.attr_words[index]
    }

    /// Word offset of a column's value array within the block arena
    pub fn value_offset(&self, index: usize) -> usize {
        self.value_offsets[index]
    }

    /// Word offset of a column's null bitmap within the block arena
    pub fn bitmap_offset(&self, index: usize) -> usize {
        self.bitmap_offsets[index]
    }
}

// ============================================================================
// Tests
// ============================================================================
