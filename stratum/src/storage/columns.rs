//! Projected columns (PAX)
//!
//! `ProjectedColumns` is the many-tuple counterpart of `ProjectedRow`:
//! partial images of up to `max_tuples` tuples laid out column-major for
//! scan efficiency. The buffer holds a header (tuple counts and the offset
//! table), an array of tuple slots, and then per column a null bitmap sized
//! to the maximum tuple count followed by a contiguous value array.
//! `RowView` / `RowViewMut` are zero-copy indexes into the buffer exposing
//! the projected-row interface for one row offset.

use std::sync::Arc;

use crate::data::{ColumnId, DataType, Value};

use super::layout::BlockLayout;
use super::projection::ProjectedRow;
use super::varlen::{VarlenEntry, VarlenPool};
use super::TupleSlot;

// ============================================================================
// Columns Layout
// ============================================================================

/// Shared offset table for one columnar projection
#[derive(Debug)]
pub struct ColumnsLayout {
    col_ids: Vec<ColumnId>,
    types: Vec<DataType>,
    /// Absolute word offset of each column's value array in the arena
    value_offsets: Vec<usize>,
    /// Absolute word offset of each column's null bitmap in the arena
    bitmap_offsets: Vec<usize>,
    max_tuples: u32,
    total_words: usize,
}

impl ColumnsLayout {
    fn from_ordered(cols: Vec<(ColumnId, DataType)>, max_tuples: u32) -> Self {
        let bitmap_words = (max_tuples as usize).div_ceil(64);
        let mut value_offsets = Vec::with_capacity(cols.len());
        let mut bitmap_offsets = Vec::with_capacity(cols.len());
        let mut running = 0usize;
        for (_, ty) in &cols {
            bitmap_offsets.push(running);
            running += bitmap_words;
            value_offsets.push(running);
            running += ty.attr_words() * max_tuples as usize;
        }
        Self {
            col_ids: cols.iter().map(|(id, _)| *id).collect(),
            types: cols.iter().map(|(_, ty)| *ty).collect(),
            value_offsets,
            bitmap_offsets,
            max_tuples,
            total_words: running,
        }
    }

    /// Projection index of a column id
    pub fn index_of(&self, id: ColumnId) -> Option<usize> {
        self.col_ids.iter().position(|&c| c == id)
    }
}

// ============================================================================
// Initializer
// ============================================================================

/// Precomputed recipe for building columnar projections
#[derive(Debug, Clone)]
pub struct ProjectedColumnsInitializer {
    layout: Arc<ColumnsLayout>,
}

impl ProjectedColumnsInitializer {
    /// Build an initializer for a subset of a block layout's columns,
    /// preserving the block's physical column order.
    pub fn from_block_layout(layout: &BlockLayout, col_ids: &[ColumnId], max_tuples: u32) -> Self {
        assert!(max_tuples > 0, "a columnar projection must hold at least one tuple");
        let cols = layout
            .column_ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| col_ids.contains(id))
            .map(|(idx, id)| (*id, layout.data_type(idx)))
            .collect();
        Self {
            layout: Arc::new(ColumnsLayout::from_ordered(cols, max_tuples)),
        }
    }

    /// Build a fresh, empty columnar projection
    pub fn initialize(&self) -> ProjectedColumns {
        let max = self.layout.max_tuples as usize;
        ProjectedColumns {
            layout: Arc::clone(&self.layout),
            slots: vec![TupleSlot::new(0, 0); max].into_boxed_slice(),
            num_tuples: 0,
            words: vec![0u64; self.layout.total_words].into_boxed_slice(),
        }
    }

    /// Size of the value/bitmap arena, in words
    pub fn arena_words(&self) -> usize {
        self.layout.total_words
    }
}

// ============================================================================
// Projected Columns
// ============================================================================

/// Partial images of a collection of tuples, column-major. See module docs.
///
/// Invariant: `num_tuples <= max_tuples`, and materialized tuples are always
/// packed into row offsets `[0, num_tuples)`.
#[derive(Debug)]
pub struct ProjectedColumns {
    layout: Arc<ColumnsLayout>,
    slots: Box<[TupleSlot]>,
    num_tuples: u32,
    words: Box<[u64]>,
}

impl ProjectedColumns {
    /// Number of columns in the projection list
    pub fn num_columns(&self) -> usize {
        self.layout.col_ids.len()
    }

    /// Column ids in projection order
    pub fn column_ids(&self) -> &[ColumnId] {
        &self.layout.col_ids
    }

    /// Maximum number of tuples this buffer can hold
    pub fn max_tuples(&self) -> u32 {
        self.layout.max_tuples
    }

    /// Number of tuples currently materialized
    pub fn num_tuples(&self) -> u32 {
        self.num_tuples
    }

    /// Set the number of materialized tuples
    pub fn set_num_tuples(&mut self, n: u32) {
        assert!(n <= self.layout.max_tuples, "num_tuples exceeds max_tuples");
        self.num_tuples = n;
    }

    /// The tuple slot materialized at a row offset
    pub fn tuple_slot(&self, row: u32) -> TupleSlot {
        assert!(row < self.num_tuples, "row offset out of bounds");
        self.slots[row as usize]
    }

    /// Record the tuple slot for a row offset
    pub fn set_tuple_slot(&mut self, row: u32, slot: TupleSlot) {
        assert!(row < self.layout.max_tuples, "row offset out of bounds");
        self.slots[row as usize] = slot;
    }

    /// A read-only view of one row offset
    pub fn row_view(&self, row: u32) -> RowView<'_> {
        assert!(row < self.num_tuples, "row offset out of bounds");
        RowView { cols: self, row }
    }

    /// A writable view of one row offset (the offset need not be
    /// materialized yet; writers fill rows before bumping `num_tuples`)
    pub fn row_view_mut(&mut self, row: u32) -> RowViewMut<'_> {
        assert!(row < self.layout.max_tuples, "row offset out of bounds");
        RowViewMut { cols: self, row }
    }

    /// Copy every column of `row` that also appears in this projection into
    /// the given row offset, including null bits.
    pub fn copy_from_row(&mut self, row: u32, source: &ProjectedRow) {
        for (src_idx, id) in source.column_ids().iter().enumerate() {
            if let Some(idx) = self.layout.index_of(*id) {
                match source.access_with_null_check(src_idx) {
                    Some(words) => {
                        let owned: Vec<u64> = words.to_vec();
                        self.row_view_mut(row).set_words(idx, &owned);
                    }
                    None => self.row_view_mut(row).set_null(idx),
                }
            }
        }
    }

    fn bitmap_bit(&self, col: usize, row: u32) -> bool {
        let word = self.layout.bitmap_offsets[col] + (row as usize) / 64;
        self.words[word] & (1 << (row % 64)) != 0
    }

    fn value_range(&self, col: usize, row: u32) -> std::ops::Range<usize> {
        let width = self.layout.types[col].attr_words();
        let start = self.layout.value_offsets[col] + width * row as usize;
        start..start + width
    }
}

// ============================================================================
// Row Views
// ============================================================================

/// Zero-copy read view of one row inside a `ProjectedColumns` buffer
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    cols: &'a ProjectedColumns,
    row: u32,
}

impl<'a> RowView<'a> {
    /// Number of columns stored in the underlying projection
    pub fn num_columns(&self) -> usize {
        self.cols.num_columns()
    }

    /// Column ids in projection order
    pub fn column_ids(&self) -> &[ColumnId] {
        self.cols.column_ids()
    }

    /// Check if the attribute at a projection index is NULL
    pub fn is_null(&self, index: usize) -> bool {
        assert!(index < self.num_columns(), "column offset out of bounds");
        !self.cols.bitmap_bit(index, self.row)
    }

    /// Access a column's value words, checking the null bitmap first
    pub fn access_with_null_check(&self, index: usize) -> Option<&'a [u64]> {
        if self.is_null(index) {
            return None;
        }
        Some(&self.cols.words[self.cols.value_range(index, self.row)])
    }

    /// Read a typed value; `None` when NULL
    pub fn get(&self, index: usize, varlen: &VarlenPool) -> Option<Value> {
        let words = self.access_with_null_check(index)?;
        Some(match self.cols.layout.types[index] {
            DataType::Varchar => {
                let entry = VarlenEntry::from_words([words[0], words[1]]);
                Value::Varchar(String::from_utf8_lossy(&varlen.read(entry)).into_owned())
            }
            ty => Value::from_word(ty, words[0]),
        })
    }
}

/// Writable view of one row inside a `ProjectedColumns` buffer
pub struct RowViewMut<'a> {
    cols: &'a mut ProjectedColumns,
    row: u32,
}

impl<'a> RowViewMut<'a> {
    /// Set the attribute at a projection index to NULL
    pub fn set_null(&mut self, index: usize) {
        assert!(index < self.cols.num_columns(), "column offset out of bounds");
        let word = self.cols.layout.bitmap_offsets[index] + (self.row as usize) / 64;
        self.cols.words[word] &= !(1 << (self.row % 64));
    }

    /// Mark the attribute at a projection index as not NULL
    pub fn set_not_null(&mut self, index: usize) {
        assert!(index < self.cols.num_columns(), "column offset out of bounds");
        let word = self.cols.layout.bitmap_offsets[index] + (self.row as usize) / 64;
        self.cols.words[word] |= 1 << (self.row % 64);
    }

    /// Access a column's value words for writing, clearing the NULL bit
    pub fn access_force_not_null(&mut self, index: usize) -> &mut [u64] {
        self.set_not_null(index);
        let range = self.cols.value_range(index, self.row);
        &mut self.cols.words[range]
    }

    /// Copy value words into a column and mark it not NULL
    pub fn set_words(&mut self, index: usize, words: &[u64]) {
        self.access_force_not_null(index).copy_from_slice(words);
    }

    /// Write a typed value into a column
    pub fn set(&mut self, index: usize, value: &Value, varlen: &VarlenPool) {
        assert_eq!(
            value.data_type(),
            self.cols.layout.types[index],
            "value type does not match column type"
        );
        match value {
            Value::Varchar(s) => {
                let entry = varlen.stage(s.as_bytes());
                self.set_words(index, &entry.to_words());
            }
            fixed => {
                self.access_force_not_null(index)[0] = fixed.to_word();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
