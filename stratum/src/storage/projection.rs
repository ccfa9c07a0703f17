//! Projected rows
//!
//! A `ProjectedRow` is a transient, self-describing image of one tuple over
//! a subset of a table's columns: a flat word arena holding the null bitmap
//! followed by the value words, plus a shared offset table computed once by
//! a `ProjectedRowInitializer`. Produced fresh for each access, never
//! persisted. The same row is used as a write image by the execution layer
//! and as a before-image inside undo records.

use std::sync::Arc;

use crate::data::{ColumnId, DataType, Value};

use super::layout::{BlockLayout, ColumnSpec};
use super::varlen::{VarlenEntry, VarlenPool};

// ============================================================================
// Row Layout
// ============================================================================

/// Shared offset table for projected rows of one projection list.
///
/// Column ids within one projection must be unique; duplicates are a caller
/// error and are not validated here.
#[derive(Debug)]
pub struct RowLayout {
    col_ids: Vec<ColumnId>,
    types: Vec<DataType>,
    /// Absolute word offset of each column's value in the arena
    offsets: Vec<usize>,
    bitmap_words: usize,
    total_words: usize,
}

impl RowLayout {
    fn from_ordered(cols: Vec<(ColumnId, DataType)>) -> Self {
        let bitmap_words = cols.len().div_ceil(64);
        let mut offsets = Vec::with_capacity(cols.len());
        let mut running = bitmap_words;
        for (_, ty) in &cols {
            offsets.push(running);
            running += ty.attr_words();
        }
        Self {
            col_ids: cols.iter().map(|(id, _)| *id).collect(),
            types: cols.iter().map(|(_, ty)| *ty).collect(),
            offsets,
            bitmap_words,
            total_words: running,
        }
    }

    /// Number of columns in the projection list
    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    /// Column ids in projection order
    pub fn column_ids(&self) -> &[ColumnId] {
        &self.col_ids
    }

    /// Data type of the column at a projection index
    pub fn data_type(&self, index: usize) -> DataType {
        self.types[index]
    }

    /// Projection index of a column id
    pub fn index_of(&self, id: ColumnId) -> Option<usize> {
        self.col_ids.iter().position(|&c| c == id)
    }
}

// ============================================================================
// Initializer
// ============================================================================

/// Precomputed recipe for building projected rows of one projection list.
///
/// Computing the layout is more expensive than using it; get an initializer
/// once and reuse it for every row of the same projection.
#[derive(Debug, Clone)]
pub struct ProjectedRowInitializer {
    layout: Arc<RowLayout>,
}

impl ProjectedRowInitializer {
    /// Build an initializer from raw column specs. Columns are reordered by
    /// attribute size (largest first) to match block storage order.
    pub fn new(columns: &[ColumnSpec]) -> Self {
        let mut sorted: Vec<ColumnSpec> = columns.to_vec();
        sorted.sort_by(|a, b| b.data_type.attr_size().cmp(&a.data_type.attr_size()));
        let cols = sorted.iter().map(|c| (c.id, c.data_type)).collect();
        Self {
            layout: Arc::new(RowLayout::from_ordered(cols)),
        }
    }

    /// Build an initializer for a subset of a block layout's columns,
    /// preserving the block's physical column order.
    pub fn from_block_layout(layout: &BlockLayout, col_ids: &[ColumnId]) -> Self {
        let cols = layout
            .column_ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| col_ids.contains(id))
            .map(|(idx, id)| (*id, layout.data_type(idx)))
            .collect();
        Self {
            layout: Arc::new(RowLayout::from_ordered(cols)),
        }
    }

    /// Build a fresh row with every column set to NULL
    pub fn initialize(&self) -> ProjectedRow {
        ProjectedRow {
            layout: Arc::clone(&self.layout),
            words: vec![0u64; self.layout.total_words].into_boxed_slice(),
        }
    }

    /// Size of a row built by this initializer, in words
    pub fn row_words(&self) -> usize {
        self.layout.total_words
    }

    /// Number of columns in the projection list
    pub fn num_columns(&self) -> usize {
        self.layout.num_columns()
    }

    /// The shared row layout
    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }
}

// ============================================================================
// Projected Row
// ============================================================================

/// A partial image of one tuple. See the module docs.
#[derive(Debug)]
pub struct ProjectedRow {
    layout: Arc<RowLayout>,
    words: Box<[u64]>,
}

impl Clone for ProjectedRow {
    fn clone(&self) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            words: self.words.clone(),
        }
    }
}

impl ProjectedRow {
    /// Number of columns stored in this row
    pub fn num_columns(&self) -> usize {
        self.layout.num_columns()
    }

    /// Column ids in projection order
    pub fn column_ids(&self) -> &[ColumnId] {
        self.layout.column_ids()
    }

    /// The shared row layout
    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    /// Data type of the column at a projection index
    pub fn data_type(&self, index: usize) -> DataType {
        self.layout.data_type(index)
    }

    /// Check if the attribute at a projection index is NULL
    pub fn is_null(&self, index: usize) -> bool {
        assert!(index < self.num_columns(), "column offset out of bounds");
        self.words[index / 64] & (1 << (index % 64)) == 0
    }

    /// Set the attribute at a projection index to NULL
    pub fn set_null(&mut self, index: usize) {
        assert!(index < self.num_columns(), "column offset out of bounds");
        self.words[index / 64] &= !(1 << (index % 64));
    }

    /// Mark the attribute at a projection index as not NULL
    pub fn set_not_null(&mut self, index: usize) {
        assert!(index < self.num_columns(), "column offset out of bounds");
        self.words[index / 64] |= 1 << (index % 64);
    }

    /// The raw value words of a column, regardless of its null bit
    pub fn value_words(&self, index: usize) -> &[u64] {
        let off = self.layout.offsets[index];
        &self.words[off..off + self.layout.types[index].attr_words()]
    }

    /// Access a column's value words, checking the null bitmap first.
    /// Returns `None` when the attribute is NULL.
    pub fn access_with_null_check(&self, index: usize) -> Option<&[u64]> {
        if self.is_null(index) {
            return None;
        }
        Some(self.value_words(index))
    }

    /// Access a column's value words for writing without a null check.
    /// Clears the NULL bit as a side effect; used when the caller is about
    /// to unconditionally overwrite the slot.
    pub fn access_force_not_null(&mut self, index: usize) -> &mut [u64] {
        self.set_not_null(index);
        let off = self.layout.offsets[index];
        let words = self.layout.types[index].attr_words();
        &mut self.words[off..off + words]
    }

    /// Copy value words into a column and mark it not NULL
    pub fn set_words(&mut self, index: usize, words: &[u64]) {
        self.access_force_not_null(index).copy_from_slice(words);
    }

    /// Write a typed value into a column.
    ///
    /// Varlen values are staged through the pool; the staged entry becomes
    /// owned by the table once the row is written into it.
    pub fn set(&mut self, index: usize, value: &Value, varlen: &VarlenPool) {
        assert_eq!(
            value.data_type(),
            self.layout.types[index],
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

    /// Read a typed value from a column; `None` when NULL
    pub fn get(&self, index: usize, varlen: &VarlenPool) -> Option<Value> {
        let words = self.access_with_null_check(index)?;
        Some(match self.layout.types[index] {
            DataType::Varchar => {
                let entry = VarlenEntry::from_words([words[0], words[1]]);
                let bytes = varlen.read(entry);
                Value::Varchar(String::from_utf8_lossy(&bytes).into_owned())
            }
            ty => Value::from_word(ty, words[0]),
        })
    }

    /// Copy every column of `other` that also appears in this projection,
    /// including its null bit. Used when applying before-images during
    /// version-chain traversal.
    pub fn copy_intersection_from(&mut self, other: &ProjectedRow) {
        for (other_idx, id) in other.column_ids().iter().enumerate() {
            if let Some(idx) = self.layout.index_of(*id) {
                match other.access_with_null_check(other_idx) {
                    Some(words) => self.set_words(idx, words),
                    None => self.set_null(idx),
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
