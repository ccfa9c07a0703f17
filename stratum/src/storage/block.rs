//! Blocks - packed tuple storage
//!
//! A block holds up to `layout.capacity()` tuples in PAX form: one word
//! arena containing per-column value arrays followed by per-column null
//! bitmaps, plus block-level allocation and visibility bitmaps and the
//! per-slot version-chain heads. All shared mutation is atomic: values are
//! word stores, bitmap flips are atomic RMW, and chain heads are
//! compare-and-swapped.
//!
//! Synchronization contract: a writer fully captures its before-image and
//! publishes its undo record *before* the release-CAS on the chain head,
//! and only then stores new value words. Readers load the head with
//! acquire and correct any torn in-place read by applying before-images
//! during chain traversal, so value-word accesses themselves can be
//! relaxed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::layout::BlockLayout;
use super::projection::ProjectedRow;
use super::version::{UndoRecordId, INVALID_UNDO_RECORD};
use super::BlockId;

fn atomic_words(n: usize) -> Box<[AtomicU64]> {
    (0..n).map(|_| AtomicU64::new(0)).collect()
}

/// One block of tuple storage. See module docs.
pub struct Block {
    id: BlockId,
    layout: Arc<BlockLayout>,
    /// Value arrays and null bitmaps, at the layout's computed offsets
    words: Box<[AtomicU64]>,
    /// One bit per slot: slot has been handed out
    allocated: Box<[AtomicU64]>,
    /// One bit per slot: tuple is present in the current version
    visible: Box<[AtomicU64]>,
    /// Per-slot version chain heads
    version_heads: Box<[AtomicU64]>,
    /// Next never-used slot
    insert_cursor: AtomicU32,
}

impl Block {
    /// Create an empty block
    pub fn new(id: BlockId, layout: Arc<BlockLayout>) -> Self {
        let capacity = layout.capacity() as usize;
        let bitmap_words = capacity.div_ceil(64);
        let heads: Box<[AtomicU64]> = (0..capacity)
            .map(|_| AtomicU64::new(INVALID_UNDO_RECORD))
            .collect();
        Self {
            id,
            words: atomic_words(layout.arena_words()),
            allocated: atomic_words(bitmap_words),
            visible: atomic_words(bitmap_words),
            version_heads: heads,
            insert_cursor: AtomicU32::new(0),
            layout,
        }
    }

    /// Block id
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The table layout this block follows
    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    // ========================================================================
    // Slot allocation
    // ========================================================================

    /// Hand out the next unused slot, or `None` when the block is full.
    /// Slots are never reused.
    pub fn try_allocate(&self) -> Option<u32> {
        let offset = self.insert_cursor.fetch_add(1, Ordering::SeqCst);
        if offset >= self.layout.capacity() {
            return None;
        }
        self.allocated[offset as usize / 64].fetch_or(1 << (offset % 64), Ordering::AcqRel);
        Some(offset)
    }

    /// Whether a slot has been handed out
    pub fn is_allocated(&self, offset: u32) -> bool {
        self.allocated[offset as usize / 64].load(Ordering::Acquire) & (1 << (offset % 64)) != 0
    }

    /// Upper bound of allocated slot offsets, for scans
    pub fn allocation_high_water(&self) -> u32 {
        self.insert_cursor.load(Ordering::SeqCst).min(self.layout.capacity())
    }

    // ========================================================================
    // Visibility bitmap
    // ========================================================================

    /// Whether the slot's tuple is present in the current version
    pub fn is_visible(&self, offset: u32) -> bool {
        self.visible[offset as usize / 64].load(Ordering::Acquire) & (1 << (offset % 64)) != 0
    }

    /// Mark the slot's tuple present
    pub fn set_visible(&self, offset: u32) {
        self.visible[offset as usize / 64].fetch_or(1 << (offset % 64), Ordering::AcqRel);
    }

    /// Mark the slot's tuple deleted
    pub fn clear_visible(&self, offset: u32) {
        self.visible[offset as usize / 64].fetch_and(!(1 << (offset % 64)), Ordering::AcqRel);
    }

    // ========================================================================
    // Version chain head
    // ========================================================================

    /// Load the slot's chain head
    pub fn head(&self, offset: u32) -> UndoRecordId {
        self.version_heads[offset as usize].load(Ordering::Acquire)
    }

    /// Swing the slot's chain head from `expected` to `new`. Failure means a
    /// concurrent writer won the race.
    pub fn compare_and_swap_head(
        &self,
        offset: u32,
        expected: UndoRecordId,
        new: UndoRecordId,
    ) -> bool {
        self.version_heads[offset as usize]
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ========================================================================
    // Attribute access
    // ========================================================================

    fn value_index(&self, col: usize, offset: u32) -> usize {
        self.layout.value_offset(col) + self.layout.attr_words(col) * offset as usize
    }

    /// Whether the attribute is NULL (its presence bit is clear)
    pub fn is_null(&self, col: usize, offset: u32) -> bool {
        let word = self.layout.bitmap_offset(col) + offset as usize / 64;
        self.words[word].load(Ordering::Relaxed) & (1 << (offset % 64)) == 0
    }

    fn set_not_null(&self, col: usize, offset: u32) {
        let word = self.layout.bitmap_offset(col) + offset as usize / 64;
        self.words[word].fetch_or(1 << (offset % 64), Ordering::Relaxed);
    }

    fn set_null(&self, col: usize, offset: u32) {
        let word = self.layout.bitmap_offset(col) + offset as usize / 64;
        self.words[word].fetch_and(!(1 << (offset % 64)), Ordering::Relaxed);
    }

    /// Copy the columns of the slot's current version into a projected row,
    /// including null bits. Columns absent from the block layout are a
    /// caller error.
    pub fn read_row(&self, offset: u32, out: &mut ProjectedRow) {
        for idx in 0..out.num_columns() {
            let id = out.column_ids()[idx];
            let col = self
                .layout
                .col_index(id)
                .expect("projection references a column the table does not have");
            if self.is_null(col, offset) {
                out.set_null(idx);
            } else {
                let start = self.value_index(col, offset);
                let words = out.access_force_not_null(idx);
                for (i, word) in words.iter_mut().enumerate() {
                    *word = self.words[start + i].load(Ordering::Relaxed);
                }
            }
        }
    }

    /// Write the columns of a projected row into the slot's current
    /// version, including null bits.
    pub fn write_row(&self, offset: u32, row: &ProjectedRow) {
        for idx in 0..row.num_columns() {
            let id = row.column_ids()[idx];
            let col = self
                .layout
                .col_index(id)
                .expect("projection references a column the table does not have");
            match row.access_with_null_check(idx) {
                Some(words) => {
                    let start = self.value_index(col, offset);
                    for (i, word) in words.iter().enumerate() {
                        self.words[start + i].store(*word, Ordering::Relaxed);
                    }
                    self.set_not_null(col, offset);
                }
                None => self.set_null(col, offset),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
