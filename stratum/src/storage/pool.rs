//! Record buffer pool
//!
//! The only allocation primitive used by undo/redo buffering. Vends two
//! fixed-size segment flavors from one budget: raw byte segments (redo
//! buffers pack serialized log frames into them) and undo chunks (arrays of
//! undo record cells). Segments are recycled through free lists; the pool
//! grows on demand up to a hard cap and then fails with
//! `Error::BufferPoolExhausted`, which forces the requesting transaction to
//! abort.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Error, Result};

use super::version::UndoChunk;

/// Default byte segment size (4 KiB); chosen large enough that any single
/// serialized redo record fits in one segment.
pub const DEFAULT_SEGMENT_BYTES: usize = 4096;

/// Default undo records per chunk
pub const DEFAULT_CHUNK_RECORDS: usize = 32;

/// Default number of free segments retained per flavor
const DEFAULT_REUSE_LIMIT: usize = 64;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of one byte segment
    pub segment_bytes: usize,
    /// Undo record cells per chunk
    pub chunk_records: usize,
    /// Free segments retained per flavor; extras are dropped on release
    pub reuse_limit: usize,
    /// Hard cap on live segments of both flavors combined
    pub hard_cap: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            chunk_records: DEFAULT_CHUNK_RECORDS,
            reuse_limit: DEFAULT_REUSE_LIMIT,
            hard_cap: usize::MAX,
        }
    }
}

// ============================================================================
// Byte Segment
// ============================================================================

/// A fixed-size byte segment. Records are packed contiguously; a record is
/// never split across two segments.
#[derive(Debug)]
pub struct BufferSegment {
    bytes: Box<[u8]>,
    len: usize,
}

impl BufferSegment {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Whether `size` more bytes fit in this segment
    pub fn has_bytes_left(&self, size: usize) -> bool {
        self.len + size <= self.bytes.len()
    }

    /// Reserve `size` bytes at the tail and return the writable region.
    ///
    /// # Panics
    ///
    /// Panics if the segment lacks room; callers check `has_bytes_left`
    /// first and request a fresh segment instead.
    pub fn reserve(&mut self, size: usize) -> &mut [u8] {
        assert!(self.has_bytes_left(size), "record does not fit in segment");
        let start = self.len;
        self.len += size;
        &mut self.bytes[start..start + size]
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the segment holds no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// The written portion of the segment
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}

// ============================================================================
// Record Buffer Pool
// ============================================================================

/// Thread-safe pool of reusable undo/redo segments. See module docs.
pub struct RecordBufferPool {
    config: PoolConfig,
    free_segments: Mutex<Vec<BufferSegment>>,
    free_chunks: Mutex<Vec<Arc<UndoChunk>>>,
    /// Live segments of both flavors (allocated, not sitting in a free list)
    outstanding: AtomicUsize,
    /// Total allocations that were served from a free list
    recycled_total: AtomicU64,
}

impl RecordBufferPool {
    /// Create a pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free_segments: Mutex::new(Vec::new()),
            free_chunks: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            recycled_total: AtomicU64::new(0),
        }
    }

    /// The pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn charge_one(&self) -> Result<()> {
        let prev = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if prev >= self.config.hard_cap {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::BufferPoolExhausted {
                outstanding: prev,
                cap: self.config.hard_cap,
            });
        }
        Ok(())
    }

    /// Get a byte segment, recycled or freshly allocated
    pub fn get_segment(&self) -> Result<BufferSegment> {
        self.charge_one()?;
        if let Some(seg) = self.free_segments.lock().pop() {
            self.recycled_total.fetch_add(1, Ordering::Relaxed);
            return Ok(seg);
        }
        Ok(BufferSegment::new(self.config.segment_bytes))
    }

    /// Return a byte segment to the free list
    pub fn release_segment(&self, mut segment: BufferSegment) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        segment.reset();
        let mut free = self.free_segments.lock();
        if free.len() < self.config.reuse_limit {
            free.push(segment);
        }
    }

    /// Get an undo chunk, recycled or freshly allocated
    pub fn get_chunk(&self) -> Result<Arc<UndoChunk>> {
        self.charge_one()?;
        if let Some(chunk) = self.free_chunks.lock().pop() {
            self.recycled_total.fetch_add(1, Ordering::Relaxed);
            return Ok(chunk);
        }
        Ok(Arc::new(UndoChunk::new(self.config.chunk_records)))
    }

    /// Return an undo chunk. The chunk is reset and retained only if no
    /// in-flight chain traversal still holds a reference to it; otherwise it
    /// is dropped and its memory freed when the last reader finishes.
    pub fn release_chunk(&self, mut chunk: Arc<UndoChunk>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if let Some(inner) = Arc::get_mut(&mut chunk) {
            inner.reset();
            let mut free = self.free_chunks.lock();
            if free.len() < self.config.reuse_limit {
                free.push(chunk);
            }
        }
    }

    /// Live segments of both flavors
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Allocations served from a free list
    pub fn recycled_total(&self) -> u64 {
        self.recycled_total.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================
