//! Redo records and the redo buffer
//!
//! Every write stages an after-image `RedoRecord`, serialized as a framed,
//! checksummed payload into the transaction's redo buffer. The buffer packs
//! frames into fixed-size pool segments; a filled segment is handed to the
//! log manager's flush queue when durability is enabled, or recycled
//! straight back to the pool when it is not. Logging is pay-as-you-go: a
//! transaction that never writes never draws a segment.
//!
//! Frame format (one record):
//! ```text
//! - payload_len: 4 bytes LE
//! - payload: bincode-serialized RedoRecord
//! - crc32: 4 bytes LE, over the payload
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::{ColumnId, Value};
use crate::txn::context::{DurabilityPolicy, TransactionPolicy};
use crate::txn::timestamp::Timestamp;
use crate::{Error, Result};

use super::log::LogManager;
use super::pool::{BufferSegment, RecordBufferPool};
use super::{TableId, TupleSlot};

/// Frame overhead: length prefix plus crc trailer
pub const FRAME_OVERHEAD: usize = 8;

// ============================================================================
// Redo Record
// ============================================================================

/// The operation carried by a redo record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RedoOp {
    /// New values for the listed columns (insert or update); `None` is NULL
    Write { columns: Vec<(ColumnId, Option<Value>)> },
    /// Tuple deletion
    Delete,
}

/// One write's after-image, queued for serialization to the log.
/// Read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoRecord {
    /// Start timestamp of the writing transaction
    pub txn_start: Timestamp,
    /// Table the write applies to
    pub table: TableId,
    /// Tuple the write applies to
    pub slot: TupleSlot,
    /// The after-image
    pub op: RedoOp,
}

/// Serialize a record into its frame
pub fn encode_frame(record: &RedoRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record).map_err(|e| Error::Serialization(e.to_string()))?;
    let crc = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decode every frame in a byte run, verifying checksums
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<RedoRecord>> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(Error::Serialization("truncated redo frame".to_string()));
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() < FRAME_OVERHEAD + len {
            return Err(Error::Serialization("truncated redo frame".to_string()));
        }
        let payload = &bytes[4..4 + len];
        let crc = u32::from_le_bytes(bytes[4 + len..8 + len].try_into().unwrap());
        if crc32fast::hash(payload) != crc {
            return Err(Error::Serialization("redo frame checksum mismatch".to_string()));
        }
        let record =
            bincode::deserialize(payload).map_err(|e| Error::Serialization(e.to_string()))?;
        records.push(record);
        bytes = &bytes[FRAME_OVERHEAD + len..];
    }
    Ok(records)
}

// ============================================================================
// Redo Buffer
// ============================================================================

/// Per-transaction redo staging buffer. See module docs.
pub struct RedoBuffer {
    pool: Arc<RecordBufferPool>,
    log: Option<Arc<LogManager>>,
    segment: Option<BufferSegment>,
    has_flushed: bool,
}

impl RedoBuffer {
    /// Create an empty buffer; `log` is `None` when logging is disabled
    /// engine-wide.
    pub fn new(pool: Arc<RecordBufferPool>, log: Option<Arc<LogManager>>) -> Self {
        Self {
            pool,
            log,
            segment: None,
            has_flushed: false,
        }
    }

    fn logging_enabled(&self, policy: &TransactionPolicy) -> bool {
        self.log.is_some() && policy.durability != DurabilityPolicy::Disable
    }

    /// Stage a record, drawing a fresh segment when the current one lacks
    /// room. The filled segment goes to the log manager's flush queue if
    /// durability is enabled for this transaction, otherwise back to the
    /// pool.
    pub fn stage(&mut self, record: &RedoRecord, policy: &TransactionPolicy) -> Result<()> {
        let frame = encode_frame(record)?;

        if self.segment.is_none() {
            // First write of the transaction
            self.segment = Some(self.pool.get_segment()?);
        } else if !self.segment.as_ref().unwrap().has_bytes_left(frame.len()) {
            let full = self.segment.take().unwrap();
            if self.logging_enabled(policy) {
                self.log.as_ref().unwrap().enqueue_segment(full, policy)?;
                self.has_flushed = true;
            } else {
                self.pool.release_segment(full);
            }
            self.segment = Some(self.pool.get_segment()?);
        }

        let segment = self.segment.as_mut().unwrap();
        assert!(
            segment.has_bytes_left(frame.len()),
            "staged redo record does not fit into a fresh segment"
        );
        segment.reserve(frame.len()).copy_from_slice(&frame);
        Ok(())
    }

    /// Flush or release the last partial segment. Called exactly once at
    /// transaction end: `flush` is true on commit, false on abort (abort
    /// discards the staged records).
    pub fn finalize(&mut self, flush: bool, policy: &TransactionPolicy) -> Result<()> {
        let Some(segment) = self.segment.take() else {
            // The transaction never wrote; nothing was ever allocated.
            return Ok(());
        };
        if flush && self.logging_enabled(policy) && !segment.is_empty() {
            self.log.as_ref().unwrap().enqueue_segment(segment, policy)?;
            self.has_flushed = true;
        } else {
            self.pool.release_segment(segment);
        }
        Ok(())
    }

    /// Whether any segment has been handed to the log manager
    pub fn has_flushed(&self) -> bool {
        self.has_flushed
    }

    /// Number of segments currently held (0 or 1)
    pub fn holds_segment(&self) -> bool {
        self.segment.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
