//! Log manager - durable redo logging
//!
//! Consumes filled redo segments and persists them to an append-only log
//! file. The handoff is asynchronous: callers enqueue a segment and
//! continue; a background writer thread drains the queue, appends segment
//! bytes, and returns segments to the pool. `force_flush` blocks until
//! everything enqueued so far is durable, and is used by transactions
//! committing under a synchronous durability policy. `persist_and_stop`
//! drains, syncs, and joins the writer at shutdown.
//!
//! File format:
//! ```text
//! +----------------+-------------------+-------------------+
//! | Header (16B)   | Redo frame 1      | Redo frame 2 ...  |
//! +----------------+-------------------+-------------------+
//!
//! Header:
//! - magic: 4 bytes "SLOG"
//! - version: 2 bytes
//! - reserved: 10 bytes
//! ```
//! Frames are the redo buffer's length-prefixed, crc-checked records;
//! segment boundaries leave no trace in the file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::txn::context::{DurabilityPolicy, TransactionPolicy};
use crate::{Error, Result};

use super::pool::{BufferSegment, RecordBufferPool};
use super::redo::{decode_frames, RedoRecord};

/// Log file magic bytes
const LOG_MAGIC: &[u8; 4] = b"SLOG";
/// Log format version
const LOG_VERSION: u16 = 1;
/// Log file header size
const LOG_HEADER_SIZE: usize = 16;
/// Writer buffer size
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Log Configuration
// ============================================================================

/// Log manager configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path of the log file
    pub path: PathBuf,
    /// Whether every drained batch is fsynced. When false, only batches
    /// containing a synchronous-commit segment (and force flushes) sync.
    pub sync_on_flush: bool,
}

impl LogConfig {
    /// Config with default policies for the given log path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_on_flush: true,
        }
    }
}

// ============================================================================
// Log Manager
// ============================================================================

struct LogState {
    queue: VecDeque<BufferSegment>,
    /// Segments enqueued / written to the OS / known durable
    enqueued: u64,
    written: u64,
    synced: u64,
    /// The next drained batch must end with an fsync
    sync_request: bool,
    shutdown: bool,
}

/// Asynchronous redo log writer. See module docs.
pub struct LogManager {
    config: LogConfig,
    state: Mutex<LogState>,
    work_cv: Condvar,
    done_cv: Condvar,
    pool: Arc<RecordBufferPool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Open (or create) the log file and start the writer thread
    pub fn new(config: LogConfig, pool: Arc<RecordBufferPool>) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        if file.metadata()?.len() == 0 {
            let mut header = [0u8; LOG_HEADER_SIZE];
            header[0..4].copy_from_slice(LOG_MAGIC);
            header[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
        }

        let manager = Arc::new(Self {
            config,
            state: Mutex::new(LogState {
                queue: VecDeque::new(),
                enqueued: 0,
                written: 0,
                synced: 0,
                sync_request: false,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            pool,
            worker: Mutex::new(None),
        });

        let handle = {
            let manager = Arc::clone(&manager);
            std::thread::Builder::new()
                .name("stratum-log".to_string())
                .spawn(move || manager.run_writer(file))?
        };
        *manager.worker.lock() = Some(handle);
        Ok(manager)
    }

    /// Add a filled segment to the flush queue. The calling thread does not
    /// wait for persistence; a synchronous durability policy requests an
    /// fsync for the batch the segment lands in.
    pub fn enqueue_segment(
        &self,
        segment: BufferSegment,
        policy: &TransactionPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::LogClosed);
        }
        state.queue.push_back(segment);
        state.enqueued += 1;
        if policy.durability == DurabilityPolicy::Sync {
            state.sync_request = true;
        }
        self.work_cv.notify_one();
        Ok(())
    }

    /// Block until every segment enqueued before this call is durable
    pub fn force_flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::LogClosed);
        }
        let target = state.enqueued;
        if state.synced >= target {
            return Ok(());
        }
        state.sync_request = true;
        self.work_cv.notify_one();
        while state.synced < target && !state.shutdown {
            self.done_cv.wait(&mut state);
        }
        Ok(())
    }

    /// Drain the queue, sync, and stop the writer thread. Idempotent;
    /// further enqueues fail with `Error::LogClosed`.
    pub fn persist_and_stop(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.sync_request = true;
            self.work_cv.notify_one();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Segments made durable so far
    pub fn synced_segments(&self) -> u64 {
        self.state.lock().synced
    }

    fn run_writer(&self, file: File) {
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        loop {
            let (batch, do_sync) = {
                let mut state = self.state.lock();
                loop {
                    if !state.queue.is_empty() || (state.sync_request && state.synced < state.written)
                    {
                        break;
                    }
                    if state.shutdown {
                        self.done_cv.notify_all();
                        return;
                    }
                    state.sync_request = false;
                    self.work_cv.wait(&mut state);
                }
                let batch: Vec<BufferSegment> = state.queue.drain(..).collect();
                let do_sync = state.sync_request || self.config.sync_on_flush;
                state.sync_request = false;
                (batch, do_sync)
            };

            let count = batch.len() as u64;
            for segment in batch {
                if let Err(e) = writer.write_all(segment.as_slice()) {
                    // Durability of this batch is lost; reclamation and the
                    // engine itself keep running.
                    log::error!("log write failed: {}", e);
                }
                self.pool.release_segment(segment);
            }
            if do_sync {
                let flushed = writer.flush();
                if let Err(e) = flushed.and_then(|_| writer.get_ref().sync_all()) {
                    log::error!("log sync failed: {}", e);
                }
            }

            let mut state = self.state.lock();
            state.written += count;
            if do_sync {
                state.synced = state.written;
            }
            self.done_cv.notify_all();
        }
    }
}

// ============================================================================
// Log Reader
// ============================================================================

/// Reads a log file back as redo records; used by tests and tooling
pub struct LogReader;

impl LogReader {
    /// Read and verify every frame in the log file
    pub fn read_all(path: &Path) -> Result<Vec<RedoRecord>> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < LOG_HEADER_SIZE || &bytes[0..4] != LOG_MAGIC {
            return Err(Error::Serialization("invalid log header".to_string()));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != LOG_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported log version {}",
                version
            )));
        }
        decode_frames(&bytes[LOG_HEADER_SIZE..])
    }
}

// ============================================================================
// Tests
// ============================================================================
