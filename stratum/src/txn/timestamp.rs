//! Timestamp manager
//!
//! Issues monotonically increasing logical timestamps and tracks the start
//! timestamps of currently running transactions. Start and commit
//! timestamps are drawn from the same counter, so commit order is a total
//! order.
//!
//! Timestamp encoding: a plain counter value is a committed timestamp. The
//! high bit marks "uncommitted, owned by the transaction whose start time
//! is in the low bits"; such a value compares greater than every committed
//! timestamp, which lets writers detect write-write conflicts by timestamp
//! comparison alone.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// 64-bit logical clock value
pub type Timestamp = u64;

/// First timestamp ever issued
pub const INITIAL_TIMESTAMP: Timestamp = 1;

/// High bit marking an in-progress (uncommitted) writer's timestamp
const UNCOMMITTED_FLAG: u64 = 1 << 63;

/// The uncommitted marker for a transaction with the given start time
pub fn uncommitted(start: Timestamp) -> Timestamp {
    start | UNCOMMITTED_FLAG
}

/// Whether a timestamp is a committed (finalized, non-marker) value
pub fn is_committed(ts: Timestamp) -> bool {
    ts & UNCOMMITTED_FLAG == 0
}

// ============================================================================
// Timestamp Manager
// ============================================================================

/// Issues timestamps and tracks active transactions.
///
/// The active-set mutation is the only serialized critical section on the
/// transaction hot path; it inserts or erases a single value, so it is
/// guarded by a `parking_lot::Mutex`, which spins before parking.
pub struct TimestampManager {
    /// Next timestamp to issue
    time: AtomicU64,
    /// Start timestamps of currently running transactions
    active: Mutex<BTreeSet<Timestamp>>,
    /// Cached result of the last oldest-active scan. Never an overestimate
    /// of the true oldest active start time.
    cached_oldest: AtomicU64,
}

impl TimestampManager {
    /// Create a new timestamp manager
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(INITIAL_TIMESTAMP),
            active: Mutex::new(BTreeSet::new()),
            cached_oldest: AtomicU64::new(INITIAL_TIMESTAMP),
        }
    }

    /// Issue a start timestamp and register it in the active set.
    ///
    /// Issuance and registration happen under one latch so a concurrent
    /// oldest-active scan can never miss a transaction that was issued but
    /// not yet registered.
    pub fn begin_transaction(&self) -> Timestamp {
        let mut active = self.active.lock();
        let ts = self.time.fetch_add(1, Ordering::SeqCst);
        active.insert(ts);
        ts
    }

    /// Issue a timestamp without registering it (commit/abort times)
    pub fn checkout_timestamp(&self) -> Timestamp {
        self.time.fetch_add(1, Ordering::SeqCst)
    }

    /// The current value of the clock, without advancing it
    pub fn current_time(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }

    /// Remove a transaction from the active set.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is not present; erasing an unknown
    /// transaction is a bug, never a silent no-op.
    pub fn remove_transaction(&self, ts: Timestamp) {
        let removed = self.active.lock().remove(&ts);
        assert!(removed, "removed timestamp {} was not in the active set", ts);
    }

    /// Remove several transactions from the active set; returns true if the
    /// set is empty afterwards.
    ///
    /// # Panics
    ///
    /// Panics if any timestamp is not present.
    pub fn remove_transactions(&self, timestamps: &[Timestamp]) -> bool {
        let mut active = self.active.lock();
        for ts in timestamps {
            let removed = active.remove(ts);
            assert!(removed, "removed timestamp {} was not in the active set", ts);
        }
        active.is_empty()
    }

    /// Scan the active set for the oldest start time, cache it, and return
    /// it. With no active transactions, returns the current clock value.
    pub fn oldest_transaction_start_time(&self) -> Timestamp {
        let active = self.active.lock();
        let oldest = active
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.time.load(Ordering::SeqCst));
        self.cached_oldest.store(oldest, Ordering::SeqCst);
        oldest
    }

    /// The last cached oldest start time, without scanning. May be stale,
    /// but is always at or below the true oldest active start time, so it
    /// can never justify unsafe reclamation.
    pub fn cached_oldest_transaction_start_time(&self) -> Timestamp {
        self.cached_oldest.load(Ordering::SeqCst)
    }

    /// Number of active transactions
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for TimestampManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
