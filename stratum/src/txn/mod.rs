//! Transaction subsystem - MVCC transaction lifecycle
//!
//! Provides BEGIN / COMMIT / ABORT semantics over the storage layer's
//! version chains.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  TimestampManager                                │
//! │  - one monotonic counter for start/commit times  │
//! │  - active set + cached oldest start time         │
//! ├──────────────────────────────────────────────────┤
//! │  TransactionContext                              │
//! │  - per-transaction undo/redo buffers             │
//! │  - durability policy, must-abort flag            │
//! ├──────────────────────────────────────────────────┤
//! │  TransactionManager                              │
//! │  - begin / commit / abort                        │
//! │  - undo replay on abort, redo handoff on commit  │
//! │  - completed-transaction queue for the GC        │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod manager;
pub mod timestamp;

pub use context::{DurabilityPolicy, TransactionContext, TransactionPolicy};
pub use manager::{FinishedTransaction, TransactionManager};
pub use timestamp::{Timestamp, TimestampManager};
