//! Tessera Storage
//!
//! Persistent record storage for Tessera using RocksDB, plus the
//! optimistic transaction buffer and the secondary index implementations.
//!
//! # Column Families
//!
//! - `records` - bincode-encoded records keyed by rid
//! - `clusters` - cluster id to name registry
//! - `meta` - position counters and database metadata

pub mod engine;
pub mod index;
pub mod keys;
pub mod options;
pub mod transaction;

pub use engine::{StorageEngine, WriteOp};
pub use index::{
    IndexDefinition, IndexEntry, IndexKind, IndexManager, KeyRange, MemoryIndex,
    compare_key_prefix, full_text_words,
};
pub use options::StorageOptions;
pub use transaction::{RecordChange, Transaction, TransactionState};
