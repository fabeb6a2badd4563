//! Error types for Tessera
//!
//! Every layer (storage, schema, query planning and execution) reports
//! failures through the single [`Error`] enum below.

use crate::id::Rid;
use thiserror::Error;

/// The main error type for Tessera operations
#[derive(Error, Debug)]
pub enum Error {
    // ========== Storage Errors ==========
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    // ========== Record Errors ==========
    #[error("Record not found: {0}")]
    RecordNotFound(Rid),

    #[error("Concurrent modification on record {rid}: expected version {expected}, found {found}")]
    RecordConflict { rid: Rid, expected: u32, found: u32 },

    // ========== Schema Errors ==========
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    #[error("Class already exists: {0}")]
    ClassAlreadyExists(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    // ========== Query Errors ==========
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Command execution error: {0}")]
    CommandExecution(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // ========== Control Flow Errors ==========
    #[error("Query timed out after {0} ms")]
    Timeout(u64),

    #[error("Query interrupted")]
    Interrupted,

    #[error("Transaction needs retry: {0}")]
    NeedRetry(String),

    // ========== Transaction Errors ==========
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // ========== Serialization Errors ==========
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ========== IO Errors ==========
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Configuration Errors ==========
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error is raised while building a plan
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Error::Planning(_)
                | Error::ClassNotFound(_)
                | Error::ClusterNotFound(_)
                | Error::IndexNotFound(_)
        )
    }

    /// Returns true if the statement may succeed when re-executed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NeedRetry(_) | Error::RecordConflict { .. })
    }

    /// Returns true if this error reports a cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Interrupted)
    }

    /// Returns true if read paths may treat this error as a missing row
    pub fn is_soft_miss(&self) -> bool {
        matches!(self, Error::RecordNotFound(_))
    }

    /// Returns true if this error indicates data corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DataCorruption(_) | Error::Deserialization(_))
    }
}
