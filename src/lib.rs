//! Tessera - lazy pull-based query execution for a graph/document database
//!
//! This is the main library crate that re-exports all Tessera components.

pub use tessera_core as core;
pub use tessera_graph as graph;
pub use tessera_query as query;
pub use tessera_storage as storage;

// Re-export commonly used types
pub use tessera_core::{ClusterId, Direction, Error, Fields, Record, RecordKind, Result, Rid, Value};

pub use tessera_graph::{Database, DatabaseConfig, DatabaseSession};
pub use tessera_query::{
    Condition, ExecutionConfig, ExecutionPlan, Expression, InterruptToken, QueryExecutor,
    QueryOptions, ResultSet, Row, Statement,
};
pub use tessera_storage::{IndexDefinition, IndexKind, StorageEngine, StorageOptions};
