//! Tessera Graph Layer
//!
//! Schema, database handles, sessions and vertex/edge operations built on
//! top of the storage engine.
//!
//! # Overview
//!
//! - `schema` - classes, superclasses and class-to-cluster mapping
//! - `database` - `Database` handle and `DatabaseSession` (transactions, record access, indexes)
//! - `graph` - vertex/edge creation, deletion and adjacency traversal

pub mod database;
pub mod graph;
pub mod schema;

pub use database::{Database, DatabaseConfig, DatabaseSession};
pub use schema::{EDGE_CLASS, Schema, SchemaClass, VERTEX_CLASS};
