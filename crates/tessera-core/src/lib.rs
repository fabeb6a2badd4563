//! Tessera Core Library
//!
//! Fundamental types and error handling shared by every Tessera crate.
//!
//! # Modules
//!
//! - `error` - Error taxonomy and result alias
//! - `id` - Record identity (`Rid`)
//! - `value` - Field values with total and query ordering
//! - `record` - Stored records, field collections and directions

pub mod error;
pub mod id;
pub mod record;
pub mod value;

pub use error::{Error, Result};
pub use id::{ClusterId, Rid};
pub use record::{Direction, Fields, Record, RecordKind, EDGE_IN, EDGE_OUT};
pub use value::Value;
