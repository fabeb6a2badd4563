//! Graph pattern matching
//!
//! - `pattern` - alias graph built from MATCH expressions
//! - `scheduler` - dependency-aware execution order
//! - `traverser` - single-hop, multi-hop and depth-bounded edge walks
//! - `steps` - the plan steps that run a schedule

pub mod pattern;
pub mod scheduler;
pub mod steps;
pub mod traverser;

pub use pattern::{Hop, HopKind, MatchExpression, MatchFilter, MatchPathItem, Pattern};
pub use scheduler::{ScheduledItem, schedule};
pub use steps::ReturnMode;
pub use traverser::{EdgeTraversal, TargetFilter};
