//! Tessera Query Engine
//!
//! Lazy, pull-based execution of SELECT, MATCH, UPDATE, INSERT, DELETE,
//! LET, scripts and retried transactions over a Tessera database.
//!
//! # Layout
//!
//! - `stream` - the `ExecutionStream` pull contract and combinators
//! - `step` - physical operators chained into an `ExecutionPlan`
//! - `matching` - pattern graph, scheduling and traversal for MATCH
//! - `planner` - statement to plan translation, index selection
//! - `executor` - plan cache and the `ResultSet` handed to callers
//!
//! ```ignore
//! let executor = QueryExecutor::new(ExecutionConfig::default());
//! let statement = SelectStatement::from_class("Person").limit(Expression::lit(5));
//! for row in executor.query(&mut session, &statement.into(), QueryOptions::new())? {
//!     println!("{:?}", row?);
//! }
//! ```

pub mod config;
pub mod context;
pub mod executor;
pub mod expr;
pub mod matching;
pub mod plan;
pub mod planner;
pub mod result;
pub mod statement;
pub mod step;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use config::ExecutionConfig;
pub use context::{CommandContext, InterruptToken};
pub use executor::{CacheStats, Explain, Profile, QueryExecutor, QueryOptions, ResultSet};
pub use expr::{ArithmeticOp, CompareOp, Condition, Expression};
pub use matching::{MatchExpression, MatchFilter, MatchPathItem, ReturnMode};
pub use plan::{ExecutionPlan, PlanKind};
pub use planner::Planner;
pub use result::{Row, RowContent};
pub use statement::{
    DeleteStatement, InsertStatement, LetItem, LetValue, MatchStatement, Returning,
    SelectStatement, Statement, Target, TransactionStatement, UpdateOperation, UpdateStatement,
};
pub use step::mutation::{Assignment, DeleteMode};
pub use step::transform::{OrderItem, ProjectionItem};
pub use step::{ExecutionStep, StepStats};
pub use stream::{BoxStream, ExecutionStream, StreamExt};
