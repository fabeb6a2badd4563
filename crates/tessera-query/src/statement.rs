//! Statement model
//!
//! Statements are built programmatically; there is no text grammar. Every
//! statement serializes with serde, and the xxh3 hash of that form is the
//! key of the plan cache.

use crate::expr::{Condition, Expression};
use crate::matching::pattern::MatchExpression;
use crate::matching::steps::ReturnMode;
use crate::plan::PlanKind;
use crate::step::mutation::{Assignment, DeleteMode};
use crate::step::transform::{OrderItem, ProjectionItem};
use serde::{Deserialize, Serialize};
use tessera_core::{ClusterId, Error, Result, Rid};
use xxhash_rust::xxh3::xxh3_64;

/// Where a statement reads its rows from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    Class { name: String, polymorphic: bool },
    Clusters(Vec<ClusterId>),
    Rids(Vec<Rid>),
    /// A context variable set by LET
    Variable(String),
    SubQuery(Box<Statement>),
}

impl Target {
    pub fn class<S: Into<String>>(name: S) -> Self {
        Target::Class {
            name: name.into(),
            polymorphic: true,
        }
    }
}

/// Value bound by a LET
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LetValue {
    Query(Box<Statement>),
    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetItem {
    pub variable: String,
    pub value: LetValue,
}

/// `SELECT [DISTINCT] projections FROM target [LET ..] [WHERE ..] [UNWIND ..]
/// [ORDER BY ..] [SKIP ..] [LIMIT ..]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub target: Target,
    pub let_items: Vec<LetItem>,
    /// Empty means the rows themselves
    pub projections: Vec<ProjectionItem>,
    pub count: bool,
    pub expand: Option<Expression>,
    pub distinct: bool,
    pub condition: Option<Condition>,
    pub unwind: Vec<String>,
    pub order_by: Vec<OrderItem>,
    pub skip: Option<Expression>,
    pub limit: Option<Expression>,
}

impl SelectStatement {
    pub fn from(target: Target) -> Self {
        Self {
            target,
            let_items: Vec::new(),
            projections: Vec::new(),
            count: false,
            expand: None,
            distinct: false,
            condition: None,
            unwind: Vec::new(),
            order_by: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    pub fn from_class<S: Into<String>>(class_name: S) -> Self {
        Self::from(Target::class(class_name))
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn project(mut self, items: Vec<ProjectionItem>) -> Self {
        self.projections = items;
        self
    }

    /// `SELECT count(*)`
    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn expand(mut self, expression: Expression) -> Self {
        self.expand = Some(expression);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn unwind(mut self, fields: &[&str]) -> Self {
        self.unwind = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn order_by(mut self, item: OrderItem) -> Self {
        self.order_by.push(item);
        self
    }

    pub fn skip(mut self, count: Expression) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn limit(mut self, count: Expression) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn let_query<S: Into<String>>(mut self, variable: S, statement: Statement) -> Self {
        self.let_items.push(LetItem {
            variable: variable.into(),
            value: LetValue::Query(Box::new(statement)),
        });
        self
    }

    pub fn let_expression<S: Into<String>>(mut self, variable: S, expression: Expression) -> Self {
        self.let_items.push(LetItem {
            variable: variable.into(),
            value: LetValue::Expression(expression),
        });
        self
    }
}

/// `MATCH expressions RETURN ..`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStatement {
    pub expressions: Vec<MatchExpression>,
    pub return_mode: ReturnMode,
    pub distinct: bool,
    pub order_by: Vec<OrderItem>,
    pub skip: Option<Expression>,
    pub limit: Option<Expression>,
}

impl MatchStatement {
    pub fn new(expressions: Vec<MatchExpression>, return_mode: ReturnMode) -> Self {
        Self {
            expressions,
            return_mode,
            distinct: false,
            order_by: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn order_by(mut self, item: OrderItem) -> Self {
        self.order_by.push(item);
        self
    }

    pub fn skip(mut self, count: Expression) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn limit(mut self, count: Expression) -> Self {
        self.limit = Some(count);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOperation {
    Set(Vec<Assignment>),
    Remove(Vec<String>),
    Merge(Expression),
}

/// What an UPDATE or DELETE returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Returning {
    /// A single `{count: n}` row
    #[default]
    Count,
    /// The records as they were before the statement
    Before,
    /// The records as written
    After,
}

/// `UPDATE [EDGE] target SET|REMOVE|MERGE .. [WHERE ..] [LIMIT ..]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub target: Target,
    /// UPDATE EDGE: endpoint changes are mirrored on the vertices
    pub edge: bool,
    pub operations: Vec<UpdateOperation>,
    pub condition: Option<Condition>,
    pub limit: Option<Expression>,
    pub returning: Returning,
}

impl UpdateStatement {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            edge: false,
            operations: Vec::new(),
            condition: None,
            limit: None,
            returning: Returning::Count,
        }
    }

    pub fn edge(mut self) -> Self {
        self.edge = true;
        self
    }

    pub fn set(mut self, assignments: Vec<Assignment>) -> Self {
        self.operations.push(UpdateOperation::Set(assignments));
        self
    }

    pub fn remove(mut self, fields: &[&str]) -> Self {
        self.operations
            .push(UpdateOperation::Remove(fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn merge(mut self, expression: Expression) -> Self {
        self.operations.push(UpdateOperation::Merge(expression));
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn limit(mut self, count: Expression) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }
}

/// `INSERT INTO class [SET ..|VALUES (..), (..)]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub class_name: String,
    /// One assignment list per inserted record
    pub rows: Vec<Vec<Assignment>>,
}

impl InsertStatement {
    pub fn new<S: Into<String>>(class_name: S) -> Self {
        Self {
            class_name: class_name.into(),
            rows: Vec::new(),
        }
    }

    pub fn values(mut self, assignments: Vec<Assignment>) -> Self {
        self.rows.push(assignments);
        self
    }
}

/// `DELETE [VERTEX|EDGE] target [WHERE ..] [LIMIT ..] [UNSAFE]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub target: Target,
    pub mode: DeleteMode,
    /// Allow plain DELETE on vertices and edges
    pub unsafe_delete: bool,
    pub condition: Option<Condition>,
    pub limit: Option<Expression>,
    pub returning: Returning,
}

impl DeleteStatement {
    pub fn new(target: Target, mode: DeleteMode) -> Self {
        Self {
            target,
            mode,
            unsafe_delete: false,
            condition: None,
            limit: None,
            returning: Returning::Count,
        }
    }

    pub fn unsafe_delete(mut self) -> Self {
        self.unsafe_delete = true;
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn limit(mut self, count: Expression) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }
}

/// `BEGIN; body; COMMIT RETRY n [ELSE {..} AND CONTINUE|AND FAIL]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatement {
    pub body: Vec<Statement>,
    pub retries: u32,
    pub else_body: Option<Vec<Statement>>,
    pub else_fail: bool,
}

impl TransactionStatement {
    pub fn new(body: Vec<Statement>, retries: u32) -> Self {
        Self {
            body,
            retries,
            else_body: None,
            else_fail: true,
        }
    }

    pub fn or_else(mut self, body: Vec<Statement>, fail: bool) -> Self {
        self.else_body = Some(body);
        self.else_fail = fail;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Match(MatchStatement),
    Update(UpdateStatement),
    Insert(InsertStatement),
    Delete(DeleteStatement),
    Let(LetItem),
    Script(Vec<Statement>),
    Transaction(TransactionStatement),
}

impl Statement {
    pub fn kind(&self) -> PlanKind {
        match self {
            Statement::Select(_) => PlanKind::Select,
            Statement::Match(_) => PlanKind::Match,
            Statement::Update(_) => PlanKind::Update,
            Statement::Insert(_) => PlanKind::Insert,
            Statement::Delete(_) => PlanKind::Delete,
            Statement::Let(_) => PlanKind::Let,
            Statement::Script(_) => PlanKind::Script,
            Statement::Transaction(_) => PlanKind::Transaction,
        }
    }

    /// True when running the statement cannot modify data
    pub fn is_idempotent(&self) -> bool {
        match self {
            Statement::Select(select) => target_is_idempotent(&select.target),
            Statement::Match(_) => true,
            Statement::Let(item) => match &item.value {
                LetValue::Query(statement) => statement.is_idempotent(),
                LetValue::Expression(_) => true,
            },
            Statement::Script(statements) => statements.iter().all(Statement::is_idempotent),
            Statement::Update(_)
            | Statement::Insert(_)
            | Statement::Delete(_)
            | Statement::Transaction(_) => false,
        }
    }

    /// Structural hash used as the plan cache key
    pub fn fingerprint(&self) -> Result<u64> {
        let bytes = serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(xxh3_64(&bytes))
    }
}

fn target_is_idempotent(target: &Target) -> bool {
    match target {
        Target::SubQuery(statement) => statement.is_idempotent(),
        _ => true,
    }
}

impl From<SelectStatement> for Statement {
    fn from(statement: SelectStatement) -> Self {
        Statement::Select(statement)
    }
}

impl From<MatchStatement> for Statement {
    fn from(statement: MatchStatement) -> Self {
        Statement::Match(statement)
    }
}

impl From<UpdateStatement> for Statement {
    fn from(statement: UpdateStatement) -> Self {
        Statement::Update(statement)
    }
}

impl From<InsertStatement> for Statement {
    fn from(statement: InsertStatement) -> Self {
        Statement::Insert(statement)
    }
}

impl From<DeleteStatement> for Statement {
    fn from(statement: DeleteStatement) -> Self {
        Statement::Delete(statement)
    }
}

impl From<TransactionStatement> for Statement {
    fn from(statement: TransactionStatement) -> Self {
        Statement::Transaction(statement)
    }
}
