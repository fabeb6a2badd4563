//! Statement planners
//!
//! Each statement kind compiles into an [`ExecutionPlan`]. Source selection
//! (class scan, index scan, clusters, rids, variables, sub-queries) and the
//! DISTINCT/ORDER BY/SKIP/LIMIT tail are shared by every planner.

mod matching;
mod mutation;
mod script;
mod select;

use crate::config::ExecutionConfig;
use crate::expr::{Condition, Expression};
use crate::plan::{ExecutionPlan, PlanKind};
use crate::statement::{Statement, Target};
use crate::step::composite::SubQueryStep;
use crate::step::fetch::{FetchFromClassStep, FetchFromClusterStep, FetchFromRidsStep, FetchFromVariableStep};
use crate::step::filter::FilterStep;
use crate::step::index::{FetchFromIndexStep, GetValueFromIndexEntryStep};
use crate::step::transform::{DistinctStep, LimitStep, OrderByStep, OrderItem, SkipStep};
use tessera_core::{Result, Value};
use tessera_graph::Database;
use tracing::debug;

/// Builds plans against one database's schema and indexes
pub struct Planner<'a> {
    db: &'a Database,
    config: &'a ExecutionConfig,
}

impl<'a> Planner<'a> {
    pub fn new(db: &'a Database, config: &'a ExecutionConfig) -> Self {
        Self { db, config }
    }

    pub fn plan(&self, statement: &Statement) -> Result<ExecutionPlan> {
        self.plan_as(statement, statement.kind())
    }

    /// Plan nested inside a composite step
    pub(crate) fn sub_plan(&self, statement: &Statement) -> Result<ExecutionPlan> {
        self.plan_as(statement, PlanKind::Sub)
    }

    fn plan_as(&self, statement: &Statement, kind: PlanKind) -> Result<ExecutionPlan> {
        let plan = match statement {
            Statement::Select(select) => self.plan_select(select, kind)?,
            Statement::Match(statement) => self.plan_match(statement, kind)?,
            Statement::Update(update) => self.plan_update(update, kind)?,
            Statement::Insert(insert) => self.plan_insert(insert, kind)?,
            Statement::Delete(delete) => self.plan_delete(delete, kind)?,
            Statement::Let(item) => self.plan_let(item, kind)?,
            Statement::Script(statements) => self.plan_script(statements, kind)?,
            Statement::Transaction(transaction) => self.plan_transaction(transaction, kind)?,
        };
        debug!(?kind, steps = plan.len(), "Planned statement");
        Ok(plan)
    }

    /// Chain the steps producing the rows of `target` that satisfy
    /// `condition`. Returns true when the rows already come in the requested
    /// `ORDER BY @rid` order.
    fn chain_source(
        &self,
        plan: &mut ExecutionPlan,
        target: &Target,
        condition: Option<&Condition>,
        rid_order: Option<bool>,
    ) -> Result<bool> {
        let mut ordered = false;
        let mut residual = condition.cloned();
        match target {
            Target::Class { name, polymorphic } => {
                let clusters = self.db.schema()?.class_clusters(name, *polymorphic)?;
                let scan = match condition {
                    Some(condition) if rid_order.is_none() => self.index_scan(name, condition)?,
                    _ => None,
                };
                match scan {
                    Some((descriptor, rest)) => {
                        debug!(class = %name, index = %descriptor.index_name, "Using index");
                        plan.chain(FetchFromIndexStep::new(descriptor, true))
                            .chain(GetValueFromIndexEntryStep::new(Some(clusters)));
                        residual = and_of(rest);
                    }
                    None => {
                        plan.chain(FetchFromClassStep::new(name.clone(), *polymorphic, rid_order));
                        ordered = rid_order.is_some();
                    }
                }
            }
            Target::Clusters(ids) => {
                plan.chain(FetchFromClusterStep::new(ids.clone(), rid_order));
                ordered = rid_order.is_some();
            }
            Target::Rids(rids) => {
                plan.chain(FetchFromRidsStep::new(rids.clone()));
            }
            Target::Variable(name) => {
                plan.chain(FetchFromVariableStep::new(name.clone()));
            }
            Target::SubQuery(statement) => {
                plan.chain(SubQueryStep::new(self.sub_plan(statement)?));
            }
        }
        if let Some(condition) = residual {
            plan.chain(FilterStep::new(condition));
        }
        Ok(ordered)
    }

    /// DISTINCT, ORDER BY, SKIP and LIMIT, in that order
    fn chain_tail(
        &self,
        plan: &mut ExecutionPlan,
        distinct: bool,
        order_by: &[OrderItem],
        skip: Option<&Expression>,
        limit: Option<&Expression>,
    ) {
        if distinct {
            plan.chain(DistinctStep::new());
        }
        if !order_by.is_empty() {
            plan.chain(OrderByStep::new(order_by.to_vec(), top_n(skip, limit)));
        }
        if let Some(skip) = skip {
            plan.chain(SkipStep::new(skip.clone()));
        }
        if let Some(limit) = limit {
            plan.chain(LimitStep::new(limit.clone()));
        }
    }
}

/// Rows ORDER BY must keep when SKIP and LIMIT are literals
fn top_n(skip: Option<&Expression>, limit: Option<&Expression>) -> Option<usize> {
    let literal = |e: Option<&Expression>| match e {
        None => Some(0),
        Some(Expression::Literal(Value::Integer(n))) if *n >= 0 => Some(*n as usize),
        Some(_) => None,
    };
    match limit {
        Some(_) => Some(literal(skip)? + literal(limit)?),
        None => None,
    }
}

/// Conjunction of the remaining conditions; `None` when empty
fn and_of(mut conditions: Vec<Condition>) -> Option<Condition> {
    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(Condition::And(conditions)),
    }
}

/// `ORDER BY @rid ASC|DESC` as the only sort key
fn rid_order(order_by: &[OrderItem]) -> Option<bool> {
    match order_by {
        [item] if item.expression.as_field() == Some("@rid") => Some(item.ascending),
        _ => None,
    }
}
