//! LET, script and transaction planning

use super::Planner;
use crate::plan::{ExecutionPlan, PlanKind};
use crate::statement::{LetItem, LetValue, Statement, TransactionStatement};
use crate::step::composite::{GlobalLetStep, RetryStep, ScriptBlockStep};
use tessera_core::Result;

impl Planner<'_> {
    pub(super) fn plan_let(&self, item: &LetItem, kind: PlanKind) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new(kind);
        match &item.value {
            LetValue::Query(statement) => {
                plan.chain(GlobalLetStep::query(item.variable.clone(), self.sub_plan(statement)?));
            }
            LetValue::Expression(expression) => {
                plan.chain(GlobalLetStep::expression(item.variable.clone(), expression.clone()));
            }
        }
        Ok(plan)
    }

    pub(super) fn plan_script(&self, statements: &[Statement], kind: PlanKind) -> Result<ExecutionPlan> {
        let plans = statements
            .iter()
            .map(|statement| self.sub_plan(statement))
            .collect::<Result<Vec<_>>>()?;
        let mut plan = ExecutionPlan::new(kind);
        plan.chain(ScriptBlockStep::new(plans));
        Ok(plan)
    }

    pub(super) fn plan_transaction(
        &self,
        transaction: &TransactionStatement,
        kind: PlanKind,
    ) -> Result<ExecutionPlan> {
        let body = self.plan_script(&transaction.body, PlanKind::Sub)?;
        let mut retry = RetryStep::new(body, transaction.retries);
        if let Some(else_body) = &transaction.else_body {
            retry = retry.with_else(self.plan_script(else_body, PlanKind::Sub)?, transaction.else_fail);
        }
        let mut plan = ExecutionPlan::new(kind);
        plan.chain(retry);
        Ok(plan)
    }
}
