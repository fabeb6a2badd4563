//! UPDATE, INSERT and DELETE planning

use super::Planner;
use crate::plan::{ExecutionPlan, PlanKind};
use crate::statement::{DeleteStatement, InsertStatement, Returning, UpdateOperation, UpdateStatement};
use crate::step::composite::BatchStep;
use crate::step::filter::{CheckRecordTypeStep, CheckSafeDeleteStep};
use crate::step::mutation::{
    CopyRecordBeforeUpdateStep, CreateRecordStep, DeleteMode, DeleteStep, InsertValuesStep,
    SaveElementStep, UnwrapPreviousStep, UpdateEdgePointersStep, UpdateMergeStep, UpdateRemoveStep,
    UpdateSetStep,
};
use crate::step::transform::{CountStep, LimitStep};
use tessera_core::{RecordKind, Result};

impl Planner<'_> {
    fn chain_batch(&self, plan: &mut ExecutionPlan) {
        if let Some(size) = self.config.batch_size {
            plan.chain(BatchStep::new(size));
        }
    }

    fn chain_returning(&self, plan: &mut ExecutionPlan, returning: Returning) {
        match returning {
            Returning::Count => {
                plan.chain(CountStep::new());
            }
            Returning::Before => {
                plan.chain(UnwrapPreviousStep::new());
            }
            Returning::After => {}
        }
    }

    pub(super) fn plan_update(&self, update: &UpdateStatement, kind: PlanKind) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new(kind);
        self.chain_source(&mut plan, &update.target, update.condition.as_ref(), None)?;
        if let Some(limit) = &update.limit {
            plan.chain(LimitStep::new(limit.clone()));
        }
        if update.edge {
            plan.chain(CheckRecordTypeStep::new(RecordKind::Edge));
        }
        plan.chain(CopyRecordBeforeUpdateStep::new());
        for operation in &update.operations {
            match operation {
                UpdateOperation::Set(assignments) => plan.chain(UpdateSetStep::new(assignments.clone())),
                UpdateOperation::Remove(fields) => plan.chain(UpdateRemoveStep::new(fields.clone())),
                UpdateOperation::Merge(expression) => plan.chain(UpdateMergeStep::new(expression.clone())),
            };
        }
        if update.edge {
            plan.chain(UpdateEdgePointersStep::new());
        }
        plan.chain(SaveElementStep::new());
        self.chain_batch(&mut plan);
        self.chain_returning(&mut plan, update.returning);
        Ok(plan)
    }

    pub(super) fn plan_insert(&self, insert: &InsertStatement, kind: PlanKind) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new(kind);
        plan.chain(CreateRecordStep::new(insert.class_name.clone(), insert.rows.len().max(1)));
        if !insert.rows.is_empty() {
            plan.chain(InsertValuesStep::new(insert.rows.clone()));
        }
        plan.chain(SaveElementStep::new());
        self.chain_batch(&mut plan);
        Ok(plan)
    }

    pub(super) fn plan_delete(&self, delete: &DeleteStatement, kind: PlanKind) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new(kind);
        self.chain_source(&mut plan, &delete.target, delete.condition.as_ref(), None)?;
        match delete.mode {
            DeleteMode::Vertex => {
                plan.chain(CheckRecordTypeStep::new(RecordKind::Vertex));
            }
            DeleteMode::Edge => {
                plan.chain(CheckRecordTypeStep::new(RecordKind::Edge));
            }
            DeleteMode::Record if !delete.unsafe_delete => {
                plan.chain(CheckSafeDeleteStep::new());
            }
            DeleteMode::Record => {}
        }
        if let Some(limit) = &delete.limit {
            plan.chain(LimitStep::new(limit.clone()));
        }
        plan.chain(DeleteStep::new(delete.mode));
        self.chain_batch(&mut plan);
        if delete.returning == Returning::Count {
            plan.chain(CountStep::new());
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::executor::QueryOptions;
    use crate::expr::{Condition, Expression};
    use crate::statement::{SelectStatement, Statement, Target, TransactionStatement};
    use crate::step::mutation::Assignment;
    use crate::stream::drain;
    use crate::test_support::TestDb;
    use tessera_core::{Error, Value};

    fn run(test_db: &TestDb, statement: Statement) -> tessera_core::Result<Vec<crate::result::Row>> {
        let config = ExecutionConfig::for_testing();
        let plan = Planner::new(&test_db.db, &config).plan(&statement)?;
        let mut session = test_db.session();
        let mut ctx = test_db.context(&mut session);
        let stream = plan.start(&mut ctx)?;
        let rows = drain(stream, &mut ctx);
        plan.close();
        rows
    }

    #[test]
    fn test_update_counts_and_persists() {
        let test_db = TestDb::with_schema();
        let docs = test_db.docs(4);
        let update = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("x", Expression::lit(1))])
            .filter(Condition::compare("idx", crate::expr::CompareOp::Lt, 2));
        let rows = run(&test_db, update.into()).unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(2));
        let mut session = test_db.session();
        assert_eq!(session.load(docs[0]).unwrap().get("x"), Some(&Value::Integer(1)));
        assert_eq!(session.load(docs[3]).unwrap().get("x"), None);
    }

    #[test]
    fn test_update_returning_before() {
        let test_db = TestDb::with_schema();
        test_db.docs(1);
        let update = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("idx", Expression::lit(42))])
            .returning(Returning::Before);
        let rows = run(&test_db, update.into()).unwrap();
        assert_eq!(rows[0].property("idx"), Value::Integer(0));
    }

    #[test]
    fn test_insert_values() {
        let test_db = TestDb::with_schema();
        let insert = InsertStatement::new("Doc")
            .values(vec![Assignment::new("name", Expression::lit("a"))])
            .values(vec![Assignment::new("name", Expression::lit("b"))]);
        let rows = run(&test_db, insert.into()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.rid().is_some_and(|rid| rid.is_persistent())));
        assert_eq!(test_db.db.count_class("Doc", false).unwrap(), 2);
    }

    #[test]
    fn test_plain_delete_refuses_vertices() {
        let test_db = TestDb::with_schema();
        test_db.people(2);
        let delete = DeleteStatement::new(Target::class("Person"), DeleteMode::Record);
        let err = run(&test_db, delete.into()).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(_)));

        let delete = DeleteStatement::new(Target::class("Person"), DeleteMode::Vertex);
        let rows = run(&test_db, delete.into()).unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(2));
        assert_eq!(test_db.db.count_class("Person", true).unwrap(), 0);
    }

    fn select_x(test_db: &TestDb) -> Vec<Value> {
        let mut session = test_db.session();
        let statement: Statement = SelectStatement::from_class("Doc").into();
        test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new())
            .unwrap()
            .iter()
            .map(|r| r.property("x"))
            .collect()
    }

    #[test]
    fn test_update_then_read_back() {
        let test_db = TestDb::with_schema();
        test_db.docs(3);
        let mut session = test_db.session();
        let update: Statement = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("x", Expression::lit(1))])
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &update, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(3));
        assert_eq!(select_x(&test_db), vec![Value::Integer(1); 3]);
    }

    #[test]
    fn test_update_returning_before_and_after() {
        let test_db = TestDb::with_schema();
        test_db.docs(1);
        let mut session = test_db.session();

        let before: Statement = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("x", Expression::lit(1))])
            .returning(Returning::Before)
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &before, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("x"), Value::Null);

        let after: Statement = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("x", Expression::lit(2))])
            .returning(Returning::After)
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &after, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("x"), Value::Integer(2));
    }

    #[test]
    fn test_update_remove_with_filter() {
        let test_db = TestDb::with_schema();
        test_db.docs(4);
        let mut session = test_db.session();
        let set: Statement = UpdateStatement::new(Target::class("Doc"))
            .set(vec![Assignment::new("x", Expression::lit(5))])
            .into();
        test_db.executor.execute(&mut session, &set, QueryOptions::new()).unwrap();

        let remove: Statement = UpdateStatement::new(Target::class("Doc"))
            .remove(&["x"])
            .filter(Condition::eq("idx", 0))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &remove, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(1));
        let mut values = select_x(&test_db);
        values.sort();
        assert_eq!(
            values,
            vec![Value::Null, Value::Integer(5), Value::Integer(5), Value::Integer(5)]
        );
    }

    #[test]
    fn test_insert_and_delete() {
        let test_db = TestDb::with_schema();
        let mut session = test_db.session();
        let insert: Statement = InsertStatement::new("Doc")
            .values(vec![Assignment::new("x", Expression::lit(1))])
            .values(vec![Assignment::new("x", Expression::param("x"))])
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &insert, QueryOptions::new().param("x", 2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.rid().is_some()));
        assert_eq!(test_db.db.count_class("Doc", false).unwrap(), 2);

        let delete: Statement = DeleteStatement::new(Target::class("Doc"), DeleteMode::Record)
            .filter(Condition::eq("x", 1))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &delete, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(1));
        assert_eq!(select_x(&test_db), vec![Value::Integer(2)]);
    }

    #[test]
    fn test_delete_vertex_removes_edges() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(2);
        test_db.friend(people[0], people[1]);
        let mut session = test_db.session();

        let plain: Statement = DeleteStatement::new(Target::class("Person"), DeleteMode::Record).into();
        assert!(test_db.executor.execute(&mut session, &plain, QueryOptions::new()).is_err());

        let vertex: Statement = DeleteStatement::new(Target::class("Person"), DeleteMode::Vertex)
            .filter(Condition::eq("name", "n0"))
            .into();
        test_db.executor.execute(&mut session, &vertex, QueryOptions::new()).unwrap();
        assert_eq!(test_db.db.count_class("Person", true).unwrap(), 1);
        assert_eq!(test_db.db.count_class("Friend", true).unwrap(), 0);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let test_db = TestDb::with_schema();
        let mut session = test_db.session();
        let good: Statement = InsertStatement::new("Doc")
            .values(vec![Assignment::new("x", Expression::lit(1))])
            .into();
        let bad: Statement = InsertStatement::new("Doc")
            .values(vec![Assignment::new("x", Expression::param("missing"))])
            .into();
        let transaction: Statement = TransactionStatement::new(vec![good.clone(), bad], 2).into();
        let result = test_db
            .executor
            .execute(&mut session, &transaction, QueryOptions::new());
        assert!(matches!(result, Err(Error::CommandExecution(_))));
        assert!(!session.is_transaction_active());
        assert_eq!(test_db.db.count_class("Doc", false).unwrap(), 0);

        let transaction: Statement = TransactionStatement::new(vec![good.clone(), good], 2).into();
        test_db
            .executor
            .execute(&mut session, &transaction, QueryOptions::new())
            .unwrap();
        assert_eq!(test_db.db.count_class("Doc", false).unwrap(), 2);
    }
}
