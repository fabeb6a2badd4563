//! SELECT planning and index selection

use super::{Planner, and_of, rid_order};
use crate::expr::Condition;
use crate::plan::{ExecutionPlan, PlanKind};
use crate::statement::{LetValue, SelectStatement};
use crate::step::composite::GlobalLetStep;
use crate::step::index::IndexSearchDescriptor;
use crate::step::transform::{CountStep, ExpandStep, OrderItem, ProjectionItem, ProjectionStep, UnwindStep};
use tessera_core::Result;

/// Field a conjunct constrains with row-independent bounds
fn key_field(condition: &Condition) -> Option<&str> {
    match condition {
        Condition::Compare { left, right, .. } if right.is_row_independent() => left.as_field(),
        Condition::Between { expr, low, high } if low.is_row_independent() && high.is_row_independent() => {
            expr.as_field()
        }
        Condition::In { expr, values } if values.is_row_independent() => expr.as_field(),
        Condition::ContainsText { expr, text } if text.is_row_independent() => expr.as_field(),
        _ => None,
    }
}

/// ORDER BY can run after the projection only if it sorts by projected aliases
fn sorts_projection(order_by: &[OrderItem], projections: &[ProjectionItem]) -> bool {
    !projections.is_empty()
        && order_by.iter().all(|item| {
            item.expression
                .as_field()
                .is_some_and(|field| projections.iter().any(|p| p.alias == field))
        })
}

impl Planner<'_> {
    pub(super) fn plan_select(&self, select: &SelectStatement, kind: PlanKind) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan::new(kind);
        for item in &select.let_items {
            match &item.value {
                LetValue::Query(statement) => {
                    plan.chain(GlobalLetStep::query(item.variable.clone(), self.sub_plan(statement)?));
                }
                LetValue::Expression(expression) => {
                    plan.chain(GlobalLetStep::expression(item.variable.clone(), expression.clone()));
                }
            }
        }

        let requested = rid_order(&select.order_by);
        let ordered = self.chain_source(&mut plan, &select.target, select.condition.as_ref(), requested)?;
        let order_by: &[OrderItem] = if ordered { &[] } else { &select.order_by };

        if select.count {
            plan.chain(CountStep::new());
            self.chain_tail(&mut plan, false, &[], select.skip.as_ref(), select.limit.as_ref());
            return Ok(plan);
        }

        let late_order = sorts_projection(order_by, &select.projections);
        if !late_order && !order_by.is_empty() {
            self.chain_tail(&mut plan, false, order_by, None, None);
        }
        if !select.projections.is_empty() {
            plan.chain(ProjectionStep::new(select.projections.clone()));
        }
        if !select.unwind.is_empty() {
            plan.chain(UnwindStep::new(select.unwind.clone()));
        }
        if let Some(expression) = &select.expand {
            plan.chain(ExpandStep::new(expression.clone()));
        }
        let tail_order = if late_order { order_by } else { &[] };
        self.chain_tail(
            &mut plan,
            select.distinct,
            tail_order,
            select.skip.as_ref(),
            select.limit.as_ref(),
        );
        Ok(plan)
    }

    /// Best index of `class` for the AND-block in `condition`: the one that
    /// serves the most conjuncts. Returns the descriptor and the conjuncts
    /// left for a filter.
    pub(super) fn index_scan(
        &self,
        class: &str,
        condition: &Condition,
    ) -> Result<Option<(IndexSearchDescriptor, Vec<Condition>)>> {
        let conjuncts = condition.conjuncts();
        let mut best: Option<(IndexSearchDescriptor, Vec<Condition>, usize)> = None;
        for definition in self.db.indexes_for_class(class)? {
            let (keyed, rest): (Vec<&Condition>, Vec<&Condition>) = conjuncts.iter().copied().partition(|c| {
                key_field(c).is_some_and(|field| definition.fields.iter().any(|f| f == field))
            });
            if keyed.is_empty() || best.as_ref().is_some_and(|(_, _, used)| *used >= keyed.len()) {
                continue;
            }
            let Some(key) = and_of(keyed.iter().map(|c| (*c).clone()).collect()) else {
                continue;
            };
            let descriptor = IndexSearchDescriptor::new(definition.name.clone(), Some(key));
            if descriptor.validate(&definition).is_err() {
                continue;
            }
            best = Some((descriptor, rest.into_iter().cloned().collect(), keyed.len()));
        }
        Ok(best.map(|(descriptor, rest, _)| (descriptor, rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::executor::{QueryExecutor, QueryOptions};
    use crate::expr::{CompareOp, Expression};
    use crate::result::Row;
    use crate::statement::{Statement, Target};
    use crate::step::fetch::FetchFromClassStep;
    use crate::step::filter::FilterStep;
    use crate::step::index::FetchFromIndexStep;
    use crate::step::transform::OrderByStep;
    use crate::test_support::TestDb;
    use tessera_core::{Error, Value};
    use tessera_storage::{IndexDefinition, IndexKind};

    fn types(plan: &ExecutionPlan) -> Vec<&'static str> {
        plan.steps().iter().map(|s| s.type_name()).collect()
    }

    fn indexed_db() -> TestDb {
        let test_db = TestDb::with_schema();
        test_db
            .db
            .create_index(IndexDefinition::new("Person.idx", "Person", &["idx"], IndexKind::NotUnique))
            .unwrap();
        test_db
    }

    #[test]
    fn test_equality_uses_index() {
        let test_db = indexed_db();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from_class("Person").filter(
            Condition::eq("idx", 3).and(Condition::eq("name", "n3")),
        );
        let plan = planner.plan(&Statement::Select(select)).unwrap();
        assert_eq!(
            types(&plan),
            vec![FetchFromIndexStep::TYPE, "GetValueFromIndexEntry", FilterStep::TYPE]
        );
    }

    #[test]
    fn test_unindexed_condition_scans() {
        let test_db = indexed_db();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from_class("Person").filter(Condition::Or(vec![
            Condition::eq("idx", 1),
            Condition::eq("idx", 2),
        ]));
        let plan = planner.plan(&Statement::Select(select)).unwrap();
        assert_eq!(types(&plan), vec![FetchFromClassStep::TYPE, FilterStep::TYPE]);
    }

    #[test]
    fn test_rid_order_is_served_by_scan() {
        let test_db = TestDb::with_schema();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from_class("Person")
            .order_by(OrderItem::desc(Expression::field("@rid")))
            .limit(Expression::lit(2));
        let plan = planner.plan(&Statement::Select(select)).unwrap();
        assert_eq!(types(&plan), vec![FetchFromClassStep::TYPE, "Limit"]);
        assert!(plan.pretty_print(0, 2).contains("ORDER BY @rid DESC"));
    }

    #[test]
    fn test_order_by_projection_alias_runs_late() {
        let test_db = TestDb::with_schema();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from_class("Person")
            .project(vec![ProjectionItem::new(Expression::field("name"), "who")])
            .order_by(OrderItem::asc(Expression::field("who")))
            .limit(Expression::lit(2));
        let plan = planner.plan(&Statement::Select(select)).unwrap();
        assert_eq!(
            types(&plan),
            vec![FetchFromClassStep::TYPE, ProjectionStep::TYPE, OrderByStep::TYPE, "Limit"]
        );
    }

    #[test]
    fn test_unknown_class_fails_at_planning() {
        let test_db = TestDb::with_schema();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from(Target::class("Nope"));
        assert!(planner.plan(&Statement::Select(select)).is_err());
    }

    #[test]
    fn test_select_with_index_returns_matching_rows() {
        let test_db = indexed_db();
        test_db.people(10);
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let select = SelectStatement::from_class("Person").filter(Condition::between("idx", 2, 4));
        let plan = planner.plan(&Statement::Select(select)).unwrap();
        let mut session = test_db.session();
        let mut ctx = test_db.context(&mut session);
        let rows = crate::stream::drain(plan.start(&mut ctx).unwrap(), &mut ctx).unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.property("name")).collect();
        assert_eq!(names, vec!["n2".into(), "n3".into(), "n4".into()]);
    }

    #[test]
    fn test_key_field() {
        assert_eq!(key_field(&Condition::compare("a", CompareOp::Gt, 1)), Some("a"));
        let row_dependent = Condition::Compare {
            left: Expression::field("a"),
            op: CompareOp::Eq,
            right: Expression::field("b"),
        };
        assert_eq!(key_field(&row_dependent), None);
    }

    fn idx_values(rows: &[Row]) -> Vec<Value> {
        rows.iter().map(|r| r.property("idx")).collect()
    }

    #[test]
    fn test_limit_loads_only_needed_records() {
        let test_db = TestDb::with_schema();
        test_db.docs(10);
        let mut session = test_db.session();
        let before = session.records_loaded();

        let statement: Statement = SelectStatement::from_class("Doc")
            .limit(Expression::lit(5))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new())
            .unwrap();

        assert_eq!(rows.len(), 5);
        assert_eq!(session.records_loaded() - before, 5);
    }

    #[test]
    fn test_negative_limit_is_unlimited() {
        let test_db = TestDb::with_schema();
        test_db.docs(4);
        let mut session = test_db.session();
        let statement: Statement = SelectStatement::from_class("Doc")
            .limit(Expression::lit(-1))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new())
            .unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_filter_order_skip_limit() {
        let test_db = TestDb::with_schema();
        test_db.people(8);
        let mut session = test_db.session();
        let statement: Statement = SelectStatement::from_class("Person")
            .filter(Condition::Compare {
                left: Expression::field("idx"),
                op: CompareOp::Ge,
                right: Expression::param("min"),
            })
            .order_by(OrderItem::desc(Expression::field("idx")))
            .skip(Expression::lit(1))
            .limit(Expression::lit(2))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new().param("min", 3))
            .unwrap();
        assert_eq!(idx_values(&rows), vec![Value::Integer(6), Value::Integer(5)]);
    }

    #[test]
    fn test_indexed_lookup() {
        let test_db = TestDb::with_schema();
        test_db.db
            .create_index(IndexDefinition::new("Person.name", "Person", &["name"], IndexKind::NotUnique))
            .unwrap();
        test_db.people(20);
        let statement: Statement = SelectStatement::from_class("Person")
            .filter(Condition::eq("name", "n7"))
            .into();

        let explain = test_db.executor.explain(&test_db.db, &statement).unwrap();
        assert!(explain.pretty.contains("FETCH FROM INDEX Person.name"));

        let mut session = test_db.session();
        let before = session.records_loaded();
        let rows = test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new())
            .unwrap();
        assert_eq!(idx_values(&rows), vec![Value::Integer(7)]);
        assert!(session.records_loaded() - before < 20);
    }

    #[test]
    fn test_count_and_projection() {
        let test_db = TestDb::with_schema();
        test_db.people(6);
        let mut session = test_db.session();

        let count: Statement = SelectStatement::from_class("Person")
            .filter(Condition::Compare {
                left: Expression::field("idx"),
                op: CompareOp::Lt,
                right: Expression::lit(4),
            })
            .count()
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &count, QueryOptions::new())
            .unwrap();
        assert_eq!(rows[0].property("count"), Value::Integer(4));

        let projected: Statement = SelectStatement::from_class("Person")
            .project(vec![ProjectionItem::new(Expression::field("name"), "who")])
            .order_by(OrderItem::asc(Expression::field("who")))
            .limit(Expression::lit(2))
            .into();
        let rows = test_db
            .executor
            .execute(&mut session, &projected, QueryOptions::new())
            .unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.property("who")).collect();
        assert_eq!(names, vec![Value::from("n0"), Value::from("n1")]);
        assert!(rows.iter().all(|r| r.is_projection()));
    }

    #[test]
    fn test_unwind_empty_list_drops_row() {
        let test_db = TestDb::with_schema();
        let mut session = test_db.session();
        let mut full = session.new_record("Doc").unwrap();
        full.set("tags", Value::List(vec![Value::from("a"), Value::from("b")]));
        session.save(full).unwrap();
        let mut empty = session.new_record("Doc").unwrap();
        empty.set("tags", Value::List(Vec::new()));
        session.save(empty).unwrap();

        let statement: Statement = SelectStatement::from_class("Doc").unwind(&["tags"]).into();
        let rows = test_db
            .executor
            .execute(&mut session, &statement, QueryOptions::new())
            .unwrap();
        let tags: Vec<Value> = rows.iter().map(|r| r.property("tags")).collect();
        assert_eq!(tags, vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn test_distinct_cap() {
        let test_db = TestDb::with_schema();
        test_db.people(5);
        let executor = QueryExecutor::new(
            ExecutionConfig::for_testing().max_distinct_elements(Some(3)),
        );
        let mut session = test_db.session();
        let statement: Statement = SelectStatement::from_class("Person")
            .project(vec![ProjectionItem::field("idx")])
            .distinct()
            .into();
        let result = executor.execute(&mut session, &statement, QueryOptions::new());
        assert!(matches!(result, Err(Error::CommandExecution(_))));
    }
}
