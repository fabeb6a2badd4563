//! MATCH planning
//!
//! Build the pattern, estimate root candidates, schedule, then emit one
//! step per scheduled item. Small dependency-free roots are prefetched so
//! the candidate scan runs once per statement.

use super::Planner;
use crate::matching::pattern::Pattern;
use crate::matching::scheduler::{ScheduledItem, schedule};
use crate::matching::steps::{
    MatchFirstStep, MatchPrefetchStep, MatchStep, RemoveEmptyOptionalsStep, ReturnMatchesStep,
};
use crate::matching::traverser::{EdgeTraversal, TargetFilter};
use crate::plan::{ExecutionPlan, PlanKind};
use crate::statement::MatchStatement;
use std::collections::{HashMap, HashSet};
use tessera_core::{Error, Result};
use tracing::debug;

impl Planner<'_> {
    /// Candidate count per alias that can start a traversal
    fn estimate_roots(&self, pattern: &Pattern) -> Result<HashMap<String, u64>> {
        let mut estimates = HashMap::new();
        for node in pattern.nodes.values() {
            let estimate = match (&node.rid, &node.class_name) {
                (Some(_), _) => 1,
                (None, Some(class_name)) => self.db.count_class(class_name, true)?,
                (None, None) => continue,
            };
            estimates.insert(node.alias.clone(), estimate);
        }
        Ok(estimates)
    }

    pub(super) fn plan_match(&self, statement: &MatchStatement, kind: PlanKind) -> Result<ExecutionPlan> {
        let pattern = Pattern::build(&statement.expressions)?;
        let estimates = self.estimate_roots(&pattern)?;
        let order = schedule(&pattern, &estimates)?;

        let mut plan = ExecutionPlan::new(kind);
        let mut prefetched = HashSet::new();
        for item in &order {
            let ScheduledItem::Root { alias } = item else {
                continue;
            };
            let node = &pattern.nodes[alias.as_str()];
            let small = estimates
                .get(alias)
                .is_some_and(|n| *n <= self.config.match_prefetch_threshold);
            if small && node.rid.is_none() && node.dependencies.is_empty() {
                plan.chain(MatchPrefetchStep::new(alias.clone(), TargetFilter::of(node)));
                prefetched.insert(alias.clone());
            }
        }

        let mut first = true;
        for item in &order {
            match item {
                ScheduledItem::Root { alias } => {
                    let node = &pattern.nodes[alias.as_str()];
                    let mut step = MatchFirstStep::new(alias.clone(), TargetFilter::of(node));
                    if prefetched.contains(alias) {
                        step = step.prefetched();
                    }
                    if !first {
                        step = step.extending_upstream();
                    }
                    first = false;
                    plan.chain(step);
                }
                ScheduledItem::Edge { edge, .. } => {
                    let (from, to, hops) = item.oriented(&pattern).ok_or_else(|| {
                        Error::Planning(format!("Pattern edge {} cannot be walked backwards", edge))
                    })?;
                    let traversal = EdgeTraversal::new(&pattern.edges[*edge], from, &pattern.nodes[to], hops);
                    plan.chain(MatchStep::new(traversal));
                }
            }
        }

        if pattern.has_optional_nodes() {
            plan.chain(RemoveEmptyOptionalsStep::new());
        }
        plan.chain(ReturnMatchesStep::new(
            statement.return_mode.clone(),
            pattern.all_aliases(),
        ));
        self.chain_tail(
            &mut plan,
            statement.distinct,
            &statement.order_by,
            statement.skip.as_ref(),
            statement.limit.as_ref(),
        );
        debug!(items = order.len(), prefetched = prefetched.len(), "Planned MATCH");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::executor::QueryOptions;
    use crate::expr::{CompareOp, Condition, Expression};
    use crate::matching::pattern::{MatchExpression, MatchFilter};
    use crate::matching::steps::ReturnMode;
    use crate::result::Row;
    use crate::statement::Statement;
    use crate::step::transform::{OrderItem, ProjectionItem};
    use crate::stream::drain;
    use crate::test_support::TestDb;
    use tessera_core::{Error, Rid, Value};

    fn types(plan: &ExecutionPlan) -> Vec<&'static str> {
        plan.steps().iter().map(|s| s.type_name()).collect()
    }

    #[test]
    fn test_small_root_is_prefetched() {
        let test_db = TestDb::with_schema();
        test_db.people(3);
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let statement = MatchStatement::new(
            vec![MatchExpression::new(MatchFilter::class("Person").alias("p"))
                .out(&["Friend"], MatchFilter::new().alias("f"))],
            ReturnMode::Matches,
        );
        let plan = planner.plan(&Statement::Match(statement)).unwrap();
        assert_eq!(
            types(&plan),
            vec![
                MatchPrefetchStep::TYPE,
                MatchFirstStep::TYPE,
                MatchStep::TYPE,
                ReturnMatchesStep::TYPE
            ]
        );
    }

    #[test]
    fn test_large_root_is_scanned() {
        let test_db = TestDb::with_schema();
        test_db.people(3);
        let config = ExecutionConfig::for_testing().match_prefetch_threshold(2);
        let planner = Planner::new(&test_db.db, &config);
        let statement = MatchStatement::new(
            vec![MatchExpression::new(MatchFilter::class("Person").alias("p"))],
            ReturnMode::Matches,
        );
        let plan = planner.plan(&Statement::Match(statement)).unwrap();
        assert_eq!(types(&plan), vec![MatchFirstStep::TYPE, ReturnMatchesStep::TYPE]);
    }

    #[test]
    fn test_circular_dependency_fails_before_execution() {
        let test_db = TestDb::with_schema();
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let reads = |alias: &str| Condition::Compare {
            left: Expression::field("idx"),
            op: CompareOp::Lt,
            right: Expression::matched(alias, Some("idx")),
        };
        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").filter(reads("b"))),
                MatchExpression::new(MatchFilter::class("Person").alias("b").filter(reads("a"))),
            ],
            ReturnMode::Matches,
        );
        let err = planner.plan(&Statement::Match(statement)).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(_)));
    }

    #[test]
    fn test_match_with_optional_and_depth() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(3);
        test_db.friend(people[0], people[1]);
        test_db.friend(people[1], people[2]);
        let config = ExecutionConfig::for_testing();
        let planner = Planner::new(&test_db.db, &config);
        let statement = MatchStatement::new(
            vec![MatchExpression::new(
                MatchFilter::class("Person").alias("p").filter(Condition::eq("name", "n0")),
            )
            .out(
                &["Friend"],
                MatchFilter::new().alias("f").max_depth(5).depth_alias("d"),
            )
            .out(&["Friend"], MatchFilter::new().alias("next").optional())],
            ReturnMode::Matches,
        );
        let plan = planner.plan(&Statement::Match(statement)).unwrap();
        assert!(types(&plan).contains(&RemoveEmptyOptionalsStep::TYPE));

        let mut session = test_db.session();
        let mut ctx = test_db.context(&mut session);
        let rows = drain(plan.start(&mut ctx).unwrap(), &mut ctx).unwrap();
        let found: Vec<(Value, Value, Value)> = rows
            .iter()
            .map(|r| (r.property("f"), r.property("d"), r.property("next")))
            .collect();
        assert_eq!(
            found,
            vec![
                (Value::Link(people[0]), Value::Integer(0), Value::Link(people[1])),
                (Value::Link(people[1]), Value::Integer(1), Value::Link(people[2])),
                (Value::Link(people[2]), Value::Integer(2), Value::Null),
            ]
        );
    }

    fn links(rows: &[Row], alias: &str) -> HashSet<Rid> {
        rows.iter()
            .filter_map(|r| match r.property(alias) {
                Value::Link(rid) => Some(rid),
                _ => None,
            })
            .collect()
    }

    fn run(test_db: &TestDb, statement: MatchStatement) -> Result<Vec<Row>> {
        let mut session = test_db.session();
        test_db
            .executor
            .execute(&mut session, &Statement::Match(statement), QueryOptions::new())
    }

    #[test]
    fn test_single_hop_returns_neighbors() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(4);
        test_db.friend(people[0], people[1]);
        test_db.friend(people[0], people[2]);
        test_db.friend(people[3], people[0]);

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").filter(Condition::eq("name", "n0")))
                    .out(&["Friend"], MatchFilter::new().alias("b")),
            ],
            ReturnMode::Matches,
        );
        let rows = run(&test_db, statement).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(links(&rows, "b"), HashSet::from([people[1], people[2]]));
        assert_eq!(links(&rows, "a"), HashSet::from([people[0]]));
    }

    #[test]
    fn test_reverse_traversal_and_projection() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(3);
        test_db.friend(people[1], people[0]);
        test_db.friend(people[2], people[0]);

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").rid(people[0]))
                    .in_(&["Friend"], MatchFilter::class("Person").alias("fan")),
            ],
            ReturnMode::Items(vec![ProjectionItem::new(
                Expression::matched("fan", Some("name")),
                "name",
            )]),
        )
        .order_by(OrderItem::asc(Expression::field("name")));
        let rows = run(&test_db, statement).unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.property("name")).collect();
        assert_eq!(names, vec![Value::from("n1"), Value::from("n2")]);
    }

    #[test]
    fn test_recursive_traversal_survives_cycles() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(4);
        for i in 0..4 {
            test_db.friend(people[i], people[(i + 1) % 4]);
        }

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").rid(people[0])).out(
                    &["Friend"],
                    MatchFilter::new()
                        .alias("b")
                        .while_condition(Condition::True)
                        .depth_alias("d"),
                ),
            ],
            ReturnMode::Matches,
        );
        let rows = run(&test_db, statement).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(links(&rows, "b"), people.iter().copied().collect::<HashSet<_>>());
        let depths: HashSet<Value> = rows.iter().map(|r| r.property("d")).collect();
        assert_eq!(depths, (0..4).map(Value::Integer).collect::<HashSet<_>>());
    }

    #[test]
    fn test_depth_bounded_by_while() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(5);
        for i in 0..4 {
            test_db.friend(people[i], people[i + 1]);
        }

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").rid(people[0])).out(
                    &["Friend"],
                    MatchFilter::new().alias("b").while_condition(Condition::Compare {
                        left: Expression::var("depth"),
                        op: CompareOp::Lt,
                        right: Expression::lit(2),
                    }),
                ),
            ],
            ReturnMode::Matches,
        );
        let rows = run(&test_db, statement).unwrap();
        assert_eq!(links(&rows, "b"), HashSet::from([people[0], people[1], people[2]]));
    }

    #[test]
    fn test_optional_edge_keeps_path_once() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(2);
        test_db.friend(people[0], people[1]);

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a"))
                    .out(&["Friend"], MatchFilter::new().alias("b").optional()),
            ],
            ReturnMode::Matches,
        );
        let rows = run(&test_db, statement).unwrap();
        assert_eq!(rows.len(), 2);
        let lonely: Vec<&Row> = rows
            .iter()
            .filter(|r| r.property("a") == Value::Link(people[1]))
            .collect();
        assert_eq!(lonely.len(), 1);
        assert_eq!(lonely[0].property("b"), Value::Null);
        assert!(rows.iter().all(|r| r.metadata("$emptyOptionals").is_none()));
    }

    #[test]
    fn test_join_between_expressions() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(3);
        test_db.friend(people[0], people[1]);
        test_db.friend(people[1], people[2]);
        test_db.friend(people[0], people[2]);

        // triangles a -> b -> c with a -> c
        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a"))
                    .out(&["Friend"], MatchFilter::new().alias("b"))
                    .out(&["Friend"], MatchFilter::new().alias("c")),
                MatchExpression::new(MatchFilter::new().alias("a"))
                    .out(&["Friend"], MatchFilter::new().alias("c")),
            ],
            ReturnMode::Matches,
        );
        let rows = run(&test_db, statement).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property("a"), Value::Link(people[0]));
        assert_eq!(rows[0].property("c"), Value::Link(people[2]));
    }

    #[test]
    fn test_circular_dependency_fails_fast() {
        let test_db = TestDb::with_schema();
        test_db.people(2);
        let reads = |alias: &str| Condition::Compare {
            left: Expression::field("idx"),
            op: CompareOp::Lt,
            right: Expression::matched(alias, Some("idx")),
        };
        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a").filter(reads("b"))),
                MatchExpression::new(MatchFilter::class("Person").alias("b").filter(reads("a"))),
            ],
            ReturnMode::Matches,
        );
        let mut session = test_db.session();
        let before = session.records_loaded();
        let result = test_db
            .executor
            .execute(&mut session, &Statement::Match(statement), QueryOptions::new());
        assert!(matches!(result, Err(Error::CommandExecution(_))));
        assert_eq!(session.records_loaded(), before);
    }

    #[test]
    fn test_elements_are_deduplicated() {
        let test_db = TestDb::with_schema();
        let people = test_db.people(3);
        test_db.friend(people[0], people[2]);
        test_db.friend(people[1], people[2]);

        let statement = MatchStatement::new(
            vec![
                MatchExpression::new(MatchFilter::class("Person").alias("a"))
                    .out(&["Friend"], MatchFilter::new().alias("b")),
            ],
            ReturnMode::PathElements,
        );
        let rows = run(&test_db, statement).unwrap();
        let rids: Vec<Rid> = rows.iter().filter_map(Row::rid).collect();
        assert_eq!(rids.len(), 3);
        assert_eq!(rids.iter().copied().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn test_undefined_alias_fails_at_planning() {
        let test_db = TestDb::with_schema();
        let statement = MatchStatement::new(
            vec![MatchExpression::new(
                MatchFilter::class("Person")
                    .alias("a")
                    .filter(Condition::Compare {
                        left: Expression::field("idx"),
                        op: CompareOp::Eq,
                        right: Expression::matched("ghost", Some("idx")),
                    }),
            )],
            ReturnMode::Matches,
        );
        let err = run(&test_db, statement).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(ref msg) if msg.contains("ghost")));
    }
}
