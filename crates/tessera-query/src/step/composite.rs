//! Steps that own nested plans: cartesian product, parallel union,
//! sub-queries, LET prefetch, batch commits, retry and script blocks

use crate::context::CommandContext;
use crate::expr::Expression;
use crate::plan::ExecutionPlan;
use crate::result::Row;
use crate::step::{ExecutionStep, StepStats, drain_upstream, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, RowProducer, StreamExt, consume, drain, empty, from_producer, from_rows};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tessera_core::{Error, Result};
use tracing::{debug, info, warn};

fn print_sub_plans(
    header: String,
    plans: &[Arc<ExecutionPlan>],
    depth: usize,
    indent: usize,
    stats: &StepStats,
) -> String {
    let mut lines = vec![explain_line(depth, indent, &header, stats)];
    for plan in plans {
        lines.push(plan.pretty_print(depth + 1, indent));
    }
    lines.join("\n")
}

fn as_refs(plans: &[Arc<ExecutionPlan>]) -> Vec<&ExecutionPlan> {
    plans.iter().map(Arc::as_ref).collect()
}

/// One row holding the properties of every row of a tuple, later rows
/// overwriting earlier ones
fn merge_rows(tuple: &[Row]) -> Row {
    let mut values = IndexMap::new();
    for row in tuple {
        for name in row.property_names() {
            let value = row.property(&name);
            values.insert(name, value);
        }
    }
    Row::projection(values)
}

/// Lazy nested-loop cross join of the sub-plans.
///
/// The stream of sub-plan `i` is opened fresh for every tuple of the first
/// `i` sub-plans and closed as soon as that tuple advances.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartesianProductStep {
    pub sub_plans: Vec<Arc<ExecutionPlan>>,
    #[serde(skip)]
    stats: StepStats,
}

impl CartesianProductStep {
    pub const TYPE: &'static str = "CartesianProduct";

    pub fn new(sub_plans: Vec<ExecutionPlan>) -> Self {
        Self {
            sub_plans: sub_plans.into_iter().map(Arc::new).collect(),
            stats: StepStats::default(),
        }
    }
}

struct CartesianProducer {
    plans: Vec<Arc<ExecutionPlan>>,
    streams: Vec<Option<BoxStream>>,
    tuple: Vec<Row>,
    started: bool,
}

impl CartesianProducer {
    fn open(&mut self, level: usize, ctx: &mut CommandContext<'_>) -> Result<()> {
        if let Some(mut stale) = self.streams[level].take() {
            stale.close(ctx);
        }
        self.streams[level] = Some(self.plans[level].start(ctx)?);
        Ok(())
    }
}

impl RowProducer for CartesianProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        let levels = self.plans.len();
        if levels == 0 {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.open(0, ctx)?;
        }
        loop {
            let depth = self.tuple.len();
            if depth == levels {
                let row = merge_rows(&self.tuple);
                self.tuple.pop();
                return Ok(Some(row));
            }
            let Some(stream) = self.streams[depth].as_mut() else {
                return Ok(None);
            };
            if stream.has_next(ctx)? {
                let row = stream.next(ctx)?;
                self.tuple.push(row);
                if depth + 1 < levels {
                    self.open(depth + 1, ctx)?;
                }
                continue;
            }
            if let Some(mut exhausted) = self.streams[depth].take() {
                exhausted.close(ctx);
            }
            if depth == 0 {
                return Ok(None);
            }
            self.tuple.pop();
        }
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        for stream in self.streams.iter_mut().rev() {
            if let Some(mut stream) = stream.take() {
                stream.close(ctx);
            }
        }
        self.tuple.clear();
    }
}

impl ExecutionStep for CartesianProductStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        Ok(from_producer(CartesianProducer {
            plans: self.sub_plans.clone(),
            streams: (0..self.sub_plans.len()).map(|_| None).collect(),
            tuple: Vec::with_capacity(self.sub_plans.len()),
            started: false,
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        print_sub_plans("CARTESIAN PRODUCT".to_string(), &self.sub_plans, depth, indent, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        as_refs(&self.sub_plans)
    }
}

/// Union of the sub-plans' rows, one sub-plan after the other
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelExecStep {
    pub sub_plans: Vec<Arc<ExecutionPlan>>,
    #[serde(skip)]
    stats: StepStats,
}

impl ParallelExecStep {
    pub const TYPE: &'static str = "ParallelExec";

    pub fn new(sub_plans: Vec<ExecutionPlan>) -> Self {
        Self {
            sub_plans: sub_plans.into_iter().map(Arc::new).collect(),
            stats: StepStats::default(),
        }
    }
}

struct UnionProducer {
    plans: std::vec::IntoIter<Arc<ExecutionPlan>>,
    current: Option<BoxStream>,
}

impl RowProducer for UnionProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                if stream.has_next(ctx)? {
                    return stream.next(ctx).map(Some);
                }
                stream.close(ctx);
                self.current = None;
            }
            match self.plans.next() {
                Some(plan) => self.current = Some(plan.start(ctx)?),
                None => return Ok(None),
            }
        }
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        if let Some(mut stream) = self.current.take() {
            stream.close(ctx);
        }
    }
}

impl ExecutionStep for ParallelExecStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        Ok(from_producer(UnionProducer {
            plans: self.sub_plans.clone().into_iter(),
            current: None,
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        print_sub_plans("PARALLEL".to_string(), &self.sub_plans, depth, indent, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        as_refs(&self.sub_plans)
    }
}

/// Rows of a nested query used as a FROM target
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQueryStep {
    pub plan: Arc<ExecutionPlan>,
    #[serde(skip)]
    stats: StepStats,
}

impl SubQueryStep {
    pub const TYPE: &'static str = "SubQuery";

    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for SubQueryStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        self.plan.start(ctx)
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        print_sub_plans(
            "FETCH FROM SUBQUERY".to_string(),
            std::slice::from_ref(&self.plan),
            depth,
            indent,
            &self.stats,
        )
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        vec![self.plan.as_ref()]
    }
}

/// Value bound by a global LET
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LetSource {
    /// Rows of a query, materialized once
    Query(Arc<ExecutionPlan>),
    /// A row-independent expression
    Expression(Expression),
}

/// `LET $name = ...` evaluated once, before any row flows
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLetStep {
    pub variable: String,
    pub source: LetSource,
    #[serde(skip)]
    stats: StepStats,
}

impl GlobalLetStep {
    pub const TYPE: &'static str = "GlobalLet";

    pub fn query<S: Into<String>>(variable: S, plan: ExecutionPlan) -> Self {
        Self {
            variable: variable.into(),
            source: LetSource::Query(Arc::new(plan)),
            stats: StepStats::default(),
        }
    }

    pub fn expression<S: Into<String>>(variable: S, expression: Expression) -> Self {
        Self {
            variable: variable.into(),
            source: LetSource::Expression(expression),
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for GlobalLetStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        match &self.source {
            LetSource::Query(plan) => {
                let rows = drain(plan.start(ctx)?, ctx)?;
                debug!(variable = %self.variable, rows = rows.len(), "Prefetched LET query");
                ctx.set_rows(self.variable.clone(), rows);
            }
            LetSource::Expression(expression) => {
                let value = expression.evaluate(&Row::new(), ctx)?;
                ctx.set_variable(self.variable.clone(), value);
            }
        }
        Ok(upstream.unwrap_or_else(empty))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        match &self.source {
            LetSource::Query(plan) => print_sub_plans(
                format!("LET (once) ${} =", self.variable),
                std::slice::from_ref(plan),
                depth,
                indent,
                &self.stats,
            ),
            LetSource::Expression(expression) => explain_line(
                depth,
                indent,
                &format!("LET (once) ${} = {}", self.variable, expression),
                &self.stats,
            ),
        }
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        match &self.source {
            LetSource::Query(plan) => vec![plan.as_ref()],
            LetSource::Expression(_) => Vec::new(),
        }
    }
}

/// Commit and reopen the active transaction every `size` rows
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStep {
    #[serde(deserialize_with = "non_zero")]
    pub size: usize,
    #[serde(skip)]
    stats: StepStats,
}

impl BatchStep {
    pub const TYPE: &'static str = "Batch";

    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for BatchStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let size = self.size;
        let mut count = 0usize;
        Ok(upstream.map_rows(move |row, ctx| {
            count += 1;
            if count % size == 0 && ctx.session().is_transaction_active() {
                ctx.session().commit()?;
                ctx.session().begin()?;
                debug!(rows = count, "Committed batch");
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("BATCH COMMIT EVERY {}", self.size), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Batch sizes and attempt counts read from a plan must be positive
fn non_zero<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default + PartialEq,
{
    let value = T::deserialize(deserializer)?;
    if value == T::default() {
        return Err(D::Error::custom("expected a positive count, found 0"));
    }
    Ok(value)
}

/// Result of one transactional attempt
#[derive(Debug)]
pub enum RetryOutcome {
    Ok(Vec<Row>),
    /// A concurrent modification; the attempt may be repeated
    Conflict(Error),
    Fatal(Error),
}

impl RetryOutcome {
    fn from_result(result: Result<Vec<Row>>) -> Self {
        match result {
            Ok(rows) => RetryOutcome::Ok(rows),
            Err(e) if e.is_retryable() => RetryOutcome::Conflict(e),
            Err(e) => RetryOutcome::Fatal(e),
        }
    }
}

/// `BEGIN ... COMMIT RETRY n [ELSE {...} [AND CONTINUE | AND FAIL]]`.
///
/// Runs the body inside a transaction at most `attempts` times, rolling back
/// between attempts. When every attempt conflicts the ELSE body runs; with
/// `else_fail` (or without an ELSE body) the last conflict is raised.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStep {
    pub body: Arc<ExecutionPlan>,
    #[serde(deserialize_with = "non_zero")]
    pub attempts: u32,
    pub else_body: Option<Arc<ExecutionPlan>>,
    pub else_fail: bool,
    #[serde(skip)]
    stats: StepStats,
}

impl RetryStep {
    pub const TYPE: &'static str = "Retry";

    pub fn new(body: ExecutionPlan, attempts: u32) -> Self {
        Self {
            body: Arc::new(body),
            attempts: attempts.max(1),
            else_body: None,
            else_fail: true,
            stats: StepStats::default(),
        }
    }

    pub fn with_else(mut self, else_body: ExecutionPlan, else_fail: bool) -> Self {
        self.else_body = Some(Arc::new(else_body));
        self.else_fail = else_fail;
        self
    }

    fn attempt(&self, ctx: &mut CommandContext<'_>) -> RetryOutcome {
        let outcome = RetryOutcome::from_result(run_in_transaction(&self.body, ctx));
        if !matches!(outcome, RetryOutcome::Ok(_)) && ctx.session().is_transaction_active() {
            if let Err(e) = ctx.session().rollback() {
                return RetryOutcome::Fatal(e);
            }
        }
        outcome
    }

    fn run(&self, ctx: &mut CommandContext<'_>) -> Result<Vec<Row>> {
        let mut last_conflict = None;
        for attempt in 1..=self.attempts {
            match self.attempt(ctx) {
                RetryOutcome::Ok(rows) => return Ok(rows),
                RetryOutcome::Fatal(e) => return Err(e),
                RetryOutcome::Conflict(e) => {
                    warn!(attempt, max = self.attempts, "Transaction conflict: {}", e);
                    last_conflict = Some(e);
                }
            }
        }
        let conflict = last_conflict
            .unwrap_or_else(|| Error::Internal("Retry loop ended without an attempt".to_string()));
        let Some(else_body) = &self.else_body else {
            return Err(conflict);
        };
        info!("Retries exhausted, running ELSE block");
        let rows = drain(else_body.start(ctx)?, ctx)?;
        if self.else_fail {
            return Err(conflict);
        }
        Ok(rows)
    }
}

fn run_in_transaction(body: &ExecutionPlan, ctx: &mut CommandContext<'_>) -> Result<Vec<Row>> {
    ctx.session().begin()?;
    let rows = drain(body.start(ctx)?, ctx)?;
    ctx.session().commit()?;
    Ok(rows)
}

impl ExecutionStep for RetryStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        if ctx.session().is_transaction_active() {
            return Err(Error::IllegalState(
                "Nested transactions are not supported".to_string(),
            ));
        }
        Ok(from_rows(self.run(ctx)?))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let mut lines = vec![
            explain_line(depth, indent, &format!("RETRY ({} attempts)", self.attempts), &self.stats),
            self.body.pretty_print(depth + 1, indent),
        ];
        if let Some(else_body) = &self.else_body {
            let mode = if self.else_fail { "AND FAIL" } else { "AND CONTINUE" };
            lines.push(explain_line(depth, indent, &format!("ELSE ({})", mode), &self.stats));
            lines.push(else_body.pretty_print(depth + 1, indent));
        }
        lines.join("\n")
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        let mut plans = vec![self.body.as_ref()];
        plans.extend(self.else_body.as_deref());
        plans
    }
}

/// A sequence of statements. All but the last run to completion when the
/// block starts; the last one streams.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptBlockStep {
    pub statements: Vec<Arc<ExecutionPlan>>,
    #[serde(skip)]
    stats: StepStats,
}

impl ScriptBlockStep {
    pub const TYPE: &'static str = "ScriptBlock";

    pub fn new(statements: Vec<ExecutionPlan>) -> Self {
        Self {
            statements: statements.into_iter().map(Arc::new).collect(),
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for ScriptBlockStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        let Some((last, leading)) = self.statements.split_last() else {
            return Ok(empty());
        };
        for statement in leading {
            consume(statement.start(ctx)?, ctx)?;
        }
        last.start(ctx)
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        print_sub_plans("SCRIPT".to_string(), &self.statements, depth, indent, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }

    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        as_refs(&self.statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanKind;
    use crate::step::fetch::{FetchFromClassStep, FetchFromVariableStep};
    use crate::step::mutation::{Assignment, SaveElementStep, UpdateSetStep};
    use crate::step::transform::LimitStep;
    use crate::stream::testing::Tally;
    use crate::test_support::TestDb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_core::Value;

    /// Source backed by a shared tally
    #[derive(Debug)]
    struct TallyStep {
        tally: Tally,
        rows: usize,
        stats: StepStats,
    }

    impl ExecutionStep for TallyStep {
        fn type_name(&self) -> &'static str {
            "Tally"
        }

        fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
            drain_upstream(upstream, ctx)?;
            Ok(self.tally.stream(self.rows))
        }

        fn pretty_print(&self, depth: usize, indent: usize) -> String {
            explain_line(depth, indent, "TALLY", &self.stats)
        }

        fn serialize_step(&self) -> Result<serde_json::Value> {
            Err(Error::Serialization("Tally steps do not serialize".to_string()))
        }

        fn stats(&self) -> &StepStats {
            &self.stats
        }
    }

    /// Fails with a conflict until it has run `failures` times
    #[derive(Debug)]
    struct FlakyStep {
        calls: Arc<AtomicUsize>,
        failures: usize,
        stats: StepStats,
    }

    impl ExecutionStep for FlakyStep {
        fn type_name(&self) -> &'static str {
            "Flaky"
        }

        fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
            let upstream = require_upstream(upstream, "Flaky")?;
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Error::NeedRetry("simulated conflict".to_string()));
            }
            Ok(upstream)
        }

        fn pretty_print(&self, depth: usize, indent: usize) -> String {
            explain_line(depth, indent, "FLAKY", &self.stats)
        }

        fn serialize_step(&self) -> Result<serde_json::Value> {
            Err(Error::Serialization("Flaky steps do not serialize".to_string()))
        }

        fn stats(&self) -> &StepStats {
            &self.stats
        }
    }

    fn tally_plan(tally: &Tally, rows: usize) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new(PlanKind::Sub);
        plan.chain(TallyStep {
            tally: tally.clone(),
            rows,
            stats: StepStats::default(),
        });
        plan
    }

    fn numbers(rows: &[Row], field: &str) -> Vec<i64> {
        rows.iter().filter_map(|r| r.property(field).as_integer()).collect()
    }

    #[test]
    fn test_cartesian_product_is_lazy_nested_loop() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let outer = Tally::default();
        let inner = Tally::default();
        let mut inner_plan = ExecutionPlan::new(PlanKind::Sub);
        inner_plan.chain(TallyStep {
            tally: inner.clone(),
            rows: 2,
            stats: StepStats::default(),
        });
        inner_plan.chain(crate::step::transform::ProjectionStep::new(vec![
            crate::step::transform::ProjectionItem::new(Expression::field("n"), "m"),
        ]));
        let step = CartesianProductStep::new(vec![tally_plan(&outer, 3), inner_plan]);

        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(numbers(&rows, "n"), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(numbers(&rows, "m"), vec![0, 1, 0, 1, 0, 1]);
        // one inner stream per outer row, each closed
        assert_eq!(inner.pulled(), 6);
        assert_eq!(inner.closed(), 3);
        assert_eq!(outer.closed(), 1);
    }

    #[test]
    fn test_cartesian_product_early_close() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let outer = Tally::default();
        let inner = Tally::default();
        let step = CartesianProductStep::new(vec![tally_plan(&outer, 10), tally_plan(&inner, 10)]);
        let stream = step.start(None, &mut ctx).unwrap().limit(3);
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(outer.pulled(), 1);
        assert_eq!(inner.pulled(), 3);
        assert_eq!(outer.closed(), 1);
        assert_eq!(inner.closed(), 1);
    }

    #[test]
    fn test_cartesian_product_with_empty_level() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let outer = Tally::default();
        let inner = Tally::default();
        let step = CartesianProductStep::new(vec![tally_plan(&outer, 3), tally_plan(&inner, 0)]);
        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert!(rows.is_empty());
        assert_eq!(inner.closed(), 3);
    }

    #[test]
    fn test_parallel_union() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let first = Tally::default();
        let second = Tally::default();
        let step = ParallelExecStep::new(vec![tally_plan(&first, 2), tally_plan(&second, 3)]);
        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(numbers(&rows, "n"), vec![0, 1, 0, 1, 2]);
        assert_eq!(first.closed(), 1);
        assert_eq!(second.closed(), 1);
    }

    #[test]
    fn test_global_let_and_sub_query() {
        let db = TestDb::with_schema();
        db.people(4);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let mut query = ExecutionPlan::new(PlanKind::Sub);
        query.chain(FetchFromClassStep::new("Person", true, None));
        query.chain(LimitStep::new(Expression::lit(2)));
        let let_step = GlobalLetStep::query("top", query);
        let constant = GlobalLetStep::expression("answer", Expression::lit(42));
        let read = FetchFromVariableStep::new("top");

        let stream = let_step.start(None, &mut ctx).unwrap();
        let stream = constant.start(Some(stream), &mut ctx).unwrap();
        let rows = drain(read.start(Some(stream), &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(ctx.variable("answer"), Some(Value::Integer(42)));

        let mut inner = ExecutionPlan::new(PlanKind::Sub);
        inner.chain(FetchFromVariableStep::new("top"));
        let sub = SubQueryStep::new(inner);
        let rows = drain(sub.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_batch_commits_every_n_rows() {
        let db = TestDb::with_schema();
        let people = db.people(5);
        let mut session = db.session();
        session.begin().unwrap();
        let mut ctx = db.context(&mut session);

        let fetch = FetchFromClassStep::new("Person", false, Some(true));
        let set = UpdateSetStep::new(vec![Assignment::new("x", Expression::lit(1))]);
        let save = SaveElementStep::new();
        let batch = BatchStep::new(2);
        let mut stream = fetch.start(None, &mut ctx).unwrap();
        for step in [&set as &dyn ExecutionStep, &save, &batch] {
            stream = step.start(Some(stream), &mut ctx).unwrap();
        }
        for _ in 0..2 {
            assert!(stream.has_next(&mut ctx).unwrap());
            stream.next(&mut ctx).unwrap();
        }
        stream.close(&mut ctx);

        // the first batch is committed and visible to other sessions
        let mut other = db.session();
        assert_eq!(other.load(people[1]).unwrap().get("x"), Some(&Value::Integer(1)));
        assert!(ctx.session().is_transaction_active());
        ctx.session().rollback().unwrap();
    }

    #[test]
    fn test_zero_counts_are_rejected_on_deserialize() {
        let mut bag = BatchStep::new(3).serialize_step().unwrap();
        let copy = crate::plan::deserialize_step(&bag).unwrap();
        assert_eq!(copy.serialize_step().unwrap(), bag);
        bag["size"] = serde_json::json!(0);
        assert!(matches!(
            crate::plan::deserialize_step(&bag),
            Err(Error::Deserialization(_))
        ));

        let mut retry = RetryStep::new(ExecutionPlan::new(PlanKind::Sub), 2)
            .serialize_step()
            .unwrap();
        retry["attempts"] = serde_json::json!(0);
        assert!(matches!(
            crate::plan::deserialize_step(&retry),
            Err(Error::Deserialization(_))
        ));
    }

    fn flaky_plan(calls: &Arc<AtomicUsize>, failures: usize, tally: &Tally) -> ExecutionPlan {
        let mut plan = tally_plan(tally, 1);
        plan.chain(FlakyStep {
            calls: calls.clone(),
            failures,
            stats: StepStats::default(),
        });
        plan
    }

    #[test]
    fn test_retry_succeeds_after_conflicts() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let calls = Arc::new(AtomicUsize::new(0));
        let step = RetryStep::new(flaky_plan(&calls, 2, &Tally::default()), 3);
        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!ctx.session().is_transaction_active());
    }

    #[test]
    fn test_retry_exhausted() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let calls = Arc::new(AtomicUsize::new(0));
        let step = RetryStep::new(flaky_plan(&calls, 10, &Tally::default()), 2);
        let err = step.start(None, &mut ctx).err().expect("expected error");
        assert!(matches!(err, Error::NeedRetry(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let else_tally = Tally::default();
        let step = RetryStep::new(flaky_plan(&calls, 100, &Tally::default()), 2)
            .with_else(tally_plan(&else_tally, 2), false);
        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);

        let step = RetryStep::new(flaky_plan(&calls, 100, &Tally::default()), 2)
            .with_else(tally_plan(&else_tally, 2), true);
        assert!(step.start(None, &mut ctx).is_err());
        assert_eq!(else_tally.pulled(), 4);
    }

    #[test]
    fn test_retry_fatal_error_is_not_retried() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let mut body = ExecutionPlan::new(PlanKind::Sub);
        body.chain(FetchFromClassStep::new("Missing", true, None));
        let step = RetryStep::new(body, 5);
        let err = step.start(None, &mut ctx).err().expect("expected error");
        assert!(!err.is_retryable());
        assert!(!ctx.session().is_transaction_active());
    }

    #[test]
    fn test_script_block() {
        let db = TestDb::with_schema();
        db.people(3);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let mut first = ExecutionPlan::new(PlanKind::Let);
        first.chain(GlobalLetStep::expression("limit", Expression::lit(1)));
        let mut second = ExecutionPlan::new(PlanKind::Select);
        second.chain(FetchFromClassStep::new("Person", true, None));
        second.chain(LimitStep::new(Expression::var("limit")));
        let step = ScriptBlockStep::new(vec![first, second]);
        let rows = drain(step.start(None, &mut ctx).unwrap(), &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            step.pretty_print(0, 2),
            "+ SCRIPT\n  + LET (once) $limit = 1\n  + FETCH FROM CLASS Person\n  + LIMIT ($limit)"
        );
    }
}
