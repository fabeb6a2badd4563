//! Row-shaping steps: projections, DISTINCT, ORDER BY, SKIP/LIMIT,
//! UNWIND, EXPAND and COUNT

use crate::context::CommandContext;
use crate::expr::Expression;
use crate::result::{DistinctKey, Row};
use crate::step::fetch::{rid_stream, value_row};
use crate::step::{ExecutionStep, StepStats, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, RowProducer, StreamExt, consume, empty, from_producer, from_rows};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tessera_core::{Error, Result, Value};
use tracing::debug;

/// `expression AS alias`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionItem {
    pub expression: Expression,
    pub alias: String,
}

impl ProjectionItem {
    pub fn new<S: Into<String>>(expression: Expression, alias: S) -> Self {
        Self {
            expression,
            alias: alias.into(),
        }
    }

    /// `field AS field`
    pub fn field(name: &str) -> Self {
        Self::new(Expression::field(name), name)
    }
}

/// Evaluate projections into detached rows
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStep {
    pub items: Vec<ProjectionItem>,
    #[serde(skip)]
    stats: StepStats,
}

impl ProjectionStep {
    pub const TYPE: &'static str = "Projection";

    pub fn new(items: Vec<ProjectionItem>) -> Self {
        Self {
            items,
            stats: StepStats::default(),
        }
    }
}

pub(crate) fn project(items: &[ProjectionItem], row: &Row, ctx: &mut CommandContext<'_>) -> Result<Row> {
    let mut values = IndexMap::with_capacity(items.len());
    for item in items {
        values.insert(item.alias.clone(), item.expression.evaluate(row, ctx)?);
    }
    Ok(Row::projection(values))
}

impl ExecutionStep for ProjectionStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let items = self.items.clone();
        Ok(upstream.map_rows(move |row, ctx| {
            ctx.set_current(Some(row.clone()));
            project(&items, &row, ctx)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let items: Vec<String> = self
            .items
            .iter()
            .map(|item| format!("{} AS {}", item.expression, item.alias))
            .collect();
        let summary = format!("CALCULATE PROJECTIONS {}", items.join(", "));
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Error raised when an in-heap buffer outgrows `max_distinct_elements`
pub(crate) fn heap_limit_exceeded(operation: &str, cap: usize) -> Error {
    Error::CommandExecution(format!(
        "Limit of allowed elements for in-heap {} in a single query exceeded ({})",
        operation, cap
    ))
}

/// Drop duplicate rows, keeping the first occurrence.
///
/// Keeps one key per distinct row in memory. The context's
/// `max_distinct_elements` bounds that set; going past it fails the query.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DistinctStep {
    #[serde(skip)]
    stats: StepStats,
}

impl DistinctStep {
    pub const TYPE: &'static str = "Distinct";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for DistinctStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let cap = ctx.config().max_distinct_elements;
        let mut seen: HashSet<DistinctKey> = HashSet::new();
        Ok(upstream.filter_rows(move |row, _ctx| {
            let key = row.distinct_key();
            if seen.contains(&key) {
                return Ok(None);
            }
            if let Some(cap) = cap {
                if seen.len() >= cap {
                    return Err(heap_limit_exceeded("DISTINCT", cap));
                }
            }
            seen.insert(key);
            Ok(Some(row))
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "DISTINCT", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub expression: Expression,
    pub ascending: bool,
}

impl OrderItem {
    pub fn asc(expression: Expression) -> Self {
        Self {
            expression,
            ascending: true,
        }
    }

    pub fn desc(expression: Expression) -> Self {
        Self {
            expression,
            ascending: false,
        }
    }
}

/// Buffered sort. With `max_results` only the best rows are retained while
/// buffering; otherwise the buffer is bounded by `max_distinct_elements`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByStep {
    pub items: Vec<OrderItem>,
    pub max_results: Option<usize>,
    #[serde(skip)]
    stats: StepStats,
}

impl OrderByStep {
    pub const TYPE: &'static str = "OrderBy";

    pub fn new(items: Vec<OrderItem>, max_results: Option<usize>) -> Self {
        Self {
            items,
            max_results,
            stats: StepStats::default(),
        }
    }
}

type SortEntry = (Vec<Value>, Row);

fn compare_keys(items: &[OrderItem], a: &[Value], b: &[Value]) -> Ordering {
    for (i, item) in items.iter().enumerate() {
        let ord = a[i].cmp(&b[i]);
        let ord = if item.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

struct OrderByProducer {
    upstream: Option<BoxStream>,
    items: Vec<OrderItem>,
    max_results: Option<usize>,
    cap: Option<usize>,
    sorted: Option<std::vec::IntoIter<Row>>,
    stats: StepStats,
}

impl OrderByProducer {
    fn buffer(&mut self, upstream: &mut BoxStream, ctx: &mut CommandContext<'_>) -> Result<Vec<Row>> {
        let mut entries: Vec<SortEntry> = Vec::new();
        while upstream.has_next(ctx)? {
            let row = upstream.next(ctx)?;
            self.stats.poll(ctx)?;
            ctx.set_current(Some(row.clone()));
            let mut keys = Vec::with_capacity(self.items.len());
            for item in &self.items {
                keys.push(item.expression.evaluate(&row, ctx)?);
            }
            entries.push((keys, row));
            match self.max_results {
                Some(max) if entries.len() > max.saturating_mul(2).max(16) => {
                    entries.sort_by(|a, b| compare_keys(&self.items, &a.0, &b.0));
                    entries.truncate(max);
                }
                None => {
                    if let Some(cap) = self.cap {
                        if entries.len() > cap {
                            return Err(heap_limit_exceeded("ORDER BY", cap));
                        }
                    }
                }
                _ => {}
            }
        }
        entries.sort_by(|a, b| compare_keys(&self.items, &a.0, &b.0));
        if let Some(max) = self.max_results {
            entries.truncate(max);
        }
        Ok(entries.into_iter().map(|(_, row)| row).collect())
    }
}

impl RowProducer for OrderByProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        if self.sorted.is_none() {
            let Some(mut upstream) = self.upstream.take() else {
                return Ok(None);
            };
            let rows = self.buffer(&mut upstream, ctx);
            upstream.close(ctx);
            let rows = rows?;
            debug!(rows = rows.len(), "Sorted rows in memory");
            self.sorted = Some(rows.into_iter());
        }
        Ok(self.sorted.as_mut().and_then(Iterator::next))
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close(ctx);
        }
        self.sorted = None;
    }
}

impl ExecutionStep for OrderByStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(from_producer(OrderByProducer {
            upstream: Some(upstream),
            items: self.items.clone(),
            max_results: self.max_results,
            cap: ctx.config().max_distinct_elements,
            sorted: None,
            stats: self.stats.clone(),
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let items: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{} {}",
                    item.expression,
                    if item.ascending { "ASC" } else { "DESC" }
                )
            })
            .collect();
        let mut summary = format!("ORDER BY {}", items.join(", "));
        if let Some(max) = self.max_results {
            summary.push_str(&format!(" (buffer size: {})", max));
        }
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Evaluate a SKIP/LIMIT count once when the step starts
fn evaluate_count(expression: &Expression, clause: &str, ctx: &mut CommandContext<'_>) -> Result<i64> {
    match expression.evaluate(&Row::new(), ctx)? {
        Value::Integer(n) => Ok(n),
        Value::Null => Ok(-1),
        other => Err(Error::TypeMismatch {
            expected: format!("integer {}", clause),
            found: other.type_name().to_string(),
        }),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipStep {
    pub count: Expression,
    #[serde(skip)]
    stats: StepStats,
}

impl SkipStep {
    pub const TYPE: &'static str = "Skip";

    pub fn new(count: Expression) -> Self {
        Self {
            count,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for SkipStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let to_skip = evaluate_count(&self.count, "SKIP", ctx)?;
        if to_skip <= 0 {
            return Ok(upstream);
        }
        let mut skipped = 0;
        Ok(upstream.filter_rows(move |row, _ctx| {
            if skipped < to_skip {
                skipped += 1;
                return Ok(None);
            }
            Ok(Some(row))
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("SKIP ({})", self.count), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Stop after `count` rows; a negative count disables the limit
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStep {
    pub count: Expression,
    #[serde(skip)]
    stats: StepStats,
}

impl LimitStep {
    pub const TYPE: &'static str = "Limit";

    pub fn new(count: Expression) -> Self {
        Self {
            count,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for LimitStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let limit = evaluate_count(&self.count, "LIMIT", ctx)?;
        if limit < 0 {
            return Ok(upstream);
        }
        Ok(upstream.limit(limit as usize))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("LIMIT ({})", self.count), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// One row per element of each listed collection field.
///
/// Null and scalar values pass the row through unchanged, an empty list
/// removes it. Unwound rows are detached projections.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwindStep {
    pub fields: Vec<String>,
    #[serde(skip)]
    stats: StepStats,
}

impl UnwindStep {
    pub const TYPE: &'static str = "Unwind";

    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            stats: StepStats::default(),
        }
    }
}

fn detach(row: &Row) -> Row {
    if row.is_projection() {
        return row.clone();
    }
    let values = row
        .property_names()
        .into_iter()
        .map(|name| {
            let value = row.property(&name);
            (name, value)
        })
        .collect();
    Row::projection(values)
}

fn unwind(row: Row, fields: &[String], out: &mut Vec<Row>) {
    let Some((first, rest)) = fields.split_first() else {
        out.push(row);
        return;
    };
    match row.property(first) {
        Value::List(items) => {
            for item in items {
                let mut unwound = detach(&row);
                unwound.set_property(first.clone(), item);
                unwind(unwound, rest, out);
            }
        }
        _ => unwind(row, rest, out),
    }
}

impl ExecutionStep for UnwindStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let fields = self.fields.clone();
        Ok(upstream.flat_map_rows(move |row, _ctx| {
            let mut rows = Vec::new();
            unwind(row, &fields, &mut rows);
            Ok(from_rows(rows))
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("UNWIND {}", self.fields.join(", "));
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Replace each row by the records or maps its expression yields.
///
/// Links load lazily, stale links vanish. Null and scalar values yield no
/// rows at all.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandStep {
    pub expression: Expression,
    #[serde(skip)]
    stats: StepStats,
}

impl ExpandStep {
    pub const TYPE: &'static str = "Expand";

    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            stats: StepStats::default(),
        }
    }
}

fn expand(value: Value, stats: &StepStats, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
    Ok(match value {
        Value::Link(rid) => rid_stream(vec![rid], stats),
        Value::Map(map) => from_rows(vec![value_row(Value::Map(map))]),
        Value::List(items) if items.iter().all(|v| v.as_link().is_some()) => {
            rid_stream(items.iter().filter_map(Value::as_link).collect(), stats)
        }
        Value::List(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Null => {}
                    Value::Link(rid) => {
                        if let Some(record) = ctx.session().try_load(rid)? {
                            rows.push(Row::element(record));
                        }
                    }
                    other => rows.push(value_row(other)),
                }
            }
            from_rows(rows)
        }
        _ => empty(),
    })
}

impl ExecutionStep for ExpandStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let expression = self.expression.clone();
        let stats = self.stats.clone();
        Ok(upstream.flat_map_rows(move |row, ctx| {
            ctx.set_current(Some(row.clone()));
            let value = expression.evaluate(&row, ctx)?;
            expand(value, &stats, ctx)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("EXPAND {}", self.expression), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Consume the upstream and emit a single `count` row
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CountStep {
    #[serde(skip)]
    stats: StepStats,
}

impl CountStep {
    pub const TYPE: &'static str = "Count";

    pub fn new() -> Self {
        Self::default()
    }
}

struct CountProducer {
    upstream: Option<BoxStream>,
}

impl RowProducer for CountProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        match self.upstream.take() {
            Some(upstream) => Ok(Some(Row::with("count", consume(upstream, ctx)? as i64))),
            None => Ok(None),
        }
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close(ctx);
        }
    }
}

impl ExecutionStep for CountStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(from_producer(CountProducer {
            upstream: Some(upstream),
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "COUNT", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}
