//! Steps of a MATCH plan
//!
//! Match rows are projections binding each alias to a link. Roots start a
//! path per candidate, traversal steps extend every path along one pattern
//! edge, and the return step shapes the completed paths.

use crate::context::CommandContext;
use crate::matching::pattern::is_anonymous;
use crate::matching::traverser::{EdgeTraversal, TargetFilter};
use crate::result::Row;
use crate::step::transform::{ProjectionItem, heap_limit_exceeded, project};
use crate::step::{ExecutionStep, StepStats, drain_upstream, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, RowProducer, StreamExt, empty, from_producer, from_rows};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tessera_core::{Error, Record, Result, Rid, Value};
use tracing::debug;

/// Metadata key listing the aliases bound to an empty optional
pub const EMPTY_OPTIONALS: &str = "$emptyOptionals";

/// Context row variable holding the prefetched candidates of an alias
pub fn prefetch_variable(alias: &str) -> String {
    format!("prefetched.{}", alias)
}

/// An optional edge found nothing. An alias bound earlier keeps its value;
/// otherwise it is bound to null and recorded as an empty optional.
fn bind_empty_optional(mut row: Row, alias: &str) -> Row {
    if matches!(row.property(alias), Value::Link(_)) {
        return row;
    }
    row.set_property(alias.to_string(), Value::Null);
    let mut aliases = match row.remove_metadata(EMPTY_OPTIONALS) {
        Some(Value::List(aliases)) => aliases,
        _ => Vec::new(),
    };
    aliases.push(Value::from(alias));
    row.set_metadata(EMPTY_OPTIONALS, Value::List(aliases));
    row
}

/// Loads every candidate of a root alias once, before matching starts
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPrefetchStep {
    pub alias: String,
    pub target: TargetFilter,
    #[serde(skip)]
    stats: StepStats,
}

impl MatchPrefetchStep {
    pub const TYPE: &'static str = "MatchPrefetch";

    pub fn new<S: Into<String>>(alias: S, target: TargetFilter) -> Self {
        Self {
            alias: alias.into(),
            target,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for MatchPrefetchStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        let rids = match (&self.target.rid, &self.target.class_name) {
            (Some(rid), _) => vec![*rid],
            (None, Some(class_name)) => ctx.session().browse_class(class_name, true, true)?,
            (None, None) => {
                return Err(Error::CommandExecution(format!(
                    "Cannot prefetch alias {} without a class or rid",
                    self.alias
                )));
            }
        };
        let mut rows = Vec::new();
        for rid in rids {
            self.stats.poll(ctx)?;
            let Some(record) = ctx.session().try_load(rid)? else {
                continue;
            };
            if self.target.matches(&record, 0, ctx)? {
                rows.push(Row::element(record));
            }
        }
        debug!(alias = %self.alias, rows = rows.len(), "Prefetched MATCH candidates");
        ctx.set_rows(prefetch_variable(&self.alias), rows);
        Ok(empty())
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("PREFETCH {} {{{}}}", self.alias, self.target.describe());
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

enum Candidates {
    Rids(Vec<Rid>),
    Rows(Arc<Vec<Row>>),
}

impl Candidates {
    fn len(&self) -> usize {
        match self {
            Candidates::Rids(rids) => rids.len(),
            Candidates::Rows(rows) => rows.len(),
        }
    }

    fn load(&self, index: usize, ctx: &mut CommandContext<'_>) -> Result<Option<Record>> {
        match self {
            Candidates::Rids(rids) => ctx.session().try_load(rids[index]),
            Candidates::Rows(rows) => Ok(rows[index].as_element().cloned()),
        }
    }
}

/// Cartesian product of seed paths with the candidates of a root alias
struct MatchFirstProducer {
    alias: String,
    /// `None` when candidates were filtered by a prefetch step
    target: Option<TargetFilter>,
    candidates: Candidates,
    seeds: Option<BoxStream>,
    seed: Option<Row>,
    seeded: bool,
    position: usize,
    stats: StepStats,
}

impl MatchFirstProducer {
    fn next_seed(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        match &mut self.seeds {
            Some(seeds) => {
                if seeds.has_next(ctx)? {
                    Ok(Some(seeds.next(ctx)?))
                } else {
                    Ok(None)
                }
            }
            None if !self.seeded => {
                self.seeded = true;
                Ok(Some(Row::new()))
            }
            None => Ok(None),
        }
    }
}

impl RowProducer for MatchFirstProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        loop {
            let seed = match self.seed.take() {
                Some(seed) => seed,
                None => match self.next_seed(ctx)? {
                    Some(seed) => {
                        self.position = 0;
                        seed
                    }
                    None => return Ok(None),
                },
            };
            while self.position < self.candidates.len() {
                let index = self.position;
                self.position += 1;
                self.stats.poll(ctx)?;
                let Some(record) = self.candidates.load(index, ctx)? else {
                    continue;
                };
                if let Some(target) = &self.target {
                    let previous = ctx.set_matched(Some(seed.clone()));
                    let accepted = target.matches(&record, 0, ctx);
                    ctx.set_matched(previous);
                    if !accepted? {
                        continue;
                    }
                }
                let mut row = seed.clone();
                row.set_property(self.alias.clone(), Value::Link(record.rid));
                self.seed = Some(seed);
                return Ok(Some(row));
            }
        }
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        if let Some(seeds) = &mut self.seeds {
            seeds.close(ctx);
        }
    }
}

/// Binds a root alias. The first root of a plan starts from a single empty
/// path; later roots of disconnected components extend every upstream path.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFirstStep {
    pub alias: String,
    pub target: TargetFilter,
    pub prefetched: bool,
    pub extends_upstream: bool,
    #[serde(skip)]
    stats: StepStats,
}

impl MatchFirstStep {
    pub const TYPE: &'static str = "MatchFirst";

    pub fn new<S: Into<String>>(alias: S, target: TargetFilter) -> Self {
        Self {
            alias: alias.into(),
            target,
            prefetched: false,
            extends_upstream: false,
            stats: StepStats::default(),
        }
    }

    /// Read candidates from the matching [`MatchPrefetchStep`]
    pub fn prefetched(mut self) -> Self {
        self.prefetched = true;
        self
    }

    pub fn extending_upstream(mut self) -> Self {
        self.extends_upstream = true;
        self
    }
}

impl ExecutionStep for MatchFirstStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let seeds = if self.extends_upstream {
            Some(require_upstream(upstream, Self::TYPE)?)
        } else {
            drain_upstream(upstream, ctx)?;
            None
        };
        let candidates = if self.prefetched {
            let rows = ctx.rows(&prefetch_variable(&self.alias)).ok_or_else(|| {
                Error::IllegalState(format!("No prefetched candidates for alias {}", self.alias))
            })?;
            Candidates::Rows(rows)
        } else if let Some(rid) = self.target.rid {
            Candidates::Rids(vec![rid])
        } else if let Some(class_name) = &self.target.class_name {
            Candidates::Rids(ctx.session().browse_class(class_name, true, true)?)
        } else {
            return Err(Error::CommandExecution(format!(
                "MATCH alias {} has no class or rid to start from",
                self.alias
            )));
        };
        Ok(from_producer(MatchFirstProducer {
            alias: self.alias.clone(),
            target: (!self.prefetched).then(|| self.target.clone()),
            candidates,
            seeds,
            seed: None,
            seeded: false,
            position: 0,
            stats: self.stats.clone(),
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let source = if self.prefetched {
            format!(" FROM ${}", prefetch_variable(&self.alias))
        } else {
            String::new()
        };
        let summary = format!(
            "MATCH FIRST {{{}, as: {}}}{}",
            self.target.describe(),
            self.alias,
            source
        );
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Extends every path along one pattern edge
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStep {
    pub traversal: EdgeTraversal,
    #[serde(skip)]
    stats: StepStats,
}

impl MatchStep {
    pub const TYPE: &'static str = "Match";

    pub fn new(traversal: EdgeTraversal) -> Self {
        Self {
            traversal,
            stats: StepStats::default(),
        }
    }
}

fn extend_path(
    traversal: &EdgeTraversal,
    row: Row,
    ctx: &mut CommandContext<'_>,
    stats: &StepStats,
) -> Result<Vec<Row>> {
    let source = match row.property(&traversal.from) {
        Value::Link(rid) => rid,
        _ if traversal.optional => return Ok(vec![bind_empty_optional(row, &traversal.to)]),
        _ => return Ok(Vec::new()),
    };
    let previous = ctx.set_matched(Some(row.clone()));
    let reached = traversal.traverse(source, ctx, stats);
    ctx.set_matched(previous);

    let bound = match row.property(&traversal.to) {
        Value::Link(rid) => Some(rid),
        _ => None,
    };
    let mut rows = Vec::new();
    for reached in reached? {
        if bound.is_some_and(|rid| rid != reached.rid) {
            continue;
        }
        let mut extended = row.clone();
        extended.set_property(traversal.to.clone(), Value::Link(reached.rid));
        for (name, value) in traversal.annotations(&reached) {
            extended.set_property(name, value);
        }
        rows.push(extended);
    }
    if rows.is_empty() && traversal.optional {
        rows.push(bind_empty_optional(row, &traversal.to));
    }
    Ok(rows)
}

impl ExecutionStep for MatchStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let traversal = self.traversal.clone();
        let stats = self.stats.clone();
        Ok(upstream.flat_map_rows(move |row, ctx| {
            Ok(from_rows(extend_path(&traversal, row, ctx, &stats)?))
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let keyword = if self.traversal.optional {
            "OPTIONAL MATCH"
        } else {
            "MATCH"
        };
        let summary = format!("{} ----> {}", keyword, self.traversal.describe());
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Drops the empty-optional marker once matching is complete
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RemoveEmptyOptionalsStep {
    #[serde(skip)]
    stats: StepStats,
}

impl RemoveEmptyOptionalsStep {
    pub const TYPE: &'static str = "RemoveEmptyOptionals";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for RemoveEmptyOptionalsStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(upstream.map_rows(|mut row, _ctx| {
            row.remove_metadata(EMPTY_OPTIONALS);
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "REMOVE EMPTY OPTIONALS", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Shape of MATCH output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnMode {
    /// One row per path with the named aliases
    Matches,
    /// One row per path with every alias, generated ones included
    Patterns,
    /// The distinct elements bound to named aliases
    Elements,
    /// The distinct elements bound to any alias
    PathElements,
    /// Projections evaluated with `$matched` bound to the path
    Items(Vec<ProjectionItem>),
}

impl std::fmt::Display for ReturnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnMode::Matches => write!(f, "$matches"),
            ReturnMode::Patterns => write!(f, "$patterns"),
            ReturnMode::Elements => write!(f, "$elements"),
            ReturnMode::PathElements => write!(f, "$pathElements"),
            ReturnMode::Items(items) => {
                let items: Vec<String> = items
                    .iter()
                    .map(|i| format!("{} AS {}", i.expression, i.alias))
                    .collect();
                write!(f, "{}", items.join(", "))
            }
        }
    }
}

/// Turns completed paths into output rows
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnMatchesStep {
    pub mode: ReturnMode,
    /// Aliases in pattern order
    pub aliases: Vec<String>,
    #[serde(skip)]
    stats: StepStats,
}

impl ReturnMatchesStep {
    pub const TYPE: &'static str = "ReturnMatches";

    pub fn new(mode: ReturnMode, aliases: Vec<String>) -> Self {
        Self {
            mode,
            aliases,
            stats: StepStats::default(),
        }
    }
}

fn keep_properties(row: &Row, keep: impl Fn(&str) -> bool) -> Row {
    let values = row
        .property_names()
        .into_iter()
        .filter(|name| keep(name))
        .map(|name| {
            let value = row.property(&name);
            (name, value)
        })
        .collect();
    Row::projection(values)
}

impl ExecutionStep for ReturnMatchesStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let cap = ctx.config().max_distinct_elements;
        Ok(match &self.mode {
            ReturnMode::Matches => upstream.map_rows(|row, _ctx| Ok(keep_properties(&row, |name| !is_anonymous(name)))),
            ReturnMode::Patterns => upstream.map_rows(|row, _ctx| Ok(keep_properties(&row, |_| true))),
            ReturnMode::Elements | ReturnMode::PathElements => {
                let aliases: Vec<String> = match self.mode {
                    ReturnMode::Elements => self.aliases.iter().filter(|a| !is_anonymous(a)).cloned().collect(),
                    _ => self.aliases.clone(),
                };
                let mut seen = HashSet::new();
                upstream.flat_map_rows(move |row, ctx| {
                    let mut elements = Vec::new();
                    for alias in &aliases {
                        let Value::Link(rid) = row.property(alias) else {
                            continue;
                        };
                        if seen.contains(&rid) {
                            continue;
                        }
                        if let Some(cap) = cap {
                            if seen.len() >= cap {
                                return Err(heap_limit_exceeded("MATCH RETURN", cap));
                            }
                        }
                        seen.insert(rid);
                        if let Some(record) = ctx.session().try_load(rid)? {
                            elements.push(Row::element(record));
                        }
                    }
                    Ok(from_rows(elements))
                })
            }
            ReturnMode::Items(items) => {
                let items = items.clone();
                upstream.map_rows(move |row, ctx| {
                    let previous = ctx.set_matched(Some(row.clone()));
                    let projected = project(&items, &row, ctx);
                    ctx.set_matched(previous);
                    projected
                })
            }
        })
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("RETURN {}", self.mode);
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}
