//! Source steps that read records from storage or context variables

use crate::context::CommandContext;
use crate::result::Row;
use crate::step::{ExecutionStep, StepStats, drain_upstream, explain_line, to_bag};
use crate::stream::{BoxStream, RowProducer, empty, from_producer, from_rows};
use serde::{Deserialize, Serialize};
use tessera_core::{ClusterId, Result, Rid, Value};

/// Loads records by rid as they are pulled; stale rids are skipped
struct RidProducer {
    rids: std::vec::IntoIter<Rid>,
    stats: StepStats,
}

impl RowProducer for RidProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        for rid in self.rids.by_ref() {
            self.stats.poll(ctx)?;
            if let Some(record) = ctx.session().try_load(rid)? {
                let row = Row::element(record);
                ctx.set_current(Some(row.clone()));
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

pub(crate) fn rid_stream(rids: Vec<Rid>, stats: &StepStats) -> BoxStream {
    from_producer(RidProducer {
        rids: rids.into_iter(),
        stats: stats.clone(),
    })
}

fn order_label(order_by_rid_asc: Option<bool>) -> &'static str {
    match order_by_rid_asc {
        Some(false) => " ORDER BY @rid DESC",
        Some(true) => " ORDER BY @rid ASC",
        None => "",
    }
}

/// Scan every record of a class, cluster by cluster
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFromClassStep {
    pub class_name: String,
    pub polymorphic: bool,
    pub order_by_rid_asc: Option<bool>,
    #[serde(skip)]
    stats: StepStats,
}

impl FetchFromClassStep {
    pub const TYPE: &'static str = "FetchFromClass";

    pub fn new<S: Into<String>>(class_name: S, polymorphic: bool, order_by_rid_asc: Option<bool>) -> Self {
        Self {
            class_name: class_name.into(),
            polymorphic,
            order_by_rid_asc,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for FetchFromClassStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        let ascending = self.order_by_rid_asc.unwrap_or(true);
        let rids = ctx
            .session()
            .browse_class(&self.class_name, self.polymorphic, ascending)?;
        Ok(rid_stream(rids, &self.stats))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!(
            "FETCH FROM CLASS {}{}",
            self.class_name,
            order_label(self.order_by_rid_asc)
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

/// Scan one or more clusters in the given order
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFromClusterStep {
    pub cluster_ids: Vec<ClusterId>,
    pub order_by_rid_asc: Option<bool>,
    #[serde(skip)]
    stats: StepStats,
}

impl FetchFromClusterStep {
    pub const TYPE: &'static str = "FetchFromCluster";

    pub fn new(cluster_ids: Vec<ClusterId>, order_by_rid_asc: Option<bool>) -> Self {
        Self {
            cluster_ids,
            order_by_rid_asc,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for FetchFromClusterStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        let ascending = self.order_by_rid_asc.unwrap_or(true);
        let mut clusters = self.cluster_ids.clone();
        clusters.sort_unstable();
        if !ascending {
            clusters.reverse();
        }
        let mut rids = Vec::new();
        for cluster in clusters {
            rids.extend(ctx.session().browse_cluster(cluster, ascending)?);
        }
        Ok(rid_stream(rids, &self.stats))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let ids: Vec<String> = self.cluster_ids.iter().map(|c| c.to_string()).collect();
        let summary = format!(
            "FETCH FROM CLUSTERS [{}]{}",
            ids.join(", "),
            order_label(self.order_by_rid_asc)
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

/// Load an explicit list of records
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFromRidsStep {
    pub rids: Vec<Rid>,
    #[serde(skip)]
    stats: StepStats,
}

impl FetchFromRidsStep {
    pub const TYPE: &'static str = "FetchFromRids";

    pub fn new(rids: Vec<Rid>) -> Self {
        Self {
            rids,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for FetchFromRidsStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        Ok(rid_stream(self.rids.clone(), &self.stats))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let rids: Vec<String> = self.rids.iter().map(Rid::to_string).collect();
        let summary = format!("FETCH FROM RIDS [{}]", rids.join(", "));
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Read rows from a context variable: materialized rows, a list of links or
/// values, or a single value
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFromVariableStep {
    pub variable: String,
    #[serde(skip)]
    stats: StepStats,
}

impl FetchFromVariableStep {
    pub const TYPE: &'static str = "FetchFromVariable";

    pub fn new<S: Into<String>>(variable: S) -> Self {
        Self {
            variable: variable.into(),
            stats: StepStats::default(),
        }
    }
}

pub(crate) fn value_row(value: Value) -> Row {
    match value {
        Value::Map(map) => Row::projection(map.into_iter().collect()),
        other => Row::with("value", other),
    }
}

impl ExecutionStep for FetchFromVariableStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        if let Some(rows) = ctx.rows(&self.variable) {
            return Ok(from_rows(rows.as_ref().clone()));
        }
        let value = ctx.variable(&self.variable).unwrap_or_default();
        let items = match value {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            single => vec![single],
        };
        if items.iter().all(|v| v.as_link().is_some()) {
            let rids = items.iter().filter_map(Value::as_link).collect();
            return Ok(rid_stream(rids, &self.stats));
        }
        Ok(from_rows(items.into_iter().map(value_row)))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("FETCH FROM VARIABLE ${}", self.variable);
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Produces nothing; used when the planner proves a target empty
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EmptyStep {
    #[serde(skip)]
    stats: StepStats,
}

impl EmptyStep {
    pub const TYPE: &'static str = "Empty";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for EmptyStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        Ok(empty())
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "EMPTY", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}
