//! Filter-style steps: WHERE evaluation and membership guards
//!
//! Guards pass each row through unchanged or fail the statement with a
//! command-execution error.

use crate::context::CommandContext;
use crate::expr::Condition;
use crate::result::Row;
use crate::step::{ExecutionStep, StepStats, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tessera_core::{ClusterId, Error, RecordKind, Result};

/// Keep rows satisfying a condition
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStep {
    pub condition: Condition,
    #[serde(skip)]
    stats: StepStats,
}

impl FilterStep {
    pub const TYPE: &'static str = "Filter";

    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for FilterStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let condition = self.condition.clone();
        let stats = self.stats.clone();
        Ok(upstream.filter_rows(move |row, ctx| {
            stats.poll(ctx)?;
            ctx.set_current(Some(row.clone()));
            Ok(condition.evaluate(&row, ctx)?.then_some(row))
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("FILTER ITEMS WHERE {}", self.condition), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

fn require_record<'r>(row: &'r Row, step: &str) -> Result<&'r tessera_core::Record> {
    row.as_element().ok_or_else(|| {
        Error::CommandExecution(format!("{} expects records, got a projection", step))
    })
}

/// Every row must be a record of the class (or a subclass)
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckClassStep {
    pub class_name: String,
    pub polymorphic: bool,
    #[serde(skip)]
    stats: StepStats,
}

impl CheckClassStep {
    pub const TYPE: &'static str = "CheckClass";

    pub fn new<S: Into<String>>(class_name: S, polymorphic: bool) -> Self {
        Self {
            class_name: class_name.into(),
            polymorphic,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for CheckClassStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let class_name = self.class_name.clone();
        let polymorphic = self.polymorphic;
        Ok(upstream.map_rows(move |row, ctx| {
            let record = require_record(&row, "CHECK CLASS")?;
            let matches = if polymorphic {
                ctx.session()
                    .database()
                    .schema()?
                    .is_subclass_of(&record.class, &class_name)
            } else {
                record.class.eq_ignore_ascii_case(&class_name)
            };
            if !matches {
                return Err(Error::CommandExecution(format!(
                    "Record {} is not an instance of {}",
                    record.rid, class_name
                )));
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("CHECK CLASS {}", self.class_name), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Every row must live in one of the clusters
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckClusterStep {
    pub cluster_ids: Vec<ClusterId>,
    #[serde(skip)]
    stats: StepStats,
}

impl CheckClusterStep {
    pub const TYPE: &'static str = "CheckCluster";

    pub fn new(cluster_ids: Vec<ClusterId>) -> Self {
        Self {
            cluster_ids,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for CheckClusterStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let clusters = self.cluster_ids.clone();
        Ok(upstream.map_rows(move |row, _ctx| {
            let record = require_record(&row, "CHECK CLUSTER")?;
            if !clusters.contains(&record.rid.cluster()) {
                return Err(Error::CommandExecution(format!(
                    "Record {} is not in clusters {:?}",
                    record.rid, clusters
                )));
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(
            depth,
            indent,
            &format!("CHECK CLUSTERS {:?}", self.cluster_ids),
            &self.stats,
        )
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Every row must be a vertex, an edge or a plain document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRecordTypeStep {
    pub record_kind: RecordKind,
    #[serde(skip)]
    stats: StepStats,
}

impl CheckRecordTypeStep {
    pub const TYPE: &'static str = "CheckRecordType";

    pub fn new(record_kind: RecordKind) -> Self {
        Self {
            record_kind,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for CheckRecordTypeStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let kind = self.record_kind;
        Ok(upstream.map_rows(move |row, _ctx| {
            let record = require_record(&row, "CHECK RECORD TYPE")?;
            if record.kind != kind {
                return Err(Error::CommandExecution(format!(
                    "Record {} is a {:?}, expected a {:?}",
                    record.rid, record.kind, kind
                )));
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(
            depth,
            indent,
            &format!("CHECK RECORD TYPE {:?}", self.record_kind).to_uppercase(),
            &self.stats,
        )
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Refuse a plain DELETE of vertices and edges, which would leave dangling
/// adjacency links
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CheckSafeDeleteStep {
    #[serde(skip)]
    stats: StepStats,
}

impl CheckSafeDeleteStep {
    pub const TYPE: &'static str = "CheckSafeDelete";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for CheckSafeDeleteStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(upstream.map_rows(|row, _ctx| {
            if let Some(record) = row.as_element() {
                let kind = match record.kind {
                    RecordKind::Vertex => Some("DELETE VERTEX"),
                    RecordKind::Edge => Some("DELETE EDGE"),
                    RecordKind::Document => None,
                };
                if let Some(command) = kind {
                    return Err(Error::CommandExecution(format!(
                        "Cannot delete {} with DELETE; use {} or UNSAFE",
                        record.rid, command
                    )));
                }
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "CHECK SAFE DELETE", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::fetch::{FetchFromClassStep, FetchFromRidsStep};
    use crate::stream::drain;
    use crate::test_support::TestDb;

    fn run(db: &TestDb, source: &dyn ExecutionStep, check: &dyn ExecutionStep) -> Result<Vec<Row>> {
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let stream = source.start(None, &mut ctx)?;
        let stream = check.start(Some(stream), &mut ctx)?;
        drain(stream, &mut ctx)
    }

    #[test]
    fn test_filter() {
        let db = TestDb::with_schema();
        db.people(5);
        let source = FetchFromClassStep::new("Person", true, None);
        let filter = FilterStep::new(Condition::compare("idx", crate::expr::CompareOp::Ge, 3));
        assert_eq!(run(&db, &source, &filter).unwrap().len(), 2);
    }

    #[test]
    fn test_check_class() {
        let db = TestDb::with_schema();
        let people = db.people(1);
        let docs = db.docs(1);
        let source = FetchFromRidsStep::new(vec![people[0]]);
        assert!(run(&db, &source, &CheckClassStep::new("V", true)).is_ok());
        assert!(run(&db, &source, &CheckClassStep::new("V", false)).is_err());

        let source = FetchFromRidsStep::new(vec![docs[0]]);
        let err = run(&db, &source, &CheckClassStep::new("Person", true)).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(_)));
    }

    #[test]
    fn test_check_cluster_and_record_type() {
        let db = TestDb::with_schema();
        let people = db.people(1);
        let source = FetchFromRidsStep::new(vec![people[0]]);
        assert!(run(&db, &source, &CheckClusterStep::new(vec![people[0].cluster()])).is_ok());
        assert!(run(&db, &source, &CheckClusterStep::new(vec![-5])).is_err());
        assert!(run(&db, &source, &CheckRecordTypeStep::new(RecordKind::Vertex)).is_ok());
        assert!(run(&db, &source, &CheckRecordTypeStep::new(RecordKind::Edge)).is_err());
    }

    #[test]
    fn test_safe_delete_guard() {
        let db = TestDb::with_schema();
        let people = db.people(1);
        let docs = db.docs(1);
        let vertices = FetchFromRidsStep::new(people);
        assert!(run(&db, &vertices, &CheckSafeDeleteStep::new()).is_err());
        let documents = FetchFromRidsStep::new(docs);
        assert_eq!(run(&db, &documents, &CheckSafeDeleteStep::new()).unwrap().len(), 1);
    }
}
