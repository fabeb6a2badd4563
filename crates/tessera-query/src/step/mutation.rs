//! Steps that change records: UPDATE (SET, REMOVE, MERGE), INSERT, DELETE
//! and the edge-pointer maintenance that keeps adjacency consistent

use crate::context::CommandContext;
use crate::expr::Expression;
use crate::result::Row;
use crate::step::{ExecutionStep, StepStats, drain_upstream, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, RowProducer, StreamExt, from_producer};
use serde::{Deserialize, Serialize};
use tessera_core::{Direction, EDGE_IN, EDGE_OUT, Error, Fields, Record, Result, Rid, Value};
use tracing::debug;

/// `field = expression`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub field: String,
    pub expression: Expression,
}

impl Assignment {
    pub fn new<S: Into<String>>(field: S, expression: Expression) -> Self {
        Self {
            field: field.into(),
            expression,
        }
    }
}

fn format_assignments(assignments: &[Assignment]) -> String {
    assignments
        .iter()
        .map(|a| format!("{} = {}", a.field, a.expression))
        .collect::<Vec<_>>()
        .join(", ")
}

fn element_mut<'r>(row: &'r mut Row, clause: &str) -> Result<&'r mut Record> {
    row.as_element_mut()
        .ok_or_else(|| Error::CommandExecution(format!("{} needs a record, got a projection", clause)))
}

fn check_writable(field: &str) -> Result<()> {
    if field.starts_with('@') {
        return Err(Error::CommandExecution(format!(
            "Attribute {} cannot be modified",
            field
        )));
    }
    Ok(())
}

/// Snapshot each record before it is modified.
///
/// The record is reloaded from the session; a record that vanished since it
/// was fetched fails the statement.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CopyRecordBeforeUpdateStep {
    #[serde(skip)]
    stats: StepStats,
}

impl CopyRecordBeforeUpdateStep {
    pub const TYPE: &'static str = "CopyRecordBeforeUpdate";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for CopyRecordBeforeUpdateStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(upstream.map_rows(|row, ctx| {
            let rid = row.require_element()?.rid;
            let mut row = row.into_updatable()?;
            let previous = ctx.session().try_load(rid)?.ok_or_else(|| {
                Error::CommandExecution(format!("Record {} not found before update", rid))
            })?;
            row.set_previous(previous);
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "COPY RECORD BEFORE UPDATE", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// `SET field = expression, ...`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSetStep {
    pub assignments: Vec<Assignment>,
    #[serde(skip)]
    stats: StepStats,
}

impl UpdateSetStep {
    pub const TYPE: &'static str = "UpdateSet";

    pub fn new(assignments: Vec<Assignment>) -> Self {
        Self {
            assignments,
            stats: StepStats::default(),
        }
    }
}

pub(crate) fn apply_assignments(
    assignments: &[Assignment],
    mut row: Row,
    ctx: &mut CommandContext<'_>,
) -> Result<Row> {
    ctx.set_current(Some(row.clone()));
    for assignment in assignments {
        check_writable(&assignment.field)?;
        let value = assignment.expression.evaluate(&row, ctx)?;
        element_mut(&mut row, "SET")?.set(assignment.field.clone(), value);
    }
    Ok(row)
}

impl ExecutionStep for UpdateSetStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let assignments = self.assignments.clone();
        Ok(upstream.map_rows(move |row, ctx| apply_assignments(&assignments, row, ctx)))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("UPDATE SET {}", format_assignments(&self.assignments));
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// `REMOVE field, ...`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRemoveStep {
    pub fields: Vec<String>,
    #[serde(skip)]
    stats: StepStats,
}

impl UpdateRemoveStep {
    pub const TYPE: &'static str = "UpdateRemove";

    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for UpdateRemoveStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let fields = self.fields.clone();
        Ok(upstream.map_rows(move |mut row, _ctx| {
            let record = element_mut(&mut row, "REMOVE")?;
            for field in &fields {
                check_writable(field)?;
                record.remove(field);
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("UPDATE REMOVE {}", self.fields.join(", "));
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// `MERGE {map}`: every entry of the map overwrites the field of that name
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMergeStep {
    pub expression: Expression,
    #[serde(skip)]
    stats: StepStats,
}

impl UpdateMergeStep {
    pub const TYPE: &'static str = "UpdateMerge";

    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for UpdateMergeStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let expression = self.expression.clone();
        Ok(upstream.map_rows(move |mut row, ctx| {
            ctx.set_current(Some(row.clone()));
            let entries = match expression.evaluate(&row, ctx)? {
                Value::Map(map) => map,
                other => {
                    return Err(Error::TypeMismatch {
                        expected: "map for MERGE".to_string(),
                        found: other.type_name().to_string(),
                    });
                }
            };
            let record = element_mut(&mut row, "MERGE")?;
            for (field, value) in entries {
                check_writable(&field)?;
                record.set(field, value);
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, &format!("UPDATE MERGE {}", self.expression), &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// After an UPDATE EDGE, move the edge between endpoint adjacency lists when
/// its `out` or `in` changed. Needs the snapshot taken by
/// [`CopyRecordBeforeUpdateStep`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateEdgePointersStep {
    #[serde(skip)]
    stats: StepStats,
}

impl UpdateEdgePointersStep {
    pub const TYPE: &'static str = "UpdateEdgePointers";

    pub fn new() -> Self {
        Self::default()
    }
}

fn require_vertex(rid: Rid, ctx: &mut CommandContext<'_>) -> Result<()> {
    match ctx.session().try_load(rid)? {
        Some(record) if record.is_vertex() => Ok(()),
        Some(_) => Err(Error::CommandExecution(format!(
            "Edge endpoint {} is not a vertex",
            rid
        ))),
        None => Err(Error::CommandExecution(format!(
            "Edge endpoint {} does not exist",
            rid
        ))),
    }
}

fn patch_endpoint(
    edge: &Record,
    direction: Direction,
    before: Option<Rid>,
    after: Option<Rid>,
    ctx: &mut CommandContext<'_>,
) -> Result<()> {
    if before == after {
        return Ok(());
    }
    let field = if direction == Direction::Outgoing { EDGE_OUT } else { EDGE_IN };
    let after = after.ok_or_else(|| {
        Error::CommandExecution(format!("Edge {} lost its '{}' vertex", edge.rid, field))
    })?;
    require_vertex(after, ctx)?;
    if let Some(before) = before {
        ctx.session().detach_edge(before, direction, &edge.class, edge.rid)?;
    }
    ctx.session().attach_edge(after, direction, &edge.class, edge.rid)?;
    debug!(edge = %edge.rid, field, to = %after, "Moved edge endpoint");
    Ok(())
}

impl ExecutionStep for UpdateEdgePointersStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(upstream.map_rows(|row, ctx| {
            let Some(updatable) = row.as_updatable() else {
                return Err(Error::IllegalState(
                    "Edge pointers need the record state before the update".to_string(),
                ));
            };
            let current = &updatable.current;
            if !current.is_edge() {
                return Ok(row);
            }
            let previous = updatable.previous.as_ref().ok_or_else(|| {
                Error::IllegalState(format!("No previous value recorded for {}", current.rid))
            })?;
            patch_endpoint(current, Direction::Outgoing, previous.edge_out(), current.edge_out(), ctx)?;
            patch_endpoint(current, Direction::Incoming, previous.edge_in(), current.edge_in(), ctx)?;
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "UPDATE EDGE POINTERS", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Persist each record. New edges go through edge creation so both
/// endpoints get linked.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SaveElementStep {
    #[serde(skip)]
    stats: StepStats,
}

impl SaveElementStep {
    pub const TYPE: &'static str = "SaveElement";

    pub fn new() -> Self {
        Self::default()
    }
}

fn save_record(record: Record, ctx: &mut CommandContext<'_>) -> Result<Record> {
    if record.is_edge() && !record.rid.is_persistent() {
        let (Some(from), Some(to)) = (record.edge_out(), record.edge_in()) else {
            return Err(Error::CommandExecution(format!(
                "Edge of class {} needs both '{}' and '{}'",
                record.class, EDGE_OUT, EDGE_IN
            )));
        };
        let fields: Fields = record
            .fields
            .into_inner()
            .into_iter()
            .filter(|(name, _)| name != EDGE_OUT && name != EDGE_IN)
            .collect();
        return ctx.session().create_edge(&record.class, from, to, fields);
    }
    ctx.session().save(record)
}

impl ExecutionStep for SaveElementStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let stats = self.stats.clone();
        Ok(upstream.map_rows(move |mut row, ctx| {
            stats.poll(ctx)?;
            let record = element_mut(&mut row, "SAVE")?;
            let saved = save_record(record.clone(), ctx)?;
            *record = saved;
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "SAVE RECORD", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteMode {
    /// Remove the record only
    Record,
    /// Remove the vertex and its incident edges
    Vertex,
    /// Remove the edge and unlink its endpoints
    Edge,
}

/// Delete each record and pass the deleted row on
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteStep {
    pub mode: DeleteMode,
    #[serde(skip)]
    stats: StepStats,
}

impl DeleteStep {
    pub const TYPE: &'static str = "Delete";

    pub fn new(mode: DeleteMode) -> Self {
        Self {
            mode,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for DeleteStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let mode = self.mode;
        let stats = self.stats.clone();
        Ok(upstream.map_rows(move |row, ctx| {
            stats.poll(ctx)?;
            let rid = row.require_element()?.rid;
            match mode {
                DeleteMode::Record => ctx.session().delete(rid)?,
                DeleteMode::Vertex => ctx.session().delete_vertex(rid)?,
                DeleteMode::Edge => ctx.session().delete_edge(rid)?,
            }
            Ok(row)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = match self.mode {
            DeleteMode::Record => "DELETE",
            DeleteMode::Vertex => "DELETE VERTEX",
            DeleteMode::Edge => "DELETE EDGE",
        };
        explain_line(depth, indent, summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// `RETURN BEFORE`: emit the snapshot instead of the updated record
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UnwrapPreviousStep {
    #[serde(skip)]
    stats: StepStats,
}

impl UnwrapPreviousStep {
    pub const TYPE: &'static str = "UnwrapPrevious";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStep for UnwrapPreviousStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        Ok(upstream.map_rows(|row, _ctx| row.unwrap_previous()))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        explain_line(depth, indent, "UNWRAP PREVIOUS VALUE", &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Source of `count` new, unsaved records of a class
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordStep {
    pub class_name: String,
    pub count: usize,
    #[serde(skip)]
    stats: StepStats,
}

impl CreateRecordStep {
    pub const TYPE: &'static str = "CreateRecord";

    pub fn new<S: Into<String>>(class_name: S, count: usize) -> Self {
        Self {
            class_name: class_name.into(),
            count,
            stats: StepStats::default(),
        }
    }
}

struct CreateRecordProducer {
    class_name: String,
    remaining: usize,
}

impl RowProducer for CreateRecordProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let record = ctx.session().new_record(&self.class_name)?;
        Ok(Some(Row::element(record)))
    }
}

impl ExecutionStep for CreateRecordStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        // Unknown classes fail here rather than on the first pull
        ctx.session().new_record(&self.class_name)?;
        Ok(from_producer(CreateRecordProducer {
            class_name: self.class_name.clone(),
            remaining: self.count,
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = format!("CREATE RECORD {} x{}", self.class_name, self.count);
        explain_line(depth, indent, &summary, &self.stats)
    }

    fn serialize_step(&self) -> Result<serde_json::Value> {
        to_bag(Self::TYPE, self)
    }

    fn stats(&self) -> &StepStats {
        &self.stats
    }
}

/// Fill new records from `VALUES` tuples, the n-th record taking the n-th
/// tuple (cycling when there are more records than tuples)
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertValuesStep {
    pub rows: Vec<Vec<Assignment>>,
    #[serde(skip)]
    stats: StepStats,
}

impl InsertValuesStep {
    pub const TYPE: &'static str = "InsertValues";

    pub fn new(rows: Vec<Vec<Assignment>>) -> Self {
        Self {
            rows,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for InsertValuesStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        if self.rows.is_empty() {
            return Ok(upstream);
        }
        let rows = self.rows.clone();
        let mut next = 0;
        Ok(upstream.map_rows(move |row, ctx| {
            let assignments = &rows[next % rows.len()];
            next += 1;
            apply_assignments(assignments, row, ctx)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let tuples: Vec<String> = self
            .rows
            .iter()
            .map(|row| format!("({})", format_assignments(row)))
            .collect();
        let summary = format!("SET VALUES {}", tuples.join(", "));
        explain_line(depth, indent, &summary, &self.stats)
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
    use crate::step::fetch::FetchFromRidsStep;
    use crate::stream::drain;
    use crate::test_support::TestDb;

    fn run_chain(steps: &[&dyn ExecutionStep], ctx: &mut CommandContext<'_>) -> Result<Vec<Row>> {
        let mut stream = None;
        for step in steps {
            stream = Some(step.start(stream, ctx)?);
        }
        match stream {
            Some(stream) => drain(stream, ctx),
            None => Ok(Vec::new()),
        }
    }

    #[test]
    fn test_update_set_remove_merge() {
        let db = TestDb::with_schema();
        let people = db.people(2);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let mut merged = std::collections::BTreeMap::new();
        merged.insert("city".to_string(), Value::from("Rome"));

        let steps: Vec<Box<dyn ExecutionStep>> = vec![
            Box::new(FetchFromRidsStep::new(people.clone())),
            Box::new(CopyRecordBeforeUpdateStep::new()),
            Box::new(UpdateSetStep::new(vec![
                Assignment::new("x", Expression::lit(1)),
                Assignment::new(
                    "label",
                    Expression::arithmetic(
                        crate::expr::ArithmeticOp::Add,
                        Expression::field("name"),
                        Expression::lit("!"),
                    ),
                ),
            ])),
            Box::new(UpdateRemoveStep::new(vec!["idx".to_string()])),
            Box::new(UpdateMergeStep::new(Expression::Literal(Value::Map(merged)))),
            Box::new(SaveElementStep::new()),
        ];
        let refs: Vec<&dyn ExecutionStep> = steps.iter().map(|s| s.as_ref()).collect();
        let rows = run_chain(&refs, &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);

        let stored = ctx.session().load(people[1]).unwrap();
        assert_eq!(stored.get("x"), Some(&Value::Integer(1)));
        assert_eq!(stored.get("label"), Some(&Value::from("n1!")));
        assert_eq!(stored.get("city"), Some(&Value::from("Rome")));
        assert!(stored.get("idx").is_none());
    }

    #[test]
    fn test_return_before() {
        let db = TestDb::with_schema();
        let people = db.people(1);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let fetch = FetchFromRidsStep::new(people.clone());
        let copy = CopyRecordBeforeUpdateStep::new();
        let set = UpdateSetStep::new(vec![Assignment::new("name", Expression::lit("changed"))]);
        let save = SaveElementStep::new();
        let unwrap = UnwrapPreviousStep::new();
        let rows = run_chain(&[&fetch, &copy, &set, &save, &unwrap], &mut ctx).unwrap();
        assert_eq!(rows[0].property("name"), Value::from("n0"));

        let rows = run_chain(&[&fetch, &unwrap], &mut ctx);
        assert!(matches!(rows, Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_attributes_are_read_only() {
        let db = TestDb::with_schema();
        let people = db.people(1);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let fetch = FetchFromRidsStep::new(people);
        let set = UpdateSetStep::new(vec![Assignment::new("@class", Expression::lit("Doc"))]);
        assert!(run_chain(&[&fetch, &set], &mut ctx).is_err());
    }

    #[test]
    fn test_update_edge_moves_pointers() {
        let db = TestDb::with_schema();
        let people = db.people(3);
        let edge = db.friend(people[0], people[1]);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let fetch = FetchFromRidsStep::new(vec![edge]);
        let copy = CopyRecordBeforeUpdateStep::new();
        let set = UpdateSetStep::new(vec![Assignment::new("in", Expression::lit(people[2]))]);
        let pointers = UpdateEdgePointersStep::new();
        let save = SaveElementStep::new();
        run_chain(&[&fetch, &copy, &set, &pointers, &save], &mut ctx).unwrap();

        let session = ctx.session();
        assert!(session.edges(people[1], Direction::Incoming, &["Friend"]).unwrap().is_empty());
        assert_eq!(
            session.edges(people[2], Direction::Incoming, &["Friend"]).unwrap(),
            vec![edge]
        );
        assert_eq!(
            session.neighbors(people[0], Direction::Outgoing, &["Friend"]).unwrap(),
            vec![people[2]]
        );
    }

    #[test]
    fn test_update_edge_rejects_non_vertex_endpoint() {
        let db = TestDb::with_schema();
        let people = db.people(2);
        let docs = db.docs(1);
        let edge = db.friend(people[0], people[1]);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let fetch = FetchFromRidsStep::new(vec![edge]);
        let copy = CopyRecordBeforeUpdateStep::new();
        let set = UpdateSetStep::new(vec![Assignment::new("out", Expression::lit(docs[0]))]);
        let pointers = UpdateEdgePointersStep::new();
        let err = run_chain(&[&fetch, &copy, &set, &pointers], &mut ctx).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(_)));
    }

    #[test]
    fn test_insert_values_and_edges() {
        let db = TestDb::with_schema();
        let people = db.people(2);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let create = CreateRecordStep::new("Person", 3);
        let values = InsertValuesStep::new(vec![
            vec![Assignment::new("name", Expression::lit("a"))],
            vec![Assignment::new("name", Expression::lit("b"))],
        ]);
        let save = SaveElementStep::new();
        let rows = run_chain(&[&create, &values, &save], &mut ctx).unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.property("name")).collect();
        assert_eq!(names, vec![Value::from("a"), Value::from("b"), Value::from("a")]);
        assert!(rows.iter().all(|r| r.rid().is_some_and(|rid| rid.is_persistent())));

        let create = CreateRecordStep::new("Friend", 1);
        let values = InsertValuesStep::new(vec![vec![
            Assignment::new("out", Expression::lit(people[0])),
            Assignment::new("in", Expression::lit(people[1])),
            Assignment::new("since", Expression::lit(2020)),
        ]]);
        let rows = run_chain(&[&create, &values, &save], &mut ctx).unwrap();
        let edge = rows[0].require_element().unwrap().clone();
        assert_eq!(edge.get("since"), Some(&Value::Integer(2020)));
        assert_eq!(
            ctx.session().neighbors(people[0], Direction::Outgoing, &[]).unwrap(),
            vec![people[1]]
        );

        let create = CreateRecordStep::new("Missing", 1);
        assert!(create.start(None, &mut ctx).is_err());
    }

    #[test]
    fn test_delete_modes() {
        let db = TestDb::with_schema();
        let people = db.people(3);
        let edge = db.friend(people[0], people[1]);
        db.friend(people[1], people[2]);
        let docs = db.docs(1);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);

        let fetch = FetchFromRidsStep::new(vec![edge]);
        run_chain(&[&fetch, &DeleteStep::new(DeleteMode::Edge)], &mut ctx).unwrap();
        assert!(ctx.session().edges(people[0], Direction::Outgoing, &[]).unwrap().is_empty());

        let fetch = FetchFromRidsStep::new(vec![people[2]]);
        run_chain(&[&fetch, &DeleteStep::new(DeleteMode::Vertex)], &mut ctx).unwrap();
        assert!(ctx.session().edges(people[1], Direction::Both, &[]).unwrap().is_empty());

        let fetch = FetchFromRidsStep::new(docs.clone());
        let rows = run_chain(&[&fetch, &DeleteStep::new(DeleteMode::Record)], &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(ctx.session().try_load(docs[0]).unwrap().is_none());
    }
}
