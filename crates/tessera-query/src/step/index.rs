//! Index scan planner and index fetch steps
//!
//! A key condition against an index compiles into one or more cursors over
//! the index's ordered `(key, rid)` entries:
//!
//! - no condition: full iteration, plus the null-key entries unless the
//!   index ignores nulls
//! - `=`: exact key; `>`/`>=`: major cursor; `<`/`<=`: minor cursor
//! - `BETWEEN`: one inclusive range cursor
//! - `IN`: one cursor per candidate value, identical cursors scanned once
//! - AND-block over a composite key: equalities (and INs) on leading fields
//!   expand into a cartesian product of key prefixes; an optional range on
//!   the last field bounds each prefix
//!
//! - CONTAINSTEXT: the rids stored under every word of the operand
//!
//! Unordered indexes only accept equalities covering every key field (or
//! CONTAINSTEXT on a full-text index). Anything else is a planning error.
//!
//! Cursors are read lazily, one key group at a time, and merged in key order.

use crate::context::CommandContext;
use crate::expr::{CompareOp, Condition, Expression};
use crate::result::Row;
use crate::step::{ExecutionStep, StepStats, drain_upstream, explain_line, require_upstream, to_bag};
use crate::stream::{BoxStream, RowProducer, StreamExt, from_producer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tessera_core::{ClusterId, Error, Result, Value};
use tessera_storage::{IndexDefinition, IndexEntry, KeyRange, MemoryIndex, full_text_words};

/// Constraint on one key field, as written in the condition
#[derive(Debug, Clone)]
enum FieldConstraint<'a> {
    Equals(&'a Expression),
    In(&'a Expression),
    Range {
        lower: Vec<(&'a Expression, bool)>,
        upper: Vec<(&'a Expression, bool)>,
    },
    Text(&'a Expression),
}

impl FieldConstraint<'_> {
    fn is_range(&self) -> bool {
        matches!(self, FieldConstraint::Range { .. })
    }
}

/// One physical scan over the index
#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    Keys(KeyRange),
    Nulls,
    /// Rids stored under every one of the words
    Words(Vec<Value>),
}

/// Index, key condition and optional adjacent range condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSearchDescriptor {
    pub index_name: String,
    pub key_condition: Option<Condition>,
    pub additional_range: Option<Condition>,
}

impl IndexSearchDescriptor {
    pub fn new<S: Into<String>>(index_name: S, key_condition: Option<Condition>) -> Self {
        Self {
            index_name: index_name.into(),
            key_condition,
            additional_range: None,
        }
    }

    pub fn with_additional_range(mut self, range: Condition) -> Self {
        self.additional_range = Some(range);
        self
    }

    /// Check that the condition has a shape the index can serve
    pub fn validate(&self, definition: &IndexDefinition) -> Result<()> {
        self.constraints(definition).map(|_| ())
    }

    /// Per-field constraints in index field order
    fn constraints<'a>(&'a self, definition: &IndexDefinition) -> Result<Vec<FieldConstraint<'a>>> {
        let mut conjuncts: Vec<&Condition> = Vec::new();
        if let Some(key) = &self.key_condition {
            conjuncts.extend(key.conjuncts());
        }
        if let Some(range) = &self.additional_range {
            conjuncts.extend(range.conjuncts());
        }

        let mut per_field: Vec<Option<FieldConstraint<'a>>> = vec![None; definition.fields.len()];
        for conjunct in conjuncts {
            let (field, constraint) = field_constraint(conjunct).ok_or_else(|| {
                Error::Planning(format!(
                    "Condition {} cannot be served by index {}",
                    conjunct, definition.name
                ))
            })?;
            let position = definition
                .fields
                .iter()
                .position(|f| f == field)
                .ok_or_else(|| {
                    Error::Planning(format!(
                        "Field {} is not part of index {}",
                        field, definition.name
                    ))
                })?;
            per_field[position] = Some(merge_constraint(per_field[position].take(), constraint, field)?);
        }

        let used = per_field.iter().take_while(|c| c.is_some()).count();
        if per_field[used..].iter().any(Option::is_some) {
            return Err(Error::Planning(format!(
                "Condition on index {} skips a leading key field",
                definition.name
            )));
        }
        let constraints: Vec<FieldConstraint<'a>> = per_field.into_iter().flatten().collect();

        if let Some(pos) = constraints.iter().position(FieldConstraint::is_range) {
            if pos + 1 != constraints.len() {
                return Err(Error::Planning(format!(
                    "Only the last key field of index {} may carry a range",
                    definition.name
                )));
            }
        }

        let text = constraints.iter().any(|c| matches!(c, FieldConstraint::Text(_)));
        if text && !definition.kind.is_full_text() {
            return Err(Error::Planning(format!(
                "CONTAINSTEXT requires a full-text index, {} is not one",
                definition.name
            )));
        }
        if !definition.kind.is_ordered() && !constraints.is_empty() {
            if constraints.iter().any(FieldConstraint::is_range) {
                return Err(Error::Planning(format!(
                    "Index {} is unordered and cannot serve range conditions",
                    definition.name
                )));
            }
            if !text && constraints.len() != definition.fields.len() {
                return Err(Error::Planning(format!(
                    "Unordered index {} needs equalities on all of its fields",
                    definition.name
                )));
            }
        }
        Ok(constraints)
    }

    fn cursors(
        &self,
        definition: &IndexDefinition,
        row: &Row,
        ctx: &mut CommandContext<'_>,
    ) -> Result<Vec<Cursor>> {
        let constraints = self.constraints(definition)?;
        if constraints.is_empty() {
            let mut cursors = vec![Cursor::Keys(KeyRange::all())];
            if !definition.ignore_nulls {
                cursors.push(Cursor::Nulls);
            }
            return Ok(cursors);
        }

        let composite = definition.is_composite();
        let key_of = |mut parts: Vec<Value>| -> Value {
            if composite {
                Value::List(parts)
            } else {
                parts.swap_remove(0)
            }
        };

        // Cartesian product of the equality values on the leading fields
        let mut prefixes: Vec<Vec<Value>> = vec![Vec::new()];
        let mut range = None;
        for constraint in &constraints {
            let values = match constraint {
                FieldConstraint::Equals(expr) => vec![integral_key(expr.evaluate(row, ctx)?)],
                FieldConstraint::In(expr) => match expr.evaluate(row, ctx)? {
                    Value::List(items) => items.into_iter().map(integral_key).collect(),
                    single => vec![integral_key(single)],
                },
                FieldConstraint::Text(expr) => {
                    let text = expr.evaluate(row, ctx)?;
                    let mut words: Vec<Value> = text
                        .as_str()
                        .map(full_text_words)
                        .unwrap_or_default()
                        .into_iter()
                        .map(Value::String)
                        .collect();
                    words.sort();
                    words.dedup();
                    if words.is_empty() {
                        return Ok(Vec::new());
                    }
                    return Ok(vec![Cursor::Words(words)]);
                }
                FieldConstraint::Range { lower, upper } => {
                    range = Some((
                        tightest(lower, row, ctx, Ordering::Greater)?,
                        tightest(upper, row, ctx, Ordering::Less)?,
                    ));
                    continue;
                }
            };
            prefixes = prefixes
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut next = prefix.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }

        let mut cursors = Vec::new();
        for prefix in prefixes {
            let has_null = prefix.iter().any(Value::is_null)
                || range.as_ref().is_some_and(|(lo, hi)| {
                    lo.as_ref().is_some_and(|(v, _)| v.is_null())
                        || hi.as_ref().is_some_and(|(v, _)| v.is_null())
                });
            if has_null {
                if !definition.ignore_nulls {
                    cursors.push(Cursor::Nulls);
                }
                continue;
            }

            let key_range = match &range {
                None => KeyRange::exact(key_of(prefix)),
                Some((lower, upper)) => {
                    let bound = |value: &Value| {
                        let mut parts = prefix.clone();
                        parts.push(value.clone());
                        key_of(parts)
                    };
                    match (lower, upper) {
                        (Some((lo, lo_incl)), Some((hi, hi_incl))) => {
                            KeyRange::between(bound(lo), *lo_incl, bound(hi), *hi_incl)
                        }
                        (Some((lo, incl)), None) if prefix.is_empty() => KeyRange::major(bound(lo), *incl),
                        (Some((lo, incl)), None) => {
                            KeyRange::between(bound(lo), *incl, key_of(prefix.clone()), true)
                        }
                        (None, Some((hi, incl))) if prefix.is_empty() => KeyRange::minor(bound(hi), *incl),
                        (None, Some((hi, incl))) => {
                            KeyRange::between(key_of(prefix.clone()), true, bound(hi), *incl)
                        }
                        (None, None) => KeyRange::all(),
                    }
                }
            };
            cursors.push(Cursor::Keys(key_range));
        }

        let mut unique: Vec<Cursor> = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            if !unique.contains(&cursor) {
                unique.push(cursor);
            }
        }
        Ok(unique)
    }

    /// Lazy scan of the `(key, rid)` entries matching the condition, in
    /// index order
    pub fn open_scan(&self, row: &Row, ascending: bool, ctx: &mut CommandContext<'_>) -> Result<IndexScan> {
        let definition = ctx.session().database().index_definition(&self.index_name)?;
        let cursors = self.cursors(&definition, row, ctx)?;
        Ok(IndexScan {
            index_name: self.index_name.clone(),
            ascending,
            scans: cursors.into_iter().map(CursorScan::new).collect(),
        })
    }

    /// Every entry matching the condition, in index order
    pub fn fetch_entries(
        &self,
        row: &Row,
        ascending: bool,
        ctx: &mut CommandContext<'_>,
    ) -> Result<Vec<IndexEntry>> {
        let mut scan = self.open_scan(row, ascending, ctx)?;
        let mut entries = Vec::new();
        while let Some(entry) = scan.next_entry(ctx)? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Read position of one cursor: the last key group taken and the entries
/// of that group not yet emitted
#[derive(Debug)]
struct CursorScan {
    cursor: Cursor,
    last_key: Option<Value>,
    buffer: VecDeque<IndexEntry>,
    exhausted: bool,
}

impl CursorScan {
    fn new(cursor: Cursor) -> Self {
        Self {
            cursor,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Load the next key group if the buffer ran dry
    fn fill(&mut self, index: &MemoryIndex, ascending: bool) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let group = match &self.cursor {
                Cursor::Nulls => {
                    self.exhausted = true;
                    let mut rids = index.null_rids();
                    if !ascending {
                        rids.reverse();
                    }
                    Some((Value::Null, rids))
                }
                Cursor::Keys(range) => index.next_key(range, self.last_key.as_ref(), ascending)?,
                Cursor::Words(words) => {
                    let (first, rest) = words.split_first().ok_or_else(|| {
                        Error::Internal("Full-text cursor without words".to_string())
                    })?;
                    index
                        .next_key(&KeyRange::exact(first.clone()), self.last_key.as_ref(), ascending)?
                        .map(|(key, rids)| {
                            let rids = rids
                                .into_iter()
                                .filter(|rid| rest.iter().all(|word| index.contains_entry(word, *rid)))
                                .collect();
                            (key, rids)
                        })
                }
            };
            match group {
                Some((key, rids)) => {
                    index.record_usage(rids.len() as u64);
                    self.buffer.extend(rids.iter().map(|rid| (key.clone(), *rid)));
                    self.last_key = Some(key);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

/// Lazy merge of the cursors of one index search
#[derive(Debug)]
pub struct IndexScan {
    index_name: String,
    ascending: bool,
    scans: Vec<CursorScan>,
}

impl IndexScan {
    /// Next entry across all cursors. The index lock is held only for the
    /// duration of the call.
    pub fn next_entry(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<IndexEntry>> {
        if self.scans.iter().all(|s| s.exhausted && s.buffer.is_empty()) {
            return Ok(None);
        }
        let ascending = self.ascending;
        let scans = &mut self.scans;
        ctx.session().database().with_index(&self.index_name, |index| {
            for scan in scans.iter_mut() {
                scan.fill(index, ascending)?;
            }
            let mut pick: Option<usize> = None;
            for (i, scan) in scans.iter().enumerate() {
                let Some(entry) = scan.buffer.front() else {
                    continue;
                };
                let better = match pick.and_then(|p| scans[p].buffer.front()) {
                    None => true,
                    Some(best) if ascending => entry < best,
                    Some(best) => entry > best,
                };
                if better {
                    pick = Some(i);
                }
            }
            Ok(pick.and_then(|i| scans[i].buffer.pop_front()))
        })
    }
}

/// Integral floats as integers, so `IN [3, 3.0]` opens a single cursor
fn integral_key(value: Value) -> Value {
    match value {
        Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Value::Integer(f as i64)
        }
        other => other,
    }
}

/// Tightest of several bounds on one side. Equal values combine their
/// inclusivity with AND.
fn tightest(
    bounds: &[(&Expression, bool)],
    row: &Row,
    ctx: &mut CommandContext<'_>,
    stricter: Ordering,
) -> Result<Option<(Value, bool)>> {
    let mut best: Option<(Value, bool)> = None;
    for (expr, inclusive) in bounds {
        let value = expr.evaluate(row, ctx)?;
        best = Some(match best {
            None => (value, *inclusive),
            Some((current, current_incl)) => match value.compare(&current) {
                Some(Ordering::Equal) => (current, current_incl && *inclusive),
                Some(ord) if ord == stricter => (value, *inclusive),
                Some(_) => (current, current_incl),
                None if value.is_null() => (value, *inclusive),
                None => (current, current_incl),
            },
        });
    }
    Ok(best)
}

/// Field and constraint of one conjunct, if it has an indexable shape
fn field_constraint(condition: &Condition) -> Option<(&str, FieldConstraint<'_>)> {
    match condition {
        Condition::Compare { left, op, right } => {
            let (field, op, value) = match (left.as_field(), right.as_field()) {
                (Some(field), _) if right.is_row_independent() => (field, *op, right),
                (_, Some(field)) if left.is_row_independent() => (field, op.flip(), left),
                _ => return None,
            };
            let constraint = match op {
                CompareOp::Eq => FieldConstraint::Equals(value),
                CompareOp::Gt | CompareOp::Ge => FieldConstraint::Range {
                    lower: vec![(value, op == CompareOp::Ge)],
                    upper: Vec::new(),
                },
                CompareOp::Lt | CompareOp::Le => FieldConstraint::Range {
                    lower: Vec::new(),
                    upper: vec![(value, op == CompareOp::Le)],
                },
                CompareOp::Ne => return None,
            };
            Some((field, constraint))
        }
        Condition::Between { expr, low, high }
            if low.is_row_independent() && high.is_row_independent() =>
        {
            Some((
                expr.as_field()?,
                FieldConstraint::Range {
                    lower: vec![(low, true)],
                    upper: vec![(high, true)],
                },
            ))
        }
        Condition::In { expr, values } if values.is_row_independent() => {
            Some((expr.as_field()?, FieldConstraint::In(values)))
        }
        Condition::ContainsText { expr, text } if text.is_row_independent() => {
            Some((expr.as_field()?, FieldConstraint::Text(text)))
        }
        _ => None,
    }
}

fn merge_constraint<'a>(
    existing: Option<FieldConstraint<'a>>,
    new: FieldConstraint<'a>,
    field: &str,
) -> Result<FieldConstraint<'a>> {
    match (existing, new) {
        (None, new) => Ok(new),
        (
            Some(FieldConstraint::Range { mut lower, mut upper }),
            FieldConstraint::Range {
                lower: more_lower,
                upper: more_upper,
            },
        ) => {
            lower.extend(more_lower);
            upper.extend(more_upper);
            Ok(FieldConstraint::Range { lower, upper })
        }
        _ => Err(Error::Planning(format!(
            "Field {} has more than one non-range key condition",
            field
        ))),
    }
}

struct EntryProducer {
    scan: IndexScan,
    stats: StepStats,
}

impl RowProducer for EntryProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        self.stats.poll(ctx)?;
        match self.scan.next_entry(ctx)? {
            Some((key, rid)) => {
                let mut row = Row::with("key", key);
                row.set_property("rid", rid);
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

/// Stream `{key, rid}` rows from an index
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFromIndexStep {
    pub index_name: String,
    pub condition: Option<Condition>,
    pub additional_range_condition: Option<Condition>,
    pub order_asc: bool,
    #[serde(skip)]
    stats: StepStats,
}

impl FetchFromIndexStep {
    pub const TYPE: &'static str = "FetchFromIndex";

    pub fn new(descriptor: IndexSearchDescriptor, order_asc: bool) -> Self {
        Self {
            index_name: descriptor.index_name,
            condition: descriptor.key_condition,
            additional_range_condition: descriptor.additional_range,
            order_asc,
            stats: StepStats::default(),
        }
    }

    pub fn descriptor(&self) -> IndexSearchDescriptor {
        IndexSearchDescriptor {
            index_name: self.index_name.clone(),
            key_condition: self.condition.clone(),
            additional_range: self.additional_range_condition.clone(),
        }
    }
}

impl ExecutionStep for FetchFromIndexStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        drain_upstream(upstream, ctx)?;
        let scan = self.descriptor().open_scan(&Row::new(), self.order_asc, ctx)?;
        Ok(from_producer(EntryProducer {
            scan,
            stats: self.stats.clone(),
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let mut summary = format!("FETCH FROM INDEX {}", self.index_name);
        if let Some(condition) = &self.condition {
            summary.push_str(&format!(" {}", condition));
        }
        if let Some(range) = &self.additional_range_condition {
            summary.push_str(&format!(" AND {}", range));
        }
        if !self.order_asc {
            summary.push_str(" DESC");
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

/// Turn `{key, rid}` rows into the records they point to; stale entries are
/// dropped
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetValueFromIndexEntryStep {
    pub filter_cluster_ids: Option<Vec<ClusterId>>,
    #[serde(skip)]
    stats: StepStats,
}

impl GetValueFromIndexEntryStep {
    pub const TYPE: &'static str = "GetValueFromIndexEntry";

    pub fn new(filter_cluster_ids: Option<Vec<ClusterId>>) -> Self {
        Self {
            filter_cluster_ids,
            stats: StepStats::default(),
        }
    }
}

impl ExecutionStep for GetValueFromIndexEntryStep {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn start(&self, upstream: Option<BoxStream>, _ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let upstream = require_upstream(upstream, Self::TYPE)?;
        let clusters = self.filter_cluster_ids.clone();
        Ok(upstream.filter_rows(move |row, ctx| {
            let Some(rid) = row.property("rid").as_link() else {
                return Ok(None);
            };
            if clusters.as_ref().is_some_and(|c| !c.contains(&rid.cluster())) {
                return Ok(None);
            }
            let loaded = ctx.session().try_load(rid)?.map(Row::element);
            ctx.set_current(loaded.clone());
            Ok(loaded)
        }))
    }

    fn pretty_print(&self, depth: usize, indent: usize) -> String {
        let summary = match &self.filter_cluster_ids {
            Some(ids) => format!("FETCH FROM INDEX VALUES (clusters {:?})", ids),
            None => "FETCH FROM INDEX VALUES".to_string(),
        };
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
    use crate::stream::{ExecutionStream, drain};
    use crate::test_support::TestDb;
    use tessera_core::{Fields, Rid};
    use tessera_storage::IndexKind;

    fn indexed_db(kind: IndexKind, fields: &[&str]) -> TestDb {
        let db = TestDb::with_schema();
        let mut session = db.session();
        for i in 0..10i64 {
            let mut f = Fields::with("name", format!("n{}", i));
            f.set("idx", i);
            f.set("group", i % 3);
            session.create_vertex("Person", f).unwrap();
        }
        session.create_vertex("Person", Fields::with("other", 1)).unwrap();
        db.db
            .create_index(IndexDefinition::new("Person.idx", "Person", fields, kind))
            .unwrap();
        db
    }

    fn keys(db: &TestDb, descriptor: IndexSearchDescriptor, ascending: bool) -> Vec<Value> {
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        descriptor
            .fetch_entries(&Row::new(), ascending, &mut ctx)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Integer(*v)).collect()
    }

    #[test]
    fn test_equality_on_unique_index() {
        let db = indexed_db(IndexKind::Unique, &["idx"]);
        let found = keys(&db, IndexSearchDescriptor::new("Person.idx", Some(Condition::eq("idx", 4))), true);
        assert_eq!(found, ints(&[4]));
        let missing = keys(&db, IndexSearchDescriptor::new("Person.idx", Some(Condition::eq("idx", 42))), true);
        assert!(missing.is_empty());
    }

    #[test]
    fn test_between_inclusive_and_order() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let descriptor = IndexSearchDescriptor::new("Person.idx", Some(Condition::between("idx", 2, 5)));
        assert_eq!(keys(&db, descriptor.clone(), true), ints(&[2, 3, 4, 5]));
        assert_eq!(keys(&db, descriptor, false), ints(&[5, 4, 3, 2]));
    }

    #[test]
    fn test_single_range_operators() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let gt = IndexSearchDescriptor::new("Person.idx", Some(Condition::compare("idx", CompareOp::Gt, 7)));
        assert_eq!(keys(&db, gt, true), ints(&[8, 9]));
        let le = IndexSearchDescriptor::new("Person.idx", Some(Condition::compare("idx", CompareOp::Le, 1)));
        assert_eq!(keys(&db, le, true), ints(&[0, 1]));
    }

    #[test]
    fn test_adjacent_range_inclusivity_uses_and() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let descriptor = IndexSearchDescriptor::new(
            "Person.idx",
            Some(Condition::compare("idx", CompareOp::Ge, 3)),
        )
        .with_additional_range(
            Condition::compare("idx", CompareOp::Gt, 3).and(Condition::compare("idx", CompareOp::Lt, 6)),
        );
        assert_eq!(keys(&db, descriptor, true), ints(&[4, 5]));
    }

    #[test]
    fn test_in_deduplicates_cursors() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let descriptor = IndexSearchDescriptor::new(
            "Person.idx",
            Some(Condition::in_values("idx", vec![7, 1, 7])),
        );
        assert_eq!(keys(&db, descriptor, true), ints(&[1, 7]));
    }

    #[test]
    fn test_full_scan_includes_nulls() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let all = keys(&db, IndexSearchDescriptor::new("Person.idx", None), true);
        assert_eq!(all.len(), 11);
        assert_eq!(all[0], Value::Null);
    }

    #[test]
    fn test_composite_cartesian_expansion() {
        let db = indexed_db(IndexKind::NotUnique, &["group", "idx"]);
        let condition = Condition::in_values("group", vec![0, 2])
            .and(Condition::compare("idx", CompareOp::Lt, 6));
        let found = keys(&db, IndexSearchDescriptor::new("Person.idx", Some(condition)), true);
        let expected: Vec<Value> = [(0, 0), (0, 3), (2, 2), (2, 5)]
            .iter()
            .map(|(g, i)| Value::List(vec![Value::Integer(*g), Value::Integer(*i)]))
            .collect();
        assert_eq!(found, expected);

        let prefix = keys(
            &db,
            IndexSearchDescriptor::new("Person.idx", Some(Condition::eq("group", 1))),
            true,
        );
        assert_eq!(prefix.len(), 3);
    }

    #[test]
    fn test_unordered_index_rejects_ranges() {
        let db = indexed_db(IndexKind::NotUniqueHash, &["idx"]);
        let definition = db.db.index_definition("Person.idx").unwrap();
        let range = IndexSearchDescriptor::new("Person.idx", Some(Condition::between("idx", 1, 3)));
        assert!(range.validate(&definition).unwrap_err().is_planning());
        let eq = IndexSearchDescriptor::new("Person.idx", Some(Condition::eq("idx", 3)));
        assert_eq!(keys(&db, eq, true), ints(&[3]));
    }

    #[test]
    fn test_unsupported_shapes_are_planning_errors() {
        let db = indexed_db(IndexKind::NotUnique, &["group", "idx"]);
        let definition = db.db.index_definition("Person.idx").unwrap();
        let skip = IndexSearchDescriptor::new("Person.idx", Some(Condition::eq("idx", 1)));
        assert!(skip.validate(&definition).unwrap_err().is_planning());
        let ne = IndexSearchDescriptor::new("Person.idx", Some(Condition::compare("group", CompareOp::Ne, 1)));
        assert!(ne.validate(&definition).unwrap_err().is_planning());
        let or = IndexSearchDescriptor::new(
            "Person.idx",
            Some(Condition::Or(vec![Condition::eq("group", 1), Condition::eq("group", 2)])),
        );
        assert!(or.validate(&definition).unwrap_err().is_planning());
    }

    #[test]
    fn test_index_steps_and_usage() {
        let db = indexed_db(IndexKind::Unique, &["idx"]);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let fetch = FetchFromIndexStep::new(
            IndexSearchDescriptor::new("Person.idx", Some(Condition::between("idx", 0, 2))),
            true,
        );
        let values = GetValueFromIndexEntryStep::new(None);
        let stream = fetch.start(None, &mut ctx).unwrap();
        let stream = values.start(Some(stream), &mut ctx).unwrap();
        let rows = drain(stream, &mut ctx).unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.property("name")).collect();
        assert_eq!(names, vec![Value::from("n0"), Value::from("n1"), Value::from("n2")]);
        let usage = db
            .db
            .with_index("Person.idx", |index| Ok(index.usage_count()))
            .unwrap();
        assert_eq!(usage, 3);
    }

    #[test]
    fn test_float_operands_agree_with_filter() {
        let db = indexed_db(IndexKind::NotUnique, &["idx"]);
        let conditions = [
            Condition::eq("idx", 3.0),
            Condition::compare("idx", CompareOp::Ge, 7.0),
            Condition::compare("idx", CompareOp::Gt, 7.0),
            Condition::compare("idx", CompareOp::Le, 1.5),
            Condition::between("idx", 2.5, 4.0),
            Condition::in_values("idx", vec![Value::Float(3.0), Value::Integer(3), Value::Float(5.0)]),
        ];
        for condition in conditions {
            let mut session = db.session();
            let mut ctx = db.context(&mut session);
            let mut filtered = Vec::new();
            for i in 0..10i64 {
                let row = Row::with("idx", i);
                if condition.evaluate(&row, &mut ctx).unwrap() {
                    filtered.push(Value::Integer(i));
                }
            }
            drop(ctx);
            let indexed = keys(&db, IndexSearchDescriptor::new("Person.idx", Some(condition.clone())), true);
            assert_eq!(indexed, filtered, "{}", condition);
            assert!(!indexed.is_empty(), "{}", condition);
        }
    }

    #[test]
    fn test_index_scan_reads_lazily() {
        let db = indexed_db(IndexKind::Unique, &["idx"]);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let mut scan = IndexSearchDescriptor::new("Person.idx", Some(Condition::compare("idx", CompareOp::Ge, 2)))
            .open_scan(&Row::new(), true, &mut ctx)
            .unwrap();
        let first = scan.next_entry(&mut ctx).unwrap().unwrap();
        assert_eq!(first.0, Value::Integer(2));
        let usage = db
            .db
            .with_index("Person.idx", |index| Ok(index.usage_count()))
            .unwrap();
        assert_eq!(usage, 1);
    }

    #[test]
    fn test_index_scan_honors_interrupt() {
        let db = indexed_db(IndexKind::Unique, &["idx"]);
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let fetch = FetchFromIndexStep::new(IndexSearchDescriptor::new("Person.idx", None), true);
        let mut stream = fetch.start(None, &mut ctx).unwrap();
        ctx.token().interrupt();
        let err = stream.has_next(&mut ctx).unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_contains_text_needs_every_word() {
        let db = TestDb::with_schema();
        let mut session = db.session();
        for bio in ["rust and graphs", "graphs only", "rust only"] {
            session.create_vertex("Person", Fields::with("bio", bio)).unwrap();
        }
        drop(session);
        db.db
            .create_index(IndexDefinition::new("Person.bio", "Person", &["bio"], IndexKind::FullText))
            .unwrap();
        let search = |text: &str| {
            let mut session = db.session();
            let mut ctx = db.context(&mut session);
            IndexSearchDescriptor::new("Person.bio", Some(Condition::contains_text("bio", text)))
                .fetch_entries(&Row::new(), true, &mut ctx)
                .unwrap()
                .len()
        };
        assert_eq!(search("Graphs"), 2);
        assert_eq!(search("rust graphs"), 1);
        assert_eq!(search("rust graphs missing"), 0);
        assert_eq!(search("  "), 0);
    }

    #[test]
    fn test_stale_entries_are_soft_misses() {
        let db = TestDb::with_schema();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let mut row = Row::with("key", 1);
        row.set_property("rid", Rid::new(99, 1));
        let stream = GetValueFromIndexEntryStep::new(None)
            .start(Some(crate::stream::from_rows(vec![row])), &mut ctx)
            .unwrap();
        assert!(drain(stream, &mut ctx).unwrap().is_empty());
    }
}
