//! Edge traversal for MATCH
//!
//! A traversal walks one pattern edge from a bound source element. Plain
//! edges apply their hops once. Edges with `while` or `maxDepth` expand
//! depth first from the source, which itself is a candidate at depth 0.

use crate::context::CommandContext;
use crate::expr::Condition;
use crate::matching::pattern::{Hop, HopKind, PatternEdge, PatternNode};
use crate::result::Row;
use crate::step::StepStats;
use serde::{Deserialize, Serialize};
use tessera_core::{Record, Result, Rid, Value};
use tessera_graph::DatabaseSession;

/// Context variable holding the depth of the element under test
pub const DEPTH_VARIABLE: &str = "depth";

/// Class, rid and condition an element must satisfy to bind an alias
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFilter {
    pub class_name: Option<String>,
    pub rid: Option<Rid>,
    pub condition: Option<Condition>,
}

impl TargetFilter {
    pub fn of(node: &PatternNode) -> Self {
        Self {
            class_name: node.class_name.clone(),
            rid: node.rid,
            condition: node.condition.clone(),
        }
    }

    /// Evaluate against `record` with `$current` and `$depth` bound
    pub fn matches(&self, record: &Record, depth: u32, ctx: &mut CommandContext<'_>) -> Result<bool> {
        if self.rid.is_some_and(|rid| rid != record.rid) {
            return Ok(false);
        }
        if let Some(class_name) = &self.class_name {
            let schema = ctx.session().database().schema()?;
            if !schema.is_subclass_of(&record.class, class_name) {
                return Ok(false);
            }
        }
        match &self.condition {
            Some(condition) => {
                let row = Row::element(record.clone());
                ctx.set_current(Some(row.clone()));
                with_depth(ctx, depth, |ctx| condition.evaluate(&row, ctx))
            }
            None => Ok(true),
        }
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(class_name) = &self.class_name {
            parts.push(format!("class: {}", class_name));
        }
        if let Some(rid) = &self.rid {
            parts.push(format!("rid: {}", rid));
        }
        if let Some(condition) = &self.condition {
            parts.push(format!("where: ({})", condition));
        }
        parts.join(", ")
    }
}

/// An element reached by a traversal
#[derive(Debug, Clone, PartialEq)]
pub struct Reached {
    pub rid: Rid,
    pub depth: u32,
    /// Rids from the source to `rid`, both included
    pub path: Vec<Rid>,
}

/// One scheduled pattern edge, oriented from the bound alias to the new one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTraversal {
    pub from: String,
    pub to: String,
    pub hops: Vec<Hop>,
    pub while_condition: Option<Condition>,
    pub max_depth: Option<u32>,
    pub depth_alias: Option<String>,
    pub path_alias: Option<String>,
    pub target: TargetFilter,
    pub optional: bool,
}

impl EdgeTraversal {
    /// Traversal of `edge` from `from` to `to` along `hops`
    pub fn new(edge: &PatternEdge, from: &str, to: &PatternNode, hops: Vec<Hop>) -> Self {
        Self {
            from: from.to_string(),
            to: to.alias.clone(),
            hops,
            while_condition: edge.while_condition.clone(),
            max_depth: edge.max_depth,
            depth_alias: edge.depth_alias.clone(),
            path_alias: edge.path_alias.clone(),
            target: TargetFilter::of(to),
            optional: to.optional,
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.while_condition.is_some() || self.max_depth.is_some()
    }

    /// Every element reachable from `source` that satisfies the target filter
    pub fn traverse(&self, source: Rid, ctx: &mut CommandContext<'_>, stats: &StepStats) -> Result<Vec<Reached>> {
        if self.is_recursive() {
            self.traverse_recursive(source, ctx, stats)
        } else {
            self.traverse_once(source, ctx, stats)
        }
    }

    fn traverse_once(&self, source: Rid, ctx: &mut CommandContext<'_>, stats: &StepStats) -> Result<Vec<Reached>> {
        let mut reached = Vec::new();
        for rid in apply_hops(ctx.session(), source, &self.hops)? {
            stats.poll(ctx)?;
            let Some(record) = ctx.session().try_load(rid)? else {
                continue;
            };
            if self.target.matches(&record, 1, ctx)? {
                reached.push(Reached {
                    rid,
                    depth: 1,
                    path: vec![source, rid],
                });
            }
        }
        Ok(reached)
    }

    /// Depth-first expansion. An element is expanded only while its depth is
    /// below `max_depth` and the `while` condition holds on it. A rid is never
    /// revisited within one path, which keeps cyclic graphs finite; distinct
    /// paths to the same rid each yield it.
    fn traverse_recursive(&self, source: Rid, ctx: &mut CommandContext<'_>, stats: &StepStats) -> Result<Vec<Reached>> {
        let mut reached = Vec::new();
        let mut stack = vec![(source, 0u32, vec![source])];
        while let Some((rid, depth, path)) = stack.pop() {
            stats.poll(ctx)?;
            let Some(record) = ctx.session().try_load(rid)? else {
                continue;
            };
            if self.target.matches(&record, depth, ctx)? {
                reached.push(Reached {
                    rid,
                    depth,
                    path: path.clone(),
                });
            }
            if self.max_depth.is_some_and(|max| depth >= max) || !self.expands(&record, depth, ctx)? {
                continue;
            }
            let next = apply_hops(ctx.session(), rid, &self.hops)?;
            for neighbor in next.into_iter().rev() {
                if path.contains(&neighbor) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(neighbor);
                stack.push((neighbor, depth + 1, extended));
            }
        }
        Ok(reached)
    }

    fn expands(&self, record: &Record, depth: u32, ctx: &mut CommandContext<'_>) -> Result<bool> {
        match &self.while_condition {
            Some(condition) => {
                let row = Row::element(record.clone());
                ctx.set_current(Some(row.clone()));
                with_depth(ctx, depth, |ctx| condition.evaluate(&row, ctx))
            }
            None => Ok(true),
        }
    }

    /// Properties a reached element adds to the match row besides its alias
    pub fn annotations(&self, reached: &Reached) -> Vec<(String, Value)> {
        let mut annotations = Vec::new();
        if let Some(alias) = &self.depth_alias {
            annotations.push((alias.clone(), Value::Integer(reached.depth as i64)));
        }
        if let Some(alias) = &self.path_alias {
            let path = reached.path.iter().copied().map(Value::Link).collect();
            annotations.push((alias.clone(), Value::List(path)));
        }
        annotations
    }

    pub fn describe(&self) -> String {
        let hops: Vec<String> = self.hops.iter().map(Hop::to_string).collect();
        let mut filter = self.target.describe();
        if let Some(condition) = &self.while_condition {
            push_part(&mut filter, format!("while: ({})", condition));
        }
        if let Some(max) = self.max_depth {
            push_part(&mut filter, format!("maxDepth: {}", max));
        }
        if self.optional {
            push_part(&mut filter, "optional: true".to_string());
        }
        push_part(&mut filter, format!("as: {}", self.to));
        format!("{{{}}}.{}{{{}}}", self.from, hops.join("."), filter)
    }
}

fn push_part(target: &mut String, part: String) {
    if !target.is_empty() {
        target.push_str(", ");
    }
    target.push_str(&part);
}

/// Run `f` with `$depth` bound, restoring the previous binding afterwards
fn with_depth<T>(
    ctx: &mut CommandContext<'_>,
    depth: u32,
    f: impl FnOnce(&mut CommandContext<'_>) -> Result<T>,
) -> Result<T> {
    let previous = ctx.remove_variable(DEPTH_VARIABLE);
    ctx.set_variable(DEPTH_VARIABLE, Value::Integer(depth as i64));
    let result = f(ctx);
    ctx.remove_variable(DEPTH_VARIABLE);
    if let Some(previous) = previous {
        ctx.set_variable(DEPTH_VARIABLE, previous);
    }
    result
}

/// Apply a chain of hops to one starting rid
pub fn apply_hops(session: &mut DatabaseSession, start: Rid, hops: &[Hop]) -> Result<Vec<Rid>> {
    let mut frontier = vec![start];
    for hop in hops {
        let classes: Vec<&str> = hop.classes.iter().map(String::as_str).collect();
        let mut next = Vec::new();
        for rid in frontier {
            match hop.kind {
                HopKind::Vertices => next.extend(session.neighbors(rid, hop.direction, &classes)?),
                HopKind::Edges => next.extend(session.edges(rid, hop.direction, &classes)?),
                HopKind::EdgeVertices => next.extend(session.edge_vertices(rid, hop.direction)?),
            }
        }
        frontier = next;
    }
    Ok(frontier)
}
