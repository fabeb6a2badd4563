//! MATCH patterns
//!
//! A MATCH statement is a list of path expressions. Building the pattern
//! merges them into a graph of aliased nodes connected by traversal edges
//! and records, for every node and edge, which other aliases its conditions
//! read through `$matched`.

use crate::expr::Condition;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tessera_core::{Direction, Error, Result, Rid};

/// Prefix of aliases generated for unnamed pattern nodes
pub const ANONYMOUS_ALIAS_PREFIX: &str = "$anon_";

pub fn is_anonymous(alias: &str) -> bool {
    alias.starts_with(ANONYMOUS_ALIAS_PREFIX)
}

/// The `{class: .., as: .., where: .., while: .., maxDepth: ..}` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFilter {
    pub alias: Option<String>,
    pub class_name: Option<String>,
    pub rid: Option<Rid>,
    pub condition: Option<Condition>,
    pub while_condition: Option<Condition>,
    pub max_depth: Option<u32>,
    pub depth_alias: Option<String>,
    pub path_alias: Option<String>,
    pub optional: bool,
}

impl MatchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class<S: Into<String>>(class_name: S) -> Self {
        Self {
            class_name: Some(class_name.into()),
            ..Self::default()
        }
    }

    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn rid(mut self, rid: Rid) -> Self {
        self.rid = Some(rid);
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn while_condition(mut self, condition: Condition) -> Self {
        self.while_condition = Some(condition);
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn depth_alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.depth_alias = Some(alias.into());
        self
    }

    pub fn path_alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.path_alias = Some(alias.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// What a hop moves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopKind {
    /// Vertex to adjacent vertices: `out()`, `in()`, `both()`
    Vertices,
    /// Vertex to incident edges: `outE()`, `inE()`, `bothE()`
    Edges,
    /// Edge to its endpoints: `outV()`, `inV()`, `bothV()`
    EdgeVertices,
}

/// One graph hop with optional edge-class restriction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub kind: HopKind,
    pub direction: Direction,
    pub classes: Vec<String>,
}

impl Hop {
    fn new(kind: HopKind, direction: Direction, classes: &[&str]) -> Self {
        Self {
            kind,
            direction,
            classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn out(classes: &[&str]) -> Self {
        Self::new(HopKind::Vertices, Direction::Outgoing, classes)
    }

    pub fn in_(classes: &[&str]) -> Self {
        Self::new(HopKind::Vertices, Direction::Incoming, classes)
    }

    pub fn both(classes: &[&str]) -> Self {
        Self::new(HopKind::Vertices, Direction::Both, classes)
    }

    pub fn out_e(classes: &[&str]) -> Self {
        Self::new(HopKind::Edges, Direction::Outgoing, classes)
    }

    pub fn in_e(classes: &[&str]) -> Self {
        Self::new(HopKind::Edges, Direction::Incoming, classes)
    }

    pub fn both_e(classes: &[&str]) -> Self {
        Self::new(HopKind::Edges, Direction::Both, classes)
    }

    pub fn out_v() -> Self {
        Self::new(HopKind::EdgeVertices, Direction::Outgoing, &[])
    }

    pub fn in_v() -> Self {
        Self::new(HopKind::EdgeVertices, Direction::Incoming, &[])
    }

    pub fn both_v() -> Self {
        Self::new(HopKind::EdgeVertices, Direction::Both, &[])
    }

    /// The same hop walked backwards; only vertex hops can be reversed
    pub fn reversed(&self) -> Option<Hop> {
        match self.kind {
            HopKind::Vertices => Some(Hop {
                kind: HopKind::Vertices,
                direction: self.direction.reverse(),
                classes: self.classes.clone(),
            }),
            HopKind::Edges | HopKind::EdgeVertices => None,
        }
    }
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.direction {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
            Direction::Both => "both",
        };
        let suffix = match self.kind {
            HopKind::Vertices => "",
            HopKind::Edges => "E",
            HopKind::EdgeVertices => "V",
        };
        let classes: Vec<String> = self.classes.iter().map(|c| format!("'{}'", c)).collect();
        write!(f, "{}{}({})", name, suffix, classes.join(", "))
    }
}

/// `.out('Friend'){...}` or a multi-hop chain `.(out().in()){...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPathItem {
    pub hops: Vec<Hop>,
    pub filter: MatchFilter,
}

impl MatchPathItem {
    pub fn new(hop: Hop, filter: MatchFilter) -> Self {
        Self {
            hops: vec![hop],
            filter,
        }
    }

    pub fn chain(hops: Vec<Hop>, filter: MatchFilter) -> Self {
        Self { hops, filter }
    }
}

/// One comma-separated path of a MATCH statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub origin: MatchFilter,
    pub items: Vec<MatchPathItem>,
}

impl MatchExpression {
    pub fn new(origin: MatchFilter) -> Self {
        Self {
            origin,
            items: Vec::new(),
        }
    }

    pub fn then(mut self, item: MatchPathItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn out(self, classes: &[&str], filter: MatchFilter) -> Self {
        self.then(MatchPathItem::new(Hop::out(classes), filter))
    }

    pub fn in_(self, classes: &[&str], filter: MatchFilter) -> Self {
        self.then(MatchPathItem::new(Hop::in_(classes), filter))
    }

    pub fn both(self, classes: &[&str], filter: MatchFilter) -> Self {
        self.then(MatchPathItem::new(Hop::both(classes), filter))
    }
}

/// An aliased node of the pattern graph
#[derive(Debug, Clone, PartialEq)]
pub struct PatternNode {
    pub alias: String,
    pub class_name: Option<String>,
    pub rid: Option<Rid>,
    pub condition: Option<Condition>,
    pub optional: bool,
    /// Aliases the condition reads through `$matched`
    pub dependencies: BTreeSet<String>,
}

impl PatternNode {
    fn new(alias: String) -> Self {
        Self {
            alias,
            class_name: None,
            rid: None,
            condition: None,
            optional: false,
            dependencies: BTreeSet::new(),
        }
    }

    fn merge(&mut self, filter: &MatchFilter) -> Result<()> {
        match (&self.class_name, &filter.class_name) {
            (Some(current), Some(other)) if !current.eq_ignore_ascii_case(other) => {
                return Err(Error::CommandExecution(format!(
                    "Alias {} is declared with classes {} and {}",
                    self.alias, current, other
                )));
            }
            (None, Some(other)) => self.class_name = Some(other.clone()),
            _ => {}
        }
        match (self.rid, filter.rid) {
            (Some(current), Some(other)) if current != other => {
                return Err(Error::CommandExecution(format!(
                    "Alias {} is declared with rids {} and {}",
                    self.alias, current, other
                )));
            }
            (None, Some(other)) => self.rid = Some(other),
            _ => {}
        }
        if let Some(condition) = &filter.condition {
            self.condition = Some(match self.condition.take() {
                Some(existing) => existing.and(condition.clone()),
                None => condition.clone(),
            });
        }
        self.optional |= filter.optional;
        Ok(())
    }

    pub fn is_anonymous(&self) -> bool {
        is_anonymous(&self.alias)
    }
}

/// A traversal between two aliases
#[derive(Debug, Clone, PartialEq)]
pub struct PatternEdge {
    pub from: String,
    pub to: String,
    pub hops: Vec<Hop>,
    pub while_condition: Option<Condition>,
    pub max_depth: Option<u32>,
    pub depth_alias: Option<String>,
    pub path_alias: Option<String>,
    /// Aliases the `while` condition reads through `$matched`
    pub dependencies: BTreeSet<String>,
}

impl PatternEdge {
    /// True for `while`/`maxDepth` traversals
    pub fn is_recursive(&self) -> bool {
        self.while_condition.is_some() || self.max_depth.is_some()
    }

    /// Hops walked from `to` back to `from`, when every hop is reversible
    pub fn reversed_hops(&self) -> Option<Vec<Hop>> {
        if self.is_recursive() {
            return None;
        }
        self.hops.iter().rev().map(Hop::reversed).collect()
    }
}

/// The merged pattern graph of a MATCH statement
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    pub nodes: IndexMap<String, PatternNode>,
    pub edges: Vec<PatternEdge>,
}

impl Pattern {
    /// Merge the path expressions and check that every `$matched` reference
    /// names an alias of the pattern
    pub fn build(expressions: &[MatchExpression]) -> Result<Pattern> {
        let mut pattern = Pattern::default();
        let mut anonymous = 0;
        let mut alias_for = |filter: &MatchFilter| match &filter.alias {
            Some(alias) => alias.clone(),
            None => {
                anonymous += 1;
                format!("{}{}", ANONYMOUS_ALIAS_PREFIX, anonymous - 1)
            }
        };

        for expression in expressions {
            let mut previous = alias_for(&expression.origin);
            pattern.add_node(&previous, &expression.origin)?;
            for item in &expression.items {
                if item.hops.is_empty() {
                    return Err(Error::Planning(format!(
                        "Empty traversal after alias {}",
                        previous
                    )));
                }
                let alias = alias_for(&item.filter);
                pattern.add_node(&alias, &item.filter)?;
                let dependencies = item
                    .filter
                    .while_condition
                    .as_ref()
                    .map(Condition::referenced_aliases)
                    .unwrap_or_default();
                pattern.edges.push(PatternEdge {
                    from: previous.clone(),
                    to: alias.clone(),
                    hops: item.hops.clone(),
                    while_condition: item.filter.while_condition.clone(),
                    max_depth: item.filter.max_depth,
                    depth_alias: item.filter.depth_alias.clone(),
                    path_alias: item.filter.path_alias.clone(),
                    dependencies,
                });
                previous = alias;
            }
        }

        for node in pattern.nodes.values_mut() {
            node.dependencies = node
                .condition
                .as_ref()
                .map(Condition::referenced_aliases)
                .unwrap_or_default();
            node.dependencies.remove(&node.alias);
        }
        pattern.check_aliases()?;
        Ok(pattern)
    }

    fn add_node(&mut self, alias: &str, filter: &MatchFilter) -> Result<()> {
        self.nodes
            .entry(alias.to_string())
            .or_insert_with(|| PatternNode::new(alias.to_string()))
            .merge(filter)
    }

    fn check_aliases(&self) -> Result<()> {
        let referenced = self
            .nodes
            .values()
            .flat_map(|n| n.dependencies.iter())
            .chain(self.edges.iter().flat_map(|e| e.dependencies.iter()));
        for alias in referenced {
            if !self.nodes.contains_key(alias) {
                return Err(Error::CommandExecution(format!(
                    "MATCH references undefined alias '{}'",
                    alias
                )));
            }
        }
        Ok(())
    }

    /// Aliases named in the statement, in declaration order
    pub fn user_aliases(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|alias| !is_anonymous(alias))
            .cloned()
            .collect()
    }

    /// Every alias including generated ones, in declaration order
    pub fn all_aliases(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn has_optional_nodes(&self) -> bool {
        self.nodes.values().any(|n| n.optional)
    }
}
