//! Ordering of MATCH pattern elements
//!
//! Scheduling is greedy over the pattern graph: extend the bound part of the
//! pattern along an edge whenever the aliases that edge and its target read
//! are already bound, otherwise start a new root at the cheapest unbound
//! node. If neither is possible the pattern has a dependency cycle.

use crate::matching::pattern::{Hop, Pattern, PatternEdge};
use std::collections::{BTreeSet, HashMap, HashSet};
use tessera_core::{Error, Result};
use tracing::debug;

/// Cost used for nodes without class or rid; they can never be roots
pub const UNBOUNDED: u64 = u64::MAX;

/// One element of the execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledItem {
    /// Start matching at every candidate of the alias
    Root { alias: String },
    /// Traverse a pattern edge, backwards when `reversed`
    Edge { edge: usize, reversed: bool },
}

impl ScheduledItem {
    /// Source alias, target alias and hops of a scheduled edge
    pub fn oriented<'p>(&self, pattern: &'p Pattern) -> Option<(&'p str, &'p str, Vec<Hop>)> {
        match self {
            ScheduledItem::Root { .. } => None,
            ScheduledItem::Edge { edge, reversed } => {
                let edge = &pattern.edges[*edge];
                if *reversed {
                    Some((&edge.to, &edge.from, edge.reversed_hops()?))
                } else {
                    Some((&edge.from, &edge.to, edge.hops.clone()))
                }
            }
        }
    }
}

struct Scheduler<'p> {
    pattern: &'p Pattern,
    estimates: &'p HashMap<String, u64>,
    bound: HashSet<String>,
    pending: BTreeSet<usize>,
    order: Vec<ScheduledItem>,
}

impl<'p> Scheduler<'p> {
    fn is_bound(&self, alias: &str) -> bool {
        self.bound.contains(alias)
    }

    fn all_bound(&self, aliases: &BTreeSet<String>, also: &str) -> bool {
        aliases.iter().all(|a| a == also || self.is_bound(a))
    }

    /// The target of `edge` walked from `source` may be bound now
    fn ready(&self, edge: &PatternEdge, source: &str, target: &str) -> bool {
        if !self.all_bound(&edge.dependencies, source) {
            return false;
        }
        self.is_bound(target) || self.all_bound(&self.pattern.nodes[target].dependencies, source)
    }

    /// Next edge to walk: joins between bound aliases first, then forward
    /// edges, then reversed ones
    fn next_edge(&self) -> Option<ScheduledItem> {
        let edges = &self.pattern.edges;
        let join = self.pending.iter().find(|&&i| {
            let edge = &edges[i];
            self.is_bound(&edge.from) && self.is_bound(&edge.to) && self.ready(edge, &edge.from, &edge.to)
        });
        if let Some(&edge) = join {
            return Some(ScheduledItem::Edge { edge, reversed: false });
        }
        let forward = self.pending.iter().find(|&&i| {
            let edge = &edges[i];
            self.is_bound(&edge.from) && self.ready(edge, &edge.from, &edge.to)
        });
        if let Some(&edge) = forward {
            return Some(ScheduledItem::Edge { edge, reversed: false });
        }
        let backward = self.pending.iter().find(|&&i| {
            let edge = &edges[i];
            self.is_bound(&edge.to)
                && !self.pattern.nodes[&edge.from].optional
                && !self.pattern.nodes[&edge.to].optional
                && edge.reversed_hops().is_some()
                && self.ready(edge, &edge.to, &edge.from)
        });
        backward.map(|&edge| ScheduledItem::Edge { edge, reversed: true })
    }

    /// Cheapest unbound node that may start a new component
    fn next_root(&self) -> Option<String> {
        self.pattern
            .nodes
            .values()
            .filter(|node| !self.is_bound(&node.alias) && !node.optional)
            .filter(|node| self.all_bound(&node.dependencies, &node.alias))
            .map(|node| (self.estimates.get(&node.alias).copied().unwrap_or(UNBOUNDED), node))
            .filter(|(estimate, _)| *estimate != UNBOUNDED)
            .min_by_key(|(estimate, _)| *estimate)
            .map(|(_, node)| node.alias.clone())
    }

    fn stuck(&self) -> Error {
        let unbound: Vec<&str> = self
            .pattern
            .nodes
            .keys()
            .filter(|alias| !self.is_bound(alias))
            .map(String::as_str)
            .collect();
        let waiting = unbound
            .iter()
            .any(|alias| !self.all_bound(&self.pattern.nodes[*alias].dependencies, alias));
        if waiting {
            Error::CommandExecution(format!(
                "Circular dependency between MATCH aliases: {}",
                unbound.join(", ")
            ))
        } else {
            Error::CommandExecution(format!(
                "MATCH aliases {} cannot be reached: give them a class or rid, or connect them to a non-optional alias",
                unbound.join(", ")
            ))
        }
    }

    fn run(mut self) -> Result<Vec<ScheduledItem>> {
        while !self.pending.is_empty() || self.bound.len() < self.pattern.nodes.len() {
            if let Some(item) = self.next_edge() {
                if let ScheduledItem::Edge { edge, reversed } = item {
                    let edge_ref = &self.pattern.edges[edge];
                    let target = if reversed { &edge_ref.from } else { &edge_ref.to };
                    self.bound.insert(target.clone());
                    self.pending.remove(&edge);
                }
                self.order.push(item);
                continue;
            }
            match self.next_root() {
                Some(alias) => {
                    self.bound.insert(alias.clone());
                    self.order.push(ScheduledItem::Root { alias });
                }
                None => return Err(self.stuck()),
            }
        }
        Ok(self.order)
    }
}

/// Order the pattern for execution. `estimates` holds the candidate count
/// of every alias that can start a traversal.
pub fn schedule(pattern: &Pattern, estimates: &HashMap<String, u64>) -> Result<Vec<ScheduledItem>> {
    let order = Scheduler {
        pattern,
        estimates,
        bound: HashSet::new(),
        pending: (0..pattern.edges.len()).collect(),
        order: Vec::new(),
    }
    .run()?;
    debug!(?order, "Scheduled MATCH pattern");
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CompareOp, Condition, Expression};
    use crate::matching::pattern::{MatchExpression, MatchFilter};

    fn reads(alias: &str) -> Condition {
        Condition::Compare {
            left: Expression::field("age"),
            op: CompareOp::Gt,
            right: Expression::matched(alias, Some("age")),
        }
    }

    fn estimates(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(a, n)| (a.to_string(), *n)).collect()
    }

    #[test]
    fn test_root_is_the_cheapest_node() {
        let expression = MatchExpression::new(MatchFilter::class("Person").alias("a"))
            .out(&["Friend"], MatchFilter::class("City").alias("c"));
        let pattern = Pattern::build(&[expression]).unwrap();
        let order = schedule(&pattern, &estimates(&[("a", 1000), ("c", 3)])).unwrap();
        assert_eq!(
            order,
            vec![
                ScheduledItem::Root { alias: "c".to_string() },
                ScheduledItem::Edge { edge: 0, reversed: true },
            ]
        );
    }

    #[test]
    fn test_dependency_forces_order() {
        // `a` reads `b`, so `b` must be bound first even though `a` is cheaper
        let expression = MatchExpression::new(MatchFilter::class("Person").alias("a").filter(reads("b")))
            .out(&["Friend"], MatchFilter::class("Person").alias("b"));
        let pattern = Pattern::build(&[expression]).unwrap();
        let order = schedule(&pattern, &estimates(&[("a", 1), ("b", 10)])).unwrap();
        assert_eq!(order[0], ScheduledItem::Root { alias: "b".to_string() });
    }

    #[test]
    fn test_cycle_in_pattern_graph_is_a_join() {
        let expression = MatchExpression::new(MatchFilter::class("Person").alias("a"))
            .out(&["Friend"], MatchFilter::new().alias("b"))
            .out(&["Friend"], MatchFilter::new().alias("a"));
        let pattern = Pattern::build(&[expression]).unwrap();
        let order = schedule(&pattern, &estimates(&[("a", 5)])).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[2], ScheduledItem::Edge { edge: 1, reversed: false });
    }

    #[test]
    fn test_circular_dependency_fails_fast() {
        let first = MatchExpression::new(MatchFilter::class("Person").alias("a").filter(reads("b")));
        let second = MatchExpression::new(MatchFilter::class("Person").alias("b").filter(reads("a")));
        let pattern = Pattern::build(&[first, second]).unwrap();
        let err = schedule(&pattern, &estimates(&[("a", 1), ("b", 1)])).unwrap_err();
        assert!(matches!(err, Error::CommandExecution(ref m) if m.contains("Circular")));
    }

    #[test]
    fn test_unreachable_alias() {
        let expression = MatchExpression::new(MatchFilter::new().alias("a"));
        let pattern = Pattern::build(&[expression]).unwrap();
        assert!(schedule(&pattern, &HashMap::new()).is_err());
    }

    #[test]
    fn test_optional_nodes_are_reached_forward_only() {
        let expression = MatchExpression::new(MatchFilter::class("Person").alias("a"))
            .out(&["Friend"], MatchFilter::class("Person").alias("b").optional());
        let pattern = Pattern::build(&[expression]).unwrap();
        let order = schedule(&pattern, &estimates(&[("a", 100), ("b", 1)])).unwrap();
        assert_eq!(
            order,
            vec![
                ScheduledItem::Root { alias: "a".to_string() },
                ScheduledItem::Edge { edge: 0, reversed: false },
            ]
        );
    }
}
