//! Execution plans
//!
//! A plan is an arena of step nodes linked by `prev`/`next` indices. Nested
//! plans are owned by the steps that run them. Closing walks the chain
//! backwards from the tail and closes every node exactly once.

use crate::context::CommandContext;
use crate::matching::steps::{
    MatchFirstStep, MatchPrefetchStep, MatchStep, RemoveEmptyOptionalsStep, ReturnMatchesStep,
};
use crate::step::composite::{
    BatchStep, CartesianProductStep, GlobalLetStep, ParallelExecStep, RetryStep, ScriptBlockStep,
    SubQueryStep,
};
use crate::step::fetch::{
    EmptyStep, FetchFromClassStep, FetchFromClusterStep, FetchFromRidsStep, FetchFromVariableStep,
};
use crate::step::filter::{
    CheckClassStep, CheckClusterStep, CheckRecordTypeStep, CheckSafeDeleteStep, FilterStep,
};
use crate::step::index::{FetchFromIndexStep, GetValueFromIndexEntryStep};
use crate::step::mutation::{
    CopyRecordBeforeUpdateStep, CreateRecordStep, DeleteStep, InsertValuesStep, SaveElementStep,
    UnwrapPreviousStep, UpdateEdgePointersStep, UpdateMergeStep, UpdateRemoveStep, UpdateSetStep,
};
use crate::step::transform::{
    CountStep, DistinctStep, ExpandStep, LimitStep, OrderByStep, ProjectionStep, SkipStep,
    UnwindStep,
};
use crate::step::{ExecutionStep, from_bag};
use crate::stream::{BoxStream, StreamExt, empty};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tessera_core::{Error, Result};
use tracing::debug;

/// What statement a plan executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanKind {
    Select,
    Match,
    Update,
    Insert,
    Delete,
    Let,
    Script,
    Transaction,
    /// Plan nested inside a composite step
    Sub,
}

#[derive(Debug)]
struct StepNode {
    step: Box<dyn ExecutionStep>,
    prev: Option<usize>,
    next: Option<usize>,
    closed: AtomicBool,
}

/// An ordered chain of steps
#[derive(Debug)]
pub struct ExecutionPlan {
    kind: PlanKind,
    nodes: Vec<StepNode>,
}

impl ExecutionPlan {
    pub fn new(kind: PlanKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
        }
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a step after the current tail
    pub fn chain<S: ExecutionStep + 'static>(&mut self, step: S) -> &mut Self {
        self.chain_boxed(Box::new(step))
    }

    pub fn chain_boxed(&mut self, step: Box<dyn ExecutionStep>) -> &mut Self {
        let index = self.nodes.len();
        let prev = index.checked_sub(1);
        if let Some(prev) = prev {
            self.nodes[prev].next = Some(index);
        }
        self.nodes.push(StepNode {
            step,
            prev,
            next: None,
            closed: AtomicBool::new(false),
        });
        self
    }

    fn head(&self) -> Option<usize> {
        (!self.nodes.is_empty()).then_some(0)
    }

    fn tail(&self) -> Option<usize> {
        self.nodes.len().checked_sub(1)
    }

    pub fn prev_of(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|n| n.prev)
    }

    pub fn next_of(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|n| n.next)
    }

    /// Steps in chain order
    pub fn steps(&self) -> Vec<&dyn ExecutionStep> {
        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head();
        while let Some(index) = cursor {
            steps.push(self.nodes[index].step.as_ref());
            cursor = self.nodes[index].next;
        }
        steps
    }

    /// Start every step from the head, feeding each the previous stream
    pub fn start(&self, ctx: &mut CommandContext<'_>) -> Result<BoxStream> {
        let mut stream: Option<BoxStream> = None;
        let mut cursor = self.head();
        while let Some(index) = cursor {
            let step = &self.nodes[index].step;
            let started = step.start(stream.take(), ctx)?;
            stream = Some(if ctx.is_profiling() {
                started.profiled(step.stats().clone())
            } else {
                started
            });
            cursor = self.nodes[index].next;
        }
        Ok(stream.unwrap_or_else(empty))
    }

    /// Close every step, tail first; later calls are no-ops
    pub fn close(&self) {
        if let Some(tail) = self.tail() {
            self.close_from(tail);
        }
    }

    /// Close a step and cascade to its predecessors
    pub fn close_from(&self, index: usize) {
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let node = &self.nodes[i];
            if !node.closed.swap(true, Ordering::SeqCst) {
                node.step.close();
            }
            cursor = node.prev;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.nodes.iter().all(|n| n.closed.load(Ordering::SeqCst))
    }

    /// Propagate a timeout signal upstream from the tail
    pub fn send_timeout(&self) {
        let mut cursor = self.tail();
        while let Some(i) = cursor {
            self.nodes[i].step.send_timeout();
            cursor = self.nodes[i].prev;
        }
    }

    pub fn can_be_cached(&self) -> bool {
        self.steps().iter().all(|s| s.can_be_cached())
    }

    /// Total time recorded by profiled steps
    pub fn cost(&self) -> Duration {
        self.steps().iter().map(|s| s.stats().elapsed()).sum()
    }

    pub fn pretty_print(&self, depth: usize, indent: usize) -> String {
        self.steps()
            .iter()
            .map(|s| s.pretty_print(depth, indent))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// `{ "type": <kind>, "steps": [ <bag>, ... ] }`
    pub fn serialize(&self) -> Result<serde_json::Value> {
        let steps = self
            .steps()
            .iter()
            .map(|s| s.serialize_step())
            .collect::<Result<Vec<_>>>()?;
        let kind = serde_json::to_value(self.kind).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(serde_json::json!({ "type": kind, "steps": steps }))
    }

    pub fn deserialize(bag: &serde_json::Value) -> Result<Self> {
        let kind: PlanKind = bag
            .get("type")
            .cloned()
            .ok_or_else(|| Error::Deserialization("Plan without type".to_string()))
            .and_then(|v| serde_json::from_value(v).map_err(|e| Error::Deserialization(e.to_string())))?;
        let steps = bag
            .get("steps")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| Error::Deserialization("Plan without steps".to_string()))?;
        let mut plan = ExecutionPlan::new(kind);
        for step in steps {
            plan.chain_boxed(deserialize_step(step)?);
        }
        Ok(plan)
    }

    /// Fresh copy for a new execution
    pub fn copy(&self) -> Result<Self> {
        let mut plan = ExecutionPlan::new(self.kind);
        for step in self.steps() {
            plan.chain_boxed(step.copy()?);
        }
        debug!("Copied {:?} plan with {} steps", self.kind, plan.len());
        Ok(plan)
    }
}

impl Serialize for ExecutionPlan {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        ExecutionPlan::serialize(self)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExecutionPlan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;
        let bag = serde_json::Value::deserialize(deserializer)?;
        ExecutionPlan::deserialize(&bag).map_err(D::Error::custom)
    }
}

/// Rebuild a step from its property bag
pub fn deserialize_step(bag: &serde_json::Value) -> Result<Box<dyn ExecutionStep>> {
    let type_name = bag
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::Deserialization("Step without type".to_string()))?;
    match type_name {
        FetchFromClassStep::TYPE => from_bag::<FetchFromClassStep>(bag),
        FetchFromClusterStep::TYPE => from_bag::<FetchFromClusterStep>(bag),
        FetchFromRidsStep::TYPE => from_bag::<FetchFromRidsStep>(bag),
        FetchFromVariableStep::TYPE => from_bag::<FetchFromVariableStep>(bag),
        EmptyStep::TYPE => from_bag::<EmptyStep>(bag),
        FetchFromIndexStep::TYPE => from_bag::<FetchFromIndexStep>(bag),
        GetValueFromIndexEntryStep::TYPE => from_bag::<GetValueFromIndexEntryStep>(bag),
        FilterStep::TYPE => from_bag::<FilterStep>(bag),
        CheckClassStep::TYPE => from_bag::<CheckClassStep>(bag),
        CheckClusterStep::TYPE => from_bag::<CheckClusterStep>(bag),
        CheckRecordTypeStep::TYPE => from_bag::<CheckRecordTypeStep>(bag),
        CheckSafeDeleteStep::TYPE => from_bag::<CheckSafeDeleteStep>(bag),
        ProjectionStep::TYPE => from_bag::<ProjectionStep>(bag),
        DistinctStep::TYPE => from_bag::<DistinctStep>(bag),
        OrderByStep::TYPE => from_bag::<OrderByStep>(bag),
        SkipStep::TYPE => from_bag::<SkipStep>(bag),
        LimitStep::TYPE => from_bag::<LimitStep>(bag),
        UnwindStep::TYPE => from_bag::<UnwindStep>(bag),
        ExpandStep::TYPE => from_bag::<ExpandStep>(bag),
        CountStep::TYPE => from_bag::<CountStep>(bag),
        CopyRecordBeforeUpdateStep::TYPE => from_bag::<CopyRecordBeforeUpdateStep>(bag),
        UpdateSetStep::TYPE => from_bag::<UpdateSetStep>(bag),
        UpdateRemoveStep::TYPE => from_bag::<UpdateRemoveStep>(bag),
        UpdateMergeStep::TYPE => from_bag::<UpdateMergeStep>(bag),
        UpdateEdgePointersStep::TYPE => from_bag::<UpdateEdgePointersStep>(bag),
        SaveElementStep::TYPE => from_bag::<SaveElementStep>(bag),
        DeleteStep::TYPE => from_bag::<DeleteStep>(bag),
        UnwrapPreviousStep::TYPE => from_bag::<UnwrapPreviousStep>(bag),
        CreateRecordStep::TYPE => from_bag::<CreateRecordStep>(bag),
        InsertValuesStep::TYPE => from_bag::<InsertValuesStep>(bag),
        CartesianProductStep::TYPE => from_bag::<CartesianProductStep>(bag),
        ParallelExecStep::TYPE => from_bag::<ParallelExecStep>(bag),
        SubQueryStep::TYPE => from_bag::<SubQueryStep>(bag),
        GlobalLetStep::TYPE => from_bag::<GlobalLetStep>(bag),
        BatchStep::TYPE => from_bag::<BatchStep>(bag),
        RetryStep::TYPE => from_bag::<RetryStep>(bag),
        ScriptBlockStep::TYPE => from_bag::<ScriptBlockStep>(bag),
        MatchPrefetchStep::TYPE => from_bag::<MatchPrefetchStep>(bag),
        MatchFirstStep::TYPE => from_bag::<MatchFirstStep>(bag),
        MatchStep::TYPE => from_bag::<MatchStep>(bag),
        RemoveEmptyOptionalsStep::TYPE => from_bag::<RemoveEmptyOptionalsStep>(bag),
        ReturnMatchesStep::TYPE => from_bag::<ReturnMatchesStep>(bag),
        other => Err(Error::Deserialization(format!("Unknown step type: {}", other))),
    }
}
