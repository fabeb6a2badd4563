//! Execution steps
//!
//! A step is one operator of a physical plan. `start` receives the stream of
//! its predecessor (if any) and returns the stream it exposes to its
//! consumer. Source steps drain and close whatever upstream they are handed.

pub mod composite;
pub mod fetch;
pub mod filter;
pub mod index;
pub mod mutation;
pub mod transform;

use crate::context::CommandContext;
use crate::plan::ExecutionPlan;
use crate::stream::{BoxStream, consume};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tessera_core::{Error, Result};

#[derive(Debug, Default)]
struct Counters {
    elapsed_nanos: AtomicU64,
    rows: AtomicU64,
    profiled: AtomicBool,
    timed_out: AtomicBool,
}

/// Runtime counters of a step, shared with the streams it starts
#[derive(Debug, Clone, Default)]
pub struct StepStats {
    inner: Arc<Counters>,
}

impl StepStats {
    pub fn add_elapsed(&self, elapsed: Duration) {
        self.inner
            .elapsed_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_row(&self) {
        self.inner.rows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.inner.elapsed_nanos.load(Ordering::Relaxed))
    }

    pub fn rows(&self) -> u64 {
        self.inner.rows.load(Ordering::Relaxed)
    }

    pub fn mark_profiled(&self) {
        self.inner.profiled.store(true, Ordering::Relaxed);
    }

    pub fn is_profiled(&self) -> bool {
        self.inner.profiled.load(Ordering::Relaxed)
    }

    pub fn mark_timed_out(&self) {
        self.inner.timed_out.store(true, Ordering::SeqCst);
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Poll point for loops that read storage: honors `send_timeout` on the
    /// step and the context's token and deadline
    pub fn poll(&self, ctx: &mut CommandContext<'_>) -> Result<()> {
        if self.is_timed_out() {
            return Err(Error::Timeout(ctx.timeout_millis()));
        }
        ctx.poll_interrupt()
    }

    /// Explain-plan suffix, empty unless the step ran with profiling
    pub fn cost_suffix(&self) -> String {
        if self.is_profiled() {
            format!(" ({}μs, {} rows)", self.elapsed().as_micros(), self.rows())
        } else {
            String::new()
        }
    }
}

/// One operator of a physical plan
pub trait ExecutionStep: fmt::Debug + Send + Sync {
    /// Discriminator written as `type` in the serialized property bag
    fn type_name(&self) -> &'static str;

    /// Start the step on top of the predecessor's stream
    fn start(&self, upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<BoxStream>;

    /// One or more explain lines indented by `depth * indent` spaces
    fn pretty_print(&self, depth: usize, indent: usize) -> String;

    /// Property bag with the step parameters
    fn serialize_step(&self) -> Result<serde_json::Value>;

    fn stats(&self) -> &StepStats;

    /// Nested plans owned by this step
    fn sub_plans(&self) -> Vec<&ExecutionPlan> {
        Vec::new()
    }

    /// True when the step holds no non-reproducible runtime state
    fn can_be_cached(&self) -> bool {
        self.sub_plans().iter().all(|plan| plan.can_be_cached())
    }

    /// Fresh copy with reset counters
    fn copy(&self) -> Result<Box<dyn ExecutionStep>> {
        crate::plan::deserialize_step(&self.serialize_step()?)
    }

    /// Ask running streams of this step to stop at their next poll
    fn send_timeout(&self) {
        self.stats().mark_timed_out();
        for plan in self.sub_plans() {
            plan.send_timeout();
        }
    }

    /// Release resources. The owning plan calls this exactly once.
    fn close(&self) {
        for plan in self.sub_plans() {
            plan.close();
        }
    }
}

/// Explain line: indentation, `+ ` marker, summary and cost
pub fn explain_line(depth: usize, indent: usize, summary: &str, stats: &StepStats) -> String {
    format!(
        "{}+ {}{}",
        " ".repeat(depth * indent),
        summary,
        stats.cost_suffix()
    )
}

/// Serialize a step struct and tag it with its type
pub fn to_bag<T: Serialize>(type_name: &str, step: &T) -> Result<serde_json::Value> {
    let mut bag = serde_json::to_value(step).map_err(|e| Error::Serialization(e.to_string()))?;
    match bag.as_object_mut() {
        Some(map) => {
            map.insert(
                "type".to_string(),
                serde_json::Value::String(type_name.to_string()),
            );
            Ok(bag)
        }
        None => Err(Error::Serialization(format!(
            "Step {} did not serialize to an object",
            type_name
        ))),
    }
}

pub fn from_bag<T>(bag: &serde_json::Value) -> Result<Box<dyn ExecutionStep>>
where
    T: ExecutionStep + DeserializeOwned + 'static,
{
    let step: T = serde_json::from_value(bag.clone()).map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(Box::new(step))
}

/// Drain an upstream handed to a source step, running its side effects
pub(crate) fn drain_upstream(upstream: Option<BoxStream>, ctx: &mut CommandContext<'_>) -> Result<()> {
    if let Some(stream) = upstream {
        consume(stream, ctx)?;
    }
    Ok(())
}

/// Upstream required by a transform step
pub(crate) fn require_upstream(upstream: Option<BoxStream>, step: &str) -> Result<BoxStream> {
    upstream.ok_or_else(|| Error::IllegalState(format!("{} started without a previous step", step)))
}
