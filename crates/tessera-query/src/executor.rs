//! Statement execution
//!
//! The executor plans statements (or reuses a cached plan), runs them
//! against a session and hands back a [`ResultSet`]. Plans that hold no
//! runtime state are cached by statement fingerprint and copied for every
//! execution, so counters never leak between runs.

use crate::config::ExecutionConfig;
use crate::context::{CommandContext, InterruptToken};
use crate::plan::ExecutionPlan;
use crate::planner::Planner;
use crate::result::Row;
use crate::statement::Statement;
use crate::stream::{BoxStream, drain};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tessera_core::{Error, Result, Value};
use tessera_graph::{Database, DatabaseSession};
use tracing::{debug, info};

/// Per-execution inputs
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub params: HashMap<String, Value>,
    pub token: Option<InterruptToken>,
    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn token(mut self, token: InterruptToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Bounded plan cache, least recently used evicted first. A capacity of
/// zero disables it.
#[derive(Debug)]
struct PlanCache {
    plans: Option<LruCache<u64, ExecutionPlan>>,
}

impl PlanCache {
    fn new(capacity: usize) -> Self {
        Self {
            plans: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Fresh copy of the cached plan
    fn get(&mut self, key: u64) -> Result<Option<ExecutionPlan>> {
        self.plans
            .as_mut()
            .and_then(|plans| plans.get(&key))
            .map(ExecutionPlan::copy)
            .transpose()
    }

    fn insert(&mut self, key: u64, plan: ExecutionPlan) {
        if let Some(plans) = self.plans.as_mut() {
            plans.put(key, plan);
        }
    }

    fn len(&self) -> usize {
        self.plans.as_ref().map_or(0, LruCache::len)
    }

    fn clear(&mut self) {
        if let Some(plans) = self.plans.as_mut() {
            plans.clear();
        }
    }
}

/// Plan cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Plans and runs statements
#[derive(Debug)]
pub struct QueryExecutor {
    config: ExecutionConfig,
    cache: Mutex<PlanCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl QueryExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        let cache = PlanCache::new(config.plan_cache_size);
        Self {
            config,
            cache: Mutex::new(cache),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Plan a statement without running it
    pub fn plan(&self, db: &Database, statement: &Statement) -> Result<ExecutionPlan> {
        Planner::new(db, &self.config).plan(statement)
    }

    /// Cached plan copy, or a new plan that is cached when possible
    fn plan_for_execution(&self, db: &Database, statement: &Statement) -> Result<ExecutionPlan> {
        if self.config.plan_cache_size == 0 {
            return self.plan(db, statement);
        }
        let key = statement.fingerprint()?;
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire plan cache lock".to_string()))?;
        if let Some(plan) = cache.get(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Plan cache hit");
            return Ok(plan);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Plan cache miss");
        let plan = self.plan(db, statement)?;
        if plan.can_be_cached() {
            cache.insert(key, plan.copy()?);
        }
        Ok(plan)
    }

    /// Drop every cached plan; needed after schema or index changes
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        info!("Plan cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        let entries = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    fn context<'s>(
        &self,
        session: &'s mut DatabaseSession,
        config: ExecutionConfig,
        options: QueryOptions,
    ) -> CommandContext<'s> {
        let mut ctx = CommandContext::new(session, config).with_params(options.params);
        if let Some(token) = options.token {
            ctx = ctx.with_token(token);
        }
        if options.timeout.is_some() {
            ctx = ctx.with_timeout(options.timeout);
        }
        ctx
    }

    /// Start a statement; rows are produced as the result set is iterated
    pub fn query<'s>(
        &self,
        session: &'s mut DatabaseSession,
        statement: &Statement,
        options: QueryOptions,
    ) -> Result<ResultSet<'s>> {
        let plan = self.plan_for_execution(session.database(), statement)?;
        let mut ctx = self.context(session, self.config.clone(), options);
        ResultSet::start(plan, &mut ctx).map(|(plan, stream)| ResultSet {
            ctx,
            plan,
            stream: Some(stream),
            closed: false,
        })
    }

    /// Run a statement to completion
    pub fn execute(
        &self,
        session: &mut DatabaseSession,
        statement: &Statement,
        options: QueryOptions,
    ) -> Result<Vec<Row>> {
        self.query(session, statement, options)?.collect()
    }

    /// Pretty-printed plan and its serialized form
    pub fn explain(&self, db: &Database, statement: &Statement) -> Result<Explain> {
        let plan = self.plan(db, statement)?;
        Ok(Explain {
            pretty: plan.pretty_print(0, 2),
            serialized: plan.serialize()?,
        })
    }

    /// Run with profiling on and return the rows with the costed plan
    pub fn profile(
        &self,
        session: &mut DatabaseSession,
        statement: &Statement,
        options: QueryOptions,
    ) -> Result<Profile> {
        let plan = self.plan(session.database(), statement)?;
        let config = self.config.clone().profiling(true);
        let mut ctx = self.context(session, config, options);
        let rows = match plan.start(&mut ctx) {
            Ok(stream) => drain(stream, &mut ctx),
            Err(e) => Err(e),
        };
        plan.close();
        let rows = rows?;
        Ok(Profile {
            rows,
            pretty: plan.pretty_print(0, 2),
            total: plan.cost(),
        })
    }
}

/// Output of [`QueryExecutor::explain`]
#[derive(Debug, Clone)]
pub struct Explain {
    pub pretty: String,
    pub serialized: serde_json::Value,
}

/// Output of [`QueryExecutor::profile`]
#[derive(Debug, Clone)]
pub struct Profile {
    pub rows: Vec<Row>,
    pub pretty: String,
    pub total: Duration,
}

/// Rows of a running statement. The plan is closed exactly once: when the
/// rows run out, when a row fails, on [`ResultSet::close`] or on drop.
pub struct ResultSet<'s> {
    ctx: CommandContext<'s>,
    plan: ExecutionPlan,
    stream: Option<BoxStream>,
    closed: bool,
}

impl<'s> ResultSet<'s> {
    fn start(plan: ExecutionPlan, ctx: &mut CommandContext<'_>) -> Result<(ExecutionPlan, BoxStream)> {
        match plan.start(ctx) {
            Ok(stream) => Ok((plan, stream)),
            Err(e) => {
                plan.close();
                Err(e)
            }
        }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Cancel the statement from another thread
    pub fn interrupt_token(&self) -> InterruptToken {
        self.ctx.token().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut stream) = self.stream.take() {
            stream.close(&mut self.ctx);
        }
        self.plan.close();
    }

    fn pull(&mut self) -> Result<Option<Row>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        if stream.has_next(&mut self.ctx)? {
            stream.next(&mut self.ctx).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Iterator for ResultSet<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        match self.pull() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for ResultSet<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("plan", &self.plan)
            .field("closed", &self.closed)
            .finish()
    }
}
