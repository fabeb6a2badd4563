//! Per-statement execution context
//!
//! The context is created for one statement execution and passed by
//! reference to every `start`, `has_next`, `next` and `close` call. It holds
//! the session, input parameters, variables, the current row and the
//! cancellation token.

use crate::config::ExecutionConfig;
use crate::result::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tessera_core::{Error, Result, Value};
use tessera_graph::DatabaseSession;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    interrupted: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}

/// Execution context for one statement
pub struct CommandContext<'a> {
    session: &'a mut DatabaseSession,
    config: ExecutionConfig,
    params: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    row_variables: HashMap<String, Arc<Vec<Row>>>,
    current: Option<Row>,
    matched: Option<Row>,
    token: InterruptToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    polls: u64,
}

impl<'a> CommandContext<'a> {
    pub fn new(session: &'a mut DatabaseSession, config: ExecutionConfig) -> Self {
        let timeout = config.default_timeout;
        Self {
            session,
            config,
            params: HashMap::new(),
            variables: HashMap::new(),
            row_variables: HashMap::new(),
            current: None,
            matched: None,
            token: InterruptToken::new(),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            polls: 0,
        }
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_token(mut self, token: InterruptToken) -> Self {
        self.token = token;
        self
    }

    /// Replace the deadline; `None` disables it
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn session(&mut self) -> &mut DatabaseSession {
        &mut *self.session
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn is_profiling(&self) -> bool {
        self.config.profiling
    }

    pub fn token(&self) -> &InterruptToken {
        &self.token
    }

    pub fn timeout_millis(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }

    // ========== Parameters and variables ==========

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn set_param<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        self.params.insert(name.into(), value.into());
    }

    /// Variable lookup; row variables resolve to a list of their values
    pub fn variable(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        self.row_variables
            .get(name)
            .map(|rows| Value::List(rows.iter().map(Row::to_value).collect()))
    }

    pub fn set_variable<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Rows materialized into a variable by LET or MATCH prefetch
    pub fn rows(&self, name: &str) -> Option<Arc<Vec<Row>>> {
        self.row_variables.get(name).cloned()
    }

    pub fn set_rows<K: Into<String>>(&mut self, name: K, rows: Vec<Row>) {
        self.row_variables.insert(name.into(), Arc::new(rows));
    }

    pub fn has_rows(&self, name: &str) -> bool {
        self.row_variables.contains_key(name)
    }

    /// The row most recently emitted by a step, exposed as `$current`
    pub fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, row: Option<Row>) {
        self.current = row;
    }

    /// Alias bindings of the MATCH path being extended, exposed as `$matched`
    pub fn matched(&self) -> Option<&Row> {
        self.matched.as_ref()
    }

    pub fn set_matched(&mut self, row: Option<Row>) -> Option<Row> {
        std::mem::replace(&mut self.matched, row)
    }

    // ========== Cancellation ==========

    /// Check the token and deadline now
    pub fn check_interrupt(&self) -> Result<()> {
        if self.token.is_interrupted() {
            return Err(Error::Interrupted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.timeout_millis()));
            }
        }
        Ok(())
    }

    /// Cheap poll for tight loops: the token is checked every
    /// `interrupt_poll_interval` calls
    pub fn poll_interrupt(&mut self) -> Result<()> {
        self.polls += 1;
        if self.polls % self.config.interrupt_poll_interval.max(1) == 0 {
            self.check_interrupt()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessera_graph::Database;

    #[test]
    fn test_variables_and_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_for_testing(temp_dir.path()).unwrap();
        let mut session = db.session();
        let mut ctx = CommandContext::new(&mut session, ExecutionConfig::for_testing());

        ctx.set_variable("x", 5);
        assert_eq!(ctx.variable("x"), Some(Value::Integer(5)));

        ctx.set_rows("items", vec![Row::with("a", 1)]);
        let list = ctx.variable("items").unwrap();
        assert_eq!(list.as_list().map(|l| l.len()), Some(1));
        assert!(ctx.variable("missing").is_none());
    }

    #[test]
    fn test_interrupt_poll() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_for_testing(temp_dir.path()).unwrap();
        let mut session = db.session();
        let token = InterruptToken::new();
        let config = ExecutionConfig::for_testing().interrupt_poll_interval(3);
        let mut ctx = CommandContext::new(&mut session, config).with_token(token.clone());

        token.interrupt();
        assert!(ctx.poll_interrupt().is_ok());
        assert!(ctx.poll_interrupt().is_ok());
        assert!(matches!(ctx.poll_interrupt(), Err(Error::Interrupted)));
    }

    #[test]
    fn test_deadline() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_for_testing(temp_dir.path()).unwrap();
        let mut session = db.session();
        let ctx = CommandContext::new(&mut session, ExecutionConfig::for_testing())
            .with_timeout(Some(Duration::ZERO));
        assert!(matches!(ctx.check_interrupt(), Err(Error::Timeout(0))));
    }
}
