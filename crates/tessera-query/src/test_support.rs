//! Shared fixtures for unit tests

use crate::config::ExecutionConfig;
use crate::context::CommandContext;
use crate::executor::QueryExecutor;
use std::sync::Once;
use tempfile::TempDir;
use tessera_core::{Fields, Rid};
use tessera_graph::{Database, DatabaseSession};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` overrides the `warn` default
fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub(crate) struct TestDb {
    pub db: Database,
    pub executor: QueryExecutor,
    _dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let db = Database::open_for_testing(dir.path()).unwrap();
        Self {
            db,
            executor: QueryExecutor::new(ExecutionConfig::for_testing()),
            _dir: dir,
        }
    }

    /// `Person` vertices, `Friend` edges and a `Doc` document class
    pub fn with_schema() -> Self {
        let test_db = Self::new();
        test_db.db.create_vertex_class("Person").unwrap();
        test_db.db.create_edge_class("Friend").unwrap();
        test_db.db.create_class("Doc", &[]).unwrap();
        test_db
    }

    pub fn session(&self) -> DatabaseSession {
        self.db.session()
    }

    pub fn context<'a>(&self, session: &'a mut DatabaseSession) -> CommandContext<'a> {
        CommandContext::new(session, ExecutionConfig::for_testing())
    }

    /// Persons `n0..n{count-1}` with `name` and `idx` fields
    pub fn people(&self, count: usize) -> Vec<Rid> {
        let mut session = self.session();
        (0..count)
            .map(|i| {
                let mut fields = Fields::with("name", format!("n{}", i));
                fields.set("idx", i as i64);
                session.create_vertex("Person", fields).unwrap().rid
            })
            .collect()
    }

    pub fn friend(&self, from: Rid, to: Rid) -> Rid {
        self.session()
            .create_edge("Friend", from, to, Fields::new())
            .unwrap()
            .rid
    }

    pub fn docs(&self, count: usize) -> Vec<Rid> {
        let mut session = self.session();
        (0..count)
            .map(|i| {
                let mut record = session.new_record("Doc").unwrap();
                record.set("idx", i as i64);
                session.save(record).unwrap().rid
            })
            .collect()
    }
}
