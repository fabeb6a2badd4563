//! Database handle and sessions
//!
//! [`Database`] is a cheap-to-clone handle over the storage engine, the
//! schema and the index manager. [`DatabaseSession`] is the unit of work:
//! it owns at most one active transaction and routes every read and write
//! through it.

use crate::schema::{EDGE_CLASS, Schema, VERTEX_CLASS};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tessera_core::{ClusterId, Error, Record, RecordKind, Result, Rid};
use tessera_storage::{
    IndexDefinition, IndexManager, MemoryIndex, RecordChange, StorageEngine, StorageOptions,
    Transaction,
};
use tracing::{debug, info, warn};

const SCHEMA_META_KEY: &str = "schema";
const INDEX_META_KEY: &str = "indexes";

/// Configuration for the database
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database name, used in log output
    pub name: String,

    /// Storage settings
    pub storage: StorageOptions,
}

impl DatabaseConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            storage: StorageOptions::new(path),
            ..Default::default()
        }
    }

    pub fn for_testing<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            name: "test".to_string(),
            storage: StorageOptions::for_testing(path),
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            storage: StorageOptions::default(),
        }
    }
}

/// The main database instance
#[derive(Clone)]
pub struct Database {
    storage: StorageEngine,
    schema: Arc<RwLock<Schema>>,
    indexes: Arc<RwLock<IndexManager>>,
    config: DatabaseConfig,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(DatabaseConfig::new(path.as_ref()))
    }

    /// Open a database with testing configuration
    pub fn open_for_testing<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(DatabaseConfig::for_testing(path.as_ref()))
    }

    pub fn open_with_config(config: DatabaseConfig) -> Result<Self> {
        let storage = StorageEngine::open(config.storage.clone())?;

        let db = Self {
            storage,
            schema: Arc::new(RwLock::new(Schema::new())),
            indexes: Arc::new(RwLock::new(IndexManager::new())),
            config,
        };
        db.load_metadata()?;

        info!("Opened database '{}' at {:?}", db.config.name, db.config.storage.path);
        Ok(db)
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Start a new session
    pub fn session(&self) -> DatabaseSession {
        DatabaseSession {
            db: self.clone(),
            tx: None,
        }
    }

    // ========== Schema ==========

    pub fn schema(&self) -> Result<RwLockReadGuard<'_, Schema>> {
        self.schema
            .read()
            .map_err(|_| Error::Internal("Failed to acquire schema lock".to_string()))
    }

    /// Create a class below the given superclasses
    pub fn create_class(&self, name: &str, superclasses: &[&str]) -> Result<()> {
        let (cluster, cluster_name) = {
            let mut schema = self
                .schema
                .write()
                .map_err(|_| Error::Internal("Failed to acquire schema lock".to_string()))?;
            let class = schema.create_class(name, superclasses)?;
            (class.cluster, class.cluster_name.clone())
        };
        self.storage.create_cluster(cluster, &cluster_name)?;
        self.persist_schema()?;
        info!("Created class '{}' (cluster {})", name, cluster);
        Ok(())
    }

    pub fn create_vertex_class(&self, name: &str) -> Result<()> {
        self.create_class(name, &[VERTEX_CLASS])
    }

    pub fn create_edge_class(&self, name: &str) -> Result<()> {
        self.create_class(name, &[EDGE_CLASS])
    }

    /// Superclass chain of a class; unknown classes map to themselves
    pub fn class_chain(&self, class: &str) -> Vec<String> {
        match self.schema() {
            Ok(schema) if schema.exists_class(class) => schema.superclass_chain(class),
            _ => vec![class.to_string()],
        }
    }

    // ========== Indexes ==========

    /// Create an index and fill it from the records already stored
    pub fn create_index(&self, definition: IndexDefinition) -> Result<()> {
        let clusters = {
            let schema = self.schema()?;
            schema.require_class(&definition.class)?;
            schema.class_clusters(&definition.class, true)?
        };

        let mut existing = Vec::new();
        for cluster in clusters {
            for rid in self.storage.cluster_rids(cluster, true)? {
                if let Some(record) = self.storage.get_record(rid)? {
                    existing.push(record);
                }
            }
        }

        {
            let mut indexes = self
                .indexes
                .write()
                .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?;
            let name = definition.name.clone();
            let index = indexes.create_index(definition)?;
            let mut failure = None;
            for record in &existing {
                if let Err(e) = index.check_unique(record) {
                    failure = Some(e);
                    break;
                }
                index.put(record);
            }
            if let Some(e) = failure {
                indexes.drop_index(&name)?;
                return Err(e);
            }
        }

        self.persist_indexes()?;
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes
            .write()
            .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?
            .drop_index(name)?;
        self.persist_indexes()
    }

    /// Run `f` against a named index while holding the index read lock
    pub fn with_index<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&MemoryIndex) -> Result<T>,
    {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?;
        let index = indexes
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        f(index)
    }

    pub fn index_definition(&self, name: &str) -> Result<IndexDefinition> {
        self.with_index(name, |index| Ok(index.definition().clone()))
    }

    /// Index definitions usable for queries on a class
    pub fn indexes_for_class(&self, class: &str) -> Result<Vec<IndexDefinition>> {
        let chain = self.class_chain(class);
        let indexes = self
            .indexes
            .read()
            .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?;
        Ok(indexes
            .indexes_on(&chain)
            .into_iter()
            .map(|i| i.definition().clone())
            .collect())
    }

    /// Number of stored records in a class
    pub fn count_class(&self, class: &str, polymorphic: bool) -> Result<u64> {
        let clusters = self.schema()?.class_clusters(class, polymorphic)?;
        let mut total = 0;
        for cluster in clusters {
            total += self.storage.count_cluster(cluster)?;
        }
        Ok(total)
    }

    // ========== Commit path ==========

    fn commit_transaction(&self, tx: &mut Transaction) -> Result<Vec<RecordChange>> {
        let changes = tx.prepare()?;
        {
            let mut indexes = self
                .indexes
                .write()
                .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?;
            indexes.validate(&changes, |class| self.class_chain(class))?;
            tx.commit(&changes)?;
            indexes.apply(&changes, |class| self.class_chain(class));
        }
        Ok(changes)
    }

    // ========== Metadata ==========

    fn persist_schema(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&*self.schema()?)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.storage.put_meta(SCHEMA_META_KEY, &bytes)
    }

    fn persist_indexes(&self) -> Result<()> {
        let definitions = self
            .indexes
            .read()
            .map_err(|_| Error::Internal("Failed to acquire index lock".to_string()))?
            .definitions();
        let bytes = serde_json::to_vec(&definitions)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.storage.put_meta(INDEX_META_KEY, &bytes)
    }

    fn load_metadata(&self) -> Result<()> {
        match self.storage.get_meta(SCHEMA_META_KEY)? {
            Some(bytes) => {
                let schema: Schema = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                *self
                    .schema
                    .write()
                    .map_err(|_| Error::Internal("Failed to acquire schema lock".to_string()))? =
                    schema;
            }
            None => {
                let clusters: Vec<(ClusterId, String)> = self
                    .schema()?
                    .classes()
                    .map(|c| (c.cluster, c.cluster_name.clone()))
                    .collect();
                for (id, name) in clusters {
                    self.storage.create_cluster(id, &name)?;
                }
                self.persist_schema()?;
            }
        }

        if let Some(bytes) = self.storage.get_meta(INDEX_META_KEY)? {
            let definitions: Vec<IndexDefinition> = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            for definition in definitions {
                debug!("Rebuilding index {}", definition.name);
                self.create_index(definition)?;
            }
        }
        Ok(())
    }
}

/// A unit of work against a database
pub struct DatabaseSession {
    db: Database,
    tx: Option<Transaction>,
}

impl DatabaseSession {
    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========== Transactions ==========

    pub fn begin(&mut self) -> Result<()> {
        if self.is_transaction_active() {
            return Err(Error::IllegalState(
                "A transaction is already active on this session".to_string(),
            ));
        }
        self.tx = Some(Transaction::new(self.db.storage.clone()));
        Ok(())
    }

    pub fn is_transaction_active(&self) -> bool {
        self.tx.as_ref().is_some_and(Transaction::is_active)
    }

    /// Commit the active transaction. On failure it is rolled back.
    pub fn commit(&mut self) -> Result<()> {
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| Error::IllegalState("No active transaction".to_string()))?;
        match self.db.commit_transaction(&mut tx) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Commit of transaction {} failed: {}", tx.id(), e);
                if tx.is_active() {
                    tx.rollback()?;
                }
                Err(e)
            }
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(mut tx) => tx.rollback(),
            None => Err(Error::IllegalState("No active transaction".to_string())),
        }
    }

    /// Run `f` inside the active transaction, or inside a new one that is
    /// committed when `f` succeeds
    pub fn atomically<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if self.is_transaction_active() {
            return f(self);
        }
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    // ========== Records ==========

    /// A new unsaved record of the class
    pub fn new_record(&self, class: &str) -> Result<Record> {
        let schema = self.db.schema()?;
        let class = schema.require_class(class)?;
        Ok(Record::new(class.name.clone(), schema.record_kind(&class.name)))
    }

    pub fn try_load(&mut self, rid: Rid) -> Result<Option<Record>> {
        match self.tx.as_mut() {
            Some(tx) => tx.load(rid),
            None => self.db.storage.get_record(rid),
        }
    }

    pub fn load(&mut self, rid: Rid) -> Result<Record> {
        self.try_load(rid)?.ok_or(Error::RecordNotFound(rid))
    }

    /// Save a record, assigning a position when it has none.
    ///
    /// Without an active transaction the save is committed immediately.
    pub fn save(&mut self, mut record: Record) -> Result<Record> {
        if !record.rid.is_persistent() {
            let cluster = self.db.schema()?.require_class(&record.class)?.cluster;
            record.rid = match self.tx.as_mut() {
                Some(tx) => tx.allocate_rid(cluster)?,
                None => self.db.storage.allocate_rid(cluster)?,
            };
        }

        match self.tx.as_mut() {
            Some(tx) => {
                tx.save(record.clone())?;
                Ok(record)
            }
            None => {
                let mut tx = Transaction::new(self.db.storage.clone());
                let rid = record.rid;
                tx.save(record)?;
                let changes = self.db.commit_transaction(&mut tx)?;
                changes
                    .into_iter()
                    .find(|c| c.rid == rid)
                    .and_then(|c| c.after)
                    .ok_or_else(|| Error::Internal(format!("Save of {} produced no change", rid)))
            }
        }
    }

    pub fn delete(&mut self, rid: Rid) -> Result<()> {
        if self.try_load(rid)?.is_none() {
            return Err(Error::RecordNotFound(rid));
        }
        match self.tx.as_mut() {
            Some(tx) => tx.delete(rid),
            None => {
                let mut tx = Transaction::new(self.db.storage.clone());
                tx.delete(rid)?;
                self.db.commit_transaction(&mut tx).map(|_| ())
            }
        }
    }

    /// Rids of a cluster as seen by this session, including records
    /// created by the active transaction
    pub fn browse_cluster(&self, cluster: ClusterId, ascending: bool) -> Result<Vec<Rid>> {
        let stored = self.db.storage.cluster_rids(cluster, true)?;
        let rids = match &self.tx {
            Some(tx) => {
                let mut all: BTreeSet<Rid> = stored
                    .into_iter()
                    .filter(|rid| !tx.is_deleted(*rid))
                    .collect();
                all.extend(tx.created_in_cluster(cluster));
                all.into_iter().collect()
            }
            None => stored,
        };
        Ok(if ascending {
            rids
        } else {
            rids.into_iter().rev().collect()
        })
    }

    /// Rids of a class, cluster by cluster
    pub fn browse_class(&self, class: &str, polymorphic: bool, ascending: bool) -> Result<Vec<Rid>> {
        let mut clusters = self.db.schema()?.class_clusters(class, polymorphic)?;
        if !ascending {
            clusters.reverse();
        }
        let mut rids = Vec::new();
        for cluster in clusters {
            rids.extend(self.browse_cluster(cluster, ascending)?);
        }
        Ok(rids)
    }

    /// Scan counter of the underlying storage
    pub fn records_loaded(&self) -> u64 {
        self.db.storage.records_loaded()
    }
}

impl Drop for DatabaseSession {
    fn drop(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            if tx.is_active() {
                warn!("Session dropped with an open transaction {}; rolling back", tx.id());
                let _ = tx.rollback();
            }
        }
    }
}
