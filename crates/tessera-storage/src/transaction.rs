//! Optimistic transactions over the record store
//!
//! Writes are buffered until commit. Every record saved in a transaction
//! carries the version it was loaded with; at commit the stored version
//! must still match, otherwise the commit fails with [`Error::NeedRetry`]
//! and nothing is written.

use crate::engine::{StorageEngine, WriteOp};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{ClusterId, Error, Record, Result, Rid};
use tracing::debug;

/// Global transaction ID counter
static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and accepting operations
    Active,
    /// Transaction has been committed
    Committed,
    /// Transaction has been rolled back
    RolledBack,
}

/// A pending operation in the transaction
#[derive(Debug, Clone)]
pub enum TransactionOperation {
    /// Create or update a record
    Save(Record),
    /// Delete a record
    Delete(Rid),
}

/// Before and after images of a record touched by a committed transaction
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub rid: Rid,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

/// A buffered, optimistically checked transaction
pub struct Transaction {
    id: u64,
    engine: StorageEngine,
    state: TransactionState,

    /// Pending operations in submission order, latest per rid wins
    operations: Vec<TransactionOperation>,

    /// Read cache including pending changes; `None` marks a deletion
    record_cache: HashMap<Rid, Option<Record>>,

    /// Records first stored by this transaction
    created: BTreeSet<Rid>,
}

impl Transaction {
    pub fn new(engine: StorageEngine) -> Self {
        let id = TRANSACTION_COUNTER.fetch_add(1, Ordering::SeqCst);
        debug!("Begin transaction {}", id);
        Self {
            id,
            engine,
            state: TransactionState::Active,
            operations: Vec::new(),
            record_cache: HashMap::new(),
            created: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    fn check_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::TransactionAborted(
                "Transaction is no longer active".to_string(),
            ));
        }
        Ok(())
    }

    /// Assign a position to a new record in the given cluster
    pub fn allocate_rid(&mut self, cluster: ClusterId) -> Result<Rid> {
        self.check_active()?;
        let rid = self.engine.allocate_rid(cluster)?;
        self.created.insert(rid);
        Ok(rid)
    }

    /// Buffer a save; the record must already have a position
    pub fn save(&mut self, record: Record) -> Result<()> {
        self.check_active()?;
        if !record.rid.is_persistent() {
            return Err(Error::IllegalState(format!(
                "Record {} has no position",
                record.rid
            )));
        }
        self.record_cache.insert(record.rid, Some(record.clone()));
        self.operations.push(TransactionOperation::Save(record));
        Ok(())
    }

    /// Load a record as seen by this transaction
    pub fn load(&mut self, rid: Rid) -> Result<Option<Record>> {
        self.check_active()?;
        if let Some(cached) = self.record_cache.get(&rid) {
            return Ok(cached.clone());
        }
        self.engine.get_record(rid)
    }

    pub fn delete(&mut self, rid: Rid) -> Result<()> {
        self.check_active()?;
        self.record_cache.insert(rid, None);
        self.operations.push(TransactionOperation::Delete(rid));
        Ok(())
    }

    /// True when the record was deleted by this transaction
    pub fn is_deleted(&self, rid: Rid) -> bool {
        matches!(self.record_cache.get(&rid), Some(None))
    }

    /// Records created in a cluster by this transaction and still alive
    pub fn created_in_cluster(&self, cluster: ClusterId) -> Vec<Rid> {
        self.created
            .iter()
            .filter(|rid| rid.cluster() == cluster)
            .filter(|rid| matches!(self.record_cache.get(rid), Some(Some(_))))
            .copied()
            .collect()
    }

    /// Compute the effect of committing without writing anything.
    ///
    /// Fails with `NeedRetry` when a record changed in storage since this
    /// transaction loaded it.
    pub fn prepare(&self) -> Result<Vec<RecordChange>> {
        self.check_active()?;

        let mut touched: Vec<Rid> = Vec::new();
        for op in &self.operations {
            let rid = match op {
                TransactionOperation::Save(record) => record.rid,
                TransactionOperation::Delete(rid) => *rid,
            };
            if !touched.contains(&rid) {
                touched.push(rid);
            }
        }

        let mut changes = Vec::with_capacity(touched.len());
        for rid in touched {
            let before = if self.created.contains(&rid) {
                None
            } else {
                self.engine.get_record(rid)?
            };
            let after = self.record_cache.get(&rid).cloned().flatten();

            if let (Some(stored), Some(pending)) = (&before, &after) {
                if stored.version != pending.version {
                    return Err(Error::NeedRetry(
                        Error::RecordConflict {
                            rid,
                            expected: pending.version,
                            found: stored.version,
                        }
                        .to_string(),
                    ));
                }
            }

            let after = after.map(|mut record| {
                record.version += 1;
                record
            });
            if before.is_none() && after.is_none() {
                continue;
            }
            changes.push(RecordChange { rid, before, after });
        }
        Ok(changes)
    }

    /// Write prepared changes and close the transaction
    pub fn commit(&mut self, changes: &[RecordChange]) -> Result<()> {
        self.check_active()?;

        let ops = changes
            .iter()
            .map(|change| match &change.after {
                Some(record) => WriteOp::Put(record.clone()),
                None => WriteOp::Delete(change.rid),
            })
            .collect();
        self.engine.write(ops)?;

        self.state = TransactionState::Committed;
        debug!("Committed transaction {} ({} changes)", self.id, changes.len());
        Ok(())
    }

    /// Discard all pending operations
    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;

        self.operations.clear();
        self.record_cache.clear();
        self.created.clear();

        self.state = TransactionState::RolledBack;
        debug!("Rolled back transaction {}", self.id);
        Ok(())
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StorageOptions;
    use tempfile::TempDir;
    use tessera_core::RecordKind;

    fn create_test_engine() -> (StorageEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let options = StorageOptions::for_testing(temp_dir.path());
        let engine = StorageEngine::open(options).unwrap();
        (engine, temp_dir)
    }

    fn commit(tx: &mut Transaction) -> Result<Vec<RecordChange>> {
        let changes = tx.prepare()?;
        tx.commit(&changes)?;
        Ok(changes)
    }

    #[test]
    fn test_transaction_commit() {
        let (engine, _dir) = create_test_engine();
        let mut tx = Transaction::new(engine.clone());

        let mut record = Record::new("Person", RecordKind::Vertex);
        record.rid = tx.allocate_rid(5).unwrap();
        record.set("name", "Alice");
        tx.save(record.clone()).unwrap();

        assert!(tx.load(record.rid).unwrap().is_some());
        assert!(engine.get_record(record.rid).unwrap().is_none());
        assert_eq!(tx.created_in_cluster(5), vec![record.rid]);

        let changes = commit(&mut tx).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].before.is_none());

        let stored = engine.get_record(record.rid).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_transaction_rollback() {
        let (engine, _dir) = create_test_engine();
        let mut tx = Transaction::new(engine.clone());
        let mut record = Record::new("Person", RecordKind::Vertex);
        record.rid = tx.allocate_rid(5).unwrap();
        tx.save(record.clone()).unwrap();

        tx.rollback().unwrap();

        assert!(engine.get_record(record.rid).unwrap().is_none());
        assert!(tx.save(record).is_err());
    }

    #[test]
    fn test_transaction_delete() {
        let (engine, _dir) = create_test_engine();
        let mut record = Record::new("Person", RecordKind::Vertex);
        record.rid = engine.allocate_rid(5).unwrap();
        record.version = 1;
        engine.put_record(&record).unwrap();

        let mut tx = Transaction::new(engine.clone());
        tx.delete(record.rid).unwrap();
        assert!(tx.is_deleted(record.rid));
        assert!(tx.load(record.rid).unwrap().is_none());
        assert!(engine.get_record(record.rid).unwrap().is_some());

        commit(&mut tx).unwrap();
        assert!(engine.get_record(record.rid).unwrap().is_none());
    }

    #[test]
    fn test_version_conflict_needs_retry() {
        let (engine, _dir) = create_test_engine();
        let mut record = Record::new("Person", RecordKind::Vertex);
        record.rid = engine.allocate_rid(5).unwrap();
        record.version = 1;
        engine.put_record(&record).unwrap();

        let mut first = Transaction::new(engine.clone());
        let mut second = Transaction::new(engine.clone());

        let mut a = first.load(record.rid).unwrap().unwrap();
        a.set("x", 1i64);
        first.save(a).unwrap();

        let mut b = second.load(record.rid).unwrap().unwrap();
        b.set("x", 2i64);
        second.save(b).unwrap();

        commit(&mut first).unwrap();
        let err = commit(&mut second).unwrap_err();
        assert!(err.is_retryable());

        let stored = engine.get_record(record.rid).unwrap().unwrap();
        assert_eq!(stored.get("x"), Some(&tessera_core::Value::Integer(1)));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_create_then_delete_is_noop() {
        let (engine, _dir) = create_test_engine();
        let mut tx = Transaction::new(engine);
        let mut record = Record::new("Person", RecordKind::Vertex);
        record.rid = tx.allocate_rid(5).unwrap();
        tx.save(record.clone()).unwrap();
        tx.delete(record.rid).unwrap();
        assert!(tx.created_in_cluster(5).is_empty());
        assert!(commit(&mut tx).unwrap().is_empty());
    }
}
