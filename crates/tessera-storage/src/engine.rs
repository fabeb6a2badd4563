//! Record store backed by RocksDB
//!
//! Records live in the `records` column family keyed by rid and encoded
//! with bincode. Cluster names live in `clusters`; per-cluster position
//! counters and other small values live in `meta`.

use crate::keys::{KeyBuilder, KeyDecoder};
use crate::options::StorageOptions;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch, WriteOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tessera_core::{ClusterId, Error, Record, Result, Rid};
use tracing::{debug, info};

/// Column family names
pub mod cf {
    pub const RECORDS: &str = "records";
    pub const CLUSTERS: &str = "clusters";
    pub const META: &str = "meta";
}

/// All column families used by Tessera
pub const COLUMN_FAMILIES: &[&str] = &[cf::RECORDS, cf::CLUSTERS, cf::META];

/// A single write applied as part of an atomic batch
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Record),
    Delete(Rid),
}

/// The record store
pub struct StorageEngine {
    db: Arc<DB>,
    options: StorageOptions,
    positions: Arc<Mutex<HashMap<ClusterId, i64>>>,
    records_loaded: Arc<AtomicU64>,
}

impl StorageEngine {
    /// Open or create a store
    pub fn open(options: StorageOptions) -> Result<Self> {
        info!("Opening storage engine at {:?}", options.path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(options.create_if_missing);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(options.write_buffer_size);
        db_opts.set_max_write_buffer_number(options.max_write_buffer_number);
        db_opts.set_max_background_jobs(options.max_background_jobs);

        if options.enable_compression {
            db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                if options.bloom_filter_bits_per_key > 0 {
                    let mut block_opts = rocksdb::BlockBasedOptions::default();
                    block_opts
                        .set_bloom_filter(options.bloom_filter_bits_per_key as f64, false);
                    cf_opts.set_block_based_table_factory(&block_opts);
                }
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &options.path, cf_descriptors)
            .map_err(|e| Error::Storage(e.to_string()))?;

        info!("Storage engine opened successfully");

        Ok(Self {
            db: Arc::new(db),
            options,
            positions: Arc::new(Mutex::new(HashMap::new())),
            records_loaded: Arc::new(AtomicU64::new(0)),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("Column family not found: {}", name)))
    }

    // ========== Cluster Operations ==========

    /// Register a cluster name
    pub fn create_cluster(&self, cluster: ClusterId, name: &str) -> Result<()> {
        let cf = self.cf(cf::CLUSTERS)?;
        self.db
            .put_cf(&cf, KeyBuilder::cluster(cluster), name.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;
        debug!("Created cluster {} ({})", cluster, name);
        Ok(())
    }

    /// All registered clusters in id order
    pub fn clusters(&self) -> Result<Vec<(ClusterId, String)>> {
        let prefix = KeyBuilder::cluster_prefix();
        let cf = self.cf(cf::CLUSTERS)?;

        let mut clusters = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf, &prefix) {
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let mut decoder = KeyDecoder::new(&key);
            decoder.read_u8();
            let id = decoder
                .read_i32()
                .ok_or_else(|| Error::DataCorruption("Malformed cluster key".to_string()))?;
            let name = String::from_utf8(value.to_vec())
                .map_err(|e| Error::DataCorruption(e.to_string()))?;
            clusters.push((id, name));
        }
        Ok(clusters)
    }

    /// Reserve the next free position in a cluster
    pub fn allocate_rid(&self, cluster: ClusterId) -> Result<Rid> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire position lock".to_string()))?;

        let meta_key = format!("cluster.position.{}", cluster);
        let next = match positions.get(&cluster) {
            Some(next) => *next,
            None => match self.get_meta(&meta_key)? {
                Some(bytes) => {
                    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        Error::DataCorruption(format!("Bad position counter for {}", cluster))
                    })?;
                    i64::from_be_bytes(raw)
                }
                None => 0,
            },
        };

        positions.insert(cluster, next + 1);
        self.put_meta(&meta_key, &(next + 1).to_be_bytes())?;
        Ok(Rid::new(cluster, next))
    }

    // ========== Record Operations ==========

    /// Store a record under its rid
    pub fn put_record(&self, record: &Record) -> Result<()> {
        self.write(vec![WriteOp::Put(record.clone())])
    }

    /// Load a record; every call counts towards [`Self::records_loaded`]
    pub fn get_record(&self, rid: Rid) -> Result<Option<Record>> {
        self.records_loaded.fetch_add(1, Ordering::Relaxed);
        let cf = self.cf(cf::RECORDS)?;

        match self.db.get_cf(&cf, KeyBuilder::record(rid)) {
            Ok(Some(value)) => {
                let record: Record = bincode::deserialize(&value)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Remove a record; returns false when it did not exist
    pub fn delete_record(&self, rid: Rid) -> Result<bool> {
        let cf = self.cf(cf::RECORDS)?;
        let exists = self
            .db
            .get_pinned_cf(&cf, KeyBuilder::record(rid))
            .map_err(|e| Error::Storage(e.to_string()))?
            .is_some();
        if exists {
            self.write(vec![WriteOp::Delete(rid)])?;
        }
        Ok(exists)
    }

    /// Rids stored in a cluster, without loading the records
    pub fn cluster_rids(&self, cluster: ClusterId, ascending: bool) -> Result<Vec<Rid>> {
        let prefix = KeyBuilder::record_prefix(cluster);
        let cf = self.cf(cf::RECORDS)?;

        let mut rids = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf, &prefix) {
            let (key, _) = item.map_err(|e| Error::Storage(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let rid = KeyDecoder::new(&key)
                .read_rid()
                .ok_or_else(|| Error::DataCorruption("Malformed record key".to_string()))?;
            rids.push(rid);
        }

        if !ascending {
            rids.reverse();
        }
        Ok(rids)
    }

    /// Number of records in a cluster
    pub fn count_cluster(&self, cluster: ClusterId) -> Result<u64> {
        Ok(self.cluster_rids(cluster, true)?.len() as u64)
    }

    /// Apply a set of writes atomically
    pub fn write(&self, ops: Vec<WriteOp>) -> Result<()> {
        let cf = self.cf(cf::RECORDS)?;
        let mut batch = WriteBatch::default();

        for op in &ops {
            match op {
                WriteOp::Put(record) => {
                    if !record.rid.is_persistent() {
                        return Err(Error::Internal(format!(
                            "Cannot store record without position: {}",
                            record.rid
                        )));
                    }
                    let value = bincode::serialize(record)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    batch.put_cf(&cf, KeyBuilder::record(record.rid), &value);
                }
                WriteOp::Delete(rid) => batch.delete_cf(&cf, KeyBuilder::record(*rid)),
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.options.sync_wal);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| Error::Storage(e.to_string()))?;

        debug!("Applied {} storage writes", ops.len());
        Ok(())
    }

    /// Scan counter: records loaded since open or the last reset
    pub fn records_loaded(&self) -> u64 {
        self.records_loaded.load(Ordering::Relaxed)
    }

    pub fn reset_records_loaded(&self) {
        self.records_loaded.store(0, Ordering::Relaxed);
    }

    // ========== Metadata Operations ==========

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let cf = self.cf(cf::META)?;
        self.db
            .put_cf(&cf, KeyBuilder::meta(key), value)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf::META)?;
        self.db
            .get_cf(&cf, KeyBuilder::meta(key))
            .map_err(|e| Error::Storage(e.to_string()))
    }

    /// Flush all in-memory data to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))?;
        info!("Storage engine flushed");
        Ok(())
    }
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            options: self.options.clone(),
            positions: Arc::clone(&self.positions),
            records_loaded: Arc::clone(&self.records_loaded),
        }
    }
}
