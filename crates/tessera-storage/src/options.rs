//! Storage configuration options

use std::path::PathBuf;

/// Options for opening the record store
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory holding the RocksDB files
    pub path: PathBuf,

    /// Create the directory and column families when missing
    pub create_if_missing: bool,

    /// Memtable size in bytes
    pub write_buffer_size: usize,

    /// Number of memtables kept before flushing
    pub max_write_buffer_number: i32,

    /// Background flush/compaction threads
    pub max_background_jobs: i32,

    /// LZ4-compress SST files
    pub enable_compression: bool,

    /// Bloom filter bits per key; 0 disables the filter
    pub bloom_filter_bits_per_key: i32,

    /// fsync the WAL on every committed transaction
    pub sync_wal: bool,
}

impl StorageOptions {
    /// Options for a store at the given path
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Small buffers and no fsync, for unit and integration tests
    pub fn for_testing<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            max_write_buffer_number: 2,
            max_background_jobs: 1,
            enable_compression: false,
            bloom_filter_bits_per_key: 10,
            sync_wal: false,
        }
    }

    /// Durable settings for long-running deployments
    pub fn for_production<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_compression: true,
            bloom_filter_bits_per_key: 10,
            sync_wal: true,
        }
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn sync_wal(mut self, sync: bool) -> Self {
        self.sync_wal = sync;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            create_if_missing: true,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_compression: true,
            bloom_filter_bits_per_key: 10,
            sync_wal: false,
        }
    }
}
