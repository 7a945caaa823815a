//! Per-run tuning knobs.

/// Default number of concurrent batch-write workers.
pub const MAX_PARALLEL_DB_QUERIES: usize = 4;

/// Default hint for the key-value writer pool. The chunk-writer pool itself
/// is capped at 8 workers; larger values only widen channel buffers.
pub const MAX_PARALLEL_KV_WRITES: usize = 256;

/// Default number of companies per write transaction.
pub const BATCH_SIZE: usize = 512;

/// Configuration for one transform run. All knobs have defaults.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Concurrent batch-write workers (database transactions in flight).
    pub max_parallel_db_queries: usize,
    /// Parallelism hint for key-value staging.
    pub max_parallel_kv_writes: usize,
    /// Companies per write transaction.
    pub batch_size: usize,
    /// Drop and recreate the output tables before loading.
    pub clean_up: bool,
    /// Strip personally identifiable information from emitted records.
    pub privacy: bool,
    /// Write scalar tables instead of one JSON document per venue.
    pub structured: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_parallel_db_queries: MAX_PARALLEL_DB_QUERIES,
            max_parallel_kv_writes: MAX_PARALLEL_KV_WRITES,
            batch_size: BATCH_SIZE,
            clean_up: false,
            privacy: true,
            structured: false,
        }
    }
}
