//! Execution configuration

use std::time::Duration;

/// Knobs that bound memory use and cancellation behavior of a query
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Maximum rows buffered by DISTINCT and ORDER BY; `None` is unbounded
    pub max_distinct_elements: Option<usize>,

    /// Rows produced between two polls of the interrupt token
    pub interrupt_poll_interval: u64,

    /// Deadline applied to every statement that does not set its own
    pub default_timeout: Option<Duration>,

    /// Number of compiled plans kept by the executor; 0 disables caching
    pub plan_cache_size: usize,

    /// Classes with at most this many records are prefetched by MATCH
    pub match_prefetch_threshold: u64,

    /// Record per-step timings and row counts
    pub profiling: bool,

    /// Commit bulk mutations every N rows
    pub batch_size: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_distinct_elements: None,
            interrupt_poll_interval: 64,
            default_timeout: None,
            plan_cache_size: 300,
            match_prefetch_threshold: 100,
            profiling: false,
            batch_size: None,
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small limits so tests hit every boundary quickly
    pub fn for_testing() -> Self {
        Self {
            max_distinct_elements: Some(10_000),
            interrupt_poll_interval: 1,
            plan_cache_size: 16,
            ..Self::default()
        }
    }

    pub fn max_distinct_elements(mut self, max: Option<usize>) -> Self {
        self.max_distinct_elements = max;
        self
    }

    pub fn interrupt_poll_interval(mut self, rows: u64) -> Self {
        self.interrupt_poll_interval = rows.max(1);
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn plan_cache_size(mut self, size: usize) -> Self {
        self.plan_cache_size = size;
        self
    }

    pub fn match_prefetch_threshold(mut self, records: u64) -> Self {
        self.match_prefetch_threshold = records;
        self
    }

    pub fn profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn batch_size(mut self, size: Option<usize>) -> Self {
        self.batch_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.interrupt_poll_interval, 64);
        assert_eq!(config.plan_cache_size, 300);
        assert!(config.max_distinct_elements.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ExecutionConfig::new()
            .max_distinct_elements(Some(5))
            .interrupt_poll_interval(0)
            .profiling(true);
        assert_eq!(config.max_distinct_elements, Some(5));
        assert_eq!(config.interrupt_poll_interval, 1);
        assert!(config.profiling);
    }
}
