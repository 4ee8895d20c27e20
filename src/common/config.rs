//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the storage and concurrency engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Buffer pool size in frames.
    pub pool_size: usize,
    /// Number of access samples the replacer keeps per frame.
    pub replacer_k: usize,
    /// Maximum number of entries in a B+tree leaf page (>= 2).
    pub leaf_max_size: usize,
    /// Maximum number of children of a B+tree internal page (>= 3).
    pub internal_max_size: usize,
    /// How often the background deadlock detector scans the wait-for graph.
    pub deadlock_detection_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            replacer_k: 2,
            leaf_max_size: 32,
            internal_max_size: 32,
            deadlock_detection_interval: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.replacer_k, 2);
        assert!(config.leaf_max_size >= 2);
        assert!(config.internal_max_size >= 3);
        assert_eq!(config.deadlock_detection_interval, Duration::from_millis(50));
    }
}
