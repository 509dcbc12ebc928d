use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default auto-compaction thresholds.
pub const DEFAULT_MIN_WRITES: u64 = 100;
pub const DEFAULT_MIN_DIRT_FACTOR: f64 = 0.25;

/// Automatic compaction policy.
///
/// When enabled, a compaction is triggered after a mutation once the tree has
/// accumulated at least `min_writes` operations since the file was created
/// and its dirt factor reached `min_dirt_factor`. At most one compaction runs
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoCompact {
    Off,
    On { min_writes: u64, min_dirt_factor: f64 },
}

impl AutoCompact {
    /// Enabled with the default thresholds.
    pub fn on() -> Self {
        AutoCompact::On {
            min_writes: DEFAULT_MIN_WRITES,
            min_dirt_factor: DEFAULT_MIN_DIRT_FACTOR,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let AutoCompact::On { min_dirt_factor, .. } = self {
            if !(0.0..=1.0).contains(min_dirt_factor) || min_dirt_factor.is_nan() {
                return Err(Error::InvalidConfig(format!(
                    "min_dirt_factor must be within [0, 1], got {min_dirt_factor}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for a database directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Automatic compaction policy (default: off).
    pub auto_compact: AutoCompact,

    /// Maximum entries per B-tree node before it splits (default: 32).
    pub btree_order: usize,

    /// Number of decoded nodes kept in the shared cache, 0 disables caching
    /// (default: 1024).
    pub node_cache_size: usize,

    /// Deadline applied to each public operation (default: 5s). Background
    /// work keeps running after a timeout.
    pub op_timeout: Duration,
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            auto_compact: AutoCompact::Off,
            btree_order: 32,
            node_cache_size: 1024,
            op_timeout: Duration::from_secs(5),
        }
    }

    /// Set the automatic compaction policy.
    pub fn auto_compact(mut self, policy: AutoCompact) -> Self {
        self.auto_compact = policy;
        self
    }

    /// Set the B-tree branching order.
    pub fn btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    /// Set the node cache capacity.
    pub fn node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    /// Set the per-operation deadline.
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Fail fast on invalid settings before anything touches the disk.
    pub fn validate(&self) -> Result<()> {
        if self.btree_order < 4 {
            return Err(Error::InvalidConfig(format!(
                "btree_order must be at least 4, got {}",
                self.btree_order
            )));
        }
        self.auto_compact.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::new("/tmp/ember");
        assert_eq!(config.dir, PathBuf::from("/tmp/ember"));
        assert_eq!(config.auto_compact, AutoCompact::Off);
        assert_eq!(config.btree_order, 32);
        assert_eq!(config.node_cache_size, 1024);
        config.validate().unwrap();
    }

    #[test]
    fn config_builder() {
        let config = Config::new("/tmp/ember")
            .auto_compact(AutoCompact::on())
            .btree_order(8)
            .node_cache_size(0)
            .op_timeout(Duration::from_millis(500));

        assert_eq!(
            config.auto_compact,
            AutoCompact::On {
                min_writes: DEFAULT_MIN_WRITES,
                min_dirt_factor: DEFAULT_MIN_DIRT_FACTOR
            }
        );
        assert_eq!(config.btree_order, 8);
        assert_eq!(config.node_cache_size, 0);
        assert_eq!(config.op_timeout, Duration::from_millis(500));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_dirt_factor() {
        for bad in [-0.1, 1.5, f64::NAN] {
            let config = Config::new("/tmp/ember").auto_compact(AutoCompact::On {
                min_writes: 10,
                min_dirt_factor: bad,
            });
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn rejects_tiny_order() {
        let config = Config::new("/tmp/ember").btree_order(2);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
