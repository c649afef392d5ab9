use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;

use crate::checksum::ChecksumAlgorithm;
use crate::error::{TransactError, TransactResult};

/// Smallest journal slot that still fits a program header and a handful of commands.
const TXN_BUFFER_SIZE_MIN: u32 = 256;

/// Largest journal slot (16 MiB).
const TXN_BUFFER_SIZE_MAX: u32 = 16 * 1024 * 1024;

/// Default journal slot size (8 KiB).
const DEFAULT_TXN_BUFFER_SIZE: u32 = 8 * 1024;

/// Default number of journal slots.
const DEFAULT_TXN_BUFFER_COUNT: u32 = 1024;

/// Default number of revision table slots.
const DEFAULT_REVISION_TABLE_COUNT: u32 = 4096;

/// Ring capacities are bounded so both indices fit below the dual counter's empty bit.
const RING_COUNT_MIN: u32 = 2;
const RING_COUNT_MAX: u32 = 1 << 30;

/// Default upper bound for the revision pool; `u64::MAX` is reserved for INFINITY.
const DEFAULT_REVISION_POOL_CAPACITY: u64 = u64::MAX - 1;

/// Default background collection interval (1 second).
const DEFAULT_GC_INTERVAL_MS: u64 = 1_000;

/// Garbage collector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run collection cycles on a dedicated background thread.
    pub background: bool,

    /// Maximum time between background cycles when no hint arrives (milliseconds).
    pub interval_ms: u64,

    /// Hint the collector when the last reader of a revision releases its pin.
    pub collect_on_release: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            background: true,
            interval_ms: DEFAULT_GC_INTERVAL_MS,
            collect_on_release: true,
        }
    }
}

/// Primary configuration surface for a store instance.
///
/// Capacities recorded in the metadata files may only grow between restarts.
/// Opening an existing store with a smaller table, journal or pool capacity
/// than the one on disk fails instead of truncating history.
///
/// # Example
///
/// ```rust
/// use bop_transact::{ChecksumAlgorithm, StoreConfig};
/// use std::path::PathBuf;
///
/// let config = StoreConfig {
///     root_dir: PathBuf::from("/var/lib/rt"),
///     txn_buffer_count: 4096,
///     checksum: ChecksumAlgorithm::Crc32,
///     ..StoreConfig::default()
/// }
/// .normalized();
/// assert_eq!(config.txn_buffer_count, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage root holding the metadata files and the link trees.
    pub root_dir: PathBuf,

    /// Size in bytes of a single journal slot; bounds the size of one compiled program.
    pub txn_buffer_size: u32,

    /// Number of journal slots; bounds the number of uncollected transactions.
    pub txn_buffer_count: u32,

    /// Number of revision table slots; bounds the number of uncollected revisions.
    pub revision_table_count: u32,

    /// Highest revision the pool will ever hand out.
    pub revision_pool_capacity: u64,

    /// Algorithm used for new table entries and programs.
    pub checksum: ChecksumAlgorithm,

    /// Garbage collector tuning.
    pub gc: GcConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/rt"),
            txn_buffer_size: DEFAULT_TXN_BUFFER_SIZE,
            txn_buffer_count: DEFAULT_TXN_BUFFER_COUNT,
            revision_table_count: DEFAULT_REVISION_TABLE_COUNT,
            revision_pool_capacity: DEFAULT_REVISION_POOL_CAPACITY,
            checksum: ChecksumAlgorithm::default(),
            gc: GcConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Returns a copy of the configuration with capacities clamped into supported bounds.
    ///
    /// Zero values are replaced by defaults and slot sizes are rounded up to a
    /// multiple of eight so every block in a mapped ring stays word aligned.
    pub fn normalized(mut self) -> Self {
        let size = if self.txn_buffer_size == 0 {
            DEFAULT_TXN_BUFFER_SIZE
        } else {
            self.txn_buffer_size
        };
        let size = size.clamp(TXN_BUFFER_SIZE_MIN, TXN_BUFFER_SIZE_MAX);
        self.txn_buffer_size = (size + 7) & !7;

        self.txn_buffer_count = if self.txn_buffer_count == 0 {
            DEFAULT_TXN_BUFFER_COUNT
        } else {
            self.txn_buffer_count.clamp(RING_COUNT_MIN, RING_COUNT_MAX)
        };

        self.revision_table_count = if self.revision_table_count == 0 {
            DEFAULT_REVISION_TABLE_COUNT
        } else {
            self.revision_table_count.clamp(RING_COUNT_MIN, RING_COUNT_MAX)
        };

        if self.revision_pool_capacity == 0 || self.revision_pool_capacity == u64::MAX {
            self.revision_pool_capacity = DEFAULT_REVISION_POOL_CAPACITY;
        }

        if self.gc.interval_ms == 0 {
            self.gc.interval_ms = DEFAULT_GC_INTERVAL_MS;
        }

        self
    }

    /// Rejects configurations that cannot be normalized into something usable.
    pub fn validate(&self) -> TransactResult<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(TransactError::invalid_config("root_dir must not be empty"));
        }
        if self.txn_buffer_size % 8 != 0 {
            return Err(TransactError::invalid_config(format!(
                "txn_buffer_size {} is not a multiple of 8",
                self.txn_buffer_size
            )));
        }
        if !(TXN_BUFFER_SIZE_MIN..=TXN_BUFFER_SIZE_MAX).contains(&self.txn_buffer_size) {
            return Err(TransactError::invalid_config(format!(
                "txn_buffer_size {} outside [{TXN_BUFFER_SIZE_MIN}, {TXN_BUFFER_SIZE_MAX}]",
                self.txn_buffer_size
            )));
        }
        for (name, count) in [
            ("txn_buffer_count", self.txn_buffer_count),
            ("revision_table_count", self.revision_table_count),
        ] {
            if !(RING_COUNT_MIN..=RING_COUNT_MAX).contains(&count) {
                return Err(TransactError::invalid_config(format!(
                    "{name} {count} outside [{RING_COUNT_MIN}, {RING_COUNT_MAX}]"
                )));
            }
        }
        Ok(())
    }
}

impl Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreConfig(root_dir={:?}, txn_buffer_size={}, txn_buffer_count={}, revision_table_count={}, revision_pool_capacity={}, checksum={:?}, gc_background={}, gc_interval_ms={}, gc_collect_on_release={})",
            self.root_dir,
            self.txn_buffer_size,
            self.txn_buffer_count,
            self.revision_table_count,
            self.revision_pool_capacity,
            self.checksum,
            self.gc.background,
            self.gc.interval_ms,
            self.gc.collect_on_release
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = StoreConfig::default().normalized();
        cfg.validate().expect("valid");
        assert_eq!(cfg.txn_buffer_size, DEFAULT_TXN_BUFFER_SIZE);
        assert_eq!(cfg.checksum, ChecksumAlgorithm::Crc64Nvme);
    }

    #[test]
    fn normalization_clamps_and_aligns() {
        let cfg = StoreConfig {
            txn_buffer_size: 1001,
            txn_buffer_count: 1,
            revision_table_count: 0,
            revision_pool_capacity: u64::MAX,
            ..StoreConfig::default()
        }
        .normalized();
        assert_eq!(cfg.txn_buffer_size, 1008);
        assert_eq!(cfg.txn_buffer_count, RING_COUNT_MIN);
        assert_eq!(cfg.revision_table_count, DEFAULT_REVISION_TABLE_COUNT);
        assert_eq!(cfg.revision_pool_capacity, u64::MAX - 1);
        cfg.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_unaligned_slots() {
        let cfg = StoreConfig {
            txn_buffer_size: 1001,
            ..StoreConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(TransactError::InvalidConfig(_))
        ));
    }

    #[test]
    fn serde_fills_missing_fields() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"root_dir":"/tmp/rt","checksum":"crc32"}"#).expect("parse");
        assert_eq!(cfg.checksum, ChecksumAlgorithm::Crc32);
        assert_eq!(cfg.txn_buffer_count, DEFAULT_TXN_BUFFER_COUNT);
        assert!(cfg.gc.collect_on_release);
    }
}
