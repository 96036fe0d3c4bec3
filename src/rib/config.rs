//------------ Config --------------------------------------------------------

//! Configuration options for a tiered RIB.
//!
//! A configuration is an immutable value that is passed in as an argument to
//! [new_with_config](super::TieredRib::new_with_config). It is usually read
//! from a TOML document, whose `type` field selects the storage backend:
//!
//! ```
//! use rotonda_tiered_store::rib::config::StorageConfig;
//!
//! let config = StorageConfig::from_toml_str(
//!     r#"
//!     type = "hybrid"
//!     memory_threshold = 50000
//!
//!     [disk]
//!     path = "/tmp/rotonda-tiered-store-doc"
//!     sync_mode = "strict"
//!     "#,
//! ).unwrap();
//! assert_eq!(config.storage_type(), "hybrid");
//! ```

use std::path::PathBuf;

use serde_derive::Deserialize;

use crate::errors::EngineError;

//------------ StorageConfig -------------------------------------------------

/// Selects which tiers are active, and holds their options.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage only (default). Nothing survives a restart.
    #[serde(rename = "memory")]
    Memory(MemoryConfig),

    /// On-disk storage only, with a hot-read cache in front of it.
    #[serde(rename = "disk")]
    Disk(DiskStorageConfig),

    /// Memory and disk, with entries placed and migrated between them by a
    /// placement policy.
    #[serde(rename = "hybrid")]
    Hybrid(HybridStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryConfig::default())
    }
}

impl StorageConfig {
    /// Parse a configuration from a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: StorageConfig = toml::from_str(s)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether this configuration keeps data on disk.
    pub fn is_persistent(&self) -> bool {
        matches!(self, StorageConfig::Disk(_) | StorageConfig::Hybrid(_))
    }

    /// The storage type name, for logging and metrics.
    pub fn storage_type(&self) -> &'static str {
        match self {
            StorageConfig::Memory(_) => "memory",
            StorageConfig::Disk(_) => "disk",
            StorageConfig::Hybrid(_) => "hybrid",
        }
    }

    pub fn disk(&self) -> Option<&DiskStorageConfig> {
        match self {
            StorageConfig::Memory(_) => None,
            StorageConfig::Disk(c) => Some(c),
            StorageConfig::Hybrid(c) => Some(&c.disk),
        }
    }

    /// Check all options for values the engine cannot work with. Called by
    /// the engine at construction, so that a bad configuration fails fast.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            StorageConfig::Memory(c) => {
                if c.max_entries == Some(0) {
                    return Err(invalid("max_entries must be larger than 0"));
                }
                Ok(())
            }
            StorageConfig::Disk(c) => c.validate(),
            StorageConfig::Hybrid(c) => c.validate(),
        }
    }
}

fn invalid(msg: &str) -> EngineError {
    EngineError::ConfigInvalid(msg.to_string())
}

//------------ MemoryConfig --------------------------------------------------

/// Options for the memory tier when it is the only tier.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemoryConfig {
    /// The maximum number of entries. Unbounded if not set. Ignored for the
    /// hybrid backend, where `memory_threshold` bounds the memory tier.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

//------------ DiskStorageConfig ---------------------------------------------

/// Options for the disk tier.
#[derive(Clone, Debug, Deserialize)]
pub struct DiskStorageConfig {
    /// Path to the database directory. Created if it does not exist.
    pub path: PathBuf,

    /// Byte budget of the disk tier. Unbounded if not set.
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Compress payloads before storing them.
    #[serde(default = "DiskStorageConfig::default_compression")]
    pub compression: bool,

    #[serde(default = "DiskStorageConfig::default_sync_mode")]
    pub sync_mode: SyncMode,

    /// Interval of the background syncer for `SyncMode::Normal`.
    #[serde(default = "DiskStorageConfig::default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Capacity of the hot-read cache, in entries. Zero disables the cache.
    #[serde(default = "DiskStorageConfig::default_cache_size")]
    pub cache_size: usize,

    /// Period of the background compactor.
    #[serde(default = "DiskStorageConfig::default_compaction_interval")]
    pub compaction_interval_secs: u64,

    /// The minimum age of a tombstone before compaction removes the
    /// withdrawn prefix from disk.
    #[serde(default = "DiskStorageConfig::default_tombstone_retention")]
    pub tombstone_retention_secs: u64,

    #[serde(default)]
    pub io_retry: RetryConfig,
}

impl DiskStorageConfig {
    /// A configuration for a disk tier at `path`, with all other options
    /// set to their defaults.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_bytes: None,
            compression: Self::default_compression(),
            sync_mode: Self::default_sync_mode(),
            sync_interval_ms: Self::default_sync_interval(),
            cache_size: Self::default_cache_size(),
            compaction_interval_secs: Self::default_compaction_interval(),
            tombstone_retention_secs: Self::default_tombstone_retention(),
            io_retry: RetryConfig::default(),
        }
    }

    fn default_compression() -> bool {
        true
    }

    fn default_sync_mode() -> SyncMode {
        SyncMode::Normal
    }

    fn default_sync_interval() -> u64 {
        1000
    }

    fn default_cache_size() -> usize {
        10_000
    }

    fn default_compaction_interval() -> u64 {
        3600
    }

    fn default_tombstone_retention() -> u64 {
        300
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.path.as_os_str().is_empty() {
            return Err(invalid("disk path is empty"));
        }
        if self.path.is_file() {
            return Err(EngineError::ConfigInvalid(format!(
                "disk path {} is an existing file",
                self.path.display()
            )));
        }
        if self.max_size_bytes == Some(0) {
            return Err(invalid("max_size_bytes must be larger than 0"));
        }
        if self.sync_interval_ms == 0 {
            return Err(invalid("sync_interval_ms must be larger than 0"));
        }
        if self.compaction_interval_secs == 0 {
            return Err(invalid(
                "compaction_interval_secs must be larger than 0",
            ));
        }
        self.io_retry.validate()
    }
}

//------------ SyncMode ------------------------------------------------------

/// When writes to the disk tier become durable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// No explicit sync, rely on OS buffering. Data is flushed on shutdown,
    /// on compaction and on an explicit sync.
    None,
    /// Writes are flushed by a background syncer, every
    /// `sync_interval_ms`.
    Normal,
    /// Every write is durable before it is acknowledged.
    #[serde(alias = "full")]
    Strict,
}

//------------ RetryConfig ---------------------------------------------------

/// Bounded exponential backoff for disk operations that fail with an I/O
/// error.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if !(self.backoff_multiplier >= 1.0) {
            return Err(invalid("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(invalid(
                "max_delay_ms must not be smaller than initial_delay_ms",
            ));
        }
        Ok(())
    }
}

//------------ HybridStorageConfig -------------------------------------------

/// Options for the hybrid backend.
#[derive(Clone, Debug, Deserialize)]
pub struct HybridStorageConfig {
    pub disk: DiskStorageConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default = "HybridStorageConfig::default_placement_strategy")]
    pub placement_strategy: PlacementStrategy,

    /// The maximum number of entries in the memory tier. Migration starts
    /// moving entries to disk when it is reached.
    #[serde(default = "HybridStorageConfig::default_memory_threshold")]
    pub memory_threshold: usize,

    /// Run migration periodically, on top of the runs triggered by the
    /// memory threshold. Only the periodic runs promote entries to memory.
    #[serde(default = "HybridStorageConfig::default_auto_migration")]
    pub auto_migration: bool,

    #[serde(default = "HybridStorageConfig::default_migration_interval")]
    pub migration_interval_ms: u64,

    /// The maximum number of entries moved in one migration batch.
    #[serde(default = "HybridStorageConfig::default_migration_batch_size")]
    pub migration_batch_size: usize,

    /// The fraction of `memory_threshold` that demotion brings the memory
    /// tier down to.
    #[serde(default = "HybridStorageConfig::default_low_watermark")]
    pub migration_low_watermark: f64,

    /// How recent an access must be for `recent_in_memory` to promote a
    /// disk entry.
    #[serde(default = "HybridStorageConfig::default_recent_window")]
    pub recent_window_secs: u64,

    /// The number of accesses that make an entry frequent for
    /// `frequent_in_memory`.
    #[serde(default = "HybridStorageConfig::default_frequent_min_hits")]
    pub frequent_min_hits: u64,
}

impl HybridStorageConfig {
    /// A hybrid configuration around `disk`, with all other options set to
    /// their defaults.
    pub fn new(disk: DiskStorageConfig) -> Self {
        Self {
            disk,
            memory: MemoryConfig::default(),
            placement_strategy: Self::default_placement_strategy(),
            memory_threshold: Self::default_memory_threshold(),
            auto_migration: Self::default_auto_migration(),
            migration_interval_ms: Self::default_migration_interval(),
            migration_batch_size: Self::default_migration_batch_size(),
            migration_low_watermark: Self::default_low_watermark(),
            recent_window_secs: Self::default_recent_window(),
            frequent_min_hits: Self::default_frequent_min_hits(),
        }
    }

    fn default_placement_strategy() -> PlacementStrategy {
        PlacementStrategy::RecentInMemory
    }

    fn default_memory_threshold() -> usize {
        100_000
    }

    fn default_auto_migration() -> bool {
        true
    }

    fn default_migration_interval() -> u64 {
        1000
    }

    fn default_migration_batch_size() -> usize {
        1024
    }

    fn default_low_watermark() -> f64 {
        0.9
    }

    fn default_recent_window() -> u64 {
        300
    }

    fn default_frequent_min_hits() -> u64 {
        4
    }

    /// The memory size demotion brings the memory tier down to.
    pub fn memory_low_watermark(&self) -> usize {
        (self.memory_threshold as f64 * self.migration_low_watermark) as usize
    }

    fn validate(&self) -> Result<(), EngineError> {
        self.disk.validate()?;
        if self.memory_threshold == 0 {
            return Err(invalid("memory_threshold must be larger than 0"));
        }
        if self.migration_interval_ms == 0 {
            return Err(invalid("migration_interval_ms must be larger than 0"));
        }
        if self.migration_batch_size == 0 {
            return Err(invalid("migration_batch_size must be larger than 0"));
        }
        if !(self.migration_low_watermark > 0.0
            && self.migration_low_watermark <= 1.0)
        {
            return Err(invalid(
                "migration_low_watermark must be in the range (0, 1]",
            ));
        }
        if self.placement_strategy == PlacementStrategy::PeerBasedMemory {
            return Err(invalid(
                "placement strategy peer_based_memory is not supported: \
                payloads carry no peer",
            ));
        }
        Ok(())
    }
}

//------------ PlacementStrategy ---------------------------------------------

/// The named placement policies for the hybrid backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Keep recently written and read routes in memory, older ones on disk.
    RecentInMemory,
    /// Keep frequently accessed routes in memory.
    FrequentInMemory,
    /// Keep routes from specific peers in memory. Recognized, but rejected.
    PeerBasedMemory,
    /// A policy supplied by the caller, see
    /// [new_with_policy](super::TieredRib::new_with_policy).
    Custom,
}

impl PlacementStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementStrategy::RecentInMemory => "recent_in_memory",
            PlacementStrategy::FrequentInMemory => "frequent_in_memory",
            PlacementStrategy::PeerBasedMemory => "peer_based_memory",
            PlacementStrategy::Custom => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn default_storage_config() {
        let config = StorageConfig::default();
        assert!(matches!(config, StorageConfig::Memory(_)));
        assert!(!config.is_persistent());
        assert_eq!(config.storage_type(), "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn disk_storage_config() {
        let toml = r#"
        type = "disk"
        path = "/var/lib/rotonda"
        max_size_bytes = 1073741824
        compression = true
        sync_mode = "normal"
        cache_size = 50000
        compaction_interval_secs = 7200
        "#;

        let config = StorageConfig::from_toml_str(toml).unwrap();
        let StorageConfig::Disk(disk) = config else {
            panic!("expected a disk config");
        };
        assert_eq!(disk.path, Path::new("/var/lib/rotonda"));
        assert_eq!(disk.max_size_bytes, Some(1073741824));
        assert!(disk.compression);
        assert_eq!(disk.sync_mode, SyncMode::Normal);
        assert_eq!(disk.cache_size, 50000);
        assert_eq!(disk.compaction_interval_secs, 7200);
        assert_eq!(disk.tombstone_retention_secs, 300);
        assert_eq!(disk.io_retry.max_retries, 3);
    }

    #[test]
    fn hybrid_storage_config() {
        let toml = r#"
        type = "hybrid"
        placement_strategy = "frequent_in_memory"
        memory_threshold = 200000
        auto_migration = false

        [disk]
        path = "/var/lib/rotonda"
        compression = false
        sync_mode = "full"

        [disk.io_retry]
        max_retries = 5

        [memory]
        "#;

        let config = StorageConfig::from_toml_str(toml).unwrap();
        assert!(config.is_persistent());
        let StorageConfig::Hybrid(hybrid) = config else {
            panic!("expected a hybrid config");
        };
        assert_eq!(
            hybrid.placement_strategy,
            PlacementStrategy::FrequentInMemory
        );
        assert_eq!(hybrid.memory_threshold, 200000);
        assert_eq!(hybrid.memory_low_watermark(), 180000);
        assert!(!hybrid.auto_migration);
        assert_eq!(hybrid.disk.path, Path::new("/var/lib/rotonda"));
        assert!(!hybrid.disk.compression);
        assert_eq!(hybrid.disk.sync_mode, SyncMode::Strict);
        assert_eq!(hybrid.disk.io_retry.max_retries, 5);
        assert_eq!(hybrid.disk.io_retry.initial_delay_ms, 10);
    }

    #[test]
    fn invalid_configs() {
        let bad = [
            r#"
            type = "hybrid"
            memory_threshold = 0
            [disk]
            path = "/var/lib/rotonda"
            "#,
            r#"
            type = "hybrid"
            placement_strategy = "peer_based_memory"
            [disk]
            path = "/var/lib/rotonda"
            "#,
            r#"
            type = "hybrid"
            migration_low_watermark = 1.5
            [disk]
            path = "/var/lib/rotonda"
            "#,
            r#"
            type = "disk"
            path = ""
            "#,
            r#"
            type = "disk"
            path = "/var/lib/rotonda"
            max_size_bytes = 0
            "#,
            r#"
            type = "disk"
            path = "/var/lib/rotonda"
            sync_mode = "sometimes"
            "#,
            r#"
            type = "memory"
            max_entries = 0
            "#,
            r#"
            type = "tape"
            "#,
        ];

        for toml in bad {
            assert!(
                matches!(
                    StorageConfig::from_toml_str(toml),
                    Err(EngineError::ConfigInvalid(_))
                ),
                "accepted {}",
                toml
            );
        }
    }

    #[test]
    fn path_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = StorageConfig::Disk(DiskStorageConfig::new(file.path()));
        assert!(matches!(
            config.validate(),
            Err(EngineError::ConfigInvalid(_))
        ));
    }
}
