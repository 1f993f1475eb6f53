//! Engine configuration.
//!
//! Configuration is split in two parts:
//!
//! - [`Format`]: parameters that change the byte layout of sectors. They are
//!   persisted in the database header and always taken from there when an
//!   existing database is reopened.
//! - Tweaks: split thresholds and cache policy. They only affect
//!   performance and may differ from one open to the next. The engine asks
//!   a [`Tweaks`] implementation; [`DefaultTweaks`] reads them from
//!   [`EngineConfig`].
//!
//! # Environment Variables
//!
//! - `SECTORDB_DURABLE_COMMITS`: `true`/`false` (default: `true`)
//! - `SECTORDB_CACHE_BYTES`: shared sector cache capacity (default: 64 MiB)
//! - `SECTORDB_MAX_LEAF_BYTES`: leaf split threshold (default: `4096`)
//! - `SECTORDB_MAX_INTERNAL_BYTES`: internal split threshold (default: `4096`)
//! - `SECTORDB_MAX_INTERNAL_CHILDREN`: internal fan-out limit (default: `127`)
//! - `SECTORDB_KEY_INLINE_CAP`: inline key bytes for new databases (default: `64`)
//! - `SECTORDB_VALUE_INLINE_CAP`: inline value bytes for new databases (default: `256`)
//! - `SECTORDB_ALLOC_LEAF_BYTES`: allocator bitmap sector size for new databases (default: `4096`)

use std::str::FromStr;

use crate::sector::{GRANULE_SIZE, SECTOR_PTR_SIZE};

/// Hard ceiling for any B+Tree node, well below the largest encodable sector.
pub const MAX_NODE_BYTES: usize = 32 * 1024;

/// Largest inline portion of a key or value.
pub const MAX_INLINE_CAP: usize = 1024;

/// Largest internal node fan-out the one-byte header can express.
pub const MAX_INTERNAL_CHILDREN: usize = 127;

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
    /// A combination of values cannot produce a working tree.
    Inconsistent(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
            Self::Inconsistent(message) => write!(f, "inconsistent configuration: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Layout parameters persisted in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Key bytes stored directly in a node; the rest goes to a blob tree.
    pub key_inline_cap: usize,
    /// Value bytes stored directly in a leaf; the rest goes to a blob tree.
    pub value_inline_cap: usize,
    /// Size of one allocator bitmap sector in bytes.
    pub alloc_leaf_bytes: usize,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            key_inline_cap: 64,
            value_inline_cap: 256,
            alloc_leaf_bytes: 4096,
        }
    }
}

impl Format {
    /// Granules tracked by one allocator leaf.
    #[must_use]
    pub const fn alloc_leaf_granules(&self) -> u64 {
        (self.alloc_leaf_bytes * 8) as u64
    }

    /// Largest possible leaf entry including its offset table slot.
    #[must_use]
    pub const fn max_leaf_entry_size(&self) -> usize {
        2 + 4 + 8 + self.key_inline_cap + SECTOR_PTR_SIZE + self.value_inline_cap + SECTOR_PTR_SIZE
    }

    /// Largest possible internal node entry.
    #[must_use]
    pub const fn max_internal_entry_size(&self) -> usize {
        4 + self.key_inline_cap + SECTOR_PTR_SIZE + SECTOR_PTR_SIZE + 8
    }

    /// Check that the layout parameters are encodable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_inline_cap == 0 || self.key_inline_cap > MAX_INLINE_CAP {
            return Err(ConfigError::Inconsistent(format!(
                "key inline cap {} must be in 1..={MAX_INLINE_CAP}",
                self.key_inline_cap
            )));
        }
        if self.value_inline_cap > MAX_INLINE_CAP {
            return Err(ConfigError::Inconsistent(format!(
                "value inline cap {} exceeds {MAX_INLINE_CAP}",
                self.value_inline_cap
            )));
        }
        let granule = GRANULE_SIZE as usize;
        if self.alloc_leaf_bytes < granule
            || self.alloc_leaf_bytes > MAX_NODE_BYTES
            || self.alloc_leaf_bytes % granule != 0
        {
            return Err(ConfigError::Inconsistent(format!(
                "allocator leaf size {} must be a multiple of {granule} up to {MAX_NODE_BYTES}",
                self.alloc_leaf_bytes
            )));
        }
        Ok(())
    }
}

/// Engine configuration.
///
/// # Post-conditions
///
/// After `validate()` succeeds, every node the engine builds fits in one
/// sector and a leaf can always hold at least two entries before splitting.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Use `durable_flush` (fsync) at commit instead of a plain flush.
    pub durable_commits: bool,
    /// Soft capacity of the shared committed-sector cache.
    pub cache_capacity_bytes: usize,
    /// Leaf nodes larger than this are split.
    pub max_leaf_bytes: usize,
    /// Internal nodes larger than this are split.
    pub max_internal_bytes: usize,
    /// Internal nodes with more children than this are split.
    pub max_internal_children: usize,
    /// Layout used when creating a new database.
    pub format: Format,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durable_commits: true,
            cache_capacity_bytes: Self::DEFAULT_CACHE_BYTES,
            max_leaf_bytes: 4096,
            max_internal_bytes: 4096,
            max_internal_children: MAX_INTERNAL_CHILDREN,
            format: Format::default(),
        }
    }
}

impl EngineConfig {
    /// Default shared cache capacity (64 MiB).
    pub const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting combination fails [`EngineConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            durable_commits: load_bool("SECTORDB_DURABLE_COMMITS", defaults.durable_commits)?,
            cache_capacity_bytes: load_var("SECTORDB_CACHE_BYTES", defaults.cache_capacity_bytes)?,
            max_leaf_bytes: load_var("SECTORDB_MAX_LEAF_BYTES", defaults.max_leaf_bytes)?,
            max_internal_bytes: load_var("SECTORDB_MAX_INTERNAL_BYTES", defaults.max_internal_bytes)?,
            max_internal_children: load_var(
                "SECTORDB_MAX_INTERNAL_CHILDREN",
                defaults.max_internal_children,
            )?,
            format: Format {
                key_inline_cap: load_var("SECTORDB_KEY_INLINE_CAP", defaults.format.key_inline_cap)?,
                value_inline_cap: load_var(
                    "SECTORDB_VALUE_INLINE_CAP",
                    defaults.format.value_inline_cap,
                )?,
                alloc_leaf_bytes: load_var(
                    "SECTORDB_ALLOC_LEAF_BYTES",
                    defaults.format.alloc_leaf_bytes,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate thresholds against the creation format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_for(&self.format)
    }

    /// Validate thresholds against a specific (possibly persisted) format.
    pub fn validate_for(&self, format: &Format) -> Result<(), ConfigError> {
        format.validate()?;
        if self.max_leaf_bytes > MAX_NODE_BYTES || self.max_internal_bytes > MAX_NODE_BYTES {
            return Err(ConfigError::Inconsistent(format!(
                "node thresholds must not exceed {MAX_NODE_BYTES} bytes"
            )));
        }
        if self.max_leaf_bytes < 2 * format.max_leaf_entry_size() + 2 {
            return Err(ConfigError::Inconsistent(format!(
                "leaf threshold {} cannot hold two entries of {} bytes",
                self.max_leaf_bytes,
                format.max_leaf_entry_size()
            )));
        }
        if self.max_internal_bytes < 2 * format.max_internal_entry_size() + 1 + 2 * SECTOR_PTR_SIZE
        {
            return Err(ConfigError::Inconsistent(format!(
                "internal threshold {} cannot hold two separators of {} bytes",
                self.max_internal_bytes,
                format.max_internal_entry_size()
            )));
        }
        if !(3..=MAX_INTERNAL_CHILDREN).contains(&self.max_internal_children) {
            return Err(ConfigError::Inconsistent(format!(
                "internal fan-out {} must be in 3..={MAX_INTERNAL_CHILDREN}",
                self.max_internal_children
            )));
        }
        Ok(())
    }
}

fn load_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        }),
        Err(_) => Ok(default),
    }
}

fn load_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a boolean"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Policy hooks for split and cache decisions.
///
/// Implementations only influence performance: the engine enforces its own
/// hard limits so a node never outgrows an encodable sector.
pub trait Tweaks: Send + Sync + std::fmt::Debug {
    /// Whether a leaf of `encoded_bytes` holding `entries` must split.
    fn should_split_leaf(&self, encoded_bytes: usize, entries: usize) -> bool;

    /// Whether an internal node of `encoded_bytes` with `children` must split.
    fn should_split_internal(&self, encoded_bytes: usize, children: usize) -> bool;

    /// Whether the shared cache should be compacted.
    fn cache_over_capacity(&self, cached_bytes: usize) -> bool;

    /// Size the cache is trimmed down to by a compaction.
    fn cache_target_bytes(&self) -> usize;
}

/// Threshold-based tweaks taken from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DefaultTweaks {
    max_leaf_bytes: usize,
    max_internal_bytes: usize,
    max_internal_children: usize,
    cache_capacity_bytes: usize,
}

impl DefaultTweaks {
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_leaf_bytes: config.max_leaf_bytes,
            max_internal_bytes: config.max_internal_bytes,
            max_internal_children: config.max_internal_children,
            cache_capacity_bytes: config.cache_capacity_bytes,
        }
    }
}

impl Tweaks for DefaultTweaks {
    fn should_split_leaf(&self, encoded_bytes: usize, entries: usize) -> bool {
        entries > 1 && encoded_bytes > self.max_leaf_bytes
    }

    fn should_split_internal(&self, encoded_bytes: usize, children: usize) -> bool {
        children > 1
            && (encoded_bytes > self.max_internal_bytes || children > self.max_internal_children)
    }

    fn cache_over_capacity(&self, cached_bytes: usize) -> bool {
        cached_bytes > self.cache_capacity_bytes
    }

    fn cache_target_bytes(&self) -> usize {
        self.cache_capacity_bytes / 4 * 3
    }
}
