//! Domain configuration
//!
//! A [`DomainConfig`] describes one simulated memory domain: the size of the
//! local pool, the low watermark that drives background swap-out, and the
//! knobs of the victim selector and swapper. Configuration is layered:
//! built-in defaults, then an optional file (TOML/YAML/JSON, chosen by
//! extension), then `TIERMEM_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::page::PAGE_SIZE;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TIERMEM";

/// Default local memory size (4GB)
pub const DEFAULT_LOCAL_MEMORY_SIZE: u64 = 1 << 32;
/// Default free pool watermark (pages)
pub const DEFAULT_WATERMARK: u32 = 10_000;
/// Default page index hash bits (256 buckets)
pub const DEFAULT_HASH_BITS: u8 = 8;
/// Largest supported index (1M buckets)
pub const MAX_HASH_BITS: u8 = 20;

const MB: u64 = 1 << 20;

/// Configuration of one simulated memory domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Optional human-readable name used in logs
    pub name: Option<String>,
    /// Local pool capacity in pages
    pub capacity_pages: u32,
    /// Low watermark (absolute page count)
    pub watermark: u32,
    /// Page index bucket count is `1 << hash_bits`
    pub hash_bits: u8,
    /// Fixed seed for the victim selector (random when unset)
    pub selector_seed: Option<u64>,
    /// Upper bound on victims selected per cycle (unbounded when unset)
    pub max_batch_pages: Option<u32>,
    /// Spurious victims tolerated per cycle before giving up on selection
    pub max_selection_attempts: u32,
    /// Initial backoff when a cycle makes no progress (microseconds)
    pub backoff_min_us: u64,
    /// Backoff ceiling (microseconds)
    pub backoff_max_us: u64,
    /// Simulated remote tier latency per page (microseconds)
    pub network_delay_us: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: None,
            capacity_pages: (DEFAULT_LOCAL_MEMORY_SIZE / PAGE_SIZE as u64) as u32,
            watermark: DEFAULT_WATERMARK,
            hash_bits: DEFAULT_HASH_BITS,
            selector_seed: None,
            max_batch_pages: None,
            max_selection_attempts: 64,
            backoff_min_us: 100,
            backoff_max_us: 50_000,
            network_delay_us: 0,
        }
    }
}

impl DomainConfig {
    pub fn new(capacity_pages: u32, watermark: u32) -> Self {
        Self {
            capacity_pages,
            watermark,
            ..Self::default()
        }
    }

    /// Build from a local memory size in MB.
    pub fn from_local_mem_mb(local_mem_mb: u64, watermark: u32) -> ConfigResult<Self> {
        let pages = local_mem_mb
            .checked_mul(MB)
            .map(|bytes| bytes / PAGE_SIZE as u64)
            .ok_or_else(|| ConfigError::Invalid(format!("local memory size {}MB overflows", local_mem_mb)))?;
        let capacity_pages = u32::try_from(pages)
            .map_err(|_| ConfigError::Invalid(format!("{} pages exceeds the page counter range", pages)))?;
        Ok(Self::new(capacity_pages, watermark))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.selector_seed = Some(seed);
        self
    }

    pub fn with_hash_bits(mut self, bits: u8) -> Self {
        self.hash_bits = bits;
        self
    }

    pub fn with_max_batch(mut self, pages: u32) -> Self {
        self.max_batch_pages = Some(pages);
        self
    }

    pub fn with_max_selection_attempts(mut self, attempts: u32) -> Self {
        self.max_selection_attempts = attempts;
        self
    }

    pub fn with_backoff_us(mut self, min: u64, max: u64) -> Self {
        self.backoff_min_us = min;
        self.backoff_max_us = max;
        self
    }

    pub fn with_network_delay_us(mut self, delay: u64) -> Self {
        self.network_delay_us = delay;
        self
    }

    /// Number of buckets in the page index
    pub fn bucket_count(&self) -> usize {
        1usize << self.hash_bits
    }

    /// Local pool capacity in bytes
    pub fn local_memory_bytes(&self) -> u64 {
        self.capacity_pages as u64 * PAGE_SIZE as u64
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity_pages == 0 {
            return Err(ConfigError::Invalid("capacity_pages must be non-zero".to_string()));
        }
        if self.watermark > self.capacity_pages {
            return Err(ConfigError::Invalid(format!(
                "watermark {} exceeds capacity {}",
                self.watermark, self.capacity_pages
            )));
        }
        if self.hash_bits == 0 || self.hash_bits > MAX_HASH_BITS {
            return Err(ConfigError::Invalid(format!(
                "hash_bits must be in 1..={}, got {}",
                MAX_HASH_BITS, self.hash_bits
            )));
        }
        if self.max_selection_attempts == 0 {
            return Err(ConfigError::Invalid("max_selection_attempts must be non-zero".to_string()));
        }
        if self.max_batch_pages == Some(0) {
            return Err(ConfigError::Invalid("max_batch_pages must be non-zero when set".to_string()));
        }
        if self.backoff_min_us == 0 || self.backoff_min_us > self.backoff_max_us {
            return Err(ConfigError::Invalid(format!(
                "backoff range {}..{}us is empty",
                self.backoff_min_us, self.backoff_max_us
            )));
        }
        Ok(())
    }

    /// Load configuration: defaults, then `path` (if given), then `TIERMEM_*`
    /// environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let loaded: DomainConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;

        log::debug!(
            "[Config] Loaded: capacity={} pages, watermark={}, buckets={}",
            loaded.capacity_pages,
            loaded.watermark,
            loaded.bucket_count()
        );
        Ok(loaded)
    }
}
