//! Configuration - all tunable parameters in one place.
//!
//! Every behavioral parameter lives here with a `Default`, so the caches, the
//! waterfall and the maintenance engine carry no magic numbers of their own.

use crate::bandwidth::{BandwidthRules, Dimension};
use crate::error::ConfigError;
use crate::media::Resolution;
use std::time::Duration;
use sysinfo::System;

const MB: usize = 1024 * 1024;

/// Master configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub caches: CachesConfig,
    pub loader: LoaderConfig,
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Defaults, with the render cache sized from system memory.
    pub fn detect() -> Self {
        let mut config = Self::default();
        config.caches.renders.ceiling_bytes = MemoryConfig::default().calculate_budget();
        config
    }

    /// `detect()` plus overrides from the environment.
    ///
    /// Environment variables:
    /// - `MEDIAKEEP_THUMBNAIL_CACHE_MB`
    /// - `MEDIAKEEP_RENDER_CACHE_MB`
    /// - `MEDIAKEEP_TILE_CACHE_MB`
    /// - `MEDIAKEEP_BLURHASH_FALLBACK` (`true`/`false`)
    /// - `MEDIAKEEP_MAINTENANCE_WHEN_IDLE` (`true`/`false`)
    /// - `MEDIAKEEP_MAINTENANCE_WHEN_ACTIVE` (`true`/`false`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::detect();

        if let Some(bytes) = env_megabytes("MEDIAKEEP_THUMBNAIL_CACHE_MB")? {
            config.caches.thumbnails.ceiling_bytes = bytes;
        }
        if let Some(bytes) = env_megabytes("MEDIAKEEP_RENDER_CACHE_MB")? {
            config.caches.renders.ceiling_bytes = bytes;
        }
        if let Some(bytes) = env_megabytes("MEDIAKEEP_TILE_CACHE_MB")? {
            config.caches.tiles.ceiling_bytes = bytes;
        }
        if let Some(flag) = env_parse::<bool>("MEDIAKEEP_BLURHASH_FALLBACK")? {
            config.loader.blurhash_fallback = flag;
        }
        if let Some(flag) = env_parse::<bool>("MEDIAKEEP_MAINTENANCE_WHEN_IDLE")? {
            config.maintenance.run_when_idle = flag;
        }
        if let Some(flag) = env_parse::<bool>("MEDIAKEEP_MAINTENANCE_WHEN_ACTIVE")? {
            config.maintenance.run_when_active = flag;
        }

        Ok(config)
    }
}

/// A megabyte count from the environment, in bytes.
fn env_megabytes(key: &str) -> Result<Option<usize>, ConfigError> {
    match env_parse::<usize>(key)? {
        Some(mb) => mb
            .checked_mul(MB)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string())),
        None => Ok(None),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// System-memory derived budget for the render cache.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Percentage of system RAM to use (0.0 - 1.0)
    pub budget_ratio: f64,
    /// Minimum budget in bytes
    pub min_budget: usize,
    /// Maximum budget in bytes
    pub max_budget: usize,
}

impl MemoryConfig {
    /// Calculate the actual memory budget in bytes
    pub fn calculate_budget(&self) -> usize {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_ram = sys.total_memory() as usize;
        let budget = (total_ram as f64 * self.budget_ratio) as usize;

        budget.clamp(self.min_budget, self.max_budget)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_ratio: 0.05,
            min_budget: 100 * MB,
            max_budget: 2048 * MB,
        }
    }
}

/// Settings for one cache flavor.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFlavorConfig {
    /// Byte ceiling
    pub ceiling_bytes: usize,
    /// Entries untouched for this long are dropped on the next sweep
    pub idle_timeout: Duration,
    /// A value is admitted only if it is smaller than this percentage of the ceiling
    pub admission_percent: u8,
    /// Insertions between eviction sweeps
    pub sweep_every: usize,
    /// `reserve_space` refuses when it would have to evict more than this fraction of the ceiling
    pub painful_eviction_fraction: f64,
}

impl CacheFlavorConfig {
    pub fn new(ceiling_bytes: usize, idle_timeout: Duration) -> Self {
        Self {
            ceiling_bytes,
            idle_timeout,
            admission_percent: 25,
            sweep_every: 16,
            painful_eviction_fraction: 0.25,
        }
    }

    pub fn with_admission_percent(mut self, percent: u8) -> Self {
        self.admission_percent = percent.min(100);
        self
    }

    /// Largest value this flavor will admit, in bytes.
    pub fn admission_limit(&self) -> usize {
        self.ceiling_bytes / 100 * self.admission_percent as usize
    }

    /// Most bytes `reserve_space` may evict in one call.
    pub fn painful_eviction_bytes(&self) -> usize {
        (self.ceiling_bytes as f64 * self.painful_eviction_fraction) as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachesConfig {
    pub thumbnails: CacheFlavorConfig,
    pub renders: CacheFlavorConfig,
    pub tiles: CacheFlavorConfig,
    /// Largest single item `prefetch` will start decoding
    pub prefetch_item_budget: usize,
    /// Largest total footprint one `prefetch` call may walk over
    pub prefetch_run_budget: usize,
    /// Threads for one-off decodes (0 = rayon default)
    pub decode_threads: usize,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            thumbnails: CacheFlavorConfig::new(25 * MB, Duration::from_secs(3_600))
                .with_admission_percent(100),
            renders: CacheFlavorConfig::new(200 * MB, Duration::from_secs(600))
                .with_admission_percent(25),
            tiles: CacheFlavorConfig::new(128 * MB, Duration::from_secs(300))
                .with_admission_percent(10),
            prefetch_item_budget: 64 * MB,
            prefetch_run_budget: 128 * MB,
            decode_threads: 0,
        }
    }
}

/// How a thumbnail is fitted into its bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePolicy {
    /// Scale down to fit inside the box, never up
    Fit,
    /// Scale to cover the box, then center-crop to exactly the box
    Fill,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Time budget per waterfall tick
    pub tick_budget: Duration,
    /// Item cap per waterfall tick
    pub tick_item_cap: usize,
    /// Bounded wait when both queues are empty
    pub idle_wait: Duration,
    /// Reconstruct a blurhash placeholder instead of the generic icon
    pub blurhash_fallback: bool,
    pub thumbnail_box: Resolution,
    pub scale_policy: ScalePolicy,
    /// UI scale, 100 = 1:1
    pub dpi_percent: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            tick_budget: Duration::from_millis(40),
            tick_item_cap: 16,
            idle_wait: Duration::from_millis(500),
            blurhash_fallback: true,
            thumbnail_box: Resolution::new(150, 125),
            scale_policy: ScalePolicy::Fit,
            dpi_percent: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    pub run_when_idle: bool,
    pub run_when_active: bool,
    pub idle_rules: BandwidthRules,
    pub active_rules: BandwidthRules,
    /// Files fetched from the backlog per batch
    pub batch_size: usize,
    /// Persist completions at least this often
    pub flush_interval: Duration,
    /// ... or after this many completions
    pub flush_count: usize,
    /// Pause between files in the background loop
    pub pacing_pause: Duration,
    /// Bounded wait while nothing is due or admission is denied
    pub idle_wait: Duration,
    /// Back-off after a pass aborted on a data integrity error
    pub error_cooldown: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            run_when_idle: true,
            run_when_active: false,
            idle_rules: BandwidthRules::new()
                .with_rule(Dimension::Requests, Duration::from_secs(10), 500),
            active_rules: BandwidthRules::new()
                .with_rule(Dimension::Requests, Duration::from_secs(10), 100)
                .with_rule(Dimension::Bytes, Duration::from_secs(60), 256 * MB as u64),
            batch_size: 64,
            flush_interval: Duration::from_secs(10),
            flush_count: 256,
            pacing_pause: Duration::from_millis(10),
            idle_wait: Duration::from_secs(5),
            error_cooldown: Duration::from_secs(300),
        }
    }
}
