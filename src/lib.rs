//! Mediakeep - thumbnails, render caches and background file maintenance for
//! large local media libraries.
//!
//! Architecture overview:
//! - Bounded, size-aware caches with LRU sweeps and idle timeouts
//! - A thumbnail waterfall that renders pages cheapest-first in time-boxed ticks
//! - A render cache that prefetches full-size decodes on a rayon pool
//! - A throttled maintenance engine that drains persisted per-file jobs

pub mod bandwidth;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod filestore;
pub mod job_handlers;
pub mod jobs;
pub mod maintenance;
pub mod media;
pub mod persistence;
pub mod raster;
pub mod render_cache;
pub mod report;
pub mod services;
pub mod state;
pub mod thumbnails;

pub use cache::{BoundedCache, CacheStats, CacheValue};
pub use config::Config;
pub use decode::{Decoder, ImageDecoder};
pub use error::{ConfigError, DecodeError, JobError, MaintenanceError, StoreError};
pub use events::{Event, EventSink, PageKey};
pub use filestore::{FileStore, FolderFileStore};
pub use jobs::JobKind;
pub use maintenance::{MaintenanceEngine, MaintenanceHandle};
pub use media::{MediaId, MediaRecord, Mime, Resolution};
pub use persistence::{MemoryPersistence, Persistence};
pub use raster::Raster;
pub use render_cache::{RenderCache, TileCache};
pub use services::Services;
pub use thumbnails::ThumbnailLoader;
