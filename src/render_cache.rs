//! Full-image renders and viewport tiles.
//!
//! A renderer is created immediately and decodes on the rayon pool; callers
//! poll `is_ready` or block in `wait_ready`. Only renders small enough for the
//! admission limit are kept in the cache. Larger ones are decoded fresh each
//! time they are asked for.

use crate::cache::{BoundedCache, CacheStats, CacheValue};
use crate::config::{CacheFlavorConfig, CachesConfig};
use crate::decode::Decoder;
use crate::error::{ConfigError, DecodeError};
use crate::events::{CacheFlavor, Event, EventSink};
use crate::filestore::FileStore;
use crate::media::{MediaId, MediaRecord, Resolution};
use crate::raster::{ClipRect, Raster};
use crate::services::Services;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum RenderState {
    Decoding,
    Ready(Arc<Raster>),
    Failed(String),
}

/// One full-resolution decode, possibly still in flight.
#[derive(Debug)]
pub struct ImageRenderer {
    media: MediaRecord,
    footprint: usize,
    state: Mutex<RenderState>,
    finished: Condvar,
}

impl ImageRenderer {
    fn new(media: &MediaRecord) -> Arc<Self> {
        Arc::new(Self {
            media: media.clone(),
            footprint: media.full_memory_estimate().unwrap_or(0),
            state: Mutex::new(RenderState::Decoding),
            finished: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn media(&self) -> &MediaRecord {
        &self.media
    }

    /// The decode has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.lock(), RenderState::Decoding)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.lock(), RenderState::Failed(_))
    }

    pub fn raster(&self) -> Option<Arc<Raster>> {
        match &*self.lock() {
            RenderState::Ready(raster) => Some(Arc::clone(raster)),
            _ => None,
        }
    }

    /// Block until the decode finishes or `timeout` passes.
    pub fn wait_ready(&self, timeout: Duration) -> Option<Arc<Raster>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            match &*state {
                RenderState::Ready(raster) => return Some(Arc::clone(raster)),
                RenderState::Failed(_) => return None,
                RenderState::Decoding => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = match self.finished.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn finish(&self, result: Result<Raster, DecodeError>) {
        let next = match result {
            Ok(raster) => RenderState::Ready(Arc::new(raster)),
            Err(e) => {
                tracing::warn!(media = %self.media.id, error = %e, "render failed");
                RenderState::Failed(e.to_string())
            }
        };
        *self.lock() = next;
        self.finished.notify_all();
    }
}

impl CacheValue for ImageRenderer {
    fn estimated_memory_footprint(&self) -> usize {
        self.footprint
    }
}

/// Why `prefetch` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Started decoding this one
    Started(MediaId),
    /// Everything in the list is already cached
    AllCached,
    /// A cached renderer ahead in the list is still decoding
    StillDecoding(MediaId),
    UnknownResolution(MediaId),
    TooLarge(MediaId),
    /// The list walk hit the cumulative prefetch budget
    RunBudgetExhausted,
    /// The cache could not make room without painful eviction
    NoRoom(MediaId),
}

/// Spawns decodes on a dedicated rayon pool.
struct DecodePool {
    pool: rayon::ThreadPool,
    files: Arc<dyn FileStore>,
    decoder: Arc<dyn Decoder>,
}

impl DecodePool {
    fn new(threads: usize, files: Arc<dyn FileStore>, decoder: Arc<dyn Decoder>) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mediakeep-decode-{i}"))
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("decode_threads: {e}")))?;
        Ok(Self {
            pool,
            files,
            decoder,
        })
    }

    fn spawn(&self, renderer: Arc<ImageRenderer>) {
        let files = Arc::clone(&self.files);
        let decoder = Arc::clone(&self.decoder);
        self.pool.spawn(move || {
            let media = renderer.media();
            let path = files.file_path(media);
            renderer.finish(decoder.decode(&path, media.mime));
        });
    }
}

pub struct RenderCache {
    cache: BoundedCache<MediaId, Arc<ImageRenderer>>,
    admission_limit: usize,
    prefetch_item_budget: usize,
    prefetch_run_budget: usize,
    decodes: DecodePool,
    events: EventSink,
}

impl RenderCache {
    pub fn new(config: &CachesConfig, services: &Services) -> Result<Self, ConfigError> {
        Ok(Self {
            cache: BoundedCache::from_config(&config.renders),
            admission_limit: config.renders.admission_limit(),
            prefetch_item_budget: config.prefetch_item_budget,
            prefetch_run_budget: config.prefetch_run_budget,
            decodes: DecodePool::new(
                config.decode_threads,
                Arc::clone(&services.files),
                Arc::clone(&services.decoder),
            )?,
            events: services.events.clone(),
        })
    }

    fn admits(&self, footprint: usize) -> bool {
        footprint > 0 && footprint < self.admission_limit
    }

    /// Cached renderer for `media`, or a freshly started one.
    pub fn get_renderer(&self, media: &MediaRecord) -> Arc<ImageRenderer> {
        if let Some(renderer) = self.cache.get(&media.id) {
            return renderer;
        }

        let renderer = ImageRenderer::new(media);
        self.decodes.spawn(Arc::clone(&renderer));

        if self.admits(renderer.footprint) {
            self.cache.add(media.id, Arc::clone(&renderer));
        } else {
            tracing::debug!(media = %media.id, footprint = renderer.footprint, "render too large to cache");
        }
        renderer
    }

    /// Warm the cache for upcoming media. Starts at most one decode per call.
    pub fn prefetch(&self, upcoming: &[MediaRecord]) -> PrefetchOutcome {
        let mut walked = 0usize;

        for media in upcoming {
            if let Some(renderer) = self.cache.get(&media.id) {
                if !renderer.is_ready() {
                    return PrefetchOutcome::StillDecoding(media.id);
                }
                walked += renderer.footprint;
                continue;
            }

            let Some(footprint) = media.full_memory_estimate() else {
                return PrefetchOutcome::UnknownResolution(media.id);
            };
            if footprint > self.prefetch_item_budget || !self.admits(footprint) {
                return PrefetchOutcome::TooLarge(media.id);
            }
            if walked + footprint > self.prefetch_run_budget {
                return PrefetchOutcome::RunBudgetExhausted;
            }
            if !self.cache.reserve_space(footprint) {
                return PrefetchOutcome::NoRoom(media.id);
            }

            let renderer = ImageRenderer::new(media);
            self.decodes.spawn(Arc::clone(&renderer));
            self.cache.add(media.id, renderer);
            tracing::trace!(media = %media.id, footprint, "prefetch started");
            return PrefetchOutcome::Started(media.id);
        }
        PrefetchOutcome::AllCached
    }

    pub fn has(&self, id: MediaId) -> bool {
        self.cache.has(&id)
    }

    pub fn invalidate(&self, id: MediaId) {
        self.cache.delete(&id);
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.events.emit(Event::CacheCleared {
            flavor: CacheFlavor::Renders,
        });
    }

    pub fn maintain(&self) {
        self.cache.maintain();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Key of one cached tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub media: MediaId,
    pub clip: ClipRect,
    pub target: Resolution,
}

/// Scaled crops of ready renders, for zoomed viewports.
pub struct TileCache {
    cache: BoundedCache<TileKey, Arc<Raster>>,
    admission_limit: usize,
    events: EventSink,
}

impl TileCache {
    pub fn new(config: &CacheFlavorConfig, events: EventSink) -> Self {
        Self {
            cache: BoundedCache::from_config(config),
            admission_limit: config.admission_limit(),
            events,
        }
    }

    /// Tile of `clip` scaled to `target`, or `None` while the render is not ready.
    pub fn get_tile(
        &self,
        renderer: &ImageRenderer,
        clip: ClipRect,
        target: Resolution,
    ) -> Option<Arc<Raster>> {
        let key = TileKey {
            media: renderer.media().id,
            clip,
            target,
        };
        if let Some(tile) = self.cache.get(&key) {
            return Some(tile);
        }

        let source = renderer.raster()?;
        let tile = Arc::new(source.cropped(clip).resized(target));
        if tile.memory_size() < self.admission_limit {
            self.cache.add(key, Arc::clone(&tile));
        }
        Some(tile)
    }

    /// Drop every tile of `id`. Returns how many went.
    pub fn invalidate(&self, id: MediaId) -> usize {
        self.cache
            .all_keys()
            .into_iter()
            .filter(|key| key.media == id)
            .filter(|key| self.cache.delete(key).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.events.emit(Event::CacheCleared {
            flavor: CacheFlavor::Tiles,
        });
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ImageDecoder;
    use crate::filestore::FolderFileStore;
    use crate::media::Mime;
    use crate::persistence::MemoryPersistence;

    const MB: usize = 1024 * 1024;

    fn services(root: &std::path::Path) -> Services {
        Services::new(
            Arc::new(MemoryPersistence::new()),
            Arc::new(FolderFileStore::new(root)),
            Arc::new(ImageDecoder::new()),
        )
    }

    /// Media whose RGBA decode is `mb` megabytes. The file itself does not exist.
    fn sized(id: u64, mb: usize) -> MediaRecord {
        MediaRecord::new(MediaId(id), format!("{id:04x}"), Mime::Png).with_resolution(1024, mb as u32 * 256)
    }

    fn caches_config() -> CachesConfig {
        CachesConfig {
            renders: CacheFlavorConfig::new(100 * MB, Duration::from_secs(600)).with_admission_percent(25),
            prefetch_item_budget: 20 * MB,
            prefetch_run_budget: 15 * MB,
            decode_threads: 2,
            ..CachesConfig::default()
        }
    }

    #[test]
    fn test_prefetch_starts_one_decode() {
        let dir = tempfile::tempdir().unwrap();
        let renders = RenderCache::new(&caches_config(), &services(dir.path())).unwrap();
        let upcoming = [sized(1, 10), sized(2, 10), sized(3, 10)];

        assert_eq!(renders.prefetch(&upcoming), PrefetchOutcome::Started(MediaId(1)));
        assert_eq!(renders.stats().entries, 1);
        assert!(renders.has(MediaId(1)));
        assert!(!renders.has(MediaId(2)));
        assert!(!renders.has(MediaId(3)));
    }

    #[test]
    fn test_prefetch_waits_on_unfinished_decode() {
        let dir = tempfile::tempdir().unwrap();
        let renders = RenderCache::new(&caches_config(), &services(dir.path())).unwrap();

        // Never handed to the pool, so it stays decoding.
        let pending = ImageRenderer::new(&sized(1, 10));
        renders.cache.add(MediaId(1), pending);

        assert_eq!(
            renders.prefetch(&[sized(1, 10), sized(2, 10)]),
            PrefetchOutcome::StillDecoding(MediaId(1))
        );
        assert!(!renders.has(MediaId(2)));
    }

    #[test]
    fn test_prefetch_respects_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let renders = RenderCache::new(&caches_config(), &services(dir.path())).unwrap();

        let unknown = MediaRecord::new(MediaId(5), "05", Mime::Png);
        assert_eq!(
            renders.prefetch(&[unknown]),
            PrefetchOutcome::UnknownResolution(MediaId(5))
        );
        assert_eq!(
            renders.prefetch(&[sized(6, 30)]),
            PrefetchOutcome::TooLarge(MediaId(6))
        );

        // First item ready (failed decode of a missing file) walks 10MB of budget.
        assert_eq!(renders.prefetch(&[sized(1, 10)]), PrefetchOutcome::Started(MediaId(1)));
        let first = renders.get_renderer(&sized(1, 10));
        assert!(first.wait_ready(Duration::from_secs(5)).is_none());
        assert!(first.is_failed());

        assert_eq!(
            renders.prefetch(&[sized(1, 10), sized(2, 10)]),
            PrefetchOutcome::RunBudgetExhausted
        );
        assert_eq!(renders.prefetch(&[sized(1, 10)]), PrefetchOutcome::AllCached);
    }

    #[test]
    fn test_large_renders_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let renders = RenderCache::new(&caches_config(), &services(dir.path())).unwrap();

        let big = sized(9, 40);
        let a = renders.get_renderer(&big);
        let b = renders.get_renderer(&big);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!renders.has(MediaId(9)));

        let small = sized(10, 1);
        let c = renders.get_renderer(&small);
        let d = renders.get_renderer(&small);
        assert!(Arc::ptr_eq(&c, &d));
    }

    #[test]
    fn test_renderer_decodes_real_file_and_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.png");
        image::RgbaImage::from_fn(40, 20, |x, _| image::Rgba([x as u8 * 5, 0, 0, 255]))
            .save(&src)
            .unwrap();

        let store = FolderFileStore::new(dir.path().join("lib"));
        let media = store.import(MediaId(1), &src).unwrap().with_resolution(40, 20);
        let services = services(&dir.path().join("lib"));

        let renders = RenderCache::new(&caches_config(), &services).unwrap();
        let renderer = renders.get_renderer(&media);
        let raster = renderer.wait_ready(Duration::from_secs(5)).unwrap();
        assert_eq!(raster.resolution(), Resolution::new(40, 20));
        assert!(renderer.is_ready());

        let (sink, events) = EventSink::channel();
        let tiles = TileCache::new(
            &CacheFlavorConfig::new(MB, Duration::from_secs(60)).with_admission_percent(50),
            sink,
        );
        let clip = ClipRect::new(10, 5, 20, 10);
        let tile = tiles.get_tile(&renderer, clip, Resolution::new(10, 5)).unwrap();
        assert_eq!(tile.resolution(), Resolution::new(10, 5));

        tiles.get_tile(&renderer, ClipRect::new(0, 0, 8, 8), Resolution::new(8, 8));
        assert_eq!(tiles.stats().entries, 2);
        assert_eq!(tiles.invalidate(MediaId(1)), 2);
        assert_eq!(tiles.invalidate(MediaId(1)), 0);

        tiles.clear();
        assert_eq!(
            events.try_recv().ok(),
            Some(Event::CacheCleared {
                flavor: CacheFlavor::Tiles
            })
        );
    }

    #[test]
    fn test_tile_waits_for_render() {
        let renderer = ImageRenderer::new(&sized(1, 1));
        let tiles = TileCache::new(
            &CacheFlavorConfig::new(MB, Duration::from_secs(60)),
            EventSink::disconnected(),
        );
        assert!(tiles
            .get_tile(&renderer, ClipRect::new(0, 0, 1, 1), Resolution::new(1, 1))
            .is_none());

        renderer.finish(Ok(Raster::solid(Resolution::new(4, 4), [1, 1, 1, 255])));
        assert!(tiles
            .get_tile(&renderer, ClipRect::new(0, 0, 2, 2), Resolution::new(1, 1))
            .is_some());
    }
}
