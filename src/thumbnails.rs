//! Thumbnail waterfall - fill a page of thumbnails a few at a time.
//!
//! Pages hand their media to `add_waterfall`; a worker thread renders them in
//! small time-boxed ticks, cheapest file types first, and announces each tick's
//! results per page. When the waterfall is empty and nothing more important is
//! running, thumbnails found at the wrong size are regenerated from source one
//! at a time.
//!
//! `get_thumbnail` never fails: every error path ends in a placeholder.

use crate::cache::{BoundedCache, CacheStats};
use crate::config::{Config, LoaderConfig};
use crate::decode::THUMBNAIL_MIME;
use crate::error::DecodeError;
use crate::events::{CacheFlavor, Event, PageKey};
use crate::job_handlers::expected_thumbnail_resolution;
use crate::jobs::JobKind;
use crate::maintenance::MaintenanceHandle;
use crate::media::{MediaId, MediaRecord, MimeClass, Resolution};
use crate::raster::Raster;
use crate::report::ReportCategory;
use crate::services::Services;
use crossbeam_channel::{Receiver, Sender};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone)]
struct WaterfallItem {
    page: PageKey,
    media: MediaRecord,
}

impl WaterfallItem {
    fn order_key(&self) -> (u8, MediaId) {
        (self.media.mime.ease_score(), self.media.id)
    }
}

#[derive(Debug, Default)]
struct Queues {
    /// Sorted so the next item to render is last
    waterfall: Vec<WaterfallItem>,
    members: HashSet<(PageKey, MediaId)>,
    /// Thumbnails found at the wrong size, awaiting regeneration
    delayed: VecDeque<MediaRecord>,
    delayed_ids: HashSet<MediaId>,
}

impl Queues {
    fn sort(&mut self) {
        self.waterfall.sort_by_key(|item| Reverse(item.order_key()));
    }

    fn take_delayed(&mut self, id: MediaId) -> bool {
        if !self.delayed_ids.remove(&id) {
            return false;
        }
        self.delayed.retain(|media| media.id != id);
        true
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Rendered this many waterfall items
    Rendered(usize),
    /// Regenerated one delayed candidate
    Regenerated(MediaId),
    Idle,
}

pub struct ThumbnailLoader {
    config: LoaderConfig,
    services: Services,
    maintenance: Arc<dyn MaintenanceHandle>,
    cache: BoundedCache<MediaId, Arc<Raster>>,
    placeholders: Mutex<HashMap<MimeClass, Arc<Raster>>>,
    queues: Mutex<Queues>,
    /// Missing thumbnails already handed to maintenance
    scheduled: Mutex<HashSet<MediaId>>,
    stopping: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThumbnailLoader {
    pub fn new(
        config: &Config,
        services: Services,
        maintenance: Arc<dyn MaintenanceHandle>,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Arc::new(Self {
            config: config.loader.clone(),
            services,
            maintenance,
            cache: BoundedCache::from_config(&config.caches.thumbnails),
            placeholders: Mutex::new(HashMap::new()),
            queues: Mutex::new(Queues::default()),
            scheduled: Mutex::new(HashSet::new()),
            stopping: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the waterfall thread. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return;
        }
        let loader = Arc::clone(self);
        *worker = Some(thread::spawn(move || loader.worker_loop()));
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("thumbnail worker panicked");
            }
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn scheduled(&self) -> MutexGuard<'_, HashSet<MediaId>> {
        self.scheduled.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a page's media for rendering.
    pub fn add_waterfall(&self, page: PageKey, media: Vec<MediaRecord>) {
        let mut queues = self.queues();
        let mut added = 0;
        for media in media {
            if queues.members.insert((page, media.id)) {
                queues.waterfall.push(WaterfallItem { page, media });
                added += 1;
            }
        }
        queues.sort();
        drop(queues);

        tracing::debug!(page = page.0, added, "waterfall extended");
        self.wake();
    }

    /// Stop rendering `ids` for `page`.
    ///
    /// Any of them waiting for regeneration is handed to maintenance as a
    /// persisted job instead, so the correction is not lost with the page.
    pub fn cancel_waterfall(&self, page: PageKey, ids: &[MediaId]) {
        let mut queues = self.queues();
        let wanted: HashSet<MediaId> = ids.iter().copied().collect();

        queues
            .waterfall
            .retain(|item| !(item.page == page && wanted.contains(&item.media.id)));
        for id in &wanted {
            queues.members.remove(&(page, *id));
        }
        queues.sort();

        let mut demoted: Vec<MediaRecord> = Vec::new();
        for id in ids {
            if queues.delayed_ids.contains(id) {
                if let Some(media) = queues.delayed.iter().find(|m| m.id == *id).cloned() {
                    demoted.push(media);
                }
                queues.take_delayed(*id);
            }
        }
        drop(queues);

        if demoted.is_empty() {
            return;
        }
        let demoted_ids: Vec<MediaId> = demoted.iter().map(|m| m.id).collect();
        if let Err(e) = self
            .maintenance
            .schedule(&demoted_ids, JobKind::ForceThumbnail)
        {
            tracing::warn!(error = %e, "could not persist thumbnail regeneration, keeping it queued");
            let mut queues = self.queues();
            for media in demoted {
                if queues.delayed_ids.insert(media.id) {
                    queues.delayed.push_back(media);
                }
            }
        }
    }

    pub fn waterfall_len(&self) -> usize {
        self.queues().waterfall.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.queues().delayed.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        self.scheduled().clear();
        self.services.events.emit(Event::CacheCleared {
            flavor: CacheFlavor::Thumbnails,
        });
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Thumbnail for `media`, or the best available stand-in.
    pub fn get_thumbnail(&self, media: &MediaRecord) -> Arc<Raster> {
        if media.is_confirmed_absent() || !media.mime.can_have_thumbnail() {
            return self.icon(media.mime.class());
        }
        if let Some(thumbnail) = self.cache.get(&media.id) {
            return thumbnail;
        }

        let path = self.services.files.thumbnail_path(media);
        match self.services.decoder.decode(&path, THUMBNAIL_MIME) {
            Ok(raster) => self.accept(media, raster),
            Err(DecodeError::NotFound(_)) => self.missing(media),
            Err(e) => self.corrupt(media, e),
        }
    }

    fn expected_resolution(&self, media: &MediaRecord) -> Option<Resolution> {
        media
            .resolution
            .map(|source| expected_thumbnail_resolution(self.services.decoder.as_ref(), &self.config, source))
    }

    /// Check size, cache and return a decoded thumbnail.
    fn accept(&self, media: &MediaRecord, raster: Raster) -> Arc<Raster> {
        self.scheduled().remove(&media.id);
        let mut raster = raster;
        if let Some(expected) = self.expected_resolution(media) {
            let actual = raster.resolution();
            // A width/height swap is a rotated source: accepted as is.
            if actual != expected && actual != expected.swapped() {
                tracing::debug!(media = %media.id, %actual, %expected, "thumbnail has wrong size");
                raster = raster.resized(expected);
                if media.locally_stored {
                    self.enqueue_regeneration(media);
                }
            }
        }

        let thumbnail = Arc::new(raster);
        if thumbnail.memory_size() <= self.cache.ceiling() {
            self.cache.add(media.id, Arc::clone(&thumbnail));
        }
        thumbnail
    }

    fn missing(&self, media: &MediaRecord) -> Arc<Raster> {
        if media.locally_stored && self.scheduled().insert(media.id) {
            if self
                .services
                .reporter
                .first_time(ReportCategory::MissingThumbnail)
            {
                tracing::warn!(media = %media.id, "thumbnail missing for a local file, scheduling regeneration");
            } else {
                tracing::debug!(media = %media.id, "thumbnail missing");
            }
            if let Err(e) = self
                .maintenance
                .schedule(&[media.id], JobKind::ForceThumbnail)
            {
                tracing::debug!(media = %media.id, error = %e, "could not schedule thumbnail");
                self.scheduled().remove(&media.id);
            }
        }
        self.fallback(media)
    }

    fn corrupt(&self, media: &MediaRecord, error: DecodeError) -> Arc<Raster> {
        tracing::info!(media = %media.id, error = %error, "thumbnail unreadable, regenerating");

        let retried = self
            .maintenance
            .force_regenerate_thumbnail(media)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                self.services
                    .decoder
                    .decode(&self.services.files.thumbnail_path(media), THUMBNAIL_MIME)
                    .map_err(|e| e.to_string())
            });

        match retried {
            Ok(raster) => self.accept(media, raster),
            Err(reason) => {
                self.services.reporter.report(
                    ReportCategory::PermanentCorruption,
                    &format!("thumbnail for {} could not be repaired: {reason}", media.id),
                );
                self.fallback(media)
            }
        }
    }

    fn enqueue_regeneration(&self, media: &MediaRecord) {
        let mut queues = self.queues();
        if queues.delayed_ids.insert(media.id) {
            queues.delayed.push_back(media.clone());
            drop(queues);
            self.wake();
        }
    }

    /// Blurhash reconstruction when allowed and available, else the class icon.
    fn fallback(&self, media: &MediaRecord) -> Arc<Raster> {
        if self.config.blurhash_fallback {
            if let Some(hash) = &media.blurhash {
                let target = self
                    .expected_resolution(media)
                    .unwrap_or(self.config.thumbnail_box);
                if let Some(raster) = self.services.decoder.blurhash_placeholder(hash, target) {
                    return Arc::new(raster);
                }
            }
        }
        self.icon(media.mime.class())
    }

    fn icon(&self, class: MimeClass) -> Arc<Raster> {
        let mut placeholders = self
            .placeholders
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let size = self.config.thumbnail_box;
        Arc::clone(
            placeholders
                .entry(class)
                .or_insert_with(|| Arc::new(Raster::solid(size, icon_color(class)))),
        )
    }

    /// One waterfall step. Public to the crate so tests can drive it.
    pub(crate) fn tick(&self) -> TickOutcome {
        let batch: Vec<WaterfallItem> = {
            let mut queues = self.queues();
            let keep = queues
                .waterfall
                .len()
                .saturating_sub(self.config.tick_item_cap.max(1));
            let mut batch = queues.waterfall.split_off(keep);
            batch.reverse();
            batch
        };

        if batch.is_empty() {
            return self.regenerate_one();
        }

        let started = Instant::now();
        let mut rendered: BTreeMap<PageKey, Vec<MediaId>> = BTreeMap::new();
        let mut done: Vec<(PageKey, MediaId)> = Vec::new();
        let mut leftover: Vec<WaterfallItem> = Vec::new();

        for item in batch {
            if !done.is_empty() && started.elapsed() >= self.config.tick_budget {
                leftover.push(item);
                continue;
            }
            self.get_thumbnail(&item.media);
            rendered.entry(item.page).or_default().push(item.media.id);
            done.push((item.page, item.media.id));
        }

        {
            let mut queues = self.queues();
            for key in &done {
                queues.members.remove(key);
            }
            // Cancelled while in flight: already out of the member set.
            for item in leftover {
                if queues.members.contains(&(item.page, item.media.id)) {
                    queues.waterfall.push(item);
                }
            }
            queues.sort();
        }

        let count = done.len();
        for (page, media) in rendered {
            self.services
                .events
                .emit(Event::ThumbnailsRendered { page, media });
        }
        tracing::trace!(count, elapsed = ?started.elapsed(), "waterfall tick");
        TickOutcome::Rendered(count)
    }

    fn regenerate_one(&self) -> TickOutcome {
        if self.services.state.is_busy() {
            return TickOutcome::Idle;
        }
        let Some(media) = ({
            let mut queues = self.queues();
            let next = queues.delayed.pop_front();
            if let Some(media) = &next {
                queues.delayed_ids.remove(&media.id);
            }
            next
        }) else {
            return TickOutcome::Idle;
        };

        match self.maintenance.force_regenerate_thumbnail(&media) {
            Ok(()) => {
                self.cache.delete(&media.id);
            }
            Err(e) => {
                tracing::warn!(media = %media.id, error = %e, "delayed thumbnail regeneration failed, persisting");
                if let Err(e) = self
                    .maintenance
                    .schedule(&[media.id], JobKind::ForceThumbnail)
                {
                    tracing::debug!(media = %media.id, error = %e, "could not persist thumbnail job");
                }
            }
        }
        TickOutcome::Regenerated(media.id)
    }

    fn worker_loop(&self) {
        tracing::debug!("thumbnail waterfall started");
        loop {
            if self.stopping.load(Ordering::SeqCst) || self.services.state.is_shutdown() {
                break;
            }
            if self.tick() == TickOutcome::Idle {
                let _ = self.wake_rx.recv_timeout(self.config.idle_wait);
            }
        }
        tracing::debug!("thumbnail waterfall stopped");
    }
}

fn icon_color(class: MimeClass) -> [u8; 4] {
    match class {
        MimeClass::Image => [96, 96, 96, 255],
        MimeClass::Animation => [96, 64, 128, 255],
        MimeClass::Video => [48, 48, 96, 255],
        MimeClass::Document => [160, 160, 150, 255],
        MimeClass::Audio => [64, 112, 64, 255],
        MimeClass::Archive => [128, 96, 48, 255],
        MimeClass::Unknown => [40, 40, 40, 255],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Decoder, FileProbe};
    use crate::error::MaintenanceError;
    use crate::filestore::{FileStore, FolderFileStore};
    use crate::media::Mime;
    use crate::persistence::MemoryPersistence;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone)]
    enum Stored {
        Good(Raster),
        Corrupt,
    }

    /// Decoder over an in-memory table of thumbnail paths.
    #[derive(Default)]
    struct FakeDecoder {
        thumbnails: Mutex<HashMap<PathBuf, Stored>>,
        decodes: AtomicUsize,
    }

    impl FakeDecoder {
        fn put(&self, path: PathBuf, stored: Stored) {
            self.thumbnails.lock().unwrap().insert(path, stored);
        }
    }

    impl Decoder for FakeDecoder {
        fn decode(&self, path: &Path, _mime: Mime) -> Result<Raster, DecodeError> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            match self.thumbnails.lock().unwrap().get(path) {
                Some(Stored::Good(raster)) => Ok(raster.clone()),
                Some(Stored::Corrupt) => Err(DecodeError::Corrupt {
                    path: path.to_path_buf(),
                    reason: "truncated".into(),
                }),
                None => Err(DecodeError::NotFound(path.to_path_buf())),
            }
        }

        fn probe(&self, _path: &Path, _mime: Mime) -> Result<FileProbe, DecodeError> {
            Ok(FileProbe::default())
        }

        fn encode_thumbnail(&self, _raster: &Raster) -> Result<Vec<u8>, DecodeError> {
            Ok(Vec::new())
        }

        fn encode_blurhash(&self, _raster: &Raster) -> Option<String> {
            None
        }

        fn blurhash_placeholder(&self, _blurhash: &str, target: Resolution) -> Option<Raster> {
            Some(Raster::solid(target, [7, 7, 7, 255]))
        }
    }

    /// Records calls; a successful regeneration stores `regenerated` as the thumbnail.
    struct FakeMaintenance {
        decoder: Arc<FakeDecoder>,
        files: FolderFileStore,
        regenerated: Option<Raster>,
        regenerations: AtomicUsize,
        scheduled: Mutex<Vec<(MediaId, JobKind)>>,
        fail_schedule: AtomicBool,
    }

    impl MaintenanceHandle for FakeMaintenance {
        fn force_regenerate_thumbnail(&self, media: &MediaRecord) -> Result<(), MaintenanceError> {
            self.regenerations.fetch_add(1, Ordering::SeqCst);
            match &self.regenerated {
                Some(raster) => {
                    self.decoder
                        .put(self.files.thumbnail_path(media), Stored::Good(raster.clone()));
                    Ok(())
                }
                None => Err(MaintenanceError::JobFailed {
                    media: media.id,
                    kind: JobKind::ForceThumbnail,
                    reason: "source unreadable".into(),
                }),
            }
        }

        fn schedule(&self, ids: &[MediaId], kind: JobKind) -> Result<(), MaintenanceError> {
            if self.fail_schedule.load(Ordering::SeqCst) {
                return Err(MaintenanceError::SystemicIo("backlog unwritable".into()));
            }
            self.scheduled
                .lock()
                .unwrap()
                .extend(ids.iter().map(|id| (*id, kind)));
            Ok(())
        }
    }

    struct Harness {
        loader: Arc<ThumbnailLoader>,
        decoder: Arc<FakeDecoder>,
        maintenance: Arc<FakeMaintenance>,
        files: FolderFileStore,
        events: Receiver<Event>,
    }

    impl Harness {
        fn thumbnail_path(&self, media: &MediaRecord) -> PathBuf {
            self.files.thumbnail_path(media)
        }
    }

    fn harness_with(config: Config, regenerated: Option<Raster>) -> Harness {
        let files = FolderFileStore::new("/library");
        let decoder = Arc::new(FakeDecoder::default());
        let maintenance = Arc::new(FakeMaintenance {
            decoder: Arc::clone(&decoder),
            files: files.clone(),
            regenerated,
            regenerations: AtomicUsize::new(0),
            scheduled: Mutex::new(Vec::new()),
            fail_schedule: AtomicBool::new(false),
        });
        let (sink, events) = crate::events::EventSink::channel();
        let services = Services::new(
            Arc::new(MemoryPersistence::new()),
            Arc::new(files.clone()),
            decoder.clone(),
        )
        .with_events(sink);

        Harness {
            loader: ThumbnailLoader::new(&config, services, maintenance.clone()),
            decoder,
            maintenance,
            files,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default(), None)
    }

    /// 300x200 source; a correct thumbnail is 150x100.
    fn photo(id: u64) -> MediaRecord {
        MediaRecord::new(MediaId(id), format!("{id:064x}"), Mime::Jpeg).with_resolution(300, 200)
    }

    fn good_thumbnail() -> Raster {
        Raster::solid(Resolution::new(150, 100), [200, 10, 10, 255])
    }

    fn rendered_ids(events: &Receiver<Event>) -> Vec<MediaId> {
        events
            .try_iter()
            .filter_map(|event| match event {
                Event::ThumbnailsRendered { media, .. } => Some(media),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_waterfall_renders_easiest_first() {
        let mut config = Config::default();
        config.loader.tick_item_cap = 1;
        let h = harness_with(config, None);

        let media = vec![
            MediaRecord::new(MediaId(1), "01", Mime::Unknown),
            MediaRecord::new(MediaId(3), "03", Mime::Png),
            MediaRecord::new(MediaId(2), "02", Mime::Jpeg),
            MediaRecord::new(MediaId(4), "04", Mime::Webm),
        ];
        h.loader.add_waterfall(PageKey(1), media);

        for _ in 0..4 {
            assert_eq!(h.loader.tick(), TickOutcome::Rendered(1));
        }
        assert_eq!(h.loader.tick(), TickOutcome::Idle);
        assert_eq!(
            rendered_ids(&h.events),
            vec![MediaId(2), MediaId(3), MediaId(4), MediaId(1)]
        );
    }

    #[test]
    fn test_tick_batches_per_page() {
        let h = harness();
        h.loader.add_waterfall(PageKey(1), vec![photo(1), photo(2)]);
        h.loader.add_waterfall(PageKey(2), vec![photo(3)]);
        h.loader.add_waterfall(PageKey(1), vec![photo(1)]);
        assert_eq!(h.loader.waterfall_len(), 3);

        assert_eq!(h.loader.tick(), TickOutcome::Rendered(3));
        let pages: Vec<Event> = h
            .events
            .try_iter()
            .filter(|e| matches!(e, Event::ThumbnailsRendered { .. }))
            .collect();
        assert_eq!(
            pages,
            vec![
                Event::ThumbnailsRendered {
                    page: PageKey(1),
                    media: vec![MediaId(1), MediaId(2)]
                },
                Event::ThumbnailsRendered {
                    page: PageKey(2),
                    media: vec![MediaId(3)]
                },
            ]
        );
    }

    #[test]
    fn test_tick_budget_requeues_leftovers() {
        let mut config = Config::default();
        config.loader.tick_budget = Duration::ZERO;
        let h = harness_with(config, None);
        h.loader
            .add_waterfall(PageKey(1), vec![photo(1), photo(2), photo(3)]);

        assert_eq!(h.loader.tick(), TickOutcome::Rendered(1));
        assert_eq!(h.loader.waterfall_len(), 2);
        assert_eq!(rendered_ids(&h.events), vec![MediaId(1)]);

        // Cancelled leftovers are not put back.
        h.loader.cancel_waterfall(PageKey(1), &[MediaId(3)]);
        assert_eq!(h.loader.tick(), TickOutcome::Rendered(1));
        assert_eq!(h.loader.tick(), TickOutcome::Idle);
        assert_eq!(rendered_ids(&h.events), vec![MediaId(2)]);
    }

    #[test]
    fn test_get_thumbnail_is_idempotent() {
        let h = harness();
        let media = photo(1);
        h.decoder
            .put(h.thumbnail_path(&media), Stored::Good(good_thumbnail()));

        let first = h.loader.get_thumbnail(&media);
        let second = h.loader.get_thumbnail(&media);
        assert_eq!(*first, good_thumbnail());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.decoder.decodes.load(Ordering::SeqCst), 1);
        assert_eq!(h.loader.delayed_len(), 0);
    }

    #[test]
    fn test_corrupt_thumbnail_regenerates_once() {
        let regenerated = Raster::solid(Resolution::new(150, 100), [1, 2, 3, 255]);
        let h = harness_with(Config::default(), Some(regenerated.clone()));
        let media = photo(1);
        h.decoder.put(h.thumbnail_path(&media), Stored::Corrupt);

        let first = h.loader.get_thumbnail(&media);
        assert_eq!(*first, regenerated);
        assert_eq!(h.maintenance.regenerations.load(Ordering::SeqCst), 1);

        let second = h.loader.get_thumbnail(&media);
        assert_eq!(*second, regenerated);
        assert_eq!(h.maintenance.regenerations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrepairable_thumbnail_falls_back() {
        let h = harness();
        let media = photo(1);
        h.decoder.put(h.thumbnail_path(&media), Stored::Corrupt);

        let thumbnail = h.loader.get_thumbnail(&media);
        assert_eq!(thumbnail.resolution(), Resolution::new(150, 125));
        assert_eq!(h.maintenance.regenerations.load(Ordering::SeqCst), 1);
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, Event::ErrorReported { category: ReportCategory::PermanentCorruption, .. })));
    }

    #[test]
    fn test_missing_thumbnail_schedules_and_uses_blurhash() {
        let h = harness();
        let mut media = photo(1);
        media.blurhash = Some("LEHV6nWB2yk8pyo0adR*.7kCMdnj".into());

        let thumbnail = h.loader.get_thumbnail(&media);
        assert_eq!(*thumbnail, Raster::solid(Resolution::new(150, 100), [7, 7, 7, 255]));
        assert_eq!(
            *h.maintenance.scheduled.lock().unwrap(),
            vec![(MediaId(1), JobKind::ForceThumbnail)]
        );

        // A file that is not local is not scheduled.
        let mut remote = photo(2);
        remote.locally_stored = false;
        remote.remotely_listed = true;
        h.loader.get_thumbnail(&remote);
        assert_eq!(h.maintenance.scheduled.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_thumbnail_scheduled_once() {
        let h = harness();
        let media = photo(1);

        h.maintenance.fail_schedule.store(true, Ordering::SeqCst);
        h.loader.get_thumbnail(&media);
        assert!(h.maintenance.scheduled.lock().unwrap().is_empty());

        h.maintenance.fail_schedule.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            h.loader.get_thumbnail(&media);
        }
        assert_eq!(h.maintenance.scheduled.lock().unwrap().len(), 1);

        // Arrived and later lost again: asked for a second time.
        h.decoder
            .put(h.thumbnail_path(&media), Stored::Good(good_thumbnail()));
        h.loader.get_thumbnail(&media);
        h.decoder.thumbnails.lock().unwrap().clear();
        h.loader.clear_cache();
        h.loader.get_thumbnail(&media);
        assert_eq!(h.maintenance.scheduled.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_confirmed_absent_and_iconic_mimes() {
        let h = harness();
        let mut gone = photo(1);
        gone.locally_stored = false;
        let song = MediaRecord::new(MediaId(2), "02", Mime::Mp3);

        let a = h.loader.get_thumbnail(&gone);
        let b = h.loader.get_thumbnail(&gone);
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(*h.loader.get_thumbnail(&song), *a);
        assert_eq!(h.decoder.decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrong_size_is_rescaled_and_queued_once() {
        let h = harness();
        let media = photo(1);
        h.decoder.put(
            h.thumbnail_path(&media),
            Stored::Good(Raster::solid(Resolution::new(90, 60), [0, 0, 0, 255])),
        );

        let thumbnail = h.loader.get_thumbnail(&media);
        assert_eq!(thumbnail.resolution(), Resolution::new(150, 100));
        assert_eq!(h.loader.delayed_len(), 1);

        h.loader.cache.clear();
        h.loader.get_thumbnail(&media);
        assert_eq!(h.loader.delayed_len(), 1);
    }

    #[test]
    fn test_rotated_thumbnail_is_accepted() {
        let h = harness();
        let media = photo(1);
        let rotated = Raster::solid(Resolution::new(100, 150), [0, 0, 0, 255]);
        h.decoder
            .put(h.thumbnail_path(&media), Stored::Good(rotated.clone()));

        assert_eq!(*h.loader.get_thumbnail(&media), rotated);
        assert_eq!(h.loader.delayed_len(), 0);
    }

    #[test]
    fn test_cancel_demotes_delayed_regeneration() {
        let h = harness();
        let media = photo(1);
        h.decoder.put(
            h.thumbnail_path(&media),
            Stored::Good(Raster::solid(Resolution::new(90, 60), [0, 0, 0, 255])),
        );
        h.loader.get_thumbnail(&media);
        assert_eq!(h.loader.delayed_len(), 1);

        h.loader.add_waterfall(PageKey(7), vec![media.clone(), photo(2)]);
        h.loader.cancel_waterfall(PageKey(7), &[MediaId(1)]);

        assert_eq!(h.loader.waterfall_len(), 1);
        assert_eq!(h.loader.delayed_len(), 0);
        assert_eq!(
            *h.maintenance.scheduled.lock().unwrap(),
            vec![(MediaId(1), JobKind::ForceThumbnail)]
        );
    }

    #[test]
    fn test_cancel_keeps_regeneration_when_schedule_fails() {
        let h = harness();
        let media = photo(1);
        h.decoder.put(
            h.thumbnail_path(&media),
            Stored::Good(Raster::solid(Resolution::new(90, 60), [0, 0, 0, 255])),
        );
        h.loader.get_thumbnail(&media);
        h.loader.add_waterfall(PageKey(7), vec![media]);

        h.maintenance.fail_schedule.store(true, Ordering::SeqCst);
        h.loader.cancel_waterfall(PageKey(7), &[MediaId(1)]);

        assert_eq!(h.loader.waterfall_len(), 0);
        assert_eq!(h.loader.delayed_len(), 1);
        assert!(h.maintenance.scheduled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delayed_regeneration_waits_for_quiet() {
        let regenerated = good_thumbnail();
        let h = harness_with(Config::default(), Some(regenerated.clone()));
        let media = photo(1);
        h.decoder.put(
            h.thumbnail_path(&media),
            Stored::Good(Raster::solid(Resolution::new(90, 60), [0, 0, 0, 255])),
        );
        h.loader.get_thumbnail(&media);

        h.loader.services.state.set_busy(true);
        assert_eq!(h.loader.tick(), TickOutcome::Idle);

        h.loader.services.state.set_busy(false);
        assert_eq!(h.loader.tick(), TickOutcome::Regenerated(MediaId(1)));
        assert_eq!(h.loader.delayed_len(), 0);
        assert_eq!(*h.loader.get_thumbnail(&media), regenerated);
    }

    #[test]
    fn test_worker_thread_renders_and_stops() {
        let h = harness();
        h.loader.start();
        h.loader.add_waterfall(PageKey(3), vec![photo(1)]);

        let event = h.events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            Event::ThumbnailsRendered {
                page: PageKey(3),
                media: vec![MediaId(1)]
            }
        );
        h.loader.shutdown();
    }

    #[test]
    fn test_clear_cache_emits_event() {
        let h = harness();
        h.loader.clear_cache();
        assert_eq!(
            h.events.try_recv().ok(),
            Some(Event::CacheCleared {
                flavor: CacheFlavor::Thumbnails
            })
        );
    }
}
