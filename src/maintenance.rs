//! Maintenance engine - throttled background execution of the job backlog.
//!
//! One worker thread drains the persisted backlog a batch at a time while the
//! activity flags and bandwidth rules allow it. The same per-file execution
//! path serves `force_maintenance`, `run_job_immediately` and the loader's
//! forced thumbnail regeneration.
//!
//! Any storage-class failure sets a latch that halts all execution until
//! `reset_serious_error` is called.

use crate::bandwidth::{unix_now, BandwidthTracker};
use crate::config::{Config, LoaderConfig, MaintenanceConfig};
use crate::error::{JobError, MaintenanceError, StoreError};
use crate::events::Event;
use crate::job_handlers::{self, JobContext};
use crate::jobs::{plan_file, JobKind};
use crate::media::{MediaId, MediaRecord};
use crate::persistence::{BacklogCount, IntegrityVerdict, JobCompletion, JobOutcome, JobRecord};
use crate::report::ReportCategory;
use crate::services::Services;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// What the thumbnail loader needs from maintenance.
pub trait MaintenanceHandle: Send + Sync {
    /// Rebuild one thumbnail now, on the caller's thread.
    fn force_regenerate_thumbnail(&self, media: &MediaRecord) -> Result<(), MaintenanceError>;

    /// Persist `kind` for `ids` as due now.
    fn schedule(&self, ids: &[MediaId], kind: JobKind) -> Result<(), MaintenanceError>;
}

/// Single-flight guard per file.
#[derive(Debug, Default)]
struct FileLocks {
    held: Mutex<HashSet<MediaId>>,
    released: Condvar,
}

impl FileLocks {
    fn acquire(&self, id: MediaId) -> FileLockGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        while held.contains(&id) {
            held = self.released.wait(held).unwrap_or_else(|p| p.into_inner());
        }
        held.insert(id);
        FileLockGuard { locks: self, id }
    }
}

struct FileLockGuard<'a> {
    locks: &'a FileLocks,
    id: MediaId,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.id);
        self.locks.released.notify_all();
    }
}

/// Completions waiting to be persisted.
struct CompletionBuffer {
    pending: Vec<JobCompletion>,
    last_flush: Instant,
    interval: Duration,
    max: usize,
}

impl CompletionBuffer {
    fn new(config: &MaintenanceConfig) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            interval: config.flush_interval,
            max: config.flush_count.max(1),
        }
    }

    fn is_due(&self) -> bool {
        self.pending.len() >= self.max
            || (!self.pending.is_empty() && self.last_flush.elapsed() >= self.interval)
    }
}

enum PassMode {
    /// Throttled by admission, paced between files
    Background,
    /// Drain with progress events
    Forced {
        filter: Option<JobKind>,
        done: usize,
        total: usize,
    },
    Immediate,
}

pub struct MaintenanceEngine {
    config: MaintenanceConfig,
    loader: LoaderConfig,
    services: Services,
    bandwidth: Mutex<BandwidthTracker>,
    locks: FileLocks,
    halted: AtomicBool,
    stopping: AtomicBool,
    /// Bumped whenever the backlog is edited; a running pass yields on change.
    generation: AtomicU64,
    cooldown_until: Mutex<Option<Instant>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MaintenanceEngine {
    pub fn new(config: &Config, services: Services) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Arc::new(Self {
            config: config.maintenance.clone(),
            loader: config.loader.clone(),
            services,
            bandwidth: Mutex::new(BandwidthTracker::new()),
            locks: FileLocks::default(),
            halted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cooldown_until: Mutex::new(None),
            wake_tx,
            wake_rx,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the background loop. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *worker = Some(thread::spawn(move || engine.main_loop()));
    }

    /// Stop the background loop and wait for it.
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
                tracing::error!("maintenance worker panicked");
            }
        }
    }

    /// Nudge the background loop out of its wait.
    pub fn wake(&self) {
        // Full means a wake is already pending.
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear the serious-error latch.
    pub fn reset_serious_error(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            tracing::info!("maintenance serious-error latch reset");
        }
        self.wake();
    }

    pub fn schedule_jobs(
        &self,
        ids: &[MediaId],
        kind: JobKind,
        delay: Duration,
    ) -> Result<(), MaintenanceError> {
        if ids.is_empty() {
            return Ok(());
        }
        let not_before = unix_now() as i64 + delay.as_secs() as i64;
        let records: Vec<JobRecord> = ids
            .iter()
            .map(|&media| JobRecord {
                media,
                kind,
                not_before,
            })
            .collect();

        self.services
            .persistence
            .append_jobs(&records)
            .map_err(|e| self.store_failure(e))?;
        tracing::debug!(?kind, count = ids.len(), "scheduled maintenance jobs");

        self.services.events.emit(Event::MaintenanceBacklogChanged);
        self.backlog_edited();
        Ok(())
    }

    pub fn cancel_kind(&self, kind: JobKind) -> Result<usize, MaintenanceError> {
        let cancelled = self
            .services
            .persistence
            .cancel_kind(kind)
            .map_err(|e| self.store_failure(e))?;
        tracing::info!(?kind, cancelled, "cancelled maintenance jobs");

        self.services.events.emit(Event::MaintenanceBacklogChanged);
        self.backlog_edited();
        Ok(cancelled)
    }

    pub fn backlog(&self) -> Result<BTreeMap<JobKind, BacklogCount>, MaintenanceError> {
        Ok(self.services.persistence.backlog_counts(unix_now() as i64)?)
    }

    /// Drain the whole backlog (or one kind of it) synchronously, ignoring
    /// due times, throttling and activity flags.
    pub fn force_maintenance(&self, filter: Option<JobKind>) -> Result<usize, MaintenanceError> {
        self.ensure_running()?;

        let filter_kinds = filter.map(|kind| [kind]);
        let filter_slice = filter_kinds.as_ref().map(|kinds| &kinds[..]);

        let total: usize = self
            .services
            .persistence
            .backlog_counts(i64::MAX)
            .map_err(|e| self.store_failure(e))?
            .iter()
            .filter(|(kind, _)| filter.map_or(true, |f| f == **kind))
            .map(|(_, count)| count.total())
            .sum();

        tracing::info!(?filter, total, "forced maintenance started");
        let mut mode = PassMode::Forced {
            filter,
            done: 0,
            total,
        };

        let mut jobs_done = 0;
        loop {
            let batch = self
                .services
                .persistence
                .fetch_due_batch(filter_slice, self.config.batch_size.max(1), i64::MAX)
                .map_err(|e| self.store_failure(e))?;
            if batch.is_empty() {
                break;
            }
            jobs_done += self.process_batch(batch, &mut mode)?;
        }

        tracing::info!(jobs_done, "forced maintenance finished");
        self.services
            .events
            .emit(Event::MaintenancePassFinished { jobs_done });
        self.services.events.emit(Event::MaintenanceBacklogChanged);
        Ok(jobs_done)
    }

    /// Run `kind` for each of `ids` right now.
    pub fn run_job_immediately(&self, ids: &[MediaId], kind: JobKind) -> Result<usize, MaintenanceError> {
        self.ensure_running()?;

        let batch = ids.iter().map(|&id| (id, vec![kind])).collect();
        let done = self.process_batch(batch, &mut PassMode::Immediate)?;

        self.services.events.emit(Event::MaintenanceBacklogChanged);
        Ok(done)
    }

    fn ensure_running(&self) -> Result<(), MaintenanceError> {
        if self.is_halted() {
            return Err(MaintenanceError::Halted);
        }
        Ok(())
    }

    fn backlog_edited(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wake();
    }

    fn should_stop(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.services.state.is_shutdown()
    }

    fn wait_for_wake(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }

    fn bandwidth(&self) -> MutexGuard<'_, BandwidthTracker> {
        self.bandwidth.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether background work may start right now.
    fn admits_work(&self) -> bool {
        if self.is_halted() || self.services.state.is_busy() {
            return false;
        }
        let (enabled, rules) = if self.services.state.is_idle() {
            (self.config.run_when_idle, &self.config.idle_rules)
        } else {
            (self.config.run_when_active, &self.config.active_rules)
        };
        enabled && rules.can_start(&self.bandwidth(), unix_now())
    }

    fn in_cooldown(&self) -> bool {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|p| p.into_inner());
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }

    /// Set the latch and report. Returns the error to propagate.
    fn latch(&self, detail: impl Display) -> MaintenanceError {
        self.halted.store(true, Ordering::SeqCst);
        let message = format!("maintenance halted: {detail}");
        self.services
            .reporter
            .report(ReportCategory::SystemicIo, &message);
        MaintenanceError::SystemicIo(message)
    }

    fn store_failure(&self, error: StoreError) -> MaintenanceError {
        self.latch(format_args!("persistence failure: {error}"))
    }

    fn job_context(&self) -> JobContext<'_> {
        JobContext {
            files: self.services.files.as_ref(),
            decoder: self.services.decoder.as_ref(),
            loader: &self.loader,
        }
    }

    fn main_loop(&self) {
        tracing::debug!("maintenance loop started");
        loop {
            if self.should_stop() {
                break;
            }
            if self.in_cooldown() || !self.admits_work() {
                self.wait_for_wake(self.config.idle_wait);
                continue;
            }

            let batch = match self.services.persistence.fetch_due_batch(
                None,
                self.config.batch_size.max(1),
                unix_now() as i64,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    self.store_failure(e);
                    continue;
                }
            };
            if batch.is_empty() {
                self.wait_for_wake(self.config.idle_wait);
                continue;
            }

            match self.process_batch(batch, &mut PassMode::Background) {
                Ok(jobs_done) => {
                    if jobs_done > 0 {
                        self.services
                            .events
                            .emit(Event::MaintenancePassFinished { jobs_done });
                    }
                }
                Err(MaintenanceError::IntegrityMiss(_)) => {
                    let deadline = Instant::now() + self.config.error_cooldown;
                    *self.cooldown_until.lock().unwrap_or_else(|p| p.into_inner()) = Some(deadline);
                }
                Err(MaintenanceError::Shutdown) => break,
                Err(e) => tracing::debug!(error = %e, "maintenance pass ended early"),
            }
        }
        tracing::debug!("maintenance loop stopped");
    }

    fn flush(&self, buffer: &mut CompletionBuffer) -> Result<(), MaintenanceError> {
        buffer.last_flush = Instant::now();
        if buffer.pending.is_empty() {
            return Ok(());
        }
        let completions = std::mem::take(&mut buffer.pending);
        self.services
            .persistence
            .complete_jobs(&completions)
            .map_err(|e| self.store_failure(e))?;
        tracing::trace!(count = completions.len(), "persisted job completions");
        Ok(())
    }

    fn process_batch(
        &self,
        batch: Vec<(MediaId, Vec<JobKind>)>,
        mode: &mut PassMode,
    ) -> Result<usize, MaintenanceError> {
        let ids: Vec<MediaId> = batch.iter().map(|(id, _)| *id).collect();
        let records: HashMap<MediaId, MediaRecord> = self
            .services
            .persistence
            .fetch_media(&ids)
            .map_err(|e| self.store_failure(e))?
            .into_iter()
            .map(|media| (media.id, media))
            .collect();

        let missing: Vec<MediaId> = ids
            .iter()
            .filter(|id| !records.contains_key(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            self.services.reporter.report(
                ReportCategory::DataIntegrity,
                &format!(
                    "{} file(s) have maintenance jobs but no metadata: {missing:?}",
                    missing.len()
                ),
            );
            return Err(MaintenanceError::IntegrityMiss(missing));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let mut buffer = CompletionBuffer::new(&self.config);
        let mut executed = 0;

        for (id, kinds) in batch {
            if self.should_stop() {
                self.flush(&mut buffer)?;
                return Err(MaintenanceError::Shutdown);
            }
            // A stale batch may hold cancelled jobs; refetch instead.
            if !matches!(mode, PassMode::Immediate)
                && self.generation.load(Ordering::SeqCst) != generation
            {
                tracing::debug!("backlog edited, restarting pass");
                break;
            }
            if self.is_halted() {
                return Err(MaintenanceError::Halted);
            }
            if matches!(mode, PassMode::Background) && !self.admits_work() {
                break;
            }
            let Some(media) = records.get(&id) else {
                continue;
            };

            let ran = match self.run_file(media, &kinds, &mut buffer) {
                Ok(ran) => ran,
                Err(e) => {
                    // Keep what finished before the failure.
                    if let Err(flush_error) = self.flush(&mut buffer) {
                        tracing::debug!(error = %flush_error, "could not persist completions");
                    }
                    return Err(e);
                }
            };
            executed += ran;

            if buffer.is_due() {
                self.flush(&mut buffer)?;
            }

            match mode {
                PassMode::Background => self.wait_for_wake(self.config.pacing_pause),
                PassMode::Forced {
                    filter,
                    done,
                    total,
                } => {
                    *done += ran;
                    *total = (*total).max(*done);
                    self.services.events.emit(Event::MaintenanceProgress {
                        kind: *filter,
                        done: *done,
                        total: *total,
                    });
                }
                PassMode::Immediate => {}
            }
        }

        self.flush(&mut buffer)?;
        Ok(executed)
    }

    /// Execute one file's due kinds under its lock. Returns jobs executed.
    fn run_file(
        &self,
        media: &MediaRecord,
        kinds: &[JobKind],
        buffer: &mut CompletionBuffer,
    ) -> Result<usize, MaintenanceError> {
        let _guard = self.locks.acquire(media.id);
        let plan = plan_file(kinds);
        let ctx = self.job_context();

        for &kind in &plan.satisfied {
            tracing::trace!(media = %media.id, ?kind, "overruled, clearing");
            buffer.pending.push(JobCompletion::cleared(media.id, kind));
        }

        let mut executed = 0;
        let mut remaining = plan.run.into_iter();
        while let Some(kind) = remaining.next() {
            let outcome = match job_handlers::execute(kind, media, &ctx) {
                Ok(outcome) => outcome,
                Err(e) if e.is_systemic() => {
                    return Err(self.latch(format_args!("{kind:?} on {}: {e}", media.id)));
                }
                Err(e) => {
                    self.report_job_failure(kind, media.id, &e);
                    JobOutcome::Cleared
                }
            };
            executed += 1;
            self.bandwidth().report_work(kind.weight(), media.size);

            let metadata_changed = match &outcome {
                JobOutcome::Metadata(metadata) => {
                    metadata.mime != media.mime || metadata.resolution != media.resolution
                }
                _ => false,
            };
            let unhealthy = matches!(
                &outcome,
                JobOutcome::Integrity { verdict, .. } if *verdict != IntegrityVerdict::Healthy
            );
            buffer.pending.push(JobCompletion {
                media: media.id,
                kind,
                outcome,
            });

            if kind == JobKind::RegenFileMetadata {
                if metadata_changed {
                    tracing::debug!(media = %media.id, "metadata changed, scheduling thumbnail");
                    self.services
                        .persistence
                        .append_jobs(&[JobRecord::due_now(media.id, JobKind::ForceThumbnail)])
                        .map_err(|e| self.store_failure(e))?;
                }
                // The remaining kinds run next pass against the fresh metadata.
                break;
            }
            if unhealthy {
                for kind in remaining.by_ref() {
                    buffer.pending.push(JobCompletion::cleared(media.id, kind));
                }
                break;
            }
        }
        Ok(executed)
    }

    fn report_job_failure(&self, kind: JobKind, media: MediaId, error: &JobError) {
        tracing::warn!(media = %media, ?kind, error = %error, "maintenance job failed");
        self.services.reporter.report(
            ReportCategory::JobFailure(kind),
            &format!("could not {} for {media}: {error}", kind.label()),
        );
    }
}

impl MaintenanceHandle for MaintenanceEngine {
    fn force_regenerate_thumbnail(&self, media: &MediaRecord) -> Result<(), MaintenanceError> {
        self.ensure_running()?;

        let _guard = self.locks.acquire(media.id);
        let resolution = match job_handlers::regenerate_thumbnail(media, &self.job_context()) {
            Ok(resolution) => resolution,
            Err(e) if e.is_systemic() => {
                return Err(self.latch(format_args!("thumbnail for {}: {e}", media.id)));
            }
            Err(e) => {
                return Err(MaintenanceError::JobFailed {
                    media: media.id,
                    kind: JobKind::ForceThumbnail,
                    reason: e.to_string(),
                });
            }
        };
        self.bandwidth()
            .report_work(JobKind::ForceThumbnail.weight(), media.size);

        let completions: Vec<JobCompletion> = [JobKind::ForceThumbnail, JobKind::RefitThumbnail]
            .into_iter()
            .map(|kind| JobCompletion {
                media: media.id,
                kind,
                outcome: JobOutcome::Thumbnail { resolution },
            })
            .collect();
        self.services
            .persistence
            .complete_jobs(&completions)
            .map_err(|e| self.store_failure(e))?;

        self.services
            .events
            .emit(Event::ThumbnailRegenerated { media: media.id });
        Ok(())
    }

    fn schedule(&self, ids: &[MediaId], kind: JobKind) -> Result<(), MaintenanceError> {
        self.schedule_jobs(ids, kind, Duration::ZERO)
    }
}
