//! Persistence boundary for the maintenance backlog and file metadata.
//!
//! The engine never touches a database directly. It reads due work and media
//! snapshots through `Persistence`, and hands back completions in batches.
//! `MemoryPersistence` is the bundled implementation.

use crate::error::StoreError;
use crate::jobs::JobKind;
use crate::media::{MediaId, MediaRecord, Mime, Resolution};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// One pending unit of maintenance work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRecord {
    pub media: MediaId,
    pub kind: JobKind,
    /// Unix seconds before which the job is not due
    pub not_before: i64,
}

impl JobRecord {
    pub fn due_now(media: MediaId, kind: JobKind) -> Self {
        Self {
            media,
            kind,
            not_before: 0,
        }
    }
}

/// Regenerated basic file facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub mime: Mime,
    pub size: u64,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityVerdict {
    Healthy,
    Missing,
    Incorrect,
}

/// What an integrity job did about a bad file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAction {
    Nothing,
    Logged,
    /// The file should be fetched again from a remote source
    Redownload,
    RecordRemoved,
    FileDeleted,
}

/// Result of one executed (or satisfied) job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Done, nothing to record. Also used for failed and overruled jobs.
    Cleared,
    Metadata(FileMetadata),
    Thumbnail { resolution: Resolution },
    ExtraHashes { sha512: String },
    SimilarFilesMembership(bool),
    PerceptualHash(Option<u64>),
    PermissionsFixed(bool),
    ModifiedTime(i64),
    Integrity {
        verdict: IntegrityVerdict,
        action: IntegrityAction,
    },
    HasExif(bool),
    HasHumanReadable(bool),
    HasIccProfile(bool),
    HasTransparency(bool),
    PixelHash(Option<String>),
    Blurhash(Option<String>),
    NeighbourDupesRemoved(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub media: MediaId,
    pub kind: JobKind,
    pub outcome: JobOutcome,
}

impl JobCompletion {
    pub fn cleared(media: MediaId, kind: JobKind) -> Self {
        Self {
            media,
            kind,
            outcome: JobOutcome::Cleared,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogCount {
    pub due: usize,
    pub not_due: usize,
}

impl BacklogCount {
    pub fn total(&self) -> usize {
        self.due + self.not_due
    }
}

pub trait Persistence: Send + Sync {
    /// Up to `limit` files with due jobs, each with its due kinds.
    fn fetch_due_batch(
        &self,
        filter: Option<&[JobKind]>,
        limit: usize,
        now: i64,
    ) -> Result<Vec<(MediaId, Vec<JobKind>)>, StoreError>;

    /// Snapshots for the ids that are known. Unknown ids are simply absent.
    fn fetch_media(&self, ids: &[MediaId]) -> Result<Vec<MediaRecord>, StoreError>;

    /// Add jobs. An existing (media, kind) job keeps the earlier due time.
    ///
    /// Overrule holds across the whole backlog: a job whose kind a pending
    /// kind of the same file overrules is not stored, and a new job removes
    /// the pending kinds it overrules. Either way the surviving job takes the
    /// earlier due time.
    fn append_jobs(&self, jobs: &[JobRecord]) -> Result<(), StoreError>;

    /// Remove completed jobs and record their outcomes.
    fn complete_jobs(&self, completions: &[JobCompletion]) -> Result<(), StoreError>;

    /// Drop every pending job of `kind`; returns how many were dropped.
    fn cancel_kind(&self, kind: JobKind) -> Result<usize, StoreError>;

    fn backlog_counts(&self, now: i64) -> Result<BTreeMap<JobKind, BacklogCount>, StoreError>;
}

/// Derived facts recorded by completed jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileFacts {
    pub thumbnail_resolution: Option<Resolution>,
    pub sha512: Option<String>,
    pub in_similar_files: Option<bool>,
    pub perceptual_hash: Option<u64>,
    pub modified_time: Option<i64>,
    pub has_exif: Option<bool>,
    pub has_human_readable_metadata: Option<bool>,
    pub has_icc_profile: Option<bool>,
    pub has_transparency: Option<bool>,
    pub pixel_hash: Option<String>,
    pub integrity: Option<IntegrityVerdict>,
    pub redownload_requested: bool,
}

#[derive(Debug, Default)]
struct Tables {
    media: BTreeMap<MediaId, MediaRecord>,
    jobs: BTreeMap<(MediaId, JobKind), i64>,
    facts: HashMap<MediaId, FileFacts>,
    fail_writes: bool,
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_media(&self, media: MediaRecord) {
        self.lock().media.insert(media.id, media);
    }

    pub fn media(&self, id: MediaId) -> Option<MediaRecord> {
        self.lock().media.get(&id).cloned()
    }

    pub fn facts(&self, id: MediaId) -> FileFacts {
        self.lock().facts.get(&id).cloned().unwrap_or_default()
    }

    pub fn pending_kinds(&self, id: MediaId) -> Vec<JobKind> {
        self.lock()
            .jobs
            .keys()
            .filter(|(media, _)| *media == id)
            .map(|(_, kind)| *kind)
            .collect()
    }

    /// Make every write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn check_writable(tables: &Tables) -> Result<(), StoreError> {
        if tables.fail_writes {
            return Err(StoreError::Backend("writes disabled".into()));
        }
        Ok(())
    }
}

fn append_job(tables: &mut Tables, job: &JobRecord) {
    let covering = JobKind::ALL.into_iter().find(|kind| {
        kind.overrules().contains(&job.kind) && tables.jobs.contains_key(&(job.media, *kind))
    });
    if let Some(kind) = covering {
        if let Some(not_before) = tables.jobs.get_mut(&(job.media, kind)) {
            *not_before = (*not_before).min(job.not_before);
        }
        return;
    }

    let mut due = job.not_before;
    for lesser in job.kind.overrules() {
        if let Some(not_before) = tables.jobs.remove(&(job.media, *lesser)) {
            due = due.min(not_before);
        }
    }
    tables
        .jobs
        .entry((job.media, job.kind))
        .and_modify(|not_before| *not_before = (*not_before).min(due))
        .or_insert(due);
}

fn apply_outcome(tables: &mut Tables, completion: &JobCompletion) {
    let id = completion.media;
    // Completions for a removed record only clear their job.
    if !tables.media.contains_key(&id) {
        return;
    }
    let facts = tables.facts.entry(id).or_default();

    match &completion.outcome {
        JobOutcome::Cleared => {}
        JobOutcome::Metadata(metadata) => {
            if let Some(media) = tables.media.get_mut(&id) {
                media.mime = metadata.mime;
                media.size = metadata.size;
                media.resolution = metadata.resolution;
            }
        }
        JobOutcome::Thumbnail { resolution } => facts.thumbnail_resolution = Some(*resolution),
        JobOutcome::ExtraHashes { sha512 } => facts.sha512 = Some(sha512.clone()),
        JobOutcome::SimilarFilesMembership(member) => facts.in_similar_files = Some(*member),
        JobOutcome::PerceptualHash(hash) => {
            facts.perceptual_hash = *hash;
            facts.in_similar_files = Some(hash.is_some());
        }
        JobOutcome::PermissionsFixed(_) | JobOutcome::NeighbourDupesRemoved(_) => {}
        JobOutcome::ModifiedTime(time) => facts.modified_time = Some(*time),
        JobOutcome::Integrity { verdict, action } => {
            facts.integrity = Some(*verdict);
            match action {
                IntegrityAction::Redownload => facts.redownload_requested = true,
                IntegrityAction::FileDeleted => {
                    if let Some(media) = tables.media.get_mut(&id) {
                        media.locally_stored = false;
                    }
                }
                IntegrityAction::RecordRemoved => {
                    tables.media.remove(&id);
                    tables.facts.remove(&id);
                    tables.jobs.retain(|(media, _), _| *media != id);
                }
                IntegrityAction::Nothing | IntegrityAction::Logged => {}
            }
        }
        JobOutcome::HasExif(flag) => facts.has_exif = Some(*flag),
        JobOutcome::HasHumanReadable(flag) => facts.has_human_readable_metadata = Some(*flag),
        JobOutcome::HasIccProfile(flag) => facts.has_icc_profile = Some(*flag),
        JobOutcome::HasTransparency(flag) => facts.has_transparency = Some(*flag),
        JobOutcome::PixelHash(hash) => facts.pixel_hash = hash.clone(),
        JobOutcome::Blurhash(hash) => {
            if let Some(media) = tables.media.get_mut(&id) {
                media.blurhash = hash.clone();
            }
        }
    }
}

impl Persistence for MemoryPersistence {
    fn fetch_due_batch(
        &self,
        filter: Option<&[JobKind]>,
        limit: usize,
        now: i64,
    ) -> Result<Vec<(MediaId, Vec<JobKind>)>, StoreError> {
        let tables = self.lock();
        let mut batch: Vec<(MediaId, Vec<JobKind>)> = Vec::new();

        for (&(media, kind), &not_before) in tables.jobs.iter() {
            if not_before > now || filter.is_some_and(|kinds| !kinds.contains(&kind)) {
                continue;
            }
            match batch.last_mut() {
                Some((last, kinds)) if *last == media => kinds.push(kind),
                _ => {
                    if batch.len() == limit {
                        break;
                    }
                    batch.push((media, vec![kind]));
                }
            }
        }
        Ok(batch)
    }

    fn fetch_media(&self, ids: &[MediaId]) -> Result<Vec<MediaRecord>, StoreError> {
        let tables = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| tables.media.get(id).cloned())
            .collect())
    }

    fn append_jobs(&self, jobs: &[JobRecord]) -> Result<(), StoreError> {
        let mut tables = self.lock();
        Self::check_writable(&tables)?;
        for job in jobs {
            append_job(&mut tables, job);
        }
        Ok(())
    }

    fn complete_jobs(&self, completions: &[JobCompletion]) -> Result<(), StoreError> {
        let mut tables = self.lock();
        Self::check_writable(&tables)?;
        for completion in completions {
            tables.jobs.remove(&(completion.media, completion.kind));
            apply_outcome(&mut tables, completion);
        }
        Ok(())
    }

    fn cancel_kind(&self, kind: JobKind) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        Self::check_writable(&tables)?;
        let before = tables.jobs.len();
        tables.jobs.retain(|(_, k), _| *k != kind);
        Ok(before - tables.jobs.len())
    }

    fn backlog_counts(&self, now: i64) -> Result<BTreeMap<JobKind, BacklogCount>, StoreError> {
        let tables = self.lock();
        let mut counts: BTreeMap<JobKind, BacklogCount> = BTreeMap::new();
        for (&(_, kind), &not_before) in tables.jobs.iter() {
            let count = counts.entry(kind).or_default();
            if not_before <= now {
                count.due += 1;
            } else {
                count.not_due += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64, kind: JobKind, not_before: i64) -> JobRecord {
        JobRecord {
            media: MediaId(id),
            kind,
            not_before,
        }
    }

    #[test]
    fn test_due_batch_groups_by_file() {
        let store = MemoryPersistence::new();
        store
            .append_jobs(&[
                job(2, JobKind::Blurhash, 0),
                job(1, JobKind::HasExif, 0),
                job(1, JobKind::PixelHash, 0),
                job(3, JobKind::HasExif, 500),
            ])
            .unwrap();

        let batch = store.fetch_due_batch(None, 10, 100).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, MediaId(1));
        assert_eq!(batch[0].1.len(), 2);
        assert_eq!(batch[1], (MediaId(2), vec![JobKind::Blurhash]));

        let limited = store.fetch_due_batch(None, 1, 1_000).unwrap();
        assert_eq!(limited.len(), 1);

        let filtered = store
            .fetch_due_batch(Some(&[JobKind::HasExif]), 10, 1_000)
            .unwrap();
        assert_eq!(
            filtered,
            vec![
                (MediaId(1), vec![JobKind::HasExif]),
                (MediaId(3), vec![JobKind::HasExif])
            ]
        );
    }

    #[test]
    fn test_append_dedupes_keeping_earliest() {
        let store = MemoryPersistence::new();
        store.append_jobs(&[job(1, JobKind::Blurhash, 900)]).unwrap();
        store.append_jobs(&[job(1, JobKind::Blurhash, 100)]).unwrap();
        store.append_jobs(&[job(1, JobKind::Blurhash, 500)]).unwrap();

        let counts = store.backlog_counts(200).unwrap();
        assert_eq!(counts[&JobKind::Blurhash], BacklogCount { due: 1, not_due: 0 });
    }

    #[test]
    fn test_append_applies_overrule() {
        let store = MemoryPersistence::new();
        store.append_jobs(&[job(1, JobKind::ForceThumbnail, 3_600)]).unwrap();
        store.append_jobs(&[job(1, JobKind::RefitThumbnail, 0)]).unwrap();

        // the pending force stands in for the refit, at the refit's due time
        assert_eq!(store.pending_kinds(MediaId(1)), vec![JobKind::ForceThumbnail]);
        assert_eq!(
            store.backlog_counts(10).unwrap()[&JobKind::ForceThumbnail],
            BacklogCount { due: 1, not_due: 0 }
        );

        store
            .append_jobs(&[
                job(2, JobKind::IntegrityPresenceLogOnly, 0),
                job(2, JobKind::IntegrityDataTryUrl, 500),
            ])
            .unwrap();
        assert_eq!(store.pending_kinds(MediaId(2)), vec![JobKind::IntegrityDataTryUrl]);
        assert_eq!(
            store.backlog_counts(10).unwrap()[&JobKind::IntegrityDataTryUrl],
            BacklogCount { due: 1, not_due: 0 }
        );
    }

    #[test]
    fn test_completion_applies_outcome() {
        let store = MemoryPersistence::new();
        store.insert_media(MediaRecord::new(MediaId(1), "aa", Mime::Unknown));
        store.append_jobs(&[job(1, JobKind::RegenFileMetadata, 0)]).unwrap();

        store
            .complete_jobs(&[JobCompletion {
                media: MediaId(1),
                kind: JobKind::RegenFileMetadata,
                outcome: JobOutcome::Metadata(FileMetadata {
                    mime: Mime::Png,
                    size: 42,
                    resolution: Some(Resolution::new(3, 4)),
                }),
            }])
            .unwrap();

        let media = store.media(MediaId(1)).unwrap();
        assert_eq!(media.mime, Mime::Png);
        assert_eq!(media.resolution, Some(Resolution::new(3, 4)));
        assert!(store.pending_kinds(MediaId(1)).is_empty());
    }

    #[test]
    fn test_record_removal_drops_jobs() {
        let store = MemoryPersistence::new();
        store.insert_media(MediaRecord::new(MediaId(1), "aa", Mime::Png));
        store
            .append_jobs(&[
                job(1, JobKind::IntegrityPresenceRemoveRecord, 0),
                job(1, JobKind::Blurhash, 0),
            ])
            .unwrap();

        store
            .complete_jobs(&[JobCompletion {
                media: MediaId(1),
                kind: JobKind::IntegrityPresenceRemoveRecord,
                outcome: JobOutcome::Integrity {
                    verdict: IntegrityVerdict::Missing,
                    action: IntegrityAction::RecordRemoved,
                },
            }])
            .unwrap();

        assert!(store.media(MediaId(1)).is_none());
        assert!(store.pending_kinds(MediaId(1)).is_empty());

        store
            .complete_jobs(&[JobCompletion::cleared(MediaId(1), JobKind::Blurhash)])
            .unwrap();
        assert_eq!(store.facts(MediaId(1)), FileFacts::default());
        assert!(!store.lock().facts.contains_key(&MediaId(1)));
    }

    #[test]
    fn test_cancel_kind_and_fault_injection() {
        let store = MemoryPersistence::new();
        store
            .append_jobs(&[job(1, JobKind::Blurhash, 0), job(2, JobKind::Blurhash, 0)])
            .unwrap();
        assert_eq!(store.cancel_kind(JobKind::Blurhash).unwrap(), 2);

        store.fail_writes(true);
        assert!(store.append_jobs(&[job(1, JobKind::HasExif, 0)]).is_err());
        store.fail_writes(false);
        assert!(store.append_jobs(&[job(1, JobKind::HasExif, 0)]).is_ok());
    }
}
