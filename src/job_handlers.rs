//! Per-kind maintenance work against one file.
//!
//! `execute` is the single dispatch point: an exhaustive match from `JobKind`
//! to a handler. Handlers are plain functions over a `JobContext` and never
//! touch persistence; the engine records whatever outcome they return.

use crate::config::{LoaderConfig, ScalePolicy};
use crate::decode::{Decoder, THUMBNAIL_MIME};
use crate::error::{DecodeError, JobError};
use crate::filestore::{sha256_file, FileStore};
use crate::jobs::JobKind;
use crate::media::{MediaRecord, Resolution};
use crate::persistence::{FileMetadata, IntegrityAction, IntegrityVerdict, JobOutcome};
use crate::raster::Raster;
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Collaborators a handler may use.
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub files: &'a dyn FileStore,
    pub decoder: &'a dyn Decoder,
    pub loader: &'a LoaderConfig,
}

impl<'a> JobContext<'a> {
    fn existing_file(&self, media: &MediaRecord) -> Result<PathBuf, JobError> {
        let path = self.files.file_path(media);
        if !path.exists() {
            return Err(JobError::MissingFile(path));
        }
        Ok(path)
    }

    fn decode_source(&self, media: &MediaRecord) -> Result<Raster, JobError> {
        let path = self.existing_file(media)?;
        self.decoder
            .decode(&path, media.mime)
            .map_err(|e| match e {
                DecodeError::NotFound(path) => JobError::MissingFile(path),
                other => JobError::Decode(other),
            })
    }
}

/// Thumbnail resolution a file of `source` resolution should end up with.
pub fn expected_thumbnail_resolution(
    decoder: &dyn Decoder,
    config: &LoaderConfig,
    source: Resolution,
) -> Resolution {
    decoder.thumbnail_target_resolution(
        source,
        config.thumbnail_box,
        config.scale_policy,
        config.dpi_percent,
    )
}

/// Build a thumbnail from the source file and write it to the store.
pub fn regenerate_thumbnail(
    media: &MediaRecord,
    ctx: &JobContext<'_>,
) -> Result<Resolution, JobError> {
    let source = ctx.decode_source(media)?;
    let target = expected_thumbnail_resolution(ctx.decoder, ctx.loader, source.resolution());

    let thumbnail = match ctx.loader.scale_policy {
        ScalePolicy::Fit if target == source.resolution() => source,
        ScalePolicy::Fit => source.resized(target),
        ScalePolicy::Fill => source.resized_to_fill(target),
    };

    let bytes = ctx.decoder.encode_thumbnail(&thumbnail)?;
    ctx.files.write_thumbnail(media, &bytes)?;

    tracing::debug!(media = %media.id, resolution = %thumbnail.resolution(), "thumbnail regenerated");
    Ok(thumbnail.resolution())
}

/// Run one job kind against one file.
pub fn execute(
    kind: JobKind,
    media: &MediaRecord,
    ctx: &JobContext<'_>,
) -> Result<JobOutcome, JobError> {
    match kind {
        JobKind::RegenFileMetadata => regen_metadata(media, ctx),
        JobKind::ForceThumbnail => force_thumbnail(media, ctx),
        JobKind::RefitThumbnail => refit_thumbnail(media, ctx),
        JobKind::RegenExtraHashes => extra_hashes(media, ctx),
        JobKind::DeleteNeighbourDupes => delete_neighbour_dupes(media, ctx),
        JobKind::CheckSimilarFilesMembership => Ok(JobOutcome::SimilarFilesMembership(
            media.mime.is_decodable_image(),
        )),
        JobKind::RegenSimilarFilesMetadata => similar_files_metadata(media, ctx),
        JobKind::FixPermissions => fix_permissions(media, ctx),
        JobKind::RegenModifiedTime => modified_time(media, ctx),
        JobKind::IntegrityPresenceLogOnly
        | JobKind::IntegrityPresenceRemoveRecord
        | JobKind::IntegrityPresenceTryUrlElseRemoveRecord
        | JobKind::IntegrityDataTryUrl
        | JobKind::IntegrityDataTryUrlElseRemoveRecord
        | JobKind::IntegrityDataRemoveRecord
        | JobKind::IntegrityDataSilentDelete => integrity(kind, media, ctx),
        JobKind::HasExif => {
            let probe = probe(media, ctx)?;
            Ok(JobOutcome::HasExif(probe.has_exif))
        }
        JobKind::HasHumanReadableEmbeddedMetadata => {
            let probe = probe(media, ctx)?;
            Ok(JobOutcome::HasHumanReadable(probe.has_human_readable_metadata))
        }
        JobKind::HasIccProfile => {
            let probe = probe(media, ctx)?;
            Ok(JobOutcome::HasIccProfile(probe.has_icc_profile))
        }
        JobKind::HasTransparency => {
            if !media.mime.is_decodable_image() {
                return Ok(JobOutcome::HasTransparency(false));
            }
            let raster = ctx.decode_source(media)?;
            Ok(JobOutcome::HasTransparency(raster.has_transparency()))
        }
        JobKind::PixelHash => pixel_hash(media, ctx),
        JobKind::Blurhash => blurhash(media, ctx),
    }
}

fn probe(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<crate::decode::FileProbe, JobError> {
    let path = ctx.existing_file(media)?;
    Ok(ctx.decoder.probe(&path, media.mime)?)
}

fn regen_metadata(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let path = ctx.existing_file(media)?;
    let size = fs::metadata(&path)?.len();
    let probe = ctx.decoder.probe(&path, media.mime)?;

    Ok(JobOutcome::Metadata(FileMetadata {
        mime: probe.mime.unwrap_or(media.mime),
        size,
        resolution: probe.resolution.or(media.resolution),
    }))
}

fn force_thumbnail(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    if !media.mime.can_have_thumbnail() {
        return Ok(JobOutcome::Cleared);
    }
    let resolution = regenerate_thumbnail(media, ctx)?;
    Ok(JobOutcome::Thumbnail { resolution })
}

fn refit_thumbnail(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    if !media.mime.can_have_thumbnail() {
        return Ok(JobOutcome::Cleared);
    }

    let current = ctx
        .decoder
        .decode(&ctx.files.thumbnail_path(media), THUMBNAIL_MIME)
        .ok()
        .map(|raster| raster.resolution());

    let fits = match (current, media.resolution) {
        (Some(current), Some(source)) => {
            let expected = expected_thumbnail_resolution(ctx.decoder, ctx.loader, source);
            current == expected || current == expected.swapped()
        }
        _ => false,
    };

    match current {
        Some(resolution) if fits => Ok(JobOutcome::Thumbnail { resolution }),
        _ => force_thumbnail(media, ctx),
    }
}

fn extra_hashes(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let path = ctx.existing_file(media)?;
    let mut file = fs::File::open(&path)?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(JobOutcome::ExtraHashes {
        sha512: hex::encode(hasher.finalize()),
    })
}

fn delete_neighbour_dupes(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let dupes = ctx.files.neighbour_duplicates(media)?;
    for path in &dupes {
        tracing::info!(media = %media.id, path = %path.display(), "removing misnamed duplicate");
        ctx.files.delete_file(path)?;
    }
    Ok(JobOutcome::NeighbourDupesRemoved(dupes.len()))
}

fn similar_files_metadata(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    if !media.mime.is_decodable_image() {
        return Ok(JobOutcome::PerceptualHash(None));
    }
    let raster = ctx.decode_source(media)?;
    Ok(JobOutcome::PerceptualHash(difference_hash(&raster)))
}

/// 64-bit difference hash over a 9x8 grayscale reduction.
pub fn difference_hash(raster: &Raster) -> Option<u64> {
    if raster.resolution().is_empty() {
        return None;
    }
    let small = raster.resized(Resolution::new(9, 8));
    let luma: Vec<u32> = small
        .pixels
        .chunks_exact(4)
        .map(|px| (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000)
        .collect();

    let mut hash = 0u64;
    for row in 0..8 {
        for col in 0..8 {
            let left = luma[row * 9 + col];
            let right = luma[row * 9 + col + 1];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    Some(hash)
}

fn fix_permissions(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let path = ctx.existing_file(media)?;
    Ok(JobOutcome::PermissionsFixed(ensure_owner_rw(&path)?))
}

#[cfg(unix)]
fn ensure_owner_rw(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    if mode & 0o600 == 0o600 {
        return Ok(false);
    }
    permissions.set_mode(mode | 0o600);
    fs::set_permissions(path, permissions)?;
    Ok(true)
}

#[cfg(not(unix))]
fn ensure_owner_rw(path: &Path) -> std::io::Result<bool> {
    let mut permissions = fs::metadata(path)?.permissions();
    if !permissions.readonly() {
        return Ok(false);
    }
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)?;
    Ok(true)
}

fn modified_time(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let path = ctx.existing_file(media)?;
    let modified = fs::metadata(&path)?.modified()?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(JobOutcome::ModifiedTime(secs))
}

fn integrity(kind: JobKind, media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let path = ctx.files.file_path(media);
    let checks_data = !matches!(
        kind,
        JobKind::IntegrityPresenceLogOnly
            | JobKind::IntegrityPresenceRemoveRecord
            | JobKind::IntegrityPresenceTryUrlElseRemoveRecord
    );

    let verdict = if !path.exists() {
        IntegrityVerdict::Missing
    } else if checks_data && sha256_file(&path)? != media.hash {
        IntegrityVerdict::Incorrect
    } else {
        IntegrityVerdict::Healthy
    };

    if verdict == IntegrityVerdict::Healthy {
        return Ok(JobOutcome::Integrity {
            verdict,
            action: IntegrityAction::Nothing,
        });
    }

    let redownload_else = |fallback| {
        if media.remotely_listed {
            IntegrityAction::Redownload
        } else {
            fallback
        }
    };
    let action = match kind {
        JobKind::IntegrityPresenceLogOnly => IntegrityAction::Logged,
        JobKind::IntegrityPresenceRemoveRecord | JobKind::IntegrityDataRemoveRecord => {
            IntegrityAction::RecordRemoved
        }
        JobKind::IntegrityPresenceTryUrlElseRemoveRecord
        | JobKind::IntegrityDataTryUrlElseRemoveRecord => {
            redownload_else(IntegrityAction::RecordRemoved)
        }
        JobKind::IntegrityDataTryUrl => redownload_else(IntegrityAction::Logged),
        JobKind::IntegrityDataSilentDelete => {
            ctx.files.delete_file(&path)?;
            IntegrityAction::FileDeleted
        }
        _ => IntegrityAction::Nothing,
    };

    tracing::warn!(media = %media.id, ?verdict, ?action, path = %path.display(), "integrity check failed");
    Ok(JobOutcome::Integrity { verdict, action })
}

fn pixel_hash(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    if !media.mime.is_decodable_image() {
        return Ok(JobOutcome::PixelHash(None));
    }
    let raster = ctx.decode_source(media)?;
    let mut hasher = Sha256::new();
    hasher.update(raster.width.to_le_bytes());
    hasher.update(raster.height.to_le_bytes());
    hasher.update(&raster.pixels);
    Ok(JobOutcome::PixelHash(Some(hex::encode(hasher.finalize()))))
}

fn blurhash(media: &MediaRecord, ctx: &JobContext<'_>) -> Result<JobOutcome, JobError> {
    let from_thumbnail = ctx
        .decoder
        .decode(&ctx.files.thumbnail_path(media), THUMBNAIL_MIME)
        .ok();

    let raster = match from_thumbnail {
        Some(raster) => raster,
        None if media.mime.is_decodable_image() => ctx.decode_source(media)?,
        None => return Ok(JobOutcome::Blurhash(None)),
    };
    Ok(JobOutcome::Blurhash(ctx.decoder.encode_blurhash(&raster)))
}
