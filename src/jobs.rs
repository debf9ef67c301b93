//! Job catalog - the static taxonomy of file maintenance work.
//!
//! Every kind carries a label, a throttling weight, the lesser kinds it
//! overrules, and a slot in the canonical run order. All of it is data: adding
//! a kind means adding a variant and letting the exhaustive matches point out
//! the rest.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKind {
    RegenFileMetadata,
    ForceThumbnail,
    RefitThumbnail,
    RegenExtraHashes,
    DeleteNeighbourDupes,
    CheckSimilarFilesMembership,
    RegenSimilarFilesMetadata,
    FixPermissions,
    RegenModifiedTime,
    IntegrityPresenceLogOnly,
    IntegrityPresenceRemoveRecord,
    IntegrityPresenceTryUrlElseRemoveRecord,
    IntegrityDataTryUrl,
    IntegrityDataTryUrlElseRemoveRecord,
    IntegrityDataRemoveRecord,
    IntegrityDataSilentDelete,
    HasExif,
    HasHumanReadableEmbeddedMetadata,
    HasIccProfile,
    HasTransparency,
    PixelHash,
    Blurhash,
}

/// Canonical execution order within one file.
///
/// Integrity checks come first because everything after assumes the file
/// exists. Metadata regen is next and ends the file's pass when it runs.
/// Thumbnails follow, then the cheap probes and derived data.
pub const RUN_ORDER: [JobKind; 22] = [
    JobKind::IntegrityDataSilentDelete,
    JobKind::IntegrityDataTryUrlElseRemoveRecord,
    JobKind::IntegrityDataRemoveRecord,
    JobKind::IntegrityDataTryUrl,
    JobKind::IntegrityPresenceTryUrlElseRemoveRecord,
    JobKind::IntegrityPresenceRemoveRecord,
    JobKind::IntegrityPresenceLogOnly,
    JobKind::RegenFileMetadata,
    JobKind::ForceThumbnail,
    JobKind::RefitThumbnail,
    JobKind::DeleteNeighbourDupes,
    JobKind::FixPermissions,
    JobKind::RegenModifiedTime,
    JobKind::RegenExtraHashes,
    JobKind::PixelHash,
    JobKind::RegenSimilarFilesMetadata,
    JobKind::CheckSimilarFilesMembership,
    JobKind::HasExif,
    JobKind::HasHumanReadableEmbeddedMetadata,
    JobKind::HasIccProfile,
    JobKind::HasTransparency,
    JobKind::Blurhash,
];

impl JobKind {
    pub const ALL: [JobKind; 22] = RUN_ORDER;

    pub const fn label(self) -> &'static str {
        match self {
            JobKind::RegenFileMetadata => "regenerate file metadata",
            JobKind::ForceThumbnail => "regenerate thumbnail",
            JobKind::RefitThumbnail => "regenerate thumbnail if incorrect size",
            JobKind::RegenExtraHashes => "regenerate non-standard hashes",
            JobKind::DeleteNeighbourDupes => "delete duplicate neighbours with incorrect file extension",
            JobKind::CheckSimilarFilesMembership => "check for membership in the similar files search system",
            JobKind::RegenSimilarFilesMetadata => "regenerate similar files metadata",
            JobKind::FixPermissions => "correct file permissions",
            JobKind::RegenModifiedTime => "regenerate file modified time",
            JobKind::IntegrityPresenceLogOnly => "if file is missing, note it in log",
            JobKind::IntegrityPresenceRemoveRecord => "if file is missing, remove record",
            JobKind::IntegrityPresenceTryUrlElseRemoveRecord => {
                "if file is missing, then if has URL try to redownload, else remove record"
            }
            JobKind::IntegrityDataTryUrl => "if file is incorrect, then if has URL try to redownload",
            JobKind::IntegrityDataTryUrlElseRemoveRecord => {
                "if file is incorrect, then if has URL try to redownload, else remove record"
            }
            JobKind::IntegrityDataRemoveRecord => "if file is incorrect, remove record",
            JobKind::IntegrityDataSilentDelete => "if file is incorrect, silently delete it",
            JobKind::HasExif => "determine if the file has EXIF metadata",
            JobKind::HasHumanReadableEmbeddedMetadata => {
                "determine if the file has non-EXIF human-readable embedded metadata"
            }
            JobKind::HasIccProfile => "determine if the file has an icc profile",
            JobKind::HasTransparency => "determine if the file has transparency",
            JobKind::PixelHash => "calculate file pixel hash",
            JobKind::Blurhash => "calculate file blurhash",
        }
    }

    /// Relative cost charged against the bandwidth rules when a job completes.
    pub const fn weight(self) -> u64 {
        match self {
            JobKind::RegenFileMetadata => 100,
            JobKind::ForceThumbnail => 25,
            JobKind::RefitThumbnail => 5,
            JobKind::RegenExtraHashes => 25,
            JobKind::DeleteNeighbourDupes => 25,
            JobKind::CheckSimilarFilesMembership => 50,
            JobKind::RegenSimilarFilesMetadata => 100,
            JobKind::FixPermissions => 25,
            JobKind::RegenModifiedTime => 10,
            JobKind::IntegrityPresenceLogOnly
            | JobKind::IntegrityPresenceRemoveRecord
            | JobKind::IntegrityPresenceTryUrlElseRemoveRecord => 5,
            JobKind::IntegrityDataTryUrl
            | JobKind::IntegrityDataTryUrlElseRemoveRecord
            | JobKind::IntegrityDataRemoveRecord
            | JobKind::IntegrityDataSilentDelete => 100,
            JobKind::HasExif => 25,
            JobKind::HasHumanReadableEmbeddedMetadata => 25,
            JobKind::HasIccProfile => 25,
            JobKind::HasTransparency => 50,
            JobKind::PixelHash => 100,
            JobKind::Blurhash => 15,
        }
    }

    /// Kinds whose effect this kind already includes.
    pub const fn overrules(self) -> &'static [JobKind] {
        use JobKind::*;
        match self {
            ForceThumbnail => &[RefitThumbnail],
            RegenSimilarFilesMetadata => &[CheckSimilarFilesMembership],
            IntegrityPresenceRemoveRecord => &[IntegrityPresenceLogOnly],
            IntegrityPresenceTryUrlElseRemoveRecord => {
                &[IntegrityPresenceRemoveRecord, IntegrityPresenceLogOnly]
            }
            IntegrityDataTryUrl => &[IntegrityPresenceLogOnly],
            IntegrityDataRemoveRecord => &[IntegrityPresenceRemoveRecord, IntegrityPresenceLogOnly],
            IntegrityDataTryUrlElseRemoveRecord => &[
                IntegrityDataTryUrl,
                IntegrityDataRemoveRecord,
                IntegrityPresenceTryUrlElseRemoveRecord,
                IntegrityPresenceRemoveRecord,
                IntegrityPresenceLogOnly,
            ],
            IntegrityDataSilentDelete => &[
                IntegrityDataTryUrl,
                IntegrityDataTryUrlElseRemoveRecord,
                IntegrityDataRemoveRecord,
                IntegrityPresenceTryUrlElseRemoveRecord,
                IntegrityPresenceRemoveRecord,
                IntegrityPresenceLogOnly,
            ],
            _ => &[],
        }
    }

    pub const fn is_integrity_check(self) -> bool {
        matches!(
            self,
            JobKind::IntegrityPresenceLogOnly
                | JobKind::IntegrityPresenceRemoveRecord
                | JobKind::IntegrityPresenceTryUrlElseRemoveRecord
                | JobKind::IntegrityDataTryUrl
                | JobKind::IntegrityDataTryUrlElseRemoveRecord
                | JobKind::IntegrityDataRemoveRecord
                | JobKind::IntegrityDataSilentDelete
        )
    }

    /// Position in `RUN_ORDER`.
    pub fn run_position(self) -> usize {
        RUN_ORDER
            .iter()
            .position(|k| *k == self)
            .unwrap_or(RUN_ORDER.len())
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    /// Case-insensitive lookup by variant name, e.g. `forcethumbnail`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| format!("{kind:?}").eq_ignore_ascii_case(name))
    }
}

/// Execution plan for one file's pending kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilePlan {
    /// Kinds to execute, in canonical order
    pub run: Vec<JobKind>,
    /// Pending kinds that a more powerful pending kind already covers
    pub satisfied: Vec<JobKind>,
}

/// Dedupe, drop overruled kinds, and sort the rest into run order.
pub fn plan_file(kinds: &[JobKind]) -> FilePlan {
    let pending: BTreeSet<JobKind> = kinds.iter().copied().collect();

    let overruled: BTreeSet<JobKind> = pending
        .iter()
        .flat_map(|kind| kind.overrules().iter().copied())
        .filter(|kind| pending.contains(kind))
        .collect();

    let mut run: Vec<JobKind> = pending.difference(&overruled).copied().collect();
    run.sort_by_key(|kind| kind.run_position());

    let mut satisfied: Vec<JobKind> = overruled.into_iter().collect();
    satisfied.sort_by_key(|kind| kind.run_position());

    FilePlan { run, satisfied }
}
