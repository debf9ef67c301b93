//! Error types for every boundary of the crate.

use crate::jobs::JobKind;
use crate::media::{MediaId, Mime};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a `Decoder`.
///
/// Control flow branches on `NotFound` versus the rest: a missing file is an
/// absence, anything else means the bytes are there but unusable.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("no decoder for {0:?}")]
    Unsupported(Mime),

    #[error("corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DecodeError::NotFound(_))
    }

    /// Read a file, mapping a missing file to `NotFound`.
    pub(crate) fn read(path: &std::path::Path) -> Result<Vec<u8>, DecodeError> {
        std::fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DecodeError::NotFound(path.to_path_buf()),
            _ => DecodeError::Io(e),
        })
    }
}

/// Failures of the persistence backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// Failure of one maintenance job against one file.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("source file missing: {0}")]
    MissingFile(PathBuf),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Storage-class failures that should halt the whole engine rather than
    /// be written off as a per-file problem.
    pub fn is_systemic(&self) -> bool {
        match self {
            JobError::MissingFile(_) => false,
            JobError::Decode(DecodeError::Io(e)) | JobError::Io(e) => is_systemic_io(e),
            JobError::Decode(_) => false,
            JobError::Store(_) => true,
        }
    }
}

/// IO errors that say something about one file are per-file; the rest
/// (device gone, disk full, read-only mount, ...) are systemic.
pub fn is_systemic_io(error: &io::Error) -> bool {
    !matches!(
        error.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof
    )
}

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("maintenance halted after a serious storage error")]
    Halted,

    #[error("serious storage error: {0}")]
    SystemicIo(String),

    #[error("job records reference unknown files: {0:?}")]
    IntegrityMiss(Vec<MediaId>),

    #[error("{kind:?} failed for {media}: {reason}")]
    JobFailed {
        media: MediaId,
        kind: JobKind,
        reason: String,
    },

    #[error("shutting down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemic_classification() {
        let per_file = JobError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!per_file.is_systemic());

        let device = JobError::Io(io::Error::other("input/output error"));
        assert!(device.is_systemic());

        let corrupt = JobError::Decode(DecodeError::Corrupt {
            path: PathBuf::from("x"),
            reason: "bad huffman".into(),
        });
        assert!(!corrupt.is_systemic());

        let store = JobError::Store(StoreError::Backend("db locked".into()));
        assert!(store.is_systemic());
    }

    #[test]
    fn test_read_maps_missing_file() {
        let err = DecodeError::read(std::path::Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(err.is_not_found());
    }
}
