//! Client file store - where library files and their thumbnails live on disk.

use crate::media::{MediaId, MediaRecord, Mime};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Locations and writes for files the library owns.
pub trait FileStore: Send + Sync {
    fn file_path(&self, media: &MediaRecord) -> PathBuf;

    fn thumbnail_path(&self, media: &MediaRecord) -> PathBuf;

    /// Replace the thumbnail atomically.
    fn write_thumbnail(&self, media: &MediaRecord, bytes: &[u8]) -> io::Result<()>;

    /// Copies of the file stored under the wrong extension.
    fn neighbour_duplicates(&self, media: &MediaRecord) -> io::Result<Vec<PathBuf>>;

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Hash-prefixed folder layout:
/// `root/f<xx>/<hash>.<ext>` for files and `root/t<xx>/<hash>.thumbnail` for thumbnails.
#[derive(Debug, Clone)]
pub struct FolderFileStore {
    root: PathBuf,
}

impl FolderFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prefix(hash: &str) -> &str {
        hash.get(..2).unwrap_or("00")
    }

    fn files_dir(&self, hash: &str) -> PathBuf {
        self.root.join(format!("f{}", Self::prefix(hash)))
    }

    fn thumbnails_dir(&self, hash: &str) -> PathBuf {
        self.root.join(format!("t{}", Self::prefix(hash)))
    }

    /// Copy `source` into the store and describe it.
    ///
    /// Resolution is left for metadata regeneration to fill in.
    pub fn import(&self, id: MediaId, source: &Path) -> io::Result<MediaRecord> {
        let hash = sha256_file(source)?;
        let mime = Mime::from_path(source);
        let size = fs::metadata(source)?.len();

        let media = MediaRecord::new(id, hash, mime).with_size(size);
        let dest = self.file_path(&media);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if !dest.exists() {
            fs::copy(source, &dest)?;
        }

        tracing::debug!(media = %id, path = %dest.display(), "imported file");
        Ok(media)
    }
}

impl FileStore for FolderFileStore {
    fn file_path(&self, media: &MediaRecord) -> PathBuf {
        self.files_dir(&media.hash)
            .join(format!("{}.{}", media.hash, media.mime.extension()))
    }

    fn thumbnail_path(&self, media: &MediaRecord) -> PathBuf {
        self.thumbnails_dir(&media.hash)
            .join(format!("{}.thumbnail", media.hash))
    }

    fn write_thumbnail(&self, media: &MediaRecord, bytes: &[u8]) -> io::Result<()> {
        let path = self.thumbnail_path(media);
        let dir = self.thumbnails_dir(&media.hash);
        fs::create_dir_all(&dir)?;

        // Readers never see a half-written thumbnail.
        let tmp = dir.join(format!("{}.thumbnail.tmp", media.hash));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)
    }

    fn neighbour_duplicates(&self, media: &MediaRecord) -> io::Result<Vec<PathBuf>> {
        let dir = self.files_dir(&media.hash);
        let correct = self.file_path(media);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dupes = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let same_hash = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem == media.hash);
            if same_hash && path != correct {
                dupes.push(path);
            }
        }
        dupes.sort();
        Ok(dupes)
    }
}

/// Lowercase hex sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
