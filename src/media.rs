//! Media records - identity, mime classification and resolution.
//!
//! A `MediaRecord` is the loader's and the maintenance engine's view of one
//! file in the library. It is owned by persistence; everything here treats it
//! as an immutable snapshot.

use std::fmt;
use std::path::Path;

/// Stable identity of a file in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaId(pub u64);

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same resolution with width and height exchanged (a 90° rotation).
    #[inline]
    pub fn swapped(self) -> Self {
        Self::new(self.height, self.width)
    }

    #[inline]
    pub fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Estimated bytes for an RGBA raster of this size.
    #[inline]
    pub fn rgba_bytes(self) -> usize {
        self.pixel_count() as usize * 4
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// File type as far as thumbnailing and maintenance care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mime {
    Jpeg,
    Png,
    Webp,
    Bmp,
    Gif,
    AnimatedGif,
    Apng,
    Mp4,
    Webm,
    Mkv,
    Pdf,
    Psd,
    Svg,
    Mp3,
    Flac,
    Zip,
    Unknown,
}

/// Broad class used for placeholders and job applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MimeClass {
    Image,
    Animation,
    Video,
    Document,
    Audio,
    Archive,
    Unknown,
}

impl Mime {
    /// Static ordering proxy for the waterfall. Lower renders sooner.
    ///
    /// 0 for things that only ever show an icon, 1 for still images,
    /// 2 for animations, 3 for video and thumbnailable documents,
    /// 5 for anything we cannot classify.
    pub const fn ease_score(self) -> u8 {
        match self {
            Mime::Mp3 | Mime::Flac | Mime::Zip | Mime::Svg => 0,
            Mime::Jpeg | Mime::Png | Mime::Webp | Mime::Bmp | Mime::Gif => 1,
            Mime::AnimatedGif | Mime::Apng => 2,
            Mime::Mp4 | Mime::Webm | Mime::Mkv | Mime::Pdf | Mime::Psd => 3,
            Mime::Unknown => 5,
        }
    }

    pub const fn class(self) -> MimeClass {
        match self {
            Mime::Jpeg | Mime::Png | Mime::Webp | Mime::Bmp | Mime::Gif => MimeClass::Image,
            Mime::AnimatedGif | Mime::Apng => MimeClass::Animation,
            Mime::Mp4 | Mime::Webm | Mime::Mkv => MimeClass::Video,
            Mime::Pdf | Mime::Psd | Mime::Svg => MimeClass::Document,
            Mime::Mp3 | Mime::Flac => MimeClass::Audio,
            Mime::Zip => MimeClass::Archive,
            Mime::Unknown => MimeClass::Unknown,
        }
    }

    /// Whether a thumbnail file is ever generated for this type.
    pub const fn can_have_thumbnail(self) -> bool {
        !matches!(
            self,
            Mime::Mp3 | Mime::Flac | Mime::Zip | Mime::Svg | Mime::Unknown
        )
    }

    /// Whether the bundled decoder can produce pixels for this type.
    pub const fn is_decodable_image(self) -> bool {
        matches!(
            self,
            Mime::Jpeg | Mime::Png | Mime::Webp | Mime::Bmp | Mime::Gif | Mime::AnimatedGif | Mime::Apng
        )
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Mime::Jpeg => "jpg",
            Mime::Png | Mime::Apng => "png",
            Mime::Webp => "webp",
            Mime::Bmp => "bmp",
            Mime::Gif | Mime::AnimatedGif => "gif",
            Mime::Mp4 => "mp4",
            Mime::Webm => "webm",
            Mime::Mkv => "mkv",
            Mime::Pdf => "pdf",
            Mime::Psd => "psd",
            Mime::Svg => "svg",
            Mime::Mp3 => "mp3",
            Mime::Flac => "flac",
            Mime::Zip => "zip",
            Mime::Unknown => "bin",
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Mime::Jpeg,
            "png" => Mime::Png,
            "webp" => Mime::Webp,
            "bmp" => Mime::Bmp,
            "gif" => Mime::Gif,
            "mp4" => Mime::Mp4,
            "webm" => Mime::Webm,
            "mkv" => Mime::Mkv,
            "pdf" => Mime::Pdf,
            "psd" => Mime::Psd,
            "svg" => Mime::Svg,
            "mp3" => Mime::Mp3,
            "flac" => Mime::Flac,
            "zip" => Mime::Zip,
            _ => Mime::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Mime::Unknown)
    }
}

/// Snapshot of one library file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    pub id: MediaId,
    /// Lowercase hex sha256 of the file contents
    pub hash: String,
    pub mime: Mime,
    pub size: u64,
    pub resolution: Option<Resolution>,
    /// A copy of the file sits in the local file store
    pub locally_stored: bool,
    /// Some remote service still lists the file
    pub remotely_listed: bool,
    pub blurhash: Option<String>,
}

impl MediaRecord {
    pub fn new(id: MediaId, hash: impl Into<String>, mime: Mime) -> Self {
        Self {
            id,
            hash: hash.into(),
            mime,
            size: 0,
            resolution: None,
            locally_stored: true,
            remotely_listed: false,
            blurhash: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Nothing anywhere can ever produce pixels for this file.
    pub fn is_confirmed_absent(&self) -> bool {
        !self.locally_stored && !self.remotely_listed && self.blurhash.is_none()
    }

    /// Expected footprint of a full-resolution RGBA decode, if the resolution is known.
    pub fn full_memory_estimate(&self) -> Option<usize> {
        self.resolution.map(Resolution::rgba_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ease_scores() {
        assert_eq!(Mime::Mp3.ease_score(), 0);
        assert_eq!(Mime::Jpeg.ease_score(), 1);
        assert_eq!(Mime::AnimatedGif.ease_score(), 2);
        assert_eq!(Mime::Webm.ease_score(), 3);
        assert_eq!(Mime::Pdf.ease_score(), 3);
        assert_eq!(Mime::Unknown.ease_score(), 5);
    }

    #[test]
    fn test_mime_from_path() {
        assert_eq!(Mime::from_path(Path::new("a/b.JPEG")), Mime::Jpeg);
        assert_eq!(Mime::from_path(Path::new("x.webm")), Mime::Webm);
        assert_eq!(Mime::from_path(Path::new("noext")), Mime::Unknown);
    }

    #[test]
    fn test_confirmed_absent() {
        let mut media = MediaRecord::new(MediaId(1), "ab", Mime::Png);
        assert!(!media.is_confirmed_absent());

        media.locally_stored = false;
        assert!(media.is_confirmed_absent());

        media.blurhash = Some("LEHV6nWB2yk8pyo0adR*.7kCMdnj".into());
        assert!(!media.is_confirmed_absent());
    }

    #[test]
    fn test_resolution_helpers() {
        let res = Resolution::new(200, 100);
        assert_eq!(res.swapped(), Resolution::new(100, 200));
        assert_eq!(res.rgba_bytes(), 80_000);
        assert!(Resolution::new(0, 5).is_empty());
    }
}
