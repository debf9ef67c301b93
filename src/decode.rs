//! Image decoding service.
//!
//! The caches and the maintenance engine only see the `Decoder` trait. The
//! bundled `ImageDecoder` covers still images: zune-jpeg for JPEG, the `image`
//! crate for everything else, `blurhash` for placeholders.

use crate::config::ScalePolicy;
use crate::error::DecodeError;
use crate::media::{Mime, Resolution};
use crate::raster::Raster;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Mime of thumbnail files written by `encode_thumbnail`.
pub const THUMBNAIL_MIME: Mime = Mime::Png;

/// Facts read from a file without a full decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileProbe {
    /// Mime sniffed from content, if recognisable
    pub mime: Option<Mime>,
    pub resolution: Option<Resolution>,
    pub has_exif: bool,
    pub has_icc_profile: bool,
    /// Text chunks, comments, XMP and the like
    pub has_human_readable_metadata: bool,
}

/// Pixel source for thumbnails, renders and maintenance probes.
pub trait Decoder: Send + Sync {
    /// Decode a file to RGBA. Must return `NotFound` for a missing file.
    fn decode(&self, path: &Path, mime: Mime) -> Result<Raster, DecodeError>;

    /// Cheap header-level facts.
    fn probe(&self, path: &Path, mime: Mime) -> Result<FileProbe, DecodeError>;

    /// Serialize a thumbnail raster to the on-disk thumbnail format.
    fn encode_thumbnail(&self, raster: &Raster) -> Result<Vec<u8>, DecodeError>;

    fn encode_blurhash(&self, raster: &Raster) -> Option<String>;

    fn blurhash_placeholder(&self, blurhash: &str, target: Resolution) -> Option<Raster>;

    fn thumbnail_target_resolution(
        &self,
        source: Resolution,
        bounding_box: Resolution,
        policy: ScalePolicy,
        dpi_percent: u32,
    ) -> Resolution {
        thumbnail_target_resolution(source, bounding_box, policy, dpi_percent)
    }
}

/// Resolution a thumbnail of `source` should have inside `bounding_box`.
pub fn thumbnail_target_resolution(
    source: Resolution,
    bounding_box: Resolution,
    policy: ScalePolicy,
    dpi_percent: u32,
) -> Resolution {
    let scale_box = |v: u32| ((v as u64 * dpi_percent.max(1) as u64) / 100).max(1) as u32;
    let target_box = Resolution::new(scale_box(bounding_box.width), scale_box(bounding_box.height));

    if source.is_empty() {
        return target_box;
    }

    match policy {
        ScalePolicy::Fill => target_box,
        ScalePolicy::Fit => {
            if source.width <= target_box.width && source.height <= target_box.height {
                return source;
            }
            let scale = f64::min(
                target_box.width as f64 / source.width as f64,
                target_box.height as f64 / source.height as f64,
            );
            Resolution::new(
                ((source.width as f64 * scale).round() as u32).max(1),
                ((source.height as f64 * scale).round() as u32).max(1),
            )
        }
    }
}

/// Decoder for still images - handles format detection.
pub struct ImageDecoder {
    /// Supported extensions (lowercase, no dot)
    supported_extensions: Vec<&'static str>,
}

impl ImageDecoder {
    pub fn new() -> Self {
        Self {
            supported_extensions: vec!["jpg", "jpeg", "png", "gif", "bmp", "webp"],
        }
    }

    /// Check if a file is supported
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = ext.to_lowercase();
                self.supported_extensions.iter().any(|&e| e == ext_lower)
            })
            .unwrap_or(false)
    }

    /// Get supported extensions
    pub fn extensions(&self) -> &[&'static str] {
        &self.supported_extensions
    }

    /// Decode JPEG using zune-jpeg (fast)
    fn decode_jpeg(data: &[u8]) -> Option<(Vec<u8>, u32, u32)> {
        let mut decoder = zune_jpeg::JpegDecoder::new(data);
        let pixels = decoder.decode().ok()?;
        let info = decoder.info()?;
        let (width, height) = (info.width as u32, info.height as u32);

        // Output channels follow the decoder's output colorspace, not the file's.
        let area = width as usize * height as usize;
        if area == 0 || pixels.len() % area != 0 {
            return None;
        }
        match pixels.len() / area {
            components @ (1 | 3 | 4) => Some((Self::to_rgba(pixels, components as u8), width, height)),
            _ => None,
        }
    }

    /// Decode using image crate (generic fallback)
    fn decode_generic(data: &[u8]) -> Result<(Vec<u8>, u32, u32), String> {
        let img = image::load_from_memory(data).map_err(|e| e.to_string())?;
        let rgba = img.to_rgba8();
        let (w, h) = (rgba.width(), rgba.height());
        Ok((rgba.into_raw(), w, h))
    }

    /// Convert raw pixels to RGBA
    fn to_rgba(pixels: Vec<u8>, components: u8) -> Vec<u8> {
        match components {
            4 => pixels, // Already RGBA
            3 => pixels
                .chunks_exact(3)
                .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 255])
                .collect(),
            1 => pixels.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            _ => pixels,
        }
    }

    fn sniff_mime(data: &[u8]) -> Option<Mime> {
        let mime = match image::guess_format(data).ok()? {
            image::ImageFormat::Jpeg => Mime::Jpeg,
            image::ImageFormat::Png if contains(data, b"acTL") => Mime::Apng,
            image::ImageFormat::Png => Mime::Png,
            image::ImageFormat::Gif if count(data, b"\x21\xF9\x04") > 1 => Mime::AnimatedGif,
            image::ImageFormat::Gif => Mime::Gif,
            image::ImageFormat::WebP => Mime::Webp,
            image::ImageFormat::Bmp => Mime::Bmp,
            _ => return None,
        };
        Some(mime)
    }

    fn icc_profile(data: &[u8]) -> bool {
        use image::ImageDecoder as _;

        let reader = match image::ImageReader::new(Cursor::new(data)).with_guessed_format() {
            Ok(reader) => reader,
            Err(_) => return false,
        };
        match reader.into_decoder() {
            Ok(mut decoder) => matches!(decoder.icc_profile(), Ok(Some(profile)) if !profile.is_empty()),
            Err(_) => false,
        }
    }
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ImageDecoder {
    fn decode(&self, path: &Path, mime: Mime) -> Result<Raster, DecodeError> {
        if !mime.is_decodable_image() {
            return Err(DecodeError::Unsupported(mime));
        }
        let data = DecodeError::read(path)?;

        let fast = if mime == Mime::Jpeg {
            Self::decode_jpeg(&data)
        } else {
            None
        };
        let (rgba, width, height) = match fast {
            Some(decoded) => decoded,
            None => Self::decode_generic(&data).map_err(|reason| DecodeError::Corrupt {
                path: path.to_path_buf(),
                reason,
            })?,
        };

        if rgba.len() != width as usize * height as usize * 4 {
            return Err(DecodeError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("{} bytes for {width}x{height}", rgba.len()),
            });
        }
        Ok(Raster::new(rgba, width, height))
    }

    fn probe(&self, path: &Path, mime: Mime) -> Result<FileProbe, DecodeError> {
        let data = DecodeError::read(path)?;
        let sniffed = Self::sniff_mime(&data);

        let resolution = if mime.is_decodable_image() || sniffed.is_some() {
            image::ImageReader::new(Cursor::new(&data))
                .with_guessed_format()
                .ok()
                .and_then(|reader| reader.into_dimensions().ok())
                .map(|(w, h)| Resolution::new(w, h))
        } else {
            None
        };

        Ok(FileProbe {
            mime: sniffed,
            resolution,
            has_exif: contains(&data, b"Exif\0\0"),
            has_icc_profile: Self::icc_profile(&data),
            has_human_readable_metadata: [&b"tEXt"[..], b"iTXt", b"zTXt", b"\x21\xFE", b"http://ns.adobe.com/xap/1.0/"]
                .iter()
                .any(|marker| contains(&data, marker)),
        })
    }

    fn encode_thumbnail(&self, raster: &Raster) -> Result<Vec<u8>, DecodeError> {
        let corrupt = |reason: String| DecodeError::Corrupt {
            path: PathBuf::from("<thumbnail>"),
            reason,
        };
        let image = image::RgbaImage::from_raw(raster.width, raster.height, raster.pixels.clone())
            .ok_or_else(|| corrupt("raster buffer size mismatch".into()))?;

        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, image::ImageFormat::Png)
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(bytes.into_inner())
    }

    fn encode_blurhash(&self, raster: &Raster) -> Option<String> {
        if raster.resolution().is_empty() {
            return None;
        }
        // Encoding cost scales with pixel count; a thumbnail-sized input is plenty.
        let small = if raster.width > 64 || raster.height > 64 {
            raster.resized(thumbnail_target_resolution(
                raster.resolution(),
                Resolution::new(64, 64),
                ScalePolicy::Fit,
                100,
            ))
        } else {
            raster.clone()
        };
        blurhash::encode(4, 3, small.width, small.height, &small.pixels).ok()
    }

    fn blurhash_placeholder(&self, blurhash: &str, target: Resolution) -> Option<Raster> {
        if target.is_empty() {
            return None;
        }
        let pixels = blurhash::decode(blurhash, target.width, target.height, 1.0).ok()?;
        if pixels.len() != target.rgba_bytes() {
            return None;
        }
        Some(Raster::new(pixels, target.width, target.height))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    count(haystack, needle) > 0
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Scan a directory tree for files the decoder or the library understands.
pub fn scan_directory(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| Mime::from_path(e.path()) != Mime::Unknown)
        .map(|e| e.path().to_path_buf())
        .collect();

    files.sort();
    files
}
