//! EXIF extraction from image bytes
//!
//! The normalizer consumes [`RawExif`]; an [`ExifReader`] produces it. The
//! default reader uses `little_exif` with the container format sniffed by
//! `infer`, so file extensions are never trusted.

use crate::types::{RawExif, TaggingError, TaggingResult};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use little_exif::rational::uR64;

/// Source of raw EXIF fields for an image
pub trait ExifReader: Send + Sync {
    /// Extract raw EXIF from image bytes
    ///
    /// Images without an EXIF block yield `RawExif::default()`. A block that
    /// is present but cannot be decoded is `TaggingError::Metadata`; malformed
    /// values inside a readable block are left for the normalizer to reject.
    fn extract(&self, bytes: &[u8]) -> TaggingResult<RawExif>;
}

/// [`ExifReader`] backed by `little_exif`
#[derive(Debug, Default, Clone, Copy)]
pub struct LittleExifReader;

impl LittleExifReader {
    pub fn new() -> Self {
        Self
    }
}

/// Map sniffed content type to a little_exif container
fn sniff_file_type(bytes: &[u8]) -> Option<FileExtension> {
    let kind = infer::get(bytes)?;
    match kind.mime_type() {
        "image/jpeg" => Some(FileExtension::JPEG),
        "image/png" => Some(FileExtension::PNG {
            as_zTXt_chunk: true,
        }),
        "image/webp" => Some(FileExtension::WEBP),
        _ => None,
    }
}

impl ExifReader for LittleExifReader {
    fn extract(&self, bytes: &[u8]) -> TaggingResult<RawExif> {
        let Some(file_type) = sniff_file_type(bytes) else {
            tracing::debug!("Unsupported or unknown image container, no EXIF read");
            return Ok(RawExif::default());
        };

        match locate_exif(bytes, &file_type) {
            ExifBlock::Absent => {
                tracing::debug!("No EXIF block");
                return Ok(RawExif::default());
            }
            ExifBlock::Damaged(reason) => return Err(TaggingError::Metadata(reason)),
            ExifBlock::Present => {}
        }

        let data = bytes.to_vec();
        let metadata = Metadata::new_from_vec(&data, file_type)
            .map_err(|e| TaggingError::Metadata(format!("EXIF block unreadable: {}", e)))?;

        Ok(RawExif {
            date_time_original: string_tag(&metadata, ExifTag::DateTimeOriginal(String::new())),
            date_time: string_tag(&metadata, ExifTag::ModifyDate(String::new())),
            gps_latitude: rational_tag(&metadata, ExifTag::GPSLatitude(Vec::new())),
            gps_latitude_ref: string_tag(&metadata, ExifTag::GPSLatitudeRef(String::new())),
            gps_longitude: rational_tag(&metadata, ExifTag::GPSLongitude(Vec::new())),
            gps_longitude_ref: string_tag(&metadata, ExifTag::GPSLongitudeRef(String::new())),
            make: string_tag(&metadata, ExifTag::Make(String::new())),
            model: string_tag(&metadata, ExifTag::Model(String::new())),
            lens_model: string_tag(&metadata, ExifTag::LensModel(String::new())),
        })
    }
}

/// `Exif\0\0` identifier opening a JPEG APP1 EXIF segment
const JPEG_EXIF_HEADER: &[u8] = b"Exif\0\0";

/// What a container says about its EXIF block
#[derive(Debug, PartialEq)]
enum ExifBlock {
    Absent,
    Present,
    Damaged(String),
}

fn locate_exif(bytes: &[u8], file_type: &FileExtension) -> ExifBlock {
    match file_type {
        FileExtension::JPEG => locate_jpeg_exif(bytes),
        FileExtension::PNG { .. } => {
            if contains(bytes, b"eXIf") || contains(bytes, b"Raw profile type exif") {
                ExifBlock::Present
            } else {
                ExifBlock::Absent
            }
        }
        FileExtension::WEBP => {
            if bytes.len() > 12 && contains(&bytes[12..], b"EXIF") {
                ExifBlock::Present
            } else {
                ExifBlock::Absent
            }
        }
        _ => ExifBlock::Absent,
    }
}

/// Walk JPEG marker segments up to start-of-scan looking for APP1 `Exif`
fn locate_jpeg_exif(bytes: &[u8]) -> ExifBlock {
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            break;
        }
        let marker = bytes[pos + 1];
        match marker {
            // Fill byte
            0xFF => {
                pos += 1;
                continue;
            }
            // Start of scan / end of image: no metadata past this point
            0xDA | 0xD9 => break,
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if marker == 0xE1 && bytes[pos + 4..].starts_with(JPEG_EXIF_HEADER) {
            let end = pos + 2 + length;
            if length < 2 + JPEG_EXIF_HEADER.len() || end > bytes.len() {
                return ExifBlock::Damaged(format!(
                    "EXIF segment truncated: declares {} bytes, {} available",
                    length,
                    bytes.len() - pos - 2
                ));
            }
            return check_tiff_header(&bytes[pos + 4 + JPEG_EXIF_HEADER.len()..end]);
        }
        if length < 2 {
            break;
        }
        pos += 2 + length;
    }
    ExifBlock::Absent
}

/// Byte order mark, magic 42 and an in-bounds IFD0 offset
fn check_tiff_header(tiff: &[u8]) -> ExifBlock {
    if tiff.len() < 8 {
        return ExifBlock::Damaged("EXIF TIFF header truncated".to_string());
    }
    let (magic, offset) = match &tiff[..2] {
        b"II" => (
            u16::from_le_bytes([tiff[2], tiff[3]]),
            u32::from_le_bytes([tiff[4], tiff[5], tiff[6], tiff[7]]),
        ),
        b"MM" => (
            u16::from_be_bytes([tiff[2], tiff[3]]),
            u32::from_be_bytes([tiff[4], tiff[5], tiff[6], tiff[7]]),
        ),
        _ => return ExifBlock::Damaged("EXIF byte order mark missing".to_string()),
    };
    if magic != 42 {
        return ExifBlock::Damaged(format!("EXIF TIFF magic {} (expected 42)", magic));
    }
    let offset = offset as usize;
    if offset < 8 || offset + 2 > tiff.len() {
        return ExifBlock::Damaged(format!(
            "EXIF IFD0 offset {} outside {}-byte block",
            offset,
            tiff.len()
        ));
    }
    ExifBlock::Present
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn string_tag(metadata: &Metadata, query: ExifTag) -> Option<String> {
    metadata.get_tag(&query).next().and_then(|tag| match tag {
        ExifTag::DateTimeOriginal(s)
        | ExifTag::ModifyDate(s)
        | ExifTag::GPSLatitudeRef(s)
        | ExifTag::GPSLongitudeRef(s)
        | ExifTag::Make(s)
        | ExifTag::Model(s)
        | ExifTag::LensModel(s) => Some(s.clone()),
        _ => None,
    })
}

/// GPS components as floats; a zero denominator becomes NaN so the
/// normalizer rejects it
fn rational_tag(metadata: &Metadata, query: ExifTag) -> Option<Vec<f64>> {
    metadata.get_tag(&query).next().and_then(|tag| match tag {
        ExifTag::GPSLatitude(values) | ExifTag::GPSLongitude(values) => {
            Some(values.iter().map(rational_to_f64).collect())
        }
        _ => None,
    })
}

fn rational_to_f64(value: &uR64) -> f64 {
    if value.denominator == 0 {
        f64::NAN
    } else {
        value.nominator as f64 / value.denominator as f64
    }
}
