//! Metadata Normalizer
//!
//! Converts raw EXIF fields into canonical [`PhotoMetadata`]: a naive capture
//! timestamp, decimal-degree GPS, and a deduplicated camera string. Missing
//! values stay absent; malformed values are a per-photo `Metadata` error.

pub mod exif_reader;

pub use exif_reader::{ExifReader, LittleExifReader};

use crate::types::{GpsCoordinate, PhotoMetadata, RawExif, TaggingError, TaggingResult};
use chrono::NaiveDateTime;

/// Accepted capture timestamp layouts (EXIF first)
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y:%m:%d %H:%M:%S",
    "%Y:%m:%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Normalize raw EXIF into canonical photo metadata
///
/// # Returns
/// `Err(TaggingError::Metadata)` when a present field is malformed
pub fn normalize(raw: &RawExif) -> TaggingResult<PhotoMetadata> {
    let captured_at = match non_blank(raw.date_time_original.as_deref()) {
        Some(value) => parse_timestamp(value)?,
        None => match non_blank(raw.date_time.as_deref()) {
            Some(value) => parse_timestamp(value)?,
            None => None,
        },
    };

    let gps = parse_gps(raw)?;

    let make = clean_text(raw.make.as_deref());
    let model = clean_text(raw.model.as_deref());
    let camera = match (make, model) {
        (Some(make), Some(model)) => {
            // Avoid duplication like "Canon Canon EOS R5"
            if model.to_lowercase().starts_with(&make.to_lowercase()) {
                Some(model)
            } else {
                Some(format!("{} {}", make, model))
            }
        }
        (None, Some(model)) => Some(model),
        (Some(make), None) => Some(make),
        (None, None) => None,
    };

    Ok(PhotoMetadata {
        captured_at,
        gps,
        camera,
        lens: clean_text(raw.lens_model.as_deref()),
    })
}

/// Parse an EXIF-style timestamp; the all-zero placeholder means absent
fn parse_timestamp(value: &str) -> TaggingResult<Option<NaiveDateTime>> {
    let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if value.is_empty() || value.chars().all(|c| matches!(c, '0' | ':' | ' ' | '-')) {
        return Ok(None);
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(Some)
        .ok_or_else(|| TaggingError::Metadata(format!("Unparseable capture time '{}'", value)))
}

fn parse_gps(raw: &RawExif) -> TaggingResult<Option<GpsCoordinate>> {
    let (Some(lat), Some(lon)) = (&raw.gps_latitude, &raw.gps_longitude) else {
        return Ok(None);
    };

    let latitude = dms_to_decimal(lat, raw.gps_latitude_ref.as_deref(), 'S', 90.0, "latitude")?;
    let longitude = dms_to_decimal(lon, raw.gps_longitude_ref.as_deref(), 'W', 180.0, "longitude")?;

    // Exact 0,0 is what unset GPS blocks decode to
    if latitude == 0.0 && longitude == 0.0 {
        return Ok(None);
    }

    Ok(Some(GpsCoordinate::new(latitude, longitude)))
}

/// Convert degrees/minutes/seconds to signed decimal degrees
fn dms_to_decimal(
    values: &[f64],
    reference: Option<&str>,
    negative_ref: char,
    limit: f64,
    axis: &str,
) -> TaggingResult<f64> {
    if values.is_empty() || values.len() > 3 {
        return Err(TaggingError::Metadata(format!(
            "GPS {} has {} components (expected 1-3)",
            axis,
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(TaggingError::Metadata(format!(
            "GPS {} has invalid components {:?}",
            axis, values
        )));
    }

    let degrees = values[0];
    let minutes = values.get(1).copied().unwrap_or(0.0);
    let seconds = values.get(2).copied().unwrap_or(0.0);
    if minutes >= 60.0 || seconds >= 60.0 {
        return Err(TaggingError::Metadata(format!(
            "GPS {} minutes/seconds out of range {:?}",
            axis, values
        )));
    }

    let magnitude = degrees + minutes / 60.0 + seconds / 3600.0;
    if magnitude > limit {
        return Err(TaggingError::Metadata(format!(
            "GPS {} {} exceeds {}",
            axis, magnitude, limit
        )));
    }

    let negative = reference
        .map(|r| r.trim().chars().next().map(|c| c.to_ascii_uppercase()) == Some(negative_ref))
        .unwrap_or(false);

    Ok(if negative { -magnitude } else { magnitude })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim_matches(|c: char| c == '\0' || c.is_whitespace()).is_empty())
}

/// Trim whitespace and NUL padding; empty becomes None
fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
