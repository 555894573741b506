//! Photo folder scanner
//!
//! Finds JPEG/PNG files in a folder and turns each into a [`PhotoInput`]
//! with its raw EXIF attached. Extraction failures stay local to the photo:
//! the error is carried on the input and the pipeline marks it `error`.
//!
//! Keywords a photo already has live in a plain-text sidecar next to it
//! (`IMG_0042.jpg` -> `IMG_0042.keywords`), one keyword per line or
//! comma-separated. Lines starting with `#` are comments.

use crate::metadata::ExifReader;
use crate::types::{ExistingTag, PhotoInput};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Extension of the existing-keyword sidecar
pub const KEYWORD_SIDECAR_EXT: &str = "keywords";

/// Photo id length in hex characters
const ID_HEX_LEN: usize = 16;

/// Folder scan errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Cannot read a photo file
    #[error("File access error {0}: {1}")]
    FileAccess(PathBuf, String),
}

/// Photo file scanner
pub struct PhotoScanner {
    ignore_patterns: Vec<String>,
    recursive: bool,
}

impl Default for PhotoScanner {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PhotoScanner {
    /// Create a scanner; non-recursive scans only look at the folder itself
    pub fn new(recursive: bool) -> Self {
        Self {
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
            ],
            recursive,
        }
    }

    /// List photo files under `root`, sorted by path
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let mut symlink_visited = HashSet::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(if self.recursive { usize::MAX } else { 1 })
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e, &mut symlink_visited));

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && is_photo_path(entry.path()) {
                        files.push(entry.path().to_path_buf());
                    }
                }
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                }
            }
        }

        files.sort();
        tracing::debug!(root = %root.display(), photos = files.len(), "Scan complete");
        Ok(files)
    }

    fn should_process_entry(&self, entry: &DirEntry, symlink_visited: &mut HashSet<PathBuf>) -> bool {
        let file_name = entry.file_name().to_string_lossy();
        if entry.depth() > 0 && self.ignore_patterns.iter().any(|p| file_name.contains(p)) {
            return false;
        }

        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !symlink_visited.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }

        true
    }
}

/// Extension check, case-insensitive
pub fn is_photo_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PHOTO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Content-derived photo id: leading hex digits of the SHA-256
pub fn content_id(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    digest[..ID_HEX_LEN].to_string()
}

/// Sidecar holding the keywords `photo` already has
pub fn sidecar_path(photo: &Path) -> PathBuf {
    photo.with_extension(KEYWORD_SIDECAR_EXT)
}

/// Keywords from sidecar text, first spelling wins on case-insensitive repeats
pub fn parse_keyword_sidecar(text: &str) -> Vec<ExistingTag> {
    let mut tags: Vec<ExistingTag> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        for name in line.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !tags.iter().any(|t| t.name.eq_ignore_ascii_case(name)) {
                tags.push(ExistingTag::new(name));
            }
        }
    }
    tags
}

/// Existing keywords for `photo`; no sidecar means none
async fn read_existing_tags(photo: &Path) -> Result<Vec<ExistingTag>, ScanError> {
    let sidecar = sidecar_path(photo);
    match tokio::fs::read_to_string(&sidecar).await {
        Ok(text) => {
            let tags = parse_keyword_sidecar(&text);
            tracing::debug!(sidecar = %sidecar.display(), keywords = tags.len(), "Existing keywords loaded");
            Ok(tags)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ScanError::FileAccess(sidecar, e.to_string())),
    }
}

/// Read one photo, attach its raw EXIF and its sidecar keywords
///
/// # Errors
/// `ScanError::FileAccess` if the photo or an existing sidecar cannot be
/// read. EXIF problems are not errors here; they travel on the returned input.
pub async fn load_photo_input(path: &Path, reader: &dyn ExifReader) -> Result<PhotoInput, ScanError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;

    let mut input = PhotoInput::new(content_id(&bytes), path)
        .with_existing_tags(read_existing_tags(path).await?);
    match reader.extract(&bytes) {
        Ok(exif) => input.exif = Some(exif),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "EXIF extraction failed");
            input.exif_error = Some(e.to_string());
        }
    }
    Ok(input)
}
