//! Upload intake.
//!
//! Walks a directory of answer documents and turns every acceptable file
//! into an [`UploadedFile`] with a content type derived from its extension.

use crate::models::UploadedFile;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Configuration for upload scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Lowercase extension (without dot) to content type.
    pub content_types: BTreeMap<String, String>,
    /// File or directory names to skip.
    pub excludes: Vec<String>,
    /// Maximum file size in bytes
    pub max_file_size: u64,
}

/// Extensions accepted out of the box.
pub fn default_content_types() -> BTreeMap<String, String> {
    [
        ("txt", "text/plain"),
        ("md", "text/markdown"),
        ("csv", "text/csv"),
        ("html", "text/html"),
        ("htm", "text/html"),
        ("json", "application/json"),
    ]
    .into_iter()
    .map(|(ext, ty)| (ext.to_string(), ty.to_string()))
    .collect()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            content_types: default_content_types(),
            excludes: vec!["__MACOSX".to_string(), "Thumbs.db".to_string()],
            max_file_size: 5 * 1024 * 1024, // 5MB
        }
    }
}

impl From<&crate::config::IntakeConfig> for ScanConfig {
    fn from(config: &crate::config::IntakeConfig) -> Self {
        Self {
            content_types: config
                .content_types
                .iter()
                .map(|(ext, ty)| (ext.to_lowercase(), ty.clone()))
                .collect(),
            excludes: config.excludes.clone(),
            max_file_size: config.max_file_size,
        }
    }
}

/// Finds answer documents below an upload directory.
pub struct UploadScanner {
    config: ScanConfig,
    root: PathBuf,
}

impl UploadScanner {
    pub fn new(root: PathBuf, config: ScanConfig) -> Self {
        Self { config, root }
    }

    /// All acceptable files, sorted by path so attach order is stable.
    pub fn scan(&self) -> Result<Vec<UploadedFile>> {
        if !self.root.is_dir() {
            bail!("Upload directory not found: {}", self.root.display());
        }

        let mut files: Vec<UploadedFile> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_excluded(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.accept(entry.path()))
            .collect();

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Found {} uploads in {}", files.len(), self.root.display());
        Ok(files)
    }

    /// Content type of `path` if it is an acceptable upload.
    pub fn content_type(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.config.content_types.get(&ext).map(String::as_str)
    }

    fn accept(&self, path: &Path) -> Option<UploadedFile> {
        let content_type = self.content_type(path)?;

        match path.metadata() {
            Ok(metadata) if metadata.len() <= self.config.max_file_size => {}
            Ok(metadata) => {
                debug!(
                    "Skipping {}: {} bytes exceeds limit",
                    path.display(),
                    metadata.len()
                );
                return None;
            }
            Err(_) => return None,
        }

        Some(UploadedFile {
            path: path.to_string_lossy().to_string(),
            content_type: content_type.to_string(),
        })
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();

        // Hidden files
        if name.starts_with('.') {
            return true;
        }

        self.config.excludes.iter().any(|pattern| name == pattern.as_str())
    }
}
