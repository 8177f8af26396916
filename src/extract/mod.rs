//! Text extraction collaborator.
//!
//! Answer documents arrive as raw bytes plus a content type. Scanned PDFs
//! and images need an OCR service behind [`TextExtractor`]; the built-in
//! [`PlainTextExtractor`] handles text-based uploads.

use crate::error::{GradingError, GradingResult};
use async_trait::async_trait;

/// Turns uploaded file bytes into raw text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text, failing on unsupported content types or unreadable bytes.
    async fn extract(&self, bytes: &[u8], content_type: &str) -> GradingResult<String>;
}

/// Content types the plain text extractor understands.
const TEXT_CONTENT_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/csv",
    "text/html",
    "application/json",
];

/// Extractor for uploads that already are text.
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn supports(content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        TEXT_CONTENT_TYPES.contains(&essence.as_str())
    }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], content_type: &str) -> GradingResult<String> {
        if !Self::supports(content_type) {
            return Err(GradingError::Extraction(format!(
                "unsupported content type {}",
                content_type
            )));
        }

        let text = std::str::from_utf8(bytes)
            .map_err(|e| GradingError::Extraction(format!("not valid UTF-8: {}", e)))?;

        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}
