//! Error types for the edgequake-ocr2md library.
//!
//! Three tiers, one per failure scope:
//!
//! * [`Ocr2MdError`]: **Fatal**: the run cannot start (bad input file,
//!   unparseable PDF, page selection out of bounds, provider not configured).
//!   Returned as `Err(Ocr2MdError)` from the top-level `convert*` functions
//!   before any page is processed.
//!
//! * [`PageError`]: **Non-fatal**: one page failed (OCR engine missing,
//!   generation retries exhausted, run cancelled) while its siblings carry on.
//!   Stored inside [`crate::output::PageResult`] as the failure reason.
//!
//! * [`GenerationServiceError`] / [`OcrEngineError`]: the contracts of the two
//!   external services. The retry layer classifies these and maps exhausted
//!   attempts onto a [`PageError`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr2md library.
#[derive(Debug, Error)]
pub enum Ocr2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// The PDF could not be parsed (corrupt, encrypted, unsupported).
    #[error("Invalid document '{path}': {detail}")]
    InvalidDocument { path: PathBuf, detail: String },

    /// The requested page selection references pages outside the document.
    #[error("Page selection error: {detail} (document has {total} pages)")]
    PageRange { detail: String, total: usize },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Service errors ────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page; the reason a page is not `succeeded`.
///
/// The overall run continues; sibling pages are never affected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The OCR backend could not be invoked.
    #[error("Page {page}: OCR engine unavailable after {attempts} attempts: {detail}")]
    OcrUnavailable {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The OCR backend ran but recognition failed.
    #[error("Page {page}: OCR failed after {attempts} attempts: {detail}")]
    OcrFailure {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The generation service failed after all retries.
    #[error("Page {page}: {stage} generation failed after {attempts} attempts: {detail}")]
    GenerationError {
        page: usize,
        stage: String,
        attempts: u32,
        detail: String,
    },

    /// The generation service kept throttling after all retries.
    #[error("Page {page}: {stage} rate limited after {attempts} attempts")]
    RateLimited {
        page: usize,
        stage: String,
        attempts: u32,
    },

    /// The request was rejected as malformed; retrying cannot help.
    #[error("Page {page}: {stage} request rejected: {detail}")]
    InvalidRequest {
        page: usize,
        stage: String,
        detail: String,
    },

    /// The run was cancelled before this page finished.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// 1-indexed page the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::OcrUnavailable { page, .. }
            | PageError::OcrFailure { page, .. }
            | PageError::GenerationError { page, .. }
            | PageError::RateLimited { page, .. }
            | PageError::InvalidRequest { page, .. }
            | PageError::Cancelled { page } => *page,
        }
    }

    /// Short machine-readable reason, used in the status record.
    pub fn reason(&self) -> &'static str {
        match self {
            PageError::RenderFailed { .. } => "RenderFailed",
            PageError::OcrUnavailable { .. } => "OcrUnavailable",
            PageError::OcrFailure { .. } => "OcrFailure",
            PageError::GenerationError { .. } => "GenerationError",
            PageError::RateLimited { .. } => "RateLimited",
            PageError::InvalidRequest { .. } => "InvalidRequest",
            PageError::Cancelled { .. } => "Cancelled",
        }
    }
}

/// Failure modes of the text-generation service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationServiceError {
    /// Backend down, timed out, or returned a 5xx.
    #[error("generation service unavailable: {0}")]
    ServiceUnavailable(String),

    /// HTTP 429 or provider-side throttling.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {:.1}s)", d.as_secs_f64())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Malformed request (empty prompt, unknown model, auth rejected).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Failure modes of the OCR backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OcrEngineError {
    /// The engine binary or library is not installed / cannot be spawned.
    #[error("OCR engine missing: {0}")]
    EngineMissing(String),

    /// The engine ran but could not recognise the image.
    #[error("recognition failed: {0}")]
    RecognitionFailed(String),
}
