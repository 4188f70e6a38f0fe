//! OCR Extractor: page image → raw text.
//!
//! The OCR text is a hint for the generation stages, not the final output, so
//! recognition runs once per page with plain engine defaults. Tesseract is
//! driven as a subprocess (`tesseract <png> stdout -l <lang>`) because the
//! page PNG already sits in a temp file; `kill_on_drop` makes an abandoned
//! call after cancellation reap the child process.

use crate::error::{OcrEngineError, PageError};
use crate::pipeline::render::PageImage;
use crate::pipeline::retry::{sleep_or_cancel, with_grace, CallTally, RetryPolicy};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `recognize(image, language) -> text`.
///
/// Implementations must be deterministic for identical image bytes and
/// language.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize(&self, image: &PageImage, language: &str) -> Result<String, OcrEngineError>;
}

/// Tesseract CLI backend.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: PathBuf,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl OcrBackend for TesseractOcr {
    async fn recognize(&self, image: &PageImage, language: &str) -> Result<String, OcrEngineError> {
        let output = Command::new(&self.binary)
            .arg(image.path())
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                OcrEngineError::EngineMissing(format!("{}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrEngineError::RecognitionFailed(format!(
                "exit {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        // Tesseract terminates each page with a form feed.
        Ok(String::from_utf8_lossy(&output.stdout).replace('\x0c', ""))
    }
}

/// Run OCR for one page with `retries` extra attempts.
///
/// Exhaustion maps onto [`PageError::OcrUnavailable`] (engine could not be
/// invoked) or [`PageError::OcrFailure`] (engine ran, recognition failed).
pub async fn extract(
    backend: &dyn OcrBackend,
    image: &PageImage,
    language: &str,
    retries: u32,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    tally: &mut CallTally,
) -> Result<String, PageError> {
    let page = image.page_num();
    let max_attempts = retries + 1;
    let mut last_err: Option<OcrEngineError> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = policy.delay_for(attempt - 1);
            warn!("Page {}: OCR retry {}/{} after {:?}", page, attempt - 1, retries, delay);
            tally.retries += 1;
            sleep_or_cancel(delay, cancel)
                .await
                .map_err(|_| PageError::Cancelled { page })?;
        }

        let result = with_grace(backend.recognize(image, language), cancel, policy.cancel_grace)
            .await
            .map_err(|_| PageError::Cancelled { page })?;

        match result {
            Ok(text) => {
                debug!("Page {}: OCR produced {} chars", page, text.len());
                return Ok(text);
            }
            Err(e) => {
                warn!("Page {}: OCR attempt {} failed: {}", page, attempt, e);
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(OcrEngineError::EngineMissing(detail)) => PageError::OcrUnavailable {
            page,
            attempts: max_attempts,
            detail,
        },
        Some(OcrEngineError::RecognitionFailed(detail)) => PageError::OcrFailure {
            page,
            attempts: max_attempts,
            detail,
        },
        None => PageError::OcrFailure {
            page,
            attempts: 0,
            detail: "no attempt was made".into(),
        },
    })
}
