//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as each page moves through OCR, conversion, refinement and
//! meta-reasoning. Pages run concurrently, so every method may be called from
//! several tasks at once; implementations guard shared state themselves.

use crate::output::PageStatus;
use std::sync::Arc;

/// Pipeline stage a page has just entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ocr,
    Convert,
    Critique,
    Refine,
    Meta,
    Finalize,
    Translate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ocr => "ocr",
            Stage::Convert => "convert",
            Stage::Critique => "critique",
            Stage::Refine => "refine",
            Stage::Meta => "meta",
            Stage::Finalize => "finalize",
            Stage::Translate => "translate",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called by the pipeline as it processes each page.
///
/// All methods have no-op defaults so callers only override what they need.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after input validation, before any page work.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page enters a stage.
    fn on_stage(&self, page_num: usize, stage: Stage) {
        let _ = (page_num, stage);
    }

    /// Called after each refinement round is appended to a page's history.
    fn on_round(&self, page_num: usize, round: u32) {
        let _ = (page_num, round);
    }

    /// Called once per page with its final status.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, status: &PageStatus) {
        let _ = (page_num, total_pages, status);
    }

    /// Called once after every page has reported.
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
