//! Result types returned by a conversion run.
//!
//! Every requested page is represented by exactly one [`PageResult`]; a page is
//! never silently dropped. Failed pages carry their [`PageError`] reason and,
//! when OCR gave up, the path of the preserved page image.

use crate::document::{Document, FinalMarkdown, MarkdownCandidate, Selection};
use crate::error::PageError;
use crate::pipeline::refine::RefineOutcome;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// PDF document metadata, as reported by the rasteriser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Terminal status of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageStatus {
    Succeeded,
    PartiallyRefined,
    Failed,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Succeeded => "succeeded",
            PageStatus::PartiallyRefined => "partially-refined",
            PageStatus::Failed => "failed",
        }
    }

    /// Whether the page produced usable markdown.
    pub fn has_markdown(&self) -> bool {
        !matches!(self, PageStatus::Failed)
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_num: usize,
    pub status: PageStatus,
    /// Reason for a non-`succeeded` status.
    pub error: Option<PageError>,
    /// Raw OCR text, recorded exactly once.
    pub ocr_text: Option<String>,
    /// Full candidate history in round order.
    pub candidates: Vec<MarkdownCandidate>,
    /// How the feedback loop ended, if it ran.
    pub refine_outcome: Option<RefineOutcome>,
    pub final_markdown: Option<FinalMarkdown>,
    /// Translated final markdown, when translation was requested and succeeded.
    pub translation: Option<String>,
    /// Page image kept on disk for manual inspection after an OCR failure.
    pub preserved_image: Option<PathBuf>,
    /// Successful and failed generation calls issued for this page.
    pub generation_calls: u32,
    /// Retries spent across all stages of this page.
    pub retries: u32,
    pub duration_ms: u64,
}

impl PageResult {
    /// A page that failed before producing any candidate.
    pub fn failed(page_num: usize, error: PageError) -> Self {
        Self {
            page_num,
            status: PageStatus::Failed,
            error: Some(error),
            ocr_text: None,
            candidates: Vec::new(),
            refine_outcome: None,
            final_markdown: None,
            translation: None,
            preserved_image: None,
            generation_calls: 0,
            retries: 0,
            duration_ms: 0,
        }
    }

    /// The page's final markdown, if any.
    pub fn markdown(&self) -> Option<&str> {
        self.final_markdown.as_ref().map(|f| f.text.as_str())
    }

    pub fn selection(&self) -> Option<Selection> {
        self.final_markdown.as_ref().map(|f| f.selection)
    }

    /// Number of refinement rounds appended after the initial conversion.
    pub fn refinement_rounds(&self) -> u32 {
        self.candidates.len().saturating_sub(1) as u32
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    /// Total pages in the PDF.
    pub total_pages: usize,
    /// Pages requested for this run.
    pub selected_pages: usize,
    pub succeeded_pages: usize,
    pub partially_refined_pages: usize,
    pub failed_pages: usize,
    pub generation_calls: u64,
    pub retries: u64,
    pub render_duration_ms: u64,
    pub pipeline_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The per-document result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub document: Document,
    /// Assembled markdown of every page that produced output, in page order.
    pub markdown: String,
    /// One entry per requested page, sorted by page number.
    pub pages: Vec<PageResult>,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    pub fn page(&self, page_num: usize) -> Option<&PageResult> {
        self.pages.iter().find(|p| p.page_num == page_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialises_kebab_case() {
        let json = serde_json::to_string(&PageStatus::PartiallyRefined).unwrap();
        assert_eq!(json, "\"partially-refined\"");
        assert_eq!(PageStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn failed_page_has_no_markdown() {
        let r = PageResult::failed(4, PageError::Cancelled { page: 4 });
        assert_eq!(r.status, PageStatus::Failed);
        assert!(r.markdown().is_none());
        assert_eq!(r.refinement_rounds(), 0);
        assert!(!r.status.has_markdown());
    }
}
