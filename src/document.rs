//! Run-scoped data model: the document, its pages, and each page's
//! candidate history.
//!
//! A [`Document`] is created once per run and shared read-only by every page
//! worker. A [`Page`] is owned by exactly one worker; its OCR text and final
//! markdown are write-once, and its [`CandidateHistory`] is append-only with
//! contiguous round numbers starting at 0.

use crate::output::DocumentMetadata;
use crate::pipeline::render::PageImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Immutable reference shared by all page workers for the run's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier derived from the source file name, e.g. `report`.
    pub id: String,
    /// The user-supplied path or URL.
    pub source: String,
    /// Total number of pages in the PDF.
    pub page_count: usize,
    /// 1-indexed pages selected for this run, ascending.
    pub selected_pages: Vec<usize>,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(
        source: impl Into<String>,
        local_path: &Path,
        metadata: DocumentMetadata,
        selected_pages: Vec<usize>,
    ) -> Self {
        Self {
            id: document_id(local_path),
            source: source.into(),
            page_count: metadata.page_count,
            selected_pages,
            metadata,
        }
    }
}

/// Derive a filesystem-safe identifier from a PDF path: `data/My Report.pdf` → `My_Report`.
pub fn document_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let id: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() {
        "document".to_string()
    } else {
        id
    }
}

/// Which stage produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStage {
    /// Round 0: initial conversion from image + OCR text.
    Initial,
    /// Rounds 1..N: produced by the feedback loop.
    Refined,
    /// Produced by the meta-reasoner from the full history.
    Meta,
}

/// One version of a page's markdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownCandidate {
    pub round: u32,
    pub text: String,
    /// The critique that led to this round (`None` for round 0).
    pub critique: Option<String>,
    pub stage: CandidateStage,
}

/// Append-only, gap-free sequence of candidates for a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateHistory {
    rounds: Vec<MarkdownCandidate>,
}

impl CandidateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the initial conversion as round 0.
    ///
    /// Returns `None` if the history already has a round 0.
    pub fn push_initial(&mut self, text: String) -> Option<&MarkdownCandidate> {
        if !self.rounds.is_empty() {
            return None;
        }
        self.rounds.push(MarkdownCandidate {
            round: 0,
            text,
            critique: None,
            stage: CandidateStage::Initial,
        });
        self.rounds.last()
    }

    /// Append the next refinement round. The round number is assigned here,
    /// so callers cannot create gaps or reorder.
    ///
    /// Returns `None` if there is no round 0 yet.
    pub fn push_refined(&mut self, text: String, critique: String) -> Option<&MarkdownCandidate> {
        let round = self.rounds.len() as u32;
        if round == 0 {
            return None;
        }
        self.rounds.push(MarkdownCandidate {
            round,
            text,
            critique: Some(critique),
            stage: CandidateStage::Refined,
        });
        self.rounds.last()
    }

    pub fn latest(&self) -> Option<&MarkdownCandidate> {
        self.rounds.last()
    }

    pub fn as_slice(&self) -> &[MarkdownCandidate] {
        &self.rounds
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Number of refinement rounds appended after round 0.
    pub fn refinement_rounds(&self) -> u32 {
        self.rounds.len().saturating_sub(1) as u32
    }

    pub fn into_vec(self) -> Vec<MarkdownCandidate> {
        self.rounds
    }
}

/// How the final markdown of a page was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "round", rename_all = "snake_case")]
pub enum Selection {
    /// The meta-reasoner picked this round verbatim.
    Round(u32),
    /// The meta-reasoner blended several rounds.
    Synthesized,
    /// Meta-reasoning was unavailable; the latest round was used.
    Fallback(u32),
}

/// Write-once result of the meta-reasoning stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalMarkdown {
    pub text: String,
    pub selection: Selection,
    pub stage: CandidateStage,
}

/// Attempted a second write to a write-once page field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageStateError {
    #[error("page {0}: OCR text already recorded")]
    OcrAlreadySet(usize),
    #[error("page {0}: final markdown already set")]
    FinalAlreadySet(usize),
}

/// One page of the run, owned by a single worker.
#[derive(Debug)]
pub struct Page {
    number: usize,
    image: Option<PageImage>,
    ocr_text: Option<String>,
    history: CandidateHistory,
    final_markdown: Option<FinalMarkdown>,
}

impl Page {
    pub fn new(number: usize, image: PageImage) -> Self {
        Self {
            number,
            image: Some(image),
            ocr_text: None,
            history: CandidateHistory::new(),
            final_markdown: None,
        }
    }

    /// 1-indexed page number.
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn image(&self) -> Option<&PageImage> {
        self.image.as_ref()
    }

    pub fn ocr_text(&self) -> Option<&str> {
        self.ocr_text.as_deref()
    }

    /// Record the OCR text. Write-once.
    pub fn set_ocr_text(&mut self, text: String) -> Result<(), PageStateError> {
        if self.ocr_text.is_some() {
            return Err(PageStateError::OcrAlreadySet(self.number));
        }
        self.ocr_text = Some(text);
        Ok(())
    }

    pub fn history(&self) -> &CandidateHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut CandidateHistory {
        &mut self.history
    }

    pub fn final_markdown(&self) -> Option<&FinalMarkdown> {
        self.final_markdown.as_ref()
    }

    /// Record the final markdown. Write-once.
    pub fn set_final(&mut self, final_markdown: FinalMarkdown) -> Result<(), PageStateError> {
        if self.final_markdown.is_some() {
            return Err(PageStateError::FinalAlreadySet(self.number));
        }
        self.final_markdown = Some(final_markdown);
        Ok(())
    }

    /// Keep the page image on disk for manual inspection and return its path.
    pub fn preserve_image(&mut self) -> Option<PathBuf> {
        self.image.take().and_then(|img| img.preserve().ok())
    }

    /// Release the raster image (deletes its temp file).
    pub fn release_image(&mut self) {
        self.image = None;
    }

    /// Tear down the page, returning OCR text, history and final markdown.
    pub fn into_parts(self) -> (Option<String>, CandidateHistory, Option<FinalMarkdown>) {
        (self.ocr_text, self.history, self.final_markdown)
    }
}
