//! Artifact persistence: where finished pages and the run status go.
//!
//! The orchestrator hands each page to an [`ArtifactSink`] as soon as the page
//! reaches a terminal status, then calls [`ArtifactSink::finish`] once with the
//! whole output. [`DirectorySink`] lays artifacts out per document:
//!
//! ```text
//! <root>/<doc_id>/markdowns/page_<n>.md      final markdown
//! <root>/<doc_id>/translations/page_<n>.md   translated markdown
//! <root>/<doc_id>/images/page_<n>.png        image kept after an OCR failure
//! <root>/<doc_id>/status.json                one record per requested page
//! ```
//!
//! Every file is written to a `.tmp` sibling and renamed into place, so a
//! reader never observes a half-written artifact.

use crate::document::{Document, Selection};
use crate::error::Ocr2MdError;
use crate::output::{ConversionOutput, ConversionStats, PageResult, PageStatus};
use crate::pipeline::refine::RefineOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Receives page results as they finish and the run output at the end.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn persist_page(&self, document: &Document, page: &PageResult) -> Result<(), Ocr2MdError>;

    async fn finish(&self, output: &ConversionOutput) -> Result<(), Ocr2MdError>;
}

/// Status record entry for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatusRecord {
    pub page: usize,
    pub status: PageStatus,
    /// Machine-readable reason for a non-`succeeded` status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Which round (or blend/fallback) became final.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refine_outcome: Option<RefineOutcome>,
    pub generation_calls: u32,
    pub retries: u32,
}

impl From<&PageResult> for PageStatusRecord {
    fn from(p: &PageResult) -> Self {
        Self {
            page: p.page_num,
            status: p.status,
            reason: p.error.as_ref().map(|e| e.reason().to_string()),
            detail: p.error.as_ref().map(|e| e.to_string()),
            selection: p.selection(),
            rounds: p.refinement_rounds(),
            refine_outcome: p.refine_outcome,
            generation_calls: p.generation_calls,
            retries: p.retries,
        }
    }
}

/// The `status.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub document: String,
    pub source: String,
    pub pages: Vec<PageStatusRecord>,
    pub stats: ConversionStats,
}

impl From<&ConversionOutput> for StatusRecord {
    fn from(output: &ConversionOutput) -> Self {
        Self {
            document: output.document.id.clone(),
            source: output.document.source.clone(),
            pages: output.pages.iter().map(PageStatusRecord::from).collect(),
            stats: output.stats.clone(),
        }
    }
}

/// Writes artifacts under `<root>/<doc_id>/`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn document_dir(&self, document: &Document) -> PathBuf {
        self.root.join(&document.id)
    }

    pub fn markdown_path(&self, document: &Document, page: usize) -> PathBuf {
        self.document_dir(document)
            .join("markdowns")
            .join(format!("page_{page}.md"))
    }

    pub fn translation_path(&self, document: &Document, page: usize) -> PathBuf {
        self.document_dir(document)
            .join("translations")
            .join(format!("page_{page}.md"))
    }

    pub fn image_path(&self, document: &Document, page: usize) -> PathBuf {
        self.document_dir(document)
            .join("images")
            .join(format!("page_{page}.png"))
    }

    pub fn status_path(&self, document: &Document) -> PathBuf {
        self.document_dir(document).join("status.json")
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn persist_page(&self, document: &Document, page: &PageResult) -> Result<(), Ocr2MdError> {
        if let Some(markdown) = page.markdown() {
            write_atomic(&self.markdown_path(document, page.page_num), markdown.as_bytes()).await?;
        }
        if let Some(ref translation) = page.translation {
            write_atomic(
                &self.translation_path(document, page.page_num),
                translation.as_bytes(),
            )
            .await?;
        }
        if let Some(ref preserved) = page.preserved_image {
            let bytes = tokio::fs::read(preserved)
                .await
                .map_err(|e| Ocr2MdError::OutputWriteFailed {
                    path: preserved.clone(),
                    source: e,
                })?;
            write_atomic(&self.image_path(document, page.page_num), &bytes).await?;
        }
        debug!("Persisted page {} ({})", page.page_num, page.status);
        Ok(())
    }

    async fn finish(&self, output: &ConversionOutput) -> Result<(), Ocr2MdError> {
        let record = StatusRecord::from(output);
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Ocr2MdError::Internal(format!("status serialisation: {e}")))?;
        write_atomic(&self.status_path(&output.document), &json).await
    }
}

/// Write `bytes` to `path` via a `.tmp` sibling and rename, creating parents.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Ocr2MdError> {
    let write_err = |e: std::io::Error| Ocr2MdError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CandidateStage, FinalMarkdown};
    use crate::error::PageError;
    use crate::output::DocumentMetadata;

    fn document() -> Document {
        Document::new(
            "in/report.pdf",
            Path::new("in/report.pdf"),
            DocumentMetadata {
                page_count: 2,
                ..Default::default()
            },
            vec![1, 2],
        )
    }

    fn succeeded(page: usize) -> PageResult {
        let mut r = PageResult::failed(page, PageError::Cancelled { page });
        r.status = PageStatus::Succeeded;
        r.error = None;
        r.final_markdown = Some(FinalMarkdown {
            text: format!("# Page {page}\n"),
            selection: Selection::Round(0),
            stage: CandidateStage::Meta,
        });
        r.translation = Some(format!("# Seite {page}\n"));
        r
    }

    #[tokio::test]
    async fn writes_page_layout_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let doc = document();

        let ok = succeeded(1);
        let failed = PageResult::failed(
            2,
            PageError::OcrFailure {
                page: 2,
                attempts: 3,
                detail: "blank".into(),
            },
        );
        sink.persist_page(&doc, &ok).await.unwrap();
        sink.persist_page(&doc, &failed).await.unwrap();

        let md = std::fs::read_to_string(dir.path().join("report/markdowns/page_1.md")).unwrap();
        assert_eq!(md, "# Page 1\n");
        let tr = std::fs::read_to_string(dir.path().join("report/translations/page_1.md")).unwrap();
        assert_eq!(tr, "# Seite 1\n");
        assert!(!dir.path().join("report/markdowns/page_2.md").exists());

        let output = ConversionOutput {
            document: doc,
            markdown: "# Page 1\n".into(),
            pages: vec![ok, failed],
            stats: ConversionStats::default(),
        };
        sink.finish(&output).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("report/status.json")).unwrap();
        let status: StatusRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(status.pages.len(), 2);
        assert_eq!(status.pages[0].status, PageStatus::Succeeded);
        assert_eq!(status.pages[0].selection, Some(Selection::Round(0)));
        assert_eq!(status.pages[1].reason.as_deref(), Some("OcrFailure"));
    }

    #[tokio::test]
    async fn preserved_image_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let doc = document();

        let src = dir.path().join("kept.png");
        std::fs::write(&src, b"\x89PNG").unwrap();
        let mut failed = PageResult::failed(
            2,
            PageError::OcrUnavailable {
                page: 2,
                attempts: 3,
                detail: "missing".into(),
            },
        );
        failed.preserved_image = Some(src);
        sink.persist_page(&doc, &failed).await.unwrap();

        let copied = std::fs::read(dir.path().join("report/images/page_2.png")).unwrap();
        assert_eq!(copied, b"\x89PNG");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.md");
        write_atomic(&path, b"hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!dir.path().join("nested/out.md.tmp").exists());
    }
}
