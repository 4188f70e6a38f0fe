//! # edgequake-ocr2md
//!
//! Convert PDF documents to Markdown by combining OCR with iterative,
//! model-driven critique and correction.
//!
//! ## Why this crate?
//!
//! OCR alone gets the words mostly right but loses structure: headings,
//! tables and lists come out flat, and recognition errors go unnoticed. A
//! vision model alone reads structure well but can drop or invent text. This
//! crate anchors the model on the OCR text, then lets it critique and correct
//! its own output for a bounded number of rounds, and finally reasons over the
//! whole revision history to pick (or blend) the best version.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Render    rasterise selected pages via pdfium (spawn_blocking)
//!  ├─ 3. OCR       tesseract, retried; image kept on disk if it gives up
//!  ├─ 4. Convert   round 0: image + OCR text → Markdown
//!  ├─ 5. Refine    critique → correct, until converged or the round limit
//!  ├─ 6. Meta      reconcile all rounds; falls back to the latest round
//!  ├─ 7. Finalize  (optional) strip model commentary
//!  ├─ 8. Translate (optional) translate the final text
//!  └─ 9. Output    assembled Markdown, per-page status and history
//! ```
//!
//! Pages run concurrently and independently. Every generation call shares one
//! retry policy, one in-flight limit, and one cancellation token.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr2md::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .max_refinement_rounds(2)
//!         .build()?;
//!     let output = convert("document.pdf", &config).await?;
//!     println!("{}", output.markdown);
//!     eprintln!(
//!         "{} succeeded, {} failed, {} generation calls",
//!         output.stats.succeeded_pages, output.stats.failed_pages, output.stats.generation_calls
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Custom backends
//!
//! [`Pipeline`] takes its rasteriser, OCR engine and text generator as trait
//! objects ([`Services`]), so any of them can be replaced:
//!
//! ```rust,no_run
//! # use edgequake_ocr2md::*;
//! # use tokio_util::sync::CancellationToken;
//! # async fn run(services: Services) -> Result<(), Ocr2MdError> {
//! let pipeline = Pipeline::new(ConversionConfig::default(), services)
//!     .with_sink(std::sync::Arc::new(DirectorySink::new("out")));
//! let cancel = CancellationToken::new();
//! let output = pipeline.run("document.pdf", cancel).await?;
//! # Ok(()) }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr2md` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod output;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, PageSelection, PageSeparator};
pub use convert::{
    convert, convert_sync, convert_to_file, inspect, inspect_with, Pipeline, Services,
};
pub use document::{CandidateHistory, Document, FinalMarkdown, MarkdownCandidate, Selection};
pub use error::{GenerationServiceError, Ocr2MdError, OcrEngineError, PageError};
pub use output::{ConversionOutput, ConversionStats, DocumentMetadata, PageResult, PageStatus};
pub use persist::{ArtifactSink, DirectorySink, StatusRecord};
pub use pipeline::generate::{GenerationRequest, TextGenerator};
pub use pipeline::ocr::OcrBackend;
pub use pipeline::render::{PageImage, Rasterizer};
pub use progress::{ConversionProgressCallback, ProgressCallback, Stage};
