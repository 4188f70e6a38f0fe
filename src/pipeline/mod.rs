//! Pipeline stages for OCR-assisted PDF-to-Markdown conversion.
//!
//! Each submodule owns one step; the orchestrator in [`crate::convert`] runs
//! them in a fixed order per page.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ ocr ──▶ markdown ──▶ refine ──▶ meta ──▶ (translate)
//! (path/URL) (pdfium) (tesseract) (round 0) (rounds 1..N) (final)
//! ```
//!
//! Every generation call from every stage goes through one
//! [`retry::RetryExecutor`], which owns the backoff policy, the shared
//! [`throttle::Throttle`] and the run's cancellation token. The service
//! itself sits behind [`generate::TextGenerator`]; the OCR engine behind
//! [`ocr::OcrBackend`]; rasterisation behind [`render::Rasterizer`].
//!
//! 1. [`input`]  canonicalise the user-supplied path or URL to a local file
//! 2. [`render`] rasterise selected pages; pdfium runs in `spawn_blocking`
//! 3. [`ocr`]    recognise raw text, retried, image preserved on failure
//! 4. [`markdown`] initial conversion from image + OCR text
//! 5. [`refine`] critique-and-correct loop, bounded by a round limit
//! 6. [`meta`]   reconcile the full history, falling back to the latest round
//! 7. [`translate`] optional translation of the final text

pub mod encode;
pub mod generate;
pub mod input;
pub mod markdown;
pub mod meta;
pub mod ocr;
pub mod postprocess;
pub mod refine;
pub mod render;
pub mod retry;
pub mod throttle;
pub mod translate;
