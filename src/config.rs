//! Configuration types for OCR-assisted PDF-to-Markdown conversion.
//!
//! Every knob of the pipeline lives in [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. The orchestrator receives the config at
//! construction and never reads process-wide state afterwards, so two runs with
//! the same config (and the same backends) behave identically.

use crate::error::Ocr2MdError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default generation model; a vision-capable Llama 4 served by Groq.
pub const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick-17b-128e-instruct";

/// Configuration for a single-document conversion run.
///
/// # Example
/// ```rust
/// use edgequake_ocr2md::{ConversionConfig, PageSelection};
///
/// let config = ConversionConfig::builder()
///     .dpi(200)
///     .pages(PageSelection::Set(vec![2]))
///     .max_refinement_rounds(2)
///     .concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_refinement_rounds, 2);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Rasterisation resolution in dots per inch. Default: 300.
    ///
    /// 300 DPI is what OCR engines are tuned for; lower values lose small
    /// glyphs, higher values mostly cost memory.
    pub dpi: u32,

    /// Cap on the longest rendered edge in pixels. Default: 4000.
    ///
    /// Independent of DPI: a poster-sized page at 300 DPI would otherwise
    /// allocate hundreds of megabytes of pixels.
    pub max_rendered_pixels: u32,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Upper bound on refinement rounds appended after the initial
    /// conversion. Default: 3. `0` disables the feedback loop.
    pub max_refinement_rounds: u32,

    /// Retries after the first attempt for every generation call. Default: 3.
    pub max_retries: u32,

    /// Initial backoff in milliseconds; doubles after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Retries after the first attempt for OCR. Default: 2.
    pub ocr_retries: u32,

    /// Number of pages processed concurrently. Default: 4.
    pub concurrency: usize,

    /// Global cap on in-flight generation calls across all pages. Default: 4.
    pub max_inflight_requests: usize,

    /// Optional requests-per-minute quota shared by all generation calls.
    pub requests_per_minute: Option<u32>,

    /// How long an in-flight external call may keep running after the run
    /// is cancelled before it is abandoned. Default: 2000 ms.
    pub cancel_grace_ms: u64,

    /// Generation model identifier. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// LLM provider name (e.g. "groq", "openai"). If None along with
    /// `provider`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per call. Default: 8192.
    pub max_tokens: usize,

    /// Per-call timeout for the generation service, in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// OCR language code passed to the engine. Default: "eng".
    pub ocr_language: String,

    /// Path or name of the tesseract binary. Default: "tesseract".
    pub tesseract_path: PathBuf,

    /// A critique body shorter than this many characters counts as
    /// "no meaningful change requested". Default: 24.
    pub min_critique_chars: usize,

    /// Run the cleanup pass that strips model commentary from the
    /// meta-reasoned markdown. Default: false.
    pub finalize: bool,

    /// Translate each page's final markdown into this language.
    pub translate_to: Option<String>,

    /// Page separator in the assembled document. Default: none.
    pub page_separator: PageSeparator,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 4000,
            pages: PageSelection::default(),
            max_refinement_rounds: 3,
            max_retries: 3,
            retry_backoff_ms: 500,
            ocr_retries: 2,
            concurrency: 4,
            max_inflight_requests: 4,
            requests_per_minute: None,
            cancel_grace_ms: 2000,
            model: DEFAULT_MODEL.to_string(),
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            api_timeout_secs: 120,
            ocr_language: "eng".to_string(),
            tesseract_path: PathBuf::from("tesseract"),
            min_critique_chars: 24,
            finalize: false,
            translate_to: None,
            page_separator: PageSeparator::default(),
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pages", &self.pages)
            .field("max_refinement_rounds", &self.max_refinement_rounds)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("ocr_retries", &self.ocr_retries)
            .field("concurrency", &self.concurrency)
            .field("max_inflight_requests", &self.max_inflight_requests)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("ocr_language", &self.ocr_language)
            .field("finalize", &self.finalize)
            .field("translate_to", &self.translate_to)
            .field("progress_callback", &self.progress_callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn max_refinement_rounds(mut self, n: u32) -> Self {
        self.config.max_refinement_rounds = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn ocr_retries(mut self, n: u32) -> Self {
        self.config.ocr_retries = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn max_inflight_requests(mut self, n: usize) -> Self {
        self.config.max_inflight_requests = n;
        self
    }

    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.config.requests_per_minute = Some(rpm);
        self
    }

    pub fn cancel_grace_ms(mut self, ms: u64) -> Self {
        self.config.cancel_grace_ms = ms;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn tesseract_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_path = path.into();
        self
    }

    pub fn min_critique_chars(mut self, n: usize) -> Self {
        self.config.min_critique_chars = n;
        self
    }

    pub fn finalize(mut self, v: bool) -> Self {
        self.config.finalize = v;
        self
    }

    pub fn translate_to(mut self, language: impl Into<String>) -> Self {
        self.config.translate_to = Some(language.into());
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Ocr2MdError> {
        let c = &self.config;
        if c.dpi == 0 || c.dpi > 1200 {
            return Err(Ocr2MdError::InvalidConfig(format!(
                "DPI must be 1–1200, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(Ocr2MdError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_inflight_requests == 0 {
            return Err(Ocr2MdError::InvalidConfig(
                "max_inflight_requests must be ≥ 1".into(),
            ));
        }
        if c.requests_per_minute == Some(0) {
            return Err(Ocr2MdError::InvalidConfig(
                "requests_per_minute must be ≥ 1 when set".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(Ocr2MdError::InvalidConfig("model must not be empty".into()));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(Ocr2MdError::InvalidConfig(
                "ocr_language must not be empty".into(),
            ));
        }
        if let PageSelection::Range(start, end) = c.pages {
            if start == 0 || start > end {
                return Err(Ocr2MdError::InvalidConfig(format!(
                    "Invalid page range {start}-{end}"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Specifies which pages of the PDF to convert (1-indexed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page.
    Single(usize),
    /// Convert a contiguous inclusive range.
    Range(usize, usize),
    /// Convert specific pages (deduplicated, sorted).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into sorted, deduplicated 1-indexed page numbers.
    ///
    /// Unlike a lenient clip, any page outside `1..=total_pages` is an error:
    /// the caller asked for something the document does not have.
    pub fn resolve(&self, total_pages: usize) -> Result<Vec<usize>, Ocr2MdError> {
        let out_of_range = |page: usize| Ocr2MdError::PageRange {
            detail: format!("page {page} is out of range"),
            total: total_pages,
        };

        let mut pages: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => vec![*p],
            PageSelection::Range(start, end) => {
                if start > end {
                    return Err(Ocr2MdError::PageRange {
                        detail: format!("range {start}-{end} is reversed"),
                        total: total_pages,
                    });
                }
                // Bounds first: the range is only expanded once it fits the document.
                if let Some(bad) = [*start, *end].into_iter().find(|&p| p == 0 || p > total_pages) {
                    return Err(out_of_range(bad));
                }
                (*start..=*end).collect()
            }
            PageSelection::Set(pages) => pages.clone(),
        };

        if let Some(&bad) = pages.iter().find(|&&p| p == 0 || p > total_pages) {
            return Err(out_of_range(bad));
        }

        pages.sort_unstable();
        pages.dedup();

        if pages.is_empty() {
            return Err(Ocr2MdError::PageRange {
                detail: "no pages selected".into(),
                total: total_pages,
            });
        }
        Ok(pages)
    }
}

/// How to separate pages in the assembled Markdown output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}
