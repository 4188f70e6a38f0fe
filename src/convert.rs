//! Pipeline Orchestrator: run every stage per page, pages concurrently.
//!
//! ## Run phases
//!
//! 1. **Validate** (fatal on error): resolve the input, read the page count,
//!    resolve the page selection. Nothing is rendered or sent to a service
//!    until these succeed.
//! 2. **Render** the selected pages in one pdfium pass.
//! 3. **Per page** (concurrently, `buffer_unordered(concurrency)`):
//!    OCR → convert → refine → meta → (finalize) → (translate) → persist.
//!    A page never affects its siblings; every failure is recorded on the
//!    page's own [`PageResult`].
//! 4. **Assemble** the document markdown in page order and write the status
//!    record.
//!
//! The orchestrator receives its [`ConversionConfig`] and [`Services`] at
//! construction and reads no process-wide state while running.

use crate::config::ConversionConfig;
use crate::document::{Document, Page};
use crate::error::{Ocr2MdError, PageError};
use crate::output::{ConversionOutput, ConversionStats, DocumentMetadata, PageResult, PageStatus};
use crate::persist::{write_atomic, ArtifactSink};
use crate::pipeline::generate::{LlmGenerator, ModelSettings, TextGenerator};
use crate::pipeline::ocr::{OcrBackend, TesseractOcr};
use crate::pipeline::refine::{RefineOutcome, Refiner};
use crate::pipeline::render::{PageImage, PdfiumRasterizer, Rasterizer};
use crate::pipeline::retry::{CallTally, RetryExecutor, RetryPolicy};
use crate::pipeline::throttle::Throttle;
use crate::pipeline::{encode, input, markdown, meta, ocr, translate};
use crate::progress::Stage;
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The three external collaborators of a run.
#[derive(Clone)]
pub struct Services {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub ocr: Arc<dyn OcrBackend>,
    pub generator: Arc<dyn TextGenerator>,
}

impl Services {
    /// Production backends: pdfium, tesseract, and the configured LLM provider.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, Ocr2MdError> {
        let provider = resolve_provider(config)?;
        Ok(Self {
            rasterizer: Arc::new(PdfiumRasterizer::new(config.max_rendered_pixels)),
            ocr: Arc::new(TesseractOcr::new(config.tesseract_path.clone())),
            generator: Arc::new(LlmGenerator::new(
                provider,
                Duration::from_secs(config.api_timeout_secs),
            )),
        })
    }
}

/// A configured pipeline, reusable across runs.
pub struct Pipeline {
    config: ConversionConfig,
    services: Services,
    sink: Option<Arc<dyn ArtifactSink>>,
}

/// Per-run state shared read-only by the page workers.
struct RunContext<'a> {
    document: &'a Document,
    exec: RetryExecutor,
    model: ModelSettings,
    total: usize,
}

impl Pipeline {
    pub fn new(config: ConversionConfig, services: Services) -> Self {
        Self {
            config,
            services,
            sink: None,
        }
    }

    /// Hand every finished page and the final output to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Convert `input` (local path or URL).
    ///
    /// Returns `Err` only for input validation failures and for a failure to
    /// write the final status record. Page-level failures, including
    /// cancellation, are reported inside the output.
    pub async fn run(
        &self,
        input_str: &str,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, Ocr2MdError> {
        let total_start = Instant::now();
        info!("Starting conversion: {}", input_str);

        // ── Validate ─────────────────────────────────────────────────────
        let resolved = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        let pdf_path = resolved.path().to_path_buf();

        let metadata = self.services.rasterizer.inspect(&pdf_path).await?;
        let selected = self.config.pages.resolve(metadata.page_count)?;
        let document = Document::new(input_str, &pdf_path, metadata, selected.clone());
        info!(
            "Document '{}': {} pages, {} selected",
            document.id,
            document.page_count,
            selected.len()
        );

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_conversion_start(selected.len());
        }

        // ── Render ───────────────────────────────────────────────────────
        let render_start = Instant::now();
        let rendered: Vec<Result<PageImage, PageError>> = tokio::select! {
            biased;
            _ = cancel.cancelled() => selected
                .iter()
                .map(|&page| Err(PageError::Cancelled { page }))
                .collect(),
            r = self.services.rasterizer.render(&pdf_path, &selected, self.config.dpi) => r?,
        };
        if rendered.len() != selected.len() {
            return Err(Ocr2MdError::Internal(format!(
                "rasteriser returned {} images for {} pages",
                rendered.len(),
                selected.len()
            )));
        }
        let render_duration_ms = render_start.elapsed().as_millis() as u64;
        debug!("Rendered {} pages in {}ms", rendered.len(), render_duration_ms);

        // ── Per-page pipeline ────────────────────────────────────────────
        let ctx = RunContext {
            document: &document,
            exec: RetryExecutor::new(
                Arc::clone(&self.services.generator),
                Arc::new(Throttle::new(
                    self.config.max_inflight_requests,
                    self.config.requests_per_minute,
                )),
                RetryPolicy::from_config(&self.config),
                cancel.clone(),
            ),
            model: ModelSettings::from_config(&self.config),
            total: selected.len(),
        };

        let pipeline_start = Instant::now();
        let mut pages: Vec<PageResult> = stream::iter(selected.iter().copied().zip(rendered))
            .map(|(page_num, image)| self.process_page(&ctx, page_num, image))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        drop(ctx);
        pages.sort_by_key(|p| p.page_num);
        let pipeline_duration_ms = pipeline_start.elapsed().as_millis() as u64;

        // ── Assemble ─────────────────────────────────────────────────────
        let markdown = assemble_document(&pages, &self.config);
        let stats = compute_stats(
            &document,
            &pages,
            render_duration_ms,
            pipeline_duration_ms,
            total_start.elapsed().as_millis() as u64,
        );

        info!(
            "Conversion complete: {} succeeded, {} partially refined, {} failed ({}ms)",
            stats.succeeded_pages,
            stats.partially_refined_pages,
            stats.failed_pages,
            stats.total_duration_ms
        );

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_conversion_complete(
                selected.len(),
                stats.succeeded_pages + stats.partially_refined_pages,
            );
        }

        let output = ConversionOutput {
            document,
            markdown,
            pages,
            stats,
        };

        if let Some(ref sink) = self.sink {
            sink.finish(&output).await?;
        }

        Ok(output)
    }

    async fn process_page(
        &self,
        ctx: &RunContext<'_>,
        page_num: usize,
        rendered: Result<PageImage, PageError>,
    ) -> PageResult {
        let start = Instant::now();

        let mut result = match rendered {
            Ok(image) => self.run_page(ctx, Page::new(page_num, image)).await,
            Err(e) => PageResult::failed(page_num, e),
        };
        result.duration_ms = start.elapsed().as_millis() as u64;

        match result.error {
            Some(ref e) if result.status == PageStatus::Failed => {
                warn!("Page {} failed: {}", page_num, e)
            }
            _ => info!(
                "Page {} {} ({} rounds, {}ms)",
                page_num,
                result.status,
                result.refinement_rounds(),
                result.duration_ms
            ),
        }

        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.persist_page(ctx.document, &result).await {
                warn!("Page {}: could not persist artifacts: {}", page_num, e);
            }
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_complete(page_num, ctx.total, &result.status);
        }
        result
    }

    /// Run OCR → convert → refine → meta → finalize → translate on one page.
    async fn run_page(&self, ctx: &RunContext<'_>, mut page: Page) -> PageResult {
        let page_num = page.number();
        let cancel = ctx.exec.cancel_token();
        let mut tally = CallTally::default();

        if cancel.is_cancelled() {
            return finish(page, PageStatus::Failed, Some(PageError::Cancelled { page: page_num }), None, None, None, tally);
        }

        // ── OCR ──────────────────────────────────────────────────────────
        self.stage(page_num, Stage::Ocr);
        let recognised = match page.image() {
            Some(image) => {
                ocr::extract(
                    self.services.ocr.as_ref(),
                    image,
                    &self.config.ocr_language,
                    self.config.ocr_retries,
                    ctx.exec.policy(),
                    cancel,
                    &mut tally,
                )
                .await
            }
            None => Err(PageError::RenderFailed {
                page: page_num,
                detail: "page image released before OCR".into(),
            }),
        };
        let ocr_text = match recognised {
            Ok(text) => text,
            Err(e) => {
                let preserved = match e {
                    PageError::Cancelled { .. } => None,
                    _ => page.preserve_image(),
                };
                if let Some(ref path) = preserved {
                    warn!("Page {}: image kept for inspection at {}", page_num, path.display());
                }
                return finish(page, PageStatus::Failed, Some(e), None, None, preserved, tally);
            }
        };
        if let Err(e) = page.set_ocr_text(ocr_text.clone()) {
            warn!("{}", e);
        }

        let image = page.image().map(|img| encode::image_data(img.png()));

        // ── Initial conversion ───────────────────────────────────────────
        self.stage(page_num, Stage::Convert);
        match markdown::convert(&ctx.exec, &ctx.model, page_num, image.as_ref(), &ocr_text, &mut tally).await {
            Ok(candidate) => {
                page.history_mut().push_initial(candidate.text);
            }
            Err(e) => return finish(page, PageStatus::Failed, Some(e), None, None, None, tally),
        }

        // ── Feedback loop ────────────────────────────────────────────────
        let refiner = Refiner {
            exec: &ctx.exec,
            model: &ctx.model,
            max_rounds: self.config.max_refinement_rounds,
            min_critique_chars: self.config.min_critique_chars,
            progress: self.config.progress_callback.as_ref(),
        };
        let report = refiner
            .run(page_num, image.as_ref(), &ocr_text, page.history_mut(), &mut tally)
            .await;
        if let Some(e @ PageError::Cancelled { .. }) = report.error {
            return finish(page, PageStatus::Failed, Some(e), Some(report.outcome), None, None, tally);
        }
        let (status, page_error) = match report.outcome {
            RefineOutcome::Aborted => (PageStatus::PartiallyRefined, report.error),
            RefineOutcome::Converged | RefineOutcome::MaxRoundsReached => (PageStatus::Succeeded, None),
        };

        // ── Meta-reasoning ───────────────────────────────────────────────
        self.stage(page_num, Stage::Meta);
        let reconciled = match meta::reconcile(
            &ctx.exec,
            &ctx.model,
            page_num,
            image.as_ref(),
            &ocr_text,
            page.history(),
            &mut tally,
        )
        .await
        {
            Ok(r) => r.final_markdown,
            Err(e) => return finish(page, PageStatus::Failed, Some(e), Some(report.outcome), None, None, tally),
        };

        let final_markdown = if self.config.finalize {
            self.stage(page_num, Stage::Finalize);
            match meta::finalize(&ctx.exec, &ctx.model, page_num, image.as_ref(), reconciled, &mut tally).await {
                Ok(f) => f,
                Err(e) => return finish(page, PageStatus::Failed, Some(e), Some(report.outcome), None, None, tally),
            }
        } else {
            reconciled
        };

        // ── Translation ──────────────────────────────────────────────────
        let translation = match self.config.translate_to {
            Some(ref language) => {
                self.stage(page_num, Stage::Translate);
                match translate::translate(
                    &ctx.exec,
                    &ctx.model,
                    page_num,
                    language,
                    image.as_ref(),
                    &final_markdown.text,
                    &mut tally,
                )
                .await
                {
                    Ok(t) => t,
                    Err(e) => return finish(page, PageStatus::Failed, Some(e), Some(report.outcome), None, None, tally),
                }
            }
            None => None,
        };

        if let Err(e) = page.set_final(final_markdown) {
            warn!("{}", e);
        }
        finish(page, status, page_error, Some(report.outcome), translation, None, tally)
    }

    fn stage(&self, page_num: usize, stage: Stage) {
        debug!("Page {}: {}", page_num, stage);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage(page_num, stage);
        }
    }
}

/// Tear a page down into its result. The raster image is released here.
///
/// A failed page never carries final markdown.
fn finish(
    page: Page,
    status: PageStatus,
    error: Option<PageError>,
    refine_outcome: Option<RefineOutcome>,
    translation: Option<String>,
    preserved_image: Option<std::path::PathBuf>,
    tally: CallTally,
) -> PageResult {
    let page_num = page.number();
    let (ocr_text, history, final_markdown) = page.into_parts();
    PageResult {
        page_num,
        status,
        error,
        ocr_text,
        candidates: history.into_vec(),
        refine_outcome,
        final_markdown: final_markdown.filter(|_| status.has_markdown()),
        translation,
        preserved_image,
        generation_calls: tally.calls,
        retries: tally.retries,
        duration_ms: 0,
    }
}

fn compute_stats(
    document: &Document,
    pages: &[PageResult],
    render_duration_ms: u64,
    pipeline_duration_ms: u64,
    total_duration_ms: u64,
) -> ConversionStats {
    let count = |status: PageStatus| pages.iter().filter(|p| p.status == status).count();
    ConversionStats {
        total_pages: document.page_count,
        selected_pages: pages.len(),
        succeeded_pages: count(PageStatus::Succeeded),
        partially_refined_pages: count(PageStatus::PartiallyRefined),
        failed_pages: count(PageStatus::Failed),
        generation_calls: pages.iter().map(|p| p.generation_calls as u64).sum(),
        retries: pages.iter().map(|p| p.retries as u64).sum(),
        render_duration_ms,
        pipeline_duration_ms,
        total_duration_ms,
    }
}

/// Join the markdown of every page that produced output, in page order.
fn assemble_document(pages: &[PageResult], config: &ConversionConfig) -> String {
    let mut out = String::new();
    for (i, (page_num, md)) in pages
        .iter()
        .filter_map(|p| p.markdown().map(|md| (p.page_num, md)))
        .enumerate()
    {
        if i > 0 {
            out.truncate(out.trim_end_matches('\n').len());
            out.push_str(&config.page_separator.render(page_num));
        }
        out.push_str(md);
    }
    out
}

// ── Convenience entry points ─────────────────────────────────────────────

/// Convert a PDF file or URL to Markdown with the production backends.
///
/// # Errors
/// Returns `Err(Ocr2MdError)` only for fatal errors: input not found or not a
/// PDF, unparseable document, page selection out of range, provider not
/// configured. Page-level failures are reported in the output.
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Ocr2MdError> {
    let services = Services::from_config(config)?;
    Pipeline::new(config.clone(), services)
        .run(input_str.as_ref(), CancellationToken::new())
        .await
}

/// Convert and write the assembled markdown to `output_path` atomically.
pub async fn convert_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionStats, Ocr2MdError> {
    let output = convert(input_str, config).await?;
    write_atomic(output_path.as_ref(), output.markdown.as_bytes()).await?;
    Ok(output.stats)
}

/// Synchronous wrapper around [`convert`].
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Ocr2MdError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Ocr2MdError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

/// Read PDF metadata without OCR or any generation call, using default settings.
pub async fn inspect(input_str: impl AsRef<str>) -> Result<DocumentMetadata, Ocr2MdError> {
    inspect_with(input_str, &ConversionConfig::default()).await
}

/// [`inspect`] honouring `config`'s download timeout and render cap.
pub async fn inspect_with(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<DocumentMetadata, Ocr2MdError> {
    let resolved = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    inspect_rasterizer(config).inspect(resolved.path()).await
}

fn inspect_rasterizer(config: &ConversionConfig) -> PdfiumRasterizer {
    PdfiumRasterizer::new(config.max_rendered_pixels)
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model`; the
///    factory reads that provider's API key from the environment.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **Auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, Ocr2MdError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, &config.model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Ocr2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                 Set GROQ_API_KEY, OPENAI_API_KEY, or pass --provider.\n\
                 Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Ocr2MdError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Ocr2MdError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}
