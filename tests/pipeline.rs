//! Pipeline integration tests with in-process stub backends.
//!
//! The rasteriser, OCR engine and generation service are replaced by stubs,
//! so these run without pdfium, tesseract or network access. The input PDF
//! only needs the `%PDF` magic to pass input validation.

use async_trait::async_trait;
use edgequake_ocr2md::prompts::{
    CRITIQUE_SYSTEM_PROMPT, FINALIZE_SYSTEM_PROMPT, META_SYSTEM_PROMPT, TRANSLATE_SYSTEM_PROMPT,
};
use edgequake_ocr2md::{
    ConversionConfig, ConversionConfigBuilder, ConversionOutput, ConversionProgressCallback,
    DirectorySink, DocumentMetadata, GenerationRequest, GenerationServiceError, Ocr2MdError,
    OcrBackend, OcrEngineError, PageError, PageImage, PageSelection, PageStatus, Pipeline,
    Rasterizer, Selection, Services, StatusRecord, TextGenerator,
};
use edgequake_ocr2md::pipeline::refine::RefineOutcome;
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── Stubs ────────────────────────────────────────────────────────────────────

/// Renders blank pages and records which pages were requested.
struct StubRasterizer {
    pages: usize,
    broken: Vec<usize>,
    requested: Mutex<Vec<usize>>,
}

impl StubRasterizer {
    fn new(pages: usize) -> Self {
        Self {
            pages,
            broken: Vec::new(),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn requested(&self) -> Vec<usize> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rasterizer for StubRasterizer {
    async fn inspect(&self, _pdf_path: &Path) -> Result<DocumentMetadata, Ocr2MdError> {
        Ok(DocumentMetadata {
            page_count: self.pages,
            pdf_version: "1.7".into(),
            ..Default::default()
        })
    }

    async fn render(
        &self,
        _pdf_path: &Path,
        pages: &[usize],
        _dpi: u32,
    ) -> Result<Vec<Result<PageImage, PageError>>, Ocr2MdError> {
        self.requested.lock().unwrap().extend_from_slice(pages);
        let blank = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255])));
        Ok(pages
            .iter()
            .map(|&page| {
                if self.broken.contains(&page) {
                    return Err(PageError::RenderFailed {
                        page,
                        detail: "corrupt content stream".into(),
                    });
                }
                PageImage::from_image(page, &blank).map_err(|e| PageError::RenderFailed {
                    page,
                    detail: e.to_string(),
                })
            })
            .collect())
    }
}

/// Returns `Text of page N`, or a scripted failure for selected pages.
#[derive(Default)]
struct StubOcr {
    failures: HashMap<usize, OcrEngineError>,
    calls: AtomicUsize,
}

impl StubOcr {
    fn failing(page: usize, error: OcrEngineError) -> Self {
        Self {
            failures: HashMap::from([(page, error)]),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OcrBackend for StubOcr {
    async fn recognize(&self, image: &PageImage, _language: &str) -> Result<String, OcrEngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.get(&image.page_num()) {
            Some(e) => Err(e.clone()),
            None => Ok(format!("Text of page {}", image.page_num())),
        }
    }
}

/// Always returns the same text.
struct FixedOcr(&'static str);

#[async_trait]
impl OcrBackend for FixedOcr {
    async fn recognize(&self, _image: &PageImage, _language: &str) -> Result<String, OcrEngineError> {
        Ok(self.0.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Convert,
    Critique,
    Refine,
    Meta,
    Finalize,
    Translate,
}

fn role_of(req: &GenerationRequest) -> Role {
    match req.system.as_str() {
        s if s == CRITIQUE_SYSTEM_PROMPT => Role::Critique,
        s if s == META_SYSTEM_PROMPT => Role::Meta,
        s if s == FINALIZE_SYSTEM_PROMPT => Role::Finalize,
        s if s == TRANSLATE_SYSTEM_PROMPT => Role::Translate,
        _ if req.prompt.starts_with("Using the following feedback") => Role::Refine,
        _ => Role::Convert,
    }
}

/// Text after the `OCR Text:` marker of a conversion prompt.
fn ocr_of(prompt: &str) -> &str {
    prompt.split("OCR Text:\n").nth(1).unwrap_or_default()
}

type ReplyFn =
    dyn Fn(Role, &GenerationRequest) -> Result<String, GenerationServiceError> + Send + Sync;

/// Dispatches on the stage a request belongs to and logs every call.
struct StubGenerator {
    reply: Box<ReplyFn>,
    log: Mutex<Vec<Role>>,
}

impl StubGenerator {
    fn new(
        reply: impl Fn(Role, &GenerationRequest) -> Result<String, GenerationServiceError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Converts the OCR text under a heading, accepts it at once, picks round 1.
    fn agreeable() -> Arc<Self> {
        Self::new(|role, req| match role {
            Role::Convert => Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt))),
            Role::Critique => Ok("VERDICT: CONVERGED".into()),
            Role::Meta => Ok("SELECTED: 1\n".into()),
            Role::Translate => Ok(req.prompt.to_uppercase()),
            Role::Refine | Role::Finalize => Ok(req.prompt.clone()),
        })
    }

    /// Returns every prompt verbatim.
    fn echo() -> Arc<Self> {
        Self::new(|_, req| Ok(req.prompt.clone()))
    }

    fn calls(&self, role: Role) -> usize {
        self.log.lock().unwrap().iter().filter(|&&r| r == role).count()
    }

    fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationServiceError> {
        let role = role_of(request);
        self.log.lock().unwrap().push(role);
        (self.reply)(role, request)
    }
}

/// Never answers.
struct HangingGenerator;

#[async_trait]
impl TextGenerator for HangingGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationServiceError> {
        futures::future::pending::<()>().await;
        Ok(String::new())
    }
}

/// Records page completions.
#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    completed: Mutex<Vec<(usize, PageStatus)>>,
}

impl ConversionProgressCallback for Recorder {
    fn on_conversion_start(&self, total_pages: usize) {
        self.started.store(total_pages, Ordering::SeqCst);
    }

    fn on_page_complete(&self, page_num: usize, _total_pages: usize, status: &PageStatus) {
        self.completed.lock().unwrap().push((page_num, *status));
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Fixture {
    _dir: TempDir,
    pdf: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("scan.pdf");
        std::fs::write(&pdf, b"%PDF-1.7\n% stub document\n").unwrap();
        Self { _dir: dir, pdf }
    }

    fn input(&self) -> &str {
        self.pdf.to_str().unwrap()
    }
}

/// Millisecond backoff so retry paths finish quickly.
fn fast_config() -> ConversionConfigBuilder {
    ConversionConfig::builder()
        .max_retries(1)
        .retry_backoff_ms(1)
        .ocr_retries(1)
        .cancel_grace_ms(10)
        .model("stub-model")
}

fn services(
    rasterizer: Arc<StubRasterizer>,
    ocr: Arc<dyn OcrBackend>,
    generator: Arc<dyn TextGenerator>,
) -> Services {
    Services {
        rasterizer,
        ocr,
        generator,
    }
}

/// Pipeline logs through the test writer; filter with `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn run(
    config: ConversionConfig,
    rasterizer: Arc<StubRasterizer>,
    ocr: Arc<dyn OcrBackend>,
    generator: Arc<dyn TextGenerator>,
) -> ConversionOutput {
    init_logging();
    let fixture = Fixture::new();
    Pipeline::new(config, services(rasterizer, ocr, generator))
        .run(fixture.input(), CancellationToken::new())
        .await
        .expect("run should succeed")
}

fn assert_contiguous_rounds(output: &ConversionOutput) {
    for page in &output.pages {
        let rounds: Vec<u32> = page.candidates.iter().map(|c| c.round).collect();
        let expected: Vec<u32> = (0..page.candidates.len() as u32).collect();
        assert_eq!(rounds, expected, "page {} has gaps", page.page_num);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_service_runs_to_round_limit_and_keeps_ocr_text() {
    let generator = StubGenerator::echo();
    let config = fast_config().max_refinement_rounds(2).build().unwrap();
    let output = run(
        config,
        Arc::new(StubRasterizer::new(1)),
        Arc::new(FixedOcr("Hello World")),
        generator.clone(),
    )
    .await;

    assert_eq!(output.pages.len(), 1);
    let page = &output.pages[0];
    assert_eq!(page.status, PageStatus::Succeeded);
    assert_eq!(page.ocr_text.as_deref(), Some("Hello World"));
    assert_eq!(page.candidates.len(), 3);
    assert_eq!(page.refine_outcome, Some(RefineOutcome::MaxRoundsReached));
    assert_eq!(page.selection(), Some(Selection::Synthesized));
    assert!(page.markdown().unwrap().contains("Hello World"));
    assert!(output.markdown.contains("Hello World"));
    assert_contiguous_rounds(&output);

    assert_eq!(generator.calls(Role::Convert), 1);
    assert_eq!(generator.calls(Role::Critique), 2);
    assert_eq!(generator.calls(Role::Refine), 2);
    assert_eq!(generator.calls(Role::Meta), 1);
    assert_eq!(output.stats.generation_calls, 6);
}

#[tokio::test]
async fn page_selection_limits_rendering() {
    let rasterizer = Arc::new(StubRasterizer::new(3));
    let config = fast_config()
        .pages(PageSelection::Single(2))
        .build()
        .unwrap();
    let output = run(
        config,
        rasterizer.clone(),
        Arc::new(StubOcr::default()),
        StubGenerator::agreeable(),
    )
    .await;

    assert_eq!(rasterizer.requested(), vec![2]);
    assert_eq!(output.pages.len(), 1);
    assert_eq!(output.pages[0].page_num, 2);
    assert_eq!(output.stats.total_pages, 3);
    assert_eq!(output.stats.selected_pages, 1);
}

#[tokio::test]
async fn rate_limited_page_fails_without_affecting_siblings() {
    let generator = StubGenerator::new(|role, req| match role {
        Role::Convert if req.prompt.contains("page 2") => {
            Err(GenerationServiceError::RateLimited { retry_after: None })
        }
        Role::Convert => Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt))),
        Role::Critique => Ok("VERDICT: CONVERGED".into()),
        _ => Ok("SELECTED: 0\n".into()),
    });
    let output = run(
        fast_config().build().unwrap(),
        Arc::new(StubRasterizer::new(2)),
        Arc::new(StubOcr::default()),
        generator,
    )
    .await;

    let ok = output.page(1).unwrap();
    assert_eq!(ok.status, PageStatus::Succeeded);
    assert_eq!(ok.markdown(), Some("# Scan\n\nText of page 1\n"));

    let limited = output.page(2).unwrap();
    assert_eq!(limited.status, PageStatus::Failed);
    assert!(matches!(
        limited.error,
        Some(PageError::RateLimited { attempts: 2, .. })
    ));
    assert!(limited.final_markdown.is_none());
    assert_eq!(limited.retries, 1);

    assert_eq!(output.stats.succeeded_pages, 1);
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.markdown, "# Scan\n\nText of page 1\n");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_on_one_page_holds_back_sibling_calls() {
    let cooldown = Duration::from_secs(30);
    // (issued at, OCR text of the page, answered with 429)
    let converts: Arc<Mutex<Vec<(Instant, String, bool)>>> = Arc::default();
    let seen = converts.clone();
    let generator = StubGenerator::new(move |role, req| match role {
        Role::Convert => {
            let mut seen = seen.lock().unwrap();
            let first = seen.is_empty();
            seen.push((Instant::now(), ocr_of(&req.prompt).to_string(), first));
            if first {
                Err(GenerationServiceError::RateLimited {
                    retry_after: Some(cooldown),
                })
            } else {
                Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt)))
            }
        }
        Role::Critique => Ok("VERDICT: CONVERGED".into()),
        _ => Ok("SELECTED: 1\n".into()),
    });
    let config = fast_config()
        .concurrency(2)
        .max_inflight_requests(2)
        .build()
        .unwrap();
    let output = run(
        config,
        Arc::new(StubRasterizer::new(2)),
        Arc::new(StubOcr::default()),
        generator,
    )
    .await;

    assert_eq!(output.stats.succeeded_pages, 2);
    assert_eq!(output.stats.retries, 1);

    let converts = converts.lock().unwrap();
    assert_eq!(converts.len(), 3, "one 429, one retry, one sibling call");
    let (limited_at, limited_page, rate_limited) = converts[0].clone();
    assert!(rate_limited);

    let sibling: Vec<_> = converts.iter().filter(|(_, p, _)| *p != limited_page).collect();
    assert_eq!(sibling.len(), 1);
    let waited = sibling[0].0 - limited_at;
    assert!(
        waited >= cooldown,
        "sibling page called the service {waited:?} after the 429, inside the {cooldown:?} cooldown"
    );

    let retry = converts[1..]
        .iter()
        .find(|(_, p, _)| *p == limited_page)
        .expect("rate-limited page retried");
    assert!(retry.0 - limited_at >= cooldown);
}

#[tokio::test]
async fn immediate_convergence_appends_confirmation_round() {
    let generator = StubGenerator::agreeable();
    let output = run(
        fast_config().build().unwrap(),
        Arc::new(StubRasterizer::new(1)),
        Arc::new(StubOcr::default()),
        generator.clone(),
    )
    .await;

    let page = &output.pages[0];
    assert_eq!(page.refine_outcome, Some(RefineOutcome::Converged));
    assert_eq!(page.candidates.len(), 2);
    assert_eq!(page.candidates[0].text, page.candidates[1].text);
    assert_eq!(page.candidates[1].critique.as_deref(), Some("VERDICT: CONVERGED"));
    assert_eq!(generator.calls(Role::Refine), 0);
    assert_eq!(generator.calls(Role::Meta), 1);
    assert_eq!(page.selection(), Some(Selection::Round(1)));
    assert_eq!(page.markdown(), Some(page.candidates[1].text.as_str()));
}

#[tokio::test]
async fn ocr_failure_preserves_image_and_skips_generation() {
    let ocr = Arc::new(StubOcr::failing(
        1,
        OcrEngineError::EngineMissing("tesseract: not found".into()),
    ));
    let generator = StubGenerator::agreeable();
    let output = run(
        fast_config().build().unwrap(),
        Arc::new(StubRasterizer::new(2)),
        ocr.clone(),
        generator.clone(),
    )
    .await;

    let failed = output.page(1).unwrap();
    assert_eq!(failed.status, PageStatus::Failed);
    assert!(matches!(
        failed.error,
        Some(PageError::OcrUnavailable { attempts: 2, .. })
    ));
    assert!(failed.ocr_text.is_none());
    assert!(failed.candidates.is_empty());
    assert_eq!(failed.generation_calls, 0);

    let kept = failed.preserved_image.clone().expect("image preserved");
    assert!(kept.exists());
    std::fs::remove_file(kept).ok();

    // 2 attempts for page 1, 1 for page 2.
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);
    assert_eq!(output.page(2).unwrap().status, PageStatus::Succeeded);
}

#[tokio::test]
async fn render_failure_is_page_level() {
    let rasterizer = Arc::new(StubRasterizer {
        broken: vec![2],
        ..StubRasterizer::new(3)
    });
    let output = run(
        fast_config().build().unwrap(),
        rasterizer,
        Arc::new(StubOcr::default()),
        StubGenerator::agreeable(),
    )
    .await;

    let statuses: Vec<PageStatus> = output.pages.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![PageStatus::Succeeded, PageStatus::Failed, PageStatus::Succeeded]
    );
    assert_eq!(output.page(2).unwrap().error.as_ref().unwrap().reason(), "RenderFailed");
}

#[tokio::test]
async fn meta_failure_falls_back_to_latest_round() {
    let generator = StubGenerator::new(|role, req| match role {
        Role::Convert => Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt))),
        Role::Critique => Ok("VERDICT: REVISE\nThe heading should say Scanned Page instead.".into()),
        Role::Refine => Ok("# Scanned Page\n\nText of page 1".into()),
        _ => Err(GenerationServiceError::ServiceUnavailable("503".into())),
    });
    let config = fast_config().max_refinement_rounds(1).build().unwrap();
    let output = run(
        config,
        Arc::new(StubRasterizer::new(1)),
        Arc::new(StubOcr::default()),
        generator.clone(),
    )
    .await;

    let page = &output.pages[0];
    assert_eq!(page.status, PageStatus::Succeeded);
    assert_eq!(page.selection(), Some(Selection::Fallback(1)));
    assert_eq!(page.markdown(), Some("# Scanned Page\n\nText of page 1\n"));
    assert_eq!(
        page.candidates.last().map(|c| c.text.as_str()),
        page.markdown()
    );
    assert_eq!(generator.calls(Role::Meta), 2);
}

#[tokio::test]
async fn failed_correction_leaves_page_partially_refined() {
    let generator = StubGenerator::new(|role, req| match role {
        Role::Convert => Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt))),
        Role::Critique => Ok("VERDICT: REVISE\nThe first paragraph is missing entirely here.".into()),
        Role::Refine => Err(GenerationServiceError::InvalidRequest("context too long".into())),
        _ => Ok("SELECTED: 0\n".into()),
    });
    let output = run(
        fast_config().build().unwrap(),
        Arc::new(StubRasterizer::new(1)),
        Arc::new(StubOcr::default()),
        generator.clone(),
    )
    .await;

    let page = &output.pages[0];
    assert_eq!(page.status, PageStatus::PartiallyRefined);
    assert_eq!(page.refine_outcome, Some(RefineOutcome::Aborted));
    assert!(matches!(page.error, Some(PageError::InvalidRequest { .. })));
    assert_eq!(page.candidates.len(), 1);
    assert_eq!(page.markdown(), Some("# Scan\n\nText of page 1\n"));
    // InvalidRequest is never retried.
    assert_eq!(generator.calls(Role::Refine), 1);
    assert_eq!(output.stats.partially_refined_pages, 1);
    assert_eq!(output.markdown, "# Scan\n\nText of page 1\n");
}

#[tokio::test]
async fn cancellation_marks_every_unfinished_page_cancelled() {
    let fixture = Fixture::new();
    let config = fast_config().concurrency(2).build().unwrap();
    let pipeline = Pipeline::new(
        config,
        services(
            Arc::new(StubRasterizer::new(3)),
            Arc::new(StubOcr::default()),
            Arc::new(HangingGenerator),
        ),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let output = tokio::time::timeout(Duration::from_secs(5), pipeline.run(fixture.input(), cancel))
        .await
        .expect("run must stop after cancellation")
        .unwrap();

    assert_eq!(output.pages.len(), 3);
    for page in &output.pages {
        assert_eq!(page.status, PageStatus::Failed);
        assert!(matches!(page.error, Some(PageError::Cancelled { .. })));
        assert!(page.final_markdown.is_none());
    }
    assert!(output.markdown.is_empty());
}

#[tokio::test]
async fn pre_cancelled_run_makes_no_calls() {
    let fixture = Fixture::new();
    let generator = StubGenerator::agreeable();
    let pipeline = Pipeline::new(
        fast_config().build().unwrap(),
        services(
            Arc::new(StubRasterizer::new(2)),
            Arc::new(StubOcr::default()),
            generator.clone(),
        ),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let output = pipeline.run(fixture.input(), cancel).await.unwrap();
    assert!(output.pages.iter().all(|p| p.error == Some(PageError::Cancelled { page: p.page_num })));
    assert_eq!(generator.total_calls(), 0);
}

#[tokio::test]
async fn out_of_range_selection_is_fatal_before_any_work() {
    let fixture = Fixture::new();
    let rasterizer = Arc::new(StubRasterizer::new(3));
    let generator = StubGenerator::agreeable();
    let pipeline = Pipeline::new(
        fast_config().pages(PageSelection::Single(9)).build().unwrap(),
        services(rasterizer.clone(), Arc::new(StubOcr::default()), generator.clone()),
    );

    let err = pipeline
        .run(fixture.input(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Ocr2MdError::PageRange { total: 3, .. }));
    assert!(rasterizer.requested().is_empty());
    assert_eq!(generator.total_calls(), 0);
}

#[tokio::test]
async fn missing_input_is_fatal() {
    let pipeline = Pipeline::new(
        fast_config().build().unwrap(),
        services(
            Arc::new(StubRasterizer::new(1)),
            Arc::new(StubOcr::default()),
            StubGenerator::agreeable(),
        ),
    );
    let err = pipeline
        .run("/nonexistent/scan.pdf", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Ocr2MdError::FileNotFound { .. }));
}

#[tokio::test]
async fn identical_runs_produce_identical_output() {
    let fixture = Fixture::new();
    let pipeline = Pipeline::new(
        fast_config().max_refinement_rounds(2).build().unwrap(),
        services(
            Arc::new(StubRasterizer::new(3)),
            Arc::new(StubOcr::default()),
            StubGenerator::echo(),
        ),
    );

    let first = pipeline.run(fixture.input(), CancellationToken::new()).await.unwrap();
    let second = pipeline.run(fixture.input(), CancellationToken::new()).await.unwrap();

    assert_eq!(first.markdown, second.markdown);
    for (a, b) in first.pages.iter().zip(&second.pages) {
        assert_eq!(a.candidates, b.candidates);
        assert_eq!(a.final_markdown, b.final_markdown);
    }
}

#[tokio::test]
async fn pages_are_ordered_and_each_reported_once() {
    let recorder = Arc::new(Recorder::default());
    let config = fast_config()
        .concurrency(3)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let output = run(
        config,
        Arc::new(StubRasterizer::new(5)),
        Arc::new(StubOcr::default()),
        StubGenerator::agreeable(),
    )
    .await;

    let order: Vec<usize> = output.pages.iter().map(|p| p.page_num).collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
    assert_contiguous_rounds(&output);

    assert_eq!(recorder.started.load(Ordering::SeqCst), 5);
    let mut completed: Vec<usize> = recorder
        .completed
        .lock()
        .unwrap()
        .iter()
        .map(|(p, _)| *p)
        .collect();
    completed.sort_unstable();
    assert_eq!(completed, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn directory_sink_persists_pages_translations_and_status() {
    let fixture = Fixture::new();
    let out = tempfile::tempdir().unwrap();
    let generator = StubGenerator::agreeable();
    let pipeline = Pipeline::new(
        fast_config().translate_to("Shouting").build().unwrap(),
        services(
            Arc::new(StubRasterizer::new(2)),
            Arc::new(StubOcr::failing(
                2,
                OcrEngineError::RecognitionFailed("blank page".into()),
            )),
            generator.clone(),
        ),
    )
    .with_sink(Arc::new(DirectorySink::new(out.path())));

    let output = pipeline
        .run(fixture.input(), CancellationToken::new())
        .await
        .unwrap();

    let doc_dir = out.path().join("scan");
    let md = std::fs::read_to_string(doc_dir.join("markdowns/page_1.md")).unwrap();
    assert_eq!(md, output.page(1).unwrap().markdown().unwrap());
    assert!(!doc_dir.join("markdowns/page_2.md").exists());

    let translated = std::fs::read_to_string(doc_dir.join("translations/page_1.md")).unwrap();
    assert!(translated.contains("TEXT OF PAGE 1"));
    assert_eq!(generator.calls(Role::Translate), 1);

    assert!(doc_dir.join("images/page_2.png").exists());
    if let Some(ref kept) = output.page(2).unwrap().preserved_image {
        std::fs::remove_file(kept).ok();
    }

    let status: StatusRecord =
        serde_json::from_str(&std::fs::read_to_string(doc_dir.join("status.json")).unwrap())
            .unwrap();
    assert_eq!(status.document, "scan");
    assert_eq!(status.pages.len(), 2);
    assert_eq!(status.pages[0].status, PageStatus::Succeeded);
    assert_eq!(status.pages[1].status, PageStatus::Failed);
    assert_eq!(status.pages[1].reason.as_deref(), Some("OcrFailure"));
}

#[tokio::test]
async fn finalize_pass_replaces_meta_text() {
    let generator = StubGenerator::new(|role, req| match role {
        Role::Convert => Ok(format!("# Scan\n\n{}", ocr_of(&req.prompt))),
        Role::Critique => Ok("VERDICT: CONVERGED".into()),
        Role::Meta => Ok("SELECTED: blend\n# Scan\n\nText of page 1\n\nI fixed the heading.".into()),
        Role::Finalize => Ok("# Scan\n\nText of page 1".into()),
        _ => Ok(String::new()),
    });
    let output = run(
        fast_config().finalize(true).build().unwrap(),
        Arc::new(StubRasterizer::new(1)),
        Arc::new(StubOcr::default()),
        generator.clone(),
    )
    .await;

    let page = &output.pages[0];
    assert_eq!(page.selection(), Some(Selection::Synthesized));
    assert_eq!(page.markdown(), Some("# Scan\n\nText of page 1\n"));
    assert_eq!(generator.calls(Role::Finalize), 1);
}
