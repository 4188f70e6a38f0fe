//! End-to-end tests for edgequake-ocr2md.
//!
//! These use real PDF files in `./test_cases/`, a real pdfium library, a real
//! tesseract binary and live LLM API calls. They are gated behind the
//! `E2E_ENABLED` environment variable so they do not run in CI unless
//! explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=. cargo test --test e2e -- --nocapture

use edgequake_ocr2md::{
    convert, convert_to_file, inspect, ConversionConfig, ConversionProgressCallback, Ocr2MdError,
    PageSelection, PageSeparator, PageStatus,
};
use edgequake_ocr2md::progress::NoopProgressCallback;
use std::path::PathBuf;
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

fn output_dir() -> PathBuf {
    let d = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases/output");
    std::fs::create_dir_all(&d).ok();
    d
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Assert the markdown passes basic quality checks.
fn assert_markdown_quality(md: &str, context: &str) {
    assert!(!md.trim().is_empty(), "[{context}] Markdown is empty");
    assert!(
        md.ends_with('\n'),
        "[{context}] Markdown must end with a newline"
    );

    let first_line = md.lines().next().unwrap_or("");
    assert!(
        !first_line.starts_with("```"),
        "[{context}] Output must not start with a code fence, got: {first_line:?}"
    );
    assert!(
        !first_line.starts_with("SELECTED:") && !first_line.starts_with("VERDICT:"),
        "[{context}] Response sentinel leaked into output: {first_line:?}"
    );
    assert!(
        !md.contains("\n\n\n"),
        "[{context}] Output has consecutive blank lines"
    );

    let invisible = ['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'];
    for ch in invisible {
        assert!(
            !md.contains(ch),
            "[{context}] Output contains invisible char U+{:04X}",
            ch as u32
        );
    }
}

// ── Inspect ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inspect_scanned_letter() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned_letter.pdf"));

    let meta = inspect(path.to_str().unwrap()).await.expect("inspect failed");
    println!("{meta:#?}");
    assert!(meta.page_count >= 1);
    assert!(!meta.pdf_version.is_empty());
}

#[tokio::test]
async fn test_inspect_nonexistent() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
        return;
    }
    let err = inspect("/nonexistent/file.pdf").await.unwrap_err();
    assert!(matches!(err, Ocr2MdError::FileNotFound { .. }), "got {err}");
}

// ── Conversion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_convert_scanned_letter_page1() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned_letter.pdf"));

    let config = ConversionConfig::builder()
        .pages(PageSelection::Single(1))
        .max_refinement_rounds(2)
        .build()
        .unwrap();

    let output = convert(path.to_str().unwrap(), &config)
        .await
        .expect("conversion failed");

    let page = &output.pages[0];
    println!(
        "status={} rounds={} selection={:?}",
        page.status,
        page.refinement_rounds(),
        page.selection()
    );
    assert!(page.status.has_markdown(), "page failed: {:?}", page.error);
    assert!(page.ocr_text.as_deref().is_some_and(|t| !t.trim().is_empty()));
    assert!(page.refinement_rounds() <= 2);
    assert_markdown_quality(&output.markdown, "scanned_letter p1");

    std::fs::write(output_dir().join("scanned_letter_p1.md"), &output.markdown).ok();
}

#[tokio::test]
async fn test_convert_to_file_with_separator() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned_letter.pdf"));

    let config = ConversionConfig::builder()
        .pages(PageSelection::Range(1, 2))
        .page_separator(PageSeparator::Comment)
        .max_refinement_rounds(1)
        .build()
        .unwrap();

    let out = output_dir().join("scanned_letter_p1_2.md");
    let stats = convert_to_file(path.to_str().unwrap(), &out, &config)
        .await
        .expect("conversion failed");

    let md = std::fs::read_to_string(&out).unwrap();
    assert_markdown_quality(&md, "scanned_letter p1-2");
    if stats.succeeded_pages + stats.partially_refined_pages == 2 {
        assert!(md.contains("<!-- page 2 -->"));
    }
}

#[tokio::test]
async fn test_convert_json_serialisable() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned_letter.pdf"));

    let config = ConversionConfig::builder()
        .pages(PageSelection::Single(1))
        .max_refinement_rounds(1)
        .build()
        .unwrap();
    let output = convert(path.to_str().unwrap(), &config).await.unwrap();

    let json = serde_json::to_string_pretty(&output).expect("serialise output");
    let back: edgequake_ocr2md::ConversionOutput = serde_json::from_str(&json).unwrap();
    assert_eq!(back.pages.len(), output.pages.len());
    assert_eq!(back.markdown, output.markdown);
}

#[tokio::test]
async fn test_callback_send_in_tokio_spawn() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned_letter.pdf"));

    struct Counting(std::sync::atomic::AtomicUsize);
    impl ConversionProgressCallback for Counting {
        fn on_page_complete(&self, _page: usize, _total: usize, status: &PageStatus) {
            println!("page done: {status}");
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let cb = Arc::new(Counting(Default::default()));
    let config = ConversionConfig::builder()
        .pages(PageSelection::Single(1))
        .max_refinement_rounds(1)
        .progress_callback(cb.clone())
        .build()
        .unwrap();

    let input = path.to_str().unwrap().to_string();
    let handle = tokio::spawn(async move { convert(input, &config).await });
    handle.await.unwrap().unwrap();
    assert_eq!(cb.0.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_noop_callback_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<NoopProgressCallback>();
}
