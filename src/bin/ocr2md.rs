//! CLI binary for edgequake-ocr2md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig`, wires Ctrl-C to the run's cancellation token,
//! and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr2md::persist::write_atomic;
use edgequake_ocr2md::{
    inspect_with, ConversionConfig, ConversionProgressCallback, DirectorySink, PageSelection,
    PageSeparator, PageStatus, Pipeline, ProgressCallback, Services, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── Terminal styling ─────────────────────────────────────────────────────────

/// SGR codes used by the status lines.
const GREEN: &str = "32";
const RED: &str = "31";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const BOLD: &str = "1";
const DIM: &str = "2";

fn paint(code: &str, text: &str) -> String {
    format!("\x1b[{code}m{text}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out of
/// order, so per-page start times are keyed by page number.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    rounds: Mutex<HashMap<usize, u32>>,
}

impl CliProgressCallback {
    /// Spinner-only until `on_conversion_start` reports the page total.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            rounds: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            paint(CYAN, "◆"),
            paint(BOLD, &format!("Starting conversion of {total_pages} pages…"))
        ));
    }

    fn on_stage(&self, page_num: usize, stage: Stage) {
        self.start_times
            .lock()
            .unwrap()
            .entry(page_num)
            .or_insert_with(Instant::now);
        self.bar.set_message(format!("page {page_num}: {stage}"));
    }

    fn on_round(&self, page_num: usize, round: u32) {
        self.rounds.lock().unwrap().insert(page_num, round);
    }

    fn on_page_complete(&self, page_num: usize, total: usize, status: &PageStatus) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&page_num)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        let rounds = self.rounds.lock().unwrap().remove(&page_num).unwrap_or(0);

        let mark = match status {
            PageStatus::Succeeded => paint(GREEN, "✓"),
            PageStatus::PartiallyRefined => paint(YELLOW, "~"),
            PageStatus::Failed => paint(RED, "✗"),
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<18}  {}  {}",
            mark,
            page_num,
            total,
            status.as_str(),
            paint(DIM, &format!("{rounds} rounds")),
            paint(DIM, &format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages converted",
                paint(GREEN, "✔"),
                paint(BOLD, &success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages converted  ({} failed)",
                if failed == total_pages {
                    paint(RED, "✘")
                } else {
                    paint(CYAN, "⚠")
                },
                paint(BOLD, &success_count.to_string()),
                total_pages,
                paint(RED, &failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic conversion (stdout)
  ocr2md scan.pdf

  # Convert to file, two refinement rounds
  ocr2md --rounds 2 scan.pdf -o scan.md

  # Specific pages, German OCR, translated to English
  ocr2md --pages 1-5 --lang deu --translate-to English brief.pdf -o brief.md

  # Keep per-page markdown, preserved images and status.json
  ocr2md --out-dir out/ scan.pdf

  # Inspect PDF metadata (no API key or OCR engine needed)
  ocr2md --inspect-only scan.pdf

  # JSON output with the full candidate history per page
  ocr2md --json scan.pdf > scan.json

ENVIRONMENT VARIABLES:
  GROQ_API_KEY            Groq API key (default model)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (groq, openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter (e.g. edgequake_ocr2md=debug)

SETUP:
  1. Install tesseract:  apt install tesseract-ocr   (or brew install tesseract)
  2. Provide pdfium:     PDFIUM_LIB_PATH=/path/to/libpdfium, or install system-wide
  3. Set an API key:     export GROQ_API_KEY=...
  4. Convert:            ocr2md scan.pdf -o scan.md

Exit status is non-zero only when the run could not start or its output could
not be written. Individual page failures are reported per page.
"#;

/// Convert scanned PDFs to Markdown with OCR and iterative LLM refinement.
#[derive(Parser, Debug)]
#[command(
    name = "ocr2md",
    version,
    about = "Convert PDF files and URLs to Markdown with OCR and iterative LLM refinement",
    long_about = "Convert PDF documents (local files or URLs) to Markdown. Each page is OCR'd with \
tesseract, converted by a language model, then critiqued and corrected for a bounded number of \
rounds; a final reasoning pass picks or blends the best version.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write assembled Markdown to this file instead of stdout.
    #[arg(short, long, env = "OCR2MD_OUTPUT")]
    output: Option<PathBuf>,

    /// Write per-page artifacts and status.json under this directory.
    #[arg(long, env = "OCR2MD_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "OCR2MD_PAGES", default_value = "all")]
    pages: String,

    /// Rendering DPI (72–1200).
    #[arg(long, env = "OCR2MD_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=1200))]
    dpi: u32,

    /// Maximum critique-and-correct rounds per page.
    #[arg(long, env = "OCR2MD_ROUNDS", default_value_t = 3)]
    rounds: u32,

    /// Retries per generation call after the first attempt.
    #[arg(long, env = "OCR2MD_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Pages processed concurrently.
    #[arg(short, long, env = "OCR2MD_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Maximum generation calls in flight across all pages.
    #[arg(long, env = "OCR2MD_MAX_INFLIGHT", default_value_t = 4)]
    max_inflight: usize,

    /// Requests-per-minute quota on the generation service.
    #[arg(long, env = "OCR2MD_RPM")]
    rpm: Option<u32>,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: groq, openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OCR language code(s), e.g. eng, deu, eng+fra.
    #[arg(long, env = "OCR2MD_LANG", default_value = "eng")]
    lang: String,

    /// Path to the tesseract binary.
    #[arg(long, env = "OCR2MD_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Run a cleanup pass that strips model commentary from the final text.
    #[arg(long, env = "OCR2MD_FINALIZE")]
    finalize: bool,

    /// Translate each page's final Markdown into this language.
    #[arg(long, env = "OCR2MD_TRANSLATE_TO")]
    translate_to: Option<String>,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "OCR2MD_SEPARATOR", default_value = "none")]
    separator: String,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "OCR2MD_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max LLM output tokens per call.
    #[arg(long, env = "OCR2MD_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Output structured JSON (ConversionOutput) instead of Markdown.
    #[arg(long, env = "OCR2MD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCR2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR2MD_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "OCR2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "OCR2MD_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let config = build_config(&cli, None)?;
        let meta = inspect_with(&cli.input, &config)
            .await
            .context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            let rows = [
                ("File", Some(cli.input.clone())),
                ("Title", meta.title.clone()),
                ("Author", meta.author.clone()),
                ("Pages", Some(meta.page_count.to_string())),
                ("PDF version", Some(meta.pdf_version.clone())),
                ("Producer", meta.producer.clone()),
                ("Creator", meta.creator.clone()),
            ];
            for (label, value) in rows {
                if let Some(value) = value {
                    println!("{:<13} {}", format!("{label}:"), value);
                }
            }
        }
        return Ok(());
    }

    // ── Build pipeline ───────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;
    let services = Services::from_config(&config).context("Failed to set up services")?;
    let mut pipeline = Pipeline::new(config, services);
    if let Some(ref dir) = cli.out_dir {
        pipeline = pipeline.with_sink(Arc::new(DirectorySink::new(dir)));
    }

    // ── Ctrl-C cancels the run; pages in flight report `cancelled` ─────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", paint(YELLOW, "Interrupted: cancelling in-flight pages…"));
                cancel.cancel();
            }
        });
    }

    // ── Run conversion ───────────────────────────────────────────────────
    let output = pipeline
        .run(&cli.input, cancel)
        .await
        .context("Conversion failed")?;

    if let Some(ref output_path) = cli.output {
        let bytes = if cli.json {
            serde_json::to_vec_pretty(&output).context("Failed to serialise output")?
        } else {
            output.markdown.clone().into_bytes()
        };
        write_atomic(output_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
    } else if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.markdown.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.markdown.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !cli.quiet {
        let stats = &output.stats;
        if !show_progress {
            eprintln!(
                "Converted {}/{} pages in {}ms ({} partially refined, {} failed)",
                stats.succeeded_pages + stats.partially_refined_pages,
                stats.selected_pages,
                stats.total_duration_ms,
                stats.partially_refined_pages,
                stats.failed_pages,
            );
        }
        eprintln!(
            "   {} generation calls  /  {} retries  /  {}ms total",
            paint(DIM, &stats.generation_calls.to_string()),
            paint(DIM, &stats.retries.to_string()),
            stats.total_duration_ms,
        );
        for page in output.pages.iter().filter(|p| p.error.is_some()) {
            if let Some(ref e) = page.error {
                eprintln!("   {} page {}: {}", paint(RED, "•"), page.page_num, e);
            }
            if let Some(ref img) = page.preserved_image {
                eprintln!("     image kept at {}", img.display());
            }
        }
        if let Some(ref path) = cli.output {
            eprintln!("   → {}", paint(BOLD, &path.display().to_string()));
        }
    }

    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let pages = parse_pages(&cli.pages)?;
    let separator = parse_separator(&cli.separator);

    let mut builder = ConversionConfig::builder()
        .dpi(cli.dpi)
        .pages(pages)
        .max_refinement_rounds(cli.rounds)
        .max_retries(cli.max_retries)
        .concurrency(cli.concurrency)
        .max_inflight_requests(cli.max_inflight)
        .ocr_language(cli.lang.clone())
        .tesseract_path(cli.tesseract.clone())
        .finalize(cli.finalize)
        .page_separator(separator)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout);

    if let Some(rpm) = cli.rpm {
        builder = builder.requests_per_minute(rpm);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref language) = cli.translate_to {
        builder = builder.translate_to(language.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` (`all`, `5`, `3-15`, `1,3,5`) into a `PageSelection`.
/// Bounds against the document are checked later, once the page count is known.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    let selection = if s == "all" {
        PageSelection::All
    } else if let Some((first, last)) = s.split_once('-') {
        let (first, last) = (page_number(first)?, page_number(last)?);
        if first > last {
            anyhow::bail!("Page range {first}-{last} is reversed");
        }
        PageSelection::Range(first, last)
    } else if s.contains(',') {
        PageSelection::Set(s.split(',').map(page_number).collect::<Result<_>>()?)
    } else {
        PageSelection::Single(page_number(&s)?)
    };
    Ok(selection)
}

/// One 1-based page number from the `--pages` flag.
fn page_number(raw: &str) -> Result<usize> {
    let raw = raw.trim();
    match raw.parse::<usize>() {
        Ok(0) => anyhow::bail!("Page numbers start at 1, got 0"),
        Ok(n) => Ok(n),
        Err(_) => anyhow::bail!("Not a page number: '{raw}'"),
    }
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
