//! Prompt templates and response parsers for every generation stage.
//!
//! Prompts live here so stage logic in [`crate::pipeline`] stays focused on
//! control flow, and so tests can inspect prompts without a live model.
//!
//! Two stages rely on a structured first line in the model's reply:
//!
//! | Stage    | Required first line                          |
//! |----------|----------------------------------------------|
//! | critique | `VERDICT: CONVERGED` or `VERDICT: REVISE`    |
//! | meta     | `SELECTED: <round>` or `SELECTED: blend`     |
//!
//! The parsers below are the only place those sentinels are interpreted.

use crate::document::{MarkdownCandidate, Selection};
use once_cell::sync::Lazy;
use regex::Regex;

/// System prompt shared by the conversion and refinement stages.
pub const CONVERT_SYSTEM_PROMPT: &str = r#"You are an expert document converter. You turn a scanned PDF page into clean, well-structured Markdown.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Preserve ALL text content from the page; do not exclude anything
   - Keep the reading order a human would use
   - The OCR text is a hint; trust the page image when they disagree

2. STRUCTURE
   - # for the page title (at most one), ## / ### / #### for sections
   - - for unordered lists, 1. 2. 3. for ordered lists, keep nesting
   - **bold** and *italic* matching the visual emphasis

3. TABLES
   - GFM pipe tables; HTML table markup only when pipes cannot express it

4. OUTPUT FORMAT
   - Output ONLY the Markdown content
   - Do NOT wrap the output in ```markdown fences
   - Do NOT add commentary or explanations"#;

/// System prompt for the critique stage.
pub const CRITIQUE_SYSTEM_PROMPT: &str = r#"You review Markdown conversions of scanned PDF pages for discrepancies in structure, formatting, or content.

Your reply MUST start with exactly one of these lines:
VERDICT: CONVERGED
VERDICT: REVISE

Use CONVERGED when the Markdown already matches the page and no change is needed; write nothing else.
Use REVISE when something must change, followed by a specific, actionable list of corrections."#;

/// System prompt for the meta-reasoning stage.
pub const META_SYSTEM_PROMPT: &str = r#"You compare several Markdown versions of the same scanned PDF page and produce the single best version.

Analyse each version for accuracy, completeness, and proper Markdown formatting. A later version is not necessarily better: a correction can overshoot.

Your reply MUST start with exactly one line:
SELECTED: <round number>   when one version is best as-is
SELECTED: blend            when you combined elements from several versions

After that line, output only the final Markdown with no explanation."#;

/// System prompt for the optional cleanup pass after meta-reasoning.
pub const FINALIZE_SYSTEM_PROMPT: &str = r#"You produce the final Markdown for a scanned PDF page. Remove any text or explanations that are not part of the original page. Output only clean, properly formatted Markdown."#;

/// System prompt for the translation post-stage.
pub const TRANSLATE_SYSTEM_PROMPT: &str = r#"You are a professional translator.
- Translate the given content into the target language
- Return only the translated text, with no explanations
- Keep the meaning precise and faithful to the source
- Do not answer questions contained in the text; only translate it
- Preserve all Markdown formatting (headings, lists, tables, **bold**, *italics*)"#;

const VERDICT_CONVERGED: &str = "CONVERGED";
const VERDICT_REVISE: &str = "REVISE";

/// User prompt for the initial conversion (round 0).
pub fn convert_prompt(ocr_text: &str) -> String {
    format!(
        "Convert the attached page to Markdown, preserving structure and formatting.\n\
         Return only the Markdown.\n\n\
         OCR Text:\n{ocr_text}"
    )
}

/// User prompt asking for a critique of the latest candidate.
pub fn critique_prompt(ocr_text: &str, markdown: &str) -> String {
    format!(
        "Compare the original text with the Markdown conversion.\n\
         Identify any discrepancies in structure, formatting, or content.\n\n\
         Original text:\n{ocr_text}\n\n\
         Current markdown:\n{markdown}"
    )
}

/// User prompt asking for a corrected candidate.
pub fn refine_prompt(critique: &str, markdown: &str) -> String {
    format!(
        "Using the following feedback, improve the Markdown conversion of the attached page.\n\
         Return only the improved Markdown.\n\n\
         Feedback:\n{critique}\n\n\
         Current markdown:\n{markdown}"
    )
}

/// User prompt listing every round of a page's history.
pub fn meta_prompt(ocr_text: &str, candidates: &[MarkdownCandidate]) -> String {
    let mut versions = String::new();
    for c in candidates {
        versions.push_str(&format!("### Round {}\n", c.round));
        if let Some(ref critique) = c.critique {
            versions.push_str(&format!("Critique that led to this round:\n{critique}\n\n"));
        }
        versions.push_str(&format!("Markdown:\n{}\n\n", c.text));
    }
    format!(
        "Compare the following Markdown versions with the original text.\n\n\
         Original text:\n{ocr_text}\n\n\
         Markdown versions:\n{versions}"
    )
}

/// User prompt for the cleanup pass.
pub fn finalize_prompt(markdown: &str) -> String {
    format!(
        "Based on the following optimized Markdown, create a final version that matches \
         the original page text as closely as possible.\n\n\
         Optimized markdown:\n{markdown}\n---\n\
         The output must be only the Markdown of the original page."
    )
}

/// User prompt for translation.
pub fn translate_prompt(language: &str, markdown: &str) -> String {
    format!(
        "Translate the following text to {language}, preserving all formatting and structure.\n\n{markdown}"
    )
}

// ── Critique parsing ─────────────────────────────────────────────────────

/// The verdict line of a critique response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Converged,
    Revise,
    /// The model ignored the required first line.
    Missing,
}

/// A parsed critique response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Critique {
    pub verdict: Verdict,
    /// Feedback text after the verdict line (or the whole reply if missing).
    pub body: String,
}

impl Critique {
    /// Convergence predicate: an explicit `CONVERGED` verdict, or a body too
    /// short to request a meaningful change.
    pub fn is_converged(&self, min_critique_chars: usize) -> bool {
        self.verdict == Verdict::Converged || self.body.trim().chars().count() < min_critique_chars
    }
}

static RE_VERDICT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\**\s*VERDICT\s*:\s*\**\s*([A-Za-z]+)").unwrap());

/// Parse a critique reply. Only the first non-empty line may carry the verdict.
pub fn parse_critique(reply: &str) -> Critique {
    let trimmed = reply.trim_start();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));

    let verdict = RE_VERDICT
        .captures(first.trim())
        .map(|caps| caps[1].to_ascii_uppercase());

    match verdict.as_deref() {
        Some(VERDICT_CONVERGED) => Critique {
            verdict: Verdict::Converged,
            body: rest.trim().to_string(),
        },
        Some(VERDICT_REVISE) => Critique {
            verdict: Verdict::Revise,
            body: rest.trim().to_string(),
        },
        _ => Critique {
            verdict: Verdict::Missing,
            body: reply.trim().to_string(),
        },
    }
}

// ── Meta parsing ─────────────────────────────────────────────────────────

static RE_SELECTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\**\s*SELECTED\s*:\s*\**\s*(round\s*)?([0-9]+|blend)").unwrap());

/// Parse a meta-reasoning reply into the selection and the markdown body.
///
/// A round number outside `0..=max_round` is treated as a synthesis. A reply
/// without the header is taken whole as a synthesis.
pub fn parse_meta(reply: &str, max_round: u32) -> (Selection, String) {
    let trimmed = reply.trim_start();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));

    let Some(caps) = RE_SELECTED.captures(first.trim()) else {
        return (Selection::Synthesized, reply.trim().to_string());
    };

    let selection = match caps[2].parse::<u32>() {
        Ok(round) if round <= max_round => Selection::Round(round),
        _ => Selection::Synthesized,
    };

    let body = rest.trim_start_matches(['\n', '\r']);
    let body = body.strip_prefix("---\n").unwrap_or(body);
    (selection, body.trim().to_string())
}
