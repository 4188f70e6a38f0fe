//! Markdown Converter: page image + OCR text → round 0.

use crate::document::{CandidateStage, MarkdownCandidate};
use crate::error::PageError;
use crate::pipeline::generate::ModelSettings;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::retry::{CallTally, RetryExecutor};
use crate::progress::Stage;
use crate::prompts::{convert_prompt, CONVERT_SYSTEM_PROMPT};
use edgequake_llm::ImageData;
use tracing::debug;

/// Produce the initial candidate for a page.
///
/// The image is attached so the model can resolve what OCR got wrong; the OCR
/// text anchors the wording.
pub async fn convert(
    exec: &RetryExecutor,
    model: &ModelSettings,
    page: usize,
    image: Option<&ImageData>,
    ocr_text: &str,
    tally: &mut CallTally,
) -> Result<MarkdownCandidate, PageError> {
    let request = model.request(CONVERT_SYSTEM_PROMPT, convert_prompt(ocr_text), image);
    let reply = exec.generate(&request, page, Stage::Convert, tally).await?;
    let text = clean_markdown(&reply);
    debug!("Page {}: initial conversion → {} chars", page, text.len());

    Ok(MarkdownCandidate {
        round: 0,
        text,
        critique: None,
        stage: CandidateStage::Initial,
    })
}
