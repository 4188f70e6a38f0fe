//! Meta-Reasoner: reconcile a page's full candidate history into its final text.
//!
//! The latest round is not necessarily the best: a correction can overshoot.
//! The model sees every round with the critique that produced it and either
//! picks one (`SELECTED: <n>`, in which case that round's text is used
//! verbatim) or blends them (`SELECTED: blend`, or no header at all).
//!
//! Meta-reasoning never fails a page. When the call exhausts its retries, or
//! returns nothing usable, the latest candidate becomes final with
//! [`Selection::Fallback`]. Only cancellation propagates.

use crate::document::{CandidateHistory, CandidateStage, FinalMarkdown, Selection};
use crate::error::PageError;
use crate::pipeline::generate::ModelSettings;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::retry::{CallTally, RetryExecutor};
use crate::progress::Stage;
use crate::prompts::{finalize_prompt, meta_prompt, parse_meta, FINALIZE_SYSTEM_PROMPT, META_SYSTEM_PROMPT};
use edgequake_llm::ImageData;
use tracing::{debug, warn};

/// Final text plus, on fallback, the error that forced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub final_markdown: FinalMarkdown,
    pub fallback_cause: Option<PageError>,
}

/// Produce the final markdown from the full history.
///
/// Returns `Err` only for [`PageError::Cancelled`], or for an empty history.
pub async fn reconcile(
    exec: &RetryExecutor,
    model: &ModelSettings,
    page: usize,
    image: Option<&ImageData>,
    ocr_text: &str,
    history: &CandidateHistory,
    tally: &mut CallTally,
) -> Result<Reconciled, PageError> {
    let Some(latest) = history.latest() else {
        return Err(PageError::GenerationError {
            page,
            stage: Stage::Meta.to_string(),
            attempts: 0,
            detail: "no candidate to reconcile".into(),
        });
    };

    let fallback = |cause: Option<PageError>| Reconciled {
        final_markdown: FinalMarkdown {
            text: latest.text.clone(),
            selection: Selection::Fallback(latest.round),
            stage: CandidateStage::Meta,
        },
        fallback_cause: cause,
    };

    let request = model.request(META_SYSTEM_PROMPT, meta_prompt(ocr_text, history.as_slice()), image);
    let reply = match exec.generate(&request, page, Stage::Meta, tally).await {
        Ok(reply) => reply,
        Err(e @ PageError::Cancelled { .. }) => return Err(e),
        Err(e) => {
            warn!("Page {}: meta-reasoning unavailable, using round {}: {}", page, latest.round, e);
            return Ok(fallback(Some(e)));
        }
    };

    let max_round = latest.round;
    let (selection, body) = parse_meta(&reply, max_round);
    let text = match selection {
        Selection::Round(n) => history
            .as_slice()
            .get(n as usize)
            .map(|c| c.text.clone())
            .unwrap_or_default(),
        _ => clean_markdown(&body),
    };

    if text.trim().is_empty() {
        warn!("Page {}: meta-reasoning returned no markdown, using round {}", page, latest.round);
        return Ok(fallback(None));
    }

    debug!("Page {}: meta-reasoning selected {:?}", page, selection);
    Ok(Reconciled {
        final_markdown: FinalMarkdown {
            text,
            selection,
            stage: CandidateStage::Meta,
        },
        fallback_cause: None,
    })
}

/// Optional cleanup pass that strips model commentary from the final text.
///
/// Keeps the input unchanged on failure; only cancellation propagates.
pub async fn finalize(
    exec: &RetryExecutor,
    model: &ModelSettings,
    page: usize,
    image: Option<&ImageData>,
    reconciled: FinalMarkdown,
    tally: &mut CallTally,
) -> Result<FinalMarkdown, PageError> {
    let request = model.request(FINALIZE_SYSTEM_PROMPT, finalize_prompt(&reconciled.text), image);
    match exec.generate(&request, page, Stage::Finalize, tally).await {
        Ok(reply) => {
            let text = clean_markdown(&reply);
            if text.trim().is_empty() {
                return Ok(reconciled);
            }
            Ok(FinalMarkdown { text, ..reconciled })
        }
        Err(e @ PageError::Cancelled { .. }) => Err(e),
        Err(e) => {
            warn!("Page {}: finalize pass failed, keeping meta-reasoned text: {}", page, e);
            Ok(reconciled)
        }
    }
}
