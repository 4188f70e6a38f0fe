//! Feedback Refiner: critique-and-correct loop over a page's history.
//!
//! ## State machine
//!
//! ```text
//!              ┌────────────────────────────────────────────┐
//!              ▼                                            │
//! Converted ─► Critiquing ──(REVISE)──► Refining ──append───┘
//!    │             │
//!    │             ├──(CONVERGED)──► append confirmation ──► Converged
//!    │             └──(call failed)──────────────────────────► Aborted
//!    └──(rounds == max)──────────────────────────────────────► MaxRoundsReached
//! ```
//!
//! Every transition out of `Refining` appends exactly one round, so the loop
//! can never append more than `max_refinement_rounds` candidates. Convergence
//! also appends one round (a confirmation whose text equals the previous
//! candidate, with no generation call), so the history always records which
//! critique ended the loop.

use crate::document::CandidateHistory;
use crate::error::PageError;
use crate::pipeline::generate::ModelSettings;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::retry::{CallTally, RetryExecutor};
use crate::progress::{ProgressCallback, Stage};
use crate::prompts::{critique_prompt, parse_critique, refine_prompt, Critique, CONVERT_SYSTEM_PROMPT, CRITIQUE_SYSTEM_PROMPT};
use edgequake_llm::ImageData;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineOutcome {
    /// The critique asked for no further change.
    Converged,
    /// The round limit was hit.
    MaxRoundsReached,
    /// A critique or correction call failed after retries; the history ends
    /// at the last successful candidate.
    Aborted,
}

#[derive(Debug)]
enum State {
    Converted,
    Critiquing,
    Refining(Critique, String),
    Done(RefineOutcome),
}

/// Result of running the loop on one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineReport {
    pub outcome: RefineOutcome,
    /// The failure that aborted the loop.
    pub error: Option<PageError>,
}

pub struct Refiner<'a> {
    pub exec: &'a RetryExecutor,
    pub model: &'a ModelSettings,
    pub max_rounds: u32,
    pub min_critique_chars: usize,
    pub progress: Option<&'a ProgressCallback>,
}

impl Refiner<'_> {
    /// Run the loop until convergence, the round limit, or a failed call.
    ///
    /// `history` must already hold round 0.
    pub async fn run(
        &self,
        page: usize,
        image: Option<&ImageData>,
        ocr_text: &str,
        history: &mut CandidateHistory,
        tally: &mut CallTally,
    ) -> RefineReport {
        let mut error = None;
        let mut state = State::Converted;

        let outcome = loop {
            state = match state {
                State::Done(outcome) => break outcome,

                State::Converted => {
                    if history.refinement_rounds() >= self.max_rounds {
                        State::Done(RefineOutcome::MaxRoundsReached)
                    } else {
                        State::Critiquing
                    }
                }

                State::Critiquing => {
                    self.stage(page, Stage::Critique);
                    let Some(latest) = history.latest() else {
                        break RefineOutcome::Aborted;
                    };
                    let request = self.model.request(
                        CRITIQUE_SYSTEM_PROMPT,
                        critique_prompt(ocr_text, &latest.text),
                        image,
                    );
                    match self.exec.generate(&request, page, Stage::Critique, tally).await {
                        Err(e) => {
                            error = Some(e);
                            State::Done(RefineOutcome::Aborted)
                        }
                        Ok(reply) => {
                            let critique = parse_critique(&reply);
                            if critique.is_converged(self.min_critique_chars) {
                                let confirmed = latest.text.clone();
                                self.append(page, history, confirmed, reply.trim().to_string());
                                State::Done(RefineOutcome::Converged)
                            } else {
                                debug!("Page {}: critique requests changes ({:?})", page, critique.verdict);
                                State::Refining(critique, reply.trim().to_string())
                            }
                        }
                    }
                }

                State::Refining(critique, raw) => {
                    self.stage(page, Stage::Refine);
                    let Some(latest) = history.latest() else {
                        break RefineOutcome::Aborted;
                    };
                    let request = self.model.request(
                        CONVERT_SYSTEM_PROMPT,
                        refine_prompt(&critique.body, &latest.text),
                        image,
                    );
                    match self.exec.generate(&request, page, Stage::Refine, tally).await {
                        Err(e) => {
                            error = Some(e);
                            State::Done(RefineOutcome::Aborted)
                        }
                        Ok(reply) => {
                            self.append(page, history, clean_markdown(&reply), raw);
                            State::Converted
                        }
                    }
                }
            };
        };

        match (&outcome, &error) {
            (RefineOutcome::Aborted, Some(e)) => warn!(
                "Page {}: refinement stopped after round {}: {}",
                page,
                history.refinement_rounds(),
                e
            ),
            _ => info!(
                "Page {}: refinement {:?} after {} round(s)",
                page,
                outcome,
                history.refinement_rounds()
            ),
        }

        RefineReport { outcome, error }
    }

    fn append(&self, page: usize, history: &mut CandidateHistory, text: String, critique: String) {
        if let Some(candidate) = history.push_refined(text, critique) {
            if let Some(cb) = self.progress {
                cb.on_round(page, candidate.round);
            }
        }
    }

    fn stage(&self, page: usize, stage: Stage) {
        if let Some(cb) = self.progress {
            cb.on_stage(page, stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationServiceError;
    use crate::pipeline::generate::{GenerationRequest, TextGenerator};
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::throttle::Throttle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Critiques say REVISE until `converge_after` critiques have been issued;
    /// corrections append a marker. Fails every call after `fail_after` calls.
    struct Reviewer {
        converge_after: u32,
        fail_after: u32,
        critiques: AtomicU32,
        calls: AtomicU32,
    }

    impl Reviewer {
        fn new(converge_after: u32, fail_after: u32) -> Arc<Self> {
            Arc::new(Self {
                converge_after,
                fail_after,
                critiques: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Reviewer {
        async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationServiceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(GenerationServiceError::ServiceUnavailable("down".into()));
            }
            if req.system == CRITIQUE_SYSTEM_PROMPT {
                let n = self.critiques.fetch_add(1, Ordering::SeqCst);
                if n >= self.converge_after {
                    Ok("VERDICT: CONVERGED".into())
                } else {
                    Ok("VERDICT: REVISE\n- The second heading should be level two.".into())
                }
            } else {
                let current = req.prompt.rsplit("Current markdown:\n").next().unwrap_or("");
                Ok(format!("{}\nfixed", current.trim()))
            }
        }
    }

    fn executor(gen: Arc<dyn TextGenerator>) -> RetryExecutor {
        RetryExecutor::new(
            gen,
            Arc::new(Throttle::new(1, None)),
            RetryPolicy {
                max_retries: 0,
                backoff_ms: 1,
                cancel_grace: Duration::from_millis(5),
            },
            CancellationToken::new(),
        )
    }

    fn model() -> ModelSettings {
        ModelSettings {
            model_id: "stub".into(),
            temperature: 0.0,
            max_tokens: 512,
        }
    }

    fn seeded() -> CandidateHistory {
        let mut h = CandidateHistory::new();
        h.push_initial("# Draft\n".into());
        h
    }

    async fn run(gen: Arc<Reviewer>, max_rounds: u32, history: &mut CandidateHistory) -> RefineReport {
        let exec = executor(gen);
        let model = model();
        let refiner = Refiner {
            exec: &exec,
            model: &model,
            max_rounds,
            min_critique_chars: 24,
            progress: None,
        };
        let mut tally = CallTally::default();
        refiner.run(1, None, "ocr text", history, &mut tally).await
    }

    #[tokio::test]
    async fn converges_immediately_with_confirmation_round() {
        let mut h = seeded();
        let report = run(Reviewer::new(0, u32::MAX), 3, &mut h).await;
        assert_eq!(report.outcome, RefineOutcome::Converged);
        assert_eq!(h.len(), 2);
        assert_eq!(h.as_slice()[1].text, h.as_slice()[0].text);
        assert_eq!(h.as_slice()[1].critique.as_deref(), Some("VERDICT: CONVERGED"));
    }

    #[tokio::test]
    async fn stops_at_round_limit() {
        let mut h = seeded();
        let report = run(Reviewer::new(u32::MAX, u32::MAX), 3, &mut h).await;
        assert_eq!(report.outcome, RefineOutcome::MaxRoundsReached);
        assert_eq!(h.refinement_rounds(), 3);
        let rounds: Vec<u32> = h.as_slice().iter().map(|c| c.round).collect();
        assert_eq!(rounds, vec![0, 1, 2, 3]);
        assert!(h.latest().unwrap().text.ends_with("fixed\n"));
    }

    #[tokio::test]
    async fn converges_after_one_correction() {
        let mut h = seeded();
        let report = run(Reviewer::new(1, u32::MAX), 5, &mut h).await;
        assert_eq!(report.outcome, RefineOutcome::Converged);
        assert_eq!(h.len(), 3);
        assert_eq!(h.as_slice()[2].text, h.as_slice()[1].text);
    }

    #[tokio::test]
    async fn zero_rounds_skips_the_loop() {
        let mut h = seeded();
        let gen = Reviewer::new(0, u32::MAX);
        let report = run(gen.clone(), 0, &mut h).await;
        assert_eq!(report.outcome, RefineOutcome::MaxRoundsReached);
        assert_eq!(h.len(), 1);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_correction_aborts_at_last_good_round() {
        let mut h = seeded();
        // critique #1, refine #1, critique #2 succeed; refine #2 fails.
        let report = run(Reviewer::new(u32::MAX, 3), 3, &mut h).await;
        assert_eq!(report.outcome, RefineOutcome::Aborted);
        assert!(matches!(report.error, Some(PageError::GenerationError { .. })));
        assert_eq!(h.len(), 2);
    }

    #[tokio::test]
    async fn prior_candidates_are_never_mutated() {
        let mut h = seeded();
        let before = h.as_slice()[0].clone();
        run(Reviewer::new(u32::MAX, u32::MAX), 2, &mut h).await;
        assert_eq!(h.as_slice()[0], before);
    }
}
