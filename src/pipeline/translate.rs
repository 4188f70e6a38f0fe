//! Optional translation post-stage.
//!
//! Runs on a page's final markdown when `translate_to` is configured. A
//! translation failure is logged and leaves the page without a translation;
//! it never changes the page status. Only cancellation propagates.

use crate::error::PageError;
use crate::pipeline::generate::ModelSettings;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::retry::{CallTally, RetryExecutor};
use crate::progress::Stage;
use crate::prompts::{translate_prompt, TRANSLATE_SYSTEM_PROMPT};
use edgequake_llm::ImageData;
use tracing::{debug, warn};

pub async fn translate(
    exec: &RetryExecutor,
    model: &ModelSettings,
    page: usize,
    language: &str,
    image: Option<&ImageData>,
    markdown: &str,
    tally: &mut CallTally,
) -> Result<Option<String>, PageError> {
    let request = model.request(TRANSLATE_SYSTEM_PROMPT, translate_prompt(language, markdown), image);
    match exec.generate(&request, page, Stage::Translate, tally).await {
        Ok(reply) => {
            let text = clean_markdown(&reply);
            debug!("Page {}: translated to {} ({} chars)", page, language, text.len());
            Ok(Some(text).filter(|t| !t.is_empty()))
        }
        Err(e @ PageError::Cancelled { .. }) => Err(e),
        Err(e) => {
            warn!("Page {}: translation to {} failed: {}", page, language, e);
            Ok(None)
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
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Shouting;

    #[async_trait]
    impl TextGenerator for Shouting {
        async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationServiceError> {
            if req.prompt.contains("Klingon") {
                return Err(GenerationServiceError::ServiceUnavailable("no such language".into()));
            }
            let body = req.prompt.split("\n\n").nth(1).unwrap_or_default();
            Ok(body.to_uppercase())
        }
    }

    fn executor() -> RetryExecutor {
        RetryExecutor::new(
            Arc::new(Shouting),
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
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn translates_final_markdown() {
        let mut tally = CallTally::default();
        let out = translate(&executor(), &model(), 1, "French", None, "# hello", &mut tally)
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("# HELLO\n"));
        assert_eq!(tally.calls, 1);
    }

    #[tokio::test]
    async fn failure_yields_no_translation() {
        let mut tally = CallTally::default();
        let out = translate(&executor(), &model(), 1, "Klingon", None, "# hello", &mut tally)
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
