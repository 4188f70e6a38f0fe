//! Retry executor shared by every generation stage.
//!
//! ## Policy
//!
//! A call is attempted `1 + max_retries` times. Before retry `n` the executor
//! waits `retry_backoff_ms * 2^(n-1)`: with the defaults (500 ms, 3 retries)
//! that is 500 ms → 1 s → 2 s. A server-supplied `retry_after` replaces the
//! computed delay. `InvalidRequest` is final on the first attempt.
//!
//! ## Cancellation
//!
//! Every wait (backoff, throttle, cooldown) and every call races the run's
//! [`CancellationToken`]. A call already in flight when the token fires gets
//! `cancel_grace_ms` to settle before it is dropped. Either way the page is
//! reported as [`PageError::Cancelled`]; a result that lands inside the grace
//! window is discarded.

use crate::config::ConversionConfig;
use crate::error::{GenerationServiceError, PageError};
use crate::pipeline::generate::{GenerationRequest, TextGenerator};
use crate::pipeline::throttle::Throttle;
use crate::progress::Stage;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The run was cancelled while waiting or calling out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Backoff schedule and cancellation grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub cancel_grace: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
        }
    }

    /// Delay before retry `n` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Per-page call accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTally {
    /// Calls actually dispatched to a backend.
    pub calls: u32,
    /// Attempts beyond the first, across all stages.
    pub retries: u32,
}

/// Sleep for `delay` unless the token fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Drive `fut` to completion unless the token fires; after that it gets
/// `grace` more before being dropped.
pub async fn with_grace<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<F::Output, Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return Ok(out),
        _ = cancel.cancelled() => {}
    }
    match tokio::time::timeout(grace, &mut fut).await {
        Ok(_) => debug!("In-flight call settled within cancellation grace"),
        Err(_) => debug!("In-flight call abandoned after {:?} grace", grace),
    }
    Err(Cancelled)
}

/// Issues generation calls for one run: throttled, retried, cancellable.
#[derive(Clone)]
pub struct RetryExecutor {
    generator: Arc<dyn TextGenerator>,
    throttle: Arc<Throttle>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        throttle: Arc<Throttle>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generator,
            throttle,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `request` under the retry policy, mapping exhaustion onto a
    /// page-level error for `stage` of `page`.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        page: usize,
        stage: Stage,
        tally: &mut CallTally,
    ) -> Result<String, PageError> {
        let cancelled = |_: Cancelled| PageError::Cancelled { page };

        if let Err(e) = request.validate() {
            return Err(PageError::InvalidRequest {
                page,
                stage: stage.to_string(),
                detail: e.to_string(),
            });
        }

        let max_attempts = self.policy.max_retries + 1;
        let mut last_err: Option<GenerationServiceError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = match last_err {
                    Some(GenerationServiceError::RateLimited {
                        retry_after: Some(after),
                    }) => after,
                    _ => self.policy.delay_for(attempt - 1),
                };
                warn!(
                    "Page {}: {} retry {}/{} after {:?}",
                    page,
                    stage,
                    attempt - 1,
                    self.policy.max_retries,
                    delay
                );
                tally.retries += 1;
                sleep_or_cancel(delay, &self.cancel).await.map_err(cancelled)?;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PageError::Cancelled { page }),
                permit = self.throttle.acquire() => permit.map_err(|e| PageError::GenerationError {
                    page,
                    stage: stage.to_string(),
                    attempts: attempt - 1,
                    detail: e.to_string(),
                })?,
            };

            tally.calls += 1;
            let result = with_grace(
                self.generator.generate(request),
                &self.cancel,
                self.policy.cancel_grace,
            )
            .await
            .map_err(cancelled)?;
            drop(permit);

            match result {
                Ok(text) => {
                    debug!("Page {}: {} succeeded on attempt {}", page, stage, attempt);
                    return Ok(text);
                }
                Err(GenerationServiceError::InvalidRequest(detail)) => {
                    warn!("Page {}: {} rejected: {}", page, stage, detail);
                    return Err(PageError::InvalidRequest {
                        page,
                        stage: stage.to_string(),
                        detail,
                    });
                }
                Err(e) => {
                    if let GenerationServiceError::RateLimited { retry_after } = e {
                        let cooldown = retry_after.unwrap_or_else(|| self.policy.delay_for(attempt));
                        self.throttle.on_rate_limited(cooldown);
                    }
                    warn!("Page {}: {} attempt {} failed: {}", page, stage, attempt, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(GenerationServiceError::RateLimited { .. }) => PageError::RateLimited {
                page,
                stage: stage.to_string(),
                attempts: max_attempts,
            },
            other => PageError::GenerationError {
                page,
                stage: stage.to_string(),
                attempts: max_attempts,
                detail: other
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt was made".to_string()),
            },
        })
    }
}
