//! Bounded retry around one generation call.
//!
//! Attempt `k` (0-indexed) waits `2^(k-1)` backoff units first, so the first
//! attempt is immediate. No jitter, no circuit breaker. A call that never
//! returns is only bounded by the transport's own per-call timeout.

use crate::client::GenerationTransport;
use crate::error::{GenError, Result};
use crate::types::GenerationRequest;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before attempt `attempt` (0-indexed). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Clone)]
pub struct ResilientDispatcher {
    transport: Arc<dyn GenerationTransport>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientDispatcher {
    pub fn new(transport: Arc<dyn GenerationTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model))]
    pub async fn call(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let total = self.policy.total_attempts();
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.policy.delay_before(attempt);
                tracing::debug!(attempt, ?delay, "backing off before retry");
                self.sleeper.sleep(delay).await;
            }

            match self.transport.send(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "generation call succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(error) if !error.is_retryable() => {
                    match &error {
                        GenError::Status { status, body } => {
                            tracing::error!(status, %body, "generation call rejected; not retrying");
                        }
                        other => {
                            tracing::error!(error = %other, "generation call failed; not retrying");
                        }
                    }
                    return Err(error);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= total {
                        tracing::error!(%error, attempts = total, "generation call failed after all attempts");
                        return Err(error);
                    }
                    tracing::warn!(
                        %error,
                        status = ?error.status(),
                        attempt,
                        total,
                        "generation call failed; retrying"
                    );
                }
            }
        }
    }
}
