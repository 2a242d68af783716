//! Bounded retry with exponential backoff for transient provider errors.
//!
//! LLM calls retry on network/5xx failures; rate-limit responses are not
//! retried here (the caller is expected to back off at a higher level).
//! Tool calls never pass through this wrapper — they may have side effects.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::StreamEvent;

/// Wraps an [`LlmProvider`] and retries transient failures.
pub struct RetryProvider {
    inner: Box<dyn LlmProvider>,
    max_retries: u32,
}

impl RetryProvider {
    /// `max_retries` counts retries, not attempts: 2 means up to 3 calls.
    pub fn new(inner: Box<dyn LlmProvider>, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    fn backoff(attempt: u32) -> tokio::time::Duration {
        tokio::time::Duration::from_millis(200u64 << attempt)
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=self.max_retries {
            match self.inner.send(req).await {
                Ok(resp) => {
                    if attempt > 0 {
                        info!(provider = %self.inner.name(), attempt, "request succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    warn!(provider = %self.inner.name(), attempt, err = %e, "provider send failed");
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient || attempt == self.max_retries {
                        break;
                    }
                    tokio::time::sleep(Self::backoff(attempt)).await;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("provider failed".to_string())))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=self.max_retries {
            match self.inner.send_stream(req, tx.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(provider = %self.inner.name(), attempt, "stream succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(provider = %self.inner.name(), attempt, err = %e, "provider send_stream failed");
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient || attempt == self.max_retries {
                        break;
                    }
                    tokio::time::sleep(Self::backoff(attempt)).await;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("provider failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Message, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailThenOk {
        failures: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FailThenOk {
        fn name(&self) -> &str {
            "fail-then-ok"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
            {
                return Err(ProviderError::Unavailable("transient".to_string()));
            }
            Ok(ChatResponse {
                content: "ok".to_string(),
                model: req.model.clone(),
                usage: Usage::default(),
                stop_reason: "end_turn".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn dummy_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: "You are a test.".to_string(),
            messages: vec![Message::user("hello")],
            max_tokens: 64,
            temperature: None,
            stream: false,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let provider = RetryProvider::new(
            Box::new(FailThenOk {
                failures: AtomicU32::new(2),
            }),
            2,
        );
        let resp = provider.send(&dummy_request()).await.unwrap();
        assert_eq!(resp.content, "ok");
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let provider = RetryProvider::new(
            Box::new(FailThenOk {
                failures: AtomicU32::new(10),
            }),
            1,
        );
        assert!(provider.send(&dummy_request()).await.is_err());
    }

    struct AlwaysRateLimited;

    #[async_trait]
    impl LlmProvider for AlwaysRateLimited {
        fn name(&self) -> &str {
            "rate-limited"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::RateLimited { retry_after_ms: 50 })
        }
    }

    #[tokio::test]
    async fn rate_limited_is_not_retried() {
        let provider = RetryProvider::new(Box::new(AlwaysRateLimited), 3);
        let err = provider.send(&dummy_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }
}
