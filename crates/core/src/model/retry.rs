//! 带指数退避的重试层。
//!
//! 包在任意 [`Model`] 外面，只对 [`ErrorClassifier`] 判定为可重试的错误重试：
//! - 批量调用：整次请求重试；
//! - 流式调用：只有在尚未交付任何分片时才重试，避免用户看到重复输出。

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    ChunkHandler, ClassifiedError, ErrorClassifier, GenerateOptions, Model, ModelResponse,
    RequestCancelled,
};
use crate::{
    message::Message,
    observability::{EventSink, SessionEvent, ts},
};

/// 重试参数（对应配置文件中的 `[retry]` 表）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 总尝试次数（含第一次），最小为 1。
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// 抖动比例：实际等待在 `[delay * (1 - jitter), delay]` 之间。
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间。
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);
        let jitter = 1.0 - rand::random::<f64>() * self.jitter.clamp(0.0, 1.0);
        Duration::from_millis((capped * jitter).max(0.0).round() as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

pub struct RetryingModel<M> {
    inner: M,
    config: RetryConfig,
    classifier: ErrorClassifier,
    events: Arc<dyn EventSink>,
}

impl<M: Model> RetryingModel<M> {
    pub fn new(inner: M, config: RetryConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            config,
            classifier: ErrorClassifier,
            events,
        }
    }

    fn classify(&self, error: &anyhow::Error) -> ClassifiedError {
        let classified = self.classifier.classify(error);
        self.events.record(SessionEvent::ErrorClassified {
            ts: ts(),
            category: classified.category.as_str().to_string(),
            status_code: classified.status_code,
            provider_error_code: classified.provider_error_code.clone(),
            retryable: classified.is_retryable(),
            summary: classified.summary.clone(),
        });
        classified
    }

    /// 决定是否再试一次；需要重试时等待退避时间。
    ///
    /// 返回 `Ok(())` 表示继续下一次尝试，`Err` 为应当直接返回的错误。
    async fn before_retry(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
        error: anyhow::Error,
        may_retry: bool,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(error);
        }
        let classified = self.classify(&error);
        if !classified.is_retryable() || !may_retry {
            return Err(error);
        }
        if attempt >= self.config.attempts() {
            self.events.record(SessionEvent::RetryExhausted {
                ts: ts(),
                attempts: attempt,
                last_error: classified.summary,
            });
            return Err(error);
        }

        let backoff = self.config.backoff_for(attempt);
        self.events.record(SessionEvent::RetryScheduled {
            ts: ts(),
            attempt,
            backoff_ms: backoff.as_millis(),
            reason: classified.category.as_str().to_string(),
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestCancelled.into()),
            _ = tokio::time::sleep(backoff) => Ok(()),
        }
    }
}

impl<M: Model> Model for RetryingModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match self.inner.generate(cancel, messages, options).await {
                    Ok(response) => return Ok(response),
                    Err(error) => self.before_retry(cancel, attempt, error, true).await?,
                }
                attempt += 1;
            }
        })
    }

    fn generate_streaming<'a, 'h: 'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        options: &'a GenerateOptions,
        on_chunk: &'a mut ChunkHandler<'h>,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            let delivered = AtomicBool::new(false);
            let mut attempt = 1;
            loop {
                let outcome = {
                    let delivered = &delivered;
                    let on_chunk = &mut *on_chunk;
                    let mut forward = move |cancel: CancellationToken, chunk: String| {
                        delivered.store(true, Ordering::Relaxed);
                        on_chunk(cancel, chunk)
                    };
                    self.inner
                        .generate_streaming(cancel, messages, options, &mut forward)
                        .await
                };
                match outcome {
                    Ok(response) => return Ok(response),
                    Err(error) => {
                        let may_retry = !delivered.load(Ordering::Relaxed);
                        self.before_retry(cancel, attempt, error, may_retry).await?;
                    }
                }
                attempt += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{observability::MemorySink, testing::ScriptedModel};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(30), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let config = RetryConfig {
            jitter: 0.5,
            ..RetryConfig::default()
        };
        for _ in 0..32 {
            let delay = config.backoff_for(2);
            assert!(delay <= Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let inner = ScriptedModel::new()
            .fail_batch_times(2, "connection reset by peer")
            .with_batch_reply("recovered");
        let events = Arc::new(MemorySink::new());
        let model = RetryingModel::new(inner, fast_retry(3), events.clone());

        let response = model
            .generate(
                &CancellationToken::new(),
                &[Message::user("hi")],
                &GenerateOptions::default(),
            )
            .await
            .expect("third attempt should succeed");

        assert_eq!(response.first_content(), Some("recovered"));
        let scheduled = events
            .events()
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::RetryScheduled { .. }))
            .count();
        assert_eq!(scheduled, 2);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let inner = ScriptedModel::new()
            .fail_batch_times(1, "401 Unauthorized")
            .with_batch_reply("never");
        let model = RetryingModel::new(inner, fast_retry(3), Arc::new(MemorySink::new()));

        let error = model
            .generate(
                &CancellationToken::new(),
                &[Message::user("hi")],
                &GenerateOptions::default(),
            )
            .await
            .expect_err("auth error should surface");
        assert!(error.to_string().contains("401"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let inner = ScriptedModel::new().fail_batch_times(5, "503 Service Unavailable");
        let events = Arc::new(MemorySink::new());
        let model = RetryingModel::new(inner, fast_retry(2), events.clone());

        let error = model
            .generate(
                &CancellationToken::new(),
                &[Message::user("hi")],
                &GenerateOptions::default(),
            )
            .await
            .expect_err("retries should be exhausted");
        assert!(error.to_string().contains("503"));
        assert!(
            events
                .events()
                .iter()
                .any(|event| matches!(event, SessionEvent::RetryExhausted { attempts: 2, .. }))
        );
    }

    #[tokio::test]
    async fn streaming_is_not_retried_after_a_chunk_was_delivered() {
        let inner = ScriptedModel::new()
            .with_chunks(["partial"])
            .then_fail("connection reset by peer");
        let model = RetryingModel::new(inner, fast_retry(3), Arc::new(MemorySink::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut handler = move |_cancel: CancellationToken, chunk: String| -> BoxFuture<'static, Result<()>> {
            sink.lock().expect("lock should not be poisoned").push(chunk);
            Box::pin(async { Ok(()) })
        };

        let error = model
            .generate_streaming(
                &CancellationToken::new(),
                &[Message::user("hi")],
                &GenerateOptions::default(),
                &mut handler,
            )
            .await
            .expect_err("mid-stream failure should surface");

        assert!(error.to_string().contains("connection reset"));
        assert_eq!(*seen.lock().expect("lock should not be poisoned"), vec!["partial"]);
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let inner = ScriptedModel::new().fail_batch_times(3, "timed out");
        let model = RetryingModel::new(inner, fast_retry(3), Arc::new(MemorySink::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        model
            .generate(&cancel, &[Message::user("hi")], &GenerateOptions::default())
            .await
            .expect_err("cancelled call should fail");
        assert_eq!(model.inner.calls(), 1);
    }
}
