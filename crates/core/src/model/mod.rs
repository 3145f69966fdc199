//! 模型能力抽象。
//!
//! Orchestrator 只依赖 [`Model`] 这一契约；任何后端（HTTP API、本地模型、测试替身）
//! 只要实现它就可以互换。

pub mod classify;
pub mod connection;
pub mod dummy;
pub mod retry;

use std::sync::Arc;

use anyhow::{Result, bail};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{config::Config, message::Message, observability::EventSink};

pub use classify::{ClassifiedError, ErrorCategory, ErrorClassifier};
pub use connection::{Connection, Provider, RigModel};
pub use dummy::DummyModel;
pub use retry::{RetryConfig, RetryingModel};

/// 生成参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// 单个候选回复。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub content: String,
}

/// 模型响应；`choices` 为空表示模型没有给出任何回复。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub choices: Vec<Choice>,
}

impl ModelResponse {
    pub fn single(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                content: content.into(),
            }],
        }
    }

    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|choice| choice.content.as_str())
    }
}

/// 流式分片回调：返回错误时模型必须停止生成。
pub type ChunkHandler<'h> =
    dyn FnMut(CancellationToken, String) -> BoxFuture<'static, Result<()>> + Send + 'h;

/// 请求因取消而中止。
///
/// 后端在观察到取消令牌后返回该错误，分类器据此区分“取消”和“后端故障”。
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("request cancelled")]
pub struct RequestCancelled;

/// 文本生成能力（批量 + 流式）。
pub trait Model: Send + Sync {
    /// 用于日志展示的后端/模型名。
    fn name(&self) -> &str;

    /// 一次阻塞式生成。
    fn generate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ModelResponse>>;

    /// 流式生成：每个分片交给 `on_chunk`，回调报错时立即停止。
    fn generate_streaming<'a, 'h: 'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        options: &'a GenerateOptions,
        on_chunk: &'a mut ChunkHandler<'h>,
    ) -> BoxFuture<'a, Result<ModelResponse>>;
}

/// 按配置构建模型，并套上重试层。
pub fn build_model(config: &Config, events: Arc<dyn EventSink>) -> Result<Arc<dyn Model>> {
    let retry = config.retry.clone();
    let backend = config.backend.trim().to_ascii_lowercase();

    if backend == "dummy" {
        return Ok(Arc::new(RetryingModel::new(
            DummyModel::default(),
            retry,
            events,
        )));
    }

    let Some(provider) = Provider::parse(&backend) else {
        bail!(
            "unknown backend `{}` (expected one of: dummy, openai, openai-api, codex, claude, gemini)",
            config.backend
        );
    };
    let model_name = match config.model.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => provider.default_model().to_string(),
    };

    let connection = Connection::new(
        provider,
        config.api_url.clone().unwrap_or_default(),
        config.api_key.clone().unwrap_or_default(),
        model_name,
    );
    Ok(Arc::new(RetryingModel::new(
        RigModel::new(connection),
        retry,
        events,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NullSink;

    #[test]
    fn build_model_should_accept_dummy_backend() {
        let config = Config {
            backend: "Dummy".to_string(),
            ..Config::default()
        };
        let model = build_model(&config, Arc::new(NullSink)).expect("dummy backend should build");
        assert_eq!(model.name(), "dummy");
    }

    #[test]
    fn build_model_should_reject_unknown_backend() {
        let config = Config {
            backend: "carrier-pigeon".to_string(),
            ..Config::default()
        };
        let error = build_model(&config, Arc::new(NullSink))
            .err()
            .expect("unknown backend should fail");
        assert!(error.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn model_response_first_content() {
        assert_eq!(ModelResponse::single("hi").first_content(), Some("hi"));
        assert_eq!(ModelResponse::default().first_content(), None);
    }
}
