use std::io;

use thiserror::Error;

/// 单次生成（`Orchestrator::generate`）的失败原因。
#[derive(Debug, Error)]
pub enum CompletionError {
    /// 本轮被取消（Ctrl-C、超时或会话级取消）。已产出的部分文本已提交到消息日志。
    #[error("generation cancelled")]
    Cancelled,
    /// 模型返回零个候选。
    #[error("no response from model")]
    EmptyResponse,
    /// 模型/后端错误（网络、鉴权、协议等）。Display 已包含完整错误链，不再暴露 `source()`。
    #[error("failed to generate content: {0:#}")]
    Model(anyhow::Error),
    /// 生产者任务异常退出（panic 或被 abort）。
    #[error("generation task failed: {0}")]
    Task(String),
}

impl CompletionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompletionError::Cancelled)
    }
}

/// 历史文件读写错误。
#[derive(Debug, Error)]
pub enum HistoryError {
    /// 结构化历史中出现了未知的内容片段类型。
    #[error("unknown content part type: {0}")]
    UnknownPartType(String),
    /// 结构化格式解析失败。
    #[error("invalid structured history: {0}")]
    Decode(String),
    /// 旧版 `role: content` 文本格式中没有任何可用消息。
    #[error("no usable messages in legacy history")]
    EmptyLegacy,
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl HistoryError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        HistoryError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
