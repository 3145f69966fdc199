use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{ChunkHandler, GenerateOptions, Model, ModelResponse, RequestCancelled};
use crate::message::{Message, Role};

const DEFAULT_REPLY: &str = "This is a dummy backend response. It will stream out a few hundred tokens to simulate a real backend. The quick brown fox jumps over the lazy dog. This pangram contains every letter of the English alphabet at least once. This concludes the dummy backend response. Thank you for using the dummy backend!";

const PYTHON_REPLY: &str = "This is a dummy backend response. Here's a Python function to calculate Fibonacci numbers:

```python
def fibonacci(n):
    if n <= 1:
        return n
    return fibonacci(n-1) + fibonacci(n-2)
```

This concludes the dummy backend response.";

/// 离线后端：不联网，返回固定回复，流式模式下逐词交付。
///
/// 用于本地试跑和端到端测试。
#[derive(Debug, Clone)]
pub struct DummyModel {
    reply: Option<String>,
    chunk_delay: Duration,
}

impl Default for DummyModel {
    fn default() -> Self {
        Self {
            reply: None,
            chunk_delay: Duration::from_millis(40),
        }
    }
}

impl DummyModel {
    /// 固定回复，不再按输入挑选。
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn reply_for(&self, messages: &[Message]) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content().to_ascii_lowercase())
            .unwrap_or_default();
        if last_user.contains("python") || last_user.contains("fibonacci") {
            PYTHON_REPLY.to_string()
        } else {
            DEFAULT_REPLY.to_string()
        }
    }
}

impl Model for DummyModel {
    fn name(&self) -> &str {
        "dummy"
    }

    fn generate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        _options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(RequestCancelled.into());
            }
            Ok(ModelResponse::single(self.reply_for(messages)))
        })
    }

    fn generate_streaming<'a, 'h: 'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        _options: &'a GenerateOptions,
        on_chunk: &'a mut ChunkHandler<'h>,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            let reply = self.reply_for(messages);
            for word in reply.split_inclusive(' ') {
                if !self.chunk_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RequestCancelled.into()),
                        _ = tokio::time::sleep(self.chunk_delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return Err(RequestCancelled.into());
                }
                on_chunk(cancel.clone(), word.to_string()).await?;
            }
            Ok(ModelResponse::single(reply))
        })
    }
}
