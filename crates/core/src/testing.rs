//! 测试替身：可编排的模型和可观察的输出缓冲。

use std::{
    io::{self, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    message::Message,
    model::{ChunkHandler, GenerateOptions, Model, ModelResponse, RequestCancelled},
};

/// 分片发完之后的行为。
#[derive(Debug, Clone)]
enum AfterChunks {
    Finish,
    Fail(String),
    Block,
}

/// 按脚本回复的模型。
#[derive(Debug)]
pub(crate) struct ScriptedModel {
    chunks: Vec<String>,
    after_chunks: AfterChunks,
    batch_reply: Option<String>,
    no_choices: bool,
    failures_left: AtomicUsize,
    failure_message: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub(crate) fn new() -> Self {
        Self {
            chunks: Vec::new(),
            after_chunks: AfterChunks::Finish,
            batch_reply: None,
            no_choices: false,
            failures_left: AtomicUsize::new(0),
            failure_message: String::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// 分片发完后以错误结束。
    pub(crate) fn then_fail(mut self, message: &str) -> Self {
        self.after_chunks = AfterChunks::Fail(message.to_string());
        self
    }

    /// 分片发完后一直挂起，直到被取消。
    pub(crate) fn then_block(mut self) -> Self {
        self.after_chunks = AfterChunks::Block;
        self
    }

    pub(crate) fn with_batch_reply(mut self, reply: &str) -> Self {
        self.batch_reply = Some(reply.to_string());
        self
    }

    /// 批量调用返回零个候选。
    pub(crate) fn with_no_choices(mut self) -> Self {
        self.no_choices = true;
        self
    }

    /// 前 `times` 次调用直接失败（批量和流式都算）。
    pub(crate) fn fail_batch_times(self, times: usize, message: &str) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        Self {
            failure_message: message.to_string(),
            ..self
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .clone()
    }

    fn begin_call(&self, messages: &[Message]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .push(messages.to_vec());

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow!(self.failure_message.clone()));
        }
        Ok(())
    }

    async fn finish(&self, cancel: &CancellationToken) -> Result<ModelResponse> {
        match &self.after_chunks {
            AfterChunks::Finish => {
                if self.no_choices {
                    Ok(ModelResponse::default())
                } else {
                    let reply = self
                        .batch_reply
                        .clone()
                        .unwrap_or_else(|| self.chunks.concat());
                    Ok(ModelResponse::single(reply))
                }
            }
            AfterChunks::Fail(message) => Err(anyhow!(message.clone())),
            AfterChunks::Block => {
                cancel.cancelled().await;
                Err(RequestCancelled.into())
            }
        }
    }
}

impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        _options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            self.begin_call(messages)?;
            if cancel.is_cancelled() {
                return Err(RequestCancelled.into());
            }
            self.finish(cancel).await
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
            self.begin_call(messages)?;
            for chunk in &self.chunks {
                if cancel.is_cancelled() {
                    return Err(RequestCancelled.into());
                }
                on_chunk(cancel.clone(), chunk.clone()).await?;
            }
            self.finish(cancel).await
        })
    }
}

/// 可在测试里读回内容的输出缓冲；可选地在第 N 次写入时触发取消。
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
    cancel_at: Option<(usize, CancellationToken)>,
}

impl SharedBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel_after_writes(mut self, writes: usize, cancel: CancellationToken) -> Self {
        self.cancel_at = Some((writes, cancel));
        self
    }

    pub(crate) fn contents(&self) -> String {
        let bytes = self.bytes.lock().expect("buffer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .expect("buffer lock should not be poisoned")
            .extend_from_slice(buf);
        let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, cancel)) = &self.cancel_at
            && writes == *at
        {
            cancel.cancel();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
