//! 补全编排：一次生成尝试，恰好一次提交。
//!
//! 流式模式下，模型在独立任务里产出分片，经 `mpsc(1)` + `oneshot` 确认组成的交接点
//! 送到当前任务：生产者必须等到消费者确认（或取消）才会发送下一个分片。
//! 消费者负责写输出、累积文本，并在通道关闭后统一提交一次。

use std::{
    io::Write,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::CompletionError,
    message::{Message, MessageLog},
    model::{GenerateOptions, Model, ModelResponse, RequestCancelled},
    observability::{EventSink, SessionEvent, new_trace_id, ts},
    prefill::Prefill,
};

/// 交接点上传递的一个分片；消费者处理完后通过 `ack` 放行生产者。
struct StreamChunk {
    text: String,
    ack: oneshot::Sender<()>,
}

/// 消费端统计。
#[derive(Debug, Default)]
struct Consumed {
    text: String,
    chunks: usize,
}

pub struct Orchestrator {
    model: Arc<dyn Model>,
    log: MessageLog,
    prefill: Prefill,
    options: GenerateOptions,
    completion_timeout: Option<Duration>,
    output: Box<dyn Write + Send>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn Model>, events: Arc<dyn EventSink>) -> Self {
        Self {
            model,
            log: MessageLog::new(),
            prefill: Prefill::new(),
            options: GenerateOptions::default(),
            completion_timeout: None,
            output: Box::new(std::io::stdout()),
            events,
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// 单次生成的超时；到时按取消处理。
    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    /// 替换输出（默认标准输出）。
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// 供历史加载整体替换日志。
    pub fn log_mut(&mut self) -> &mut MessageLog {
        &mut self.log
    }

    pub fn add_user_message(&mut self, text: &str) -> bool {
        self.log.add_user(text)
    }

    pub fn set_system_prompt(&mut self, text: &str) {
        self.log.set_system_prompt(text);
    }

    pub fn set_prefill(&mut self, text: &str) {
        self.prefill.set(text);
    }

    pub fn has_pending_prefill(&self) -> bool {
        self.prefill.is_pending()
    }

    /// 直接写到输出（会话层用来补换行、打印提示）。
    pub fn write_output(&mut self, text: &str) {
        self.emit(text);
    }

    /// 执行一次生成，并把结果作为一条助手消息提交到日志。
    ///
    /// - 预填内容在本次调用中被消费，无论成败；
    /// - 成功时返回已提交的完整文本（含预填）；
    /// - 被取消时已输出的部分文本照样提交，返回 [`CompletionError::Cancelled`]；
    /// - 批量模式下失败或取消都不提交。
    pub async fn generate(
        &mut self,
        cancel: &CancellationToken,
        streaming: bool,
    ) -> Result<String, CompletionError> {
        let prefill = self.prefill.take_for_turn();
        let turn = cancel.child_token();
        let timer = self.completion_timeout.map(|timeout| {
            let turn = turn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                turn.cancel();
            })
        });

        let trace_id = new_trace_id();
        let started = Instant::now();
        self.events.record(SessionEvent::GenerationStart {
            ts: ts(),
            trace_id: trace_id.clone(),
            model: self.model.name().to_string(),
            streaming,
            prefill: prefill.is_some(),
            messages: self.log.len(),
        });

        let mut request = self.log.messages().to_vec();
        if let Some(prefill) = &prefill {
            request.push(Message::assistant(prefill.clone()));
        }

        let outcome = if streaming {
            self.generate_streaming(&turn, request, prefill).await
        } else {
            self.generate_batched(&turn, request, prefill).await
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        let _ = self.output.flush();

        let (committed_len, error) = match &outcome {
            Ok(text) => (text.len(), None),
            Err(error) => (0, Some(error.to_string())),
        };
        self.events.record(SessionEvent::GenerationEnd {
            ts: ts(),
            trace_id,
            ok: outcome.is_ok(),
            cancelled: outcome.as_ref().is_err_and(CompletionError::is_cancelled),
            committed_len,
            duration_ms: started.elapsed().as_millis(),
            error,
        });
        outcome
    }

    async fn generate_batched(
        &mut self,
        turn: &CancellationToken,
        request: Vec<Message>,
        prefill: Option<String>,
    ) -> Result<String, CompletionError> {
        let result = tokio::select! {
            biased;
            _ = turn.cancelled() => Err(RequestCancelled.into()),
            result = self.model.generate(turn, &request, &self.options) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(error) if turn.is_cancelled() || error.is::<RequestCancelled>() => {
                return Err(CompletionError::Cancelled);
            }
            Err(error) => return Err(CompletionError::Model(error)),
        };
        let Some(content) = response.first_content() else {
            return Err(CompletionError::EmptyResponse);
        };

        let mut text = prefill.unwrap_or_default();
        text.push_str(content);
        self.emit(&text);
        self.log.add_assistant(&text);
        Ok(text)
    }

    /// 流式生成。
    ///
    /// 输出与提交始终一致：预填内容随第一个分片一起写出，之后无论成功、取消还是模型出错，
    /// 都提交“预填 + 已交付分片”；第一个分片到达之前的任何失败既不输出也不提交。
    async fn generate_streaming(
        &mut self,
        turn: &CancellationToken,
        request: Vec<Message>,
        prefill: Option<String>,
    ) -> Result<String, CompletionError> {
        let prefill = prefill.unwrap_or_default();

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(1);
        let producer = tokio::spawn(produce(
            Arc::clone(&self.model),
            turn.clone(),
            request,
            self.options,
            tx,
        ));

        let mut consumed = Consumed::default();
        while let Some(chunk) = rx.recv().await {
            // 取消之后到达的分片不再输出，也不计入提交内容。
            if turn.is_cancelled() {
                continue;
            }
            self.deliver(&prefill, &mut consumed, &chunk.text);
            let _ = chunk.ack.send(());
        }

        let outcome = match producer.await {
            Ok(outcome) => outcome,
            Err(error) => Err(anyhow!(CompletionTaskFailed(error.to_string()))),
        };

        if turn.is_cancelled() {
            if consumed.chunks > 0 {
                self.commit(&prefill, &consumed.text);
            }
            return Err(CompletionError::Cancelled);
        }

        match outcome {
            Ok(response) => {
                // 没有走回调的后端：把完整回复当作一个分片。
                if consumed.chunks == 0
                    && let Some(content) = response.first_content()
                {
                    let content = content.to_string();
                    self.deliver(&prefill, &mut consumed, &content);
                }
                if consumed.chunks == 0 {
                    return Err(CompletionError::EmptyResponse);
                }
                Ok(self.commit(&prefill, &consumed.text))
            }
            Err(error) => {
                if consumed.chunks > 0 {
                    self.commit(&prefill, &consumed.text);
                }
                if error.is::<RequestCancelled>() {
                    return Err(CompletionError::Cancelled);
                }
                if let Some(failed) = error.downcast_ref::<CompletionTaskFailed>() {
                    return Err(CompletionError::Task(failed.0.clone()));
                }
                Err(CompletionError::Model(error))
            }
        }
    }

    /// 写出一个分片并计入累积内容；第一个分片之前先写出预填。
    fn deliver(&mut self, prefill: &str, consumed: &mut Consumed, text: &str) {
        if consumed.chunks == 0 && !prefill.is_empty() {
            self.emit(prefill);
        }
        self.emit(text);
        consumed.text.push_str(text);
        consumed.chunks += 1;
    }

    /// 提交 `prefill + text`；空白内容不提交。
    fn commit(&mut self, prefill: &str, text: &str) -> String {
        let mut committed = String::with_capacity(prefill.len() + text.len());
        committed.push_str(prefill);
        committed.push_str(text);
        self.log.add_assistant(&committed);
        committed
    }

    fn emit(&mut self, text: &str) {
        // 输出失败不影响提交。
        let _ = self.output.write_all(text.as_bytes());
        let _ = self.output.flush();
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct CompletionTaskFailed(String);

/// 生产者任务：驱动模型流式生成，把每个分片交给消费者并等待确认。
async fn produce(
    model: Arc<dyn Model>,
    turn: CancellationToken,
    request: Vec<Message>,
    options: GenerateOptions,
    tx: mpsc::Sender<StreamChunk>,
) -> anyhow::Result<ModelResponse> {
    let mut handoff = move |cancel: CancellationToken, text: String| -> BoxFuture<'static, anyhow::Result<()>> {
        let tx = tx.clone();
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(RequestCancelled.into());
            }
            let (ack, acked) = oneshot::channel();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RequestCancelled.into()),
                sent = tx.send(StreamChunk { text, ack }) => {
                    sent.map_err(|_| anyhow!("stream consumer went away"))?;
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestCancelled.into()),
                ack = acked => ack.map_err(|_| anyhow!(RequestCancelled)),
            }
        })
    };

    tokio::select! {
        biased;
        _ = turn.cancelled() => Err(RequestCancelled.into()),
        result = model.generate_streaming(&turn, &request, &options, &mut handoff) => result,
    }
}
