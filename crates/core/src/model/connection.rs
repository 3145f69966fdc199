use anyhow::{Result, anyhow, bail};
use futures::{
    StreamExt,
    future::{self, BoxFuture},
    stream::BoxStream,
};
use rig::{
    agent::{Agent, MultiTurnStreamItem, StreamingResult},
    client::CompletionClient,
    completion::{Chat, Message as RigMessage},
    streaming::{StreamedAssistantContent, StreamingChat},
    providers::{
        anthropic::{self, completion::CompletionModel as AnthropicCompletionModel},
        gemini::{self, CompletionModel as GeminiCompletionModel},
        openai::{
            self, completion::CompletionModel as OpenAICompletionModel,
            responses_api::ResponsesCompletionModel as OpenAIResponsesCompletionModel,
        },
    },
};
use tokio_util::sync::CancellationToken;

use super::{ChunkHandler, GenerateOptions, Model, ModelResponse, RequestCancelled};
use crate::message::{Message, Role};

/// 大模型提供商类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    /// OpenAI 的 Codex 系列模型，走 Chat Completions 接口并优先读取 `CODEX_API_KEY`。
    Codex,
    Claude,
    Gemini,
    OpenAIAPI,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "codex" => Some(Provider::Codex),
            "claude" | "anthropic" => Some(Provider::Claude),
            "gemini" => Some(Provider::Gemini),
            "openai-api" | "openai_api" | "openaiapi" => Some(Provider::OpenAIAPI),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Codex => "codex",
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::OpenAIAPI => "openai-api",
        }
    }

    /// 未配置 `model` 时使用的模型。
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAI | Provider::OpenAIAPI => "gpt-4o-mini",
            Provider::Codex => "gpt-5-codex",
            Provider::Claude => "claude-sonnet-4-5",
            Provider::Gemini => "gemini-2.5-flash",
        }
    }
}

/// 统一封装已构建的 Agent。
#[derive(Clone)]
pub enum BuiltClient {
    OpenAI(Agent<OpenAIResponsesCompletionModel>),
    Codex(Agent<OpenAICompletionModel>),
    Claude(Agent<AnthropicCompletionModel>),
    Gemini(Agent<GeminiCompletionModel>),
    OpenAIAPI(Agent<OpenAICompletionModel>),
}

impl BuiltClient {
    /// 发送带历史的对话请求，返回模型文本响应。
    pub async fn chat(&self, prompt: RigMessage, history: Vec<RigMessage>) -> Result<String> {
        match self {
            BuiltClient::OpenAI(client) => client
                .chat(prompt, history)
                .await
                .map_err(|error| anyhow!(error.to_string())),
            BuiltClient::Codex(client) => client
                .chat(prompt, history)
                .await
                .map_err(|error| anyhow!(error.to_string())),
            BuiltClient::Claude(client) => client
                .chat(prompt, history)
                .await
                .map_err(|error| anyhow!(error.to_string())),
            BuiltClient::Gemini(client) => client
                .chat(prompt, history)
                .await
                .map_err(|error| anyhow!(error.to_string())),
            BuiltClient::OpenAIAPI(client) => client
                .chat(prompt, history)
                .await
                .map_err(|error| anyhow!(error.to_string())),
        }
    }

    /// 以流式方式发送对话请求，返回统一的文本增量流。
    pub async fn stream_chat(&self, prompt: RigMessage, history: Vec<RigMessage>) -> TextDeltas {
        match self {
            BuiltClient::OpenAI(client) => text_deltas(client.stream_chat(prompt, history).await),
            BuiltClient::Codex(client) => text_deltas(client.stream_chat(prompt, history).await),
            BuiltClient::Claude(client) => text_deltas(client.stream_chat(prompt, history).await),
            BuiltClient::Gemini(client) => text_deltas(client.stream_chat(prompt, history).await),
            BuiltClient::OpenAIAPI(client) => {
                text_deltas(client.stream_chat(prompt, history).await)
            }
        }
    }
}

/// 流式响应中与纯文本对话有关的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// 一段增量文本。
    Text(String),
    /// 流结束时 rig 汇总的完整回复。
    Final(String),
}

pub type TextDeltas = BoxStream<'static, Result<StreamDelta>>;

/// 把各 provider 的流统一成文本增量；工具调用、推理内容等一律忽略。
fn text_deltas<R: 'static>(stream: StreamingResult<R>) -> TextDeltas {
    stream
        .filter_map(|item| {
            future::ready(match item {
                Ok(MultiTurnStreamItem::StreamAssistantItem(StreamedAssistantContent::Text(
                    text,
                ))) => Some(Ok(StreamDelta::Text(text.text))),
                Ok(MultiTurnStreamItem::FinalResponse(done)) => {
                    Some(Ok(StreamDelta::Final(done.response().to_string())))
                }
                Ok(_) => None,
                Err(error) => Some(Err(anyhow!(error.to_string()))),
            })
        })
        .boxed()
}

macro_rules! build_agent {
    ($client:expr, $model:expr, $preamble:expr, $options:expr) => {
        $client
            .agent($model)
            .preamble($preamble)
            .temperature($options.temperature)
            .max_tokens(u64::from($options.max_tokens))
            .build()
    };
}

/// 连接配置：保存 provider、地址、密钥和模型选择。
#[derive(Clone)]
pub struct Connection {
    provider: Provider,
    api_url: String,
    api_key: String,
    agent_select: String,
}

impl Connection {
    pub fn new(provider: Provider, api_url: String, api_key: String, agent_select: String) -> Self {
        Self {
            provider,
            api_url,
            api_key,
            agent_select,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn agent_select(&self) -> &str {
        &self.agent_select
    }

    /// 解析可用 API Key：优先使用连接配置，其次按顺序读取环境变量。
    fn resolve_api_key(&self, env_vars: &[&str]) -> Result<String> {
        if !self.api_key.trim().is_empty() {
            return Ok(self.api_key.trim().to_string());
        }

        for env_var in env_vars {
            if let Ok(value) = std::env::var(env_var)
                && !value.trim().is_empty()
            {
                return Ok(value.trim().to_string());
            }
        }

        Err(anyhow!(
            "API key is not configured. Set `api_key` in the config file or export {}",
            env_vars.join(" or ")
        ))
    }

    /// 去除尾部斜杠，避免路径拼接出现 `//`。
    fn normalized_api_url(&self) -> Option<String> {
        let trimmed = self.api_url.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.trim_end_matches('/').to_string())
        }
    }

    /// 按本轮的系统提示和生成参数构建客户端。
    pub fn builder(&self, preamble: &str, options: &GenerateOptions) -> Result<BuiltClient> {
        let custom_base_url = self.normalized_api_url();
        let model = self.agent_select.as_str();

        match self.provider {
            Provider::OpenAI => {
                let api_key = self.resolve_api_key(&["OPENAI_API_KEY"])?;
                let mut builder = openai::Client::builder().api_key(api_key);
                if let Some(base_url) = custom_base_url.as_ref() {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build()?;
                Ok(BuiltClient::OpenAI(build_agent!(
                    client, model, preamble, options
                )))
            }
            Provider::Codex => {
                let api_key = self.resolve_api_key(&["CODEX_API_KEY", "OPENAI_API_KEY"])?;
                let mut builder = openai::CompletionsClient::builder().api_key(api_key);
                if let Some(base_url) = custom_base_url.as_ref() {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build()?;
                Ok(BuiltClient::Codex(build_agent!(
                    client, model, preamble, options
                )))
            }
            Provider::Claude => {
                let api_key = self.resolve_api_key(&["ANTHROPIC_API_KEY"])?;
                let mut builder = anthropic::Client::builder().api_key(api_key);
                if let Some(base_url) = custom_base_url.as_ref() {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build()?;
                Ok(BuiltClient::Claude(build_agent!(
                    client, model, preamble, options
                )))
            }
            Provider::Gemini => {
                let api_key = self.resolve_api_key(&["GEMINI_API_KEY"])?;
                let mut builder = gemini::Client::builder().api_key(api_key);
                if let Some(base_url) = custom_base_url.as_ref() {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build()?;
                Ok(BuiltClient::Gemini(build_agent!(
                    client, model, preamble, options
                )))
            }
            Provider::OpenAIAPI => {
                let api_key = self.resolve_api_key(&["OPENAI_API_KEY"])?;
                let mut builder = openai::CompletionsClient::builder().api_key(api_key);
                if let Some(base_url) = custom_base_url.as_ref() {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build()?;
                Ok(BuiltClient::OpenAIAPI(build_agent!(
                    client, model, preamble, options
                )))
            }
        }
    }
}

/// 会话消息在 rig 请求中的拆分结果。
#[derive(Debug)]
struct RigRequest {
    preamble: String,
    history: Vec<RigMessage>,
    prompt: RigMessage,
}

/// System 消息拼成 preamble，最后一条消息作为 prompt，其余作为历史。
fn split_request(messages: &[Message]) -> Result<RigRequest> {
    let mut preamble = Vec::new();
    let mut turns = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => preamble.push(message.content()),
            Role::User => turns.push(RigMessage::user(message.content())),
            Role::Assistant => turns.push(RigMessage::assistant(message.content())),
        }
    }

    let Some(prompt) = turns.pop() else {
        bail!("conversation has no user or assistant messages");
    };
    Ok(RigRequest {
        preamble: preamble.join("\n\n"),
        history: turns,
        prompt,
    })
}

/// 基于 rig 的模型后端。
///
/// 每次请求按当轮消息重建 Agent，不跨请求缓存客户端。
/// 流式调用走 rig 的 `StreamingChat`，每个文本增量都作为一个分片交付。
#[derive(Clone)]
pub struct RigModel {
    connection: Connection,
    name: String,
}

impl RigModel {
    pub fn new(connection: Connection) -> Self {
        let name = format!(
            "{}/{}",
            connection.provider().as_str(),
            connection.agent_select()
        );
        Self { connection, name }
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<String> {
        let request = split_request(messages)?;
        let client = self.connection.builder(&request.preamble, options)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestCancelled.into()),
            reply = client.chat(request.prompt, request.history) => reply,
        }
    }
}

impl Model for RigModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
        options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ModelResponse>> {
        Box::pin(async move {
            let text = self.complete(cancel, messages, options).await?;
            Ok(ModelResponse::single(text))
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
            let request = split_request(messages)?;
            let client = self.connection.builder(&request.preamble, options)?;
            let deltas = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RequestCancelled.into()),
                deltas = client.stream_chat(request.prompt, request.history) => deltas,
            };
            let text = forward_deltas(cancel, deltas, on_chunk).await?;
            Ok(ModelResponse::single(text))
        })
    }
}

/// 逐个转发文本增量，每个增量之间检查取消。返回完整回复。
///
/// 没有任何增量时退回流末尾的汇总文本。
async fn forward_deltas(
    cancel: &CancellationToken,
    mut deltas: TextDeltas,
    on_chunk: &mut ChunkHandler<'_>,
) -> Result<String> {
    let mut text = String::new();
    let mut summary = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RequestCancelled.into()),
            next = deltas.next() => next,
        };
        match next {
            None => break,
            Some(Ok(StreamDelta::Text(delta))) => {
                if delta.is_empty() {
                    continue;
                }
                text.push_str(&delta);
                on_chunk(cancel.clone(), delta).await?;
            }
            Some(Ok(StreamDelta::Final(full))) => summary = Some(full),
            Some(Err(error)) => return Err(error),
        }
    }
    if text.is_empty()
        && let Some(full) = summary
    {
        text = full;
    }
    Ok(text)
}
